use std::env;
use std::path::PathBuf;
use std::sync::OnceLock;
use thiserror::Error;

/// Errors encountered while loading configuration from environment variables.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Environment variable contained a value that could not be parsed.
    #[error("Invalid value for environment variable: {0}")]
    InvalidValue(String),
}

/// Runtime configuration for the ingestion pipeline.
#[derive(Debug, Clone)]
pub struct Config {
    /// Directory the local parser resolves file identifiers against.
    pub data_dir: PathBuf,
    /// Directory the filesystem store writes columnar artifacts into.
    pub artifact_dir: PathBuf,
    /// Dimensionality of vectors produced by the default embedder.
    pub embedding_dimension: usize,
    /// Stride used when sampling rows for embedding (every Nth row).
    pub sample_stride: usize,
    /// Block compression applied to columnar artifacts.
    pub compression: ColumnarCompression,
    /// Maximum nesting depth the sanitizer descends before truncating.
    pub sanitize_max_depth: usize,
}

/// Block compression codecs supported by the columnar composer.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ColumnarCompression {
    /// Snappy block compression.
    #[default]
    Snappy,
    /// Uncompressed pages.
    None,
}

impl ColumnarCompression {
    /// Whether pages are block-compressed.
    pub fn is_compressed(self) -> bool {
        matches!(self, Self::Snappy)
    }
}

/// Default every-Nth-row stride used for representative embeddings.
pub const DEFAULT_SAMPLE_STRIDE: usize = 10;
/// Default sanitizer depth bound.
pub const DEFAULT_SANITIZE_MAX_DEPTH: usize = 64;
const DEFAULT_EMBEDDING_DIMENSION: usize = 384;

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("data"),
            artifact_dir: PathBuf::from("artifacts"),
            embedding_dimension: DEFAULT_EMBEDDING_DIMENSION,
            sample_stride: DEFAULT_SAMPLE_STRIDE,
            compression: ColumnarCompression::default(),
            sanitize_max_depth: DEFAULT_SANITIZE_MAX_DEPTH,
        }
    }
}

impl Config {
    /// Load configuration from environment variables, performing validation along the way.
    ///
    /// Every variable is optional; absent values fall back to [`Config::default`].
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();
        Ok(Self {
            data_dir: load_env_optional("INGEST_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.data_dir),
            artifact_dir: load_env_optional("INGEST_ARTIFACT_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.artifact_dir),
            embedding_dimension: load_env_optional("EMBEDDING_DIMENSION")
                .map(|value| parse_positive(&value, "EMBEDDING_DIMENSION"))
                .transpose()?
                .unwrap_or(defaults.embedding_dimension),
            sample_stride: load_env_optional("EMBEDDING_SAMPLE_STRIDE")
                .map(|value| parse_positive(&value, "EMBEDDING_SAMPLE_STRIDE"))
                .transpose()?
                .unwrap_or(defaults.sample_stride),
            compression: load_env_optional("COLUMNAR_COMPRESSION")
                .map(|value| {
                    value
                        .parse()
                        .map_err(|()| ConfigError::InvalidValue("COLUMNAR_COMPRESSION".into()))
                })
                .transpose()?
                .unwrap_or(defaults.compression),
            sanitize_max_depth: load_env_optional("SANITIZE_MAX_DEPTH")
                .map(|value| parse_positive(&value, "SANITIZE_MAX_DEPTH"))
                .transpose()?
                .unwrap_or(defaults.sanitize_max_depth),
        })
    }
}

fn load_env_optional(key: &str) -> Option<String> {
    env::var(key).ok().filter(|value| !value.trim().is_empty())
}

/// Parse a strictly positive integer. Zero and negative values are rejected rather than
/// silently replaced by a default.
fn parse_positive(value: &str, key: &str) -> Result<usize, ConfigError> {
    let parsed: i64 = value
        .trim()
        .parse()
        .map_err(|_| ConfigError::InvalidValue(key.to_string()))?;
    if parsed <= 0 {
        return Err(ConfigError::InvalidValue(key.to_string()));
    }
    usize::try_from(parsed).map_err(|_| ConfigError::InvalidValue(key.to_string()))
}

impl std::str::FromStr for ColumnarCompression {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "snappy" => Ok(Self::Snappy),
            "none" | "uncompressed" => Ok(Self::None),
            _ => Err(()),
        }
    }
}

/// Global configuration cache populated during process start.
pub static CONFIG: OnceLock<Config> = OnceLock::new();

/// Retrieve the loaded configuration.
///
/// When [`init_config`] has not run, the environment is read lazily; an invalid environment is
/// logged and replaced by defaults so library callers never observe a panic.
pub fn get_config() -> &'static Config {
    CONFIG.get_or_init(|| {
        Config::from_env().unwrap_or_else(|error| {
            tracing::warn!(error = %error, "Invalid configuration; using defaults");
            Config::default()
        })
    })
}

/// Load configuration from the environment and install it in the global cache.
///
/// Returns the already-installed configuration when called more than once.
pub fn init_config() -> Result<&'static Config, ConfigError> {
    dotenvy::dotenv().ok();
    if let Some(existing) = CONFIG.get() {
        return Ok(existing);
    }
    let config = Config::from_env()?;
    tracing::debug!(
        data_dir = %config.data_dir.display(),
        artifact_dir = %config.artifact_dir.display(),
        sample_stride = config.sample_stride,
        compression = ?config.compression,
        "Loaded configuration"
    );
    Ok(CONFIG.get_or_init(|| config))
}
