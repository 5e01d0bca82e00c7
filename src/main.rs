//! Command-line entrypoint: ingest a file through the pipeline or preview its embedding sample.
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use docingest::{
    config, logging,
    parser::LocalFileParser,
    processing::{
        ColumnarComposer, DEFAULT_PREVIEW_COLUMNS, DEFAULT_PREVIEW_ROWS, InMemoryRegistry,
        IngestionRequest, PipelineOrchestrator, Sanitizer, sampling,
    },
};
use serde_json::{Map, Value};

#[derive(Parser)]
#[command(
    name = "docingest",
    about = "Parse, sanitize, and convert uploaded files into columnar artifacts"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the full pipeline for one file and print the outcome as JSON.
    Ingest {
        /// File identifier, resolved against the data directory.
        file_id: String,
        #[arg(long)]
        user: String,
        #[arg(long)]
        session: Option<String>,
        /// Companion file (schema, layout) forwarded to the parser.
        #[arg(long)]
        aux: Option<String>,
        /// Parser option as `key=value`; values are read as JSON when they parse.
        #[arg(long = "option", value_parser = parse_option)]
        options: Vec<(String, Value)>,
    },
    /// Print the rows that would be forwarded to the embedder.
    Sample {
        file_id: String,
        #[arg(long, allow_negative_numbers = true)]
        stride: Option<i64>,
    },
    /// Print the leading rows and columns of a stored artifact.
    Preview {
        /// Artifact identifier returned by `ingest`.
        artifact_id: String,
        #[arg(long, default_value_t = DEFAULT_PREVIEW_ROWS)]
        rows: usize,
        #[arg(long, default_value_t = DEFAULT_PREVIEW_COLUMNS)]
        columns: usize,
    },
    /// List stored artifacts of a user.
    List {
        #[arg(long)]
        user: String,
        /// Only artifacts converted from this source file.
        #[arg(long)]
        file: Option<String>,
    },
}

#[tokio::main]
async fn main() {
    match run().await {
        Ok(true) => {}
        Ok(false) => std::process::exit(1),
        Err(err) => {
            eprintln!("error: {err:#}");
            std::process::exit(1);
        }
    }
}

async fn run() -> Result<bool> {
    let cli = Cli::parse();
    let config = config::init_config().context("invalid configuration")?;
    logging::init_tracing();

    match cli.command {
        Command::Ingest {
            file_id,
            user,
            session,
            aux,
            options,
        } => {
            let mut request = IngestionRequest::new(file_id, user);
            if let Some(session) = session {
                request = request.with_session(session);
            }
            if let Some(aux) = aux {
                request = request.with_auxiliary_file(aux);
            }
            for (key, value) in options {
                request = request.with_option(key, value);
            }

            let orchestrator = orchestrator(config)?;
            let outcome = orchestrator.ingest(&request).await;
            print_json(&outcome.to_json())?;
            Ok(outcome.success())
        }
        Command::Sample { file_id, stride } => {
            let stride = stride.unwrap_or(config.sample_stride as i64);
            let parser = LocalFileParser::new(config.data_dir.clone());
            let result = parser
                .try_parse(&file_id, &Map::new())
                .await
                .with_context(|| format!("failed to parse {file_id}"))?;
            let composer = ColumnarComposer::new(
                config.compression,
                Sanitizer::new(config.sanitize_max_depth),
            );
            let (rows, _) = composer.flatten_rows(&result);
            let sample = sampling::sample(&rows, stride)?;
            print_json(&serde_json::to_value(&sample)?)?;
            Ok(true)
        }
        Command::Preview {
            artifact_id,
            rows,
            columns,
        } => {
            let preview = orchestrator(config)?
                .preview_parsed_file(&artifact_id, rows, columns)
                .await
                .with_context(|| format!("failed to preview {artifact_id}"))?;
            print_json(&serde_json::to_value(&preview)?)?;
            Ok(true)
        }
        Command::List { user, file } => {
            let records = orchestrator(config)?
                .list_parsed_files(&user, file.as_deref())
                .await
                .context("failed to list parsed files")?;
            let count = records.len();
            print_json(&serde_json::json!({ "parsed_files": records, "count": count }))?;
            Ok(true)
        }
    }
}

fn orchestrator(config: &config::Config) -> Result<PipelineOrchestrator> {
    PipelineOrchestrator::from_config(config, Arc::new(InMemoryRegistry::new()))
        .context("failed to build pipeline")
}

fn parse_option(raw: &str) -> Result<(String, Value)> {
    let Some((key, value)) = raw.split_once('=') else {
        bail!("expected key=value, got '{raw}'");
    };
    let value = serde_json::from_str(value).unwrap_or_else(|_| Value::String(value.to_string()));
    Ok((key.trim().to_string(), value))
}

fn print_json(value: &Value) -> Result<()> {
    let text = serde_json::to_string_pretty(value).context("failed to encode output")?;
    println!("{text}");
    Ok(())
}
