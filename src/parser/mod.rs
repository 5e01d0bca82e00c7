//! Parser collaborator: the trait the pipeline consumes and a local filesystem default.
//!
//! [`LocalFileParser`] resolves a file identifier against a data directory and dispatches on
//! the extension:
//!
//! - `.csv` → structured records (typed cells, ragged rows tolerated),
//! - `.json` → structured records (array) or a single data block (object),
//! - `.jsonl` / `.ndjson` → structured records, one per non-empty line,
//! - `.txt` / `.md` → unstructured text with paragraph and line counts.
//!
//! Failures are reported in-band through [`ParseResult::failure`]; `parse` never errors.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde_json::{Map, Value};
use thiserror::Error;
use time::OffsetDateTime;

use crate::processing::types::{ContentKind, ParseResult};
use crate::processing::value::{Object, RawValue, Scalar};

/// Interface implemented by parser collaborators.
#[async_trait]
pub trait FileParser: Send + Sync {
    /// Parse the file identified by `file_id`. Failure is reported in the result, not as an error.
    async fn parse(&self, file_id: &str, options: &Map<String, Value>) -> ParseResult;
}

/// Errors raised while parsing a local file. Converted to in-band failures at the trait boundary.
#[derive(Debug, Error)]
pub enum ParserError {
    /// File identifier was empty or tried to escape the data directory.
    #[error("invalid file id '{0}'")]
    InvalidFileId(String),
    /// File has no extension or an unsupported one.
    #[error("unsupported file type '{0}'")]
    UnsupportedFormat(String),
    /// Data directory is missing.
    #[error("data directory {0} does not exist")]
    DataDirMissing(PathBuf),
    /// Reading the file failed.
    #[error("failed to read {path}: {source}")]
    Io {
        /// File that could not be read.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },
    /// Delimited text was malformed.
    #[error("malformed CSV: {0}")]
    Csv(#[from] csv::Error),
    /// JSON text was malformed.
    #[error("malformed JSON: {0}")]
    Json(#[from] serde_json::Error),
    /// JSON document was valid but not an array or object.
    #[error("JSON document must be an array or an object")]
    UnsupportedJsonShape,
    /// The `delimiter` option was not a single ASCII character.
    #[error("delimiter option must be a single ASCII character")]
    InvalidDelimiter,
}

/// Parser reading files from a local data directory.
#[derive(Debug, Clone)]
pub struct LocalFileParser {
    data_dir: PathBuf,
}

impl LocalFileParser {
    /// Create a parser rooted at `data_dir`.
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
        }
    }

    /// Confirm the data directory exists.
    pub async fn initialize(&self) -> Result<(), ParserError> {
        match tokio::fs::metadata(&self.data_dir).await {
            Ok(metadata) if metadata.is_dir() => Ok(()),
            _ => Err(ParserError::DataDirMissing(self.data_dir.clone())),
        }
    }

    /// Directory file identifiers resolve against.
    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    /// Resolve an identifier to a path inside the data directory.
    pub fn resolve_path(&self, file_id: &str) -> Result<PathBuf, ParserError> {
        let escapes = file_id.is_empty()
            || file_id.contains('/')
            || file_id.contains('\\')
            || file_id.contains("..")
            || Path::new(file_id).is_absolute();
        if escapes {
            return Err(ParserError::InvalidFileId(file_id.to_string()));
        }
        Ok(self.data_dir.join(file_id))
    }

    /// Parse a file, surfacing errors instead of folding them into the result.
    pub async fn try_parse(
        &self,
        file_id: &str,
        options: &Map<String, Value>,
    ) -> Result<ParseResult, ParserError> {
        let path = self.resolve_path(file_id)?;
        let file_type = path
            .extension()
            .and_then(|ext| ext.to_str())
            .map(str::to_lowercase)
            .ok_or_else(|| ParserError::UnsupportedFormat(file_id.to_string()))?;
        let text = tokio::fs::read_to_string(&path)
            .await
            .map_err(|source| ParserError::Io {
                path: path.clone(),
                source,
            })?;

        tracing::debug!(file_id, file_type = %file_type, bytes = text.len(), "Parsing file");
        let result = match file_type.as_str() {
            "csv" => parse_csv(&text, delimiter(options)?)?,
            "json" => parse_json(&text)?,
            "jsonl" | "ndjson" => parse_json_lines(&text)?,
            "txt" | "md" => parse_text(&text),
            other => return Err(ParserError::UnsupportedFormat(other.to_string())),
        };

        let metadata = result.metadata.clone();
        metadata.insert("file_id", RawValue::from(file_id));
        metadata.insert("file_type", RawValue::from(file_type.as_str()));
        metadata.insert("source_bytes", RawValue::from(text.len()));
        metadata.insert("parsed_at", RawValue::Timestamp(OffsetDateTime::now_utc()));
        if let Some(auxiliary) = options.get("auxiliary_file_id") {
            metadata.insert("auxiliary_file_id", RawValue::from(auxiliary.clone()));
        }
        metadata.insert("options", RawValue::from(Value::Object(options.clone())));
        Ok(result.with_file_type(file_type))
    }
}

#[async_trait]
impl FileParser for LocalFileParser {
    async fn parse(&self, file_id: &str, options: &Map<String, Value>) -> ParseResult {
        match self.try_parse(file_id, options).await {
            Ok(result) => result,
            Err(error) => {
                tracing::warn!(file_id, error = %error, "Parse failed");
                ParseResult::failure(error.to_string())
            }
        }
    }
}

fn delimiter(options: &Map<String, Value>) -> Result<u8, ParserError> {
    match options.get("delimiter").and_then(Value::as_str) {
        None => Ok(b','),
        Some(text) if text.len() == 1 && text.is_ascii() => Ok(text.as_bytes()[0]),
        Some(_) => Err(ParserError::InvalidDelimiter),
    }
}

fn parse_csv(text: &str, delimiter: u8) -> Result<ParseResult, ParserError> {
    let mut reader = csv::ReaderBuilder::new()
        .flexible(true)
        .delimiter(delimiter)
        .from_reader(text.as_bytes());
    let mut headers: Vec<String> = reader.headers()?.iter().map(str::to_string).collect();

    let mut records = Vec::new();
    for record in reader.records() {
        let record = record?;
        // Ragged rows get synthetic names for trailing cells.
        while headers.len() < record.len() {
            headers.push(format!("column_{}", headers.len()));
        }
        let row = RawValue::map(
            headers
                .iter()
                .zip(record.iter())
                .map(|(name, cell)| (name.as_str(), typed_cell(cell))),
        );
        records.push(row);
    }

    let columns = observe_columns(&headers, &records);
    let metadata = RawValue::map(vec![
        ("columns", columns),
        ("row_count", RawValue::foreign(Scalar::Int64(records.len() as i64))),
    ]);
    let structure = RawValue::map(vec![
        ("format", RawValue::from("delimited")),
        ("delimiter", RawValue::from(char::from(delimiter).to_string())),
        ("column_count", RawValue::from(headers.len())),
    ]);
    Ok(ParseResult::success(ContentKind::Structured)
        .with_metadata(metadata)
        .with_structure(structure)
        .with_records(records))
}

fn typed_cell(cell: &str) -> RawValue {
    let trimmed = cell.trim();
    if trimmed.is_empty() {
        return RawValue::Null;
    }
    if let Ok(int) = trimmed.parse::<i64>() {
        return RawValue::Int(int);
    }
    if let Some(float) = trimmed.parse::<f64>().ok().filter(|value| value.is_finite()) {
        return RawValue::Float(float);
    }
    match trimmed.to_ascii_lowercase().as_str() {
        "true" => RawValue::Bool(true),
        "false" => RawValue::Bool(false),
        _ => RawValue::Str(cell.to_string()),
    }
}

fn parse_json(text: &str) -> Result<ParseResult, ParserError> {
    let document: Value = serde_json::from_str(text)?;
    match document {
        Value::Array(items) => Ok(json_records(items, "array")),
        Value::Object(object) => {
            let headers: Vec<String> = object.keys().cloned().collect();
            let data = RawValue::from(Value::Object(object));
            let metadata = RawValue::map(vec![
                ("columns", observe_columns(&headers, std::slice::from_ref(&data))),
                ("row_count", RawValue::foreign(Scalar::Int64(1))),
            ]);
            let structure = RawValue::map(vec![("format", RawValue::from("json_object"))]);
            Ok(ParseResult::success(ContentKind::Structured)
                .with_metadata(metadata)
                .with_structure(structure)
                .with_data(data))
        }
        _ => Err(ParserError::UnsupportedJsonShape),
    }
}

fn parse_json_lines(text: &str) -> Result<ParseResult, ParserError> {
    let items = text
        .lines()
        .filter(|line| !line.trim().is_empty())
        .map(serde_json::from_str::<Value>)
        .collect::<Result<Vec<_>, _>>()?;
    Ok(json_records(items, "json_lines"))
}

fn json_records(items: Vec<Value>, format: &str) -> ParseResult {
    let mut headers: Vec<String> = Vec::new();
    for item in &items {
        if let Value::Object(object) = item {
            for key in object.keys() {
                if !headers.contains(key) {
                    headers.push(key.clone());
                }
            }
        }
    }
    let records: Vec<RawValue> = items.into_iter().map(RawValue::from).collect();
    let metadata = RawValue::map(vec![
        ("columns", observe_columns(&headers, &records)),
        ("row_count", RawValue::foreign(Scalar::Int64(records.len() as i64))),
    ]);
    let structure = RawValue::map(vec![("format", RawValue::from(format))]);
    ParseResult::success(ContentKind::Structured)
        .with_metadata(metadata)
        .with_structure(structure)
        .with_records(records)
}

fn parse_text(text: &str) -> ParseResult {
    let paragraphs = text
        .split("\n\n")
        .filter(|paragraph| !paragraph.trim().is_empty())
        .count();
    let structure = RawValue::map(vec![
        ("format", RawValue::from("text")),
        ("paragraphs", RawValue::from(paragraphs)),
        ("lines", RawValue::from(text.lines().count())),
        ("characters", RawValue::from(text.chars().count())),
    ]);
    ParseResult::success(ContentKind::Unstructured)
        .with_structure(structure)
        .with_data(RawValue::map(vec![("text", RawValue::from(text))]))
}

/// Column descriptors (name, position, observed type) exposed as attribute bags.
fn observe_columns(headers: &[String], rows: &[RawValue]) -> RawValue {
    let observed: Vec<&'static str> = headers
        .iter()
        .map(|header| {
            rows.iter()
                .filter_map(|row| cell(row, header).and_then(|value| observed_type(&value)))
                .reduce(merge_observed)
                .unwrap_or("null")
        })
        .collect();
    RawValue::list(headers.iter().zip(observed).enumerate().map(
        |(position, (name, observed))| {
            RawValue::foreign(
                Object::new("ColumnDescriptor")
                    .with_field("name", name.as_str())
                    .with_field("position", RawValue::foreign(Scalar::UInt32(position as u32)))
                    .with_field("type", observed),
            )
        },
    ))
}

fn cell(row: &RawValue, header: &str) -> Option<RawValue> {
    let RawValue::Map(map) = row else {
        return None;
    };
    let entries = map.read().unwrap_or_else(std::sync::PoisonError::into_inner);
    entries
        .iter()
        .find(|(key, _)| matches!(key, RawValue::Str(name) if name == header))
        .map(|(_, value)| value.clone())
}

fn observed_type(value: &RawValue) -> Option<&'static str> {
    match value {
        RawValue::Null => None,
        RawValue::Bool(_) => Some("boolean"),
        RawValue::Int(_) | RawValue::UInt(_) => Some("integer"),
        RawValue::Float(_) => Some("float"),
        RawValue::List(_) => Some("array"),
        RawValue::Map(_) => Some("object"),
        _ => Some("string"),
    }
}

fn merge_observed(a: &'static str, b: &'static str) -> &'static str {
    match (a, b) {
        (a, b) if a == b => a,
        ("integer", "float") | ("float", "integer") => "float",
        _ => "string",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::processing::sanitize::sanitize;
    use serde_json::json;

    async fn fixture_dir(files: &[(&str, &str)]) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("docingest-parser-{}", uuid::Uuid::new_v4()));
        tokio::fs::create_dir_all(&dir).await.unwrap();
        for (name, contents) in files {
            tokio::fs::write(dir.join(name), contents).await.unwrap();
        }
        dir
    }

    #[tokio::test]
    async fn csv_cells_are_typed() {
        let dir = fixture_dir(&[(
            "people.csv",
            "name,age,score,active\nada,36,9.5,true\nbob,,7,false,extra\n",
        )])
        .await;
        let parser = LocalFileParser::new(dir.clone());
        let result = parser.parse("people.csv", &Map::new()).await;

        assert!(result.success);
        assert_eq!(result.content_kind, ContentKind::Structured);
        assert_eq!(result.file_type.as_deref(), Some("csv"));
        assert_eq!(result.record_count(), 2);
        assert_eq!(
            sanitize(&result.records[1]),
            json!({ "name": "bob", "age": null, "score": 7, "active": false, "column_4": "extra" })
        );

        let metadata = sanitize(&result.metadata);
        assert_eq!(metadata["row_count"], json!(2));
        assert_eq!(
            metadata["columns"][2],
            json!({ "name": "score", "position": 2, "type": "float" })
        );
        tokio::fs::remove_dir_all(dir).await.ok();
    }

    #[tokio::test]
    async fn custom_delimiter_is_honoured() {
        let dir = fixture_dir(&[("semi.csv", "a;b\n1;2\n")]).await;
        let parser = LocalFileParser::new(dir.clone());
        let mut options = Map::new();
        options.insert("delimiter".into(), json!(";"));
        let result = parser.parse("semi.csv", &options).await;
        assert_eq!(sanitize(&result.records[0]), json!({ "a": 1, "b": 2 }));
        assert_eq!(sanitize(&result.metadata)["options"]["delimiter"], json!(";"));
        tokio::fs::remove_dir_all(dir).await.ok();
    }

    #[tokio::test]
    async fn json_documents_become_records_or_data() {
        let dir = fixture_dir(&[
            ("rows.json", r#"[{"id": 1}, {"id": 2, "tag": "x"}]"#),
            ("single.json", r#"{"id": 1, "nested": {"k": true}}"#),
            ("events.jsonl", "{\"e\": 1}\n\n{\"e\": 2}\n"),
        ])
        .await;
        let parser = LocalFileParser::new(dir.clone());

        let rows = parser.parse("rows.json", &Map::new()).await;
        assert_eq!(rows.record_count(), 2);

        let single = parser.parse("single.json", &Map::new()).await;
        assert_eq!(single.record_count(), 0);
        assert_eq!(single.row_count(), 1);

        let events = parser.parse("events.jsonl", &Map::new()).await;
        assert_eq!(events.record_count(), 2);
        tokio::fs::remove_dir_all(dir).await.ok();
    }

    #[tokio::test]
    async fn text_is_unstructured() {
        let dir = fixture_dir(&[("notes.md", "# Title\n\nFirst paragraph.\n\nSecond.\n")]).await;
        let result = LocalFileParser::new(dir.clone()).parse("notes.md", &Map::new()).await;
        assert!(result.success);
        assert_eq!(result.content_kind, ContentKind::Unstructured);
        assert_eq!(sanitize(&result.structure)["paragraphs"], json!(3));
        tokio::fs::remove_dir_all(dir).await.ok();
    }

    #[tokio::test]
    async fn failures_are_reported_in_band() {
        let dir = fixture_dir(&[("image.bin", "\u{0}"), ("bad.json", "{")]).await;
        let parser = LocalFileParser::new(dir.clone());

        for file_id in [
            "../etc/passwd",
            "nested/file.csv",
            "",
            "image.bin",
            "bad.json",
            "missing.csv",
        ] {
            let result = parser.parse(file_id, &Map::new()).await;
            assert!(!result.success, "{file_id} should fail");
            assert!(result.error.is_some());
        }
        tokio::fs::remove_dir_all(dir).await.ok();
    }

    #[tokio::test]
    async fn initialize_requires_data_dir() {
        let missing =
            std::env::temp_dir().join(format!("docingest-missing-{}", uuid::Uuid::new_v4()));
        assert!(matches!(
            LocalFileParser::new(missing).initialize().await,
            Err(ParserError::DataDirMissing(_))
        ));
    }
}
