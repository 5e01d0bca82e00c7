//! Core data types and error definitions for the ingestion pipeline.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;
use time::OffsetDateTime;

use crate::storage::StoreError;

use super::columnar::{ArtifactPreview, ColumnarComposer, ComposeError};
use super::value::RawValue;

/// Request to ingest one uploaded file. Immutable once built.
#[derive(Debug, Clone)]
pub struct IngestionRequest {
    file_id: String,
    user_id: String,
    session_id: Option<String>,
    auxiliary_file_id: Option<String>,
    options: Map<String, Value>,
}

impl IngestionRequest {
    /// Start a request for `file_id` owned by `user_id`.
    pub fn new(file_id: impl Into<String>, user_id: impl Into<String>) -> Self {
        Self {
            file_id: file_id.into(),
            user_id: user_id.into(),
            session_id: None,
            auxiliary_file_id: None,
            options: Map::new(),
        }
    }

    /// Attach the owning session.
    pub fn with_session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    /// Attach a companion file (schema, layout, copybook) that the parser should consult.
    pub fn with_auxiliary_file(mut self, file_id: impl Into<String>) -> Self {
        self.auxiliary_file_id = Some(file_id.into());
        self
    }

    /// Add a free-form processing option.
    pub fn with_option(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.options.insert(key.into(), value.into());
        self
    }

    /// Identifier of the file to ingest.
    pub fn file_id(&self) -> &str {
        &self.file_id
    }

    /// Owning user.
    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    /// Owning session, if any.
    pub fn session_id(&self) -> Option<&str> {
        self.session_id.as_deref()
    }

    /// Companion file, if any.
    pub fn auxiliary_file_id(&self) -> Option<&str> {
        self.auxiliary_file_id.as_deref()
    }

    /// Free-form options as supplied by the caller.
    pub fn options(&self) -> &Map<String, Value> {
        &self.options
    }

    /// Options forwarded to the parser: caller options plus request identity.
    ///
    /// Identity keys win over caller options of the same name.
    pub fn parse_options(&self) -> Map<String, Value> {
        let mut merged = self.options.clone();
        merged.insert("user_id".into(), Value::String(self.user_id.clone()));
        if let Some(session) = &self.session_id {
            merged.insert("session_id".into(), Value::String(session.clone()));
        }
        if let Some(auxiliary) = &self.auxiliary_file_id {
            merged.insert("auxiliary_file_id".into(), Value::String(auxiliary.clone()));
        }
        merged
    }
}

/// Parser classification of file content.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContentKind {
    /// Tabular or record-oriented content.
    Structured,
    /// Free text.
    Unstructured,
    /// Mixed content; not routed through columnar conversion.
    Hybrid,
}

impl ContentKind {
    /// Lowercase label used in summaries.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Structured => "structured",
            Self::Unstructured => "unstructured",
            Self::Hybrid => "hybrid",
        }
    }
}

/// Output of a parser collaborator. Read-only once produced.
#[derive(Debug, Clone)]
pub struct ParseResult {
    /// Whether parsing succeeded.
    pub success: bool,
    /// Content classification.
    pub content_kind: ContentKind,
    /// File type reported by the parser (usually the extension).
    pub file_type: Option<String>,
    /// Schema and count metadata.
    pub metadata: RawValue,
    /// Structure descriptor.
    pub structure: RawValue,
    /// Grouped row collections. A list contributes its rows, a map is one row, anything else
    /// contributes nothing.
    pub tables: Vec<RawValue>,
    /// Flat records.
    pub records: Vec<RawValue>,
    /// Single data block, flattened like a table.
    pub data: Option<RawValue>,
    /// Error detail when `success` is false.
    pub error: Option<String>,
    /// When the parser produced this result.
    pub parsed_at: Option<OffsetDateTime>,
}

impl ParseResult {
    /// Successful result with no rows yet.
    pub fn success(content_kind: ContentKind) -> Self {
        Self {
            success: true,
            content_kind,
            file_type: None,
            metadata: RawValue::empty_map(),
            structure: RawValue::empty_map(),
            tables: Vec::new(),
            records: Vec::new(),
            data: None,
            error: None,
            parsed_at: Some(OffsetDateTime::now_utc()),
        }
    }

    /// In-band parser failure.
    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            success: false,
            content_kind: ContentKind::Unstructured,
            error: Some(error.into()),
            parsed_at: None,
            ..Self::success(ContentKind::Unstructured)
        }
    }

    /// Set the reported file type.
    pub fn with_file_type(mut self, file_type: impl Into<String>) -> Self {
        self.file_type = Some(file_type.into());
        self
    }

    /// Replace metadata.
    pub fn with_metadata(mut self, metadata: RawValue) -> Self {
        self.metadata = metadata;
        self
    }

    /// Replace the structure descriptor.
    pub fn with_structure(mut self, structure: RawValue) -> Self {
        self.structure = structure;
        self
    }

    /// Add a table.
    pub fn with_table(mut self, table: RawValue) -> Self {
        self.tables.push(table);
        self
    }

    /// Replace flat records.
    pub fn with_records(mut self, records: Vec<RawValue>) -> Self {
        self.records = records;
        self
    }

    /// Set the data block.
    pub fn with_data(mut self, data: RawValue) -> Self {
        self.data = Some(data);
        self
    }

    /// Number of grouped tables.
    pub fn table_count(&self) -> usize {
        self.tables.len()
    }

    /// Number of flat records.
    pub fn record_count(&self) -> usize {
        self.records.len()
    }

    /// Rows across tables, records, and data, counted by flattening them the way the columnar
    /// composer does.
    pub fn row_count(&self) -> usize {
        ColumnarComposer::default().flatten_rows(self).0.len()
    }
}

/// Error taxonomy for pipeline stages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineErrorKind {
    /// A collaborator could not be resolved through any tier.
    ServiceUnavailable,
    /// The parser ran and reported failure.
    ParseFailure,
    /// No structured rows, or the composed artifact failed validation.
    ConversionSkipped,
    /// The store was unavailable or rejected the artifact.
    PersistenceSkipped,
    /// The embedder was unavailable or failed.
    EmbeddingSkipped,
    /// Some values could only be represented as strings.
    SanitizationDegraded,
}

/// Terminal error of a failed pipeline run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PipelineError {
    /// Error category. Only `ServiceUnavailable` and `ParseFailure` are terminal.
    pub kind: PipelineErrorKind,
    /// Human-readable detail (the parser's own message for parse failures).
    pub detail: String,
}

/// Errors from reading stored artifacts back.
#[derive(Debug, Error)]
pub enum LookupError {
    /// No store could be resolved through any tier.
    #[error("store unavailable: ContentSteward could not be resolved")]
    StoreUnavailable,
    /// The store holds no artifact with this id.
    #[error("parsed file not found: {0}")]
    NotFound(String),
    /// The store failed or does not support read-back.
    #[error(transparent)]
    Store(#[from] StoreError),
    /// The stored bytes could not be decoded.
    #[error("failed to decode parsed file: {0}")]
    Decode(#[from] ComposeError),
}

/// Preview of one stored artifact.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ParsedFilePreview {
    /// Artifact identifier.
    pub parsed_file_id: String,
    /// Source file the artifact was converted from.
    pub file_id: String,
    /// Leading rows and columns.
    pub preview: ArtifactPreview,
}

/// Non-fatal annotation describing a degraded or skipped sub-stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DiagnosticNote {
    /// Category of the degradation.
    pub kind: PipelineErrorKind,
    /// Human-readable message.
    pub message: String,
}

impl DiagnosticNote {
    /// Build a note.
    pub fn new(kind: PipelineErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

/// States a pipeline run passes through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineStage {
    /// Request accepted.
    Received,
    /// Parser returned a successful result.
    Parsed,
    /// Rows composed into a validated artifact.
    Converted,
    /// Conversion not attempted or produced nothing.
    SkippedConversion,
    /// Artifact persisted.
    Stored,
    /// Persistence not attempted or failed.
    StorageSkipped,
    /// Sample forwarded to the embedder.
    Embedded,
    /// Embedding not attempted or failed.
    EmbeddingSkipped,
    /// Successful terminal state.
    Finalized,
    /// Failed terminal state.
    Failed,
}

/// Externally visible result of one pipeline run.
#[derive(Debug, Clone, Serialize)]
pub struct PipelineOutcome {
    success: bool,
    file_id: String,
    artifact_id: Option<String>,
    summary: Value,
    notes: Vec<DiagnosticNote>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<PipelineError>,
    workflow_id: String,
    trace: Vec<PipelineStage>,
}

impl PipelineOutcome {
    pub(crate) fn finalized(
        file_id: String,
        workflow_id: String,
        artifact_id: Option<String>,
        summary: Value,
        notes: Vec<DiagnosticNote>,
        trace: Vec<PipelineStage>,
    ) -> Self {
        Self {
            success: true,
            file_id,
            artifact_id,
            summary,
            notes,
            error: None,
            workflow_id,
            trace,
        }
    }

    pub(crate) fn failed(
        file_id: String,
        workflow_id: String,
        error: PipelineError,
        summary: Value,
        trace: Vec<PipelineStage>,
    ) -> Self {
        Self {
            success: false,
            file_id,
            artifact_id: None,
            summary,
            notes: Vec::new(),
            error: Some(error),
            workflow_id,
            trace,
        }
    }

    /// Whether the run reached [`PipelineStage::Finalized`].
    pub fn success(&self) -> bool {
        self.success
    }

    /// Identifier of the ingested file.
    pub fn file_id(&self) -> &str {
        &self.file_id
    }

    /// Identifier of the stored columnar artifact, when persisted.
    pub fn artifact_id(&self) -> Option<&str> {
        self.artifact_id.as_deref()
    }

    /// Metadata-only summary.
    pub fn summary(&self) -> &Value {
        &self.summary
    }

    /// Non-fatal diagnostic notes.
    pub fn notes(&self) -> &[DiagnosticNote] {
        &self.notes
    }

    /// Terminal error for failed runs.
    pub fn error(&self) -> Option<&PipelineError> {
        self.error.as_ref()
    }

    /// Per-run identifier.
    pub fn workflow_id(&self) -> &str {
        &self.workflow_id
    }

    /// Stages visited, in order.
    pub fn trace(&self) -> &[PipelineStage] {
        &self.trace
    }

    /// Whether any note of `kind` was recorded.
    pub fn has_note(&self, kind: PipelineErrorKind) -> bool {
        self.notes.iter().any(|note| note.kind == kind)
    }

    /// Serialize the outcome and pass it through the sanitizer once more.
    pub fn to_json(&self) -> Value {
        match serde_json::to_value(self) {
            Ok(value) => super::sanitize::Sanitizer::default().resanitize(value),
            Err(error) => {
                tracing::error!(error = %error, "Failed to serialize pipeline outcome");
                serde_json::json!({
                    "success": self.success,
                    "file_id": self.file_id,
                    "workflow_id": self.workflow_id,
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::processing::value::{Scalar, Tensor};
    use serde_json::json;

    #[test]
    fn parse_options_carry_request_identity() {
        let request = IngestionRequest::new("f1", "u1")
            .with_session("s1")
            .with_auxiliary_file("copybook")
            .with_option("delimiter", ";")
            .with_option("user_id", "spoofed");
        let options = request.parse_options();
        assert_eq!(options["user_id"], json!("u1"));
        assert_eq!(options["session_id"], json!("s1"));
        assert_eq!(options["auxiliary_file_id"], json!("copybook"));
        assert_eq!(options["delimiter"], json!(";"));
        assert_eq!(request.options()["user_id"], json!("spoofed"));
    }

    #[test]
    fn row_count_flattens_every_block() {
        let result = ParseResult::success(ContentKind::Structured)
            .with_table(RawValue::from(json!([{ "a": 1 }, { "a": 2 }])))
            .with_table(RawValue::from(json!({ "a": 3 })))
            .with_records(vec![RawValue::from(json!({ "b": 1 }))])
            .with_data(RawValue::from(json!([1, 2, 3])));
        assert_eq!(result.table_count(), 2);
        assert_eq!(result.record_count(), 1);
        assert_eq!(result.row_count(), 7);
    }

    #[test]
    fn row_count_ignores_null_and_scalar_blocks() {
        let result = ParseResult::success(ContentKind::Structured)
            .with_table(RawValue::Null)
            .with_table(RawValue::from("oops"))
            .with_data(RawValue::Null);
        assert_eq!(result.table_count(), 2);
        assert_eq!(result.row_count(), 0);
    }

    #[test]
    fn row_count_follows_foreign_tensor_rows() {
        let tensor = Tensor::new(
            vec![3, 2],
            (0..6).map(Scalar::Int32).collect(),
        );
        let result = ParseResult::success(ContentKind::Structured)
            .with_table(RawValue::foreign(tensor));
        assert_eq!(result.row_count(), 3);
    }

    #[test]
    fn failure_carries_detail() {
        let result = ParseResult::failure("unsupported format");
        assert!(!result.success);
        assert_eq!(result.error.as_deref(), Some("unsupported format"));
        assert_eq!(result.row_count(), 0);
    }

    #[test]
    fn outcome_serializes_kinds_in_snake_case() {
        let outcome = PipelineOutcome::finalized(
            "f".into(),
            "w".into(),
            None,
            json!({}),
            vec![DiagnosticNote::new(
                PipelineErrorKind::PersistenceSkipped,
                "persistence skipped: store unavailable",
            )],
            vec![PipelineStage::Received, PipelineStage::Finalized],
        );
        let value = outcome.to_json();
        assert_eq!(value["notes"][0]["kind"], json!("persistence_skipped"));
        assert_eq!(value["trace"], json!(["received", "finalized"]));
        assert!(value.get("error").is_none());
        assert!(outcome.has_note(PipelineErrorKind::PersistenceSkipped));
    }
}
