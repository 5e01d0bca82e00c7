//! Pipeline orchestrator: parse, convert, store, sample, embed, summarize.

use std::sync::Arc;

use async_trait::async_trait;
use futures_util::future::join_all;
use serde_json::{Value, json};
use tracing::Instrument;
use uuid::Uuid;

use crate::{
    config::{ColumnarCompression, Config, DEFAULT_SAMPLE_STRIDE, DEFAULT_SANITIZE_MAX_DEPTH},
    metrics::{MetricsSnapshot, PipelineMetrics},
    processing::{
        columnar::{ColumnarArtifact, ColumnarComposer, Row},
        resolver::{LocalCollaborators, Registry, ServiceResolver},
        sampling::{EmbeddingSampler, SamplingError},
        sanitize::{SanitizeReport, Sanitizer},
        summary::build_summary,
        types::{
            ContentKind, DiagnosticNote, IngestionRequest, LookupError, ParseResult,
            ParsedFilePreview, PipelineError, PipelineErrorKind, PipelineOutcome, PipelineStage,
        },
    },
    storage::{ArtifactRecord, StoreRequest, StoredArtifact},
};

/// Rows returned by a parsed-file preview unless the caller asks otherwise.
pub const DEFAULT_PREVIEW_ROWS: usize = 20;
/// Columns returned by a parsed-file preview unless the caller asks otherwise.
pub const DEFAULT_PREVIEW_COLUMNS: usize = 20;

/// Tunables for one orchestrator.
#[derive(Debug, Clone, Copy)]
pub struct PipelineSettings {
    /// Every-Nth-row stride for embedding samples.
    pub sample_stride: usize,
    /// Artifact block compression.
    pub compression: ColumnarCompression,
    /// Sanitizer depth bound.
    pub sanitize_max_depth: usize,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            sample_stride: DEFAULT_SAMPLE_STRIDE,
            compression: ColumnarCompression::default(),
            sanitize_max_depth: DEFAULT_SANITIZE_MAX_DEPTH,
        }
    }
}

impl From<&Config> for PipelineSettings {
    fn from(config: &Config) -> Self {
        Self {
            sample_stride: config.sample_stride,
            compression: config.compression,
            sanitize_max_depth: config.sanitize_max_depth,
        }
    }
}

/// Sequences one ingestion per call; concurrent calls share only the resolver cache.
///
/// Only an unavailable parser or a parser-reported failure fails a run. Every later stage is
/// best-effort and records a [`DiagnosticNote`] when it is skipped.
pub struct PipelineOrchestrator {
    resolver: Arc<ServiceResolver>,
    composer: ColumnarComposer,
    sampler: EmbeddingSampler,
    sanitizer: Sanitizer,
    metrics: Arc<PipelineMetrics>,
}

/// Abstraction over the orchestrator used by callers (CLI, tests, embedding hosts).
#[async_trait]
pub trait IngestionApi: Send + Sync {
    /// Run the pipeline for one request.
    async fn ingest(&self, request: &IngestionRequest) -> PipelineOutcome;

    /// Run the pipeline for several independent requests concurrently.
    async fn ingest_many(&self, requests: Vec<IngestionRequest>) -> Vec<PipelineOutcome>;

    /// Preview a stored artifact.
    async fn preview_parsed_file(
        &self,
        parsed_file_id: &str,
        max_rows: usize,
        max_columns: usize,
    ) -> Result<ParsedFilePreview, LookupError>;

    /// Stored artifacts of a user, optionally for one source file.
    async fn list_parsed_files(
        &self,
        user_id: &str,
        file_id: Option<&str>,
    ) -> Result<Vec<ArtifactRecord>, LookupError>;

    /// Retrieve the current metrics snapshot for diagnostics.
    fn metrics_snapshot(&self) -> MetricsSnapshot;
}

struct Run {
    trace: Vec<PipelineStage>,
    notes: Vec<DiagnosticNote>,
}

impl Run {
    fn advance(&mut self, stage: PipelineStage) {
        tracing::debug!(stage = ?stage, "Pipeline stage");
        self.trace.push(stage);
    }

    fn skip(&mut self, stage: PipelineStage, kind: PipelineErrorKind, message: String) {
        tracing::warn!(stage = ?stage, kind = ?kind, message = %message, "Pipeline stage skipped");
        self.trace.push(stage);
        self.notes.push(DiagnosticNote::new(kind, message));
    }
}

impl PipelineOrchestrator {
    /// Build an orchestrator around a resolver.
    pub fn new(
        resolver: Arc<ServiceResolver>,
        settings: PipelineSettings,
    ) -> Result<Self, SamplingError> {
        let sanitizer = Sanitizer::new(settings.sanitize_max_depth);
        Ok(Self {
            resolver,
            composer: ColumnarComposer::new(settings.compression, sanitizer),
            sampler: EmbeddingSampler::new(settings.sample_stride)?,
            sanitizer,
            metrics: Arc::new(PipelineMetrics::new()),
        })
    }

    /// Build an orchestrator that resolves from `registry` and falls back to local defaults.
    pub fn from_config(
        config: &Config,
        registry: Arc<dyn Registry>,
    ) -> Result<Self, SamplingError> {
        let factory = Arc::new(LocalCollaborators::new(config.clone()));
        let resolver = Arc::new(ServiceResolver::standard(registry, factory));
        Self::new(resolver, PipelineSettings::from(config))
    }

    /// Resolver shared by every run.
    pub fn resolver(&self) -> &Arc<ServiceResolver> {
        &self.resolver
    }

    /// Run the pipeline. Always returns an outcome; failures are reported inside it.
    pub async fn ingest(&self, request: &IngestionRequest) -> PipelineOutcome {
        let workflow_id = Uuid::new_v4().to_string();
        let span = tracing::info_span!(
            "ingest",
            file_id = %request.file_id(),
            user_id = %request.user_id(),
            workflow_id = %workflow_id
        );
        self.run(request, workflow_id).instrument(span).await
    }

    /// Run independent requests concurrently; outcomes keep request order.
    pub async fn ingest_many(&self, requests: Vec<IngestionRequest>) -> Vec<PipelineOutcome> {
        join_all(requests.iter().map(|request| self.ingest(request))).await
    }

    /// Return the current ingestion metrics snapshot.
    pub fn metrics_snapshot(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    /// Decode the leading `max_rows` rows of the first `max_columns` columns of a stored artifact.
    pub async fn preview_parsed_file(
        &self,
        parsed_file_id: &str,
        max_rows: usize,
        max_columns: usize,
    ) -> Result<ParsedFilePreview, LookupError> {
        let store = self
            .resolver
            .store()
            .await
            .ok_or(LookupError::StoreUnavailable)?;
        let retrieved = store
            .retrieve(parsed_file_id)
            .await?
            .ok_or_else(|| LookupError::NotFound(parsed_file_id.to_string()))?;
        let preview = retrieved.artifact.preview(max_rows, max_columns)?;
        tracing::info!(
            parsed_file_id,
            preview_rows = preview.preview_rows,
            preview_columns = preview.preview_columns,
            total_rows = preview.total_rows,
            total_columns = preview.total_columns,
            "Previewed parsed file"
        );
        Ok(ParsedFilePreview {
            parsed_file_id: parsed_file_id.to_string(),
            file_id: retrieved.record.file_id,
            preview,
        })
    }

    /// Stored artifacts owned by `user_id`, optionally limited to one source file.
    pub async fn list_parsed_files(
        &self,
        user_id: &str,
        file_id: Option<&str>,
    ) -> Result<Vec<ArtifactRecord>, LookupError> {
        let store = self
            .resolver
            .store()
            .await
            .ok_or(LookupError::StoreUnavailable)?;
        let records = store.list(user_id, file_id).await?;
        tracing::info!(
            user_id,
            file_id = file_id.unwrap_or("*"),
            count = records.len(),
            "Listed parsed files"
        );
        Ok(records)
    }

    async fn run(&self, request: &IngestionRequest, workflow_id: String) -> PipelineOutcome {
        let file_id = request.file_id().to_string();
        let mut run = Run {
            trace: vec![PipelineStage::Received],
            notes: Vec::new(),
        };
        tracing::info!("Ingestion received");

        let Some(parser) = self.resolver.parser().await else {
            return self.fail(
                file_id,
                workflow_id,
                run,
                PipelineErrorKind::ServiceUnavailable,
                "parser unavailable: FileParserService could not be resolved".into(),
                json!({}),
            );
        };

        let result = parser.parse(request.file_id(), &request.parse_options()).await;
        let (mut summary, mut report) = build_summary(&result, &self.sanitizer);
        if !result.success {
            let detail = result
                .error
                .clone()
                .unwrap_or_else(|| "parser reported failure without detail".into());
            return self.fail(
                file_id,
                workflow_id,
                run,
                PipelineErrorKind::ParseFailure,
                detail,
                summary,
            );
        }
        run.advance(PipelineStage::Parsed);

        let (rows, artifact) = self.convert(&result, &mut run, &mut report);
        if let (Some(artifact), Value::Object(fields)) = (&artifact, &mut summary) {
            fields.insert("artifact".into(), artifact.describe());
        }

        let stored = self
            .store(request, result.content_kind, artifact, &summary, &mut run)
            .await;

        let embedding = self.embed(stored.as_ref(), &rows, &summary, &mut run).await;
        if let (Some(embedding), Value::Object(fields)) = (embedding, &mut summary) {
            fields.insert("embedding".into(), embedding);
        }

        let (summary, final_report) = self.sanitizer.resanitize_with_report(summary);
        report += final_report;
        if report.degraded > 0 {
            run.notes.push(DiagnosticNote::new(
                PipelineErrorKind::SanitizationDegraded,
                format!(
                    "sanitization degraded: {} value(s) stringified, {} circular reference(s), \
                     {} depth truncation(s)",
                    report.degraded, report.circular_references, report.depth_truncations
                ),
            ));
        }

        run.advance(PipelineStage::Finalized);
        self.metrics.record_success(run.notes.len() as u64);
        tracing::info!(
            artifact_id = stored.as_ref().map(|s| s.artifact_id.as_str()).unwrap_or("none"),
            notes = run.notes.len(),
            "Ingestion finalized"
        );
        PipelineOutcome::finalized(
            file_id,
            workflow_id,
            stored.map(|stored| stored.artifact_id),
            summary,
            run.notes,
            run.trace,
        )
    }

    fn convert(
        &self,
        result: &ParseResult,
        run: &mut Run,
        report: &mut SanitizeReport,
    ) -> (Vec<Row>, Option<ColumnarArtifact>) {
        if result.content_kind != ContentKind::Structured {
            run.skip(
                PipelineStage::SkippedConversion,
                PipelineErrorKind::ConversionSkipped,
                format!(
                    "conversion skipped: content is {}, not structured",
                    result.content_kind.as_str()
                ),
            );
            return (Vec::new(), None);
        }

        let (rows, flatten_report) = self.composer.flatten_rows(result);
        *report += flatten_report;
        match self.composer.compose_rows(&rows) {
            Ok(artifact) => {
                run.advance(PipelineStage::Converted);
                (rows, Some(artifact))
            }
            Err(error) => {
                run.skip(
                    PipelineStage::SkippedConversion,
                    PipelineErrorKind::ConversionSkipped,
                    format!("conversion skipped: {error}"),
                );
                (rows, None)
            }
        }
    }

    async fn store(
        &self,
        request: &IngestionRequest,
        content_type: ContentKind,
        artifact: Option<ColumnarArtifact>,
        summary: &Value,
        run: &mut Run,
    ) -> Option<StoredArtifact> {
        let skip = |run: &mut Run, reason: String| {
            run.skip(
                PipelineStage::StorageSkipped,
                PipelineErrorKind::PersistenceSkipped,
                format!("persistence skipped: {reason}"),
            );
        };

        let Some(artifact) = artifact else {
            skip(run, "no columnar artifact".into());
            return None;
        };
        let Some(store) = self.resolver.store().await else {
            skip(run, "store unavailable".into());
            return None;
        };

        let request = StoreRequest {
            file_id: request.file_id().to_string(),
            user_id: request.user_id().to_string(),
            artifact,
            content_type,
            parse_summary: summary.clone(),
        };
        match store.persist(request).await {
            Ok(stored) => {
                self.metrics.record_artifact();
                run.advance(PipelineStage::Stored);
                Some(stored)
            }
            Err(error) => {
                skip(run, error.to_string());
                None
            }
        }
    }

    async fn embed(
        &self,
        stored: Option<&StoredArtifact>,
        rows: &[Row],
        summary: &Value,
        run: &mut Run,
    ) -> Option<Value> {
        let skip = |run: &mut Run, reason: String| {
            run.skip(
                PipelineStage::EmbeddingSkipped,
                PipelineErrorKind::EmbeddingSkipped,
                format!("embedding skipped: {reason}"),
            );
        };

        let Some(stored) = stored else {
            skip(run, "no stored artifact".into());
            return None;
        };
        let Some(embedder) = self.resolver.embedder().await else {
            skip(run, "embedder unavailable".into());
            return None;
        };

        let sample = self.sampler.sample(rows);
        match embedder.embed(&stored.artifact_id, summary, &sample).await {
            Ok(receipt) => {
                self.metrics.record_sampled(sample.len() as u64);
                run.advance(PipelineStage::Embedded);
                Some(json!({
                    "sampled": sample.len(),
                    "stride": sample.stride,
                    "total_rows": sample.total_rows,
                    "stored_count": receipt.stored_count,
                }))
            }
            Err(error) => {
                skip(run, error.to_string());
                None
            }
        }
    }

    fn fail(
        &self,
        file_id: String,
        workflow_id: String,
        mut run: Run,
        kind: PipelineErrorKind,
        detail: String,
        summary: Value,
    ) -> PipelineOutcome {
        tracing::error!(kind = ?kind, detail = %detail, "Ingestion failed");
        run.trace.push(PipelineStage::Failed);
        self.metrics.record_failure();
        PipelineOutcome::failed(
            file_id,
            workflow_id,
            PipelineError { kind, detail },
            self.sanitizer.resanitize(summary),
            run.trace,
        )
    }
}

#[async_trait]
impl IngestionApi for PipelineOrchestrator {
    async fn ingest(&self, request: &IngestionRequest) -> PipelineOutcome {
        PipelineOrchestrator::ingest(self, request).await
    }

    async fn ingest_many(&self, requests: Vec<IngestionRequest>) -> Vec<PipelineOutcome> {
        PipelineOrchestrator::ingest_many(self, requests).await
    }

    async fn preview_parsed_file(
        &self,
        parsed_file_id: &str,
        max_rows: usize,
        max_columns: usize,
    ) -> Result<ParsedFilePreview, LookupError> {
        PipelineOrchestrator::preview_parsed_file(self, parsed_file_id, max_rows, max_columns).await
    }

    async fn list_parsed_files(
        &self,
        user_id: &str,
        file_id: Option<&str>,
    ) -> Result<Vec<ArtifactRecord>, LookupError> {
        PipelineOrchestrator::list_parsed_files(self, user_id, file_id).await
    }

    fn metrics_snapshot(&self) -> MetricsSnapshot {
        PipelineOrchestrator::metrics_snapshot(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::processing::resolver::InMemoryRegistry;

    fn empty_resolver() -> Arc<ServiceResolver> {
        Arc::new(ServiceResolver::new(vec![Arc::new(
            crate::processing::resolver::RegistryTier::new(Arc::new(InMemoryRegistry::new())),
        )]))
    }

    #[test]
    fn zero_stride_is_rejected_at_construction() {
        let settings = PipelineSettings {
            sample_stride: 0,
            ..PipelineSettings::default()
        };
        assert!(PipelineOrchestrator::new(empty_resolver(), settings).is_err());
    }

    #[test]
    fn settings_follow_config() {
        let config = Config {
            sample_stride: 3,
            compression: ColumnarCompression::None,
            ..Config::default()
        };
        let settings = PipelineSettings::from(&config);
        assert_eq!(settings.sample_stride, 3);
        assert_eq!(settings.compression, ColumnarCompression::None);
    }

    #[tokio::test]
    async fn missing_parser_fails_with_service_unavailable() {
        let orchestrator =
            PipelineOrchestrator::new(empty_resolver(), PipelineSettings::default()).unwrap();
        let outcome = orchestrator
            .ingest(&IngestionRequest::new("rows.csv", "user"))
            .await;

        assert!(!outcome.success());
        let error = outcome.error().unwrap();
        assert_eq!(error.kind, PipelineErrorKind::ServiceUnavailable);
        assert_eq!(
            outcome.trace(),
            [PipelineStage::Received, PipelineStage::Failed]
        );
        assert_eq!(orchestrator.metrics_snapshot().files_failed, 1);
    }
}
