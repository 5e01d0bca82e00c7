//! Ingestion pipeline: sanitization, columnar conversion, sampling, resolution, orchestration.

pub mod columnar;
pub mod resolver;
pub mod sampling;
pub mod sanitize;
mod service;
pub mod summary;
pub mod types;
pub mod value;

pub use columnar::{
    ArtifactPreview, ColumnarArtifact, ColumnarComposer, ComposeError, PARQUET_MAGIC,
};
pub use resolver::{
    Capability, CollaboratorFactory, Handle, InMemoryRegistry, LocalCollaborators, Registry,
    ResolveError, ServiceResolver,
};
pub use sampling::{EmbeddingSample, EmbeddingSampler, SamplingError};
pub use sanitize::{SanitizeReport, Sanitizer, sanitize};
pub use service::{
    DEFAULT_PREVIEW_COLUMNS, DEFAULT_PREVIEW_ROWS, IngestionApi, PipelineOrchestrator,
    PipelineSettings,
};
pub use types::{
    ContentKind, DiagnosticNote, IngestionRequest, LookupError, ParseResult, ParsedFilePreview,
    PipelineError, PipelineErrorKind, PipelineOutcome, PipelineStage,
};
pub use value::{ForeignValue, NativeScalar, RawValue, Scalar, Tensor};
