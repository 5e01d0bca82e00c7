#![deny(missing_docs)]

//! Core library for the document ingestion pipeline.

/// Environment-driven configuration management.
pub mod config;
/// Embedder collaborator and the hashing default.
pub mod embedding;
/// Structured logging and tracing setup.
pub mod logging;
/// Ingestion metrics helpers.
pub mod metrics;
/// Parser collaborator and the local file parser.
pub mod parser;
/// Ingestion pipeline: sanitizer, composer, sampler, resolver, orchestrator.
pub mod processing;
/// Store collaborator and the filesystem default.
pub mod storage;
