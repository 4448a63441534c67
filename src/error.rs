//! Error taxonomy for the build and generation pipeline.
//!
//! Per-document and per-test-case failures ([`NormalizeError`],
//! [`CitationViolation`]) are isolated: they are logged and returned as
//! warnings next to a partial result. Backend and concurrency failures
//! ([`BackendError`], [`PipelineError`]) abort the current operation.

use std::time::Duration;

use serde::Serialize;
use testbrain_core::models::{DocumentFormat, GeneratedScript};
use thiserror::Error;

/// A document could not be normalized. Aborts only that document's
/// ingestion.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum NormalizeError {
    #[error("unsupported format tag: '{0}'")]
    UnsupportedFormat(String),
    #[error("corrupt {format} payload: {reason}")]
    Corrupt {
        format: DocumentFormat,
        reason: String,
    },
}

/// Failures from a text-generation provider.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum BackendError {
    /// Network failure, rate limit, or server error. Worth retrying.
    #[error("transient backend failure: {0}")]
    Transient(String),
    /// Authentication failure, malformed request, or unusable response.
    /// Never retried.
    #[error("backend rejected the request: {0}")]
    Fatal(String),
    #[error("backend call timed out after {0:?}")]
    Timeout(Duration),
    #[error("backend call cancelled")]
    Cancelled,
}

impl BackendError {
    pub fn is_transient(&self) -> bool {
        matches!(self, BackendError::Transient(_) | BackendError::Timeout(_))
    }

    /// Classify an HTTP status the way the embedding providers do: 429 and
    /// 5xx are transient, every other failure is fatal.
    pub fn from_status(status: reqwest::StatusCode, body: &str) -> Self {
        let msg = format!("HTTP {}: {}", status, truncate(body, 300));
        if status.as_u16() == 429 || status.is_server_error() {
            BackendError::Transient(msg)
        } else {
            BackendError::Fatal(msg)
        }
    }
}

/// Knowledge-base lifecycle failures.
#[derive(Debug, Error)]
pub enum KnowledgeBaseError {
    #[error("a knowledge-base build is already in progress")]
    BuildInProgress,
    #[error("no knowledge base has been built")]
    Empty,
    #[error("embedding model returned {got}-dim vectors, expected {expected}")]
    DimensionMismatch { expected: usize, got: usize },
    #[error("embedding failed: {0}")]
    Embedding(String),
    #[error("build cancelled")]
    Cancelled,
}

/// A parsed test case cited a source absent from the retrieved evidence.
/// The case is dropped; the rest of the batch survives.
#[derive(Debug, Clone, Error, PartialEq, Eq, Serialize)]
#[error("test case {test_case_id} cites unretrieved sources: {}", unknown_sources.join(", "))]
pub struct CitationViolation {
    pub test_case_id: String,
    /// Citation tokens that matched no retrieved document. Empty when the
    /// case cited nothing at all.
    pub unknown_sources: Vec<String>,
}

/// Errors surfaced by `generate` and `synthesize`.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("no knowledge base has been built; build one before querying")]
    EmptyKnowledgeBase,
    #[error("a knowledge-base build is already in progress")]
    BuildInProgress,
    #[error("no documentation evidence matched query '{query}'")]
    InsufficientContext { query: String },
    #[error("generation backend failed: {0}")]
    GenerationBackend(BackendError),
    #[error("backend response did not match the test-case schema: {reason}")]
    ResponseSchema { reason: String, excerpt: String },
    #[error(
        "script for {test_case_id} references selectors absent from the page: {}",
        selectors.join(", ")
    )]
    SelectorMismatch {
        test_case_id: String,
        selectors: Vec<String>,
        /// The last rejected script. It is still stored and addressable.
        script: Box<GeneratedScript>,
    },
    #[error("unknown test case: {0}")]
    UnknownTestCase(String),
    #[error("no page markup has been uploaded")]
    NoElementMap,
    #[error("query embedding failed: {0}")]
    Embedding(String),
    #[error("operation cancelled")]
    Cancelled,
}

impl From<BackendError> for PipelineError {
    fn from(err: BackendError) -> Self {
        match err {
            BackendError::Cancelled => PipelineError::Cancelled,
            other => PipelineError::GenerationBackend(other),
        }
    }
}

impl From<KnowledgeBaseError> for PipelineError {
    fn from(err: KnowledgeBaseError) -> Self {
        match err {
            KnowledgeBaseError::BuildInProgress => PipelineError::BuildInProgress,
            KnowledgeBaseError::Empty => PipelineError::EmptyKnowledgeBase,
            KnowledgeBaseError::Cancelled => PipelineError::Cancelled,
            other => PipelineError::Embedding(other.to_string()),
        }
    }
}

/// Cut `s` to at most `max` characters, on a char boundary.
pub(crate) fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((i, _)) => &s[..i],
        None => s,
    }
}
