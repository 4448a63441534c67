//! Knowledge-base build and retrieval.
//!
//! # Build
//!
//! ```text
//! SourceDocument ──▶ normalize ──▶ chunk ──▶ embed (batched) ──▶ KnowledgeBase
//!        │               │            │            │
//!        ▼               ▼            ▼            ▼
//!  parse error:    empty text:     -        failed chunk: retried,
//!  doc skipped     warning                  then dropped with warning
//! ```
//!
//! The new snapshot is assembled off to the side and published with one
//! atomic pointer swap. Readers that loaded the previous snapshot keep
//! using it until they drop their `Arc`. Only one build runs at a time;
//! a second concurrent build is rejected with
//! [`KnowledgeBaseError::BuildInProgress`].

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use arc_swap::ArcSwapOption;
use serde::Serialize;
use testbrain_core::chunk::chunk_text;
use testbrain_core::embedding::EmbeddingProvider;
use testbrain_core::knowledge::{KnowledgeBase, KnowledgeBaseBuilder};
use testbrain_core::models::{Chunk, DocumentFormat, RetrievedEvidence, SourceDocument};
use testbrain_core::search::SearchParams;
use tokio_util::sync::CancellationToken;

use crate::backend::retry::{Backoff, RetryPolicy};
use crate::error::{KnowledgeBaseError, PipelineError};
use crate::normalize::normalize;

/// One isolated problem encountered during a build.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BuildWarning {
    pub document: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub chunk: Option<String>,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DocumentStatus {
    Indexed,
    Empty,
    Skipped,
}

#[derive(Debug, Clone, Serialize)]
pub struct DocumentReport {
    pub document_id: String,
    pub name: String,
    pub format: DocumentFormat,
    pub status: DocumentStatus,
    pub chunk_count: usize,
}

/// Outcome of a build.
#[derive(Debug, Clone, Serialize)]
pub struct BuildReport {
    /// True when the new snapshot holds at least one chunk.
    pub success: bool,
    pub generation: u64,
    pub chunk_count: usize,
    pub documents: Vec<DocumentReport>,
    pub warnings: Vec<BuildWarning>,
}

/// Chunking and embedding settings for one session.
#[derive(Clone)]
pub struct Indexer {
    embedder: Arc<dyn EmbeddingProvider>,
    chunk_size: usize,
    chunk_overlap: usize,
    batch_size: usize,
    chunk_retry: RetryPolicy,
}

impl Indexer {
    pub fn new(
        embedder: Arc<dyn EmbeddingProvider>,
        chunk_size: usize,
        chunk_overlap: usize,
        batch_size: usize,
        chunk_retry: RetryPolicy,
    ) -> Self {
        Self {
            embedder,
            chunk_size,
            chunk_overlap,
            batch_size: batch_size.max(1),
            chunk_retry,
        }
    }

    pub fn embedder(&self) -> &Arc<dyn EmbeddingProvider> {
        &self.embedder
    }

    /// Embed `chunks` in batches. A batch that fails or returns unusable
    /// vectors falls back to per-chunk embedding with retry; chunks that
    /// still fail come back as `None`.
    async fn embed_chunks(
        &self,
        chunks: &[Chunk],
        cancel: &CancellationToken,
    ) -> Result<Vec<Option<Vec<f32>>>, KnowledgeBaseError> {
        let mut out = Vec::with_capacity(chunks.len());
        for batch in chunks.chunks(self.batch_size) {
            if cancel.is_cancelled() {
                return Err(KnowledgeBaseError::Cancelled);
            }
            let texts: Vec<String> = batch.iter().map(|c| c.text.clone()).collect();
            match self.embedder.embed(&texts).await {
                Ok(vectors)
                    if vectors.len() == batch.len()
                        && vectors.iter().all(|v| self.usable(v)) =>
                {
                    out.extend(vectors.into_iter().map(Some));
                }
                Ok(_) => {
                    tracing::warn!(batch = batch.len(), "embedding batch returned unusable vectors");
                    for chunk in batch {
                        out.push(self.embed_one_with_retry(chunk, cancel).await?);
                    }
                }
                Err(e) => {
                    tracing::warn!(batch = batch.len(), error = %e, "embedding batch failed");
                    for chunk in batch {
                        out.push(self.embed_one_with_retry(chunk, cancel).await?);
                    }
                }
            }
        }
        Ok(out)
    }

    async fn embed_one_with_retry(
        &self,
        chunk: &Chunk,
        cancel: &CancellationToken,
    ) -> Result<Option<Vec<f32>>, KnowledgeBaseError> {
        let mut backoff = Backoff::new(self.chunk_retry);
        loop {
            let attempt = backoff.attempt();
            match self.embedder.embed(std::slice::from_ref(&chunk.text)).await {
                Ok(mut v) if v.len() == 1 && self.usable(&v[0]) => return Ok(v.pop()),
                Ok(_) => {
                    tracing::debug!(chunk = %chunk.id, attempt, "unusable embedding vector")
                }
                Err(e) => tracing::debug!(chunk = %chunk.id, attempt, error = %e, "chunk embedding failed"),
            }
            let Some(delay) = backoff.next_delay() else {
                return Ok(None);
            };
            tokio::select! {
                _ = cancel.cancelled() => return Err(KnowledgeBaseError::Cancelled),
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    fn usable(&self, v: &[f32]) -> bool {
        v.len() == self.embedder.dims() && v.iter().all(|x| x.is_finite())
    }
}

/// Versioned handle to the current knowledge base.
pub struct KnowledgeBaseHandle {
    current: ArcSwapOption<KnowledgeBase>,
    build_lock: tokio::sync::Mutex<()>,
    generation: AtomicU64,
}

impl Default for KnowledgeBaseHandle {
    fn default() -> Self {
        Self::new()
    }
}

impl KnowledgeBaseHandle {
    pub fn new() -> Self {
        Self {
            current: ArcSwapOption::empty(),
            build_lock: tokio::sync::Mutex::new(()),
            generation: AtomicU64::new(0),
        }
    }

    /// The current snapshot, if any build has completed.
    pub fn snapshot(&self) -> Option<Arc<KnowledgeBase>> {
        self.current.load_full()
    }

    /// Whether a non-empty snapshot is queryable.
    pub fn is_ready(&self) -> bool {
        self.snapshot().map(|kb| !kb.is_empty()).unwrap_or(false)
    }

    pub fn is_building(&self) -> bool {
        self.build_lock.try_lock().is_err()
    }

    /// Drop the current snapshot.
    pub fn clear(&self) {
        self.current.store(None);
    }

    /// Build a new snapshot from `documents` and swap it in.
    ///
    /// The previous snapshot stays queryable until the swap. On
    /// cancellation the previous snapshot is kept.
    pub async fn build(
        &self,
        documents: &[SourceDocument],
        indexer: &Indexer,
        cancel: &CancellationToken,
    ) -> Result<BuildReport, KnowledgeBaseError> {
        let _guard = self
            .build_lock
            .try_lock()
            .map_err(|_| KnowledgeBaseError::BuildInProgress)?;

        let embedder = indexer.embedder();
        let mut builder = KnowledgeBaseBuilder::new(embedder.model_name(), embedder.dims());
        let mut warnings = Vec::new();
        let mut reports = Vec::with_capacity(documents.len());
        let mut pending: Vec<Chunk> = Vec::new();
        let mut seen: HashSet<&str> = HashSet::new();

        if documents.is_empty() {
            tracing::warn!("building knowledge base with zero documents");
        }

        for doc in documents {
            if cancel.is_cancelled() {
                return Err(KnowledgeBaseError::Cancelled);
            }
            if !seen.insert(doc.id.as_str()) {
                tracing::warn!(document = %doc.name, id = %doc.id, "duplicate document in build input");
                warnings.push(BuildWarning {
                    document: doc.name.clone(),
                    chunk: None,
                    message: format!("document {} listed more than once; indexed once", doc.id),
                });
                continue;
            }

            let normalized = match normalize(&doc.content, doc.format) {
                Ok(n) => n,
                Err(e) => {
                    tracing::warn!(document = %doc.name, error = %e, "skipping document");
                    warnings.push(BuildWarning {
                        document: doc.name.clone(),
                        chunk: None,
                        message: e.to_string(),
                    });
                    reports.push(DocumentReport {
                        document_id: doc.id.clone(),
                        name: doc.name.clone(),
                        format: doc.format,
                        status: DocumentStatus::Skipped,
                        chunk_count: 0,
                    });
                    continue;
                }
            };

            builder
                .add_document(&doc.id, &doc.name, doc.format)
                .map_err(|e| KnowledgeBaseError::Embedding(e.to_string()))?;

            let chunks: Vec<Chunk> = chunk_text(
                &doc.id,
                &normalized.text,
                indexer.chunk_size,
                indexer.chunk_overlap,
            )
            .map_err(|e| KnowledgeBaseError::Embedding(e.to_string()))?
            .collect();

            if chunks.is_empty() {
                tracing::warn!(document = %doc.name, "document produced no text");
                warnings.push(BuildWarning {
                    document: doc.name.clone(),
                    chunk: None,
                    message: "document produced no text".to_string(),
                });
            }
            tracing::debug!(document = %doc.name, chunks = chunks.len(), "chunked document");

            reports.push(DocumentReport {
                document_id: doc.id.clone(),
                name: doc.name.clone(),
                format: doc.format,
                status: if chunks.is_empty() {
                    DocumentStatus::Empty
                } else {
                    DocumentStatus::Indexed
                },
                chunk_count: 0,
            });
            pending.extend(chunks);
        }

        let vectors = indexer.embed_chunks(&pending, cancel).await?;

        for (chunk, vector) in pending.into_iter().zip(vectors) {
            let Some(vector) = vector else {
                let name = documents
                    .iter()
                    .find(|d| d.id == chunk.document_id)
                    .map(|d| d.name.clone())
                    .unwrap_or_else(|| chunk.document_id.clone());
                tracing::warn!(document = %name, chunk = %chunk.id, "dropping chunk after embedding retries");
                warnings.push(BuildWarning {
                    document: name,
                    chunk: Some(chunk.id.clone()),
                    message: "embedding failed after retries; chunk dropped".to_string(),
                });
                continue;
            };
            if let Some(r) = reports.iter_mut().find(|r| r.document_id == chunk.document_id) {
                r.chunk_count += 1;
            }
            builder
                .push(chunk, vector)
                .map_err(|e| KnowledgeBaseError::Embedding(e.to_string()))?;
        }

        if cancel.is_cancelled() {
            return Err(KnowledgeBaseError::Cancelled);
        }

        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let kb = builder.finish(generation);
        let chunk_count = kb.len();
        self.current.store(Some(Arc::new(kb)));

        tracing::info!(
            generation,
            documents = reports.len(),
            chunks = chunk_count,
            warnings = warnings.len(),
            "knowledge base swapped in"
        );

        Ok(BuildReport {
            success: chunk_count > 0,
            generation,
            chunk_count,
            documents: reports,
            warnings,
        })
    }
}

/// Embeds queries with the session's model and ranks the current snapshot.
#[derive(Clone)]
pub struct Retriever {
    handle: Arc<KnowledgeBaseHandle>,
    embedder: Arc<dyn EmbeddingProvider>,
    min_score: f32,
}

impl Retriever {
    pub fn new(
        handle: Arc<KnowledgeBaseHandle>,
        embedder: Arc<dyn EmbeddingProvider>,
        min_score: f32,
    ) -> Self {
        Self {
            handle,
            embedder,
            min_score,
        }
    }

    /// Top `k` chunks for `query`, best first, ties in build order.
    ///
    /// # Errors
    ///
    /// [`PipelineError::EmptyKnowledgeBase`] when no snapshot exists or the
    /// current one holds no chunks.
    pub async fn retrieve(&self, query: &str, k: usize) -> Result<RetrievedEvidence, PipelineError> {
        let kb = match self.handle.snapshot() {
            Some(kb) if !kb.is_empty() => kb,
            _ => return Err(KnowledgeBaseError::Empty.into()),
        };
        if kb.model() != self.embedder.model_name() {
            return Err(PipelineError::Embedding(format!(
                "knowledge base was built with '{}', query embedder is '{}'",
                kb.model(),
                self.embedder.model_name()
            )));
        }

        let vector = self
            .embedder
            .embed(&[query.to_string()])
            .await
            .map_err(|e| PipelineError::Embedding(e.to_string()))?
            .into_iter()
            .next()
            .ok_or_else(|| PipelineError::Embedding("empty embedding response".to_string()))?;
        if vector.len() != kb.dims() {
            return Err(KnowledgeBaseError::DimensionMismatch {
                expected: kb.dims(),
                got: vector.len(),
            }
            .into());
        }

        let params = SearchParams {
            top_k: k.max(1),
            min_score: self.min_score,
        };
        let evidence = kb
            .retrieve(&vector, &params)
            .map_err(|e| PipelineError::Embedding(e.to_string()))?;
        tracing::debug!(query, k, hits = evidence.len(), generation = kb.generation(), "retrieved evidence");
        Ok(evidence)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;
    use testbrain_core::embedding::HashEmbedder;

    fn fast_retry() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 2,
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(1),
        }
    }

    fn indexer(embedder: Arc<dyn EmbeddingProvider>) -> Indexer {
        Indexer::new(embedder, 200, 20, 8, fast_retry())
    }

    fn doc(id: &str, name: &str, text: &str) -> SourceDocument {
        SourceDocument::new(id, name, DocumentFormat::Markdown, text.as_bytes().to_vec())
    }

    /// Fails every text containing "poison", batch or single.
    struct PoisonEmbedder {
        inner: HashEmbedder,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl EmbeddingProvider for PoisonEmbedder {
        fn model_name(&self) -> &str {
            self.inner.model_name()
        }
        fn dims(&self) -> usize {
            self.inner.dims()
        }
        async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if texts.iter().any(|t| t.contains("poison")) {
                anyhow::bail!("model crashed");
            }
            self.inner.embed(texts).await
        }
    }

    #[tokio::test]
    async fn build_then_retrieve() {
        let handle = Arc::new(KnowledgeBaseHandle::new());
        let embedder: Arc<dyn EmbeddingProvider> = Arc::new(HashEmbedder::new(128));
        let report = handle
            .build(
                &[
                    doc("d1", "specs.md", "Valid discount code: SAVE15 gives 15% off"),
                    doc("d2", "shipping.md", "Express shipping costs ten dollars"),
                ],
                &indexer(embedder.clone()),
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        assert!(report.success);
        assert_eq!(report.generation, 1);
        assert_eq!(report.chunk_count, 2);
        assert!(report.warnings.is_empty());

        let retriever = Retriever::new(handle.clone(), embedder, 0.0);
        let ev = retriever.retrieve("discount code test cases", 5).await.unwrap();
        assert_eq!(ev.items[0].document_name, "specs.md");
    }

    #[tokio::test]
    async fn retrieve_before_build_is_empty_kb() {
        let handle = Arc::new(KnowledgeBaseHandle::new());
        let retriever = Retriever::new(handle, Arc::new(HashEmbedder::new(16)), 0.0);
        let err = retriever.retrieve("anything", 5).await.unwrap_err();
        assert!(matches!(err, PipelineError::EmptyKnowledgeBase));
    }

    #[tokio::test]
    async fn zero_document_build_is_unsuccessful_and_empty() {
        let handle = Arc::new(KnowledgeBaseHandle::new());
        let embedder: Arc<dyn EmbeddingProvider> = Arc::new(HashEmbedder::new(16));
        let report = handle
            .build(&[], &indexer(embedder.clone()), &CancellationToken::new())
            .await
            .unwrap();
        assert!(!report.success);
        assert_eq!(report.chunk_count, 0);
        assert!(!handle.is_ready());

        let err = Retriever::new(handle, embedder, 0.0)
            .retrieve("anything", 5)
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::EmptyKnowledgeBase));
    }

    #[tokio::test]
    async fn parse_failures_and_empty_docs_are_warnings() {
        let handle = KnowledgeBaseHandle::new();
        let bad = SourceDocument::new("d2", "bad.json", DocumentFormat::StructuredData, b"{oops".to_vec());
        let report = handle
            .build(
                &[doc("d1", "ok.md", "hello world"), bad, doc("d3", "blank.md", "  \n\n ")],
                &indexer(Arc::new(HashEmbedder::new(16))),
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        assert!(report.success);
        assert_eq!(report.warnings.len(), 2);
        assert_eq!(report.warnings[0].document, "bad.json");
        assert_eq!(report.warnings[1].document, "blank.md");
        let statuses: Vec<_> = report.documents.iter().map(|d| d.status).collect();
        assert_eq!(
            statuses,
            vec![DocumentStatus::Indexed, DocumentStatus::Skipped, DocumentStatus::Empty]
        );
    }

    #[tokio::test]
    async fn failing_chunks_are_dropped_after_retries() {
        let handle = KnowledgeBaseHandle::new();
        let embedder = Arc::new(PoisonEmbedder {
            inner: HashEmbedder::new(16),
            calls: AtomicUsize::new(0),
        });
        let report = handle
            .build(
                &[doc("d1", "a.md", "good text"), doc("d2", "b.md", "poison text")],
                &indexer(embedder.clone()),
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        assert_eq!(report.chunk_count, 1);
        assert_eq!(report.warnings.len(), 1);
        assert_eq!(report.warnings[0].chunk.as_deref(), Some("d2:0"));
        // 1 batch + 1 retry for the good chunk + 2 attempts for the bad one
        assert_eq!(embedder.calls.load(Ordering::SeqCst), 4);
        let kb = handle.snapshot().unwrap();
        assert!(kb.chunk("d2:0").is_none());
        assert_eq!(kb.document("d2").unwrap().chunk_count, 0);
    }

    #[tokio::test]
    async fn rebuild_replaces_snapshot_and_old_readers_keep_theirs() {
        let handle = KnowledgeBaseHandle::new();
        let ix = indexer(Arc::new(HashEmbedder::new(16)));
        let cancel = CancellationToken::new();
        handle.build(&[doc("d1", "a.md", "alpha")], &ix, &cancel).await.unwrap();
        let old = handle.snapshot().unwrap();

        let report = handle.build(&[doc("d2", "b.md", "beta")], &ix, &cancel).await.unwrap();
        assert_eq!(report.generation, 2);

        let new = handle.snapshot().unwrap();
        assert_eq!(old.generation(), 1);
        assert!(old.chunk("d1:0").is_some());
        assert!(new.chunk("d1:0").is_none());
        assert!(new.chunk("d2:0").is_some());
    }

    #[tokio::test]
    async fn concurrent_build_is_rejected() {
        let handle = KnowledgeBaseHandle::new();
        let _held = handle.build_lock.try_lock().unwrap();
        assert!(handle.is_building());
        let err = handle
            .build(
                &[doc("d1", "a.md", "alpha")],
                &indexer(Arc::new(HashEmbedder::new(16))),
                &CancellationToken::new(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, KnowledgeBaseError::BuildInProgress));
    }

    #[tokio::test]
    async fn cancelled_build_keeps_previous_snapshot() {
        let handle = KnowledgeBaseHandle::new();
        let ix = indexer(Arc::new(HashEmbedder::new(16)));
        handle
            .build(&[doc("d1", "a.md", "alpha")], &ix, &CancellationToken::new())
            .await
            .unwrap();

        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = handle
            .build(&[doc("d2", "b.md", "beta")], &ix, &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, KnowledgeBaseError::Cancelled));
        assert_eq!(handle.snapshot().unwrap().generation(), 1);
    }

    #[tokio::test]
    async fn clear_drops_snapshot() {
        let handle = KnowledgeBaseHandle::new();
        handle
            .build(
                &[doc("d1", "a.md", "alpha")],
                &indexer(Arc::new(HashEmbedder::new(16))),
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        assert!(handle.is_ready());
        handle.clear();
        assert!(handle.snapshot().is_none());
    }

    #[tokio::test]
    async fn duplicate_documents_are_indexed_once() {
        let handle = KnowledgeBaseHandle::new();
        let d = doc("d1", "a.md", "alpha beta gamma");
        let report = handle
            .build(
                &[d.clone(), d],
                &indexer(Arc::new(HashEmbedder::new(16))),
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        assert!(report.success);
        assert_eq!(report.chunk_count, 1);
        assert_eq!(report.documents.len(), 1);
        assert_eq!(report.warnings.len(), 1);
        assert!(report.warnings[0].message.contains("more than once"));
        assert_eq!(handle.snapshot().unwrap().len(), 1);
    }
}
