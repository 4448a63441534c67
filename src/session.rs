//! One knowledge-base session: uploads, build, generation, and the
//! append-only stores of generated test cases and scripts.
//!
//! The session is the boundary the web or CLI layer talks to. All methods
//! take `&self`, so a `Session` can be shared behind an `Arc` by concurrent
//! request handlers. The knowledge base itself is swapped atomically by
//! [`KnowledgeBaseHandle`]; the stores only ever grow by whole batches after
//! an operation has fully succeeded, so a cancelled call leaves no trace.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use arc_swap::ArcSwap;
use chrono::{DateTime, Utc};
use serde::Serialize;
use testbrain_core::embedding::EmbeddingProvider;
use testbrain_core::models::{DocumentFormat, ElementMap, GeneratedScript, SourceDocument, TestCase};
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::backend::{create_backend, BackendAdapter, CompletionOptions, GenerationBackend, RetryPolicy};
use crate::config::Config;
use crate::elements::element_map_from_html;
use crate::embedding::create_provider;
use crate::error::{KnowledgeBaseError, NormalizeError, PipelineError};
use crate::generator::{GenerationOutcome, Generator};
use crate::index::{BuildReport, BuildWarning, Indexer, KnowledgeBaseHandle, Retriever};
use crate::normalize::decode_text;
use crate::synthesizer::Synthesizer;

/// Listing entry for an uploaded document.
#[derive(Debug, Clone, Serialize)]
pub struct DocumentInfo {
    pub id: String,
    pub name: String,
    pub format: DocumentFormat,
    pub bytes: usize,
    pub uploaded_at: DateTime<Utc>,
}

impl From<&SourceDocument> for DocumentInfo {
    fn from(doc: &SourceDocument) -> Self {
        Self {
            id: doc.id.clone(),
            name: doc.name.clone(),
            format: doc.format,
            bytes: doc.content.len(),
            uploaded_at: doc.uploaded_at,
        }
    }
}

/// A generated test case with the run that produced it.
#[derive(Debug, Clone, Serialize)]
pub struct TestCaseRecord {
    pub run: u64,
    pub query: String,
    pub generated_at: DateTime<Utc>,
    pub case: TestCase,
}

/// Health signal for the outer layer.
#[derive(Debug, Clone, Serialize)]
pub struct Health {
    /// `"ready"`, `"building"`, or `"empty"`.
    pub status: &'static str,
    pub knowledge_base_ready: bool,
    pub generation: u64,
    pub chunk_count: usize,
    pub document_count: usize,
    pub uploaded_documents: usize,
    pub has_element_map: bool,
}

struct Page {
    document: SourceDocument,
    map: Arc<ElementMap>,
}

pub struct Session {
    handle: Arc<KnowledgeBaseHandle>,
    indexer: Indexer,
    generator: Generator,
    synthesizer: Synthesizer,
    documents: RwLock<Vec<SourceDocument>>,
    page: RwLock<Option<Page>>,
    cases: RwLock<Vec<TestCaseRecord>>,
    scripts: RwLock<Vec<GeneratedScript>>,
    runs: AtomicU64,
    cancel: ArcSwap<CancellationToken>,
}

impl Session {
    /// Build a session from config, creating the configured embedding
    /// provider and generation backend.
    pub fn from_config(config: &Config) -> Result<Self> {
        let embedder = create_provider(&config.embedding)?;
        let backend = create_backend(&config.generation)?;
        Ok(Self::new(config, embedder, backend))
    }

    pub fn new(
        config: &Config,
        embedder: Arc<dyn EmbeddingProvider>,
        backend: Arc<dyn GenerationBackend>,
    ) -> Self {
        let handle = Arc::new(KnowledgeBaseHandle::new());
        let retriever = Retriever::new(
            handle.clone(),
            embedder.clone(),
            config.retrieval.min_score,
        );
        let indexer = Indexer::new(
            embedder,
            config.chunking.chunk_size,
            config.chunking.chunk_overlap,
            config.embedding.batch_size,
            RetryPolicy {
                max_attempts: config.embedding.max_retries + 1,
                initial_backoff: Duration::from_secs(1),
                max_backoff: Duration::from_secs(32),
            },
        );
        let adapter = BackendAdapter::new(backend, config.generation.retry_policy());
        let generator = Generator::new(
            retriever.clone(),
            adapter.clone(),
            CompletionOptions::from_config(&config.generation, config.generation.temperature),
            config.retrieval.top_k,
        );
        let synthesizer = Synthesizer::new(
            adapter,
            CompletionOptions::from_config(
                &config.generation,
                config.generation.script_temperature,
            ),
            Some(retriever),
            config.retrieval.top_k,
            config.script.max_attempts,
            config.script.framework.clone(),
        );

        Self {
            handle,
            indexer,
            generator,
            synthesizer,
            documents: RwLock::new(Vec::new()),
            page: RwLock::new(None),
            cases: RwLock::new(Vec::new()),
            scripts: RwLock::new(Vec::new()),
            runs: AtomicU64::new(0),
            cancel: ArcSwap::from_pointee(CancellationToken::new()),
        }
    }

    // ============ Uploads ============

    /// Upload a raw document with a declared format tag. Returns its id.
    pub async fn upload_document(
        &self,
        name: &str,
        format_tag: &str,
        content: Vec<u8>,
    ) -> Result<String, NormalizeError> {
        let format = DocumentFormat::from_tag(format_tag)
            .ok_or_else(|| NormalizeError::UnsupportedFormat(format_tag.to_string()))?;
        let id = Uuid::new_v4().to_string();
        self.add_document(SourceDocument::new(id.clone(), name, format, content))
            .await;
        Ok(id)
    }

    /// Add a prepared document. A document with the same id is replaced.
    pub async fn add_document(&self, doc: SourceDocument) {
        let mut docs = self.documents.write().await;
        tracing::debug!(document = %doc.name, format = %doc.format, "document uploaded");
        match docs.iter_mut().find(|d| d.id == doc.id) {
            Some(existing) => *existing = doc,
            None => docs.push(doc),
        }
    }

    pub async fn documents(&self) -> Vec<DocumentInfo> {
        self.documents.read().await.iter().map(DocumentInfo::from).collect()
    }

    /// Upload the target page markup. Replaces any previous page and its
    /// element map. The page is also indexed as a document on the next
    /// build.
    pub async fn upload_page(&self, name: &str, content: Vec<u8>) -> Result<Arc<ElementMap>, NormalizeError> {
        let map = Arc::new(element_map_from_html(&decode_text(&content))?);
        tracing::info!(page = name, elements = map.len(), ids = map.ids.len(), "page markup uploaded");
        let document = SourceDocument::new(
            Uuid::new_v4().to_string(),
            name,
            DocumentFormat::Markup,
            content,
        );
        *self.page.write().await = Some(Page {
            document,
            map: map.clone(),
        });
        Ok(map)
    }

    pub async fn element_map(&self) -> Option<Arc<ElementMap>> {
        self.page.read().await.as_ref().map(|p| p.map.clone())
    }

    // ============ Build ============

    /// Build a new knowledge base. `selection` restricts the build to the
    /// given document ids; `None` builds every uploaded document plus the
    /// page markup.
    pub async fn build(&self, selection: Option<&[String]>) -> Result<BuildReport, KnowledgeBaseError> {
        let mut inputs: Vec<SourceDocument> = Vec::new();
        let mut missing = Vec::new();
        {
            let docs = self.documents.read().await;
            let page = self.page.read().await;
            let all = docs.iter().chain(page.as_ref().map(|p| &p.document));
            match selection {
                None => inputs.extend(all.cloned()),
                Some(ids) => {
                    let all: Vec<&SourceDocument> = all.collect();
                    for id in ids {
                        match all.iter().find(|d| &d.id == id) {
                            Some(d) => inputs.push((*d).clone()),
                            None => missing.push(id.clone()),
                        }
                    }
                }
            }
        }

        let cancel = self.cancel.load().child_token();
        let mut report = self.handle.build(&inputs, &self.indexer, &cancel).await?;
        for id in missing {
            tracing::warn!(document = %id, "selected document was never uploaded");
            report.warnings.push(BuildWarning {
                document: id,
                chunk: None,
                message: "no uploaded document has this id".to_string(),
            });
        }
        Ok(report)
    }

    /// Drop the knowledge base and every uploaded document and page.
    pub async fn clear(&self) {
        self.handle.clear();
        self.documents.write().await.clear();
        *self.page.write().await = None;
        tracing::info!("session cleared");
    }

    pub async fn health(&self) -> Health {
        let snapshot = self.handle.snapshot();
        let ready = snapshot.as_ref().map(|kb| !kb.is_empty()).unwrap_or(false);
        let status = if self.handle.is_building() {
            "building"
        } else if ready {
            "ready"
        } else {
            "empty"
        };
        Health {
            status,
            knowledge_base_ready: ready,
            generation: snapshot.as_ref().map(|kb| kb.generation()).unwrap_or(0),
            chunk_count: snapshot.as_ref().map(|kb| kb.len()).unwrap_or(0),
            document_count: snapshot.as_ref().map(|kb| kb.documents().len()).unwrap_or(0),
            uploaded_documents: self.documents.read().await.len(),
            has_element_map: self.page.read().await.is_some(),
        }
    }

    // ============ Generation ============

    /// Generate grounded test cases and append them to the store.
    pub async fn generate(&self, query: &str, max_cases: usize) -> Result<GenerationOutcome, PipelineError> {
        let cancel = self.cancel.load().child_token();
        let outcome = self.generator.generate(query, max_cases, &cancel).await?;
        if cancel.is_cancelled() {
            return Err(PipelineError::Cancelled);
        }

        let run = self.runs.fetch_add(1, Ordering::SeqCst) + 1;
        let now = Utc::now();
        self.cases
            .write()
            .await
            .extend(outcome.cases.iter().cloned().map(|case| TestCaseRecord {
                run,
                query: query.to_string(),
                generated_at: now,
                case,
            }));
        Ok(outcome)
    }

    /// Synthesize a script for a stored test case against the current
    /// element map. Rejected scripts are stored too.
    pub async fn generate_script(&self, test_case_id: &str) -> Result<GeneratedScript, PipelineError> {
        let case = self
            .test_case(test_case_id)
            .await
            .ok_or_else(|| PipelineError::UnknownTestCase(test_case_id.to_string()))?;
        let map = self.element_map().await.ok_or(PipelineError::NoElementMap)?;

        let cancel = self.cancel.load().child_token();
        let result = self.synthesizer.synthesize(&case, &map, &cancel).await;
        if cancel.is_cancelled() {
            return Err(PipelineError::Cancelled);
        }

        match result {
            Ok(script) => {
                self.scripts.write().await.push(script.clone());
                Ok(script)
            }
            Err(PipelineError::SelectorMismatch {
                test_case_id,
                selectors,
                script,
            }) => {
                self.scripts.write().await.push((*script).clone());
                Err(PipelineError::SelectorMismatch {
                    test_case_id,
                    selectors,
                    script,
                })
            }
            Err(e) => Err(e),
        }
    }

    /// Cancel every in-flight operation. Later operations are unaffected.
    pub fn cancel_all(&self) {
        let previous = self.cancel.swap(Arc::new(CancellationToken::new()));
        previous.cancel();
        tracing::info!("in-flight operations cancelled");
    }

    // ============ Stores ============

    /// Most recent test case with this id.
    pub async fn test_case(&self, id: &str) -> Option<TestCase> {
        self.cases
            .read()
            .await
            .iter()
            .rev()
            .find(|r| r.case.id == id)
            .map(|r| r.case.clone())
    }

    /// Test case with this id from a specific generation run.
    pub async fn test_case_in_run(&self, run: u64, id: &str) -> Option<TestCase> {
        self.cases
            .read()
            .await
            .iter()
            .find(|r| r.run == run && r.case.id == id)
            .map(|r| r.case.clone())
    }

    pub async fn test_cases(&self) -> Vec<TestCaseRecord> {
        self.cases.read().await.clone()
    }

    /// Remove every stored test case with this id. Returns how many were
    /// removed.
    pub async fn discard_test_case(&self, id: &str) -> usize {
        let mut cases = self.cases.write().await;
        let before = cases.len();
        cases.retain(|r| r.case.id != id);
        before - cases.len()
    }

    pub async fn scripts(&self) -> Vec<GeneratedScript> {
        self.scripts.read().await.clone()
    }

    pub async fn script(&self, id: &str) -> Option<GeneratedScript> {
        self.scripts.read().await.iter().find(|s| s.id == id).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::ScriptedBackend;
    use testbrain_core::embedding::HashEmbedder;

    fn session(replies: Vec<&str>) -> (Session, Arc<ScriptedBackend>) {
        let backend = Arc::new(ScriptedBackend::replying(replies));
        let s = Session::new(&Config::default(), Arc::new(HashEmbedder::new(64)), backend.clone());
        (s, backend)
    }

    #[tokio::test]
    async fn unsupported_format_tag_is_rejected() {
        let (s, _) = session(vec![]);
        let err = s.upload_document("a.docx", "docx", b"x".to_vec()).await.unwrap_err();
        assert_eq!(err, NormalizeError::UnsupportedFormat("docx".into()));
        assert!(s.documents().await.is_empty());
    }

    #[tokio::test]
    async fn health_tracks_build() {
        let (s, _) = session(vec![]);
        let h = s.health().await;
        assert_eq!(h.status, "empty");
        assert!(!h.knowledge_base_ready);

        s.upload_document("a.md", "md", b"alpha beta".to_vec()).await.unwrap();
        s.build(None).await.unwrap();
        let h = s.health().await;
        assert_eq!(h.status, "ready");
        assert_eq!(h.generation, 1);
        assert_eq!(h.chunk_count, 1);
        assert_eq!(h.document_count, 1);
        assert_eq!(h.uploaded_documents, 1);
    }

    #[tokio::test]
    async fn build_selection_reports_unknown_ids() {
        let (s, _) = session(vec![]);
        let keep = s.upload_document("a.md", "md", b"alpha".to_vec()).await.unwrap();
        s.upload_document("b.md", "md", b"beta".to_vec()).await.unwrap();
        let report = s
            .build(Some(&[keep.clone(), "ghost".to_string()]))
            .await
            .unwrap();
        assert_eq!(report.documents.len(), 1);
        assert_eq!(report.documents[0].document_id, keep);
        assert_eq!(report.warnings.len(), 1);
        assert_eq!(report.warnings[0].document, "ghost");
    }

    #[tokio::test]
    async fn page_is_indexed_by_default() {
        let (s, _) = session(vec![]);
        s.upload_page("checkout.html", br#"<button id="pay-button">Pay now</button>"#.to_vec())
            .await
            .unwrap();
        let report = s.build(None).await.unwrap();
        assert!(report.success);
        assert_eq!(report.documents[0].name, "checkout.html");
        assert!(s.element_map().await.unwrap().has_id("pay-button"));
    }

    #[tokio::test]
    async fn script_needs_case_and_page() {
        let (s, _) = session(vec![]);
        assert!(matches!(
            s.generate_script("TC-001").await,
            Err(PipelineError::UnknownTestCase(_))
        ));
    }

    #[tokio::test]
    async fn add_document_replaces_same_id() {
        let (s, _) = session(vec![]);
        s.add_document(SourceDocument::new("x", "x.md", DocumentFormat::Markdown, b"one".to_vec()))
            .await;
        s.add_document(SourceDocument::new("x", "x.md", DocumentFormat::Markdown, b"two".to_vec()))
            .await;
        let docs = s.documents().await;
        assert_eq!(docs.len(), 1);
        assert_eq!(docs[0].bytes, 3);
    }

    #[tokio::test]
    async fn clear_drops_everything() {
        let (s, _) = session(vec![]);
        s.upload_document("a.md", "md", b"alpha".to_vec()).await.unwrap();
        s.build(None).await.unwrap();
        s.clear().await;
        assert!(s.documents().await.is_empty());
        assert!(!s.health().await.knowledge_base_ready);
        assert!(matches!(
            s.generate("alpha", 1).await,
            Err(PipelineError::EmptyKnowledgeBase)
        ));
    }

    #[tokio::test]
    async fn health_waits_for_writers() {
        let (s, _) = session(vec![]);
        s.upload_document("a.md", "md", b"alpha".to_vec()).await.unwrap();
        s.upload_page("checkout.html", br#"<button id="pay-button">Pay</button>"#.to_vec())
            .await
            .unwrap();

        let guard = s.documents.write().await;
        let (h, _) = tokio::join!(s.health(), async move {
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
            drop(guard);
        });
        assert_eq!(h.uploaded_documents, 1);
        assert!(h.has_element_map);
    }

    #[tokio::test]
    async fn repeated_selection_builds_once() {
        let (s, _) = session(vec![]);
        let id = s.upload_document("a.md", "md", b"alpha beta".to_vec()).await.unwrap();
        let report = s.build(Some(&[id.clone(), id.clone()])).await.unwrap();
        assert!(report.success);
        assert_eq!(report.documents.len(), 1);
        assert_eq!(report.chunk_count, 1);
        assert_eq!(s.health().await.document_count, 1);
    }
}
