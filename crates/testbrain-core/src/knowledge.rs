//! Immutable knowledge-base snapshots.
//!
//! A [`KnowledgeBase`] is built once by a [`KnowledgeBaseBuilder`] and never
//! mutated afterwards. Rebuilding produces a whole new snapshot; readers
//! holding an `Arc` to the old one keep a consistent view until they drop it.
//!
//! The builder enforces the single-model invariant: every vector pushed must
//! have the dimensionality declared when the builder was created.

use std::collections::HashMap;

use anyhow::{bail, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::models::{Chunk, DocumentFormat, EmbeddingRecord, Evidence, RetrievedEvidence};
use crate::search::{rank, SearchParams};

/// Metadata for one document that contributed chunks to a snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct DocumentEntry {
    pub id: String,
    pub name: String,
    pub format: DocumentFormat,
    pub chunk_count: usize,
}

struct IndexedChunk {
    chunk: Chunk,
    record: EmbeddingRecord,
}

/// A queryable vector index over chunks, plus the reverse index from chunk
/// id to chunk and source document.
pub struct KnowledgeBase {
    generation: u64,
    model: String,
    dims: usize,
    built_at: DateTime<Utc>,
    documents: Vec<DocumentEntry>,
    entries: Vec<IndexedChunk>,
    by_chunk: HashMap<String, usize>,
    by_document: HashMap<String, usize>,
}

impl KnowledgeBase {
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub fn dims(&self) -> usize {
        self.dims
    }

    pub fn built_at(&self) -> DateTime<Utc> {
        self.built_at
    }

    /// Number of indexed chunks.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn documents(&self) -> &[DocumentEntry] {
        &self.documents
    }

    pub fn document(&self, id: &str) -> Option<&DocumentEntry> {
        self.by_document.get(id).map(|&i| &self.documents[i])
    }

    pub fn chunk(&self, chunk_id: &str) -> Option<&Chunk> {
        self.by_chunk.get(chunk_id).map(|&i| &self.entries[i].chunk)
    }

    /// The document a chunk was cut from.
    pub fn document_for_chunk(&self, chunk_id: &str) -> Option<&DocumentEntry> {
        self.chunk(chunk_id)
            .and_then(|c| self.document(&c.document_id))
    }

    /// Rank every indexed chunk against an already-embedded query.
    ///
    /// # Errors
    ///
    /// Fails if `query` has the wrong dimensionality or `top_k` is zero.
    pub fn retrieve(&self, query: &[f32], params: &SearchParams) -> Result<RetrievedEvidence> {
        if query.len() != self.dims {
            bail!(
                "query vector has {} dims, knowledge base uses {}",
                query.len(),
                self.dims
            );
        }

        let ranked = rank(
            query,
            self.entries.iter().map(|e| e.record.vector.as_slice()),
            params,
        )?;

        let items = ranked
            .into_iter()
            .map(|r| {
                let entry = &self.entries[r.index];
                let document_name = self
                    .document(&entry.chunk.document_id)
                    .map(|d| d.name.clone())
                    .unwrap_or_else(|| entry.chunk.document_id.clone());
                Evidence {
                    chunk: entry.chunk.clone(),
                    document_name,
                    score: r.score,
                }
            })
            .collect();

        Ok(RetrievedEvidence::new(items))
    }
}

impl std::fmt::Debug for KnowledgeBase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KnowledgeBase")
            .field("generation", &self.generation)
            .field("model", &self.model)
            .field("dims", &self.dims)
            .field("documents", &self.documents.len())
            .field("chunks", &self.entries.len())
            .finish()
    }
}

/// Accumulates documents, chunks, and vectors for one snapshot.
pub struct KnowledgeBaseBuilder {
    model: String,
    dims: usize,
    documents: Vec<DocumentEntry>,
    entries: Vec<IndexedChunk>,
    by_chunk: HashMap<String, usize>,
    by_document: HashMap<String, usize>,
}

impl KnowledgeBaseBuilder {
    pub fn new(model: impl Into<String>, dims: usize) -> Self {
        Self {
            model: model.into(),
            dims,
            documents: Vec::new(),
            entries: Vec::new(),
            by_chunk: HashMap::new(),
            by_document: HashMap::new(),
        }
    }

    /// Register a document. Must precede pushing any of its chunks.
    pub fn add_document(
        &mut self,
        id: impl Into<String>,
        name: impl Into<String>,
        format: DocumentFormat,
    ) -> Result<()> {
        let id = id.into();
        if self.by_document.contains_key(&id) {
            bail!("document {} registered twice", id);
        }
        self.by_document.insert(id.clone(), self.documents.len());
        self.documents.push(DocumentEntry {
            id,
            name: name.into(),
            format,
            chunk_count: 0,
        });
        Ok(())
    }

    /// Index one chunk with its embedding vector.
    ///
    /// # Errors
    ///
    /// Fails on an unregistered document, a duplicate chunk id, or a vector
    /// whose dimensionality differs from the builder's.
    pub fn push(&mut self, chunk: Chunk, vector: Vec<f32>) -> Result<()> {
        if vector.len() != self.dims {
            bail!(
                "chunk {} has a {}-dim vector, expected {}",
                chunk.id,
                vector.len(),
                self.dims
            );
        }
        let doc_idx = match self.by_document.get(&chunk.document_id) {
            Some(&i) => i,
            None => bail!(
                "chunk {} belongs to unregistered document {}",
                chunk.id,
                chunk.document_id
            ),
        };
        if self.by_chunk.contains_key(&chunk.id) {
            bail!("chunk {} indexed twice", chunk.id);
        }

        self.documents[doc_idx].chunk_count += 1;
        self.by_chunk.insert(chunk.id.clone(), self.entries.len());
        self.entries.push(IndexedChunk {
            record: EmbeddingRecord {
                chunk_id: chunk.id.clone(),
                vector,
            },
            chunk,
        });
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn finish(self, generation: u64) -> KnowledgeBase {
        KnowledgeBase {
            generation,
            model: self.model,
            dims: self.dims,
            built_at: Utc::now(),
            documents: self.documents,
            entries: self.entries,
            by_chunk: self.by_chunk,
            by_document: self.by_document,
        }
    }
}
