//! Core data models used throughout testbrain.
//!
//! These types represent the source documents, chunks, retrieved evidence,
//! test cases, element maps, and generated scripts that flow through the
//! build and generation pipeline. Everything here is immutable once
//! constructed; regeneration produces new values rather than mutating old ones.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Declared format of an ingested document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DocumentFormat {
    Markdown,
    Text,
    StructuredData,
    Pdf,
    Markup,
}

impl DocumentFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            DocumentFormat::Markdown => "markdown",
            DocumentFormat::Text => "text",
            DocumentFormat::StructuredData => "structured-data",
            DocumentFormat::Pdf => "pdf",
            DocumentFormat::Markup => "markup",
        }
    }

    /// Parse a format tag. Accepts the canonical names plus common aliases
    /// (`md`, `txt`, `json`, `html`).
    pub fn from_tag(tag: &str) -> Option<Self> {
        match tag.trim().trim_start_matches('.').to_ascii_lowercase().as_str() {
            "markdown" | "md" => Some(DocumentFormat::Markdown),
            "text" | "txt" | "plain" => Some(DocumentFormat::Text),
            "structured-data" | "structured" | "json" => Some(DocumentFormat::StructuredData),
            "pdf" => Some(DocumentFormat::Pdf),
            "markup" | "html" | "htm" => Some(DocumentFormat::Markup),
            _ => None,
        }
    }

    /// Infer the format from a file name's extension.
    pub fn from_path(path: &Path) -> Option<Self> {
        let ext = path.extension()?.to_str()?;
        match ext.to_ascii_lowercase().as_str() {
            "markdown" => Some(DocumentFormat::Markdown),
            other => Self::from_tag(other),
        }
    }
}

impl fmt::Display for DocumentFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A raw uploaded document, before normalization.
#[derive(Debug, Clone)]
pub struct SourceDocument {
    pub id: String,
    /// Display name, usually the original file name. This is what test
    /// cases cite in `grounded_in`.
    pub name: String,
    pub format: DocumentFormat,
    pub content: Vec<u8>,
    pub uploaded_at: DateTime<Utc>,
}

impl SourceDocument {
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        format: DocumentFormat,
        content: impl Into<Vec<u8>>,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            format,
            content: content.into(),
            uploaded_at: Utc::now(),
        }
    }
}

/// A bounded text segment of one normalized document.
///
/// `start` and `end` are character offsets into the normalized text.
/// Consecutive chunks of the same document share exactly `overlap`
/// characters: `next.start == prev.end - overlap`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Chunk {
    pub id: String,
    pub document_id: String,
    pub ordinal: usize,
    pub start: usize,
    pub end: usize,
    /// Characters shared with the previous chunk (0 for the first chunk).
    pub overlap: usize,
    pub text: String,
    /// SHA-256 of `text`, hex encoded.
    pub hash: String,
}

impl Chunk {
    pub fn char_len(&self) -> usize {
        self.end - self.start
    }
}

/// One embedding vector, keyed 1:1 by chunk id.
#[derive(Debug, Clone, PartialEq)]
pub struct EmbeddingRecord {
    pub chunk_id: String,
    pub vector: Vec<f32>,
}

/// A retrieved chunk with provenance and its similarity score.
#[derive(Debug, Clone, Serialize)]
pub struct Evidence {
    pub chunk: Chunk,
    pub document_name: String,
    pub score: f32,
}

/// Ordered retrieval result, sorted by descending score.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RetrievedEvidence {
    pub items: Vec<Evidence>,
}

impl RetrievedEvidence {
    pub fn new(items: Vec<Evidence>) -> Self {
        Self { items }
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Evidence> {
        self.items.iter()
    }

    /// Distinct source documents, in first-seen (rank) order.
    pub fn sources(&self) -> Vec<EvidenceSource> {
        let mut seen = BTreeSet::new();
        let mut out = Vec::new();
        for e in &self.items {
            if seen.insert(e.chunk.document_id.clone()) {
                out.push(EvidenceSource {
                    document_id: e.chunk.document_id.clone(),
                    document_name: e.document_name.clone(),
                });
            }
        }
        out
    }

    /// Resolve a citation token to the cited document, if it names one of
    /// the retrieved sources. Matching is by document name or id, trimmed
    /// and case-insensitive.
    pub fn resolve_citation(&self, citation: &str) -> Option<EvidenceSource> {
        let wanted = citation.trim().to_lowercase();
        if wanted.is_empty() {
            return None;
        }
        self.sources().into_iter().find(|s| {
            s.document_name.to_lowercase() == wanted || s.document_id.to_lowercase() == wanted
        })
    }
}

/// A source document present in a [`RetrievedEvidence`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EvidenceSource {
    pub document_id: String,
    pub document_name: String,
}

/// Classification tag on a test case.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TestCategory {
    Positive,
    Negative,
    Edge,
}

impl TestCategory {
    pub fn from_tag(tag: &str) -> Option<Self> {
        match tag.trim().to_ascii_lowercase().as_str() {
            "positive" | "happy" | "happy-path" | "happy_path" => Some(TestCategory::Positive),
            "negative" | "error" => Some(TestCategory::Negative),
            "edge" | "edge-case" | "edge_case" | "boundary" => Some(TestCategory::Edge),
            _ => None,
        }
    }
}

/// A single test step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Step {
    pub action: String,
    #[serde(default)]
    pub expected: String,
}

/// A validated, documentation-grounded test case.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestCase {
    #[serde(rename = "test_id")]
    pub id: String,
    pub feature: String,
    #[serde(rename = "test_scenario")]
    pub title: String,
    pub preconditions: String,
    pub steps: Vec<Step>,
    pub expected_result: String,
    /// Source documents this case relies on. Every entry names a document
    /// that was present in the evidence used to generate the case.
    pub grounded_in: Vec<String>,
    pub category: TestCategory,
}

impl TestCase {
    /// Free text of all steps, used for mention checks and prompt rendering.
    pub fn steps_text(&self) -> String {
        self.steps
            .iter()
            .map(|s| {
                if s.expected.is_empty() {
                    s.action.clone()
                } else {
                    format!("{} -> {}", s.action, s.expected)
                }
            })
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// A concrete locator for one page element.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SelectorDescriptor {
    /// Semantic element name (the element map key).
    pub name: String,
    pub tag: String,
    /// `type` attribute for inputs and buttons, empty otherwise.
    pub element_type: String,
    pub id: Option<String>,
    pub name_attr: Option<String>,
    pub classes: Vec<String>,
    /// Preferred CSS selector for this element.
    pub css: String,
    pub xpath: String,
    /// Visible label, placeholder, or text, for prompt context.
    pub label: Option<String>,
    /// Every caption the element shows: label, own text, placeholder, value.
    #[serde(default)]
    pub texts: Vec<String>,
}

/// Mapping from semantic element name to selector descriptor, derived from
/// the target page markup. Immutable per build.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ElementMap {
    pub elements: BTreeMap<String, SelectorDescriptor>,
    /// Every id present on the page, interactive or not.
    pub ids: BTreeSet<String>,
    /// Every class present on the page.
    pub classes: BTreeSet<String>,
    /// Every `name` attribute present on the page.
    pub names: BTreeSet<String>,
    /// Every tag name present on the page.
    pub tags: BTreeSet<String>,
}

impl ElementMap {
    pub fn is_empty(&self) -> bool {
        self.elements.is_empty() && self.ids.is_empty()
    }

    pub fn len(&self) -> usize {
        self.elements.len()
    }

    pub fn get(&self, name: &str) -> Option<&SelectorDescriptor> {
        self.elements.get(name)
    }

    pub fn has_id(&self, id: &str) -> bool {
        self.ids.contains(id)
    }

    pub fn has_class(&self, class: &str) -> bool {
        self.classes.contains(class)
    }

    pub fn has_name(&self, name: &str) -> bool {
        self.names.contains(name)
    }

    pub fn has_tag(&self, tag: &str) -> bool {
        self.tags.contains(&tag.to_ascii_lowercase())
    }

    pub fn insert(&mut self, descriptor: SelectorDescriptor) {
        if let Some(id) = &descriptor.id {
            self.ids.insert(id.clone());
        }
        if let Some(n) = &descriptor.name_attr {
            self.names.insert(n.clone());
        }
        for c in &descriptor.classes {
            self.classes.insert(c.clone());
        }
        self.tags.insert(descriptor.tag.to_ascii_lowercase());
        self.elements.insert(descriptor.name.clone(), descriptor);
    }
}

/// Validation outcome of a generated script.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScriptStatus {
    Accepted,
    Rejected,
}

/// An automation script synthesized from one test case.
#[derive(Debug, Clone, Serialize)]
pub struct GeneratedScript {
    pub id: String,
    pub test_case_id: String,
    pub framework: String,
    pub text: String,
    /// Every selector token the script references, in first-seen order.
    pub selectors_used: Vec<String>,
    /// Selector tokens absent from the element map. Empty when accepted.
    pub unknown_selectors: Vec<String>,
    pub status: ScriptStatus,
    /// Backend calls spent producing this script.
    pub attempts: u32,
}

impl GeneratedScript {
    pub fn is_accepted(&self) -> bool {
        self.status == ScriptStatus::Accepted
    }
}
