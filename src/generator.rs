//! Grounded test-case generation.
//!
//! # Pipeline
//!
//! 1. Retrieve top-K evidence for the query. Empty evidence fails with
//!    [`PipelineError::InsufficientContext`] before the backend is called.
//! 2. Build a prompt restricted to that evidence.
//! 3. Complete through the [`BackendAdapter`] (retry, timeout, cancel).
//! 4. Parse the reply into a [`BackendReply`]: either a typed case list or
//!    `Malformed`. Nothing in the reply is trusted before this step.
//! 5. Drop every case whose `grounded_in` is empty or names a document
//!    absent from the evidence, recording a [`CitationViolation`].
//! 6. Keep at most `max_cases`, in backend order.

use serde::{Deserialize, Serialize};
use testbrain_core::models::{RetrievedEvidence, Step, TestCase, TestCategory};
use tokio_util::sync::CancellationToken;

use crate::backend::{BackendAdapter, CompletionOptions};
use crate::error::{truncate, CitationViolation, PipelineError};
use crate::index::Retriever;
use crate::prompts::test_case_prompt;

const EXCERPT_CHARS: usize = 500;

/// Result of one `generate` call.
#[derive(Debug, Clone, Serialize)]
pub struct GenerationOutcome {
    pub query: String,
    pub cases: Vec<TestCase>,
    /// Cases dropped for fabricated or missing citations.
    pub violations: Vec<CitationViolation>,
    /// The evidence the cases were validated against.
    pub evidence: RetrievedEvidence,
}

/// A backend reply after schema validation.
#[derive(Debug, Clone, PartialEq)]
pub enum BackendReply {
    Cases(Vec<TestCase>),
    Malformed { reason: String, excerpt: String },
}

#[derive(Deserialize)]
struct RawTestCase {
    #[serde(default)]
    test_id: Option<String>,
    #[serde(default)]
    feature: Option<String>,
    #[serde(default, alias = "title")]
    test_scenario: String,
    #[serde(default)]
    preconditions: String,
    #[serde(default)]
    steps: Vec<RawStep>,
    #[serde(default)]
    expected_result: String,
    #[serde(default, alias = "Grounded_In")]
    grounded_in: Vec<String>,
    #[serde(default)]
    category: Option<String>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawStep {
    Text(String),
    Structured {
        action: String,
        #[serde(default)]
        expected: String,
    },
}

impl From<RawStep> for Step {
    fn from(raw: RawStep) -> Self {
        match raw {
            RawStep::Text(action) => Step {
                action,
                expected: String::new(),
            },
            RawStep::Structured { action, expected } => Step { action, expected },
        }
    }
}

impl RawTestCase {
    fn into_test_case(self, ordinal: usize) -> Result<TestCase, String> {
        let category = match self.category.as_deref() {
            None => TestCategory::Positive,
            Some(tag) => TestCategory::from_tag(tag)
                .ok_or_else(|| format!("test case {} has unknown category '{}'", ordinal, tag))?,
        };
        if self.test_scenario.trim().is_empty() && self.steps.is_empty() {
            return Err(format!("test case {} has neither a scenario nor steps", ordinal));
        }
        Ok(TestCase {
            id: self
                .test_id
                .filter(|id| !id.trim().is_empty())
                .unwrap_or_else(|| format!("TC-{:03}", ordinal)),
            feature: self
                .feature
                .filter(|f| !f.trim().is_empty())
                .unwrap_or_else(|| "Unknown".to_string()),
            title: self.test_scenario,
            preconditions: self.preconditions,
            steps: self.steps.into_iter().map(Step::from).collect(),
            expected_result: self.expected_result,
            grounded_in: self.grounded_in,
            category,
        })
    }
}

/// Strip a surrounding markdown code fence (```` ```json ````, ```` ```python ````,
/// or bare ```` ``` ````).
pub fn strip_code_fences(text: &str) -> &str {
    let mut s = text.trim();
    if let Some(rest) = s.strip_prefix("```") {
        s = match rest.find('\n') {
            Some(nl) if !rest[..nl].contains(char::is_whitespace) => &rest[nl + 1..],
            _ => rest,
        };
    }
    if let Some(rest) = s.strip_suffix("```") {
        s = rest;
    }
    s.trim()
}

/// Parse a raw backend reply. Tolerates chatter around the JSON array
/// (first `[` to last `]`) but never coerces mistyped fields.
pub fn parse_reply(text: &str) -> BackendReply {
    let malformed = |reason: String| BackendReply::Malformed {
        reason,
        excerpt: truncate(text, EXCERPT_CHARS).to_string(),
    };

    let body = strip_code_fences(text);
    let json = match (body.find('['), body.rfind(']')) {
        (Some(start), Some(end)) if end > start => &body[start..=end],
        _ => body,
    };

    let raw: Vec<RawTestCase> = match serde_json::from_str(json) {
        Ok(raw) => raw,
        Err(e) => return malformed(format!("expected a JSON array of test cases: {}", e)),
    };

    let mut cases = Vec::with_capacity(raw.len());
    for (i, r) in raw.into_iter().enumerate() {
        match r.into_test_case(i + 1) {
            Ok(case) => cases.push(case),
            Err(reason) => return malformed(reason),
        }
    }
    BackendReply::Cases(cases)
}

/// Check every citation of `case` against `evidence`. On success the
/// citations are rewritten to the canonical document names.
pub fn validate_citations(
    mut case: TestCase,
    evidence: &RetrievedEvidence,
) -> Result<TestCase, CitationViolation> {
    let mut resolved = Vec::with_capacity(case.grounded_in.len());
    let mut unknown = Vec::new();
    for citation in &case.grounded_in {
        match evidence.resolve_citation(citation) {
            Some(source) => {
                if !resolved.contains(&source.document_name) {
                    resolved.push(source.document_name);
                }
            }
            None => unknown.push(citation.clone()),
        }
    }
    if resolved.is_empty() || !unknown.is_empty() {
        return Err(CitationViolation {
            test_case_id: case.id,
            unknown_sources: unknown,
        });
    }
    case.grounded_in = resolved;
    Ok(case)
}

/// Retrieval-augmented test-case generator.
#[derive(Clone)]
pub struct Generator {
    retriever: Retriever,
    adapter: BackendAdapter,
    options: CompletionOptions,
    top_k: usize,
}

impl Generator {
    pub fn new(
        retriever: Retriever,
        adapter: BackendAdapter,
        options: CompletionOptions,
        top_k: usize,
    ) -> Self {
        Self {
            retriever,
            adapter,
            options,
            top_k,
        }
    }

    /// Generate at most `max_cases` grounded test cases for `query`.
    ///
    /// # Errors
    ///
    /// - [`PipelineError::EmptyKnowledgeBase`] before a non-empty build.
    /// - [`PipelineError::InsufficientContext`] when no evidence matches.
    /// - [`PipelineError::GenerationBackend`] after retries are exhausted
    ///   or on a non-transient failure.
    /// - [`PipelineError::ResponseSchema`] when the reply is not a valid
    ///   test-case array.
    pub async fn generate(
        &self,
        query: &str,
        max_cases: usize,
        cancel: &CancellationToken,
    ) -> Result<GenerationOutcome, PipelineError> {
        if cancel.is_cancelled() {
            return Err(PipelineError::Cancelled);
        }

        let evidence = self.retriever.retrieve(query, self.top_k).await?;
        if evidence.is_empty() {
            tracing::warn!(query, "no evidence retrieved, refusing to generate");
            return Err(PipelineError::InsufficientContext {
                query: query.to_string(),
            });
        }

        let max_cases = max_cases.max(1);
        let prompt = test_case_prompt(query, max_cases, &evidence);
        tracing::info!(
            query,
            evidence = evidence.len(),
            sources = evidence.sources().len(),
            backend = self.adapter.backend_name(),
            "generating test cases"
        );
        let reply = self.adapter.complete(&prompt, &self.options, cancel).await?;

        let parsed = match parse_reply(&reply) {
            BackendReply::Cases(cases) => cases,
            BackendReply::Malformed { reason, excerpt } => {
                tracing::warn!(%reason, "backend reply failed schema validation");
                return Err(PipelineError::ResponseSchema { reason, excerpt });
            }
        };

        let mut cases = Vec::new();
        let mut violations = Vec::new();
        for case in parsed {
            match validate_citations(case, &evidence) {
                Ok(case) => cases.push(case),
                Err(v) => {
                    tracing::warn!(
                        test_case = %v.test_case_id,
                        unknown = ?v.unknown_sources,
                        "dropping test case with unverifiable citations"
                    );
                    violations.push(v);
                }
            }
        }
        cases.truncate(max_cases);

        tracing::info!(
            query,
            accepted = cases.len(),
            dropped = violations.len(),
            "test case generation finished"
        );

        Ok(GenerationOutcome {
            query: query.to_string(),
            cases,
            violations,
            evidence,
        })
    }
}
