//! Script synthesis with static selector validation.
//!
//! Each attempt asks the backend for a script, repairs trivial omissions
//! (code fences, the Selenium import header), extracts every selector the
//! script references, and checks them against the page's [`ElementMap`].
//! A rejected attempt feeds its unknown selectors back into the next
//! prompt. After `max_attempts` the last rejected script is returned inside
//! [`PipelineError::SelectorMismatch`].

use testbrain_core::models::{ElementMap, GeneratedScript, ScriptStatus, TestCase};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::backend::{BackendAdapter, CompletionOptions};
use crate::elements::render_catalogue;
use crate::error::PipelineError;
use crate::generator::strip_code_fences;
use crate::index::Retriever;
use crate::prompts::{render_evidence, script_prompt};
use crate::selectors::{extract_selectors, validate};

const SELENIUM_IMPORTS: &str = "from selenium import webdriver
from selenium.webdriver.common.by import By
from selenium.webdriver.support.ui import WebDriverWait
from selenium.webdriver.support import expected_conditions as EC
from selenium.webdriver.common.keys import Keys

";

const PLAYWRIGHT_IMPORTS: &str = "from playwright.sync_api import sync_playwright, expect

";

/// Clean a raw script reply: drop fences and prepend the framework's
/// imports when the script has none.
pub fn repair_script(reply: &str, framework: &str) -> String {
    let body = strip_code_fences(reply);
    match framework {
        "playwright-python" if !body.contains("playwright") => {
            format!("{}{}", PLAYWRIGHT_IMPORTS, body)
        }
        "selenium-python" if !body.contains("from selenium") => {
            format!("{}{}", SELENIUM_IMPORTS, body)
        }
        _ => body.to_string(),
    }
}

#[derive(Clone)]
pub struct Synthesizer {
    adapter: BackendAdapter,
    options: CompletionOptions,
    /// Supplementary documentation lookup; absent or empty is fine.
    retriever: Option<Retriever>,
    top_k: usize,
    max_attempts: u32,
    framework: String,
}

impl Synthesizer {
    pub fn new(
        adapter: BackendAdapter,
        options: CompletionOptions,
        retriever: Option<Retriever>,
        top_k: usize,
        max_attempts: u32,
        framework: impl Into<String>,
    ) -> Self {
        Self {
            adapter,
            options,
            retriever,
            top_k,
            max_attempts: max_attempts.max(1),
            framework: framework.into(),
        }
    }

    async fn doc_context(&self, case: &TestCase) -> Option<String> {
        let retriever = self.retriever.as_ref()?;
        let query = format!("{} {}", case.feature, case.title);
        match retriever.retrieve(&query, self.top_k).await {
            Ok(evidence) if !evidence.is_empty() => Some(render_evidence(&evidence)),
            Ok(_) => None,
            Err(e) => {
                tracing::debug!(test_case = %case.id, error = %e, "no documentation context for script");
                None
            }
        }
    }

    /// Produce a script for `case` that only touches elements in `map`.
    ///
    /// # Errors
    ///
    /// - [`PipelineError::SelectorMismatch`] when every attempt referenced
    ///   unknown selectors; carries the last rejected script.
    /// - [`PipelineError::GenerationBackend`] / [`PipelineError::Cancelled`]
    ///   from the backend adapter.
    pub async fn synthesize(
        &self,
        case: &TestCase,
        map: &ElementMap,
        cancel: &CancellationToken,
    ) -> Result<GeneratedScript, PipelineError> {
        if cancel.is_cancelled() {
            return Err(PipelineError::Cancelled);
        }

        let catalogue = render_catalogue(map);
        let doc_context = self.doc_context(case).await;
        let mut feedback: Vec<String> = Vec::new();
        let mut attempt = 0u32;

        loop {
            attempt += 1;
            let prompt = script_prompt(
                &self.framework,
                case,
                &catalogue,
                doc_context.as_deref(),
                &feedback,
            );
            let reply = self.adapter.complete(&prompt, &self.options, cancel).await?;
            let text = repair_script(&reply, &self.framework);

            let refs = extract_selectors(&text);
            let (selectors_used, unknown_selectors) = validate(map, &refs);

            let status = if unknown_selectors.is_empty() {
                ScriptStatus::Accepted
            } else {
                ScriptStatus::Rejected
            };
            let script = GeneratedScript {
                id: Uuid::new_v4().to_string(),
                test_case_id: case.id.clone(),
                framework: self.framework.clone(),
                text,
                selectors_used,
                unknown_selectors,
                status,
                attempts: attempt,
            };

            if script.is_accepted() {
                tracing::info!(
                    test_case = %case.id,
                    attempt,
                    selectors = script.selectors_used.len(),
                    "script accepted"
                );
                return Ok(script);
            }

            tracing::warn!(
                test_case = %case.id,
                attempt,
                selector = ?script.unknown_selectors,
                "script references unknown selectors"
            );

            if attempt >= self.max_attempts {
                return Err(PipelineError::SelectorMismatch {
                    test_case_id: case.id.clone(),
                    selectors: script.unknown_selectors.clone(),
                    script: Box::new(script),
                });
            }
            feedback = script.unknown_selectors;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{RetryPolicy, ScriptedBackend};
    use crate::elements::element_map_from_html;
    use std::sync::Arc;
    use std::time::Duration;
    use testbrain_core::models::{Step, TestCategory};

    fn case() -> TestCase {
        TestCase {
            id: "TC-001".into(),
            feature: "Checkout".into(),
            title: "Pay for order".into(),
            preconditions: String::new(),
            steps: vec![Step {
                action: "Click pay".into(),
                expected: "Order placed".into(),
            }],
            expected_result: "Order placed".into(),
            grounded_in: vec!["ui.md".into()],
            category: TestCategory::Positive,
        }
    }

    fn map() -> ElementMap {
        element_map_from_html(r#"<button id="pay-button">Pay</button>"#).unwrap()
    }

    fn synthesizer(backend: Arc<ScriptedBackend>, max_attempts: u32) -> Synthesizer {
        let adapter = BackendAdapter::new(
            backend,
            RetryPolicy {
                max_attempts: 1,
                initial_backoff: Duration::from_millis(1),
                max_backoff: Duration::from_millis(1),
            },
        );
        let options = CompletionOptions {
            model: "m".into(),
            temperature: 0.3,
            max_tokens: 256,
            timeout: Duration::from_secs(5),
        };
        Synthesizer::new(adapter, options, None, 5, max_attempts, "selenium-python")
    }

    #[test]
    fn repair_prepends_selenium_imports_and_strips_fences() {
        let fixed = repair_script("```python\ndriver.find_element(By.ID, 'x')\n```", "selenium-python");
        assert!(fixed.starts_with("from selenium import webdriver\n"));
        assert!(fixed.ends_with("driver.find_element(By.ID, 'x')"));

        let kept = repair_script("from selenium import webdriver\nx = 1", "selenium-python");
        assert_eq!(kept, "from selenium import webdriver\nx = 1");
    }

    #[test]
    fn repair_prepends_playwright_imports() {
        let fixed = repair_script("page.click('#pay-button')", "playwright-python");
        assert!(fixed.starts_with("from playwright.sync_api import"));
    }

    #[tokio::test]
    async fn accepted_on_first_attempt() {
        let backend = Arc::new(ScriptedBackend::replying([
            "driver.find_element(By.ID, \"pay-button\").click()",
        ]));
        let script = synthesizer(backend.clone(), 3)
            .synthesize(&case(), &map(), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(script.status, ScriptStatus::Accepted);
        assert_eq!(script.selectors_used, vec!["pay-button"]);
        assert_eq!(script.attempts, 1);
        assert_eq!(backend.calls(), 1);
        let prompt = &backend.prompts()[0];
        assert!(prompt.user.contains("pay-button"));
        assert!(prompt.user.contains("No additional documentation context."));
    }

    #[tokio::test]
    async fn feedback_loop_recovers() {
        let backend = Arc::new(ScriptedBackend::replying([
            "driver.find_element(By.ID, \"submit-button\").click()",
            "driver.find_element(By.ID, \"pay-button\").click()",
        ]));
        let script = synthesizer(backend.clone(), 3)
            .synthesize(&case(), &map(), &CancellationToken::new())
            .await
            .unwrap();
        assert!(script.is_accepted());
        assert_eq!(script.attempts, 2);
        assert!(backend.prompts()[1].user.contains("submit-button"));
    }

    #[tokio::test]
    async fn bounded_attempts_end_in_mismatch() {
        let backend = Arc::new(ScriptedBackend::replying([
            "driver.find_element(By.ID, \"submit-button\").click()",
            "driver.find_element(By.ID, \"submit-button\").click()",
            "driver.find_element(By.ID, \"pay-button\").click()",
        ]));
        let err = synthesizer(backend.clone(), 2)
            .synthesize(&case(), &map(), &CancellationToken::new())
            .await
            .unwrap_err();
        match err {
            PipelineError::SelectorMismatch {
                test_case_id,
                selectors,
                script,
            } => {
                assert_eq!(test_case_id, "TC-001");
                assert_eq!(selectors, vec!["submit-button"]);
                assert_eq!(script.status, ScriptStatus::Rejected);
                assert_eq!(script.attempts, 2);
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(backend.calls(), 2);
    }

    #[tokio::test]
    async fn backend_failure_is_surfaced() {
        let backend = Arc::new(ScriptedBackend::new(vec![Err(
            crate::error::BackendError::Fatal("401".into()),
        )]));
        let err = synthesizer(backend, 3)
            .synthesize(&case(), &map(), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::GenerationBackend(_)));
    }
}
