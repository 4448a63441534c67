//! End-to-end pipeline tests: upload, build, generate, script.
//!
//! Everything runs offline against the deterministic hash embedder and a
//! scripted generation backend.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use testbrain::backend::ScriptedBackend;
use testbrain::config::Config;
use testbrain::error::{BackendError, KnowledgeBaseError, PipelineError};
use testbrain::session::Session;
use testbrain_core::embedding::{EmbeddingProvider, HashEmbedder};
use testbrain_core::models::{ScriptStatus, TestCategory};

const SPECS: &str = "# Product Specs\n\nValid discount code: SAVE15 gives 15% off the order total.";

const SAVE15_REPLY: &str = r#"```json
[
  {
    "test_id": "TC-001",
    "feature": "Discount Code",
    "test_scenario": "Apply valid discount code",
    "preconditions": "User has items in cart",
    "steps": [
      {"action": "Enter discount code SAVE15", "expected": "Code accepted"},
      "Click apply"
    ],
    "expected_result": "15% is taken off the total",
    "grounded_in": ["product_specs.md"],
    "category": "positive"
  }
]
```"#;

const CHECKOUT: &str = r#"<html><body>
<form id="checkout-form">
  <input id="discount-code" name="discount" type="text" placeholder="Discount code">
  <button id="pay-button" class="btn" type="submit">Pay now</button>
</form>
</body></html>"#;

fn fast_config() -> Config {
    let mut config = Config::default();
    config.generation.initial_backoff_ms = 1;
    config.generation.max_backoff_ms = 2;
    config
}

fn session_with(config: &Config, backend: Arc<ScriptedBackend>) -> Session {
    Session::new(config, Arc::new(HashEmbedder::new(384)), backend)
}

async fn built_session(replies: Vec<&str>) -> (Session, Arc<ScriptedBackend>) {
    let backend = Arc::new(ScriptedBackend::replying(replies));
    let session = session_with(&fast_config(), backend.clone());
    session
        .upload_document("product_specs.md", "markdown", SPECS.as_bytes().to_vec())
        .await
        .unwrap();
    let report = session.build(None).await.unwrap();
    assert!(report.success);
    (session, backend)
}

#[tokio::test]
async fn save15_case_is_grounded_in_product_specs() {
    let (session, backend) = built_session(vec![SAVE15_REPLY]).await;

    let outcome = session.generate("discount code test cases", 5).await.unwrap();

    assert_eq!(outcome.cases.len(), 1);
    let case = &outcome.cases[0];
    assert_eq!(case.grounded_in, vec!["product_specs.md".to_string()]);
    assert!(case.steps_text().contains("SAVE15"));
    assert_eq!(case.category, TestCategory::Positive);
    assert_eq!(case.steps[1].action, "Click apply");
    assert!(outcome.violations.is_empty());

    let prompt = &backend.prompts()[0];
    assert!(prompt.user.contains("Source: product_specs.md"));
    assert!(prompt.user.contains("SAVE15"));

    let stored = session.test_case("TC-001").await.unwrap();
    assert_eq!(stored, *case);
}

#[tokio::test]
async fn zero_document_build_then_generate_is_empty_kb() {
    let backend = Arc::new(ScriptedBackend::replying([SAVE15_REPLY]));
    let session = session_with(&fast_config(), backend.clone());

    let report = session.build(None).await.unwrap();
    assert!(!report.success);
    assert_eq!(report.chunk_count, 0);

    let err = session.generate("anything", 5).await.unwrap_err();
    assert!(matches!(err, PipelineError::EmptyKnowledgeBase));
    assert_eq!(backend.calls(), 0);
}

#[tokio::test]
async fn query_before_any_build_is_empty_kb() {
    let backend = Arc::new(ScriptedBackend::replying([SAVE15_REPLY]));
    let session = session_with(&fast_config(), backend.clone());
    session
        .upload_document("product_specs.md", "md", SPECS.as_bytes().to_vec())
        .await
        .unwrap();
    let err = session.generate("discount", 5).await.unwrap_err();
    assert!(matches!(err, PipelineError::EmptyKnowledgeBase));
    assert_eq!(backend.calls(), 0);
}

#[tokio::test]
async fn unrelated_query_is_insufficient_context() {
    let mut config = fast_config();
    config.retrieval.min_score = 0.5;
    let backend = Arc::new(ScriptedBackend::replying([SAVE15_REPLY]));
    let session = session_with(&config, backend.clone());
    session
        .upload_document("product_specs.md", "md", SPECS.as_bytes().to_vec())
        .await
        .unwrap();
    session.build(None).await.unwrap();

    let err = session.generate("weather forecast tomorrow", 5).await.unwrap_err();
    match err {
        PipelineError::InsufficientContext { query } => {
            assert_eq!(query, "weather forecast tomorrow")
        }
        other => panic!("unexpected {:?}", other),
    }
    assert_eq!(backend.calls(), 0);
}

#[tokio::test]
async fn fabricated_citations_are_dropped_not_kept() {
    let reply = r#"[
      {"test_id": "TC-001", "test_scenario": "Valid code", "steps": ["Enter SAVE15"],
       "grounded_in": ["product_specs.md"], "category": "positive"},
      {"test_id": "TC-002", "test_scenario": "Loyalty points", "steps": ["Redeem points"],
       "grounded_in": ["loyalty_program.md"], "category": "positive"},
      {"test_id": "TC-003", "test_scenario": "Mixed", "steps": ["Enter SAVE15"],
       "grounded_in": ["product_specs.md", "pricing.pdf"], "category": "edge"},
      {"test_id": "TC-004", "test_scenario": "Uncited", "steps": ["Enter CODE"],
       "grounded_in": [], "category": "negative"}
    ]"#;
    let (session, _) = built_session(vec![reply]).await;

    let outcome = session.generate("discount code", 10).await.unwrap();

    let ids: Vec<_> = outcome.cases.iter().map(|c| c.id.as_str()).collect();
    assert_eq!(ids, vec!["TC-001"]);
    let dropped: Vec<_> = outcome
        .violations
        .iter()
        .map(|v| v.test_case_id.as_str())
        .collect();
    assert_eq!(dropped, vec!["TC-002", "TC-003", "TC-004"]);
    assert_eq!(outcome.violations[1].unknown_sources, vec!["pricing.pdf".to_string()]);

    let sources: Vec<String> = outcome
        .evidence
        .sources()
        .into_iter()
        .map(|s| s.document_name)
        .collect();
    for case in &outcome.cases {
        for cited in &case.grounded_in {
            assert!(sources.contains(cited));
        }
    }
    assert!(session.test_case("TC-002").await.is_none());
}

#[tokio::test]
async fn results_are_truncated_to_max_cases_in_backend_order() {
    let reply = r#"[
      {"test_id": "TC-A", "test_scenario": "a", "grounded_in": ["product_specs.md"]},
      {"test_id": "TC-B", "test_scenario": "b", "grounded_in": ["product_specs.md"]},
      {"test_id": "TC-C", "test_scenario": "c", "grounded_in": ["product_specs.md"]}
    ]"#;
    let (session, _) = built_session(vec![reply]).await;
    let outcome = session.generate("discount code", 2).await.unwrap();
    let ids: Vec<_> = outcome.cases.iter().map(|c| c.id.as_str()).collect();
    assert_eq!(ids, vec!["TC-A", "TC-B"]);
}

#[tokio::test]
async fn malformed_reply_is_a_schema_error_not_empty_success() {
    let (session, _) = built_session(vec!["Sorry, I can only answer in prose."]).await;
    let err = session.generate("discount code", 5).await.unwrap_err();
    match err {
        PipelineError::ResponseSchema { excerpt, .. } => assert!(excerpt.contains("prose")),
        other => panic!("unexpected {:?}", other),
    }
    assert!(session.test_cases().await.is_empty());
}

#[tokio::test]
async fn transient_backend_failures_are_retried() {
    let backend = Arc::new(ScriptedBackend::new(vec![
        Err(BackendError::Transient("HTTP 503".into())),
        Ok(SAVE15_REPLY.to_string()),
    ]));
    let session = session_with(&fast_config(), backend.clone());
    session
        .upload_document("product_specs.md", "md", SPECS.as_bytes().to_vec())
        .await
        .unwrap();
    session.build(None).await.unwrap();

    let outcome = session.generate("discount code", 5).await.unwrap();
    assert_eq!(outcome.cases.len(), 1);
    assert_eq!(backend.calls(), 2);
}

#[tokio::test]
async fn exhausted_backend_surfaces_generation_error() {
    let backend = Arc::new(ScriptedBackend::new(vec![
        Err(BackendError::Transient("a".into())),
        Err(BackendError::Transient("b".into())),
        Err(BackendError::Transient("c".into())),
    ]));
    let session = session_with(&fast_config(), backend.clone());
    session
        .upload_document("product_specs.md", "md", SPECS.as_bytes().to_vec())
        .await
        .unwrap();
    session.build(None).await.unwrap();

    let err = session.generate("discount code", 5).await.unwrap_err();
    assert!(matches!(
        err,
        PipelineError::GenerationBackend(BackendError::Transient(ref m)) if m == "c"
    ));
    assert_eq!(backend.calls(), 3);
}

#[tokio::test]
async fn retrieval_is_deterministic() {
    let (session, _) = built_session(vec![SAVE15_REPLY, SAVE15_REPLY]).await;
    session
        .upload_document("shipping.md", "md", b"Discount codes never apply to shipping.".to_vec())
        .await
        .unwrap();
    session.build(None).await.unwrap();

    let a = session.generate("discount code", 5).await.unwrap();
    let b = session.generate("discount code", 5).await.unwrap();
    let key = |o: &testbrain::generator::GenerationOutcome| -> Vec<(String, f32)> {
        o.evidence
            .iter()
            .map(|e| (e.chunk.id.clone(), e.score))
            .collect()
    };
    assert_eq!(key(&a), key(&b));
    assert_eq!(a.evidence.len(), 2);
}

#[tokio::test]
async fn regeneration_keeps_originals_addressable() {
    let (session, _) = built_session(vec![SAVE15_REPLY, SAVE15_REPLY]).await;
    session.generate("discount code", 5).await.unwrap();
    session.generate("discount code", 5).await.unwrap();

    let records = session.test_cases().await;
    assert_eq!(records.len(), 2);
    assert_eq!(records[0].run, 1);
    assert_eq!(records[1].run, 2);
    assert!(session.test_case_in_run(1, "TC-001").await.is_some());
    assert!(session.test_case_in_run(2, "TC-001").await.is_some());

    assert_eq!(session.discard_test_case("TC-001").await, 2);
    assert!(session.test_case("TC-001").await.is_none());
}

#[tokio::test]
async fn script_with_unknown_selector_is_rejected() {
    let bad = r#"driver.find_element(By.ID, "submit-button").click()"#;
    let backend = Arc::new(ScriptedBackend::replying([SAVE15_REPLY, bad, bad, bad]));
    let session = session_with(&fast_config(), backend.clone());
    session
        .upload_document("product_specs.md", "md", SPECS.as_bytes().to_vec())
        .await
        .unwrap();
    session
        .upload_page("checkout.html", br#"<button id="pay-button">Pay</button>"#.to_vec())
        .await
        .unwrap();
    session.build(None).await.unwrap();
    session.generate("discount code", 5).await.unwrap();

    let err = session.generate_script("TC-001").await.unwrap_err();
    match err {
        PipelineError::SelectorMismatch {
            test_case_id,
            selectors,
            script,
        } => {
            assert_eq!(test_case_id, "TC-001");
            assert_eq!(selectors, vec!["submit-button".to_string()]);
            assert_eq!(script.status, ScriptStatus::Rejected);
            assert_eq!(script.attempts, 3);
        }
        other => panic!("unexpected {:?}", other),
    }
    assert_eq!(backend.calls(), 4);

    let stored = session.scripts().await;
    assert_eq!(stored.len(), 1);
    assert_eq!(stored[0].status, ScriptStatus::Rejected);
}

#[tokio::test]
async fn accepted_script_uses_only_page_selectors() {
    let good = r##"```python
driver = webdriver.Chrome()
driver.find_element(By.ID, "discount-code").send_keys("SAVE15")
driver.find_element(By.CSS_SELECTOR, "#pay-button").click()
driver.quit()
```"##;
    let backend = Arc::new(ScriptedBackend::replying([SAVE15_REPLY, good]));
    let session = session_with(&fast_config(), backend.clone());
    session
        .upload_document("product_specs.md", "md", SPECS.as_bytes().to_vec())
        .await
        .unwrap();
    let map = session
        .upload_page("checkout.html", CHECKOUT.as_bytes().to_vec())
        .await
        .unwrap();
    session.build(None).await.unwrap();
    session.generate("discount code", 5).await.unwrap();

    let script = session.generate_script("TC-001").await.unwrap();
    assert_eq!(script.status, ScriptStatus::Accepted);
    assert_eq!(script.selectors_used, vec!["discount-code", "#pay-button"]);
    assert!(script.text.starts_with("from selenium import webdriver"));
    assert!(!script.text.contains("```"));
    for id in ["discount-code", "pay-button"] {
        assert!(map.has_id(id));
    }

    let prompt = &backend.prompts()[1];
    assert!(prompt.user.contains("AVAILABLE HTML SELECTORS"));
    assert!(prompt.user.contains("Source: product_specs.md"));
    assert_eq!(session.script(&script.id).await.unwrap().id, script.id);
}

#[tokio::test]
async fn script_without_page_is_an_error() {
    let (session, _) = built_session(vec![SAVE15_REPLY]).await;
    session.generate("discount code", 5).await.unwrap();
    assert!(matches!(
        session.generate_script("TC-001").await,
        Err(PipelineError::NoElementMap)
    ));
}

/// Hash embedder that sleeps before every batch.
struct SlowEmbedder {
    inner: HashEmbedder,
    delay: Duration,
}

#[async_trait]
impl EmbeddingProvider for SlowEmbedder {
    fn model_name(&self) -> &str {
        self.inner.model_name()
    }
    fn dims(&self) -> usize {
        self.inner.dims()
    }
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        tokio::time::sleep(self.delay).await;
        self.inner.embed(texts).await
    }
}

#[tokio::test]
async fn concurrent_rebuild_is_rejected_and_readers_see_old_snapshot() {
    let embedder = Arc::new(SlowEmbedder {
        inner: HashEmbedder::new(384),
        delay: Duration::from_millis(300),
    });
    let backend = Arc::new(ScriptedBackend::replying([SAVE15_REPLY]));
    let session = Arc::new(Session::new(&fast_config(), embedder, backend));
    session
        .upload_document("product_specs.md", "md", SPECS.as_bytes().to_vec())
        .await
        .unwrap();
    session.build(None).await.unwrap();
    assert_eq!(session.health().await.generation, 1);

    let first = {
        let session = session.clone();
        tokio::spawn(async move { session.build(None).await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;

    let second = session.build(None).await;
    assert!(matches!(second, Err(KnowledgeBaseError::BuildInProgress)));

    let health = session.health().await;
    assert_eq!(health.status, "building");
    assert_eq!(health.generation, 1);
    assert!(health.knowledge_base_ready);

    let report = first.await.unwrap().unwrap();
    assert_eq!(report.generation, 2);
    assert_eq!(session.health().await.generation, 2);
    assert_eq!(session.health().await.status, "ready");
}

#[tokio::test]
async fn cancelled_generation_leaves_store_untouched() {
    let backend = Arc::new(
        ScriptedBackend::replying([SAVE15_REPLY, SAVE15_REPLY]).with_delay(Duration::from_millis(500)),
    );
    let session = Arc::new(session_with(&fast_config(), backend.clone()));
    session
        .upload_document("product_specs.md", "md", SPECS.as_bytes().to_vec())
        .await
        .unwrap();
    session.build(None).await.unwrap();

    let pending = {
        let session = session.clone();
        tokio::spawn(async move { session.generate("discount code", 5).await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    session.cancel_all();

    let err = pending.await.unwrap().unwrap_err();
    assert!(matches!(err, PipelineError::Cancelled));
    assert!(session.test_cases().await.is_empty());

    let outcome = session.generate("discount code", 5).await.unwrap();
    assert_eq!(outcome.cases.len(), 1);
    assert_eq!(session.test_cases().await.len(), 1);
}

#[tokio::test]
async fn corrupt_document_is_a_warning_not_a_failed_build() {
    let backend = Arc::new(ScriptedBackend::replying([SAVE15_REPLY]));
    let session = session_with(&fast_config(), backend);
    session
        .upload_document("product_specs.md", "md", SPECS.as_bytes().to_vec())
        .await
        .unwrap();
    session
        .upload_document("broken.pdf", "pdf", b"this is not a pdf".to_vec())
        .await
        .unwrap();
    session
        .upload_document("api.json", "json", b"{\"discount\": {\"code\": \"SAVE15\"}}".to_vec())
        .await
        .unwrap();

    let report = session.build(None).await.unwrap();
    assert!(report.success);
    assert_eq!(report.warnings.len(), 1);
    assert_eq!(report.warnings[0].document, "broken.pdf");
    assert!(report.warnings[0].message.contains("pdf"));
    assert_eq!(report.chunk_count, 2);

    let outcome = session.generate("discount code", 5).await.unwrap();
    assert!(outcome
        .evidence
        .iter()
        .any(|e| e.chunk.text.contains("discount.code: SAVE15")));
}
