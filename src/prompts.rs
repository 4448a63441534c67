//! Prompt templates for test-case and script generation.

use testbrain_core::models::{RetrievedEvidence, TestCase};

use crate::backend::Prompt;

const TEST_CASE_SYSTEM: &str = r#"You are an expert QA engineer specializing in test case generation.
Your task is to generate comprehensive test cases based ONLY on the provided documentation and requirements.

CRITICAL RULES:
1. ONLY use information from the provided context documents. Do NOT invent or assume features that are not explicitly mentioned.
2. Every test case MUST include a "grounded_in" field listing the source document name(s) it is based on, copied exactly from the "Source:" labels.
3. Cite ONLY sources that appear in the context. A test case citing anything else is discarded.
4. Cover positive (happy path), negative (error cases), and edge scenarios, and tag each with "category".
5. Be specific and actionable. Reference actual features, field names, values, and behaviors from the documentation.

Output format: Return a valid JSON array of test cases. Each test case must have:
- test_id: Unique identifier (e.g., "TC-001")
- feature: Feature or component being tested
- test_scenario: Brief description of what is being tested
- preconditions: What must be true before the test runs
- steps: Array of steps, each {"action": "...", "expected": "..."}
- expected_result: What should happen when the test passes
- grounded_in: Array of source document names this test case is based on
- category: One of "positive", "negative", "edge"

Example format:
[
  {
    "test_id": "TC-001",
    "feature": "Discount Code",
    "test_scenario": "Apply valid discount code",
    "preconditions": "User has items in cart",
    "steps": [
      {"action": "Navigate to checkout", "expected": "Checkout page is shown"},
      {"action": "Enter discount code 'SAVE15' and click apply", "expected": "Code is accepted"}
    ],
    "expected_result": "Discount of 15% is applied to total",
    "grounded_in": ["product_specs.md"],
    "category": "positive"
  }
]"#;

const SCRIPT_SYSTEM_SELENIUM: &str = r#"You are an expert Selenium (Python) automation engineer.
Your task is to generate clean, runnable Selenium Python scripts based on test cases and HTML structure.

CRITICAL REQUIREMENTS:
1. Use ONLY the selectors (IDs, names, classes) that are ACTUALLY present in the provided HTML.
2. Prefer IDs and names over CSS selectors when available.
3. Use explicit waits (WebDriverWait) for dynamic elements.
4. Include proper setup and teardown (at least driver.quit()).
5. Follow the test steps exactly as specified in the test case.
6. Add assertions that verify the expected result.

Return ONLY the Python code, no markdown code blocks, no explanations."#;

const SCRIPT_SYSTEM_PLAYWRIGHT: &str = r#"You are an expert Playwright (Python) automation engineer.
Your task is to generate clean, runnable Playwright Python scripts based on test cases and HTML structure.

CRITICAL REQUIREMENTS:
1. Use ONLY the selectors (IDs, names, classes) that are ACTUALLY present in the provided HTML.
2. Locate elements with page.locator() using CSS selectors built from those IDs, names, and classes.
3. Use the synchronous API (playwright.sync_api) and close the browser at the end.
4. Follow the test steps exactly as specified in the test case.
5. Add assertions that verify the expected result.

Return ONLY the Python code, no markdown code blocks, no explanations."#;

/// Render evidence as numbered, source-labelled context blocks.
pub fn render_evidence(evidence: &RetrievedEvidence) -> String {
    evidence
        .iter()
        .enumerate()
        .map(|(i, e)| {
            format!(
                "[Document {} - Source: {}]\n{}\n",
                i + 1,
                e.document_name,
                e.chunk.text
            )
        })
        .collect::<Vec<_>>()
        .join("\n---\n")
}

pub fn test_case_prompt(query: &str, max_cases: usize, evidence: &RetrievedEvidence) -> Prompt {
    let sources = evidence
        .sources()
        .into_iter()
        .map(|s| s.document_name)
        .collect::<Vec<_>>()
        .join(", ");

    let user = format!(
        "Based on the following documentation, generate {max_cases} test cases for: {query}\n\n\
         DOCUMENTATION CONTEXT:\n{context}\n\n\
         ALLOWED SOURCES: {sources}\n\n\
         Generate test cases that are:\n\
         - Strictly grounded in the provided documentation\n\
         - Cover positive, negative, and edge scenarios\n\
         - Include clear steps and expected results\n\
         - Reference source documents in the \"grounded_in\" field\n\n\
         Return ONLY a valid JSON array, no additional text or explanation.",
        context = render_evidence(evidence),
    );

    Prompt {
        system: TEST_CASE_SYSTEM.to_string(),
        user,
    }
}

/// Script prompt for one test case. `feedback` lists selectors a previous
/// attempt used that the page does not have.
pub fn script_prompt(
    framework: &str,
    case: &TestCase,
    catalogue: &str,
    doc_context: Option<&str>,
    feedback: &[String],
) -> Prompt {
    let system = match framework {
        "playwright-python" => SCRIPT_SYSTEM_PLAYWRIGHT,
        _ => SCRIPT_SYSTEM_SELENIUM,
    };

    let steps = case
        .steps
        .iter()
        .enumerate()
        .map(|(i, s)| {
            if s.expected.is_empty() {
                format!("  {}. {}", i + 1, s.action)
            } else {
                format!("  {}. {} (expect: {})", i + 1, s.action, s.expected)
            }
        })
        .collect::<Vec<_>>()
        .join("\n");

    let mut user = format!(
        "Generate a {framework} script for the following test case:\n\n\
         TEST CASE:\n\
         Test ID: {id}\n\
         Feature: {feature}\n\
         Scenario: {title}\n\
         Preconditions: {pre}\n\
         Steps:\n{steps}\n\
         Expected Result: {expected}\n\n\
         HTML STRUCTURE:\n{catalogue}\n\n\
         RELEVANT DOCUMENTATION:\n{docs}\n",
        id = case.id,
        feature = case.feature,
        title = case.title,
        pre = case.preconditions,
        expected = case.expected_result,
        docs = doc_context
            .filter(|d| !d.trim().is_empty())
            .unwrap_or("No additional documentation context."),
    );

    if !feedback.is_empty() {
        user.push_str(&format!(
            "\nPREVIOUS ATTEMPT REJECTED: it used selectors that do not exist on the page: {}.\n\
             Use only the selectors listed under HTML STRUCTURE.\n",
            feedback.join(", ")
        ));
    }

    user.push_str("\nReturn ONLY the Python code.");

    Prompt {
        system: system.to_string(),
        user,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use testbrain_core::models::{Chunk, Evidence, Step, TestCategory};

    fn evidence() -> RetrievedEvidence {
        RetrievedEvidence::new(vec![Evidence {
            chunk: Chunk {
                id: "d1:0".into(),
                document_id: "d1".into(),
                ordinal: 0,
                start: 0,
                end: 9,
                overlap: 0,
                text: "SAVE15 ok".into(),
                hash: String::new(),
            },
            document_name: "product_specs.md".into(),
            score: 0.9,
        }])
    }

    fn case() -> TestCase {
        TestCase {
            id: "TC-001".into(),
            feature: "Discount".into(),
            title: "Apply code".into(),
            preconditions: "Cart has items".into(),
            steps: vec![
                Step {
                    action: "Enter SAVE15".into(),
                    expected: String::new(),
                },
                Step {
                    action: "Click apply".into(),
                    expected: "Total drops".into(),
                },
            ],
            expected_result: "15% off".into(),
            grounded_in: vec!["product_specs.md".into()],
            category: TestCategory::Positive,
        }
    }

    #[test]
    fn test_case_prompt_labels_sources() {
        let p = test_case_prompt("discount", 3, &evidence());
        assert!(p.system.contains("CRITICAL RULES"));
        assert!(p.user.contains("generate 3 test cases for: discount"));
        assert!(p.user.contains("[Document 1 - Source: product_specs.md]"));
        assert!(p.user.contains("ALLOWED SOURCES: product_specs.md"));
    }

    #[test]
    fn script_prompt_numbers_steps_and_falls_back_on_docs() {
        let p = script_prompt("selenium-python", &case(), "IDs: pay-button", None, &[]);
        assert!(p.system.contains("Selenium"));
        assert!(p.user.contains("  1. Enter SAVE15\n"));
        assert!(p.user.contains("  2. Click apply (expect: Total drops)"));
        assert!(p.user.contains("No additional documentation context."));
        assert!(!p.user.contains("PREVIOUS ATTEMPT"));
    }

    #[test]
    fn script_prompt_carries_feedback() {
        let p = script_prompt(
            "playwright-python",
            &case(),
            "IDs: pay-button",
            Some("docs"),
            &["#submit-button".to_string()],
        );
        assert!(p.system.contains("Playwright"));
        assert!(p.user.contains("do not exist on the page: #submit-button"));
    }
}
