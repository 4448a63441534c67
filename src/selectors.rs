//! Static selector extraction and validation for generated scripts.
//!
//! Recognized references:
//!
//! - Selenium: `By.<KIND>` tuples, `find_element(s)` with positional,
//!   keyword (`by=…, value=…`), or string (`"css selector"`) strategies,
//!   and the legacy `find_element_by_*` calls.
//! - Playwright: `.locator(…)`, `.query_selector(…)`,
//!   `.wait_for_selector(…)`, `page.<action>(selector, …)`, and the
//!   `get_by_*` locators.
//!
//! CSS and XPath selectors are checked component by component: every id,
//! class, `name` attribute, and tag they mention must exist on the page.
//! Text locators (link text, labels, placeholders, roles) must match an
//! interactive element's captions. A locator call whose argument cannot be
//! resolved statically is reported as unknown.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;
use testbrain_core::models::{ElementMap, SelectorDescriptor};

/// How a selector token addresses the page.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SelectorKind {
    Id,
    Name,
    Class,
    Css,
    XPath,
    Tag,
    LinkText,
    PartialLinkText,
    Label,
    Placeholder,
    Text,
    Role,
    /// Strategies the element map does not catalogue (test ids, alt text,
    /// titles). Never known.
    Unlisted,
    /// A locator call whose argument is not a literal.
    Unresolved,
}

/// One selector reference found in a script.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SelectorRef {
    pub kind: SelectorKind,
    /// The selector exactly as written in the script.
    pub value: String,
    /// Accessible name filter of a role locator.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub accessible_name: Option<String>,
}

impl SelectorRef {
    fn new(kind: SelectorKind, value: impl Into<String>) -> Self {
        Self {
            kind,
            value: value.into(),
            accessible_name: None,
        }
    }

    /// Display form used in validation reports.
    pub fn label(&self) -> String {
        match &self.accessible_name {
            Some(name) => format!("{}[name=\"{}\"]", self.value, name),
            None => self.value.clone(),
        }
    }
}

const STR: &str = r#"(?:"((?:[^"\\]|\\.)*)"|'((?:[^'\\]|\\.)*)')"#;
const STRATEGY: &str = r#"(?:By\.([A-Z_]+)|"([a-z ]+)"|'([a-z ]+)')"#;

static SELENIUM_BY: Lazy<Regex> = Lazy::new(|| {
    Regex::new(&format!(r"By\.([A-Z_]+)\s*,\s*(?:value\s*=\s*)?{STR}")).expect("selenium By regex")
});

static LOCATOR_CALL: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"\.\s*(find_elements?_by_[a-z_]+|find_elements?|locator|query_selector_all|query_selector|wait_for_selector|get_by_[a-z_]+)\s*\(",
    )
    .expect("locator call regex")
});

static PAGE_ACTION: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"\bpage\.(click|dblclick|fill|type|press|check|uncheck|select_option|hover|focus|is_visible|is_checked|is_enabled|text_content|inner_text|input_value|get_attribute)\s*\(",
    )
    .expect("playwright page regex")
});

static SELENIUM_ARGS: Lazy<Regex> = Lazy::new(|| {
    Regex::new(&format!(
        r"^\s*(?:by\s*=\s*)?{STRATEGY}\s*,\s*(?:value\s*=\s*)?{STR}\s*,?\s*$"
    ))
    .expect("selenium arguments regex")
});

static SELENIUM_ARGS_REVERSED: Lazy<Regex> = Lazy::new(|| {
    Regex::new(&format!(
        r"^\s*value\s*=\s*{STR}\s*,\s*by\s*=\s*{STRATEGY}\s*,?\s*$"
    ))
    .expect("selenium keyword regex")
});

static FIRST_STR_ARG: Lazy<Regex> = Lazy::new(|| {
    Regex::new(&format!(r"^\s*(?:[a-z_]+\s*=\s*)?{STR}\s*(?:,|$)")).expect("first argument regex")
});

static NAME_KWARG: Lazy<Regex> = Lazy::new(|| {
    Regex::new(&format!(r"\bname\s*=\s*{STR}")).expect("name keyword regex")
});

static CSS_ATTR: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"\[\s*([A-Za-z_][\w-]*)\s*(?:[~|^$*]?=\s*(?:"([^"]*)"|'([^']*)'|([^\]\s]+))\s*)?\]"#)
        .expect("css attribute regex")
});
static CSS_PSEUDO: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"::?[\w-]+(?:\([^)]*\))?").expect("css pseudo regex"));
static CSS_ID: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"#(-?[A-Za-z_][\w-]*)").expect("css id regex"));
static CSS_CLASS: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\.(-?[A-Za-z_][\w-]*)").expect("css class regex"));
static CSS_TAG: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?:^|[\s>+~,(])([A-Za-z][A-Za-z0-9]*)").expect("css tag regex")
});

static XPATH_ATTR_EQ: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"@(id|name|class)\s*=\s*(?:"([^"]*)"|'([^']*)')"#).expect("xpath attribute regex")
});
static XPATH_CONTAINS_CLASS: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"contains\(\s*@class\s*,\s*(?:"([^"]*)"|'([^']*)')\s*\)"#)
        .expect("xpath contains regex")
});
static XPATH_STRING: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#""[^"]*"|'[^']*'"#).expect("xpath string regex"));
static XPATH_STEP: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"/([A-Za-z][\w-]*)(\(|::)?").expect("xpath step regex")
});

fn quoted(caps: &regex::Captures<'_>, first: usize) -> Option<String> {
    caps.get(first)
        .or_else(|| caps.get(first + 1))
        .map(|m| m.as_str().replace("\\\"", "\"").replace("\\'", "'"))
}

/// Map a Selenium strategy (`ID`, `CSS_SELECTOR`, `"css selector"`, `css_selector`).
fn strategy_kind(token: &str) -> Option<SelectorKind> {
    let normalized = token.trim().to_ascii_lowercase().replace('_', " ");
    Some(match normalized.as_str() {
        "id" => SelectorKind::Id,
        "name" => SelectorKind::Name,
        "class name" => SelectorKind::Class,
        "css selector" => SelectorKind::Css,
        "xpath" => SelectorKind::XPath,
        "tag name" => SelectorKind::Tag,
        "link text" => SelectorKind::LinkText,
        "partial link text" => SelectorKind::PartialLinkText,
        _ => return None,
    })
}

/// Extract every selector reference, deduplicated, in first-seen order.
pub fn extract_selectors(script: &str) -> Vec<SelectorRef> {
    let mut found: Vec<(usize, SelectorRef)> = Vec::new();

    for caps in SELENIUM_BY.captures_iter(script) {
        let pos = caps.get(0).map(|m| m.start()).unwrap_or(0);
        if let (Some(kind), Some(value)) = (strategy_kind(&caps[1]), quoted(&caps, 2)) {
            found.push((pos, SelectorRef::new(kind, value)));
        }
    }

    for (re, page_action) in [(&*LOCATOR_CALL, false), (&*PAGE_ACTION, true)] {
        for caps in re.captures_iter(script) {
            let Some(whole) = caps.get(0) else { continue };
            let method = &caps[1];
            let call = if page_action { "page_action" } else { method };
            let args = call_args(script, whole.end());
            for r in resolve_call(call, method, args) {
                found.push((whole.start(), r));
            }
        }
    }

    found.sort_by_key(|(pos, _)| *pos);
    let mut out: Vec<SelectorRef> = Vec::new();
    for (_, r) in found {
        if !r.value.trim().is_empty() && !out.contains(&r) {
            out.push(r);
        }
    }
    out
}

/// Argument text of a call whose `(` ends at `open`, up to the matching
/// `)`. Unbalanced calls yield the rest of the line.
fn call_args(script: &str, open: usize) -> &str {
    let rest = &script[open..];
    let mut depth = 0usize;
    let mut quote: Option<char> = None;
    let mut escaped = false;
    for (i, c) in rest.char_indices() {
        if let Some(q) = quote {
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == q {
                quote = None;
            }
            continue;
        }
        match c {
            '"' | '\'' => quote = Some(c),
            '(' | '[' | '{' => depth += 1,
            ')' | ']' | '}' if depth > 0 => depth -= 1,
            ')' => return &rest[..i],
            _ => {}
        }
    }
    rest.lines().next().unwrap_or("")
}

fn resolve_call(call: &str, method: &str, args: &str) -> Vec<SelectorRef> {
    let unresolved = || {
        vec![SelectorRef::new(
            SelectorKind::Unresolved,
            format!("{}({})", method, args.trim()),
        )]
    };
    let first_str = || FIRST_STR_ARG.captures(args).and_then(|c| quoted(&c, 1));

    match call {
        "find_element" | "find_elements" => {
            if let Some(c) = SELENIUM_ARGS.captures(args) {
                let kind = c.get(1).or(c.get(2)).or(c.get(3)).and_then(|m| strategy_kind(m.as_str()));
                if let (Some(kind), Some(value)) = (kind, quoted(&c, 4)) {
                    return vec![SelectorRef::new(kind, value)];
                }
            }
            if let Some(c) = SELENIUM_ARGS_REVERSED.captures(args) {
                let kind = c.get(3).or(c.get(4)).or(c.get(5)).and_then(|m| strategy_kind(m.as_str()));
                if let (Some(kind), Some(value)) = (kind, quoted(&c, 1)) {
                    return vec![SelectorRef::new(kind, value)];
                }
            }
            unresolved()
        }
        legacy if legacy.starts_with("find_element") => {
            let strategy = legacy.split_once("_by_").map(|(_, s)| s).unwrap_or("");
            match (strategy_kind(strategy), first_str()) {
                (Some(kind), Some(value)) => vec![SelectorRef::new(kind, value)],
                _ => unresolved(),
            }
        }
        getter if getter.starts_with("get_by_") => {
            let Some(value) = first_str() else {
                return unresolved();
            };
            let kind = match &getter["get_by_".len()..] {
                "label" => SelectorKind::Label,
                "placeholder" => SelectorKind::Placeholder,
                "text" => SelectorKind::Text,
                "role" => {
                    let rest = args.split_once(',').map(|(_, r)| r).unwrap_or("");
                    let mut r = SelectorRef::new(SelectorKind::Role, value);
                    r.accessible_name = NAME_KWARG.captures(rest).and_then(|c| quoted(&c, 1));
                    return vec![r];
                }
                "test_id" | "alt_text" | "title" => SelectorKind::Unlisted,
                _ => return unresolved(),
            };
            vec![SelectorRef::new(kind, value)]
        }
        _ => match first_str() {
            Some(selector) => {
                let refs = playwright_refs(&selector);
                if refs.is_empty() {
                    unresolved()
                } else {
                    refs
                }
            }
            None => unresolved(),
        },
    }
}

/// References inside one Playwright selector string. Chains (`a >> b`)
/// yield one reference per part.
fn playwright_refs(selector: &str) -> Vec<SelectorRef> {
    let mut out = Vec::new();
    for part in selector.split(">>") {
        let s = part.trim();
        if s.is_empty() {
            continue;
        }
        if s.starts_with("//") || s.starts_with("(//") || s.starts_with("..") {
            out.push(SelectorRef::new(SelectorKind::XPath, s));
            continue;
        }
        if s.starts_with('"') || s.starts_with('\'') {
            out.push(SelectorRef::new(SelectorKind::Text, unquote(s)));
            continue;
        }
        match s.split_once('=') {
            Some((engine, rest)) if is_engine(engine) => {
                let rest = unquote(rest.trim());
                let r = match engine {
                    "xpath" => SelectorRef::new(SelectorKind::XPath, rest),
                    "css" => SelectorRef::new(SelectorKind::Css, rest),
                    "id" => SelectorRef::new(SelectorKind::Id, rest),
                    "text" => SelectorRef::new(SelectorKind::Text, rest),
                    "role" => {
                        let role = rest.split('[').next().unwrap_or("").trim();
                        SelectorRef::new(SelectorKind::Role, role)
                    }
                    "nth" | "visible" => continue,
                    "data-testid" | "data-test-id" | "data-test" => {
                        SelectorRef::new(SelectorKind::Unlisted, rest)
                    }
                    _ => SelectorRef::new(SelectorKind::Unresolved, s),
                };
                out.push(r);
            }
            _ => out.push(SelectorRef::new(SelectorKind::Css, s)),
        }
    }
    out
}

fn unquote(s: &str) -> String {
    let t = s.trim();
    for q in ['"', '\''] {
        if t.len() >= 2 && t.starts_with(q) && t.ends_with(q) {
            return t[1..t.len() - 1].to_string();
        }
    }
    t.to_string()
}

fn is_engine(prefix: &str) -> bool {
    !prefix.is_empty()
        && prefix
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

fn collapse(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn caption_matches(desc: &SelectorDescriptor, needle: &str) -> bool {
    let needle = collapse(needle).to_lowercase();
    !needle.is_empty()
        && desc
            .texts
            .iter()
            .any(|t| collapse(t).to_lowercase().contains(&needle))
}

/// Implicit ARIA role of an interactive element.
fn implicit_role(desc: &SelectorDescriptor) -> Option<&'static str> {
    match desc.tag.as_str() {
        "a" => Some("link"),
        "button" => Some("button"),
        "textarea" => Some("textbox"),
        "select" => Some("combobox"),
        "input" => match desc.element_type.to_ascii_lowercase().as_str() {
            "submit" | "button" | "reset" | "image" => Some("button"),
            "checkbox" => Some("checkbox"),
            "radio" => Some("radio"),
            "range" => Some("slider"),
            "number" => Some("spinbutton"),
            "search" => Some("searchbox"),
            "" | "text" | "email" | "tel" | "url" => Some("textbox"),
            _ => None,
        },
        _ => None,
    }
}

/// Whether a single selector resolves against the element map.
pub fn is_known(map: &ElementMap, selector: &SelectorRef) -> bool {
    let v = selector.value.trim();
    match selector.kind {
        SelectorKind::Id => map.has_id(v),
        SelectorKind::Name => map.has_name(v),
        SelectorKind::Class => {
            let mut classes = v.split_whitespace().peekable();
            classes.peek().is_some() && classes.all(|c| map.has_class(c))
        }
        SelectorKind::Tag => map.has_tag(v),
        SelectorKind::Css => css_known(map, v),
        SelectorKind::XPath => xpath_known(map, v),
        SelectorKind::LinkText => map
            .elements
            .values()
            .any(|d| d.tag == "a" && d.texts.iter().any(|t| collapse(t) == collapse(v))),
        SelectorKind::PartialLinkText => {
            !v.is_empty()
                && map
                    .elements
                    .values()
                    .any(|d| d.tag == "a" && d.texts.iter().any(|t| t.contains(v)))
        }
        SelectorKind::Label | SelectorKind::Placeholder | SelectorKind::Text => {
            map.elements.values().any(|d| caption_matches(d, v))
        }
        SelectorKind::Role => {
            let role = v.to_ascii_lowercase();
            map.elements.values().any(|d| {
                implicit_role(d) == Some(role.as_str())
                    && selector
                        .accessible_name
                        .as_deref()
                        .map_or(true, |name| caption_matches(d, name))
            })
        }
        SelectorKind::Unlisted | SelectorKind::Unresolved => false,
    }
}

fn css_known(map: &ElementMap, css: &str) -> bool {
    let mut any = false;
    for caps in CSS_ATTR.captures_iter(css) {
        let attr = caps[1].to_ascii_lowercase();
        let value = caps
            .get(2)
            .or_else(|| caps.get(3))
            .or_else(|| caps.get(4))
            .map(|m| m.as_str());
        match (attr.as_str(), value) {
            ("id", Some(v)) => {
                any = true;
                if !map.has_id(v) {
                    return false;
                }
            }
            ("name", Some(v)) => {
                any = true;
                if !map.has_name(v) {
                    return false;
                }
            }
            _ => {}
        }
    }

    let stripped = CSS_ATTR.replace_all(css, " ");
    let stripped = CSS_PSEUDO.replace_all(&stripped, " ");
    for caps in CSS_ID.captures_iter(&stripped) {
        any = true;
        if !map.has_id(&caps[1]) {
            return false;
        }
    }
    for caps in CSS_CLASS.captures_iter(&stripped) {
        any = true;
        if !map.has_class(&caps[1]) {
            return false;
        }
    }
    for caps in CSS_TAG.captures_iter(&stripped) {
        any = true;
        if !map.has_tag(&caps[1]) {
            return false;
        }
    }
    any || stripped.trim() == "*"
}

fn xpath_known(map: &ElementMap, xpath: &str) -> bool {
    for caps in XPATH_ATTR_EQ.captures_iter(xpath) {
        let value = quoted(&caps, 2).unwrap_or_default();
        let ok = match &caps[1] {
            "id" => map.has_id(&value),
            "name" => map.has_name(&value),
            _ => value.split_whitespace().all(|c| map.has_class(c)),
        };
        if !ok {
            return false;
        }
    }
    for caps in XPATH_CONTAINS_CLASS.captures_iter(xpath) {
        let value = quoted(&caps, 1).unwrap_or_default();
        if !map.classes.iter().any(|c| c.contains(value.trim())) {
            return false;
        }
    }
    let unquoted = XPATH_STRING.replace_all(xpath, "''");
    for caps in XPATH_STEP.captures_iter(&unquoted) {
        // Function calls and axes are not element steps.
        if caps.get(2).is_some() {
            continue;
        }
        if !map.has_tag(&caps[1]) {
            return false;
        }
    }
    true
}

/// Split references into `(used, unknown)` value lists, both in
/// first-seen order.
pub fn validate(map: &ElementMap, refs: &[SelectorRef]) -> (Vec<String>, Vec<String>) {
    let mut used = Vec::new();
    let mut unknown = Vec::new();
    for r in refs {
        let label = r.label();
        if !is_known(map, r) && !unknown.contains(&label) {
            unknown.push(label.clone());
        }
        if !used.contains(&label) {
            used.push(label);
        }
    }
    (used, unknown)
}
