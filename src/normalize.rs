//! Multi-format normalization into plain text.
//!
//! Every supported format ends up as one UTF-8 string ready for chunking:
//!
//! | Format | Treatment |
//! |--------|-----------|
//! | `markdown`, `text` | whitespace canonicalization |
//! | `structured-data` | JSON flattened to `key.path: value` lines |
//! | `pdf` | per-page extraction joined with `--- Page N ---` markers |
//! | `markup` | visible text plus a selector summary, with a [`MarkupStructure`] side-channel |
//!
//! Text payloads that are not valid UTF-8 are decoded as Latin-1. Failures
//! are returned as [`NormalizeError`] and never panic; the build skips the
//! offending document.

use std::borrow::Cow;
use std::collections::{BTreeSet, HashMap};

use scraper::{ElementRef, Html, Selector};
use serde::Serialize;
use testbrain_core::models::DocumentFormat;

use crate::error::NormalizeError;

/// Output of [`normalize`].
#[derive(Debug, Clone, Serialize)]
pub struct NormalizedText {
    pub format: DocumentFormat,
    pub text: String,
    /// Page spans for PDFs; empty for every other format.
    pub pages: Vec<PageSpan>,
    /// Structural side-channel for markup; `None` for every other format.
    pub markup: Option<MarkupStructure>,
}

/// Character range of one PDF page inside the normalized text, marker
/// line included.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PageSpan {
    pub page: usize,
    pub start: usize,
    pub end: usize,
}

/// Structure extracted from page markup, consumed by
/// [`elements::element_map`](crate::elements::element_map).
#[derive(Debug, Clone, Default, Serialize)]
pub struct MarkupStructure {
    pub title: Option<String>,
    pub forms: Vec<MarkupForm>,
    /// Interactive elements in document order.
    pub elements: Vec<MarkupElement>,
    pub ids: BTreeSet<String>,
    pub classes: BTreeSet<String>,
    pub names: BTreeSet<String>,
    pub tags: BTreeSet<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MarkupForm {
    pub id: Option<String>,
    pub action: Option<String>,
    pub method: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MarkupElement {
    pub tag: String,
    pub element_type: String,
    pub id: Option<String>,
    pub name: Option<String>,
    pub classes: Vec<String>,
    pub placeholder: Option<String>,
    pub value: Option<String>,
    /// Text of an associated `<label for=…>`.
    pub label: Option<String>,
    /// The element's own visible text (buttons, links, options).
    pub text: Option<String>,
    pub href: Option<String>,
}

const INTERACTIVE: &str = "input, button, select, textarea, a";
const HIDDEN_TEXT_TAGS: &[&str] = &["script", "style", "noscript", "template"];

/// Normalize raw bytes of a declared format.
pub fn normalize(raw: &[u8], format: DocumentFormat) -> Result<NormalizedText, NormalizeError> {
    match format {
        DocumentFormat::Markdown | DocumentFormat::Text => Ok(NormalizedText {
            format,
            text: canonicalize_whitespace(&decode_text(raw)),
            pages: Vec::new(),
            markup: None,
        }),
        DocumentFormat::StructuredData => normalize_structured(&decode_text(raw)),
        DocumentFormat::Pdf => normalize_pdf(raw),
        DocumentFormat::Markup => normalize_markup(&decode_text(raw)),
    }
}

/// Normalize raw bytes with a free-form format tag (`md`, `json`, `html`…).
pub fn normalize_tagged(raw: &[u8], tag: &str) -> Result<NormalizedText, NormalizeError> {
    let format = DocumentFormat::from_tag(tag)
        .ok_or_else(|| NormalizeError::UnsupportedFormat(tag.to_string()))?;
    normalize(raw, format)
}

/// Decode as UTF-8 (BOM stripped), falling back to Latin-1.
pub fn decode_text(raw: &[u8]) -> Cow<'_, str> {
    let raw = raw.strip_prefix(b"\xEF\xBB\xBF").unwrap_or(raw);
    match std::str::from_utf8(raw) {
        Ok(s) => Cow::Borrowed(s),
        // Latin-1 maps each byte to the code point of the same value.
        Err(_) => Cow::Owned(raw.iter().map(|&b| b as char).collect()),
    }
}

/// Unify line endings, strip trailing whitespace, and collapse runs of
/// blank lines to one. Leading indentation is kept.
pub fn canonicalize_whitespace(text: &str) -> String {
    let text = text.replace("\r\n", "\n").replace('\r', "\n");
    let mut out = String::with_capacity(text.len());
    let mut blank_run = 0usize;
    for line in text.lines() {
        let line = line.trim_end().replace('\u{a0}', " ");
        if line.is_empty() {
            blank_run += 1;
            continue;
        }
        if !out.is_empty() {
            out.push_str(if blank_run > 0 { "\n\n" } else { "\n" });
        }
        blank_run = 0;
        out.push_str(&line);
    }
    out
}

// ============ Structured data ============

fn normalize_structured(text: &str) -> Result<NormalizedText, NormalizeError> {
    let value: serde_json::Value =
        serde_json::from_str(text).map_err(|e| NormalizeError::Corrupt {
            format: DocumentFormat::StructuredData,
            reason: e.to_string(),
        })?;
    let mut lines = Vec::new();
    flatten_json("", &value, &mut lines);
    Ok(NormalizedText {
        format: DocumentFormat::StructuredData,
        text: lines.join("\n"),
        pages: Vec::new(),
        markup: None,
    })
}

/// Emit one `path: value` line per leaf. Object keys join with `.`, array
/// items use `[i]`.
fn flatten_json(path: &str, value: &serde_json::Value, out: &mut Vec<String>) {
    use serde_json::Value;
    match value {
        Value::Object(map) if !map.is_empty() => {
            for (k, v) in map {
                let p = if path.is_empty() {
                    k.clone()
                } else {
                    format!("{}.{}", path, k)
                };
                flatten_json(&p, v, out);
            }
        }
        Value::Array(items) if !items.is_empty() => {
            for (i, v) in items.iter().enumerate() {
                flatten_json(&format!("{}[{}]", path, i), v, out);
            }
        }
        leaf => {
            let rendered = match leaf {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            if path.is_empty() {
                out.push(rendered);
            } else {
                out.push(format!("{}: {}", path, rendered));
            }
        }
    }
}

// ============ PDF ============

fn normalize_pdf(raw: &[u8]) -> Result<NormalizedText, NormalizeError> {
    let pages =
        pdf_extract::extract_text_from_mem_by_pages(raw).map_err(|e| NormalizeError::Corrupt {
            format: DocumentFormat::Pdf,
            reason: e.to_string(),
        })?;
    let (text, spans) = join_pages(&pages);
    Ok(NormalizedText {
        format: DocumentFormat::Pdf,
        text,
        pages: spans,
        markup: None,
    })
}

/// Join page texts under `--- Page N ---` markers (1-based) and record the
/// char span each page occupies.
pub fn join_pages<S: AsRef<str>>(pages: &[S]) -> (String, Vec<PageSpan>) {
    let mut text = String::new();
    let mut spans = Vec::with_capacity(pages.len());
    let mut cursor = 0usize;
    for (i, page) in pages.iter().enumerate() {
        if i > 0 {
            text.push_str("\n\n");
            cursor += 2;
        }
        let body = canonicalize_whitespace(page.as_ref());
        let section = if body.is_empty() {
            format!("--- Page {} ---", i + 1)
        } else {
            format!("--- Page {} ---\n{}", i + 1, body)
        };
        let len = section.chars().count();
        spans.push(PageSpan {
            page: i + 1,
            start: cursor,
            end: cursor + len,
        });
        cursor += len;
        text.push_str(&section);
    }
    (text, spans)
}

// ============ Markup ============

fn selector(css: &'static str) -> Result<Selector, NormalizeError> {
    Selector::parse(css).map_err(|e| NormalizeError::Corrupt {
        format: DocumentFormat::Markup,
        reason: format!("invalid selector {}: {:?}", css, e),
    })
}

fn normalize_markup(html: &str) -> Result<NormalizedText, NormalizeError> {
    let structure = parse_markup(html)?;
    let doc = Html::parse_document(html);

    let mut text = visible_text(&doc);
    let summary = selector_summary(&structure);
    if !summary.is_empty() {
        if !text.is_empty() {
            text.push_str("\n\n");
        }
        text.push_str("Selectors:\n");
        text.push_str(&summary);
    }

    Ok(NormalizedText {
        format: DocumentFormat::Markup,
        text,
        pages: Vec::new(),
        markup: Some(structure),
    })
}

/// Extract the structural side-channel from page markup.
pub fn parse_markup(html: &str) -> Result<MarkupStructure, NormalizeError> {
    let doc = Html::parse_document(html);
    if html.trim().is_empty() {
        return Err(NormalizeError::Corrupt {
            format: DocumentFormat::Markup,
            reason: "empty markup".to_string(),
        });
    }

    let mut s = MarkupStructure {
        title: doc
            .select(&selector("title")?)
            .next()
            .map(|t| collapse(&t.text().collect::<String>()))
            .filter(|t| !t.is_empty()),
        ..Default::default()
    };

    for el in doc.root_element().descendants().filter_map(ElementRef::wrap) {
        let v = el.value();
        s.tags.insert(v.name().to_ascii_lowercase());
        if let Some(id) = attr(&el, "id") {
            s.ids.insert(id);
        }
        if let Some(name) = attr(&el, "name") {
            s.names.insert(name);
        }
        for class in v.classes() {
            s.classes.insert(class.to_string());
        }
    }

    let labels: HashMap<String, String> = doc
        .select(&selector("label[for]")?)
        .filter_map(|l| {
            let target = attr(&l, "for")?;
            let text = collapse(&l.text().collect::<String>());
            (!text.is_empty()).then_some((target, text))
        })
        .collect();

    for form in doc.select(&selector("form")?) {
        s.forms.push(MarkupForm {
            id: attr(&form, "id"),
            action: attr(&form, "action"),
            method: attr(&form, "method"),
        });
    }

    for el in doc.select(&selector(INTERACTIVE)?) {
        let tag = el.value().name().to_ascii_lowercase();
        let id = attr(&el, "id");
        let text = collapse(&el.text().collect::<String>());
        s.elements.push(MarkupElement {
            element_type: attr(&el, "type").unwrap_or_default(),
            label: id.as_ref().and_then(|i| labels.get(i).cloned()),
            id,
            name: attr(&el, "name"),
            classes: el.value().classes().map(str::to_string).collect(),
            placeholder: attr(&el, "placeholder"),
            value: attr(&el, "value"),
            text: (!text.is_empty()).then_some(text),
            href: if tag == "a" { attr(&el, "href") } else { None },
            tag,
        });
    }

    Ok(s)
}

fn attr(el: &ElementRef<'_>, name: &str) -> Option<String> {
    el.value()
        .attr(name)
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

fn collapse(s: &str) -> String {
    s.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Text nodes outside `script`/`style`/`noscript`/`template`, one per line.
fn visible_text(doc: &Html) -> String {
    let mut lines = Vec::new();
    for node in doc.root_element().descendants() {
        let Some(text) = node.value().as_text() else {
            continue;
        };
        let hidden = node.ancestors().any(|a| {
            a.value()
                .as_element()
                .map(|e| HIDDEN_TEXT_TAGS.contains(&e.name()))
                .unwrap_or(false)
        });
        if hidden {
            continue;
        }
        let line = collapse(text);
        if !line.is_empty() {
            lines.push(line);
        }
    }
    lines.join("\n")
}

fn selector_summary(s: &MarkupStructure) -> String {
    let mut lines = Vec::new();
    for f in &s.forms {
        let mut line = String::from("- form");
        if let Some(id) = &f.id {
            line.push_str(&format!("#{}", id));
        }
        if let Some(action) = &f.action {
            line.push_str(&format!(" action={}", action));
        }
        if let Some(method) = &f.method {
            line.push_str(&format!(" method={}", method));
        }
        lines.push(line);
    }
    for e in &s.elements {
        let mut line = format!("- {}", e.tag);
        if let Some(id) = &e.id {
            line.push_str(&format!("#{}", id));
        }
        let mut attrs = Vec::new();
        if let Some(n) = &e.name {
            attrs.push(format!("name={}", n));
        }
        if !e.element_type.is_empty() {
            attrs.push(format!("type={}", e.element_type));
        }
        if !e.classes.is_empty() {
            attrs.push(format!("class={}", e.classes.join(" ")));
        }
        if !attrs.is_empty() {
            line.push_str(&format!(" ({})", attrs.join(", ")));
        }
        if let Some(caption) = e.label.as_ref().or(e.text.as_ref()).or(e.placeholder.as_ref()) {
            line.push_str(&format!(" \"{}\"", caption));
        }
        lines.push(line);
    }
    lines.join("\n")
}
