//! Element map construction from page markup.
//!
//! Each interactive element gets a semantic name: its `id`, else its
//! `name` attribute, else `<tag>-<slug of caption>`, else `<tag>-<n>`.
//! Collisions get a numeric suffix. The map also carries every id, class,
//! `name`, and tag on the page so that script validation can check
//! selectors that target non-interactive elements.

use std::collections::BTreeMap;

use testbrain_core::models::{ElementMap, SelectorDescriptor};

use crate::error::NormalizeError;
use crate::normalize::{parse_markup, MarkupElement, MarkupStructure};

/// Build an [`ElementMap`] from a markup side-channel.
pub fn element_map(structure: &MarkupStructure) -> ElementMap {
    let mut map = ElementMap {
        ids: structure.ids.clone(),
        classes: structure.classes.clone(),
        names: structure.names.clone(),
        tags: structure.tags.clone(),
        elements: BTreeMap::new(),
    };

    let mut anonymous = 0usize;
    for el in &structure.elements {
        let base = match semantic_name(el) {
            Some(name) => name,
            None => {
                anonymous += 1;
                format!("{}-{}", el.tag, anonymous)
            }
        };
        let name = unique_name(&map, base);
        map.insert(SelectorDescriptor {
            css: css_for(el),
            xpath: xpath_for(el),
            name,
            tag: el.tag.clone(),
            element_type: el.element_type.clone(),
            id: el.id.clone(),
            name_attr: el.name.clone(),
            classes: el.classes.clone(),
            label: caption(el).map(str::to_string),
            texts: captions(el),
        });
    }
    map
}

/// Parse markup and build its [`ElementMap`] in one step.
pub fn element_map_from_html(html: &str) -> Result<ElementMap, NormalizeError> {
    Ok(element_map(&parse_markup(html)?))
}

/// Render the selector catalogue shown to the backend in script prompts.
pub fn render_catalogue(map: &ElementMap) -> String {
    let mut out = String::new();
    out.push_str("AVAILABLE HTML SELECTORS:\n");
    out.push_str(&format!(
        "IDs: {}\n",
        map.ids.iter().cloned().collect::<Vec<_>>().join(", ")
    ));
    out.push_str(&format!(
        "Names: {}\n",
        map.names.iter().cloned().collect::<Vec<_>>().join(", ")
    ));
    out.push_str(&format!(
        "Classes: {}\n",
        map.classes.iter().cloned().collect::<Vec<_>>().join(", ")
    ));
    out.push_str("\nINTERACTIVE ELEMENTS:\n");
    for d in map.elements.values() {
        let mut line = format!("- {}: <{}", d.name, d.tag);
        if !d.element_type.is_empty() {
            line.push_str(&format!(" type=\"{}\"", d.element_type));
        }
        line.push_str(&format!("> css=`{}` xpath=`{}`", d.css, d.xpath));
        if let Some(label) = &d.label {
            line.push_str(&format!(" label=\"{}\"", label));
        }
        out.push_str(&line);
        out.push('\n');
    }
    out
}

fn semantic_name(el: &MarkupElement) -> Option<String> {
    if let Some(id) = &el.id {
        return Some(id.clone());
    }
    if let Some(name) = &el.name {
        return Some(name.clone());
    }
    let slug = slugify(caption(el)?);
    (!slug.is_empty()).then(|| format!("{}-{}", el.tag, slug))
}

fn caption(el: &MarkupElement) -> Option<&str> {
    el.label
        .as_deref()
        .or(el.text.as_deref())
        .or(el.placeholder.as_deref())
        .or(el.value.as_deref())
}

fn captions(el: &MarkupElement) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    for text in [&el.label, &el.text, &el.placeholder, &el.value]
        .into_iter()
        .flatten()
    {
        let text = text.trim();
        if !text.is_empty() && !out.iter().any(|t| t == text) {
            out.push(text.to_string());
        }
    }
    out
}

fn unique_name(map: &ElementMap, base: String) -> String {
    if map.get(&base).is_none() {
        return base;
    }
    let mut n = 2;
    loop {
        let candidate = format!("{}-{}", base, n);
        if map.get(&candidate).is_none() {
            return candidate;
        }
        n += 1;
    }
}

fn slugify(s: &str) -> String {
    let mut out = String::new();
    for c in s.chars().flat_map(char::to_lowercase) {
        if c.is_alphanumeric() {
            out.push(c);
        } else if !out.is_empty() && !out.ends_with('-') {
            out.push('-');
        }
    }
    out.trim_end_matches('-').chars().take(40).collect()
}

fn css_for(el: &MarkupElement) -> String {
    if let Some(id) = &el.id {
        return format!("#{}", id);
    }
    if let Some(name) = &el.name {
        return format!("{}[name=\"{}\"]", el.tag, name);
    }
    match el.classes.first() {
        Some(class) => format!("{}.{}", el.tag, class),
        None => el.tag.clone(),
    }
}

fn xpath_for(el: &MarkupElement) -> String {
    if let Some(id) = &el.id {
        return format!("//*[@id='{}']", id);
    }
    if let Some(name) = &el.name {
        return format!("//{}[@name='{}']", el.tag, name);
    }
    match &el.text {
        Some(text) if !text.contains('\'') => {
            format!("//{}[normalize-space()='{}']", el.tag, text)
        }
        _ => format!("//{}", el.tag),
    }
}
