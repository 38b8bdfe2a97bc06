use once_cell::sync::Lazy;
use pulldown_cmark::{Event as MdEvent, Options, Parser as MdParser, Tag as MdTag};
use regex::Regex;
use serde_yaml::{Mapping, Value as YamlValue};
use std::{collections::BTreeSet, ops::Range, result::Result};

use crate::{
    codec::{DocCodec, ParsedDocument},
    error::DocGraphError,
    properties::{normalize_tags, Properties},
};

pub use pulldown_cmark;

pub const ID_FIELD: &str = "id";
pub const TITLE_FIELD: &str = "title";
pub const TAGS_FIELD: &str = "tags";

const FRONTMATTER_FENCE: &str = "---";

static WIKILINK: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\[\[([^\[\]\n]+?)\]\]").expect("wikilink pattern compiles"));

pub fn docgraph_md_options() -> Options {
    let mut md_options = Options::empty();
    // Only the extensions that change where code spans and blocks begin and end matter here.
    md_options.insert(Options::ENABLE_FOOTNOTES);
    md_options.insert(Options::ENABLE_GFM);
    md_options.insert(Options::ENABLE_MATH);
    md_options.insert(Options::ENABLE_STRIKETHROUGH);
    md_options.insert(Options::ENABLE_TABLES);
    md_options.insert(Options::ENABLE_TASKLISTS);
    md_options
}

/// Markdown with an optional YAML front-matter block.
#[derive(Debug, Default, Clone)]
pub struct MdCodec;

impl MdCodec {
    pub fn new() -> Self {
        MdCodec
    }
}

impl DocCodec for MdCodec {
    fn parse(&self, bytes: &[u8]) -> ParsedDocument {
        let text = String::from_utf8_lossy(bytes);
        let Some((yaml, body)) = split_frontmatter(&text) else {
            return body_only(&text);
        };

        let mapping = match serde_yaml::from_str::<YamlValue>(yaml) {
            Ok(YamlValue::Mapping(mapping)) => mapping,
            Ok(YamlValue::Null) => Mapping::new(),
            Ok(other) => {
                tracing::warn!(
                    "[MdCodec] front matter is not a mapping ({:?}), treating whole input as content",
                    other
                );
                return body_only(&text);
            }
            Err(e) => {
                tracing::warn!(
                    "[MdCodec] malformed front matter, treating whole input as content: {}",
                    e
                );
                return body_only(&text);
            }
        };

        let mut doc = ParsedDocument {
            content: body.to_string(),
            raw_links: extract_links(body),
            ..Default::default()
        };
        for (key, value) in mapping {
            let Some(key) = scalar_string(&key) else {
                tracing::warn!("[MdCodec] skipping front matter entry with non-scalar key");
                continue;
            };
            match key.as_str() {
                ID_FIELD => {
                    doc.id = scalar_string(&value).map(|id| id.trim().to_string());
                    if doc.id.is_none() {
                        tracing::warn!("[MdCodec] ignoring non-scalar '{ID_FIELD}' field");
                    }
                }
                TITLE_FIELD => doc.title = scalar_string(&value),
                TAGS_FIELD => doc.tags = parse_tags(&value),
                _ => match serde_json::to_value(&value) {
                    Ok(json) => {
                        doc.properties.insert(key, json);
                    }
                    Err(e) => {
                        tracing::warn!("[MdCodec] skipping property '{}': {}", key, e);
                    }
                },
            }
        }
        doc
    }

    fn serialize(&self, doc: &ParsedDocument) -> Result<String, DocGraphError> {
        let mut mapping = Mapping::new();
        if let Some(id) = &doc.id {
            mapping.insert(ID_FIELD.into(), id.as_str().into());
        }
        if let Some(title) = &doc.title {
            mapping.insert(TITLE_FIELD.into(), title.as_str().into());
        }
        if !doc.tags.is_empty() {
            mapping.insert(
                TAGS_FIELD.into(),
                YamlValue::Sequence(doc.tags.iter().map(|t| t.as_str().into()).collect()),
            );
        }
        for (key, value) in doc.properties.iter() {
            mapping.insert(key.as_str().into(), serde_yaml::to_value(value)?);
        }

        if mapping.is_empty() {
            if split_frontmatter(&doc.content).is_some() {
                // Body would be mistaken for a header on the next parse.
                return Ok(format!("{FRONTMATTER_FENCE}\n{FRONTMATTER_FENCE}\n{}", doc.content));
            }
            return Ok(doc.content.clone());
        }
        let yaml = serde_yaml::to_string(&YamlValue::Mapping(mapping))?;
        Ok(format!(
            "{FRONTMATTER_FENCE}\n{yaml}{FRONTMATTER_FENCE}\n{}",
            doc.content
        ))
    }
}

fn body_only(text: &str) -> ParsedDocument {
    ParsedDocument {
        content: text.to_string(),
        raw_links: extract_links(text),
        ..Default::default()
    }
}

/// Split `---\n<yaml>---\n<body>` into its yaml and body parts. The closing fence may also be
/// `...`. Returns None when the text does not open with a fence or it is never closed.
fn split_frontmatter(text: &str) -> Option<(&str, &str)> {
    let rest = text
        .strip_prefix("---\n")
        .or_else(|| text.strip_prefix("---\r\n"))?;
    let mut offset = 0;
    for line in rest.split_inclusive('\n') {
        let fence = line.trim_end_matches(['\n', '\r']);
        if fence == FRONTMATTER_FENCE || fence == "..." {
            return Some((&rest[..offset], &rest[offset + line.len()..]));
        }
        offset += line.len();
    }
    None
}

fn scalar_string(value: &YamlValue) -> Option<String> {
    match value {
        YamlValue::String(s) => Some(s.clone()),
        YamlValue::Number(n) => Some(n.to_string()),
        YamlValue::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

/// Tags may be a YAML list or a single comma/space separated string.
fn parse_tags(value: &YamlValue) -> Vec<String> {
    match value {
        YamlValue::Sequence(items) => normalize_tags(items.iter().filter_map(scalar_string)),
        YamlValue::String(s) => {
            normalize_tags(s.split(|c: char| c == ',' || c.is_whitespace()))
        }
        other => normalize_tags(scalar_string(other)),
    }
}

/// Byte ranges of fenced/indented code blocks and inline code spans.
fn code_ranges(body: &str) -> Vec<Range<usize>> {
    MdParser::new_ext(body, docgraph_md_options())
        .into_offset_iter()
        .filter_map(|(event, range)| match event {
            MdEvent::Code(_) | MdEvent::Start(MdTag::CodeBlock(_)) => Some(range),
            _ => None,
        })
        .collect()
}

/// `[[target]]`, `[[target|display]]` and `[[target#fragment]]` targets outside of code, in
/// first-seen order without duplicates. The display text is dropped; fragments are kept for the
/// resolver to strip.
pub fn extract_links(body: &str) -> Vec<String> {
    let code = code_ranges(body);
    let mut seen = BTreeSet::new();
    let mut links = Vec::new();
    for cap in WIKILINK.captures_iter(body) {
        let Some(whole) = cap.get(0) else { continue };
        if code.iter().any(|range| range.contains(&whole.start())) {
            continue;
        }
        let inner = &cap[1];
        let target = inner.split('|').next().unwrap_or(inner).trim();
        if target.is_empty() {
            continue;
        }
        if seen.insert(target.to_string()) {
            links.push(target.to_string());
        }
    }
    links
}
