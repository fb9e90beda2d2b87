//! Dual-format tool-invocation parser for LLM responses.
//!
//! Supports two formats that the model may mix freely in one response:
//!
//! # Format A — structured call block
//! ```xml
//! <function_calls>
//! <invoke name="create_file">
//! <parameter name="path">a.txt</parameter>
//! <parameter name="content">hi</parameter>
//! </invoke>
//! </function_calls>
//! ```
//!
//! # Format B — inline tag
//! ```xml
//! <shell><command>ls /tmp</command></shell>
//! ```
//! The tag name is the tool identifier (hyphen form allowed), attributes
//! and child elements become parameters, and the tag's own text content
//! feeds the parameter the operation's xml schema marks as `Text`.
//!
//! Container tags (`function_calls`, `tools`) and the synthetic root are
//! transparent: the parser flattens them recursively into the ordered list
//! of candidate tool elements.  Prose around the tags never reaches the
//! XML reader — the scanner extracts closed tag regions first, so a
//! malformed region costs one parse error without hiding later calls.

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use super::registry::ToolRegistry;
use super::schema::{ParamSource, XmlSchema};

/// Container tags that are transparent to parsing.
const CONTAINER_TAGS: [&str; 2] = ["function_calls", "tools"];
/// Element name of a structured call inside a container.
const INVOKE_TAG: &str = "invoke";

/// Which syntax produced a [`ToolCall`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallSource {
    Structured,
    Xml,
}

/// A tool invocation extracted from an LLM response.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolCall {
    /// Tool name as written by the model (hyphen form allowed; the
    /// executor normalizes on lookup).
    pub name: String,
    pub kwargs: Map<String, Value>,
    pub source: CallSource,
    /// Unique id for correlating events of this call.
    pub call_id: String,
}

/// Outcome of parsing one full response.
#[derive(Debug, Default)]
pub struct ParsedResponse {
    /// Calls in left-to-right source order, capped at `max_calls`.
    pub calls: Vec<ToolCall>,
    /// Number of regions that failed XML parsing.
    pub parse_errors: usize,
    /// True when calls beyond the cap were discarded.
    pub truncated: bool,
}

// ─── Region scanning ──────────────────────────────────────────────────────────

/// A closed tag region found in a buffer.
#[derive(Debug, PartialEq)]
pub struct TagRegion {
    pub tag: String,
    /// Byte offset of the region's `<`.
    pub start: usize,
    /// Byte offset one past the closing `>`.
    pub end: usize,
}

/// Find the first *closed* region of any known tag at or after the start
/// of `text`.  Returns `None` when no known tag is closed yet — streaming
/// callers retry once more bytes arrive.
pub fn next_closed_region(text: &str, known_tags: &HashSet<String>) -> Option<TagRegion> {
    let mut idx = 0;
    while let Some(rel) = text[idx..].find('<') {
        let start = idx + rel;
        let after = &text[start + 1..];
        let name_len = after
            .find(|c: char| c.is_whitespace() || c == '>' || c == '/')
            .unwrap_or(after.len());
        let name = &after[..name_len];

        if !name.is_empty() && known_tags.contains(name) {
            let body = &text[start..];
            // Self-closing form: the first `>` arrives as `/>` before any
            // nested markup.
            if let Some(gt) = body.find('>') {
                if body[..gt].ends_with('/') {
                    return Some(TagRegion {
                        tag: name.to_string(),
                        start,
                        end: start + gt + 1,
                    });
                }
                let close = format!("</{name}>");
                if let Some(close_rel) = body.find(&close) {
                    return Some(TagRegion {
                        tag: name.to_string(),
                        start,
                        end: start + close_rel + close.len(),
                    });
                }
            }
            // Known tag opened but not yet closed: nothing further in this
            // buffer can be complete without it.
            return None;
        }
        idx = start + 1;
    }
    None
}

// ─── Mini-DOM ─────────────────────────────────────────────────────────────────

/// Failed-parse signal for one tag region.  The caller decides whether to
/// surface an error or treat the region as plain text.
#[derive(Debug, thiserror::Error)]
#[error("invalid tool markup: {0}")]
pub struct ParseError(String);

impl ParseError {
    fn from_xml(e: impl std::fmt::Display) -> Self {
        Self(e.to_string())
    }
}

#[derive(Debug, Default)]
struct XmlNode {
    name: String,
    attrs: Vec<(String, String)>,
    children: Vec<XmlNode>,
    text: String,
}

fn element_node(e: &quick_xml::events::BytesStart<'_>) -> Result<XmlNode, ParseError> {
    let mut node = XmlNode {
        name: String::from_utf8_lossy(e.name().as_ref()).into_owned(),
        ..XmlNode::default()
    };
    for attr in e.attributes() {
        let attr = attr.map_err(ParseError::from_xml)?;
        let key = String::from_utf8_lossy(attr.key.as_ref()).into_owned();
        let value = attr
            .unescape_value()
            .map_err(ParseError::from_xml)?
            .into_owned();
        node.attrs.push((key, value));
    }
    Ok(node)
}

/// Decode a general entity reference name (`amp`, `#38`, `#x26`, ...).
fn resolve_entity(name: &str) -> Option<char> {
    match name {
        "amp" => Some('&'),
        "lt" => Some('<'),
        "gt" => Some('>'),
        "quot" => Some('"'),
        "apos" => Some('\''),
        _ => {
            let digits = name.strip_prefix('#')?;
            let code = match digits.strip_prefix(['x', 'X']) {
                Some(hex) => u32::from_str_radix(hex, 16).ok()?,
                None => digits.parse::<u32>().ok()?,
            };
            char::from_u32(code)
        }
    }
}

/// Build a DOM from a string wrapped in a synthetic root, so multiple tool
/// elements with no shared root still parse.
fn build_dom(body: &str) -> Result<XmlNode, ParseError> {
    let wrapped = format!("<sp-root>{body}</sp-root>");
    let mut reader = quick_xml::Reader::from_str(&wrapped);

    let mut stack: Vec<XmlNode> = Vec::new();
    loop {
        match reader.read_event().map_err(ParseError::from_xml)? {
            quick_xml::events::Event::Start(e) => {
                stack.push(element_node(&e)?);
            }
            quick_xml::events::Event::Empty(e) => {
                let node = element_node(&e)?;
                if let Some(parent) = stack.last_mut() {
                    parent.children.push(node);
                }
            }
            quick_xml::events::Event::Text(t) => {
                if let Some(parent) = stack.last_mut() {
                    let decoded = t.decode().map_err(ParseError::from_xml)?;
                    let unescaped =
                        quick_xml::escape::unescape(&decoded).map_err(ParseError::from_xml)?;
                    parent.text.push_str(&unescaped);
                }
            }
            quick_xml::events::Event::CData(t) => {
                if let Some(parent) = stack.last_mut() {
                    parent
                        .text
                        .push_str(&String::from_utf8_lossy(&t.into_inner()));
                }
            }
            quick_xml::events::Event::GeneralRef(r) => {
                // The reader hands general references through unparsed.
                if let Some(parent) = stack.last_mut() {
                    let name = String::from_utf8_lossy(&r).into_owned();
                    match resolve_entity(&name) {
                        Some(c) => parent.text.push(c),
                        // Unknown entity: keep the raw reference text.
                        None => parent.text.push_str(&format!("&{name};")),
                    }
                }
            }
            quick_xml::events::Event::End(_) => {
                let node = match stack.pop() {
                    Some(node) => node,
                    None => break,
                };
                match stack.last_mut() {
                    Some(parent) => parent.children.push(node),
                    None => return Ok(node),
                }
            }
            quick_xml::events::Event::Eof => break,
            _ => {}
        }
    }
    // Unbalanced input: quick-xml normally errors first, but guard anyway.
    Err(ParseError("unexpected end of input".to_string()))
}

// ─── ToolParser ───────────────────────────────────────────────────────────────

/// Parses tool invocations out of assistant text.
pub struct ToolParser {
    /// xml tag name → schema, from the registry.
    xml_schemas: HashMap<String, XmlSchema>,
    /// Tag names the scanner recognizes (containers + registered tags).
    known_tags: HashSet<String>,
    max_calls: usize,
}

impl ToolParser {
    pub fn new(xml_schemas: HashMap<String, XmlSchema>, max_calls: usize) -> Self {
        let mut known_tags: HashSet<String> =
            CONTAINER_TAGS.iter().map(|t| t.to_string()).collect();
        known_tags.insert(INVOKE_TAG.to_string());
        known_tags.extend(xml_schemas.keys().cloned());
        Self {
            xml_schemas,
            known_tags,
            max_calls,
        }
    }

    /// Build a parser recognizing every xml schema in `registry`.
    pub fn from_registry(registry: &ToolRegistry, max_calls: usize) -> Self {
        let mut schemas = HashMap::new();
        for entry in registry.operations() {
            if let Some(xml) = &entry.schema.xml {
                schemas.insert(xml.tag_name.clone(), xml.clone());
            }
        }
        Self::new(schemas, max_calls)
    }

    /// Tag names the scanner recognizes.
    pub fn known_tags(&self) -> &HashSet<String> {
        &self.known_tags
    }

    /// Parse a complete response, honoring the call cap.
    pub fn parse_response(&self, text: &str) -> ParsedResponse {
        let mut parsed = ParsedResponse::default();
        let mut offset = 0;

        while let Some(region) = next_closed_region(&text[offset..], &self.known_tags) {
            let body = &text[offset + region.start..offset + region.end];
            offset += region.end;

            match self.parse_region(body) {
                Ok(calls) => {
                    for call in calls {
                        if parsed.calls.len() < self.max_calls {
                            parsed.calls.push(call);
                        } else {
                            parsed.truncated = true;
                        }
                    }
                }
                Err(e) => {
                    tracing::warn!(error = %e, "malformed tool invocation region");
                    parsed.parse_errors += 1;
                }
            }
            if parsed.truncated {
                break;
            }
        }
        parsed
    }

    /// Parse one extracted tag region into zero or more calls.
    pub fn parse_region(&self, body: &str) -> Result<Vec<ToolCall>, ParseError> {
        let root = build_dom(body)?;
        let mut calls = Vec::new();
        for child in &root.children {
            self.collect_calls(child, &mut calls);
        }
        Ok(calls)
    }

    fn collect_calls(&self, node: &XmlNode, out: &mut Vec<ToolCall>) {
        if CONTAINER_TAGS.contains(&node.name.as_str()) {
            for child in &node.children {
                self.collect_calls(child, out);
            }
        } else if node.name == INVOKE_TAG {
            if let Some(call) = parse_invoke(node) {
                out.push(call);
            }
        } else if let Some(call) = self.parse_inline(node) {
            out.push(call);
        }
    }

    /// Format B: the element itself names the tool.
    fn parse_inline(&self, node: &XmlNode) -> Option<ToolCall> {
        let mut kwargs = Map::new();
        for (key, value) in &node.attrs {
            kwargs.insert(key.clone(), Value::String(value.clone()));
        }
        for child in &node.children {
            kwargs.insert(
                child.name.clone(),
                Value::String(child.text.trim().to_string()),
            );
        }

        let text = node.text.trim();
        if !text.is_empty() {
            let text_param = self
                .xml_schemas
                .get(&node.name)
                .and_then(|s| s.text_param())
                .unwrap_or("text");
            if node.children.is_empty() || self.xml_schemas.contains_key(&node.name) {
                kwargs
                    .entry(text_param.to_string())
                    .or_insert_with(|| Value::String(text.to_string()));
            }
        }

        Some(ToolCall {
            name: node.name.clone(),
            kwargs,
            source: CallSource::Xml,
            call_id: Uuid::new_v4().to_string(),
        })
    }
}

/// Format A: `<invoke name="X">` with `<parameter name="p">value</parameter>`
/// children.
fn parse_invoke(node: &XmlNode) -> Option<ToolCall> {
    let name = node
        .attrs
        .iter()
        .find(|(k, _)| k == "name")
        .map(|(_, v)| v.clone())?;

    let mut kwargs = Map::new();
    for child in &node.children {
        if child.name != "parameter" {
            continue;
        }
        let Some(param) = child.attrs.iter().find(|(k, _)| k == "name").map(|(_, v)| v) else {
            continue;
        };
        kwargs.insert(
            param.clone(),
            Value::String(child.text.trim().to_string()),
        );
    }

    Some(ToolCall {
        name,
        kwargs,
        source: CallSource::Structured,
        call_id: Uuid::new_v4().to_string(),
    })
}

// ─── Tests ────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn parser_with_tags(tags: &[(&str, Option<&str>)]) -> ToolParser {
        let mut schemas = HashMap::new();
        for (tag, text_param) in tags {
            let mut schema = XmlSchema::new(*tag);
            if let Some(param) = text_param {
                schema = schema.with_param(*param, ParamSource::Text);
            }
            schemas.insert(tag.to_string(), schema);
        }
        ToolParser::new(schemas, 10)
    }

    #[test]
    fn structured_block_yields_one_call() {
        let parser = parser_with_tags(&[]);
        let text = r#"<function_calls><invoke name="create_file"><parameter name="path">a.txt</parameter><parameter name="content">hi</parameter></invoke></function_calls>"#;

        let parsed = parser.parse_response(text);
        assert_eq!(parsed.calls.len(), 1);
        assert_eq!(parsed.parse_errors, 0);

        let call = &parsed.calls[0];
        assert_eq!(call.name, "create_file");
        assert_eq!(call.source, CallSource::Structured);
        assert_eq!(call.kwargs["path"], "a.txt");
        assert_eq!(call.kwargs["content"], "hi");
    }

    #[test]
    fn inline_tag_with_child_elements() {
        let parser = parser_with_tags(&[("shell", None)]);
        let text = "Let me check.\n<shell><command>ls /tmp</command></shell>\nDone.";

        let parsed = parser.parse_response(text);
        assert_eq!(parsed.calls.len(), 1);
        let call = &parsed.calls[0];
        assert_eq!(call.name, "shell");
        assert_eq!(call.source, CallSource::Xml);
        assert_eq!(call.kwargs["command"], "ls /tmp");
    }

    #[test]
    fn inline_tag_attributes_become_parameters() {
        let parser = parser_with_tags(&[("browser-navigate-to", Some("url"))]);
        let text = r#"<browser-navigate-to retries="2">https://example.com</browser-navigate-to>"#;

        let parsed = parser.parse_response(text);
        assert_eq!(parsed.calls.len(), 1);
        let call = &parsed.calls[0];
        assert_eq!(call.name, "browser-navigate-to");
        assert_eq!(call.kwargs["retries"], "2");
        // Text content maps to the schema's Text parameter.
        assert_eq!(call.kwargs["url"], "https://example.com");
    }

    #[test]
    fn container_tags_flatten_recursively() {
        let parser = parser_with_tags(&[("shell", None)]);
        let text = r#"<tools><shell><command>pwd</command></shell><function_calls><invoke name="read_file"><parameter name="path">x</parameter></invoke></function_calls></tools>"#;

        let parsed = parser.parse_response(text);
        assert_eq!(parsed.calls.len(), 2);
        assert_eq!(parsed.calls[0].name, "shell");
        assert_eq!(parsed.calls[1].name, "read_file");
    }

    #[test]
    fn calls_keep_source_order_across_formats() {
        let parser = parser_with_tags(&[("shell", None)]);
        let text = r#"
            <shell><command>first</command></shell>
            <function_calls><invoke name="second"><parameter name="a">1</parameter></invoke></function_calls>
            <shell><command>third</command></shell>
        "#;

        let parsed = parser.parse_response(text);
        let names: Vec<_> = parsed.calls.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["shell", "second", "shell"]);
        assert_eq!(parsed.calls[0].kwargs["command"], "first");
        assert_eq!(parsed.calls[2].kwargs["command"], "third");
    }

    #[test]
    fn cap_discards_excess_calls() {
        let parser = ToolParser::new(
            HashMap::from([("shell".to_string(), XmlSchema::new("shell"))]),
            10,
        );
        let text = (0..12)
            .map(|i| format!("<shell><command>cmd {i}</command></shell>"))
            .collect::<Vec<_>>()
            .join("\n");

        let parsed = parser.parse_response(&text);
        assert_eq!(parsed.calls.len(), 10);
        assert!(parsed.truncated);
        assert_eq!(parsed.calls[9].kwargs["command"], "cmd 9");
    }

    #[test]
    fn malformed_region_counts_one_error_and_later_calls_survive() {
        let parser = parser_with_tags(&[("shell", None)]);
        let text = r#"<shell><command>a & b</command></shell>
<shell><command>ok</command></shell>"#;

        let parsed = parser.parse_response(text);
        assert_eq!(parsed.parse_errors, 1);
        assert_eq!(parsed.calls.len(), 1);
        assert_eq!(parsed.calls[0].kwargs["command"], "ok");
    }

    #[test]
    fn plain_text_yields_nothing() {
        let parser = parser_with_tags(&[("shell", None)]);
        let parsed = parser.parse_response("The answer is 42. No tools needed, even if a < b.");
        assert!(parsed.calls.is_empty());
        assert_eq!(parsed.parse_errors, 0);
    }

    #[test]
    fn unclosed_tag_is_ignored() {
        let parser = parser_with_tags(&[("shell", None)]);
        let parsed = parser.parse_response("<shell><command>never finished");
        assert!(parsed.calls.is_empty());
    }

    #[test]
    fn entities_unescape_in_parameter_values() {
        let parser = parser_with_tags(&[]);
        let text = r#"<function_calls><invoke name="create_file"><parameter name="content">a &amp; b</parameter></invoke></function_calls>"#;
        let parsed = parser.parse_response(text);
        assert_eq!(parsed.calls[0].kwargs["content"], "a & b");
    }

    #[test]
    fn next_closed_region_reports_offsets() {
        let known: HashSet<String> = HashSet::from(["shell".to_string()]);
        let text = "prefix <shell><command>x</command></shell> suffix";
        let region = next_closed_region(text, &known).unwrap();
        assert_eq!(region.tag, "shell");
        assert_eq!(&text[region.start..region.end], "<shell><command>x</command></shell>");

        // Open but unclosed → None until more bytes arrive.
        assert!(next_closed_region("pre <shell><command>", &known).is_none());
    }

    #[test]
    fn self_closing_known_tag_closes_region() {
        let known: HashSet<String> = HashSet::from(["complete".to_string()]);
        let region = next_closed_region("done <complete/>", &known).unwrap();
        assert_eq!(region.tag, "complete");
    }
}
