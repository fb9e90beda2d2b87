//! Tool operation schemas.
//!
//! Every operation a tool advertises is described by an
//! [`OperationSchema`]: a structured-call schema (JSON-schema parameters,
//! used for `<invoke name="...">` blocks and capability catalogs), an
//! xml-tag schema (inline tag form), or both.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Where an xml-tag parameter is taken from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParamSource {
    /// Attribute on the tool tag.
    Attribute,
    /// Child element; the element name is the parameter name.
    Element,
    /// Text content of the tool tag itself.
    Text,
}

/// One parameter mapping of an xml-tag schema.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct XmlMapping {
    pub param: String,
    pub source: ParamSource,
}

/// Inline-tag form of an operation.
///
/// Tag names use the hyphenated display alias (`browser-navigate-to`);
/// lookup normalizes back to the canonical underscored name.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct XmlSchema {
    pub tag_name: String,
    pub mappings: Vec<XmlMapping>,
}

impl XmlSchema {
    pub fn new(tag_name: impl Into<String>) -> Self {
        Self {
            tag_name: tag_name.into(),
            mappings: Vec::new(),
        }
    }

    pub fn with_param(mut self, param: impl Into<String>, source: ParamSource) -> Self {
        self.mappings.push(XmlMapping {
            param: param.into(),
            source,
        });
        self
    }

    /// Parameter fed by the tag's text content, if any.
    pub fn text_param(&self) -> Option<&str> {
        self.mappings
            .iter()
            .find(|m| m.source == ParamSource::Text)
            .map(|m| m.param.as_str())
    }
}

/// Full description of one callable operation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OperationSchema {
    /// Canonical underscored operation name, unique per registry.
    pub name: String,
    pub description: String,
    /// JSON-schema object for structured calls (`{"type": "object", ...}`).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parameters: Option<Value>,
    /// Inline-tag form, when the operation supports it.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub xml: Option<XmlSchema>,
}

impl OperationSchema {
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            parameters: None,
            xml: None,
        }
    }

    pub fn with_parameters(mut self, parameters: Value) -> Self {
        self.parameters = Some(parameters);
        self
    }

    pub fn with_xml(mut self, xml: XmlSchema) -> Self {
        self.xml = Some(xml);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn operation_can_carry_both_schema_kinds() {
        let op = OperationSchema::new("browser_navigate_to", "Navigate to a URL")
            .with_parameters(json!({
                "type": "object",
                "properties": { "url": { "type": "string" } },
                "required": ["url"]
            }))
            .with_xml(XmlSchema::new("browser-navigate-to").with_param("url", ParamSource::Text));

        assert!(op.parameters.is_some());
        let xml = op.xml.unwrap();
        assert_eq!(xml.tag_name, "browser-navigate-to");
        assert_eq!(xml.text_param(), Some("url"));
    }

    #[test]
    fn text_param_absent_without_text_mapping() {
        let xml = XmlSchema::new("shell").with_param("command", ParamSource::Element);
        assert_eq!(xml.text_param(), None);
    }
}
