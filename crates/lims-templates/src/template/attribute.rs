use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Value type of a template attribute
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AttributeType {
    /// UTF-8 text, optionally length bounded and pattern constrained
    String,
    /// Whole number
    Integer,
    /// Any JSON number
    Number,
    /// true / false
    Boolean,
    /// RFC 3339 timestamp, normalised to UTC
    Datetime,
    /// One of a fixed set of strings
    Enum,
    /// Arbitrary JSON, optionally constrained by an inline JSON Schema
    Json,
}

impl AttributeType {
    /// Lower-case name as written in template documents
    pub fn as_str(&self) -> &'static str {
        match self {
            AttributeType::String => "string",
            AttributeType::Integer => "integer",
            AttributeType::Number => "number",
            AttributeType::Boolean => "boolean",
            AttributeType::Datetime => "datetime",
            AttributeType::Enum => "enum",
            AttributeType::Json => "json",
        }
    }
}

/// One entry of a template's ordered attribute schema
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttributeSpec {
    /// Attribute key in the instance's attribute map
    pub name: String,

    /// Value type
    #[serde(rename = "type")]
    pub attr_type: AttributeType,

    /// Whether the attribute must be present (after defaults are applied)
    #[serde(default)]
    pub required: bool,

    /// Value used when the attribute is absent
    #[serde(default)]
    pub default: Option<Value>,

    /// Allowed values for `enum` attributes
    #[serde(default)]
    pub values: Vec<String>,

    /// Lower bound: numeric value, or character count for strings
    #[serde(default)]
    pub min: Option<f64>,

    /// Upper bound: numeric value, or character count for strings
    #[serde(default)]
    pub max: Option<f64>,

    /// Regular expression a `string` attribute must match
    #[serde(default)]
    pub pattern: Option<String>,

    /// Inline JSON Schema for `json` attributes
    #[serde(default)]
    pub schema: Option<Value>,

    /// Optional human-readable description
    #[serde(default)]
    pub description: Option<String>,
}

impl AttributeSpec {
    /// Minimal spec with the given name and type
    pub fn new(name: impl Into<String>, attr_type: AttributeType) -> Self {
        Self {
            name: name.into(),
            attr_type,
            required: false,
            default: None,
            values: Vec::new(),
            min: None,
            max: None,
            pattern: None,
            schema: None,
            description: None,
        }
    }

    /// Builder: mark as required
    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    /// Builder: set allowed enum values
    pub fn with_values<I, S>(mut self, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.values = values.into_iter().map(Into::into).collect();
        self
    }

    /// Builder: set a default value
    pub fn with_default(mut self, value: Value) -> Self {
        self.default = Some(value);
        self
    }

    /// Builder: set numeric (or length) bounds
    pub fn with_bounds(mut self, min: Option<f64>, max: Option<f64>) -> Self {
        self.min = min;
        self.max = max;
        self
    }
}

/// How the workflow engine recognises a completed instance
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompletionRule {
    /// Attribute inspected for completion
    #[serde(default = "default_completion_attribute")]
    pub attribute: String,

    /// String values of that attribute that mean "complete"
    #[serde(default = "default_completion_values")]
    pub values: Vec<String>,
}

fn default_completion_attribute() -> String {
    "status".to_string()
}

fn default_completion_values() -> Vec<String> {
    vec!["complete".to_string()]
}

impl Default for CompletionRule {
    fn default() -> Self {
        Self {
            attribute: default_completion_attribute(),
            values: default_completion_values(),
        }
    }
}

impl CompletionRule {
    /// Whether the attributes mark the instance complete
    pub fn is_complete(&self, attributes: &Map<String, Value>) -> bool {
        match attributes.get(&self.attribute) {
            Some(Value::Bool(flag)) => *flag,
            Some(Value::String(value)) => self.values.iter().any(|v| v == value),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_attribute_spec_parses_from_yaml() {
        let yaml = r#"
        name: volume_ml
        type: number
        required: true
        min: 0
        max: 50
        "#;
        let spec: AttributeSpec = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(spec.attr_type, AttributeType::Number);
        assert!(spec.required);
        assert_eq!(spec.min, Some(0.0));
        assert_eq!(spec.max, Some(50.0));
        assert!(spec.values.is_empty());
    }

    #[test]
    fn test_completion_rule_defaults() {
        let rule = CompletionRule::default();
        let mut attrs = Map::new();
        assert!(!rule.is_complete(&attrs));

        attrs.insert("status".into(), json!("in_progress"));
        assert!(!rule.is_complete(&attrs));

        attrs.insert("status".into(), json!("complete"));
        assert!(rule.is_complete(&attrs));

        attrs.insert("status".into(), json!(true));
        assert!(rule.is_complete(&attrs));
    }

    #[test]
    fn test_custom_completion_rule() {
        let rule: CompletionRule = serde_yaml::from_str("attribute: qc\nvalues: [pass, waived]").unwrap();
        let mut attrs = Map::new();
        attrs.insert("qc".into(), json!("waived"));
        assert!(rule.is_complete(&attrs));
        attrs.insert("qc".into(), json!("fail"));
        assert!(!rule.is_complete(&attrs));
    }
}
