use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

mod attribute;
mod category;

pub use attribute::{AttributeSpec, AttributeType, CompletionRule};
pub use category::{TemplateCategory, ANY_CATEGORY};

use crate::error::TemplateError;

/// The document version this crate understands
pub const SUPPORTED_TEMPLATE_VERSION: &str = "1.0";

/// A complete template document as loaded from YAML
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TemplateDocument {
    /// Document format version, must be "1.0"
    pub template_version: String,

    /// Template definitions in declaration order
    #[serde(default)]
    pub templates: Vec<Template>,
}

impl TemplateDocument {
    /// An empty document of the supported version
    pub fn empty() -> Self {
        Self {
            template_version: SUPPORTED_TEMPLATE_VERSION.to_string(),
            templates: Vec::new(),
        }
    }
}

/// Identity of one immutable template version
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TemplateId {
    /// EUID prefix of the template
    pub prefix: String,
    /// Version number, starting at 1
    pub version: u32,
}

impl TemplateId {
    pub fn new(prefix: impl Into<String>, version: u32) -> Self {
        Self { prefix: prefix.into(), version }
    }
}

impl fmt::Display for TemplateId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@v{}", self.prefix, self.version)
    }
}

impl FromStr for TemplateId {
    type Err = TemplateError;

    /// Parses the `PREFIX@vN` form
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (prefix, version) = s
            .split_once("@v")
            .ok_or_else(|| TemplateError::UnknownTemplate(s.to_string()))?;
        let version = version
            .parse::<u32>()
            .map_err(|_| TemplateError::UnknownTemplate(s.to_string()))?;
        if prefix.is_empty() {
            return Err(TemplateError::UnknownTemplate(s.to_string()));
        }
        Ok(TemplateId::new(prefix, version))
    }
}

fn default_template_version() -> u32 {
    1
}

/// A versioned template definition.
///
/// Templates are never mutated once loaded; a change is expressed as a new
/// version with the same prefix.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Template {
    /// Human-readable name
    pub name: String,

    /// EUID prefix, e.g. `CON`
    pub prefix: String,

    /// Category of the objects this template describes
    pub category: TemplateCategory,

    /// Template version
    #[serde(default = "default_template_version")]
    pub version: u32,

    /// Optional description
    #[serde(default)]
    pub description: Option<String>,

    /// Ordered attribute schema
    #[serde(default)]
    pub attributes: Vec<AttributeSpec>,

    /// Accept attributes not listed in `attributes`
    #[serde(default)]
    pub allow_additional_attributes: bool,

    /// Categories allowed as lineage parents (`*` for any)
    #[serde(default)]
    pub allowed_parent_categories: Vec<String>,

    /// Categories allowed as lineage children (`*` for any)
    #[serde(default)]
    pub allowed_child_categories: Vec<String>,

    /// Relationship types this template takes part in; empty allows any
    #[serde(default)]
    pub allowed_relationship_types: Vec<String>,

    /// Completion rule used by the workflow state engine
    #[serde(default)]
    pub completion: CompletionRule,
}

impl Template {
    /// Minimal template, mostly useful for tests and programmatic setup
    pub fn new(name: impl Into<String>, prefix: impl Into<String>, category: TemplateCategory) -> Self {
        Self {
            name: name.into(),
            prefix: prefix.into(),
            category,
            version: 1,
            description: None,
            attributes: Vec::new(),
            allow_additional_attributes: false,
            allowed_parent_categories: Vec::new(),
            allowed_child_categories: Vec::new(),
            allowed_relationship_types: Vec::new(),
            completion: CompletionRule::default(),
        }
    }

    pub fn id(&self) -> TemplateId {
        TemplateId::new(self.prefix.clone(), self.version)
    }

    /// Look up an attribute spec by name
    pub fn attribute(&self, name: &str) -> Option<&AttributeSpec> {
        self.attributes.iter().find(|a| a.name == name)
    }

    /// Whether an instance of `category` may be a lineage child of this template
    pub fn accepts_child(&self, category: &TemplateCategory) -> bool {
        category.is_admitted_by(&self.allowed_child_categories)
    }

    /// Whether an instance of `category` may be a lineage parent of this template
    pub fn accepts_parent(&self, category: &TemplateCategory) -> bool {
        category.is_admitted_by(&self.allowed_parent_categories)
    }

    /// Whether this template takes part in relationships of the given type
    pub fn allows_relationship(&self, relationship_type: &str) -> bool {
        self.allowed_relationship_types.is_empty()
            || self
                .allowed_relationship_types
                .iter()
                .any(|t| t == relationship_type)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_template_id_display_and_parse() {
        let id = TemplateId::new("CON", 3);
        assert_eq!(id.to_string(), "CON@v3");
        assert_eq!("CON@v3".parse::<TemplateId>().unwrap(), id);
        assert!("CON".parse::<TemplateId>().is_err());
        assert!("@v1".parse::<TemplateId>().is_err());
        assert!("CON@vx".parse::<TemplateId>().is_err());
    }

    #[test]
    fn test_template_defaults_from_yaml() {
        let yaml = r#"
        name: tube
        prefix: CON
        category: container
        "#;
        let template: Template = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(template.version, 1);
        assert!(template.attributes.is_empty());
        assert!(!template.allow_additional_attributes);
        assert_eq!(template.completion, CompletionRule::default());
        assert_eq!(template.id(), TemplateId::new("CON", 1));
    }

    #[test]
    fn test_relationship_rules() {
        let mut template = Template::new("tube", "CON", TemplateCategory::Container);
        assert!(!template.accepts_child(&TemplateCategory::Content));
        assert!(template.allows_relationship("contains"));

        template.allowed_child_categories = vec!["content".into()];
        template.allowed_parent_categories = vec!["*".into()];
        template.allowed_relationship_types = vec!["contains".into()];

        assert!(template.accepts_child(&TemplateCategory::Content));
        assert!(!template.accepts_child(&TemplateCategory::Data));
        assert!(template.accepts_parent(&TemplateCategory::Other("rack".into())));
        assert!(template.allows_relationship("contains"));
        assert!(!template.allows_relationship("derived_from"));
    }
}
