use serde::{Deserialize, Serialize};
use std::fmt;

/// Wildcard accepted in relationship category lists
pub const ANY_CATEGORY: &str = "*";

/// The kind of domain object a template describes.
///
/// Known categories get their own variant so call sites can match on them;
/// anything else configured by an administrator is kept as `Other`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum TemplateCategory {
    /// Tubes, plates, boxes and other physical holders
    Container,
    /// Samples, aliquots, libraries and other material
    Content,
    /// Instruments and tools
    Equipment,
    /// A workflow definition or queue
    Workflow,
    /// A single stage within a workflow
    WorkflowStep,
    /// A patient, donor or other study subject
    Subject,
    /// A data artefact produced by processing
    Data,
    /// Health related events recorded against a subject
    HealthEvent,
    /// Any category not known at compile time
    Other(String),
}

impl TemplateCategory {
    /// Canonical snake_case name of the category
    pub fn as_str(&self) -> &str {
        match self {
            TemplateCategory::Container => "container",
            TemplateCategory::Content => "content",
            TemplateCategory::Equipment => "equipment",
            TemplateCategory::Workflow => "workflow",
            TemplateCategory::WorkflowStep => "workflow_step",
            TemplateCategory::Subject => "subject",
            TemplateCategory::Data => "data",
            TemplateCategory::HealthEvent => "health_event",
            TemplateCategory::Other(name) => name.as_str(),
        }
    }

    /// Whether an entry of an allowed-category list admits this category
    pub fn matches(&self, entry: &str) -> bool {
        entry == ANY_CATEGORY || entry.eq_ignore_ascii_case(self.as_str())
    }

    /// Whether any entry of the list admits this category
    pub fn is_admitted_by(&self, entries: &[String]) -> bool {
        entries.iter().any(|entry| self.matches(entry))
    }
}

impl From<String> for TemplateCategory {
    fn from(value: String) -> Self {
        match value.to_ascii_lowercase().as_str() {
            "container" => TemplateCategory::Container,
            "content" => TemplateCategory::Content,
            "equipment" => TemplateCategory::Equipment,
            "workflow" => TemplateCategory::Workflow,
            "workflow_step" => TemplateCategory::WorkflowStep,
            "subject" => TemplateCategory::Subject,
            "data" => TemplateCategory::Data,
            "health_event" => TemplateCategory::HealthEvent,
            _ => TemplateCategory::Other(value),
        }
    }
}

impl From<&str> for TemplateCategory {
    fn from(value: &str) -> Self {
        TemplateCategory::from(value.to_string())
    }
}

impl From<TemplateCategory> for String {
    fn from(category: TemplateCategory) -> Self {
        category.as_str().to_string()
    }
}

impl fmt::Display for TemplateCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_known_categories_round_trip_through_strings() {
        for name in ["container", "content", "equipment", "workflow", "workflow_step",
                     "subject", "data", "health_event"] {
            let category = TemplateCategory::from(name);
            assert!(!matches!(category, TemplateCategory::Other(_)), "{name} should be known");
            assert_eq!(category.as_str(), name);
        }
    }

    #[test]
    fn test_custom_category_is_preserved() {
        let category = TemplateCategory::from("reagent_lot");
        assert_eq!(category, TemplateCategory::Other("reagent_lot".to_string()));
        assert_eq!(category.to_string(), "reagent_lot");
    }

    #[test]
    fn test_wildcard_and_case_insensitive_matching() {
        let category = TemplateCategory::Container;
        assert!(category.matches("*"));
        assert!(category.matches("Container"));
        assert!(!category.matches("content"));
        assert!(!category.is_admitted_by(&[]));
    }

    #[test]
    fn test_serde_uses_plain_strings() {
        let yaml = serde_yaml::to_string(&TemplateCategory::HealthEvent).unwrap();
        assert_eq!(yaml.trim(), "health_event");
        let parsed: TemplateCategory = serde_yaml::from_str("data").unwrap();
        assert_eq!(parsed, TemplateCategory::Data);
    }
}
