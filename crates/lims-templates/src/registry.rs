use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use parking_lot::RwLock;
use serde_json::{Map, Value};
use tracing::{debug, info, warn};

use crate::error::TemplateError;
use crate::parser::parse_template_document;
use crate::template::{Template, TemplateCategory, TemplateDocument, TemplateId};
use crate::validation::{error_codes, validate_attributes, validate_document, ValidationError};

/// An immutable view of every known template version.
///
/// Snapshots are shared through `Arc`; a reload builds a new snapshot and
/// never touches one that readers already hold.
#[derive(Debug, Clone, Default)]
pub struct TemplateSnapshot {
    generation: u64,
    // Versions per prefix, ascending
    by_prefix: BTreeMap<String, Vec<Arc<Template>>>,
}

impl TemplateSnapshot {
    /// Monotonic counter incremented by every successful reload
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Resolve a prefix or a category name to the latest matching template.
    ///
    /// Prefixes are tried first. A category shared by several prefixes is
    /// ambiguous and reported as unknown, naming the candidates.
    pub fn resolve(&self, category_or_prefix: &str) -> Result<Arc<Template>, TemplateError> {
        if let Some(template) = self.latest(category_or_prefix) {
            return Ok(template);
        }

        let category = TemplateCategory::from(category_or_prefix);
        let candidates: Vec<Arc<Template>> = self
            .templates()
            .filter(|t| t.category == category)
            .collect();

        match candidates.len() {
            0 => Err(TemplateError::UnknownTemplate(category_or_prefix.to_string())),
            1 => Ok(candidates[0].clone()),
            _ => {
                let prefixes: Vec<&str> = candidates.iter().map(|t| t.prefix.as_str()).collect();
                Err(TemplateError::UnknownTemplate(format!(
                    "category '{}' is ambiguous between prefixes [{}]",
                    category_or_prefix,
                    prefixes.join(", ")
                )))
            }
        }
    }

    /// Exact template version
    pub fn resolve_id(&self, id: &TemplateId) -> Result<Arc<Template>, TemplateError> {
        self.by_prefix
            .get(&id.prefix)
            .and_then(|versions| versions.iter().find(|t| t.version == id.version))
            .cloned()
            .ok_or_else(|| TemplateError::UnknownTemplate(id.to_string()))
    }

    /// Latest version registered for a prefix
    pub fn latest(&self, prefix: &str) -> Option<Arc<Template>> {
        self.by_prefix.get(prefix).and_then(|v| v.last()).cloned()
    }

    /// All known prefixes, sorted
    pub fn prefixes(&self) -> Vec<String> {
        self.by_prefix.keys().cloned().collect()
    }

    /// Latest version of every template
    pub fn templates(&self) -> impl Iterator<Item = Arc<Template>> + '_ {
        self.by_prefix.values().filter_map(|v| v.last().cloned())
    }

    /// Every version of one prefix, oldest first
    pub fn versions(&self, prefix: &str) -> Vec<Arc<Template>> {
        self.by_prefix.get(prefix).cloned().unwrap_or_default()
    }

    /// Whether the snapshot holds no templates at all
    pub fn is_empty(&self) -> bool {
        self.by_prefix.is_empty()
    }

    /// Build the successor snapshot with the templates of `document` merged in.
    ///
    /// Existing versions are kept. Redefining an existing version with
    /// different content, or moving a prefix to another category, is an error.
    fn merge(&self, document: &TemplateDocument) -> Result<TemplateSnapshot, TemplateError> {
        let mut next = self.by_prefix.clone();
        let mut errors = Vec::new();

        for (i, template) in document.templates.iter().enumerate() {
            let path = format!("templates[{}]", i);
            let versions = next.entry(template.prefix.clone()).or_default();

            if let Some(existing) = versions.iter().find(|t| t.version == template.version) {
                if existing.as_ref() != template {
                    errors.push(ValidationError::new(
                        error_codes::IMMUTABLE_VERSION,
                        path,
                        format!(
                            "Template {} already exists with different content; publish a new version instead",
                            template.id()
                        ),
                    ));
                }
                continue;
            }

            if let Some(previous) = versions.first() {
                if previous.category != template.category {
                    errors.push(ValidationError::new(
                        error_codes::CATEGORY_CHANGED,
                        format!("{}.category", path),
                        format!(
                            "Prefix '{}' belongs to category '{}' and cannot become '{}'",
                            template.prefix, previous.category, template.category
                        ),
                    ));
                    continue;
                }
            }

            versions.push(Arc::new(template.clone()));
            versions.sort_by_key(|t| t.version);
        }

        if !errors.is_empty() {
            return Err(TemplateError::from_validation_errors(errors));
        }

        Ok(TemplateSnapshot {
            generation: self.generation + 1,
            by_prefix: next,
        })
    }
}

/// Process-wide holder of the current template snapshot
#[derive(Debug, Default)]
pub struct TemplateRegistry {
    current: RwLock<Arc<TemplateSnapshot>>,
}

impl TemplateRegistry {
    /// A registry with no templates
    pub fn empty() -> Self {
        Self::default()
    }

    /// Build a registry from an already parsed document
    pub fn from_document(document: &TemplateDocument) -> Result<Self, TemplateError> {
        let registry = Self::empty();
        registry.reload(document)?;
        Ok(registry)
    }

    /// Parse, validate and load a YAML document
    pub fn from_yaml(yaml_str: &str) -> Result<Self, TemplateError> {
        let document = parse_template_document(yaml_str)?;
        Self::from_document(&document)
    }

    /// Load a YAML document from disk
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, TemplateError> {
        let path = path.as_ref();
        debug!(path = %path.display(), "Loading template document");
        let yaml = std::fs::read_to_string(path)?;
        Self::from_yaml(&yaml)
    }

    /// The current snapshot
    pub fn snapshot(&self) -> Arc<TemplateSnapshot> {
        self.current.read().clone()
    }

    /// Resolve against the current snapshot
    pub fn resolve(&self, category_or_prefix: &str) -> Result<Arc<Template>, TemplateError> {
        self.snapshot().resolve(category_or_prefix)
    }

    /// Resolve an exact version against the current snapshot
    pub fn resolve_id(&self, id: &TemplateId) -> Result<Arc<Template>, TemplateError> {
        self.snapshot().resolve_id(id)
    }

    /// Validate attributes, reporting the first violation
    pub fn validate(
        &self,
        template: &Template,
        attributes: &Map<String, Value>,
    ) -> Result<Map<String, Value>, ValidationError> {
        validate_attributes(template, attributes).map_err(|mut errors| errors.remove(0))
    }

    /// Validate attributes, reporting every violation
    pub fn validate_all(
        &self,
        template: &Template,
        attributes: &Map<String, Value>,
    ) -> Result<Map<String, Value>, Vec<ValidationError>> {
        validate_attributes(template, attributes)
    }

    /// Install a new snapshot with the templates of `document` merged in.
    ///
    /// On any error the previous snapshot stays in force.
    pub fn reload(&self, document: &TemplateDocument) -> Result<Arc<TemplateSnapshot>, TemplateError> {
        validate_document(document)?;

        let mut current = self.current.write();
        let next = match current.merge(document) {
            Ok(next) => Arc::new(next),
            Err(err) => {
                warn!(error = %err, "Template reload rejected, keeping current snapshot");
                return Err(err);
            }
        };

        *current = next.clone();
        info!(
            generation = next.generation(),
            prefixes = next.by_prefix.len(),
            "Template registry reloaded"
        );
        Ok(next)
    }

    /// Parse a YAML document and reload from it
    pub fn reload_yaml(&self, yaml_str: &str) -> Result<Arc<TemplateSnapshot>, TemplateError> {
        let document = parse_template_document(yaml_str)?;
        self.reload(&document)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    const DOC: &str = r#"
template_version: "1.0"
templates:
  - name: tube
    prefix: CON
    category: container
    attributes:
      - name: barcode
        type: string
        required: true
  - name: plate
    prefix: PLT
    category: container
  - name: sample
    prefix: SMP
    category: content
"#;

    #[test]
    fn test_empty_registry_has_an_empty_snapshot() {
        assert!(TemplateRegistry::empty().snapshot().is_empty());
        assert!(!TemplateRegistry::from_yaml(DOC).unwrap().snapshot().is_empty());
    }

    #[test]
    fn test_resolve_by_prefix_and_category() {
        let registry = TemplateRegistry::from_yaml(DOC).unwrap();
        assert_eq!(registry.resolve("CON").unwrap().name, "tube");
        assert_eq!(registry.resolve("content").unwrap().prefix, "SMP");
    }

    #[test]
    fn test_ambiguous_category_is_unknown() {
        let registry = TemplateRegistry::from_yaml(DOC).unwrap();
        match registry.resolve("container") {
            Err(TemplateError::UnknownTemplate(msg)) => {
                assert!(msg.contains("CON"));
                assert!(msg.contains("PLT"));
            }
            other => panic!("Expected UnknownTemplate, got {:?}", other),
        }
    }

    #[test]
    fn test_unknown_reference() {
        let registry = TemplateRegistry::from_yaml(DOC).unwrap();
        assert!(matches!(registry.resolve("XYZ"), Err(TemplateError::UnknownTemplate(_))));
        assert!(matches!(
            registry.resolve_id(&TemplateId::new("CON", 9)),
            Err(TemplateError::UnknownTemplate(_))
        ));
    }

    #[test]
    fn test_reload_adds_versions_and_keeps_old_ones() {
        let registry = TemplateRegistry::from_yaml(DOC).unwrap();
        let before = registry.snapshot();

        registry
            .reload_yaml(
                r#"
template_version: "1.0"
templates:
  - name: tube
    prefix: CON
    category: container
    version: 2
    attributes:
      - name: barcode
        type: string
"#,
            )
            .unwrap();

        let after = registry.snapshot();
        assert_eq!(after.generation(), before.generation() + 1);
        assert_eq!(registry.resolve("CON").unwrap().version, 2);
        assert_eq!(registry.resolve_id(&TemplateId::new("CON", 1)).unwrap().version, 1);
        assert_eq!(after.versions("CON").len(), 2);
        // Unmentioned prefixes survive a partial reload
        assert!(registry.resolve("SMP").is_ok());
        // Readers of the old snapshot are unaffected
        assert_eq!(before.resolve("CON").unwrap().version, 1);
    }

    #[test]
    fn test_reload_rejects_redefined_version() {
        let registry = TemplateRegistry::from_yaml(DOC).unwrap();
        let err = registry
            .reload_yaml(
                r#"
template_version: "1.0"
templates:
  - name: tube renamed
    prefix: CON
    category: container
"#,
            )
            .unwrap_err();
        assert_eq!(err.error_code(), error_codes::IMMUTABLE_VERSION);
        assert_eq!(registry.resolve("CON").unwrap().name, "tube");
    }

    #[test]
    fn test_reload_rejects_category_change() {
        let registry = TemplateRegistry::from_yaml(DOC).unwrap();
        let generation = registry.snapshot().generation();
        let err = registry
            .reload_yaml(
                r#"
template_version: "1.0"
templates:
  - name: tube
    prefix: CON
    category: content
    version: 2
"#,
            )
            .unwrap_err();
        assert_eq!(err.error_code(), error_codes::CATEGORY_CHANGED);
        assert_eq!(registry.snapshot().generation(), generation);
    }

    #[test]
    fn test_identical_reload_is_accepted() {
        let registry = TemplateRegistry::from_yaml(DOC).unwrap();
        assert!(registry.reload_yaml(DOC).is_ok());
        assert_eq!(registry.snapshot().versions("CON").len(), 1);
    }

    #[test]
    fn test_validate_reports_first_or_all() {
        let registry = TemplateRegistry::from_yaml(DOC).unwrap();
        let tube = registry.resolve("CON").unwrap();
        let attrs = json!({ "colour": "red" });
        let attrs = attrs.as_object().unwrap();

        let first = registry.validate(&tube, attrs).unwrap_err();
        assert_eq!(first.code, error_codes::MISSING_REQUIRED_ATTRIBUTE);

        let all = registry.validate_all(&tube, attrs).unwrap_err();
        assert_eq!(all.len(), 2);
    }

    #[test]
    fn test_from_file_missing_path() {
        let err = TemplateRegistry::from_file("/nonexistent/templates.yaml").unwrap_err();
        assert!(matches!(err, TemplateError::IoError(_)));
    }
}
