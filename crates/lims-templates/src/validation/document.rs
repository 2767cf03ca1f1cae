use std::collections::{HashMap, HashSet};

use lazy_static::lazy_static;
use regex::Regex;

use crate::template::{TemplateCategory, TemplateDocument};
use crate::validation::{error_codes, ValidationError, Validator};

lazy_static! {
    // EUID prefixes: one uppercase letter followed by up to seven letters or digits
    static ref PREFIX_REGEX: Regex = Regex::new(r"^[A-Z][A-Z0-9]{0,7}$").unwrap();
}

/// Whether a string is a well-formed EUID prefix
pub fn is_valid_prefix(prefix: &str) -> bool {
    PREFIX_REGEX.is_match(prefix)
}

/// Structural checks across the whole document:
/// - prefix format
/// - duplicate (prefix, version) pairs
/// - a prefix mapped to more than one category
/// - duplicate attribute names within a template
pub struct DocumentValidator;

impl DocumentValidator {
    pub fn new() -> Self {
        DocumentValidator
    }
}

impl Default for DocumentValidator {
    fn default() -> Self {
        Self::new()
    }
}

impl Validator for DocumentValidator {
    fn validate(&self, document: &TemplateDocument) -> Vec<ValidationError> {
        let mut errors = Vec::new();
        let mut seen_ids = HashSet::new();
        let mut categories: HashMap<&str, &TemplateCategory> = HashMap::new();

        for (i, template) in document.templates.iter().enumerate() {
            let path = format!("templates[{}]", i);

            if !is_valid_prefix(&template.prefix) {
                errors.push(ValidationError::new(
                    error_codes::INVALID_PREFIX,
                    format!("{}.prefix", path),
                    format!(
                        "Prefix '{}' of template '{}' must match ^[A-Z][A-Z0-9]{{0,7}}$",
                        template.prefix, template.name
                    ),
                ));
            }

            if !seen_ids.insert(template.id()) {
                errors.push(ValidationError::new(
                    error_codes::DUPLICATE_TEMPLATE,
                    path.clone(),
                    format!("Template {} is defined more than once", template.id()),
                ));
            }

            match categories.get(template.prefix.as_str()) {
                Some(existing) if *existing != &template.category => {
                    errors.push(ValidationError::new(
                        error_codes::CATEGORY_CHANGED,
                        format!("{}.category", path),
                        format!(
                            "Prefix '{}' is declared with categories '{}' and '{}'",
                            template.prefix, existing, template.category
                        ),
                    ));
                }
                Some(_) => {}
                None => {
                    categories.insert(&template.prefix, &template.category);
                }
            }

            let mut attribute_names = HashSet::new();
            for (j, attribute) in template.attributes.iter().enumerate() {
                if !attribute_names.insert(attribute.name.as_str()) {
                    errors.push(ValidationError::new(
                        error_codes::DUPLICATE_ATTRIBUTE,
                        format!("{}.attributes[{}]", path, j),
                        format!(
                            "Attribute '{}' is declared twice in template '{}'",
                            attribute.name, template.name
                        ),
                    ));
                }
            }
        }

        errors
    }
}
