use jsonschema::JSONSchema;
use regex::Regex;

use crate::template::{AttributeSpec, AttributeType, TemplateDocument};
use crate::validation::{check_value, error_codes, ValidationError, Validator};

/// Validates each attribute spec on its own:
/// - `enum` attributes list their values
/// - `min` does not exceed `max`
/// - patterns and inline JSON Schemas compile
/// - defaults satisfy the spec they belong to
pub struct AttributeSchemaValidator;

impl AttributeSchemaValidator {
    pub fn new() -> Self {
        AttributeSchemaValidator
    }

    fn validate_spec(&self, spec: &AttributeSpec, path: &str) -> Vec<ValidationError> {
        let mut errors = Vec::new();

        if spec.attr_type == AttributeType::Enum && spec.values.is_empty() {
            errors.push(ValidationError::new(
                error_codes::MISSING_ENUM_VALUES,
                format!("{}.values", path),
                format!("Enum attribute '{}' must list its allowed values", spec.name),
            ));
        }

        if let (Some(min), Some(max)) = (spec.min, spec.max) {
            if min > max {
                errors.push(ValidationError::new(
                    error_codes::INVALID_RANGE,
                    path.to_string(),
                    format!("Attribute '{}' has min {} greater than max {}", spec.name, min, max),
                ));
            }
        }

        if let Some(pattern) = &spec.pattern {
            if let Err(e) = Regex::new(pattern) {
                errors.push(ValidationError::new(
                    error_codes::INVALID_PATTERN,
                    format!("{}.pattern", path),
                    format!("Pattern of attribute '{}' does not compile: {}", spec.name, e),
                ));
            }
        }

        if let Some(schema) = &spec.schema {
            if let Err(e) = JSONSchema::compile(schema) {
                errors.push(ValidationError::new(
                    error_codes::INVALID_SCHEMA,
                    format!("{}.schema", path),
                    format!("Schema of attribute '{}' is invalid: {}", spec.name, e),
                ));
            }
        }

        // Defaults are only checked once the spec itself is sound
        if errors.is_empty() {
            if let Some(default) = &spec.default {
                if let Err(e) = check_value(spec, default) {
                    errors.push(ValidationError::new(
                        error_codes::INVALID_DEFAULT,
                        format!("{}.default", path),
                        format!("Default of attribute '{}' is invalid: {}", spec.name, e.reason),
                    ));
                }
            }
        }

        errors
    }
}

impl Default for AttributeSchemaValidator {
    fn default() -> Self {
        Self::new()
    }
}

impl Validator for AttributeSchemaValidator {
    fn validate(&self, document: &TemplateDocument) -> Vec<ValidationError> {
        let mut errors = Vec::new();
        for (i, template) in document.templates.iter().enumerate() {
            for (j, spec) in template.attributes.iter().enumerate() {
                let path = format!("templates[{}].attributes[{}]", i, j);
                errors.extend(self.validate_spec(spec, &path));
            }
        }
        errors
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn check(spec: AttributeSpec) -> Vec<ValidationError> {
        AttributeSchemaValidator::new().validate_spec(&spec, "templates[0].attributes[0]")
    }

    #[test]
    fn test_valid_specs_pass() {
        assert!(check(AttributeSpec::new("barcode", AttributeType::String)).is_empty());
        assert!(check(
            AttributeSpec::new("kind", AttributeType::Enum)
                .with_values(["tube", "plate"])
                .with_default(json!("tube"))
        )
        .is_empty());
    }

    #[test]
    fn test_inverted_range() {
        let errors = check(
            AttributeSpec::new("volume", AttributeType::Number).with_bounds(Some(10.0), Some(1.0)),
        );
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].code, error_codes::INVALID_RANGE);
    }

    #[test]
    fn test_bad_pattern() {
        let mut spec = AttributeSpec::new("barcode", AttributeType::String);
        spec.pattern = Some("([A-Z".into());
        let errors = check(spec);
        assert_eq!(errors[0].code, error_codes::INVALID_PATTERN);
    }

    #[test]
    fn test_bad_inline_schema() {
        let mut spec = AttributeSpec::new("layout", AttributeType::Json);
        spec.schema = Some(json!({ "type": "string", "pattern": "([" }));
        let errors = check(spec);
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].code, error_codes::INVALID_SCHEMA);
    }

    #[test]
    fn test_default_outside_enum() {
        let spec = AttributeSpec::new("kind", AttributeType::Enum)
            .with_values(["tube"])
            .with_default(json!("plate"));
        let errors = check(spec);
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].code, error_codes::INVALID_DEFAULT);
        assert_eq!(errors[0].field, "templates[0].attributes[0].default");
    }
}
