use chrono::{DateTime, SecondsFormat, Utc};
use jsonschema::JSONSchema;
use regex::Regex;
use serde_json::{Map, Number, Value};

use crate::template::{AttributeSpec, AttributeType, Template};
use crate::typed::InstanceView;
use crate::validation::{error_codes, ValidationError};

/// Validate an attribute map against a template.
///
/// Defaults are applied for absent attributes, then every attribute is checked
/// against its spec. On success the normalised map is returned (datetimes in
/// RFC 3339 UTC, integers written as JSON integers). On failure every
/// violation is returned, in schema order followed by unknown attributes.
/// A map that passes every spec must also decode into the category's typed
/// view, so anything stored can later be viewed.
pub fn validate_attributes(
    template: &Template,
    attributes: &Map<String, Value>,
) -> Result<Map<String, Value>, Vec<ValidationError>> {
    let mut errors = Vec::new();
    let mut normalised = Map::new();

    for spec in &template.attributes {
        let value = match attributes.get(&spec.name) {
            Some(Value::Null) | None => spec.default.as_ref(),
            Some(value) => Some(value),
        };

        match value {
            Some(value) => match check_value(spec, value) {
                Ok(value) => {
                    normalised.insert(spec.name.clone(), value);
                }
                Err(err) => errors.push(err),
            },
            None if spec.required => errors.push(ValidationError::new(
                error_codes::MISSING_REQUIRED_ATTRIBUTE,
                spec.name.clone(),
                format!("Attribute '{}' is required by template {}", spec.name, template.id()),
            )),
            None => {}
        }
    }

    for (name, value) in attributes {
        if template.attribute(name).is_some() {
            continue;
        }
        if template.allow_additional_attributes {
            normalised.insert(name.clone(), value.clone());
        } else {
            errors.push(ValidationError::new(
                error_codes::UNKNOWN_ATTRIBUTE,
                name.clone(),
                format!("Attribute '{}' is not declared by template {}", name, template.id()),
            ));
        }
    }

    if errors.is_empty() {
        if let Err(err) = InstanceView::from_category(&template.category, &normalised) {
            errors.push(ValidationError::new(
                error_codes::INVALID_TYPE,
                "",
                format!("Attributes do not fit the {} view: {}", template.category, err),
            ));
        }
    }

    if errors.is_empty() {
        Ok(normalised)
    } else {
        Err(errors)
    }
}

/// Check one value against its attribute spec, returning the normalised value
pub fn check_value(spec: &AttributeSpec, value: &Value) -> Result<Value, ValidationError> {
    let type_error = || {
        ValidationError::new(
            error_codes::INVALID_TYPE,
            spec.name.clone(),
            format!("Expected {} but got {}", spec.attr_type.as_str(), json_type_name(value)),
        )
    };

    match spec.attr_type {
        AttributeType::String => {
            let text = value.as_str().ok_or_else(type_error)?;
            check_bounds(spec, text.chars().count() as f64, "length")?;
            if let Some(pattern) = &spec.pattern {
                let regex = Regex::new(pattern).map_err(|e| {
                    ValidationError::new(
                        error_codes::INVALID_PATTERN,
                        spec.name.clone(),
                        format!("Pattern does not compile: {}", e),
                    )
                })?;
                if !regex.is_match(text) {
                    return Err(ValidationError::new(
                        error_codes::PATTERN_MISMATCH,
                        spec.name.clone(),
                        format!("'{}' does not match pattern '{}'", text, pattern),
                    ));
                }
            }
            Ok(value.clone())
        }
        AttributeType::Integer => {
            let integer = as_integer(value).ok_or_else(type_error)?;
            check_bounds(spec, integer as f64, "value")?;
            Ok(Value::Number(Number::from(integer)))
        }
        AttributeType::Number => {
            let number = value.as_f64().ok_or_else(type_error)?;
            check_bounds(spec, number, "value")?;
            Ok(value.clone())
        }
        AttributeType::Boolean => {
            value.as_bool().ok_or_else(type_error)?;
            Ok(value.clone())
        }
        AttributeType::Datetime => {
            let text = value.as_str().ok_or_else(type_error)?;
            let parsed = DateTime::parse_from_rfc3339(text).map_err(|e| {
                ValidationError::new(
                    error_codes::INVALID_TYPE,
                    spec.name.clone(),
                    format!("'{}' is not an RFC 3339 timestamp: {}", text, e),
                )
            })?;
            let utc = parsed.with_timezone(&Utc);
            Ok(Value::String(utc.to_rfc3339_opts(SecondsFormat::AutoSi, true)))
        }
        AttributeType::Enum => {
            let text = value.as_str().ok_or_else(type_error)?;
            if !spec.values.iter().any(|allowed| allowed == text) {
                return Err(ValidationError::new(
                    error_codes::VALUE_NOT_ALLOWED,
                    spec.name.clone(),
                    format!("'{}' is not one of [{}]", text, spec.values.join(", ")),
                ));
            }
            Ok(value.clone())
        }
        AttributeType::Json => {
            if let Some(schema) = &spec.schema {
                check_schema(spec, schema, value)?;
            }
            Ok(value.clone())
        }
    }
}

fn check_bounds(spec: &AttributeSpec, actual: f64, what: &str) -> Result<(), ValidationError> {
    let below = spec.min.map_or(false, |min| actual < min);
    let above = spec.max.map_or(false, |max| actual > max);
    if below || above {
        let min = spec.min.map_or_else(|| "-inf".to_string(), |m| m.to_string());
        let max = spec.max.map_or_else(|| "inf".to_string(), |m| m.to_string());
        return Err(ValidationError::new(
            error_codes::OUT_OF_RANGE,
            spec.name.clone(),
            format!("{} {} is outside [{}, {}]", what, actual, min, max),
        ));
    }
    Ok(())
}

fn check_schema(spec: &AttributeSpec, schema: &Value, value: &Value) -> Result<(), ValidationError> {
    let compiled = JSONSchema::compile(schema).map_err(|e| {
        ValidationError::new(
            error_codes::INVALID_SCHEMA,
            spec.name.clone(),
            format!("Schema does not compile: {}", e),
        )
    })?;

    let messages: Vec<String> = match compiled.validate(value) {
        Ok(()) => Vec::new(),
        Err(errors) => errors.map(|e| e.to_string()).collect(),
    };

    if messages.is_empty() {
        Ok(())
    } else {
        Err(ValidationError::new(
            error_codes::SCHEMA_MISMATCH,
            spec.name.clone(),
            messages.join("; "),
        ))
    }
}

// Integers may arrive as floats with a zero fraction (e.g. from YAML or JS clients)
fn as_integer(value: &Value) -> Option<i64> {
    if let Some(i) = value.as_i64() {
        return Some(i);
    }
    let f = value.as_f64()?;
    if f.fract() == 0.0 && f >= i64::MIN as f64 && f < i64::MAX as f64 {
        Some(f as i64)
    } else {
        None
    }
}

fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::template::TemplateCategory;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn tube_template() -> Template {
        let mut template = Template::new("tube", "CON", TemplateCategory::Container);
        template.attributes = vec![
            AttributeSpec::new("barcode", AttributeType::String).required(),
            AttributeSpec::new("volume_ml", AttributeType::Number).with_bounds(Some(0.0), Some(50.0)),
            AttributeSpec::new("kind", AttributeType::Enum)
                .with_values(["tube", "plate"])
                .with_default(json!("tube")),
            AttributeSpec::new("wells", AttributeType::Integer),
            AttributeSpec::new("received_at", AttributeType::Datetime),
            AttributeSpec::new("frozen", AttributeType::Boolean),
        ];
        template
    }

    fn attrs(value: Value) -> Map<String, Value> {
        match value {
            Value::Object(map) => map,
            _ => panic!("test attributes must be an object"),
        }
    }

    #[test]
    fn test_defaults_are_applied() {
        let result = validate_attributes(&tube_template(), &attrs(json!({ "barcode": "BC1" }))).unwrap();
        assert_eq!(Value::Object(result), json!({ "barcode": "BC1", "kind": "tube" }));
    }

    #[test]
    fn test_missing_required_attribute() {
        let errors = validate_attributes(&tube_template(), &Map::new()).unwrap_err();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].code, error_codes::MISSING_REQUIRED_ATTRIBUTE);
        assert_eq!(errors[0].field, "barcode");
    }

    #[test]
    fn test_every_violation_is_reported() {
        let errors = validate_attributes(
            &tube_template(),
            &attrs(json!({
                "barcode": 12,
                "volume_ml": 75.5,
                "kind": "bag",
                "colour": "red"
            })),
        )
        .unwrap_err();
        let codes: Vec<_> = errors.iter().map(|e| (e.field.as_str(), e.code)).collect();
        assert_eq!(
            codes,
            vec![
                ("barcode", error_codes::INVALID_TYPE),
                ("volume_ml", error_codes::OUT_OF_RANGE),
                ("kind", error_codes::VALUE_NOT_ALLOWED),
                ("colour", error_codes::UNKNOWN_ATTRIBUTE),
            ]
        );
    }

    #[test]
    fn test_additional_attributes_pass_through_when_allowed() {
        let mut template = tube_template();
        template.allow_additional_attributes = true;
        let result = validate_attributes(&template, &attrs(json!({ "barcode": "BC1", "colour": "red" }))).unwrap();
        assert_eq!(result.get("colour"), Some(&json!("red")));
    }

    #[test]
    fn test_null_means_absent() {
        let errors = validate_attributes(&tube_template(), &attrs(json!({ "barcode": null }))).unwrap_err();
        assert_eq!(errors[0].code, error_codes::MISSING_REQUIRED_ATTRIBUTE);
    }

    #[test]
    fn test_datetime_is_normalised_to_utc() {
        let result = validate_attributes(
            &tube_template(),
            &attrs(json!({ "barcode": "BC1", "received_at": "2024-03-01T10:30:00+02:00" })),
        )
        .unwrap();
        assert_eq!(result.get("received_at"), Some(&json!("2024-03-01T08:30:00Z")));
    }

    #[test]
    fn test_integer_accepts_whole_floats_only() {
        let spec = AttributeSpec::new("wells", AttributeType::Integer);
        assert_eq!(check_value(&spec, &json!(96.0)).unwrap(), json!(96));
        assert_eq!(check_value(&spec, &json!(96)).unwrap(), json!(96));
        assert_eq!(check_value(&spec, &json!(96.5)).unwrap_err().code, error_codes::INVALID_TYPE);
        assert_eq!(check_value(&spec, &json!("96")).unwrap_err().code, error_codes::INVALID_TYPE);
    }

    #[test]
    fn test_integer_rejects_floats_past_i64_max() {
        let spec = AttributeSpec::new("wells", AttributeType::Integer);
        // 2^63 is exactly i64::MAX as f64, one past the largest i64
        assert_eq!(check_value(&spec, &json!(9223372036854775808.0)).unwrap_err().code, error_codes::INVALID_TYPE);
        assert_eq!(check_value(&spec, &json!(-9223372036854775808.0)).unwrap(), json!(i64::MIN));
    }

    #[test]
    fn test_boolean_status_passes_the_typed_view() {
        let mut template = Template::new("blood", "SMP", TemplateCategory::Content);
        template.attributes = vec![AttributeSpec::new("status", AttributeType::Boolean)];
        let result = validate_attributes(&template, &attrs(json!({ "status": true }))).unwrap();
        assert_eq!(Value::Object(result), json!({ "status": true }));
    }

    #[test]
    fn test_well_known_field_of_the_wrong_shape_is_rejected() {
        let mut template = Template::new("rack", "RCK", TemplateCategory::Container);
        template.attributes = vec![AttributeSpec::new("capacity", AttributeType::String)];
        let errors = validate_attributes(&template, &attrs(json!({ "capacity": "lots" }))).unwrap_err();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].code, error_codes::INVALID_TYPE);
        assert!(errors[0].reason.contains("container view"));
    }

    #[test]
    fn test_string_length_and_pattern() {
        let mut spec = AttributeSpec::new("barcode", AttributeType::String).with_bounds(Some(3.0), Some(6.0));
        spec.pattern = Some("^BC[0-9]+$".into());

        assert!(check_value(&spec, &json!("BC123")).is_ok());
        assert_eq!(check_value(&spec, &json!("BC")).unwrap_err().code, error_codes::OUT_OF_RANGE);
        assert_eq!(check_value(&spec, &json!("XX123")).unwrap_err().code, error_codes::PATTERN_MISMATCH);
    }

    #[test]
    fn test_json_attribute_with_inline_schema() {
        let mut spec = AttributeSpec::new("layout", AttributeType::Json);
        spec.schema = Some(json!({
            "type": "object",
            "required": ["rows", "cols"],
            "properties": {
                "rows": { "type": "integer" },
                "cols": { "type": "integer" }
            }
        }));

        assert!(check_value(&spec, &json!({ "rows": 8, "cols": 12 })).is_ok());
        let err = check_value(&spec, &json!({ "rows": 8 })).unwrap_err();
        assert_eq!(err.code, error_codes::SCHEMA_MISMATCH);
        assert!(err.reason.contains("cols"));
    }

    #[test]
    fn test_json_attribute_without_schema_accepts_anything() {
        let spec = AttributeSpec::new("notes", AttributeType::Json);
        assert!(check_value(&spec, &json!([1, "two", { "three": 3 }])).is_ok());
    }
}
