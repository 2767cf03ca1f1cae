use std::error::Error;
use std::fmt;

use crate::error::TemplateError;
use crate::template::TemplateDocument;

mod attributes;
mod document;
mod schema;

pub use attributes::{check_value, validate_attributes};
pub use document::is_valid_prefix;

/// A single validation failure, either in a template document or in an
/// instance's attributes
#[derive(Debug, Clone, PartialEq)]
pub struct ValidationError {
    /// Error code (one of [`error_codes`])
    pub code: &'static str,

    /// Attribute name, or document path such as `templates[2].attributes[0]`
    pub field: String,

    /// Human-readable reason
    pub reason: String,
}

impl ValidationError {
    pub fn new(code: &'static str, field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            code,
            field: field.into(),
            reason: reason.into(),
        }
    }
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.field.is_empty() {
            write!(f, "{}: {}", self.code, self.reason)
        } else {
            write!(f, "{}: {} (at {})", self.code, self.reason, self.field)
        }
    }
}

impl Error for ValidationError {}

/// Validation error codes
pub mod error_codes {
    /// Prefix does not match `^[A-Z][A-Z0-9]{0,7}$`
    pub const INVALID_PREFIX: &str = "ERR_TEMPLATE_INVALID_PREFIX";

    /// The same (prefix, version) appears twice
    pub const DUPLICATE_TEMPLATE: &str = "ERR_TEMPLATE_DUPLICATE_TEMPLATE";

    /// Two attributes of one template share a name
    pub const DUPLICATE_ATTRIBUTE: &str = "ERR_TEMPLATE_DUPLICATE_ATTRIBUTE";

    /// An `enum` attribute lists no values
    pub const MISSING_ENUM_VALUES: &str = "ERR_TEMPLATE_MISSING_ENUM_VALUES";

    /// A `pattern` does not compile
    pub const INVALID_PATTERN: &str = "ERR_TEMPLATE_INVALID_PATTERN";

    /// An inline JSON Schema does not compile
    pub const INVALID_SCHEMA: &str = "ERR_TEMPLATE_INVALID_SCHEMA";

    /// `min` is greater than `max`
    pub const INVALID_RANGE: &str = "ERR_TEMPLATE_INVALID_RANGE";

    /// A `default` does not satisfy its own attribute spec
    pub const INVALID_DEFAULT: &str = "ERR_TEMPLATE_INVALID_DEFAULT";

    /// An existing (prefix, version) was redefined with different content
    pub const IMMUTABLE_VERSION: &str = "ERR_TEMPLATE_IMMUTABLE_VERSION";

    /// A prefix changed category
    pub const CATEGORY_CHANGED: &str = "ERR_TEMPLATE_CATEGORY_CHANGED";

    /// Required attribute absent
    pub const MISSING_REQUIRED_ATTRIBUTE: &str = "ERR_ATTRIBUTE_MISSING_REQUIRED";

    /// Attribute value has the wrong JSON type
    pub const INVALID_TYPE: &str = "ERR_ATTRIBUTE_INVALID_TYPE";

    /// Enum value outside the allowed set
    pub const VALUE_NOT_ALLOWED: &str = "ERR_ATTRIBUTE_VALUE_NOT_ALLOWED";

    /// Numeric value or string length outside `min`/`max`
    pub const OUT_OF_RANGE: &str = "ERR_ATTRIBUTE_OUT_OF_RANGE";

    /// String does not match the attribute's pattern
    pub const PATTERN_MISMATCH: &str = "ERR_ATTRIBUTE_PATTERN_MISMATCH";

    /// JSON value rejected by the attribute's inline schema
    pub const SCHEMA_MISMATCH: &str = "ERR_ATTRIBUTE_SCHEMA_MISMATCH";

    /// Attribute not declared by the template
    pub const UNKNOWN_ATTRIBUTE: &str = "ERR_ATTRIBUTE_UNKNOWN";
}

/// A trait for validators that check one aspect of a template document
pub trait Validator {
    /// Validate the document and return every problem found
    fn validate(&self, document: &TemplateDocument) -> Vec<ValidationError>;
}

/// Validate a parsed template document
pub fn validate_document(document: &TemplateDocument) -> Result<(), TemplateError> {
    let validators: Vec<Box<dyn Validator>> = vec![
        Box::new(document::DocumentValidator::new()),
        Box::new(schema::AttributeSchemaValidator::new()),
    ];

    let mut errors = Vec::new();
    for validator in validators {
        errors.extend(validator.validate(document));
    }

    if !errors.is_empty() {
        return Err(TemplateError::from_validation_errors(errors));
    }

    Ok(())
}
