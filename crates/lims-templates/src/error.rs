use thiserror::Error;
use crate::validation::ValidationError;
use std::fmt;

/// All possible errors that can occur while loading or using templates
#[derive(Error, Debug)]
pub enum TemplateError {
    /// Errors that occur during YAML parsing
    #[error("YAML parsing error: {0}")]
    YamlError(#[from] serde_yaml::Error),

    /// Errors that occur during JSON processing (typed views, schema values)
    #[error("JSON processing error: {0}")]
    JsonError(#[from] serde_json::Error),

    /// Reading a template file failed
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    /// A single validation error
    #[error("Validation error: {0}")]
    ValidationError(#[from] ValidationError),

    /// Multiple validation errors
    #[error("{}", MultipleErrorsFormat(.0))]
    MultipleValidationErrors(Vec<ValidationError>),

    /// Unsupported template document version
    #[error("Unsupported template document version: {0}")]
    UnsupportedVersion(String),

    /// No template matches the requested category, prefix or id
    #[error("Unknown template: {0}")]
    UnknownTemplate(String),

    /// Internal error
    #[error("Internal error: {0}")]
    InternalError(String),
}

// Helper struct to format multiple errors
struct MultipleErrorsFormat<'a>(&'a [ValidationError]);

impl fmt::Display for MultipleErrorsFormat<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Multiple validation errors ({} issues):", self.0.len())?;
        for (i, err) in self.0.iter().enumerate() {
            write!(f, "\n  {}. {}", i + 1, err)?;
        }
        Ok(())
    }
}

impl TemplateError {
    /// Create a TemplateError from a vector of validation errors
    pub fn from_validation_errors(mut errors: Vec<ValidationError>) -> Self {
        match errors.len() {
            0 => TemplateError::InternalError(
                "Called from_validation_errors with empty vector".to_string(),
            ),
            1 => TemplateError::ValidationError(errors.remove(0)),
            _ => TemplateError::MultipleValidationErrors(errors),
        }
    }

    /// Get the error code for this error
    pub fn error_code(&self) -> &'static str {
        match self {
            TemplateError::YamlError(_) => "ERR_TEMPLATE_YAML_PARSE",
            TemplateError::JsonError(_) => "ERR_TEMPLATE_JSON",
            TemplateError::IoError(_) => "ERR_TEMPLATE_IO",
            TemplateError::ValidationError(err) => err.code,
            TemplateError::MultipleValidationErrors(_) => "ERR_TEMPLATE_VALIDATION_MULTIPLE",
            TemplateError::UnsupportedVersion(_) => "ERR_TEMPLATE_UNSUPPORTED_VERSION",
            TemplateError::UnknownTemplate(_) => "ERR_TEMPLATE_UNKNOWN",
            TemplateError::InternalError(_) => "ERR_TEMPLATE_INTERNAL",
        }
    }

    /// All validation errors carried by this error (empty for other kinds)
    pub fn validation_errors(&self) -> Vec<ValidationError> {
        match self {
            TemplateError::ValidationError(err) => vec![err.clone()],
            TemplateError::MultipleValidationErrors(errs) => errs.clone(),
            _ => Vec::new(),
        }
    }
}
