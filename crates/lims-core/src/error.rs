use lims_templates::{TemplateError, ValidationError as AttributeValidationError};
use thiserror::Error;

use crate::domain::euid::Euid;

/// Core error type for the LIMS instance engine
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CoreError {
    /// Attributes rejected by the template, or a malformed request
    #[error("Validation error on '{field}': {reason}")]
    ValidationError {
        /// Offending attribute or request field
        field: String,
        /// Why it was rejected
        reason: String,
    },

    /// No template matches the requested category, prefix or version
    #[error("Unknown template: {0}")]
    UnknownTemplate(String),

    /// No sequence counter is registered for the prefix
    #[error("Unknown prefix: no sequence counter registered for '{0}'")]
    UnknownPrefix(String),

    /// The allocator could not produce an EUID (e.g. counter exhausted)
    #[error("Allocation error: {0}")]
    AllocationError(String),

    /// Instance or edge not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// The templates of the two endpoints do not permit the relationship
    #[error("Relationship '{relationship_type}' not allowed from {parent} to {child}: {reason}")]
    RelationshipNotAllowed {
        /// Parent EUID
        parent: Euid,
        /// Child EUID
        child: Euid,
        /// Requested relationship type
        relationship_type: String,
        /// Which rule failed
        reason: String,
    },

    /// Inserting the edge would close a cycle
    #[error("Cycle detected: {}", format_path(.path))]
    CycleDetected {
        /// Offending path, starting and ending at the requested parent
        path: Vec<Euid>,
    },

    /// The instance changed since the caller read it
    #[error("Concurrent modification of {euid}: expected version {expected}, found {actual}")]
    ConcurrentModification {
        /// Instance being updated
        euid: Euid,
        /// Version the caller based the change on
        expected: u64,
        /// Version currently stored
        actual: u64,
    },

    /// The operation is not valid in the current state
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// State store error
    #[error("State store error: {0}")]
    StateStoreError(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    SerializationError(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    ConfigurationError(String),
}

fn format_path(path: &[Euid]) -> String {
    path.iter()
        .map(|e| e.as_str())
        .collect::<Vec<_>>()
        .join(" -> ")
}

impl CoreError {
    /// Stable machine-readable code
    pub fn error_code(&self) -> &'static str {
        match self {
            CoreError::ValidationError { .. } => "ERR_CORE_VALIDATION",
            CoreError::UnknownTemplate(_) => "ERR_CORE_UNKNOWN_TEMPLATE",
            CoreError::UnknownPrefix(_) => "ERR_CORE_UNKNOWN_PREFIX",
            CoreError::AllocationError(_) => "ERR_CORE_ALLOCATION",
            CoreError::NotFound(_) => "ERR_CORE_NOT_FOUND",
            CoreError::RelationshipNotAllowed { .. } => "ERR_CORE_RELATIONSHIP_NOT_ALLOWED",
            CoreError::CycleDetected { .. } => "ERR_CORE_CYCLE_DETECTED",
            CoreError::ConcurrentModification { .. } => "ERR_CORE_CONCURRENT_MODIFICATION",
            CoreError::InvalidState(_) => "ERR_CORE_INVALID_STATE",
            CoreError::StateStoreError(_) => "ERR_CORE_STATE_STORE",
            CoreError::SerializationError(_) => "ERR_CORE_SERIALIZATION",
            CoreError::ConfigurationError(_) => "ERR_CORE_CONFIGURATION",
        }
    }

    /// Whether retrying the same request may succeed
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            CoreError::ConcurrentModification { .. } | CoreError::StateStoreError(_)
        )
    }

    /// Errors that point at a configuration gap rather than a bad request
    pub fn is_operational_alert(&self) -> bool {
        matches!(
            self,
            CoreError::UnknownTemplate(_) | CoreError::UnknownPrefix(_) | CoreError::AllocationError(_)
        )
    }
}

impl From<AttributeValidationError> for CoreError {
    fn from(err: AttributeValidationError) -> Self {
        CoreError::ValidationError {
            field: err.field,
            reason: format!("{} ({})", err.reason, err.code),
        }
    }
}

impl From<TemplateError> for CoreError {
    fn from(err: TemplateError) -> Self {
        match err {
            TemplateError::UnknownTemplate(name) => CoreError::UnknownTemplate(name),
            TemplateError::JsonError(e) => CoreError::SerializationError(e.to_string()),
            other => CoreError::ConfigurationError(other.to_string()),
        }
    }
}

impl From<serde_json::Error> for CoreError {
    fn from(err: serde_json::Error) -> Self {
        CoreError::SerializationError(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lims_templates::validation::error_codes;

    #[test]
    fn test_cycle_display_lists_path() {
        let err = CoreError::CycleDetected {
            path: vec![Euid::from("CON-0000003"), Euid::from("CON-0000001"), Euid::from("CON-0000003")],
        };
        assert_eq!(
            err.to_string(),
            "Cycle detected: CON-0000003 -> CON-0000001 -> CON-0000003"
        );
        assert_eq!(err.error_code(), "ERR_CORE_CYCLE_DETECTED");
    }

    #[test]
    fn test_recoverable_errors() {
        let conflict = CoreError::ConcurrentModification {
            euid: Euid::from("SMP-0000001"),
            expected: 1,
            actual: 2,
        };
        assert!(conflict.is_recoverable());
        assert!(CoreError::StateStoreError("connection reset".into()).is_recoverable());
        assert!(!CoreError::NotFound("SMP-0000001".into()).is_recoverable());
        assert!(CoreError::UnknownPrefix("XYZ".into()).is_operational_alert());
    }

    #[test]
    fn test_from_attribute_validation_error() {
        let err: CoreError =
            AttributeValidationError::new(error_codes::VALUE_NOT_ALLOWED, "kind", "'bag' is not one of [tube]").into();
        match err {
            CoreError::ValidationError { field, reason } => {
                assert_eq!(field, "kind");
                assert!(reason.contains(error_codes::VALUE_NOT_ALLOWED));
            }
            other => panic!("Expected ValidationError, got {:?}", other),
        }
    }

    #[test]
    fn test_from_template_error() {
        let err: CoreError = TemplateError::UnknownTemplate("XYZ".into()).into();
        assert_eq!(err, CoreError::UnknownTemplate("XYZ".into()));

        let err: CoreError = TemplateError::UnsupportedVersion("2.0".into()).into();
        assert_eq!(err.error_code(), "ERR_CORE_CONFIGURATION");
    }

    #[test]
    fn test_from_serde_json_error() {
        let json_error = serde_json::from_str::<serde_json::Value>("invalid json").unwrap_err();
        let error: CoreError = json_error.into();
        assert!(matches!(error, CoreError::SerializationError(msg) if msg.contains("expected value")));
    }
}
