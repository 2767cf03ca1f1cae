//! # LIMS Templates
//!
//! Templates describe the shape of every object the LIMS tracks: containers,
//! samples, equipment, subjects, workflows and so on. This crate provides the
//! template document model, a YAML parser, document validation, attribute
//! validation and the [`TemplateRegistry`] that hands out immutable snapshots.
//!
//! ## Features
//!
//! * YAML template documents (`template_version: "1.0"`)
//! * Typed attribute schemas with enums, ranges, patterns and inline JSON Schema
//! * Versioned templates; a loaded version is never mutated
//! * Category-tagged typed views over the generic attribute map
//!
//! ## Example
//!
//! ```
//! use lims_templates::TemplateRegistry;
//! use serde_json::json;
//!
//! let yaml = r#"
//! template_version: "1.0"
//! templates:
//!   - name: tube
//!     prefix: CON
//!     category: container
//!     attributes:
//!       - name: barcode
//!         type: string
//!         required: true
//! "#;
//!
//! let registry = TemplateRegistry::from_yaml(yaml).unwrap();
//! let tube = registry.resolve("CON").unwrap();
//!
//! let attributes = json!({ "barcode": "BC-0001" });
//! assert!(registry.validate(&tube, attributes.as_object().unwrap()).is_ok());
//! ```

mod error;
mod parser;

pub mod registry;
pub mod template;
pub mod typed;
pub mod validation;

pub use error::TemplateError;
pub use parser::parse_template_document;
pub use registry::{TemplateRegistry, TemplateSnapshot};
pub use template::{
    AttributeSpec, AttributeType, CompletionRule, Template, TemplateCategory, TemplateDocument,
    TemplateId,
};
pub use typed::{InstanceView, StatusValue};
pub use validation::ValidationError;

/// Parse and validate a template document.
///
/// # Errors
///
/// * Invalid YAML syntax or unknown attribute types
/// * Unsupported document version
/// * Validation errors (bad prefixes, duplicates, invalid attribute specs)
///
/// # Examples
///
/// ```
/// use lims_templates::{parse_and_validate_template_document, TemplateError};
///
/// let yaml = r#"
/// template_version: "1.0"
/// templates:
///   - name: tube
///     prefix: tube
///     category: container
/// "#;
///
/// match parse_and_validate_template_document(yaml) {
///     Err(TemplateError::ValidationError(err)) => {
///         assert_eq!(err.code, "ERR_TEMPLATE_INVALID_PREFIX");
///     }
///     other => panic!("expected a validation error, got {:?}", other),
/// }
/// ```
pub fn parse_and_validate_template_document(yaml_str: &str) -> Result<TemplateDocument, TemplateError> {
    let document = parse_template_document(yaml_str)?;
    validation::validate_document(&document)?;
    Ok(document)
}

/// Get the version of the template crate
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
