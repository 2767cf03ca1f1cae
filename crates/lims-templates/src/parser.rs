use crate::error::TemplateError;
use crate::template::{TemplateDocument, SUPPORTED_TEMPLATE_VERSION};

/// Parse a YAML string into a TemplateDocument.
///
/// Only the document shape and version are checked here; prefix formats,
/// attribute specs and the rest are handled by the validation module.
pub fn parse_template_document(yaml_str: &str) -> Result<TemplateDocument, TemplateError> {
    let document: TemplateDocument = serde_yaml::from_str(yaml_str)?;

    if document.template_version != SUPPORTED_TEMPLATE_VERSION {
        return Err(TemplateError::UnsupportedVersion(document.template_version));
    }

    Ok(document)
}
