//! Category-tagged typed views over the generic attribute map.
//!
//! Instances are persisted as a plain JSON map. At the validation boundary
//! callers that know what they are handling can ask for a typed view, which
//! exposes the well-known fields of each category with proper Rust types and
//! keeps everything else in `extra`.

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::TemplateError;
use crate::template::TemplateCategory;

/// A `status` attribute: free text, or a boolean completion flag
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum StatusValue {
    Flag(bool),
    Text(String),
}

impl StatusValue {
    /// The textual status, if it is one
    pub fn as_text(&self) -> Option<&str> {
        match self {
            StatusValue::Text(text) => Some(text),
            StatusValue::Flag(_) => None,
        }
    }
}

/// Tubes, plates, racks and other holders
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ContainerAttributes {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub barcode: Option<String>,
    /// Free-form kind such as `tube` or `96-well plate`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub container_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
    /// Number of positions
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub capacity: Option<u32>,
    /// Attributes with no well-known meaning for this category
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Samples, reagents and whatever else sits in a container
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ContentAttributes {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Volume in microlitres
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub volume_ul: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub concentration: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<StatusValue>,
    /// Attributes with no well-known meaning for this category
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Instruments and other tracked hardware
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EquipmentAttributes {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub serial_number: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<StatusValue>,
    /// Attributes with no well-known meaning for this category
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Shared by workflows and workflow steps
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkflowAttributes {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<StatusValue>,
    /// Person or team responsible
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner: Option<String>,
    /// Attributes with no well-known meaning for this category
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Patients, donors and animals samples are taken from
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SubjectAttributes {
    /// Identifier in the system of record outside the LIMS
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub external_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub species: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sex: Option<String>,
    /// Attributes with no well-known meaning for this category
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Files and other produced data
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DataAttributes {
    /// Where the data lives
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uri: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub format: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checksum: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size_bytes: Option<u64>,
    /// Attributes with no well-known meaning for this category
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Observations recorded against a subject
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HealthEventAttributes {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_type: Option<String>,
    /// When the event happened, not when it was recorded
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub occurred_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub severity: Option<String>,
    /// Attributes with no well-known meaning for this category
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Typed view of an instance's attributes, tagged by template category
#[derive(Debug, Clone, PartialEq)]
pub enum InstanceView {
    Container(ContainerAttributes),
    Content(ContentAttributes),
    Equipment(EquipmentAttributes),
    Workflow(WorkflowAttributes),
    Subject(SubjectAttributes),
    Data(DataAttributes),
    HealthEvent(HealthEventAttributes),
    Other(Map<String, Value>),
}

impl InstanceView {
    /// Build the view matching `category`.
    ///
    /// Fails with a JSON error when a well-known field holds a value of the
    /// wrong shape.
    pub fn from_category(
        category: &TemplateCategory,
        attributes: &Map<String, Value>,
    ) -> Result<Self, TemplateError> {
        let view = match category {
            TemplateCategory::Container => InstanceView::Container(decode(attributes)?),
            TemplateCategory::Content => InstanceView::Content(decode(attributes)?),
            TemplateCategory::Equipment => InstanceView::Equipment(decode(attributes)?),
            TemplateCategory::Workflow | TemplateCategory::WorkflowStep => {
                InstanceView::Workflow(decode(attributes)?)
            }
            TemplateCategory::Subject => InstanceView::Subject(decode(attributes)?),
            TemplateCategory::Data => InstanceView::Data(decode(attributes)?),
            TemplateCategory::HealthEvent => InstanceView::HealthEvent(decode(attributes)?),
            TemplateCategory::Other(_) => InstanceView::Other(attributes.clone()),
        };
        Ok(view)
    }

    /// Back to the generic persisted representation
    pub fn to_attributes(&self) -> Result<Map<String, Value>, TemplateError> {
        let value = match self {
            InstanceView::Container(a) => serde_json::to_value(a)?,
            InstanceView::Content(a) => serde_json::to_value(a)?,
            InstanceView::Equipment(a) => serde_json::to_value(a)?,
            InstanceView::Workflow(a) => serde_json::to_value(a)?,
            InstanceView::Subject(a) => serde_json::to_value(a)?,
            InstanceView::Data(a) => serde_json::to_value(a)?,
            InstanceView::HealthEvent(a) => serde_json::to_value(a)?,
            InstanceView::Other(map) => return Ok(map.clone()),
        };
        match value {
            Value::Object(map) => Ok(map),
            other => Err(TemplateError::InternalError(format!(
                "Typed view serialised to a non-object: {}",
                other
            ))),
        }
    }
}

fn decode<T: DeserializeOwned>(attributes: &Map<String, Value>) -> Result<T, TemplateError> {
    Ok(serde_json::from_value(Value::Object(attributes.clone()))?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn attrs(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn test_container_view_exposes_known_fields() {
        let map = attrs(json!({ "barcode": "BC1", "capacity": 96, "colour": "blue" }));
        match InstanceView::from_category(&TemplateCategory::Container, &map).unwrap() {
            InstanceView::Container(c) => {
                assert_eq!(c.barcode.as_deref(), Some("BC1"));
                assert_eq!(c.capacity, Some(96));
                assert_eq!(c.extra.get("colour"), Some(&json!("blue")));
            }
            other => panic!("Expected container view, got {:?}", other),
        }
    }

    #[test]
    fn test_view_round_trips_to_the_same_map() {
        let map = attrs(json!({ "uri": "s3://bucket/run1.bam", "size_bytes": 1024, "lane": 3 }));
        let view = InstanceView::from_category(&TemplateCategory::Data, &map).unwrap();
        assert_eq!(view.to_attributes().unwrap(), map);
    }

    #[test]
    fn test_workflow_step_uses_workflow_view() {
        let map = attrs(json!({ "status": "complete" }));
        let view = InstanceView::from_category(&TemplateCategory::WorkflowStep, &map).unwrap();
        assert!(matches!(view, InstanceView::Workflow(ref w) if w.status.as_ref().and_then(StatusValue::as_text) == Some("complete")));
    }

    #[test]
    fn test_boolean_status_is_viewable() {
        let map = attrs(json!({ "status": true, "volume_ul": 12.5 }));
        match InstanceView::from_category(&TemplateCategory::Content, &map).unwrap() {
            InstanceView::Content(c) => assert_eq!(c.status, Some(StatusValue::Flag(true))),
            other => panic!("Expected content view, got {:?}", other),
        }
        let view = InstanceView::from_category(&TemplateCategory::Content, &map).unwrap();
        assert_eq!(view.to_attributes().unwrap(), map);
    }

    #[test]
    fn test_health_event_timestamp_is_typed() {
        let map = attrs(json!({ "occurred_at": "2024-05-01T12:00:00Z" }));
        match InstanceView::from_category(&TemplateCategory::HealthEvent, &map).unwrap() {
            InstanceView::HealthEvent(e) => {
                assert_eq!(e.occurred_at.unwrap().to_rfc3339(), "2024-05-01T12:00:00+00:00");
            }
            other => panic!("Expected health event view, got {:?}", other),
        }
    }

    #[test]
    fn test_wrong_shape_is_a_json_error() {
        let map = attrs(json!({ "capacity": "lots" }));
        assert!(matches!(
            InstanceView::from_category(&TemplateCategory::Container, &map),
            Err(TemplateError::JsonError(_))
        ));
    }

    #[test]
    fn test_custom_category_keeps_the_map() {
        let map = attrs(json!({ "lot": "L-77" }));
        let view = InstanceView::from_category(&TemplateCategory::Other("reagent".into()), &map).unwrap();
        assert_eq!(view, InstanceView::Other(map));
    }
}
