use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::str::FromStr;

use lims_templates::{InstanceView, Template, TemplateCategory, TemplateId};

use super::euid::Euid;
use crate::CoreError;

/// Who performed a mutation
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Actor(pub String);

impl Actor {
    /// Actor used for changes made by the engine itself
    pub fn system() -> Self {
        Actor("system".to_string())
    }
}

impl fmt::Display for Actor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Actor {
    fn from(s: &str) -> Self {
        Actor(s.to_string())
    }
}

/// Life-cycle status of a stored instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceStatus {
    /// Normal, usable instance
    Active,
    /// Soft-deleted; row, EUID and edges are kept
    Deleted,
    /// Replaced by another instance
    Superseded,
}

impl InstanceStatus {
    /// Lower-case name used in storage
    pub fn as_str(&self) -> &'static str {
        match self {
            InstanceStatus::Active => "active",
            InstanceStatus::Deleted => "deleted",
            InstanceStatus::Superseded => "superseded",
        }
    }
}

impl fmt::Display for InstanceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for InstanceStatus {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(InstanceStatus::Active),
            "deleted" => Ok(InstanceStatus::Deleted),
            "superseded" => Ok(InstanceStatus::Superseded),
            other => Err(CoreError::SerializationError(format!(
                "Unknown instance status '{}'",
                other
            ))),
        }
    }
}

/// One stored domain object, shaped by its template
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenericInstance {
    /// Globally unique, immutable identifier
    pub euid: Euid,
    /// Template version the instance was created with; never changes
    pub template_id: TemplateId,
    /// Category of that template
    pub category: TemplateCategory,
    /// Validated, normalised attributes
    pub attributes: Map<String, Value>,
    /// Current status
    pub status: InstanceStatus,
    /// Optimistic-concurrency stamp, starts at 1
    pub version: u64,
    /// Creation time
    pub created_at: DateTime<Utc>,
    /// Creator
    pub created_by: Actor,
    /// Last change time
    pub updated_at: DateTime<Utc>,
    /// Last editor
    pub updated_by: Actor,
    /// Replacement instance, when superseded
    #[serde(default)]
    pub superseded_by: Option<Euid>,
}

impl GenericInstance {
    /// A fresh active instance at version 1
    pub fn new(euid: Euid, template: &Template, attributes: Map<String, Value>, actor: Actor) -> Self {
        let now = Utc::now();
        Self {
            euid,
            template_id: template.id(),
            category: template.category.clone(),
            attributes,
            status: InstanceStatus::Active,
            version: 1,
            created_at: now,
            created_by: actor.clone(),
            updated_at: now,
            updated_by: actor,
            superseded_by: None,
        }
    }

    /// Whether the instance is active
    pub fn is_active(&self) -> bool {
        self.status == InstanceStatus::Active
    }

    /// Category-tagged typed view of the attributes
    pub fn view(&self) -> Result<InstanceView, CoreError> {
        Ok(InstanceView::from_category(&self.category, &self.attributes)?)
    }

    /// Copy with the bookkeeping for the next persisted change applied
    pub fn next_revision(&self, actor: &Actor) -> Self {
        let mut next = self.clone();
        next.version = self.version + 1;
        next.updated_at = Utc::now();
        next.updated_by = actor.clone();
        next
    }
}

/// Attribute-level merge: patch values replace, `null` removes
pub fn merge_patch(attributes: &Map<String, Value>, patch: &Map<String, Value>) -> Map<String, Value> {
    let mut merged = attributes.clone();
    for (key, value) in patch {
        if value.is_null() {
            merged.remove(key);
        } else {
            merged.insert(key.clone(), value.clone());
        }
    }
    merged
}
