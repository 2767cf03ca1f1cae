use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::str::FromStr;
use uuid::Uuid;

use super::euid::Euid;
use super::instance::Actor;
use crate::CoreError;

/// Kind of mutation recorded in the audit trail
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditAction {
    /// Instance created
    Created,
    /// Attributes changed
    AttributesUpdated,
    /// Instance soft-deleted
    SoftDeleted,
    /// Soft delete reverted
    Undeleted,
    /// Instance superseded
    Superseded,
    /// Lineage edge created
    Linked,
    /// Lineage edge superseded
    EdgeSuperseded,
}

impl AuditAction {
    /// Lower-case name used in storage
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditAction::Created => "created",
            AuditAction::AttributesUpdated => "attributes_updated",
            AuditAction::SoftDeleted => "soft_deleted",
            AuditAction::Undeleted => "undeleted",
            AuditAction::Superseded => "superseded",
            AuditAction::Linked => "linked",
            AuditAction::EdgeSuperseded => "edge_superseded",
        }
    }
}

impl FromStr for AuditAction {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "created" => AuditAction::Created,
            "attributes_updated" => AuditAction::AttributesUpdated,
            "soft_deleted" => AuditAction::SoftDeleted,
            "undeleted" => AuditAction::Undeleted,
            "superseded" => AuditAction::Superseded,
            "linked" => AuditAction::Linked,
            "edge_superseded" => AuditAction::EdgeSuperseded,
            other => {
                return Err(CoreError::SerializationError(format!("Unknown audit action '{}'", other)))
            }
        })
    }
}

/// One entry of an instance's audit trail
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEvent {
    /// Event id
    pub id: Uuid,
    /// Instance the event belongs to
    pub euid: Euid,
    /// What happened
    pub action: AuditAction,
    /// Who did it
    pub actor: Actor,
    /// When
    pub at: DateTime<Utc>,
    /// Action-specific detail (patch, edge id, replacement, ...)
    pub detail: Value,
}

impl AuditEvent {
    /// A new event stamped now
    pub fn new(euid: Euid, action: AuditAction, actor: Actor, detail: Value) -> Self {
        Self {
            id: Uuid::new_v4(),
            euid,
            action,
            actor,
            at: Utc::now(),
            detail,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_action_strings_round_trip() {
        for action in [
            AuditAction::Created,
            AuditAction::AttributesUpdated,
            AuditAction::SoftDeleted,
            AuditAction::Undeleted,
            AuditAction::Superseded,
            AuditAction::Linked,
            AuditAction::EdgeSuperseded,
        ] {
            assert_eq!(action.as_str().parse::<AuditAction>().unwrap(), action);
            assert_eq!(serde_json::to_value(action).unwrap(), json!(action.as_str()));
        }
    }
}
