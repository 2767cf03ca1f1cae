use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use super::euid::Euid;
use super::instance::Actor;
use crate::CoreError;

/// Identifier of a lineage edge
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EdgeId(pub Uuid);

impl EdgeId {
    /// A fresh random id
    pub fn new() -> Self {
        EdgeId(Uuid::new_v4())
    }
}

impl Default for EdgeId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for EdgeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for EdgeId {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s)
            .map(EdgeId)
            .map_err(|e| CoreError::ValidationError {
                field: "edge_id".to_string(),
                reason: e.to_string(),
            })
    }
}

/// Whether an edge still counts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EdgeStatus {
    /// Participates in traversal and cycle checks
    Active,
    /// Kept for audit only
    Superseded,
}

impl EdgeStatus {
    /// Lower-case name used in storage
    pub fn as_str(&self) -> &'static str {
        match self {
            EdgeStatus::Active => "active",
            EdgeStatus::Superseded => "superseded",
        }
    }
}

impl FromStr for EdgeStatus {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(EdgeStatus::Active),
            "superseded" => Ok(EdgeStatus::Superseded),
            other => Err(CoreError::SerializationError(format!("Unknown edge status '{}'", other))),
        }
    }
}

/// Directed relationship from a parent instance to a child instance
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LineageEdge {
    /// Edge id
    pub id: EdgeId,
    /// Source of the relationship
    pub parent: Euid,
    /// Target of the relationship
    pub child: Euid,
    /// e.g. `derived_from`, `contains`
    pub relationship_type: String,
    /// Active or superseded
    pub status: EdgeStatus,
    /// Creation time
    pub created_at: DateTime<Utc>,
    /// Creator
    pub created_by: Actor,
    /// When the edge was superseded
    #[serde(default)]
    pub superseded_at: Option<DateTime<Utc>>,
    /// Who superseded the edge
    #[serde(default)]
    pub superseded_by: Option<Actor>,
}

impl LineageEdge {
    /// A new active edge
    pub fn new(parent: Euid, child: Euid, relationship_type: impl Into<String>, actor: Actor) -> Self {
        Self {
            id: EdgeId::new(),
            parent,
            child,
            relationship_type: relationship_type.into(),
            status: EdgeStatus::Active,
            created_at: Utc::now(),
            created_by: actor,
            superseded_at: None,
            superseded_by: None,
        }
    }

    /// Whether the edge is active
    pub fn is_active(&self) -> bool {
        self.status == EdgeStatus::Active
    }

    /// Same endpoints and relationship type
    pub fn same_link(&self, other: &LineageEdge) -> bool {
        self.parent == other.parent
            && self.child == other.child
            && self.relationship_type == other.relationship_type
    }
}

/// Traversal direction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    /// Follow edges from child to parent
    Ancestors,
    /// Follow edges from parent to child
    Descendants,
}

/// Every edge touching one instance, superseded ones included
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceEdges {
    /// Edges where the instance is the child
    pub incoming: Vec<LineageEdge>,
    /// Edges where the instance is the parent
    pub outgoing: Vec<LineageEdge>,
}
