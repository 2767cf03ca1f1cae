use serde::{Deserialize, Serialize};
use std::fmt;

use super::instance::InstanceStatus;

/// Derived life-cycle state of an instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowState {
    /// Standalone, not complete, nothing downstream
    Pending,
    /// Derived from a parent, not complete, nothing downstream
    Ready,
    /// At least one active child is not complete
    InProgress,
    /// All active children complete, the instance itself not marked complete
    Processed,
    /// Complete with no pending downstream work
    Terminal,
    /// Soft-deleted
    Deleted,
    /// Replaced by another instance
    Superseded,
}

impl WorkflowState {
    /// Lower-case name
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkflowState::Pending => "pending",
            WorkflowState::Ready => "ready",
            WorkflowState::InProgress => "in_progress",
            WorkflowState::Processed => "processed",
            WorkflowState::Terminal => "terminal",
            WorkflowState::Deleted => "deleted",
            WorkflowState::Superseded => "superseded",
        }
    }
}

impl fmt::Display for WorkflowState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Everything the state depends on
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateInputs {
    /// Status of the instance itself
    pub status: InstanceStatus,
    /// Whether the instance's attributes mark it complete
    pub complete: bool,
    /// Whether an active incoming edge exists
    pub has_active_parent: bool,
    /// Completion of each active child reached by an active outgoing edge
    pub children_complete: Vec<bool>,
}

/// Pure projection from the inputs to a state
pub fn derive_state(inputs: &StateInputs) -> WorkflowState {
    match inputs.status {
        InstanceStatus::Deleted => return WorkflowState::Deleted,
        InstanceStatus::Superseded => return WorkflowState::Superseded,
        InstanceStatus::Active => {}
    }

    if inputs.children_complete.iter().any(|done| !done) {
        WorkflowState::InProgress
    } else if inputs.complete {
        WorkflowState::Terminal
    } else if !inputs.children_complete.is_empty() {
        WorkflowState::Processed
    } else if inputs.has_active_parent {
        WorkflowState::Ready
    } else {
        WorkflowState::Pending
    }
}
