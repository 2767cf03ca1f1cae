//!
//! LIMS Core - template-driven instance engine
//!
//! Every domain object (containers, samples, equipment, workflow steps,
//! data files, ...) is a generic instance shaped by a template, identified
//! by an EUID, and connected to other instances through an acyclic lineage
//! graph. Workflow states are derived from attributes and lineage.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

/// Domain layer - identifiers, instances, lineage and repositories
pub mod domain;

/// Application services
pub mod application;

/// Engine configuration
pub mod config;

/// Error types
pub mod error;

pub use error::CoreError;

pub use application::allocator::{Allocation, EuidAllocator};
pub use application::instance_store::InstanceStore;
pub use application::lineage_manager::{LineageManager, LineageWalk};
pub use application::runtime_interface::{InstanceSummary, LimsRuntime};
pub use application::workflow_engine::{StateInvalidator, WorkflowStateEngine};
pub use config::LimsConfig;

pub use domain::euid::{Euid, SequenceCounter, DEFAULT_SEQUENCE_WIDTH};
pub use domain::events::{AuditAction, AuditEvent};
pub use domain::instance::{Actor, GenericInstance, InstanceStatus};
pub use domain::lineage::{Direction, EdgeId, EdgeStatus, InstanceEdges, LineageEdge};
pub use domain::repository::{
    AuditRepository, InstanceRepository, LineageRepository, Repositories, SequenceCounterRepository,
};
pub use domain::workflow::WorkflowState;
