/// External unique identifiers and sequence counters
pub mod euid;

/// Generic instances
pub mod instance;

/// Lineage edges
pub mod lineage;

/// Arena-backed lineage DAG
pub mod lineage_graph;

/// Derived workflow states
pub mod workflow;

/// Audit events
pub mod events;

/// Repository interfaces
pub mod repository;
