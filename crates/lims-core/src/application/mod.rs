/// EUID allocation over sequence counters
pub mod allocator;

/// Generic instance store
pub mod instance_store;

/// Lineage graph manager
pub mod lineage_manager;

/// Derived workflow states
pub mod workflow_engine;

/// Runtime facade for applications
pub mod runtime_interface;
