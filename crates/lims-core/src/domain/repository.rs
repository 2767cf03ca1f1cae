//! Repository traits for the LIMS core
//!
//! The application services only talk to storage through these traits.
//! `lims-state-postgres` provides the production implementations; the
//! `memory` module (behind the `testing` feature) provides in-process ones.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;

use super::euid::{Euid, SequenceCounter};
use super::events::AuditEvent;
use super::instance::{Actor, GenericInstance, InstanceStatus};
use super::lineage::{EdgeId, LineageEdge};
use crate::CoreError;

/// Per-prefix monotonic counters
#[async_trait]
pub trait SequenceCounterRepository: Send + Sync {
    /// Create the counter for `prefix` at 0, or revive a retired one at its
    /// last value; returns false if an active counter already existed
    async fn register(&self, prefix: &str) -> Result<bool, CoreError>;

    /// Atomically increment and return the new value.
    ///
    /// Fails with `UnknownPrefix` if no active counter is registered.
    async fn next_value(&self, prefix: &str) -> Result<u64, CoreError>;

    /// Last value handed out, `None` if no active counter exists
    async fn last_value(&self, prefix: &str) -> Result<Option<u64>, CoreError>;

    /// Retire an active counter, keeping its last value as a tombstone.
    ///
    /// Returns false if no active counter exists. Stores that can see
    /// instance rows refuse with `InvalidState` while any use the prefix.
    async fn retire(&self, prefix: &str) -> Result<bool, CoreError>;

    /// All active counters, sorted by prefix
    async fn list(&self) -> Result<Vec<SequenceCounter>, CoreError>;
}

/// Generic instance rows
#[async_trait]
pub trait InstanceRepository: Send + Sync {
    /// Insert a new instance; fails with `InvalidState` if the EUID exists
    async fn insert(&self, instance: &GenericInstance) -> Result<(), CoreError>;

    /// Find an instance by EUID
    async fn find_by_euid(&self, euid: &Euid) -> Result<Option<GenericInstance>, CoreError>;

    /// Replace the stored row if its version still equals `expected_version`.
    ///
    /// Fails with `NotFound` or `ConcurrentModification`.
    async fn update(&self, instance: &GenericInstance, expected_version: u64) -> Result<(), CoreError>;

    /// Instances created with any version of the prefix, sorted by EUID
    async fn list_by_template(
        &self,
        prefix: &str,
        status: Option<InstanceStatus>,
    ) -> Result<Vec<GenericInstance>, CoreError>;

    /// Number of instance rows for the prefix, whatever their status
    async fn count_by_prefix(&self, prefix: &str) -> Result<u64, CoreError>;
}

/// Lineage edges
#[async_trait]
pub trait LineageRepository: Send + Sync {
    /// Check acyclicity and insert in one isolated step.
    ///
    /// Returns the stored edge: the new one, or an identical active edge
    /// that already existed. Fails with `CycleDetected` and stores nothing
    /// if the edge would close a cycle.
    async fn insert_acyclic(&self, edge: LineageEdge) -> Result<LineageEdge, CoreError>;

    /// Find an edge by id
    async fn find_edge(&self, id: &EdgeId) -> Result<Option<LineageEdge>, CoreError>;

    /// Edges where `euid` is the parent, in creation order
    async fn outgoing(&self, euid: &Euid, include_superseded: bool) -> Result<Vec<LineageEdge>, CoreError>;

    /// Edges where `euid` is the child, in creation order
    async fn incoming(&self, euid: &Euid, include_superseded: bool) -> Result<Vec<LineageEdge>, CoreError>;

    /// Mark an edge superseded; `InvalidState` if it already is
    async fn supersede(&self, id: &EdgeId, actor: &Actor, at: DateTime<Utc>) -> Result<LineageEdge, CoreError>;
}

/// Append-only audit trail
#[async_trait]
pub trait AuditRepository: Send + Sync {
    /// Append one event
    async fn append(&self, event: &AuditEvent) -> Result<(), CoreError>;

    /// Events for an instance, oldest first
    async fn events_for(&self, euid: &Euid) -> Result<Vec<AuditEvent>, CoreError>;
}

/// The full set of repositories a runtime needs
#[derive(Clone)]
pub struct Repositories {
    /// Sequence counters
    pub counters: Arc<dyn SequenceCounterRepository>,
    /// Instance rows
    pub instances: Arc<dyn InstanceRepository>,
    /// Lineage edges
    pub lineage: Arc<dyn LineageRepository>,
    /// Audit trail
    pub audit: Arc<dyn AuditRepository>,
}

/// Memory implementations for testing and embedded use
#[cfg(feature = "testing")]
pub mod memory {
    use super::*;
    use crate::domain::lineage::Direction;
    use crate::domain::lineage_graph::LineageGraph;
    use dashmap::mapref::entry::Entry;
    use dashmap::DashMap;
    use tokio::sync::RwLock;

    #[derive(Debug, Clone, Copy, Default)]
    struct CounterSlot {
        last_value: u64,
        retired: bool,
    }

    /// In-memory counters; `DashMap::get_mut` holds the shard lock for the increment
    #[derive(Default)]
    pub struct MemorySequenceCounterRepository {
        counters: DashMap<String, CounterSlot>,
    }

    impl MemorySequenceCounterRepository {
        /// Create an empty repository
        pub fn new() -> Self {
            Self::default()
        }
    }

    #[async_trait]
    impl SequenceCounterRepository for MemorySequenceCounterRepository {
        async fn register(&self, prefix: &str) -> Result<bool, CoreError> {
            match self.counters.entry(prefix.to_string()) {
                Entry::Occupied(mut slot) => {
                    let revived = slot.get().retired;
                    slot.get_mut().retired = false;
                    Ok(revived)
                }
                Entry::Vacant(slot) => {
                    slot.insert(CounterSlot::default());
                    Ok(true)
                }
            }
        }

        async fn next_value(&self, prefix: &str) -> Result<u64, CoreError> {
            let mut counter = self
                .counters
                .get_mut(prefix)
                .filter(|slot| !slot.retired)
                .ok_or_else(|| CoreError::UnknownPrefix(prefix.to_string()))?;
            counter.last_value += 1;
            Ok(counter.last_value)
        }

        async fn last_value(&self, prefix: &str) -> Result<Option<u64>, CoreError> {
            Ok(self
                .counters
                .get(prefix)
                .filter(|slot| !slot.retired)
                .map(|slot| slot.last_value))
        }

        async fn retire(&self, prefix: &str) -> Result<bool, CoreError> {
            match self.counters.get_mut(prefix) {
                Some(mut slot) if !slot.retired => {
                    slot.retired = true;
                    Ok(true)
                }
                _ => Ok(false),
            }
        }

        async fn list(&self) -> Result<Vec<SequenceCounter>, CoreError> {
            let mut counters: Vec<SequenceCounter> = self
                .counters
                .iter()
                .filter(|entry| !entry.value().retired)
                .map(|entry| SequenceCounter {
                    prefix: entry.key().clone(),
                    last_value: entry.value().last_value,
                })
                .collect();
            counters.sort_by(|a, b| a.prefix.cmp(&b.prefix));
            Ok(counters)
        }
    }

    /// In-memory instance rows keyed by EUID
    #[derive(Default)]
    pub struct MemoryInstanceRepository {
        instances: DashMap<Euid, GenericInstance>,
    }

    impl MemoryInstanceRepository {
        /// Create an empty repository
        pub fn new() -> Self {
            Self::default()
        }
    }

    #[async_trait]
    impl InstanceRepository for MemoryInstanceRepository {
        async fn insert(&self, instance: &GenericInstance) -> Result<(), CoreError> {
            match self.instances.entry(instance.euid.clone()) {
                Entry::Occupied(_) => Err(CoreError::InvalidState(format!(
                    "instance {} already exists",
                    instance.euid
                ))),
                Entry::Vacant(slot) => {
                    slot.insert(instance.clone());
                    Ok(())
                }
            }
        }

        async fn find_by_euid(&self, euid: &Euid) -> Result<Option<GenericInstance>, CoreError> {
            Ok(self.instances.get(euid).map(|i| i.clone()))
        }

        async fn update(&self, instance: &GenericInstance, expected_version: u64) -> Result<(), CoreError> {
            let mut stored = self
                .instances
                .get_mut(&instance.euid)
                .ok_or_else(|| CoreError::NotFound(format!("instance {}", instance.euid)))?;
            if stored.version != expected_version {
                return Err(CoreError::ConcurrentModification {
                    euid: instance.euid.clone(),
                    expected: expected_version,
                    actual: stored.version,
                });
            }
            *stored = instance.clone();
            Ok(())
        }

        async fn list_by_template(
            &self,
            prefix: &str,
            status: Option<InstanceStatus>,
        ) -> Result<Vec<GenericInstance>, CoreError> {
            let mut found: Vec<GenericInstance> = self
                .instances
                .iter()
                .filter(|i| i.template_id.prefix == prefix)
                .filter(|i| status.map_or(true, |s| i.status == s))
                .map(|i| i.clone())
                .collect();
            found.sort_by(|a, b| a.euid.cmp(&b.euid));
            Ok(found)
        }

        async fn count_by_prefix(&self, prefix: &str) -> Result<u64, CoreError> {
            Ok(self
                .instances
                .iter()
                .filter(|i| i.template_id.prefix == prefix)
                .count() as u64)
        }
    }

    /// In-memory lineage: one arena DAG behind a graph-wide lock
    #[derive(Default)]
    pub struct MemoryLineageRepository {
        graph: RwLock<LineageGraph>,
    }

    impl MemoryLineageRepository {
        /// Create an empty repository
        pub fn new() -> Self {
            Self::default()
        }

        /// Immediate active neighbours
        pub async fn neighbours(&self, euid: &Euid, direction: Direction) -> Vec<Euid> {
            self.graph.read().await.neighbours(euid, direction)
        }

        /// Whether the active edges form a DAG
        pub async fn is_acyclic(&self) -> bool {
            self.graph.read().await.is_acyclic()
        }

        /// Total edge count, superseded included
        pub async fn edge_count(&self) -> usize {
            self.graph.read().await.edge_count()
        }
    }

    #[async_trait]
    impl LineageRepository for MemoryLineageRepository {
        async fn insert_acyclic(&self, edge: LineageEdge) -> Result<LineageEdge, CoreError> {
            let mut graph = self.graph.write().await;
            graph.insert(edge)
        }

        async fn find_edge(&self, id: &EdgeId) -> Result<Option<LineageEdge>, CoreError> {
            Ok(self.graph.read().await.get(id).cloned())
        }

        async fn outgoing(&self, euid: &Euid, include_superseded: bool) -> Result<Vec<LineageEdge>, CoreError> {
            Ok(self.graph.read().await.outgoing(euid, include_superseded))
        }

        async fn incoming(&self, euid: &Euid, include_superseded: bool) -> Result<Vec<LineageEdge>, CoreError> {
            Ok(self.graph.read().await.incoming(euid, include_superseded))
        }

        async fn supersede(&self, id: &EdgeId, actor: &Actor, at: DateTime<Utc>) -> Result<LineageEdge, CoreError> {
            self.graph.write().await.supersede(id, actor, at)
        }
    }

    /// In-memory audit trail
    #[derive(Default)]
    pub struct MemoryAuditRepository {
        events: DashMap<Euid, Vec<AuditEvent>>,
    }

    impl MemoryAuditRepository {
        /// Create an empty repository
        pub fn new() -> Self {
            Self::default()
        }
    }

    #[async_trait]
    impl AuditRepository for MemoryAuditRepository {
        async fn append(&self, event: &AuditEvent) -> Result<(), CoreError> {
            self.events
                .entry(event.euid.clone())
                .or_default()
                .push(event.clone());
            Ok(())
        }

        async fn events_for(&self, euid: &Euid) -> Result<Vec<AuditEvent>, CoreError> {
            Ok(self.events.get(euid).map(|e| e.clone()).unwrap_or_default())
        }
    }

    /// Builds a full set of in-memory repositories
    pub struct MemoryStateStoreProvider;

    impl MemoryStateStoreProvider {
        /// Create fresh, empty repositories
        pub fn create_repositories() -> Repositories {
            Repositories {
                counters: Arc::new(MemorySequenceCounterRepository::new()),
                instances: Arc::new(MemoryInstanceRepository::new()),
                lineage: Arc::new(MemoryLineageRepository::new()),
                audit: Arc::new(MemoryAuditRepository::new()),
            }
        }
    }

}
