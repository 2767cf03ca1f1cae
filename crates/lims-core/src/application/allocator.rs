use dashmap::DashMap;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::{OwnedRwLockReadGuard, RwLock};
use tracing::{debug, error, info};

use lims_monitoring::LimsMetrics;
use lims_templates::TemplateRegistry;

use crate::domain::euid::{max_sequence, Euid};
use crate::domain::repository::{InstanceRepository, SequenceCounterRepository};
use crate::CoreError;

/// Hands out EUIDs from the per-prefix counters
pub struct EuidAllocator {
    counters: Arc<dyn SequenceCounterRepository>,
    instances: Arc<dyn InstanceRepository>,
    registry: Arc<TemplateRegistry>,
    // Per-prefix gate: allocations until insert share it, retirement takes it exclusively
    gates: DashMap<String, Arc<RwLock<()>>>,
    width: usize,
}

/// An allocated EUID whose prefix cannot be retired until this is dropped
pub struct Allocation {
    /// The allocated identifier
    pub euid: Euid,
    _gate: OwnedRwLockReadGuard<()>,
}

impl EuidAllocator {
    /// Create an allocator producing `width`-digit sequences
    pub fn new(
        counters: Arc<dyn SequenceCounterRepository>,
        instances: Arc<dyn InstanceRepository>,
        registry: Arc<TemplateRegistry>,
        width: usize,
    ) -> Result<Self, CoreError> {
        max_sequence(width)?;
        Ok(Self {
            counters,
            instances,
            registry,
            gates: DashMap::new(),
            width,
        })
    }

    /// Sequence width in digits
    pub fn width(&self) -> usize {
        self.width
    }

    fn gate(&self, prefix: &str) -> Arc<RwLock<()>> {
        self.gates.entry(prefix.to_string()).or_default().clone()
    }

    /// Allocate the next EUID and hold off `retire_prefix` until the
    /// returned allocation is dropped.
    ///
    /// Callers keep it alive until the instance row is stored.
    pub async fn reserve(&self, prefix: &str) -> Result<Allocation, CoreError> {
        let gate = self.gate(prefix).read_owned().await;
        let euid = self.allocate(prefix).await?;
        Ok(Allocation { euid, _gate: gate })
    }

    /// Allocate the next EUID for `prefix`.
    ///
    /// A missing counter or an exhausted sequence is a configuration gap and
    /// is logged at `error`.
    pub async fn allocate(&self, prefix: &str) -> Result<Euid, CoreError> {
        let result = match self.counters.next_value(prefix).await {
            Ok(value) => Euid::format(prefix, value, self.width),
            Err(e) => Err(e),
        };

        match result {
            Ok(euid) => {
                debug!(prefix, euid = %euid, "EUID allocated");
                LimsMetrics::record_euid_allocated(prefix);
                Ok(euid)
            }
            Err(e) => {
                if e.is_operational_alert() {
                    error!(prefix, error = %e, error_code = e.error_code(), "EUID allocation failed");
                }
                LimsMetrics::record_allocation_failure(prefix, e.error_code());
                Err(e)
            }
        }
    }

    /// Create the counter for a prefix the registry knows about
    pub async fn register_prefix(&self, prefix: &str) -> Result<bool, CoreError> {
        if self.registry.snapshot().latest(prefix).is_none() {
            return Err(CoreError::UnknownTemplate(format!(
                "no template declares prefix '{}'",
                prefix
            )));
        }
        let created = self.counters.register(prefix).await?;
        if created {
            info!(prefix, "Sequence counter registered");
        }
        Ok(created)
    }

    /// Registry prefixes that have no active counter
    pub async fn missing_counters(&self) -> Result<Vec<String>, CoreError> {
        let registered: HashSet<String> = self.counters.list().await?.into_iter().map(|c| c.prefix).collect();
        Ok(self
            .registry
            .snapshot()
            .prefixes()
            .into_iter()
            .filter(|prefix| !registered.contains(prefix))
            .collect())
    }

    /// Retire the counter of a prefix that has no instance rows.
    ///
    /// Usage is taken from the instance rows, not from the counter value.
    /// The counter keeps its last value, so registering the prefix again
    /// continues the sequence instead of reissuing EUIDs.
    pub async fn retire_prefix(&self, prefix: &str) -> Result<(), CoreError> {
        let _exclusive = self.gate(prefix).write_owned().await;
        let in_use = self.instances.count_by_prefix(prefix).await?;
        if in_use > 0 {
            return Err(CoreError::InvalidState(format!(
                "prefix '{}' still has {} instance(s)",
                prefix, in_use
            )));
        }
        if !self.counters.retire(prefix).await? {
            return Err(CoreError::UnknownPrefix(prefix.to_string()));
        }
        info!(prefix, "Sequence counter retired");
        Ok(())
    }
}
