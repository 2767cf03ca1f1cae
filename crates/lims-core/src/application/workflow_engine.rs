//! Derived workflow state with an epoch-guarded cache.
//!
//! A state is a pure function of the instance, its completion rule and its
//! immediate active lineage. Computations remember the epoch observed before
//! they read anything; invalidations bump the epoch and stamp the EUID, and a
//! cached value older than the EUID's last stamp is never served.

use async_trait::async_trait;
use dashmap::DashMap;
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{trace, warn};

use lims_monitoring::LimsMetrics;
use lims_templates::TemplateRegistry;

use crate::domain::euid::Euid;
use crate::domain::instance::GenericInstance;
use crate::domain::repository::{InstanceRepository, LineageRepository};
use crate::domain::workflow::{derive_state, StateInputs, WorkflowState};
use crate::CoreError;

/// Receives "something touching this EUID changed" notifications
#[async_trait]
pub trait StateInvalidator: Send + Sync {
    /// Drop whatever is derived from `euid`
    async fn invalidate(&self, euid: &Euid);
}

/// Computes and caches workflow states
pub struct WorkflowStateEngine {
    registry: Arc<TemplateRegistry>,
    instances: Arc<dyn InstanceRepository>,
    lineage: Arc<dyn LineageRepository>,
    cache: DashMap<Euid, (u64, WorkflowState)>,
    invalidated: DashMap<Euid, u64>,
    // Stamp of the last full clear; applies to every EUID
    floor: AtomicU64,
    epoch: AtomicU64,
    cache_enabled: bool,
}

impl WorkflowStateEngine {
    /// Create an engine; with `cache_enabled = false` every call recomputes
    pub fn new(
        registry: Arc<TemplateRegistry>,
        instances: Arc<dyn InstanceRepository>,
        lineage: Arc<dyn LineageRepository>,
        cache_enabled: bool,
    ) -> Self {
        Self {
            registry,
            instances,
            lineage,
            cache: DashMap::new(),
            invalidated: DashMap::new(),
            floor: AtomicU64::new(0),
            epoch: AtomicU64::new(0),
            cache_enabled,
        }
    }

    fn last_invalidation(&self, euid: &Euid) -> u64 {
        let own = self.invalidated.get(euid).map(|stamp| *stamp).unwrap_or(0);
        own.max(self.floor.load(Ordering::SeqCst))
    }

    /// Current workflow state of an instance
    pub async fn state_of(&self, euid: &Euid) -> Result<WorkflowState, CoreError> {
        let observed = self.epoch.load(Ordering::SeqCst);

        if self.cache_enabled {
            if let Some(entry) = self.cache.get(euid) {
                let (stamp, state) = *entry;
                if stamp >= self.last_invalidation(euid) {
                    LimsMetrics::record_workflow_cache(true);
                    return Ok(state);
                }
            }
            LimsMetrics::record_workflow_cache(false);
        }

        let state = self.compute(euid).await?;

        if self.cache_enabled && observed >= self.last_invalidation(euid) {
            self.cache.insert(euid.clone(), (observed, state));
        }
        trace!(euid = %euid, state = %state, "Workflow state computed");
        Ok(state)
    }

    async fn compute(&self, euid: &Euid) -> Result<WorkflowState, CoreError> {
        let instance = self
            .instances
            .find_by_euid(euid)
            .await?
            .ok_or_else(|| CoreError::NotFound(format!("instance {}", euid)))?;

        let complete = self.is_complete(&instance)?;
        let has_active_parent = !self.lineage.incoming(euid, false).await?.is_empty();

        let mut seen = HashSet::new();
        let mut children_complete = Vec::new();
        for edge in self.lineage.outgoing(euid, false).await? {
            if !seen.insert(edge.child.clone()) {
                continue;
            }
            match self.instances.find_by_euid(&edge.child).await? {
                Some(child) if child.is_active() => children_complete.push(self.is_complete(&child)?),
                _ => {}
            }
        }

        Ok(derive_state(&StateInputs {
            status: instance.status,
            complete,
            has_active_parent,
            children_complete,
        }))
    }

    fn is_complete(&self, instance: &GenericInstance) -> Result<bool, CoreError> {
        let template = self.registry.resolve_id(&instance.template_id)?;
        Ok(template.completion.is_complete(&instance.attributes))
    }

    fn stamp(&self, euid: &Euid) {
        let stamp = self.epoch.fetch_add(1, Ordering::SeqCst) + 1;
        self.invalidated.insert(euid.clone(), stamp);
        self.cache.remove(euid);
    }
}

#[async_trait]
impl StateInvalidator for WorkflowStateEngine {
    /// Invalidates the instance and its immediate active parents
    async fn invalidate(&self, euid: &Euid) {
        self.stamp(euid);
        match self.lineage.incoming(euid, false).await {
            Ok(edges) => {
                for edge in edges {
                    self.stamp(&edge.parent);
                }
            }
            Err(e) => {
                // Parents unknown: drop every cached state
                warn!(euid = %euid, error = %e, "Could not load parents for invalidation, clearing cache");
                let stamp = self.epoch.fetch_add(1, Ordering::SeqCst) + 1;
                self.floor.fetch_max(stamp, Ordering::SeqCst);
                self.cache.clear();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::instance::{Actor, InstanceStatus};
    use crate::domain::lineage::LineageEdge;
    use crate::domain::repository::memory::{MemoryInstanceRepository, MemoryLineageRepository};
    use lims_templates::{Template, TemplateCategory, TemplateDocument};
    use serde_json::{json, Map, Value};

    struct Fixture {
        engine: WorkflowStateEngine,
        instances: Arc<MemoryInstanceRepository>,
        lineage: Arc<MemoryLineageRepository>,
        template: Template,
    }

    fn fixture(cache_enabled: bool) -> Fixture {
        let template = Template::new("blood", "SMP", TemplateCategory::Content);
        let mut document = TemplateDocument::empty();
        document.templates = vec![template.clone()];
        let registry = Arc::new(TemplateRegistry::from_document(&document).unwrap());
        let instances = Arc::new(MemoryInstanceRepository::new());
        let lineage = Arc::new(MemoryLineageRepository::new());
        Fixture {
            engine: WorkflowStateEngine::new(registry, instances.clone(), lineage.clone(), cache_enabled),
            instances,
            lineage,
            template,
        }
    }

    impl Fixture {
        async fn add(&self, euid: &str, attributes: Value) -> GenericInstance {
            let attributes: Map<String, Value> = attributes.as_object().cloned().unwrap();
            let instance = GenericInstance::new(euid.into(), &self.template, attributes, Actor::system());
            self.instances.insert(&instance).await.unwrap();
            instance
        }

        async fn link(&self, parent: &str, child: &str) {
            self.lineage
                .insert_acyclic(LineageEdge::new(parent.into(), child.into(), "derived_from", Actor::system()))
                .await
                .unwrap();
        }

        async fn set_status(&self, instance: &GenericInstance, value: &str) {
            let mut next = instance.next_revision(&Actor::system());
            next.attributes.insert("status".into(), json!(value));
            self.instances.update(&next, instance.version).await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_states_follow_lineage() {
        let f = fixture(false);
        f.add("SMP-0000001", json!({})).await;
        f.add("SMP-0000002", json!({})).await;
        assert_eq!(f.engine.state_of(&"SMP-0000001".into()).await.unwrap(), WorkflowState::Pending);

        f.link("SMP-0000001", "SMP-0000002").await;
        assert_eq!(f.engine.state_of(&"SMP-0000001".into()).await.unwrap(), WorkflowState::InProgress);
        assert_eq!(f.engine.state_of(&"SMP-0000002".into()).await.unwrap(), WorkflowState::Ready);
    }

    #[tokio::test]
    async fn test_completion_rule() {
        let f = fixture(false);
        f.add("SMP-0000001", json!({})).await;
        f.add("SMP-0000002", json!({ "status": "complete" })).await;
        f.link("SMP-0000001", "SMP-0000002").await;

        assert_eq!(f.engine.state_of(&"SMP-0000001".into()).await.unwrap(), WorkflowState::Processed);
        assert_eq!(f.engine.state_of(&"SMP-0000002".into()).await.unwrap(), WorkflowState::Terminal);
    }

    #[tokio::test]
    async fn test_inactive_children_are_ignored() {
        let f = fixture(false);
        f.add("SMP-0000001", json!({})).await;
        let child = f.add("SMP-0000002", json!({})).await;
        f.link("SMP-0000001", "SMP-0000002").await;

        let mut deleted = child.next_revision(&Actor::system());
        deleted.status = InstanceStatus::Deleted;
        f.instances.update(&deleted, child.version).await.unwrap();

        assert_eq!(f.engine.state_of(&"SMP-0000001".into()).await.unwrap(), WorkflowState::Pending);
        assert_eq!(f.engine.state_of(&"SMP-0000002".into()).await.unwrap(), WorkflowState::Deleted);
    }

    #[tokio::test]
    async fn test_cache_requires_invalidation() {
        let f = fixture(true);
        f.add("SMP-0000001", json!({})).await;
        let child = f.add("SMP-0000002", json!({})).await;
        f.link("SMP-0000001", "SMP-0000002").await;

        let parent: Euid = "SMP-0000001".into();
        assert_eq!(f.engine.state_of(&parent).await.unwrap(), WorkflowState::InProgress);

        // Changed behind the engine's back: the cached value is still served
        f.set_status(&child, "complete").await;
        assert_eq!(f.engine.state_of(&parent).await.unwrap(), WorkflowState::InProgress);

        // Invalidating the child also drops its parent's entry
        f.engine.invalidate(&child.euid).await;
        assert_eq!(f.engine.state_of(&parent).await.unwrap(), WorkflowState::Processed);
    }

    #[tokio::test]
    async fn test_unknown_instance() {
        let f = fixture(true);
        assert!(matches!(
            f.engine.state_of(&"SMP-0000009".into()).await,
            Err(CoreError::NotFound(_))
        ));
    }
}
