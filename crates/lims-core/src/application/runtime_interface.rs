use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::sync::Arc;
use tracing::{info, warn};

use lims_templates::{TemplateRegistry, TemplateSnapshot};

use crate::application::allocator::EuidAllocator;
use crate::application::instance_store::InstanceStore;
use crate::application::lineage_manager::{LineageManager, LineageWalk};
use crate::application::workflow_engine::{StateInvalidator, WorkflowStateEngine};
use crate::config::LimsConfig;
use crate::domain::euid::Euid;
use crate::domain::events::AuditEvent;
use crate::domain::instance::{Actor, GenericInstance, InstanceStatus};
use crate::domain::lineage::{EdgeId, InstanceEdges, LineageEdge};
use crate::domain::repository::{AuditRepository, Repositories};
use crate::domain::workflow::WorkflowState;
use crate::CoreError;

/// What `create_instance` hands back to callers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceSummary {
    /// Allocated EUID
    pub euid: Euid,

    /// Template id, `PREFIX@vN`
    pub template: String,

    /// Template category
    pub category: String,

    /// Normalised attributes as stored
    pub attributes: Map<String, Value>,

    /// Status, always active for a new instance
    pub status: InstanceStatus,
}

impl From<&GenericInstance> for InstanceSummary {
    fn from(instance: &GenericInstance) -> Self {
        Self {
            euid: instance.euid.clone(),
            template: instance.template_id.to_string(),
            category: instance.category.to_string(),
            attributes: instance.attributes.clone(),
            status: instance.status,
        }
    }
}

/// The API the LIMS core offers to applications
#[derive(Clone)]
pub struct LimsRuntime {
    registry: Arc<TemplateRegistry>,
    allocator: Arc<EuidAllocator>,
    store: Arc<InstanceStore>,
    lineage: Arc<LineageManager>,
    workflow: Arc<WorkflowStateEngine>,
    audit: Arc<dyn AuditRepository>,
}

impl LimsRuntime {
    /// Create a runtime over externally provided repositories
    ///
    /// Prefixes the registry knows without a registered counter are logged
    /// as operational alerts; creating instances for them fails with
    /// `UnknownPrefix` until [`Self::register_prefix`] is called.
    pub async fn create_with_repositories(
        registry: Arc<TemplateRegistry>,
        repositories: Repositories,
        config: &LimsConfig,
    ) -> Result<Self, CoreError> {
        config.validate()?;

        let allocator = Arc::new(EuidAllocator::new(
            repositories.counters.clone(),
            repositories.instances.clone(),
            registry.clone(),
            config.euid.sequence_width,
        )?);

        let workflow = Arc::new(WorkflowStateEngine::new(
            registry.clone(),
            repositories.instances.clone(),
            repositories.lineage.clone(),
            config.workflow.cache_enabled,
        ));
        let invalidator: Arc<dyn StateInvalidator> = workflow.clone();

        let store = InstanceStore::new(
            registry.clone(),
            allocator.clone(),
            repositories.instances.clone(),
            repositories.audit.clone(),
        )
        .with_invalidator(invalidator.clone())
        .with_optimistic_concurrency(config.optimistic_concurrency)
        .with_max_update_retries(config.max_update_retries);

        let lineage = LineageManager::new(
            registry.clone(),
            repositories.instances.clone(),
            repositories.lineage.clone(),
            repositories.audit.clone(),
        )
        .with_invalidator(invalidator);

        let runtime = Self {
            registry,
            allocator,
            store: Arc::new(store),
            lineage: Arc::new(lineage),
            workflow,
            audit: repositories.audit,
        };
        runtime.report_missing_counters().await?;

        info!(
            sequence_width = config.euid.sequence_width,
            workflow_cache = config.workflow.cache_enabled,
            optimistic_concurrency = config.optimistic_concurrency,
            "LIMS runtime ready"
        );
        Ok(runtime)
    }

    /// Create a runtime over fresh in-memory repositories
    #[cfg(feature = "testing")]
    pub async fn in_memory(registry: Arc<TemplateRegistry>, config: &LimsConfig) -> Result<Self, CoreError> {
        use crate::domain::repository::memory::MemoryStateStoreProvider;
        Self::create_with_repositories(registry, MemoryStateStoreProvider::create_repositories(), config).await
    }

    async fn report_missing_counters(&self) -> Result<(), CoreError> {
        let missing = self.allocator.missing_counters().await?;
        for prefix in &missing {
            warn!(prefix = %prefix, "Template prefix has no sequence counter; creation will fail until it is registered");
        }
        Ok(())
    }

    /// The template registry in use
    pub fn registry(&self) -> &Arc<TemplateRegistry> {
        &self.registry
    }

    /// Create an instance from a template prefix or category
    pub async fn create_instance(
        &self,
        template_ref: &str,
        attributes: &Map<String, Value>,
        actor: &Actor,
    ) -> Result<InstanceSummary, CoreError> {
        let instance = self.store.create(template_ref, attributes, actor).await?;
        Ok(InstanceSummary::from(&instance))
    }

    /// Fetch an instance, whatever its status
    pub async fn get_instance(&self, euid: &Euid) -> Result<GenericInstance, CoreError> {
        self.store.get(euid).await
    }

    /// Merge a patch into an instance's attributes
    pub async fn update_attributes(
        &self,
        euid: &Euid,
        patch: &Map<String, Value>,
        expected_version: Option<u64>,
        actor: &Actor,
    ) -> Result<GenericInstance, CoreError> {
        self.store.update_attributes(euid, patch, expected_version, actor).await
    }

    /// Soft-delete an instance
    pub async fn soft_delete(&self, euid: &Euid, actor: &Actor) -> Result<GenericInstance, CoreError> {
        self.store.soft_delete(euid, actor).await
    }

    /// Revert a soft delete
    pub async fn un_delete(&self, euid: &Euid, actor: &Actor) -> Result<GenericInstance, CoreError> {
        self.store.un_delete(euid, actor).await
    }

    /// Mark an instance superseded
    pub async fn supersede_instance(
        &self,
        euid: &Euid,
        replaced_by: Option<&Euid>,
        actor: &Actor,
    ) -> Result<GenericInstance, CoreError> {
        self.store.supersede(euid, replaced_by, actor).await
    }

    /// Instances of a template prefix
    pub async fn list_instances(
        &self,
        prefix: &str,
        status: Option<InstanceStatus>,
    ) -> Result<Vec<GenericInstance>, CoreError> {
        self.store.list_by_template(prefix, status).await
    }

    /// Create a lineage edge
    pub async fn link(
        &self,
        parent: &Euid,
        child: &Euid,
        relationship_type: &str,
        actor: &Actor,
    ) -> Result<LineageEdge, CoreError> {
        self.lineage.link(parent, child, relationship_type, actor).await
    }

    /// Fetch one lineage edge
    pub async fn get_edge(&self, id: &EdgeId) -> Result<LineageEdge, CoreError> {
        self.lineage.edge(id).await
    }

    /// Mark a lineage edge superseded
    pub async fn supersede_edge(&self, id: &EdgeId, actor: &Actor) -> Result<LineageEdge, CoreError> {
        self.lineage.supersede_edge(id, actor).await
    }

    /// All edges touching an instance
    pub async fn edges_of(&self, euid: &Euid) -> Result<InstanceEdges, CoreError> {
        self.lineage.edges_of(euid).await
    }

    /// Walk towards the roots
    pub async fn ancestors(&self, euid: &Euid, max_depth: Option<usize>) -> Result<LineageWalk, CoreError> {
        self.lineage.ancestors(euid, max_depth).await
    }

    /// Walk towards the leaves
    pub async fn descendants(&self, euid: &Euid, max_depth: Option<usize>) -> Result<LineageWalk, CoreError> {
        self.lineage.descendants(euid, max_depth).await
    }

    /// Derived workflow state
    pub async fn workflow_state(&self, euid: &Euid) -> Result<WorkflowState, CoreError> {
        self.workflow.state_of(euid).await
    }

    /// Create the sequence counter for a template prefix
    pub async fn register_prefix(&self, prefix: &str) -> Result<bool, CoreError> {
        self.allocator.register_prefix(prefix).await
    }

    /// Template prefixes without a counter
    pub async fn missing_counters(&self) -> Result<Vec<String>, CoreError> {
        self.allocator.missing_counters().await
    }

    /// Remove the counter of an unused prefix
    pub async fn retire_prefix(&self, prefix: &str) -> Result<(), CoreError> {
        self.allocator.retire_prefix(prefix).await
    }

    /// Audit trail of an instance, oldest first
    pub async fn audit_trail(&self, euid: &Euid) -> Result<Vec<AuditEvent>, CoreError> {
        self.audit.events_for(euid).await
    }

    /// Merge a YAML template document into the registry
    pub async fn reload_templates(&self, yaml: &str) -> Result<Arc<TemplateSnapshot>, CoreError> {
        let snapshot = self.registry.reload_yaml(yaml)?;
        self.report_missing_counters().await?;
        Ok(snapshot)
    }
}
