use serde_json::{json, Map, Value};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use lims_monitoring::LimsMetrics;
use lims_templates::TemplateRegistry;

use crate::application::allocator::EuidAllocator;
use crate::application::workflow_engine::StateInvalidator;
use crate::domain::euid::Euid;
use crate::domain::events::{AuditAction, AuditEvent};
use crate::domain::instance::{merge_patch, Actor, GenericInstance, InstanceStatus};
use crate::domain::repository::{AuditRepository, InstanceRepository};
use crate::CoreError;

/// Creates, reads and mutates generic instances
pub struct InstanceStore {
    registry: Arc<TemplateRegistry>,
    allocator: Arc<EuidAllocator>,
    instances: Arc<dyn InstanceRepository>,
    audit: Arc<dyn AuditRepository>,
    invalidator: Option<Arc<dyn StateInvalidator>>,
    optimistic_concurrency: bool,
    max_update_retries: u32,
}

impl InstanceStore {
    /// Create a new instance store
    pub fn new(
        registry: Arc<TemplateRegistry>,
        allocator: Arc<EuidAllocator>,
        instances: Arc<dyn InstanceRepository>,
        audit: Arc<dyn AuditRepository>,
    ) -> Self {
        Self {
            registry,
            allocator,
            instances,
            audit,
            invalidator: None,
            optimistic_concurrency: false,
            max_update_retries: 5,
        }
    }

    /// Notify `invalidator` after every mutation
    pub fn with_invalidator(mut self, invalidator: Arc<dyn StateInvalidator>) -> Self {
        self.invalidator = Some(invalidator);
        self
    }

    /// Require `expected_version` on updates and report conflicts instead of retrying
    pub fn with_optimistic_concurrency(mut self, enabled: bool) -> Self {
        self.optimistic_concurrency = enabled;
        self
    }

    /// Compare-and-swap attempts for last-writer-wins updates
    pub fn with_max_update_retries(mut self, retries: u32) -> Self {
        self.max_update_retries = retries.max(1);
        self
    }

    /// Resolve, validate, allocate and persist a new active instance.
    ///
    /// Validation happens before allocation, so a rejected request consumes
    /// no sequence value.
    pub async fn create(
        &self,
        template_ref: &str,
        attributes: &Map<String, Value>,
        actor: &Actor,
    ) -> Result<GenericInstance, CoreError> {
        let template = match self.registry.resolve(template_ref) {
            Ok(template) => template,
            Err(e) => {
                let e = CoreError::from(e);
                if e.is_operational_alert() {
                    error!(template_ref, error = %e, error_code = e.error_code(), "Template resolution failed");
                }
                return Err(e);
            }
        };
        let attributes = self.registry.validate(&template, attributes)?;

        // Held until the row exists so the prefix cannot be retired under us
        let allocation = self.allocator.reserve(&template.prefix).await?;
        let instance = GenericInstance::new(allocation.euid.clone(), &template, attributes, actor.clone());
        self.instances.insert(&instance).await?;
        drop(allocation);

        self.record(&instance.euid, AuditAction::Created, actor, json!({ "template": instance.template_id.to_string() }))
            .await;
        LimsMetrics::record_instance_created(instance.category.as_str());
        info!(
            euid = %instance.euid,
            template = %instance.template_id,
            actor = %actor,
            "Instance created"
        );
        Ok(instance)
    }

    /// Fetch an instance whatever its status
    pub async fn get(&self, euid: &Euid) -> Result<GenericInstance, CoreError> {
        self.instances
            .find_by_euid(euid)
            .await?
            .ok_or_else(|| CoreError::NotFound(format!("instance {}", euid)))
    }

    /// Merge `patch` into the attributes and re-validate against the
    /// instance's own template version.
    ///
    /// Without `expected_version` the write is last-writer-wins: a conflicting
    /// write is re-read, re-merged and retried. With it, a version mismatch
    /// fails with `ConcurrentModification`.
    pub async fn update_attributes(
        &self,
        euid: &Euid,
        patch: &Map<String, Value>,
        expected_version: Option<u64>,
        actor: &Actor,
    ) -> Result<GenericInstance, CoreError> {
        if self.optimistic_concurrency && expected_version.is_none() {
            return Err(CoreError::ValidationError {
                field: "expected_version".to_string(),
                reason: "required when optimistic concurrency is enabled".to_string(),
            });
        }

        let mut attempt = 0;
        loop {
            attempt += 1;
            let current = self.get(euid).await?;
            if let Some(expected) = expected_version {
                if current.version != expected {
                    return Err(CoreError::ConcurrentModification {
                        euid: euid.clone(),
                        expected,
                        actual: current.version,
                    });
                }
            }
            if !current.is_active() {
                return Err(CoreError::InvalidState(format!(
                    "instance {} is {} and cannot be updated",
                    euid, current.status
                )));
            }

            let template = self.registry.resolve_id(&current.template_id)?;
            let merged = merge_patch(&current.attributes, patch);
            let attributes = self.registry.validate(&template, &merged)?;

            let mut next = current.next_revision(actor);
            next.attributes = attributes;

            match self.instances.update(&next, current.version).await {
                Ok(()) => {
                    self.record(euid, AuditAction::AttributesUpdated, actor, Value::Object(patch.clone()))
                        .await;
                    self.invalidate(euid).await;
                    debug!(euid = %euid, version = next.version, "Attributes updated");
                    return Ok(next);
                }
                Err(CoreError::ConcurrentModification { .. })
                    if expected_version.is_none() && attempt < self.max_update_retries =>
                {
                    debug!(euid = %euid, attempt, "Update conflict, retrying");
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Mark an active instance deleted; row, EUID and edges are kept
    pub async fn soft_delete(&self, euid: &Euid, actor: &Actor) -> Result<GenericInstance, CoreError> {
        self.transition(euid, actor, AuditAction::SoftDeleted, Value::Null, |next| match next.status {
            InstanceStatus::Active => {
                next.status = InstanceStatus::Deleted;
                Ok(())
            }
            other => Err(format!("instance {} is {}, only active instances can be deleted", next.euid, other)),
        })
        .await
    }

    /// Bring a soft-deleted instance back
    pub async fn un_delete(&self, euid: &Euid, actor: &Actor) -> Result<GenericInstance, CoreError> {
        self.transition(euid, actor, AuditAction::Undeleted, Value::Null, |next| match next.status {
            InstanceStatus::Deleted => {
                next.status = InstanceStatus::Active;
                Ok(())
            }
            _ => Err(format!("instance {} was never deleted", next.euid)),
        })
        .await
    }

    /// Mark an active instance superseded, optionally recording its replacement
    pub async fn supersede(
        &self,
        euid: &Euid,
        replaced_by: Option<&Euid>,
        actor: &Actor,
    ) -> Result<GenericInstance, CoreError> {
        if let Some(replacement) = replaced_by {
            if replacement == euid {
                return Err(CoreError::ValidationError {
                    field: "replaced_by".to_string(),
                    reason: "an instance cannot supersede itself".to_string(),
                });
            }
            self.get(replacement).await?;
        }

        let detail = json!({ "replaced_by": replaced_by });
        self.transition(euid, actor, AuditAction::Superseded, detail, |next| match next.status {
            InstanceStatus::Active => {
                next.status = InstanceStatus::Superseded;
                next.superseded_by = replaced_by.cloned();
                Ok(())
            }
            other => Err(format!("instance {} is {}, only active instances can be superseded", next.euid, other)),
        })
        .await
    }

    /// Instances created from any version of the prefix
    pub async fn list_by_template(
        &self,
        prefix: &str,
        status: Option<InstanceStatus>,
    ) -> Result<Vec<GenericInstance>, CoreError> {
        self.instances.list_by_template(prefix, status).await
    }

    /// Status change with compare-and-swap retries.
    ///
    /// `apply` sees the next revision and either edits it or explains why the
    /// current status does not allow the change.
    async fn transition<F>(
        &self,
        euid: &Euid,
        actor: &Actor,
        action: AuditAction,
        detail: Value,
        apply: F,
    ) -> Result<GenericInstance, CoreError>
    where
        F: Fn(&mut GenericInstance) -> Result<(), String> + Send + Sync,
    {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let current = self.get(euid).await?;
            let mut next = current.next_revision(actor);
            apply(&mut next).map_err(CoreError::InvalidState)?;

            match self.instances.update(&next, current.version).await {
                Ok(()) => {
                    self.record(euid, action, actor, detail.clone()).await;
                    self.invalidate(euid).await;
                    info!(euid = %euid, status = %next.status, actor = %actor, "Instance status changed");
                    return Ok(next);
                }
                Err(CoreError::ConcurrentModification { .. }) if attempt < self.max_update_retries => {
                    debug!(euid = %euid, attempt, "Status change conflict, retrying");
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn record(&self, euid: &Euid, action: AuditAction, actor: &Actor, detail: Value) {
        let event = AuditEvent::new(euid.clone(), action, actor.clone(), detail);
        if let Err(e) = self.audit.append(&event).await {
            warn!(euid = %euid, action = action.as_str(), error = %e, "Failed to append audit event");
        }
    }

    async fn invalidate(&self, euid: &Euid) {
        if let Some(invalidator) = &self.invalidator {
            invalidator.invalidate(euid).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::repository::memory::{
        MemoryAuditRepository, MemoryInstanceRepository, MemorySequenceCounterRepository,
    };
    use async_trait::async_trait;
    use lims_templates::{AttributeSpec, AttributeType, Template, TemplateCategory, TemplateDocument};
    use mockall::mock;
    use pretty_assertions::assert_eq;

    mock! {
        pub Audit {}

        #[async_trait]
        impl AuditRepository for Audit {
            async fn append(&self, event: &AuditEvent) -> Result<(), CoreError>;
            async fn events_for(&self, euid: &Euid) -> Result<Vec<AuditEvent>, CoreError>;
        }
    }

    fn registry() -> Arc<TemplateRegistry> {
        let mut tube = Template::new("tube", "CON", TemplateCategory::Container);
        tube.attributes = vec![
            AttributeSpec::new("barcode", AttributeType::String).required(),
            AttributeSpec::new("volume", AttributeType::Number).with_bounds(Some(0.0), Some(50.0)),
        ];
        let mut document = TemplateDocument::empty();
        document.templates = vec![tube];
        Arc::new(TemplateRegistry::from_document(&document).unwrap())
    }

    async fn store_with_audit(audit: Arc<dyn AuditRepository>) -> InstanceStore {
        let registry = registry();
        let instances: Arc<dyn InstanceRepository> = Arc::new(MemoryInstanceRepository::new());
        let allocator = EuidAllocator::new(
            Arc::new(MemorySequenceCounterRepository::new()),
            instances.clone(),
            registry.clone(),
            7,
        )
        .unwrap();
        allocator.register_prefix("CON").await.unwrap();
        InstanceStore::new(registry, Arc::new(allocator), instances, audit)
    }

    async fn store() -> InstanceStore {
        store_with_audit(Arc::new(MemoryAuditRepository::new())).await
    }

    fn attrs(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap()
    }

    #[tokio::test]
    async fn test_create_and_get() {
        let store = store().await;
        let actor = Actor::from("alice");
        let created = store.create("CON", &attrs(json!({ "barcode": "BC1" })), &actor).await.unwrap();
        assert_eq!(created.euid.as_str(), "CON-0000001");
        assert_eq!(created.status, InstanceStatus::Active);

        let fetched = store.get(&created.euid).await.unwrap();
        assert_eq!(fetched, created);
        assert!(matches!(store.get(&"CON-0000099".into()).await, Err(CoreError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_invalid_attributes_consume_no_euid() {
        let store = store().await;
        let actor = Actor::system();
        let err = store.create("CON", &attrs(json!({})), &actor).await.unwrap_err();
        assert_eq!(err.error_code(), "ERR_CORE_VALIDATION");

        let created = store.create("CON", &attrs(json!({ "barcode": "BC1" })), &actor).await.unwrap();
        assert_eq!(created.euid.as_str(), "CON-0000001");
    }

    #[tokio::test]
    async fn test_update_merges_and_revalidates() {
        let store = store().await;
        let actor = Actor::system();
        let created = store
            .create("CON", &attrs(json!({ "barcode": "BC1", "volume": 10 })), &actor)
            .await
            .unwrap();

        let updated = store
            .update_attributes(&created.euid, &attrs(json!({ "volume": null })), None, &actor)
            .await
            .unwrap();
        assert_eq!(Value::Object(updated.attributes.clone()), json!({ "barcode": "BC1" }));
        assert_eq!(updated.version, 2);
        assert_eq!(updated.template_id, created.template_id);

        let err = store
            .update_attributes(&created.euid, &attrs(json!({ "volume": 80 })), None, &actor)
            .await
            .unwrap_err();
        assert_eq!(err.error_code(), "ERR_CORE_VALIDATION");
        assert_eq!(store.get(&created.euid).await.unwrap().version, 2);
    }

    #[tokio::test]
    async fn test_stale_expected_version() {
        let store = store().await.with_optimistic_concurrency(true);
        let actor = Actor::system();
        let created = store.create("CON", &attrs(json!({ "barcode": "BC1" })), &actor).await.unwrap();

        let missing = store
            .update_attributes(&created.euid, &attrs(json!({ "volume": 1 })), None, &actor)
            .await
            .unwrap_err();
        assert!(matches!(missing, CoreError::ValidationError { ref field, .. } if field == "expected_version"));

        store
            .update_attributes(&created.euid, &attrs(json!({ "volume": 1 })), Some(1), &actor)
            .await
            .unwrap();
        let stale = store
            .update_attributes(&created.euid, &attrs(json!({ "volume": 2 })), Some(1), &actor)
            .await
            .unwrap_err();
        assert_eq!(
            stale,
            CoreError::ConcurrentModification { euid: created.euid.clone(), expected: 1, actual: 2 }
        );
    }

    #[tokio::test]
    async fn test_status_transitions() {
        let store = store().await;
        let actor = Actor::system();
        let a = store.create("CON", &attrs(json!({ "barcode": "A" })), &actor).await.unwrap();
        let b = store.create("CON", &attrs(json!({ "barcode": "B" })), &actor).await.unwrap();

        assert!(matches!(store.un_delete(&a.euid, &actor).await, Err(CoreError::InvalidState(_))));

        let deleted = store.soft_delete(&a.euid, &actor).await.unwrap();
        assert_eq!(deleted.status, InstanceStatus::Deleted);
        assert!(matches!(store.soft_delete(&a.euid, &actor).await, Err(CoreError::InvalidState(_))));
        assert!(matches!(
            store.update_attributes(&a.euid, &attrs(json!({ "volume": 1 })), None, &actor).await,
            Err(CoreError::InvalidState(_))
        ));

        let restored = store.un_delete(&a.euid, &actor).await.unwrap();
        assert_eq!(restored.status, InstanceStatus::Active);

        assert!(matches!(
            store.supersede(&a.euid, Some(&a.euid), &actor).await,
            Err(CoreError::ValidationError { .. })
        ));
        assert!(matches!(
            store.supersede(&a.euid, Some(&"CON-0000042".into()), &actor).await,
            Err(CoreError::NotFound(_))
        ));
        let superseded = store.supersede(&a.euid, Some(&b.euid), &actor).await.unwrap();
        assert_eq!(superseded.status, InstanceStatus::Superseded);
        assert_eq!(superseded.superseded_by, Some(b.euid.clone()));

        let active = store.list_by_template("CON", Some(InstanceStatus::Active)).await.unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].euid, b.euid);
    }

    #[tokio::test]
    async fn test_audit_failure_does_not_undo_create() {
        let mut audit = MockAudit::new();
        audit
            .expect_append()
            .returning(|_| Err(CoreError::StateStoreError("audit table unavailable".into())));
        let store = store_with_audit(Arc::new(audit)).await;

        let created = store
            .create("CON", &attrs(json!({ "barcode": "BC1" })), &Actor::system())
            .await
            .unwrap();
        assert!(store.get(&created.euid).await.is_ok());
    }

    #[tokio::test]
    async fn test_create_with_unknown_template() {
        let store = store().await;
        let err = store.create("XYZ", &attrs(json!({ "barcode": "BC1" })), &Actor::system()).await.unwrap_err();
        assert!(matches!(err, CoreError::UnknownTemplate(_)));
        assert!(err.is_operational_alert());
    }

    /// Stops inside `count_by_prefix` until released
    #[derive(Default)]
    struct GatedInstances {
        inner: MemoryInstanceRepository,
        counted: tokio::sync::Notify,
        release: tokio::sync::Notify,
    }

    #[async_trait]
    impl InstanceRepository for GatedInstances {
        async fn insert(&self, instance: &GenericInstance) -> Result<(), CoreError> {
            self.inner.insert(instance).await
        }

        async fn find_by_euid(&self, euid: &Euid) -> Result<Option<GenericInstance>, CoreError> {
            self.inner.find_by_euid(euid).await
        }

        async fn update(&self, instance: &GenericInstance, expected_version: u64) -> Result<(), CoreError> {
            self.inner.update(instance, expected_version).await
        }

        async fn list_by_template(
            &self,
            prefix: &str,
            status: Option<InstanceStatus>,
        ) -> Result<Vec<GenericInstance>, CoreError> {
            self.inner.list_by_template(prefix, status).await
        }

        async fn count_by_prefix(&self, prefix: &str) -> Result<u64, CoreError> {
            let count = self.inner.count_by_prefix(prefix).await?;
            self.counted.notify_one();
            self.release.notified().await;
            Ok(count)
        }
    }

    #[tokio::test]
    async fn test_create_during_retire_never_reuses_an_euid() {
        let registry = registry();
        let instances = Arc::new(GatedInstances::default());
        let allocator = Arc::new(
            EuidAllocator::new(
                Arc::new(MemorySequenceCounterRepository::new()),
                instances.clone(),
                registry.clone(),
                7,
            )
            .unwrap(),
        );
        allocator.register_prefix("CON").await.unwrap();
        let store = Arc::new(InstanceStore::new(
            registry,
            allocator.clone(),
            instances.clone(),
            Arc::new(MemoryAuditRepository::new()),
        ));

        let retire = tokio::spawn({
            let allocator = allocator.clone();
            async move { allocator.retire_prefix("CON").await }
        });
        // Retirement has counted zero rows and is parked
        instances.counted.notified().await;

        let create = tokio::spawn({
            let store = store.clone();
            async move { store.create("CON", &attrs(json!({ "barcode": "BC1" })), &Actor::system()).await }
        });
        tokio::task::yield_now().await;
        instances.release.notify_one();

        retire.await.unwrap().unwrap();
        assert_eq!(create.await.unwrap().unwrap_err(), CoreError::UnknownPrefix("CON".into()));
        assert!(store.list_by_template("CON", None).await.unwrap().is_empty());

        allocator.register_prefix("CON").await.unwrap();
        let first = store.create("CON", &attrs(json!({ "barcode": "BC2" })), &Actor::system()).await.unwrap();
        let second = store.create("CON", &attrs(json!({ "barcode": "BC3" })), &Actor::system()).await.unwrap();
        assert_eq!(first.euid.as_str(), "CON-0000001");
        assert_eq!(second.euid.as_str(), "CON-0000002");
    }
}
