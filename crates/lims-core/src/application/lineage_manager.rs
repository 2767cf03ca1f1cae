use chrono::Utc;
use futures::stream::{self, BoxStream, StreamExt, TryStreamExt};
use serde_json::json;
use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use tracing::{debug, info, warn};

use lims_monitoring::LimsMetrics;
use lims_templates::TemplateRegistry;

use crate::application::workflow_engine::StateInvalidator;
use crate::domain::euid::Euid;
use crate::domain::events::{AuditAction, AuditEvent};
use crate::domain::instance::{Actor, GenericInstance};
use crate::domain::lineage::{Direction, EdgeId, InstanceEdges, LineageEdge};
use crate::domain::repository::{AuditRepository, InstanceRepository, LineageRepository};
use crate::CoreError;

/// Creates lineage edges and walks the lineage DAG
pub struct LineageManager {
    registry: Arc<TemplateRegistry>,
    instances: Arc<dyn InstanceRepository>,
    lineage: Arc<dyn LineageRepository>,
    audit: Arc<dyn AuditRepository>,
    invalidator: Option<Arc<dyn StateInvalidator>>,
}

impl LineageManager {
    /// Create a new lineage manager
    pub fn new(
        registry: Arc<TemplateRegistry>,
        instances: Arc<dyn InstanceRepository>,
        lineage: Arc<dyn LineageRepository>,
        audit: Arc<dyn AuditRepository>,
    ) -> Self {
        Self {
            registry,
            instances,
            lineage,
            audit,
            invalidator: None,
        }
    }

    /// Notify `invalidator` about both endpoints of every edge change
    pub fn with_invalidator(mut self, invalidator: Arc<dyn StateInvalidator>) -> Self {
        self.invalidator = Some(invalidator);
        self
    }

    /// Link `parent -> child`.
    ///
    /// Checks, in order: both instances exist and are active, both templates
    /// permit the relationship, the edge closes no cycle. The cycle check and
    /// the insert happen as one isolated step in the repository. Linking an
    /// identical active edge again returns the stored edge.
    pub async fn link(
        &self,
        parent: &Euid,
        child: &Euid,
        relationship_type: &str,
        actor: &Actor,
    ) -> Result<LineageEdge, CoreError> {
        match self.try_link(parent, child, relationship_type, actor).await {
            Ok(edge) => Ok(edge),
            Err(e) => {
                warn!(
                    parent = %parent,
                    child = %child,
                    relationship_type,
                    error = %e,
                    error_code = e.error_code(),
                    "Link rejected"
                );
                LimsMetrics::record_link_rejected(e.error_code());
                Err(e)
            }
        }
    }

    async fn try_link(
        &self,
        parent: &Euid,
        child: &Euid,
        relationship_type: &str,
        actor: &Actor,
    ) -> Result<LineageEdge, CoreError> {
        let parent_instance = self.active_instance(parent).await?;
        let child_instance = self.active_instance(child).await?;
        self.check_relationship(&parent_instance, &child_instance, relationship_type)?;

        let requested = LineageEdge::new(parent.clone(), child.clone(), relationship_type, actor.clone());
        let stored = self.lineage.insert_acyclic(requested.clone()).await?;

        if stored.id != requested.id {
            debug!(edge_id = %stored.id, "Identical active edge already exists");
            return Ok(stored);
        }

        let detail = json!({
            "edge_id": stored.id.to_string(),
            "parent": parent,
            "child": child,
            "relationship_type": relationship_type,
        });
        self.record(parent, AuditAction::Linked, actor, detail.clone()).await;
        self.record(child, AuditAction::Linked, actor, detail).await;
        self.invalidate(&stored).await;

        LimsMetrics::record_link_created(relationship_type);
        info!(
            edge_id = %stored.id,
            parent = %parent,
            child = %child,
            relationship_type,
            actor = %actor,
            "Lineage edge created"
        );
        Ok(stored)
    }

    async fn active_instance(&self, euid: &Euid) -> Result<GenericInstance, CoreError> {
        match self.instances.find_by_euid(euid).await? {
            Some(instance) if instance.is_active() => Ok(instance),
            Some(instance) => Err(CoreError::NotFound(format!(
                "no active instance {} (status {})",
                euid, instance.status
            ))),
            None => Err(CoreError::NotFound(format!("instance {}", euid))),
        }
    }

    fn check_relationship(
        &self,
        parent: &GenericInstance,
        child: &GenericInstance,
        relationship_type: &str,
    ) -> Result<(), CoreError> {
        let parent_template = self.registry.resolve_id(&parent.template_id)?;
        let child_template = self.registry.resolve_id(&child.template_id)?;

        let denied = |reason: String| CoreError::RelationshipNotAllowed {
            parent: parent.euid.clone(),
            child: child.euid.clone(),
            relationship_type: relationship_type.to_string(),
            reason,
        };

        if !parent_template.accepts_child(&child.category) {
            return Err(denied(format!(
                "template {} does not accept {} children",
                parent_template.id(),
                child.category
            )));
        }
        if !child_template.accepts_parent(&parent.category) {
            return Err(denied(format!(
                "template {} does not accept {} parents",
                child_template.id(),
                parent.category
            )));
        }
        for template in [&parent_template, &child_template] {
            if !template.allows_relationship(relationship_type) {
                return Err(denied(format!(
                    "template {} does not allow '{}' relationships",
                    template.id(),
                    relationship_type
                )));
            }
        }
        Ok(())
    }

    /// Fetch one edge, active or superseded
    pub async fn edge(&self, id: &EdgeId) -> Result<LineageEdge, CoreError> {
        self.lineage
            .find_edge(id)
            .await?
            .ok_or_else(|| CoreError::NotFound(format!("lineage edge {}", id)))
    }

    /// Mark an edge superseded; it stays visible in [`Self::edges_of`]
    pub async fn supersede_edge(&self, id: &EdgeId, actor: &Actor) -> Result<LineageEdge, CoreError> {
        let existing = self.edge(id).await?;
        if !existing.is_active() {
            return Err(CoreError::InvalidState(format!("lineage edge {} is already superseded", id)));
        }
        let edge = self.lineage.supersede(id, actor, Utc::now()).await?;

        let detail = json!({ "edge_id": edge.id.to_string() });
        self.record(&edge.parent, AuditAction::EdgeSuperseded, actor, detail.clone()).await;
        self.record(&edge.child, AuditAction::EdgeSuperseded, actor, detail).await;
        self.invalidate(&edge).await;

        info!(edge_id = %edge.id, actor = %actor, "Lineage edge superseded");
        Ok(edge)
    }

    /// Every edge touching `euid`, superseded ones included
    pub async fn edges_of(&self, euid: &Euid) -> Result<InstanceEdges, CoreError> {
        Ok(InstanceEdges {
            incoming: self.lineage.incoming(euid, true).await?,
            outgoing: self.lineage.outgoing(euid, true).await?,
        })
    }

    /// Walk towards the roots
    pub async fn ancestors(&self, euid: &Euid, max_depth: Option<usize>) -> Result<LineageWalk, CoreError> {
        self.walk(euid, Direction::Ancestors, max_depth).await
    }

    /// Walk towards the leaves
    pub async fn descendants(&self, euid: &Euid, max_depth: Option<usize>) -> Result<LineageWalk, CoreError> {
        self.walk(euid, Direction::Descendants, max_depth).await
    }

    async fn walk(
        &self,
        euid: &Euid,
        direction: Direction,
        max_depth: Option<usize>,
    ) -> Result<LineageWalk, CoreError> {
        if self.instances.find_by_euid(euid).await?.is_none() {
            return Err(CoreError::NotFound(format!("instance {}", euid)));
        }
        Ok(LineageWalk {
            lineage: self.lineage.clone(),
            start: euid.clone(),
            direction,
            max_depth,
        })
    }

    async fn record(&self, euid: &Euid, action: AuditAction, actor: &Actor, detail: serde_json::Value) {
        let event = AuditEvent::new(euid.clone(), action, actor.clone(), detail);
        if let Err(e) = self.audit.append(&event).await {
            warn!(euid = %euid, action = action.as_str(), error = %e, "Failed to append audit event");
        }
    }

    async fn invalidate(&self, edge: &LineageEdge) {
        if let Some(invalidator) = &self.invalidator {
            invalidator.invalidate(&edge.parent).await;
            invalidator.invalidate(&edge.child).await;
        }
    }
}

/// A breadth-first walk over active edges.
///
/// Nothing is read until the walk is streamed. Each call to
/// [`LineageWalk::stream`] starts over from the beginning; every EUID is
/// yielded once, the start EUID never.
#[derive(Clone)]
pub struct LineageWalk {
    lineage: Arc<dyn LineageRepository>,
    start: Euid,
    direction: Direction,
    max_depth: Option<usize>,
}

struct WalkState {
    lineage: Arc<dyn LineageRepository>,
    direction: Direction,
    max_depth: Option<usize>,
    seen: HashSet<Euid>,
    // Discovered but not yet yielded, with their depth
    pending: VecDeque<(Euid, usize)>,
    // Yielded but not yet expanded
    frontier: VecDeque<(Euid, usize)>,
    failed: bool,
}

impl WalkState {
    async fn expand(&mut self, euid: &Euid, depth: usize) -> Result<(), CoreError> {
        let edges = match self.direction {
            Direction::Descendants => self.lineage.outgoing(euid, false).await?,
            Direction::Ancestors => self.lineage.incoming(euid, false).await?,
        };
        for edge in edges {
            let next = match self.direction {
                Direction::Descendants => edge.child,
                Direction::Ancestors => edge.parent,
            };
            if self.seen.insert(next.clone()) {
                self.pending.push_back((next, depth + 1));
            }
        }
        Ok(())
    }
}

impl LineageWalk {
    /// Starting EUID
    pub fn start(&self) -> &Euid {
        &self.start
    }

    /// Walk direction
    pub fn direction(&self) -> Direction {
        self.direction
    }

    /// Lazily yield EUIDs in breadth-first order; stops after the first error
    pub fn stream(&self) -> BoxStream<'static, Result<Euid, CoreError>> {
        let state = WalkState {
            lineage: self.lineage.clone(),
            direction: self.direction,
            max_depth: self.max_depth,
            seen: HashSet::from([self.start.clone()]),
            pending: VecDeque::new(),
            frontier: VecDeque::from([(self.start.clone(), 0)]),
            failed: false,
        };

        stream::unfold(state, |mut state| async move {
            if state.failed {
                return None;
            }
            loop {
                if let Some((euid, depth)) = state.pending.pop_front() {
                    state.frontier.push_back((euid.clone(), depth));
                    return Some((Ok(euid), state));
                }
                let (euid, depth) = state.frontier.pop_front()?;
                if state.max_depth.map_or(false, |max| depth >= max) {
                    continue;
                }
                if let Err(e) = state.expand(&euid, depth).await {
                    state.failed = true;
                    return Some((Err(e), state));
                }
            }
        })
        .boxed()
    }

    /// Run the walk to the end
    pub async fn collect(&self) -> Result<Vec<Euid>, CoreError> {
        self.stream().try_collect().await
    }
}
