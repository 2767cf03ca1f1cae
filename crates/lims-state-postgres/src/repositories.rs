use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::types::Json;
use sqlx::{Postgres, Row, Transaction};
use std::collections::{HashMap, HashSet, VecDeque};
use tracing::debug;

use lims_core::{
    Actor, AuditEvent, AuditRepository, CoreError, EdgeId, EdgeStatus, Euid, GenericInstance,
    InstanceRepository, InstanceStatus, LineageEdge, LineageRepository, SequenceCounter,
    SequenceCounterRepository,
};

use crate::PostgresConnection;

/// Key of the transaction-scoped advisory lock serialising lineage inserts
const LINEAGE_LOCK_KEY: i64 = 0x4c49_4d53_4c49_4e45;

fn store_error(context: &str, e: sqlx::Error) -> CoreError {
    CoreError::StateStoreError(format!("{}: {}", context, e))
}

fn to_db_version(version: u64) -> Result<i64, CoreError> {
    i64::try_from(version)
        .map_err(|_| CoreError::StateStoreError(format!("version {} does not fit in BIGINT", version)))
}

/// PostgreSQL implementation of SequenceCounterRepository
pub struct PostgresSequenceCounterRepository {
    conn: PostgresConnection,
}

impl PostgresSequenceCounterRepository {
    /// Create a new PostgreSQL sequence counter repository
    pub fn new(conn: PostgresConnection) -> Self {
        Self { conn }
    }
}

#[async_trait]
impl SequenceCounterRepository for PostgresSequenceCounterRepository {
    async fn register(&self, prefix: &str) -> Result<bool, CoreError> {
        // A retired row is revived with its last value intact
        let row = sqlx::query(
            "INSERT INTO sequence_counters (prefix, last_value) VALUES ($1, 0) \
             ON CONFLICT (prefix) DO UPDATE SET retired_at = NULL \
             WHERE sequence_counters.retired_at IS NOT NULL \
             RETURNING last_value",
        )
        .bind(prefix)
        .fetch_optional(self.conn.pool())
        .await
        .map_err(|e| store_error("Failed to register counter", e))?;

        debug!(prefix, created = row.is_some(), "Registered sequence counter");
        Ok(row.is_some())
    }

    async fn next_value(&self, prefix: &str) -> Result<u64, CoreError> {
        // The row lock taken by UPDATE serialises concurrent increments
        let row = sqlx::query(
            "UPDATE sequence_counters SET last_value = last_value + 1 \
             WHERE prefix = $1 AND retired_at IS NULL RETURNING last_value",
        )
        .bind(prefix)
        .fetch_optional(self.conn.pool())
        .await
        .map_err(|e| store_error("Failed to increment counter", e))?;

        match row {
            Some(row) => {
                let value: i64 = row
                    .try_get("last_value")
                    .map_err(|e| store_error("Failed to read counter", e))?;
                Ok(value as u64)
            }
            None => Err(CoreError::UnknownPrefix(prefix.to_string())),
        }
    }

    async fn last_value(&self, prefix: &str) -> Result<Option<u64>, CoreError> {
        let value: Option<i64> = sqlx::query_scalar(
            "SELECT last_value FROM sequence_counters WHERE prefix = $1 AND retired_at IS NULL",
        )
        .bind(prefix)
        .fetch_optional(self.conn.pool())
        .await
        .map_err(|e| store_error("Failed to read counter", e))?;
        Ok(value.map(|v| v as u64))
    }

    async fn retire(&self, prefix: &str) -> Result<bool, CoreError> {
        let mut tx = self
            .conn
            .pool()
            .begin()
            .await
            .map_err(|e| store_error("Failed to begin transaction", e))?;

        // Holding the row lock keeps next_value out until commit
        let active: Option<String> = sqlx::query_scalar(
            "SELECT prefix FROM sequence_counters WHERE prefix = $1 AND retired_at IS NULL FOR UPDATE",
        )
        .bind(prefix)
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| store_error("Failed to lock counter", e))?;
        if active.is_none() {
            return Ok(false);
        }

        let in_use: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM generic_instances WHERE template_prefix = $1")
            .bind(prefix)
            .fetch_one(&mut *tx)
            .await
            .map_err(|e| store_error("Failed to count instances", e))?;
        if in_use > 0 {
            return Err(CoreError::InvalidState(format!(
                "prefix '{}' still has {} instance(s)",
                prefix, in_use
            )));
        }

        sqlx::query("UPDATE sequence_counters SET retired_at = NOW() WHERE prefix = $1")
            .bind(prefix)
            .execute(&mut *tx)
            .await
            .map_err(|e| store_error("Failed to retire counter", e))?;

        tx.commit()
            .await
            .map_err(|e| store_error("Failed to commit counter retirement", e))?;

        debug!(prefix, "Retired sequence counter");
        Ok(true)
    }

    async fn list(&self) -> Result<Vec<SequenceCounter>, CoreError> {
        let rows = sqlx::query("SELECT prefix, last_value FROM sequence_counters WHERE retired_at IS NULL ORDER BY prefix")
            .fetch_all(self.conn.pool())
            .await
            .map_err(|e| store_error("Failed to list counters", e))?;

        rows.iter()
            .map(|row| {
                let prefix: String = row.try_get("prefix").map_err(|e| store_error("Failed to read counter", e))?;
                let last_value: i64 = row
                    .try_get("last_value")
                    .map_err(|e| store_error("Failed to read counter", e))?;
                Ok(SequenceCounter {
                    prefix,
                    last_value: last_value as u64,
                })
            })
            .collect()
    }
}

/// PostgreSQL implementation of InstanceRepository
///
/// The full instance is kept as JSONB; prefix, status and version are
/// duplicated into columns for filtering and compare-and-swap.
pub struct PostgresInstanceRepository {
    conn: PostgresConnection,
}

impl PostgresInstanceRepository {
    /// Create a new PostgreSQL instance repository
    pub fn new(conn: PostgresConnection) -> Self {
        Self { conn }
    }
}

fn instance_from_row(row: &sqlx::postgres::PgRow) -> Result<GenericInstance, CoreError> {
    let Json(instance): Json<GenericInstance> = row
        .try_get("data")
        .map_err(|e| CoreError::SerializationError(format!("Failed to decode instance: {}", e)))?;
    Ok(instance)
}

#[async_trait]
impl InstanceRepository for PostgresInstanceRepository {
    async fn insert(&self, instance: &GenericInstance) -> Result<(), CoreError> {
        let result = sqlx::query(
            "INSERT INTO generic_instances \
             (euid, template_prefix, template_version, category, status, version, data, created_at, updated_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9) \
             ON CONFLICT (euid) DO NOTHING",
        )
        .bind(instance.euid.as_str())
        .bind(&instance.template_id.prefix)
        .bind(instance.template_id.version as i32)
        .bind(instance.category.to_string())
        .bind(instance.status.as_str())
        .bind(to_db_version(instance.version)?)
        .bind(Json(instance))
        .bind(instance.created_at)
        .bind(instance.updated_at)
        .execute(self.conn.pool())
        .await
        .map_err(|e| store_error("Failed to insert instance", e))?;

        if result.rows_affected() == 0 {
            return Err(CoreError::InvalidState(format!("instance {} already exists", instance.euid)));
        }
        debug!(euid = %instance.euid, "Inserted instance");
        Ok(())
    }

    async fn find_by_euid(&self, euid: &Euid) -> Result<Option<GenericInstance>, CoreError> {
        let row = sqlx::query("SELECT data FROM generic_instances WHERE euid = $1")
            .bind(euid.as_str())
            .fetch_optional(self.conn.pool())
            .await
            .map_err(|e| store_error("Failed to fetch instance", e))?;

        row.as_ref().map(instance_from_row).transpose()
    }

    async fn update(&self, instance: &GenericInstance, expected_version: u64) -> Result<(), CoreError> {
        let result = sqlx::query(
            "UPDATE generic_instances \
             SET status = $2, version = $3, data = $4, updated_at = $5 \
             WHERE euid = $1 AND version = $6",
        )
        .bind(instance.euid.as_str())
        .bind(instance.status.as_str())
        .bind(to_db_version(instance.version)?)
        .bind(Json(instance))
        .bind(instance.updated_at)
        .bind(to_db_version(expected_version)?)
        .execute(self.conn.pool())
        .await
        .map_err(|e| store_error("Failed to update instance", e))?;

        if result.rows_affected() == 1 {
            debug!(euid = %instance.euid, version = instance.version, "Updated instance");
            return Ok(());
        }

        let actual: Option<i64> = sqlx::query_scalar("SELECT version FROM generic_instances WHERE euid = $1")
            .bind(instance.euid.as_str())
            .fetch_optional(self.conn.pool())
            .await
            .map_err(|e| store_error("Failed to read instance version", e))?;

        match actual {
            None => Err(CoreError::NotFound(format!("instance {}", instance.euid))),
            Some(actual) => Err(CoreError::ConcurrentModification {
                euid: instance.euid.clone(),
                expected: expected_version,
                actual: actual as u64,
            }),
        }
    }

    async fn list_by_template(
        &self,
        prefix: &str,
        status: Option<InstanceStatus>,
    ) -> Result<Vec<GenericInstance>, CoreError> {
        let rows = sqlx::query(
            "SELECT data FROM generic_instances \
             WHERE template_prefix = $1 AND ($2::TEXT IS NULL OR status = $2) \
             ORDER BY euid",
        )
        .bind(prefix)
        .bind(status.map(|s| s.as_str()))
        .fetch_all(self.conn.pool())
        .await
        .map_err(|e| store_error("Failed to list instances", e))?;

        rows.iter().map(instance_from_row).collect()
    }

    async fn count_by_prefix(&self, prefix: &str) -> Result<u64, CoreError> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM generic_instances WHERE template_prefix = $1")
            .bind(prefix)
            .fetch_one(self.conn.pool())
            .await
            .map_err(|e| store_error("Failed to count instances", e))?;
        Ok(count as u64)
    }
}

/// PostgreSQL implementation of LineageRepository
pub struct PostgresLineageRepository {
    conn: PostgresConnection,
}

impl PostgresLineageRepository {
    /// Create a new PostgreSQL lineage repository
    pub fn new(conn: PostgresConnection) -> Self {
        Self { conn }
    }

    async fn active_duplicate(
        tx: &mut Transaction<'_, Postgres>,
        edge: &LineageEdge,
    ) -> Result<Option<LineageEdge>, CoreError> {
        let row = sqlx::query(
            "SELECT data FROM lineage_edges \
             WHERE parent_euid = $1 AND child_euid = $2 AND relationship_type = $3 AND status = 'active'",
        )
        .bind(edge.parent.as_str())
        .bind(edge.child.as_str())
        .bind(&edge.relationship_type)
        .fetch_optional(&mut **tx)
        .await
        .map_err(|e| store_error("Failed to look up edge", e))?;

        row.as_ref().map(edge_from_row).transpose()
    }

    /// Active path `from ..= to`, if `to` is reachable from `from`
    async fn find_path(
        tx: &mut Transaction<'_, Postgres>,
        from: &Euid,
        to: &Euid,
    ) -> Result<Option<Vec<Euid>>, CoreError> {
        // UNION deduplicates on (parent, child): at most one row per edge
        let rows = sqlx::query(
            "WITH RECURSIVE reach(parent_euid, child_euid) AS ( \
                 SELECT parent_euid, child_euid FROM lineage_edges \
                 WHERE parent_euid = $1 AND status = 'active' \
                 UNION \
                 SELECT e.parent_euid, e.child_euid FROM lineage_edges e \
                 JOIN reach r ON e.parent_euid = r.child_euid \
                 WHERE e.status = 'active' \
             ) \
             SELECT parent_euid, child_euid FROM reach",
        )
        .bind(from.as_str())
        .fetch_all(&mut **tx)
        .await
        .map_err(|e| store_error("Failed to walk lineage", e))?;

        let mut adjacency: HashMap<String, Vec<String>> = HashMap::new();
        for row in &rows {
            let parent: String = row.try_get("parent_euid").map_err(|e| store_error("Failed to read edge", e))?;
            let child: String = row.try_get("child_euid").map_err(|e| store_error("Failed to read edge", e))?;
            adjacency.entry(parent).or_default().push(child);
        }
        Ok(shortest_path(&adjacency, from.as_str(), to.as_str()))
    }
}

/// Breadth-first search over an adjacency list
fn shortest_path(adjacency: &HashMap<String, Vec<String>>, from: &str, to: &str) -> Option<Vec<Euid>> {
    let mut predecessor: HashMap<&str, &str> = HashMap::new();
    let mut seen: HashSet<&str> = HashSet::from([from]);
    let mut queue: VecDeque<&str> = VecDeque::from([from]);

    while let Some(node) = queue.pop_front() {
        if node == to {
            let mut path = vec![Euid::from(node)];
            let mut current = node;
            while let Some(&prev) = predecessor.get(current) {
                path.push(Euid::from(prev));
                current = prev;
            }
            path.reverse();
            return Some(path);
        }
        for next in adjacency.get(node).into_iter().flatten() {
            if seen.insert(next.as_str()) {
                predecessor.insert(next.as_str(), node);
                queue.push_back(next.as_str());
            }
        }
    }
    None
}

fn edge_from_row(row: &sqlx::postgres::PgRow) -> Result<LineageEdge, CoreError> {
    let Json(edge): Json<LineageEdge> = row
        .try_get("data")
        .map_err(|e| CoreError::SerializationError(format!("Failed to decode lineage edge: {}", e)))?;
    Ok(edge)
}

#[async_trait]
impl LineageRepository for PostgresLineageRepository {
    async fn insert_acyclic(&self, edge: LineageEdge) -> Result<LineageEdge, CoreError> {
        if edge.parent == edge.child {
            return Err(CoreError::CycleDetected {
                path: vec![edge.parent.clone(), edge.child.clone()],
            });
        }

        let mut tx = self
            .conn
            .pool()
            .begin()
            .await
            .map_err(|e| store_error("Failed to begin transaction", e))?;

        // One lock for the whole graph: cycle check and insert must not
        // interleave with another insert
        sqlx::query("SELECT pg_advisory_xact_lock($1)")
            .bind(LINEAGE_LOCK_KEY)
            .execute(&mut *tx)
            .await
            .map_err(|e| store_error("Failed to lock lineage graph", e))?;

        if let Some(existing) = Self::active_duplicate(&mut tx, &edge).await? {
            tx.rollback()
                .await
                .map_err(|e| store_error("Failed to roll back transaction", e))?;
            return Ok(existing);
        }

        if let Some(back) = Self::find_path(&mut tx, &edge.child, &edge.parent).await? {
            tx.rollback()
                .await
                .map_err(|e| store_error("Failed to roll back transaction", e))?;
            let mut path = Vec::with_capacity(back.len() + 1);
            path.push(edge.parent.clone());
            path.extend(back);
            return Err(CoreError::CycleDetected { path });
        }

        sqlx::query(
            "INSERT INTO lineage_edges (id, parent_euid, child_euid, relationship_type, status, data, created_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7)",
        )
        .bind(edge.id.0)
        .bind(edge.parent.as_str())
        .bind(edge.child.as_str())
        .bind(&edge.relationship_type)
        .bind(edge.status.as_str())
        .bind(Json(&edge))
        .bind(edge.created_at)
        .execute(&mut *tx)
        .await
        .map_err(|e| store_error("Failed to insert lineage edge", e))?;

        tx.commit()
            .await
            .map_err(|e| store_error("Failed to commit lineage edge", e))?;

        debug!(edge_id = %edge.id, parent = %edge.parent, child = %edge.child, "Inserted lineage edge");
        Ok(edge)
    }

    async fn find_edge(&self, id: &EdgeId) -> Result<Option<LineageEdge>, CoreError> {
        let row = sqlx::query("SELECT data FROM lineage_edges WHERE id = $1")
            .bind(id.0)
            .fetch_optional(self.conn.pool())
            .await
            .map_err(|e| store_error("Failed to fetch lineage edge", e))?;

        row.as_ref().map(edge_from_row).transpose()
    }

    async fn outgoing(&self, euid: &Euid, include_superseded: bool) -> Result<Vec<LineageEdge>, CoreError> {
        let rows = sqlx::query(
            "SELECT data FROM lineage_edges WHERE parent_euid = $1 AND ($2 OR status = 'active') ORDER BY seq",
        )
        .bind(euid.as_str())
        .bind(include_superseded)
        .fetch_all(self.conn.pool())
        .await
        .map_err(|e| store_error("Failed to list outgoing edges", e))?;

        rows.iter().map(edge_from_row).collect()
    }

    async fn incoming(&self, euid: &Euid, include_superseded: bool) -> Result<Vec<LineageEdge>, CoreError> {
        let rows = sqlx::query(
            "SELECT data FROM lineage_edges WHERE child_euid = $1 AND ($2 OR status = 'active') ORDER BY seq",
        )
        .bind(euid.as_str())
        .bind(include_superseded)
        .fetch_all(self.conn.pool())
        .await
        .map_err(|e| store_error("Failed to list incoming edges", e))?;

        rows.iter().map(edge_from_row).collect()
    }

    async fn supersede(&self, id: &EdgeId, actor: &Actor, at: DateTime<Utc>) -> Result<LineageEdge, CoreError> {
        let mut tx = self
            .conn
            .pool()
            .begin()
            .await
            .map_err(|e| store_error("Failed to begin transaction", e))?;

        let row = sqlx::query("SELECT data FROM lineage_edges WHERE id = $1 FOR UPDATE")
            .bind(id.0)
            .fetch_optional(&mut *tx)
            .await
            .map_err(|e| store_error("Failed to fetch lineage edge", e))?;

        let mut edge = match row {
            Some(row) => edge_from_row(&row)?,
            None => return Err(CoreError::NotFound(format!("lineage edge {}", id))),
        };
        if !edge.is_active() {
            return Err(CoreError::InvalidState(format!("lineage edge {} is already superseded", id)));
        }

        edge.status = EdgeStatus::Superseded;
        edge.superseded_at = Some(at);
        edge.superseded_by = Some(actor.clone());

        sqlx::query("UPDATE lineage_edges SET status = $2, data = $3 WHERE id = $1")
            .bind(id.0)
            .bind(edge.status.as_str())
            .bind(Json(&edge))
            .execute(&mut *tx)
            .await
            .map_err(|e| store_error("Failed to supersede lineage edge", e))?;

        tx.commit()
            .await
            .map_err(|e| store_error("Failed to commit lineage edge", e))?;

        debug!(edge_id = %id, actor = %actor, "Superseded lineage edge");
        Ok(edge)
    }
}

/// PostgreSQL implementation of AuditRepository
pub struct PostgresAuditRepository {
    conn: PostgresConnection,
}

impl PostgresAuditRepository {
    /// Create a new PostgreSQL audit repository
    pub fn new(conn: PostgresConnection) -> Self {
        Self { conn }
    }
}

#[async_trait]
impl AuditRepository for PostgresAuditRepository {
    async fn append(&self, event: &AuditEvent) -> Result<(), CoreError> {
        sqlx::query("INSERT INTO audit_events (id, euid, action, data, at) VALUES ($1, $2, $3, $4, $5)")
            .bind(event.id)
            .bind(event.euid.as_str())
            .bind(event.action.as_str())
            .bind(Json(event))
            .bind(event.at)
            .execute(self.conn.pool())
            .await
            .map_err(|e| store_error("Failed to append audit event", e))?;
        Ok(())
    }

    async fn events_for(&self, euid: &Euid) -> Result<Vec<AuditEvent>, CoreError> {
        let rows = sqlx::query("SELECT data FROM audit_events WHERE euid = $1 ORDER BY seq")
            .bind(euid.as_str())
            .fetch_all(self.conn.pool())
            .await
            .map_err(|e| store_error("Failed to list audit events", e))?;

        rows.iter()
            .map(|row| {
                let Json(event): Json<AuditEvent> = row
                    .try_get("data")
                    .map_err(|e| CoreError::SerializationError(format!("Failed to decode audit event: {}", e)))?;
                Ok(event)
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn adjacency(edges: &[(&str, &str)]) -> HashMap<String, Vec<String>> {
        let mut map: HashMap<String, Vec<String>> = HashMap::new();
        for (parent, child) in edges {
            map.entry(parent.to_string()).or_default().push(child.to_string());
        }
        map
    }

    #[test]
    fn test_shortest_path_prefers_fewest_hops() {
        let graph = adjacency(&[("A", "B"), ("B", "C"), ("C", "D"), ("A", "D")]);
        let path = shortest_path(&graph, "A", "D").unwrap();
        assert_eq!(path, vec![Euid::from("A"), Euid::from("D")]);
    }

    #[test]
    fn test_shortest_path_unreachable() {
        let graph = adjacency(&[("A", "B"), ("C", "A")]);
        assert!(shortest_path(&graph, "A", "C").is_none());
        assert_eq!(shortest_path(&graph, "C", "B").unwrap().len(), 3);
    }

    #[test]
    fn test_version_conversion_rejects_overflow() {
        assert_eq!(to_db_version(42).unwrap(), 42);
        assert!(matches!(to_db_version(u64::MAX), Err(CoreError::StateStoreError(_))));
    }
}
