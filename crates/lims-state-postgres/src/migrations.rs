/// Schema migrations, applied in order.
///
/// Every statement is idempotent so the whole list can run on each startup.
pub fn generate_migrations() -> Vec<(&'static str, &'static str)> {
    vec![
        (
            "20240501000000_initial_schema",
            r#"
            CREATE TABLE IF NOT EXISTS sequence_counters (
                prefix TEXT PRIMARY KEY,
                last_value BIGINT NOT NULL DEFAULT 0 CHECK (last_value >= 0),
                created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            );

            CREATE TABLE IF NOT EXISTS generic_instances (
                euid TEXT PRIMARY KEY,
                template_prefix TEXT NOT NULL,
                template_version INTEGER NOT NULL,
                category TEXT NOT NULL,
                status TEXT NOT NULL,
                version BIGINT NOT NULL,
                data JSONB NOT NULL,
                created_at TIMESTAMPTZ NOT NULL,
                updated_at TIMESTAMPTZ NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_generic_instances_prefix_status
                ON generic_instances(template_prefix, status);

            CREATE TABLE IF NOT EXISTS lineage_edges (
                seq BIGSERIAL UNIQUE,
                id UUID PRIMARY KEY,
                parent_euid TEXT NOT NULL REFERENCES generic_instances(euid),
                child_euid TEXT NOT NULL REFERENCES generic_instances(euid),
                relationship_type TEXT NOT NULL,
                status TEXT NOT NULL,
                data JSONB NOT NULL,
                created_at TIMESTAMPTZ NOT NULL,
                CHECK (parent_euid <> child_euid)
            );

            CREATE INDEX IF NOT EXISTS idx_lineage_edges_parent ON lineage_edges(parent_euid);
            CREATE INDEX IF NOT EXISTS idx_lineage_edges_child ON lineage_edges(child_euid);

            CREATE TABLE IF NOT EXISTS audit_events (
                seq BIGSERIAL UNIQUE,
                id UUID PRIMARY KEY,
                euid TEXT NOT NULL,
                action TEXT NOT NULL,
                data JSONB NOT NULL,
                at TIMESTAMPTZ NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_audit_events_euid ON audit_events(euid);
            "#,
        ),
        (
            "20240502000000_active_edge_uniqueness",
            r#"
            -- At most one active edge per (parent, child, relationship type)
            CREATE UNIQUE INDEX IF NOT EXISTS idx_lineage_edges_active_link
                ON lineage_edges(parent_euid, child_euid, relationship_type)
                WHERE status = 'active';
            "#,
        ),
        (
            "20240503000000_counter_tombstones",
            r#"
            -- Retired counters keep their row so a re-registered prefix resumes
            ALTER TABLE sequence_counters ADD COLUMN IF NOT EXISTS retired_at TIMESTAMPTZ;
            "#,
        ),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_migrations_are_ordered_and_create_every_table() {
        let migrations = generate_migrations();
        let names: Vec<_> = migrations.iter().map(|(name, _)| *name).collect();
        let mut sorted = names.clone();
        sorted.sort();
        assert_eq!(names, sorted);

        let all_sql: String = migrations.iter().map(|(_, sql)| *sql).collect();
        for table in ["sequence_counters", "generic_instances", "lineage_edges", "audit_events"] {
            assert!(all_sql.contains(&format!("CREATE TABLE IF NOT EXISTS {}", table)), "{}", table);
        }
        assert!(all_sql.contains("ADD COLUMN IF NOT EXISTS retired_at"));
    }
}
