//! Database migrations

use crate::error::Result;
use rusqlite::Connection;

/// Current schema version
const CURRENT_VERSION: i32 = 4;

/// Run all pending migrations
pub fn run(conn: &Connection) -> Result<()> {
    let version = get_version(conn)?;

    if version < 1 {
        apply(conn, 1, MIGRATION_V1)?;
    }
    if version < 2 {
        apply(conn, 2, MIGRATION_V2)?;
    }
    if version < 3 {
        apply(conn, 3, MIGRATION_V3)?;
    }
    if version < 4 {
        apply(conn, 4, MIGRATION_V4)?;
    }

    Ok(())
}

/// Get the current schema version
fn get_version(conn: &Connection) -> Result<i32> {
    let exists: bool = conn.query_row(
        "SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE type='table' AND name='schema_version')",
        [],
        |row| row.get(0),
    )?;

    if !exists {
        return Ok(0);
    }

    let version = conn.query_row(
        "SELECT COALESCE(MAX(version), 0) FROM schema_version",
        [],
        |row| row.get(0),
    )?;
    Ok(version)
}

/// Run one migration script atomically and record its version
fn apply(conn: &Connection, version: i32, script: &str) -> Result<()> {
    let tx = conn.unchecked_transaction()?;
    tx.execute_batch(script)?;
    tx.execute(
        "INSERT INTO schema_version (version) VALUES (?)",
        [version],
    )?;
    tx.commit()?;

    tracing::info!("Migrated database to version {version} (target {CURRENT_VERSION})");
    Ok(())
}

/// Version 1: rule catalog and audit trail
const MIGRATION_V1: &str = "
    CREATE TABLE IF NOT EXISTS schema_version (
        version INTEGER PRIMARY KEY
    );

    CREATE TABLE IF NOT EXISTS coordination_rules (
        id TEXT PRIMARY KEY,
        organization_id TEXT NOT NULL,
        source_doc_type TEXT NOT NULL,
        source_field_path TEXT NOT NULL,
        target_doc_type TEXT NOT NULL,
        target_field_path TEXT NOT NULL,
        transform_type TEXT NOT NULL,
        is_active INTEGER NOT NULL DEFAULT 1,
        description TEXT,
        created_at INTEGER NOT NULL,
        updated_at INTEGER NOT NULL,
        CHECK (source_doc_type <> target_doc_type OR source_field_path <> target_field_path)
    );
    CREATE INDEX IF NOT EXISTS idx_rules_org_created
        ON coordination_rules(organization_id, created_at DESC);
    CREATE INDEX IF NOT EXISTS idx_rules_source
        ON coordination_rules(organization_id, source_doc_type, source_field_path);

    CREATE TABLE IF NOT EXISTS audit_log (
        id TEXT PRIMARY KEY,
        action TEXT NOT NULL,
        entity_type TEXT NOT NULL,
        entity_id TEXT NOT NULL,
        actor_id TEXT NOT NULL,
        details TEXT NOT NULL,
        timestamp INTEGER NOT NULL
    );
    CREATE INDEX IF NOT EXISTS idx_audit_entity ON audit_log(entity_type, entity_id);
    CREATE TRIGGER IF NOT EXISTS audit_log_append_only_update BEFORE UPDATE ON audit_log
    BEGIN
        SELECT RAISE(ABORT, 'audit log is append-only');
    END;
    CREATE TRIGGER IF NOT EXISTS audit_log_append_only_delete BEFORE DELETE ON audit_log
    BEGIN
        SELECT RAISE(ABORT, 'audit log is append-only');
    END;
";

/// Version 2: coordination log
const MIGRATION_V2: &str = "
    CREATE TABLE IF NOT EXISTS coordination_log (
        id TEXT PRIMARY KEY,
        rule_id TEXT NOT NULL REFERENCES coordination_rules(id),
        trigger_document_id TEXT NOT NULL,
        affected_documents TEXT NOT NULL,
        changes_applied TEXT NOT NULL,
        failed_documents TEXT NOT NULL,
        status TEXT NOT NULL CHECK (status IN ('applied', 'failed')),
        error_message TEXT,
        executed_by TEXT NOT NULL,
        executed_at INTEGER NOT NULL
    );
    CREATE INDEX IF NOT EXISTS idx_coordination_log_rule ON coordination_log(rule_id, executed_at DESC);
    CREATE INDEX IF NOT EXISTS idx_coordination_log_trigger ON coordination_log(trigger_document_id);
    CREATE TRIGGER IF NOT EXISTS coordination_log_append_only_update BEFORE UPDATE ON coordination_log
    BEGIN
        SELECT RAISE(ABORT, 'coordination log is append-only');
    END;
    CREATE TRIGGER IF NOT EXISTS coordination_log_append_only_delete BEFORE DELETE ON coordination_log
    BEGIN
        SELECT RAISE(ABORT, 'coordination log is append-only');
    END;
";

/// Version 3: document sync state and conflicts
const MIGRATION_V3: &str = "
    CREATE TABLE IF NOT EXISTS document_sync_state (
        document_id TEXT PRIMARY KEY,
        organization_id TEXT NOT NULL,
        cloud_provider TEXT,
        cloud_file_id TEXT,
        sync_status TEXT NOT NULL DEFAULT 'idle',
        last_sync_at INTEGER,
        last_cloud_edit_at INTEGER,
        last_mp_edit_at INTEGER,
        cloud_web_url TEXT,
        metadata TEXT NOT NULL DEFAULT '{}'
    );
    CREATE INDEX IF NOT EXISTS idx_sync_state_org ON document_sync_state(organization_id, sync_status);

    CREATE TABLE IF NOT EXISTS sync_conflicts (
        id TEXT PRIMARY KEY,
        document_id TEXT NOT NULL,
        section_id TEXT,
        organization_id TEXT NOT NULL,
        internal_version TEXT NOT NULL,
        external_version TEXT NOT NULL,
        resolution TEXT NOT NULL DEFAULT 'pending',
        merged_content TEXT,
        resolved_by TEXT,
        resolved_at INTEGER,
        created_at INTEGER NOT NULL
    );
    CREATE INDEX IF NOT EXISTS idx_sync_conflicts_document ON sync_conflicts(document_id, resolution);
    CREATE INDEX IF NOT EXISTS idx_sync_conflicts_org ON sync_conflicts(organization_id, created_at DESC);
    CREATE TRIGGER IF NOT EXISTS sync_conflicts_resolved_once BEFORE UPDATE ON sync_conflicts
    FOR EACH ROW
    WHEN OLD.resolution <> 'pending'
    BEGIN
        SELECT RAISE(ABORT, 'conflict already resolved');
    END;
";

/// Version 4: local content store
const MIGRATION_V4: &str = "
    CREATE TABLE IF NOT EXISTS documents (
        id TEXT PRIMARY KEY,
        organization_id TEXT NOT NULL,
        opportunity_id TEXT NOT NULL,
        doc_type TEXT NOT NULL,
        title TEXT NOT NULL,
        fields TEXT NOT NULL DEFAULT '{}',
        updated_at INTEGER NOT NULL,
        updated_by TEXT
    );
    CREATE INDEX IF NOT EXISTS idx_documents_opportunity ON documents(opportunity_id, doc_type);
";
