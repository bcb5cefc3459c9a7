//! Coordination log and audit trail repositories (append-only)

#![allow(clippy::cast_possible_wrap)] // SQLite uses i64 for LIMIT

use crate::error::Result;
use crate::models::{AuditEntry, CoordinationLogEntry, RuleId};
use rusqlite::{params, Connection};

use super::columns::{json_column, parse_column, to_json};

const LOG_COLUMNS: &str = "l.id, l.rule_id, l.trigger_document_id, l.affected_documents,
    l.changes_applied, l.failed_documents, l.status, l.error_message, l.executed_by, l.executed_at";

/// Trait for the coordination log
pub trait CoordinationLogRepository {
    /// Append one execution record
    fn append(&self, entry: &CoordinationLogEntry) -> Result<()>;

    /// Entries for a rule, newest first
    fn list_for_rule(&self, rule_id: &RuleId, limit: usize) -> Result<Vec<CoordinationLogEntry>>;

    /// Entries for every rule of an organization, newest first
    fn list_for_organization(
        &self,
        organization_id: &str,
        limit: usize,
    ) -> Result<Vec<CoordinationLogEntry>>;
}

/// Trait for the audit trail
pub trait AuditRepository {
    /// Append one audit record
    fn append(&self, entry: &AuditEntry) -> Result<()>;

    /// Records about one entity, oldest first
    fn list_for_entity(&self, entity_type: &str, entity_id: &str) -> Result<Vec<AuditEntry>>;
}

/// `SQLite` implementation of `CoordinationLogRepository`
pub struct SqliteCoordinationLogRepository<'a> {
    conn: &'a Connection,
}

impl<'a> SqliteCoordinationLogRepository<'a> {
    /// Create a new repository with the given connection
    pub const fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    fn parse_entry(row: &rusqlite::Row<'_>) -> rusqlite::Result<CoordinationLogEntry> {
        Ok(CoordinationLogEntry {
            id: parse_column(row, 0)?,
            rule_id: parse_column(row, 1)?,
            trigger_document_id: row.get(2)?,
            affected_documents: json_column(row, 3)?,
            changes_applied: json_column(row, 4)?,
            failed_documents: json_column(row, 5)?,
            status: parse_column(row, 6)?,
            error_message: row.get(7)?,
            executed_by: row.get(8)?,
            executed_at: row.get(9)?,
        })
    }
}

impl CoordinationLogRepository for SqliteCoordinationLogRepository<'_> {
    fn append(&self, entry: &CoordinationLogEntry) -> Result<()> {
        self.conn.execute(
            "INSERT INTO coordination_log (
                id, rule_id, trigger_document_id, affected_documents, changes_applied,
                failed_documents, status, error_message, executed_by, executed_at
             ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            params![
                entry.id.as_str(),
                entry.rule_id.as_str(),
                entry.trigger_document_id,
                to_json(&entry.affected_documents)?,
                to_json(&entry.changes_applied)?,
                to_json(&entry.failed_documents)?,
                entry.status.as_str(),
                entry.error_message,
                entry.executed_by,
                entry.executed_at,
            ],
        )?;
        Ok(())
    }

    fn list_for_rule(&self, rule_id: &RuleId, limit: usize) -> Result<Vec<CoordinationLogEntry>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {LOG_COLUMNS} FROM coordination_log l
             WHERE l.rule_id = ?
             ORDER BY l.executed_at DESC, l.id DESC
             LIMIT ?"
        ))?;

        let entries = stmt
            .query_map(params![rule_id.as_str(), limit as i64], Self::parse_entry)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(entries)
    }

    fn list_for_organization(
        &self,
        organization_id: &str,
        limit: usize,
    ) -> Result<Vec<CoordinationLogEntry>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {LOG_COLUMNS} FROM coordination_log l
             JOIN coordination_rules r ON r.id = l.rule_id
             WHERE r.organization_id = ?
             ORDER BY l.executed_at DESC, l.id DESC
             LIMIT ?"
        ))?;

        let entries = stmt
            .query_map(params![organization_id, limit as i64], Self::parse_entry)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(entries)
    }
}

/// `SQLite` implementation of `AuditRepository`
pub struct SqliteAuditRepository<'a> {
    conn: &'a Connection,
}

impl<'a> SqliteAuditRepository<'a> {
    /// Create a new repository with the given connection
    pub const fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }
}

impl AuditRepository for SqliteAuditRepository<'_> {
    fn append(&self, entry: &AuditEntry) -> Result<()> {
        self.conn.execute(
            "INSERT INTO audit_log (id, action, entity_type, entity_id, actor_id, details, timestamp)
             VALUES (?, ?, ?, ?, ?, ?, ?)",
            params![
                entry.id.as_str(),
                entry.action,
                entry.entity_type,
                entry.entity_id,
                entry.actor_id,
                to_json(&entry.details)?,
                entry.timestamp,
            ],
        )?;
        Ok(())
    }

    fn list_for_entity(&self, entity_type: &str, entity_id: &str) -> Result<Vec<AuditEntry>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, action, entity_type, entity_id, actor_id, details, timestamp
             FROM audit_log
             WHERE entity_type = ? AND entity_id = ?
             ORDER BY timestamp ASC, id ASC",
        )?;

        let entries = stmt
            .query_map(params![entity_type, entity_id], |row| {
                Ok(AuditEntry {
                    id: parse_column(row, 0)?,
                    action: row.get(1)?,
                    entity_type: row.get(2)?,
                    entity_id: row.get(3)?,
                    actor_id: row.get(4)?,
                    details: json_column(row, 5)?,
                    timestamp: row.get(6)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(entries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{Database, RuleRepository, SqliteRuleRepository};
    use crate::models::{AppliedChange, CascadeStatus, LogEntryId, NewRule};
    use serde_json::json;

    fn setup_with_rule() -> (Database, RuleId) {
        let db = Database::open_in_memory().unwrap();
        let rule = NewRule {
            organization_id: "org-1".to_string(),
            source_doc_type: "pricing_volume".to_string(),
            source_field_path: "line_items".to_string(),
            target_doc_type: "cover_letter".to_string(),
            target_field_path: "total_price".to_string(),
            transform_type: "aggregate".to_string(),
            description: None,
        }
        .into_rule(1)
        .unwrap();
        SqliteRuleRepository::new(db.connection())
            .insert(&rule)
            .unwrap();
        (db, rule.id)
    }

    fn entry(rule_id: RuleId, executed_at: i64, status: CascadeStatus) -> CoordinationLogEntry {
        CoordinationLogEntry {
            id: LogEntryId::new(),
            rule_id,
            trigger_document_id: "pricing-1".to_string(),
            affected_documents: vec!["cover-1".to_string(), "cover-2".to_string()],
            changes_applied: vec![AppliedChange {
                document_id: "cover-1".to_string(),
                field_path: "total_price".to_string(),
                old_value: None,
                new_value: json!(1500),
            }],
            failed_documents: if status == CascadeStatus::Failed {
                vec!["cover-2".to_string()]
            } else {
                Vec::new()
            },
            status,
            error_message: None,
            executed_by: "u-1".to_string(),
            executed_at,
        }
    }

    #[test]
    fn test_append_and_list_for_rule() {
        let (db, rule_id) = setup_with_rule();
        let repo = SqliteCoordinationLogRepository::new(db.connection());

        let first = entry(rule_id, 10, CascadeStatus::Applied);
        let second = entry(rule_id, 20, CascadeStatus::Failed);
        repo.append(&first).unwrap();
        repo.append(&second).unwrap();

        let entries = repo.list_for_rule(&rule_id, 10).unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0], second);
        assert!(entries[0].is_partial_failure());
        assert_eq!(entries[1], first);
    }

    #[test]
    fn test_list_for_organization_joins_rules() {
        let (db, rule_id) = setup_with_rule();
        let repo = SqliteCoordinationLogRepository::new(db.connection());
        repo.append(&entry(rule_id, 10, CascadeStatus::Applied))
            .unwrap();

        assert_eq!(repo.list_for_organization("org-1", 10).unwrap().len(), 1);
        assert!(repo.list_for_organization("org-2", 10).unwrap().is_empty());
    }

    #[test]
    fn test_log_is_append_only() {
        let (db, rule_id) = setup_with_rule();
        let repo = SqliteCoordinationLogRepository::new(db.connection());
        repo.append(&entry(rule_id, 10, CascadeStatus::Applied))
            .unwrap();

        let result = db
            .connection()
            .execute("DELETE FROM coordination_log", []);
        assert!(result.is_err());
    }

    #[test]
    fn test_audit_append_and_list() {
        let db = Database::open_in_memory().unwrap();
        let repo = SqliteAuditRepository::new(db.connection());

        let entry = AuditEntry::new(
            "rule.updated",
            "coordination_rule",
            "r-1",
            "u-1",
            json!({"changed_fields": ["transform_type"]}),
        );
        repo.append(&entry).unwrap();

        let entries = repo.list_for_entity("coordination_rule", "r-1").unwrap();
        assert_eq!(entries, vec![entry]);
    }
}
