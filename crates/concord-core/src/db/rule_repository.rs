//! Coordination rule repository implementation

use crate::error::Result;
use crate::models::{CoordinationRule, DocType, RuleId};
use rusqlite::{params, Connection, OptionalExtension};

use super::columns::parse_column;

const RULE_COLUMNS: &str = "id, organization_id, source_doc_type, source_field_path,
    target_doc_type, target_field_path, transform_type, is_active, description,
    created_at, updated_at";

/// Trait for rule storage operations
pub trait RuleRepository {
    /// Persist a new rule
    fn insert(&self, rule: &CoordinationRule) -> Result<()>;

    /// Overwrite every mutable column of an existing rule
    fn update(&self, rule: &CoordinationRule) -> Result<()>;

    /// Get a rule by ID (active or not)
    fn get(&self, id: &RuleId) -> Result<Option<CoordinationRule>>;

    /// All rules of an organization, newest first
    fn list_by_organization(&self, organization_id: &str) -> Result<Vec<CoordinationRule>>;

    /// Active rules whose source is the given field
    fn list_active_for_source(
        &self,
        organization_id: &str,
        doc_type: DocType,
        field_path: &str,
    ) -> Result<Vec<CoordinationRule>>;
}

/// `SQLite` implementation of `RuleRepository`
pub struct SqliteRuleRepository<'a> {
    conn: &'a Connection,
}

impl<'a> SqliteRuleRepository<'a> {
    /// Create a new repository with the given connection
    pub const fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    /// Parse a rule from a database row
    fn parse_rule(row: &rusqlite::Row<'_>) -> rusqlite::Result<CoordinationRule> {
        Ok(CoordinationRule {
            id: parse_column(row, 0)?,
            organization_id: row.get(1)?,
            source_doc_type: parse_column(row, 2)?,
            source_field_path: row.get(3)?,
            target_doc_type: parse_column(row, 4)?,
            target_field_path: row.get(5)?,
            transform_type: parse_column(row, 6)?,
            is_active: row.get::<_, i32>(7)? != 0,
            description: row.get(8)?,
            created_at: row.get(9)?,
            updated_at: row.get(10)?,
        })
    }
}

impl RuleRepository for SqliteRuleRepository<'_> {
    fn insert(&self, rule: &CoordinationRule) -> Result<()> {
        self.conn.execute(
            &format!("INSERT INTO coordination_rules ({RULE_COLUMNS}) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"),
            params![
                rule.id.as_str(),
                rule.organization_id,
                rule.source_doc_type.as_str(),
                rule.source_field_path,
                rule.target_doc_type.as_str(),
                rule.target_field_path,
                rule.transform_type.as_str(),
                i32::from(rule.is_active),
                rule.description,
                rule.created_at,
                rule.updated_at,
            ],
        )?;
        Ok(())
    }

    fn update(&self, rule: &CoordinationRule) -> Result<()> {
        let rows = self.conn.execute(
            "UPDATE coordination_rules
             SET source_doc_type = ?, source_field_path = ?, target_doc_type = ?,
                 target_field_path = ?, transform_type = ?, is_active = ?,
                 description = ?, updated_at = ?
             WHERE id = ?",
            params![
                rule.source_doc_type.as_str(),
                rule.source_field_path,
                rule.target_doc_type.as_str(),
                rule.target_field_path,
                rule.transform_type.as_str(),
                i32::from(rule.is_active),
                rule.description,
                rule.updated_at,
                rule.id.as_str(),
            ],
        )?;

        if rows == 0 {
            return Err(crate::Error::not_found(format!("rule {}", rule.id)));
        }
        Ok(())
    }

    fn get(&self, id: &RuleId) -> Result<Option<CoordinationRule>> {
        let rule = self
            .conn
            .query_row(
                &format!("SELECT {RULE_COLUMNS} FROM coordination_rules WHERE id = ?"),
                params![id.as_str()],
                Self::parse_rule,
            )
            .optional()?;
        Ok(rule)
    }

    fn list_by_organization(&self, organization_id: &str) -> Result<Vec<CoordinationRule>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {RULE_COLUMNS} FROM coordination_rules
             WHERE organization_id = ?
             ORDER BY created_at DESC, id DESC"
        ))?;

        let rules = stmt
            .query_map(params![organization_id], Self::parse_rule)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rules)
    }

    fn list_active_for_source(
        &self,
        organization_id: &str,
        doc_type: DocType,
        field_path: &str,
    ) -> Result<Vec<CoordinationRule>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {RULE_COLUMNS} FROM coordination_rules
             WHERE organization_id = ? AND source_doc_type = ? AND source_field_path = ?
               AND is_active = 1
             ORDER BY created_at ASC, id ASC"
        ))?;

        let rules = stmt
            .query_map(
                params![organization_id, doc_type.as_str(), field_path],
                Self::parse_rule,
            )?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rules)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;
    use crate::models::NewRule;

    fn setup() -> Database {
        Database::open_in_memory().unwrap()
    }

    fn rule(org: &str, source_field: &str, created_at: i64) -> CoordinationRule {
        NewRule {
            organization_id: org.to_string(),
            source_doc_type: "cover_letter".to_string(),
            source_field_path: source_field.to_string(),
            target_doc_type: "technical_volume".to_string(),
            target_field_path: "header.contract_value".to_string(),
            transform_type: "format".to_string(),
            description: Some("contract value".to_string()),
        }
        .into_rule(created_at)
        .unwrap()
    }

    #[test]
    fn test_insert_and_get() {
        let db = setup();
        let repo = SqliteRuleRepository::new(db.connection());

        let rule = rule("org-1", "contract_value", 10);
        repo.insert(&rule).unwrap();

        let fetched = repo.get(&rule.id).unwrap().unwrap();
        assert_eq!(fetched, rule);
    }

    #[test]
    fn test_list_by_organization_newest_first() {
        let db = setup();
        let repo = SqliteRuleRepository::new(db.connection());

        repo.insert(&rule("org-1", "a", 10)).unwrap();
        repo.insert(&rule("org-1", "b", 20)).unwrap();
        repo.insert(&rule("org-2", "c", 30)).unwrap();

        let rules = repo.list_by_organization("org-1").unwrap();
        assert_eq!(rules.len(), 2);
        assert_eq!(rules[0].source_field_path, "b");
        assert_eq!(rules[1].source_field_path, "a");
    }

    #[test]
    fn test_list_active_for_source_skips_inactive() {
        let db = setup();
        let repo = SqliteRuleRepository::new(db.connection());

        let active = rule("org-1", "contract_value", 10);
        let mut inactive = rule("org-1", "contract_value", 11);
        inactive.is_active = false;
        repo.insert(&active).unwrap();
        repo.insert(&inactive).unwrap();

        let rules = repo
            .list_active_for_source("org-1", DocType::CoverLetter, "contract_value")
            .unwrap();
        assert_eq!(rules.len(), 1);
        assert_eq!(rules[0].id, active.id);
    }

    #[test]
    fn test_update_missing_rule_is_not_found() {
        let db = setup();
        let repo = SqliteRuleRepository::new(db.connection());

        let err = repo.update(&rule("org-1", "a", 1)).unwrap_err();
        assert!(matches!(err, crate::Error::NotFound(_)));
    }
}
