//! Document (content store) repository implementation

use crate::error::{Error, Result};
use crate::models::{set_path, DocType, DocumentRecord};
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::Value;

use super::columns::{json_column, parse_column, to_json};

const DOCUMENT_COLUMNS: &str =
    "id, organization_id, opportunity_id, doc_type, title, fields, updated_at, updated_by";

/// Trait for document storage operations
pub trait DocumentRepository {
    /// Insert or overwrite a document
    fn upsert(&self, document: &DocumentRecord) -> Result<()>;

    /// Get a document by ID
    fn get(&self, id: &str) -> Result<Option<DocumentRecord>>;

    /// Every document of an opportunity, ordered by type then title
    fn list_by_opportunity(&self, opportunity_id: &str) -> Result<Vec<DocumentRecord>>;

    /// Documents of one type inside an organization's opportunity
    fn list_by_type(
        &self,
        organization_id: &str,
        opportunity_id: &str,
        doc_type: DocType,
    ) -> Result<Vec<DocumentRecord>>;

    /// Write one field, returning the previous value
    fn write_field(
        &self,
        id: &str,
        field_path: &str,
        value: Value,
        updated_by: &str,
        now: i64,
    ) -> Result<Option<Value>>;

    /// Replace the full field object
    fn replace_fields(&self, id: &str, fields: &Value, updated_by: &str, now: i64) -> Result<()>;
}

/// `SQLite` implementation of `DocumentRepository`
pub struct SqliteDocumentRepository<'a> {
    conn: &'a Connection,
}

impl<'a> SqliteDocumentRepository<'a> {
    /// Create a new repository with the given connection
    pub const fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    fn parse_document(row: &rusqlite::Row<'_>) -> rusqlite::Result<DocumentRecord> {
        Ok(DocumentRecord {
            id: row.get(0)?,
            organization_id: row.get(1)?,
            opportunity_id: row.get(2)?,
            doc_type: parse_column(row, 3)?,
            title: row.get(4)?,
            fields: json_column(row, 5)?,
            updated_at: row.get(6)?,
            updated_by: row.get(7)?,
        })
    }
}

impl DocumentRepository for SqliteDocumentRepository<'_> {
    fn upsert(&self, document: &DocumentRecord) -> Result<()> {
        self.conn.execute(
            &format!(
                "INSERT INTO documents ({DOCUMENT_COLUMNS}) VALUES (?, ?, ?, ?, ?, ?, ?, ?)
                 ON CONFLICT(id) DO UPDATE SET
                    organization_id = excluded.organization_id,
                    opportunity_id = excluded.opportunity_id,
                    doc_type = excluded.doc_type,
                    title = excluded.title,
                    fields = excluded.fields,
                    updated_at = excluded.updated_at,
                    updated_by = excluded.updated_by"
            ),
            params![
                document.id,
                document.organization_id,
                document.opportunity_id,
                document.doc_type.as_str(),
                document.title,
                to_json(&document.fields)?,
                document.updated_at,
                document.updated_by,
            ],
        )?;
        Ok(())
    }

    fn get(&self, id: &str) -> Result<Option<DocumentRecord>> {
        let document = self
            .conn
            .query_row(
                &format!("SELECT {DOCUMENT_COLUMNS} FROM documents WHERE id = ?"),
                params![id],
                Self::parse_document,
            )
            .optional()?;
        Ok(document)
    }

    fn list_by_opportunity(&self, opportunity_id: &str) -> Result<Vec<DocumentRecord>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {DOCUMENT_COLUMNS} FROM documents
             WHERE opportunity_id = ?
             ORDER BY doc_type, title, id"
        ))?;

        let documents = stmt
            .query_map(params![opportunity_id], Self::parse_document)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(documents)
    }

    fn list_by_type(
        &self,
        organization_id: &str,
        opportunity_id: &str,
        doc_type: DocType,
    ) -> Result<Vec<DocumentRecord>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {DOCUMENT_COLUMNS} FROM documents
             WHERE organization_id = ? AND opportunity_id = ? AND doc_type = ?
             ORDER BY title, id"
        ))?;

        let documents = stmt
            .query_map(
                params![organization_id, opportunity_id, doc_type.as_str()],
                Self::parse_document,
            )?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(documents)
    }

    fn write_field(
        &self,
        id: &str,
        field_path: &str,
        value: Value,
        updated_by: &str,
        now: i64,
    ) -> Result<Option<Value>> {
        let mut document = self
            .get(id)?
            .ok_or_else(|| Error::not_found(format!("document {id}")))?;
        let previous = set_path(&mut document.fields, field_path, value)?;
        self.replace_fields(id, &document.fields, updated_by, now)?;
        Ok(previous)
    }

    fn replace_fields(&self, id: &str, fields: &Value, updated_by: &str, now: i64) -> Result<()> {
        let rows = self.conn.execute(
            "UPDATE documents SET fields = ?, updated_at = ?, updated_by = ? WHERE id = ?",
            params![to_json(fields)?, now, updated_by, id],
        )?;

        if rows == 0 {
            return Err(Error::not_found(format!("document {id}")));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;
    use serde_json::json;

    fn document(id: &str, opportunity: &str, doc_type: DocType) -> DocumentRecord {
        DocumentRecord {
            id: id.to_string(),
            organization_id: "org-1".to_string(),
            opportunity_id: opportunity.to_string(),
            doc_type,
            title: format!("{doc_type} {id}"),
            fields: json!({"header": {"contract_value": "$4,500,000"}}),
            updated_at: 1,
            updated_by: None,
        }
    }

    #[test]
    fn test_upsert_and_get() {
        let db = Database::open_in_memory().unwrap();
        let repo = SqliteDocumentRepository::new(db.connection());

        let doc = document("tech-1", "opp-1", DocType::TechnicalVolume);
        repo.upsert(&doc).unwrap();
        assert_eq!(repo.get("tech-1").unwrap(), Some(doc));
        assert_eq!(repo.get("missing").unwrap(), None);
    }

    #[test]
    fn test_list_by_type_is_scoped_to_opportunity() {
        let db = Database::open_in_memory().unwrap();
        let repo = SqliteDocumentRepository::new(db.connection());

        repo.upsert(&document("tech-1", "opp-1", DocType::TechnicalVolume))
            .unwrap();
        repo.upsert(&document("tech-2", "opp-2", DocType::TechnicalVolume))
            .unwrap();
        repo.upsert(&document("cover-1", "opp-1", DocType::CoverLetter))
            .unwrap();

        let docs = repo
            .list_by_type("org-1", "opp-1", DocType::TechnicalVolume)
            .unwrap();
        assert_eq!(docs.len(), 1);
        assert_eq!(docs[0].id, "tech-1");
        assert_eq!(repo.list_by_opportunity("opp-1").unwrap().len(), 2);
    }

    #[test]
    fn test_write_field_returns_previous_value() {
        let db = Database::open_in_memory().unwrap();
        let repo = SqliteDocumentRepository::new(db.connection());
        repo.upsert(&document("tech-1", "opp-1", DocType::TechnicalVolume))
            .unwrap();

        let previous = repo
            .write_field("tech-1", "header.contract_value", json!("$5,000,000"), "u-1", 9)
            .unwrap();
        assert_eq!(previous, Some(json!("$4,500,000")));

        let doc = repo.get("tech-1").unwrap().unwrap();
        assert_eq!(doc.field("header.contract_value"), Some(&json!("$5,000,000")));
        assert_eq!(doc.updated_at, 9);
        assert_eq!(doc.updated_by.as_deref(), Some("u-1"));
    }

    #[test]
    fn test_write_field_on_missing_document_is_not_found() {
        let db = Database::open_in_memory().unwrap();
        let repo = SqliteDocumentRepository::new(db.connection());

        let err = repo
            .write_field("ghost", "a", json!(1), "u-1", 1)
            .unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }
}
