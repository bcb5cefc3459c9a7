//! Collaborator interfaces consumed by the engine.

use async_trait::async_trait;
use serde_json::Value;

use crate::error::Result;
use crate::models::{AuditEntry, DocType, DocumentRecord};

/// Read/write access to document fields.
#[async_trait]
pub trait ContentStore: Send + Sync {
    async fn get_document(&self, document_id: &str) -> Result<Option<DocumentRecord>>;

    async fn list_opportunity_documents(&self, opportunity_id: &str)
        -> Result<Vec<DocumentRecord>>;

    async fn list_documents_by_type(
        &self,
        organization_id: &str,
        opportunity_id: &str,
        doc_type: DocType,
    ) -> Result<Vec<DocumentRecord>>;

    /// Write one field and return its previous value.
    async fn write_field(
        &self,
        document_id: &str,
        field_path: &str,
        value: Value,
        updated_by: &str,
    ) -> Result<Option<Value>>;

    async fn replace_fields(&self, document_id: &str, fields: Value, updated_by: &str)
        -> Result<()>;
}

/// Append-only record of who changed what.
#[async_trait]
pub trait AuditSink: Send + Sync {
    async fn record(&self, entry: AuditEntry) -> Result<()>;
}
