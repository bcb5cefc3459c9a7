//! Shared database service wrapper used by the engine and the API.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::Mutex;

use crate::db::{
    AuditRepository, CoordinationLogRepository, Database, DocumentRepository, RuleRepository,
    SqliteAuditRepository, SqliteCoordinationLogRepository, SqliteDocumentRepository,
    SqliteRuleRepository, SqliteSyncRepository, SyncRepository,
};
use crate::models::{
    AuditEntry, ConflictId, CoordinationLogEntry, CoordinationRule, DocType, DocumentRecord,
    DocumentSyncState, RuleId, SyncConflict,
};
use crate::util::{now_millis, with_timeout};
use crate::Result;

use super::content::{AuditSink, ContentStore};

const DEFAULT_STORE_TIMEOUT: Duration = Duration::from_secs(5);

/// Thread-safe service for DB and repository operations.
///
/// Every call waits on the connection mutex under the store timeout, so a
/// wedged caller turns into `Error::Timeout` for everyone behind it.
#[derive(Clone)]
pub struct StoreService {
    db: Arc<Mutex<Database>>,
    db_path: Option<PathBuf>,
    timeout: Duration,
}

impl StoreService {
    /// Open a database service at the given filesystem path.
    pub fn open_path(db_path: impl Into<PathBuf>) -> Result<Self> {
        let db_path = db_path.into();
        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let db = Database::open(&db_path)?;
        tracing::info!("Opened store at {}", db_path.display());
        Ok(Self {
            db: Arc::new(Mutex::new(db)),
            db_path: Some(db_path),
            timeout: DEFAULT_STORE_TIMEOUT,
        })
    }

    /// Open an in-memory database service (primarily for tests).
    pub fn open_in_memory() -> Result<Self> {
        let db = Database::open_in_memory()?;
        Ok(Self {
            db: Arc::new(Mutex::new(db)),
            db_path: None,
            timeout: DEFAULT_STORE_TIMEOUT,
        })
    }

    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn db_path(&self) -> Option<&Path> {
        self.db_path.as_deref()
    }

    async fn run<T, F>(&self, operation: &str, work: F) -> Result<T>
    where
        F: FnOnce(&Database) -> Result<T> + Send,
        T: Send,
    {
        with_timeout(operation, self.timeout, async {
            let db = self.db.lock().await;
            work(&db)
        })
        .await
    }

    // Rules

    pub async fn insert_rule(&self, rule: &CoordinationRule) -> Result<()> {
        self.run("insert rule", |db| {
            SqliteRuleRepository::new(db.connection()).insert(rule)
        })
        .await
    }

    pub async fn update_rule(&self, rule: &CoordinationRule) -> Result<()> {
        self.run("update rule", |db| {
            SqliteRuleRepository::new(db.connection()).update(rule)
        })
        .await
    }

    pub async fn get_rule(&self, id: &RuleId) -> Result<Option<CoordinationRule>> {
        self.run("get rule", |db| SqliteRuleRepository::new(db.connection()).get(id))
            .await
    }

    pub async fn list_rules(&self, organization_id: &str) -> Result<Vec<CoordinationRule>> {
        self.run("list rules", |db| {
            SqliteRuleRepository::new(db.connection()).list_by_organization(organization_id)
        })
        .await
    }

    pub async fn list_active_rules_for_source(
        &self,
        organization_id: &str,
        doc_type: DocType,
        field_path: &str,
    ) -> Result<Vec<CoordinationRule>> {
        self.run("list rules for source", |db| {
            SqliteRuleRepository::new(db.connection()).list_active_for_source(
                organization_id,
                doc_type,
                field_path,
            )
        })
        .await
    }

    // Coordination log

    pub async fn append_log(&self, entry: &CoordinationLogEntry) -> Result<()> {
        self.run("append coordination log", |db| {
            SqliteCoordinationLogRepository::new(db.connection()).append(entry)
        })
        .await
    }

    pub async fn list_log_for_rule(
        &self,
        rule_id: &RuleId,
        limit: usize,
    ) -> Result<Vec<CoordinationLogEntry>> {
        self.run("list coordination log", |db| {
            SqliteCoordinationLogRepository::new(db.connection()).list_for_rule(rule_id, limit)
        })
        .await
    }

    pub async fn list_log_for_organization(
        &self,
        organization_id: &str,
        limit: usize,
    ) -> Result<Vec<CoordinationLogEntry>> {
        self.run("list coordination log", |db| {
            SqliteCoordinationLogRepository::new(db.connection())
                .list_for_organization(organization_id, limit)
        })
        .await
    }

    // Audit

    pub async fn list_audit(&self, entity_type: &str, entity_id: &str) -> Result<Vec<AuditEntry>> {
        self.run("list audit", |db| {
            SqliteAuditRepository::new(db.connection()).list_for_entity(entity_type, entity_id)
        })
        .await
    }

    // Sync state

    pub async fn get_sync_state(&self, document_id: &str) -> Result<Option<DocumentSyncState>> {
        self.run("get sync state", |db| {
            SqliteSyncRepository::new(db.connection()).get_state(document_id)
        })
        .await
    }

    pub async fn save_sync_state(&self, state: &DocumentSyncState) -> Result<()> {
        self.run("save sync state", |db| {
            SqliteSyncRepository::new(db.connection()).save_state(state)
        })
        .await
    }

    pub async fn list_linked_states(&self, organization_id: &str) -> Result<Vec<DocumentSyncState>> {
        self.run("list linked sync states", |db| {
            SqliteSyncRepository::new(db.connection()).list_linked_states(organization_id)
        })
        .await
    }

    pub async fn list_linked_organizations(&self) -> Result<Vec<String>> {
        self.run("list linked organizations", |db| {
            SqliteSyncRepository::new(db.connection()).list_linked_organizations()
        })
        .await
    }

    pub async fn list_states_for(&self, document_ids: &[String]) -> Result<Vec<DocumentSyncState>> {
        self.run("list sync states", |db| {
            SqliteSyncRepository::new(db.connection()).list_states_for(document_ids)
        })
        .await
    }

    pub async fn insert_conflict(&self, conflict: &SyncConflict) -> Result<()> {
        self.run("insert conflict", |db| {
            SqliteSyncRepository::new(db.connection()).insert_conflict(conflict)
        })
        .await
    }

    pub async fn save_resolution(&self, conflict: &SyncConflict) -> Result<()> {
        self.run("save conflict resolution", |db| {
            SqliteSyncRepository::new(db.connection()).save_resolution(conflict)
        })
        .await
    }

    pub async fn get_conflict(&self, id: &ConflictId) -> Result<Option<SyncConflict>> {
        self.run("get conflict", |db| {
            SqliteSyncRepository::new(db.connection()).get_conflict(id)
        })
        .await
    }

    pub async fn pending_conflict_for(&self, document_id: &str) -> Result<Option<SyncConflict>> {
        self.run("get pending conflict", |db| {
            SqliteSyncRepository::new(db.connection()).pending_conflict_for(document_id)
        })
        .await
    }

    pub async fn list_conflicts(
        &self,
        organization_id: &str,
        pending_only: bool,
        limit: usize,
    ) -> Result<Vec<SyncConflict>> {
        self.run("list conflicts", |db| {
            SqliteSyncRepository::new(db.connection()).list_conflicts(
                organization_id,
                pending_only,
                limit,
            )
        })
        .await
    }

    // Documents

    /// Insert or overwrite a document in the local content store.
    pub async fn upsert_document(&self, document: &DocumentRecord) -> Result<()> {
        self.run("upsert document", |db| {
            SqliteDocumentRepository::new(db.connection()).upsert(document)
        })
        .await
    }
}

#[async_trait]
impl ContentStore for StoreService {
    async fn get_document(&self, document_id: &str) -> Result<Option<DocumentRecord>> {
        self.run("get document", |db| {
            SqliteDocumentRepository::new(db.connection()).get(document_id)
        })
        .await
    }

    async fn list_opportunity_documents(
        &self,
        opportunity_id: &str,
    ) -> Result<Vec<DocumentRecord>> {
        self.run("list opportunity documents", |db| {
            SqliteDocumentRepository::new(db.connection()).list_by_opportunity(opportunity_id)
        })
        .await
    }

    async fn list_documents_by_type(
        &self,
        organization_id: &str,
        opportunity_id: &str,
        doc_type: DocType,
    ) -> Result<Vec<DocumentRecord>> {
        self.run("list documents by type", |db| {
            SqliteDocumentRepository::new(db.connection()).list_by_type(
                organization_id,
                opportunity_id,
                doc_type,
            )
        })
        .await
    }

    async fn write_field(
        &self,
        document_id: &str,
        field_path: &str,
        value: Value,
        updated_by: &str,
    ) -> Result<Option<Value>> {
        self.run("write document field", |db| {
            SqliteDocumentRepository::new(db.connection()).write_field(
                document_id,
                field_path,
                value,
                updated_by,
                now_millis(),
            )
        })
        .await
    }

    async fn replace_fields(
        &self,
        document_id: &str,
        fields: Value,
        updated_by: &str,
    ) -> Result<()> {
        self.run("replace document fields", |db| {
            SqliteDocumentRepository::new(db.connection()).replace_fields(
                document_id,
                &fields,
                updated_by,
                now_millis(),
            )
        })
        .await
    }
}

#[async_trait]
impl AuditSink for StoreService {
    async fn record(&self, entry: AuditEntry) -> Result<()> {
        self.run("append audit", |db| {
            SqliteAuditRepository::new(db.connection()).append(&entry)
        })
        .await
    }
}
