//! Database layer for Concord

mod columns;
mod connection;
mod document_repository;
mod log_repository;
mod migrations;
mod rule_repository;
mod sync_repository;

pub use connection::Database;
pub use document_repository::{DocumentRepository, SqliteDocumentRepository};
pub use log_repository::{
    AuditRepository, CoordinationLogRepository, SqliteAuditRepository,
    SqliteCoordinationLogRepository,
};
pub use rule_repository::{RuleRepository, SqliteRuleRepository};
pub use sync_repository::{SqliteSyncRepository, SyncRepository};
