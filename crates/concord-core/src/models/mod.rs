//! Data models for Concord

mod actor;
mod audit;
mod cascade;
mod document;
mod ids;
mod lock;
mod presence;
mod rule;
mod sync_conflict;
mod sync_state;

pub use actor::{Actor, Permission, Role};
pub use audit::AuditEntry;
pub use cascade::{AppliedChange, CascadePreviewItem, CascadeStatus, CoordinationLogEntry};
pub use document::{get_path, set_path, ArtifactStatus, DocumentRecord, SyncHealth};
pub use ids::{AuditEntryId, ConflictId, LogEntryId, RuleId};
pub use lock::{LockAttempt, LockStatus, SectionLock};
pub use presence::{ActivityState, PresenceEntry, PresenceUpdate};
pub use rule::{normalize_field_path, CoordinationRule, DocType, NewRule, RuleUpdate, TransformType};
pub use sync_conflict::{
    ConflictDecision, ExternalVersion, InternalVersion, Resolution, SyncConflict,
};
pub use sync_state::{DocumentSyncState, PullDecision, SyncStatus};
