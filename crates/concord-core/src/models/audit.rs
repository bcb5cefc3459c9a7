//! Audit trail entry

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::AuditEntryId;

/// Append-only record of a mutation, as handed to the audit sink
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub id: AuditEntryId,
    pub action: String,
    pub entity_type: String,
    pub entity_id: String,
    pub actor_id: String,
    pub details: Value,
    /// Timestamp (Unix ms)
    pub timestamp: i64,
}

impl AuditEntry {
    pub fn new(
        action: impl Into<String>,
        entity_type: impl Into<String>,
        entity_id: impl Into<String>,
        actor_id: impl Into<String>,
        details: Value,
    ) -> Self {
        Self {
            id: AuditEntryId::new(),
            action: action.into(),
            entity_type: entity_type.into(),
            entity_id: entity_id.into(),
            actor_id: actor_id.into(),
            details,
            timestamp: crate::util::now_millis(),
        }
    }
}
