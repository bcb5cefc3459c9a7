//! Content-store view of a document
//!
//! The engine does not own documents; it reads and writes fields through the
//! `ContentStore` seam. Field paths are dot separated keys into `fields`.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::{DocType, DocumentSyncState, SyncStatus};
use crate::error::{Error, Result};

/// A document as seen by the coordination engine
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentRecord {
    pub id: String,
    pub organization_id: String,
    pub opportunity_id: String,
    pub doc_type: DocType,
    pub title: String,
    /// JSON object of named fields
    pub fields: Value,
    /// Last update timestamp (Unix ms)
    pub updated_at: i64,
    pub updated_by: Option<String>,
}

impl DocumentRecord {
    /// Read the value at `path`, if present.
    pub fn field(&self, path: &str) -> Option<&Value> {
        get_path(&self.fields, path)
    }
}

/// Look up a dotted path in a JSON object tree.
pub fn get_path<'a>(root: &'a Value, path: &str) -> Option<&'a Value> {
    path.split('.').try_fold(root, |node, segment| node.get(segment))
}

/// Write `value` at a dotted path, creating intermediate objects.
///
/// Fails when an intermediate segment exists but is not an object.
pub fn set_path(root: &mut Value, path: &str, value: Value) -> Result<Option<Value>> {
    if !root.is_object() {
        *root = Value::Object(Map::new());
    }

    let mut segments = path.split('.').peekable();
    let mut node = root;
    while let Some(segment) = segments.next() {
        let Value::Object(map) = node else {
            return Err(Error::validation(format!(
                "field path '{path}' crosses a non-object value at '{segment}'"
            )));
        };
        if segments.peek().is_none() {
            return Ok(map.insert(segment.to_string(), value));
        }
        node = map
            .entry(segment.to_string())
            .or_insert_with(|| Value::Object(Map::new()));
    }

    Err(Error::validation("field path must not be empty"))
}

/// Sync status of one artifact for the opportunity rollup
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactStatus {
    pub document_id: String,
    pub title: String,
    pub doc_type: DocType,
    pub sync_status: SyncStatus,
    pub cloud_provider: Option<String>,
    pub cloud_web_url: Option<String>,
    pub last_sync_at: Option<i64>,
}

impl ArtifactStatus {
    pub fn from_parts(document: &DocumentRecord, state: Option<&DocumentSyncState>) -> Self {
        Self {
            document_id: document.id.clone(),
            title: document.title.clone(),
            doc_type: document.doc_type,
            sync_status: state.map_or(SyncStatus::Idle, |state| state.sync_status),
            cloud_provider: state.and_then(|state| state.cloud_provider.clone()),
            cloud_web_url: state.and_then(|state| state.cloud_web_url.clone()),
            last_sync_at: state.and_then(|state| state.last_sync_at),
        }
    }
}

/// Share of artifacts that are idle or synced
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SyncHealth {
    pub total: usize,
    pub healthy: usize,
    /// 0.0 to 100.0; an opportunity without artifacts is fully healthy
    pub percentage: f64,
}

impl SyncHealth {
    #[allow(clippy::cast_precision_loss)]
    pub fn from_statuses(statuses: &[ArtifactStatus]) -> Self {
        let total = statuses.len();
        let healthy = statuses
            .iter()
            .filter(|status| status.sync_status.is_healthy())
            .count();
        let percentage = if total == 0 {
            100.0
        } else {
            (healthy as f64 / total as f64) * 100.0
        };
        Self {
            total,
            healthy,
            percentage,
        }
    }
}
