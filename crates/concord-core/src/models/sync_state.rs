//! Per-document sync state and its transitions
//!
//! ```text
//! idle --link--> syncing --pull ok--> synced --push/pull--> syncing
//!                   |                   |
//!                   |                   +--divergent pull--> conflict --resolve--> synced
//!                   +--adapter failure--> error --next cycle--> syncing
//! ```

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::fmt;
use std::str::FromStr;

use crate::error::{Error, Result};

/// Sync status of a document relative to its external copy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SyncStatus {
    /// Never linked, or link removed
    #[default]
    Idle,
    /// Push or pull in flight
    Syncing,
    /// Both sides consistent as of `last_sync_at`
    Synced,
    /// Both sides edited since the last sync; waiting for a human
    Conflict,
    /// Last adapter call failed; retried on the next cycle
    Error,
}

impl SyncStatus {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Syncing => "syncing",
            Self::Synced => "synced",
            Self::Conflict => "conflict",
            Self::Error => "error",
        }
    }

    /// Counted as healthy by the sync-health rollup.
    pub const fn is_healthy(self) -> bool {
        matches!(self, Self::Idle | Self::Synced)
    }
}

impl fmt::Display for SyncStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SyncStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "idle" => Ok(Self::Idle),
            "syncing" => Ok(Self::Syncing),
            "synced" => Ok(Self::Synced),
            "conflict" => Ok(Self::Conflict),
            "error" => Ok(Self::Error),
            other => Err(format!("unknown sync status '{other}'")),
        }
    }
}

/// What a pull should do, given the external modified time it observed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PullDecision {
    /// External side changed and internal side did not: take the external content
    Apply,
    /// Both sides changed since the last sync
    Conflict,
    /// External side unchanged
    Unchanged { internal_dirty: bool },
}

/// Sync bookkeeping for one document
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentSyncState {
    pub document_id: String,
    pub organization_id: String,
    pub cloud_provider: Option<String>,
    pub cloud_file_id: Option<String>,
    pub sync_status: SyncStatus,
    pub last_sync_at: Option<i64>,
    pub last_cloud_edit_at: Option<i64>,
    pub last_mp_edit_at: Option<i64>,
    pub cloud_web_url: Option<String>,
    pub metadata: Value,
}

impl DocumentSyncState {
    /// Default row for a document that has never been linked
    pub fn idle(document_id: impl Into<String>, organization_id: impl Into<String>) -> Self {
        Self {
            document_id: document_id.into(),
            organization_id: organization_id.into(),
            cloud_provider: None,
            cloud_file_id: None,
            sync_status: SyncStatus::Idle,
            last_sync_at: None,
            last_cloud_edit_at: None,
            last_mp_edit_at: None,
            cloud_web_url: None,
            metadata: json!({}),
        }
    }

    pub const fn is_linked(&self) -> bool {
        self.cloud_provider.is_some() && self.cloud_file_id.is_some()
    }

    /// Internal edits exist that the external copy has not seen yet.
    pub fn needs_push(&self) -> bool {
        self.is_linked() && self.internal_dirty()
    }

    fn internal_dirty(&self) -> bool {
        match (self.last_mp_edit_at, self.last_sync_at) {
            (Some(edited), Some(synced)) => edited > synced,
            (Some(_), None) => true,
            (None, _) => false,
        }
    }

    /// Provider and file id, or a validation error for unlinked documents.
    pub fn link_target(&self) -> Result<(&str, &str)> {
        match (self.cloud_provider.as_deref(), self.cloud_file_id.as_deref()) {
            (Some(provider), Some(file_id)) => Ok((provider, file_id)),
            _ => Err(Error::validation(format!(
                "document {} is not linked to a cloud file",
                self.document_id
            ))),
        }
    }

    /// idle (or previously linked) -> syncing
    pub fn link(&mut self, provider: &str, file_id: &str, web_url: Option<String>) -> Result<()> {
        if self.sync_status == SyncStatus::Conflict {
            return Err(Error::validation(format!(
                "document {} has an unresolved conflict",
                self.document_id
            )));
        }
        self.cloud_provider = Some(provider.to_string());
        self.cloud_file_id = Some(file_id.to_string());
        self.cloud_web_url = web_url;
        self.sync_status = SyncStatus::Syncing;
        self.last_sync_at = None;
        self.last_cloud_edit_at = None;
        self.clear_error();
        Ok(())
    }

    /// Any state -> idle, forgetting the external link.
    pub fn unlink(&mut self) {
        self.cloud_provider = None;
        self.cloud_file_id = None;
        self.cloud_web_url = None;
        self.sync_status = SyncStatus::Idle;
        self.last_sync_at = None;
        self.last_cloud_edit_at = None;
        self.clear_error();
    }

    /// Never moves the stamp backwards; a later edit already recorded wins.
    pub fn mark_internal_edit(&mut self, edited_at: i64) {
        self.last_mp_edit_at = Some(
            self.last_mp_edit_at
                .map_or(edited_at, |seen| seen.max(edited_at)),
        );
    }

    /// Enter `syncing` before an adapter call. Conflicted documents must be resolved first.
    pub fn begin_sync(&mut self) -> Result<()> {
        self.link_target()?;
        if self.sync_status == SyncStatus::Conflict {
            return Err(Error::validation(format!(
                "document {} has an unresolved conflict",
                self.document_id
            )));
        }
        self.sync_status = SyncStatus::Syncing;
        Ok(())
    }

    pub fn push_succeeded(&mut self, now: i64) {
        self.sync_status = SyncStatus::Synced;
        self.last_sync_at = Some(now);
        self.clear_error();
    }

    /// Compare the observed external modified time with the last sync point.
    pub fn evaluate_pull(&self, external_modified_at: i64) -> PullDecision {
        let baseline = self.last_cloud_edit_at.or(self.last_sync_at);
        let external_newer = baseline.map_or(true, |seen| external_modified_at > seen);
        let internal_dirty = self.internal_dirty();

        match (external_newer, internal_dirty) {
            (true, true) => PullDecision::Conflict,
            (true, false) => PullDecision::Apply,
            (false, internal_dirty) => PullDecision::Unchanged { internal_dirty },
        }
    }

    pub fn pull_applied(&mut self, external_modified_at: i64, now: i64) {
        self.sync_status = SyncStatus::Synced;
        self.last_cloud_edit_at = Some(external_modified_at);
        self.last_sync_at = Some(now);
        self.clear_error();
    }

    /// A pull found nothing new. A dirty internal side keeps its old sync point
    /// so the pending push is still detected.
    pub fn pull_unchanged(&mut self, internal_dirty: bool, now: i64) {
        self.sync_status = SyncStatus::Synced;
        if !internal_dirty {
            self.last_sync_at = Some(now);
        }
        self.clear_error();
    }

    pub const fn enter_conflict(&mut self) {
        self.sync_status = SyncStatus::Conflict;
    }

    /// conflict -> synced after the chosen content was written to the losing side.
    ///
    /// `cloud_edit_at` is the provider's modified time of the copy both sides
    /// now agree on. Internal edits stamped after `synced_at` stay pending.
    pub fn conflict_resolved(&mut self, synced_at: i64, cloud_edit_at: i64) {
        self.sync_status = SyncStatus::Synced;
        self.last_sync_at = Some(synced_at);
        self.last_cloud_edit_at = Some(cloud_edit_at);
        self.clear_error();
    }

    pub fn fail(&mut self, message: &str, now: i64) {
        self.sync_status = SyncStatus::Error;
        self.update_metadata(|metadata| {
            metadata.insert("last_error".to_string(), Value::String(message.to_string()));
            metadata.insert("last_error_at".to_string(), Value::from(now));
        });
    }

    pub fn last_error(&self) -> Option<&str> {
        self.metadata.get("last_error").and_then(Value::as_str)
    }

    fn clear_error(&mut self) {
        self.update_metadata(|metadata| {
            metadata.remove("last_error");
            metadata.remove("last_error_at");
        });
    }

    fn update_metadata(&mut self, apply: impl FnOnce(&mut Map<String, Value>)) {
        if !self.metadata.is_object() {
            self.metadata = Value::Object(Map::new());
        }
        if let Value::Object(metadata) = &mut self.metadata {
            apply(metadata);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MIN: i64 = 60_000;

    fn synced_at(t: i64) -> DocumentSyncState {
        let mut state = DocumentSyncState::idle("doc-1", "org-1");
        state.link("drive", "file-1", None).unwrap();
        state.pull_applied(t - MIN, t);
        state
    }

    #[test]
    fn link_moves_idle_to_syncing() {
        let mut state = DocumentSyncState::idle("doc-1", "org-1");
        state.link("drive", "file-1", None).unwrap();
        assert_eq!(state.sync_status, SyncStatus::Syncing);
        assert!(state.is_linked());
    }

    #[test]
    fn first_pull_on_fresh_link_applies() {
        let mut state = DocumentSyncState::idle("doc-1", "org-1");
        state.link("drive", "file-1", None).unwrap();
        assert_eq!(state.evaluate_pull(1_000), PullDecision::Apply);
    }

    #[test]
    fn first_pull_with_unsynced_internal_edits_conflicts() {
        let mut state = DocumentSyncState::idle("doc-1", "org-1");
        state.mark_internal_edit(500);
        state.link("drive", "file-1", None).unwrap();
        assert_eq!(state.evaluate_pull(1_000), PullDecision::Conflict);
    }

    #[test]
    fn divergent_edits_since_last_sync_conflict() {
        let t1 = 100 * MIN;
        let mut state = synced_at(t1 - 10 * MIN);
        state.mark_internal_edit(t1 - 2 * MIN);
        assert_eq!(state.evaluate_pull(t1 - 5 * MIN), PullDecision::Conflict);
    }

    #[test]
    fn external_only_edit_applies() {
        let t1 = 100 * MIN;
        let state = synced_at(t1 - 10 * MIN);
        assert_eq!(state.evaluate_pull(t1 - 5 * MIN), PullDecision::Apply);
    }

    #[test]
    fn unchanged_pull_keeps_sync_point_when_dirty() {
        let t1 = 100 * MIN;
        let mut state = synced_at(t1 - 10 * MIN);
        state.mark_internal_edit(t1 - 2 * MIN);
        let decision = state.evaluate_pull(t1 - 11 * MIN);
        assert_eq!(
            decision,
            PullDecision::Unchanged {
                internal_dirty: true
            }
        );
        state.pull_unchanged(true, t1);
        assert_eq!(state.last_sync_at, Some(t1 - 10 * MIN));
        assert!(state.needs_push());
    }

    #[test]
    fn push_clears_dirty_flag() {
        let mut state = synced_at(10 * MIN);
        state.mark_internal_edit(11 * MIN);
        assert!(state.needs_push());
        state.push_succeeded(11 * MIN);
        assert!(!state.needs_push());
    }

    #[test]
    fn failure_records_error_and_success_clears_it() {
        let mut state = synced_at(10 * MIN);
        state.fail("token expired", 11 * MIN);
        assert_eq!(state.sync_status, SyncStatus::Error);
        assert_eq!(state.last_error(), Some("token expired"));

        state.push_succeeded(12 * MIN);
        assert_eq!(state.last_error(), None);
    }

    #[test]
    fn conflicted_document_refuses_sync_until_resolved() {
        let mut state = synced_at(10 * MIN);
        state.enter_conflict();
        assert!(state.begin_sync().is_err());
        state.conflict_resolved(20 * MIN, 15 * MIN);
        assert!(state.begin_sync().is_ok());
    }

    #[test]
    fn resolution_keeps_provider_time_as_pull_baseline() {
        let mut state = synced_at(10 * MIN);
        state.enter_conflict();
        state.conflict_resolved(20 * MIN, 12 * MIN);
        assert_eq!(state.last_cloud_edit_at, Some(12 * MIN));
        // an external save between detection and resolution is still newer
        assert_eq!(state.evaluate_pull(13 * MIN), PullDecision::Apply);
        assert_eq!(
            state.evaluate_pull(12 * MIN),
            PullDecision::Unchanged {
                internal_dirty: false
            }
        );
    }

    #[test]
    fn internal_edit_stamp_never_moves_backwards() {
        let mut state = synced_at(10 * MIN);
        state.mark_internal_edit(15 * MIN);
        state.mark_internal_edit(12 * MIN);
        assert_eq!(state.last_mp_edit_at, Some(15 * MIN));
    }

    #[test]
    fn edit_after_resolution_sync_point_stays_pending() {
        let mut state = synced_at(10 * MIN);
        state.enter_conflict();
        state.mark_internal_edit(21 * MIN);
        state.conflict_resolved(20 * MIN, 20 * MIN);
        assert!(state.needs_push());
    }

    #[test]
    fn unlink_returns_to_idle() {
        let mut state = synced_at(10 * MIN);
        state.unlink();
        assert_eq!(state.sync_status, SyncStatus::Idle);
        assert!(!state.is_linked());
        assert!(state.link_target().is_err());
    }
}
