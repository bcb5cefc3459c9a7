//! Sync state and conflict repository implementation

#![allow(clippy::cast_possible_wrap)] // SQLite uses i64 for LIMIT

use crate::error::Result;
use crate::models::{ConflictId, DocumentSyncState, SyncConflict};
use rusqlite::{params, Connection, OptionalExtension};

use super::columns::{json_column, optional_json_column, parse_column, to_json};

const STATE_COLUMNS: &str = "document_id, organization_id, cloud_provider, cloud_file_id,
    sync_status, last_sync_at, last_cloud_edit_at, last_mp_edit_at, cloud_web_url, metadata";

const CONFLICT_COLUMNS: &str = "id, document_id, section_id, organization_id, internal_version,
    external_version, resolution, merged_content, resolved_by, resolved_at, created_at";

/// Trait for sync bookkeeping storage
pub trait SyncRepository {
    /// Sync row for a document, if one was ever written
    fn get_state(&self, document_id: &str) -> Result<Option<DocumentSyncState>>;

    /// Insert or overwrite a document's sync row. `last_mp_edit_at` only moves forward.
    fn save_state(&self, state: &DocumentSyncState) -> Result<()>;

    /// Linked rows of an organization
    fn list_linked_states(&self, organization_id: &str) -> Result<Vec<DocumentSyncState>>;

    /// Organizations with at least one linked document
    fn list_linked_organizations(&self) -> Result<Vec<String>>;

    /// Rows for a set of documents
    fn list_states_for(&self, document_ids: &[String]) -> Result<Vec<DocumentSyncState>>;

    /// Persist a newly detected conflict
    fn insert_conflict(&self, conflict: &SyncConflict) -> Result<()>;

    /// Record the resolution of a pending conflict
    fn save_resolution(&self, conflict: &SyncConflict) -> Result<()>;

    /// Get a conflict by ID
    fn get_conflict(&self, id: &ConflictId) -> Result<Option<SyncConflict>>;

    /// The unresolved conflict of a document, if any
    fn pending_conflict_for(&self, document_id: &str) -> Result<Option<SyncConflict>>;

    /// Conflicts of an organization, newest first
    fn list_conflicts(
        &self,
        organization_id: &str,
        pending_only: bool,
        limit: usize,
    ) -> Result<Vec<SyncConflict>>;
}

/// `SQLite` implementation of `SyncRepository`
pub struct SqliteSyncRepository<'a> {
    conn: &'a Connection,
}

impl<'a> SqliteSyncRepository<'a> {
    /// Create a new repository with the given connection
    pub const fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    fn parse_state(row: &rusqlite::Row<'_>) -> rusqlite::Result<DocumentSyncState> {
        Ok(DocumentSyncState {
            document_id: row.get(0)?,
            organization_id: row.get(1)?,
            cloud_provider: row.get(2)?,
            cloud_file_id: row.get(3)?,
            sync_status: parse_column(row, 4)?,
            last_sync_at: row.get(5)?,
            last_cloud_edit_at: row.get(6)?,
            last_mp_edit_at: row.get(7)?,
            cloud_web_url: row.get(8)?,
            metadata: json_column(row, 9)?,
        })
    }

    fn parse_conflict(row: &rusqlite::Row<'_>) -> rusqlite::Result<SyncConflict> {
        Ok(SyncConflict {
            id: parse_column(row, 0)?,
            document_id: row.get(1)?,
            section_id: row.get(2)?,
            organization_id: row.get(3)?,
            internal_version: json_column(row, 4)?,
            external_version: json_column(row, 5)?,
            resolution: parse_column(row, 6)?,
            merged_content: optional_json_column(row, 7)?,
            resolved_by: row.get(8)?,
            resolved_at: row.get(9)?,
            created_at: row.get(10)?,
        })
    }
}

impl SyncRepository for SqliteSyncRepository<'_> {
    fn get_state(&self, document_id: &str) -> Result<Option<DocumentSyncState>> {
        let state = self
            .conn
            .query_row(
                &format!("SELECT {STATE_COLUMNS} FROM document_sync_state WHERE document_id = ?"),
                params![document_id],
                Self::parse_state,
            )
            .optional()?;
        Ok(state)
    }

    fn save_state(&self, state: &DocumentSyncState) -> Result<()> {
        self.conn.execute(
            &format!(
                "INSERT INTO document_sync_state ({STATE_COLUMNS})
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                 ON CONFLICT(document_id) DO UPDATE SET
                    organization_id = excluded.organization_id,
                    cloud_provider = excluded.cloud_provider,
                    cloud_file_id = excluded.cloud_file_id,
                    sync_status = excluded.sync_status,
                    last_sync_at = excluded.last_sync_at,
                    last_cloud_edit_at = excluded.last_cloud_edit_at,
                    last_mp_edit_at = MAX(
                        COALESCE(excluded.last_mp_edit_at, document_sync_state.last_mp_edit_at),
                        COALESCE(document_sync_state.last_mp_edit_at, excluded.last_mp_edit_at)
                    ),
                    cloud_web_url = excluded.cloud_web_url,
                    metadata = excluded.metadata"
            ),
            params![
                state.document_id,
                state.organization_id,
                state.cloud_provider,
                state.cloud_file_id,
                state.sync_status.as_str(),
                state.last_sync_at,
                state.last_cloud_edit_at,
                state.last_mp_edit_at,
                state.cloud_web_url,
                to_json(&state.metadata)?,
            ],
        )?;
        Ok(())
    }

    fn list_linked_states(&self, organization_id: &str) -> Result<Vec<DocumentSyncState>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {STATE_COLUMNS} FROM document_sync_state
             WHERE organization_id = ? AND cloud_provider IS NOT NULL AND cloud_file_id IS NOT NULL
             ORDER BY document_id"
        ))?;

        let states = stmt
            .query_map(params![organization_id], Self::parse_state)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(states)
    }

    fn list_linked_organizations(&self) -> Result<Vec<String>> {
        let mut stmt = self.conn.prepare(
            "SELECT DISTINCT organization_id FROM document_sync_state
             WHERE cloud_provider IS NOT NULL AND cloud_file_id IS NOT NULL
             ORDER BY organization_id",
        )?;

        let organizations = stmt
            .query_map([], |row| row.get(0))?
            .collect::<rusqlite::Result<Vec<String>>>()?;
        Ok(organizations)
    }

    fn list_states_for(&self, document_ids: &[String]) -> Result<Vec<DocumentSyncState>> {
        if document_ids.is_empty() {
            return Ok(Vec::new());
        }

        let placeholders = vec!["?"; document_ids.len()].join(", ");
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {STATE_COLUMNS} FROM document_sync_state WHERE document_id IN ({placeholders})"
        ))?;

        let states = stmt
            .query_map(
                rusqlite::params_from_iter(document_ids.iter()),
                Self::parse_state,
            )?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(states)
    }

    fn insert_conflict(&self, conflict: &SyncConflict) -> Result<()> {
        self.conn.execute(
            &format!(
                "INSERT INTO sync_conflicts ({CONFLICT_COLUMNS})
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"
            ),
            params![
                conflict.id.as_str(),
                conflict.document_id,
                conflict.section_id,
                conflict.organization_id,
                to_json(&conflict.internal_version)?,
                to_json(&conflict.external_version)?,
                conflict.resolution.as_str(),
                conflict.merged_content.as_ref().map(to_json).transpose()?,
                conflict.resolved_by,
                conflict.resolved_at,
                conflict.created_at,
            ],
        )?;
        Ok(())
    }

    fn save_resolution(&self, conflict: &SyncConflict) -> Result<()> {
        let rows = self.conn.execute(
            "UPDATE sync_conflicts
             SET resolution = ?, merged_content = ?, resolved_by = ?, resolved_at = ?
             WHERE id = ? AND resolution = 'pending'",
            params![
                conflict.resolution.as_str(),
                conflict.merged_content.as_ref().map(to_json).transpose()?,
                conflict.resolved_by,
                conflict.resolved_at,
                conflict.id.as_str(),
            ],
        )?;

        if rows == 0 {
            return Err(crate::Error::validation(format!(
                "conflict {} is not pending",
                conflict.id
            )));
        }
        Ok(())
    }

    fn get_conflict(&self, id: &ConflictId) -> Result<Option<SyncConflict>> {
        let conflict = self
            .conn
            .query_row(
                &format!("SELECT {CONFLICT_COLUMNS} FROM sync_conflicts WHERE id = ?"),
                params![id.as_str()],
                Self::parse_conflict,
            )
            .optional()?;
        Ok(conflict)
    }

    fn pending_conflict_for(&self, document_id: &str) -> Result<Option<SyncConflict>> {
        let conflict = self
            .conn
            .query_row(
                &format!(
                    "SELECT {CONFLICT_COLUMNS} FROM sync_conflicts
                     WHERE document_id = ? AND resolution = 'pending'
                     ORDER BY created_at DESC
                     LIMIT 1"
                ),
                params![document_id],
                Self::parse_conflict,
            )
            .optional()?;
        Ok(conflict)
    }

    fn list_conflicts(
        &self,
        organization_id: &str,
        pending_only: bool,
        limit: usize,
    ) -> Result<Vec<SyncConflict>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {CONFLICT_COLUMNS} FROM sync_conflicts
             WHERE organization_id = ? AND (? = 0 OR resolution = 'pending')
             ORDER BY created_at DESC, id DESC
             LIMIT ?"
        ))?;

        let conflicts = stmt
            .query_map(
                params![organization_id, i32::from(pending_only), limit as i64],
                Self::parse_conflict,
            )?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(conflicts)
    }
}
