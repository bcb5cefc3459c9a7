//! Document sync between the content store and cloud editors.

mod engine;

use serde::Serialize;

use crate::models::{DocumentSyncState, SyncConflict};

pub use engine::SyncEngine;

/// What a pull did to one document
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum PullResult {
    /// External content replaced the internal fields
    Applied { state: DocumentSyncState },
    /// Nothing new on the external side
    Unchanged { state: DocumentSyncState },
    /// The external file does not exist yet; a push will create it
    Missing { state: DocumentSyncState },
    /// Both sides changed; the pending conflict waits for a human
    Conflict {
        state: DocumentSyncState,
        conflict: SyncConflict,
    },
}

impl PullResult {
    pub const fn state(&self) -> &DocumentSyncState {
        match self {
            Self::Applied { state }
            | Self::Unchanged { state }
            | Self::Missing { state }
            | Self::Conflict { state, .. } => state,
        }
    }
}

/// Counts from one scheduled sync pass over an organization
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SyncCycleReport {
    pub organization_id: String,
    pub pulled: usize,
    pub pushed: usize,
    pub unchanged: usize,
    pub conflicts: usize,
    pub skipped: usize,
    /// Document ids whose push or pull failed this pass
    pub failed: Vec<String>,
}
