//! Sync conflict model

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;

use super::ConflictId;
use crate::error::{Error, Result};

/// Internal side of a conflict
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InternalVersion {
    pub content: Value,
    pub updated_at: i64,
    pub updated_by: Option<String>,
}

/// External (cloud) side of a conflict
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExternalVersion {
    pub content: Value,
    pub updated_at: i64,
    /// Provider the content was pulled from
    pub source: String,
}

/// How a conflict was (or was not yet) settled
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Resolution {
    #[default]
    Pending,
    KeepInternal,
    KeepExternal,
    Merged,
}

impl Resolution {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::KeepInternal => "keep_internal",
            Self::KeepExternal => "keep_external",
            Self::Merged => "merged",
        }
    }
}

impl fmt::Display for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Resolution {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "keep_internal" => Ok(Self::KeepInternal),
            "keep_external" => Ok(Self::KeepExternal),
            "merged" => Ok(Self::Merged),
            other => Err(format!("unknown resolution '{other}'")),
        }
    }
}

/// A human decision settling a conflict
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "resolution", rename_all = "snake_case")]
pub enum ConflictDecision {
    KeepInternal,
    KeepExternal,
    Merged { content: Value },
}

impl ConflictDecision {
    pub const fn resolution(&self) -> Resolution {
        match self {
            Self::KeepInternal => Resolution::KeepInternal,
            Self::KeepExternal => Resolution::KeepExternal,
            Self::Merged { .. } => Resolution::Merged,
        }
    }
}

/// Divergent edits detected by a pull
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncConflict {
    pub id: ConflictId,
    pub document_id: String,
    pub section_id: Option<String>,
    pub organization_id: String,
    pub internal_version: InternalVersion,
    pub external_version: ExternalVersion,
    pub resolution: Resolution,
    pub merged_content: Option<Value>,
    pub resolved_by: Option<String>,
    /// Resolution timestamp (Unix ms)
    pub resolved_at: Option<i64>,
    /// Detection timestamp (Unix ms)
    pub created_at: i64,
}

impl SyncConflict {
    pub fn new(
        document_id: impl Into<String>,
        organization_id: impl Into<String>,
        internal_version: InternalVersion,
        external_version: ExternalVersion,
        now: i64,
    ) -> Self {
        Self {
            id: ConflictId::new(),
            document_id: document_id.into(),
            section_id: None,
            organization_id: organization_id.into(),
            internal_version,
            external_version,
            resolution: Resolution::Pending,
            merged_content: None,
            resolved_by: None,
            resolved_at: None,
            created_at: now,
        }
    }

    pub fn is_pending(&self) -> bool {
        self.resolution == Resolution::Pending
    }

    /// Content the winning side carries after `decision`.
    pub fn chosen_content<'a>(&'a self, decision: &'a ConflictDecision) -> &'a Value {
        match decision {
            ConflictDecision::KeepInternal => &self.internal_version.content,
            ConflictDecision::KeepExternal => &self.external_version.content,
            ConflictDecision::Merged { content } => content,
        }
    }

    /// pending -> resolved. Resolution happens exactly once.
    pub fn resolve(&mut self, decision: &ConflictDecision, resolver: &str, now: i64) -> Result<()> {
        if !self.is_pending() {
            return Err(Error::validation(format!(
                "conflict {} was already resolved as {}",
                self.id, self.resolution
            )));
        }
        if let ConflictDecision::Merged { content } = decision {
            self.merged_content = Some(content.clone());
        }
        self.resolution = decision.resolution();
        self.resolved_by = Some(resolver.to_string());
        self.resolved_at = Some(now);
        Ok(())
    }
}
