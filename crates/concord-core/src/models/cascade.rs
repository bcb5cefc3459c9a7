//! Cascade preview and coordination log models

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;

use super::{DocType, LogEntryId, RuleId};

/// One target a cascade would touch. Computed on demand, never stored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CascadePreviewItem {
    pub rule_id: RuleId,
    pub target_doc_type: DocType,
    pub target_field_path: String,
    pub document_id: String,
    pub document_title: String,
    pub current_value: Option<Value>,
    pub new_value: Value,
}

impl CascadePreviewItem {
    /// Whether applying this item would change the stored value.
    pub fn is_change(&self) -> bool {
        self.current_value.as_ref() != Some(&self.new_value)
    }
}

/// A single field write recorded in the coordination log
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppliedChange {
    pub document_id: String,
    pub field_path: String,
    pub old_value: Option<Value>,
    pub new_value: Value,
}

/// Outcome of one cascade execution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CascadeStatus {
    Applied,
    Failed,
}

impl CascadeStatus {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Applied => "applied",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for CascadeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CascadeStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "applied" => Ok(Self::Applied),
            "failed" => Ok(Self::Failed),
            other => Err(format!("unknown cascade status '{other}'")),
        }
    }
}

/// Append-only record of a cascade execution attempt.
///
/// `changes_applied` lists only writes that succeeded; `failed_documents`
/// lists targets whose write failed, so the end state of a partial cascade
/// can be reconstructed from this entry alone.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CoordinationLogEntry {
    pub id: LogEntryId,
    pub rule_id: RuleId,
    pub trigger_document_id: String,
    pub affected_documents: Vec<String>,
    pub changes_applied: Vec<AppliedChange>,
    pub failed_documents: Vec<String>,
    pub status: CascadeStatus,
    pub error_message: Option<String>,
    pub executed_by: String,
    /// Execution timestamp (Unix ms)
    pub executed_at: i64,
}

impl CoordinationLogEntry {
    pub fn is_partial_failure(&self) -> bool {
        self.status == CascadeStatus::Failed && !self.changes_applied.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn preview_item_detects_no_op() {
        let item = CascadePreviewItem {
            rule_id: RuleId::new(),
            target_doc_type: DocType::TechnicalVolume,
            target_field_path: "header.contract_value".to_string(),
            document_id: "doc-1".to_string(),
            document_title: "Tech".to_string(),
            current_value: Some(json!("$5,000,000")),
            new_value: json!("$5,000,000"),
        };
        assert!(!item.is_change());
    }

    #[test]
    fn cascade_status_parses() {
        assert_eq!("failed".parse::<CascadeStatus>().unwrap(), CascadeStatus::Failed);
        assert!("pending".parse::<CascadeStatus>().is_err());
    }
}
