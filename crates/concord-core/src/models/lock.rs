//! Section lock model

use serde::{Deserialize, Serialize};

/// Exclusive, self-expiring claim on a section
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SectionLock {
    pub section_id: String,
    pub holder_user_id: String,
    pub holder_name: String,
    /// Grant timestamp (Unix ms)
    pub acquired_at: i64,
    /// Expiry timestamp (Unix ms)
    pub expires_at: i64,
}

impl SectionLock {
    pub const fn is_expired(&self, now: i64) -> bool {
        self.expires_at <= now
    }

    pub fn is_held_by(&self, user_id: &str) -> bool {
        self.holder_user_id == user_id
    }
}

/// Result of an `acquire` call. Denial is an expected outcome, not an error.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum LockAttempt {
    Acquired { lock: SectionLock },
    Denied { locked_by: String, expires_at: i64 },
}

impl LockAttempt {
    pub const fn is_acquired(&self) -> bool {
        matches!(self, Self::Acquired { .. })
    }

    pub fn locked_by(&self) -> Option<&str> {
        match self {
            Self::Acquired { .. } => None,
            Self::Denied { locked_by, .. } => Some(locked_by),
        }
    }
}

/// Answer to "is this section locked by somebody else?"
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockStatus {
    pub locked: bool,
    pub locked_by: Option<String>,
    pub expires_at: Option<i64>,
}

impl LockStatus {
    pub const fn unlocked() -> Self {
        Self {
            locked: false,
            locked_by: None,
            expires_at: None,
        }
    }
}
