//! Caller identity as resolved by the authorization collaborator

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Role a caller holds inside an organization
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Read-only participant
    #[default]
    Viewer,
    /// Can author content, rules and resolve conflicts
    Editor,
    /// Full access
    Admin,
}

impl Role {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Viewer => "viewer",
            Self::Editor => "editor",
            Self::Admin => "admin",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "viewer" => Ok(Self::Viewer),
            "editor" => Ok(Self::Editor),
            "admin" | "owner" => Ok(Self::Admin),
            other => Err(format!("unknown role '{other}'")),
        }
    }
}

/// Operations gated by the authorization collaborator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Permission {
    EditRules,
    ApplyCascade,
    ResolveConflicts,
    ManageSync,
}

impl Permission {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::EditRules => "edit_rules",
            Self::ApplyCascade => "apply_cascade",
            Self::ResolveConflicts => "resolve_conflicts",
            Self::ManageSync => "manage_sync",
        }
    }
}

/// An authenticated caller
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Actor {
    pub user_id: String,
    pub display_name: String,
    pub role: Role,
    pub organization_id: String,
}

impl Actor {
    pub fn new(
        user_id: impl Into<String>,
        display_name: impl Into<String>,
        role: Role,
        organization_id: impl Into<String>,
    ) -> Self {
        Self {
            user_id: user_id.into(),
            display_name: display_name.into(),
            role,
            organization_id: organization_id.into(),
        }
    }
}
