//! Presence roster entry

use serde::{Deserialize, Serialize};

/// What a connected user is doing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ActivityState {
    #[default]
    Viewing,
    Editing,
}

/// One connected user. Lives only while the user's channel membership is open.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PresenceEntry {
    pub user_id: String,
    pub display_name: String,
    pub avatar_ref: Option<String>,
    pub current_section_id: Option<String>,
    pub activity_state: ActivityState,
    /// Last publish timestamp (Unix ms)
    pub last_seen_at: i64,
}

/// Partial presence change; merged into the caller's own entry before publishing.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PresenceUpdate {
    /// `Some(None)` clears the current section
    #[serde(default, with = "double_option")]
    pub section_id: Option<Option<String>>,
    #[serde(default)]
    pub activity_state: Option<ActivityState>,
}

impl PresenceEntry {
    /// Merge `update` into this entry, stamping `last_seen_at`.
    pub fn merge(&mut self, update: PresenceUpdate, now: i64) {
        if let Some(section_id) = update.section_id {
            self.current_section_id = section_id;
        }
        if let Some(activity_state) = update.activity_state {
            self.activity_state = activity_state;
        }
        self.last_seen_at = now;
    }
}

mod double_option {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S>(value: &Option<Option<String>>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match value {
            Some(inner) => inner.serialize(serializer),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Option<String>>, D::Error>
    where
        D: Deserializer<'de>,
    {
        Option::<String>::deserialize(deserializer).map(Some)
    }
}
