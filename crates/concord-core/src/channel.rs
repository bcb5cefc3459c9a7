//! Per-opportunity broadcast channels.
//!
//! A channel is a notification fan-out only: subscribers that are not
//! connected miss events, and nothing is persisted. Lock and presence
//! decisions are made by their owners before anything is sent here.

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, RwLock};

use crate::models::{PresenceEntry, SectionLock};

/// Event carried on an opportunity channel
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", content = "payload", rename_all = "snake_case")]
pub enum ChannelEvent {
    /// Full roster after any membership change
    PresenceSync { entries: Vec<PresenceEntry> },
    PresenceJoin { entry: PresenceEntry },
    PresenceLeave { user_id: String },
    PresenceUpdate { entry: PresenceEntry },
    LockAcquired { lock: SectionLock },
    LockReleased { section_id: String, user_id: String },
    LockExpired { section_id: String, holder_user_id: String },
}

impl ChannelEvent {
    pub const fn name(&self) -> &'static str {
        match self {
            Self::PresenceSync { .. } => "presence_sync",
            Self::PresenceJoin { .. } => "presence_join",
            Self::PresenceLeave { .. } => "presence_leave",
            Self::PresenceUpdate { .. } => "presence_update",
            Self::LockAcquired { .. } => "lock_acquired",
            Self::LockReleased { .. } => "lock_released",
            Self::LockExpired { .. } => "lock_expired",
        }
    }
}

/// Sending half of one scope's channel
#[derive(Debug, Clone)]
pub struct Channel {
    scope: String,
    sender: broadcast::Sender<ChannelEvent>,
}

impl Channel {
    pub fn scope(&self) -> &str {
        &self.scope
    }

    /// Publish an event; returns how many subscribers received it.
    pub fn send(&self, event: ChannelEvent) -> usize {
        let name = event.name();
        match self.sender.send(event) {
            Ok(receivers) => receivers,
            Err(_) => {
                tracing::debug!(scope = %self.scope, event = name, "No subscribers for channel event");
                0
            }
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ChannelEvent> {
        self.sender.subscribe()
    }
}

/// Registry of channels keyed by scope (organization and opportunity)
#[derive(Debug, Clone)]
pub struct ChannelHub {
    capacity: usize,
    channels: Arc<RwLock<HashMap<String, broadcast::Sender<ChannelEvent>>>>,
}

impl ChannelHub {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            channels: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Get or create the channel for a scope.
    pub async fn channel(&self, scope: &str) -> Channel {
        if let Some(sender) = self.channels.read().await.get(scope) {
            return Channel {
                scope: scope.to_string(),
                sender: sender.clone(),
            };
        }

        let mut channels = self.channels.write().await;
        let sender = channels
            .entry(scope.to_string())
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .clone();
        Channel {
            scope: scope.to_string(),
            sender,
        }
    }

    pub async fn subscribe(&self, scope: &str) -> broadcast::Receiver<ChannelEvent> {
        self.channel(scope).await.subscribe()
    }

    pub async fn send(&self, scope: &str, event: ChannelEvent) -> usize {
        self.channel(scope).await.send(event)
    }

    /// Drop a scope's channel if nobody is subscribed to it. Returns `false`
    /// when the scope still has subscribers.
    pub async fn evict_idle(&self, scope: &str) -> bool {
        let mut channels = self.channels.write().await;
        match channels.get(scope) {
            Some(sender) if sender.receiver_count() > 0 => false,
            Some(_) => {
                channels.remove(scope);
                true
            }
            None => true,
        }
    }

    pub async fn scopes(&self) -> Vec<String> {
        let mut scopes: Vec<String> = self.channels.read().await.keys().cloned().collect();
        scopes.sort();
        scopes
    }
}

impl Default for ChannelHub {
    fn default() -> Self {
        Self::new(256)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn lock() -> SectionLock {
        SectionLock {
            section_id: "s-1".to_string(),
            holder_user_id: "u-1".to_string(),
            holder_name: "Ada".to_string(),
            acquired_at: 1,
            expires_at: 2,
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn subscribers_of_a_scope_receive_events() {
        let hub = ChannelHub::new(16);
        let mut first = hub.subscribe("opp-1").await;
        let mut second = hub.subscribe("opp-1").await;
        let mut other = hub.subscribe("opp-2").await;

        let delivered = hub
            .send("opp-1", ChannelEvent::LockAcquired { lock: lock() })
            .await;
        assert_eq!(delivered, 2);

        assert_eq!(
            first.recv().await.unwrap(),
            ChannelEvent::LockAcquired { lock: lock() }
        );
        assert_eq!(second.recv().await.unwrap().name(), "lock_acquired");
        assert!(other.try_recv().is_err());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn send_without_subscribers_is_not_an_error() {
        let hub = ChannelHub::default();
        let delivered = hub
            .send(
                "opp-1",
                ChannelEvent::PresenceLeave {
                    user_id: "u-1".to_string(),
                },
            )
            .await;
        assert_eq!(delivered, 0);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn idle_scopes_are_evicted_and_subscribed_ones_kept() {
        let hub = ChannelHub::new(16);
        let listener = hub.subscribe("opp-1").await;
        hub.send(
            "opp-2",
            ChannelEvent::PresenceLeave {
                user_id: "u-1".to_string(),
            },
        )
        .await;
        assert_eq!(hub.scopes().await, vec!["opp-1".to_string(), "opp-2".to_string()]);

        assert!(!hub.evict_idle("opp-1").await);
        assert!(hub.evict_idle("opp-2").await);
        assert_eq!(hub.scopes().await, vec!["opp-1".to_string()]);

        drop(listener);
        assert!(hub.evict_idle("opp-1").await);
        assert!(hub.scopes().await.is_empty());
    }

    #[test]
    fn events_serialize_with_name_and_payload() {
        let event = ChannelEvent::LockReleased {
            section_id: "s-1".to_string(),
            user_id: "u-1".to_string(),
        };
        assert_eq!(
            serde_json::to_value(&event).unwrap(),
            json!({"event": "lock_released", "payload": {"section_id": "s-1", "user_id": "u-1"}})
        );
    }
}
