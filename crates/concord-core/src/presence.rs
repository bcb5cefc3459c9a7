//! Live presence roster per opportunity.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use tokio::sync::{broadcast, watch, Mutex};

use crate::channel::{ChannelEvent, ChannelHub};
use crate::error::{Error, Result};
use crate::models::{ActivityState, PresenceEntry, PresenceUpdate};
use crate::util::now_millis;

struct ScopeRoster {
    entries: BTreeMap<String, PresenceEntry>,
    snapshot: watch::Sender<Vec<PresenceEntry>>,
}

impl ScopeRoster {
    fn new() -> Self {
        Self {
            entries: BTreeMap::new(),
            snapshot: watch::channel(Vec::new()).0,
        }
    }

    fn entries(&self) -> Vec<PresenceEntry> {
        self.entries.values().cloned().collect()
    }

    fn publish_snapshot(&self) -> Vec<PresenceEntry> {
        let entries = self.entries();
        self.snapshot.send_replace(entries.clone());
        entries
    }
}

/// Membership of one user in one scope. Dropping it without `leave` keeps the
/// roster entry; crashed clients are not detected here.
pub struct PresenceHandle {
    scope: String,
    user_id: String,
    events: broadcast::Receiver<ChannelEvent>,
    roster: watch::Receiver<Vec<PresenceEntry>>,
}

impl PresenceHandle {
    pub fn scope(&self) -> &str {
        &self.scope
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    /// Next channel event, skipping over anything lost to lag.
    pub async fn recv(&mut self) -> Option<ChannelEvent> {
        loop {
            match self.events.recv().await {
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(scope = %self.scope, user_id = %self.user_id, skipped, "Presence subscriber lagged");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

/// Tracks who is connected to each opportunity and what they are doing.
#[derive(Clone)]
pub struct PresenceTracker {
    hub: ChannelHub,
    rosters: Arc<Mutex<HashMap<String, ScopeRoster>>>,
}

impl PresenceTracker {
    pub fn new(hub: ChannelHub) -> Self {
        Self {
            hub,
            rosters: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Join a scope as a viewer with no section selected.
    pub async fn join(
        &self,
        scope: &str,
        user_id: &str,
        display_name: &str,
        avatar_ref: Option<String>,
    ) -> PresenceHandle {
        let channel = self.hub.channel(scope).await;
        let events = channel.subscribe();

        let entry = PresenceEntry {
            user_id: user_id.to_string(),
            display_name: display_name.to_string(),
            avatar_ref,
            current_section_id: None,
            activity_state: ActivityState::Viewing,
            last_seen_at: now_millis(),
        };

        let mut rosters = self.rosters.lock().await;
        let roster = rosters
            .entry(scope.to_string())
            .or_insert_with(ScopeRoster::new);
        roster.entries.insert(user_id.to_string(), entry.clone());
        let entries = roster.publish_snapshot();
        let roster_rx = roster.snapshot.subscribe();
        drop(rosters);

        tracing::info!(scope, user_id, "Presence joined");
        channel.send(ChannelEvent::PresenceJoin { entry });
        channel.send(ChannelEvent::PresenceSync { entries });

        PresenceHandle {
            scope: scope.to_string(),
            user_id: user_id.to_string(),
            events,
            roster: roster_rx,
        }
    }

    /// Merge a partial change into the caller's own entry and republish it whole.
    pub async fn update(
        &self,
        handle: &PresenceHandle,
        update: PresenceUpdate,
    ) -> Result<PresenceEntry> {
        let mut rosters = self.rosters.lock().await;
        let roster = rosters
            .get_mut(&handle.scope)
            .ok_or_else(|| Error::not_found(format!("presence scope {}", handle.scope)))?;
        let entry = roster.entries.get_mut(&handle.user_id).ok_or_else(|| {
            Error::not_found(format!(
                "presence entry for {} in {}",
                handle.user_id, handle.scope
            ))
        })?;
        entry.merge(update, now_millis());
        let entry = entry.clone();
        let entries = roster.publish_snapshot();
        drop(rosters);

        let channel = self.hub.channel(&handle.scope).await;
        channel.send(ChannelEvent::PresenceUpdate {
            entry: entry.clone(),
        });
        channel.send(ChannelEvent::PresenceSync { entries });
        Ok(entry)
    }

    /// Remove the caller's entry and close its subscription.
    pub async fn leave(&self, handle: PresenceHandle) {
        let PresenceHandle {
            scope, user_id, ..
        } = handle;

        let mut rosters = self.rosters.lock().await;
        let Some(roster) = rosters.get_mut(&scope) else {
            return;
        };
        if roster.entries.remove(&user_id).is_none() {
            return;
        }
        let entries = roster.publish_snapshot();
        if roster.entries.is_empty() {
            rosters.remove(&scope);
        }
        drop(rosters);

        tracing::info!(scope = %scope, user_id = %user_id, "Presence left");
        let channel = self.hub.channel(&scope).await;
        channel.send(ChannelEvent::PresenceLeave { user_id });
        channel.send(ChannelEvent::PresenceSync { entries });
    }

    /// Last roster snapshot seen by this handle. No round trip.
    pub fn list_active(handle: &PresenceHandle) -> Vec<PresenceEntry> {
        handle.roster.borrow().clone()
    }

    /// Current roster of a scope, for callers without a handle.
    pub async fn roster(&self, scope: &str) -> Vec<PresenceEntry> {
        self.rosters
            .lock()
            .await
            .get(scope)
            .map(ScopeRoster::entries)
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn tracker() -> PresenceTracker {
        PresenceTracker::new(ChannelHub::new(64))
    }

    async fn next_named(handle: &mut PresenceHandle, name: &str) -> ChannelEvent {
        loop {
            let event = handle.recv().await.unwrap();
            if event.name() == name {
                return event;
            }
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn join_publishes_viewing_entry() {
        let tracker = tracker();
        let alice = tracker.join("opp-1", "u-1", "Alice", None).await;

        let active = PresenceTracker::list_active(&alice);
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].user_id, "u-1");
        assert_eq!(active[0].activity_state, ActivityState::Viewing);
        assert_eq!(active[0].current_section_id, None);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn update_republishes_full_entry() {
        let tracker = tracker();
        let alice = tracker.join("opp-1", "u-1", "Alice", Some("a.png".to_string())).await;
        let mut bob = tracker.join("opp-1", "u-2", "Bob", None).await;

        let updated = tracker
            .update(
                &alice,
                PresenceUpdate {
                    section_id: Some(Some("sec-3".to_string())),
                    activity_state: Some(ActivityState::Editing),
                },
            )
            .await
            .unwrap();
        assert_eq!(updated.avatar_ref.as_deref(), Some("a.png"));

        let ChannelEvent::PresenceUpdate { entry } = next_named(&mut bob, "presence_update").await
        else {
            panic!("expected presence_update");
        };
        assert_eq!(entry, updated);
        assert_eq!(entry.display_name, "Alice");
        assert_eq!(entry.current_section_id.as_deref(), Some("sec-3"));

        let roster = PresenceTracker::list_active(&bob);
        assert_eq!(roster.len(), 2);
        assert_eq!(roster[0].activity_state, ActivityState::Editing);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn leave_removes_entry_and_drops_empty_scope() {
        let tracker = tracker();
        let alice = tracker.join("opp-1", "u-1", "Alice", None).await;
        let mut bob = tracker.join("opp-1", "u-2", "Bob", None).await;

        tracker.leave(alice).await;
        let ChannelEvent::PresenceLeave { user_id } = next_named(&mut bob, "presence_leave").await
        else {
            panic!("expected presence_leave");
        };
        assert_eq!(user_id, "u-1");
        assert_eq!(tracker.roster("opp-1").await.len(), 1);

        tracker.leave(bob).await;
        assert!(tracker.roster("opp-1").await.is_empty());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn update_after_leave_is_not_found() {
        let tracker = tracker();
        let alice = tracker.join("opp-1", "u-1", "Alice", None).await;
        let ghost = tracker.join("opp-1", "u-1", "Alice", None).await;
        tracker.leave(alice).await;

        let err = tracker
            .update(&ghost, PresenceUpdate::default())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn scopes_are_isolated() {
        let tracker = tracker();
        let _alice = tracker.join("opp-1", "u-1", "Alice", None).await;
        let bob = tracker.join("opp-2", "u-2", "Bob", None).await;

        let roster = PresenceTracker::list_active(&bob);
        assert_eq!(roster.len(), 1);
        assert_eq!(roster[0].user_id, "u-2");
    }
}
