//! TTL-bounded section locks.
//!
//! Each opportunity scope has one `SectionLockManager` that owns its lock map
//! behind an async mutex. Grants, releases and expiries are announced on the
//! scope's channel after the map has been updated. Nothing here touches the
//! network or the database.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;

use crate::channel::{Channel, ChannelEvent, ChannelHub};
use crate::models::{LockAttempt, LockStatus, SectionLock};
use crate::util::{duration_millis, now_millis};

/// Lock table for one opportunity
pub struct SectionLockManager {
    ttl: Duration,
    channel: Channel,
    locks: Mutex<HashMap<String, SectionLock>>,
}

impl SectionLockManager {
    pub fn new(channel: Channel, ttl: Duration) -> Self {
        Self {
            ttl,
            channel,
            locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn scope(&self) -> &str {
        self.channel.scope()
    }

    /// Try to take the section. A live lock held by someone else is a denial;
    /// the holder asking again refreshes the expiry.
    pub async fn acquire(&self, section_id: &str, user_id: &str, holder_name: &str) -> LockAttempt {
        self.acquire_at(section_id, user_id, holder_name, now_millis())
            .await
    }

    pub(crate) async fn acquire_at(
        &self,
        section_id: &str,
        user_id: &str,
        holder_name: &str,
        now: i64,
    ) -> LockAttempt {
        let expires_at = now.saturating_add(duration_millis(self.ttl));
        let mut locks = self.locks.lock().await;

        let lock = match locks.get_mut(section_id) {
            Some(existing) if !existing.is_expired(now) && !existing.is_held_by(user_id) => {
                tracing::debug!(
                    scope = %self.scope(),
                    section_id,
                    user_id,
                    holder = %existing.holder_user_id,
                    "Section lock denied"
                );
                return LockAttempt::Denied {
                    locked_by: existing.holder_name.clone(),
                    expires_at: existing.expires_at,
                };
            }
            Some(existing) if !existing.is_expired(now) => {
                existing.expires_at = expires_at;
                existing.clone()
            }
            _ => {
                let lock = SectionLock {
                    section_id: section_id.to_string(),
                    holder_user_id: user_id.to_string(),
                    holder_name: holder_name.to_string(),
                    acquired_at: now,
                    expires_at,
                };
                locks.insert(section_id.to_string(), lock.clone());
                tracing::info!(scope = %self.scope(), section_id, user_id, "Section lock granted");
                lock
            }
        };
        drop(locks);

        self.channel.send(ChannelEvent::LockAcquired { lock: lock.clone() });
        LockAttempt::Acquired { lock }
    }

    /// Holder-only release. Anyone else gets `false` and nothing changes.
    pub async fn release(&self, section_id: &str, user_id: &str) -> bool {
        let mut locks = self.locks.lock().await;
        let held = locks
            .get(section_id)
            .is_some_and(|lock| lock.is_held_by(user_id));
        if !held {
            return false;
        }
        locks.remove(section_id);
        drop(locks);

        tracing::info!(scope = %self.scope(), section_id, user_id, "Section lock released");
        self.channel.send(ChannelEvent::LockReleased {
            section_id: section_id.to_string(),
            user_id: user_id.to_string(),
        });
        true
    }

    /// Holder heartbeat: push the expiry out by one TTL.
    pub async fn extend(&self, section_id: &str, user_id: &str) -> Option<SectionLock> {
        self.extend_at(section_id, user_id, now_millis()).await
    }

    pub(crate) async fn extend_at(
        &self,
        section_id: &str,
        user_id: &str,
        now: i64,
    ) -> Option<SectionLock> {
        let mut locks = self.locks.lock().await;
        let lock = locks
            .get_mut(section_id)
            .filter(|lock| lock.is_held_by(user_id) && !lock.is_expired(now))?;
        lock.expires_at = now.saturating_add(duration_millis(self.ttl));
        let lock = lock.clone();
        drop(locks);

        self.channel.send(ChannelEvent::LockAcquired { lock: lock.clone() });
        Some(lock)
    }

    pub async fn is_locked_by_other(&self, section_id: &str, user_id: &str) -> LockStatus {
        self.is_locked_by_other_at(section_id, user_id, now_millis())
            .await
    }

    pub(crate) async fn is_locked_by_other_at(
        &self,
        section_id: &str,
        user_id: &str,
        now: i64,
    ) -> LockStatus {
        match self.locks.lock().await.get(section_id) {
            Some(lock) if !lock.is_expired(now) && !lock.is_held_by(user_id) => LockStatus {
                locked: true,
                locked_by: Some(lock.holder_name.clone()),
                expires_at: Some(lock.expires_at),
            },
            _ => LockStatus::unlocked(),
        }
    }

    /// Live locks, ordered by section id.
    pub async fn list_locks(&self) -> Vec<SectionLock> {
        self.list_locks_at(now_millis()).await
    }

    pub(crate) async fn list_locks_at(&self, now: i64) -> Vec<SectionLock> {
        let mut locks: Vec<SectionLock> = self
            .locks
            .lock()
            .await
            .values()
            .filter(|lock| !lock.is_expired(now))
            .cloned()
            .collect();
        locks.sort_by(|a, b| a.section_id.cmp(&b.section_id));
        locks
    }

    async fn is_empty(&self) -> bool {
        self.locks.lock().await.is_empty()
    }

    /// Delete expired locks and announce each one.
    pub async fn sweep_expired(&self) -> Vec<SectionLock> {
        self.sweep_expired_at(now_millis()).await
    }

    pub(crate) async fn sweep_expired_at(&self, now: i64) -> Vec<SectionLock> {
        let mut locks = self.locks.lock().await;
        let expired: Vec<String> = locks
            .iter()
            .filter(|(_, lock)| lock.is_expired(now))
            .map(|(section_id, _)| section_id.clone())
            .collect();
        let removed: Vec<SectionLock> = expired
            .iter()
            .filter_map(|section_id| locks.remove(section_id))
            .collect();
        drop(locks);

        for lock in &removed {
            tracing::debug!(
                scope = %self.scope(),
                section_id = %lock.section_id,
                holder = %lock.holder_user_id,
                "Section lock expired"
            );
            self.channel.send(ChannelEvent::LockExpired {
                section_id: lock.section_id.clone(),
                holder_user_id: lock.holder_user_id.clone(),
            });
        }
        removed
    }
}

/// One lock manager per opportunity scope, plus the background sweep.
pub struct LockRegistry {
    hub: ChannelHub,
    ttl: Duration,
    managers: RwLock<HashMap<String, Arc<SectionLockManager>>>,
}

impl LockRegistry {
    pub fn new(hub: ChannelHub, ttl: Duration) -> Self {
        Self {
            hub,
            ttl,
            managers: RwLock::new(HashMap::new()),
        }
    }

    /// Manager for a scope, created on first use.
    pub async fn manager(&self, scope: &str) -> Arc<SectionLockManager> {
        if let Some(manager) = self.managers.read().await.get(scope) {
            return Arc::clone(manager);
        }

        let channel = self.hub.channel(scope).await;
        let mut managers = self.managers.write().await;
        Arc::clone(
            managers
                .entry(scope.to_string())
                .or_insert_with(|| Arc::new(SectionLockManager::new(channel, self.ttl))),
        )
    }

    /// Sweep every scope; returns the number of locks removed.
    pub async fn sweep_all(&self) -> usize {
        let managers: Vec<Arc<SectionLockManager>> =
            self.managers.read().await.values().cloned().collect();

        let mut removed = 0;
        for manager in managers {
            removed += manager.sweep_expired().await.len();
        }
        if removed > 0 {
            tracing::debug!(removed, "Lock sweep removed expired locks");
        }

        let evicted = self.evict_idle().await;
        if evicted > 0 {
            tracing::debug!(evicted, "Lock sweep evicted idle scopes");
        }
        removed
    }

    /// Forget scopes with no locks, no outstanding manager handles and no
    /// channel subscribers. The manager and its channel go together so a
    /// scope never ends up with two lock tables.
    pub async fn evict_idle(&self) -> usize {
        let mut managers = self.managers.write().await;
        let mut idle = Vec::new();
        for (scope, manager) in managers.iter() {
            if Arc::strong_count(manager) == 1 && manager.is_empty().await {
                idle.push(scope.clone());
            }
        }

        let mut evicted = 0;
        for scope in idle {
            if self.hub.evict_idle(&scope).await {
                managers.remove(&scope);
                evicted += 1;
            }
        }
        evicted
    }

    pub async fn scopes(&self) -> Vec<String> {
        let mut scopes: Vec<String> = self.managers.read().await.keys().cloned().collect();
        scopes.sort();
        scopes
    }

    /// Run `sweep_all` on a fixed interval until the task is aborted.
    pub fn spawn_sweeper(self: Arc<Self>, interval: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                self.sweep_all().await;
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const MIN: i64 = 60_000;
    const TTL: i64 = 30 * MIN;

    async fn manager() -> SectionLockManager {
        let hub = ChannelHub::new(64);
        SectionLockManager::new(hub.channel("opp-1").await, Duration::from_secs(30 * 60))
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn second_user_is_denied_while_lock_is_live() {
        let locks = manager().await;

        let first = locks.acquire_at("sec-1", "u-1", "Alice", 0).await;
        assert!(first.is_acquired());

        let second = locks.acquire_at("sec-1", "u-2", "Bob", MIN).await;
        assert_eq!(
            second,
            LockAttempt::Denied {
                locked_by: "Alice".to_string(),
                expires_at: TTL,
            }
        );
        assert_eq!(locks.list_locks_at(MIN).await[0].holder_user_id, "u-1");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn reacquire_by_holder_keeps_holder_and_refreshes_expiry() {
        let locks = manager().await;
        locks.acquire_at("sec-1", "u-1", "Alice", 0).await;

        let LockAttempt::Acquired { lock } = locks.acquire_at("sec-1", "u-1", "Alice", MIN).await
        else {
            panic!("holder re-acquire should succeed");
        };
        assert_eq!(lock.holder_user_id, "u-1");
        assert_eq!(lock.acquired_at, 0);
        assert_eq!(lock.expires_at, MIN + TTL);
        assert_eq!(locks.list_locks_at(MIN).await.len(), 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn release_is_holder_only() {
        let locks = manager().await;
        locks.acquire_at("sec-1", "u-1", "Alice", 0).await;

        assert!(!locks.release("sec-1", "u-2").await);
        assert!(locks.is_locked_by_other_at("sec-1", "u-2", 1).await.locked);

        assert!(locks.release("sec-1", "u-1").await);
        assert_eq!(
            locks.is_locked_by_other_at("sec-1", "u-2", 2).await,
            LockStatus::unlocked()
        );
        assert!(!locks.release("sec-1", "u-1").await);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn is_locked_by_other_ignores_own_and_expired_locks() {
        let locks = manager().await;
        locks.acquire_at("sec-1", "u-1", "Alice", 0).await;

        assert!(!locks.is_locked_by_other_at("sec-1", "u-1", 1).await.locked);
        assert!(!locks.is_locked_by_other_at("sec-2", "u-2", 1).await.locked);

        let status = locks.is_locked_by_other_at("sec-1", "u-2", 1).await;
        assert_eq!(status.locked_by.as_deref(), Some("Alice"));
        assert_eq!(status.expires_at, Some(TTL));

        assert!(!locks.is_locked_by_other_at("sec-1", "u-2", TTL).await.locked);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn expired_lock_can_be_taken_over() {
        let locks = manager().await;
        locks.acquire_at("sec-1", "u-1", "Alice", 0).await;

        let takeover = locks.acquire_at("sec-1", "u-2", "Bob", 31 * MIN).await;
        let LockAttempt::Acquired { lock } = takeover else {
            panic!("expired lock should be taken over");
        };
        assert_eq!(lock.holder_name, "Bob");
        assert_eq!(lock.acquired_at, 31 * MIN);
        assert_eq!(lock.expires_at, 61 * MIN);

        // Alice's heartbeat no longer applies.
        assert_eq!(locks.extend_at("sec-1", "u-1", 32 * MIN).await, None);
        assert!(!locks.release("sec-1", "u-1").await);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn extend_pushes_expiry_and_rebroadcasts() {
        let locks = manager().await;
        let mut events = locks.channel.subscribe();
        locks.acquire_at("sec-1", "u-1", "Alice", 0).await;

        let extended = locks.extend_at("sec-1", "u-1", 10 * MIN).await.unwrap();
        assert_eq!(extended.expires_at, 10 * MIN + TTL);
        assert_eq!(locks.extend_at("sec-1", "u-2", 10 * MIN).await, None);

        assert_eq!(events.recv().await.unwrap().name(), "lock_acquired");
        assert_eq!(
            events.recv().await.unwrap(),
            ChannelEvent::LockAcquired { lock: extended }
        );
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn sweep_removes_expired_locks_and_announces_them() {
        let locks = manager().await;
        locks.acquire_at("sec-1", "u-1", "Alice", 0).await;
        locks.acquire_at("sec-2", "u-2", "Bob", 20 * MIN).await;
        let mut events = locks.channel.subscribe();

        let removed = locks.sweep_expired_at(TTL).await;
        assert_eq!(removed.len(), 1);
        assert_eq!(removed[0].section_id, "sec-1");
        assert_eq!(
            events.recv().await.unwrap(),
            ChannelEvent::LockExpired {
                section_id: "sec-1".to_string(),
                holder_user_id: "u-1".to_string(),
            }
        );
        assert_eq!(locks.list_locks_at(TTL).await.len(), 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn concurrent_acquire_has_exactly_one_winner() {
        let locks = Arc::new(manager().await);

        let mut tasks = Vec::new();
        for user in 0..8 {
            let locks = Arc::clone(&locks);
            tasks.push(tokio::spawn(async move {
                let user_id = format!("u-{user}");
                locks.acquire_at("sec-1", &user_id, &user_id, 0).await
            }));
        }

        let mut winners = 0;
        for task in tasks {
            if task.await.unwrap().is_acquired() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn registry_reuses_managers_per_scope() {
        let registry = LockRegistry::new(ChannelHub::new(16), Duration::from_secs(60));
        let first = registry.manager("opp-1").await;
        let again = registry.manager("opp-1").await;
        let other = registry.manager("opp-2").await;

        assert!(Arc::ptr_eq(&first, &again));
        assert!(!Arc::ptr_eq(&first, &other));

        first.acquire_at("sec-1", "u-1", "Alice", 0).await;
        assert_eq!(registry.sweep_all().await, 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn sweep_evicts_only_idle_scopes() {
        let hub = ChannelHub::new(16);
        let registry = LockRegistry::new(hub.clone(), Duration::from_secs(60));

        registry
            .manager("opp-expired")
            .await
            .acquire_at("sec-1", "u-1", "Alice", 0)
            .await;
        registry
            .manager("opp-live")
            .await
            .acquire("sec-1", "u-1", "Alice")
            .await;
        registry.manager("opp-watched").await;
        let _listener = hub.subscribe("opp-watched").await;
        let held = registry.manager("opp-held").await;

        assert_eq!(registry.sweep_all().await, 1);
        assert_eq!(
            registry.scopes().await,
            vec![
                "opp-held".to_string(),
                "opp-live".to_string(),
                "opp-watched".to_string(),
            ]
        );
        assert!(!hub.scopes().await.contains(&"opp-expired".to_string()));

        drop(held);
        assert_eq!(registry.evict_idle().await, 1);
        assert!(!registry.scopes().await.contains(&"opp-held".to_string()));
        assert!(!hub.scopes().await.contains(&"opp-held".to_string()));
    }
}
