//! Wiring of the engine components over one store.

use std::sync::Arc;

use tokio::task::JoinHandle;

use crate::adapters::AdapterRegistry;
use crate::authz::{Authorizer, RoleAuthorizer};
use crate::cascade::CascadeEvaluator;
use crate::channel::ChannelHub;
use crate::config::EngineConfig;
use crate::lock::LockRegistry;
use crate::presence::PresenceTracker;
use crate::rules::RuleStore;
use crate::services::StoreService;
use crate::sync::SyncEngine;

/// Every engine component, sharing one store, one channel hub and one
/// authorizer.
#[derive(Clone)]
pub struct Coordinator {
    pub config: EngineConfig,
    pub store: StoreService,
    pub hub: ChannelHub,
    pub presence: PresenceTracker,
    pub locks: Arc<LockRegistry>,
    pub rules: RuleStore,
    pub cascades: CascadeEvaluator,
    pub sync: Arc<SyncEngine>,
}

impl Coordinator {
    /// Build with the SQLite store as content store and audit sink, and role-based authorization.
    pub fn new(config: EngineConfig, store: StoreService, adapters: AdapterRegistry) -> Self {
        Self::with_authorizer(config, store, adapters, Arc::new(RoleAuthorizer))
    }

    pub fn with_authorizer(
        config: EngineConfig,
        store: StoreService,
        adapters: AdapterRegistry,
        authorizer: Arc<dyn Authorizer>,
    ) -> Self {
        let store = store.with_timeout(config.store_timeout);
        let hub = ChannelHub::new(config.channel_capacity);
        let content = Arc::new(store.clone());
        let audit = Arc::new(store.clone());

        Self {
            presence: PresenceTracker::new(hub.clone()),
            locks: Arc::new(LockRegistry::new(hub.clone(), config.lock_ttl)),
            rules: RuleStore::new(store.clone(), audit.clone(), authorizer.clone()),
            cascades: CascadeEvaluator::new(
                store.clone(),
                content.clone(),
                audit.clone(),
                authorizer.clone(),
            ),
            sync: Arc::new(SyncEngine::new(
                store.clone(),
                content,
                adapters,
                audit,
                authorizer,
                config.adapter_timeout,
            )),
            hub,
            store,
            config,
        }
    }

    /// Start the lock sweeper and the sync scheduler.
    pub fn spawn_background(&self) -> Vec<JoinHandle<()>> {
        tracing::info!(
            lock_sweep_secs = self.config.lock_sweep_interval.as_secs(),
            sync_interval_secs = self.config.sync_interval.as_secs(),
            "Starting background tasks"
        );
        vec![
            self.locks
                .clone()
                .spawn_sweeper(self.config.lock_sweep_interval),
            self.sync.clone().spawn_scheduler(self.config.sync_interval),
        ]
    }
}
