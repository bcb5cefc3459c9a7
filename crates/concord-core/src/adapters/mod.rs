//! Cloud document adapters.
//!
//! An adapter moves a document's field tree to and from one external
//! editor. The sync engine owns the state machine; adapters only transport
//! content and report the external modified time.

mod http;
mod memory;

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Error, Result};

pub use http::HttpCloudAdapter;
pub use memory::MemoryCloudAdapter;

/// Result of a push. A refused push is reported here rather than as `Err`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PushOutcome {
    pub success: bool,
    pub error: Option<String>,
    /// External modified time after the write, when the provider reports it
    #[serde(default)]
    pub external_modified_at: Option<i64>,
}

impl PushOutcome {
    pub const fn succeeded(external_modified_at: Option<i64>) -> Self {
        Self {
            success: true,
            error: None,
            external_modified_at,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(error.into()),
            external_modified_at: None,
        }
    }
}

/// External copy of a document as last seen by the provider
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PulledContent {
    pub content: Value,
    /// External modified time (Unix ms)
    pub external_modified_at: i64,
}

#[async_trait]
pub trait CloudAdapter: Send + Sync {
    /// Provider key stored in `DocumentSyncState::cloud_provider`
    fn provider(&self) -> &str;

    async fn push_content(
        &self,
        organization_id: &str,
        file_id: &str,
        content: &Value,
    ) -> Result<PushOutcome>;

    /// `None` when the external file does not exist (yet).
    async fn pull_content(&self, organization_id: &str, file_id: &str)
        -> Result<Option<PulledContent>>;

    async fn web_url(&self, organization_id: &str, file_id: &str) -> Result<Option<String>>;
}

/// Adapters keyed by provider name
#[derive(Clone, Default)]
pub struct AdapterRegistry {
    adapters: BTreeMap<String, Arc<dyn CloudAdapter>>,
}

impl AdapterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an adapter under its provider name, replacing any previous one.
    pub fn register(&mut self, adapter: Arc<dyn CloudAdapter>) {
        let provider = adapter.provider().to_string();
        tracing::info!(provider = %provider, "Registered cloud adapter");
        self.adapters.insert(provider, adapter);
    }

    #[must_use]
    pub fn with(mut self, adapter: Arc<dyn CloudAdapter>) -> Self {
        self.register(adapter);
        self
    }

    pub fn get(&self, provider: &str) -> Result<Arc<dyn CloudAdapter>> {
        self.adapters
            .get(provider)
            .cloned()
            .ok_or_else(|| Error::validation(format!("no cloud adapter for provider '{provider}'")))
    }

    pub fn providers(&self) -> Vec<&str> {
        self.adapters.keys().map(String::as_str).collect()
    }
}
