//! In-process adapter for tests and local development.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::Mutex;

use super::{CloudAdapter, PulledContent, PushOutcome};
use crate::error::{Error, Result};
use crate::util::now_millis;

#[derive(Default)]
struct MemoryState {
    files: HashMap<(String, String), PulledContent>,
    refuse_pushes: Option<String>,
    unavailable: bool,
}

/// Keeps "external" files in a map. Clones share the same files.
#[derive(Clone)]
pub struct MemoryCloudAdapter {
    provider: String,
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryCloudAdapter {
    pub fn new(provider: impl Into<String>) -> Self {
        Self {
            provider: provider.into(),
            state: Arc::new(Mutex::new(MemoryState::default())),
        }
    }

    /// Simulate an edit made in the external editor.
    pub async fn put_external(
        &self,
        organization_id: &str,
        file_id: &str,
        content: Value,
        modified_at: i64,
    ) {
        self.state.lock().await.files.insert(
            (organization_id.to_string(), file_id.to_string()),
            PulledContent {
                content,
                external_modified_at: modified_at,
            },
        );
    }

    pub async fn file(&self, organization_id: &str, file_id: &str) -> Option<PulledContent> {
        self.state
            .lock()
            .await
            .files
            .get(&(organization_id.to_string(), file_id.to_string()))
            .cloned()
    }

    /// Make pushes report failure with `reason` (or succeed again with `None`).
    pub async fn refuse_pushes(&self, reason: Option<&str>) {
        self.state.lock().await.refuse_pushes = reason.map(str::to_string);
    }

    /// Make every call fail as if the provider were down.
    pub async fn set_unavailable(&self, unavailable: bool) {
        self.state.lock().await.unavailable = unavailable;
    }

    fn ensure_available(&self, state: &MemoryState) -> Result<()> {
        if state.unavailable {
            return Err(Error::adapter(format!("{} is unavailable", self.provider)));
        }
        Ok(())
    }
}

#[async_trait]
impl CloudAdapter for MemoryCloudAdapter {
    fn provider(&self) -> &str {
        &self.provider
    }

    async fn push_content(
        &self,
        organization_id: &str,
        file_id: &str,
        content: &Value,
    ) -> Result<PushOutcome> {
        let mut state = self.state.lock().await;
        self.ensure_available(&state)?;
        if let Some(reason) = &state.refuse_pushes {
            return Ok(PushOutcome::failed(reason.clone()));
        }

        let modified_at = now_millis();
        state.files.insert(
            (organization_id.to_string(), file_id.to_string()),
            PulledContent {
                content: content.clone(),
                external_modified_at: modified_at,
            },
        );
        Ok(PushOutcome::succeeded(Some(modified_at)))
    }

    async fn pull_content(
        &self,
        organization_id: &str,
        file_id: &str,
    ) -> Result<Option<PulledContent>> {
        let state = self.state.lock().await;
        self.ensure_available(&state)?;
        Ok(state
            .files
            .get(&(organization_id.to_string(), file_id.to_string()))
            .cloned())
    }

    async fn web_url(&self, organization_id: &str, file_id: &str) -> Result<Option<String>> {
        let state = self.state.lock().await;
        self.ensure_available(&state)?;
        Ok(Some(format!(
            "memory://{}/{organization_id}/{file_id}",
            self.provider
        )))
    }
}
