//! Link, push, pull and conflict resolution over the registered adapters.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio::task::JoinHandle;

use super::{PullResult, SyncCycleReport};
use crate::adapters::{AdapterRegistry, CloudAdapter, PulledContent};
use crate::authz::Authorizer;
use crate::error::{Error, Result};
use crate::models::{
    Actor, ArtifactStatus, AuditEntry, ConflictDecision, ConflictId, DocumentRecord,
    DocumentSyncState, ExternalVersion, InternalVersion, Permission, PullDecision, SyncConflict,
    SyncHealth, SyncStatus,
};
use crate::services::{AuditSink, ContentStore, StoreService};
use crate::util::{now_millis, with_timeout};

const SYNC_ENTITY: &str = "document_sync_state";
const CONFLICT_ENTITY: &str = "sync_conflict";
/// Actor id recorded for scheduled work
const SYSTEM_ACTOR: &str = "system:sync";
const CONFLICT_LIST_LIMIT: usize = 200;

enum CycleStep {
    Pulled,
    Pushed,
    Unchanged,
    Conflict,
}

/// Keeps documents and their cloud copies in step.
///
/// Every adapter call runs under `adapter_timeout`. A failed call moves the
/// document to `error` and is retried by the next scheduled cycle.
#[derive(Clone)]
pub struct SyncEngine {
    store: StoreService,
    content: Arc<dyn ContentStore>,
    adapters: AdapterRegistry,
    audit: Arc<dyn AuditSink>,
    authorizer: Arc<dyn Authorizer>,
    adapter_timeout: Duration,
}

impl SyncEngine {
    pub fn new(
        store: StoreService,
        content: Arc<dyn ContentStore>,
        adapters: AdapterRegistry,
        audit: Arc<dyn AuditSink>,
        authorizer: Arc<dyn Authorizer>,
        adapter_timeout: Duration,
    ) -> Self {
        Self {
            store,
            content,
            adapters,
            audit,
            authorizer,
            adapter_timeout,
        }
    }

    /// Attach a document to an external file. The first pull settles the content.
    pub async fn link_document(
        &self,
        actor: &Actor,
        document_id: &str,
        provider: &str,
        file_id: &str,
    ) -> Result<DocumentSyncState> {
        let document = self.document(document_id).await?;
        self.authorizer
            .authorize_in(actor, Permission::ManageSync, &document.organization_id)
            .await?;

        let provider = provider.trim();
        let file_id = file_id.trim();
        if file_id.is_empty() {
            return Err(Error::validation("cloud file id must not be empty"));
        }
        let adapter = self.adapters.get(provider)?;

        let web_url = match with_timeout(
            "cloud web url",
            self.adapter_timeout,
            adapter.web_url(&document.organization_id, file_id),
        )
        .await
        {
            Ok(url) => url,
            Err(error) => {
                tracing::warn!(document_id, provider, %error, "Could not resolve cloud web URL");
                None
            }
        };

        let mut state = self.state_for(&document).await?;
        state.link(provider, file_id, web_url)?;
        self.store.save_sync_state(&state).await?;

        tracing::info!(document_id, provider, file_id, "Linked document to cloud file");
        self.audit
            .record(AuditEntry::new(
                "sync.linked",
                SYNC_ENTITY,
                document_id,
                &actor.user_id,
                json!({ "provider": provider, "file_id": file_id }),
            ))
            .await?;
        Ok(state)
    }

    /// Drop the external link; the document returns to `idle`.
    pub async fn unlink_document(
        &self,
        actor: &Actor,
        document_id: &str,
    ) -> Result<DocumentSyncState> {
        let document = self.document(document_id).await?;
        self.authorizer
            .authorize_in(actor, Permission::ManageSync, &document.organization_id)
            .await?;

        let mut state = self.linked_state(&document).await?;
        self.ensure_no_pending_conflict(document_id).await?;
        state.unlink();
        self.store.save_sync_state(&state).await?;

        tracing::info!(document_id, "Unlinked document from cloud file");
        self.audit
            .record(AuditEntry::new(
                "sync.unlinked",
                SYNC_ENTITY,
                document_id,
                &actor.user_id,
                json!({}),
            ))
            .await?;
        Ok(state)
    }

    /// Record that the internal copy changed, so the next cycle pushes it.
    pub async fn note_internal_edit(&self, document_id: &str) -> Result<DocumentSyncState> {
        let document = self.document(document_id).await?;
        let mut state = self.state_for(&document).await?;
        state.mark_internal_edit(now_millis());
        self.store.save_sync_state(&state).await?;
        Ok(state)
    }

    /// Current sync row of a document, `idle` when it was never linked.
    pub async fn sync_state(&self, document_id: &str) -> Result<DocumentSyncState> {
        let document = self.document(document_id).await?;
        self.state_for(&document).await
    }

    pub async fn push_document(
        &self,
        actor: &Actor,
        document_id: &str,
    ) -> Result<DocumentSyncState> {
        let document = self.document(document_id).await?;
        self.authorizer
            .authorize_in(actor, Permission::ManageSync, &document.organization_id)
            .await?;

        let state = self.linked_state(&document).await?;
        self.push(&document, state).await
    }

    pub async fn pull_document(&self, actor: &Actor, document_id: &str) -> Result<PullResult> {
        let document = self.document(document_id).await?;
        self.authorizer
            .authorize_in(actor, Permission::ManageSync, &document.organization_id)
            .await?;

        let state = self.linked_state(&document).await?;
        self.pull(&document, state, &actor.user_id).await
    }

    /// Settle a pending conflict by writing the chosen content to the losing side.
    ///
    /// `keep_internal` pushes to the cloud, `keep_external` writes the store,
    /// `merged` does both. If the push fails the conflict stays pending.
    pub async fn resolve_conflict(
        &self,
        actor: &Actor,
        conflict_id: &ConflictId,
        decision: ConflictDecision,
    ) -> Result<SyncConflict> {
        let mut conflict = self.conflict(conflict_id).await?;
        self.authorizer
            .authorize_in(actor, Permission::ResolveConflicts, &conflict.organization_id)
            .await?;
        if !conflict.is_pending() {
            return Err(Error::validation(format!(
                "conflict {conflict_id} was already resolved as {}",
                conflict.resolution
            )));
        }

        let state = self
            .store
            .get_sync_state(&conflict.document_id)
            .await?
            .ok_or_else(|| {
                Error::not_found(format!("sync state for document {}", conflict.document_id))
            })?;
        let synced_at = now_millis();
        // keep_internal pushes the document as it is now, not as it was at detection
        let content = match &decision {
            ConflictDecision::KeepInternal => self.document(&conflict.document_id).await?.fields,
            other => conflict.chosen_content(other).clone(),
        };

        let mut cloud_edit_at = conflict.external_version.updated_at;
        if matches!(
            decision,
            ConflictDecision::KeepInternal | ConflictDecision::Merged { .. }
        ) {
            let (provider, file_id) = owned_target(&state)?;
            let pushed = match self.adapters.get(&provider) {
                Ok(adapter) => {
                    self.push_to(adapter.as_ref(), &conflict.organization_id, &file_id, &content)
                        .await
                }
                Err(error) => Err(error),
            };
            match pushed {
                Ok(modified_at) => cloud_edit_at = modified_at.unwrap_or_else(now_millis),
                Err(error) => return self.fail(state, error).await,
            }
        }
        if matches!(
            decision,
            ConflictDecision::KeepExternal | ConflictDecision::Merged { .. }
        ) {
            self.content
                .replace_fields(&conflict.document_id, content, &actor.user_id)
                .await?;
        }

        let now = now_millis();
        conflict.resolve(&decision, &actor.user_id, now)?;
        self.store.save_resolution(&conflict).await?;

        let mut state = state;
        state.conflict_resolved(synced_at, cloud_edit_at);
        self.store.save_sync_state(&state).await?;

        tracing::info!(
            conflict_id = %conflict.id,
            document_id = %conflict.document_id,
            resolution = %conflict.resolution,
            resolved_by = %actor.user_id,
            "Resolved sync conflict"
        );
        self.audit
            .record(AuditEntry::new(
                "conflict.resolved",
                CONFLICT_ENTITY,
                conflict.id.as_str(),
                &actor.user_id,
                json!({
                    "document_id": conflict.document_id,
                    "resolution": conflict.resolution.as_str(),
                }),
            ))
            .await?;
        Ok(conflict)
    }

    pub async fn get_conflict(&self, actor: &Actor, conflict_id: &ConflictId) -> Result<SyncConflict> {
        let conflict = self.conflict(conflict_id).await?;
        if conflict.organization_id != actor.organization_id {
            return Err(Error::permission(format!(
                "conflict {conflict_id} belongs to another organization"
            )));
        }
        Ok(conflict)
    }

    /// Conflicts of an organization, newest first.
    pub async fn list_conflicts(
        &self,
        organization_id: &str,
        pending_only: bool,
    ) -> Result<Vec<SyncConflict>> {
        self.store
            .list_conflicts(organization_id, pending_only, CONFLICT_LIST_LIMIT)
            .await
    }

    /// Every document of the opportunity with its sync status; unlinked ones read `idle`.
    pub async fn get_artifact_statuses(
        &self,
        organization_id: &str,
        opportunity_id: &str,
    ) -> Result<Vec<ArtifactStatus>> {
        let documents: Vec<DocumentRecord> = self
            .content
            .list_opportunity_documents(opportunity_id)
            .await?
            .into_iter()
            .filter(|document| document.organization_id == organization_id)
            .collect();

        let ids: Vec<String> = documents.iter().map(|document| document.id.clone()).collect();
        let states: HashMap<String, DocumentSyncState> = self
            .store
            .list_states_for(&ids)
            .await?
            .into_iter()
            .map(|state| (state.document_id.clone(), state))
            .collect();

        Ok(documents
            .iter()
            .map(|document| ArtifactStatus::from_parts(document, states.get(&document.id)))
            .collect())
    }

    pub async fn sync_health(
        &self,
        organization_id: &str,
        opportunity_id: &str,
    ) -> Result<SyncHealth> {
        let statuses = self
            .get_artifact_statuses(organization_id, opportunity_id)
            .await?;
        Ok(SyncHealth::from_statuses(&statuses))
    }

    /// One pass over every linked document of an organization.
    ///
    /// Each document is pulled first; a dirty internal side is then pushed.
    /// Conflicted documents are skipped and a failing document never stops
    /// the pass.
    pub async fn run_sync_cycle(&self, organization_id: &str) -> Result<SyncCycleReport> {
        let states = self.store.list_linked_states(organization_id).await?;
        let mut report = SyncCycleReport {
            organization_id: organization_id.to_string(),
            ..SyncCycleReport::default()
        };

        for state in states {
            if state.sync_status == SyncStatus::Conflict {
                report.skipped += 1;
                continue;
            }

            let document_id = state.document_id.clone();
            match self.cycle_step(state).await {
                Ok(CycleStep::Pulled) => report.pulled += 1,
                Ok(CycleStep::Pushed) => report.pushed += 1,
                Ok(CycleStep::Unchanged) => report.unchanged += 1,
                Ok(CycleStep::Conflict) => report.conflicts += 1,
                Err(error) => {
                    tracing::warn!(document_id = %document_id, %error, "Sync cycle step failed");
                    report.failed.push(document_id);
                }
            }
        }

        tracing::info!(
            organization_id,
            pulled = report.pulled,
            pushed = report.pushed,
            conflicts = report.conflicts,
            failed = report.failed.len(),
            "Sync cycle finished"
        );
        Ok(report)
    }

    /// Run a cycle for every organization with linked documents.
    pub async fn run_all_cycles(&self) -> Vec<SyncCycleReport> {
        let organizations = match self.store.list_linked_organizations().await {
            Ok(organizations) => organizations,
            Err(error) => {
                tracing::warn!(%error, "Could not list organizations to sync");
                return Vec::new();
            }
        };

        let mut reports = Vec::with_capacity(organizations.len());
        for organization_id in organizations {
            match self.run_sync_cycle(&organization_id).await {
                Ok(report) => reports.push(report),
                Err(error) => {
                    tracing::warn!(organization_id = %organization_id, %error, "Sync cycle failed");
                }
            }
        }
        reports
    }

    pub fn spawn_scheduler(self: Arc<Self>, interval: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                self.run_all_cycles().await;
            }
        })
    }

    async fn cycle_step(&self, state: DocumentSyncState) -> Result<CycleStep> {
        let document = self.document(&state.document_id).await?;
        match self.pull(&document, state, SYSTEM_ACTOR).await? {
            PullResult::Applied { .. } => Ok(CycleStep::Pulled),
            PullResult::Conflict { .. } => Ok(CycleStep::Conflict),
            PullResult::Missing { state } => {
                self.push(&document, state).await?;
                Ok(CycleStep::Pushed)
            }
            PullResult::Unchanged { state } if state.needs_push() => {
                self.push(&document, state).await?;
                Ok(CycleStep::Pushed)
            }
            PullResult::Unchanged { .. } => Ok(CycleStep::Unchanged),
        }
    }

    async fn push(
        &self,
        document: &DocumentRecord,
        mut state: DocumentSyncState,
    ) -> Result<DocumentSyncState> {
        self.ensure_no_pending_conflict(&document.id).await?;
        state.begin_sync()?;
        let (provider, file_id) = owned_target(&state)?;
        let adapter = match self.adapters.get(&provider) {
            Ok(adapter) => adapter,
            Err(error) => return self.fail(state, error).await,
        };

        let synced_at = now_millis();
        state.mark_internal_edit(synced_at);
        self.store.save_sync_state(&state).await?;

        // Edits stamped after `synced_at` are not in this snapshot and stay pending.
        let document = self.document(&document.id).await?;
        match self
            .push_to(adapter.as_ref(), &document.organization_id, &file_id, &document.fields)
            .await
        {
            Ok(external_modified_at) => {
                state.push_succeeded(synced_at);
                if let Some(modified_at) = external_modified_at {
                    state.last_cloud_edit_at = Some(modified_at);
                }
                self.store.save_sync_state(&state).await?;
                tracing::info!(document_id = %document.id, provider = %provider, "Pushed document");
                Ok(state)
            }
            Err(error) => self.fail(state, error).await,
        }
    }

    /// Push through the adapter. A refused push becomes an adapter error.
    async fn push_to(
        &self,
        adapter: &dyn CloudAdapter,
        organization_id: &str,
        file_id: &str,
        content: &serde_json::Value,
    ) -> Result<Option<i64>> {
        let outcome = with_timeout(
            "cloud push",
            self.adapter_timeout,
            adapter.push_content(organization_id, file_id, content),
        )
        .await?;
        if outcome.success {
            Ok(outcome.external_modified_at)
        } else {
            Err(Error::adapter(format!(
                "{} rejected the push: {}",
                adapter.provider(),
                outcome.error.as_deref().unwrap_or("no reason given")
            )))
        }
    }

    async fn pull(
        &self,
        document: &DocumentRecord,
        mut state: DocumentSyncState,
        actor_id: &str,
    ) -> Result<PullResult> {
        if let Some(conflict) = self.store.pending_conflict_for(&document.id).await? {
            if state.sync_status != SyncStatus::Conflict {
                state.enter_conflict();
                self.store.save_sync_state(&state).await?;
            }
            return Ok(PullResult::Conflict { state, conflict });
        }

        state.begin_sync()?;
        let (provider, file_id) = owned_target(&state)?;
        let adapter = match self.adapters.get(&provider) {
            Ok(adapter) => adapter,
            Err(error) => return self.fail(state, error).await,
        };
        self.store.save_sync_state(&state).await?;

        let pulled = match with_timeout(
            "cloud pull",
            self.adapter_timeout,
            adapter.pull_content(&document.organization_id, &file_id),
        )
        .await
        {
            Ok(pulled) => pulled,
            Err(error) => return self.fail(state, error).await,
        };

        let now = now_millis();
        let Some(pulled) = pulled else {
            state.pull_unchanged(true, now);
            self.store.save_sync_state(&state).await?;
            return Ok(PullResult::Missing { state });
        };

        let mut decision = state.evaluate_pull(pulled.external_modified_at);
        if decision == PullDecision::Apply {
            // An internal edit may have landed while the pull was in flight.
            if let Some(edited_at) = self.latest_internal_edit(&document.id).await? {
                state.mark_internal_edit(edited_at);
                decision = state.evaluate_pull(pulled.external_modified_at);
            }
        }

        match decision {
            PullDecision::Apply => {
                let external_modified_at = pulled.external_modified_at;
                if let Err(error) = self
                    .content
                    .replace_fields(&document.id, pulled.content, &format!("sync:{provider}"))
                    .await
                {
                    return self.fail(state, error).await;
                }
                state.pull_applied(external_modified_at, now);
                self.store.save_sync_state(&state).await?;
                tracing::info!(document_id = %document.id, provider = %provider, "Applied external content");
                Ok(PullResult::Applied { state })
            }
            PullDecision::Unchanged { internal_dirty } => {
                state.pull_unchanged(internal_dirty, now);
                self.store.save_sync_state(&state).await?;
                Ok(PullResult::Unchanged { state })
            }
            PullDecision::Conflict => {
                let document = self.document(&document.id).await?;
                let conflict = self
                    .open_conflict(&document, &mut state, &provider, pulled, actor_id, now)
                    .await?;
                Ok(PullResult::Conflict { state, conflict })
            }
        }
    }

    async fn open_conflict(
        &self,
        document: &DocumentRecord,
        state: &mut DocumentSyncState,
        provider: &str,
        pulled: PulledContent,
        actor_id: &str,
        now: i64,
    ) -> Result<SyncConflict> {
        let conflict = SyncConflict::new(
            &document.id,
            &document.organization_id,
            InternalVersion {
                content: document.fields.clone(),
                updated_at: state.last_mp_edit_at.unwrap_or(document.updated_at),
                updated_by: document.updated_by.clone(),
            },
            ExternalVersion {
                content: pulled.content,
                updated_at: pulled.external_modified_at,
                source: provider.to_string(),
            },
            now,
        );
        self.store.insert_conflict(&conflict).await?;
        state.enter_conflict();
        self.store.save_sync_state(state).await?;

        tracing::warn!(
            conflict_id = %conflict.id,
            document_id = %document.id,
            provider,
            "Both sides changed since the last sync"
        );
        self.audit
            .record(AuditEntry::new(
                "conflict.detected",
                CONFLICT_ENTITY,
                conflict.id.as_str(),
                actor_id,
                json!({
                    "document_id": document.id,
                    "internal_updated_at": conflict.internal_version.updated_at,
                    "external_updated_at": conflict.external_version.updated_at,
                }),
            ))
            .await?;
        Ok(conflict)
    }

    /// Record the failure on the sync row, then hand the error back.
    async fn fail<T>(&self, mut state: DocumentSyncState, error: Error) -> Result<T> {
        state.fail(&error.to_string(), now_millis());
        if let Err(save_error) = self.store.save_sync_state(&state).await {
            tracing::error!(
                document_id = %state.document_id,
                error = %save_error,
                "Could not record sync failure"
            );
        }
        tracing::warn!(document_id = %state.document_id, %error, "Sync failed");
        Err(error)
    }

    async fn document(&self, document_id: &str) -> Result<DocumentRecord> {
        self.content
            .get_document(document_id)
            .await?
            .ok_or_else(|| Error::not_found(format!("document {document_id}")))
    }

    async fn conflict(&self, conflict_id: &ConflictId) -> Result<SyncConflict> {
        self.store
            .get_conflict(conflict_id)
            .await?
            .ok_or_else(|| Error::not_found(format!("conflict {conflict_id}")))
    }

    async fn state_for(&self, document: &DocumentRecord) -> Result<DocumentSyncState> {
        Ok(self
            .store
            .get_sync_state(&document.id)
            .await?
            .unwrap_or_else(|| DocumentSyncState::idle(&document.id, &document.organization_id)))
    }

    async fn linked_state(&self, document: &DocumentRecord) -> Result<DocumentSyncState> {
        let state = self.state_for(document).await?;
        state.link_target()?;
        Ok(state)
    }

    async fn latest_internal_edit(&self, document_id: &str) -> Result<Option<i64>> {
        Ok(self
            .store
            .get_sync_state(document_id)
            .await?
            .and_then(|state| state.last_mp_edit_at))
    }

    async fn ensure_no_pending_conflict(&self, document_id: &str) -> Result<()> {
        match self.store.pending_conflict_for(document_id).await? {
            Some(conflict) => Err(Error::validation(format!(
                "document {document_id} has unresolved conflict {}",
                conflict.id
            ))),
            None => Ok(()),
        }
    }
}

fn owned_target(state: &DocumentSyncState) -> Result<(String, String)> {
    state
        .link_target()
        .map(|(provider, file_id)| (provider.to_string(), file_id.to_string()))
}
