//! Cascade preview and apply.

use std::sync::Arc;

use serde_json::{json, Value};

use crate::authz::Authorizer;
use crate::error::{Error, Result};
use crate::models::{
    Actor, AppliedChange, AuditEntry, CascadePreviewItem, CascadeStatus, CoordinationLogEntry,
    CoordinationRule, DocumentRecord, LogEntryId, Permission, RuleId,
};
use crate::services::{AuditSink, ContentStore, StoreService};
use crate::util::now_millis;

use super::transform;

/// Everything a cascade needs, computed without side effects.
struct Resolution {
    rule: CoordinationRule,
    new_value: Value,
    targets: Vec<DocumentRecord>,
}

/// Evaluates coordination rules against a changed field: one hop, no chaining.
#[derive(Clone)]
pub struct CascadeEvaluator {
    store: StoreService,
    content: Arc<dyn ContentStore>,
    audit: Arc<dyn AuditSink>,
    authorizer: Arc<dyn Authorizer>,
}

impl CascadeEvaluator {
    pub fn new(
        store: StoreService,
        content: Arc<dyn ContentStore>,
        audit: Arc<dyn AuditSink>,
        authorizer: Arc<dyn Authorizer>,
    ) -> Self {
        Self {
            store,
            content,
            audit,
            authorizer,
        }
    }

    /// What `apply_cascade` would write, target by target. Reads only; inactive rules are refused.
    pub async fn preview_cascade(
        &self,
        actor: &Actor,
        rule_id: &RuleId,
        trigger_document_id: &str,
        new_value: &Value,
    ) -> Result<Vec<CascadePreviewItem>> {
        let resolution = self
            .resolve(actor, rule_id, trigger_document_id, new_value)
            .await?;
        Ok(Self::preview_items(&resolution))
    }

    /// Preview every active rule whose source is `field_path` of the trigger document.
    pub async fn preview_field_change(
        &self,
        actor: &Actor,
        trigger_document_id: &str,
        field_path: &str,
        new_value: &Value,
    ) -> Result<Vec<CascadePreviewItem>> {
        let trigger = self.trigger_document(trigger_document_id).await?;
        let rules = self
            .store
            .list_active_rules_for_source(
                &trigger.organization_id,
                trigger.doc_type,
                field_path.trim(),
            )
            .await?;

        let mut items = Vec::new();
        for rule in rules {
            items.extend(
                self.preview_cascade(actor, &rule.id, trigger_document_id, new_value)
                    .await?,
            );
        }
        Ok(items)
    }

    /// Write the transformed value into every target and log the execution.
    ///
    /// Failed writes do not roll back the ones that succeeded; the log entry
    /// is marked `failed` and names the documents that were missed.
    pub async fn apply_cascade(
        &self,
        actor: &Actor,
        rule_id: &RuleId,
        trigger_document_id: &str,
        new_value: &Value,
    ) -> Result<CoordinationLogEntry> {
        self.authorizer
            .authorize(actor, Permission::ApplyCascade)
            .await?;

        let resolution = self
            .resolve(actor, rule_id, trigger_document_id, new_value)
            .await?;
        let rule = &resolution.rule;

        let mut changes = Vec::new();
        let mut failed = Vec::new();
        let mut errors = Vec::new();
        for target in &resolution.targets {
            match self
                .content
                .write_field(
                    &target.id,
                    &rule.target_field_path,
                    resolution.new_value.clone(),
                    &actor.user_id,
                )
                .await
            {
                Ok(old_value) => changes.push(AppliedChange {
                    document_id: target.id.clone(),
                    field_path: rule.target_field_path.clone(),
                    old_value,
                    new_value: resolution.new_value.clone(),
                }),
                Err(error) => {
                    tracing::warn!(
                        rule_id = %rule.id,
                        document_id = %target.id,
                        %error,
                        "Cascade write failed"
                    );
                    errors.push(format!("{}: {error}", target.id));
                    failed.push(target.id.clone());
                }
            }
        }

        let now = now_millis();
        let status = if failed.is_empty() {
            CascadeStatus::Applied
        } else {
            CascadeStatus::Failed
        };
        let entry = CoordinationLogEntry {
            id: LogEntryId::new(),
            rule_id: rule.id,
            trigger_document_id: trigger_document_id.to_string(),
            affected_documents: resolution.targets.iter().map(|doc| doc.id.clone()).collect(),
            changes_applied: changes,
            failed_documents: failed,
            status,
            error_message: (!errors.is_empty()).then(|| errors.join("; ")),
            executed_by: actor.user_id.clone(),
            executed_at: now,
        };
        self.store.append_log(&entry).await?;

        for change in &entry.changes_applied {
            self.mark_for_push(&change.document_id, now).await;
        }

        if entry.is_partial_failure() {
            tracing::warn!(
                rule_id = %rule.id,
                log_id = %entry.id,
                failed = entry.failed_documents.len(),
                "Cascade partially applied"
            );
        } else {
            tracing::info!(
                rule_id = %rule.id,
                log_id = %entry.id,
                written = entry.changes_applied.len(),
                "Cascade applied"
            );
        }

        // The writes and the log entry are committed; a lost audit row must not
        // make callers retry the cascade.
        if let Err(error) = self
            .audit
            .record(AuditEntry::new(
                format!("cascade.{}", entry.status),
                "coordination_log",
                entry.id.as_str(),
                &actor.user_id,
                json!({
                    "rule_id": rule.id,
                    "trigger_document_id": entry.trigger_document_id,
                    "affected_documents": entry.affected_documents,
                    "failed_documents": entry.failed_documents,
                }),
            ))
            .await
        {
            tracing::warn!(log_id = %entry.id, %error, "Could not audit cascade");
        }
        Ok(entry)
    }

    pub async fn log_for_rule(
        &self,
        actor: &Actor,
        rule_id: &RuleId,
        limit: usize,
    ) -> Result<Vec<CoordinationLogEntry>> {
        self.rule_in_scope(actor, rule_id).await?;
        self.store.list_log_for_rule(rule_id, limit).await
    }

    pub async fn log_for_organization(
        &self,
        organization_id: &str,
        limit: usize,
    ) -> Result<Vec<CoordinationLogEntry>> {
        self.store
            .list_log_for_organization(organization_id, limit)
            .await
    }

    async fn resolve(
        &self,
        actor: &Actor,
        rule_id: &RuleId,
        trigger_document_id: &str,
        new_value: &Value,
    ) -> Result<Resolution> {
        let rule = self.rule_in_scope(actor, rule_id).await?;
        if !rule.is_active {
            return Err(Error::validation(format!("rule {} is inactive", rule.id)));
        }
        let trigger = self.trigger_document(trigger_document_id).await?;

        if trigger.organization_id != rule.organization_id {
            return Err(Error::validation(format!(
                "document {} is outside the rule's organization",
                trigger.id
            )));
        }
        if trigger.doc_type != rule.source_doc_type {
            return Err(Error::validation(format!(
                "document {} is a {}, rule {} starts from {}",
                trigger.id, trigger.doc_type, rule.id, rule.source_doc_type
            )));
        }

        let new_value = transform::apply(&rule, new_value, &trigger)?;
        let targets = self
            .content
            .list_documents_by_type(
                &rule.organization_id,
                &trigger.opportunity_id,
                rule.target_doc_type,
            )
            .await?
            .into_iter()
            .filter(|doc| doc.id != trigger.id)
            .collect();

        Ok(Resolution {
            rule,
            new_value,
            targets,
        })
    }

    fn preview_items(resolution: &Resolution) -> Vec<CascadePreviewItem> {
        let rule = &resolution.rule;
        resolution
            .targets
            .iter()
            .map(|doc| CascadePreviewItem {
                rule_id: rule.id,
                target_doc_type: rule.target_doc_type,
                target_field_path: rule.target_field_path.clone(),
                document_id: doc.id.clone(),
                document_title: doc.title.clone(),
                current_value: doc.field(&rule.target_field_path).cloned(),
                new_value: resolution.new_value.clone(),
            })
            .collect()
    }

    async fn rule_in_scope(&self, actor: &Actor, rule_id: &RuleId) -> Result<CoordinationRule> {
        let rule = self
            .store
            .get_rule(rule_id)
            .await?
            .ok_or_else(|| Error::not_found(format!("rule {rule_id}")))?;
        if rule.organization_id != actor.organization_id {
            return Err(Error::permission(format!(
                "rule {rule_id} belongs to another organization"
            )));
        }
        Ok(rule)
    }

    async fn trigger_document(&self, document_id: &str) -> Result<DocumentRecord> {
        self.content
            .get_document(document_id)
            .await?
            .ok_or_else(|| Error::not_found(format!("document {document_id}")))
    }

    /// Flag a linked target so the next sync cycle pushes it.
    async fn mark_for_push(&self, document_id: &str, now: i64) {
        let result = async {
            if let Some(mut state) = self.store.get_sync_state(document_id).await? {
                if state.is_linked() {
                    state.mark_internal_edit(now);
                    self.store.save_sync_state(&state).await?;
                }
            }
            Ok::<_, Error>(())
        }
        .await;

        if let Err(error) = result {
            tracing::warn!(document_id, %error, "Could not mark cascade target for push");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    use async_trait::async_trait;
    use pretty_assertions::assert_eq;

    use crate::authz::RoleAuthorizer;
    use crate::models::{DocType, DocumentSyncState, NewRule, Role};

    /// Delegates to the store but refuses writes to some documents.
    struct FlakyContent {
        inner: StoreService,
        failing: HashSet<String>,
    }

    #[async_trait]
    impl ContentStore for FlakyContent {
        async fn get_document(&self, document_id: &str) -> Result<Option<DocumentRecord>> {
            self.inner.get_document(document_id).await
        }

        async fn list_opportunity_documents(
            &self,
            opportunity_id: &str,
        ) -> Result<Vec<DocumentRecord>> {
            self.inner.list_opportunity_documents(opportunity_id).await
        }

        async fn list_documents_by_type(
            &self,
            organization_id: &str,
            opportunity_id: &str,
            doc_type: DocType,
        ) -> Result<Vec<DocumentRecord>> {
            self.inner
                .list_documents_by_type(organization_id, opportunity_id, doc_type)
                .await
        }

        async fn write_field(
            &self,
            document_id: &str,
            field_path: &str,
            value: Value,
            updated_by: &str,
        ) -> Result<Option<Value>> {
            if self.failing.contains(document_id) {
                return Err(Error::Database(format!("{document_id} is read-only")));
            }
            self.inner
                .write_field(document_id, field_path, value, updated_by)
                .await
        }

        async fn replace_fields(
            &self,
            document_id: &str,
            fields: Value,
            updated_by: &str,
        ) -> Result<()> {
            self.inner
                .replace_fields(document_id, fields, updated_by)
                .await
        }
    }

    struct BrokenAudit;

    #[async_trait]
    impl AuditSink for BrokenAudit {
        async fn record(&self, _entry: AuditEntry) -> Result<()> {
            Err(Error::Database("audit_log is locked".to_string()))
        }
    }

    struct Fixture {
        store: StoreService,
        evaluator: CascadeEvaluator,
        rule: CoordinationRule,
    }

    fn editor() -> Actor {
        Actor::new("u-1", "Alice", Role::Editor, "org-1")
    }

    fn document(id: &str, doc_type: DocType, opportunity: &str, fields: Value) -> DocumentRecord {
        DocumentRecord {
            id: id.to_string(),
            organization_id: "org-1".to_string(),
            opportunity_id: opportunity.to_string(),
            doc_type,
            title: format!("{doc_type} {id}"),
            fields,
            updated_at: 0,
            updated_by: None,
        }
    }

    async fn fixture(failing: &[&str]) -> Fixture {
        let store = StoreService::open_in_memory().unwrap();
        let rule = NewRule {
            organization_id: "org-1".to_string(),
            source_doc_type: "cover_letter".to_string(),
            source_field_path: "contract_value".to_string(),
            target_doc_type: "technical_volume".to_string(),
            target_field_path: "header.contract_value".to_string(),
            transform_type: "format".to_string(),
            description: None,
        }
        .into_rule(1)
        .unwrap();
        store.insert_rule(&rule).await.unwrap();

        for doc in [
            document("cover-1", DocType::CoverLetter, "opp-1", json!({"contract_value": 4_500_000})),
            document(
                "tech-1",
                DocType::TechnicalVolume,
                "opp-1",
                json!({"header": {"contract_value": "$4,500,000"}}),
            ),
            document("tech-2", DocType::TechnicalVolume, "opp-1", json!({})),
            document(
                "tech-other",
                DocType::TechnicalVolume,
                "opp-2",
                json!({"header": {"contract_value": "$1"}}),
            ),
        ] {
            store.upsert_document(&doc).await.unwrap();
        }

        let content = Arc::new(FlakyContent {
            inner: store.clone(),
            failing: failing.iter().map(|id| (*id).to_string()).collect(),
        });
        let evaluator = CascadeEvaluator::new(
            store.clone(),
            content,
            Arc::new(store.clone()),
            Arc::new(RoleAuthorizer),
        );
        Fixture {
            store,
            evaluator,
            rule,
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn preview_reports_current_and_formatted_values() {
        let fx = fixture(&[]).await;

        let items = fx
            .evaluator
            .preview_cascade(&editor(), &fx.rule.id, "cover-1", &json!(5_000_000))
            .await
            .unwrap();

        assert_eq!(items.len(), 2);
        let tech = items.iter().find(|item| item.document_id == "tech-1").unwrap();
        assert_eq!(tech.current_value, Some(json!("$4,500,000")));
        assert_eq!(tech.new_value, json!("$5,000,000"));
        assert_eq!(tech.target_doc_type, DocType::TechnicalVolume);
        let empty = items.iter().find(|item| item.document_id == "tech-2").unwrap();
        assert_eq!(empty.current_value, None);
        assert!(items.iter().all(|item| item.document_id != "tech-other"));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn preview_is_read_only_and_repeatable() {
        let fx = fixture(&[]).await;
        let first = fx
            .evaluator
            .preview_cascade(&editor(), &fx.rule.id, "cover-1", &json!(5_000_000))
            .await
            .unwrap();
        let second = fx
            .evaluator
            .preview_cascade(&editor(), &fx.rule.id, "cover-1", &json!(5_000_000))
            .await
            .unwrap();
        assert_eq!(first, second);

        let tech = fx.store.get_document("tech-1").await.unwrap().unwrap();
        assert_eq!(tech.field("header.contract_value"), Some(&json!("$4,500,000")));
        assert!(fx.store.list_log_for_rule(&fx.rule.id, 10).await.unwrap().is_empty());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn apply_writes_transformed_value_and_logs() {
        let fx = fixture(&[]).await;

        let entry = fx
            .evaluator
            .apply_cascade(&editor(), &fx.rule.id, "cover-1", &json!(5_000_000))
            .await
            .unwrap();

        assert_eq!(entry.status, CascadeStatus::Applied);
        assert_eq!(entry.changes_applied.len(), 2);
        assert_eq!(entry.error_message, None);
        for id in ["tech-1", "tech-2"] {
            let doc = fx.store.get_document(id).await.unwrap().unwrap();
            assert_eq!(doc.field("header.contract_value"), Some(&json!("$5,000,000")));
        }

        let logged = fx.store.list_log_for_rule(&fx.rule.id, 10).await.unwrap();
        assert_eq!(logged, vec![entry.clone()]);
        let audit = fx
            .store
            .list_audit("coordination_log", &entry.id.as_str())
            .await
            .unwrap();
        assert_eq!(audit[0].action, "cascade.applied");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn partial_failure_is_logged_without_rollback() {
        let fx = fixture(&["tech-2"]).await;

        let entry = fx
            .evaluator
            .apply_cascade(&editor(), &fx.rule.id, "cover-1", &json!(5_000_000))
            .await
            .unwrap();

        assert_eq!(entry.status, CascadeStatus::Failed);
        assert_eq!(entry.failed_documents, vec!["tech-2".to_string()]);
        assert_eq!(entry.changes_applied.len(), 1);
        assert!(entry.error_message.unwrap().contains("tech-2"));

        let written = fx.store.get_document("tech-1").await.unwrap().unwrap();
        assert_eq!(written.field("header.contract_value"), Some(&json!("$5,000,000")));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn inactive_rule_is_rejected_by_apply() {
        let fx = fixture(&[]).await;
        let mut rule = fx.rule.clone();
        rule.is_active = false;
        fx.store.update_rule(&rule).await.unwrap();

        let err = fx
            .evaluator
            .apply_cascade(&editor(), &rule.id, "cover-1", &json!(5_000_000))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
        assert!(fx.store.list_log_for_rule(&rule.id, 10).await.unwrap().is_empty());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn inactive_rule_is_rejected_by_preview() {
        let fx = fixture(&[]).await;
        let mut rule = fx.rule.clone();
        rule.is_active = false;
        fx.store.update_rule(&rule).await.unwrap();

        let err = fx
            .evaluator
            .preview_cascade(&editor(), &rule.id, "cover-1", &json!(5_000_000))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn audit_failure_after_commit_still_returns_entry() {
        let fx = fixture(&[]).await;
        let evaluator = CascadeEvaluator::new(
            fx.store.clone(),
            Arc::new(fx.store.clone()),
            Arc::new(BrokenAudit),
            Arc::new(RoleAuthorizer),
        );

        let entry = evaluator
            .apply_cascade(&editor(), &fx.rule.id, "cover-1", &json!(5_000_000))
            .await
            .unwrap();
        assert_eq!(entry.status, CascadeStatus::Applied);

        let logged = fx.store.list_log_for_rule(&fx.rule.id, 10).await.unwrap();
        assert_eq!(logged, vec![entry]);
        let tech = fx.store.get_document("tech-1").await.unwrap().unwrap();
        assert_eq!(tech.field("header.contract_value"), Some(&json!("$5,000,000")));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn aggregate_rule_writes_the_sum_of_line_items() {
        let fx = fixture(&[]).await;
        let rule = NewRule {
            organization_id: "org-1".to_string(),
            source_doc_type: "pricing_volume".to_string(),
            source_field_path: "line_items".to_string(),
            target_doc_type: "cover_letter".to_string(),
            target_field_path: "total_price".to_string(),
            transform_type: "aggregate".to_string(),
            description: None,
        }
        .into_rule(2)
        .unwrap();
        fx.store.insert_rule(&rule).await.unwrap();
        let line_items = json!([{"amount": 1200}, {"amount": "800.50"}, {"amount": 99.5}]);
        fx.store
            .upsert_document(&document(
                "pricing-1",
                DocType::PricingVolume,
                "opp-1",
                json!({"line_items": line_items}),
            ))
            .await
            .unwrap();

        let entry = fx
            .evaluator
            .apply_cascade(&editor(), &rule.id, "pricing-1", &line_items)
            .await
            .unwrap();
        assert_eq!(entry.changes_applied.len(), 1);
        assert_eq!(entry.changes_applied[0].new_value, json!(2100));

        let cover = fx.store.get_document("cover-1").await.unwrap().unwrap();
        assert_eq!(cover.field("total_price"), Some(&json!(2100)));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn apply_marks_linked_targets_for_push() {
        let fx = fixture(&[]).await;
        let mut state = DocumentSyncState::idle("tech-1", "org-1");
        state.link("memory", "file-1", None).unwrap();
        fx.store.save_sync_state(&state).await.unwrap();

        fx.evaluator
            .apply_cascade(&editor(), &fx.rule.id, "cover-1", &json!(5_000_000))
            .await
            .unwrap();

        let state = fx.store.get_sync_state("tech-1").await.unwrap().unwrap();
        assert!(state.needs_push());
        assert_eq!(fx.store.get_sync_state("tech-2").await.unwrap(), None);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn viewers_cannot_apply() {
        let fx = fixture(&[]).await;
        let viewer = Actor::new("u-2", "Vic", Role::Viewer, "org-1");

        let err = fx
            .evaluator
            .apply_cascade(&viewer, &fx.rule.id, "cover-1", &json!(1))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Permission(_)));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn trigger_must_match_rule_source_type() {
        let fx = fixture(&[]).await;
        let err = fx
            .evaluator
            .preview_cascade(&editor(), &fx.rule.id, "tech-1", &json!(1))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn field_change_preview_finds_matching_rules() {
        let fx = fixture(&[]).await;
        let items = fx
            .evaluator
            .preview_field_change(&editor(), "cover-1", "contract_value", &json!(6_000_000))
            .await
            .unwrap();
        assert_eq!(items.len(), 2);
        assert!(items.iter().all(|item| item.new_value == json!("$6,000,000")));

        let none = fx
            .evaluator
            .preview_field_change(&editor(), "cover-1", "title", &json!("x"))
            .await
            .unwrap();
        assert!(none.is_empty());
    }
}
