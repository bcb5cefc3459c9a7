//! Coordination rule catalog with audit trail.

use std::sync::Arc;

use serde_json::json;

use crate::authz::Authorizer;
use crate::error::{Error, Result};
use crate::models::{
    Actor, AuditEntry, CoordinationRule, DocType, NewRule, Permission, RuleId, RuleUpdate,
};
use crate::services::{AuditSink, StoreService};
use crate::util::now_millis;

const RULE_ENTITY: &str = "coordination_rule";

/// CRUD over coordination rules. Every mutation is permission-checked first
/// and leaves an audit entry behind.
#[derive(Clone)]
pub struct RuleStore {
    store: StoreService,
    audit: Arc<dyn AuditSink>,
    authorizer: Arc<dyn Authorizer>,
}

impl RuleStore {
    pub fn new(
        store: StoreService,
        audit: Arc<dyn AuditSink>,
        authorizer: Arc<dyn Authorizer>,
    ) -> Self {
        Self {
            store,
            audit,
            authorizer,
        }
    }

    pub async fn create_rule(&self, actor: &Actor, input: NewRule) -> Result<CoordinationRule> {
        self.authorizer
            .authorize_in(actor, Permission::EditRules, input.organization_id.trim())
            .await?;

        let rule = input.into_rule(now_millis())?;
        self.store.insert_rule(&rule).await?;

        tracing::info!(
            rule_id = %rule.id,
            organization_id = %rule.organization_id,
            "Created coordination rule"
        );
        self.audit
            .record(AuditEntry::new(
                "rule.created",
                RULE_ENTITY,
                rule.id.as_str(),
                &actor.user_id,
                json!({
                    "source_doc_type": rule.source_doc_type,
                    "target_doc_type": rule.target_doc_type,
                    "transform_type": rule.transform_type,
                }),
            ))
            .await?;
        Ok(rule)
    }

    /// Apply a partial update. The audit entry names the changed fields only.
    pub async fn update_rule(
        &self,
        actor: &Actor,
        id: &RuleId,
        update: RuleUpdate,
    ) -> Result<CoordinationRule> {
        self.authorizer
            .authorize(actor, Permission::EditRules)
            .await?;
        if update.is_empty() {
            return Err(Error::validation("rule update contains no fields"));
        }

        let mut rule = self.owned_rule(actor, id).await?;
        let changed_fields = update.apply_to(&mut rule, now_millis())?;
        self.store.update_rule(&rule).await?;

        tracing::info!(rule_id = %rule.id, ?changed_fields, "Updated coordination rule");
        self.audit
            .record(AuditEntry::new(
                "rule.updated",
                RULE_ENTITY,
                rule.id.as_str(),
                &actor.user_id,
                json!({ "changed_fields": changed_fields }),
            ))
            .await?;
        Ok(rule)
    }

    /// Soft delete: the rule stays on record with `is_active = false`.
    pub async fn delete_rule(&self, actor: &Actor, id: &RuleId) -> Result<CoordinationRule> {
        self.authorizer
            .authorize(actor, Permission::EditRules)
            .await?;

        let mut rule = self.owned_rule(actor, id).await?;
        rule.is_active = false;
        rule.updated_at = now_millis();
        self.store.update_rule(&rule).await?;

        tracing::info!(rule_id = %rule.id, "Deactivated coordination rule");
        self.audit
            .record(AuditEntry::new(
                "rule.deleted",
                RULE_ENTITY,
                rule.id.as_str(),
                &actor.user_id,
                json!({ "is_active": false }),
            ))
            .await?;
        Ok(rule)
    }

    /// Rule by id, active or not.
    pub async fn get_rule(&self, id: &RuleId) -> Result<CoordinationRule> {
        self.store
            .get_rule(id)
            .await?
            .ok_or_else(|| Error::not_found(format!("rule {id}")))
    }

    /// Every rule of an organization, newest first.
    pub async fn get_rules_by_organization(
        &self,
        organization_id: &str,
    ) -> Result<Vec<CoordinationRule>> {
        self.store.list_rules(organization_id).await
    }

    /// Active rules triggered by a change to `doc_type.field_path`.
    pub async fn rules_for_source(
        &self,
        organization_id: &str,
        doc_type: DocType,
        field_path: &str,
    ) -> Result<Vec<CoordinationRule>> {
        self.store
            .list_active_rules_for_source(organization_id, doc_type, field_path.trim())
            .await
    }

    async fn owned_rule(&self, actor: &Actor, id: &RuleId) -> Result<CoordinationRule> {
        let rule = self.get_rule(id).await?;
        if rule.organization_id != actor.organization_id {
            return Err(Error::permission(format!(
                "rule {id} belongs to another organization"
            )));
        }
        Ok(rule)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::authz::RoleAuthorizer;
    use crate::models::{Role, TransformType};
    use pretty_assertions::assert_eq;

    fn rule_store() -> (RuleStore, StoreService) {
        let store = StoreService::open_in_memory().unwrap();
        let rules = RuleStore::new(
            store.clone(),
            Arc::new(store.clone()),
            Arc::new(RoleAuthorizer),
        );
        (rules, store)
    }

    fn editor() -> Actor {
        Actor::new("u-1", "Alice", Role::Editor, "org-1")
    }

    fn new_rule() -> NewRule {
        NewRule {
            organization_id: "org-1".to_string(),
            source_doc_type: "cover_letter".to_string(),
            source_field_path: "contract_value".to_string(),
            target_doc_type: "technical_volume".to_string(),
            target_field_path: "header.contract_value".to_string(),
            transform_type: "format".to_string(),
            description: Some("Keep the headline value in step".to_string()),
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn create_persists_and_audits() {
        let (rules, store) = rule_store();
        let rule = rules.create_rule(&editor(), new_rule()).await.unwrap();

        assert!(rule.is_active);
        assert_eq!(rules.get_rule(&rule.id).await.unwrap(), rule);

        let audit = store
            .list_audit(RULE_ENTITY, &rule.id.as_str())
            .await
            .unwrap();
        assert_eq!(audit.len(), 1);
        assert_eq!(audit[0].action, "rule.created");
        assert_eq!(audit[0].details["transform_type"], "format");
        assert_eq!(audit[0].details["source_doc_type"], "cover_letter");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn create_rejects_self_loop_and_unknown_types() {
        let (rules, _) = rule_store();

        let mut looped = new_rule();
        looped.target_doc_type = "cover_letter".to_string();
        looped.target_field_path = "contract_value".to_string();
        assert!(matches!(
            rules.create_rule(&editor(), looped).await.unwrap_err(),
            Error::Validation(_)
        ));

        let mut unknown = new_rule();
        unknown.target_doc_type = "white_paper".to_string();
        assert!(matches!(
            rules.create_rule(&editor(), unknown).await.unwrap_err(),
            Error::Validation(_)
        ));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn viewers_cannot_create_rules() {
        let (rules, store) = rule_store();
        let viewer = Actor::new("u-9", "Val", Role::Viewer, "org-1");

        let err = rules.create_rule(&viewer, new_rule()).await.unwrap_err();
        assert!(matches!(err, Error::Permission(_)));
        assert!(store.list_rules("org-1").await.unwrap().is_empty());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn update_changes_only_supplied_fields() {
        let (rules, store) = rule_store();
        let created = rules.create_rule(&editor(), new_rule()).await.unwrap();

        let updated = rules
            .update_rule(
                &editor(),
                &created.id,
                RuleUpdate {
                    transform_type: Some("copy".to_string()),
                    ..RuleUpdate::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(updated.transform_type, TransformType::Copy);
        assert_eq!(updated.target_field_path, created.target_field_path);
        assert_eq!(updated.description, created.description);

        let audit = store
            .list_audit(RULE_ENTITY, &created.id.as_str())
            .await
            .unwrap();
        let entry = audit
            .iter()
            .find(|entry| entry.action == "rule.updated")
            .unwrap();
        assert_eq!(entry.details, json!({"changed_fields": ["transform_type"]}));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn update_that_creates_self_loop_is_rejected() {
        let (rules, _) = rule_store();
        let created = rules.create_rule(&editor(), new_rule()).await.unwrap();

        let err = rules
            .update_rule(
                &editor(),
                &created.id,
                RuleUpdate {
                    target_doc_type: Some("cover_letter".to_string()),
                    target_field_path: Some("contract_value".to_string()),
                    ..RuleUpdate::default()
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
        assert_eq!(rules.get_rule(&created.id).await.unwrap(), created);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn update_of_missing_rule_is_not_found() {
        let (rules, _) = rule_store();
        let err = rules
            .update_rule(
                &editor(),
                &RuleId::new(),
                RuleUpdate {
                    is_active: Some(false),
                    ..RuleUpdate::default()
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn delete_is_soft() {
        let (rules, _) = rule_store();
        let created = rules.create_rule(&editor(), new_rule()).await.unwrap();

        rules.delete_rule(&editor(), &created.id).await.unwrap();

        let stored = rules.get_rule(&created.id).await.unwrap();
        assert!(!stored.is_active);
        assert_eq!(rules.get_rules_by_organization("org-1").await.unwrap().len(), 1);
        assert!(rules
            .rules_for_source("org-1", DocType::CoverLetter, "contract_value")
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn other_organizations_cannot_touch_rules() {
        let (rules, _) = rule_store();
        let created = rules.create_rule(&editor(), new_rule()).await.unwrap();
        let outsider = Actor::new("u-7", "Eve", Role::Admin, "org-2");

        let err = rules.delete_rule(&outsider, &created.id).await.unwrap_err();
        assert!(matches!(err, Error::Permission(_)));
        assert!(rules.get_rule(&created.id).await.unwrap().is_active);
    }
}
