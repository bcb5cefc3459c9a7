//! Role-based authorization for engine operations.

use async_trait::async_trait;

use crate::error::{Error, Result};
use crate::models::{Actor, Permission, Role};

/// Decides whether an actor may perform an operation.
#[async_trait]
pub trait Authorizer: Send + Sync {
    async fn authorize(&self, actor: &Actor, permission: Permission) -> Result<()>;

    /// `authorize`, plus the actor must belong to `organization_id`.
    async fn authorize_in(
        &self,
        actor: &Actor,
        permission: Permission,
        organization_id: &str,
    ) -> Result<()> {
        if actor.organization_id != organization_id {
            tracing::warn!(
                user_id = %actor.user_id,
                organization_id,
                permission = permission.as_str(),
                "Cross-organization access denied"
            );
            return Err(Error::permission(format!(
                "{} is not a member of organization {organization_id}",
                actor.user_id
            )));
        }
        self.authorize(actor, permission).await
    }
}

/// Static role table: viewers read only, editors author, admins do everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct RoleAuthorizer;

impl RoleAuthorizer {
    pub const fn allows(role: Role, permission: Permission) -> bool {
        match role {
            Role::Viewer => false,
            Role::Editor => matches!(
                permission,
                Permission::EditRules | Permission::ApplyCascade | Permission::ResolveConflicts
            ),
            Role::Admin => true,
        }
    }
}

#[async_trait]
impl Authorizer for RoleAuthorizer {
    async fn authorize(&self, actor: &Actor, permission: Permission) -> Result<()> {
        if Self::allows(actor.role, permission) {
            return Ok(());
        }
        tracing::warn!(
            user_id = %actor.user_id,
            role = actor.role.as_str(),
            permission = permission.as_str(),
            "Permission denied"
        );
        Err(Error::permission(format!(
            "role {} cannot {}",
            actor.role,
            permission.as_str()
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn actor(role: Role) -> Actor {
        Actor::new("u-1", "Alice", role, "org-1")
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn viewers_are_read_only() {
        let err = RoleAuthorizer
            .authorize(&actor(Role::Viewer), Permission::EditRules)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Permission(_)));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn editors_cannot_manage_sync() {
        let editor = actor(Role::Editor);
        RoleAuthorizer
            .authorize(&editor, Permission::ApplyCascade)
            .await
            .unwrap();
        RoleAuthorizer
            .authorize(&editor, Permission::ResolveConflicts)
            .await
            .unwrap();
        assert!(RoleAuthorizer
            .authorize(&editor, Permission::ManageSync)
            .await
            .is_err());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn organization_scope_is_enforced() {
        let admin = actor(Role::Admin);
        RoleAuthorizer
            .authorize_in(&admin, Permission::ManageSync, "org-1")
            .await
            .unwrap();
        let err = RoleAuthorizer
            .authorize_in(&admin, Permission::ManageSync, "org-2")
            .await
            .unwrap_err();
        assert!(err.to_string().contains("org-2"));
    }
}
