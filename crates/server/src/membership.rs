// Workspace role resolution.
//
// Membership is owned by the surrounding application; this store only reads it (and lets
// tests and tooling seed it).

use std::{collections::HashMap, sync::Arc};

use anyhow::{anyhow, Context};
use sqlx::PgPool;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::{
    auth::middleware::{AuthenticatedUser, WorkspaceRole},
    error::CollabError,
};

/// A caller resolved against one target workspace.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Actor {
    pub user_id: Uuid,
    pub workspace_id: Uuid,
    /// `None` when the caller is not a member of `workspace_id`.
    pub role: Option<WorkspaceRole>,
}

impl Actor {
    pub fn new(user_id: Uuid, workspace_id: Uuid, role: Option<WorkspaceRole>) -> Self {
        Self { user_id, workspace_id, role }
    }

    pub fn require(&self, required: WorkspaceRole) -> Result<(), CollabError> {
        match self.role {
            Some(role) if role.allows(required) => Ok(()),
            _ => Err(CollabError::Forbidden(match required {
                WorkspaceRole::Viewer => "workspace membership required",
                WorkspaceRole::Editor => "editor role required",
                WorkspaceRole::Admin => "workspace admin role required",
            })),
        }
    }
}

#[derive(Clone)]
pub enum MembershipStore {
    Postgres(PgPool),
    Memory(Arc<RwLock<HashMap<(Uuid, Uuid), WorkspaceRole>>>),
}

impl MembershipStore {
    pub fn in_memory() -> Self {
        Self::Memory(Arc::default())
    }

    pub async fn role_for_user(
        &self,
        workspace_id: Uuid,
        user_id: Uuid,
    ) -> anyhow::Result<Option<WorkspaceRole>> {
        match self {
            Self::Postgres(pool) => {
                let role = sqlx::query_scalar::<_, String>(
                    r#"
                    SELECT role
                    FROM workspace_members
                    WHERE workspace_id = $1
                      AND user_id = $2
                    "#,
                )
                .bind(workspace_id)
                .bind(user_id)
                .fetch_optional(pool)
                .await
                .context("failed to load workspace role")?;

                role.map(|role| {
                    WorkspaceRole::from_db_value(&role)
                        .ok_or_else(|| anyhow!("invalid workspace role '{role}' in database"))
                })
                .transpose()
            }
            Self::Memory(roles) => Ok(roles.read().await.get(&(workspace_id, user_id)).copied()),
        }
    }

    /// Effective role of `user` in `workspace_id`; platform admins are admins everywhere.
    pub async fn effective_role(
        &self,
        user: &AuthenticatedUser,
        workspace_id: Uuid,
    ) -> anyhow::Result<Option<WorkspaceRole>> {
        if user.app_admin {
            return Ok(Some(WorkspaceRole::Admin));
        }
        self.role_for_user(workspace_id, user.user_id).await
    }

    pub async fn resolve_actor(
        &self,
        user: &AuthenticatedUser,
        workspace_id: Uuid,
    ) -> anyhow::Result<Actor> {
        let role = self.effective_role(user, workspace_id).await?;
        Ok(Actor::new(user.user_id, workspace_id, role))
    }

    pub async fn grant(
        &self,
        workspace_id: Uuid,
        user_id: Uuid,
        role: WorkspaceRole,
    ) -> anyhow::Result<()> {
        match self {
            Self::Postgres(pool) => {
                sqlx::query(
                    r#"
                    INSERT INTO workspace_members (workspace_id, user_id, role)
                    VALUES ($1, $2, $3)
                    ON CONFLICT (workspace_id, user_id) DO UPDATE SET role = EXCLUDED.role
                    "#,
                )
                .bind(workspace_id)
                .bind(user_id)
                .bind(role.as_db_value())
                .execute(pool)
                .await
                .context("failed to grant workspace role")?;
                Ok(())
            }
            Self::Memory(roles) => {
                roles.write().await.insert((workspace_id, user_id), role);
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{Actor, MembershipStore};
    use crate::{
        auth::middleware::{AuthenticatedUser, WorkspaceRole},
        error::CollabError,
    };
    use uuid::Uuid;

    #[tokio::test]
    async fn roles_are_scoped_per_workspace() {
        let store = MembershipStore::in_memory();
        let user_id = Uuid::new_v4();
        let workspace_a = Uuid::new_v4();
        let workspace_b = Uuid::new_v4();
        store.grant(workspace_a, user_id, WorkspaceRole::Editor).await.expect("grant");

        assert_eq!(
            store.role_for_user(workspace_a, user_id).await.expect("lookup"),
            Some(WorkspaceRole::Editor)
        );
        assert_eq!(store.role_for_user(workspace_b, user_id).await.expect("lookup"), None);
    }

    #[tokio::test]
    async fn app_admins_are_admins_in_every_workspace() {
        let store = MembershipStore::in_memory();
        let admin = AuthenticatedUser {
            user_id: Uuid::new_v4(),
            workspace_id: Uuid::new_v4(),
            app_admin: true,
        };

        assert_eq!(
            store.effective_role(&admin, Uuid::new_v4()).await.expect("lookup"),
            Some(WorkspaceRole::Admin)
        );
    }

    #[tokio::test]
    async fn non_members_resolve_without_a_role() {
        let store = MembershipStore::in_memory();
        let user = AuthenticatedUser {
            user_id: Uuid::new_v4(),
            workspace_id: Uuid::new_v4(),
            app_admin: false,
        };
        let actor = store.resolve_actor(&user, Uuid::new_v4()).await.expect("resolve");

        assert_eq!(actor.role, None);
        assert!(matches!(actor.require(WorkspaceRole::Viewer), Err(CollabError::Forbidden(_))));
    }

    #[test]
    fn require_checks_role_order() {
        let editor = Actor::new(Uuid::new_v4(), Uuid::new_v4(), Some(WorkspaceRole::Editor));

        assert!(editor.require(WorkspaceRole::Viewer).is_ok());
        assert!(editor.require(WorkspaceRole::Editor).is_ok());
        assert!(matches!(
            editor.require(WorkspaceRole::Admin),
            Err(CollabError::Forbidden("workspace admin role required"))
        ));
    }
}
