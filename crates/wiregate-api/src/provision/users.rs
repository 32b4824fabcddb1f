// Copyright (C) 2025 Joseph Sacchini
//
// This program is free software: you can redistribute it and/or modify it under
// the terms of the GNU Affero General Public License as published by the Free
// Software Foundation, version 3.
//
// This program is distributed in the hope that it will be useful, but WITHOUT
// ANY WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS
// FOR A PARTICULAR PURPOSE. See the GNU Affero General Public License for more
// details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.

//! Account operations. Only deletion touches WireGuard state and takes the
//! server lock; the rest are plain database writes.

use std::sync::Arc;

use chrono::Utc;
use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;
use wiregate_types::api::{ChangePasswordRequest, CreateUserRequest, UpdateUserRequest};
use wiregate_types::{PeerStatus, Role, UserStatus};

use super::{Provisioner, ProvisionError, Publish, Result};
use crate::apply::Applier;
use crate::db::Store;
use crate::db::models::{PeerFilter, User};
use crate::password;
use crate::policy::{Action, Actor, Resource, Scope};
use crate::validate::FieldErrors;

/// Administrator created on first start when the user table is empty.
#[derive(Debug, Clone, Deserialize)]
pub struct BootstrapAdmin {
    pub username: String,
    pub email: String,
    pub password: String,
}

fn check_status(errs: &mut FieldErrors, status: Option<UserStatus>) {
    if status == Some(UserStatus::Deleted) {
        errs.add_with("status", "oneof", &[("values", "active inactive".into())]);
    }
}

impl<S: Store, A: Applier> Provisioner<S, A> {
    async fn find_user(&self, username: &str) -> Result<User> {
        self.store
            .get_user_by_username(username)
            .await?
            .filter(|user| user.status != UserStatus::Deleted)
            .ok_or(ProvisionError::UserNotFound)
    }

    /// Public sign-up when `actor` is `None`; an admin may also choose the
    /// role and status of the new account.
    #[tracing::instrument(skip(self, req), fields(username = %req.username))]
    pub async fn register(&self, actor: Option<&Actor>, req: CreateUserRequest) -> Result<User> {
        let mut errs = FieldErrors::validate(&req);
        check_status(&mut errs, req.status);
        errs.finish()?;

        let privileged = actor.is_some_and(|actor| {
            self.policy
                .check(actor, Resource::User, Scope::Any, Action::Create)
        });
        let (role, status) = if privileged {
            (
                req.role.unwrap_or(Role::User),
                req.status.unwrap_or(UserStatus::Active),
            )
        } else {
            (Role::User, UserStatus::Active)
        };

        let now = Utc::now();
        let user = User {
            id: Uuid::new_v4(),
            username: req.username,
            nickname: req.nickname.trim().to_string(),
            avatar: req.avatar.trim().to_string(),
            email: req.email.trim().to_string(),
            password_hash: password::hash_password(&req.password)?,
            role,
            status,
            created_at: now,
            updated_at: now,
        };
        self.store.create_user(&user).await?;
        info!(user_id = %user.id, %role, "registered user");
        Ok(user)
    }

    /// Checks credentials. Unknown users and wrong passwords look the same.
    #[tracing::instrument(skip(self, password))]
    pub async fn login(&self, username: &str, password: &str) -> Result<User> {
        let Some(user) = self.store.get_user_by_username(username).await? else {
            return Err(ProvisionError::InvalidCredentials);
        };
        if !password::verify_password(&user.password_hash, password)? {
            warn!("failed login");
            return Err(ProvisionError::InvalidCredentials);
        }
        if !user.is_active() {
            return Err(ProvisionError::UserInactive);
        }
        Ok(user)
    }

    pub async fn get_user(&self, actor: &Actor, username: &str) -> Result<User> {
        let user = self.find_user(username).await?;
        self.authorize(actor, Resource::User, Some(user.id), Action::Read)?;
        Ok(user)
    }

    pub async fn list_users(&self, actor: &Actor) -> Result<Vec<User>> {
        self.authorize(actor, Resource::User, None, Action::List)?;
        Ok(self.store.list_users().await?)
    }

    #[tracing::instrument(skip(self, patch), fields(user_id = %actor.user_id))]
    pub async fn update_user(
        &self,
        actor: &Actor,
        username: &str,
        patch: UpdateUserRequest,
    ) -> Result<User> {
        let mut user = self.find_user(username).await?;
        self.authorize(actor, Resource::User, Some(user.id), Action::Update)?;
        if patch.role.is_some() || patch.status.is_some() || patch.password.is_some() {
            self.authorize(actor, Resource::User, Some(user.id), Action::UpdateSensitive)?;
        }

        let mut errs = FieldErrors::validate(&patch);
        check_status(&mut errs, patch.status);
        errs.finish()?;

        if let Some(nickname) = patch.nickname {
            user.nickname = nickname.trim().to_string();
        }
        if let Some(avatar) = patch.avatar {
            user.avatar = avatar.trim().to_string();
        }
        if let Some(email) = patch.email {
            user.email = email.trim().to_string();
        }
        if let Some(role) = patch.role {
            user.role = role;
        }
        if let Some(status) = patch.status {
            user.status = status;
        }
        if let Some(password) = patch.password {
            user.password_hash = password::hash_password(&password)?;
        }

        let user = self.store.update_user(&user).await?;
        info!(target_id = %user.id, "updated user");
        Ok(user)
    }

    /// Owners must prove the old password; admins resetting someone else's
    /// password need not.
    #[tracing::instrument(skip(self, req), fields(user_id = %actor.user_id))]
    pub async fn change_password(
        &self,
        actor: &Actor,
        username: &str,
        req: ChangePasswordRequest,
    ) -> Result<()> {
        let mut user = self.find_user(username).await?;
        self.authorize(actor, Resource::User, Some(user.id), Action::ChangePassword)?;

        let mut errs = FieldErrors::validate(&req);
        errs.rename("new_password", "newPassword");
        let own = actor.user_id == user.id;
        let old = req.old_password.as_deref().unwrap_or_default();
        if own && old.is_empty() {
            errs.add("oldPassword", "required");
        }
        errs.finish()?;

        if own && !password::verify_password(&user.password_hash, old)? {
            return Err(FieldErrors::single("oldPassword", "mismatch").into());
        }

        user.password_hash = password::hash_password(&req.new_password)?;
        self.store.update_user(&user).await?;
        info!(target_id = %user.id, "changed password");
        Ok(())
    }

    /// Self-removal is soft: the account is marked deleted and its peers are
    /// disabled. An admin removing someone else deletes everything.
    #[tracing::instrument(skip(self, cancel), fields(user_id = %actor.user_id))]
    pub async fn remove_user(
        self: &Arc<Self>,
        actor: Actor,
        username: &str,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let user = self.find_user(username).await?;
        self.authorize(&actor, Resource::User, Some(user.id), Action::Delete)?;
        let hard = actor.user_id != user.id;

        self.exclusive(cancel, move |this| async move {
            let mut effects = Publish {
                server: true,
                ..Publish::default()
            };
            if hard {
                effects.remove_user_dirs.push(user.username.clone());
            } else {
                let filter = PeerFilter {
                    status: Some(PeerStatus::Active),
                    ..PeerFilter::owned_by(user.id)
                };
                let peers = this.store.list_peers(&filter).await?;
                effects
                    .remove_peer_dirs
                    .extend(peers.iter().map(|p| (user.username.clone(), p.id)));
            }

            this.store.retire_user(user.id, hard).await?;
            info!(target_id = %user.id, hard, "removed user");
            this.publish("remove_user", effects).await
        })
        .await
    }

    /// Creates the configured administrator if nobody has an account yet.
    pub async fn bootstrap_admin(&self, admin: &BootstrapAdmin) -> Result<Option<User>> {
        if !self.store.is_empty().await? {
            return Ok(None);
        }
        let req = CreateUserRequest {
            username: admin.username.clone(),
            email: admin.email.clone(),
            password: admin.password.clone(),
            nickname: admin.username.clone(),
            avatar: String::new(),
            role: Some(Role::Admin),
            status: Some(UserStatus::Active),
        };
        let system = Actor {
            user_id: Uuid::nil(),
            role: Role::Admin,
        };
        let user = self.register(Some(&system), req).await?;
        info!(username = %user.username, "bootstrapped administrator");
        Ok(Some(user))
    }
}
