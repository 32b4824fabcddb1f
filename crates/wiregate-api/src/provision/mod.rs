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

//! The provisioning engine: every mutation of peers, pools, users and the
//! server interface goes through [`Provisioner`].
//!
//! Mutations run under a single process-wide lock, in a fixed order:
//! database write, then files, then the kernel reload. Once the lock is held
//! the critical section runs on its own task, so a client hanging up cannot
//! leave the three stores half-updated. Read paths never take the lock.

mod peers;
mod pools;
mod server;
mod users;

use std::future::Future;
use std::sync::Arc;

use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};
use uuid::Uuid;

use crate::allocator::{AllocError, IpAllocator};
use crate::apply::{ApplyError, Applier};
use crate::db::models::{IpPool, ServerConfig};
use crate::db::{Store, StoreError};
use crate::keys::KeyError;
use crate::password::PasswordError;
use crate::policy::{Action, Actor, Policy, Resource, Scope};
use crate::render::{self, ClientContext, ClientDefaults, ConfigFiles, RenderError};
use crate::validate::FieldErrors;

pub use self::peers::MAX_AVAILABLE;
pub use self::server::BootstrapServer;
pub use self::users::BootstrapAdmin;

pub const MAX_BATCH: usize = 50;

#[derive(Debug, thiserror::Error)]
pub enum ProvisionError {
    #[error("validation failed: {0}")]
    Validation(FieldErrors),

    #[error("permission denied")]
    Forbidden,

    #[error("request cancelled")]
    Cancelled,

    #[error("invalid credentials")]
    InvalidCredentials,

    #[error("user not found")]
    UserNotFound,

    #[error("user is not active")]
    UserInactive,

    #[error("peer not found")]
    PeerNotFound,

    #[error("peer is disabled")]
    PeerDisabled,

    #[error("ip pool not found")]
    PoolNotFound,

    #[error("ip pool is referenced by peers")]
    PoolInUse,

    #[error("server interface is not configured")]
    ServerNotConfigured,

    #[error("batch holds more than {MAX_BATCH} items")]
    BatchTooLarge,

    #[error("batch is empty")]
    EmptyBatch,

    #[error("item {index}: {source}")]
    BatchItem {
        index: usize,
        #[source]
        source: Box<ProvisionError>,
    },

    #[error(transparent)]
    Alloc(#[from] AllocError),

    #[error("invalid key: {0}")]
    Key(#[from] KeyError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Render(#[from] RenderError),

    #[error(transparent)]
    Apply(#[from] ApplyError),

    #[error(transparent)]
    Password(#[from] PasswordError),

    #[error("internal error: {0}")]
    Internal(String),
}

impl From<FieldErrors> for ProvisionError {
    fn from(errs: FieldErrors) -> Self {
        Self::Validation(errs)
    }
}

impl ProvisionError {
    /// The error a caller should act on, with batch wrapping removed.
    pub fn root(&self) -> &ProvisionError {
        match self {
            Self::BatchItem { source, .. } => source.root(),
            other => other,
        }
    }
}

pub type Result<T> = std::result::Result<T, ProvisionError>;

/// Tags errors with their item index when more than one item was submitted.
fn at_index(index: usize, batch: bool) -> impl FnOnce(ProvisionError) -> ProvisionError {
    move |err| {
        if batch {
            ProvisionError::BatchItem {
                index,
                source: Box::new(err),
            }
        } else {
            err
        }
    }
}

fn check_batch(len: usize) -> Result<()> {
    match len {
        0 => Err(ProvisionError::EmptyBatch),
        n if n > MAX_BATCH => Err(ProvisionError::BatchTooLarge),
        _ => Ok(()),
    }
}

/// File and kernel effects to carry out once the database write committed.
#[derive(Debug, Default)]
struct Publish {
    write_clients: Vec<Uuid>,
    remove_peer_dirs: Vec<(String, Uuid)>,
    remove_user_dirs: Vec<String>,
    server: bool,
}

pub struct Provisioner<S, A> {
    store: Arc<S>,
    applier: A,
    policy: Arc<Policy>,
    files: ConfigFiles,
    defaults: ClientDefaults,
    lock: Arc<Mutex<()>>,
}

impl<S: Store, A: Applier> Provisioner<S, A> {
    pub fn new(
        store: Arc<S>,
        applier: A,
        policy: Arc<Policy>,
        files: ConfigFiles,
        defaults: ClientDefaults,
    ) -> Self {
        Self {
            store,
            applier,
            policy,
            files,
            defaults,
            lock: Arc::new(Mutex::new(())),
        }
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    pub fn policy(&self) -> &Policy {
        &self.policy
    }

    pub fn files(&self) -> &ConfigFiles {
        &self.files
    }

    // -- Locking -------------------------------------------------------------

    /// Runs `f` under the server lock on a detached task. Cancellation is
    /// honoured only while waiting for the lock.
    async fn exclusive<T, F, Fut>(self: &Arc<Self>, cancel: &CancellationToken, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(Arc<Self>) -> Fut + Send + 'static,
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        let guard = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                debug!("cancelled before acquiring the server lock");
                return Err(ProvisionError::Cancelled);
            }
            guard = Arc::clone(&self.lock).lock_owned() => guard,
        };

        let this = Arc::clone(self);
        tokio::spawn(async move {
            let _guard = guard;
            f(this).await
        })
        .await
        .map_err(|e| {
            error!(error = %e, "critical section panicked");
            ProvisionError::Internal("critical section aborted".into())
        })?
    }

    // -- Authorization -------------------------------------------------------

    fn authorize(
        &self,
        actor: &Actor,
        resource: Resource,
        owner: Option<Uuid>,
        action: Action,
    ) -> Result<()> {
        let scope = owner.map_or(Scope::Any, |owner| actor.scope_for(owner));
        if self.policy.check(actor, resource, scope, action) {
            Ok(())
        } else {
            debug!(user_id = %actor.user_id, ?resource, ?scope, %action, "denied");
            Err(ProvisionError::Forbidden)
        }
    }

    // -- Shared lookups ------------------------------------------------------

    async fn require_server(&self) -> Result<ServerConfig> {
        self.store
            .get_server()
            .await?
            .ok_or(ProvisionError::ServerNotConfigured)
    }

    /// Fetches a pool and makes sure its reservations are in `alloc`.
    async fn track_pool(&self, alloc: &mut IpAllocator, pool_id: Uuid) -> Result<IpPool> {
        let pool = self
            .store
            .get_pool(pool_id)
            .await?
            .ok_or(ProvisionError::PoolNotFound)?;
        if !alloc.is_loaded(pool_id) {
            let taken = self.store.allocated_addresses(pool_id).await?;
            alloc.load(pool_id, pool.cidr, pool.is_active(), taken)?;
        }
        Ok(pool)
    }

    // -- Publishing ----------------------------------------------------------

    /// Carries out file and kernel effects after a commit. Failures here are
    /// logged; the database already holds the truth and [`Self::reconcile`]
    /// can redo the work.
    async fn publish(&self, operation: &'static str, effects: Publish) -> Result<()> {
        self.publish_inner(&effects).await.inspect_err(|e| {
            error!(operation, error = %e, "post-commit publish failed");
        })
    }

    async fn publish_inner(&self, effects: &Publish) -> Result<()> {
        for (username, peer_id) in &effects.remove_peer_dirs {
            self.files.remove_peer_dir(username, *peer_id).await?;
        }
        for username in &effects.remove_user_dirs {
            self.files.remove_user_dir(username).await?;
        }

        if effects.write_clients.is_empty() && !effects.server {
            return Ok(());
        }

        let server = self.require_server().await?;
        let server_public_key = server.public_key()?;
        let ctx = ClientContext {
            server: &server,
            server_public_key: &server_public_key,
            defaults: &self.defaults,
        };

        for peer_id in &effects.write_clients {
            let Some(peer) = self.store.get_peer(*peer_id).await? else {
                continue;
            };
            if !peer.is_active() || peer.client_ip.is_none() {
                continue;
            }
            let owner = self
                .store
                .get_user(peer.user_id)
                .await?
                .ok_or(ProvisionError::UserNotFound)?;
            let pool = match peer.ip_pool_id {
                Some(id) => self.store.get_pool(id).await?,
                None => None,
            };
            let conf = render::render_client(&peer, pool.as_ref(), &ctx)?;
            self.files.write_client(&owner.username, &peer, &conf).await?;
        }

        if effects.server {
            let peers = self.store.list_active_peers().await?;
            let text = render::render_server(&server, &peers);
            self.files.write_server(&text).await?;
            self.applier.apply().await?;
        }
        Ok(())
    }

    /// Rebuilds every derived artifact from the database and reloads.
    async fn publish_everything(&self, operation: &'static str) -> Result<()> {
        let peers = self.store.list_active_peers().await?;
        let effects = Publish {
            write_clients: peers.iter().map(|p| p.peer.id).collect(),
            server: true,
            ..Publish::default()
        };
        self.publish(operation, effects).await
    }

    /// Re-renders and re-applies everything under the lock.
    #[tracing::instrument(skip(self, cancel))]
    pub async fn reconcile(self: &Arc<Self>, cancel: &CancellationToken) -> Result<()> {
        self.exclusive(cancel, |this| async move {
            this.publish_everything("reconcile").await
        })
        .await
    }

    pub async fn reconcile_as(self: &Arc<Self>, actor: Actor, cancel: &CancellationToken) -> Result<()> {
        self.authorize(&actor, Resource::WgServer, None, Action::Apply)?;
        self.reconcile(cancel).await
    }
}
