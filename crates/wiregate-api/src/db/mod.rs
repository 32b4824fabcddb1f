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

//! Persistence. The database is the source of truth; every file on disk and
//! the kernel interface are derived from what these stores return.

pub mod memory;
pub mod models;
pub mod postgres;

use std::future::Future;
use std::net::Ipv4Addr;

use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;
use uuid::Uuid;

use self::models::{IpPool, Peer, PeerFilter, PeerWithOwner, ServerConfig, User};

pub use self::memory::MemoryStore;
pub use self::postgres::PgStore;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("username already taken")]
    DuplicateUsername,

    #[error("email already taken")]
    DuplicateEmail,

    #[error("public key already registered")]
    DuplicatePublicKey,

    #[error("device name already used by this owner")]
    DuplicateDeviceName,

    #[error("pool name already taken")]
    DuplicatePoolName,

    #[error("pool cidr equals or overlaps an existing pool")]
    DuplicatePoolCidr,

    #[error("address already allocated")]
    AddressInUse,

    #[error("pool is referenced by peers")]
    PoolInUse,

    #[error("key encryption/decryption failed")]
    KeyEncryption,

    #[error("corrupt row: {0}")]
    Corrupt(String),
}

pub type Result<T> = std::result::Result<T, StoreError>;

pub trait UserStore: Send + Sync + 'static {
    fn is_empty(&self) -> impl Future<Output = Result<bool>> + Send;

    fn create_user(&self, user: &User) -> impl Future<Output = Result<()>> + Send;

    fn get_user(&self, id: Uuid) -> impl Future<Output = Result<Option<User>>> + Send;

    fn get_user_by_username(
        &self,
        username: &str,
    ) -> impl Future<Output = Result<Option<User>>> + Send;

    /// Every user except soft-deleted ones, oldest first.
    fn list_users(&self) -> impl Future<Output = Result<Vec<User>>> + Send;

    /// Persists every mutable column of `user` and bumps `updated_at`.
    fn update_user(&self, user: &User) -> impl Future<Output = Result<User>> + Send;

    /// `hard`: delete the user together with peers and allocations.
    /// Otherwise mark the user deleted and disable every peer they own,
    /// releasing addresses. One transaction either way.
    fn retire_user(&self, id: Uuid, hard: bool) -> impl Future<Output = Result<()>> + Send;
}

pub trait WgStore: Send + Sync + 'static {
    fn get_server(&self) -> impl Future<Output = Result<Option<ServerConfig>>> + Send;

    fn save_server(&self, server: &ServerConfig) -> impl Future<Output = Result<()>> + Send;

    fn insert_pools(&self, pools: &[IpPool]) -> impl Future<Output = Result<()>> + Send;

    fn get_pool(&self, id: Uuid) -> impl Future<Output = Result<Option<IpPool>>> + Send;

    fn list_pools(&self) -> impl Future<Output = Result<Vec<IpPool>>> + Send;

    fn update_pools(&self, pools: &[IpPool]) -> impl Future<Output = Result<()>> + Send;

    fn delete_pools(&self, ids: &[Uuid]) -> impl Future<Output = Result<()>> + Send;

    /// Whether any peer, active or disabled, references the pool.
    fn pool_in_use(&self, id: Uuid) -> impl Future<Output = Result<bool>> + Send;

    fn allocated_addresses(
        &self,
        pool_id: Uuid,
    ) -> impl Future<Output = Result<Vec<Ipv4Addr>>> + Send;

    /// Inserts peers and, for those holding an address, their allocation rows.
    fn insert_peers(&self, peers: &[Peer]) -> impl Future<Output = Result<()>> + Send;

    fn get_peer(&self, id: Uuid) -> impl Future<Output = Result<Option<Peer>>> + Send;

    fn list_peers(&self, filter: &PeerFilter) -> impl Future<Output = Result<Vec<Peer>>> + Send;

    fn list_active_peers(&self) -> impl Future<Output = Result<Vec<PeerWithOwner>>> + Send;

    /// Rewrites peers and re-derives their allocation rows.
    fn update_peers(&self, peers: &[Peer]) -> impl Future<Output = Result<()>> + Send;

    fn delete_peers(&self, ids: &[Uuid]) -> impl Future<Output = Result<()>> + Send;
}

pub trait Store: UserStore + WgStore {}

impl<T: UserStore + WgStore> Store for T {}

pub async fn create_pool(database_url: &str) -> std::result::Result<PgPool, sqlx::Error> {
    PgPoolOptions::new()
        .max_connections(8)
        .connect(database_url)
        .await
}

pub async fn migrate(pool: &PgPool) -> std::result::Result<(), sqlx::migrate::MigrateError> {
    sqlx::migrate!("./migrations").run(pool).await
}
