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

use std::net::Ipv4Addr;

use aes_gcm::aead::{Aead, OsRng};
use aes_gcm::{AeadCore, Aes256Gcm, KeyInit, Nonce};
use chrono::{DateTime, Utc};
use ipnetwork::{IpNetwork, Ipv4Network};
use sqlx::{PgPool, Postgres, Transaction};
use uuid::Uuid;

use super::models::{IpPool, Peer, PeerFilter, PeerWithOwner, ServerConfig, User};
use super::{Result, StoreError, UserStore, WgStore};
use crate::keys;

// ---------------------------------------------------------------------------
// Rows
// ---------------------------------------------------------------------------

#[derive(Debug, sqlx::FromRow)]
struct UserRow {
    id: Uuid,
    username: String,
    nickname: String,
    avatar: String,
    email: String,
    password_hash: String,
    role: String,
    status: String,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

#[derive(Debug, sqlx::FromRow)]
struct PoolRow {
    id: Uuid,
    name: String,
    cidr: IpNetwork,
    routes: String,
    dns: String,
    endpoint: String,
    description: String,
    status: String,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

#[derive(Debug, sqlx::FromRow)]
struct PeerRow {
    id: Uuid,
    user_id: Uuid,
    device_name: String,
    private_key_enc: Vec<u8>,
    private_key_nonce: Vec<u8>,
    public_key: String,
    client_ip: Option<IpNetwork>,
    allowed_ips: String,
    dns: String,
    endpoint: String,
    persistent_keepalive: i32,
    status: String,
    ip_pool_id: Option<Uuid>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

#[derive(Debug, sqlx::FromRow)]
struct PeerOwnerRow {
    #[sqlx(flatten)]
    peer: PeerRow,
    username: String,
}

#[derive(Debug, sqlx::FromRow)]
struct ServerRow {
    address: IpNetwork,
    listen_port: i32,
    private_key_enc: Vec<u8>,
    private_key_nonce: Vec<u8>,
    mtu: i32,
    post_up: String,
    post_down: String,
    public_host: String,
    dns: String,
    updated_at: DateTime<Utc>,
}

fn corrupt(what: impl std::fmt::Display) -> StoreError {
    StoreError::Corrupt(what.to_string())
}

fn parse_column<T: std::str::FromStr>(value: &str) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    value.parse().map_err(corrupt)
}

fn v4(net: IpNetwork) -> Result<Ipv4Network> {
    match net {
        IpNetwork::V4(v4) => Ok(v4),
        IpNetwork::V6(v6) => Err(corrupt(format!("unexpected IPv6 value {v6}"))),
    }
}

fn host_net(ip: Ipv4Addr) -> IpNetwork {
    IpNetwork::V4(Ipv4Network::from(ip))
}

fn small(value: i32) -> Result<u16> {
    u16::try_from(value).map_err(corrupt)
}

impl TryFrom<UserRow> for User {
    type Error = StoreError;

    fn try_from(row: UserRow) -> Result<Self> {
        Ok(Self {
            id: row.id,
            username: row.username,
            nickname: row.nickname,
            avatar: row.avatar,
            email: row.email,
            password_hash: row.password_hash,
            role: parse_column(&row.role)?,
            status: parse_column(&row.status)?,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

impl TryFrom<PoolRow> for IpPool {
    type Error = StoreError;

    fn try_from(row: PoolRow) -> Result<Self> {
        Ok(Self {
            id: row.id,
            name: row.name,
            cidr: v4(row.cidr)?,
            routes: row.routes,
            dns: row.dns,
            endpoint: row.endpoint,
            description: row.description,
            status: parse_column(&row.status)?,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

/// Maps constraint violations to typed conflicts.
fn map_constraint(err: sqlx::Error) -> StoreError {
    let constraint = match &err {
        sqlx::Error::Database(db_err) => db_err.constraint().map(str::to_owned),
        _ => None,
    };
    match constraint.as_deref() {
        Some("users_username_key") => StoreError::DuplicateUsername,
        Some("users_email_key") => StoreError::DuplicateEmail,
        Some("ip_pools_name_key") => StoreError::DuplicatePoolName,
        Some("ip_pools_cidr_key" | "ip_pools_cidr_excl") => StoreError::DuplicatePoolCidr,
        Some("wg_peers_public_key_key") => StoreError::DuplicatePublicKey,
        Some("wg_peers_user_id_device_name_key") => StoreError::DuplicateDeviceName,
        Some("wg_peers_client_ip_key" | "ip_allocations_pkey") => StoreError::AddressInUse,
        Some("wg_peers_ip_pool_id_fkey" | "ip_allocations_pool_id_fkey") => StoreError::PoolInUse,
        _ => StoreError::Database(err),
    }
}

// ---------------------------------------------------------------------------
// PgStore
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
    encryption_key: [u8; 32],
}

impl PgStore {
    pub fn new(pool: PgPool, encryption_key: [u8; 32]) -> Self {
        Self {
            pool,
            encryption_key,
        }
    }

    // -- Encryption helpers --------------------------------------------------

    fn encrypt_private_key(&self, private_key: &str) -> Result<(Vec<u8>, Vec<u8>)> {
        let plaintext = keys::decode_key(private_key).map_err(|_| StoreError::KeyEncryption)?;
        let cipher = Aes256Gcm::new_from_slice(&self.encryption_key)
            .map_err(|_| StoreError::KeyEncryption)?;
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let ciphertext = cipher
            .encrypt(&nonce, plaintext.as_slice())
            .map_err(|_| StoreError::KeyEncryption)?;
        Ok((ciphertext, nonce.to_vec()))
    }

    fn decrypt_private_key(&self, ciphertext: &[u8], nonce_bytes: &[u8]) -> Result<String> {
        let cipher = Aes256Gcm::new_from_slice(&self.encryption_key)
            .map_err(|_| StoreError::KeyEncryption)?;
        let nonce =
            Nonce::from_exact_iter(nonce_bytes.iter().copied()).ok_or(StoreError::KeyEncryption)?;
        let plaintext = cipher
            .decrypt(&nonce, ciphertext)
            .map_err(|_| StoreError::KeyEncryption)?;
        let bytes: [u8; keys::KEY_LEN] = plaintext
            .as_slice()
            .try_into()
            .map_err(|_| StoreError::KeyEncryption)?;
        Ok(keys::encode_key(&bytes))
    }

    fn peer_from_row(&self, row: PeerRow) -> Result<Peer> {
        Ok(Peer {
            private_key: self.decrypt_private_key(&row.private_key_enc, &row.private_key_nonce)?,
            id: row.id,
            user_id: row.user_id,
            device_name: row.device_name,
            public_key: row.public_key,
            client_ip: row.client_ip.map(v4).transpose()?.map(|net| net.ip()),
            allowed_ips: row.allowed_ips,
            dns: row.dns,
            endpoint: row.endpoint,
            persistent_keepalive: small(row.persistent_keepalive)?,
            status: parse_column(&row.status)?,
            ip_pool_id: row.ip_pool_id,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }

    // -- Peer helpers --------------------------------------------------------

    async fn insert_allocation(tx: &mut Transaction<'_, Postgres>, peer: &Peer) -> Result<()> {
        let (Some(ip), Some(pool_id)) = (peer.client_ip, peer.ip_pool_id) else {
            return Ok(());
        };
        sqlx::query("INSERT INTO ip_allocations (pool_id, ip, peer_id) VALUES ($1, $2, $3)")
            .bind(pool_id)
            .bind(i64::from(u32::from(ip)))
            .bind(peer.id)
            .execute(&mut **tx)
            .await
            .map_err(map_constraint)?;
        Ok(())
    }
}

impl UserStore for PgStore {
    #[tracing::instrument(skip(self))]
    async fn is_empty(&self) -> Result<bool> {
        let row: (bool,) = sqlx::query_as("SELECT NOT EXISTS (SELECT 1 FROM users)")
            .fetch_one(&self.pool)
            .await?;
        Ok(row.0)
    }

    #[tracing::instrument(skip(self, user), fields(username = %user.username))]
    async fn create_user(&self, user: &User) -> Result<()> {
        sqlx::query(
            "INSERT INTO users
                 (id, username, nickname, avatar, email, password_hash, role, status, created_at, updated_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)",
        )
        .bind(user.id)
        .bind(&user.username)
        .bind(&user.nickname)
        .bind(&user.avatar)
        .bind(&user.email)
        .bind(&user.password_hash)
        .bind(user.role.as_str())
        .bind(user.status.as_str())
        .bind(user.created_at)
        .bind(user.updated_at)
        .execute(&self.pool)
        .await
        .map_err(map_constraint)?;
        Ok(())
    }

    #[tracing::instrument(skip(self))]
    async fn get_user(&self, id: Uuid) -> Result<Option<User>> {
        sqlx::query_as::<_, UserRow>("SELECT * FROM users WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .map(User::try_from)
            .transpose()
    }

    #[tracing::instrument(skip(self))]
    async fn get_user_by_username(&self, username: &str) -> Result<Option<User>> {
        sqlx::query_as::<_, UserRow>("SELECT * FROM users WHERE username = $1")
            .bind(username)
            .fetch_optional(&self.pool)
            .await?
            .map(User::try_from)
            .transpose()
    }

    #[tracing::instrument(skip(self))]
    async fn list_users(&self) -> Result<Vec<User>> {
        sqlx::query_as::<_, UserRow>(
            "SELECT * FROM users WHERE status <> 'deleted' ORDER BY created_at, id",
        )
        .fetch_all(&self.pool)
        .await?
        .into_iter()
        .map(User::try_from)
        .collect()
    }

    #[tracing::instrument(skip(self, user), fields(user_id = %user.id))]
    async fn update_user(&self, user: &User) -> Result<User> {
        sqlx::query_as::<_, UserRow>(
            "UPDATE users
             SET nickname = $2, avatar = $3, email = $4, password_hash = $5,
                 role = $6, status = $7, updated_at = now()
             WHERE id = $1
             RETURNING *",
        )
        .bind(user.id)
        .bind(&user.nickname)
        .bind(&user.avatar)
        .bind(&user.email)
        .bind(&user.password_hash)
        .bind(user.role.as_str())
        .bind(user.status.as_str())
        .fetch_one(&self.pool)
        .await
        .map_err(map_constraint)?
        .try_into()
    }

    #[tracing::instrument(skip(self))]
    async fn retire_user(&self, id: Uuid, hard: bool) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        if hard {
            sqlx::query("DELETE FROM users WHERE id = $1")
                .bind(id)
                .execute(&mut *tx)
                .await?;
        } else {
            sqlx::query(
                "DELETE FROM ip_allocations
                 WHERE peer_id IN (SELECT id FROM wg_peers WHERE user_id = $1)",
            )
            .bind(id)
            .execute(&mut *tx)
            .await?;
            sqlx::query(
                "UPDATE wg_peers SET status = 'disabled', client_ip = NULL, updated_at = now()
                 WHERE user_id = $1",
            )
            .bind(id)
            .execute(&mut *tx)
            .await?;
            sqlx::query("UPDATE users SET status = 'deleted', updated_at = now() WHERE id = $1")
                .bind(id)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(())
    }
}

impl WgStore for PgStore {
    // -- Server --------------------------------------------------------------

    #[tracing::instrument(skip(self))]
    async fn get_server(&self) -> Result<Option<ServerConfig>> {
        let Some(row) = sqlx::query_as::<_, ServerRow>("SELECT * FROM wg_server WHERE id = 1")
            .fetch_optional(&self.pool)
            .await?
        else {
            return Ok(None);
        };

        Ok(Some(ServerConfig {
            private_key: self.decrypt_private_key(&row.private_key_enc, &row.private_key_nonce)?,
            address: v4(row.address)?,
            listen_port: small(row.listen_port)?,
            mtu: small(row.mtu)?,
            post_up: row.post_up,
            post_down: row.post_down,
            public_host: row.public_host,
            dns: row.dns,
            updated_at: row.updated_at,
        }))
    }

    #[tracing::instrument(skip(self, server))]
    async fn save_server(&self, server: &ServerConfig) -> Result<()> {
        let (enc, nonce) = self.encrypt_private_key(&server.private_key)?;
        sqlx::query(
            "INSERT INTO wg_server
                 (id, address, listen_port, private_key_enc, private_key_nonce,
                  mtu, post_up, post_down, public_host, dns, updated_at)
             VALUES (1, $1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
             ON CONFLICT (id) DO UPDATE SET
                 address = EXCLUDED.address,
                 listen_port = EXCLUDED.listen_port,
                 private_key_enc = EXCLUDED.private_key_enc,
                 private_key_nonce = EXCLUDED.private_key_nonce,
                 mtu = EXCLUDED.mtu,
                 post_up = EXCLUDED.post_up,
                 post_down = EXCLUDED.post_down,
                 public_host = EXCLUDED.public_host,
                 dns = EXCLUDED.dns,
                 updated_at = EXCLUDED.updated_at",
        )
        .bind(IpNetwork::V4(server.address))
        .bind(i32::from(server.listen_port))
        .bind(&enc)
        .bind(&nonce)
        .bind(i32::from(server.mtu))
        .bind(&server.post_up)
        .bind(&server.post_down)
        .bind(&server.public_host)
        .bind(&server.dns)
        .bind(server.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    // -- Pools ---------------------------------------------------------------

    #[tracing::instrument(skip(self, pools), fields(count = pools.len()))]
    async fn insert_pools(&self, pools: &[IpPool]) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        for pool in pools {
            sqlx::query(
                "INSERT INTO ip_pools
                     (id, name, cidr, routes, dns, endpoint, description, status, created_at, updated_at)
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)",
            )
            .bind(pool.id)
            .bind(&pool.name)
            .bind(IpNetwork::V4(pool.cidr))
            .bind(&pool.routes)
            .bind(&pool.dns)
            .bind(&pool.endpoint)
            .bind(&pool.description)
            .bind(pool.status.as_str())
            .bind(pool.created_at)
            .bind(pool.updated_at)
            .execute(&mut *tx)
            .await
            .map_err(map_constraint)?;
        }
        tx.commit().await?;
        Ok(())
    }

    #[tracing::instrument(skip(self))]
    async fn get_pool(&self, id: Uuid) -> Result<Option<IpPool>> {
        sqlx::query_as::<_, PoolRow>("SELECT * FROM ip_pools WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .map(IpPool::try_from)
            .transpose()
    }

    #[tracing::instrument(skip(self))]
    async fn list_pools(&self) -> Result<Vec<IpPool>> {
        sqlx::query_as::<_, PoolRow>("SELECT * FROM ip_pools ORDER BY cidr")
            .fetch_all(&self.pool)
            .await?
            .into_iter()
            .map(IpPool::try_from)
            .collect()
    }

    #[tracing::instrument(skip(self, pools), fields(count = pools.len()))]
    async fn update_pools(&self, pools: &[IpPool]) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        for pool in pools {
            sqlx::query(
                "UPDATE ip_pools
                 SET name = $2, cidr = $3, routes = $4, dns = $5, endpoint = $6,
                     description = $7, status = $8, updated_at = $9
                 WHERE id = $1",
            )
            .bind(pool.id)
            .bind(&pool.name)
            .bind(IpNetwork::V4(pool.cidr))
            .bind(&pool.routes)
            .bind(&pool.dns)
            .bind(&pool.endpoint)
            .bind(&pool.description)
            .bind(pool.status.as_str())
            .bind(pool.updated_at)
            .execute(&mut *tx)
            .await
            .map_err(map_constraint)?;
        }
        tx.commit().await?;
        Ok(())
    }

    #[tracing::instrument(skip(self))]
    async fn delete_pools(&self, ids: &[Uuid]) -> Result<()> {
        sqlx::query("DELETE FROM ip_pools WHERE id = ANY($1)")
            .bind(ids)
            .execute(&self.pool)
            .await
            .map_err(map_constraint)?;
        Ok(())
    }

    #[tracing::instrument(skip(self))]
    async fn pool_in_use(&self, id: Uuid) -> Result<bool> {
        let row: (bool,) =
            sqlx::query_as("SELECT EXISTS (SELECT 1 FROM wg_peers WHERE ip_pool_id = $1)")
                .bind(id)
                .fetch_one(&self.pool)
                .await?;
        Ok(row.0)
    }

    #[tracing::instrument(skip(self))]
    async fn allocated_addresses(&self, pool_id: Uuid) -> Result<Vec<Ipv4Addr>> {
        let rows: Vec<(i64,)> =
            sqlx::query_as("SELECT ip FROM ip_allocations WHERE pool_id = $1 ORDER BY ip")
                .bind(pool_id)
                .fetch_all(&self.pool)
                .await?;
        rows.into_iter()
            .map(|(ip,)| u32::try_from(ip).map(Ipv4Addr::from).map_err(corrupt))
            .collect()
    }

    // -- Peers ---------------------------------------------------------------

    #[tracing::instrument(skip(self, peers), fields(count = peers.len()))]
    async fn insert_peers(&self, peers: &[Peer]) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        for peer in peers {
            let (enc, nonce) = self.encrypt_private_key(&peer.private_key)?;
            sqlx::query(
                "INSERT INTO wg_peers
                     (id, user_id, device_name, private_key_enc, private_key_nonce, public_key,
                      client_ip, allowed_ips, dns, endpoint, persistent_keepalive, status,
                      ip_pool_id, created_at, updated_at)
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15)",
            )
            .bind(peer.id)
            .bind(peer.user_id)
            .bind(&peer.device_name)
            .bind(&enc)
            .bind(&nonce)
            .bind(&peer.public_key)
            .bind(peer.client_ip.map(host_net))
            .bind(&peer.allowed_ips)
            .bind(&peer.dns)
            .bind(&peer.endpoint)
            .bind(i32::from(peer.persistent_keepalive))
            .bind(peer.status.as_str())
            .bind(peer.ip_pool_id)
            .bind(peer.created_at)
            .bind(peer.updated_at)
            .execute(&mut *tx)
            .await
            .map_err(map_constraint)?;

            Self::insert_allocation(&mut tx, peer).await?;
        }
        tx.commit().await?;
        Ok(())
    }

    #[tracing::instrument(skip(self))]
    async fn get_peer(&self, id: Uuid) -> Result<Option<Peer>> {
        sqlx::query_as::<_, PeerRow>("SELECT * FROM wg_peers WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .map(|row| self.peer_from_row(row))
            .transpose()
    }

    #[tracing::instrument(skip(self))]
    async fn list_peers(&self, filter: &PeerFilter) -> Result<Vec<Peer>> {
        sqlx::query_as::<_, PeerRow>(
            "SELECT * FROM wg_peers
             WHERE ($1::uuid IS NULL OR user_id = $1)
               AND ($2::uuid IS NULL OR ip_pool_id = $2)
               AND ($3::text IS NULL OR status = $3)
             ORDER BY created_at, id
             LIMIT $4 OFFSET $5",
        )
        .bind(filter.user_id)
        .bind(filter.ip_pool_id)
        .bind(filter.status.map(|s| s.as_str()))
        .bind(filter.limit)
        .bind(filter.offset)
        .fetch_all(&self.pool)
        .await?
        .into_iter()
        .map(|row| self.peer_from_row(row))
        .collect()
    }

    #[tracing::instrument(skip(self))]
    async fn list_active_peers(&self) -> Result<Vec<PeerWithOwner>> {
        sqlx::query_as::<_, PeerOwnerRow>(
            "SELECT p.*, u.username
             FROM wg_peers p
             JOIN users u ON u.id = p.user_id
             WHERE p.status = 'active' AND p.client_ip IS NOT NULL
             ORDER BY p.client_ip",
        )
        .fetch_all(&self.pool)
        .await?
        .into_iter()
        .map(|row| {
            Ok(PeerWithOwner {
                peer: self.peer_from_row(row.peer)?,
                username: row.username,
            })
        })
        .collect()
    }

    #[tracing::instrument(skip(self, peers), fields(count = peers.len()))]
    async fn update_peers(&self, peers: &[Peer]) -> Result<()> {
        let ids: Vec<Uuid> = peers.iter().map(|p| p.id).collect();
        let mut tx = self.pool.begin().await?;

        // Addresses may move between peers of the same batch.
        sqlx::query("DELETE FROM ip_allocations WHERE peer_id = ANY($1)")
            .bind(&ids)
            .execute(&mut *tx)
            .await?;
        sqlx::query("UPDATE wg_peers SET client_ip = NULL WHERE id = ANY($1)")
            .bind(&ids)
            .execute(&mut *tx)
            .await?;

        for peer in peers {
            let (enc, nonce) = self.encrypt_private_key(&peer.private_key)?;
            sqlx::query(
                "UPDATE wg_peers
                 SET user_id = $2, device_name = $3, private_key_enc = $4, private_key_nonce = $5,
                     public_key = $6, client_ip = $7, allowed_ips = $8, dns = $9, endpoint = $10,
                     persistent_keepalive = $11, status = $12, ip_pool_id = $13, updated_at = $14
                 WHERE id = $1",
            )
            .bind(peer.id)
            .bind(peer.user_id)
            .bind(&peer.device_name)
            .bind(&enc)
            .bind(&nonce)
            .bind(&peer.public_key)
            .bind(peer.client_ip.map(host_net))
            .bind(&peer.allowed_ips)
            .bind(&peer.dns)
            .bind(&peer.endpoint)
            .bind(i32::from(peer.persistent_keepalive))
            .bind(peer.status.as_str())
            .bind(peer.ip_pool_id)
            .bind(peer.updated_at)
            .execute(&mut *tx)
            .await
            .map_err(map_constraint)?;

            Self::insert_allocation(&mut tx, peer).await?;
        }

        tx.commit().await?;
        Ok(())
    }

    #[tracing::instrument(skip(self))]
    async fn delete_peers(&self, ids: &[Uuid]) -> Result<()> {
        sqlx::query("DELETE FROM wg_peers WHERE id = ANY($1)")
            .bind(ids)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}
