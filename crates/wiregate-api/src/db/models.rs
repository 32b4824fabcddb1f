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

use chrono::{DateTime, Utc};
use ipnetwork::Ipv4Network;
use uuid::Uuid;
use wiregate_types::api::{PeerResponse, PoolResponse, ServerConfigResponse, UserResponse};
use wiregate_types::{PeerStatus, PoolStatus, Role, UserStatus};

use crate::allocator::host_cidr;
use crate::keys::{self, KeyError};

// ---------------------------------------------------------------------------
// Users
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct User {
    pub id: Uuid,
    pub username: String,
    pub nickname: String,
    pub avatar: String,
    pub email: String,
    pub password_hash: String,
    pub role: Role,
    pub status: UserStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl User {
    pub fn is_active(&self) -> bool {
        self.status == UserStatus::Active
    }
}

impl From<&User> for UserResponse {
    fn from(user: &User) -> Self {
        Self {
            id: user.id,
            username: user.username.clone(),
            nickname: user.nickname.clone(),
            avatar: user.avatar.clone(),
            email: user.email.clone(),
            role: user.role,
            status: user.status,
            created_at: user.created_at,
            updated_at: user.updated_at,
        }
    }
}

// ---------------------------------------------------------------------------
// IP pools
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub struct IpPool {
    pub id: Uuid,
    pub name: String,
    pub cidr: Ipv4Network,
    pub routes: String,
    pub dns: String,
    pub endpoint: String,
    pub description: String,
    pub status: PoolStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl IpPool {
    pub fn is_active(&self) -> bool {
        self.status == PoolStatus::Active
    }
}

impl From<&IpPool> for PoolResponse {
    fn from(pool: &IpPool) -> Self {
        Self {
            id: pool.id,
            name: pool.name.clone(),
            cidr: pool.cidr.to_string(),
            routes: pool.routes.clone(),
            dns: pool.dns.clone(),
            endpoint: pool.endpoint.clone(),
            description: pool.description.clone(),
            status: pool.status,
            created_at: pool.created_at,
            updated_at: pool.updated_at,
        }
    }
}

// ---------------------------------------------------------------------------
// Peers
// ---------------------------------------------------------------------------

/// A client device. `private_key` is plaintext here; stores encrypt it.
#[derive(Clone, PartialEq)]
pub struct Peer {
    pub id: Uuid,
    pub user_id: Uuid,
    pub device_name: String,
    pub private_key: String,
    pub public_key: String,
    pub client_ip: Option<Ipv4Addr>,
    pub allowed_ips: String,
    pub dns: String,
    pub endpoint: String,
    pub persistent_keepalive: u16,
    pub status: PeerStatus,
    pub ip_pool_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Peer {
    pub fn is_active(&self) -> bool {
        self.status == PeerStatus::Active
    }
}

impl std::fmt::Debug for Peer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Peer")
            .field("id", &self.id)
            .field("user_id", &self.user_id)
            .field("device_name", &self.device_name)
            .field("public_key", &self.public_key)
            .field("client_ip", &self.client_ip)
            .field("status", &self.status)
            .field("ip_pool_id", &self.ip_pool_id)
            .finish_non_exhaustive()
    }
}

impl From<&Peer> for PeerResponse {
    fn from(peer: &Peer) -> Self {
        Self {
            id: peer.id,
            user_id: peer.user_id,
            device_name: peer.device_name.clone(),
            public_key: peer.public_key.clone(),
            client_ip: peer.client_ip.map(host_cidr),
            allowed_ips: peer.allowed_ips.clone(),
            dns: peer.dns.clone(),
            endpoint: peer.endpoint.clone(),
            persistent_keepalive: peer.persistent_keepalive,
            status: peer.status,
            ip_pool_id: peer.ip_pool_id,
            created_at: peer.created_at,
            updated_at: peer.updated_at,
        }
    }
}

/// An active peer joined with its owner's username, as the server file needs.
#[derive(Debug, Clone)]
pub struct PeerWithOwner {
    pub peer: Peer,
    pub username: String,
}

#[derive(Debug, Clone, Default)]
pub struct PeerFilter {
    pub user_id: Option<Uuid>,
    pub ip_pool_id: Option<Uuid>,
    pub status: Option<PeerStatus>,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

impl PeerFilter {
    pub fn owned_by(user_id: Uuid) -> Self {
        Self {
            user_id: Some(user_id),
            ..Self::default()
        }
    }

    pub fn matches(&self, peer: &Peer) -> bool {
        self.user_id.is_none_or(|id| peer.user_id == id)
            && self.ip_pool_id.is_none_or(|id| peer.ip_pool_id == Some(id))
            && self.status.is_none_or(|s| peer.status == s)
    }
}

// ---------------------------------------------------------------------------
// Server interface
// ---------------------------------------------------------------------------

#[derive(Clone, PartialEq)]
pub struct ServerConfig {
    pub address: Ipv4Network,
    pub listen_port: u16,
    pub private_key: String,
    pub mtu: u16,
    pub post_up: String,
    pub post_down: String,
    pub public_host: String,
    pub dns: String,
    pub updated_at: DateTime<Utc>,
}

impl ServerConfig {
    pub fn host_ip(&self) -> Ipv4Addr {
        self.address.ip()
    }

    pub fn public_key(&self) -> Result<String, KeyError> {
        keys::derive_public(&self.private_key)
    }

    /// `public_host:listen_port`, or `None` when no public host is known.
    pub fn endpoint(&self) -> Option<String> {
        let host = self.public_host.trim();
        (!host.is_empty()).then(|| format!("{host}:{}", self.listen_port))
    }

    pub fn to_response(&self) -> Result<ServerConfigResponse, KeyError> {
        Ok(ServerConfigResponse {
            address: self.address.to_string(),
            listen_port: self.listen_port,
            public_key: self.public_key()?,
            mtu: self.mtu,
            post_up: self.post_up.clone(),
            post_down: self.post_down.clone(),
            public_host: self.public_host.clone(),
            dns: self.dns.clone(),
            updated_at: self.updated_at,
        })
    }
}

impl std::fmt::Debug for ServerConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerConfig")
            .field("address", &self.address)
            .field("listen_port", &self.listen_port)
            .field("mtu", &self.mtu)
            .field("public_host", &self.public_host)
            .finish_non_exhaustive()
    }
}
