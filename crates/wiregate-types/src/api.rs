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

//! Request and response bodies of the `/api/v1` surface.
//!
//! Patch-style requests use `Option` for every field: an absent field is left
//! unchanged, an empty string clears a free-form text field.
//!
//! Request bodies derive [`Validate`] for their shape rules (lengths, ranges,
//! email, printable text). Address, CIDR and key checks happen server side.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use validator::{Validate, ValidationError};

use crate::{PeerStatus, PoolStatus, Role, UserStatus};

// ---------------------------------------------------------------------------
// Authentication
// ---------------------------------------------------------------------------

/// `POST /api/v1/login`
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct LoginRequest {
    /// Account username.
    #[validate(length(max = 128))]
    pub username: String,
    /// Plaintext password.
    #[validate(length(max = 128))]
    pub password: String,
}

/// Successful login.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenResponse {
    /// Bearer token for the `Authorization` header.
    pub token: String,
}

// ---------------------------------------------------------------------------
// Users
// ---------------------------------------------------------------------------

/// `POST /api/v1/users`. `role` and `status` are honoured only for admins.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct CreateUserRequest {
    /// Unique login name.
    #[validate(custom(function = "username"), length(min = 3, max = 32))]
    pub username: String,
    /// Unique email address.
    #[validate(custom(function = "not_blank"), email, length(max = 254))]
    pub email: String,
    /// Initial password.
    #[validate(length(min = 8, max = 128))]
    pub password: String,
    /// Display name.
    #[serde(default)]
    #[validate(custom(function = "single_line"), length(max = 64))]
    pub nickname: String,
    /// Avatar URL.
    #[serde(default)]
    #[validate(custom(function = "single_line"), length(max = 1024))]
    pub avatar: String,
    /// Requested role (admin callers only).
    #[serde(default)]
    pub role: Option<Role>,
    /// Requested status (admin callers only).
    #[serde(default)]
    pub status: Option<UserStatus>,
}

/// `PUT /api/v1/users/{username}`. `role`, `status` and `password` require
/// administrative rights.
#[derive(Debug, Clone, Default, Serialize, Deserialize, Validate)]
pub struct UpdateUserRequest {
    /// New display name.
    #[serde(default)]
    #[validate(custom(function = "single_line"), length(max = 64))]
    pub nickname: Option<String>,
    /// New avatar URL.
    #[serde(default)]
    #[validate(custom(function = "single_line"), length(max = 1024))]
    pub avatar: Option<String>,
    /// New email address.
    #[serde(default)]
    #[validate(custom(function = "not_blank"), email, length(max = 254))]
    pub email: Option<String>,
    /// New role.
    #[serde(default)]
    pub role: Option<Role>,
    /// New status.
    #[serde(default)]
    pub status: Option<UserStatus>,
    /// Password reset without the old password.
    #[serde(default)]
    #[validate(length(min = 8, max = 128))]
    pub password: Option<String>,
}

/// `POST /api/v1/users/{username}/password`.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct ChangePasswordRequest {
    /// Current password; required when changing one's own password.
    #[serde(default, alias = "old_password")]
    pub old_password: Option<String>,
    /// Replacement password.
    #[serde(alias = "new_password")]
    #[validate(length(min = 8, max = 128))]
    pub new_password: String,
}

/// Public view of an account.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserResponse {
    /// Stable opaque identifier.
    pub id: Uuid,
    /// Login name.
    pub username: String,
    /// Display name.
    pub nickname: String,
    /// Avatar URL.
    pub avatar: String,
    /// Email address.
    pub email: String,
    /// Account role.
    pub role: Role,
    /// Account status.
    pub status: UserStatus,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Last modification time.
    pub updated_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// IP pools
// ---------------------------------------------------------------------------

/// `POST /api/v1/wg/ip-pools`
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct CreatePoolRequest {
    /// Unique pool name.
    #[validate(custom(function = "self::name"), length(max = 64))]
    pub name: String,
    /// IPv4 prefix, e.g. `100.100.100.0/24`.
    pub cidr: String,
    /// Comma-separated CIDRs pushed to clients as `AllowedIPs`.
    #[serde(default)]
    pub routes: String,
    /// Comma-separated DNS servers.
    #[serde(default)]
    pub dns: String,
    /// `host:port` clients dial.
    #[serde(default)]
    pub endpoint: String,
    /// Free-form description.
    #[serde(default)]
    #[validate(custom(function = "single_line"), length(max = 1024))]
    pub description: String,
    /// Initial status, `active` when omitted.
    #[serde(default)]
    pub status: Option<PoolStatus>,
}

/// `PUT /api/v1/wg/ip-pools/{id}`
#[derive(Debug, Clone, Default, Serialize, Deserialize, Validate)]
pub struct UpdatePoolRequest {
    /// New name.
    #[serde(default)]
    #[validate(custom(function = "self::name"), length(max = 64))]
    pub name: Option<String>,
    /// New CIDR; rejected while any peer references the pool.
    #[serde(default)]
    pub cidr: Option<String>,
    /// New client routes.
    #[serde(default)]
    pub routes: Option<String>,
    /// New DNS servers.
    #[serde(default)]
    pub dns: Option<String>,
    /// New endpoint.
    #[serde(default)]
    pub endpoint: Option<String>,
    /// New description.
    #[serde(default)]
    #[validate(custom(function = "single_line"), length(max = 1024))]
    pub description: Option<String>,
    /// New status.
    #[serde(default)]
    pub status: Option<PoolStatus>,
}

/// One item of `PUT /api/v1/wg/ip-pools/batch`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchUpdatePoolItem {
    /// Pool to update.
    pub id: Uuid,
    /// Fields to change.
    #[serde(flatten)]
    pub patch: UpdatePoolRequest,
}

/// View of an IP pool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolResponse {
    /// Pool identifier.
    pub id: Uuid,
    /// Unique name.
    pub name: String,
    /// Normalised IPv4 prefix.
    pub cidr: String,
    /// Client routes.
    pub routes: String,
    /// DNS servers.
    pub dns: String,
    /// Client endpoint override.
    pub endpoint: String,
    /// Description.
    pub description: String,
    /// Status.
    pub status: PoolStatus,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Last modification time.
    pub updated_at: DateTime<Utc>,
}

/// `GET /api/v1/wg/ip-pools/{id}/available-ips`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AvailableIpsResponse {
    /// Pool the addresses belong to.
    pub pool_id: Uuid,
    /// Lowest free addresses, ascending.
    pub addresses: Vec<String>,
}

// ---------------------------------------------------------------------------
// Peers
// ---------------------------------------------------------------------------

/// `POST /api/v1/wg/peers`
#[derive(Debug, Clone, Default, Serialize, Deserialize, Validate)]
pub struct CreatePeerRequest {
    /// Owning user; the caller when omitted.
    #[serde(default)]
    pub user_id: Option<Uuid>,
    /// Device name, unique per owner.
    #[validate(custom(function = "self::name"), length(max = 64))]
    pub device_name: String,
    /// Pool to allocate from.
    #[serde(default)]
    pub ip_pool_id: Option<Uuid>,
    /// Operator-chosen address (with or without `/32`).
    #[serde(default)]
    pub client_ip: Option<String>,
    /// Client private key; generated when omitted.
    #[serde(default)]
    pub private_key: Option<String>,
    /// Client `AllowedIPs` override.
    #[serde(default)]
    pub allowed_ips: String,
    /// Client DNS override.
    #[serde(default)]
    pub dns: String,
    /// Client endpoint override.
    #[serde(default)]
    pub endpoint: String,
    /// Keepalive interval in seconds, 0 disables.
    #[serde(default)]
    #[validate(range(min = 0, max = 65535))]
    pub persistent_keepalive: Option<i64>,
}

/// `PUT /api/v1/wg/peers/{id}` and `PUT /api/v1/wg/configs/{id}`.
#[derive(Debug, Clone, Default, Serialize, Deserialize, Validate)]
pub struct UpdatePeerRequest {
    /// Transfer ownership (sensitive).
    #[serde(default)]
    pub user_id: Option<Uuid>,
    /// Rename the device.
    #[serde(default)]
    #[validate(custom(function = "self::name"), length(max = 64))]
    pub device_name: Option<String>,
    /// Move to another pool.
    #[serde(default)]
    pub ip_pool_id: Option<Uuid>,
    /// Move to another address.
    #[serde(default)]
    pub client_ip: Option<String>,
    /// Replace the private key (sensitive).
    #[serde(default)]
    pub private_key: Option<String>,
    /// New `AllowedIPs` override.
    #[serde(default)]
    pub allowed_ips: Option<String>,
    /// New DNS override.
    #[serde(default)]
    pub dns: Option<String>,
    /// New endpoint override.
    #[serde(default)]
    pub endpoint: Option<String>,
    /// New keepalive interval.
    #[serde(default)]
    #[validate(range(min = 0, max = 65535))]
    pub persistent_keepalive: Option<i64>,
    /// Enable or disable (sensitive).
    #[serde(default)]
    pub status: Option<PeerStatus>,
}

/// One item of `PUT /api/v1/wg/peers/batch`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchUpdatePeerItem {
    /// Peer to update.
    pub id: Uuid,
    /// Fields to change.
    #[serde(flatten)]
    pub patch: UpdatePeerRequest,
}

/// Query string of `GET /api/v1/wg/peers`.
#[derive(Debug, Clone, Default, Serialize, Deserialize, Validate)]
pub struct ListPeersQuery {
    /// Only peers owned by this user.
    #[serde(default)]
    pub user_id: Option<Uuid>,
    /// Only peers referencing this pool.
    #[serde(default)]
    pub ip_pool_id: Option<Uuid>,
    /// Only peers in this state.
    #[serde(default)]
    pub status: Option<PeerStatus>,
    /// Page size.
    #[serde(default)]
    #[validate(range(min = 1))]
    pub limit: Option<i64>,
    /// Page offset.
    #[serde(default)]
    #[validate(range(min = 0))]
    pub offset: Option<i64>,
}

/// View of a peer. Never carries the private key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerResponse {
    /// Peer identifier.
    pub id: Uuid,
    /// Owning user.
    pub user_id: Uuid,
    /// Device name.
    pub device_name: String,
    /// Client public key.
    pub public_key: String,
    /// Tunnel address as `a.b.c.d/32`; absent while disabled.
    pub client_ip: Option<String>,
    /// `AllowedIPs` override.
    pub allowed_ips: String,
    /// DNS override.
    pub dns: String,
    /// Endpoint override.
    pub endpoint: String,
    /// Keepalive seconds, 0 when unset.
    pub persistent_keepalive: u16,
    /// Status.
    pub status: PeerStatus,
    /// Pool the address was drawn from.
    pub ip_pool_id: Option<Uuid>,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Last modification time.
    pub updated_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Batches
// ---------------------------------------------------------------------------

/// Envelope for batch create/update requests.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchRequest<T> {
    /// Items, applied all-or-nothing.
    pub items: Vec<T>,
}

/// Body of batch delete requests.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchDeleteRequest {
    /// Identifiers to delete.
    pub ids: Vec<Uuid>,
}

// ---------------------------------------------------------------------------
// Server configuration
// ---------------------------------------------------------------------------

/// `GET /api/v1/wg/server-config`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfigResponse {
    /// Server tunnel address in CIDR form.
    pub address: String,
    /// UDP listen port.
    pub listen_port: u16,
    /// Public key derived from the stored private key.
    pub public_key: String,
    /// Interface MTU, 0 when unset.
    pub mtu: u16,
    /// `PostUp` hook.
    pub post_up: String,
    /// `PostDown` hook.
    pub post_down: String,
    /// Public host clients dial.
    pub public_host: String,
    /// Default client DNS.
    pub dns: String,
    /// Last modification time.
    pub updated_at: DateTime<Utc>,
}

/// `PUT /api/v1/wg/server-config`
#[derive(Debug, Clone, Default, Serialize, Deserialize, Validate)]
pub struct UpdateServerConfigRequest {
    /// New tunnel address in CIDR form.
    #[serde(default)]
    pub address: Option<String>,
    /// New listen port.
    #[serde(default)]
    #[validate(range(min = 1, max = 65535))]
    pub listen_port: Option<i64>,
    /// New private key.
    #[serde(default)]
    pub private_key: Option<String>,
    /// New MTU; 0 leaves it to `wg-quick`.
    #[serde(default)]
    #[validate(range(min = 0, max = 65535))]
    pub mtu: Option<i64>,
    /// New `PostUp` hook.
    #[serde(default)]
    #[validate(custom(function = "single_line"), length(max = 1024))]
    pub post_up: Option<String>,
    /// New `PostDown` hook.
    #[serde(default)]
    #[validate(custom(function = "single_line"), length(max = 1024))]
    pub post_down: Option<String>,
    /// New public host.
    #[serde(default)]
    pub public_host: Option<String>,
    /// New default DNS.
    #[serde(default)]
    pub dns: Option<String>,
}

// ---------------------------------------------------------------------------
// Field rules
// ---------------------------------------------------------------------------

fn not_blank(value: &str) -> Result<(), ValidationError> {
    if value.trim().is_empty() {
        return Err(ValidationError::new("required"));
    }
    Ok(())
}

/// Text lands in line-oriented config files; a newline would inject extra
/// directives.
fn single_line(value: &str) -> Result<(), ValidationError> {
    if value.chars().any(char::is_control) {
        return Err(ValidationError::new("printable"));
    }
    Ok(())
}

fn name(value: &str) -> Result<(), ValidationError> {
    not_blank(value)?;
    single_line(value)
}

fn username(value: &str) -> Result<(), ValidationError> {
    not_blank(value)?;
    let valid = value
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'))
        && !value.starts_with('.');
    if !valid {
        return Err(ValidationError::new("username"));
    }
    Ok(())
}
