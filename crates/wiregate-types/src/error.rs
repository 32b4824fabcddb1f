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

//! The error envelope returned by every failing API call.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Stable numeric error codes. The hundreds digit groups encode the error
/// class, from which the HTTP status is derived (see [`ErrorCode::http_status`]).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum ErrorCode {
    /// One or more request fields failed validation; see `details`.
    ValidationFailed = 40000,
    /// A batch exceeded the maximum item count.
    BatchTooLarge = 40001,
    /// A batch contained no items.
    EmptyBatch = 40002,
    /// The request was cancelled before any change was made.
    RequestCancelled = 40003,

    /// The requested address lies outside the pool.
    IPOutOfRange = 42001,
    /// The requested address is the pool's network address.
    IPIsNetworkAddress = 42002,
    /// The requested address is the pool's broadcast address.
    IPIsBroadcastAddress = 42003,
    /// The requested address is the server's own tunnel address.
    IPIsServerIP = 42004,
    /// The requested address is held by another peer.
    IPAlreadyInUse = 42005,
    /// Every usable address in the pool is taken.
    IPPoolExhausted = 42006,
    /// The pool prefix leaves no usable client addresses.
    WGPrefixTooSmall = 42007,
    /// The pool is disabled and accepts no new reservations.
    IPPoolDisabled = 42008,
    /// The peer is disabled and has no downloadable configuration.
    PeerDisabled = 42009,

    /// A WireGuard key was not 32 bytes of valid base64.
    InvalidKey = 42201,

    /// Missing, malformed, or expired bearer token.
    Unauthorized = 40100,
    /// Username or password did not match.
    InvalidCredentials = 40101,
    /// The account exists but is not active.
    UserInactive = 40102,

    /// The policy engine denied the action.
    PermissionDenied = 40300,

    /// No such user.
    UserNotFound = 40401,
    /// No such peer.
    PeerNotFound = 40402,
    /// No such IP pool.
    PoolNotFound = 40403,
    /// The server interface has not been configured yet.
    ServerNotConfigured = 40404,

    /// Username already taken.
    DuplicateUsername = 40901,
    /// Email already taken.
    DuplicateEmail = 40902,
    /// Another peer already uses this public key.
    DuplicatePublicKey = 40903,
    /// The owner already has a device with this name.
    DuplicateDeviceName = 40904,
    /// Pool name already taken.
    DuplicatePoolName = 40905,
    /// Pool CIDR equals or overlaps an existing pool.
    DuplicatePoolCidr = 40906,
    /// The pool is still referenced by peers.
    PoolInUse = 40907,

    /// Unexpected server-side failure.
    Internal = 50000,
    /// Database failure.
    Persistence = 50001,
    /// Rendering or writing configuration files failed.
    FileSystem = 50002,
    /// Reloading the WireGuard interface failed.
    WGApplyFailed = 50003,
}

impl ErrorCode {
    /// The numeric value sent on the wire.
    pub fn as_u32(self) -> u32 {
        self as u32
    }

    /// HTTP status associated with this code's class.
    pub fn http_status(self) -> u16 {
        match self.as_u32() / 100 {
            400 | 420 | 422 => 400,
            401 => 401,
            403 => 403,
            404 => 404,
            409 => 409,
            _ => 500,
        }
    }
}

impl Serialize for ErrorCode {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u32(self.as_u32())
    }
}

/// Body of every non-2xx response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    /// Numeric [`ErrorCode`].
    pub code: u32,
    /// Human-readable summary.
    pub message: String,
    /// Request reference for correlating with server logs.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reference: Option<String>,
    /// Per-field validation tokens of the form `validation.<tag>|k=v`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<BTreeMap<String, String>>,
}
