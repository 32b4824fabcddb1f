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

//! wiregate-types: Shared API type definitions for the wiregate control plane.
//!
//! This crate contains the status enums, request/response bodies, and the
//! error envelope shared between the API server and its clients.

#![warn(missing_docs)]

pub mod api;
pub mod error;

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Returned when a stored or submitted enum value is not recognised.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown {kind} value: {value:?}")]
pub struct ParseEnumError {
    /// Which enum was being parsed.
    pub kind: &'static str,
    /// The offending input.
    pub value: String,
}

macro_rules! string_enum {
    (
        $(#[$meta:meta])*
        $name:ident, $kind:literal {
            $( $(#[$vmeta:meta])* $variant:ident => $text:literal ),+ $(,)?
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(rename_all = "lowercase")]
        pub enum $name {
            $( $(#[$vmeta])* $variant ),+
        }

        impl $name {
            /// The canonical lowercase spelling used in storage and JSON.
            pub fn as_str(self) -> &'static str {
                match self {
                    $( Self::$variant => $text ),+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = ParseEnumError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $( $text => Ok(Self::$variant), )+
                    other => Err(ParseEnumError {
                        kind: $kind,
                        value: other.to_string(),
                    }),
                }
            }
        }
    };
}

string_enum! {
    /// Coarse account role consulted by the policy engine.
    Role, "role" {
        /// Regular account; may only act on its own resources.
        User => "user",
        /// Operator account; may act on everything.
        Admin => "admin",
    }
}

string_enum! {
    /// Lifecycle state of a user account.
    UserStatus, "user status" {
        /// May log in and own active peers.
        Active => "active",
        /// Suspended by an administrator.
        Inactive => "inactive",
        /// Soft-deleted; hidden from listings but the id is retained.
        Deleted => "deleted",
    }
}

string_enum! {
    /// Whether an IP pool accepts new reservations.
    PoolStatus, "pool status" {
        /// New peers may draw addresses from this pool.
        Active => "active",
        /// Existing peers keep their addresses; no new reservations.
        Disabled => "disabled",
    }
}

string_enum! {
    /// Whether a peer is present in the server's WireGuard configuration.
    PeerStatus, "peer status" {
        /// Holds an address and appears in the server file.
        Active => "active",
        /// Revoked; holds no address and is omitted from the server file.
        Disabled => "disabled",
    }
}
