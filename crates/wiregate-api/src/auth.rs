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

use futures::future::BoxFuture;
use jsonwebtoken::{DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use wiregate_types::Role;
use wiregate_types::error::ErrorCode;

use crate::db::UserStore;
use crate::db::models::User;
use crate::error::ApiError;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub sub: Uuid,
    pub role: Role,
    pub iat: i64,
    pub exp: i64,
}

/// Issues and checks HS256 bearer tokens.
pub struct Authenticator {
    encoding: EncodingKey,
    decoding: DecodingKey,
    ttl_secs: i64,
}

impl Authenticator {
    pub fn new(secret: &str, ttl_hours: u32) -> Self {
        Self {
            encoding: EncodingKey::from_secret(secret.as_bytes()),
            decoding: DecodingKey::from_secret(secret.as_bytes()),
            ttl_secs: i64::from(ttl_hours) * 3600,
        }
    }

    #[tracing::instrument(skip(self, user), fields(user_id = %user.id))]
    pub fn issue(&self, user: &User) -> Result<String, ApiError> {
        let now = chrono::Utc::now().timestamp();
        let claims = Claims {
            sub: user.id,
            role: user.role,
            iat: now,
            exp: now + self.ttl_secs,
        };

        jsonwebtoken::encode(&Header::default(), &claims, &self.encoding)
            .map_err(|e| ApiError::internal(ErrorCode::Internal, &e))
    }

    pub fn verify(&self, token: &str) -> Result<Claims, ApiError> {
        jsonwebtoken::decode::<Claims>(token, &self.decoding, &Validation::default())
            .map(|data| data.claims)
            .map_err(|_| ApiError::unauthorized())
    }
}

/// Strips any number of leading `Bearer ` prefixes, case-insensitively.
pub fn strip_bearer(header: &str) -> Option<&str> {
    const PREFIX: &str = "bearer";
    let mut rest = header.trim();
    while let Some(head) = rest.get(..PREFIX.len()) {
        let tail = &rest[PREFIX.len()..];
        if !head.eq_ignore_ascii_case(PREFIX) || tail.starts_with(|c: char| !c.is_whitespace()) {
            break;
        }
        rest = tail.trim_start();
    }
    (!rest.is_empty()).then_some(rest)
}

/// Object-safe user lookup so extractors need not know the store type.
pub trait UserLookup: Send + Sync {
    fn lookup(&self, id: Uuid) -> BoxFuture<'_, Result<Option<User>, crate::db::StoreError>>;
}

impl<T: UserStore> UserLookup for T {
    fn lookup(&self, id: Uuid) -> BoxFuture<'_, Result<Option<User>, crate::db::StoreError>> {
        Box::pin(self.get_user(id))
    }
}
