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

use std::future::{Ready, ready};

use actix_web::dev::Payload;
use actix_web::http::header::AUTHORIZATION;
use actix_web::web::Data;
use actix_web::{FromRequest, HttpRequest};
use futures::future::LocalBoxFuture;
use tokio_util::sync::{CancellationToken, DropGuard};
use wiregate_types::error::ErrorCode;

use crate::auth::{Authenticator, UserLookup, strip_bearer};
use crate::db::models::User;
use crate::error::ApiError;
use crate::policy::Actor;

/// An authenticated, active caller. The role comes from the database, not
/// the token, so demotions take effect immediately.
#[derive(Debug)]
pub struct AuthUser {
    pub user: User,
}

impl AuthUser {
    pub fn actor(&self) -> Actor {
        Actor {
            user_id: self.user.id,
            role: self.user.role,
        }
    }
}

fn bearer(req: &HttpRequest) -> Option<String> {
    req.headers()
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}

async fn authenticate(
    header: Option<String>,
    auth: Option<Data<Authenticator>>,
    users: Option<Data<dyn UserLookup>>,
) -> Result<AuthUser, ApiError> {
    let auth = auth.ok_or_else(|| ApiError::internal(ErrorCode::Internal, &"authenticator missing"))?;
    let users = users.ok_or_else(|| ApiError::internal(ErrorCode::Internal, &"user lookup missing"))?;

    let header = header.ok_or_else(ApiError::unauthorized)?;
    let token = strip_bearer(&header).ok_or_else(ApiError::unauthorized)?;
    let claims = auth.verify(token)?;

    let user = users
        .lookup(claims.sub)
        .await?
        .ok_or_else(ApiError::unauthorized)?;
    if !user.is_active() {
        return Err(ApiError::new(ErrorCode::UserInactive, "user is not active"));
    }
    Ok(AuthUser { user })
}

impl FromRequest for AuthUser {
    type Error = ApiError;
    type Future = LocalBoxFuture<'static, Result<Self, Self::Error>>;

    fn from_request(req: &HttpRequest, _payload: &mut Payload) -> Self::Future {
        let header = bearer(req);
        let auth = req.app_data::<Data<Authenticator>>().cloned();
        let users = req.app_data::<Data<dyn UserLookup>>().cloned();
        Box::pin(authenticate(header, auth, users))
    }
}

/// `None` without an `Authorization` header; a present but bad token is
/// still rejected.
#[derive(Debug)]
pub struct MaybeAuthUser(pub Option<AuthUser>);

impl FromRequest for MaybeAuthUser {
    type Error = ApiError;
    type Future = LocalBoxFuture<'static, Result<Self, Self::Error>>;

    fn from_request(req: &HttpRequest, _payload: &mut Payload) -> Self::Future {
        let Some(header) = bearer(req) else {
            return Box::pin(async { Ok(MaybeAuthUser(None)) });
        };
        let auth = req.app_data::<Data<Authenticator>>().cloned();
        let users = req.app_data::<Data<dyn UserLookup>>().cloned();
        Box::pin(async move {
            let user = authenticate(Some(header), auth, users).await?;
            Ok(MaybeAuthUser(Some(user)))
        })
    }
}

/// Cancelled when the handler future is dropped, e.g. on client disconnect.
pub struct RequestCancel {
    token: CancellationToken,
    _guard: DropGuard,
}

impl RequestCancel {
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }
}

impl FromRequest for RequestCancel {
    type Error = ApiError;
    type Future = Ready<Result<Self, Self::Error>>;

    fn from_request(_req: &HttpRequest, _payload: &mut Payload) -> Self::Future {
        let token = CancellationToken::new();
        let guard = token.clone().drop_guard();
        ready(Ok(RequestCancel {
            token,
            _guard: guard,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[actix_web::test]
    async fn dropping_the_extractor_cancels() {
        let req = actix_web::test::TestRequest::default().to_http_request();
        let cancel = RequestCancel::extract(&req).await.unwrap();
        let observer = cancel.token().clone();
        assert!(!observer.is_cancelled());
        drop(cancel);
        assert!(observer.is_cancelled());
    }

    #[actix_web::test]
    async fn missing_header_is_anonymous() {
        let req = actix_web::test::TestRequest::default().to_http_request();
        let MaybeAuthUser(user) = MaybeAuthUser::extract(&req).await.unwrap();
        assert!(user.is_none());
    }
}
