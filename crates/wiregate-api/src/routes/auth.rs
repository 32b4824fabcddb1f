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

use actix_web::{HttpResponse, web};
use wiregate_types::api::{LoginRequest, TokenResponse};

use super::Engine;
use crate::apply::Applier;
use crate::auth::Authenticator;
use crate::db::Store;
use crate::error::ApiError;

pub fn configure<S: Store, A: Applier>(cfg: &mut web::ServiceConfig) {
    cfg.route("/api/v1/login", web::post().to(login::<S, A>));
}

#[tracing::instrument(skip(body, engine, auth), fields(username = %body.username))]
async fn login<S: Store, A: Applier>(
    body: web::Json<LoginRequest>,
    engine: Engine<S, A>,
    auth: web::Data<Authenticator>,
) -> Result<HttpResponse, ApiError> {
    let LoginRequest { username, password } = body.into_inner();
    let user = engine.login(&username, &password).await?;
    let token = auth.issue(&user)?;
    tracing::info!(user_id = %user.id, "login success");

    Ok(HttpResponse::Ok().json(TokenResponse { token }))
}
