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
use wiregate_types::api::UpdateServerConfigRequest;
use wiregate_types::error::ErrorCode;

use super::Engine;
use crate::apply::Applier;
use crate::db::Store;
use crate::db::models::ServerConfig;
use crate::error::ApiError;
use crate::extract::{AuthUser, RequestCancel};

pub fn configure<S: Store, A: Applier>(cfg: &mut web::ServiceConfig) {
    cfg.service(
        web::scope("/api/v1/wg/server-config")
            .route("", web::get().to(get::<S, A>))
            .route("", web::put().to(update::<S, A>))
            .route("/apply", web::post().to(apply::<S, A>)),
    );
}

fn respond(server: &ServerConfig) -> Result<HttpResponse, ApiError> {
    let body = server
        .to_response()
        .map_err(|e| ApiError::internal(ErrorCode::Internal, &e))?;
    Ok(HttpResponse::Ok().json(body))
}

#[tracing::instrument(skip_all)]
async fn get<S: Store, A: Applier>(
    auth: AuthUser,
    engine: Engine<S, A>,
) -> Result<HttpResponse, ApiError> {
    let server = engine.server_config(&auth.actor()).await?;
    respond(&server)
}

#[tracing::instrument(skip_all)]
async fn update<S: Store, A: Applier>(
    auth: AuthUser,
    engine: Engine<S, A>,
    cancel: RequestCancel,
    body: web::Json<UpdateServerConfigRequest>,
) -> Result<HttpResponse, ApiError> {
    let server = engine
        .update_server(auth.actor(), body.into_inner(), cancel.token())
        .await?;
    respond(&server)
}

#[tracing::instrument(skip_all)]
async fn apply<S: Store, A: Applier>(
    auth: AuthUser,
    engine: Engine<S, A>,
    cancel: RequestCancel,
) -> Result<HttpResponse, ApiError> {
    engine.reconcile_as(auth.actor(), cancel.token()).await?;
    Ok(HttpResponse::NoContent().finish())
}
