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

//! Self-service view of one's own peers.

use actix_web::{HttpResponse, web};
use uuid::Uuid;
use wiregate_types::api::{PeerResponse, UpdatePeerRequest};

use super::{Engine, conf_response, peers};
use crate::apply::Applier;
use crate::db::Store;
use crate::error::ApiError;
use crate::extract::{AuthUser, RequestCancel};

pub fn configure<S: Store, A: Applier>(cfg: &mut web::ServiceConfig) {
    cfg.service(
        web::scope("/api/v1/wg/configs")
            .route("", web::get().to(list::<S, A>))
            .route("/{id}", web::put().to(update::<S, A>))
            .route("/{id}/download", web::get().to(download::<S, A>))
            .route("/{id}/rotate", web::post().to(rotate::<S, A>))
            .route("/{id}/revoke", web::post().to(revoke::<S, A>)),
    );
}

#[tracing::instrument(skip_all)]
async fn list<S: Store, A: Applier>(
    auth: AuthUser,
    engine: Engine<S, A>,
) -> Result<HttpResponse, ApiError> {
    let peers = engine.list_mine(&auth.actor()).await?;
    Ok(peers::respond(&peers))
}

#[tracing::instrument(skip(auth, engine))]
async fn download<S: Store, A: Applier>(
    auth: AuthUser,
    engine: Engine<S, A>,
    path: web::Path<Uuid>,
) -> Result<HttpResponse, ApiError> {
    let (peer, conf) = engine.download(&auth.actor(), path.into_inner()).await?;
    Ok(conf_response(&peer.device_name, conf))
}

#[tracing::instrument(skip(auth, engine, cancel, body))]
async fn update<S: Store, A: Applier>(
    auth: AuthUser,
    engine: Engine<S, A>,
    cancel: RequestCancel,
    path: web::Path<Uuid>,
    body: web::Json<UpdatePeerRequest>,
) -> Result<HttpResponse, ApiError> {
    let peer = engine
        .update_peer(auth.actor(), path.into_inner(), body.into_inner(), cancel.token())
        .await?;
    Ok(HttpResponse::Ok().json(PeerResponse::from(&peer)))
}

#[tracing::instrument(skip(auth, engine, cancel))]
async fn rotate<S: Store, A: Applier>(
    auth: AuthUser,
    engine: Engine<S, A>,
    cancel: RequestCancel,
    path: web::Path<Uuid>,
) -> Result<HttpResponse, ApiError> {
    let peer = engine
        .rotate(auth.actor(), path.into_inner(), cancel.token())
        .await?;
    Ok(HttpResponse::Ok().json(PeerResponse::from(&peer)))
}

#[tracing::instrument(skip(auth, engine, cancel))]
async fn revoke<S: Store, A: Applier>(
    auth: AuthUser,
    engine: Engine<S, A>,
    cancel: RequestCancel,
    path: web::Path<Uuid>,
) -> Result<HttpResponse, ApiError> {
    let peer = engine
        .revoke(auth.actor(), path.into_inner(), cancel.token())
        .await?;
    Ok(HttpResponse::Ok().json(PeerResponse::from(&peer)))
}
