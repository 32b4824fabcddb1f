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
use uuid::Uuid;
use wiregate_types::api::{
    BatchDeleteRequest, BatchRequest, BatchUpdatePeerItem, CreatePeerRequest, ListPeersQuery,
    PeerResponse, UpdatePeerRequest,
};

use super::{Engine, conf_response};
use crate::apply::Applier;
use crate::db::Store;
use crate::db::models::{Peer, PeerFilter};
use crate::error::ApiError;
use crate::extract::{AuthUser, RequestCancel};
use crate::validate::FieldErrors;

pub fn configure<S: Store, A: Applier>(cfg: &mut web::ServiceConfig) {
    cfg.service(
        web::scope("/api/v1/wg/peers")
            .route("", web::get().to(list::<S, A>))
            .route("", web::post().to(create::<S, A>))
            .route("/batch", web::post().to(create_batch::<S, A>))
            .route("/batch", web::put().to(update_batch::<S, A>))
            .route("/batch", web::delete().to(delete_batch::<S, A>))
            .route("/{id}", web::get().to(get::<S, A>))
            .route("/{id}", web::put().to(update::<S, A>))
            .route("/{id}", web::delete().to(delete::<S, A>))
            .route("/{id}/config", web::get().to(config::<S, A>)),
    );
}

pub(super) fn respond(peers: &[Peer]) -> HttpResponse {
    let body: Vec<PeerResponse> = peers.iter().map(PeerResponse::from).collect();
    HttpResponse::Ok().json(body)
}

fn filter_from(query: ListPeersQuery) -> Result<PeerFilter, FieldErrors> {
    FieldErrors::validate(&query).finish()?;

    Ok(PeerFilter {
        user_id: query.user_id,
        ip_pool_id: query.ip_pool_id,
        status: query.status,
        limit: query.limit,
        offset: query.offset,
    })
}

#[tracing::instrument(skip_all)]
async fn list<S: Store, A: Applier>(
    auth: AuthUser,
    engine: Engine<S, A>,
    query: web::Query<ListPeersQuery>,
) -> Result<HttpResponse, ApiError> {
    let filter = filter_from(query.into_inner()).map_err(ApiError::validation)?;
    let peers = engine.list_peers(&auth.actor(), &filter).await?;
    Ok(respond(&peers))
}

#[tracing::instrument(skip(auth, engine))]
async fn get<S: Store, A: Applier>(
    auth: AuthUser,
    engine: Engine<S, A>,
    path: web::Path<Uuid>,
) -> Result<HttpResponse, ApiError> {
    let peer = engine.get_peer(&auth.actor(), path.into_inner()).await?;
    Ok(HttpResponse::Ok().json(PeerResponse::from(&peer)))
}

#[tracing::instrument(skip(auth, engine))]
async fn config<S: Store, A: Applier>(
    auth: AuthUser,
    engine: Engine<S, A>,
    path: web::Path<Uuid>,
) -> Result<HttpResponse, ApiError> {
    let (peer, conf) = engine.peer_config(&auth.actor(), path.into_inner()).await?;
    Ok(conf_response(&peer.device_name, conf))
}

#[tracing::instrument(skip_all, fields(device_name = %body.device_name))]
async fn create<S: Store, A: Applier>(
    auth: AuthUser,
    engine: Engine<S, A>,
    cancel: RequestCancel,
    body: web::Json<CreatePeerRequest>,
) -> Result<HttpResponse, ApiError> {
    let peer = engine
        .create_peer(auth.actor(), body.into_inner(), cancel.token())
        .await?;
    Ok(HttpResponse::Created().json(PeerResponse::from(&peer)))
}

#[tracing::instrument(skip_all, fields(count = body.items.len()))]
async fn create_batch<S: Store, A: Applier>(
    auth: AuthUser,
    engine: Engine<S, A>,
    cancel: RequestCancel,
    body: web::Json<BatchRequest<CreatePeerRequest>>,
) -> Result<HttpResponse, ApiError> {
    let peers = engine
        .create_peers(auth.actor(), body.into_inner().items, cancel.token())
        .await?;
    let body: Vec<PeerResponse> = peers.iter().map(PeerResponse::from).collect();
    Ok(HttpResponse::Created().json(body))
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

#[tracing::instrument(skip_all, fields(count = body.items.len()))]
async fn update_batch<S: Store, A: Applier>(
    auth: AuthUser,
    engine: Engine<S, A>,
    cancel: RequestCancel,
    body: web::Json<BatchRequest<BatchUpdatePeerItem>>,
) -> Result<HttpResponse, ApiError> {
    let peers = engine
        .update_peers(auth.actor(), body.into_inner().items, cancel.token())
        .await?;
    Ok(respond(&peers))
}

#[tracing::instrument(skip(auth, engine, cancel))]
async fn delete<S: Store, A: Applier>(
    auth: AuthUser,
    engine: Engine<S, A>,
    cancel: RequestCancel,
    path: web::Path<Uuid>,
) -> Result<HttpResponse, ApiError> {
    engine
        .delete_peer(auth.actor(), path.into_inner(), cancel.token())
        .await?;
    Ok(HttpResponse::NoContent().finish())
}

#[tracing::instrument(skip_all, fields(count = body.ids.len()))]
async fn delete_batch<S: Store, A: Applier>(
    auth: AuthUser,
    engine: Engine<S, A>,
    cancel: RequestCancel,
    body: web::Json<BatchDeleteRequest>,
) -> Result<HttpResponse, ApiError> {
    engine
        .delete_peers(auth.actor(), body.into_inner().ids, cancel.token())
        .await?;
    Ok(HttpResponse::NoContent().finish())
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test_case(Some(0), None, Some("limit") ; "zero limit")]
    #[test_case(None, Some(-1), Some("offset") ; "negative offset")]
    #[test_case(Some(20), Some(40), None ; "page")]
    fn list_query_bounds(limit: Option<i64>, offset: Option<i64>, bad: Option<&str>) {
        let query = ListPeersQuery {
            limit,
            offset,
            ..ListPeersQuery::default()
        };
        match (filter_from(query), bad) {
            (Ok(filter), None) => assert_eq!(filter.limit, limit),
            (Err(errs), Some(field)) => assert!(errs.get(field).is_some()),
            (other, _) => panic!("unexpected result: {:?}", other.map(|f| f.limit)),
        }
    }
}
