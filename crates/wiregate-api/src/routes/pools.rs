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
use serde::Deserialize;
use uuid::Uuid;
use wiregate_types::api::{
    AvailableIpsResponse, BatchDeleteRequest, BatchRequest, BatchUpdatePoolItem,
    CreatePoolRequest, PoolResponse, UpdatePoolRequest,
};

use super::Engine;
use crate::apply::Applier;
use crate::db::Store;
use crate::error::ApiError;
use crate::extract::{AuthUser, RequestCancel};

const DEFAULT_AVAILABLE: usize = 10;
const MAX_AVAILABLE: usize = 256;

#[derive(Debug, Deserialize)]
pub struct AvailableQuery {
    #[serde(default)]
    pub limit: Option<usize>,
}

pub fn configure<S: Store, A: Applier>(cfg: &mut web::ServiceConfig) {
    cfg.service(
        web::scope("/api/v1/wg/ip-pools")
            .route("", web::get().to(list::<S, A>))
            .route("", web::post().to(create::<S, A>))
            .route("/batch", web::post().to(create_batch::<S, A>))
            .route("/batch", web::put().to(update_batch::<S, A>))
            .route("/batch", web::delete().to(delete_batch::<S, A>))
            .route("/{id}", web::get().to(get::<S, A>))
            .route("/{id}", web::put().to(update::<S, A>))
            .route("/{id}", web::delete().to(delete::<S, A>))
            .route("/{id}/available-ips", web::get().to(available::<S, A>)),
    );
}

fn respond(pools: &[crate::db::models::IpPool]) -> HttpResponse {
    let body: Vec<PoolResponse> = pools.iter().map(PoolResponse::from).collect();
    HttpResponse::Ok().json(body)
}

#[tracing::instrument(skip_all)]
async fn list<S: Store, A: Applier>(
    auth: AuthUser,
    engine: Engine<S, A>,
) -> Result<HttpResponse, ApiError> {
    let pools = engine.list_pools(&auth.actor()).await?;
    Ok(respond(&pools))
}

#[tracing::instrument(skip(auth, engine))]
async fn get<S: Store, A: Applier>(
    auth: AuthUser,
    engine: Engine<S, A>,
    path: web::Path<Uuid>,
) -> Result<HttpResponse, ApiError> {
    let pool = engine.get_pool(&auth.actor(), path.into_inner()).await?;
    Ok(HttpResponse::Ok().json(PoolResponse::from(&pool)))
}

#[tracing::instrument(skip_all, fields(name = %body.name))]
async fn create<S: Store, A: Applier>(
    auth: AuthUser,
    engine: Engine<S, A>,
    cancel: RequestCancel,
    body: web::Json<CreatePoolRequest>,
) -> Result<HttpResponse, ApiError> {
    let pool = engine
        .create_pool(auth.actor(), body.into_inner(), cancel.token())
        .await?;
    Ok(HttpResponse::Created().json(PoolResponse::from(&pool)))
}

#[tracing::instrument(skip_all, fields(count = body.items.len()))]
async fn create_batch<S: Store, A: Applier>(
    auth: AuthUser,
    engine: Engine<S, A>,
    cancel: RequestCancel,
    body: web::Json<BatchRequest<CreatePoolRequest>>,
) -> Result<HttpResponse, ApiError> {
    let pools = engine
        .create_pools(auth.actor(), body.into_inner().items, cancel.token())
        .await?;
    let body: Vec<PoolResponse> = pools.iter().map(PoolResponse::from).collect();
    Ok(HttpResponse::Created().json(body))
}

#[tracing::instrument(skip(auth, engine, cancel, body))]
async fn update<S: Store, A: Applier>(
    auth: AuthUser,
    engine: Engine<S, A>,
    cancel: RequestCancel,
    path: web::Path<Uuid>,
    body: web::Json<UpdatePoolRequest>,
) -> Result<HttpResponse, ApiError> {
    let pool = engine
        .update_pool(auth.actor(), path.into_inner(), body.into_inner(), cancel.token())
        .await?;
    Ok(HttpResponse::Ok().json(PoolResponse::from(&pool)))
}

#[tracing::instrument(skip_all, fields(count = body.items.len()))]
async fn update_batch<S: Store, A: Applier>(
    auth: AuthUser,
    engine: Engine<S, A>,
    cancel: RequestCancel,
    body: web::Json<BatchRequest<BatchUpdatePoolItem>>,
) -> Result<HttpResponse, ApiError> {
    let pools = engine
        .update_pools(auth.actor(), body.into_inner().items, cancel.token())
        .await?;
    Ok(respond(&pools))
}

#[tracing::instrument(skip(auth, engine, cancel))]
async fn delete<S: Store, A: Applier>(
    auth: AuthUser,
    engine: Engine<S, A>,
    cancel: RequestCancel,
    path: web::Path<Uuid>,
) -> Result<HttpResponse, ApiError> {
    engine
        .delete_pool(auth.actor(), path.into_inner(), cancel.token())
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
        .delete_pools(auth.actor(), body.into_inner().ids, cancel.token())
        .await?;
    Ok(HttpResponse::NoContent().finish())
}

#[tracing::instrument(skip(auth, engine))]
async fn available<S: Store, A: Applier>(
    auth: AuthUser,
    engine: Engine<S, A>,
    path: web::Path<Uuid>,
    query: web::Query<AvailableQuery>,
) -> Result<HttpResponse, ApiError> {
    let pool_id = path.into_inner();
    let limit = query.limit.unwrap_or(DEFAULT_AVAILABLE).min(MAX_AVAILABLE);
    let addresses = engine.available_ips(&auth.actor(), pool_id, limit).await?;

    Ok(HttpResponse::Ok().json(AvailableIpsResponse {
        pool_id,
        addresses: addresses.iter().map(ToString::to_string).collect(),
    }))
}
