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
use wiregate_types::api::{
    ChangePasswordRequest, CreateUserRequest, UpdateUserRequest, UserResponse,
};

use super::Engine;
use crate::apply::Applier;
use crate::db::Store;
use crate::error::ApiError;
use crate::extract::{AuthUser, MaybeAuthUser, RequestCancel};

pub fn configure<S: Store, A: Applier>(cfg: &mut web::ServiceConfig) {
    cfg.service(
        web::scope("/api/v1/users")
            .route("", web::post().to(register::<S, A>))
            .route("", web::get().to(list::<S, A>))
            .route("/{username}", web::get().to(get::<S, A>))
            .route("/{username}", web::put().to(update::<S, A>))
            .route("/{username}", web::delete().to(remove::<S, A>))
            .route("/{username}/password", web::post().to(change_password::<S, A>)),
    );
}

#[tracing::instrument(skip_all, fields(username = %body.username))]
async fn register<S: Store, A: Applier>(
    caller: MaybeAuthUser,
    engine: Engine<S, A>,
    body: web::Json<CreateUserRequest>,
) -> Result<HttpResponse, ApiError> {
    let actor = caller.0.as_ref().map(AuthUser::actor);
    let user = engine.register(actor.as_ref(), body.into_inner()).await?;
    Ok(HttpResponse::Created().json(UserResponse::from(&user)))
}

#[tracing::instrument(skip_all)]
async fn list<S: Store, A: Applier>(
    auth: AuthUser,
    engine: Engine<S, A>,
) -> Result<HttpResponse, ApiError> {
    let users = engine.list_users(&auth.actor()).await?;
    let body: Vec<UserResponse> = users.iter().map(UserResponse::from).collect();
    Ok(HttpResponse::Ok().json(body))
}

#[tracing::instrument(skip(auth, engine))]
async fn get<S: Store, A: Applier>(
    auth: AuthUser,
    engine: Engine<S, A>,
    path: web::Path<String>,
) -> Result<HttpResponse, ApiError> {
    let user = engine.get_user(&auth.actor(), &path).await?;
    Ok(HttpResponse::Ok().json(UserResponse::from(&user)))
}

#[tracing::instrument(skip(auth, engine, body))]
async fn update<S: Store, A: Applier>(
    auth: AuthUser,
    engine: Engine<S, A>,
    path: web::Path<String>,
    body: web::Json<UpdateUserRequest>,
) -> Result<HttpResponse, ApiError> {
    let user = engine
        .update_user(&auth.actor(), &path, body.into_inner())
        .await?;
    Ok(HttpResponse::Ok().json(UserResponse::from(&user)))
}

#[tracing::instrument(skip(auth, engine, cancel))]
async fn remove<S: Store, A: Applier>(
    auth: AuthUser,
    engine: Engine<S, A>,
    cancel: RequestCancel,
    path: web::Path<String>,
) -> Result<HttpResponse, ApiError> {
    engine
        .remove_user(auth.actor(), &path, cancel.token())
        .await?;
    Ok(HttpResponse::NoContent().finish())
}

#[tracing::instrument(skip(auth, engine, body))]
async fn change_password<S: Store, A: Applier>(
    auth: AuthUser,
    engine: Engine<S, A>,
    path: web::Path<String>,
    body: web::Json<ChangePasswordRequest>,
) -> Result<HttpResponse, ApiError> {
    engine
        .change_password(&auth.actor(), &path, body.into_inner())
        .await?;
    Ok(HttpResponse::NoContent().finish())
}
