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

pub mod auth;
pub mod configs;
pub mod peers;
pub mod pools;
pub mod server_config;
pub mod users;

use actix_web::error::{JsonPayloadError, QueryPayloadError};
use actix_web::{HttpRequest, HttpResponse, web};

use crate::apply::Applier;
use crate::db::Store;
use crate::error::ApiError;
use crate::provision::Provisioner;
use crate::validate::FieldErrors;

/// The engine as handlers receive it; derefs to `Arc<Provisioner>`.
pub type Engine<S, A> = web::Data<Provisioner<S, A>>;

/// Mounts `/health` and every `/api/v1` route.
pub fn configure<S: Store, A: Applier>(cfg: &mut web::ServiceConfig) {
    cfg.app_data(web::JsonConfig::default().error_handler(json_error))
        .app_data(web::QueryConfig::default().error_handler(query_error))
        .route("/health", web::get().to(health));

    auth::configure::<S, A>(cfg);
    users::configure::<S, A>(cfg);
    pools::configure::<S, A>(cfg);
    peers::configure::<S, A>(cfg);
    configs::configure::<S, A>(cfg);
    server_config::configure::<S, A>(cfg);
}

async fn health() -> HttpResponse {
    HttpResponse::Ok().json(serde_json::json!({ "status": "ok" }))
}

fn json_error(err: JsonPayloadError, _req: &HttpRequest) -> actix_web::Error {
    tracing::debug!(error = %err, "rejected request body");
    ApiError::validation(FieldErrors::single("body", "json")).into()
}

fn query_error(err: QueryPayloadError, _req: &HttpRequest) -> actix_web::Error {
    tracing::debug!(error = %err, "rejected query string");
    ApiError::validation(FieldErrors::single("query", "query")).into()
}

/// Client files are served as plain text under a filename hint.
fn conf_response(device_name: &str, conf: String) -> HttpResponse {
    let stem: String = device_name
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect();
    HttpResponse::Ok()
        .content_type("text/plain; charset=utf-8")
        .insert_header((
            "content-disposition",
            format!("attachment; filename=\"{stem}.conf\""),
        ))
        .body(conf)
}
