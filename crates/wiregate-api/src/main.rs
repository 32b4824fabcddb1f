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

use std::sync::Arc;

use actix_web::{App, HttpServer, web};
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use wiregate_api::apply::CommandApplier;
use wiregate_api::auth::{Authenticator, UserLookup};
use wiregate_api::config::{Cli, Config};
use wiregate_api::db::{self, PgStore};
use wiregate_api::middleware::RequestLogger;
use wiregate_api::policy::Policy;
use wiregate_api::provision::Provisioner;
use wiregate_api::render::ConfigFiles;
use wiregate_api::{public_ip, routes};

fn init_tracing() {
    use tracing_subscriber::{EnvFilter, fmt};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    #[cfg(distribute)]
    {
        fmt().json().with_env_filter(filter).init();
    }

    #[cfg(not(distribute))]
    {
        fmt().pretty().with_env_filter(filter).init();
    }
}

#[actix_web::main]
async fn main() -> std::io::Result<()> {
    dotenvy::dotenv().ok();
    init_tracing();

    let cli = Cli::parse();
    let config = Config::load(&cli.config).expect("failed to load configuration");
    info!(
        version = env!("GIT_VERSION"),
        addr = %config.bind_addr,
        config = %cli.config.display(),
        "starting wiregate-api"
    );

    let pool = db::create_pool(&config.database_url)
        .await
        .expect("failed to connect to database");
    db::migrate(&pool).await.expect("failed to run migrations");
    info!("database migrations applied");

    let key_secret = config.key_secret().expect("invalid WG_KEY_SECRET");
    let store = Arc::new(PgStore::new(pool, key_secret));
    let policy = Arc::new(Policy::load_embedded().expect("embedded policy is invalid"));

    let wg = &config.wireguard;
    let applier = CommandApplier::new(wg.apply_method, wg.interface(), &wg.config_path)
        .with_timeout(wg.apply_timeout());
    let files = ConfigFiles::new(&wg.config_path, &wg.user_dir);
    let provisioner = Arc::new(Provisioner::new(
        Arc::clone(&store),
        applier,
        policy,
        files,
        config.defaults.clone(),
    ));

    let public_host = public_ip::resolve(&config.public_ip).await;
    let server = provisioner
        .bootstrap_server(&wg.bootstrap, public_host)
        .await
        .expect("failed to bootstrap server configuration");
    info!(address = %server.address, listen_port = server.listen_port, "server interface ready");

    if let Some(admin) = &config.admin {
        match provisioner.bootstrap_admin(admin).await {
            Ok(Some(user)) => info!(user_id = %user.id, username = %user.username, "created bootstrap admin"),
            Ok(None) => {}
            Err(e) => error!(error = %e, "failed to create bootstrap admin"),
        }
    }

    if let Err(e) = provisioner.reconcile(&CancellationToken::new()).await {
        error!(error = %e, "startup reconcile failed");
    }

    let bind = config.bind_addr.clone();
    let engine_data = web::Data::from(provisioner);
    let users_data: web::Data<dyn UserLookup> = web::Data::from(store as Arc<dyn UserLookup>);
    let auth_data = web::Data::new(Authenticator::new(
        &config.auth.jwt_secret,
        config.auth.token_ttl_hours,
    ));

    HttpServer::new(move || {
        App::new()
            .app_data(engine_data.clone())
            .app_data(users_data.clone())
            .app_data(auth_data.clone())
            .wrap(RequestLogger)
            .configure(routes::configure::<PgStore, CommandApplier>)
    })
    .bind(&bind)?
    .run()
    .await
}
