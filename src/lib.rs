pub(crate) mod controllers;
pub(crate) mod core;
pub(crate) mod routes;
pub(crate) mod types;
pub(crate) mod utils;

use config::Config;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use crate::core::bootstrap::{Bootstrap, bootstrap_admin};
use crate::core::error::ConfigError as Error;
use crate::core::{config::Args, state::AppState};
use crate::utils::auth::TokenService;
use crate::utils::password::PasswordHasher;

pub async fn run() -> Result<(), Error> {
    let config = Config::builder()
        .add_source(config::Environment::with_prefix("TABLEGATE"))
        .build()
        .map_err(Error::Config)?;

    let config = config.try_deserialize::<Args>().map_err(Error::Config)?;

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::try_new(&config.log_level).unwrap_or_default())
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::debug!("{:?}", config);

    let state = AppState::new(
        config.pool_settings(),
        TokenService::new(&config.secret, config.token_ttl().map_err(Error::Config)?),
        PasswordHasher::new(config.bcrypt_cost)?,
    );

    sqlx::migrate!()
        .run(state.store.pool().await?)
        .await
        .map_err(Error::DatabaseMigration)?;

    match bootstrap_admin(&state.users, &state.hasher, config.initial_admin()).await? {
        Bootstrap::Created => tracing::info!("initial admin created"),
        Bootstrap::AlreadyPresent => tracing::debug!("admin already present"),
        Bootstrap::Skipped => {}
    }

    let app = routes::router::routes(state.clone(), config.rate_limit_per_second);

    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{}", config.port))
        .await
        .map_err(Error::IO)?;

    tracing::info!("listening on port {}", config.port);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .map_err(Error::IO)?;

    state.store.close().await;

    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }

    tracing::info!("shutting down");
}
