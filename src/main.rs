//! Circulation Server - library catalog, members and loans
//!
//! REST API server tracking which copies are on the shelf and who holds the rest.

use sqlx::postgres::PgPoolOptions;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use circulation_server::{
    api,
    config::{AppConfig, LoggingConfig, StorageBackend},
    repository::Repository,
    services::Services,
    AppState,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables from .env file
    dotenvy::dotenv().ok();

    let config = AppConfig::load()?;

    // Keep the guard alive so buffered file logs are flushed on exit
    let _log_guard = init_tracing(&config.logging);

    tracing::info!("Starting Circulation Server v{}", env!("CARGO_PKG_VERSION"));

    let repository = match config.database.backend {
        StorageBackend::Postgres => {
            let pool = PgPoolOptions::new()
                .max_connections(config.database.max_connections)
                .min_connections(config.database.min_connections)
                .connect(&config.database.url)
                .await?;

            tracing::info!("Connected to database");

            sqlx::migrate!("./migrations").run(&pool).await?;

            tracing::info!("Database migrations completed");

            Repository::postgres(pool, config.circulation.lock_timeout())
        }
        StorageBackend::Memory => {
            tracing::warn!("Using in-memory storage, data will be lost on shutdown");
            Repository::in_memory()
        }
    };

    let services = Services::new(repository, config.email.clone(), &config.circulation);

    let addr = SocketAddr::new(config.server.host.parse::<IpAddr>()?, config.server.port);

    let state = AppState {
        config: Arc::new(config),
        services: Arc::new(services),
    };

    let app = api::create_router(state);

    tracing::info!("Server listening on http://{}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

/// Install the global subscriber: console output plus an optional daily log file
fn init_tracing(logging: &LoggingConfig) -> Option<WorkerGuard> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        format!("circulation_server={},tower_http=debug", logging.level).into()
    });

    let json = logging.format == "json";
    let json_layer = json.then(|| tracing_subscriber::fmt::layer().json());
    let pretty_layer = (!json).then(|| tracing_subscriber::fmt::layer());

    let (file_layer, guard) = match &logging.directory {
        Some(directory) => {
            let appender = tracing_appender::rolling::daily(directory, "circulation.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(writer);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(json_layer)
        .with(pretty_layer)
        .with(file_layer)
        .init();

    guard
}
