mod auth;
mod config;
mod error;
mod http;
mod mailer;
mod media;
mod metrics;
mod models;
mod products;
mod routes;
mod security;
mod store;

use auth::AuthService;
use config::AppConfig;
use mailer::{DisabledMailer, LogMailer, Mailer, ResendMailer};
use media::{CloudinaryClient, CloudinaryConfig};
use metrics_exporter_prometheus::PrometheusBuilder;
use products::ProductService;
use routes::{AppState, build_router, openapi_document};
use security::SessionKeys;
use std::{net::SocketAddr, sync::Arc};
use store::{MemoryStore, ProductStore, ResetCodeStore, SupabaseStore, UserStore};
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, fmt};

#[tokio::main]
async fn main() {
    if let Err(err) = run().await {
        error!(target = "unimart.api", "server crashed: {err}");
    }
}

async fn run() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let _ = dotenvy::dotenv();
    init_tracing();

    let config = AppConfig::from_env()?;
    error::expose_error_detail(!config.environment.is_production());

    let (users, products, tickets) = stores();
    let media = Arc::new(CloudinaryClient::new(CloudinaryConfig::from_env()));
    let sessions = SessionKeys::new(
        &config.jwt_secret,
        config.cookie_name.clone(),
        config.environment.is_production(),
    );
    let auth = AuthService::new(
        users.clone(),
        tickets,
        mailer(&config),
        sessions,
        config.environment,
    );
    let products = ProductService::new(
        products,
        users,
        media,
        config.media_folder.clone(),
        config.omitted_images,
    );

    let prometheus = match PrometheusBuilder::new().install_recorder() {
        Ok(handle) => Some(handle),
        Err(err) => {
            warn!(target = "unimart.api", error = %err, "prometheus recorder unavailable");
            None
        }
    };

    let state = AppState {
        auth,
        products,
        openapi: Arc::new(openapi_document()),
        prometheus,
        metrics_key: config.metrics_key.clone(),
    };
    let app = build_router(state, &config);

    let addr: SocketAddr = ([0, 0, 0, 0], config.port).into();
    info!(
        target = "unimart.api",
        environment = ?config.environment,
        "listening on {addr}"
    );

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app.into_make_service()).await?;
    Ok(())
}

type Stores = (
    Arc<dyn UserStore>,
    Arc<dyn ProductStore>,
    Arc<dyn ResetCodeStore>,
);

fn stores() -> Stores {
    match SupabaseStore::from_env() {
        Some(store) => {
            info!(target = "unimart.api", "using supabase store");
            (
                Arc::new(store.clone()),
                Arc::new(store.clone()),
                Arc::new(store),
            )
        }
        None => {
            warn!(
                target = "unimart.api",
                "SUPABASE_URL not set; data lives in memory and is lost on restart"
            );
            let store = MemoryStore::new();
            (
                Arc::new(store.clone()),
                Arc::new(store.clone()),
                Arc::new(store),
            )
        }
    }
}

fn mailer(config: &AppConfig) -> Arc<dyn Mailer> {
    match ResendMailer::from_env() {
        Some(mailer) => Arc::new(mailer),
        None if config.environment.is_production() => {
            warn!(target = "unimart.api", "RESEND_API_KEY not set; password resets will fail");
            Arc::new(DisabledMailer)
        }
        None => Arc::new(LogMailer),
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,tower_http=debug"));
    let _ = fmt().with_env_filter(filter).try_init();
}
