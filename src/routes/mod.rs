mod auth;
mod products;

use crate::{
    auth::AuthService,
    config::AppConfig,
    error::AppError,
    products::ProductService,
    security::{authenticate, require_complete_profile, require_vendor},
};
use axum::{
    Json, Router,
    extract::{DefaultBodyLimit, State},
    http::{HeaderMap, HeaderValue, Method, StatusCode, header},
    middleware,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use metrics_exporter_prometheus::PrometheusHandle;
use serde_json::json;
use std::sync::Arc;
use tower_http::{
    cors::{AllowOrigin, CorsLayer},
    trace::TraceLayer,
};
use tracing::warn;

#[derive(Clone)]
pub struct AppState {
    pub auth: AuthService,
    pub products: ProductService,
    pub openapi: Arc<serde_json::Value>,
    pub prometheus: Option<PrometheusHandle>,
    pub metrics_key: Option<String>,
}

/// Parses the bundled OpenAPI document, falling back to a bare stub if it does not parse.
pub fn openapi_document() -> serde_json::Value {
    serde_yaml::from_str(include_str!("../../docs/openapi.yaml"))
        .unwrap_or(json!({"openapi": "3.0.3"}))
}

pub fn build_router(state: AppState, config: &AppConfig) -> Router {
    let auth_routes = Router::new()
        .route("/signup", post(auth::sign_up))
        .route("/complete-profile", post(auth::complete_profile))
        .route("/login", post(auth::login))
        .route("/logout", post(auth::logout))
        .route("/me", get(auth::me))
        .route("/forgot-password", post(auth::forgot_password))
        .route("/reset-password", post(auth::reset_password))
        .route("/google/callback", post(auth::google_callback));

    // route_layer runs the last-added layer first: authenticate, then vendor, then profile.
    let create_route = Router::new()
        .route("/create", post(products::create))
        .route_layer(middleware::from_fn(require_complete_profile))
        .route_layer(middleware::from_fn(require_vendor))
        .route_layer(middleware::from_fn_with_state(
            state.auth.clone(),
            authenticate,
        ));

    let vendor_routes = Router::new()
        .route("/my-products", get(products::my_products))
        .route(
            "/{id}",
            get(products::get_by_id)
                .put(products::update)
                .delete(products::delete),
        )
        .route_layer(middleware::from_fn(require_vendor))
        .route_layer(middleware::from_fn_with_state(
            state.auth.clone(),
            authenticate,
        ));

    let product_routes = Router::new()
        .route("/", get(products::all))
        .route("/school/{school}", get(products::by_school))
        .route("/category/{category}", get(products::by_category))
        .merge(create_route)
        .merge(vendor_routes);

    Router::new()
        .route("/health", get(health))
        .route("/metrics", get(metrics_endpoint))
        .route("/openapi.json", get(openapi_json))
        .nest(
            "/api",
            Router::new()
                .nest("/auth", auth_routes)
                .nest("/products", product_routes),
        )
        .with_state(state)
        .layer(cors_layer(&config.frontend_url))
        .layer(TraceLayer::new_for_http())
        .layer(DefaultBodyLimit::max(config.body_limit))
}

/// Credentialed CORS for the single configured frontend origin.
fn cors_layer(frontend_url: &str) -> CorsLayer {
    let origin = match frontend_url.parse::<HeaderValue>() {
        Ok(origin) => AllowOrigin::exact(origin),
        Err(err) => {
            warn!(target = "unimart.api", error = %err, "FRONTEND_URL is not a valid origin");
            AllowOrigin::list(Vec::<HeaderValue>::new())
        }
    };
    CorsLayer::new()
        .allow_origin(origin)
        .allow_credentials(true)
        .allow_methods([
            Method::GET,
            Method::POST,
            Method::PUT,
            Method::DELETE,
            Method::OPTIONS,
        ])
        .allow_headers([header::CONTENT_TYPE, header::AUTHORIZATION])
}

/// Liveness check.
///
/// - Method: `GET`
/// - Path: `/health`
/// - Auth: none
async fn health() -> Json<serde_json::Value> {
    Json(json!({
        "message": "UniMart API is running",
        "status": "ok",
    }))
}

async fn openapi_json(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json((*state.openapi).clone())
}

async fn metrics_endpoint(State(state): State<AppState>, headers: HeaderMap) -> Response {
    if let Some(secret) = &state.metrics_key {
        let presented = headers
            .get("X-Metrics-Key")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("");
        if presented != secret {
            return AppError::unauthorized("unauthorized").into_response();
        }
    }
    let body = state
        .prometheus
        .as_ref()
        .map(PrometheusHandle::render)
        .unwrap_or_default();
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        body,
    )
        .into_response()
}
