//! # actlabs_api
//!
//! HTTP API for the actlabs managed server.

pub mod config;
pub mod error;
pub mod handlers;
pub mod middleware;

use std::sync::Arc;

use axum::Router;
use axum::http::{HeaderValue, Method, header};
use axum::routing::{get, put};
use sqlx::PgPool;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{AllowOrigin, CorsLayer};

use actlabs_core::auth::TokenVerifier;
use actlabs_core::orchestrator::LifecycleOrchestrator;
use actlabs_core::rate_limit::RateLimiter;

use crate::config::{ApiConfig, origin_allowed};
use crate::handlers::server;

/// Shared application state passed to all handlers.
#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Arc<LifecycleOrchestrator>,
    pub verifier: Arc<dyn TokenVerifier>,
    pub rate_limiter: Arc<dyn RateLimiter>,
    /// API configuration.
    pub config: ApiConfig,
    /// Cancelled on shutdown; each request works under a child token.
    pub shutdown: CancellationToken,
}

/// Run embedded database migrations.
///
/// Delegates to `actlabs_core::migrate::migrate()` which owns the migration files.
pub async fn migrate(pool: &PgPool) -> Result<(), sqlx::migrate::MigrateError> {
    actlabs_core::migrate::migrate(pool).await
}

fn cors(allowed_origins: &[String]) -> CorsLayer {
    let allowed = allowed_origins.to_vec();
    CorsLayer::new()
        .allow_origin(AllowOrigin::predicate(
            move |origin: &HeaderValue, _request| {
                origin
                    .to_str()
                    .is_ok_and(|origin| origin_allowed(&allowed, origin))
            },
        ))
        .allow_methods([
            Method::GET,
            Method::POST,
            Method::PUT,
            Method::PATCH,
            Method::DELETE,
            Method::OPTIONS,
        ])
        .allow_headers([header::AUTHORIZATION, header::CONTENT_TYPE])
}

/// Builds the Axum router with all routes and shared state.
///
/// Every route sits behind the admission gate; CORS runs outside it so
/// preflight requests are answered without credentials.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route(
            "/server",
            get(server::get_server)
                .put(server::deploy_server)
                .delete(server::destroy_server),
        )
        .route(
            "/server/activity/{user_principal_name}",
            put(server::update_activity),
        )
        .layer(axum::middleware::from_fn_with_state(
            state.clone(),
            middleware::admission::admit,
        ))
        .layer(cors(&state.config.allowed_origins))
        .with_state(state)
}
