//! Application setup and router assembly.

use std::sync::Arc;

use anyhow::Result;
use axum::extract::Extension;
use axum::middleware;
use axum::routing::{get, post};
use axum::Router;
use sqlx::PgPool;
use tower_http::trace::TraceLayer;

use crate::config::Config;
use crate::kernel::AppKernel;
use crate::server::middleware::{
    app_auth_middleware, chair_auth_middleware, owner_auth_middleware,
};
use crate::server::routes::{app, chair, initialize, internal, notification, owner};

/// Build the axum application router.
///
/// Returns (Router, Arc<AppKernel>) - the kernel is needed to spawn the
/// dispatcher. The in-process tier is rebuilt from the relational store
/// before the router goes live.
pub async fn build_app(config: Config, pool: PgPool) -> Result<(Router, Arc<AppKernel>)> {
    let kernel = Arc::new(AppKernel::new(config, pool)?);
    kernel.rebuild().await?;

    // Registration endpoints issue their own session cookies
    let public_routes = Router::new()
        .route("/api/initialize", post(initialize::post_initialize))
        .route("/api/app/users", post(app::app_post_users))
        .route("/api/owner/owners", post(owner::owner_post_owners))
        .route("/api/chair/chairs", post(chair::chair_post_chairs));

    let app_routes = Router::new()
        .route("/api/app/payment-methods", post(app::app_post_payment_methods))
        .route("/api/app/rides", get(app::app_get_rides).post(app::app_post_rides))
        .route(
            "/api/app/rides/estimated-fare",
            post(app::app_post_rides_estimated_fare),
        )
        .route(
            "/api/app/rides/:ride_id/evaluation",
            post(app::app_post_ride_evaluation),
        )
        .route("/api/app/notification", get(notification::app_get_notification))
        .route("/api/app/nearby-chairs", get(app::app_get_nearby_chairs))
        .layer(middleware::from_fn(app_auth_middleware));

    let chair_routes = Router::new()
        .route("/api/chair/activity", post(chair::chair_post_activity))
        .route("/api/chair/coordinate", post(chair::chair_post_coordinate))
        .route(
            "/api/chair/notification",
            get(notification::chair_get_notification),
        )
        .route(
            "/api/chair/rides/:ride_id/status",
            post(chair::chair_post_ride_status),
        )
        .layer(middleware::from_fn(chair_auth_middleware));

    let owner_routes = Router::new()
        .route("/api/owner/chairs", get(owner::owner_get_chairs))
        .layer(middleware::from_fn(owner_auth_middleware));

    // The reverse proxy keeps this off the public surface
    let internal_routes =
        Router::new().route("/api/internal/matching", get(internal::internal_get_matching));

    let router = public_routes
        .merge(app_routes)
        .merge(chair_routes)
        .merge(owner_routes)
        .merge(internal_routes)
        .layer(Extension(kernel.clone()))
        .layer(TraceLayer::new_for_http());

    Ok((router, kernel))
}
