//! HTTP layer: axum app, middleware, route handlers.

pub mod app;
pub mod error;
pub mod middleware;
pub mod routes;

pub use app::build_app;
pub use error::{ApiError, ApiResult};
