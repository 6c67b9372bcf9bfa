//! Loopback hook for triggering a matching pass from outside the process.
//! The reverse proxy keeps this path off the public surface.

use std::sync::Arc;

use axum::extract::Extension;
use axum::http::StatusCode;

use crate::kernel::{run_matching_tick, AppKernel};
use crate::server::error::ApiResult;

pub async fn internal_get_matching(
    Extension(kernel): Extension<Arc<AppKernel>>,
) -> ApiResult<StatusCode> {
    run_matching_tick(&kernel).await?;
    Ok(StatusCode::NO_CONTENT)
}
