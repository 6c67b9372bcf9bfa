//! POST /api/initialize: reset state and rebuild the in-process tier.

use std::sync::Arc;

use anyhow::Context;
use axum::extract::Extension;
use axum::Json;
use serde::{Deserialize, Serialize};

use crate::kernel::AppKernel;
use crate::server::error::{ApiError, ApiResult};

#[derive(Deserialize)]
pub struct InitializeRequest {
    pub payment_server: String,
}

#[derive(Serialize)]
pub struct InitializeResponse {
    pub language: &'static str,
}

pub async fn post_initialize(
    Extension(kernel): Extension<Arc<AppKernel>>,
    Json(req): Json<InitializeRequest>,
) -> ApiResult<Json<InitializeResponse>> {
    if req.payment_server.is_empty() {
        return Err(ApiError::BadRequest("payment_server is required".into()));
    }

    // Schema reset is an external collaborator's job; hook it in if provided.
    if let Some(script) = &kernel.config.init_script {
        let output = tokio::process::Command::new(script)
            .output()
            .await
            .with_context(|| format!("failed to run reset script {script}"))?;
        if !output.status.success() {
            return Err(ApiError::Internal(anyhow::anyhow!(
                "reset script failed: {}",
                String::from_utf8_lossy(&output.stderr)
            )));
        }
    }

    sqlx::query("UPDATE settings SET value = $1 WHERE name = 'payment_gateway_url'")
        .bind(&req.payment_server)
        .execute(&kernel.pool)
        .await?;

    kernel.rebuild().await?;

    Ok(Json(InitializeResponse { language: "rust" }))
}
