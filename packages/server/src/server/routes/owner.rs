//! Owner-side handlers: registration and fleet chair listing.

use std::sync::Arc;

use axum::extract::Extension;
use axum::http::{header::SET_COOKIE, StatusCode};
use axum::response::{AppendHeaders, IntoResponse, Response};
use axum::Json;
use serde::{Deserialize, Serialize};

use crate::common::{secure_token, OwnerId};
use crate::domains::chair::Chair;
use crate::domains::owner::Owner;
use crate::kernel::AppKernel;
use crate::server::error::{ApiError, ApiResult};
use crate::server::middleware::session_cookie;

#[derive(Deserialize)]
pub struct PostOwnersRequest {
    #[serde(default)]
    pub name: String,
}

#[derive(Serialize)]
pub struct PostOwnersResponse {
    pub id: OwnerId,
    pub chair_register_token: String,
}

pub async fn owner_post_owners(
    Extension(kernel): Extension<Arc<AppKernel>>,
    Json(req): Json<PostOwnersRequest>,
) -> ApiResult<Response> {
    if req.name.is_empty() {
        return Err(ApiError::BadRequest(
            "some of required fields(name) are empty".into(),
        ));
    }

    let owner_id = OwnerId::new();
    let access_token = secure_token();
    let chair_register_token = secure_token();

    Owner::insert(
        &kernel.pool,
        owner_id,
        &req.name,
        &access_token,
        &chair_register_token,
    )
    .await?;

    Ok((
        StatusCode::CREATED,
        AppendHeaders([(SET_COOKIE, session_cookie("owner_session", &access_token))]),
        Json(PostOwnersResponse {
            id: owner_id,
            chair_register_token,
        }),
    )
        .into_response())
}

#[derive(Serialize)]
pub struct OwnerChairsResponse {
    pub chairs: Vec<OwnerChairItem>,
}

#[derive(Serialize)]
pub struct OwnerChairItem {
    pub id: String,
    pub name: String,
    pub model: String,
    pub active: bool,
    pub registered_at: i64,
    pub total_distance: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_distance_updated_at: Option<i64>,
}

pub async fn owner_get_chairs(
    Extension(kernel): Extension<Arc<AppKernel>>,
    Extension(owner): Extension<Owner>,
) -> ApiResult<Json<OwnerChairsResponse>> {
    let chairs = Chair::for_owner(&kernel.pool, owner.id).await?;
    let ids: Vec<_> = chairs.iter().map(|c| c.id).collect();
    let locations = kernel.locations.get_many(&ids)?;

    let chairs = chairs
        .into_iter()
        .map(|chair| {
            let location = locations.get(&chair.id);
            OwnerChairItem {
                id: chair.id.to_string(),
                name: chair.name,
                model: chair.model,
                active: chair.is_active,
                registered_at: chair.created_at.timestamp_millis(),
                total_distance: location.map(|l| l.total_distance).unwrap_or(0),
                total_distance_updated_at: location.map(|l| l.updated_at_ms),
            }
        })
        .collect();

    Ok(Json(OwnerChairsResponse { chairs }))
}
