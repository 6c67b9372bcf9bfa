//! Chair-side handlers: registration, activity, coordinate pings and status
//! posts. The coordinate handler owns the ENROUTE->PICKUP and
//! CARRYING->ARRIVED transitions; the status handler owns the chair-driven
//! ENROUTE and CARRYING ones.

use std::sync::Arc;

use axum::extract::{Extension, Path};
use axum::http::{header::SET_COOKIE, StatusCode};
use axum::response::{AppendHeaders, IntoResponse, Response};
use axum::Json;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::common::{secure_token, ChairId, Coordinate, OwnerId, RideId};
use crate::domains::chair::{model_speed, Chair};
use crate::domains::owner::Owner;
use crate::domains::ride::{RidePhase, RideStatus};
use crate::kernel::{AppKernel, RideEvent};
use crate::server::error::{ApiError, ApiResult};
use crate::server::middleware::session_cookie;

#[derive(Deserialize)]
pub struct PostChairsRequest {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub model: String,
    #[serde(default)]
    pub chair_register_token: String,
}

#[derive(Serialize)]
pub struct PostChairsResponse {
    pub id: ChairId,
    pub owner_id: OwnerId,
}

pub async fn chair_post_chairs(
    Extension(kernel): Extension<Arc<AppKernel>>,
    Json(req): Json<PostChairsRequest>,
) -> ApiResult<Response> {
    if req.name.is_empty() || req.model.is_empty() || req.chair_register_token.is_empty() {
        return Err(ApiError::BadRequest(
            "some of required fields(name, model, chair_register_token) are empty".into(),
        ));
    }
    if model_speed(&req.model).is_none() {
        return Err(ApiError::BadRequest(format!(
            "unknown chair model: {}",
            req.model
        )));
    }

    let owner = Owner::find_by_chair_register_token(&kernel.pool, &req.chair_register_token)
        .await?
        .ok_or_else(|| ApiError::Unauthorized("invalid chair_register_token".into()))?;

    let chair_id = ChairId::new();
    let access_token = secure_token();

    Chair::insert(
        &kernel.pool,
        chair_id,
        owner.id,
        &req.name,
        &req.model,
        &access_token,
    )
    .await?;

    // New chairs start inactive; the idle pool only sees them after an
    // activity(true) post.
    if let Some(chair) = Chair::find(&kernel.pool, chair_id).await? {
        kernel.caches.chairs.insert(chair_id, chair.clone());
        kernel.caches.chair_tokens.insert(access_token.clone(), chair);
    }

    Ok((
        StatusCode::CREATED,
        AppendHeaders([(SET_COOKIE, session_cookie("chair_session", &access_token))]),
        Json(PostChairsResponse {
            id: chair_id,
            owner_id: owner.id,
        }),
    )
        .into_response())
}

#[derive(Deserialize)]
pub struct PostActivityRequest {
    pub is_active: bool,
}

pub async fn chair_post_activity(
    Extension(kernel): Extension<Arc<AppKernel>>,
    Extension(chair): Extension<Chair>,
    Json(req): Json<PostActivityRequest>,
) -> ApiResult<StatusCode> {
    Chair::set_active(&kernel.pool, chair.id, req.is_active).await?;

    let mut chair = chair;
    chair.is_active = req.is_active;
    kernel.caches.chairs.insert(chair.id, chair.clone());
    kernel
        .caches
        .chair_tokens
        .insert(chair.access_token.clone(), chair.clone());

    if req.is_active {
        let busy = matches!(
            kernel.statuses.chair_phase(chair.id)?,
            Some((phase, _)) if !phase.is_terminal()
        );
        if !busy {
            kernel.pools.add_idle_chair(chair).await;
        }
    } else {
        kernel.pools.remove_idle_chair(chair.id).await;
    }

    Ok(StatusCode::NO_CONTENT)
}

#[derive(Serialize)]
pub struct PostCoordinateResponse {
    pub recorded_at: i64,
}

pub async fn chair_post_coordinate(
    Extension(kernel): Extension<Arc<AppKernel>>,
    Extension(chair): Extension<Chair>,
    Json(coordinate): Json<Coordinate>,
) -> ApiResult<Json<PostCoordinateResponse>> {
    let now = Utc::now();

    let mut tx = kernel.pool.begin().await?;

    sqlx::query(
        "INSERT INTO chair_locations (id, chair_id, latitude, longitude, created_at)
         VALUES ($1, $2, $3, $4, $5)",
    )
    .bind(Uuid::now_v7())
    .bind(chair.id)
    .bind(coordinate.latitude)
    .bind(coordinate.longitude)
    .bind(now)
    .execute(&mut *tx)
    .await?;

    // A ping at the pickup or destination point drives the two
    // coordinate-triggered transitions. Repeated pings at the same point are
    // no-ops because the phase predicate no longer holds.
    let mut transition: Option<(RideEvent, crate::common::UserId)> = None;
    if let Some(ride) = kernel.caches.latest_ride_for_chair(&mut *tx, chair.id).await? {
        let phase = kernel.caches.ride_phase(&mut *tx, ride.id).await?;
        if let Some(phase) = phase.filter(|p| !p.is_terminal()) {
            let next = if coordinate == ride.pickup_coordinate() && phase == RidePhase::Enroute {
                Some(RidePhase::Pickup)
            } else if coordinate == ride.destination_coordinate() && phase == RidePhase::Carrying {
                Some(RidePhase::Arrived)
            } else {
                None
            };
            if let Some(next) = next {
                RideStatus::insert(&mut *tx, ride.id, next).await?;
                transition = Some((
                    RideEvent {
                        ride_id: ride.id,
                        phase: next,
                        chair_id: Some(chair.id),
                        evaluation: None,
                        updated_at: now,
                    },
                    ride.user_id,
                ));
            }
        }
    }

    tx.commit().await?;

    kernel
        .locations
        .update(chair.id, coordinate, now.timestamp_millis())?;

    if let Some((event, user_id)) = transition {
        kernel.caches.set_phase(event.ride_id, event.phase);
        kernel
            .statuses
            .set_chair_phase(chair.id, event.phase, event.ride_id)?;
        kernel.hub.publish_to_chair(chair.id, event.clone()).await;
        kernel.hub.publish_to_user(user_id, event).await;
    }

    Ok(Json(PostCoordinateResponse {
        recorded_at: now.timestamp_millis(),
    }))
}

#[derive(Deserialize)]
pub struct PostRideStatusRequest {
    #[serde(default)]
    pub status: String,
}

pub async fn chair_post_ride_status(
    Extension(kernel): Extension<Arc<AppKernel>>,
    Extension(chair): Extension<Chair>,
    Path(ride_id): Path<String>,
    Json(req): Json<PostRideStatusRequest>,
) -> ApiResult<StatusCode> {
    let ride_id =
        RideId::parse(&ride_id).map_err(|_| ApiError::NotFound("ride not found".into()))?;

    let mut tx = kernel.pool.begin().await?;

    let ride = crate::domains::ride::Ride::find_for_update(&mut *tx, ride_id)
        .await?
        .ok_or_else(|| ApiError::NotFound("ride not found".into()))?;

    if ride.chair_id != Some(chair.id) {
        return Err(ApiError::BadRequest("not assigned to this ride".into()));
    }

    let current = kernel
        .caches
        .ride_phase(&mut *tx, ride.id)
        .await?
        .ok_or_else(|| ApiError::NotFound("ride not found".into()))?;

    // The chair may only report ENROUTE and CARRYING; the rest of the
    // machine is driven by coordinate pings and the evaluation handler.
    let next = match req.status.as_str() {
        "ENROUTE" => {
            if current != RidePhase::Matched {
                return Err(ApiError::BadRequest("ride is not matched yet".into()));
            }
            RidePhase::Enroute
        }
        "CARRYING" => {
            if current != RidePhase::Pickup {
                return Err(ApiError::BadRequest("chair has not arrived yet".into()));
            }
            RidePhase::Carrying
        }
        _ => return Err(ApiError::BadRequest("invalid status".into())),
    };

    RideStatus::insert(&mut *tx, ride.id, next).await?;
    tx.commit().await?;

    kernel.caches.set_phase(ride.id, next);
    kernel.statuses.set_chair_phase(chair.id, next, ride.id)?;

    let event = RideEvent {
        ride_id: ride.id,
        phase: next,
        chair_id: Some(chair.id),
        evaluation: None,
        updated_at: Utc::now(),
    };
    kernel.hub.publish_to_chair(chair.id, event.clone()).await;
    kernel.hub.publish_to_user(ride.user_id, event).await;

    Ok(StatusCode::NO_CONTENT)
}
