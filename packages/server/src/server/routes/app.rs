//! User-side handlers: registration, payment methods, ride creation, fare
//! estimates, evaluation, ride history and the nearby-chairs query.

use std::sync::Arc;

use axum::extract::{Extension, Path, Query};
use axum::http::{header::SET_COOKIE, StatusCode};
use axum::response::{AppendHeaders, IntoResponse, Response};
use axum::Json;
use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::common::{secure_token, Coordinate, RideId, UserId};
use crate::domains::ride::{
    calculate_discounted_fare, calculate_fare, Ride, RidePhase, RideStatus,
};
use crate::domains::user::{
    Coupon, PaymentToken, User, INVITATION_CODE_MAX_USES, INVITATION_COUPON_DISCOUNT,
    INVITATION_REWARD_DISCOUNT, NEW_USER_COUPON_CODE, NEW_USER_COUPON_DISCOUNT,
};
use crate::kernel::{AppKernel, RideEvent};
use crate::server::error::{ApiError, ApiResult};
use crate::server::middleware::session_cookie;

// =============================================================================
// Registration
// =============================================================================

#[derive(Deserialize)]
pub struct PostUsersRequest {
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub firstname: String,
    #[serde(default)]
    pub lastname: String,
    #[serde(default)]
    pub date_of_birth: String,
    pub invitation_code: Option<String>,
}

#[derive(Serialize)]
pub struct PostUsersResponse {
    pub id: UserId,
    pub invitation_code: String,
}

pub async fn app_post_users(
    Extension(kernel): Extension<Arc<AppKernel>>,
    Json(req): Json<PostUsersRequest>,
) -> ApiResult<Response> {
    if req.username.is_empty()
        || req.firstname.is_empty()
        || req.lastname.is_empty()
        || req.date_of_birth.is_empty()
    {
        return Err(ApiError::BadRequest(
            "required fields(username, firstname, lastname, date_of_birth) are empty".into(),
        ));
    }

    let user_id = UserId::new();
    let access_token = secure_token();
    let invitation_code = secure_token();

    let mut tx = kernel.pool.begin().await?;

    User::insert(
        &mut *tx,
        user_id,
        &req.username,
        &req.firstname,
        &req.lastname,
        &req.date_of_birth,
        &access_token,
        &invitation_code,
    )
    .await?;

    // Signup campaign coupon
    Coupon::grant(&mut *tx, user_id, NEW_USER_COUPON_CODE, NEW_USER_COUPON_DISCOUNT).await?;

    if let Some(code) = req.invitation_code.as_deref().filter(|c| !c.is_empty()) {
        let invitation_coupon_code = format!("INV_{code}");

        // The locked count arbitrates concurrent signups with the same code.
        let uses = Coupon::count_for_code_locked(&mut *tx, &invitation_coupon_code).await?;
        if uses >= INVITATION_CODE_MAX_USES {
            return Err(ApiError::BadRequest(
                "this invitation code can no longer be used".into(),
            ));
        }

        let inviter = User::find_by_invitation_code(&mut *tx, code)
            .await?
            .ok_or_else(|| ApiError::BadRequest("this invitation code cannot be used".into()))?;

        Coupon::grant(
            &mut *tx,
            user_id,
            &invitation_coupon_code,
            INVITATION_COUPON_DISCOUNT,
        )
        .await?;
        let reward_code = format!("RWD_{code}_{}", Utc::now().timestamp_millis());
        Coupon::grant(&mut *tx, inviter.id, &reward_code, INVITATION_REWARD_DISCOUNT).await?;
    }

    tx.commit().await?;

    if let Some(user) = User::find(&kernel.pool, user_id).await? {
        kernel.caches.user_tokens.insert(access_token.clone(), user);
    }

    Ok((
        StatusCode::CREATED,
        AppendHeaders([(SET_COOKIE, session_cookie("app_session", &access_token))]),
        Json(PostUsersResponse {
            id: user_id,
            invitation_code,
        }),
    )
        .into_response())
}

// =============================================================================
// Payment methods
// =============================================================================

#[derive(Deserialize)]
pub struct PostPaymentMethodsRequest {
    #[serde(default)]
    pub token: String,
}

pub async fn app_post_payment_methods(
    Extension(kernel): Extension<Arc<AppKernel>>,
    Extension(user): Extension<User>,
    Json(req): Json<PostPaymentMethodsRequest>,
) -> ApiResult<StatusCode> {
    if req.token.is_empty() {
        return Err(ApiError::BadRequest(
            "token is required but was empty".into(),
        ));
    }

    PaymentToken::upsert(&kernel.pool, user.id, &req.token).await?;
    kernel.caches.payment_tokens.insert(user.id, req.token);

    Ok(StatusCode::NO_CONTENT)
}

// =============================================================================
// Ride history
// =============================================================================

#[derive(Serialize)]
pub struct GetRidesResponse {
    pub rides: Vec<GetRidesItem>,
}

#[derive(Serialize)]
pub struct GetRidesItem {
    pub id: RideId,
    pub pickup_coordinate: Coordinate,
    pub destination_coordinate: Coordinate,
    pub chair: GetRidesItemChair,
    pub fare: i64,
    pub evaluation: i32,
    pub requested_at: i64,
    pub completed_at: i64,
}

#[derive(Serialize)]
pub struct GetRidesItemChair {
    pub id: String,
    pub owner: String,
    pub name: String,
    pub model: String,
}

pub async fn app_get_rides(
    Extension(kernel): Extension<Arc<AppKernel>>,
    Extension(user): Extension<User>,
) -> ApiResult<Json<GetRidesResponse>> {
    let rides = Ride::all_for_user(&kernel.pool, user.id).await?;

    let mut items = Vec::new();
    for ride in rides {
        let phase = kernel.caches.ride_phase(&kernel.pool, ride.id).await?;
        if phase != Some(RidePhase::Completed) {
            continue;
        }

        let discount = Coupon::discount_for_ride(&kernel.pool, ride.id).await?;
        let fare = calculate_discounted_fare(
            ride.pickup_coordinate(),
            ride.destination_coordinate(),
            discount,
        );

        let chair_id = ride
            .chair_id
            .ok_or_else(|| ApiError::Internal(anyhow::anyhow!("completed ride has no chair")))?;
        let chair = crate::domains::chair::Chair::find(&kernel.pool, chair_id)
            .await?
            .ok_or_else(|| ApiError::Internal(anyhow::anyhow!("chair not found")))?;
        let owner = crate::domains::owner::Owner::find(&kernel.pool, chair.owner_id)
            .await?
            .ok_or_else(|| ApiError::Internal(anyhow::anyhow!("owner not found")))?;

        items.push(GetRidesItem {
            id: ride.id,
            pickup_coordinate: ride.pickup_coordinate(),
            destination_coordinate: ride.destination_coordinate(),
            chair: GetRidesItemChair {
                id: chair.id.to_string(),
                owner: owner.name,
                name: chair.name,
                model: chair.model,
            },
            fare,
            evaluation: ride.evaluation.unwrap_or(0),
            requested_at: ride.created_at.timestamp_millis(),
            completed_at: ride.updated_at.timestamp_millis(),
        });
    }

    Ok(Json(GetRidesResponse { rides: items }))
}

// =============================================================================
// Ride creation & fare estimate
// =============================================================================

#[derive(Deserialize)]
pub struct PostRidesRequest {
    pub pickup_coordinate: Option<Coordinate>,
    pub destination_coordinate: Option<Coordinate>,
}

#[derive(Serialize)]
pub struct PostRidesResponse {
    pub ride_id: RideId,
    pub fare: i64,
}

pub async fn app_post_rides(
    Extension(kernel): Extension<Arc<AppKernel>>,
    Extension(user): Extension<User>,
    Json(req): Json<PostRidesRequest>,
) -> ApiResult<Response> {
    let (pickup, destination) = match (req.pickup_coordinate, req.destination_coordinate) {
        (Some(p), Some(d)) => (p, d),
        _ => {
            return Err(ApiError::BadRequest(
                "required fields(pickup_coordinate, destination_coordinate) are empty".into(),
            ))
        }
    };

    // Fast path: the status store already knows about an unfinished ride.
    if kernel.statuses.user_has_active_ride(user.id)? {
        return Err(ApiError::Conflict("ride already exists".into()));
    }

    let now = Utc::now();
    let ride_id = RideId::new();

    let mut tx = kernel.pool.begin().await?;

    // The relational store stays authoritative for the one-active-ride rule.
    if Ride::ongoing_count_for_user(&mut *tx, user.id).await? > 0 {
        return Err(ApiError::Conflict("ride already exists".into()));
    }

    Ride::insert(&mut *tx, ride_id, user.id, pickup, destination, now).await?;
    RideStatus::insert(&mut *tx, ride_id, RidePhase::Matching).await?;

    let ride_count = Ride::count_for_user(&mut *tx, user.id).await?;

    // First ride burns the signup coupon if it is still there; otherwise the
    // oldest unused coupon is bound, FIFO by grant time.
    let coupon = if ride_count == 1 {
        match Coupon::unused_new_user_locked(&mut *tx, user.id).await? {
            Some(coupon) => Some(coupon),
            None => Coupon::oldest_unused_locked(&mut *tx, user.id).await?,
        }
    } else {
        Coupon::oldest_unused_locked(&mut *tx, user.id).await?
    };
    if let Some(coupon) = &coupon {
        Coupon::bind_to_ride(&mut *tx, user.id, &coupon.code, ride_id).await?;
    }

    let ride = Ride::find(&mut *tx, ride_id)
        .await?
        .ok_or_else(|| ApiError::Internal(anyhow::anyhow!("ride vanished during creation")))?;

    let discount = coupon.map(|c| c.discount).unwrap_or(0);
    let fare = calculate_discounted_fare(pickup, destination, discount);

    tx.commit().await?;

    kernel.caches.store_ride(ride.clone());
    kernel.caches.set_phase(ride_id, RidePhase::Matching);
    kernel.statuses.set_user_active(user.id, true)?;
    kernel.pools.enqueue_ride(ride).await;
    kernel
        .hub
        .publish_to_user(
            user.id,
            RideEvent {
                ride_id,
                phase: RidePhase::Matching,
                chair_id: None,
                evaluation: None,
                updated_at: now,
            },
        )
        .await;

    Ok((
        StatusCode::ACCEPTED,
        Json(PostRidesResponse { ride_id, fare }),
    )
        .into_response())
}

#[derive(Deserialize)]
pub struct EstimatedFareRequest {
    pub pickup_coordinate: Option<Coordinate>,
    pub destination_coordinate: Option<Coordinate>,
}

#[derive(Serialize)]
pub struct EstimatedFareResponse {
    pub fare: i64,
    pub discount: i64,
}

pub async fn app_post_rides_estimated_fare(
    Extension(kernel): Extension<Arc<AppKernel>>,
    Extension(user): Extension<User>,
    Json(req): Json<EstimatedFareRequest>,
) -> ApiResult<Json<EstimatedFareResponse>> {
    let (pickup, destination) = match (req.pickup_coordinate, req.destination_coordinate) {
        (Some(p), Some(d)) => (p, d),
        _ => {
            return Err(ApiError::BadRequest(
                "required fields(pickup_coordinate, destination_coordinate) are empty".into(),
            ))
        }
    };

    // Same coupon priority as ride creation, but nothing is bound.
    let mut conn = kernel.pool.acquire().await?;
    let discount = Coupon::available_discount(&mut *conn, user.id).await?;

    let discounted = calculate_discounted_fare(pickup, destination, discount);
    Ok(Json(EstimatedFareResponse {
        fare: discounted,
        discount: calculate_fare(pickup, destination) - discounted,
    }))
}

// =============================================================================
// Evaluation
// =============================================================================

#[derive(Deserialize)]
pub struct PostRideEvaluationRequest {
    #[serde(default)]
    pub evaluation: i32,
}

#[derive(Serialize)]
pub struct PostRideEvaluationResponse {
    pub completed_at: i64,
}

pub async fn app_post_ride_evaluation(
    Extension(kernel): Extension<Arc<AppKernel>>,
    Extension(_user): Extension<User>,
    Path(ride_id): Path<String>,
    Json(req): Json<PostRideEvaluationRequest>,
) -> ApiResult<Json<PostRideEvaluationResponse>> {
    let ride_id =
        RideId::parse(&ride_id).map_err(|_| ApiError::NotFound("ride not found".into()))?;

    if !(1..=5).contains(&req.evaluation) {
        return Err(ApiError::BadRequest(
            "evaluation must be between 1 and 5".into(),
        ));
    }

    let now = Utc::now();
    let mut tx = kernel.pool.begin().await?;

    let ride = Ride::find(&mut *tx, ride_id)
        .await?
        .ok_or_else(|| ApiError::NotFound("ride not found".into()))?;

    let phase = kernel
        .caches
        .ride_phase(&mut *tx, ride.id)
        .await?
        .ok_or_else(|| ApiError::NotFound("ride not found".into()))?;
    if phase != RidePhase::Arrived {
        return Err(ApiError::BadRequest("not arrived yet".into()));
    }

    if !Ride::set_evaluation(&mut *tx, ride_id, req.evaluation, now).await? {
        return Err(ApiError::NotFound("ride not found".into()));
    }
    RideStatus::insert(&mut *tx, ride_id, RidePhase::Completed).await?;

    let ride = Ride::find(&mut *tx, ride_id)
        .await?
        .ok_or_else(|| ApiError::NotFound("ride not found".into()))?;

    let cached_token = kernel
        .caches
        .payment_tokens
        .get(&ride.user_id)
        .map(|t| t.value().clone());
    let payment_token = match cached_token {
        Some(token) => token,
        None => PaymentToken::find(&mut *tx, ride.user_id)
            .await?
            .map(|t| t.token)
            .ok_or_else(|| ApiError::BadRequest("payment token not registered".into()))?,
    };

    let discount = Coupon::discount_for_ride(&mut *tx, ride_id).await?;
    let fare = calculate_discounted_fare(
        ride.pickup_coordinate(),
        ride.destination_coordinate(),
        discount,
    );

    let (gateway_url,): (String,) =
        sqlx::query_as("SELECT value FROM settings WHERE name = 'payment_gateway_url'")
            .fetch_one(&mut *tx)
            .await?;

    kernel
        .payment
        .post_payment(&gateway_url, &payment_token, fare)
        .await?;

    tx.commit().await?;

    kernel.caches.store_ride(ride.clone());
    kernel.caches.set_phase(ride_id, RidePhase::Completed);
    kernel.statuses.set_user_active(ride.user_id, false)?;

    let event = RideEvent {
        ride_id,
        phase: RidePhase::Completed,
        chair_id: ride.chair_id,
        evaluation: Some(req.evaluation),
        updated_at: now,
    };
    if let Some(chair_id) = ride.chair_id {
        kernel
            .statuses
            .set_chair_phase(chair_id, RidePhase::Completed, ride_id)?;
        kernel.hub.publish_to_chair(chair_id, event.clone()).await;
    }
    kernel.hub.publish_to_user(ride.user_id, event).await;

    Ok(Json(PostRideEvaluationResponse {
        completed_at: ride.updated_at.timestamp_millis(),
    }))
}

// =============================================================================
// Nearby chairs
// =============================================================================

const DEFAULT_NEARBY_DISTANCE: i64 = 50;

#[derive(Deserialize)]
pub struct NearbyChairsQuery {
    pub latitude: Option<i64>,
    pub longitude: Option<i64>,
    pub distance: Option<i64>,
}

#[derive(Serialize)]
pub struct NearbyChairsResponse {
    pub chairs: Vec<NearbyChairItem>,
    pub retrieved_at: i64,
}

#[derive(Serialize)]
pub struct NearbyChairItem {
    pub id: String,
    pub name: String,
    pub model: String,
    pub current_coordinate: Coordinate,
}

pub async fn app_get_nearby_chairs(
    Extension(kernel): Extension<Arc<AppKernel>>,
    Extension(_user): Extension<User>,
    Query(query): Query<NearbyChairsQuery>,
) -> ApiResult<Json<NearbyChairsResponse>> {
    let (latitude, longitude) = match (query.latitude, query.longitude) {
        (Some(lat), Some(lon)) => (lat, lon),
        _ => {
            return Err(ApiError::BadRequest(
                "latitude or longitude is empty".into(),
            ))
        }
    };
    let center = Coordinate::new(latitude, longitude);
    let distance = query.distance.unwrap_or(DEFAULT_NEARBY_DISTANCE);

    let active_chairs: Vec<_> = kernel
        .caches
        .chairs
        .iter()
        .filter(|entry| entry.value().is_active)
        .map(|entry| entry.value().clone())
        .collect();

    let mut chairs = Vec::new();
    for chair in active_chairs {
        // Chairs still working a ride are not nearby candidates.
        let latest_ride_id = kernel
            .caches
            .latest_ride_by_chair
            .get(&chair.id)
            .map(|r| r.id);
        if let Some(ride_id) = latest_ride_id {
            let phase = kernel.caches.ride_phase(&kernel.pool, ride_id).await?;
            if phase != Some(RidePhase::Completed) {
                continue;
            }
        }

        let Some(location) = kernel.locations.get(chair.id)? else {
            continue;
        };
        let coordinate = location.last_coordinate();
        if center.manhattan_distance(&coordinate) <= distance {
            chairs.push(NearbyChairItem {
                id: chair.id.to_string(),
                name: chair.name.clone(),
                model: chair.model.clone(),
                current_coordinate: coordinate,
            });
        }
    }

    Ok(Json(NearbyChairsResponse {
        chairs,
        retrieved_at: Utc::now().timestamp_millis(),
    }))
}
