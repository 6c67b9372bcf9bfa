//! Long-lived notification streams for users and chairs.
//!
//! Each stream sends an immediate snapshot of the caller's latest ride, then
//! one frame per state transition received on the event hub, as
//! `data: <json>` SSE frames. After every frame the oldest undelivered
//! transition is marked delivered for that side, so a reconnect never
//! re-emits an acknowledged transition (it does get one current-state
//! opening frame). The stream ends after a COMPLETED frame, on client
//! disconnect, or on any send or database error.

use std::convert::Infallible;
use std::sync::Arc;

use anyhow::Result;
use axum::extract::Extension;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use tokio::sync::{broadcast, mpsc};
use tokio_stream::wrappers::ReceiverStream;

use crate::common::{ChairId, Coordinate, RideId};
use crate::domains::chair::Chair;
use crate::domains::ride::{calculate_discounted_fare, ChairStats, Ride, RidePhase, RideStatus};
use crate::domains::user::{Coupon, User};
use crate::kernel::{AppKernel, RideEvent};
use crate::server::error::ApiResult;

/// Polling fallback returned when the caller has no ride yet.
#[derive(Serialize)]
struct NotificationRetryResponse {
    data: Option<()>,
    retry_after_ms: i64,
}

fn retry_response() -> Response {
    Json(NotificationRetryResponse {
        data: None,
        retry_after_ms: 100,
    })
    .into_response()
}

type FrameSender = mpsc::Sender<Result<Event, Infallible>>;

/// Serialize and enqueue one frame. Err means the client is gone.
async fn send_frame<T: Serialize>(tx: &FrameSender, payload: &T) -> Result<(), ()> {
    let event = Event::default().json_data(payload).map_err(|_| ())?;
    tx.send(Ok(event)).await.map_err(|_| ())
}

// =============================================================================
// User side
// =============================================================================

#[derive(Serialize, Clone)]
struct AppNotificationData {
    ride_id: RideId,
    pickup_coordinate: Coordinate,
    destination_coordinate: Coordinate,
    fare: i64,
    status: RidePhase,
    #[serde(skip_serializing_if = "Option::is_none")]
    chair: Option<AppNotificationChair>,
    created_at: i64,
    updated_at: i64,
}

#[derive(Serialize, Clone)]
struct AppNotificationChair {
    id: String,
    name: String,
    model: String,
    stats: AppNotificationChairStats,
}

#[derive(Serialize, Clone)]
struct AppNotificationChairStats {
    total_rides_count: i64,
    total_evaluation_avg: f64,
}

impl From<ChairStats> for AppNotificationChairStats {
    fn from(stats: ChairStats) -> Self {
        Self {
            total_rides_count: stats.total_rides_count,
            total_evaluation_avg: stats.evaluation_average(),
        }
    }
}

async fn chair_summary(
    kernel: &AppKernel,
    chair_id: ChairId,
) -> Result<(AppNotificationChair, ChairStats)> {
    let cached = kernel
        .caches
        .chairs
        .get(&chair_id)
        .map(|c| c.value().clone());
    let chair = match cached {
        Some(chair) => chair,
        None => Chair::find(&kernel.pool, chair_id)
            .await?
            .ok_or_else(|| anyhow::anyhow!("chair not found"))?,
    };
    let stats = ChairStats::for_chair(&kernel.pool, chair_id).await?;
    Ok((
        AppNotificationChair {
            id: chair.id.to_string(),
            name: chair.name,
            model: chair.model,
            stats: stats.into(),
        },
        stats,
    ))
}

async fn build_app_payload(
    kernel: &AppKernel,
    ride: &Ride,
    status: RidePhase,
) -> Result<(AppNotificationData, ChairStats)> {
    let discount = Coupon::discount_for_ride(&kernel.pool, ride.id).await?;
    let fare = calculate_discounted_fare(
        ride.pickup_coordinate(),
        ride.destination_coordinate(),
        discount,
    );

    let mut stats = ChairStats::default();
    let chair = match ride.chair_id {
        Some(chair_id) => {
            let (chair, chair_stats) = chair_summary(kernel, chair_id).await?;
            stats = chair_stats;
            Some(chair)
        }
        None => None,
    };

    Ok((
        AppNotificationData {
            ride_id: ride.id,
            pickup_coordinate: ride.pickup_coordinate(),
            destination_coordinate: ride.destination_coordinate(),
            fare,
            status,
            chair,
            created_at: ride.created_at.timestamp_millis(),
            updated_at: ride.updated_at.timestamp_millis(),
        },
        stats,
    ))
}

pub async fn app_get_notification(
    Extension(kernel): Extension<Arc<AppKernel>>,
    Extension(user): Extension<User>,
) -> ApiResult<Response> {
    let Some(ride) = Ride::latest_for_user(&kernel.pool, user.id).await? else {
        return Ok(retry_response());
    };

    // Subscribe before the snapshot so no transition falls into the gap.
    let rx = kernel.hub.subscribe_user(user.id).await;

    let status = kernel
        .caches
        .ride_phase(&kernel.pool, ride.id)
        .await?
        .unwrap_or(RidePhase::Matching);
    let (payload, stats) = build_app_payload(&kernel, &ride, status).await?;

    let (tx, frames) = mpsc::channel(16);
    tokio::spawn(app_notification_pump(kernel, payload, stats, rx, tx));

    Ok(Sse::new(ReceiverStream::new(frames))
        .keep_alive(KeepAlive::default())
        .into_response())
}

async fn app_notification_pump(
    kernel: Arc<AppKernel>,
    mut payload: AppNotificationData,
    mut stats: ChairStats,
    mut rx: broadcast::Receiver<RideEvent>,
    tx: FrameSender,
) {
    if send_frame(&tx, &payload).await.is_err() {
        return;
    }
    if let Err(e) = RideStatus::mark_app_sent(&kernel.pool, payload.ride_id).await {
        tracing::warn!(error = %format!("{e:#}"), "failed to mark user notification delivered");
        return;
    }
    if payload.status == RidePhase::Completed {
        return;
    }

    loop {
        let event = match rx.recv().await {
            Ok(event) => event,
            // A lagged subscriber just misses frames; the next event carries
            // the current phase.
            Err(broadcast::error::RecvError::Lagged(_)) => continue,
            Err(broadcast::error::RecvError::Closed) => return,
        };

        match event.phase {
            RidePhase::Matching => {
                // A new ride started; rebuild the payload around it.
                let ride = match Ride::find(&kernel.pool, event.ride_id).await {
                    Ok(Some(ride)) => ride,
                    Ok(None) => return,
                    Err(e) => {
                        tracing::warn!(error = %format!("{e:#}"), "user notification stream lost");
                        return;
                    }
                };
                match build_app_payload(&kernel, &ride, RidePhase::Matching).await {
                    Ok((next_payload, next_stats)) => {
                        payload = next_payload;
                        stats = next_stats;
                    }
                    Err(e) => {
                        tracing::warn!(error = %format!("{e:#}"), "user notification stream lost");
                        return;
                    }
                }
            }
            RidePhase::Matched => {
                let Some(chair_id) = event.chair_id else {
                    continue;
                };
                match chair_summary(&kernel, chair_id).await {
                    Ok((chair, chair_stats)) => {
                        payload.chair = Some(chair);
                        stats = chair_stats;
                    }
                    Err(e) => {
                        tracing::warn!(error = %format!("{e:#}"), "user notification stream lost");
                        return;
                    }
                }
                payload.status = RidePhase::Matched;
                payload.updated_at = event.updated_at.timestamp_millis();
            }
            RidePhase::Enroute | RidePhase::Pickup | RidePhase::Carrying | RidePhase::Arrived => {
                payload.status = event.phase;
                payload.updated_at = event.updated_at.timestamp_millis();
            }
            RidePhase::Completed => {
                payload.status = RidePhase::Completed;
                payload.updated_at = event.updated_at.timestamp_millis();
                stats.total_rides_count += 1;
                stats.total_evaluation += event.evaluation.unwrap_or(0) as i64;
                if let Some(chair) = &mut payload.chair {
                    chair.stats = stats.into();
                }
            }
        }

        if send_frame(&tx, &payload).await.is_err() {
            return;
        }
        if let Err(e) = RideStatus::mark_app_sent(&kernel.pool, payload.ride_id).await {
            tracing::warn!(error = %format!("{e:#}"), "failed to mark user notification delivered");
            return;
        }
        if event.phase == RidePhase::Completed {
            return;
        }
    }
}

// =============================================================================
// Chair side
// =============================================================================

#[derive(Serialize, Clone)]
struct SimpleUser {
    id: String,
    name: String,
}

#[derive(Serialize, Clone)]
struct ChairNotificationData {
    ride_id: RideId,
    user: SimpleUser,
    pickup_coordinate: Coordinate,
    destination_coordinate: Coordinate,
    status: RidePhase,
}

async fn build_chair_payload(
    kernel: &AppKernel,
    ride: &Ride,
    status: RidePhase,
) -> Result<ChairNotificationData> {
    let user = User::find(&kernel.pool, ride.user_id)
        .await?
        .ok_or_else(|| anyhow::anyhow!("user not found"))?;
    Ok(ChairNotificationData {
        ride_id: ride.id,
        user: SimpleUser {
            id: user.id.to_string(),
            name: format!("{} {}", user.firstname, user.lastname),
        },
        pickup_coordinate: ride.pickup_coordinate(),
        destination_coordinate: ride.destination_coordinate(),
        status,
    })
}

pub async fn chair_get_notification(
    Extension(kernel): Extension<Arc<AppKernel>>,
    Extension(chair): Extension<Chair>,
) -> ApiResult<Response> {
    let Some(ride) = kernel
        .caches
        .latest_ride_for_chair(&kernel.pool, chair.id)
        .await?
    else {
        return Ok(retry_response());
    };

    let rx = kernel.hub.subscribe_chair(chair.id).await;

    let status = kernel
        .caches
        .ride_phase(&kernel.pool, ride.id)
        .await?
        .unwrap_or(RidePhase::Matching);
    let payload = build_chair_payload(&kernel, &ride, status).await?;

    let (tx, frames) = mpsc::channel(16);
    tokio::spawn(chair_notification_pump(kernel, chair, payload, rx, tx));

    Ok(Sse::new(ReceiverStream::new(frames))
        .keep_alive(KeepAlive::default())
        .into_response())
}

/// After the chair sees its COMPLETED frame it is free again and re-enters
/// the idle pool.
async fn release_chair(kernel: &AppKernel, chair_id: ChairId) {
    let chair = kernel
        .caches
        .chairs
        .get(&chair_id)
        .map(|c| c.value().clone());
    if let Some(chair) = chair.filter(|c| c.is_active) {
        kernel.pools.add_idle_chair(chair).await;
    }
}

async fn chair_notification_pump(
    kernel: Arc<AppKernel>,
    chair: Chair,
    mut payload: ChairNotificationData,
    mut rx: broadcast::Receiver<RideEvent>,
    tx: FrameSender,
) {
    if send_frame(&tx, &payload).await.is_err() {
        return;
    }
    if let Err(e) = RideStatus::mark_chair_sent(&kernel.pool, payload.ride_id).await {
        tracing::warn!(error = %format!("{e:#}"), "failed to mark chair notification delivered");
        return;
    }
    if payload.status == RidePhase::Completed {
        release_chair(&kernel, chair.id).await;
        return;
    }

    loop {
        let event = match rx.recv().await {
            Ok(event) => event,
            Err(broadcast::error::RecvError::Lagged(_)) => continue,
            Err(broadcast::error::RecvError::Closed) => return,
        };

        match event.phase {
            RidePhase::Matched => {
                // A fresh assignment; rebuild the payload around the new ride.
                let ride = match Ride::find(&kernel.pool, event.ride_id).await {
                    Ok(Some(ride)) => ride,
                    Ok(None) => return,
                    Err(e) => {
                        tracing::warn!(error = %format!("{e:#}"), "chair notification stream lost");
                        return;
                    }
                };
                payload = match build_chair_payload(&kernel, &ride, RidePhase::Matched).await {
                    Ok(payload) => payload,
                    Err(e) => {
                        tracing::warn!(error = %format!("{e:#}"), "chair notification stream lost");
                        return;
                    }
                };
            }
            _ => {
                payload.status = event.phase;
            }
        }

        if send_frame(&tx, &payload).await.is_err() {
            return;
        }
        if let Err(e) = RideStatus::mark_chair_sent(&kernel.pool, payload.ride_id).await {
            tracing::warn!(error = %format!("{e:#}"), "failed to mark chair notification delivered");
            return;
        }
        if event.phase == RidePhase::Completed {
            release_chair(&kernel, chair.id).await;
            return;
        }
    }
}
