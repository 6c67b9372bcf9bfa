//! User, coupon and payment-token persistence.

use anyhow::Result;
use chrono::{DateTime, Utc};
use sqlx::PgExecutor;

use crate::common::{RideId, UserId};

/// Discount granted to every newly registered user.
pub const NEW_USER_COUPON_CODE: &str = "CP_NEW2024";
pub const NEW_USER_COUPON_DISCOUNT: i64 = 3000;

/// Discount granted to a user who signs up with an invitation code.
pub const INVITATION_COUPON_DISCOUNT: i64 = 1500;
/// Reward granted to the inviter each time their code is used.
pub const INVITATION_REWARD_DISCOUNT: i64 = 1000;
/// An invitation code can be used at most this many times.
pub const INVITATION_CODE_MAX_USES: i64 = 3;

#[derive(sqlx::FromRow, Debug, Clone)]
pub struct User {
    pub id: UserId,
    pub username: String,
    pub firstname: String,
    pub lastname: String,
    pub date_of_birth: String,
    pub access_token: String,
    pub invitation_code: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl User {
    pub async fn find(executor: impl PgExecutor<'_>, id: UserId) -> Result<Option<Self>> {
        sqlx::query_as::<_, Self>("SELECT * FROM users WHERE id = $1")
            .bind(id)
            .fetch_optional(executor)
            .await
            .map_err(Into::into)
    }

    pub async fn find_by_access_token(
        executor: impl PgExecutor<'_>,
        access_token: &str,
    ) -> Result<Option<Self>> {
        sqlx::query_as::<_, Self>("SELECT * FROM users WHERE access_token = $1")
            .bind(access_token)
            .fetch_optional(executor)
            .await
            .map_err(Into::into)
    }

    pub async fn find_by_invitation_code(
        executor: impl PgExecutor<'_>,
        invitation_code: &str,
    ) -> Result<Option<Self>> {
        sqlx::query_as::<_, Self>("SELECT * FROM users WHERE invitation_code = $1")
            .bind(invitation_code)
            .fetch_optional(executor)
            .await
            .map_err(Into::into)
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn insert(
        executor: impl PgExecutor<'_>,
        id: UserId,
        username: &str,
        firstname: &str,
        lastname: &str,
        date_of_birth: &str,
        access_token: &str,
        invitation_code: &str,
    ) -> Result<()> {
        sqlx::query(
            "INSERT INTO users (id, username, firstname, lastname, date_of_birth,
                                access_token, invitation_code)
             VALUES ($1, $2, $3, $4, $5, $6, $7)",
        )
        .bind(id)
        .bind(username)
        .bind(firstname)
        .bind(lastname)
        .bind(date_of_birth)
        .bind(access_token)
        .bind(invitation_code)
        .execute(executor)
        .await?;
        Ok(())
    }
}

/// A coupon is bound to at most one ride via `used_by`.
#[derive(sqlx::FromRow, Debug, Clone)]
pub struct Coupon {
    pub user_id: UserId,
    pub code: String,
    pub discount: i64,
    pub used_by: Option<RideId>,
    pub created_at: DateTime<Utc>,
}

impl Coupon {
    pub async fn grant(
        executor: impl PgExecutor<'_>,
        user_id: UserId,
        code: &str,
        discount: i64,
    ) -> Result<()> {
        sqlx::query("INSERT INTO coupons (user_id, code, discount) VALUES ($1, $2, $3)")
            .bind(user_id)
            .bind(code)
            .bind(discount)
            .execute(executor)
            .await?;
        Ok(())
    }

    /// How many times an invitation coupon code has been handed out, with the
    /// rows locked so concurrent signups serialize on the count.
    pub async fn count_for_code_locked(
        executor: impl PgExecutor<'_>,
        code: &str,
    ) -> Result<i64> {
        let rows: Vec<Self> =
            sqlx::query_as::<_, Self>("SELECT * FROM coupons WHERE code = $1 FOR UPDATE")
                .bind(code)
                .fetch_all(executor)
                .await?;
        Ok(rows.len() as i64)
    }

    /// The unused new-user coupon, row-locked for binding.
    pub async fn unused_new_user_locked(
        executor: impl PgExecutor<'_>,
        user_id: UserId,
    ) -> Result<Option<Self>> {
        sqlx::query_as::<_, Self>(
            "SELECT * FROM coupons
             WHERE user_id = $1 AND code = $2 AND used_by IS NULL
             FOR UPDATE",
        )
        .bind(user_id)
        .bind(NEW_USER_COUPON_CODE)
        .fetch_optional(executor)
        .await
        .map_err(Into::into)
    }

    /// The oldest unused coupon, row-locked for binding.
    pub async fn oldest_unused_locked(
        executor: impl PgExecutor<'_>,
        user_id: UserId,
    ) -> Result<Option<Self>> {
        sqlx::query_as::<_, Self>(
            "SELECT * FROM coupons
             WHERE user_id = $1 AND used_by IS NULL
             ORDER BY created_at
             LIMIT 1
             FOR UPDATE",
        )
        .bind(user_id)
        .fetch_optional(executor)
        .await
        .map_err(Into::into)
    }

    pub async fn bind_to_ride(
        executor: impl PgExecutor<'_>,
        user_id: UserId,
        code: &str,
        ride_id: RideId,
    ) -> Result<()> {
        sqlx::query("UPDATE coupons SET used_by = $1 WHERE user_id = $2 AND code = $3")
            .bind(ride_id)
            .bind(user_id)
            .bind(code)
            .execute(executor)
            .await?;
        Ok(())
    }

    pub async fn for_ride(executor: impl PgExecutor<'_>, ride_id: RideId) -> Result<Option<Self>> {
        sqlx::query_as::<_, Self>("SELECT * FROM coupons WHERE used_by = $1")
            .bind(ride_id)
            .fetch_optional(executor)
            .await
            .map_err(Into::into)
    }

    /// Discount already bound to a ride, or zero.
    pub async fn discount_for_ride(executor: impl PgExecutor<'_>, ride_id: RideId) -> Result<i64> {
        Ok(Self::for_ride(executor, ride_id)
            .await?
            .map(|c| c.discount)
            .unwrap_or(0))
    }

    /// Discount the user would get on their next ride: the new-user coupon
    /// first, otherwise the oldest unused one. Read-only; nothing is bound.
    pub async fn available_discount(
        conn: &mut sqlx::PgConnection,
        user_id: UserId,
    ) -> Result<i64> {
        let new_user: Option<Self> = sqlx::query_as::<_, Self>(
            "SELECT * FROM coupons WHERE user_id = $1 AND code = $2 AND used_by IS NULL",
        )
        .bind(user_id)
        .bind(NEW_USER_COUPON_CODE)
        .fetch_optional(&mut *conn)
        .await?;
        if let Some(coupon) = new_user {
            return Ok(coupon.discount);
        }

        let oldest: Option<Self> = sqlx::query_as::<_, Self>(
            "SELECT * FROM coupons
             WHERE user_id = $1 AND used_by IS NULL
             ORDER BY created_at
             LIMIT 1",
        )
        .bind(user_id)
        .fetch_optional(&mut *conn)
        .await?;
        Ok(oldest.map(|c| c.discount).unwrap_or(0))
    }
}

#[derive(sqlx::FromRow, Debug, Clone)]
pub struct PaymentToken {
    pub user_id: UserId,
    pub token: String,
    pub created_at: DateTime<Utc>,
}

impl PaymentToken {
    pub async fn upsert(
        executor: impl PgExecutor<'_>,
        user_id: UserId,
        token: &str,
    ) -> Result<()> {
        sqlx::query(
            "INSERT INTO payment_tokens (user_id, token) VALUES ($1, $2)
             ON CONFLICT (user_id) DO UPDATE SET token = EXCLUDED.token",
        )
        .bind(user_id)
        .bind(token)
        .execute(executor)
        .await?;
        Ok(())
    }

    pub async fn find(executor: impl PgExecutor<'_>, user_id: UserId) -> Result<Option<Self>> {
        sqlx::query_as::<_, Self>("SELECT * FROM payment_tokens WHERE user_id = $1")
            .bind(user_id)
            .fetch_optional(executor)
            .await
            .map_err(Into::into)
    }
}
