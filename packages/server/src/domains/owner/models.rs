//! Fleet owner persistence.

use anyhow::Result;
use chrono::{DateTime, Utc};
use sqlx::PgExecutor;

use crate::common::OwnerId;

#[derive(sqlx::FromRow, Debug, Clone)]
pub struct Owner {
    pub id: OwnerId,
    pub name: String,
    pub access_token: String,
    pub chair_register_token: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Owner {
    pub async fn find(executor: impl PgExecutor<'_>, id: OwnerId) -> Result<Option<Self>> {
        sqlx::query_as::<_, Self>("SELECT * FROM owners WHERE id = $1")
            .bind(id)
            .fetch_optional(executor)
            .await
            .map_err(Into::into)
    }

    pub async fn find_by_access_token(
        executor: impl PgExecutor<'_>,
        access_token: &str,
    ) -> Result<Option<Self>> {
        sqlx::query_as::<_, Self>("SELECT * FROM owners WHERE access_token = $1")
            .bind(access_token)
            .fetch_optional(executor)
            .await
            .map_err(Into::into)
    }

    pub async fn find_by_chair_register_token(
        executor: impl PgExecutor<'_>,
        chair_register_token: &str,
    ) -> Result<Option<Self>> {
        sqlx::query_as::<_, Self>("SELECT * FROM owners WHERE chair_register_token = $1")
            .bind(chair_register_token)
            .fetch_optional(executor)
            .await
            .map_err(Into::into)
    }

    pub async fn insert(
        executor: impl PgExecutor<'_>,
        id: OwnerId,
        name: &str,
        access_token: &str,
        chair_register_token: &str,
    ) -> Result<()> {
        sqlx::query(
            "INSERT INTO owners (id, name, access_token, chair_register_token)
             VALUES ($1, $2, $3, $4)",
        )
        .bind(id)
        .bind(name)
        .bind(access_token)
        .bind(chair_register_token)
        .execute(executor)
        .await?;
        Ok(())
    }
}
