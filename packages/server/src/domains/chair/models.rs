//! Chair persistence and the static model -> speed table.

use anyhow::Result;
use chrono::{DateTime, Utc};
use sqlx::PgExecutor;

use crate::common::{ChairId, OwnerId};

#[derive(sqlx::FromRow, Debug, Clone)]
pub struct Chair {
    pub id: ChairId,
    pub owner_id: OwnerId,
    pub name: String,
    pub model: String,
    pub is_active: bool,
    pub access_token: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Chair {
    /// Grid units per tick this chair covers, from the model table.
    pub fn speed(&self) -> i64 {
        model_speed(&self.model).unwrap_or(1)
    }

    pub async fn find(executor: impl PgExecutor<'_>, id: ChairId) -> Result<Option<Self>> {
        sqlx::query_as::<_, Self>("SELECT * FROM chairs WHERE id = $1")
            .bind(id)
            .fetch_optional(executor)
            .await
            .map_err(Into::into)
    }

    pub async fn find_by_access_token(
        executor: impl PgExecutor<'_>,
        access_token: &str,
    ) -> Result<Option<Self>> {
        sqlx::query_as::<_, Self>("SELECT * FROM chairs WHERE access_token = $1")
            .bind(access_token)
            .fetch_optional(executor)
            .await
            .map_err(Into::into)
    }

    pub async fn all(executor: impl PgExecutor<'_>) -> Result<Vec<Self>> {
        sqlx::query_as::<_, Self>("SELECT * FROM chairs")
            .fetch_all(executor)
            .await
            .map_err(Into::into)
    }

    pub async fn for_owner(executor: impl PgExecutor<'_>, owner_id: OwnerId) -> Result<Vec<Self>> {
        sqlx::query_as::<_, Self>("SELECT * FROM chairs WHERE owner_id = $1")
            .bind(owner_id)
            .fetch_all(executor)
            .await
            .map_err(Into::into)
    }

    pub async fn insert(
        executor: impl PgExecutor<'_>,
        id: ChairId,
        owner_id: OwnerId,
        name: &str,
        model: &str,
        access_token: &str,
    ) -> Result<()> {
        sqlx::query(
            "INSERT INTO chairs (id, owner_id, name, model, is_active, access_token)
             VALUES ($1, $2, $3, $4, FALSE, $5)",
        )
        .bind(id)
        .bind(owner_id)
        .bind(name)
        .bind(model)
        .bind(access_token)
        .execute(executor)
        .await?;
        Ok(())
    }

    pub async fn set_active(
        executor: impl PgExecutor<'_>,
        id: ChairId,
        is_active: bool,
    ) -> Result<()> {
        sqlx::query("UPDATE chairs SET is_active = $1 WHERE id = $2")
            .bind(is_active)
            .bind(id)
            .execute(executor)
            .await?;
        Ok(())
    }

    /// Active chairs with no unfinished ride, for idle-pool rebuilds.
    pub async fn idle(executor: impl PgExecutor<'_>) -> Result<Vec<Self>> {
        sqlx::query_as::<_, Self>(
            "SELECT c.*
             FROM chairs c
             WHERE c.is_active = TRUE
               AND NOT EXISTS (
                     SELECT 1
                     FROM rides r
                     JOIN ride_statuses rs ON rs.ride_id = r.id
                     WHERE r.chair_id = c.id
                       AND rs.created_at = (
                             SELECT MAX(rs2.created_at)
                             FROM ride_statuses rs2
                             WHERE rs2.ride_id = r.id
                       )
                       AND rs.status <> 'COMPLETED'
               )",
        )
        .fetch_all(executor)
        .await
        .map_err(Into::into)
    }
}

/// Speed for a chair model, or `None` for an unknown model.
pub fn model_speed(model: &str) -> Option<i64> {
    let speed = match model {
        "AeroSeat" => 3,
        "Aurora Glow" => 7,
        "BalancePro" => 3,
        "ComfortBasic" => 2,
        "EasySit" => 2,
        "ErgoFlex" => 3,
        "Infinity Seat" => 5,
        "Legacy Chair" => 7,
        "LiteLine" => 2,
        "LuxeThrone" => 5,
        "Phoenix Ultra" => 7,
        "ShadowEdition" => 7,
        "SitEase" => 2,
        "StyleSit" => 3,
        "Titanium Line" => 5,
        "ZenComfort" => 5,
        "アルティマシート X" => 5,
        "インフィニティ GEAR V" => 7,
        "インペリアルクラフト LUXE" => 5,
        "ヴァーチェア SUPREME" => 7,
        "エアシェル ライト" => 2,
        "エアフロー EZ" => 3,
        "エコシート リジェネレイト" => 7,
        "エルゴクレスト II" => 3,
        "オブシディアン PRIME" => 7,
        "クエストチェア Lite" => 3,
        "ゲーミングシート NEXUS" => 3,
        "シェルシート ハイブリッド" => 3,
        "シャドウバースト M" => 5,
        "ステルスシート ROGUE" => 5,
        "ストリームギア S1" => 3,
        "スピンフレーム 01" => 2,
        "スリムライン GX" => 5,
        "ゼノバース ALPHA" => 7,
        "ゼンバランス EX" => 5,
        "タイタンフレーム ULTRA" => 7,
        "チェアエース S" => 2,
        "ナイトシート ブラックエディション" => 7,
        "フォームライン RX" => 3,
        "フューチャーステップ VISION" => 7,
        "フューチャーチェア CORE" => 5,
        "プレイスタイル Z" => 3,
        "フレックスコンフォート PRO" => 3,
        "プレミアムエアチェア ZETA" => 5,
        "プロゲーマーエッジ X1" => 5,
        "ベーシックスツール プラス" => 2,
        "モーションチェア RISE" => 5,
        "リカーブチェア スマート" => 3,
        "リラックスシート NEO" => 2,
        "リラックス座" => 2,
        "ルミナスエアクラウン" => 7,
        "匠座 PRO LIMITED" => 7,
        "匠座（たくみざ）プレミアム" => 7,
        "雅楽座" => 5,
        "風雅（ふうが）チェア" => 3,
        _ => return None,
    };
    Some(speed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_known_model_speeds() {
        assert_eq!(model_speed("AeroSeat"), Some(3));
        assert_eq!(model_speed("Phoenix Ultra"), Some(7));
        assert_eq!(model_speed("ComfortBasic"), Some(2));
        assert_eq!(model_speed("雅楽座"), Some(5));
    }

    #[test]
    fn test_unknown_model() {
        assert_eq!(model_speed("HoverPod 9000"), None);
    }
}
