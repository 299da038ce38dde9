//! PostgreSQL quota store
//!
//! One row per user in `user_quota`. Every mutation runs in a transaction
//! that takes the row lock with `SELECT ... FOR UPDATE`, so concurrent
//! increments, resets and tier changes on a user are serialized by the
//! database while different users proceed independently.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::{Postgres, Row, Transaction};
use tracing::{debug, info};

use super::{IncrementOutcome, LimitCheck, QuotaStore, RecordMutation, StoreError};
use crate::nutrition::NutritionAccessStats;
use crate::record::{UsageField, UserQuotaRecord};
use crate::tier::SubscriptionTier;

const CREATE_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS user_quota (
    user_id TEXT PRIMARY KEY,
    tier TEXT NOT NULL,
    messages_used INTEGER NOT NULL DEFAULT 0 CHECK (messages_used >= 0),
    calls_used INTEGER NOT NULL DEFAULT 0 CHECK (calls_used >= 0),
    attachments_used INTEGER NOT NULL DEFAULT 0 CHECK (attachments_used >= 0),
    reset_at TIMESTAMPTZ NOT NULL,
    nutrition_plan_generated_at TIMESTAMPTZ,
    nutrition_expires_at TIMESTAMPTZ,
    nutrition_locked BOOLEAN NOT NULL DEFAULT FALSE,
    nutrition_window_days INTEGER
)
"#;

const CREATE_RESET_INDEX: &str =
    "CREATE INDEX IF NOT EXISTS user_quota_reset_at_idx ON user_quota (reset_at)";

// Freemium plans without a stored expiry fall back to generation + window
const NUTRITION_STATS: &str = r#"
SELECT tier,
    COUNT(*) AS total_users,
    COUNT(*) FILTER (WHERE generated_at IS NOT NULL AND (tier <> 'freemium' OR expiry IS NULL)) AS unlocked,
    COUNT(*) FILTER (WHERE generated_at IS NOT NULL AND tier = 'freemium' AND expiry > $1) AS active_windows,
    COUNT(*) FILTER (WHERE generated_at IS NOT NULL AND tier = 'freemium' AND expiry <= $1) AS expired_windows
FROM (
    SELECT tier,
        nutrition_plan_generated_at AS generated_at,
        COALESCE(nutrition_expires_at,
                 nutrition_plan_generated_at + make_interval(days => nutrition_window_days)) AS expiry
    FROM user_quota
) AS access
GROUP BY tier
"#;

const SELECT_COLUMNS: &str = "user_id, tier, messages_used, calls_used, attachments_used, reset_at, \
     nutrition_plan_generated_at, nutrition_expires_at, nutrition_locked, nutrition_window_days";

/// Quota store backed by PostgreSQL
#[derive(Clone)]
pub struct PostgresQuotaStore {
    pool: PgPool,
}

impl PostgresQuotaStore {
    /// Connect and make sure the schema exists
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await
            .map_err(map_sqlx_error)?;

        let store = Self { pool };
        store.migrate().await?;
        info!("🗄️ Connected to PostgreSQL quota store");
        Ok(store)
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::query(CREATE_TABLE)
            .execute(&self.pool)
            .await
            .map_err(map_sqlx_error)?;
        sqlx::query(CREATE_RESET_INDEX)
            .execute(&self.pool)
            .await
            .map_err(map_sqlx_error)?;
        Ok(())
    }

    async fn lock_row(
        tx: &mut Transaction<'_, Postgres>,
        user_id: &str,
    ) -> Result<UserQuotaRecord, StoreError> {
        let sql = format!("SELECT {} FROM user_quota WHERE user_id = $1 FOR UPDATE", SELECT_COLUMNS);
        let row = sqlx::query(&sql)
            .bind(user_id)
            .fetch_optional(&mut **tx)
            .await
            .map_err(map_sqlx_error)?
            .ok_or_else(|| StoreError::NotFound(user_id.to_string()))?;
        record_from_row(&row)
    }

    async fn write_row(
        tx: &mut Transaction<'_, Postgres>,
        record: &UserQuotaRecord,
    ) -> Result<(), StoreError> {
        sqlx::query(
            "UPDATE user_quota SET tier = $2, messages_used = $3, calls_used = $4, attachments_used = $5, \
             reset_at = $6, nutrition_plan_generated_at = $7, nutrition_expires_at = $8, \
             nutrition_locked = $9, nutrition_window_days = $10 WHERE user_id = $1",
        )
        .bind(&record.user_id)
        .bind(record.tier.as_str())
        .bind(to_db_count(record.messages_used)?)
        .bind(to_db_count(record.calls_used)?)
        .bind(to_db_count(record.attachments_used)?)
        .bind(record.reset_at)
        .bind(record.nutrition_plan_generated_at)
        .bind(record.nutrition_expires_at)
        .bind(record.nutrition_locked)
        .bind(record.nutrition_window_days.map(to_db_count).transpose()?)
        .execute(&mut **tx)
        .await
        .map_err(map_sqlx_error)?;
        Ok(())
    }
}

#[async_trait]
impl QuotaStore for PostgresQuotaStore {
    async fn read(&self, user_id: &str) -> Result<UserQuotaRecord, StoreError> {
        let sql = format!("SELECT {} FROM user_quota WHERE user_id = $1", SELECT_COLUMNS);
        let row = sqlx::query(&sql)
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(map_sqlx_error)?
            .ok_or_else(|| StoreError::NotFound(user_id.to_string()))?;
        record_from_row(&row)
    }

    async fn create(&self, record: UserQuotaRecord) -> Result<UserQuotaRecord, StoreError> {
        let inserted = sqlx::query(
            "INSERT INTO user_quota (user_id, tier, messages_used, calls_used, attachments_used, reset_at, \
             nutrition_plan_generated_at, nutrition_expires_at, nutrition_locked, nutrition_window_days) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10) ON CONFLICT (user_id) DO NOTHING",
        )
        .bind(&record.user_id)
        .bind(record.tier.as_str())
        .bind(to_db_count(record.messages_used)?)
        .bind(to_db_count(record.calls_used)?)
        .bind(to_db_count(record.attachments_used)?)
        .bind(record.reset_at)
        .bind(record.nutrition_plan_generated_at)
        .bind(record.nutrition_expires_at)
        .bind(record.nutrition_locked)
        .bind(record.nutrition_window_days.map(to_db_count).transpose()?)
        .execute(&self.pool)
        .await
        .map_err(map_sqlx_error)?;

        if inserted.rows_affected() > 0 {
            debug!("Created quota record for user {}", record.user_id);
        }
        self.read(&record.user_id).await
    }

    async fn try_increment(
        &self,
        user_id: &str,
        field: UsageField,
        now: DateTime<Utc>,
        check: LimitCheck<'_>,
    ) -> Result<IncrementOutcome, StoreError> {
        let mut tx = self.pool.begin().await.map_err(map_sqlx_error)?;
        let mut record = Self::lock_row(&mut tx, user_id).await?;

        let mut dirty = false;
        if record.is_due_for_reset(now) {
            record.roll_over(now);
            dirty = true;
        }

        let success = check(&record);
        if success {
            record.increment(field);
            dirty = true;
        }

        if dirty {
            Self::write_row(&mut tx, &record).await?;
        }
        tx.commit().await.map_err(map_sqlx_error)?;

        Ok(IncrementOutcome { success, record })
    }

    async fn modify(&self, user_id: &str, mutation: RecordMutation) -> Result<UserQuotaRecord, StoreError> {
        let mut tx = self.pool.begin().await.map_err(map_sqlx_error)?;
        let mut record = Self::lock_row(&mut tx, user_id).await?;
        mutation(&mut record);
        Self::write_row(&mut tx, &record).await?;
        tx.commit().await.map_err(map_sqlx_error)?;
        Ok(record)
    }

    async fn due_for_reset(&self, now: DateTime<Utc>) -> Result<Vec<String>, StoreError> {
        let rows = sqlx::query("SELECT user_id FROM user_quota WHERE reset_at <= $1")
            .bind(now)
            .fetch_all(&self.pool)
            .await
            .map_err(map_sqlx_error)?;

        rows.iter()
            .map(|row| row.try_get::<String, _>("user_id").map_err(map_sqlx_error))
            .collect()
    }

    async fn reset_one(&self, user_id: &str, now: DateTime<Utc>) -> Result<bool, StoreError> {
        let mut tx = self.pool.begin().await.map_err(map_sqlx_error)?;
        let mut record = Self::lock_row(&mut tx, user_id).await?;
        if !record.is_due_for_reset(now) {
            tx.rollback().await.map_err(map_sqlx_error)?;
            return Ok(false);
        }
        record.roll_over(now);
        Self::write_row(&mut tx, &record).await?;
        tx.commit().await.map_err(map_sqlx_error)?;
        Ok(true)
    }

    async fn nutrition_access_stats(&self, now: DateTime<Utc>) -> Result<Vec<NutritionAccessStats>, StoreError> {
        let rows = sqlx::query(NUTRITION_STATS)
            .bind(now)
            .fetch_all(&self.pool)
            .await
            .map_err(map_sqlx_error)?;

        let mut stats: Vec<NutritionAccessStats> =
            SubscriptionTier::ALL.into_iter().map(NutritionAccessStats::empty).collect();
        for row in &rows {
            let tier: String = row.try_get("tier").map_err(map_sqlx_error)?;
            let tier: SubscriptionTier = tier
                .parse()
                .map_err(|e: crate::tier::UnknownTier| StoreError::Corrupt(e.to_string()))?;
            if let Some(entry) = stats.iter_mut().find(|entry| entry.tier == tier) {
                entry.total_users = from_db_total(row.try_get("total_users").map_err(map_sqlx_error)?)?;
                entry.unlocked = from_db_total(row.try_get("unlocked").map_err(map_sqlx_error)?)?;
                entry.active_windows = from_db_total(row.try_get("active_windows").map_err(map_sqlx_error)?)?;
                entry.expired_windows = from_db_total(row.try_get("expired_windows").map_err(map_sqlx_error)?)?;
            }
        }
        Ok(stats)
    }
}

fn record_from_row(row: &PgRow) -> Result<UserQuotaRecord, StoreError> {
    let tier: String = row.try_get("tier").map_err(map_sqlx_error)?;
    let tier: SubscriptionTier = tier
        .parse()
        .map_err(|e: crate::tier::UnknownTier| StoreError::Corrupt(e.to_string()))?;
    let window: Option<i32> = row.try_get("nutrition_window_days").map_err(map_sqlx_error)?;

    Ok(UserQuotaRecord {
        user_id: row.try_get("user_id").map_err(map_sqlx_error)?,
        tier,
        messages_used: from_db_count(row.try_get("messages_used").map_err(map_sqlx_error)?)?,
        calls_used: from_db_count(row.try_get("calls_used").map_err(map_sqlx_error)?)?,
        attachments_used: from_db_count(row.try_get("attachments_used").map_err(map_sqlx_error)?)?,
        reset_at: row.try_get("reset_at").map_err(map_sqlx_error)?,
        nutrition_plan_generated_at: row.try_get("nutrition_plan_generated_at").map_err(map_sqlx_error)?,
        nutrition_expires_at: row.try_get("nutrition_expires_at").map_err(map_sqlx_error)?,
        nutrition_locked: row.try_get("nutrition_locked").map_err(map_sqlx_error)?,
        nutrition_window_days: window.map(from_db_count).transpose()?,
    })
}

fn to_db_count(value: u32) -> Result<i32, StoreError> {
    i32::try_from(value).map_err(|_| StoreError::Corrupt(format!("counter {} out of range", value)))
}

fn from_db_count(value: i32) -> Result<u32, StoreError> {
    u32::try_from(value).map_err(|_| StoreError::Corrupt(format!("negative counter {}", value)))
}

fn from_db_total(value: i64) -> Result<u64, StoreError> {
    u64::try_from(value).map_err(|_| StoreError::Corrupt(format!("negative total {}", value)))
}

fn map_sqlx_error(error: sqlx::Error) -> StoreError {
    // 40001 serialization_failure, 40P01 deadlock_detected
    let conflict = error
        .as_database_error()
        .and_then(|db| db.code())
        .map_or(false, |code| code == "40001" || code == "40P01");

    if conflict {
        StoreError::Conflict(error.to_string())
    } else {
        StoreError::Unavailable(error.to_string())
    }
}
