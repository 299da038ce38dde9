//! Quota Storage
//!
//! Durable per-user storage for quota records. Every operation that
//! changes a record is atomic for that record; no operation ever locks
//! across users, so the store can be sharded by user id.
//!
//! Backends:
//! - [`InMemoryQuotaStore`]: per-user async mutexes, used by default and in tests
//! - `PostgresQuotaStore`: row-level locks, behind the `postgres` feature

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::limits::TierLimitTable;
use crate::nutrition::NutritionAccessStats;
use crate::record::{UsageField, UserQuotaRecord};
use crate::tier::SubscriptionTier;

pub mod memory;
#[cfg(feature = "postgres")]
pub mod postgres;

pub use memory::InMemoryQuotaStore;
#[cfg(feature = "postgres")]
pub use postgres::PostgresQuotaStore;

/// Predicate evaluated against the stored record inside an increment
pub type LimitCheck<'a> = &'a (dyn Fn(&UserQuotaRecord) -> bool + Send + Sync);

/// Mutation applied to a record under its lock
pub type RecordMutation = Box<dyn FnOnce(&mut UserQuotaRecord) + Send>;

/// Storage errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    #[error("No quota record for user {0}")]
    NotFound(String),
    #[error("Quota store unavailable: {0}")]
    Unavailable(String),
    #[error("Quota store transaction conflict: {0}")]
    Conflict(String),
    #[error("Corrupt quota record: {0}")]
    Corrupt(String),
}

impl StoreError {
    /// Whether retrying the same call may succeed
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Unavailable(_) | Self::Conflict(_))
    }
}

/// Result of a conditional increment
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IncrementOutcome {
    /// The check passed and the increment was committed
    pub success: bool,
    /// Record after the increment, or the unchanged current record
    pub record: UserQuotaRecord,
}

/// Summary of a reset pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResetReport {
    /// Records whose counters were zeroed
    pub reset: usize,
    /// Records that were no longer due by the time they were locked
    pub skipped: usize,
    /// Records that could not be reset
    pub failed: usize,
}

#[async_trait]
pub trait QuotaStore: Send + Sync {
    /// Read a user's record
    async fn read(&self, user_id: &str) -> Result<UserQuotaRecord, StoreError>;

    /// Insert `record` unless the user already has one; returns the stored record
    async fn create(&self, record: UserQuotaRecord) -> Result<UserQuotaRecord, StoreError>;

    /// Atomically add one to `field` if `check` passes on the stored record.
    ///
    /// A due period rollover is applied first, under the same lock, so the
    /// check always sees the counters of the current period. The rollover
    /// is a lazy reset: it is committed even when the check then denies.
    async fn try_increment(
        &self,
        user_id: &str,
        field: UsageField,
        now: DateTime<Utc>,
        check: LimitCheck<'_>,
    ) -> Result<IncrementOutcome, StoreError>;

    /// Atomically read, mutate and write back a record
    async fn modify(&self, user_id: &str, mutation: RecordMutation) -> Result<UserQuotaRecord, StoreError>;

    /// Users whose `reset_at` is at or before `now`
    async fn due_for_reset(&self, now: DateTime<Utc>) -> Result<Vec<String>, StoreError>;

    /// Reset one record if it is still due; returns whether it was reset
    async fn reset_one(&self, user_id: &str, now: DateTime<Utc>) -> Result<bool, StoreError>;

    /// Nutrition access counts for every tier at `now`, lowest tier first
    async fn nutrition_access_stats(&self, now: DateTime<Utc>) -> Result<Vec<NutritionAccessStats>, StoreError>;

    /// Set the tier and reconcile the nutrition window. Usage counters are
    /// never touched.
    async fn apply_tier_change(
        &self,
        user_id: &str,
        tier: SubscriptionTier,
        table: &TierLimitTable,
    ) -> Result<UserQuotaRecord, StoreError> {
        let table = table.clone();
        self.modify(user_id, Box::new(move |record: &mut UserQuotaRecord| record.reconcile_tier(tier, &table)))
            .await
    }

    /// Zero the counters of every due record and advance its `reset_at`.
    ///
    /// Per-record failures are logged and counted; the pass continues.
    async fn reset_all_for_period(&self, now: DateTime<Utc>) -> Result<ResetReport, StoreError> {
        let due = self.due_for_reset(now).await?;
        debug!("{} quota records due for reset", due.len());

        let mut report = ResetReport::default();
        for user_id in due {
            match self.reset_one(&user_id, now).await {
                Ok(true) => report.reset += 1,
                Ok(false) => report.skipped += 1,
                Err(e) => {
                    warn!("Failed to reset quota for user {}: {}", user_id, e);
                    report.failed += 1;
                }
            }
        }

        info!(
            "🔄 Quota reset pass: {} reset, {} skipped, {} failed",
            report.reset, report.skipped, report.failed
        );
        Ok(report)
    }
}
