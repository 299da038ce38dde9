//! In-memory quota store
//!
//! Each record sits behind its own async mutex; the outer map lock is only
//! held long enough to find or insert a user's slot. Increments, resets and
//! tier changes on the same user serialize on that mutex, and different
//! users never contend.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tracing::debug;

use super::{IncrementOutcome, LimitCheck, QuotaStore, RecordMutation, StoreError};
use crate::nutrition::{access_stats, NutritionAccessStats};
use crate::record::{UsageField, UserQuotaRecord};

type Slot = Arc<Mutex<UserQuotaRecord>>;

/// Quota store backed by process memory
#[derive(Default)]
pub struct InMemoryQuotaStore {
    records: RwLock<HashMap<String, Slot>>,
}

impl InMemoryQuotaStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored records
    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.records.read().await.is_empty()
    }

    async fn slot(&self, user_id: &str) -> Result<Slot, StoreError> {
        self.records
            .read()
            .await
            .get(user_id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(user_id.to_string()))
    }

    /// Snapshot of every slot, so scans never hold the map lock while
    /// waiting on a record
    async fn all_slots(&self) -> Vec<(String, Slot)> {
        self.records
            .read()
            .await
            .iter()
            .map(|(user_id, slot)| (user_id.clone(), slot.clone()))
            .collect()
    }
}

#[async_trait]
impl QuotaStore for InMemoryQuotaStore {
    async fn read(&self, user_id: &str) -> Result<UserQuotaRecord, StoreError> {
        let slot = self.slot(user_id).await?;
        let record = slot.lock().await.clone();
        Ok(record)
    }

    async fn create(&self, record: UserQuotaRecord) -> Result<UserQuotaRecord, StoreError> {
        let slot = {
            let mut records = self.records.write().await;
            records
                .entry(record.user_id.clone())
                .or_insert_with(|| {
                    debug!("Created quota record for user {}", record.user_id);
                    Arc::new(Mutex::new(record.clone()))
                })
                .clone()
        };
        let stored = slot.lock().await.clone();
        Ok(stored)
    }

    async fn try_increment(
        &self,
        user_id: &str,
        field: UsageField,
        now: DateTime<Utc>,
        check: LimitCheck<'_>,
    ) -> Result<IncrementOutcome, StoreError> {
        let slot = self.slot(user_id).await?;
        let mut record = slot.lock().await;

        if record.is_due_for_reset(now) {
            record.roll_over(now);
        }

        if !check(&*record) {
            return Ok(IncrementOutcome {
                success: false,
                record: record.clone(),
            });
        }

        record.increment(field);
        Ok(IncrementOutcome {
            success: true,
            record: record.clone(),
        })
    }

    async fn modify(&self, user_id: &str, mutation: RecordMutation) -> Result<UserQuotaRecord, StoreError> {
        let slot = self.slot(user_id).await?;
        let mut record = slot.lock().await;
        mutation(&mut *record);
        Ok(record.clone())
    }

    async fn due_for_reset(&self, now: DateTime<Utc>) -> Result<Vec<String>, StoreError> {
        let mut due = Vec::new();
        for (user_id, slot) in self.all_slots().await {
            if slot.lock().await.is_due_for_reset(now) {
                due.push(user_id);
            }
        }
        Ok(due)
    }

    async fn reset_one(&self, user_id: &str, now: DateTime<Utc>) -> Result<bool, StoreError> {
        let slot = self.slot(user_id).await?;
        let mut record = slot.lock().await;
        if !record.is_due_for_reset(now) {
            return Ok(false);
        }
        record.roll_over(now);
        Ok(true)
    }

    async fn nutrition_access_stats(&self, now: DateTime<Utc>) -> Result<Vec<NutritionAccessStats>, StoreError> {
        let mut users = Vec::new();
        for (_, slot) in self.all_slots().await {
            let record = slot.lock().await;
            users.push((record.tier, record.nutrition_access()));
        }
        Ok(access_stats(users, now))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(y: i32, mo: u32, d: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, mo, d, 0, 0, 0).unwrap()
    }

    #[tokio::test]
    async fn test_read_missing_is_not_found() {
        let store = InMemoryQuotaStore::new();
        let err = store.read("ghost").await.unwrap_err();
        assert_eq!(err, StoreError::NotFound("ghost".to_string()));
    }

    #[tokio::test]
    async fn test_create_keeps_existing_record() {
        let store = InMemoryQuotaStore::new();
        let mut first = UserQuotaRecord::new("u1", at(2025, 1, 1));
        first.messages_used = 4;
        store.create(first).await.unwrap();

        let stored = store.create(UserQuotaRecord::new("u1", at(2025, 1, 2))).await.unwrap();
        assert_eq!(stored.messages_used, 4);
        assert_eq!(store.len().await, 1);
    }

    #[tokio::test]
    async fn test_failed_check_does_not_mutate() {
        let store = InMemoryQuotaStore::new();
        store.create(UserQuotaRecord::new("u1", at(2025, 1, 1))).await.unwrap();

        let outcome = store
            .try_increment("u1", UsageField::Calls, at(2025, 1, 2), &|_: &UserQuotaRecord| false)
            .await
            .unwrap();
        assert!(!outcome.success);
        assert_eq!(store.read("u1").await.unwrap().calls_used, 0);
    }

    #[tokio::test]
    async fn test_increment_rolls_over_due_period_first() {
        let store = InMemoryQuotaStore::new();
        let mut record = UserQuotaRecord::new("u1", at(2025, 1, 1));
        record.calls_used = 1;
        store.create(record).await.unwrap();

        let outcome = store
            .try_increment("u1", UsageField::Calls, at(2025, 2, 3), &|r: &UserQuotaRecord| r.calls_used < 1)
            .await
            .unwrap();
        assert!(outcome.success);
        assert_eq!(outcome.record.calls_used, 1);
        assert_eq!(outcome.record.reset_at, at(2025, 3, 1));
    }

    /// Crossing the period boundary resets counters even on a denial
    #[tokio::test]
    async fn test_denied_increment_still_rolls_over() {
        let store = InMemoryQuotaStore::new();
        let mut record = UserQuotaRecord::new("u1", at(2025, 1, 1));
        record.messages_used = 12;
        store.create(record).await.unwrap();

        let outcome = store
            .try_increment("u1", UsageField::Messages, at(2025, 2, 3), &|_: &UserQuotaRecord| false)
            .await
            .unwrap();
        assert!(!outcome.success);
        assert_eq!(outcome.record.messages_used, 0);

        let stored = store.read("u1").await.unwrap();
        assert_eq!(stored.messages_used, 0);
        assert_eq!(stored.reset_at, at(2025, 3, 1));
        assert!(!store.reset_one("u1", at(2025, 2, 3)).await.unwrap());
    }

    #[tokio::test]
    async fn test_nutrition_stats_cover_all_tiers() {
        let store = InMemoryQuotaStore::new();
        store.create(UserQuotaRecord::new("u1", at(2025, 1, 1))).await.unwrap();
        store.create(UserQuotaRecord::new("u2", at(2025, 1, 1))).await.unwrap();
        store
            .modify(
                "u2",
                Box::new(|record: &mut UserQuotaRecord| {
                    record.nutrition_plan_generated_at = Some(at(2025, 1, 1));
                    record.nutrition_expires_at = Some(at(2025, 1, 8));
                    record.nutrition_locked = true;
                }),
            )
            .await
            .unwrap();

        let stats = store.nutrition_access_stats(at(2025, 1, 4)).await.unwrap();
        assert_eq!(stats.len(), 3);
        assert_eq!(stats[0].total_users, 2);
        assert_eq!(stats[0].active_windows, 1);
        assert_eq!(stats[1].total_users, 0);
    }

    #[tokio::test]
    async fn test_reset_only_due_records() {
        let store = InMemoryQuotaStore::new();
        let mut due = UserQuotaRecord::new("due", at(2025, 1, 1));
        due.messages_used = 9;
        let mut fresh = UserQuotaRecord::new("fresh", at(2025, 2, 10));
        fresh.messages_used = 3;
        store.create(due).await.unwrap();
        store.create(fresh).await.unwrap();

        let report = store.reset_all_for_period(at(2025, 2, 15)).await.unwrap();
        assert_eq!(report.reset, 1);
        assert_eq!(report.failed, 0);
        assert_eq!(store.read("due").await.unwrap().messages_used, 0);
        assert_eq!(store.read("fresh").await.unwrap().messages_used, 3);
    }
}
