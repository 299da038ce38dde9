//! Quota Service
//!
//! Orchestrates the tier table, evaluator, nutrition policy and store:
//!
//! - `check_only`: read-only "can this user do X"
//! - `consume`: atomic check-then-increment
//! - `change_tier`: tier switch with nutrition reconciliation
//! - nutrition access: read, regenerate, unlock, extend, revoke, stats
//! - `reset_all_for_period`: billing-period counter reset
//!
//! Every operation has an `_at` variant taking the current time
//! explicitly; the plain variant uses the wall clock.

use chrono::{DateTime, Utc};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::evaluator::{evaluate, minimum_tier_for, QuotaAction, QuotaEvaluation};
use crate::events::{resolve_event_tier, EntitlementEvent};
use crate::limits::{TierLimitTable, MAX_NUTRITION_WINDOW_DAYS};
use crate::nutrition::{NutritionAccessStats, NutritionPayload};
use crate::record::{QuotaSnapshot, UserQuotaRecord};
use crate::store::{QuotaStore, ResetReport, StoreError};
use crate::tier::SubscriptionTier;

/// Default bound on a single store round trip
pub const DEFAULT_STORE_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error(transparent)]
    Storage(#[from] StoreError),
    /// The store did not answer in time. The operation may or may not
    /// have been committed.
    #[error("Quota store did not respond within {0:?}; outcome unknown")]
    Timeout(Duration),
    #[error("Invalid input: {0}")]
    InvalidInput(String),
}

impl ServiceError {
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Storage(e) => e.is_retryable(),
            Self::Timeout(_) => true,
            Self::InvalidInput(_) => false,
        }
    }
}

/// A consume decision together with the record it was made against
#[derive(Debug, Clone)]
pub struct ConsumeResult {
    pub evaluation: QuotaEvaluation,
    /// Post-increment record on success, current record on denial
    pub record: UserQuotaRecord,
}

#[derive(Clone)]
pub struct QuotaService {
    store: Arc<dyn QuotaStore>,
    limits: Arc<TierLimitTable>,
    store_timeout: Duration,
}

impl QuotaService {
    pub fn new(store: Arc<dyn QuotaStore>, limits: TierLimitTable) -> Self {
        Self {
            store,
            limits: Arc::new(limits),
            store_timeout: DEFAULT_STORE_TIMEOUT,
        }
    }

    pub fn with_store_timeout(mut self, timeout: Duration) -> Self {
        self.store_timeout = timeout;
        self
    }

    pub fn limits(&self) -> &TierLimitTable {
        &self.limits
    }

    async fn bounded<T, F>(&self, operation: F) -> Result<T, ServiceError>
    where
        F: Future<Output = Result<T, StoreError>>,
    {
        match tokio::time::timeout(self.store_timeout, operation).await {
            Ok(result) => result.map_err(ServiceError::from),
            Err(_) => Err(ServiceError::Timeout(self.store_timeout)),
        }
    }

    /// Read a user's record, creating the default freemium record the
    /// first time the user is seen
    async fn ensure_record(&self, user_id: &str, now: DateTime<Utc>) -> Result<UserQuotaRecord, ServiceError> {
        if user_id.trim().is_empty() {
            return Err(ServiceError::InvalidInput("user_id is required".to_string()));
        }
        match self.bounded(self.store.read(user_id)).await {
            Err(ServiceError::Storage(StoreError::NotFound(_))) => {
                debug!("No quota record for {}, creating freemium default", user_id);
                self.bounded(self.store.create(UserQuotaRecord::new(user_id, now))).await
            }
            other => other,
        }
    }

    // === Quota ===

    pub async fn snapshot(&self, user_id: &str) -> Result<QuotaSnapshot, ServiceError> {
        self.snapshot_at(user_id, Utc::now()).await
    }

    pub async fn snapshot_at(&self, user_id: &str, now: DateTime<Utc>) -> Result<QuotaSnapshot, ServiceError> {
        let view = self.ensure_record(user_id, now).await?.rolled_over_view(now);
        Ok(view.snapshot(self.limits.get(view.tier)))
    }

    pub async fn check_only(&self, user_id: &str, action: QuotaAction) -> Result<QuotaEvaluation, ServiceError> {
        self.check_only_at(user_id, action, Utc::now()).await
    }

    /// Evaluate without mutating. An elapsed period is evaluated as if the
    /// reset had already run.
    pub async fn check_only_at(
        &self,
        user_id: &str,
        action: QuotaAction,
        now: DateTime<Utc>,
    ) -> Result<QuotaEvaluation, ServiceError> {
        let view = self.ensure_record(user_id, now).await?.rolled_over_view(now);
        Ok(evaluate(self.limits.get(view.tier), &view, action))
    }

    pub async fn consume(&self, user_id: &str, action: QuotaAction) -> Result<QuotaEvaluation, ServiceError> {
        self.consume_at(user_id, action, Utc::now()).await
    }

    pub async fn consume_at(
        &self,
        user_id: &str,
        action: QuotaAction,
        now: DateTime<Utc>,
    ) -> Result<QuotaEvaluation, ServiceError> {
        Ok(self.consume_detailed_at(user_id, action, now).await?.evaluation)
    }

    /// Consume one unit of `action`.
    ///
    /// The limit check runs inside the store's atomic increment against the
    /// stored record, so concurrent consumes can never overshoot a quota.
    /// A denial leaves the record untouched.
    pub async fn consume_detailed_at(
        &self,
        user_id: &str,
        action: QuotaAction,
        now: DateTime<Utc>,
    ) -> Result<ConsumeResult, ServiceError> {
        let record = self.ensure_record(user_id, now).await?;
        let limits = self.limits.get(record.tier);

        if action == QuotaAction::Attachment && !limits.attachments_allowed {
            debug!("Attachment denied for {} on tier {}", user_id, record.tier);
            return Ok(ConsumeResult {
                evaluation: evaluate(limits, &record, action),
                record,
            });
        }

        let table: &TierLimitTable = &self.limits;
        let check = move |current: &UserQuotaRecord| evaluate(table.get(current.tier), current, action).allowed;
        let outcome = self
            .bounded(self.store.try_increment(user_id, action.usage_field(), now, &check))
            .await?;

        let limits = self.limits.get(outcome.record.tier);
        let evaluation = if outcome.success {
            QuotaEvaluation::after_consumption(limits, &outcome.record, action)
        } else {
            info!("🚫 {} denied for {} ({})", action, user_id, outcome.record.tier);
            evaluate(limits, &outcome.record, action)
        };

        Ok(ConsumeResult {
            evaluation,
            record: outcome.record,
        })
    }

    /// Lowest tier that would allow `action` at the record's usage
    pub fn required_tier(&self, record: &UserQuotaRecord, action: QuotaAction) -> Option<SubscriptionTier> {
        minimum_tier_for(&self.limits, record, action)
    }

    // === Tier changes ===

    pub async fn change_tier(&self, user_id: &str, tier: SubscriptionTier) -> Result<UserQuotaRecord, ServiceError> {
        self.change_tier_at(user_id, tier, Utc::now()).await
    }

    pub async fn change_tier_at(
        &self,
        user_id: &str,
        tier: SubscriptionTier,
        now: DateTime<Utc>,
    ) -> Result<UserQuotaRecord, ServiceError> {
        let previous = self.ensure_record(user_id, now).await?;
        let updated = self
            .bounded(self.store.apply_tier_change(user_id, tier, &self.limits))
            .await?;
        if previous.tier != tier {
            info!("Tier change for {}: {} -> {}", user_id, previous.tier, tier);
        }
        Ok(updated)
    }

    // === Nutrition access ===

    /// `{plan, status}` payload for a record at `now`
    pub fn nutrition_payload(&self, record: &UserQuotaRecord, now: DateTime<Utc>) -> NutritionPayload {
        NutritionPayload::build(record.tier, record.nutrition_access().as_ref(), now)
    }

    pub async fn get_nutrition_access(&self, user_id: &str) -> Result<NutritionPayload, ServiceError> {
        self.get_nutrition_access_at(user_id, Utc::now()).await
    }

    pub async fn get_nutrition_access_at(
        &self,
        user_id: &str,
        now: DateTime<Utc>,
    ) -> Result<NutritionPayload, ServiceError> {
        let record = self.ensure_record(user_id, now).await?;
        Ok(self.nutrition_payload(&record, now))
    }

    pub async fn regenerate_nutrition_access(
        &self,
        user_id: &str,
        tier: Option<SubscriptionTier>,
    ) -> Result<UserQuotaRecord, ServiceError> {
        self.regenerate_nutrition_access_at(user_id, tier, Utc::now()).await
    }

    /// Start a new nutrition window at `now`.
    ///
    /// Regenerating mid-window restarts the window. When `tier` differs
    /// from the stored tier, the tier change is applied first.
    pub async fn regenerate_nutrition_access_at(
        &self,
        user_id: &str,
        tier: Option<SubscriptionTier>,
        now: DateTime<Utc>,
    ) -> Result<UserQuotaRecord, ServiceError> {
        let record = self.ensure_record(user_id, now).await?;
        if let Some(tier) = tier.filter(|tier| *tier != record.tier) {
            self.change_tier_at(user_id, tier, now).await?;
        }

        let table = Arc::clone(&self.limits);
        let updated = self
            .bounded(self.store.modify(
                user_id,
                Box::new(move |record: &mut UserQuotaRecord| {
                    let tier = record.tier;
                    record.regenerate_nutrition(table.get(tier), now);
                }),
            ))
            .await?;

        info!(
            "🥗 Nutrition plan regenerated for {} (tier {}, expires {:?})",
            user_id, updated.tier, updated.nutrition_expires_at
        );
        Ok(updated)
    }

    pub async fn unlock_nutrition_access(&self, user_id: &str) -> Result<UserQuotaRecord, ServiceError> {
        self.unlock_nutrition_access_at(user_id, Utc::now()).await
    }

    /// Clear any lock or expiry regardless of tier
    pub async fn unlock_nutrition_access_at(
        &self,
        user_id: &str,
        now: DateTime<Utc>,
    ) -> Result<UserQuotaRecord, ServiceError> {
        self.ensure_record(user_id, now).await?;
        let updated = self
            .bounded(self.store.modify(
                user_id,
                Box::new(move |record: &mut UserQuotaRecord| record.unlock_nutrition(now)),
            ))
            .await?;
        info!("🔓 Nutrition access unlocked for {}", user_id);
        Ok(updated)
    }

    pub async fn extend_nutrition_window(&self, user_id: &str, days: u32) -> Result<UserQuotaRecord, ServiceError> {
        self.extend_nutrition_window_at(user_id, days, Utc::now()).await
    }

    /// Extend a freemium window by `days`; persistent tiers are unchanged
    pub async fn extend_nutrition_window_at(
        &self,
        user_id: &str,
        days: u32,
        now: DateTime<Utc>,
    ) -> Result<UserQuotaRecord, ServiceError> {
        if days == 0 || days > MAX_NUTRITION_WINDOW_DAYS {
            return Err(ServiceError::InvalidInput(format!(
                "days must be between 1 and {}",
                MAX_NUTRITION_WINDOW_DAYS
            )));
        }
        let record = self.ensure_record(user_id, now).await?;
        if record.tier != SubscriptionTier::Freemium || record.nutrition_access().is_none() {
            debug!("Nothing to extend for {} on tier {}", user_id, record.tier);
            return Ok(record);
        }

        let updated = self
            .bounded(self.store.modify(
                user_id,
                Box::new(move |record: &mut UserQuotaRecord| {
                    record.extend_nutrition(days, now);
                }),
            ))
            .await?;
        info!("Extended nutrition window for {} by {} days", user_id, days);
        Ok(updated)
    }

    pub async fn revoke_nutrition_access(&self, user_id: &str) -> Result<UserQuotaRecord, ServiceError> {
        self.revoke_nutrition_access_at(user_id, Utc::now()).await
    }

    /// Close a freemium window at `now`. Paid tiers keep persistent access
    /// and users without a plan are returned unchanged.
    pub async fn revoke_nutrition_access_at(
        &self,
        user_id: &str,
        now: DateTime<Utc>,
    ) -> Result<UserQuotaRecord, ServiceError> {
        let record = self.ensure_record(user_id, now).await?;
        if record.tier != SubscriptionTier::Freemium || record.nutrition_access().is_none() {
            debug!("Nothing to revoke for {} on tier {}", user_id, record.tier);
            return Ok(record);
        }

        let updated = self
            .bounded(self.store.modify(
                user_id,
                Box::new(move |record: &mut UserQuotaRecord| {
                    record.revoke_nutrition(now);
                }),
            ))
            .await?;
        info!("🔒 Nutrition access revoked for {}", user_id);
        Ok(updated)
    }

    pub async fn nutrition_access_stats(&self) -> Result<Vec<NutritionAccessStats>, ServiceError> {
        self.nutrition_access_stats_at(Utc::now()).await
    }

    /// Per-tier counts of unlocked, active and expired nutrition access
    pub async fn nutrition_access_stats_at(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<NutritionAccessStats>, ServiceError> {
        self.bounded(self.store.nutrition_access_stats(now)).await
    }

    // === Events ===

    pub async fn handle_event(&self, event: EntitlementEvent) -> Result<UserQuotaRecord, ServiceError> {
        self.handle_event_at(event, Utc::now()).await
    }

    pub async fn handle_event_at(
        &self,
        event: EntitlementEvent,
        now: DateTime<Utc>,
    ) -> Result<UserQuotaRecord, ServiceError> {
        match event {
            EntitlementEvent::TierChanged { user_id, tier, plan_code } => {
                let tier = resolve_event_tier(tier, plan_code.as_deref());
                self.change_tier_at(&user_id, tier, now).await
            }
            EntitlementEvent::NutritionPlanGenerated { user_id, tier } => {
                self.regenerate_nutrition_access_at(&user_id, tier, now).await
            }
        }
    }

    // === Billing period ===

    /// Reset every record whose period has ended
    pub async fn reset_all_for_period(&self, now: DateTime<Utc>) -> Result<ResetReport, ServiceError> {
        let report = self.store.reset_all_for_period(now).await?;
        if report.failed > 0 {
            warn!("{} quota records failed to reset and will be retried next pass", report.failed);
        }
        Ok(report)
    }
}
