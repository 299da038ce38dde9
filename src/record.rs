//! Per-user quota record
//!
//! One record per user: usage counters for the current billing period,
//! the current tier and the embedded nutrition-access window.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::limits::{next_reset_after, TierLimitTable, TierLimits};
use crate::nutrition::{derive_expiry, NutritionAccess};
use crate::tier::SubscriptionTier;

/// A usage counter on the record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UsageField {
    Messages,
    Calls,
    Attachments,
}

impl UsageField {
    /// Column name used by durable stores
    pub fn column(&self) -> &'static str {
        match self {
            Self::Messages => "messages_used",
            Self::Calls => "calls_used",
            Self::Attachments => "attachments_used",
        }
    }
}

/// Durable per-user quota state
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserQuotaRecord {
    pub user_id: String,
    pub tier: SubscriptionTier,
    pub messages_used: u32,
    pub calls_used: u32,
    pub attachments_used: u32,
    /// Next counter reset
    pub reset_at: DateTime<Utc>,
    pub nutrition_plan_generated_at: Option<DateTime<Utc>>,
    pub nutrition_expires_at: Option<DateTime<Utc>>,
    pub nutrition_locked: bool,
    /// Window applied to this user; may lag a config change until the
    /// next regeneration
    pub nutrition_window_days: Option<u32>,
}

impl UserQuotaRecord {
    /// Default record for a user seen for the first time
    pub fn new(user_id: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            user_id: user_id.into(),
            tier: SubscriptionTier::Freemium,
            messages_used: 0,
            calls_used: 0,
            attachments_used: 0,
            reset_at: next_reset_after(now),
            nutrition_plan_generated_at: None,
            nutrition_expires_at: None,
            nutrition_locked: false,
            nutrition_window_days: None,
        }
    }

    pub fn usage(&self, field: UsageField) -> u32 {
        match field {
            UsageField::Messages => self.messages_used,
            UsageField::Calls => self.calls_used,
            UsageField::Attachments => self.attachments_used,
        }
    }

    pub fn increment(&mut self, field: UsageField) {
        let counter = match field {
            UsageField::Messages => &mut self.messages_used,
            UsageField::Calls => &mut self.calls_used,
            UsageField::Attachments => &mut self.attachments_used,
        };
        *counter = counter.saturating_add(1);
    }

    /// Whether the billing period has ended
    pub fn is_due_for_reset(&self, now: DateTime<Utc>) -> bool {
        self.reset_at <= now
    }

    /// Zero the counters and move `reset_at` to the next period boundary
    pub fn roll_over(&mut self, now: DateTime<Utc>) {
        self.messages_used = 0;
        self.calls_used = 0;
        self.attachments_used = 0;
        self.reset_at = next_reset_after(now);
    }

    /// Copy of the record as it will look once a due reset is applied
    pub fn rolled_over_view(&self, now: DateTime<Utc>) -> Self {
        let mut view = self.clone();
        if view.is_due_for_reset(now) {
            view.roll_over(now);
        }
        view
    }

    /// Nutrition access fields, if a plan has ever been generated
    pub fn nutrition_access(&self) -> Option<NutritionAccess> {
        self.nutrition_plan_generated_at.map(|generated_at| NutritionAccess {
            plan_generated_at: generated_at,
            expires_at: self.nutrition_expires_at,
            locked: self.nutrition_locked,
            window_days: self.nutrition_window_days,
        })
    }

    /// Switch tier and reconcile the nutrition window. Counters are left
    /// untouched.
    ///
    /// Re-sending the current tier leaves the record as it is, so an
    /// extension or unlock survives repeated billing events.
    pub fn reconcile_tier(&mut self, tier: SubscriptionTier, table: &TierLimitTable) {
        if self.tier == tier {
            return;
        }
        self.tier = tier;
        let limits = table.get(tier);

        if limits.nutrition_persistent {
            self.clear_nutrition_window();
            return;
        }

        match self.nutrition_plan_generated_at {
            Some(generated_at) => {
                let window = self.nutrition_window_days.or(limits.nutrition_window_days);
                self.nutrition_window_days = window;
                self.nutrition_expires_at = derive_expiry(tier, generated_at, window);
                self.nutrition_locked = self.nutrition_expires_at.is_some();
            }
            None => {
                self.nutrition_expires_at = None;
                self.nutrition_locked = false;
            }
        }
    }

    /// Start a fresh nutrition window at `now` for the current tier
    pub fn regenerate_nutrition(&mut self, limits: &TierLimits, now: DateTime<Utc>) {
        self.nutrition_plan_generated_at = Some(now);
        if limits.nutrition_persistent {
            self.clear_nutrition_window();
            return;
        }
        self.nutrition_window_days = limits.nutrition_window_days;
        self.nutrition_expires_at = derive_expiry(self.tier, now, self.nutrition_window_days);
        self.nutrition_locked = self.nutrition_expires_at.is_some();
    }

    /// Remove any lock or expiry regardless of tier
    pub fn unlock_nutrition(&mut self, now: DateTime<Utc>) {
        if self.nutrition_plan_generated_at.is_none() {
            self.nutrition_plan_generated_at = Some(now);
        }
        self.clear_nutrition_window();
    }

    /// Push a freemium expiry out by `days`, counting from `now` when the
    /// window has already closed. Returns false when nothing changed,
    /// including when the new expiry is out of range.
    pub fn extend_nutrition(&mut self, days: u32, now: DateTime<Utc>) -> bool {
        if self.tier != SubscriptionTier::Freemium {
            return false;
        }
        let Some(current) = self.nutrition_access().and_then(|access| {
            access
                .expires_at
                .or_else(|| derive_expiry(self.tier, access.plan_generated_at, access.window_days))
        }) else {
            return false;
        };

        let base = if current > now { current } else { now };
        let extended = Duration::try_days(i64::from(days)).and_then(|delta| base.checked_add_signed(delta));
        let Some(extended) = extended else {
            return false;
        };
        self.nutrition_expires_at = Some(extended);
        self.nutrition_locked = true;
        true
    }

    /// Force a freemium plan's window closed at `now`. Returns false for
    /// persistent tiers and users without a plan.
    pub fn revoke_nutrition(&mut self, now: DateTime<Utc>) -> bool {
        if self.tier != SubscriptionTier::Freemium || self.nutrition_plan_generated_at.is_none() {
            return false;
        }
        self.nutrition_expires_at = Some(now);
        self.nutrition_locked = true;
        true
    }

    fn clear_nutrition_window(&mut self) {
        self.nutrition_locked = false;
        self.nutrition_expires_at = None;
        self.nutrition_window_days = None;
    }

    pub fn snapshot(&self, limits: &TierLimits) -> QuotaSnapshot {
        QuotaSnapshot {
            user_id: self.user_id.clone(),
            tier: self.tier,
            usage: UsageSnapshot {
                messages_used: self.messages_used,
                calls_used: self.calls_used,
                attachments_used: self.attachments_used,
                reset_at: self.reset_at,
            },
            limits: limits.clone(),
        }
    }
}

/// Counter values for the current period
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageSnapshot {
    pub messages_used: u32,
    pub calls_used: u32,
    pub attachments_used: u32,
    pub reset_at: DateTime<Utc>,
}

/// Read-only view returned by the quota snapshot endpoint
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuotaSnapshot {
    pub user_id: String,
    pub tier: SubscriptionTier,
    pub usage: UsageSnapshot,
    pub limits: TierLimits,
}
