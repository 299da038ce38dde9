//! Nutrition Access Policy
//!
//! Decides whether a user may open their nutrition plan right now.
//! Paid tiers have persistent access. Freemium users get a rolling window
//! that starts when their plan is generated and locks when it runs out.
//!
//! All window arithmetic lives here: expiry derivation and the day/hour
//! rounding rules are defined once and used by every caller.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::tier::SubscriptionTier;

const MS_PER_HOUR: i64 = 60 * 60 * 1000;
const MS_PER_DAY: i64 = 24 * MS_PER_HOUR;

pub const MESSAGE_NOT_GENERATED: &str = "Nutrition plan not generated";
pub const MESSAGE_EXPIRED: &str = "Access expired — upgrade to unlock";

/// The nutrition-access fields of a user's quota record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NutritionAccess {
    pub plan_generated_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
    pub locked: bool,
    pub window_days: Option<u32>,
}

/// Result of a nutrition access check
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NutritionStatus {
    pub is_expired: bool,
    pub is_locked: bool,
    pub days_remaining: Option<i64>,
    pub hours_remaining: Option<i64>,
    pub can_access: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl NutritionStatus {
    fn persistent() -> Self {
        Self {
            is_expired: false,
            is_locked: false,
            days_remaining: None,
            hours_remaining: None,
            can_access: true,
            message: None,
        }
    }
}

/// Plan metadata as exposed to clients
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NutritionPlanInfo {
    pub generated_at: Option<DateTime<Utc>>,
    pub expires_at: Option<DateTime<Utc>>,
    pub locked: bool,
    pub window_days: Option<u32>,
}

/// `{plan, status}` response for nutrition access endpoints
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NutritionPayload {
    pub plan: NutritionPlanInfo,
    pub status: NutritionStatus,
}

impl NutritionPayload {
    pub fn build(tier: SubscriptionTier, access: Option<&NutritionAccess>, now: DateTime<Utc>) -> Self {
        let plan = match access {
            Some(access) => NutritionPlanInfo {
                generated_at: Some(access.plan_generated_at),
                expires_at: access.expires_at,
                locked: access.locked,
                window_days: access.window_days,
            },
            None => NutritionPlanInfo {
                generated_at: None,
                expires_at: None,
                locked: true,
                window_days: None,
            },
        };

        Self {
            plan,
            status: status(tier, access, now),
        }
    }
}

/// Expiry of a plan generated at `generated_at`.
///
/// Only freemium plans expire; every other tier returns `None`.
pub fn derive_expiry(
    tier: SubscriptionTier,
    generated_at: DateTime<Utc>,
    window_days: Option<u32>,
) -> Option<DateTime<Utc>> {
    match (tier, window_days) {
        (SubscriptionTier::Freemium, Some(days)) => {
            Duration::try_days(i64::from(days)).and_then(|window| generated_at.checked_add_signed(window))
        }
        _ => None,
    }
}

/// Per-tier breakdown of nutrition access at one instant
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct NutritionAccessStats {
    pub tier: SubscriptionTier,
    pub total_users: u64,
    /// Users with a plan and no running countdown
    pub unlocked: u64,
    /// Freemium users still inside their window
    pub active_windows: u64,
    pub expired_windows: u64,
}

impl NutritionAccessStats {
    pub fn empty(tier: SubscriptionTier) -> Self {
        Self {
            tier,
            total_users: 0,
            unlocked: 0,
            active_windows: 0,
            expired_windows: 0,
        }
    }

    /// Count one user of this tier
    pub fn tally(&mut self, access: Option<&NutritionAccess>, now: DateTime<Utc>) {
        self.total_users += 1;
        if access.is_none() {
            return;
        }
        let status = status(self.tier, access, now);
        if status.is_expired {
            self.expired_windows += 1;
        } else if status.days_remaining.is_some() {
            self.active_windows += 1;
        } else {
            self.unlocked += 1;
        }
    }
}

/// Stats for every tier, lowest first, from `(tier, access)` pairs
pub fn access_stats<I>(users: I, now: DateTime<Utc>) -> Vec<NutritionAccessStats>
where
    I: IntoIterator<Item = (SubscriptionTier, Option<NutritionAccess>)>,
{
    let mut stats: Vec<NutritionAccessStats> =
        SubscriptionTier::ALL.into_iter().map(NutritionAccessStats::empty).collect();
    for (tier, access) in users {
        if let Some(entry) = stats.iter_mut().find(|entry| entry.tier == tier) {
            entry.tally(access.as_ref(), now);
        }
    }
    stats
}

fn ceil_div(value: i64, unit: i64) -> i64 {
    (value + unit - 1) / unit
}

/// Nutrition access status for `tier` at `now`.
///
/// Days and hours remaining are each rounded up from the raw millisecond
/// delta, so 25 hours left reads as 2 days and 25 hours.
pub fn status(tier: SubscriptionTier, access: Option<&NutritionAccess>, now: DateTime<Utc>) -> NutritionStatus {
    let Some(access) = access else {
        return NutritionStatus {
            is_expired: false,
            is_locked: true,
            days_remaining: None,
            hours_remaining: None,
            can_access: false,
            message: Some(MESSAGE_NOT_GENERATED.to_string()),
        };
    };

    if tier != SubscriptionTier::Freemium {
        return NutritionStatus::persistent();
    }

    let expires_at = access
        .expires_at
        .or_else(|| derive_expiry(tier, access.plan_generated_at, access.window_days));

    // Explicitly unlocked freemium plans carry neither expiry nor window
    let Some(expires_at) = expires_at else {
        return NutritionStatus::persistent();
    };

    let delta_ms = (expires_at - now).num_milliseconds();
    if delta_ms <= 0 {
        return NutritionStatus {
            is_expired: true,
            is_locked: true,
            days_remaining: Some(0),
            hours_remaining: Some(0),
            can_access: false,
            message: Some(MESSAGE_EXPIRED.to_string()),
        };
    }

    NutritionStatus {
        is_expired: false,
        is_locked: false,
        days_remaining: Some(ceil_div(delta_ms, MS_PER_DAY)),
        hours_remaining: Some(ceil_div(delta_ms, MS_PER_HOUR)),
        can_access: true,
        message: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(y: i32, mo: u32, d: u32, h: u32, mi: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, mo, d, h, mi, s).unwrap()
    }

    fn trial(generated_at: DateTime<Utc>) -> NutritionAccess {
        NutritionAccess {
            plan_generated_at: generated_at,
            expires_at: None,
            locked: true,
            window_days: Some(7),
        }
    }

    #[test]
    fn test_no_plan_is_locked() {
        let status = status(SubscriptionTier::Premium, None, Utc::now());
        assert!(!status.can_access);
        assert!(status.is_locked);
        assert_eq!(status.message.as_deref(), Some(MESSAGE_NOT_GENERATED));
    }

    #[test]
    fn test_paid_tiers_ignore_stale_expiry() {
        let mut access = trial(at(2025, 1, 1, 0, 0, 0));
        access.expires_at = Some(at(2025, 1, 8, 0, 0, 0));

        let status = status(SubscriptionTier::SmartPremium, Some(&access), at(2025, 6, 1, 0, 0, 0));
        assert!(status.can_access);
        assert!(!status.is_expired);
        assert!(!status.is_locked);
        assert_eq!(status.days_remaining, None);
        assert_eq!(status.hours_remaining, None);
    }

    #[test]
    fn test_freemium_last_hour_of_window() {
        let access = trial(at(2025, 1, 1, 0, 0, 0));
        let status = status(SubscriptionTier::Freemium, Some(&access), at(2025, 1, 7, 23, 0, 0));
        assert!(status.can_access);
        assert_eq!(status.days_remaining, Some(1));
        assert_eq!(status.hours_remaining, Some(1));
    }

    #[test]
    fn test_freemium_just_after_expiry() {
        let access = trial(at(2025, 1, 1, 0, 0, 0));
        let status = status(SubscriptionTier::Freemium, Some(&access), at(2025, 1, 8, 0, 0, 1));
        assert!(status.is_expired);
        assert!(status.is_locked);
        assert!(!status.can_access);
        assert_eq!(status.days_remaining, Some(0));
        assert_eq!(status.message.as_deref(), Some(MESSAGE_EXPIRED));
    }

    #[test]
    fn test_expiry_instant_counts_as_expired() {
        let access = trial(at(2025, 1, 1, 0, 0, 0));
        let status = status(SubscriptionTier::Freemium, Some(&access), at(2025, 1, 8, 0, 0, 0));
        assert!(status.is_expired);
    }

    #[test]
    fn test_hours_not_derived_from_days() {
        let now = at(2025, 1, 1, 0, 0, 0);
        let access = NutritionAccess {
            plan_generated_at: now,
            expires_at: Some(now + Duration::hours(25)),
            locked: true,
            window_days: Some(7),
        };
        let status = status(SubscriptionTier::Freemium, Some(&access), now);
        assert_eq!(status.days_remaining, Some(2));
        assert_eq!(status.hours_remaining, Some(25));
    }

    #[test]
    fn test_stored_expiry_wins_over_window() {
        let generated = at(2025, 1, 1, 0, 0, 0);
        let access = NutritionAccess {
            plan_generated_at: generated,
            expires_at: Some(at(2025, 1, 20, 0, 0, 0)),
            locked: true,
            window_days: Some(7),
        };
        let status = status(SubscriptionTier::Freemium, Some(&access), at(2025, 1, 10, 0, 0, 0));
        assert!(status.can_access);
        assert_eq!(status.days_remaining, Some(10));
    }

    #[test]
    fn test_derive_expiry_only_for_freemium() {
        let generated = at(2025, 1, 1, 0, 0, 0);
        assert_eq!(
            derive_expiry(SubscriptionTier::Freemium, generated, Some(7)),
            Some(at(2025, 1, 8, 0, 0, 0))
        );
        assert_eq!(derive_expiry(SubscriptionTier::Premium, generated, Some(7)), None);
        assert_eq!(derive_expiry(SubscriptionTier::Freemium, generated, None), None);
        assert_eq!(derive_expiry(SubscriptionTier::Freemium, generated, Some(u32::MAX)), None);
    }

    #[test]
    fn test_access_stats_per_tier() {
        let now = at(2025, 1, 5, 0, 0, 0);
        let unlocked = NutritionAccess {
            expires_at: None,
            locked: false,
            window_days: None,
            ..trial(at(2024, 12, 1, 0, 0, 0))
        };
        let users = vec![
            (SubscriptionTier::Freemium, None),
            (SubscriptionTier::Freemium, Some(trial(at(2025, 1, 1, 0, 0, 0)))),
            (SubscriptionTier::Freemium, Some(trial(at(2024, 12, 1, 0, 0, 0)))),
            (SubscriptionTier::Freemium, Some(unlocked)),
            (SubscriptionTier::Premium, Some(trial(at(2024, 12, 1, 0, 0, 0)))),
        ];

        let stats = access_stats(users, now);
        assert_eq!(stats.len(), 3);
        assert_eq!(
            stats[0],
            NutritionAccessStats {
                tier: SubscriptionTier::Freemium,
                total_users: 4,
                unlocked: 1,
                active_windows: 1,
                expired_windows: 1,
            }
        );
        assert_eq!(stats[1].total_users, 1);
        assert_eq!(stats[1].unlocked, 1);
        assert_eq!(stats[2], NutritionAccessStats::empty(SubscriptionTier::SmartPremium));
    }

    #[test]
    fn test_payload_without_plan() {
        let payload = NutritionPayload::build(SubscriptionTier::Freemium, None, Utc::now());
        assert_eq!(payload.plan.generated_at, None);
        assert!(!payload.status.can_access);
    }
}
