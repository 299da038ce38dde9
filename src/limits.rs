//! Tier Limit Table
//!
//! Static per-tier limits. The table is built once at startup, validated,
//! and then shared read-only with everything that evaluates entitlements.
//!
//! | Tier          | Messages  | Calls | Call length | Attachments | Nutrition  |
//! |---------------|-----------|-------|-------------|-------------|------------|
//! | freemium      | 20        | 1     | 15 min      | no          | 7-day trial|
//! | premium       | 200       | 2     | 25 min      | yes         | persistent |
//! | smart_premium | unlimited | 4     | 25 min      | yes         | persistent |

use chrono::{DateTime, Datelike, Duration, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use crate::tier::SubscriptionTier;

/// Usage ratio at which an allowed action starts carrying a warning
pub const QUOTA_WARNING_THRESHOLD: f64 = 0.8;

/// Longest nutrition window, and longest single extension, in days
pub const MAX_NUTRITION_WINDOW_DAYS: u32 = 3650;

/// A numeric cap, or no cap at all.
///
/// Serialized as a plain number or the string `"unlimited"`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "RawLimit", try_from = "RawLimit")]
pub enum QuotaLimit {
    Limited(u32),
    Unlimited,
}

impl QuotaLimit {
    pub fn is_unlimited(&self) -> bool {
        matches!(self, Self::Unlimited)
    }

    /// Whether `used` units still leave room for one more
    pub fn permits(&self, used: u32) -> bool {
        match self {
            Self::Limited(max) => used < *max,
            Self::Unlimited => true,
        }
    }
}

#[derive(Serialize, Deserialize)]
#[serde(untagged)]
enum RawLimit {
    Count(u32),
    Word(String),
}

impl From<QuotaLimit> for RawLimit {
    fn from(limit: QuotaLimit) -> Self {
        match limit {
            QuotaLimit::Limited(n) => RawLimit::Count(n),
            QuotaLimit::Unlimited => RawLimit::Word("unlimited".to_string()),
        }
    }
}

impl TryFrom<RawLimit> for QuotaLimit {
    type Error = String;

    fn try_from(raw: RawLimit) -> Result<Self, Self::Error> {
        match raw {
            RawLimit::Count(n) => Ok(QuotaLimit::Limited(n)),
            RawLimit::Word(word) if word == "unlimited" => Ok(QuotaLimit::Unlimited),
            RawLimit::Word(word) => Err(format!("expected a number or \"unlimited\", got \"{}\"", word)),
        }
    }
}

/// Limits for a single tier
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TierLimits {
    /// Coach messages per billing period
    pub message_quota: QuotaLimit,
    /// Video calls per billing period
    pub call_quota: u32,
    /// Maximum length of a single video call (minutes)
    #[serde(default)]
    pub call_duration_minutes: u32,
    /// Whether chat attachments may be uploaded
    pub attachments_allowed: bool,
    /// Nutrition window length; `None` means not time-limited
    pub nutrition_window_days: Option<u32>,
    /// Nutrition access never locks on this tier
    pub nutrition_persistent: bool,
}

impl TierLimits {
    pub fn freemium() -> Self {
        Self {
            message_quota: QuotaLimit::Limited(20),
            call_quota: 1,
            call_duration_minutes: 15,
            attachments_allowed: false,
            nutrition_window_days: Some(7),
            nutrition_persistent: false,
        }
    }

    pub fn premium() -> Self {
        Self {
            message_quota: QuotaLimit::Limited(200),
            call_quota: 2,
            call_duration_minutes: 25,
            attachments_allowed: true,
            nutrition_window_days: None,
            nutrition_persistent: true,
        }
    }

    pub fn smart_premium() -> Self {
        Self {
            message_quota: QuotaLimit::Unlimited,
            call_quota: 4,
            call_duration_minutes: 25,
            attachments_allowed: true,
            nutrition_window_days: None,
            nutrition_persistent: true,
        }
    }
}

/// Errors raised while validating a tier table
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LimitsError {
    #[error("Expected exactly one time-limited nutrition tier, found {0}")]
    TrialTierCount(usize),
    #[error("The time-limited nutrition tier must be freemium, found {0}")]
    TrialTierNotFreemium(SubscriptionTier),
    #[error("Tier {0} has a zero-day or missing nutrition window")]
    InvalidWindow(SubscriptionTier),
    #[error("Persistent tier {0} must not declare a nutrition window")]
    PersistentWithWindow(SubscriptionTier),
    #[error("Tier {0} nutrition window of {1} days exceeds the maximum")]
    WindowTooLong(SubscriptionTier, u32),
}

/// Immutable tier → limits mapping. Tiers missing from a config file
/// keep their stock limits.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TierLimitTable {
    pub freemium: TierLimits,
    pub premium: TierLimits,
    pub smart_premium: TierLimits,
}

impl Default for TierLimitTable {
    fn default() -> Self {
        Self {
            freemium: TierLimits::freemium(),
            premium: TierLimits::premium(),
            smart_premium: TierLimits::smart_premium(),
        }
    }
}

impl TierLimitTable {
    /// Build a table and validate it in one step
    pub fn new(
        freemium: TierLimits,
        premium: TierLimits,
        smart_premium: TierLimits,
    ) -> Result<Self, LimitsError> {
        let table = Self { freemium, premium, smart_premium };
        table.validate()?;
        Ok(table)
    }

    /// Get the limits for a tier
    pub fn get(&self, tier: SubscriptionTier) -> &TierLimits {
        match tier {
            SubscriptionTier::Freemium => &self.freemium,
            SubscriptionTier::Premium => &self.premium,
            SubscriptionTier::SmartPremium => &self.smart_premium,
        }
    }

    /// Iterate tiers lowest first
    pub fn iter(&self) -> impl Iterator<Item = (SubscriptionTier, &TierLimits)> {
        SubscriptionTier::ALL.into_iter().map(move |tier| (tier, self.get(tier)))
    }

    /// Check the trial-tier invariant.
    ///
    /// Exactly one tier is time-limited, it is freemium, and its window is
    /// between one day and [`MAX_NUTRITION_WINDOW_DAYS`]. Every other tier
    /// is persistent without a window.
    pub fn validate(&self) -> Result<(), LimitsError> {
        let trial: Vec<SubscriptionTier> = self
            .iter()
            .filter(|(_, limits)| !limits.nutrition_persistent)
            .map(|(tier, _)| tier)
            .collect();

        if trial.len() != 1 {
            return Err(LimitsError::TrialTierCount(trial.len()));
        }
        if trial[0] != SubscriptionTier::Freemium {
            return Err(LimitsError::TrialTierNotFreemium(trial[0]));
        }

        for (tier, limits) in self.iter() {
            match (limits.nutrition_persistent, limits.nutrition_window_days) {
                (false, None) | (false, Some(0)) => return Err(LimitsError::InvalidWindow(tier)),
                (false, Some(days)) if days > MAX_NUTRITION_WINDOW_DAYS => {
                    return Err(LimitsError::WindowTooLong(tier, days))
                }
                (true, Some(_)) => return Err(LimitsError::PersistentWithWindow(tier)),
                _ => {}
            }
        }
        Ok(())
    }
}

/// Start of the billing period following `from`: 00:00 UTC on the first
/// day of the next calendar month. Always strictly after `from`.
pub fn next_reset_after(from: DateTime<Utc>) -> DateTime<Utc> {
    let (year, month) = if from.month() == 12 {
        (from.year() + 1, 1)
    } else {
        (from.year(), from.month() + 1)
    };

    NaiveDate::from_ymd_opt(year, month, 1)
        .and_then(|date| date.and_hms_opt(0, 0, 0))
        .map(|naive| naive.and_utc())
        .unwrap_or_else(|| from + Duration::days(31))
}
