//! Quota Evaluator
//!
//! Pure allow/deny decisions for gated actions. The same function backs
//! both the read-only check and the atomic consume path, so the two can
//! never disagree about what is allowed.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::limits::{QuotaLimit, TierLimitTable, TierLimits, QUOTA_WARNING_THRESHOLD};
use crate::record::{UsageField, UserQuotaRecord};
use crate::tier::SubscriptionTier;

pub const REASON_MESSAGES: &str = "Message quota exceeded";
pub const REASON_CALLS: &str = "Call quota exceeded";
pub const REASON_ATTACHMENTS: &str = "Attachments are not available on this tier";

/// A gated action a user can attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QuotaAction {
    Message,
    Call,
    Attachment,
}

impl QuotaAction {
    /// The usage counter this action increments
    pub fn usage_field(&self) -> UsageField {
        match self {
            Self::Message => UsageField::Messages,
            Self::Call => UsageField::Calls,
            Self::Attachment => UsageField::Attachments,
        }
    }
}

impl fmt::Display for QuotaAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Message => f.write_str("message"),
            Self::Call => f.write_str("call"),
            Self::Attachment => f.write_str("attachment"),
        }
    }
}

impl FromStr for QuotaAction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "message" => Ok(Self::Message),
            "call" => Ok(Self::Call),
            "attachment" => Ok(Self::Attachment),
            other => Err(format!("Unsupported action: {}", other)),
        }
    }
}

/// Units left in the current period
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "QuotaLimit", from = "QuotaLimit")]
pub enum Remaining {
    Count(u32),
    Unlimited,
}

impl From<Remaining> for QuotaLimit {
    fn from(remaining: Remaining) -> Self {
        match remaining {
            Remaining::Count(n) => QuotaLimit::Limited(n),
            Remaining::Unlimited => QuotaLimit::Unlimited,
        }
    }
}

impl From<QuotaLimit> for Remaining {
    fn from(limit: QuotaLimit) -> Self {
        match limit {
            QuotaLimit::Limited(n) => Remaining::Count(n),
            QuotaLimit::Unlimited => Remaining::Unlimited,
        }
    }
}

/// Outcome of evaluating an action against a tier's limits
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuotaEvaluation {
    pub allowed: bool,
    pub remaining: Remaining,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub usage_percent: Option<f64>,
    /// Allowed, but at or past the warning threshold
    #[serde(default)]
    pub warning: bool,
}

impl QuotaEvaluation {
    fn granted(remaining: Remaining, usage_percent: Option<f64>) -> Self {
        let warning = usage_percent.map_or(false, |pct| pct >= QUOTA_WARNING_THRESHOLD);
        Self {
            allowed: true,
            remaining,
            reason: None,
            usage_percent,
            warning,
        }
    }

    fn denied(reason: &str, usage_percent: Option<f64>) -> Self {
        Self {
            allowed: false,
            remaining: Remaining::Count(0),
            reason: Some(reason.to_string()),
            usage_percent,
            warning: false,
        }
    }

    /// Report for an action that has just been committed.
    ///
    /// `record` is the state after the increment, so `remaining` already
    /// accounts for the unit just consumed.
    pub fn after_consumption(limits: &TierLimits, record: &UserQuotaRecord, action: QuotaAction) -> Self {
        match counted_limit(limits, action) {
            Some(QuotaLimit::Limited(max)) => {
                let used = record.usage(action.usage_field());
                Self::granted(Remaining::Count(max.saturating_sub(used)), Some(usage_ratio(used, max)))
            }
            Some(QuotaLimit::Unlimited) => Self::granted(Remaining::Unlimited, Some(0.0)),
            None => Self::granted(Remaining::Unlimited, None),
        }
    }
}

/// The numeric cap on an action, or `None` for flag-gated actions
fn counted_limit(limits: &TierLimits, action: QuotaAction) -> Option<QuotaLimit> {
    match action {
        QuotaAction::Message => Some(limits.message_quota),
        QuotaAction::Call => Some(QuotaLimit::Limited(limits.call_quota)),
        QuotaAction::Attachment => None,
    }
}

fn usage_ratio(used: u32, max: u32) -> f64 {
    if max == 0 {
        1.0
    } else {
        f64::from(used) / f64::from(max)
    }
}

/// Decide whether `action` is allowed for `record` under `limits`.
///
/// Never mutates the record.
pub fn evaluate(limits: &TierLimits, record: &UserQuotaRecord, action: QuotaAction) -> QuotaEvaluation {
    match action {
        QuotaAction::Message => evaluate_counted(limits.message_quota, record.messages_used, REASON_MESSAGES),
        QuotaAction::Call => {
            evaluate_counted(QuotaLimit::Limited(limits.call_quota), record.calls_used, REASON_CALLS)
        }
        QuotaAction::Attachment => {
            if limits.attachments_allowed {
                QuotaEvaluation::granted(Remaining::Unlimited, None)
            } else {
                QuotaEvaluation::denied(REASON_ATTACHMENTS, None)
            }
        }
    }
}

fn evaluate_counted(limit: QuotaLimit, used: u32, reason: &str) -> QuotaEvaluation {
    match limit {
        QuotaLimit::Unlimited => QuotaEvaluation::granted(Remaining::Unlimited, Some(0.0)),
        QuotaLimit::Limited(max) if used < max => {
            QuotaEvaluation::granted(Remaining::Count(max - used), Some(usage_ratio(used, max)))
        }
        QuotaLimit::Limited(max) => QuotaEvaluation::denied(reason, Some(usage_ratio(used, max))),
    }
}

/// Lowest tier whose limits would allow `action` at the record's usage
pub fn minimum_tier_for(
    table: &TierLimitTable,
    record: &UserQuotaRecord,
    action: QuotaAction,
) -> Option<SubscriptionTier> {
    table
        .iter()
        .find(|(_, limits)| evaluate(limits, record, action).allowed)
        .map(|(tier, _)| tier)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn record(tier: SubscriptionTier) -> UserQuotaRecord {
        let mut record = UserQuotaRecord::new("user-1", Utc::now());
        record.tier = tier;
        record
    }

    #[test]
    fn test_messages_under_limit() {
        let mut usage = record(SubscriptionTier::Freemium);
        usage.messages_used = 10;

        let result = evaluate(&TierLimits::freemium(), &usage, QuotaAction::Message);
        assert!(result.allowed);
        assert_eq!(result.remaining, Remaining::Count(10));
        assert!(!result.warning);
    }

    #[test]
    fn test_messages_at_limit() {
        let mut usage = record(SubscriptionTier::Freemium);
        usage.messages_used = 20;

        let result = evaluate(&TierLimits::freemium(), &usage, QuotaAction::Message);
        assert!(!result.allowed);
        assert_eq!(result.remaining, Remaining::Count(0));
        assert_eq!(result.reason.as_deref(), Some(REASON_MESSAGES));
    }

    #[test]
    fn test_messages_past_limit_clamped() {
        let mut usage = record(SubscriptionTier::Freemium);
        usage.messages_used = 35;

        let result = evaluate(&TierLimits::freemium(), &usage, QuotaAction::Message);
        assert!(!result.allowed);
        assert_eq!(result.remaining, Remaining::Count(0));
    }

    #[test]
    fn test_warning_threshold() {
        let mut usage = record(SubscriptionTier::Freemium);
        usage.messages_used = 16;

        let result = evaluate(&TierLimits::freemium(), &usage, QuotaAction::Message);
        assert!(result.allowed);
        assert!(result.warning);
        assert_eq!(result.usage_percent, Some(0.8));
    }

    #[test]
    fn test_smart_premium_messages_unlimited() {
        let mut usage = record(SubscriptionTier::SmartPremium);
        usage.messages_used = 100_000;

        let result = evaluate(&TierLimits::smart_premium(), &usage, QuotaAction::Message);
        assert!(result.allowed);
        assert_eq!(result.remaining, Remaining::Unlimited);
    }

    #[test]
    fn test_calls_exhausted() {
        let mut usage = record(SubscriptionTier::Premium);
        usage.calls_used = 2;

        let result = evaluate(&TierLimits::premium(), &usage, QuotaAction::Call);
        assert!(!result.allowed);
        assert_eq!(result.reason.as_deref(), Some(REASON_CALLS));
    }

    #[test]
    fn test_attachments_by_tier() {
        let denied = evaluate(&TierLimits::freemium(), &record(SubscriptionTier::Freemium), QuotaAction::Attachment);
        assert!(!denied.allowed);
        assert!(denied.reason.unwrap().contains("Attachments"));

        let allowed = evaluate(&TierLimits::premium(), &record(SubscriptionTier::Premium), QuotaAction::Attachment);
        assert!(allowed.allowed);
        assert_eq!(allowed.remaining, Remaining::Unlimited);
    }

    #[test]
    fn test_after_consumption_counts_committed_unit() {
        let mut usage = record(SubscriptionTier::Freemium);
        usage.calls_used = 1;

        let result = QuotaEvaluation::after_consumption(&TierLimits::freemium(), &usage, QuotaAction::Call);
        assert!(result.allowed);
        assert_eq!(result.remaining, Remaining::Count(0));
        assert!(result.warning);
    }

    #[test]
    fn test_minimum_tier_for_denials() {
        let table = TierLimitTable::default();
        let mut usage = record(SubscriptionTier::Freemium);
        usage.messages_used = 20;
        assert_eq!(minimum_tier_for(&table, &usage, QuotaAction::Message), Some(SubscriptionTier::Premium));
        assert_eq!(minimum_tier_for(&table, &usage, QuotaAction::Attachment), Some(SubscriptionTier::Premium));

        usage.calls_used = 3;
        assert_eq!(minimum_tier_for(&table, &usage, QuotaAction::Call), Some(SubscriptionTier::SmartPremium));

        usage.calls_used = 4;
        assert_eq!(minimum_tier_for(&table, &usage, QuotaAction::Call), None);
    }

    #[test]
    fn test_remaining_serde() {
        assert_eq!(serde_json::to_string(&Remaining::Unlimited).unwrap(), "\"unlimited\"");
        assert_eq!(serde_json::to_string(&Remaining::Count(3)).unwrap(), "3");
    }
}
