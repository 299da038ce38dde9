//! Subscription Tiers
//!
//! The subscription level that decides which limits apply to a user.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Subscription tiers, ordered by entitlement.
///
/// Entitlements are not strictly monotonic per field (attachments are a
/// flag, message quotas differ), but a higher tier never has less overall.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionTier {
    /// Free tier with a time-limited nutrition window
    #[default]
    Freemium,
    /// Paid tier
    Premium,
    /// Paid tier with unlimited coach messages
    SmartPremium,
}

impl SubscriptionTier {
    /// All tiers, lowest first
    pub const ALL: [SubscriptionTier; 3] = [Self::Freemium, Self::Premium, Self::SmartPremium];

    /// Canonical wire name
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Freemium => "freemium",
            Self::Premium => "premium",
            Self::SmartPremium => "smart_premium",
        }
    }

    /// Map a billing plan code onto a tier.
    ///
    /// Unknown or missing plan codes fall back to freemium, so a cancelled
    /// or unrecognized subscription never grants paid entitlements.
    pub fn from_plan_code(plan_code: Option<&str>) -> Self {
        match plan_code {
            Some("smart_premium") | Some("smart-premium") | Some("smartPremium") => Self::SmartPremium,
            Some("premium") => Self::Premium,
            _ => Self::Freemium,
        }
    }

    pub fn is_paid(&self) -> bool {
        !matches!(self, Self::Freemium)
    }
}

impl fmt::Display for SubscriptionTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Unknown subscription tier: {0}")]
pub struct UnknownTier(pub String);

impl FromStr for SubscriptionTier {
    type Err = UnknownTier;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "freemium" => Ok(Self::Freemium),
            "premium" => Ok(Self::Premium),
            "smart_premium" => Ok(Self::SmartPremium),
            other => Err(UnknownTier(other.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tier_ordering() {
        assert!(SubscriptionTier::Freemium < SubscriptionTier::Premium);
        assert!(SubscriptionTier::Premium < SubscriptionTier::SmartPremium);
        assert_eq!(SubscriptionTier::default(), SubscriptionTier::Freemium);
    }

    #[test]
    fn test_plan_code_mapping() {
        assert_eq!(SubscriptionTier::from_plan_code(Some("smart-premium")), SubscriptionTier::SmartPremium);
        assert_eq!(SubscriptionTier::from_plan_code(Some("smartPremium")), SubscriptionTier::SmartPremium);
        assert_eq!(SubscriptionTier::from_plan_code(Some("premium")), SubscriptionTier::Premium);
        assert_eq!(SubscriptionTier::from_plan_code(Some("gold")), SubscriptionTier::Freemium);
        assert_eq!(SubscriptionTier::from_plan_code(None), SubscriptionTier::Freemium);
    }

    #[test]
    fn test_from_str_rejects_unknown() {
        assert_eq!("premium".parse::<SubscriptionTier>().unwrap(), SubscriptionTier::Premium);
        assert!("platinum".parse::<SubscriptionTier>().is_err());
    }

    #[test]
    fn test_serde_names() {
        let json = serde_json::to_string(&SubscriptionTier::SmartPremium).unwrap();
        assert_eq!(json, "\"smart_premium\"");
    }
}
