//! Collaborator events
//!
//! Billing announces subscription changes; content generation announces
//! new nutrition plans. Both arrive as tagged JSON:
//!
//! ```json
//! {"type": "tier_changed", "user_id": "u1", "plan_code": "smart-premium"}
//! {"type": "nutrition_plan_generated", "user_id": "u1"}
//! ```

use serde::{Deserialize, Serialize};

use crate::tier::SubscriptionTier;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EntitlementEvent {
    /// A subscription was created, upgraded, downgraded or cancelled.
    ///
    /// `tier` wins over `plan_code`; with neither (a cancellation) the
    /// user falls back to freemium.
    TierChanged {
        user_id: String,
        #[serde(default)]
        tier: Option<SubscriptionTier>,
        #[serde(default)]
        plan_code: Option<String>,
    },
    /// A nutrition plan was (re)generated for the user
    NutritionPlanGenerated {
        user_id: String,
        #[serde(default)]
        tier: Option<SubscriptionTier>,
    },
}

impl EntitlementEvent {
    pub fn user_id(&self) -> &str {
        match self {
            Self::TierChanged { user_id, .. } | Self::NutritionPlanGenerated { user_id, .. } => user_id,
        }
    }
}

/// Tier named by a tier-change event
pub fn resolve_event_tier(tier: Option<SubscriptionTier>, plan_code: Option<&str>) -> SubscriptionTier {
    tier.unwrap_or_else(|| SubscriptionTier::from_plan_code(plan_code))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_tier_changed_with_plan_code() {
        let event: EntitlementEvent =
            serde_json::from_str(r#"{"type":"tier_changed","user_id":"u1","plan_code":"smart-premium"}"#).unwrap();
        match event {
            EntitlementEvent::TierChanged { user_id, tier, plan_code } => {
                assert_eq!(user_id, "u1");
                assert_eq!(resolve_event_tier(tier, plan_code.as_deref()), SubscriptionTier::SmartPremium);
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[test]
    fn test_cancellation_resolves_to_freemium() {
        assert_eq!(resolve_event_tier(None, None), SubscriptionTier::Freemium);
        assert_eq!(
            resolve_event_tier(Some(SubscriptionTier::Premium), Some("smart_premium")),
            SubscriptionTier::Premium
        );
    }

    #[test]
    fn test_parse_plan_generated() {
        let event: EntitlementEvent =
            serde_json::from_str(r#"{"type":"nutrition_plan_generated","user_id":"u9"}"#).unwrap();
        assert_eq!(event.user_id(), "u9");
    }
}
