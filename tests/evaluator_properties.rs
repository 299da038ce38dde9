//! Evaluator Property Tests
//!
//! Randomized checks that the pure evaluator, the read-only check and the
//! atomic consume path agree with each other.

use chrono::{TimeZone, Utc};
use proptest::prelude::*;
use std::sync::Arc;

use entitlement_core::evaluator::minimum_tier_for;
use entitlement_core::{
    evaluate, InMemoryQuotaStore, QuotaAction, QuotaLimit, QuotaService, QuotaStore, Remaining, SubscriptionTier,
    TierLimitTable, UserQuotaRecord,
};

fn tier_strategy() -> impl Strategy<Value = SubscriptionTier> {
    prop_oneof![
        Just(SubscriptionTier::Freemium),
        Just(SubscriptionTier::Premium),
        Just(SubscriptionTier::SmartPremium),
    ]
}

fn action_strategy() -> impl Strategy<Value = QuotaAction> {
    prop_oneof![
        Just(QuotaAction::Message),
        Just(QuotaAction::Call),
        Just(QuotaAction::Attachment),
    ]
}

fn record(tier: SubscriptionTier, messages: u32, calls: u32) -> UserQuotaRecord {
    let mut record = UserQuotaRecord::new("prop-user", Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap());
    record.tier = tier;
    record.messages_used = messages;
    record.calls_used = calls;
    record
}

proptest! {
    /// Denials always report zero remaining and a reason
    #[test]
    fn prop_denial_shape(tier in tier_strategy(), action in action_strategy(), messages in 0u32..400, calls in 0u32..8) {
        let table = TierLimitTable::default();
        let result = evaluate(table.get(tier), &record(tier, messages, calls), action);
        if result.allowed {
            prop_assert!(result.reason.is_none());
            prop_assert_ne!(result.remaining, Remaining::Count(0));
        } else {
            prop_assert_eq!(result.remaining, Remaining::Count(0));
            prop_assert!(result.reason.is_some());
            prop_assert!(!result.warning);
        }
    }

    /// Limited message quotas allow exactly while usage is below the cap
    #[test]
    fn prop_message_quota_boundary(tier in tier_strategy(), messages in 0u32..400) {
        let table = TierLimitTable::default();
        let limits = table.get(tier);
        let result = evaluate(limits, &record(tier, messages, 0), QuotaAction::Message);
        match limits.message_quota {
            QuotaLimit::Limited(max) => prop_assert_eq!(result.allowed, messages < max),
            QuotaLimit::Unlimited => prop_assert_eq!(result.remaining, Remaining::Unlimited),
        }
    }

    /// Anything allowed on a tier is allowed on every higher tier
    #[test]
    fn prop_higher_tiers_never_stricter(action in action_strategy(), messages in 0u32..400, calls in 0u32..8) {
        let table = TierLimitTable::default();
        let usage = record(SubscriptionTier::Freemium, messages, calls);
        let mut allowed_below = false;
        for (_, limits) in table.iter() {
            let allowed = evaluate(limits, &usage, action).allowed;
            prop_assert!(allowed || !allowed_below);
            allowed_below = allowed;
        }
        if let Some(tier) = minimum_tier_for(&table, &usage, action) {
            prop_assert!(evaluate(table.get(tier), &usage, action).allowed);
        }
    }

    /// A check followed by a consume on the same state gives the same answer
    #[test]
    fn prop_check_and_consume_agree(
        tier in tier_strategy(),
        actions in proptest::collection::vec(action_strategy(), 1..40),
    ) {
        let runtime = tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap();
        runtime.block_on(async {
            let store = Arc::new(InMemoryQuotaStore::new());
            let service = QuotaService::new(store.clone(), TierLimitTable::default());
            let now = Utc.with_ymd_and_hms(2025, 1, 10, 0, 0, 0).unwrap();
            service.change_tier_at("prop-user", tier, now).await.unwrap();

            for action in actions {
                let before = store.read("prop-user").await.unwrap();
                let check = service.check_only_at("prop-user", action, now).await.unwrap();
                let consume = service.consume_at("prop-user", action, now).await.unwrap();
                let after = store.read("prop-user").await.unwrap();

                assert_eq!(check.allowed, consume.allowed);
                let field = action.usage_field();
                let expected = if consume.allowed { before.usage(field) + 1 } else { before.usage(field) };
                assert_eq!(after.usage(field), expected);
            }
        });
    }
}
