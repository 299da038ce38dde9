//! Entitlement Core
//!
//! Subscription entitlement and quota enforcement for a coaching app.
//!
//! This crate provides:
//! - Tier limit tables (freemium, premium, smart premium)
//! - Pure quota evaluation for messages, video calls and attachments
//! - Nutrition plan access windows for the free tier
//! - Atomic per-user consumption over pluggable storage
//! - Monthly billing-period resets
//! - An axum HTTP API and collaborator event handling

pub mod api;
pub mod config;
pub mod evaluator;
pub mod events;
pub mod limits;
pub mod nutrition;
pub mod record;
pub mod reset;
pub mod service;
pub mod store;
pub mod tier;

// Re-export main types
pub use api::{create_router, AppState};
pub use config::{ConfigError, EngineConfig, StoreBackend};
pub use evaluator::{evaluate, QuotaAction, QuotaEvaluation, Remaining};
pub use events::EntitlementEvent;
pub use limits::{
    next_reset_after, LimitsError, QuotaLimit, TierLimitTable, TierLimits, MAX_NUTRITION_WINDOW_DAYS,
    QUOTA_WARNING_THRESHOLD,
};
pub use nutrition::{NutritionAccess, NutritionAccessStats, NutritionPayload, NutritionStatus};
pub use record::{QuotaSnapshot, UsageField, UserQuotaRecord};
pub use reset::{spawn_reset_job, ResetJob, ResetJobConfig};
pub use service::{ConsumeResult, QuotaService, ServiceError};
pub use store::{InMemoryQuotaStore, QuotaStore, ResetReport, StoreError};
pub use tier::SubscriptionTier;

#[cfg(feature = "postgres")]
pub use store::PostgresQuotaStore;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
