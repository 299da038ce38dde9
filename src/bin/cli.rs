//! # Entitlement CLI
//!
//! Operator client for the entitlement server: inspect quotas, run quota
//! checks, change tiers and manage nutrition access from the shell.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use reqwest::{Client, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::debug;
use tracing_subscriber::EnvFilter;

use entitlement_core::api::{ErrorResponse, ExtendRequest, QuotaRequest, RegenerateRequest, UpgradeRequired, UserRequest};
use entitlement_core::{
    EntitlementEvent, NutritionAccessStats, NutritionPayload, QuotaEvaluation, QuotaLimit, QuotaSnapshot, Remaining,
    SubscriptionTier, TierLimitTable,
};

#[derive(Parser)]
#[command(name = "entitlement-cli")]
#[command(about = "Entitlement engine operator CLI")]
#[command(version = entitlement_core::VERSION)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Server endpoint
    #[arg(short, long, default_value = "http://localhost:8080")]
    endpoint: String,

    /// Output format (json, table, yaml)
    #[arg(short, long, default_value = "table")]
    format: String,
}

#[derive(Subcommand)]
enum Commands {
    /// Server health
    Health,

    /// Show the active tier limits
    Tiers,

    /// Quota inspection and consumption
    Quota {
        #[command(subcommand)]
        action: QuotaCommands,
    },

    /// Nutrition plan access
    Nutrition {
        #[command(subcommand)]
        action: NutritionCommands,
    },

    /// Change a user's tier
    SetTier {
        user_id: String,

        /// Tier name (freemium, premium, smart_premium)
        #[arg(long, conflicts_with = "plan_code")]
        tier: Option<SubscriptionTier>,

        /// Billing plan code, mapped to a tier by the server
        #[arg(long)]
        plan_code: Option<String>,
    },
}

#[derive(Subcommand)]
enum QuotaCommands {
    /// Show usage and limits
    Show { user_id: String },

    /// Check whether an action is allowed without consuming it
    Check {
        user_id: String,
        /// message, call or attachment
        action: String,
    },

    /// Consume one unit of an action
    Consume {
        user_id: String,
        /// message, call or attachment
        action: String,
    },
}

#[derive(Subcommand)]
enum NutritionCommands {
    /// Show access status
    Show { user_id: String },

    /// Record a newly generated plan
    Regenerate {
        user_id: String,
        #[arg(long)]
        tier: Option<SubscriptionTier>,
    },

    /// Remove any lock or expiry
    Unlock { user_id: String },

    /// Extend a free-tier window
    Extend {
        user_id: String,
        #[arg(long, default_value = "7")]
        days: u32,
    },

    /// Close a free-tier window immediately
    Revoke { user_id: String },

    /// Per-tier access counts
    Stats,
}

/// HTTP client for the entitlement server
struct EntitlementClient {
    endpoint: String,
    http_client: Client,
}

impl EntitlementClient {
    fn new(endpoint: String) -> Result<Self> {
        let http_client = Client::builder()
            .timeout(std::time::Duration::from_secs(10))
            .build()
            .context("Failed to create HTTP client")?;
        Ok(Self {
            endpoint: endpoint.trim_end_matches('/').to_string(),
            http_client,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.endpoint, path)
    }

    async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        let url = self.url(path);
        debug!("GET {}", url);
        let response = self
            .http_client
            .get(&url)
            .send()
            .await
            .with_context(|| format!("Failed to reach {}", url))?;
        decode(response).await
    }

    async fn post_raw<B: Serialize>(&self, path: &str, body: &B) -> Result<Response> {
        let url = self.url(path);
        debug!("POST {}", url);
        self.http_client
            .post(&url)
            .json(body)
            .send()
            .await
            .with_context(|| format!("Failed to reach {}", url))
    }

    async fn post<B: Serialize, T: DeserializeOwned>(&self, path: &str, body: &B) -> Result<T> {
        decode(self.post_raw(path, body).await?).await
    }
}

async fn decode<T: DeserializeOwned>(response: Response) -> Result<T> {
    let status = response.status();
    if status.is_success() {
        return response.json().await.context("Failed to decode server response");
    }
    match response.json::<ErrorResponse>().await {
        Ok(body) if body.retryable => bail!("{} (HTTP {}, retryable)", body.error, status),
        Ok(body) => bail!("{} (HTTP {})", body.error, status),
        Err(_) => bail!("Server returned HTTP {}", status),
    }
}

fn print_structured<T: Serialize>(value: &T, format: &str) -> Result<bool> {
    match format {
        "json" => println!("{}", serde_json::to_string_pretty(value)?),
        "yaml" => print!("{}", serde_yaml::to_string(value)?),
        _ => return Ok(false),
    }
    Ok(true)
}

fn limit_label(limit: QuotaLimit) -> String {
    match limit {
        QuotaLimit::Limited(n) => n.to_string(),
        QuotaLimit::Unlimited => "unlimited".to_string(),
    }
}

fn remaining_label(remaining: Remaining) -> String {
    limit_label(remaining.into())
}

fn print_tiers(table: &TierLimitTable, format: &str) -> Result<()> {
    if print_structured(table, format)? {
        return Ok(());
    }
    println!("{:<14} {:>10} {:>6} {:>9} {:>12} {:>10}", "TIER", "MESSAGES", "CALLS", "CALL MIN", "ATTACHMENTS", "NUTRITION");
    for (tier, limits) in table.iter() {
        let nutrition = match limits.nutrition_window_days {
            Some(days) if !limits.nutrition_persistent => format!("{} days", days),
            _ => "persistent".to_string(),
        };
        println!(
            "{:<14} {:>10} {:>6} {:>9} {:>12} {:>10}",
            tier,
            limit_label(limits.message_quota),
            limits.call_quota,
            limits.call_duration_minutes,
            if limits.attachments_allowed { "yes" } else { "no" },
            nutrition
        );
    }
    Ok(())
}

fn print_snapshot(snapshot: &QuotaSnapshot, format: &str) -> Result<()> {
    if print_structured(snapshot, format)? {
        return Ok(());
    }
    println!("User:        {}", snapshot.user_id);
    println!("Tier:        {}", snapshot.tier);
    println!("Messages:    {} / {}", snapshot.usage.messages_used, limit_label(snapshot.limits.message_quota));
    println!("Calls:       {} / {}", snapshot.usage.calls_used, snapshot.limits.call_quota);
    println!(
        "Attachments: {} ({})",
        snapshot.usage.attachments_used,
        if snapshot.limits.attachments_allowed { "allowed" } else { "not allowed" }
    );
    println!("Resets at:   {}", snapshot.usage.reset_at.to_rfc3339());
    Ok(())
}

fn print_evaluation(evaluation: &QuotaEvaluation, format: &str) -> Result<()> {
    if print_structured(evaluation, format)? {
        return Ok(());
    }
    println!("Allowed:   {}", if evaluation.allowed { "✅ yes" } else { "❌ no" });
    println!("Remaining: {}", remaining_label(evaluation.remaining));
    if let Some(pct) = evaluation.usage_percent {
        println!("Usage:     {:.0}%{}", pct * 100.0, if evaluation.warning { " ⚠️" } else { "" });
    }
    if let Some(reason) = &evaluation.reason {
        println!("Reason:    {}", reason);
    }
    Ok(())
}

fn print_upgrade(upgrade: &UpgradeRequired, format: &str) -> Result<()> {
    if print_structured(upgrade, format)? {
        return Ok(());
    }
    println!("Allowed:       ❌ no");
    println!("Reason:        {}", upgrade.reason);
    println!("Current tier:  {}", upgrade.current_tier);
    match upgrade.required_tier {
        Some(tier) => println!("Required tier: {}", tier),
        None => println!("Required tier: none (limit reached on every tier)"),
    }
    Ok(())
}

fn print_nutrition(payload: &NutritionPayload, format: &str) -> Result<()> {
    if print_structured(payload, format)? {
        return Ok(());
    }
    let status = &payload.status;
    println!("Can access:  {}", if status.can_access { "✅ yes" } else { "❌ no" });
    println!("Expired:     {}", status.is_expired);
    println!("Locked:      {}", status.is_locked);
    if let (Some(days), Some(hours)) = (status.days_remaining, status.hours_remaining) {
        println!("Remaining:   {} days ({} hours)", days, hours);
    }
    if let Some(generated_at) = payload.plan.generated_at {
        println!("Generated:   {}", generated_at.to_rfc3339());
    }
    if let Some(expires_at) = payload.plan.expires_at {
        println!("Expires:     {}", expires_at.to_rfc3339());
    }
    if let Some(message) = &status.message {
        println!("Message:     {}", message);
    }
    Ok(())
}

fn print_nutrition_stats(stats: &[NutritionAccessStats], format: &str) -> Result<()> {
    if print_structured(&stats, format)? {
        return Ok(());
    }
    println!("{:<14} {:>8} {:>9} {:>8} {:>8}", "TIER", "USERS", "UNLOCKED", "ACTIVE", "EXPIRED");
    for entry in stats {
        println!(
            "{:<14} {:>8} {:>9} {:>8} {:>8}",
            entry.tier, entry.total_users, entry.unlocked, entry.active_windows, entry.expired_windows
        );
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let client = EntitlementClient::new(cli.endpoint)?;
    let format = cli.format.as_str();

    match cli.command {
        Commands::Health => {
            let health: serde_json::Value = client.get("/v1/health").await?;
            if !print_structured(&health, format)? {
                println!("{}", health["status"].as_str().unwrap_or("unknown"));
            }
        }
        Commands::Tiers => {
            let table: TierLimitTable = client.get("/v1/tiers").await?;
            print_tiers(&table, format)?;
        }
        Commands::Quota { action } => match action {
            QuotaCommands::Show { user_id } => {
                let snapshot: QuotaSnapshot = client.get(&format!("/v1/quota/{}", user_id)).await?;
                print_snapshot(&snapshot, format)?;
            }
            QuotaCommands::Check { user_id, action } => {
                let evaluation: QuotaEvaluation = client.post("/v1/quota/check", &QuotaRequest { user_id, action }).await?;
                print_evaluation(&evaluation, format)?;
            }
            QuotaCommands::Consume { user_id, action } => {
                let response = client.post_raw("/v1/quota/consume", &QuotaRequest { user_id, action }).await?;
                if response.status() == StatusCode::PAYMENT_REQUIRED {
                    let upgrade: UpgradeRequired = response.json().await.context("Failed to decode denial")?;
                    print_upgrade(&upgrade, format)?;
                } else {
                    let evaluation: QuotaEvaluation = decode(response).await?;
                    print_evaluation(&evaluation, format)?;
                }
            }
        },
        Commands::Nutrition { action } => {
            let payload: NutritionPayload = match action {
                NutritionCommands::Show { user_id } => client.get(&format!("/v1/nutrition/access/{}", user_id)).await?,
                NutritionCommands::Regenerate { user_id, tier } => {
                    client
                        .post("/v1/nutrition/access/regenerate", &RegenerateRequest { user_id, tier })
                        .await?
                }
                NutritionCommands::Unlock { user_id } => {
                    client.post("/v1/nutrition/access/unlock", &UserRequest { user_id }).await?
                }
                NutritionCommands::Extend { user_id, days } => {
                    client
                        .post("/v1/nutrition/access/extend", &ExtendRequest { user_id, days })
                        .await?
                }
                NutritionCommands::Revoke { user_id } => {
                    client.post("/v1/nutrition/access/revoke", &UserRequest { user_id }).await?
                }
                NutritionCommands::Stats => {
                    let stats: Vec<NutritionAccessStats> = client.get("/v1/nutrition/stats").await?;
                    return print_nutrition_stats(&stats, format);
                }
            };
            print_nutrition(&payload, format)?;
        }
        Commands::SetTier { user_id, tier, plan_code } => {
            let event = EntitlementEvent::TierChanged { user_id, tier, plan_code };
            let snapshot: QuotaSnapshot = client.post("/v1/events", &event).await?;
            print_snapshot(&snapshot, format)?;
        }
    }

    Ok(())
}
