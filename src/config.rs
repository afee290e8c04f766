//! Configuration loading from TOML with environment variable resolution.
//!
//! Reads `config.toml` and deserializes into strongly-typed structs.
//! Secrets (bookmaker credentials) are referenced by env-var name in the
//! config and resolved at runtime via `std::env::var`.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;

use crate::engine::executor::ExecutorConfig;
use crate::engine::pool::PoolConfig;
use crate::strategy::arbitrage::{ScanFilters, ScannerConfig};
use crate::strategy::kelly::KellyConfig;
use crate::strategy::risk::RiskLimits;
use crate::types::{Opportunity, RiskLevel, SurebetError};

/// Top-level application configuration.
#[derive(Debug, Deserialize, Clone)]
pub struct AppConfig {
    pub agent: AgentConfig,
    pub automation: AutomationConfig,
    pub risk: RiskConfig,
    #[serde(default)]
    pub scanner: ScannerConfig,
    #[serde(default)]
    pub pool: PoolConfig,
    #[serde(default)]
    pub executor: ExecutorConfig,
    #[serde(default)]
    pub bookmakers: Vec<BookmakerConfig>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct AgentConfig {
    pub name: String,
    pub initial_bankroll: f64,
    pub currency: String,
    /// Where the risk state snapshot is persisted.
    #[serde(default)]
    pub state_file: Option<String>,
}

// ---------------------------------------------------------------------------
// Automation
// ---------------------------------------------------------------------------

/// Runtime automation settings. Read-only to the engine; an owner may
/// publish a new version through the engine's watch channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AutomationConfig {
    pub enabled: bool,
    /// Minimum profit margin in percent.
    pub min_margin: f64,
    pub max_stake_per_bet: f64,
    pub max_total_stake: f64,
    pub min_confidence: f64,
    /// Empty = every sport.
    pub allowed_sports: Vec<String>,
    /// Empty = every bookmaker.
    pub allowed_bookmakers: Vec<String>,
    pub risk_level: RiskLevel,
    /// Opportunities at or below this margin (percent) execute without review.
    pub auto_approve_below: f64,
    /// Minimum time between executions, in milliseconds.
    pub cooldown_period: u64,
    /// Delay between ticks, in milliseconds.
    pub tick_interval_ms: u64,
    /// Delay after a failed tick, in milliseconds.
    pub error_backoff_ms: u64,
}

impl Default for AutomationConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            min_margin: 1.0,
            max_stake_per_bet: 500.0,
            max_total_stake: 1000.0,
            min_confidence: 0.8,
            allowed_sports: Vec::new(),
            allowed_bookmakers: Vec::new(),
            risk_level: RiskLevel::Moderate,
            auto_approve_below: 3.0,
            cooldown_period: 30_000,
            tick_interval_ms: 5_000,
            error_backoff_ms: 30_000,
        }
    }
}

impl AutomationConfig {
    /// Reject nonsensical settings before the engine starts.
    pub fn validate(&self) -> Result<(), SurebetError> {
        if !(self.min_margin.is_finite() && self.min_margin >= 0.0) {
            return Err(SurebetError::Config(format!(
                "min_margin must be >= 0, got {}",
                self.min_margin
            )));
        }
        if !(0.0..=1.0).contains(&self.min_confidence) {
            return Err(SurebetError::Config(format!(
                "min_confidence must be within 0..=1, got {}",
                self.min_confidence
            )));
        }
        if self.max_stake_per_bet <= 0.0 || self.max_total_stake <= 0.0 {
            return Err(SurebetError::Config(
                "stake limits must be positive".to_string(),
            ));
        }
        if self.max_stake_per_bet > self.max_total_stake {
            return Err(SurebetError::Config(format!(
                "max_stake_per_bet ({}) exceeds max_total_stake ({})",
                self.max_stake_per_bet, self.max_total_stake
            )));
        }
        Ok(())
    }

    /// Scan filters equivalent to this config.
    pub fn filters(&self) -> ScanFilters {
        ScanFilters {
            min_margin: self.min_margin,
            min_confidence: self.min_confidence,
            allowed_sports: self.allowed_sports.clone(),
            allowed_bookmakers: self.allowed_bookmakers.clone(),
        }
    }

    /// Why an opportunity is filtered out, or `None` if it passes.
    pub fn rejection(&self, opp: &Opportunity, now: DateTime<Utc>) -> Option<SurebetError> {
        let filters = self.filters();
        if opp.is_expired(now) {
            return Some(SurebetError::StaleOpportunity {
                opportunity_id: opp.id,
                reason: "expired".to_string(),
            });
        }
        if opp.profit_margin < self.min_margin {
            return Some(SurebetError::Config(format!(
                "margin {:.2}% below {:.2}%",
                opp.profit_margin, self.min_margin
            )));
        }
        if opp.confidence < self.min_confidence {
            return Some(SurebetError::Config(format!(
                "confidence {:.2} below {:.2}",
                opp.confidence, self.min_confidence
            )));
        }
        if !filters.allows_sport(&opp.sport) {
            return Some(SurebetError::Config(format!("sport {} not allowed", opp.sport)));
        }
        if let Some(leg) = opp.legs.iter().find(|l| !filters.allows_bookmaker(&l.bookmaker)) {
            return Some(SurebetError::Config(format!(
                "bookmaker {} not allowed",
                leg.bookmaker
            )));
        }
        None
    }

    /// `base` with this config's risk tier and stake caps.
    pub fn overlay(&self, base: &RiskLimits) -> RiskLimits {
        RiskLimits {
            risk_level: self.risk_level,
            max_stake_per_bet: self.max_stake_per_bet,
            max_total_stake: self.max_total_stake,
            ..base.clone()
        }
    }

    /// Whether the opportunity can skip manual review.
    pub fn auto_approves(&self, opp: &Opportunity) -> bool {
        opp.profit_margin <= self.auto_approve_below && opp.is_auto_executable()
    }
}

// ---------------------------------------------------------------------------
// Risk
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct RiskConfig {
    pub min_bankroll: f64,
    pub daily_limit: f64,
    pub weekly_limit: f64,
    pub monthly_limit: f64,
    #[serde(default = "default_daily_volume_pct")]
    pub daily_volume_pct: f64,
    #[serde(default = "default_max_sane_margin")]
    pub max_sane_margin: f64,
    #[serde(default = "default_rule_min_confidence")]
    pub min_confidence: f64,
    #[serde(default = "default_min_expiry")]
    pub min_time_to_expiry_secs: i64,
    #[serde(default = "default_warn_expiry")]
    pub warn_time_to_expiry_secs: i64,
    #[serde(default)]
    pub kelly: KellyConfig,
}

fn default_daily_volume_pct() -> f64 {
    0.20
}

fn default_max_sane_margin() -> f64 {
    10.0
}

fn default_rule_min_confidence() -> f64 {
    0.7
}

fn default_min_expiry() -> i64 {
    120
}

fn default_warn_expiry() -> i64 {
    300
}

// ---------------------------------------------------------------------------
// Bookmakers
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BookmakerKind {
    Paper,
    Betfair,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BookmakerConfig {
    pub name: String,
    pub kind: BookmakerKind,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_requests_per_minute")]
    pub requests_per_minute: u32,
    /// Per-call timeout in milliseconds.
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    /// Paper: JSON file of games to serve.
    #[serde(default)]
    pub fixtures: Option<String>,
    /// Paper: opening balance.
    #[serde(default)]
    pub starting_balance: Option<f64>,
    #[serde(default)]
    pub currency: Option<String>,
    /// Betfair: env var holding the application key.
    #[serde(default)]
    pub app_key_env: Option<String>,
    #[serde(default)]
    pub username_env: Option<String>,
    #[serde(default)]
    pub password_env: Option<String>,
}

fn default_true() -> bool {
    true
}

fn default_requests_per_minute() -> u32 {
    60
}

fn default_timeout_ms() -> u64 {
    10_000
}

impl AppConfig {
    /// Load configuration from a TOML file.
    pub fn load(path: &str) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {path}"))?;
        Self::parse(&contents).with_context(|| format!("Failed to parse config file: {path}"))
    }

    /// Parse configuration from TOML text.
    pub fn parse(contents: &str) -> Result<Self> {
        let config: AppConfig = toml::from_str(contents)?;
        config.automation.validate()?;
        Ok(config)
    }

    /// Resolve an environment variable name to its value.
    /// Useful for loading secrets referenced in the config.
    pub fn resolve_env(env_name: &str) -> Result<String> {
        std::env::var(env_name)
            .with_context(|| format!("Environment variable not set: {env_name}"))
    }

    /// Risk limits for the baseline rules: tier and stake caps come from
    /// the automation settings, the rest from `[risk]`.
    pub fn risk_limits(&self) -> RiskLimits {
        self.automation.overlay(&RiskLimits {
            daily_volume_pct: self.risk.daily_volume_pct,
            max_sane_margin: self.risk.max_sane_margin,
            min_confidence: self.risk.min_confidence,
            min_time_to_expiry_secs: self.risk.min_time_to_expiry_secs,
            warn_time_to_expiry_secs: self.risk.warn_time_to_expiry_secs,
            kelly: self.risk.kelly.clone(),
            ..RiskLimits::default()
        })
    }
}
