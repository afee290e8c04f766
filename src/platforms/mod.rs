//! Bookmaker integrations.
//!
//! Defines the `BookmakerGateway` trait and provides implementations for:
//! - Betfair Exchange (REST) — real-money execution
//! - Paper — deterministic in-memory bookmaker for dry runs and tests
//!
//! Every gateway built from config is wrapped in `throttle::Throttled`,
//! which enforces the per-bookmaker rate limit and call timeouts.

pub mod betfair;
pub mod paper;
pub mod throttle;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use crate::config::{BookmakerConfig, BookmakerKind};
use betfair::BetfairGateway;
use paper::PaperGateway;
use throttle::Throttled;

// ---------------------------------------------------------------------------
// Wire-level types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccountInfo {
    pub balance: Decimal,
    pub currency: String,
    pub withdrawable_balance: Decimal,
    pub last_updated: DateTime<Utc>,
}

/// One priced selection of a game.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GameMarket {
    pub id: String,
    /// Selection name: a team, "Draw", or a runner
    pub name: String,
    /// American odds
    pub odds: f64,
    pub available: bool,
    pub min_stake: Option<f64>,
    pub max_stake: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Game {
    pub id: String,
    pub sport: String,
    pub home_team: String,
    pub away_team: String,
    pub start_time: DateTime<Utc>,
    pub markets: Vec<GameMarket>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BetRequest {
    pub game_id: String,
    pub market_id: String,
    pub selection: String,
    /// American odds requested
    pub odds: f64,
    /// Rounded to cents
    pub stake: Decimal,
    /// Client reference, unique per leg
    pub reference: String,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct BetResponse {
    pub success: bool,
    pub bet_id: Option<String>,
    pub transaction_id: Option<String>,
    pub actual_odds: Option<f64>,
    pub actual_stake: Option<Decimal>,
    pub error: Option<String>,
    pub error_code: Option<String>,
}

impl BetResponse {
    /// A rejected placement.
    pub fn rejected(code: &str, message: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(message.into()),
            error_code: Some(code.to_string()),
            ..Default::default()
        }
    }
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Failures at the bookmaker boundary.
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("{op} timed out after {after:?}")]
    Timeout { op: String, after: Duration },

    #[error("rate limited")]
    RateLimited,

    #[error("authentication failed: {0}")]
    Auth(String),

    #[error("network error: {0}")]
    Network(String),

    #[error("rejected ({code}): {message}")]
    Rejected { code: String, message: String },

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl GatewayError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, GatewayError::Timeout { .. })
    }

    /// Short code recorded on failed legs.
    pub fn code(&self) -> &str {
        match self {
            GatewayError::Timeout { .. } => "TIMEOUT",
            GatewayError::RateLimited => "RATE_LIMITED",
            GatewayError::Auth(_) => "AUTH",
            GatewayError::Network(_) => "NETWORK",
            GatewayError::Rejected { code, .. } => code.as_str(),
            GatewayError::Other(_) => "ERROR",
        }
    }
}

impl From<reqwest::Error> for GatewayError {
    fn from(e: reqwest::Error) -> Self {
        if e.status() == Some(reqwest::StatusCode::TOO_MANY_REQUESTS) {
            GatewayError::RateLimited
        } else {
            GatewayError::Network(e.to_string())
        }
    }
}

// ---------------------------------------------------------------------------
// Gateway contract
// ---------------------------------------------------------------------------

/// Abstraction over a bookmaker account.
///
/// This is the entire surface the engine depends on. Implementors do not
/// rate-limit themselves; `Throttled` does that for them.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait BookmakerGateway: Send + Sync {
    /// Bookmaker name for logging and registry lookup.
    fn name(&self) -> String;

    async fn authenticate(&self) -> Result<bool, GatewayError>;

    async fn get_account_info(&self) -> Result<AccountInfo, GatewayError>;

    /// Upcoming games, optionally restricted to one sport.
    async fn get_games(&self, sport: Option<String>) -> Result<Vec<Game>, GatewayError>;

    async fn place_bet(&self, request: &BetRequest) -> Result<BetResponse, GatewayError>;

    /// Returns false when the bookmaker refused to cancel.
    async fn cancel_bet(&self, bet_id: &str) -> Result<bool, GatewayError>;

    async fn get_bet_status(&self, bet_id: &str) -> Result<String, GatewayError>;
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

/// Gateways keyed by bookmaker name.
#[derive(Clone, Default)]
pub struct GatewayRegistry {
    gateways: BTreeMap<String, Arc<dyn BookmakerGateway>>,
}

impl std::fmt::Debug for GatewayRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.gateways.keys()).finish()
    }
}

impl GatewayRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a gateway under its own name, replacing any previous one.
    pub fn insert(&mut self, gateway: Arc<dyn BookmakerGateway>) {
        self.gateways.insert(gateway.name(), gateway);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn BookmakerGateway>> {
        self.gateways.get(name).cloned()
    }

    pub fn names(&self) -> Vec<String> {
        self.gateways.keys().cloned().collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Arc<dyn BookmakerGateway>)> {
        self.gateways.iter()
    }

    pub fn len(&self) -> usize {
        self.gateways.len()
    }

    pub fn is_empty(&self) -> bool {
        self.gateways.is_empty()
    }

    /// Build every enabled bookmaker from config, each behind its own
    /// rate limiter and timeout.
    pub fn from_config(configs: &[BookmakerConfig]) -> anyhow::Result<Self> {
        let mut registry = Self::new();
        for cfg in configs.iter().filter(|c| c.enabled) {
            let timeout = Duration::from_millis(cfg.timeout_ms);
            let gateway: Arc<dyn BookmakerGateway> = match cfg.kind {
                BookmakerKind::Paper => {
                    let paper = PaperGateway::from_config(cfg)
                        .with_context(|| format!("Failed to build paper bookmaker {}", cfg.name))?;
                    Arc::new(Throttled::new(paper, cfg.requests_per_minute, timeout))
                }
                BookmakerKind::Betfair => {
                    let betfair = BetfairGateway::from_config(cfg)
                        .with_context(|| format!("Failed to build Betfair bookmaker {}", cfg.name))?;
                    Arc::new(Throttled::new(betfair, cfg.requests_per_minute, timeout))
                }
            };
            info!(
                bookmaker = %cfg.name,
                kind = ?cfg.kind,
                rpm = cfg.requests_per_minute,
                timeout_ms = cfg.timeout_ms,
                "Bookmaker registered"
            );
            registry.insert(gateway);
        }
        Ok(registry)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
