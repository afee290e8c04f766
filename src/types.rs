//! Shared types for the SUREBET engine.
//!
//! These types form the data model used across all modules.
//! They are designed to be stable so that platform, strategy,
//! and engine modules can depend on them without circular references.

use chrono::{DateTime, Datelike, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, VecDeque};
use std::fmt;
use uuid::Uuid;

use crate::platforms::GatewayError;

/// Outcome label used for the draw/tie result of a fixture.
pub const DRAW_OUTCOME: &str = "draw";

/// Number of settled bets kept in the rolling history.
pub const SETTLED_HISTORY_LEN: usize = 200;

// ---------------------------------------------------------------------------
// Quotes & market snapshots
// ---------------------------------------------------------------------------

/// A single bookmaker price for one outcome of a market.
///
/// Quotes are fed in by the data source and never mutated by the engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Quote {
    pub bookmaker: String,
    /// Normalised outcome label: "home" | "away" | "draw" | runner name
    pub outcome: String,
    pub american_odds: f64,
    /// Bookmaker-side game identifier (needed to place the bet)
    pub game_id: String,
    /// Bookmaker-side market identifier
    pub market_id: String,
    /// Bookmaker-side selection identifier
    pub selection: String,
    pub min_stake: Option<f64>,
    pub max_stake: Option<f64>,
    /// When the data source observed this price
    pub timestamp: DateTime<Utc>,
}

impl fmt::Display for Quote {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}] {} {:+.0}",
            self.bookmaker, self.outcome, self.american_odds,
        )
    }
}

impl Quote {
    /// Age of the quote relative to `now`.
    pub fn age(&self, now: DateTime<Utc>) -> chrono::Duration {
        now - self.timestamp
    }
}

/// All quotes for one fixture/market across bookmakers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarketSnapshot {
    /// Engine-side market identity (shared across bookmakers)
    pub market_id: String,
    pub sport: String,
    pub event_name: String,
    pub start_time: DateTime<Utc>,
    /// Whether the outcome space of this fixture can end in a draw/tie
    pub allows_draw: bool,
    pub quotes: Vec<Quote>,
}

impl MarketSnapshot {
    /// Distinct outcome labels quoted in this market, sorted.
    pub fn outcomes(&self) -> Vec<String> {
        self.quotes
            .iter()
            .map(|q| q.outcome.clone())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }

    /// Distinct bookmakers quoting this market, sorted.
    pub fn bookmakers(&self) -> Vec<String> {
        self.quotes
            .iter()
            .map(|q| q.bookmaker.clone())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }

    /// Whether any bookmaker quotes the draw outcome.
    pub fn has_draw_quote(&self) -> bool {
        self.quotes.iter().any(|q| q.outcome == DRAW_OUTCOME)
    }
}

// ---------------------------------------------------------------------------
// Opportunities
// ---------------------------------------------------------------------------

/// Reason an opportunity must not be executed automatically.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OpportunityWarning {
    /// The fixture can end in a draw that no leg covers.
    DrawRisk,
    /// The legs do not cover every quoted outcome of the market.
    PartialCoverage,
}

impl fmt::Display for OpportunityWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OpportunityWarning::DrawRisk => write!(f, "draw risk"),
            OpportunityWarning::PartialCoverage => write!(f, "partial coverage"),
        }
    }
}

/// One leg of an opportunity: the chosen bookmaker and price for an outcome.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpportunityLeg {
    pub bookmaker: String,
    pub outcome: String,
    pub american_odds: f64,
    pub decimal_odds: f64,
    pub game_id: String,
    pub market_id: String,
    pub selection: String,
    pub min_stake: Option<f64>,
    pub max_stake: Option<f64>,
}

/// A scored cross-bookmaker arbitrage. Immutable once created.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Opportunity {
    pub id: Uuid,
    pub market_id: String,
    pub sport: String,
    pub event_name: String,
    pub legs: Vec<OpportunityLeg>,
    /// Guaranteed return in percent, `(1 - T) / T * 100`
    pub profit_margin: f64,
    /// 0.0–1.0, lower when quotes are old or the margin looks implausible
    pub confidence: f64,
    pub score: f64,
    /// Stake used when scoring
    pub reference_stake: f64,
    /// Guaranteed profit at `reference_stake`
    pub guaranteed_profit: f64,
    /// Largest total stake the quoted per-leg limits allow
    pub max_total_stake: Option<f64>,
    pub warnings: Vec<OpportunityWarning>,
    pub detected_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl fmt::Display for Opportunity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let legs: Vec<String> = self
            .legs
            .iter()
            .map(|l| format!("{}@{} {:+.0}", l.outcome, l.bookmaker, l.american_odds))
            .collect();
        write!(
            f,
            "[{}] {} | {} | margin={:.2}% conf={:.0}% score={:.1}",
            self.sport,
            self.event_name,
            legs.join(" / "),
            self.profit_margin,
            self.confidence * 100.0,
            self.score,
        )
    }
}

impl Opportunity {
    /// Time left until the opportunity expires (negative once expired).
    pub fn time_to_expiry(&self, now: DateTime<Utc>) -> chrono::Duration {
        self.expires_at - now
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }

    /// Whether the opportunity may be handed to the executor without review.
    pub fn is_auto_executable(&self) -> bool {
        self.warnings.is_empty()
    }

    /// Bookmakers used by the legs, in leg order.
    pub fn bookmakers(&self) -> Vec<&str> {
        self.legs.iter().map(|l| l.bookmaker.as_str()).collect()
    }

    pub fn american_odds(&self) -> Vec<f64> {
        self.legs.iter().map(|l| l.american_odds).collect()
    }

    pub fn decimal_odds(&self) -> Vec<f64> {
        self.legs.iter().map(|l| l.decimal_odds).collect()
    }

    /// Stable identity of the priced combination, used to de-duplicate
    /// signals across scans (a rescan produces a fresh `id`).
    pub fn combination_key(&self) -> String {
        let legs: Vec<String> = self
            .legs
            .iter()
            .map(|l| format!("{}:{}:{}", l.outcome, l.bookmaker, l.american_odds))
            .collect();
        format!("{}|{}", self.market_id, legs.join("|"))
    }
}

/// Stake per leg derived from an opportunity by the stake solver.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StakeAllocation {
    pub stakes: Vec<f64>,
    pub payouts: Vec<f64>,
    pub total_stake: f64,
    pub guaranteed_profit: f64,
    pub profit_margin: f64,
}

impl StakeAllocation {
    /// Scale every leg proportionally so the stakes sum to `new_total`.
    /// Margin is scale-invariant, profit and payouts scale linearly.
    pub fn scaled_to(&self, new_total: f64) -> StakeAllocation {
        if self.total_stake <= 0.0 {
            return self.clone();
        }
        let factor = new_total / self.total_stake;
        StakeAllocation {
            stakes: self.stakes.iter().map(|s| s * factor).collect(),
            payouts: self.payouts.iter().map(|p| p * factor).collect(),
            total_stake: new_total,
            guaranteed_profit: self.guaranteed_profit * factor,
            profit_margin: self.profit_margin,
        }
    }

    /// Largest single leg stake.
    pub fn max_leg_stake(&self) -> f64 {
        self.stakes.iter().copied().fold(0.0, f64::max)
    }
}

// ---------------------------------------------------------------------------
// Bet placement lifecycle
// ---------------------------------------------------------------------------

/// Lifecycle of a single leg: `pending → placed → (settled|cancelled|failed)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BetStatus {
    Pending,
    Placed,
    Settled,
    Cancelled,
    Failed,
}

impl BetStatus {
    /// Whether moving from `self` to `next` is a legal lifecycle step.
    pub fn can_transition_to(&self, next: BetStatus) -> bool {
        matches!(
            (self, next),
            (BetStatus::Pending, BetStatus::Placed)
                | (BetStatus::Pending, BetStatus::Failed)
                | (BetStatus::Placed, BetStatus::Settled)
                | (BetStatus::Placed, BetStatus::Cancelled)
                | (BetStatus::Placed, BetStatus::Failed)
        )
    }
}

impl fmt::Display for BetStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BetStatus::Pending => write!(f, "pending"),
            BetStatus::Placed => write!(f, "placed"),
            BetStatus::Settled => write!(f, "settled"),
            BetStatus::Cancelled => write!(f, "cancelled"),
            BetStatus::Failed => write!(f, "failed"),
        }
    }
}

/// One leg's lifecycle record, owned by the executor during an attempt
/// and handed back to the caller for persistence.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BetPlacement {
    pub id: Uuid,
    pub opportunity_id: Uuid,
    pub bookmaker: String,
    pub outcome: String,
    pub game_id: String,
    pub market_id: String,
    pub selection: String,
    pub requested_odds: f64,
    pub requested_stake: f64,
    pub status: BetStatus,
    pub bet_id: Option<String>,
    pub transaction_id: Option<String>,
    pub actual_odds: Option<f64>,
    pub actual_stake: Option<f64>,
    pub error: Option<String>,
    pub error_code: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl fmt::Display for BetPlacement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}] {} ${:.2} @ {:+.0} ({}{})",
            self.bookmaker,
            self.outcome,
            self.requested_stake,
            self.requested_odds,
            self.status,
            self.bet_id
                .as_deref()
                .map(|id| format!(" #{id}"))
                .unwrap_or_default(),
        )
    }
}

impl BetPlacement {
    /// A fresh pending record for one leg.
    pub fn pending(opportunity_id: Uuid, leg: &OpportunityLeg, stake: f64) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            opportunity_id,
            bookmaker: leg.bookmaker.clone(),
            outcome: leg.outcome.clone(),
            game_id: leg.game_id.clone(),
            market_id: leg.market_id.clone(),
            selection: leg.selection.clone(),
            requested_odds: leg.american_odds,
            requested_stake: stake,
            status: BetStatus::Pending,
            bet_id: None,
            transaction_id: None,
            actual_odds: None,
            actual_stake: None,
            error: None,
            error_code: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Apply a lifecycle step. Returns false (and leaves the record
    /// unchanged) when the step is not legal from the current status.
    pub fn transition(&mut self, next: BetStatus) -> bool {
        if !self.status.can_transition_to(next) {
            return false;
        }
        self.status = next;
        self.updated_at = Utc::now();
        true
    }

    pub fn is_placed(&self) -> bool {
        self.status == BetStatus::Placed
    }

    /// Stake actually accepted by the bookmaker, falling back to the request.
    pub fn effective_stake(&self) -> f64 {
        self.actual_stake.unwrap_or(self.requested_stake)
    }

    /// American odds actually obtained, falling back to the request.
    pub fn effective_odds(&self) -> f64 {
        self.actual_odds.unwrap_or(self.requested_odds)
    }
}

// ---------------------------------------------------------------------------
// Risk state
// ---------------------------------------------------------------------------

/// Configured risk tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum RiskLevel {
    Conservative,
    #[default]
    Moderate,
    Aggressive,
}

impl RiskLevel {
    /// Maximum fraction of bankroll committed to a single opportunity.
    pub fn bankroll_fraction(&self) -> f64 {
        match self {
            RiskLevel::Conservative => 0.02,
            RiskLevel::Moderate => 0.05,
            RiskLevel::Aggressive => 0.10,
        }
    }

    /// Consecutive losses that trip the circuit breaker.
    pub fn loss_streak_limit(&self) -> u32 {
        match self {
            RiskLevel::Conservative => 3,
            RiskLevel::Moderate => 5,
            RiskLevel::Aggressive => 7,
        }
    }
}

impl fmt::Display for RiskLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RiskLevel::Conservative => write!(f, "conservative"),
            RiskLevel::Moderate => write!(f, "moderate"),
            RiskLevel::Aggressive => write!(f, "aggressive"),
        }
    }
}

impl std::str::FromStr for RiskLevel {
    type Err = SurebetError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "conservative" => Ok(RiskLevel::Conservative),
            "moderate" => Ok(RiskLevel::Moderate),
            "aggressive" => Ok(RiskLevel::Aggressive),
            _ => Err(SurebetError::Config(format!("Unknown risk level: {s}"))),
        }
    }
}

/// A settled bet, kept for loss-streak and Kelly calculations.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SettledBet {
    pub stake: f64,
    pub decimal_odds: f64,
    pub profit: f64,
    pub settled_at: DateTime<Utc>,
}

impl SettledBet {
    pub fn won(&self) -> bool {
        self.profit > 0.0
    }
}

/// Bankroll and usage counters. Owned by the accountant; the risk
/// manager only ever sees snapshots.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskState {
    pub daily_used: f64,
    pub daily_limit: f64,
    pub weekly_used: f64,
    pub weekly_limit: f64,
    pub monthly_used: f64,
    pub monthly_limit: f64,
    pub consecutive_losses: u32,
    pub current_bankroll: f64,
    pub min_bankroll: f64,
    pub peak_bankroll: f64,
    pub executions: u64,
    pub compensations: u64,
    pub total_profit: f64,
    /// Last time the usage windows were rolled
    pub window_anchor: DateTime<Utc>,
    pub history: VecDeque<SettledBet>,
}

impl fmt::Display for RiskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "bankroll=${:.2} | day ${:.2}/${:.2} | week ${:.2}/${:.2} | month ${:.2}/${:.2} | losses={} | executions={} compensations={}",
            self.current_bankroll,
            self.daily_used,
            self.daily_limit,
            self.weekly_used,
            self.weekly_limit,
            self.monthly_used,
            self.monthly_limit,
            self.consecutive_losses,
            self.executions,
            self.compensations,
        )
    }
}

impl RiskState {
    /// Fresh state for a bankroll with the given usage limits.
    pub fn new(
        bankroll: f64,
        min_bankroll: f64,
        daily_limit: f64,
        weekly_limit: f64,
        monthly_limit: f64,
    ) -> Self {
        Self {
            daily_used: 0.0,
            daily_limit,
            weekly_used: 0.0,
            weekly_limit,
            monthly_used: 0.0,
            monthly_limit,
            consecutive_losses: 0,
            current_bankroll: bankroll,
            min_bankroll,
            peak_bankroll: bankroll,
            executions: 0,
            compensations: 0,
            total_profit: 0.0,
            window_anchor: Utc::now(),
            history: VecDeque::new(),
        }
    }

    /// Reset usage counters whose calendar window has rolled over.
    pub fn roll_windows(&mut self, now: DateTime<Utc>) {
        let prev = self.window_anchor;
        if now.date_naive() != prev.date_naive() {
            self.daily_used = 0.0;
        }
        if now.iso_week() != prev.iso_week() {
            self.weekly_used = 0.0;
        }
        if (now.year(), now.month()) != (prev.year(), prev.month()) {
            self.monthly_used = 0.0;
        }
        self.window_anchor = now;
    }

    /// Commit stake against every usage window.
    pub fn record_usage(&mut self, amount: f64) {
        self.daily_used += amount;
        self.weekly_used += amount;
        self.monthly_used += amount;
    }

    /// Smallest headroom left across the daily/weekly/monthly limits.
    pub fn remaining_usage(&self) -> f64 {
        (self.daily_limit - self.daily_used)
            .min(self.weekly_limit - self.weekly_used)
            .min(self.monthly_limit - self.monthly_used)
            .max(0.0)
    }

    /// Record a settled bet: bankroll, loss streak, history.
    pub fn record_settlement(&mut self, bet: SettledBet) {
        self.current_bankroll += bet.profit;
        self.total_profit += bet.profit;
        if bet.won() {
            self.consecutive_losses = 0;
        } else if bet.profit < 0.0 {
            self.consecutive_losses += 1;
        }
        if self.current_bankroll > self.peak_bankroll {
            self.peak_bankroll = self.current_bankroll;
        }
        self.history.push_back(bet);
        while self.history.len() > SETTLED_HISTORY_LEN {
            self.history.pop_front();
        }
    }

    /// Current drawdown from peak as a fraction (0.0 = at peak).
    pub fn drawdown(&self) -> f64 {
        if self.peak_bankroll <= 0.0 {
            0.0
        } else {
            1.0 - (self.current_bankroll / self.peak_bankroll)
        }
    }
}

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

/// Domain-specific error types for SUREBET.
#[derive(Debug, thiserror::Error)]
pub enum SurebetError {
    #[error("Invalid odds: {0}")]
    InvalidOdds(String),

    #[error("Risk rejected (score {risk_score:.0}): {reason}")]
    RiskRejected { reason: String, risk_score: f64 },

    #[error("Stale opportunity {opportunity_id}: {reason}")]
    StaleOpportunity { opportunity_id: Uuid, reason: String },

    #[error("Gateway error ({bookmaker}): {source}")]
    Gateway {
        bookmaker: String,
        #[source]
        source: GatewayError,
    },

    #[error("Manual intervention required for opportunity {opportunity_id}: {reason}")]
    ManualInterventionRequired {
        opportunity_id: Uuid,
        reason: String,
        legs: Vec<BetPlacement>,
    },

    #[error("Insufficient liquidity ({bookmaker}): stake ${stake:.2} outside limit ${limit:.2}")]
    InsufficientLiquidity {
        bookmaker: String,
        stake: f64,
        limit: f64,
    },

    #[error("Insufficient balance ({bookmaker}): need ${needed:.2}, have ${available:.2}")]
    InsufficientBalance {
        bookmaker: String,
        needed: f64,
        available: f64,
    },

    #[error("Unknown bookmaker: {0}")]
    UnknownBookmaker(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("A scan is already in progress")]
    ScanInProgress,

    #[error("Storage error: {0}")]
    Storage(String),
}

impl SurebetError {
    /// Whether this error leaves real, uncompensated exposure behind.
    pub fn needs_human(&self) -> bool {
        matches!(self, SurebetError::ManualInterventionRequired { .. })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
