//! Paper bookmaker.
//!
//! Deterministic in-memory gateway: fills at the requested odds, tracks
//! balance and open bets, and only fails when told to. Used for dry runs
//! and as the default test double.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use rust_decimal::prelude::*;
use rust_decimal_macros::dec;
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use tracing::{debug, info};
use uuid::Uuid;

use super::{AccountInfo, BetRequest, BetResponse, BookmakerGateway, Game, GatewayError};
use crate::config::BookmakerConfig;

const DEFAULT_BALANCE: Decimal = dec!(10000);

pub const STATUS_PLACED: &str = "placed";
pub const STATUS_CANCELLED: &str = "cancelled";
pub const STATUS_WON: &str = "won";
pub const STATUS_LOST: &str = "lost";

#[derive(Debug, Clone)]
pub struct PaperBet {
    pub request: BetRequest,
    pub status: &'static str,
}

#[derive(Debug, Default)]
struct PaperState {
    balance: Decimal,
    games: Vec<Game>,
    bets: HashMap<String, PaperBet>,
    next_bet: u64,
    fail_next_placements: usize,
    fail_cancellations: bool,
}

pub struct PaperGateway {
    name: String,
    currency: String,
    state: Mutex<PaperState>,
}

impl PaperGateway {
    pub fn new(name: impl Into<String>, balance: Decimal) -> Self {
        Self {
            name: name.into(),
            currency: "USD".to_string(),
            state: Mutex::new(PaperState {
                balance,
                ..Default::default()
            }),
        }
    }

    /// Build from a `kind = "paper"` bookmaker entry, loading fixtures if
    /// a file is configured.
    pub fn from_config(cfg: &BookmakerConfig) -> Result<Self> {
        let balance = cfg
            .starting_balance
            .and_then(Decimal::from_f64)
            .unwrap_or(DEFAULT_BALANCE);
        let mut gateway = Self::new(cfg.name.clone(), balance);
        if let Some(currency) = &cfg.currency {
            gateway.currency = currency.clone();
        }
        if let Some(path) = &cfg.fixtures {
            let json = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read fixtures {path}"))?;
            let games: Vec<Game> = serde_json::from_str(&json)
                .with_context(|| format!("Failed to parse fixtures {path}"))?;
            info!(bookmaker = %cfg.name, games = games.len(), "Paper fixtures loaded");
            gateway.set_games(games);
        }
        Ok(gateway)
    }

    pub fn with_games(self, games: Vec<Game>) -> Self {
        self.set_games(games);
        self
    }

    fn state(&self) -> MutexGuard<'_, PaperState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn set_games(&self, games: Vec<Game>) {
        self.state().games = games;
    }

    /// Reject the next `n` placements with `SIMULATED_FAILURE`.
    pub fn fail_next_placements(&self, n: usize) {
        self.state().fail_next_placements = n;
    }

    /// Refuse every cancellation while set.
    pub fn fail_cancellations(&self, fail: bool) {
        self.state().fail_cancellations = fail;
    }

    pub fn balance(&self) -> Decimal {
        self.state().balance
    }

    pub fn bets(&self) -> Vec<(String, PaperBet)> {
        let mut bets: Vec<_> = self
            .state()
            .bets
            .iter()
            .map(|(id, b)| (id.clone(), b.clone()))
            .collect();
        bets.sort_by(|a, b| a.0.cmp(&b.0));
        bets
    }

    /// Settle an open bet, crediting the payout if it won.
    pub fn settle(&self, bet_id: &str, won: bool) -> Result<(), GatewayError> {
        let mut state = self.state();
        let bet = state
            .bets
            .get_mut(bet_id)
            .ok_or_else(|| not_found(bet_id))?;
        if bet.status != STATUS_PLACED {
            return Err(GatewayError::Rejected {
                code: "BET_NOT_OPEN".to_string(),
                message: format!("{bet_id} is {}", bet.status),
            });
        }
        let payout = if won {
            let decimal = american_to_decimal(bet.request.odds);
            bet.request.stake * Decimal::from_f64(decimal).unwrap_or(Decimal::ONE)
        } else {
            Decimal::ZERO
        };
        bet.status = if won { STATUS_WON } else { STATUS_LOST };
        state.balance += payout.round_dp(2);
        Ok(())
    }

    /// Check a request against the loaded games. No games = accept all.
    fn check_market(state: &PaperState, request: &BetRequest) -> Option<BetResponse> {
        if state.games.is_empty() {
            return None;
        }
        let Some(game) = state.games.iter().find(|g| g.id == request.game_id) else {
            return Some(BetResponse::rejected("GAME_NOT_FOUND", format!("unknown game {}", request.game_id)));
        };
        let Some(market) = game.markets.iter().find(|m| m.id == request.market_id) else {
            return Some(BetResponse::rejected(
                "MARKET_NOT_FOUND",
                format!("unknown market {}", request.market_id),
            ));
        };
        if !market.available {
            return Some(BetResponse::rejected("MARKET_SUSPENDED", "market suspended"));
        }
        let stake = request.stake.to_f64().unwrap_or(0.0);
        if market.min_stake.is_some_and(|min| stake < min) || market.max_stake.is_some_and(|max| stake > max) {
            return Some(BetResponse::rejected(
                "STAKE_OUT_OF_RANGE",
                format!("stake {stake:.2} outside limits"),
            ));
        }
        None
    }
}

fn american_to_decimal(odds: f64) -> f64 {
    if odds > 0.0 {
        odds / 100.0 + 1.0
    } else if odds < 0.0 {
        100.0 / odds.abs() + 1.0
    } else {
        1.0
    }
}

fn not_found(bet_id: &str) -> GatewayError {
    GatewayError::Rejected {
        code: "BET_NOT_FOUND".to_string(),
        message: format!("unknown bet {bet_id}"),
    }
}

#[async_trait]
impl BookmakerGateway for PaperGateway {
    fn name(&self) -> String {
        self.name.clone()
    }

    async fn authenticate(&self) -> Result<bool, GatewayError> {
        Ok(true)
    }

    async fn get_account_info(&self) -> Result<AccountInfo, GatewayError> {
        let balance = self.balance();
        Ok(AccountInfo {
            balance,
            currency: self.currency.clone(),
            withdrawable_balance: balance,
            last_updated: Utc::now(),
        })
    }

    async fn get_games(&self, sport: Option<String>) -> Result<Vec<Game>, GatewayError> {
        let now = Utc::now();
        Ok(self
            .state()
            .games
            .iter()
            .filter(|g| g.start_time > now)
            .filter(|g| sport.as_deref().map_or(true, |s| g.sport.eq_ignore_ascii_case(s)))
            .cloned()
            .collect())
    }

    async fn place_bet(&self, request: &BetRequest) -> Result<BetResponse, GatewayError> {
        let mut state = self.state();

        if state.fail_next_placements > 0 {
            state.fail_next_placements -= 1;
            debug!(bookmaker = %self.name, reference = %request.reference, "Simulated placement failure");
            return Ok(BetResponse::rejected("SIMULATED_FAILURE", "placement failure injected"));
        }
        if let Some(rejection) = Self::check_market(&state, request) {
            return Ok(rejection);
        }
        if request.stake <= Decimal::ZERO {
            return Ok(BetResponse::rejected("INVALID_STAKE", "stake must be positive"));
        }
        if request.stake > state.balance {
            return Ok(BetResponse::rejected(
                "INSUFFICIENT_FUNDS",
                format!("stake {} exceeds balance {}", request.stake, state.balance),
            ));
        }

        state.balance -= request.stake;
        state.next_bet += 1;
        let bet_id = format!("{}-{:06}", self.name, state.next_bet);
        state.bets.insert(
            bet_id.clone(),
            PaperBet {
                request: request.clone(),
                status: STATUS_PLACED,
            },
        );

        debug!(
            bookmaker = %self.name,
            bet_id = %bet_id,
            stake = %request.stake,
            odds = request.odds,
            "Paper bet placed"
        );

        Ok(BetResponse {
            success: true,
            bet_id: Some(bet_id),
            transaction_id: Some(Uuid::new_v4().to_string()),
            actual_odds: Some(request.odds),
            actual_stake: Some(request.stake),
            error: None,
            error_code: None,
        })
    }

    async fn cancel_bet(&self, bet_id: &str) -> Result<bool, GatewayError> {
        let mut state = self.state();
        if state.fail_cancellations {
            return Ok(false);
        }
        let bet = state.bets.get_mut(bet_id).ok_or_else(|| not_found(bet_id))?;
        if bet.status != STATUS_PLACED {
            return Ok(false);
        }
        bet.status = STATUS_CANCELLED;
        let refund = bet.request.stake;
        state.balance += refund;
        Ok(true)
    }

    async fn get_bet_status(&self, bet_id: &str) -> Result<String, GatewayError> {
        self.state()
            .bets
            .get(bet_id)
            .map(|b| b.status.to_string())
            .ok_or_else(|| not_found(bet_id))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
