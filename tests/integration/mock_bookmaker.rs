//! Mock bookmaker for integration testing.
//!
//! Provides a scripted `BookmakerGateway` implementation that serves
//! known games, accepts bets and records every call, all in-memory with
//! no external dependencies. Failures, delays and cancellation refusals
//! are controllable from test code.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use rust_decimal::prelude::*;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use surebet::platforms::{AccountInfo, BetRequest, BetResponse, BookmakerGateway, Game, GameMarket, GatewayError};

/// One recorded gateway call.
#[derive(Debug, Clone, PartialEq)]
pub enum Call {
    Authenticate,
    AccountInfo,
    Games,
    Place { reference: String, stake: Decimal, odds: f64 },
    Cancel(String),
    Status(String),
}

/// What the next placement should do.
#[derive(Debug, Clone)]
pub enum PlaceScript {
    Reject { code: String, message: String },
    Error(String),
    /// Sleep this long, then fill. Pair with a timeout to simulate a hang.
    Delay(std::time::Duration),
    /// Fill at different American odds than requested.
    FillAt(f64),
}

#[derive(Default)]
struct MockState {
    balance: Decimal,
    games: Vec<Game>,
    calls: Vec<Call>,
    place_script: VecDeque<PlaceScript>,
    refuse_cancel: bool,
    fail_games: bool,
    bets: HashMap<String, String>,
    next_bet: u32,
}

/// A scripted bookmaker for deterministic testing.
#[derive(Clone)]
pub struct MockBookmaker {
    name: String,
    state: Arc<Mutex<MockState>>,
}

impl MockBookmaker {
    pub fn new(name: &str, balance: f64) -> Self {
        Self {
            name: name.to_string(),
            state: Arc::new(Mutex::new(MockState {
                balance: Decimal::from_f64(balance).unwrap_or_default(),
                ..Default::default()
            })),
        }
    }

    pub fn with_games(self, games: Vec<Game>) -> Self {
        self.state.lock().unwrap().games = games;
        self
    }

    /// Queue behaviour for upcoming placements, in order.
    pub fn script(&self, step: PlaceScript) {
        self.state.lock().unwrap().place_script.push_back(step);
    }

    pub fn refuse_cancellations(&self) {
        self.state.lock().unwrap().refuse_cancel = true;
    }

    pub fn fail_games(&self) {
        self.state.lock().unwrap().fail_games = true;
    }

    pub fn calls(&self) -> Vec<Call> {
        self.state.lock().unwrap().calls.clone()
    }

    pub fn placements(&self) -> Vec<Call> {
        self.calls()
            .into_iter()
            .filter(|c| matches!(c, Call::Place { .. }))
            .collect()
    }

    pub fn cancellations(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                Call::Cancel(id) => Some(id),
                _ => None,
            })
            .collect()
    }

    pub fn balance(&self) -> Decimal {
        self.state.lock().unwrap().balance
    }

    fn fill(&self, request: &BetRequest, odds: f64) -> BetResponse {
        let mut state = self.state.lock().unwrap();
        state.balance -= request.stake;
        state.next_bet += 1;
        let bet_id = format!("{}-{}", self.name, state.next_bet);
        state.bets.insert(bet_id.clone(), "placed".to_string());
        BetResponse {
            success: true,
            bet_id: Some(bet_id),
            transaction_id: Some(request.reference.clone()),
            actual_odds: Some(odds),
            actual_stake: Some(request.stake),
            error: None,
            error_code: None,
        }
    }
}

#[async_trait]
impl BookmakerGateway for MockBookmaker {
    fn name(&self) -> String {
        self.name.clone()
    }

    async fn authenticate(&self) -> Result<bool, GatewayError> {
        self.state.lock().unwrap().calls.push(Call::Authenticate);
        Ok(true)
    }

    async fn get_account_info(&self) -> Result<AccountInfo, GatewayError> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(Call::AccountInfo);
        Ok(AccountInfo {
            balance: state.balance,
            currency: "USD".to_string(),
            withdrawable_balance: state.balance,
            last_updated: Utc::now(),
        })
    }

    async fn get_games(&self, sport: Option<String>) -> Result<Vec<Game>, GatewayError> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(Call::Games);
        if state.fail_games {
            return Err(GatewayError::Network("odds feed unavailable".to_string()));
        }
        Ok(state
            .games
            .iter()
            .filter(|g| sport.as_deref().map_or(true, |s| g.sport == s))
            .cloned()
            .collect())
    }

    async fn place_bet(&self, request: &BetRequest) -> Result<BetResponse, GatewayError> {
        let step = {
            let mut state = self.state.lock().unwrap();
            state.calls.push(Call::Place {
                reference: request.reference.clone(),
                stake: request.stake,
                odds: request.odds,
            });
            state.place_script.pop_front()
        };

        match step {
            None => Ok(self.fill(request, request.odds)),
            Some(PlaceScript::Reject { code, message }) => Ok(BetResponse::rejected(&code, message)),
            Some(PlaceScript::Error(message)) => Err(GatewayError::Network(message)),
            Some(PlaceScript::Delay(d)) => {
                tokio::time::sleep(d).await;
                Ok(self.fill(request, request.odds))
            }
            Some(PlaceScript::FillAt(odds)) => Ok(self.fill(request, odds)),
        }
    }

    async fn cancel_bet(&self, bet_id: &str) -> Result<bool, GatewayError> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(Call::Cancel(bet_id.to_string()));
        if state.refuse_cancel {
            return Ok(false);
        }
        match state.bets.get_mut(bet_id) {
            Some(status) if status == "placed" => {
                *status = "cancelled".to_string();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn get_bet_status(&self, bet_id: &str) -> Result<String, GatewayError> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(Call::Status(bet_id.to_string()));
        state.bets.get(bet_id).cloned().ok_or_else(|| GatewayError::Rejected {
            code: "BET_NOT_FOUND".to_string(),
            message: bet_id.to_string(),
        })
    }
}

// ---------------------------------------------------------------------------
// Fixtures
// ---------------------------------------------------------------------------

pub fn kickoff() -> DateTime<Utc> {
    Utc::now() + Duration::hours(6)
}

/// A two-way game quoted with the given American odds.
pub fn game(id: &str, sport: &str, home: &str, away: &str, start: DateTime<Utc>, home_odds: f64, away_odds: f64) -> Game {
    Game {
        id: id.to_string(),
        sport: sport.to_string(),
        home_team: home.to_string(),
        away_team: away.to_string(),
        start_time: start,
        markets: vec![
            GameMarket {
                id: format!("{id}-home"),
                name: home.to_string(),
                odds: home_odds,
                available: true,
                min_stake: Some(1.0),
                max_stake: Some(5_000.0),
            },
            GameMarket {
                id: format!("{id}-away"),
                name: away.to_string(),
                odds: away_odds,
                available: true,
                min_stake: Some(1.0),
                max_stake: Some(5_000.0),
            },
        ],
    }
}
