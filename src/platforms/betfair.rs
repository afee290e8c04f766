//! Betfair Exchange integration.
//!
//! Real-money sports betting exchange, used here as a back-only bookmaker.
//! Uses the Betfair Exchange API (JSON-RPC over REST).
//!
//! API docs: https://docs.developer.betfair.com/display/1smk3cen4v3lu3yomq5qye0ni/API+Overview
//! Betting API base: https://api.betfair.com/exchange/betting/rest/v1.0/
//! Account API base: https://api.betfair.com/exchange/account/rest/v1.0/
//! Auth: https://identitysso.betfair.com/api/login
//!
//! Auth requires: App Key + session token (obtained via username/password login).
//! Headers: `X-Application: {app_key}`, `X-Authentication: {session_token}`
//!
//! Games map to MATCH_ODDS markets: the game id is the Betfair market id
//! and each runner is one `GameMarket` whose id is the selection id.
//! Betfair quotes decimal odds; they are converted to American here.

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{Client, StatusCode};
use rust_decimal::prelude::*;
use secrecy::{ExposeSecret, SecretString};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

use super::{AccountInfo, BetRequest, BetResponse, BookmakerGateway, Game, GameMarket, GatewayError};
use crate::config::{AppConfig, BookmakerConfig};
use crate::strategy::odds::{american_to_decimal, decimal_to_american};

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

const AUTH_URL: &str = "https://identitysso.betfair.com/api/login";
const BETTING_URL: &str = "https://api.betfair.com/exchange/betting/rest/v1.0";
const ACCOUNT_URL: &str = "https://api.betfair.com/exchange/account/rest/v1.0";

/// Maximum markets to fetch per catalogue request.
const DEFAULT_FETCH_LIMIT: u32 = 200;

/// listMarketBook accepts at most this many market ids per call.
const BOOK_CHUNK: usize = 40;

/// Exchange minimum back stake.
const MIN_BACK_STAKE: f64 = 1.0;

/// customerOrderRef length limit.
const MAX_CUSTOMER_REF: usize = 32;

// ---------------------------------------------------------------------------
// Betfair API types
// ---------------------------------------------------------------------------

/// Login response from the SSO endpoint.
#[derive(Debug, Deserialize)]
struct LoginResponse {
    #[serde(rename = "sessionToken")]
    session_token: Option<String>,
    #[serde(rename = "loginStatus")]
    login_status: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct EventType {
    #[allow(dead_code)]
    id: String,
    name: String,
}

/// Market catalogue entry.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MarketCatalogue {
    market_id: String,
    #[serde(default)]
    event: Option<EventInfo>,
    #[serde(default)]
    event_type: Option<EventType>,
    #[serde(default)]
    market_start_time: Option<String>,
    #[serde(default)]
    runners: Vec<RunnerCatalogue>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct EventInfo {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    open_date: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RunnerCatalogue {
    selection_id: u64,
    runner_name: String,
}

/// Market book (live prices).
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MarketBook {
    market_id: String,
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    runners: Vec<RunnerBook>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RunnerBook {
    selection_id: u64,
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    ex: Option<ExchangePrices>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ExchangePrices {
    #[serde(default)]
    available_to_back: Vec<PriceSize>,
}

#[derive(Debug, Deserialize)]
struct PriceSize {
    price: f64,
    size: f64,
}

/// Place orders response.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PlaceOrdersResponse {
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    instruction_reports: Vec<InstructionReport>,
    #[serde(default)]
    error_code: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct InstructionReport {
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    error_code: Option<String>,
    #[serde(default)]
    bet_id: Option<String>,
    #[serde(default)]
    average_price_matched: Option<f64>,
    #[serde(default)]
    size_matched: Option<f64>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CancelOrdersResponse {
    #[serde(default)]
    status: Option<String>,
}

/// Current orders response.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CurrentOrdersResponse {
    #[serde(default)]
    current_orders: Vec<CurrentOrder>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CurrentOrder {
    bet_id: String,
    #[serde(default)]
    status: Option<String>,
}

/// Account funds response.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AccountFunds {
    available_to_bet_balance: Option<f64>,
    #[serde(default)]
    exposure: Option<f64>,
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

/// Betfair Exchange gateway.
pub struct BetfairGateway {
    name: String,
    http: Client,
    app_key: String,
    username: String,
    password: SecretString,
    session_token: RwLock<Option<String>>,
    /// bet id → market id, needed by cancelOrders
    bet_markets: Mutex<HashMap<String, String>>,
}

impl BetfairGateway {
    /// Build from a `kind = "betfair"` bookmaker entry.
    ///
    /// Reads credentials from the configured environment variables
    /// (default `BETFAIR_APP_KEY`, `BETFAIR_USERNAME`, `BETFAIR_PASSWORD`).
    pub fn from_config(cfg: &BookmakerConfig) -> anyhow::Result<Self> {
        let app_key = AppConfig::resolve_env(cfg.app_key_env.as_deref().unwrap_or("BETFAIR_APP_KEY"))?;
        let username = AppConfig::resolve_env(cfg.username_env.as_deref().unwrap_or("BETFAIR_USERNAME"))?;
        let password = AppConfig::resolve_env(cfg.password_env.as_deref().unwrap_or("BETFAIR_PASSWORD"))?;
        Self::with_credentials(cfg.name.clone(), app_key, username, SecretString::new(password))
    }

    /// Create a gateway with explicit credentials.
    pub fn with_credentials(
        name: String,
        app_key: String,
        username: String,
        password: SecretString,
    ) -> anyhow::Result<Self> {
        let http = Client::builder()
            .timeout(std::time::Duration::from_secs(30))
            .user_agent("SUREBET/0.1.0 (arbitrage-engine)")
            .build()
            .context("Failed to build HTTP client for Betfair")?;

        Ok(Self {
            name,
            http,
            app_key,
            username,
            password,
            session_token: RwLock::new(None),
            bet_markets: Mutex::new(HashMap::new()),
        })
    }

    // -- Authentication ----------------------------------------------------

    /// Authenticate with Betfair SSO and store the session token.
    async fn login(&self) -> Result<String, GatewayError> {
        info!(bookmaker = %self.name, "Authenticating with Betfair...");

        let resp = self
            .http
            .post(AUTH_URL)
            .header("X-Application", &self.app_key)
            .header("Accept", "application/json")
            .form(&[
                ("username", self.username.as_str()),
                ("password", self.password.expose_secret().as_str()),
            ])
            .send()
            .await?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(GatewayError::Auth(format!("login failed {status}: {body}")));
        }

        let login: LoginResponse = resp
            .json()
            .await
            .context("Failed to parse Betfair login response")?;

        if login.login_status != "SUCCESS" {
            return Err(GatewayError::Auth(format!("login rejected: {}", login.login_status)));
        }

        let token = login
            .session_token
            .ok_or_else(|| GatewayError::Auth("no session token returned".to_string()))?;

        *self.session_token.write().unwrap_or_else(|e| e.into_inner()) = Some(token.clone());

        info!(bookmaker = %self.name, "Betfair authentication successful");
        Ok(token)
    }

    /// Get a valid session token, logging in if necessary.
    async fn ensure_session(&self) -> Result<String, GatewayError> {
        let cached = self
            .session_token
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        match cached {
            Some(token) => Ok(token),
            None => self.login().await,
        }
    }

    fn clear_session(&self) {
        *self.session_token.write().unwrap_or_else(|e| e.into_inner()) = None;
    }

    // -- API helpers -------------------------------------------------------

    /// Authenticated POST. On 401 the session is refreshed and the request
    /// retried once.
    async fn post<T: DeserializeOwned>(
        &self,
        url: &str,
        body: &serde_json::Value,
    ) -> Result<T, GatewayError> {
        let mut token = self.ensure_session().await?;

        for attempt in 0..2 {
            debug!(url = %url, attempt, "Betfair API request");

            let resp = self
                .http
                .post(url)
                .header("X-Application", &self.app_key)
                .header("X-Authentication", &token)
                .header("Content-Type", "application/json")
                .json(body)
                .send()
                .await?;

            match resp.status() {
                StatusCode::UNAUTHORIZED if attempt == 0 => {
                    warn!(bookmaker = %self.name, "Betfair session expired, re-authenticating...");
                    self.clear_session();
                    token = self.login().await?;
                }
                StatusCode::TOO_MANY_REQUESTS => return Err(GatewayError::RateLimited),
                status if !status.is_success() => {
                    let body_text = resp.text().await.unwrap_or_default();
                    return Err(GatewayError::Network(format!(
                        "Betfair {url} error {status}: {body_text}"
                    )));
                }
                _ => {
                    let parsed = resp
                        .json()
                        .await
                        .with_context(|| format!("Failed to parse Betfair response from {url}"))?;
                    return Ok(parsed);
                }
            }
        }

        Err(GatewayError::Auth("session rejected after re-authentication".to_string()))
    }

    async fn betting_api<T: DeserializeOwned>(
        &self,
        endpoint: &str,
        body: &serde_json::Value,
    ) -> Result<T, GatewayError> {
        self.post(&format!("{BETTING_URL}/{endpoint}/"), body).await
    }

    async fn account_api<T: DeserializeOwned>(
        &self,
        endpoint: &str,
        body: &serde_json::Value,
    ) -> Result<T, GatewayError> {
        self.post(&format!("{ACCOUNT_URL}/{endpoint}/"), body).await
    }

    // -- Market fetching ---------------------------------------------------

    async fn fetch_market_catalogues(
        &self,
        event_type_ids: &[&str],
    ) -> Result<Vec<MarketCatalogue>, GatewayError> {
        let now = Utc::now();
        let from = now.format("%Y-%m-%dT%H:%M:%SZ").to_string();
        // Look ahead 7 days for upcoming markets
        let to = (now + chrono::Duration::days(7))
            .format("%Y-%m-%dT%H:%M:%SZ")
            .to_string();

        let body = serde_json::json!({
            "filter": {
                "eventTypeIds": event_type_ids,
                "marketTypeCodes": ["MATCH_ODDS"],
                "inPlayOnly": false,
                "marketStartTime": { "from": from, "to": to }
            },
            "maxResults": DEFAULT_FETCH_LIMIT,
            "marketProjection": ["EVENT", "EVENT_TYPE", "RUNNER_DESCRIPTION", "MARKET_START_TIME"],
            "sort": "MAXIMUM_TRADED"
        });

        self.betting_api("listMarketCatalogue", &body).await
    }

    async fn fetch_market_books(&self, market_ids: &[String]) -> Result<Vec<MarketBook>, GatewayError> {
        let body = serde_json::json!({
            "marketIds": market_ids,
            "priceProjection": {
                "priceData": ["EX_BEST_OFFERS"],
                "virtualise": false
            }
        });

        self.betting_api("listMarketBook", &body).await
    }

    // -- Conversion helpers ------------------------------------------------

    /// Betfair event type ID for a sport name.
    fn event_type_id(sport: &str) -> Option<&'static str> {
        match sport.to_lowercase().as_str() {
            "soccer" | "football" => Some("1"),
            "tennis" => Some("2"),
            "basketball" => Some("7522"),
            "american football" | "nfl" => Some("6423"),
            "ice hockey" | "hockey" => Some("7524"),
            "cricket" => Some("4"),
            "rugby league" => Some("1477"),
            "rugby union" => Some("5"),
            "boxing" => Some("6"),
            "mixed martial arts" | "mma" => Some("468328"),
            "baseball" => Some("7511"),
            _ => None,
        }
    }

    /// Event types scanned when no sport is requested.
    fn target_event_type_ids() -> Vec<&'static str> {
        vec![
            "1",      // Soccer
            "2",      // Tennis
            "7522",   // Basketball
            "6423",   // American Football
            "7524",   // Ice Hockey
            "4",      // Cricket
            "7511",   // Baseball
            "6",      // Boxing
            "468328", // Mixed Martial Arts
        ]
    }

    /// Split "Home v Away" (or "Away @ Home") into teams.
    fn parse_teams(event_name: &str) -> Option<(String, String)> {
        if let Some((home, away)) = event_name.split_once(" v ") {
            return Some((home.trim().to_string(), away.trim().to_string()));
        }
        if let Some((away, home)) = event_name.split_once(" @ ") {
            return Some((home.trim().to_string(), away.trim().to_string()));
        }
        None
    }

    /// Convert a catalogue entry plus its book into a `Game`.
    fn to_game(catalogue: &MarketCatalogue, book: Option<&MarketBook>) -> Option<Game> {
        let event_name = catalogue.event.as_ref()?.name.as_deref()?;
        let (home_team, away_team) = Self::parse_teams(event_name)?;

        let start_time = catalogue
            .market_start_time
            .as_deref()
            .or_else(|| catalogue.event.as_ref().and_then(|e| e.open_date.as_deref()))
            .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
            .map(|dt| dt.with_timezone(&Utc))?;

        let sport = catalogue
            .event_type
            .as_ref()
            .map(|et| et.name.to_lowercase())
            .unwrap_or_else(|| "unknown".to_string());

        let market_open = book.map_or(false, |b| b.status.as_deref().map_or(true, |s| s == "OPEN"));

        let markets = catalogue
            .runners
            .iter()
            .filter_map(|runner| {
                let runner_book = book?.runners.iter().find(|r| r.selection_id == runner.selection_id)?;
                let best = runner_book.ex.as_ref()?.available_to_back.first()?;
                let odds = decimal_to_american(best.price).ok()?;
                let active = runner_book.status.as_deref().map_or(true, |s| s == "ACTIVE");
                Some(GameMarket {
                    id: runner.selection_id.to_string(),
                    name: runner.runner_name.clone(),
                    odds,
                    available: market_open && active,
                    min_stake: Some(MIN_BACK_STAKE),
                    max_stake: Some(best.size),
                })
            })
            .collect();

        Some(Game {
            id: catalogue.market_id.clone(),
            sport,
            home_team,
            away_team,
            start_time,
            markets,
        })
    }

    /// Round a decimal price up to the next valid Betfair tick, so a back
    /// order never accepts worse than the requested price.
    fn to_tick(price: f64) -> f64 {
        let step = match price {
            p if p < 2.0 => 0.01,
            p if p < 3.0 => 0.02,
            p if p < 4.0 => 0.05,
            p if p < 6.0 => 0.1,
            p if p < 10.0 => 0.2,
            p if p < 20.0 => 0.5,
            p if p < 30.0 => 1.0,
            p if p < 50.0 => 2.0,
            p if p < 100.0 => 5.0,
            _ => 10.0,
        };
        let ticks = (price / step - 1e-9).ceil();
        ((ticks * step) * 100.0).round() / 100.0
    }

    fn customer_ref(reference: &str) -> String {
        reference.chars().filter(|c| *c != '-').take(MAX_CUSTOMER_REF).collect()
    }

    /// Map a placeOrders response to the gateway response.
    fn to_bet_response(resp: &PlaceOrdersResponse, requested_stake: Decimal) -> BetResponse {
        let report = resp.instruction_reports.first();

        if resp.status.as_deref() != Some("SUCCESS") {
            let code = report
                .and_then(|r| r.error_code.as_deref())
                .or(resp.error_code.as_deref())
                .unwrap_or("UNKNOWN");
            return BetResponse::rejected(code, format!("Betfair order failed: {code}"));
        }

        let Some(report) = report.filter(|r| r.status.as_deref() == Some("SUCCESS")) else {
            return BetResponse::rejected("NO_REPORT", "no successful instruction report");
        };

        BetResponse {
            success: true,
            bet_id: report.bet_id.clone(),
            transaction_id: None,
            actual_odds: report
                .average_price_matched
                .filter(|p| *p > 1.0)
                .and_then(|p| decimal_to_american(p).ok()),
            actual_stake: Some(
                report
                    .size_matched
                    .and_then(Decimal::from_f64)
                    .map(|d| d.round_dp(2))
                    .unwrap_or(requested_stake),
            ),
            error: None,
            error_code: None,
        }
    }
}

// ---------------------------------------------------------------------------
// BookmakerGateway trait implementation
// ---------------------------------------------------------------------------

#[async_trait]
impl BookmakerGateway for BetfairGateway {
    fn name(&self) -> String {
        self.name.clone()
    }

    async fn authenticate(&self) -> Result<bool, GatewayError> {
        match self.login().await {
            Ok(_) => Ok(true),
            Err(GatewayError::Auth(reason)) => {
                warn!(bookmaker = %self.name, reason = %reason, "Betfair authentication rejected");
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }

    async fn get_account_info(&self) -> Result<AccountInfo, GatewayError> {
        let funds: AccountFunds = self.account_api("getAccountFunds", &serde_json::json!({})).await?;

        let available = funds
            .available_to_bet_balance
            .context("No balance returned from Betfair")?;
        let exposure = funds.exposure.unwrap_or(0.0).abs();

        let balance = Decimal::from_f64(available + exposure).unwrap_or_default().round_dp(2);
        let withdrawable = Decimal::from_f64(available).unwrap_or_default().round_dp(2);

        Ok(AccountInfo {
            balance,
            currency: "GBP".to_string(),
            withdrawable_balance: withdrawable,
            last_updated: Utc::now(),
        })
    }

    /// Fetch MATCH_ODDS markets, then live prices in batches.
    async fn get_games(&self, sport: Option<String>) -> Result<Vec<Game>, GatewayError> {
        let event_type_ids = match sport.as_deref() {
            Some(s) => match Self::event_type_id(s) {
                Some(id) => vec![id],
                None => return Ok(Vec::new()),
            },
            None => Self::target_event_type_ids(),
        };

        let catalogues = self.fetch_market_catalogues(&event_type_ids).await?;
        info!(bookmaker = %self.name, count = catalogues.len(), "Betfair market catalogues fetched");
        if catalogues.is_empty() {
            return Ok(Vec::new());
        }

        let market_ids: Vec<String> = catalogues.iter().map(|c| c.market_id.clone()).collect();
        let mut books = Vec::new();
        for chunk in market_ids.chunks(BOOK_CHUNK) {
            match self.fetch_market_books(chunk).await {
                Ok(batch) => books.extend(batch),
                Err(e) => warn!(error = %e, "Failed to fetch market book batch, continuing"),
            }
        }
        let book_index: HashMap<&str, &MarketBook> =
            books.iter().map(|b| (b.market_id.as_str(), b)).collect();

        let games: Vec<Game> = catalogues
            .iter()
            .filter_map(|c| Self::to_game(c, book_index.get(c.market_id.as_str()).copied()))
            .collect();

        info!(bookmaker = %self.name, games = games.len(), "Betfair scan complete");
        Ok(games)
    }

    /// BACK limit order at the requested price, lapsing at kick-off.
    async fn place_bet(&self, request: &BetRequest) -> Result<BetResponse, GatewayError> {
        let Ok(selection_id) = request.market_id.parse::<u64>() else {
            return Ok(BetResponse::rejected(
                "INVALID_SELECTION",
                format!("not a Betfair selection id: {}", request.market_id),
            ));
        };
        let price = match american_to_decimal(request.odds) {
            Ok(d) => Self::to_tick(d),
            Err(e) => return Ok(BetResponse::rejected("INVALID_ODDS", e.to_string())),
        };
        let size = request.stake.round_dp(2).to_f64().unwrap_or(0.0);

        let body = serde_json::json!({
            "marketId": request.game_id,
            "customerRef": Self::customer_ref(&request.reference),
            "instructions": [{
                "orderType": "LIMIT",
                "selectionId": selection_id,
                "side": "BACK",
                "customerOrderRef": Self::customer_ref(&request.reference),
                "limitOrder": {
                    "size": size,
                    "price": price,
                    "persistenceType": "LAPSE"
                }
            }]
        });

        let resp: PlaceOrdersResponse = self.betting_api("placeOrders", &body).await?;
        let response = Self::to_bet_response(&resp, request.stake);

        if let Some(bet_id) = &response.bet_id {
            self.bet_markets
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .insert(bet_id.clone(), request.game_id.clone());
            info!(
                bookmaker = %self.name,
                bet_id = %bet_id,
                market_id = %request.game_id,
                selection = %request.selection,
                stake = %request.stake,
                price,
                "Betfair order placed"
            );
        } else {
            warn!(
                bookmaker = %self.name,
                market_id = %request.game_id,
                code = response.error_code.as_deref().unwrap_or("-"),
                "Betfair order rejected"
            );
        }

        Ok(response)
    }

    async fn cancel_bet(&self, bet_id: &str) -> Result<bool, GatewayError> {
        let market_id = self
            .bet_markets
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(bet_id)
            .cloned()
            .ok_or_else(|| GatewayError::Rejected {
                code: "BET_NOT_FOUND".to_string(),
                message: format!("no market recorded for bet {bet_id}"),
            })?;

        let body = serde_json::json!({
            "marketId": market_id,
            "instructions": [{ "betId": bet_id }]
        });
        let resp: CancelOrdersResponse = self.betting_api("cancelOrders", &body).await?;
        Ok(resp.status.as_deref() == Some("SUCCESS"))
    }

    /// Status from listCurrentOrders; bets no longer listed are cleared.
    async fn get_bet_status(&self, bet_id: &str) -> Result<String, GatewayError> {
        let body = serde_json::json!({ "betIds": [bet_id] });
        let resp: CurrentOrdersResponse = self.betting_api("listCurrentOrders", &body).await?;
        Ok(resp
            .current_orders
            .iter()
            .find(|o| o.bet_id == bet_id)
            .and_then(|o| o.status.as_deref())
            .map(|s| s.to_lowercase())
            .unwrap_or_else(|| "cleared".to_string()))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
