//! Rate limiting and timeouts for bookmaker calls.
//!
//! `Throttled` wraps any gateway: before each call it waits on a
//! per-bookmaker token bucket (never dropping the call), and every call
//! runs under a deadline that surfaces as `GatewayError::Timeout`.

use async_trait::async_trait;
use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};
use std::future::Future;
use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

use super::{AccountInfo, BetRequest, BetResponse, BookmakerGateway, Game, GatewayError};

pub const DEFAULT_REQUESTS_PER_MINUTE: u32 = 60;

pub struct Throttled<G> {
    inner: G,
    limiter: Arc<DefaultDirectRateLimiter>,
    timeout: Duration,
}

impl<G: BookmakerGateway> Throttled<G> {
    pub fn new(inner: G, requests_per_minute: u32, timeout: Duration) -> Self {
        let rpm = NonZeroU32::new(requests_per_minute).unwrap_or(NonZeroU32::MIN);
        Self {
            inner,
            limiter: Arc::new(RateLimiter::direct(Quota::per_minute(rpm))),
            timeout,
        }
    }

    /// The wrapped gateway.
    pub fn inner(&self) -> &G {
        &self.inner
    }

    async fn call<T, F>(&self, op: &str, fut: F) -> Result<T, GatewayError>
    where
        F: Future<Output = Result<T, GatewayError>>,
    {
        self.limiter.until_ready().await;
        match tokio::time::timeout(self.timeout, fut).await {
            Ok(result) => result,
            Err(_) => {
                warn!(
                    bookmaker = %self.inner.name(),
                    op,
                    timeout_ms = self.timeout.as_millis() as u64,
                    "Bookmaker call timed out"
                );
                Err(GatewayError::Timeout {
                    op: op.to_string(),
                    after: self.timeout,
                })
            }
        }
    }
}

#[async_trait]
impl<G: BookmakerGateway> BookmakerGateway for Throttled<G> {
    fn name(&self) -> String {
        self.inner.name()
    }

    async fn authenticate(&self) -> Result<bool, GatewayError> {
        self.call("authenticate", self.inner.authenticate()).await
    }

    async fn get_account_info(&self) -> Result<AccountInfo, GatewayError> {
        self.call("get_account_info", self.inner.get_account_info()).await
    }

    async fn get_games(&self, sport: Option<String>) -> Result<Vec<Game>, GatewayError> {
        self.call("get_games", self.inner.get_games(sport)).await
    }

    async fn place_bet(&self, request: &BetRequest) -> Result<BetResponse, GatewayError> {
        self.call("place_bet", self.inner.place_bet(request)).await
    }

    async fn cancel_bet(&self, bet_id: &str) -> Result<bool, GatewayError> {
        self.call("cancel_bet", self.inner.cancel_bet(bet_id)).await
    }

    async fn get_bet_status(&self, bet_id: &str) -> Result<String, GatewayError> {
        self.call("get_bet_status", self.inner.get_bet_status(bet_id)).await
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
