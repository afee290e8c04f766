//! Automation engine — the control loop.
//!
//! Each tick fetches candidate opportunities, filters them against the
//! current `AutomationConfig`, executes the ones that can be
//! auto-approved and parks the rest for a human decision. A failed tick
//! is logged and followed by a longer sleep; the loop only stops on
//! shutdown.

use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::accountant::AccountantHandle;
use super::events::{EngineEvent, EventBus};
use super::executor::{ExecutionOutcome, Executor};
use super::pool::ScannerPool;
use super::scanner::MarketRouter;
use crate::config::AutomationConfig;
use crate::strategy::arbitrage::ScanFilters;
use crate::strategy::risk::RiskLimits;
use crate::types::{Opportunity, RiskState, SurebetError};

/// Error backoff grows with consecutive failures up to this multiple.
const MAX_BACKOFF_FACTOR: u32 = 4;

// ---------------------------------------------------------------------------
// Opportunity source
// ---------------------------------------------------------------------------

/// Where the engine gets candidates from.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait OpportunitySource: Send + Sync {
    async fn fetch_candidates(&self, filters: &ScanFilters) -> Result<Vec<Opportunity>>;
}

/// Live odds from every registered bookmaker, scanned on the worker pool.
pub struct GatewayOpportunitySource {
    router: MarketRouter,
    pool: ScannerPool,
    events: EventBus,
}

impl GatewayOpportunitySource {
    pub fn new(router: MarketRouter, pool: ScannerPool, events: EventBus) -> Self {
        Self { router, pool, events }
    }
}

#[async_trait]
impl OpportunitySource for GatewayOpportunitySource {
    async fn fetch_candidates(&self, filters: &ScanFilters) -> Result<Vec<Opportunity>> {
        let started = Instant::now();
        let markets = self.router.scan_all().await;
        let market_count = markets.len();
        if markets.is_empty() {
            debug!("No comparable markets this tick");
            return Ok(Vec::new());
        }

        let report = self.pool.scan(markets, filters.clone()).await?;
        for e in &report.errors {
            warn!(error = %e, "Scan worker error");
        }

        let elapsed_ms = started.elapsed().as_millis() as u64;
        info!(
            markets = market_count,
            processed = report.processed,
            opportunities = report.opportunities.len(),
            elapsed_ms,
            "Scan complete"
        );
        self.events.publish(EngineEvent::ScanCompleted {
            markets: market_count,
            opportunities: report.opportunities.len(),
            elapsed_ms,
        });
        Ok(report.opportunities)
    }
}

// ---------------------------------------------------------------------------
// Stake sizing
// ---------------------------------------------------------------------------

/// Largest total stake the risk limits and current risk state allow for
/// `opp`.
///
/// Stays inside the per-leg cap, the total cap, the risk level's bankroll
/// fraction, the daily volume headroom and the remaining usage allowance,
/// so the blocking risk rules are not tripped by the engine's own request.
pub fn sized_stake(limits: &RiskLimits, state: &RiskState, opp: &Opportunity) -> f64 {
    let implied: Vec<f64> = opp.decimal_odds().iter().map(|d| 1.0 / d).collect();
    let book: f64 = implied.iter().sum();
    let largest_share = implied.iter().fold(0.0_f64, |acc, p| acc.max(p / book));

    let by_leg = if largest_share > 0.0 {
        limits.max_stake_per_bet / largest_share
    } else {
        limits.max_stake_per_bet
    };
    let bankroll = state.current_bankroll.max(0.0);
    let by_bankroll = bankroll * limits.risk_level.bankroll_fraction();
    let by_volume = bankroll * limits.daily_volume_pct - state.daily_used;

    let stake = limits
        .max_total_stake
        .min(by_leg)
        .min(by_bankroll)
        .min(by_volume)
        .min(state.remaining_usage());
    opp.max_total_stake.map_or(stake, |cap| stake.min(cap)).max(0.0)
}

// ---------------------------------------------------------------------------
// Manual approvals
// ---------------------------------------------------------------------------

/// Opportunities waiting for a human, and the means to act on them.
#[derive(Clone)]
pub struct ApprovalHandle {
    pending: Arc<Mutex<HashMap<Uuid, Opportunity>>>,
    executor: Arc<Executor>,
    accountant: AccountantHandle,
    config: watch::Receiver<AutomationConfig>,
}

impl ApprovalHandle {
    fn lock(&self) -> MutexGuard<'_, HashMap<Uuid, Opportunity>> {
        self.pending.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Waiting opportunities, best score first.
    pub fn pending(&self) -> Vec<Opportunity> {
        let mut out: Vec<Opportunity> = self.lock().values().cloned().collect();
        crate::strategy::arbitrage::sort_by_score(&mut out);
        out
    }

    /// Execute a parked opportunity if it is still fresh.
    pub async fn approve(&self, opportunity_id: Uuid) -> Result<ExecutionOutcome, SurebetError> {
        let opp = self.lock().remove(&opportunity_id).ok_or_else(|| SurebetError::StaleOpportunity {
            opportunity_id,
            reason: "not awaiting approval".to_string(),
        })?;
        if opp.is_expired(Utc::now()) {
            return Err(SurebetError::StaleOpportunity {
                opportunity_id,
                reason: "expired while awaiting approval".to_string(),
            });
        }

        let config = self.config.borrow().clone();
        self.executor.apply_automation(&config);
        let state = self
            .accountant
            .snapshot()
            .await
            .map_err(|e| SurebetError::Storage(e.to_string()))?;
        let stake = sized_stake(&self.executor.risk_limits(), &state, &opp);
        info!(opportunity = %opp.id, stake = format!("${:.2}", stake), "Manually approved");
        self.executor.execute_opportunity(&opp, stake).await
    }

    /// Drop a parked opportunity. Returns false if it was not waiting.
    pub fn reject(&self, opportunity_id: Uuid) -> bool {
        self.lock().remove(&opportunity_id).is_some()
    }

    /// Park an opportunity unless the same combination is already waiting.
    fn park(&self, opp: &Opportunity) -> bool {
        let mut pending = self.lock();
        let key = opp.combination_key();
        if pending.values().any(|p| p.combination_key() == key) {
            return false;
        }
        pending.insert(opp.id, opp.clone());
        true
    }

    /// Forget expired opportunities. Returns how many went.
    fn prune(&self) -> usize {
        let now = Utc::now();
        let mut pending = self.lock();
        let before = pending.len();
        pending.retain(|_, opp| !opp.is_expired(now));
        before - pending.len()
    }
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

/// What one tick did.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TickReport {
    pub disabled: bool,
    pub cooling_down: bool,
    pub candidates: usize,
    pub filtered: usize,
    pub executed: usize,
    pub compensated: usize,
    pub rejected: usize,
    pub awaiting_approval: usize,
    pub escalated: usize,
}

pub struct AutomationEngine {
    config: watch::Receiver<AutomationConfig>,
    source: Arc<dyn OpportunitySource>,
    executor: Arc<Executor>,
    accountant: AccountantHandle,
    events: EventBus,
    approvals: ApprovalHandle,
    last_execution: Option<Instant>,
    consecutive_errors: u32,
}

impl AutomationEngine {
    pub fn new(
        config: watch::Receiver<AutomationConfig>,
        source: Arc<dyn OpportunitySource>,
        executor: Arc<Executor>,
        accountant: AccountantHandle,
        events: EventBus,
    ) -> Self {
        let approvals = ApprovalHandle {
            pending: Arc::new(Mutex::new(HashMap::new())),
            executor: Arc::clone(&executor),
            accountant: accountant.clone(),
            config: config.clone(),
        };
        Self {
            config,
            source,
            executor,
            accountant,
            events,
            approvals,
            last_execution: None,
            consecutive_errors: 0,
        }
    }

    pub fn approvals(&self) -> ApprovalHandle {
        self.approvals.clone()
    }

    pub fn consecutive_errors(&self) -> u32 {
        self.consecutive_errors
    }

    fn in_cooldown(&self, config: &AutomationConfig) -> bool {
        let cooldown = Duration::from_millis(config.cooldown_period);
        self.last_execution.is_some_and(|at| at.elapsed() < cooldown)
    }

    /// One pass: fetch, filter, execute or park.
    pub async fn tick(&mut self) -> Result<TickReport> {
        let config = self.config.borrow().clone();
        let mut report = TickReport::default();

        if !config.enabled {
            report.disabled = true;
            return Ok(report);
        }

        self.executor.apply_automation(&config);

        let expired = self.approvals.prune();
        if expired > 0 {
            debug!(expired, "Dropped expired approvals");
        }

        if self.in_cooldown(&config) {
            report.cooling_down = true;
            return Ok(report);
        }

        let candidates = self.source.fetch_candidates(&config.filters()).await?;
        report.candidates = candidates.len();

        for opp in candidates {
            if let Some(reason) = config.rejection(&opp, Utc::now()) {
                debug!(opportunity = %opp.id, reason = %reason, "Filtered");
                report.filtered += 1;
                continue;
            }

            if !config.auto_approves(&opp) {
                if self.approvals.park(&opp) {
                    info!(
                        opportunity = %opp.id,
                        event = %opp.event_name,
                        margin = format!("{:.2}%", opp.profit_margin),
                        warnings = opp.warnings.len(),
                        "Awaiting approval"
                    );
                    self.events.publish(EngineEvent::ApprovalRequired {
                        opportunity: Box::new(opp),
                    });
                    report.awaiting_approval += 1;
                }
                continue;
            }

            // One execution per cooldown period.
            if self.in_cooldown(&config) {
                debug!(opportunity = %opp.id, "Cooling down, skipping");
                continue;
            }

            let state = self.accountant.snapshot().await?;
            let stake = sized_stake(&self.executor.risk_limits(), &state, &opp);
            if stake < 1.0 {
                debug!(opportunity = %opp.id, "No stake allowance left");
                report.rejected += 1;
                continue;
            }

            match self.executor.execute_opportunity(&opp, stake).await {
                Ok(ExecutionOutcome::Settled(_)) => {
                    self.last_execution = Some(Instant::now());
                    report.executed += 1;
                }
                Ok(ExecutionOutcome::Compensated(c)) => {
                    self.last_execution = Some(Instant::now());
                    warn!(opportunity = %c.opportunity_id, reason = %c.reason, "Execution compensated");
                    report.compensated += 1;
                }
                Err(e) if e.needs_human() => {
                    self.last_execution = Some(Instant::now());
                    error!(opportunity = %opp.id, error = %e, "Execution needs manual intervention");
                    report.escalated += 1;
                }
                Err(e) => {
                    info!(opportunity = %opp.id, error = %e, "Execution rejected");
                    report.rejected += 1;
                }
            }
        }

        Ok(report)
    }

    /// Tick until `shutdown` resolves.
    pub async fn run<F>(&mut self, shutdown: F)
    where
        F: Future<Output = ()> + Send,
    {
        tokio::pin!(shutdown);
        info!("Automation loop started");

        loop {
            let delay = match self.tick().await {
                Ok(report) => {
                    self.consecutive_errors = 0;
                    log_tick(&report);
                    Duration::from_millis(self.config.borrow().tick_interval_ms)
                }
                Err(e) => {
                    self.consecutive_errors += 1;
                    error!(
                        error = %e,
                        consecutive_errors = self.consecutive_errors,
                        "Tick failed, backing off"
                    );
                    self.events.publish(EngineEvent::TickFailed {
                        error: e.to_string(),
                        consecutive_errors: self.consecutive_errors,
                    });
                    let factor = self.consecutive_errors.min(MAX_BACKOFF_FACTOR);
                    Duration::from_millis(self.config.borrow().error_backoff_ms) * factor
                }
            };

            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = &mut shutdown => {
                    info!("Automation loop stopping");
                    break;
                }
            }
        }

        let in_flight = self.executor.in_flight();
        if in_flight > 0 {
            warn!(in_flight, "Stopped with executions in flight");
        }
    }
}

fn log_tick(report: &TickReport) {
    if report.disabled || report.cooling_down {
        debug!(disabled = report.disabled, cooling_down = report.cooling_down, "Tick skipped");
        return;
    }
    info!(
        candidates = report.candidates,
        filtered = report.filtered,
        executed = report.executed,
        compensated = report.compensated,
        rejected = report.rejected,
        awaiting_approval = report.awaiting_approval,
        escalated = report.escalated,
        "Tick complete"
    );
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
