//! Opportunity executor.
//!
//! Runs one execution attempt as a saga:
//! `Proposed → Validated → Executing → Settled | Compensated | Failed`.
//!
//! All legs are placed concurrently. If any leg fails, every leg that was
//! placed is cancelled again. A cancellation that fails is escalated as
//! `ManualInterventionRequired` and never retried here. A placement that
//! times out is left unresolved (it may or may not exist) and is never
//! retried either; its siblings are compensated.

use chrono::Utc;
use futures::future::join_all;
use rust_decimal::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, RwLock};
use tokio::sync::Semaphore;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::accountant::{AccountantHandle, ExecutionDelta};
use super::events::{EngineEvent, EventBus};
use crate::config::AutomationConfig;
use crate::platforms::{BetRequest, BookmakerGateway, GatewayError, GatewayRegistry};
use crate::strategy::odds::{american_to_decimal, locked_profit, solve_stakes_decimal};
use crate::strategy::risk::{RiskContext, RiskLimits, RiskManager};
use crate::types::{BetPlacement, BetStatus, Opportunity, SettledBet, StakeAllocation, SurebetError};

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutorConfig {
    /// Simultaneous execution attempts.
    pub max_concurrent: usize,
    /// Refuse to start with less time to expiry than this.
    pub hard_stop_secs: i64,
    /// Warn with less time to expiry than this.
    pub warn_secs: i64,
    /// Realised vs expected profit difference that counts as a deviation.
    pub profit_tolerance: f64,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 3,
            hard_stop_secs: 30,
            warn_secs: 120,
            profit_tolerance: 0.01,
        }
    }
}

// ---------------------------------------------------------------------------
// Execution result
// ---------------------------------------------------------------------------

/// Saga stage, for logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SagaStage {
    Proposed,
    Validated,
    Executing,
    Settled,
    Compensated,
    Failed,
}

impl fmt::Display for SagaStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SagaStage::Proposed => "proposed",
            SagaStage::Validated => "validated",
            SagaStage::Executing => "executing",
            SagaStage::Settled => "settled",
            SagaStage::Compensated => "compensated",
            SagaStage::Failed => "failed",
        };
        write!(f, "{s}")
    }
}

/// Every leg placed.
#[derive(Debug, Clone)]
pub struct SettledExecution {
    pub opportunity_id: Uuid,
    pub legs: Vec<BetPlacement>,
    pub allocation: StakeAllocation,
    pub expected_profit: f64,
    /// From the odds and stakes the bookmakers reported.
    pub actual_profit: f64,
    /// Fills differ from the request.
    pub deviated: bool,
}

/// At least one leg failed and every placed leg was cancelled.
#[derive(Debug, Clone)]
pub struct CompensatedExecution {
    pub opportunity_id: Uuid,
    pub legs: Vec<BetPlacement>,
    pub reason: String,
    /// Placements whose outcome is unknown (timed out).
    pub unresolved: Vec<Uuid>,
}

#[derive(Debug, Clone)]
pub enum ExecutionOutcome {
    Settled(SettledExecution),
    Compensated(CompensatedExecution),
}

impl ExecutionOutcome {
    pub fn opportunity_id(&self) -> Uuid {
        match self {
            ExecutionOutcome::Settled(s) => s.opportunity_id,
            ExecutionOutcome::Compensated(c) => c.opportunity_id,
        }
    }

    pub fn legs(&self) -> &[BetPlacement] {
        match self {
            ExecutionOutcome::Settled(s) => &s.legs,
            ExecutionOutcome::Compensated(c) => &c.legs,
        }
    }

    pub fn stage(&self) -> SagaStage {
        match self {
            ExecutionOutcome::Settled(_) => SagaStage::Settled,
            ExecutionOutcome::Compensated(_) => SagaStage::Compensated,
        }
    }

    pub fn is_settled(&self) -> bool {
        matches!(self, ExecutionOutcome::Settled(_))
    }
}

/// One leg ready to place.
struct PreparedLeg {
    placement: BetPlacement,
    gateway: Arc<dyn BookmakerGateway>,
    request: BetRequest,
}

// ---------------------------------------------------------------------------
// Executor
// ---------------------------------------------------------------------------

pub struct Executor {
    gateways: GatewayRegistry,
    risk: RwLock<RiskManager>,
    accountant: AccountantHandle,
    events: EventBus,
    permits: Semaphore,
    config: ExecutorConfig,
}

impl Executor {
    pub fn new(
        gateways: GatewayRegistry,
        risk: RiskManager,
        accountant: AccountantHandle,
        events: EventBus,
        config: ExecutorConfig,
    ) -> Self {
        Self {
            permits: Semaphore::new(config.max_concurrent.max(1)),
            gateways,
            risk: RwLock::new(risk),
            accountant,
            events,
            config,
        }
    }

    pub fn config(&self) -> &ExecutorConfig {
        &self.config
    }

    /// Limits the risk rules currently check against.
    pub fn risk_limits(&self) -> RiskLimits {
        self.risk.read().unwrap_or_else(|e| e.into_inner()).limits().clone()
    }

    /// Carry the risk tier and stake caps of `config` into the risk rules.
    /// Returns true if the limits changed.
    pub fn apply_automation(&self, config: &AutomationConfig) -> bool {
        let mut risk = self.risk.write().unwrap_or_else(|e| e.into_inner());
        let limits = config.overlay(risk.limits());
        if &limits == risk.limits() {
            return false;
        }
        info!(
            risk_level = %limits.risk_level,
            max_stake_per_bet = format!("${:.2}", limits.max_stake_per_bet),
            max_total_stake = format!("${:.2}", limits.max_total_stake),
            "Risk limits updated"
        );
        risk.apply_limits(limits);
        true
    }

    /// Executions currently holding a slot.
    pub fn in_flight(&self) -> usize {
        self.config.max_concurrent.max(1) - self.permits.available_permits()
    }

    /// Run the saga for one opportunity with up to `total_stake` across
    /// all legs.
    ///
    /// Pre-execution rejections (`RiskRejected`, `StaleOpportunity`,
    /// liquidity, balance, gateway) leave nothing placed.
    pub async fn execute_opportunity(
        &self,
        opp: &Opportunity,
        total_stake: f64,
    ) -> Result<ExecutionOutcome, SurebetError> {
        let _permit = self
            .permits
            .acquire()
            .await
            .map_err(|_| SurebetError::Config("executor is shut down".to_string()))?;

        match self.run_saga(opp, total_stake).await {
            Ok(outcome) => Ok(outcome),
            Err(e) => {
                if !e.needs_human() {
                    debug!(opportunity = %opp.id, stage = %SagaStage::Failed, error = %e, "Execution failed");
                    self.events.publish(EngineEvent::ExecutionRejected {
                        opportunity_id: opp.id,
                        reason: e.to_string(),
                    });
                }
                Err(e)
            }
        }
    }

    async fn run_saga(&self, opp: &Opportunity, total_stake: f64) -> Result<ExecutionOutcome, SurebetError> {
        // 1. Proposed
        let total = opp.max_total_stake.map_or(total_stake, |cap| total_stake.min(cap));
        let solution = solve_stakes_decimal(&opp.decimal_odds(), total)?;
        if !solution.is_arbitrage {
            return Err(SurebetError::RiskRejected {
                reason: "odds no longer form an arbitrage".to_string(),
                risk_score: 100.0,
            });
        }
        let mut allocation = solution.allocation();
        debug!(opportunity = %opp.id, stage = %SagaStage::Proposed, total = format!("${:.2}", allocation.total_stake), "Stakes proposed");

        // 2. Validated
        let state = self
            .accountant
            .snapshot()
            .await
            .map_err(|e| SurebetError::Storage(format!("risk ledger unavailable: {e}")))?;
        let validation = self
            .risk
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .validate(&RiskContext {
                opportunity: opp,
                allocation: &allocation,
                state: &state,
                now: Utc::now(),
            });
        if !validation.valid {
            return Err(SurebetError::RiskRejected {
                reason: validation.summary(),
                risk_score: validation.risk_score,
            });
        }
        if let Some(adjusted) = validation.adjusted_allocation {
            info!(
                opportunity = %opp.id,
                from = format!("${:.2}", allocation.total_stake),
                to = format!("${:.2}", adjusted.total_stake),
                "Adopting adjusted stake"
            );
            allocation = adjusted;
        }
        debug!(opportunity = %opp.id, stage = %SagaStage::Validated, risk_score = format!("{:.1}", validation.risk_score), "Risk validated");

        // 3. Freshness, liquidity and balances
        self.check_freshness(opp)?;
        let legs = self.prepare_legs(opp, &allocation)?;
        self.check_balances(&legs).await?;

        // 4. Executing
        info!(
            opportunity = %opp.id,
            stage = %SagaStage::Executing,
            event = %opp.event_name,
            legs = legs.len(),
            total = format!("${:.2}", allocation.total_stake),
            margin = format!("{:.2}%", opp.profit_margin),
            "Placing legs"
        );
        self.events.publish(EngineEvent::ExecutionStarted {
            opportunity_id: opp.id,
            total_stake: allocation.total_stake,
        });

        let (placements, unresolved) = self.place_all(opp.id, legs).await;

        if placements.iter().all(BetPlacement::is_placed) {
            return Ok(self.settle(opp, placements, allocation).await);
        }
        self.compensate(opp, placements, unresolved).await
    }

    fn check_freshness(&self, opp: &Opportunity) -> Result<(), SurebetError> {
        let remaining = opp.time_to_expiry(Utc::now()).num_seconds();
        if remaining < self.config.hard_stop_secs {
            return Err(SurebetError::StaleOpportunity {
                opportunity_id: opp.id,
                reason: format!("{remaining}s to expiry, hard stop at {}s", self.config.hard_stop_secs),
            });
        }
        if remaining < self.config.warn_secs {
            warn!(opportunity = %opp.id, seconds_left = remaining, "Opportunity close to expiry");
        }
        Ok(())
    }

    /// Resolve gateways, round stakes to cents and check quoted limits.
    fn prepare_legs(&self, opp: &Opportunity, allocation: &StakeAllocation) -> Result<Vec<PreparedLeg>, SurebetError> {
        opp.legs
            .iter()
            .zip(&allocation.stakes)
            .map(|(leg, stake)| {
                let gateway = self
                    .gateways
                    .get(&leg.bookmaker)
                    .ok_or_else(|| SurebetError::UnknownBookmaker(leg.bookmaker.clone()))?;

                let rounded = Decimal::from_f64(*stake).unwrap_or_default().round_dp(2);
                let stake_f64 = rounded.to_f64().unwrap_or(0.0);
                if stake_f64 <= 0.0 {
                    return Err(SurebetError::InsufficientLiquidity {
                        bookmaker: leg.bookmaker.clone(),
                        stake: *stake,
                        limit: 0.01,
                    });
                }
                if let Some(min) = leg.min_stake.filter(|min| stake_f64 < *min) {
                    return Err(SurebetError::InsufficientLiquidity {
                        bookmaker: leg.bookmaker.clone(),
                        stake: stake_f64,
                        limit: min,
                    });
                }
                if let Some(max) = leg.max_stake.filter(|max| stake_f64 > *max) {
                    return Err(SurebetError::InsufficientLiquidity {
                        bookmaker: leg.bookmaker.clone(),
                        stake: stake_f64,
                        limit: max,
                    });
                }

                let placement = BetPlacement::pending(opp.id, leg, stake_f64);
                let request = BetRequest {
                    game_id: leg.game_id.clone(),
                    market_id: leg.market_id.clone(),
                    selection: leg.selection.clone(),
                    odds: leg.american_odds,
                    stake: rounded,
                    reference: placement.id.to_string(),
                };
                Ok(PreparedLeg {
                    placement,
                    gateway,
                    request,
                })
            })
            .collect()
    }

    /// Every bookmaker must be reachable and hold enough for its legs.
    async fn check_balances(&self, legs: &[PreparedLeg]) -> Result<(), SurebetError> {
        let mut needed: BTreeMap<&str, (Arc<dyn BookmakerGateway>, f64)> = BTreeMap::new();
        for leg in legs {
            let entry = needed
                .entry(leg.placement.bookmaker.as_str())
                .or_insert_with(|| (Arc::clone(&leg.gateway), 0.0));
            entry.1 += leg.placement.requested_stake;
        }

        let checks = needed.into_iter().map(|(bookmaker, (gateway, amount))| async move {
            (bookmaker, amount, gateway.get_account_info().await)
        });

        for (bookmaker, amount, result) in join_all(checks).await {
            let account = result.map_err(|source| SurebetError::Gateway {
                bookmaker: bookmaker.to_string(),
                source,
            })?;
            let available = account.balance.to_f64().unwrap_or(0.0);
            if available + 1e-9 < amount {
                return Err(SurebetError::InsufficientBalance {
                    bookmaker: bookmaker.to_string(),
                    needed: amount,
                    available,
                });
            }
        }
        Ok(())
    }

    /// Fire every leg at once. Returns the leg records and the ids of
    /// placements that timed out.
    async fn place_all(&self, opportunity_id: Uuid, legs: Vec<PreparedLeg>) -> (Vec<BetPlacement>, Vec<Uuid>) {
        let results = join_all(legs.iter().map(|leg| leg.gateway.place_bet(&leg.request))).await;

        let mut unresolved = Vec::new();
        let placements = legs
            .into_iter()
            .zip(results)
            .map(|(leg, result)| {
                let mut placement = leg.placement;
                match result {
                    Ok(resp) if resp.success => {
                        placement.bet_id = resp.bet_id;
                        placement.transaction_id = resp.transaction_id;
                        placement.actual_odds = resp.actual_odds;
                        placement.actual_stake = resp.actual_stake.and_then(|s| s.to_f64());
                        placement.transition(BetStatus::Placed);
                        info!(leg = %placement, "Leg placed");
                    }
                    Ok(resp) => {
                        placement.error = resp.error;
                        placement.error_code = resp.error_code;
                        placement.transition(BetStatus::Failed);
                        warn!(
                            leg = %placement,
                            code = placement.error_code.as_deref().unwrap_or("-"),
                            error = placement.error.as_deref().unwrap_or("-"),
                            "Leg rejected"
                        );
                    }
                    Err(e) => {
                        placement.error = Some(e.to_string());
                        placement.error_code = Some(e.code().to_string());
                        placement.transition(BetStatus::Failed);
                        if e.is_timeout() {
                            error!(leg = %placement, "Leg placement timed out, state unknown");
                            unresolved.push(placement.id);
                            self.events.publish(EngineEvent::PlacementUnknown {
                                opportunity_id,
                                bookmaker: placement.bookmaker.clone(),
                                placement_id: placement.id,
                            });
                        } else {
                            warn!(leg = %placement, error = %e, "Leg placement failed");
                        }
                    }
                }
                placement
            })
            .collect();

        (placements, unresolved)
    }

    async fn settle(&self, opp: &Opportunity, legs: Vec<BetPlacement>, allocation: StakeAllocation) -> ExecutionOutcome {
        let stakes: Vec<f64> = legs.iter().map(BetPlacement::effective_stake).collect();
        let decimals: Vec<f64> = legs
            .iter()
            .zip(&opp.legs)
            .map(|(p, leg)| american_to_decimal(p.effective_odds()).unwrap_or(leg.decimal_odds))
            .collect();
        let actual_profit = locked_profit(&stakes, &decimals);
        // Against the cent-rounded request, not the unrounded solution.
        let requested: Vec<f64> = legs.iter().map(|p| p.requested_stake).collect();
        let quoted: Vec<f64> = opp.legs.iter().map(|l| l.decimal_odds).collect();
        let expected_profit = locked_profit(&requested, &quoted);

        let fills_differ = legs.iter().any(|p| {
            (p.effective_odds() - p.requested_odds).abs() > f64::EPSILON
                || (p.effective_stake() - p.requested_stake).abs() >= 0.01
        });
        let deviated = fills_differ || (actual_profit - expected_profit).abs() > self.config.profit_tolerance.max(0.01);

        if deviated {
            warn!(
                opportunity = %opp.id,
                expected = format!("${:.2}", expected_profit),
                actual = format!("${:.2}", actual_profit),
                "Fills differ from request"
            );
            self.events.publish(EngineEvent::FillDeviation {
                opportunity_id: opp.id,
                expected_profit,
                actual_profit,
            });
        }

        let committed: f64 = stakes.iter().sum();
        self.book(ExecutionDelta {
            opportunity_id: opp.id,
            committed,
            compensated: false,
            expected_profit: actual_profit,
        })
        .await;
        // Every outcome is covered, so the profit is locked in at placement.
        self.record(SettledBet {
            stake: committed,
            decimal_odds: if committed > 0.0 {
                (committed + actual_profit) / committed
            } else {
                1.0
            },
            profit: actual_profit,
            settled_at: Utc::now(),
        })
        .await;

        info!(
            opportunity = %opp.id,
            stage = %SagaStage::Settled,
            committed = format!("${:.2}", committed),
            profit = format!("${:.2}", actual_profit),
            "Arbitrage executed"
        );
        self.events.publish(EngineEvent::ExecutionSettled {
            opportunity_id: opp.id,
            expected_profit,
            actual_profit,
        });

        ExecutionOutcome::Settled(SettledExecution {
            opportunity_id: opp.id,
            legs,
            allocation,
            expected_profit,
            actual_profit,
            deviated,
        })
    }

    /// Cancel every placed leg after a sibling failed.
    async fn compensate(
        &self,
        opp: &Opportunity,
        mut legs: Vec<BetPlacement>,
        unresolved: Vec<Uuid>,
    ) -> Result<ExecutionOutcome, SurebetError> {
        let reason = legs
            .iter()
            .filter(|p| p.status == BetStatus::Failed)
            .map(|p| {
                format!(
                    "{} {}: {}",
                    p.bookmaker,
                    p.error_code.as_deref().unwrap_or("ERROR"),
                    p.error.as_deref().unwrap_or("failed")
                )
            })
            .collect::<Vec<_>>()
            .join("; ");

        // Nothing placed and nothing unknown: a plain failure.
        if unresolved.is_empty() && !legs.iter().any(BetPlacement::is_placed) {
            let first = legs.iter().find(|p| p.status == BetStatus::Failed);
            return Err(SurebetError::Gateway {
                bookmaker: first.map(|p| p.bookmaker.clone()).unwrap_or_default(),
                source: GatewayError::Rejected {
                    code: first
                        .and_then(|p| p.error_code.clone())
                        .unwrap_or_else(|| "ERROR".to_string()),
                    message: reason,
                },
            });
        }

        warn!(opportunity = %opp.id, reason = %reason, "Leg failed, compensating placed legs");

        let cancellations = legs.iter().enumerate().filter(|(_, p)| p.is_placed()).map(|(i, p)| {
            let gateway = self.gateways.get(&p.bookmaker);
            let bet_id = p.bet_id.clone();
            async move {
                let result = match (gateway, bet_id) {
                    (Some(gateway), Some(bet_id)) => gateway.cancel_bet(&bet_id).await,
                    (None, _) => Err(GatewayError::Other(anyhow::anyhow!("gateway no longer registered"))),
                    (_, None) => Err(GatewayError::Other(anyhow::anyhow!("placed without a bet id"))),
                };
                (i, result)
            }
        });
        let results = join_all(cancellations).await;

        let mut failures = Vec::new();
        for (i, result) in results {
            let leg = &mut legs[i];
            match result {
                Ok(true) => {
                    leg.transition(BetStatus::Cancelled);
                    info!(leg = %leg, "Leg cancelled");
                }
                Ok(false) => {
                    error!(leg = %leg, "Bookmaker refused cancellation");
                    failures.push(format!("{} refused to cancel {}", leg.bookmaker, leg.bet_id.as_deref().unwrap_or("?")));
                }
                Err(e) => {
                    error!(leg = %leg, error = %e, "Cancellation failed");
                    failures.push(format!("{} cancel failed: {e}", leg.bookmaker));
                }
            }
        }

        let exposed: f64 = legs.iter().filter(|p| p.is_placed()).map(BetPlacement::effective_stake).sum();
        self.book(ExecutionDelta {
            opportunity_id: opp.id,
            committed: exposed,
            compensated: true,
            expected_profit: 0.0,
        })
        .await;

        if !failures.is_empty() {
            let reason = format!("compensation failed after [{reason}]: {}", failures.join("; "));
            error!(
                opportunity = %opp.id,
                exposed = format!("${:.2}", exposed),
                reason = %reason,
                "MANUAL INTERVENTION REQUIRED"
            );
            self.events.publish(EngineEvent::ManualInterventionRequired {
                opportunity_id: opp.id,
                reason: reason.clone(),
                legs: legs.clone(),
            });
            return Err(SurebetError::ManualInterventionRequired {
                opportunity_id: opp.id,
                reason,
                legs,
            });
        }

        info!(opportunity = %opp.id, stage = %SagaStage::Compensated, unresolved = unresolved.len(), "Execution compensated");
        self.events.publish(EngineEvent::ExecutionCompensated {
            opportunity_id: opp.id,
            reason: reason.clone(),
        });

        Ok(ExecutionOutcome::Compensated(CompensatedExecution {
            opportunity_id: opp.id,
            legs,
            reason,
            unresolved,
        }))
    }

    async fn book(&self, delta: ExecutionDelta) {
        if let Err(e) = self.accountant.apply_execution(delta).await {
            error!(error = %e, "Failed to book execution with accountant");
        }
    }

    async fn record(&self, bet: SettledBet) {
        if let Err(e) = self.accountant.record_settlement(bet).await {
            error!(error = %e, "Failed to record settlement with accountant");
        }
    }

    /// Query the bookmaker for a placed leg's current status.
    pub async fn refresh_status(&self, placement: &BetPlacement) -> Result<String, SurebetError> {
        let gateway = self
            .gateways
            .get(&placement.bookmaker)
            .ok_or_else(|| SurebetError::UnknownBookmaker(placement.bookmaker.clone()))?;
        let bet_id = placement.bet_id.as_deref().ok_or_else(|| SurebetError::Gateway {
            bookmaker: placement.bookmaker.clone(),
            source: GatewayError::Rejected {
                code: "NO_BET_ID".to_string(),
                message: format!("placement {} has no bet id", placement.id),
            },
        })?;
        let status = gateway
            .get_bet_status(bet_id)
            .await
            .map_err(|source| SurebetError::Gateway {
                bookmaker: placement.bookmaker.clone(),
                source,
            })?;
        debug!(bet_id, status = %status, "Bet status refreshed");
        Ok(status)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
