//! Accountant — single writer for bankroll and usage counters.
//!
//! The accountant task owns the `RiskState`. Executors send it deltas
//! after an execution reaches a terminal outcome, settlements are
//! recorded as they come in, and everything else reads snapshots.
//! Updates are applied one message at a time, so concurrent executions
//! never lose an update.

use anyhow::{anyhow, Result};
use chrono::Utc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::types::{RiskState, SettledBet};

const COMMAND_BUFFER: usize = 64;

// ---------------------------------------------------------------------------
// Messages
// ---------------------------------------------------------------------------

/// What one finished execution did to the books.
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionDelta {
    pub opportunity_id: Uuid,
    /// Stake left committed at bookmakers after the attempt.
    pub committed: f64,
    /// True when the attempt ended by cancelling its placed legs.
    pub compensated: bool,
    pub expected_profit: f64,
}

#[derive(Debug)]
pub enum LedgerCommand {
    ApplyExecution(ExecutionDelta),
    RecordSettlement(SettledBet),
    Snapshot(oneshot::Sender<RiskState>),
    Shutdown,
}

// ---------------------------------------------------------------------------
// Actor
// ---------------------------------------------------------------------------

pub struct Accountant {
    state: RiskState,
    rx: mpsc::Receiver<LedgerCommand>,
}

impl Accountant {
    /// Start the accountant task. The join handle yields the final state
    /// once the task stops, for persistence.
    pub fn spawn(state: RiskState) -> (AccountantHandle, JoinHandle<RiskState>) {
        let (tx, rx) = mpsc::channel(COMMAND_BUFFER);
        let actor = Self { state, rx };
        let task = tokio::spawn(actor.run());
        (AccountantHandle { tx }, task)
    }

    async fn run(mut self) -> RiskState {
        info!(state = %self.state, "Accountant started");
        while let Some(cmd) = self.rx.recv().await {
            if matches!(cmd, LedgerCommand::Shutdown) {
                break;
            }
            self.handle(cmd);
        }
        info!(state = %self.state, "Accountant stopped");
        self.state
    }

    fn handle(&mut self, cmd: LedgerCommand) {
        self.state.roll_windows(Utc::now());
        match cmd {
            LedgerCommand::ApplyExecution(delta) => self.apply_execution(delta),
            LedgerCommand::RecordSettlement(bet) => self.record_settlement(bet),
            LedgerCommand::Snapshot(reply) => {
                if reply.send(self.state.clone()).is_err() {
                    debug!("Snapshot requester went away");
                }
            }
            LedgerCommand::Shutdown => {}
        }
    }

    fn apply_execution(&mut self, delta: ExecutionDelta) {
        self.state.record_usage(delta.committed);
        if delta.compensated {
            self.state.compensations += 1;
        } else {
            self.state.executions += 1;
        }

        info!(
            opportunity = %delta.opportunity_id,
            committed = format!("${:.2}", delta.committed),
            expected_profit = format!("${:.2}", delta.expected_profit),
            compensated = delta.compensated,
            daily_used = format!("${:.2}", self.state.daily_used),
            "Execution booked"
        );
    }

    fn record_settlement(&mut self, bet: SettledBet) {
        let profit = bet.profit;
        self.state.record_settlement(bet);

        if self.state.current_bankroll < self.state.min_bankroll {
            warn!(
                bankroll = format!("${:.2}", self.state.current_bankroll),
                min_bankroll = format!("${:.2}", self.state.min_bankroll),
                "Bankroll below minimum"
            );
        }

        info!(
            profit = format!("${:.2}", profit),
            bankroll = format!("${:.2}", self.state.current_bankroll),
            consecutive_losses = self.state.consecutive_losses,
            drawdown = format!("{:.1}%", self.state.drawdown() * 100.0),
            "Settlement recorded"
        );
    }
}

// ---------------------------------------------------------------------------
// Handle
// ---------------------------------------------------------------------------

/// Cloneable sender side of the accountant.
#[derive(Clone)]
pub struct AccountantHandle {
    tx: mpsc::Sender<LedgerCommand>,
}

impl AccountantHandle {
    pub async fn apply_execution(&self, delta: ExecutionDelta) -> Result<()> {
        self.send(LedgerCommand::ApplyExecution(delta)).await
    }

    pub async fn record_settlement(&self, bet: SettledBet) -> Result<()> {
        self.send(LedgerCommand::RecordSettlement(bet)).await
    }

    /// Current state, with usage windows rolled to now.
    pub async fn snapshot(&self) -> Result<RiskState> {
        let (tx, rx) = oneshot::channel();
        self.send(LedgerCommand::Snapshot(tx)).await?;
        rx.await.map_err(|_| anyhow!("accountant dropped snapshot request"))
    }

    pub async fn shutdown(&self) -> Result<()> {
        self.send(LedgerCommand::Shutdown).await
    }

    async fn send(&self, cmd: LedgerCommand) -> Result<()> {
        self.tx
            .send(cmd)
            .await
            .map_err(|_| anyhow!("accountant is not running"))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
