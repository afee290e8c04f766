//! Engine events for human-facing subscribers.
//!
//! Execution results are returned directly from the executor; this
//! stream carries progress, approval requests and escalations for UIs
//! and alerting.

use serde::Serialize;
use tokio::sync::broadcast;
use tracing::trace;
use uuid::Uuid;

use crate::types::{BetPlacement, Opportunity};

pub const DEFAULT_EVENT_CAPACITY: usize = 256;

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EngineEvent {
    ScanProgress {
        correlation_id: Uuid,
        processed: usize,
        total: usize,
    },
    ScanCompleted {
        markets: usize,
        opportunities: usize,
        elapsed_ms: u64,
    },
    /// An opportunity passed the filters but needs a human decision.
    ApprovalRequired { opportunity: Box<Opportunity> },
    ExecutionStarted { opportunity_id: Uuid, total_stake: f64 },
    ExecutionSettled {
        opportunity_id: Uuid,
        expected_profit: f64,
        actual_profit: f64,
    },
    ExecutionCompensated { opportunity_id: Uuid, reason: String },
    ExecutionRejected { opportunity_id: Uuid, reason: String },
    /// Filled prices or stakes differ from the request.
    FillDeviation {
        opportunity_id: Uuid,
        expected_profit: f64,
        actual_profit: f64,
    },
    /// A placement timed out; whether the bet exists is unknown.
    PlacementUnknown {
        opportunity_id: Uuid,
        bookmaker: String,
        placement_id: Uuid,
    },
    ManualInterventionRequired {
        opportunity_id: Uuid,
        reason: String,
        legs: Vec<BetPlacement>,
    },
    TickFailed { error: String, consecutive_errors: u32 },
}

/// Broadcast fan-out of engine events. Publishing never blocks; slow
/// subscribers lag and lose the oldest events.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<EngineEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.tx.subscribe()
    }

    pub fn publish(&self, event: EngineEvent) {
        if self.tx.send(event).is_err() {
            trace!("No event subscribers");
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_CAPACITY)
    }
}
