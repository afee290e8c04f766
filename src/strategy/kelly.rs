//! Kelly criterion position sizing.
//!
//! Estimates the edge from the settled bet history (win rate and average
//! net odds) and turns it into a fractional-Kelly stake ceiling with a
//! configurable multiplier and cap.

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::types::SettledBet;

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Kelly sizing configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct KellyConfig {
    /// Fractional Kelly multiplier (0.25 = quarter-Kelly). Lower = more conservative.
    pub multiplier: f64,
    /// Maximum stake as a fraction of bankroll.
    pub max_bet_pct: f64,
    /// Settled bets required before the history is trusted.
    pub min_history: usize,
}

impl Default for KellyConfig {
    fn default() -> Self {
        Self {
            multiplier: 0.25,  // Quarter-Kelly: conservative
            max_bet_pct: 0.10, // Never above the aggressive tier
            min_history: 10,
        }
    }
}

// ---------------------------------------------------------------------------
// Kelly calculator
// ---------------------------------------------------------------------------

/// Kelly sizing derived from history.
#[derive(Debug, Clone, PartialEq)]
pub struct KellySizing {
    pub win_rate: f64,
    /// Average net odds `b = decimal - 1`
    pub avg_net_odds: f64,
    /// Raw Kelly fraction (may be negative)
    pub kelly_fraction: f64,
    /// After multiplier + cap, never negative
    pub bet_fraction: f64,
    /// `bet_fraction * bankroll`
    pub max_stake: f64,
}

#[derive(Debug, Clone, Default)]
pub struct KellyCalculator {
    config: KellyConfig,
}

impl KellyCalculator {
    pub fn new(config: KellyConfig) -> Self {
        Self { config }
    }

    /// Access the Kelly configuration.
    pub fn config(&self) -> &KellyConfig {
        &self.config
    }

    /// Size from the settled history.
    ///
    /// Kelly formula: f* = (bp - q) / b
    /// where:
    ///   b = average net odds
    ///   p = historical win rate
    ///   q = 1 - p
    ///
    /// Returns `None` until `min_history` bets have settled, or when the
    /// bankroll or odds are degenerate.
    pub fn size_from_history<'a, I>(&self, history: I, bankroll: f64) -> Option<KellySizing>
    where
        I: IntoIterator<Item = &'a SettledBet>,
    {
        if bankroll <= 0.0 {
            return None;
        }

        let (mut n, mut wins, mut net_odds_sum) = (0usize, 0usize, 0.0);
        for bet in history {
            n += 1;
            if bet.won() {
                wins += 1;
            }
            net_odds_sum += bet.decimal_odds - 1.0;
        }
        if n < self.config.min_history.max(1) {
            return None;
        }

        let b = net_odds_sum / n as f64;
        if b <= 0.0 {
            return None;
        }
        let p = wins as f64 / n as f64;
        let q = 1.0 - p;
        let kelly = (b * p - q) / b;

        let bet_fraction = (kelly * self.config.multiplier).clamp(0.0, self.config.max_bet_pct);
        let max_stake = bet_fraction * bankroll;

        debug!(
            bets = n,
            win_rate = format!("{:.1}%", p * 100.0),
            raw_kelly = format!("{:.2}%", kelly * 100.0),
            fractional = format!("{:.2}%", bet_fraction * 100.0),
            max_stake = format!("${:.2}", max_stake),
            "Kelly sized from history"
        );

        Some(KellySizing {
            win_rate: p,
            avg_net_odds: b,
            kelly_fraction: kelly,
            bet_fraction,
            max_stake,
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
