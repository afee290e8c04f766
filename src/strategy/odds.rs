//! Odds math: American/decimal conversion, implied probability, and the
//! N-way arbitrage stake solver.
//!
//! Everything here is pure and synchronous so it can run on the scanner
//! worker pool as well as inside the executor.

use serde::{Deserialize, Serialize};

use crate::types::{StakeAllocation, SurebetError};

/// Tolerance used when comparing stake sums and payouts.
pub const STAKE_EPSILON: f64 = 1e-6;

// ---------------------------------------------------------------------------
// Conversions
// ---------------------------------------------------------------------------

/// Convert American odds to decimal odds.
///
/// `+150 → 2.5`, `-200 → 1.5`. Zero, NaN and infinite inputs are rejected,
/// as are values strictly between -100 and +100 which no bookmaker quotes.
pub fn american_to_decimal(odds: f64) -> Result<f64, SurebetError> {
    if !odds.is_finite() || odds == 0.0 {
        return Err(SurebetError::InvalidOdds(format!(
            "American odds must be finite and non-zero, got {odds}"
        )));
    }
    if odds.abs() < 100.0 {
        return Err(SurebetError::InvalidOdds(format!(
            "American odds must be at least 100 in magnitude, got {odds}"
        )));
    }
    if odds > 0.0 {
        Ok(odds / 100.0 + 1.0)
    } else {
        Ok(100.0 / odds.abs() + 1.0)
    }
}

/// Convert decimal odds back to American odds.
///
/// Even money and above maps to positive American odds, shorter prices to
/// negative ones. Decimal odds at or below 1.0 carry no payout and are
/// rejected.
pub fn decimal_to_american(decimal: f64) -> Result<f64, SurebetError> {
    if !decimal.is_finite() || decimal <= 1.0 {
        return Err(SurebetError::InvalidOdds(format!(
            "Decimal odds must be finite and greater than 1.0, got {decimal}"
        )));
    }
    if decimal >= 2.0 {
        Ok((decimal - 1.0) * 100.0)
    } else {
        Ok(-100.0 / (decimal - 1.0))
    }
}

/// Implied probability of American odds, as a percentage (0–100).
pub fn implied_probability(odds: f64) -> Result<f64, SurebetError> {
    Ok(100.0 / american_to_decimal(odds)?)
}

// ---------------------------------------------------------------------------
// Stake solver
// ---------------------------------------------------------------------------

/// Result of solving stakes across N mutually exclusive outcomes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StakeSolution {
    pub is_arbitrage: bool,
    /// Stake per leg; all zero when there is no arbitrage
    pub stakes: Vec<f64>,
    /// Payout per leg if that leg wins
    pub payouts: Vec<f64>,
    /// `min(payout) - total_stake`. For a non-arbitrage this is the
    /// (non-positive) return a proportional split would have locked in.
    pub guaranteed_profit: f64,
    /// `(1 - T) / T * 100` where `T` is the sum of implied probabilities
    pub profit_margin: f64,
    /// `T`, as a fraction
    pub implied_total: f64,
    pub total_stake: f64,
}

impl StakeSolution {
    /// View the solution as a stake allocation for the executor.
    pub fn allocation(&self) -> StakeAllocation {
        StakeAllocation {
            stakes: self.stakes.clone(),
            payouts: self.payouts.clone(),
            total_stake: self.stakes.iter().sum(),
            guaranteed_profit: self.guaranteed_profit,
            profit_margin: self.profit_margin,
        }
    }
}

/// Solve stakes for a set of American odds, one per outcome.
pub fn solve_stakes(american_odds: &[f64], total_stake: f64) -> Result<StakeSolution, SurebetError> {
    let decimals = american_odds
        .iter()
        .map(|o| american_to_decimal(*o))
        .collect::<Result<Vec<_>, _>>()?;
    solve_stakes_decimal(&decimals, total_stake)
}

/// Solve stakes for a set of decimal odds, one per outcome.
///
/// With `p_i = 1/d_i` and `T = Σp_i`, an arbitrage exists iff `T < 1`.
/// Stakes are split proportionally to `p_i / T`, which equalises every
/// payout at `total_stake / T`.
pub fn solve_stakes_decimal(decimal_odds: &[f64], total_stake: f64) -> Result<StakeSolution, SurebetError> {
    if decimal_odds.len() < 2 {
        return Err(SurebetError::InvalidOdds(format!(
            "At least two legs are required, got {}",
            decimal_odds.len()
        )));
    }
    if !total_stake.is_finite() || total_stake <= 0.0 {
        return Err(SurebetError::InvalidOdds(format!(
            "Total stake must be positive, got {total_stake}"
        )));
    }
    if let Some(bad) = decimal_odds.iter().find(|d| !d.is_finite() || **d <= 1.0) {
        return Err(SurebetError::InvalidOdds(format!(
            "Decimal odds must be greater than 1.0, got {bad}"
        )));
    }

    let probs: Vec<f64> = decimal_odds.iter().map(|d| 1.0 / d).collect();
    let implied_total: f64 = probs.iter().sum();
    let profit_margin = (1.0 - implied_total) / implied_total * 100.0;

    if implied_total >= 1.0 {
        return Ok(StakeSolution {
            is_arbitrage: false,
            stakes: vec![0.0; decimal_odds.len()],
            payouts: vec![0.0; decimal_odds.len()],
            guaranteed_profit: total_stake / implied_total - total_stake,
            profit_margin,
            implied_total,
            total_stake,
        });
    }

    let stakes: Vec<f64> = probs
        .iter()
        .map(|p| total_stake * p / implied_total)
        .collect();
    let payouts: Vec<f64> = stakes
        .iter()
        .zip(decimal_odds)
        .map(|(s, d)| s * d)
        .collect();
    let min_payout = payouts.iter().copied().fold(f64::INFINITY, f64::min);

    Ok(StakeSolution {
        is_arbitrage: true,
        stakes,
        payouts,
        guaranteed_profit: min_payout - total_stake,
        profit_margin,
        implied_total,
        total_stake,
    })
}

/// Guaranteed profit of an already-fixed set of stakes at the given
/// decimal odds: the worst-case payout minus everything staked.
pub fn locked_profit(stakes: &[f64], decimal_odds: &[f64]) -> f64 {
    let total: f64 = stakes.iter().sum();
    let min_payout = stakes
        .iter()
        .zip(decimal_odds)
        .map(|(s, d)| s * d)
        .fold(f64::INFINITY, f64::min);
    if min_payout.is_finite() {
        min_payout - total
    } else {
        -total
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
