//! Baseline risk rules.

use super::kelly::KellyCalculator;
use super::odds::STAKE_EPSILON;
use super::risk::{Recommendation, RiskContext, RiskLimits, RiskRule, RuleCheck, Severity};

/// Every baseline rule, configured from `limits`.
pub fn baseline(limits: &RiskLimits) -> Vec<Box<dyn RiskRule>> {
    vec![
        Box::new(StakeLimit {
            max_stake_per_bet: limits.max_stake_per_bet,
            max_total_stake: limits.max_total_stake,
        }),
        Box::new(BankrollPercentage {
            fraction: limits.risk_level.bankroll_fraction(),
        }),
        Box::new(DailyVolume {
            pct: limits.daily_volume_pct,
        }),
        Box::new(UsageLimits),
        Box::new(ConsecutiveLosses {
            limit: limits.risk_level.loss_streak_limit(),
        }),
        Box::new(MarginSanity {
            max_margin: limits.max_sane_margin,
            min_confidence: limits.min_confidence,
        }),
        Box::new(TimeToExpiry {
            reject_below_secs: limits.min_time_to_expiry_secs,
            warn_below_secs: limits.warn_time_to_expiry_secs,
        }),
        Box::new(KellySizingRule {
            calculator: KellyCalculator::new(limits.kelly.clone()),
        }),
    ]
}

/// Ratio as a 0–100 risk score.
fn ratio_score(used: f64, limit: f64) -> f64 {
    if limit <= 0.0 {
        100.0
    } else {
        (used / limit * 100.0).clamp(0.0, 100.0)
    }
}

// ---------------------------------------------------------------------------
// Stake limits
// ---------------------------------------------------------------------------

/// Absolute cap on any single leg and on the opportunity total.
pub struct StakeLimit {
    pub max_stake_per_bet: f64,
    pub max_total_stake: f64,
}

impl RiskRule for StakeLimit {
    fn id(&self) -> &str {
        "stake_limit"
    }

    fn severity(&self) -> Severity {
        Severity::Critical
    }

    fn check(&self, ctx: &RiskContext<'_>) -> RuleCheck {
        let total = ctx.allocation.total_stake;
        let max_leg = ctx.allocation.max_leg_stake();
        let score = ratio_score(max_leg, self.max_stake_per_bet)
            .max(ratio_score(total, self.max_total_stake));

        if max_leg <= self.max_stake_per_bet + STAKE_EPSILON && total <= self.max_total_stake + STAKE_EPSILON {
            return RuleCheck::pass(score * 0.5, "Stake within limits");
        }

        // Largest total keeping both the biggest leg and the total in bounds
        let by_leg = if max_leg > 0.0 {
            total * self.max_stake_per_bet / max_leg
        } else {
            total
        };
        RuleCheck::reduce_to(
            100.0,
            format!(
                "Stake ${total:.2} (largest leg ${max_leg:.2}) exceeds limits ${:.2}/${:.2}",
                self.max_total_stake, self.max_stake_per_bet
            ),
            by_leg.min(self.max_total_stake),
        )
    }
}

/// Stake as a fraction of bankroll, by risk tier. Also refuses to trade
/// once the bankroll is below its floor.
pub struct BankrollPercentage {
    pub fraction: f64,
}

impl RiskRule for BankrollPercentage {
    fn id(&self) -> &str {
        "bankroll_percentage"
    }

    fn severity(&self) -> Severity {
        Severity::High
    }

    fn check(&self, ctx: &RiskContext<'_>) -> RuleCheck {
        let bankroll = ctx.state.current_bankroll;
        if bankroll < ctx.state.min_bankroll || bankroll <= 0.0 {
            return RuleCheck::fail(
                100.0,
                format!(
                    "Bankroll ${bankroll:.2} below minimum ${:.2}",
                    ctx.state.min_bankroll
                ),
                Recommendation::Reject,
            );
        }

        let cap = bankroll * self.fraction;
        let total = ctx.allocation.total_stake;
        if total <= cap + STAKE_EPSILON {
            return RuleCheck::pass(ratio_score(total, cap) * 0.6, "Within bankroll fraction");
        }
        RuleCheck::reduce_to(
            90.0,
            format!(
                "Stake ${total:.2} is {:.1}% of bankroll, limit {:.0}%",
                total / bankroll * 100.0,
                self.fraction * 100.0
            ),
            cap,
        )
    }
}

// ---------------------------------------------------------------------------
// Volume
// ---------------------------------------------------------------------------

/// Rolling daily volume capped at a fraction of bankroll.
pub struct DailyVolume {
    pub pct: f64,
}

impl RiskRule for DailyVolume {
    fn id(&self) -> &str {
        "daily_volume"
    }

    fn severity(&self) -> Severity {
        Severity::High
    }

    fn check(&self, ctx: &RiskContext<'_>) -> RuleCheck {
        let cap = ctx.state.current_bankroll * self.pct;
        let used = ctx.state.daily_used;
        let total = ctx.allocation.total_stake;

        if used + total <= cap + STAKE_EPSILON {
            return RuleCheck::pass(ratio_score(used + total, cap) * 0.5, "Within daily volume");
        }
        let remaining = cap - used;
        let message = format!(
            "Daily volume ${:.2} + ${total:.2} exceeds ${cap:.2}",
            used
        );
        if remaining > 0.0 {
            RuleCheck::reduce_to(85.0, message, remaining)
        } else {
            RuleCheck::fail(100.0, message, Recommendation::Reject)
        }
    }
}

/// Daily/weekly/monthly configured usage limits.
pub struct UsageLimits;

impl RiskRule for UsageLimits {
    fn id(&self) -> &str {
        "usage_limits"
    }

    fn severity(&self) -> Severity {
        Severity::High
    }

    fn check(&self, ctx: &RiskContext<'_>) -> RuleCheck {
        let s = ctx.state;
        let total = ctx.allocation.total_stake;
        let remaining = s.remaining_usage();

        let score = ratio_score(s.daily_used + total, s.daily_limit)
            .max(ratio_score(s.weekly_used + total, s.weekly_limit))
            .max(ratio_score(s.monthly_used + total, s.monthly_limit));

        if total <= remaining + STAKE_EPSILON {
            return RuleCheck::pass(score * 0.5, "Within usage limits");
        }
        let message = format!("Stake ${total:.2} exceeds remaining usage ${remaining:.2}");
        if remaining > 0.0 {
            RuleCheck::reduce_to(score, message, remaining)
        } else {
            RuleCheck::fail(100.0, message, Recommendation::Reject)
        }
    }
}

// ---------------------------------------------------------------------------
// Circuit breaker
// ---------------------------------------------------------------------------

pub struct ConsecutiveLosses {
    pub limit: u32,
}

impl RiskRule for ConsecutiveLosses {
    fn id(&self) -> &str {
        "consecutive_losses"
    }

    fn severity(&self) -> Severity {
        Severity::Critical
    }

    fn check(&self, ctx: &RiskContext<'_>) -> RuleCheck {
        let losses = ctx.state.consecutive_losses;
        let score = ratio_score(losses as f64, self.limit as f64);
        if losses < self.limit {
            RuleCheck::pass(score, format!("{losses} consecutive losses"))
        } else {
            RuleCheck::fail(
                100.0,
                format!("Circuit breaker: {losses} consecutive losses (limit {})", self.limit),
                Recommendation::Reject,
            )
        }
    }
}

// ---------------------------------------------------------------------------
// Opportunity quality
// ---------------------------------------------------------------------------

/// Implausibly large margins usually mean a stale line; low-confidence
/// opportunities are rejected outright.
pub struct MarginSanity {
    pub max_margin: f64,
    pub min_confidence: f64,
}

impl RiskRule for MarginSanity {
    fn id(&self) -> &str {
        "margin_sanity"
    }

    fn severity(&self) -> Severity {
        Severity::High
    }

    fn check(&self, ctx: &RiskContext<'_>) -> RuleCheck {
        let opp = ctx.opportunity;
        if opp.confidence < self.min_confidence {
            return RuleCheck::fail(
                90.0,
                format!(
                    "Confidence {:.0}% below {:.0}%",
                    opp.confidence * 100.0,
                    self.min_confidence * 100.0
                ),
                Recommendation::Reject,
            );
        }
        if opp.profit_margin > self.max_margin {
            return RuleCheck::fail(
                75.0,
                format!(
                    "Margin {:.2}% above {:.0}%, odds are likely stale",
                    opp.profit_margin, self.max_margin
                ),
                Recommendation::ManualReview,
            );
        }
        RuleCheck::pass((1.0 - opp.confidence) * 100.0, "Margin and confidence plausible")
    }
}

pub struct TimeToExpiry {
    pub reject_below_secs: i64,
    pub warn_below_secs: i64,
}

impl RiskRule for TimeToExpiry {
    fn id(&self) -> &str {
        "time_to_expiry"
    }

    fn severity(&self) -> Severity {
        Severity::High
    }

    fn check(&self, ctx: &RiskContext<'_>) -> RuleCheck {
        let left = ctx.opportunity.time_to_expiry(ctx.now).num_seconds();
        if left < self.reject_below_secs {
            RuleCheck::fail(100.0, format!("Only {left}s to expiry"), Recommendation::Reject)
        } else if left < self.warn_below_secs {
            RuleCheck::pass(50.0, format!("Warning: {left}s to expiry"))
        } else {
            RuleCheck::pass(0.0, format!("{left}s to expiry"))
        }
    }
}

// ---------------------------------------------------------------------------
// Kelly
// ---------------------------------------------------------------------------

/// Caps the total at the fractional-Kelly stake once enough bets settled.
pub struct KellySizingRule {
    pub calculator: KellyCalculator,
}

impl RiskRule for KellySizingRule {
    fn id(&self) -> &str {
        "kelly_sizing"
    }

    fn severity(&self) -> Severity {
        Severity::Medium
    }

    fn check(&self, ctx: &RiskContext<'_>) -> RuleCheck {
        let Some(sizing) = self
            .calculator
            .size_from_history(&ctx.state.history, ctx.state.current_bankroll)
        else {
            return RuleCheck::pass(0.0, "Not enough settled history for Kelly");
        };

        let total = ctx.allocation.total_stake;
        if sizing.max_stake <= 0.0 {
            return RuleCheck::fail(
                70.0,
                format!(
                    "Negative Kelly (win rate {:.0}%)",
                    sizing.win_rate * 100.0
                ),
                Recommendation::ManualReview,
            );
        }
        if total <= sizing.max_stake + STAKE_EPSILON {
            return RuleCheck::pass(
                ratio_score(total, sizing.max_stake) * 0.4,
                "Within Kelly stake",
            );
        }
        RuleCheck::reduce_to(
            60.0,
            format!(
                "Stake ${total:.2} above Kelly stake ${:.2}",
                sizing.max_stake
            ),
            sizing.max_stake,
        )
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
