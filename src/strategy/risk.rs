//! Risk manager.
//!
//! A registry of independent rules evaluated against a proposed trade.
//! Every enabled rule runs on the same immutable context, so evaluation
//! order never matters. The result aggregates pass/fail, an average risk
//! score, and an optional stake adjustment.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::{debug, info, warn};

use super::kelly::KellyConfig;
use super::rules;
use crate::types::{Opportunity, RiskLevel, RiskState, StakeAllocation};

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Limits the baseline rules check against.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RiskLimits {
    pub risk_level: RiskLevel,
    /// Absolute cap on any single leg.
    pub max_stake_per_bet: f64,
    /// Absolute cap on the whole opportunity.
    pub max_total_stake: f64,
    /// Daily volume cap as a fraction of bankroll.
    pub daily_volume_pct: f64,
    /// Margins above this (percent) usually mean stale odds.
    pub max_sane_margin: f64,
    pub min_confidence: f64,
    /// Below this, reject.
    pub min_time_to_expiry_secs: i64,
    /// Below this, pass with a warning.
    pub warn_time_to_expiry_secs: i64,
    pub kelly: KellyConfig,
}

impl Default for RiskLimits {
    fn default() -> Self {
        Self {
            risk_level: RiskLevel::Moderate,
            max_stake_per_bet: 500.0,
            max_total_stake: 1000.0,
            daily_volume_pct: 0.20,
            max_sane_margin: 10.0,
            min_confidence: 0.7,
            min_time_to_expiry_secs: 120,
            warn_time_to_expiry_secs: 300,
            kelly: KellyConfig::default(),
        }
    }
}

// ---------------------------------------------------------------------------
// Rule contract
// ---------------------------------------------------------------------------

/// How much a failing rule matters. `High` and `Critical` failures make a
/// validation invalid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    pub fn is_blocking(&self) -> bool {
        matches!(self, Severity::High | Severity::Critical)
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Severity::Low => write!(f, "low"),
            Severity::Medium => write!(f, "medium"),
            Severity::High => write!(f, "high"),
            Severity::Critical => write!(f, "critical"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Recommendation {
    Approve,
    Reject,
    ReduceStake,
    ManualReview,
}

/// Outcome of a single rule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleCheck {
    pub passed: bool,
    /// 0–100, higher = riskier
    pub score: f64,
    pub message: String,
    pub recommendation: Recommendation,
    /// Total stake the rule would accept instead.
    pub suggested_stake: Option<f64>,
}

impl RuleCheck {
    pub fn pass(score: f64, message: impl Into<String>) -> Self {
        Self {
            passed: true,
            score: score.clamp(0.0, 100.0),
            message: message.into(),
            recommendation: Recommendation::Approve,
            suggested_stake: None,
        }
    }

    pub fn fail(score: f64, message: impl Into<String>, recommendation: Recommendation) -> Self {
        Self {
            passed: false,
            score: score.clamp(0.0, 100.0),
            message: message.into(),
            recommendation,
            suggested_stake: None,
        }
    }

    /// Fail and suggest a smaller total stake.
    pub fn reduce_to(score: f64, message: impl Into<String>, stake: f64) -> Self {
        Self {
            suggested_stake: Some(stake.max(0.0)),
            ..Self::fail(score, message, Recommendation::ReduceStake)
        }
    }
}

/// Everything a rule may look at. Built fresh per execution attempt.
#[derive(Debug, Clone, Copy)]
pub struct RiskContext<'a> {
    pub opportunity: &'a Opportunity,
    pub allocation: &'a StakeAllocation,
    pub state: &'a RiskState,
    pub now: DateTime<Utc>,
}

/// An independent risk check. Rules must not depend on each other.
pub trait RiskRule: Send + Sync {
    fn id(&self) -> &str;
    fn severity(&self) -> Severity;
    fn check(&self, ctx: &RiskContext<'_>) -> RuleCheck;
}

// ---------------------------------------------------------------------------
// Validation result
// ---------------------------------------------------------------------------

/// One rule's verdict inside a validation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuleOutcome {
    pub rule_id: String,
    pub severity: Severity,
    pub check: RuleCheck,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationResult {
    /// False iff a high or critical rule failed.
    pub valid: bool,
    /// Average rule score, 0–100.
    pub risk_score: f64,
    pub outcomes: Vec<RuleOutcome>,
    /// Allocation scaled to the smallest suggested stake. Adopted by the
    /// executor when `valid`; advisory only otherwise.
    pub adjusted_allocation: Option<StakeAllocation>,
}

impl ValidationResult {
    pub fn failures(&self) -> impl Iterator<Item = &RuleOutcome> {
        self.outcomes.iter().filter(|o| !o.check.passed)
    }

    pub fn blocking_failures(&self) -> impl Iterator<Item = &RuleOutcome> {
        self.failures().filter(|o| o.severity.is_blocking())
    }

    pub fn needs_manual_review(&self) -> bool {
        self.failures()
            .any(|o| o.check.recommendation == Recommendation::ManualReview)
    }

    /// `rule: message` for every failure, blocking ones first.
    pub fn summary(&self) -> String {
        let mut failures: Vec<&RuleOutcome> = self.failures().collect();
        failures.sort_by(|a, b| b.severity.cmp(&a.severity));
        failures
            .iter()
            .map(|o| format!("{}: {}", o.rule_id, o.check.message))
            .collect::<Vec<_>>()
            .join("; ")
    }
}

// ---------------------------------------------------------------------------
// Manager
// ---------------------------------------------------------------------------

struct RegisteredRule {
    rule: Box<dyn RiskRule>,
    enabled: bool,
}

#[derive(Default)]
pub struct RiskManager {
    rules: Vec<RegisteredRule>,
    limits: RiskLimits,
}

impl fmt::Debug for RiskManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list()
            .entries(self.rules.iter().map(|r| (r.rule.id(), r.enabled)))
            .finish()
    }
}

impl RiskManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Manager preloaded with every baseline rule.
    pub fn with_baseline_rules(limits: RiskLimits) -> Self {
        let mut manager = Self::new();
        for rule in rules::baseline(&limits) {
            manager.register(rule);
        }
        manager.limits = limits;
        manager
    }

    pub fn limits(&self) -> &RiskLimits {
        &self.limits
    }

    /// Reconfigure the registered baseline rules for new limits. Custom
    /// rules and enabled flags are left alone.
    pub fn apply_limits(&mut self, limits: RiskLimits) {
        for rule in rules::baseline(&limits) {
            if let Some(existing) = self.rules.iter_mut().find(|r| r.rule.id() == rule.id()) {
                existing.rule = rule;
            }
        }
        self.limits = limits;
    }

    /// Add a rule, replacing any existing rule with the same id.
    pub fn register(&mut self, rule: Box<dyn RiskRule>) {
        self.rules.retain(|r| r.rule.id() != rule.id());
        self.rules.push(RegisteredRule { rule, enabled: true });
    }

    /// Enable or disable a rule by id. Returns false for unknown ids.
    pub fn set_enabled(&mut self, id: &str, enabled: bool) -> bool {
        match self.rules.iter_mut().find(|r| r.rule.id() == id) {
            Some(r) => {
                r.enabled = enabled;
                true
            }
            None => false,
        }
    }

    pub fn rule_ids(&self) -> Vec<&str> {
        self.rules.iter().map(|r| r.rule.id()).collect()
    }

    /// Run every enabled rule and aggregate.
    pub fn validate(&self, ctx: &RiskContext<'_>) -> ValidationResult {
        let outcomes: Vec<RuleOutcome> = self
            .rules
            .iter()
            .filter(|r| r.enabled)
            .map(|r| RuleOutcome {
                rule_id: r.rule.id().to_string(),
                severity: r.rule.severity(),
                check: r.rule.check(ctx),
            })
            .collect();

        let risk_score = if outcomes.is_empty() {
            0.0
        } else {
            outcomes.iter().map(|o| o.check.score).sum::<f64>() / outcomes.len() as f64
        };

        let valid = !outcomes
            .iter()
            .any(|o| !o.check.passed && o.severity.is_blocking());

        let min_suggested = outcomes
            .iter()
            .filter(|o| !o.check.passed)
            .filter_map(|o| o.check.suggested_stake)
            .filter(|s| *s > 0.0 && *s < ctx.allocation.total_stake)
            .fold(None, |acc: Option<f64>, s| Some(acc.map_or(s, |a| a.min(s))));
        let adjusted_allocation = min_suggested.map(|s| ctx.allocation.scaled_to(s));

        for o in outcomes.iter().filter(|o| !o.check.passed) {
            debug!(
                rule = %o.rule_id,
                severity = %o.severity,
                score = format!("{:.0}", o.check.score),
                recommendation = ?o.check.recommendation,
                message = %o.check.message,
                "Risk rule failed"
            );
        }

        let result = ValidationResult {
            valid,
            risk_score,
            outcomes,
            adjusted_allocation,
        };

        if valid {
            info!(
                opportunity = %ctx.opportunity.id,
                risk_score = format!("{:.1}", risk_score),
                adjusted = result
                    .adjusted_allocation
                    .as_ref()
                    .map(|a| format!("${:.2}", a.total_stake))
                    .unwrap_or_else(|| "-".to_string()),
                "Risk validation passed"
            );
        } else {
            warn!(
                opportunity = %ctx.opportunity.id,
                risk_score = format!("{:.1}", risk_score),
                failures = %result.summary(),
                "Risk validation failed"
            );
        }

        result
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
