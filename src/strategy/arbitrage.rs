//! Cross-bookmaker arbitrage scanner.
//!
//! Given a snapshot of one market's quotes, picks the best price per
//! outcome across distinct bookmakers for every pair (and triple) of
//! outcomes, runs the stake solver, and scores the survivors. Batch mode
//! walks many markets with progress reporting and cooperative cancellation
//! at market boundaries.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, trace};
use uuid::Uuid;

use super::odds::{american_to_decimal, solve_stakes_decimal};
use crate::types::{MarketSnapshot, Opportunity, OpportunityLeg, OpportunityWarning, Quote, DRAW_OUTCOME};

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Scanner tuning knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScannerConfig {
    /// Stake used to score opportunities and quote guaranteed profit.
    pub reference_stake: f64,
    /// How long an opportunity lives after its oldest quote was observed.
    pub opportunity_ttl_secs: i64,
    /// Quotes older than this are ignored.
    pub max_quote_age_secs: i64,
    /// Best-N quotes per outcome considered by the leg search.
    pub max_candidates_per_outcome: usize,
    /// Minimum distinct bookmakers across the legs. `None` = every leg
    /// from a different bookmaker.
    pub min_distinct_bookmakers: Option<usize>,
}

impl Default for ScannerConfig {
    fn default() -> Self {
        Self {
            reference_stake: 1000.0,
            opportunity_ttl_secs: 300,
            max_quote_age_secs: 120,
            max_candidates_per_outcome: 8,
            min_distinct_bookmakers: None,
        }
    }
}

/// Filters applied to batch scans.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ScanFilters {
    /// Minimum profit margin in percent.
    pub min_margin: f64,
    pub min_confidence: f64,
    /// Empty = all sports.
    pub allowed_sports: Vec<String>,
    /// Empty = all bookmakers.
    pub allowed_bookmakers: Vec<String>,
}

impl ScanFilters {
    pub fn allows_sport(&self, sport: &str) -> bool {
        self.allowed_sports.is_empty()
            || self.allowed_sports.iter().any(|s| s.eq_ignore_ascii_case(sport))
    }

    pub fn allows_bookmaker(&self, bookmaker: &str) -> bool {
        self.allowed_bookmakers.is_empty()
            || self
                .allowed_bookmakers
                .iter()
                .any(|b| b.eq_ignore_ascii_case(bookmaker))
    }

    pub fn accepts(&self, opp: &Opportunity) -> bool {
        opp.profit_margin >= self.min_margin && opp.confidence >= self.min_confidence
    }
}

/// Result of a batch scan.
#[derive(Debug, Clone, Default)]
pub struct BatchScan {
    pub opportunities: Vec<Opportunity>,
    /// Markets fully processed before completion or cancellation.
    pub processed: usize,
    pub cancelled: bool,
}

// ---------------------------------------------------------------------------
// Scanner
// ---------------------------------------------------------------------------

/// A quote with its decimal odds precomputed.
#[derive(Debug, Clone)]
struct Candidate<'a> {
    quote: &'a Quote,
    decimal: f64,
}

#[derive(Debug, Clone)]
pub struct OpportunityScanner {
    config: ScannerConfig,
}

impl OpportunityScanner {
    pub fn new(config: ScannerConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ScannerConfig {
        &self.config
    }

    /// Find and score every arbitrage in one market, best first.
    pub fn scan_market(&self, market: &MarketSnapshot, now: DateTime<Utc>) -> Vec<Opportunity> {
        let max_age = Duration::seconds(self.config.max_quote_age_secs);

        // Best quote per (outcome, bookmaker), fresh and well-formed only
        let mut best: HashMap<(&str, &str), Candidate> = HashMap::new();
        for quote in &market.quotes {
            if quote.age(now) > max_age {
                trace!(quote = %quote, "Skipping stale quote");
                continue;
            }
            let Ok(decimal) = american_to_decimal(quote.american_odds) else {
                debug!(quote = %quote, "Skipping malformed quote");
                continue;
            };
            let key = (quote.outcome.as_str(), quote.bookmaker.as_str());
            let better = best.get(&key).map_or(true, |existing| decimal > existing.decimal);
            if better {
                best.insert(key, Candidate { quote, decimal });
            }
        }

        let mut by_outcome: HashMap<&str, Vec<Candidate>> = HashMap::new();
        for ((outcome, _), cand) in best {
            by_outcome.entry(outcome).or_default().push(cand);
        }
        for cands in by_outcome.values_mut() {
            cands.sort_by(|a, b| {
                b.decimal
                    .partial_cmp(&a.decimal)
                    .unwrap_or(std::cmp::Ordering::Equal)
                    .then_with(|| a.quote.bookmaker.cmp(&b.quote.bookmaker))
            });
            cands.truncate(self.config.max_candidates_per_outcome.max(1));
        }

        let mut outcomes: Vec<&str> = by_outcome.keys().copied().collect();
        outcomes.sort_unstable();
        if outcomes.len() < 2 {
            return Vec::new();
        }

        let draw_quoted = outcomes.contains(&DRAW_OUTCOME);
        let mut opportunities = Vec::new();

        for combo in combinations(outcomes.len()) {
            // A quoted draw must be covered: never price it as a 2-way problem
            if draw_quoted && combo.len() < outcomes.len() {
                continue;
            }

            let mut warnings = Vec::new();
            if market.allows_draw && !draw_quoted {
                warnings.push(OpportunityWarning::DrawRisk);
            }
            if combo.len() < outcomes.len() {
                warnings.push(OpportunityWarning::PartialCoverage);
            }

            let columns: Vec<&Vec<Candidate>> = combo
                .iter()
                .filter_map(|i| by_outcome.get(outcomes[*i]))
                .collect();
            let Some(legs) = self.pick_legs(&columns) else {
                continue;
            };

            if let Some(opp) = self.build_opportunity(market, &legs, warnings, now) {
                opportunities.push(opp);
            }
        }

        opportunities.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
        });

        if !opportunities.is_empty() {
            debug!(
                market = %market.market_id,
                found = opportunities.len(),
                best_margin = format!("{:.2}%", opportunities[0].profit_margin),
                "Arbitrage found"
            );
        }
        opportunities
    }

    /// Scan many markets in order. `cancel` is checked before each market,
    /// so a cancelled scan only ever contains whole markets.
    pub fn scan_markets<F>(
        &self,
        markets: &[MarketSnapshot],
        filters: &ScanFilters,
        now: DateTime<Utc>,
        cancel: &AtomicBool,
        mut on_progress: F,
    ) -> BatchScan
    where
        F: FnMut(usize, usize),
    {
        let total = markets.len();
        let mut out = BatchScan::default();

        for market in markets {
            if cancel.load(Ordering::SeqCst) {
                out.cancelled = true;
                break;
            }

            if filters.allows_sport(&market.sport) {
                let restricted;
                let market = if filters.allowed_bookmakers.is_empty() {
                    market
                } else {
                    restricted = MarketSnapshot {
                        quotes: market
                            .quotes
                            .iter()
                            .filter(|q| filters.allows_bookmaker(&q.bookmaker))
                            .cloned()
                            .collect(),
                        ..market.clone()
                    };
                    &restricted
                };
                out.opportunities.extend(
                    self.scan_market(market, now)
                        .into_iter()
                        .filter(|o| filters.accepts(o)),
                );
            }

            out.processed += 1;
            on_progress(out.processed, total);
        }

        sort_by_score(&mut out.opportunities);
        out
    }

    // -- Leg selection --

    /// Choose one candidate per column minimising the implied total under
    /// the distinct-bookmaker policy. Columns are sorted best price first.
    fn pick_legs<'a>(&self, columns: &[&Vec<Candidate<'a>>]) -> Option<Vec<Candidate<'a>>> {
        let k = columns.len();
        let required = self
            .config
            .min_distinct_bookmakers
            .unwrap_or(k)
            .clamp(2, k.max(2));

        let mut chosen: Vec<&Candidate<'a>> = Vec::with_capacity(k);
        let mut best: Option<(f64, Vec<Candidate<'a>>)> = None;
        search(columns, required, 0, 0.0, &mut chosen, &mut best);
        best.map(|(_, legs)| legs)
    }

    fn build_opportunity(
        &self,
        market: &MarketSnapshot,
        legs: &[Candidate],
        warnings: Vec<OpportunityWarning>,
        now: DateTime<Utc>,
    ) -> Option<Opportunity> {
        let decimals: Vec<f64> = legs.iter().map(|c| c.decimal).collect();
        let solution = solve_stakes_decimal(&decimals, self.config.reference_stake).ok()?;
        if !solution.is_arbitrage {
            return None;
        }

        let oldest = legs.iter().map(|c| c.quote.timestamp).min()?;
        let expires_at = (oldest + Duration::seconds(self.config.opportunity_ttl_secs)).min(market.start_time);
        if expires_at <= now {
            return None;
        }

        let oldest_age = (now - oldest).num_milliseconds().max(0) as f64 / 1000.0;
        let confidence = self.confidence(oldest_age, solution.profit_margin);

        let bookmaker_count = {
            let mut names: Vec<&str> = legs.iter().map(|c| c.quote.bookmaker.as_str()).collect();
            names.sort_unstable();
            names.dedup();
            names.len()
        };
        let score = score(
            solution.profit_margin,
            self.config.reference_stake,
            bookmaker_count,
            solution.guaranteed_profit,
            &solution.stakes,
        );

        // Largest total at which no leg exceeds its quoted maximum
        let max_total_stake = legs
            .iter()
            .filter_map(|c| c.quote.max_stake.map(|max| max * solution.implied_total * c.decimal))
            .fold(None, |acc: Option<f64>, t| Some(acc.map_or(t, |a| a.min(t))));

        Some(Opportunity {
            id: Uuid::new_v4(),
            market_id: market.market_id.clone(),
            sport: market.sport.clone(),
            event_name: market.event_name.clone(),
            legs: legs
                .iter()
                .map(|c| OpportunityLeg {
                    bookmaker: c.quote.bookmaker.clone(),
                    outcome: c.quote.outcome.clone(),
                    american_odds: c.quote.american_odds,
                    decimal_odds: c.decimal,
                    game_id: c.quote.game_id.clone(),
                    market_id: c.quote.market_id.clone(),
                    selection: c.quote.selection.clone(),
                    min_stake: c.quote.min_stake,
                    max_stake: c.quote.max_stake,
                })
                .collect(),
            profit_margin: solution.profit_margin,
            confidence,
            score,
            reference_stake: self.config.reference_stake,
            guaranteed_profit: solution.guaranteed_profit,
            max_total_stake,
            warnings,
            detected_at: now,
            expires_at,
        })
    }

    /// Confidence decays linearly with quote age (down to 0.7 at the
    /// staleness cutoff) and is cut for margins that usually mean a
    /// stale or mispriced line.
    fn confidence(&self, oldest_age_secs: f64, margin: f64) -> f64 {
        let max_age = self.config.max_quote_age_secs.max(1) as f64;
        let mut confidence = 1.0 - 0.3 * (oldest_age_secs / max_age).min(1.0);
        if margin > 10.0 {
            confidence *= 0.75;
        } else if margin > 5.0 {
            confidence *= 0.9;
        }
        confidence.clamp(0.0, 1.0)
    }
}

/// Depth-first search over one candidate per column with branch-and-bound
/// on the running implied total.
fn search<'a, 'c>(
    columns: &'c [&Vec<Candidate<'a>>],
    required_distinct: usize,
    depth: usize,
    implied: f64,
    chosen: &mut Vec<&'c Candidate<'a>>,
    best: &mut Option<(f64, Vec<Candidate<'a>>)>,
) {
    if let Some((best_total, _)) = best {
        if implied >= *best_total {
            return;
        }
    }
    if depth == columns.len() {
        let mut names: Vec<&str> = chosen.iter().map(|c| c.quote.bookmaker.as_str()).collect();
        names.sort_unstable();
        names.dedup();
        if names.len() >= required_distinct {
            *best = Some((implied, chosen.iter().map(|c| (*c).clone()).collect()));
        }
        return;
    }
    for cand in columns[depth].iter() {
        // Full distinctness can be enforced incrementally
        if required_distinct >= columns.len()
            && chosen.iter().any(|c| c.quote.bookmaker == cand.quote.bookmaker)
        {
            continue;
        }
        chosen.push(cand);
        search(columns, required_distinct, depth + 1, implied + 1.0 / cand.decimal, chosen, best);
        chosen.pop();
    }
}

/// Index combinations of size 2 and, when there are at least three
/// outcomes, size 3.
fn combinations(n: usize) -> Vec<Vec<usize>> {
    let mut out = Vec::new();
    for i in 0..n {
        for j in (i + 1)..n {
            out.push(vec![i, j]);
        }
    }
    for i in 0..n {
        for j in (i + 1)..n {
            for k in (j + 1)..n {
                out.push(vec![i, j, k]);
            }
        }
    }
    out
}

/// `margin*10 + ln(stake/100)*2 + bookmakers*5 − 20·(profit<10) + balance*10`,
/// clamped at zero. `balance` is `min(stakes)/max(stakes)`.
pub fn score(margin: f64, stake: f64, bookmaker_count: usize, profit: f64, stakes: &[f64]) -> f64 {
    let mut score = margin * 10.0;
    if stake > 0.0 {
        score += (stake / 100.0).ln() * 2.0;
    }
    score += bookmaker_count as f64 * 5.0;
    if profit < 10.0 {
        score -= 20.0;
    }
    let max = stakes.iter().copied().fold(0.0, f64::max);
    let min = stakes.iter().copied().fold(f64::INFINITY, f64::min);
    if max > 0.0 && min.is_finite() {
        score += min / max * 10.0;
    }
    score.max(0.0)
}

/// Sort opportunities best score first.
pub fn sort_by_score(opps: &mut [Opportunity]) {
    opps.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
    });
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn quote(bookmaker: &str, outcome: &str, odds: f64, now: DateTime<Utc>) -> Quote {
        Quote {
            bookmaker: bookmaker.to_string(),
            outcome: outcome.to_string(),
            american_odds: odds,
            game_id: format!("{bookmaker}-g1"),
            market_id: format!("{bookmaker}-m1"),
            selection: outcome.to_string(),
            min_stake: None,
            max_stake: None,
            timestamp: now,
        }
    }

    fn market(quotes: Vec<Quote>, allows_draw: bool, now: DateTime<Utc>) -> MarketSnapshot {
        MarketSnapshot {
            market_id: "lakers-celtics".to_string(),
            sport: "basketball".to_string(),
            event_name: "Lakers v Celtics".to_string(),
            start_time: now + Duration::hours(3),
            allows_draw,
            quotes,
        }
    }

    fn scanner() -> OpportunityScanner {
        OpportunityScanner::new(ScannerConfig::default())
    }

    #[test]
    fn test_simple_two_way_arbitrage() {
        let now = Utc::now();
        let snap = market(
            vec![quote("a", "home", -110.0, now), quote("b", "away", 120.0, now)],
            false,
            now,
        );
        let opps = scanner().scan_market(&snap, now);
        assert_eq!(opps.len(), 1);
        let opp = &opps[0];
        assert_eq!(opp.legs.len(), 2);
        assert!(opp.guaranteed_profit > 0.0);
        assert!(opp.is_auto_executable());
        assert!(opp.expires_at > now);
    }

    #[test]
    fn test_no_disparity_no_opportunity() {
        let now = Utc::now();
        let snap = market(
            vec![
                quote("a", "home", -110.0, now),
                quote("a", "away", -110.0, now),
                quote("b", "home", -105.0, now),
                quote("b", "away", -105.0, now),
            ],
            false,
            now,
        );
        assert!(scanner().scan_market(&snap, now).is_empty());
    }

    #[test]
    fn test_best_pick_across_four_bookmakers() {
        let now = Utc::now();
        let team1 = [("A", -110.0), ("B", 115.0), ("C", 120.0), ("D", -105.0)];
        let team2 = [("A", 105.0), ("B", -115.0), ("C", -120.0), ("D", 110.0)];
        let mut quotes = Vec::new();
        for (b, o) in team1 {
            quotes.push(quote(b, "home", o, now));
        }
        for (b, o) in team2 {
            quotes.push(quote(b, "away", o, now));
        }
        let opps = scanner().scan_market(&market(quotes, false, now), now);
        assert_eq!(opps.len(), 1);
        let legs = &opps[0].legs;
        let home = legs.iter().find(|l| l.outcome == "home").unwrap();
        let away = legs.iter().find(|l| l.outcome == "away").unwrap();
        assert_eq!(home.bookmaker, "C");
        assert_eq!(home.american_odds, 120.0);
        assert_eq!(away.bookmaker, "D");
        assert_eq!(away.american_odds, 110.0);
    }

    #[test]
    fn test_same_bookmaker_falls_back_to_next_best() {
        let now = Utc::now();
        // A is best on both sides; the only valid pairings mix A and B
        let snap = market(
            vec![
                quote("A", "home", 150.0, now),
                quote("A", "away", 150.0, now),
                quote("B", "home", 100.0, now),
                quote("B", "away", -120.0, now),
            ],
            false,
            now,
        );
        let opps = scanner().scan_market(&snap, now);
        assert_eq!(opps.len(), 1);
        let legs = &opps[0].legs;
        assert_ne!(legs[0].bookmaker, legs[1].bookmaker);
        // B home (2.0) + A away (2.5) beats A home (2.5) + B away (1.83)
        let home = legs.iter().find(|l| l.outcome == "home").unwrap();
        assert_eq!(home.bookmaker, "B");
    }

    #[test]
    fn test_single_bookmaker_never_pairs_with_itself() {
        let now = Utc::now();
        let snap = market(
            vec![quote("A", "home", 150.0, now), quote("A", "away", 150.0, now)],
            false,
            now,
        );
        assert!(scanner().scan_market(&snap, now).is_empty());
    }

    #[test]
    fn test_draw_quoted_requires_three_way() {
        let now = Utc::now();
        // Huge pair disparity, but the draw is quoted so pairs are skipped
        let snap = market(
            vec![
                quote("a", "home", 200.0, now),
                quote("b", "away", 200.0, now),
                quote("c", "draw", 150.0, now),
            ],
            true,
            now,
        );
        let opps = scanner().scan_market(&snap, now);
        // 1/3 + 1/3 + 1/2.5 > 1 → no 3-way arbitrage either
        assert!(opps.is_empty());

        let snap = market(
            vec![
                quote("a", "home", 250.0, now),
                quote("b", "away", 260.0, now),
                quote("c", "draw", 300.0, now),
            ],
            true,
            now,
        );
        let opps = scanner().scan_market(&snap, now);
        assert_eq!(opps.len(), 1);
        assert_eq!(opps[0].legs.len(), 3);
        assert!(opps[0].warnings.is_empty());
    }

    #[test]
    fn test_unquoted_draw_is_flagged() {
        let now = Utc::now();
        let snap = market(
            vec![quote("a", "home", 120.0, now), quote("b", "away", 110.0, now)],
            true,
            now,
        );
        let opps = scanner().scan_market(&snap, now);
        assert_eq!(opps.len(), 1);
        assert!(opps[0].warnings.contains(&OpportunityWarning::DrawRisk));
        assert!(!opps[0].is_auto_executable());
    }

    #[test]
    fn test_three_way_distinct_policy() {
        let now = Utc::now();
        let quotes = vec![
            quote("a", "home", 250.0, now),
            quote("a", "away", 260.0, now),
            quote("b", "draw", 300.0, now),
        ];
        let strict = scanner().scan_market(&market(quotes.clone(), true, now), now);
        assert!(strict.is_empty());

        let relaxed = OpportunityScanner::new(ScannerConfig {
            min_distinct_bookmakers: Some(2),
            ..Default::default()
        })
        .scan_market(&market(quotes, true, now), now);
        assert_eq!(relaxed.len(), 1);
    }

    #[test]
    fn test_stale_quotes_ignored() {
        let now = Utc::now();
        let old = now - Duration::seconds(600);
        let snap = market(
            vec![quote("a", "home", -110.0, old), quote("b", "away", 120.0, now)],
            false,
            now,
        );
        assert!(scanner().scan_market(&snap, now).is_empty());
    }

    #[test]
    fn test_expiry_bounded_by_start_time() {
        let now = Utc::now();
        let mut snap = market(
            vec![quote("a", "home", -110.0, now), quote("b", "away", 120.0, now)],
            false,
            now,
        );
        snap.start_time = now + Duration::seconds(60);
        let opps = scanner().scan_market(&snap, now);
        assert_eq!(opps[0].expires_at, snap.start_time);

        snap.start_time = now - Duration::seconds(1);
        assert!(scanner().scan_market(&snap, now).is_empty());
    }

    #[test]
    fn test_confidence_drops_with_age() {
        let now = Utc::now();
        let fresh = market(
            vec![quote("a", "home", -110.0, now), quote("b", "away", 120.0, now)],
            false,
            now,
        );
        let aged_ts = now - Duration::seconds(90);
        let aged = market(
            vec![quote("a", "home", -110.0, aged_ts), quote("b", "away", 120.0, now)],
            false,
            now,
        );
        let f = scanner().scan_market(&fresh, now)[0].confidence;
        let a = scanner().scan_market(&aged, now)[0].confidence;
        assert!(f > a);
        assert!(a >= 0.7);
    }

    #[test]
    fn test_max_total_stake_from_limits() {
        let now = Utc::now();
        let mut home = quote("a", "home", 100.0, now);
        home.max_stake = Some(100.0);
        let away = quote("b", "away", 110.0, now);
        let opps = scanner().scan_market(&market(vec![home, away], false, now), now);
        let max_total = opps[0].max_total_stake.unwrap();
        // At max_total the home stake is exactly its limit
        let t = 1.0 / 2.0 + 1.0 / 2.1;
        assert!((max_total * (0.5 / t) - 100.0).abs() < 1e-6);
    }

    #[test]
    fn test_score_formula() {
        // margin 2, stake 1000, 2 bookmakers, profit 20, balanced stakes
        let s = score(2.0, 1000.0, 2, 20.0, &[500.0, 500.0]);
        let expected = 20.0 + 10f64.ln() * 2.0 + 10.0 + 10.0;
        assert!((s - expected).abs() < 1e-9);
        // Small profit penalty, clamped at zero
        assert_eq!(score(0.1, 100.0, 0, 1.0, &[1.0, 100.0]), 0.0);
    }

    #[test]
    fn test_batch_scan_with_filters_and_progress() {
        let now = Utc::now();
        let mut hockey = market(
            vec![quote("a", "home", -110.0, now), quote("b", "away", 120.0, now)],
            false,
            now,
        );
        hockey.sport = "hockey".to_string();
        let basketball = market(
            vec![quote("a", "home", -110.0, now), quote("b", "away", 120.0, now)],
            false,
            now,
        );
        let filters = ScanFilters {
            allowed_sports: vec!["Basketball".to_string()],
            ..Default::default()
        };
        let mut seen = Vec::new();
        let batch = scanner().scan_markets(
            &[hockey, basketball],
            &filters,
            now,
            &AtomicBool::new(false),
            |done, total| seen.push((done, total)),
        );
        assert_eq!(batch.opportunities.len(), 1);
        assert_eq!(batch.processed, 2);
        assert!(!batch.cancelled);
        assert_eq!(seen, vec![(1, 2), (2, 2)]);
    }

    #[test]
    fn test_batch_bookmaker_allow_list() {
        let now = Utc::now();
        let snap = market(
            vec![
                quote("a", "home", -110.0, now),
                quote("b", "away", 120.0, now),
                quote("c", "away", -130.0, now),
            ],
            false,
            now,
        );
        let filters = ScanFilters {
            allowed_bookmakers: vec!["a".to_string(), "c".to_string()],
            ..Default::default()
        };
        let batch = scanner().scan_markets(&[snap], &filters, now, &AtomicBool::new(false), |_, _| {});
        assert!(batch.opportunities.is_empty());
    }

    #[test]
    fn test_batch_cancelled_before_start() {
        let now = Utc::now();
        let snap = market(
            vec![quote("a", "home", -110.0, now), quote("b", "away", 120.0, now)],
            false,
            now,
        );
        let batch = scanner().scan_markets(
            &[snap.clone(), snap],
            &ScanFilters::default(),
            now,
            &AtomicBool::new(true),
            |_, _| {},
        );
        assert!(batch.cancelled);
        assert_eq!(batch.processed, 0);
        assert!(batch.opportunities.is_empty());
    }

    #[test]
    fn test_combinations() {
        assert_eq!(combinations(2), vec![vec![0, 1]]);
        assert_eq!(combinations(3).len(), 4);
        assert_eq!(combinations(4).len(), 6 + 4);
    }
}
