//! Multi-bookmaker market router.
//!
//! Fetches upcoming games from every registered bookmaker concurrently,
//! matches the same fixture across bookmakers via fuzzy team-name
//! similarity and start-time proximity, normalises selections to
//! `home`/`away`/`draw`, and emits one `MarketSnapshot` per fixture for
//! the opportunity scanner.

use chrono::{DateTime, Utc};
use futures::future::join_all;
use std::collections::HashSet;
use tracing::{debug, info, warn};

use crate::platforms::{Game, GatewayRegistry};
use crate::strategy::odds::american_to_decimal;
use crate::types::{MarketSnapshot, Quote, DRAW_OUTCOME};

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Minimum similarity score (0.0–1.0) for two team names to be treated
/// as the same side of a fixture.
const MATCH_THRESHOLD: f64 = 0.5;

/// Two listings of one fixture may disagree on kick-off by this much.
const MAX_START_DRIFT_MINUTES: i64 = 30;

/// Sports whose match result market can end level.
const DRAW_SPORTS: &[&str] = &["soccer", "football", "rugby union", "rugby league", "cricket", "boxing"];

/// Selection names that mean "draw".
const DRAW_NAMES: &[&str] = &["draw", "tie", "x", "the draw"];

pub const HOME_OUTCOME: &str = "home";
pub const AWAY_OUTCOME: &str = "away";

// ---------------------------------------------------------------------------
// Text similarity
// ---------------------------------------------------------------------------

/// Compute a normalised similarity score between two strings.
///
/// Weighted Jaccard index on normalised tokens plus a containment bonus
/// for asymmetric matches ("Liverpool" vs "Liverpool FC Reserves").
/// Returns 0.0 (no similarity) to 1.0 (identical after normalisation).
fn text_similarity(a: &str, b: &str) -> f64 {
    let norm = |s: &str| -> HashSet<String> {
        s.to_lowercase()
            .split(|c: char| !c.is_alphanumeric())
            .filter(|w| w.len() > 2) // drop "fc", "sc", "de"
            .map(String::from)
            .collect()
    };

    let set_a = norm(a);
    let set_b = norm(b);

    if set_a.is_empty() || set_b.is_empty() {
        return 0.0;
    }

    let intersection = set_a.intersection(&set_b).count() as f64;
    let union = set_a.union(&set_b).count() as f64;
    let jaccard = intersection / union;

    let containment = intersection / set_a.len().min(set_b.len()) as f64;

    (0.6 * jaccard + 0.4 * containment).min(1.0)
}

/// How likely two games are the same fixture, 0.0–1.0.
fn fixture_similarity(a: &Game, b: &Game) -> f64 {
    if a.sport.to_lowercase() != b.sport.to_lowercase() {
        return 0.0;
    }
    if (a.start_time - b.start_time).num_minutes().abs() > MAX_START_DRIFT_MINUTES {
        return 0.0;
    }
    let home = text_similarity(&a.home_team, &b.home_team);
    let away = text_similarity(&a.away_team, &b.away_team);
    if home < MATCH_THRESHOLD || away < MATCH_THRESHOLD {
        return 0.0;
    }
    (home + away) / 2.0
}

/// Map a bookmaker selection name onto the normalised outcome label.
fn classify_outcome(selection: &str, game: &Game) -> Option<&'static str> {
    let name = selection.trim().to_lowercase();
    if DRAW_NAMES.contains(&name.as_str()) {
        return Some(DRAW_OUTCOME);
    }
    match name.as_str() {
        "home" | "1" => return Some(HOME_OUTCOME),
        "away" | "2" => return Some(AWAY_OUTCOME),
        _ => {}
    }

    let home = text_similarity(selection, &game.home_team);
    let away = text_similarity(selection, &game.away_team);
    if home >= MATCH_THRESHOLD && home > away {
        Some(HOME_OUTCOME)
    } else if away >= MATCH_THRESHOLD && away > home {
        Some(AWAY_OUTCOME)
    } else {
        None
    }
}

// ---------------------------------------------------------------------------
// Market Router
// ---------------------------------------------------------------------------

/// A fixture and every bookmaker listing matched to it.
struct FixtureGroup<'a> {
    anchor: &'a Game,
    listings: Vec<(&'a str, &'a Game)>,
}

/// Aggregates and cross-references games from all registered bookmakers.
pub struct MarketRouter {
    gateways: GatewayRegistry,
    sport: Option<String>,
}

impl MarketRouter {
    /// `sport` restricts every fetch to one sport; `None` scans everything.
    pub fn new(gateways: GatewayRegistry, sport: Option<String>) -> Self {
        Self { gateways, sport }
    }

    pub fn gateways(&self) -> &GatewayRegistry {
        &self.gateways
    }

    /// Fetch from every bookmaker and build market snapshots.
    ///
    /// A failing bookmaker is logged and skipped; the scan continues with
    /// the rest.
    pub async fn scan_all(&self) -> Vec<MarketSnapshot> {
        info!(bookmakers = self.gateways.len(), "Starting multi-bookmaker market scan...");

        let fetched = self.fetch_all().await;
        let total_games: usize = fetched.iter().map(|(_, games)| games.len()).sum();
        info!(games = total_games, bookmakers = fetched.len(), "Raw games fetched");

        let snapshots = Self::build_snapshots(&fetched, Utc::now());
        info!(markets = snapshots.len(), "Market scan complete");
        snapshots
    }

    async fn fetch_all(&self) -> Vec<(String, Vec<Game>)> {
        let fetches = self.gateways.iter().map(|(name, gateway)| {
            let sport = self.sport.clone();
            async move { (name.clone(), gateway.get_games(sport).await) }
        });

        join_all(fetches)
            .await
            .into_iter()
            .filter_map(|(name, result)| match result {
                Ok(games) => {
                    debug!(bookmaker = %name, games = games.len(), "Bookmaker games fetched");
                    Some((name, games))
                }
                Err(e) => {
                    warn!(bookmaker = %name, error = %e, "Bookmaker fetch failed, continuing without");
                    None
                }
            })
            .collect()
    }

    /// Group listings into fixtures and convert each fixture quoted by at
    /// least two bookmakers into a snapshot. Games that already started
    /// and unavailable selections are dropped.
    pub fn build_snapshots(fetched: &[(String, Vec<Game>)], now: DateTime<Utc>) -> Vec<MarketSnapshot> {
        let groups = Self::group_fixtures(fetched, now);
        let mut snapshots: Vec<MarketSnapshot> = groups
            .iter()
            .filter_map(|group| Self::to_snapshot(group, now))
            .collect();
        snapshots.sort_by(|a, b| a.start_time.cmp(&b.start_time).then_with(|| a.market_id.cmp(&b.market_id)));
        snapshots
    }

    fn group_fixtures<'a>(fetched: &'a [(String, Vec<Game>)], now: DateTime<Utc>) -> Vec<FixtureGroup<'a>> {
        let mut groups: Vec<FixtureGroup<'a>> = Vec::new();

        for (bookmaker, games) in fetched {
            for game in games.iter().filter(|g| g.start_time > now) {
                let best = groups
                    .iter_mut()
                    .filter(|g| !g.listings.iter().any(|(b, _)| *b == bookmaker.as_str()))
                    .map(|g| {
                        let score = fixture_similarity(g.anchor, game);
                        (g, score)
                    })
                    .filter(|(_, score)| *score > 0.0)
                    .max_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal));

                match best {
                    Some((group, score)) => {
                        debug!(
                            bookmaker = %bookmaker,
                            fixture = %format!("{} v {}", group.anchor.home_team, group.anchor.away_team),
                            listing = %format!("{} v {}", game.home_team, game.away_team),
                            score,
                            "Cross-bookmaker match found"
                        );
                        group.listings.push((bookmaker.as_str(), game));
                    }
                    None => groups.push(FixtureGroup {
                        anchor: game,
                        listings: vec![(bookmaker.as_str(), game)],
                    }),
                }
            }
        }

        groups
    }

    fn to_snapshot(group: &FixtureGroup<'_>, now: DateTime<Utc>) -> Option<MarketSnapshot> {
        if group.listings.len() < 2 {
            return None;
        }
        let anchor = group.anchor;
        let sport = anchor.sport.to_lowercase();

        let mut quotes = Vec::new();
        for (bookmaker, game) in &group.listings {
            for market in game.markets.iter().filter(|m| m.available) {
                if american_to_decimal(market.odds).is_err() {
                    debug!(bookmaker = %bookmaker, odds = market.odds, "Dropping invalid odds");
                    continue;
                }
                let Some(outcome) = classify_outcome(&market.name, game) else {
                    debug!(bookmaker = %bookmaker, selection = %market.name, "Unclassified selection skipped");
                    continue;
                };
                quotes.push(Quote {
                    bookmaker: bookmaker.to_string(),
                    outcome: outcome.to_string(),
                    american_odds: market.odds,
                    game_id: game.id.clone(),
                    market_id: market.id.clone(),
                    selection: market.name.clone(),
                    min_stake: market.min_stake,
                    max_stake: market.max_stake,
                    timestamp: now,
                });
            }
        }

        let mut snapshot = MarketSnapshot {
            market_id: Self::market_key(anchor),
            allows_draw: DRAW_SPORTS.contains(&sport.as_str()),
            sport,
            event_name: format!("{} v {}", anchor.home_team, anchor.away_team),
            start_time: anchor.start_time,
            quotes,
        };
        snapshot.allows_draw |= snapshot.has_draw_quote();

        (snapshot.outcomes().len() >= 2 && snapshot.bookmakers().len() >= 2).then_some(snapshot)
    }

    /// Engine-side fixture identity, stable across scans.
    fn market_key(game: &Game) -> String {
        let slug = |s: &str| -> String {
            s.to_lowercase()
                .split(|c: char| !c.is_alphanumeric())
                .filter(|w| !w.is_empty())
                .collect::<Vec<_>>()
                .join("-")
        };
        format!(
            "{}:{}-v-{}:{}",
            slug(&game.sport),
            slug(&game.home_team),
            slug(&game.away_team),
            game.start_time.format("%Y%m%d%H%M"),
        )
    }

    /// Whether two listings describe the same fixture.
    pub fn same_fixture(a: &Game, b: &Game) -> bool {
        fixture_similarity(a, b) > 0.0
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
