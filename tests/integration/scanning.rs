//! Odds fetching, fixture matching and pooled scanning end to end.

use chrono::{Duration, Utc};
use std::sync::Arc;

use surebet::engine::pool::{PoolConfig, ScannerPool};
use surebet::engine::scanner::MarketRouter;
use surebet::platforms::{BookmakerGateway, GatewayRegistry};
use surebet::strategy::arbitrage::{OpportunityScanner, ScanFilters, ScannerConfig};
use surebet::types::{MarketSnapshot, Quote, SurebetError};

use crate::mock_bookmaker::{game, kickoff, MockBookmaker};

fn registry(books: &[MockBookmaker]) -> GatewayRegistry {
    let mut registry = GatewayRegistry::new();
    for b in books {
        registry.insert(Arc::new(b.clone()) as Arc<dyn BookmakerGateway>);
    }
    registry
}

fn pool(workers: usize) -> ScannerPool {
    ScannerPool::spawn(
        &PoolConfig {
            workers: Some(workers),
            ..PoolConfig::default()
        },
        OpportunityScanner::new(ScannerConfig::default()),
    )
}

/// A synthetic two-bookmaker market; every third one is an arbitrage.
fn market(i: usize) -> MarketSnapshot {
    let now = Utc::now();
    let away_odds = if i % 3 == 0 { 125.0 } else { -105.0 };
    let quote = |bookmaker: &str, outcome: &str, odds: f64| Quote {
        bookmaker: bookmaker.to_string(),
        outcome: outcome.to_string(),
        american_odds: odds,
        game_id: format!("g{i}"),
        market_id: format!("g{i}-{outcome}"),
        selection: outcome.to_string(),
        min_stake: None,
        max_stake: None,
        timestamp: now,
    };
    MarketSnapshot {
        market_id: format!("m{i}"),
        sport: "basketball".to_string(),
        event_name: format!("Home {i} v Away {i}"),
        start_time: now + Duration::hours(4),
        allows_draw: false,
        quotes: vec![
            quote("alpha", "home", -110.0),
            quote("alpha", "away", -110.0),
            quote("beta", "home", -115.0),
            quote("beta", "away", away_odds),
        ],
    }
}

#[tokio::test]
async fn test_router_matches_fixtures_across_bookmakers() {
    let start = kickoff();
    let alpha = MockBookmaker::new("alpha", 1_000.0).with_games(vec![
        game("a1", "basketball", "Boston Celtics", "Denver Nuggets", start, -110.0, -105.0),
        game("a2", "basketball", "Miami Heat", "Chicago Bulls", start, -150.0, 130.0),
    ]);
    // Same fixtures, different spellings and a few minutes of drift.
    let beta = MockBookmaker::new("beta", 1_000.0).with_games(vec![
        game("b1", "basketball", "Celtics Boston", "Nuggets Denver", start + Duration::minutes(5), -120.0, 120.0),
        game("b9", "basketball", "Utah Jazz", "Phoenix Suns", start, -110.0, -110.0),
    ]);
    let router = MarketRouter::new(registry(&[alpha, beta]), None);

    let snapshots = router.scan_all().await;
    assert_eq!(snapshots.len(), 1);
    assert_eq!(snapshots[0].bookmakers().len(), 2);
    assert_eq!(snapshots[0].outcomes().len(), 2);
}

#[tokio::test]
async fn test_router_tolerates_a_failing_bookmaker() {
    let start = kickoff();
    let fixture = |id: &str| game(id, "basketball", "Boston Celtics", "Denver Nuggets", start, -110.0, 100.0);
    let alpha = MockBookmaker::new("alpha", 1_000.0).with_games(vec![fixture("a1")]);
    let beta = MockBookmaker::new("beta", 1_000.0).with_games(vec![fixture("b1")]);
    let gamma = MockBookmaker::new("gamma", 1_000.0).with_games(vec![fixture("c1")]);
    gamma.fail_games();

    let router = MarketRouter::new(registry(&[alpha, beta, gamma]), None);
    let snapshots = router.scan_all().await;
    assert_eq!(snapshots.len(), 1);
    assert_eq!(snapshots[0].bookmakers(), vec!["alpha", "beta"]);
}

#[tokio::test]
async fn test_pool_scan_finds_every_arbitrage_in_score_order() {
    let pool = pool(3);
    let markets: Vec<MarketSnapshot> = (0..30).map(market).collect();

    let report = pool.scan(markets, ScanFilters::default()).await.unwrap();

    assert_eq!(report.processed, 30);
    assert!(!report.cancelled);
    assert!(report.errors.is_empty());
    assert_eq!(report.opportunities.len(), 10);
    assert!(report
        .opportunities
        .windows(2)
        .all(|w| w[0].score >= w[1].score));
    for opp in &report.opportunities {
        assert_ne!(opp.legs[0].bookmaker, opp.legs[1].bookmaker);
    }
}

#[tokio::test]
async fn test_pool_filters_apply_inside_batch() {
    let pool = pool(2);
    let markets: Vec<MarketSnapshot> = (0..12).map(market).collect();
    let filters = ScanFilters {
        allowed_sports: vec!["soccer".to_string()],
        ..ScanFilters::default()
    };
    let report = pool.scan(markets, filters).await.unwrap();
    assert_eq!(report.processed, 12);
    assert!(report.opportunities.is_empty());
}

#[tokio::test]
async fn test_second_batch_while_running_is_refused() {
    let pool = pool(2);
    let running = pool
        .scan_batch((0..50).map(market).collect(), ScanFilters::default())
        .await
        .unwrap();

    let second = pool.scan_batch(vec![market(0)], ScanFilters::default()).await;
    assert!(matches!(second, Err(SurebetError::ScanInProgress)));

    let report = running.finish().await;
    assert_eq!(report.processed, 50);

    // Pool is free again once the handle is finished.
    assert!(pool.scan(vec![market(0)], ScanFilters::default()).await.is_ok());
}

#[tokio::test]
async fn test_cancelled_batch_only_reports_whole_markets() {
    let pool = pool(2);
    let markets: Vec<MarketSnapshot> = (0..300).map(market).collect();
    let handle = pool.scan_batch(markets, ScanFilters::default()).await.unwrap();
    handle.cancel().await;
    let report = handle.finish().await;

    assert!(report.processed <= 300);
    // One arbitrage per qualifying market, and only for markets processed.
    assert!(report.opportunities.len() <= report.processed);
    for opp in &report.opportunities {
        assert_eq!(opp.legs.len(), 2);
    }
}
