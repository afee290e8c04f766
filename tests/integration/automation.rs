//! The full loop: bookmakers → router → pool → filters → executor.

use std::sync::Arc;
use tokio::sync::watch;

use surebet::config::AutomationConfig;
use surebet::engine::accountant::{Accountant, AccountantHandle};
use surebet::engine::automation::{AutomationEngine, GatewayOpportunitySource};
use surebet::engine::events::{EngineEvent, EventBus};
use surebet::engine::executor::{Executor, ExecutorConfig};
use surebet::engine::pool::{PoolConfig, ScannerPool};
use surebet::engine::scanner::MarketRouter;
use surebet::platforms::{BookmakerGateway, GatewayRegistry};
use surebet::strategy::arbitrage::{OpportunityScanner, ScannerConfig};
use surebet::strategy::risk::{RiskLimits, RiskManager};
use surebet::types::RiskState;

use crate::mock_bookmaker::{game, kickoff, MockBookmaker, PlaceScript};

struct Loop {
    engine: AutomationEngine,
    config_tx: watch::Sender<AutomationConfig>,
    accountant: AccountantHandle,
    events: EventBus,
}

fn enabled() -> AutomationConfig {
    AutomationConfig {
        enabled: true,
        cooldown_period: 0,
        ..AutomationConfig::default()
    }
}

fn wire(books: &[MockBookmaker], config: AutomationConfig) -> Loop {
    let mut registry = GatewayRegistry::new();
    for b in books {
        registry.insert(Arc::new(b.clone()) as Arc<dyn BookmakerGateway>);
    }

    let events = EventBus::default();
    let (accountant, _task) = Accountant::spawn(RiskState::new(10_000.0, 1_000.0, 5_000.0, 20_000.0, 50_000.0));
    let pool = ScannerPool::spawn(
        &PoolConfig {
            workers: Some(2),
            ..PoolConfig::default()
        },
        OpportunityScanner::new(ScannerConfig::default()),
    )
    .with_events(events.clone());
    let source = GatewayOpportunitySource::new(MarketRouter::new(registry.clone(), None), pool, events.clone());
    let executor = Arc::new(Executor::new(
        registry,
        RiskManager::with_baseline_rules(RiskLimits::default()),
        accountant.clone(),
        events.clone(),
        ExecutorConfig::default(),
    ));

    let (config_tx, config_rx) = watch::channel(config);
    let engine = AutomationEngine::new(config_rx, Arc::new(source), executor, accountant.clone(), events.clone());
    Loop {
        engine,
        config_tx,
        accountant,
        events,
    }
}

/// Celtics/Nuggets priced for a ~2.2% arbitrage, plus a fair Heat/Bulls.
fn books() -> (MockBookmaker, MockBookmaker) {
    let start = kickoff();
    let alpha = MockBookmaker::new("alpha", 5_000.0).with_games(vec![
        game("a1", "basketball", "Boston Celtics", "Denver Nuggets", start, -110.0, -105.0),
        game("a2", "basketball", "Miami Heat", "Chicago Bulls", start, -110.0, -110.0),
    ]);
    let beta = MockBookmaker::new("beta", 5_000.0).with_games(vec![
        game("b1", "basketball", "Boston Celtics", "Denver Nuggets", start, -120.0, 120.0),
        game("b2", "basketball", "Miami Heat", "Chicago Bulls", start, -115.0, -105.0),
    ]);
    (alpha, beta)
}

#[tokio::test]
async fn test_tick_scans_and_executes_the_arbitrage() {
    let (alpha, beta) = books();
    let mut lp = wire(&[alpha.clone(), beta.clone()], enabled());
    let mut rx = lp.events.subscribe();

    let report = lp.engine.tick().await.unwrap();

    assert_eq!(report.candidates, 1);
    assert_eq!(report.executed, 1);
    assert_eq!(alpha.placements().len(), 1);
    assert_eq!(beta.placements().len(), 1);

    let state = lp.accountant.snapshot().await.unwrap();
    assert_eq!(state.executions, 1);
    // Moderate risk level: 5% of a 10k bankroll.
    assert!((state.daily_used - 500.0).abs() < 0.05);

    let mut saw_scan = false;
    let mut saw_settle = false;
    while let Ok(event) = rx.try_recv() {
        saw_scan |= matches!(event, EngineEvent::ScanCompleted { opportunities: 1, .. });
        saw_settle |= matches!(event, EngineEvent::ExecutionSettled { .. });
    }
    assert!(saw_scan);
    assert!(saw_settle);
}

#[tokio::test]
async fn test_margin_above_auto_approval_waits_for_a_human() {
    let (alpha, beta) = books();
    let cfg = AutomationConfig {
        auto_approve_below: 1.0,
        ..enabled()
    };
    let mut lp = wire(&[alpha.clone(), beta.clone()], cfg);

    let report = lp.engine.tick().await.unwrap();
    assert_eq!(report.awaiting_approval, 1);
    assert!(alpha.placements().is_empty());

    let approvals = lp.engine.approvals();
    let waiting = approvals.pending();
    assert_eq!(waiting.len(), 1);
    assert!(approvals.approve(waiting[0].id).await.unwrap().is_settled());
    assert_eq!(alpha.placements().len(), 1);
}

#[tokio::test]
async fn test_disallowed_bookmaker_is_filtered() {
    let (alpha, beta) = books();
    let cfg = AutomationConfig {
        allowed_bookmakers: vec!["alpha".to_string(), "gamma".to_string()],
        ..enabled()
    };
    let mut lp = wire(&[alpha.clone(), beta.clone()], cfg);

    let report = lp.engine.tick().await.unwrap();
    assert_eq!(report.executed, 0);
    assert!(alpha.placements().is_empty());
    assert!(beta.placements().is_empty());
}

#[tokio::test]
async fn test_compensated_execution_leaves_books_flat() {
    let (alpha, beta) = books();
    beta.script(PlaceScript::Reject {
        code: "MARKET_SUSPENDED".to_string(),
        message: "suspended".to_string(),
    });
    let mut lp = wire(&[alpha.clone(), beta.clone()], enabled());

    let report = lp.engine.tick().await.unwrap();
    assert_eq!(report.compensated, 1);
    assert_eq!(alpha.cancellations().len(), 1);

    let state = lp.accountant.snapshot().await.unwrap();
    assert_eq!(state.compensations, 1);
    assert!(state.daily_used.abs() < 1e-9);
}

#[tokio::test]
async fn test_disabling_at_runtime_stops_execution() {
    let (alpha, beta) = books();
    let mut lp = wire(&[alpha.clone(), beta.clone()], enabled());
    lp.config_tx.send_modify(|c| c.enabled = false);

    let report = lp.engine.tick().await.unwrap();
    assert!(report.disabled);
    assert!(alpha.calls().is_empty());
}
