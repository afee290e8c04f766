//! Execution saga against scripted bookmakers: settle, compensate,
//! escalate, time out.

use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;

use surebet::engine::accountant::{Accountant, AccountantHandle};
use surebet::engine::events::{EngineEvent, EventBus};
use surebet::engine::executor::{ExecutionOutcome, Executor, ExecutorConfig};
use surebet::engine::scanner::MarketRouter;
use surebet::platforms::throttle::Throttled;
use surebet::platforms::{BookmakerGateway, GatewayRegistry};
use surebet::strategy::arbitrage::{OpportunityScanner, ScannerConfig};
use surebet::strategy::risk::{RiskLimits, RiskManager};
use surebet::types::{BetStatus, Opportunity, RiskState, SurebetError};

use crate::mock_bookmaker::{game, kickoff, MockBookmaker, PlaceScript};

const STAKE: f64 = 400.0;

/// Celtics -110 at alpha, Nuggets +120 at beta.
fn opportunity() -> Opportunity {
    let start = kickoff();
    let fetched = vec![
        (
            "alpha".to_string(),
            vec![game("a-1", "basketball", "Boston Celtics", "Denver Nuggets", start, -110.0, -105.0)],
        ),
        (
            "beta".to_string(),
            vec![game("b-7", "basketball", "Boston Celtics", "Denver Nuggets", start, -120.0, 120.0)],
        ),
    ];
    let now = Utc::now();
    let snapshots = MarketRouter::build_snapshots(&fetched, now);
    assert_eq!(snapshots.len(), 1);
    let mut opps = OpportunityScanner::new(ScannerConfig::default()).scan_market(&snapshots[0], now);
    assert_eq!(opps.len(), 1);
    opps.remove(0)
}

struct Rig {
    executor: Arc<Executor>,
    accountant: AccountantHandle,
    events: EventBus,
}

fn rig(gateways: Vec<Arc<dyn BookmakerGateway>>, config: ExecutorConfig) -> Rig {
    let mut registry = GatewayRegistry::new();
    for g in gateways {
        registry.insert(g);
    }
    let (accountant, _task) = Accountant::spawn(RiskState::new(10_000.0, 1_000.0, 5_000.0, 20_000.0, 50_000.0));
    let events = EventBus::default();
    let executor = Arc::new(Executor::new(
        registry,
        RiskManager::with_baseline_rules(RiskLimits::default()),
        accountant.clone(),
        events.clone(),
        config,
    ));
    Rig {
        executor,
        accountant,
        events,
    }
}

fn arc<G: BookmakerGateway + 'static>(gateway: G) -> Arc<dyn BookmakerGateway> {
    Arc::new(gateway)
}

fn books() -> (MockBookmaker, MockBookmaker) {
    (MockBookmaker::new("alpha", 5_000.0), MockBookmaker::new("beta", 5_000.0))
}

fn drain(rx: &mut tokio::sync::broadcast::Receiver<EngineEvent>) -> Vec<EngineEvent> {
    let mut out = Vec::new();
    while let Ok(e) = rx.try_recv() {
        out.push(e);
    }
    out
}

#[tokio::test]
async fn test_both_legs_placed_settles_and_books_usage() {
    let (alpha, beta) = books();
    let rig = rig(
        vec![arc(alpha.clone()), arc(beta.clone())],
        ExecutorConfig::default(),
    );
    let opp = opportunity();

    let outcome = rig.executor.execute_opportunity(&opp, STAKE).await.unwrap();
    let ExecutionOutcome::Settled(settled) = outcome else {
        panic!("expected a settled execution");
    };

    assert_eq!(alpha.placements().len(), 1);
    assert_eq!(beta.placements().len(), 1);
    assert!(settled.actual_profit > 0.0);
    assert!(!settled.deviated);
    // Leg references are the placement ids.
    let refs: Vec<String> = settled.legs.iter().map(|l| l.id.to_string()).collect();
    assert!(alpha.calls().iter().any(|c| matches!(c, crate::mock_bookmaker::Call::Place { reference, .. } if refs.contains(reference))));

    let state = rig.accountant.snapshot().await.unwrap();
    assert_eq!(state.executions, 1);
    assert!((state.daily_used - STAKE).abs() < 0.05);
}

#[tokio::test]
async fn test_rejected_leg_cancels_placed_sibling() {
    let (alpha, beta) = books();
    beta.script(PlaceScript::Reject {
        code: "ODDS_CHANGED".to_string(),
        message: "price moved".to_string(),
    });
    let rig = rig(
        vec![arc(alpha.clone()), arc(beta.clone())],
        ExecutorConfig::default(),
    );
    let mut rx = rig.events.subscribe();

    let outcome = rig.executor.execute_opportunity(&opportunity(), STAKE).await.unwrap();
    let ExecutionOutcome::Compensated(comp) = outcome else {
        panic!("expected compensation");
    };

    assert_eq!(alpha.cancellations(), vec!["alpha-1".to_string()]);
    assert!(beta.cancellations().is_empty());
    let alpha_leg = comp.legs.iter().find(|l| l.bookmaker == "alpha").unwrap();
    assert_eq!(alpha_leg.status, BetStatus::Cancelled);
    let beta_leg = comp.legs.iter().find(|l| l.bookmaker == "beta").unwrap();
    assert_eq!(beta_leg.status, BetStatus::Failed);
    assert_eq!(beta_leg.error_code.as_deref(), Some("ODDS_CHANGED"));

    let state = rig.accountant.snapshot().await.unwrap();
    assert_eq!(state.compensations, 1);
    assert_eq!(state.executions, 0);
    assert!(state.daily_used.abs() < 1e-9);

    assert!(drain(&mut rx)
        .iter()
        .any(|e| matches!(e, EngineEvent::ExecutionCompensated { .. })));
}

#[tokio::test]
async fn test_refused_cancellation_escalates_to_a_human() {
    let (alpha, beta) = books();
    beta.script(PlaceScript::Error("connection reset".to_string()));
    alpha.refuse_cancellations();
    let rig = rig(
        vec![arc(alpha.clone()), arc(beta.clone())],
        ExecutorConfig::default(),
    );
    let mut rx = rig.events.subscribe();

    let err = rig.executor.execute_opportunity(&opportunity(), STAKE).await.unwrap_err();
    let SurebetError::ManualInterventionRequired { legs, reason, .. } = err else {
        panic!("expected manual intervention, got {err}");
    };
    assert!(reason.contains("alpha"));
    let exposed = legs.iter().find(|l| l.bookmaker == "alpha").unwrap();
    assert_eq!(exposed.status, BetStatus::Placed);
    // Attempted exactly once, never retried.
    assert_eq!(alpha.cancellations().len(), 1);

    let state = rig.accountant.snapshot().await.unwrap();
    assert!((state.daily_used - exposed.requested_stake).abs() < 1e-9);

    let events = drain(&mut rx);
    assert!(events
        .iter()
        .any(|e| matches!(e, EngineEvent::ManualInterventionRequired { .. })));
    assert!(!events
        .iter()
        .any(|e| matches!(e, EngineEvent::ExecutionRejected { .. })));
}

#[tokio::test]
async fn test_timed_out_leg_is_unresolved_and_never_retried() {
    let (alpha, beta) = books();
    beta.script(PlaceScript::Delay(Duration::from_secs(5)));
    let slow_beta = Throttled::new(beta.clone(), 600, Duration::from_millis(50));
    let rig = rig(
        vec![arc(alpha.clone()), arc(slow_beta)],
        ExecutorConfig::default(),
    );
    let mut rx = rig.events.subscribe();

    let outcome = rig.executor.execute_opportunity(&opportunity(), STAKE).await.unwrap();
    let ExecutionOutcome::Compensated(comp) = outcome else {
        panic!("expected compensation");
    };

    assert_eq!(comp.unresolved.len(), 1);
    let beta_leg = comp.legs.iter().find(|l| l.bookmaker == "beta").unwrap();
    assert_eq!(comp.unresolved[0], beta_leg.id);
    assert_eq!(beta_leg.error_code.as_deref(), Some("TIMEOUT"));
    assert_eq!(beta.placements().len(), 1);
    assert_eq!(alpha.cancellations().len(), 1);

    assert!(drain(&mut rx)
        .iter()
        .any(|e| matches!(e, EngineEvent::PlacementUnknown { bookmaker, .. } if bookmaker == "beta")));
}

#[tokio::test]
async fn test_worse_fill_is_reported_as_deviation() {
    let (alpha, beta) = books();
    beta.script(PlaceScript::FillAt(105.0));
    let rig = rig(
        vec![arc(alpha.clone()), arc(beta.clone())],
        ExecutorConfig::default(),
    );
    let mut rx = rig.events.subscribe();

    let outcome = rig.executor.execute_opportunity(&opportunity(), STAKE).await.unwrap();
    let ExecutionOutcome::Settled(settled) = outcome else {
        panic!("expected settlement");
    };
    assert!(settled.deviated);
    assert!(settled.actual_profit < settled.expected_profit);

    assert!(drain(&mut rx)
        .iter()
        .any(|e| matches!(e, EngineEvent::FillDeviation { .. })));
}

#[tokio::test]
async fn test_short_balance_places_nothing() {
    let alpha = MockBookmaker::new("alpha", 50.0);
    let beta = MockBookmaker::new("beta", 5_000.0);
    let rig = rig(
        vec![arc(alpha.clone()), arc(beta.clone())],
        ExecutorConfig::default(),
    );

    let err = rig.executor.execute_opportunity(&opportunity(), STAKE).await.unwrap_err();
    assert!(matches!(err, SurebetError::InsufficientBalance { ref bookmaker, .. } if bookmaker == "alpha"));
    assert!(alpha.placements().is_empty());
    assert!(beta.placements().is_empty());
}

#[tokio::test]
async fn test_concurrent_executions_lose_no_usage() {
    let (alpha, beta) = books();
    let rig = rig(
        vec![arc(alpha.clone()), arc(beta.clone())],
        ExecutorConfig {
            max_concurrent: 2,
            ..ExecutorConfig::default()
        },
    );
    let opp = opportunity();

    let runs: Vec<_> = (0..4)
        .map(|_| {
            let executor = Arc::clone(&rig.executor);
            let opp = opp.clone();
            tokio::spawn(async move { executor.execute_opportunity(&opp, 100.0).await })
        })
        .collect();
    for run in runs {
        assert!(run.await.unwrap().unwrap().is_settled());
    }

    let state = rig.accountant.snapshot().await.unwrap();
    assert_eq!(state.executions, 4);
    assert!((state.daily_used - 400.0).abs() < 0.05);
    assert_eq!(alpha.placements().len(), 4);
    assert_eq!(rig.executor.in_flight(), 0);
}

#[tokio::test]
async fn test_status_refresh_after_settlement() {
    let (alpha, beta) = books();
    let rig = rig(
        vec![arc(alpha.clone()), arc(beta.clone())],
        ExecutorConfig::default(),
    );
    let outcome = rig.executor.execute_opportunity(&opportunity(), STAKE).await.unwrap();
    for leg in outcome.legs() {
        assert_eq!(rig.executor.refresh_status(leg).await.unwrap(), "placed");
    }
}

#[tokio::test(start_paused = true)]
async fn test_legs_are_placed_concurrently() {
    let delay = Duration::from_secs(2);
    let (alpha, beta) = books();
    alpha.script(PlaceScript::Delay(delay));
    beta.script(PlaceScript::Delay(delay));
    let rig = rig(
        vec![arc(alpha.clone()), arc(beta.clone())],
        ExecutorConfig::default(),
    );

    let started = tokio::time::Instant::now();
    let outcome = rig.executor.execute_opportunity(&opportunity(), STAKE).await.unwrap();
    let elapsed = started.elapsed();

    assert!(outcome.is_settled());
    assert!(elapsed >= delay, "finished before the slowest leg: {elapsed:?}");
    assert!(elapsed < delay * 2, "legs ran one after another: {elapsed:?}");
}

#[tokio::test(start_paused = true)]
async fn test_max_concurrent_caps_in_flight_executions() {
    let (alpha, beta) = books();
    for _ in 0..3 {
        alpha.script(PlaceScript::Delay(Duration::from_secs(1)));
        beta.script(PlaceScript::Delay(Duration::from_secs(1)));
    }
    let rig = rig(
        vec![arc(alpha.clone()), arc(beta.clone())],
        ExecutorConfig {
            max_concurrent: 1,
            ..ExecutorConfig::default()
        },
    );
    let opp = opportunity();

    let started = tokio::time::Instant::now();
    let runs: Vec<_> = (0..3)
        .map(|_| {
            let executor = Arc::clone(&rig.executor);
            let opp = opp.clone();
            tokio::spawn(async move { executor.execute_opportunity(&opp, 100.0).await })
        })
        .collect();

    let mut peak = 0;
    while !runs.iter().all(|r| r.is_finished()) {
        peak = peak.max(rig.executor.in_flight());
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    let elapsed = started.elapsed();

    for run in runs {
        assert!(run.await.unwrap().unwrap().is_settled());
    }
    assert_eq!(peak, 1);
    // One at a time, each holding its permit for a full second.
    assert!(elapsed >= Duration::from_secs(3), "executions overlapped: {elapsed:?}");
    assert_eq!(rig.executor.in_flight(), 0);
}

#[tokio::test]
async fn test_losing_fills_trip_the_circuit_breaker() {
    let (alpha, beta) = books();
    let rig = rig(
        vec![arc(alpha.clone()), arc(beta.clone())],
        ExecutorConfig::default(),
    );
    let opp = opportunity();

    // Moderate tier stops after five straight losses.
    for _ in 0..5 {
        alpha.script(PlaceScript::FillAt(-300.0));
        let outcome = rig.executor.execute_opportunity(&opp, 100.0).await.unwrap();
        let ExecutionOutcome::Settled(settled) = outcome else {
            panic!("expected a settled execution");
        };
        assert!(settled.deviated);
        assert!(settled.actual_profit < 0.0);
    }

    let state = rig.accountant.snapshot().await.unwrap();
    assert_eq!(state.consecutive_losses, 5);
    assert_eq!(state.history.len(), 5);
    assert!(state.history.iter().all(|b| !b.won()));
    assert!(state.current_bankroll < 10_000.0);

    let err = rig.executor.execute_opportunity(&opp, 100.0).await.unwrap_err();
    assert!(
        matches!(err, SurebetError::RiskRejected { ref reason, .. } if reason.contains("consecutive_losses")),
        "expected the loss streak to block, got {err}"
    );
    assert_eq!(alpha.placements().len(), 5);
    assert_eq!(beta.placements().len(), 5);
}
