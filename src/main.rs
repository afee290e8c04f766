//! SUREBET — Cross-bookmaker arbitrage engine
//!
//! Entry point. Loads configuration, initialises structured logging,
//! restores the risk state from disk (or creates fresh), wires the
//! gateways, scanner pool, accountant and executor together and runs the
//! automation loop until Ctrl+C. Opportunities parked for approval are
//! handled from stdin (`pending`, `approve <id>`, `reject <id>`).

use anyhow::{Context, Result};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::{broadcast, watch};
use tracing::{error, info, warn};
use uuid::Uuid;

use surebet::config;
use surebet::engine::accountant::Accountant;
use surebet::engine::automation::{ApprovalHandle, AutomationEngine, GatewayOpportunitySource};
use surebet::engine::events::{EngineEvent, EventBus};
use surebet::engine::executor::Executor;
use surebet::engine::pool::ScannerPool;
use surebet::engine::scanner::MarketRouter;
use surebet::platforms::GatewayRegistry;
use surebet::storage;
use surebet::strategy::arbitrage::OpportunityScanner;
use surebet::strategy::risk::RiskManager;
use surebet::types::RiskState;

const BANNER: &str = r#"
 ____  _   _ ____  _____ ____  _____ _____
/ ___|| | | |  _ \| ____| __ )| ____|_   _|
\___ \| | | | |_) |  _| |  _ \|  _|   | |
 ___) | |_| |  _ <| |___| |_) | |___  | |
|____/ \___/|_| \_\_____|____/|_____| |_|

  Cross-bookmaker arbitrage engine
  v0.1.0
"#;

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present (non-fatal if missing)
    let _ = dotenv::dotenv();

    let config_path = std::env::var("SUREBET_CONFIG").unwrap_or_else(|_| "config.toml".to_string());
    let cfg = config::AppConfig::load(&config_path)?;

    init_logging();

    println!("{BANNER}");
    info!(
        agent_name = %cfg.agent.name,
        config = %config_path,
        initial_bankroll = cfg.agent.initial_bankroll,
        currency = %cfg.agent.currency,
        automation = cfg.automation.enabled,
        risk_level = %cfg.automation.risk_level,
        "SUREBET starting up"
    );

    // -- Restore or create state -----------------------------------------

    let state_file = cfg
        .agent
        .state_file
        .clone()
        .unwrap_or_else(|| storage::DEFAULT_STATE_FILE.to_string());

    let state = match storage::load_state(Some(&state_file))? {
        Some(mut s) => {
            // Limits follow the config, counters follow the file.
            s.min_bankroll = cfg.risk.min_bankroll;
            s.daily_limit = cfg.risk.daily_limit;
            s.weekly_limit = cfg.risk.weekly_limit;
            s.monthly_limit = cfg.risk.monthly_limit;
            info!(state = %s, "Resumed from saved state");
            s
        }
        None => {
            let s = RiskState::new(
                cfg.agent.initial_bankroll,
                cfg.risk.min_bankroll,
                cfg.risk.daily_limit,
                cfg.risk.weekly_limit,
                cfg.risk.monthly_limit,
            );
            info!(state = %s, "Fresh start");
            s
        }
    };

    // -- Initialise components -------------------------------------------

    let gateways = GatewayRegistry::from_config(&cfg.bookmakers)?;
    if gateways.len() < 2 {
        warn!(
            bookmakers = gateways.len(),
            "Fewer than two bookmakers enabled, no arbitrage is possible"
        );
    }
    authenticate_all(&gateways).await;

    let events = EventBus::default();
    tokio::spawn(log_events(events.subscribe()));

    let (accountant, ledger_task) = Accountant::spawn(state);

    let pool = ScannerPool::spawn(&cfg.pool, OpportunityScanner::new(cfg.scanner.clone()))
        .with_events(events.clone());
    info!(workers = pool.size(), "Scanner pool started");

    let router = MarketRouter::new(gateways.clone(), None);
    let source = Arc::new(GatewayOpportunitySource::new(router, pool, events.clone()));

    let risk = RiskManager::with_baseline_rules(cfg.risk_limits());
    info!(rules = ?risk.rule_ids(), "Risk rules loaded");

    let executor = Arc::new(Executor::new(
        gateways,
        risk,
        accountant.clone(),
        events.clone(),
        cfg.executor.clone(),
    ));

    // The sender stays here; dropping it would freeze the config.
    let (_config_tx, config_rx) = watch::channel(cfg.automation.clone());

    let mut engine = AutomationEngine::new(config_rx, source, executor, accountant.clone(), events);
    tokio::spawn(approval_console(engine.approvals()));

    // -- Main loop -------------------------------------------------------

    info!(
        tick_ms = cfg.automation.tick_interval_ms,
        cooldown_ms = cfg.automation.cooldown_period,
        "Entering main loop. Press Ctrl+C to stop."
    );

    engine
        .run(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!(error = %e, "Failed to listen for Ctrl+C");
            }
            info!("Shutdown signal received.");
        })
        .await;

    // Save final state
    accountant.shutdown().await?;
    let final_state = ledger_task.await.context("Accountant task panicked")?;
    storage::save_state(&final_state, Some(&state_file))?;
    info!(
        bankroll = format!("${:.2}", final_state.current_bankroll),
        executions = final_state.executions,
        compensations = final_state.compensations,
        profit = format!("${:.2}", final_state.total_profit),
        "SUREBET shut down cleanly."
    );

    Ok(())
}

/// Log in to every bookmaker up front so credential problems show early.
async fn authenticate_all(gateways: &GatewayRegistry) {
    for (name, gateway) in gateways.iter() {
        match gateway.authenticate().await {
            Ok(true) => info!(bookmaker = %name, "Authenticated"),
            Ok(false) => warn!(bookmaker = %name, "Authentication refused"),
            Err(e) => warn!(bookmaker = %name, error = %e, "Authentication failed"),
        }
    }
}

/// Human-facing channel: escalations and approval requests go to the log
/// as JSON.
async fn log_events(mut rx: broadcast::Receiver<EngineEvent>) {
    loop {
        match rx.recv().await {
            Ok(event @ EngineEvent::ManualInterventionRequired { .. }) => {
                let json = serde_json::to_string(&event).unwrap_or_default();
                error!(event = %json, "MANUAL INTERVENTION REQUIRED");
            }
            Ok(event @ (EngineEvent::ApprovalRequired { .. } | EngineEvent::PlacementUnknown { .. })) => {
                let json = serde_json::to_string(&event).unwrap_or_default();
                warn!(event = %json, "Attention needed");
            }
            Ok(_) => {}
            Err(broadcast::error::RecvError::Lagged(missed)) => {
                warn!(missed, "Event log lagging");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

/// Operator commands on stdin: `pending`, `approve <id>`, `reject <id>`.
async fn approval_console(approvals: ApprovalHandle) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(e) => {
                warn!(error = %e, "Approval console stopped");
                break;
            }
        };

        let mut words = line.split_whitespace();
        match (words.next(), words.next().map(Uuid::parse_str)) {
            (Some("pending"), None) => {
                let waiting = approvals.pending();
                info!(count = waiting.len(), "Awaiting approval");
                for opp in waiting {
                    info!(
                        id = %opp.id,
                        event = %opp.event_name,
                        margin = format!("{:.2}%", opp.profit_margin),
                        bookmakers = ?opp.bookmakers(),
                        expires_at = %opp.expires_at,
                        "Pending"
                    );
                }
            }
            (Some("approve"), Some(Ok(id))) => {
                let approvals = approvals.clone();
                tokio::spawn(async move {
                    match approvals.approve(id).await {
                        Ok(outcome) => info!(opportunity = %id, stage = %outcome.stage(), "Approved execution finished"),
                        Err(e) => warn!(opportunity = %id, error = %e, "Approved execution failed"),
                    }
                });
            }
            (Some("reject"), Some(Ok(id))) => {
                if approvals.reject(id) {
                    info!(opportunity = %id, "Rejected");
                } else {
                    warn!(opportunity = %id, "Not awaiting approval");
                }
            }
            (None, _) => {}
            _ => warn!(input = %line.trim(), "Usage: pending | approve <id> | reject <id>"),
        }
    }
}

/// Initialise the `tracing` subscriber.
fn init_logging() {
    use tracing_subscriber::{fmt, EnvFilter};

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("surebet=info"));

    let json_logging = std::env::var("SUREBET_LOG_JSON").is_ok();

    if json_logging {
        fmt()
            .json()
            .with_env_filter(env_filter)
            .with_target(true)
            .with_thread_ids(true)
            .init();
    } else {
        fmt()
            .with_env_filter(env_filter)
            .with_target(true)
            .init();
    }
}
