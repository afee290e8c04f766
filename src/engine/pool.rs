//! Scanner worker pool.
//!
//! Arbitrage search is CPU-bound, so it runs on blocking threads behind a
//! message protocol: each `ScanWorker` owns a request channel and answers
//! with progress, results, errors and periodic heartbeats. A worker runs
//! one calculation at a time and refuses a second one while busy.
//!
//! `ScannerPool` splits a batch of markets across all workers under one
//! correlation id and merges the partial results.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, Mutex as AsyncMutex, OwnedMutexGuard};
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::events::{EngineEvent, EventBus};
use crate::strategy::arbitrage::{sort_by_score, OpportunityScanner, ScanFilters};
use crate::types::{MarketSnapshot, Opportunity, SurebetError};

/// Message sent back when a worker is asked to start while busy.
pub const BUSY_MESSAGE: &str = "calculation in progress";

/// Quote count treated as full memory pressure for one worker.
const QUOTE_BUDGET: usize = 500_000;

const REQUEST_BUFFER: usize = 16;
const HEARTBEAT_BUFFER: usize = 64;

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Worker count; `None` = number of CPUs.
    pub workers: Option<usize>,
    pub max_workers: usize,
    pub heartbeat_interval_ms: u64,
    /// Markets processed between progress reports.
    pub progress_every: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            workers: None,
            max_workers: 8,
            heartbeat_interval_ms: 10_000,
            progress_every: 10,
        }
    }
}

impl PoolConfig {
    pub fn worker_count(&self) -> usize {
        self.workers
            .unwrap_or_else(num_cpus::get)
            .clamp(1, self.max_workers.max(1))
    }
}

// ---------------------------------------------------------------------------
// Protocol
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub enum ScanRequest {
    Calculate {
        correlation_id: Uuid,
        snapshot: MarketSnapshot,
    },
    BatchCalculate {
        correlation_id: Uuid,
        markets: Vec<MarketSnapshot>,
        filters: ScanFilters,
        batch_size: usize,
    },
    Cancel { correlation_id: Uuid },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WorkerStatus {
    pub worker_id: usize,
    pub busy: bool,
    pub in_flight_quotes: usize,
    /// Share of the per-worker quote budget held by the running job, 0.0–1.0.
    pub memory_pressure: f64,
}

#[derive(Debug, Clone)]
pub enum ScanResponse {
    Progress {
        correlation_id: Uuid,
        worker_id: usize,
        processed: usize,
        total: usize,
    },
    Result {
        correlation_id: Uuid,
        worker_id: usize,
        opportunities: Vec<Opportunity>,
        processed: usize,
        cancelled: bool,
        elapsed_ms: u64,
    },
    Error {
        correlation_id: Uuid,
        worker_id: usize,
        message: String,
    },
    Heartbeat(WorkerStatus),
}

// ---------------------------------------------------------------------------
// Worker
// ---------------------------------------------------------------------------

struct Job {
    correlation_id: Uuid,
    cancel: Arc<AtomicBool>,
}

pub struct ScanWorker {
    id: usize,
    scanner: Arc<OpportunityScanner>,
    requests: mpsc::Receiver<ScanRequest>,
    responses: mpsc::UnboundedSender<ScanResponse>,
    heartbeats: mpsc::Sender<ScanResponse>,
    heartbeat_interval: Duration,
    busy: Arc<AtomicBool>,
    in_flight_quotes: Arc<AtomicUsize>,
    current: Option<Job>,
}

impl ScanWorker {
    pub fn new(
        id: usize,
        scanner: Arc<OpportunityScanner>,
        requests: mpsc::Receiver<ScanRequest>,
        responses: mpsc::UnboundedSender<ScanResponse>,
        heartbeats: mpsc::Sender<ScanResponse>,
        heartbeat_interval: Duration,
    ) -> Self {
        Self {
            id,
            scanner,
            requests,
            responses,
            heartbeats,
            heartbeat_interval,
            busy: Arc::new(AtomicBool::new(false)),
            in_flight_quotes: Arc::new(AtomicUsize::new(0)),
            current: None,
        }
    }

    /// Serve requests until the request channel closes.
    pub async fn run(mut self) {
        let mut ticker = tokio::time::interval(self.heartbeat_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                request = self.requests.recv() => match request {
                    Some(request) => self.handle(request),
                    None => break,
                },
                _ = ticker.tick() => self.heartbeat(),
            }
        }

        if let Some(job) = &self.current {
            job.cancel.store(true, Ordering::SeqCst);
        }
        debug!(worker = self.id, "Scan worker stopped");
    }

    fn status(&self) -> WorkerStatus {
        let in_flight_quotes = self.in_flight_quotes.load(Ordering::SeqCst);
        WorkerStatus {
            worker_id: self.id,
            busy: self.busy.load(Ordering::SeqCst),
            in_flight_quotes,
            memory_pressure: (in_flight_quotes as f64 / QUOTE_BUDGET as f64).min(1.0),
        }
    }

    fn heartbeat(&self) {
        // A full heartbeat buffer means nobody is reading; drop it.
        let _ = self.heartbeats.try_send(ScanResponse::Heartbeat(self.status()));
    }

    fn handle(&mut self, request: ScanRequest) {
        match request {
            ScanRequest::Cancel { correlation_id } => {
                match &self.current {
                    Some(job) if job.correlation_id == correlation_id => {
                        job.cancel.store(true, Ordering::SeqCst);
                        debug!(worker = self.id, %correlation_id, "Cancellation requested");
                    }
                    _ => debug!(worker = self.id, %correlation_id, "Cancel for unknown job ignored"),
                }
            }
            ScanRequest::Calculate {
                correlation_id,
                snapshot,
            } => {
                if !self.try_begin(correlation_id, snapshot.quotes.len()) {
                    return;
                }
                let scanner = Arc::clone(&self.scanner);
                let responses = self.responses.clone();
                let busy = Arc::clone(&self.busy);
                let in_flight = Arc::clone(&self.in_flight_quotes);
                let worker_id = self.id;

                tokio::task::spawn_blocking(move || {
                    let started = Instant::now();
                    let opportunities = scanner.scan_market(&snapshot, Utc::now());
                    in_flight.store(0, Ordering::SeqCst);
                    busy.store(false, Ordering::SeqCst);
                    let _ = responses.send(ScanResponse::Result {
                        correlation_id,
                        worker_id,
                        opportunities,
                        processed: 1,
                        cancelled: false,
                        elapsed_ms: started.elapsed().as_millis() as u64,
                    });
                });
            }
            ScanRequest::BatchCalculate {
                correlation_id,
                markets,
                filters,
                batch_size,
            } => {
                let quotes = markets.iter().map(|m| m.quotes.len()).sum();
                if !self.try_begin(correlation_id, quotes) {
                    return;
                }
                let scanner = Arc::clone(&self.scanner);
                let responses = self.responses.clone();
                let busy = Arc::clone(&self.busy);
                let in_flight = Arc::clone(&self.in_flight_quotes);
                let cancel = self
                    .current
                    .as_ref()
                    .map(|job| Arc::clone(&job.cancel))
                    .unwrap_or_default();
                let worker_id = self.id;
                let every = batch_size.max(1);

                tokio::task::spawn_blocking(move || {
                    let started = Instant::now();
                    let progress = responses.clone();
                    let batch = scanner.scan_markets(&markets, &filters, Utc::now(), &cancel, |processed, total| {
                        if processed % every == 0 || processed == total {
                            let _ = progress.send(ScanResponse::Progress {
                                correlation_id,
                                worker_id,
                                processed,
                                total,
                            });
                        }
                    });
                    in_flight.store(0, Ordering::SeqCst);
                    busy.store(false, Ordering::SeqCst);
                    let _ = responses.send(ScanResponse::Result {
                        correlation_id,
                        worker_id,
                        opportunities: batch.opportunities,
                        processed: batch.processed,
                        cancelled: batch.cancelled,
                        elapsed_ms: started.elapsed().as_millis() as u64,
                    });
                });
            }
        }
    }

    /// Claim the worker for a job, or answer with an error if it is busy.
    fn try_begin(&mut self, correlation_id: Uuid, quotes: usize) -> bool {
        if self.busy.swap(true, Ordering::SeqCst) {
            warn!(worker = self.id, %correlation_id, "Scan request rejected, worker busy");
            let _ = self.responses.send(ScanResponse::Error {
                correlation_id,
                worker_id: self.id,
                message: BUSY_MESSAGE.to_string(),
            });
            return false;
        }
        self.in_flight_quotes.store(quotes, Ordering::SeqCst);
        self.current = Some(Job {
            correlation_id,
            cancel: Arc::new(AtomicBool::new(false)),
        });
        true
    }
}

// ---------------------------------------------------------------------------
// Pool
// ---------------------------------------------------------------------------

/// Merged outcome of a pool-wide batch scan.
#[derive(Debug, Clone, Default)]
pub struct BatchReport {
    pub correlation_id: Uuid,
    /// Best score first.
    pub opportunities: Vec<Opportunity>,
    pub processed: usize,
    pub total: usize,
    pub cancelled: bool,
    pub elapsed_ms: u64,
    /// Worker-side errors; their markets are missing from the result.
    pub errors: Vec<String>,
}

/// Cloneable cancel switch for a running batch.
#[derive(Clone)]
pub struct BatchCanceller {
    correlation_id: Uuid,
    workers: Vec<mpsc::Sender<ScanRequest>>,
}

impl BatchCanceller {
    pub async fn cancel(&self) {
        for worker in &self.workers {
            let _ = worker
                .send(ScanRequest::Cancel {
                    correlation_id: self.correlation_id,
                })
                .await;
        }
    }
}

/// A running pool batch. Holding it keeps the pool reserved.
pub struct BatchHandle {
    correlation_id: Uuid,
    total: usize,
    pending: usize,
    canceller: BatchCanceller,
    responses: OwnedMutexGuard<mpsc::UnboundedReceiver<ScanResponse>>,
    progress: HashMap<usize, usize>,
    report: BatchReport,
    started: Instant,
    events: Option<EventBus>,
}

impl BatchHandle {
    pub fn correlation_id(&self) -> Uuid {
        self.correlation_id
    }

    /// Markets processed so far (as last reported) and batch size.
    pub fn progress(&self) -> (usize, usize) {
        (self.progress.values().sum(), self.total)
    }

    pub fn canceller(&self) -> BatchCanceller {
        self.canceller.clone()
    }

    /// Ask every worker to stop at its next market boundary.
    pub async fn cancel(&self) {
        self.canceller.cancel().await;
    }

    /// Wait for every worker's part and merge the results.
    pub async fn finish(mut self) -> BatchReport {
        while self.pending > 0 {
            let Some(response) = self.responses.recv().await else {
                self.report.errors.push("scan workers stopped".to_string());
                break;
            };
            self.absorb(response);
        }

        sort_by_score(&mut self.report.opportunities);
        self.report.processed = self.report.processed.min(self.total);
        self.report.elapsed_ms = self.started.elapsed().as_millis() as u64;

        info!(
            correlation_id = %self.correlation_id,
            processed = self.report.processed,
            total = self.total,
            opportunities = self.report.opportunities.len(),
            cancelled = self.report.cancelled,
            elapsed_ms = self.report.elapsed_ms,
            "Batch scan finished"
        );
        std::mem::take(&mut self.report)
    }

    fn absorb(&mut self, response: ScanResponse) {
        match response {
            ScanResponse::Progress {
                correlation_id,
                worker_id,
                processed,
                ..
            } if correlation_id == self.correlation_id => {
                self.progress.insert(worker_id, processed);
                let (processed, total) = self.progress();
                if let Some(events) = &self.events {
                    events.publish(EngineEvent::ScanProgress {
                        correlation_id,
                        processed,
                        total,
                    });
                }
            }
            ScanResponse::Result {
                correlation_id,
                worker_id,
                opportunities,
                processed,
                cancelled,
                ..
            } if correlation_id == self.correlation_id => {
                self.progress.insert(worker_id, processed);
                self.report.opportunities.extend(opportunities);
                self.report.processed += processed;
                self.report.cancelled |= cancelled;
                self.pending -= 1;
            }
            ScanResponse::Error {
                correlation_id,
                worker_id,
                message,
            } if correlation_id == self.correlation_id => {
                warn!(worker = worker_id, error = %message, "Worker failed its part of the batch");
                self.report.errors.push(format!("worker {worker_id}: {message}"));
                self.pending -= 1;
            }
            other => debug!(response = ?other, "Discarding response from an earlier batch"),
        }
    }
}

/// Fixed-size pool of scan workers.
pub struct ScannerPool {
    workers: Vec<mpsc::Sender<ScanRequest>>,
    responses: Arc<AsyncMutex<mpsc::UnboundedReceiver<ScanResponse>>>,
    heartbeats: Mutex<mpsc::Receiver<ScanResponse>>,
    statuses: Mutex<HashMap<usize, WorkerStatus>>,
    progress_every: usize,
    events: Option<EventBus>,
}

impl ScannerPool {
    /// Spawn `config.worker_count()` workers sharing one scanner.
    pub fn spawn(config: &PoolConfig, scanner: OpportunityScanner) -> Self {
        let size = config.worker_count();
        let scanner = Arc::new(scanner);
        let (response_tx, response_rx) = mpsc::unbounded_channel();
        let (heartbeat_tx, heartbeat_rx) = mpsc::channel(HEARTBEAT_BUFFER);
        let interval = Duration::from_millis(config.heartbeat_interval_ms.max(1));

        let workers = (0..size)
            .map(|id| {
                let (tx, rx) = mpsc::channel(REQUEST_BUFFER);
                let worker = ScanWorker::new(
                    id,
                    Arc::clone(&scanner),
                    rx,
                    response_tx.clone(),
                    heartbeat_tx.clone(),
                    interval,
                );
                tokio::spawn(worker.run());
                tx
            })
            .collect();

        info!(workers = size, "Scanner pool started");

        Self {
            workers,
            responses: Arc::new(AsyncMutex::new(response_rx)),
            heartbeats: Mutex::new(heartbeat_rx),
            statuses: Mutex::new(HashMap::new()),
            progress_every: config.progress_every.max(1),
            events: None,
        }
    }

    /// Publish batch progress on the given bus.
    pub fn with_events(mut self, events: EventBus) -> Self {
        self.events = Some(events);
        self
    }

    pub fn size(&self) -> usize {
        self.workers.len()
    }

    /// Split `markets` across the workers and start scanning.
    ///
    /// Fails fast with `ScanInProgress` while another batch holds the pool.
    pub async fn scan_batch(
        &self,
        markets: Vec<MarketSnapshot>,
        filters: ScanFilters,
    ) -> Result<BatchHandle, SurebetError> {
        let responses = Arc::clone(&self.responses)
            .try_lock_owned()
            .map_err(|_| SurebetError::ScanInProgress)?;

        let correlation_id = Uuid::new_v4();
        let total = markets.len();
        let chunk = total.div_ceil(self.workers.len().max(1)).max(1);

        let mut report = BatchReport {
            correlation_id,
            total,
            ..Default::default()
        };
        let mut pending = 0;

        let mut remaining = markets;
        for worker in &self.workers {
            if remaining.is_empty() {
                break;
            }
            let rest = remaining.split_off(chunk.min(remaining.len()));
            let part = std::mem::replace(&mut remaining, rest);
            let request = ScanRequest::BatchCalculate {
                correlation_id,
                markets: part,
                filters: filters.clone(),
                batch_size: self.progress_every,
            };
            match worker.send(request).await {
                Ok(()) => pending += 1,
                Err(_) => report.errors.push("scan worker is not running".to_string()),
            }
        }

        debug!(%correlation_id, total, parts = pending, "Batch dispatched");

        Ok(BatchHandle {
            correlation_id,
            total,
            pending,
            canceller: BatchCanceller {
                correlation_id,
                workers: self.workers.clone(),
            },
            responses,
            progress: HashMap::new(),
            report,
            started: Instant::now(),
            events: self.events.clone(),
        })
    }

    /// Scan a batch to completion.
    pub async fn scan(
        &self,
        markets: Vec<MarketSnapshot>,
        filters: ScanFilters,
    ) -> Result<BatchReport, SurebetError> {
        Ok(self.scan_batch(markets, filters).await?.finish().await)
    }

    /// Latest heartbeat per worker.
    pub fn worker_statuses(&self) -> Vec<WorkerStatus> {
        let mut statuses = self.statuses.lock().unwrap_or_else(|e| e.into_inner());
        {
            let mut rx = self.heartbeats.lock().unwrap_or_else(|e| e.into_inner());
            while let Ok(ScanResponse::Heartbeat(status)) = rx.try_recv() {
                statuses.insert(status.worker_id, status);
            }
        }
        let mut out: Vec<WorkerStatus> = statuses.values().cloned().collect();
        out.sort_by_key(|s| s.worker_id);
        out
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::strategy::arbitrage::ScannerConfig;
    use crate::types::Quote;
    use chrono::Duration as ChronoDuration;

    fn quote(bookmaker: &str, outcome: &str, odds: f64) -> Quote {
        Quote {
            bookmaker: bookmaker.to_string(),
            outcome: outcome.to_string(),
            american_odds: odds,
            game_id: format!("{bookmaker}-game"),
            market_id: format!("{bookmaker}-{outcome}"),
            selection: outcome.to_string(),
            min_stake: None,
            max_stake: None,
            timestamp: Utc::now(),
        }
    }

    /// A two-way market with exactly one arbitrage (A home +120 / B away +105).
    fn arb_market(i: usize) -> MarketSnapshot {
        MarketSnapshot {
            market_id: format!("m{i}"),
            sport: "basketball".to_string(),
            event_name: format!("Team {i} v Other {i}"),
            start_time: Utc::now() + ChronoDuration::hours(3),
            allows_draw: false,
            quotes: vec![
                quote("A", "home", 120.0),
                quote("A", "away", -140.0),
                quote("B", "home", -150.0),
                quote("B", "away", 105.0),
            ],
        }
    }

    fn pool(workers: usize) -> ScannerPool {
        let config = PoolConfig {
            workers: Some(workers),
            ..Default::default()
        };
        ScannerPool::spawn(&config, OpportunityScanner::new(ScannerConfig::default()))
    }

    #[test]
    fn test_worker_count_is_bounded() {
        let config = PoolConfig {
            workers: Some(64),
            max_workers: 4,
            ..Default::default()
        };
        assert_eq!(config.worker_count(), 4);
        let config = PoolConfig {
            workers: Some(0),
            ..Default::default()
        };
        assert_eq!(config.worker_count(), 1);
        assert!(PoolConfig::default().worker_count() >= 1);
    }

    #[tokio::test]
    async fn test_batch_merges_all_workers() {
        let pool = pool(3);
        let markets: Vec<_> = (0..10).map(arb_market).collect();
        let report = pool.scan(markets, ScanFilters::default()).await.unwrap();

        assert!(!report.cancelled);
        assert_eq!(report.total, 10);
        assert_eq!(report.processed, 10);
        assert_eq!(report.opportunities.len(), 10);
        assert!(report.errors.is_empty());
        assert!(report
            .opportunities
            .windows(2)
            .all(|w| w[0].score >= w[1].score));
    }

    #[tokio::test]
    async fn test_empty_batch_finishes_immediately() {
        let pool = pool(2);
        let report = pool.scan(Vec::new(), ScanFilters::default()).await.unwrap();
        assert_eq!(report.processed, 0);
        assert!(report.opportunities.is_empty());
    }

    #[tokio::test]
    async fn test_second_batch_while_running_is_rejected() {
        let pool = pool(2);
        let handle = pool
            .scan_batch((0..4).map(arb_market).collect(), ScanFilters::default())
            .await
            .unwrap();
        let second = pool.scan_batch(vec![arb_market(9)], ScanFilters::default()).await;
        assert!(matches!(second, Err(SurebetError::ScanInProgress)));

        handle.finish().await;
        assert!(pool.scan_batch(vec![arb_market(9)], ScanFilters::default()).await.is_ok());
    }

    #[tokio::test]
    async fn test_cancelled_batch_contains_whole_markets_only() {
        let pool = pool(2);
        let handle = pool
            .scan_batch((0..200).map(arb_market).collect(), ScanFilters::default())
            .await
            .unwrap();
        handle.cancel().await;
        let report = handle.finish().await;

        // Every market yields exactly one opportunity, so a half-scanned
        // market would show up as a mismatch.
        assert_eq!(report.opportunities.len(), report.processed);
        if report.cancelled {
            assert!(report.processed < report.total);
        } else {
            assert_eq!(report.processed, report.total);
        }
    }

    #[tokio::test]
    async fn test_busy_worker_rejects_second_request() {
        let (_req_tx, req_rx) = mpsc::channel(1);
        let (resp_tx, mut resp_rx) = mpsc::unbounded_channel();
        let (hb_tx, _hb_rx) = mpsc::channel(1);
        let mut worker = ScanWorker::new(
            7,
            Arc::new(OpportunityScanner::new(ScannerConfig::default())),
            req_rx,
            resp_tx,
            hb_tx,
            Duration::from_secs(60),
        );
        worker.busy.store(true, Ordering::SeqCst);

        let id = Uuid::new_v4();
        worker.handle(ScanRequest::Calculate {
            correlation_id: id,
            snapshot: arb_market(1),
        });

        match resp_rx.recv().await.unwrap() {
            ScanResponse::Error {
                correlation_id,
                worker_id,
                message,
            } => {
                assert_eq!(correlation_id, id);
                assert_eq!(worker_id, 7);
                assert_eq!(message, BUSY_MESSAGE);
            }
            other => panic!("expected busy error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_single_calculate_returns_result() {
        let (req_tx, req_rx) = mpsc::channel(1);
        let (resp_tx, mut resp_rx) = mpsc::unbounded_channel();
        let (hb_tx, _hb_rx) = mpsc::channel(1);
        let worker = ScanWorker::new(
            0,
            Arc::new(OpportunityScanner::new(ScannerConfig::default())),
            req_rx,
            resp_tx,
            hb_tx,
            Duration::from_secs(60),
        );
        tokio::spawn(worker.run());

        let id = Uuid::new_v4();
        req_tx
            .send(ScanRequest::Calculate {
                correlation_id: id,
                snapshot: arb_market(1),
            })
            .await
            .unwrap();

        match resp_rx.recv().await.unwrap() {
            ScanResponse::Result {
                correlation_id,
                opportunities,
                ..
            } => {
                assert_eq!(correlation_id, id);
                assert_eq!(opportunities.len(), 1);
            }
            other => panic!("expected result, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_heartbeats_report_idle_workers() {
        let config = PoolConfig {
            workers: Some(2),
            heartbeat_interval_ms: 10,
            ..Default::default()
        };
        let pool = ScannerPool::spawn(&config, OpportunityScanner::new(ScannerConfig::default()));
        tokio::time::sleep(Duration::from_millis(50)).await;

        let statuses = pool.worker_statuses();
        assert_eq!(statuses.len(), 2);
        assert!(statuses.iter().all(|s| !s.busy && s.memory_pressure == 0.0));
    }
}
