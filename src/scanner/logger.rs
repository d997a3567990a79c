use std::io::Write;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::database::SharedStore;
use crate::types::{DecisionKind, ScanDecision};

#[derive(Debug, Clone)]
pub struct LoggerConfig {
    pub queue_capacity: usize,
    pub batch_size: usize,
    pub flush_interval: Duration,
    /// Consecutive flush failures tolerated before the retained batch spills
    /// to the fallback file.
    pub max_failures: u32,
    pub spill_path: PathBuf,
    /// How long a TAKE enqueue may block on a full queue.
    pub take_enqueue_timeout: Duration,
}

impl Default for LoggerConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 4096,
            batch_size: 100,
            flush_interval: Duration::from_secs(5),
            max_failures: 5,
            spill_path: PathBuf::from("scan_history_spill.jsonl"),
            take_enqueue_timeout: Duration::from_secs(10),
        }
    }
}

/// Buffered, batch-inserting persister of scan decisions. `log` never blocks
/// for SKIP/NEAR_MISS rows: under backpressure those are dropped (counted),
/// while TAKE rows block briefly so the audit trail of every trade survives.
#[derive(Clone)]
pub struct ScanLogger {
    tx: mpsc::Sender<ScanDecision>,
    dropped: Arc<AtomicU64>,
    take_timeout: Duration,
}

impl ScanLogger {
    /// Start the flusher task and hand back the logging handle.
    pub fn spawn(
        store: SharedStore,
        config: LoggerConfig,
        shutdown: CancellationToken,
    ) -> (Self, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(config.queue_capacity);
        let dropped = Arc::new(AtomicU64::new(0));
        let worker = FlushWorker {
            rx,
            store,
            batch_size: config.batch_size,
            flush_interval: config.flush_interval,
            max_failures: config.max_failures,
            spill_path: config.spill_path,
            pending: Vec::new(),
            consecutive_failures: 0,
        };
        let handle = tokio::spawn(worker.run(shutdown));
        (
            Self {
                tx,
                dropped,
                take_timeout: config.take_enqueue_timeout,
            },
            handle,
        )
    }

    pub async fn log(&self, decision: ScanDecision) {
        if decision.decision == DecisionKind::Take {
            // TAKE rows are precious: block up to the configured bound.
            match tokio::time::timeout(self.take_timeout, self.tx.send(decision)).await {
                Ok(Ok(())) => {}
                Ok(Err(_)) => error!("scan logger closed; TAKE decision lost"),
                Err(_) => error!("scan logger saturated; TAKE decision lost after timeout"),
            }
            return;
        }

        if let Err(e) = self.tx.try_send(decision) {
            match e {
                mpsc::error::TrySendError::Full(d) => {
                    let total = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                    if total % 100 == 1 {
                        warn!(
                            symbol = %d.symbol,
                            dropped_total = total,
                            "scan logger queue full; dropping non-TAKE decisions"
                        );
                    }
                }
                mpsc::error::TrySendError::Closed(_) => {
                    warn!("scan logger closed; decision dropped");
                }
            }
        }
    }

    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn queue_len(&self) -> usize {
        self.tx.max_capacity() - self.tx.capacity()
    }
}

struct FlushWorker {
    rx: mpsc::Receiver<ScanDecision>,
    store: SharedStore,
    batch_size: usize,
    flush_interval: Duration,
    max_failures: u32,
    spill_path: PathBuf,
    pending: Vec<ScanDecision>,
    consecutive_failures: u32,
}

impl FlushWorker {
    async fn run(mut self, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(self.flush_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker.tick().await;

        loop {
            tokio::select! {
                maybe = self.rx.recv() => {
                    match maybe {
                        Some(decision) => {
                            self.pending.push(decision);
                            if self.pending.len() >= self.batch_size {
                                self.flush().await;
                            }
                        }
                        None => break,
                    }
                }
                _ = ticker.tick() => {
                    if !self.pending.is_empty() {
                        self.flush().await;
                    }
                }
                _ = shutdown.cancelled() => break,
            }
        }

        // Clean shutdown: drain whatever is still queued, then flush once
        // more. This is the at-least-once half of the delivery contract.
        while let Ok(decision) = self.rx.try_recv() {
            self.pending.push(decision);
        }
        if !self.pending.is_empty() {
            self.flush().await;
        }
        if !self.pending.is_empty() {
            warn!(retained = self.pending.len(), "spilling unflushed decisions at shutdown");
            self.spill();
        }
        info!("scan logger flusher stopped");
    }

    async fn flush(&mut self) {
        match self.store.insert_scan_batch(&self.pending).await {
            Ok(()) => {
                self.pending.clear();
                self.consecutive_failures = 0;
            }
            Err(e) => {
                self.consecutive_failures += 1;
                warn!(
                    error = %e,
                    failures = self.consecutive_failures,
                    retained = self.pending.len(),
                    "scan batch insert failed; retaining batch"
                );
                if self.consecutive_failures >= self.max_failures {
                    self.spill();
                    self.consecutive_failures = 0;
                }
            }
        }
    }

    /// Move the retained batch to the local fallback file so the queue keeps
    /// draining while the store misbehaves.
    fn spill(&mut self) {
        let result = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.spill_path)
            .and_then(|mut file| {
                for decision in &self.pending {
                    match serde_json::to_string(decision) {
                        Ok(line) => writeln!(file, "{}", line)?,
                        Err(e) => warn!(error = %e, "unserializable decision skipped in spill"),
                    }
                }
                file.flush()
            });

        match result {
            Ok(()) => {
                error!(
                    spilled = self.pending.len(),
                    path = %self.spill_path.display(),
                    "scan decisions spilled to fallback file"
                );
                self.pending.clear();
            }
            Err(e) => {
                // Disk trouble on the spill file is the one thing we cannot
                // absorb locally; keep the batch and let the next flush try.
                error!(error = %e, "failed to write spill file; batch retained");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::testing::MemoryStore;
    use crate::regime::MarketRegime;
    use crate::types::{DecisionReason, StrategyKind};
    use chrono::Utc;
    use std::sync::atomic::Ordering as AtomicOrdering;

    fn decision(symbol: &str) -> ScanDecision {
        ScanDecision::skip(
            symbol,
            StrategyKind::Dca,
            DecisionReason::NoSetup,
            MarketRegime::Normal,
            None,
            Utc::now(),
        )
    }

    fn config_with(spill: &str) -> LoggerConfig {
        LoggerConfig {
            queue_capacity: 16,
            batch_size: 4,
            flush_interval: Duration::from_millis(50),
            max_failures: 2,
            spill_path: std::env::temp_dir().join(spill),
            take_enqueue_timeout: Duration::from_millis(100),
        }
    }

    #[tokio::test]
    async fn flushes_when_batch_fills() {
        let store = Arc::new(MemoryStore::new());
        let token = CancellationToken::new();
        let (logger, _handle) =
            ScanLogger::spawn(store.clone(), config_with("spill-a.jsonl"), token.clone());

        for i in 0..4 {
            logger.log(decision(&format!("SYM{}", i))).await;
        }
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(store.scan_rows().len(), 4);
        token.cancel();
    }

    #[tokio::test]
    async fn flushes_on_interval_even_below_batch_size() {
        let store = Arc::new(MemoryStore::new());
        let token = CancellationToken::new();
        let (logger, _handle) =
            ScanLogger::spawn(store.clone(), config_with("spill-b.jsonl"), token.clone());

        logger.log(decision("BTC")).await;
        tokio::time::sleep(Duration::from_millis(120)).await;
        assert_eq!(store.scan_rows().len(), 1);
        token.cancel();
    }

    #[tokio::test]
    async fn drains_queue_on_shutdown() {
        let store = Arc::new(MemoryStore::new());
        let token = CancellationToken::new();
        let (logger, handle) =
            ScanLogger::spawn(store.clone(), config_with("spill-c.jsonl"), token.clone());

        for i in 0..3 {
            logger.log(decision(&format!("SYM{}", i))).await;
        }
        token.cancel();
        handle.await.unwrap();
        assert_eq!(store.scan_rows().len(), 3);
    }

    #[tokio::test]
    async fn replayed_scan_id_inserts_once() {
        let store = Arc::new(MemoryStore::new());
        let token = CancellationToken::new();
        let (logger, handle) =
            ScanLogger::spawn(store.clone(), config_with("spill-d.jsonl"), token.clone());

        let d = decision("BTC");
        logger.log(d.clone()).await;
        logger.log(d).await;
        token.cancel();
        handle.await.unwrap();
        assert_eq!(store.scan_rows().len(), 1);
    }

    #[tokio::test]
    async fn spills_after_repeated_failures() {
        let store = Arc::new(MemoryStore::new());
        let spill_name = format!("spill-{}.jsonl", uuid::Uuid::new_v4());
        let config = config_with(&spill_name);
        let spill_path = config.spill_path.clone();
        store.fail_scan_inserts.store(10, AtomicOrdering::Release);

        let token = CancellationToken::new();
        let (logger, _handle) = ScanLogger::spawn(store.clone(), config, token.clone());

        for i in 0..4 {
            logger.log(decision(&format!("SYM{}", i))).await;
        }
        // Two failed flushes (size + interval) trip max_failures = 2.
        tokio::time::sleep(Duration::from_millis(200)).await;

        let spilled = std::fs::read_to_string(&spill_path).unwrap_or_default();
        assert!(
            spilled.lines().count() >= 4,
            "expected spilled lines, got: {}",
            spilled.lines().count()
        );
        assert_eq!(store.scan_rows().len(), 0);
        token.cancel();
        std::fs::remove_file(&spill_path).ok();
    }

    #[tokio::test]
    async fn queue_overflow_drops_non_take_only() {
        // No flusher attached: the receiver is parked so the queue stays
        // full and the drop path is observable.
        let (tx, _rx) = mpsc::channel(2);
        let logger = ScanLogger {
            tx,
            dropped: Arc::new(AtomicU64::new(0)),
            take_timeout: Duration::from_millis(20),
        };

        logger.log(decision("A")).await;
        logger.log(decision("B")).await;
        assert_eq!(logger.queue_len(), 2);

        logger.log(decision("C")).await; // full: dropped
        assert_eq!(logger.dropped_count(), 1);

        // A TAKE blocks (bounded) instead of being dropped silently.
        let mut take = decision("D");
        take.decision = DecisionKind::Take;
        let started = std::time::Instant::now();
        logger.log(take).await;
        assert!(started.elapsed() >= Duration::from_millis(15));
        assert_eq!(logger.dropped_count(), 1);
    }
}
