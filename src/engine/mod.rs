use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::clock::SharedClock;
use crate::config::{ConfigHandle, ConfigLoader, MlConfig};
use crate::data::HybridDataFetcher;
use crate::database::SharedStore;
use crate::error::EngineError;
use crate::ml::MlFilter;
use crate::scanner::{LoggerConfig, ScanLogger, StrategyManager};
use crate::trader::PaperTrader;

const SUPERVISOR_BACKOFF_BASE: Duration = Duration::from_millis(500);
const SUPERVISOR_BACKOFF_CAP: Duration = Duration::from_secs(30);
/// Consecutive crashes before a service is marked `error` in its heartbeat.
/// Restarts continue regardless.
const SUPERVISOR_ALARM_THRESHOLD: u32 = 5;

/// Everything the running engine is composed of. Built once at startup;
/// tests assemble alternative engines from the same parts.
pub struct Engine {
    store: SharedStore,
    config_handle: ConfigHandle,
    config_loader: Arc<ConfigLoader>,
    fetcher: Arc<HybridDataFetcher>,
    trader: Arc<PaperTrader>,
    manager: Arc<StrategyManager>,
    logger_handle: JoinHandle<()>,
    shutdown: CancellationToken,
}

impl Engine {
    /// Wire the components together from a validated config snapshot. The
    /// ML filter loads its artifacts here; everything else is lazy.
    pub async fn assemble(
        store: SharedStore,
        config_handle: ConfigHandle,
        config_loader: ConfigLoader,
        clock: SharedClock,
    ) -> Self {
        let shutdown = CancellationToken::new();
        let config = config_handle.snapshot().await;

        let fetcher = Arc::new(HybridDataFetcher::new(store.clone(), clock.clone()));
        let trader = Arc::new(PaperTrader::new(
            store.clone(),
            fetcher.clone(),
            clock.clone(),
            config.global_settings.initial_balance_usd,
        ));

        let MlConfig { enabled, artifact_dir } = config.ml.clone();
        let ml = Arc::new(MlFilter::load(std::path::Path::new(&artifact_dir), enabled));

        let (logger, logger_handle) = ScanLogger::spawn(
            store.clone(),
            LoggerConfig::default(),
            shutdown.clone(),
        );

        let manager = Arc::new(StrategyManager::new(
            fetcher.clone(),
            trader.clone(),
            ml,
            logger,
            clock.clone(),
        ));

        Self {
            store,
            config_handle,
            config_loader: Arc::new(config_loader),
            fetcher,
            trader,
            manager,
            logger_handle,
            shutdown,
        }
    }

    /// Boot sequence and main supervision loop. Returns the process exit
    /// code: 0 for a clean stop, 130 when a termination signal stopped us.
    pub async fn run(self) -> Result<i32, EngineError> {
        let recovered = self.trader.recover().await?;
        info!(recovered, "paper trader ready");

        let scan_task = self.spawn_scan_loop();
        let exit_task = self.spawn_exit_loop();
        let watcher_task = self.spawn_config_watcher();

        let signalled = wait_for_shutdown_signal(&self.shutdown, self.config_loader.clone()).await;
        info!("shutting down: cancelling loops");
        self.shutdown.cancel();

        for (name, task) in [
            ("scan_loop", scan_task),
            ("exit_loop", exit_task),
            ("config_watcher", watcher_task),
        ] {
            if tokio::time::timeout(Duration::from_secs(15), task).await.is_err() {
                warn!(service = name, "did not stop within the grace window");
            }
        }
        // The logger flusher drains its queue on cancellation; give it the
        // same grace window so at-least-once holds for clean shutdowns.
        if tokio::time::timeout(Duration::from_secs(15), self.logger_handle)
            .await
            .is_err()
        {
            warn!("scan logger did not drain within the grace window");
        }

        for service in ["scan_loop", "exit_loop", "config_watcher"] {
            let _ = self
                .store
                .upsert_heartbeat(service, "stopped", serde_json::json!({}))
                .await;
        }

        info!("engine stopped");
        Ok(if signalled { 130 } else { 0 })
    }

    fn spawn_scan_loop(&self) -> JoinHandle<()> {
        let manager = self.manager.clone();
        let config_handle = self.config_handle.clone();
        let store = self.store.clone();
        let fetcher = self.fetcher.clone();
        let token = self.shutdown.clone();

        supervise("scan_loop", self.store.clone(), token.clone(), move || {
            let manager = manager.clone();
            let config_handle = config_handle.clone();
            let store = store.clone();
            let fetcher = fetcher.clone();
            let token = token.clone();
            async move {
                let mut tick_count: u64 = 0;
                loop {
                    let config = config_handle.snapshot().await;
                    let interval = Duration::from_secs(config.global_settings.scan_interval_secs);
                    let started = tokio::time::Instant::now();

                    // A tick runs to completion or cancellation before the
                    // next one may start.
                    let summary = manager.run_tick(&config, token.clone()).await;
                    tick_count += 1;

                    let status = match fetcher.freshness("BTC").await {
                        Ok(Some(age))
                            if age.num_seconds()
                                > config.global_settings.freshness_threshold_secs =>
                        {
                            warn!(age_secs = age.num_seconds(), "market data stale");
                            "degraded"
                        }
                        Ok(_) => "ok",
                        Err(_) => "degraded",
                    };
                    let _ = store
                        .upsert_heartbeat(
                            "scan_loop",
                            status,
                            serde_json::json!({
                                "ticks": tick_count,
                                "cells": summary.cells,
                                "takes": summary.takes,
                                "opened": summary.opened,
                                "cancelled_cells": summary.cancelled_cells,
                            }),
                        )
                        .await;

                    let elapsed = started.elapsed();
                    let wait = interval.saturating_sub(elapsed);
                    tokio::select! {
                        _ = token.cancelled() => return Ok(()),
                        _ = tokio::time::sleep(wait) => {}
                    }
                }
            }
        })
    }

    fn spawn_exit_loop(&self) -> JoinHandle<()> {
        let trader = self.trader.clone();
        let config_handle = self.config_handle.clone();
        let store = self.store.clone();
        let token = self.shutdown.clone();

        supervise("exit_loop", self.store.clone(), token.clone(), move || {
            let trader = trader.clone();
            let config_handle = config_handle.clone();
            let store = store.clone();
            let token = token.clone();
            async move {
                loop {
                    let config = config_handle.snapshot().await;
                    let interval =
                        Duration::from_secs(config.global_settings.exit_check_interval_secs);

                    let closed = trader.exit_tick(&config).await;
                    for trade in &closed {
                        info!(
                            symbol = %trade.symbol,
                            reason = %trade.exit_reason,
                            pnl = %trade.pnl,
                            "exit recorded"
                        );
                    }

                    let status = trader.status();
                    let _ = store
                        .upsert_heartbeat(
                            "exit_loop",
                            "ok",
                            serde_json::json!({
                                "open_positions": status.open_positions,
                                "available_balance": status.available_balance,
                                "realized_pnl": status.realized_pnl,
                                "win_rate_pct": status.win_rate_pct(),
                            }),
                        )
                        .await;

                    tokio::select! {
                        _ = token.cancelled() => return Ok(()),
                        _ = tokio::time::sleep(interval) => {}
                    }
                }
            }
        })
    }

    fn spawn_config_watcher(&self) -> JoinHandle<()> {
        let loader = self.config_loader.clone();
        let store = self.store.clone();
        let token = self.shutdown.clone();

        supervise("config_watcher", store, token.clone(), move || {
            let loader = loader.clone();
            let token = token.clone();
            async move {
                loader.watch(token).await;
                Ok(())
            }
        })
    }
}

/// Restart wrapper shared by every long-lived loop: crashes (errors or
/// panics) restart with exponential backoff, and a crash streak marks the
/// service `error` in its heartbeat while restarts continue.
fn supervise<F, Fut>(
    name: &'static str,
    store: SharedStore,
    shutdown: CancellationToken,
    factory: F,
) -> JoinHandle<()>
where
    F: Fn() -> Fut + Send + 'static,
    Fut: std::future::Future<Output = Result<(), EngineError>> + Send + 'static,
{
    tokio::spawn(async move {
        let mut backoff = SUPERVISOR_BACKOFF_BASE;
        let mut consecutive_failures: u32 = 0;

        loop {
            if shutdown.is_cancelled() {
                return;
            }

            let run = tokio::spawn(factory());
            let crashed = match run.await {
                Ok(Ok(())) => {
                    info!(service = name, "loop exited cleanly");
                    return;
                }
                Ok(Err(e)) => {
                    error!(service = name, error = %e, "loop failed");
                    true
                }
                Err(join_error) => {
                    error!(service = name, error = %join_error, "loop panicked");
                    true
                }
            };

            if crashed {
                consecutive_failures += 1;
                if consecutive_failures >= SUPERVISOR_ALARM_THRESHOLD {
                    error!(
                        service = name,
                        consecutive_failures,
                        "service is crash-looping; marked error, restarts continue"
                    );
                    let _ = store
                        .upsert_heartbeat(
                            name,
                            "error",
                            serde_json::json!({ "consecutive_failures": consecutive_failures }),
                        )
                        .await;
                }

                tokio::select! {
                    _ = shutdown.cancelled() => return,
                    _ = tokio::time::sleep(backoff) => {}
                }
                backoff = (backoff * 2).min(SUPERVISOR_BACKOFF_CAP);
            }
        }
    })
}

/// Block until SIGINT/SIGTERM (returns true) or until something else cancels
/// the shutdown token (returns false). SIGHUP triggers a config reload
/// without stopping.
async fn wait_for_shutdown_signal(
    shutdown: &CancellationToken,
    loader: Arc<ConfigLoader>,
) -> bool {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = match signal(SignalKind::terminate()) {
            Ok(s) => s,
            Err(e) => {
                error!(error = %e, "cannot install SIGTERM handler");
                shutdown.cancelled().await;
                return false;
            }
        };
        let mut sighup = signal(SignalKind::hangup()).ok();

        loop {
            let hup = async {
                match sighup.as_mut() {
                    Some(s) => {
                        s.recv().await;
                    }
                    None => std::future::pending::<()>().await,
                }
            };
            tokio::select! {
                _ = tokio::signal::ctrl_c() => return true,
                _ = sigterm.recv() => return true,
                _ = hup => {
                    info!("SIGHUP: reloading configuration");
                    match loader.reload_once().await {
                        Ok(true) => info!("configuration replaced"),
                        Ok(false) => info!("configuration unchanged"),
                        Err(e) => warn!(error = %e, "reload failed; keeping previous snapshot"),
                    }
                }
                _ = shutdown.cancelled() => return false,
            }
        }
    }

    #[cfg(not(unix))]
    {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => true,
            _ = shutdown.cancelled() => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::testing::MemoryStore;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test(start_paused = true)]
    async fn supervisor_restarts_failed_loops_with_backoff() {
        let store = Arc::new(MemoryStore::new());
        let token = CancellationToken::new();
        let attempts = Arc::new(AtomicU32::new(0));

        let counter = attempts.clone();
        let inner_token = token.clone();
        let handle = supervise("test_loop", store.clone(), token.clone(), move || {
            let counter = counter.clone();
            let token = inner_token.clone();
            async move {
                let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
                if n < 3 {
                    Err(EngineError::Fatal(format!("boom {}", n)))
                } else {
                    token.cancelled().await;
                    Ok(())
                }
            }
        });

        // Two failures (0.5s + 1s backoff), then the loop stays up.
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(attempts.load(Ordering::SeqCst), 3);

        token.cancel();
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn crash_streak_marks_service_error() {
        let store = Arc::new(MemoryStore::new());
        let token = CancellationToken::new();

        let handle = supervise("flappy", store.clone(), token.clone(), move || async move {
            Err(EngineError::Fatal("always".to_string()))
        });

        // Enough wall-clock for well over five crashes.
        tokio::time::sleep(Duration::from_secs(120)).await;
        let heartbeats = store.heartbeats.lock();
        let (_, status, metadata) = heartbeats.get("flappy").expect("error heartbeat written");
        assert_eq!(status.as_str(), "error");
        assert!(metadata["consecutive_failures"].as_u64().unwrap() >= 5);
        drop(heartbeats);

        token.cancel();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn supervisor_exits_cleanly_when_cancelled() {
        let store = Arc::new(MemoryStore::new());
        let token = CancellationToken::new();
        let inner = token.clone();
        let handle = supervise("quiet", store, token.clone(), move || {
            let token = inner.clone();
            async move {
                token.cancelled().await;
                Ok(())
            }
        });

        token.cancel();
        handle.await.unwrap();
    }
}
