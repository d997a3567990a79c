pub mod logger;

pub use logger::{LoggerConfig, ScanLogger};

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use rust_decimal::prelude::FromPrimitive;
use rust_decimal::Decimal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::clock::SharedClock;
use crate::config::TradingConfig;
use crate::data::HybridDataFetcher;
use crate::error::EngineError;
use crate::features::{FeatureCalculator, FeatureError, MIN_BARS};
use crate::ml::MlFilter;
use crate::regime::{self, MarketRegime};
use crate::strategies::{all_detectors, DetectInput, Detector, SimpleRules};
use crate::trader::{OpenOutcome, PaperTrader};
use crate::types::{
    validate_slice, DecisionKind, DecisionReason, ScanDecision, SliceIssue, StrategyKind,
    Timeframe,
};

/// Context shared by every cell of one scan tick: the regime gauge and BTC
/// price are computed once and stamped onto every row.
#[derive(Debug, Clone)]
struct TickContext {
    regime: MarketRegime,
    btc_price: Option<Decimal>,
    now: DateTime<Utc>,
}

#[derive(Debug, Default, Clone)]
pub struct TickSummary {
    pub cells: usize,
    pub takes: usize,
    pub near_misses: usize,
    pub skips: usize,
    pub opened: usize,
    pub cancelled_cells: usize,
}

/// Orchestrates one scan cycle: for every `(symbol, strategy)` cell it runs
/// fetch → features → detect → filter → classify, emits exactly one decision
/// per cell no matter what failed, arbitrates the TAKEs through the trader's
/// guards, and hands every row to the scan logger.
pub struct StrategyManager {
    fetcher: Arc<HybridDataFetcher>,
    trader: Arc<PaperTrader>,
    ml: Arc<MlFilter>,
    logger: ScanLogger,
    clock: SharedClock,
    detectors: Vec<Box<dyn Detector>>,
    simple_rules: SimpleRules,
    workers: usize,
}

impl StrategyManager {
    pub fn new(
        fetcher: Arc<HybridDataFetcher>,
        trader: Arc<PaperTrader>,
        ml: Arc<MlFilter>,
        logger: ScanLogger,
        clock: SharedClock,
    ) -> Self {
        let workers = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(4);
        Self {
            fetcher,
            trader,
            ml,
            logger,
            clock,
            detectors: all_detectors(),
            simple_rules: SimpleRules,
            workers,
        }
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers.max(1);
        self
    }

    /// One scan tick against one config snapshot. Cancellation (tick
    /// deadline or shutdown) degrades unclassified cells to SKIP rows; it
    /// never loses them.
    pub async fn run_tick(
        &self,
        config: &Arc<TradingConfig>,
        shutdown: CancellationToken,
    ) -> TickSummary {
        let tick_token = shutdown.child_token();
        let deadline = Duration::from_secs(config.global_settings.max_scan_tick_secs);
        let deadline_token = tick_token.clone();
        let deadline_timer = tokio::spawn(async move {
            tokio::time::sleep(deadline).await;
            deadline_token.cancel();
        });

        let ctx = self.tick_context().await;
        let universe = config.universe();
        let cells: Vec<(String, StrategyKind)> = universe
            .iter()
            .flat_map(|symbol| {
                StrategyKind::all()
                    .into_iter()
                    .map(move |kind| (symbol.clone(), kind))
            })
            .collect();

        let mut decisions: Vec<ScanDecision> = stream::iter(
            cells
                .into_iter()
                .map(|(symbol, kind)| self.process_cell(symbol, kind, &ctx, config, &tick_token)),
        )
        .buffer_unordered(self.workers)
        .collect()
        .await;
        deadline_timer.abort();

        // TAKE arbitration: highest confidence first, strategy order breaks
        // ties, and the trader's guards demote the losers in place.
        let mut opened = 0usize;
        for idx in take_order(&decisions) {
            let decision = &mut decisions[idx];
            match self.trader.try_open(decision, config).await {
                OpenOutcome::Opened(trade_group_id) => {
                    decision.trade_id = Some(trade_group_id);
                    opened += 1;
                }
                OpenOutcome::Rejected(reason) => {
                    decision.demote_to_near_miss(reason);
                }
                OpenOutcome::Failed(e) => {
                    error!(
                        symbol = %decision.symbol,
                        strategy = %decision.strategy,
                        error = %e,
                        "open failed; recording cell as data_unavailable"
                    );
                    decision.decision = DecisionKind::Skip;
                    decision.reason = DecisionReason::DataUnavailable;
                    decision.trade_id = None;
                }
            }
        }

        let mut summary = TickSummary {
            cells: decisions.len(),
            opened,
            ..TickSummary::default()
        };
        for decision in decisions {
            if let Err(violation) = decision.check_invariants() {
                error!(violation = %violation, "decision invariant violated; row still recorded");
            }
            match decision.decision {
                DecisionKind::Take => summary.takes += 1,
                DecisionKind::NearMiss => summary.near_misses += 1,
                DecisionKind::Skip => {
                    summary.skips += 1;
                    if decision.reason == DecisionReason::TickCancelled {
                        summary.cancelled_cells += 1;
                    }
                }
            }
            self.logger.log(decision).await;
        }

        info!(
            cells = summary.cells,
            takes = summary.takes,
            near_misses = summary.near_misses,
            skips = summary.skips,
            opened = summary.opened,
            cancelled = summary.cancelled_cells,
            regime = %ctx.regime,
            logger_queue = self.logger.queue_len(),
            logger_dropped = self.logger.dropped_count(),
            "scan tick complete"
        );
        summary
    }

    async fn tick_context(&self) -> TickContext {
        let now = self.clock.now();
        match self.fetcher.get_recent("BTC", Timeframe::H1, 26).await {
            Ok(bars) => TickContext {
                regime: regime::classify(&bars),
                btc_price: regime::latest_price(&bars),
                now,
            },
            Err(e) => {
                warn!(error = %e, "BTC context unavailable; assuming NORMAL regime");
                TickContext {
                    regime: MarketRegime::Normal,
                    btc_price: None,
                    now,
                }
            }
        }
    }

    async fn process_cell(
        &self,
        symbol: String,
        kind: StrategyKind,
        ctx: &TickContext,
        config: &TradingConfig,
        tick_token: &CancellationToken,
    ) -> ScanDecision {
        let cancelled_decision = || {
            ScanDecision::skip(
                &symbol,
                kind,
                DecisionReason::TickCancelled,
                ctx.regime,
                ctx.btc_price,
                ctx.now,
            )
        };
        if tick_token.is_cancelled() {
            return cancelled_decision();
        }

        let cell_timeout = Duration::from_secs(config.global_settings.cell_timeout_secs);
        tokio::select! {
            _ = tick_token.cancelled() => cancelled_decision(),
            result = tokio::time::timeout(cell_timeout, self.scan_cell(&symbol, kind, ctx, config)) => {
                match result {
                    Ok(decision) => decision,
                    Err(_) => ScanDecision::skip(
                        &symbol,
                        kind,
                        DecisionReason::CellTimeout,
                        ctx.regime,
                        ctx.btc_price,
                        ctx.now,
                    ),
                }
            }
        }
    }

    async fn scan_cell(
        &self,
        symbol: &str,
        kind: StrategyKind,
        ctx: &TickContext,
        config: &TradingConfig,
    ) -> ScanDecision {
        let skip = |reason| ScanDecision::skip(symbol, kind, reason, ctx.regime, ctx.btc_price, ctx.now);

        if !config.strategy_enabled(kind) {
            return skip(DecisionReason::StrategyDisabled);
        }
        if config.blocks_regime(kind, ctx.regime) {
            return skip(DecisionReason::RegimeBlocked);
        }

        let tier = config.tier_for(symbol);
        let timeframe = config.strategy_timeframe(kind);

        let bars = match self
            .fetcher
            .get_recent(symbol, timeframe, scan_lookback_hours(timeframe))
            .await
        {
            Ok(bars) => bars,
            Err(EngineError::Store(e)) => {
                warn!(symbol, strategy = %kind, error = %e, "bars unavailable");
                return skip(DecisionReason::DataUnavailable);
            }
            Err(e) => {
                warn!(symbol, strategy = %kind, error = %e, "bad bar query");
                return skip(DecisionReason::BadData);
            }
        };

        match validate_slice(&bars) {
            Ok(()) => {}
            Err(SliceIssue::Empty) => return skip(DecisionReason::InsufficientData),
            Err(issue) => {
                warn!(symbol, strategy = %kind, ?issue, "rejecting malformed slice");
                return skip(DecisionReason::BadData);
            }
        }

        let calculator = FeatureCalculator::new(config.global_settings.volume_window);
        let features = match calculator.compute(&bars, timeframe) {
            Ok(features) => features,
            Err(FeatureError::InsufficientData { .. }) => {
                return skip(DecisionReason::InsufficientData)
            }
        };

        let input = DetectInput {
            symbol,
            bars: &bars,
            features: &features,
            regime: ctx.regime,
            timeframe,
            now: ctx.now,
        };

        let mut setup = self
            .detectors
            .iter()
            .find(|d| d.kind() == kind)
            .and_then(|detector| detector.detect(&input, config, tier));
        if setup.is_none() && !self.ml.is_active(kind) {
            setup = self.simple_rules.detect_fallback(kind, &input, config, tier);
        }

        let setup = match setup {
            Some(setup) => setup,
            None => {
                let mut decision = skip(DecisionReason::NoSetup);
                decision.features = Some(features);
                decision.thresholds_used = config.thresholds_json(kind, tier);
                return decision;
            }
        };

        let tier_exits = match config.exits_for(kind, tier) {
            Some(exits) => exits,
            None => return skip(DecisionReason::StrategyDisabled),
        };
        let verdict = self.ml.score(kind, &features, &tier_exits);
        let ml_thresholds = config.ml_thresholds(kind, tier);
        let filter_active = self.ml.is_active(kind);

        let mut decision = skip(DecisionReason::NoSetup);
        decision.features = Some(features);
        decision.thresholds_used = config.thresholds_json(kind, tier);
        decision.setup = Some(setup);
        if filter_active {
            decision.ml_confidence = Some(verdict.confidence);
            decision.ml_predictions = Some(verdict.prediction.clone());
        }

        if verdict.confidence >= ml_thresholds.confidence_threshold {
            let multiplier = Decimal::from_f64(verdict.prediction.size_multiplier)
                .unwrap_or(Decimal::ONE);
            let size = config.position_management.base_notional_usd
                * config.size_multiplier(tier)
                * multiplier;
            decision.decision = DecisionKind::Take;
            decision.reason = DecisionReason::SetupConfirmed;
            decision.proposed_position_size = Some(size);
        } else if verdict.confidence >= ml_thresholds.near_miss_threshold {
            decision.decision = DecisionKind::NearMiss;
            decision.reason = DecisionReason::ConfidenceTooLow;
        } else {
            decision.decision = DecisionKind::Skip;
            decision.reason = DecisionReason::BelowNearMiss;
        }
        decision
    }
}

/// Hours of history needed for a full feature window on this timeframe,
/// with a small buffer for ingestion gaps.
pub fn scan_lookback_hours(timeframe: Timeframe) -> i64 {
    (MIN_BARS as i64 * timeframe.minutes() + 59) / 60 + 4
}

/// Indices of TAKE decisions in arbitration order: confidence descending
/// (an inactive filter counts as full confidence), strategy rank ascending.
fn take_order(decisions: &[ScanDecision]) -> Vec<usize> {
    let mut indices: Vec<usize> = decisions
        .iter()
        .enumerate()
        .filter(|(_, d)| d.decision == DecisionKind::Take)
        .map(|(i, _)| i)
        .collect();
    indices.sort_by(|&a, &b| {
        let conf_a = decisions[a].ml_confidence.unwrap_or(1.0);
        let conf_b = decisions[b].ml_confidence.unwrap_or(1.0);
        conf_b
            .partial_cmp(&conf_a)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then(decisions[a].strategy.rank().cmp(&decisions[b].strategy.rank()))
    });
    indices
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::testing::ManualClock;
    use crate::database::testing::MemoryStore;
    use crate::database::BarSource;
    use crate::strategies::dca::dipping_closes;
    use crate::strategies::test_support::bars_from_closes;
    use crate::types::{Side, Tier};
    use rust_decimal_macros::dec;

    struct Fixture {
        store: Arc<MemoryStore>,
        manager: StrategyManager,
        config: Arc<TradingConfig>,
        trader: Arc<PaperTrader>,
    }

    /// Clock pinned to the final bar timestamp of `bars_from_closes` for a
    /// 320-bar series (t0 + 319 * 15m).
    fn fixture(mut config: TradingConfig) -> Fixture {
        let store = Arc::new(MemoryStore::new());
        let t_end = chrono::TimeZone::with_ymd_and_hms(&Utc, 2025, 6, 1, 0, 0, 0).unwrap()
            + chrono::Duration::minutes(15 * 319);
        let clock = ManualClock::at(t_end);
        let fetcher = Arc::new(HybridDataFetcher::new(store.clone(), clock.clone()));
        let trader = Arc::new(PaperTrader::new(
            store.clone(),
            fetcher.clone(),
            clock.clone(),
            config.global_settings.initial_balance_usd,
        ));
        let token = CancellationToken::new();
        let (logger, _handle) = ScanLogger::spawn(
            store.clone(),
            LoggerConfig {
                batch_size: 1,
                flush_interval: Duration::from_millis(10),
                ..LoggerConfig::default()
            },
            token,
        );
        let manager = StrategyManager::new(
            fetcher,
            trader.clone(),
            Arc::new(MlFilter::disabled()),
            logger,
            clock,
        )
        .with_workers(2);

        // Keep the universe small and deterministic, and scope the scanner
        // tests to the DCA/Swing paths; the channel detector has its own
        // coverage and would also fire on the dip fixtures.
        config.market_cap_tiers = [(Tier::MidCap, vec!["LINK".to_string(), "DOT".to_string()])]
            .into_iter()
            .collect();
        config.strategies.channel.enabled = false;
        Fixture {
            store,
            manager,
            config: Arc::new(config),
            trader,
        }
    }

    fn seed_flat(store: &MemoryStore, symbol: &str) {
        let closes = vec![20.0; 320];
        store.seed_bars(BarSource::Recent, bars_from_closes(symbol, &closes, &[]));
    }

    fn seed_dip(store: &MemoryStore, symbol: &str) {
        let closes = dipping_closes(320, 20.0, -2.5, 16);
        let mut volume = vec![1.0; 320];
        for v in volume.iter_mut().skip(304) {
            *v = 1.5;
        }
        store.seed_bars(BarSource::Recent, bars_from_closes(symbol, &closes, &volume));
    }

    async fn settle_logger(store: &MemoryStore, expected: usize) {
        for _ in 0..50 {
            if store.scan_rows().len() >= expected {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    #[tokio::test]
    async fn exactly_one_decision_per_cell() {
        let fx = fixture(TradingConfig::default());
        seed_flat(&fx.store, "LINK");
        seed_flat(&fx.store, "DOT");

        let summary = fx
            .manager
            .run_tick(&fx.config, CancellationToken::new())
            .await;
        assert_eq!(summary.cells, 6); // 2 symbols x 3 strategies
        settle_logger(&fx.store, 6).await;

        let rows = fx.store.scan_rows();
        assert_eq!(rows.len(), 6);
        for symbol in ["LINK", "DOT"] {
            for kind in StrategyKind::all() {
                let count = rows
                    .iter()
                    .filter(|d| d.symbol == symbol && d.strategy == kind)
                    .count();
                assert_eq!(count, 1, "{} {} should have exactly one row", symbol, kind);
            }
        }
    }

    #[tokio::test]
    async fn flat_market_yields_no_setup_with_features() {
        let fx = fixture(TradingConfig::default());
        seed_flat(&fx.store, "LINK");
        seed_flat(&fx.store, "DOT");

        fx.manager.run_tick(&fx.config, CancellationToken::new()).await;
        settle_logger(&fx.store, 6).await;

        let rows = fx.store.scan_rows();
        let dca_link = rows
            .iter()
            .find(|d| d.symbol == "LINK" && d.strategy == StrategyKind::Dca)
            .unwrap();
        assert_eq!(dca_link.decision, DecisionKind::Skip);
        assert_eq!(dca_link.reason, DecisionReason::NoSetup);
        assert!(dca_link.features.is_some());
    }

    #[tokio::test]
    async fn missing_bars_yield_insufficient_data() {
        let fx = fixture(TradingConfig::default());
        seed_flat(&fx.store, "LINK");
        // DOT has no bars at all.

        fx.manager.run_tick(&fx.config, CancellationToken::new()).await;
        settle_logger(&fx.store, 6).await;

        let rows = fx.store.scan_rows();
        let dot_rows: Vec<_> = rows.iter().filter(|d| d.symbol == "DOT").collect();
        assert_eq!(dot_rows.len(), 3);
        for row in dot_rows {
            assert_eq!(row.decision, DecisionKind::Skip);
            let expected = if row.strategy == StrategyKind::Channel {
                DecisionReason::StrategyDisabled
            } else {
                DecisionReason::InsufficientData
            };
            assert_eq!(row.reason, expected, "{}", row.strategy);
        }
    }

    #[tokio::test]
    async fn dip_produces_take_and_opens_position() {
        let fx = fixture(TradingConfig::default());
        seed_dip(&fx.store, "LINK");
        seed_flat(&fx.store, "DOT");

        let summary = fx
            .manager
            .run_tick(&fx.config, CancellationToken::new())
            .await;
        assert_eq!(summary.takes, 1);
        assert_eq!(summary.opened, 1);
        settle_logger(&fx.store, 6).await;

        let rows = fx.store.scan_rows();
        let take = rows
            .iter()
            .find(|d| d.decision == DecisionKind::Take)
            .expect("one TAKE row");
        assert_eq!(take.symbol, "LINK");
        assert_eq!(take.strategy, StrategyKind::Dca);
        assert_eq!(take.reason, DecisionReason::SetupConfirmed);
        assert_eq!(take.proposed_position_size, Some(dec!(100)));
        assert!(take.trade_id.is_some(), "TAKE row carries the trade group id");

        let trades = fx.store.trade_rows();
        assert_eq!(trades.len(), 1);
        assert_eq!(trades[0].side, Side::Buy);
        assert_eq!(trades[0].trade_group_id, take.trade_id.unwrap());
        assert_eq!(fx.trader.status().open_positions, 1);
    }

    #[tokio::test]
    async fn guard_rejection_demotes_to_near_miss() {
        let mut config = TradingConfig::default();
        config.risk_management.max_positions = 1;
        let fx = fixture(config);
        seed_dip(&fx.store, "LINK");
        seed_dip(&fx.store, "DOT");

        let summary = fx
            .manager
            .run_tick(&fx.config, CancellationToken::new())
            .await;
        // Two dips, one slot: one opens, the other demotes in place.
        assert_eq!(summary.opened, 1);
        assert_eq!(summary.takes, 1);
        assert_eq!(summary.near_misses, 1);
        settle_logger(&fx.store, 6).await;

        let rows = fx.store.scan_rows();
        let near_miss = rows
            .iter()
            .find(|d| d.decision == DecisionKind::NearMiss)
            .expect("demoted row");
        assert_eq!(near_miss.reason, DecisionReason::MaxPositionsReached);
        assert!(near_miss.trade_id.is_none());
        assert!(near_miss.setup.is_some(), "rejected setup stays auditable");
        assert_eq!(fx.store.trade_rows().len(), 1);
    }

    #[tokio::test]
    async fn cancelled_tick_records_every_cell() {
        let fx = fixture(TradingConfig::default());
        seed_flat(&fx.store, "LINK");
        seed_flat(&fx.store, "DOT");

        let token = CancellationToken::new();
        token.cancel();
        let summary = fx.manager.run_tick(&fx.config, token).await;
        assert_eq!(summary.cells, 6);
        assert_eq!(summary.cancelled_cells, 6);
        settle_logger(&fx.store, 6).await;

        let rows = fx.store.scan_rows();
        assert_eq!(rows.len(), 6);
        assert!(rows
            .iter()
            .all(|d| d.reason == DecisionReason::TickCancelled));
    }

    #[tokio::test]
    async fn crash_regime_blocks_dca() {
        let fx = fixture(TradingConfig::default());
        seed_dip(&fx.store, "LINK");
        seed_flat(&fx.store, "DOT");
        // BTC down 12% in 24h: CRASH.
        let mut btc = vec![65000.0; 27];
        let n = btc.len();
        btc[n - 1] = 57000.0;
        let t_end = chrono::TimeZone::with_ymd_and_hms(&Utc, 2025, 6, 1, 0, 0, 0).unwrap()
            + chrono::Duration::minutes(15 * 319);
        let t0 = t_end - chrono::Duration::hours(26);
        let btc_bars: Vec<_> = btc
            .iter()
            .enumerate()
            .map(|(i, &price)| {
                let p = Decimal::from_f64(price).unwrap();
                crate::types::OhlcBar {
                    symbol: "BTC".to_string(),
                    timeframe: Timeframe::H1,
                    timestamp: t0 + chrono::Duration::hours(i as i64),
                    open: p,
                    high: p,
                    low: p,
                    close: p,
                    volume: Decimal::ONE,
                    vwap: None,
                    trades: None,
                }
            })
            .collect();
        fx.store.seed_bars(BarSource::Recent, btc_bars);

        let summary = fx
            .manager
            .run_tick(&fx.config, CancellationToken::new())
            .await;
        assert_eq!(summary.takes, 0);
        settle_logger(&fx.store, 6).await;

        let rows = fx.store.scan_rows();
        let dca_link = rows
            .iter()
            .find(|d| d.symbol == "LINK" && d.strategy == StrategyKind::Dca)
            .unwrap();
        assert_eq!(dca_link.reason, DecisionReason::RegimeBlocked);
        assert_eq!(dca_link.market_regime, MarketRegime::Crash);
        assert_eq!(dca_link.btc_price, Some(dec!(57000)));
    }

    #[test]
    fn take_order_prefers_confidence_then_strategy_rank() {
        let now = Utc::now();
        let mk = |strategy: StrategyKind, confidence: Option<f64>| {
            let mut d = ScanDecision::skip(
                "LINK",
                strategy,
                DecisionReason::SetupConfirmed,
                MarketRegime::Normal,
                None,
                now,
            );
            d.decision = DecisionKind::Take;
            d.ml_confidence = confidence;
            d
        };
        let decisions = vec![
            mk(StrategyKind::Channel, Some(0.9)),
            mk(StrategyKind::Swing, Some(0.7)),
            mk(StrategyKind::Dca, Some(0.7)),
            mk(StrategyKind::Swing, None), // unfiltered: treated as 1.0
        ];

        let order = take_order(&decisions);
        assert_eq!(order, vec![3, 0, 2, 1]);
    }

    #[test]
    fn lookback_covers_the_feature_window() {
        for tf in Timeframe::all() {
            let hours = scan_lookback_hours(tf);
            let bars = tf.bars_in_hours(hours);
            assert!(bars >= MIN_BARS, "{}: {} bars", tf, bars);
        }
    }
}
