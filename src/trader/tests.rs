use super::*;
use crate::clock::testing::ManualClock;
use crate::clock::Clock;
use crate::database::testing::MemoryStore;
use crate::database::BarSource;
use crate::regime::MarketRegime;
use crate::types::{DecisionKind, Setup, SetupData, Tier};
use chrono::{Duration as ChronoDuration, TimeZone};
use rust_decimal_macros::dec;

fn fixture() -> (Arc<MemoryStore>, Arc<ManualClock>, PaperTrader, TradingConfig) {
    let store = Arc::new(MemoryStore::new());
    let clock = ManualClock::at(Utc.with_ymd_and_hms(2025, 6, 10, 12, 0, 0).unwrap());
    let fetcher = Arc::new(HybridDataFetcher::new(store.clone(), clock.clone()));
    let config = TradingConfig::default();
    let trader = PaperTrader::new(
        store.clone(),
        fetcher,
        clock.clone(),
        config.global_settings.initial_balance_usd,
    );
    (store, clock, trader, config)
}

fn take_decision(symbol: &str, reference_price: Decimal, notional: Decimal) -> ScanDecision {
    let now = Utc.with_ymd_and_hms(2025, 6, 10, 12, 0, 0).unwrap();
    ScanDecision {
        scan_id: Uuid::new_v4(),
        timestamp: now,
        symbol: symbol.to_string(),
        strategy: StrategyKind::Dca,
        decision: DecisionKind::Take,
        reason: DecisionReason::SetupConfirmed,
        market_regime: MarketRegime::Normal,
        btc_price: Some(dec!(65000)),
        features: None,
        setup: Some(Setup {
            strategy: StrategyKind::Dca,
            symbol: symbol.to_string(),
            detected_at: now,
            reference_price,
            data: SetupData::Dca {
                drop_percent: -2.3,
                reference_high: reference_price * dec!(1.023),
                rsi: 28.0,
                volume_ratio: 0.9,
                support_distance: 1.2,
            },
            suggested_notional: None,
        }),
        ml_confidence: None,
        ml_predictions: None,
        thresholds_used: serde_json::Value::Null,
        proposed_position_size: Some(notional),
        trade_id: None,
    }
}

fn seed_m1_bar(
    store: &MemoryStore,
    symbol: &str,
    ts: DateTime<Utc>,
    open: Decimal,
    high: Decimal,
    low: Decimal,
    close: Decimal,
) {
    store.seed_bars(
        BarSource::Today,
        vec![OhlcBar {
            symbol: symbol.to_string(),
            timeframe: Timeframe::M1,
            timestamp: ts,
            open,
            high,
            low,
            close,
            volume: dec!(1000),
            vwap: None,
            trades: None,
        }],
    );
}

async fn open_link_position(
    store: &Arc<MemoryStore>,
    trader: &PaperTrader,
    config: &TradingConfig,
) -> Position {
    let decision = take_decision("LINK", dec!(19.55), dec!(100));
    match trader.try_open(&decision, config).await {
        OpenOutcome::Opened(_) => {}
        other => panic!("open failed: {:?}", other),
    }
    assert_eq!(store.trade_rows().len(), 1);
    trader.open_positions().pop().unwrap()
}

#[tokio::test]
async fn dca_happy_path_fill_and_exit_levels() {
    let (store, _clock, trader, config) = fixture();
    let position = open_link_position(&store, &trader, &config).await;

    // entry = 19.55 * (1 + 0.0015)
    assert_eq!(position.entry_price, dec!(19.579325));
    // amount = (100 - 0.26) / entry
    let expected_amount = (dec!(100) - dec!(100) * dec!(0.0026)) / dec!(19.579325);
    assert!((position.amount - expected_amount).abs() < dec!(0.000001));
    assert!((position.amount - dec!(5.0941)).abs() < dec!(0.001));
    // mid_cap exits: tp 4%, sl 6%, trailing 3.5%
    assert_eq!(position.take_profit, dec!(19.579325) * dec!(1.04));
    assert_eq!(position.stop_loss, dec!(19.579325) * dec!(0.94));
    assert_eq!(position.trailing_stop_pct, dec!(0.035));
    assert!(position.check_invariants().is_ok());

    let rows = store.trade_rows();
    assert_eq!(rows[0].side, Side::Buy);
    assert_eq!(rows[0].tier, Tier::MidCap);
    assert_eq!(rows[0].trading_engine, ENGINE_NAME);

    let status = trader.status();
    assert_eq!(status.open_positions, 1);
    assert_eq!(status.available_balance, dec!(10000) - dec!(100));
}

#[tokio::test]
async fn take_profit_exit_fires_at_observed_price() {
    let (store, clock, trader, config) = fixture();
    let position = open_link_position(&store, &trader, &config).await;

    clock.advance(ChronoDuration::minutes(30));
    seed_m1_bar(
        &store, "LINK", clock.now(),
        dec!(20.35), dec!(20.41), dec!(20.30), dec!(20.40),
    );

    let closed = trader.exit_tick(&config).await;
    assert_eq!(closed.len(), 1);
    let trade = &closed[0];
    assert_eq!(trade.exit_reason, ExitReason::TakeProfit);
    // Exit at the observed trigger price, not at the earlier tp level.
    assert_eq!(trade.exit_price, dec!(20.40) * dec!(0.9985));

    let expected_pnl = position.amount * (trade.exit_price - position.entry_price)
        - trade.exit_price * position.amount * dec!(0.0026);
    assert!((trade.pnl - expected_pnl).abs() < dec!(0.000001));
    assert!((trade.pnl - dec!(3.76)).abs() < dec!(0.1), "pnl = {}", trade.pnl);

    let rows = store.trade_rows();
    assert_eq!(rows.len(), 2);
    let sell = &rows[1];
    assert_eq!(sell.side, Side::Sell);
    assert_eq!(sell.exit_reason, Some(ExitReason::TakeProfit));
    assert_eq!(sell.trade_group_id, position.trade_group_id);
    assert!(sell.hold_time_hours.unwrap() > 0.0);

    assert_eq!(trader.status().open_positions, 0);
}

#[tokio::test]
async fn trailing_stop_after_profit_keeps_its_label() {
    let (store, clock, trader, config) = fixture();
    let position = open_link_position(&store, &trader, &config).await;

    // Leg 1: rally to 20.20 (+3.2%, above the 1.5% activation); no exit yet.
    clock.advance(ChronoDuration::minutes(10));
    seed_m1_bar(
        &store, "LINK", clock.now(),
        dec!(20.10), dec!(20.20), dec!(20.05), dec!(20.18),
    );
    assert!(trader.exit_tick(&config).await.is_empty());
    let marked = trader.open_positions().pop().unwrap();
    assert_eq!(marked.high_watermark, dec!(20.20));
    assert!(marked.trailing_armed());

    // Leg 2: retrace through the trailing level 20.20 * 0.965 = 19.493.
    clock.advance(ChronoDuration::minutes(10));
    seed_m1_bar(
        &store, "LINK", clock.now(),
        dec!(19.52), dec!(19.53), dec!(19.46), dec!(19.49),
    );
    let closed = trader.exit_tick(&config).await;
    assert_eq!(closed.len(), 1);
    assert_eq!(closed[0].exit_reason, ExitReason::TrailingStop);
    assert_eq!(closed[0].exit_price, dec!(19.49) * dec!(0.9985));
    assert!(closed[0].trade_group_id == position.trade_group_id);
}

#[tokio::test]
async fn never_profitable_position_exits_as_stop_loss() {
    let (store, clock, trader, config) = fixture();
    let position = open_link_position(&store, &trader, &config).await;

    clock.advance(ChronoDuration::minutes(10));
    seed_m1_bar(
        &store, "LINK", clock.now(),
        dec!(18.40), dec!(18.42), dec!(18.25), dec!(18.30),
    );
    let closed = trader.exit_tick(&config).await;
    assert_eq!(closed.len(), 1);
    assert_eq!(closed[0].exit_reason, ExitReason::StopLoss);
    assert_eq!(closed[0].exit_price, dec!(18.30) * dec!(0.9985));
    assert!(position.stop_loss > dec!(18.30));
}

#[tokio::test]
async fn trailing_label_is_rewritten_for_unarmed_positions() {
    let (store, _clock, trader, config) = fixture();
    let position = open_link_position(&store, &trader, &config).await;
    assert!(!position.trailing_armed());

    // Force the mislabel through the close path directly; the policy guard
    // must rewrite it.
    let trade = trader
        .close(&position, ExitReason::TrailingStop, dec!(18.30), &config)
        .await
        .unwrap();
    assert_eq!(trade.exit_reason, ExitReason::StopLoss);

    let rows = store.trade_rows();
    assert_eq!(rows[1].exit_reason, Some(ExitReason::StopLoss));
}

#[tokio::test]
async fn straddling_bar_resolves_by_open_position() {
    let (_store, _clock, trader, config) = fixture();
    let now = trader.clock.now();

    let mut position = Position {
        trade_group_id: Uuid::new_v4(),
        symbol: "LINK".to_string(),
        strategy: StrategyKind::Dca,
        tier: Tier::MidCap,
        entry_price: dec!(19.579325),
        amount: dec!(5.0941),
        notional: dec!(100),
        opened_at: now,
        stop_loss: dec!(18.4046),
        take_profit: dec!(20.3625),
        trailing_stop_pct: dec!(0.035),
        trailing_activation_pct: dec!(0.015),
        high_watermark: dec!(19.579325),
        timeout_at: now + ChronoDuration::hours(72),
        status: PositionStatus::Open,
        scan_id: Uuid::new_v4(),
        predicted: None,
    };

    let straddle = |open: Decimal| OhlcBar {
        symbol: "LINK".to_string(),
        timeframe: Timeframe::M1,
        timestamp: now,
        open,
        high: dec!(20.50),
        low: dec!(18.30),
        close: dec!(19.40),
        volume: dec!(1000),
        vwap: None,
        trades: None,
    };

    // Midpoint of the barriers is (20.3625 + 18.4046) / 2 = 19.38355.
    let (reason, price) = evaluate_exit(&position, &straddle(dec!(19.60)), now).unwrap();
    assert_eq!(reason, ExitReason::TakeProfit);
    assert_eq!(price, position.take_profit);

    position.high_watermark = position.entry_price;
    let (reason, price) = evaluate_exit(&position, &straddle(dec!(19.00)), now).unwrap();
    assert_eq!(reason, ExitReason::StopLoss);
    assert_eq!(price, position.stop_loss);
}

#[tokio::test]
async fn timeout_closes_quiet_positions() {
    let (store, clock, trader, config) = fixture();
    open_link_position(&store, &trader, &config).await;

    // Price drifts sideways, inside every barrier.
    clock.advance(ChronoDuration::hours(73));
    seed_m1_bar(
        &store, "LINK", clock.now(),
        dec!(19.60), dec!(19.62), dec!(19.58), dec!(19.61),
    );
    let closed = trader.exit_tick(&config).await;
    assert_eq!(closed.len(), 1);
    assert_eq!(closed[0].exit_reason, ExitReason::Timeout);
}

#[tokio::test]
async fn position_limit_rejects_with_reason() {
    let (store, _clock, trader, mut config) = fixture();
    config.risk_management.max_positions = 2;
    config.risk_management.max_per_symbol = 3;

    for symbol in ["LINK", "DOT"] {
        let decision = take_decision(symbol, dec!(20), dec!(100));
        assert!(matches!(
            trader.try_open(&decision, &config).await,
            OpenOutcome::Opened(_)
        ));
    }

    let decision = take_decision("SOL", dec!(150), dec!(100));
    match trader.try_open(&decision, &config).await {
        OpenOutcome::Rejected(reason) => {
            assert_eq!(reason, DecisionReason::MaxPositionsReached)
        }
        other => panic!("expected rejection, got {:?}", other),
    }
    // No BUY row for the rejected open.
    assert_eq!(store.trade_rows().len(), 2);
    assert_eq!(trader.status().open_positions, 2);
}

#[tokio::test]
async fn per_symbol_limit_rejects_with_reason() {
    let (_store, _clock, trader, mut config) = fixture();
    config.risk_management.max_per_symbol = 1;

    let first = take_decision("LINK", dec!(20), dec!(100));
    assert!(matches!(trader.try_open(&first, &config).await, OpenOutcome::Opened(_)));

    let second = take_decision("LINK", dec!(19.8), dec!(100));
    match trader.try_open(&second, &config).await {
        OpenOutcome::Rejected(reason) => {
            assert_eq!(reason, DecisionReason::MaxPerSymbolReached)
        }
        other => panic!("expected rejection, got {:?}", other),
    }
}

#[tokio::test]
async fn daily_loss_guard_blocks_new_opens() {
    let (store, clock, trader, mut config) = fixture();
    config.risk_management.max_daily_loss_pct = dec!(0.1); // $10 on $10k

    let decision = take_decision("LINK", dec!(19.55), dec!(1000));
    assert!(matches!(trader.try_open(&decision, &config).await, OpenOutcome::Opened(_)));

    // Stop out for roughly -$69.
    clock.advance(ChronoDuration::minutes(5));
    seed_m1_bar(
        &store, "LINK", clock.now(),
        dec!(18.40), dec!(18.42), dec!(18.25), dec!(18.30),
    );
    let closed = trader.exit_tick(&config).await;
    assert_eq!(closed.len(), 1);
    assert!(closed[0].pnl < Decimal::ZERO);
    assert!(trader.status().daily_loss > dec!(10));

    let next = take_decision("DOT", dec!(5), dec!(100));
    match trader.try_open(&next, &config).await {
        OpenOutcome::Rejected(reason) => {
            assert_eq!(reason, DecisionReason::DailyLossLimitReached)
        }
        other => panic!("expected rejection, got {:?}", other),
    }

    // The guard resets at the UTC day boundary.
    clock.advance(ChronoDuration::days(1));
    let retry = take_decision("DOT", dec!(5), dec!(100));
    assert!(matches!(trader.try_open(&retry, &config).await, OpenOutcome::Opened(_)));
}

#[tokio::test]
async fn balance_guard_honors_reserve() {
    let (_store, _clock, trader, config) = fixture();
    // 10k balance, 20% reserve: an 8.5k notional breaches the reserve floor.
    let decision = take_decision("LINK", dec!(19.55), dec!(8500));
    match trader.try_open(&decision, &config).await {
        OpenOutcome::Rejected(reason) => {
            assert_eq!(reason, DecisionReason::InsufficientBalance)
        }
        other => panic!("expected rejection, got {:?}", other),
    }
}

#[tokio::test]
async fn ml_predictions_override_tier_exits() {
    let (_store, _clock, trader, config) = fixture();
    let mut decision = take_decision("LINK", dec!(19.55), dec!(100));
    decision.ml_confidence = Some(0.8);
    decision.ml_predictions = Some(crate::ml::MlPrediction {
        take_profit_pct: dec!(0.08),
        stop_loss_pct: dec!(0.03),
        hold_hours: 24.0,
        size_multiplier: 1.2,
    });

    assert!(matches!(trader.try_open(&decision, &config).await, OpenOutcome::Opened(_)));
    let position = trader.open_positions().pop().unwrap();
    assert_eq!(position.take_profit, position.entry_price * dec!(1.08));
    assert_eq!(position.stop_loss, position.entry_price * dec!(0.97));
    // Trailing parameters always come from tier config.
    assert_eq!(position.trailing_stop_pct, dec!(0.035));
    assert_eq!(
        position.timeout_at,
        position.opened_at + ChronoDuration::hours(24)
    );
}

#[tokio::test]
async fn restart_recovers_positions_with_identical_exit_behavior() {
    let (store, clock, trader, config) = fixture();
    let original = open_link_position(&store, &trader, &config).await;

    // Process "crashes"; a fresh trader recovers from the store.
    let fetcher = Arc::new(HybridDataFetcher::new(store.clone(), clock.clone()));
    let recovered_trader = PaperTrader::new(
        store.clone(),
        fetcher,
        clock.clone(),
        config.global_settings.initial_balance_usd,
    );
    let recovered = recovered_trader.recover().await.unwrap();
    assert_eq!(recovered, 1);

    let position = recovered_trader.open_positions().pop().unwrap();
    assert_eq!(position.trade_group_id, original.trade_group_id);
    assert_eq!(position.entry_price, original.entry_price);
    assert_eq!(position.stop_loss, original.stop_loss);
    assert_eq!(position.take_profit, original.take_profit);
    assert_eq!(
        recovered_trader.status().available_balance,
        dec!(10000) - dec!(100)
    );

    // The same subsequent price stream produces the same exit.
    clock.advance(ChronoDuration::minutes(30));
    seed_m1_bar(
        &store, "LINK", clock.now(),
        dec!(20.35), dec!(20.41), dec!(20.30), dec!(20.40),
    );
    let closed = recovered_trader.exit_tick(&config).await;
    assert_eq!(closed.len(), 1);
    assert_eq!(closed[0].exit_reason, ExitReason::TakeProfit);
    assert_eq!(closed[0].exit_price, dec!(20.40) * dec!(0.9985));
}

#[tokio::test]
async fn close_all_uses_manual_reason() {
    let (store, clock, trader, config) = fixture();
    open_link_position(&store, &trader, &config).await;
    seed_m1_bar(
        &store, "LINK", clock.now(),
        dec!(19.60), dec!(19.62), dec!(19.58), dec!(19.61),
    );

    let closed = trader.close_all(&config).await;
    assert_eq!(closed.len(), 1);
    assert_eq!(closed[0].exit_reason, ExitReason::Manual);
    assert_eq!(trader.status().open_positions, 0);
    assert_eq!(store.trade_rows().len(), 2);
}

#[tokio::test]
async fn open_cap_holds_under_concurrent_pressure() {
    let (_store, _clock, trader, mut config) = fixture();
    config.risk_management.max_positions = 5;
    config.risk_management.max_per_symbol = 10;
    let trader = Arc::new(trader);
    let config = Arc::new(config);

    let mut handles = Vec::new();
    for i in 0..20 {
        let trader = Arc::clone(&trader);
        let config = Arc::clone(&config);
        handles.push(tokio::spawn(async move {
            let decision = take_decision("LINK", dec!(20) + Decimal::from(i), dec!(100));
            matches!(trader.try_open(&decision, &config).await, OpenOutcome::Opened(_))
        }));
    }
    let opened = futures::future::join_all(handles)
        .await
        .into_iter()
        .filter(|r| *r.as_ref().unwrap())
        .count();
    assert_eq!(opened, 5);
    assert_eq!(trader.status().open_positions, 5);
}

#[tokio::test]
async fn take_without_size_fails_without_mutation() {
    let (store, _clock, trader, config) = fixture();

    let before = trader.status().available_balance;
    let mut decision = take_decision("LINK", dec!(19.55), dec!(100));
    decision.proposed_position_size = None;
    match trader.try_open(&decision, &config).await {
        OpenOutcome::Failed(EngineError::Invariant(_)) => {}
        other => panic!("expected invariant failure, got {:?}", other),
    }
    assert_eq!(trader.status().available_balance, before);
    assert_eq!(trader.status().open_positions, 0);
    assert!(store.trade_rows().is_empty());
}
