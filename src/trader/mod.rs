use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, NaiveDate, Utc};
use parking_lot::Mutex;
use rust_decimal::Decimal;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::clock::SharedClock;
use crate::config::TradingConfig;
use crate::data::HybridDataFetcher;
use crate::database::{SharedStore, TradeRow, ENGINE_NAME};
use crate::error::EngineError;
use crate::types::{
    DecisionReason, ExitReason, OhlcBar, Position, PositionStatus, ScanDecision, Side,
    StrategyKind, Timeframe,
};

/// Result of handing a TAKE decision to the trader.
#[derive(Debug)]
pub enum OpenOutcome {
    Opened(Uuid),
    /// A risk guard rejected the open; the reason names the guard.
    Rejected(DecisionReason),
    /// Store trouble; nothing was opened, nothing was mutated.
    Failed(EngineError),
}

#[derive(Debug, Clone)]
pub struct ClosedTrade {
    pub trade_group_id: Uuid,
    pub symbol: String,
    pub exit_reason: ExitReason,
    pub exit_price: Decimal,
    pub pnl: Decimal,
}

#[derive(Debug, Clone)]
pub struct TraderStatus {
    pub open_positions: usize,
    pub available_balance: Decimal,
    pub realized_pnl: Decimal,
    pub daily_loss: Decimal,
    pub wins: u64,
    pub losses: u64,
}

impl TraderStatus {
    pub fn win_rate_pct(&self) -> f64 {
        let total = self.wins + self.losses;
        if total == 0 {
            return 0.0;
        }
        self.wins as f64 / total as f64 * 100.0
    }
}

struct TraderState {
    positions: HashMap<Uuid, Position>,
    available_balance: Decimal,
    initial_balance: Decimal,
    realized_pnl: Decimal,
    daily_loss: Decimal,
    daily_loss_day: NaiveDate,
    wins: u64,
    losses: u64,
}

impl TraderState {
    fn reset_daily_loss_if_new_day(&mut self, today: NaiveDate) {
        if today != self.daily_loss_day {
            self.daily_loss = Decimal::ZERO;
            self.daily_loss_day = today;
            info!("daily loss counter reset");
        }
    }

    fn open_for_symbol(&self, symbol: &str) -> usize {
        self.positions
            .values()
            .filter(|p| p.is_open() && p.symbol == symbol)
            .count()
    }

    fn open_for_strategy(&self, strategy: StrategyKind) -> usize {
        self.positions
            .values()
            .filter(|p| p.is_open() && p.strategy == strategy)
            .count()
    }
}

/// Owns every simulated position: opens them from TAKE decisions behind the
/// risk guards, marks them against fresh prices, and closes them when an
/// exit rule fires. The position table lives behind one mutex that is never
/// held across I/O.
pub struct PaperTrader {
    store: SharedStore,
    fetcher: Arc<HybridDataFetcher>,
    clock: SharedClock,
    state: Mutex<TraderState>,
}

impl PaperTrader {
    pub fn new(
        store: SharedStore,
        fetcher: Arc<HybridDataFetcher>,
        clock: SharedClock,
        initial_balance: Decimal,
    ) -> Self {
        let today = clock.now().date_naive();
        Self {
            store,
            fetcher,
            clock,
            state: Mutex::new(TraderState {
                positions: HashMap::new(),
                available_balance: initial_balance,
                initial_balance,
                realized_pnl: Decimal::ZERO,
                daily_loss: Decimal::ZERO,
                daily_loss_day: today,
                wins: 0,
                losses: 0,
            }),
        }
    }

    /// Reload unclosed positions (BUY rows without a SELL) and resume
    /// managing them with their originally stored exit parameters.
    pub async fn recover(&self) -> Result<usize, EngineError> {
        let positions = self.store.load_open_positions().await?;
        let mut state = self.state.lock();
        let count = positions.len();
        for position in positions {
            state.available_balance -= position.notional;
            state.positions.insert(position.trade_group_id, position);
        }
        if count > 0 {
            info!(count, balance = %state.available_balance, "recovered open positions");
        }
        Ok(count)
    }

    /// Open path for an accepted TAKE. Guards run in a fixed order and the
    /// first failure names itself in the rejection; on success the BUY row
    /// is persisted before the decision row ever reaches the logger.
    pub async fn try_open(&self, decision: &ScanDecision, config: &TradingConfig) -> OpenOutcome {
        let setup = match &decision.setup {
            Some(setup) => setup.clone(),
            None => {
                return OpenOutcome::Failed(EngineError::Invariant(format!(
                    "TAKE without setup for {} {}",
                    decision.symbol, decision.strategy
                )))
            }
        };
        let notional = match decision.proposed_position_size {
            Some(size) if size > Decimal::ZERO => size,
            other => {
                return OpenOutcome::Failed(EngineError::Invariant(format!(
                    "TAKE without positive size ({:?}) for {}",
                    other, decision.symbol
                )))
            }
        };

        let now = self.clock.now();
        let tier = config.tier_for(&decision.symbol);
        let risk = &config.risk_management;

        // Fill simulation.
        let slippage = config.slippage(tier);
        let entry_price = setup.reference_price * (Decimal::ONE + slippage);
        let fees = notional * config.fees.taker;
        if entry_price <= Decimal::ZERO {
            return OpenOutcome::Failed(EngineError::DataQuality(format!(
                "non-positive entry price for {}",
                decision.symbol
            )));
        }
        let amount = (notional - fees) / entry_price;

        // Exit parameters come from the snapshot active right now; the ML
        // prediction overrides the tier percentages when present.
        let tier_exits = match config.exits_for(decision.strategy, tier) {
            Some(exits) => exits,
            None => return OpenOutcome::Rejected(DecisionReason::StrategyDisabled),
        };
        let (tp_pct, sl_pct, hold_hours) = match &decision.ml_predictions {
            Some(p) => (p.take_profit_pct, p.stop_loss_pct, p.hold_hours),
            None => (
                tier_exits.take_profit,
                tier_exits.stop_loss,
                tier_exits.hold_hours as f64,
            ),
        };
        let take_profit = entry_price * (Decimal::ONE + tp_pct);
        let stop_loss = entry_price * (Decimal::ONE - sl_pct);
        let timeout_at = now
            + chrono::Duration::seconds((hold_hours * 3600.0).max(0.0).round() as i64);

        let trade_group_id = Uuid::new_v4();
        let position = Position {
            trade_group_id,
            symbol: decision.symbol.clone(),
            strategy: decision.strategy,
            tier,
            entry_price,
            amount,
            notional,
            opened_at: now,
            stop_loss,
            take_profit,
            trailing_stop_pct: tier_exits.trailing_stop,
            trailing_activation_pct: tier_exits.trailing_activation,
            high_watermark: entry_price,
            timeout_at,
            status: PositionStatus::Open,
            scan_id: decision.scan_id,
            predicted: decision.ml_predictions.clone(),
        };
        if let Err(e) = position.check_invariants() {
            return OpenOutcome::Failed(EngineError::Invariant(e));
        }

        // Guards and the balance reservation happen atomically under the
        // table mutex; the row insert happens after it is released.
        {
            let mut state = self.state.lock();
            state.reset_daily_loss_if_new_day(now.date_naive());

            let open_count = state.positions.values().filter(|p| p.is_open()).count();
            if open_count >= risk.max_positions {
                return OpenOutcome::Rejected(DecisionReason::MaxPositionsReached);
            }
            if state.open_for_symbol(&decision.symbol) >= risk.max_per_symbol {
                return OpenOutcome::Rejected(DecisionReason::MaxPerSymbolReached);
            }
            if state.open_for_strategy(decision.strategy) >= risk.max_per_strategy {
                return OpenOutcome::Rejected(DecisionReason::MaxPerStrategyReached);
            }
            let daily_loss_pct = if state.initial_balance.is_zero() {
                Decimal::ZERO
            } else {
                state.daily_loss / state.initial_balance * Decimal::from(100)
            };
            if daily_loss_pct >= risk.max_daily_loss_pct {
                return OpenOutcome::Rejected(DecisionReason::DailyLossLimitReached);
            }
            let reserve = state.initial_balance * config.position_management.reserve_pct;
            if state.available_balance < notional || state.available_balance - notional < reserve {
                return OpenOutcome::Rejected(DecisionReason::InsufficientBalance);
            }

            state.available_balance -= notional;
            state.positions.insert(trade_group_id, position.clone());
        }

        let buy_row = TradeRow {
            trade_id: Uuid::new_v4(),
            trade_group_id,
            symbol: position.symbol.clone(),
            strategy: position.strategy,
            side: Side::Buy,
            price: entry_price,
            amount,
            notional,
            pnl: None,
            created_at: now,
            filled_at: now,
            exit_reason: None,
            stop_loss: Some(stop_loss),
            take_profit: Some(take_profit),
            trailing_stop_pct: Some(position.trailing_stop_pct),
            trailing_activation_pct: Some(position.trailing_activation_pct),
            timeout_at: Some(timeout_at),
            tier,
            ml_confidence: decision.ml_confidence,
            predicted_take_profit: decision.ml_predictions.as_ref().map(|p| p.take_profit_pct),
            predicted_stop_loss: decision.ml_predictions.as_ref().map(|p| p.stop_loss_pct),
            predicted_hold_hours: decision.ml_predictions.as_ref().map(|p| p.hold_hours),
            hold_time_hours: None,
            prediction_accuracy: None,
            scan_id: decision.scan_id,
            trading_engine: ENGINE_NAME.to_string(),
        };

        if let Err(e) = self.store.insert_trade(&buy_row).await {
            // Roll the reservation back; no partially-opened position may
            // survive a failed persist.
            let mut state = self.state.lock();
            state.positions.remove(&trade_group_id);
            state.available_balance += notional;
            return OpenOutcome::Failed(e.into());
        }

        if let Err(e) = self
            .store
            .set_scan_trade_ref(decision.scan_id, trade_group_id)
            .await
        {
            warn!(error = %e, scan_id = %decision.scan_id, "failed to backfill scan trade ref");
        }

        info!(
            symbol = %position.symbol,
            strategy = %position.strategy,
            entry = %entry_price,
            amount = %amount,
            tp = %take_profit,
            sl = %stop_loss,
            "position opened"
        );
        OpenOutcome::Opened(trade_group_id)
    }

    /// One pass of the exit loop: mark every open position against its
    /// latest bar and close the ones whose exit rules fire.
    pub async fn exit_tick(&self, config: &TradingConfig) -> Vec<ClosedTrade> {
        let open_ids: Vec<Uuid> = {
            let state = self.state.lock();
            state
                .positions
                .values()
                .filter(|p| p.is_open())
                .map(|p| p.trade_group_id)
                .collect()
        };

        let mut closed = Vec::new();
        let exit_cell_timeout =
            std::time::Duration::from_secs(config.global_settings.exit_cell_timeout_secs);

        for id in open_ids {
            let symbol = match self.state.lock().positions.get(&id) {
                Some(p) if p.is_open() => p.symbol.clone(),
                _ => continue,
            };

            let bar = match tokio::time::timeout(
                exit_cell_timeout,
                self.fetcher.latest_bar(&symbol, Timeframe::M1),
            )
            .await
            {
                Ok(Ok(Some(bar))) => bar,
                Ok(Ok(None)) => {
                    warn!(symbol, "no latest bar; deferring exit check");
                    continue;
                }
                Ok(Err(e)) => {
                    warn!(symbol, error = %e, "price fetch failed; deferring exit check");
                    continue;
                }
                Err(_) => {
                    warn!(symbol, "exit cell timed out; deferring exit check");
                    continue;
                }
            };

            let now = self.clock.now();
            // Watermark update and trigger evaluation are atomic; the close
            // itself happens after the lock is released.
            let triggered = {
                let mut state = self.state.lock();
                match state.positions.get_mut(&id) {
                    Some(position) if position.is_open() => {
                        position.mark(bar.high);
                        match evaluate_exit(position, &bar, now) {
                            Some((reason, trigger_price)) => {
                                position.status = PositionStatus::Closing;
                                Some((reason, trigger_price, position.clone()))
                            }
                            None => None,
                        }
                    }
                    _ => None,
                }
            };

            if let Some((reason, trigger_price, position)) = triggered {
                match self.close(&position, reason, trigger_price, config).await {
                    Ok(trade) => closed.push(trade),
                    Err(e) => {
                        error!(symbol = %position.symbol, error = %e, "close failed; position stays open");
                        let mut state = self.state.lock();
                        if let Some(p) = state.positions.get_mut(&id) {
                            p.status = PositionStatus::Open;
                        }
                    }
                }
            }
        }

        closed
    }

    /// Administrative close of every open position at its latest price.
    pub async fn close_all(&self, config: &TradingConfig) -> Vec<ClosedTrade> {
        let open: Vec<Position> = {
            let mut state = self.state.lock();
            let ids: Vec<Uuid> = state
                .positions
                .values()
                .filter(|p| p.is_open())
                .map(|p| p.trade_group_id)
                .collect();
            ids.iter()
                .filter_map(|id| {
                    state.positions.get_mut(id).map(|p| {
                        p.status = PositionStatus::Closing;
                        p.clone()
                    })
                })
                .collect()
        };

        let mut closed = Vec::new();
        for position in open {
            let price = match self.fetcher.latest_bar(&position.symbol, Timeframe::M1).await {
                Ok(Some(bar)) => bar.close,
                _ => position.entry_price,
            };
            match self.close(&position, ExitReason::Manual, price, config).await {
                Ok(trade) => closed.push(trade),
                Err(e) => {
                    error!(symbol = %position.symbol, error = %e, "manual close failed");
                    let mut state = self.state.lock();
                    if let Some(p) = state.positions.get_mut(&position.trade_group_id) {
                        p.status = PositionStatus::Open;
                    }
                }
            }
        }
        closed
    }

    async fn close(
        &self,
        position: &Position,
        reason: ExitReason,
        trigger_price: Decimal,
        config: &TradingConfig,
    ) -> Result<ClosedTrade, EngineError> {
        // Labelling policy: a trailing exit is only recorded for positions
        // that actually reached the activation profit; anything else is a
        // stop-loss. Mislabelled rows poison downstream model feedback.
        let reason = if reason == ExitReason::TrailingStop && !position.trailing_armed() {
            ExitReason::StopLoss
        } else {
            reason
        };

        let now = self.clock.now();
        let slippage = config.slippage(position.tier);
        let exit_price = trigger_price * (Decimal::ONE - slippage);
        let exit_fees = exit_price * position.amount * config.fees.taker;
        let pnl = position.amount * (exit_price - position.entry_price) - exit_fees;
        let hold_time_hours = position.hold_time_hours(now);

        let accuracy = position.predicted.as_ref().map(|p| {
            serde_json::json!({
                "predicted_hold_hours": p.hold_hours,
                "actual_hold_hours": hold_time_hours,
                "predicted_take_profit_pct": p.take_profit_pct,
                "predicted_stop_loss_pct": p.stop_loss_pct,
                "exit_reason": reason.as_str(),
                "pnl": pnl,
            })
        });

        let sell_row = TradeRow {
            trade_id: Uuid::new_v4(),
            trade_group_id: position.trade_group_id,
            symbol: position.symbol.clone(),
            strategy: position.strategy,
            side: Side::Sell,
            price: exit_price,
            amount: position.amount,
            notional: position.notional,
            pnl: Some(pnl),
            created_at: now,
            filled_at: now,
            exit_reason: Some(reason),
            stop_loss: Some(position.stop_loss),
            take_profit: Some(position.take_profit),
            trailing_stop_pct: Some(position.trailing_stop_pct),
            trailing_activation_pct: Some(position.trailing_activation_pct),
            timeout_at: Some(position.timeout_at),
            tier: position.tier,
            ml_confidence: None,
            predicted_take_profit: position.predicted.as_ref().map(|p| p.take_profit_pct),
            predicted_stop_loss: position.predicted.as_ref().map(|p| p.stop_loss_pct),
            predicted_hold_hours: position.predicted.as_ref().map(|p| p.hold_hours),
            hold_time_hours: Some(hold_time_hours),
            prediction_accuracy: accuracy,
            scan_id: position.scan_id,
            trading_engine: ENGINE_NAME.to_string(),
        };

        self.store.insert_trade(&sell_row).await?;

        let proceeds = position.amount * exit_price - exit_fees;
        {
            let mut state = self.state.lock();
            state.reset_daily_loss_if_new_day(now.date_naive());
            match state.positions.get_mut(&position.trade_group_id) {
                Some(p) if p.status != PositionStatus::Closed => {
                    p.status = PositionStatus::Closed;
                }
                Some(_) => {
                    error!(
                        trade_group_id = %position.trade_group_id,
                        "close requested for an already-closed position; not touched"
                    );
                }
                None => {}
            }
            state.positions.remove(&position.trade_group_id);
            state.available_balance += proceeds;
            state.realized_pnl += pnl;
            if pnl < Decimal::ZERO {
                state.daily_loss += pnl.abs();
                state.losses += 1;
            } else {
                state.wins += 1;
            }
        }

        info!(
            symbol = %position.symbol,
            reason = %reason,
            exit = %exit_price,
            pnl = %pnl,
            hold_hours = format!("{:.1}", hold_time_hours),
            "position closed"
        );

        Ok(ClosedTrade {
            trade_group_id: position.trade_group_id,
            symbol: position.symbol.clone(),
            exit_reason: reason,
            exit_price,
            pnl,
        })
    }

    pub fn status(&self) -> TraderStatus {
        let state = self.state.lock();
        TraderStatus {
            open_positions: state.positions.values().filter(|p| p.is_open()).count(),
            available_balance: state.available_balance,
            realized_pnl: state.realized_pnl,
            daily_loss: state.daily_loss,
            wins: state.wins,
            losses: state.losses,
        }
    }

    pub fn open_positions(&self) -> Vec<Position> {
        let state = self.state.lock();
        state.positions.values().filter(|p| p.is_open()).cloned().collect()
    }
}

/// First matching trigger wins: take-profit, trailing stop (armed positions
/// only), stop-loss, timeout. A bar straddling both barriers resolves by
/// where it opened relative to the barrier midpoint.
fn evaluate_exit(
    position: &Position,
    bar: &OhlcBar,
    now: DateTime<Utc>,
) -> Option<(ExitReason, Decimal)> {
    let price = bar.close;

    if bar.high >= position.take_profit && bar.low <= position.stop_loss {
        let midpoint = (position.take_profit + position.stop_loss) / Decimal::from(2);
        return if bar.open > midpoint {
            Some((ExitReason::TakeProfit, position.take_profit))
        } else {
            Some((ExitReason::StopLoss, position.stop_loss))
        };
    }

    if price >= position.take_profit {
        return Some((ExitReason::TakeProfit, price));
    }

    if position.trailing_armed() && price <= position.trailing_level() {
        return Some((ExitReason::TrailingStop, price));
    }

    if price <= position.stop_loss {
        return Some((ExitReason::StopLoss, price));
    }

    if now >= position.timeout_at {
        return Some((ExitReason::Timeout, price));
    }

    None
}

#[cfg(test)]
mod tests;
