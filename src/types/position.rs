use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::ml::MlPrediction;

use super::{StrategyKind, Tier};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PositionStatus {
    Open,
    Closing,
    Closed,
}

/// Why a position exited. Wire strings match the `paper_trades.exit_reason`
/// column consumed by model retraining, so the labelling policy matters:
/// `TrailingStop` is only ever recorded for positions that were profitable
/// at some point (see `PaperTrader`), otherwise the row says `StopLoss`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExitReason {
    TakeProfit,
    StopLoss,
    TrailingStop,
    Timeout,
    Manual,
}

impl ExitReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExitReason::TakeProfit => "take_profit",
            ExitReason::StopLoss => "stop_loss",
            ExitReason::TrailingStop => "trailing_stop",
            ExitReason::Timeout => "timeout",
            ExitReason::Manual => "manual",
        }
    }

    pub fn parse(s: &str) -> Option<ExitReason> {
        match s {
            "take_profit" => Some(ExitReason::TakeProfit),
            "stop_loss" => Some(ExitReason::StopLoss),
            "trailing_stop" => Some(ExitReason::TrailingStop),
            "timeout" => Some(ExitReason::Timeout),
            "manual" => Some(ExitReason::Manual),
            _ => None,
        }
    }
}

impl std::fmt::Display for ExitReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A simulated long position. Exit parameters are captured from the config
/// snapshot active at open time and never re-derived afterwards, so a config
/// replacement mid-hold cannot move an existing stop.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    pub trade_group_id: Uuid,
    pub symbol: String,
    pub strategy: StrategyKind,
    pub tier: Tier,
    pub entry_price: Decimal,
    pub amount: Decimal,
    pub notional: Decimal,
    pub opened_at: DateTime<Utc>,
    pub stop_loss: Decimal,
    pub take_profit: Decimal,
    pub trailing_stop_pct: Decimal,
    pub trailing_activation_pct: Decimal,
    pub high_watermark: Decimal,
    pub timeout_at: DateTime<Utc>,
    pub status: PositionStatus,
    pub scan_id: Uuid,
    pub predicted: Option<MlPrediction>,
}

impl Position {
    /// Raise the high-water mark. Never lowers it; `high_watermark >=
    /// entry_price` holds from construction onward.
    pub fn mark(&mut self, price: Decimal) {
        if price > self.high_watermark {
            self.high_watermark = price;
        }
    }

    /// Whether the position has ever been profitable enough to arm the
    /// trailing stop.
    pub fn trailing_armed(&self) -> bool {
        self.high_watermark > self.entry_price * (Decimal::ONE + self.trailing_activation_pct)
    }

    /// Price level at which the armed trailing stop fires.
    pub fn trailing_level(&self) -> Decimal {
        self.high_watermark * (Decimal::ONE - self.trailing_stop_pct)
    }

    pub fn is_open(&self) -> bool {
        self.status == PositionStatus::Open
    }

    pub fn hold_time_hours(&self, now: DateTime<Utc>) -> f64 {
        (now - self.opened_at).num_seconds() as f64 / 3600.0
    }

    /// `stop_loss < entry < take_profit` and watermark at or above entry.
    pub fn check_invariants(&self) -> Result<(), String> {
        if !(self.stop_loss < self.entry_price && self.entry_price < self.take_profit) {
            return Err(format!(
                "{} exit levels out of order: sl={} entry={} tp={}",
                self.symbol, self.stop_loss, self.entry_price, self.take_profit
            ));
        }
        if self.high_watermark < self.entry_price {
            return Err(format!(
                "{} watermark {} below entry {}",
                self.symbol, self.high_watermark, self.entry_price
            ));
        }
        Ok(())
    }
}
