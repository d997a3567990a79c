use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::features::FeatureSet;
use crate::ml::MlPrediction;
use crate::regime::MarketRegime;

use super::{Setup, StrategyKind};

/// The scanner's verdict on one `(symbol, strategy)` cell.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DecisionKind {
    Take,
    NearMiss,
    Skip,
}

impl DecisionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            DecisionKind::Take => "TAKE",
            DecisionKind::NearMiss => "NEAR_MISS",
            DecisionKind::Skip => "SKIP",
        }
    }
}

impl std::fmt::Display for DecisionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a cell classified the way it did. NEAR_MISS reasons always name the
/// guard that rejected an otherwise-valid setup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionReason {
    // TAKE
    SetupConfirmed,
    // NEAR_MISS
    ConfidenceTooLow,
    MaxPositionsReached,
    MaxPerSymbolReached,
    MaxPerStrategyReached,
    DailyLossLimitReached,
    InsufficientBalance,
    // SKIP
    NoSetup,
    BelowNearMiss,
    DataUnavailable,
    InsufficientData,
    BadData,
    CellTimeout,
    TickCancelled,
    RegimeBlocked,
    StrategyDisabled,
}

impl DecisionReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            DecisionReason::SetupConfirmed => "setup_confirmed",
            DecisionReason::ConfidenceTooLow => "confidence_too_low",
            DecisionReason::MaxPositionsReached => "max_positions_reached",
            DecisionReason::MaxPerSymbolReached => "max_per_symbol_reached",
            DecisionReason::MaxPerStrategyReached => "max_per_strategy_reached",
            DecisionReason::DailyLossLimitReached => "daily_loss_limit_reached",
            DecisionReason::InsufficientBalance => "insufficient_balance",
            DecisionReason::NoSetup => "no_setup",
            DecisionReason::BelowNearMiss => "below_near_miss",
            DecisionReason::DataUnavailable => "data_unavailable",
            DecisionReason::InsufficientData => "insufficient_data",
            DecisionReason::BadData => "bad_data",
            DecisionReason::CellTimeout => "cell_timeout",
            DecisionReason::TickCancelled => "tick_cancelled",
            DecisionReason::RegimeBlocked => "regime_blocked",
            DecisionReason::StrategyDisabled => "strategy_disabled",
        }
    }
}

impl std::fmt::Display for DecisionReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One row of `scan_history`: everything the scanner knew when it classified
/// a `(symbol, strategy)` pair at one tick. Exactly one of these exists per
/// cell per tick, no matter how the cell failed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanDecision {
    pub scan_id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub symbol: String,
    pub strategy: StrategyKind,
    pub decision: DecisionKind,
    pub reason: DecisionReason,
    pub market_regime: MarketRegime,
    pub btc_price: Option<Decimal>,
    pub features: Option<FeatureSet>,
    pub setup: Option<Setup>,
    pub ml_confidence: Option<f64>,
    pub ml_predictions: Option<MlPrediction>,
    pub thresholds_used: serde_json::Value,
    pub proposed_position_size: Option<Decimal>,
    pub trade_id: Option<Uuid>,
}

impl ScanDecision {
    /// Skeleton for a cell that never got past fetch/compute. The scanner
    /// fills in regime and BTC price from the tick context.
    pub fn skip(
        symbol: &str,
        strategy: StrategyKind,
        reason: DecisionReason,
        regime: MarketRegime,
        btc_price: Option<Decimal>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            scan_id: Uuid::new_v4(),
            timestamp: now,
            symbol: symbol.to_string(),
            strategy,
            decision: DecisionKind::Skip,
            reason,
            market_regime: regime,
            btc_price,
            features: None,
            setup: None,
            ml_confidence: None,
            ml_predictions: None,
            thresholds_used: serde_json::Value::Null,
            proposed_position_size: None,
            trade_id: None,
        }
    }

    /// Rewrite a TAKE that a risk guard rejected. The setup and sizing stay
    /// on the row so the rejection is auditable; `trade_id` stays empty.
    pub fn demote_to_near_miss(&mut self, reason: DecisionReason) {
        self.decision = DecisionKind::NearMiss;
        self.reason = reason;
        self.trade_id = None;
    }

    /// TAKE rows must reference a setup and carry a positive size.
    pub fn check_invariants(&self) -> Result<(), String> {
        if self.decision == DecisionKind::Take {
            if self.setup.is_none() {
                return Err(format!("TAKE without setup: {} {}", self.symbol, self.strategy));
            }
            match self.proposed_position_size {
                Some(size) if size > Decimal::ZERO => {}
                other => {
                    return Err(format!(
                        "TAKE without positive size ({:?}): {} {}",
                        other, self.symbol, self.strategy
                    ));
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn take_invariant_requires_setup_and_size() {
        let mut d = ScanDecision::skip(
            "BTC",
            StrategyKind::Dca,
            DecisionReason::NoSetup,
            MarketRegime::Normal,
            None,
            Utc::now(),
        );
        assert!(d.check_invariants().is_ok());

        d.decision = DecisionKind::Take;
        assert!(d.check_invariants().is_err());
    }

    #[test]
    fn demotion_clears_trade_id() {
        let mut d = ScanDecision::skip(
            "SOL",
            StrategyKind::Swing,
            DecisionReason::SetupConfirmed,
            MarketRegime::Normal,
            None,
            Utc::now(),
        );
        d.decision = DecisionKind::Take;
        d.trade_id = Some(Uuid::new_v4());
        d.demote_to_near_miss(DecisionReason::MaxPositionsReached);
        assert_eq!(d.decision, DecisionKind::NearMiss);
        assert!(d.trade_id.is_none());
    }
}
