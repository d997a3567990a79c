use rust_decimal::Decimal;

use crate::config::TradingConfig;
use crate::indicators;
use crate::types::{closes, decimal_to_f64, Setup, SetupData, StrategyKind, Tier};

use super::{DetectInput, Detector};

/// Buys momentum breakouts: close punching above the trailing high on a
/// volume spike, with bullish RSI and a rising fast-over-slow trend.
pub struct SwingDetector;

impl Detector for SwingDetector {
    fn kind(&self) -> StrategyKind {
        StrategyKind::Swing
    }

    fn detect(&self, input: &DetectInput<'_>, config: &TradingConfig, tier: Tier) -> Option<Setup> {
        let thresholds = config
            .strategies
            .swing
            .detection_thresholds_by_tier
            .get(&tier)?;

        let lookback = thresholds.lookback_bars;
        if input.bars.len() < lookback + 1 {
            return None;
        }

        // Resistance is the highest high of the trailing window, excluding
        // the breakout bar itself.
        let prior = &input.bars[input.bars.len() - 1 - lookback..input.bars.len() - 1];
        let resistance = prior.iter().map(|b| b.high).max()?;
        let close = input.last_close();
        if resistance <= Decimal::ZERO || close <= resistance {
            return None;
        }

        let breakout_percent =
            (decimal_to_f64(close) - decimal_to_f64(resistance)) / decimal_to_f64(resistance) * 100.0;
        if breakout_percent < thresholds.breakout_threshold {
            return None;
        }
        if input.features.volume_ratio < thresholds.volume_spike_threshold {
            return None;
        }
        if input.features.rsi_14 < thresholds.rsi_bullish_min {
            return None;
        }
        let ret_24h = input.features.ret_24h_pct;
        if ret_24h < thresholds.min_price_change_24h || ret_24h > thresholds.max_price_change_24h {
            return None;
        }

        let trend_strength = trend_gauge(input)?;
        if trend_strength < thresholds.min_trend_strength {
            return None;
        }

        Some(Setup {
            strategy: StrategyKind::Swing,
            symbol: input.symbol.to_string(),
            detected_at: input.now,
            reference_price: close,
            data: SetupData::Swing {
                breakout_percent,
                resistance,
                volume_ratio: input.features.volume_ratio,
                rsi: input.features.rsi_14,
                trend_strength,
            },
            suggested_notional: None,
        })
    }
}

/// Fast-over-slow SMA gap in percent of the slow average. Positive when the
/// short-term mean leads.
fn trend_gauge(input: &DetectInput<'_>) -> Option<f64> {
    let close_values = closes(input.bars);
    let fast = indicators::sma(&close_values, 20)?;
    let slow = indicators::sma(&close_values, 50)?;
    if slow <= 0.0 {
        return None;
    }
    Some((fast - slow) / slow * 100.0)
}
