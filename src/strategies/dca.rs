use rust_decimal::Decimal;

use crate::config::TradingConfig;
use crate::types::{decimal_to_f64, Setup, SetupData, StrategyKind, Tier};

use super::{DetectInput, Detector};

/// Buys oversold dips: a sharp drop from the recent high on adequate volume
/// with RSI in the basement. Threshold depth scales by market-cap tier.
pub struct DcaDetector;

impl Detector for DcaDetector {
    fn kind(&self) -> StrategyKind {
        StrategyKind::Dca
    }

    fn detect(&self, input: &DetectInput<'_>, config: &TradingConfig, tier: Tier) -> Option<Setup> {
        let thresholds = config
            .strategies
            .dca
            .detection_thresholds_by_tier
            .get(&tier)?;

        let lookback_bars = input.timeframe.bars_in_hours(thresholds.lookback_hours);
        if input.bars.len() < lookback_bars + 1 {
            return None;
        }

        let window = &input.bars[input.bars.len() - lookback_bars..];
        let reference_high = window.iter().map(|b| b.close).max()?;
        let close = input.last_close();
        if reference_high <= Decimal::ZERO || close <= Decimal::ZERO {
            return None;
        }

        let drop_percent =
            (decimal_to_f64(close) - decimal_to_f64(reference_high)) / decimal_to_f64(reference_high) * 100.0;

        // All three gates must pass; the regime blocklist is enforced by the
        // scanner before the detector runs.
        if drop_percent > thresholds.drop_threshold {
            return None;
        }
        if input.features.volume_ratio < thresholds.volume_requirement {
            return None;
        }
        if input.features.rsi_14 > thresholds.rsi_max {
            return None;
        }

        Some(Setup {
            strategy: StrategyKind::Dca,
            symbol: input.symbol.to_string(),
            detected_at: input.now,
            reference_price: close,
            data: SetupData::Dca {
                drop_percent,
                reference_high,
                rsi: input.features.rsi_14,
                volume_ratio: input.features.volume_ratio,
                support_distance: input.features.support_distance_pct,
            },
            suggested_notional: None,
        })
    }
}

/// Scale a whole close series so its final leg dips by `drop_pct` over the
/// last `bars` bars (test helper shared with the simple-rules tests).
#[cfg(test)]
pub fn dipping_closes(n: usize, base: f64, drop_pct: f64, dip_bars: usize) -> Vec<f64> {
    let mut closes = vec![base; n];
    let dip_start = n - dip_bars;
    for i in dip_start..n {
        let progress = (i - dip_start + 1) as f64 / dip_bars as f64;
        closes[i] = base * (1.0 + drop_pct / 100.0 * progress);
    }
    closes
}
