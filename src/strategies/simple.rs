use rust_decimal::Decimal;

use crate::config::TradingConfig;
use crate::types::{decimal_to_f64, Setup, SetupData, StrategyKind, Tier};

use super::{DetectInput, Detector};

/// How far the primary thresholds are relaxed for the fallback pass.
const DROP_RELAXATION: f64 = 0.75;
const RSI_RELAXATION: f64 = 10.0;
const BREAKOUT_RELAXATION: f64 = 0.5;

/// Loosely-thresholded fallback variants of the DCA and Swing detectors.
/// Consulted only when the primary detector found nothing AND no ML filter
/// is loaded, so a model-less deployment still emits signals. Channel has no
/// meaningful loose variant; its fallback is simply "no setup".
pub struct SimpleRules;

impl SimpleRules {
    pub fn detect_fallback(
        &self,
        kind: StrategyKind,
        input: &DetectInput<'_>,
        config: &TradingConfig,
        tier: Tier,
    ) -> Option<Setup> {
        match kind {
            StrategyKind::Dca => self.loose_dca(input, config, tier),
            StrategyKind::Swing => self.loose_swing(input, config, tier),
            StrategyKind::Channel => None,
        }
    }

    /// DCA with three-quarters of the drop requirement, a widened RSI cap,
    /// and no volume gate.
    fn loose_dca(
        &self,
        input: &DetectInput<'_>,
        config: &TradingConfig,
        tier: Tier,
    ) -> Option<Setup> {
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

        if drop_percent > thresholds.drop_threshold * DROP_RELAXATION {
            return None;
        }
        if input.features.rsi_14 > thresholds.rsi_max + RSI_RELAXATION {
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

    /// Swing with half the breakout requirement, no volume spike, and a
    /// neutral RSI floor.
    fn loose_swing(
        &self,
        input: &DetectInput<'_>,
        config: &TradingConfig,
        tier: Tier,
    ) -> Option<Setup> {
        let thresholds = config
            .strategies
            .swing
            .detection_thresholds_by_tier
            .get(&tier)?;

        let lookback = thresholds.lookback_bars;
        if input.bars.len() < lookback + 1 {
            return None;
        }
        let prior = &input.bars[input.bars.len() - 1 - lookback..input.bars.len() - 1];
        let resistance = prior.iter().map(|b| b.high).max()?;
        let close = input.last_close();
        if resistance <= Decimal::ZERO || close <= resistance {
            return None;
        }

        let breakout_percent =
            (decimal_to_f64(close) - decimal_to_f64(resistance)) / decimal_to_f64(resistance) * 100.0;
        if breakout_percent < thresholds.breakout_threshold * BREAKOUT_RELAXATION {
            return None;
        }
        if input.features.rsi_14 < 50.0 {
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
                trend_strength: 0.0,
            },
            suggested_notional: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::features::FeatureCalculator;
    use crate::regime::MarketRegime;
    use crate::strategies::dca::dipping_closes;
    use crate::strategies::test_support::bars_from_closes;
    use crate::strategies::{DcaDetector, Detector};
    use crate::types::Timeframe;

    fn detect_loose(
        kind: StrategyKind,
        symbol: &str,
        bars: &[crate::types::OhlcBar],
        config: &TradingConfig,
        tier: Tier,
    ) -> Option<Setup> {
        let calculator = FeatureCalculator::new(config.global_settings.volume_window);
        let features = calculator.compute(bars, Timeframe::M15).unwrap();
        let input = DetectInput {
            symbol,
            bars,
            features: &features,
            regime: MarketRegime::Normal,
            timeframe: Timeframe::M15,
            now: bars.last().unwrap().timestamp,
        };
        SimpleRules.detect_fallback(kind, &input, config, tier)
    }

    #[test]
    fn loose_dca_accepts_what_the_primary_rejects() {
        let config = TradingConfig::default();
        // A 1.9% dip on thin volume: short of the mid_cap -2.25 primary
        // threshold but past the relaxed -1.6875.
        let closes = dipping_closes(320, 20.0, -2.0, 16);
        let volume = vec![0.3; 320];
        let bars = bars_from_closes("LINK", &closes, &volume);

        let calculator = FeatureCalculator::new(config.global_settings.volume_window);
        let features = calculator.compute(&bars, Timeframe::M15).unwrap();
        let input = DetectInput {
            symbol: "LINK",
            bars: &bars,
            features: &features,
            regime: MarketRegime::Normal,
            timeframe: Timeframe::M15,
            now: bars.last().unwrap().timestamp,
        };

        assert!(DcaDetector.detect(&input, &config, Tier::MidCap).is_none());
        let setup = SimpleRules
            .detect_fallback(StrategyKind::Dca, &input, &config, Tier::MidCap)
            .expect("relaxed thresholds should accept the dip");
        assert_eq!(setup.strategy, StrategyKind::Dca);
    }

    #[test]
    fn loose_dca_still_rejects_flat_markets() {
        let config = TradingConfig::default();
        let closes = vec![20.0; 320];
        let bars = bars_from_closes("LINK", &closes, &[]);
        assert!(detect_loose(StrategyKind::Dca, "LINK", &bars, &config, Tier::MidCap).is_none());
    }

    #[test]
    fn channel_has_no_fallback() {
        let config = TradingConfig::default();
        let closes = vec![20.0; 320];
        let bars = bars_from_closes("DOT", &closes, &[]);
        assert!(detect_loose(StrategyKind::Channel, "DOT", &bars, &config, Tier::MidCap).is_none());
    }
}
