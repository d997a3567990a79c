use rust_decimal::prelude::FromPrimitive;
use rust_decimal::Decimal;

use crate::config::TradingConfig;
use crate::types::{decimal_to_f64, Setup, SetupData, StrategyKind, Tier};

use super::{DetectInput, Detector};

/// Touch band around each channel line, as a fraction of the mean price.
const TOUCH_BAND: f64 = 0.002;

/// Residual quantile used to place the envelope lines. Shifting by the
/// extreme residual would let one outlier wick define the channel.
const ENVELOPE_QUANTILE: f64 = 0.90;

/// Fits a linear channel to the trailing window: a regression line through
/// the highs shifted up to the residual quantile, and the mirror through the
/// lows. Buys when price sits in the bottom zone of a clean, parallel
/// channel.
pub struct ChannelDetector;

impl Detector for ChannelDetector {
    fn kind(&self) -> StrategyKind {
        StrategyKind::Channel
    }

    fn detect(&self, input: &DetectInput<'_>, config: &TradingConfig, tier: Tier) -> Option<Setup> {
        let thresholds = config
            .strategies
            .channel
            .detection_thresholds_by_tier
            .get(&tier)?;

        let lookback = thresholds.lookback_bars;
        if input.bars.len() < lookback {
            return None;
        }
        let window = &input.bars[input.bars.len() - lookback..];

        let highs: Vec<f64> = window.iter().map(|b| decimal_to_f64(b.high)).collect();
        let lows: Vec<f64> = window.iter().map(|b| decimal_to_f64(b.low)).collect();
        let close_values: Vec<f64> = window.iter().map(|b| b.close_f64()).collect();

        let (top_slope, top_base) = envelope_fit(&highs, ENVELOPE_QUANTILE)?;
        let (bottom_slope, bottom_base) = envelope_fit(&lows, 1.0 - ENVELOPE_QUANTILE)?;

        let mean_price = close_values.iter().sum::<f64>() / close_values.len() as f64;
        if mean_price <= 0.0 {
            return None;
        }

        // Parallelism in percent-per-bar so the tolerance is price-scale free.
        let slope_gap_pct = ((top_slope - bottom_slope) / mean_price * 100.0).abs();
        if slope_gap_pct > thresholds.parallel_tolerance {
            return None;
        }

        let top_at = |i: usize| top_base + top_slope * i as f64;
        let bottom_at = |i: usize| bottom_base + bottom_slope * i as f64;

        let last = lookback - 1;
        let channel_top = top_at(last);
        let channel_bottom = bottom_at(last);
        if channel_top <= channel_bottom || top_at(0) <= bottom_at(0) {
            return None;
        }

        let band = mean_price * TOUCH_BAND;
        let mut touches_top = 0usize;
        let mut touches_bottom = 0usize;
        let mut inside = 0usize;
        for i in 0..lookback {
            if highs[i] >= top_at(i) - band {
                touches_top += 1;
            }
            if lows[i] <= bottom_at(i) + band {
                touches_bottom += 1;
            }
            if close_values[i] >= bottom_at(i) && close_values[i] <= top_at(i) {
                inside += 1;
            }
        }
        if touches_top < thresholds.min_touches || touches_bottom < thresholds.min_touches {
            return None;
        }

        let strength = inside as f64 / lookback as f64;
        if strength < thresholds.min_strength {
            return None;
        }

        let close = close_values[last];
        let position_in_channel =
            ((close - channel_bottom) / (channel_top - channel_bottom)).clamp(0.0, 1.0);
        if position_in_channel > thresholds.buy_zone {
            return None;
        }

        Some(Setup {
            strategy: StrategyKind::Channel,
            symbol: input.symbol.to_string(),
            detected_at: input.now,
            reference_price: input.last_close(),
            data: SetupData::Channel {
                channel_top: Decimal::from_f64(channel_top)?,
                channel_bottom: Decimal::from_f64(channel_bottom)?,
                position_in_channel,
                strength,
            },
            suggested_notional: None,
        })
    }
}

/// Regression line through `values` shifted to the given residual quantile:
/// q near 1 places the line along the upper envelope, q near 0 along the
/// lower. Returns `(slope, intercept_after_shift)`.
fn envelope_fit(values: &[f64], quantile: f64) -> Option<(f64, f64)> {
    let (slope, intercept) = linear_fit(values)?;
    let mut residuals: Vec<f64> = values
        .iter()
        .enumerate()
        .map(|(i, &v)| v - (intercept + slope * i as f64))
        .collect();
    residuals.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    let idx = ((residuals.len() - 1) as f64 * quantile).round() as usize;
    Some((slope, intercept + residuals[idx]))
}

/// Ordinary least squares over `values` with x = 0..n. Returns
/// `(slope, intercept)`.
fn linear_fit(values: &[f64]) -> Option<(f64, f64)> {
    let n = values.len();
    if n < 2 {
        return None;
    }
    let n_f = n as f64;
    let sum_x = (n * (n - 1)) as f64 / 2.0;
    let sum_xx = ((n - 1) * n * (2 * n - 1)) as f64 / 6.0;
    let sum_y: f64 = values.iter().sum();
    let sum_xy: f64 = values.iter().enumerate().map(|(i, &y)| i as f64 * y).sum();

    let denom = n_f * sum_xx - sum_x * sum_x;
    if denom == 0.0 {
        return None;
    }
    let slope = (n_f * sum_xy - sum_x * sum_y) / denom;
    let intercept = (sum_y - slope * sum_x) / n_f;
    Some((slope, intercept))
}
