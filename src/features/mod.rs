use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::indicators::{self, BollingerBands, Ema, Macd, Rsi, Stochastic};
use crate::types::{closes, volumes, OhlcBar, Timeframe};

/// Bars required before the calculator will produce output. 288 fifteen-minute
/// bars is three days, enough to warm every indicator including SMA(200).
pub const MIN_BARS: usize = 288;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum FeatureError {
    #[error("insufficient data: have {got} bars, need {needed}")]
    InsufficientData { got: usize, needed: usize },
}

/// The fixed technical-indicator vector computed for every scan cell and
/// persisted to `scan_history.features`. All fields are deterministic
/// functions of the input slice; nothing here looks forward.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureSet {
    pub ret_5m_pct: f64,
    pub ret_1h_pct: f64,
    pub ret_4h_pct: f64,
    pub ret_24h_pct: f64,
    pub volume_ratio: f64,
    pub rsi_14: f64,
    pub macd_line: f64,
    pub macd_signal: f64,
    pub macd_histogram: f64,
    pub bb_width: f64,
    pub bb_position: f64,
    pub dist_sma_20_pct: f64,
    pub dist_sma_50_pct: f64,
    pub dist_sma_200_pct: f64,
    pub dist_ema_20_pct: f64,
    pub dist_ema_50_pct: f64,
    pub dist_ema_200_pct: f64,
    pub rate_of_change_pct: f64,
    pub stoch_k: f64,
    pub stoch_d: f64,
    pub volatility: f64,
    pub support_distance_pct: f64,
    pub resistance_distance_pct: f64,
    /// ML-bound extras only; never read by detectors.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub extras: BTreeMap<String, f64>,
}

impl FeatureSet {
    /// Flat view in declaration order, used by the ML filter's feature
    /// vector. Extras are not part of the model input.
    pub fn to_vec(&self) -> Vec<f64> {
        vec![
            self.ret_5m_pct,
            self.ret_1h_pct,
            self.ret_4h_pct,
            self.ret_24h_pct,
            self.volume_ratio,
            self.rsi_14,
            self.macd_line,
            self.macd_signal,
            self.macd_histogram,
            self.bb_width,
            self.bb_position,
            self.dist_sma_20_pct,
            self.dist_sma_50_pct,
            self.dist_sma_200_pct,
            self.dist_ema_20_pct,
            self.dist_ema_50_pct,
            self.dist_ema_200_pct,
            self.rate_of_change_pct,
            self.stoch_k,
            self.stoch_d,
            self.volatility,
            self.support_distance_pct,
            self.resistance_distance_pct,
        ]
    }

    pub const VECTOR_LEN: usize = 23;
}

/// Pure calculator over an ascending, validated OHLC slice.
#[derive(Debug, Clone)]
pub struct FeatureCalculator {
    /// Trailing window for the volume-ratio denominator.
    pub volume_window: usize,
    /// Lookback for support/resistance pivots.
    pub pivot_lookback: usize,
}

impl Default for FeatureCalculator {
    fn default() -> Self {
        Self {
            volume_window: 20,
            pivot_lookback: 96,
        }
    }
}

impl FeatureCalculator {
    pub fn new(volume_window: usize) -> Self {
        Self {
            volume_window: volume_window.max(1),
            ..Self::default()
        }
    }

    pub fn compute(&self, bars: &[OhlcBar], timeframe: Timeframe) -> Result<FeatureSet, FeatureError> {
        if bars.len() < MIN_BARS {
            return Err(FeatureError::InsufficientData {
                got: bars.len(),
                needed: MIN_BARS,
            });
        }

        let close_values = closes(bars);
        let volume_values = volumes(bars);
        let last_close = close_values[close_values.len() - 1];

        let ret = |minutes: i64| -> f64 {
            let steps = (minutes / timeframe.minutes()).max(1) as usize;
            indicators::rate_of_change(&close_values, steps).unwrap_or(0.0)
        };

        let volume_ratio = {
            let mean = indicators::sma(
                &volume_values[..volume_values.len() - 1],
                self.volume_window,
            );
            match mean {
                Some(m) if m > 0.0 => volume_values[volume_values.len() - 1] / m,
                _ => 1.0,
            }
        };

        let rsi_14 = feed_closes(&close_values, Rsi::new(14), Rsi::update)
            .unwrap_or(50.0);

        let macd_out = {
            let mut macd = Macd::default_params();
            let mut out = None;
            for &c in &close_values {
                out = macd.update(c);
            }
            out
        };

        let bb_out = {
            let mut bb = BollingerBands::new(20, 2.0);
            let mut out = None;
            for &c in &close_values {
                out = bb.update(c);
            }
            out
        };

        let stoch_out = {
            let mut stoch = Stochastic::new(14, 3);
            let mut out = None;
            for bar in bars {
                out = stoch.update(
                    crate::types::decimal_to_f64(bar.high),
                    crate::types::decimal_to_f64(bar.low),
                    bar.close_f64(),
                );
            }
            out
        };

        let dist_pct = |reference: Option<f64>| -> f64 {
            match reference {
                Some(r) if r > 0.0 => (last_close - r) / r * 100.0,
                _ => 0.0,
            }
        };

        let sma_at = |period: usize| indicators::sma(&close_values, period);
        let ema_at = |period: usize| feed_closes(&close_values, Ema::new(period), Ema::update);

        let (support, resistance) = self.pivot_distances(bars, last_close);

        Ok(FeatureSet {
            ret_5m_pct: ret(5),
            ret_1h_pct: ret(60),
            ret_4h_pct: ret(240),
            ret_24h_pct: ret(1440),
            volume_ratio,
            rsi_14,
            macd_line: macd_out.map(|o| o.macd_line).unwrap_or(0.0),
            macd_signal: macd_out.map(|o| o.signal_line).unwrap_or(0.0),
            macd_histogram: macd_out.map(|o| o.histogram).unwrap_or(0.0),
            bb_width: bb_out.map(|o| o.width()).unwrap_or(0.0),
            bb_position: bb_out.map(|o| o.position(last_close)).unwrap_or(0.5),
            dist_sma_20_pct: dist_pct(sma_at(20)),
            dist_sma_50_pct: dist_pct(sma_at(50)),
            dist_sma_200_pct: dist_pct(sma_at(200)),
            dist_ema_20_pct: dist_pct(ema_at(20)),
            dist_ema_50_pct: dist_pct(ema_at(50)),
            dist_ema_200_pct: dist_pct(ema_at(200)),
            rate_of_change_pct: indicators::rate_of_change(&close_values, 10).unwrap_or(0.0),
            stoch_k: stoch_out.map(|o| o.k).unwrap_or(50.0),
            stoch_d: stoch_out.map(|o| o.d).unwrap_or(50.0),
            volatility: indicators::log_return_volatility(&close_values, 20).unwrap_or(0.0),
            support_distance_pct: support,
            resistance_distance_pct: resistance,
            extras: BTreeMap::new(),
        })
    }

    /// Nearest pivot low below the close and pivot high above it within the
    /// lookback window, each as a percent distance from the close. A pivot is
    /// a bar whose low (high) is the extreme of its immediate neighbourhood.
    fn pivot_distances(&self, bars: &[OhlcBar], last_close: f64) -> (f64, f64) {
        let start = bars.len().saturating_sub(self.pivot_lookback);
        let window = &bars[start..];
        let mut support: Option<f64> = None;
        let mut resistance: Option<f64> = None;

        for i in 1..window.len().saturating_sub(1) {
            let low = crate::types::decimal_to_f64(window[i].low);
            let high = crate::types::decimal_to_f64(window[i].high);
            let is_pivot_low = low <= crate::types::decimal_to_f64(window[i - 1].low)
                && low <= crate::types::decimal_to_f64(window[i + 1].low);
            let is_pivot_high = high >= crate::types::decimal_to_f64(window[i - 1].high)
                && high >= crate::types::decimal_to_f64(window[i + 1].high);

            if is_pivot_low && low < last_close {
                let better = support.map_or(true, |s| low > s);
                if better {
                    support = Some(low);
                }
            }
            if is_pivot_high && high > last_close {
                let better = resistance.map_or(true, |r| high < r);
                if better {
                    resistance = Some(high);
                }
            }
        }

        let support_pct = support
            .filter(|_| last_close > 0.0)
            .map(|s| (last_close - s) / last_close * 100.0)
            .unwrap_or(0.0);
        let resistance_pct = resistance
            .filter(|_| last_close > 0.0)
            .map(|r| (r - last_close) / last_close * 100.0)
            .unwrap_or(0.0);
        (support_pct, resistance_pct)
    }
}

fn feed_closes<I>(
    closes: &[f64],
    mut indicator: I,
    mut update: impl FnMut(&mut I, f64) -> Option<f64>,
) -> Option<f64> {
    let mut out = None;
    for &c in closes {
        out = update(&mut indicator, c);
    }
    out
}

#[cfg(test)]
pub mod tests {
    use super::*;
    use chrono::{Duration, TimeZone, Utc};
    use rust_decimal::prelude::FromPrimitive;
    use rust_decimal::Decimal;

    /// Deterministic synthetic slice: a slow sine around a base price.
    pub fn synthetic_bars(symbol: &str, n: usize, base: f64) -> Vec<OhlcBar> {
        let t0 = Utc.with_ymd_and_hms(2025, 6, 1, 0, 0, 0).unwrap();
        (0..n)
            .map(|i| {
                let phase = i as f64 / 12.0;
                let close = base * (1.0 + 0.01 * phase.sin());
                let open = base * (1.0 + 0.01 * ((i as f64 - 1.0) / 12.0).sin());
                let high = close.max(open) * 1.002;
                let low = close.min(open) * 0.998;
                OhlcBar {
                    symbol: symbol.to_string(),
                    timeframe: Timeframe::M15,
                    timestamp: t0 + Duration::minutes(15 * i as i64),
                    open: Decimal::from_f64(open).unwrap(),
                    high: Decimal::from_f64(high).unwrap(),
                    low: Decimal::from_f64(low).unwrap(),
                    close: Decimal::from_f64(close).unwrap(),
                    volume: Decimal::from_f64(100.0 + (i % 7) as f64 * 10.0).unwrap(),
                    vwap: None,
                    trades: Some(42),
                }
            })
            .collect()
    }

    #[test]
    fn rejects_short_slices() {
        let calc = FeatureCalculator::default();
        let bars = synthetic_bars("BTC", 100, 50_000.0);
        let err = calc.compute(&bars, Timeframe::M15).unwrap_err();
        assert_eq!(err, FeatureError::InsufficientData { got: 100, needed: MIN_BARS });
    }

    #[test]
    fn deterministic_on_identical_input() {
        let calc = FeatureCalculator::default();
        let bars = synthetic_bars("ETH", 400, 3_000.0);
        let a = calc.compute(&bars, Timeframe::M15).unwrap();
        let b = calc.compute(&bars, Timeframe::M15).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn appending_a_bar_does_not_change_history() {
        // No-lookahead check: features over bars[..n] must not depend on
        // anything after index n-1.
        let calc = FeatureCalculator::default();
        let bars = synthetic_bars("SOL", 401, 150.0);
        let head = calc.compute(&bars[..400], Timeframe::M15).unwrap();
        let head_again = calc.compute(&bars[..400], Timeframe::M15).unwrap();
        assert_eq!(head, head_again);
        let full = calc.compute(&bars, Timeframe::M15).unwrap();
        // The full-slice result is allowed to differ, but must be finite.
        assert!(full.rsi_14.is_finite());
    }

    #[test]
    fn volume_ratio_uses_trailing_mean_excluding_current() {
        let calc = FeatureCalculator::new(20);
        let mut bars = synthetic_bars("LINK", 400, 20.0);
        // Spike the final bar's volume to 10x the plateau.
        let last = bars.last_mut().unwrap();
        last.volume = Decimal::from(1300);
        let features = calc.compute(&bars, Timeframe::M15).unwrap();
        assert!(features.volume_ratio > 5.0, "ratio = {}", features.volume_ratio);
    }

    #[test]
    fn feature_vector_length_matches() {
        let calc = FeatureCalculator::default();
        let bars = synthetic_bars("BTC", 300, 50_000.0);
        let features = calc.compute(&bars, Timeframe::M15).unwrap();
        assert_eq!(features.to_vec().len(), FeatureSet::VECTOR_LEN);
    }
}
