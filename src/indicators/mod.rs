#![allow(dead_code)]
pub mod bollinger;
pub mod ema;
pub mod macd;
pub mod rsi;
pub mod stochastic;

pub use bollinger::*;
pub use ema::*;
pub use macd::*;
pub use rsi::*;
pub use stochastic::*;

/// Streaming indicators share one lifecycle: feed values with `update`,
/// read with `value`, check readiness before trusting the output.
pub trait Indicator {
    fn name(&self) -> &'static str;
    fn is_ready(&self) -> bool;
    fn reset(&mut self);
}

pub fn sma(values: &[f64], period: usize) -> Option<f64> {
    if period == 0 || values.len() < period {
        return None;
    }
    let sum: f64 = values.iter().rev().take(period).sum();
    Some(sum / period as f64)
}

pub fn highest(values: &[f64], period: usize) -> Option<f64> {
    if period == 0 || values.len() < period {
        return None;
    }
    values
        .iter()
        .rev()
        .take(period)
        .copied()
        .fold(None, |acc: Option<f64>, v| Some(acc.map_or(v, |a| a.max(v))))
}

pub fn lowest(values: &[f64], period: usize) -> Option<f64> {
    if period == 0 || values.len() < period {
        return None;
    }
    values
        .iter()
        .rev()
        .take(period)
        .copied()
        .fold(None, |acc: Option<f64>, v| Some(acc.map_or(v, |a| a.min(v))))
}

pub fn stddev(values: &[f64], period: usize) -> Option<f64> {
    if period < 2 || values.len() < period {
        return None;
    }
    let mean = sma(values, period)?;
    let variance = values
        .iter()
        .rev()
        .take(period)
        .map(|v| {
            let d = v - mean;
            d * d
        })
        .sum::<f64>()
        / period as f64;
    Some(variance.sqrt())
}

/// Percent change between the latest value and the value `period` steps back.
pub fn rate_of_change(values: &[f64], period: usize) -> Option<f64> {
    if values.len() <= period {
        return None;
    }
    let now = values[values.len() - 1];
    let then = values[values.len() - 1 - period];
    if then == 0.0 {
        return None;
    }
    Some((now - then) / then * 100.0)
}

/// Annualization-free rolling volatility: std of log returns over `period`.
pub fn log_return_volatility(closes: &[f64], period: usize) -> Option<f64> {
    if closes.len() < period + 1 {
        return None;
    }
    let window = &closes[closes.len() - period - 1..];
    let returns: Vec<f64> = window
        .windows(2)
        .filter(|w| w[0] > 0.0 && w[1] > 0.0)
        .map(|w| (w[1] / w[0]).ln())
        .collect();
    if returns.len() < 2 {
        return None;
    }
    let mean = returns.iter().sum::<f64>() / returns.len() as f64;
    let variance = returns.iter().map(|r| (r - mean).powi(2)).sum::<f64>() / returns.len() as f64;
    Some(variance.sqrt())
}
