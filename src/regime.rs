use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::types::{decimal_to_f64, OhlcBar};

/// Coarse market state derived from BTC, computed once per scan tick and
/// stamped onto every decision row. Strategies can blocklist regimes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MarketRegime {
    Normal,
    Caution,
    Crash,
}

impl MarketRegime {
    pub fn as_str(&self) -> &'static str {
        match self {
            MarketRegime::Normal => "NORMAL",
            MarketRegime::Caution => "CAUTION",
            MarketRegime::Crash => "CRASH",
        }
    }

    pub fn parse(s: &str) -> Option<MarketRegime> {
        match s {
            "NORMAL" => Some(MarketRegime::Normal),
            "CAUTION" => Some(MarketRegime::Caution),
            "CRASH" => Some(MarketRegime::Crash),
            _ => None,
        }
    }
}

impl std::fmt::Display for MarketRegime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

const CRASH_24H_PCT: f64 = -10.0;
const CRASH_4H_PCT: f64 = -6.0;
const CAUTION_24H_PCT: f64 = -5.0;
const CAUTION_4H_PCT: f64 = -3.0;

/// Classify from ascending BTC 1h bars (at least 25 needed for the 24h
/// window). With too little data the gauge stays `Normal` rather than
/// blocking every regime-filtered strategy.
pub fn classify(btc_hourly: &[OhlcBar]) -> MarketRegime {
    let ret_24h = trailing_return_pct(btc_hourly, 24);
    let ret_4h = trailing_return_pct(btc_hourly, 4);

    match (ret_24h, ret_4h) {
        (Some(r24), _) if r24 <= CRASH_24H_PCT => MarketRegime::Crash,
        (_, Some(r4)) if r4 <= CRASH_4H_PCT => MarketRegime::Crash,
        (Some(r24), _) if r24 <= CAUTION_24H_PCT => MarketRegime::Caution,
        (_, Some(r4)) if r4 <= CAUTION_4H_PCT => MarketRegime::Caution,
        _ => MarketRegime::Normal,
    }
}

fn trailing_return_pct(bars: &[OhlcBar], hours: usize) -> Option<f64> {
    if bars.len() < hours + 1 {
        return None;
    }
    let now = decimal_to_f64(bars[bars.len() - 1].close);
    let then = decimal_to_f64(bars[bars.len() - 1 - hours].close);
    if then <= 0.0 {
        return None;
    }
    Some((now - then) / then * 100.0)
}

pub fn latest_price(btc_hourly: &[OhlcBar]) -> Option<Decimal> {
    btc_hourly.last().map(|b| b.close)
}
