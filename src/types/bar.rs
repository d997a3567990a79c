use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Bar timeframes served by the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Timeframe {
    M1,
    M15,
    H1,
    D1,
}

impl Timeframe {
    pub fn all() -> [Timeframe; 4] {
        [Timeframe::M1, Timeframe::M15, Timeframe::H1, Timeframe::D1]
    }

    /// Wire/store representation (`ohlc_data.timeframe` column).
    pub fn as_str(&self) -> &'static str {
        match self {
            Timeframe::M1 => "1m",
            Timeframe::M15 => "15m",
            Timeframe::H1 => "1h",
            Timeframe::D1 => "1d",
        }
    }

    pub fn parse(s: &str) -> Option<Timeframe> {
        match s {
            "1m" => Some(Timeframe::M1),
            "15m" => Some(Timeframe::M15),
            "1h" => Some(Timeframe::H1),
            "1d" => Some(Timeframe::D1),
            _ => None,
        }
    }

    pub fn minutes(&self) -> i64 {
        match self {
            Timeframe::M1 => 1,
            Timeframe::M15 => 15,
            Timeframe::H1 => 60,
            Timeframe::D1 => 1440,
        }
    }

    pub fn duration(&self) -> Duration {
        Duration::minutes(self.minutes())
    }

    /// Number of bars covering the given wall-clock window.
    pub fn bars_in_hours(&self, hours: i64) -> usize {
        ((hours * 60) / self.minutes()).max(1) as usize
    }
}

impl std::fmt::Display for Timeframe {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One OHLC observation. Immutable once written by the external ingester;
/// the engine only ever reads these.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OhlcBar {
    pub symbol: String,
    pub timeframe: Timeframe,
    pub timestamp: DateTime<Utc>,
    pub open: Decimal,
    pub high: Decimal,
    pub low: Decimal,
    pub close: Decimal,
    pub volume: Decimal,
    pub vwap: Option<Decimal>,
    pub trades: Option<i64>,
}

impl OhlcBar {
    pub fn range(&self) -> Decimal {
        self.high - self.low
    }

    pub fn is_bullish(&self) -> bool {
        self.close > self.open
    }

    pub fn typical_price(&self) -> Decimal {
        (self.high + self.low + self.close) / Decimal::from(3)
    }

    pub fn close_f64(&self) -> f64 {
        decimal_to_f64(self.close)
    }

    pub fn volume_f64(&self) -> f64 {
        decimal_to_f64(self.volume)
    }

    /// Internal consistency of a single bar.
    pub fn is_well_formed(&self) -> bool {
        self.high >= self.low
            && self.high >= self.open
            && self.high >= self.close
            && self.low <= self.open
            && self.low <= self.close
            && self.volume >= Decimal::ZERO
    }
}

pub fn decimal_to_f64(value: Decimal) -> f64 {
    value.try_into().unwrap_or(0.0)
}

/// Problems a bar slice can exhibit. These are data-quality conditions the
/// scanner converts into SKIP decisions, never into crashes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SliceIssue {
    Empty,
    MalformedBar,
    NonMonotonic,
}

/// Validate an ascending slice before handing it to the feature calculator.
/// Gaps are permitted (healed by the external updater); reordered or
/// impossible bars are not.
pub fn validate_slice(bars: &[OhlcBar]) -> Result<(), SliceIssue> {
    if bars.is_empty() {
        return Err(SliceIssue::Empty);
    }
    let mut prev: Option<DateTime<Utc>> = None;
    for bar in bars {
        if !bar.is_well_formed() {
            return Err(SliceIssue::MalformedBar);
        }
        if let Some(p) = prev {
            if bar.timestamp <= p {
                return Err(SliceIssue::NonMonotonic);
            }
        }
        prev = Some(bar.timestamp);
    }
    Ok(())
}

pub fn closes(bars: &[OhlcBar]) -> Vec<f64> {
    bars.iter().map(|b| b.close_f64()).collect()
}

pub fn volumes(bars: &[OhlcBar]) -> Vec<f64> {
    bars.iter().map(|b| b.volume_f64()).collect()
}

pub fn highest_close(bars: &[OhlcBar]) -> Option<Decimal> {
    bars.iter().map(|b| b.close).max()
}

pub fn lowest_close(bars: &[OhlcBar]) -> Option<Decimal> {
    bars.iter().map(|b| b.close).min()
}
