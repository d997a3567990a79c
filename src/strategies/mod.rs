pub mod channel;
pub mod dca;
pub mod simple;
pub mod swing;

pub use channel::ChannelDetector;
pub use dca::DcaDetector;
pub use simple::SimpleRules;
pub use swing::SwingDetector;

use chrono::{DateTime, Utc};

use crate::config::TradingConfig;
use crate::features::FeatureSet;
use crate::regime::MarketRegime;
use crate::types::{OhlcBar, Setup, StrategyKind, Tier, Timeframe};

/// Tabular input every detector consumes. Bars are ascending and validated;
/// features are precomputed once per cell so detectors never recompute
/// indicators.
pub struct DetectInput<'a> {
    pub symbol: &'a str,
    pub bars: &'a [OhlcBar],
    pub features: &'a FeatureSet,
    pub regime: MarketRegime,
    pub timeframe: Timeframe,
    pub now: DateTime<Utc>,
}

impl<'a> DetectInput<'a> {
    pub fn last_close(&self) -> rust_decimal::Decimal {
        self.bars
            .last()
            .map(|b| b.close)
            .unwrap_or(rust_decimal::Decimal::ZERO)
    }
}

/// A pure entry detector: slice in, optional setup out. No state, no I/O.
pub trait Detector: Send + Sync {
    fn kind(&self) -> StrategyKind;

    fn detect(&self, input: &DetectInput<'_>, config: &TradingConfig, tier: Tier) -> Option<Setup>;
}

/// The fixed detector set in processing order.
pub fn all_detectors() -> Vec<Box<dyn Detector>> {
    vec![
        Box::new(DcaDetector),
        Box::new(SwingDetector),
        Box::new(ChannelDetector),
    ]
}
