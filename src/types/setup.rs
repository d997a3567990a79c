use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// The three entry strategies, in their fixed processing order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum StrategyKind {
    Dca,
    Swing,
    Channel,
}

impl StrategyKind {
    pub fn all() -> [StrategyKind; 3] {
        [StrategyKind::Dca, StrategyKind::Swing, StrategyKind::Channel]
    }

    /// Wire/store representation (`strategy_name` columns, config keys).
    pub fn as_str(&self) -> &'static str {
        match self {
            StrategyKind::Dca => "DCA",
            StrategyKind::Swing => "SWING",
            StrategyKind::Channel => "CHANNEL",
        }
    }

    pub fn parse(s: &str) -> Option<StrategyKind> {
        match s {
            "DCA" => Some(StrategyKind::Dca),
            "SWING" => Some(StrategyKind::Swing),
            "CHANNEL" => Some(StrategyKind::Channel),
            _ => None,
        }
    }

    /// Tie-break rank when two strategies emit TAKE on the same symbol with
    /// equal confidence: DCA before Swing before Channel.
    pub fn rank(&self) -> u8 {
        match self {
            StrategyKind::Dca => 0,
            StrategyKind::Swing => 1,
            StrategyKind::Channel => 2,
        }
    }
}

impl std::fmt::Display for StrategyKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Strategy-specific evidence captured at detection time. Persisted verbatim
/// into `scan_history.setup_data` for later model training.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SetupData {
    Dca {
        drop_percent: f64,
        reference_high: Decimal,
        rsi: f64,
        volume_ratio: f64,
        support_distance: f64,
    },
    Swing {
        breakout_percent: f64,
        resistance: Decimal,
        volume_ratio: f64,
        rsi: f64,
        trend_strength: f64,
    },
    Channel {
        channel_top: Decimal,
        channel_bottom: Decimal,
        position_in_channel: f64,
        strength: f64,
    },
}

/// A detected entry opportunity. Ephemeral: produced and consumed within a
/// single scan cell, then serialized into the decision row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Setup {
    pub strategy: StrategyKind,
    pub symbol: String,
    pub detected_at: DateTime<Utc>,
    pub reference_price: Decimal,
    pub data: SetupData,
    pub suggested_notional: Option<Decimal>,
}
