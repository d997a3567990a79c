use serde::{Deserialize, Serialize};

/// Market-cap tier. Drives detection thresholds, exit parameters, position
/// sizing, fees and slippage for every symbol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Tier {
    LargeCap,
    MidCap,
    SmallCap,
    Memecoin,
}

impl Tier {
    pub fn all() -> [Tier; 4] {
        [Tier::LargeCap, Tier::MidCap, Tier::SmallCap, Tier::Memecoin]
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Tier::LargeCap => "large_cap",
            Tier::MidCap => "mid_cap",
            Tier::SmallCap => "small_cap",
            Tier::Memecoin => "memecoin",
        }
    }

    pub fn parse(s: &str) -> Option<Tier> {
        match s {
            "large_cap" => Some(Tier::LargeCap),
            "mid_cap" => Some(Tier::MidCap),
            "small_cap" => Some(Tier::SmallCap),
            "memecoin" => Some(Tier::Memecoin),
            _ => None,
        }
    }
}

impl std::fmt::Display for Tier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
