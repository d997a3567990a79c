#![allow(dead_code)]
pub mod bar;
pub mod decision;
pub mod position;
pub mod setup;
pub mod tier;

pub use bar::*;
pub use decision::*;
pub use position::*;
pub use setup::*;
pub use tier::*;

use serde::{Deserialize, Serialize};

/// Order side for persisted trade rows. Every position in this engine is
/// LONG: a BUY row opens it, a SELL row closes it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    pub fn as_str(&self) -> &'static str {
        match self {
            Side::Buy => "BUY",
            Side::Sell => "SELL",
        }
    }
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
