use std::collections::BTreeMap;

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};

use crate::regime::MarketRegime;
use crate::types::{StrategyKind, Tier, Timeframe};

/// The versioned trading configuration document. One snapshot is captured
/// per scan tick; positions keep the exit parameters of the snapshot they
/// were opened under.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradingConfig {
    pub version: String,
    #[serde(default)]
    pub global_settings: GlobalSettings,
    pub strategies: StrategiesConfig,
    pub market_cap_tiers: BTreeMap<Tier, Vec<String>>,
    #[serde(default)]
    pub position_management: PositionManagement,
    #[serde(default)]
    pub risk_management: RiskManagement,
    #[serde(default)]
    pub fees: Fees,
    pub slippage_rates: BTreeMap<Tier, Decimal>,
    #[serde(default)]
    pub ml: MlConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GlobalSettings {
    pub scan_interval_secs: u64,
    pub exit_check_interval_secs: u64,
    pub max_scan_tick_secs: u64,
    pub cell_timeout_secs: u64,
    pub exit_cell_timeout_secs: u64,
    pub query_timeout_secs: u64,
    pub freshness_threshold_secs: i64,
    pub initial_balance_usd: Decimal,
    pub volume_window: usize,
    /// Explicit scan order; when absent the universe follows tier order.
    #[serde(default)]
    pub symbol_order: Option<Vec<String>>,
}

impl Default for GlobalSettings {
    fn default() -> Self {
        Self {
            scan_interval_secs: 60,
            exit_check_interval_secs: 30,
            max_scan_tick_secs: 50,
            cell_timeout_secs: 5,
            exit_cell_timeout_secs: 3,
            query_timeout_secs: 10,
            freshness_threshold_secs: 300,
            initial_balance_usd: dec!(10000),
            volume_window: 20,
            symbol_order: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StrategiesConfig {
    #[serde(rename = "DCA")]
    pub dca: StrategyConfig<DcaThresholds>,
    #[serde(rename = "SWING")]
    pub swing: StrategyConfig<SwingThresholds>,
    #[serde(rename = "CHANNEL")]
    pub channel: StrategyConfig<ChannelThresholds>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StrategyConfig<T> {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_timeframe")]
    pub timeframe: String,
    pub detection_thresholds_by_tier: BTreeMap<Tier, T>,
    pub exits_by_tier: BTreeMap<Tier, ExitParams>,
    #[serde(default)]
    pub ml_thresholds_by_tier: BTreeMap<Tier, MlThresholds>,
    #[serde(default)]
    pub regime_blocklist: Vec<MarketRegime>,
}

fn default_true() -> bool {
    true
}

fn default_timeframe() -> String {
    "15m".to_string()
}

impl<T> StrategyConfig<T> {
    pub fn timeframe(&self) -> Timeframe {
        Timeframe::parse(&self.timeframe).unwrap_or(Timeframe::M15)
    }

    pub fn blocks_regime(&self, regime: MarketRegime) -> bool {
        self.regime_blocklist.contains(&regime)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DcaThresholds {
    /// Negative percent: setup requires a drop of at least this magnitude.
    pub drop_threshold: f64,
    #[serde(default = "default_dca_lookback")]
    pub lookback_hours: i64,
    pub volume_requirement: f64,
    pub rsi_max: f64,
}

fn default_dca_lookback() -> i64 {
    4
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SwingThresholds {
    /// Percent above the trailing high that counts as a breakout.
    pub breakout_threshold: f64,
    pub volume_spike_threshold: f64,
    pub rsi_bullish_min: f64,
    pub min_price_change_24h: f64,
    pub max_price_change_24h: f64,
    pub min_trend_strength: f64,
    #[serde(default = "default_swing_lookback")]
    pub lookback_bars: usize,
}

fn default_swing_lookback() -> usize {
    20
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelThresholds {
    #[serde(default = "default_channel_lookback")]
    pub lookback_bars: usize,
    pub min_touches: usize,
    pub parallel_tolerance: f64,
    /// Bottom fraction of the channel that counts as the buy zone.
    pub buy_zone: f64,
    pub min_strength: f64,
}

fn default_channel_lookback() -> usize {
    48
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ExitParams {
    pub take_profit: Decimal,
    pub stop_loss: Decimal,
    pub trailing_stop: Decimal,
    #[serde(default = "default_trailing_activation")]
    pub trailing_activation: Decimal,
    pub hold_hours: i64,
}

fn default_trailing_activation() -> Decimal {
    dec!(0.015)
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct MlThresholds {
    pub confidence_threshold: f64,
    pub near_miss_threshold: f64,
}

impl Default for MlThresholds {
    fn default() -> Self {
        Self {
            confidence_threshold: 0.60,
            near_miss_threshold: 0.40,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PositionManagement {
    pub base_notional_usd: Decimal,
    /// Fraction of the balance never deployed.
    pub reserve_pct: Decimal,
    #[serde(default)]
    pub tier_size_multipliers: BTreeMap<Tier, Decimal>,
}

impl Default for PositionManagement {
    fn default() -> Self {
        Self {
            base_notional_usd: dec!(100),
            reserve_pct: dec!(0.20),
            tier_size_multipliers: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskManagement {
    pub max_positions: usize,
    pub max_per_symbol: usize,
    #[serde(default = "default_max_per_strategy")]
    pub max_per_strategy: usize,
    pub max_daily_loss_pct: Decimal,
}

fn default_max_per_strategy() -> usize {
    15
}

impl Default for RiskManagement {
    fn default() -> Self {
        Self {
            max_positions: 30,
            max_per_symbol: 3,
            max_per_strategy: 15,
            max_daily_loss_pct: dec!(10.0),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Fees {
    pub taker: Decimal,
    #[serde(default = "default_maker_fee")]
    pub maker: Decimal,
}

fn default_maker_fee() -> Decimal {
    dec!(0.0016)
}

impl Default for Fees {
    fn default() -> Self {
        Self {
            taker: dec!(0.0026),
            maker: dec!(0.0016),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MlConfig {
    pub enabled: bool,
    pub artifact_dir: String,
}

impl Default for MlConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            artifact_dir: "models".to_string(),
        }
    }
}

impl TradingConfig {
    /// Tier membership lookup. Symbols outside every tier list fall back to
    /// memecoin, the most conservative tier.
    pub fn tier_for(&self, symbol: &str) -> Tier {
        for (tier, symbols) in &self.market_cap_tiers {
            if symbols.iter().any(|s| s == symbol) {
                return *tier;
            }
        }
        Tier::Memecoin
    }

    pub fn has_symbol(&self, symbol: &str) -> bool {
        self.market_cap_tiers
            .values()
            .any(|symbols| symbols.iter().any(|s| s == symbol))
    }

    /// The deterministic scan order: the explicit `symbol_order` when
    /// configured, otherwise tier order (large to meme) with each tier's
    /// symbols in their listed order.
    pub fn universe(&self) -> Vec<String> {
        if let Some(order) = &self.global_settings.symbol_order {
            return order.clone();
        }
        let mut out = Vec::new();
        for tier in Tier::all() {
            if let Some(symbols) = self.market_cap_tiers.get(&tier) {
                for s in symbols {
                    if !out.contains(s) {
                        out.push(s.clone());
                    }
                }
            }
        }
        out
    }

    pub fn slippage(&self, tier: Tier) -> Decimal {
        self.slippage_rates.get(&tier).copied().unwrap_or(dec!(0.0035))
    }

    pub fn size_multiplier(&self, tier: Tier) -> Decimal {
        self.position_management
            .tier_size_multipliers
            .get(&tier)
            .copied()
            .unwrap_or(Decimal::ONE)
    }

    pub fn strategy_enabled(&self, kind: StrategyKind) -> bool {
        match kind {
            StrategyKind::Dca => self.strategies.dca.enabled,
            StrategyKind::Swing => self.strategies.swing.enabled,
            StrategyKind::Channel => self.strategies.channel.enabled,
        }
    }

    pub fn strategy_timeframe(&self, kind: StrategyKind) -> Timeframe {
        match kind {
            StrategyKind::Dca => self.strategies.dca.timeframe(),
            StrategyKind::Swing => self.strategies.swing.timeframe(),
            StrategyKind::Channel => self.strategies.channel.timeframe(),
        }
    }

    pub fn blocks_regime(&self, kind: StrategyKind, regime: MarketRegime) -> bool {
        match kind {
            StrategyKind::Dca => self.strategies.dca.blocks_regime(regime),
            StrategyKind::Swing => self.strategies.swing.blocks_regime(regime),
            StrategyKind::Channel => self.strategies.channel.blocks_regime(regime),
        }
    }

    pub fn exits_for(&self, kind: StrategyKind, tier: Tier) -> Option<ExitParams> {
        let map = match kind {
            StrategyKind::Dca => &self.strategies.dca.exits_by_tier,
            StrategyKind::Swing => &self.strategies.swing.exits_by_tier,
            StrategyKind::Channel => &self.strategies.channel.exits_by_tier,
        };
        map.get(&tier).copied()
    }

    pub fn ml_thresholds(&self, kind: StrategyKind, tier: Tier) -> MlThresholds {
        let map = match kind {
            StrategyKind::Dca => &self.strategies.dca.ml_thresholds_by_tier,
            StrategyKind::Swing => &self.strategies.swing.ml_thresholds_by_tier,
            StrategyKind::Channel => &self.strategies.channel.ml_thresholds_by_tier,
        };
        map.get(&tier).copied().unwrap_or_default()
    }

    /// The thresholds a cell used, serialized for the `thresholds_used`
    /// column.
    pub fn thresholds_json(&self, kind: StrategyKind, tier: Tier) -> serde_json::Value {
        let detection = match kind {
            StrategyKind::Dca => self
                .strategies
                .dca
                .detection_thresholds_by_tier
                .get(&tier)
                .and_then(|t| serde_json::to_value(t).ok()),
            StrategyKind::Swing => self
                .strategies
                .swing
                .detection_thresholds_by_tier
                .get(&tier)
                .and_then(|t| serde_json::to_value(t).ok()),
            StrategyKind::Channel => self
                .strategies
                .channel
                .detection_thresholds_by_tier
                .get(&tier)
                .and_then(|t| serde_json::to_value(t).ok()),
        };
        let ml = self.ml_thresholds(kind, tier);
        serde_json::json!({
            "tier": tier.as_str(),
            "detection": detection,
            "ml": serde_json::to_value(ml).ok(),
        })
    }

    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.version.trim().is_empty() {
            errors.push("version must not be empty".to_string());
        }

        let g = &self.global_settings;
        if g.scan_interval_secs == 0 {
            errors.push("global_settings.scan_interval_secs must be > 0".to_string());
        }
        if g.exit_check_interval_secs == 0 {
            errors.push("global_settings.exit_check_interval_secs must be > 0".to_string());
        }
        if g.max_scan_tick_secs >= g.scan_interval_secs {
            errors.push("global_settings.max_scan_tick_secs must be below the scan interval".to_string());
        }
        if g.initial_balance_usd <= Decimal::ZERO {
            errors.push("global_settings.initial_balance_usd must be > 0".to_string());
        }
        if g.volume_window == 0 {
            errors.push("global_settings.volume_window must be > 0".to_string());
        }

        if self.fees.taker < Decimal::ZERO || self.fees.taker > dec!(0.05) {
            errors.push("fees.taker must be within [0, 0.05]".to_string());
        }
        for (tier, rate) in &self.slippage_rates {
            if *rate < Decimal::ZERO || *rate > dec!(0.05) {
                errors.push(format!("slippage_rates.{} must be within [0, 0.05]", tier));
            }
        }

        let r = &self.risk_management;
        if r.max_positions == 0 {
            errors.push("risk_management.max_positions must be > 0".to_string());
        }
        if r.max_per_symbol == 0 || r.max_per_symbol > r.max_positions {
            errors.push("risk_management.max_per_symbol must be within [1, max_positions]".to_string());
        }
        if r.max_daily_loss_pct <= Decimal::ZERO || r.max_daily_loss_pct > dec!(100) {
            errors.push("risk_management.max_daily_loss_pct must be within (0, 100]".to_string());
        }

        let p = &self.position_management;
        if p.base_notional_usd <= Decimal::ZERO {
            errors.push("position_management.base_notional_usd must be > 0".to_string());
        }
        if p.reserve_pct < Decimal::ZERO || p.reserve_pct >= Decimal::ONE {
            errors.push("position_management.reserve_pct must be within [0, 1)".to_string());
        }

        self.validate_strategy(StrategyKind::Dca, &mut errors);
        self.validate_strategy(StrategyKind::Swing, &mut errors);
        self.validate_strategy(StrategyKind::Channel, &mut errors);

        for kind in StrategyKind::all() {
            let tf = match kind {
                StrategyKind::Dca => &self.strategies.dca.timeframe,
                StrategyKind::Swing => &self.strategies.swing.timeframe,
                StrategyKind::Channel => &self.strategies.channel.timeframe,
            };
            if Timeframe::parse(tf).is_none() {
                errors.push(format!("strategies.{}.timeframe '{}' is not supported", kind, tf));
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }

    fn validate_strategy(&self, kind: StrategyKind, errors: &mut Vec<String>) {
        for tier in Tier::all() {
            if let Some(exits) = self.exits_for(kind, tier) {
                if exits.take_profit <= Decimal::ZERO || exits.take_profit >= Decimal::ONE {
                    errors.push(format!("strategies.{}.exits.{}.take_profit out of range", kind, tier));
                }
                if exits.stop_loss <= Decimal::ZERO || exits.stop_loss >= Decimal::ONE {
                    errors.push(format!("strategies.{}.exits.{}.stop_loss out of range", kind, tier));
                }
                if exits.trailing_stop <= Decimal::ZERO || exits.trailing_stop >= Decimal::ONE {
                    errors.push(format!("strategies.{}.exits.{}.trailing_stop out of range", kind, tier));
                }
                if exits.hold_hours <= 0 {
                    errors.push(format!("strategies.{}.exits.{}.hold_hours must be > 0", kind, tier));
                }
            } else {
                errors.push(format!("strategies.{}.exits_by_tier missing {}", kind, tier));
            }

            let ml = self.ml_thresholds(kind, tier);
            if !(0.0..=1.0).contains(&ml.confidence_threshold)
                || !(0.0..=1.0).contains(&ml.near_miss_threshold)
                || ml.near_miss_threshold > ml.confidence_threshold
            {
                errors.push(format!("strategies.{}.ml_thresholds.{} out of range", kind, tier));
            }
        }

        match kind {
            StrategyKind::Dca => {
                for (tier, t) in &self.strategies.dca.detection_thresholds_by_tier {
                    if t.drop_threshold >= 0.0 {
                        errors.push(format!("strategies.DCA.{}.drop_threshold must be negative", tier));
                    }
                    if t.lookback_hours <= 0 {
                        errors.push(format!("strategies.DCA.{}.lookback_hours must be > 0", tier));
                    }
                    if !(0.0..=100.0).contains(&t.rsi_max) {
                        errors.push(format!("strategies.DCA.{}.rsi_max out of range", tier));
                    }
                }
            }
            StrategyKind::Swing => {
                for (tier, t) in &self.strategies.swing.detection_thresholds_by_tier {
                    if t.breakout_threshold <= 0.0 {
                        errors.push(format!("strategies.SWING.{}.breakout_threshold must be > 0", tier));
                    }
                    if t.min_price_change_24h > t.max_price_change_24h {
                        errors.push(format!("strategies.SWING.{}.price_change bounds inverted", tier));
                    }
                    if t.lookback_bars < 2 {
                        errors.push(format!("strategies.SWING.{}.lookback_bars must be >= 2", tier));
                    }
                }
            }
            StrategyKind::Channel => {
                for (tier, t) in &self.strategies.channel.detection_thresholds_by_tier {
                    if t.lookback_bars < 8 {
                        errors.push(format!("strategies.CHANNEL.{}.lookback_bars must be >= 8", tier));
                    }
                    if t.min_touches == 0 {
                        errors.push(format!("strategies.CHANNEL.{}.min_touches must be > 0", tier));
                    }
                    if !(0.0..=1.0).contains(&t.buy_zone) || !(0.0..=1.0).contains(&t.min_strength) {
                        errors.push(format!("strategies.CHANNEL.{}.zone/strength out of range", tier));
                    }
                }
            }
        }
    }
}

/// Built-in baseline document. Tests and the example config start here; a
/// deployment always loads its own from `CONFIG_PATH` or the store.
impl Default for TradingConfig {
    fn default() -> Self {
        let tiers = [Tier::LargeCap, Tier::MidCap, Tier::SmallCap, Tier::Memecoin];

        let dca_detection: BTreeMap<Tier, DcaThresholds> = [
            (Tier::LargeCap, DcaThresholds { drop_threshold: -1.75, lookback_hours: 4, volume_requirement: 0.75, rsi_max: 35.0 }),
            (Tier::MidCap, DcaThresholds { drop_threshold: -2.25, lookback_hours: 4, volume_requirement: 0.85, rsi_max: 35.0 }),
            (Tier::SmallCap, DcaThresholds { drop_threshold: -3.0, lookback_hours: 4, volume_requirement: 0.90, rsi_max: 35.0 }),
            (Tier::Memecoin, DcaThresholds { drop_threshold: -4.0, lookback_hours: 4, volume_requirement: 1.10, rsi_max: 35.0 }),
        ]
        .into_iter()
        .collect();

        let swing_detection: BTreeMap<Tier, SwingThresholds> = tiers
            .iter()
            .map(|&tier| {
                let (breakout, spike) = match tier {
                    Tier::LargeCap => (1.0, 1.5),
                    Tier::MidCap => (1.5, 1.8),
                    Tier::SmallCap => (2.0, 2.0),
                    Tier::Memecoin => (3.0, 2.5),
                };
                (
                    tier,
                    SwingThresholds {
                        breakout_threshold: breakout,
                        volume_spike_threshold: spike,
                        rsi_bullish_min: 55.0,
                        min_price_change_24h: -5.0,
                        max_price_change_24h: 20.0,
                        min_trend_strength: 0.3,
                        lookback_bars: 20,
                    },
                )
            })
            .collect();

        let channel_detection: BTreeMap<Tier, ChannelThresholds> = tiers
            .iter()
            .map(|&tier| {
                (
                    tier,
                    ChannelThresholds {
                        lookback_bars: 48,
                        min_touches: 2,
                        parallel_tolerance: 0.15,
                        buy_zone: 0.25,
                        min_strength: 0.65,
                    },
                )
            })
            .collect();

        let exits = |tp: Decimal, sl: Decimal, trail: Decimal, hold: i64| ExitParams {
            take_profit: tp,
            stop_loss: sl,
            trailing_stop: trail,
            trailing_activation: dec!(0.015),
            hold_hours: hold,
        };

        let exits_by_tier: BTreeMap<Tier, ExitParams> = [
            (Tier::LargeCap, exits(dec!(0.04), dec!(0.06), dec!(0.02), 72)),
            (Tier::MidCap, exits(dec!(0.04), dec!(0.06), dec!(0.035), 72)),
            (Tier::SmallCap, exits(dec!(0.06), dec!(0.08), dec!(0.04), 48)),
            (Tier::Memecoin, exits(dec!(0.08), dec!(0.10), dec!(0.05), 24)),
        ]
        .into_iter()
        .collect();

        let ml_by_tier: BTreeMap<Tier, MlThresholds> = tiers
            .iter()
            .map(|&tier| (tier, MlThresholds::default()))
            .collect();

        Self {
            version: "1.0.0".to_string(),
            global_settings: GlobalSettings::default(),
            strategies: StrategiesConfig {
                dca: StrategyConfig {
                    enabled: true,
                    timeframe: "15m".to_string(),
                    detection_thresholds_by_tier: dca_detection,
                    exits_by_tier: exits_by_tier.clone(),
                    ml_thresholds_by_tier: ml_by_tier.clone(),
                    regime_blocklist: vec![MarketRegime::Crash],
                },
                swing: StrategyConfig {
                    enabled: true,
                    timeframe: "15m".to_string(),
                    detection_thresholds_by_tier: swing_detection,
                    exits_by_tier: exits_by_tier.clone(),
                    ml_thresholds_by_tier: ml_by_tier.clone(),
                    regime_blocklist: vec![MarketRegime::Crash],
                },
                channel: StrategyConfig {
                    enabled: true,
                    timeframe: "15m".to_string(),
                    detection_thresholds_by_tier: channel_detection,
                    exits_by_tier,
                    ml_thresholds_by_tier: ml_by_tier,
                    regime_blocklist: Vec::new(),
                },
            },
            market_cap_tiers: [
                (Tier::LargeCap, vec!["BTC".to_string(), "ETH".to_string(), "SOL".to_string()]),
                (Tier::MidCap, vec!["LINK".to_string(), "DOT".to_string(), "AVAX".to_string()]),
                (Tier::SmallCap, vec!["RUNE".to_string(), "OCEAN".to_string()]),
                (Tier::Memecoin, vec!["DOGE".to_string(), "SHIB".to_string()]),
            ]
            .into_iter()
            .collect(),
            position_management: PositionManagement::default(),
            risk_management: RiskManagement::default(),
            fees: Fees::default(),
            slippage_rates: [
                (Tier::LargeCap, dec!(0.0008)),
                (Tier::MidCap, dec!(0.0015)),
                (Tier::SmallCap, dec!(0.0035)),
                (Tier::Memecoin, dec!(0.0035)),
            ]
            .into_iter()
            .collect(),
            ml: MlConfig::default(),
        }
    }
}
