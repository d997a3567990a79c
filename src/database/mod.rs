use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::Row;
use thiserror::Error;
use uuid::Uuid;

use crate::types::{
    ExitReason, OhlcBar, Position, PositionStatus, ScanDecision, Side, StrategyKind, Tier,
    Timeframe,
};

#[cfg(test)]
pub mod testing;

/// Label stamped into `paper_trades.trading_engine` for every row this
/// process writes.
pub const ENGINE_NAME: &str = "papertrader";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("query failed: {0}")]
    Query(#[from] sqlx::Error),

    #[error("query timed out after {0:?}")]
    Timeout(Duration),

    #[error("summary view unavailable: {0}")]
    ViewUnavailable(String),

    #[error("row decode failed: {0}")]
    Decode(String),
}

impl StoreError {
    /// Whether a retry at the call site is worthwhile.
    pub fn is_transient(&self) -> bool {
        match self {
            StoreError::Timeout(_) | StoreError::ViewUnavailable(_) => true,
            StoreError::Query(e) => matches!(
                e,
                sqlx::Error::Io(_) | sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed
            ),
            StoreError::Decode(_) => false,
        }
    }
}

/// Which physical relation serves an OHLC query. The hybrid fetcher picks by
/// window age; the base table always works but is expensive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BarSource {
    Today,
    Recent,
    Base,
}

impl BarSource {
    pub fn table(&self) -> &'static str {
        match self {
            BarSource::Today => "ohlc_today",
            BarSource::Recent => "ohlc_recent",
            BarSource::Base => "ohlc_data",
        }
    }

    pub fn is_view(&self) -> bool {
        !matches!(self, BarSource::Base)
    }
}

/// One row of `paper_trades`. BUY rows open a position group, SELL rows
/// close it; `to_open_position` rebuilds in-memory state from an unmatched
/// BUY at recovery time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradeRow {
    pub trade_id: Uuid,
    pub trade_group_id: Uuid,
    pub symbol: String,
    pub strategy: StrategyKind,
    pub side: Side,
    pub price: Decimal,
    pub amount: Decimal,
    pub notional: Decimal,
    pub pnl: Option<Decimal>,
    pub created_at: DateTime<Utc>,
    pub filled_at: DateTime<Utc>,
    pub exit_reason: Option<ExitReason>,
    pub stop_loss: Option<Decimal>,
    pub take_profit: Option<Decimal>,
    pub trailing_stop_pct: Option<Decimal>,
    pub trailing_activation_pct: Option<Decimal>,
    pub timeout_at: Option<DateTime<Utc>>,
    pub tier: Tier,
    pub ml_confidence: Option<f64>,
    pub predicted_take_profit: Option<Decimal>,
    pub predicted_stop_loss: Option<Decimal>,
    pub predicted_hold_hours: Option<f64>,
    pub hold_time_hours: Option<f64>,
    pub prediction_accuracy: Option<serde_json::Value>,
    pub scan_id: Uuid,
    pub trading_engine: String,
}

impl TradeRow {
    /// Rebuild an open position from an unmatched BUY row. Returns None for
    /// SELL rows or BUYs missing their exit parameters (pre-schema rows).
    pub fn to_open_position(&self) -> Option<Position> {
        if self.side != Side::Buy {
            return None;
        }
        let stop_loss = self.stop_loss?;
        let take_profit = self.take_profit?;
        let trailing_stop_pct = self.trailing_stop_pct?;
        let trailing_activation_pct = self.trailing_activation_pct?;
        let timeout_at = self.timeout_at?;

        let predicted = match (
            self.predicted_take_profit,
            self.predicted_stop_loss,
            self.predicted_hold_hours,
        ) {
            (Some(tp), Some(sl), Some(hold)) => Some(crate::ml::MlPrediction {
                take_profit_pct: tp,
                stop_loss_pct: sl,
                hold_hours: hold,
                size_multiplier: 1.0,
            }),
            _ => None,
        };

        Some(Position {
            trade_group_id: self.trade_group_id,
            symbol: self.symbol.clone(),
            strategy: self.strategy,
            tier: self.tier,
            entry_price: self.price,
            amount: self.amount,
            notional: self.notional,
            opened_at: self.filled_at,
            stop_loss,
            take_profit,
            trailing_stop_pct,
            trailing_activation_pct,
            high_watermark: self.price,
            timeout_at,
            status: PositionStatus::Open,
            scan_id: self.scan_id,
            predicted,
        })
    }
}

/// Audit entry appended to `config_history` for every accepted replacement.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigAudit {
    pub timestamp: DateTime<Utc>,
    pub version: String,
    pub section_changed: String,
    pub old_value: serde_json::Value,
    pub new_value: serde_json::Value,
    pub changed_by: String,
}

/// The single typed adapter over the relational store. Everything the engine
/// reads or writes goes through here; tests swap in the in-memory
/// implementation.
#[async_trait]
pub trait Store: Send + Sync {
    async fn fetch_bars(
        &self,
        source: BarSource,
        symbol: &str,
        timeframe: Timeframe,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<OhlcBar>, StoreError>;

    async fn latest_bar(
        &self,
        source: BarSource,
        symbol: &str,
        timeframe: Timeframe,
    ) -> Result<Option<OhlcBar>, StoreError>;

    async fn insert_scan_batch(&self, decisions: &[ScanDecision]) -> Result<(), StoreError>;

    async fn set_scan_trade_ref(&self, scan_id: Uuid, trade_group_id: Uuid)
        -> Result<(), StoreError>;

    async fn insert_trade(&self, row: &TradeRow) -> Result<(), StoreError>;

    /// BUY rows without a matching SELL, as reconstructed positions.
    async fn load_open_positions(&self) -> Result<Vec<Position>, StoreError>;

    async fn upsert_heartbeat(
        &self,
        service: &str,
        status: &str,
        metadata: serde_json::Value,
    ) -> Result<(), StoreError>;

    async fn load_config_document(&self) -> Result<Option<serde_json::Value>, StoreError>;

    async fn append_config_audit(&self, entry: &ConfigAudit) -> Result<(), StoreError>;
}

pub type SharedStore = Arc<dyn Store>;

/// Postgres-backed store.
pub struct Database {
    pool: PgPool,
    query_timeout: Duration,
}

impl Database {
    pub async fn connect(
        db_url: &str,
        max_connections: u32,
        query_timeout: Duration,
    ) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(query_timeout)
            .connect(db_url)
            .await?;

        let db = Self { pool, query_timeout };
        db.bootstrap_schema().await?;
        Ok(db)
    }

    /// Idempotent DDL for the tables this engine owns. The OHLC table and
    /// its summary views belong to the external ingester and are never
    /// touched here.
    async fn bootstrap_schema(&self) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS scan_history (
                scan_id UUID PRIMARY KEY,
                timestamp TIMESTAMPTZ NOT NULL,
                symbol VARCHAR(20) NOT NULL,
                strategy_name TEXT NOT NULL,
                decision TEXT NOT NULL,
                reason TEXT NOT NULL,
                market_regime TEXT NOT NULL,
                btc_price NUMERIC,
                features JSONB,
                setup_data JSONB,
                ml_confidence DOUBLE PRECISION,
                ml_predictions JSONB,
                thresholds_used JSONB,
                proposed_position_size NUMERIC,
                trade_id UUID
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_scan_history_ts ON scan_history(timestamp)",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_scan_history_symbol ON scan_history(symbol, strategy_name)",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS paper_trades (
                trade_id UUID PRIMARY KEY,
                trade_group_id UUID NOT NULL,
                symbol VARCHAR(20) NOT NULL,
                strategy_name TEXT NOT NULL,
                side TEXT NOT NULL,
                price NUMERIC NOT NULL,
                amount NUMERIC NOT NULL,
                notional NUMERIC NOT NULL,
                pnl NUMERIC,
                created_at TIMESTAMPTZ NOT NULL,
                filled_at TIMESTAMPTZ NOT NULL,
                exit_reason TEXT,
                stop_loss NUMERIC,
                take_profit NUMERIC,
                trailing_stop_pct NUMERIC,
                trailing_activation_pct NUMERIC,
                timeout_at TIMESTAMPTZ,
                tier TEXT NOT NULL,
                ml_confidence DOUBLE PRECISION,
                predicted_take_profit NUMERIC,
                predicted_stop_loss NUMERIC,
                predicted_hold_hours DOUBLE PRECISION,
                hold_time_hours DOUBLE PRECISION,
                prediction_accuracy JSONB,
                scan_id UUID,
                trading_engine TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_paper_trades_group ON paper_trades(trade_group_id)",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS system_heartbeat (
                service_name TEXT UNIQUE NOT NULL,
                last_heartbeat TIMESTAMPTZ NOT NULL,
                status TEXT NOT NULL,
                metadata JSONB
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS config_history (
                id BIGSERIAL PRIMARY KEY,
                timestamp TIMESTAMPTZ NOT NULL,
                config_version TEXT NOT NULL,
                section_changed TEXT NOT NULL,
                old_value JSONB,
                new_value JSONB,
                changed_by TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn timed<T>(
        &self,
        fut: impl std::future::Future<Output = Result<T, sqlx::Error>>,
    ) -> Result<T, StoreError> {
        match tokio::time::timeout(self.query_timeout, fut).await {
            Ok(result) => Ok(result?),
            Err(_) => Err(StoreError::Timeout(self.query_timeout)),
        }
    }
}

fn bar_from_row(row: &PgRow) -> Result<OhlcBar, StoreError> {
    let tf_raw: String = row.try_get("timeframe").map_err(decode_err)?;
    let timeframe = Timeframe::parse(&tf_raw)
        .ok_or_else(|| StoreError::Decode(format!("unknown timeframe '{}'", tf_raw)))?;
    Ok(OhlcBar {
        symbol: row.try_get("symbol").map_err(decode_err)?,
        timeframe,
        timestamp: row.try_get("timestamp").map_err(decode_err)?,
        open: row.try_get("open").map_err(decode_err)?,
        high: row.try_get("high").map_err(decode_err)?,
        low: row.try_get("low").map_err(decode_err)?,
        close: row.try_get("close").map_err(decode_err)?,
        volume: row.try_get("volume").map_err(decode_err)?,
        vwap: row.try_get("vwap").map_err(decode_err)?,
        trades: row.try_get("trades").map_err(decode_err)?,
    })
}

fn trade_row_from_row(row: &PgRow) -> Result<TradeRow, StoreError> {
    let strategy_raw: String = row.try_get("strategy_name").map_err(decode_err)?;
    let strategy = StrategyKind::parse(&strategy_raw)
        .ok_or_else(|| StoreError::Decode(format!("unknown strategy '{}'", strategy_raw)))?;
    let side_raw: String = row.try_get("side").map_err(decode_err)?;
    let side = match side_raw.as_str() {
        "BUY" => Side::Buy,
        "SELL" => Side::Sell,
        other => return Err(StoreError::Decode(format!("unknown side '{}'", other))),
    };
    let tier_raw: String = row.try_get("tier").map_err(decode_err)?;
    let tier = Tier::parse(&tier_raw)
        .ok_or_else(|| StoreError::Decode(format!("unknown tier '{}'", tier_raw)))?;
    let exit_reason: Option<String> = row.try_get("exit_reason").map_err(decode_err)?;

    Ok(TradeRow {
        trade_id: row.try_get("trade_id").map_err(decode_err)?,
        trade_group_id: row.try_get("trade_group_id").map_err(decode_err)?,
        symbol: row.try_get("symbol").map_err(decode_err)?,
        strategy,
        side,
        price: row.try_get("price").map_err(decode_err)?,
        amount: row.try_get("amount").map_err(decode_err)?,
        notional: row.try_get("notional").map_err(decode_err)?,
        pnl: row.try_get("pnl").map_err(decode_err)?,
        created_at: row.try_get("created_at").map_err(decode_err)?,
        filled_at: row.try_get("filled_at").map_err(decode_err)?,
        exit_reason: exit_reason.as_deref().and_then(ExitReason::parse),
        stop_loss: row.try_get("stop_loss").map_err(decode_err)?,
        take_profit: row.try_get("take_profit").map_err(decode_err)?,
        trailing_stop_pct: row.try_get("trailing_stop_pct").map_err(decode_err)?,
        trailing_activation_pct: row.try_get("trailing_activation_pct").map_err(decode_err)?,
        timeout_at: row.try_get("timeout_at").map_err(decode_err)?,
        tier,
        ml_confidence: row.try_get("ml_confidence").map_err(decode_err)?,
        predicted_take_profit: row.try_get("predicted_take_profit").map_err(decode_err)?,
        predicted_stop_loss: row.try_get("predicted_stop_loss").map_err(decode_err)?,
        predicted_hold_hours: row.try_get("predicted_hold_hours").map_err(decode_err)?,
        hold_time_hours: row.try_get("hold_time_hours").map_err(decode_err)?,
        prediction_accuracy: row.try_get("prediction_accuracy").map_err(decode_err)?,
        scan_id: row.try_get("scan_id").map_err(decode_err)?,
        trading_engine: row.try_get("trading_engine").map_err(decode_err)?,
    })
}

fn decode_err(e: sqlx::Error) -> StoreError {
    StoreError::Decode(e.to_string())
}

#[async_trait]
impl Store for Database {
    async fn fetch_bars(
        &self,
        source: BarSource,
        symbol: &str,
        timeframe: Timeframe,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<OhlcBar>, StoreError> {
        let sql = format!(
            r#"
            SELECT DISTINCT ON (timestamp)
                symbol, timeframe, timestamp, open, high, low, close, volume, vwap, trades
            FROM {}
            WHERE symbol = $1 AND timeframe = $2 AND timestamp >= $3 AND timestamp <= $4
            ORDER BY timestamp ASC
            "#,
            source.table()
        );

        let rows = self
            .timed(
                sqlx::query(&sql)
                    .bind(symbol)
                    .bind(timeframe.as_str())
                    .bind(from)
                    .bind(to)
                    .fetch_all(&self.pool),
            )
            .await
            .map_err(|e| view_error(source, e))?;

        rows.iter().map(bar_from_row).collect()
    }

    async fn latest_bar(
        &self,
        source: BarSource,
        symbol: &str,
        timeframe: Timeframe,
    ) -> Result<Option<OhlcBar>, StoreError> {
        let sql = format!(
            r#"
            SELECT symbol, timeframe, timestamp, open, high, low, close, volume, vwap, trades
            FROM {}
            WHERE symbol = $1 AND timeframe = $2
            ORDER BY timestamp DESC
            LIMIT 1
            "#,
            source.table()
        );

        let row = self
            .timed(
                sqlx::query(&sql)
                    .bind(symbol)
                    .bind(timeframe.as_str())
                    .fetch_optional(&self.pool),
            )
            .await
            .map_err(|e| view_error(source, e))?;

        row.as_ref().map(bar_from_row).transpose()
    }

    async fn insert_scan_batch(&self, decisions: &[ScanDecision]) -> Result<(), StoreError> {
        if decisions.is_empty() {
            return Ok(());
        }

        let mut tx = self.timed(self.pool.begin()).await?;
        for d in decisions {
            let features = d
                .features
                .as_ref()
                .and_then(|f| serde_json::to_value(f).ok());
            let setup_data = d
                .setup
                .as_ref()
                .and_then(|s| serde_json::to_value(&s.data).ok());
            let ml_predictions = d
                .ml_predictions
                .as_ref()
                .and_then(|p| serde_json::to_value(p).ok());

            // scan_id is the primary key: replays are no-ops, which is what
            // makes the logger's at-least-once delivery safe downstream.
            let q = sqlx::query(
                r#"
                INSERT INTO scan_history (
                    scan_id, timestamp, symbol, strategy_name, decision, reason,
                    market_regime, btc_price, features, setup_data, ml_confidence,
                    ml_predictions, thresholds_used, proposed_position_size, trade_id
                )
                VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9,$10,$11,$12,$13,$14,$15)
                ON CONFLICT (scan_id) DO NOTHING
                "#,
            )
            .bind(d.scan_id)
            .bind(d.timestamp)
            .bind(&d.symbol)
            .bind(d.strategy.as_str())
            .bind(d.decision.as_str())
            .bind(d.reason.as_str())
            .bind(d.market_regime.as_str())
            .bind(d.btc_price)
            .bind(features)
            .bind(setup_data)
            .bind(d.ml_confidence)
            .bind(ml_predictions)
            .bind(d.thresholds_used.clone())
            .bind(d.proposed_position_size)
            .bind(d.trade_id)
            .execute(&mut *tx);
            self.timed(q).await?;
        }
        self.timed(tx.commit()).await?;
        Ok(())
    }

    async fn set_scan_trade_ref(
        &self,
        scan_id: Uuid,
        trade_group_id: Uuid,
    ) -> Result<(), StoreError> {
        self.timed(
            sqlx::query("UPDATE scan_history SET trade_id = $2 WHERE scan_id = $1")
                .bind(scan_id)
                .bind(trade_group_id)
                .execute(&self.pool),
        )
        .await?;
        Ok(())
    }

    async fn insert_trade(&self, row: &TradeRow) -> Result<(), StoreError> {
        self.timed(
            sqlx::query(
                r#"
                INSERT INTO paper_trades (
                    trade_id, trade_group_id, symbol, strategy_name, side, price,
                    amount, notional, pnl, created_at, filled_at, exit_reason,
                    stop_loss, take_profit, trailing_stop_pct, trailing_activation_pct,
                    timeout_at, tier, ml_confidence, predicted_take_profit,
                    predicted_stop_loss, predicted_hold_hours, hold_time_hours,
                    prediction_accuracy, scan_id, trading_engine
                )
                VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9,$10,$11,$12,$13,$14,$15,$16,
                        $17,$18,$19,$20,$21,$22,$23,$24,$25,$26)
                "#,
            )
            .bind(row.trade_id)
            .bind(row.trade_group_id)
            .bind(&row.symbol)
            .bind(row.strategy.as_str())
            .bind(row.side.as_str())
            .bind(row.price)
            .bind(row.amount)
            .bind(row.notional)
            .bind(row.pnl)
            .bind(row.created_at)
            .bind(row.filled_at)
            .bind(row.exit_reason.map(|r| r.as_str()))
            .bind(row.stop_loss)
            .bind(row.take_profit)
            .bind(row.trailing_stop_pct)
            .bind(row.trailing_activation_pct)
            .bind(row.timeout_at)
            .bind(row.tier.as_str())
            .bind(row.ml_confidence)
            .bind(row.predicted_take_profit)
            .bind(row.predicted_stop_loss)
            .bind(row.predicted_hold_hours)
            .bind(row.hold_time_hours)
            .bind(row.prediction_accuracy.clone())
            .bind(row.scan_id)
            .bind(&row.trading_engine)
            .execute(&self.pool),
        )
        .await?;
        Ok(())
    }

    async fn load_open_positions(&self) -> Result<Vec<Position>, StoreError> {
        let rows = self
            .timed(
                sqlx::query(
                    r#"
                    SELECT b.* FROM paper_trades b
                    WHERE b.side = 'BUY'
                      AND NOT EXISTS (
                        SELECT 1 FROM paper_trades s
                        WHERE s.trade_group_id = b.trade_group_id AND s.side = 'SELL'
                      )
                    ORDER BY b.filled_at ASC
                    "#,
                )
                .fetch_all(&self.pool),
            )
            .await?;

        let mut positions = Vec::new();
        for row in &rows {
            let trade = trade_row_from_row(row)?;
            if let Some(position) = trade.to_open_position() {
                positions.push(position);
            } else {
                tracing::warn!(
                    trade_group_id = %trade.trade_group_id,
                    "open BUY row missing exit parameters; skipping recovery for it"
                );
            }
        }
        Ok(positions)
    }

    async fn upsert_heartbeat(
        &self,
        service: &str,
        status: &str,
        metadata: serde_json::Value,
    ) -> Result<(), StoreError> {
        self.timed(
            sqlx::query(
                r#"
                INSERT INTO system_heartbeat (service_name, last_heartbeat, status, metadata)
                VALUES ($1, $2, $3, $4)
                ON CONFLICT (service_name)
                DO UPDATE SET last_heartbeat = $2, status = $3, metadata = $4
                "#,
            )
            .bind(service)
            .bind(Utc::now())
            .bind(status)
            .bind(metadata)
            .execute(&self.pool),
        )
        .await?;
        Ok(())
    }

    async fn load_config_document(&self) -> Result<Option<serde_json::Value>, StoreError> {
        let row = self
            .timed(
                sqlx::query(
                    r#"
                    SELECT config_data FROM trading_config
                    ORDER BY last_updated DESC
                    LIMIT 1
                    "#,
                )
                .fetch_optional(&self.pool),
            )
            .await?;

        row.map(|r| r.try_get::<serde_json::Value, _>("config_data").map_err(decode_err))
            .transpose()
    }

    async fn append_config_audit(&self, entry: &ConfigAudit) -> Result<(), StoreError> {
        self.timed(
            sqlx::query(
                r#"
                INSERT INTO config_history (
                    timestamp, config_version, section_changed, old_value, new_value, changed_by
                )
                VALUES ($1, $2, $3, $4, $5, $6)
                "#,
            )
            .bind(entry.timestamp)
            .bind(&entry.version)
            .bind(&entry.section_changed)
            .bind(entry.old_value.clone())
            .bind(entry.new_value.clone())
            .bind(&entry.changed_by)
            .execute(&self.pool),
        )
        .await?;
        Ok(())
    }
}

fn view_error(source: BarSource, e: StoreError) -> StoreError {
    // A failing summary view is recoverable by re-running against the base
    // table; make that distinguishable for the fetcher.
    if source.is_view() {
        if let StoreError::Query(inner) = &e {
            if matches!(inner, sqlx::Error::Database(_) | sqlx::Error::RowNotFound) {
                return StoreError::ViewUnavailable(format!("{}: {}", source.table(), inner));
            }
        }
    }
    e
}
