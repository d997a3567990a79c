use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use uuid::Uuid;

use crate::types::{OhlcBar, Position, ScanDecision, Side, Timeframe};

use super::{BarSource, ConfigAudit, Store, StoreError, TradeRow};

/// In-memory `Store` for unit tests. Failure knobs simulate view outages and
/// transient query errors so retry/fallback paths can be exercised without a
/// database.
#[derive(Default)]
pub struct MemoryStore {
    pub bars: Mutex<HashMap<(BarSource, String, Timeframe), Vec<OhlcBar>>>,
    pub scans: Mutex<Vec<ScanDecision>>,
    pub trades: Mutex<Vec<TradeRow>>,
    pub heartbeats: Mutex<HashMap<String, (DateTime<Utc>, String, serde_json::Value)>>,
    pub audits: Mutex<Vec<ConfigAudit>>,
    pub config_document: Mutex<Option<serde_json::Value>>,
    /// Every view query fails with `ViewUnavailable` while set.
    pub view_down: AtomicBool,
    /// The next N bar fetches fail with a transient error.
    pub fail_bar_fetches: AtomicU32,
    /// The next N scan-batch inserts fail with a transient error.
    pub fail_scan_inserts: AtomicU32,
    /// Counts every fetch_bars/latest_bar call per source.
    pub fetch_counts: Mutex<HashMap<BarSource, u32>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn seed_bars(&self, source: BarSource, bars: Vec<OhlcBar>) {
        if bars.is_empty() {
            return;
        }
        let key = (source, bars[0].symbol.clone(), bars[0].timeframe);
        self.bars.lock().insert(key, bars);
    }

    pub fn scan_rows(&self) -> Vec<ScanDecision> {
        self.scans.lock().clone()
    }

    pub fn trade_rows(&self) -> Vec<TradeRow> {
        self.trades.lock().clone()
    }

    pub fn fetch_count(&self, source: BarSource) -> u32 {
        self.fetch_counts.lock().get(&source).copied().unwrap_or(0)
    }

    fn note_fetch(&self, source: BarSource) {
        *self.fetch_counts.lock().entry(source).or_insert(0) += 1;
    }

    fn check_bar_failure(&self, source: BarSource) -> Result<(), StoreError> {
        if source.is_view() && self.view_down.load(Ordering::Acquire) {
            return Err(StoreError::ViewUnavailable(source.table().to_string()));
        }
        let remaining = self.fail_bar_fetches.load(Ordering::Acquire);
        if remaining > 0 {
            self.fail_bar_fetches.store(remaining - 1, Ordering::Release);
            return Err(StoreError::Timeout(std::time::Duration::from_millis(1)));
        }
        Ok(())
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn fetch_bars(
        &self,
        source: BarSource,
        symbol: &str,
        timeframe: Timeframe,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<OhlcBar>, StoreError> {
        self.note_fetch(source);
        self.check_bar_failure(source)?;
        let bars = self.bars.lock();
        let key = (source, symbol.to_string(), timeframe);
        Ok(bars
            .get(&key)
            .map(|all| {
                all.iter()
                    .filter(|b| b.timestamp >= from && b.timestamp <= to)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn latest_bar(
        &self,
        source: BarSource,
        symbol: &str,
        timeframe: Timeframe,
    ) -> Result<Option<OhlcBar>, StoreError> {
        self.note_fetch(source);
        self.check_bar_failure(source)?;
        let bars = self.bars.lock();
        let key = (source, symbol.to_string(), timeframe);
        Ok(bars.get(&key).and_then(|all| all.last().cloned()))
    }

    async fn insert_scan_batch(&self, decisions: &[ScanDecision]) -> Result<(), StoreError> {
        let remaining = self.fail_scan_inserts.load(Ordering::Acquire);
        if remaining > 0 {
            self.fail_scan_inserts.store(remaining - 1, Ordering::Release);
            return Err(StoreError::Timeout(std::time::Duration::from_millis(1)));
        }
        let mut scans = self.scans.lock();
        for d in decisions {
            // Primary-key semantics: replays are no-ops.
            if !scans.iter().any(|existing| existing.scan_id == d.scan_id) {
                scans.push(d.clone());
            }
        }
        Ok(())
    }

    async fn set_scan_trade_ref(
        &self,
        scan_id: Uuid,
        trade_group_id: Uuid,
    ) -> Result<(), StoreError> {
        let mut scans = self.scans.lock();
        for d in scans.iter_mut() {
            if d.scan_id == scan_id {
                d.trade_id = Some(trade_group_id);
            }
        }
        Ok(())
    }

    async fn insert_trade(&self, row: &TradeRow) -> Result<(), StoreError> {
        self.trades.lock().push(row.clone());
        Ok(())
    }

    async fn load_open_positions(&self) -> Result<Vec<Position>, StoreError> {
        let trades = self.trades.lock();
        let mut positions = Vec::new();
        for buy in trades.iter().filter(|t| t.side == Side::Buy) {
            let closed = trades
                .iter()
                .any(|t| t.side == Side::Sell && t.trade_group_id == buy.trade_group_id);
            if !closed {
                if let Some(position) = buy.to_open_position() {
                    positions.push(position);
                }
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
        self.heartbeats
            .lock()
            .insert(service.to_string(), (Utc::now(), status.to_string(), metadata));
        Ok(())
    }

    async fn load_config_document(&self) -> Result<Option<serde_json::Value>, StoreError> {
        Ok(self.config_document.lock().clone())
    }

    async fn append_config_audit(&self, entry: &ConfigAudit) -> Result<(), StoreError> {
        self.audits.lock().push(entry.clone());
        Ok(())
    }
}
