use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::database::{ConfigAudit, SharedStore};
use crate::error::EngineError;

use super::TradingConfig;

/// Where the configuration document comes from. A file path wins when
/// `CONFIG_PATH` is set; otherwise the `trading_config` table row is used.
#[derive(Debug, Clone)]
pub enum ConfigSource {
    File(PathBuf),
    Store,
}

/// Shared handle to the active configuration. Readers take a cheap
/// `Arc<TradingConfig>` snapshot; a scan tick captures exactly one snapshot
/// and uses it throughout, so a mid-tick replacement never splits a tick
/// across two versions.
#[derive(Clone)]
pub struct ConfigHandle {
    inner: Arc<RwLock<Arc<TradingConfig>>>,
}

impl ConfigHandle {
    pub fn new(config: TradingConfig) -> Self {
        Self {
            inner: Arc::new(RwLock::new(Arc::new(config))),
        }
    }

    pub async fn snapshot(&self) -> Arc<TradingConfig> {
        self.inner.read().await.clone()
    }

    async fn replace(&self, config: TradingConfig) {
        let mut guard = self.inner.write().await;
        *guard = Arc::new(config);
    }
}

pub struct ConfigLoader {
    source: ConfigSource,
    handle: ConfigHandle,
    store: SharedStore,
    reload_interval: Duration,
    changed_by: String,
}

impl ConfigLoader {
    /// Load the initial document, validate it, and build the shared handle.
    /// A startup without a valid config is fatal.
    pub async fn bootstrap(
        source: ConfigSource,
        store: SharedStore,
        reload_interval: Duration,
    ) -> Result<(Self, ConfigHandle), EngineError> {
        let config = load_document(&source, &store).await?;
        config
            .validate()
            .map_err(|errors| EngineError::Config(errors.join("; ")))?;
        info!(version = %config.version, "configuration loaded");

        let handle = ConfigHandle::new(config);
        let loader = Self {
            source,
            handle: handle.clone(),
            store,
            reload_interval,
            changed_by: "config_watcher".to_string(),
        };
        Ok((loader, handle))
    }

    /// Periodic re-read loop. An invalid replacement keeps the previous
    /// snapshot; an accepted one appends section-level audit rows.
    pub async fn watch(&self, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(self.reload_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick of a tokio interval fires immediately; skip it so
        // the bootstrap snapshot is not re-audited.
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("config watcher stopping");
                    return;
                }
                _ = ticker.tick() => {
                    if let Err(e) = self.reload_once().await {
                        warn!(error = %e, "config reload failed; keeping previous snapshot");
                    }
                }
            }
        }
    }

    pub async fn reload_once(&self) -> Result<bool, EngineError> {
        let next = load_document(&self.source, &self.store).await?;
        if let Err(errors) = next.validate() {
            return Err(EngineError::Config(errors.join("; ")));
        }

        let current = self.handle.snapshot().await;
        let changes = diff_sections(&current, &next);
        if changes.is_empty() {
            return Ok(false);
        }

        let now = Utc::now();
        for change in &changes {
            let audit = ConfigAudit {
                timestamp: now,
                version: next.version.clone(),
                section_changed: change.section.clone(),
                old_value: change.old.clone(),
                new_value: change.new.clone(),
                changed_by: self.changed_by.clone(),
            };
            if let Err(e) = self.store.append_config_audit(&audit).await {
                // The new config still applies; the audit trail is
                // best-effort under store trouble.
                error!(error = %e, section = %change.section, "failed to append config audit row");
            }
        }

        info!(
            from = %current.version,
            to = %next.version,
            sections = ?changes.iter().map(|c| c.section.as_str()).collect::<Vec<_>>(),
            "configuration replaced"
        );
        self.handle.replace(next).await;
        Ok(true)
    }
}

async fn load_document(source: &ConfigSource, store: &SharedStore) -> Result<TradingConfig, EngineError> {
    match source {
        ConfigSource::File(path) => load_file(path),
        ConfigSource::Store => {
            let value = store
                .load_config_document()
                .await
                .map_err(EngineError::from)?
                .ok_or_else(|| EngineError::Config("trading_config table has no active row".to_string()))?;
            serde_json::from_value(value)
                .map_err(|e| EngineError::Config(format!("trading_config document malformed: {}", e)))
        }
    }
}

fn load_file(path: &Path) -> Result<TradingConfig, EngineError> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| EngineError::Config(format!("cannot read {}: {}", path.display(), e)))?;
    serde_json::from_str(&raw)
        .map_err(|e| EngineError::Config(format!("{} is not a valid config document: {}", path.display(), e)))
}

#[derive(Debug)]
pub struct SectionChange {
    pub section: String,
    pub old: serde_json::Value,
    pub new: serde_json::Value,
}

/// Top-level section diff between two documents, used for the audit trail.
pub fn diff_sections(old: &TradingConfig, new: &TradingConfig) -> Vec<SectionChange> {
    fn to_map<T: Serialize>(value: &T) -> serde_json::Map<String, serde_json::Value> {
        match serde_json::to_value(value) {
            Ok(serde_json::Value::Object(map)) => map,
            _ => serde_json::Map::new(),
        }
    }

    let old_map = to_map(old);
    let new_map = to_map(new);
    let mut changes = Vec::new();

    for (key, new_value) in &new_map {
        let old_value = old_map.get(key).cloned().unwrap_or(serde_json::Value::Null);
        if &old_value != new_value {
            changes.push(SectionChange {
                section: key.clone(),
                old: old_value,
                new: new_value.clone(),
            });
        }
    }
    changes
}
