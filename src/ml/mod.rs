use std::collections::HashMap;
use std::path::{Path, PathBuf};

use ndarray::Array1;
use rust_decimal::prelude::FromPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::config::ExitParams;
use crate::features::FeatureSet;
use crate::types::StrategyKind;

/// Exit-parameter predictions attached to a verdict, persisted to
/// `scan_history.ml_predictions` and echoed onto trade rows for
/// predicted-vs-actual feedback.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MlPrediction {
    pub take_profit_pct: Decimal,
    pub stop_loss_pct: Decimal,
    pub hold_hours: f64,
    pub size_multiplier: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MlVerdict {
    pub confidence: f64,
    pub prediction: MlPrediction,
}

/// Logistic-regression weights trained offline, one artifact file per
/// strategy under the configured artifact directory.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelArtifact {
    pub strategy: String,
    pub coefficients: Vec<f64>,
    pub intercept: f64,
    pub feature_means: Vec<f64>,
    pub feature_stds: Vec<f64>,
    #[serde(default)]
    pub exit_model: ExitScalers,
}

/// Multipliers applied to the tier's configured exit parameters. Learned
/// offline alongside the classifier.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ExitScalers {
    pub take_profit_scale: f64,
    pub stop_loss_scale: f64,
    pub hold_scale: f64,
}

impl Default for ExitScalers {
    fn default() -> Self {
        Self {
            take_profit_scale: 1.0,
            stop_loss_scale: 1.0,
            hold_scale: 1.0,
        }
    }
}

struct TradeModel {
    coefficients: Array1<f64>,
    intercept: f64,
    means: Array1<f64>,
    stds: Array1<f64>,
    exit_model: ExitScalers,
}

impl TradeModel {
    fn from_artifact(artifact: ModelArtifact) -> Result<Self, String> {
        let n = FeatureSet::VECTOR_LEN;
        if artifact.coefficients.len() != n
            || artifact.feature_means.len() != n
            || artifact.feature_stds.len() != n
        {
            return Err(format!(
                "artifact for {} has {} coefficients, expected {}",
                artifact.strategy,
                artifact.coefficients.len(),
                n
            ));
        }
        Ok(Self {
            coefficients: Array1::from_vec(artifact.coefficients),
            intercept: artifact.intercept,
            means: Array1::from_vec(artifact.feature_means),
            stds: Array1::from_vec(artifact.feature_stds),
            exit_model: artifact.exit_model,
        })
    }

    fn confidence(&self, features: &FeatureSet) -> f64 {
        let x = Array1::from_vec(features.to_vec());
        let mut normalized = &x - &self.means;
        for (value, std) in normalized.iter_mut().zip(self.stds.iter()) {
            if *std > 1e-10 {
                *value /= std;
            } else {
                *value = 0.0;
            }
        }
        let z = self.intercept + self.coefficients.dot(&normalized);
        sigmoid(z)
    }
}

fn sigmoid(z: f64) -> f64 {
    1.0 / (1.0 + (-z).exp())
}

/// Confidence filter over detected setups. Entirely optional: with no
/// artifact loaded for a strategy the filter passes everything through at
/// confidence 1.0 with the tier's configured exits.
pub struct MlFilter {
    models: HashMap<StrategyKind, TradeModel>,
    enabled: bool,
}

impl MlFilter {
    pub fn disabled() -> Self {
        Self {
            models: HashMap::new(),
            enabled: false,
        }
    }

    /// Load whatever artifacts exist under `dir`. Missing files are normal
    /// (that strategy runs unfiltered); malformed files are skipped loudly.
    pub fn load(dir: &Path, enabled: bool) -> Self {
        let mut models = HashMap::new();
        if enabled {
            for kind in StrategyKind::all() {
                let path = artifact_path(dir, kind);
                match std::fs::read_to_string(&path) {
                    Ok(raw) => match serde_json::from_str::<ModelArtifact>(&raw)
                        .map_err(|e| e.to_string())
                        .and_then(TradeModel::from_artifact)
                    {
                        Ok(model) => {
                            info!(strategy = %kind, path = %path.display(), "ML artifact loaded");
                            models.insert(kind, model);
                        }
                        Err(e) => {
                            warn!(strategy = %kind, path = %path.display(), error = %e, "ignoring malformed ML artifact");
                        }
                    },
                    Err(_) => {
                        info!(strategy = %kind, path = %path.display(), "no ML artifact; strategy runs unfiltered");
                    }
                }
            }
        }
        Self { models, enabled }
    }

    /// Whether a real model gates this strategy. Controls the SimpleRules
    /// fallback: loose rules only run when no model is active.
    pub fn is_active(&self, kind: StrategyKind) -> bool {
        self.enabled && self.models.contains_key(&kind)
    }

    pub fn score(&self, kind: StrategyKind, features: &FeatureSet, tier_exits: &ExitParams) -> MlVerdict {
        match self.models.get(&kind).filter(|_| self.enabled) {
            Some(model) => {
                let confidence = model.confidence(features);
                let scale = |base: Decimal, factor: f64| {
                    Decimal::from_f64(factor)
                        .map(|f| base * f)
                        .unwrap_or(base)
                };
                MlVerdict {
                    confidence,
                    prediction: MlPrediction {
                        take_profit_pct: scale(tier_exits.take_profit, model.exit_model.take_profit_scale),
                        stop_loss_pct: scale(tier_exits.stop_loss, model.exit_model.stop_loss_scale),
                        hold_hours: tier_exits.hold_hours as f64 * model.exit_model.hold_scale,
                        size_multiplier: (0.5 + confidence).clamp(0.5, 1.5),
                    },
                }
            }
            None => MlVerdict {
                confidence: 1.0,
                prediction: MlPrediction {
                    take_profit_pct: tier_exits.take_profit,
                    stop_loss_pct: tier_exits.stop_loss,
                    hold_hours: tier_exits.hold_hours as f64,
                    size_multiplier: 1.0,
                },
            },
        }
    }
}

fn artifact_path(dir: &Path, kind: StrategyKind) -> PathBuf {
    dir.join(format!("{}.json", kind.as_str()))
}
