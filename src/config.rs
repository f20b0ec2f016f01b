use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

use crate::constants;

/// Engine configuration. Every knob has a named default; a missing file
/// loads as `Default`, a present file is validated once and then passed by
/// reference for the life of the process.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MindchordConfig {
    pub capture: CaptureKnobs,
    pub tda: TdaKnobs,
    pub signals: SignalKnobs,
    pub focus: FocusKnobs,
    pub telemetry: TelemetryKnobs,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureKnobs {
    /// When false the probe is skipped entirely and TDA signals stay neutral.
    pub enabled: bool,
    pub model_repo: String,
    pub revision: String,
    pub max_new_tokens: usize,
    pub max_input_tokens: usize,
    /// Layer indices to tap; negative indices count from the top of the stack.
    pub capture_layers: Vec<i64>,
    /// Trailing window of token positions retained per tapped layer.
    pub capture_tokens: usize,
    pub token_stride: usize,
    pub seed: u64,
}

impl Default for CaptureKnobs {
    fn default() -> Self {
        Self {
            enabled: false,
            model_repo: "Qwen/Qwen2.5-0.5B-Instruct".to_string(),
            revision: "main".to_string(),
            max_new_tokens: constants::capture::DEFAULT_MAX_NEW_TOKENS,
            max_input_tokens: constants::capture::DEFAULT_MAX_INPUT_TOKENS,
            capture_layers: constants::capture::DEFAULT_TAP_LAYERS.to_vec(),
            capture_tokens: constants::capture::DEFAULT_CAPTURE_TOKENS,
            token_stride: 1,
            seed: 42,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TdaKnobs {
    /// Point-cloud cap ahead of the Rips filtration.
    pub max_points: usize,
    /// Cluster count for the coarse topology graph.
    pub graph_clusters: usize,
    /// Seed for subsampling, projection, and clustering.
    pub seed: u64,
}

impl Default for TdaKnobs {
    fn default() -> Self {
        Self {
            max_points: constants::tda::DEFAULT_MAX_POINTS,
            graph_clusters: constants::tda::DEFAULT_GRAPH_CLUSTERS,
            seed: 42,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SignalKnobs {
    /// Lower bound on the health score.
    pub health_floor: f32,
}

impl Default for SignalKnobs {
    fn default() -> Self {
        Self {
            health_floor: constants::signals::DEFAULT_HEALTH_FLOOR,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FocusKnobs {
    pub enabled: bool,
    pub min_depth: u32,
    pub max_depth: u32,
    pub base_depth: u32,
    pub entropy_weight: f32,
    pub dissonance_weight: f32,
    pub throttle_temperature_min: f32,
    pub throttle_temperature_max: f32,
    pub max_tokens_scale_min: f32,
    pub max_tokens_scale_max: f32,
}

impl Default for FocusKnobs {
    fn default() -> Self {
        Self {
            enabled: true,
            min_depth: 2,
            max_depth: 10,
            base_depth: 3,
            entropy_weight: 0.6,
            dissonance_weight: 0.4,
            throttle_temperature_min: 0.1,
            throttle_temperature_max: 0.6,
            max_tokens_scale_min: 1.0,
            max_tokens_scale_max: 1.8,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetryKnobs {
    pub jsonl_path: String,
    pub flush_immediately: bool,
}

impl Default for TelemetryKnobs {
    fn default() -> Self {
        Self {
            jsonl_path: constants::filenames::DEFAULT_TELEMETRY_FILE.to_string(),
            flush_immediately: true,
        }
    }
}

impl MindchordConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        if !path.as_ref().exists() {
            return Ok(Self::default());
        }
        let content = fs::read_to_string(path)?;
        let config: Self = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.focus.min_depth > self.focus.base_depth
            || self.focus.base_depth > self.focus.max_depth
        {
            bail!(
                "focus depths must satisfy min <= base <= max (got {}/{}/{})",
                self.focus.min_depth,
                self.focus.base_depth,
                self.focus.max_depth
            );
        }
        if self.focus.entropy_weight < 0.0 || self.focus.dissonance_weight < 0.0 {
            bail!("focus weights must be non-negative");
        }
        if !(0.0..=1.0).contains(&self.signals.health_floor) {
            bail!("health floor must lie in [0, 1]");
        }
        if self.tda.max_points == 0 {
            bail!("tda.max_points must be positive");
        }
        if self.capture.token_stride == 0 {
            bail!("capture.token_stride must be positive");
        }
        Ok(())
    }
}
