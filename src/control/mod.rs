//! Continued-fraction focus controller and entropy valve.
//!
//! The valve maps fused health signals to a reasoning-depth budget and to
//! multiplicative scale factors for the collaborator's sampling temperature
//! and token budget. `plan` is pure: identical inputs always yield an
//! identical plan.

use serde::{Deserialize, Serialize};

use crate::config::FocusKnobs;
use crate::utils::numeric::lerp;

/// Signals the controller plans against, produced by signal fusion.
#[derive(Debug, Clone, Copy, Default)]
pub struct FocusMetrics {
    pub entropy_score: f32,
    pub dissonance_score: f32,
    pub health_score: f32,
}

/// Controller output. `depth` is the inclusive upper bound on refinement
/// passes; the scales multiply the collaborator's own base configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FocusPlan {
    pub depth: u32,
    pub temperature_scale: f32,
    pub max_tokens_scale: f32,
    pub reason: String,
}

#[derive(Debug, Clone)]
pub struct FocusController {
    knobs: FocusKnobs,
}

impl FocusController {
    pub fn new(knobs: FocusKnobs) -> Self {
        Self { knobs }
    }

    pub fn enabled(&self) -> bool {
        self.knobs.enabled
    }

    pub fn plan(&self, metrics: &FocusMetrics) -> FocusPlan {
        let k = &self.knobs;
        if !k.enabled {
            return FocusPlan {
                depth: k.base_depth,
                temperature_scale: 1.0,
                max_tokens_scale: 1.0,
                reason: "entropy_valve_disabled".to_string(),
            };
        }

        let entropy = metrics.entropy_score;
        let dissonance = metrics.dissonance_score;

        let difficulty = k.entropy_weight * entropy + k.dissonance_weight * dissonance;
        let span = (k.max_depth - k.min_depth) as f32;
        let depth = (k.min_depth as f32 + difficulty * span) as u32;
        let depth = depth.clamp(k.min_depth, k.max_depth);

        // Continued fraction scaling (adds a gentle nonlinear bias).
        let cf_value = continued_fraction(depth);
        let cf_scaled = (cf_value / (depth + 1) as f64).min(1.0) as f32;

        let temperature_scale = lerp(
            k.throttle_temperature_max,
            k.throttle_temperature_min,
            cf_scaled,
        );
        let max_tokens_scale = lerp(k.max_tokens_scale_min, k.max_tokens_scale_max, cf_scaled);

        FocusPlan {
            depth,
            temperature_scale,
            max_tokens_scale,
            reason: format!(
                "entropy={entropy:.2}, dissonance={dissonance:.2}, depth={depth}"
            ),
        }
    }
}

/// Finite continued fraction x = 1 + 1/(1 + 1/(2 + ...)), evaluated from
/// the innermost term outward, `depth` terms deep.
fn continued_fraction(depth: u32) -> f64 {
    let mut x = 1.0f64;
    for n in (1..=depth).rev() {
        x = 1.0 + 1.0 / (n as f64 + x);
    }
    x
}
