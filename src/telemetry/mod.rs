//! Append-only JSONL telemetry for live and replay dashboards.
//!
//! One event per line, written in a single append so a crash right after
//! `emit` never leaves a torn record. Write failures propagate: silently
//! dropped telemetry breaks auditability downstream.

use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use anyhow::{Context, Result};
use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

use crate::control::FocusPlan;
use crate::signals::SignalBundle;
use crate::tda::{TdaResult, TopologyGraph};

/// The four required scalars plus free-form extras (learned-skill lists,
/// ablation markers, and similar stage-specific annotations).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MetricsRecord {
    pub entropy_score: f32,
    pub dissonance_score: f32,
    pub health_score: f32,
    pub harmony_key_distance: f32,
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

/// Serializes to `{}` when the probe was unavailable.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TdaRecord {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub betti_0: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub betti_1: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub persistence_entropy: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_persistence: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub point_cloud: Option<Vec<[f32; 3]>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub topology_graph: Option<TopologyGraph>,
}

impl TdaRecord {
    pub fn from_result(result: Option<&TdaResult>) -> Self {
        match result {
            None => Self::default(),
            Some(r) => Self {
                betti_0: Some(r.betti_0),
                betti_1: Some(r.betti_1),
                persistence_entropy: Some(r.persistence_entropy),
                max_persistence: Some(r.max_persistence),
                point_cloud: Some(r.point_cloud.clone()),
                topology_graph: Some(r.topology_graph.clone()),
            },
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChordRecord {
    pub product: u64,
    pub frequencies: Vec<f32>,
    pub concepts: Vec<String>,
    pub dissonance_events: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FocusRecord {
    pub depth: u32,
    pub temperature_scale: f32,
    pub max_tokens_scale: f32,
    pub reason: String,
    pub valve_enabled: bool,
}

impl FocusRecord {
    pub fn from_plan(plan: &FocusPlan, valve_enabled: bool) -> Self {
        Self {
            depth: plan.depth,
            temperature_scale: plan.temperature_scale,
            max_tokens_scale: plan.max_tokens_scale,
            reason: plan.reason.clone(),
            valve_enabled,
        }
    }
}

/// One audit record; write-once, append-ordered.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelemetryEvent {
    pub timestamp: String,
    pub query_id: String,
    pub stage: String,
    pub mode: String,
    pub metrics: MetricsRecord,
    pub tda: TdaRecord,
    pub chord: ChordRecord,
    pub focus: FocusRecord,
    pub notes: Option<String>,
}

/// Stamp an event with the current UTC time.
pub fn build_event(
    query_id: &str,
    stage: &str,
    mode: &str,
    metrics: MetricsRecord,
    tda: TdaRecord,
    chord: ChordRecord,
    focus: FocusRecord,
    notes: Option<String>,
) -> TelemetryEvent {
    TelemetryEvent {
        timestamp: Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true),
        query_id: query_id.to_string(),
        stage: stage.to_string(),
        mode: mode.to_string(),
        metrics,
        tda,
        chord,
        focus,
        notes,
    }
}

/// Assemble the sub-records of an event from a fused bundle.
pub fn records_from_bundle(
    bundle: &SignalBundle,
    tda_result: Option<&TdaResult>,
    valve_enabled: bool,
) -> (MetricsRecord, TdaRecord, ChordRecord, FocusRecord) {
    let metrics = MetricsRecord {
        entropy_score: bundle.entropy_score,
        dissonance_score: bundle.dissonance_score,
        health_score: bundle.health_score,
        harmony_key_distance: bundle.harmony_key_distance,
        extra: BTreeMap::new(),
    };
    let chord = ChordRecord {
        product: bundle.chord_product,
        frequencies: bundle.chord_frequencies.clone(),
        concepts: bundle.concepts.clone(),
        dissonance_events: bundle.dissonance_events.clone(),
    };
    let focus = FocusRecord::from_plan(&bundle.focus_plan, valve_enabled);
    (metrics, TdaRecord::from_result(tda_result), chord, focus)
}

pub struct TelemetryLogger {
    path: PathBuf,
    file: Mutex<File>,
    flush_immediately: bool,
}

impl TelemetryLogger {
    pub fn new(path: impl AsRef<Path>, flush_immediately: bool) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)
                    .with_context(|| format!("creating telemetry dir {}", parent.display()))?;
            }
        }
        let file = OpenOptions::new()
            .append(true)
            .create(true)
            .open(&path)
            .with_context(|| format!("opening telemetry log {}", path.display()))?;
        Ok(Self {
            path,
            file: Mutex::new(file),
            flush_immediately,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one event as a single line. The whole record goes out in one
    /// write on an O_APPEND handle, so concurrent emitters never interleave
    /// partial lines.
    pub fn emit(&self, event: &TelemetryEvent) -> Result<()> {
        let mut line = serde_json::to_string(event).context("serializing telemetry event")?;
        line.push('\n');

        let mut file = self
            .file
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        file.write_all(line.as_bytes())
            .with_context(|| format!("appending to {}", self.path.display()))?;
        if self.flush_immediately {
            file.sync_data()
                .with_context(|| format!("syncing {}", self.path.display()))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_event() -> TelemetryEvent {
        let metrics = MetricsRecord {
            entropy_score: 0.31,
            dissonance_score: 0.12,
            health_score: 0.8,
            harmony_key_distance: 0.05,
            extra: BTreeMap::new(),
        };
        let chord = ChordRecord {
            product: 6,
            frequencies: vec![261.63, 293.66],
            concepts: vec!["Authorization".to_string(), "Execute".to_string()],
            dissonance_events: vec![],
        };
        let focus = FocusRecord {
            depth: 4,
            temperature_scale: 0.45,
            max_tokens_scale: 1.3,
            reason: "entropy=0.31, dissonance=0.12, depth=4".to_string(),
            valve_enabled: true,
        };
        build_event(
            "q-123",
            "final",
            "executive",
            metrics,
            TdaRecord::default(),
            chord,
            focus,
            None,
        )
    }

    #[test]
    fn test_roundtrip_preserves_scalars() {
        let event = sample_event();
        let json = serde_json::to_string(&event).unwrap();
        let back: TelemetryEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(back.metrics.health_score, event.metrics.health_score);
        assert_eq!(back.metrics.entropy_score, event.metrics.entropy_score);
        assert_eq!(back.chord.product, event.chord.product);
        assert_eq!(back.focus.depth, event.focus.depth);
        assert_eq!(back.query_id, "q-123");
    }

    #[test]
    fn test_unavailable_tda_serializes_as_empty_map() {
        let json = serde_json::to_string(&sample_event()).unwrap();
        assert!(json.contains("\"tda\":{}"));
        assert!(json.contains("\"health_score\""));
    }

    #[test]
    fn test_metrics_accept_extra_keys() {
        let mut metrics = MetricsRecord::default();
        metrics.extra.insert(
            "learned_skills".to_string(),
            serde_json::json!(["regression"]),
        );
        let json = serde_json::to_string(&metrics).unwrap();
        assert!(json.contains("learned_skills"));
        let back: MetricsRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(back.extra["learned_skills"], serde_json::json!(["regression"]));
    }

    #[test]
    fn test_emit_appends_whole_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("events.jsonl");
        let logger = TelemetryLogger::new(&path, true).unwrap();

        logger.emit(&sample_event()).unwrap();
        logger.emit(&sample_event()).unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 2);
        for line in lines {
            let event: TelemetryEvent = serde_json::from_str(line).unwrap();
            assert_eq!(event.stage, "final");
        }
    }

    #[test]
    fn test_logger_creates_parent_dirs() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/deeper/events.jsonl");
        let logger = TelemetryLogger::new(&path, false).unwrap();
        logger.emit(&sample_event()).unwrap();
        assert!(path.exists());
    }
}
