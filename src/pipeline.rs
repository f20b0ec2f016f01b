//! Per-query introspection pipeline: probe -> TDA -> fusion -> telemetry.
//!
//! Strictly sequential per query. The probe and the TDA pass degrade to
//! absent results on failure; telemetry failure is the one error worth
//! surfacing loudly, since silently dropped audit records are worse than a
//! stopped query. Pipelines may run concurrently while sharing one registry
//! (read-only) and, through the mutex, one capture backend.

use std::sync::{Arc, Mutex, PoisonError};

use anyhow::Result;
use tracing::{debug, warn};

use crate::capture::ActivationCapture;
use crate::concepts::ConceptRegistry;
use crate::config::MindchordConfig;
use crate::control::FocusController;
use crate::signals::{compute_signals, SignalBundle};
use crate::tda::{self, TdaResult};
use crate::telemetry::{build_event, records_from_bundle, TelemetryLogger};
use crate::trace::ReasoningTrace;

pub struct IntrospectionPipeline {
    config: MindchordConfig,
    registry: Arc<ConceptRegistry>,
    controller: FocusController,
    capture: Option<Mutex<ActivationCapture>>,
    telemetry: TelemetryLogger,
}

impl IntrospectionPipeline {
    pub fn new(config: MindchordConfig, registry: Arc<ConceptRegistry>) -> Result<Self> {
        config.validate()?;
        let telemetry = TelemetryLogger::new(
            &config.telemetry.jsonl_path,
            config.telemetry.flush_immediately,
        )?;
        let controller = FocusController::new(config.focus.clone());
        let capture = config
            .capture
            .enabled
            .then(|| Mutex::new(ActivationCapture::new(config.capture.clone())));
        if capture.is_none() {
            debug!("activation capture disabled; TDA signals stay neutral");
        }
        Ok(Self {
            config,
            registry,
            controller,
            capture,
            telemetry,
        })
    }

    /// Swap in a pre-built probe (alternate runtime bindings, tests).
    pub fn with_capture(mut self, capture: ActivationCapture) -> Self {
        self.capture = Some(Mutex::new(capture));
        self
    }

    pub fn registry(&self) -> &ConceptRegistry {
        &self.registry
    }

    pub fn controller(&self) -> &FocusController {
        &self.controller
    }

    /// Drive the activation probe and the TDA pass. Every failure path
    /// degrades to `None`; the query itself never aborts here.
    pub fn run_probe(&self, query: &str) -> Option<TdaResult> {
        let capture = self.capture.as_ref()?;
        let trace = {
            let mut guard = capture.lock().unwrap_or_else(PoisonError::into_inner);
            match guard.capture(query) {
                Ok(Some(trace)) => trace,
                Ok(None) => return None,
                Err(err) => {
                    warn!(error = %err, "activation probe failed");
                    return None;
                }
            }
        };
        if trace.activations.is_empty() {
            return None;
        }
        match tda::compute_tda(&trace.activations, &self.config.tda) {
            Ok(result) => result,
            Err(err) => {
                warn!(error = %err, "tda computation failed");
                None
            }
        }
    }

    /// Fuse signals for one stage boundary and append the audit record.
    pub fn observe(
        &self,
        query_id: &str,
        stage: &str,
        mode: &str,
        query: &str,
        reasoning_trace: Option<&ReasoningTrace>,
        tda_result: Option<&TdaResult>,
        notes: Option<&str>,
    ) -> Result<SignalBundle> {
        let bundle = compute_signals(
            query,
            reasoning_trace,
            tda_result,
            &self.registry,
            &self.controller,
            self.config.signals.health_floor,
        );
        let (metrics, tda_record, chord, focus) =
            records_from_bundle(&bundle, tda_result, self.controller.enabled());
        let event = build_event(
            query_id,
            stage,
            mode,
            metrics,
            tda_record,
            chord,
            focus,
            notes.map(str::to_string),
        );
        self.telemetry.emit(&event)?;
        Ok(bundle)
    }

    /// Probe plus observe in one call: the usual preflight before the
    /// external reasoning loop consumes the plan.
    pub fn analyze(&self, query_id: &str, query: &str, mode: &str) -> Result<SignalBundle> {
        let tda_result = self.run_probe(query);
        self.observe(
            query_id,
            "preflight",
            mode,
            query,
            None,
            tda_result.as_ref(),
            None,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::{TapOptions, TapRecording, TappedDecoder};
    use crate::concepts::demo_registry;
    use crate::telemetry::TelemetryEvent;
    use anyhow::bail;
    use nalgebra::DMatrix;
    use std::collections::BTreeMap;

    struct BlobDecoder;

    impl TappedDecoder for BlobDecoder {
        fn layer_count(&self) -> usize {
            6
        }

        fn generate_tapped(
            &mut self,
            _prompt: &str,
            taps: &[usize],
            opts: &TapOptions,
        ) -> anyhow::Result<TapRecording> {
            let mut activations = BTreeMap::new();
            for &layer in taps {
                let mut state = layer as u64 + 11;
                let matrix = DMatrix::from_fn(opts.capture_tokens, 8, |_, _| {
                    state = state
                        .wrapping_mul(6364136223846793005)
                        .wrapping_add(1442695040888963407);
                    ((state >> 33) as f32 / u32::MAX as f32) * 2.0 - 1.0
                });
                activations.insert(layer, matrix);
            }
            Ok(TapRecording {
                activations,
                tokens: vec![1, 2, 3],
            })
        }
    }

    struct BrokenDecoder;

    impl TappedDecoder for BrokenDecoder {
        fn layer_count(&self) -> usize {
            6
        }

        fn generate_tapped(
            &mut self,
            _prompt: &str,
            _taps: &[usize],
            _opts: &TapOptions,
        ) -> anyhow::Result<TapRecording> {
            bail!("backend fell over");
        }
    }

    fn test_config(dir: &tempfile::TempDir) -> MindchordConfig {
        let mut config = MindchordConfig::default();
        config.telemetry.jsonl_path = dir
            .path()
            .join("events.jsonl")
            .to_string_lossy()
            .into_owned();
        config.tda.max_points = 48;
        config.capture.capture_tokens = 12;
        config
    }

    fn read_events(config: &MindchordConfig) -> Vec<TelemetryEvent> {
        std::fs::read_to_string(&config.telemetry.jsonl_path)
            .unwrap()
            .lines()
            .map(|line| serde_json::from_str(line).unwrap())
            .collect()
    }

    #[test]
    fn test_observe_without_probe() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(&dir);
        let pipeline =
            IntrospectionPipeline::new(config.clone(), Arc::new(demo_registry())).unwrap();

        let bundle = pipeline.analyze("q-1", "execute it", "executive").unwrap();
        assert_eq!(bundle.entropy_score, 0.0);
        assert!(bundle.health_score >= config.signals.health_floor);

        let events = read_events(&config);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].stage, "preflight");
        assert!(events[0].tda.betti_0.is_none());
        assert!(events[0].focus.valve_enabled);
    }

    #[test]
    fn test_probe_feeds_tda_into_telemetry() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(&dir);
        let capture = ActivationCapture::with_backend(
            config.capture.clone(),
            Box::new(BlobDecoder),
        );
        let pipeline = IntrospectionPipeline::new(config.clone(), Arc::new(demo_registry()))
            .unwrap()
            .with_capture(capture);

        let tda_result = pipeline.run_probe("observe the plan").expect("probe result");
        assert!(tda_result.betti_0 > 0);

        pipeline
            .observe(
                "q-2",
                "preflight",
                "executive",
                "observe the plan",
                None,
                Some(&tda_result),
                Some("probe attached"),
            )
            .unwrap();

        let events = read_events(&config);
        assert_eq!(events[0].tda.betti_0, Some(tda_result.betti_0));
        assert_eq!(events[0].notes.as_deref(), Some("probe attached"));
    }

    #[test]
    fn test_broken_probe_degrades_gracefully() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(&dir);
        let capture = ActivationCapture::with_backend(
            config.capture.clone(),
            Box::new(BrokenDecoder),
        );
        let pipeline = IntrospectionPipeline::new(config.clone(), Arc::new(demo_registry()))
            .unwrap()
            .with_capture(capture);

        assert!(pipeline.run_probe("anything").is_none());
        // The query itself still completes with neutral TDA signals.
        let bundle = pipeline.analyze("q-3", "verify the truth", "fast").unwrap();
        assert_eq!(bundle.entropy_score, 0.0);
        assert_eq!(read_events(&config).len(), 1);
    }

    #[test]
    fn test_empty_query_still_audited() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(&dir);
        let pipeline =
            IntrospectionPipeline::new(config.clone(), Arc::new(demo_registry())).unwrap();

        let bundle = pipeline.analyze("q-4", "", "fast").unwrap();
        assert!(bundle.concepts.is_empty());
        assert_eq!(bundle.chord_product, 1);
        let events = read_events(&config);
        assert_eq!(events[0].chord.product, 1);
    }
}
