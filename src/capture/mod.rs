//! Activation capture against the hosted decoder.
//!
//! One capture drives one bounded greedy generation while tapping a
//! configured subset of decoder layers. The tap surface is a capability
//! trait so the concrete runtime binding stays swappable; everything
//! downstream only ever sees host-memory f32 matrices.

pub mod qwen;

use std::collections::BTreeMap;

use anyhow::{anyhow, Result};
use nalgebra::DMatrix;
use tracing::debug;

use crate::config::CaptureKnobs;

/// One capture episode; owned by the caller, never persisted.
#[derive(Debug, Clone)]
pub struct ActivationTrace {
    /// Layer index -> (tokens x hidden) matrix, detached to host memory.
    pub activations: BTreeMap<usize, DMatrix<f32>>,
    pub tokens: Vec<u32>,
    pub text: String,
}

/// Options threaded into one tapped generation call.
#[derive(Debug, Clone)]
pub struct TapOptions {
    pub max_new_tokens: usize,
    pub max_input_tokens: usize,
    /// Trailing window of token positions kept per tapped layer.
    pub capture_tokens: usize,
    pub token_stride: usize,
}

impl TapOptions {
    fn from_knobs(knobs: &CaptureKnobs) -> Self {
        Self {
            max_new_tokens: knobs.max_new_tokens,
            max_input_tokens: knobs.max_input_tokens,
            capture_tokens: knobs.capture_tokens,
            token_stride: knobs.token_stride.max(1),
        }
    }
}

/// Output of one tapped generation.
pub struct TapRecording {
    pub activations: BTreeMap<usize, DMatrix<f32>>,
    pub tokens: Vec<u32>,
}

/// Capability interface over the model runtime. `generate_tapped` runs one
/// bounded greedy generation and records the requested layers' hidden
/// states restricted to the trailing capture window.
pub trait TappedDecoder: Send {
    fn layer_count(&self) -> usize;

    fn generate_tapped(
        &mut self,
        prompt: &str,
        taps: &[usize],
        opts: &TapOptions,
    ) -> Result<TapRecording>;
}

/// Negative indices count from the top of the stack; indices that fall
/// outside the model are dropped, duplicates keep their first position.
pub fn resolve_tapped_layers(requested: &[i64], layer_count: usize) -> Vec<usize> {
    let mut resolved = Vec::new();
    for &idx in requested {
        let absolute = if idx < 0 {
            layer_count as i64 + idx
        } else {
            idx
        };
        if (0..layer_count as i64).contains(&absolute) {
            let absolute = absolute as usize;
            if !resolved.contains(&absolute) {
                resolved.push(absolute);
            }
        }
    }
    resolved
}

enum BackendState {
    Unloaded,
    Ready(Box<dyn TappedDecoder>),
}

/// Owns the probe backend with an explicit Unloaded -> Ready transition;
/// the first capture pays the model load, later captures reuse it.
pub struct ActivationCapture {
    knobs: CaptureKnobs,
    state: BackendState,
}

impl ActivationCapture {
    pub fn new(knobs: CaptureKnobs) -> Self {
        Self {
            knobs,
            state: BackendState::Unloaded,
        }
    }

    /// Start from an already-constructed backend (tests, alternate runtimes).
    pub fn with_backend(knobs: CaptureKnobs, backend: Box<dyn TappedDecoder>) -> Self {
        Self {
            knobs,
            state: BackendState::Ready(backend),
        }
    }

    fn ensure_loaded(&mut self) -> Result<&mut dyn TappedDecoder> {
        if matches!(self.state, BackendState::Unloaded) {
            debug!(model = %self.knobs.model_repo, "loading capture backend");
            let backend = qwen::QwenBackend::load(&self.knobs)?;
            self.state = BackendState::Ready(Box::new(backend));
        }
        match &mut self.state {
            BackendState::Ready(backend) => Ok(backend.as_mut()),
            BackendState::Unloaded => Err(anyhow!("capture backend did not come up")),
        }
    }

    /// `Ok(None)` for an empty prompt or when no configured layer resolves;
    /// errors are the caller's cue to degrade the probe, never to abort.
    pub fn capture(&mut self, prompt: &str) -> Result<Option<ActivationTrace>> {
        if prompt.is_empty() {
            return Ok(None);
        }

        let opts = TapOptions::from_knobs(&self.knobs);
        let requested = self.knobs.capture_layers.clone();
        let backend = self.ensure_loaded()?;

        let taps = resolve_tapped_layers(&requested, backend.layer_count());
        if taps.is_empty() {
            debug!("no configured tap layer resolves against the model depth");
            return Ok(None);
        }

        let recording = backend.generate_tapped(prompt, &taps, &opts)?;
        Ok(Some(ActivationTrace {
            activations: recording.activations,
            tokens: recording.tokens,
            text: prompt.to_string(),
        }))
    }
}
