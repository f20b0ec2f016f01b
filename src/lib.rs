//! mindchord: activation-topology introspection and the focus/entropy valve.
//!
//! The crate watches the internal geometric structure of a hosted decoder's
//! activations during a reasoning episode, condenses that structure into
//! scalar health signals (persistence entropy, concept dissonance, harmony
//! drift), and closes the loop: a continued-fraction valve converts the
//! fused signals into a reasoning-depth budget and decoding-parameter
//! scales for the external reasoning loop. Every stage boundary is audited
//! to an append-only JSONL telemetry log.

pub mod capture;
pub mod concepts;
pub mod config;
pub mod constants;
pub mod control;
pub mod pipeline;
pub mod signals;
pub mod tda;
pub mod telemetry;
pub mod trace;
pub mod utils;

pub use capture::{ActivationCapture, ActivationTrace, TappedDecoder};
pub use concepts::{Concept, ConceptRegistry, DissonanceEvent, MetaProbeReport, OntologyDoc};
pub use config::MindchordConfig;
pub use control::{FocusController, FocusMetrics, FocusPlan};
pub use pipeline::IntrospectionPipeline;
pub use signals::{compute_signals, SignalBundle};
pub use tda::{compute_tda, TdaResult, TopologyGraph};
pub use telemetry::{build_event, TelemetryEvent, TelemetryLogger};
pub use trace::{ReasoningTrace, StageRecord};
