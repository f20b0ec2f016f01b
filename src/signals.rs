//! Signal fusion for chords, entropy, and health.
//!
//! One call folds concept detection, dissonance scoring, TDA entropy, and
//! harmony-key drift into a bounded bundle, then asks the valve for a plan.

use std::collections::BTreeSet;

use serde::Serialize;

use crate::concepts::ConceptRegistry;
use crate::constants::signals as knobs;
use crate::control::{FocusController, FocusMetrics, FocusPlan};
use crate::tda::TdaResult;
use crate::trace::ReasoningTrace;

/// Fused state for one pipeline stage; immutable once assembled.
#[derive(Debug, Clone, Serialize)]
pub struct SignalBundle {
    pub concepts: Vec<String>,
    pub chord_product: u64,
    pub chord_frequencies: Vec<f32>,
    pub dissonance_score: f32,
    pub dissonance_events: Vec<String>,
    pub entropy_score: f32,
    pub health_score: f32,
    pub harmony_key_distance: f32,
    pub focus_plan: FocusPlan,
}

fn normalize_entropy(entropy: f32) -> f32 {
    if entropy <= 0.0 {
        return 0.0;
    }
    (entropy / knobs::ENTROPY_REFERENCE_SCALE).min(1.0)
}

fn compute_health(dissonance: f32, entropy: f32, floor: f32) -> f32 {
    let raw = 1.0
        - (knobs::HEALTH_ENTROPY_WEIGHT * entropy
            + knobs::HEALTH_DISSONANCE_WEIGHT * dissonance);
    raw.clamp(floor, 1.0)
}

pub fn compute_signals(
    query: &str,
    reasoning_trace: Option<&ReasoningTrace>,
    tda_result: Option<&TdaResult>,
    registry: &ConceptRegistry,
    controller: &FocusController,
    health_floor: f32,
) -> SignalBundle {
    let mut detected: BTreeSet<String> = registry.detect_concepts(query).into_iter().collect();
    if let Some(trace) = reasoning_trace {
        detected.extend(registry.detect_concepts_from_trace(trace));
    }
    let concepts: Vec<String> = detected.into_iter().collect();

    let chord_product = registry.chord_product(&concepts);
    let chord_frequencies = registry.chord_frequencies(&concepts);
    let (mut dissonance_score, dissonance_events) = registry.evaluate_dissonance(&concepts);

    let entropy_score = tda_result
        .map(|r| normalize_entropy(r.persistence_entropy))
        .unwrap_or(0.0);

    let harmony_key_distance = registry.harmony_key_distance(&chord_frequencies);
    dissonance_score =
        (dissonance_score + harmony_key_distance * knobs::HARMONY_BLEND_WEIGHT).min(1.0);

    let health_score = compute_health(dissonance_score, entropy_score, health_floor);

    let focus_plan = controller.plan(&FocusMetrics {
        entropy_score,
        dissonance_score,
        health_score,
    });

    SignalBundle {
        concepts,
        chord_product,
        chord_frequencies,
        dissonance_score,
        dissonance_events: dissonance_events.into_iter().map(|e| e.detail).collect(),
        entropy_score,
        health_score,
        harmony_key_distance,
        focus_plan,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::concepts::demo_registry;
    use crate::config::FocusKnobs;
    use crate::tda::TopologyGraph;
    use crate::trace::{MetaFindings, StageRecord};

    fn controller() -> FocusController {
        FocusController::new(FocusKnobs::default())
    }

    fn tda_with_entropy(persistence_entropy: f32) -> TdaResult {
        TdaResult {
            betti_0: 5,
            betti_1: 1,
            persistence_entropy,
            max_persistence: 0.8,
            point_cloud: vec![],
            topology_graph: TopologyGraph::default(),
        }
    }

    #[test]
    fn test_empty_query_is_neutral() {
        let registry = demo_registry();
        let bundle = compute_signals("", None, None, &registry, &controller(), 0.2);
        assert!(bundle.concepts.is_empty());
        assert_eq!(bundle.chord_product, 1);
        assert_eq!(bundle.dissonance_score, 0.0);
        assert_eq!(bundle.entropy_score, 0.0);
        assert_eq!(bundle.health_score, 1.0);
        assert_eq!(bundle.harmony_key_distance, 0.0);
    }

    #[test]
    fn test_entropy_normalized_and_clamped() {
        let registry = demo_registry();
        let mild = compute_signals(
            "",
            None,
            Some(&tda_with_entropy(1.5)),
            &registry,
            &controller(),
            0.2,
        );
        assert!((mild.entropy_score - 0.5).abs() < 1e-6);

        let wild = compute_signals(
            "",
            None,
            Some(&tda_with_entropy(9.0)),
            &registry,
            &controller(),
            0.2,
        );
        assert_eq!(wild.entropy_score, 1.0);
    }

    #[test]
    fn test_health_respects_floor_and_ceiling() {
        let registry = demo_registry();
        let floor = 0.2;
        let stressed = compute_signals(
            "execute the deception and verify the truth",
            None,
            Some(&tda_with_entropy(9.0)),
            &registry,
            &controller(),
            floor,
        );
        assert!(stressed.health_score >= floor);
        assert!(stressed.health_score <= 1.0);
        assert!(stressed.dissonance_score <= 1.0);
    }

    #[test]
    fn test_harmony_distance_blended_into_dissonance() {
        let registry = demo_registry();
        // Deception alone violates no rule, but its frequency is far off
        // key, so dissonance comes entirely from the harmony blend.
        let bundle = compute_signals("mislead them", None, None, &registry, &controller(), 0.2);
        assert_eq!(bundle.concepts, vec!["Deception".to_string()]);
        assert_eq!(bundle.harmony_key_distance, 1.0);
        assert!((bundle.dissonance_score - 0.5).abs() < 1e-6);
    }

    #[test]
    fn test_trace_concepts_union_with_query() {
        let registry = demo_registry();
        let mut trace = ReasoningTrace::default();
        trace.push(StageRecord::Meta(MetaFindings {
            summary: "the plan needs authorization".to_string(),
            blind_spots: vec![],
            notes: String::new(),
        }));
        let bundle =
            compute_signals("execute now", Some(&trace), None, &registry, &controller(), 0.2);
        assert_eq!(
            bundle.concepts,
            vec![
                "Authorization".to_string(),
                "Execute".to_string(),
                "Plan".to_string()
            ]
        );
        // 2 * 3 * 11
        assert_eq!(bundle.chord_product, 66);
    }

    #[test]
    fn test_focus_plan_reflects_signals() {
        let registry = demo_registry();
        let calm = compute_signals("", None, None, &registry, &controller(), 0.2);
        let stressed = compute_signals(
            "execute the deception and verify the truth",
            None,
            Some(&tda_with_entropy(9.0)),
            &registry,
            &controller(),
            0.2,
        );
        assert!(stressed.focus_plan.depth >= calm.focus_plan.depth);
    }

    #[test]
    fn test_bundle_dissonance_events_surface_details() {
        let registry = demo_registry();
        let bundle = compute_signals("execute it", None, None, &registry, &controller(), 0.2);
        assert!(bundle
            .dissonance_events
            .iter()
            .any(|e| e.contains("missing")));
    }
}
