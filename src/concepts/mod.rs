//! Concept registry and chord computation.
//!
//! Concepts are the named anchors of the ontology; each carries a unique
//! prime so a set of concepts compresses into a single integer fingerprint
//! (the chord product), and a characteristic frequency so the set can be
//! scored against the configured harmony key. Dissonance is rule-driven:
//! required companions, forbidden pairs, and harmony sets.

pub mod ontology;

use std::collections::{BTreeSet, HashSet};
use std::path::Path;

use anyhow::Result;
use serde::Serialize;

use crate::trace::ReasoningTrace;
use crate::utils::numeric::robust_sum;

pub use ontology::{ConceptSpec, HarmonyKey, OntologyDoc, RuleSet};

#[derive(Debug, Clone)]
pub struct Concept {
    pub name: String,
    pub prime: u64,
    pub frequency_hz: f32,
    pub keywords: Vec<String>,
    pub depth: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleKind {
    Requires,
    Forbids,
}

/// One rule violation surfaced by `evaluate_dissonance`.
#[derive(Debug, Clone, Serialize)]
pub struct DissonanceEvent {
    pub rule: RuleKind,
    pub detail: String,
}

/// Registry-only introspection of a query, no model calls involved.
#[derive(Debug, Clone, Serialize)]
pub struct MetaProbeReport {
    pub concepts: Vec<String>,
    pub concept_count: usize,
    pub avg_concept_depth: f32,
    pub dissonance_score: f32,
    pub dissonance_events: Vec<String>,
    pub harmony_key_distance: f32,
    pub blind_spots: Vec<String>,
}

/// Read-only after construction; safe to share across pipelines.
pub struct ConceptRegistry {
    concepts: Vec<Concept>,
    rules: RuleSet,
    harmony_key: HarmonyKey,
    /// Lowercased keyword -> concept name, for detection.
    keyword_map: Vec<(String, String)>,
}

impl ConceptRegistry {
    /// Fatal when the document is absent or malformed; the system cannot
    /// run without its ontology.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        Ok(Self::from_document(OntologyDoc::load(path)?))
    }

    pub fn from_document(doc: OntologyDoc) -> Self {
        let concepts: Vec<Concept> = doc
            .concepts
            .into_iter()
            .map(|(name, spec)| Concept {
                name,
                prime: spec.prime,
                frequency_hz: spec.frequency_hz,
                keywords: spec.keywords,
                depth: spec.depth,
            })
            .collect();

        let mut keyword_map = Vec::new();
        for concept in &concepts {
            for kw in &concept.keywords {
                keyword_map.push((kw.to_lowercase(), concept.name.clone()));
            }
        }

        Self {
            concepts,
            rules: doc.rules,
            harmony_key: doc.harmony_key,
            keyword_map,
        }
    }

    fn get(&self, name: &str) -> Option<&Concept> {
        self.concepts.iter().find(|c| c.name == name)
    }

    /// Whole-word, case-insensitive keyword match; returns a sorted,
    /// deduplicated list. Empty text detects nothing.
    pub fn detect_concepts(&self, text: &str) -> Vec<String> {
        if text.is_empty() {
            return Vec::new();
        }
        let text_lower = text.to_lowercase();
        let mut detected = BTreeSet::new();
        for (kw, concept_name) in &self.keyword_map {
            if contains_word(&text_lower, kw) {
                detected.insert(concept_name.clone());
            }
        }
        detected.into_iter().collect()
    }

    /// Detection over the flattened string fields of a reasoning trace.
    pub fn detect_concepts_from_trace(&self, trace: &ReasoningTrace) -> Vec<String> {
        if trace.is_empty() {
            return Vec::new();
        }
        let mut flat = String::new();
        trace.visit_text(|part| {
            if !flat.is_empty() {
                flat.push(' ');
            }
            flat.push_str(part);
        });
        self.detect_concepts(&flat)
    }

    /// Product of the distinct primes of the named concepts; unknown names
    /// are ignored, the empty chord is 1.
    pub fn chord_product(&self, concepts: &[String]) -> u64 {
        let mut product: u64 = 1;
        for name in concepts {
            if let Some(concept) = self.get(name) {
                product *= concept.prime;
            }
        }
        product
    }

    /// Frequencies in input order, unknown names skipped.
    pub fn chord_frequencies(&self, concepts: &[String]) -> Vec<f32> {
        concepts
            .iter()
            .filter_map(|name| self.get(name).map(|c| c.frequency_hz))
            .collect()
    }

    /// Depths in input order, unknown names skipped.
    pub fn concept_depths(&self, concepts: &[String]) -> Vec<u32> {
        concepts
            .iter()
            .filter_map(|name| self.get(name).map(|c| c.depth))
            .collect()
    }

    /// Scores rule violations over the concept set. The score lives in
    /// [0, 1] and is exactly 0 for an empty set.
    pub fn evaluate_dissonance(&self, concepts: &[String]) -> (f32, Vec<DissonanceEvent>) {
        let concept_set: HashSet<&str> = concepts.iter().map(String::as_str).collect();
        let mut events = Vec::new();

        for (concept, required_list) in &self.rules.requires {
            if concept_set.contains(concept.as_str()) {
                let missing: Vec<&str> = required_list
                    .iter()
                    .map(String::as_str)
                    .filter(|req| !concept_set.contains(req))
                    .collect();
                if !missing.is_empty() {
                    events.push(DissonanceEvent {
                        rule: RuleKind::Requires,
                        detail: format!("{} missing {}", concept, missing.join(", ")),
                    });
                }
            }
        }

        for [a, b] in &self.rules.forbids {
            if concept_set.contains(a.as_str()) && concept_set.contains(b.as_str()) {
                events.push(DissonanceEvent {
                    rule: RuleKind::Forbids,
                    detail: format!("{a} conflicts with {b}"),
                });
            }
        }

        let harmony_hits = self
            .rules
            .harmony_sets
            .iter()
            .filter(|set| set.iter().all(|name| concept_set.contains(name.as_str())))
            .count();

        let score = if concepts.is_empty() {
            0.0
        } else {
            let base = (events.len() as f32 / concepts.len().max(1) as f32).min(1.0);
            let harmony_bonus = (harmony_hits as f32 * 0.1).min(0.3);
            (base - harmony_bonus).max(0.0)
        };

        (score, events)
    }

    /// Mean absolute distance from the harmony key's base frequency, scaled
    /// by tolerance and clamped at 1. Empty input is perfectly in key.
    pub fn harmony_key_distance(&self, frequencies: &[f32]) -> f32 {
        if frequencies.is_empty() {
            return 0.0;
        }
        let base = self.harmony_key.base_frequency_hz;
        let tolerance = self.harmony_key.tolerance_hz.max(1e-6);
        let avg = robust_sum(frequencies.iter().map(|f| (f - base).abs()))
            / frequencies.len() as f32;
        (avg / tolerance).min(1.0)
    }

    /// Registry-only meta probe: concept structure, dissonance, and
    /// heuristic blind spots for a query.
    pub fn meta_probe(&self, query: &str) -> MetaProbeReport {
        let concepts = self.detect_concepts(query);
        let depths = self.concept_depths(&concepts);
        let avg_depth = if depths.is_empty() {
            0.0
        } else {
            robust_sum(depths.iter().map(|&d| d as f32)) / depths.len() as f32
        };
        let (dissonance_score, events) = self.evaluate_dissonance(&concepts);
        let frequencies = self.chord_frequencies(&concepts);
        MetaProbeReport {
            concept_count: concepts.len(),
            avg_concept_depth: avg_depth,
            dissonance_score,
            dissonance_events: events.into_iter().map(|e| e.detail).collect(),
            harmony_key_distance: self.harmony_key_distance(&frequencies),
            blind_spots: heuristic_blind_spots(query),
            concepts,
        }
    }
}

/// Query patterns that usually hide an unexamined assumption.
fn heuristic_blind_spots(query: &str) -> Vec<String> {
    let q = query.to_lowercase();
    let has = |words: &[&str]| words.iter().any(|w| q.contains(w));
    let mut spots = Vec::new();

    if has(&["cause", "causal"]) && !has(&["confound", "bias", "control"]) {
        spots.push("Causal framing without explicit confounder/bias controls.".to_string());
    }
    if has(&["meta-analysis", "systematic review", "synthesize"])
        && !has(&["heterogeneity", "publication bias", "funnel"])
    {
        spots.push(
            "Meta-analysis request without heterogeneity or publication-bias checks.".to_string(),
        );
    }
    if has(&["p-value", "significance", "statistical"]) && !q.contains("effect size") {
        spots.push("Statistical claims without effect-size interpretation.".to_string());
    }
    if q.contains("bayesian") && !q.contains("prior") {
        spots.push("Bayesian framing without explicit prior assumptions.".to_string());
    }
    if has(&["risk", "harm"]) && !has(&["mitigation", "safety", "guardrail"]) {
        spots.push("Risk framing without mitigation or safety plan.".to_string());
    }

    spots
}

/// Word-boundary containment over lowercased text; boundaries follow the
/// usual word-character convention (ASCII alphanumerics and underscore).
fn contains_word(haystack: &str, needle: &str) -> bool {
    if needle.is_empty() {
        return false;
    }
    let bytes = haystack.as_bytes();
    let mut start = 0;
    while let Some(pos) = haystack[start..].find(needle) {
        let at = start + pos;
        let end = at + needle.len();
        let left_ok = at == 0 || !is_word_byte(bytes[at - 1]);
        let right_ok = end == bytes.len() || !is_word_byte(bytes[end]);
        if left_ok && right_ok {
            return true;
        }
        // Advance past the first char of the match; keyword heads may be
        // multi-byte, so a bare +1 could land mid-character.
        start = at + haystack[at..].chars().next().map_or(1, char::len_utf8);
    }
    false
}

fn is_word_byte(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b == b'_'
}

/// Small ontology shared by tests across the crate.
#[cfg(test)]
pub(crate) fn demo_registry() -> ConceptRegistry {
    let doc = OntologyDoc::from_toml(
        r#"
        [concepts.Execute]
        prime = 2
        frequency_hz = 261.63
        keywords = ["execute", "run", "perform"]
        depth = 1

        [concepts.Authorization]
        prime = 3
        frequency_hz = 293.66
        keywords = ["authorization", "approved", "permission"]
        depth = 2

        [concepts.Truth]
        prime = 5
        frequency_hz = 329.63
        keywords = ["truth", "honest", "verify"]
        depth = 2

        [concepts.Deception]
        prime = 7
        frequency_hz = 466.16
        keywords = ["deception", "mislead", "lie"]
        depth = 3

        [concepts.Plan]
        prime = 11
        frequency_hz = 261.63
        keywords = ["plan", "strategy"]
        depth = 1

        [rules]
        forbids = [["Deception", "Truth"]]
        harmony_sets = [["Plan", "Execute"]]

        [rules.requires]
        Execute = ["Authorization"]

        [harmony_key]
        base_frequency_hz = 261.63
        tolerance_hz = 8.0
        "#,
    )
    .expect("demo ontology parses");
    ConceptRegistry::from_document(doc)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_concept_detection_and_chord() {
        let registry = demo_registry();
        let concepts =
            registry.detect_concepts("Execute the plan with authorization and safety checks");
        assert!(concepts.contains(&"Execute".to_string()));
        assert!(concepts.contains(&"Authorization".to_string()));
        assert!(concepts.contains(&"Plan".to_string()));
        // Sorted and deduplicated.
        let mut sorted = concepts.clone();
        sorted.sort();
        sorted.dedup();
        assert_eq!(concepts, sorted);
        assert!(registry.chord_product(&concepts) > 1);
    }

    #[test]
    fn test_whole_word_matching() {
        let registry = demo_registry();
        // "running" must not trigger the "run" keyword.
        assert!(registry.detect_concepts("running commentary").is_empty());
        assert_eq!(registry.detect_concepts("run it now"), vec!["Execute"]);
        assert!(registry.detect_concepts("").is_empty());
    }

    #[test]
    fn test_chord_product_multiplicative() {
        let registry = demo_registry();
        let small = registry.chord_product(&["Execute".to_string()]);
        let bigger =
            registry.chord_product(&["Execute".to_string(), "Authorization".to_string()]);
        assert_eq!(small, 2);
        assert_eq!(bigger, 6);
        assert!(bigger > small);
        assert_eq!(registry.chord_product(&[]), 1);
        assert_eq!(registry.chord_product(&["Unknown".to_string()]), 1);
    }

    #[test]
    fn test_chord_frequencies_preserve_order() {
        let registry = demo_registry();
        let freqs = registry.chord_frequencies(&[
            "Truth".to_string(),
            "Nope".to_string(),
            "Execute".to_string(),
        ]);
        assert_eq!(freqs.len(), 2);
        assert!((freqs[0] - 329.63).abs() < 1e-3);
        assert!((freqs[1] - 261.63).abs() < 1e-3);
    }

    #[test]
    fn test_dissonance_requires() {
        let registry = demo_registry();
        let (score, events) = registry.evaluate_dissonance(&["Execute".to_string()]);
        assert!(score > 0.0);
        assert!(events.iter().any(|e| e.detail.contains("missing")));
        assert!(events.iter().all(|e| e.rule == RuleKind::Requires));
    }

    #[test]
    fn test_dissonance_forbidden_pair() {
        let registry = demo_registry();
        let (score, events) =
            registry.evaluate_dissonance(&["Deception".to_string(), "Truth".to_string()]);
        assert!(score > 0.0);
        assert!(events.iter().any(|e| e.detail.contains("conflicts")));
    }

    #[test]
    fn test_dissonance_empty_is_zero() {
        let registry = demo_registry();
        let (score, events) = registry.evaluate_dissonance(&[]);
        assert_eq!(score, 0.0);
        assert!(events.is_empty());
    }

    #[test]
    fn test_dissonance_bounded() {
        let registry = demo_registry();
        for set in [
            vec!["Execute".to_string()],
            vec!["Execute".to_string(), "Deception".to_string(), "Truth".to_string()],
            vec!["Plan".to_string(), "Execute".to_string(), "Authorization".to_string()],
        ] {
            let (score, _) = registry.evaluate_dissonance(&set);
            assert!((0.0..=1.0).contains(&score));
        }
    }

    #[test]
    fn test_harmony_bonus_softens_dissonance() {
        let registry = demo_registry();
        // Execute alone violates its requires rule; adding Plan completes a
        // harmony set, which must not raise the score.
        let (alone, _) = registry.evaluate_dissonance(&["Execute".to_string()]);
        let (with_plan, _) =
            registry.evaluate_dissonance(&["Execute".to_string(), "Plan".to_string()]);
        assert!(with_plan <= alone);
    }

    #[test]
    fn test_harmony_key_distance() {
        let registry = demo_registry();
        assert_eq!(registry.harmony_key_distance(&[]), 0.0);
        // On-key frequency is distance zero.
        assert!(registry.harmony_key_distance(&[261.63]) < 1e-6);
        // Far off key clamps to 1.
        assert_eq!(registry.harmony_key_distance(&[1000.0]), 1.0);
        let mid = registry.harmony_key_distance(&[265.63]);
        assert!(mid > 0.0 && mid < 1.0);
    }

    #[test]
    fn test_meta_probe() {
        let registry = demo_registry();
        let report = registry.meta_probe("execute the causal analysis");
        assert!(report.concepts.contains(&"Execute".to_string()));
        assert_eq!(report.concept_count, report.concepts.len());
        assert!(report.dissonance_score > 0.0);
        assert!(report
            .blind_spots
            .iter()
            .any(|s| s.contains("confounder")));
    }

    #[test]
    fn test_concept_depths() {
        let registry = demo_registry();
        let depths =
            registry.concept_depths(&["Deception".to_string(), "Execute".to_string()]);
        assert_eq!(depths, vec![3, 1]);
    }
}
