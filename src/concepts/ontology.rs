//! Ontology document backing the concept registry.
//!
//! The document is static configuration: named concepts keyed by a unique
//! prime, a characteristic frequency, a keyword list, and a depth, plus the
//! co-occurrence rules and the harmony key. A missing or malformed document
//! is fatal at construction; there is no default ontology to fall back to.

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::path::Path;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConceptSpec {
    pub prime: u64,
    pub frequency_hz: f32,
    #[serde(default)]
    pub keywords: Vec<String>,
    #[serde(default = "default_depth")]
    pub depth: u32,
}

fn default_depth() -> u32 {
    1
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RuleSet {
    /// Concept -> companions that must also be present.
    pub requires: BTreeMap<String, Vec<String>>,
    /// Pairs that must never co-occur.
    pub forbids: Vec<[String; 2]>,
    /// Concept groups that, when fully present, soften dissonance.
    pub harmony_sets: Vec<Vec<String>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HarmonyKey {
    pub base_frequency_hz: f32,
    pub tolerance_hz: f32,
}

impl Default for HarmonyKey {
    fn default() -> Self {
        Self {
            base_frequency_hz: 261.63,
            tolerance_hz: 8.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OntologyDoc {
    pub concepts: BTreeMap<String, ConceptSpec>,
    #[serde(default)]
    pub rules: RuleSet,
    #[serde(default)]
    pub harmony_key: HarmonyKey,
}

impl OntologyDoc {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .with_context(|| format!("concept ontology not found: {}", path.display()))?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        let doc: Self = toml::from_str(content).context("malformed concept ontology")?;
        doc.validate()?;
        Ok(doc)
    }

    /// Chord arithmetic relies on pairwise-distinct primes greater than one.
    fn validate(&self) -> Result<()> {
        if self.concepts.is_empty() {
            bail!("concept ontology defines no concepts");
        }
        let mut seen = HashSet::new();
        for (name, spec) in &self.concepts {
            if spec.prime < 2 {
                bail!("concept {name} has prime {} (must be > 1)", spec.prime);
            }
            if !seen.insert(spec.prime) {
                bail!("concept {name} reuses prime {}", spec.prime);
            }
            if spec.frequency_hz <= 0.0 {
                bail!("concept {name} has non-positive frequency");
            }
        }
        if self.harmony_key.tolerance_hz <= 0.0 {
            bail!("harmony key tolerance must be positive");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_minimal_document() {
        let doc = OntologyDoc::from_toml(
            r#"
            [concepts.Truth]
            prime = 2
            frequency_hz = 261.63
            keywords = ["truth", "honest"]

            [concepts.Plan]
            prime = 3
            frequency_hz = 293.66
            depth = 2
            "#,
        )
        .unwrap();
        assert_eq!(doc.concepts.len(), 2);
        assert_eq!(doc.concepts["Truth"].depth, 1);
        assert_eq!(doc.concepts["Plan"].depth, 2);
        assert!((doc.harmony_key.base_frequency_hz - 261.63).abs() < 1e-3);
    }

    #[test]
    fn test_duplicate_prime_rejected() {
        let err = OntologyDoc::from_toml(
            r#"
            [concepts.A]
            prime = 5
            frequency_hz = 100.0

            [concepts.B]
            prime = 5
            frequency_hz = 200.0
            "#,
        );
        assert!(err.is_err());
    }

    #[test]
    fn test_empty_document_rejected() {
        assert!(OntologyDoc::from_toml("").is_err());
        assert!(OntologyDoc::from_toml("not even { toml").is_err());
    }

    #[test]
    fn test_missing_file_is_fatal() {
        assert!(OntologyDoc::load("no/such/ontology.toml").is_err());
    }
}
