//! Typed reasoning-trace records shared with the external reasoning loop.
//!
//! Each refinement pass of the collaborator appends one stage record; the
//! registry detects concepts over the flattened string fields via
//! `visit_text` instead of stringifying arbitrary maps.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReasoningTrace {
    pub stages: Vec<StageRecord>,
}

impl ReasoningTrace {
    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    pub fn push(&mut self, stage: StageRecord) {
        self.stages.push(stage);
    }

    /// Visit every human-readable string field, in stage order.
    pub fn visit_text<F: FnMut(&str)>(&self, mut f: F) {
        for stage in &self.stages {
            stage.visit_text(&mut f);
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "stage", rename_all = "snake_case")]
pub enum StageRecord {
    Statistical(StatisticalFindings),
    Causal(CausalFindings),
    Meta(MetaFindings),
    Bayesian(BayesianUpdate),
    Adversarial(AdversarialCritique),
    Refinement(RefinementPass),
}

impl StageRecord {
    fn visit_text<F: FnMut(&str)>(&self, f: &mut F) {
        match self {
            StageRecord::Statistical(s) => {
                f(&s.summary);
                s.methods.iter().for_each(|m| f(m));
                s.caveats.iter().for_each(|c| f(c));
            }
            StageRecord::Causal(c) => {
                f(&c.summary);
                c.confounders.iter().for_each(|x| f(x));
            }
            StageRecord::Meta(m) => {
                f(&m.summary);
                m.blind_spots.iter().for_each(|b| f(b));
                f(&m.notes);
            }
            StageRecord::Bayesian(b) => {
                f(&b.summary);
                f(&b.prior);
                f(&b.posterior);
            }
            StageRecord::Adversarial(a) => {
                f(&a.full_critique);
                a.weaknesses.iter().for_each(|w| f(w));
            }
            StageRecord::Refinement(r) => f(&r.summary),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StatisticalFindings {
    pub summary: String,
    #[serde(default)]
    pub methods: Vec<String>,
    #[serde(default)]
    pub caveats: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CausalFindings {
    pub summary: String,
    #[serde(default)]
    pub confounders: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MetaFindings {
    pub summary: String,
    #[serde(default)]
    pub blind_spots: Vec<String>,
    #[serde(default)]
    pub notes: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BayesianUpdate {
    pub summary: String,
    #[serde(default)]
    pub prior: String,
    #[serde(default)]
    pub posterior: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AdversarialCritique {
    pub full_critique: String,
    #[serde(default)]
    pub weaknesses: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RefinementPass {
    pub pass_index: u32,
    pub summary: String,
}
