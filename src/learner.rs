use anyhow::anyhow;
use serde::{Deserialize, Serialize};
use std::str::FromStr;

#[path = "learners/tree.rs"]
pub mod tree;

#[path = "learners/forest.rs"]
pub mod forest;

#[path = "learners/boosted.rs"]
pub mod boosted;

use boosted::BoostedTrees;
use forest::BaggedForest;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BaseLearnerKind {
    Bagged,
    Boosted,
}

impl BaseLearnerKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            BaseLearnerKind::Bagged => "bagged",
            BaseLearnerKind::Boosted => "boosted",
        }
    }
}

impl FromStr for BaseLearnerKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "bagged" => Ok(BaseLearnerKind::Bagged),
            "boosted" => Ok(BaseLearnerKind::Boosted),
            _ => Err(anyhow!("Unknown learner kind: '{}'", s)),
        }
    }
}

/// A fitted base learner. Both families expose the same probability
/// surface so the ensemble can vote without caring which is which.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum BaseLearner {
    Bagged(BaggedForest),
    Boosted(BoostedTrees),
}

impl BaseLearner {
    pub fn kind(&self) -> BaseLearnerKind {
        match self {
            BaseLearner::Bagged(_) => BaseLearnerKind::Bagged,
            BaseLearner::Boosted(_) => BaseLearnerKind::Boosted,
        }
    }

    pub fn predict_proba(&self, row: &[f64]) -> f64 {
        match self {
            BaseLearner::Bagged(forest) => forest.predict_proba(row),
            BaseLearner::Boosted(boosted) => boosted.predict_proba(row),
        }
    }

    pub fn feature_importances(&self) -> Vec<f64> {
        match self {
            BaseLearner::Bagged(forest) => forest.feature_importances(),
            BaseLearner::Boosted(boosted) => boosted.feature_importances(),
        }
    }
}
