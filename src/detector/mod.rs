//! Detection models.
//!
//! Both models sit behind [`Detector`] so the ensemble can treat them the same
//! way: a single-vector prediction and a sequence prediction, each producing a
//! [`Verdict`].

pub mod cluster;
pub mod sequence;

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::features::FeatureVector;

pub use cluster::{ClusterModelState, ClusterVerdict, FitOptions, NormalClusterPolicy};
pub use sequence::{ConvLayer, DenseLayer, LstmLayer, SequenceModelState};

/// Binary decision plus a confidence in [0, 1].
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Verdict {
    pub is_attack: bool,
    pub confidence: f64,
}

impl Verdict {
    pub fn new(is_attack: bool, confidence: f64) -> Self {
        Self {
            is_attack,
            confidence: confidence.clamp(0.0, 1.0),
        }
    }
}

pub trait Detector: Send + Sync {
    fn name(&self) -> &'static str;

    fn predict(&self, features: &FeatureVector) -> Result<Verdict>;

    fn predict_sequence(&self, window: &[FeatureVector]) -> Result<Verdict>;
}
