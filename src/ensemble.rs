use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use log::trace;
use serde::Serialize;

use crate::detector::{ClusterVerdict, Detector, Verdict};
use crate::error::{DetectorError, Result};
use crate::features::FeatureVector;
use crate::models::ModelSet;

/// Combines the cluster and sequence verdicts once both are available.
pub trait FusionPolicy: Send + Sync {
    fn fuse(&self, cluster: Verdict, sequence: Verdict) -> Verdict;
}

/// Attack if either model says so; confidence is the mean of both.
#[derive(Debug, Clone, Copy, Default)]
pub struct OrFusion;

impl FusionPolicy for OrFusion {
    fn fuse(&self, cluster: Verdict, sequence: Verdict) -> Verdict {
        Verdict::new(
            cluster.is_attack || sequence.is_attack,
            (cluster.confidence + sequence.confidence) / 2.0,
        )
    }
}

/// Attack only if both models agree; confidence is the mean of both.
#[derive(Debug, Clone, Copy, Default)]
pub struct AndFusion;

impl FusionPolicy for AndFusion {
    fn fuse(&self, cluster: Verdict, sequence: Verdict) -> Verdict {
        Verdict::new(
            cluster.is_attack && sequence.is_attack,
            (cluster.confidence + sequence.confidence) / 2.0,
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DetectionResult {
    pub is_attack: bool,
    pub confidence: f64,
    pub features: FeatureVector,
    pub timestamp: DateTime<Utc>,
    pub packet_count: usize,
    pub cluster: ClusterVerdict,
    /// `None` until the history holds a full sequence.
    pub sequence: Option<Verdict>,
}

pub struct EnsembleClassifier {
    history: VecDeque<FeatureVector>,
    capacity: usize,
    fusion: Box<dyn FusionPolicy>,
}

impl EnsembleClassifier {
    pub fn new(seq_length: usize) -> Self {
        Self::with_fusion(seq_length, Box::new(OrFusion))
    }

    pub fn with_fusion(seq_length: usize, fusion: Box<dyn FusionPolicy>) -> Self {
        let capacity = seq_length.max(1);
        Self {
            history: VecDeque::with_capacity(capacity),
            capacity,
            fusion,
        }
    }

    pub fn history_len(&self) -> usize {
        self.history.len()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Keeps the newest entries when a reload changes the sequence length.
    fn resize(&mut self, seq_length: usize) {
        let capacity = seq_length.max(1);
        if capacity == self.capacity {
            return;
        }
        while self.history.len() > capacity {
            self.history.pop_front();
        }
        self.capacity = capacity;
    }

    fn remember(&mut self, features: FeatureVector) {
        if self.history.len() == self.capacity {
            self.history.pop_front();
        }
        self.history.push_back(features);
    }

    /// Classifies one window against a model snapshot.
    pub fn classify(
        &mut self,
        features: FeatureVector,
        packet_count: usize,
        models: &ModelSet,
    ) -> Result<DetectionResult> {
        let cluster_model = models
            .cluster
            .as_ref()
            .ok_or_else(|| DetectorError::InvalidModelState("no cluster model loaded".into()))?;
        let cluster = cluster_model.assess(features.as_slice())?;

        if let Some(seq_length) = models.seq_length() {
            self.resize(seq_length);
        }
        self.remember(features);

        let sequence = match &models.sequence {
            Some(model) if self.history.len() >= model.seq_length => {
                let window: Vec<FeatureVector> = self.history.iter().copied().collect();
                Some(model.predict_sequence(&window)?)
            }
            _ => None,
        };

        let verdict = match sequence {
            Some(sequence) => self.fusion.fuse(cluster.verdict, sequence),
            None => cluster.verdict,
        };
        trace!(
            "window verdict: cluster={:?} sequence={:?} fused={:?}",
            cluster.verdict,
            sequence,
            verdict
        );

        Ok(DetectionResult {
            is_attack: verdict.is_attack,
            confidence: verdict.confidence,
            features,
            timestamp: Utc::now(),
            packet_count,
            cluster,
            sequence,
        })
    }
}
