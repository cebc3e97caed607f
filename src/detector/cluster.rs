//! Weighted clustering detector.
//!
//! A window is anomalous when its weighted distance to the nearest learned
//! center exceeds a threshold learned from the training distances. Feature
//! weights are refined during fitting by inverse intra-cluster variance, so
//! features that are tight within clusters dominate the distance.

use log::{debug, info};
use ndarray::{Array1, Array2, ArrayView1, Axis};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use super::{Detector, Verdict};
use crate::error::{DetectorError, Result};
use crate::features::{FeatureVector, FEATURE_NAMES};
use crate::stats::{percentile, SimdStats};

/// Which learned cluster is treated as the normal-traffic baseline.
///
/// The default heuristic (the dominant cluster with the higher centroid mean
/// is normal) depends on the training data and is not guaranteed to hold for
/// every deployment; override it when the data says otherwise.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NormalClusterPolicy {
    #[default]
    HigherCentroidMean,
    LowerCentroidMean,
    Fixed(usize),
}

impl NormalClusterPolicy {
    /// Only the two largest clusters are candidates for the mean-based policies.
    pub fn resolve(&self, centers: &Array2<f64>, sizes: &[usize]) -> Result<usize> {
        let k = centers.nrows();
        if k == 0 {
            return Err(DetectorError::InvalidModelState("model has no cluster centers".into()));
        }

        let mut by_size: Vec<usize> = (0..k).collect();
        by_size.sort_by(|a, b| {
            let sa = sizes.get(*a).copied().unwrap_or(0);
            let sb = sizes.get(*b).copied().unwrap_or(0);
            sb.cmp(&sa).then(a.cmp(b))
        });
        let dominant = &by_size[..k.min(2)];
        let centroid_mean = |idx: usize| centers.row(idx).mean().unwrap_or(0.0);

        match self {
            NormalClusterPolicy::HigherCentroidMean => Ok(dominant
                .iter()
                .copied()
                .max_by(|a, b| centroid_mean(*a).total_cmp(&centroid_mean(*b)).then(b.cmp(a)))
                .unwrap_or(0)),
            NormalClusterPolicy::LowerCentroidMean => Ok(dominant
                .iter()
                .copied()
                .min_by(|a, b| centroid_mean(*a).total_cmp(&centroid_mean(*b)).then(a.cmp(b)))
                .unwrap_or(0)),
            NormalClusterPolicy::Fixed(idx) if *idx < k => Ok(*idx),
            NormalClusterPolicy::Fixed(idx) => Err(DetectorError::InvalidModelState(format!(
                "normal cluster {} out of range for {} centers",
                idx, k
            ))),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FitOptions {
    pub k: usize,
    pub max_iter: usize,
    /// Stop once no weight moves by more than this between iterations.
    pub tolerance: f64,
    pub threshold_percentile: f64,
    /// Added to every intra-cluster variance before inverting it.
    pub epsilon: f64,
    pub policy: NormalClusterPolicy,
}

impl Default for FitOptions {
    fn default() -> Self {
        Self {
            k: 3,
            max_iter: 100,
            tolerance: 1e-4,
            threshold_percentile: 95.0,
            epsilon: 1e-3,
            policy: NormalClusterPolicy::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ClusterVerdict {
    pub verdict: Verdict,
    pub nearest_cluster: usize,
    pub distance: f64,
    /// Nearest cluster is the normal baseline.
    pub baseline: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusterModelState {
    pub feature_names: Vec<String>,
    pub mean: Array1<f64>,
    pub scale: Array1<f64>,
    /// K x n, in scaled space.
    pub centers: Array2<f64>,
    pub weights: Array1<f64>,
    pub cluster_sizes: Vec<usize>,
    pub threshold: f64,
    pub distance_scale: f64,
    pub normal_cluster: usize,
}

impl ClusterModelState {
    pub fn n_features(&self) -> usize {
        self.mean.len()
    }

    pub fn n_clusters(&self) -> usize {
        self.centers.nrows()
    }

    pub fn validate(&self) -> Result<()> {
        let n = self.mean.len();
        let k = self.centers.nrows();
        let invalid = |msg: String| -> Result<()> { Err(DetectorError::InvalidModelState(msg)) };

        if n == 0 || k == 0 {
            return invalid(format!("cluster model is not fitted ({} features, {} centers)", n, k));
        }
        if self.scale.len() != n || self.weights.len() != n || self.centers.ncols() != n {
            return invalid(format!(
                "inconsistent shapes: mean {}, scale {}, weights {}, centers {}x{}",
                n,
                self.scale.len(),
                self.weights.len(),
                k,
                self.centers.ncols()
            ));
        }
        if !self.feature_names.is_empty() && self.feature_names.len() != n {
            return invalid(format!(
                "{} feature names for {} features",
                self.feature_names.len(),
                n
            ));
        }
        if self.cluster_sizes.len() != k {
            return invalid(format!("{} cluster sizes for {} centers", self.cluster_sizes.len(), k));
        }
        if self.normal_cluster >= k {
            return invalid(format!("normal cluster {} out of range", self.normal_cluster));
        }
        if self.scale.iter().any(|s| !(*s > 0.0) || !s.is_finite()) {
            return invalid("scaler has non-positive scale".into());
        }
        if self.weights.iter().any(|w| *w < 0.0 || !w.is_finite())
            || (self.weights.sum() - 1.0).abs() > 1e-6
        {
            return invalid("feature weights must be non-negative and sum to 1".into());
        }
        if !self.threshold.is_finite() || self.threshold < 0.0 || !(self.distance_scale > 0.0) {
            return invalid("threshold or distance scale is invalid".into());
        }
        Ok(())
    }

    /// Learned feature weights paired with the feature names, in feature
    /// order. The weights sum to one, so each value is that feature's share of
    /// the distance.
    pub fn feature_importance(&self) -> Vec<(&str, f64)> {
        let names: Vec<&str> = if self.feature_names.is_empty() {
            FEATURE_NAMES.iter().take(self.n_features()).copied().collect()
        } else {
            self.feature_names.iter().map(String::as_str).collect()
        };
        names.into_iter().zip(self.weights.iter().copied()).collect()
    }

    /// Re-applies a baseline policy to an already fitted model.
    pub fn relabel(&mut self, policy: NormalClusterPolicy) -> Result<()> {
        self.normal_cluster = policy.resolve(&self.centers, &self.cluster_sizes)?;
        Ok(())
    }

    pub fn assess(&self, values: &[f64]) -> Result<ClusterVerdict> {
        self.validate()?;
        if values.len() != self.n_features() {
            return Err(DetectorError::DimensionMismatch {
                expected: self.n_features(),
                actual: values.len(),
            });
        }

        let scaled: Array1<f64> = values
            .iter()
            .zip(self.mean.iter().zip(self.scale.iter()))
            .map(|(x, (m, s))| (x - m) / s)
            .collect();
        let (nearest_cluster, distance) =
            nearest_center(scaled.view(), &self.centers, &self.weights);

        Ok(ClusterVerdict {
            verdict: Verdict::new(distance > self.threshold, distance / self.distance_scale),
            nearest_cluster,
            distance,
            baseline: nearest_cluster == self.normal_cluster,
        })
    }

    /// Offline fit: standard scaling, farthest-first initialization, then
    /// k-means with iteratively refined feature weights.
    pub fn fit(samples: &[FeatureVector], options: &FitOptions) -> Result<Self> {
        let rows: Vec<f64> = samples.iter().flat_map(|s| s.as_slice().iter().copied()).collect();
        let data = Array2::from_shape_vec((samples.len(), FEATURE_NAMES.len()), rows)
            .map_err(|e| DetectorError::InvalidModelState(e.to_string()))?;
        let mut model = Self::fit_matrix(&data, options)?;
        model.feature_names = FEATURE_NAMES.iter().map(|n| n.to_string()).collect();
        Ok(model)
    }

    pub fn fit_matrix(data: &Array2<f64>, options: &FitOptions) -> Result<Self> {
        let (m, n) = data.dim();
        if m == 0 || n == 0 {
            return Err(DetectorError::InvalidModelState("cannot fit on empty data".into()));
        }
        if options.k == 0 || options.k > m {
            return Err(DetectorError::InvalidModelState(format!(
                "cannot fit {} clusters on {} samples",
                options.k, m
            )));
        }

        let mut mean = Array1::zeros(n);
        let mut scale = Array1::ones(n);
        for (j, column) in data.axis_iter(Axis(1)).enumerate() {
            let column: Vec<f64> = column.to_vec();
            let mu = SimdStats::mean(&column);
            let sigma = SimdStats::std_dev(&column, mu);
            mean[j] = mu;
            scale[j] = if sigma > 1e-12 { sigma } else { 1.0 };
        }
        let scaled = (data - &mean) / &scale;

        let mut weights = Array1::from_elem(n, 1.0 / n as f64);
        let mut centers = farthest_first_centers(&scaled, options.k);
        let mut assignments: Vec<usize> = Vec::new();
        let mut sizes = vec![0usize; options.k];

        for iteration in 0..options.max_iter.max(1) {
            let next: Vec<usize> = (0..m)
                .into_par_iter()
                .map(|i| nearest_center(scaled.row(i), &centers, &weights).0)
                .collect();

            sizes = vec![0usize; options.k];
            let mut sums = Array2::<f64>::zeros((options.k, n));
            for (i, &cluster) in next.iter().enumerate() {
                sizes[cluster] += 1;
                let mut row = sums.row_mut(cluster);
                row += &scaled.row(i);
            }
            for (c, &size) in sizes.iter().enumerate() {
                // empty clusters keep their previous center
                if size > 0 {
                    let center = &sums.row(c) / size as f64;
                    centers.row_mut(c).assign(&center);
                }
            }

            // mean over clusters of the per-cluster variance of each feature
            let mut variance = Array1::<f64>::zeros(n);
            let mut populated = 0usize;
            for (c, &size) in sizes.iter().enumerate() {
                if size == 0 {
                    continue;
                }
                populated += 1;
                let center = centers.row(c);
                let mut cluster_var = Array1::<f64>::zeros(n);
                for (i, _) in next.iter().enumerate().filter(|(_, a)| **a == c) {
                    let diff = &scaled.row(i) - &center;
                    cluster_var += &(&diff * &diff);
                }
                variance += &(cluster_var / size as f64);
            }
            variance /= populated.max(1) as f64;

            let inverse = variance.mapv(|v| 1.0 / (v + options.epsilon));
            let new_weights = &inverse / inverse.sum();
            let delta = (&new_weights - &weights)
                .iter()
                .fold(0.0_f64, |acc, d| acc.max(d.abs()));
            weights = new_weights;

            let stable = next == assignments;
            assignments = next;
            debug!(
                "cluster fit iteration {}: weight delta {:.6}, stable {}",
                iteration, delta, stable
            );
            if delta < options.tolerance && stable {
                break;
            }
        }

        let distances: Vec<f64> = (0..m)
            .into_par_iter()
            .map(|i| nearest_center(scaled.row(i), &centers, &weights).1)
            .collect();
        let threshold = percentile(&distances, options.threshold_percentile);
        let (min_distance, max_distance) = SimdStats::min_max(&distances);
        let distance_scale = if max_distance > 0.0 { max_distance } else { 1.0 };
        let normal_cluster = options.policy.resolve(&centers, &sizes)?;

        info!(
            "Cluster model fitted: {} samples, {} clusters, threshold {:.4} (distances {:.4}..{:.4}), normal cluster {}",
            m, options.k, threshold, min_distance, max_distance, normal_cluster
        );

        Ok(Self {
            feature_names: Vec::new(),
            mean,
            scale,
            centers,
            weights,
            cluster_sizes: sizes,
            threshold,
            distance_scale,
            normal_cluster,
        })
    }
}

impl Detector for ClusterModelState {
    fn name(&self) -> &'static str {
        "cluster"
    }

    fn predict(&self, features: &FeatureVector) -> Result<Verdict> {
        Ok(self.assess(features.as_slice())?.verdict)
    }

    /// Scores the newest vector of the window.
    fn predict_sequence(&self, window: &[FeatureVector]) -> Result<Verdict> {
        let newest = window.last().ok_or(DetectorError::DimensionMismatch {
            expected: 1,
            actual: 0,
        })?;
        self.predict(newest)
    }
}

fn weighted_distance(
    point: ArrayView1<f64>,
    center: ArrayView1<f64>,
    weights: &Array1<f64>,
) -> f64 {
    point
        .iter()
        .zip(center.iter())
        .zip(weights.iter())
        .map(|((x, c), w)| w * (x - c) * (x - c))
        .sum::<f64>()
        .sqrt()
}

fn nearest_center(
    point: ArrayView1<f64>,
    centers: &Array2<f64>,
    weights: &Array1<f64>,
) -> (usize, f64) {
    centers
        .axis_iter(Axis(0))
        .enumerate()
        .map(|(idx, center)| (idx, weighted_distance(point, center, weights)))
        .fold((0, f64::INFINITY), |best, cur| if cur.1 < best.1 { cur } else { best })
}

/// Deterministic seeding: start from the sample closest to the data mean,
/// then repeatedly take the sample farthest from every chosen center.
fn farthest_first_centers(scaled: &Array2<f64>, k: usize) -> Array2<f64> {
    let (m, n) = scaled.dim();
    let uniform = Array1::from_elem(n, 1.0);
    let origin = Array1::<f64>::zeros(n);

    let first = (0..m)
        .min_by(|a, b| {
            weighted_distance(scaled.row(*a), origin.view(), &uniform)
                .total_cmp(&weighted_distance(scaled.row(*b), origin.view(), &uniform))
        })
        .unwrap_or(0);

    let mut chosen = vec![first];
    let mut closest: Vec<f64> = (0..m)
        .map(|i| weighted_distance(scaled.row(i), scaled.row(first), &uniform))
        .collect();

    while chosen.len() < k {
        let next = (0..m)
            .filter(|i| !chosen.contains(i))
            .max_by(|a, b| closest[*a].total_cmp(&closest[*b]).then(b.cmp(a)))
            .unwrap_or(0);
        chosen.push(next);
        for (i, best) in closest.iter_mut().enumerate() {
            *best = best.min(weighted_distance(scaled.row(i), scaled.row(next), &uniform));
        }
    }

    let mut centers = Array2::zeros((k, n));
    for (c, &idx) in chosen.iter().enumerate() {
        centers.row_mut(c).assign(&scaled.row(idx));
    }
    centers
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use ndarray::array;

    /// Two centers in a 3-feature space, identity scaler.
    pub(crate) fn two_center_model() -> ClusterModelState {
        ClusterModelState {
            feature_names: vec!["a".into(), "b".into(), "c".into()],
            mean: array![0.0, 0.0, 0.0],
            scale: array![1.0, 1.0, 1.0],
            centers: array![[1.0, 1.0, 1.0], [-2.0, 0.0, 3.0]],
            weights: array![0.5, 0.25, 0.25],
            cluster_sizes: vec![80, 20],
            threshold: 1.0,
            distance_scale: 4.0,
            normal_cluster: 0,
        }
    }

    #[test]
    fn test_center_zero_is_not_an_attack() {
        let model = two_center_model();
        let verdict = model.assess(&[1.0, 1.0, 1.0]).unwrap();
        assert_eq!(verdict.nearest_cluster, 0);
        assert!(verdict.distance.abs() < 1e-12);
        assert!(!verdict.verdict.is_attack);
        assert!(verdict.baseline);
    }

    #[test]
    fn test_far_point_is_an_attack_with_capped_confidence() {
        let model = two_center_model();
        let verdict = model.assess(&[20.0, 20.0, 20.0]).unwrap();
        assert!(verdict.verdict.is_attack);
        assert_eq!(verdict.verdict.confidence, 1.0);

        let near = model.assess(&[3.0, 1.0, 1.0]).unwrap();
        // sqrt(0.5 * 4) = 1.414 > threshold 1.0
        assert!(near.verdict.is_attack);
        assert!((near.verdict.confidence - 2f64.sqrt() / 4.0).abs() < 1e-12);
    }

    #[test]
    fn test_wrong_length_is_dimension_mismatch() {
        let model = two_center_model();
        let err = model.predict(&FeatureVector::default()).unwrap_err();
        assert!(matches!(err, DetectorError::DimensionMismatch { expected: 3, actual: 13 }));
    }

    #[test]
    fn test_unfitted_model_is_invalid_state() {
        let mut model = two_center_model();
        model.centers = Array2::zeros((0, 3));
        model.cluster_sizes.clear();
        let err = model.assess(&[0.0, 0.0, 0.0]).unwrap_err();
        assert!(matches!(err, DetectorError::InvalidModelState(_)));

        let mut model = two_center_model();
        model.weights = array![0.5, 0.5, 0.5];
        assert!(matches!(model.validate(), Err(DetectorError::InvalidModelState(_))));
    }

    #[test]
    fn test_normal_cluster_policy() {
        let centers = array![[0.0, 0.0], [5.0, 5.0], [-9.0, -9.0]];
        let sizes = [10, 30, 2];
        // cluster 2 is tiny, so only clusters 0 and 1 compete
        assert_eq!(NormalClusterPolicy::HigherCentroidMean.resolve(&centers, &sizes).unwrap(), 1);
        assert_eq!(NormalClusterPolicy::LowerCentroidMean.resolve(&centers, &sizes).unwrap(), 0);
        assert_eq!(NormalClusterPolicy::Fixed(2).resolve(&centers, &sizes).unwrap(), 2);
        assert!(NormalClusterPolicy::Fixed(3).resolve(&centers, &sizes).is_err());

        let mut model = two_center_model();
        model.relabel(NormalClusterPolicy::LowerCentroidMean).unwrap();
        assert_eq!(model.normal_cluster, 1);
        assert!(!model.assess(&[1.0, 1.0, 1.0]).unwrap().baseline);
        model.relabel(NormalClusterPolicy::HigherCentroidMean).unwrap();
        assert_eq!(model.normal_cluster, 0);
    }

    #[test]
    fn test_fit_separates_blobs_and_learns_weights() {
        let mut rows = Vec::new();
        for i in 0..40 {
            let jitter = (i % 5) as f64 * 0.01;
            rows.extend_from_slice(&[0.0 + jitter, 10.0 - jitter, (i % 7) as f64]);
        }
        for i in 0..40 {
            let jitter = (i % 5) as f64 * 0.01;
            rows.extend_from_slice(&[5.0 + jitter, 2.0 + jitter, (i % 7) as f64]);
        }
        let data = Array2::from_shape_vec((80, 3), rows).unwrap();
        let options = FitOptions { k: 2, ..Default::default() };
        let model = ClusterModelState::fit_matrix(&data, &options).unwrap();

        model.validate().unwrap();
        assert_eq!(model.cluster_sizes.iter().sum::<usize>(), 80);
        assert!(model.cluster_sizes.iter().all(|s| *s == 40));
        assert!((model.weights.sum() - 1.0).abs() < 1e-9);
        // the noisy third feature carries little weight
        assert!(model.weights[2] < model.weights[0]);

        // a training point sits inside the model
        let inside = model.assess(&[0.02, 9.98, 3.0]).unwrap();
        assert!(!inside.verdict.is_attack);

        let outside = model.assess(&[20.0, -10.0, 3.0]).unwrap();
        assert!(outside.verdict.is_attack);
    }

    #[test]
    fn test_feature_importance_follows_weights() {
        let model = two_center_model();
        assert_eq!(model.feature_importance(), vec![("a", 0.5), ("b", 0.25), ("c", 0.25)]);

        let mut unnamed = ClusterModelState {
            feature_names: Vec::new(),
            mean: Array1::zeros(FEATURE_NAMES.len()),
            scale: Array1::ones(FEATURE_NAMES.len()),
            centers: Array2::zeros((1, FEATURE_NAMES.len())),
            weights: Array1::from_elem(FEATURE_NAMES.len(), 1.0 / FEATURE_NAMES.len() as f64),
            cluster_sizes: vec![1],
            threshold: 1.0,
            distance_scale: 1.0,
            normal_cluster: 0,
        };
        unnamed.weights[0] = 0.0;
        let importance = unnamed.feature_importance();
        assert_eq!(importance.len(), FEATURE_NAMES.len());
        assert_eq!(importance[0], (FEATURE_NAMES[0], 0.0));
        assert_eq!(importance[12].0, FEATURE_NAMES[12]);
    }

    #[test]
    fn test_fit_rejects_bad_input() {
        let data = Array2::<f64>::zeros((2, 3));
        let options = FitOptions { k: 3, ..Default::default() };
        assert!(ClusterModelState::fit_matrix(&data, &options).is_err());
        assert!(ClusterModelState::fit(&[], &FitOptions::default()).is_err());
    }
}
