//! Temporal detector over the last `seq_length` feature vectors.
//!
//! Network: Conv1D (valid, ReLU) -> MaxPool1D -> LSTM (last hidden state)
//! -> Dense -> softmax. Parameters come from an offline-trained artifact.

use ndarray::{s, Array1, Array2, Array3};
use serde::{Deserialize, Serialize};

use super::{Detector, Verdict};
use crate::error::{DetectorError, Result};
use crate::features::FeatureVector;
use crate::stats::SimdStats;

pub const DEFAULT_EPSILON: f64 = 1e-8;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConvLayer {
    /// filters x kernel_size x n_features
    pub kernels: Array3<f64>,
    pub bias: Array1<f64>,
}

/// Gate order in the stacked weights is input, forget, cell, output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LstmLayer {
    /// 4H x input_size
    pub w_input: Array2<f64>,
    /// 4H x H
    pub w_recurrent: Array2<f64>,
    pub bias: Array1<f64>,
}

impl LstmLayer {
    pub fn hidden_size(&self) -> usize {
        self.w_recurrent.ncols()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DenseLayer {
    /// classes x H
    pub weights: Array2<f64>,
    pub bias: Array1<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SequenceModelState {
    pub seq_length: usize,
    pub n_features: usize,
    #[serde(default = "default_attack_class")]
    pub attack_class: usize,
    #[serde(default = "default_epsilon")]
    pub epsilon: f64,
    pub conv: ConvLayer,
    pub pool_size: usize,
    pub lstm: LstmLayer,
    pub dense: DenseLayer,
}

fn default_attack_class() -> usize {
    1
}

fn default_epsilon() -> f64 {
    DEFAULT_EPSILON
}

impl SequenceModelState {
    pub fn validate(&self) -> Result<()> {
        let invalid = |msg: String| -> Result<()> { Err(DetectorError::InvalidModelState(msg)) };

        if self.seq_length == 0 || self.n_features == 0 {
            return invalid("sequence model has zero seq_length or n_features".into());
        }
        let (filters, kernel, conv_features) = self.conv.kernels.dim();
        if filters == 0
            || kernel == 0
            || conv_features != self.n_features
            || self.conv.bias.len() != filters
        {
            return invalid(format!(
                "conv kernels {}x{}x{} / bias {} do not fit {} features",
                filters,
                kernel,
                conv_features,
                self.conv.bias.len(),
                self.n_features
            ));
        }
        if kernel > self.seq_length
            || self.pool_size == 0
            || (self.seq_length - kernel + 1) / self.pool_size == 0
        {
            return invalid(format!(
                "kernel {} and pool {} leave no time steps for seq_length {}",
                kernel, self.pool_size, self.seq_length
            ));
        }

        let hidden = self.lstm.hidden_size();
        let gates = 4 * hidden;
        if hidden == 0
            || self.lstm.w_input.dim() != (gates, filters)
            || self.lstm.w_recurrent.nrows() != gates
            || self.lstm.bias.len() != gates
        {
            return invalid(format!(
                "lstm weights {:?}/{:?}/{} do not match hidden size {} and {} filters",
                self.lstm.w_input.dim(),
                self.lstm.w_recurrent.dim(),
                self.lstm.bias.len(),
                hidden,
                filters
            ));
        }

        let classes = self.dense.weights.nrows();
        if classes < 2 || self.dense.weights.ncols() != hidden || self.dense.bias.len() != classes {
            return invalid(format!(
                "dense weights {:?} / bias {} do not match hidden size {}",
                self.dense.weights.dim(),
                self.dense.bias.len(),
                hidden
            ));
        }
        if self.attack_class >= classes {
            return invalid(format!(
                "attack class {} out of range for {} classes",
                self.attack_class, classes
            ));
        }
        if !(self.epsilon > 0.0) {
            return invalid("epsilon must be positive".into());
        }
        Ok(())
    }

    /// Builds the `seq_length x n_features` input matrix, rejecting any other shape.
    pub fn window_matrix(&self, window: &[FeatureVector]) -> Result<Array2<f64>> {
        if window.len() != self.seq_length {
            return Err(DetectorError::DimensionMismatch {
                expected: self.seq_length,
                actual: window.len(),
            });
        }
        if let Some(bad) = window.iter().find(|fv| fv.len() != self.n_features) {
            return Err(DetectorError::DimensionMismatch {
                expected: self.n_features,
                actual: bad.len(),
            });
        }

        let flat: Vec<f64> = window.iter().flat_map(|fv| fv.as_slice().iter().copied()).collect();
        Array2::from_shape_vec((self.seq_length, self.n_features), flat)
            .map_err(|e| DetectorError::InvalidModelState(e.to_string()))
    }

    /// Per-feature `(x - mean) / (std + epsilon)` over the window. Must stay
    /// identical to the preprocessing the network was trained with.
    pub fn normalize(&self, window: &Array2<f64>) -> Array2<f64> {
        let mut normalized = window.clone();
        for mut column in normalized.columns_mut() {
            let values: Vec<f64> = column.to_vec();
            let mean = SimdStats::mean(&values);
            let std = SimdStats::std_dev(&values, mean);
            column.mapv_inplace(|x| (x - mean) / (std + self.epsilon));
        }
        normalized
    }

    /// Class probabilities for a raw (not yet normalized) window.
    pub fn probabilities(&self, window: &Array2<f64>) -> Result<Array1<f64>> {
        self.validate()?;
        if window.dim() != (self.seq_length, self.n_features) {
            return Err(DetectorError::DimensionMismatch {
                expected: self.seq_length * self.n_features,
                actual: window.len(),
            });
        }

        let input = self.normalize(window);
        let conv = self.convolve(&input);
        let pooled = max_pool(&conv, self.pool_size);
        let hidden = self.run_lstm(&pooled);
        let logits = self.dense.weights.dot(&hidden) + &self.dense.bias;
        Ok(softmax(&logits))
    }

    pub fn predict_matrix(&self, window: &Array2<f64>) -> Result<Verdict> {
        let probs = self.probabilities(window)?;
        let (class, confidence) = probs
            .iter()
            .copied()
            .enumerate()
            .fold((0, f64::NEG_INFINITY), |best, cur| if cur.1 > best.1 { cur } else { best });
        Ok(Verdict::new(class == self.attack_class, confidence))
    }

    fn convolve(&self, input: &Array2<f64>) -> Array2<f64> {
        let (filters, kernel, _) = self.conv.kernels.dim();
        let steps = input.nrows() - kernel + 1;
        let mut out = Array2::zeros((steps, filters));
        for t in 0..steps {
            let patch = input.slice(s![t..t + kernel, ..]);
            for f in 0..filters {
                let weights = self.conv.kernels.slice(s![f, .., ..]);
                let activation = (&patch * &weights).sum() + self.conv.bias[f];
                out[[t, f]] = activation.max(0.0);
            }
        }
        out
    }

    fn run_lstm(&self, sequence: &Array2<f64>) -> Array1<f64> {
        let hidden = self.lstm.hidden_size();
        let mut h = Array1::<f64>::zeros(hidden);
        let mut c = Array1::<f64>::zeros(hidden);

        for x in sequence.rows() {
            let z = self.lstm.w_input.dot(&x) + self.lstm.w_recurrent.dot(&h) + &self.lstm.bias;
            let input_gate = z.slice(s![0..hidden]).mapv(sigmoid);
            let forget_gate = z.slice(s![hidden..2 * hidden]).mapv(sigmoid);
            let cell = z.slice(s![2 * hidden..3 * hidden]).mapv(f64::tanh);
            let output_gate = z.slice(s![3 * hidden..4 * hidden]).mapv(sigmoid);

            c = &forget_gate * &c + &input_gate * &cell;
            h = &output_gate * &c.mapv(f64::tanh);
        }
        h
    }
}

impl Detector for SequenceModelState {
    fn name(&self) -> &'static str {
        "sequence"
    }

    /// Only meaningful for models with `seq_length == 1`.
    fn predict(&self, features: &FeatureVector) -> Result<Verdict> {
        self.predict_sequence(std::slice::from_ref(features))
    }

    fn predict_sequence(&self, window: &[FeatureVector]) -> Result<Verdict> {
        let matrix = self.window_matrix(window)?;
        self.predict_matrix(&matrix)
    }
}

fn max_pool(input: &Array2<f64>, pool: usize) -> Array2<f64> {
    let steps = input.nrows() / pool;
    let mut out = Array2::zeros((steps, input.ncols()));
    for t in 0..steps {
        let block = input.slice(s![t * pool..(t + 1) * pool, ..]);
        for (f, column) in block.columns().into_iter().enumerate() {
            out[[t, f]] = column.fold(f64::NEG_INFINITY, |a, &b| a.max(b));
        }
    }
    out
}

fn sigmoid(x: f64) -> f64 {
    1.0 / (1.0 + (-x).exp())
}

fn softmax(logits: &Array1<f64>) -> Array1<f64> {
    let max = logits.fold(f64::NEG_INFINITY, |a, &b| a.max(b));
    let exp = logits.mapv(|v| (v - max).exp());
    let total = exp.sum();
    exp / total
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::features::FEATURE_COUNT;
    use ndarray::array;

    /// Fires when packet_rate rises across the window: the conv kernel is a
    /// difference filter on feature 0 and the LSTM passes it straight through.
    pub(crate) fn trend_model(seq_length: usize) -> SequenceModelState {
        let mut kernels = Array3::zeros((1, 2, FEATURE_COUNT));
        kernels[[0, 0, 0]] = -1.0;
        kernels[[0, 1, 0]] = 1.0;
        SequenceModelState {
            seq_length,
            n_features: FEATURE_COUNT,
            attack_class: 1,
            epsilon: DEFAULT_EPSILON,
            conv: ConvLayer {
                kernels,
                bias: array![0.0],
            },
            pool_size: 1,
            lstm: LstmLayer {
                w_input: array![[0.0], [0.0], [2.0], [0.0]],
                w_recurrent: array![[0.0], [0.0], [0.0], [0.0]],
                bias: array![10.0, -10.0, 0.0, 10.0],
            },
            dense: DenseLayer {
                weights: array![[-5.0], [5.0]],
                bias: array![0.0, 0.0],
            },
        }
    }

    /// Always answers with the given dense bias, whatever the input.
    pub(crate) fn constant_model(seq_length: usize, bias: [f64; 2]) -> SequenceModelState {
        let mut model = trend_model(seq_length);
        model.dense.weights = array![[0.0], [0.0]];
        model.dense.bias = array![bias[0], bias[1]];
        model
    }

    fn window_with_rates(rates: &[f64]) -> Vec<FeatureVector> {
        rates
            .iter()
            .map(|rate| {
                let mut values = [0.5; FEATURE_COUNT];
                values[0] = *rate;
                FeatureVector::new(values)
            })
            .collect()
    }

    #[test]
    fn test_rising_rate_is_flagged() {
        let model = trend_model(4);
        model.validate().unwrap();

        let rising = model.predict_sequence(&window_with_rates(&[1.0, 2.0, 3.0, 4.0])).unwrap();
        assert!(rising.is_attack);
        assert!(rising.confidence > 0.99);

        let falling = model.predict_sequence(&window_with_rates(&[4.0, 3.0, 2.0, 1.0])).unwrap();
        assert!(!falling.is_attack);
        assert!((falling.confidence - 0.5).abs() < 1e-9);
    }

    #[test]
    fn test_normalization_is_scale_invariant() {
        let model = trend_model(4);
        let small = model.predict_sequence(&window_with_rates(&[1.0, 2.0, 3.0, 4.0])).unwrap();
        let large = model
            .predict_sequence(&window_with_rates(&[100.0, 200.0, 300.0, 400.0]))
            .unwrap();
        assert!((small.confidence - large.confidence).abs() < 1e-6);
    }

    #[test]
    fn test_normalize_columns() {
        let model = trend_model(4);
        let window = model.window_matrix(&window_with_rates(&[1.0, 2.0, 3.0, 4.0])).unwrap();
        let normalized = model.normalize(&window);

        // constant columns collapse to zero instead of dividing by zero
        assert!(normalized.column(5).iter().all(|v| v.abs() < 1e-12));
        let rate = normalized.column(0);
        assert!(rate.sum().abs() < 1e-9);
        let std = (rate.mapv(|v| v * v).sum() / 4.0).sqrt();
        assert!((std - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_constant_model_confidence() {
        let model = constant_model(3, [0.0, 3.0]);
        let verdict = model.predict_sequence(&window_with_rates(&[1.0, 1.0, 1.0])).unwrap();
        assert!(verdict.is_attack);
        let expected = 3f64.exp() / (1.0 + 3f64.exp());
        assert!((verdict.confidence - expected).abs() < 1e-12);
    }

    #[test]
    fn test_wrong_window_length_is_rejected() {
        let model = trend_model(4);
        let err = model.predict_sequence(&window_with_rates(&[1.0, 2.0])).unwrap_err();
        assert!(matches!(err, DetectorError::DimensionMismatch { expected: 4, actual: 2 }));

        let err = model.predict_matrix(&Array2::zeros((4, 3))).unwrap_err();
        assert!(matches!(err, DetectorError::DimensionMismatch { .. }));
    }

    #[test]
    fn test_inconsistent_model_is_invalid() {
        let mut model = trend_model(4);
        model.lstm.bias = array![0.0, 0.0];
        assert!(matches!(model.validate(), Err(DetectorError::InvalidModelState(_))));

        let mut model = trend_model(1);
        model.pool_size = 1;
        // kernel of 2 cannot slide over a single step
        assert!(model.validate().is_err());
    }
}
