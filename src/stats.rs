// SIMD helpers for the statistics the detectors recompute on every window.

use wide::f64x4;

pub struct SimdStats;

impl SimdStats {
    /// Mean using 4-lane SIMD accumulation. Empty input yields 0.
    pub fn mean(values: &[f64]) -> f64 {
        if values.is_empty() {
            return 0.0;
        }
        if values.len() < 4 {
            return values.iter().sum::<f64>() / values.len() as f64;
        }

        let mut sum = f64x4::splat(0.0);
        let chunks = values.chunks_exact(4);
        let remainder = chunks.remainder();
        for chunk in chunks {
            sum += f64x4::new([chunk[0], chunk[1], chunk[2], chunk[3]]);
        }

        let simd_sum: f64 = sum.to_array().iter().sum();
        let remaining_sum: f64 = remainder.iter().sum();
        (simd_sum + remaining_sum) / values.len() as f64
    }

    /// Population standard deviation around `mean`.
    pub fn std_dev(values: &[f64], mean: f64) -> f64 {
        if values.is_empty() {
            return 0.0;
        }
        if values.len() < 4 {
            let variance =
                values.iter().map(|x| (x - mean) * (x - mean)).sum::<f64>() / values.len() as f64;
            return variance.sqrt();
        }

        let mean_vec = f64x4::splat(mean);
        let mut sum_sq_diff = f64x4::splat(0.0);
        let chunks = values.chunks_exact(4);
        let remainder = chunks.remainder();
        for chunk in chunks {
            let diff = f64x4::new([chunk[0], chunk[1], chunk[2], chunk[3]]) - mean_vec;
            sum_sq_diff += diff * diff;
        }

        let simd_variance: f64 = sum_sq_diff.to_array().iter().sum();
        let remaining_variance: f64 = remainder.iter().map(|x| (x - mean) * (x - mean)).sum();
        ((simd_variance + remaining_variance) / values.len() as f64).sqrt()
    }

    pub fn min_max(values: &[f64]) -> (f64, f64) {
        if values.is_empty() {
            return (0.0, 0.0);
        }

        let mut min_vec = f64x4::splat(f64::INFINITY);
        let mut max_vec = f64x4::splat(f64::NEG_INFINITY);
        let chunks = values.chunks_exact(4);
        let remainder = chunks.remainder();
        for chunk in chunks {
            let lanes = f64x4::new([chunk[0], chunk[1], chunk[2], chunk[3]]);
            min_vec = min_vec.min(lanes);
            max_vec = max_vec.max(lanes);
        }

        let simd_min = min_vec.to_array().iter().fold(f64::INFINITY, |a, &b| a.min(b));
        let simd_max = max_vec.to_array().iter().fold(f64::NEG_INFINITY, |a, &b| a.max(b));
        remainder
            .iter()
            .fold((simd_min, simd_max), |(min, max), &v| (min.min(v), max.max(v)))
    }
}

/// Percentile with linear interpolation between closest ranks, `q` in [0, 100].
pub fn percentile(values: &[f64], q: f64) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.total_cmp(b));

    let rank = (q.clamp(0.0, 100.0) / 100.0) * (sorted.len() - 1) as f64;
    let lower = rank.floor() as usize;
    let upper = rank.ceil() as usize;
    let frac = rank - lower as f64;
    sorted[lower] + (sorted[upper] - sorted[lower]) * frac
}
