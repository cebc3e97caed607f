//! Active model set and atomic reloads.
//!
//! Readers take an `Arc<ModelSet>` snapshot once per window; a reload builds and
//! validates a complete new set before swapping the pointer, so a prediction
//! never mixes parameters from two loads.

use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::Path;
use std::sync::Arc;

use log::{info, warn};
use memmap2::Mmap;
use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::detector::{ClusterModelState, SequenceModelState};
use crate::error::{DetectorError, Result};
use crate::features::{FEATURE_COUNT, FEATURE_NAMES};

#[derive(Debug, Clone, Default)]
pub struct ModelSet {
    pub cluster: Option<ClusterModelState>,
    pub sequence: Option<SequenceModelState>,
    /// Bumped on every successful install; 0 means nothing was ever loaded.
    pub generation: u64,
}

impl ModelSet {
    pub fn seq_length(&self) -> Option<usize> {
        self.sequence.as_ref().map(|m| m.seq_length)
    }
}

#[derive(Debug, Default)]
pub struct ModelRegistry {
    current: RwLock<Arc<ModelSet>>,
}

impl ModelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> Arc<ModelSet> {
        Arc::clone(&self.current.read())
    }

    /// Validates both models and swaps them in as one unit.
    pub fn install(
        &self,
        cluster: ClusterModelState,
        sequence: Option<SequenceModelState>,
    ) -> Result<u64> {
        check_cluster(&cluster)?;
        if let Some(sequence) = &sequence {
            check_sequence(sequence)?;
        }

        let mut current = self.current.write();
        let generation = current.generation + 1;
        *current = Arc::new(ModelSet {
            cluster: Some(cluster),
            sequence,
            generation,
        });
        Ok(generation)
    }

    /// Reads both artifacts, then installs them. On any failure the previously
    /// active models stay in place.
    pub fn load(&self, cluster_path: &Path, sequence_path: Option<&Path>) -> Result<u64> {
        let result = self.read_and_install(cluster_path, sequence_path);
        match &result {
            Ok(generation) => info!(
                "✅ Models loaded (generation {}): cluster={}, sequence={}",
                generation,
                cluster_path.display(),
                sequence_path.map(|p| p.display().to_string()).unwrap_or_else(|| "none".into())
            ),
            Err(e) => warn!("Model reload failed, keeping previous models: {}", e),
        }
        result
    }

    fn read_and_install(&self, cluster_path: &Path, sequence_path: Option<&Path>) -> Result<u64> {
        let cluster: ClusterModelState = read_model(cluster_path)?;
        let sequence: Option<SequenceModelState> = sequence_path.map(read_model).transpose()?;

        let as_load_failure = |path: &Path| {
            let path = path.to_path_buf();
            move |e: DetectorError| DetectorError::ModelLoadFailure {
                path,
                reason: e.to_string(),
            }
        };
        check_cluster(&cluster).map_err(as_load_failure(cluster_path))?;
        if let (Some(model), Some(path)) = (&sequence, sequence_path) {
            check_sequence(model).map_err(as_load_failure(path))?;
        }
        self.install(cluster, sequence)
    }
}

fn check_cluster(model: &ClusterModelState) -> Result<()> {
    model.validate()?;
    if model.n_features() != FEATURE_COUNT {
        return Err(DetectorError::DimensionMismatch {
            expected: FEATURE_COUNT,
            actual: model.n_features(),
        });
    }
    if !model.feature_names.is_empty()
        && model.feature_names.iter().map(String::as_str).ne(FEATURE_NAMES)
    {
        return Err(DetectorError::InvalidModelState(format!(
            "cluster model was fitted on features {:?}",
            model.feature_names
        )));
    }
    Ok(())
}

fn check_sequence(model: &SequenceModelState) -> Result<()> {
    model.validate()?;
    if model.n_features != FEATURE_COUNT {
        return Err(DetectorError::DimensionMismatch {
            expected: FEATURE_COUNT,
            actual: model.n_features,
        });
    }
    Ok(())
}

/// Memory-maps a JSON model artifact and deserializes it.
pub fn read_model<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let failure = |reason: String| DetectorError::ModelLoadFailure {
        path: path.to_path_buf(),
        reason,
    };

    let file = File::open(path).map_err(|e| failure(e.to_string()))?;
    let len = file.metadata().map_err(|e| failure(e.to_string()))?.len();
    if len == 0 {
        return Err(failure("artifact is empty".into()));
    }
    // SAFETY: the mapping is read-only and dropped before returning. Artifacts are
    // replaced by writing a new file, never rewritten in place while a load runs.
    let mmap = unsafe { Mmap::map(&file) }.map_err(|e| failure(e.to_string()))?;
    serde_json::from_slice(&mmap).map_err(|e| failure(e.to_string()))
}

/// Writes beside `path` and renames over it, so a concurrent load maps either
/// the old artifact or the new one.
pub fn save_model<T: Serialize>(model: &T, path: &Path) -> Result<()> {
    let staging = path.with_extension("tmp");
    let mut writer = BufWriter::new(File::create(&staging)?);
    serde_json::to_writer(&mut writer, model)?;
    writer.flush()?;
    drop(writer);
    fs::rename(&staging, path)?;
    Ok(())
}
