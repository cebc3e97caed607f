//! Real-time DDoS detection: packet capture, windowed traffic features and a
//! two-model ensemble (weighted clustering plus a CNN-LSTM sequence model).

pub mod capture;
pub mod config;
pub mod detector;
pub mod ensemble;
pub mod error;
pub mod features;
pub mod filter;
pub mod models;
pub mod packet;
pub mod pipeline;
pub mod queue;
pub mod stats;

#[cfg(test)]
mod tests;

pub use capture::{CaptureEngine, CaptureState, CaptureStatus, PacketSource, SourceOpener};
pub use config::AppConfig;
pub use detector::{ClusterModelState, Detector, NormalClusterPolicy, SequenceModelState, Verdict};
pub use ensemble::{AndFusion, DetectionResult, EnsembleClassifier, FusionPolicy, OrFusion};
pub use error::{DetectorError, Result};
pub use features::{FeatureExtractor, FeatureVector, FEATURE_COUNT, FEATURE_NAMES};
pub use filter::CaptureFilter;
pub use models::{ModelRegistry, ModelSet};
pub use packet::{PacketRecord, Protocol, TcpFlags};
pub use pipeline::{DetectionPipeline, PipelineStatus};
pub use queue::IngestionQueue;
