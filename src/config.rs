//! Runtime configuration.
//!
//! Built-in defaults, then an optional JSON file, then `DDOS_*` environment
//! overrides. Every field has a default so a partial file is enough.

use std::path::{Path, PathBuf};
use std::time::Duration;

use log::debug;
use serde::{Deserialize, Serialize};

use crate::error::{DetectorError, Result};
use crate::capture::check_filter;
use crate::queue::DEFAULT_QUEUE_CAPACITY;

pub const CONFIG_ENV: &str = "DDOS_CONFIG";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub capture: CaptureConfig,
    pub detection: DetectionConfig,
    pub output: OutputConfig,
    pub log_level: String,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            capture: CaptureConfig::default(),
            detection: DetectionConfig::default(),
            output: OutputConfig::default(),
            log_level: "info".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    /// Interface name; `None` asks interactively.
    pub interface: Option<String>,
    pub filter: String,
    pub queue_capacity: usize,
    pub promiscuous: bool,
    pub read_timeout_ms: u64,
    /// Consecutive faults after which capture stops for good.
    pub error_threshold: u32,
    /// Reopen attempts per recovery cycle.
    pub max_retries: u32,
    pub retry_delay_ms: u64,
    pub max_backoff_ms: u64,
    pub stop_timeout_ms: u64,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            interface: None,
            filter: "ip".to_string(),
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            promiscuous: true,
            read_timeout_ms: 100,
            error_threshold: 10,
            max_retries: 5,
            retry_delay_ms: 1000,
            max_backoff_ms: 30_000,
            stop_timeout_ms: 5000,
        }
    }
}

impl CaptureConfig {
    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    pub fn max_backoff(&self) -> Duration {
        Duration::from_millis(self.max_backoff_ms)
    }

    pub fn stop_timeout(&self) -> Duration {
        Duration::from_millis(self.stop_timeout_ms)
    }

    /// Delay before reopen attempt `attempt` (0-based): `retry_delay * 2^attempt`,
    /// capped at `max_backoff`.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt);
        self.retry_delay().saturating_mul(factor).min(self.max_backoff())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FusionKind {
    #[default]
    Or,
    And,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectionConfig {
    /// Rates are normalized by this duration, and a window closes once it has
    /// been open this long.
    pub window_secs: u64,
    /// A window also closes once it holds this many packets.
    pub window_packets: usize,
    /// History length used until a sequence model is loaded.
    pub seq_length: usize,
    pub model_dir: PathBuf,
    pub cluster_model: String,
    /// `None` runs the cluster model alone.
    pub sequence_model: Option<String>,
    pub fusion: FusionKind,
    /// Results a subscriber may have pending before newer ones are dropped
    /// for it.
    pub dispatch_backlog: usize,
}

impl Default for DetectionConfig {
    fn default() -> Self {
        Self {
            window_secs: 60,
            window_packets: 100,
            seq_length: 100,
            model_dir: PathBuf::from("models"),
            cluster_model: "cluster_model.json".to_string(),
            sequence_model: Some("sequence_model.json".to_string()),
            fusion: FusionKind::Or,
            dispatch_backlog: 1024,
        }
    }
}

impl DetectionConfig {
    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_secs)
    }

    pub fn cluster_model_path(&self) -> PathBuf {
        self.model_dir.join(&self.cluster_model)
    }

    pub fn sequence_model_path(&self) -> Option<PathBuf> {
        self.sequence_model.as_ref().map(|name| self.model_dir.join(name))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputConfig {
    /// Every result is appended here; `None` disables the CSV log.
    pub csv_path: Option<PathBuf>,
    /// Attack verdicts at or above this confidence are logged as alerts.
    pub alert_confidence: f64,
    pub status_interval_secs: u64,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            csv_path: Some(PathBuf::from("detections.csv")),
            alert_confidence: 0.7,
            status_interval_secs: 30,
        }
    }
}

impl AppConfig {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| {
                DetectorError::Config(format!("failed to read {}: {}", path.display(), e))
            })?;
        serde_json::from_str(&content)
            .map_err(|e| {
                DetectorError::Config(format!("failed to parse {}: {}", path.display(), e))
            })
    }

    /// Defaults, then `path` (or `$DDOS_CONFIG`) if given, then environment
    /// overrides. The result is validated.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let from_env = std::env::var_os(CONFIG_ENV).map(PathBuf::from);
        let mut config = match path.map(Path::to_path_buf).or(from_env) {
            Some(path) => {
                debug!("Reading configuration from {}", path.display());
                Self::from_file(path)?
            }
            None => Self::default(),
        };
        config.apply_env();
        config.validate()?;
        Ok(config)
    }

    pub fn apply_env(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    /// Applies `DDOS_*` overrides read through `lookup`. Unparseable numbers
    /// are ignored.
    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup("DDOS_INTERFACE") {
            self.capture.interface = Some(v).filter(|s| !s.trim().is_empty());
        }
        if let Some(v) = lookup("DDOS_FILTER") {
            self.capture.filter = v;
        }
        if let Some(v) = lookup("DDOS_QUEUE_CAPACITY") {
            if let Ok(capacity) = v.trim().parse() {
                self.capture.queue_capacity = capacity;
            }
        }
        if let Some(v) = lookup("DDOS_MODEL_DIR") {
            self.detection.model_dir = PathBuf::from(v);
        }
        if let Some(v) = lookup("DDOS_LOG_LEVEL") {
            self.log_level = v;
        }
    }

    pub fn validate(&self) -> Result<()> {
        let capture = &self.capture;
        if capture.queue_capacity == 0 {
            return Err("capture.queue_capacity must be at least 1".into());
        }
        if capture.error_threshold == 0 {
            return Err("capture.error_threshold must be at least 1".into());
        }
        if capture.read_timeout_ms == 0 {
            return Err("capture.read_timeout_ms must be positive".into());
        }
        if capture.max_backoff_ms < capture.retry_delay_ms {
            return Err("capture.max_backoff_ms must not be below capture.retry_delay_ms".into());
        }
        check_filter(&capture.filter)?;

        let detection = &self.detection;
        if detection.window_secs == 0 {
            return Err("detection.window_secs must be positive".into());
        }
        if detection.window_packets == 0 {
            return Err("detection.window_packets must be at least 1".into());
        }
        if detection.seq_length == 0 {
            return Err("detection.seq_length must be at least 1".into());
        }
        if detection.dispatch_backlog == 0 {
            return Err("detection.dispatch_backlog must be at least 1".into());
        }

        if !(0.0..=1.0).contains(&self.output.alert_confidence) {
            return Err("output.alert_confidence must be within [0, 1]".into());
        }
        if self.log_level.parse::<log::LevelFilter>().is_err() {
            return Err(DetectorError::Config(format!("unknown log level '{}'", self.log_level)));
        }
        Ok(())
    }
}
