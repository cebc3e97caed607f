//! Capture-to-classification pipeline.
//!
//! The capture thread feeds the [`IngestionQueue`]; the consumer thread drains
//! it into windows, extracts features, runs the ensemble against the current
//! model snapshot and hands every [`DetectionResult`] to the subscribers.
//! Each subscriber has its own single-threaded lane, so it receives results in
//! the order they were produced and a slow one only delays itself.

use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError};
use log::{debug, error, info, warn};
use parking_lot::Mutex;
use serde::Serialize;
use threadpool::ThreadPool;

use crate::capture::{CaptureEngine, CaptureMonitor, CaptureStatus, SourceOpener};
use crate::config::{CaptureConfig, DetectionConfig, FusionKind};
use crate::ensemble::{AndFusion, DetectionResult, EnsembleClassifier, FusionPolicy, OrFusion};
use crate::error::{DetectorError, Result};
use crate::features::FeatureExtractor;
use crate::filter::CaptureFilter;
use crate::models::ModelRegistry;
use crate::packet::PacketRecord;
use crate::queue::IngestionQueue;

const POP_TIMEOUT: Duration = Duration::from_millis(100);
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(10);

pub type DetectionCallback = Arc<dyn Fn(&DetectionResult) + Send + Sync>;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PipelineStatus {
    pub running: bool,
    pub capture: CaptureStatus,
    pub queue_depth: usize,
    pub queue_capacity: usize,
    pub packets_queued: u64,
    pub packets_dropped: u64,
    pub windows_processed: u64,
    pub attacks_detected: u64,
    pub prediction_failures: u64,
    /// Results not delivered because a subscriber's backlog was full.
    pub results_dropped: u64,
    pub model_generation: u64,
}

#[derive(Debug, Default)]
struct PipelineCounters {
    windows: AtomicU64,
    attacks: AtomicU64,
    failures: AtomicU64,
    results_dropped: AtomicU64,
}

/// A callback and the lane that runs it. The lane has one thread, so calls
/// happen one at a time in dispatch order.
struct Subscriber {
    callback: DetectionCallback,
    lane: ThreadPool,
}

struct ConsumerHandle {
    thread: JoinHandle<()>,
    done: Receiver<()>,
}

pub struct DetectionPipeline {
    config: DetectionConfig,
    queue: Arc<IngestionQueue>,
    capture: CaptureEngine,
    registry: Arc<ModelRegistry>,
    subscribers: Arc<Mutex<Vec<Subscriber>>>,
    counters: Arc<PipelineCounters>,
    running: Arc<AtomicBool>,
    consumer: Option<ConsumerHandle>,
    stop_timeout: Duration,
}

impl DetectionPipeline {
    pub fn new(config: DetectionConfig, queue_capacity: usize) -> Result<Self> {
        if config.window_packets == 0 || config.window_secs == 0 {
            return Err("detection window must hold at least one packet and one second".into());
        }
        let queue = Arc::new(IngestionQueue::new(queue_capacity)?);
        Ok(Self {
            config,
            capture: CaptureEngine::new(Arc::clone(&queue)),
            queue,
            registry: Arc::new(ModelRegistry::new()),
            subscribers: Arc::new(Mutex::new(Vec::new())),
            counters: Arc::new(PipelineCounters::default()),
            running: Arc::new(AtomicBool::new(false)),
            consumer: None,
            stop_timeout: CaptureConfig::default().stop_timeout(),
        })
    }

    /// Live capture on `interface` with a filter expression. libpcap filters in
    /// the kernel, so the engine then passes everything it receives.
    #[cfg(feature = "libpcap")]
    pub fn start(&mut self, interface: &str, filter: &str, cfg: &CaptureConfig) -> Result<()> {
        crate::capture::check_filter(filter)?;
        info!("Capturing on {}", interface);
        let opener =
            crate::capture::pcap_opener(interface.to_string(), filter.to_string(), cfg.clone());
        self.start_with_source(opener, CaptureFilter::match_all(), cfg)
    }

    /// Live capture on `interface` with a filter expression.
    #[cfg(not(feature = "libpcap"))]
    pub fn start(&mut self, interface: &str, filter: &str, cfg: &CaptureConfig) -> Result<()> {
        let filter = CaptureFilter::parse(filter)?;
        let interface = crate::capture::find_interface(interface)?;
        info!("Capturing on {}", interface.name);
        let opener = crate::capture::pnet_opener(interface, cfg.clone());
        self.start_with_source(opener, filter, cfg)
    }

    /// Same as [`start`](Self::start) with an arbitrary packet source; `filter`
    /// is matched in userspace against every record the source yields.
    pub fn start_with_source(
        &mut self,
        opener: SourceOpener,
        filter: CaptureFilter,
        cfg: &CaptureConfig,
    ) -> Result<()> {
        if self.running.load(Ordering::SeqCst) {
            return Err("pipeline already running".into());
        }
        if let Some(previous) = self.consumer.take() {
            let _ = previous.thread.join();
        }
        if cfg.queue_capacity != self.queue.capacity() {
            self.queue = Arc::new(IngestionQueue::new(cfg.queue_capacity)?);
            self.capture = CaptureEngine::new(Arc::clone(&self.queue));
        }

        self.running.store(true, Ordering::SeqCst);
        let fusion: Box<dyn FusionPolicy> = match self.config.fusion {
            FusionKind::Or => Box::new(OrFusion),
            FusionKind::And => Box::new(AndFusion),
        };
        let consumer = Consumer {
            queue: Arc::clone(&self.queue),
            registry: Arc::clone(&self.registry),
            subscribers: Arc::clone(&self.subscribers),
            counters: Arc::clone(&self.counters),
            running: Arc::clone(&self.running),
            capture: self.capture.monitor(),
            extractor: FeatureExtractor::new(self.config.window()),
            ensemble: EnsembleClassifier::with_fusion(self.config.seq_length, fusion),
            dispatch_backlog: self.config.dispatch_backlog.max(1),
            window_packets: self.config.window_packets,
            window_duration: self.config.window(),
        };

        let (done_tx, done_rx) = bounded(1);
        let spawned = thread::Builder::new().name("detection".into()).spawn(move || {
            consumer.run();
            let _ = done_tx.send(());
        });
        let thread = match spawned {
            Ok(thread) => thread,
            Err(e) => {
                self.running.store(false, Ordering::SeqCst);
                return Err(e.into());
            }
        };
        self.consumer = Some(ConsumerHandle {
            thread,
            done: done_rx,
        });
        self.stop_timeout = cfg.stop_timeout();

        if let Err(e) = self.capture.start(opener, filter, cfg) {
            self.stop();
            return Err(e);
        }
        Ok(())
    }

    /// Stops capture and detection. Both threads share one `stop_timeout`
    /// deadline; whatever has not finished by then is abandoned.
    pub fn stop(&mut self) {
        let deadline = Instant::now() + self.stop_timeout;
        self.capture.stop_within(self.stop_timeout);
        self.running.store(false, Ordering::SeqCst);

        let Some(consumer) = self.consumer.take() else {
            return;
        };
        let remaining = deadline.saturating_duration_since(Instant::now());
        match consumer.done.recv_timeout(remaining) {
            Ok(()) | Err(RecvTimeoutError::Disconnected) => {
                if consumer.thread.join().is_err() {
                    error!("Detection thread panicked");
                }
            }
            Err(RecvTimeoutError::Timeout) => warn!(
                "Detection thread did not stop within {:?}, abandoning it",
                self.stop_timeout
            ),
        }
        info!("🛑 Detection pipeline stopped");
    }

    /// Registers a subscriber. Its callbacks run one at a time, in result
    /// order, on a thread of its own; never on the detection thread.
    pub fn on_detection<F>(&self, callback: F)
    where
        F: Fn(&DetectionResult) + Send + Sync + 'static,
    {
        let mut subscribers = self.subscribers.lock();
        let lane = ThreadPool::with_name(format!("detection-subscriber-{}", subscribers.len()), 1);
        subscribers.push(Subscriber {
            callback: Arc::new(callback),
            lane,
        });
    }

    /// Atomically replaces the active models; on failure the old ones stay.
    pub fn load_models(&self, cluster_path: &Path, sequence_path: Option<&Path>) -> Result<()> {
        self.registry.load(cluster_path, sequence_path).map(|_| ())
    }

    pub fn registry(&self) -> Arc<ModelRegistry> {
        Arc::clone(&self.registry)
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn fatal_error(&self) -> Option<DetectorError> {
        self.capture.fatal_error().map(DetectorError::CaptureFault)
    }

    pub fn status(&self) -> PipelineStatus {
        PipelineStatus {
            running: self.is_running(),
            capture: self.capture.status(),
            queue_depth: self.queue.len(),
            queue_capacity: self.queue.capacity(),
            packets_queued: self.queue.pushed(),
            packets_dropped: self.queue.dropped(),
            windows_processed: self.counters.windows.load(Ordering::Relaxed),
            attacks_detected: self.counters.attacks.load(Ordering::Relaxed),
            prediction_failures: self.counters.failures.load(Ordering::Relaxed),
            results_dropped: self.counters.results_dropped.load(Ordering::Relaxed),
            model_generation: self.registry.snapshot().generation,
        }
    }
}

impl Drop for DetectionPipeline {
    fn drop(&mut self) {
        self.stop();
    }
}

struct Consumer {
    queue: Arc<IngestionQueue>,
    registry: Arc<ModelRegistry>,
    subscribers: Arc<Mutex<Vec<Subscriber>>>,
    counters: Arc<PipelineCounters>,
    running: Arc<AtomicBool>,
    capture: CaptureMonitor,
    extractor: FeatureExtractor,
    ensemble: EnsembleClassifier,
    dispatch_backlog: usize,
    window_packets: usize,
    window_duration: Duration,
}

struct Window {
    packets: Vec<PacketRecord>,
    opened: Option<Instant>,
}

impl Window {
    fn push(&mut self, packet: PacketRecord) {
        if self.packets.is_empty() {
            self.opened = Some(Instant::now());
        }
        self.packets.push(packet);
    }

    fn take(&mut self) -> Vec<PacketRecord> {
        self.opened = None;
        std::mem::take(&mut self.packets)
    }

    fn expired(&self, duration: Duration) -> bool {
        self.opened.map_or(false, |opened| opened.elapsed() >= duration)
    }
}

impl Consumer {
    fn run(mut self) {
        debug!("Detection thread started");
        let mut window = Window {
            packets: Vec::with_capacity(self.window_packets),
            opened: None,
        };
        let mut last_heartbeat = Instant::now();
        let mut last_dropped = self.queue.dropped();
        let mut last_lagged = self.counters.results_dropped.load(Ordering::Relaxed);

        while self.running.load(Ordering::SeqCst) {
            match self.queue.pop(POP_TIMEOUT) {
                Some(packet) => {
                    window.push(packet);
                    if window.packets.len() >= self.window_packets {
                        let packets = window.take();
                        self.classify(packets);
                    }
                }
                None => {
                    if let Some(fatal) = self.capture.fatal_error() {
                        error!("Capture failed, draining queue and stopping detection: {}", fatal);
                        self.drain(&mut window);
                        self.running.store(false, Ordering::SeqCst);
                        break;
                    }
                }
            }

            if window.expired(self.window_duration) {
                let packets = window.take();
                self.classify(packets);
            }

            if last_heartbeat.elapsed() >= HEARTBEAT_INTERVAL {
                let dropped = self.queue.dropped();
                if dropped > last_dropped {
                    warn!(
                        "⚠️ {} packets dropped on a full queue in the last {:?}",
                        dropped - last_dropped,
                        HEARTBEAT_INTERVAL
                    );
                }
                let lagged = self.counters.results_dropped.load(Ordering::Relaxed);
                if lagged > last_lagged {
                    warn!(
                        "⚠️ {} results dropped for slow subscribers in the last {:?}",
                        lagged - last_lagged,
                        HEARTBEAT_INTERVAL
                    );
                }
                last_lagged = lagged;
                debug!(
                    "Heartbeat: queue {}/{}, windows {}, open window {} packets",
                    self.queue.len(),
                    self.queue.capacity(),
                    self.counters.windows.load(Ordering::Relaxed),
                    window.packets.len()
                );
                last_dropped = dropped;
                last_heartbeat = Instant::now();
            }
        }
        self.flush_subscribers();
        debug!("Detection thread exiting");
    }

    /// Waits until every subscriber has seen the results already dispatched.
    fn flush_subscribers(&self) {
        let lanes: Vec<ThreadPool> =
            self.subscribers.lock().iter().map(|s| s.lane.clone()).collect();
        for lane in lanes {
            lane.join();
        }
    }

    /// Classifies whatever is still queued once capture is gone, including the
    /// final partial window.
    fn drain(&mut self, window: &mut Window) {
        while let Some(packet) = self.queue.try_pop() {
            window.push(packet);
            if window.packets.len() >= self.window_packets {
                let packets = window.take();
                self.classify(packets);
            }
        }
        let packets = window.take();
        self.classify(packets);
    }

    fn classify(&mut self, packets: Vec<PacketRecord>) {
        if packets.is_empty() {
            return;
        }
        let features = self.extractor.extract(&packets);
        let models = self.registry.snapshot();
        self.counters.windows.fetch_add(1, Ordering::Relaxed);

        match self.ensemble.classify(features, packets.len(), &models) {
            Ok(result) => {
                if result.is_attack {
                    self.counters.attacks.fetch_add(1, Ordering::Relaxed);
                }
                self.dispatch(Arc::new(result));
            }
            Err(e) => {
                self.counters.failures.fetch_add(1, Ordering::Relaxed);
                warn!(
                    "Window of {} packets not classified (model generation {}): {}",
                    packets.len(),
                    models.generation,
                    e
                );
            }
        }
    }

    fn dispatch(&self, result: Arc<DetectionResult>) {
        let subscribers = self.subscribers.lock();
        for (index, subscriber) in subscribers.iter().enumerate() {
            if subscriber.lane.queued_count() >= self.dispatch_backlog {
                self.counters.results_dropped.fetch_add(1, Ordering::Relaxed);
                debug!(
                    "Subscriber {} has {} results pending, dropping one",
                    index, self.dispatch_backlog
                );
                continue;
            }
            let callback = Arc::clone(&subscriber.callback);
            let result = Arc::clone(&result);
            subscriber.lane.execute(move || callback(result.as_ref()));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::tests::{fast_config, scripted_opener, wait_for, Step};
    use crate::capture::CaptureState;
    use crate::detector::ClusterModelState;
    use crate::features::FEATURE_COUNT;
    use ndarray::{Array1, Array2};
    use parking_lot::Mutex;
    use std::net::{IpAddr, Ipv4Addr};

    fn detection_config(window_packets: usize) -> DetectionConfig {
        DetectionConfig {
            window_secs: 60,
            window_packets,
            seq_length: 3,
            sequence_model: None,
            ..DetectionConfig::default()
        }
    }

    /// Accepts anything near the origin of the scaled space.
    fn permissive_model() -> ClusterModelState {
        ClusterModelState {
            feature_names: Vec::new(),
            mean: Array1::zeros(FEATURE_COUNT),
            scale: Array1::from_elem(FEATURE_COUNT, 1e6),
            centers: Array2::zeros((1, FEATURE_COUNT)),
            weights: Array1::from_elem(FEATURE_COUNT, 1.0 / FEATURE_COUNT as f64),
            cluster_sizes: vec![1],
            threshold: 1.0,
            distance_scale: 1.0,
            normal_cluster: 0,
        }
    }

    fn packets(n: usize) -> Vec<Step> {
        let ip = IpAddr::V4(Ipv4Addr::new(10, 1, 1, 1));
        (0..n)
            .map(|i| Step::Packet(PacketRecord::udp(ip, ip, 1000 + i as u16, 53, 100)))
            .collect()
    }

    #[test]
    fn test_windows_reach_subscribers() {
        let mut pipeline = DetectionPipeline::new(detection_config(5), 64).unwrap();
        pipeline.registry().install(permissive_model(), None).unwrap();

        let seen = Arc::new(Mutex::new(Vec::new()));
        {
            let seen = Arc::clone(&seen);
            pipeline.on_detection(move |result| seen.lock().push(result.packet_count));
        }

        let cfg = CaptureConfig {
            queue_capacity: 64,
            ..fast_config(3)
        };
        pipeline
            .start_with_source(scripted_opener(packets(12)), CaptureFilter::match_all(), &cfg)
            .unwrap();

        assert!(wait_for(|| seen.lock().len() == 2));
        let status = pipeline.status();
        assert_eq!(status.windows_processed, 2);
        assert_eq!(status.prediction_failures, 0);
        assert_eq!(status.model_generation, 1);
        pipeline.stop();
        assert!(!pipeline.is_running());
        assert_eq!(*seen.lock(), vec![5, 5]);
    }

    #[test]
    fn test_slow_subscriber_sees_results_in_order() {
        let mut pipeline = DetectionPipeline::new(detection_config(1), 16).unwrap();
        pipeline.registry().install(permissive_model(), None).unwrap();

        let sizes = Arc::new(Mutex::new(Vec::new()));
        {
            let sizes = Arc::clone(&sizes);
            pipeline.on_detection(move |result| {
                let size =
                    result.features.get("avg_packet_size").unwrap_or_default().round() as usize;
                if size == 100 {
                    thread::sleep(Duration::from_millis(100));
                }
                sizes.lock().push(size);
            });
        }

        let ip = IpAddr::V4(Ipv4Addr::new(10, 1, 1, 1));
        let script = (1..=4)
            .map(|i| Step::Packet(PacketRecord::udp(ip, ip, 1000, 53, 100 * i)))
            .collect();
        let cfg = CaptureConfig {
            queue_capacity: 16,
            ..fast_config(3)
        };
        pipeline
            .start_with_source(scripted_opener(script), CaptureFilter::match_all(), &cfg)
            .unwrap();

        assert!(wait_for(|| sizes.lock().len() == 4));
        pipeline.stop();
        assert_eq!(*sizes.lock(), vec![100, 200, 300, 400]);
        assert_eq!(pipeline.status().results_dropped, 0);
    }

    #[test]
    fn test_full_backlog_drops_results_for_that_subscriber() {
        let detection = DetectionConfig {
            dispatch_backlog: 1,
            ..detection_config(1)
        };
        let mut pipeline = DetectionPipeline::new(detection, 16).unwrap();
        pipeline.registry().install(permissive_model(), None).unwrap();

        let (release_tx, release_rx) = bounded::<()>(1);
        let delivered = Arc::new(AtomicU64::new(0));
        {
            let delivered = Arc::clone(&delivered);
            pipeline.on_detection(move |_| {
                let _ = release_rx.recv_timeout(Duration::from_secs(5));
                delivered.fetch_add(1, Ordering::SeqCst);
            });
        }

        let cfg = CaptureConfig {
            queue_capacity: 16,
            ..fast_config(3)
        };
        pipeline
            .start_with_source(scripted_opener(packets(5)), CaptureFilter::match_all(), &cfg)
            .unwrap();

        // one result running and one pending at most
        assert!(wait_for(|| pipeline.status().results_dropped >= 3));
        assert_eq!(delivered.load(Ordering::SeqCst), 0);

        drop(release_tx);
        assert!(wait_for(|| {
            let status = pipeline.status();
            status.windows_processed == 5
                && delivered.load(Ordering::SeqCst) + status.results_dropped == 5
        }));
        assert!(pipeline.status().results_dropped <= 4);
        pipeline.stop();
    }

    #[test]
    fn test_stop_shares_one_deadline() {
        let mut pipeline = DetectionPipeline::new(detection_config(1), 16).unwrap();
        pipeline.registry().install(permissive_model(), None).unwrap();

        let entered = Arc::new(AtomicBool::new(false));
        {
            let entered = Arc::clone(&entered);
            pipeline.on_detection(move |_| {
                entered.store(true, Ordering::SeqCst);
                thread::sleep(Duration::from_secs(3));
            });
        }

        let mut script = packets(1);
        script.push(Step::Hang(Duration::from_secs(3)));
        let cfg = CaptureConfig {
            queue_capacity: 16,
            stop_timeout_ms: 500,
            ..fast_config(3)
        };
        pipeline
            .start_with_source(scripted_opener(script), CaptureFilter::match_all(), &cfg)
            .unwrap();
        assert!(wait_for(|| entered.load(Ordering::SeqCst)));

        // capture is stuck in a read and detection waits on the subscriber
        let started = Instant::now();
        pipeline.stop();
        let elapsed = started.elapsed();
        assert!(elapsed < Duration::from_millis(900), "stop took {:?}", elapsed);
        assert!(!pipeline.is_running());
    }

    #[test]
    fn test_missing_models_count_as_failures() {
        let mut pipeline = DetectionPipeline::new(detection_config(2), 16).unwrap();
        let cfg = CaptureConfig {
            queue_capacity: 16,
            ..fast_config(3)
        };
        pipeline
            .start_with_source(scripted_opener(packets(4)), CaptureFilter::match_all(), &cfg)
            .unwrap();

        assert!(wait_for(|| pipeline.status().prediction_failures == 2));
        assert!(pipeline.is_running());
        pipeline.stop();
    }

    #[test]
    fn test_capture_fault_drains_and_stops() {
        let mut pipeline = DetectionPipeline::new(detection_config(10), 16).unwrap();
        pipeline.registry().install(permissive_model(), None).unwrap();
        let counts = Arc::new(Mutex::new(Vec::new()));
        {
            let counts = Arc::clone(&counts);
            pipeline.on_detection(move |result| counts.lock().push(result.packet_count));
        }

        let mut script = packets(3);
        script.extend([Step::Fail, Step::Fail]);
        let cfg = CaptureConfig {
            queue_capacity: 16,
            ..fast_config(2)
        };
        pipeline
            .start_with_source(scripted_opener(script), CaptureFilter::match_all(), &cfg)
            .unwrap();

        assert!(wait_for(|| !pipeline.is_running()));
        let status = pipeline.status();
        assert_eq!(status.capture.state, CaptureState::Stopped);
        assert!(status.capture.fatal_error.is_some());
        assert!(matches!(pipeline.fatal_error(), Some(DetectorError::CaptureFault(_))));
        // the partial window of three packets is still classified
        assert!(wait_for(|| counts.lock().len() == 1));
        assert_eq!(*counts.lock(), vec![3]);
    }

    #[test]
    fn test_malformed_filter_fails_start() {
        let mut pipeline = DetectionPipeline::new(detection_config(10), 16).unwrap();
        let err = pipeline.start("lo", "port", &CaptureConfig::default()).unwrap_err();
        assert!(matches!(err, DetectorError::Config(_)));
        assert!(!pipeline.is_running());
    }

    #[test]
    fn test_double_start_rejected() {
        let mut pipeline = DetectionPipeline::new(detection_config(10), 16).unwrap();
        let cfg = CaptureConfig {
            queue_capacity: 16,
            ..fast_config(3)
        };
        pipeline
            .start_with_source(scripted_opener(Vec::new()), CaptureFilter::match_all(), &cfg)
            .unwrap();
        assert!(pipeline
            .start_with_source(scripted_opener(Vec::new()), CaptureFilter::match_all(), &cfg)
            .is_err());
        pipeline.stop();
    }
}
