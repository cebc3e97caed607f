//! Packet capture engine.
//!
//! One producer thread reads from a [`PacketSource`], applies the capture
//! filter and pushes into the [`IngestionQueue`]. With the `libpcap` feature a
//! live source compiles the filter to BPF and the kernel does the filtering;
//! otherwise the expression is matched in userspace by [`CaptureFilter`].
//! Source errors are counted;
//! below the threshold the source is reopened with exponential backoff,
//! at the threshold capture stops for good and the fault is kept for
//! [`CaptureEngine::status`].

use std::io::ErrorKind;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError};
use log::{debug, error, info, warn};
use parking_lot::Mutex;
use pnet::datalink::{self, Channel::Ethernet, DataLinkReceiver, NetworkInterface};
use serde::Serialize;

use crate::config::CaptureConfig;
use crate::error::{DetectorError, Result};
use crate::filter::CaptureFilter;
use crate::packet::{parse_frame, PacketRecord};
use crate::queue::IngestionQueue;

/// Granularity of interruptible sleeps in the capture thread.
const SLEEP_SLICE: Duration = Duration::from_millis(20);

pub trait PacketSource: Send {
    /// Blocks up to the source's read timeout. `Ok(None)` means nothing usable
    /// arrived: a timeout or a frame that did not decode.
    fn next_packet(&mut self) -> Result<Option<PacketRecord>>;
}

/// Opens (and later reopens) the packet source.
pub type SourceOpener = Box<dyn FnMut() -> Result<Box<dyn PacketSource>> + Send>;

/// Live capture through a `pnet` datalink channel.
pub struct PnetSource {
    interface: String,
    rx: Box<dyn DataLinkReceiver>,
}

impl PnetSource {
    pub fn open(interface: &NetworkInterface, cfg: &CaptureConfig) -> Result<Self> {
        let config = datalink::Config {
            read_timeout: Some(cfg.read_timeout()),
            promiscuous: cfg.promiscuous,
            ..Default::default()
        };

        match datalink::channel(interface, config) {
            Ok(Ethernet(_, rx)) => {
                debug!("Opened datalink channel on {}", interface.name);
                Ok(Self {
                    interface: interface.name.clone(),
                    rx,
                })
            }
            Ok(_) => Err(DetectorError::CaptureFault(format!(
                "unsupported channel type on {}",
                interface.name
            ))),
            Err(e) => Err(DetectorError::CaptureFault(format!(
                "failed to open {}: {}",
                interface.name, e
            ))),
        }
    }
}

impl PacketSource for PnetSource {
    fn next_packet(&mut self) -> Result<Option<PacketRecord>> {
        match self.rx.next() {
            Ok(frame) => Ok(parse_frame(frame)),
            Err(e)
                if matches!(
                    e.kind(),
                    ErrorKind::TimedOut | ErrorKind::WouldBlock | ErrorKind::Interrupted
                ) =>
            {
                Ok(None)
            }
            Err(e) => Err(DetectorError::CaptureFault(format!(
                "read on {} failed: {}",
                self.interface, e
            ))),
        }
    }
}

/// Live capture through libpcap with the filter compiled to BPF.
#[cfg(feature = "libpcap")]
pub struct PcapSource {
    interface: String,
    cap: pcap::Capture<pcap::Active>,
}

#[cfg(feature = "libpcap")]
impl PcapSource {
    pub fn open(interface: &str, filter: &str, cfg: &CaptureConfig) -> Result<Self> {
        let read_timeout_ms = i32::try_from(cfg.read_timeout_ms).unwrap_or(i32::MAX);
        let mut cap = pcap::Capture::from_device(interface)
            .and_then(|cap| {
                cap.promisc(cfg.promiscuous)
                    .timeout(read_timeout_ms)
                    .immediate_mode(true)
                    .open()
            })
            .map_err(|e| {
                DetectorError::CaptureFault(format!("failed to open {}: {}", interface, e))
            })?;
        cap.filter(filter, true).map_err(|e| {
            DetectorError::Config(format!("invalid capture filter '{}': {}", filter, e))
        })?;
        debug!("Opened pcap capture on {} with filter '{}'", interface, filter);
        Ok(Self {
            interface: interface.to_string(),
            cap,
        })
    }
}

#[cfg(feature = "libpcap")]
impl PacketSource for PcapSource {
    fn next_packet(&mut self) -> Result<Option<PacketRecord>> {
        match self.cap.next_packet() {
            Ok(packet) => Ok(parse_frame(packet.data)),
            Err(pcap::Error::TimeoutExpired) => Ok(None),
            Err(e) => Err(DetectorError::CaptureFault(format!(
                "read on {} failed: {}",
                self.interface, e
            ))),
        }
    }
}

/// Opener for a live interface with a kernel-side filter.
#[cfg(feature = "libpcap")]
pub fn pcap_opener(interface: String, filter: String, cfg: CaptureConfig) -> SourceOpener {
    Box::new(move || {
        Ok(Box::new(PcapSource::open(&interface, &filter, &cfg)?) as Box<dyn PacketSource>)
    })
}

/// Rejects a malformed filter expression before anything is opened.
#[cfg(feature = "libpcap")]
pub fn check_filter(expr: &str) -> Result<()> {
    let dead = pcap::Capture::dead(pcap::Linktype::ETHERNET)
        .map_err(|e| DetectorError::CaptureFault(format!("libpcap unavailable: {}", e)))?;
    dead.compile(expr, true)
        .map(|_| ())
        .map_err(|e| DetectorError::Config(format!("invalid capture filter '{}': {}", expr, e)))
}

#[cfg(not(feature = "libpcap"))]
pub fn check_filter(expr: &str) -> Result<()> {
    CaptureFilter::parse(expr).map(|_| ())
}

pub fn find_interface(name: &str) -> Result<NetworkInterface> {
    datalink::interfaces()
        .into_iter()
        .find(|iface| iface.name == name)
        .ok_or_else(|| DetectorError::CaptureFault(format!("no such interface: {}", name)))
}

/// Opener for a live interface; every call opens a fresh channel.
pub fn pnet_opener(interface: NetworkInterface, cfg: CaptureConfig) -> SourceOpener {
    Box::new(move || {
        Ok(Box::new(PnetSource::open(&interface, &cfg)?) as Box<dyn PacketSource>)
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum CaptureState {
    Stopped,
    Starting,
    Running,
    Degraded,
    Stopping,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CaptureStatus {
    pub state: CaptureState,
    pub error_count: u32,
    pub packets_captured: u64,
    pub packets_filtered: u64,
    pub reopen_attempts: u64,
    pub fatal_error: Option<String>,
}

/// Everything the capture thread and its controller both mutate.
#[derive(Debug)]
struct SharedState {
    state: CaptureState,
    error_count: u32,
    running: bool,
    fatal_error: Option<String>,
    /// Bumped on every start so an abandoned thread cannot touch a newer run.
    run_id: u64,
}

#[derive(Debug, Default)]
struct Counters {
    captured: AtomicU64,
    filtered: AtomicU64,
    reopen_attempts: AtomicU64,
}

struct WorkerHandle {
    thread: JoinHandle<Result<()>>,
    done: Receiver<()>,
    stop_timeout: Duration,
}

pub struct CaptureEngine {
    queue: Arc<IngestionQueue>,
    shared: Arc<Mutex<SharedState>>,
    counters: Arc<Counters>,
    worker: Option<WorkerHandle>,
}

impl CaptureEngine {
    pub fn new(queue: Arc<IngestionQueue>) -> Self {
        Self {
            queue,
            shared: Arc::new(Mutex::new(SharedState {
                state: CaptureState::Stopped,
                error_count: 0,
                running: false,
                fatal_error: None,
                run_id: 0,
            })),
            counters: Arc::new(Counters::default()),
            worker: None,
        }
    }

    /// Spawns the capture thread. Rejected while a previous capture is still
    /// active.
    pub fn start(
        &mut self,
        opener: SourceOpener,
        filter: CaptureFilter,
        cfg: &CaptureConfig,
    ) -> Result<()> {
        if cfg.error_threshold == 0 {
            return Err("capture error threshold must be at least 1".into());
        }
        let run_id = {
            let mut shared = self.shared.lock();
            if shared.state != CaptureState::Stopped {
                return Err(DetectorError::Config(format!(
                    "capture already active ({:?})",
                    shared.state
                )));
            }
            shared.state = CaptureState::Starting;
            shared.running = true;
            shared.error_count = 0;
            shared.fatal_error = None;
            shared.run_id += 1;
            shared.run_id
        };
        // a previous thread that ended on its own has already signalled done
        if let Some(previous) = self.worker.take() {
            let _ = previous.thread.join();
        }

        let (done_tx, done_rx) = bounded(1);
        let filter_text = filter.as_str().to_string();
        let mut worker = CaptureWorker {
            opener,
            filter,
            queue: Arc::clone(&self.queue),
            shared: Arc::clone(&self.shared),
            counters: Arc::clone(&self.counters),
            cfg: cfg.clone(),
            run_id,
        };
        let shared = Arc::clone(&self.shared);

        let spawned = thread::Builder::new().name("capture".into()).spawn(move || {
            let result = worker.run();
            if let Err(e) = &result {
                error!("💥 Capture stopped: {}", e);
            }
            {
                let mut shared = shared.lock();
                if shared.run_id == run_id {
                    shared.state = CaptureState::Stopped;
                    shared.running = false;
                }
            }
            let _ = done_tx.send(());
            result
        });

        match spawned {
            Ok(thread) => {
                info!("🚀 Capture started (filter: '{}')", filter_text);
                self.worker = Some(WorkerHandle {
                    thread,
                    done: done_rx,
                    stop_timeout: cfg.stop_timeout(),
                });
                Ok(())
            }
            Err(e) => {
                let mut shared = self.shared.lock();
                shared.state = CaptureState::Stopped;
                shared.running = false;
                Err(e.into())
            }
        }
    }

    /// Signals the capture thread and waits for it up to the configured stop
    /// timeout. A thread that does not finish in time is abandoned.
    pub fn stop(&mut self) {
        let timeout = match &self.worker {
            Some(worker) => worker.stop_timeout,
            None => return,
        };
        self.stop_within(timeout);
    }

    /// [`stop`](Self::stop) with an explicit bound on the wait.
    pub fn stop_within(&mut self, timeout: Duration) {
        let Some(worker) = self.worker.take() else {
            return;
        };
        {
            let mut shared = self.shared.lock();
            shared.running = false;
            if shared.state != CaptureState::Stopped {
                shared.state = CaptureState::Stopping;
            }
        }

        match worker.done.recv_timeout(timeout) {
            Ok(()) | Err(RecvTimeoutError::Disconnected) => match worker.thread.join() {
                Ok(Ok(())) => info!("🛑 Capture stopped"),
                Ok(Err(e)) => debug!("Capture thread had already failed: {}", e),
                Err(_) => error!("Capture thread panicked"),
            },
            Err(RecvTimeoutError::Timeout) => {
                warn!("Capture thread did not stop within {:?}, abandoning it", timeout);
            }
        }
        self.shared.lock().state = CaptureState::Stopped;
    }

    pub fn status(&self) -> CaptureStatus {
        let shared = self.shared.lock();
        CaptureStatus {
            state: shared.state,
            error_count: shared.error_count,
            packets_captured: self.counters.captured.load(Ordering::Relaxed),
            packets_filtered: self.counters.filtered.load(Ordering::Relaxed),
            reopen_attempts: self.counters.reopen_attempts.load(Ordering::Relaxed),
            fatal_error: shared.fatal_error.clone(),
        }
    }

    pub fn state(&self) -> CaptureState {
        self.shared.lock().state
    }

    pub fn fatal_error(&self) -> Option<String> {
        self.shared.lock().fatal_error.clone()
    }

    pub fn monitor(&self) -> CaptureMonitor {
        CaptureMonitor {
            shared: Arc::clone(&self.shared),
        }
    }
}

/// Read-only view of the engine state for other threads.
#[derive(Clone)]
pub struct CaptureMonitor {
    shared: Arc<Mutex<SharedState>>,
}

impl CaptureMonitor {
    pub fn state(&self) -> CaptureState {
        self.shared.lock().state
    }

    pub fn fatal_error(&self) -> Option<String> {
        self.shared.lock().fatal_error.clone()
    }
}

impl Drop for CaptureEngine {
    fn drop(&mut self) {
        self.stop();
    }
}

struct CaptureWorker {
    opener: SourceOpener,
    filter: CaptureFilter,
    queue: Arc<IngestionQueue>,
    shared: Arc<Mutex<SharedState>>,
    counters: Arc<Counters>,
    cfg: CaptureConfig,
    run_id: u64,
}

impl CaptureWorker {
    fn run(&mut self) -> Result<()> {
        let mut source: Option<Box<dyn PacketSource>> = None;

        while self.is_running() {
            if source.is_none() {
                source = self.open_with_backoff()?;
                continue;
            }
            let next = match source.as_mut() {
                Some(active) => active.next_packet(),
                None => continue,
            };

            match next {
                Ok(Some(packet)) => self.handle_packet(packet),
                Ok(None) => {}
                Err(e) => {
                    source = None;
                    self.record_fault(&e)?;
                    self.sleep_while_running(self.cfg.retry_delay());
                }
            }
        }
        Ok(())
    }

    fn handle_packet(&self, packet: PacketRecord) {
        self.counters.captured.fetch_add(1, Ordering::Relaxed);
        if !self.filter.matches(&packet) {
            self.counters.filtered.fetch_add(1, Ordering::Relaxed);
            return;
        }
        // overflow is counted by the queue and is not a capture fault
        if self.queue.push(packet).is_ok() {
            self.reset_errors();
        }
    }

    fn reset_errors(&self) {
        let mut shared = self.shared.lock();
        if shared.run_id != self.run_id {
            return;
        }
        if shared.error_count > 0 || shared.state != CaptureState::Running {
            if shared.error_count > 0 {
                info!("✅ Capture recovered after {} fault(s)", shared.error_count);
            }
            shared.error_count = 0;
            if matches!(shared.state, CaptureState::Starting | CaptureState::Degraded) {
                shared.state = CaptureState::Running;
            }
        }
    }

    /// Counts one fault. Reaching the threshold is fatal.
    fn record_fault(&self, err: &DetectorError) -> Result<()> {
        let mut shared = self.shared.lock();
        if shared.run_id != self.run_id {
            return Ok(());
        }
        shared.error_count += 1;
        let count = shared.error_count;
        error!("Capture fault {}/{}: {}", count, self.cfg.error_threshold, err);

        if count >= self.cfg.error_threshold {
            let message = format!("{} consecutive capture faults, last: {}", count, err);
            shared.fatal_error = Some(message.clone());
            shared.running = false;
            shared.state = CaptureState::Stopping;
            return Err(DetectorError::CaptureFault(message));
        }
        if shared.state == CaptureState::Running || shared.state == CaptureState::Starting {
            shared.state = CaptureState::Degraded;
        }
        Ok(())
    }

    /// One recovery cycle: up to `max_retries` opens with exponential backoff
    /// between failures. `Ok(None)` when the cycle gave up or shutdown was
    /// requested.
    fn open_with_backoff(&mut self) -> Result<Option<Box<dyn PacketSource>>> {
        let attempts = self.cfg.max_retries.max(1);
        for attempt in 0..attempts {
            if !self.is_running() {
                return Ok(None);
            }
            self.counters.reopen_attempts.fetch_add(1, Ordering::Relaxed);
            match (self.opener)() {
                Ok(source) => {
                    let mut shared = self.shared.lock();
                    if shared.run_id == self.run_id && shared.state == CaptureState::Starting {
                        shared.state = CaptureState::Running;
                    }
                    drop(shared);
                    if attempt > 0 {
                        info!("Capture source reopened after {} attempt(s)", attempt + 1);
                    }
                    return Ok(Some(source));
                }
                Err(e) => {
                    self.record_fault(&e)?;
                    let delay = self.cfg.backoff(attempt);
                    debug!("Reopen attempt {} failed, retrying in {:?}", attempt + 1, delay);
                    self.sleep_while_running(delay);
                }
            }
        }

        warn!("Giving up after {} reopen attempts, starting a new cycle", attempts);
        self.sleep_while_running(self.cfg.retry_delay());
        Ok(None)
    }

    fn is_running(&self) -> bool {
        let shared = self.shared.lock();
        shared.running && shared.run_id == self.run_id
    }

    fn sleep_while_running(&self, duration: Duration) {
        let deadline = Instant::now() + duration;
        loop {
            let now = Instant::now();
            if now >= deadline || !self.is_running() {
                return;
            }
            thread::sleep(SLEEP_SLICE.min(deadline - now));
        }
    }
}
