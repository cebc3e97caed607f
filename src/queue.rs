// Bounded hand-off between the capture thread and the detection consumer.
// Push never blocks: a full queue drops the packet and counts it.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender, TrySendError};

use crate::error::{DetectorError, Result};
use crate::packet::PacketRecord;

pub const DEFAULT_QUEUE_CAPACITY: usize = 1000;

pub struct IngestionQueue {
    tx: Sender<PacketRecord>,
    rx: Receiver<PacketRecord>,
    capacity: usize,
    pushed: AtomicU64,
    dropped: AtomicU64,
}

impl IngestionQueue {
    pub fn new(capacity: usize) -> Result<Self> {
        if capacity == 0 {
            return Err(DetectorError::Config("queue capacity must be at least 1".into()));
        }
        let (tx, rx) = bounded(capacity);
        Ok(Self {
            tx,
            rx,
            capacity,
            pushed: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
        })
    }

    /// Non-blocking enqueue. A full queue rejects the packet with
    /// [`DetectorError::QueueOverflow`] and bumps the drop counter.
    pub fn push(&self, packet: PacketRecord) -> Result<()> {
        match self.tx.try_send(packet) {
            Ok(()) => {
                self.pushed.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            Err(TrySendError::Full(_)) | Err(TrySendError::Disconnected(_)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                Err(DetectorError::QueueOverflow { capacity: self.capacity })
            }
        }
    }

    /// Waits up to `timeout` for the next packet.
    pub fn pop(&self, timeout: Duration) -> Option<PacketRecord> {
        match self.rx.recv_timeout(timeout) {
            Ok(packet) => Some(packet),
            Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => None,
        }
    }

    pub fn try_pop(&self) -> Option<PacketRecord> {
        self.rx.try_recv().ok()
    }

    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn pushed(&self) -> u64 {
        self.pushed.load(Ordering::Relaxed)
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}
