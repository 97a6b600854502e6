//! Process-wide readout telemetry counters and sample statistics

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};

/// Telemetry counters for the readout data path.
///
/// All counters are single-word atomics updated lock-free; the struct is
/// shared as one unit (`Arc`) so no pointer to an individual counter can
/// outlive it. One process-global instance exists
/// ([`ReadoutStats::global`]); private instances can be constructed for
/// isolated observation.
#[derive(Debug, Default)]
pub struct ReadoutStats {
    /// Pages currently referenced by the transport peer
    pub pages_pending: AtomicU64,
    /// Pages fully released by the transport peer
    pub pages_released: AtomicU64,
    /// Cumulative microseconds pages spent referenced by the peer
    pub pages_pending_time_us: AtomicU64,
    /// Payload bytes currently pending release
    pub payload_pending_bytes: AtomicI64,
    /// Memory bytes (page-granular) currently pending release
    pub memory_pending_bytes: AtomicI64,
    /// Bytes handed to the transport channel
    pub bytes_sent: AtomicU64,
    /// Timeframe id of the most recently sent STF
    pub last_timeframe_id_sent: AtomicU64,
    /// Incremented whenever a telemetry-relevant event occurs
    pub notify: AtomicU64,
    /// Heartbeat frames that needed a repack copy
    pub hbf_repacked: AtomicU64,
    /// Bytes copied during repack
    pub bytes_copied: AtomicU64,
}

impl ReadoutStats {
    /// Create a private counter set
    pub fn new() -> Self {
        Default::default()
    }

    /// The process-global counter set
    pub fn global() -> &'static Arc<ReadoutStats> {
        static GLOBAL: OnceLock<Arc<ReadoutStats>> = OnceLock::new();
        GLOBAL.get_or_init(|| Arc::new(ReadoutStats::new()))
    }

    /// Record a successful multi-part send of `bytes` for `timeframe_id`
    pub fn record_send(&self, bytes: u64, timeframe_id: u64) {
        self.bytes_sent.fetch_add(bytes, Ordering::Relaxed);
        self.last_timeframe_id_sent
            .store(timeframe_id, Ordering::Relaxed);
        self.notify.fetch_add(1, Ordering::Relaxed);
    }
}

/// Min/max/average statistics over recorded samples.
///
/// Lock-free; used for the repack-size distribution.
#[derive(Debug, Default)]
pub struct CounterStats {
    count: AtomicU64,
    sum: AtomicU64,
    min: AtomicU64,
    max: AtomicU64,
}

impl CounterStats {
    /// Create an empty sample set
    pub fn new() -> Self {
        Default::default()
    }

    /// Record one sample
    pub fn record(&self, value: u64) {
        if self.count.fetch_add(1, Ordering::Relaxed) == 0 {
            self.min.store(value, Ordering::Relaxed);
        } else {
            self.min.fetch_min(value, Ordering::Relaxed);
        }
        self.sum.fetch_add(value, Ordering::Relaxed);
        self.max.fetch_max(value, Ordering::Relaxed);
    }

    /// Number of samples recorded
    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }

    /// Sum of all samples
    pub fn sum(&self) -> u64 {
        self.sum.load(Ordering::Relaxed)
    }

    /// Smallest sample, 0 when empty
    pub fn minimum(&self) -> u64 {
        if self.count() == 0 {
            0
        } else {
            self.min.load(Ordering::Relaxed)
        }
    }

    /// Largest sample, 0 when empty
    pub fn maximum(&self) -> u64 {
        self.max.load(Ordering::Relaxed)
    }

    /// Average sample, 0 when empty
    pub fn average(&self) -> u64 {
        let n = self.count();
        if n == 0 {
            0
        } else {
            self.sum() / n
        }
    }
}
