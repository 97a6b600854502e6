//! Page-lifetime accounting across the transport release boundary
//!
//! A block handed to the transport is referenced by hint clones; the
//! peer releases them from an unspecified thread at an unspecified time.
//! The usage record embedded in the page's reserved area tracks those
//! references with single-word atomics so that release is lock-free, and
//! a magic sentinel makes operations on already-released pages harmless.

use std::sync::atomic::{AtomicI32, AtomicU32, AtomicU64, Ordering};

use crate::block::PageRef;
use crate::util::monotonic_micros;

/// Sentinel: the usage record is live and the page's data is immutable
const MAGIC_ACTIVE: u32 = 0xAA;
/// Sentinel: the record was finalized; further inc/dec are no-ops
const MAGIC_INACTIVE: u32 = 0x00;

/// Per-page transport usage record, embedded in the page reserved area.
#[derive(Debug)]
#[repr(C)]
pub struct PageUsage {
    magic: AtomicU32,
    refcount: AtomicI32,
    t0_us: AtomicU64,
    payload_accounted: AtomicU64,
    memory_accounted: AtomicU64,
}

impl PageUsage {
    /// A finalized (inactive) record, as written on page hand-out
    pub(crate) fn new_inactive() -> Self {
        Self {
            magic: AtomicU32::new(MAGIC_INACTIVE),
            refcount: AtomicI32::new(0),
            t0_us: AtomicU64::new(0),
            payload_accounted: AtomicU64::new(0),
            memory_accounted: AtomicU64::new(0),
        }
    }

    /// True while the record is live
    pub fn is_active(&self) -> bool {
        self.magic.load(Ordering::Acquire) == MAGIC_ACTIVE
    }

    /// Outstanding transport references
    pub fn refcount(&self) -> i32 {
        self.refcount.load(Ordering::Acquire)
    }

    /// Payload bytes accounted so far
    pub fn payload_accounted(&self) -> u64 {
        self.payload_accounted.load(Ordering::Relaxed)
    }

    /// Memory bytes accounted at init
    pub fn memory_accounted(&self) -> u64 {
        self.memory_accounted.load(Ordering::Relaxed)
    }
}

/// Arm the usage record of `block` before its first transport reference.
pub fn init(block: &PageRef, memory_size: u64) {
    let u = block.usage();
    u.refcount.store(0, Ordering::Relaxed);
    u.t0_us.store(0, Ordering::Relaxed);
    u.payload_accounted.store(0, Ordering::Relaxed);
    u.memory_accounted.store(memory_size, Ordering::Relaxed);
    u.magic.store(MAGIC_ACTIVE, Ordering::Release);
}

/// Add one transport reference to `block`, accounting `payload_delta`
/// payload bytes. No-op on a non-armed record.
pub fn inc(block: &PageRef, payload_delta: u64) {
    let u = block.usage();
    if !u.is_active() {
        return;
    }
    let stats = block.stats();
    if u.refcount.fetch_add(1, Ordering::AcqRel) == 0 {
        u.t0_us.store(monotonic_micros(), Ordering::Relaxed);
        stats.pages_pending.fetch_add(1, Ordering::Relaxed);
        stats.notify.fetch_add(1, Ordering::Relaxed);
        stats
            .memory_pending_bytes
            .fetch_add(u.memory_accounted.load(Ordering::Relaxed) as i64, Ordering::Relaxed);
    }
    u.payload_accounted.fetch_add(payload_delta, Ordering::Relaxed);
    stats
        .payload_pending_bytes
        .fetch_add(payload_delta as i64, Ordering::Relaxed);
}

/// Drop one transport reference from `block`; the last drop finalizes
/// the record and the global pending counters. No-op on a non-armed
/// record, so a late release of an already-recycled page is harmless.
pub fn dec(block: &PageRef) {
    let u = block.usage();
    if !u.is_active() {
        return;
    }
    let stats = block.stats();
    if u.refcount.fetch_sub(1, Ordering::AcqRel) == 1 {
        stats.pages_pending.fetch_sub(1, Ordering::Relaxed);
        stats.pages_released.fetch_add(1, Ordering::Relaxed);
        let elapsed = monotonic_micros().saturating_sub(u.t0_us.load(Ordering::Relaxed));
        stats
            .pages_pending_time_us
            .fetch_add(elapsed, Ordering::Relaxed);
        stats.payload_pending_bytes.fetch_sub(
            u.payload_accounted.load(Ordering::Relaxed) as i64,
            Ordering::Relaxed,
        );
        stats.memory_pending_bytes.fetch_sub(
            u.memory_accounted.load(Ordering::Relaxed) as i64,
            Ordering::Relaxed,
        );
        stats.notify.fetch_add(1, Ordering::Relaxed);
        u.magic.store(MAGIC_INACTIVE, Ordering::Release);
    }
}
