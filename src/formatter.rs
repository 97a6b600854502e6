//! Sub-timeframe formatter: turns one DataSet into one STF message
//!
//! The heartbeat-grouped layout is built in two passes. Pass A fills
//! the STF header record and the size accounting from the block headers
//! while validating each page's RDH chain. Pass B walks the packet
//! chains again, grouping contiguous byte ranges by heartbeat orbit:
//! an HBF contained in one page is emitted zero-copy, an HBF straddling
//! pages is repacked into a scratch page drawn from the pool.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::block::{DataSet, PageRef};
use crate::error::{Result, SubframeError};
use crate::lifetime;
use crate::pool::PagePool;
use crate::rdh::{self, RawDataHeader, RDH_SIZE};
use crate::stats::{CounterStats, ReadoutStats};
use crate::stf::{StfHeader, StfMessage, STF_HEADER_SIZE};
use crate::transport::MessagePart;
use crate::util::RateLimitedToken;

/// A contiguous run of bytes in one source page belonging to the
/// heartbeat frame currently being assembled.
struct PendingFrame {
    block: PageRef,
    start: usize,
    len: usize,
}

/// Formats DataSets into heartbeat-grouped STF messages.
///
/// Shared by the inline path and the worker lanes; all mutable state is
/// per-call or atomic.
#[derive(Debug)]
pub struct Formatter {
    pool: PagePool,
    enable_packed_copy: bool,
    stats: Arc<ReadoutStats>,
    repack_size: CounterStats,
    pages_used_for_repack: AtomicU64,
    link_mismatch_token: RateLimitedToken,
    alloc_fail_token: RateLimitedToken,
}

impl Formatter {
    /// Create a formatter drawing scratch pages from `pool`
    pub fn new(pool: PagePool, enable_packed_copy: bool) -> Self {
        let stats = Arc::clone(pool.readout_stats());
        Self {
            pool,
            enable_packed_copy,
            stats,
            repack_size: CounterStats::new(),
            pages_used_for_repack: AtomicU64::new(0),
            link_mismatch_token: RateLimitedToken::new(Duration::from_secs(10)),
            alloc_fail_token: RateLimitedToken::new(Duration::from_secs(10)),
        }
    }

    /// Distribution of repack copy sizes
    pub fn repack_size_stats(&self) -> &CounterStats {
        &self.repack_size
    }

    /// Scratch pages drawn for repack so far
    pub fn pages_used_for_repack(&self) -> u64 {
        self.pages_used_for_repack.load(Ordering::Relaxed)
    }

    /// Format `ds` into one heartbeat-grouped STF message.
    ///
    /// On any allocation failure the partially built message is dropped,
    /// releasing every reference it took.
    pub fn format_dataset(&self, ds: &DataSet) -> Result<StfMessage> {
        if ds.is_empty() {
            return Err(SubframeError::format_failure("empty DataSet"));
        }
        let header_page = self
            .pool
            .acquire()
            .ok_or_else(|| SubframeError::pool_exhausted(self.pool.name().to_string()))?;

        let mut msg = StfMessage {
            memory_size: header_page.buffer_size() as u64,
            ..Default::default()
        };
        let stf = self.fill_header(ds, &mut msg);
        msg.timeframe_id = stf.timeframe_id;
        msg.total_size = STF_HEADER_SIZE as u64 + msg.data_size;

        // the header page content must be complete before the first
        // transport reference is taken
        header_page.write_data(0, &stf.to_bytes())?;
        header_page.with_header_mut(|h| {
            h.timeframe_id = stf.timeframe_id;
            h.data_size = STF_HEADER_SIZE as u32;
        });
        lifetime::init(&header_page, header_page.buffer_size() as u64);
        lifetime::inc(&header_page, STF_HEADER_SIZE as u64);
        msg.parts
            .push(MessagePart::from_block(&header_page, 0, STF_HEADER_SIZE));
        msg.wire_size += STF_HEADER_SIZE as u64;

        self.emit_heartbeat_frames(ds, &mut msg)?;
        Ok(msg)
    }

    /// Pass A: populate the STF header record and the message sizes,
    /// validating each page's packet chain.
    fn fill_header(&self, ds: &DataSet, msg: &mut StfMessage) -> StfHeader {
        let mut stf = StfHeader::default();
        let mut first = true;
        for block in ds {
            let h = block.header();
            msg.memory_size += block.buffer_size() as u64;
            msg.data_size += h.data_size as u64;

            if h.flag_end_of_timeframe != 0 {
                stf.last_tf_message = 1;
            }

            if first {
                stf.timeframe_id = h.timeframe_id;
                stf.run_number = h.run_number;
                stf.system_id = h.system_id;
                stf.fee_id = h.fee_id;
                stf.equipment_id = h.equipment_id;
                stf.link_id = h.link_id;
                stf.timeframe_orbit_first = h.timeframe_orbit_first;
                stf.timeframe_orbit_last = h.timeframe_orbit_last;
                stf.is_rdh_format = h.is_rdh_format;
                first = false;
            } else {
                if stf.timeframe_id != h.timeframe_id {
                    tracing::warn!(
                        expected = stf.timeframe_id,
                        got = h.timeframe_id,
                        "timeframe id mismatch within DataSet"
                    );
                }
                if stf.link_id != h.link_id {
                    tracing::warn!(
                        expected = stf.link_id,
                        got = h.link_id,
                        "link id mismatch within DataSet"
                    );
                }
            }

            rdh::scan_packets(block.data(), h.data_size as usize, |offset, rdh| {
                if rdh.link_id != stf.link_id {
                    if let Some(suppressed) = self.link_mismatch_token.fire() {
                        tracing::warn!(
                            timeframe_id = stf.timeframe_id,
                            equipment_id = stf.equipment_id,
                            expected = stf.link_id,
                            got = rdh.link_id,
                            offset,
                            suppressed,
                            "RDH link id mismatch"
                        );
                    }
                }
            });
        }
        stf
    }

    /// Pass B: walk the packet chains, cutting one message per
    /// heartbeat frame.
    fn emit_heartbeat_frames(&self, ds: &DataSet, msg: &mut StfMessage) -> Result<()> {
        let mut pending: Vec<PendingFrame> = Vec::new();
        let mut copy_buffer: Option<PageRef> = None;
        let mut last_hb: Option<u32> = None;
        let mut last_tf: Option<u64> = None;

        for block in ds {
            let h = block.header();
            lifetime::init(block, block.buffer_size() as u64);

            // a stray TF change mid-DataSet starts its repacks on a
            // fresh scratch page
            if last_tf.is_some_and(|tf| tf != h.timeframe_id) {
                copy_buffer = None;
            }
            last_tf = Some(h.timeframe_id);

            let data_size = (h.data_size as usize).min(block.capacity());
            let mut hb_start = 0usize;
            let mut offset = 0usize;
            while offset + RDH_SIZE <= data_size {
                let Some(packet) = RawDataHeader::read_from(&block.data()[offset..]) else {
                    break;
                };
                if last_hb != Some(packet.heartbeat_orbit) {
                    let hb_len = offset - hb_start;
                    if hb_len > 0 {
                        pending.push(PendingFrame {
                            block: block.clone(),
                            start: hb_start,
                            len: hb_len,
                        });
                    }
                    self.collect_pending(&mut pending, &mut copy_buffer, msg)?;
                    hb_start = offset;
                    last_hb = Some(packet.heartbeat_orbit);
                }
                if packet.offset_next_packet == 0 {
                    break;
                }
                offset += packet.offset_next_packet as usize;
            }

            // the tail may continue in the next block
            if hb_start < data_size {
                pending.push(PendingFrame {
                    block: block.clone(),
                    start: hb_start,
                    len: data_size - hb_start,
                });
            }

            // a finished timeframe forces the next repack onto a fresh
            // scratch page
            if h.flag_end_of_timeframe != 0 {
                copy_buffer = None;
            }
        }

        self.collect_pending(&mut pending, &mut copy_buffer, msg)
    }

    /// Emit the accumulated frame: zero-copy when it lives in one page,
    /// repacked into a scratch page when it spans several.
    fn collect_pending(
        &self,
        pending: &mut Vec<PendingFrame>,
        copy_buffer: &mut Option<PageRef>,
        msg: &mut StfMessage,
    ) -> Result<()> {
        match pending.len() {
            0 => return Ok(()),
            1 => {
                let frame = &pending[0];
                lifetime::inc(&frame.block, frame.len as u64);
                msg.parts
                    .push(MessagePart::from_block(&frame.block, frame.start, frame.len));
                msg.wire_size += frame.len as u64;
            }
            _ => {
                self.stats.hbf_repacked.fetch_add(1, Ordering::Relaxed);
                let total: usize = pending.iter().map(|f| f.len).sum();
                self.repack_size.record(total as u64);

                if total > self.pool.page_data_capacity() {
                    if let Some(suppressed) = self.alloc_fail_token.fire() {
                        tracing::warn!(
                            total,
                            page_capacity = self.pool.page_data_capacity(),
                            suppressed,
                            "heartbeat frame larger than one scratch page"
                        );
                    }
                    pending.clear();
                    return Err(SubframeError::no_room(total, self.pool.page_data_capacity()));
                }

                let (copy_block, new_buffer_bytes) = self.allocate_copy_block(copy_buffer, total)?;
                if new_buffer_bytes > 0 {
                    msg.memory_size += new_buffer_bytes as u64;
                }

                let mut cursor = 0usize;
                for frame in pending.iter() {
                    copy_block
                        .write_data(cursor, &frame.block.data()[frame.start..frame.start + frame.len])?;
                    self.stats
                        .bytes_copied
                        .fetch_add(frame.len as u64, Ordering::Relaxed);
                    cursor += frame.len;
                }
                copy_block.with_header_mut(|h| h.data_size = total as u32);

                lifetime::init(&copy_block, new_buffer_bytes as u64);
                lifetime::inc(&copy_block, total as u64);
                msg.parts.push(MessagePart::from_block(&copy_block, 0, total));
                msg.wire_size += total as u64;
            }
        }
        pending.clear();
        Ok(())
    }

    /// Scratch space for one repack of `total` bytes.
    ///
    /// Packed mode carves a child out of the current scratch page,
    /// falling back once to a fresh page when the cursor has no room.
    /// Returns the block and the newly allocated buffer bytes (0 when an
    /// existing scratch page was reused).
    fn allocate_copy_block(
        &self,
        copy_buffer: &mut Option<PageRef>,
        total: usize,
    ) -> Result<(PageRef, usize)> {
        if self.enable_packed_copy {
            let mut new_buffer_bytes = 0usize;
            for _ in 0..=2 {
                let Some(parent) = copy_buffer.as_ref() else {
                    let page = self.pool.acquire().ok_or_else(|| self.exhausted())?;
                    new_buffer_bytes = page.buffer_size();
                    self.pages_used_for_repack.fetch_add(1, Ordering::Relaxed);
                    *copy_buffer = Some(page);
                    continue;
                };
                match self.pool.acquire_child(parent, total) {
                    Some(child) => return Ok((child, new_buffer_bytes)),
                    None => {
                        *copy_buffer = None;
                        continue;
                    }
                }
            }
            Err(self.exhausted())
        } else {
            let page = self.pool.acquire().ok_or_else(|| self.exhausted())?;
            self.pages_used_for_repack.fetch_add(1, Ordering::Relaxed);
            let bytes = page.buffer_size();
            Ok((page, bytes))
        }
    }

    fn exhausted(&self) -> SubframeError {
        if let Some(suppressed) = self.alloc_fail_token.fire() {
            tracing::warn!(pool = %self.pool.name(), suppressed, "no page left for repack");
        }
        SubframeError::pool_exhausted(self.pool.name().to_string())
    }
}
