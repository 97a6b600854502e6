//! Consumer facade: ingest DataSets, format them, ship them downstream

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::bank::{BankManager, MemoryBank};
use crate::block::{DataSet, PageRef};
use crate::error::{Result, SubframeError};
use crate::formatter::Formatter;
use crate::pipeline::{Pipeline, PipelineContext};
use crate::pool::{PagePool, PoolConfig, PoolStats};
use crate::region::{check_resources, UnmanagedRegion};
use crate::stats::ReadoutStats;
use crate::stf::{StfHeader, StfMessage, STF_HEADER_SIZE};
use crate::transport::{Channel, ChannelConfig, ChannelEndpoint, MessagePart};
use crate::util::{parse_byte_size, RateLimitedToken};

/// Layout of the messages produced for one DataSet
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum FormatMode {
    /// One STF header + one message per heartbeat frame, straddling
    /// frames repacked (the default when RDH data is present)
    #[default]
    HbfGrouped,
    /// One message per page, payload only, no STF header
    RawPerPage,
    /// One STF header + one message per page
    StfPerPage,
    /// Two messages per page: block header, then payload
    DatablockPerPage,
}

impl FormatMode {
    /// Map the numeric `enableRawFormat` option (0..=3)
    pub fn from_option(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::HbfGrouped),
            1 => Some(Self::RawPerPage),
            2 => Some(Self::StfPerPage),
            3 => Some(Self::DatablockPerPage),
            _ => None,
        }
    }
}

/// Consumer configuration surface
#[derive(Debug, Clone)]
pub struct ConsumerConfig {
    /// Consumer name, used in diagnostics and thread names
    pub name: String,
    /// Build nothing, drop input (performance mode)
    pub disable_sending: bool,
    /// Message layout per DataSet
    pub format_mode: FormatMode,
    /// Outbound channel wiring
    pub channel: ChannelConfig,
    /// Size of the unmanaged shared region, as a byte string ("1G");
    /// none means no region is created
    pub unmanaged_memory_size: Option<String>,
    /// Comma-separated paths / meminfo keys verified before region
    /// creation
    pub check_resources: String,
    /// Bank to draw the page pool from; empty uses the consumer name
    /// when a region is created
    pub memory_bank_name: String,
    /// Page size as a byte string
    pub memory_pool_page_size: String,
    /// Number of pool pages
    pub memory_pool_number_of_pages: usize,
    /// Reuse a repack scratch page for several copies (space allowing)
    pub enable_packed_copy: bool,
    /// Worker lanes; 0 formats inline on the caller thread
    pub threads: usize,
    /// Per-lane FIFO depth; defaults to `88 / threads`
    pub pipeline_fifo_size: Option<usize>,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            name: "readout-consumer".to_string(),
            disable_sending: false,
            format_mode: FormatMode::default(),
            channel: ChannelConfig::default(),
            unmanaged_memory_size: None,
            check_resources: String::new(),
            memory_bank_name: String::new(),
            memory_pool_page_size: "128k".to_string(),
            memory_pool_number_of_pages: 100,
            enable_packed_copy: true,
            threads: 0,
            pipeline_fifo_size: None,
        }
    }
}

impl ConsumerConfig {
    /// Create a configuration with a custom consumer name
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    /// Set the format mode
    pub fn with_format_mode(mut self, mode: FormatMode) -> Self {
        self.format_mode = mode;
        self
    }

    /// Set the worker lane count
    pub fn with_threads(mut self, threads: usize) -> Self {
        self.threads = threads;
        self
    }

    /// Set the pool geometry
    pub fn with_pool(mut self, page_size: impl Into<String>, pages: usize) -> Self {
        self.memory_pool_page_size = page_size.into();
        self.memory_pool_number_of_pages = pages;
        self
    }
}

/// Per-consumer event counters
#[derive(Debug, Default)]
pub struct ConsumerCounters {
    push_success: AtomicU64,
    push_error: AtomicU64,
    pages_input: AtomicU64,
    stf_sent: AtomicU64,
}

impl ConsumerCounters {
    pub(crate) fn record_push_error(&self) {
        self.push_error.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_stf_sent(&self) {
        self.stf_sent.fetch_add(1, Ordering::Relaxed);
    }

    /// Accepted `push_data` calls
    pub fn push_success(&self) -> u64 {
        self.push_success.load(Ordering::Relaxed)
    }

    /// Rejected or dropped inputs
    pub fn push_error(&self) -> u64 {
        self.push_error.load(Ordering::Relaxed)
    }

    /// Superpages received
    pub fn pages_input(&self) -> u64 {
        self.pages_input.load(Ordering::Relaxed)
    }

    /// STF messages handed to the transport
    pub fn stf_sent(&self) -> u64 {
        self.stf_sent.load(Ordering::Relaxed)
    }
}

/// Submit one formatted STF; success updates the wire telemetry.
pub(crate) fn send_stf(
    channel: &Channel,
    stats: &ReadoutStats,
    counters: &ConsumerCounters,
    msg: StfMessage,
) -> Result<()> {
    let StfMessage {
        parts,
        timeframe_id,
        total_size,
        ..
    } = msg;
    match channel.send(parts) {
        Ok(_bytes) => {
            stats.record_send(total_size, timeframe_id);
            counters.record_stf_sent();
            Ok(())
        }
        Err(e) => {
            tracing::error!(timeframe_id, error = %e, "sending failed");
            Err(e)
        }
    }
}

#[derive(Debug)]
struct ProducerState {
    current_tf: Option<u64>,
    /// `None` once the current timeframe was flushed to a lane
    buffer: Option<Vec<DataSet>>,
}

/// The sub-timeframe consumer.
///
/// Owns the unmanaged region, the page pool, the formatter and the
/// optional worker pipeline. `push_data` is the single producer entry;
/// the threaded fast path supports one producer stream.
#[derive(Debug)]
pub struct Consumer {
    name: String,
    disable_sending: bool,
    format_mode: FormatMode,
    region: Option<Arc<UnmanagedRegion>>,
    pool: PagePool,
    formatter: Arc<Formatter>,
    channel: Arc<Channel>,
    stats: Arc<ReadoutStats>,
    counters: Arc<ConsumerCounters>,
    pipeline: Option<Pipeline>,
    producer: Mutex<ProducerState>,
    tf_mismatch_token: RateLimitedToken,
    non_contiguous_token: RateLimitedToken,
    pipeline_full_token: RateLimitedToken,
}

impl Consumer {
    /// Create a consumer with the process-global counters and a private
    /// bank registry.
    pub fn new(config: ConsumerConfig) -> Result<Self> {
        Self::with_parts(
            config,
            Arc::clone(ReadoutStats::global()),
            Arc::new(BankManager::new()),
        )
    }

    /// Create a consumer against explicit counters and bank registry.
    pub fn with_parts(
        config: ConsumerConfig,
        stats: Arc<ReadoutStats>,
        banks: Arc<BankManager>,
    ) -> Result<Self> {
        let channel = Arc::new(Channel::new(config.channel.clone())?);

        let page_size = parse_byte_size(&config.memory_pool_page_size)
            .filter(|&v| v > 0)
            .ok_or_else(|| {
                SubframeError::config(
                    "memoryPoolPageSize",
                    format!("bad byte size: {}", config.memory_pool_page_size),
                )
            })? as usize;
        let pool_config = PoolConfig::new(format!("{}-pool", config.name))
            .with_page_size(page_size)
            .with_page_count(config.memory_pool_number_of_pages);
        pool_config.validate()?;
        if page_size - crate::block::PAGE_RESERVED_BYTES < STF_HEADER_SIZE {
            return Err(SubframeError::config(
                "memoryPoolPageSize",
                format!(
                    "page data capacity below the {} byte STF header",
                    STF_HEADER_SIZE
                ),
            ));
        }

        // optional unmanaged region, contributed to the banks so the
        // pool (and possibly equipment pools) draw from it
        let mut region = None;
        let mut bank_name = config.memory_bank_name.clone();
        if let Some(size_str) = &config.unmanaged_memory_size {
            let size = parse_byte_size(size_str).filter(|&v| v > 0).ok_or_else(|| {
                SubframeError::config(
                    "unmanagedMemorySize",
                    format!("bad byte size: {}", size_str),
                )
            })?;
            check_resources(&config.check_resources, size)?;
            let r = Arc::new(UnmanagedRegion::new(
                format!("{}-region", config.name),
                size as usize,
            )?);
            if bank_name.is_empty() {
                bank_name = config.name.clone();
            }
            banks.add_bank(Arc::new(MemoryBank::new(bank_name.as_str(), Arc::clone(&r))))?;
            region = Some(r);
        }

        let pool = banks.paged_pool(pool_config, &bank_name, Arc::clone(&stats))?;
        {
            let consumer_name = config.name.clone();
            pool.set_warning_callback(move |msg| {
                tracing::warn!(consumer = %consumer_name, "{}", msg);
            });
        }
        tracing::info!(
            consumer = %config.name,
            pages = config.memory_pool_number_of_pages,
            page_size,
            packed_copy = config.enable_packed_copy,
            "using memory pool"
        );

        let formatter = Arc::new(Formatter::new(pool.clone(), config.enable_packed_copy));
        let counters = Arc::new(ConsumerCounters::default());

        let pipeline = if config.threads > 0 {
            let fifo_size = config
                .pipeline_fifo_size
                .unwrap_or_else(|| (88 / config.threads).max(1));
            let ctx = Arc::new(PipelineContext {
                name: config.name.clone(),
                formatter: Arc::clone(&formatter),
                channel: Arc::clone(&channel),
                stats: Arc::clone(&stats),
                counters: Arc::clone(&counters),
            });
            Some(Pipeline::start(config.threads, fifo_size, ctx)?)
        } else {
            None
        };

        Ok(Self {
            name: config.name,
            disable_sending: config.disable_sending,
            format_mode: config.format_mode,
            region,
            pool,
            formatter,
            channel,
            stats,
            counters,
            pipeline,
            producer: Mutex::new(ProducerState {
                current_tf: None,
                buffer: None,
            }),
            tf_mismatch_token: RateLimitedToken::new(Duration::from_secs(10)),
            non_contiguous_token: RateLimitedToken::new(Duration::from_secs(10)),
            pipeline_full_token: RateLimitedToken::new(Duration::from_secs(10)),
        })
    }

    /// Consumer name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The pool feeding headers and repack copies
    pub fn pool(&self) -> &PagePool {
        &self.pool
    }

    /// Pool usage snapshot
    pub fn pool_stats(&self) -> PoolStats {
        self.pool.stats()
    }

    /// The unmanaged region, when one was configured
    pub fn region(&self) -> Option<&Arc<UnmanagedRegion>> {
        self.region.as_ref()
    }

    /// Counter set shared with page accounting
    pub fn readout_stats(&self) -> &Arc<ReadoutStats> {
        &self.stats
    }

    /// Per-consumer event counters
    pub fn counters(&self) -> &ConsumerCounters {
        &self.counters
    }

    /// Repack size distribution
    pub fn repack_size_stats(&self) -> &crate::stats::CounterStats {
        self.formatter.repack_size_stats()
    }

    /// Peer endpoint of the outbound channel
    pub fn endpoint(&self) -> ChannelEndpoint {
        self.channel.endpoint()
    }

    /// Per-block push is not supported; supply a DataSet.
    pub fn push_block(&self, _block: PageRef) -> Result<()> {
        Err(SubframeError::unsupported(
            "per-block push; this consumer needs a DataSet",
        ))
    }

    /// Ingest one DataSet (ordered blocks of one timeframe / equipment /
    /// link). Never blocks; under pressure data is dropped and counted.
    pub fn push_data(&self, ds: DataSet) -> Result<()> {
        self.counters
            .pages_input
            .fetch_add(ds.len() as u64, Ordering::Relaxed);
        if ds.is_empty() {
            return Ok(());
        }
        if self.disable_sending {
            self.counters.push_success.fetch_add(1, Ordering::Relaxed);
            return Ok(());
        }

        let result = match self.format_mode {
            FormatMode::RawPerPage => self.push_raw(&ds),
            FormatMode::DatablockPerPage => self.push_datablock(&ds),
            FormatMode::StfPerPage => self.push_stf_superpage(&ds),
            FormatMode::HbfGrouped => {
                if ds[0].header().is_rdh_format == 0 {
                    // no packet chain to cut, fall back to page granularity
                    self.push_stf_superpage(&ds)
                } else if self.pipeline.is_some() {
                    self.push_threaded(ds)
                } else {
                    self.formatter
                        .format_dataset(&ds)
                        .and_then(|msg| send_stf(&self.channel, &self.stats, &self.counters, msg))
                }
            }
        };
        match result {
            Ok(()) => {
                self.counters.push_success.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            Err(e) => {
                self.counters.record_push_error();
                Err(e)
            }
        }
    }

    fn push_raw(&self, ds: &DataSet) -> Result<()> {
        for block in ds {
            let size = block.header().data_size as usize;
            let part = MessagePart::from_block(block, 0, size.min(block.capacity()));
            let bytes = self.channel.send(vec![part])?;
            self.stats.bytes_sent.fetch_add(bytes as u64, Ordering::Relaxed);
            self.stats.notify.fetch_add(1, Ordering::Relaxed);
        }
        Ok(())
    }

    fn push_datablock(&self, ds: &DataSet) -> Result<()> {
        for block in ds {
            let size = block.header().data_size as usize;
            let parts = vec![
                MessagePart::from_block_header(block),
                MessagePart::from_block(block, 0, size.min(block.capacity())),
            ];
            let bytes = self.channel.send(parts)?;
            self.stats.bytes_sent.fetch_add(bytes as u64, Ordering::Relaxed);
            self.stats.notify.fetch_add(1, Ordering::Relaxed);
        }
        Ok(())
    }

    /// One STF header plus one part per page, no heartbeat scan.
    fn push_stf_superpage(&self, ds: &DataSet) -> Result<()> {
        let header_page = self
            .pool
            .acquire()
            .ok_or_else(|| SubframeError::pool_exhausted(self.pool.name().to_string()))?;
        let (Some(first), Some(last)) = (ds.first(), ds.last()) else {
            return Ok(());
        };
        let (first, last) = (first.header(), last.header());
        let stf = StfHeader {
            timeframe_id: first.timeframe_id,
            run_number: first.run_number,
            system_id: first.system_id,
            fee_id: first.fee_id,
            equipment_id: first.equipment_id,
            link_id: first.link_id,
            timeframe_orbit_first: first.timeframe_orbit_first,
            timeframe_orbit_last: first.timeframe_orbit_last,
            is_rdh_format: first.is_rdh_format,
            last_tf_message: (last.flag_end_of_timeframe != 0) as u8,
            ..Default::default()
        };
        header_page.write_data(0, &stf.to_bytes())?;
        header_page.with_header_mut(|h| {
            h.timeframe_id = stf.timeframe_id;
            h.data_size = STF_HEADER_SIZE as u32;
        });

        let mut parts = Vec::with_capacity(ds.len() + 1);
        parts.push(MessagePart::from_block(&header_page, 0, STF_HEADER_SIZE));
        let mut bytes = STF_HEADER_SIZE as u64;
        for block in ds {
            let size = (block.header().data_size as usize).min(block.capacity());
            parts.push(MessagePart::from_block(block, 0, size));
            bytes += size as u64;
        }
        self.channel.send(parts)?;
        self.stats.record_send(bytes, stf.timeframe_id);
        self.counters.record_stf_sent();
        Ok(())
    }

    /// Threaded path: buffer DataSets per timeframe, hand complete
    /// timeframes to the worker lanes.
    fn push_threaded(&self, ds: DataSet) -> Result<()> {
        let (Some(first), Some(last)) = (ds.first(), ds.last()) else {
            return Ok(());
        };
        let (first, last) = (first.header(), last.header());
        if first.timeframe_id != last.timeframe_id {
            if let Some(suppressed) = self.tf_mismatch_token.fire() {
                tracing::warn!(
                    consumer = %self.name,
                    first = first.timeframe_id,
                    last = last.timeframe_id,
                    suppressed,
                    "DataSet spans two timeframes, dropping"
                );
            }
            return Err(SubframeError::stream_consistency(
                "DataSet spans two timeframes",
            ));
        }

        let mut state = self.producer.lock().unwrap();
        if state.current_tf != Some(first.timeframe_id) {
            self.flush_locked(&mut state);
            if let Some(current) = state.current_tf {
                if first.timeframe_id != current.wrapping_add(1) {
                    if let Some(suppressed) = self.non_contiguous_token.fire() {
                        tracing::warn!(
                            consumer = %self.name,
                            timeframe_id = first.timeframe_id,
                            previous = current,
                            suppressed,
                            "non-contiguous timeframe ordering"
                        );
                    }
                }
            }
            state.current_tf = Some(first.timeframe_id);
            state.buffer = Some(Vec::new());
        }
        let Some(buffer) = state.buffer.as_mut() else {
            // the timeframe was already flushed on its end flag
            return Err(SubframeError::stream_consistency(
                "data after end of timeframe",
            ));
        };
        buffer.push(ds);
        if last.flag_end_of_timeframe != 0 {
            // complete, no need to wait for the next timeframe id
            self.flush_locked(&mut state);
        }
        Ok(())
    }

    /// Push the buffered timeframe to the lane at the write cursor.
    /// A full pipeline drops the timeframe (counted, rate-limited warn).
    fn flush_locked(&self, state: &mut ProducerState) {
        let Some(buffer) = state.buffer.take() else {
            return;
        };
        if buffer.is_empty() {
            return;
        }
        let timeframe_id = state.current_tf.unwrap_or_default();
        let Some(pipeline) = self.pipeline.as_ref() else {
            return;
        };
        if pipeline.dispatch(buffer, timeframe_id).is_err() {
            if let Some(suppressed) = self.pipeline_full_token.fire() {
                tracing::warn!(
                    consumer = %self.name,
                    timeframe_id,
                    suppressed,
                    "dropping timeframe, formatting pipeline full"
                );
            }
            self.counters.record_push_error();
        }
    }
}

impl Drop for Consumer {
    fn drop(&mut self) {
        if let Some(pipeline) = self.pipeline.as_mut() {
            pipeline.shutdown_join();
        }
        let pool = self.pool.stats();
        let repack = self.formatter.repack_size_stats();
        tracing::info!(
            consumer = %self.name,
            stf_sent = self.counters.stf_sent(),
            pages_input = self.counters.pages_input(),
            pages_repack = self.formatter.pages_used_for_repack(),
            repack_count = repack.count(),
            repack_avg = repack.average(),
            repack_max = repack.maximum(),
            pool_free = pool.free,
            pool_total = pool.total,
            "consumer statistics"
        );
    }
}
