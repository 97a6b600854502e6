//! Worker pipeline: N formatting lanes plus one sender lane
//!
//! The producer dispatches complete timeframes round-robin to the lane
//! input FIFOs; each worker formats its timeframe into a message list;
//! the sender drains the lane outputs in the same round-robin order, so
//! the wire sees timeframes in the order the producer dispatched them.
//! Lanes poll with a fixed 1 ms sleep and stop cooperatively on a shared
//! shutdown flag.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crate::block::DataSet;
use crate::consumer::{send_stf, ConsumerCounters};
use crate::error::{Result, SubframeError};
use crate::fifo::Fifo;
use crate::formatter::Formatter;
use crate::stats::ReadoutStats;
use crate::stf::StfMessage;
use crate::transport::Channel;

const LANE_SLEEP: Duration = Duration::from_micros(crate::config::LANE_SLEEP_MICROS);

/// Everything a lane needs, shared with the owning consumer
#[derive(Debug)]
pub(crate) struct PipelineContext {
    pub name: String,
    pub formatter: Arc<Formatter>,
    pub channel: Arc<Channel>,
    pub stats: Arc<ReadoutStats>,
    pub counters: Arc<ConsumerCounters>,
}

#[derive(Debug)]
struct Lane {
    input: Arc<Fifo<Vec<DataSet>>>,
    output: Arc<Fifo<Vec<StfMessage>>>,
}

#[derive(Debug)]
pub(crate) struct Pipeline {
    lanes: Vec<Lane>,
    shutdown: Arc<AtomicBool>,
    write_ix: AtomicUsize,
    workers: Vec<JoinHandle<()>>,
    sender: Option<JoinHandle<()>>,
    ctx: Arc<PipelineContext>,
}

impl Pipeline {
    /// Create lanes and spawn the worker and sender threads.
    pub(crate) fn start(
        threads: usize,
        fifo_size: usize,
        ctx: Arc<PipelineContext>,
    ) -> Result<Pipeline> {
        let mut pipeline = Self::build(threads, fifo_size, ctx);
        pipeline.spawn()?;
        Ok(pipeline)
    }

    /// Create lanes without spawning threads (workers stay idle).
    pub(crate) fn build(threads: usize, fifo_size: usize, ctx: Arc<PipelineContext>) -> Pipeline {
        let lanes = (0..threads)
            .map(|_| Lane {
                input: Arc::new(Fifo::new(fifo_size)),
                output: Arc::new(Fifo::new(fifo_size)),
            })
            .collect();
        Pipeline {
            lanes,
            shutdown: Arc::new(AtomicBool::new(false)),
            write_ix: AtomicUsize::new(0),
            workers: Vec::new(),
            sender: None,
            ctx,
        }
    }

    fn spawn(&mut self) -> Result<()> {
        for (ix, lane) in self.lanes.iter().enumerate() {
            let input = Arc::clone(&lane.input);
            let output = Arc::clone(&lane.output);
            let shutdown = Arc::clone(&self.shutdown);
            let ctx = Arc::clone(&self.ctx);
            let handle = std::thread::Builder::new()
                .name(format!("{}-w-{}", self.ctx.name, ix))
                .spawn(move || worker_loop(&input, &output, &shutdown, &ctx))
                .map_err(|e| SubframeError::from_io(e, "spawning worker lane"))?;
            self.workers.push(handle);
        }
        let outputs: Vec<Arc<Fifo<Vec<StfMessage>>>> =
            self.lanes.iter().map(|l| Arc::clone(&l.output)).collect();
        let shutdown = Arc::clone(&self.shutdown);
        let ctx = Arc::clone(&self.ctx);
        let handle = std::thread::Builder::new()
            .name(format!("{}-s", self.ctx.name))
            .spawn(move || sender_loop(&outputs, &shutdown, &ctx))
            .map_err(|e| SubframeError::from_io(e, "spawning sender lane"))?;
        self.sender = Some(handle);
        Ok(())
    }

    /// Hand a complete timeframe to the lane at the write cursor.
    ///
    /// The cursor advances only on success; a full lane drops the
    /// timeframe.
    pub(crate) fn dispatch(&self, bundle: Vec<DataSet>, timeframe_id: u64) -> Result<()> {
        let ix = self.write_ix.load(Ordering::Relaxed);
        match self.lanes[ix].input.push(bundle) {
            Ok(()) => {
                self.write_ix
                    .store((ix + 1) % self.lanes.len(), Ordering::Relaxed);
                Ok(())
            }
            Err(_dropped) => Err(SubframeError::PipelineFull { timeframe_id }),
        }
    }

    /// Signal shutdown and join every lane. Undrained FIFO content is
    /// dropped, releasing the page handles it holds.
    pub(crate) fn shutdown_join(&mut self) {
        self.shutdown.store(true, Ordering::Release);
        for handle in self.workers.drain(..) {
            let _ = handle.join();
        }
        if let Some(handle) = self.sender.take() {
            let _ = handle.join();
        }
    }

    #[cfg(test)]
    fn lane_input(&self, ix: usize) -> &Fifo<Vec<DataSet>> {
        &self.lanes[ix].input
    }
}

impl Drop for Pipeline {
    fn drop(&mut self) {
        self.shutdown_join();
    }
}

fn worker_loop(
    input: &Fifo<Vec<DataSet>>,
    output: &Fifo<Vec<StfMessage>>,
    shutdown: &AtomicBool,
    ctx: &PipelineContext,
) {
    loop {
        if shutdown.load(Ordering::Acquire) {
            break;
        }
        // wait for an output slot before taking a timeframe
        if output.is_full() {
            std::thread::sleep(LANE_SLEEP);
            continue;
        }
        let Some(bundle) = input.pop() else {
            std::thread::sleep(LANE_SLEEP);
            continue;
        };
        if bundle.is_empty() {
            continue;
        }
        let mut messages = Vec::with_capacity(bundle.len());
        let mut failed = false;
        for ds in &bundle {
            match ctx.formatter.format_dataset(ds) {
                Ok(msg) => messages.push(msg),
                Err(e) => {
                    tracing::warn!(error = %e, "dropping timeframe: formatting failed");
                    failed = true;
                    break;
                }
            }
        }
        if !failed && output.push(messages).is_err() {
            failed = true;
        }
        if failed {
            ctx.counters.record_push_error();
        }
    }
}

fn sender_loop(outputs: &[Arc<Fifo<Vec<StfMessage>>>], shutdown: &AtomicBool, ctx: &PipelineContext) {
    let mut read_ix = 0usize;
    loop {
        if shutdown.load(Ordering::Acquire) {
            break;
        }
        let Some(messages) = outputs[read_ix].pop() else {
            std::thread::sleep(LANE_SLEEP);
            continue;
        };
        // next timeframe comes from the next lane
        read_ix = (read_ix + 1) % outputs.len();
        let mut failed = false;
        for msg in messages {
            if send_stf(&ctx.channel, &ctx.stats, &ctx.counters, msg).is_err() {
                failed = true;
            }
        }
        if failed {
            ctx.counters.record_push_error();
        }
    }
}
