//! Downstream transport channel: multi-part messages with release hints
//!
//! Messages are pointer/length pairs into pool- or region-owned memory,
//! each carrying a hint that owns a cloned page handle. The peer side
//! releases a message by dropping it (from any thread, at any time),
//! which runs the page-lifetime release path.

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::sync::atomic::{AtomicBool, Ordering};

use crate::block::PageRef;
use crate::error::{Result, SubframeError};
use crate::lifetime;

/// Transport flavor of the channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransportKind {
    /// Shared-memory transport (zero-copy on the same host)
    Shmem,
    /// Socket transport
    Zeromq,
}

impl Default for TransportKind {
    fn default() -> Self {
        Self::Shmem
    }
}

impl TransportKind {
    /// Parse a configuration value ("shmem" / "zeromq")
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "shmem" => Some(Self::Shmem),
            "zeromq" => Some(Self::Zeromq),
            _ => None,
        }
    }

    /// Configuration name of the kind
    pub fn name(&self) -> &'static str {
        match self {
            Self::Shmem => "shmem",
            Self::Zeromq => "zeromq",
        }
    }
}

/// Wiring of the outbound channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelConfig {
    /// Channel name
    pub name: String,
    /// Channel type, typically "pair"
    pub channel_type: String,
    /// Transport flavor
    pub transport: TransportKind,
    /// Endpoint URI, e.g. `ipc:///tmp/pipe-readout`
    pub address: String,
    /// Session name shared with the peer
    pub session: String,
    /// Extra `key=value` options handed to the transport
    pub prog_options: Vec<(String, String)>,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            name: "readout".to_string(),
            channel_type: "pair".to_string(),
            transport: TransportKind::default(),
            address: "ipc:///tmp/pipe-readout".to_string(),
            session: "default".to_string(),
            prog_options: Vec::new(),
        }
    }
}

impl ChannelConfig {
    /// Create a configuration with a custom channel name
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    /// Set the endpoint address
    pub fn with_address(mut self, address: impl Into<String>) -> Self {
        self.address = address.into();
        self
    }

    /// Set the transport flavor
    pub fn with_transport(mut self, transport: TransportKind) -> Self {
        self.transport = transport;
        self
    }

    /// Set the session name
    pub fn with_session(mut self, session: impl Into<String>) -> Self {
        self.session = session.into();
        self
    }

    /// Set extra transport options from a comma-separated `key=value`
    /// list
    pub fn with_prog_options(mut self, options: &str) -> Self {
        self.prog_options = crate::util::parse_key_values(options);
        self
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(SubframeError::config("fmq-name", "channel name is empty"));
        }
        let scheme_ok = ["ipc://", "tcp://", "inproc://"]
            .iter()
            .any(|s| self.address.starts_with(s));
        if !scheme_ok {
            return Err(SubframeError::config(
                "fmq-address",
                format!("unsupported address: {}", self.address),
            ));
        }
        Ok(())
    }
}

/// Opaque user pointer returned to the release path: owns a cloned page
/// handle and runs the reference-count release when dropped.
pub struct Hint {
    block: PageRef,
}

impl Hint {
    /// Wrap a clone of `block`
    pub fn new(block: PageRef) -> Self {
        Self { block }
    }

    /// The referenced block
    pub fn block(&self) -> &PageRef {
        &self.block
    }
}

impl Drop for Hint {
    fn drop(&mut self) {
        lifetime::dec(&self.block);
        // the clone itself drops with the field, possibly returning the
        // page to its pool
    }
}

impl std::fmt::Debug for Hint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Hint").finish_non_exhaustive()
    }
}

/// One part of a multi-part transport message
#[derive(Debug)]
pub struct MessagePart {
    ptr: *const u8,
    len: usize,
    hint: Option<Hint>,
}

// Part bytes are immutable while the hint holds a reference; the hint
// release path is lock-free and thread-safe.
unsafe impl Send for MessagePart {}
unsafe impl Sync for MessagePart {}

impl MessagePart {
    /// Part covering `len` bytes of `block`'s data region at `offset`,
    /// keeping the block alive through a hint clone.
    pub fn from_block(block: &PageRef, offset: usize, len: usize) -> Self {
        debug_assert!(offset + len <= block.capacity());
        Self {
            ptr: unsafe { block.data_ptr().add(offset) },
            len,
            hint: Some(Hint::new(block.clone())),
        }
    }

    /// Part covering `block`'s header record, keeping the block alive
    /// through a hint clone.
    pub fn from_block_header(block: &PageRef) -> Self {
        Self {
            ptr: block.inner.header.as_ptr() as *const u8,
            len: std::mem::size_of::<crate::block::DataBlockHeader>(),
            hint: Some(Hint::new(block.clone())),
        }
    }

    /// The referenced bytes
    pub fn as_slice(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.ptr, self.len) }
    }

    /// Part length in bytes
    pub fn len(&self) -> usize {
        self.len
    }

    /// True for a zero-length part
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// The hint's block, when the part carries one
    pub fn block(&self) -> Option<&PageRef> {
        self.hint.as_ref().map(|h| h.block())
    }
}

#[derive(Debug, Default)]
struct SharedQueue {
    batches: Mutex<VecDeque<Vec<MessagePart>>>,
    closed: AtomicBool,
}

/// Outbound channel endpoint owned by the consumer.
///
/// `send` is an atomic multi-part submit: either the whole batch is
/// queued for the peer or nothing is.
#[derive(Debug)]
pub struct Channel {
    config: ChannelConfig,
    queue: Arc<SharedQueue>,
}

impl Channel {
    /// Create and bind a channel
    pub fn new(config: ChannelConfig) -> Result<Self> {
        config.validate()?;
        tracing::info!(
            session = %config.session,
            name = %config.name,
            transport = config.transport.name(),
            channel_type = %config.channel_type,
            address = %config.address,
            "created TX channel"
        );
        for (k, v) in &config.prog_options {
            tracing::info!(option = %k, value = %v, "transport option");
        }
        Ok(Self {
            config,
            queue: Arc::new(SharedQueue::default()),
        })
    }

    /// Channel configuration
    pub fn config(&self) -> &ChannelConfig {
        &self.config
    }

    /// Peer endpoint draining this channel
    pub fn endpoint(&self) -> ChannelEndpoint {
        ChannelEndpoint {
            queue: Arc::clone(&self.queue),
        }
    }

    /// Submit `parts` as one atomic multi-part message.
    ///
    /// Returns the total byte count submitted.
    pub fn send(&self, parts: Vec<MessagePart>) -> Result<usize> {
        if self.queue.closed.load(Ordering::Acquire) {
            return Err(SubframeError::transport(format!(
                "channel {} peer is gone",
                self.config.name
            )));
        }
        let bytes = parts.iter().map(|p| p.len()).sum();
        self.queue.batches.lock().unwrap().push_back(parts);
        Ok(bytes)
    }
}

/// Peer side of a channel. Dropping a received batch releases every
/// hint it carries; this may happen on any thread.
#[derive(Debug, Clone)]
pub struct ChannelEndpoint {
    queue: Arc<SharedQueue>,
}

impl ChannelEndpoint {
    /// Take the oldest queued batch, if any
    pub fn recv(&self) -> Option<Vec<MessagePart>> {
        self.queue.batches.lock().unwrap().pop_front()
    }

    /// Number of queued batches
    pub fn pending(&self) -> usize {
        self.queue.batches.lock().unwrap().len()
    }

    /// Mark the peer as gone; subsequent sends fail
    pub fn close(&self) {
        self.queue.closed.store(true, Ordering::Release);
    }
}
