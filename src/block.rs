//! Data blocks, pages and owning page handles
//!
//! A page is a fixed-size buffer handed out by a [`crate::pool::PagePool`].
//! Its first [`PAGE_RESERVED_BYTES`] hold the block header and the
//! transport usage record; the rest is the data region written by the
//! front-end DMA or by repack copies.

use std::ptr::NonNull;
use std::sync::atomic::AtomicUsize;
use std::sync::Arc;

use crate::error::{Result, SubframeError};
use crate::lifetime::PageUsage;
use crate::pool::PoolCore;
use crate::stats::ReadoutStats;

/// Bytes reserved at the start of each page for header + usage record
pub const PAGE_RESERVED_BYTES: usize = 128;

/// Fixed header describing the content of a data block.
///
/// Filled by the producing equipment; the consumer reads it and only
/// writes it for scratch pages it allocates itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(C)]
pub struct DataBlockHeader {
    /// Size of the reserved header area in bytes
    pub header_size: u32,
    /// Valid payload bytes in the data region
    pub data_size: u32,
    pub timeframe_id: u64,
    pub run_number: u32,
    pub system_id: u8,
    pub fee_id: u16,
    pub equipment_id: u16,
    pub link_id: u8,
    pub timeframe_orbit_first: u32,
    pub timeframe_orbit_last: u32,
    /// Non-zero when the data region is an RDH packet stream
    pub is_rdh_format: u8,
    /// Non-zero on the last block of a timeframe for this equipment/link
    pub flag_end_of_timeframe: u8,
    /// Total buffer bytes backing this block (page granularity)
    pub memory_size: u64,
}

impl Default for DataBlockHeader {
    fn default() -> Self {
        Self {
            header_size: PAGE_RESERVED_BYTES as u32,
            data_size: 0,
            timeframe_id: 0,
            run_number: 0,
            system_id: 0,
            fee_id: 0,
            equipment_id: 0,
            link_id: 0,
            timeframe_orbit_first: 0,
            timeframe_orbit_last: 0,
            is_rdh_format: 0,
            flag_end_of_timeframe: 0,
            memory_size: 0,
        }
    }
}

const _: () = assert!(
    std::mem::size_of::<DataBlockHeader>() + std::mem::size_of::<PageUsage>()
        <= PAGE_RESERVED_BYTES
);

/// Header + usage storage for child blocks, which live outside any page
/// reserved area.
pub(crate) struct OwnedHeader {
    pub(crate) header: DataBlockHeader,
    pub(crate) usage: PageUsage,
}

pub(crate) enum Release {
    /// Page goes back to its pool free list on last drop
    Pool { pool: Arc<PoolCore>, index: u32 },
    /// Child region: freeing means dropping the parent clone
    Child {
        parent: PageRef,
        owned: NonNull<OwnedHeader>,
    },
}

pub(crate) struct PageInner {
    pub(crate) header: NonNull<DataBlockHeader>,
    pub(crate) usage: NonNull<PageUsage>,
    pub(crate) data: NonNull<u8>,
    /// Usable bytes in the data region
    pub(crate) capacity: usize,
    /// Total memory bytes backing the block
    pub(crate) buffer_size: usize,
    /// Write cursor for child sub-allocation
    pub(crate) cursor: AtomicUsize,
    pub(crate) release: Release,
}

// Page memory stays mapped while the pool (or the parent chain) is held
// by `release`; header mutation follows the single-writer contract of
// `with_header_mut`.
unsafe impl Send for PageInner {}
unsafe impl Sync for PageInner {}

impl Drop for PageInner {
    fn drop(&mut self) {
        match &self.release {
            Release::Pool { pool, index } => pool.release_page(*index),
            Release::Child { owned, .. } => {
                // reconstitute the Box created in new_child
                unsafe { drop(Box::from_raw(owned.as_ptr())) };
                // parent clone drops with the enum field
            }
        }
    }
}

/// Owning, cloneable reference to a data block.
///
/// Clones share the same page; the page returns to its pool when the
/// last clone drops. Transport hints hold clones so that peer-referenced
/// pages outlive the producer's handle.
#[derive(Clone)]
pub struct PageRef {
    pub(crate) inner: Arc<PageInner>,
}

impl std::fmt::Debug for PageRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PageRef")
            .field("data", &self.inner.data)
            .field("capacity", &self.inner.capacity)
            .field("buffer_size", &self.inner.buffer_size)
            .finish()
    }
}

impl PageRef {
    /// Build a handle for pool page `index`; `base` points at the page
    /// start (the reserved area). Called by the pool with fresh header
    /// and usage records already written.
    pub(crate) fn from_pool(
        pool: Arc<PoolCore>,
        index: u32,
        base: NonNull<u8>,
        page_size: usize,
    ) -> PageRef {
        let header = base.cast::<DataBlockHeader>();
        let usage = unsafe {
            NonNull::new_unchecked(
                base.as_ptr().add(std::mem::size_of::<DataBlockHeader>()) as *mut PageUsage
            )
        };
        let data = unsafe { NonNull::new_unchecked(base.as_ptr().add(PAGE_RESERVED_BYTES)) };
        PageRef {
            inner: Arc::new(PageInner {
                header,
                usage,
                data,
                capacity: page_size - PAGE_RESERVED_BYTES,
                buffer_size: page_size,
                cursor: AtomicUsize::new(0),
                release: Release::Pool { pool, index },
            }),
        }
    }

    /// Build a child handle over `len` bytes of the parent's data region
    /// starting at `offset`. The child owns a parent clone, so the parent
    /// page stays out of the pool until every child is dropped.
    pub(crate) fn new_child(parent: &PageRef, offset: usize, len: usize) -> PageRef {
        let owned = Box::new(OwnedHeader {
            header: DataBlockHeader {
                memory_size: len as u64,
                ..Default::default()
            },
            usage: PageUsage::new_inactive(),
        });
        let owned = unsafe { NonNull::new_unchecked(Box::into_raw(owned)) };
        let (header, usage) = unsafe {
            (
                NonNull::new_unchecked(std::ptr::addr_of_mut!((*owned.as_ptr()).header)),
                NonNull::new_unchecked(std::ptr::addr_of_mut!((*owned.as_ptr()).usage)),
            )
        };
        let data = unsafe { NonNull::new_unchecked(parent.inner.data.as_ptr().add(offset)) };
        PageRef {
            inner: Arc::new(PageInner {
                header,
                usage,
                data,
                capacity: len,
                buffer_size: len,
                cursor: AtomicUsize::new(0),
                release: Release::Child {
                    parent: parent.clone(),
                    owned,
                },
            }),
        }
    }

    /// Copy of the block header
    pub fn header(&self) -> DataBlockHeader {
        unsafe { self.inner.header.as_ptr().read() }
    }

    /// Update the block header through a closure.
    ///
    /// Single-writer contract: the caller must be the only thread
    /// touching the header fields; blocks already handed to the
    /// transport are immutable.
    pub fn with_header_mut<R>(&self, f: impl FnOnce(&mut DataBlockHeader) -> R) -> R {
        let mut h = self.header();
        let r = f(&mut h);
        unsafe { self.inner.header.as_ptr().write(h) };
        r
    }

    /// The block's usage record (transport reference counting)
    pub fn usage(&self) -> &PageUsage {
        unsafe { self.inner.usage.as_ref() }
    }

    /// The full data region
    pub fn data(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.inner.data.as_ptr(), self.inner.capacity) }
    }

    /// Raw pointer to the data region
    pub fn data_ptr(&self) -> *const u8 {
        self.inner.data.as_ptr()
    }

    /// Copy `bytes` into the data region at `offset`.
    ///
    /// Rejected once any transport reference is outstanding: referenced
    /// pages are immutable.
    pub fn write_data(&self, offset: usize, bytes: &[u8]) -> Result<()> {
        if self.usage().refcount() > 0 {
            return Err(SubframeError::unsupported(
                "write to a block referenced by the transport",
            ));
        }
        let end = offset
            .checked_add(bytes.len())
            .ok_or_else(|| SubframeError::no_room(usize::MAX, self.inner.capacity))?;
        if end > self.inner.capacity {
            return Err(SubframeError::no_room(
                bytes.len(),
                self.inner.capacity.saturating_sub(offset),
            ));
        }
        unsafe {
            std::ptr::copy_nonoverlapping(
                bytes.as_ptr(),
                self.inner.data.as_ptr().add(offset),
                bytes.len(),
            );
        }
        Ok(())
    }

    /// Usable bytes in the data region
    pub fn capacity(&self) -> usize {
        self.inner.capacity
    }

    /// Total memory bytes backing this block
    pub fn buffer_size(&self) -> usize {
        self.inner.buffer_size
    }

    /// Counter set of the pool this block (or its root parent) came from
    pub fn stats(&self) -> &Arc<ReadoutStats> {
        match &self.inner.release {
            Release::Pool { pool, .. } => pool.stats(),
            Release::Child { parent, .. } => parent.stats(),
        }
    }

    /// True when both handles refer to the same block
    pub fn same_block(&self, other: &PageRef) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

/// Ordered sequence of blocks sharing one (timeframe, equipment, link)
pub type DataSet = Vec<PageRef>;
