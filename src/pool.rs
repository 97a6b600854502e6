//! Paged memory pool: bounded, fixed-size pages over one contiguous range

use std::collections::VecDeque;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use memmap2::{MmapMut, MmapOptions};

use crate::block::{DataBlockHeader, PageRef, PAGE_RESERVED_BYTES};
use crate::error::{Result, SubframeError};
use crate::lifetime::PageUsage;
use crate::region::UnmanagedRegion;
use crate::stats::ReadoutStats;
use crate::util::RateLimitedToken;

/// Callback surface for pool diagnostics (exhaustion warnings)
pub type WarningCallback = Box<dyn Fn(&str) + Send + Sync>;

/// Configuration for a paged pool
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolConfig {
    /// Pool name, used in diagnostics
    pub name: String,
    /// Size of each page in bytes (reserved area included)
    pub page_size: usize,
    /// Number of pages in the pool
    pub page_count: usize,
    /// Alignment of the first page within the backing range
    pub first_page_alignment: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            name: "pages".to_string(),
            page_size: 128 * 1024,
            page_count: 100,
            first_page_alignment: 4096,
        }
    }
}

impl PoolConfig {
    /// Create a configuration with a custom name
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    /// Set the page size
    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size;
        self
    }

    /// Set the page count
    pub fn with_page_count(mut self, page_count: usize) -> Self {
        self.page_count = page_count;
        self
    }

    /// Set the first-page alignment
    pub fn with_first_page_alignment(mut self, alignment: usize) -> Self {
        self.first_page_alignment = alignment;
        self
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.page_size <= PAGE_RESERVED_BYTES {
            return Err(SubframeError::config(
                "memoryPoolPageSize",
                format!(
                    "page size {} does not exceed the {} reserved header bytes",
                    self.page_size, PAGE_RESERVED_BYTES
                ),
            ));
        }
        if self.page_size % 64 != 0 {
            return Err(SubframeError::config(
                "memoryPoolPageSize",
                "page size must be a multiple of 64",
            ));
        }
        if self.page_count == 0 {
            return Err(SubframeError::config(
                "memoryPoolNumberOfPages",
                "page count cannot be zero",
            ));
        }
        if !self.first_page_alignment.is_power_of_two() {
            return Err(SubframeError::config(
                "firstPageAlignment",
                "alignment must be a power of two",
            ));
        }
        Ok(())
    }

    /// Backing bytes needed, alignment slack included
    pub fn bytes_required(&self) -> usize {
        self.page_size * self.page_count + self.first_page_alignment
    }
}

/// Pool usage snapshot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    pub free: usize,
    pub total: usize,
    pub in_flight: usize,
    pub page_size: usize,
}

enum Backing {
    /// Anonymous mapping owned by the pool
    Owned(#[allow(dead_code)] MmapMut),
    /// Slice of a contributed unmanaged region
    Region(#[allow(dead_code)] Arc<UnmanagedRegion>),
}

pub(crate) struct PoolCore {
    name: String,
    base: NonNull<u8>,
    page_size: usize,
    page_count: usize,
    free: Mutex<VecDeque<u32>>,
    in_flight: AtomicUsize,
    warning: Mutex<Option<WarningCallback>>,
    warn_token: RateLimitedToken,
    stats: Arc<ReadoutStats>,
    _backing: Backing,
}

// The base pointer stays valid for the pool's lifetime: the backing
// mapping (or region Arc) is owned by the core itself.
unsafe impl Send for PoolCore {}
unsafe impl Sync for PoolCore {}

impl PoolCore {
    pub(crate) fn release_page(&self, index: u32) {
        let mut free = self.free.lock().unwrap();
        free.push_back(index);
        self.in_flight.fetch_sub(1, Ordering::Relaxed);
    }

    pub(crate) fn stats(&self) -> &Arc<ReadoutStats> {
        &self.stats
    }
}

/// Bounded pool of fixed-size pages over one contiguous byte range.
///
/// Pages never move; a page is handed out at most once until every
/// handle to it is dropped. Cloning the pool shares the same pages.
#[derive(Clone)]
pub struct PagePool {
    core: Arc<PoolCore>,
}

impl std::fmt::Debug for PagePool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = self.stats();
        f.debug_struct("PagePool")
            .field("name", &self.core.name)
            .field("free", &s.free)
            .field("total", &s.total)
            .finish()
    }
}

impl PagePool {
    /// Create a pool with its own anonymous backing mapping.
    pub fn new(config: PoolConfig, stats: Arc<ReadoutStats>) -> Result<Self> {
        config.validate()?;
        let mmap = MmapOptions::new()
            .len(config.bytes_required())
            .map_anon()
            .map_err(|e| SubframeError::from_io(e, "mapping pool backing"))?;
        let base = mmap.as_ptr() as *mut u8;
        Self::build(config, base, stats, Backing::Owned(mmap))
    }

    /// Create a pool carving `config.bytes_required()` bytes out of a
    /// contributed unmanaged region, starting at `offset`.
    pub fn in_region(
        config: PoolConfig,
        region: Arc<UnmanagedRegion>,
        offset: usize,
        stats: Arc<ReadoutStats>,
    ) -> Result<Self> {
        config.validate()?;
        let needed = config.bytes_required();
        if offset
            .checked_add(needed)
            .map(|end| end > region.len())
            .unwrap_or(true)
        {
            return Err(SubframeError::config(
                "memoryPoolNumberOfPages",
                format!(
                    "pool needs {} bytes at offset {}, region {} holds {}",
                    needed,
                    offset,
                    region.name(),
                    region.len()
                ),
            ));
        }
        let base = unsafe { region.as_mut_ptr_unsafe().add(offset) };
        Self::build(config, base, stats, Backing::Region(region))
    }

    fn build(
        config: PoolConfig,
        raw_base: *mut u8,
        stats: Arc<ReadoutStats>,
        backing: Backing,
    ) -> Result<Self> {
        let align = config.first_page_alignment;
        let aligned = ((raw_base as usize) + align - 1) & !(align - 1);
        let base = NonNull::new(aligned as *mut u8)
            .ok_or_else(|| SubframeError::config("pool", "null backing pointer"))?;
        let free = (0..config.page_count as u32).collect::<VecDeque<u32>>();
        tracing::info!(
            name = %config.name,
            pages = config.page_count,
            page_size = config.page_size,
            "paged pool ready"
        );
        Ok(Self {
            core: Arc::new(PoolCore {
                name: config.name,
                base,
                page_size: config.page_size,
                page_count: config.page_count,
                free: Mutex::new(free),
                in_flight: AtomicUsize::new(0),
                warning: Mutex::new(None),
                warn_token: RateLimitedToken::new(Duration::from_secs(10)),
                stats,
                _backing: backing,
            }),
        })
    }

    /// Pool name
    pub fn name(&self) -> &str {
        &self.core.name
    }

    /// Usable data bytes per page
    pub fn page_data_capacity(&self) -> usize {
        self.core.page_size - PAGE_RESERVED_BYTES
    }

    /// Hand out a free page, or `None` when the pool is exhausted.
    ///
    /// The page comes with a fresh header (`memory_size` set to the page
    /// size) and an inactive usage record.
    pub fn acquire(&self) -> Option<PageRef> {
        let index = {
            let mut free = self.core.free.lock().unwrap();
            free.pop_front()
        };
        let Some(index) = index else {
            self.warn_exhausted();
            return None;
        };
        self.core.in_flight.fetch_add(1, Ordering::Relaxed);
        let page_start = unsafe {
            NonNull::new_unchecked(
                self.core
                    .base
                    .as_ptr()
                    .add(index as usize * self.core.page_size),
            )
        };
        unsafe {
            let header = page_start.as_ptr() as *mut DataBlockHeader;
            header.write(DataBlockHeader {
                memory_size: self.core.page_size as u64,
                ..Default::default()
            });
            let usage = page_start
                .as_ptr()
                .add(std::mem::size_of::<DataBlockHeader>())
                as *mut PageUsage;
            usage.write(PageUsage::new_inactive());
        }
        Some(PageRef::from_pool(
            Arc::clone(&self.core),
            index,
            page_start,
            self.core.page_size,
        ))
    }

    /// Carve a child block of `len` bytes at the parent's write cursor.
    ///
    /// `None` when the parent's remaining space is smaller than `len`.
    /// The child holds a clone of the parent, so the parent page returns
    /// to the pool only after the parent handle and every child dropped.
    pub fn acquire_child(&self, parent: &PageRef, len: usize) -> Option<PageRef> {
        let capacity = parent.capacity();
        let offset = parent
            .inner
            .cursor
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |cursor| {
                let end = cursor.checked_add(len)?;
                (end <= capacity).then_some(end)
            })
            .ok()?;
        Some(PageRef::new_child(parent, offset, len))
    }

    /// Current usage snapshot. `free + in_flight == total` holds.
    pub fn stats(&self) -> PoolStats {
        let free = self.core.free.lock().unwrap().len();
        PoolStats {
            free,
            total: self.core.page_count,
            in_flight: self.core.in_flight.load(Ordering::Relaxed),
            page_size: self.core.page_size,
        }
    }

    /// Install the diagnostic callback invoked (rate-limited) on
    /// exhaustion events.
    pub fn set_warning_callback(&self, cb: impl Fn(&str) + Send + Sync + 'static) {
        *self.core.warning.lock().unwrap() = Some(Box::new(cb));
    }

    /// Counter set shared with handles from this pool
    pub fn readout_stats(&self) -> &Arc<ReadoutStats> {
        &self.core.stats
    }

    fn warn_exhausted(&self) {
        if let Some(suppressed) = self.core.warn_token.fire() {
            let msg = format!(
                "pool {} exhausted ({} pages, {} earlier events suppressed)",
                self.core.name, self.core.page_count, suppressed
            );
            tracing::warn!("{}", msg);
            if let Some(cb) = self.core.warning.lock().unwrap().as_ref() {
                cb(&msg);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool(pages: usize) -> PagePool {
        let config = PoolConfig::new("test")
            .with_page_size(4096)
            .with_page_count(pages);
        PagePool::new(config, Arc::new(ReadoutStats::new())).unwrap()
    }

    #[test]
    fn test_config_validation() {
        assert!(PoolConfig::default().validate().is_ok());
        // page equal to the reserved header area is unusable
        assert!(PoolConfig::new("x")
            .with_page_size(PAGE_RESERVED_BYTES)
            .validate()
            .is_err());
        assert!(PoolConfig::new("x").with_page_count(0).validate().is_err());
        assert!(PoolConfig::new("x")
            .with_first_page_alignment(3)
            .validate()
            .is_err());
    }

    #[test]
    fn test_acquire_release_cycle() {
        let p = pool(2);
        assert_eq!(p.stats().free, 2);

        let a = p.acquire().unwrap();
        let b = p.acquire().unwrap();
        assert!(p.acquire().is_none());
        let s = p.stats();
        assert_eq!((s.free, s.in_flight, s.total), (0, 2, 2));

        drop(a);
        assert_eq!(p.stats().free, 1);
        drop(b);
        let s = p.stats();
        assert_eq!((s.free, s.in_flight), (2, 0));
    }

    #[test]
    fn test_clone_extends_page_lifetime() {
        let p = pool(1);
        let a = p.acquire().unwrap();
        let b = a.clone();
        drop(a);
        assert_eq!(p.stats().in_flight, 1);
        drop(b);
        assert_eq!(p.stats().in_flight, 0);
    }

    #[test]
    fn test_child_allocation() {
        let p = pool(1);
        let parent = p.acquire().unwrap();
        let capacity = parent.capacity();

        let c1 = p.acquire_child(&parent, 100).unwrap();
        let c2 = p.acquire_child(&parent, 200).unwrap();
        assert_eq!(c1.capacity(), 100);
        // children are adjacent in the parent's data region
        assert_eq!(unsafe { c1.data_ptr().add(100) }, c2.data_ptr());

        // no room for more than the remaining space
        assert!(p.acquire_child(&parent, capacity).is_none());

        // parent page returns only after parent and all children drop
        drop(parent);
        drop(c1);
        assert_eq!(p.stats().in_flight, 1);
        drop(c2);
        assert_eq!(p.stats().in_flight, 0);
    }

    #[test]
    fn test_page_header_is_fresh() {
        let p = pool(1);
        let a = p.acquire().unwrap();
        a.with_header_mut(|h| h.timeframe_id = 99);
        assert_eq!(a.header().timeframe_id, 99);
        drop(a);
        let b = p.acquire().unwrap();
        assert_eq!(b.header().timeframe_id, 0);
        assert_eq!(b.header().memory_size, 4096);
        assert!(!b.usage().is_active());
    }

    #[test]
    fn test_warning_callback_fires_on_exhaustion() {
        use std::sync::atomic::AtomicUsize;
        let p = pool(1);
        let fired = Arc::new(AtomicUsize::new(0));
        let fired2 = Arc::clone(&fired);
        p.set_warning_callback(move |_| {
            fired2.fetch_add(1, Ordering::Relaxed);
        });
        let _a = p.acquire().unwrap();
        assert!(p.acquire().is_none());
        assert_eq!(fired.load(Ordering::Relaxed), 1);
        // second event inside the mute window is suppressed
        assert!(p.acquire().is_none());
        assert_eq!(fired.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_pool_in_region() {
        let region = Arc::new(UnmanagedRegion::new("pool-bank", 1024 * 1024).unwrap());
        let config = PoolConfig::new("carved")
            .with_page_size(4096)
            .with_page_count(4);
        let p = PagePool::in_region(
            config,
            Arc::clone(&region),
            0,
            Arc::new(ReadoutStats::new()),
        )
        .unwrap();
        let page = p.acquire().unwrap();
        assert!(region.contains(page.data_ptr()));

        // region too small is a configuration error
        let big = PoolConfig::new("big")
            .with_page_size(128 * 1024)
            .with_page_count(1000);
        assert!(PagePool::in_region(big, region, 0, Arc::new(ReadoutStats::new())).is_err());
    }
}
