//! Unmanaged shared memory region registered with the transport
//!
//! One contiguous mapped byte range created at consumer start-up.
//! Transport messages point into it (or into pool pages carved from it)
//! and carry a hint that is handed back on peer release.

use std::ffi::CString;
use std::os::fd::{AsRawFd, OwnedFd, RawFd};

use memmap2::{MmapMut, MmapOptions};
use nix::sys::memfd::{memfd_create, MemFdCreateFlag};
use nix::unistd::ftruncate;

use crate::error::{Result, SubframeError};
use crate::util::{format_byte_size, free_bytes_for_resource, parse_list};

/// A single contiguous shared byte range backing transport messages.
#[derive(Debug)]
pub struct UnmanagedRegion {
    name: String,
    mmap: MmapMut,
    _fd: OwnedFd,
}

impl UnmanagedRegion {
    /// Create a memfd-backed region of `size` bytes.
    pub fn new(name: impl Into<String>, size: usize) -> Result<Self> {
        let name = name.into();
        if size == 0 {
            return Err(SubframeError::config(
                "unmanagedMemorySize",
                "region size cannot be zero",
            ));
        }
        let name_cstr = CString::new(name.clone())
            .map_err(|_| SubframeError::config("name", "region name contains null bytes"))?;
        let fd = memfd_create(&name_cstr, MemFdCreateFlag::MFD_CLOEXEC).map_err(|e| {
            SubframeError::Io {
                message: format!("memfd_create failed: {}", e),
                source: None,
            }
        })?;
        ftruncate(&fd, size as i64).map_err(|e| SubframeError::Io {
            message: format!("ftruncate to {} failed: {}", size, e),
            source: None,
        })?;
        let mmap = unsafe {
            MmapOptions::new()
                .len(size)
                .map_mut(&fd)
                .map_err(|e| SubframeError::from_io(e, "mapping unmanaged region"))?
        };
        tracing::info!(
            name = %name,
            size = %format_byte_size(size as u64),
            "created unmanaged memory region"
        );
        Ok(Self {
            name,
            mmap,
            _fd: fd,
        })
    }

    /// Region name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Region size in bytes
    pub fn len(&self) -> usize {
        self.mmap.len()
    }

    /// True when the region holds no bytes
    pub fn is_empty(&self) -> bool {
        self.mmap.len() == 0
    }

    /// Base pointer of the mapped range
    pub fn as_ptr(&self) -> *const u8 {
        self.mmap.as_ptr()
    }

    /// Mutable base pointer of the mapped range.
    ///
    /// # Safety
    /// Caller must ensure exclusive access to the bytes it writes.
    pub unsafe fn as_mut_ptr_unsafe(&self) -> *mut u8 {
        self.mmap.as_ptr() as *mut u8
    }

    /// True when `ptr` points inside the mapped range
    pub fn contains(&self, ptr: *const u8) -> bool {
        let base = self.mmap.as_ptr() as usize;
        let p = ptr as usize;
        p >= base && p < base + self.mmap.len()
    }

    /// Underlying file descriptor (for transports that register it)
    pub fn fd(&self) -> RawFd {
        self._fd.as_raw_fd()
    }
}

/// Verify that each resource in the comma-separated `check_resources`
/// list has at least `required` bytes free.
///
/// Entries containing a `/` are filesystem paths, anything else is a
/// `/proc/meminfo` key. A resource that cannot be statted only warns;
/// one that is too small is a configuration error.
pub fn check_resources(check_resources: &str, required: u64) -> Result<()> {
    for resource in parse_list(check_resources) {
        match free_bytes_for_resource(&resource) {
            Err(e) => {
                tracing::warn!(resource = %resource, error = %e, "can not get resource stats");
            }
            Ok(free) => {
                tracing::info!(
                    resource = %resource,
                    free = %format_byte_size(free),
                    "resource pre-flight check"
                );
                if free < required {
                    return Err(SubframeError::ResourceCheck {
                        resource,
                        requested: required,
                        available: free,
                    });
                }
            }
        }
    }
    Ok(())
}
