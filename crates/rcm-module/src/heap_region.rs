//! `HeapRegion` — page-aligned, zeroed heap memory for registration.
//!
//! The fabric writes into a registered region from its own threads, so a
//! region is handed out as raw pointer + length (`RawRegion`) rather than a
//! borrowed slice. Freeing is explicit (`release`) so teardown code reads
//! in the order it happens; `Drop` frees as a fallback.

use rcm_core::error::{FabricError, Result};
use rcm_core::work_request::RawRegion;

use std::alloc::{self, Layout};
use std::ptr::NonNull;

pub struct HeapRegion {
    ptr: NonNull<u8>,
    layout: Layout,
}

// Safety: the region is plain memory; concurrent access is governed by the
// work-request protocol (see `as_slice`).
unsafe impl Send for HeapRegion {}
unsafe impl Sync for HeapRegion {}

/// System page size, 4 KiB if sysconf fails.
pub fn page_size() -> usize {
    let ret = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if ret > 0 {
        ret as usize
    } else {
        4096
    }
}

impl HeapRegion {
    /// Allocate `len` zeroed bytes aligned to a page.
    pub fn alloc_zeroed(len: usize) -> Result<Self> {
        if len == 0 {
            return Err(FabricError::call("malloc", "zero-length region"));
        }
        let layout = Layout::from_size_align(len, page_size())
            .map_err(|e| FabricError::call("malloc", e.to_string()))?;
        // Safety: layout has non-zero size.
        let raw = unsafe { alloc::alloc_zeroed(layout) };
        let ptr = NonNull::new(raw)
            .ok_or_else(|| FabricError::call("malloc", format!("out of memory ({} bytes)", len)))?;
        Ok(Self { ptr, layout })
    }

    pub fn len(&self) -> usize {
        self.layout.size()
    }

    pub fn is_empty(&self) -> bool {
        self.layout.size() == 0
    }

    pub fn addr(&self) -> u64 {
        self.ptr.as_ptr() as u64
    }

    /// Pointer + length for `VerbsProvider::reg_mr`.
    pub fn raw(&self) -> RawRegion {
        RawRegion {
            ptr: self.ptr.as_ptr(),
            len: self.layout.size(),
        }
    }

    /// View the region.
    ///
    /// # Safety
    ///
    /// No fabric write may be in flight: either no receive is posted on the
    /// region, or its completion has been drained.
    pub unsafe fn as_slice(&self) -> &[u8] {
        std::slice::from_raw_parts(self.ptr.as_ptr(), self.layout.size())
    }

    /// Mutable view of the region.
    ///
    /// # Safety
    ///
    /// Same as `as_slice`, and no posted send may still be reading it.
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn as_mut_slice(&self) -> &mut [u8] {
        std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.layout.size())
    }

    /// Free the memory.
    pub fn release(self) {
        drop(self);
    }
}

impl Drop for HeapRegion {
    fn drop(&mut self) {
        // Safety: allocated in alloc_zeroed with this exact layout.
        unsafe { alloc::dealloc(self.ptr.as_ptr(), self.layout) };
    }
}

impl std::fmt::Debug for HeapRegion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HeapRegion")
            .field("addr", &format_args!("{:#x}", self.addr()))
            .field("len", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_alloc_zeroed_aligned() {
        let region = HeapRegion::alloc_zeroed(1024).unwrap();
        assert_eq!(region.len(), 1024);
        assert_eq!(region.addr() as usize % page_size(), 0);
        assert!(unsafe { region.as_slice() }.iter().all(|&b| b == 0));
        region.release();
    }

    #[test]
    fn test_raw_matches_region() {
        let region = HeapRegion::alloc_zeroed(64).unwrap();
        let raw = region.raw();
        assert_eq!(raw.ptr as u64, region.addr());
        assert_eq!(raw.len, 64);
    }

    #[test]
    fn test_write_through_mut_slice() {
        let region = HeapRegion::alloc_zeroed(16).unwrap();
        unsafe { region.as_mut_slice()[..3].copy_from_slice(b"abc") };
        assert_eq!(unsafe { &region.as_slice()[..4] }, b"abc\0");
    }

    #[test]
    fn test_zero_length_rejected() {
        assert!(HeapRegion::alloc_zeroed(0).is_err());
    }
}
