use std::sync::Arc;

use errno::errno;
use libc::{
    c_int, c_void, mmap, munmap, MAP_ANONYMOUS, MAP_FAILED, MAP_HUGETLB, MAP_PRIVATE, PROT_READ,
    PROT_WRITE,
};

/// A mapped memory area. In production the aperture, event queue and
/// superbuf pool mappings come ready-made from the device management layer;
/// this wrapper stands in for them in tests, benches and simulations.
#[derive(Debug)]
pub struct MmapArea {
    pub(crate) len: usize,
    pub(crate) ptr: *mut c_void,
}
unsafe impl Send for MmapArea {}

#[derive(Debug)]
pub enum MmapError {
    Failed,
}

/// Configuration options for MmapArea
#[derive(Debug, Default)]
pub struct MmapAreaOptions {
    /// If set to true, the mmap call is passed MAP_HUGETLB
    pub huge_tlb: bool,
}

impl MmapArea {
    /// Allocate a new anonymous read/write mapping of `len` bytes
    pub fn new(len: usize, options: MmapAreaOptions) -> Result<Arc<MmapArea>, MmapError> {
        let ptr: *mut c_void;
        let mut flags: c_int = MAP_PRIVATE | MAP_ANONYMOUS;

        if options.huge_tlb {
            flags = flags | MAP_HUGETLB
        }

        unsafe {
            ptr = mmap(
                0 as *mut c_void,
                len,
                PROT_READ | PROT_WRITE,
                flags,
                -1,
                0,
            );
        }

        if ptr == MAP_FAILED {
            return Err(MmapError::Failed);
        }

        Ok(Arc::new(MmapArea { len, ptr }))
    }

    #[inline]
    pub fn as_ptr(&self) -> *mut u8 {
        self.ptr as *mut u8
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl Drop for MmapArea {
    fn drop(&mut self) {
        let r: c_int;

        unsafe {
            r = munmap(self.ptr, self.len);
        }

        if r != 0 {
            let errno = errno().0;
            log::error!("munmap failed errno: {}", errno);
        }
    }
}
