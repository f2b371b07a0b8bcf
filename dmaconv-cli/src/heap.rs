//! dma-heap allocation with a CPU mapping.
//!
//! The harness needs to see the pixel bytes from the CPU side to load
//! input files and save results, so every buffer is mmap'd for its whole
//! lifetime. The conversion engine itself only ever sees the fd.

use std::os::fd::{AsRawFd, OwnedFd};
use std::ptr;

use anyhow::{bail, Context, Result};
use dma_heap::{Heap, HeapKind};

pub fn open_heap(kind: HeapKind) -> Result<Heap> {
    Heap::new(kind).context("failed to open dma-heap (is /dev/dma_heap available?)")
}

pub struct DmaBuffer {
    fd: OwnedFd,
    ptr: *mut u8,
    size: usize,
}

impl DmaBuffer {
    pub fn allocate(heap: &Heap, size: usize) -> Result<Self> {
        let fd = heap
            .allocate(size)
            .with_context(|| format!("dma-heap allocation of {size} bytes failed"))?;

        let ptr = unsafe {
            libc::mmap(
                ptr::null_mut(),
                size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                fd.as_raw_fd(),
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            bail!("mmap failed: {}", std::io::Error::last_os_error());
        }

        Ok(Self {
            fd,
            ptr: ptr as *mut u8,
            size,
        })
    }

    pub fn raw_fd(&self) -> i32 {
        self.fd.as_raw_fd()
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        unsafe { std::slice::from_raw_parts_mut(self.ptr, self.size) }
    }

    pub fn as_slice(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.ptr, self.size) }
    }
}

impl Drop for DmaBuffer {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.ptr as *mut libc::c_void, self.size);
        }
    }
}
