//! Process-wide scratch arena pool.
//!
//! Each client (an MoE instance) requests its scratch regions once, as
//! a list of sizes, and receives back one pointer per region carved
//! out of a single 64-byte-aligned allocation. A second request from
//! the same client replaces its arena; `dealloc` frees it.

use std::alloc::{alloc_zeroed, dealloc as free, handle_alloc_error, Layout};
use std::collections::HashMap;
use std::sync::{Mutex, OnceLock};

const ARENA_ALIGN: usize = 64;

struct Arena {
    ptr: *mut u8,
    layout: Layout,
}

// SAFETY: the arena owns its allocation; clients serialize access.
unsafe impl Send for Arena {}

impl Drop for Arena {
    fn drop(&mut self) {
        unsafe { free(self.ptr, self.layout) };
    }
}

pub struct SharedMemBuffer {
    arenas: Mutex<HashMap<usize, Arena>>,
}

impl SharedMemBuffer {
    fn new() -> Self {
        SharedMemBuffer {
            arenas: Mutex::new(HashMap::new()),
        }
    }

    /// Allocate one contiguous arena holding a sub-region per request
    /// and return the sub-region base pointers in request order. Each
    /// sub-region starts on a 64-byte boundary. Allocation failure is
    /// fatal.
    pub fn alloc(&self, client: usize, sizes: &[usize]) -> Vec<*mut u8> {
        let total: usize = sizes.iter().map(|s| round_up(*s)).sum();
        let layout = Layout::from_size_align(total.max(ARENA_ALIGN), ARENA_ALIGN)
            .expect("scratch arena layout");
        let base = unsafe { alloc_zeroed(layout) };
        if base.is_null() {
            handle_alloc_error(layout);
        }

        let mut out = Vec::with_capacity(sizes.len());
        let mut offset = 0usize;
        for &size in sizes {
            out.push(unsafe { base.add(offset) });
            offset += round_up(size);
        }

        log::debug!(
            "scratch arena for client {client:#x}: {} regions, {} bytes",
            sizes.len(),
            total
        );

        let mut arenas = self.arenas.lock().unwrap();
        // Replaces (and frees) any previous arena for this client.
        arenas.insert(client, Arena { ptr: base, layout });
        out
    }

    /// Free the arena recorded for `client`, if any.
    pub fn dealloc(&self, client: usize) {
        let mut arenas = self.arenas.lock().unwrap();
        arenas.remove(&client);
    }
}

fn round_up(size: usize) -> usize {
    size.div_ceil(ARENA_ALIGN) * ARENA_ALIGN
}

/// The process-wide pool.
pub fn shared_mem_buffer() -> &'static SharedMemBuffer {
    static POOL: OnceLock<SharedMemBuffer> = OnceLock::new();
    POOL.get_or_init(SharedMemBuffer::new)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_alloc_regions_disjoint_and_aligned() {
        let pool = SharedMemBuffer::new();
        let sizes = [100, 4096, 1, 64];
        let ptrs = pool.alloc(1, &sizes);
        assert_eq!(ptrs.len(), 4);
        for (i, &p) in ptrs.iter().enumerate() {
            assert_eq!(p as usize % ARENA_ALIGN, 0, "region {i} misaligned");
        }
        // Regions are consecutive and non-overlapping.
        for i in 0..sizes.len() - 1 {
            let end = ptrs[i] as usize + sizes[i];
            assert!(end <= ptrs[i + 1] as usize);
        }
        // Zero-initialised and writable end to end.
        unsafe {
            for (&p, &s) in ptrs.iter().zip(&sizes) {
                assert_eq!(*p, 0);
                std::ptr::write_bytes(p, 0xAB, s);
            }
        }
        pool.dealloc(1);
    }

    #[test]
    fn test_realloc_replaces() {
        let pool = SharedMemBuffer::new();
        let first = pool.alloc(7, &[128]);
        let second = pool.alloc(7, &[256, 256]);
        assert_eq!(second.len(), 2);
        unsafe { std::ptr::write_bytes(second[0], 1, 256) };
        let _ = first; // old pointers must not be used after replacement
        pool.dealloc(7);
        // Double-dealloc is a no-op.
        pool.dealloc(7);
    }

    #[test]
    fn test_clients_independent() {
        let pool = SharedMemBuffer::new();
        let a = pool.alloc(1, &[512]);
        let b = pool.alloc(2, &[512]);
        unsafe {
            std::ptr::write_bytes(a[0], 0x11, 512);
            std::ptr::write_bytes(b[0], 0x22, 512);
            assert_eq!(*a[0], 0x11);
            assert_eq!(*b[0], 0x22);
        }
        pool.dealloc(1);
        unsafe { assert_eq!(*b[0], 0x22) };
        pool.dealloc(2);
    }
}
