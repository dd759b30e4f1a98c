//! Receive buffer pages.
//!
//! Incoming message payloads land in fixed-size buffer pages ("bpages")
//! drawn from a pool that the application owns and maps. The receive core
//! only consumes the small contract in [`BufferPool`]; [`PageBufferPool`]
//! is a ready-made anonymous-mapping implementation.

use std::collections::HashMap;
use std::io;
use std::ptr::NonNull;
use std::sync::Mutex;

use memmap2::MmapMut;
use slab::Slab;

/// Bytes in one buffer page. Must be a power of two.
pub const BPAGE_SIZE: usize = 1 << 16;

/// Largest payload of a single Homa message.
pub const MAX_MESSAGE_LENGTH: usize = 1_000_000;

/// Pages required by the largest possible message.
pub const MAX_BPAGES: usize = MAX_MESSAGE_LENGTH.div_ceil(BPAGE_SIZE);

/// The buffer-page allocator the receive core copies payloads into.
///
/// # Contract
///
/// * `get_buffer` pointers stay valid until `release(id)`.
/// * Distinct offsets of one message map to non-overlapping memory, so
///   concurrent copies of different segments need no extra locking.
/// * `allocate` is all-or-nothing: 0 means no pages were reserved and the
///   caller should drop packets until space appears.
pub trait BufferPool: Send + Sync {
    /// Reserve pages to hold a `length`-byte message for RPC `id`.
    /// Returns the number of pages acquired; 0 on transient exhaustion.
    /// Idempotent: a second call for a live `id` reports the existing
    /// reservation.
    fn allocate(&self, id: u64, length: usize) -> usize;

    /// Locate the destination for `offset` within `id`'s message: a pointer
    /// and the contiguous bytes available at it. `None` if `id` holds no
    /// pages or `offset` lies past its reservation.
    fn get_buffer(&self, id: u64, offset: usize) -> Option<(NonNull<u8>, usize)>;

    /// Return every page held by `id`.
    fn release(&self, id: u64);
}

struct PoolState {
    /// Page slot -> owning RPC id. Slot reuse keeps indices below the page
    /// count, so a slot doubles as the page's position in the region.
    pages: Slab<u64>,
    /// RPC id -> its pages, in message order.
    rpcs: HashMap<u64, Vec<usize>>,
}

/// A [`BufferPool`] backed by one anonymous mapping.
pub struct PageBufferPool {
    base: NonNull<u8>,
    num_pages: usize,
    state: Mutex<PoolState>,
    /// Owns the mapping `base` points into.
    _region: MmapMut,
}

// SAFETY: `base` points into `_region`, which lives as long as the pool, and
// the pool contract hands out non-overlapping page ranges.
unsafe impl Send for PageBufferPool {}
unsafe impl Sync for PageBufferPool {}

impl PageBufferPool {
    /// Map a pool of `num_pages` bpages.
    pub fn new(num_pages: usize) -> io::Result<Self> {
        let mut region = MmapMut::map_anon(num_pages * BPAGE_SIZE)?;
        let base = NonNull::new(region.as_mut_ptr())
            .ok_or_else(|| io::Error::new(io::ErrorKind::Other, "null mapping"))?;
        Ok(Self {
            base,
            num_pages,
            state: Mutex::new(PoolState {
                pages: Slab::with_capacity(num_pages),
                rpcs: HashMap::new(),
            }),
            _region: region,
        })
    }

    /// Pages not currently reserved.
    pub fn free_pages(&self) -> usize {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        self.num_pages - state.pages.len()
    }
}

impl BufferPool for PageBufferPool {
    fn allocate(&self, id: u64, length: usize) -> usize {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(existing) = state.rpcs.get(&id) {
            return existing.len();
        }
        let needed = length.div_ceil(BPAGE_SIZE).max(1);
        if state.pages.len() + needed > self.num_pages {
            return 0;
        }
        let pages: Vec<usize> = (0..needed).map(|_| state.pages.insert(id)).collect();
        state.rpcs.insert(id, pages);
        needed
    }

    fn get_buffer(&self, id: u64, offset: usize) -> Option<(NonNull<u8>, usize)> {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let pages = state.rpcs.get(&id)?;
        let page = *pages.get(offset / BPAGE_SIZE)?;
        let in_page = offset % BPAGE_SIZE;
        // SAFETY: page < num_pages by construction, so the sum stays inside
        // the mapping.
        let ptr = unsafe { self.base.as_ptr().add(page * BPAGE_SIZE + in_page) };
        Some((NonNull::new(ptr)?, BPAGE_SIZE - in_page))
    }

    fn release(&self, id: u64) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(pages) = state.rpcs.remove(&id) {
            for page in pages {
                state.pages.remove(page);
            }
        }
    }
}
