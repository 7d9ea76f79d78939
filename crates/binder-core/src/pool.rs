//! Per-process buffer pool.
//!
//! Each mapped endpoint owns one pool: a contiguous virtual range that the
//! core writes and the owning process reads. Buffers are carved out of the
//! range with a best-fit policy; physical pages are attached lazily under
//! live buffers and detached when no buffer covers them.
//!
//! Every buffer charges a fixed header at the front of its span (the
//! in-mapping bookkeeping record of a device implementation). A buffer's
//! capacity is implicit: it runs from the end of its header to the next
//! buffer's header, so the address-ordered map always partitions the whole
//! range. Free buffers are additionally indexed by (capacity, address) for
//! best-fit selection with lowest-address tie-breaking.

use alloc::boxed::Box;
use alloc::collections::{BTreeMap, BTreeSet};
use alloc::vec::Vec;
use core::ops::Bound;

use binder_wire::align_to_word;

use crate::types::{NodeId, TxId};

/// Page granularity of the lazy backing store.
pub const PAGE_SIZE: u64 = 4096;

/// Fixed per-buffer header charge inside the mapping.
pub const BUFFER_HEADER_SIZE: u64 = 64;

/// Upper bound on a single mapping.
pub const MAX_MAPPING_SIZE: u64 = 4 * 1024 * 1024;

const fn page_down(addr: u64) -> u64 {
    addr & !(PAGE_SIZE - 1)
}

const fn page_up(addr: u64) -> u64 {
    (addr + PAGE_SIZE - 1) & !(PAGE_SIZE - 1)
}

/// Why an allocation failed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PoolError {
    /// Sizes overflow or are otherwise unrepresentable.
    InvalidSize,
    /// Async budget exhausted.
    NoAsyncSpace,
    /// No free buffer large enough.
    NoSpace,
    /// An address fell outside the mapped range.
    BadAddress,
}

/// Bookkeeping for one region of the mapping.
#[derive(Debug)]
pub struct Buffer {
    pub debug_id: u32,
    pub free: bool,
    pub allow_user_free: bool,
    pub async_transaction: bool,
    pub data_size: u64,
    pub offsets_size: u64,
    /// Transaction currently using this buffer, if any.
    pub transaction: Option<TxId>,
    /// Node the carried transaction targets, if any.
    pub target_node: Option<NodeId>,
}

impl Buffer {
    fn new_free() -> Self {
        Buffer {
            debug_id: 0,
            free: true,
            allow_user_free: false,
            async_transaction: false,
            data_size: 0,
            offsets_size: 0,
            transaction: None,
            target_node: None,
        }
    }

    /// Effective payload footprint: word-aligned data plus offsets.
    pub fn effective_size(&self) -> u64 {
        align_to_word(self.data_size) + align_to_word(self.offsets_size)
    }
}

/// One process's buffer pool.
#[derive(Debug)]
pub struct Pool {
    base: u64,
    size: u64,
    user_offset: u64,
    /// Address-ordered map of every buffer, free and allocated.
    buffers: BTreeMap<u64, Buffer>,
    /// Free buffers by (capacity, address).
    free_index: BTreeSet<(u64, u64)>,
    pages: Vec<Option<Box<[u8]>>>,
    free_async_space: u64,
}

impl Pool {
    /// Create a pool over `[base, base + size)` with one free buffer
    /// spanning it. Only the first page is mapped up front.
    pub fn new(base: u64, user_offset: u64, size: u64) -> Self {
        debug_assert!(size % PAGE_SIZE == 0 && size > 0);
        let mut pool = Pool {
            base,
            size,
            user_offset,
            buffers: BTreeMap::new(),
            free_index: BTreeSet::new(),
            pages: Vec::new(),
            free_async_space: size / 2,
        };
        pool.pages.resize_with((size / PAGE_SIZE) as usize, || None);
        pool.map_range(base, base + PAGE_SIZE);
        pool.buffers.insert(base, Buffer::new_free());
        let cap = pool.capacity_of(base);
        pool.free_index.insert((cap, base));
        pool
    }

    // ========================================================================
    // Geometry
    // ========================================================================

    pub fn base(&self) -> u64 {
        self.base
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn user_offset(&self) -> u64 {
        self.user_offset
    }

    /// Async budget remaining.
    pub fn free_async_space(&self) -> u64 {
        self.free_async_space
    }

    /// Async budget a fresh pool of this size starts with.
    pub fn initial_async_space(&self) -> u64 {
        self.size / 2
    }

    /// Start of the payload area of the buffer headed at `addr`.
    pub fn data_addr(&self, addr: u64) -> u64 {
        addr + BUFFER_HEADER_SIZE
    }

    /// User-space address of the payload area of the buffer at `addr`.
    pub fn user_data_addr(&self, addr: u64) -> u64 {
        self.data_addr(addr) + self.user_offset
    }

    /// Payload capacity of the buffer headed at `addr`: the gap between its
    /// header and the next header (or the end of the mapping).
    pub fn capacity_of(&self, addr: u64) -> u64 {
        let next = self
            .buffers
            .range((Bound::Excluded(addr), Bound::Unbounded))
            .next()
            .map(|(&a, _)| a)
            .unwrap_or(self.base + self.size);
        next - self.data_addr(addr)
    }

    fn prev_addr(&self, addr: u64) -> Option<u64> {
        self.buffers.range(..addr).next_back().map(|(&a, _)| a)
    }

    fn next_addr(&self, addr: u64) -> Option<u64> {
        self.buffers
            .range((Bound::Excluded(addr), Bound::Unbounded))
            .next()
            .map(|(&a, _)| a)
    }

    pub fn get(&self, addr: u64) -> Option<&Buffer> {
        self.buffers.get(&addr)
    }

    pub fn get_mut(&mut self, addr: u64) -> Option<&mut Buffer> {
        self.buffers.get_mut(&addr)
    }

    /// All buffers in address order.
    pub fn buffers(&self) -> impl Iterator<Item = (u64, &Buffer)> {
        self.buffers.iter().map(|(&a, b)| (a, b))
    }

    /// Header addresses of all allocated buffers.
    pub fn allocated(&self) -> Vec<u64> {
        self.buffers
            .iter()
            .filter(|(_, b)| !b.free)
            .map(|(&a, _)| a)
            .collect()
    }

    /// Resolve a user-space payload pointer to the owning allocated buffer.
    pub fn lookup_user(&self, user_ptr: u64) -> Option<u64> {
        let addr = user_ptr
            .checked_sub(self.user_offset)?
            .checked_sub(BUFFER_HEADER_SIZE)?;
        match self.buffers.get(&addr) {
            Some(buffer) if !buffer.free => Some(addr),
            _ => None,
        }
    }

    // ========================================================================
    // Page mapping
    // ========================================================================

    fn map_range(&mut self, start: u64, end: u64) {
        let mut page_addr = start;
        while page_addr < end {
            let index = ((page_addr - self.base) / PAGE_SIZE) as usize;
            if self.pages[index].is_none() {
                self.pages[index] = Some(alloc::vec![0u8; PAGE_SIZE as usize].into_boxed_slice());
            }
            page_addr += PAGE_SIZE;
        }
    }

    fn unmap_range(&mut self, start: u64, end: u64) {
        let mut page_addr = start;
        while page_addr < end {
            let index = ((page_addr - self.base) / PAGE_SIZE) as usize;
            self.pages[index] = None;
            page_addr += PAGE_SIZE;
        }
    }

    /// Whether the page containing `addr` is currently mapped.
    pub fn is_mapped(&self, addr: u64) -> bool {
        if addr < self.base || addr >= self.base + self.size {
            return false;
        }
        self.pages[((addr - self.base) / PAGE_SIZE) as usize].is_some()
    }

    /// Number of currently mapped pages.
    pub fn mapped_pages(&self) -> usize {
        self.pages.iter().filter(|p| p.is_some()).count()
    }

    // ========================================================================
    // Payload access
    // ========================================================================

    /// Copy `src` into the mapping at `addr`.
    pub fn copy_in(&mut self, addr: u64, src: &[u8]) -> Result<(), PoolError> {
        let end = addr
            .checked_add(src.len() as u64)
            .ok_or(PoolError::BadAddress)?;
        if addr < self.base || end > self.base + self.size {
            return Err(PoolError::BadAddress);
        }
        let mut cursor = addr;
        let mut remaining = src;
        while !remaining.is_empty() {
            let index = ((cursor - self.base) / PAGE_SIZE) as usize;
            let offset = (cursor % PAGE_SIZE) as usize;
            let chunk = remaining.len().min(PAGE_SIZE as usize - offset);
            let page = self.pages[index].as_mut().ok_or(PoolError::BadAddress)?;
            page[offset..offset + chunk].copy_from_slice(&remaining[..chunk]);
            remaining = &remaining[chunk..];
            cursor += chunk as u64;
        }
        Ok(())
    }

    /// Copy `len` bytes out of the mapping at `addr`.
    pub fn copy_out(&self, addr: u64, len: u64) -> Result<Vec<u8>, PoolError> {
        let end = addr.checked_add(len).ok_or(PoolError::BadAddress)?;
        if addr < self.base || end > self.base + self.size {
            return Err(PoolError::BadAddress);
        }
        let mut out = Vec::with_capacity(len as usize);
        let mut cursor = addr;
        while (cursor) < end {
            let index = ((cursor - self.base) / PAGE_SIZE) as usize;
            let offset = (cursor % PAGE_SIZE) as usize;
            let chunk = ((end - cursor) as usize).min(PAGE_SIZE as usize - offset);
            let page = self.pages[index].as_ref().ok_or(PoolError::BadAddress)?;
            out.extend_from_slice(&page[offset..offset + chunk]);
            cursor += chunk as u64;
        }
        Ok(out)
    }

    // ========================================================================
    // Allocation
    // ========================================================================

    /// Allocate a buffer for `data_size` payload bytes plus `offsets_size`
    /// offset bytes. Returns the header address.
    pub fn alloc(
        &mut self,
        data_size: u64,
        offsets_size: u64,
        is_async: bool,
        debug_id: u32,
    ) -> Result<u64, PoolError> {
        let size = align_to_word(data_size)
            .checked_add(align_to_word(offsets_size))
            .ok_or(PoolError::InvalidSize)?;
        if size < data_size || size < offsets_size {
            return Err(PoolError::InvalidSize);
        }
        if is_async && self.free_async_space < size + BUFFER_HEADER_SIZE {
            log::trace!("pool: alloc size {size} failed, no async space left");
            return Err(PoolError::NoAsyncSpace);
        }

        // Best fit; ties broken by lowest address.
        let (found_cap, addr) = match self.free_index.range((size, 0)..).next() {
            Some(&(cap, addr)) => (cap, addr),
            None => {
                log::warn!("pool: alloc size {size} failed, no address space");
                return Err(PoolError::NoSpace);
            }
        };
        let exact = found_cap == size;
        let data_addr = self.data_addr(addr);

        // Page already owned by the next buffer; never map past it.
        let has_page_addr = page_down(data_addr + found_cap);
        let used = if exact {
            found_cap
        } else if size + BUFFER_HEADER_SIZE + 4 >= found_cap {
            // No room for a remainder worth keeping.
            found_cap.min(size)
        } else {
            size + BUFFER_HEADER_SIZE
        };
        let end_page_addr = page_up(data_addr + used).min(has_page_addr);
        self.map_range(page_up(data_addr), end_page_addr);

        self.free_index.remove(&(found_cap, addr));
        {
            let buffer = self.buffers.get_mut(&addr).expect("free buffer record");
            debug_assert!(buffer.free);
            buffer.free = false;
            buffer.debug_id = debug_id;
            buffer.allow_user_free = false;
            buffer.async_transaction = is_async;
            buffer.data_size = data_size;
            buffer.offsets_size = offsets_size;
            buffer.transaction = None;
            buffer.target_node = None;
        }

        if !exact && size + BUFFER_HEADER_SIZE + 4 < found_cap {
            // Split: the remainder gets its own header right after our data.
            let split_addr = data_addr + size;
            self.buffers.insert(split_addr, Buffer::new_free());
            let split_cap = self.capacity_of(split_addr);
            self.free_index.insert((split_cap, split_addr));
        }

        if is_async {
            self.free_async_space -= size + BUFFER_HEADER_SIZE;
        }
        log::trace!("pool: alloc size {size} got buffer {addr:#x} (async {is_async})");
        Ok(addr)
    }

    // ========================================================================
    // Free
    // ========================================================================

    /// Release the buffer headed at `addr`, coalescing with free neighbors
    /// and dropping pages no live buffer covers.
    pub fn free(&mut self, addr: u64) {
        let capacity = self.capacity_of(addr);
        let (size, was_async) = {
            let buffer = self.buffers.get(&addr).expect("allocated buffer record");
            debug_assert!(!buffer.free);
            debug_assert!(buffer.transaction.is_none());
            debug_assert!(buffer.effective_size() <= capacity);
            (buffer.effective_size(), buffer.async_transaction)
        };
        log::trace!("pool: free buffer {addr:#x} size {size} capacity {capacity}");

        if was_async {
            self.free_async_space += size + BUFFER_HEADER_SIZE;
        }

        let data_addr = self.data_addr(addr);
        self.unmap_range(page_up(data_addr), page_down(data_addr + capacity));

        {
            let buffer = self.buffers.get_mut(&addr).expect("allocated buffer record");
            buffer.free = true;
        }

        let mut merged = addr;
        if let Some(next) = self.next_addr(addr) {
            if self.buffers[&next].free {
                let next_cap = self.capacity_of(next);
                self.free_index.remove(&(next_cap, next));
                self.delete_free_buffer(next);
            }
        }
        if let Some(prev) = self.prev_addr(addr) {
            if self.buffers[&prev].free {
                let prev_cap = self.capacity_of(prev);
                self.delete_free_buffer(addr);
                self.free_index.remove(&(prev_cap, prev));
                merged = prev;
            }
        }
        let cap = self.capacity_of(merged);
        self.free_index.insert((cap, merged));
    }

    /// Remove a free buffer record whose span is being merged into its
    /// predecessor, releasing its header's page(s) unless a neighbor shares
    /// them.
    fn delete_free_buffer(&mut self, addr: u64) {
        let header_start_page = page_down(addr);
        let header_end_page = page_down(addr + BUFFER_HEADER_SIZE - 1);

        let prev = self.prev_addr(addr).expect("merged buffer has predecessor");
        debug_assert!(self.buffers[&prev].free);
        let prev_end_page = page_down(prev + BUFFER_HEADER_SIZE - 1);

        let mut free_page_start = true;
        let mut free_page_end = true;
        if prev_end_page == header_start_page {
            free_page_start = false;
            if prev_end_page == header_end_page {
                free_page_end = false;
            }
        }
        if let Some(next) = self.next_addr(addr) {
            let next_start_page = page_down(next);
            if next_start_page == header_end_page {
                free_page_end = false;
                if next_start_page == header_start_page {
                    free_page_start = false;
                }
            }
        }

        self.buffers.remove(&addr);
        if free_page_start || free_page_end {
            let start = if free_page_start {
                header_start_page
            } else {
                header_end_page
            };
            let end = if free_page_end {
                header_end_page
            } else {
                header_start_page
            };
            self.unmap_range(start, end + PAGE_SIZE);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const BASE: u64 = 0x1000_0000;
    const USER_OFFSET: u64 = 0x8000_0000_0000;

    fn pool(size: u64) -> Pool {
        Pool::new(BASE, USER_OFFSET, size)
    }

    fn check_partition(pool: &Pool) {
        let mut cursor = pool.base();
        let mut prev_free: Option<bool> = None;
        for (addr, buffer) in pool.buffers() {
            assert_eq!(addr, cursor, "buffers must partition the mapping");
            cursor = addr + BUFFER_HEADER_SIZE + pool.capacity_of(addr);
            if let Some(prev) = prev_free {
                assert!(
                    !(prev && buffer.free),
                    "neighboring free buffers must have been coalesced"
                );
            }
            prev_free = Some(buffer.free);
        }
        assert_eq!(cursor, pool.base() + pool.size());
    }

    #[test]
    fn test_new_pool_single_free_buffer() {
        let pool = pool(128 * 1024);
        let buffers: Vec<_> = pool.buffers().collect();
        assert_eq!(buffers.len(), 1);
        assert!(buffers[0].1.free);
        assert_eq!(pool.capacity_of(BASE), 128 * 1024 - BUFFER_HEADER_SIZE);
        assert_eq!(pool.free_async_space(), 64 * 1024);
        // Only the first page is mapped up front.
        assert_eq!(pool.mapped_pages(), 1);
        check_partition(&pool);
    }

    #[test]
    fn test_alloc_splits_and_maps_lazily() {
        let mut pool = pool(128 * 1024);
        let addr = pool.alloc(4096, 16, false, 1).unwrap();
        assert_eq!(addr, BASE);

        let buffers: Vec<_> = pool.buffers().collect();
        assert_eq!(buffers.len(), 2);
        assert!(!buffers[0].1.free);
        assert!(buffers[1].1.free);
        // Pages now cover the allocated span.
        assert!(pool.mapped_pages() >= 2);
        check_partition(&pool);

        // The payload area round-trips.
        let data = pool.data_addr(addr);
        pool.copy_in(data, &[0xAB; 4096]).unwrap();
        assert_eq!(pool.copy_out(data, 4096).unwrap(), alloc::vec![0xAB; 4096]);
    }

    #[test]
    fn test_best_fit_prefers_smallest_then_lowest() {
        let mut pool = pool(128 * 1024);
        // Carve three allocations, then free the first and third to leave two
        // free gaps of different sizes.
        let a = pool.alloc(8192, 0, false, 1).unwrap();
        let b = pool.alloc(256, 0, false, 2).unwrap();
        let c = pool.alloc(4096, 0, false, 3).unwrap();
        let _d = pool.alloc(256, 0, false, 4).unwrap();
        pool.free(a);
        pool.free(c);
        check_partition(&pool);

        // A 4096 request must land in the smaller (4096) gap, not the 8192.
        let e = pool.alloc(4096, 0, false, 5).unwrap();
        assert_eq!(e, c);

        // A second identical request takes the larger gap at the lower address.
        let f = pool.alloc(4096, 0, false, 6).unwrap();
        assert_eq!(f, a);
        let _ = b;
    }

    #[test]
    fn test_free_coalesces_both_sides() {
        let mut pool = pool(64 * 1024);
        let a = pool.alloc(1024, 0, false, 1).unwrap();
        let b = pool.alloc(1024, 0, false, 2).unwrap();
        let c = pool.alloc(1024, 0, false, 3).unwrap();

        pool.free(a);
        pool.free(c);
        check_partition(&pool);
        pool.free(b);
        check_partition(&pool);

        // Everything merged back into a single spanning free buffer.
        let buffers: Vec<_> = pool.buffers().collect();
        assert_eq!(buffers.len(), 1);
        assert!(buffers[0].1.free);
        assert_eq!(pool.mapped_pages(), 1);
    }

    #[test]
    fn test_no_split_when_remainder_too_small() {
        let mut pool = pool(4096);
        // Capacity is 4096 - 64; ask for slightly less so the remainder
        // cannot hold a header plus a word.
        let cap = pool.capacity_of(BASE);
        let request = cap - BUFFER_HEADER_SIZE;
        let addr = pool.alloc(request, 0, false, 1).unwrap();
        assert_eq!(addr, BASE);
        assert_eq!(pool.buffers().count(), 1);
    }

    #[test]
    fn test_async_space_accounting() {
        let mut pool = pool(32 * 1024);
        let initial = pool.free_async_space();
        assert_eq!(initial, 16 * 1024);

        let a = pool.alloc(1000, 24, true, 1).unwrap();
        let expected = initial - (align_to_word(1000) + align_to_word(24) + BUFFER_HEADER_SIZE);
        assert_eq!(pool.free_async_space(), expected);

        pool.free(a);
        assert_eq!(pool.free_async_space(), initial);

        // Exhaustion is reported before touching the free map.
        assert_eq!(
            pool.alloc(17 * 1024, 0, true, 2),
            Err(PoolError::NoAsyncSpace)
        );
        // The same request succeeds synchronously.
        let b = pool.alloc(17 * 1024, 0, false, 3).unwrap();
        pool.free(b);
    }

    #[test]
    fn test_alloc_failures() {
        let mut pool = pool(8192);
        assert_eq!(
            pool.alloc(u64::MAX - 4, 16, false, 1),
            Err(PoolError::InvalidSize)
        );
        assert_eq!(pool.alloc(64 * 1024, 0, false, 2), Err(PoolError::NoSpace));
    }

    #[test]
    fn test_lookup_user() {
        let mut pool = pool(16 * 1024);
        let addr = pool.alloc(128, 0, false, 7).unwrap();
        let user = pool.user_data_addr(addr);
        assert_eq!(pool.lookup_user(user), Some(addr));
        assert_eq!(pool.lookup_user(user + 8), None);
        assert_eq!(pool.lookup_user(0x10), None);

        pool.free(addr);
        assert_eq!(pool.lookup_user(user), None);
    }

    #[test]
    fn test_zero_sized_alloc() {
        let mut pool = pool(16 * 1024);
        let addr = pool.alloc(0, 0, false, 1).unwrap();
        let buffer = pool.get(addr).unwrap();
        assert_eq!(buffer.data_size, 0);
        assert_eq!(buffer.effective_size(), 0);
        check_partition(&pool);
        pool.free(addr);
        check_partition(&pool);
    }

    #[test]
    fn test_pages_released_inward_on_free() {
        let mut pool = pool(64 * 1024);
        let a = pool.alloc(3 * 4096, 0, false, 1).unwrap();
        let mapped_during = pool.mapped_pages();
        assert!(mapped_during >= 3);
        pool.free(a);
        assert!(pool.mapped_pages() < mapped_during);
        check_partition(&pool);
    }
}
