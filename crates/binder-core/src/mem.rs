//! Caller-memory seam.
//!
//! The transaction path copies payload bytes out of the sending process's
//! address space exactly once. The host supplies that address space through
//! [`UserMemory`]; tests use [`SparseMemory`] to stage payloads at synthetic
//! addresses.

use alloc::collections::BTreeMap;
use alloc::vec::Vec;

/// Read access to the bytes a sender's pointers refer to.
pub trait UserMemory {
    /// Read `len` bytes at `addr`, or `None` if the range is not readable.
    fn read(&self, addr: u64, len: u64) -> Option<Vec<u8>>;
}

/// A set of staged regions, each at a fixed base address.
#[derive(Debug, Default)]
pub struct SparseMemory {
    regions: BTreeMap<u64, Vec<u8>>,
}

impl SparseMemory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stage `bytes` at `addr`, replacing any previous region there.
    pub fn insert(&mut self, addr: u64, bytes: Vec<u8>) {
        self.regions.insert(addr, bytes);
    }

    /// Stage `bytes` and return a builder-style self for test setup.
    pub fn with(mut self, addr: u64, bytes: Vec<u8>) -> Self {
        self.insert(addr, bytes);
        self
    }
}

impl UserMemory for SparseMemory {
    fn read(&self, addr: u64, len: u64) -> Option<Vec<u8>> {
        if len == 0 {
            return Some(Vec::new());
        }
        // The containing region is the last one starting at or before addr.
        let (&base, bytes) = self.regions.range(..=addr).next_back()?;
        let start = (addr - base) as usize;
        let end = start.checked_add(len as usize)?;
        if end > bytes.len() {
            return None;
        }
        Some(bytes[start..end].to_vec())
    }
}

/// An address space with nothing mapped; zero-length reads still succeed.
#[derive(Debug, Default)]
pub struct NoMemory;

impl UserMemory for NoMemory {
    fn read(&self, _addr: u64, len: u64) -> Option<Vec<u8>> {
        if len == 0 {
            Some(Vec::new())
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::vec;

    #[test]
    fn test_sparse_memory_reads_within_region() {
        let mem = SparseMemory::new().with(0x1000, vec![1, 2, 3, 4]);
        assert_eq!(mem.read(0x1000, 4), Some(vec![1, 2, 3, 4]));
        assert_eq!(mem.read(0x1002, 2), Some(vec![3, 4]));
        assert_eq!(mem.read(0x1002, 3), None);
        assert_eq!(mem.read(0x2000, 1), None);
        assert_eq!(mem.read(0x0, 0), Some(vec![]));
    }
}
