//! Per-process state: object tables, thread pool, work queue, descriptor
//! table, governor counters.

use alloc::collections::{BTreeMap, VecDeque};
use alloc::vec::Vec;

use binder_wire::br;

use crate::pool::Pool;
use crate::stats::ProtocolStats;
use crate::types::{DeathId, FileId, LooperState, NodeId, Pid, RefId, Tid, Work};

/// One worker thread known to the endpoint.
#[derive(Debug)]
pub struct Thread {
    pub tid: Tid,
    pub looper: LooperState,
    pub todo: VecDeque<Work>,
    /// Top of the nested-transaction stack.
    pub transaction_stack: Option<crate::types::TxId>,
    /// Pending error to drain on the next read (br::OK when clear).
    pub return_error: u32,
    /// Secondary slot, used when a reply-to-dead is also pending.
    pub return_error2: u32,
    /// Current scheduling priority (nice value).
    pub nice: i32,
    pub stats: ProtocolStats,
}

impl Thread {
    pub fn new(tid: Tid, nice: i32) -> Self {
        Thread {
            tid,
            looper: LooperState::NEED_RETURN,
            todo: VecDeque::new(),
            transaction_stack: None,
            return_error: br::OK,
            return_error2: br::OK,
            nice,
            stats: ProtocolStats::default(),
        }
    }

    /// Whether this thread has anything deliverable of its own.
    pub fn has_work(&self) -> bool {
        !self.todo.is_empty()
            || self.return_error != br::OK
            || self.looper.contains(LooperState::NEED_RETURN)
    }
}

/// One opened endpoint.
#[derive(Debug)]
pub struct Proc {
    pub pid: Pid,
    pub uid: u32,
    /// Nice value worker threads fall back to while idle on process work.
    pub default_nice: i32,
    /// Lowest nice value threads of this process may take (resource-limit
    /// analog); priority inheritance clamps here.
    pub nice_floor: i32,
    /// Shared mapping; `None` until mmap.
    pub pool: Option<Pool>,
    /// Exported services by their user-space service pointer.
    pub nodes_by_ptr: BTreeMap<u64, NodeId>,
    /// Imported references by descriptor.
    pub refs_by_desc: BTreeMap<u32, RefId>,
    /// Imported references by target node.
    pub refs_by_node: BTreeMap<NodeId, RefId>,
    pub threads: BTreeMap<Tid, Thread>,
    pub todo: VecDeque<Work>,
    /// Death notifications delivered but not yet acknowledged.
    pub delivered_death: Vec<DeathId>,
    /// File capabilities by descriptor.
    pub fd_table: BTreeMap<u32, FileId>,
    pub max_threads: u32,
    pub requested_threads: u32,
    pub requested_threads_started: u32,
    pub ready_threads: u32,
    /// Set once release has been scheduled; new work is refused.
    pub dead: bool,
    pub stats: ProtocolStats,
}

impl Proc {
    pub fn new(pid: Pid, uid: u32, default_nice: i32, nice_floor: i32) -> Self {
        Proc {
            pid,
            uid,
            default_nice,
            nice_floor,
            pool: None,
            nodes_by_ptr: BTreeMap::new(),
            refs_by_desc: BTreeMap::new(),
            refs_by_node: BTreeMap::new(),
            threads: BTreeMap::new(),
            todo: VecDeque::new(),
            delivered_death: Vec::new(),
            fd_table: BTreeMap::new(),
            max_threads: 0,
            requested_threads: 0,
            requested_threads_started: 0,
            ready_threads: 0,
            dead: false,
            stats: ProtocolStats::default(),
        }
    }

    /// Smallest descriptor not in use, honoring the context-manager reserve.
    ///
    /// Descriptor 0 belongs to references to the context-manager node; all
    /// other references start scanning at 1.
    pub fn unused_desc(&self, context_mgr: bool) -> u32 {
        let mut desc = if context_mgr { 0 } else { 1 };
        for &used in self.refs_by_desc.keys() {
            if used > desc {
                break;
            }
            desc = used + 1;
        }
        desc
    }

    /// Smallest file descriptor not in use.
    pub fn unused_fd(&self) -> u32 {
        let mut fd = 0;
        for &used in self.fd_table.keys() {
            if used > fd {
                break;
            }
            fd = used + 1;
        }
        fd
    }

    /// Whether the process queue has deliverable work for `thread`.
    pub fn has_proc_work(&self, thread: &Thread) -> bool {
        !self.todo.is_empty() || thread.looper.contains(LooperState::NEED_RETURN)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn proc() -> Proc {
        Proc::new(Pid(1), 1000, 0, -20)
    }

    #[test]
    fn test_unused_desc_reserves_zero() {
        let mut p = proc();
        assert_eq!(p.unused_desc(false), 1);
        assert_eq!(p.unused_desc(true), 0);

        p.refs_by_desc.insert(0, RefId(10));
        p.refs_by_desc.insert(1, RefId(11));
        p.refs_by_desc.insert(2, RefId(12));
        assert_eq!(p.unused_desc(false), 3);

        // A gap is filled before the tail.
        p.refs_by_desc.remove(&1);
        assert_eq!(p.unused_desc(false), 1);
    }

    #[test]
    fn test_unused_fd_scans_gaps() {
        let mut p = proc();
        assert_eq!(p.unused_fd(), 0);
        p.fd_table.insert(0, FileId(1));
        p.fd_table.insert(2, FileId(2));
        assert_eq!(p.unused_fd(), 1);
        p.fd_table.insert(1, FileId(3));
        assert_eq!(p.unused_fd(), 3);
    }

    #[test]
    fn test_thread_has_work() {
        let mut t = Thread::new(Tid(7), 0);
        // Fresh threads must return to user space promptly.
        assert!(t.has_work());
        t.looper.remove(LooperState::NEED_RETURN);
        assert!(!t.has_work());

        t.return_error = br::DEAD_REPLY;
        assert!(t.has_work());
        t.return_error = br::OK;

        t.todo.push_back(Work::TransactionComplete);
        assert!(t.has_work());
    }
}
