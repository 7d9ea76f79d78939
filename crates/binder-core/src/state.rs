//! The global core state and the endpoint operations.
//!
//! `CoreState` is a pure state machine: every mutation happens through a
//! method taking the caller's identity (pid/tid) as an argument, and nothing
//! here blocks, sleeps, or touches the host. The three pieces of process-wide
//! mutable state the design calls out - the process set, the orphan-node set,
//! and the single context-manager slot with its sticky uid - are explicit
//! fields.

use alloc::collections::{BTreeMap, BTreeSet};
use alloc::vec::Vec;

use binder_wire::PROTOCOL_VERSION;

use crate::pool::{Pool, MAX_MAPPING_SIZE, PAGE_SIZE};
use crate::proc::{Proc, Thread};
use crate::stats::{ObjKind, Stats, TransactionLog};
use crate::types::{
    DeathId, DeathRecord, FileId, FileObject, LooperState, Node, NodeId, Pid, Ref, RefId, Tid,
    Transaction, TxId, Work,
};

/// Kernel-side base address of the first mapping; later mappings are spaced
/// apart so pools never overlap.
const MAPPING_BASE: u64 = 0x0000_0100_0000_0000;
const MAPPING_STRIDE: u64 = 0x1000_0000;
/// Distance between a pool's kernel and user addresses.
const USER_BUFFER_OFFSET: u64 = 0x4000_0000_0000;

/// Failure of an endpoint operation (errno analog).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OpError {
    /// A process with this pid already has an endpoint.
    AlreadyOpen,
    /// No such process.
    NoProcess,
    /// The process is being destroyed; all further calls fail.
    Dead,
    /// The endpoint already has a mapping.
    AlreadyMapped,
    /// Malformed argument.
    BadArg,
    /// Writable mappings are refused.
    PermissionDenied,
    /// The context-manager slot is occupied.
    Busy,
}

/// Result of a successful mmap.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MappingInfo {
    /// Base of the mapping in the process's address space.
    pub user_base: u64,
    /// Mapping length after page rounding and clamping.
    pub len: u64,
}

/// The whole IPC core as one value.
#[derive(Debug, Default)]
pub struct CoreState {
    pub procs: BTreeMap<Pid, Proc>,
    pub nodes: BTreeMap<NodeId, Node>,
    pub refs: BTreeMap<RefId, Ref>,
    pub transactions: BTreeMap<TxId, Transaction>,
    pub deaths: BTreeMap<DeathId, DeathRecord>,
    pub files: BTreeMap<FileId, FileObject>,
    /// Nodes whose home process died while references survived.
    pub orphan_nodes: BTreeSet<NodeId>,
    /// The advertised context-manager node.
    pub context_mgr: Option<NodeId>,
    /// Sticky uid recorded at first registration.
    pub context_mgr_uid: Option<u32>,
    pub stats: Stats,
    pub transaction_log: TransactionLog,
    pub failed_transaction_log: TransactionLog,
    last_debug_id: u32,
    next_node: u64,
    next_ref: u64,
    next_tx: u64,
    next_death: u64,
    next_file: u64,
    mappings: u64,
}

impl CoreState {
    pub fn new() -> Self {
        Self::default()
    }

    // ========================================================================
    // Id allocation
    // ========================================================================

    /// Debug ids are monotonic across all object kinds.
    pub fn alloc_debug_id(&mut self) -> u32 {
        self.last_debug_id += 1;
        self.last_debug_id
    }

    fn alloc_node_id(&mut self) -> NodeId {
        self.next_node += 1;
        NodeId(self.next_node)
    }

    pub(crate) fn alloc_ref_id(&mut self) -> RefId {
        self.next_ref += 1;
        RefId(self.next_ref)
    }

    pub(crate) fn alloc_tx_id(&mut self) -> TxId {
        self.next_tx += 1;
        TxId(self.next_tx)
    }

    pub(crate) fn alloc_death_id(&mut self) -> DeathId {
        self.next_death += 1;
        DeathId(self.next_death)
    }

    // ========================================================================
    // Endpoint operations
    // ========================================================================

    /// Open an endpoint for `pid`.
    pub fn open(
        &mut self,
        pid: Pid,
        uid: u32,
        default_nice: i32,
        nice_floor: i32,
    ) -> Result<(), OpError> {
        if self.procs.contains_key(&pid) {
            return Err(OpError::AlreadyOpen);
        }
        log::debug!("binder: open {}", pid.0);
        self.procs
            .insert(pid, Proc::new(pid, uid, default_nice, nice_floor));
        self.stats.objects.created(ObjKind::Proc);
        Ok(())
    }

    /// Map the shared region backing the process's buffer pool.
    pub fn mmap(&mut self, pid: Pid, len: u64, writable: bool) -> Result<MappingInfo, OpError> {
        if writable {
            return Err(OpError::PermissionDenied);
        }
        if len == 0 {
            return Err(OpError::BadArg);
        }
        let len = len.min(MAX_MAPPING_SIZE);
        let len = (len + PAGE_SIZE - 1) & !(PAGE_SIZE - 1);

        let slot = self.mappings;
        let proc = self.proc_mut(pid)?;
        if proc.pool.is_some() {
            return Err(OpError::AlreadyMapped);
        }
        let base = MAPPING_BASE + slot * MAPPING_STRIDE;
        proc.pool = Some(Pool::new(base, USER_BUFFER_OFFSET, len));
        self.mappings += 1;
        log::debug!("binder: mmap {}: {:#x}-{:#x}", pid.0, base, base + len);
        Ok(MappingInfo {
            user_base: base + USER_BUFFER_OFFSET,
            len,
        })
    }

    /// Protocol version handshake.
    pub fn version(&self) -> i32 {
        PROTOCOL_VERSION
    }

    /// Cap on driver-requested worker threads.
    pub fn set_max_threads(&mut self, pid: Pid, max: u32) -> Result<(), OpError> {
        self.proc_mut(pid)?.max_threads = max;
        Ok(())
    }

    /// Claim the context-manager slot.
    ///
    /// The first registration records the caller's uid; later attempts must
    /// match it. The new node starts with one local strong and one local weak
    /// hold and its lifecycle work queued, so the registering process is told
    /// to take its counts on its next read.
    pub fn set_context_mgr(&mut self, pid: Pid) -> Result<NodeId, OpError> {
        if self.context_mgr.is_some() {
            log::warn!("binder: context manager already set");
            return Err(OpError::Busy);
        }
        let uid = self.proc(pid)?.uid;
        match self.context_mgr_uid {
            Some(recorded) if recorded != uid => {
                log::warn!("binder: set_context_mgr bad uid {uid} != {recorded}");
                return Err(OpError::PermissionDenied);
            }
            Some(_) => {}
            None => self.context_mgr_uid = Some(uid),
        }
        let node_id = self.new_node(pid, 0, 0).ok_or(OpError::Busy)?;
        {
            let node = self.nodes.get_mut(&node_id).expect("fresh node");
            node.local_strong = 1;
            node.local_weak = 1;
            node.work_queued = true;
        }
        self.enqueue_proc_work(pid, Work::Node(node_id));
        self.context_mgr = Some(node_id);
        log::debug!("binder: {} is context manager (node {:?})", pid.0, node_id);
        Ok(node_id)
    }

    /// Whether a read would return without blocking.
    pub fn poll(&mut self, pid: Pid, tid: Tid) -> bool {
        if self.proc(pid).is_err() {
            return false;
        }
        self.get_thread(pid, tid);
        let proc = self.procs.get(&pid).expect("proc");
        let thread = proc.threads.get(&tid).expect("thread");
        let idle = thread.transaction_stack.is_none()
            && thread.todo.is_empty()
            && thread.return_error == binder_wire::br::OK;
        if idle {
            proc.has_proc_work(thread)
        } else {
            thread.has_work()
        }
    }

    /// Wake predicate for a blocked reader. A vanished or dying process
    /// reads as ready so its sleepers return and observe the failure.
    pub fn readable(&self, pid: Pid, tid: Tid, wait_for_proc_work: bool) -> bool {
        let Some(proc) = self.procs.get(&pid) else {
            return true;
        };
        if proc.dead {
            return true;
        }
        let Some(thread) = proc.threads.get(&tid) else {
            return true;
        };
        if wait_for_proc_work {
            proc.has_proc_work(thread)
        } else {
            thread.has_work()
        }
    }

    /// Ioctl epilogue: the thread is back in user space.
    pub fn finish_op(&mut self, pid: Pid, tid: Tid) {
        if let Ok(proc) = self.proc_mut(pid) {
            if let Some(thread) = proc.threads.get_mut(&tid) {
                thread.looper.remove(LooperState::NEED_RETURN);
            }
        }
    }

    // ========================================================================
    // Wait bookkeeping (the host sleeps; the core only counts)
    // ========================================================================

    /// Mark a thread as blocked in read. Returns true when it will serve
    /// the process queue (idle thread), which also parks it at the process's
    /// default priority and counts it ready.
    pub fn begin_wait(&mut self, pid: Pid, tid: Tid) -> bool {
        self.get_thread(pid, tid);
        let proc = self.procs.get_mut(&pid).expect("proc");
        let default_nice = proc.default_nice;
        let proc_work = {
            let thread = proc.threads.get_mut(&tid).expect("thread");
            let proc_work = thread.transaction_stack.is_none() && thread.todo.is_empty();
            thread.looper.insert(LooperState::WAITING);
            if proc_work {
                thread.nice = default_nice;
            }
            proc_work
        };
        if proc_work {
            proc.ready_threads += 1;
        }
        proc_work
    }

    /// Undo [`begin_wait`](Self::begin_wait) after the host wakes up.
    pub fn finish_wait(&mut self, pid: Pid, tid: Tid, proc_work: bool) {
        if let Ok(proc) = self.proc_mut(pid) {
            if proc_work {
                proc.ready_threads = proc.ready_threads.saturating_sub(1);
            }
            if let Some(thread) = proc.threads.get_mut(&tid) {
                thread.looper.remove(LooperState::WAITING);
            }
        }
    }

    // ========================================================================
    // Table helpers
    // ========================================================================

    pub fn proc(&self, pid: Pid) -> Result<&Proc, OpError> {
        let proc = self.procs.get(&pid).ok_or(OpError::NoProcess)?;
        if proc.dead {
            return Err(OpError::Dead);
        }
        Ok(proc)
    }

    pub fn proc_mut(&mut self, pid: Pid) -> Result<&mut Proc, OpError> {
        let proc = self.procs.get_mut(&pid).ok_or(OpError::NoProcess)?;
        if proc.dead {
            return Err(OpError::Dead);
        }
        Ok(proc)
    }

    /// Look up the calling thread, creating it on first contact.
    pub fn get_thread(&mut self, pid: Pid, tid: Tid) -> &mut Thread {
        let proc = self.procs.get_mut(&pid).expect("process is open");
        let default_nice = proc.default_nice;
        if !proc.threads.contains_key(&tid) {
            proc.threads.insert(tid, Thread::new(tid, default_nice));
            self.stats.objects.created(ObjKind::Thread);
            log::trace!("binder: {}:{} new thread", pid.0, tid.0);
        }
        self.procs
            .get_mut(&pid)
            .expect("process is open")
            .threads
            .get_mut(&tid)
            .expect("just inserted")
    }

    pub fn thread(&self, pid: Pid, tid: Tid) -> Option<&Thread> {
        self.procs.get(&pid)?.threads.get(&tid)
    }

    pub(crate) fn enqueue_proc_work(&mut self, pid: Pid, work: Work) {
        if let Some(proc) = self.procs.get_mut(&pid) {
            proc.todo.push_back(work);
        }
    }

    pub(crate) fn enqueue_thread_work(&mut self, pid: Pid, tid: Tid, work: Work) {
        self.get_thread(pid, tid).todo.push_back(work);
    }

    /// Remove a node's lifecycle work item from wherever it is queued.
    pub(crate) fn remove_node_work(&mut self, owner: Pid, node_id: NodeId) {
        if let Some(proc) = self.procs.get_mut(&owner) {
            proc.todo.retain(|w| *w != Work::Node(node_id));
            for thread in proc.threads.values_mut() {
                thread.todo.retain(|w| *w != Work::Node(node_id));
            }
        }
        if let Some(node) = self.nodes.get_mut(&node_id) {
            node.work_queued = false;
        }
    }

    /// Remove a death record's work item from the owner's queues.
    pub(crate) fn remove_death_work(&mut self, owner: Pid, death_id: DeathId) {
        if let Some(proc) = self.procs.get_mut(&owner) {
            proc.todo.retain(|w| *w != Work::Death(death_id));
            for thread in proc.threads.values_mut() {
                thread.todo.retain(|w| *w != Work::Death(death_id));
            }
            proc.delivered_death.retain(|d| *d != death_id);
        }
        if let Some(death) = self.deaths.get_mut(&death_id) {
            death.queued = false;
        }
    }

    // ========================================================================
    // Nodes
    // ========================================================================

    /// Create a node for (`pid`, `ptr`); fails if the pointer is already
    /// exported.
    pub fn new_node(&mut self, pid: Pid, ptr: u64, cookie: u64) -> Option<NodeId> {
        if self.procs.get(&pid)?.nodes_by_ptr.contains_key(&ptr) {
            return None;
        }
        let id = self.alloc_node_id();
        let debug_id = self.alloc_debug_id();
        let node = Node {
            id,
            debug_id,
            owner: Some(pid),
            ptr,
            cookie,
            internal_strong: 0,
            local_strong: 0,
            local_weak: 0,
            has_strong_ref: false,
            has_weak_ref: false,
            pending_strong_ref: false,
            pending_weak_ref: false,
            has_async_transaction: false,
            accept_fds: false,
            min_priority: 0,
            refs: Vec::new(),
            async_todo: alloc::collections::VecDeque::new(),
            work_queued: false,
        };
        self.nodes.insert(id, node);
        self.procs
            .get_mut(&pid)
            .expect("checked above")
            .nodes_by_ptr
            .insert(ptr, id);
        self.stats.objects.created(ObjKind::Node);
        log::debug!(
            "binder: {} node {} u{:016x} c{:016x} created",
            pid.0,
            debug_id,
            ptr,
            cookie
        );
        Some(id)
    }

    /// Node exported by `pid` under `ptr`, if any.
    pub fn node_by_ptr(&self, pid: Pid, ptr: u64) -> Option<NodeId> {
        self.procs.get(&pid)?.nodes_by_ptr.get(&ptr).copied()
    }

    // ========================================================================
    // File capabilities
    // ========================================================================

    /// Mint a new file object with one count and install it in `pid`'s
    /// descriptor table, returning the descriptor.
    pub fn file_install_new(&mut self, pid: Pid) -> Result<u32, OpError> {
        self.next_file += 1;
        let id = FileId(self.next_file);
        self.files.insert(id, FileObject { id, count: 1 });
        let proc = self.proc_mut(pid)?;
        let fd = proc.unused_fd();
        proc.fd_table.insert(fd, id);
        Ok(fd)
    }

    /// Take one count on the file behind (`pid`, `fd`) - the `fget` analog.
    pub(crate) fn file_get(&mut self, pid: Pid, fd: u32) -> Option<FileId> {
        let id = *self.procs.get(&pid)?.fd_table.get(&fd)?;
        self.files.get_mut(&id)?.count += 1;
        Some(id)
    }

    /// Drop one count - the `fput` analog.
    pub(crate) fn file_put(&mut self, id: FileId) {
        if let Some(file) = self.files.get_mut(&id) {
            file.count -= 1;
            if file.count == 0 {
                self.files.remove(&id);
            }
        }
    }

    /// Install `file` (already counted) under the lowest free descriptor in
    /// the target process.
    pub(crate) fn fd_install(&mut self, pid: Pid, file: FileId) -> Option<u32> {
        let proc = self.procs.get_mut(&pid)?;
        let fd = proc.unused_fd();
        proc.fd_table.insert(fd, file);
        Some(fd)
    }

    /// Close a descriptor, dropping its count.
    pub(crate) fn fd_close(&mut self, pid: Pid, fd: u32) {
        let removed = self
            .procs
            .get_mut(&pid)
            .and_then(|proc| proc.fd_table.remove(&fd));
        if let Some(id) = removed {
            self.file_put(id);
        }
    }

    // ========================================================================
    // Scheduling priority
    // ========================================================================

    /// Set a thread's nice value, clamped at the process's floor.
    pub(crate) fn set_nice(&mut self, pid: Pid, tid: Tid, nice: i32) {
        let Some(proc) = self.procs.get_mut(&pid) else {
            return;
        };
        let floor = proc.nice_floor;
        let Some(thread) = proc.threads.get_mut(&tid) else {
            return;
        };
        if nice < floor {
            log::warn!(
                "binder: {}:{} nice value {} not allowed, using {}",
                pid.0,
                tid.0,
                nice,
                floor
            );
            thread.nice = floor;
        } else {
            thread.nice = nice;
        }
    }

    /// Current nice value of a thread, if known.
    pub fn thread_nice(&self, pid: Pid, tid: Tid) -> Option<i32> {
        Some(self.thread(pid, tid)?.nice)
    }

    // ========================================================================
    // Buffer access for hosts and tests
    // ========================================================================

    /// Copy the payload of the allocated buffer a received `data_ptr` points
    /// at, as the target process would read it through its mapping.
    pub fn buffer_bytes(&self, pid: Pid, user_data_ptr: u64) -> Option<Vec<u8>> {
        let pool = self.procs.get(&pid)?.pool.as_ref()?;
        let addr = pool.lookup_user(user_data_ptr)?;
        let buffer = pool.get(addr)?;
        pool.copy_out(pool.data_addr(addr), buffer.data_size).ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_and_reopen() {
        let mut state = CoreState::new();
        assert!(state.open(Pid(1), 1000, 0, -20).is_ok());
        assert_eq!(state.open(Pid(1), 1000, 0, -20), Err(OpError::AlreadyOpen));
        assert!(state.open(Pid(2), 1000, 0, -20).is_ok());
    }

    #[test]
    fn test_mmap_rules() {
        let mut state = CoreState::new();
        state.open(Pid(1), 1000, 0, -20).unwrap();

        assert_eq!(
            state.mmap(Pid(1), 128 * 1024, true),
            Err(OpError::PermissionDenied)
        );
        assert_eq!(state.mmap(Pid(1), 0, false), Err(OpError::BadArg));

        let info = state.mmap(Pid(1), 128 * 1024, false).unwrap();
        assert_eq!(info.len, 128 * 1024);
        assert_eq!(
            state.mmap(Pid(1), 128 * 1024, false),
            Err(OpError::AlreadyMapped)
        );

        // Oversized mappings are clamped, odd sizes page-rounded.
        state.open(Pid(2), 1000, 0, -20).unwrap();
        let info = state.mmap(Pid(2), 64 * 1024 * 1024, false).unwrap();
        assert_eq!(info.len, MAX_MAPPING_SIZE);
        state.open(Pid(3), 1000, 0, -20).unwrap();
        let info = state.mmap(Pid(3), 5000, false).unwrap();
        assert_eq!(info.len, 8192);
    }

    #[test]
    fn test_version() {
        let state = CoreState::new();
        assert_eq!(state.version(), 7);
    }

    #[test]
    fn test_context_mgr_slot_and_sticky_uid() {
        let mut state = CoreState::new();
        state.open(Pid(1), 1000, 0, -20).unwrap();
        state.open(Pid(2), 2000, 0, -20).unwrap();

        let node = state.set_context_mgr(Pid(1)).unwrap();
        assert_eq!(state.context_mgr, Some(node));
        assert_eq!(state.context_mgr_uid, Some(1000));
        // Slot occupied.
        assert_eq!(state.set_context_mgr(Pid(2)), Err(OpError::Busy));

        // Registration bumps the local holds and schedules the handshake.
        let record = &state.nodes[&node];
        assert_eq!(record.local_strong, 1);
        assert_eq!(record.local_weak, 1);
        assert!(record.work_queued);
        assert!(!record.has_strong_ref);

        // After the slot clears, a mismatched uid is refused.
        state.context_mgr = None;
        assert_eq!(state.set_context_mgr(Pid(2)), Err(OpError::PermissionDenied));
        assert!(state.set_context_mgr(Pid(1)).is_ok());
    }

    #[test]
    fn test_get_thread_creates_with_need_return() {
        let mut state = CoreState::new();
        state.open(Pid(1), 1000, 5, -20).unwrap();
        let thread = state.get_thread(Pid(1), Tid(10));
        assert!(thread.looper.contains(LooperState::NEED_RETURN));
        assert_eq!(thread.nice, 5);
    }

    #[test]
    fn test_file_capability_counts() {
        let mut state = CoreState::new();
        state.open(Pid(1), 1000, 0, -20).unwrap();
        state.open(Pid(2), 1000, 0, -20).unwrap();

        let fd = state.file_install_new(Pid(1)).unwrap();
        assert_eq!(fd, 0);
        let file = state.file_get(Pid(1), fd).unwrap();
        assert_eq!(state.files[&file].count, 2);

        let target_fd = state.fd_install(Pid(2), file).unwrap();
        assert_eq!(target_fd, 0);

        // Source close keeps the object alive through the target's count.
        state.fd_close(Pid(1), fd);
        assert_eq!(state.files[&file].count, 1);
        state.fd_close(Pid(2), target_fd);
        assert!(!state.files.contains_key(&file));
    }

    #[test]
    fn test_set_nice_clamps_at_floor() {
        let mut state = CoreState::new();
        state.open(Pid(1), 1000, 0, -5).unwrap();
        state.get_thread(Pid(1), Tid(1));

        state.set_nice(Pid(1), Tid(1), 10);
        assert_eq!(state.thread_nice(Pid(1), Tid(1)), Some(10));
        state.set_nice(Pid(1), Tid(1), -19);
        assert_eq!(state.thread_nice(Pid(1), Tid(1)), Some(-5));
    }
}
