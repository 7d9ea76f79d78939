//! Runtime wrapper around the binder IPC core.
//!
//! [`Driver`] owns the whole core state behind one mutex plus one condition
//! variable - the single-exclusion concurrency model - and a worker thread
//! that drains deferred flush/release work outside any caller's stack.
//! [`Endpoint`] is one process's device handle: it exposes the open / mmap /
//! ioctl / poll / flush / release surface, with WRITE_READ reads that block
//! on the condition variable until work arrives (or return `WouldBlock` in
//! non-blocking mode).
//!
//! The only suspension points are the read path (lock dropped while parked
//! on the condvar) and nothing else; every core operation runs to completion
//! under the lock.

mod deferred;

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread::JoinHandle;

use binder_core::{
    thread_write, try_read, CoreState, MappingInfo, NodeId, OpError, Pid, ReadOutcome, StreamError,
    Tid, UserMemory, WriteReadOutcome,
};
use deferred::{DeferredQueue, WORK_FLUSH, WORK_PUT_FILES, WORK_RELEASE};

pub use binder_core::{NoMemory, SparseMemory};

/// Errno-style failure surface of the device operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DriverError {
    #[error("invalid argument")]
    InvalidArgument,
    #[error("resource busy")]
    Busy,
    #[error("permission denied")]
    PermissionDenied,
    #[error("endpoint already mapped")]
    AlreadyMapped,
    #[error("endpoint is being destroyed")]
    Dead,
    #[error("no such endpoint")]
    NoProcess,
    #[error("operation would block")]
    WouldBlock,
    #[error("faulted on the command stream")]
    Fault,
    #[error("unknown command {0:#x}")]
    InvalidCommand(u32),
}

impl From<OpError> for DriverError {
    fn from(err: OpError) -> Self {
        match err {
            OpError::AlreadyOpen | OpError::Busy => DriverError::Busy,
            OpError::NoProcess => DriverError::NoProcess,
            OpError::Dead => DriverError::Dead,
            OpError::AlreadyMapped => DriverError::AlreadyMapped,
            OpError::BadArg => DriverError::InvalidArgument,
            OpError::PermissionDenied => DriverError::PermissionDenied,
        }
    }
}

struct Inner {
    core: Mutex<CoreState>,
    /// Readers park here; every mutation broadcasts.
    work: Condvar,
    deferred: Mutex<DeferredQueue>,
    deferred_work: Condvar,
}

/// The shared IPC driver: one per host, many endpoints.
pub struct Driver {
    inner: Arc<Inner>,
    next_pid: AtomicU32,
    worker: Option<JoinHandle<()>>,
}

impl Default for Driver {
    fn default() -> Self {
        Self::new()
    }
}

impl Driver {
    pub fn new() -> Self {
        let inner = Arc::new(Inner {
            core: Mutex::new(CoreState::new()),
            work: Condvar::new(),
            deferred: Mutex::new(DeferredQueue::default()),
            deferred_work: Condvar::new(),
        });
        let worker_inner = Arc::clone(&inner);
        let worker = std::thread::Builder::new()
            .name("binder-deferred".into())
            .spawn(move || deferred_worker(worker_inner))
            .expect("spawn deferred worker");
        Driver {
            inner,
            next_pid: AtomicU32::new(1),
            worker: Some(worker),
        }
    }

    /// Open a new endpoint (the `open` file operation).
    pub fn open(&self, uid: u32) -> Endpoint {
        self.open_with(uid, 0, -20)
    }

    /// Open with an explicit default priority and priority floor.
    pub fn open_with(&self, uid: u32, default_nice: i32, nice_floor: i32) -> Endpoint {
        let pid = Pid(self.next_pid.fetch_add(1, Ordering::Relaxed));
        let mut core = self.lock();
        core.open(pid, uid, default_nice, nice_floor)
            .expect("fresh pid");
        drop(core);
        Endpoint {
            inner: Arc::clone(&self.inner),
            pid,
            closed: Mutex::new(false),
        }
    }

    /// Block until all queued deferred work has been processed.
    pub fn wait_deferred_idle(&self) {
        let mut queue = self.inner.deferred.lock().expect("deferred lock");
        while !queue.is_idle() {
            queue = self
                .inner
                .deferred_work
                .wait(queue)
                .expect("deferred lock");
        }
    }

    /// Run invariant checks over the live state (diagnostic probe).
    pub fn check_invariants(&self) -> Vec<binder_core::InvariantViolation> {
        binder_core::check_all_invariants(&self.lock())
    }

    fn lock(&self) -> MutexGuard<'_, CoreState> {
        self.inner.core.lock().expect("core lock")
    }
}

impl Drop for Driver {
    fn drop(&mut self) {
        {
            let mut queue = self.inner.deferred.lock().expect("deferred lock");
            queue.shutdown = true;
        }
        self.inner.deferred_work.notify_all();
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

fn deferred_worker(inner: Arc<Inner>) {
    loop {
        let (pid, work) = {
            let mut queue = inner.deferred.lock().expect("deferred lock");
            loop {
                if let Some(item) = queue.pop() {
                    queue.busy = true;
                    break item;
                }
                if queue.shutdown {
                    return;
                }
                queue = inner.deferred_work.wait(queue).expect("deferred lock");
            }
        };

        {
            let mut core = inner.core.lock().expect("core lock");
            if work & WORK_PUT_FILES != 0 {
                core.put_files(pid);
            }
            if work & WORK_FLUSH != 0 {
                core.deferred_flush(pid);
            }
            if work & WORK_RELEASE != 0 {
                let stats = core.deferred_release(pid);
                log::debug!("binder: deferred release of {}: {stats:?}", pid.0);
            }
        }
        inner.work.notify_all();

        let mut queue = inner.deferred.lock().expect("deferred lock");
        queue.busy = false;
        inner.deferred_work.notify_all();
    }
}

// ============================================================================
// Endpoint
// ============================================================================

/// One process's handle on the driver.
///
/// Dropping the endpoint schedules its release, the way closing the device
/// file does.
pub struct Endpoint {
    inner: Arc<Inner>,
    pid: Pid,
    closed: Mutex<bool>,
}

impl Endpoint {
    pub fn pid(&self) -> Pid {
        self.pid
    }

    fn lock(&self) -> MutexGuard<'_, CoreState> {
        self.inner.core.lock().expect("core lock")
    }

    /// Map the shared region backing this endpoint's buffer pool.
    pub fn mmap(&self, len: u64, writable: bool) -> Result<MappingInfo, DriverError> {
        let mut core = self.lock();
        Ok(core.mmap(self.pid, len, writable)?)
    }

    /// BINDER_VERSION.
    pub fn version(&self) -> i32 {
        self.lock().version()
    }

    /// BINDER_SET_MAX_THREADS.
    pub fn set_max_threads(&self, max: u32) -> Result<(), DriverError> {
        Ok(self.lock().set_max_threads(self.pid, max)?)
    }

    /// BINDER_SET_CONTEXT_MGR.
    pub fn set_context_mgr(&self) -> Result<NodeId, DriverError> {
        Ok(self.lock().set_context_mgr(self.pid)?)
    }

    /// BINDER_THREAD_EXIT.
    pub fn thread_exit(&self, tid: Tid) -> Result<(), DriverError> {
        let mut core = self.lock();
        core.thread_exit(self.pid, tid)?;
        drop(core);
        self.inner.work.notify_all();
        Ok(())
    }

    /// Whether a read on `tid` would return without blocking.
    pub fn poll(&self, tid: Tid) -> bool {
        self.lock().poll(self.pid, tid)
    }

    /// The `flush` file operation: force every thread back to user space.
    pub fn flush(&self) {
        let mut queue = self.inner.deferred.lock().expect("deferred lock");
        queue.push(self.pid, WORK_FLUSH);
        drop(queue);
        self.inner.deferred_work.notify_all();
        // Wake sleepers immediately as well; the worker will set NEED_RETURN.
        self.inner.work.notify_all();
    }

    /// The `release` file operation: schedule deferred teardown.
    pub fn close(&self) {
        let mut closed = self.closed.lock().expect("closed flag");
        if *closed {
            return;
        }
        *closed = true;
        drop(closed);

        self.lock().mark_dead(self.pid);
        let mut queue = self.inner.deferred.lock().expect("deferred lock");
        queue.push(self.pid, WORK_PUT_FILES | WORK_RELEASE);
        drop(queue);
        self.inner.deferred_work.notify_all();
        self.inner.work.notify_all();
    }

    /// BINDER_WRITE_READ.
    ///
    /// Processes the write stream first; on success, produces the read
    /// stream, blocking until at least one return is available unless
    /// `non_block` is set.
    pub fn write_read(
        &self,
        tid: Tid,
        mem: &dyn UserMemory,
        write: &[u8],
        read_size: usize,
        non_block: bool,
    ) -> Result<WriteReadOutcome, DriverError> {
        let mut core = self.lock();
        if core.proc(self.pid).is_err() {
            return Err(DriverError::Dead);
        }

        let mut write_consumed = 0;
        if !write.is_empty() {
            if let Err(error) = thread_write(&mut core, self.pid, tid, mem, write, &mut write_consumed)
            {
                core.finish_op(self.pid, tid);
                drop(core);
                self.inner.work.notify_all();
                return Err(match error {
                    StreamError::Fault => DriverError::Fault,
                    StreamError::InvalidCommand(cmd) => DriverError::InvalidCommand(cmd),
                });
            }
            // Whatever the write queued may unblock other readers.
            self.inner.work.notify_all();
        }

        let read = if read_size > 0 {
            loop {
                match try_read(&mut core, self.pid, tid, read_size) {
                    ReadOutcome::Data(bytes) => break bytes,
                    ReadOutcome::Block { wait_for_proc_work } => {
                        if non_block {
                            core.finish_op(self.pid, tid);
                            return Err(DriverError::WouldBlock);
                        }
                        // The only suspension point: drop the lock and park.
                        let proc_work = core.begin_wait(self.pid, tid);
                        debug_assert_eq!(proc_work, wait_for_proc_work);
                        while !core.readable(self.pid, tid, proc_work) {
                            core = self.inner.work.wait(core).expect("core lock");
                        }
                        core.finish_wait(self.pid, tid, proc_work);
                        if core.proc(self.pid).is_err() {
                            return Err(DriverError::Dead);
                        }
                    }
                }
            }
        } else {
            Vec::new()
        };
        core.finish_op(self.pid, tid);
        drop(core);
        self.inner.work.notify_all();
        Ok(WriteReadOutcome {
            write_consumed,
            read,
        })
    }

    /// Copy out the payload a received `data_ptr` refers to, as the process
    /// would read it through its mapping.
    pub fn buffer_bytes(&self, user_data_ptr: u64) -> Option<Vec<u8>> {
        self.lock().buffer_bytes(self.pid, user_data_ptr)
    }

    /// Mint a file capability in this process's descriptor table (stand-in
    /// for the host's real file table when exercising FD passing).
    pub fn create_file(&self) -> Result<u32, DriverError> {
        Ok(self.lock().file_install_new(self.pid)?)
    }

    /// Descriptors currently installed in this process.
    pub fn fds(&self) -> Vec<u32> {
        self.lock()
            .procs
            .get(&self.pid)
            .map(|p| p.fd_table.keys().copied().collect())
            .unwrap_or_default()
    }

    /// Current nice value of one of this endpoint's threads.
    pub fn thread_nice(&self, tid: Tid) -> Option<i32> {
        self.lock().thread_nice(self.pid, tid)
    }
}

impl Drop for Endpoint {
    fn drop(&mut self) {
        self.close();
    }
}
