//! Return-stream producer (the read half of WRITE_READ).
//!
//! Every read opens with BR_NOOP, drains stashed return errors, then serves
//! work items until one transaction has been delivered or the buffer is
//! exhausted. When both queues are dry the caller is told to block (or to
//! come back, if the endpoint is non-blocking); the core itself never
//! sleeps.

use alloc::vec::Vec;

use binder_wire::{align_to_word, br, put_u32, put_u64, TransactionData, TRANSACTION_DATA_SIZE};

use crate::mem::UserMemory;
use crate::state::CoreState;
use crate::types::{DeathKind, LooperState, Pid, Tid, TxId, Work};
use crate::write::{thread_write, StreamError};

/// Outcome of one non-blocking read attempt.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ReadOutcome {
    /// At least one return word was produced.
    Data(Vec<u8>),
    /// Nothing to deliver; the caller may sleep on its thread queue or, if
    /// idle, on the process queue.
    Block {
        /// True when the thread had no stack and no private work, so it
        /// would serve the process queue.
        wait_for_proc_work: bool,
    },
}

/// Count one produced return at all three stat granularities.
fn record_br(state: &mut CoreState, pid: Pid, tid: Tid, code: u32) {
    state.stats.protocol.record_br(code);
    if let Some(proc) = state.procs.get_mut(&pid) {
        proc.stats.record_br(code);
        if let Some(thread) = proc.threads.get_mut(&tid) {
            thread.stats.record_br(code);
        }
    }
}

/// Produce up to `read_size` bytes of return stream for (`pid`, `tid`).
pub fn try_read(state: &mut CoreState, pid: Pid, tid: Tid, read_size: usize) -> ReadOutcome {
    let mut out = Vec::new();
    if read_size < 4 {
        return ReadOutcome::Data(out);
    }
    state.get_thread(pid, tid);
    put_u32(&mut out, br::NOOP);
    record_br(state, pid, tid, br::NOOP);

    let wait_for_proc_work = {
        let thread = state.thread(pid, tid).expect("created above");
        thread.transaction_stack.is_none() && thread.todo.is_empty()
    };

    // Stashed errors jump the queue.
    {
        let thread = state
            .procs
            .get_mut(&pid)
            .and_then(|p| p.threads.get_mut(&tid))
            .expect("created above");
        if thread.return_error != br::OK {
            if thread.return_error2 != br::OK && out.len() + 4 <= read_size {
                let code = thread.return_error2;
                put_u32(&mut out, code);
                if out.len() + 4 > read_size {
                    return finish_read(state, pid, tid, out);
                }
                let thread = state
                    .procs
                    .get_mut(&pid)
                    .and_then(|p| p.threads.get_mut(&tid))
                    .expect("created above");
                thread.return_error2 = br::OK;
            }
            let thread = state
                .procs
                .get_mut(&pid)
                .and_then(|p| p.threads.get_mut(&tid))
                .expect("created above");
            let code = thread.return_error;
            thread.return_error = br::OK;
            put_u32(&mut out, code);
            return finish_read(state, pid, tid, out);
        }
    }

    loop {
        // Pick the next work item: own queue first, the process queue only
        // for threads that entered the read idle.
        let (work, from_thread_queue) = {
            let proc = state.procs.get(&pid).expect("open");
            let thread = proc.threads.get(&tid).expect("created above");
            if let Some(&work) = thread.todo.front() {
                (Some(work), true)
            } else if wait_for_proc_work {
                (proc.todo.front().copied(), false)
            } else {
                (None, false)
            }
        };
        let Some(work) = work else {
            let need_return = state
                .thread(pid, tid)
                .map(|t| t.looper.contains(LooperState::NEED_RETURN))
                .unwrap_or(false);
            if out.len() == 4 && !need_return {
                return ReadOutcome::Block { wait_for_proc_work };
            }
            break;
        };
        if read_size - out.len() < TRANSACTION_DATA_SIZE as usize + 4 {
            break;
        }

        let pop = |state: &mut CoreState| {
            let proc = state.procs.get_mut(&pid).expect("open");
            if from_thread_queue {
                proc.threads.get_mut(&tid).expect("created above").todo.pop_front();
            } else {
                proc.todo.pop_front();
            }
        };

        match work {
            Work::TransactionComplete => {
                pop(state);
                put_u32(&mut out, br::TRANSACTION_COMPLETE);
                record_br(state, pid, tid, br::TRANSACTION_COMPLETE);
                state.stats.objects.deleted(crate::stats::ObjKind::TransactionComplete);
                log::trace!("binder: {}:{} BR_TRANSACTION_COMPLETE", pid.0, tid.0);
            }
            Work::Node(node_id) => {
                // Resolve the owner-side belief against the current counts.
                // The item stays queued while it still produces commands; one
                // node may emit INCREFS then ACQUIRE on consecutive passes.
                let Some(node) = state.nodes.get_mut(&node_id) else {
                    pop(state);
                    continue;
                };
                let strong = node.has_strong();
                let weak = node.has_weak();
                let (ptr, cookie, debug_id) = (node.ptr, node.cookie, node.debug_id);

                let cmd = if weak && !node.has_weak_ref {
                    node.has_weak_ref = true;
                    node.pending_weak_ref = true;
                    node.local_weak += 1;
                    Some(br::INCREFS)
                } else if strong && !node.has_strong_ref {
                    node.has_strong_ref = true;
                    node.pending_strong_ref = true;
                    node.local_strong += 1;
                    Some(br::ACQUIRE)
                } else if !strong && node.has_strong_ref {
                    node.has_strong_ref = false;
                    Some(br::RELEASE)
                } else if !weak && node.has_weak_ref {
                    node.has_weak_ref = false;
                    Some(br::DECREFS)
                } else {
                    None
                };

                match cmd {
                    Some(cmd) => {
                        put_u32(&mut out, cmd);
                        put_u64(&mut out, ptr);
                        put_u64(&mut out, cookie);
                        record_br(state, pid, tid, cmd);
                        log::debug!(
                            "binder: {}:{} {} node {debug_id}",
                            pid.0,
                            tid.0,
                            binder_wire::br_name(cmd)
                        );
                    }
                    None => {
                        pop(state);
                        let node = state.nodes.get_mut(&node_id).expect("looked up");
                        node.work_queued = false;
                        if !weak && !strong {
                            state.free_node(node_id);
                        } else {
                            log::trace!(
                                "binder: {}:{} node {debug_id} state unchanged",
                                pid.0,
                                tid.0
                            );
                        }
                    }
                }
            }
            Work::Death(death_id) => {
                pop(state);
                let Some(death) = state.deaths.get(&death_id) else {
                    continue;
                };
                let cookie = death.cookie;
                let clearing = death.kind == DeathKind::ClearNotification;
                let cmd = if clearing {
                    br::CLEAR_DEATH_NOTIFICATION_DONE
                } else {
                    br::DEAD_BINDER
                };
                put_u32(&mut out, cmd);
                put_u64(&mut out, cookie);
                record_br(state, pid, tid, cmd);
                log::debug!(
                    "binder: {}:{} {} {cookie:#x}",
                    pid.0,
                    tid.0,
                    binder_wire::br_name(cmd)
                );
                if clearing {
                    state.deaths.remove(&death_id);
                    state.stats.objects.deleted(crate::stats::ObjKind::Death);
                } else {
                    state
                        .procs
                        .get_mut(&pid)
                        .expect("open")
                        .delivered_death
                        .push(death_id);
                    // Death notifications can cause transactions; surface
                    // this one on its own.
                    break;
                }
            }
            Work::Transaction(tx_id) => {
                pop(state);
                deliver_transaction(state, pid, tid, tx_id, &mut out);
                break;
            }
        }
    }

    finish_read(state, pid, tid, out)
}

/// Build and emit BR_TRANSACTION / BR_REPLY for a dequeued transaction.
fn deliver_transaction(state: &mut CoreState, pid: Pid, tid: Tid, tx_id: TxId, out: &mut Vec<u8>) {
    let Some(tx) = state.transactions.get(&tx_id) else {
        return;
    };
    let (buffer_proc, buffer_addr) = tx.buffer.expect("queued transaction carries its buffer");
    debug_assert_eq!(buffer_proc, pid);
    let (target_node, data_size, offsets_size) = {
        let pool = state.procs[&pid].pool.as_ref().expect("mapped");
        let buffer = pool.get(buffer_addr).expect("live buffer");
        (buffer.target_node, buffer.data_size, buffer.offsets_size)
    };

    let mut tr = TransactionData::default();
    let cmd = if let Some(node_id) = target_node {
        let (ptr, cookie, min_priority) = {
            let node = &state.nodes[&node_id];
            (node.ptr, node.cookie, node.min_priority)
        };
        tr.target = ptr;
        tr.cookie = cookie;

        // Priority inheritance, applied at dispatch only: run at the
        // caller's priority when it outranks the node's floor, otherwise at
        // the floor itself.
        let current_nice = state.thread(pid, tid).expect("reader").nice;
        let (priority, one_way) = {
            let tx = state.transactions.get_mut(&tx_id).expect("checked");
            tx.saved_priority = current_nice;
            (tx.priority, tx.one_way())
        };
        if priority < min_priority && !one_way {
            state.set_nice(pid, tid, priority);
        } else if !one_way || current_nice > min_priority {
            state.set_nice(pid, tid, min_priority);
        }
        br::TRANSACTION
    } else {
        br::REPLY
    };

    let tx = state.transactions.get(&tx_id).expect("checked");
    tr.code = tx.code;
    tr.flags = tx.flags;
    tr.sender_uid = tx.sender_uid;
    tr.sender_pid = tx.from.map(|(p, _)| p.0).unwrap_or(0);
    tr.data_size = data_size;
    tr.offsets_size = offsets_size;
    {
        let pool = state.procs[&pid].pool.as_ref().expect("mapped");
        tr.data_ptr = pool.user_data_addr(buffer_addr);
        tr.offsets_ptr = tr.data_ptr + align_to_word(data_size);
    }

    put_u32(out, cmd);
    tr.encode(out);
    record_br(state, pid, tid, cmd);

    let one_way = state.transactions[&tx_id].one_way();
    log::debug!(
        "binder: {}:{} {} {} size {}-{}",
        pid.0,
        tid.0,
        binder_wire::br_name(cmd),
        state.transactions[&tx_id].debug_id,
        data_size,
        offsets_size
    );

    {
        let pool = state
            .procs
            .get_mut(&pid)
            .and_then(|p| p.pool.as_mut())
            .expect("mapped");
        pool.get_mut(buffer_addr).expect("live buffer").allow_user_free = true;
    }
    if cmd == br::TRANSACTION && !one_way {
        // The receiver owes a reply: the transaction parks on its stack.
        let stack_top = state.thread(pid, tid).expect("reader").transaction_stack;
        {
            let tx = state.transactions.get_mut(&tx_id).expect("checked");
            tx.to_parent = stack_top;
            tx.to_thread = Some(tid);
        }
        state
            .procs
            .get_mut(&pid)
            .expect("open")
            .threads
            .get_mut(&tid)
            .expect("reader")
            .transaction_stack = Some(tx_id);
    } else {
        // Oneway sends and replies are done once surfaced.
        let pool = state
            .procs
            .get_mut(&pid)
            .and_then(|p| p.pool.as_mut())
            .expect("mapped");
        pool.get_mut(buffer_addr).expect("live buffer").transaction = None;
        state.transactions.remove(&tx_id);
        state.stats.objects.deleted(crate::stats::ObjKind::Transaction);
    }
}

/// Read epilogue: hand out a spawn hint when the pool has gone idle.
fn finish_read(state: &mut CoreState, pid: Pid, tid: Tid, mut out: Vec<u8>) -> ReadOutcome {
    let spawn = {
        let proc = state.procs.get(&pid).expect("open");
        let thread = proc.threads.get(&tid).expect("created");
        proc.requested_threads + proc.ready_threads == 0
            && proc.requested_threads_started < proc.max_threads
            && thread.looper.is_looper()
    };
    if spawn {
        let proc = state.procs.get_mut(&pid).expect("open");
        proc.requested_threads += 1;
        log::debug!("binder: {}:{} BR_SPAWN_LOOPER", pid.0, tid.0);
        // The hint takes over the leading BR_NOOP slot.
        out[0..4].copy_from_slice(&br::SPAWN_LOOPER.to_le_bytes());
        record_br(state, pid, tid, br::SPAWN_LOOPER);
    }
    ReadOutcome::Data(out)
}

// ============================================================================
// WRITE_READ entry point
// ============================================================================

/// Combined outcome of one WRITE_READ call.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WriteReadOutcome {
    /// Bytes of the write stream that were consumed.
    pub write_consumed: usize,
    /// Produced return stream (empty when `read_size` was 0).
    pub read: Vec<u8>,
}

/// Failure of a WRITE_READ call.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum WriteReadError {
    /// The write stream aborted; the read side was not attempted.
    Stream {
        error: StreamError,
        write_consumed: usize,
    },
    /// Nothing to read; a blocking host sleeps and retries, a non-blocking
    /// one surfaces "try again".
    WouldBlock { write_consumed: usize },
}

impl CoreState {
    /// One non-blocking WRITE_READ: process the write stream, then attempt
    /// the read stream. Blocking endpoints retry on
    /// [`WriteReadError::WouldBlock`] after waiting for work.
    pub fn write_read(
        &mut self,
        pid: Pid,
        tid: Tid,
        mem: &dyn UserMemory,
        write: &[u8],
        read_size: usize,
    ) -> Result<WriteReadOutcome, WriteReadError> {
        let mut write_consumed = 0;
        if !write.is_empty() {
            if let Err(error) = thread_write(self, pid, tid, mem, write, &mut write_consumed) {
                self.finish_op(pid, tid);
                return Err(WriteReadError::Stream {
                    error,
                    write_consumed,
                });
            }
        }
        let read = if read_size > 0 {
            match try_read(self, pid, tid, read_size) {
                ReadOutcome::Data(bytes) => bytes,
                ReadOutcome::Block { .. } => {
                    self.finish_op(pid, tid);
                    return Err(WriteReadError::WouldBlock { write_consumed });
                }
            }
        } else {
            Vec::new()
        };
        self.finish_op(pid, tid);
        Ok(WriteReadOutcome {
            write_consumed,
            read,
        })
    }
}
