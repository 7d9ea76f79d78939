//! Command-stream interpreter (the write half of WRITE_READ).
//!
//! Commands are consumed until the stream is exhausted, a command is
//! malformed, or an error lands in the calling thread's return slot. Most
//! per-command misuse is recoverable: it logs a diagnostic and skips to the
//! next command, the way a device implementation tolerates stale user-space
//! bookkeeping.

use binder_wire::{bc, br, get_u32, get_u64, TransactionData};

use crate::mem::UserMemory;
use crate::state::CoreState;
use crate::transaction::{transaction, transaction_buffer_release};
use crate::types::{LooperState, Pid, Tid};

/// Unrecoverable failure of a write stream (errno analog).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StreamError {
    /// The stream ended mid-command.
    Fault,
    /// Unknown command code; the stream position cannot be trusted.
    InvalidCommand(u32),
}

/// Count one consumed command at all three stat granularities.
fn record_bc(state: &mut CoreState, pid: Pid, tid: Tid, code: u32) {
    state.stats.protocol.record_bc(code);
    if let Some(proc) = state.procs.get_mut(&pid) {
        proc.stats.record_bc(code);
        if let Some(thread) = proc.threads.get_mut(&tid) {
            thread.stats.record_bc(code);
        }
    }
}

/// Process the write stream in `buf`, advancing `consumed`.
pub fn thread_write(
    state: &mut CoreState,
    pid: Pid,
    tid: Tid,
    mem: &dyn UserMemory,
    buf: &[u8],
    consumed: &mut usize,
) -> Result<(), StreamError> {
    state.get_thread(pid, tid);
    let mut cursor = *consumed;

    while cursor < buf.len() {
        if state
            .thread(pid, tid)
            .map(|t| t.return_error != br::OK)
            .unwrap_or(true)
        {
            break;
        }
        let cmd = get_u32(buf, &mut cursor).map_err(|_| StreamError::Fault)?;
        record_bc(state, pid, tid, cmd);

        match cmd {
            bc::INCREFS | bc::ACQUIRE | bc::RELEASE | bc::DECREFS => {
                let desc = get_u32(buf, &mut cursor).map_err(|_| StreamError::Fault)?;
                let ref_id = if desc == 0
                    && state.context_mgr.is_some()
                    && (cmd == bc::INCREFS || cmd == bc::ACQUIRE)
                {
                    let ctx = state.context_mgr.expect("checked");
                    state.get_ref_for_node(pid, ctx)
                } else {
                    state.ref_by_desc(pid, desc)
                };
                let Some(ref_id) = ref_id else {
                    log::warn!(
                        "binder: {}:{} refcount change on invalid ref {desc}",
                        pid.0,
                        tid.0
                    );
                    cursor_commit(consumed, cursor);
                    continue;
                };
                match cmd {
                    bc::INCREFS => state.inc_ref(ref_id, false, None),
                    bc::ACQUIRE => state.inc_ref(ref_id, true, None),
                    bc::RELEASE => {
                        state.dec_ref(ref_id, true);
                    }
                    _ => {
                        state.dec_ref(ref_id, false);
                    }
                }
            }
            bc::INCREFS_DONE | bc::ACQUIRE_DONE => {
                let ptr = get_u64(buf, &mut cursor).map_err(|_| StreamError::Fault)?;
                let cookie = get_u64(buf, &mut cursor).map_err(|_| StreamError::Fault)?;
                let strong = cmd == bc::ACQUIRE_DONE;
                let Some(node_id) = state.node_by_ptr(pid, ptr) else {
                    log::warn!(
                        "binder: {}:{} {} u{ptr:016x} no match",
                        pid.0,
                        tid.0,
                        binder_wire::bc_name(cmd)
                    );
                    cursor_commit(consumed, cursor);
                    continue;
                };
                let node = state.nodes.get_mut(&node_id).expect("looked up");
                if node.cookie != cookie {
                    log::warn!(
                        "binder: {}:{} {} node {} cookie mismatch",
                        pid.0,
                        tid.0,
                        binder_wire::bc_name(cmd),
                        node.debug_id
                    );
                    cursor_commit(consumed, cursor);
                    continue;
                }
                if strong {
                    if !node.pending_strong_ref {
                        log::warn!(
                            "binder: {}:{} BC_ACQUIRE_DONE node {} has no pending acquire",
                            pid.0,
                            tid.0,
                            node.debug_id
                        );
                        cursor_commit(consumed, cursor);
                        continue;
                    }
                    node.pending_strong_ref = false;
                } else {
                    if !node.pending_weak_ref {
                        log::warn!(
                            "binder: {}:{} BC_INCREFS_DONE node {} has no pending increfs",
                            pid.0,
                            tid.0,
                            node.debug_id
                        );
                        cursor_commit(consumed, cursor);
                        continue;
                    }
                    node.pending_weak_ref = false;
                }
                // Give back the count taken when the request was emitted.
                state.dec_node(node_id, strong, false);
            }
            bc::FREE_BUFFER => {
                let user_ptr = get_u64(buf, &mut cursor).map_err(|_| StreamError::Fault)?;
                free_buffer(state, pid, tid, user_ptr);
            }
            bc::TRANSACTION | bc::REPLY => {
                let tr =
                    TransactionData::decode(buf, &mut cursor).map_err(|_| StreamError::Fault)?;
                transaction(state, pid, tid, &tr, mem, cmd == bc::REPLY);
            }
            bc::REGISTER_LOOPER => {
                log::trace!("binder: {}:{} BC_REGISTER_LOOPER", pid.0, tid.0);
                let requested = state.procs.get(&pid).map(|p| p.requested_threads).unwrap_or(0);
                let thread = state.get_thread(pid, tid);
                if thread.looper.contains(LooperState::ENTERED) {
                    thread.looper.insert(LooperState::INVALID);
                    log::warn!(
                        "binder: {}:{} BC_REGISTER_LOOPER after BC_ENTER_LOOPER",
                        pid.0,
                        tid.0
                    );
                } else if requested == 0 {
                    thread.looper.insert(LooperState::INVALID);
                    log::warn!(
                        "binder: {}:{} BC_REGISTER_LOOPER without request",
                        pid.0,
                        tid.0
                    );
                } else {
                    let proc = state.procs.get_mut(&pid).expect("open");
                    proc.requested_threads -= 1;
                    proc.requested_threads_started += 1;
                }
                state
                    .get_thread(pid, tid)
                    .looper
                    .insert(LooperState::REGISTERED);
            }
            bc::ENTER_LOOPER => {
                log::trace!("binder: {}:{} BC_ENTER_LOOPER", pid.0, tid.0);
                let thread = state.get_thread(pid, tid);
                if thread.looper.contains(LooperState::REGISTERED) {
                    thread.looper.insert(LooperState::INVALID);
                    log::warn!(
                        "binder: {}:{} BC_ENTER_LOOPER after BC_REGISTER_LOOPER",
                        pid.0,
                        tid.0
                    );
                }
                thread.looper.insert(LooperState::ENTERED);
            }
            bc::EXIT_LOOPER => {
                log::trace!("binder: {}:{} BC_EXIT_LOOPER", pid.0, tid.0);
                state.get_thread(pid, tid).looper.insert(LooperState::EXITED);
            }
            bc::REQUEST_DEATH_NOTIFICATION | bc::CLEAR_DEATH_NOTIFICATION => {
                let desc = get_u32(buf, &mut cursor).map_err(|_| StreamError::Fault)?;
                let cookie = get_u64(buf, &mut cursor).map_err(|_| StreamError::Fault)?;
                if cmd == bc::REQUEST_DEATH_NOTIFICATION {
                    state.request_death_notification(pid, tid, desc, cookie);
                } else {
                    state.clear_death_notification(pid, tid, desc, cookie);
                }
            }
            bc::DEAD_BINDER_DONE => {
                let cookie = get_u64(buf, &mut cursor).map_err(|_| StreamError::Fault)?;
                state.dead_binder_done(pid, tid, cookie);
            }
            other => {
                log::warn!("binder: {}:{} unknown command {other:#x}", pid.0, tid.0);
                return Err(StreamError::InvalidCommand(other));
            }
        }
        cursor_commit(consumed, cursor);
    }
    Ok(())
}

fn cursor_commit(consumed: &mut usize, cursor: usize) {
    *consumed = cursor;
}

/// BC_FREE_BUFFER: give a received payload buffer back to the pool, kicking
/// the next held-back oneway for its node if there is one.
fn free_buffer(state: &mut CoreState, pid: Pid, tid: Tid, user_ptr: u64) {
    let Some(addr) = state
        .procs
        .get(&pid)
        .and_then(|p| p.pool.as_ref())
        .and_then(|pool| pool.lookup_user(user_ptr))
    else {
        log::warn!(
            "binder: {}:{} BC_FREE_BUFFER u{user_ptr:016x} no match",
            pid.0,
            tid.0
        );
        return;
    };
    let (allow_user_free, tx, is_async, target_node) = {
        let pool = state.procs.get(&pid).and_then(|p| p.pool.as_ref()).expect("mapped");
        let buffer = pool.get(addr).expect("looked up");
        (
            buffer.allow_user_free,
            buffer.transaction,
            buffer.async_transaction,
            buffer.target_node,
        )
    };
    if !allow_user_free {
        log::warn!(
            "binder: {}:{} BC_FREE_BUFFER u{user_ptr:016x} matched unreturned buffer",
            pid.0,
            tid.0
        );
        return;
    }
    log::trace!(
        "binder: {}:{} BC_FREE_BUFFER u{user_ptr:016x} for {} transaction",
        pid.0,
        tid.0,
        if tx.is_some() { "active" } else { "finished" }
    );

    if let Some(tx_id) = tx {
        if let Some(tx) = state.transactions.get_mut(&tx_id) {
            tx.buffer = None;
        }
        let pool = state.procs.get_mut(&pid).and_then(|p| p.pool.as_mut()).expect("mapped");
        pool.get_mut(addr).expect("looked up").transaction = None;
    }

    // Exactly one oneway per node runs at a time; freeing its buffer admits
    // the next.
    if is_async {
        if let Some(node_id) = target_node {
            let next_work = state.nodes.get_mut(&node_id).and_then(|node| {
                debug_assert!(node.has_async_transaction);
                let next = node.async_todo.pop_front();
                if next.is_none() {
                    node.has_async_transaction = false;
                }
                next
            });
            if let Some(work) = next_work {
                state.enqueue_thread_work(pid, tid, work);
            }
        }
    }

    transaction_buffer_release(state, pid, addr, None);
    let pool = state.procs.get_mut(&pid).and_then(|p| p.pool.as_mut()).expect("mapped");
    pool.free(addr);
}
