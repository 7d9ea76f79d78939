//! Transaction engine.
//!
//! One entry point, [`transaction`], handles both BC_TRANSACTION and
//! BC_REPLY: resolve the target, build the payload buffer in the target's
//! pool, translate embedded objects, then queue the work and the sender's
//! completion acknowledgement. Failures unwind everything built so far and
//! surface as a return-error on the sending thread, or travel up the
//! `from_parent` chain when a reply can no longer be delivered.

use binder_wire::{align_to_word, br, br_name, get_u64, FlatObject, TransactionData, FLAT_OBJECT_SIZE};

use crate::mem::UserMemory;
use crate::stats::{CallType, ObjKind, TransactionLogEntry};
use crate::state::CoreState;
use crate::types::{NodeId, Pid, Tid, Transaction, TxId, Work};

/// Why a transaction failed, paired with the reply being answered (if any)
/// so the error lands on the right thread.
struct TxFailure {
    code: u32,
    in_reply_to: Option<TxId>,
}

fn fail(code: u32, in_reply_to: Option<TxId>) -> TxFailure {
    TxFailure { code, in_reply_to }
}

/// Process one BC_TRANSACTION or BC_REPLY.
pub(crate) fn transaction(
    state: &mut CoreState,
    pid: Pid,
    tid: Tid,
    tr: &TransactionData,
    mem: &dyn UserMemory,
    reply: bool,
) {
    let call_type = if reply {
        CallType::Reply
    } else if tr.one_way() {
        CallType::OneWay
    } else {
        CallType::Sync
    };
    let mut entry = TransactionLogEntry {
        debug_id: 0,
        call_type,
        from_pid: pid.0,
        from_tid: tid.0,
        to_pid: 0,
        to_node: 0,
        to_tid: 0,
        target_handle: tr.target,
        data_size: tr.data_size,
        offsets_size: tr.offsets_size,
    };

    match transaction_inner(state, pid, tid, tr, mem, reply, &mut entry) {
        Ok(()) => state.transaction_log.push(entry),
        Err(failure) => {
            log::warn!(
                "binder: {}:{} transaction failed {}, size {}-{}",
                pid.0,
                tid.0,
                br_name(failure.code),
                tr.data_size,
                tr.offsets_size
            );
            state.transaction_log.push(entry);
            state.failed_transaction_log.push(entry);

            let thread = state.get_thread(pid, tid);
            debug_assert_eq!(thread.return_error, br::OK);
            if let Some(in_reply_to) = failure.in_reply_to {
                thread.return_error = br::TRANSACTION_COMPLETE;
                send_failed_reply(state, in_reply_to, failure.code);
            } else {
                thread.return_error = failure.code;
            }
        }
    }
}

fn transaction_inner(
    state: &mut CoreState,
    pid: Pid,
    tid: Tid,
    tr: &TransactionData,
    mem: &dyn UserMemory,
    reply: bool,
    entry: &mut TransactionLogEntry,
) -> Result<(), TxFailure> {
    let one_way = tr.one_way();

    // ------------------------------------------------------------------
    // Target resolution
    // ------------------------------------------------------------------
    let mut in_reply_to: Option<TxId> = None;
    let mut target_thread: Option<(Pid, Tid)> = None;
    let mut target_node: Option<NodeId> = None;
    let target_proc: Pid;

    if reply {
        let stack_top = state.get_thread(pid, tid).transaction_stack;
        let Some(irt_id) = stack_top else {
            log::warn!("binder: {}:{} got reply with no transaction stack", pid.0, tid.0);
            return Err(fail(br::FAILED_REPLY, None));
        };
        let (saved_priority, irt_to_thread, irt_to_parent, irt_from) = {
            let irt = &state.transactions[&irt_id];
            (irt.saved_priority, irt.to_thread, irt.to_parent, irt.from)
        };
        state.set_nice(pid, tid, saved_priority);
        if irt_to_thread != Some(tid) {
            log::warn!(
                "binder: {}:{} got reply with bad transaction stack",
                pid.0,
                tid.0
            );
            return Err(fail(br::FAILED_REPLY, None));
        }
        state.get_thread(pid, tid).transaction_stack = irt_to_parent;
        in_reply_to = Some(irt_id);

        let Some(caller) = irt_from else {
            return Err(fail(br::DEAD_REPLY, in_reply_to));
        };
        let caller_stack = state.thread(caller.0, caller.1).and_then(|t| t.transaction_stack);
        if caller_stack != Some(irt_id) {
            log::warn!(
                "binder: {}:{} got reply with bad target transaction stack",
                pid.0,
                tid.0
            );
            return Err(fail(br::FAILED_REPLY, None));
        }
        target_thread = Some(caller);
        target_proc = caller.0;
    } else {
        if tr.target != 0 {
            let Some(ref_id) = state.ref_by_desc(pid, tr.target as u32) else {
                log::warn!("binder: {}:{} transaction to invalid handle", pid.0, tid.0);
                return Err(fail(br::FAILED_REPLY, None));
            };
            target_node = Some(state.refs[&ref_id].node);
        } else {
            target_node = state.context_mgr;
            if target_node.is_none() {
                return Err(fail(br::DEAD_REPLY, None));
            }
        }
        let node_id = target_node.expect("resolved above");
        entry.to_node = state.nodes[&node_id].debug_id;
        let Some(owner) = state.nodes[&node_id].owner else {
            return Err(fail(br::DEAD_REPLY, None));
        };
        target_proc = owner;

        // Dependent-thread optimization: a synchronous call into a process
        // some ancestor of ours is blocked in gets delivered straight to the
        // blocked thread.
        let stack_top = state.get_thread(pid, tid).transaction_stack;
        if !one_way && stack_top.is_some() {
            let top = stack_top.expect("checked");
            if state.transactions[&top].to_thread != Some(tid) {
                log::warn!(
                    "binder: {}:{} got new transaction with bad transaction stack",
                    pid.0,
                    tid.0
                );
                return Err(fail(br::FAILED_REPLY, None));
            }
            let mut cursor = Some(top);
            while let Some(tx_id) = cursor {
                let tx = &state.transactions[&tx_id];
                if let Some(from) = tx.from {
                    if from.0 == target_proc {
                        target_thread = Some(from);
                    }
                }
                cursor = tx.from_parent;
            }
        }
    }

    if let Some((tp, tt)) = target_thread {
        debug_assert_eq!(tp, target_proc);
        entry.to_tid = tt.0;
    }
    entry.to_pid = target_proc.0;

    // ------------------------------------------------------------------
    // Buffer build
    // ------------------------------------------------------------------
    let debug_id = state.alloc_debug_id();
    entry.debug_id = debug_id;
    let tx_id = state.alloc_tx_id();
    let is_async = !reply && one_way;

    let sender_uid = state.procs[&pid].uid;
    let priority = state.get_thread(pid, tid).nice;

    let buffer_addr = {
        let Some(pool) = state
            .procs
            .get_mut(&target_proc)
            .and_then(|p| p.pool.as_mut())
        else {
            log::warn!("binder: {}: transaction to unmapped process", target_proc.0);
            return Err(fail(br::FAILED_REPLY, in_reply_to));
        };
        match pool.alloc(tr.data_size, tr.offsets_size, is_async, debug_id) {
            Ok(addr) => addr,
            Err(_) => return Err(fail(br::FAILED_REPLY, in_reply_to)),
        }
    };

    state.transactions.insert(
        tx_id,
        Transaction {
            id: tx_id,
            debug_id,
            from: if !reply && !one_way { Some((pid, tid)) } else { None },
            sender_uid,
            to_proc: Some(target_proc),
            to_thread: target_thread.map(|(_, tt)| tt),
            code: tr.code,
            flags: tr.flags,
            priority,
            saved_priority: 0,
            need_reply: false,
            buffer: Some((target_proc, buffer_addr)),
            from_parent: None,
            to_parent: None,
        },
    );
    state.stats.objects.created(ObjKind::Transaction);
    {
        let pool = state
            .procs
            .get_mut(&target_proc)
            .and_then(|p| p.pool.as_mut())
            .expect("target pool is mapped");
        let buffer = pool.get_mut(buffer_addr).expect("fresh buffer");
        buffer.transaction = Some(tx_id);
        buffer.target_node = target_node;
    }
    if let Some(node_id) = target_node {
        state.inc_node(node_id, true, false, None);
    }

    if reply {
        log::debug!(
            "binder: {}:{} BC_REPLY {} -> {}, size {}-{}",
            pid.0,
            tid.0,
            debug_id,
            target_proc.0,
            tr.data_size,
            tr.offsets_size
        );
    } else {
        log::debug!(
            "binder: {}:{} BC_TRANSACTION {} -> {} - node {}, size {}-{}",
            pid.0,
            tid.0,
            debug_id,
            target_proc.0,
            entry.to_node,
            tr.data_size,
            tr.offsets_size
        );
    }

    // Single copy of payload and offsets out of the caller's memory.
    let unwind_buffer = |state: &mut CoreState, failed_at: Option<usize>| {
        transaction_buffer_release(state, target_proc, buffer_addr, failed_at);
        let pool = state
            .procs
            .get_mut(&target_proc)
            .and_then(|p| p.pool.as_mut())
            .expect("target pool is mapped");
        if let Some(buffer) = pool.get_mut(buffer_addr) {
            buffer.transaction = None;
        }
        pool.free(buffer_addr);
        state.transactions.remove(&tx_id);
        state.stats.objects.deleted(ObjKind::Transaction);
    };

    let Some(data) = mem.read(tr.data_ptr, tr.data_size) else {
        log::warn!("binder: {}:{} transaction with invalid data ptr", pid.0, tid.0);
        unwind_buffer(state, Some(0));
        return Err(fail(br::FAILED_REPLY, in_reply_to));
    };
    let Some(offsets) = mem.read(tr.offsets_ptr, tr.offsets_size) else {
        log::warn!(
            "binder: {}:{} transaction with invalid offsets ptr",
            pid.0,
            tid.0
        );
        unwind_buffer(state, Some(0));
        return Err(fail(br::FAILED_REPLY, in_reply_to));
    };
    {
        let pool = state
            .procs
            .get_mut(&target_proc)
            .and_then(|p| p.pool.as_mut())
            .expect("target pool is mapped");
        let data_addr = pool.data_addr(buffer_addr);
        let offsets_addr = data_addr + align_to_word(tr.data_size);
        pool.copy_in(data_addr, &data).expect("allocated span is mapped");
        pool.copy_in(offsets_addr, &offsets).expect("allocated span is mapped");
    }
    if tr.offsets_size % 8 != 0 {
        log::warn!(
            "binder: {}:{} transaction with invalid offsets size {}",
            pid.0,
            tid.0,
            tr.offsets_size
        );
        unwind_buffer(state, Some(0));
        return Err(fail(br::FAILED_REPLY, in_reply_to));
    }

    // ------------------------------------------------------------------
    // Object translation
    // ------------------------------------------------------------------
    let offset_count = (tr.offsets_size / 8) as usize;
    for index in 0..offset_count {
        let mut cursor = index * 8;
        let off = get_u64(&offsets, &mut cursor).expect("counted");
        let object_fits = off
            .checked_add(FLAT_OBJECT_SIZE as u64)
            .map(|end| end <= tr.data_size)
            .unwrap_or(false);
        if !object_fits || off % 8 != 0 {
            log::warn!(
                "binder: {}:{} transaction with invalid offset {}",
                pid.0,
                tid.0,
                off
            );
            unwind_buffer(state, Some(index));
            return Err(fail(br::FAILED_REPLY, in_reply_to));
        }

        let mut fp = {
            let mut c = off as usize;
            FlatObject::decode(&data, &mut c).expect("bounds checked")
        };
        match translate_object(state, pid, tid, target_proc, target_node, in_reply_to, &mut fp) {
            Ok(()) => {
                let pool = state
                    .procs
                    .get_mut(&target_proc)
                    .and_then(|p| p.pool.as_mut())
                    .expect("target pool is mapped");
                let data_addr = pool.data_addr(buffer_addr);
                pool.copy_in(data_addr + off, &fp.to_bytes())
                    .expect("allocated span is mapped");
            }
            Err(code) => {
                unwind_buffer(state, Some(index));
                return Err(fail(code, in_reply_to));
            }
        }
    }

    // ------------------------------------------------------------------
    // Enqueue and stack management
    // ------------------------------------------------------------------
    let mut target_queue_thread = target_thread;
    let mut async_to_node: Option<NodeId> = None;

    if reply {
        let in_reply_to = in_reply_to.expect("reply path");
        pop_transaction(state, target_thread, in_reply_to);
    } else if !one_way {
        let from_parent = state.get_thread(pid, tid).transaction_stack;
        let tx = state.transactions.get_mut(&tx_id).expect("just inserted");
        tx.need_reply = true;
        tx.from_parent = from_parent;
        state.get_thread(pid, tid).transaction_stack = Some(tx_id);
    } else {
        let node_id = target_node.expect("oneway targets a node");
        let node = state.nodes.get_mut(&node_id).expect("resolved");
        if node.has_async_transaction {
            // At most one oneway per node is in flight; the rest wait on the
            // node itself.
            async_to_node = Some(node_id);
            target_queue_thread = None;
        } else {
            node.has_async_transaction = true;
        }
    }

    if let Some(node_id) = async_to_node {
        let node = state.nodes.get_mut(&node_id).expect("resolved");
        node.async_todo.push_back(Work::Transaction(tx_id));
    } else if let Some((tp, tt)) = target_queue_thread {
        state.enqueue_thread_work(tp, tt, Work::Transaction(tx_id));
    } else {
        state.enqueue_proc_work(target_proc, Work::Transaction(tx_id));
    }
    state.enqueue_thread_work(pid, tid, Work::TransactionComplete);
    state.stats.objects.created(ObjKind::TransactionComplete);
    Ok(())
}

/// Rewrite one inline object for the target process, taking the counts the
/// rewritten form stands for.
fn translate_object(
    state: &mut CoreState,
    pid: Pid,
    tid: Tid,
    target_proc: Pid,
    target_node: Option<NodeId>,
    in_reply_to: Option<TxId>,
    fp: &mut FlatObject,
) -> Result<(), u32> {
    use binder_wire::obj;

    match fp.obj_type {
        obj::BINDER | obj::WEAK_BINDER => {
            let strong = fp.obj_type == obj::BINDER;
            let node_id = match state.node_by_ptr(pid, fp.handle) {
                Some(node_id) => node_id,
                None => {
                    let node_id = state
                        .new_node(pid, fp.handle, fp.cookie)
                        .ok_or(br::FAILED_REPLY)?;
                    let node = state.nodes.get_mut(&node_id).expect("fresh node");
                    node.min_priority = fp.min_priority();
                    node.accept_fds = fp.accepts_fds();
                    node_id
                }
            };
            if fp.cookie != state.nodes[&node_id].cookie {
                log::warn!(
                    "binder: {}:{} sending u{:016x} node {}, cookie mismatch",
                    pid.0,
                    tid.0,
                    fp.handle,
                    state.nodes[&node_id].debug_id
                );
                return Err(br::FAILED_REPLY);
            }
            let ref_id = state
                .get_ref_for_node(target_proc, node_id)
                .ok_or(br::FAILED_REPLY)?;
            fp.obj_type = if strong { obj::HANDLE } else { obj::WEAK_HANDLE };
            fp.handle = state.refs[&ref_id].desc as u64;
            // The sender is the owner; it learns about the hand-off before
            // it returns to user space.
            state.inc_ref(ref_id, strong, Some((pid, tid)));
            log::trace!(
                "binder:        node {} -> ref desc {}",
                state.nodes[&node_id].debug_id,
                fp.handle
            );
            Ok(())
        }
        obj::HANDLE | obj::WEAK_HANDLE => {
            let strong = fp.obj_type == obj::HANDLE;
            let Some(ref_id) = state.ref_by_desc(pid, fp.handle as u32) else {
                log::warn!(
                    "binder: {}:{} transaction with invalid handle {}",
                    pid.0,
                    tid.0,
                    fp.handle
                );
                return Err(br::FAILED_REPLY);
            };
            let node_id = state.refs[&ref_id].node;
            if state.nodes[&node_id].owner == Some(target_proc) {
                // Coming home: hand the receiver its own service pointer.
                let node = &state.nodes[&node_id];
                fp.obj_type = if strong { obj::BINDER } else { obj::WEAK_BINDER };
                fp.handle = node.ptr;
                fp.cookie = node.cookie;
                state.inc_node(node_id, strong, false, None);
            } else {
                let new_ref = state
                    .get_ref_for_node(target_proc, node_id)
                    .ok_or(br::FAILED_REPLY)?;
                fp.handle = state.refs[&new_ref].desc as u64;
                state.inc_ref(new_ref, strong, None);
            }
            Ok(())
        }
        obj::FD => {
            let fd = fp.handle as u32;
            if let Some(in_reply_to) = in_reply_to {
                if !state.transactions[&in_reply_to].accepts_fds() {
                    log::warn!(
                        "binder: {}:{} reply with fd {fd} but target does not allow fds",
                        pid.0,
                        tid.0
                    );
                    return Err(br::FAILED_REPLY);
                }
            } else if !target_node
                .map(|n| state.nodes[&n].accept_fds)
                .unwrap_or(false)
            {
                log::warn!(
                    "binder: {}:{} transaction with fd {fd} but target does not allow fds",
                    pid.0,
                    tid.0
                );
                return Err(br::FAILED_REPLY);
            }
            let Some(file) = state.file_get(pid, fd) else {
                log::warn!("binder: {}:{} transaction with invalid fd {fd}", pid.0, tid.0);
                return Err(br::FAILED_REPLY);
            };
            let Some(target_fd) = state.fd_install(target_proc, file) else {
                state.file_put(file);
                return Err(br::FAILED_REPLY);
            };
            log::trace!("binder:        fd {fd} -> {target_fd}");
            fp.handle = target_fd as u64;
            Ok(())
        }
        other => {
            log::warn!(
                "binder: {}:{} transaction with invalid object type {other:#x}",
                pid.0,
                tid.0
            );
            Err(br::FAILED_REPLY)
        }
    }
}

/// Remove a finished (or abandoned) transaction from its caller's stack and
/// drop the record.
pub(crate) fn pop_transaction(state: &mut CoreState, caller: Option<(Pid, Tid)>, tx_id: TxId) {
    if let Some((cp, ct)) = caller {
        let stack_next = state.transactions[&tx_id].from_parent;
        if let Some(thread) = state
            .procs
            .get_mut(&cp)
            .and_then(|p| p.threads.get_mut(&ct))
        {
            debug_assert_eq!(thread.transaction_stack, Some(tx_id));
            thread.transaction_stack = stack_next;
        }
        if let Some(tx) = state.transactions.get_mut(&tx_id) {
            tx.from = None;
        }
    }
    if let Some(tx) = state.transactions.get_mut(&tx_id) {
        tx.need_reply = false;
        let buffer = tx.buffer;
        if let Some((bp, addr)) = buffer {
            if let Some(buffer) = state
                .procs
                .get_mut(&bp)
                .and_then(|p| p.pool.as_mut())
                .and_then(|pool| pool.get_mut(addr))
            {
                buffer.transaction = None;
            }
        }
    }
    state.transactions.remove(&tx_id);
    state.stats.objects.deleted(ObjKind::Transaction);
}

/// A transaction can no longer be answered: walk the `from_parent` chain
/// until a live originator takes the error, detaching every transaction
/// visited on the way.
pub(crate) fn send_failed_reply(state: &mut CoreState, tx_id: TxId, error_code: u32) {
    let mut cur = tx_id;
    loop {
        let Some(tx) = state.transactions.get(&cur) else {
            return;
        };
        debug_assert!(!tx.one_way());
        let from = tx.from;
        let next = tx.from_parent;
        let debug_id = tx.debug_id;

        let live_from = from.filter(|(fp, ft)| state.thread(*fp, *ft).is_some());
        match live_from {
            Some((fp, ft)) => {
                {
                    let thread = state
                        .procs
                        .get_mut(&fp)
                        .and_then(|p| p.threads.get_mut(&ft))
                        .expect("live thread");
                    // Keep a slot free for the error that matters most: an
                    // already-stashed primary error moves to the secondary.
                    if thread.return_error != br::OK && thread.return_error2 == br::OK {
                        thread.return_error2 = thread.return_error;
                        thread.return_error = br::OK;
                    }
                    if thread.return_error != br::OK {
                        log::warn!(
                            "binder: reply failed, target {}:{} already has an error",
                            fp.0,
                            ft.0
                        );
                        return;
                    }
                }
                log::debug!(
                    "binder: send failed reply for transaction {} to {}:{}",
                    debug_id,
                    fp.0,
                    ft.0
                );
                pop_transaction(state, Some((fp, ft)), cur);
                let thread = state
                    .procs
                    .get_mut(&fp)
                    .and_then(|p| p.threads.get_mut(&ft))
                    .expect("live thread");
                thread.return_error = error_code;
                return;
            }
            None => {
                log::debug!(
                    "binder: send failed reply for transaction {}, target dead",
                    debug_id
                );
                pop_transaction(state, None, cur);
                match next {
                    Some(next) => cur = next,
                    None => return,
                }
            }
        }
    }
}

/// Give back everything a buffer's translated payload holds: node and
/// reference counts and, when unwinding a failed translation, the
/// descriptors installed in the target.
///
/// `failed_at` limits the walk to the offsets that were actually processed.
pub(crate) fn transaction_buffer_release(
    state: &mut CoreState,
    pid: Pid,
    buffer_addr: u64,
    failed_at: Option<usize>,
) {
    let (debug_id, data_size, offsets_size, target_node) = {
        let pool = state.procs.get(&pid).and_then(|p| p.pool.as_ref());
        let Some(pool) = pool else { return };
        let Some(buffer) = pool.get(buffer_addr) else {
            return;
        };
        (
            buffer.debug_id,
            buffer.data_size,
            buffer.offsets_size,
            buffer.target_node,
        )
    };
    log::debug!(
        "binder: {} buffer release {}, size {}-{}, failed at {:?}",
        pid.0,
        debug_id,
        data_size,
        offsets_size,
        failed_at
    );

    if let Some(node_id) = target_node {
        state.dec_node(node_id, true, false);
    }

    let count = {
        let total = (offsets_size / 8) as usize;
        failed_at.map(|at| at.min(total)).unwrap_or(total)
    };
    for index in 0..count {
        let fp = {
            let pool = state
                .procs
                .get(&pid)
                .and_then(|p| p.pool.as_ref())
                .expect("checked above");
            let data_addr = pool.data_addr(buffer_addr);
            let offsets_addr = data_addr + align_to_word(data_size);
            let off_bytes = pool
                .copy_out(offsets_addr + index as u64 * 8, 8)
                .expect("offsets area is mapped");
            let mut c = 0;
            let off = get_u64(&off_bytes, &mut c).expect("eight bytes");
            let object_fits = off
                .checked_add(FLAT_OBJECT_SIZE as u64)
                .map(|end| end <= data_size)
                .unwrap_or(false);
            if !object_fits || off % 8 != 0 {
                log::warn!(
                    "binder: transaction release {} bad offset {}, size {}",
                    debug_id,
                    off,
                    data_size
                );
                continue;
            }
            let obj_bytes = pool
                .copy_out(data_addr + off, FLAT_OBJECT_SIZE as u64)
                .expect("object area is mapped");
            let mut c = 0;
            FlatObject::decode(&obj_bytes, &mut c).expect("sized")
        };
        use binder_wire::obj;
        match fp.obj_type {
            obj::BINDER | obj::WEAK_BINDER => {
                let Some(node_id) = state.node_by_ptr(pid, fp.handle) else {
                    log::warn!(
                        "binder: transaction release {} bad node u{:016x}",
                        debug_id,
                        fp.handle
                    );
                    continue;
                };
                state.dec_node(node_id, fp.obj_type == obj::BINDER, false);
            }
            obj::HANDLE | obj::WEAK_HANDLE => {
                let Some(ref_id) = state.ref_by_desc(pid, fp.handle as u32) else {
                    log::warn!(
                        "binder: transaction release {} bad handle {}",
                        debug_id,
                        fp.handle
                    );
                    continue;
                };
                state.dec_ref(ref_id, fp.obj_type == obj::HANDLE);
            }
            obj::FD => {
                // Installed descriptors are only taken back when a failed
                // translation unwinds; delivered ones belong to the receiver.
                if failed_at.is_some() {
                    state.fd_close(pid, fp.handle as u32);
                }
            }
            other => {
                log::warn!(
                    "binder: transaction release {} bad object type {other:#x}",
                    debug_id
                );
            }
        }
    }
}
