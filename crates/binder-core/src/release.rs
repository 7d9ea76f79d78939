//! Teardown: thread exit, flush, and the deferred release of a whole
//! endpoint.
//!
//! Release sweeps in a fixed order - threads, then nodes (orphaning any with
//! surviving external references and firing their death subscriptions), then
//! outgoing references, then leftover queue work, then buffers - so that by
//! the time the pool goes away nothing points into it.

use alloc::collections::VecDeque;
use alloc::vec::Vec;

use binder_wire::br;

use crate::stats::ObjKind;
use crate::state::{CoreState, OpError};
use crate::transaction::{pop_transaction, send_failed_reply};
use crate::types::{DeathKind, LooperState, NodeId, Pid, Tid, Work};

/// Counts reported by one endpoint release, for diagnostics.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ReleaseStats {
    pub threads: u32,
    pub nodes: u32,
    pub incoming_refs: u32,
    pub outgoing_refs: u32,
    pub active_transactions: u32,
    pub buffers: u32,
}

impl CoreState {
    /// BINDER_THREAD_EXIT: tear down the calling thread.
    pub fn thread_exit(&mut self, pid: Pid, tid: Tid) -> Result<(), OpError> {
        self.proc(pid)?;
        log::debug!("binder: {}:{} exit", pid.0, tid.0);
        self.free_thread(pid, tid);
        Ok(())
    }

    /// Remove a thread, failing anything it was in the middle of.
    ///
    /// Transactions it was receiving get BR_DEAD_REPLY sent upstream;
    /// transactions it sent lose their originator and will never be
    /// answered. Returns how many stacked transactions were touched.
    pub(crate) fn free_thread(&mut self, pid: Pid, tid: Tid) -> u32 {
        let Some(proc) = self.procs.get_mut(&pid) else {
            return 0;
        };
        let Some(thread) = proc.threads.get(&tid) else {
            return 0;
        };
        let stack_top = thread.transaction_stack;

        let mut send_reply = None;
        if let Some(top) = stack_top {
            let tx = &self.transactions[&top];
            if tx.to_proc == Some(pid) && tx.to_thread == Some(tid) {
                send_reply = Some(top);
            }
        }

        // Detach this thread from every transaction on its stack.
        let mut active_transactions = 0;
        let mut cursor = stack_top;
        while let Some(tx_id) = cursor {
            active_transactions += 1;
            let tx = self.transactions.get_mut(&tx_id).expect("stacked");
            log::debug!(
                "binder: release {}:{} transaction {} {}, still active",
                pid.0,
                tid.0,
                tx.debug_id,
                if tx.to_thread == Some(tid) { "in" } else { "out" }
            );
            if tx.to_proc == Some(pid) && tx.to_thread == Some(tid) {
                tx.to_proc = None;
                tx.to_thread = None;
                let buffer = tx.buffer.take();
                cursor = tx.to_parent;
                if let Some((bp, addr)) = buffer {
                    if let Some(b) = self
                        .procs
                        .get_mut(&bp)
                        .and_then(|p| p.pool.as_mut())
                        .and_then(|pool| pool.get_mut(addr))
                    {
                        b.transaction = None;
                    }
                }
            } else if tx.from == Some((pid, tid)) {
                tx.from = None;
                cursor = tx.from_parent;
            } else {
                debug_assert!(false, "thread stack holds a foreign transaction");
                break;
            }
        }

        let thread = self
            .procs
            .get_mut(&pid)
            .and_then(|p| p.threads.remove(&tid))
            .expect("checked above");
        self.stats.objects.deleted(ObjKind::Thread);

        if let Some(top) = send_reply {
            send_failed_reply(self, top, br::DEAD_REPLY);
        }
        self.release_work(thread.todo);
        active_transactions
    }

    /// Drop a queue of undeliverable work, failing the senders of any
    /// synchronous transactions in it.
    pub(crate) fn release_work(&mut self, list: VecDeque<Work>) {
        for work in list {
            match work {
                Work::Transaction(tx_id) => {
                    let Some(tx) = self.transactions.get(&tx_id) else {
                        continue;
                    };
                    let is_request = tx
                        .buffer
                        .and_then(|(bp, addr)| {
                            self.procs
                                .get(&bp)
                                .and_then(|p| p.pool.as_ref())
                                .and_then(|pool| pool.get(addr))
                                .map(|b| b.target_node.is_some())
                        })
                        .unwrap_or(false);
                    if is_request && !tx.one_way() {
                        send_failed_reply(self, tx_id, br::DEAD_REPLY);
                    } else {
                        pop_transaction(self, None, tx_id);
                    }
                }
                Work::TransactionComplete => {
                    self.stats.objects.deleted(ObjKind::TransactionComplete);
                }
                Work::Node(node_id) => {
                    if let Some(node) = self.nodes.get_mut(&node_id) {
                        node.work_queued = false;
                    }
                }
                Work::Death(death_id) => {
                    let clearing = self
                        .deaths
                        .get(&death_id)
                        .map(|d| d.kind == DeathKind::ClearNotification)
                        .unwrap_or(false);
                    if clearing {
                        // Detached from its reference at clear time; nothing
                        // will ever deliver it now.
                        self.deaths.remove(&death_id);
                        self.stats.objects.deleted(ObjKind::Death);
                    } else if let Some(death) = self.deaths.get_mut(&death_id) {
                        death.queued = false;
                    }
                }
            }
        }
    }

    /// Deferred put-files: drop every file capability the process holds.
    pub fn put_files(&mut self, pid: Pid) {
        let fds: Vec<u32> = self
            .procs
            .get(&pid)
            .map(|p| p.fd_table.keys().copied().collect())
            .unwrap_or_default();
        for fd in fds {
            self.fd_close(pid, fd);
        }
    }

    /// Deferred flush: force every thread back to user space.
    pub fn deferred_flush(&mut self, pid: Pid) {
        let Some(proc) = self.procs.get_mut(&pid) else {
            return;
        };
        let mut woken = 0;
        for thread in proc.threads.values_mut() {
            thread.looper.insert(LooperState::NEED_RETURN);
            if thread.looper.contains(LooperState::WAITING) {
                woken += 1;
            }
        }
        log::debug!("binder: flush {} woke {} threads", pid.0, woken);
    }

    /// Stop accepting operations from a process whose release is scheduled.
    pub fn mark_dead(&mut self, pid: Pid) {
        if let Some(proc) = self.procs.get_mut(&pid) {
            proc.dead = true;
        }
    }

    /// Deferred release: dismantle one endpoint completely.
    pub fn deferred_release(&mut self, pid: Pid) -> ReleaseStats {
        let mut stats = ReleaseStats::default();
        if !self.procs.contains_key(&pid) {
            return stats;
        }

        if let Some(ctx) = self.context_mgr {
            if self.nodes.get(&ctx).map(|n| n.owner) == Some(Some(pid)) {
                log::debug!("binder: release {}: context manager gone", pid.0);
                self.context_mgr = None;
            }
        }

        // Threads first: their stacks fail outstanding transactions.
        while let Some(&tid) = self.procs[&pid].threads.keys().next() {
            stats.threads += 1;
            stats.active_transactions += self.free_thread(pid, tid);
        }

        // Nodes: free the unreferenced, orphan the rest and fire deaths.
        let node_ids: Vec<NodeId> = self.procs[&pid].nodes_by_ptr.values().copied().collect();
        for node_id in node_ids {
            stats.nodes += 1;
            stats.incoming_refs += self.orphan_or_free_node(pid, node_id);
        }
        self.procs.get_mut(&pid).expect("open").nodes_by_ptr.clear();

        // Outgoing references give their counts back to foreign nodes.
        while let Some((_, &ref_id)) = self.procs[&pid].refs_by_desc.iter().next() {
            stats.outgoing_refs += 1;
            self.delete_ref(ref_id);
        }

        // Work nobody will read anymore.
        let todo = core::mem::take(&mut self.procs.get_mut(&pid).expect("open").todo);
        self.release_work(todo);

        // Buffers last; nothing references the pool now.
        let allocated: Vec<u64> = self
            .procs
            .get(&pid)
            .and_then(|p| p.pool.as_ref())
            .map(|pool| pool.allocated())
            .unwrap_or_default();
        for addr in allocated {
            stats.buffers += 1;
            let tx = self
                .procs
                .get(&pid)
                .and_then(|p| p.pool.as_ref())
                .and_then(|pool| pool.get(addr))
                .and_then(|b| b.transaction);
            if let Some(tx_id) = tx {
                log::warn!(
                    "binder: release proc {}, transaction {:?} not freed",
                    pid.0,
                    tx_id
                );
                if let Some(tx) = self.transactions.get_mut(&tx_id) {
                    tx.buffer = None;
                }
                let pool = self
                    .procs
                    .get_mut(&pid)
                    .and_then(|p| p.pool.as_mut())
                    .expect("mapped");
                pool.get_mut(addr).expect("allocated").transaction = None;
            }
            let pool = self
                .procs
                .get_mut(&pid)
                .and_then(|p| p.pool.as_mut())
                .expect("mapped");
            pool.free(addr);
        }

        self.procs.remove(&pid);
        self.stats.objects.deleted(ObjKind::Proc);
        log::debug!(
            "binder: release {}: threads {}, nodes {} (refs in {}), refs out {}, active transactions {}, buffers {}",
            pid.0,
            stats.threads,
            stats.nodes,
            stats.incoming_refs,
            stats.outgoing_refs,
            stats.active_transactions,
            stats.buffers
        );
        stats
    }

    /// Release-path handling of one owned node. Returns how many inbound
    /// references survive it.
    fn orphan_or_free_node(&mut self, pid: Pid, node_id: NodeId) -> u32 {
        self.remove_node_work(pid, node_id);

        // Held-back oneways will never be dispatched.
        let async_todo = self
            .nodes
            .get_mut(&node_id)
            .map(|n| core::mem::take(&mut n.async_todo))
            .unwrap_or_default();
        self.release_work(async_todo);

        let Some(node) = self.nodes.get_mut(&node_id) else {
            return 0;
        };
        if node.refs.is_empty() {
            if self.context_mgr == Some(node_id) {
                self.context_mgr = None;
            }
            self.nodes.remove(&node_id);
            self.stats.objects.deleted(ObjKind::Node);
            return 0;
        }

        node.owner = None;
        node.local_strong = 0;
        node.local_weak = 0;
        node.has_async_transaction = false;
        let refs = node.refs.clone();
        let debug_id = node.debug_id;
        self.orphan_nodes.insert(node_id);

        let mut incoming = 0;
        let mut deaths = 0;
        for ref_id in refs {
            incoming += 1;
            let Some(r) = self.refs.get(&ref_id) else {
                continue;
            };
            let holder = r.proc;
            let Some(death_id) = r.death else { continue };
            deaths += 1;
            let death = self.deaths.get_mut(&death_id).expect("attached");
            if !death.queued {
                death.kind = DeathKind::DeadBinder;
                death.queued = true;
                self.enqueue_proc_work(holder, Work::Death(death_id));
            }
        }
        log::debug!(
            "binder: node {debug_id} now dead, refs {incoming}, death {deaths}"
        );
        incoming
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::invariants::assert_invariants;
    use crate::mem::NoMemory;
    use alloc::vec::Vec;
    use binder_wire::{bc, br, get_u32, put_u32, TransactionData};

    const P0: Pid = Pid(1);
    const P1: Pid = Pid(2);
    const T0: Tid = Tid(10);
    const T1: Tid = Tid(20);

    fn setup() -> CoreState {
        let mut state = CoreState::new();
        state.open(P0, 1000, 0, -20).unwrap();
        state.mmap(P0, 64 * 1024, false).unwrap();
        state.set_context_mgr(P0).unwrap();
        state.open(P1, 2000, 0, -20).unwrap();
        state.mmap(P1, 64 * 1024, false).unwrap();
        state
    }

    fn send_sync_call(state: &mut CoreState) {
        let mut write = Vec::new();
        put_u32(&mut write, bc::TRANSACTION);
        TransactionData::default().encode(&mut write);
        state.write_read(P1, T1, &NoMemory, &write, 4096).unwrap();
        // The manager picks it up; it now sits on T0's stack.
        state.write_read(P0, T0, &NoMemory, &[], 4096).unwrap();
        assert!(state.thread(P0, T0).unwrap().transaction_stack.is_some());
    }

    #[test]
    fn test_thread_exit_fails_received_transaction() {
        let mut state = setup();
        send_sync_call(&mut state);

        // The handling thread dies before replying.
        state.thread_exit(P0, T0).unwrap();
        assert!(state.thread(P0, T0).is_none());

        // The caller is told its target died.
        let outcome = state.write_read(P1, T1, &NoMemory, &[], 4096).unwrap();
        let mut cursor = 0;
        assert_eq!(get_u32(&outcome.read, &mut cursor).unwrap(), br::NOOP);
        assert_eq!(get_u32(&outcome.read, &mut cursor).unwrap(), br::DEAD_REPLY);
        assert!(state.thread(P1, T1).unwrap().transaction_stack.is_none());
        assert_invariants(&state);
    }

    #[test]
    fn test_thread_exit_detaches_sent_transaction() {
        let mut state = setup();
        let mut write = Vec::new();
        put_u32(&mut write, bc::TRANSACTION);
        TransactionData::default().encode(&mut write);
        state.write_read(P1, T1, &NoMemory, &write, 4096).unwrap();

        // The caller exits while the call is still queued: the transaction
        // loses its originator but stays deliverable.
        state.thread_exit(P1, T1).unwrap();
        let outcome = state.write_read(P0, T0, &NoMemory, &[], 4096).unwrap();
        let mut cursor = 0;
        let mut saw_transaction = false;
        while cursor < outcome.read.len() {
            let code = get_u32(&outcome.read, &mut cursor).unwrap();
            if code == br::TRANSACTION {
                let tr = TransactionData::decode(&outcome.read, &mut cursor).unwrap();
                assert_eq!(tr.sender_pid, 0);
                saw_transaction = true;
            } else {
                cursor += binder_wire::code_size(code);
            }
        }
        assert!(saw_transaction);
        assert_invariants(&state);
    }

    #[test]
    fn test_release_frees_everything() {
        let mut state = setup();
        send_sync_call(&mut state);

        state.mark_dead(P1);
        state.deferred_release(P1);
        state.mark_dead(P0);
        let stats = state.deferred_release(P0);
        assert_eq!(stats.threads, 1);
        assert!(state.procs.is_empty());
        assert!(state.nodes.is_empty());
        assert!(state.refs.is_empty());
        assert!(state.transactions.is_empty());
        assert_invariants(&state);
    }
}
