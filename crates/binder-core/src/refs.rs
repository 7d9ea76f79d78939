//! Reference engine: strong/weak counts on nodes and references, and the
//! owner-side acquire/release handshake.
//!
//! Count changes never talk to the owner directly. When a node's first
//! strong or weak count appears (or its last one goes away) while the owner's
//! belief disagrees, a lifecycle work item is queued on the owner; the read
//! path turns it into BR_INCREFS/BR_ACQUIRE/BR_RELEASE/BR_DECREFS and the
//! owner answers with BC_INCREFS_DONE/BC_ACQUIRE_DONE.

use crate::stats::ObjKind;
use crate::state::CoreState;
use crate::types::{NodeId, Pid, Ref, RefId, Tid, Work};

impl CoreState {
    // ========================================================================
    // Node counts
    // ========================================================================

    /// Queue (or re-queue) a node's lifecycle work on its owner: on the given
    /// thread if the caller runs inside the owner, else on the owner's
    /// process queue.
    fn queue_node_work(&mut self, node_id: NodeId, target: Option<(Pid, Tid)>) {
        let Some(owner) = self.nodes.get(&node_id).and_then(|n| n.owner) else {
            return;
        };
        self.remove_node_work(owner, node_id);
        match target {
            Some((pid, tid)) if pid == owner => {
                self.enqueue_thread_work(pid, tid, Work::Node(node_id));
            }
            _ => self.enqueue_proc_work(owner, Work::Node(node_id)),
        }
        if let Some(node) = self.nodes.get_mut(&node_id) {
            node.work_queued = true;
        }
    }

    /// Add one count to a node. `internal` counts come from references,
    /// local ones from transactions and owner acknowledgements. `target`
    /// names the caller's thread so the owner (when it is the caller) picks
    /// up the hand-off before returning to user space.
    pub(crate) fn inc_node(
        &mut self,
        node_id: NodeId,
        strong: bool,
        internal: bool,
        target: Option<(Pid, Tid)>,
    ) {
        let Some(node) = self.nodes.get_mut(&node_id) else {
            return;
        };
        if strong {
            if internal {
                node.internal_strong += 1;
            } else {
                node.local_strong += 1;
            }
            if !node.has_strong_ref {
                self.queue_node_work(node_id, target);
            }
        } else {
            if !internal {
                node.local_weak += 1;
            }
            if !node.has_weak_ref && !node.work_queued {
                self.queue_node_work(node_id, target);
            }
        }
    }

    /// Drop one count from a node, telling the owner to let go (or freeing
    /// the node) once nothing is left.
    pub(crate) fn dec_node(&mut self, node_id: NodeId, strong: bool, internal: bool) {
        let Some(node) = self.nodes.get_mut(&node_id) else {
            return;
        };
        if strong {
            if internal {
                debug_assert!(node.internal_strong > 0);
                node.internal_strong = node.internal_strong.saturating_sub(1);
            } else {
                debug_assert!(node.local_strong > 0);
                node.local_strong = node.local_strong.saturating_sub(1);
            }
            if node.has_strong() {
                return;
            }
        } else {
            if !internal {
                debug_assert!(node.local_weak > 0);
                node.local_weak = node.local_weak.saturating_sub(1);
            }
            if node.local_weak > 0 || !node.refs.is_empty() {
                return;
            }
        }

        let owner = node.owner;
        if owner.is_some() && (node.has_strong_ref || node.has_weak_ref) {
            if !node.work_queued {
                node.work_queued = true;
                self.enqueue_proc_work(owner.expect("checked"), Work::Node(node_id));
            }
        } else if node.refs.is_empty()
            && node.internal_strong == 0
            && node.local_strong == 0
            && node.local_weak == 0
        {
            self.free_node(node_id);
        }
    }

    /// Unlink and drop a node that reached zero everywhere.
    pub(crate) fn free_node(&mut self, node_id: NodeId) {
        let Some(node) = self.nodes.get(&node_id) else {
            return;
        };
        let owner = node.owner;
        let ptr = node.ptr;
        let debug_id = node.debug_id;
        match owner {
            Some(pid) => {
                self.remove_node_work(pid, node_id);
                if let Some(proc) = self.procs.get_mut(&pid) {
                    proc.nodes_by_ptr.remove(&ptr);
                }
                log::debug!("binder: refless node {debug_id} deleted");
            }
            None => {
                self.orphan_nodes.remove(&node_id);
                log::debug!("binder: dead node {debug_id} deleted");
            }
        }
        if self.context_mgr == Some(node_id) {
            self.context_mgr = None;
        }
        self.nodes.remove(&node_id);
        self.stats.objects.deleted(ObjKind::Node);
    }

    // ========================================================================
    // References
    // ========================================================================

    /// Reference held by `pid` under `desc`, if any.
    pub fn ref_by_desc(&self, pid: Pid, desc: u32) -> Option<RefId> {
        self.procs.get(&pid)?.refs_by_desc.get(&desc).copied()
    }

    /// Reference from `pid` to `node_id`, created on first use with the
    /// smallest free descriptor (0 for the context manager).
    pub fn get_ref_for_node(&mut self, pid: Pid, node_id: NodeId) -> Option<RefId> {
        if let Some(&existing) = self.procs.get(&pid)?.refs_by_node.get(&node_id) {
            return Some(existing);
        }
        if !self.nodes.contains_key(&node_id) {
            return None;
        }
        let id = self.alloc_ref_id();
        let debug_id = self.alloc_debug_id();
        let is_context_mgr = self.context_mgr == Some(node_id);
        let proc = self.procs.get_mut(&pid)?;
        let desc = proc.unused_desc(is_context_mgr);
        proc.refs_by_desc.insert(desc, id);
        proc.refs_by_node.insert(node_id, id);
        self.refs.insert(
            id,
            Ref {
                id,
                debug_id,
                proc: pid,
                node: node_id,
                desc,
                strong: 0,
                weak: 0,
                death: None,
            },
        );
        let node = self.nodes.get_mut(&node_id).expect("checked above");
        node.refs.push(id);
        let node_debug = node.debug_id;
        self.stats.objects.created(ObjKind::Ref);
        log::debug!("binder: {} new ref {debug_id} desc {desc} for node {node_debug}", pid.0);
        Some(id)
    }

    /// Add one count to a reference; the 0→1 edge forwards to the node.
    pub fn inc_ref(&mut self, ref_id: RefId, strong: bool, target: Option<(Pid, Tid)>) {
        let Some(r) = self.refs.get(&ref_id) else {
            return;
        };
        let node = r.node;
        if strong {
            if r.strong == 0 {
                self.inc_node(node, true, true, target);
            }
            if let Some(r) = self.refs.get_mut(&ref_id) {
                r.strong += 1;
            }
        } else {
            if r.weak == 0 {
                self.inc_node(node, false, true, target);
            }
            if let Some(r) = self.refs.get_mut(&ref_id) {
                r.weak += 1;
            }
        }
    }

    /// Drop one count from a reference; the 1→0 edge forwards to the node
    /// and both counts at zero destroy the reference. Returns false on a
    /// caller bookkeeping error (underflow), which only earns a diagnostic.
    pub fn dec_ref(&mut self, ref_id: RefId, strong: bool) -> bool {
        let Some(r) = self.refs.get_mut(&ref_id) else {
            return false;
        };
        let node = r.node;
        let (debug_id, desc, proc) = (r.debug_id, r.desc, r.proc);
        if strong {
            if r.strong == 0 {
                log::warn!(
                    "binder: {} invalid dec strong, ref {debug_id} desc {desc}",
                    proc.0
                );
                return false;
            }
            r.strong -= 1;
            if r.strong == 0 {
                self.dec_node(node, true, true);
            }
        } else {
            if r.weak == 0 {
                log::warn!(
                    "binder: {} invalid dec weak, ref {debug_id} desc {desc}",
                    proc.0
                );
                return false;
            }
            r.weak -= 1;
        }
        if let Some(r) = self.refs.get(&ref_id) {
            if r.strong == 0 && r.weak == 0 {
                self.delete_ref(ref_id);
            }
        }
        true
    }

    /// Destroy a reference: unlink it from its process and node, give back
    /// the counts it held, and drop any death subscription with it.
    pub(crate) fn delete_ref(&mut self, ref_id: RefId) {
        let Some(r) = self.refs.remove(&ref_id) else {
            return;
        };
        log::debug!(
            "binder: {} delete ref {} desc {}",
            r.proc.0,
            r.debug_id,
            r.desc
        );
        if let Some(proc) = self.procs.get_mut(&r.proc) {
            proc.refs_by_desc.remove(&r.desc);
            proc.refs_by_node.remove(&r.node);
        }
        if r.strong > 0 {
            self.dec_node(r.node, true, true);
        }
        if let Some(node) = self.nodes.get_mut(&r.node) {
            node.refs.retain(|&id| id != ref_id);
        }
        self.dec_node(r.node, false, true);
        if let Some(death_id) = r.death {
            self.remove_death_work(r.proc, death_id);
            self.deaths.remove(&death_id);
            self.stats.objects.deleted(ObjKind::Death);
        }
        self.stats.objects.deleted(ObjKind::Ref);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Tid;

    fn two_procs() -> (CoreState, NodeId) {
        let mut state = CoreState::new();
        state.open(Pid(1), 1000, 0, -20).unwrap();
        state.open(Pid(2), 1000, 0, -20).unwrap();
        let node = state.new_node(Pid(1), 0xAAA, 0xC0).unwrap();
        (state, node)
    }

    #[test]
    fn test_first_strong_queues_owner_work() {
        let (mut state, node) = two_procs();
        let r = state.get_ref_for_node(Pid(2), node).unwrap();

        state.inc_ref(r, true, None);
        assert_eq!(state.nodes[&node].internal_strong, 1);
        assert!(state.nodes[&node].work_queued);
        assert!(state.procs[&Pid(1)]
            .todo
            .iter()
            .any(|w| *w == Work::Node(node)));

        // A second strong count does not requeue anything.
        let before = state.procs[&Pid(1)].todo.len();
        state.inc_ref(r, true, None);
        assert_eq!(state.refs[&r].strong, 2);
        assert_eq!(state.procs[&Pid(1)].todo.len(), before);
    }

    #[test]
    fn test_work_targets_owner_thread_when_caller_is_owner() {
        let (mut state, node) = two_procs();
        state.get_thread(Pid(1), Tid(5));
        let r = state.get_ref_for_node(Pid(2), node).unwrap();

        // Caller context inside the owner: work lands on that thread.
        state.inc_ref(r, false, Some((Pid(1), Tid(5))));
        assert!(state.procs[&Pid(1)].threads[&Tid(5)]
            .todo
            .iter()
            .any(|w| *w == Work::Node(node)));
        assert!(state.procs[&Pid(1)].todo.is_empty());
    }

    #[test]
    fn test_ref_destroyed_at_zero_and_node_follows() {
        let (mut state, node) = two_procs();
        let r = state.get_ref_for_node(Pid(2), node).unwrap();

        state.inc_ref(r, true, None);
        state.inc_ref(r, false, None);
        assert!(state.dec_ref(r, true));
        assert!(state.refs.contains_key(&r));
        assert!(state.dec_ref(r, false));
        assert!(!state.refs.contains_key(&r));
        assert!(!state.procs[&Pid(2)].refs_by_desc.contains_key(&1));

        // With the owner's belief never established and every count gone,
        // the node itself is freed.
        assert!(!state.nodes.contains_key(&node));
    }

    #[test]
    fn test_dec_ref_underflow_is_diagnostic_only() {
        let (mut state, node) = two_procs();
        let r = state.get_ref_for_node(Pid(2), node).unwrap();
        assert!(!state.dec_ref(r, true));
        assert!(state.refs.contains_key(&r));
    }

    #[test]
    fn test_internal_strong_matches_strong_holders() {
        let (mut state, node) = two_procs();
        state.open(Pid(3), 1000, 0, -20).unwrap();
        let r2 = state.get_ref_for_node(Pid(2), node).unwrap();
        let r3 = state.get_ref_for_node(Pid(3), node).unwrap();

        state.inc_ref(r2, true, None);
        state.inc_ref(r3, true, None);
        state.inc_ref(r3, true, None);
        assert_eq!(state.nodes[&node].internal_strong, 2);

        state.dec_ref(r3, true);
        assert_eq!(state.nodes[&node].internal_strong, 2);
        state.dec_ref(r3, true);
        assert_eq!(state.nodes[&node].internal_strong, 1);
    }

    #[test]
    fn test_descriptor_reuse_after_delete() {
        let (mut state, node) = two_procs();
        let node_b = state.new_node(Pid(1), 0xBBB, 0).unwrap();
        let ra = state.get_ref_for_node(Pid(2), node).unwrap();
        let rb = state.get_ref_for_node(Pid(2), node_b).unwrap();
        assert_eq!(state.refs[&ra].desc, 1);
        assert_eq!(state.refs[&rb].desc, 2);

        state.inc_ref(ra, false, None);
        state.dec_ref(ra, false);
        // Descriptor 1 freed; a new ref takes it again.
        let node_c = state.new_node(Pid(1), 0xCCC, 0).unwrap();
        let rc = state.get_ref_for_node(Pid(2), node_c).unwrap();
        assert_eq!(state.refs[&rc].desc, 1);
    }
}
