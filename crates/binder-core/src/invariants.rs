//! Runtime-checkable invariants over the whole core state.
//!
//! Used three ways: asserted from unit tests after targeted operations,
//! asserted after every step of the randomized stress test, and available to
//! hosts as a sanity probe. Each check returns violations instead of
//! panicking so a caller can report all of them at once.

use alloc::format;
use alloc::string::String;
use alloc::vec::Vec;

use crate::pool::BUFFER_HEADER_SIZE;
use crate::state::CoreState;
use crate::types::{Pid, Tid, TxId, Work};

/// One violated invariant with details.
#[derive(Clone, Debug)]
pub struct InvariantViolation {
    /// Name of the violated invariant.
    pub invariant: &'static str,
    /// Description of what went wrong.
    pub description: String,
}

/// Check every invariant; the result is empty when all hold.
pub fn check_all_invariants(state: &CoreState) -> Vec<InvariantViolation> {
    let mut violations = Vec::new();
    violations.extend(check_pool_partition(state));
    violations.extend(check_internal_strong_counts(state));
    violations.extend(check_descriptor_tables(state));
    violations.extend(check_async_space(state));
    violations.extend(check_pending_refs(state));
    violations.extend(check_transaction_placement(state));
    violations.extend(check_async_flags(state));
    violations.extend(check_orphan_consistency(state));
    violations
}

/// Panic on the first violation (test helper).
pub fn assert_invariants(state: &CoreState) {
    let violations = check_all_invariants(state);
    assert!(
        violations.is_empty(),
        "invariant violations: {violations:?}"
    );
}

/// Invariant 1: every pool's buffers partition its mapping exactly, and free
/// neighbors never survive a free un-coalesced.
fn check_pool_partition(state: &CoreState) -> Vec<InvariantViolation> {
    let mut violations = Vec::new();
    for (pid, proc) in &state.procs {
        let Some(pool) = proc.pool.as_ref() else {
            continue;
        };
        let mut cursor = pool.base();
        let mut prev_free = None;
        for (addr, buffer) in pool.buffers() {
            if addr != cursor {
                violations.push(InvariantViolation {
                    invariant: "pool_partition",
                    description: format!(
                        "proc {}: buffer at {addr:#x}, expected {cursor:#x}",
                        pid.0
                    ),
                });
            }
            cursor = addr + BUFFER_HEADER_SIZE + pool.capacity_of(addr);
            if prev_free == Some(true) && buffer.free {
                violations.push(InvariantViolation {
                    invariant: "pool_partition",
                    description: format!(
                        "proc {}: adjacent free buffers at {addr:#x}",
                        pid.0
                    ),
                });
            }
            prev_free = Some(buffer.free);
        }
        if cursor != pool.base() + pool.size() {
            violations.push(InvariantViolation {
                invariant: "pool_partition",
                description: format!(
                    "proc {}: buffers end at {cursor:#x}, mapping ends at {:#x}",
                    pid.0,
                    pool.base() + pool.size()
                ),
            });
        }
    }
    violations
}

/// Invariant 2: a node's internal strong count equals the number of
/// references holding it strongly.
fn check_internal_strong_counts(state: &CoreState) -> Vec<InvariantViolation> {
    let mut violations = Vec::new();
    for (node_id, node) in &state.nodes {
        let holders = state
            .refs
            .values()
            .filter(|r| r.node == *node_id && r.strong > 0)
            .count() as u32;
        if node.internal_strong != holders {
            violations.push(InvariantViolation {
                invariant: "internal_strong_counts",
                description: format!(
                    "node {}: internal_strong {} but {} strong holders",
                    node.debug_id, node.internal_strong, holders
                ),
            });
        }
    }
    violations
}

/// Invariant 3: descriptor tables are bijections onto live references, with
/// 0 reserved for the context manager.
fn check_descriptor_tables(state: &CoreState) -> Vec<InvariantViolation> {
    let mut violations = Vec::new();
    for (pid, proc) in &state.procs {
        for (&desc, &ref_id) in &proc.refs_by_desc {
            let Some(r) = state.refs.get(&ref_id) else {
                violations.push(InvariantViolation {
                    invariant: "descriptor_tables",
                    description: format!("proc {}: desc {desc} maps to missing ref", pid.0),
                });
                continue;
            };
            if r.desc != desc || r.proc != *pid {
                violations.push(InvariantViolation {
                    invariant: "descriptor_tables",
                    description: format!(
                        "proc {}: desc {desc} maps to ref (desc {}, proc {})",
                        pid.0, r.desc, r.proc.0
                    ),
                });
            }
            // Descriptor 0 stays with a context-manager ref even after the
            // slot clears (the node may already be orphaned), so only the
            // forward direction is checkable.
            let is_ctx = state.context_mgr == Some(r.node);
            if is_ctx && desc != 0 {
                violations.push(InvariantViolation {
                    invariant: "descriptor_tables",
                    description: format!(
                        "proc {}: context-manager ref has desc {desc}",
                        pid.0
                    ),
                });
            }
            if proc.refs_by_node.get(&r.node) != Some(&ref_id) {
                violations.push(InvariantViolation {
                    invariant: "descriptor_tables",
                    description: format!(
                        "proc {}: by-node index disagrees for desc {desc}",
                        pid.0
                    ),
                });
            }
        }
        if proc.refs_by_desc.len() != proc.refs_by_node.len() {
            violations.push(InvariantViolation {
                invariant: "descriptor_tables",
                description: format!(
                    "proc {}: {} descriptors but {} by-node entries",
                    pid.0,
                    proc.refs_by_desc.len(),
                    proc.refs_by_node.len()
                ),
            });
        }
    }
    violations
}

/// Invariant 4: the async budget is exactly the initial budget minus the
/// footprint of live async buffers.
fn check_async_space(state: &CoreState) -> Vec<InvariantViolation> {
    let mut violations = Vec::new();
    for (pid, proc) in &state.procs {
        let Some(pool) = proc.pool.as_ref() else {
            continue;
        };
        let live: u64 = pool
            .buffers()
            .filter(|(_, b)| !b.free && b.async_transaction)
            .map(|(_, b)| b.effective_size() + BUFFER_HEADER_SIZE)
            .sum();
        let expected = pool.initial_async_space() - live;
        if pool.free_async_space() != expected {
            violations.push(InvariantViolation {
                invariant: "async_space",
                description: format!(
                    "proc {}: free_async_space {} but expected {expected}",
                    pid.0,
                    pool.free_async_space()
                ),
            });
        }
    }
    violations
}

/// Invariant 5: a pending owner acknowledgement keeps the matching belief
/// bit set (and, structurally, the node alive: it is still in the arena).
fn check_pending_refs(state: &CoreState) -> Vec<InvariantViolation> {
    let mut violations = Vec::new();
    for node in state.nodes.values() {
        if node.pending_strong_ref && !node.has_strong_ref {
            violations.push(InvariantViolation {
                invariant: "pending_refs",
                description: format!(
                    "node {}: pending_strong_ref without has_strong_ref",
                    node.debug_id
                ),
            });
        }
        if node.pending_weak_ref && !node.has_weak_ref {
            violations.push(InvariantViolation {
                invariant: "pending_refs",
                description: format!(
                    "node {}: pending_weak_ref without has_weak_ref",
                    node.debug_id
                ),
            });
        }
    }
    violations
}

fn walk_stack(
    state: &CoreState,
    pid: Pid,
    tid: Tid,
    seen: &mut alloc::collections::BTreeSet<TxId>,
    violations: &mut Vec<InvariantViolation>,
) {
    let Some(thread) = state.procs.get(&pid).and_then(|p| p.threads.get(&tid)) else {
        return;
    };
    let mut cursor = thread.transaction_stack;
    let mut steps = 0;
    while let Some(tx_id) = cursor {
        steps += 1;
        if steps > 10_000 {
            violations.push(InvariantViolation {
                invariant: "transaction_placement",
                description: format!("thread {}:{} stack does not terminate", pid.0, tid.0),
            });
            return;
        }
        let Some(tx) = state.transactions.get(&tx_id) else {
            violations.push(InvariantViolation {
                invariant: "transaction_placement",
                description: format!(
                    "thread {}:{} stack holds missing transaction",
                    pid.0, tid.0
                ),
            });
            return;
        };
        seen.insert(tx_id);
        if tx.to_proc == Some(pid) && tx.to_thread == Some(tid) {
            cursor = tx.to_parent;
        } else if tx.from == Some((pid, tid)) {
            cursor = tx.from_parent;
        } else {
            violations.push(InvariantViolation {
                invariant: "transaction_placement",
                description: format!(
                    "thread {}:{} stack holds foreign transaction {}",
                    pid.0, tid.0, tx.debug_id
                ),
            });
            return;
        }
    }
}

/// Invariant 6: every live transaction is reachable from a queue or a
/// thread stack, and every queued id resolves.
fn check_transaction_placement(state: &CoreState) -> Vec<InvariantViolation> {
    let mut violations = Vec::new();
    let mut seen = alloc::collections::BTreeSet::new();

    let note = |tx_id: TxId,
                where_: &str,
                seen: &mut alloc::collections::BTreeSet<TxId>,
                violations: &mut Vec<InvariantViolation>| {
        if state.transactions.contains_key(&tx_id) {
            seen.insert(tx_id);
        } else {
            violations.push(InvariantViolation {
                invariant: "transaction_placement",
                description: format!("{where_} queue holds missing transaction"),
            });
        }
    };

    for (pid, proc) in &state.procs {
        for work in &proc.todo {
            if let Work::Transaction(tx_id) = work {
                note(*tx_id, "process", &mut seen, &mut violations);
            }
        }
        for (tid, thread) in &proc.threads {
            for work in &thread.todo {
                if let Work::Transaction(tx_id) = work {
                    note(*tx_id, "thread", &mut seen, &mut violations);
                }
            }
            walk_stack(state, *pid, *tid, &mut seen, &mut violations);
        }
    }
    for node in state.nodes.values() {
        for work in &node.async_todo {
            if let Work::Transaction(tx_id) = work {
                note(*tx_id, "async", &mut seen, &mut violations);
            }
        }
    }

    for (tx_id, tx) in &state.transactions {
        if !seen.contains(tx_id) {
            violations.push(InvariantViolation {
                invariant: "transaction_placement",
                description: format!("transaction {} is unreachable", tx.debug_id),
            });
        }
    }
    violations
}

/// Invariant 7: `has_async_transaction` tracks the existence of a live
/// oneway for the node - queued on the node, queued for delivery, or being
/// processed (its buffer still allocated).
fn check_async_flags(state: &CoreState) -> Vec<InvariantViolation> {
    let mut violations = Vec::new();
    for (node_id, node) in &state.nodes {
        let allocated_async = node.owner.and_then(|pid| {
            let pool = state.procs.get(&pid)?.pool.as_ref()?;
            Some(
                pool.buffers()
                    .any(|(_, b)| !b.free && b.async_transaction && b.target_node == Some(*node_id)),
            )
        });
        if node.has_async_transaction {
            if !node.async_todo.is_empty() {
                continue;
            }
            if allocated_async != Some(true) {
                violations.push(InvariantViolation {
                    invariant: "async_flags",
                    description: format!(
                        "node {}: has_async_transaction with no live oneway",
                        node.debug_id
                    ),
                });
            }
        } else if !node.async_todo.is_empty() {
            violations.push(InvariantViolation {
                invariant: "async_flags",
                description: format!(
                    "node {}: async work queued without has_async_transaction",
                    node.debug_id
                ),
            });
        }
    }
    violations
}

/// Orphan bookkeeping: a node has no owner exactly when it sits on the
/// orphan list.
fn check_orphan_consistency(state: &CoreState) -> Vec<InvariantViolation> {
    let mut violations = Vec::new();
    for (node_id, node) in &state.nodes {
        let orphaned = state.orphan_nodes.contains(node_id);
        if node.owner.is_none() != orphaned {
            violations.push(InvariantViolation {
                invariant: "orphan_consistency",
                description: format!(
                    "node {}: owner {:?} but orphan-listed {orphaned}",
                    node.debug_id, node.owner
                ),
            });
        }
    }
    for node_id in &state.orphan_nodes {
        if !state.nodes.contains_key(node_id) {
            violations.push(InvariantViolation {
                invariant: "orphan_consistency",
                description: format!("orphan list holds missing node {node_id:?}"),
            });
        }
    }
    violations
}
