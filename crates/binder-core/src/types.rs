//! Core object-graph types.
//!
//! Everything here is plain data: arena records keyed by stable integer ids,
//! per the arena ownership rules in DESIGN.md. Behavior lives on
//! [`CoreState`](crate::state::CoreState) and the engine modules.

use alloc::collections::VecDeque;
use alloc::vec::Vec;
use serde::{Deserialize, Serialize};

// ============================================================================
// Identifiers
// ============================================================================

/// Process identifier (one opened endpoint).
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Pid(pub u32);

/// Host thread identifier, unique within a process.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Tid(pub u32);

/// Arena id of an exported service record.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct NodeId(pub u64);

/// Arena id of an imported reference record.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RefId(pub u64);

/// Arena id of an in-flight transaction.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TxId(pub u64);

/// Arena id of a death subscription record.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct DeathId(pub u64);

/// Arena id of a file capability object.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct FileId(pub u64);

// ============================================================================
// Work items
// ============================================================================

/// One entry on a process, thread, or per-node async work queue.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Work {
    /// Deliver a transaction or reply.
    Transaction(TxId),
    /// Tell the sender its last transaction was accepted.
    TransactionComplete,
    /// Resolve the owner-side refcount state of a node (may emit
    /// BR_INCREFS/BR_ACQUIRE/BR_RELEASE/BR_DECREFS, or nothing).
    Node(NodeId),
    /// Deliver or acknowledge a death subscription event.
    Death(DeathId),
}

// ============================================================================
// Nodes and references
// ============================================================================

/// Core-side record for one exported service.
#[derive(Debug)]
pub struct Node {
    pub id: NodeId,
    pub debug_id: u32,
    /// Home process; `None` once orphaned.
    pub owner: Option<Pid>,
    /// Service pointer in the owner's address space (0 for the context
    /// manager).
    pub ptr: u64,
    pub cookie: u64,
    /// Strong count contributed by references with strong > 0.
    pub internal_strong: u32,
    /// Strong count from in-flight transactions and the owner's acquire
    /// acknowledgement.
    pub local_strong: u32,
    /// Weak count from transient holds and the owner's increfs
    /// acknowledgement. Weak holds via references are implied by a non-empty
    /// `refs` list.
    pub local_weak: u32,
    pub has_strong_ref: bool,
    pub has_weak_ref: bool,
    pub pending_strong_ref: bool,
    pub pending_weak_ref: bool,
    pub has_async_transaction: bool,
    pub accept_fds: bool,
    /// Minimum nice value of owner threads handling this node's requests.
    pub min_priority: i32,
    /// Iteration-only backlist of references pointing here.
    pub refs: Vec<RefId>,
    /// Oneway transactions held back while one is already in flight.
    pub async_todo: VecDeque<Work>,
    /// Whether this node's lifecycle work item sits on an owner queue.
    pub work_queued: bool,
}

impl Node {
    /// Whether any strong count is outstanding.
    pub fn has_strong(&self) -> bool {
        self.internal_strong > 0 || self.local_strong > 0
    }

    /// Whether any weak count is outstanding (strong implies weak).
    pub fn has_weak(&self) -> bool {
        !self.refs.is_empty() || self.local_weak > 0 || self.has_strong()
    }
}

/// One process's imported handle to another process's node.
#[derive(Debug)]
pub struct Ref {
    pub id: RefId,
    pub debug_id: u32,
    /// Holding process.
    pub proc: Pid,
    pub node: NodeId,
    /// Descriptor, unique within the holding process; 0 is the context
    /// manager.
    pub desc: u32,
    pub strong: u32,
    pub weak: u32,
    pub death: Option<DeathId>,
}

// ============================================================================
// Death subscriptions
// ============================================================================

/// Position of a death subscription in its lifecycle.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DeathKind {
    /// The owner died; the subscriber has not acknowledged yet.
    DeadBinder,
    /// The owner died and the subscriber also asked to clear.
    DeadBinderAndClear,
    /// The subscription was cleared; the acknowledgement is pending delivery.
    ClearNotification,
}

/// A registered death subscription.
#[derive(Debug)]
pub struct DeathRecord {
    pub id: DeathId,
    /// Subscriber-supplied callback cookie.
    pub cookie: u64,
    pub kind: DeathKind,
    /// Whether the record currently sits on a work or delivered-death queue.
    pub queued: bool,
}

// ============================================================================
// Transactions
// ============================================================================

/// One in-flight request or reply.
#[derive(Debug)]
pub struct Transaction {
    pub id: TxId,
    pub debug_id: u32,
    /// Originating thread; `None` for oneway sends and replies, and cleared
    /// when the originator exits.
    pub from: Option<(Pid, Tid)>,
    pub sender_uid: u32,
    pub to_proc: Option<Pid>,
    pub to_thread: Option<Tid>,
    pub code: u32,
    pub flags: u32,
    /// Caller nice value at send time.
    pub priority: i32,
    /// Receiver nice value saved at dispatch, restored on reply.
    pub saved_priority: i32,
    pub need_reply: bool,
    /// Pool and header address of the payload buffer.
    pub buffer: Option<(Pid, u64)>,
    /// Transaction this caller was handling when it sent this one.
    pub from_parent: Option<TxId>,
    /// Transaction the receiving thread must resume after this one.
    pub to_parent: Option<TxId>,
}

impl Transaction {
    /// Whether this transaction was sent fire-and-forget.
    pub fn one_way(&self) -> bool {
        self.flags & binder_wire::TransactionFlags::ONE_WAY.bits() != 0
    }

    /// Whether replies may carry file descriptors.
    pub fn accepts_fds(&self) -> bool {
        self.flags & binder_wire::TransactionFlags::ACCEPT_FDS.bits() != 0
    }
}

// ============================================================================
// File capabilities
// ============================================================================

/// An opaque file capability that descriptors resolve to.
///
/// The count is the `fget`/`fput` analog: each descriptor-table slot and each
/// in-flight handoff holds one count.
#[derive(Debug)]
pub struct FileObject {
    pub id: FileId,
    pub count: u32,
}

// ============================================================================
// Looper state
// ============================================================================

bitflags::bitflags! {
    /// Per-thread read-loop state bitset.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct LooperState: u32 {
        /// Announced via BC_REGISTER_LOOPER (driver-requested thread).
        const REGISTERED = 0x01;
        /// Announced via BC_ENTER_LOOPER (application thread).
        const ENTERED = 0x02;
        /// Announced via BC_EXIT_LOOPER.
        const EXITED = 0x04;
        /// An illegal transition was observed.
        const INVALID = 0x08;
        /// Currently blocked in read.
        const WAITING = 0x10;
        /// Must pop back to user space before blocking again.
        const NEED_RETURN = 0x20;
    }
}

impl LooperState {
    /// Whether the thread takes part in the read loop.
    pub fn is_looper(&self) -> bool {
        self.intersects(LooperState::REGISTERED | LooperState::ENTERED)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_node_count_predicates() {
        let mut node = Node {
            id: NodeId(1),
            debug_id: 1,
            owner: Some(Pid(1)),
            ptr: 0xAAA,
            cookie: 0,
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
            async_todo: VecDeque::new(),
            work_queued: false,
        };
        assert!(!node.has_strong());
        assert!(!node.has_weak());

        node.local_weak = 1;
        assert!(node.has_weak());
        assert!(!node.has_strong());

        node.local_weak = 0;
        node.internal_strong = 1;
        // Strong implies weak.
        assert!(node.has_strong());
        assert!(node.has_weak());

        node.internal_strong = 0;
        node.refs.push(RefId(9));
        assert!(node.has_weak());
    }

    #[test]
    fn test_looper_state_predicates() {
        let mut state = LooperState::empty();
        assert!(!state.is_looper());
        state |= LooperState::NEED_RETURN;
        assert!(!state.is_looper());
        state |= LooperState::ENTERED;
        assert!(state.is_looper());

        let registered = LooperState::REGISTERED | LooperState::WAITING;
        assert!(registered.is_looper());
    }

    #[test]
    fn test_transaction_flag_accessors() {
        let tx = Transaction {
            id: TxId(1),
            debug_id: 1,
            from: None,
            sender_uid: 0,
            to_proc: None,
            to_thread: None,
            code: 0,
            flags: binder_wire::TransactionFlags::ONE_WAY.bits(),
            priority: 0,
            saved_priority: 0,
            need_reply: false,
            buffer: None,
            from_parent: None,
            to_parent: None,
        };
        assert!(tx.one_way());
        assert!(!tx.accepts_fds());
    }
}
