//! Pure state machine for the binder IPC core.
//!
//! This crate contains the **host-free** core of the IPC subsystem: the
//! object graph (processes, nodes, references, threads, transactions, death
//! subscriptions), the buffer-pool allocator backing single-copy transfers,
//! the transaction routing and dispatch state machine, the asymmetric
//! refcount protocol, and the death-notification lifecycle.
//!
//! # Design Principles
//!
//! 1. **No host dependency**: no locks, no sleeping, no clocks; caller
//!    identity (pid/tid/uid) is an argument, caller memory is a trait.
//! 2. **Deterministic**: the same operation sequence always produces the
//!    same state, which is what the scenario and stress tests rely on.
//! 3. **Arena ownership**: objects live in id-keyed tables; cross-process
//!    links are ids, never aliased pointers, so the cyclic Node↔Reference
//!    graph needs no reference counting of its own.
//!
//! The runtime wrapper (`binder-endpoint`) adds the single lock, blocking
//! reads, and deferred teardown; the wire protocol lives in `binder-wire`.
//!
//! # Module Organization
//!
//! - `types` - ids and arena records
//! - `pool` - per-process buffer pool (best-fit, split/coalesce, lazy pages)
//! - `proc` - per-process tables and thread records
//! - `state` - `CoreState`: global tables plus the endpoint operations
//! - `refs` - reference engine and the owner handshake
//! - `transaction` - transaction engine
//! - `write` / `read` - command-stream and return-stream interpreters
//! - `death` - death-subscription lifecycle
//! - `release` - thread exit, flush, deferred endpoint release
//! - `invariants` - runtime-checkable invariant set
//! - `stats` - diagnostic counters and the recent-transaction ring

#![no_std]

extern crate alloc;

mod death;
pub mod invariants;
pub mod mem;
pub mod pool;
pub mod proc;
mod read;
mod refs;
pub mod release;
pub mod state;
pub mod stats;
mod transaction;
pub mod types;
mod write;

pub use invariants::{assert_invariants, check_all_invariants, InvariantViolation};
pub use mem::{NoMemory, SparseMemory, UserMemory};
pub use pool::{Buffer, Pool, PoolError, BUFFER_HEADER_SIZE, MAX_MAPPING_SIZE, PAGE_SIZE};
pub use proc::{Proc, Thread};
pub use read::{try_read, ReadOutcome, WriteReadError, WriteReadOutcome};
pub use release::ReleaseStats;
pub use state::{CoreState, MappingInfo, OpError};
pub use stats::{ObjKind, Stats};
pub use types::{
    DeathId, DeathKind, FileId, LooperState, Node, NodeId, Pid, Ref, RefId, Tid, Transaction,
    TxId, Work,
};
pub use write::{thread_write, StreamError};
