//! Deferred-work dispatcher.
//!
//! Flush and release must not run in the caller that triggered them; they
//! are queued as `(process, work bits)` and drained by a single worker
//! thread that takes the main lock per item, never across items.

use std::collections::VecDeque;

use binder_core::Pid;

/// Release the process's file capability table.
pub const WORK_PUT_FILES: u8 = 0x01;
/// Force every thread of the process back to user space.
pub const WORK_FLUSH: u8 = 0x02;
/// Tear the whole endpoint down.
pub const WORK_RELEASE: u8 = 0x04;

/// Pending deferred work, one merged entry per process.
#[derive(Debug, Default)]
pub struct DeferredQueue {
    items: VecDeque<(Pid, u8)>,
    /// The worker is mid-item (used by idle waiters).
    pub busy: bool,
    pub shutdown: bool,
}

impl DeferredQueue {
    /// Add work for `pid`, merging with an already queued entry.
    pub fn push(&mut self, pid: Pid, work: u8) {
        if let Some(entry) = self.items.iter_mut().find(|(p, _)| *p == pid) {
            entry.1 |= work;
        } else {
            self.items.push_back((pid, work));
        }
    }

    pub fn pop(&mut self) -> Option<(Pid, u8)> {
        self.items.pop_front()
    }

    pub fn is_idle(&self) -> bool {
        self.items.is_empty() && !self.busy
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_push_merges_per_process() {
        let mut queue = DeferredQueue::default();
        queue.push(Pid(1), WORK_FLUSH);
        queue.push(Pid(2), WORK_RELEASE);
        queue.push(Pid(1), WORK_PUT_FILES);

        assert_eq!(queue.pop(), Some((Pid(1), WORK_FLUSH | WORK_PUT_FILES)));
        assert_eq!(queue.pop(), Some((Pid(2), WORK_RELEASE)));
        assert_eq!(queue.pop(), None);
    }
}
