//! Death subscriptions: registration, clearing, and acknowledgement.
//!
//! Delivery on owner death lives in the release path; turning queued records
//! into BR_DEAD_BINDER / BR_CLEAR_DEATH_NOTIFICATION_DONE lives in the read
//! path.

use crate::stats::ObjKind;
use crate::state::CoreState;
use crate::types::{DeathId, DeathKind, DeathRecord, Pid, Tid, Work};

impl CoreState {
    /// Queue a death work item on the requesting thread if it is a looper,
    /// else on the process.
    pub(crate) fn enqueue_death_work(&mut self, pid: Pid, tid: Tid, death_id: DeathId) {
        if let Some(death) = self.deaths.get_mut(&death_id) {
            death.queued = true;
        }
        let is_looper = self
            .thread(pid, tid)
            .map(|t| t.looper.is_looper())
            .unwrap_or(false);
        if is_looper {
            self.enqueue_thread_work(pid, tid, Work::Death(death_id));
        } else {
            self.enqueue_proc_work(pid, Work::Death(death_id));
        }
    }

    /// BC_REQUEST_DEATH_NOTIFICATION.
    pub(crate) fn request_death_notification(
        &mut self,
        pid: Pid,
        tid: Tid,
        desc: u32,
        cookie: u64,
    ) {
        let Some(ref_id) = self.ref_by_desc(pid, desc) else {
            log::warn!(
                "binder: {}:{} request death notification, invalid ref {desc}",
                pid.0,
                tid.0
            );
            return;
        };
        if self.refs[&ref_id].death.is_some() {
            log::warn!(
                "binder: {}:{} death notification already set on ref desc {desc}",
                pid.0,
                tid.0
            );
            return;
        }
        let death_id = self.alloc_death_id();
        self.deaths.insert(
            death_id,
            DeathRecord {
                id: death_id,
                cookie,
                kind: DeathKind::DeadBinder,
                queued: false,
            },
        );
        self.stats.objects.created(ObjKind::Death);
        let node_id = {
            let r = self.refs.get_mut(&ref_id).expect("looked up");
            r.death = Some(death_id);
            r.node
        };
        // Subscribing to an already-orphaned service fires immediately.
        if self.nodes.get(&node_id).map(|n| n.owner.is_none()).unwrap_or(true) {
            self.enqueue_death_work(pid, tid, death_id);
        }
    }

    /// BC_CLEAR_DEATH_NOTIFICATION.
    pub(crate) fn clear_death_notification(&mut self, pid: Pid, tid: Tid, desc: u32, cookie: u64) {
        let Some(ref_id) = self.ref_by_desc(pid, desc) else {
            log::warn!(
                "binder: {}:{} clear death notification, invalid ref {desc}",
                pid.0,
                tid.0
            );
            return;
        };
        let Some(death_id) = self.refs[&ref_id].death else {
            log::warn!(
                "binder: {}:{} clear death notification not active on ref desc {desc}",
                pid.0,
                tid.0
            );
            return;
        };
        if self.deaths[&death_id].cookie != cookie {
            log::warn!(
                "binder: {}:{} clear death notification cookie mismatch",
                pid.0,
                tid.0
            );
            return;
        }
        self.refs.get_mut(&ref_id).expect("looked up").death = None;
        let death = self.deaths.get_mut(&death_id).expect("attached");
        if !death.queued {
            death.kind = DeathKind::ClearNotification;
            self.enqueue_death_work(pid, tid, death_id);
        } else {
            debug_assert_eq!(death.kind, DeathKind::DeadBinder);
            death.kind = DeathKind::DeadBinderAndClear;
        }
    }

    /// BC_DEAD_BINDER_DONE.
    pub(crate) fn dead_binder_done(&mut self, pid: Pid, tid: Tid, cookie: u64) {
        let delivered = self
            .procs
            .get(&pid)
            .map(|p| p.delivered_death.clone())
            .unwrap_or_default();
        let found = delivered
            .iter()
            .copied()
            .find(|id| self.deaths.get(id).map(|d| d.cookie == cookie).unwrap_or(false));
        let Some(death_id) = found else {
            log::warn!(
                "binder: {}:{} BC_DEAD_BINDER_DONE {cookie:#x} not found",
                pid.0,
                tid.0
            );
            return;
        };
        if let Some(proc) = self.procs.get_mut(&pid) {
            proc.delivered_death.retain(|id| *id != death_id);
        }
        let death = self.deaths.get_mut(&death_id).expect("found above");
        death.queued = false;
        if death.kind == DeathKind::DeadBinderAndClear {
            death.kind = DeathKind::ClearNotification;
            self.enqueue_death_work(pid, tid, death_id);
        }
    }
}
