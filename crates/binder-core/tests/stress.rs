//! Randomized command-sequence stress test.
//!
//! A fixed-seed driver plays a server process and two clients against each
//! other: random transactions (sync, oneway, with and without inline object
//! exports), refcount traffic, death subscriptions, buffer frees, and reads,
//! with the full invariant set re-checked after every step.

use binder_core::{check_all_invariants, CoreState, NoMemory, Pid, SparseMemory, Tid, WriteReadError};
use binder_wire::{
    bc, br, code_size, get_u32, put_u32, put_u64, FlatObject, TransactionData, TransactionFlags,
};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

const SERVER: Pid = Pid(1);
const CLIENTS: [Pid; 2] = [Pid(2), Pid(3)];
const SERVER_TID: Tid = Tid(10);

fn client_tid(pid: Pid) -> Tid {
    Tid(pid.0 * 10)
}

fn parse_codes(bytes: &[u8]) -> Vec<(u32, Vec<u8>)> {
    let mut cursor = 0;
    let mut out = Vec::new();
    while cursor < bytes.len() {
        let code = get_u32(bytes, &mut cursor).expect("code word");
        let size = code_size(code);
        let payload = bytes[cursor..cursor + size].to_vec();
        cursor += size;
        out.push((code, payload));
    }
    out
}

fn assert_ok(state: &CoreState, step: usize) {
    let violations = check_all_invariants(state);
    assert!(violations.is_empty(), "step {step}: {violations:?}");
}

struct Driver {
    state: CoreState,
    rng: StdRng,
    /// Received-but-unfreed payload pointers, per process.
    pending_buffers: Vec<(Pid, u64)>,
    /// Whether the server currently owes a reply.
    server_replying: bool,
}

impl Driver {
    fn new(seed: u64) -> Self {
        let mut state = CoreState::new();
        state.open(SERVER, 1000, 0, -20).unwrap();
        state.mmap(SERVER, 128 * 1024, false).unwrap();
        state.set_context_mgr(SERVER).unwrap();
        for pid in CLIENTS {
            state.open(pid, 2000 + pid.0, 5, -20).unwrap();
            state.mmap(pid, 64 * 1024, false).unwrap();
        }
        Driver {
            state,
            rng: StdRng::seed_from_u64(seed),
            pending_buffers: Vec::new(),
            server_replying: false,
        }
    }

    fn client_awaiting_reply(&self, pid: Pid) -> bool {
        self.state
            .thread(pid, client_tid(pid))
            .map(|t| t.transaction_stack.is_some())
            .unwrap_or(false)
    }

    fn send_from_client(&mut self, pid: Pid) {
        let oneway = self.rng.gen_bool(0.4);
        if !oneway && self.client_awaiting_reply(pid) {
            return;
        }
        let data_len = self.rng.gen_range(0..1200u64);
        let with_object = self.rng.gen_bool(0.2) && data_len >= 24;

        let mut data = vec![0u8; data_len as usize];
        self.rng.fill(&mut data[..]);
        let mut offsets = Vec::new();
        if with_object {
            let ptr = 0xE000 + self.rng.gen_range(0..4u64) * 8;
            let mut object = Vec::new();
            FlatObject {
                obj_type: binder_wire::obj::BINDER,
                flags: 0,
                handle: ptr,
                cookie: ptr + 1,
            }
            .encode(&mut object);
            data[..24].copy_from_slice(&object);
            put_u64(&mut offsets, 0);
        }
        let mem = SparseMemory::new()
            .with(0x10_0000, data)
            .with(0x20_0000, offsets.clone());

        let mut write = Vec::new();
        put_u32(&mut write, bc::TRANSACTION);
        TransactionData {
            target: 0,
            cookie: 0,
            code: self.rng.gen_range(0..100),
            flags: if oneway {
                TransactionFlags::ONE_WAY.bits()
            } else {
                0
            },
            sender_pid: 0,
            sender_uid: 0,
            data_size: data_len,
            offsets_size: offsets.len() as u64,
            data_ptr: 0x10_0000,
            offsets_ptr: 0x20_0000,
        }
        .encode(&mut write);

        // Reads drain the completion or the stashed failure.
        let _ = self
            .state
            .write_read(pid, client_tid(pid), &mem, &write, 4096);
    }

    fn client_ref_traffic(&mut self, pid: Pid) {
        let cmd = match self.rng.gen_range(0..4) {
            0 => bc::INCREFS,
            1 => bc::ACQUIRE,
            2 => bc::RELEASE,
            _ => bc::DECREFS,
        };
        let mut write = Vec::new();
        put_u32(&mut write, cmd);
        put_u32(&mut write, 0);
        let _ = self
            .state
            .write_read(pid, client_tid(pid), &NoMemory, &write, 0);
    }

    fn death_traffic(&mut self, pid: Pid) {
        let cookie = 0xD000 + pid.0 as u64;
        let cmd = if self.rng.gen_bool(0.5) {
            bc::REQUEST_DEATH_NOTIFICATION
        } else {
            bc::CLEAR_DEATH_NOTIFICATION
        };
        let mut write = Vec::new();
        put_u32(&mut write, cmd);
        put_u32(&mut write, 0);
        put_u64(&mut write, cookie);
        let _ = self
            .state
            .write_read(pid, client_tid(pid), &NoMemory, &write, 0);
    }

    fn pump(&mut self, pid: Pid, tid: Tid) {
        let outcome = match self.state.write_read(pid, tid, &NoMemory, &[], 8192) {
            Ok(outcome) => outcome,
            Err(WriteReadError::WouldBlock { .. }) => return,
            Err(err) => panic!("read failed: {err:?}"),
        };
        for (code, payload) in parse_codes(&outcome.read) {
            if code == br::TRANSACTION || code == br::REPLY {
                let mut cursor = 0;
                let tr = TransactionData::decode(&payload, &mut cursor).expect("payload");
                self.pending_buffers.push((pid, tr.data_ptr));
                if code == br::TRANSACTION && !tr.one_way() && pid == SERVER {
                    self.server_replying = true;
                }
            }
        }
    }

    fn server_reply(&mut self) {
        if !self.server_replying {
            return;
        }
        let mut write = Vec::new();
        put_u32(&mut write, bc::REPLY);
        TransactionData::default().encode(&mut write);
        let _ = self
            .state
            .write_read(SERVER, SERVER_TID, &NoMemory, &write, 4096);
        self.server_replying = false;
    }

    fn free_pending(&mut self) {
        if self.pending_buffers.is_empty() {
            return;
        }
        let index = self.rng.gen_range(0..self.pending_buffers.len());
        let (pid, ptr) = self.pending_buffers.swap_remove(index);
        let tid = if pid == SERVER {
            SERVER_TID
        } else {
            client_tid(pid)
        };
        let mut write = Vec::new();
        put_u32(&mut write, bc::FREE_BUFFER);
        put_u64(&mut write, ptr);
        let _ = self.state.write_read(pid, tid, &NoMemory, &write, 0);
    }
}

#[test]
fn test_random_traffic_preserves_invariants() {
    let mut driver = Driver::new(0x5EED);

    for step in 0..500 {
        let client = CLIENTS[driver.rng.gen_range(0..CLIENTS.len())];
        match driver.rng.gen_range(0..100) {
            0..=34 => driver.send_from_client(client),
            35..=49 => driver.client_ref_traffic(client),
            50..=69 => {
                driver.pump(SERVER, SERVER_TID);
                driver.server_reply();
            }
            70..=81 => driver.free_pending(),
            82..=91 => driver.pump(client, client_tid(client)),
            92..=95 => driver.death_traffic(client),
            _ => driver.pump(SERVER, SERVER_TID),
        }
        assert_ok(&driver.state, step);
    }

    // Teardown: clients first, then the server; everything drains.
    for pid in CLIENTS {
        driver.state.mark_dead(pid);
        driver.state.deferred_release(pid);
        assert_ok(&driver.state, 1000 + pid.0 as usize);
    }
    driver.state.mark_dead(SERVER);
    driver.state.deferred_release(SERVER);
    assert_ok(&driver.state, 2000);

    assert!(driver.state.procs.is_empty());
    assert!(driver.state.nodes.is_empty());
    assert!(driver.state.refs.is_empty());
    assert!(driver.state.transactions.is_empty());
    assert!(driver.state.deaths.is_empty());
    assert!(driver.state.orphan_nodes.is_empty());
}
