//! Endpoint-level integration: blocking reads across real threads, flush,
//! release, and file-descriptor passing.

use std::thread;
use std::time::Duration;

use binder_core::Tid;
use binder_endpoint::{Driver, DriverError, NoMemory, SparseMemory};
use binder_wire::{
    bc, br, code_size, get_u32, put_u32, put_u64, FlatObject, ObjectFlags, TransactionData,
    TransactionFlags,
};

const T_MAIN: Tid = Tid(1);
const T_PEER: Tid = Tid(2);

fn parse_returns(bytes: &[u8]) -> Vec<(u32, Vec<u8>)> {
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

fn codes(bytes: &[u8]) -> Vec<u32> {
    parse_returns(bytes).iter().map(|(c, _)| *c).collect()
}

fn transaction_payload(bytes: &[u8], code: u32) -> TransactionData {
    let returns = parse_returns(bytes);
    let (_, payload) = returns
        .into_iter()
        .find(|(c, _)| *c == code)
        .expect("expected transaction return");
    let mut cursor = 0;
    TransactionData::decode(&payload, &mut cursor).expect("payload")
}

fn bc_transaction(target: u64, code: u32, flags: u32, data: (u64, u64), offs: (u64, u64)) -> Vec<u8> {
    let mut out = Vec::new();
    put_u32(&mut out, bc::TRANSACTION);
    TransactionData {
        target,
        cookie: 0,
        code,
        flags,
        sender_pid: 0,
        sender_uid: 0,
        data_size: data.1,
        offsets_size: offs.1,
        data_ptr: data.0,
        offsets_ptr: offs.0,
    }
    .encode(&mut out);
    out
}

#[test]
fn test_version_and_mmap_rules() {
    let driver = Driver::new();
    let endpoint = driver.open(1000);
    assert_eq!(endpoint.version(), 7);

    assert_eq!(
        endpoint.mmap(128 * 1024, true),
        Err(DriverError::PermissionDenied)
    );
    let info = endpoint.mmap(128 * 1024, false).unwrap();
    assert_eq!(info.len, 128 * 1024);
    assert_eq!(
        endpoint.mmap(128 * 1024, false),
        Err(DriverError::AlreadyMapped)
    );
}

#[test]
fn test_fresh_thread_returns_then_blocks() {
    let driver = Driver::new();
    let endpoint = driver.open(1000);
    endpoint.mmap(64 * 1024, false).unwrap();

    // First contact pops straight back to user space.
    let outcome = endpoint
        .write_read(T_MAIN, &NoMemory, &[], 4096, true)
        .unwrap();
    assert_eq!(codes(&outcome.read), vec![br::NOOP]);

    // After that, an idle non-blocking read reports try-again.
    assert_eq!(
        endpoint.write_read(T_MAIN, &NoMemory, &[], 4096, true),
        Err(DriverError::WouldBlock)
    );
}

#[test]
fn test_blocking_read_wakes_on_incoming_transaction() {
    let driver = Driver::new();
    let server = driver.open(1000);
    server.mmap(128 * 1024, false).unwrap();
    server.set_context_mgr().unwrap();
    let client = driver.open(2000);
    client.mmap(64 * 1024, false).unwrap();

    // Drain the registration handshake so the next read really blocks.
    let outcome = server
        .write_read(T_MAIN, &NoMemory, &[], 4096, true)
        .unwrap();
    assert_eq!(codes(&outcome.read), vec![br::NOOP, br::INCREFS, br::ACQUIRE]);

    let sender = thread::spawn(move || {
        thread::sleep(Duration::from_millis(50));
        let write = bc_transaction(0, 42, 0, (0, 0), (0, 0));
        client
            .write_read(T_PEER, &NoMemory, &write, 4096, false)
            .unwrap();
        client
    });

    // Parks on the condvar until the client's write lands.
    let outcome = server
        .write_read(T_MAIN, &NoMemory, &[], 4096, false)
        .unwrap();
    let tr = transaction_payload(&outcome.read, br::TRANSACTION);
    assert_eq!(tr.code, 42);

    let _client = sender.join().unwrap();
    assert!(driver.check_invariants().is_empty());
}

#[test]
fn test_flush_forces_blocked_reader_out() {
    let driver = Driver::new();
    let endpoint = std::sync::Arc::new(driver.open(1000));
    endpoint.mmap(64 * 1024, false).unwrap();
    // Clear the fresh-thread prompt return.
    endpoint
        .write_read(T_MAIN, &NoMemory, &[], 4096, true)
        .unwrap();

    let reader_endpoint = std::sync::Arc::clone(&endpoint);
    let reader = thread::spawn(move || {
        let outcome = reader_endpoint
            .write_read(T_MAIN, &NoMemory, &[], 4096, false)
            .unwrap();
        codes(&outcome.read)
    });

    thread::sleep(Duration::from_millis(50));
    // A flush makes the parked reader pop back with just the padding word.
    endpoint.flush();
    driver.wait_deferred_idle();
    assert_eq!(reader.join().unwrap(), vec![br::NOOP]);
}

#[test]
fn test_close_fires_death_notification() {
    let driver = Driver::new();
    let server = driver.open(1000);
    server.mmap(128 * 1024, false).unwrap();
    server.set_context_mgr().unwrap();
    let client = driver.open(2000);
    client.mmap(64 * 1024, false).unwrap();

    let mut write = Vec::new();
    put_u32(&mut write, bc::ACQUIRE);
    put_u32(&mut write, 0);
    put_u32(&mut write, bc::REQUEST_DEATH_NOTIFICATION);
    put_u32(&mut write, 0);
    put_u64(&mut write, 0xC1);
    client
        .write_read(T_MAIN, &NoMemory, &write, 4096, true)
        .unwrap();

    server.close();
    driver.wait_deferred_idle();

    let outcome = client
        .write_read(T_MAIN, &NoMemory, &[], 4096, false)
        .unwrap();
    let returns = parse_returns(&outcome.read);
    assert_eq!(returns[1].0, br::DEAD_BINDER);
    let mut cursor = 0;
    assert_eq!(
        binder_wire::get_u64(&returns[1].1, &mut cursor).unwrap(),
        0xC1
    );
    assert!(driver.check_invariants().is_empty());
}

#[test]
fn test_fd_passing_installs_target_descriptor() {
    let driver = Driver::new();
    let server = driver.open(1000);
    server.mmap(128 * 1024, false).unwrap();
    server.set_context_mgr().unwrap();
    let client = driver.open(2000);
    client.mmap(64 * 1024, false).unwrap();

    // Client exports a service that accepts descriptors.
    let mut payload = Vec::new();
    FlatObject {
        obj_type: binder_wire::obj::BINDER,
        flags: ObjectFlags::ACCEPTS_FDS.bits(),
        handle: 0x111,
        cookie: 0x112,
    }
    .encode(&mut payload);
    let mut offsets = Vec::new();
    put_u64(&mut offsets, 0);
    let mem = SparseMemory::new()
        .with(0x5000, payload)
        .with(0x6000, offsets);
    let write = bc_transaction(
        0,
        1,
        TransactionFlags::ONE_WAY.bits(),
        (0x5000, 24),
        (0x6000, 8),
    );
    client
        .write_read(T_MAIN, &mem, &write, 4096, true)
        .unwrap();

    // Server learns the handle from the delivered payload.
    let outcome = server
        .write_read(T_MAIN, &NoMemory, &[], 4096, false)
        .unwrap();
    let tr = transaction_payload(&outcome.read, br::TRANSACTION);
    let buffer = server.buffer_bytes(tr.data_ptr).unwrap();
    let mut cursor = 0;
    let received = FlatObject::decode(&buffer, &mut cursor).unwrap();
    assert_eq!(received.obj_type, binder_wire::obj::HANDLE);
    let service_desc = received.handle;

    // Server passes one of its files to the client's service.
    let fd = server.create_file().unwrap();
    let mut payload = Vec::new();
    FlatObject {
        obj_type: binder_wire::obj::FD,
        flags: 0,
        handle: fd as u64,
        cookie: 0,
    }
    .encode(&mut payload);
    let mut offsets = Vec::new();
    put_u64(&mut offsets, 0);
    let mem = SparseMemory::new()
        .with(0x7000, payload)
        .with(0x8000, offsets);
    let write = bc_transaction(
        service_desc,
        2,
        TransactionFlags::ONE_WAY.bits(),
        (0x7000, 24),
        (0x8000, 8),
    );
    server
        .write_read(T_MAIN, &mem, &write, 4096, true)
        .unwrap();

    // Client receives a fresh descriptor of its own.
    let outcome = client
        .write_read(T_MAIN, &NoMemory, &[], 4096, false)
        .unwrap();
    let tr = transaction_payload(&outcome.read, br::TRANSACTION);
    let buffer = client.buffer_bytes(tr.data_ptr).unwrap();
    let mut cursor = 0;
    let received = FlatObject::decode(&buffer, &mut cursor).unwrap();
    assert_eq!(received.obj_type, binder_wire::obj::FD);
    let client_fd = received.handle as u32;
    assert!(client.fds().contains(&client_fd));
    // The source keeps its own descriptor: dup, not move.
    assert!(server.fds().contains(&fd));
    assert!(driver.check_invariants().is_empty());
}
