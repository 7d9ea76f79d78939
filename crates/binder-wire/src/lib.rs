//! Wire protocol for the binder IPC core.
//!
//! This crate is the single source of truth for everything that crosses the
//! endpoint boundary:
//!
//! - **Command codes** (`bc::*`) consumed from a process's write stream
//! - **Return codes** (`br::*`) produced into a process's read stream
//! - **Type tags** and flag words for inline objects
//! - The fixed layouts of `TransactionData` and `FlatObject` together with a
//!   cursor-based little-endian codec
//!
//! Codes carry the classic ioctl-style packing (direction, payload size,
//! class byte, ordinal) so a stream is self-describing: a reader that does
//! not understand an ordinal can still skip its payload.
//!
//! All multi-byte fields are little-endian. Pointers and sizes are 64-bit on
//! the wire regardless of the host.

#![no_std]

extern crate alloc;

use alloc::vec::Vec;
use serde::{Deserialize, Serialize};

/// Current protocol version, returned by the VERSION endpoint operation.
pub const PROTOCOL_VERSION: i32 = 7;

/// Word size used for payload and offset alignment.
pub const WORD_SIZE: u64 = 8;

// ============================================================================
// Code packing
// ============================================================================

const DIR_NONE: u32 = 0;
const DIR_WRITE: u32 = 1;
const DIR_READ: u32 = 2;

const fn pack_code(dir: u32, class: u8, nr: u8, size: u16) -> u32 {
    (dir << 30) | ((size as u32) << 16) | ((class as u32) << 8) | nr as u32
}

const fn io(class: u8, nr: u8) -> u32 {
    pack_code(DIR_NONE, class, nr, 0)
}

const fn iow(class: u8, nr: u8, size: u16) -> u32 {
    pack_code(DIR_WRITE, class, nr, size)
}

const fn ior(class: u8, nr: u8, size: u16) -> u32 {
    pack_code(DIR_READ, class, nr, size)
}

/// Ordinal of a packed code (index into per-ordinal statistics tables).
pub const fn code_nr(code: u32) -> u8 {
    (code & 0xff) as u8
}

/// Declared payload size of a packed code, in bytes.
pub const fn code_size(code: u32) -> usize {
    ((code >> 16) & 0x3fff) as usize
}

// ============================================================================
// Wire sizes
// ============================================================================

/// Encoded size of [`TransactionData`].
pub const TRANSACTION_DATA_SIZE: u16 = 64;
/// Encoded size of [`FlatObject`].
pub const FLAT_OBJECT_SIZE: u16 = 24;
/// Encoded size of a (service pointer, cookie) pair.
pub const PTR_COOKIE_SIZE: u16 = 16;
/// Encoded size of a (descriptor, cookie) pair.
pub const DESC_COOKIE_SIZE: u16 = 12;

// ============================================================================
// Command codes (write stream, class 'c')
// ============================================================================

/// Command codes consumed from the write stream.
pub mod bc {
    use super::{io, iow, DESC_COOKIE_SIZE, PTR_COOKIE_SIZE, TRANSACTION_DATA_SIZE};

    /// Start a transaction; payload is a `TransactionData`.
    pub const TRANSACTION: u32 = iow(b'c', 0, TRANSACTION_DATA_SIZE);
    /// Reply to the transaction on top of the calling thread's stack.
    pub const REPLY: u32 = iow(b'c', 1, TRANSACTION_DATA_SIZE);
    /// Release a received buffer; payload is its user-space data pointer.
    pub const FREE_BUFFER: u32 = iow(b'c', 3, 8);
    /// Increment a reference's weak count; payload is the descriptor.
    pub const INCREFS: u32 = iow(b'c', 4, 4);
    /// Increment a reference's strong count; payload is the descriptor.
    pub const ACQUIRE: u32 = iow(b'c', 5, 4);
    /// Decrement a reference's strong count; payload is the descriptor.
    pub const RELEASE: u32 = iow(b'c', 6, 4);
    /// Decrement a reference's weak count; payload is the descriptor.
    pub const DECREFS: u32 = iow(b'c', 7, 4);
    /// Acknowledge BR_INCREFS; payload is (service pointer, cookie).
    pub const INCREFS_DONE: u32 = iow(b'c', 8, PTR_COOKIE_SIZE);
    /// Acknowledge BR_ACQUIRE; payload is (service pointer, cookie).
    pub const ACQUIRE_DONE: u32 = iow(b'c', 9, PTR_COOKIE_SIZE);
    /// A thread spawned on the driver's request enters the read loop.
    pub const REGISTER_LOOPER: u32 = io(b'c', 11);
    /// An application thread enters the read loop.
    pub const ENTER_LOOPER: u32 = io(b'c', 12);
    /// The calling thread leaves the read loop.
    pub const EXIT_LOOPER: u32 = io(b'c', 13);
    /// Subscribe to the death of a referenced service; (descriptor, cookie).
    pub const REQUEST_DEATH_NOTIFICATION: u32 = iow(b'c', 14, DESC_COOKIE_SIZE);
    /// Cancel a death subscription; (descriptor, cookie).
    pub const CLEAR_DEATH_NOTIFICATION: u32 = iow(b'c', 15, DESC_COOKIE_SIZE);
    /// Acknowledge a delivered BR_DEAD_BINDER; payload is the cookie.
    pub const DEAD_BINDER_DONE: u32 = iow(b'c', 16, 8);
}

/// Human-readable name of a command code, for diagnostics.
pub fn bc_name(code: u32) -> &'static str {
    match code {
        bc::TRANSACTION => "BC_TRANSACTION",
        bc::REPLY => "BC_REPLY",
        bc::FREE_BUFFER => "BC_FREE_BUFFER",
        bc::INCREFS => "BC_INCREFS",
        bc::ACQUIRE => "BC_ACQUIRE",
        bc::RELEASE => "BC_RELEASE",
        bc::DECREFS => "BC_DECREFS",
        bc::INCREFS_DONE => "BC_INCREFS_DONE",
        bc::ACQUIRE_DONE => "BC_ACQUIRE_DONE",
        bc::REGISTER_LOOPER => "BC_REGISTER_LOOPER",
        bc::ENTER_LOOPER => "BC_ENTER_LOOPER",
        bc::EXIT_LOOPER => "BC_EXIT_LOOPER",
        bc::REQUEST_DEATH_NOTIFICATION => "BC_REQUEST_DEATH_NOTIFICATION",
        bc::CLEAR_DEATH_NOTIFICATION => "BC_CLEAR_DEATH_NOTIFICATION",
        bc::DEAD_BINDER_DONE => "BC_DEAD_BINDER_DONE",
        _ => "BC_???",
    }
}

// ============================================================================
// Return codes (read stream, class 'r')
// ============================================================================

/// Return codes produced into the read stream.
pub mod br {
    use super::{io, ior, TRANSACTION_DATA_SIZE};

    /// Driver-internal failure; payload is an error word.
    pub const ERROR: u32 = ior(b'r', 0, 4);
    /// No error. Never written to a stream; the cleared state of the
    /// per-thread return-error slots.
    pub const OK: u32 = io(b'r', 1);
    /// Incoming request; payload is a `TransactionData`.
    pub const TRANSACTION: u32 = ior(b'r', 2, TRANSACTION_DATA_SIZE);
    /// Incoming reply; payload is a `TransactionData`.
    pub const REPLY: u32 = ior(b'r', 3, TRANSACTION_DATA_SIZE);
    /// The target of the last transaction is gone.
    pub const DEAD_REPLY: u32 = io(b'r', 5);
    /// The last command-stream transaction was accepted for delivery.
    pub const TRANSACTION_COMPLETE: u32 = io(b'r', 6);
    /// Owner must take a weak hold; payload is (service pointer, cookie).
    pub const INCREFS: u32 = ior(b'r', 7, 16);
    /// Owner must take a strong hold; payload is (service pointer, cookie).
    pub const ACQUIRE: u32 = ior(b'r', 8, 16);
    /// Owner may drop its strong hold; payload is (service pointer, cookie).
    pub const RELEASE: u32 = ior(b'r', 9, 16);
    /// Owner may drop its weak hold; payload is (service pointer, cookie).
    pub const DECREFS: u32 = ior(b'r', 10, 16);
    /// Padding word opening every read.
    pub const NOOP: u32 = io(b'r', 12);
    /// The process should add a worker thread to its pool.
    pub const SPAWN_LOOPER: u32 = io(b'r', 13);
    /// A subscribed-to service died; payload is the cookie.
    pub const DEAD_BINDER: u32 = ior(b'r', 15, 8);
    /// A death subscription was cleared; payload is the cookie.
    pub const CLEAR_DEATH_NOTIFICATION_DONE: u32 = ior(b'r', 16, 8);
    /// The last command-stream transaction could not be delivered.
    pub const FAILED_REPLY: u32 = io(b'r', 17);
}

/// Human-readable name of a return code, for diagnostics.
pub fn br_name(code: u32) -> &'static str {
    match code {
        br::ERROR => "BR_ERROR",
        br::OK => "BR_OK",
        br::TRANSACTION => "BR_TRANSACTION",
        br::REPLY => "BR_REPLY",
        br::DEAD_REPLY => "BR_DEAD_REPLY",
        br::TRANSACTION_COMPLETE => "BR_TRANSACTION_COMPLETE",
        br::INCREFS => "BR_INCREFS",
        br::ACQUIRE => "BR_ACQUIRE",
        br::RELEASE => "BR_RELEASE",
        br::DECREFS => "BR_DECREFS",
        br::NOOP => "BR_NOOP",
        br::SPAWN_LOOPER => "BR_SPAWN_LOOPER",
        br::DEAD_BINDER => "BR_DEAD_BINDER",
        br::CLEAR_DEATH_NOTIFICATION_DONE => "BR_CLEAR_DEATH_NOTIFICATION_DONE",
        br::FAILED_REPLY => "BR_FAILED_REPLY",
        _ => "BR_???",
    }
}

// ============================================================================
// Inline object type tags
// ============================================================================

const fn pack_chars(c1: u8, c2: u8, c3: u8, c4: u8) -> u32 {
    ((c1 as u32) << 24) | ((c2 as u32) << 16) | ((c3 as u32) << 8) | c4 as u32
}

const TYPE_LARGE: u8 = 0x85;

/// Type tags for inline objects embedded in transaction payloads.
pub mod obj {
    use super::{pack_chars, TYPE_LARGE};

    /// Strong reference to a service local to the sender.
    pub const BINDER: u32 = pack_chars(b's', b'b', b'*', TYPE_LARGE);
    /// Weak reference to a service local to the sender.
    pub const WEAK_BINDER: u32 = pack_chars(b'w', b'b', b'*', TYPE_LARGE);
    /// Strong reference held through a descriptor.
    pub const HANDLE: u32 = pack_chars(b's', b'h', b'*', TYPE_LARGE);
    /// Weak reference held through a descriptor.
    pub const WEAK_HANDLE: u32 = pack_chars(b'w', b'h', b'*', TYPE_LARGE);
    /// File capability.
    pub const FD: u32 = pack_chars(b'f', b'd', b'*', TYPE_LARGE);
}

bitflags::bitflags! {
    /// Flags carried by a transaction.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct TransactionFlags: u32 {
        /// One-way call: asynchronous, no reply.
        const ONE_WAY = 0x01;
        /// Contents are the component's root object.
        const ROOT_OBJECT = 0x04;
        /// Contents are a 32-bit status code.
        const STATUS_CODE = 0x08;
        /// Allow replies carrying file descriptors.
        const ACCEPT_FDS = 0x10;
    }
}

bitflags::bitflags! {
    /// Flags carried by a flat object describing a local service.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct ObjectFlags: u32 {
        /// Low byte: minimum scheduling priority (nice) of handler threads.
        const PRIORITY_MASK = 0xff;
        /// The service accepts transactions that carry file descriptors.
        const ACCEPTS_FDS = 0x100;
    }
}

// ============================================================================
// Wire structures
// ============================================================================

/// One transaction or reply as it appears on the wire.
///
/// `target` is a descriptor on the command side and a service pointer on the
/// return side; `data_ptr`/`offsets_ptr` point into the sender's memory on
/// the command side and into the receiver's mapped region on the return side.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionData {
    pub target: u64,
    pub cookie: u64,
    pub code: u32,
    pub flags: u32,
    pub sender_pid: u32,
    pub sender_uid: u32,
    pub data_size: u64,
    pub offsets_size: u64,
    pub data_ptr: u64,
    pub offsets_ptr: u64,
}

impl TransactionData {
    /// Flag accessor.
    pub fn one_way(&self) -> bool {
        self.flags & TransactionFlags::ONE_WAY.bits() != 0
    }

    /// Flag accessor.
    pub fn accepts_fds(&self) -> bool {
        self.flags & TransactionFlags::ACCEPT_FDS.bits() != 0
    }

    /// Append the 64-byte encoding to `out`.
    pub fn encode(&self, out: &mut Vec<u8>) {
        put_u64(out, self.target);
        put_u64(out, self.cookie);
        put_u32(out, self.code);
        put_u32(out, self.flags);
        put_u32(out, self.sender_pid);
        put_u32(out, self.sender_uid);
        put_u64(out, self.data_size);
        put_u64(out, self.offsets_size);
        put_u64(out, self.data_ptr);
        put_u64(out, self.offsets_ptr);
    }

    /// Decode from `data` at `cursor`, advancing it.
    pub fn decode(data: &[u8], cursor: &mut usize) -> Result<Self, WireError> {
        Ok(Self {
            target: get_u64(data, cursor)?,
            cookie: get_u64(data, cursor)?,
            code: get_u32(data, cursor)?,
            flags: get_u32(data, cursor)?,
            sender_pid: get_u32(data, cursor)?,
            sender_uid: get_u32(data, cursor)?,
            data_size: get_u64(data, cursor)?,
            offsets_size: get_u64(data, cursor)?,
            data_ptr: get_u64(data, cursor)?,
            offsets_ptr: get_u64(data, cursor)?,
        })
    }
}

/// One inline object inside a transaction payload.
///
/// `handle` holds a service pointer for `BINDER`/`WEAK_BINDER`, a descriptor
/// for `HANDLE`/`WEAK_HANDLE`, and a file descriptor for `FD`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlatObject {
    pub obj_type: u32,
    pub flags: u32,
    pub handle: u64,
    pub cookie: u64,
}

impl FlatObject {
    /// Minimum scheduling priority encoded in the flag word.
    pub fn min_priority(&self) -> i32 {
        (self.flags & ObjectFlags::PRIORITY_MASK.bits()) as i8 as i32
    }

    /// Whether the described service accepts file descriptors.
    pub fn accepts_fds(&self) -> bool {
        self.flags & ObjectFlags::ACCEPTS_FDS.bits() != 0
    }

    /// Append the 24-byte encoding to `out`.
    pub fn encode(&self, out: &mut Vec<u8>) {
        put_u32(out, self.obj_type);
        put_u32(out, self.flags);
        put_u64(out, self.handle);
        put_u64(out, self.cookie);
    }

    /// Encode into a fixed 24-byte array.
    pub fn to_bytes(&self) -> [u8; FLAT_OBJECT_SIZE as usize] {
        let mut out = Vec::with_capacity(FLAT_OBJECT_SIZE as usize);
        self.encode(&mut out);
        let mut bytes = [0u8; FLAT_OBJECT_SIZE as usize];
        bytes.copy_from_slice(&out);
        bytes
    }

    /// Decode from `data` at `cursor`, advancing it.
    pub fn decode(data: &[u8], cursor: &mut usize) -> Result<Self, WireError> {
        Ok(Self {
            obj_type: get_u32(data, cursor)?,
            flags: get_u32(data, cursor)?,
            handle: get_u64(data, cursor)?,
            cookie: get_u64(data, cursor)?,
        })
    }
}

// ============================================================================
// Cursor codec
// ============================================================================

/// Codec failure: the stream ended inside a value.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WireError {
    /// Fewer bytes were available than the value requires.
    Truncated,
}

/// Decode a `u32` at `cursor`, advancing it.
pub fn get_u32(data: &[u8], cursor: &mut usize) -> Result<u32, WireError> {
    let end = cursor.checked_add(4).ok_or(WireError::Truncated)?;
    if end > data.len() {
        return Err(WireError::Truncated);
    }
    let mut bytes = [0u8; 4];
    bytes.copy_from_slice(&data[*cursor..end]);
    *cursor = end;
    Ok(u32::from_le_bytes(bytes))
}

/// Decode a `u64` at `cursor`, advancing it.
pub fn get_u64(data: &[u8], cursor: &mut usize) -> Result<u64, WireError> {
    let end = cursor.checked_add(8).ok_or(WireError::Truncated)?;
    if end > data.len() {
        return Err(WireError::Truncated);
    }
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&data[*cursor..end]);
    *cursor = end;
    Ok(u64::from_le_bytes(bytes))
}

/// Append a `u32` to `out`.
pub fn put_u32(out: &mut Vec<u8>, value: u32) {
    out.extend_from_slice(&value.to_le_bytes());
}

/// Append a `u64` to `out`.
pub fn put_u64(out: &mut Vec<u8>, value: u64) {
    out.extend_from_slice(&value.to_le_bytes());
}

/// Round `value` up to the protocol word size.
pub const fn align_to_word(value: u64) -> u64 {
    (value + WORD_SIZE - 1) & !(WORD_SIZE - 1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::vec;

    #[test]
    fn test_code_packing_matches_classic_layout() {
        // _IO('r', 12)
        assert_eq!(br::NOOP, (b'r' as u32) << 8 | 12);
        // _IOW('c', 0, 64-byte struct)
        assert_eq!(bc::TRANSACTION, (1 << 30) | (64 << 16) | ((b'c' as u32) << 8));
        // _IOR('r', 2, 64-byte struct)
        assert_eq!(br::TRANSACTION, (2 << 30) | (64 << 16) | ((b'r' as u32) << 8) | 2);
    }

    #[test]
    fn test_code_nr_and_size() {
        assert_eq!(code_nr(bc::ACQUIRE), 5);
        assert_eq!(code_size(bc::ACQUIRE), 4);
        assert_eq!(code_nr(br::FAILED_REPLY), 17);
        assert_eq!(code_size(br::FAILED_REPLY), 0);
        assert_eq!(code_size(br::TRANSACTION), TRANSACTION_DATA_SIZE as usize);
    }

    #[test]
    fn test_type_tags_are_packed_chars() {
        assert_eq!(obj::BINDER, 0x73622a85);
        assert_eq!(obj::WEAK_BINDER, 0x77622a85);
        assert_eq!(obj::HANDLE, 0x73682a85);
        assert_eq!(obj::WEAK_HANDLE, 0x77682a85);
        assert_eq!(obj::FD, 0x66642a85);
    }

    #[test]
    fn test_transaction_data_codec() {
        let tr = TransactionData {
            target: 5,
            cookie: 0xC0FFEE,
            code: 1,
            flags: TransactionFlags::ONE_WAY.bits() | TransactionFlags::ACCEPT_FDS.bits(),
            sender_pid: 42,
            sender_uid: 1000,
            data_size: 128,
            offsets_size: 16,
            data_ptr: 0x7000_0000,
            offsets_ptr: 0x7000_0080,
        };

        let mut out = Vec::new();
        tr.encode(&mut out);
        assert_eq!(out.len(), TRANSACTION_DATA_SIZE as usize);

        let mut cursor = 0;
        let back = TransactionData::decode(&out, &mut cursor).unwrap();
        assert_eq!(back, tr);
        assert_eq!(cursor, out.len());
        assert!(back.one_way());
        assert!(back.accepts_fds());
    }

    #[test]
    fn test_flat_object_codec_and_flags() {
        let fp = FlatObject {
            obj_type: obj::BINDER,
            flags: 10 | ObjectFlags::ACCEPTS_FDS.bits(),
            handle: 0xAAA,
            cookie: 0xBBB,
        };

        let mut out = Vec::new();
        fp.encode(&mut out);
        assert_eq!(out.len(), FLAT_OBJECT_SIZE as usize);

        let mut cursor = 0;
        let back = FlatObject::decode(&out, &mut cursor).unwrap();
        assert_eq!(back, fp);
        assert_eq!(back.min_priority(), 10);
        assert!(back.accepts_fds());
    }

    #[test]
    fn test_min_priority_sign_extends() {
        // Nice values are signed; 0xF6 in the low byte is -10.
        let fp = FlatObject {
            obj_type: obj::BINDER,
            flags: 0xF6,
            handle: 0,
            cookie: 0,
        };
        assert_eq!(fp.min_priority(), -10);
    }

    #[test]
    fn test_decode_truncated() {
        let data = vec![0u8; 3];
        let mut cursor = 0;
        assert_eq!(get_u32(&data, &mut cursor), Err(WireError::Truncated));

        let mut cursor = 0;
        assert!(TransactionData::decode(&[0u8; 63], &mut cursor).is_err());
    }

    #[test]
    fn test_align_to_word() {
        assert_eq!(align_to_word(0), 0);
        assert_eq!(align_to_word(1), 8);
        assert_eq!(align_to_word(8), 8);
        assert_eq!(align_to_word(9), 16);
    }
}
