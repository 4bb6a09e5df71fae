//! System-wide constants: sentinels, mode bits, masks, defaults.
//! Wire command numbers live in [`crate::network::protocol`].

/// Name of the mandatory first station holding the free event pool.
pub const GRAND_CENTRAL: &str = "GRAND_CENTRAL";

/// Station id of GRAND_CENTRAL. Always position 0 in the ring.
pub const GRAND_CENTRAL_ID: i32 = 0;

/// Length of every event's control vector and every station's select vector.
/// Fixed for the process lifetime; both ends of the wire must agree.
pub const STATION_SELECT_INTS: usize = 6;

/// Owner sentinel for events held by no attachment (free pool or a list).
pub const SYSTEM: i32 = -1;

/// Position sentinel: append at the end of the ring or parallel group.
pub const END: i32 = -1;

/// Parallel-position sentinel: start a brand-new group at the given position.
pub const NEW_HEAD: i32 = -2;

// Wait-mode bits. The low two bits of a client's mode word select the wait
// behavior; the modify bits above them are or'd in by `get_events` callers.
pub const SLEEP: i32 = 0;
pub const TIMED: i32 = 1;
pub const ASYNC: i32 = 2;
pub const WAIT_MASK: i32 = 0x3;

/// Caller will rewrite header and data; both travel back on `put_events`.
pub const MODIFY: i32 = 4;
/// Caller will rewrite the header only; payload never crosses the wire on put.
pub const MODIFY_HEADER: i32 = 8;

// Event priorities. Two classes only; every list is a high block then a low block.
pub const LOW: i32 = 0;
pub const HIGH: i32 = 1;
pub const PRIORITY_MASK: i32 = 0x1;

// Data-status values, packed above the priority bit in `pri_and_status`.
pub const DATA_OK: i32 = 0;
pub const DATA_CORRUPT: i32 = 1;
pub const DATA_POSSIBLY_CORRUPT: i32 = 2;
pub const DATA_SHIFT: i32 = 8;
pub const DATA_MASK: i32 = 0x300;

// Byte-order tags carried in event headers. The tag reads as 0x04030201 when
// the producer and observer agree on endianness.
pub const ENDIAN_BIG: i32 = 0x0403_0201;
pub const ENDIAN_LITTLE: i32 = 0x0102_0304;

/// Byte-order tag for events produced on this host.
pub const fn host_byte_order() -> i32 {
    if cfg!(target_endian = "big") {
        ENDIAN_BIG
    } else {
        ENDIAN_LITTLE
    }
}

// Defaults mirroring a typical data-acquisition deployment.
pub const DEFAULT_NUM_EVENTS: usize = 3000;
pub const DEFAULT_EVENT_SIZE: usize = 128;
pub const DEFAULT_SERVER_PORT: u16 = 11111;
pub const DEFAULT_MAX_STATIONS: usize = 256;
pub const DEFAULT_MAX_ATTACHMENTS: usize = 110;

/// Socket read timeout both ends assume; reads interrupted by it are retried.
pub const READ_TIMEOUT_MS: u64 = 2_000;

/// Slice used when the server converts a remote `sleep` wait into repeated
/// timed waits so the worker thread can notice shutdown between parks.
pub const SLEEP_POLL_US: u64 = 500_000;

// Stable wire codes for results. Negative is an error; non-negative is ok
// (data-plane responses reuse the ok slot for a count).
pub const OK: i32 = 0;
pub const ERROR: i32 = -1;
pub const ERROR_TOO_MANY: i32 = -2;
pub const ERROR_EXISTS: i32 = -3;
pub const ERROR_WAKE_UP: i32 = -4;
pub const ERROR_TIMEOUT: i32 = -5;
pub const ERROR_EMPTY: i32 = -6;
pub const ERROR_BUSY: i32 = -7;
pub const ERROR_DEAD: i32 = -8;
