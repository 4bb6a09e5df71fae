//! Wire protocol: big-endian, fixed-width, framed over TCP.
//!
//! Every request starts with a command int; every response starts with a
//! status int (negative = error code, non-negative = ok, doubling as a count
//! on the data plane). Strings travel as a length (including the NUL) sent
//! among the fixed fields, followed by NUL-terminated ASCII bytes.

use std::io::{self, Read, Write};

use zerocopy::byteorder::big_endian::{I32 as BeI32, I64 as BeI64, U32 as BeU32};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

use crate::constants::{OK, STATION_SELECT_INTS};
use crate::core::event::{pack_pri_status, Event};

/// First bytes of every connection.
pub const WIRE_MAGIC: u32 = 0x5259_4E43;

/// Protocol version; both ends must agree or the connection is torn down.
pub const WIRE_VERSION: i32 = 1;

/// Longest accepted string field (station names, hosts, predicate names).
pub const MAX_STRING_LEN: usize = 4096;

/// Request command codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum Command {
    Alive = 1,
    Close = 3,
    WakeAttachment = 5,
    WakeAll = 6,
    StationCreateAt = 10,
    StationRemove = 11,
    StationSetPosition = 12,
    StationGetPosition = 13,
    StationExists = 14,
    StationAttach = 15,
    StationDetach = 16,
    StationIsAttached = 17,
    EventsNewGroup = 21,
    EventsGet = 22,
    EventsPut = 23,
    EventsDump = 24,
    SysStations = 30,
    SysStationsMax = 31,
    SysAttachments = 32,
    SysAttachmentsMax = 33,
    SysProcesses = 34,
    SysProcessesMax = 35,
    SysTemps = 36,
    SysTempsMax = 37,
    SysHeartbeat = 38,
    SysPid = 39,
    SysData = 40,
    SysHistogram = 41,
}

impl Command {
    pub fn from_i32(v: i32) -> Option<Command> {
        match v {
            1 => Some(Command::Alive),
            3 => Some(Command::Close),
            5 => Some(Command::WakeAttachment),
            6 => Some(Command::WakeAll),
            10 => Some(Command::StationCreateAt),
            11 => Some(Command::StationRemove),
            12 => Some(Command::StationSetPosition),
            13 => Some(Command::StationGetPosition),
            14 => Some(Command::StationExists),
            15 => Some(Command::StationAttach),
            16 => Some(Command::StationDetach),
            17 => Some(Command::StationIsAttached),
            21 => Some(Command::EventsNewGroup),
            22 => Some(Command::EventsGet),
            23 => Some(Command::EventsPut),
            24 => Some(Command::EventsDump),
            30 => Some(Command::SysStations),
            31 => Some(Command::SysStationsMax),
            32 => Some(Command::SysAttachments),
            33 => Some(Command::SysAttachmentsMax),
            34 => Some(Command::SysProcesses),
            35 => Some(Command::SysProcessesMax),
            36 => Some(Command::SysTemps),
            37 => Some(Command::SysTempsMax),
            38 => Some(Command::SysHeartbeat),
            39 => Some(Command::SysPid),
            40 => Some(Command::SysData),
            41 => Some(Command::SysHistogram),
            _ => None,
        }
    }
}

/// Client's opening bytes: magic, protocol version, select-vector length.
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct HandshakeRequest {
    pub magic: BeU32,
    pub version: BeI32,
    pub select_ints: BeI32,
}

const _: () = {
    assert!(core::mem::size_of::<HandshakeRequest>() == 12);
};

impl HandshakeRequest {
    pub const SIZE: usize = 12;

    pub fn new() -> HandshakeRequest {
        HandshakeRequest {
            magic: BeU32::new(WIRE_MAGIC),
            version: BeI32::new(WIRE_VERSION),
            select_ints: BeI32::new(STATION_SELECT_INTS as i32),
        }
    }

    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut buf = [0u8; Self::SIZE];
        buf.copy_from_slice(self.as_bytes());
        buf
    }

    pub fn from_bytes(buf: &[u8; Self::SIZE]) -> Option<HandshakeRequest> {
        HandshakeRequest::read_from_bytes(buf).ok()
    }

    /// The three fatal mismatches of the handshake.
    pub fn validate(&self) -> bool {
        self.magic.get() == WIRE_MAGIC
            && self.version.get() == WIRE_VERSION
            && self.select_ints.get() == STATION_SELECT_INTS as i32
    }
}

impl Default for HandshakeRequest {
    fn default() -> Self {
        HandshakeRequest::new()
    }
}

/// Server's answer: status plus the pool geometry the client needs.
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct HandshakeReply {
    pub err: BeI32,
    pub num_events: BeI32,
    pub event_size: BeI64,
    pub version: BeI32,
    pub select_ints: BeI32,
}

const _: () = {
    assert!(core::mem::size_of::<HandshakeReply>() == 24);
};

impl HandshakeReply {
    pub const SIZE: usize = 24;

    pub fn ok(num_events: usize, event_size: usize) -> HandshakeReply {
        HandshakeReply {
            err: BeI32::new(OK),
            num_events: BeI32::new(num_events as i32),
            event_size: BeI64::new(event_size as i64),
            version: BeI32::new(WIRE_VERSION),
            select_ints: BeI32::new(STATION_SELECT_INTS as i32),
        }
    }

    pub fn error(code: i32) -> HandshakeReply {
        HandshakeReply {
            err: BeI32::new(code),
            num_events: BeI32::new(0),
            event_size: BeI64::new(0),
            version: BeI32::new(WIRE_VERSION),
            select_ints: BeI32::new(STATION_SELECT_INTS as i32),
        }
    }

    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut buf = [0u8; Self::SIZE];
        buf.copy_from_slice(self.as_bytes());
        buf
    }

    pub fn from_bytes(buf: &[u8; Self::SIZE]) -> Option<HandshakeReply> {
        HandshakeReply::read_from_bytes(buf).ok()
    }
}

/// Per-event header on the `EVS_GET` response: nine ints plus the control
/// vector, with the payload bytes following immediately.
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct WireEventHeader {
    pub length: BeI64,
    pub mem_size: BeI64,
    pub pri_and_status: BeI32,
    pub id: BeI32,
    pub reserved1: BeI32,
    pub byte_order: BeI32,
    pub reserved2: BeI32,
    pub control: [BeI32; STATION_SELECT_INTS],
}

const _: () = {
    assert!(core::mem::size_of::<WireEventHeader>() == 4 * (9 + STATION_SELECT_INTS));
};

impl WireEventHeader {
    pub const SIZE: usize = 4 * (9 + STATION_SELECT_INTS);

    pub fn from_event(ev: &Event) -> WireEventHeader {
        let mut control = [BeI32::new(0); STATION_SELECT_INTS];
        for (dst, src) in control.iter_mut().zip(ev.control()) {
            *dst = BeI32::new(*src);
        }
        WireEventHeader {
            length: BeI64::new(ev.length() as i64),
            mem_size: BeI64::new(ev.capacity() as i64),
            pri_and_status: BeI32::new(pack_pri_status(ev.priority(), ev.data_status())),
            id: BeI32::new(ev.id()),
            reserved1: BeI32::new(0),
            byte_order: BeI32::new(ev.byte_order()),
            reserved2: BeI32::new(0),
            control,
        }
    }

    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut buf = [0u8; Self::SIZE];
        buf.copy_from_slice(self.as_bytes());
        buf
    }

    pub fn from_bytes(buf: &[u8; Self::SIZE]) -> Option<WireEventHeader> {
        WireEventHeader::read_from_bytes(buf).ok()
    }

    pub fn control_words(&self) -> [i32; STATION_SELECT_INTS] {
        let mut out = [0; STATION_SELECT_INTS];
        for (dst, src) in out.iter_mut().zip(&self.control) {
            *dst = src.get();
        }
        out
    }
}

/// Per-event header on the `EVS_PUT` request. Only modified events travel;
/// the payload follows for events acquired with full modification.
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct WirePutHeader {
    pub id: BeI32,
    pub reserved1: BeI32,
    pub length: BeI64,
    pub pri_and_status: BeI32,
    pub byte_order: BeI32,
    pub reserved2: BeI32,
    pub control: [BeI32; STATION_SELECT_INTS],
}

const _: () = {
    assert!(core::mem::size_of::<WirePutHeader>() == 4 * (7 + STATION_SELECT_INTS));
};

impl WirePutHeader {
    pub const SIZE: usize = 4 * (7 + STATION_SELECT_INTS);

    pub fn from_event(ev: &Event) -> WirePutHeader {
        let mut control = [BeI32::new(0); STATION_SELECT_INTS];
        for (dst, src) in control.iter_mut().zip(ev.control()) {
            *dst = BeI32::new(*src);
        }
        WirePutHeader {
            id: BeI32::new(ev.id()),
            reserved1: BeI32::new(0),
            length: BeI64::new(ev.length() as i64),
            pri_and_status: BeI32::new(pack_pri_status(ev.priority(), ev.data_status())),
            byte_order: BeI32::new(ev.byte_order()),
            reserved2: BeI32::new(0),
            control,
        }
    }

    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut buf = [0u8; Self::SIZE];
        buf.copy_from_slice(self.as_bytes());
        buf
    }

    pub fn from_bytes(buf: &[u8; Self::SIZE]) -> Option<WirePutHeader> {
        WirePutHeader::read_from_bytes(buf).ok()
    }

    pub fn control_words(&self) -> [i32; STATION_SELECT_INTS] {
        let mut out = [0; STATION_SELECT_INTS];
        for (dst, src) in out.iter_mut().zip(&self.control) {
            *dst = src.get();
        }
        out
    }
}

// ---- scattered-int plumbing used by both ends -------------------------

pub fn read_i32<R: Read>(r: &mut R) -> io::Result<i32> {
    let mut buf = [0u8; 4];
    r.read_exact(&mut buf)?;
    Ok(i32::from_be_bytes(buf))
}

pub fn read_i64<R: Read>(r: &mut R) -> io::Result<i64> {
    let mut buf = [0u8; 8];
    r.read_exact(&mut buf)?;
    Ok(i64::from_be_bytes(buf))
}

pub fn write_i32<W: Write>(w: &mut W, v: i32) -> io::Result<()> {
    w.write_all(&v.to_be_bytes())
}

pub fn write_i64<W: Write>(w: &mut W, v: i64) -> io::Result<()> {
    w.write_all(&v.to_be_bytes())
}

/// Read `len` bytes of NUL-terminated ASCII; `len` includes the NUL, zero
/// means absent. Oversized lengths are a framing violation.
pub fn read_string<R: Read>(r: &mut R, len: i32) -> io::Result<Option<String>> {
    if len == 0 {
        return Ok(None);
    }
    if len < 0 || len as usize > MAX_STRING_LEN {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "string length out of range",
        ));
    }
    let mut buf = vec![0u8; len as usize];
    r.read_exact(&mut buf)?;
    while buf.last() == Some(&0) {
        buf.pop();
    }
    String::from_utf8(buf)
        .map(Some)
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "string is not valid utf-8"))
}

/// Write the bytes of a string plus its NUL. The length field travels
/// earlier, among the fixed ints; see [`string_wire_len`].
pub fn write_string<W: Write>(w: &mut W, s: &str) -> io::Result<()> {
    w.write_all(s.as_bytes())?;
    w.write_all(&[0])
}

/// Wire length of an optional string: bytes plus NUL, or zero when absent.
pub fn string_wire_len(s: Option<&str>) -> i32 {
    match s {
        Some(s) => s.len() as i32 + 1,
        None => 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::event::{DataStatus, Priority};

    #[test]
    fn test_header_sizes() {
        assert_eq!(WireEventHeader::SIZE, 60);
        assert_eq!(WirePutHeader::SIZE, 52);
        assert_eq!(HandshakeRequest::SIZE, 12);
        assert_eq!(HandshakeReply::SIZE, 24);
    }

    #[test]
    fn test_event_header_round_trip() {
        let mut ev = Event::new(42, 128, 2);
        ev.set_priority(Priority::High);
        ev.set_data_status(DataStatus::PossiblyCorrupt);
        ev.set_control([1, 2, 3, 4, 5, 6]);
        ev.set_length(100).unwrap();

        let header = WireEventHeader::from_event(&ev);
        let decoded = WireEventHeader::from_bytes(&header.to_bytes()).unwrap();
        assert_eq!(decoded.id.get(), 42);
        assert_eq!(decoded.length.get(), 100);
        assert_eq!(decoded.mem_size.get(), 128);
        assert_eq!(decoded.control_words(), [1, 2, 3, 4, 5, 6]);
        let (pri, status) = crate::core::event::unpack_pri_status(decoded.pri_and_status.get());
        assert_eq!(pri, Priority::High);
        assert_eq!(status, DataStatus::PossiblyCorrupt);
    }

    #[test]
    fn test_event_header_is_big_endian_on_the_wire() {
        let mut ev = Event::new(1, 16, 1);
        ev.set_length(2).unwrap();
        let bytes = WireEventHeader::from_event(&ev).to_bytes();
        // length is the first i64
        assert_eq!(&bytes[..8], &2i64.to_be_bytes());
        // id sits after length, mem_size and pri_and_status
        assert_eq!(&bytes[20..24], &1i32.to_be_bytes());
    }

    #[test]
    fn test_handshake_validation() {
        assert!(HandshakeRequest::new().validate());
        let mut bad = HandshakeRequest::new();
        bad.version = BeI32::new(WIRE_VERSION + 1);
        assert!(!bad.validate());
    }

    #[test]
    fn test_string_round_trip() {
        let mut buf = Vec::new();
        write_string(&mut buf, "GRAND_CENTRAL").unwrap();
        assert_eq!(buf.len(), 14);
        let s = read_string(&mut buf.as_slice(), 14).unwrap();
        assert_eq!(s.as_deref(), Some("GRAND_CENTRAL"));
        assert_eq!(read_string(&mut buf.as_slice(), 0).unwrap(), None);
        assert!(read_string(&mut buf.as_slice(), -4).is_err());
    }

    #[test]
    fn test_command_codes_round_trip() {
        for cmd in [
            Command::Alive,
            Command::Close,
            Command::StationCreateAt,
            Command::EventsNewGroup,
            Command::EventsGet,
            Command::EventsPut,
            Command::EventsDump,
            Command::SysData,
            Command::SysHistogram,
        ] {
            assert_eq!(Command::from_i32(cmd as i32), Some(cmd));
        }
        assert_eq!(Command::from_i32(99), None);
    }
}
