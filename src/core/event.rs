//! The unit of transport: a fixed-capacity data buffer plus routing metadata.

use crate::constants::{
    host_byte_order, DATA_SHIFT, MODIFY, MODIFY_HEADER, PRIORITY_MASK, STATION_SELECT_INTS, SYSTEM,
};
use crate::errors::{Result, TransportError};

/// Stable index into the shared event pool.
pub type EventId = i32;

/// Two-class priority. Every list keeps all highs ahead of all lows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum Priority {
    Low = 0,
    High = 1,
}

impl Priority {
    pub fn from_i32(v: i32) -> Option<Self> {
        match v {
            0 => Some(Priority::Low),
            1 => Some(Priority::High),
            _ => None,
        }
    }

    #[inline(always)]
    pub fn as_i32(self) -> i32 {
        self as i32
    }
}

/// Producer's claim about the integrity of the payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum DataStatus {
    Ok = 0,
    Corrupt = 1,
    PossiblyCorrupt = 2,
}

impl DataStatus {
    pub fn from_i32(v: i32) -> Option<Self> {
        match v {
            0 => Some(DataStatus::Ok),
            1 => Some(DataStatus::Corrupt),
            2 => Some(DataStatus::PossiblyCorrupt),
            _ => None,
        }
    }

    #[inline(always)]
    pub fn as_i32(self) -> i32 {
        self as i32
    }
}

/// What the holder intends to change, declared at acquisition time.
///
/// The server uses this to decide what to read back on `put_events`: nothing,
/// the header, or header and payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Modify {
    None,
    HeaderOnly,
    HeaderAndData,
}

impl Modify {
    /// Decode the modify bits of a client mode word. Full modification wins
    /// when both bits are set.
    pub fn from_mode(mode: i32) -> Modify {
        if mode & MODIFY != 0 {
            Modify::HeaderAndData
        } else if mode & MODIFY_HEADER != 0 {
            Modify::HeaderOnly
        } else {
            Modify::None
        }
    }

    pub fn as_mode_bits(self) -> i32 {
        match self {
            Modify::None => 0,
            Modify::HeaderOnly => MODIFY_HEADER,
            Modify::HeaderAndData => MODIFY,
        }
    }

    #[inline(always)]
    pub fn wants_header(self) -> bool {
        !matches!(self, Modify::None)
    }

    #[inline(always)]
    pub fn wants_data(self) -> bool {
        matches!(self, Modify::HeaderAndData)
    }
}

/// Pack priority and data status into the single wire int.
#[inline(always)]
pub fn pack_pri_status(priority: Priority, status: DataStatus) -> i32 {
    priority.as_i32() | (status.as_i32() << DATA_SHIFT)
}

/// Unpack the wire int; out-of-range fields degrade to `Low`/`Ok`.
#[inline(always)]
pub fn unpack_pri_status(v: i32) -> (Priority, DataStatus) {
    let priority = Priority::from_i32(v & PRIORITY_MASK).unwrap_or(Priority::Low);
    let status = DataStatus::from_i32((v >> DATA_SHIFT) & 0x3).unwrap_or(DataStatus::Ok);
    (priority, status)
}

/// One event. Owned by exactly one holder at any moment: a list inside the
/// system (owner == SYSTEM) or an attachment (owner == its id).
///
/// The data buffer's capacity is fixed at pool creation; `length` tracks the
/// valid prefix. `group` is assigned at pool creation and never changes.
#[derive(Debug)]
pub struct Event {
    id: EventId,
    data: Vec<u8>,
    length: usize,
    priority: Priority,
    data_status: DataStatus,
    byte_order: i32,
    control: [i32; STATION_SELECT_INTS],
    group: i32,
    owner: i32,
    modify: Modify,
}

impl Event {
    /// Fresh pool event: empty, low priority, owned by the system.
    pub fn new(id: EventId, capacity: usize, group: i32) -> Event {
        Event {
            id,
            data: vec![0; capacity],
            length: 0,
            priority: Priority::Low,
            data_status: DataStatus::Ok,
            byte_order: host_byte_order(),
            control: [0; STATION_SELECT_INTS],
            group,
            owner: SYSTEM,
            modify: Modify::None,
        }
    }

    #[inline(always)]
    pub fn id(&self) -> EventId {
        self.id
    }

    #[inline(always)]
    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    #[inline(always)]
    pub fn length(&self) -> usize {
        self.length
    }

    /// Set the valid data length. Fails if it exceeds the fixed capacity.
    pub fn set_length(&mut self, length: usize) -> Result<()> {
        if length > self.data.len() {
            return Err(TransportError::General(format!(
                "event length {} exceeds capacity {}",
                length,
                self.data.len()
            )));
        }
        self.length = length;
        Ok(())
    }

    /// Valid bytes of the payload.
    #[inline(always)]
    pub fn payload(&self) -> &[u8] {
        &self.data[..self.length]
    }

    /// Whole buffer, for callers that fill then call [`set_length`].
    ///
    /// [`set_length`]: Event::set_length
    #[inline(always)]
    pub fn buffer_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    #[inline(always)]
    pub fn priority(&self) -> Priority {
        self.priority
    }

    pub fn set_priority(&mut self, priority: Priority) {
        self.priority = priority;
    }

    #[inline(always)]
    pub fn data_status(&self) -> DataStatus {
        self.data_status
    }

    pub fn set_data_status(&mut self, status: DataStatus) {
        self.data_status = status;
    }

    #[inline(always)]
    pub fn byte_order(&self) -> i32 {
        self.byte_order
    }

    pub fn set_byte_order(&mut self, byte_order: i32) {
        self.byte_order = byte_order;
    }

    #[inline(always)]
    pub fn control(&self) -> &[i32; STATION_SELECT_INTS] {
        &self.control
    }

    pub fn set_control(&mut self, control: [i32; STATION_SELECT_INTS]) {
        self.control = control;
    }

    #[inline(always)]
    pub fn group(&self) -> i32 {
        self.group
    }

    #[inline(always)]
    pub fn owner(&self) -> i32 {
        self.owner
    }

    pub fn set_owner(&mut self, owner: i32) {
        self.owner = owner;
    }

    #[inline(always)]
    pub fn modify(&self) -> Modify {
        self.modify
    }

    pub fn set_modify(&mut self, modify: Modify) {
        self.modify = modify;
    }

    /// Scrub everything but id, capacity and group, returning the event to
    /// its fresh-from-the-pool shape. Used when events are recycled.
    pub fn init(&mut self) {
        self.length = 0;
        self.priority = Priority::Low;
        self.data_status = DataStatus::Ok;
        self.byte_order = host_byte_order();
        self.control = [0; STATION_SELECT_INTS];
        self.owner = SYSTEM;
        self.modify = Modify::None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_length_capped_by_capacity() {
        let mut ev = Event::new(0, 16, 1);
        assert!(ev.set_length(16).is_ok());
        assert!(ev.set_length(17).is_err());
        assert_eq!(ev.length(), 16);
    }

    #[test]
    fn test_pri_status_round_trip() {
        let v = pack_pri_status(Priority::High, DataStatus::PossiblyCorrupt);
        let (p, s) = unpack_pri_status(v);
        assert_eq!(p, Priority::High);
        assert_eq!(s, DataStatus::PossiblyCorrupt);
    }

    #[test]
    fn test_modify_full_wins_over_header() {
        assert_eq!(Modify::from_mode(MODIFY | MODIFY_HEADER), Modify::HeaderAndData);
        assert_eq!(Modify::from_mode(MODIFY_HEADER), Modify::HeaderOnly);
        assert_eq!(Modify::from_mode(0), Modify::None);
    }

    #[test]
    fn test_init_scrubs_metadata_but_not_identity() {
        let mut ev = Event::new(7, 32, 3);
        ev.set_priority(Priority::High);
        ev.set_owner(12);
        ev.set_control([1; STATION_SELECT_INTS]);
        ev.set_length(8).unwrap();
        ev.init();
        assert_eq!(ev.id(), 7);
        assert_eq!(ev.group(), 3);
        assert_eq!(ev.capacity(), 32);
        assert_eq!(ev.priority(), Priority::Low);
        assert_eq!(ev.owner(), SYSTEM);
        assert_eq!(ev.length(), 0);
        assert_eq!(ev.control(), &[0; STATION_SELECT_INTS]);
    }
}
