//! A reader/writer identity bound to one station for its lifetime.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use crate::core::station::StationId;

/// Monotonically assigned attachment id.
pub type AttachmentId = i32;

/// One attachment. The waiting/wake_up flags implement the cooperative
/// wakeup protocol: they are only read and written while the owning input
/// list's monitor is held, so plain relaxed atomics are enough.
#[derive(Debug)]
pub struct Attachment {
    id: AttachmentId,
    station_id: StationId,
    host: String,
    pid: i32,
    waiting: AtomicBool,
    wake_up: AtomicBool,
    usable: AtomicBool,
    events_put: AtomicU64,
    events_get: AtomicU64,
    events_dump: AtomicU64,
    events_make: AtomicU64,
}

impl Attachment {
    pub fn new(id: AttachmentId, station_id: StationId, host: String, pid: i32) -> Attachment {
        Attachment {
            id,
            station_id,
            host,
            pid,
            waiting: AtomicBool::new(false),
            wake_up: AtomicBool::new(false),
            usable: AtomicBool::new(true),
            events_put: AtomicU64::new(0),
            events_get: AtomicU64::new(0),
            events_dump: AtomicU64::new(0),
            events_make: AtomicU64::new(0),
        }
    }

    #[inline(always)]
    pub fn id(&self) -> AttachmentId {
        self.id
    }

    #[inline(always)]
    pub fn station_id(&self) -> StationId {
        self.station_id
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn pid(&self) -> i32 {
        self.pid
    }

    #[inline(always)]
    pub fn is_waiting(&self) -> bool {
        self.waiting.load(Ordering::Relaxed)
    }

    #[inline(always)]
    pub(crate) fn set_waiting(&self, waiting: bool) {
        self.waiting.store(waiting, Ordering::Relaxed);
    }

    /// Arm the one-shot wakeup. The parked `get` observes and clears it.
    #[inline(always)]
    pub(crate) fn signal_wake_up(&self) {
        self.wake_up.store(true, Ordering::Relaxed);
    }

    /// Read and clear the one-shot wakeup flag.
    #[inline(always)]
    pub(crate) fn take_wake_up(&self) -> bool {
        self.wake_up.swap(false, Ordering::Relaxed)
    }

    #[inline(always)]
    pub fn usable(&self) -> bool {
        self.usable.load(Ordering::Acquire)
    }

    pub(crate) fn invalidate(&self) {
        self.usable.store(false, Ordering::Release);
    }

    // Statistics, surfaced in the SYS_DATA snapshot.

    pub(crate) fn add_put(&self, n: u64) {
        self.events_put.fetch_add(n, Ordering::Relaxed);
    }

    pub(crate) fn add_get(&self, n: u64) {
        self.events_get.fetch_add(n, Ordering::Relaxed);
    }

    pub(crate) fn add_dump(&self, n: u64) {
        self.events_dump.fetch_add(n, Ordering::Relaxed);
    }

    pub(crate) fn add_make(&self, n: u64) {
        self.events_make.fetch_add(n, Ordering::Relaxed);
    }

    pub fn events_put(&self) -> u64 {
        self.events_put.load(Ordering::Relaxed)
    }

    pub fn events_get(&self) -> u64 {
        self.events_get.load(Ordering::Relaxed)
    }

    pub fn events_dump(&self) -> u64 {
        self.events_dump.load(Ordering::Relaxed)
    }

    pub fn events_make(&self) -> u64 {
        self.events_make.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wake_up_is_one_shot() {
        let att = Attachment::new(1, 2, "localhost".into(), -1);
        assert!(!att.take_wake_up());
        att.signal_wake_up();
        assert!(att.take_wake_up());
        assert!(!att.take_wake_up());
    }

    #[test]
    fn test_invalidate() {
        let att = Attachment::new(1, 2, "localhost".into(), -1);
        assert!(att.usable());
        att.invalidate();
        assert!(!att.usable());
    }
}
