//! A station's input or output queue: priority-preserving order, bounded
//! blocking reads, cooperative wakeup.
//!
//! Invariant: every list is a run of high-priority events followed by a run
//! of low-priority events, FIFO within each run. Output lists additionally
//! track `last_high`, the length of the leading high block.
//!
//! The list is a monitor: one mutex guards the state, one condvar parks
//! readers and the station's conductor. A reader that parks registers in
//! `waiting_count`; wakeups set flags and notify, and the parked reader
//! observes the flag and leaves with a `WakeUp` failure. The last waiter to
//! leave clears `wake_all` so later reads do not fail spuriously.

use std::collections::VecDeque;
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use crate::constants::{ASYNC, SLEEP, TIMED, WAIT_MASK};
use crate::core::attachment::Attachment;
use crate::core::event::{Event, Priority};
use crate::errors::{Result, TransportError};

/// How a read behaves when the list is empty.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitMode {
    /// Park until events arrive or a wakeup is signaled.
    Sleep,
    /// Park up to the given duration, then fail with `Timeout`.
    Timed(Duration),
    /// Never park; fail with `Empty` when nothing is there.
    Async,
}

impl WaitMode {
    /// Decode the wire form: low mode bits plus a seconds/nanoseconds pair.
    pub fn from_wire(mode: i32, sec: i32, nsec: i32) -> Result<WaitMode> {
        match mode & WAIT_MASK {
            SLEEP => Ok(WaitMode::Sleep),
            ASYNC => Ok(WaitMode::Async),
            TIMED => {
                if sec < 0 || nsec < 0 {
                    return Err(TransportError::General("bad timeout value".into()));
                }
                Ok(WaitMode::Timed(Duration::new(sec as u64, nsec as u32)))
            }
            _ => Err(TransportError::General("bad wait mode".into())),
        }
    }

    /// Encode as (mode, sec, nsec) for the wire.
    pub fn as_wire(&self) -> (i32, i32, i32) {
        match self {
            WaitMode::Sleep => (SLEEP, 0, 0),
            WaitMode::Async => (ASYNC, 0, 0),
            WaitMode::Timed(d) => (TIMED, d.as_secs() as i32, d.subsec_nanos() as i32),
        }
    }
}

/// Counters and gauges surfaced in the system snapshot.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ListStats {
    pub events_in: u64,
    pub events_out: u64,
    pub events_try: u64,
    pub length: usize,
    pub last_high: usize,
}

#[derive(Debug, Default)]
struct ListInner {
    events: VecDeque<Event>,
    events_in: u64,
    events_out: u64,
    events_try: u64,
    wake_all: bool,
    waiting_count: u32,
    last_high: usize,
    closed: bool,
}

impl ListInner {
    fn leading_high_count(&self) -> usize {
        self.events
            .iter()
            .take_while(|ev| ev.priority() == Priority::High)
            .count()
    }
}

/// One direction of a station's queue.
#[derive(Debug, Default)]
pub struct EventList {
    inner: Mutex<ListInner>,
    available: Condvar,
}

impl EventList {
    pub fn new() -> EventList {
        EventList::default()
    }

    fn lock(&self) -> MutexGuard<'_, ListInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Append events at the tail; the caller asserts they are all low
    /// priority. Used by conductors recycling events and for pool seeding.
    pub fn put_low(&self, new_events: Vec<Event>) {
        if new_events.is_empty() {
            return;
        }
        let mut inner = self.lock();
        let n = new_events.len() as u64;
        inner.events.extend(new_events);
        inner.events_in += n;
        if inner.waiting_count > 0 {
            self.available.notify_all();
        }
    }

    /// Entry point for user dumps into GRAND_CENTRAL's input list.
    pub fn put_in_gc(&self, new_events: Vec<Event>) {
        self.put_low(new_events);
    }

    /// Conductor-driven insertion into an input list. `new_events` must be
    /// pre-sorted with all highs first; new highs extend the list's leading
    /// high block, lows go to the tail.
    pub fn put_all(&self, new_events: Vec<Event>) {
        if new_events.is_empty() {
            return;
        }
        let mut inner = self.lock();
        let n = new_events.len() as u64;
        if inner.events.is_empty() || new_events[0].priority() == Priority::Low {
            inner.events.extend(new_events);
        } else {
            let split = new_events
                .iter()
                .take_while(|ev| ev.priority() == Priority::High)
                .count();
            let mut highs = new_events;
            let lows = highs.split_off(split);
            let k = inner.leading_high_count();
            for (j, ev) in highs.into_iter().enumerate() {
                inner.events.insert(k + j, ev);
            }
            inner.events.extend(lows);
        }
        inner.events_in += n;
        if inner.waiting_count > 0 {
            self.available.notify_all();
        }
    }

    /// User-driven insertion into an output list. Priorities may be mixed;
    /// each high lands right after the existing high block (tracked by
    /// `last_high`), each low at the tail. Wakes a single waiter.
    pub fn put(&self, new_events: Vec<Event>) {
        if new_events.is_empty() {
            return;
        }
        let mut inner = self.lock();
        let n = new_events.len() as u64;
        if inner.events.is_empty() {
            inner.last_high = 0;
        }
        for ev in new_events {
            match ev.priority() {
                Priority::Low => inner.events.push_back(ev),
                Priority::High => {
                    let idx = inner.last_high;
                    inner.events.insert(idx, ev);
                    inner.last_high += 1;
                }
            }
        }
        inner.events_in += n;
        self.available.notify_one();
    }

    /// Restore path: place events *before* their peers of equal priority.
    /// Highs go to the very front, lows right behind the high block. Does not
    /// count toward `events_in` — the events were already counted when they
    /// first entered the list.
    pub fn put_reverse(&self, new_events: Vec<Event>) {
        if new_events.is_empty() {
            return;
        }
        let mut inner = self.lock();
        if inner.events.is_empty() {
            inner.last_high = 0;
        } else {
            // input lists do not maintain last_high; recompute from the head
            inner.last_high = inner.leading_high_count();
        }
        for ev in new_events {
            match ev.priority() {
                Priority::Low => {
                    let idx = inner.last_high;
                    inner.events.insert(idx, ev);
                }
                Priority::High => {
                    inner.events.insert(0, ev);
                    inner.last_high += 1;
                }
            }
        }
        self.available.notify_one();
    }

    /// Move the entire list out. Conductor-only on the happy path.
    pub fn drain_all(&self) -> Vec<Event> {
        let mut inner = self.lock();
        let n = inner.events.len() as u64;
        inner.events_out += n;
        inner.events.drain(..).collect()
    }

    /// Conductor's blocking drain: park until the list is non-empty, then
    /// take everything. Returns `None` once the list is closed.
    pub(crate) fn wait_drain(&self) -> Option<Vec<Event>> {
        let mut inner = self.lock();
        while inner.events.is_empty() {
            if inner.closed {
                return None;
            }
            inner = self
                .available
                .wait(inner)
                .unwrap_or_else(PoisonError::into_inner);
        }
        let n = inner.events.len() as u64;
        inner.events_out += n;
        Some(inner.events.drain(..).collect())
    }

    /// One park cycle. Registers the attachment as waiting, waits (bounded if
    /// a budget is given), and re-checks the wakeup flags first thing after —
    /// a pending wakeup beats any events that arrived while parked.
    fn park<'a>(
        &self,
        inner: MutexGuard<'a, ListInner>,
        att: &Attachment,
        total: Option<Duration>,
        elapsed: &mut Duration,
    ) -> Result<MutexGuard<'a, ListInner>> {
        let mut inner = inner;
        if inner.closed {
            return Err(TransportError::Dead);
        }
        let remaining = match total {
            None => None,
            Some(total) => {
                let rem = total.saturating_sub(*elapsed);
                if rem.is_zero() {
                    return Err(TransportError::Timeout);
                }
                Some(rem)
            }
        };
        inner.waiting_count += 1;
        att.set_waiting(true);
        let begin = Instant::now();
        let mut inner = match remaining {
            None => self
                .available
                .wait(inner)
                .unwrap_or_else(PoisonError::into_inner),
            Some(rem) => {
                let (guard, _) = self
                    .available
                    .wait_timeout(inner, rem)
                    .unwrap_or_else(PoisonError::into_inner);
                guard
            }
        };
        *elapsed += begin.elapsed();
        if att.take_wake_up() || inner.wake_all {
            att.set_waiting(false);
            inner.waiting_count -= 1;
            // last waiter out clears the broadcast flag
            if inner.waiting_count == 0 {
                inner.wake_all = false;
            }
            return Err(TransportError::WakeUp(att.id()));
        }
        att.set_waiting(false);
        inner.waiting_count -= 1;
        Ok(inner)
    }

    /// Take up to `quantity` events from the head.
    ///
    /// Empty-list behavior is governed by `mode`; see [`WaitMode`]. Events
    /// come back strictly in list order, so the high-before-low invariant
    /// makes this a deterministic priority scheduler.
    pub fn get(&self, att: &Attachment, mode: WaitMode, quantity: usize) -> Result<Vec<Event>> {
        if quantity == 0 {
            return Ok(Vec::new());
        }
        let mut inner = self.lock();
        if inner.events.is_empty() {
            let total = match mode {
                WaitMode::Async => return Err(TransportError::Empty),
                WaitMode::Sleep => None,
                WaitMode::Timed(d) => Some(d),
            };
            let mut elapsed = Duration::ZERO;
            while inner.events.is_empty() {
                inner = self.park(inner, att, total, &mut elapsed)?;
            }
        }
        let n = quantity.min(inner.events.len());
        let taken: Vec<Event> = inner.events.drain(..n).collect();
        inner.events_out += n as u64;
        Ok(taken)
    }

    /// Like [`get`], but takes only events of the given group, preserving
    /// priority order among them. A blocking read whose scan comes up empty
    /// re-parks and rescans; an async read fails `Empty` whether the list is
    /// empty or merely holds other groups' events.
    ///
    /// [`get`]: EventList::get
    pub fn get_by_group(
        &self,
        att: &Attachment,
        mode: WaitMode,
        quantity: usize,
        group: i32,
    ) -> Result<Vec<Event>> {
        if quantity == 0 {
            return Ok(Vec::new());
        }
        let total = match mode {
            WaitMode::Timed(d) => Some(d),
            _ => None,
        };
        let mut elapsed = Duration::ZERO;
        let mut inner = self.lock();
        loop {
            if inner.events.is_empty() {
                if mode == WaitMode::Async {
                    return Err(TransportError::Empty);
                }
                while inner.events.is_empty() {
                    inner = self.park(inner, att, total, &mut elapsed)?;
                }
            }
            let want = quantity.min(inner.events.len());
            let mut taken: Vec<Event> = Vec::new();
            let mut i = 0;
            while i < inner.events.len() && taken.len() < want {
                if inner.events[i].group() == group {
                    if let Some(ev) = inner.events.remove(i) {
                        taken.push(ev);
                    }
                } else {
                    i += 1;
                }
            }
            if !taken.is_empty() {
                inner.events_out += taken.len() as u64;
                return Ok(taken);
            }
            if mode == WaitMode::Async {
                return Err(TransportError::Empty);
            }
            inner = self.park(inner, att, total, &mut elapsed)?;
        }
    }

    /// Wake one parked attachment. No-op unless it is actually waiting here.
    pub fn wake_up(&self, att: &Attachment) {
        let _guard = self.lock();
        if !att.is_waiting() {
            return;
        }
        att.signal_wake_up();
        self.available.notify_all();
    }

    /// Wake every parked attachment. No-op when nobody is waiting, so the
    /// flag cannot leak into a later read.
    pub fn wake_up_all(&self) {
        let mut inner = self.lock();
        if inner.waiting_count < 1 {
            return;
        }
        inner.wake_all = true;
        self.available.notify_all();
    }

    /// Shut the list down: blocked conductors return `None`, parked readers
    /// fail with `Dead` on their next park.
    pub(crate) fn close(&self) {
        let mut inner = self.lock();
        inner.closed = true;
        self.available.notify_all();
    }

    /// Count one selection attempt and return the pre-increment value, which
    /// is what the prescale test looks at.
    pub(crate) fn tick_try(&self) -> u64 {
        let mut inner = self.lock();
        let t = inner.events_try;
        inner.events_try += 1;
        t
    }

    /// Count a batch of attempts at once; used by group distribution, where
    /// every event is admitted and prescale never applies.
    pub(crate) fn bump_try(&self, n: u64) {
        self.lock().events_try += n;
    }

    pub fn len(&self) -> usize {
        self.lock().events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().events.is_empty()
    }

    pub fn stats(&self) -> ListStats {
        let inner = self.lock();
        ListStats {
            events_in: inner.events_in,
            events_out: inner.events_out,
            events_try: inner.events_try,
            length: inner.events.len(),
            last_high: inner.last_high,
        }
    }

    /// Snapshot of the priority sequence, head first. Diagnostics and tests.
    pub fn priorities(&self) -> Vec<Priority> {
        self.lock().events.iter().map(|ev| ev.priority()).collect()
    }

    /// True while a broadcast wakeup is still pending.
    pub fn wake_all_pending(&self) -> bool {
        self.lock().wake_all
    }

    pub fn waiting_count(&self) -> u32 {
        self.lock().waiting_count
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ev(id: i32, priority: Priority) -> Event {
        let mut e = Event::new(id, 8, 1);
        e.set_priority(priority);
        e
    }

    fn ev_grp(id: i32, group: i32) -> Event {
        Event::new(id, 8, group)
    }

    fn att() -> Attachment {
        Attachment::new(1, 1, "test".into(), -1)
    }

    fn ids(events: &[Event]) -> Vec<i32> {
        events.iter().map(|e| e.id()).collect()
    }

    #[test]
    fn test_put_orders_highs_before_lows_fifo_within_class() {
        // H1, L1, H2, L2, H3 -> [H1, H2, H3, L1, L2]
        let list = EventList::new();
        list.put(vec![
            ev(1, Priority::High),
            ev(10, Priority::Low),
            ev(2, Priority::High),
            ev(11, Priority::Low),
            ev(3, Priority::High),
        ]);
        assert_eq!(list.stats().last_high, 3);
        let drained = list.drain_all();
        assert_eq!(ids(&drained), vec![1, 2, 3, 10, 11]);
    }

    #[test]
    fn test_put_resets_last_high_after_drain() {
        let list = EventList::new();
        list.put(vec![ev(1, Priority::High)]);
        list.drain_all();
        list.put(vec![ev(2, Priority::High), ev(3, Priority::Low)]);
        assert_eq!(list.stats().last_high, 1);
        assert_eq!(ids(&list.drain_all()), vec![2, 3]);
    }

    #[test]
    fn test_put_all_merges_into_high_block() {
        let list = EventList::new();
        list.put_all(vec![ev(1, Priority::High), ev(10, Priority::Low)]);
        // incoming highs land after the existing high block, lows at the tail
        list.put_all(vec![ev(2, Priority::High), ev(11, Priority::Low)]);
        let pri = list.priorities();
        assert_eq!(
            pri,
            vec![Priority::High, Priority::High, Priority::Low, Priority::Low]
        );
        assert_eq!(ids(&list.drain_all()), vec![1, 2, 10, 11]);
    }

    #[test]
    fn test_put_all_fast_path_for_all_lows() {
        let list = EventList::new();
        list.put_all(vec![ev(1, Priority::High)]);
        list.put_all(vec![ev(10, Priority::Low), ev(11, Priority::Low)]);
        assert_eq!(ids(&list.drain_all()), vec![1, 10, 11]);
    }

    #[test]
    fn test_put_reverse_places_restored_events_first() {
        let list = EventList::new();
        list.put_all(vec![
            ev(1, Priority::High),
            ev(10, Priority::Low),
            ev(11, Priority::Low),
        ]);
        list.put_reverse(vec![ev(2, Priority::High), ev(12, Priority::Low)]);
        // restored high ahead of resident highs, restored low ahead of resident lows
        assert_eq!(ids(&list.drain_all()), vec![2, 1, 12, 10, 11]);
    }

    #[test]
    fn test_get_async_on_empty_fails_empty() {
        let list = EventList::new();
        let a = att();
        let err = list.get(&a, WaitMode::Async, 1).unwrap_err();
        assert!(matches!(err, TransportError::Empty));
    }

    #[test]
    fn test_get_returns_at_most_quantity_from_head() {
        let list = EventList::new();
        let a = att();
        list.put(vec![
            ev(1, Priority::High),
            ev(2, Priority::Low),
            ev(3, Priority::Low),
        ]);
        let taken = list.get(&a, WaitMode::Async, 2).unwrap();
        assert_eq!(ids(&taken), vec![1, 2]);
        assert_eq!(list.len(), 1);
        let stats = list.stats();
        assert_eq!(stats.events_in, 3);
        assert_eq!(stats.events_out, 2);
    }

    #[test]
    fn test_get_by_group_filters_and_preserves_order() {
        let list = EventList::new();
        let a = att();
        list.put_all(vec![ev_grp(1, 1), ev_grp(2, 2), ev_grp(3, 1), ev_grp(4, 2)]);
        let taken = list.get_by_group(&a, WaitMode::Async, 10, 2).unwrap();
        assert_eq!(ids(&taken), vec![2, 4]);
        assert_eq!(ids(&list.drain_all()), vec![1, 3]);
    }

    #[test]
    fn test_get_by_group_async_no_match_fails_empty() {
        let list = EventList::new();
        let a = att();
        list.put_all(vec![ev_grp(1, 1)]);
        let err = list.get_by_group(&a, WaitMode::Async, 1, 9).unwrap_err();
        assert!(matches!(err, TransportError::Empty));
        assert_eq!(list.len(), 1);
    }

    #[test]
    fn test_timed_get_times_out_without_consuming() {
        let list = EventList::new();
        let a = att();
        let begin = Instant::now();
        let err = list
            .get(&a, WaitMode::Timed(Duration::from_millis(50)), 1)
            .unwrap_err();
        assert!(matches!(err, TransportError::Timeout));
        assert!(begin.elapsed() >= Duration::from_millis(45));
        assert_eq!(list.waiting_count(), 0);
    }

    #[test]
    fn test_wake_up_all_unparks_and_clears_flag() {
        use std::sync::Arc;
        use std::thread;

        let list = Arc::new(EventList::new());
        let a = Arc::new(att());
        let (list2, a2) = (list.clone(), a.clone());
        let sleeper = thread::spawn(move || list2.get(&a2, WaitMode::Sleep, 1));
        // wait until the reader is parked
        while list.waiting_count() == 0 {
            thread::yield_now();
        }
        list.wake_up_all();
        let result = sleeper.join().expect("reader panicked");
        assert!(matches!(result, Err(TransportError::WakeUp(_))));
        assert!(!list.wake_all_pending());
    }

    #[test]
    fn test_wake_up_ignores_non_waiting_attachment() {
        let list = EventList::new();
        let a = att();
        list.wake_up(&a);
        // flag must not leak into the next read
        list.put(vec![ev(1, Priority::Low)]);
        let taken = list.get(&a, WaitMode::Async, 1).unwrap();
        assert_eq!(ids(&taken), vec![1]);
    }

    #[test]
    fn test_wait_mode_wire_round_trip() {
        let timed = WaitMode::Timed(Duration::from_micros(1_500_000));
        let (mode, sec, nsec) = timed.as_wire();
        assert_eq!((mode, sec, nsec), (TIMED, 1, 500_000_000));
        assert_eq!(WaitMode::from_wire(mode, sec, nsec).unwrap(), timed);
        assert!(WaitMode::from_wire(3, 0, 0).is_err());
    }
}
