//! Conductors: one worker thread per station, draining its output list and
//! routing every event into the next station that wants it.
//!
//! Routing walks the ring forward from the station's slot, wrapping once;
//! whatever nothing claims lands back in GRAND_CENTRAL's input list. Events
//! never vanish.

use std::sync::atomic::Ordering;
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};

use tracing::debug;

use crate::core::event::{Event, Priority};
use crate::core::select::SelectRegistry;
use crate::core::station::{BlockMode, SelectMode, Station, StationId};
use crate::core::system::EventSystem;
use crate::errors::Result;

/// Handle on a station's conductor thread.
#[derive(Debug)]
pub(crate) struct Conductor {
    handle: Option<JoinHandle<()>>,
}

impl Conductor {
    /// Start the conductor. It holds the system weakly so a dropped system
    /// can still tear down cleanly; the thread exits when the station's
    /// output list is closed.
    pub(crate) fn spawn(system: Weak<EventSystem>, station: Arc<Station>) -> Result<Conductor> {
        let handle = thread::Builder::new()
            .name(format!("conductor-{}", station.name()))
            .spawn(move || run(system, station))?;
        Ok(Conductor {
            handle: Some(handle),
        })
    }

    pub(crate) fn join(mut self) {
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

fn run(system: Weak<EventSystem>, station: Arc<Station>) {
    debug!(station = station.name(), "conductor started");
    loop {
        let Some(mut batch) = station.output.wait_drain() else {
            break;
        };
        // highs lead; the sort is stable so FIFO order survives per class
        batch.sort_by_key(|ev| ev.priority() != Priority::High);
        let Some(system) = system.upgrade() else {
            break;
        };
        route_downstream(&system, station.id(), batch);
    }
    debug!(station = station.name(), "conductor stopped");
}

/// Walk the ring forward from `from`, offering the batch to each entry in
/// turn. Events still unclaimed when the walk wraps go to GRAND_CENTRAL.
pub(crate) fn route_downstream(system: &EventSystem, from: StationId, events: Vec<Event>) {
    if events.is_empty() {
        return;
    }
    let ring = system.ring_read();
    let registry = system.select_registry();
    let n = ring.entries.len();
    let start = ring.position_of(from).unwrap_or(0);
    let mut remaining = events;
    let mut idx = (start + 1) % n;
    while !remaining.is_empty() && idx != 0 {
        remaining = offer_to_entry(&ring.entries[idx], remaining, registry);
        idx = (idx + 1) % n;
    }
    if !remaining.is_empty() {
        ring.grand_central().input.put_all(remaining);
    }
}

/// Offer a highs-first batch to one ring entry. Returns the events the entry
/// did not take.
fn offer_to_entry(
    group: &[Arc<Station>],
    events: Vec<Event>,
    registry: &SelectRegistry,
) -> Vec<Event> {
    match group[0].config().select_mode {
        SelectMode::RoundRobin => {
            distribute_round_robin(group, events);
            Vec::new()
        }
        SelectMode::EqualCue => {
            distribute_equal_cue(group, events);
            Vec::new()
        }
        _ => offer_individually(group, events, registry),
    }
}

/// Group admission for restore-mode `Redistribute`: offer the events to the
/// group as if the conductor had just routed them. Returns what nobody took.
pub(crate) fn redistribute(
    group: &[Arc<Station>],
    events: Vec<Event>,
    registry: &SelectRegistry,
) -> Vec<Event> {
    offer_to_entry(group, events, registry)
}

/// Round-robin distribution: the head's rotation pointer survives across
/// batches, so consecutive batches keep alternating members.
fn distribute_round_robin(group: &[Arc<Station>], events: Vec<Event>) {
    let members = group.len();
    let mut batches: Vec<Vec<Event>> = (0..members).map(|_| Vec::new()).collect();
    for ev in events {
        let slot = group[0].rrobin_cursor.fetch_add(1, Ordering::Relaxed) % members;
        batches[slot].push(ev);
    }
    for (member, batch) in group.iter().zip(&batches) {
        member.input.bump_try(batch.len() as u64);
    }
    deliver(group, batches);
}

/// Equal-cue distribution: each event goes to the member with the shortest
/// input list, ties broken by group position.
fn distribute_equal_cue(group: &[Arc<Station>], events: Vec<Event>) {
    let members = group.len();
    let mut lens: Vec<usize> = group.iter().map(|s| s.input.len()).collect();
    let mut batches: Vec<Vec<Event>> = (0..members).map(|_| Vec::new()).collect();
    for ev in events {
        let mut slot = 0;
        for i in 1..members {
            if lens[i] < lens[slot] {
                slot = i;
            }
        }
        batches[slot].push(ev);
        lens[slot] += 1;
    }
    for (member, batch) in group.iter().zip(&batches) {
        member.input.bump_try(batch.len() as u64);
    }
    deliver(group, batches);
}

/// Per-member selection: the first member whose predicate, prescale, and cue
/// all pass takes the event. Used for serial entries (single member) and for
/// parallel groups with a user or match policy.
fn offer_individually(
    group: &[Arc<Station>],
    events: Vec<Event>,
    registry: &SelectRegistry,
) -> Vec<Event> {
    let members = group.len();
    let mut batches: Vec<Vec<Event>> = (0..members).map(|_| Vec::new()).collect();
    // events a non-blocking member can still take before its cue trips
    let mut room: Vec<usize> = group
        .iter()
        .map(|s| match s.config().block_mode {
            BlockMode::Blocking => usize::MAX,
            BlockMode::NonBlocking => s.config().cue.saturating_sub(s.input.len()),
        })
        .collect();
    let mut leftovers = Vec::new();
    'events: for ev in events {
        for (i, member) in group.iter().enumerate() {
            if !member.selects(&ev, registry) {
                continue;
            }
            let tried = member.input.tick_try();
            let prescale = member.config().prescale;
            if prescale > 1 && tried % prescale != 0 {
                continue;
            }
            if room[i] == 0 {
                // cue full on a non-blocking station: the event flows past
                continue;
            }
            if room[i] != usize::MAX {
                room[i] -= 1;
            }
            batches[i].push(ev);
            continue 'events;
        }
        leftovers.push(ev);
    }
    deliver(group, batches);
    leftovers
}

fn deliver(group: &[Arc<Station>], batches: Vec<Vec<Event>>) {
    for (member, batch) in group.iter().zip(batches) {
        if batch.is_empty() {
            continue;
        }
        member.input.put_all(batch);
    }
}
