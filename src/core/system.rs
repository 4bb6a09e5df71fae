//! The system registry: the station ring, attachments, the free pool, and
//! every structural operation over them.
//!
//! Lock discipline: the ring is an `RwLock` — conductors walk it under read
//! guards, structural mutations (create/remove/move/attach/detach) take the
//! write guard. The attachment map is locked after the ring, never before.
//! Blocking list operations are never entered while a ring guard is held.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU64, Ordering};
use std::sync::{
    Arc, Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard, Weak,
};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::{debug, info};

use crate::constants::{
    DEFAULT_EVENT_SIZE, DEFAULT_MAX_ATTACHMENTS, DEFAULT_MAX_STATIONS, DEFAULT_NUM_EVENTS, END,
    GRAND_CENTRAL, GRAND_CENTRAL_ID, NEW_HEAD, SYSTEM,
};
use crate::core::attachment::{Attachment, AttachmentId};
use crate::core::conductor::{self, Conductor};
use crate::core::event::{Event, Modify};
use crate::core::list::WaitMode;
use crate::core::select::SelectRegistry;
use crate::core::station::{FlowMode, RestoreMode, SelectMode, Station, StationConfig, StationId};
use crate::errors::{Result, TransportError};

/// Knobs fixed at system creation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SystemConfig {
    /// Total number of events in the pool. Constant for the system lifetime.
    pub num_events: usize,
    /// Fixed data capacity of every event, in bytes.
    pub event_size: usize,
    pub max_stations: usize,
    pub max_attachments: usize,
    /// Static partition of the pool into groups, by size. Empty means one
    /// group holding everything. Group numbers start at 1.
    pub groups: Vec<usize>,
}

impl Default for SystemConfig {
    fn default() -> Self {
        SystemConfig {
            num_events: DEFAULT_NUM_EVENTS,
            event_size: DEFAULT_EVENT_SIZE,
            max_stations: DEFAULT_MAX_STATIONS,
            max_attachments: DEFAULT_MAX_ATTACHMENTS,
            groups: Vec::new(),
        }
    }
}

impl SystemConfig {
    pub fn validate(&self) -> Result<()> {
        if self.num_events == 0 {
            return Err(TransportError::General("num_events must be positive".into()));
        }
        if self.event_size == 0 {
            return Err(TransportError::General("event_size must be positive".into()));
        }
        if !self.groups.is_empty() {
            if self.groups.iter().any(|g| *g == 0) {
                return Err(TransportError::General("empty event group".into()));
            }
            let total: usize = self.groups.iter().sum();
            if total != self.num_events {
                return Err(TransportError::General(format!(
                    "group sizes sum to {total}, expected {}",
                    self.num_events
                )));
            }
        }
        Ok(())
    }
}

/// The station ring. Entry 0 is always GRAND_CENTRAL; each entry is either a
/// lone serial station or an ordered parallel group, head first.
#[derive(Debug, Default)]
pub(crate) struct Ring {
    pub(crate) entries: Vec<Vec<Arc<Station>>>,
}

impl Ring {
    pub(crate) fn find(&self, id: StationId) -> Option<(usize, usize, Arc<Station>)> {
        for (ei, group) in self.entries.iter().enumerate() {
            for (mi, station) in group.iter().enumerate() {
                if station.id() == id {
                    return Some((ei, mi, station.clone()));
                }
            }
        }
        None
    }

    pub(crate) fn by_name(&self, name: &str) -> Option<Arc<Station>> {
        self.entries
            .iter()
            .flatten()
            .find(|s| s.name() == name)
            .cloned()
    }

    pub(crate) fn position_of(&self, id: StationId) -> Option<usize> {
        self.entries
            .iter()
            .position(|group| group.iter().any(|s| s.id() == id))
    }

    pub(crate) fn station_count(&self) -> usize {
        self.entries.iter().map(|g| g.len()).sum()
    }

    pub(crate) fn stations(&self) -> Vec<Arc<Station>> {
        self.entries.iter().flatten().cloned().collect()
    }

    pub(crate) fn grand_central(&self) -> Arc<Station> {
        self.entries[0][0].clone()
    }
}

/// The event transport system: registry, free pool, conductors.
///
/// Created with [`EventSystem::new`], shared behind an `Arc`, torn down with
/// [`EventSystem::close`] (also run on drop).
#[derive(Debug)]
pub struct EventSystem {
    config: SystemConfig,
    ring: RwLock<Ring>,
    attachments: Mutex<HashMap<AttachmentId, Arc<Attachment>>>,
    registry: SelectRegistry,
    conductors: Mutex<HashMap<StationId, Conductor>>,
    /// GRAND_CENTRAL input-list depth observed at each `new_events` request.
    histogram: Mutex<Vec<u32>>,
    next_station_id: AtomicI32,
    next_attachment_id: AtomicI32,
    heartbeat: Arc<AtomicU64>,
    heartbeat_handle: Mutex<Option<JoinHandle<()>>>,
    running: Arc<AtomicBool>,
    closed: AtomicBool,
    /// Self-reference handed to conductor threads so they never keep the
    /// system alive on their own.
    weak: Weak<EventSystem>,
}

impl EventSystem {
    /// Build the system: create GRAND_CENTRAL, seed its input list with the
    /// whole event pool, and start its conductor.
    pub fn new(config: SystemConfig) -> Result<Arc<EventSystem>> {
        config.validate()?;

        let gc_config = StationConfig {
            cue: config.num_events,
            ..StationConfig::default()
        };
        let gc = Arc::new(Station::new(
            GRAND_CENTRAL_ID,
            GRAND_CENTRAL.to_string(),
            gc_config,
        ));

        let group_sizes = if config.groups.is_empty() {
            vec![config.num_events]
        } else {
            config.groups.clone()
        };
        let mut pool = Vec::with_capacity(config.num_events);
        let mut id: i32 = 0;
        for (g, count) in group_sizes.iter().enumerate() {
            for _ in 0..*count {
                pool.push(Event::new(id, config.event_size, (g + 1) as i32));
                id += 1;
            }
        }
        gc.input.put_low(pool);

        let num_events = config.num_events;
        let system = Arc::new_cyclic(|weak| EventSystem {
            config,
            ring: RwLock::new(Ring {
                entries: vec![vec![gc.clone()]],
            }),
            attachments: Mutex::new(HashMap::new()),
            registry: SelectRegistry::new(),
            conductors: Mutex::new(HashMap::new()),
            histogram: Mutex::new(vec![0; num_events + 1]),
            next_station_id: AtomicI32::new(1),
            next_attachment_id: AtomicI32::new(0),
            heartbeat: Arc::new(AtomicU64::new(0)),
            heartbeat_handle: Mutex::new(None),
            running: Arc::new(AtomicBool::new(true)),
            closed: AtomicBool::new(false),
            weak: weak.clone(),
        });

        system.spawn_conductor(&gc)?;
        system.spawn_heartbeat()?;
        info!(
            num_events = system.config.num_events,
            event_size = system.config.event_size,
            "event system started"
        );
        Ok(system)
    }

    pub fn config(&self) -> &SystemConfig {
        &self.config
    }

    pub fn num_events(&self) -> usize {
        self.config.num_events
    }

    pub fn event_size(&self) -> usize {
        self.config.event_size
    }

    pub fn group_count(&self) -> usize {
        if self.config.groups.is_empty() {
            1
        } else {
            self.config.groups.len()
        }
    }

    /// Registry of named user select predicates. Register before creating
    /// stations that reference them.
    pub fn select_registry(&self) -> &SelectRegistry {
        &self.registry
    }

    pub fn heartbeat(&self) -> u64 {
        self.heartbeat.load(Ordering::Relaxed)
    }

    pub fn histogram(&self) -> Vec<u32> {
        self.histogram
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub(crate) fn ring_read(&self) -> RwLockReadGuard<'_, Ring> {
        self.ring.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn ring_write(&self) -> RwLockWriteGuard<'_, Ring> {
        self.ring.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn attachments_lock(&self) -> MutexGuard<'_, HashMap<AttachmentId, Arc<Attachment>>> {
        self.attachments.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn conductors_lock(&self) -> MutexGuard<'_, HashMap<StationId, Conductor>> {
        self.conductors.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn ensure_running(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(TransportError::Dead);
        }
        Ok(())
    }

    fn spawn_conductor(&self, station: &Arc<Station>) -> Result<()> {
        let conductor = Conductor::spawn(self.weak.clone(), station.clone())?;
        self.conductors_lock().insert(station.id(), conductor);
        Ok(())
    }

    fn spawn_heartbeat(&self) -> Result<()> {
        let beat = self.heartbeat.clone();
        let running = self.running.clone();
        let handle = thread::Builder::new()
            .name("railyard-heartbeat".into())
            .spawn(move || {
                while running.load(Ordering::Relaxed) {
                    beat.fetch_add(1, Ordering::Relaxed);
                    thread::sleep(Duration::from_millis(500));
                }
            })?;
        *self
            .heartbeat_handle
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(handle);
        Ok(())
    }

    // ---- stations ------------------------------------------------------

    /// Create a station at `position` in the ring (1-based; END appends) and,
    /// for parallel stations, at `parallel_position` within the group at that
    /// position (NEW_HEAD starts a fresh group there instead).
    ///
    /// Creating a station whose name and configuration both match an existing
    /// one returns the existing id; a name match with a different
    /// configuration fails with `Exists`.
    pub fn create_station(
        &self,
        name: &str,
        config: StationConfig,
        position: i32,
        parallel_position: i32,
    ) -> Result<StationId> {
        self.ensure_running()?;
        if name == GRAND_CENTRAL {
            return Err(TransportError::General(
                "cannot create GRAND_CENTRAL station".into(),
            ));
        }
        if position != END && position < 1 {
            return Err(TransportError::General("bad value for position".into()));
        }
        if parallel_position != END && parallel_position != NEW_HEAD && parallel_position < 0 {
            return Err(TransportError::General(
                "bad value for parallel position".into(),
            ));
        }
        config.check()?;
        if config.select_mode == SelectMode::User {
            if let Some(func) = &config.select_function {
                if !self.registry.contains(func) {
                    return Err(TransportError::General(format!(
                        "cannot resolve select function {func}"
                    )));
                }
            }
        }
        let mut config = config;
        config.cue = config.cue.min(self.config.num_events);

        let mut ring = self.ring_write();
        if let Some(existing) = ring.by_name(name) {
            return if existing.config() == &config {
                Ok(existing.id())
            } else {
                Err(TransportError::Exists(format!(
                    "station {name} exists with a different configuration"
                )))
            };
        }
        if ring.station_count() >= self.config.max_stations {
            return Err(TransportError::TooMany(
                "maximum number of stations reached".into(),
            ));
        }
        let entry_pos = if position == END {
            ring.entries.len()
        } else {
            position as usize
        };
        if entry_pos > ring.entries.len() {
            return Err(TransportError::General("position beyond end of ring".into()));
        }

        let id = self.next_station_id.fetch_add(1, Ordering::Relaxed);
        let station = Arc::new(Station::new(id, name.to_string(), config));
        Self::link_into_ring(&mut ring, station.clone(), entry_pos, parallel_position)?;
        drop(ring);

        self.spawn_conductor(&station)?;
        info!(station = name, id, position, parallel_position, "station created");
        Ok(id)
    }

    /// Wire a station into the ring at a validated entry position.
    fn link_into_ring(
        ring: &mut Ring,
        station: Arc<Station>,
        entry_pos: usize,
        parallel_position: i32,
    ) -> Result<()> {
        if station.config().flow_mode == FlowMode::Serial || parallel_position == NEW_HEAD {
            ring.entries.insert(entry_pos, vec![station]);
            return Ok(());
        }
        // parallel, joining whatever already holds this slot
        let joins_group = entry_pos < ring.entries.len()
            && ring.entries[entry_pos][0].config().flow_mode == FlowMode::Parallel;
        if !joins_group {
            ring.entries.insert(entry_pos, vec![station]);
            return Ok(());
        }
        let head_config = ring.entries[entry_pos][0].config().clone();
        if !station.config().compatible_with(&head_config) {
            return Err(TransportError::General(
                "station is incompatible with the parallel group at this position".into(),
            ));
        }
        let group = &mut ring.entries[entry_pos];
        let member_pos = if parallel_position == END {
            group.len()
        } else {
            parallel_position as usize
        };
        if member_pos > group.len() {
            return Err(TransportError::General(
                "parallel position beyond end of group".into(),
            ));
        }
        group.insert(member_pos, station);
        Ok(())
    }

    /// Remove a station. Fails for GRAND_CENTRAL and for stations that still
    /// have attachments. Queued events are recycled into the free pool.
    pub fn remove_station(&self, id: StationId) -> Result<()> {
        if id == GRAND_CENTRAL_ID {
            return Err(TransportError::General(
                "cannot remove GRAND_CENTRAL station".into(),
            ));
        }
        let mut ring = self.ring_write();
        let (ei, mi, station) = ring
            .find(id)
            .ok_or_else(|| TransportError::General("station does not exist".into()))?;
        if station.attachment_count() > 0 {
            return Err(TransportError::General(
                "remove all attachments before removing station".into(),
            ));
        }
        ring.entries[ei].remove(mi);
        if ring.entries[ei].is_empty() {
            ring.entries.remove(ei);
        }
        let gc = ring.grand_central();
        drop(ring);

        let conductor = self.conductors_lock().remove(&id);
        station.close_lists();
        if let Some(c) = conductor {
            c.join();
        }
        let mut leftovers = station.input.drain_all();
        leftovers.extend(station.output.drain_all());
        if !leftovers.is_empty() {
            for ev in leftovers.iter_mut() {
                ev.init();
            }
            gc.input.put_in_gc(leftovers);
        }
        info!(station = station.name(), id, "station removed");
        Ok(())
    }

    /// Move a station. Forbidden for GRAND_CENTRAL and for moves that would
    /// break parallel-group compatibility; such moves leave the ring as it
    /// was.
    pub fn set_station_position(
        &self,
        id: StationId,
        position: i32,
        parallel_position: i32,
    ) -> Result<()> {
        self.ensure_running()?;
        if id == GRAND_CENTRAL_ID {
            return Err(TransportError::General(
                "cannot move GRAND_CENTRAL station".into(),
            ));
        }
        if position == 0 {
            return Err(TransportError::General(
                "GRAND_CENTRAL station is always first".into(),
            ));
        }
        if position != END && position < 1 {
            return Err(TransportError::General("bad value for position".into()));
        }
        if parallel_position != END && parallel_position != NEW_HEAD && parallel_position < 0 {
            return Err(TransportError::General(
                "bad value for parallel position".into(),
            ));
        }
        let mut ring = self.ring_write();
        let (ei, mi, station) = ring
            .find(id)
            .ok_or_else(|| TransportError::General("station does not exist".into()))?;
        ring.entries[ei].remove(mi);
        let emptied = ring.entries[ei].is_empty();
        if emptied {
            ring.entries.remove(ei);
        }
        let entry_pos = if position == END {
            ring.entries.len()
        } else {
            position as usize
        };
        if entry_pos > ring.entries.len() {
            // roll the removal back before failing
            Self::relink_at(&mut ring, station, ei, mi, emptied);
            return Err(TransportError::General("position beyond end of ring".into()));
        }
        if let Err(err) = Self::link_into_ring(&mut ring, station.clone(), entry_pos, parallel_position)
        {
            Self::relink_at(&mut ring, station, ei, mi, emptied);
            return Err(err);
        }
        Ok(())
    }

    fn relink_at(ring: &mut Ring, station: Arc<Station>, ei: usize, mi: usize, emptied: bool) {
        if emptied {
            let ei = ei.min(ring.entries.len());
            ring.entries.insert(ei, vec![station]);
        } else {
            let mi = mi.min(ring.entries[ei].len());
            ring.entries[ei].insert(mi, station);
        }
    }

    /// (position, parallel_position) of a station in the ring.
    pub fn station_position(&self, id: StationId) -> Result<(i32, i32)> {
        let ring = self.ring_read();
        let (ei, mi, _) = ring
            .find(id)
            .ok_or_else(|| TransportError::General("station does not exist".into()))?;
        Ok((ei as i32, mi as i32))
    }

    pub fn station_id_by_name(&self, name: &str) -> Option<StationId> {
        self.ring_read().by_name(name).map(|s| s.id())
    }

    pub fn station_by_id(&self, id: StationId) -> Option<Arc<Station>> {
        self.ring_read().find(id).map(|(_, _, s)| s)
    }

    pub fn station_count(&self) -> usize {
        self.ring_read().station_count()
    }

    /// All stations in ring order, parallel groups flattened head-first.
    pub fn stations(&self) -> Vec<Arc<Station>> {
        self.ring_read().stations()
    }

    pub fn grand_central(&self) -> Arc<Station> {
        self.ring_read().grand_central()
    }

    // ---- attachments ---------------------------------------------------

    /// Attach a reader/writer to a station.
    pub fn attach(&self, station_id: StationId, host: &str, pid: i32) -> Result<Arc<Attachment>> {
        self.ensure_running()?;
        let ring = self.ring_read();
        let (_, _, station) = ring
            .find(station_id)
            .ok_or_else(|| TransportError::General("station does not exist".into()))?;
        let mut attachments = self.attachments_lock();
        if attachments.len() >= self.config.max_attachments {
            return Err(TransportError::TooMany(
                "maximum number of attachments reached".into(),
            ));
        }
        let user_mode = station.config().user_mode;
        if user_mode > 0 && station.attachment_count() >= user_mode as usize {
            return Err(TransportError::TooMany(
                "station attachment limit reached".into(),
            ));
        }
        let id = self.next_attachment_id.fetch_add(1, Ordering::Relaxed);
        let att = Arc::new(Attachment::new(id, station_id, host.to_string(), pid));
        attachments.insert(id, att.clone());
        station.add_attachment(id);
        info!(attachment = id, station = station.name(), host, "attached");
        Ok(att)
    }

    /// Detach and invalidate. The caller is responsible for restoring any
    /// events the attachment still holds (see [`restore_events`]) first.
    ///
    /// [`restore_events`]: EventSystem::restore_events
    pub fn detach(&self, att_id: AttachmentId) -> Result<()> {
        let ring = self.ring_read();
        let mut attachments = self.attachments_lock();
        let att = attachments
            .remove(&att_id)
            .ok_or_else(|| TransportError::General("no such attachment".into()))?;
        att.invalidate();
        if let Some((_, _, station)) = ring.find(att.station_id()) {
            station.remove_attachment(att_id);
            station.input.wake_up(&att);
        }
        info!(attachment = att_id, "detached");
        Ok(())
    }

    pub fn attachment_by_id(&self, id: AttachmentId) -> Option<Arc<Attachment>> {
        self.attachments_lock().get(&id).cloned()
    }

    pub fn attachment_count(&self) -> usize {
        self.attachments_lock().len()
    }

    pub fn attachments(&self) -> Vec<Arc<Attachment>> {
        let mut all: Vec<Arc<Attachment>> = self.attachments_lock().values().cloned().collect();
        all.sort_by_key(|a| a.id());
        all
    }

    pub fn is_attached(&self, station_id: StationId, att_id: AttachmentId) -> Result<bool> {
        let station = self
            .station_by_id(station_id)
            .ok_or_else(|| TransportError::General("station does not exist".into()))?;
        Ok(station.has_attachment(att_id))
    }

    fn checked_attachment(&self, att: &Attachment) -> Result<Arc<Station>> {
        if !att.usable() {
            return Err(TransportError::General("attachment not usable".into()));
        }
        self.station_by_id(att.station_id())
            .ok_or_else(|| TransportError::General("station does not exist".into()))
    }

    // ---- wakeups -------------------------------------------------------

    pub fn wake_up_attachment(&self, att_id: AttachmentId) -> Result<()> {
        let att = self
            .attachment_by_id(att_id)
            .ok_or_else(|| TransportError::General("no such attachment".into()))?;
        let station = self
            .station_by_id(att.station_id())
            .ok_or_else(|| TransportError::General("station does not exist".into()))?;
        station.input.wake_up(&att);
        Ok(())
    }

    pub fn wake_up_all(&self, station_id: StationId) -> Result<()> {
        let station = self
            .station_by_id(station_id)
            .ok_or_else(|| TransportError::General("station does not exist".into()))?;
        station.input.wake_up_all();
        Ok(())
    }

    // ---- the data plane ------------------------------------------------

    /// Hand out fresh events from the attachment's station input list (the
    /// free pool, for producers on GRAND_CENTRAL). `group` 0 draws from any
    /// group. The events come back scrubbed, owned by the attachment, and
    /// marked fully modifiable.
    pub fn new_events(
        &self,
        att: &Attachment,
        mode: WaitMode,
        count: usize,
        size: usize,
        group: i32,
    ) -> Result<Vec<Event>> {
        self.ensure_running()?;
        let station = self.checked_attachment(att)?;
        if count == 0 {
            return Ok(Vec::new());
        }
        if size > self.config.event_size {
            return Err(TransportError::General(format!(
                "requested size {size} exceeds event size {}",
                self.config.event_size
            )));
        }
        if group < 0 || group as usize > self.group_count() {
            return Err(TransportError::General("bad group number".into()));
        }
        if station.id() == GRAND_CENTRAL_ID {
            self.record_histogram(station.input.len());
        }
        let mut events = if group == 0 {
            station.input.get(att, mode, count)?
        } else {
            station.input.get_by_group(att, mode, count, group)?
        };
        for ev in &mut events {
            ev.init();
            ev.set_owner(att.id());
            ev.set_modify(Modify::HeaderAndData);
        }
        att.add_make(events.len() as u64);
        Ok(events)
    }

    /// Read events from the attachment's station input list for processing.
    /// Forbidden on GRAND_CENTRAL — its input list is the free pool.
    pub fn get_events(
        &self,
        att: &Attachment,
        mode: WaitMode,
        modify: Modify,
        count: usize,
    ) -> Result<Vec<Event>> {
        self.ensure_running()?;
        let station = self.checked_attachment(att)?;
        if station.id() == GRAND_CENTRAL_ID {
            return Err(TransportError::General(
                "may not get events from GRAND_CENTRAL".into(),
            ));
        }
        if count == 0 {
            return Ok(Vec::new());
        }
        let mut events = station.input.get(att, mode, count)?;
        for ev in &mut events {
            ev.set_owner(att.id());
            ev.set_modify(modify);
        }
        att.add_get(events.len() as u64);
        Ok(events)
    }

    /// Publish events into the attachment's station output list, where the
    /// conductor picks them up. Every event must be owned by the attachment.
    pub fn put_events(&self, att: &Attachment, mut events: Vec<Event>) -> Result<()> {
        let station = self.checked_attachment(att)?;
        if events.is_empty() {
            return Ok(());
        }
        for ev in &events {
            if ev.owner() != att.id() {
                return Err(TransportError::General(
                    "may not put events, not owner".into(),
                ));
            }
        }
        let n = events.len() as u64;
        for ev in &mut events {
            ev.set_owner(SYSTEM);
            ev.set_modify(Modify::None);
        }
        station.output.put(events);
        att.add_put(n);
        Ok(())
    }

    /// Recycle unwanted events straight back to the free pool, bypassing the
    /// ring. The events are scrubbed and never seen by other stations.
    pub fn dump_events(&self, att: &Attachment, mut events: Vec<Event>) -> Result<()> {
        self.checked_attachment(att)?;
        if events.is_empty() {
            return Ok(());
        }
        for ev in &events {
            if ev.owner() != att.id() {
                return Err(TransportError::General(
                    "may not dump events, not owner".into(),
                ));
            }
        }
        let n = events.len() as u64;
        for ev in &mut events {
            ev.init();
        }
        self.grand_central().input.put_in_gc(events);
        att.add_dump(n);
        Ok(())
    }

    /// Re-home events whose holder died (or was torn down), per the owning
    /// station's restore mode. Priority order is preserved; the events do not
    /// count into list statistics a second time.
    pub fn restore_events(&self, att: &Attachment, mut events: Vec<Event>) -> Result<()> {
        if events.is_empty() {
            return Ok(());
        }
        for ev in &mut events {
            ev.set_owner(SYSTEM);
        }
        // restored events keep priority order: highs lead
        events.sort_by_key(|ev| ev.priority() != crate::core::event::Priority::High);
        let n = events.len();
        let ring = self.ring_read();
        let Some((ei, _, station)) = ring.find(att.station_id()) else {
            let gc = ring.grand_central();
            drop(ring);
            gc.input.put_reverse(events);
            return Ok(());
        };
        let mode = station.config().restore_mode;
        match mode {
            RestoreMode::ToStation => station.input.put_reverse(events),
            RestoreMode::ToGrandCentral => ring.grand_central().input.put_reverse(events),
            RestoreMode::ToInput => {
                // upstream ring entry feeds this station; its conductor will
                // deliver the events here again. Routing is keyed by ring-
                // entry position, so when the upstream entry is a parallel
                // group any member's output reaches the same stations; the
                // head's is used.
                let upstream = if ei == 0 { 0 } else { ei - 1 };
                ring.entries[upstream][0].output.put_reverse(events);
            }
            RestoreMode::Redistribute => {
                let group = ring.entries[ei].clone();
                let leftovers = conductor::redistribute(&group, events, &self.registry);
                if !leftovers.is_empty() {
                    ring.grand_central().input.put_reverse(leftovers);
                }
            }
        }
        info!(
            attachment = att.id(),
            station = station.name(),
            count = n,
            restore = ?mode,
            "restored events"
        );
        Ok(())
    }

    fn record_histogram(&self, depth: usize) {
        let mut hist = self.histogram.lock().unwrap_or_else(PoisonError::into_inner);
        let idx = depth.min(hist.len() - 1);
        hist[idx] += 1;
    }

    // ---- lifecycle -----------------------------------------------------

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Tear the system down: wake every parked reader, stop all conductors,
    /// invalidate all attachments. Idempotent.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        info!("event system closing");
        let stations = self.ring_read().stations();
        for station in &stations {
            station.input.wake_up_all();
            station.output.wake_up_all();
            station.close_lists();
        }
        let conductors: Vec<Conductor> = {
            let mut map = self.conductors_lock();
            map.drain().map(|(_, c)| c).collect()
        };
        for conductor in conductors {
            conductor.join();
        }
        self.running.store(false, Ordering::Relaxed);
        if let Some(handle) = self
            .heartbeat_handle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            let _ = handle.join();
        }
        let attachments: Vec<Arc<Attachment>> = {
            let mut map = self.attachments_lock();
            map.drain().map(|(_, a)| a).collect()
        };
        for att in attachments {
            att.invalidate();
        }
        debug!("event system closed");
    }
}

impl Drop for EventSystem {
    fn drop(&mut self) {
        self.close();
    }
}
