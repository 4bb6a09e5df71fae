//! The protocol server: one accept thread per listener, one worker thread
//! per connected client, requests strictly serialized per connection.
//!
//! Each worker bridges its client into the local blocking semantics: a
//! remote `sleep` wait becomes repeated timed waits so the thread can notice
//! shutdown between parks, and events handed to a remote reader are held by
//! the connection until the client puts or dumps them. When a connection
//! dies, the held events are restored per the station's restore mode before
//! its attachments are detached.

use std::collections::HashMap;
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::constants::{ERROR, OK, READ_TIMEOUT_MS, SLEEP_POLL_US, STATION_SELECT_INTS};
use crate::core::attachment::{Attachment, AttachmentId};
use crate::core::event::{unpack_pri_status, Event, EventId, Modify};
use crate::core::list::WaitMode;
use crate::core::station::StationConfig;
use crate::core::system::EventSystem;
use crate::errors::TransportError;
use crate::network::data::AllData;
use crate::network::protocol::{
    read_i32, read_i64, read_string, write_i32, write_i64, Command, HandshakeReply,
    HandshakeRequest, WireEventHeader, WirePutHeader,
};

/// Handle on a running protocol server.
#[derive(Debug)]
pub struct Server {
    shutdown: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
    local_addr: SocketAddr,
}

impl Server {
    /// Bind and start serving the given system.
    pub fn spawn(system: Arc<EventSystem>, bind_addr: &str) -> io::Result<Server> {
        let listener = TcpListener::bind(bind_addr)?;
        let local_addr = listener.local_addr()?;
        listener.set_nonblocking(true)?;

        let shutdown = Arc::new(AtomicBool::new(false));
        let accept_shutdown = shutdown.clone();
        let handle = thread::Builder::new()
            .name("railyard-accept".into())
            .spawn(move || accept_loop(listener, system, accept_shutdown))?;

        info!(%local_addr, "protocol server listening");
        Ok(Server {
            shutdown,
            handle: Some(handle),
            local_addr,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stop accepting and let client workers unwind. Idempotent.
    pub fn shutdown(&mut self) {
        self.shutdown.store(true, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn accept_loop(listener: TcpListener, system: Arc<EventSystem>, shutdown: Arc<AtomicBool>) {
    while !shutdown.load(Ordering::Relaxed) {
        match listener.accept() {
            Ok((stream, peer)) => {
                let system = system.clone();
                let shutdown = shutdown.clone();
                let spawned = thread::Builder::new()
                    .name(format!("railyard-client-{peer}"))
                    .spawn(move || {
                        if let Err(err) = serve_client(stream, peer, system, shutdown) {
                            debug!(%peer, %err, "client connection ended");
                        }
                    });
                if let Err(err) = spawned {
                    warn!(%err, "could not spawn client worker");
                }
            }
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                thread::sleep(Duration::from_millis(10));
            }
            Err(err) => {
                warn!(%err, "accept failed");
                thread::sleep(Duration::from_millis(10));
            }
        }
    }
}

/// Socket reader that rides out the 2-second read timeout: interrupted reads
/// are retried transparently until shutdown is requested.
struct PatientReader {
    inner: TcpStream,
    shutdown: Arc<AtomicBool>,
}

impl Read for PatientReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            match self.inner.read(buf) {
                Err(ref e)
                    if matches!(
                        e.kind(),
                        io::ErrorKind::WouldBlock
                            | io::ErrorKind::TimedOut
                            | io::ErrorKind::Interrupted
                    ) =>
                {
                    if self.shutdown.load(Ordering::Relaxed) {
                        return Err(io::Error::new(
                            io::ErrorKind::TimedOut,
                            "server shutting down",
                        ));
                    }
                }
                other => return other,
            }
        }
    }
}

fn serve_client(
    stream: TcpStream,
    peer: SocketAddr,
    system: Arc<EventSystem>,
    shutdown: Arc<AtomicBool>,
) -> io::Result<()> {
    stream.set_read_timeout(Some(Duration::from_millis(READ_TIMEOUT_MS)))?;
    stream.set_nodelay(true)?;
    let write_half = stream.try_clone()?;
    let mut reader = BufReader::with_capacity(
        65536,
        PatientReader {
            inner: stream,
            shutdown: shutdown.clone(),
        },
    );
    let mut writer = BufWriter::with_capacity(65536, write_half);

    // handshake comes before any command
    let mut hs = [0u8; HandshakeRequest::SIZE];
    reader.read_exact(&mut hs)?;
    let valid = HandshakeRequest::from_bytes(&hs)
        .map(|h| h.validate())
        .unwrap_or(false);
    if !valid {
        writer.write_all(&HandshakeReply::error(ERROR).to_bytes())?;
        writer.flush()?;
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "handshake rejected",
        ));
    }
    writer.write_all(&HandshakeReply::ok(system.num_events(), system.event_size()).to_bytes())?;
    writer.flush()?;
    info!(%peer, "client connected");

    let mut session = Session {
        system,
        shutdown,
        attachments: HashMap::new(),
        held: HashMap::new(),
    };
    let result = session.run(&mut reader, &mut writer);
    session.teardown();
    match &result {
        Ok(()) => info!(%peer, "client closed"),
        Err(err) => info!(%peer, %err, "client torn down"),
    }
    result
}

/// Per-connection state: the attachments this client created and the events
/// currently checked out to it, keyed by attachment then event id.
struct Session {
    system: Arc<EventSystem>,
    shutdown: Arc<AtomicBool>,
    attachments: HashMap<AttachmentId, Arc<Attachment>>,
    held: HashMap<AttachmentId, HashMap<EventId, Event>>,
}

impl Session {
    fn run<R: Read, W: Write>(&mut self, r: &mut R, w: &mut W) -> io::Result<()> {
        loop {
            let code = match read_i32(r) {
                Ok(code) => code,
                // a quietly closed socket between commands is a normal end
                Err(ref e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(()),
                Err(e) => return Err(e),
            };
            let Some(cmd) = Command::from_i32(code) else {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("unknown command {code}"),
                ));
            };
            match cmd {
                Command::Close => {
                    write_i32(w, OK)?;
                    w.flush()?;
                    return Ok(());
                }
                Command::Alive => {
                    write_i32(w, 1)?;
                    w.flush()?;
                }
                Command::WakeAttachment => {
                    let att_id = read_i32(r)?;
                    let _ = self.system.wake_up_attachment(att_id);
                }
                Command::WakeAll => {
                    let station_id = read_i32(r)?;
                    let _ = self.system.wake_up_all(station_id);
                }
                Command::StationCreateAt => self.station_create(r, w)?,
                Command::StationRemove => {
                    let station_id = read_i32(r)?;
                    let code = match self.system.remove_station(station_id) {
                        Ok(()) => OK,
                        Err(err) => err.code(),
                    };
                    write_i32(w, code)?;
                    w.flush()?;
                }
                Command::StationSetPosition => {
                    let station_id = read_i32(r)?;
                    let position = read_i32(r)?;
                    let parallel_position = read_i32(r)?;
                    let code = match self
                        .system
                        .set_station_position(station_id, position, parallel_position)
                    {
                        Ok(()) => OK,
                        Err(err) => err.code(),
                    };
                    write_i32(w, code)?;
                    w.flush()?;
                }
                Command::StationGetPosition => {
                    let station_id = read_i32(r)?;
                    match self.system.station_position(station_id) {
                        Ok((position, parallel_position)) => {
                            write_i32(w, OK)?;
                            write_i32(w, position)?;
                            write_i32(w, parallel_position)?;
                        }
                        Err(err) => {
                            write_i32(w, err.code())?;
                            write_i32(w, -1)?;
                            write_i32(w, -1)?;
                        }
                    }
                    w.flush()?;
                }
                Command::StationExists => {
                    let name_len = read_i32(r)?;
                    let name = read_string(r, name_len)?.unwrap_or_default();
                    match self.system.station_id_by_name(&name) {
                        Some(id) => {
                            write_i32(w, 1)?;
                            write_i32(w, id)?;
                        }
                        None => {
                            write_i32(w, 0)?;
                            write_i32(w, 0)?;
                        }
                    }
                    w.flush()?;
                }
                Command::StationAttach => self.station_attach(r, w)?,
                Command::StationDetach => self.station_detach(r, w)?,
                Command::StationIsAttached => {
                    let station_id = read_i32(r)?;
                    let att_id = read_i32(r)?;
                    let code = match self.system.is_attached(station_id, att_id) {
                        Ok(attached) => attached as i32,
                        Err(err) => err.code(),
                    };
                    write_i32(w, code)?;
                    w.flush()?;
                }
                Command::EventsNewGroup => self.events_new(r, w)?,
                Command::EventsGet => self.events_get(r, w)?,
                Command::EventsPut => self.events_put(r, w)?,
                Command::EventsDump => self.events_dump(r, w)?,
                Command::SysStations => {
                    self.int_reply(w, self.system.station_count() as i32)?
                }
                Command::SysStationsMax => {
                    self.int_reply(w, self.system.config().max_stations as i32)?
                }
                Command::SysAttachments => {
                    self.int_reply(w, self.system.attachment_count() as i32)?
                }
                Command::SysAttachmentsMax => {
                    self.int_reply(w, self.system.config().max_attachments as i32)?
                }
                Command::SysProcesses
                | Command::SysProcessesMax
                | Command::SysTemps
                | Command::SysTempsMax => self.int_reply(w, 0)?,
                Command::SysHeartbeat => self.int_reply(w, self.system.heartbeat() as i32)?,
                Command::SysPid => self.int_reply(w, std::process::id() as i32)?,
                Command::SysData => {
                    let data = AllData::collect(&self.system);
                    match data.encode() {
                        Ok(buf) => {
                            write_i32(w, OK)?;
                            write_i32(w, buf.len() as i32)?;
                            w.write_all(&buf)?;
                        }
                        Err(_) => write_i32(w, ERROR)?,
                    }
                    w.flush()?;
                }
                Command::SysHistogram => {
                    write_i32(w, OK)?;
                    for bucket in self.system.histogram() {
                        write_i32(w, bucket as i32)?;
                    }
                    w.flush()?;
                }
            }
        }
    }

    fn int_reply<W: Write>(&self, w: &mut W, value: i32) -> io::Result<()> {
        write_i32(w, OK)?;
        write_i32(w, value)?;
        w.flush()
    }

    fn session_attachment(&self, id: AttachmentId) -> Result<Arc<Attachment>, TransportError> {
        self.attachments
            .get(&id)
            .filter(|att| att.usable())
            .cloned()
            .ok_or_else(|| TransportError::General("attachment not usable".into()))
    }

    /// Remote sleep waits become repeated timed waits so this thread can
    /// notice shutdown between parks; everything else passes straight
    /// through.
    fn blocking_call<F>(&self, wait: WaitMode, f: F) -> Result<Vec<Event>, TransportError>
    where
        F: Fn(WaitMode) -> Result<Vec<Event>, TransportError>,
    {
        match wait {
            WaitMode::Sleep => loop {
                match f(WaitMode::Timed(Duration::from_micros(SLEEP_POLL_US))) {
                    Err(TransportError::Timeout) => {
                        if self.shutdown.load(Ordering::Relaxed) || self.system.is_closed() {
                            return Err(TransportError::Dead);
                        }
                    }
                    other => return other,
                }
            },
            other => f(other),
        }
    }

    fn hold(&mut self, att_id: AttachmentId, events: Vec<Event>) {
        if events.is_empty() {
            return;
        }
        let held = self.held.entry(att_id).or_default();
        for ev in events {
            held.insert(ev.id(), ev);
        }
    }

    fn station_create<R: Read, W: Write>(&mut self, r: &mut R, w: &mut W) -> io::Result<()> {
        let _struct_ok = read_i32(r)?;
        let flow = read_i32(r)?;
        let user = read_i32(r)?;
        let restore = read_i32(r)?;
        let block = read_i32(r)?;
        let prescale = read_i32(r)?;
        let cue = read_i32(r)?;
        let select_mode = read_i32(r)?;
        let mut select = [0i32; STATION_SELECT_INTS];
        for word in &mut select {
            *word = read_i32(r)?;
        }
        let func_len = read_i32(r)?;
        let lib_len = read_i32(r)?;
        let class_len = read_i32(r)?;
        let name_len = read_i32(r)?;
        let position = read_i32(r)?;
        let parallel_position = read_i32(r)?;
        let func = read_string(r, func_len)?;
        let lib = read_string(r, lib_len)?;
        let class = read_string(r, class_len)?;
        let name = read_string(r, name_len)?.unwrap_or_default();

        let result = StationConfig::from_raw(
            flow,
            user,
            restore,
            block,
            prescale,
            cue,
            select_mode,
            select,
            func,
            lib,
            class,
        )
        .and_then(|config| {
            self.system
                .create_station(&name, config, position, parallel_position)
        });
        match result {
            Ok(id) => {
                write_i32(w, OK)?;
                write_i32(w, id)?;
            }
            Err(err) => {
                write_i32(w, err.code())?;
                write_i32(w, -1)?;
            }
        }
        w.flush()
    }

    fn station_attach<R: Read, W: Write>(&mut self, r: &mut R, w: &mut W) -> io::Result<()> {
        let station_id = read_i32(r)?;
        let pid = read_i32(r)?;
        let host_len = read_i32(r)?;
        let host = read_string(r, host_len)?.unwrap_or_default();
        match self.system.attach(station_id, &host, pid) {
            Ok(att) => {
                write_i32(w, OK)?;
                write_i32(w, att.id())?;
                self.attachments.insert(att.id(), att);
            }
            Err(err) => {
                write_i32(w, err.code())?;
                write_i32(w, -1)?;
            }
        }
        w.flush()
    }

    fn station_detach<R: Read, W: Write>(&mut self, r: &mut R, w: &mut W) -> io::Result<()> {
        let att_id = read_i32(r)?;
        if let Some(att) = self.attachments.remove(&att_id) {
            if let Some(held) = self.held.remove(&att_id) {
                let events: Vec<Event> = held.into_values().collect();
                if let Err(err) = self.system.restore_events(&att, events) {
                    warn!(attachment = att_id, %err, "restore on detach failed");
                }
            }
            let _ = self.system.detach(att_id);
        }
        write_i32(w, OK)?;
        w.flush()
    }

    fn events_new<R: Read, W: Write>(&mut self, r: &mut R, w: &mut W) -> io::Result<()> {
        let att_id = read_i32(r)?;
        let mode = read_i32(r)?;
        let size = read_i64(r)?;
        let count = read_i32(r)?;
        let group = read_i32(r)?;
        let sec = read_i32(r)?;
        let nsec = read_i32(r)?;

        let result = self.session_attachment(att_id).and_then(|att| {
            let wait = WaitMode::from_wire(mode, sec, nsec)?;
            if count < 0 || size < 0 {
                return Err(TransportError::General("bad count or size".into()));
            }
            self.blocking_call(wait, |wait| {
                self.system
                    .new_events(&att, wait, count as usize, size as usize, group)
            })
        });
        match result {
            Ok(events) => {
                write_i32(w, events.len() as i32)?;
                for ev in &events {
                    write_i32(w, ev.id())?;
                }
                self.hold(att_id, events);
            }
            Err(err) => write_i32(w, err.code())?,
        }
        w.flush()
    }

    fn events_get<R: Read, W: Write>(&mut self, r: &mut R, w: &mut W) -> io::Result<()> {
        let att_id = read_i32(r)?;
        let wait_bits = read_i32(r)?;
        let modify_bits = read_i32(r)?;
        let count = read_i32(r)?;
        let sec = read_i32(r)?;
        let nsec = read_i32(r)?;
        let modify = Modify::from_mode(modify_bits);

        let result = self.session_attachment(att_id).and_then(|att| {
            let wait = WaitMode::from_wire(wait_bits, sec, nsec)?;
            if count < 0 {
                return Err(TransportError::General("bad count".into()));
            }
            self.blocking_call(wait, |wait| {
                self.system.get_events(&att, wait, modify, count as usize)
            })
            .map(|events| (att, events))
        });
        match result {
            Ok((att, events)) => {
                write_i32(w, events.len() as i32)?;
                let total: i64 = events
                    .iter()
                    .map(|ev| (WireEventHeader::SIZE + ev.length()) as i64)
                    .sum();
                write_i64(w, total)?;
                for ev in &events {
                    w.write_all(&WireEventHeader::from_event(ev).to_bytes())?;
                    w.write_all(ev.payload())?;
                }
                w.flush()?;
                // a reader that modifies nothing never holds events: they
                // continue downstream right away
                let (held, released): (Vec<Event>, Vec<Event>) = events
                    .into_iter()
                    .partition(|ev| ev.modify() != Modify::None);
                if !released.is_empty() {
                    if let Err(err) = self.system.put_events(&att, released) {
                        warn!(attachment = att_id, %err, "immediate put-back failed");
                    }
                }
                self.hold(att_id, held);
                Ok(())
            }
            Err(err) => {
                write_i32(w, err.code())?;
                w.flush()
            }
        }
    }

    fn events_put<R: Read, W: Write>(&mut self, r: &mut R, w: &mut W) -> io::Result<()> {
        let att_id = read_i32(r)?;
        let count = read_i32(r)?;
        let _total_bytes = read_i64(r)?;
        if count < 0 {
            return Err(io::Error::new(io::ErrorKind::InvalidData, "negative count"));
        }
        let mut entries: Vec<(WirePutHeader, Option<Vec<u8>>)> =
            Vec::with_capacity(count as usize);
        for _ in 0..count {
            let mut hbuf = [0u8; WirePutHeader::SIZE];
            r.read_exact(&mut hbuf)?;
            let header = WirePutHeader::from_bytes(&hbuf).ok_or_else(|| {
                io::Error::new(io::ErrorKind::InvalidData, "malformed put header")
            })?;
            let id = header.id.get();
            // whether payload bytes follow depends on how the event was
            // acquired; an unknown id means the framing cannot be trusted
            let wants_data = self
                .held
                .get(&att_id)
                .and_then(|m| m.get(&id))
                .map(|ev| ev.modify() == Modify::HeaderAndData);
            match wants_data {
                None => {
                    return Err(io::Error::new(
                        io::ErrorKind::InvalidData,
                        "put for an event not held by this connection",
                    ));
                }
                Some(true) => {
                    let len = header.length.get();
                    if len < 0 || len as usize > self.system.event_size() {
                        return Err(io::Error::new(
                            io::ErrorKind::InvalidData,
                            "event length out of range",
                        ));
                    }
                    let mut data = vec![0u8; len as usize];
                    r.read_exact(&mut data)?;
                    entries.push((header, Some(data)));
                }
                Some(false) => entries.push((header, None)),
            }
        }
        let code = match self.apply_put(att_id, entries) {
            Ok(()) => OK,
            Err(err) => err.code(),
        };
        write_i32(w, code)?;
        w.flush()
    }

    fn apply_put(
        &mut self,
        att_id: AttachmentId,
        entries: Vec<(WirePutHeader, Option<Vec<u8>>)>,
    ) -> Result<(), TransportError> {
        let att = self.session_attachment(att_id)?;
        let held = self.held.entry(att_id).or_default();
        let mut events = Vec::with_capacity(entries.len());
        for (header, data) in entries {
            let id = header.id.get();
            let mut ev = held
                .remove(&id)
                .ok_or_else(|| TransportError::General("event not held".into()))?;
            ev.set_length(header.length.get() as usize)?;
            let (priority, status) = unpack_pri_status(header.pri_and_status.get());
            ev.set_priority(priority);
            ev.set_data_status(status);
            ev.set_byte_order(header.byte_order.get());
            ev.set_control(header.control_words());
            if let Some(data) = data {
                ev.buffer_mut()[..data.len()].copy_from_slice(&data);
            }
            events.push(ev);
        }
        self.system.put_events(&att, events)
    }

    fn events_dump<R: Read, W: Write>(&mut self, r: &mut R, w: &mut W) -> io::Result<()> {
        let att_id = read_i32(r)?;
        let count = read_i32(r)?;
        if count < 0 {
            return Err(io::Error::new(io::ErrorKind::InvalidData, "negative count"));
        }
        let mut ids = Vec::with_capacity(count as usize);
        for _ in 0..count {
            ids.push(read_i32(r)?);
        }
        let code = match self.apply_dump(att_id, ids) {
            Ok(()) => OK,
            Err(err) => err.code(),
        };
        write_i32(w, code)?;
        w.flush()
    }

    fn apply_dump(&mut self, att_id: AttachmentId, ids: Vec<EventId>) -> Result<(), TransportError> {
        let att = self.session_attachment(att_id)?;
        let held = self.held.entry(att_id).or_default();
        if ids.iter().any(|id| !held.contains_key(id)) {
            return Err(TransportError::General("event not held".into()));
        }
        let mut events = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(ev) = held.remove(&id) {
                events.push(ev);
            }
        }
        self.system.dump_events(&att, events)
    }

    /// Put every held event back where its station's restore policy says,
    /// then detach everything this connection created.
    fn teardown(&mut self) {
        let att_ids: Vec<AttachmentId> = self.attachments.keys().copied().collect();
        for att_id in att_ids {
            if let Some(att) = self.attachments.remove(&att_id) {
                if let Some(held) = self.held.remove(&att_id) {
                    let events: Vec<Event> = held.into_values().collect();
                    if !events.is_empty() {
                        if let Err(err) = self.system.restore_events(&att, events) {
                            warn!(attachment = att_id, %err, "restore on teardown failed");
                        }
                    }
                }
                let _ = self.system.detach(att_id);
            }
        }
    }
}
