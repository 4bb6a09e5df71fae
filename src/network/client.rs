//! Remote client: a blocking proxy that speaks the wire protocol to a
//! system somewhere else.
//!
//! Requests are serialized by `&mut self` — one in flight per connection,
//! which is what the server assumes. The socket carries a 2-second read
//! timeout; responses to calls that may park server-side (the data plane)
//! are polled through it so a dead server surfaces as an I/O failure rather
//! than a hang.

use std::io::{self, BufReader, BufWriter, Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::time::Duration;

use tracing::{debug, info};

use crate::constants::{END, OK, READ_TIMEOUT_MS, STATION_SELECT_INTS};
use crate::core::attachment::AttachmentId;
use crate::core::event::{unpack_pri_status, Event, Modify};
use crate::core::list::WaitMode;
use crate::core::station::{StationConfig, StationId};
use crate::errors::{Result, TransportError};
use crate::network::data::AllData;
use crate::network::protocol::{
    read_i32, read_i64, string_wire_len, write_i32, write_i64, write_string, Command,
    HandshakeReply, HandshakeRequest, WireEventHeader, WirePutHeader,
};

/// Client-side station handle. Poisoned (`usable = false`) when the server
/// reports the station is gone.
#[derive(Debug, Clone)]
pub struct StationHandle {
    pub id: StationId,
    pub name: String,
    usable: bool,
}

impl StationHandle {
    pub fn usable(&self) -> bool {
        self.usable
    }
}

/// Client-side attachment handle.
#[derive(Debug, Clone)]
pub struct AttachmentHandle {
    pub id: AttachmentId,
    pub station_id: StationId,
    usable: bool,
}

impl AttachmentHandle {
    pub fn usable(&self) -> bool {
        self.usable
    }
}

/// A connection to a remote event system.
#[derive(Debug)]
pub struct SystemClient {
    reader: BufReader<TcpStream>,
    writer: BufWriter<TcpStream>,
    num_events: usize,
    event_size: usize,
    open: bool,
}

impl SystemClient {
    /// Connect and run the handshake. Fails if the remote end runs a
    /// different protocol version or select-vector length.
    pub fn connect<A: ToSocketAddrs>(addr: A) -> Result<SystemClient> {
        let stream = TcpStream::connect(addr)?;
        stream.set_nodelay(true)?;
        stream.set_read_timeout(Some(Duration::from_millis(READ_TIMEOUT_MS)))?;
        let read_half = stream.try_clone()?;
        let mut reader = BufReader::with_capacity(65536, read_half);
        let mut writer = BufWriter::with_capacity(65536, stream);

        writer.write_all(&HandshakeRequest::new().to_bytes())?;
        writer.flush()?;
        let mut buf = [0u8; HandshakeReply::SIZE];
        reader.read_exact(&mut buf)?;
        let reply = HandshakeReply::from_bytes(&buf)
            .ok_or_else(|| TransportError::General("malformed handshake reply".into()))?;
        if reply.err.get() < OK {
            return Err(TransportError::from_code(reply.err.get(), -1));
        }
        if reply.version.get() != HandshakeRequest::new().version.get()
            || reply.select_ints.get() != STATION_SELECT_INTS as i32
        {
            return Err(TransportError::General(
                "remote system runs a different protocol version or select length".into(),
            ));
        }
        info!(
            num_events = reply.num_events.get(),
            event_size = reply.event_size.get(),
            "connected to event system"
        );
        Ok(SystemClient {
            reader,
            writer,
            num_events: reply.num_events.get() as usize,
            event_size: reply.event_size.get() as usize,
            open: true,
        })
    }

    pub fn num_events(&self) -> usize {
        self.num_events
    }

    pub fn event_size(&self) -> usize {
        self.event_size
    }

    fn ensure_open(&self) -> Result<()> {
        if !self.open {
            return Err(TransportError::Dead);
        }
        Ok(())
    }

    /// Read the leading response int of a call that may park server-side,
    /// riding out the socket timeout while the connection stays healthy.
    fn read_status_patiently(&mut self) -> Result<i32> {
        let mut buf = [0u8; 4];
        let mut filled = 0;
        while filled < 4 {
            match self.reader.read(&mut buf[filled..]) {
                Ok(0) => {
                    return Err(TransportError::Io(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "connection closed",
                    )))
                }
                Ok(n) => filled += n,
                Err(ref e)
                    if matches!(
                        e.kind(),
                        io::ErrorKind::WouldBlock
                            | io::ErrorKind::TimedOut
                            | io::ErrorKind::Interrupted
                    ) => {}
                Err(e) => return Err(TransportError::Io(e)),
            }
        }
        Ok(i32::from_be_bytes(buf))
    }

    /// Tell the system goodbye and drop the connection. Network failures
    /// here are logged and swallowed, matching the administrative contract.
    pub fn close(mut self) {
        let farewell = (|| -> Result<()> {
            write_i32(&mut self.writer, Command::Close as i32)?;
            self.writer.flush()?;
            read_i32(&mut self.reader)?;
            Ok(())
        })();
        if let Err(err) = farewell {
            debug!(%err, "close handshake failed");
        }
        self.open = false;
    }

    /// Is the remote system up? Network failure means no.
    pub fn alive(&mut self) -> bool {
        if self.ensure_open().is_err() {
            return false;
        }
        let answer = (|| -> Result<i32> {
            write_i32(&mut self.writer, Command::Alive as i32)?;
            self.writer.flush()?;
            Ok(read_i32(&mut self.reader)?)
        })();
        matches!(answer, Ok(1))
    }

    pub fn wake_up_attachment(&mut self, att: &AttachmentHandle) -> Result<()> {
        self.ensure_open()?;
        if !att.usable {
            return Err(TransportError::General("invalid attachment".into()));
        }
        write_i32(&mut self.writer, Command::WakeAttachment as i32)?;
        write_i32(&mut self.writer, att.id)?;
        self.writer.flush()?;
        Ok(())
    }

    pub fn wake_up_all(&mut self, station: &StationHandle) -> Result<()> {
        self.ensure_open()?;
        if !station.usable {
            return Err(TransportError::General("invalid station".into()));
        }
        write_i32(&mut self.writer, Command::WakeAll as i32)?;
        write_i32(&mut self.writer, station.id)?;
        self.writer.flush()?;
        Ok(())
    }

    /// Create a station at the end of the ring.
    pub fn create_station(&mut self, config: &StationConfig, name: &str) -> Result<StationHandle> {
        self.create_station_at(config, name, END, END)
    }

    /// Create a station at an explicit position (and parallel position).
    pub fn create_station_at(
        &mut self,
        config: &StationConfig,
        name: &str,
        position: i32,
        parallel_position: i32,
    ) -> Result<StationHandle> {
        self.ensure_open()?;
        config.check()?;

        write_i32(&mut self.writer, Command::StationCreateAt as i32)?;
        write_i32(&mut self.writer, OK)?; // struct_ok, unused here
        write_i32(&mut self.writer, config.flow_mode as i32)?;
        write_i32(&mut self.writer, config.user_mode)?;
        write_i32(&mut self.writer, config.restore_mode as i32)?;
        write_i32(&mut self.writer, config.block_mode as i32)?;
        write_i32(&mut self.writer, config.prescale as i32)?;
        let cue = config.cue.min(i32::MAX as usize) as i32;
        write_i32(&mut self.writer, cue)?;
        write_i32(&mut self.writer, config.select_mode as i32)?;
        for word in &config.select {
            write_i32(&mut self.writer, *word)?;
        }
        write_i32(
            &mut self.writer,
            string_wire_len(config.select_function.as_deref()),
        )?;
        write_i32(
            &mut self.writer,
            string_wire_len(config.select_library.as_deref()),
        )?;
        write_i32(
            &mut self.writer,
            string_wire_len(config.select_class.as_deref()),
        )?;
        write_i32(&mut self.writer, string_wire_len(Some(name)))?;
        write_i32(&mut self.writer, position)?;
        write_i32(&mut self.writer, parallel_position)?;
        if let Some(func) = &config.select_function {
            write_string(&mut self.writer, func)?;
        }
        if let Some(lib) = &config.select_library {
            write_string(&mut self.writer, lib)?;
        }
        if let Some(class) = &config.select_class {
            write_string(&mut self.writer, class)?;
        }
        write_string(&mut self.writer, name)?;
        self.writer.flush()?;

        let err = read_i32(&mut self.reader)?;
        let id = read_i32(&mut self.reader)?;
        if err < OK {
            return Err(TransportError::from_code(err, -1));
        }
        Ok(StationHandle {
            id,
            name: name.to_string(),
            usable: true,
        })
    }

    pub fn remove_station(&mut self, station: &mut StationHandle) -> Result<()> {
        self.ensure_open()?;
        if !station.usable {
            return Err(TransportError::General("invalid station".into()));
        }
        write_i32(&mut self.writer, Command::StationRemove as i32)?;
        write_i32(&mut self.writer, station.id)?;
        self.writer.flush()?;
        let err = read_i32(&mut self.reader)?;
        if err < OK {
            return Err(TransportError::from_code(err, -1));
        }
        station.usable = false;
        Ok(())
    }

    pub fn set_station_position(
        &mut self,
        station: &mut StationHandle,
        position: i32,
        parallel_position: i32,
    ) -> Result<()> {
        self.ensure_open()?;
        if !station.usable {
            return Err(TransportError::General("invalid station".into()));
        }
        write_i32(&mut self.writer, Command::StationSetPosition as i32)?;
        write_i32(&mut self.writer, station.id)?;
        write_i32(&mut self.writer, position)?;
        write_i32(&mut self.writer, parallel_position)?;
        self.writer.flush()?;
        let err = read_i32(&mut self.reader)?;
        if err < OK {
            station.usable = false;
            return Err(TransportError::from_code(err, -1));
        }
        Ok(())
    }

    /// (position, parallel_position) of a station in the remote ring.
    pub fn station_position(&mut self, station: &mut StationHandle) -> Result<(i32, i32)> {
        self.ensure_open()?;
        if !station.usable {
            return Err(TransportError::General("invalid station".into()));
        }
        write_i32(&mut self.writer, Command::StationGetPosition as i32)?;
        write_i32(&mut self.writer, station.id)?;
        self.writer.flush()?;
        let err = read_i32(&mut self.reader)?;
        let position = read_i32(&mut self.reader)?;
        let parallel_position = read_i32(&mut self.reader)?;
        if err < OK {
            station.usable = false;
            return Err(TransportError::from_code(err, -1));
        }
        Ok((position, parallel_position))
    }

    /// Does a station with this name exist? Returns its id if so.
    pub fn station_exists(&mut self, name: &str) -> Result<Option<StationId>> {
        self.ensure_open()?;
        write_i32(&mut self.writer, Command::StationExists as i32)?;
        write_i32(&mut self.writer, string_wire_len(Some(name)))?;
        write_string(&mut self.writer, name)?;
        self.writer.flush()?;
        let exists = read_i32(&mut self.reader)?;
        let id = read_i32(&mut self.reader)?;
        Ok(if exists == 1 { Some(id) } else { None })
    }

    /// Fetch a handle for an existing station by name.
    pub fn station_named(&mut self, name: &str) -> Result<StationHandle> {
        match self.station_exists(name)? {
            Some(id) => Ok(StationHandle {
                id,
                name: name.to_string(),
                usable: true,
            }),
            None => Err(TransportError::General(format!(
                "station {name} does not exist"
            ))),
        }
    }

    /// Attach to a station.
    pub fn attach(&mut self, station: &mut StationHandle) -> Result<AttachmentHandle> {
        self.ensure_open()?;
        if !station.usable {
            return Err(TransportError::General("invalid station".into()));
        }
        let host = std::env::var("HOSTNAME").unwrap_or_else(|_| "unknown".to_string());
        write_i32(&mut self.writer, Command::StationAttach as i32)?;
        write_i32(&mut self.writer, station.id)?;
        write_i32(&mut self.writer, -1)?; // no native pid to report
        write_i32(&mut self.writer, string_wire_len(Some(&host)))?;
        write_string(&mut self.writer, &host)?;
        self.writer.flush()?;
        let err = read_i32(&mut self.reader)?;
        let att_id = read_i32(&mut self.reader)?;
        if err < OK {
            if err == crate::constants::ERROR {
                station.usable = false;
            }
            return Err(TransportError::from_code(err, -1));
        }
        Ok(AttachmentHandle {
            id: att_id,
            station_id: station.id,
            usable: true,
        })
    }

    /// Detach. The server restores any events still checked out to the
    /// attachment before letting it go.
    pub fn detach(&mut self, att: &mut AttachmentHandle) -> Result<()> {
        self.ensure_open()?;
        if !att.usable {
            return Err(TransportError::General("invalid attachment".into()));
        }
        write_i32(&mut self.writer, Command::StationDetach as i32)?;
        write_i32(&mut self.writer, att.id)?;
        self.writer.flush()?;
        read_i32(&mut self.reader)?;
        att.usable = false;
        Ok(())
    }

    pub fn is_attached(
        &mut self,
        station: &mut StationHandle,
        att: &AttachmentHandle,
    ) -> Result<bool> {
        self.ensure_open()?;
        if !station.usable || !att.usable {
            return Err(TransportError::General("invalid station or attachment".into()));
        }
        write_i32(&mut self.writer, Command::StationIsAttached as i32)?;
        write_i32(&mut self.writer, station.id)?;
        write_i32(&mut self.writer, att.id)?;
        self.writer.flush()?;
        let err = read_i32(&mut self.reader)?;
        if err < OK {
            station.usable = false;
            return Err(TransportError::from_code(err, att.id));
        }
        Ok(err == 1)
    }

    /// Borrow fresh events from the free pool. `group` 0 means any group.
    /// The returned events are empty, owned by the attachment, and fully
    /// modifiable.
    pub fn new_events(
        &mut self,
        att: &AttachmentHandle,
        mode: WaitMode,
        count: usize,
        size: usize,
        group: i32,
    ) -> Result<Vec<Event>> {
        self.ensure_open()?;
        if !att.usable {
            return Err(TransportError::General("invalid attachment".into()));
        }
        if count == 0 {
            return Ok(Vec::new());
        }
        if size == 0 || size > self.event_size {
            return Err(TransportError::General("bad size argument".into()));
        }
        let (mode_bits, sec, nsec) = mode.as_wire();
        write_i32(&mut self.writer, Command::EventsNewGroup as i32)?;
        write_i32(&mut self.writer, att.id)?;
        write_i32(&mut self.writer, mode_bits)?;
        write_i64(&mut self.writer, size as i64)?;
        write_i32(&mut self.writer, count as i32)?;
        write_i32(&mut self.writer, group)?;
        write_i32(&mut self.writer, sec)?;
        write_i32(&mut self.writer, nsec)?;
        self.writer.flush()?;

        let status = self.read_status_patiently()?;
        if status < OK {
            return Err(TransportError::from_code(status, att.id));
        }
        let mut events = Vec::with_capacity(status as usize);
        for _ in 0..status {
            let id = read_i32(&mut self.reader)?;
            let mut ev = Event::new(id, self.event_size, 0);
            ev.set_owner(att.id);
            ev.set_modify(Modify::HeaderAndData);
            events.push(ev);
        }
        Ok(events)
    }

    /// Read events from the attachment's station for processing. `modify`
    /// declares what will change; it decides what travels back on put.
    pub fn get_events(
        &mut self,
        att: &AttachmentHandle,
        mode: WaitMode,
        modify: Modify,
        count: usize,
    ) -> Result<Vec<Event>> {
        self.ensure_open()?;
        if !att.usable {
            return Err(TransportError::General("invalid attachment".into()));
        }
        if count == 0 {
            return Ok(Vec::new());
        }
        let (mode_bits, sec, nsec) = mode.as_wire();
        write_i32(&mut self.writer, Command::EventsGet as i32)?;
        write_i32(&mut self.writer, att.id)?;
        write_i32(&mut self.writer, mode_bits)?;
        write_i32(&mut self.writer, modify.as_mode_bits())?;
        write_i32(&mut self.writer, count as i32)?;
        write_i32(&mut self.writer, sec)?;
        write_i32(&mut self.writer, nsec)?;
        self.writer.flush()?;

        let status = self.read_status_patiently()?;
        if status < OK {
            return Err(TransportError::from_code(status, att.id));
        }
        let _total_size = read_i64(&mut self.reader)?;
        let mut events = Vec::with_capacity(status as usize);
        for _ in 0..status {
            let mut hbuf = [0u8; WireEventHeader::SIZE];
            self.reader.read_exact(&mut hbuf)?;
            let header = WireEventHeader::from_bytes(&hbuf)
                .ok_or_else(|| TransportError::General("malformed event header".into()))?;
            let length = header.length.get();
            if length < 0 || length as usize > self.event_size {
                return Err(TransportError::General("event length out of range".into()));
            }
            let mut ev = Event::new(header.id.get(), self.event_size, 0);
            self.reader
                .read_exact(&mut ev.buffer_mut()[..length as usize])?;
            ev.set_length(length as usize)?;
            let (priority, status_bits) = unpack_pri_status(header.pri_and_status.get());
            ev.set_priority(priority);
            ev.set_data_status(status_bits);
            ev.set_byte_order(header.byte_order.get());
            ev.set_control(header.control_words());
            ev.set_owner(att.id);
            ev.set_modify(modify);
            events.push(ev);
        }
        Ok(events)
    }

    /// Publish events back into the flow. Only events acquired with a modify
    /// intent travel; the server already re-homed the rest.
    pub fn put_events(&mut self, att: &AttachmentHandle, events: Vec<Event>) -> Result<()> {
        self.ensure_open()?;
        if !att.usable {
            return Err(TransportError::General("invalid attachment".into()));
        }
        for ev in &events {
            if ev.owner() != att.id {
                return Err(TransportError::General(
                    "may not put events, not owner".into(),
                ));
            }
        }
        let travelers: Vec<&Event> = events
            .iter()
            .filter(|ev| ev.modify() != Modify::None)
            .collect();
        let total: i64 = travelers
            .iter()
            .map(|ev| {
                let mut bytes = WirePutHeader::SIZE as i64;
                if ev.modify() == Modify::HeaderAndData {
                    bytes += ev.length() as i64;
                }
                bytes
            })
            .sum();
        write_i32(&mut self.writer, Command::EventsPut as i32)?;
        write_i32(&mut self.writer, att.id)?;
        write_i32(&mut self.writer, travelers.len() as i32)?;
        write_i64(&mut self.writer, total)?;
        for ev in travelers {
            self.writer
                .write_all(&WirePutHeader::from_event(ev).to_bytes())?;
            if ev.modify() == Modify::HeaderAndData {
                self.writer.write_all(ev.payload())?;
            }
        }
        self.writer.flush()?;
        read_i32(&mut self.reader)?;
        Ok(())
    }

    /// Throw events away; the server recycles them into the free pool.
    pub fn dump_events(&mut self, att: &AttachmentHandle, events: Vec<Event>) -> Result<()> {
        self.ensure_open()?;
        if !att.usable {
            return Err(TransportError::General("invalid attachment".into()));
        }
        for ev in &events {
            if ev.owner() != att.id {
                return Err(TransportError::General(
                    "may not dump events, not owner".into(),
                ));
            }
        }
        let ids: Vec<i32> = events
            .iter()
            .filter(|ev| ev.modify() != Modify::None)
            .map(|ev| ev.id())
            .collect();
        write_i32(&mut self.writer, Command::EventsDump as i32)?;
        write_i32(&mut self.writer, att.id)?;
        write_i32(&mut self.writer, ids.len() as i32)?;
        for id in ids {
            write_i32(&mut self.writer, id)?;
        }
        self.writer.flush()?;
        read_i32(&mut self.reader)?;
        Ok(())
    }

    fn int_query(&mut self, cmd: Command) -> Result<i32> {
        self.ensure_open()?;
        write_i32(&mut self.writer, cmd as i32)?;
        self.writer.flush()?;
        read_i32(&mut self.reader)?; // status, always ok for these
        Ok(read_i32(&mut self.reader)?)
    }

    pub fn num_stations(&mut self) -> Result<i32> {
        self.int_query(Command::SysStations)
    }

    pub fn stations_max(&mut self) -> Result<i32> {
        self.int_query(Command::SysStationsMax)
    }

    pub fn num_attachments(&mut self) -> Result<i32> {
        self.int_query(Command::SysAttachments)
    }

    pub fn attachments_max(&mut self) -> Result<i32> {
        self.int_query(Command::SysAttachmentsMax)
    }

    pub fn num_processes(&mut self) -> Result<i32> {
        self.int_query(Command::SysProcesses)
    }

    pub fn processes_max(&mut self) -> Result<i32> {
        self.int_query(Command::SysProcessesMax)
    }

    pub fn num_temps(&mut self) -> Result<i32> {
        self.int_query(Command::SysTemps)
    }

    pub fn temps_max(&mut self) -> Result<i32> {
        self.int_query(Command::SysTempsMax)
    }

    pub fn system_heartbeat(&mut self) -> Result<i32> {
        self.int_query(Command::SysHeartbeat)
    }

    pub fn system_pid(&mut self) -> Result<i32> {
        self.int_query(Command::SysPid)
    }

    /// Full monitoring snapshot.
    pub fn data(&mut self) -> Result<AllData> {
        self.ensure_open()?;
        write_i32(&mut self.writer, Command::SysData as i32)?;
        self.writer.flush()?;
        let err = read_i32(&mut self.reader)?;
        if err != OK {
            return Err(TransportError::from_code(err, -1));
        }
        let _total_size = read_i32(&mut self.reader)?;
        Ok(AllData::decode(&mut self.reader)?)
    }

    /// Free-pool depth histogram: bucket `i` counts the `new_events`
    /// requests that found `i` events in GRAND_CENTRAL's input list.
    pub fn histogram(&mut self) -> Result<Vec<i32>> {
        self.ensure_open()?;
        write_i32(&mut self.writer, Command::SysHistogram as i32)?;
        self.writer.flush()?;
        let err = read_i32(&mut self.reader)?;
        if err != OK {
            return Err(TransportError::from_code(err, -1));
        }
        let mut hist = Vec::with_capacity(self.num_events + 1);
        for _ in 0..=self.num_events {
            hist.push(read_i32(&mut self.reader)?);
        }
        Ok(hist)
    }
}
