//! The SYS_DATA snapshot: everything a monitoring client can ask about the
//! system in one request, with a symmetric reader on the client side.

use std::io::{self, Read, Write};

use crate::constants::STATION_SELECT_INTS;
use crate::core::list::ListStats;
use crate::core::station::{SelectMode, Station};
use crate::core::system::EventSystem;
use crate::network::protocol::{
    read_i32, read_i64, read_string, string_wire_len, write_i32, write_i64, write_string,
};

/// System-wide counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SystemData {
    pub num_events: i32,
    pub event_size: i64,
    pub stations: i32,
    pub stations_max: i32,
    pub attachments: i32,
    pub attachments_max: i32,
    pub processes: i32,
    pub processes_max: i32,
    pub temps: i32,
    pub temps_max: i32,
    pub heartbeat: i64,
    pub pid: i32,
}

impl SystemData {
    fn write_to<W: Write>(&self, w: &mut W) -> io::Result<()> {
        write_i32(w, self.num_events)?;
        write_i64(w, self.event_size)?;
        write_i32(w, self.stations)?;
        write_i32(w, self.stations_max)?;
        write_i32(w, self.attachments)?;
        write_i32(w, self.attachments_max)?;
        write_i32(w, self.processes)?;
        write_i32(w, self.processes_max)?;
        write_i32(w, self.temps)?;
        write_i32(w, self.temps_max)?;
        write_i64(w, self.heartbeat)?;
        write_i32(w, self.pid)
    }

    fn read_from<R: Read>(r: &mut R) -> io::Result<SystemData> {
        Ok(SystemData {
            num_events: read_i32(r)?,
            event_size: read_i64(r)?,
            stations: read_i32(r)?,
            stations_max: read_i32(r)?,
            attachments: read_i32(r)?,
            attachments_max: read_i32(r)?,
            processes: read_i32(r)?,
            processes_max: read_i32(r)?,
            temps: read_i32(r)?,
            temps_max: read_i32(r)?,
            heartbeat: read_i64(r)?,
            pid: read_i32(r)?,
        })
    }
}

/// One station's configuration, placement, lists and attachments.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StationData {
    pub id: i32,
    pub position: i32,
    pub parallel_position: i32,
    pub flow_mode: i32,
    pub block_mode: i32,
    pub select_mode: i32,
    pub restore_mode: i32,
    pub user_mode: i32,
    pub prescale: i32,
    pub cue: i32,
    pub select: [i32; STATION_SELECT_INTS],
    pub input: ListStatsData,
    pub output: ListStatsData,
    pub attachments: Vec<i32>,
    pub name: String,
    pub select_function: Option<String>,
}

/// List statistics as they travel.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ListStatsData {
    pub events_try: i64,
    pub events_in: i64,
    pub events_out: i64,
    pub length: i32,
}

impl From<ListStats> for ListStatsData {
    fn from(stats: ListStats) -> ListStatsData {
        ListStatsData {
            events_try: stats.events_try as i64,
            events_in: stats.events_in as i64,
            events_out: stats.events_out as i64,
            length: stats.length as i32,
        }
    }
}

impl ListStatsData {
    fn write_to<W: Write>(&self, w: &mut W) -> io::Result<()> {
        write_i64(w, self.events_try)?;
        write_i64(w, self.events_in)?;
        write_i64(w, self.events_out)?;
        write_i32(w, self.length)
    }

    fn read_from<R: Read>(r: &mut R) -> io::Result<ListStatsData> {
        Ok(ListStatsData {
            events_try: read_i64(r)?,
            events_in: read_i64(r)?,
            events_out: read_i64(r)?,
            length: read_i32(r)?,
        })
    }
}

impl StationData {
    fn write_to<W: Write>(&self, w: &mut W) -> io::Result<()> {
        write_i32(w, self.id)?;
        write_i32(w, self.position)?;
        write_i32(w, self.parallel_position)?;
        write_i32(w, self.flow_mode)?;
        write_i32(w, self.block_mode)?;
        write_i32(w, self.select_mode)?;
        write_i32(w, self.restore_mode)?;
        write_i32(w, self.user_mode)?;
        write_i32(w, self.prescale)?;
        write_i32(w, self.cue)?;
        for word in &self.select {
            write_i32(w, *word)?;
        }
        self.input.write_to(w)?;
        self.output.write_to(w)?;
        write_i32(w, self.attachments.len() as i32)?;
        for att in &self.attachments {
            write_i32(w, *att)?;
        }
        write_i32(w, string_wire_len(Some(&self.name)))?;
        write_i32(w, string_wire_len(self.select_function.as_deref()))?;
        write_string(w, &self.name)?;
        if let Some(func) = &self.select_function {
            write_string(w, func)?;
        }
        Ok(())
    }

    fn read_from<R: Read>(r: &mut R) -> io::Result<StationData> {
        let id = read_i32(r)?;
        let position = read_i32(r)?;
        let parallel_position = read_i32(r)?;
        let flow_mode = read_i32(r)?;
        let block_mode = read_i32(r)?;
        let select_mode = read_i32(r)?;
        let restore_mode = read_i32(r)?;
        let user_mode = read_i32(r)?;
        let prescale = read_i32(r)?;
        let cue = read_i32(r)?;
        let mut select = [0; STATION_SELECT_INTS];
        for word in &mut select {
            *word = read_i32(r)?;
        }
        let input = ListStatsData::read_from(r)?;
        let output = ListStatsData::read_from(r)?;
        let n_atts = read_i32(r)?;
        let mut attachments = Vec::with_capacity(n_atts.max(0) as usize);
        for _ in 0..n_atts {
            attachments.push(read_i32(r)?);
        }
        let name_len = read_i32(r)?;
        let func_len = read_i32(r)?;
        let name = read_string(r, name_len)?.unwrap_or_default();
        let select_function = read_string(r, func_len)?;
        Ok(StationData {
            id,
            position,
            parallel_position,
            flow_mode,
            block_mode,
            select_mode,
            restore_mode,
            user_mode,
            prescale,
            cue,
            select,
            input,
            output,
            attachments,
            name,
            select_function,
        })
    }
}

/// One attachment's identity and counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AttachmentData {
    pub id: i32,
    pub station_id: i32,
    pub pid: i32,
    pub waiting: i32,
    pub events_put: i64,
    pub events_get: i64,
    pub events_dump: i64,
    pub events_make: i64,
    pub host: String,
}

impl AttachmentData {
    fn write_to<W: Write>(&self, w: &mut W) -> io::Result<()> {
        write_i32(w, self.id)?;
        write_i32(w, self.station_id)?;
        write_i32(w, self.pid)?;
        write_i32(w, self.waiting)?;
        write_i64(w, self.events_put)?;
        write_i64(w, self.events_get)?;
        write_i64(w, self.events_dump)?;
        write_i64(w, self.events_make)?;
        write_i32(w, string_wire_len(Some(&self.host)))?;
        write_string(w, &self.host)
    }

    fn read_from<R: Read>(r: &mut R) -> io::Result<AttachmentData> {
        let id = read_i32(r)?;
        let station_id = read_i32(r)?;
        let pid = read_i32(r)?;
        let waiting = read_i32(r)?;
        let events_put = read_i64(r)?;
        let events_get = read_i64(r)?;
        let events_dump = read_i64(r)?;
        let events_make = read_i64(r)?;
        let host_len = read_i32(r)?;
        let host = read_string(r, host_len)?.unwrap_or_default();
        Ok(AttachmentData {
            id,
            station_id,
            pid,
            waiting,
            events_put,
            events_get,
            events_dump,
            events_make,
            host,
        })
    }
}

/// The whole snapshot. Process data is a native-host concept and always
/// empty here, but the section stays on the wire.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AllData {
    pub system: SystemData,
    pub stations: Vec<StationData>,
    pub attachments: Vec<AttachmentData>,
    pub processes: i32,
}

impl AllData {
    /// Gather the snapshot from a live system.
    pub fn collect(system: &EventSystem) -> AllData {
        let stations = system.stations();
        let station_data = stations
            .iter()
            .map(|station| {
                let (position, parallel_position) = system
                    .station_position(station.id())
                    .unwrap_or((-1, -1));
                Self::station_entry(station, position, parallel_position)
            })
            .collect();
        let attachment_data = system
            .attachments()
            .iter()
            .map(|att| AttachmentData {
                id: att.id(),
                station_id: att.station_id(),
                pid: att.pid(),
                waiting: att.is_waiting() as i32,
                events_put: att.events_put() as i64,
                events_get: att.events_get() as i64,
                events_dump: att.events_dump() as i64,
                events_make: att.events_make() as i64,
                host: att.host().to_string(),
            })
            .collect();
        AllData {
            system: SystemData {
                num_events: system.num_events() as i32,
                event_size: system.event_size() as i64,
                stations: system.station_count() as i32,
                stations_max: system.config().max_stations as i32,
                attachments: system.attachment_count() as i32,
                attachments_max: system.config().max_attachments as i32,
                processes: 0,
                processes_max: 0,
                temps: 0,
                temps_max: 0,
                heartbeat: system.heartbeat() as i64,
                pid: std::process::id() as i32,
            },
            stations: station_data,
            attachments: attachment_data,
            processes: 0,
        }
    }

    fn station_entry(station: &Station, position: i32, parallel_position: i32) -> StationData {
        let config = station.config();
        StationData {
            id: station.id(),
            position,
            parallel_position,
            flow_mode: config.flow_mode as i32,
            block_mode: config.block_mode as i32,
            select_mode: config.select_mode as i32,
            restore_mode: config.restore_mode as i32,
            user_mode: config.user_mode,
            prescale: config.prescale as i32,
            cue: config.cue.min(i32::MAX as usize) as i32,
            select: config.select,
            input: station.input.stats().into(),
            output: station.output.stats().into(),
            attachments: station.attachment_ids(),
            name: station.name().to_string(),
            select_function: if config.select_mode == SelectMode::User {
                config.select_function.clone()
            } else {
                None
            },
        }
    }

    /// Serialize the snapshot body (everything after the status and size).
    pub fn encode(&self) -> io::Result<Vec<u8>> {
        let mut buf = Vec::with_capacity(1024);
        self.system.write_to(&mut buf)?;
        write_i32(&mut buf, self.stations.len() as i32)?;
        for station in &self.stations {
            station.write_to(&mut buf)?;
        }
        write_i32(&mut buf, self.attachments.len() as i32)?;
        for att in &self.attachments {
            att.write_to(&mut buf)?;
        }
        write_i32(&mut buf, self.processes)?;
        Ok(buf)
    }

    /// Read the snapshot body back.
    pub fn decode<R: Read>(r: &mut R) -> io::Result<AllData> {
        let system = SystemData::read_from(r)?;
        let n_stations = read_i32(r)?;
        let mut stations = Vec::with_capacity(n_stations.max(0) as usize);
        for _ in 0..n_stations {
            stations.push(StationData::read_from(r)?);
        }
        let n_atts = read_i32(r)?;
        let mut attachments = Vec::with_capacity(n_atts.max(0) as usize);
        for _ in 0..n_atts {
            attachments.push(AttachmentData::read_from(r)?);
        }
        let processes = read_i32(r)?;
        Ok(AllData {
            system,
            stations,
            attachments,
            processes,
        })
    }
}
