//! Stations: named nodes in the ring, each with a config, a select
//! predicate, an input list, an output list, and a set of attachments.

use std::sync::atomic::AtomicUsize;
use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::constants::STATION_SELECT_INTS;
use crate::core::attachment::AttachmentId;
use crate::core::event::Event;
use crate::core::list::EventList;
use crate::core::select::SelectRegistry;
use crate::errors::{Result, TransportError};

pub type StationId = i32;

/// Serial stations occupy a ring slot alone; parallel stations share one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum FlowMode {
    Serial = 0,
    Parallel = 1,
}

impl FlowMode {
    pub fn from_i32(v: i32) -> Option<Self> {
        match v {
            0 => Some(FlowMode::Serial),
            1 => Some(FlowMode::Parallel),
            _ => None,
        }
    }
}

/// Whether the cue limit is enforced by flowing events past the station.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum BlockMode {
    Blocking = 1,
    NonBlocking = 2,
}

impl BlockMode {
    pub fn from_i32(v: i32) -> Option<Self> {
        match v {
            1 => Some(BlockMode::Blocking),
            2 => Some(BlockMode::NonBlocking),
            _ => None,
        }
    }
}

/// How a station decides which events it accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum SelectMode {
    All = 1,
    Match = 2,
    User = 3,
    RoundRobin = 4,
    EqualCue = 5,
}

impl SelectMode {
    pub fn from_i32(v: i32) -> Option<Self> {
        match v {
            1 => Some(SelectMode::All),
            2 => Some(SelectMode::Match),
            3 => Some(SelectMode::User),
            4 => Some(SelectMode::RoundRobin),
            5 => Some(SelectMode::EqualCue),
            _ => None,
        }
    }
}

/// Where events go when their holder dies or a group redistributes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum RestoreMode {
    /// Back into this station's input list, ahead of its peers.
    ToStation = 0,
    /// Into the upstream ring entry's output list, to be conducted again.
    ToInput = 1,
    /// Back to the free pool.
    ToGrandCentral = 2,
    /// Re-offered to the parallel group for fresh distribution.
    Redistribute = 3,
}

impl RestoreMode {
    pub fn from_i32(v: i32) -> Option<Self> {
        match v {
            0 => Some(RestoreMode::ToStation),
            1 => Some(RestoreMode::ToInput),
            2 => Some(RestoreMode::ToGrandCentral),
            3 => Some(RestoreMode::Redistribute),
            _ => None,
        }
    }
}

/// Everything a station needs to know about itself, fixed at creation.
#[derive(Debug, Clone, PartialEq)]
pub struct StationConfig {
    pub flow_mode: FlowMode,
    pub block_mode: BlockMode,
    pub select_mode: SelectMode,
    pub restore_mode: RestoreMode,
    /// Maximum attachments allowed; 0 means unlimited.
    pub user_mode: i32,
    /// Accept one of every `prescale` passing events. Must be ≥ 1.
    pub prescale: u64,
    /// Advisory input-list length limit; clamped to the pool size at create.
    pub cue: usize,
    pub select: [i32; STATION_SELECT_INTS],
    /// Named user predicate, required when `select_mode` is `User`.
    pub select_function: Option<String>,
    /// Library and class hints carried for native hosts; unused here.
    pub select_library: Option<String>,
    pub select_class: Option<String>,
}

impl Default for StationConfig {
    fn default() -> Self {
        StationConfig {
            flow_mode: FlowMode::Serial,
            block_mode: BlockMode::Blocking,
            select_mode: SelectMode::All,
            restore_mode: RestoreMode::ToStation,
            user_mode: 0,
            prescale: 1,
            cue: usize::MAX,
            select: [0; STATION_SELECT_INTS],
            select_function: None,
            select_library: None,
            select_class: None,
        }
    }
}

impl StationConfig {
    /// Decode the wire form of a station configuration.
    #[allow(clippy::too_many_arguments)]
    pub fn from_raw(
        flow: i32,
        user: i32,
        restore: i32,
        block: i32,
        prescale: i32,
        cue: i32,
        select_mode: i32,
        select: [i32; STATION_SELECT_INTS],
        select_function: Option<String>,
        select_library: Option<String>,
        select_class: Option<String>,
    ) -> Result<StationConfig> {
        let bad = |what: &str| TransportError::General(format!("bad station config: {what}"));
        if prescale < 1 {
            return Err(bad("prescale"));
        }
        if cue < 0 {
            return Err(bad("cue"));
        }
        if user < 0 {
            return Err(bad("user mode"));
        }
        Ok(StationConfig {
            flow_mode: FlowMode::from_i32(flow).ok_or_else(|| bad("flow mode"))?,
            block_mode: BlockMode::from_i32(block).ok_or_else(|| bad("block mode"))?,
            select_mode: SelectMode::from_i32(select_mode).ok_or_else(|| bad("select mode"))?,
            restore_mode: RestoreMode::from_i32(restore).ok_or_else(|| bad("restore mode"))?,
            user_mode: user,
            prescale: prescale as u64,
            cue: cue as usize,
            select,
            select_function,
            select_library,
            select_class,
        })
    }

    /// Self-consistency rules, enforced at create and move.
    pub fn check(&self) -> Result<()> {
        if self.select_mode == SelectMode::User && self.select_function.is_none() {
            return Err(TransportError::General(
                "station config needs a select function name".into(),
            ));
        }
        if matches!(self.select_mode, SelectMode::RoundRobin | SelectMode::EqualCue)
            && (self.flow_mode != FlowMode::Parallel
                || self.block_mode != BlockMode::Blocking
                || self.restore_mode == RestoreMode::ToInput
                || self.prescale != 1)
        {
            return Err(TransportError::General(
                "round-robin/equal-cue stations must be parallel, blocking, \
                 prescale 1, and must not restore to input"
                    .into(),
            ));
        }
        if self.restore_mode == RestoreMode::Redistribute && self.flow_mode != FlowMode::Parallel {
            return Err(TransportError::General(
                "redistribute restore requires a parallel station".into(),
            ));
        }
        if self.prescale < 1 {
            return Err(TransportError::General("prescale must be at least 1".into()));
        }
        Ok(())
    }

    /// Can a station with this config join a group led by `head`?
    /// Group heads with a distribution or user policy demand the same mode,
    /// and user predicates must also agree on the select vector.
    pub fn compatible_with(&self, head: &StationConfig) -> bool {
        match head.select_mode {
            SelectMode::RoundRobin | SelectMode::EqualCue => self.select_mode == head.select_mode,
            SelectMode::User => {
                self.select_mode == head.select_mode && self.select == head.select
            }
            _ => true,
        }
    }
}

/// One station. Lists are public: the conductor and the system move events
/// through them directly.
#[derive(Debug)]
pub struct Station {
    id: StationId,
    name: String,
    config: StationConfig,
    pub input: EventList,
    pub output: EventList,
    attachments: Mutex<Vec<AttachmentId>>,
    /// Rotation pointer used when this station heads a round-robin group.
    pub(crate) rrobin_cursor: AtomicUsize,
}

impl Station {
    pub fn new(id: StationId, name: String, config: StationConfig) -> Station {
        Station {
            id,
            name,
            config,
            input: EventList::new(),
            output: EventList::new(),
            attachments: Mutex::new(Vec::new()),
            rrobin_cursor: AtomicUsize::new(0),
        }
    }

    #[inline(always)]
    pub fn id(&self) -> StationId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &StationConfig {
        &self.config
    }

    fn attachments_lock(&self) -> MutexGuard<'_, Vec<AttachmentId>> {
        self.attachments.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn attachment_ids(&self) -> Vec<AttachmentId> {
        self.attachments_lock().clone()
    }

    pub fn attachment_count(&self) -> usize {
        self.attachments_lock().len()
    }

    pub fn has_attachment(&self, id: AttachmentId) -> bool {
        self.attachments_lock().contains(&id)
    }

    pub(crate) fn add_attachment(&self, id: AttachmentId) {
        self.attachments_lock().push(id);
    }

    pub(crate) fn remove_attachment(&self, id: AttachmentId) {
        self.attachments_lock().retain(|a| *a != id);
    }

    /// Does this station's predicate pass the event? Group distribution and
    /// prescale/cue bookkeeping happen in the conductor; this is selection
    /// alone. Round-robin and equal-cue stations admit everything — the
    /// group policy decides placement, not acceptance.
    pub fn selects(&self, event: &Event, registry: &SelectRegistry) -> bool {
        match self.config.select_mode {
            SelectMode::All | SelectMode::RoundRobin | SelectMode::EqualCue => true,
            SelectMode::Match => {
                crate::core::select::select_matches(&self.config.select, event.control())
            }
            SelectMode::User => match &self.config.select_function {
                Some(name) => registry.eval(name, event, &self.config),
                None => false,
            },
        }
    }

    /// Close both lists; used at station removal and system shutdown.
    pub(crate) fn close_lists(&self) {
        self.input.close();
        self.output.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_rejects_user_select_without_function() {
        let config = StationConfig {
            select_mode: SelectMode::User,
            ..StationConfig::default()
        };
        assert!(config.check().is_err());
    }

    #[test]
    fn test_config_rejects_serial_round_robin() {
        let config = StationConfig {
            select_mode: SelectMode::RoundRobin,
            flow_mode: FlowMode::Serial,
            ..StationConfig::default()
        };
        assert!(config.check().is_err());
    }

    #[test]
    fn test_config_rejects_round_robin_with_prescale() {
        let config = StationConfig {
            select_mode: SelectMode::RoundRobin,
            flow_mode: FlowMode::Parallel,
            prescale: 2,
            ..StationConfig::default()
        };
        assert!(config.check().is_err());
    }

    #[test]
    fn test_config_rejects_serial_redistribute() {
        let config = StationConfig {
            restore_mode: RestoreMode::Redistribute,
            ..StationConfig::default()
        };
        assert!(config.check().is_err());
    }

    #[test]
    fn test_round_robin_group_compatibility() {
        let head = StationConfig {
            select_mode: SelectMode::RoundRobin,
            flow_mode: FlowMode::Parallel,
            ..StationConfig::default()
        };
        let same = head.clone();
        assert!(same.compatible_with(&head));
        let other = StationConfig {
            select_mode: SelectMode::EqualCue,
            flow_mode: FlowMode::Parallel,
            ..StationConfig::default()
        };
        assert!(!other.compatible_with(&head));
    }

    #[test]
    fn test_from_raw_rejects_garbage() {
        let select = [0; STATION_SELECT_INTS];
        assert!(StationConfig::from_raw(9, 0, 0, 1, 1, 10, 1, select, None, None, None).is_err());
        assert!(StationConfig::from_raw(0, 0, 0, 1, 0, 10, 1, select, None, None, None).is_err());
        assert!(StationConfig::from_raw(0, 0, 0, 1, 1, -2, 1, select, None, None, None).is_err());
    }
}
