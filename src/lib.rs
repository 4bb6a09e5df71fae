//! # railyard
//!
//! A shared in-memory event broker for data-acquisition pipelines.
//!
//! Producers borrow fixed-size events from a free pool, fill them, and
//! publish them; a ring of stations wired in series and parallel carries the
//! events past consumers and back to the pool. The first station is always
//! GRAND_CENTRAL — it holds the free pool and closes the cycle.
//!
//! ## Pieces
//!
//! - [`Event`] - the unit of transport: a fixed-capacity buffer plus
//!   priority, control vector, group, and ownership metadata
//! - [`EventList`] - a priority-preserving queue with blocking reads and
//!   cooperative wakeup; every station has one per direction
//! - [`EventSystem`] - the registry: stations, attachments, conductors,
//!   the free pool
//! - [`Server`] / [`SystemClient`] - the framed TCP protocol and its
//!   blocking client proxy
//!
//! ## Example
//!
//! ```no_run
//! use railyard::prelude::*;
//!
//! fn main() -> railyard::Result<()> {
//!     let system = EventSystem::new(SystemConfig {
//!         num_events: 100,
//!         event_size: 512,
//!         ..SystemConfig::default()
//!     })?;
//!
//!     // a consumer station after GRAND_CENTRAL
//!     let station = system.create_station(
//!         "analyzer",
//!         StationConfig::default(),
//!         railyard::constants::END,
//!         railyard::constants::END,
//!     )?;
//!
//!     // a producer cycles events through the system
//!     let producer = system.attach(railyard::constants::GRAND_CENTRAL_ID, "localhost", -1)?;
//!     let mut fresh = system.new_events(&producer, WaitMode::Sleep, 10, 512, 0)?;
//!     for ev in &mut fresh {
//!         ev.buffer_mut()[0] = 0x2a;
//!         ev.set_length(1)?;
//!     }
//!     system.put_events(&producer, fresh)?;
//!
//!     // a consumer inspects them at the station
//!     let consumer = system.attach(station, "localhost", -1)?;
//!     let seen = system.get_events(&consumer, WaitMode::Sleep, Modify::None, 10)?;
//!     system.put_events(&consumer, seen)?;
//!
//!     system.close();
//!     Ok(())
//! }
//! ```

pub mod constants;
pub mod core;
pub mod errors;
pub mod network;

/// Prelude for convenient imports of the primary API types.
pub mod prelude {
    pub use crate::constants::{END, GRAND_CENTRAL, GRAND_CENTRAL_ID, NEW_HEAD};
    pub use crate::core::{
        Attachment, AttachmentId, BlockMode, DataStatus, Event, EventId, EventList, EventSystem,
        FlowMode, ListStats, Modify, Priority, RestoreMode, SelectMode, SelectRegistry, Station,
        StationConfig, StationId, SystemConfig, WaitMode,
    };
    pub use crate::errors::{Result, TransportError};
    pub use crate::network::{Server, SystemClient};
}

pub use crate::core::{
    Attachment, AttachmentId, BlockMode, DataStatus, Event, EventId, EventList, EventSystem,
    FlowMode, ListStats, Modify, Priority, RestoreMode, SelectMode, SelectRegistry, Station,
    StationConfig, StationId, SystemConfig, WaitMode,
};
pub use crate::errors::{Result, TransportError};
pub use crate::network::{AttachmentHandle, Server, StationHandle, SystemClient};
