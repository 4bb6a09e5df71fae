//! The wire: protocol definitions, the server, the client proxy, and the
//! monitoring snapshot format.

pub mod client;
pub mod data;
pub mod protocol;
pub mod server;

pub use client::{AttachmentHandle, StationHandle, SystemClient};
pub use data::{AllData, AttachmentData, StationData, SystemData};
pub use protocol::{Command, WIRE_MAGIC, WIRE_VERSION};
pub use server::Server;
