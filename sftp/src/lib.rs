//! SFTP (protocol version 3) client core.
//!
//! One [`Connection`] multiplexes any number of outstanding requests over a single ssh child
//! process. Work is expressed as cooperative [`Task`]s: synchronous state machines that emit
//! [`Instruction`]s (send a request, wait until the pipe drained, signal another task) and are
//! resumed by the event loop when something they wait for happens. Shared coordination (creating
//! a directory exactly once, bounding the number of open files) goes through [`collector`]s.
//!
//! # Wire format
//!
//! Frames are `u32 length | u8 type | payload`, big-endian throughout. [`wire`], [`attrs`] and
//! [`flags`] hold the primitives, [`request`] and [`answer`] the message catalog.
//!
//! # Logging
//!
//! - `sftp::wire` (TRACE): size of every frame sent and received
//! - `sftp::connection` (DEBUG): requests as they are queued and sent, decoded answers
//! - `sftp::collector` (DEBUG): lock and semaphore traffic between tasks
//!
//! # Errors
//!
//! Anything that leaves the stream in an unknown state (malformed data, an answer nobody asked
//! for, running out of request ids, the transport going away) is an [`Error`] and ends the
//! session. A failed operation (non-OK status) is not: tasks record it through
//! [`task::Context::record_failure`] and carry on.

pub mod answer;
pub mod attrs;
pub mod collector;
pub mod config;
pub mod connection;
pub mod error;
pub mod flags;
pub mod request;
pub mod status;
pub mod task;
pub mod transport;
pub mod wire;

#[cfg(test)]
mod testing;

pub use answer::{Answer, NameEntry, Version};
pub use attrs::FileAttributes;
pub use config::{OPEN_FILE_SEMAPHORE, SessionConfig};
pub use connection::{Connection, Core, Stats};
pub use error::Error;
pub use flags::{AttrFlags, OpenFlags, RenameFlags};
pub use request::{PacketType, Request};
pub use status::{Status, StatusCode};
pub use task::{CollectorKey, Context, Instruction, Instructions, Reply, Signal, Task, TaskId};
pub use transport::SshConfig;
pub use wire::WireError;
