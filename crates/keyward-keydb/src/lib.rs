//! Key record store.
//!
//! One [`record::KeyRecord`] per `.sdb` file in a flat directory. The
//! in-memory map is the source of truth while the daemon runs; every
//! mutation is persisted with a write-to-temp-then-rename before the
//! caller sees success.

use std::path::PathBuf;

pub mod record;
pub mod store;
mod wire;

pub use record::{AliveMessage, KeyRecord, PendingCommand, COMMAND_MOUNT, COMMAND_UMOUNT};
pub use store::KeyDb;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A record file exists but cannot be trusted. The server refuses to
    /// start rather than silently drop data.
    #[error("corrupt record file {path}: {detail}")]
    Corruption { path: PathBuf, detail: String },

    #[error("no record with uuid {uuid}")]
    UnknownUuid { uuid: String },

    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },
}

pub type Result<T> = std::result::Result<T, Error>;
