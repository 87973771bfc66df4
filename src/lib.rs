// pgvault: PostgreSQL WAL archive and backup agent.
// Copyright 2015-2025 Martin Pool.

// This program is free software; you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation; either version 2 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.

//! pgvault: archive PostgreSQL WAL segments and copy backup files through
//! local or remote worker processes.
//!
//! A controller process starts one or more workers, either as local
//! subprocesses or over ssh, and talks to each through a [Session]. Workers
//! run a [Worker] loop that executes filesystem and archive commands and
//! replies with one result line per command.

pub mod archive_check;
pub mod archive_info;
pub mod checksum;
pub mod compress;
pub mod config;
pub mod controller;
pub mod db_info;
pub mod errors;
pub mod file_copy;
pub mod fileops;
mod io;
mod jsonio;
pub mod kind;
mod misc;
pub mod owner;
pub mod protocol;
pub mod remote;
pub mod stanza;
pub mod stats;
pub mod test_fixtures;
pub mod transport;
pub mod ui;
pub mod unix_mode;
pub mod wal;
pub mod work_group;
pub mod worker;

pub use crate::archive_check::{ArchiveCheck, GetCheck, PushCheck};
pub use crate::archive_info::{ArchiveInfo, DbIdentity};
pub use crate::checksum::Checksum;
pub use crate::config::Config;
pub use crate::controller::{CancelToken, Controller};
pub use crate::errors::{Error, ErrorCode, RemoteError, Result, Severity};
pub use crate::file_copy::{CopyOptions, CopyResult, Dest, Source};
pub use crate::kind::Kind;
pub use crate::misc::bytes_to_human_mb;
pub use crate::protocol::command::Command;
pub use crate::protocol::session::{Session, SessionOptions};
pub use crate::remote::Remote;
pub use crate::stats::CopyStats;
pub use crate::transport::Transport;
pub use crate::unix_mode::UnixMode;
pub use crate::wal::WalSegment;
pub use crate::work_group::{WorkItem, WorkerGroup};
pub use crate::worker::Worker;

/// Product name sent in the protocol greeting.
pub const PRODUCT_NAME: &str = "pgvault";

/// Version of this program, which is also the protocol version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Temporary files in the repository have this prefix until they are
/// renamed into place.
const TMP_PREFIX: &str = "tmp";

/// Default size of blocks read from files and sent over the wire.
pub const DEFAULT_BUFFER_SIZE: usize = 4 << 20;
