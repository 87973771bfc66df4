// pgvault: PostgreSQL WAL archive and backup agent.
// Copyright 2025 Martin Pool.

// This program is free software; you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation; either version 2 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.

//! Commands sent from the controller to a worker.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use strum_macros::IntoStaticStr;

use crate::checksum::Checksum;
use crate::file_copy::CopyOptions;
use crate::fileops::SortOrder;
use crate::unix_mode::UnixMode;
use crate::wal::WalSegment;
use crate::{Error, Result};

/// A request for a worker to do one thing.
///
/// Paths are interpreted on the worker's host and must be absolute.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, IntoStaticStr)]
#[serde(tag = "cmd", rename_all = "kebab-case", rename_all_fields = "kebab-case")]
#[strum(serialize_all = "kebab-case")]
pub enum Command {
    /// Copy between two paths on the worker's host.
    Copy {
        source: PathBuf,
        dest: PathBuf,
        #[serde(default)]
        options: CopyOptions,
    },
    /// Write a file from blocks sent by the controller.
    ///
    /// `options.source_compressed` says whether the blocks are gzip.
    CopyIn {
        dest: PathBuf,
        #[serde(default)]
        options: CopyOptions,
    },
    /// Send a file to the controller as blocks.
    ///
    /// If `pipe_level` is non-zero and the source is not already compressed,
    /// the blocks are gzip-compressed at that level.
    CopyOut {
        source: PathBuf,
        #[serde(default)]
        options: CopyOptions,
        #[serde(default)]
        pipe_level: u32,
    },
    List {
        path: PathBuf,
        #[serde(default)]
        expression: Option<String>,
        #[serde(default)]
        sort: SortOrder,
        #[serde(default)]
        ignore_missing: bool,
    },
    PathCreate {
        path: PathBuf,
        #[serde(default)]
        mode: Option<UnixMode>,
        #[serde(default)]
        ignore_exists: bool,
    },
    Exists {
        path: PathBuf,
    },
    /// Sleep until the next whole second.
    Wait,
    Manifest {
        path: PathBuf,
    },
    ArchivePushCheck {
        stanza: String,
        wal_segment: WalSegment,
        db_version: String,
        db_system_id: u64,
        #[serde(default)]
        checksum: Option<Checksum>,
    },
    ArchiveGetCheck {
        stanza: String,
        #[serde(default)]
        wal_segment: Option<WalSegment>,
        db_version: String,
        db_system_id: u64,
    },
    InfoListStanza {
        #[serde(default)]
        stanza: Option<String>,
    },
    /// Read the identity of the worker's database.
    DbInfo,
    Noop,
    Exit,
}

impl Command {
    /// The command's name on the wire.
    pub fn name(&self) -> &'static str {
        self.into()
    }
}

/// A request line as received by a worker.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Request {
    Command(Command),
    /// A well-formed request for a command this worker doesn't understand,
    /// or with invalid arguments.
    Unrecognized { cmd: String, message: String },
}

/// Parse a request line.
///
/// A line that's not a JSON object with a `cmd` string is a protocol error;
/// an object naming an unknown command is returned as
/// [Request::Unrecognized].
pub fn parse_request(line: &str) -> Result<Request> {
    let value: serde_json::Value = serde_json::from_str(line).map_err(|err| Error::Protocol {
        message: format!("invalid request {line:?}: {err}"),
    })?;
    let Some(cmd) = value.get("cmd").and_then(|c| c.as_str()).map(str::to_owned) else {
        return Err(Error::Protocol {
            message: format!("request has no command: {line:?}"),
        });
    };
    match serde_json::from_value::<Command>(value) {
        Ok(command) => Ok(Request::Command(command)),
        Err(err) => Ok(Request::Unrecognized {
            cmd,
            message: err.to_string(),
        }),
    }
}
