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

//! Read a cluster's identity from its data directory.

use std::fs::{self, File};
use std::io::{self, Read};
use std::path::Path;

use tracing::debug;

use crate::archive_info::DbIdentity;
use crate::{Error, Result};

pub const PG_VERSION_FILENAME: &str = "PG_VERSION";
pub const PG_CONTROL_PATH: &str = "global/pg_control";

/// Read the major version and system identifier of the cluster in `db_path`.
///
/// The system identifier is the first eight bytes of `pg_control`, in the
/// byte order of the machine that wrote it, which is assumed little-endian.
pub fn db_identity(db_path: &Path) -> Result<DbIdentity> {
    let version_path = db_path.join(PG_VERSION_FILENAME);
    let version = fs::read_to_string(&version_path)
        .map_err(|source| open_error(&version_path, source))?
        .trim()
        .to_owned();
    if version.is_empty() || !version.chars().all(|c| c.is_ascii_digit() || c == '.') {
        return Err(Error::FileInvalid {
            path: version_path,
            message: format!("unexpected version string {version:?}"),
        });
    }

    let control_path = db_path.join(PG_CONTROL_PATH);
    let mut control = File::open(&control_path).map_err(|source| open_error(&control_path, source))?;
    let mut buf = [0u8; 8];
    control.read_exact(&mut buf).map_err(|source| {
        if source.kind() == io::ErrorKind::UnexpectedEof {
            Error::FileInvalid {
                path: control_path.clone(),
                message: "too short to hold a system identifier".to_owned(),
            }
        } else {
            Error::FileRead {
                path: control_path.clone(),
                source,
            }
        }
    })?;
    let system_id = u64::from_le_bytes(buf);
    debug!(?db_path, version, system_id, "Read database identity");
    Ok(DbIdentity { version, system_id })
}

fn open_error(path: &Path, source: io::Error) -> Error {
    if source.kind() == io::ErrorKind::NotFound {
        Error::FileMissing {
            path: path.to_owned(),
        }
    } else {
        Error::FileOpen {
            path: path.to_owned(),
            source,
        }
    }
}
