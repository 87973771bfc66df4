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

//! Read and write JSON files.

use std::fs;
use std::io::{self, Write};
use std::path::Path;

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::io::AtomicFile;
use crate::{Error, Result};

/// Serialize an object to a JSON line.
pub(crate) fn to_json_line<T: Serialize>(obj: &T) -> Result<String> {
    let mut s = to_json_string(obj)?;
    s.push('\n');
    Ok(s)
}

/// Serialize an object to JSON with no line break.
pub(crate) fn to_json_string<T: Serialize>(obj: &T) -> Result<String> {
    serde_json::to_string(obj).map_err(|source| Error::Assert {
        message: format!("failed to serialize JSON: {source}"),
    })
}

/// Write an object as JSON, atomically.
///
/// If `create_new` is true, fail with `AlreadyExists` if the file is present.
pub(crate) fn write_json<T: Serialize>(path: &Path, obj: &T, create_new: bool) -> Result<()> {
    let s = to_json_line(obj)?;
    let mut f = AtomicFile::new(path)?;
    f.write_all(s.as_bytes()).map_err(|source| Error::FileWrite {
        path: path.to_owned(),
        source,
    })?;
    if create_new {
        f.persist_noclobber()
    } else {
        f.persist(path)
    }
}

/// Read and deserialize a JSON file.
///
/// Returns `None` if the file does not exist.
pub(crate) fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<(T, Vec<u8>)>> {
    let bytes = match fs::read(path) {
        Ok(bytes) => bytes,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(source) => {
            return Err(Error::FileRead {
                path: path.to_owned(),
                source,
            })
        }
    };
    let obj = serde_json::from_slice(&bytes).map_err(|source| Error::Json {
        path: path.to_owned(),
        source,
    })?;
    Ok(Some((obj, bytes)))
}
