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

//! Summaries of the stanzas in a repository.

use std::fmt;
use std::fs;
use std::io;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::archive_check::{list_archived, list_stanzas};
use crate::archive_info::{ArchiveInfo, DbIdentity};
use crate::wal::stanza_archive_path;
use crate::{Error, Result};

/// What's archived for one stanza.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StanzaInfo {
    pub name: String,
    /// Current database identity, or None if the stanza has no archive info.
    pub db: Option<DbIdentity>,
    pub archive_id: Option<String>,
    /// Lowest and highest segments archived under the current archive id.
    pub min_wal: Option<String>,
    pub max_wal: Option<String>,
}

impl fmt::Display for StanzaInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "stanza: {}", self.name)?;
        match (&self.db, &self.archive_id) {
            (Some(db), Some(archive_id)) => {
                write!(
                    f,
                    "\n    db: version={} system-id={}\n    archive: {archive_id}",
                    db.version, db.system_id
                )?;
                match (&self.min_wal, &self.max_wal) {
                    (Some(min), Some(max)) => write!(f, " {min} .. {max}"),
                    _ => write!(f, " (empty)"),
                }
            }
            _ => write!(f, "\n    status: missing archive info"),
        }
    }
}

/// Describe one stanza, or every stanza in the repository.
pub fn info_list_stanza(repo_path: &Path, stanza: Option<&str>) -> Result<Vec<StanzaInfo>> {
    let names = match stanza {
        Some(name) => vec![name.to_owned()],
        None => list_stanzas(repo_path)?,
    };
    names
        .into_iter()
        .map(|name| stanza_info(repo_path, name))
        .collect()
}

fn stanza_info(repo_path: &Path, name: String) -> Result<StanzaInfo> {
    let Some(info) = ArchiveInfo::load(repo_path, &name)? else {
        return Ok(StanzaInfo {
            name,
            db: None,
            archive_id: None,
            min_wal: None,
            max_wal: None,
        });
    };
    let archive_id = info.archive_id();
    let archive_dir = stanza_archive_path(repo_path, &name).join(&archive_id);
    let log_dirs = list_log_dirs(&archive_dir)?;
    let mut min_wal = None;
    for dir in &log_dirs {
        if let Some(first) = list_archived(&archive_dir.join(dir))?.first() {
            min_wal = Some(first.segment.to_string());
            break;
        }
    }
    let mut max_wal = None;
    for dir in log_dirs.iter().rev() {
        if let Some(last) = list_archived(&archive_dir.join(dir))?.last() {
            max_wal = Some(last.segment.to_string());
            break;
        }
    }
    Ok(StanzaInfo {
        name,
        db: Some(info.db.identity),
        archive_id: Some(archive_id),
        min_wal,
        max_wal,
    })
}

/// Sorted names of the 16-hex-digit directories under an archive id.
fn list_log_dirs(archive_dir: &Path) -> Result<Vec<String>> {
    let read_dir = match fs::read_dir(archive_dir) {
        Ok(read_dir) => read_dir,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(source) => {
            return Err(Error::PathOpen {
                path: archive_dir.to_owned(),
                source,
            })
        }
    };
    let mut dirs = Vec::new();
    for entry in read_dir {
        let entry = entry.map_err(|source| Error::PathOpen {
            path: archive_dir.to_owned(),
            source,
        })?;
        if let Some(name) = entry.file_name().to_str() {
            if name.len() == 16 && name.bytes().all(|b| matches!(b, b'0'..=b'9' | b'A'..=b'F')) {
                dirs.push(name.to_owned());
            }
        }
    }
    dirs.sort();
    Ok(dirs)
}
