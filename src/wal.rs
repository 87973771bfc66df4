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

//! WAL segment names and where archived segments are stored.
//!
//! An archived segment is stored as
//! `<repo>/archive/<stanza>/<archive-id>/<first 16 hex digits>/<segment>[-<sha1>][.gz]`.

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::checksum::Checksum;
use crate::compress::gzip::GZ_EXTENSION;
use crate::Error;

/// Name of the directory under the repository holding archives for all stanzas.
pub const ARCHIVE_DIR: &str = "archive";

/// Length of a WAL segment name in hex digits.
pub const WAL_SEGMENT_NAME_LEN: usize = 24;

lazy_static! {
    static ref SEGMENT_RE: Regex = Regex::new(r"^[0-9A-F]{24}$").unwrap();
    static ref ARCHIVED_RE: Regex =
        Regex::new(r"^([0-9A-F]{24})(?:-([0-9a-f]{40}))?(\.gz)?$").unwrap();
}

/// The name of one WAL segment, like `000000010000000100000002`.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub struct WalSegment(String);

impl WalSegment {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The timeline and log id part of the name, which names the directory
    /// holding this segment in the archive.
    pub fn log_dir(&self) -> &str {
        &self.0[..16]
    }

    /// Take the segment name from the file name of a path.
    pub fn from_path(path: &Path) -> crate::Result<WalSegment> {
        let name = path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| Error::InvalidWalSegment {
                name: path.to_string_lossy().into_owned(),
            })?;
        name.parse()
    }
}

impl FromStr for WalSegment {
    type Err = Error;

    fn from_str(s: &str) -> crate::Result<WalSegment> {
        if SEGMENT_RE.is_match(s) {
            Ok(WalSegment(s.to_owned()))
        } else {
            Err(Error::InvalidWalSegment { name: s.to_owned() })
        }
    }
}

impl TryFrom<String> for WalSegment {
    type Error = Error;

    fn try_from(s: String) -> crate::Result<WalSegment> {
        s.parse()
    }
}

impl From<WalSegment> for String {
    fn from(segment: WalSegment) -> String {
        segment.0
    }
}

impl fmt::Display for WalSegment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A segment file found in the archive, parsed from its name.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ArchivedFile {
    pub segment: WalSegment,
    /// Checksum of the uncompressed content, if the name carries one.
    pub checksum: Option<Checksum>,
    pub compressed: bool,
}

impl ArchivedFile {
    /// Parse an archive file name, returning None if it is not an archived segment.
    pub fn parse(name: &str) -> Option<ArchivedFile> {
        let caps = ARCHIVED_RE.captures(name)?;
        Some(ArchivedFile {
            segment: WalSegment(caps[1].to_owned()),
            checksum: caps.get(2).and_then(|m| m.as_str().parse().ok()),
            compressed: caps.get(3).is_some(),
        })
    }

    pub fn file_name(&self) -> String {
        archived_file_name(&self.segment, self.checksum.as_ref(), self.compressed)
    }
}

/// The file name under which a segment is archived.
pub fn archived_file_name(segment: &WalSegment, checksum: Option<&Checksum>, compressed: bool) -> String {
    let mut name = segment.as_str().to_owned();
    if let Some(checksum) = checksum {
        name.push('-');
        name.push_str(&checksum.to_string());
    }
    if compressed {
        name.push('.');
        name.push_str(GZ_EXTENSION);
    }
    name
}

/// The archive id for a database version and history entry, like `9.4-1`.
pub fn archive_id(db_version: &str, history_id: u32) -> String {
    format!("{db_version}-{history_id}")
}

/// Directory holding all archives for one stanza.
pub fn stanza_archive_path(repo_path: &Path, stanza: &str) -> PathBuf {
    repo_path.join(ARCHIVE_DIR).join(stanza)
}

/// Directory holding a segment under an archive id.
pub fn segment_dir(repo_path: &Path, stanza: &str, archive_id: &str, segment: &WalSegment) -> PathBuf {
    stanza_archive_path(repo_path, stanza)
        .join(archive_id)
        .join(segment.log_dir())
}
