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

//! The identity record of a stanza's WAL archive.
//!
//! `archive.info` records which database (version and system identifier)
//! writes into the archive, and every identity it has had before, so that
//! segments from before a major version upgrade can still be found.
//!
//! The record carries a checksum of its own content, computed over the JSON
//! form with the checksum field omitted.

use std::collections::BTreeMap;
use std::fmt;
use std::io;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::checksum::Checksum;
use crate::io::ensure_dir_exists;
use crate::jsonio::{read_json, write_json};
use crate::wal::{archive_id, stanza_archive_path};
use crate::{Error, Result};

pub const ARCHIVE_INFO_FILENAME: &str = "archive.info";

/// Version of the record format written by this program.
pub const ARCHIVE_INFO_FORMAT: u32 = 5;

/// Identity of a PostgreSQL cluster: its major version and system identifier.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DbIdentity {
    pub version: String,
    pub system_id: u64,
}

impl DbIdentity {
    pub fn new(version: impl Into<String>, system_id: u64) -> DbIdentity {
        DbIdentity {
            version: version.into(),
            system_id,
        }
    }
}

impl fmt::Display for DbIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "version {} system-id {}", self.version, self.system_id)
    }
}

/// The identity currently writing to the archive.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CurrentDb {
    /// Key of this identity in the history.
    pub history_id: u32,
    #[serde(flatten)]
    pub identity: DbIdentity,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArchiveInfo {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checksum: Option<Checksum>,
    pub format: u32,
    /// Version of pgvault that last wrote the record.
    pub product_version: String,
    pub db: CurrentDb,
    /// Every identity the archive has had, keyed by history id.
    pub history: BTreeMap<u32, DbIdentity>,
}

impl ArchiveInfo {
    /// A new record for an archive first written by `identity`.
    pub fn new(identity: DbIdentity) -> ArchiveInfo {
        let mut info = ArchiveInfo {
            checksum: None,
            format: ARCHIVE_INFO_FORMAT,
            product_version: crate::VERSION.to_owned(),
            db: CurrentDb {
                history_id: 1,
                identity: identity.clone(),
            },
            history: BTreeMap::from([(1, identity)]),
        };
        info.checksum = Some(info.compute_checksum());
        info
    }

    pub fn path(repo_path: &Path, stanza: &str) -> PathBuf {
        stanza_archive_path(repo_path, stanza).join(ARCHIVE_INFO_FILENAME)
    }

    /// Load and verify the record, returning None if it does not exist.
    pub fn load(repo_path: &Path, stanza: &str) -> Result<Option<ArchiveInfo>> {
        let path = ArchiveInfo::path(repo_path, stanza);
        let Some((info, _)) = read_json::<ArchiveInfo>(&path)? else {
            return Ok(None);
        };
        if info.format != ARCHIVE_INFO_FORMAT {
            return Err(Error::FileInvalid {
                path,
                message: format!(
                    "unsupported format {}, expected {ARCHIVE_INFO_FORMAT}",
                    info.format
                ),
            });
        }
        let actual = info.compute_checksum();
        match info.checksum {
            Some(expected) if expected == actual => {}
            expected => {
                return Err(Error::Checksum {
                    path,
                    expected: expected.map(|c| c.to_string()).unwrap_or_default(),
                    actual: actual.to_string(),
                })
            }
        }
        if !info.history.contains_key(&info.db.history_id) {
            return Err(Error::FileInvalid {
                path,
                message: format!("current history id {} is not in the history", info.db.history_id),
            });
        }
        debug!(?path, db = ?info.db, "Loaded archive info");
        Ok(Some(info))
    }

    /// Load the record, or create it for `identity` if the stanza has none.
    ///
    /// If another process creates the record at the same time, the record it
    /// wrote is loaded and returned.
    pub fn load_or_create(repo_path: &Path, stanza: &str, identity: &DbIdentity) -> Result<ArchiveInfo> {
        if let Some(info) = ArchiveInfo::load(repo_path, stanza)? {
            return Ok(info);
        }
        let info = ArchiveInfo::new(identity.clone());
        match info.save_new(repo_path, stanza) {
            Ok(()) => {
                info!(stanza, ?identity, "Created archive info");
                Ok(info)
            }
            Err(Error::FileWrite { source, .. }) if source.kind() == io::ErrorKind::AlreadyExists => {
                debug!(stanza, "Archive info was created concurrently; loading it");
                ArchiveInfo::load(repo_path, stanza)?.ok_or_else(|| Error::Assert {
                    message: format!("archive info for {stanza:?} vanished after creation"),
                })
            }
            Err(err) => Err(err),
        }
    }

    /// Write a new record, failing if one already exists.
    pub fn save_new(&self, repo_path: &Path, stanza: &str) -> Result<()> {
        ensure_dir_exists(&stanza_archive_path(repo_path, stanza))?;
        write_json(&ArchiveInfo::path(repo_path, stanza), self, true)
    }

    /// Write the record, replacing any existing one.
    pub fn save(&self, repo_path: &Path, stanza: &str) -> Result<()> {
        ensure_dir_exists(&stanza_archive_path(repo_path, stanza))?;
        write_json(&ArchiveInfo::path(repo_path, stanza), self, false)
    }

    fn compute_checksum(&self) -> Checksum {
        let unsummed = ArchiveInfo {
            checksum: None,
            ..self.clone()
        };
        // Serializing a struct of strings and integers can't fail.
        let json = serde_json::to_vec(&unsummed).unwrap_or_default();
        Checksum::of_bytes(&json)
    }

    /// The archive id for the current identity.
    pub fn archive_id(&self) -> String {
        archive_id(&self.db.identity.version, self.db.history_id)
    }

    /// Check a database identity against the record, returning the archive id
    /// its segments belong in.
    ///
    /// The current identity is preferred; otherwise the most recent matching
    /// history entry is used.
    pub fn check(&self, stanza: &str, identity: &DbIdentity) -> Result<String> {
        if self.db.identity == *identity {
            return Ok(self.archive_id());
        }
        if let Some((history_id, found)) = self.history.iter().rev().find(|(_, h)| *h == identity) {
            debug!(stanza, history_id, ?found, "Matched identity from archive history");
            return Ok(archive_id(&found.version, *history_id));
        }
        if identity.version != self.db.identity.version {
            Err(Error::ArchiveMismatchVersion {
                stanza: stanza.to_owned(),
                db_version: identity.version.clone(),
                archive_version: self.db.identity.version.clone(),
            })
        } else {
            Err(Error::ArchiveMismatchSystemId {
                stanza: stanza.to_owned(),
                db_system_id: identity.system_id,
                archive_system_id: self.db.identity.system_id,
            })
        }
    }

    /// Make `identity` current, adding it to the history.
    ///
    /// Returns false, changing nothing, if it is already current.
    pub fn upgrade(&mut self, identity: &DbIdentity) -> bool {
        if self.db.identity == *identity {
            return false;
        }
        let history_id = self.history.keys().next_back().map_or(1, |id| id + 1);
        self.history.insert(history_id, identity.clone());
        self.db = CurrentDb {
            history_id,
            identity: identity.clone(),
        };
        self.product_version = crate::VERSION.to_owned();
        self.checksum = Some(self.compute_checksum());
        true
    }
}
