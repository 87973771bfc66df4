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

//! Checks run before a WAL segment is pushed into or fetched from the archive.
//!
//! Both directions first check that the database's identity matches the
//! stanza's [ArchiveInfo]. A push then looks for a segment of the same name:
//! if one exists with identical content the push is a no-op with a warning,
//! and with different content it is refused.
//!
//! Two workers may push the same segment concurrently, so the existence check
//! is repeated for every push rather than cached.

use std::fs;
use std::io;
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};

use lru::LruCache;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::archive_info::{ArchiveInfo, DbIdentity};
use crate::checksum::{checksum_file, Checksum};
use crate::wal::{segment_dir, ArchivedFile, WalSegment, ARCHIVE_DIR};
use crate::{Error, Result};

/// Number of stanzas whose archive info is kept in memory.
const CACHE_SIZE: NonZeroUsize = NonZeroUsize::MIN.saturating_add(15);

/// Outcome of a successful push check.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PushCheck {
    /// Archive id directory the segment belongs in, like `9.4-1`.
    pub archive_id: String,
    /// Set if the segment is already archived with the same content: the
    /// caller should not copy it again.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub warning: Option<String>,
    /// File name of the existing copy, if there is one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub existing: Option<String>,
}

impl PushCheck {
    pub fn already_archived(&self) -> bool {
        self.existing.is_some()
    }
}

/// Outcome of a successful get check.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetCheck {
    pub archive_id: String,
    /// Path of the archived segment relative to the stanza's archive
    /// directory, if a segment was requested and found.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub found: Option<String>,
}

/// Runs archive checks against one repository, caching archive info by stanza.
pub struct ArchiveCheck {
    repo_path: PathBuf,
    buffer_size: usize,
    cache: LruCache<String, ArchiveInfo>,
}

impl ArchiveCheck {
    pub fn new(repo_path: &Path, buffer_size: usize) -> ArchiveCheck {
        ArchiveCheck {
            repo_path: repo_path.to_owned(),
            buffer_size,
            cache: LruCache::new(CACHE_SIZE),
        }
    }

    pub fn repo_path(&self) -> &Path {
        &self.repo_path
    }

    /// Check that a segment may be pushed.
    ///
    /// `checksum` is the hash of the uncompressed segment being pushed. If an
    /// archived segment of the same name exists and the checksum is not given
    /// or differs, the push is refused with [Error::ArchiveDuplicate].
    pub fn push_check(
        &mut self,
        stanza: &str,
        segment: &WalSegment,
        identity: &DbIdentity,
        checksum: Option<&Checksum>,
    ) -> Result<PushCheck> {
        let archive_id = self.checked_archive_id(stanza, identity, true)?;
        let Some(existing) = self.find_segment(stanza, &archive_id, segment)? else {
            debug!(stanza, %segment, archive_id, "Segment is not yet archived");
            return Ok(PushCheck {
                archive_id,
                warning: None,
                existing: None,
            });
        };
        let existing_name = existing.file_name();
        let existing_checksum = match existing.checksum {
            Some(c) => c,
            None => {
                let path = segment_dir(&self.repo_path, stanza, &archive_id, segment).join(&existing_name);
                checksum_file(&path, existing.compressed, self.buffer_size)?.0
            }
        };
        match checksum {
            Some(checksum) if *checksum == existing_checksum => {
                let warning = format!(
                    "WAL segment {segment} already exists in the archive with the same checksum"
                );
                warn!(stanza, existing = existing_name, "{warning}");
                Ok(PushCheck {
                    archive_id,
                    warning: Some(warning),
                    existing: Some(existing_name),
                })
            }
            _ => Err(Error::ArchiveDuplicate {
                segment: segment.to_string(),
                existing: existing_name,
            }),
        }
    }

    /// Check that segments may be fetched, and optionally locate one.
    ///
    /// Fails with [Error::ArchiveInfoMissing] if nothing was ever pushed for
    /// the stanza.
    pub fn get_check(
        &mut self,
        stanza: &str,
        segment: Option<&WalSegment>,
        identity: &DbIdentity,
    ) -> Result<GetCheck> {
        let archive_id = self.checked_archive_id(stanza, identity, false)?;
        let found = match segment {
            None => None,
            Some(segment) => self
                .find_segment(stanza, &archive_id, segment)?
                .map(|f| format!("{archive_id}/{}/{}", segment.log_dir(), f.file_name())),
        };
        Ok(GetCheck { archive_id, found })
    }

    /// Check the identity against cached info, rereading it from disk if
    /// it's not cached or doesn't match.
    fn checked_archive_id(&mut self, stanza: &str, identity: &DbIdentity, create: bool) -> Result<String> {
        if let Some(info) = self.cache.get(stanza) {
            if let Ok(archive_id) = info.check(stanza, identity) {
                return Ok(archive_id);
            }
        }
        let info = if create {
            ArchiveInfo::load_or_create(&self.repo_path, stanza, identity)?
        } else {
            ArchiveInfo::load(&self.repo_path, stanza)?.ok_or_else(|| Error::ArchiveInfoMissing {
                stanza: stanza.to_owned(),
                path: ArchiveInfo::path(&self.repo_path, stanza),
            })?
        };
        let result = info.check(stanza, identity);
        self.cache.put(stanza.to_owned(), info);
        result
    }

    /// Find the archived file for a segment under an archive id.
    fn find_segment(
        &self,
        stanza: &str,
        archive_id: &str,
        segment: &WalSegment,
    ) -> Result<Option<ArchivedFile>> {
        let dir = segment_dir(&self.repo_path, stanza, archive_id, segment);
        let mut found = list_archived(&dir)?
            .into_iter()
            .filter(|f| f.segment == *segment);
        let first = found.next();
        if let Some(second) = found.next() {
            return Err(Error::ArchiveDuplicate {
                segment: segment.to_string(),
                existing: format!(
                    "{}, {}",
                    first.map(|f| f.file_name()).unwrap_or_default(),
                    second.file_name()
                ),
            });
        }
        Ok(first)
    }
}

/// List archived segment files in a directory, which need not exist.
pub(crate) fn list_archived(dir: &Path) -> Result<Vec<ArchivedFile>> {
    let read_dir = match fs::read_dir(dir) {
        Ok(read_dir) => read_dir,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(source) => {
            return Err(Error::PathOpen {
                path: dir.to_owned(),
                source,
            })
        }
    };
    let mut files = Vec::new();
    for entry in read_dir {
        let entry = entry.map_err(|source| Error::PathOpen {
            path: dir.to_owned(),
            source,
        })?;
        if let Some(file) = entry.file_name().to_str().and_then(ArchivedFile::parse) {
            files.push(file);
        }
    }
    files.sort_by(|a, b| a.segment.cmp(&b.segment));
    Ok(files)
}

/// The stanza names that have an archive directory in the repository.
pub(crate) fn list_stanzas(repo_path: &Path) -> Result<Vec<String>> {
    let dir = repo_path.join(ARCHIVE_DIR);
    let read_dir = match fs::read_dir(&dir) {
        Ok(read_dir) => read_dir,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(source) => return Err(Error::PathOpen { path: dir, source }),
    };
    let mut names = Vec::new();
    for entry in read_dir {
        let entry = entry.map_err(|source| Error::PathOpen {
            path: dir.clone(),
            source,
        })?;
        if entry.file_type().is_ok_and(|ft| ft.is_dir()) {
            if let Some(name) = entry.file_name().to_str() {
                names.push(name.to_owned());
            }
        }
    }
    names.sort();
    Ok(names)
}
