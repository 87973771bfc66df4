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

//! Filesystem commands run by workers, other than copying.

use std::fs;
use std::io;
use std::path::Path;
use std::thread::sleep;
use std::time::Duration;

use filetime::FileTime;
use regex::Regex;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use tracing::{debug, trace};

use crate::kind::Kind;
use crate::owner::Owner;
use crate::unix_mode::UnixMode;
use crate::{Error, Result};

/// Order of names returned by [list].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SortOrder {
    /// Directory order, whatever the filesystem returns.
    None,
    #[default]
    Forward,
    Reverse,
}

/// List the names in a directory, optionally filtered by a regex.
///
/// If `ignore_missing` is set a missing directory lists as empty.
pub fn list(path: &Path, expression: Option<&str>, sort: SortOrder, ignore_missing: bool) -> Result<Vec<String>> {
    let filter = expression
        .map(Regex::new)
        .transpose()
        .map_err(|err| Error::Config {
            message: format!("invalid list expression: {err}"),
        })?;
    let read_dir = match fs::read_dir(path) {
        Ok(read_dir) => read_dir,
        Err(err) if err.kind() == io::ErrorKind::NotFound => {
            if ignore_missing {
                return Ok(Vec::new());
            }
            return Err(Error::PathMissing {
                path: path.to_owned(),
            });
        }
        Err(source) => {
            return Err(Error::PathOpen {
                path: path.to_owned(),
                source,
            })
        }
    };
    let mut names = Vec::new();
    for entry in read_dir {
        let entry = entry.map_err(|source| Error::PathOpen {
            path: path.to_owned(),
            source,
        })?;
        let name = entry.file_name().to_string_lossy().into_owned();
        if filter.as_ref().map_or(true, |re| re.is_match(&name)) {
            names.push(name);
        }
    }
    match sort {
        SortOrder::None => {}
        SortOrder::Forward => names.sort(),
        SortOrder::Reverse => names.sort_by(|a, b| b.cmp(a)),
    }
    trace!(?path, count = names.len(), "Listed directory");
    Ok(names)
}

/// Create one directory, whose parent must exist.
///
/// If `ignore_exists` is set, an existing directory is not an error.
pub fn path_create(path: &Path, mode: Option<UnixMode>, ignore_exists: bool) -> Result<()> {
    let mut builder = fs::DirBuilder::new();
    set_dir_mode(&mut builder, mode);
    match builder.create(path) {
        Ok(()) => {
            debug!(?path, "Created directory");
            Ok(())
        }
        Err(err) if err.kind() == io::ErrorKind::AlreadyExists && ignore_exists && path.is_dir() => Ok(()),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Err(Error::PathMissing {
            path: path.parent().unwrap_or(path).to_owned(),
        }),
        Err(source) => Err(Error::PathCreate {
            path: path.to_owned(),
            source,
        }),
    }
}

#[cfg(unix)]
fn set_dir_mode(builder: &mut fs::DirBuilder, mode: Option<UnixMode>) {
    use std::os::unix::fs::DirBuilderExt;
    if let Some(mode) = mode {
        builder.mode(mode.mode & 0o7777);
    }
}

#[cfg(not(unix))]
fn set_dir_mode(_builder: &mut fs::DirBuilder, _mode: Option<UnixMode>) {}

/// True if anything exists at the path; symlinks are not followed.
pub fn exists(path: &Path) -> Result<bool> {
    match fs::symlink_metadata(path) {
        Ok(_) => Ok(true),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(source) => Err(Error::FileOpen {
            path: path.to_owned(),
            source,
        }),
    }
}

/// Sleep until the start of the next second, and return that time in Unix
/// seconds.
///
/// Files written after this returns have a modification time distinguishable
/// from files written before it was called.
pub fn wait() -> i64 {
    let now = OffsetDateTime::now_utc();
    let remaining = 1_000_000_000 - now.nanosecond();
    sleep(Duration::from_nanos(remaining.into()));
    now.unix_timestamp() + 1
}

/// One entry in a directory manifest.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestEntry {
    /// Path relative to the manifest root, with `/` separators; the root is `.`.
    pub name: String,
    pub kind: Kind,
    #[serde(flatten)]
    pub owner: Owner,
    pub mode: UnixMode,
    /// Modification time in Unix seconds.
    pub mtime: i64,
    /// Length, for files.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
    /// Target, for symlinks.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
}

/// Describe every entry under a directory, sorted by name.
///
/// Symlinks are reported but not followed.
pub fn manifest(root: &Path) -> Result<Vec<ManifestEntry>> {
    let root_meta = fs::symlink_metadata(root).map_err(|source| {
        if source.kind() == io::ErrorKind::NotFound {
            Error::PathMissing {
                path: root.to_owned(),
            }
        } else {
            Error::PathOpen {
                path: root.to_owned(),
                source,
            }
        }
    })?;
    let mut entries = vec![manifest_entry(".".to_owned(), root, &root_meta)?];
    let mut pending = Vec::new();
    if root_meta.is_dir() {
        pending.push(String::new());
    }
    while let Some(rel) = pending.pop() {
        let dir = if rel.is_empty() { root.to_owned() } else { root.join(&rel) };
        let read_dir = fs::read_dir(&dir).map_err(|source| Error::PathOpen {
            path: dir.clone(),
            source,
        })?;
        for dirent in read_dir {
            let dirent = dirent.map_err(|source| Error::PathOpen {
                path: dir.clone(),
                source,
            })?;
            let child_name = dirent.file_name().to_string_lossy().into_owned();
            let child_rel = if rel.is_empty() {
                child_name
            } else {
                format!("{rel}/{child_name}")
            };
            let path = dirent.path();
            let meta = fs::symlink_metadata(&path).map_err(|source| Error::FileOpen {
                path: path.clone(),
                source,
            })?;
            if meta.is_dir() {
                pending.push(child_rel.clone());
            }
            entries.push(manifest_entry(child_rel, &path, &meta)?);
        }
    }
    entries.sort_by(|a, b| a.name.cmp(&b.name));
    debug!(?root, count = entries.len(), "Built manifest");
    Ok(entries)
}

fn manifest_entry(name: String, path: &Path, meta: &fs::Metadata) -> Result<ManifestEntry> {
    let kind = Kind::from(meta.file_type());
    let target = if kind.is_link() {
        let target = fs::read_link(path).map_err(|source| Error::FileRead {
            path: path.to_owned(),
            source,
        })?;
        Some(target.to_string_lossy().into_owned())
    } else {
        None
    };
    #[cfg(unix)]
    let owner = Owner::from(meta);
    #[cfg(not(unix))]
    let owner = Owner::default();
    Ok(ManifestEntry {
        name,
        kind,
        owner,
        mode: UnixMode::from(meta.permissions()),
        mtime: FileTime::from_last_modification_time(meta).unix_seconds(),
        size: kind.is_file().then(|| meta.len()),
        target,
    })
}
