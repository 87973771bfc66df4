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

//! IO utilities.

use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use tempfile::NamedTempFile;
use tracing::{trace, warn};

use crate::{Error, Result};

/// A file written under a temporary name in its final directory, and renamed
/// into place only when it is complete.
///
/// If the AtomicFile is dropped without being persisted, the temporary file
/// is removed.
pub(crate) struct AtomicFile {
    /// The intended final name; used for error messages and to find the directory.
    path: PathBuf,
    f: NamedTempFile,
}

impl AtomicFile {
    pub fn new(path: &Path) -> Result<AtomicFile> {
        let dir = path.parent().ok_or_else(|| Error::Assert {
            message: format!("{path:?} has no parent directory"),
        })?;
        let f = tempfile::Builder::new()
            .prefix(crate::TMP_PREFIX)
            .tempfile_in(dir)
            .map_err(|source| {
                if source.kind() == io::ErrorKind::NotFound {
                    Error::PathMissing {
                        path: dir.to_owned(),
                    }
                } else {
                    Error::FileWrite {
                        path: path.to_owned(),
                        source,
                    }
                }
            })?;
        Ok(AtomicFile {
            path: path.to_owned(),
            f,
        })
    }

    /// The name the file has while it is being written.
    pub fn temp_path(&self) -> &Path {
        self.f.path()
    }

    pub fn file_mut(&mut self) -> &mut fs::File {
        self.f.as_file_mut()
    }

    /// Flush to disk and rename to `final_path`, overwriting any existing file.
    pub fn persist(self, final_path: &Path) -> Result<()> {
        self.sync()?;
        fail::fail_point!("atomic_file::persist", |_| {
            Err(Error::FileWrite {
                path: final_path.to_owned(),
                source: io::Error::other("injected failure before rename"),
            })
        });
        if let Err(persist_error) = self.f.persist(final_path) {
            warn!("Failed to persist {:?}: {:?}", final_path, persist_error.error);
            return Err(Error::FileWrite {
                path: final_path.to_owned(),
                source: persist_error.error,
            });
        }
        trace!("Renamed into place: {final_path:?}");
        Ok(())
    }

    /// Flush to disk and rename to the final path, failing if it already exists.
    pub fn persist_noclobber(self) -> Result<()> {
        self.sync()?;
        let path = self.path;
        self.f
            .persist_noclobber(&path)
            .map(|_| ())
            .map_err(|persist_error| Error::FileWrite {
                path,
                source: persist_error.error,
            })
    }

    fn sync(&self) -> Result<()> {
        self.f.as_file().sync_all().map_err(|source| Error::FileWrite {
            path: self.path.clone(),
            source,
        })
    }
}

impl Write for AtomicFile {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.f.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.f.flush()
    }
}

/// Create a directory and any missing parents, succeeding if it already exists.
pub(crate) fn ensure_dir_exists(path: &Path) -> Result<()> {
    fs::create_dir_all(path).map_err(|source| Error::PathCreate {
        path: path.to_owned(),
        source,
    })
}
