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

//! Copy a file while hashing it, optionally changing its compression.
//!
//! Either end may be a local path or a stream, which is how copy-in and
//! copy-out move file content across the protocol.
//!
//! The checksum is always over the uncompressed content, so it's the same
//! however the file is stored.
//!
//! A destination path is written under a temporary name in the same directory
//! and renamed into place once it's complete, so the final name never refers
//! to a partial file.

use std::fmt;
use std::fs::File;
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};

use filetime::FileTime;
use flate2::write::GzDecoder;
use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use crate::checksum::{Checksum, HashingWriter};
use crate::compress::gzip::{self, GZ_EXTENSION};
use crate::errors::unwrap_io_error;
use crate::io::{ensure_dir_exists, AtomicFile};
use crate::owner::Owner;
use crate::unix_mode::UnixMode;
use crate::{Error, Result};

/// Mode of newly written files, unless another is requested.
pub const DEFAULT_FILE_MODE: u32 = 0o640;

/// Where file content comes from.
pub enum Source<'a> {
    Path(&'a Path),
    /// Content arriving over the protocol.
    Reader(&'a mut dyn Read),
}

/// Where file content goes.
pub enum Dest<'a> {
    Path(&'a Path),
    /// Content sent over the protocol.
    Writer(&'a mut dyn Write),
}

impl fmt::Display for Source<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Source::Path(path) => write!(f, "{}", path.display()),
            Source::Reader(_) => write!(f, "<stream>"),
        }
    }
}

impl fmt::Display for Dest<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Dest::Path(path) => write!(f, "{}", path.display()),
            Dest::Writer(_) => write!(f, "<stream>"),
        }
    }
}

/// How to copy a file.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct CopyOptions {
    /// The source is gzip-compressed.
    pub source_compressed: bool,
    /// Write the destination gzip-compressed.
    pub dest_compress: bool,
    /// A missing source is not an error: nothing is copied.
    pub ignore_missing_source: bool,
    /// Create the destination directory if it's missing.
    pub dest_path_create: bool,
    pub mode: Option<UnixMode>,
    pub user: Option<String>,
    pub group: Option<String>,
    /// Modification time to set on the destination, in Unix seconds.
    pub modification_time: Option<i64>,
    /// Put the checksum in the destination file name.
    pub append_checksum: bool,
    /// Fail, leaving no destination, unless the content has this checksum.
    pub expect_checksum: Option<Checksum>,
}

/// What was copied.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CopyResult {
    /// False if the source was missing and that was allowed.
    pub copied: bool,
    /// Hash of the uncompressed content.
    pub checksum: Option<Checksum>,
    /// Length of the uncompressed content.
    pub size: u64,
}

impl CopyResult {
    pub fn not_copied() -> CopyResult {
        CopyResult {
            copied: false,
            checksum: None,
            size: 0,
        }
    }
}

/// Insert `-<checksum>` into a file name, before any `.gz` extension.
pub fn append_checksum(path: &Path, checksum: &Checksum) -> PathBuf {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let gz_suffix = format!(".{GZ_EXTENSION}");
    let new_name = match name.strip_suffix(&gz_suffix) {
        Some(stem) => format!("{stem}-{checksum}{gz_suffix}"),
        None => format!("{name}-{checksum}"),
    };
    path.with_file_name(new_name)
}

/// Copy a file.
///
/// `level` is the gzip level used if the destination is compressed and the
/// source is not.
pub fn copy(
    source: Source<'_>,
    dest: Dest<'_>,
    options: &CopyOptions,
    level: u32,
    buffer_size: usize,
) -> Result<CopyResult> {
    match write_pending(source, dest, options, level, buffer_size)? {
        Some(pending) => pending.publish(),
        None => Ok(CopyResult::not_copied()),
    }
}

/// A copy whose content is fully written but not yet renamed into place.
///
/// Dropping it removes the temporary file.
pub(crate) struct Pending {
    file: Option<(AtomicFile, PathBuf)>,
    result: CopyResult,
}

impl Pending {
    pub fn result(&self) -> &CopyResult {
        &self.result
    }

    /// Rename the destination into place.
    pub fn publish(self) -> Result<CopyResult> {
        if let Some((file, final_path)) = self.file {
            file.persist(&final_path)?;
            debug!(?final_path, size = self.result.size, "Copied file");
        }
        Ok(self.result)
    }
}

/// Write the content of a copy, without publishing a destination path.
///
/// Returns None if the source is missing and that's allowed.
pub(crate) fn write_pending(
    source: Source<'_>,
    dest: Dest<'_>,
    options: &CopyOptions,
    level: u32,
    buffer_size: usize,
) -> Result<Option<Pending>> {
    let from = source.to_string();
    let to = dest.to_string();
    trace!(from, to, ?options, "Copy");
    let mut source_file;
    let reader: &mut dyn Read = match source {
        Source::Path(path) => match File::open(path) {
            Ok(f) => {
                source_file = f;
                &mut source_file
            }
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                if options.ignore_missing_source {
                    debug!(?path, "Source is missing; not copied");
                    return Ok(None);
                }
                return Err(Error::FileMissing {
                    path: path.to_owned(),
                });
            }
            Err(source) => {
                return Err(Error::FileOpen {
                    path: path.to_owned(),
                    source,
                })
            }
        },
        Source::Reader(reader) => reader,
    };
    let copy_error = |err: io::Error| match unwrap_io_error(err) {
        Ok(err) => err,
        Err(source) => Error::Copy {
            from: from.clone(),
            to: to.clone(),
            source,
        },
    };
    match dest {
        Dest::Path(path) => {
            if options.dest_path_create {
                if let Some(parent) = path.parent() {
                    ensure_dir_exists(parent)?;
                }
            }
            let mut file = AtomicFile::new(path)?;
            let (checksum, size) = transfer(reader, &mut file, options, level, buffer_size)
                .map_err(copy_error)?;
            check_expected(options, path, &checksum)?;
            set_attributes(&mut file, options, path)?;
            let final_path = if options.append_checksum {
                append_checksum(path, &checksum)
            } else {
                path.to_owned()
            };
            Ok(Some(Pending {
                file: Some((file, final_path)),
                result: CopyResult {
                    copied: true,
                    checksum: Some(checksum),
                    size,
                },
            }))
        }
        Dest::Writer(writer) => {
            let (checksum, size) = transfer(reader, writer, options, level, buffer_size)
                .map_err(copy_error)?;
            check_expected(options, Path::new(&from), &checksum)?;
            Ok(Some(Pending {
                file: None,
                result: CopyResult {
                    copied: true,
                    checksum: Some(checksum),
                    size,
                },
            }))
        }
    }
}

fn check_expected(options: &CopyOptions, path: &Path, actual: &Checksum) -> Result<()> {
    match &options.expect_checksum {
        Some(expected) if expected != actual => Err(Error::Checksum {
            path: path.to_owned(),
            expected: expected.to_string(),
            actual: actual.to_string(),
        }),
        _ => Ok(()),
    }
}

fn set_attributes(file: &mut AtomicFile, options: &CopyOptions, path: &Path) -> Result<()> {
    let write_error = |source| Error::FileWrite {
        path: path.to_owned(),
        source,
    };
    file.flush().map_err(write_error)?;
    let mode = options.mode.unwrap_or(UnixMode::from(DEFAULT_FILE_MODE));
    file.file_mut()
        .set_permissions(mode.into())
        .map_err(write_error)?;
    let owner = Owner {
        user: options.user.clone(),
        group: options.group.clone(),
    };
    if !owner.is_none() {
        #[cfg(unix)]
        crate::owner::set_owner(&owner, file.temp_path())?;
    }
    if let Some(mtime) = options.modification_time {
        let mtime = FileTime::from_unix_time(mtime, 0);
        filetime::set_file_handle_times(file.file_mut(), None, Some(mtime)).map_err(write_error)?;
    }
    Ok(())
}

/// Stream `reader` into `writer`, changing compression as asked, and return
/// the checksum and length of the uncompressed content.
fn transfer(
    reader: &mut dyn Read,
    writer: &mut dyn Write,
    options: &CopyOptions,
    level: u32,
    buffer_size: usize,
) -> io::Result<(Checksum, u64)> {
    match (options.source_compressed, options.dest_compress) {
        (false, false) => {
            let mut hashing = HashingWriter::new(writer);
            pump(reader, &mut hashing, buffer_size)?;
            let (_, checksum, len) = hashing.finish();
            Ok((checksum, len))
        }
        (false, true) => {
            let mut hashing = HashingWriter::new(gzip::encoder(writer, level));
            pump(reader, &mut hashing, buffer_size)?;
            let (encoder, checksum, len) = hashing.finish();
            encoder.finish()?;
            Ok((checksum, len))
        }
        (true, false) => {
            let mut decoder = GzDecoder::new(HashingWriter::new(writer));
            pump(reader, &mut decoder, buffer_size)?;
            let (_, checksum, len) = decoder.finish()?.finish();
            Ok((checksum, len))
        }
        (true, true) => {
            // Already in the stored form: pass it through, decompressing a
            // copy only to hash it.
            let mut decoder = GzDecoder::new(HashingWriter::new(io::sink()));
            pump(reader, &mut Tee(writer, &mut decoder), buffer_size)?;
            let (_, checksum, len) = decoder.finish()?.finish();
            Ok((checksum, len))
        }
    }
}

/// Copy until EOF, returning the number of bytes read.
fn pump(reader: &mut dyn Read, writer: &mut dyn Write, buffer_size: usize) -> io::Result<u64> {
    let mut buf = vec![0; buffer_size];
    let mut total = 0;
    loop {
        let n = match reader.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => n,
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(err) => return Err(err),
        };
        writer.write_all(&buf[..n])?;
        total += n as u64;
    }
    writer.flush()?;
    Ok(total)
}

/// Write everything to two writers.
struct Tee<'a, 'b>(&'a mut dyn Write, &'b mut dyn Write);

impl Write for Tee<'_, '_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.write_all(buf)?;
        self.1.write_all(buf)?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.0.flush()?;
        self.1.flush()
    }
}
