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

//! Content checksums: SHA-1 over the uncompressed bytes of a file.

use std::convert::TryFrom;
use std::fmt;
use std::fmt::{Debug, Display};
use std::fs::File;
use std::io::{self, Read, Write};
use std::path::Path;
use std::str::FromStr;

use flate2::read::GzDecoder;
use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};

use crate::{Error, Result};

/// Length of a binary checksum.
pub const CHECKSUM_SIZE_BYTES: usize = 20;

/// Length of a checksum as hex.
pub const CHECKSUM_HEX_LEN: usize = CHECKSUM_SIZE_BYTES * 2;

/// The hash of the uncompressed content of a file.
///
/// Stored in memory as compact bytes, but translatable to and from
/// hex strings.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Deserialize, Serialize)]
#[serde(into = "String")]
#[serde(try_from = "String")]
pub struct Checksum {
    bin: [u8; CHECKSUM_SIZE_BYTES],
}

impl Checksum {
    pub fn as_slice(&self) -> &[u8] {
        &self.bin
    }

    /// Checksum of an in-memory buffer.
    pub fn of_bytes(bytes: &[u8]) -> Checksum {
        let mut hasher = Hasher::new();
        hasher.update(bytes);
        hasher.finish().0
    }
}

#[derive(Debug)]
pub struct ChecksumParseError {
    rejected_string: String,
}

impl Display for ChecksumParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Failed to parse checksum string: {:?}", self.rejected_string)
    }
}

impl std::error::Error for ChecksumParseError {}

impl FromStr for Checksum {
    type Err = ChecksumParseError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        if s.len() != CHECKSUM_HEX_LEN {
            return Err(ChecksumParseError {
                rejected_string: s.to_owned(),
            });
        }
        let mut bin = [0; CHECKSUM_SIZE_BYTES];
        hex::decode_to_slice(s, &mut bin)
            .map_err(|_| ChecksumParseError {
                rejected_string: s.to_owned(),
            })
            .and(Ok(Checksum { bin }))
    }
}

impl TryFrom<String> for Checksum {
    type Error = ChecksumParseError;

    fn try_from(s: String) -> std::result::Result<Self, Self::Error> {
        Checksum::from_str(&s)
    }
}

impl Debug for Checksum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        Display::fmt(self, f)
    }
}

impl Display for Checksum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(&self.bin[..]))
    }
}

impl From<Checksum> for String {
    fn from(checksum: Checksum) -> String {
        hex::encode(&checksum.bin[..])
    }
}

/// Incrementally hash a stream, counting its length.
#[derive(Clone, Default)]
pub struct Hasher {
    sha1: Sha1,
    len: u64,
}

impl Hasher {
    pub fn new() -> Hasher {
        Hasher::default()
    }

    pub fn update(&mut self, buf: &[u8]) {
        self.sha1.update(buf);
        self.len += buf.len() as u64;
    }

    /// Return the checksum and number of bytes hashed.
    pub fn finish(self) -> (Checksum, u64) {
        let mut bin = [0; CHECKSUM_SIZE_BYTES];
        bin.copy_from_slice(&self.sha1.finalize());
        (Checksum { bin }, self.len)
    }
}

/// A writer that hashes everything written through it.
pub struct HashingWriter<W: Write> {
    inner: W,
    hasher: Hasher,
}

impl<W: Write> HashingWriter<W> {
    pub fn new(inner: W) -> HashingWriter<W> {
        HashingWriter {
            inner,
            hasher: Hasher::new(),
        }
    }

    pub fn get_mut(&mut self) -> &mut W {
        &mut self.inner
    }

    /// Return the inner writer, the checksum, and the number of bytes written.
    pub fn finish(self) -> (W, Checksum, u64) {
        let (checksum, len) = self.hasher.finish();
        (self.inner, checksum, len)
    }
}

impl<W: Write> Write for HashingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let written = self.inner.write(buf)?;
        self.hasher.update(&buf[..written]);
        Ok(written)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

/// Hash a stream until EOF, returning the checksum and length.
pub fn checksum_reader(reader: &mut dyn Read, buffer_size: usize) -> io::Result<(Checksum, u64)> {
    let mut hasher = Hasher::new();
    let mut buf = vec![0; buffer_size];
    loop {
        match reader.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => hasher.update(&buf[..n]),
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(err) => return Err(err),
        }
    }
    Ok(hasher.finish())
}

/// Hash the uncompressed content of a file, decompressing it if `compressed` is true.
pub fn checksum_file(path: &Path, compressed: bool, buffer_size: usize) -> Result<(Checksum, u64)> {
    let file = File::open(path).map_err(|source| {
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
    })?;
    let result = if compressed {
        checksum_reader(&mut GzDecoder::new(file), buffer_size)
    } else {
        checksum_reader(&mut io::BufReader::new(file), buffer_size)
    };
    result.map_err(|source| Error::FileRead {
        path: path.to_owned(),
        source,
    })
}
