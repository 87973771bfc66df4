// pgvault: PostgreSQL WAL archive and backup agent.
// Copyright 2017-2025 Martin Pool.

// This program is free software; you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation; either version 2 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.

//! Gzip stream transforms.

use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;

/// Extension on compressed files, without the dot.
pub const GZ_EXTENSION: &str = "gz";

/// Wrap a writer so that everything written to it is gzip-compressed.
pub fn encoder<W: Write>(w: W, level: u32) -> GzEncoder<W> {
    GzEncoder::new(w, Compression::new(level))
}

/// Wrap a reader so that it yields the uncompressed content of a gzip stream.
pub fn decoder<R: Read>(r: R) -> GzDecoder<R> {
    GzDecoder::new(r)
}

/// True if the file name ends with `.gz`.
pub fn has_gz_extension(path: &Path) -> bool {
    path.extension().is_some_and(|ext| ext == GZ_EXTENSION)
}

/// Add a `.gz` extension to a path.
pub fn with_gz_extension(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".");
    name.push(GZ_EXTENSION);
    PathBuf::from(name)
}

/// Compress a buffer entirely in memory.
pub fn compress_bytes(input: &[u8], level: u32) -> io::Result<Vec<u8>> {
    let mut encoder = encoder(Vec::with_capacity(input.len() / 2), level);
    encoder.write_all(input)?;
    encoder.finish()
}

/// Decompress a buffer entirely in memory.
pub fn decompress_bytes(input: &[u8]) -> io::Result<Vec<u8>> {
    let mut out = Vec::new();
    decoder(input).read_to_end(&mut out)?;
    Ok(out)
}
