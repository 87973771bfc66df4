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

//! Compression of file content and of payload on the wire.
//!
//! Files are compressed with gzip so that they can be read with standard
//! tools. Two levels are configured independently: one for files stored in
//! the repository, and one for otherwise-uncompressed payload crossing the
//! network.

pub mod gzip;

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Compression levels used for stored files and for the network.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompressLevels {
    /// Level for files written into the repository, 0..=9.
    pub file: u32,
    /// Level for uncompressed payload sent over the pipe, 0..=9. Zero disables.
    pub network: u32,
}

impl Default for CompressLevels {
    fn default() -> Self {
        CompressLevels {
            file: 6,
            network: 3,
        }
    }
}

impl CompressLevels {
    pub fn validate(&self) -> Result<()> {
        for (name, level) in [("compress-level", self.file), ("compress-level-network", self.network)] {
            if level > 9 {
                return Err(Error::Config {
                    message: format!("{name} must be between 0 and 9, not {level}"),
                });
            }
        }
        Ok(())
    }
}
