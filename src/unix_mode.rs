// pgvault: PostgreSQL WAL archive and backup agent.
// Copyright 2022 Stephanie Aelmore.
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

//! Permission bits for files and directories.
//!
//! Modes cross the protocol as four-digit octal strings such as `"0640"`, the
//! way PostgreSQL and `chmod` show them.

use std::fmt;
use std::fs::Permissions;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub struct UnixMode {
    pub mode: u32,
}

impl PartialEq for UnixMode {
    fn eq(&self, other: &Self) -> bool {
        // mask all bits other than the permissions, sticky, and set bits
        (self.mode & 0o7777) == (other.mode & 0o7777)
    }
}
impl Eq for UnixMode {}

impl fmt::Display for UnixMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04o}", self.mode & 0o7777)
    }
}

impl FromStr for UnixMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match u32::from_str_radix(s, 8) {
            Ok(mode) if mode <= 0o7777 => Ok(UnixMode { mode }),
            _ => Err(format!("invalid file mode {s:?}")),
        }
    }
}

impl TryFrom<String> for UnixMode {
    type Error = String;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<UnixMode> for String {
    fn from(mode: UnixMode) -> String {
        mode.to_string()
    }
}

impl From<u32> for UnixMode {
    fn from(mode: u32) -> Self {
        Self { mode }
    }
}

#[cfg(unix)]
use std::os::unix::fs::PermissionsExt;

#[cfg(unix)]
impl From<Permissions> for UnixMode {
    fn from(p: Permissions) -> Self {
        Self { mode: p.mode() }
    }
}
#[cfg(unix)]
impl From<UnixMode> for Permissions {
    fn from(p: UnixMode) -> Self {
        Permissions::from_mode(p.mode & 0o7777)
    }
}
