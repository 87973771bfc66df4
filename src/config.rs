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

//! Options shared by the controller and its workers.
//!
//! A [Config] is built once at startup and passed by reference to whatever
//! needs it. Workers receive the relevant subset on their command line.

use std::path::PathBuf;
use std::time::Duration;

use clap::{ArgAction, Args};
use serde::{Deserialize, Serialize};

use crate::compress::CompressLevels;
use crate::protocol::session::SessionOptions;
use crate::{Error, Result, DEFAULT_BUFFER_SIZE};

/// Smallest allowed transfer buffer.
pub const MIN_BUFFER_SIZE: usize = 16 << 10;

#[derive(Args, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct Config {
    /// Path of the repository holding archives and backups.
    #[arg(long, global = true, default_value = "/var/lib/pgvault")]
    pub repo_path: PathBuf,

    /// Host holding the repository, if not this one.
    #[arg(long, global = true)]
    pub repo_host: Option<String>,

    /// User to log in as on the repository host.
    #[arg(long, global = true)]
    pub repo_host_user: Option<String>,

    /// PostgreSQL data directory.
    #[arg(long, global = true)]
    pub db_path: Option<PathBuf>,

    /// Host running the database, if not this one.
    #[arg(long, global = true)]
    pub db_host: Option<String>,

    /// User to log in as on the database host.
    #[arg(long, global = true)]
    pub db_user: Option<String>,

    /// Name of the stanza: the archive and backup destination for one cluster.
    #[arg(long, global = true)]
    pub stanza: Option<String>,

    /// Size of blocks read from files and sent between processes.
    #[arg(long, global = true, default_value_t = DEFAULT_BUFFER_SIZE)]
    pub buffer_size: usize,

    /// Store files gzip-compressed in the repository.
    #[arg(long, global = true, action = ArgAction::Set, default_value_t = true)]
    pub compress: bool,

    /// Compression level for files stored in the repository.
    #[arg(long, global = true, default_value_t = 6)]
    pub compress_level: u32,

    /// Compression level for data sent between processes that is not
    /// already compressed; 0 disables it.
    #[arg(long, global = true, default_value_t = 3)]
    pub compress_level_network: u32,

    /// Number of worker processes for parallel operations.
    #[arg(long, global = true, default_value_t = 1)]
    pub process_max: usize,

    /// Number of items queued to each worker at once.
    #[arg(long, global = true, default_value_t = 2)]
    pub queue_depth: usize,

    /// Command used to reach remote hosts.
    #[arg(long, global = true, default_value = "ssh")]
    pub cmd_ssh: String,

    /// Path of the pgvault executable used to start workers.
    #[arg(long, global = true, default_value = crate::PRODUCT_NAME)]
    pub worker_command: String,

    /// Seconds to wait for a worker to exit before it is killed.
    #[arg(long, global = true, default_value_t = 60)]
    pub protocol_timeout: u64,
}

impl Default for Config {
    fn default() -> Config {
        Config {
            repo_path: PathBuf::from("/var/lib/pgvault"),
            repo_host: None,
            repo_host_user: None,
            db_path: None,
            db_host: None,
            db_user: None,
            stanza: None,
            buffer_size: DEFAULT_BUFFER_SIZE,
            compress: true,
            compress_level: 6,
            compress_level_network: 3,
            process_max: 1,
            queue_depth: 2,
            cmd_ssh: "ssh".to_owned(),
            worker_command: crate::PRODUCT_NAME.to_owned(),
            protocol_timeout: 60,
        }
    }
}

impl Config {
    /// Check values are in range.
    pub fn validate(&self) -> Result<()> {
        self.compress_levels().validate()?;
        if self.process_max < 1 {
            return Err(invalid("process-max must be at least 1"));
        }
        if self.queue_depth < 1 {
            return Err(invalid("queue-depth must be at least 1"));
        }
        if self.buffer_size < MIN_BUFFER_SIZE {
            return Err(invalid(format!(
                "buffer-size must be at least {MIN_BUFFER_SIZE}"
            )));
        }
        if let Some(stanza) = &self.stanza {
            if stanza.is_empty() || stanza.contains(['/', '\\']) || stanza.starts_with('.') {
                return Err(invalid(format!("invalid stanza name {stanza:?}")));
            }
        }
        Ok(())
    }

    pub fn compress_levels(&self) -> CompressLevels {
        CompressLevels {
            file: self.compress_level,
            network: self.compress_level_network,
        }
    }

    pub fn session_options(&self) -> SessionOptions {
        SessionOptions {
            buffer_size: self.buffer_size,
            compress_level: self.compress_level,
            compress_level_network: self.compress_level_network,
        }
    }

    pub fn protocol_timeout(&self) -> Duration {
        Duration::from_secs(self.protocol_timeout)
    }

    /// The stanza name, which most commands require.
    pub fn require_stanza(&self) -> Result<&str> {
        self.stanza
            .as_deref()
            .ok_or_else(|| invalid("a stanza is required for this command"))
    }

    pub fn require_db_path(&self) -> Result<&std::path::Path> {
        self.db_path
            .as_deref()
            .ok_or_else(|| invalid("db-path is required for this command"))
    }

    /// Options passed on the command line to a worker, after `worker`.
    pub fn worker_args(&self) -> Vec<String> {
        let mut args = vec![
            "--repo-path".to_owned(),
            self.repo_path.display().to_string(),
            "--buffer-size".to_owned(),
            self.buffer_size.to_string(),
            "--compress-level".to_owned(),
            self.compress_level.to_string(),
            "--compress-level-network".to_owned(),
            self.compress_level_network.to_string(),
        ];
        if let Some(db_path) = &self.db_path {
            args.push("--db-path".to_owned());
            args.push(db_path.display().to_string());
        }
        if let Some(stanza) = &self.stanza {
            args.push("--stanza".to_owned());
            args.push(stanza.clone());
        }
        args
    }
}

fn invalid(message: impl Into<String>) -> Error {
    Error::Config {
        message: message.into(),
    }
}
