// pgvault: PostgreSQL WAL archive and backup agent.
// Copyright 2016-2025 Martin Pool.

// This program is free software; you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation; either version 2 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.

//! Utilities to set up test environments.
//!
//! Fixtures that create directories are deleted when the object is dropped.

use std::fs;
use std::io::Write;
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use tempfile::TempDir;
use tracing::debug;

use crate::config::Config;
use crate::controller::{Connector, Role};
use crate::db_info::{PG_CONTROL_PATH, PG_VERSION_FILENAME};
use crate::transport::{PipeTransport, Transport};
use crate::worker::Worker;
use crate::Result;

/// A temporary tree for running a test.
pub struct TreeFixture {
    pub root: PathBuf,
    _tempdir: TempDir, // held only for cleanup
}

impl TreeFixture {
    pub fn new() -> TreeFixture {
        let tempdir = TempDir::new().unwrap();
        let root = tempdir.path().to_path_buf();
        TreeFixture {
            _tempdir: tempdir,
            root,
        }
    }

    pub fn path(&self) -> &Path {
        &self.root
    }

    /// Make a file in the tree, with arbitrary contents. Returns the full path.
    pub fn create_file(&self, relative_path: &str) -> PathBuf {
        self.create_file_with_contents(relative_path, b"contents")
    }

    /// Make a file in the tree, with given contents, creating parent
    /// directories. Returns the full path.
    pub fn create_file_with_contents(&self, relative_path: &str, contents: &[u8]) -> PathBuf {
        let full_path = self.root.join(relative_path);
        if let Some(parent) = full_path.parent() {
            fs::create_dir_all(parent).unwrap();
        }
        let mut f = fs::File::create(&full_path).unwrap();
        f.write_all(contents).unwrap();
        full_path
    }

    pub fn create_dir(&self, relative_path: &str) {
        fs::create_dir_all(self.root.join(relative_path)).unwrap();
    }

    pub fn create_symlink(&self, relative_path: &str, target: &str) {
        std::os::unix::fs::symlink(target, self.root.join(relative_path)).unwrap();
    }
}

impl Default for TreeFixture {
    fn default() -> Self {
        Self::new()
    }
}

/// A fake PostgreSQL data directory, with just enough to identify it.
pub struct DbFixture {
    pub tree: TreeFixture,
}

impl DbFixture {
    pub fn new(version: &str, system_id: u64) -> DbFixture {
        let tree = TreeFixture::new();
        tree.create_file_with_contents(PG_VERSION_FILENAME, format!("{version}\n").as_bytes());
        let mut control = system_id.to_le_bytes().to_vec();
        control.resize(8192, 0);
        tree.create_file_with_contents(PG_CONTROL_PATH, &control);
        tree.create_dir("pg_wal");
        DbFixture { tree }
    }

    pub fn path(&self) -> &Path {
        self.tree.path()
    }

    /// Write a WAL segment into `pg_wal`, returning its path.
    pub fn write_wal(&self, segment: &str, contents: &[u8]) -> PathBuf {
        self.tree
            .create_file_with_contents(&format!("pg_wal/{segment}"), contents)
    }
}

/// Start a worker on a thread in this process, connected over a socket
/// pair. Returns the controller's end of the transport.
///
/// The worker stops when told to exit or when the transport is dropped.
pub fn in_process_worker(config: &Config, name: &str) -> (Box<dyn Transport>, JoinHandle<Result<()>>) {
    let (ours, theirs) = UnixStream::pair().unwrap();
    let worker_config = config.clone();
    let worker_name = format!("{name}-worker");
    let handle = thread::Builder::new()
        .name(worker_name.clone())
        .spawn(move || {
            let transport = PipeTransport::new(theirs.try_clone().unwrap(), theirs, "controller");
            let result = Worker::serve(transport, &worker_config);
            debug!(name = worker_name, ?result, "In-process worker finished");
            result
        })
        .unwrap();
    let transport = PipeTransport::new(ours.try_clone().unwrap(), ours, name);
    (Box::new(transport), handle)
}

/// A connector that starts every worker in this process.
pub fn in_process_connector(config: &Config) -> Arc<Connector> {
    let config = config.clone();
    Arc::new(move |role: Role, index: usize| {
        let (transport, _handle) = in_process_worker(&config, &format!("{role}-{index}"));
        Ok(transport)
    })
}
