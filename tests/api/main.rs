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

//! Tests for the pgvault library API, with workers running on threads in
//! the test process.

use std::path::Path;
use std::thread::JoinHandle;

use pgvault::config::MIN_BUFFER_SIZE;
use pgvault::test_fixtures::{in_process_worker, DbFixture};
use pgvault::*;

mod archive;
mod backup;
mod session;
mod transfer;

/// Version and system id of the database in most tests.
const DB_VERSION: &str = "9.4";
const DB_SYSTEM_ID: u64 = 6_000_000_000_000_000_001;

type TestRemote = Remote<Box<dyn Transport>>;

/// Config for a repository at `repo` backing up `db`, with small buffers so
/// that files span many blocks.
fn test_config(repo: &Path, db: &DbFixture) -> Config {
    Config {
        repo_path: repo.to_owned(),
        db_path: Some(db.path().to_owned()),
        stanza: Some("main".to_owned()),
        buffer_size: MIN_BUFFER_SIZE,
        ..Config::default()
    }
}

/// Connect to a new in-process worker.
fn connect(config: &Config) -> (TestRemote, JoinHandle<Result<()>>) {
    let (transport, handle) = in_process_worker(config, "test");
    let remote = Remote::connect(transport, config).expect("connect to worker");
    (remote, handle)
}

/// Tell a worker to exit and check it finished cleanly.
fn finish(remote: TestRemote, handle: JoinHandle<Result<()>>) {
    remote.exit().expect("worker exit");
    handle.join().expect("join worker thread").expect("worker result");
}

/// Content that doesn't compress to nothing, of a given length.
fn sample_content(len: usize) -> Vec<u8> {
    let mut state: u32 = 0x2545_f491;
    (0..len)
        .map(|_| {
            state ^= state << 13;
            state ^= state >> 17;
            state ^= state << 5;
            (state % 23) as u8 + b'a'
        })
        .collect()
}
