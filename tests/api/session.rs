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

//! Simple commands over a session with a worker.

use std::fs;

use assert_fs::prelude::*;
use assert_fs::TempDir;
use pretty_assertions::assert_eq;

use pgvault::fileops::SortOrder;
use pgvault::test_fixtures::DbFixture;
use pgvault::*;

use super::*;

#[test]
fn noop_and_exit() {
    let repo = TempDir::new().unwrap();
    let db = DbFixture::new(DB_VERSION, DB_SYSTEM_ID);
    let (mut remote, handle) = connect(&test_config(repo.path(), &db));
    assert_eq!(remote.name(), "test");
    remote.noop().unwrap();
    remote.noop().unwrap();
    finish(remote, handle);
}

#[test]
fn filesystem_commands() {
    let repo = TempDir::new().unwrap();
    let db = DbFixture::new(DB_VERSION, DB_SYSTEM_ID);
    let (mut remote, handle) = connect(&test_config(repo.path(), &db));

    let err = remote
        .path_create(repo.child("archive/main").path(), None, false)
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::PathMissing.as_u32());

    let dir = repo.child("main");
    assert!(!remote.exists(dir.path()).unwrap());
    remote.path_create(dir.path(), None, false).unwrap();
    assert!(remote.exists(dir.path()).unwrap());
    remote.path_create(dir.path(), None, true).unwrap();
    let err = remote.path_create(dir.path(), None, false).unwrap_err();
    assert_eq!(err.code(), ErrorCode::PathCreate.as_u32());

    dir.child("b.history").write_str("b").unwrap();
    dir.child("a.history").write_str("a").unwrap();
    dir.child("backup.info").write_str("x").unwrap();
    assert_eq!(
        remote
            .list(dir.path(), Some(r"\.history$"), SortOrder::Reverse, false)
            .unwrap(),
        ["b.history", "a.history"]
    );
    assert_eq!(
        remote.list(dir.path(), None, SortOrder::Forward, false).unwrap(),
        ["a.history", "b.history", "backup.info"]
    );

    let missing = repo.child("nothing-here");
    assert_eq!(
        remote
            .list(missing.path(), None, SortOrder::Forward, true)
            .unwrap(),
        Vec::<String>::new()
    );
    let err = remote
        .list(missing.path(), None, SortOrder::Forward, false)
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::PathMissing.as_u32());

    // The session carries on after errors.
    remote.noop().unwrap();
    finish(remote, handle);
}

#[test]
fn relative_paths_are_refused() {
    let repo = TempDir::new().unwrap();
    let db = DbFixture::new(DB_VERSION, DB_SYSTEM_ID);
    let (mut remote, handle) = connect(&test_config(repo.path(), &db));
    let err = remote.exists(Path::new("relative/path")).unwrap_err();
    assert!(matches!(err, Error::Remote(_)), "{err:?}");
    remote.noop().unwrap();
    finish(remote, handle);
}

#[test]
fn wait_returns_a_later_second() {
    let repo = TempDir::new().unwrap();
    let db = DbFixture::new(DB_VERSION, DB_SYSTEM_ID);
    let (mut remote, handle) = connect(&test_config(repo.path(), &db));
    let first = remote.wait().unwrap();
    let second = remote.wait().unwrap();
    assert!(second > first, "{first} then {second}");
    finish(remote, handle);
}

#[test]
fn db_info_and_manifest() {
    let repo = TempDir::new().unwrap();
    let db = DbFixture::new(DB_VERSION, DB_SYSTEM_ID);
    db.tree.create_file_with_contents("base/1/1259", b"relation");
    let (mut remote, handle) = connect(&test_config(repo.path(), &db));

    assert_eq!(
        remote.db_info().unwrap(),
        DbIdentity::new(DB_VERSION, DB_SYSTEM_ID)
    );

    let manifest = remote.manifest(db.path()).unwrap();
    let names: Vec<&str> = manifest.iter().map(|e| e.name.as_str()).collect();
    assert_eq!(
        names,
        [
            ".",
            "PG_VERSION",
            "base",
            "base/1",
            "base/1/1259",
            "global",
            "global/pg_control",
            "pg_wal"
        ]
    );
    let relation = manifest.iter().find(|e| e.name == "base/1/1259").unwrap();
    assert_eq!(relation.kind, Kind::File);
    assert_eq!(relation.size, Some(8));
    let meta = fs::metadata(db.path().join("base/1/1259")).unwrap();
    assert_eq!(
        relation.mtime,
        filetime::FileTime::from_last_modification_time(&meta).unix_seconds()
    );
    finish(remote, handle);
}
