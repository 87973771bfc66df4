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

//! Copying files to, from, and on a worker.

use std::fs;
use std::io::Read;

use assert_fs::prelude::*;
use assert_fs::TempDir;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use pretty_assertions::assert_eq;
use rstest::rstest;

use pgvault::test_fixtures::DbFixture;
use pgvault::*;

use super::*;

fn gunzip(path: &Path) -> Vec<u8> {
    let mut content = Vec::new();
    GzDecoder::new(fs::File::open(path).unwrap())
        .read_to_end(&mut content)
        .unwrap();
    content
}

fn gzip(content: &[u8]) -> Vec<u8> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::fast());
    std::io::Write::write_all(&mut encoder, content).unwrap();
    encoder.finish().unwrap()
}

fn config_with_network_level(repo: &Path, db: &DbFixture, level: u32) -> Config {
    Config {
        compress_level_network: level,
        ..test_config(repo, db)
    }
}

#[rstest]
fn copy_in_stores_content(#[values(0, 3)] network_level: u32, #[values(false, true)] dest_compress: bool) {
    let repo = TempDir::new().unwrap();
    let db = DbFixture::new(DB_VERSION, DB_SYSTEM_ID);
    let config = config_with_network_level(repo.path(), &db, network_level);
    let content = sample_content(100_000);
    let source = db.write_wal("000000010000000100000001", &content);
    let dest = repo.child("archive/main/seg");
    let (mut remote, handle) = connect(&config);

    let result = remote
        .copy_in(
            &source,
            dest.path(),
            &CopyOptions {
                dest_compress,
                dest_path_create: true,
                ..CopyOptions::default()
            },
        )
        .unwrap();
    assert!(result.copied);
    assert_eq!(result.size, 100_000);
    assert_eq!(result.checksum, Some(Checksum::of_bytes(&content)));
    if dest_compress {
        assert_eq!(gunzip(dest.path()), content);
    } else {
        assert_eq!(fs::read(dest.path()).unwrap(), content);
    }
    finish(remote, handle);
}

#[test]
fn copy_in_empty_file() {
    let repo = TempDir::new().unwrap();
    let db = DbFixture::new(DB_VERSION, DB_SYSTEM_ID);
    let source = db.tree.create_file_with_contents("empty", b"");
    let dest = repo.child("empty");
    let (mut remote, handle) = connect(&config_with_network_level(repo.path(), &db, 0));
    let result = remote
        .copy_in(&source, dest.path(), &CopyOptions::default())
        .unwrap();
    assert_eq!(result.size, 0);
    dest.assert("");
    finish(remote, handle);
}

#[test]
fn copy_in_missing_source() {
    let repo = TempDir::new().unwrap();
    let db = DbFixture::new(DB_VERSION, DB_SYSTEM_ID);
    let source = db.path().join("pg_wal/000000010000000100000009");
    let dest = repo.child("seg");
    let (mut remote, handle) = connect(&test_config(repo.path(), &db));

    let err = remote
        .copy_in(&source, dest.path(), &CopyOptions::default())
        .unwrap_err();
    assert!(matches!(err, Error::FileMissing { .. }), "{err:?}");

    let result = remote
        .copy_in(
            &source,
            dest.path(),
            &CopyOptions {
                ignore_missing_source: true,
                ..CopyOptions::default()
            },
        )
        .unwrap();
    assert!(!result.copied);
    dest.assert(predicates::path::missing());
    remote.noop().unwrap();
    finish(remote, handle);
}

#[test]
fn copy_in_with_wrong_checksum_leaves_nothing() {
    let repo = TempDir::new().unwrap();
    let db = DbFixture::new(DB_VERSION, DB_SYSTEM_ID);
    let source = db.write_wal("000000010000000100000001", b"segment content");
    let dest = repo.child("seg");
    let (mut remote, handle) = connect(&test_config(repo.path(), &db));
    let err = remote
        .copy_in(
            &source,
            dest.path(),
            &CopyOptions {
                expect_checksum: Some(Checksum::of_bytes(b"something else")),
                ..CopyOptions::default()
            },
        )
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::Checksum.as_u32());
    dest.assert(predicates::path::missing());
    assert_eq!(fs::read_dir(repo.path()).unwrap().count(), 0, "temp file left behind");
    remote.noop().unwrap();
    finish(remote, handle);
}

#[test]
fn copy_in_to_missing_directory_fails_cleanly() {
    let repo = TempDir::new().unwrap();
    let db = DbFixture::new(DB_VERSION, DB_SYSTEM_ID);
    let source = db.write_wal("000000010000000100000001", &sample_content(50_000));
    let dest = repo.child("no/such/dir/seg");
    let (mut remote, handle) = connect(&test_config(repo.path(), &db));
    let err = remote
        .copy_in(&source, dest.path(), &CopyOptions::default())
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::PathMissing.as_u32());
    // The worker drained the blocks and is ready for another command.
    remote.noop().unwrap();
    finish(remote, handle);
}

#[rstest]
fn copy_out_fetches_content(#[values(0, 3)] network_level: u32, #[values(false, true)] dest_compress: bool) {
    let repo = TempDir::new().unwrap();
    let db = DbFixture::new(DB_VERSION, DB_SYSTEM_ID);
    let content = sample_content(70_000);
    let source = repo.child("stored");
    source.write_binary(&content).unwrap();
    let dest = db.tree.path().join("pg_wal/RECOVERYXLOG");
    let (mut remote, handle) = connect(&config_with_network_level(repo.path(), &db, network_level));

    let result = remote
        .copy_out(
            source.path(),
            &dest,
            &CopyOptions {
                dest_compress,
                ..CopyOptions::default()
            },
        )
        .unwrap();
    assert!(result.copied);
    assert_eq!(result.size, 70_000);
    assert_eq!(result.checksum, Some(Checksum::of_bytes(&content)));
    if dest_compress {
        assert_eq!(gunzip(&dest), content);
    } else {
        assert_eq!(fs::read(&dest).unwrap(), content);
    }
    finish(remote, handle);
}

#[test]
fn copy_out_decompresses_stored_file() {
    let repo = TempDir::new().unwrap();
    let db = DbFixture::new(DB_VERSION, DB_SYSTEM_ID);
    let content = sample_content(40_000);
    let source = repo.child("stored.gz");
    source.write_binary(&gzip(&content)).unwrap();
    let dest = db.tree.path().join("restored");
    let (mut remote, handle) = connect(&test_config(repo.path(), &db));
    let result = remote
        .copy_out(
            source.path(),
            &dest,
            &CopyOptions {
                source_compressed: true,
                expect_checksum: Some(Checksum::of_bytes(&content)),
                ..CopyOptions::default()
            },
        )
        .unwrap();
    assert_eq!(result.size, 40_000);
    assert_eq!(fs::read(&dest).unwrap(), content);
    finish(remote, handle);
}

#[rstest]
fn copy_out_empty_file(#[values(0, 3)] network_level: u32) {
    let repo = TempDir::new().unwrap();
    let db = DbFixture::new(DB_VERSION, DB_SYSTEM_ID);
    let source = repo.child("empty");
    source.touch().unwrap();
    let dest = db.tree.path().join("empty");
    let (mut remote, handle) = connect(&config_with_network_level(repo.path(), &db, network_level));
    let result = remote
        .copy_out(source.path(), &dest, &CopyOptions::default())
        .unwrap();
    assert!(result.copied);
    assert_eq!(result.size, 0);
    assert_eq!(fs::read(&dest).unwrap(), b"");
    finish(remote, handle);
}

#[test]
fn copy_out_missing_source() {
    let repo = TempDir::new().unwrap();
    let db = DbFixture::new(DB_VERSION, DB_SYSTEM_ID);
    let source = repo.child("not-there");
    let dest = db.tree.path().join("dest");
    let (mut remote, handle) = connect(&test_config(repo.path(), &db));

    let result = remote
        .copy_out(
            source.path(),
            &dest,
            &CopyOptions {
                ignore_missing_source: true,
                ..CopyOptions::default()
            },
        )
        .unwrap();
    assert!(!result.copied);
    assert!(!dest.exists());

    let err = remote
        .copy_out(source.path(), &dest, &CopyOptions::default())
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::FileMissing.as_u32());
    assert!(matches!(err, Error::Remote(_)), "{err:?}");
    assert!(!dest.exists());
    remote.noop().unwrap();
    finish(remote, handle);
}

#[test]
fn copy_out_with_wrong_checksum_leaves_nothing() {
    let repo = TempDir::new().unwrap();
    let db = DbFixture::new(DB_VERSION, DB_SYSTEM_ID);
    let source = repo.child("stored");
    source.write_binary(&sample_content(30_000)).unwrap();
    let dest_dir = TempDir::new().unwrap();
    let dest = dest_dir.child("dest");
    let (mut remote, handle) = connect(&test_config(repo.path(), &db));
    let err = remote
        .copy_out(
            source.path(),
            dest.path(),
            &CopyOptions {
                expect_checksum: Some(Checksum::of_bytes(b"other")),
                ..CopyOptions::default()
            },
        )
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::Checksum.as_u32());
    assert_eq!(fs::read_dir(dest_dir.path()).unwrap().count(), 0);
    remote.noop().unwrap();
    finish(remote, handle);
}

#[test]
fn copy_on_worker_sets_mtime_and_appends_checksum() {
    let repo = TempDir::new().unwrap();
    let db = DbFixture::new(DB_VERSION, DB_SYSTEM_ID);
    let source = db.tree.create_file_with_contents("base/1/1259", b"relation data");
    let dest = repo.child("backup/main/label/base/1/1259");
    let (mut remote, handle) = connect(&test_config(repo.path(), &db));
    let result = remote
        .copy(
            &source,
            dest.path(),
            &CopyOptions {
                dest_path_create: true,
                append_checksum: true,
                modification_time: Some(1_500_000_000),
                ..CopyOptions::default()
            },
        )
        .unwrap();
    let checksum = Checksum::of_bytes(b"relation data");
    assert_eq!(result.checksum.as_ref(), Some(&checksum));
    let stored = repo.child(format!("backup/main/label/base/1/1259-{checksum}"));
    stored.assert("relation data");
    let meta = fs::metadata(stored.path()).unwrap();
    assert_eq!(
        filetime::FileTime::from_last_modification_time(&meta).unix_seconds(),
        1_500_000_000
    );
    dest.assert(predicates::path::missing());
    finish(remote, handle);
}
