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

//! Pushing and fetching WAL segments through a controller.

use std::fs;

use assert_fs::prelude::*;
use assert_fs::TempDir;
use pretty_assertions::assert_eq;

use pgvault::controller::PushOutcome;
use pgvault::test_fixtures::{in_process_connector, DbFixture};
use pgvault::*;

use super::*;

const SEGMENT: &str = "000000010000000100000002";

fn controller(config: &Config) -> Controller {
    Controller::with_connector(config.clone(), in_process_connector(config))
}

#[test]
fn push_then_get() {
    let repo = TempDir::new().unwrap();
    let db = DbFixture::new(DB_VERSION, DB_SYSTEM_ID);
    let config = test_config(repo.path(), &db);
    let content = sample_content(60_000);
    let wal_path = db.write_wal(SEGMENT, &content);
    let controller = controller(&config);

    let checksum = Checksum::of_bytes(&content);
    let outcome = controller.archive_push(&wal_path).unwrap();
    assert_eq!(
        outcome,
        PushOutcome::Pushed {
            archive_id: "9.4-1".to_owned(),
            file: format!("9.4-1/0000000100000001/{SEGMENT}-{checksum}.gz"),
            size: 60_000,
        }
    );
    repo.child("archive/main/archive.info")
        .assert(predicates::path::is_file());
    repo.child(format!(
        "archive/main/9.4-1/0000000100000001/{SEGMENT}-{checksum}.gz"
    ))
    .assert(predicates::path::is_file());

    let dest = db.path().join("pg_wal/RECOVERYXLOG");
    assert!(controller
        .archive_get(&SEGMENT.parse().unwrap(), &dest)
        .unwrap());
    assert_eq!(fs::read(&dest).unwrap(), content);
}

#[test]
fn uncompressed_archive() {
    let repo = TempDir::new().unwrap();
    let db = DbFixture::new(DB_VERSION, DB_SYSTEM_ID);
    let config = Config {
        compress: false,
        ..test_config(repo.path(), &db)
    };
    let wal_path = db.write_wal(SEGMENT, b"plain segment");
    let controller = controller(&config);
    controller.archive_push(&wal_path).unwrap();
    let checksum = Checksum::of_bytes(b"plain segment");
    repo.child(format!(
        "archive/main/9.4-1/0000000100000001/{SEGMENT}-{checksum}"
    ))
    .assert("plain segment");

    let dest = db.path().join("restored");
    assert!(controller
        .archive_get(&SEGMENT.parse().unwrap(), &dest)
        .unwrap());
    assert_eq!(fs::read(&dest).unwrap(), b"plain segment");
}

#[test]
fn get_missing_segment_is_not_an_error() {
    let repo = TempDir::new().unwrap();
    let db = DbFixture::new(DB_VERSION, DB_SYSTEM_ID);
    let config = test_config(repo.path(), &db);
    let controller = controller(&config);
    controller
        .archive_push(&db.write_wal(SEGMENT, b"one"))
        .unwrap();
    let dest = db.path().join("restored");
    assert!(!controller
        .archive_get(&"000000010000000100000003".parse().unwrap(), &dest)
        .unwrap());
    assert!(!dest.exists());
}

#[test]
fn get_before_any_push_fails() {
    let repo = TempDir::new().unwrap();
    let db = DbFixture::new(DB_VERSION, DB_SYSTEM_ID);
    let controller = controller(&test_config(repo.path(), &db));
    let err = controller
        .archive_get(&SEGMENT.parse().unwrap(), &db.path().join("restored"))
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::FileMissing.as_u32());
    assert!(err.hint().is_some());
}

#[test]
fn repeated_push_of_same_content_is_a_warning() {
    let repo = TempDir::new().unwrap();
    let db = DbFixture::new(DB_VERSION, DB_SYSTEM_ID);
    let config = test_config(repo.path(), &db);
    let wal_path = db.write_wal(SEGMENT, b"segment");
    let controller = controller(&config);
    controller.archive_push(&wal_path).unwrap();
    match controller.archive_push(&wal_path).unwrap() {
        PushOutcome::AlreadyArchived {
            archive_id,
            warning,
        } => {
            assert_eq!(archive_id, "9.4-1");
            assert!(warning.contains("already exists"), "{warning}");
        }
        other => panic!("unexpected {other:?}"),
    }
    let dir = repo.child("archive/main/9.4-1/0000000100000001");
    assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 1);
}

#[test]
fn push_of_different_content_is_refused() {
    let repo = TempDir::new().unwrap();
    let db = DbFixture::new(DB_VERSION, DB_SYSTEM_ID);
    let config = test_config(repo.path(), &db);
    let controller = controller(&config);
    controller
        .archive_push(&db.write_wal(SEGMENT, b"first"))
        .unwrap();
    let err = controller
        .archive_push(&db.write_wal(SEGMENT, b"second"))
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::ArchiveDuplicate.as_u32());
}

#[test]
fn push_from_another_cluster_is_refused() {
    let repo = TempDir::new().unwrap();
    let db = DbFixture::new(DB_VERSION, DB_SYSTEM_ID);
    controller(&test_config(repo.path(), &db))
        .archive_push(&db.write_wal(SEGMENT, b"first"))
        .unwrap();

    let other_db = DbFixture::new(DB_VERSION, DB_SYSTEM_ID + 1);
    let err = controller(&test_config(repo.path(), &other_db))
        .archive_push(&other_db.write_wal(SEGMENT, b"other"))
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::ArchiveMismatchSystemId.as_u32());
    assert!(err.hint().unwrap().contains("stanza"));

    let newer_db = DbFixture::new("9.5", DB_SYSTEM_ID);
    let err = controller(&test_config(repo.path(), &newer_db))
        .archive_push(&newer_db.write_wal(SEGMENT, b"newer"))
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::ArchiveMismatchVersion.as_u32());
}

#[test]
fn stanza_upgrade_starts_a_new_archive_id() {
    let repo = TempDir::new().unwrap();
    let old_db = DbFixture::new(DB_VERSION, DB_SYSTEM_ID);
    controller(&test_config(repo.path(), &old_db))
        .archive_push(&old_db.write_wal(SEGMENT, b"old"))
        .unwrap();

    let new_db = DbFixture::new("9.5", DB_SYSTEM_ID + 7);
    let new_controller = controller(&test_config(repo.path(), &new_db));
    assert!(new_controller.stanza_upgrade().unwrap());
    assert!(!new_controller.stanza_upgrade().unwrap());

    match new_controller
        .archive_push(&new_db.write_wal(SEGMENT, b"new"))
        .unwrap()
    {
        PushOutcome::Pushed { archive_id, .. } => assert_eq!(archive_id, "9.5-2"),
        other => panic!("unexpected {other:?}"),
    }

    // The old cluster's segments still belong under its own archive id.
    let dest = old_db.path().join("restored");
    assert!(controller(&test_config(repo.path(), &old_db))
        .archive_get(&SEGMENT.parse().unwrap(), &dest)
        .unwrap());
    assert_eq!(fs::read(&dest).unwrap(), b"old");
}

#[test]
fn stanza_upgrade_needs_local_repository() {
    let repo = TempDir::new().unwrap();
    let db = DbFixture::new(DB_VERSION, DB_SYSTEM_ID);
    let config = Config {
        repo_host: Some("backup.example.com".to_owned()),
        ..test_config(repo.path(), &db)
    };
    let err = controller(&config).stanza_upgrade().unwrap_err();
    assert_eq!(err.code(), ErrorCode::OptionInvalidValue.as_u32());
}

#[test]
fn info_describes_archived_range() {
    let repo = TempDir::new().unwrap();
    let db = DbFixture::new(DB_VERSION, DB_SYSTEM_ID);
    let config = test_config(repo.path(), &db);
    let controller = controller(&config);
    for segment in [
        "000000010000000100000003",
        "000000010000000200000001",
        "000000010000000100000002",
    ] {
        controller
            .archive_push(&db.write_wal(segment, segment.as_bytes()))
            .unwrap();
    }
    let stanzas = controller.info().unwrap();
    assert_eq!(stanzas.len(), 1);
    let info = &stanzas[0];
    assert_eq!(info.name, "main");
    assert_eq!(info.db, Some(DbIdentity::new(DB_VERSION, DB_SYSTEM_ID)));
    assert_eq!(info.archive_id.as_deref(), Some("9.4-1"));
    assert_eq!(info.min_wal.as_deref(), Some("000000010000000100000002"));
    assert_eq!(info.max_wal.as_deref(), Some("000000010000000200000001"));
    let text = info.to_string();
    assert!(text.contains("000000010000000100000002 .. 000000010000000200000001"), "{text}");
}

#[test]
fn info_for_all_stanzas() {
    let repo = TempDir::new().unwrap();
    let db = DbFixture::new(DB_VERSION, DB_SYSTEM_ID);
    let config = test_config(repo.path(), &db);
    controller(&config)
        .archive_push(&db.write_wal(SEGMENT, b"seg"))
        .unwrap();
    repo.child("archive/empty").create_dir_all().unwrap();
    let all = Config {
        stanza: None,
        ..config
    };
    let stanzas = controller(&all).info().unwrap();
    let names: Vec<&str> = stanzas.iter().map(|s| s.name.as_str()).collect();
    assert_eq!(names, ["empty", "main"]);
    assert_eq!(stanzas[0].db, None);
}

#[test]
fn cancelled_controller_does_nothing() {
    let repo = TempDir::new().unwrap();
    let db = DbFixture::new(DB_VERSION, DB_SYSTEM_ID);
    let controller = controller(&test_config(repo.path(), &db));
    controller.cancel_token().cancel();
    let err = controller
        .archive_push(&db.write_wal(SEGMENT, b"seg"))
        .unwrap_err();
    assert!(matches!(err, Error::Termination), "{err:?}");
    repo.child("archive").assert(predicates::path::missing());
}
