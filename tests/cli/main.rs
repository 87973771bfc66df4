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

//! Run pgvault as a subprocess, with its workers as further subprocesses.

use std::fs;
use assert_cmd::Command;

use assert_fs::prelude::*;
use assert_fs::TempDir;
use predicates::prelude::*;

use pgvault::test_fixtures::DbFixture;
use pgvault::{Checksum, PRODUCT_NAME, VERSION};

const SEGMENT: &str = "000000010000000100000002";

fn run_pgvault() -> Command {
    Command::cargo_bin("pgvault").expect("locate pgvault binary")
}

/// A command for a database and repository, whose workers are this same
/// binary.
fn run_with(repo: &TempDir, db: &DbFixture) -> Command {
    let mut command = run_pgvault();
    command
        .arg("--repo-path")
        .arg(repo.path())
        .arg("--db-path")
        .arg(db.path())
        .arg("--stanza=main")
        .arg("--worker-command")
        .arg(env!("CARGO_BIN_EXE_pgvault"));
    command
}

#[test]
fn no_args() {
    run_pgvault()
        .assert()
        .failure()
        .stdout(predicate::str::is_empty())
        .stderr(predicate::str::contains("Usage:"));
}

#[test]
fn help() {
    run_pgvault()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("archive-push"))
        .stdout(predicate::str::contains("backup-files"))
        .stdout(predicate::str::contains("Push a WAL segment into the archive"))
        .stderr(predicate::str::is_empty());
}

#[test]
fn version() {
    run_pgvault()
        .arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains(VERSION));
}

#[test]
fn invalid_option_value_exit_code() {
    run_pgvault()
        .args(["--compress-level=12", "info"])
        .assert()
        .code(32)
        .stderr(predicate::str::contains("compress-level"));
}

#[test]
fn push_without_stanza() {
    let db = DbFixture::new("9.4", 1);
    let wal = db.write_wal(SEGMENT, b"seg");
    run_pgvault()
        .arg("--db-path")
        .arg(db.path())
        .arg("archive-push")
        .arg(wal)
        .assert()
        .code(32)
        .stderr(predicate::str::contains("stanza is required"));
}

#[test]
fn push_get_and_info() {
    let repo = TempDir::new().unwrap();
    let db = DbFixture::new("9.4", 6_000_000_000_000_000_001);
    let content = b"a segment's worth of WAL".repeat(1000);
    let wal = db.write_wal(SEGMENT, &content);

    run_with(&repo, &db)
        .arg("archive-push")
        .arg(&wal)
        .assert()
        .success()
        .stdout(predicate::str::is_empty());
    let checksum = Checksum::of_bytes(&content);
    repo.child(format!(
        "archive/main/9.4-1/0000000100000001/{SEGMENT}-{checksum}.gz"
    ))
    .assert(predicate::path::is_file());

    // Pushing it again only warns.
    run_with(&repo, &db)
        .arg("archive-push")
        .arg(&wal)
        .assert()
        .success()
        .stderr(predicate::str::contains("already exists"));

    let dest = db.path().join("pg_wal/RECOVERYXLOG");
    run_with(&repo, &db)
        .arg("archive-get")
        .arg(SEGMENT)
        .arg(&dest)
        .assert()
        .success();
    assert_eq!(fs::read(&dest).unwrap(), content);

    run_with(&repo, &db)
        .arg("archive-get")
        .arg("000000010000000100000003")
        .arg(db.path().join("pg_wal/other"))
        .assert()
        .code(1);

    run_with(&repo, &db)
        .arg("info")
        .assert()
        .success()
        .stdout(predicate::str::contains("stanza: main"))
        .stdout(predicate::str::contains("archive: 9.4-1"));

    let output = run_with(&repo, &db)
        .args(["info", "--json"])
        .output()
        .unwrap();
    assert!(output.status.success());
    let json: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(json[0]["name"], "main");
    assert_eq!(json[0]["min_wal"], SEGMENT);
}

#[test]
fn push_from_other_cluster_fails_with_code() {
    let repo = TempDir::new().unwrap();
    let db = DbFixture::new("9.4", 1);
    run_with(&repo, &db)
        .arg("archive-push")
        .arg(db.write_wal(SEGMENT, b"one"))
        .assert()
        .success();
    let other = DbFixture::new("9.4", 2);
    run_with(&repo, &other)
        .arg("archive-push")
        .arg(other.write_wal(SEGMENT, b"two"))
        .assert()
        .code(46)
        .stderr(predicate::str::contains("HINT"));
}

#[test]
fn backup_files() {
    let repo = TempDir::new().unwrap();
    let db = DbFixture::new("9.4", 1);
    db.tree.create_file_with_contents("base/1/1259", b"relation");
    db.tree.create_file_with_contents("postmaster.pid", b"1\n");
    run_with(&repo, &db)
        .args(["--process-max=2", "--compress=false", "backup-files", "--label=full"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Backup full complete."));
    repo.child("backup/main/full/base/1/1259")
        .assert("relation");
    repo.child("backup/main/full/PG_VERSION").assert("9.4\n");
    repo.child("backup/main/full/postmaster.pid")
        .assert(predicate::path::missing());
}

#[test]
fn worker_serves_stdin() {
    let input = format!("{PRODUCT_NAME} {VERSION}\n{{\"cmd\":\"noop\"}}\n{{\"cmd\":\"exit\"}}\n");
    run_pgvault()
        .arg("worker")
        .write_stdin(input)
        .assert()
        .success()
        .stdout(format!("{PRODUCT_NAME} {VERSION}\nOK\nOK\n"));
}

#[test]
fn worker_reports_unknown_commands_and_continues() {
    let input = format!(
        "{PRODUCT_NAME} {VERSION}\n{{\"cmd\":\"format-disk\"}}\n{{\"cmd\":\"noop\"}}\n{{\"cmd\":\"exit\"}}\n"
    );
    run_pgvault()
        .arg("worker")
        .write_stdin(input)
        .assert()
        .success()
        .stdout(predicate::str::starts_with(format!(
            "{PRODUCT_NAME} {VERSION}\nERROR [057] fatal: "
        )))
        .stdout(predicate::str::ends_with("\nOK\nOK\n"));
}

#[test]
fn worker_rejects_other_versions() {
    run_pgvault()
        .arg("worker")
        .write_stdin(format!("{PRODUCT_NAME} 99.0.0\n"))
        .assert()
        .code(52)
        .stdout(predicate::str::starts_with("ERROR [052]"));
}
