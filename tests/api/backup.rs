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

//! Copying a database directory into a backup with several workers.

use std::fs;
use std::io::{self, Read, Write};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};

use assert_fs::prelude::*;
use assert_fs::TempDir;
use pretty_assertions::assert_eq;

use pgvault::controller::{CancelToken, Connector, Role};
use pgvault::test_fixtures::{in_process_connector, in_process_worker, DbFixture};
use pgvault::*;

use super::*;

/// A database with some relations in two databases and a tablespace, plus
/// files that are never backed up.
fn populated_db() -> DbFixture {
    let db = DbFixture::new(DB_VERSION, DB_SYSTEM_ID);
    for (i, name) in [
        "base/1/1259",
        "base/1/1249",
        "base/1/2608",
        "base/12345/16384",
        "base/12345/16385",
        "pg_tblspc/16400/PG_9.4_201409291/12345/16401",
        "pg_clog/0000",
    ]
    .into_iter()
    .enumerate()
    {
        db.tree
            .create_file_with_contents(name, &sample_content(1000 * (i + 1)));
    }
    db.tree.create_file_with_contents("postmaster.pid", b"1234\n");
    db.tree.create_file_with_contents("base/1/pgsql_tmp/t1", b"temporary");
    db.write_wal("000000010000000100000001", b"wal");
    db
}

/// Backed-up files in `populated_db`, including PG_VERSION and pg_control.
const BACKED_UP: &[&str] = &[
    "PG_VERSION",
    "base/1/1249",
    "base/1/1259",
    "base/1/2608",
    "base/12345/16384",
    "base/12345/16385",
    "global/pg_control",
    "pg_clog/0000",
    "pg_tblspc/16400/PG_9.4_201409291/12345/16401",
];

/// A transport to an in-process worker that runs a hook as each copy command
/// is sent, and fails the write if the hook fails.
struct CopyHook {
    inner: Box<dyn Transport>,
    on_copy: Box<dyn FnMut() -> io::Result<()> + Send>,
}

impl CopyHook {
    fn wrap(
        inner: Box<dyn Transport>,
        on_copy: impl FnMut() -> io::Result<()> + Send + 'static,
    ) -> Box<dyn Transport> {
        Box::new(CopyHook {
            inner,
            on_copy: Box::new(on_copy),
        })
    }
}

impl Read for CopyHook {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.inner.read(buf)
    }
}

impl Write for CopyHook {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if buf.starts_with(br#"{"cmd":"copy""#) {
            (self.on_copy)()?;
        }
        self.inner.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

impl Transport for CopyHook {
    fn describe(&self) -> String {
        self.inner.describe()
    }

    fn close(&mut self) -> io::Result<()> {
        self.inner.close()
    }

    fn kill(&mut self) -> io::Result<()> {
        self.inner.kill()
    }
}

fn backed_up_files(root: &Path) -> Vec<String> {
    let mut names: Vec<String> = pgvault::fileops::manifest(root)
        .unwrap()
        .into_iter()
        .filter(|e| e.kind == Kind::File)
        .map(|e| e.name)
        .collect();
    names.sort();
    names
}

#[test]
fn backup_with_several_workers() {
    let repo = TempDir::new().unwrap();
    let db = populated_db();
    let config = Config {
        process_max: 3,
        compress: false,
        ..test_config(repo.path(), &db)
    };
    let controller = Controller::with_connector(config.clone(), in_process_connector(&config));
    let stats = controller.backup_files("20250101-000000F").unwrap();
    assert_eq!(stats.files, BACKED_UP.len());
    assert_eq!(stats.errors, 0);
    assert_eq!(stats.missing, 0);
    assert!(!stats.has_errors());

    let backup = controller.backup_path("20250101-000000F").unwrap();
    assert_eq!(backup, repo.path().join("backup/main/20250101-000000F"));
    assert_eq!(backed_up_files(&backup), BACKED_UP);
    for name in BACKED_UP {
        assert_eq!(
            fs::read(backup.join(name)).unwrap(),
            fs::read(db.path().join(name)).unwrap(),
            "{name}"
        );
    }
    let total: u64 = BACKED_UP
        .iter()
        .map(|name| fs::metadata(db.path().join(name)).unwrap().len())
        .sum();
    assert_eq!(stats.bytes, total);
}

#[test]
fn compressed_backup_keeps_modification_times() {
    let repo = TempDir::new().unwrap();
    let db = populated_db();
    let source = db.path().join("base/1/1259");
    filetime::set_file_mtime(&source, filetime::FileTime::from_unix_time(1_400_000_000, 0))
        .unwrap();
    let config = Config {
        process_max: 2,
        queue_depth: 1,
        ..test_config(repo.path(), &db)
    };
    let controller = Controller::with_connector(config.clone(), in_process_connector(&config));
    let stats = controller.backup_files("label").unwrap();
    assert_eq!(stats.files, BACKED_UP.len());

    let stored = repo.child("backup/main/label/base/1/1259.gz");
    stored.assert(predicates::path::is_file());
    let meta = fs::metadata(stored.path()).unwrap();
    assert_eq!(
        filetime::FileTime::from_last_modification_time(&meta).unix_seconds(),
        1_400_000_000
    );
    repo.child("backup/main/label/postmaster.pid.gz")
        .assert(predicates::path::missing());
}

#[test]
fn backup_survives_a_failed_worker() {
    let repo = TempDir::new().unwrap();
    let db = populated_db();
    let config = Config {
        process_max: 3,
        compress: false,
        ..test_config(repo.path(), &db)
    };
    let worker_config = config.clone();
    let connects = Arc::new(AtomicUsize::new(0));
    let counter = connects.clone();
    let connector: Arc<Connector> = Arc::new(move |role: Role, index: usize| {
        counter.fetch_add(1, Ordering::SeqCst);
        if index == 2 {
            return Err(Error::HostConnect {
                host: format!("{role}-{index}"),
                source: std::io::Error::other("refused"),
            });
        }
        Ok(in_process_worker(&worker_config, &format!("{role}-{index}")).0)
    });
    let controller = Controller::with_connector(config, connector);
    let stats = controller.backup_files("label").unwrap();
    assert_eq!(connects.load(Ordering::SeqCst), 3);
    assert_eq!(stats.failed_workers, 1);
    assert_eq!(stats.files, BACKED_UP.len());
    assert_eq!(
        backed_up_files(&repo.path().join("backup/main/label")),
        BACKED_UP
    );
}

#[test]
fn backup_follows_tablespace_links() {
    let repo = TempDir::new().unwrap();
    let tablespace = TempDir::new().unwrap();
    tablespace
        .child("PG_9.4_201409291/12345")
        .create_dir_all()
        .unwrap();
    tablespace
        .child("PG_9.4_201409291/12345/16401")
        .write_binary(&sample_content(3000))
        .unwrap();
    tablespace
        .child("PG_9.4_201409291/12345/16402")
        .write_binary(&sample_content(200))
        .unwrap();
    let db = DbFixture::new(DB_VERSION, DB_SYSTEM_ID);
    db.tree
        .create_file_with_contents("base/1/1259", &sample_content(1000));
    db.tree.create_dir("pg_tblspc");
    db.tree
        .create_symlink("pg_tblspc/16400", tablespace.path().to_str().unwrap());
    let config = Config {
        process_max: 2,
        compress: false,
        ..test_config(repo.path(), &db)
    };
    let controller = Controller::with_connector(config.clone(), in_process_connector(&config));
    let stats = controller.backup_files("label").unwrap();
    assert_eq!(stats.files, 5);
    assert_eq!(stats.errors, 0);

    let backup = controller.backup_path("label").unwrap();
    assert_eq!(
        backed_up_files(&backup),
        [
            "PG_VERSION",
            "base/1/1259",
            "global/pg_control",
            "pg_tblspc/16400/PG_9.4_201409291/12345/16401",
            "pg_tblspc/16400/PG_9.4_201409291/12345/16402",
        ]
    );
    assert_eq!(
        fs::read(backup.join("pg_tblspc/16400/PG_9.4_201409291/12345/16401")).unwrap(),
        sample_content(3000)
    );
}

#[test]
fn backup_survives_a_worker_dying_mid_session() {
    let repo = TempDir::new().unwrap();
    let db = populated_db();
    let config = Config {
        process_max: 2,
        queue_depth: 2,
        compress: false,
        ..test_config(repo.path(), &db)
    };
    let worker_config = config.clone();
    let connector: Arc<Connector> = Arc::new(move |role: Role, index: usize| {
        let (inner, _handle) = in_process_worker(&worker_config, &format!("{role}-{index}"));
        if index == 2 {
            Ok(CopyHook::wrap(inner, || {
                Err(io::Error::new(io::ErrorKind::BrokenPipe, "worker died"))
            }))
        } else {
            Ok(inner)
        }
    });
    let stats = Controller::with_connector(config, connector)
        .backup_files("label")
        .unwrap();
    assert_eq!(stats.failed_workers, 1);
    // The copy in progress when the worker died is lost; its queue is not.
    assert_eq!(stats.errors, 1);
    assert_eq!(stats.files, BACKED_UP.len() - 1);
    assert!(stats.has_errors());
    assert_eq!(
        backed_up_files(&repo.path().join("backup/main/label")).len(),
        BACKED_UP.len() - 1
    );
}

#[test]
fn backup_stops_when_cancelled() {
    let repo = TempDir::new().unwrap();
    let db = populated_db();
    let config = Config {
        process_max: 1,
        queue_depth: 1,
        compress: false,
        ..test_config(repo.path(), &db)
    };
    let worker_config = config.clone();
    let token: Arc<OnceLock<CancelToken>> = Arc::new(OnceLock::new());
    let hook_token = token.clone();
    let connector: Arc<Connector> = Arc::new(move |role: Role, index: usize| {
        let (inner, _handle) = in_process_worker(&worker_config, &format!("{role}-{index}"));
        let token = hook_token.clone();
        Ok(CopyHook::wrap(inner, move || {
            if let Some(token) = token.get() {
                token.cancel();
            }
            Ok(())
        }))
    });
    let controller = Controller::with_connector(config, connector);
    assert!(token.set(controller.cancel_token()).is_ok());
    let err = controller.backup_files("label").unwrap_err();
    assert!(matches!(err, Error::Termination), "{err:?}");
    assert_eq!(err.code(), ErrorCode::Termination.as_u32());
    // The copy already sent finishes; nothing more is started.
    assert_eq!(
        backed_up_files(&repo.path().join("backup/main/label")).len(),
        1
    );
}

#[test]
fn backup_fails_when_every_worker_fails() {
    let repo = TempDir::new().unwrap();
    let db = populated_db();
    let config = Config {
        process_max: 2,
        ..test_config(repo.path(), &db)
    };
    let connector: Arc<Connector> = Arc::new(|role: Role, index: usize| {
        Err(Error::HostConnect {
            host: format!("{role}-{index}"),
            source: std::io::Error::other("refused"),
        })
    });
    let err = Controller::with_connector(config, connector)
        .backup_files("label")
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::Transport.as_u32());
}

#[test]
fn backup_requires_stanza_and_db_path() {
    let repo = TempDir::new().unwrap();
    let db = populated_db();
    let config = Config {
        stanza: None,
        ..test_config(repo.path(), &db)
    };
    let err = Controller::with_connector(config.clone(), in_process_connector(&config))
        .backup_files("label")
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::OptionInvalidValue.as_u32());
}

#[test]
fn backup_refuses_zero_workers() {
    let repo = TempDir::new().unwrap();
    let db = populated_db();
    for (process_max, queue_depth) in [(0, 1), (1, 0)] {
        let config = Config {
            process_max,
            queue_depth,
            ..test_config(repo.path(), &db)
        };
        let err = Controller::with_connector(config.clone(), in_process_connector(&config))
            .backup_files("label")
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::OptionInvalidValue.as_u32());
    }
    repo.child("backup").assert(predicates::path::missing());
}
