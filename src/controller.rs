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

//! The controller: starts workers and drives commands through them.
//!
//! Each high-level operation connects to one or more workers, on the
//! repository host or the database host, and finishes by telling each of
//! them to exit. Backups spread their files over `process_max` workers
//! through a [WorkerGroup], one pool thread per worker.

use std::fmt;
use std::path::{Component, Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::Duration;

use rayon::ThreadPoolBuilder;
use tracing::{debug, error, info, warn};

use crate::archive_info::{ArchiveInfo, DbIdentity};
use crate::checksum::checksum_file;
use crate::compress::gzip::{has_gz_extension, with_gz_extension};
use crate::config::Config;
use crate::db_info::db_identity;
use crate::file_copy::{CopyOptions, CopyResult};
use crate::fileops::{self, ManifestEntry};
use crate::kind::Kind;
use crate::remote::Remote;
use crate::stanza::StanzaInfo;
use crate::stats::CopyStats;
use crate::transport::{ChildTransport, Transport};
use crate::wal::{archived_file_name, segment_dir, stanza_archive_path, ArchivedFile, WalSegment};
use crate::work_group::{WorkItem, WorkerGroup};
use crate::{Error, Result};

/// Directory under the repository holding backups.
pub const BACKUP_DIR: &str = "backup";

/// Directory in the data directory holding a symlink to each tablespace.
const TABLESPACE_DIR: &str = "pg_tblspc";

/// How often an idle worker thread looks for cancellation.
const IDLE_POLL: Duration = Duration::from_millis(100);

/// Files in the data directory that are never backed up.
const EXCLUDED_FILES: &[&str] = &["postmaster.pid", "postmaster.opts"];

/// Directories in the data directory whose contents are never backed up.
const EXCLUDED_DIRS: &[&str] = &[
    "pg_wal",
    "pg_xlog",
    "pg_replslot",
    "pg_stat_tmp",
    "pgsql_tmp",
];

/// Set from the signal handler.
static SIGNALLED: AtomicBool = AtomicBool::new(false);

/// Shared flag asking an operation to stop.
///
/// A token is also cancelled once [install_signal_handlers] has run and the
/// process receives SIGINT or SIGTERM.
#[derive(Clone, Debug, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> CancelToken {
        CancelToken::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst) || SIGNALLED.load(Ordering::SeqCst)
    }

    /// Fail with [Error::Termination] if cancelled.
    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(Error::Termination)
        } else {
            Ok(())
        }
    }
}

#[cfg(unix)]
extern "C" fn note_signal(_signal: std::ffi::c_int) {
    SIGNALLED.store(true, Ordering::SeqCst);
}

/// Cancel every [CancelToken] on SIGINT or SIGTERM.
#[cfg(unix)]
pub fn install_signal_handlers() -> Result<()> {
    use nix::sys::signal::{sigaction, SaFlags, SigAction, SigHandler, SigSet, Signal};

    let action = SigAction::new(
        SigHandler::Handler(note_signal),
        SaFlags::empty(),
        SigSet::empty(),
    );
    for signal in [Signal::SIGINT, Signal::SIGTERM] {
        // SAFETY: the handler only stores to an atomic.
        unsafe { sigaction(signal, &action) }.map_err(|errno| Error::Assert {
            message: format!("failed to install {signal} handler: {errno}"),
        })?;
    }
    Ok(())
}

/// Which host a worker runs on.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Role {
    /// The host holding the repository.
    Repo,
    /// The host running the database.
    Db,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Role::Repo => "repo",
            Role::Db => "db",
        })
    }
}

/// Makes a transport to a new worker, given its role and a number
/// distinguishing it from others in the same role.
pub type Connector = dyn Fn(Role, usize) -> Result<Box<dyn Transport>> + Send + Sync;

/// Start a worker subprocess, through ssh if its host is configured.
pub fn spawn_worker(config: &Config, role: Role, index: usize) -> Result<Box<dyn Transport>> {
    let (host, user) = match role {
        Role::Repo => (config.repo_host.as_deref(), config.repo_host_user.as_deref()),
        Role::Db => (config.db_host.as_deref(), config.db_user.as_deref()),
    };
    let name = format!("{role}-{index}");
    let transport: Box<dyn Transport> = match host {
        Some(host) => Box::new(ChildTransport::spawn_ssh(
            config,
            host,
            user,
            format!("{name} on {host}"),
        )?),
        None => Box::new(ChildTransport::spawn_local(config, name)?),
    };
    Ok(transport)
}

/// What happened to a pushed segment.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PushOutcome {
    Pushed {
        archive_id: String,
        /// Where it was stored, relative to the stanza's archive directory.
        file: String,
        size: u64,
    },
    /// The same content was archived already; nothing was copied.
    AlreadyArchived { archive_id: String, warning: String },
}

/// Runs high-level operations through workers.
pub struct Controller {
    config: Config,
    connector: Arc<Connector>,
    cancel: CancelToken,
}

type WorkerRemote = Remote<Box<dyn Transport>>;

impl Controller {
    /// A controller starting workers as subprocesses.
    pub fn new(config: Config) -> Controller {
        let spawn_config = config.clone();
        Controller::with_connector(
            config,
            Arc::new(move |role, index| spawn_worker(&spawn_config, role, index)),
        )
    }

    /// A controller reaching workers through `connector`.
    pub fn with_connector(config: Config, connector: Arc<Connector>) -> Controller {
        Controller {
            config,
            connector,
            cancel: CancelToken::new(),
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// A token that stops this controller's operations when cancelled.
    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    fn connect(&self, role: Role, index: usize) -> Result<WorkerRemote> {
        let transport = (self.connector)(role, index)?;
        Remote::connect(transport, &self.config)
    }

    /// Run `f` with a new worker, then tell the worker to exit.
    ///
    /// If the session failed the worker is killed instead.
    fn with_worker<R>(&self, role: Role, f: impl FnOnce(&mut WorkerRemote) -> Result<R>) -> Result<R> {
        self.cancel.check()?;
        let mut remote = self.connect(role, 1)?;
        let result = f(&mut remote);
        let shutdown = match &result {
            Err(err) if err.is_session_fatal() => remote.kill(),
            _ => remote.exit(),
        };
        match (result, shutdown) {
            (Ok(value), Ok(())) => Ok(value),
            (Ok(_), Err(err)) => Err(err),
            (Err(err), Ok(())) => Err(err),
            (Err(err), Err(shutdown_err)) => {
                debug!(%shutdown_err, "Worker shutdown also failed");
                Err(err)
            }
        }
    }

    /// Identity of the local database.
    fn local_db_identity(&self) -> Result<DbIdentity> {
        db_identity(self.config.require_db_path()?)
    }

    /// Push one WAL segment from the local database into the archive.
    pub fn archive_push(&self, wal_path: &Path) -> Result<PushOutcome> {
        let stanza = self.config.require_stanza()?;
        let segment = WalSegment::from_path(wal_path)?;
        let identity = self.local_db_identity()?;
        let (checksum, size) = checksum_file(wal_path, false, self.config.buffer_size)?;
        debug!(%segment, %checksum, size, "Push segment");
        self.with_worker(Role::Repo, |remote| {
            let check = remote.archive_push_check(stanza, &segment, &identity, Some(&checksum))?;
            if let Some(warning) = check.warning {
                return Ok(PushOutcome::AlreadyArchived {
                    archive_id: check.archive_id,
                    warning,
                });
            }
            self.cancel.check()?;
            let file_name = archived_file_name(&segment, Some(&checksum), self.config.compress);
            let dest = segment_dir(&self.config.repo_path, stanza, &check.archive_id, &segment)
                .join(&file_name);
            let options = CopyOptions {
                dest_compress: self.config.compress,
                dest_path_create: true,
                expect_checksum: Some(checksum.clone()),
                ..CopyOptions::default()
            };
            let result = remote.copy_in(wal_path, &dest, &options)?;
            info!(%segment, archive_id = check.archive_id, size = result.size, "Pushed WAL segment");
            Ok(PushOutcome::Pushed {
                file: format!("{}/{}/{file_name}", check.archive_id, segment.log_dir()),
                archive_id: check.archive_id,
                size: result.size,
            })
        })
    }

    /// Fetch one WAL segment from the archive to `dest`.
    ///
    /// Returns false if the segment is not archived.
    pub fn archive_get(&self, segment: &WalSegment, dest: &Path) -> Result<bool> {
        let stanza = self.config.require_stanza()?;
        let identity = self.local_db_identity()?;
        self.with_worker(Role::Repo, |remote| {
            let check = remote.archive_get_check(stanza, Some(segment), &identity)?;
            let Some(found) = check.found else {
                info!(%segment, archive_id = check.archive_id, "WAL segment not found in archive");
                return Ok(false);
            };
            self.cancel.check()?;
            let source = stanza_archive_path(&self.config.repo_path, stanza).join(&found);
            let expect_checksum = source
                .file_name()
                .and_then(|name| ArchivedFile::parse(&name.to_string_lossy()))
                .and_then(|archived| archived.checksum);
            let options = CopyOptions {
                source_compressed: has_gz_extension(&source),
                expect_checksum,
                ..CopyOptions::default()
            };
            let result = remote.copy_out(&source, dest, &options)?;
            info!(%segment, found, size = result.size, "Fetched WAL segment");
            Ok(true)
        })
    }

    /// Describe archived stanzas.
    pub fn info(&self) -> Result<Vec<StanzaInfo>> {
        let stanza = self.config.stanza.as_deref();
        self.with_worker(Role::Repo, |remote| remote.info_list_stanza(stanza))
    }

    /// Record the local database's identity as the stanza's current one,
    /// after a major version upgrade or a restore to a new cluster.
    ///
    /// Returns true if the archive info changed.
    pub fn stanza_upgrade(&self) -> Result<bool> {
        let stanza = self.config.require_stanza()?;
        if let Some(host) = &self.config.repo_host {
            return Err(Error::Config {
                message: format!("stanza-upgrade must run on the repository host {host}"),
            });
        }
        let identity = self.local_db_identity()?;
        let repo_path = &self.config.repo_path;
        match ArchiveInfo::load(repo_path, stanza)? {
            None => {
                ArchiveInfo::load_or_create(repo_path, stanza, &identity)?;
                info!(stanza, %identity, "Created archive info");
                Ok(true)
            }
            Some(mut archive_info) => {
                if !archive_info.upgrade(&identity) {
                    info!(stanza, %identity, "Archive info is already current");
                    return Ok(false);
                }
                archive_info.save(repo_path, stanza)?;
                info!(stanza, %identity, archive_id = archive_info.archive_id(), "Upgraded archive info");
                Ok(true)
            }
        }
    }

    /// Directory a backup with this label is written to.
    pub fn backup_path(&self, label: &str) -> Result<PathBuf> {
        Ok(self
            .config
            .repo_path
            .join(BACKUP_DIR)
            .join(self.config.require_stanza()?)
            .join(label))
    }

    /// Copy every file in the database directory into a new backup.
    ///
    /// Files are spread across `process_max` workers on the database host.
    /// A file that fails to copy is counted and the rest carry on.
    pub fn backup_files(&self, label: &str) -> Result<CopyStats> {
        let db_path = self.config.require_db_path()?;
        let backup_path = self.backup_path(label)?;
        let entries = if self.config.db_host.is_some() {
            self.with_worker(Role::Db, |remote| {
                data_manifest(db_path, |path| remote.manifest(path))
            })?
        } else {
            data_manifest(db_path, fileops::manifest)?
        };
        let mut group = WorkerGroup::new(self.config.process_max, self.config.queue_depth)?;
        for entry in entries.iter().filter(|e| is_backed_up(e)) {
            let mut dest = backup_path.join(&entry.name);
            if self.config.compress {
                dest = with_gz_extension(&dest);
            }
            group.enqueue(WorkItem {
                path_key: path_key(&entry.name),
                source: db_path.join(&entry.name),
                dest,
                compress: self.config.compress,
                checksum: None,
                modification_time: Some(entry.mtime),
                size: entry.size.unwrap_or_default(),
            })?;
        }
        let total = group.stats().enqueued;
        info!(label, files = total, workers = self.config.process_max, "Start backup");
        group.dispatch();
        self.run_group(group)
    }

    /// Copy every item in a dispatched group, one thread per slot.
    fn run_group(&self, group: WorkerGroup) -> Result<CopyStats> {
        let slots = group.slot_count();
        let pool = ThreadPoolBuilder::new()
            .num_threads(slots)
            .thread_name(|i| format!("slot-{i}"))
            .build()
            .map_err(|err| Error::Assert {
                message: format!("failed to start thread pool: {err}"),
            })?;
        let shared = Shared {
            group: Mutex::new(group),
            changed: Condvar::new(),
            fatal: Mutex::new(None),
        };
        let remote_copy = self.config.db_host.is_some();
        let per_slot: Vec<CopyStats> =
            pool.broadcast(|ctx| self.run_slot(&shared, ctx.index(), remote_copy));
        let mut stats = per_slot.into_iter().fold(CopyStats::default(), |a, b| a + b);
        let group = shared.lock_group();
        stats.reconcile(&group.stats());
        drop(group);
        self.cancel.check()?;
        if let Some(err) = lock(&shared.fatal).take() {
            return Err(err);
        }
        info!(
            files = stats.files,
            bytes = stats.bytes,
            errors = stats.errors,
            "Backup files copied"
        );
        Ok(stats)
    }

    fn run_slot(&self, shared: &Shared, slot: usize, remote_copy: bool) -> CopyStats {
        let mut stats = CopyStats::default();
        let mut remote = match self.connect(Role::Db, slot + 1) {
            Ok(remote) => remote,
            Err(err) => {
                error!(slot, %err, "Failed to start worker");
                stats.failed_workers += 1;
                shared.retire(slot);
                return stats;
            }
        };
        while let Some(item) = shared.next_item(slot, &self.cancel) {
            let options = CopyOptions {
                dest_compress: item.compress,
                ignore_missing_source: true,
                dest_path_create: true,
                modification_time: item.modification_time,
                expect_checksum: item.checksum.clone(),
                ..CopyOptions::default()
            };
            let result: Result<CopyResult> = if remote_copy {
                remote.copy_out(&item.source, &item.dest, &options)
            } else {
                remote.copy(&item.source, &item.dest, &options)
            };
            match result {
                Ok(result) => {
                    stats.add_result(&result);
                    shared.complete(slot, true);
                }
                Err(err) if err.is_session_fatal() => {
                    error!(worker = remote.name(), %err, "Worker failed");
                    stats.failed_workers += 1;
                    shared.retire(slot);
                    if let Err(err) = remote.kill() {
                        debug!(%err, "Kill failed worker");
                    }
                    return stats;
                }
                Err(err) => {
                    warn!(source = ?item.source, %err, "Failed to copy file");
                    stats.errors += 1;
                    shared.complete(slot, false);
                }
            }
        }
        if let Err(err) = remote.exit() {
            warn!(%err, slot, "Worker did not exit cleanly");
        }
        stats
    }
}

/// State shared by the threads running a group.
struct Shared {
    group: Mutex<WorkerGroup>,
    /// Signalled whenever items complete or are returned by a retired slot.
    changed: Condvar,
    /// The first error that stops the whole operation.
    fatal: Mutex<Option<Error>>,
}

impl Shared {
    fn lock_group(&self) -> MutexGuard<'_, WorkerGroup> {
        lock(&self.group)
    }

    fn set_fatal(&self, err: Error) {
        error!(%err, "Backup failed");
        lock(&self.fatal).get_or_insert(err);
    }

    /// Wait for the next item for a slot; None once there's nothing more it
    /// can do.
    fn next_item(&self, slot: usize, cancel: &CancelToken) -> Option<WorkItem> {
        let mut group = self.lock_group();
        loop {
            if cancel.is_cancelled() {
                return None;
            }
            match group.start(slot) {
                Ok(Some(item)) => return Some(item),
                Ok(None) if group.is_done() || group.active_slots() == 0 => return None,
                // Another slot may yet fail and return its queue.
                Ok(None) => {
                    group = match self.changed.wait_timeout(group, IDLE_POLL) {
                        Ok((group, _)) => group,
                        Err(poisoned) => poisoned.into_inner().0,
                    }
                }
                Err(err) => {
                    drop(group);
                    self.set_fatal(err);
                    return None;
                }
            }
        }
    }

    fn complete(&self, slot: usize, succeeded: bool) {
        let result = self.lock_group().complete(slot, succeeded);
        self.changed.notify_all();
        if let Err(err) = result {
            self.set_fatal(err);
        }
    }

    fn retire(&self, slot: usize) {
        let result = self.lock_group().retire(slot);
        self.changed.notify_all();
        if let Err(err) = result {
            self.set_fatal(err);
        }
    }
}

/// Lock a mutex, carrying on if another thread panicked while holding it.
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// True for entries copied into a backup: files, except excluded ones.
fn is_backed_up(entry: &ManifestEntry) -> bool {
    if entry.kind != Kind::File {
        return false;
    }
    let path = Path::new(&entry.name);
    let Some(file_name) = path.file_name().and_then(|n| n.to_str()) else {
        return false;
    };
    if EXCLUDED_FILES.contains(&file_name) {
        return false;
    }
    !path.components().any(|c| match c {
        Component::Normal(name) => name.to_str().is_some_and(|n| EXCLUDED_DIRS.contains(&n)),
        _ => false,
    })
}

/// List the data directory, including the contents of each tablespace.
///
/// Tablespaces are symlinks at `pg_tblspc/<oid>`; their contents are named
/// as if they were under the link.
fn data_manifest(
    db_path: &Path,
    mut manifest: impl FnMut(&Path) -> Result<Vec<ManifestEntry>>,
) -> Result<Vec<ManifestEntry>> {
    let mut entries = manifest(db_path)?;
    let links: Vec<(String, PathBuf)> = entries
        .iter()
        .filter_map(|entry| tablespace_target(db_path, entry))
        .collect();
    for (name, target) in links {
        debug!(%name, ?target, "Follow tablespace link");
        for entry in manifest(&target)? {
            if entry.name != "." {
                entries.push(ManifestEntry {
                    name: format!("{name}/{}", entry.name),
                    ..entry
                });
            }
        }
    }
    Ok(entries)
}

/// If this entry is a tablespace link, its name and the directory it points
/// to. Relative targets are relative to `pg_tblspc`.
fn tablespace_target(db_path: &Path, entry: &ManifestEntry) -> Option<(String, PathBuf)> {
    if entry.kind != Kind::Link {
        return None;
    }
    let mut parts = entry.name.split('/');
    match (parts.next(), parts.next(), parts.next()) {
        (Some(TABLESPACE_DIR), Some(_oid), None) => {
            let target = entry.target.as_ref()?;
            Some((entry.name.clone(), db_path.join(TABLESPACE_DIR).join(target)))
        }
        _ => None,
    }
}

/// Group key for a file in the data directory: its tablespace.
fn path_key(name: &str) -> String {
    let mut parts = name.split('/');
    match (parts.next(), parts.next()) {
        (Some(TABLESPACE_DIR), Some(oid)) => format!("{TABLESPACE_DIR}/{oid}"),
        (Some(first @ ("base" | "global")), Some(_)) => first.to_owned(),
        _ => "pg_data".to_owned(),
    }
}
