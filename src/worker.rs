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

//! The worker's command loop.
//!
//! A worker reads one command at a time from its session, runs it, and
//! answers with one result line. Failures of a command are reported to the
//! controller and the loop carries on; only session-fatal errors end it.

use std::path::{Path, PathBuf};

use tracing::{debug, info, instrument, warn};

use crate::archive_check::ArchiveCheck;
use crate::archive_info::DbIdentity;
use crate::config::Config;
use crate::db_info::db_identity;
use crate::errors::{RemoteError, Severity};
use crate::file_copy::{self, CopyOptions, Dest, Source};
use crate::fileops;
use crate::jsonio::to_json_string;
use crate::misc::require_absolute;
use crate::protocol::command::{Command, Request};
use crate::protocol::session::{Session, SessionOptions};
use crate::protocol::wire::{encode_bool, encode_copy_result};
use crate::stanza::info_list_stanza;
use crate::transport::Transport;
use crate::{Error, ErrorCode, Result};

/// Serves commands from a controller over one session.
pub struct Worker<T: Transport> {
    session: Session<T>,
    archive_check: ArchiveCheck,
    db_path: Option<PathBuf>,
    commands_run: usize,
}

impl<T: Transport> Worker<T> {
    pub fn new(session: Session<T>, config: &Config) -> Worker<T> {
        let archive_check = ArchiveCheck::new(&config.repo_path, session.options().buffer_size);
        Worker {
            session,
            archive_check,
            db_path: config.db_path.clone(),
            commands_run: 0,
        }
    }

    /// Accept a session on `transport` and serve it until the controller
    /// says to exit.
    pub fn serve(transport: T, config: &Config) -> Result<()> {
        let session = Session::accept(transport, config.session_options())?;
        Worker::new(session, config).run()
    }

    /// Run commands until `exit`.
    ///
    /// Returns an error only if the session can't continue.
    pub fn run(mut self) -> Result<()> {
        loop {
            let command = match self.session.read_request()? {
                Request::Command(command) => command,
                Request::Unrecognized { cmd, message } => {
                    warn!(cmd, message, "Unrecognized command");
                    self.session.write_error(&RemoteError::new(
                        ErrorCode::Protocol,
                        Severity::Fatal,
                        format!("invalid command {cmd:?}: {message}"),
                    ))?;
                    continue;
                }
            };
            if command == Command::Exit {
                self.session.write_ok::<&str>(&[])?;
                info!(commands = self.commands_run, "Worker exiting");
                return Ok(());
            }
            self.commands_run += 1;
            let name = command.name();
            match self.execute(command) {
                Ok(fields) => self.session.write_ok(&fields)?,
                Err(err) if err.is_session_fatal() => return Err(err),
                Err(err) => {
                    debug!(name, %err, "Command failed");
                    self.session.write_error(&err.to_remote())?;
                }
            }
        }
    }

    /// Run one command and return its result fields.
    ///
    /// Commands that stream content read or write their blocks here, so
    /// on return the session is ready for the result line.
    #[instrument(skip_all, fields(cmd = command.name()))]
    fn execute(&mut self, command: Command) -> Result<Vec<String>> {
        let SessionOptions {
            buffer_size,
            compress_level,
            ..
        } = *self.session.options();
        match command {
            Command::Copy {
                source,
                dest,
                options,
            } => {
                require_absolute(&source)?;
                require_absolute(&dest)?;
                let result = file_copy::copy(
                    Source::Path(&source),
                    Dest::Path(&dest),
                    &options,
                    compress_level,
                    buffer_size,
                )?;
                Ok(encode_copy_result(&result))
            }
            Command::CopyIn { dest, options } => self.copy_in(&dest, &options),
            Command::CopyOut {
                source,
                options,
                pipe_level,
            } => self.copy_out(&source, options, pipe_level),
            Command::List {
                path,
                expression,
                sort,
                ignore_missing,
            } => {
                require_absolute(&path)?;
                fileops::list(&path, expression.as_deref(), sort, ignore_missing)
            }
            Command::PathCreate {
                path,
                mode,
                ignore_exists,
            } => {
                require_absolute(&path)?;
                fileops::path_create(&path, mode, ignore_exists)?;
                Ok(Vec::new())
            }
            Command::Exists { path } => {
                require_absolute(&path)?;
                Ok(vec![encode_bool(fileops::exists(&path)?)])
            }
            Command::Wait => Ok(vec![fileops::wait().to_string()]),
            Command::Manifest { path } => {
                require_absolute(&path)?;
                Ok(vec![to_json_string(&fileops::manifest(&path)?)?])
            }
            Command::ArchivePushCheck {
                stanza,
                wal_segment,
                db_version,
                db_system_id,
                checksum,
            } => {
                let identity = DbIdentity::new(db_version, db_system_id);
                let check = self.archive_check.push_check(
                    &stanza,
                    &wal_segment,
                    &identity,
                    checksum.as_ref(),
                )?;
                Ok(vec![to_json_string(&check)?])
            }
            Command::ArchiveGetCheck {
                stanza,
                wal_segment,
                db_version,
                db_system_id,
            } => {
                let identity = DbIdentity::new(db_version, db_system_id);
                let check =
                    self.archive_check
                        .get_check(&stanza, wal_segment.as_ref(), &identity)?;
                Ok(vec![to_json_string(&check)?])
            }
            Command::InfoListStanza { stanza } => {
                let stanzas = info_list_stanza(self.archive_check.repo_path(), stanza.as_deref())?;
                Ok(vec![to_json_string(&stanzas)?])
            }
            Command::DbInfo => {
                let db_path = self.db_path.as_deref().ok_or_else(|| Error::Config {
                    message: "this worker has no db-path".into(),
                })?;
                Ok(vec![to_json_string(&db_identity(db_path)?)?])
            }
            Command::Noop => Ok(Vec::new()),
            Command::Exit => Err(Error::Assert {
                message: "exit is handled by the command loop".into(),
            }),
        }
    }

    /// Write a file from blocks sent by the controller.
    ///
    /// If the copy fails the rest of the stream is read and discarded, so
    /// the session stays in step.
    fn copy_in(&mut self, dest: &Path, options: &CopyOptions) -> Result<Vec<String>> {
        let SessionOptions {
            buffer_size,
            compress_level,
            ..
        } = *self.session.options();
        let mut reader = self.session.block_reader();
        let outcome = require_absolute(dest).and_then(|()| {
            file_copy::write_pending(
                Source::Reader(&mut reader),
                Dest::Path(dest),
                options,
                compress_level,
                buffer_size,
            )
        });
        match outcome {
            Ok(Some(pending)) => Ok(encode_copy_result(&pending.publish()?)),
            Ok(None) => Err(Error::Assert {
                message: "stream source reported missing".into(),
            }),
            Err(err) if err.is_session_fatal() => Err(err),
            Err(err) => {
                reader.drain()?;
                Err(err)
            }
        }
    }

    /// Send a file to the controller as blocks followed by the result.
    ///
    /// If reading the source fails part way, the error line takes the place
    /// of the next block header and is the command's only result.
    fn copy_out(
        &mut self,
        source: &Path,
        mut options: CopyOptions,
        pipe_level: u32,
    ) -> Result<Vec<String>> {
        require_absolute(source)?;
        let buffer_size = self.session.options().buffer_size;
        // Compressed sources go through as they are.
        options.dest_compress = options.source_compressed || pipe_level > 0;
        let mut writer = self.session.block_writer();
        let result = file_copy::copy(
            Source::Path(source),
            Dest::Writer(&mut writer),
            &options,
            pipe_level,
            buffer_size,
        )?;
        writer.finish()?;
        Ok(encode_copy_result(&result))
    }
}
