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

//! The controller's side of a session: one typed call per command.

use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use tracing::{debug, trace, warn};

use crate::archive_check::{GetCheck, PushCheck};
use crate::archive_info::DbIdentity;
use crate::checksum::Checksum;
use crate::config::Config;
use crate::file_copy::{self, CopyOptions, CopyResult, Dest, Source};
use crate::fileops::{ManifestEntry, SortOrder};
use crate::protocol::command::Command;
use crate::protocol::session::{Session, SessionOptions};
use crate::protocol::wire::{expect_fields, parse_bool, parse_copy_result, parse_json_field};
use crate::stanza::StanzaInfo;
use crate::transport::Transport;
use crate::unix_mode::UnixMode;
use crate::wal::WalSegment;
use crate::{Error, Result};

/// A connection to one worker.
pub struct Remote<T: Transport> {
    session: Session<T>,
}

impl<T: Transport> Remote<T> {
    /// Handshake with a worker at the other end of `transport`.
    pub fn connect(transport: T, config: &Config) -> Result<Remote<T>> {
        Remote::with_options(transport, config.session_options())
    }

    pub fn with_options(transport: T, options: SessionOptions) -> Result<Remote<T>> {
        Ok(Remote {
            session: Session::connect(transport, options)?,
        })
    }

    /// Description of the worker, for messages.
    pub fn name(&self) -> &str {
        self.session.peer()
    }

    /// Send a command and return its result fields.
    fn call(&mut self, command: &Command) -> Result<Vec<String>> {
        trace!(worker = self.name(), cmd = command.name(), "Call");
        self.session.send_command(command)?;
        self.session.read_result()
    }

    /// Send a command whose result is one JSON field.
    fn call_json<R: DeserializeOwned>(&mut self, command: &Command) -> Result<R> {
        let fields = self.call(command)?;
        expect_fields(&fields, 1, command.name())?;
        parse_json_field(&fields[0])
    }

    fn call_empty(&mut self, command: &Command) -> Result<()> {
        let fields = self.call(command)?;
        expect_fields(&fields, 0, command.name())
    }

    pub fn noop(&mut self) -> Result<()> {
        self.call_empty(&Command::Noop)
    }

    /// Copy between two paths on the worker's host.
    pub fn copy(&mut self, source: &Path, dest: &Path, options: &CopyOptions) -> Result<CopyResult> {
        let fields = self.call(&Command::Copy {
            source: source.to_owned(),
            dest: dest.to_owned(),
            options: options.clone(),
        })?;
        parse_copy_result(&fields)
    }

    /// Copy a local file to `dest` on the worker's host.
    ///
    /// Content that's not already compressed is compressed for the trip,
    /// at the file level if the destination is to be stored compressed and
    /// otherwise at the network level.
    pub fn copy_in(&mut self, source: &Path, dest: &Path, options: &CopyOptions) -> Result<CopyResult> {
        let mut file = match File::open(source) {
            Ok(file) => file,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                if options.ignore_missing_source {
                    return Ok(CopyResult::not_copied());
                }
                return Err(Error::FileMissing {
                    path: source.to_owned(),
                });
            }
            Err(err) => {
                return Err(Error::FileOpen {
                    path: source.to_owned(),
                    source: err,
                })
            }
        };
        let SessionOptions {
            buffer_size,
            compress_level,
            compress_level_network,
        } = *self.session.options();
        let stream_compressed =
            options.source_compressed || options.dest_compress || compress_level_network > 0;
        let level = if options.dest_compress {
            compress_level
        } else {
            compress_level_network
        };
        let local_options = CopyOptions {
            source_compressed: options.source_compressed,
            dest_compress: stream_compressed,
            ..CopyOptions::default()
        };
        self.session.send_command(&Command::CopyIn {
            dest: dest.to_owned(),
            options: CopyOptions {
                source_compressed: stream_compressed,
                ..options.clone()
            },
        })?;
        let mut writer = self.session.block_writer();
        let sent = match file_copy::copy(
            Source::Reader(&mut file),
            Dest::Writer(&mut writer),
            &local_options,
            level,
            buffer_size,
        ) {
            Ok(sent) => {
                writer.finish()?;
                sent
            }
            Err(err) if err.is_session_fatal() => return Err(err),
            Err(err) => {
                // Tell the worker to abandon the file; it answers with an
                // error of its own, which is less interesting than ours.
                self.session.write_error(&err.to_remote())?;
                self.read_abandoned_result()?;
                return Err(err);
            }
        };
        let received = parse_copy_result(&self.session.read_result()?)?;
        check_same_checksum(dest, &sent, &received)?;
        debug!(?source, ?dest, size = received.size, worker = self.name(), "Copied in");
        Ok(received)
    }

    /// Copy `source` on the worker's host to a local file.
    ///
    /// The local file is only renamed into place once the worker has
    /// confirmed the content and its checksum matches.
    pub fn copy_out(&mut self, source: &Path, dest: &Path, options: &CopyOptions) -> Result<CopyResult> {
        let SessionOptions {
            buffer_size,
            compress_level,
            compress_level_network,
        } = *self.session.options();
        let pipe_level = if options.source_compressed {
            0
        } else {
            compress_level_network
        };
        let stream_compressed = options.source_compressed || pipe_level > 0;
        self.session.send_command(&Command::CopyOut {
            source: source.to_owned(),
            options: CopyOptions {
                source_compressed: options.source_compressed,
                ignore_missing_source: options.ignore_missing_source,
                expect_checksum: options.expect_checksum.clone(),
                ..CopyOptions::default()
            },
            pipe_level,
        })?;
        let local_options = CopyOptions {
            source_compressed: stream_compressed,
            ignore_missing_source: false,
            ..options.clone()
        };
        let mut reader = self.session.block_reader();
        if reader.at_end()? {
            // Nothing came: the source is missing, or empty and sent as is.
            let sent = parse_copy_result(&self.session.read_result()?)?;
            if !sent.copied {
                debug!(?source, "Source missing on worker; not copied");
                return Ok(CopyResult::not_copied());
            }
            if stream_compressed {
                return Err(Error::Protocol {
                    message: format!("empty compressed stream for {source:?}"),
                });
            }
            let pending = file_copy::write_pending(
                Source::Reader(&mut io::empty()),
                Dest::Path(dest),
                &local_options,
                compress_level,
                buffer_size,
            )?
            .ok_or_else(|| Error::Assert {
                message: "stream source reported missing".into(),
            })?;
            check_same_checksum(dest, &sent, pending.result())?;
            return pending.publish();
        }
        let written = file_copy::write_pending(
            Source::Reader(&mut reader),
            Dest::Path(dest),
            &local_options,
            compress_level,
            buffer_size,
        );
        match written {
            Ok(Some(pending)) => {
                let sent = parse_copy_result(&self.session.read_result()?)?;
                if !sent.copied {
                    debug!(?source, "Source missing on worker; not copied");
                    return Ok(CopyResult::not_copied());
                }
                check_same_checksum(dest, &sent, pending.result())?;
                let result = pending.publish()?;
                debug!(?source, ?dest, size = result.size, worker = self.name(), "Copied out");
                Ok(result)
            }
            Ok(None) => Err(Error::Assert {
                message: "stream source reported missing".into(),
            }),
            // The worker's error took the place of a block, and is its
            // whole result.
            Err(err @ Error::Remote(_)) => Err(err),
            Err(err) if err.is_session_fatal() => Err(err),
            Err(err) => {
                match reader.drain() {
                    Ok(()) => self.read_abandoned_result()?,
                    Err(Error::Remote(_)) => (),
                    Err(fatal) => return Err(fatal),
                }
                Err(err)
            }
        }
    }

    /// Read the result of a command we've already given up on, returning
    /// only errors that end the session.
    fn read_abandoned_result(&mut self) -> Result<()> {
        match self.session.read_result() {
            Err(err) if err.is_session_fatal() => Err(err),
            other => {
                trace!(?other, "Discard result");
                Ok(())
            }
        }
    }

    pub fn list(
        &mut self,
        path: &Path,
        expression: Option<&str>,
        sort: SortOrder,
        ignore_missing: bool,
    ) -> Result<Vec<String>> {
        self.call(&Command::List {
            path: path.to_owned(),
            expression: expression.map(str::to_owned),
            sort,
            ignore_missing,
        })
    }

    pub fn path_create(&mut self, path: &Path, mode: Option<UnixMode>, ignore_exists: bool) -> Result<()> {
        self.call_empty(&Command::PathCreate {
            path: path.to_owned(),
            mode,
            ignore_exists,
        })
    }

    pub fn exists(&mut self, path: &Path) -> Result<bool> {
        let fields = self.call(&Command::Exists {
            path: path.to_owned(),
        })?;
        expect_fields(&fields, 1, "exists")?;
        parse_bool(&fields[0])
    }

    /// Wait until the next second on the worker, returning the time there.
    pub fn wait(&mut self) -> Result<i64> {
        let fields = self.call(&Command::Wait)?;
        expect_fields(&fields, 1, "wait")?;
        fields[0].parse().map_err(|_| Error::Protocol {
            message: format!("invalid time {:?} from wait", fields[0]),
        })
    }

    pub fn manifest(&mut self, path: &Path) -> Result<Vec<ManifestEntry>> {
        self.call_json(&Command::Manifest {
            path: path.to_owned(),
        })
    }

    pub fn archive_push_check(
        &mut self,
        stanza: &str,
        segment: &WalSegment,
        identity: &DbIdentity,
        checksum: Option<&Checksum>,
    ) -> Result<PushCheck> {
        self.call_json(&Command::ArchivePushCheck {
            stanza: stanza.to_owned(),
            wal_segment: segment.clone(),
            db_version: identity.version.clone(),
            db_system_id: identity.system_id,
            checksum: checksum.cloned(),
        })
    }

    pub fn archive_get_check(
        &mut self,
        stanza: &str,
        segment: Option<&WalSegment>,
        identity: &DbIdentity,
    ) -> Result<GetCheck> {
        self.call_json(&Command::ArchiveGetCheck {
            stanza: stanza.to_owned(),
            wal_segment: segment.cloned(),
            db_version: identity.version.clone(),
            db_system_id: identity.system_id,
        })
    }

    pub fn info_list_stanza(&mut self, stanza: Option<&str>) -> Result<Vec<StanzaInfo>> {
        self.call_json(&Command::InfoListStanza {
            stanza: stanza.map(str::to_owned),
        })
    }

    /// Identity of the database on the worker's host.
    pub fn db_info(&mut self) -> Result<DbIdentity> {
        self.call_json(&Command::DbInfo)
    }

    /// Tell the worker to exit and wait for it to finish.
    ///
    /// If the worker can't be told, it's killed.
    pub fn exit(mut self) -> Result<()> {
        let name = self.name().to_owned();
        let said = self.call_empty(&Command::Exit);
        if let Err(err) = &said {
            warn!(worker = name, %err, "Worker did not exit cleanly; killing it");
            if let Err(err) = self.session.transport_mut().kill() {
                warn!(worker = name, %err, "Failed to kill worker");
            }
        }
        self.session.close()?;
        said
    }

    /// Stop the worker without asking it.
    pub fn kill(mut self) -> Result<()> {
        let peer = self.name().to_owned();
        self.session
            .transport_mut()
            .kill()
            .map_err(|source| Error::Transport { peer, source })?;
        self.session.close()
    }
}

/// The content the worker saw must be what we saw.
fn check_same_checksum(path: &Path, ours: &CopyResult, theirs: &CopyResult) -> Result<()> {
    if ours.checksum == theirs.checksum && ours.size == theirs.size {
        Ok(())
    } else {
        Err(Error::Checksum {
            path: PathBuf::from(path),
            expected: display_checksum(ours.checksum.as_ref()),
            actual: display_checksum(theirs.checksum.as_ref()),
        })
    }
}

fn display_checksum(checksum: Option<&Checksum>) -> String {
    checksum.map_or_else(|| "none".to_owned(), Checksum::to_string)
}
