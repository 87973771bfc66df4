// pgvault: PostgreSQL WAL archive and backup agent.
// Copyright 2015-2025 Martin Pool.

// This program is free software; you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation; either version 2 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.

//! Errors, error codes, and the error form carried across the protocol.
//!
//! Errors fall into two groups. Session-fatal errors (transport and protocol
//! faults) end the session they occur on. Everything else is an operation
//! error: the worker reports it as one result line and carries on.

use std::io;
use std::path::PathBuf;

use strum::IntoEnumIterator;
use strum_macros::{Display, EnumIter, EnumString};
use thiserror::Error;

/// Numeric error codes, reported on the wire and used as process exit codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, EnumIter)]
pub enum ErrorCode {
    Assert = 25,
    Checksum = 26,
    FileInvalid = 28,
    Format = 29,
    OptionInvalidValue = 32,
    HostConnect = 39,
    FileOpen = 41,
    FileRead = 42,
    FileWrite = 43,
    ArchiveMismatchVersion = 44,
    ArchiveDuplicate = 45,
    ArchiveMismatchSystemId = 46,
    ProtocolMismatch = 52,
    FileMissing = 55,
    Protocol = 57,
    Transport = 58,
    Termination = 63,
    PathOpen = 72,
    PathMissing = 73,
    PathCreate = 74,
}

impl ErrorCode {
    pub fn as_u32(self) -> u32 {
        self as u32
    }

    /// Look up a code received from a peer.
    pub fn from_u32(code: u32) -> Option<ErrorCode> {
        ErrorCode::iter().find(|c| c.as_u32() == code)
    }
}

/// How serious an error reported by a worker is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumString)]
#[strum(serialize_all = "lowercase")]
pub enum Severity {
    Warn,
    Error,
    Fatal,
}

/// An error reported by a worker, decoded from a result line.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("[{code:03}] {message}")]
pub struct RemoteError {
    /// Numeric code; may be one this version does not know.
    pub code: u32,
    pub severity: Severity,
    pub message: String,
    pub hint: Option<String>,
}

impl RemoteError {
    pub fn new(code: ErrorCode, severity: Severity, message: impl Into<String>) -> RemoteError {
        RemoteError {
            code: code.as_u32(),
            severity,
            message: message.into(),
            hint: None,
        }
    }

    pub fn with_hint(self, hint: Option<String>) -> RemoteError {
        RemoteError { hint, ..self }
    }

    pub fn error_code(&self) -> Option<ErrorCode> {
        ErrorCode::from_u32(self.code)
    }
}

/// pgvault specific error.
#[derive(Debug, Error)]
pub enum Error {
    #[error("Assertion failed: {message}")]
    Assert { message: String },

    #[error("Checksum mismatch on {path:?}: expected {expected}, got {actual}")]
    Checksum {
        path: PathBuf,
        expected: String,
        actual: String,
    },

    #[error("Invalid file {path:?}: {message}")]
    FileInvalid { path: PathBuf, message: String },

    #[error("Invalid JSON in {path:?}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("Invalid WAL segment name {name:?}")]
    InvalidWalSegment { name: String },

    #[error("Invalid configuration: {message}")]
    Config { message: String },

    #[error("Failed to start worker on {host}")]
    HostConnect {
        host: String,
        #[source]
        source: io::Error,
    },

    #[error("Failed to open {path:?}")]
    FileOpen {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Failed to read {path:?}")]
    FileRead {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Failed to write {path:?}")]
    FileWrite {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Failed to copy {from} to {to}")]
    Copy {
        from: String,
        to: String,
        #[source]
        source: io::Error,
    },

    #[error("Unable to open missing file {path:?} for read")]
    FileMissing { path: PathBuf },

    #[error("Failed to list directory {path:?}")]
    PathOpen {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Directory {path:?} does not exist")]
    PathMissing { path: PathBuf },

    #[error("Failed to create directory {path:?}")]
    PathCreate {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error(
        "WAL segment version {db_version} does not match archive version {archive_version} for stanza {stanza:?}"
    )]
    ArchiveMismatchVersion {
        stanza: String,
        db_version: String,
        archive_version: String,
    },

    #[error(
        "WAL segment system-id {db_system_id} does not match archive system-id {archive_system_id} for stanza {stanza:?}"
    )]
    ArchiveMismatchSystemId {
        stanza: String,
        db_system_id: u64,
        archive_system_id: u64,
    },

    #[error("WAL segment {segment} already exists in the archive as {existing:?} with different content")]
    ArchiveDuplicate { segment: String, existing: String },

    #[error("Archive info for stanza {stanza:?} does not exist at {path:?}")]
    ArchiveInfoMissing { stanza: String, path: PathBuf },

    #[error("Protocol version mismatch: expected {expected:?}, received {received:?}")]
    ProtocolMismatch { expected: String, received: String },

    #[error("Protocol error: {message}")]
    Protocol { message: String },

    #[error("Transport error on {peer}")]
    Transport {
        peer: String,
        #[source]
        source: io::Error,
    },

    #[error("All workers failed with {remaining} items undelivered")]
    WorkersExhausted { remaining: usize },

    #[error("Terminated on signal")]
    Termination,

    #[error(transparent)]
    Remote(#[from] RemoteError),
}

impl Error {
    /// The numeric code for this error.
    pub fn code(&self) -> u32 {
        use Error::*;
        let code = match self {
            Assert { .. } => ErrorCode::Assert,
            Checksum { .. } => ErrorCode::Checksum,
            FileInvalid { .. } | Json { .. } => ErrorCode::FileInvalid,
            InvalidWalSegment { .. } => ErrorCode::Format,
            Config { .. } => ErrorCode::OptionInvalidValue,
            HostConnect { .. } => ErrorCode::HostConnect,
            FileOpen { .. } => ErrorCode::FileOpen,
            FileRead { .. } => ErrorCode::FileRead,
            FileWrite { .. } | Copy { .. } => ErrorCode::FileWrite,
            FileMissing { .. } | ArchiveInfoMissing { .. } => ErrorCode::FileMissing,
            PathOpen { .. } => ErrorCode::PathOpen,
            PathMissing { .. } => ErrorCode::PathMissing,
            PathCreate { .. } => ErrorCode::PathCreate,
            ArchiveMismatchVersion { .. } => ErrorCode::ArchiveMismatchVersion,
            ArchiveMismatchSystemId { .. } => ErrorCode::ArchiveMismatchSystemId,
            ArchiveDuplicate { .. } => ErrorCode::ArchiveDuplicate,
            ProtocolMismatch { .. } => ErrorCode::ProtocolMismatch,
            Protocol { .. } => ErrorCode::Protocol,
            Transport { .. } | WorkersExhausted { .. } => ErrorCode::Transport,
            Termination => ErrorCode::Termination,
            Remote(remote) => return remote.code,
        };
        code.as_u32()
    }

    /// A suggestion to the user for how to fix the problem, if there is one.
    pub fn hint(&self) -> Option<String> {
        match self {
            Error::ArchiveMismatchVersion { .. } | Error::ArchiveMismatchSystemId { .. } => Some(
                "are you archiving to the correct stanza? the stanza may be misconfigured".into(),
            ),
            Error::ArchiveInfoMissing { .. } => {
                Some("has archive-push been run for this stanza?".into())
            }
            Error::ProtocolMismatch { .. } => {
                Some("is the same version of pgvault installed on every host?".into())
            }
            Error::Remote(remote) => remote.hint.clone(),
            _ => None,
        }
    }

    /// True if this error means the session it occurred on can't continue.
    pub fn is_session_fatal(&self) -> bool {
        matches!(
            self,
            Error::Transport { .. }
                | Error::HostConnect { .. }
                | Error::Protocol { .. }
                | Error::ProtocolMismatch { .. }
                | Error::Termination
        )
    }

    /// The form of this error reported back to the controller.
    pub fn to_remote(&self) -> RemoteError {
        match self {
            Error::Remote(remote) => remote.clone(),
            err => {
                let severity = match err {
                    Error::Protocol { .. } | Error::ProtocolMismatch { .. } => Severity::Fatal,
                    _ => Severity::Error,
                };
                RemoteError {
                    code: err.code(),
                    severity,
                    message: error_chain_message(err),
                    hint: err.hint(),
                }
            }
        }
    }
}

/// Format an error and all its sources on one line.
pub fn error_chain_message(err: &dyn std::error::Error) -> String {
    let mut message = err.to_string();
    let mut source = err.source();
    while let Some(s) = source {
        message.push_str(": ");
        message.push_str(&s.to_string());
        source = s.source();
    }
    message
}

/// Carry an [Error] through an interface that returns [io::Error], such as
/// a [Read] or [Write] implementation.
///
/// [Read]: std::io::Read
/// [Write]: std::io::Write
pub(crate) fn wrap_in_io_error(err: Error) -> io::Error {
    io::Error::other(err)
}

/// Recover an [Error] wrapped by [wrap_in_io_error], or return the io error
/// unchanged if it's not one.
pub(crate) fn unwrap_io_error(err: io::Error) -> std::result::Result<Error, io::Error> {
    if !err.get_ref().is_some_and(|inner| inner.is::<Error>()) {
        return Err(err);
    }
    let kind = err.kind();
    match err.into_inner().map(|inner| inner.downcast::<Error>()) {
        Some(Ok(inner)) => Ok(*inner),
        Some(Err(inner)) => Err(io::Error::new(kind, inner)),
        None => Err(io::Error::from(kind)),
    }
}

pub type Result<T> = std::result::Result<T, Error>;
