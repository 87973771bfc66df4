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

//! Command-line entry point for pgvault.

use std::error::Error as _;
use std::io::{self, Write};
use std::path::PathBuf;
use std::time::Instant;

use clap::{Parser, Subcommand};
use time::macros::format_description;
use time::OffsetDateTime;
use tracing::{debug, error, info, warn, Level};

use pgvault::controller::{install_signal_handlers, PushOutcome};
use pgvault::transport::StdioTransport;
use pgvault::ui::{self, TraceTimeStyle};
use pgvault::*;

#[derive(Debug, Parser)]
#[command(author, about, version)]
struct Args {
    #[command(subcommand)]
    command: Command,

    #[command(flatten)]
    config: Config,

    /// Show debug trace on stderr.
    #[arg(long, short = 'D', global = true)]
    debug: bool,

    /// Control timestamps prefixes on stderr.
    #[arg(long, value_enum, global = true, default_value_t = TraceTimeStyle::None)]
    trace_time: TraceTimeStyle,

    /// Append a json formatted log to this file.
    #[arg(long, global = true)]
    log_json: Option<PathBuf>,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Serve commands from a controller on stdin and stdout.
    ///
    /// This is started by other pgvault commands, locally or through ssh.
    #[command(hide = true)]
    Worker,

    /// Push a WAL segment into the archive.
    ArchivePush {
        /// Path of the segment, as given by PostgreSQL's archive_command %p.
        wal_path: PathBuf,
    },

    /// Fetch a WAL segment from the archive.
    ///
    /// Exits with status 1 if the segment is not archived.
    ArchiveGet {
        /// Name of the segment, as given by restore_command %f.
        segment: WalSegment,
        /// Where to write it, as given by restore_command %p.
        dest: PathBuf,
    },

    /// Copy the database's files into a new backup.
    BackupFiles {
        /// Name of the backup directory; by default based on the time.
        #[arg(long)]
        label: Option<String>,
        #[arg(long)]
        no_stats: bool,
    },

    /// Describe archived stanzas.
    Info {
        /// Print JSON rather than text.
        #[arg(long)]
        json: bool,
    },

    /// Make the database's current identity the stanza's, after an upgrade.
    StanzaUpgrade,
}

enum ExitCode {
    Success,
    /// The requested thing doesn't exist, but nothing went wrong.
    NotFound,
    /// Failed with this error code.
    Error(u32),
}

impl std::process::Termination for ExitCode {
    fn report(self) -> std::process::ExitCode {
        match self {
            ExitCode::Success => 0.into(),
            ExitCode::NotFound => 1.into(),
            ExitCode::Error(code) => u8::try_from(code).unwrap_or(u8::MAX).into(),
        }
    }
}

impl Command {
    fn run(&self, config: &Config) -> Result<ExitCode> {
        let mut stdout = io::stdout();
        match self {
            Command::Worker => {
                Worker::serve(StdioTransport::new(), config)?;
            }
            Command::ArchivePush { wal_path } => match controller(config)?.archive_push(wal_path)? {
                PushOutcome::Pushed { file, size, .. } => {
                    debug!(%file, size, "Push complete");
                }
                PushOutcome::AlreadyArchived { warning, .. } => {
                    warn!("{warning}");
                }
            },
            Command::ArchiveGet { segment, dest } => {
                if !controller(config)?.archive_get(segment, dest)? {
                    return Ok(ExitCode::NotFound);
                }
            }
            Command::BackupFiles { label, no_stats } => {
                let label = match label {
                    Some(label) => label.clone(),
                    None => default_label()?,
                };
                let stats = controller(config)?.backup_files(&label)?;
                if !no_stats {
                    write!(stdout, "Backup {label} complete.\n{stats}").map_err(stdout_error)?;
                }
                if stats.has_errors() {
                    error!(errors = stats.errors, "Some files were not copied");
                    return Ok(ExitCode::Error(ErrorCode::FileWrite.as_u32()));
                }
            }
            Command::Info { json } => {
                let stanzas = controller(config)?.info()?;
                if *json {
                    let text = serde_json::to_string_pretty(&stanzas).map_err(|err| Error::Assert {
                        message: format!("failed to format JSON: {err}"),
                    })?;
                    writeln!(stdout, "{text}").map_err(stdout_error)?;
                } else {
                    for stanza in stanzas {
                        writeln!(stdout, "{stanza}").map_err(stdout_error)?;
                    }
                }
            }
            Command::StanzaUpgrade => {
                if controller(config)?.stanza_upgrade()? {
                    info!("Stanza upgraded");
                }
            }
        }
        Ok(ExitCode::Success)
    }
}

fn controller(config: &Config) -> Result<Controller> {
    install_signal_handlers()?;
    Ok(Controller::new(config.clone()))
}

fn default_label() -> Result<String> {
    OffsetDateTime::now_utc()
        .format(format_description!("[year][month][day]-[hour][minute][second]F"))
        .map_err(|err| Error::Assert {
            message: format!("failed to format backup label: {err}"),
        })
}

fn stdout_error(source: io::Error) -> Error {
    Error::FileWrite {
        path: PathBuf::from("<stdout>"),
        source,
    }
}

fn main() -> ExitCode {
    let args = Args::parse();
    let start_time = Instant::now();
    let trace_level = if args.debug {
        Level::TRACE
    } else {
        Level::INFO
    };
    let _flush_guard = match ui::enable_tracing(args.trace_time, trace_level, args.log_json.as_deref()) {
        Ok(guard) => guard,
        Err(err) => {
            eprintln!("pgvault: {err}");
            return ExitCode::Error(err.code());
        }
    };
    let result = args
        .config
        .validate()
        .and_then(|()| args.command.run(&args.config));
    debug!(elapsed = ?start_time.elapsed());
    match result {
        Err(err) => {
            error!(code = err.code(), "{err}");
            let mut source = err.source();
            while let Some(cause) = source {
                error!("caused by: {cause}");
                source = cause.source();
            }
            if let Some(hint) = err.hint() {
                info!("HINT: {hint}");
            }
            ExitCode::Error(err.code())
        }
        Ok(exit_code) => exit_code,
    }
}

#[test]
fn verify_clap() {
    use clap::CommandFactory;
    Args::command().debug_assert()
}
