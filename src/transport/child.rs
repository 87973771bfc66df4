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

//! Workers running as child processes, locally or through ssh.

use std::io::{self, Read, Write};
use std::process::{Child, ChildStdin, ChildStdout, Command, ExitStatus, Stdio};
use std::thread::sleep;
use std::time::{Duration, Instant};

use tracing::{debug, trace, warn};

use super::Transport;
use crate::config::Config;
use crate::{Error, Result};

const EXIT_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// A transport to a worker subprocess, talking over its stdin and stdout.
///
/// The child's stderr is inherited so its log messages reach the user.
pub struct ChildTransport {
    child: Child,
    /// None once closed, which signals end of input to the child.
    stdin: Option<ChildStdin>,
    stdout: ChildStdout,
    name: String,
    exit_timeout: Duration,
    reaped: bool,
}

impl ChildTransport {
    /// Start a subprocess.
    ///
    /// `exit_timeout` bounds how long [Transport::close] waits for the child
    /// to exit before killing it.
    pub fn spawn(
        mut command: Command,
        name: impl Into<String>,
        exit_timeout: Duration,
    ) -> Result<ChildTransport> {
        let name = name.into();
        debug!(?command, name, "Start worker");
        let mut child = command
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .spawn()
            .map_err(|source| Error::HostConnect {
                host: name.clone(),
                source,
            })?;
        let (Some(stdin), Some(stdout)) = (child.stdin.take(), child.stdout.take()) else {
            let _ = child.kill();
            return Err(Error::HostConnect {
                host: name,
                source: io::Error::new(io::ErrorKind::BrokenPipe, "child has no stdio pipes"),
            });
        };
        Ok(ChildTransport {
            child,
            stdin: Some(stdin),
            stdout,
            name,
            exit_timeout,
            reaped: false,
        })
    }

    /// Start a worker on this host.
    pub fn spawn_local(config: &Config, name: impl Into<String>) -> Result<ChildTransport> {
        let mut command = Command::new(&config.worker_command);
        command.arg("worker").args(config.worker_args());
        ChildTransport::spawn(command, name, config.protocol_timeout())
    }

    /// Start a worker on another host through ssh.
    pub fn spawn_ssh(
        config: &Config,
        host: &str,
        user: Option<&str>,
        name: impl Into<String>,
    ) -> Result<ChildTransport> {
        let mut command = Command::new(&config.cmd_ssh);
        command.args([
            "-o",
            "LogLevel=error",
            "-o",
            "Compression=no",
            "-o",
            "PasswordAuthentication=no",
        ]);
        match user {
            Some(user) => command.arg(format!("{user}@{host}")),
            None => command.arg(host),
        };
        command.arg(remote_command_line(config));
        ChildTransport::spawn(command, name, config.protocol_timeout())
    }

    fn wait_with_timeout(&mut self) -> io::Result<Option<ExitStatus>> {
        let deadline = Instant::now() + self.exit_timeout;
        loop {
            if let Some(status) = self.child.try_wait()? {
                self.reaped = true;
                return Ok(Some(status));
            }
            if Instant::now() >= deadline {
                return Ok(None);
            }
            sleep(EXIT_POLL_INTERVAL);
        }
    }

    fn kill_and_reap(&mut self) -> io::Result<()> {
        self.stdin = None;
        if !self.reaped {
            // The child may have exited since we last looked.
            if let Err(err) = self.child.kill() {
                trace!(?err, name = self.name, "Kill worker");
            }
            self.child.wait()?;
            self.reaped = true;
        }
        Ok(())
    }
}

/// The command run by the remote shell, with each word quoted.
fn remote_command_line(config: &Config) -> String {
    let mut words = vec![config.worker_command.clone(), "worker".to_owned()];
    words.extend(config.worker_args());
    words
        .iter()
        .map(|w| shell_quote(w))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Quote a word for a POSIX shell.
fn shell_quote(word: &str) -> String {
    if !word.is_empty()
        && word
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./=:@,+".contains(c))
    {
        word.to_owned()
    } else {
        format!("'{}'", word.replace('\'', r"'\''"))
    }
}

impl Read for ChildTransport {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.stdout.read(buf)
    }
}

impl Write for ChildTransport {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self.stdin.as_mut() {
            Some(stdin) => stdin.write(buf),
            None => Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "worker input already closed",
            )),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self.stdin.as_mut() {
            Some(stdin) => stdin.flush(),
            None => Ok(()),
        }
    }
}

impl Transport for ChildTransport {
    fn describe(&self) -> String {
        self.name.clone()
    }

    /// Close the child's input and wait for it to exit, killing it if it
    /// takes longer than the exit timeout.
    fn close(&mut self) -> io::Result<()> {
        if self.reaped {
            return Ok(());
        }
        if let Some(mut stdin) = self.stdin.take() {
            // The child may already be gone, in which case the flush fails
            // harmlessly.
            let _ = stdin.flush();
        }
        match self.wait_with_timeout()? {
            Some(status) if status.success() => {
                debug!(name = self.name, "Worker exited");
                Ok(())
            }
            Some(status) => {
                warn!(name = self.name, %status, "Worker exited with failure");
                Ok(())
            }
            None => {
                warn!(
                    name = self.name,
                    timeout = ?self.exit_timeout,
                    "Worker did not exit in time; killing it"
                );
                self.kill_and_reap()
            }
        }
    }

    fn kill(&mut self) -> io::Result<()> {
        self.kill_and_reap()
    }
}

impl Drop for ChildTransport {
    fn drop(&mut self) {
        if !self.reaped {
            let _ = self.close();
        }
    }
}
