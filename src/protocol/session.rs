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

//! One end of a conversation over a [Transport].

use std::io::{self, BufRead, BufReader, Read, Write};

use bytes::{Buf, Bytes, BytesMut};
use tracing::{debug, trace};

use crate::errors::{wrap_in_io_error, RemoteError};
use crate::jsonio::to_json_line;
use crate::protocol::command::{parse_request, Command, Request};
use crate::protocol::wire::{self, BlockLine, ResultLine};
use crate::transport::Transport;
use crate::{Error, ErrorCode, Result, DEFAULT_BUFFER_SIZE};

/// Largest block a peer may send.
pub const MAX_BLOCK_SIZE: usize = 64 << 20;

/// Settings agreed by both ends of a session.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SessionOptions {
    /// Size of blocks written to the transport.
    pub buffer_size: usize,
    /// Level for files stored compressed.
    pub compress_level: u32,
    /// Level for content sent compressed only for the trip across the
    /// transport; 0 disables.
    pub compress_level_network: u32,
}

impl Default for SessionOptions {
    fn default() -> Self {
        SessionOptions {
            buffer_size: DEFAULT_BUFFER_SIZE,
            compress_level: 6,
            compress_level_network: 3,
        }
    }
}

/// A protocol session over one transport.
///
/// The controller creates one with [Session::connect] and the worker with
/// [Session::accept]. Both then exchange lines and blocks in strict turn.
pub struct Session<T: Transport> {
    stream: BufReader<T>,
    peer: String,
    options: SessionOptions,
}

impl<T: Transport> Session<T> {
    fn new(transport: T, options: SessionOptions) -> Session<T> {
        Session {
            peer: transport.describe(),
            stream: BufReader::new(transport),
            options,
        }
    }

    /// Start a session from the controller side: send our greeting and check
    /// the worker's.
    pub fn connect(transport: T, options: SessionOptions) -> Result<Session<T>> {
        let mut session = Session::new(transport, options);
        session.write_line(&wire::greeting())?;
        let line = session.read_line()?;
        if wire::is_error_line(&line) {
            let remote = wire::parse_error(&line)?;
            if remote.error_code() == Some(ErrorCode::ProtocolMismatch) {
                return Err(Error::ProtocolMismatch {
                    expected: wire::greeting(),
                    received: remote.message,
                });
            }
            return Err(Error::Remote(remote));
        }
        wire::check_greeting(&line)?;
        debug!(peer = session.peer, greeting = line, "Connected");
        Ok(session)
    }

    /// Start a session from the worker side: check the controller's greeting
    /// and answer with ours.
    ///
    /// On a mismatch the controller is sent an error line before this fails.
    pub fn accept(transport: T, options: SessionOptions) -> Result<Session<T>> {
        let mut session = Session::new(transport, options);
        let line = session.read_line()?;
        if let Err(err) = wire::check_greeting(&line) {
            session.write_error(&err.to_remote())?;
            return Err(err);
        }
        session.write_line(&wire::greeting())?;
        debug!(peer = session.peer, greeting = line, "Accepted session");
        Ok(session)
    }

    pub fn options(&self) -> &SessionOptions {
        &self.options
    }

    /// Description of the other end, for messages.
    pub fn peer(&self) -> &str {
        &self.peer
    }

    pub fn transport_mut(&mut self) -> &mut T {
        self.stream.get_mut()
    }

    /// Close the transport, without saying goodbye.
    pub fn close(mut self) -> Result<()> {
        let peer = self.peer.clone();
        self.transport_mut()
            .close()
            .map_err(|source| Error::Transport { peer, source })
    }

    fn transport_error(&self, source: io::Error) -> Error {
        Error::Transport {
            peer: self.peer.clone(),
            source,
        }
    }

    fn write_line(&mut self, line: &str) -> Result<()> {
        trace!(peer = self.peer, line, "Send");
        send_parts(self.stream.get_mut(), &[line.as_bytes(), b"\n"])
            .map_err(|source| self.transport_error(source))
    }

    fn read_line(&mut self) -> Result<String> {
        let mut buf = Vec::new();
        let len = self
            .stream
            .read_until(b'\n', &mut buf)
            .map_err(|source| self.transport_error(source))?;
        if len == 0 || buf.last() != Some(&b'\n') {
            return Err(self.transport_error(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "connection closed",
            )));
        }
        buf.pop();
        let line = String::from_utf8(buf).map_err(|_| Error::Protocol {
            message: format!("line from {} is not UTF-8", self.peer),
        })?;
        trace!(peer = self.peer, line, "Received");
        Ok(line)
    }

    /// Send a command; the caller must then read its result.
    pub fn send_command(&mut self, command: &Command) -> Result<()> {
        let line = to_json_line(command)?;
        self.write_line(line.trim_end_matches('\n'))
    }

    /// Read the next command, on the worker side.
    pub fn read_request(&mut self) -> Result<Request> {
        let line = self.read_line()?;
        parse_request(&line)
    }

    pub fn write_ok<S: AsRef<str>>(&mut self, fields: &[S]) -> Result<()> {
        self.write_line(&wire::encode_ok(fields))
    }

    pub fn write_error(&mut self, err: &RemoteError) -> Result<()> {
        self.write_line(&wire::encode_error(err))
    }

    /// Read the result of a command.
    ///
    /// An error reported by the worker is returned as [Error::Remote].
    pub fn read_result(&mut self) -> Result<Vec<String>> {
        let line = self.read_line()?;
        match wire::parse_result(&line)? {
            ResultLine::Ok(fields) => Ok(fields),
            ResultLine::Error(remote) => Err(Error::Remote(remote)),
        }
    }

    /// Send one block of content. An empty block ends the stream.
    pub fn write_block(&mut self, data: &[u8]) -> Result<()> {
        let header = wire::encode_block_header(data.len());
        trace!(peer = self.peer, len = data.len(), "Send block");
        send_parts(self.stream.get_mut(), &[header.as_bytes(), b"\n", data])
            .map_err(|source| self.transport_error(source))
    }

    /// Read one block of content; an empty block marks the end of the stream.
    ///
    /// If the peer sent an error line instead, it's returned as [Error::Remote].
    pub fn read_block(&mut self) -> Result<Bytes> {
        let line = self.read_line()?;
        let len = match wire::parse_block_header(&line)? {
            BlockLine::Block(len) => len,
            BlockLine::Error(remote) => return Err(Error::Remote(remote)),
        };
        if len > MAX_BLOCK_SIZE {
            return Err(Error::Protocol {
                message: format!("block of {len} bytes from {} is too large", self.peer),
            });
        }
        let mut buf = BytesMut::zeroed(len);
        self.stream
            .read_exact(&mut buf)
            .map_err(|source| self.transport_error(source))?;
        Ok(buf.freeze())
    }

    /// Read a stream of blocks through [Read].
    pub fn block_reader(&mut self) -> BlockReader<'_, T> {
        BlockReader {
            session: self,
            current: Bytes::new(),
            done: false,
        }
    }

    /// Write a stream of blocks through [Write]. Call [BlockWriter::finish] to
    /// end the stream.
    pub fn block_writer(&mut self) -> BlockWriter<'_, T> {
        let capacity = self.options.buffer_size;
        BlockWriter {
            session: self,
            buf: Vec::with_capacity(capacity),
            capacity,
        }
    }
}

fn send_parts(w: &mut dyn Write, parts: &[&[u8]]) -> io::Result<()> {
    for part in parts {
        w.write_all(part)?;
    }
    w.flush()
}

/// Reads a block stream as a continuous byte stream.
///
/// Errors from the session are carried inside the [io::Error] and can be
/// recovered with [crate::errors::unwrap_io_error].
pub struct BlockReader<'s, T: Transport> {
    session: &'s mut Session<T>,
    current: Bytes,
    done: bool,
}

impl<T: Transport> BlockReader<'_, T> {
    /// True once the end of the stream has been read.
    pub fn is_done(&self) -> bool {
        self.done
    }

    /// True if the stream has ended with nothing left to read.
    ///
    /// This may read ahead one block. An error line from the peer ends the
    /// stream and is returned as [Error::Remote].
    pub fn at_end(&mut self) -> Result<bool> {
        while self.current.is_empty() && !self.done {
            match self.session.read_block() {
                Ok(block) if block.is_empty() => self.done = true,
                Ok(block) => self.current = block,
                Err(err) => {
                    if matches!(err, Error::Remote(_)) {
                        self.done = true;
                    }
                    return Err(err);
                }
            }
        }
        Ok(self.current.is_empty())
    }

    /// Discard the rest of the stream, so the session is ready for the next
    /// line.
    pub fn drain(&mut self) -> Result<()> {
        self.current.clear();
        while !self.done {
            if self.session.read_block()?.is_empty() {
                self.done = true;
            }
        }
        Ok(())
    }
}

impl<T: Transport> Read for BlockReader<'_, T> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.at_end().map_err(wrap_in_io_error)? {
            return Ok(0);
        }
        let n = buf.len().min(self.current.len());
        self.current.copy_to_slice(&mut buf[..n]);
        Ok(n)
    }
}

/// Writes a continuous byte stream as blocks.
pub struct BlockWriter<'s, T: Transport> {
    session: &'s mut Session<T>,
    buf: Vec<u8>,
    capacity: usize,
}

impl<T: Transport> BlockWriter<'_, T> {
    fn send_buffered(&mut self) -> Result<()> {
        if !self.buf.is_empty() {
            self.session.write_block(&self.buf)?;
            self.buf.clear();
        }
        Ok(())
    }

    /// Send anything buffered and then the end-of-stream marker.
    pub fn finish(mut self) -> Result<()> {
        self.send_buffered()?;
        self.session.write_block(&[])
    }
}

impl<T: Transport> Write for BlockWriter<'_, T> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = buf.len().min(self.capacity - self.buf.len());
        self.buf.extend_from_slice(&buf[..n]);
        if self.buf.len() >= self.capacity {
            self.send_buffered().map_err(wrap_in_io_error)?;
        }
        Ok(n)
    }

    /// Blocks are only sent when full or at the end of the stream, so this
    /// does nothing.
    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}
