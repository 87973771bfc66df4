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

use std::io::{self, Read, Write};

use super::Transport;

/// A transport over a separate reader and writer, such as the two ends of a
/// socket or pipe already connected to a peer in this process.
pub struct PipeTransport<R, W> {
    reader: R,
    writer: W,
    name: String,
}

impl<R, W> PipeTransport<R, W>
where
    R: Read + Send,
    W: Write + Send,
{
    pub fn new(reader: R, writer: W, name: impl Into<String>) -> PipeTransport<R, W> {
        PipeTransport {
            reader,
            writer,
            name: name.into(),
        }
    }

    pub fn into_inner(self) -> (R, W) {
        (self.reader, self.writer)
    }
}

impl<R: Read, W> Read for PipeTransport<R, W> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.reader.read(buf)
    }
}

impl<R, W: Write> Write for PipeTransport<R, W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.writer.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.writer.flush()
    }
}

impl<R, W> Transport for PipeTransport<R, W>
where
    R: Read + Send,
    W: Write + Send,
{
    fn describe(&self) -> String {
        self.name.clone()
    }
}
