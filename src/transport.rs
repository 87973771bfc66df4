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

//! Byte streams connecting a controller to its workers.
//!
//! A transport is just a bidirectional stream plus a way to shut it down.
//! Everything above it, greetings and commands and blocks, is handled by
//! [crate::Session].

use std::io::{self, Read, Write};

mod child;
mod pipe;
mod stdio;

pub use child::ChildTransport;
pub use pipe::PipeTransport;
pub use stdio::StdioTransport;

/// A stream to a peer process.
pub trait Transport: Read + Write + Send {
    /// Short description of the peer, for logs and error messages.
    fn describe(&self) -> String;

    /// Finish cleanly after the session is over.
    ///
    /// For a subprocess this closes its input and waits for it to exit.
    fn close(&mut self) -> io::Result<()> {
        self.flush()
    }

    /// Stop the peer without waiting for it.
    fn kill(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl<T: Transport + ?Sized> Transport for Box<T> {
    fn describe(&self) -> String {
        (**self).describe()
    }

    fn close(&mut self) -> io::Result<()> {
        (**self).close()
    }

    fn kill(&mut self) -> io::Result<()> {
        (**self).kill()
    }
}
