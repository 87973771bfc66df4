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

//! The protocol between a controller and its workers.
//!
//! A session starts with each side sending a greeting line naming the
//! product and version. After that the controller sends one command per
//! line, as JSON, and the worker answers each with exactly one result line:
//!
//! ```text
//! OK<TAB>field<TAB>field...
//! ERROR [045] error: message<TAB>HINT: hint
//! ```
//!
//! File content travels in length-prefixed blocks, each a `BLOCK <len>` line
//! followed by that many raw bytes. A zero-length block ends the stream.
//!
//! Requests are strictly serial: the controller never sends a command until
//! the previous result has been read.

pub mod command;
pub mod session;
pub mod wire;
