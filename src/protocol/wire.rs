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

//! Encoding of greeting, result, and block header lines.

use semver::Version;
use serde::de::DeserializeOwned;

use crate::checksum::Checksum;
use crate::errors::{RemoteError, Severity};
use crate::file_copy::CopyResult;
use crate::{Error, Result, PRODUCT_NAME, VERSION};

const OK_PREFIX: &str = "OK";
const ERROR_PREFIX: &str = "ERROR [";
const HINT_PREFIX: &str = "HINT: ";
const BLOCK_PREFIX: &str = "BLOCK ";

/// The greeting this program sends.
pub fn greeting() -> String {
    format!("{PRODUCT_NAME} {VERSION}")
}

/// Check a greeting from the peer: the product must match and the version
/// must have the same major and minor numbers as ours.
pub fn check_greeting(line: &str) -> Result<()> {
    let mismatch = || Error::ProtocolMismatch {
        expected: greeting(),
        received: line.to_owned(),
    };
    let (product, version) = line.split_once(' ').ok_or_else(mismatch)?;
    if product != PRODUCT_NAME {
        return Err(mismatch());
    }
    let theirs = Version::parse(version).map_err(|_| mismatch())?;
    let ours = Version::parse(VERSION).map_err(|_| mismatch())?;
    if (theirs.major, theirs.minor) == (ours.major, ours.minor) {
        Ok(())
    } else {
        Err(mismatch())
    }
}

/// Escape a field so it contains no tabs or line breaks.
pub fn escape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '\t' => out.push_str("\\t"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            c => out.push(c),
        }
    }
    out
}

pub fn unescape(s: &str) -> Result<String> {
    let mut out = String::with_capacity(s.len());
    let mut chars = s.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('\\') => out.push('\\'),
            Some('t') => out.push('\t'),
            Some('n') => out.push('\n'),
            Some('r') => out.push('\r'),
            other => {
                return Err(Error::Protocol {
                    message: format!("invalid escape {other:?} in {s:?}"),
                })
            }
        }
    }
    Ok(out)
}

/// A decoded result line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResultLine {
    Ok(Vec<String>),
    Error(RemoteError),
}

/// Encode a success result, without the trailing newline.
pub fn encode_ok<S: AsRef<str>>(fields: &[S]) -> String {
    let mut line = OK_PREFIX.to_owned();
    for field in fields {
        line.push('\t');
        line.push_str(&escape(field.as_ref()));
    }
    line
}

/// Encode an error result, without the trailing newline.
pub fn encode_error(err: &RemoteError) -> String {
    let mut line = format!(
        "{ERROR_PREFIX}{:03}] {}: {}",
        err.code,
        err.severity,
        escape(&err.message)
    );
    if let Some(hint) = &err.hint {
        line.push('\t');
        line.push_str(HINT_PREFIX);
        line.push_str(&escape(hint));
    }
    line
}

pub fn is_error_line(line: &str) -> bool {
    line.starts_with(ERROR_PREFIX)
}

pub fn parse_result(line: &str) -> Result<ResultLine> {
    if is_error_line(line) {
        return parse_error(line).map(ResultLine::Error);
    }
    let Some(rest) = line.strip_prefix(OK_PREFIX) else {
        return Err(unexpected("result", line));
    };
    if rest.is_empty() {
        return Ok(ResultLine::Ok(Vec::new()));
    }
    let Some(rest) = rest.strip_prefix('\t') else {
        return Err(unexpected("result", line));
    };
    rest.split('\t')
        .map(unescape)
        .collect::<Result<Vec<String>>>()
        .map(ResultLine::Ok)
}

pub fn parse_error(line: &str) -> Result<RemoteError> {
    let bad = || unexpected("error", line);
    let rest = line.strip_prefix(ERROR_PREFIX).ok_or_else(bad)?;
    let (code, rest) = rest.split_once("] ").ok_or_else(bad)?;
    let code: u32 = code.parse().map_err(|_| bad())?;
    let (severity, rest) = rest.split_once(": ").ok_or_else(bad)?;
    let severity: Severity = severity.parse().map_err(|_| bad())?;
    let (message, hint) = match rest.split_once('\t') {
        Some((message, hint)) => {
            let hint = hint.strip_prefix(HINT_PREFIX).ok_or_else(bad)?;
            (message, Some(unescape(hint)?))
        }
        None => (rest, None),
    };
    Ok(RemoteError {
        code,
        severity,
        message: unescape(message)?,
        hint,
    })
}

pub fn encode_block_header(len: usize) -> String {
    format!("{BLOCK_PREFIX}{len}")
}

/// What was found where a block header was expected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BlockLine {
    Block(usize),
    Error(RemoteError),
}

pub fn parse_block_header(line: &str) -> Result<BlockLine> {
    if is_error_line(line) {
        return parse_error(line).map(BlockLine::Error);
    }
    line.strip_prefix(BLOCK_PREFIX)
        .and_then(|len| len.parse().ok())
        .map(BlockLine::Block)
        .ok_or_else(|| unexpected("block header", line))
}

fn unexpected(what: &str, line: &str) -> Error {
    Error::Protocol {
        message: format!("expected {what} line, received {line:?}"),
    }
}

/// Encode a boolean result field.
pub fn encode_bool(b: bool) -> String {
    if b { "1" } else { "0" }.to_owned()
}

pub fn parse_bool(s: &str) -> Result<bool> {
    match s {
        "1" => Ok(true),
        "0" => Ok(false),
        _ => Err(Error::Protocol {
            message: format!("expected boolean field, received {s:?}"),
        }),
    }
}

/// Decode a result field holding JSON.
pub fn parse_json_field<T: DeserializeOwned>(field: &str) -> Result<T> {
    serde_json::from_str(field).map_err(|err| Error::Protocol {
        message: format!("invalid JSON result field {field:?}: {err}"),
    })
}

/// Check a result has the expected number of fields.
pub fn expect_fields(fields: &[String], count: usize, command: &str) -> Result<()> {
    if fields.len() == count {
        Ok(())
    } else {
        Err(Error::Protocol {
            message: format!(
                "{command} result has {} fields, expected {count}",
                fields.len()
            ),
        })
    }
}

/// Encode a copy result as `copied`, `checksum`, `size` fields.
pub fn encode_copy_result(result: &CopyResult) -> Vec<String> {
    vec![
        encode_bool(result.copied),
        result
            .checksum
            .as_ref()
            .map(Checksum::to_string)
            .unwrap_or_default(),
        result.size.to_string(),
    ]
}

pub fn parse_copy_result(fields: &[String]) -> Result<CopyResult> {
    expect_fields(fields, 3, "copy")?;
    let checksum = match fields[1].as_str() {
        "" => None,
        hex => Some(hex.parse::<Checksum>().map_err(|_| unexpected("checksum", hex))?),
    };
    Ok(CopyResult {
        copied: parse_bool(&fields[0])?,
        checksum,
        size: fields[2].parse().map_err(|_| unexpected("size", &fields[2]))?,
    })
}
