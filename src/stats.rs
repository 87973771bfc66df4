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

//! Counts of work done by a command, for the summary printed at the end.

use std::fmt;

use derive_more::{Add, AddAssign};
use thousands::Separable;

use crate::file_copy::CopyResult;
use crate::misc::bytes_to_human_mb;
use crate::work_group::GroupStats;

/// Files copied by one command, summed across workers.
#[derive(Add, AddAssign, Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct CopyStats {
    /// Files copied.
    pub files: usize,
    /// Sources that had disappeared, which was allowed.
    pub missing: usize,
    /// Uncompressed content copied.
    pub bytes: u64,
    /// Files whose copy failed.
    pub errors: usize,
    /// Workers retired after their session failed.
    pub failed_workers: usize,
}

impl CopyStats {
    /// Count the outcome of one copy.
    pub fn add_result(&mut self, result: &CopyResult) {
        if result.copied {
            self.files += 1;
            self.bytes += result.size;
        } else {
            self.missing += 1;
        }
    }

    /// Errors counted by the work group that the workers never reported,
    /// such as items abandoned with a failed worker.
    pub fn reconcile(&mut self, group: &GroupStats) {
        self.errors = self.errors.max(group.failed);
    }

    pub fn has_errors(&self) -> bool {
        self.errors > 0 || self.failed_workers > 0
    }
}

impl fmt::Display for CopyStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{:>12}      files copied", self.files.separate_with_commas())?;
        writeln!(f, "{:>12}      content", bytes_to_human_mb(self.bytes))?;
        writeln!(
            f,
            "{:>12}      files missing at source",
            self.missing.separate_with_commas()
        )?;
        writeln!(f, "{:>12}      errors", self.errors.separate_with_commas())?;
        if self.failed_workers > 0 {
            writeln!(
                f,
                "{:>12}      failed workers",
                self.failed_workers.separate_with_commas()
            )?;
        }
        Ok(())
    }
}
