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

//! Distribute file copies across a fixed set of worker slots.
//!
//! Items are grouped by a path key, such as a tablespace. Once dispatched,
//! groups are taken in ascending key order and the items within each group
//! largest first, so the longest copies start early. Each slot holds at most
//! `max_depth` items, counting the one it's working on, and is refilled from
//! the front of the remaining stream as it completes them.

use std::collections::{BTreeMap, VecDeque};
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use tracing::{debug, trace, warn};

use crate::checksum::Checksum;
use crate::{Error, Result};

/// One file to copy.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkItem {
    /// Items with the same key are dispatched together.
    pub path_key: String,
    pub source: PathBuf,
    pub dest: PathBuf,
    pub compress: bool,
    /// Expected checksum of the content, if known.
    pub checksum: Option<Checksum>,
    /// Modification time to give the copy, in Unix seconds.
    pub modification_time: Option<i64>,
    /// Expected size, used only for ordering.
    pub size: u64,
}

impl WorkItem {
    /// Key ordering items within a group by size, then source.
    fn sort_key(&self) -> String {
        format!("{:016}-{}", self.size, self.source.display())
    }
}

/// Counts of items through the group.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct GroupStats {
    pub enqueued: usize,
    /// Items handed to a slot's queue; an item returned from a retired slot
    /// and handed out again counts again.
    pub dispatched: usize,
    pub completed: usize,
    pub failed: usize,
}

#[derive(Debug, Default)]
struct Slot {
    queue: VecDeque<WorkItem>,
    in_flight: Option<WorkItem>,
    retired: bool,
}

impl Slot {
    fn depth(&self) -> usize {
        self.queue.len() + usize::from(self.in_flight.is_some())
    }
}

/// Work queued for a set of worker slots.
#[derive(Debug)]
pub struct WorkerGroup {
    /// Items by group key and then by size key, until dispatched.
    buckets: BTreeMap<String, BTreeMap<String, WorkItem>>,
    dispatched: bool,
    /// Items not yet given to any slot, in dispatch order.
    remaining: VecDeque<WorkItem>,
    slots: Vec<Slot>,
    max_depth: usize,
    stats: GroupStats,
}

impl WorkerGroup {
    pub fn new(slot_count: usize, max_depth: usize) -> Result<WorkerGroup> {
        if slot_count == 0 {
            return Err(Error::Config {
                message: "a worker group needs at least one slot".into(),
            });
        }
        if max_depth == 0 {
            return Err(Error::Config {
                message: "queue depth must be at least 1".into(),
            });
        }
        Ok(WorkerGroup {
            buckets: BTreeMap::new(),
            dispatched: false,
            remaining: VecDeque::new(),
            slots: (0..slot_count).map(|_| Slot::default()).collect(),
            max_depth,
            stats: GroupStats::default(),
        })
    }

    pub fn slot_count(&self) -> usize {
        self.slots.len()
    }

    pub fn max_depth(&self) -> usize {
        self.max_depth
    }

    pub fn stats(&self) -> GroupStats {
        self.stats
    }

    /// Add an item. All items must be added before [WorkerGroup::dispatch].
    pub fn enqueue(&mut self, item: WorkItem) -> Result<()> {
        if self.dispatched {
            return Err(Error::Assert {
                message: format!("{:?} enqueued after dispatch", item.source),
            });
        }
        let bucket = self.buckets.entry(item.path_key.clone()).or_default();
        let key = item.sort_key();
        if bucket.contains_key(&key) {
            return Err(Error::Assert {
                message: format!("{:?} enqueued twice", item.source),
            });
        }
        trace!(path_key = item.path_key, source = ?item.source, size = item.size, "Enqueue");
        bucket.insert(key, item);
        self.stats.enqueued += 1;
        Ok(())
    }

    /// Freeze the queued items into their dispatch order and fill each
    /// slot's queue. Later calls do nothing.
    pub fn dispatch(&mut self) {
        if self.dispatched {
            return;
        }
        self.dispatched = true;
        for (path_key, bucket) in std::mem::take(&mut self.buckets) {
            debug!(path_key, items = bucket.len(), "Dispatch group");
            self.remaining.extend(bucket.into_values().rev());
        }
        for slot in 0..self.slots.len() {
            self.refill(slot);
        }
    }

    fn refill(&mut self, slot: usize) {
        let max_depth = self.max_depth;
        let state = &mut self.slots[slot];
        if state.retired {
            return;
        }
        while state.depth() < max_depth {
            let Some(item) = self.remaining.pop_front() else {
                break;
            };
            state.queue.push_back(item);
            self.stats.dispatched += 1;
        }
    }

    /// Take the next item for a slot to work on, or None if it has nothing
    /// to do right now.
    ///
    /// The slot must have completed its previous item.
    pub fn start(&mut self, slot: usize) -> Result<Option<WorkItem>> {
        if !self.dispatched {
            return Err(Error::Assert {
                message: "work started before dispatch".into(),
            });
        }
        if self.slots[slot].in_flight.is_some() {
            return Err(Error::Assert {
                message: format!("slot {slot} started an item before completing the last"),
            });
        }
        self.refill(slot);
        let state = &mut self.slots[slot];
        let Some(item) = state.queue.pop_front() else {
            return Ok(None);
        };
        state.in_flight = Some(item.clone());
        Ok(Some(item))
    }

    /// Record the end of a slot's current item, successful or not, and
    /// refill its queue.
    pub fn complete(&mut self, slot: usize, succeeded: bool) -> Result<()> {
        let Some(item) = self.slots[slot].in_flight.take() else {
            return Err(Error::Assert {
                message: format!("slot {slot} completed an item it had not started"),
            });
        };
        if succeeded {
            self.stats.completed += 1;
        } else {
            warn!(source = ?item.source, slot, "Copy failed");
            self.stats.failed += 1;
        }
        self.refill(slot);
        Ok(())
    }

    /// Take a slot out of service after its worker failed.
    ///
    /// The item it was working on counts as failed. Items waiting in its
    /// queue go back to the front of the stream for other slots. If no
    /// slot is left and work remains, this fails.
    pub fn retire(&mut self, slot: usize) -> Result<()> {
        let state = &mut self.slots[slot];
        if state.retired {
            return Ok(());
        }
        state.retired = true;
        if let Some(item) = state.in_flight.take() {
            warn!(source = ?item.source, slot, "Copy abandoned with its worker");
            self.stats.failed += 1;
        }
        let returned = std::mem::take(&mut state.queue);
        debug!(slot, returned = returned.len(), "Retire slot");
        for item in returned.into_iter().rev() {
            self.remaining.push_front(item);
        }
        if self.active_slots() == 0 && !self.remaining.is_empty() {
            return Err(Error::WorkersExhausted {
                remaining: self.remaining.len(),
            });
        }
        for other in 0..self.slots.len() {
            self.refill(other);
        }
        Ok(())
    }

    pub fn is_retired(&self, slot: usize) -> bool {
        self.slots[slot].retired
    }

    pub fn active_slots(&self) -> usize {
        self.slots.iter().filter(|s| !s.retired).count()
    }

    /// Items queued for a slot, including the one in progress.
    pub fn queue_depth(&self, slot: usize) -> usize {
        self.slots[slot].depth()
    }

    /// Items not yet given to any slot.
    pub fn undelivered(&self) -> usize {
        self.remaining.len()
    }

    /// True when every item has been completed or has failed.
    pub fn is_done(&self) -> bool {
        self.dispatched
            && self.remaining.is_empty()
            && self.slots.iter().all(|s| s.depth() == 0)
    }
}
