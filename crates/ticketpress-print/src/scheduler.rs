// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// In-memory ready set used by the queue worker.
//
// Entries carry an optional not-before instant instead of a timer: a job in
// backoff simply is not eligible until the worker's clock passes it.

use std::cmp::Reverse;

use tokio::time::Instant;

use ticketpress_core::types::{JobId, Priority, ProfileId};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadyEntry {
    pub job_id: JobId,
    pub printer: ProfileId,
    pub priority: Priority,
    pub seq: u64,
    /// Set while the job waits out a backoff delay.
    pub not_before: Option<Instant>,
}

impl ReadyEntry {
    fn waiting(&self) -> bool {
        self.not_before.is_some()
    }
}

#[derive(Debug, Default)]
pub struct ReadyQueue {
    entries: Vec<ReadyEntry>,
}

impl ReadyQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace the entry for `entry.job_id`.
    pub fn push(&mut self, entry: ReadyEntry) {
        self.remove(&entry.job_id);
        self.entries.push(entry);
    }

    pub fn remove(&mut self, job_id: &JobId) -> bool {
        let before = self.entries.len();
        self.entries.retain(|e| &e.job_id != job_id);
        self.entries.len() != before
    }

    pub fn contains(&self, job_id: &JobId) -> bool {
        self.entries.iter().any(|e| &e.job_id == job_id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Clear the not-before mark of every entry whose delay has elapsed and
    /// return their ids, in submission order.
    pub fn take_due(&mut self, now: Instant) -> Vec<JobId> {
        let mut due: Vec<&mut ReadyEntry> = self
            .entries
            .iter_mut()
            .filter(|e| e.not_before.is_some_and(|t| t <= now))
            .collect();
        due.sort_by_key(|e| e.seq);
        due.into_iter()
            .map(|e| {
                e.not_before = None;
                e.job_id
            })
            .collect()
    }

    /// Printers with at least one job eligible right now.
    pub fn printers_with_work(&self) -> Vec<ProfileId> {
        let mut printers: Vec<ProfileId> = self
            .entries
            .iter()
            .filter(|e| !e.waiting())
            .map(|e| e.printer.clone())
            .collect();
        printers.sort();
        printers.dedup();
        printers
    }

    /// Remove and return the next eligible job for `printer`: highest
    /// priority first, then lowest sequence number.
    pub fn pop_for(&mut self, printer: &ProfileId) -> Option<JobId> {
        let index = self
            .entries
            .iter()
            .enumerate()
            .filter(|(_, e)| &e.printer == printer && !e.waiting())
            .max_by_key(|(_, e)| (e.priority, Reverse(e.seq)))
            .map(|(i, _)| i)?;
        Some(self.entries.swap_remove(index).job_id)
    }

    /// Earliest pending not-before instant.
    pub fn next_wakeup(&self) -> Option<Instant> {
        self.entries.iter().filter_map(|e| e.not_before).min()
    }
}
