//! Side table remembering when each series was first seen.
//!
//! Entries are keyed by job, instance and series identity. An entry that is
//! not refreshed within the ttl is expired: the next access starts it over,
//! and a sweep (at most once per ttl, piggybacked on access) removes it.
//! There are no per-key timers.

use std::fmt;
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::time::Instant;
use tracing::debug;

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct SeriesKey {
    pub job: String,
    pub instance: String,
    /// Fingerprint of the series' full label set.
    pub series: u64,
}

impl SeriesKey {
    pub fn new(job: impl Into<String>, instance: impl Into<String>, series: u64) -> Self {
        Self {
            job: job.into(),
            instance: instance.into(),
            series,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct SeriesEntry {
    start_timestamp_ms: i64,
    refreshed: Instant,
}

pub struct JobsMap {
    ttl: Duration,
    series: DashMap<SeriesKey, SeriesEntry>,
    last_sweep: Mutex<Instant>,
}

impl fmt::Debug for JobsMap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobsMap")
            .field("ttl", &self.ttl)
            .field("series", &self.series.len())
            .finish()
    }
}

impl JobsMap {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            series: DashMap::new(),
            last_sweep: Mutex::new(Instant::now()),
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Number of entries currently held, expired ones included until the
    /// next sweep.
    pub fn len(&self) -> usize {
        self.series.len()
    }

    pub fn is_empty(&self) -> bool {
        self.series.is_empty()
    }

    /// Returns the start time of `key`, refreshing it.
    ///
    /// A new or expired series starts at `timestamp_ms`.
    pub fn start_time(&self, key: SeriesKey, timestamp_ms: i64) -> i64 {
        let now = Instant::now();
        self.maybe_sweep(now);

        let mut entry = self.series.entry(key).or_insert(SeriesEntry {
            start_timestamp_ms: timestamp_ms,
            refreshed: now,
        });
        if self.is_expired(&entry, now) {
            entry.start_timestamp_ms = timestamp_ms;
        }
        entry.refreshed = now;
        entry.start_timestamp_ms
    }

    /// Looks up `key` without refreshing it. Expired entries are removed and
    /// reported as absent.
    pub fn get(&self, key: &SeriesKey) -> Option<i64> {
        let now = Instant::now();
        let removed = self
            .series
            .remove_if(key, |_, entry| self.is_expired(entry, now))
            .is_some();
        if removed {
            return None;
        }
        self.series.get(key).map(|entry| entry.start_timestamp_ms)
    }

    /// Removes every expired entry and returns how many were removed.
    pub fn sweep(&self) -> usize {
        let now = Instant::now();
        *self.last_sweep.lock() = now;
        self.sweep_at(now)
    }

    fn maybe_sweep(&self, now: Instant) {
        {
            let mut last = self.last_sweep.lock();
            if now.duration_since(*last) < self.ttl {
                return;
            }
            *last = now;
        }
        self.sweep_at(now);
    }

    fn sweep_at(&self, now: Instant) -> usize {
        let before = self.series.len();
        self.series.retain(|_, entry| !self.is_expired(entry, now));
        let removed = before.saturating_sub(self.series.len());
        if removed > 0 {
            debug!(target: "scrapeline::bridge", removed, remaining = self.series.len(), "expired start time entries");
        }
        removed
    }

    fn is_expired(&self, entry: &SeriesEntry, now: Instant) -> bool {
        now.duration_since(entry.refreshed) > self.ttl
    }
}
