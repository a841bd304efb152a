//! Sliding time-window event counter
//!
//! Counts events per key over a trailing window. Pruning is destructive: every
//! read drops entries that have fallen out of the window, so a key under
//! sustained load never holds more history than the window needs.

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use std::collections::VecDeque;
use std::hash::Hash;

/// A single event kept in a window
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WindowEvent<T> {
    pub at: DateTime<Utc>,
    pub item: T,
}

/// Per-key sliding window of timestamped events
///
/// Each key's sequence is guarded by its own map shard lock, so `record` and
/// `count` for the same key serialize while different keys proceed in parallel.
#[derive(Debug)]
pub struct WindowCounter<K, T = ()>
where
    K: Eq + Hash,
{
    entries: DashMap<K, VecDeque<WindowEvent<T>>>,
}

impl<K, T> Default for WindowCounter<K, T>
where
    K: Eq + Hash,
{
    fn default() -> Self {
        Self {
            entries: DashMap::new(),
        }
    }
}

impl<K, T> WindowCounter<K, T>
where
    K: Eq + Hash + Clone,
    T: Clone,
{
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an event for `key`
    pub fn record(&self, key: K, at: DateTime<Utc>, item: T) {
        let mut events = self.entries.entry(key).or_default();
        insert_ordered(&mut events, WindowEvent { at, item });
    }

    /// Number of events with `now - window < at <= now`
    ///
    /// Prunes everything at or before `now - window` first. A key that was
    /// never recorded returns 0 without allocating.
    pub fn count(&self, key: &K, now: DateTime<Utc>, window: Duration) -> usize {
        let Some(mut events) = self.entries.get_mut(key) else {
            return 0;
        };
        prune(&mut events, now - window);
        events.partition_point(|e| e.at <= now)
    }

    /// Items in the window, most recent first, at most `limit` of them
    pub fn recent(&self, key: &K, now: DateTime<Utc>, window: Duration, limit: usize) -> Vec<T> {
        let Some(mut events) = self.entries.get_mut(key) else {
            return Vec::new();
        };
        prune(&mut events, now - window);
        most_recent(&events, now, limit)
    }

    /// Clear all history for `key`
    pub fn reset(&self, key: &K) {
        if let Some(mut events) = self.entries.get_mut(key) {
            events.clear();
        }
    }

    /// Record an event and, if the window now holds at least `threshold`
    /// events, drain it
    ///
    /// Returns the `threshold` most recent items, newest first, when the
    /// threshold is reached. The whole operation runs under the key's lock, so
    /// two concurrent callers can never both trip on the same burst.
    pub fn record_and_trip(
        &self,
        key: K,
        at: DateTime<Utc>,
        item: T,
        window: Duration,
        threshold: usize,
    ) -> Option<Vec<T>> {
        let mut events = self.entries.entry(key).or_default();
        insert_ordered(&mut events, WindowEvent { at, item });
        prune(&mut events, at - window);

        let in_window = events.partition_point(|e| e.at <= at);
        if threshold == 0 || in_window < threshold {
            return None;
        }

        let tripped = most_recent(&events, at, threshold);
        events.clear();
        Some(tripped)
    }

    /// Number of keys that have ever been recorded
    pub fn key_count(&self) -> usize {
        self.entries.len()
    }
}

/// Keep the sequence sorted by time; in-order inserts stay O(1)
fn insert_ordered<T>(events: &mut VecDeque<WindowEvent<T>>, event: WindowEvent<T>) {
    if events.back().is_none_or(|last| last.at <= event.at) {
        events.push_back(event);
    } else {
        let idx = events.partition_point(|e| e.at <= event.at);
        events.insert(idx, event);
    }
}

fn prune<T>(events: &mut VecDeque<WindowEvent<T>>, cutoff: DateTime<Utc>) {
    while events.front().is_some_and(|e| e.at <= cutoff) {
        events.pop_front();
    }
}

fn most_recent<T: Clone>(events: &VecDeque<WindowEvent<T>>, now: DateTime<Utc>, limit: usize) -> Vec<T> {
    let end = events.partition_point(|e| e.at <= now);
    events
        .range(..end)
        .rev()
        .take(limit)
        .map(|e| e.item.clone())
        .collect()
}
