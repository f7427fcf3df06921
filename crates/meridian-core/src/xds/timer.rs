//! Cancellable deadlines.
//!
//! Deadlines are kept in a map keyed by whatever the timer is for, with a
//! min-heap ordering them. Cancelling or restarting a timer only touches the
//! map. Stale heap entries are dropped lazily when they reach the top of the
//! heap, or in bulk once they outnumber running timers. A timer that fires
//! after being cancelled is a no-op.

use std::{
    cmp::Reverse,
    collections::{BinaryHeap, HashMap},
    hash::Hash,
    time::Instant,
};

const COMPACT_SLACK: usize = 16;

#[derive(Debug)]
pub(crate) struct Timers<K> {
    deadlines: HashMap<K, (Instant, u64)>,
    heap: BinaryHeap<Reverse<(Instant, u64, K)>>,
    generation: u64,
}

impl<K> Default for Timers<K> {
    fn default() -> Self {
        Self {
            deadlines: HashMap::new(),
            heap: BinaryHeap::new(),
            generation: 0,
        }
    }
}

impl<K: Clone + Hash + Eq + Ord> Timers<K> {
    /// Start a timer, replacing any timer already running for `key`.
    pub(crate) fn start(&mut self, key: K, deadline: Instant) {
        self.generation += 1;
        self.deadlines
            .insert(key.clone(), (deadline, self.generation));
        self.heap.push(Reverse((deadline, self.generation, key)));
        self.compact();
    }

    /// Cancel a timer. Returns `true` if the timer was running.
    pub(crate) fn cancel(&mut self, key: &K) -> bool {
        let cancelled = self.deadlines.remove(key).is_some();
        self.compact();
        cancelled
    }

    pub(crate) fn is_running(&self, key: &K) -> bool {
        self.deadlines.contains_key(key)
    }

    pub(crate) fn clear(&mut self) {
        self.deadlines.clear();
        self.heap.clear();
    }

    /// The earliest running deadline.
    pub(crate) fn next_deadline(&mut self) -> Option<Instant> {
        self.prune();
        self.heap.peek().map(|Reverse((deadline, _, _))| *deadline)
    }

    /// Remove and return every timer with a deadline at or before `now`.
    pub(crate) fn expired(&mut self, now: Instant) -> Vec<K> {
        let mut expired = Vec::new();

        while let Some(Reverse((deadline, _, _))) = self.heap.peek() {
            if *deadline > now {
                break;
            }

            let Some(Reverse((_, generation, key))) = self.heap.pop() else {
                break;
            };
            if self.is_current(&key, generation) {
                self.deadlines.remove(&key);
                expired.push(key);
            }
        }

        expired
    }

    fn is_current(&self, key: &K, generation: u64) -> bool {
        matches!(self.deadlines.get(key), Some((_, g)) if *g == generation)
    }

    // stale entries behind a live one never reach the top of the heap, so
    // rebuild it once they outnumber the running timers.
    fn compact(&mut self) {
        if self.heap.len() <= 2 * self.deadlines.len() + COMPACT_SLACK {
            return;
        }

        let deadlines = &self.deadlines;
        self.heap.retain(|Reverse((_, generation, key))| {
            matches!(deadlines.get(key), Some((_, g)) if g == generation)
        });
    }

    fn prune(&mut self) {
        while let Some(Reverse((_, generation, key))) = self.heap.peek() {
            if self.is_current(key, *generation) {
                break;
            }
            self.heap.pop();
        }
    }
}
