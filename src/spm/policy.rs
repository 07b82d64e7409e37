use serde::{Deserialize, Serialize};

use crate::timeq::Cycle;

/// Replacement bookkeeping for one scratchpad. The scratchpad owns the policy and drives it
/// from allocate/access paths; the policy never sees addresses, only (set, way) pairs.
pub trait ReplacementPolicy: std::fmt::Debug {
    fn touch(&mut self, set: usize, way: usize, now: Cycle);

    /// Way to evict from `set`, or None when no way is worth evicting.
    fn victim(&mut self, set: usize) -> Option<usize>;

    fn reset_way(&mut self, set: usize, way: usize);

    fn last_access(&self, set: usize, way: usize) -> Cycle;
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
struct WayCounters {
    freq: u64,
    coll: u64,
    last_touch: Cycle,
}

/// Frequency/collision policy: every victim probe counts a collision against every way in the
/// set, every access counts a use. The way whose collisions most exceed its uses goes first.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FreqCollPolicy {
    assoc: usize,
    counters: Vec<WayCounters>,
}

impl FreqCollPolicy {
    pub fn new(num_sets: usize, assoc: usize) -> Self {
        assert!(assoc > 0, "assoc must be > 0");
        Self {
            assoc,
            counters: vec![WayCounters::default(); num_sets * assoc],
        }
    }

    fn idx(&self, set: usize, way: usize) -> usize {
        assert!(way < self.assoc, "way {} out of range", way);
        set * self.assoc + way
    }

    pub fn freq(&self, set: usize, way: usize) -> u64 {
        self.counters[self.idx(set, way)].freq
    }

    pub fn coll(&self, set: usize, way: usize) -> u64 {
        self.counters[self.idx(set, way)].coll
    }
}

impl ReplacementPolicy for FreqCollPolicy {
    fn touch(&mut self, set: usize, way: usize, now: Cycle) {
        let idx = self.idx(set, way);
        let entry = &mut self.counters[idx];
        entry.freq = entry.freq.saturating_add(1);
        entry.last_touch = now;
    }

    fn victim(&mut self, set: usize) -> Option<usize> {
        let base = self.idx(set, 0);
        let ways = &mut self.counters[base..base + self.assoc];
        let mut best: Option<(usize, u64)> = None;
        for (way, entry) in ways.iter_mut().enumerate() {
            entry.coll = entry.coll.saturating_add(1);
            if entry.coll > entry.freq {
                let delta = entry.coll - entry.freq;
                if best.map_or(true, |(_, d)| delta > d) {
                    best = Some((way, delta));
                }
            }
        }
        best.map(|(way, _)| way)
    }

    fn reset_way(&mut self, set: usize, way: usize) {
        let idx = self.idx(set, way);
        self.counters[idx] = WayCounters::default();
    }

    fn last_access(&self, set: usize, way: usize) -> Cycle {
        self.counters[self.idx(set, way)].last_touch
    }
}
