use std::collections::HashMap;

use smallvec::SmallVec;

/// Per-context copies of vertex values read during an atomic phase, keyed by virtual address.
/// A context's buffer only answers while its valid flag is set.
#[derive(Debug, Clone)]
pub struct ReadOnlyBuffers {
    enabled: Vec<bool>,
    valid: Vec<bool>,
    entries: Vec<HashMap<u64, SmallVec<[u8; 8]>>>,
    hits: u64,
}

impl ReadOnlyBuffers {
    pub fn new(num_contexts: usize) -> Self {
        Self {
            enabled: vec![false; num_contexts],
            valid: vec![false; num_contexts],
            entries: vec![HashMap::new(); num_contexts],
            hits: 0,
        }
    }

    pub fn enable_all(&mut self) {
        self.enabled.iter_mut().for_each(|e| *e = true);
    }

    /// Disable caching everywhere and drop every stashed value.
    pub fn invalidate_all(&mut self) {
        self.enabled.iter_mut().for_each(|e| *e = false);
        self.valid.iter_mut().for_each(|v| *v = false);
        self.entries.iter_mut().for_each(HashMap::clear);
    }

    /// Drop one context's stashed values; its buffer refills from the next vertex loads.
    pub fn invalidate(&mut self, ctx: usize) {
        self.valid[ctx] = false;
        self.entries[ctx].clear();
    }

    pub fn is_valid(&self, ctx: usize) -> bool {
        self.valid[ctx]
    }

    pub fn lookup(&mut self, ctx: usize, vaddr: u64) -> Option<&[u8]> {
        if !self.valid[ctx] {
            return None;
        }
        let hit = self.entries[ctx].get(&vaddr)?;
        self.hits = self.hits.saturating_add(1);
        Some(hit.as_slice())
    }

    pub fn insert(&mut self, ctx: usize, vaddr: u64, data: &[u8]) {
        self.valid[ctx] = true;
        let prev = self.entries[ctx].insert(vaddr, SmallVec::from_slice(data));
        assert!(prev.is_none(), "ctx {}: read-only entry {:#x} stashed twice", ctx, vaddr);
    }

    pub fn is_enabled(&self, ctx: usize) -> bool {
        self.enabled[ctx]
    }

    pub fn len(&self, ctx: usize) -> usize {
        self.entries[ctx].len()
    }

    pub fn hits(&self) -> u64 {
        self.hits
    }
}
