use std::collections::HashMap;

use serde::Serialize;
use smallvec::SmallVec;

use crate::sequencer::request::{MemCmd, RequestDescriptor, RequestKind};

const WORD_BYTES: u64 = 8;

#[derive(Debug, Clone, Default, Serialize)]
pub struct BackingStats {
    pub reads: u64,
    pub writes: u64,
    pub flushes: u64,
    pub prefetched_lines: u64,
}

// a sparse memory structure that initializes anything read with 0
#[derive(Debug, Default)]
pub struct BackingMemory {
    mem: HashMap<u64, u64>,
    stats: BackingStats,
}

impl BackingMemory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stats(&self) -> &BackingStats {
        &self.stats
    }

    fn byte(&self, addr: u64) -> u8 {
        let word = self.mem.get(&(addr & !(WORD_BYTES - 1))).copied().unwrap_or(0);
        (word >> ((addr % WORD_BYTES) * 8)) as u8
    }

    fn set_byte(&mut self, addr: u64, value: u8) {
        let shift = (addr % WORD_BYTES) * 8;
        let word = self.mem.entry(addr & !(WORD_BYTES - 1)).or_insert(0);
        *word &= !(0xFF << shift);
        *word |= (value as u64) << shift;
    }

    pub fn read(&self, addr: u64, size: usize) -> SmallVec<[u8; 8]> {
        (0..size as u64).map(|i| self.byte(addr + i)).collect()
    }

    pub fn write(&mut self, addr: u64, data: &[u8]) {
        for (i, &b) in data.iter().enumerate() {
            self.set_byte(addr + i as u64, b);
        }
    }

    pub fn read_u64(&self, addr: u64) -> u64 {
        let bytes = self.read(addr, 8);
        let mut word = [0u8; 8];
        word.copy_from_slice(&bytes);
        u64::from_le_bytes(word)
    }

    /// Perform a non-scratchpad access: reads fill the request, writes commit its bytes.
    pub fn access(&mut self, req: &mut RequestDescriptor, kind: RequestKind) {
        if kind == RequestKind::PrefetchEdge {
            self.stats.prefetched_lines += req.prefetch_lines;
            return;
        }
        match req.cmd {
            MemCmd::Read => {
                let value = self.read(req.vaddr, req.size);
                req.set_response(&value);
                self.stats.reads += 1;
            }
            MemCmd::Write => {
                let data = req.data.clone();
                self.write(req.vaddr, &data[..req.size.min(data.len())]);
                self.stats.writes += 1;
            }
            MemCmd::Flush => self.stats.flushes += 1,
        }
    }

    pub fn reset(&mut self) {
        self.mem.clear();
    }
}
