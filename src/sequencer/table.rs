use std::collections::HashMap;

use crate::sequencer::request::{RequestStatus, SequencerRequest};

/// Outstanding reads and writes, keyed by line address. An address is never present in
/// both maps; a second request to a tracked address is turned away as `Aliased`.
#[derive(Debug, Default)]
pub struct OutstandingRequestTable {
    reads: HashMap<u64, SequencerRequest>,
    writes: HashMap<u64, SequencerRequest>,
}

impl OutstandingRequestTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn num_reads(&self) -> usize {
        self.reads.len()
    }

    pub fn num_writes(&self) -> usize {
        self.writes.len()
    }

    pub fn len(&self) -> usize {
        self.reads.len() + self.writes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_tracked(&self, line_addr: u64) -> bool {
        self.reads.contains_key(&line_addr) || self.writes.contains_key(&line_addr)
    }

    /// Admit `entry` under `line_addr`. Stores waiting on loads, loads waiting on stores and
    /// same-direction repeats all alias.
    pub fn insert(&mut self, line_addr: u64, entry: SequencerRequest) -> RequestStatus {
        if self.is_tracked(line_addr) {
            return RequestStatus::Aliased;
        }
        let table = if entry.kind.is_write_class() {
            &mut self.writes
        } else {
            &mut self.reads
        };
        table.insert(line_addr, entry);
        RequestStatus::Ready
    }

    pub fn remove_read(&mut self, line_addr: u64) -> Option<SequencerRequest> {
        self.reads.remove(&line_addr)
    }

    pub fn remove_write(&mut self, line_addr: u64) -> Option<SequencerRequest> {
        self.writes.remove(&line_addr)
    }

    pub fn get(&self, line_addr: u64) -> Option<&SequencerRequest> {
        self.writes.get(&line_addr).or_else(|| self.reads.get(&line_addr))
    }

    /// Reads first, then writes; each map in unspecified order.
    pub fn iter(&self) -> impl Iterator<Item = (&u64, &SequencerRequest)> {
        self.reads.iter().chain(self.writes.iter())
    }
}
