use serde::Serialize;

pub const NUM_TRACKED_RANGES: usize = 4;

/// Bytes reserved for one element slot inside a scratchpad line.
pub const SLOT_BYTES: usize = 8;

const VALID_BYTE_EVEN: usize = 4 * SLOT_BYTES;
const VALID_BYTE_ODD: usize = 5 * SLOT_BYTES;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum RangeId {
    R1,
    R2,
    R3,
    // shadow of R3 holding the previous iteration's "next" array
    R3Old,
    R4,
}

impl RangeId {
    // classification priority
    pub const ORDER: [RangeId; 5] = [RangeId::R1, RangeId::R2, RangeId::R3, RangeId::R3Old, RangeId::R4];

    /// Index of a configurable range (R1..R4), as used by the register file.
    pub fn from_index(idx: usize) -> Option<RangeId> {
        match idx {
            0 => Some(RangeId::R1),
            1 => Some(RangeId::R2),
            2 => Some(RangeId::R3),
            3 => Some(RangeId::R4),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Parity {
    Even,
    Odd,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct AddressRange {
    pub base: u64,
    pub stride: u64,
    pub elem_size: u64,
    pub enabled: bool,
}

impl AddressRange {
    pub fn element_index(&self, addr: u64, num_mapped: u64) -> Option<u64> {
        if !self.enabled || self.stride == 0 || addr < self.base {
            return None;
        }
        let offset = addr - self.base;
        if offset % self.stride != 0 {
            return None;
        }
        let element = offset / self.stride;
        (element < num_mapped).then_some(element)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Classification {
    pub range: RangeId,
    pub element: u64,
    pub dest_core: usize,
    pub set: u64,
    pub slot: usize,
    pub sparse: bool,
}

/// Virtual address ranges whose elements live in the per-core scratchpads, plus the
/// global sizing and mode state the benchmark programs through the register file.
#[derive(Debug, Clone, Serialize)]
pub struct AddressSpaceMap {
    ranges: [AddressRange; NUM_TRACKED_RANGES],
    range3_old: AddressRange,
    num_cores: usize,
    sets_per_core: u64,
    chunk_limit: u64,
    iteration: u64,
    pub num_vertices: u64,
    pub num_out_edges: u64,
    pub num_tracked_atomic: u64,
    pub chunk_size: u64,
    pub sparse: bool,
    pub copy: bool,
    pub dedup: bool,
}

impl AddressSpaceMap {
    pub fn new(num_cores: usize, sets_per_core: u64) -> Self {
        assert!(num_cores > 0, "num_cores must be > 0");
        Self {
            ranges: [AddressRange::default(); NUM_TRACKED_RANGES],
            range3_old: AddressRange::default(),
            num_cores,
            sets_per_core,
            chunk_limit: u64::MAX,
            iteration: 0,
            num_vertices: 0,
            num_out_edges: 0,
            num_tracked_atomic: 0,
            chunk_size: 1,
            sparse: false,
            copy: false,
            dedup: false,
        }
    }

    /// Largest chunk a scratchpad's spare sets can hold.
    pub fn chunk_limit(&self) -> u64 {
        self.chunk_limit
    }

    pub fn set_chunk_limit(&mut self, limit: u64) {
        self.chunk_limit = limit;
    }

    pub fn num_cores(&self) -> usize {
        self.num_cores
    }

    pub fn range(&self, id: RangeId) -> &AddressRange {
        match id {
            RangeId::R1 => &self.ranges[0],
            RangeId::R2 => &self.ranges[1],
            RangeId::R3 => &self.ranges[2],
            RangeId::R3Old => &self.range3_old,
            RangeId::R4 => &self.ranges[3],
        }
    }

    pub fn range_mut(&mut self, id: RangeId) -> &mut AddressRange {
        match id {
            RangeId::R1 => &mut self.ranges[0],
            RangeId::R2 => &mut self.ranges[1],
            RangeId::R3 => &mut self.ranges[2],
            RangeId::R3Old => &mut self.range3_old,
            RangeId::R4 => &mut self.ranges[3],
        }
    }

    /// Scratchpad lines available across all cores.
    pub fn num_mapped_lines(&self) -> u64 {
        self.sets_per_core * self.num_cores as u64
    }

    pub fn num_mapped_elements(&self) -> u64 {
        self.num_vertices.min(self.num_mapped_lines())
    }

    pub fn element_in(&self, addr: u64, id: RangeId) -> Option<u64> {
        self.range(id)
            .element_index(addr, self.num_mapped_elements())
    }

    pub fn classify(&self, addr: u64) -> Option<Classification> {
        RangeId::ORDER.iter().find_map(|&id| {
            if id == RangeId::R3 && self.sparse {
                return None;
            }
            self.classify_in(addr, id)
        })
    }

    /// Classify against a single range, ignoring priority and mode.
    pub fn classify_in(&self, addr: u64, id: RangeId) -> Option<Classification> {
        self.element_in(addr, id).map(|element| Classification {
            range: id,
            element,
            dest_core: self.destination_core(element),
            set: self.set_index(element),
            slot: self.slot_for(id),
            sparse: self.sparse,
        })
    }

    pub fn destination_core(&self, element: u64) -> usize {
        debug_assert!(self.chunk_size > 0, "chunk size must be configured");
        ((element / self.chunk_size) % self.num_cores as u64) as usize
    }

    pub fn set_index(&self, element: u64) -> u64 {
        debug_assert!(self.chunk_size > 0, "chunk size must be configured");
        let chunk = self.chunk_size;
        ((element / chunk) / self.num_cores as u64) * chunk + element % chunk
    }

    pub fn slot_for(&self, id: RangeId) -> usize {
        let odd = self.parity() == Parity::Odd;
        match id {
            RangeId::R1 => 0,
            RangeId::R2 => 1,
            RangeId::R3 => if odd { 5 } else { 4 },
            RangeId::R3Old => if odd { 4 } else { 5 },
            RangeId::R4 => 3,
        }
    }

    pub fn iteration(&self) -> u64 {
        self.iteration
    }

    pub fn parity(&self) -> Parity {
        if self.iteration % 2 == 1 {
            Parity::Odd
        } else {
            Parity::Even
        }
    }

    /// Flip which of the two "next" slots is current. Called when range 3 is disabled in
    /// dense mode at the end of an iteration.
    pub fn advance_iteration_parity(&mut self) {
        self.iteration += 1;
    }

    /// Byte inside a line holding the frontier valid flag for the current iteration.
    pub fn valid_byte_offset(&self) -> usize {
        match self.parity() {
            Parity::Even => VALID_BYTE_EVEN,
            Parity::Odd => VALID_BYTE_ODD,
        }
    }

    pub fn shadow_range3(&mut self) {
        self.range3_old = self.ranges[2];
    }

    pub fn drop_range3_shadow(&mut self) {
        self.range3_old.enabled = false;
    }

    /// Frontier entry written by a sparse atomic for the given out-edge.
    pub fn sparse_edge_address(&self, edge_index: u64) -> u64 {
        let next = &self.ranges[2];
        next.base.wrapping_add(next.elem_size.wrapping_mul(edge_index))
    }
}
