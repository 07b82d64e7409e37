use anyhow::anyhow;
use num_derive::FromPrimitive;
use num_traits::FromPrimitive;
use phf::phf_map;
use serde::Serialize;

use crate::timeq::Cycle;

/// Sparse frontier entry written when an update does not activate its vertex.
pub const SENTINEL: u32 = u32::MAX;

// response latency the protocol adds on top of the per-opcode cost
const RESPONSE_LATENCY: Cycle = 2;

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, FromPrimitive, Serialize)]
pub enum Opcode {
    PageRank = b'1',
    Bfs = b'2',
    BellmanFord = b'3',
    BetweennessCentrality = b'4',
    Components = b'5',
    Radii = b'6',
    KCore = b'7',
    TriangleCount = b'8',
    GraphMatPageRank = b'a',
    GraphMatBfs = b'b',
    GraphMatBellmanFord = b'c',
    SumI32 = b'd',
    SumF32 = b'e',
    SumF64 = b'f',
    MinI32 = b'g',
    MinF32 = b'h',
    MinF64 = b'i',
    CasU32 = b'j',
}

impl Opcode {
    pub fn from_tag(tag: u8) -> anyhow::Result<Self> {
        Opcode::from_u8(tag)
            .ok_or_else(|| anyhow!("invalid type of aggregation operation: {:?}", tag as char))
    }

    pub fn tag(self) -> char {
        self as u8 as char
    }

    pub fn name(self) -> &'static str {
        op_def(self).0
    }

    pub fn family(self) -> Family {
        op_def(self).1
    }

    pub fn latency(self) -> Cycle {
        opcode_latency(self.tag())
    }

    /// Scratchpad-side cost of servicing one update.
    pub fn overhead(self) -> Cycle {
        RESPONSE_LATENCY + self.latency()
    }

    /// Whether disabling range 3 should shadow it for the next iteration.
    pub fn tracks_previous_frontier(self) -> bool {
        !matches!(
            self,
            Opcode::BetweennessCentrality
                | Opcode::KCore
                | Opcode::GraphMatPageRank
                | Opcode::GraphMatBfs
                | Opcode::GraphMatBellmanFord
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Family {
    /// Per-algorithm opcodes; no deduplication.
    Legacy,
    /// Sum/min/CAS opcodes; sparse frontiers honour deduplication.
    Generic,
}

/// Reduces `src` into the line; `valid` is the current frontier flag. Returns success.
type CombineFn = fn(&mut [u8], &AtomicOperands, bool) -> bool;

pub struct OpDef(pub &'static str, pub Family, pub CombineFn);

static OPS: phf::Map<char, OpDef> = phf_map! {
    '1' => OpDef("pagerank",       Family::Legacy,  |line, ops, _| { store_f64(line, 0, load_f64(line, 0) + ops.src_f64()); true }),
    '2' => OpDef("bfs",            Family::Legacy,  bfs),
    '3' => OpDef("bellman_ford",   Family::Legacy,  bellman_ford),
    '4' => OpDef("bc",             Family::Legacy,  betweenness),
    '5' => OpDef("components",     Family::Legacy,  components),
    '6' => OpDef("radii",          Family::Legacy,  radii),
    '7' => OpDef("kcore",          Family::Legacy,  |line, ops, _| { store_i32(line, 0, load_i32(line, 0).wrapping_add(ops.src_i32())); true }),
    '8' => OpDef("triangle",       Family::Legacy,  |line, ops, _| { store_i64(line, 0, load_i64(line, 0).wrapping_add(ops.src_i64())); true }),
    'a' => OpDef("graphmat_pr",    Family::Legacy,  graphmat_pagerank),
    'b' => OpDef("graphmat_bfs",   Family::Legacy,  |line, ops, valid| { store_u64(line, 0, ops.src_u64()); !valid }),
    'c' => OpDef("graphmat_bf",    Family::Legacy,  graphmat_bellman_ford),
    'd' => OpDef("sum_i32",        Family::Generic, |line, ops, _| { store_i32(line, 0, load_i32(line, 0).wrapping_add(ops.src_i32())); true }),
    'e' => OpDef("sum_f32",        Family::Generic, |line, ops, _| { store_f32(line, 0, load_f32(line, 0) + ops.src_f32()); true }),
    'f' => OpDef("sum_f64",        Family::Generic, |line, ops, _| { store_f64(line, 0, load_f64(line, 0) + ops.src_f64()); true }),
    'g' => OpDef("min_i32",        Family::Generic, |line, ops, _| { let src = ops.src_i32(); (src < load_i32(line, 0)).then(|| store_i32(line, 0, src)).is_some() }),
    'h' => OpDef("min_f32",        Family::Generic, |line, ops, _| { let src = ops.src_f32(); (src < load_f32(line, 0)).then(|| store_f32(line, 0, src)).is_some() }),
    'i' => OpDef("min_f64",        Family::Generic, |line, ops, _| { let src = ops.src_f64(); (src < load_f64(line, 0)).then(|| store_f64(line, 0, src)).is_some() }),
    'j' => OpDef("cas_u32",        Family::Generic, |line, ops, _| { (load_u32(line, 0) == ops.compare_u32()).then(|| store_u32(line, 0, ops.src_u32())).is_some() }),
};

static LATENCY: phf::Map<char, u64> = phf_map! {
    '0' => 1,
    '1' => 3,
    '2' => 1,
    '3' => 2,
    '4' => 3,
    '5' => 1,
    '6' => 2,
    '7' => 1,
    '8' => 1,
    'a' => 3,
    'b' => 1,
    'c' => 2,
    'd' => 1,
    'e' => 3,
    'f' => 3,
    'g' => 1,
    'h' => 1,
    'i' => 1,
    'j' => 1,
};

fn op_def(opcode: Opcode) -> &'static OpDef {
    OPS.get(&opcode.tag())
        .unwrap_or_else(|| unreachable!("opcode {:?} missing from table", opcode))
}

/// Per-opcode compute latency; unknown tags cost nothing extra.
pub fn opcode_latency(tag: char) -> Cycle {
    LATENCY.get(&tag).copied().unwrap_or(0)
}

fn bfs(line: &mut [u8], ops: &AtomicOperands, _valid: bool) -> bool {
    if load_u32(line, 0) != u32::MAX {
        return false;
    }
    store_u32(line, 0, ops.src_u32());
    true
}

fn bellman_ford(line: &mut [u8], ops: &AtomicOperands, _valid: bool) -> bool {
    let src = ops.src_i32();
    if load_i32(line, 0) <= src {
        return false;
    }
    store_i32(line, 0, src);
    if load_i32(line, 8) != 0 {
        return false;
    }
    store_i32(line, 8, 1);
    true
}

fn betweenness(line: &mut [u8], ops: &AtomicOperands, _valid: bool) -> bool {
    let old = load_f64(line, 0);
    // byte 8 marks the vertex as already finalised
    if line[8] == 0 {
        store_f64(line, 0, old + ops.src_f64());
    }
    old == 0.0
}

fn components(line: &mut [u8], ops: &AtomicOperands, _valid: bool) -> bool {
    let src = ops.src_u32();
    let label = load_u32(line, 0);
    if src >= label {
        return false;
    }
    store_u32(line, 0, src);
    label == load_u32(line, 8)
}

fn radii(line: &mut [u8], ops: &AtomicOperands, _valid: bool) -> bool {
    let mut radius = load_i32(line, 0);
    let visited = load_i64(line, 8);
    let mut next_visited = load_i64(line, 24);
    let to_write = visited | ops.src_i64();
    let mut success = false;
    if visited != to_write {
        next_visited |= to_write;
        if radius != ops.add_info {
            radius = ops.add_info;
            success = true;
        }
    }
    store_i32(line, 0, radius);
    store_i64(line, 24, next_visited);
    success
}

fn graphmat_pagerank(line: &mut [u8], ops: &AtomicOperands, valid: bool) -> bool {
    let src = ops.src_f64();
    if valid {
        store_f64(line, 0, load_f64(line, 0) + src);
        false
    } else {
        store_f64(line, 0, src);
        true
    }
}

fn graphmat_bellman_ford(line: &mut [u8], ops: &AtomicOperands, valid: bool) -> bool {
    let src = ops.src_u32();
    if valid {
        store_u32(line, 0, load_u32(line, 0).min(src));
        false
    } else {
        store_u32(line, 0, src);
        true
    }
}

fn load<const N: usize>(line: &[u8], off: usize) -> [u8; N] {
    let mut bytes = [0u8; N];
    bytes.copy_from_slice(&line[off..off + N]);
    bytes
}

fn load_u32(line: &[u8], off: usize) -> u32 {
    u32::from_le_bytes(load(line, off))
}

fn load_i32(line: &[u8], off: usize) -> i32 {
    i32::from_le_bytes(load(line, off))
}

fn load_i64(line: &[u8], off: usize) -> i64 {
    i64::from_le_bytes(load(line, off))
}

fn load_f32(line: &[u8], off: usize) -> f32 {
    f32::from_le_bytes(load(line, off))
}

fn load_f64(line: &[u8], off: usize) -> f64 {
    f64::from_le_bytes(load(line, off))
}

fn store_u32(line: &mut [u8], off: usize, v: u32) {
    line[off..off + 4].copy_from_slice(&v.to_le_bytes());
}

fn store_i32(line: &mut [u8], off: usize, v: i32) {
    line[off..off + 4].copy_from_slice(&v.to_le_bytes());
}

fn store_u64(line: &mut [u8], off: usize, v: u64) {
    line[off..off + 8].copy_from_slice(&v.to_le_bytes());
}

fn store_i64(line: &mut [u8], off: usize, v: i64) {
    line[off..off + 8].copy_from_slice(&v.to_le_bytes());
}

fn store_f32(line: &mut [u8], off: usize, v: f32) {
    line[off..off + 4].copy_from_slice(&v.to_le_bytes());
}

fn store_f64(line: &mut [u8], off: usize, v: f64) {
    line[off..off + 8].copy_from_slice(&v.to_le_bytes());
}

/// Operands staged through the register file for one update.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct AtomicOperands {
    pub src: [u8; 8],
    pub cas_compare: [u8; 4],
    pub add_info: i32,
    pub dest_vertex: u32,
    pub dest_core: usize,
    pub sparse: bool,
    pub dedup: bool,
}

impl AtomicOperands {
    fn src_u32(&self) -> u32 {
        load_u32(&self.src, 0)
    }

    fn src_i32(&self) -> i32 {
        load_i32(&self.src, 0)
    }

    fn src_u64(&self) -> u64 {
        u64::from_le_bytes(self.src)
    }

    fn src_i64(&self) -> i64 {
        i64::from_le_bytes(self.src)
    }

    fn src_f32(&self) -> f32 {
        load_f32(&self.src, 0)
    }

    fn src_f64(&self) -> f64 {
        f64::from_le_bytes(self.src)
    }

    fn compare_u32(&self) -> u32 {
        u32::from_le_bytes(self.cas_compare)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AtomicOutcome {
    pub success: bool,
    /// For sparse frontiers, the entry to append: the destination id or `SENTINEL`.
    pub sparse_slot: Option<u32>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ActiveVertexCounters {
    per_spm: Vec<u64>,
    total: u64,
}

impl ActiveVertexCounters {
    pub fn new(num_spms: usize) -> Self {
        Self {
            per_spm: vec![0; num_spms],
            total: 0,
        }
    }

    pub fn record(&mut self, spm: usize) {
        self.per_spm[spm] = self.per_spm[spm].saturating_add(1);
        self.total = self.total.saturating_add(1);
    }

    pub fn reset(&mut self) {
        self.per_spm.iter_mut().for_each(|c| *c = 0);
        self.total = 0;
    }

    pub fn per_spm(&self, spm: usize) -> u64 {
        self.per_spm.get(spm).copied().unwrap_or(0)
    }

    pub fn total(&self) -> u64 {
        self.total
    }
}

/// Apply `opcode` to `line`, then update the frontier: the dense valid byte at `valid_offset`
/// or, for sparse frontiers, the entry reported back in the outcome.
pub fn execute(
    opcode: Opcode,
    line: &mut [u8],
    operands: &AtomicOperands,
    valid_offset: usize,
    counters: &mut ActiveVertexCounters,
) -> AtomicOutcome {
    let OpDef(_, family, combine) = op_def(opcode);
    let valid = line[valid_offset] != 0;
    let success = combine(line, operands, valid);
    if success {
        counters.record(operands.dest_core);
    }

    let sparse_slot = if operands.sparse {
        let activate = match family {
            Family::Generic if success && operands.dedup => {
                let first = line[valid_offset] == 0;
                line[valid_offset] = 1;
                first
            }
            _ => success,
        };
        Some(if activate { operands.dest_vertex } else { SENTINEL })
    } else {
        if success {
            line[valid_offset] = 1;
        }
        None
    };

    AtomicOutcome {
        success,
        sparse_slot,
    }
}
