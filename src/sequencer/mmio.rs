use anyhow::{bail, ensure};
use phf::phf_map;

use crate::spm::addr_map::RangeId;
use crate::spm::atomic::Opcode;

/// First configuration register; registers are 8 bytes apart.
pub const MMIO_BASE: u64 = 0x300008;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RegId {
    DataTypeSize(usize),
    Stride(usize),
    NumVertex,
    VertexStart(usize),
    EnableTracked(usize),
    EnablePrefetch,
    PrefetchAddr,
    PrefetchSize,
    OldValue(usize),
    EnableAtomic,
    AtomicOpcode(usize),
    NoStatusRead,
    NumMappedVertices,
    NumOutEdges,
    NumTrackedAtomic,
    IsSparse,
    IsCopy,
    SrcInfo,
    DestInfo,
    AddInfo,
    EdgeIndex,
    ChunkSize,
    ActiveVerticesPerSpm,
    ActiveVerticesTotal,
    CasCompare,
    DedupEnabled,
    ProfileClear,
    ProfileStart,
    ProfileStop,
    ProfileDump,
    ProfileRangeStart(usize),
    ProfileRangeBytes(usize),
    OutstandingPiscOps,
}

static REGISTERS: phf::Map<u64, RegId> = phf_map! {
    0x300008u64 => RegId::DataTypeSize(0),
    0x300010u64 => RegId::DataTypeSize(1),
    0x300018u64 => RegId::DataTypeSize(2),
    0x300020u64 => RegId::DataTypeSize(3),
    0x300028u64 => RegId::Stride(0),
    0x300030u64 => RegId::Stride(1),
    0x300038u64 => RegId::Stride(2),
    0x300040u64 => RegId::Stride(3),
    0x300048u64 => RegId::NumVertex,
    0x300058u64 => RegId::VertexStart(0),
    0x300060u64 => RegId::VertexStart(1),
    0x300068u64 => RegId::VertexStart(2),
    0x300070u64 => RegId::VertexStart(3),
    0x300078u64 => RegId::EnableTracked(0),
    0x300080u64 => RegId::EnableTracked(1),
    0x300088u64 => RegId::EnableTracked(2),
    0x300090u64 => RegId::EnableTracked(3),
    0x300098u64 => RegId::EnablePrefetch,
    0x3000a0u64 => RegId::PrefetchAddr,
    0x3000a8u64 => RegId::PrefetchSize,
    0x3000b0u64 => RegId::OldValue(0),
    0x3000b8u64 => RegId::OldValue(1),
    0x3000d0u64 => RegId::EnableAtomic,
    0x3000d8u64 => RegId::AtomicOpcode(0),
    0x3000e0u64 => RegId::AtomicOpcode(1),
    0x3000e8u64 => RegId::NoStatusRead,
    0x3000f0u64 => RegId::NumMappedVertices,
    0x3000f8u64 => RegId::NumOutEdges,
    0x300100u64 => RegId::NumTrackedAtomic,
    0x300108u64 => RegId::IsSparse,
    0x300110u64 => RegId::IsCopy,
    0x300118u64 => RegId::SrcInfo,
    0x300120u64 => RegId::DestInfo,
    0x300128u64 => RegId::AddInfo,
    0x300130u64 => RegId::EdgeIndex,
    0x300138u64 => RegId::ChunkSize,
    0x300140u64 => RegId::ActiveVerticesPerSpm,
    0x300148u64 => RegId::ActiveVerticesTotal,
    0x300150u64 => RegId::CasCompare,
    0x300158u64 => RegId::DedupEnabled,
    0x300160u64 => RegId::ProfileClear,
    0x300168u64 => RegId::ProfileStart,
    0x300170u64 => RegId::ProfileStop,
    0x300178u64 => RegId::ProfileDump,
    0x300180u64 => RegId::ProfileRangeStart(0),
    0x300188u64 => RegId::ProfileRangeBytes(0),
    0x300190u64 => RegId::ProfileRangeStart(1),
    0x300198u64 => RegId::ProfileRangeBytes(1),
    0x3001a0u64 => RegId::ProfileRangeStart(2),
    0x3001a8u64 => RegId::ProfileRangeBytes(2),
    0x3001b0u64 => RegId::ProfileRangeStart(3),
    0x3001b8u64 => RegId::ProfileRangeBytes(3),
    0x3001c0u64 => RegId::ProfileRangeStart(4),
    0x3001c8u64 => RegId::ProfileRangeBytes(4),
    0x3001d0u64 => RegId::ProfileRangeStart(5),
    0x3001d8u64 => RegId::ProfileRangeBytes(5),
    0x3001e0u64 => RegId::ProfileRangeStart(6),
    0x3001e8u64 => RegId::ProfileRangeBytes(6),
    0x3001f0u64 => RegId::ProfileRangeStart(7),
    0x3001f8u64 => RegId::ProfileRangeBytes(7),
    0x300200u64 => RegId::ProfileRangeStart(8),
    0x300208u64 => RegId::ProfileRangeBytes(8),
    0x300210u64 => RegId::OutstandingPiscOps,
};

impl RegId {
    pub fn lookup(vaddr: u64) -> Option<RegId> {
        REGISTERS.get(&vaddr).copied()
    }

    pub fn addr(self) -> u64 {
        let slot = |base: u64, i: usize| base + 8 * i as u64;
        match self {
            RegId::DataTypeSize(i) => slot(0x300008, i),
            RegId::Stride(i) => slot(0x300028, i),
            RegId::NumVertex => 0x300048,
            RegId::VertexStart(i) => slot(0x300058, i),
            RegId::EnableTracked(i) => slot(0x300078, i),
            RegId::EnablePrefetch => 0x300098,
            RegId::PrefetchAddr => 0x3000a0,
            RegId::PrefetchSize => 0x3000a8,
            RegId::OldValue(i) => slot(0x3000b0, i),
            RegId::EnableAtomic => 0x3000d0,
            RegId::AtomicOpcode(i) => slot(0x3000d8, i),
            RegId::NoStatusRead => 0x3000e8,
            RegId::NumMappedVertices => 0x3000f0,
            RegId::NumOutEdges => 0x3000f8,
            RegId::NumTrackedAtomic => 0x300100,
            RegId::IsSparse => 0x300108,
            RegId::IsCopy => 0x300110,
            RegId::SrcInfo => 0x300118,
            RegId::DestInfo => 0x300120,
            RegId::AddInfo => 0x300128,
            RegId::EdgeIndex => 0x300130,
            RegId::ChunkSize => 0x300138,
            RegId::ActiveVerticesPerSpm => 0x300140,
            RegId::ActiveVerticesTotal => 0x300148,
            RegId::CasCompare => 0x300150,
            RegId::DedupEnabled => 0x300158,
            RegId::ProfileClear => 0x300160,
            RegId::ProfileStart => 0x300168,
            RegId::ProfileStop => 0x300170,
            RegId::ProfileDump => 0x300178,
            RegId::ProfileRangeStart(i) => slot(0x300180, 2 * i),
            RegId::ProfileRangeBytes(i) => slot(0x300188, 2 * i),
            RegId::OutstandingPiscOps => 0x300210,
        }
    }

    /// Registers a load is answered from; stores to them fall through as ordinary stores.
    pub fn is_readable(self) -> bool {
        matches!(
            self,
            RegId::NumMappedVertices
                | RegId::ActiveVerticesTotal
                | RegId::ActiveVerticesPerSpm
                | RegId::OutstandingPiscOps
        )
    }
}

/// State change requested by one configuration store.
#[derive(Debug, Clone, PartialEq)]
pub enum Mutation {
    RangeElemSize(RangeId, u64),
    RangeStride(RangeId, u64),
    RangeBase(RangeId, u64),
    RangeEnable(RangeId, bool),
    NumVertices(u64),
    NumOutEdges(u64),
    NumTrackedAtomic(u64),
    ChunkSize(u64),
    Sparse(bool),
    Copy(bool),
    Dedup(bool),
    NoStatusRead(bool),
    EnablePrefetch(bool),
    PrefetchAddr(u64),
    /// Edge count converted to lines.
    PrefetchSize(u64),
    OldValue(usize, u64),
    EnableAtomic(bool),
    Opcode(usize, Opcode),
    SrcInfo([u8; 8]),
    AddInfo(i32),
    EdgeIndex(u32),
    CasCompare([u8; 4]),
    DestInfo(u32),
    ProfileClear(u64),
    ProfileStart(u64),
    ProfileStop(u64),
    ProfileDump(u64),
    ProfileRangeStart(usize, u64),
    ProfileRangeBytes(usize, u64),
}

const EDGE_BYTES: u64 = 4;

fn le_u64(data: &[u8]) -> u64 {
    let mut bytes = [0u8; 8];
    let n = data.len().min(8);
    bytes[..n].copy_from_slice(&data[..n]);
    u64::from_le_bytes(bytes)
}

fn le_array<const N: usize>(data: &[u8]) -> [u8; N] {
    let mut bytes = [0u8; N];
    let n = data.len().min(N);
    bytes[..n].copy_from_slice(&data[..n]);
    bytes
}

fn range(i: usize) -> anyhow::Result<RangeId> {
    RangeId::from_index(i).ok_or_else(|| anyhow::anyhow!("no tracked range {}", i + 1))
}

/// Decode a store to `reg`. `Ok(None)` means the register is not writable.
pub fn decode_write(reg: RegId, data: &[u8], line_bytes: u64) -> anyhow::Result<Option<Mutation>> {
    let value = le_u64(data);
    let mutation = match reg {
        RegId::DataTypeSize(i) => Mutation::RangeElemSize(range(i)?, value),
        RegId::Stride(i) => Mutation::RangeStride(range(i)?, value),
        RegId::VertexStart(i) => Mutation::RangeBase(range(i)?, value),
        RegId::EnableTracked(i) => Mutation::RangeEnable(range(i)?, value != 0),
        RegId::NumVertex => Mutation::NumVertices(value),
        RegId::NumOutEdges => Mutation::NumOutEdges(value),
        RegId::NumTrackedAtomic => Mutation::NumTrackedAtomic(value),
        RegId::ChunkSize => {
            ensure!(value > 0, "chunk size must be non-zero");
            Mutation::ChunkSize(value)
        }
        RegId::IsSparse => Mutation::Sparse(value == 1),
        RegId::IsCopy => Mutation::Copy(value == 1),
        RegId::DedupEnabled => Mutation::Dedup(value == 1),
        RegId::NoStatusRead => Mutation::NoStatusRead(value == 1),
        RegId::EnablePrefetch => Mutation::EnablePrefetch(value == 1),
        RegId::PrefetchAddr => Mutation::PrefetchAddr(value),
        RegId::PrefetchSize => Mutation::PrefetchSize(value * EDGE_BYTES / line_bytes),
        RegId::OldValue(i) => Mutation::OldValue(i, value),
        RegId::EnableAtomic => Mutation::EnableAtomic(value == 1),
        RegId::AtomicOpcode(i) => {
            let Some(&tag) = data.first() else {
                bail!("empty store to opcode register {}", i + 1);
            };
            Mutation::Opcode(i, Opcode::from_tag(tag)?)
        }
        RegId::SrcInfo => Mutation::SrcInfo(le_array(data)),
        RegId::AddInfo => Mutation::AddInfo(i32::from_le_bytes(le_array(data))),
        RegId::EdgeIndex => Mutation::EdgeIndex(u32::from_le_bytes(le_array(data))),
        RegId::CasCompare => Mutation::CasCompare(le_array(data)),
        RegId::DestInfo => Mutation::DestInfo(u32::from_le_bytes(le_array(data))),
        RegId::ProfileClear => Mutation::ProfileClear(value),
        RegId::ProfileStart => Mutation::ProfileStart(value),
        RegId::ProfileStop => Mutation::ProfileStop(value),
        RegId::ProfileDump => Mutation::ProfileDump(value),
        RegId::ProfileRangeStart(i) => Mutation::ProfileRangeStart(i, value),
        RegId::ProfileRangeBytes(i) => Mutation::ProfileRangeBytes(i, value),
        RegId::NumMappedVertices
        | RegId::ActiveVerticesPerSpm
        | RegId::ActiveVerticesTotal
        | RegId::OutstandingPiscOps => return Ok(None),
    };
    Ok(Some(mutation))
}
