pub mod mmio;
pub mod pisc;
pub mod profile;
pub mod readonly;
pub mod request;
pub mod table;

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use anyhow::bail;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::sequencer::mmio::{Mutation, RegId};
use crate::sequencer::pisc::PseudoAddressPool;
use crate::sequencer::profile::{AccessClass, ProfileSet};
use crate::sequencer::readonly::ReadOnlyBuffers;
use crate::sequencer::request::{MemCmd, RequestDescriptor, RequestKind, RequestStatus, SequencerRequest};
use crate::sequencer::table::OutstandingRequestTable;
use crate::sim::config::Config;
use crate::sim::log::Logger;
use crate::spm::addr_map::{AddressSpaceMap, Classification, RangeId};
use crate::spm::atomic::{ActiveVertexCounters, AtomicOperands, Opcode};
use crate::timeq::Cycle;
use crate::{debug, info};

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct SequencerConfig {
    pub num_cores: usize,
    pub max_outstanding_requests: usize,
    pub deadlock_threshold: Cycle,
    pub data_hit_latency: Cycle,
    pub inst_hit_latency: Cycle,
    pub vertex_hit_latency: Cycle,
    /// Return atomic updates to the core as soon as they are admitted.
    pub async_pisc: bool,
    pub async_pisc_limit: usize,
    pub pseudo_addr_base: u64,
    pub line_bytes: u64,
    pub track_iteration_parity: bool,
}

impl Default for SequencerConfig {
    fn default() -> Self {
        let s = Self {
            num_cores: 4,
            max_outstanding_requests: 16,
            deadlock_threshold: 500_000,
            data_hit_latency: 1,
            inst_hit_latency: 1,
            vertex_hit_latency: 1,
            async_pisc: true,
            async_pisc_limit: 16,
            pseudo_addr_base: 0xFFFF_FFFF_FFFF_0000,
            line_bytes: 64,
            track_iteration_parity: true,
        };
        s.ensure_valid();
        s
    }
}

impl Config for SequencerConfig {}

impl SequencerConfig {
    pub fn ensure_valid(&self) {
        assert!(self.num_cores > 0, "num_cores must be > 0");
        assert!(self.max_outstanding_requests > 0, "max_outstanding_requests must be > 0");
        assert!(self.deadlock_threshold > 0, "deadlock_threshold must be > 0");
        assert!(
            self.data_hit_latency > 0 && self.inst_hit_latency > 0 && self.vertex_hit_latency > 0,
            "hit latencies must be > 0"
        );
        assert!(
            self.async_pisc_limit >= self.max_outstanding_requests,
            "async_pisc_limit must cover max_outstanding_requests"
        );
        assert!(self.line_bytes.is_power_of_two(), "line_bytes must be a power of two");
    }
}

#[derive(Debug, Error)]
pub enum SequencerError {
    #[error(
        "possible deadlock detected: seq {seq} {kind:?} paddr {paddr:#x} vaddr {vaddr:#x} \
         reads {reads} writes {writes} now {now} issued {issued_at} waited {waited} (threshold {threshold})"
    )]
    Deadlock {
        seq: usize,
        kind: RequestKind,
        paddr: u64,
        vaddr: u64,
        reads: usize,
        writes: usize,
        now: Cycle,
        issued_at: Cycle,
        waited: Cycle,
        threshold: Cycle,
    },
}

/// System-wide state the register file programs and every sequencer and controller reads.
#[derive(Debug, Serialize)]
pub struct EngineState {
    pub map: AddressSpaceMap,
    pub counters: ActiveVertexCounters,
    #[serde(skip)]
    pub readonly: ReadOnlyBuffers,
    pub profiles: ProfileSet,
    pub enable_atomic: bool,
    pub opcodes: [Option<Opcode>; 2],
    pub no_status_read: bool,
    pub old_values: [u64; 2],
    pub outstanding_pisc: u64,
    pub prefetch_line: u64,
    pub track_iteration_parity: bool,
}

impl EngineState {
    pub fn new(num_cores: usize, sets_per_core: u64, track_iteration_parity: bool) -> Self {
        Self {
            map: AddressSpaceMap::new(num_cores, sets_per_core),
            counters: ActiveVertexCounters::new(num_cores),
            readonly: ReadOnlyBuffers::new(num_cores),
            profiles: ProfileSet::default(),
            enable_atomic: false,
            opcodes: [None; 2],
            no_status_read: false,
            old_values: [0; 2],
            outstanding_pisc: 0,
            prefetch_line: 0,
            track_iteration_parity,
        }
    }

    fn apply_range3_enable(&mut self, enabled: bool) {
        let tracks = self.opcodes[0].map_or(true, Opcode::tracks_previous_frontier);
        if tracks && !enabled {
            if self.map.sparse {
                self.map.drop_range3_shadow();
            } else {
                self.map.shadow_range3();
                if self.track_iteration_parity {
                    self.map.advance_iteration_parity();
                }
            }
        }
        self.map.range_mut(RangeId::R3).enabled = enabled;
    }
}

/// A protocol message on its way to a controller or the backing memory.
#[derive(Debug, Clone)]
pub struct Issued {
    pub core: usize,
    pub line_addr: u64,
    pub kind: RequestKind,
    pub request: RequestDescriptor,
    pub latency: Cycle,
}

#[derive(Debug, Clone)]
pub struct Completion {
    pub request: RequestDescriptor,
    pub kind: RequestKind,
    pub latency: Cycle,
    pub llsc_success: bool,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct SequencerStats {
    pub requests: u64,
    pub issued: u64,
    pub satisfied: u64,
    pub aliased: u64,
    pub buffer_full: u64,
    pub completed: u64,
    pub readonly_hits: u64,
    pub mmio_writes: u64,
    pub mmio_reads: u64,
    pub pisc_issued: u64,
    pub pisc_completed: u64,
    pub active_list_writes: u64,
    pub active_list_retries: u64,
    pub sc_failures: u64,
    pub total_latency: u64,
}

#[derive(Debug, Clone, Copy, Default)]
struct StagedOperands {
    src: [u8; 8],
    add_info: i32,
    edge_index: u32,
    cas_compare: [u8; 4],
    enable_prefetch: bool,
    prefetch_lines: u64,
}

enum Applied {
    Satisfied,
    // the store continues into classification
    Continue,
}

/// An active-list write the table could not admit yet, with the cycle it was first parked.
struct ParkedWrite {
    request: RequestDescriptor,
    parked_at: Cycle,
}

/// Per-core request sequencer: intercepts the core's accesses, classifies them against the
/// address map, admits them through the outstanding-request table and hands protocol
/// messages to the fabric.
pub struct Sequencer {
    id: usize,
    config: SequencerConfig,
    table: OutstandingRequestTable,
    outstanding: usize,
    pool: Option<PseudoAddressPool>,
    retry_active: VecDeque<ParkedWrite>,
    local_pisc: u64,
    locks: HashMap<u64, usize>,
    staged: StagedOperands,
    deadlock_check_at: Option<Cycle>,
    outbox: Vec<Issued>,
    completions: Vec<Completion>,
    stats: SequencerStats,
    logger: Arc<Logger>,
}

impl Sequencer {
    pub fn new(id: usize, config: SequencerConfig, logger: Arc<Logger>) -> Self {
        config.ensure_valid();
        let pool = config
            .async_pisc
            .then(|| PseudoAddressPool::new(config.pseudo_addr_base, config.async_pisc_limit));
        Self {
            id,
            config,
            table: OutstandingRequestTable::new(),
            outstanding: 0,
            pool,
            retry_active: VecDeque::new(),
            local_pisc: 0,
            locks: HashMap::new(),
            staged: StagedOperands::default(),
            deadlock_check_at: None,
            outbox: Vec::new(),
            completions: Vec::new(),
            stats: SequencerStats::default(),
            logger,
        }
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn outstanding(&self) -> usize {
        self.outstanding
    }

    pub fn table(&self) -> &OutstandingRequestTable {
        &self.table
    }

    pub fn local_pisc_ops(&self) -> u64 {
        self.local_pisc
    }

    pub fn stats(&self) -> &SequencerStats {
        &self.stats
    }

    pub fn deadlock_check_at(&self) -> Option<Cycle> {
        self.deadlock_check_at
    }

    pub fn take_outbox(&mut self) -> Vec<Issued> {
        std::mem::take(&mut self.outbox)
    }

    pub fn take_completions(&mut self) -> Vec<Completion> {
        std::mem::take(&mut self.completions)
    }

    fn line_address(&self, addr: u64) -> u64 {
        addr & !(self.config.line_bytes - 1)
    }

    /// Entry point for every core access. Satisfied requests carry their response in `req`;
    /// `Aliased` and `BufferFull` ask the core to retry later.
    pub fn make_request(
        &mut self,
        state: &mut EngineState,
        req: &mut RequestDescriptor,
        now: Cycle,
    ) -> anyhow::Result<RequestStatus> {
        self.stats.requests += 1;
        debug!(
            self.logger,
            "seq {} request {:?} vaddr {:#x} size {}", self.id, req.cmd, req.vaddr, req.size
        );

        if req.cmd == MemCmd::Flush {
            state.readonly.invalidate(req.context);
        }

        if req.is_write() {
            if let Some(reg) = RegId::lookup(req.vaddr) {
                if let Some(mutation) = mmio::decode_write(reg, &req.data, self.config.line_bytes)? {
                    if let Applied::Satisfied = self.apply(state, mutation, req, now)? {
                        self.stats.mmio_writes += 1;
                        self.stats.satisfied += 1;
                        state.profiles.log_access(req.vaddr, AccessClass::StMmio, 0);
                        return Ok(RequestStatus::Satisfied);
                    }
                }
            }
        } else if req.is_read() {
            if let Some(class) = self.serve_read(state, req) {
                self.stats.satisfied += 1;
                state.profiles.log_access(req.vaddr, class, 0);
                return Ok(RequestStatus::Satisfied);
            }
        }

        if self.outstanding >= self.config.max_outstanding_requests {
            self.stats.buffer_full += 1;
            return Ok(RequestStatus::BufferFull);
        }

        let kind = self.classify(state, req);

        if req.is_atomic && self.pool.is_some() {
            let (status, line_addr) = self.insert_request(req, kind, now);
            assert_eq!(
                RequestStatus::Ready,
                status,
                "seq {}: async atomic to vertex {} aliased",
                self.id,
                req.atomic.map_or(0, |(_, ops)| ops.dest_vertex)
            );
            self.issue(state, req, kind, line_addr, now);
            self.stats.satisfied += 1;
            return Ok(RequestStatus::Satisfied);
        }

        let (status, line_addr) = self.insert_request(req, kind, now);
        if status != RequestStatus::Ready {
            self.stats.aliased += 1;
            return Ok(status);
        }
        self.issue(state, req, kind, line_addr, now);
        Ok(RequestStatus::Issued)
    }

    fn serve_read(&mut self, state: &mut EngineState, req: &mut RequestDescriptor) -> Option<AccessClass> {
        let ctx = req.context;
        if state.enable_atomic && state.readonly.is_valid(ctx) {
            if let Some(cached) = state.readonly.lookup(ctx, req.vaddr) {
                let cached = cached.to_vec();
                req.set_response(&cached);
                self.stats.readonly_hits += 1;
                return Some(AccessClass::LdReadOnlyBuffer);
            }
        }
        let value = match RegId::lookup(req.vaddr).filter(|reg| reg.is_readable())? {
            RegId::NumMappedVertices => state.map.num_mapped_lines(),
            RegId::ActiveVerticesTotal => state.counters.total(),
            RegId::ActiveVerticesPerSpm => state.counters.per_spm(ctx),
            RegId::OutstandingPiscOps => state.outstanding_pisc,
            reg => unreachable!("{:?} is not a readable register", reg),
        };
        req.set_response(&value.to_le_bytes());
        self.stats.mmio_reads += 1;
        Some(AccessClass::LdMmio)
    }

    fn apply(
        &mut self,
        state: &mut EngineState,
        mutation: Mutation,
        req: &mut RequestDescriptor,
        now: Cycle,
    ) -> anyhow::Result<Applied> {
        match mutation {
            Mutation::RangeElemSize(id, v) => state.map.range_mut(id).elem_size = v,
            Mutation::RangeStride(id, v) => state.map.range_mut(id).stride = v,
            Mutation::RangeBase(id, v) => state.map.range_mut(id).base = v,
            Mutation::RangeEnable(RangeId::R3, enabled) => state.apply_range3_enable(enabled),
            Mutation::RangeEnable(id, enabled) => state.map.range_mut(id).enabled = enabled,
            Mutation::NumVertices(v) => state.map.num_vertices = v,
            Mutation::NumOutEdges(v) => state.map.num_out_edges = v,
            Mutation::NumTrackedAtomic(v) => state.map.num_tracked_atomic = v,
            Mutation::ChunkSize(v) => {
                if v > state.map.chunk_limit() {
                    bail!(
                        "seq {}: chunk size {} exceeds the scratchpad limit of {}",
                        self.id,
                        v,
                        state.map.chunk_limit()
                    );
                }
                state.map.chunk_size = v;
            }
            Mutation::Sparse(v) => state.map.sparse = v,
            Mutation::Copy(v) => state.map.copy = v,
            Mutation::Dedup(v) => state.map.dedup = v,
            Mutation::NoStatusRead(v) => state.no_status_read = v,
            Mutation::EnablePrefetch(v) => self.staged.enable_prefetch = v,
            Mutation::PrefetchAddr(addr) => {
                if self.staged.enable_prefetch {
                    state.prefetch_line = self.line_address(addr);
                }
            }
            Mutation::PrefetchSize(lines) => {
                self.staged.prefetch_lines = lines;
                if self.staged.enable_prefetch {
                    req.prefetch_base = state.prefetch_line;
                    req.prefetch_lines = lines;
                    return Ok(Applied::Continue);
                }
            }
            Mutation::OldValue(i, v) => state.old_values[i] = v,
            Mutation::EnableAtomic(true) => {
                state.enable_atomic = true;
                state.counters.reset();
                state.readonly.enable_all();
            }
            Mutation::EnableAtomic(false) => {
                state.enable_atomic = false;
                state.readonly.invalidate_all();
            }
            Mutation::Opcode(i, opcode) => state.opcodes[i] = Some(opcode),
            Mutation::SrcInfo(src) => self.staged.src = src,
            Mutation::AddInfo(v) => self.staged.add_info = v,
            Mutation::EdgeIndex(v) => self.staged.edge_index = v,
            Mutation::CasCompare(v) => self.staged.cas_compare = v,
            Mutation::DestInfo(dest_vertex) => {
                if state.enable_atomic {
                    self.build_atomic(state, req, dest_vertex)?;
                }
                return Ok(Applied::Continue);
            }
            Mutation::ProfileClear(i) => state.profiles.clear(i)?,
            Mutation::ProfileStart(i) => state.profiles.start(i, now)?,
            Mutation::ProfileStop(i) => state.profiles.stop(i, now)?,
            Mutation::ProfileDump(i) => {
                let dump = state.profiles.dump(i)?;
                info!(self.logger, "seq {} {}", self.id, dump);
                log::info!("{}", dump);
            }
            Mutation::ProfileRangeStart(i, v) => state.profiles.set_range_start(i, v),
            Mutation::ProfileRangeBytes(i, v) => state.profiles.set_range_bytes(i, v),
        }
        Ok(Applied::Satisfied)
    }

    fn build_atomic(
        &mut self,
        state: &mut EngineState,
        req: &mut RequestDescriptor,
        dest_vertex: u32,
    ) -> anyhow::Result<()> {
        let Some(opcode) = state.opcodes[0] else {
            bail!("seq {}: dest-info store with no aggregation opcode configured", self.id);
        };
        let map = &state.map;
        let dest_core = map.destination_core(dest_vertex as u64);
        let operands = AtomicOperands {
            src: self.staged.src,
            cas_compare: self.staged.cas_compare,
            add_info: self.staged.add_info,
            dest_vertex,
            dest_core,
            sparse: map.sparse,
            dedup: map.dedup,
        };
        req.atomic = Some((opcode, operands));
        req.is_atomic = true;
        req.sparse = map.sparse;
        req.dedup = map.dedup;
        req.dest_core = dest_core;
        req.set = map.set_index(dest_vertex as u64);
        req.slot = 0;
        req.local = dest_core == req.context;
        req.num_tracked_atomic = map.num_tracked_atomic;
        if map.sparse {
            req.edge_vaddr = map.sparse_edge_address(self.staged.edge_index as u64);
        }
        debug!(
            self.logger,
            "seq {} atomic {} dest {} core {} set {} edge {:#x}",
            self.id,
            opcode.name(),
            dest_vertex,
            dest_core,
            req.set,
            req.edge_vaddr
        );
        Ok(())
    }

    fn fill(req: &mut RequestDescriptor, class: &Classification) {
        req.dest_core = class.dest_core;
        req.set = class.set;
        req.slot = class.slot;
        req.sparse = class.sparse;
        req.local = class.dest_core == req.context;
    }

    fn active_list_range(map: &AddressSpaceMap, addr: u64) -> Option<Classification> {
        if map.sparse {
            return None;
        }
        map.classify_in(addr, RangeId::R3)
            .or_else(|| map.classify_in(addr, RangeId::R3Old))
    }

    /// Protocol request type for `req`, recording placement details on the request.
    pub fn classify(&self, state: &EngineState, req: &mut RequestDescriptor) -> RequestKind {
        use RequestKind::*;
        let map = &state.map;
        let pick = |local: bool, l: RequestKind, r: RequestKind| if local { l } else { r };

        if req.is_atomic {
            return pick(req.local, StVertexLocal, StVertexRemote);
        }
        if req.llsc {
            return if req.is_write() { StoreConditional } else { LoadLinked };
        }
        if req.locked_rmw {
            let vertex = map.classify(req.vaddr);
            if let Some(class) = &vertex {
                Self::fill(req, class);
            }
            return match (req.is_write(), vertex.is_some()) {
                (true, true) => pick(req.local, LockedVertexWriteLocal, LockedVertexWriteRemote),
                (true, false) => LockedRmwWrite,
                (false, true) => pick(req.local, LockedVertexReadLocal, LockedVertexReadRemote),
                (false, false) => LockedRmwRead,
            };
        }

        match req.cmd {
            MemCmd::Read => {
                if req.inst_fetch {
                    return IFetch;
                }
                if req.store_check {
                    return RmwRead;
                }
                if let Some(class) = Self::active_list_range(map, req.vaddr) {
                    Self::fill(req, &class);
                    return pick(req.local, CheckActiveVertexLocal, CheckActiveVertexRemote);
                }
                match map.classify(req.vaddr) {
                    Some(class) => {
                        Self::fill(req, &class);
                        pick(req.local, LdVertexLocal, LdVertexRemote)
                    }
                    None => Ld,
                }
            }
            MemCmd::Write => {
                if req.vaddr == RegId::PrefetchSize.addr() {
                    return PrefetchEdge;
                }
                if !req.active_list_handled {
                    if !map.sparse {
                        if let Some(class) = map.classify_in(req.vaddr, RangeId::R3) {
                            Self::fill(req, &class);
                            req.is_copy = map.copy;
                            return pick(req.local, CheckActiveVertexLocal, CheckActiveVertexRemote);
                        }
                        if let Some(class) = map.classify_in(req.vaddr, RangeId::R3Old) {
                            Self::fill(req, &class);
                            return pick(req.local, CheckActiveVertexLocal, CheckActiveVertexRemote);
                        }
                    }
                    if let Some(class) = map.classify(req.vaddr) {
                        Self::fill(req, &class);
                        return pick(req.local, StVertexLocal, StVertexRemote);
                    }
                }
                St
            }
            MemCmd::Flush => Flush,
        }
    }

    /// Admit `req` into the outstanding table. Returns the status and the key it was
    /// admitted under (its line, its raw address for vertex kinds, or a pooled address for
    /// asynchronous atomics).
    pub fn insert_request(
        &mut self,
        req: &RequestDescriptor,
        kind: RequestKind,
        now: Cycle,
    ) -> (RequestStatus, u64) {
        assert_eq!(
            self.outstanding,
            self.table.len() + self.retry_active.len(),
            "seq {}: outstanding count out of sync",
            self.id
        );
        if self.deadlock_check_at.is_none() {
            self.deadlock_check_at = Some(now + self.config.deadlock_threshold);
        }
        if self.pool.is_some() {
            assert!(
                req.paddr < self.config.pseudo_addr_base,
                "seq {}: {:#x} collides with the async atomic pool",
                self.id,
                req.paddr
            );
        }

        let mut line_addr = if kind.is_vertex() {
            req.paddr
        } else {
            self.line_address(req.paddr)
        };
        let pooled = req.is_atomic && self.pool.is_some();
        if pooled {
            if let Some(pool) = self.pool.as_mut() {
                line_addr = pool.acquire();
            }
        }

        let status = self.table.insert(
            line_addr,
            SequencerRequest {
                request: req.clone(),
                kind,
                issued_at: now,
            },
        );
        match status {
            RequestStatus::Ready => self.outstanding += 1,
            _ if pooled => {
                if let Some(pool) = self.pool.as_mut() {
                    pool.release(line_addr);
                }
            }
            _ => {}
        }
        debug!(
            self.logger,
            "seq {} insert {:?} {:#x} -> {:?} ({} outstanding)",
            self.id,
            kind,
            line_addr,
            status,
            self.outstanding
        );
        (status, line_addr)
    }

    fn issue_latency(&self, req: &RequestDescriptor, kind: RequestKind) -> Cycle {
        use RequestKind::*;
        let latency = match kind {
            IFetch => self.config.inst_hit_latency,
            StVertexLocal if req.is_atomic => req
                .atomic
                .map_or(self.config.vertex_hit_latency, |(opcode, _)| opcode.latency()),
            StVertexLocal
            | LockedVertexReadLocal
            | LockedVertexReadRemote
            | LockedVertexWriteLocal
            | LockedVertexWriteRemote
            | CheckActiveVertexLocal
            | CheckActiveVertexRemote
            | PrefetchEdge
            | LdVertexLocal
            | LdVertexRemote => self.config.vertex_hit_latency,
            _ => self.config.data_hit_latency,
        };
        assert!(latency > 0, "seq {}: zero issue latency for {:?}", self.id, kind);
        latency
    }

    fn issue(
        &mut self,
        state: &mut EngineState,
        req: &RequestDescriptor,
        kind: RequestKind,
        line_addr: u64,
        now: Cycle,
    ) {
        let latency = self.issue_latency(req, kind);
        if req.is_atomic {
            state.outstanding_pisc += 1;
            self.local_pisc += 1;
            self.stats.pisc_issued += 1;
        }
        self.stats.issued += 1;
        info!(
            self.logger,
            "seq {} begin {:?} {:#x} vaddr {:#x}{} latency {} at {}",
            self.id,
            kind,
            line_addr,
            req.vaddr,
            if kind.is_vertex() {
                format!(" core {} set {} slot {}", req.dest_core, req.set, req.slot)
            } else {
                String::new()
            },
            latency,
            now
        );
        self.outbox.push(Issued {
            core: self.id,
            line_addr,
            kind,
            request: req.clone(),
            latency,
        });
    }

    /// LL/SC bookkeeping for a completing non-vertex write. Returns whether the access
    /// takes effect: a store-conditional only succeeds while this context holds the line.
    pub fn handle_llsc(&mut self, line_addr: u64, kind: RequestKind, context: usize) -> bool {
        let held = self.locks.get(&line_addr) == Some(&context);
        match kind {
            RequestKind::StoreConditional => {
                self.locks.remove(&line_addr);
                if !held {
                    self.stats.sc_failures += 1;
                }
                held
            }
            RequestKind::LoadLinked => {
                self.locks.insert(line_addr, context);
                true
            }
            _ => {
                if held {
                    self.locks.remove(&line_addr);
                }
                true
            }
        }
    }

    /// Drop any reservation on `line_addr`, after another core committed a store to it.
    pub fn invalidate_link(&mut self, line_addr: u64) -> bool {
        self.locks.remove(&line_addr).is_some()
    }

    /// Completion of a serviced message: retires the table entry, updates the read-only
    /// buffer and PISC counters, and re-issues sparse atomics and copy-mode active checks
    /// as active-list writes.
    pub fn callback(&mut self, state: &mut EngineState, msg: Issued, now: Cycle) -> anyhow::Result<()> {
        let Issued {
            line_addr,
            kind,
            mut request,
            ..
        } = msg;
        let entry = if kind.is_write_class() {
            self.table.remove_write(line_addr)
        } else {
            self.table.remove_read(line_addr)
        };
        let Some(entry) = entry else {
            panic!(
                "seq {}: completion of untracked {:?} {:#x} (vaddr {:#x})",
                self.id, kind, line_addr, request.vaddr
            );
        };
        self.outstanding -= 1;
        if request.is_atomic {
            if let Some(pool) = self.pool.as_mut() {
                pool.release(line_addr);
            }
        }

        let latency = now - entry.issued_at;
        self.stats.total_latency += latency;
        let ctx = request.context;
        if matches!(kind, RequestKind::LdVertexLocal | RequestKind::LdVertexRemote) && state.enable_atomic {
            state.readonly.insert(ctx, request.vaddr, &request.data);
        }
        state.profiles.log_access(
            request.vaddr,
            AccessClass::of(kind, request.is_write(), request.is_atomic),
            latency,
        );
        info!(
            self.logger,
            "seq {} done {:?} {:#x} {} cycles", self.id, kind, line_addr, latency
        );

        let reissue = !request.active_list_handled
            && ((request.is_atomic && request.sparse) || (kind.is_check_active() && request.is_copy));
        if reissue {
            if request.is_atomic {
                request.vaddr = request.edge_vaddr;
                request.paddr = request.edge_vaddr;
            }
            request.active_list_handled = true;
            request.is_atomic = false;
            request.cmd = MemCmd::Write;
            self.stats.active_list_writes += 1;
            return self.write_active_vertex(state, request, now, now);
        }

        if request.atomic.is_some() {
            assert!(
                state.outstanding_pisc > 0 && self.local_pisc > 0,
                "seq {}: PISC completion with none outstanding",
                self.id
            );
            state.outstanding_pisc -= 1;
            self.local_pisc -= 1;
            self.stats.pisc_completed += 1;
        }

        // an async atomic already returned to its core at admission
        if request.atomic.is_none() || self.pool.is_none() {
            self.completions.push(Completion {
                llsc_success: kind != RequestKind::StoreConditional || request.extra_data == 1,
                request,
                kind,
                latency,
            });
        }
        self.stats.completed += 1;
        self.retry_active_list(state, now)
    }

    fn write_active_vertex(
        &mut self,
        state: &mut EngineState,
        mut request: RequestDescriptor,
        parked_at: Cycle,
        now: Cycle,
    ) -> anyhow::Result<()> {
        let status = self.make_request(state, &mut request, now)?;
        if status != RequestStatus::Issued {
            debug!(
                self.logger,
                "seq {} active-list write {:#x} deferred ({:?})", self.id, request.vaddr, status
            );
            self.retry_active.push_back(ParkedWrite { request, parked_at });
            self.outstanding += 1;
            self.stats.active_list_retries += 1;
            if self.deadlock_check_at.is_none() {
                self.deadlock_check_at = Some(now + self.config.deadlock_threshold);
            }
        }
        Ok(())
    }

    fn retry_active_list(&mut self, state: &mut EngineState, now: Cycle) -> anyhow::Result<()> {
        if self.retry_active.is_empty() {
            return Ok(());
        }
        let pending: Vec<_> = self.retry_active.drain(..).collect();
        self.outstanding -= pending.len();
        for ParkedWrite { request, parked_at } in pending {
            self.write_active_vertex(state, request, parked_at, now)?;
        }
        Ok(())
    }

    /// Scan both tables and the parked active-list writes for requests older than the
    /// deadlock threshold. Rescheduled while anything is outstanding.
    pub fn wakeup(&mut self, now: Cycle) -> Result<(), SequencerError> {
        let threshold = self.config.deadlock_threshold;
        if let Some(entry) = self
            .table
            .iter()
            .map(|(_, entry)| entry)
            .find(|entry| now - entry.issued_at >= threshold)
        {
            return Err(SequencerError::Deadlock {
                seq: self.id,
                kind: entry.kind,
                paddr: entry.request.paddr,
                vaddr: entry.request.vaddr,
                reads: self.table.num_reads(),
                writes: self.table.num_writes(),
                now,
                issued_at: entry.issued_at,
                waited: now - entry.issued_at,
                threshold,
            });
        }
        if let Some(parked) = self.retry_active.iter().find(|p| now - p.parked_at >= threshold) {
            return Err(SequencerError::Deadlock {
                seq: self.id,
                kind: RequestKind::St,
                paddr: parked.request.paddr,
                vaddr: parked.request.vaddr,
                reads: self.table.num_reads(),
                writes: self.table.num_writes(),
                now,
                issued_at: parked.parked_at,
                waited: now - parked.parked_at,
                threshold,
            });
        }
        assert_eq!(
            self.outstanding,
            self.table.len() + self.retry_active.len(),
            "seq {}: outstanding count out of sync",
            self.id
        );
        self.deadlock_check_at = (self.outstanding > 0).then(|| now + threshold);
        Ok(())
    }

    /// Per-cycle housekeeping: the deadlock check when due, and deferred active-list writes.
    pub fn tick(&mut self, state: &mut EngineState, now: Cycle) -> anyhow::Result<()> {
        if self.deadlock_check_at.is_some_and(|at| now >= at) {
            self.wakeup(now)?;
        }
        self.retry_active_list(state, now)
    }
}

#[cfg(test)]
mod tests;
