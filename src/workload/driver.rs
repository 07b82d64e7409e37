use std::collections::VecDeque;

use anyhow::bail;
use log::{debug, info};
use serde::Serialize;

use crate::sequencer::mmio::RegId;
use crate::sequencer::request::{RequestDescriptor, RequestStatus};
use crate::sim::top::{Driver, SpmSystem};
use crate::spm::atomic::{Opcode, SENTINEL};
use crate::timeq::Cycle;
use crate::workload::config::{WorkloadConfig, WorkloadKind};
use crate::workload::graph::Graph;

const VERTEX_BYTES: u64 = 8;
const FRONTIER_ENTRY_BYTES: u64 = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Operand {
    Imm(u64),
    LastLoad,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LoadTag {
    Value,
    ActiveTotal,
    Frontier,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CoreOp {
    Store { addr: u64, value: Operand, size: usize },
    Load { addr: u64, size: usize, tag: LoadTag },
    // re-read until the register reads zero
    PollZero { addr: u64 },
    Increment { addr: u64, linked: Option<u64> },
}

impl CoreOp {
    fn reg(reg: RegId, value: u64) -> Self {
        CoreOp::Store {
            addr: reg.addr(),
            value: Operand::Imm(value),
            size: 8,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PhaseKind {
    Setup,
    Init,
    Arm(usize),
    Push(usize),
    Drain(usize),
    Scan(usize),
    Advance(usize),
    Counter,
}

struct Phase {
    kind: PhaseKind,
    ops: Vec<VecDeque<CoreOp>>,
}

#[derive(Debug, Default)]
struct CoreState {
    ops: VecDeque<CoreOp>,
    waiting: bool,
    last_load: u64,
}

impl CoreState {
    fn is_idle(&self) -> bool {
        self.ops.is_empty() && !self.waiting
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct IterationReport {
    pub iteration: usize,
    pub active_total: u64,
    pub dense_active: u64,
    pub sparse_entries: u64,
    pub finished_at: Cycle,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct WorkloadReport {
    pub kind: String,
    pub vertices: usize,
    pub edges: usize,
    pub iterations: Vec<IterationReport>,
    pub requests: u64,
    pub retries: u64,
    pub polls: u64,
    pub increments: u64,
    pub sc_failures: u64,
    pub counter_value: u64,
}

/// Runs a workload as per-core programs of register and memory accesses, phase by phase.
/// A phase starts once every core has retired its part of the previous one.
pub struct WorkloadDriver {
    config: WorkloadConfig,
    graph: Graph,
    phases: VecDeque<Phase>,
    current: Option<PhaseKind>,
    cores: Vec<CoreState>,
    report: WorkloadReport,
}

impl WorkloadDriver {
    pub fn new(config: &WorkloadConfig, system: &SpmSystem) -> anyhow::Result<Self> {
        config.ensure_valid();
        let kind = config.kind()?;
        let num_cores = system.num_cores();
        let mapped = system.state().map.num_mapped_lines();
        if config.vertices > mapped {
            bail!(
                "{} vertices do not fit in {} scratchpad lines",
                config.vertices,
                mapped
            );
        }
        let opcode = Opcode::from_tag(config.opcode as u8)?;

        let graph = match kind {
            WorkloadKind::Push => Graph::random(config.vertices, config.avg_degree, config.seed),
            WorkloadKind::Counter => Graph::default(),
        };
        let mut driver = Self {
            config: config.clone(),
            graph,
            phases: VecDeque::new(),
            current: None,
            cores: (0..num_cores).map(|_| CoreState::default()).collect(),
            report: WorkloadReport {
                kind: config.kind.clone(),
                ..WorkloadReport::default()
            },
        };
        match kind {
            WorkloadKind::Push => driver.plan_push(opcode),
            WorkloadKind::Counter => driver.plan_counter(),
        }
        driver.report.vertices = driver.graph.num_vertices();
        driver.report.edges = driver.graph.num_edges();
        info!(
            "workload {}: {} vertices, {} edges, {} phases on {} cores",
            config.kind,
            driver.report.vertices,
            driver.report.edges,
            driver.phases.len(),
            num_cores
        );
        Ok(driver)
    }

    pub fn report(&self) -> &WorkloadReport {
        &self.report
    }

    fn num_cores(&self) -> usize {
        self.cores.len()
    }

    fn phase(&mut self, kind: PhaseKind) -> &mut Vec<VecDeque<CoreOp>> {
        let ops = vec![VecDeque::new(); self.num_cores()];
        self.phases.push_back(Phase { kind, ops });
        let Some(phase) = self.phases.back_mut() else {
            unreachable!()
        };
        &mut phase.ops
    }

    fn vertex_addr(&self, v: u64) -> u64 {
        self.config.vertex_base + VERTEX_BYTES * v
    }

    fn frontier_stride(&self) -> u64 {
        if self.config.sparse {
            FRONTIER_ENTRY_BYTES
        } else {
            1
        }
    }

    fn plan_push(&mut self, opcode: Opcode) {
        let cfg = self.config.clone();
        let n = self.num_cores() as u64;
        let edges = self.graph.num_edges() as u64;
        let stride = self.frontier_stride();

        self.phase(PhaseKind::Setup)[0].extend([
            CoreOp::reg(RegId::DataTypeSize(0), VERTEX_BYTES),
            CoreOp::reg(RegId::Stride(0), VERTEX_BYTES),
            CoreOp::reg(RegId::VertexStart(0), cfg.vertex_base),
            CoreOp::reg(RegId::NumVertex, cfg.vertices),
            CoreOp::reg(RegId::ChunkSize, cfg.chunk_size),
            CoreOp::reg(RegId::NumOutEdges, edges),
            CoreOp::reg(RegId::IsSparse, cfg.sparse as u64),
            CoreOp::reg(RegId::DedupEnabled, cfg.dedup as u64),
            CoreOp::reg(RegId::DataTypeSize(2), stride),
            CoreOp::reg(RegId::Stride(2), stride),
            CoreOp::reg(RegId::VertexStart(2), cfg.frontier_base),
            CoreOp::reg(RegId::AtomicOpcode(0), opcode.tag() as u64),
            CoreOp::reg(RegId::EnableTracked(0), 1),
            CoreOp::reg(RegId::EnableTracked(2), 1),
        ]);

        let init: Vec<_> = (0..cfg.vertices)
            .map(|v| {
                (
                    (v % n) as usize,
                    CoreOp::Store {
                        addr: self.vertex_addr(v),
                        value: Operand::Imm(1),
                        size: VERTEX_BYTES as usize,
                    },
                )
            })
            .collect();
        let phase = self.phase(PhaseKind::Init);
        for (core, op) in init {
            phase[core].push_back(op);
        }

        for iter in 0..cfg.iterations as usize {
            self.phase(PhaseKind::Arm(iter))[0].push_back(CoreOp::reg(RegId::EnableAtomic, 1));
            let push = self.push_ops();
            let phase = self.phase(PhaseKind::Push(iter));
            for (core, ops) in push.into_iter().enumerate() {
                phase[core].extend(ops);
            }

            self.phase(PhaseKind::Drain(iter))[0].extend([
                CoreOp::PollZero {
                    addr: RegId::OutstandingPiscOps.addr(),
                },
                CoreOp::Load {
                    addr: RegId::ActiveVerticesTotal.addr(),
                    size: 8,
                    tag: LoadTag::ActiveTotal,
                },
                CoreOp::reg(RegId::EnableAtomic, 0),
            ]);

            // dense frontiers: read each flag, then clear it for the iteration after next
            if !cfg.sparse {
                let phase = self.phase(PhaseKind::Scan(iter));
                for v in 0..cfg.vertices {
                    let addr = cfg.frontier_base + v;
                    phase[(v % n) as usize].extend([
                        CoreOp::Load {
                            addr,
                            size: 1,
                            tag: LoadTag::Frontier,
                        },
                        CoreOp::Store {
                            addr,
                            value: Operand::Imm(0),
                            size: 1,
                        },
                    ]);
                }
            }

            self.phase(PhaseKind::Advance(iter))[0].extend([
                CoreOp::reg(RegId::EnableTracked(2), 0),
                CoreOp::reg(RegId::EnableTracked(2), 1),
            ]);
        }
    }

    // Core c pushes the sources v with v % cores == c: load the source value once, stage it,
    // then one dest-info store per out-edge.
    fn push_ops(&self) -> Vec<Vec<CoreOp>> {
        let n = self.num_cores();
        let mut ops = vec![Vec::new(); n];
        for v in 0..self.graph.num_vertices() {
            let targets = self.graph.out_edges(v);
            if targets.is_empty() {
                continue;
            }
            let core = &mut ops[v % n];
            core.push(CoreOp::Load {
                addr: self.vertex_addr(v as u64),
                size: VERTEX_BYTES as usize,
                tag: LoadTag::Value,
            });
            core.push(CoreOp::Store {
                addr: RegId::SrcInfo.addr(),
                value: Operand::LastLoad,
                size: 8,
            });
            for (edge, &dst) in self.graph.edge_range(v).zip(targets) {
                if self.config.sparse {
                    core.push(CoreOp::reg(RegId::EdgeIndex, edge as u64));
                }
                core.push(CoreOp::Store {
                    addr: RegId::DestInfo.addr(),
                    value: Operand::Imm(dst as u64),
                    size: FRONTIER_ENTRY_BYTES as usize,
                });
            }
        }
        ops
    }

    fn plan_counter(&mut self) {
        let addr = self.config.counter_addr;
        let increments = self.config.increments;
        for ops in self.phase(PhaseKind::Counter).iter_mut() {
            ops.extend((0..increments).map(|_| CoreOp::Increment { addr, linked: None }));
        }
    }

    fn request_for(&self, core: usize, op: CoreOp) -> RequestDescriptor {
        let last_load = self.cores[core].last_load;
        match op {
            CoreOp::Store { addr, value, size } => {
                let value = match value {
                    Operand::Imm(v) => v,
                    Operand::LastLoad => last_load,
                };
                RequestDescriptor::write(core, addr, &value.to_le_bytes()[..size])
            }
            CoreOp::Load { addr, size, .. } => RequestDescriptor::read(core, addr, size),
            CoreOp::PollZero { addr } => RequestDescriptor::read(core, addr, 8),
            CoreOp::Increment { addr, linked: None } => {
                let mut req = RequestDescriptor::read(core, addr, 8);
                req.llsc = true;
                req
            }
            CoreOp::Increment {
                addr,
                linked: Some(value),
            } => {
                let mut req = RequestDescriptor::write_u64(core, addr, value + 1);
                req.llsc = true;
                req
            }
        }
    }

    fn retire(&mut self, core: usize, response: &RequestDescriptor, llsc_success: bool) {
        let state = &mut self.cores[core];
        let Some(op) = state.ops.front_mut() else {
            panic!("core {}: response with no operation in flight", core);
        };
        let value = response.value_u64();
        let done = match op {
            CoreOp::Store { .. } => true,
            CoreOp::Load { tag, .. } => {
                state.last_load = value;
                if let Some(iter) = self.report.iterations.last_mut() {
                    match tag {
                        LoadTag::ActiveTotal => iter.active_total = value,
                        LoadTag::Frontier => iter.dense_active += (value != 0) as u64,
                        LoadTag::Value => {}
                    }
                }
                true
            }
            CoreOp::PollZero { .. } => {
                if value != 0 {
                    self.report.polls += 1;
                }
                value == 0
            }
            CoreOp::Increment { linked, .. } => match *linked {
                None => {
                    *linked = Some(value);
                    false
                }
                Some(_) if llsc_success => {
                    self.report.increments += 1;
                    true
                }
                Some(_) => {
                    *linked = None;
                    self.report.sc_failures += 1;
                    false
                }
            },
        };
        if done {
            state.ops.pop_front();
        }
    }

    fn count_sparse_frontier(&self, system: &SpmSystem) -> u64 {
        let base = self.config.frontier_base;
        (0..self.graph.num_edges() as u64)
            .map(|e| system.memory().read(base + FRONTIER_ENTRY_BYTES * e, 4))
            .filter(|entry| u32::from_le_bytes([entry[0], entry[1], entry[2], entry[3]]) != SENTINEL)
            .count() as u64
    }

    fn finish_phase(&mut self, system: &SpmSystem, now: Cycle) {
        let Some(kind) = self.current.take() else {
            return;
        };
        debug!("workload phase {:?} done at cycle {}", kind, now);
        match kind {
            PhaseKind::Drain(_) if self.config.sparse => {
                let entries = self.count_sparse_frontier(system);
                if let Some(iter) = self.report.iterations.last_mut() {
                    iter.sparse_entries = entries;
                }
            }
            PhaseKind::Advance(_) => {
                if let Some(iter) = self.report.iterations.last_mut() {
                    iter.finished_at = now;
                }
            }
            PhaseKind::Counter => {
                self.report.counter_value = system.memory().read_u64(self.config.counter_addr);
            }
            _ => {}
        }
    }

    fn start_phase(&mut self, phase: Phase) {
        if let PhaseKind::Arm(iteration) = phase.kind {
            self.report.iterations.push(IterationReport {
                iteration,
                ..IterationReport::default()
            });
        }
        self.current = Some(phase.kind);
        for (core, ops) in self.cores.iter_mut().zip(phase.ops) {
            core.ops = ops;
        }
    }
}

impl Driver for WorkloadDriver {
    fn tick(&mut self, system: &mut SpmSystem, now: Cycle) -> anyhow::Result<()> {
        for core in 0..self.num_cores() {
            for completion in system.drain_completions(core) {
                if self.cores[core].waiting {
                    self.cores[core].waiting = false;
                    self.retire(core, &completion.request, completion.llsc_success);
                }
            }
        }

        if self.cores.iter().all(CoreState::is_idle) {
            self.finish_phase(system, now);
            if let Some(phase) = self.phases.pop_front() {
                self.start_phase(phase);
            }
        }

        for core in 0..self.num_cores() {
            if self.cores[core].waiting {
                continue;
            }
            let Some(&op) = self.cores[core].ops.front() else {
                continue;
            };
            let mut req = self.request_for(core, op);
            self.report.requests += 1;
            match system.submit(core, &mut req, now)? {
                RequestStatus::Satisfied => self.retire(core, &req, true),
                RequestStatus::Issued => self.cores[core].waiting = true,
                RequestStatus::Aliased | RequestStatus::BufferFull => self.report.retries += 1,
                RequestStatus::Ready => unreachable!("admission status escaped the sequencer"),
            }
        }
        Ok(())
    }

    fn is_done(&self) -> bool {
        self.phases.is_empty() && self.current.is_none() && self.cores.iter().all(CoreState::is_idle)
    }
}
