use std::collections::HashMap;
use std::sync::Arc;

use log::{info, warn};
use serde::Serialize;

use crate::sequencer::request::{RequestDescriptor, RequestKind, RequestStatus};
use crate::sequencer::{Completion, EngineState, Issued, Sequencer, SequencerConfig, SequencerStats};
use crate::sim::backing::{BackingMemory, BackingStats};
use crate::sim::log::Logger;
use crate::spm::controller::{ControllerStats, ScratchpadController, Service};
use crate::spm::scratchpad::{Scratchpad, ScratchpadConfig, ScratchpadImage, ScratchpadStats};
use crate::timeq::{Cycle, LatencyQueue};

/// Whatever issues core traffic into the system, ticked once per cycle ahead of it.
pub trait Driver {
    fn tick(&mut self, system: &mut SpmSystem, now: Cycle) -> anyhow::Result<()>;
    fn is_done(&self) -> bool;
}

#[derive(Debug, Clone, Serialize)]
pub struct SystemStats {
    pub cycles: Cycle,
    pub finished: bool,
    pub iteration: u64,
    pub active_vertices_total: u64,
    pub sequencers: Vec<SequencerStats>,
    pub controllers: Vec<ControllerStats>,
    pub scratchpads: Vec<ScratchpadStats>,
    pub backing: BackingStats,
}

/// One sequencer and one scratchpad per core around shared engine state. Vertex traffic
/// crosses the network to the owning scratchpad; everything else is served by the backing
/// memory in the cycle it arrives.
pub struct SpmSystem {
    sequencers: Vec<Sequencer>,
    controllers: Vec<ScratchpadController>,
    state: EngineState,
    network: LatencyQueue<Issued>,
    responses: LatencyQueue<Issued>,
    memory: BackingMemory,
    // lines held by a core between its locked read and locked write
    locked_lines: HashMap<u64, usize>,
    completions: Vec<Vec<Completion>>,
    logger: Arc<Logger>,
    now: Cycle,
    finished: bool,
}

impl SpmSystem {
    pub fn new(
        seq_config: &SequencerConfig,
        spm_config: &ScratchpadConfig,
        logger: Arc<Logger>,
    ) -> anyhow::Result<Self> {
        seq_config.ensure_valid();
        let num_cores = seq_config.num_cores;
        let sequencers = (0..num_cores)
            .map(|id| Sequencer::new(id, seq_config.clone(), Arc::clone(&logger)))
            .collect();
        let controllers = (0..num_cores)
            .map(|id| Scratchpad::new(id, num_cores, spm_config).map(ScratchpadController::new))
            .collect::<anyhow::Result<Vec<_>>>()?;
        let mut state = EngineState::new(
            num_cores,
            spm_config.usable_sets() as u64,
            seq_config.track_iteration_parity,
        );
        state.map.set_chunk_limit(spm_config.max_chunk_size as u64);
        Ok(Self {
            sequencers,
            controllers,
            state,
            network: LatencyQueue::new(),
            responses: LatencyQueue::new(),
            memory: BackingMemory::new(),
            locked_lines: HashMap::new(),
            completions: vec![Vec::new(); num_cores],
            logger,
            now: 0,
            finished: false,
        })
    }

    pub fn num_cores(&self) -> usize {
        self.sequencers.len()
    }

    pub fn now(&self) -> Cycle {
        self.now
    }

    pub fn state(&self) -> &EngineState {
        &self.state
    }

    pub fn sequencer(&self, core: usize) -> &Sequencer {
        &self.sequencers[core]
    }

    pub fn controller(&self, core: usize) -> &ScratchpadController {
        &self.controllers[core]
    }

    pub fn memory(&self) -> &BackingMemory {
        &self.memory
    }

    pub fn memory_mut(&mut self) -> &mut BackingMemory {
        &mut self.memory
    }

    /// Hand a core access to its sequencer. Issued requests show up later through
    /// `drain_completions`; satisfied ones carry their response in `req` already.
    pub fn submit(&mut self, core: usize, req: &mut RequestDescriptor, now: Cycle) -> anyhow::Result<RequestStatus> {
        let status = self.sequencers[core].make_request(&mut self.state, req, now)?;
        self.route(core, now);
        Ok(status)
    }

    pub fn drain_completions(&mut self, core: usize) -> Vec<Completion> {
        std::mem::take(&mut self.completions[core])
    }

    pub fn is_idle(&self) -> bool {
        self.network.is_empty()
            && self.responses.is_empty()
            && self.sequencers.iter().all(|s| s.outstanding() == 0)
    }

    fn route(&mut self, core: usize, now: Cycle) {
        let seq = &mut self.sequencers[core];
        for msg in seq.take_outbox() {
            self.network.enqueue(now, msg.latency, msg);
        }
        self.completions[core].extend(seq.take_completions());
    }

    fn deliver(&mut self, mut msg: Issued, now: Cycle) {
        if msg.kind.served_by_scratchpad() {
            let dest = msg.request.dest_core;
            let service = self.controllers[dest].service(
                &mut msg.request,
                msg.kind,
                &self.state.map,
                &mut self.state.counters,
                now,
            );
            match service {
                Service::Done { latency } => {
                    self.responses.enqueue(now, latency, msg);
                }
                Service::Refused => {
                    crate::debug!(self.logger, "spm {} refused set {}, retrying", dest, msg.request.set);
                    self.network.enqueue(now, 1, msg);
                }
            }
            return;
        }

        let line = msg.line_addr;
        if let Some(&owner) = self.locked_lines.get(&line) {
            if owner != msg.core {
                self.network.enqueue(now, 1, msg);
                return;
            }
        }
        match msg.kind {
            RequestKind::LockedRmwRead => {
                self.locked_lines.insert(line, msg.core);
            }
            RequestKind::LockedRmwWrite => {
                self.locked_lines.remove(&line);
            }
            _ => {}
        }

        if msg.kind.is_write_class() && !msg.kind.is_vertex() {
            let ok = self.sequencers[msg.core].handle_llsc(line, msg.kind, msg.request.context);
            msg.request.extra_data = ok as u64;
            if !ok {
                self.responses.enqueue(now, 0, msg);
                return;
            }
        }
        self.memory.access(&mut msg.request, msg.kind);
        if msg.request.is_write() && msg.kind != RequestKind::PrefetchEdge {
            for (core, seq) in self.sequencers.iter_mut().enumerate() {
                if core != msg.core && seq.invalidate_link(line) {
                    crate::debug!(self.logger, "core {} store to {:#x} breaks core {} link", msg.core, line, core);
                }
            }
        }
        self.responses.enqueue(now, 0, msg);
    }

    pub fn tick(&mut self, now: Cycle) -> anyhow::Result<()> {
        self.now = now;
        self.logger.set_cycle(now);

        while let Some((_, msg)) = self.network.pop_ready(now) {
            self.deliver(msg, now);
        }
        while let Some((_, msg)) = self.responses.pop_ready(now) {
            let core = msg.core;
            self.sequencers[core].callback(&mut self.state, msg, now)?;
            self.route(core, now);
        }
        for core in 0..self.sequencers.len() {
            self.sequencers[core].tick(&mut self.state, now)?;
            self.route(core, now);
        }
        Ok(())
    }

    /// Step the driver and the system until the driver is done and nothing is in flight.
    /// Returns whether the run finished before `timeout`.
    pub fn run<D: Driver>(&mut self, driver: &mut D, timeout: Cycle) -> anyhow::Result<bool> {
        let start = self.now;
        for now in start..timeout {
            driver.tick(self, now)?;
            self.tick(now)?;
            if driver.is_done() && self.is_idle() {
                info!("simulation finished at cycle {}", now);
                self.finished = true;
                return Ok(true);
            }
        }
        warn!("simulation timed out after {} cycles", timeout);
        Ok(false)
    }

    pub fn stats(&self) -> SystemStats {
        SystemStats {
            cycles: self.now,
            finished: self.finished,
            iteration: self.state.map.iteration(),
            active_vertices_total: self.state.counters.total(),
            sequencers: self.sequencers.iter().map(|s| s.stats().clone()).collect(),
            controllers: self.controllers.iter().map(|c| c.stats().clone()).collect(),
            scratchpads: self
                .controllers
                .iter()
                .map(|c| c.scratchpad().stats().clone())
                .collect(),
            backing: self.memory.stats().clone(),
        }
    }

    pub fn snapshot(&self) -> Vec<ScratchpadImage> {
        self.controllers.iter().map(|c| c.scratchpad().snapshot()).collect()
    }

    pub fn restore(&mut self, images: &[ScratchpadImage]) -> anyhow::Result<()> {
        anyhow::ensure!(
            images.len() == self.controllers.len(),
            "{} scratchpad images for {} cores",
            images.len(),
            self.controllers.len()
        );
        for (controller, image) in self.controllers.iter_mut().zip(images) {
            controller.scratchpad_mut().restore(image)?;
        }
        Ok(())
    }

    pub fn dump(&self) -> String {
        self.controllers.iter().map(|c| c.scratchpad().dump()).collect()
    }
}
