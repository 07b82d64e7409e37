use serde::Serialize;

use crate::sequencer::request::{RequestDescriptor, RequestKind};
use crate::spm::addr_map::{AddressSpaceMap, SLOT_BYTES};
use crate::spm::atomic::{execute, ActiveVertexCounters};
use crate::spm::scratchpad::{AccessPermission, Scratchpad};
use crate::timeq::Cycle;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Service {
    /// Serviced; the response takes `latency` more cycles.
    Done { latency: Cycle },
    /// No way could be freed for the line; retry on a later cycle.
    Refused,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ControllerStats {
    pub loads: u64,
    pub stores: u64,
    pub atomics: u64,
    pub active_checks: u64,
    pub refusals: u64,
}

/// Scratchpad side of a vertex request: element reads and writes at the request's slot,
/// atomic updates and dense active-list checks. Scratchpad addresses are set indices.
#[derive(Debug)]
pub struct ScratchpadController {
    spm: Scratchpad,
    stats: ControllerStats,
}

impl ScratchpadController {
    pub fn new(spm: Scratchpad) -> Self {
        Self {
            spm,
            stats: ControllerStats::default(),
        }
    }

    pub fn scratchpad(&self) -> &Scratchpad {
        &self.spm
    }

    pub fn scratchpad_mut(&mut self) -> &mut Scratchpad {
        &mut self.spm
    }

    pub fn stats(&self) -> &ControllerStats {
        &self.stats
    }

    /// Make `addr` resident, evicting the policy's victim when its set is full.
    fn ensure_resident(&mut self, addr: u64, now: Cycle) -> bool {
        if self.spm.is_present(addr) {
            return true;
        }
        if !self.spm.available(addr) {
            let Some(victim) = self.spm.cache_probe(addr) else {
                return false;
            };
            // a line held by a locked read-modify-write stays until its write
            if self.spm.lookup(victim).is_some_and(|line| line.locked_by().is_some()) {
                return false;
            }
            self.spm.deallocate(victim);
            self.spm.stats_mut().evictions += 1;
        }
        self.spm.allocate(addr, now);
        true
    }

    pub fn service(
        &mut self,
        req: &mut RequestDescriptor,
        kind: RequestKind,
        map: &AddressSpaceMap,
        counters: &mut ActiveVertexCounters,
        now: Cycle,
    ) -> Service {
        assert!(
            kind.is_vertex(),
            "spm {}: {:?} for {:#x} is not a scratchpad request",
            self.spm.id(),
            kind,
            req.vaddr
        );
        if kind.is_check_active() && !req.is_write() && req.size > 1 {
            self.gather_active(req);
            return Service::Done {
                latency: self.spm.access_latency(),
            };
        }
        let addr = req.set;
        if let Some(owner) = self.spm.lookup(addr).and_then(|line| line.locked_by()) {
            if owner != req.context {
                self.stats.refusals += 1;
                return Service::Refused;
            }
        }
        if !self.ensure_resident(addr, now) {
            self.stats.refusals += 1;
            return Service::Refused;
        }

        let latency = if kind.is_check_active() {
            self.check_active(req, now)
        } else if kind.is_vertex_load() {
            self.load(req, kind, now)
        } else {
            self.store(req, kind, map, counters, now)
        };
        Service::Done { latency }
    }

    fn line_mut(&mut self, addr: u64, now: Cycle) -> &mut crate::spm::scratchpad::CacheLine {
        let id = self.spm.id();
        self.spm
            .try_access(addr, now)
            .unwrap_or_else(|| panic!("spm {}: line {:#x} vanished after allocation", id, addr))
    }

    fn load(&mut self, req: &mut RequestDescriptor, kind: RequestKind, now: Cycle) -> Cycle {
        let offset = req.slot * SLOT_BYTES;
        let size = req.size;
        let line = self.line_mut(req.set, now);
        if line.permission == AccessPermission::Invalid {
            line.permission = AccessPermission::ReadOnly;
        }
        let value = line.data[offset..offset + size].to_vec();
        req.set_response(&value);
        if matches!(
            kind,
            RequestKind::LockedVertexReadLocal | RequestKind::LockedVertexReadRemote
        ) {
            self.spm.set_locked(req.set, req.context);
        }
        self.spm.stats_mut().record_data_read();
        self.stats.loads += 1;
        self.spm.access_latency()
    }

    fn store(
        &mut self,
        req: &mut RequestDescriptor,
        kind: RequestKind,
        map: &AddressSpaceMap,
        counters: &mut ActiveVertexCounters,
        now: Cycle,
    ) -> Cycle {
        let atomic = req.is_atomic.then_some(req.atomic).flatten();
        let offset = req.slot * SLOT_BYTES;
        let line = self.line_mut(req.set, now);
        line.permission = AccessPermission::ReadWrite;
        let latency = match atomic {
            Some((opcode, operands)) => {
                let outcome = execute(opcode, &mut line.data, &operands, map.valid_byte_offset(), counters);
                if let Some(entry) = outcome.sparse_slot {
                    req.set_response(&entry.to_le_bytes());
                }
                self.spm.stats_mut().record_atomic();
                self.stats.atomics += 1;
                opcode.overhead()
            }
            None => {
                let size = req.size.min(line.data.len() - offset);
                line.data[offset..offset + size].copy_from_slice(&req.data[..size]);
                self.stats.stores += 1;
                self.spm.access_latency()
            }
        };
        if matches!(
            kind,
            RequestKind::LockedVertexWriteLocal | RequestKind::LockedVertexWriteRemote
        ) {
            self.spm.clear_locked(req.set);
        }
        self.spm.stats_mut().record_data_write();
        latency
    }

    fn check_active(&mut self, req: &mut RequestDescriptor, now: Cycle) -> Cycle {
        assert!(
            !req.sparse,
            "spm {}: sparse active-list access {:#x} reaches the scratchpad",
            self.spm.id(),
            req.vaddr
        );
        let offset = req.slot * SLOT_BYTES;
        let line = self.line_mut(req.set, now);
        if req.is_write() {
            if req.is_copy {
                let flag = line.data[offset];
                req.set_response(&[flag]);
            } else {
                line.data[offset] = 0;
                line.permission = AccessPermission::ReadWrite;
            }
        } else {
            let flag = line.data[offset];
            req.set_response(&[flag]);
        }
        self.stats.active_checks += 1;
        self.spm.access_latency()
    }

    // Wide reads pick up the flag byte of consecutive lines, zero where nothing is resident.
    fn gather_active(&mut self, req: &mut RequestDescriptor) {
        assert!(
            !req.sparse,
            "spm {}: sparse active-list access {:#x} reaches the scratchpad",
            self.spm.id(),
            req.vaddr
        );
        let offset = req.slot * SLOT_BYTES;
        let total = self.spm.total_sets() as u64;
        let flags: Vec<u8> = (0..req.size as u64)
            .map(|i| req.set + i)
            .map(|addr| {
                if addr >= total {
                    return 0;
                }
                self.spm.lookup(addr).map_or(0, |line| line.data[offset])
            })
            .collect();
        req.set_response(&flags);
        self.stats.active_checks += 1;
    }
}
