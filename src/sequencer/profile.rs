use std::fmt::Write as _;

use anyhow::{bail, ensure};
use serde::Serialize;

use crate::sequencer::request::RequestKind;
use crate::timeq::Cycle;

pub const NUM_PROFILES: usize = 10;
pub const NUM_PROFILE_RANGES: usize = 9;

/// How a completed access was served, for per-window accounting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum AccessClass {
    LdMemory,
    LdLockedRmw,
    LdSpmLocal,
    LdSpmRemote,
    LdReadOnlyBuffer,
    LdMmio,
    StMemory,
    StLockedRmw,
    StSpmLocal,
    StSpmRemote,
    StPiscLocal,
    StPiscRemote,
    StMmio,
    IFetch,
    LdActiveLocal,
    LdActiveRemote,
    StActiveLocal,
    StActiveRemote,
    Other,
}

impl AccessClass {
    pub const COUNT: usize = 19;

    pub const ALL: [AccessClass; Self::COUNT] = [
        AccessClass::LdMemory,
        AccessClass::LdLockedRmw,
        AccessClass::LdSpmLocal,
        AccessClass::LdSpmRemote,
        AccessClass::LdReadOnlyBuffer,
        AccessClass::LdMmio,
        AccessClass::StMemory,
        AccessClass::StLockedRmw,
        AccessClass::StSpmLocal,
        AccessClass::StSpmRemote,
        AccessClass::StPiscLocal,
        AccessClass::StPiscRemote,
        AccessClass::StMmio,
        AccessClass::IFetch,
        AccessClass::LdActiveLocal,
        AccessClass::LdActiveRemote,
        AccessClass::StActiveLocal,
        AccessClass::StActiveRemote,
        AccessClass::Other,
    ];

    pub fn of(kind: RequestKind, is_write: bool, atomic: bool) -> Self {
        use RequestKind::*;
        match kind {
            Ld | RmwRead => AccessClass::LdMemory,
            LockedRmwRead => AccessClass::LdLockedRmw,
            LdVertexLocal => AccessClass::LdSpmLocal,
            LdVertexRemote => AccessClass::LdSpmRemote,
            St | RmwWrite | LoadLinked | StoreConditional => AccessClass::StMemory,
            LockedRmwWrite => AccessClass::StLockedRmw,
            StVertexLocal if atomic => AccessClass::StPiscLocal,
            StVertexLocal => AccessClass::StSpmLocal,
            StVertexRemote if atomic => AccessClass::StPiscRemote,
            StVertexRemote => AccessClass::StSpmRemote,
            IFetch => AccessClass::IFetch,
            CheckActiveVertexLocal if is_write => AccessClass::StActiveLocal,
            CheckActiveVertexLocal => AccessClass::LdActiveLocal,
            CheckActiveVertexRemote if is_write => AccessClass::StActiveRemote,
            CheckActiveVertexRemote => AccessClass::LdActiveRemote,
            _ => AccessClass::Other,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            AccessClass::LdMemory => "LD_MEM",
            AccessClass::LdLockedRmw => "LD_LOCKED_RMW",
            AccessClass::LdSpmLocal => "LD_SPM_Local",
            AccessClass::LdSpmRemote => "LD_SPM_Remote",
            AccessClass::LdReadOnlyBuffer => "LD_RO_Buffer",
            AccessClass::LdMmio => "LD_MMIO",
            AccessClass::StMemory => "ST_MEM",
            AccessClass::StLockedRmw => "ST_LOCKED_RMW",
            AccessClass::StSpmLocal => "ST_SPM_Local",
            AccessClass::StSpmRemote => "ST_SPM_Remote",
            AccessClass::StPiscLocal => "ST_PISC_Local",
            AccessClass::StPiscRemote => "ST_PISC_Remote",
            AccessClass::StMmio => "ST_MMIO",
            AccessClass::IFetch => "IF",
            AccessClass::LdActiveLocal => "LD_Active_Local",
            AccessClass::LdActiveRemote => "LD_Active_Remote",
            AccessClass::StActiveLocal => "ST_Active_Local",
            AccessClass::StActiveRemote => "ST_Active_Remote",
            AccessClass::Other => "NULL",
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct AccessStats {
    pub count: u64,
    pub latency_sum: u64,
}

impl AccessStats {
    fn record(&mut self, latency: Cycle) {
        self.count = self.count.saturating_add(1);
        self.latency_sum = self.latency_sum.saturating_add(latency);
    }

    fn mean(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.latency_sum as f64 / self.count as f64
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct ProfileRange {
    pub start: u64,
    pub bytes: u64,
}

impl ProfileRange {
    fn contains(&self, addr: u64) -> bool {
        addr >= self.start && addr - self.start < self.bytes
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Profile {
    pub running: bool,
    pub start_cycle: Cycle,
    pub total_cycles: Cycle,
    pub start_count: u64,
    no_range: Vec<AccessStats>,
    per_range: Vec<Vec<AccessStats>>,
}

impl Default for Profile {
    fn default() -> Self {
        Self {
            running: false,
            start_cycle: 0,
            total_cycles: 0,
            start_count: 0,
            no_range: vec![AccessStats::default(); AccessClass::COUNT],
            per_range: vec![vec![AccessStats::default(); AccessClass::COUNT]; NUM_PROFILE_RANGES],
        }
    }
}

impl Profile {
    fn clear(&mut self) {
        *self = Profile {
            running: self.running,
            ..Profile::default()
        };
    }

    fn start(&mut self, now: Cycle) {
        self.running = true;
        self.start_cycle = now;
        self.start_count += 1;
    }

    fn stop(&mut self, now: Cycle) {
        self.running = false;
        self.total_cycles += now - self.start_cycle;
    }

    fn log_access(&mut self, ranges: &[ProfileRange], addr: u64, class: AccessClass, latency: Cycle) {
        let stats = match ranges.iter().position(|r| r.contains(addr)) {
            Some(range) => &mut self.per_range[range][class as usize],
            None => &mut self.no_range[class as usize],
        };
        stats.record(latency);
    }

    pub fn stats(&self, range: Option<usize>, class: AccessClass) -> AccessStats {
        match range {
            Some(r) => self.per_range[r][class as usize],
            None => self.no_range[class as usize],
        }
    }

    fn access_summary(&self) -> String {
        fn section(out: &mut String, label: &str, stats: &[AccessStats]) {
            let _ = writeln!(out, "  {}", label);
            for (class, s) in AccessClass::ALL.iter().zip(stats) {
                if s.count > 0 {
                    let _ = writeln!(
                        out,
                        "    {}: count {} latency {} mean {:.2}",
                        class.name(),
                        s.count,
                        s.latency_sum,
                        s.mean()
                    );
                }
            }
        }

        let mut out = String::new();
        section(&mut out, "no range", &self.no_range);
        for (i, stats) in self.per_range.iter().enumerate() {
            if stats.iter().any(|s| s.count > 0) {
                section(&mut out, &format!("range {}", i), stats);
            }
        }
        out
    }
}

/// Benchmark-controlled measurement windows over completed accesses.
#[derive(Debug, Clone, Serialize)]
pub struct ProfileSet {
    profiles: Vec<Profile>,
    ranges: [ProfileRange; NUM_PROFILE_RANGES],
}

impl Default for ProfileSet {
    fn default() -> Self {
        Self {
            profiles: vec![Profile::default(); NUM_PROFILES],
            ranges: [ProfileRange::default(); NUM_PROFILE_RANGES],
        }
    }
}

impl ProfileSet {
    fn checked(&mut self, index: u64, want_running: bool) -> anyhow::Result<&mut Profile> {
        ensure!((index as usize) < NUM_PROFILES, "profile index {} out of range", index);
        let profile = &mut self.profiles[index as usize];
        if profile.running != want_running {
            bail!(
                "profile {} is {}",
                index,
                if profile.running { "running" } else { "stopped" }
            );
        }
        Ok(profile)
    }

    pub fn clear(&mut self, index: u64) -> anyhow::Result<()> {
        self.checked(index, false)?.clear();
        Ok(())
    }

    pub fn start(&mut self, index: u64, now: Cycle) -> anyhow::Result<()> {
        self.checked(index, false)?.start(now);
        Ok(())
    }

    pub fn stop(&mut self, index: u64, now: Cycle) -> anyhow::Result<()> {
        self.checked(index, true)?.stop(now);
        Ok(())
    }

    pub fn dump(&mut self, index: u64) -> anyhow::Result<String> {
        let profile = self.checked(index, false)?;
        Ok(format!(
            "profile {}: {} cycles, {} starts\n{}",
            index,
            profile.total_cycles,
            profile.start_count,
            profile.access_summary()
        ))
    }

    pub fn set_range_start(&mut self, range: usize, start: u64) {
        self.ranges[range].start = start;
    }

    pub fn set_range_bytes(&mut self, range: usize, bytes: u64) {
        self.ranges[range].bytes = bytes;
    }

    pub fn log_access(&mut self, addr: u64, class: AccessClass, latency: Cycle) {
        let ranges = self.ranges;
        self.profiles
            .iter_mut()
            .filter(|p| p.running)
            .for_each(|p| p.log_access(&ranges, addr, class, latency));
    }

    pub fn profile(&self, index: usize) -> &Profile {
        &self.profiles[index]
    }
}

#[cfg(test)]
mod tests {
    use super::{AccessClass, ProfileSet};
    use crate::sequencer::request::RequestKind;

    #[test]
    fn windows_accumulate_only_while_running() {
        let mut set = ProfileSet::default();
        set.set_range_start(0, 0x1000);
        set.set_range_bytes(0, 0x100);
        set.log_access(0x1000, AccessClass::LdMemory, 4);
        set.start(2, 10).unwrap();
        set.log_access(0x1010, AccessClass::LdMemory, 4);
        set.log_access(0x1100, AccessClass::LdMemory, 6);
        set.stop(2, 25).unwrap();
        set.log_access(0x1010, AccessClass::LdMemory, 4);

        let p = set.profile(2);
        assert_eq!(15, p.total_cycles);
        assert_eq!(1, p.start_count);
        assert_eq!(1, p.stats(Some(0), AccessClass::LdMemory).count);
        assert_eq!(6, p.stats(None, AccessClass::LdMemory).latency_sum);
        assert!(set.dump(2).unwrap().contains("LD_MEM: count 1 latency 4"));
    }

    #[test]
    fn state_checks_reject_misuse() {
        let mut set = ProfileSet::default();
        assert!(set.stop(0, 1).is_err());
        assert!(set.start(10, 1).is_err());
        set.start(0, 1).unwrap();
        assert!(set.start(0, 2).is_err());
        assert!(set.clear(0).is_err());
        assert!(set.dump(0).is_err());
        set.stop(0, 3).unwrap();
        set.clear(0).unwrap();
        assert_eq!(0, set.profile(0).start_count);
    }

    #[test]
    fn atomic_stores_are_classed_separately() {
        assert_eq!(AccessClass::StPiscRemote, AccessClass::of(RequestKind::StVertexRemote, true, true));
        assert_eq!(AccessClass::StSpmRemote, AccessClass::of(RequestKind::StVertexRemote, true, false));
        assert_eq!(AccessClass::LdActiveLocal, AccessClass::of(RequestKind::CheckActiveVertexLocal, false, false));
    }
}
