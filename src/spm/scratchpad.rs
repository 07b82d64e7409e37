use std::collections::HashMap;
use std::fmt::Write as _;

use anyhow::bail;
use serde::{Deserialize, Serialize};

use crate::sim::config::Config;
use crate::spm::policy::{FreqCollPolicy, ReplacementPolicy};
use crate::timeq::Cycle;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ScratchpadConfig {
    pub size_bytes: usize,
    pub assoc: usize,
    pub block_bytes: usize,
    /// Slack sets beyond the usable capacity, so chunked placement never runs off the end.
    pub max_chunk_size: usize,
    pub hash: char,
    pub data_latency: Cycle,
    pub tag_latency: Cycle,
}

impl Default for ScratchpadConfig {
    fn default() -> Self {
        let s = Self {
            size_bytes: 32 * 1024,
            assoc: 4,
            block_bytes: 64,
            max_chunk_size: 1024,
            hash: 'm',
            data_latency: 1,
            tag_latency: 1,
        };
        s.ensure_valid();
        s
    }
}

impl Config for ScratchpadConfig {}

impl ScratchpadConfig {
    pub fn ensure_valid(&self) {
        assert!(self.assoc > 0, "assoc must be > 0");
        assert!(self.block_bytes >= 48, "block_bytes must hold six element slots");
        assert!(
            self.size_bytes >= self.assoc * self.block_bytes,
            "size_bytes must hold at least one set"
        );
    }

    pub fn usable_sets(&self) -> usize {
        self.size_bytes / self.assoc / self.block_bytes
    }

    pub fn total_sets(&self) -> usize {
        self.usable_sets() + self.max_chunk_size
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HashType {
    Modulo,
    RotateXor,
    SimpleXor,
}

impl HashType {
    pub fn from_selector(selector: char) -> anyhow::Result<Self> {
        match selector {
            'm' => Ok(HashType::Modulo),
            'x' => Ok(HashType::RotateXor),
            'r' => Ok(HashType::SimpleXor),
            other => bail!("invalid type of hash function: {:?}", other),
        }
    }

    /// Set index for `addr`. The modulo hash is the identity: callers hand in a set index.
    pub fn apply(&self, addr: u64) -> u64 {
        match self {
            HashType::Modulo => addr,
            HashType::SimpleXor => {
                let mut addr = addr;
                let mut res = 0u64;
                for _ in 0..8 {
                    res ^= addr & 0xff;
                    addr >>= 8;
                }
                res
            }
            HashType::RotateXor => {
                let mut addr = addr;
                let mut res = 0u8;
                for _ in 0..8 {
                    res ^= (addr & 0xff) as u8;
                    addr >>= 8;
                    res = res.rotate_right(5);
                }
                res as u64
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AccessPermission {
    Invalid,
    ReadOnly,
    ReadWrite,
    NotPresent,
    Busy,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheLine {
    pub address: u64,
    pub permission: AccessPermission,
    pub data: Vec<u8>,
    locked: Option<usize>,
    set: usize,
    way: usize,
}

impl CacheLine {
    pub fn set(&self) -> usize {
        self.set
    }

    pub fn way(&self) -> usize {
        self.way
    }

    pub fn locked_by(&self) -> Option<usize> {
        self.locked
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum RecordKind {
    Load,
    Store,
}

/// One warmed-up line, as a host checkpoint/warmup recorder would see it.
#[derive(Debug, Clone, Serialize)]
pub struct ContentRecord {
    pub address: u64,
    pub kind: RecordKind,
    pub last_access: Cycle,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScratchpadImage {
    pub total_sets: usize,
    pub assoc: usize,
    pub block_bytes: usize,
    pub lines: Vec<CacheLine>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ScratchpadStats {
    pub atomic_executions: u64,
    pub demand_hits: u64,
    pub demand_misses: u64,
    pub demand_accesses: u64,
    pub data_array_reads: u64,
    pub data_array_writes: u64,
    pub tag_array_reads: u64,
    pub tag_array_writes: u64,
    pub evictions: u64,
}

impl ScratchpadStats {
    pub fn record_demand(&mut self, hit: bool) {
        self.demand_accesses = self.demand_accesses.saturating_add(1);
        if hit {
            self.demand_hits = self.demand_hits.saturating_add(1);
        } else {
            self.demand_misses = self.demand_misses.saturating_add(1);
        }
    }

    pub fn record_data_read(&mut self) {
        self.data_array_reads = self.data_array_reads.saturating_add(1);
    }

    pub fn record_data_write(&mut self) {
        self.data_array_writes = self.data_array_writes.saturating_add(1);
    }

    pub fn record_atomic(&mut self) {
        self.atomic_executions = self.atomic_executions.saturating_add(1);
    }
}

/// Set-associative, software-addressed line store. Lines are arena-indexed by (set, way);
/// `tag_index` maps a resident address straight to its way.
#[derive(Debug)]
pub struct Scratchpad {
    id: usize,
    num_cores: usize,
    config: ScratchpadConfig,
    hash: HashType,
    total_sets: usize,
    sets: Vec<Vec<Option<CacheLine>>>,
    tag_index: HashMap<u64, usize>,
    policy: Box<dyn ReplacementPolicy>,
    stats: ScratchpadStats,
}

impl Scratchpad {
    pub fn new(id: usize, num_cores: usize, config: &ScratchpadConfig) -> anyhow::Result<Self> {
        config.ensure_valid();
        let hash = HashType::from_selector(config.hash)?;
        let total_sets = config.total_sets();
        Ok(Self {
            id,
            num_cores,
            config: config.clone(),
            hash,
            total_sets,
            sets: vec![vec![None; config.assoc]; total_sets],
            tag_index: HashMap::new(),
            policy: Box::new(FreqCollPolicy::new(total_sets, config.assoc)),
            stats: ScratchpadStats::default(),
        })
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn assoc(&self) -> usize {
        self.config.assoc
    }

    pub fn block_bytes(&self) -> usize {
        self.config.block_bytes
    }

    pub fn total_sets(&self) -> usize {
        self.total_sets
    }

    /// Sets usable for element placement; the chunk slack is excluded.
    pub fn num_sets(&self) -> usize {
        self.total_sets - self.config.max_chunk_size
    }

    pub fn access_latency(&self) -> Cycle {
        self.config.tag_latency + self.config.data_latency
    }

    pub fn stats(&self) -> &ScratchpadStats {
        &self.stats
    }

    pub fn stats_mut(&mut self) -> &mut ScratchpadStats {
        &mut self.stats
    }

    pub fn address_to_set(&self, addr: u64) -> usize {
        let set = self.hash.apply(addr);
        assert!(
            set < self.total_sets as u64,
            "spm {}: address {:#x} maps to set {} beyond {} sets",
            self.id,
            addr,
            set,
            self.total_sets
        );
        set as usize
    }

    fn find_tag_in_set(&self, set: usize, addr: u64) -> Option<usize> {
        let way = *self.tag_index.get(&addr)?;
        match &self.sets[set][way] {
            Some(line) if line.address == addr && line.permission != AccessPermission::NotPresent => {
                Some(way)
            }
            _ => None,
        }
    }

    pub fn lookup(&self, addr: u64) -> Option<&CacheLine> {
        let set = self.address_to_set(addr);
        let way = self.find_tag_in_set(set, addr)?;
        self.sets[set][way].as_ref()
    }

    pub fn lookup_mut(&mut self, addr: u64) -> Option<&mut CacheLine> {
        let set = self.address_to_set(addr);
        let way = self.find_tag_in_set(set, addr)?;
        self.sets[set][way].as_mut()
    }

    /// Demand access: touches the replacement policy on a hit.
    pub fn try_access(&mut self, addr: u64, now: Cycle) -> Option<&mut CacheLine> {
        let set = self.address_to_set(addr);
        self.stats.tag_array_reads = self.stats.tag_array_reads.saturating_add(1);
        let found = self.find_tag_in_set(set, addr);
        self.stats.record_demand(found.is_some());
        let way = found?;
        self.policy.touch(set, way, now);
        self.sets[set][way].as_mut()
    }

    /// Like `try_access`, but only reports lines whose permission allows the access.
    pub fn test_access(&mut self, addr: u64, now: Cycle) -> bool {
        let set = self.address_to_set(addr);
        match self.find_tag_in_set(set, addr) {
            Some(way) => {
                self.policy.touch(set, way, now);
                self.sets[set][way]
                    .as_ref()
                    .is_some_and(|line| line.permission != AccessPermission::NotPresent)
            }
            None => false,
        }
    }

    pub fn is_present(&self, addr: u64) -> bool {
        let set = self.address_to_set(addr);
        self.find_tag_in_set(set, addr).is_some()
    }

    /// True if `addr` is resident or its set still has an empty/NotPresent way.
    pub fn available(&self, addr: u64) -> bool {
        let set = self.address_to_set(addr);
        self.sets[set].iter().any(|slot| match slot {
            None => true,
            Some(line) => line.address == addr || line.permission == AccessPermission::NotPresent,
        })
    }

    pub fn allocate(&mut self, addr: u64, now: Cycle) -> &mut CacheLine {
        assert!(!self.is_present(addr), "spm {}: {:#x} already allocated", self.id, addr);
        assert!(self.available(addr), "spm {}: no way available for {:#x}", self.id, addr);
        let set = self.address_to_set(addr);
        let Some(way) = self.sets[set]
            .iter()
            .position(|slot| slot.as_ref().map_or(true, |l| l.permission == AccessPermission::NotPresent))
        else {
            panic!("allocate didn't find an available entry for {:#x}", addr);
        };
        if let Some(stale) = &self.sets[set][way] {
            self.tag_index.remove(&stale.address);
        }
        self.sets[set][way] = Some(CacheLine {
            address: addr,
            permission: AccessPermission::Invalid,
            data: vec![0; self.config.block_bytes],
            locked: None,
            set,
            way,
        });
        self.tag_index.insert(addr, way);
        self.stats.tag_array_writes = self.stats.tag_array_writes.saturating_add(1);
        self.policy.reset_way(set, way);
        self.policy.touch(set, way, now);
        self.sets[set][way]
            .as_mut()
            .unwrap_or_else(|| unreachable!("line just allocated"))
    }

    pub fn deallocate(&mut self, addr: u64) {
        let set = self.address_to_set(addr);
        let Some(way) = self.find_tag_in_set(set, addr) else {
            panic!("spm {}: deallocate of absent address {:#x}", self.id, addr);
        };
        self.sets[set][way] = None;
        self.tag_index.remove(&addr);
    }

    pub fn is_victim_present(&mut self, addr: u64) -> bool {
        assert!(!self.available(addr), "spm {}: victim probe with free way for {:#x}", self.id, addr);
        let set = self.address_to_set(addr);
        self.policy.victim(set).is_some()
    }

    /// Address of the line the policy would evict to make room for `addr`.
    pub fn cache_probe(&mut self, addr: u64) -> Option<u64> {
        let set = self.address_to_set(addr);
        let way = self.policy.victim(set)?;
        self.sets[set][way].as_ref().map(|line| line.address)
    }

    pub fn set_locked(&mut self, addr: u64, context: usize) {
        let id = self.id;
        let line = self
            .lookup_mut(addr)
            .unwrap_or_else(|| panic!("spm {}: lock on absent address {:#x}", id, addr));
        line.locked = Some(context);
    }

    pub fn clear_locked(&mut self, addr: u64) {
        let id = self.id;
        let line = self
            .lookup_mut(addr)
            .unwrap_or_else(|| panic!("spm {}: unlock on absent address {:#x}", id, addr));
        line.locked = None;
    }

    pub fn is_locked(&self, addr: u64, context: usize) -> bool {
        let line = self
            .lookup(addr)
            .unwrap_or_else(|| panic!("spm {}: lock test on absent address {:#x}", self.id, addr));
        line.locked == Some(context)
    }

    /// Address held at flat index `set * assoc + way`, if the line is usable.
    pub fn address_at(&self, idx: usize) -> Option<u64> {
        let assoc = self.config.assoc;
        let line = self.sets.get(idx / assoc)?.get(idx % assoc)?.as_ref()?;
        match line.permission {
            AccessPermission::Invalid | AccessPermission::NotPresent => None,
            _ => Some(line.address),
        }
    }

    pub fn is_block_invalid(&self, addr: u64) -> bool {
        self.lookup(addr)
            .is_some_and(|line| line.permission == AccessPermission::Invalid)
    }

    pub fn is_block_not_busy(&self, addr: u64) -> bool {
        self.lookup(addr)
            .map_or(true, |line| line.permission != AccessPermission::Busy)
    }

    pub fn record_contents(&self) -> Vec<ContentRecord> {
        self.lines()
            .filter_map(|line| {
                let kind = match line.permission {
                    AccessPermission::ReadOnly => RecordKind::Load,
                    AccessPermission::ReadWrite => RecordKind::Store,
                    _ => return None,
                };
                Some(ContentRecord {
                    address: line.address,
                    kind,
                    last_access: self.policy.last_access(line.set, line.way),
                    data: line.data.clone(),
                })
            })
            .collect()
    }

    /// Largest prime not above the total set count.
    pub fn prime_version(&self) -> usize {
        (2..=self.total_sets)
            .rev()
            .find(|&n| (2..n).take_while(|d| d * d <= n).all(|d| n % d != 0))
            .unwrap_or(1)
    }

    pub fn hash_dest(&self, addr: u64) -> usize {
        (addr % self.num_cores as u64) as usize
    }

    pub fn max_num_accel(&self) -> usize {
        self.num_cores - 1
    }

    pub fn lines(&self) -> impl Iterator<Item = &CacheLine> {
        self.sets.iter().flatten().flatten()
    }

    pub fn dump(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "scratchpad {} dump", self.id);
        for (set, ways) in self.sets.iter().enumerate() {
            for (way, slot) in ways.iter().enumerate() {
                let Some(line) = slot else { continue };
                let _ = writeln!(
                    out,
                    "  set: {} way: {} addr: {:#x} perm: {:?} locked: {:?} data: {:02x?}",
                    set,
                    way,
                    line.address,
                    line.permission,
                    line.locked,
                    &line.data[..48.min(line.data.len())]
                );
            }
        }
        out
    }

    pub fn snapshot(&self) -> ScratchpadImage {
        ScratchpadImage {
            total_sets: self.total_sets,
            assoc: self.config.assoc,
            block_bytes: self.config.block_bytes,
            lines: self.lines().cloned().collect(),
        }
    }

    pub fn restore(&mut self, image: &ScratchpadImage) -> anyhow::Result<()> {
        if image.total_sets != self.total_sets
            || image.assoc != self.config.assoc
            || image.block_bytes != self.config.block_bytes
        {
            bail!(
                "spm {}: image geometry {}x{}x{} does not match {}x{}x{}",
                self.id,
                image.total_sets,
                image.assoc,
                image.block_bytes,
                self.total_sets,
                self.config.assoc,
                self.config.block_bytes
            );
        }
        self.sets.iter_mut().flatten().for_each(|slot| *slot = None);
        self.tag_index.clear();
        for line in &image.lines {
            if line.set >= self.total_sets || line.way >= self.config.assoc {
                bail!("spm {}: image line {:#x} out of bounds", self.id, line.address);
            }
            self.policy.reset_way(line.set, line.way);
            self.tag_index.insert(line.address, line.way);
            self.sets[line.set][line.way] = Some(line.clone());
        }
        Ok(())
    }
}
