use std::str::FromStr;

use anyhow::bail;
use serde::Deserialize;

use crate::sim::config::Config;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkloadKind {
    /// Graph push: every out-edge becomes an atomic update at its destination vertex.
    Push,
    /// Shared counter incremented by every core through LL/SC.
    Counter,
}

impl FromStr for WorkloadKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "push" => Ok(WorkloadKind::Push),
            "counter" | "llsc" => Ok(WorkloadKind::Counter),
            other => bail!("unsupported workload kind '{}' (expected push|counter)", other),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct WorkloadConfig {
    pub kind: String,
    pub vertices: u64,
    pub avg_degree: u64,
    pub opcode: char,
    pub seed: u64,
    pub sparse: bool,
    pub dedup: bool,
    pub iterations: u64,
    pub chunk_size: u64,
    pub vertex_base: u64,
    pub frontier_base: u64,
    pub counter_addr: u64,
    pub increments: u64,
}

impl Config for WorkloadConfig {}

impl Default for WorkloadConfig {
    fn default() -> Self {
        let s = Self {
            kind: "push".to_string(),
            vertices: 256,
            avg_degree: 4,
            opcode: 'd',
            seed: 0,
            sparse: false,
            dedup: false,
            iterations: 2,
            chunk_size: 16,
            vertex_base: 0x1000_0000,
            frontier_base: 0x2000_0000,
            counter_addr: 0x3000_0000,
            increments: 8,
        };
        s.ensure_valid();
        s
    }
}

impl WorkloadConfig {
    pub fn ensure_valid(&self) {
        assert!(self.vertices > 0, "vertices must be > 0");
        assert!(self.vertices <= u32::MAX as u64, "vertex ids must fit in 32 bits");
        assert!(self.chunk_size > 0, "chunk_size must be > 0");
        assert!(self.opcode.is_ascii(), "opcode must be a single ascii tag");
    }

    pub fn kind(&self) -> anyhow::Result<WorkloadKind> {
        self.kind.parse()
    }
}
