use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use omega_spm::sequencer::SequencerConfig;
use omega_spm::sim::config::{Config, SimConfig};
use omega_spm::sim::log::Logger;
use omega_spm::sim::top::SpmSystem;
use omega_spm::spm::scratchpad::ScratchpadConfig;
use omega_spm::workload::{WorkloadConfig, WorkloadDriver};
use serde::Serialize;
use toml::Table;

#[derive(Parser)]
#[command(version, about)]
struct SpmArgs {
    #[arg(help = "Path to config.toml")]
    config_path: Option<PathBuf>,
    #[arg(long, help = "Override number of cores")]
    num_cores: Option<usize>,
    #[arg(long, help = "Enable log at level (0:none, 1:info, 2:debug)")]
    log: Option<u64>,
    #[arg(long, help = "Override workload seed")]
    seed: Option<u64>,
    #[arg(long, help = "Override workload kind (push|counter)")]
    workload: Option<String>,
}

#[derive(Serialize)]
struct RunReport<'a> {
    system: omega_spm::sim::top::SystemStats,
    workload: &'a omega_spm::workload::WorkloadReport,
}

pub fn main() -> anyhow::Result<()> {
    env_logger::init();

    let argv = SpmArgs::parse();
    let config_table: Table = match &argv.config_path {
        Some(path) => {
            let text = fs::read_to_string(path)
                .with_context(|| format!("failed to read config file {}", path.display()))?;
            toml::from_str(&text).context("cannot parse config toml")?
        }
        None => Table::new(),
    };
    let mut sim_config = SimConfig::from_section(config_table.get("sim"));
    let spm_config = ScratchpadConfig::from_section(config_table.get("scratchpad"));
    let mut seq_config = SequencerConfig::from_section(config_table.get("sequencer"));
    let mut workload_config = WorkloadConfig::from_section(config_table.get("workload"));

    // override toml configs with argv
    sim_config.log_level = argv.log.unwrap_or(sim_config.log_level);
    seq_config.num_cores = argv.num_cores.unwrap_or(seq_config.num_cores);
    workload_config.seed = argv.seed.unwrap_or(workload_config.seed);
    workload_config.kind = argv.workload.unwrap_or(workload_config.kind);

    let logger = Arc::new(Logger::new(sim_config.log_level));
    let mut system = SpmSystem::new(&seq_config, &spm_config, Arc::clone(&logger))?;
    let mut driver = WorkloadDriver::new(&workload_config, &system)?;
    let finished = system.run(&mut driver, sim_config.timeout)?;

    let report = RunReport {
        system: system.stats(),
        workload: driver.report(),
    };
    let json = serde_json::to_string_pretty(&report)?;
    println!("{}", json);
    if let Some(path) = &sim_config.stats_json {
        fs::write(path, &json).with_context(|| format!("failed to write {}", path.display()))?;
    }
    if let Some(path) = &sim_config.spm_dump {
        let images = serde_json::to_string(&system.snapshot())?;
        fs::write(path, images).with_context(|| format!("failed to write {}", path.display()))?;
        log::info!("scratchpad images written to {}", path.display());
    }
    if !finished {
        anyhow::bail!("workload did not finish within {} cycles", sim_config.timeout);
    }
    Ok(())
}
