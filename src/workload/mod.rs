pub mod config;
pub mod driver;
pub mod graph;

pub use config::{WorkloadConfig, WorkloadKind};
pub use driver::{WorkloadDriver, WorkloadReport};
