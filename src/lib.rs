pub mod sequencer;
pub mod sim;
pub mod spm;
pub mod timeq;
pub mod workload;

#[cfg(test)]
mod unit_tests;
