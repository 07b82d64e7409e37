pub mod backing;
pub mod config;
pub mod log;
pub mod top;
