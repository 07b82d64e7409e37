use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::timeq::Cycle;

#[derive(PartialEq, PartialOrd, Debug, Default, Clone, Copy)]
pub enum LogLevel {
    #[default]
    NONE,
    INFO,
    DEBUG,
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LogLevel::NONE => "NONE",
            LogLevel::INFO => "INFO",
            LogLevel::DEBUG => "DEBUG",
        };
        f.write_str(name)
    }
}

pub fn to_loglevel(ulevel: u64) -> LogLevel {
    match ulevel {
        1 => LogLevel::INFO,
        2 => LogLevel::DEBUG,
        _ => LogLevel::NONE,
    }
}

/// Simulation trace printer. Lines carry the cycle most recently passed to `set_cycle`.
#[derive(Debug, Default)]
pub struct Logger {
    level: LogLevel,
    cycle: AtomicU64,
}

impl Logger {
    pub fn new(ulevel: u64) -> Self {
        Logger {
            level: to_loglevel(ulevel),
            cycle: AtomicU64::new(0),
        }
    }

    pub fn silent() -> Self {
        Self::default()
    }

    pub fn level(&self) -> LogLevel {
        self.level
    }

    pub fn enabled(&self, level: LogLevel) -> bool {
        level != LogLevel::NONE && level <= self.level
    }

    pub fn set_cycle(&self, now: Cycle) {
        self.cycle.store(now, Ordering::Relaxed);
    }

    pub fn log(&self, level: LogLevel, args: fmt::Arguments<'_>) {
        if !self.enabled(level) {
            return;
        }
        println!("[{:>10}] [{}] {}", self.cycle.load(Ordering::Relaxed), level, args);
    }
}

#[macro_export]
macro_rules! log {
    // usage: log!(logger, level, "seq {} issued {:#x}", id, addr)
    ($logger:expr, $level:expr, $($arg:tt)+) => {{
        $logger.log($level, format_args!($($arg)+));
    }};
}
#[macro_export]
macro_rules! info {
    ($logger:expr, $($arg:tt)+) => ( $crate::log!($logger, $crate::sim::log::LogLevel::INFO, $($arg)+); )
}
#[macro_export]
macro_rules! debug {
    ($logger:expr, $($arg:tt)+) => ( $crate::log!($logger, $crate::sim::log::LogLevel::DEBUG, $($arg)+); )
}
