//! Utilities: leveled logging driven by the per-task `--verbose` flag.
//!
//! Key items:
//!   init_logging / derive_level
//!   log_debug! (protocol-step tracing when verbose)

use std::sync::OnceLock;
use std::sync::atomic::{AtomicU8, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

/// Logging helpers.
pub mod logging {
    use super::*;

    #[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd)]
    pub enum LogLevel {
        Info = 0,
        Debug = 1,
    }

    impl LogLevel {
        pub fn as_str(&self) -> &'static str {
            match self {
                LogLevel::Info => "INFO",
                LogLevel::Debug => "DEBUG",
            }
        }
    }

    static GLOBAL_LEVEL: OnceLock<AtomicU8> = OnceLock::new();

    fn inner_cell() -> &'static AtomicU8 {
        GLOBAL_LEVEL.get_or_init(|| AtomicU8::new(LogLevel::Info as u8))
    }

    pub fn init_logging(level: LogLevel) {
        inner_cell().store(level as u8, Ordering::Relaxed);
    }

    pub fn current_log_level() -> LogLevel {
        match inner_cell().load(Ordering::Relaxed) {
            0 => LogLevel::Info,
            _ => LogLevel::Debug,
        }
    }

    /// Map the per-task `--verbose` flag onto a level.
    pub fn derive_level(verbose: bool) -> LogLevel {
        if verbose {
            LogLevel::Debug
        } else {
            LogLevel::Info
        }
    }

    fn timestamp() -> u128 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis())
            .unwrap_or(0)
    }

    fn should_emit(level: LogLevel) -> bool {
        level <= current_log_level()
    }

    pub fn log(level: LogLevel, msg: impl AsRef<str>) {
        if should_emit(level) {
            eprintln!("[{}][{}] {}", level.as_str(), timestamp(), msg.as_ref());
        }
    }

    /// Diagnostic output; silent unless the task runs with `--verbose`.
    pub fn debug(msg: impl AsRef<str>) {
        log(LogLevel::Debug, msg);
    }

    #[macro_export]
    macro_rules! log_debug {
        ($($t:tt)*) => { $crate::utils::logging::debug(format!($($t)*)) };
    }
}

pub use logging::{derive_level, init_logging};
