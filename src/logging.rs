//! Level-filtered logging: stderr for everything, syslog for WARN/ERROR
//! only. The active level is a config "live" key (`loglevel`), re-read
//! from `Config` on every log call so a `SETCONFIG:loglevel=...` command
//! takes effect without restarting.

use std::str::FromStr;
use std::sync::Arc;

use log::{Level, LevelFilter, Log, Metadata, Record};
use parking_lot::Mutex;

use crate::config::Config;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Trace,
    Info,
    Warn,
    Error,
}

impl FromStr for LogLevel {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "TRACE" => Ok(LogLevel::Trace),
            "INFO" => Ok(LogLevel::Info),
            "WARN" => Ok(LogLevel::Warn),
            "ERROR" => Ok(LogLevel::Error),
            _ => Err(()),
        }
    }
}

impl LogLevel {
    fn to_filter(self) -> LevelFilter {
        match self {
            LogLevel::Trace => LevelFilter::Trace,
            LogLevel::Info => LevelFilter::Info,
            LogLevel::Warn => LevelFilter::Warn,
            LogLevel::Error => LevelFilter::Error,
        }
    }
}

/// Fans log records out to stderr and, for `WARN`/`ERROR`, to syslog.
/// Installed once as the global `log` backend by `main`.
pub struct MammutLogger {
    config: Arc<Config>,
    syslog: Mutex<Option<syslog::Logger<syslog::LoggerBackend, String>>>,
}

impl MammutLogger {
    pub fn install(config: Arc<Config>) {
        let syslog_writer = syslog::unix(syslog::Facility::LOG_DAEMON).ok();
        let logger = MammutLogger {
            config,
            syslog: Mutex::new(syslog_writer),
        };
        log::set_max_level(LevelFilter::Trace);
        // `set_boxed_logger` may only be called once per process; tests that
        // construct a `MammutLogger` directly never install it globally.
        let _ = log::set_boxed_logger(Box::new(logger));
    }
}

impl Log for MammutLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= self.config.loglevel().to_filter()
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let module = record.target();
        let line = format!("[{module}] {}", record.args());
        eprintln!("{line}");

        if matches!(record.level(), Level::Warn | Level::Error) {
            if let Some(syslog) = self.syslog.lock().as_mut() {
                let _ = match record.level() {
                    Level::Warn => syslog.warning(&line),
                    Level::Error => syslog.err(&line),
                    _ => Ok(()),
                };
            }
        }
    }

    fn flush(&self) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_all_known_levels() {
        assert_eq!(LogLevel::from_str("trace"), Ok(LogLevel::Trace));
        assert_eq!(LogLevel::from_str("WARN"), Ok(LogLevel::Warn));
        assert!(LogLevel::from_str("bogus").is_err());
    }
}
