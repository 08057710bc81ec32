//! A simple [log] backend that emits colored, timestamped records.
//!
//! The library itself only uses the `log` facade macros; binaries call
//! [init] once to route records to the terminal.

use std::time;

use log::{Level, LevelFilter, Log, Metadata, Record, SetLoggerError};

/// Terminal logger for `log` records.
///
/// - [Level::Info], [Level::Debug], and [Level::Trace] records are printed to
///   `stdout`.
/// - [Level::Warn] and [Level::Error] records are printed to `stderr`.
///
/// Each line includes a local timestamp, the severity level, and the record's
/// target.
#[derive(Debug)]
pub struct Logger {
    level: LevelFilter,
}

impl Logger {
    /// Creates a logger that accepts records at or above `level`.
    pub const fn new(level: LevelFilter) -> Self {
        Self { level }
    }
}

/// Installs a [Logger] as the global `log` backend.
///
/// # Errors
///
/// Returns an error if a global logger has already been installed.
pub fn init(level: LevelFilter) -> Result<(), SetLoggerError> {
    log::set_boxed_logger(Box::new(Logger::new(level)))?;
    log::set_max_level(level);

    Ok(())
}

impl Log for Logger {
    fn enabled(&self, metadata: &Metadata<'_>) -> bool {
        metadata.level() <= self.level
    }

    fn log(&self, record: &Record<'_>) {
        if !self.enabled(record.metadata()) {
            return;
        }

        let timestamp = timestamp();
        let target = record.target();
        let msg = record.args();

        match record.level() {
            Level::Error => {
                eprintln!(
                    "[\x1b[1;37m{timestamp}\x1b[0m] \x1b[1;31mERROR\x1b[0m [\x1b[1;37m{target}\x1b[0m] {msg}"
                );
            }
            Level::Warn => {
                eprintln!(
                    "[\x1b[1;37m{timestamp}\x1b[0m] \x1b[1;33mWARN \x1b[0m [\x1b[1;37m{target}\x1b[0m] {msg}"
                );
            }
            Level::Info => {
                println!(
                    "[\x1b[1;37m{timestamp}\x1b[0m] \x1b[1;32mINFO \x1b[0m [\x1b[1;37m{target}\x1b[0m] {msg}"
                );
            }
            Level::Debug => {
                println!(
                    "[\x1b[1;37m{timestamp}\x1b[0m] \x1b[1;34mDEBUG\x1b[0m [\x1b[1;37m{target}\x1b[0m] {msg}"
                );
            }
            Level::Trace => {
                println!(
                    "[\x1b[1;37m{timestamp}\x1b[0m] \x1b[1;35mTRACE\x1b[0m [\x1b[1;37m{target}\x1b[0m] {msg}"
                );
            }
        }
    }

    fn flush(&self) {}
}

/// Formats the current local time as `YYYY-MM-DD HH:MM:SS`.
fn timestamp() -> String {
    let now = time::SystemTime::now()
        .duration_since(time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs();

    let time = now as libc::time_t;

    // SAFETY: `tm` is a plain C struct for which all-zero bytes is valid.
    let mut tm: libc::tm = unsafe { std::mem::zeroed() };

    // SAFETY: both pointers are valid for the duration of the call, and the
    // reentrant variant writes only into `tm`.
    let res = unsafe { libc::localtime_r(&time, &mut tm) };

    if res.is_null() {
        return "UNKNOWN".to_string();
    }

    format!(
        "{:04}-{:02}-{:02} {:02}:{:02}:{:02}",
        tm.tm_year + 1900,
        tm.tm_mon + 1,
        tm.tm_mday,
        tm.tm_hour,
        tm.tm_min,
        tm.tm_sec
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn logger_filters_by_level() {
        let logger = Logger::new(LevelFilter::Warn);

        let warn = Metadata::builder().level(Level::Warn).build();
        let debug = Metadata::builder().level(Level::Debug).build();

        assert!(logger.enabled(&warn));
        assert!(!logger.enabled(&debug));
    }

    #[test]
    fn timestamp_format() {
        let ts = timestamp();

        if ts != "UNKNOWN" {
            assert_eq!(ts.len(), 19);
            assert_eq!(&ts[4..5], "-");
            assert_eq!(&ts[10..11], " ");
        }
    }
}
