use log::{LevelFilter, Log, Metadata, Record, SetLoggerError};
use std::env;

/// A minimal stderr logger. Level filtering happens through
/// `log::set_max_level`, so `enabled` has nothing left to decide.
struct ReclaimLogger;

impl Log for ReclaimLogger {
    fn enabled(&self, _metadata: &Metadata) -> bool {
        true
    }

    fn log(&self, record: &Record) {
        eprintln!("[{}] {}: {}", record.level(), record.target(), record.args());
    }

    fn flush(&self) {}
}

static LOGGER: ReclaimLogger = ReclaimLogger;

/// Install the logger, with the level taken from `RUST_LOG` (default
/// `info`).
pub fn init() -> Result<(), SetLoggerError> {
    let level = match env::var("RUST_LOG") {
        Ok(v) if v.eq_ignore_ascii_case("off") => LevelFilter::Off,
        Ok(v) if v.eq_ignore_ascii_case("error") => LevelFilter::Error,
        Ok(v) if v.eq_ignore_ascii_case("warn") => LevelFilter::Warn,
        Ok(v) if v.eq_ignore_ascii_case("debug") => LevelFilter::Debug,
        Ok(v) if v.eq_ignore_ascii_case("trace") => LevelFilter::Trace,
        _ => LevelFilter::Info,
    };
    log::set_max_level(level);
    log::set_logger(&LOGGER)
}
