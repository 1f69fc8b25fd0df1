//! Optional terminal logger for binaries embedding the engine.

use std::io::{self, Write};

use chrono::prelude::*;
use colored::*;
use log::{Level, Log, Metadata, Record, SetLoggerError};

struct Logger {
    level: Level,
}

impl Log for Logger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= self.level
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let line = format!(
            "{} {:<5} {:<8} {}",
            Local::now().to_rfc3339_opts(SecondsFormat::Millis, true),
            record.level(),
            record.target().cyan(),
            record.args()
        );
        let line = match record.level() {
            Level::Error => line.red(),
            Level::Warn => line.yellow(),
            Level::Info => line.normal(),
            Level::Debug => line.dimmed(),
            Level::Trace => line.white().dimmed(),
        };
        // A full stderr is not a reason to take the engine down.
        writeln!(io::stderr(), "{line}").ok();
    }

    fn flush(&self) {}
}

/// Install the logger at the given level.
pub fn init(level: Level) -> Result<(), SetLoggerError> {
    log::set_boxed_logger(Box::new(Logger { level }))?;
    log::set_max_level(level.to_level_filter());

    Ok(())
}

/// The level requested through the `RUST_LOG` environment variable, if any.
pub fn env_level() -> Option<Level> {
    std::env::var("RUST_LOG").ok()?.parse().ok()
}
