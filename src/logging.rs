//! Process logger: env_logger on stderr, plus a copy of info-and-above
//! records in a [`LogTail`] so error reports can carry recent history.

use anyhow::{Context, Result};
use chrono::Utc;
use log::{Level, LevelFilter, Log, Metadata, Record};
use safeguard::LogTail;

/// Logger that forwards to env_logger and tees into a [`LogTail`].
pub struct TeeLogger {
    inner: env_logger::Logger,
    tail: LogTail,
}

impl TeeLogger {
    /// Build a logger printing at `level` and capturing into `tail`.
    pub fn new(level: LevelFilter, tail: LogTail) -> Self {
        let inner = env_logger::Builder::new()
            .filter_level(level)
            .format_timestamp(None)
            .build();
        Self { inner, tail }
    }

    /// Most verbose level either half wants to see.
    fn max_level(&self) -> LevelFilter {
        self.inner.filter().max(LevelFilter::Info)
    }
}

impl Log for TeeLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        self.inner.enabled(metadata) || metadata.level() <= Level::Info
    }

    fn log(&self, record: &Record) {
        if self.inner.matches(record) {
            self.inner.log(record);
        }
        if record.level() <= Level::Info {
            self.tail.push_line(format!(
                "{} {:<5} {}: {}",
                Utc::now().format("%Y-%m-%dT%H:%M:%S%.3fZ"),
                record.level(),
                record.target(),
                record.args()
            ));
        }
    }

    fn flush(&self) {
        self.inner.flush();
    }
}

/// Install the process logger.
///
/// Verbosity maps 0/1/2/3+ to warn/info/debug/trace; `quiet` forces error.
pub fn init(verbose: u8, quiet: bool, tail: LogTail) -> Result<()> {
    let level = if quiet {
        LevelFilter::Error
    } else {
        match verbose {
            0 => LevelFilter::Warn,
            1 => LevelFilter::Info,
            2 => LevelFilter::Debug,
            _ => LevelFilter::Trace,
        }
    };

    let logger = TeeLogger::new(level, tail);
    let max = logger.max_level();
    log::set_boxed_logger(Box::new(logger)).context("Logger already installed")?;
    log::set_max_level(max);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn emit(logger: &TeeLogger, level: Level, msg: &str) {
        logger.log(
            &Record::builder()
                .level(level)
                .target("cloudsweep::test")
                .args(format_args!("{msg}"))
                .build(),
        );
    }

    #[test]
    fn test_tail_captures_info_even_when_quiet() {
        let tail = LogTail::new(10);
        let logger = TeeLogger::new(LevelFilter::Error, tail.clone());

        emit(&logger, Level::Info, "acquired lock on disk/disk-1");
        emit(&logger, Level::Debug, "polling");

        let lines = tail.recent(10);
        assert_eq!(lines.len(), 1);
        assert!(lines[0].contains("INFO"));
        assert!(lines[0].ends_with("cloudsweep::test: acquired lock on disk/disk-1"));
    }

    #[test]
    fn test_enabled_covers_both_halves() {
        let logger = TeeLogger::new(LevelFilter::Warn, LogTail::new(1));
        let info = Metadata::builder().level(Level::Info).build();
        let trace = Metadata::builder().level(Level::Trace).build();
        assert!(logger.enabled(&info));
        assert!(!logger.enabled(&trace));
        assert_eq!(logger.max_level(), LevelFilter::Info);

        let verbose = TeeLogger::new(LevelFilter::Trace, LogTail::new(1));
        assert_eq!(verbose.max_level(), LevelFilter::Trace);
    }
}
