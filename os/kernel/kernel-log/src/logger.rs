use log::{LevelFilter, Log, Metadata, Record, SetLoggerError};
use std::fmt::{self, Write};
use std::io::Write as _;
use std::sync::OnceLock;

static LOGGER: OnceLock<HostLogger> = OnceLock::new();

/// A [`Log`] implementation writing `[LEVEL] target: message` lines to stderr.
#[derive(Debug)]
pub struct HostLogger {
    max_level: LevelFilter,
}

impl HostLogger {
    #[must_use]
    pub const fn new(max_level: LevelFilter) -> Self {
        Self { max_level }
    }

    #[inline]
    #[must_use]
    pub const fn max_level(&self) -> LevelFilter {
        self.max_level
    }

    /// Installs this logger as the process-wide logger.
    ///
    /// # Errors
    /// If a logger is already installed.
    pub fn init(self) -> Result<(), SetLoggerError> {
        let max_level = self.max_level;
        let logger = LOGGER.get_or_init(|| self);
        log::set_logger(logger)?;
        log::set_max_level(max_level);
        Ok(())
    }

    /// Installs a trace-level logger unless one is already in place.
    pub fn try_init_for_tests() {
        let _ = Self::new(LevelFilter::Trace).init();
    }
}

impl Default for HostLogger {
    fn default() -> Self {
        Self::new(LevelFilter::Info)
    }
}

/// Formats `record` as one `[LEVEL] target: message` line.
///
/// # Errors
/// Whatever `out` reports.
pub fn write_record(out: &mut impl Write, record: &Record) -> fmt::Result {
    writeln!(out, "[{}] {}: {}", record.level(), record.target(), record.args())
}

impl Log for HostLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= self.max_level
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let mut line = String::new();
        if write_record(&mut line, record).is_ok() {
            let _ = std::io::stderr().lock().write_all(line.as_bytes());
        }
    }

    fn flush(&self) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use log::Level;

    #[test]
    fn formats_level_target_and_message() {
        let mut out = String::new();
        write_record(
            &mut out,
            &Record::builder()
                .level(Level::Warn)
                .target("kernel::scheduler")
                .args(format_args!("core {} idle", 2))
                .build(),
        )
        .unwrap();
        assert_eq!(out, "[WARN] kernel::scheduler: core 2 idle\n");
    }

    #[test]
    fn filters_by_level() {
        let logger = HostLogger::new(LevelFilter::Info);
        let debug = Metadata::builder().level(Level::Debug).build();
        let error = Metadata::builder().level(Level::Error).build();
        assert!(!logger.enabled(&debug));
        assert!(logger.enabled(&error));
    }

    #[test]
    fn repeated_test_init_is_harmless() {
        HostLogger::try_init_for_tests();
        HostLogger::try_init_for_tests();
        log::info!("still logging");
    }
}
