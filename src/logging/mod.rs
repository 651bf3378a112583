//! Logging configured from the `logging` settings section.
//!
//! One forwarding logger is installed for the life of the process; calling [`configure`]
//! again swaps its filter and appenders.

mod appender;
mod pattern;

use env_logger::filter::{Builder as FilterBuilder, Filter};
use log::{LevelFilter, Log, Metadata, Record};
use parking_lot::RwLock;
use std::sync::OnceLock;

use crate::error::LoggingError;
use crate::settings::LoggingSettings;

pub use appender::{Append, ConsoleAppender, FileAppender, Rollover};
pub use pattern::Pattern;

struct Active {
    filter: Filter,
    appenders: Vec<Box<dyn Append>>,
}

struct CroquetLogger {
    active: RwLock<Option<Active>>,
}

impl Log for CroquetLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        self.active
            .read()
            .as_ref()
            .is_some_and(|active| active.filter.enabled(metadata))
    }

    fn log(&self, record: &Record) {
        let active = self.active.read();
        if let Some(active) = active.as_ref() {
            if active.filter.matches(record) {
                for appender in &active.appenders {
                    appender.append(record);
                }
            }
        }
    }

    fn flush(&self) {
        if let Some(active) = self.active.read().as_ref() {
            for appender in &active.appenders {
                appender.flush();
            }
        }
    }
}

fn logger() -> &'static CroquetLogger {
    static LOGGER: OnceLock<CroquetLogger> = OnceLock::new();
    LOGGER.get_or_init(|| CroquetLogger {
        active: RwLock::new(None),
    })
}

/// Root level plus per-module overrides.
pub fn build_filter(settings: &LoggingSettings) -> Filter {
    let mut builder = FilterBuilder::new();
    builder.filter_level(settings.level.into());
    for (module, level) in &settings.loggers {
        builder.filter_module(module, (*level).into());
    }
    builder.build()
}

fn build_active(settings: &LoggingSettings) -> Result<Active, LoggingError> {
    let filter = build_filter(settings);

    let mut appenders: Vec<Box<dyn Append>> = Vec::new();
    if settings.console.enabled {
        appenders.push(Box::new(ConsoleAppender::new(
            settings.console.threshold.into(),
            Pattern::parse(&settings.console.format),
        )));
    }
    if settings.file.enabled {
        if let Some(path) = &settings.file.current_log_filename {
            let rollover = settings.file.archive_pattern().map(|pattern| Rollover {
                pattern,
                keep: settings.file.archived_file_count,
            });
            appenders.push(Box::new(FileAppender::open(
                path,
                settings.file.threshold.into(),
                Pattern::parse(&settings.file.format),
                rollover,
            )?));
        }
    }

    Ok(Active { filter, appenders })
}

/// Applies `settings` to the process logger.
///
/// A file appender without a file name is skipped here; the builder rejects that
/// combination before anything starts.
pub fn configure(settings: &LoggingSettings) -> Result<(), LoggingError> {
    let active = build_active(settings)?;
    let max_level: LevelFilter = active.filter.filter();

    let logger = logger();
    *logger.active.write() = Some(active);

    // another logger may already own the process, e.g. in tests
    if log::set_logger(logger).is_ok() || is_installed() {
        log::set_max_level(max_level);
    }
    Ok(())
}

fn is_installed() -> bool {
    std::ptr::eq(
        log::logger() as *const dyn Log as *const (),
        logger() as *const CroquetLogger as *const (),
    )
}
