use chrono::{Local, NaiveDate};
use log::{LevelFilter, Record};
use parking_lot::Mutex;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use crate::error::LoggingError;
use crate::logging::pattern::Pattern;

pub trait Append: Send + Sync {
    fn append(&self, record: &Record);

    fn flush(&self) {}
}

pub struct ConsoleAppender {
    threshold: LevelFilter,
    pattern: Pattern,
}

impl ConsoleAppender {
    pub fn new(threshold: LevelFilter, pattern: Pattern) -> Self {
        Self { threshold, pattern }
    }
}

impl Append for ConsoleAppender {
    fn append(&self, record: &Record) {
        if record.level() > self.threshold {
            return;
        }
        let line = self.pattern.format(record);
        let _ = io::stdout().lock().write_all(line.as_bytes());
    }

    fn flush(&self) {
        let _ = io::stdout().flush();
    }
}

/// Daily rollover: yesterday's file is renamed using `pattern` and old ones are pruned.
#[derive(Debug, Clone)]
pub struct Rollover {
    pub pattern: String,
    pub keep: usize,
}

impl Rollover {
    fn archive_path(&self, day: NaiveDate) -> PathBuf {
        PathBuf::from(
            self.pattern
                .replace("%d", &day.format("%Y-%m-%d").to_string()),
        )
    }

    /// Deletes archives beyond the newest `keep`.
    fn prune(&self) -> io::Result<()> {
        let (prefix, suffix) = match self.pattern.split_once("%d") {
            Some(parts) => parts,
            None => return Ok(()),
        };
        let prefix_path = Path::new(prefix);
        let dir = match prefix_path.parent() {
            Some(dir) if !dir.as_os_str().is_empty() => dir.to_path_buf(),
            _ => PathBuf::from("."),
        };
        let name_prefix = prefix_path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        // a prefix ending in a separator has no file name part
        let name_prefix = if prefix.ends_with('/') {
            String::new()
        } else {
            name_prefix
        };

        let mut archives = fs::read_dir(&dir)?
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.file_name().to_string_lossy().to_string())
            .filter(|name| {
                name.len() > name_prefix.len() + suffix.len()
                    && name.starts_with(&name_prefix)
                    && name.ends_with(suffix)
            })
            .collect::<Vec<_>>();
        archives.sort();

        let excess = archives.len().saturating_sub(self.keep);
        for name in archives.into_iter().take(excess) {
            fs::remove_file(dir.join(name))?;
        }
        Ok(())
    }
}

struct OpenFile {
    file: File,
    opened_on: NaiveDate,
}

pub struct FileAppender {
    threshold: LevelFilter,
    pattern: Pattern,
    path: PathBuf,
    rollover: Option<Rollover>,
    state: Mutex<OpenFile>,
}

impl FileAppender {
    pub fn open(
        path: impl Into<PathBuf>,
        threshold: LevelFilter,
        pattern: Pattern,
        rollover: Option<Rollover>,
    ) -> Result<Self, LoggingError> {
        let path = path.into();
        let file = open_append(&path)?;
        Ok(Self {
            threshold,
            pattern,
            path,
            rollover,
            state: Mutex::new(OpenFile {
                file,
                opened_on: Local::now().date_naive(),
            }),
        })
    }

    fn roll(&self, state: &mut OpenFile, rollover: &Rollover, today: NaiveDate) -> io::Result<()> {
        state.file.flush()?;
        let archive = rollover.archive_path(state.opened_on);
        if let Some(parent) = archive.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        fs::rename(&self.path, &archive)?;
        state.file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        state.opened_on = today;
        rollover.prune()
    }
}

fn open_append(path: &Path) -> Result<File, LoggingError> {
    let open_error = |source| LoggingError::Open {
        path: path.to_path_buf(),
        source,
    };
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).map_err(open_error)?;
    }
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(open_error)
}

impl Append for FileAppender {
    fn append(&self, record: &Record) {
        if record.level() > self.threshold {
            return;
        }
        let line = self.pattern.format(record);
        let mut state = self.state.lock();

        if let Some(rollover) = &self.rollover {
            let today = Local::now().date_naive();
            if today != state.opened_on {
                if let Err(e) = self.roll(&mut state, rollover, today) {
                    eprintln!("Unable to roll log file {}: {}", self.path.display(), e);
                }
            }
        }
        let _ = state.file.write_all(line.as_bytes());
    }

    fn flush(&self) {
        let _ = self.state.lock().file.flush();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use log::Level;
    use tempfile::TempDir;

    fn record_line(appender: &FileAppender, level: Level, message: &str) {
        appender.append(
            &Record::builder()
                .level(level)
                .target("test")
                .args(format_args!("{}", message))
                .build(),
        );
    }

    #[test]
    fn test_threshold_filters_records() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("app.log");
        let appender =
            FileAppender::open(&path, LevelFilter::Info, Pattern::parse("%level %msg%n"), None)
                .unwrap();

        record_line(&appender, Level::Debug, "hidden");
        record_line(&appender, Level::Warn, "shown");
        appender.flush();

        assert_eq!(fs::read_to_string(&path).unwrap(), "WARN shown\n");
    }

    #[test]
    fn test_rolls_over_on_a_new_day_and_prunes() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("app.log");
        let pattern = format!("{}/app-%d.log", dir.path().display());
        for day in ["2020-01-01", "2020-01-02"] {
            fs::write(dir.path().join(format!("app-{}.log", day)), "old\n").unwrap();
        }

        let rollover = Rollover { pattern, keep: 2 };
        let appender = FileAppender::open(
            &path,
            LevelFilter::Trace,
            Pattern::parse("%msg%n"),
            Some(rollover),
        )
        .unwrap();

        let yesterday = Local::now().date_naive() - Duration::days(1);
        appender.state.lock().opened_on = yesterday;
        record_line(&appender, Level::Info, "before");
        appender.flush();

        let archived = dir
            .path()
            .join(format!("app-{}.log", yesterday.format("%Y-%m-%d")));
        assert!(archived.exists());
        assert!(!dir.path().join("app-2020-01-01.log").exists());
        assert!(dir.path().join("app-2020-01-02.log").exists());
        assert_eq!(fs::read_to_string(&path).unwrap(), "before\n");
    }
}
