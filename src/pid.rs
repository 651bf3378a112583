use log::{debug, warn};
use std::fs::{self, OpenOptions};
use std::io::{self, ErrorKind, Write};
use std::path::{Path, PathBuf};

use crate::error::PidError;

/// A pid file this process created. Removed on [`PidFile::remove`] or drop.
#[derive(Debug)]
pub struct PidFile {
    path: PathBuf,
    removed: bool,
}

impl PidFile {
    /// Writes the current process id to `path`. Fails if the file already exists.
    pub fn create(path: impl AsRef<Path>) -> Result<Self, PidError> {
        Self::create_with(path.as_ref(), |path| {
            OpenOptions::new().write(true).create_new(true).open(path)
        })
    }

    fn create_with<W, F>(path: &Path, open: F) -> Result<Self, PidError>
    where
        W: Write,
        F: FnOnce(&Path) -> io::Result<W>,
    {
        let mut out = match open(path) {
            Ok(out) => out,
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                return Err(PidError::AlreadyExists(path.to_path_buf()))
            }
            Err(source) => {
                return Err(PidError::Io {
                    path: path.to_path_buf(),
                    source,
                })
            }
        };

        // from here on a failure drops the guard, which deletes the half written file
        let pid = Self {
            path: path.to_path_buf(),
            removed: false,
        };
        writeln!(out, "{}", std::process::id())
            .and_then(|_| out.flush())
            .map_err(|source| PidError::Io {
                path: pid.path.clone(),
                source,
            })?;

        debug!("Wrote pid {} to {}", std::process::id(), pid.path.display());
        Ok(pid)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn remove(mut self) -> Result<(), PidError> {
        self.removed = true;
        fs::remove_file(&self.path).map_err(|source| PidError::Io {
            path: self.path.clone(),
            source,
        })
    }
}

impl Drop for PidFile {
    fn drop(&mut self) {
        if !self.removed {
            if let Err(e) = fs::remove_file(&self.path) {
                warn!("Unable to remove pid file {}: {}", self.path.display(), e);
            }
        }
    }
}
