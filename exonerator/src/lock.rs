use chrono::{DateTime, TimeDelta, Utc};
use log::{debug, warn};
use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum LockError {
    #[error("another import holds {path:?} since {since}")]
    Held { path: PathBuf, since: DateTime<Utc> },

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

pub type LockResult<T> = Result<T, LockError>;

/// Marker file keeping import runs from overlapping.
///
/// The file holds the run's start time in epoch millis and is removed when
/// the lock is dropped.
#[derive(Debug)]
pub struct ImportLock {
    path: PathBuf,
}

impl ImportLock {
    pub fn acquire(path: &Path, stale_after: TimeDelta) -> LockResult<Self> {
        Self::acquire_at(path, stale_after, Utc::now())
    }

    /// Take the lock as of `now`, reclaiming a lock older than `stale_after`.
    pub fn acquire_at(path: &Path, stale_after: TimeDelta, now: DateTime<Utc>) -> LockResult<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }

        match Self::create(path, now) {
            Ok(lock) => return Ok(lock),
            Err(LockError::IoError(e)) if e.kind() == ErrorKind::AlreadyExists => {}
            Err(e) => return Err(e),
        }

        if let Some(since) = held_since(path)? {
            if now - since < stale_after {
                return Err(LockError::Held { path: path.to_path_buf(), since });
            }
            warn!("Reclaiming stale import lock {:?} held since {}", path, since);
            fs::remove_file(path)?;
        }

        match Self::create(path, now) {
            Err(LockError::IoError(e)) if e.kind() == ErrorKind::AlreadyExists => {
                Err(LockError::Held { path: path.to_path_buf(), since: now })
            }
            other => other,
        }
    }

    fn create(path: &Path, now: DateTime<Utc>) -> LockResult<Self> {
        let mut file = OpenOptions::new().write(true).create_new(true).open(path)?;
        file.write_all(now.timestamp_millis().to_string().as_bytes())?;
        debug!("Acquired import lock {:?}", path);
        Ok(Self { path: path.to_path_buf() })
    }
}

/// Start time of the run holding `path`, or `None` if the lock is gone.
///
/// A run that has created the file but not yet written to it is dated by the
/// file's modification time.
fn held_since(path: &Path) -> LockResult<Option<DateTime<Utc>>> {
    let contents = match fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    if let Some(since) = contents.trim().parse::<i64>().ok().and_then(DateTime::from_timestamp_millis) {
        return Ok(Some(since));
    }

    match fs::metadata(path).and_then(|metadata| metadata.modified()) {
        Ok(modified) => {
            debug!("Import lock {:?} has no readable start time, dating it by modification time", path);
            Ok(Some(DateTime::<Utc>::from(modified)))
        }
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

impl Drop for ImportLock {
    fn drop(&mut self) {
        match fs::remove_file(&self.path) {
            Ok(()) => debug!("Released import lock {:?}", self.path),
            Err(e) => warn!("Failed to remove import lock {:?}: {}", self.path, e),
        }
    }
}
