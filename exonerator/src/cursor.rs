use log::{debug, warn};
use std::collections::BTreeMap;
use std::ffi::OsString;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CursorError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

pub type CursorResult<T> = Result<T, CursorError>;

/// Last seen modification time, in epoch millis, per imported source file.
///
/// Persisted as one `<millis>,<file>` line per entry.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ImportCursor {
    files: BTreeMap<String, i64>,
}

impl ImportCursor {
    /// Read the cursor left by the previous run.
    ///
    /// Never fails: a missing file yields an empty cursor, and an unreadable
    /// or corrupt one is discarded so that everything gets imported again.
    pub fn load(path: &Path) -> Self {
        let contents = match fs::read_to_string(path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("No import history at {:?}, importing all files", path);
                return Self::default();
            }
            Err(e) => {
                warn!("Could not read import history {:?}: {}. Importing all files", path, e);
                return Self::default();
            }
        };

        match Self::parse(&contents) {
            Some(cursor) => {
                debug!("Loaded import history with {} entries", cursor.files.len());
                cursor
            }
            None => {
                warn!("Import history {:?} is corrupt. Importing all files", path);
                Self::default()
            }
        }
    }

    fn parse(contents: &str) -> Option<Self> {
        let mut files = BTreeMap::new();
        for line in contents.lines().filter(|line| !line.trim().is_empty()) {
            let (millis, file) = line.split_once(',')?;
            let millis = millis.trim().parse::<i64>().ok()?;
            if file.is_empty() {
                return None;
            }
            files.insert(file.to_string(), millis);
        }
        Some(Self { files })
    }

    /// Whether `file` was imported and has not been modified since.
    pub fn is_current(&self, file: &str, modified_millis: i64) -> bool {
        self.files.get(file).is_some_and(|&seen| modified_millis <= seen)
    }

    pub fn record(&mut self, file: impl Into<String>, modified_millis: i64) {
        self.files.insert(file.into(), modified_millis);
    }

    /// Add all entries of `other`, which take precedence over existing ones.
    pub fn merge(&mut self, other: ImportCursor) {
        self.files.extend(other.files);
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    /// Write the cursor next to `path` and move it into place.
    pub fn save(&self, path: &Path) -> CursorResult<()> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }

        let contents = self.files.iter().map(|(file, millis)| format!("{},{}\n", millis, file)).collect::<String>();
        let tmp = tmp_path(path);
        fs::write(&tmp, contents)?;
        fs::rename(&tmp, path)?;

        debug!("Saved import history with {} entries to {:?}", self.files.len(), path);
        Ok(())
    }
}

fn tmp_path(path: &Path) -> PathBuf {
    let mut name = OsString::from(path.as_os_str());
    name.push(".tmp");
    PathBuf::from(name)
}
