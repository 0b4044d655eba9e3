use crate::gmail::HistoryId;
use log::warn;
use snafu::prelude::*;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("Could not create status dir `{}': {}", path.to_string_lossy(), source))]
    CreateStatusDir { path: PathBuf, source: io::Error },

    #[snafu(display("Could not write watermark file `{}': {}", path.to_string_lossy(), source))]
    WriteWatermark { path: PathBuf, source: io::Error },
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

const HISTORY_ID_FILE: &str = "last_history_id";
const NOTMUCH_REV_FILE: &str = "last_notmuch_rev";

/// Durable synchronization watermarks, one decimal integer per file under
/// the status dir.
///
/// Values are only written after a run has fully reconciled the work they
/// summarize; an aborted run leaves the previous files untouched, so the
/// next run resumes from (or before) the last completed point and replays
/// idempotent work.
pub struct Watermarks {
    status_dir: PathBuf,
}

impl Watermarks {
    pub fn open(status_dir: impl Into<PathBuf>) -> Self {
        Self {
            status_dir: status_dir.into(),
        }
    }

    /// The highest fully reconciled Gmail history ID, if any run completed
    /// before.
    pub fn history_id(&self) -> Option<HistoryId> {
        self.read(HISTORY_ID_FILE)
    }

    pub fn set_history_id(&self, history_id: HistoryId) -> Result<()> {
        self.write(HISTORY_ID_FILE, history_id)
    }

    /// The notmuch database revision at the end of the last run.
    pub fn notmuch_revision(&self) -> Option<u64> {
        self.read(NOTMUCH_REV_FILE)
    }

    pub fn set_notmuch_revision(&self, revision: u64) -> Result<()> {
        self.write(NOTMUCH_REV_FILE, revision)
    }

    fn read(&self, name: &str) -> Option<u64> {
        let path = self.status_dir.join(name);
        let contents = match fs::read_to_string(&path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return None,
            Err(e) => {
                warn!("Could not read `{}': {}", path.to_string_lossy(), e);
                return None;
            }
        };
        match contents.trim().parse() {
            Ok(value) => Some(value),
            Err(_) => {
                warn!(
                    "Ignoring garbage in watermark file `{}'",
                    path.to_string_lossy()
                );
                None
            }
        }
    }

    fn write(&self, name: &str, value: u64) -> Result<()> {
        create_private_dir(&self.status_dir).context(CreateStatusDirSnafu {
            path: &self.status_dir,
        })?;
        let path = self.status_dir.join(name);
        // Write-then-rename so a crash cannot leave a half-written value.
        let tmp_path = self.status_dir.join(format!("{}.tmp", name));
        fs::write(&tmp_path, format!("{}\n", value))
            .context(WriteWatermarkSnafu { path: &tmp_path })?;
        fs::rename(&tmp_path, &path).context(WriteWatermarkSnafu { path: &path })?;
        Ok(())
    }
}

/// Create a directory (and its parents) readable by the owner only.
pub fn create_private_dir(path: &Path) -> io::Result<()> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::DirBuilderExt;
        let mut builder = fs::DirBuilder::new();
        builder.recursive(true).mode(0o700);
        builder.create(path)
    }
    #[cfg(not(unix))]
    fs::create_dir_all(path)
}
