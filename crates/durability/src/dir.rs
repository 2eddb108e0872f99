//! Log directory management.
//!
//! A [`LogDir`] owns one directory of snapshot or WAL files named by their
//! zero-padded starting LSN. The directory invariant: the greatest
//! snapshot LSN never exceeds the greatest WAL LSN, and together the files
//! cover every LSN up to the current state with no gaps. An exclusive
//! `flock` on the directory keeps two processes from serving the same
//! data.

use std::fs::File;
use std::path::{Path, PathBuf};

use fs2::FileExt;
use tracing::debug;

use tidelog_core::Lsn;

use crate::error::{DurabilityError, Result};
use crate::format::{self, FileType, INPROGRESS_SUFFIX};

/// One directory of log files of a single type.
pub struct LogDir {
    path: PathBuf,
    filetype: FileType,
    lock: Option<File>,
}

impl LogDir {
    /// Snapshot directory.
    pub fn snap(path: impl Into<PathBuf>) -> LogDir {
        LogDir {
            path: path.into(),
            filetype: FileType::Snap,
            lock: None,
        }
    }

    /// WAL directory.
    pub fn wal(path: impl Into<PathBuf>) -> LogDir {
        LogDir {
            path: path.into(),
            filetype: FileType::Xlog,
            lock: None,
        }
    }

    /// Directory path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// File type served by this directory.
    pub fn filetype(&self) -> FileType {
        self.filetype
    }

    /// Create the directory if missing.
    pub fn ensure_exists(&self) -> Result<()> {
        std::fs::create_dir_all(&self.path)?;
        Ok(())
    }

    /// Take the exclusive directory lock for the life of this process.
    pub fn lock(&mut self) -> Result<()> {
        self.ensure_exists()?;
        let fd = File::open(&self.path)?;
        fd.try_lock_exclusive()
            .map_err(|_| DurabilityError::DirLocked(self.path.display().to_string()))?;
        debug!(dir = %self.path.display(), "locked");
        self.lock = Some(fd);
        Ok(())
    }

    /// Full path of the file starting at `lsn`.
    pub fn filename(&self, lsn: Lsn) -> PathBuf {
        self.path.join(format::filename(lsn, self.filetype))
    }

    /// Full path of the in-progress spelling of the same file.
    pub fn inprogress_filename(&self, lsn: Lsn) -> PathBuf {
        let mut name = format::filename(lsn, self.filetype);
        name.push_str(INPROGRESS_SUFFIX);
        self.path.join(name)
    }

    /// Starting LSNs of every finished file, ascending. In-progress files
    /// are invisible until renamed.
    pub fn scan(&self) -> Result<Vec<Lsn>> {
        let mut lsns = Vec::new();
        let entries = match std::fs::read_dir(&self.path) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(lsns),
            Err(e) => return Err(e.into()),
        };
        for entry in entries {
            let entry = entry?;
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if let Some(lsn) = format::parse_filename(&name, self.filetype) {
                lsns.push(lsn);
            }
        }
        lsns.sort();
        Ok(lsns)
    }

    /// Greatest starting LSN in the directory.
    pub fn greatest_lsn(&self) -> Result<Option<Lsn>> {
        Ok(self.scan()?.into_iter().next_back())
    }

    /// Starting LSN of the file that contains `lsn`: the greatest start
    /// at or below it.
    pub fn find_with_lsn(&self, lsn: Lsn) -> Result<Option<Lsn>> {
        Ok(self.scan()?.into_iter().filter(|&base| base <= lsn).last())
    }

    /// Files whose rows may cover `(after, ∞)`: the file containing
    /// `after + 1` and everything newer, ascending.
    pub fn files_covering(&self, after: Lsn) -> Result<Vec<Lsn>> {
        let all = self.scan()?;
        let Some(first) = all.iter().copied().filter(|&b| b <= after.next()).last() else {
            return Ok(all);
        };
        Ok(all.into_iter().filter(|&b| b >= first).collect())
    }

    /// Fsync the directory itself, pinning renames.
    pub fn sync(&self) -> Result<()> {
        File::open(&self.path)?.sync_all()?;
        Ok(())
    }

    /// Unlink files whose entire LSN range lies at or below `covered`
    /// (everything older than the file that contains `covered + 1`).
    /// Used after a snapshot makes the old tail redundant.
    pub fn prune_covered(&self, covered: Lsn) -> Result<Vec<Lsn>> {
        let keep = self.files_covering(covered)?;
        let first_kept = keep.first().copied();
        let mut pruned = Vec::new();
        for base in self.scan()? {
            if first_kept.map(|k| base < k).unwrap_or(false) {
                std::fs::remove_file(self.filename(base))?;
                debug!(lsn = base.0, "pruned log file");
                pruned.push(base);
            }
        }
        Ok(pruned)
    }
}
