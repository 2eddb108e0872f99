//! Snapshot writing.
//!
//! A snapshot is a full dump of state at one LSN: `snap_initial`, the
//! caller's shard-header and data rows, `snap_final`, eof marker. It is
//! written under an `.inprogress` name and renamed into place only after
//! the final fsync, so a crashed snapshot attempt leaves nothing the
//! directory scan can see.
//!
//! The serving process does not stall while dumping: [`fork_and_run`]
//! clones the process, the child walks the frozen in-memory indexes and
//! exits, and the parent keeps serving and polls for the result.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::PathBuf;

use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::{fork, ForkResult, Pid};
use tracing::{error, info};

use tidelog_core::{Lsn, Row, Scn, ShardId, Tag, TagKind};

use crate::dir::LogDir;
use crate::error::Result;
use crate::format::{encode_eof_marker, encode_row_with_marker, FileHeader, FileType, VERSION_12};

/// Write a complete snapshot at `lsn`.
///
/// `rows` supplies the shard-header and data rows in apply order, already
/// tagged; every row is stamped with the snapshot LSN. `run_crc` is the
/// rolling-checksum chain value at `lsn`, recorded in the preamble so
/// recovery can continue the chain once older WAL files are pruned.
pub fn write_snapshot(
    dir: &LogDir,
    lsn: Lsn,
    shard_scns: &[(ShardId, Scn)],
    run_crc: u32,
    rows: impl IntoIterator<Item = Row>,
) -> Result<PathBuf> {
    dir.ensure_exists()?;
    let tmp = dir.inprogress_filename(lsn);
    let final_path = dir.filename(lsn);

    let file = File::create(&tmp)?;
    let mut out = BufWriter::new(file);
    FileHeader::new(FileType::Snap, shard_scns.to_vec())
        .with_run_crc(run_crc)
        .write_to(&mut out)?;

    let mut count: u64 = 0;
    let initial = Row::dummy(lsn, Scn::ZERO, Tag::snap(TagKind::SnapInitial));
    out.write_all(&encode_row_with_marker(&initial, VERSION_12))?;

    for mut row in rows {
        row.lsn = lsn;
        out.write_all(&encode_row_with_marker(&row, VERSION_12))?;
        count += 1;
    }

    let fin = Row::dummy(lsn, Scn::ZERO, Tag::snap(TagKind::SnapFinal));
    out.write_all(&encode_row_with_marker(&fin, VERSION_12))?;
    out.write_all(&encode_eof_marker(VERSION_12))?;

    let file = out.into_inner().map_err(|e| e.into_error())?;
    file.sync_all()?;
    drop(file);
    std::fs::rename(&tmp, &final_path)?;
    dir.sync()?;

    info!(lsn = lsn.0, rows = count, path = %final_path.display(), "snapshot written");
    Ok(final_path)
}

/// Fork the process and run `f` in the child; the parent returns the
/// child pid immediately and keeps serving.
pub fn fork_and_run<F: FnOnce() -> Result<()>>(f: F) -> Result<Pid> {
    match unsafe { fork() }.map_err(std::io::Error::from)? {
        ForkResult::Child => {
            let code = match f() {
                Ok(()) => 0,
                Err(e) => {
                    error!(error = %e, "snapshot child failed");
                    1
                }
            };
            unsafe { nix::libc::_exit(code) }
        }
        ForkResult::Parent { child } => Ok(child),
    }
}

/// Non-blocking poll for a snapshot child. `Some(true)` on clean exit,
/// `Some(false)` on failure, `None` while still running.
pub fn child_done(pid: Pid) -> Option<bool> {
    match waitpid(pid, Some(WaitPidFlag::WNOHANG)) {
        Ok(WaitStatus::StillAlive) => None,
        Ok(WaitStatus::Exited(_, 0)) => Some(true),
        Ok(_) => Some(false),
        Err(_) => Some(false),
    }
}
