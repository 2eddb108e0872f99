//! Recovery orchestration.
//!
//! Startup rebuilds in-memory state from disk in a fixed order: the
//! greatest snapshot first, then every WAL file covering LSNs past it.
//! Replay is idempotent — rows at or below the current LSN are skipped —
//! and gap-intolerant: a missing LSN aborts recovery, because the logs on
//! disk are the only source of truth.
//!
//! Run-crc checkpoints are verified on the way: recovery folds every
//! applied wal-class payload into the same rolling chain the WAL child
//! maintains, and compares at each `run_crc` row. A mismatch degrades the
//! reported status but does not stop replay; the operator decides.

use tracing::{info, warn};

use tidelog_core::{Lsn, Row, Scn, ShardId, TagClass, TagKind};

use crate::dir::LogDir;
use crate::error::{DurabilityError, Result};
use crate::format::run_crc_step;
use crate::reader::LogReader;

/// Where the recovery state machine stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryState {
    /// Nothing loaded yet
    Init,
    /// Replaying the snapshot
    LoadingSnap,
    /// Replaying WAL files
    LoadingWal,
    /// Replay finished; the node may go primary or follower
    Ready,
}

/// Health of the rolling-checksum verification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunCrcStatus {
    /// No checkpoint seen yet
    Unverified,
    /// Every checkpoint matched
    Ok,
    /// A checkpoint disagreed with the recomputed chain
    Mismatch {
        /// LSN of the failing checkpoint row
        at: Lsn,
    },
}

/// Counters from one recovery pass.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RecoveryStats {
    /// Rows applied from the snapshot
    pub snap_rows: u64,
    /// Rows applied from WAL files
    pub wal_rows: u64,
    /// Rows skipped by the idempotent replay guard
    pub skipped_rows: u64,
}

/// Consumer of recovered rows; implemented by the shard registry.
pub trait RowConsumer {
    /// Apply one durable row to in-memory state.
    fn recover_row(&mut self, row: &Row) -> std::result::Result<(), String>;
}

/// The recovery orchestrator.
pub struct Recovery {
    snap_dir: LogDir,
    wal_dir: LogDir,
    state: RecoveryState,
    lsn: Lsn,
    run_crc: u32,
    run_crc_status: RunCrcStatus,
    stats: RecoveryStats,
    snap_shard_scns: Vec<(ShardId, Scn)>,
}

impl Recovery {
    /// Build an orchestrator over the two log directories.
    pub fn new(snap_dir: LogDir, wal_dir: LogDir) -> Recovery {
        Recovery {
            snap_dir,
            wal_dir,
            state: RecoveryState::Init,
            lsn: Lsn::ZERO,
            run_crc: 0,
            run_crc_status: RunCrcStatus::Unverified,
            stats: RecoveryStats::default(),
            snap_shard_scns: Vec::new(),
        }
    }

    /// Take the exclusive locks on the log directories. Snapshots and
    /// WALs may share one directory; it is locked once.
    pub fn lock(&mut self) -> Result<()> {
        self.snap_dir.lock()?;
        if self.wal_dir.path() != self.snap_dir.path() {
            self.wal_dir.lock()?;
        }
        Ok(())
    }

    /// Current LSN: the last row applied.
    pub fn lsn(&self) -> Lsn {
        self.lsn
    }

    /// Rolling-checksum chain value after replay.
    pub fn run_crc(&self) -> u32 {
        self.run_crc
    }

    /// Checkpoint verification status.
    pub fn run_crc_status(&self) -> RunCrcStatus {
        self.run_crc_status
    }

    /// Replay counters.
    pub fn stats(&self) -> RecoveryStats {
        self.stats
    }

    /// State machine position.
    pub fn state(&self) -> RecoveryState {
        self.state
    }

    /// Per-shard SCNs recorded in the loaded snapshot preamble.
    pub fn snap_shard_scns(&self) -> &[(ShardId, Scn)] {
        &self.snap_shard_scns
    }

    /// Snapshot directory.
    pub fn snap_dir(&self) -> &LogDir {
        &self.snap_dir
    }

    /// WAL directory.
    pub fn wal_dir(&self) -> &LogDir {
        &self.wal_dir
    }

    /// Load the full local state: snapshot, then tail WAL files. Returns
    /// the LSN of the last applied row.
    pub fn load_full(&mut self, consumer: &mut dyn RowConsumer) -> Result<Lsn> {
        self.state = RecoveryState::LoadingSnap;
        self.recover_snap(consumer)?;
        self.state = RecoveryState::LoadingWal;
        self.recover_remaining_wals(consumer)?;
        self.state = RecoveryState::Ready;
        info!(
            lsn = self.lsn.0,
            snap_rows = self.stats.snap_rows,
            wal_rows = self.stats.wal_rows,
            skipped = self.stats.skipped_rows,
            "recovery complete"
        );
        Ok(self.lsn)
    }

    fn recover_snap(&mut self, consumer: &mut dyn RowConsumer) -> Result<()> {
        let Some(base) = self.snap_dir.greatest_lsn()? else {
            info!("no snapshot, starting from lsn 0");
            return Ok(());
        };

        let path = self.snap_dir.filename(base);
        info!(path = %path.display(), "loading snapshot");
        let mut reader = LogReader::open(&path)?;
        self.snap_shard_scns = reader.header().shard_scns.clone();
        if let Some(crc) = reader.header().run_crc {
            self.run_crc = crc;
        }

        let mut finalized = false;
        while let Some(row) = reader.read_row()? {
            if row.tag.kind_bits() == TagKind::SnapFinal as u16 {
                finalized = true;
            }
            if row.tag.is_dummy() {
                continue;
            }
            consumer.recover_row(&row).map_err(|reason| {
                DurabilityError::Apply {
                    lsn: row.lsn,
                    reason,
                }
            })?;
            self.stats.snap_rows += 1;
        }

        // a snapshot is all-or-nothing: without the closing rows it came
        // from a crashed writer that somehow got renamed into place
        if !finalized || !reader.eof_marker_seen() {
            return Err(DurabilityError::BadFileHeader {
                path: path.display().to_string(),
                reason: "snapshot is not finalized".into(),
            });
        }

        self.lsn = base;
        Ok(())
    }

    fn recover_remaining_wals(&mut self, consumer: &mut dyn RowConsumer) -> Result<()> {
        for base in self.wal_dir.files_covering(self.lsn)? {
            let path = self.wal_dir.filename(base);
            let mut reader = LogReader::open(&path)?;
            while let Some(row) = reader.read_row()? {
                self.recover_wal_row(&row, consumer)?;
            }
            if !reader.eof_marker_seen() {
                warn!(path = %path.display(), "wal file has no eof marker (unclean shutdown)");
            }
        }
        Ok(())
    }

    /// Apply one WAL row with the idempotence guard, gap check and
    /// run-crc accounting. Also used by the node when draining a replica
    /// stream into local state.
    pub fn recover_wal_row(
        &mut self,
        row: &Row,
        consumer: &mut dyn RowConsumer,
    ) -> Result<()> {
        if row.lsn <= self.lsn {
            self.stats.skipped_rows += 1;
            return Ok(());
        }
        if row.lsn != self.lsn.next() {
            return Err(DurabilityError::LsnGap {
                expected: self.lsn.next(),
                got: row.lsn,
            });
        }

        if row.tag.is_dummy() {
            self.lsn = row.lsn;
            return Ok(());
        }

        if row.tag.kind_bits() == TagKind::RunCrc as u16 {
            self.verify_run_crc(row);
        } else if row.tag.class() == Ok(TagClass::Wal) {
            self.run_crc = run_crc_step(self.run_crc, &row.data);
        }

        consumer
            .recover_row(row)
            .map_err(|reason| DurabilityError::Apply {
                lsn: row.lsn,
                reason,
            })?;
        self.stats.wal_rows += 1;
        self.lsn = row.lsn;
        Ok(())
    }

    fn verify_run_crc(&mut self, row: &Row) {
        if row.data.len() < 4 {
            warn!(lsn = row.lsn.0, "short run_crc payload");
            return;
        }
        let stored = u32::from_le_bytes(row.data[0..4].try_into().unwrap());
        if stored == self.run_crc {
            if self.run_crc_status == RunCrcStatus::Unverified {
                self.run_crc_status = RunCrcStatus::Ok;
            }
        } else {
            warn!(
                lsn = row.lsn.0,
                stored = format!("{:08x}", stored),
                computed = format!("{:08x}", self.run_crc),
                "run_crc checkpoint mismatch"
            );
            self.run_crc_status = RunCrcStatus::Mismatch { at: row.lsn };
        }
    }
}

/// Payload of a `run_crc` checkpoint row.
pub fn run_crc_payload(crc: u32) -> Vec<u8> {
    crc.to_le_bytes().to_vec()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::{encode_eof_marker, encode_row_with_marker, FileHeader, FileType, VERSION_12};
    use crate::snapshot::write_snapshot;
    use std::io::Write;
    use tempfile::tempdir;
    use tidelog_core::Tag;

    #[derive(Default)]
    struct Collector {
        rows: Vec<Row>,
    }

    impl RowConsumer for Collector {
        fn recover_row(&mut self, row: &Row) -> std::result::Result<(), String> {
            self.rows.push(row.clone());
            Ok(())
        }
    }

    fn wal_row(lsn: i64, payload: &[u8]) -> Row {
        let mut row = Row::new(Tag::wal(TagKind::WalData), ShardId(0), payload.to_vec());
        row.lsn = Lsn(lsn);
        row.scn = Scn(lsn);
        row
    }

    fn write_wal(dir: &LogDir, base: i64, rows: &[Row], with_eof: bool) {
        dir.ensure_exists().unwrap();
        let mut file = std::fs::File::create(dir.filename(Lsn(base))).unwrap();
        FileHeader::new(FileType::Xlog, vec![]).write_to(&mut file).unwrap();
        for row in rows {
            file.write_all(&encode_row_with_marker(row, VERSION_12)).unwrap();
        }
        if with_eof {
            file.write_all(&encode_eof_marker(VERSION_12)).unwrap();
        }
    }

    fn dirs(tmp: &std::path::Path) -> (LogDir, LogDir) {
        (
            LogDir::snap(tmp.join("snap")),
            LogDir::wal(tmp.join("wal")),
        )
    }

    #[test]
    fn empty_directories_recover_to_zero() {
        let tmp = tempdir().unwrap();
        let (snap, wal) = dirs(tmp.path());
        let mut recovery = Recovery::new(snap, wal);
        let mut sink = Collector::default();
        assert_eq!(recovery.load_full(&mut sink).unwrap(), Lsn::ZERO);
        assert!(sink.rows.is_empty());
        assert_eq!(recovery.state(), RecoveryState::Ready);
    }

    #[test]
    fn wal_only_replay() {
        let tmp = tempdir().unwrap();
        let (snap, wal) = dirs(tmp.path());
        write_wal(&wal, 1, &[wal_row(1, b"a"), wal_row(2, b"b"), wal_row(3, b"c")], true);

        let mut recovery = Recovery::new(snap, wal);
        let mut sink = Collector::default();
        assert_eq!(recovery.load_full(&mut sink).unwrap(), Lsn(3));
        assert_eq!(sink.rows.len(), 3);
        assert_eq!(recovery.stats().wal_rows, 3);
    }

    #[test]
    fn snapshot_plus_tail_wal() {
        let tmp = tempdir().unwrap();
        let (snap, wal) = dirs(tmp.path());

        // snapshot at lsn 2; wal file from lsn 1 covers 1..=4
        snap.ensure_exists().unwrap();
        let data = Row::new(Tag::snap(TagKind::SnapData), ShardId(0), b"state".to_vec());
        write_snapshot(&snap, Lsn(2), &[(ShardId(0), Scn(2))], 0, vec![data]).unwrap();
        write_wal(
            &wal,
            1,
            &[wal_row(1, b"old"), wal_row(2, b"old"), wal_row(3, b"new"), wal_row(4, b"new")],
            true,
        );

        let mut recovery = Recovery::new(snap, wal);
        let mut sink = Collector::default();
        assert_eq!(recovery.load_full(&mut sink).unwrap(), Lsn(4));

        // snap_initial + data + snap_final, then wal rows 3 and 4; rows
        // 1-2 skipped as already covered by the snapshot
        assert_eq!(recovery.stats().snap_rows, 3);
        assert_eq!(recovery.stats().wal_rows, 2);
        assert_eq!(recovery.stats().skipped_rows, 2);
        assert_eq!(recovery.snap_shard_scns(), &[(ShardId(0), Scn(2))]);
    }

    #[test]
    fn lsn_gap_aborts() {
        let tmp = tempdir().unwrap();
        let (snap, wal) = dirs(tmp.path());
        write_wal(&wal, 1, &[wal_row(1, b"a"), wal_row(3, b"c")], true);

        let mut recovery = Recovery::new(snap, wal);
        let mut sink = Collector::default();
        let err = recovery.load_full(&mut sink).unwrap_err();
        assert!(matches!(
            err,
            DurabilityError::LsnGap {
                expected: Lsn(2),
                got: Lsn(3)
            }
        ));
    }

    #[test]
    fn replay_is_idempotent() {
        let tmp = tempdir().unwrap();
        let (snap, wal) = dirs(tmp.path());
        let rows = [wal_row(1, b"a"), wal_row(2, b"b")];
        write_wal(&wal, 1, &rows, true);

        let mut recovery = Recovery::new(snap, wal);
        let mut sink = Collector::default();
        recovery.load_full(&mut sink).unwrap();
        let applied_once = sink.rows.len();

        // replaying the same rows again must be a no-op
        for row in &rows {
            recovery.recover_wal_row(row, &mut sink).unwrap();
        }
        assert_eq!(sink.rows.len(), applied_once);
        assert_eq!(recovery.stats().skipped_rows, 2);
        assert_eq!(recovery.lsn(), Lsn(2));
    }

    #[test]
    fn run_crc_checkpoint_matches() {
        let tmp = tempdir().unwrap();
        let (snap, wal) = dirs(tmp.path());

        let crc = run_crc_step(run_crc_step(0, b"a"), b"b");
        let mut checkpoint = Row::new(
            Tag::sys(TagKind::RunCrc),
            ShardId(0),
            run_crc_payload(crc),
        );
        checkpoint.lsn = Lsn(3);
        checkpoint.scn = Scn(3);
        write_wal(&wal, 1, &[wal_row(1, b"a"), wal_row(2, b"b"), checkpoint], true);

        let mut recovery = Recovery::new(snap, wal);
        let mut sink = Collector::default();
        recovery.load_full(&mut sink).unwrap();
        assert_eq!(recovery.run_crc_status(), RunCrcStatus::Ok);
    }

    #[test]
    fn run_crc_mismatch_degrades_but_continues() {
        let tmp = tempdir().unwrap();
        let (snap, wal) = dirs(tmp.path());

        let mut checkpoint = Row::new(
            Tag::sys(TagKind::RunCrc),
            ShardId(0),
            run_crc_payload(0xbad),
        );
        checkpoint.lsn = Lsn(2);
        checkpoint.scn = Scn(2);
        write_wal(&wal, 1, &[wal_row(1, b"a"), checkpoint, wal_row(3, b"after")], true);

        let mut recovery = Recovery::new(snap, wal);
        let mut sink = Collector::default();
        // mismatch does not abort; the row after it is still applied
        assert_eq!(recovery.load_full(&mut sink).unwrap(), Lsn(3));
        assert_eq!(
            recovery.run_crc_status(),
            RunCrcStatus::Mismatch { at: Lsn(2) }
        );
    }

    #[test]
    fn unfinalized_snapshot_is_rejected() {
        let tmp = tempdir().unwrap();
        let (snap, wal) = dirs(tmp.path());
        snap.ensure_exists().unwrap();

        // write a snapshot missing its final row and eof marker
        let mut file = std::fs::File::create(snap.filename(Lsn(5))).unwrap();
        FileHeader::new(FileType::Snap, vec![]).write_to(&mut file).unwrap();
        let initial = Row::dummy(Lsn(5), Scn::ZERO, Tag::snap(TagKind::SnapInitial));
        file.write_all(&encode_row_with_marker(&initial, VERSION_12)).unwrap();
        drop(file);

        let mut recovery = Recovery::new(snap, wal);
        let mut sink = Collector::default();
        assert!(recovery.load_full(&mut sink).is_err());
    }
}
