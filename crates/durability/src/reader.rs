//! Log file reader.
//!
//! Pulls rows out of one snapshot or WAL file, validating markers and
//! checksums. Damage is classified by where it sits:
//!
//! - a missing eof marker, torn row, bad row marker or bad *header* CRC
//!   reads as end-of-log — indistinguishable from an unclean shutdown's
//!   torn tail, so the reader truncates to the last complete row;
//! - a bad *payload* CRC under a valid header means the log is damaged in
//!   the middle and is a hard error, preserving the no-gap guarantee.
//!
//! [`FollowReader`] keeps a reader alive at end-of-file, polling for
//! appended bytes and rotating to the successor file once the current one
//! closes with an eof marker.

use std::fs::File;
use std::io::{BufReader, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::time::Duration;

use byteorder::{ByteOrder, LittleEndian};
use tracing::{debug, warn};

use tidelog_core::row::{RowHeader, ROW_HEADER_SIZE, ROW_V11_HEADER_SIZE};
use tidelog_core::{CoreError, Lsn, Row};

use crate::dir::LogDir;
use crate::error::{DurabilityError, Result};
use crate::format::{markers_for, FileHeader, MarkerDesc, VERSION_11};

/// Sequential reader over one log file.
pub struct LogReader {
    file: BufReader<File>,
    path: PathBuf,
    header: FileHeader,
    markers: MarkerDesc,
    /// Starting LSN from the file name, when canonical.
    base_lsn: Option<Lsn>,
    /// Offset of the next unread marker.
    pos: u64,
    need_seek: bool,
    eof_seen: bool,
    last_lsn: Lsn,
    rows: u64,
}

impl LogReader {
    /// Open a log file and validate its preamble.
    pub fn open(path: impl Into<PathBuf>) -> Result<LogReader> {
        let path = path.into();
        let display = path.display().to_string();
        let file = File::open(&path)?;
        let mut file = BufReader::new(file);
        let header = FileHeader::read_from(&mut file, &display)?;
        let markers = markers_for(header.version);
        let pos = file.stream_position()?;

        let base_lsn = path
            .file_name()
            .and_then(|n| crate::format::parse_filename(&n.to_string_lossy(), header.filetype));

        Ok(LogReader {
            file,
            path,
            header,
            markers,
            base_lsn,
            pos,
            need_seek: false,
            eof_seen: false,
            last_lsn: base_lsn.map(|l| Lsn(l.0 - 1)).unwrap_or(Lsn::ZERO),
            rows: 0,
        })
    }

    /// Parsed file preamble.
    pub fn header(&self) -> &FileHeader {
        &self.header
    }

    /// Starting LSN from the file name.
    pub fn base_lsn(&self) -> Option<Lsn> {
        self.base_lsn
    }

    /// File path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// LSN of the last row read.
    pub fn last_lsn(&self) -> Lsn {
        self.last_lsn
    }

    /// Rows read so far.
    pub fn rows(&self) -> u64 {
        self.rows
    }

    /// True once the eof marker has been consumed.
    pub fn eof_marker_seen(&self) -> bool {
        self.eof_seen
    }

    fn read_up_to(&mut self, buf: &mut [u8]) -> Result<usize> {
        let mut filled = 0;
        while filled < buf.len() {
            let n = self.file.read(&mut buf[filled..])?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        Ok(filled)
    }

    /// Read the next row.
    ///
    /// Returns `Ok(None)` at the eof marker or a tolerated torn tail; the
    /// file position rewinds so a follow-mode retry can re-read a row that
    /// was only partially flushed when we looked.
    pub fn read_row(&mut self) -> Result<Option<Row>> {
        if self.eof_seen {
            return Ok(None);
        }
        if self.need_seek {
            self.file.seek(SeekFrom::Start(self.pos))?;
            self.need_seek = false;
        }

        // marker
        let mut marker_buf = vec![0u8; self.markers.row_len];
        let n = self.read_up_to(&mut marker_buf)?;
        if n == 0 {
            self.need_seek = true;
            return Ok(None);
        }
        if n >= self.markers.eof_len {
            let eof_val = LittleEndian::read_uint(&marker_buf[..self.markers.eof_len], self.markers.eof_len);
            if eof_val == self.markers.eof {
                self.eof_seen = true;
                self.pos += self.markers.eof_len as u64;
                self.need_seek = true;
                return Ok(None);
            }
        }
        if n < self.markers.row_len {
            debug!(path = %self.path.display(), "torn marker at end of log");
            self.need_seek = true;
            return Ok(None);
        }
        let marker_val = LittleEndian::read_uint(&marker_buf, self.markers.row_len);
        if marker_val != self.markers.row {
            warn!(
                path = %self.path.display(),
                offset = self.pos,
                "bad row marker, truncating to last complete row"
            );
            self.need_seek = true;
            return Ok(None);
        }

        // header
        let header_size = if self.header.version == VERSION_11 {
            ROW_V11_HEADER_SIZE
        } else {
            ROW_HEADER_SIZE
        };
        let mut header_buf = vec![0u8; header_size];
        if self.read_up_to(&mut header_buf)? < header_size {
            self.need_seek = true;
            return Ok(None);
        }
        let row_header = if self.header.version == VERSION_11 {
            RowHeader::decode_v11(&header_buf)
        } else {
            RowHeader::decode(&header_buf)
        };
        let row_header = match row_header {
            Ok(h) => h,
            Err(CoreError::HeaderCrcMismatch { .. }) => {
                warn!(
                    path = %self.path.display(),
                    offset = self.pos,
                    "header crc mismatch, treating as end of log"
                );
                self.need_seek = true;
                return Ok(None);
            }
            Err(e) => return Err(e.into()),
        };

        // payload
        let mut data = vec![0u8; row_header.len as usize];
        if self.read_up_to(&mut data)? < data.len() {
            self.need_seek = true;
            return Ok(None);
        }
        let row = Row::from_parts(row_header, data)?;

        self.pos = self.file.stream_position()?;
        self.last_lsn = row.lsn;
        self.rows += 1;
        Ok(Some(row))
    }

    /// Drain the rest of the file into a vector.
    pub fn read_all(&mut self) -> Result<Vec<Row>> {
        let mut rows = Vec::new();
        while let Some(row) = self.read_row()? {
            rows.push(row);
        }
        Ok(rows)
    }
}

/// Last LSN present on disk: the last readable row of the newest file.
///
/// Used before respawning a WAL writer to detect rows that were written
/// and synced but whose replies were lost with the child — continuing
/// past them would fork the log.
pub fn tail_lsn(dir: &LogDir) -> Result<Option<Lsn>> {
    let Some(base) = dir.greatest_lsn()? else {
        return Ok(None);
    };
    let mut reader = LogReader::open(dir.filename(base))?;
    let mut last = None;
    while let Some(row) = reader.read_row()? {
        last = Some(row.lsn);
    }
    Ok(last.or(Some(Lsn(base.0 - 1))))
}

/// Async pull over a growing WAL directory: waits for appended rows and
/// rotates across file boundaries.
pub struct FollowReader {
    dir: LogDir,
    current: LogReader,
    poll_interval: Duration,
}

impl FollowReader {
    /// Follow the directory starting at the file that contains
    /// `from_lsn` (or the oldest file when none does).
    pub fn open(dir: LogDir, from_lsn: Lsn) -> Result<FollowReader> {
        let base = dir
            .find_with_lsn(from_lsn)?
            .or(dir.scan()?.first().copied())
            .ok_or_else(|| DurabilityError::BadFileHeader {
                path: dir.path().display().to_string(),
                reason: "no log files to follow".into(),
            })?;
        let current = LogReader::open(dir.filename(base))?;
        Ok(FollowReader {
            dir,
            current,
            poll_interval: Duration::from_millis(20),
        })
    }

    /// The reader currently positioned.
    pub fn current(&self) -> &LogReader {
        &self.current
    }

    /// Next row, waiting for the log to grow if needed.
    pub async fn next_row(&mut self) -> Result<Row> {
        loop {
            if let Some(row) = self.current.read_row()? {
                return Ok(row);
            }
            if self.current.eof_marker_seen() {
                let next_base = self.current.last_lsn().next();
                let base = self.current.base_lsn().unwrap_or(Lsn::ZERO);
                if next_base > base {
                    let path = self.dir.filename(next_base);
                    if path.exists() {
                        debug!(path = %path.display(), "following into next log file");
                        self.current = LogReader::open(path)?;
                        continue;
                    }
                }
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }
}
