//! Log file format: headers and markers.
//!
//! Every log file opens with a text preamble:
//!
//! ```text
//! XLOG\n            (or SNAP\n)
//! 0.12\n            (or 0.11)
//! Shard: 3:42\n     (zero or more, current scn per shard)
//! \n
//! ```
//!
//! Rows follow, each preceded by a per-version row marker; a shorter eof
//! marker closes a cleanly finished file. A file that ends without the
//! eof marker was cut by an unclean shutdown: readers tolerate it by
//! truncating to the last complete row.

use std::io::{BufRead, Write};

use byteorder::{ByteOrder, LittleEndian};

use tidelog_core::{Lsn, Row, Scn, ShardId};

use crate::error::{DurabilityError, Result};

/// Kind of log file, by content.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileType {
    /// Full state dump at one LSN
    Snap,
    /// WAL tail
    Xlog,
}

impl FileType {
    /// Magic line at the top of the file.
    pub fn magic(self) -> &'static str {
        match self {
            FileType::Snap => "SNAP",
            FileType::Xlog => "XLOG",
        }
    }

    /// Filename suffix.
    pub fn suffix(self) -> &'static str {
        match self {
            FileType::Snap => "snap",
            FileType::Xlog => "xlog",
        }
    }
}

/// Suffix carried by files still being written.
pub const INPROGRESS_SUFFIX: &str = ".inprogress";

/// Current format version.
pub const VERSION_12: u32 = 12;

/// Legacy format version, upconverted on read.
pub const VERSION_11: u32 = 11;

/// Per-version row and eof markers.
#[derive(Debug, Clone, Copy)]
pub struct MarkerDesc {
    /// Value preceding every row
    pub row: u64,
    /// Bytes of the row marker on disk
    pub row_len: usize,
    /// Value closing a finished file
    pub eof: u64,
    /// Bytes of the eof marker on disk
    pub eof_len: usize,
}

/// The 32-bit row marker word, `0xba0babed`. Legacy v11 files frame rows
/// with it directly; v12 widens it to 64 bits by duplicating the word.
pub const ROW_MARKER_WORD: u64 = 0xba0b_abed;

/// The eof marker word, shared by both versions.
pub const EOF_MARKER_WORD: u64 = 0x10ad_ab1e;

/// Markers for v12 files: the row marker word widened to 64 bits by
/// duplication, 32-bit eof marker.
pub const MARKERS_V12: MarkerDesc = MarkerDesc {
    row: (ROW_MARKER_WORD << 32) | ROW_MARKER_WORD,
    row_len: 8,
    eof: EOF_MARKER_WORD,
    eof_len: 4,
};

/// Markers for legacy v11 files: the bare 32-bit words.
pub const MARKERS_V11: MarkerDesc = MarkerDesc {
    row: ROW_MARKER_WORD,
    row_len: 4,
    eof: EOF_MARKER_WORD,
    eof_len: 4,
};

/// Markers for a format version.
pub fn markers_for(version: u32) -> MarkerDesc {
    match version {
        VERSION_11 => MARKERS_V11,
        _ => MARKERS_V12,
    }
}

/// Parsed log file preamble.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileHeader {
    /// Snapshot or WAL
    pub filetype: FileType,
    /// Format version (11 or 12)
    pub version: u32,
    /// Per-shard SCNs recorded at file creation
    pub shard_scns: Vec<(ShardId, Scn)>,
    /// Rolling-checksum chain value at file creation; snapshots record it
    /// so recovery can continue the chain without the pruned WAL tail
    pub run_crc: Option<u32>,
}

impl FileHeader {
    /// Build a current-version header.
    pub fn new(filetype: FileType, shard_scns: Vec<(ShardId, Scn)>) -> FileHeader {
        FileHeader {
            filetype,
            version: VERSION_12,
            shard_scns,
            run_crc: None,
        }
    }

    /// Record the rolling-checksum seed.
    pub fn with_run_crc(mut self, crc: u32) -> FileHeader {
        self.run_crc = Some(crc);
        self
    }

    /// Write the text preamble.
    pub fn write_to<W: Write>(&self, w: &mut W) -> std::io::Result<()> {
        let version = match self.version {
            VERSION_11 => "0.11",
            _ => "0.12",
        };
        write!(w, "{}\n{}\n", self.filetype.magic(), version)?;
        for (shard_id, scn) in &self.shard_scns {
            write!(w, "Shard: {}:{}\n", shard_id, scn)?;
        }
        if let Some(crc) = self.run_crc {
            write!(w, "RunCrc: {}\n", crc)?;
        }
        w.write_all(b"\n")
    }

    /// Read and validate the preamble from a buffered reader, leaving the
    /// position at the first row marker.
    pub fn read_from<R: BufRead>(r: &mut R, path: &str) -> Result<FileHeader> {
        let bad = |reason: &str| DurabilityError::BadFileHeader {
            path: path.to_string(),
            reason: reason.to_string(),
        };

        let mut line = String::new();
        r.read_line(&mut line)?;
        let filetype = match line.trim_end() {
            "SNAP" => FileType::Snap,
            "XLOG" => FileType::Xlog,
            _ => return Err(bad("unknown filetype magic")),
        };

        line.clear();
        r.read_line(&mut line)?;
        let version = match line.trim_end() {
            "0.11" => VERSION_11,
            "0.12" => VERSION_12,
            _ => return Err(bad("unsupported version")),
        };

        let mut shard_scns = Vec::new();
        let mut run_crc = None;
        loop {
            line.clear();
            let n = r.read_line(&mut line)?;
            if n == 0 {
                return Err(bad("preamble not terminated"));
            }
            let trimmed = line.trim_end();
            if trimmed.is_empty() {
                break;
            }
            if let Some(rest) = trimmed.strip_prefix("Shard: ") {
                let (id, scn) = rest
                    .split_once(':')
                    .ok_or_else(|| bad("malformed shard line"))?;
                let id: u16 = id.parse().map_err(|_| bad("malformed shard id"))?;
                let scn: i64 = scn.parse().map_err(|_| bad("malformed shard scn"))?;
                shard_scns.push((ShardId(id), Scn(scn)));
            } else if let Some(rest) = trimmed.strip_prefix("RunCrc: ") {
                run_crc = Some(rest.parse().map_err(|_| bad("malformed run crc"))?);
            }
            // unknown preamble keys are skipped for forward compatibility
        }

        Ok(FileHeader {
            filetype,
            version,
            shard_scns,
            run_crc,
        })
    }
}

/// Encode a row preceded by its marker.
pub fn encode_row_with_marker(row: &Row, version: u32) -> Vec<u8> {
    let markers = markers_for(version);
    let mut buf = vec![0u8; markers.row_len + row.encoded_len()];
    LittleEndian::write_uint(&mut buf[..markers.row_len], markers.row, markers.row_len);
    row.encode_into(&mut buf[markers.row_len..]);
    buf
}

/// Encode the eof marker for a version.
pub fn encode_eof_marker(version: u32) -> Vec<u8> {
    let markers = markers_for(version);
    let mut buf = vec![0u8; markers.eof_len];
    LittleEndian::write_uint(&mut buf, markers.eof, markers.eof_len);
    buf
}

/// Fold one applied payload into the rolling run-crc chain.
///
/// The chain hashes the previous value together with the payload, so both
/// the WAL child and recovery arrive at the same value after the same row
/// sequence regardless of batch boundaries.
pub fn run_crc_step(crc: u32, data: &[u8]) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&crc.to_le_bytes());
    hasher.update(data);
    hasher.finalize()
}

/// Canonical log file name: zero-padded starting LSN plus suffix.
pub fn filename(lsn: Lsn, filetype: FileType) -> String {
    format!("{:020}.{}", lsn.0, filetype.suffix())
}

/// Parse a log file name back into its starting LSN.
pub fn parse_filename(name: &str, filetype: FileType) -> Option<Lsn> {
    let base = name.strip_suffix(&format!(".{}", filetype.suffix()))?;
    if base.len() != 20 {
        return None;
    }
    base.parse::<i64>().ok().map(Lsn)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{BufReader, Cursor};
    use tidelog_core::{Tag, TagKind};

    #[test]
    fn header_roundtrip() {
        let header = FileHeader::new(
            FileType::Xlog,
            vec![(ShardId(0), Scn(5)), (ShardId(3), Scn(42))],
        );
        let mut bytes = Vec::new();
        header.write_to(&mut bytes).unwrap();

        let mut reader = BufReader::new(Cursor::new(bytes));
        let parsed = FileHeader::read_from(&mut reader, "test").unwrap();
        assert_eq!(parsed, header);
    }

    #[test]
    fn header_without_shard_lines() {
        let mut bytes = Vec::new();
        FileHeader::new(FileType::Snap, vec![])
            .write_to(&mut bytes)
            .unwrap();
        assert_eq!(bytes, b"SNAP\n0.12\n\n");

        let mut reader = BufReader::new(Cursor::new(bytes));
        let parsed = FileHeader::read_from(&mut reader, "test").unwrap();
        assert_eq!(parsed.filetype, FileType::Snap);
        assert!(parsed.shard_scns.is_empty());
    }

    #[test]
    fn header_records_run_crc() {
        let header = FileHeader::new(FileType::Snap, vec![(ShardId(0), Scn(9))])
            .with_run_crc(0x1234_5678);
        let mut bytes = Vec::new();
        header.write_to(&mut bytes).unwrap();

        let mut reader = BufReader::new(Cursor::new(bytes));
        let parsed = FileHeader::read_from(&mut reader, "test").unwrap();
        assert_eq!(parsed.run_crc, Some(0x1234_5678));
        assert_eq!(parsed, header);
    }

    #[test]
    fn header_rejects_garbage() {
        let mut reader = BufReader::new(Cursor::new(b"BLOB\n0.12\n\n".to_vec()));
        assert!(matches!(
            FileHeader::read_from(&mut reader, "test"),
            Err(DurabilityError::BadFileHeader { .. })
        ));

        let mut reader = BufReader::new(Cursor::new(b"XLOG\n9.99\n\n".to_vec()));
        assert!(FileHeader::read_from(&mut reader, "test").is_err());
    }

    #[test]
    fn header_reads_v11() {
        let mut reader = BufReader::new(Cursor::new(b"XLOG\n0.11\n\n".to_vec()));
        let parsed = FileHeader::read_from(&mut reader, "test").unwrap();
        assert_eq!(parsed.version, VERSION_11);
    }

    #[test]
    fn filenames_roundtrip() {
        assert_eq!(
            filename(Lsn(1), FileType::Xlog),
            "00000000000000000001.xlog"
        );
        assert_eq!(
            parse_filename("00000000000000000001.xlog", FileType::Xlog),
            Some(Lsn(1))
        );
        assert_eq!(
            parse_filename("00000000000001000555.snap", FileType::Snap),
            Some(Lsn(1000555))
        );
        assert_eq!(parse_filename("foo.xlog", FileType::Xlog), None);
        assert_eq!(
            parse_filename("00000000000000000001.xlog", FileType::Snap),
            None
        );
    }

    #[test]
    fn row_marker_framing() {
        let row = Row::dummy(Lsn(1), Scn(1), Tag::wal(TagKind::WalData));
        let bytes = encode_row_with_marker(&row, VERSION_12);
        assert_eq!(
            LittleEndian::read_u64(&bytes[..8]),
            MARKERS_V12.row,
        );
        let (decoded, _) = Row::decode(&bytes[8..]).unwrap();
        assert_eq!(decoded.lsn, Lsn(1));

        let eof = encode_eof_marker(VERSION_12);
        assert_eq!(eof.len(), MARKERS_V12.eof_len);
        assert_eq!(LittleEndian::read_u32(&eof), MARKERS_V12.eof as u32);
    }

    #[test]
    fn current_row_marker_widens_the_legacy_word() {
        assert_eq!(MARKERS_V11.row, ROW_MARKER_WORD);
        assert_eq!(MARKERS_V12.row & 0xffff_ffff, ROW_MARKER_WORD);
        assert_eq!(MARKERS_V12.row >> 32, ROW_MARKER_WORD);
        assert_eq!(MARKERS_V11.eof, MARKERS_V12.eof);
    }

    #[test]
    fn eof_marker_is_shorter_than_row_marker() {
        assert!(MARKERS_V12.eof_len < MARKERS_V12.row_len);
    }
}
