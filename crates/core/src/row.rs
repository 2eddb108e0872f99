//! The durable log record.
//!
//! A [`Row`] is the unit of persistence and replication. On disk and on the
//! replication wire it is framed as a fixed little-endian header followed
//! by the payload:
//!
//! ```text
//! ┌──────────────┬─────┬─────┬─────┬──────────┬────────────┬────┬─────┬───────────┬──────┐
//! │ header_crc32 │ lsn │ scn │ tag │ shard_id │ remote_scn │ tm │ len │ data_crc32│ data │
//! │ u32          │ i64 │ i64 │ u16 │ u16      │ [u8;6]     │ f64│ u32 │ u32       │ ...  │
//! └──────────────┴─────┴─────┴─────┴──────────┴────────────┴────┴─────┴───────────┴──────┘
//! ```
//!
//! `header_crc32` covers every header byte after itself; `data_crc32`
//! covers the payload. The two are validated independently: a bad header
//! is indistinguishable from garbage past the true end of a log and reads
//! as end-of-file, while a bad payload under a valid header means the log
//! is damaged in the middle and must stop recovery.
//!
//! The previous format version carried only `{header_crc32, lsn, tm, len,
//! data_crc32}` — no `tag`, `scn`, `shard_id` or `remote_scn`; those rows
//! are upconverted on read by zero-filling the new fields, with the tag
//! derived as an ordinary data row.

use byteorder::{ByteOrder, LittleEndian};
use crc32fast::Hasher;

use crate::error::CoreError;
use crate::tag::Tag;
use crate::types::{Lsn, RemoteScn, Scn, ShardId, SHARD_ID_NONE};

/// Size of the current (v12) row header in bytes.
pub const ROW_HEADER_SIZE: usize = 46;

/// Size of the legacy (v11) row header in bytes:
/// `{header_crc32:u32, lsn:i64, tm:f64, len:u32, data_crc32:u32}`.
pub const ROW_V11_HEADER_SIZE: usize = 28;

/// A decoded row header, before the payload has been read.
///
/// Log readers consume the header first (validating its checksum), then
/// read `len` payload bytes and attach them with [`Row::from_parts`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RowHeader {
    /// Node-global sequence number
    pub lsn: Lsn,
    /// Shard sequence number
    pub scn: Scn,
    /// Row tag
    pub tag: Tag,
    /// Owning shard
    pub shard_id: ShardId,
    /// Upstream SCN marker for replicated rows
    pub remote_scn: RemoteScn,
    /// Wall-clock seconds at write time
    pub tm: f64,
    /// Payload length in bytes
    pub len: u32,
    /// Payload checksum
    pub data_crc32: u32,
}

impl RowHeader {
    /// Decode and validate a v12 header.
    pub fn decode(buf: &[u8]) -> Result<RowHeader, CoreError> {
        if buf.len() < ROW_HEADER_SIZE {
            return Err(CoreError::Truncated {
                need: ROW_HEADER_SIZE,
                have: buf.len(),
            });
        }
        let stored = LittleEndian::read_u32(&buf[0..4]);
        let computed = crc32(&buf[4..ROW_HEADER_SIZE]);
        if stored != computed {
            return Err(CoreError::HeaderCrcMismatch { stored, computed });
        }

        let mut remote_scn = [0u8; 6];
        remote_scn.copy_from_slice(&buf[24..30]);
        Ok(RowHeader {
            lsn: Lsn(LittleEndian::read_i64(&buf[4..12])),
            scn: Scn(LittleEndian::read_i64(&buf[12..20])),
            tag: Tag(LittleEndian::read_u16(&buf[20..22])),
            shard_id: ShardId(LittleEndian::read_u16(&buf[22..24])),
            remote_scn: RemoteScn(remote_scn),
            tm: f64::from_bits(LittleEndian::read_u64(&buf[30..38])),
            len: LittleEndian::read_u32(&buf[38..42]),
            data_crc32: LittleEndian::read_u32(&buf[42..46]),
        })
    }

    /// Decode and validate a legacy v11 header, zero-filling the fields
    /// the old format did not carry. Legacy rows have no tag on the wire;
    /// they decode as ordinary data rows.
    pub fn decode_v11(buf: &[u8]) -> Result<RowHeader, CoreError> {
        if buf.len() < ROW_V11_HEADER_SIZE {
            return Err(CoreError::Truncated {
                need: ROW_V11_HEADER_SIZE,
                have: buf.len(),
            });
        }
        let stored = LittleEndian::read_u32(&buf[0..4]);
        let computed = crc32(&buf[4..ROW_V11_HEADER_SIZE]);
        if stored != computed {
            return Err(CoreError::HeaderCrcMismatch { stored, computed });
        }

        Ok(RowHeader {
            lsn: Lsn(LittleEndian::read_i64(&buf[4..12])),
            scn: Scn::ZERO,
            tag: Tag::wal(crate::tag::TagKind::WalData),
            shard_id: SHARD_ID_NONE,
            remote_scn: RemoteScn::default(),
            tm: f64::from_bits(LittleEndian::read_u64(&buf[12..20])),
            len: LittleEndian::read_u32(&buf[20..24]),
            data_crc32: LittleEndian::read_u32(&buf[24..28]),
        })
    }
}

/// A durable log record.
#[derive(Debug, Clone, PartialEq)]
pub struct Row {
    /// Node-global sequence number; zero until the WAL writer assigns one
    pub lsn: Lsn,
    /// Shard sequence number
    pub scn: Scn,
    /// Row tag
    pub tag: Tag,
    /// Owning shard
    pub shard_id: ShardId,
    /// Upstream SCN marker for replicated rows
    pub remote_scn: RemoteScn,
    /// Wall-clock seconds at write time
    pub tm: f64,
    /// Opaque payload applied by the shard executor
    pub data: Vec<u8>,
}

impl Row {
    /// Build a row ready for WAL submission. LSN and SCN are assigned at
    /// commit time by the writer.
    pub fn new(tag: Tag, shard_id: ShardId, data: Vec<u8>) -> Row {
        Row {
            lsn: Lsn::ZERO,
            scn: Scn::ZERO,
            tag,
            shard_id,
            remote_scn: RemoteScn::default(),
            tm: now_tm(),
            data,
        }
    }

    /// Build a payloadless marker row at an explicit position.
    pub fn dummy(lsn: Lsn, scn: Scn, tag: Tag) -> Row {
        Row {
            lsn,
            scn,
            tag,
            shard_id: SHARD_ID_NONE,
            remote_scn: RemoteScn::default(),
            tm: now_tm(),
            data: Vec::new(),
        }
    }

    /// Total encoded size: header plus payload.
    pub fn encoded_len(&self) -> usize {
        ROW_HEADER_SIZE + self.data.len()
    }

    /// Encode header and payload, computing both checksums.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = vec![0u8; ROW_HEADER_SIZE + self.data.len()];
        self.encode_into(&mut buf);
        buf
    }

    /// Encode into a caller-provided buffer of exactly
    /// [`Row::encoded_len`] bytes.
    pub fn encode_into(&self, buf: &mut [u8]) {
        assert_eq!(buf.len(), self.encoded_len());
        LittleEndian::write_i64(&mut buf[4..12], self.lsn.0);
        LittleEndian::write_i64(&mut buf[12..20], self.scn.0);
        LittleEndian::write_u16(&mut buf[20..22], self.tag.0);
        LittleEndian::write_u16(&mut buf[22..24], self.shard_id.0);
        buf[24..30].copy_from_slice(&self.remote_scn.0);
        LittleEndian::write_u64(&mut buf[30..38], self.tm.to_bits());
        LittleEndian::write_u32(&mut buf[38..42], self.data.len() as u32);
        LittleEndian::write_u32(&mut buf[42..46], crc32(&self.data));
        buf[ROW_HEADER_SIZE..].copy_from_slice(&self.data);

        let header_crc = crc32(&buf[4..ROW_HEADER_SIZE]);
        LittleEndian::write_u32(&mut buf[0..4], header_crc);
    }

    /// Attach a payload to a validated header, checking the payload
    /// checksum.
    pub fn from_parts(header: RowHeader, data: Vec<u8>) -> Result<Row, CoreError> {
        if data.len() != header.len as usize {
            return Err(CoreError::Truncated {
                need: header.len as usize,
                have: data.len(),
            });
        }
        let computed = crc32(&data);
        if computed != header.data_crc32 {
            return Err(CoreError::DataCrcMismatch {
                lsn: header.lsn.0,
                stored: header.data_crc32,
                computed,
            });
        }
        Ok(Row {
            lsn: header.lsn,
            scn: header.scn,
            tag: header.tag,
            shard_id: header.shard_id,
            remote_scn: header.remote_scn,
            tm: header.tm,
            data,
        })
    }

    /// Decode a full row from a buffer, returning the row and the bytes
    /// consumed.
    pub fn decode(buf: &[u8]) -> Result<(Row, usize), CoreError> {
        let header = RowHeader::decode(buf)?;
        let total = ROW_HEADER_SIZE + header.len as usize;
        if buf.len() < total {
            return Err(CoreError::Truncated {
                need: total,
                have: buf.len(),
            });
        }
        let row = Row::from_parts(header, buf[ROW_HEADER_SIZE..total].to_vec())?;
        Ok((row, total))
    }
}

/// Wall-clock seconds since the Unix epoch, as the row timestamp.
pub fn now_tm() -> f64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

fn crc32(data: &[u8]) -> u32 {
    let mut hasher = Hasher::new();
    hasher.update(data);
    hasher.finalize()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tag::TagKind;
    use proptest::prelude::*;

    fn sample_row() -> Row {
        let mut row = Row::new(Tag::wal(TagKind::WalData), ShardId(3), vec![1, 2, 3, 4, 5]);
        row.lsn = Lsn(77);
        row.scn = Scn(12);
        row.remote_scn = RemoteScn::from_scn(Scn(11));
        row
    }

    #[test]
    fn encode_decode_roundtrip() {
        let row = sample_row();
        let bytes = row.encode();
        let (decoded, consumed) = Row::decode(&bytes).unwrap();
        assert_eq!(decoded, row);
        assert_eq!(consumed, bytes.len());
    }

    #[test]
    fn empty_payload_roundtrip() {
        let row = Row::dummy(Lsn(1), Scn(1), Tag::sys(TagKind::Nop));
        let (decoded, _) = Row::decode(&row.encode()).unwrap();
        assert_eq!(decoded.data, Vec::<u8>::new());
        assert_eq!(decoded.lsn, Lsn(1));
    }

    #[test]
    fn header_corruption_is_header_crc_error() {
        let mut bytes = sample_row().encode();
        bytes[8] ^= 0xff; // inside lsn
        assert!(matches!(
            Row::decode(&bytes),
            Err(CoreError::HeaderCrcMismatch { .. })
        ));
    }

    #[test]
    fn payload_corruption_is_data_crc_error() {
        let mut bytes = sample_row().encode();
        let n = bytes.len();
        bytes[n - 1] ^= 0xff;
        assert!(matches!(
            Row::decode(&bytes),
            Err(CoreError::DataCrcMismatch { lsn: 77, .. })
        ));
    }

    #[test]
    fn truncated_buffer() {
        let bytes = sample_row().encode();
        assert!(matches!(
            Row::decode(&bytes[..10]),
            Err(CoreError::Truncated { .. })
        ));
        // full header, partial payload
        assert!(matches!(
            Row::decode(&bytes[..ROW_HEADER_SIZE + 2]),
            Err(CoreError::Truncated { .. })
        ));
    }

    #[test]
    fn v11_header_upconverts_with_zero_fill() {
        // hand-assemble a legacy header around a payload; the old format
        // carried only crc, lsn, tm, len and the payload crc
        let data = vec![9u8, 8, 7];
        let mut buf = vec![0u8; ROW_V11_HEADER_SIZE];
        byteorder::LittleEndian::write_i64(&mut buf[4..12], 5);
        byteorder::LittleEndian::write_u64(&mut buf[12..20], 0.0f64.to_bits());
        byteorder::LittleEndian::write_u32(&mut buf[20..24], data.len() as u32);
        byteorder::LittleEndian::write_u32(&mut buf[24..28], super::crc32(&data));
        let crc = super::crc32(&buf[4..ROW_V11_HEADER_SIZE]);
        byteorder::LittleEndian::write_u32(&mut buf[0..4], crc);

        let header = RowHeader::decode_v11(&buf).unwrap();
        assert_eq!(header.lsn, Lsn(5));
        assert_eq!(header.scn, Scn::ZERO);
        assert_eq!(header.tag, Tag::wal(TagKind::WalData));
        assert_eq!(header.shard_id, SHARD_ID_NONE);
        assert!(header.remote_scn.is_zero());

        let row = Row::from_parts(header, data).unwrap();
        assert_eq!(row.data, vec![9, 8, 7]);
    }

    proptest! {
        #[test]
        fn roundtrip_any_payload(payload in proptest::collection::vec(any::<u8>(), 0..512),
                                 lsn in 0i64..i64::MAX / 2,
                                 scn in 0i64..i64::MAX / 2) {
            let mut row = Row::new(Tag::wal(TagKind::WalData), ShardId(0), payload);
            row.lsn = Lsn(lsn);
            row.scn = Scn(scn);
            let (decoded, consumed) = Row::decode(&row.encode()).unwrap();
            prop_assert_eq!(&decoded, &row);
            prop_assert_eq!(consumed, row.encoded_len());
        }
    }
}
