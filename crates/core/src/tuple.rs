//! Reference-counted tuple objects.
//!
//! A tuple is the opaque user record stored by the engine: a type/flags
//! byte followed by a cardinality-prefixed tail of length-prefixed fields.
//! The engine never interprets payload bytes beyond extracting key fields
//! by ordinal; everything else is application business.
//!
//! A tuple owns its encoded byte form, so writing one to the log or into a
//! reply is a borrow, not a re-encode. Tuples are shared by reference
//! count: every index of a table holds a strong handle, and an in-flight
//! output segment that points into a tuple holds one too, so a tuple stays
//! alive until the last index entry is gone and the last reply referencing
//! it has been flushed. Tuples are never mutated in place while indexed;
//! updates build a fresh tuple and swap it through the index replace
//! protocol.

use std::rc::Rc;

use byteorder::{ByteOrder, LittleEndian};

use crate::error::CoreError;

/// Shared handle to a tuple.
pub type TupleRef = Rc<Tuple>;

/// Offset of the field tail within the encoded form:
/// `flags:u8 + cardinality:u32`.
const TAIL_OFFSET: usize = 5;

/// An immutable user record, held in its encoded form.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tuple {
    bytes: Vec<u8>,
}

impl Tuple {
    /// Build a tuple from its fields.
    pub fn from_fields<'a, I>(flags: u8, fields: I) -> Tuple
    where
        I: IntoIterator<Item = &'a [u8]>,
    {
        let mut bytes = vec![flags, 0, 0, 0, 0];
        let mut cardinality = 0u32;
        for field in fields {
            let mut len = [0u8; 4];
            LittleEndian::write_u32(&mut len, field.len() as u32);
            bytes.extend_from_slice(&len);
            bytes.extend_from_slice(field);
            cardinality += 1;
        }
        LittleEndian::write_u32(&mut bytes[1..5], cardinality);
        Tuple { bytes }
    }

    /// The type/flags byte.
    pub fn flags(&self) -> u8 {
        self.bytes[0]
    }

    /// Number of fields.
    pub fn cardinality(&self) -> u32 {
        LittleEndian::read_u32(&self.bytes[1..5])
    }

    /// The encoded form: `flags:u8, cardinality:u32, fields...`.
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Size of the encoded form.
    pub fn encoded_len(&self) -> usize {
        self.bytes.len()
    }

    /// Field bytes by ordinal.
    pub fn field(&self, ordinal: u32) -> Result<&[u8], CoreError> {
        let cardinality = self.cardinality();
        if ordinal >= cardinality {
            return Err(CoreError::FieldOutOfRange {
                ordinal,
                cardinality,
            });
        }
        let mut pos = TAIL_OFFSET;
        for _ in 0..ordinal {
            let len = LittleEndian::read_u32(&self.bytes[pos..pos + 4]) as usize;
            pos += 4 + len;
        }
        let len = LittleEndian::read_u32(&self.bytes[pos..pos + 4]) as usize;
        Ok(&self.bytes[pos + 4..pos + 4 + len])
    }

    /// Field interpreted as a little-endian `u32`.
    pub fn field_u32(&self, ordinal: u32) -> Result<u32, CoreError> {
        let bytes = self.field(ordinal)?;
        if bytes.len() != 4 {
            return Err(CoreError::MalformedTuple(format!(
                "field {} is {} bytes, expected 4",
                ordinal,
                bytes.len()
            )));
        }
        Ok(LittleEndian::read_u32(bytes))
    }

    /// Field interpreted as a little-endian `u64`.
    pub fn field_u64(&self, ordinal: u32) -> Result<u64, CoreError> {
        let bytes = self.field(ordinal)?;
        if bytes.len() != 8 {
            return Err(CoreError::MalformedTuple(format!(
                "field {} is {} bytes, expected 8",
                ordinal,
                bytes.len()
            )));
        }
        Ok(LittleEndian::read_u64(bytes))
    }

    /// Iterate over all fields in ordinal order.
    pub fn fields(&self) -> Fields<'_> {
        Fields {
            bytes: &self.bytes,
            remaining: self.cardinality(),
            pos: TAIL_OFFSET,
        }
    }

    /// Decode from the wire/log form, validating that the field tail is
    /// well-formed. Returns the tuple and the bytes consumed.
    pub fn decode(buf: &[u8]) -> Result<(Tuple, usize), CoreError> {
        if buf.len() < TAIL_OFFSET {
            return Err(CoreError::Truncated {
                need: TAIL_OFFSET,
                have: buf.len(),
            });
        }
        let cardinality = LittleEndian::read_u32(&buf[1..5]);

        let mut pos = TAIL_OFFSET;
        for i in 0..cardinality {
            if buf.len() < pos + 4 {
                return Err(CoreError::MalformedTuple(format!(
                    "field {} length prefix past end of buffer",
                    i
                )));
            }
            let len = LittleEndian::read_u32(&buf[pos..pos + 4]) as usize;
            if buf.len() < pos + 4 + len {
                return Err(CoreError::MalformedTuple(format!(
                    "field {} body past end of buffer",
                    i
                )));
            }
            pos += 4 + len;
        }

        Ok((
            Tuple {
                bytes: buf[..pos].to_vec(),
            },
            pos,
        ))
    }
}

/// Pointer identity of a shared tuple, used as the tie-breaker in
/// non-unique indexes.
pub fn identity(tuple: &TupleRef) -> usize {
    Rc::as_ptr(tuple) as usize
}

/// Iterator over tuple fields.
pub struct Fields<'a> {
    bytes: &'a [u8],
    remaining: u32,
    pos: usize,
}

impl<'a> Iterator for Fields<'a> {
    type Item = &'a [u8];

    fn next(&mut self) -> Option<&'a [u8]> {
        if self.remaining == 0 {
            return None;
        }
        let len = LittleEndian::read_u32(&self.bytes[self.pos..self.pos + 4]) as usize;
        let start = self.pos + 4;
        self.pos = start + len;
        self.remaining -= 1;
        Some(&self.bytes[start..start + len])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tuple(fields: &[&[u8]]) -> Tuple {
        Tuple::from_fields(0, fields.iter().copied())
    }

    #[test]
    fn field_access() {
        let t = tuple(&[b"one", b"twotwo", b""]);
        assert_eq!(t.cardinality(), 3);
        assert_eq!(t.field(0).unwrap(), b"one");
        assert_eq!(t.field(1).unwrap(), b"twotwo");
        assert_eq!(t.field(2).unwrap(), b"");
        assert!(matches!(
            t.field(3),
            Err(CoreError::FieldOutOfRange { ordinal: 3, .. })
        ));
    }

    #[test]
    fn typed_fields() {
        let id = 7u32.to_le_bytes();
        let big = 1u64.to_le_bytes();
        let t = tuple(&[&id, &big, b"name"]);
        assert_eq!(t.field_u32(0).unwrap(), 7);
        assert_eq!(t.field_u64(1).unwrap(), 1);
        assert!(t.field_u32(2).is_err());
    }

    #[test]
    fn decode_validates_and_roundtrips() {
        let t = tuple(&[b"alpha", b"", b"\x00\x01\x02"]);
        let (decoded, consumed) = Tuple::decode(t.as_bytes()).unwrap();
        assert_eq!(decoded, t);
        assert_eq!(consumed, t.encoded_len());
    }

    #[test]
    fn decode_rejects_short_tail() {
        let t = tuple(&[b"alpha", b"beta"]);
        let bytes = t.as_bytes();
        assert!(Tuple::decode(&bytes[..bytes.len() - 1]).is_err());
    }

    #[test]
    fn decode_consumes_exact_prefix() {
        let t = tuple(&[b"x"]);
        let mut bytes = t.as_bytes().to_vec();
        let tail_start = bytes.len();
        bytes.extend_from_slice(b"garbage");
        let (decoded, consumed) = Tuple::decode(&bytes).unwrap();
        assert_eq!(decoded, t);
        assert_eq!(consumed, tail_start);
    }

    #[test]
    fn fields_iterator_matches_ordinals() {
        let t = tuple(&[b"a", b"bb", b"ccc"]);
        let collected: Vec<&[u8]> = t.fields().collect();
        assert_eq!(collected, vec![b"a".as_ref(), b"bb".as_ref(), b"ccc".as_ref()]);
    }

    #[test]
    fn flags_byte_survives() {
        let t = Tuple::from_fields(0x42, [b"f".as_ref()]);
        assert_eq!(t.flags(), 0x42);
        let (decoded, _) = Tuple::decode(t.as_bytes()).unwrap();
        assert_eq!(decoded.flags(), 0x42);
    }

    #[test]
    fn identity_distinguishes_clones() {
        let a: TupleRef = Rc::new(tuple(&[b"same"]));
        let b: TupleRef = Rc::new(tuple(&[b"same"]));
        let a2 = a.clone();
        assert_eq!(identity(&a), identity(&a2));
        assert_ne!(identity(&a), identity(&b));
    }
}
