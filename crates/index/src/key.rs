//! Key definitions, extraction and comparison.
//!
//! A [`KeyDef`] projects a tuple into a fixed sequence of typed key fields
//! by ordinal. Comparison is field-by-field in declared order: integers
//! numerically, byte strings lexicographically with length as the final
//! tie. Search patterns may carry fewer fields than the definition; a
//! pattern compares equal to any key it is a prefix of, which is how range
//! scans position inside a run of equal leading fields.

use smallvec::SmallVec;
use std::cmp::Ordering;

use tidelog_core::tuple::Tuple;

use crate::error::IndexError;

/// Type of a single key field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldType {
    /// 4-byte little-endian unsigned integer
    U32,
    /// 8-byte little-endian unsigned integer
    U64,
    /// Arbitrary byte string
    Bytes,
}

/// One extracted key field.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum FieldValue {
    /// Extracted `u32`
    U32(u32),
    /// Extracted `u64`
    U64(u64),
    /// Extracted byte string
    Bytes(Vec<u8>),
}

impl FieldValue {
    /// Three-way compare against a field of the same type.
    ///
    /// Indexes only ever compare fields extracted under one definition, so
    /// a type mismatch is a broken invariant, not a recoverable error.
    pub fn cmp_same(&self, other: &FieldValue) -> Ordering {
        match (self, other) {
            (FieldValue::U32(a), FieldValue::U32(b)) => a.cmp(b),
            (FieldValue::U64(a), FieldValue::U64(b)) => a.cmp(b),
            (FieldValue::Bytes(a), FieldValue::Bytes(b)) => a.as_slice().cmp(b.as_slice()),
            _ => unreachable!("key fields of one index always share a type"),
        }
    }
}

/// Extracted key: the projected fields in declared order.
pub type KeyParts = SmallVec<[FieldValue; 4]>;

/// One part of a key definition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyPart {
    /// Tuple field ordinal to project
    pub field: u32,
    /// Expected field type
    pub ty: FieldType,
}

/// Declaration of an index key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyDef {
    /// Projected fields in comparison order
    pub parts: Vec<KeyPart>,
    /// Whether the index rejects duplicate keys
    pub unique: bool,
}

impl KeyDef {
    /// Single-field unique key over a `u32` ordinal.
    pub fn u32(field: u32) -> KeyDef {
        KeyDef {
            parts: vec![KeyPart {
                field,
                ty: FieldType::U32,
            }],
            unique: true,
        }
    }

    /// Single-field unique key over a `u64` ordinal.
    pub fn u64(field: u32) -> KeyDef {
        KeyDef {
            parts: vec![KeyPart {
                field,
                ty: FieldType::U64,
            }],
            unique: true,
        }
    }

    /// Single-field unique key over a byte-string ordinal.
    pub fn bytes(field: u32) -> KeyDef {
        KeyDef {
            parts: vec![KeyPart {
                field,
                ty: FieldType::Bytes,
            }],
            unique: true,
        }
    }

    /// Composite key over several typed ordinals.
    pub fn composite(parts: Vec<KeyPart>, unique: bool) -> KeyDef {
        KeyDef { parts, unique }
    }

    /// Mark the key non-unique.
    pub fn non_unique(mut self) -> KeyDef {
        self.unique = false;
        self
    }

    /// Number of key fields.
    pub fn cardinality(&self) -> u32 {
        self.parts.len() as u32
    }

    /// Project a tuple into its key fields.
    pub fn extract(&self, tuple: &Tuple) -> Result<KeyParts, IndexError> {
        let mut parts = KeyParts::new();
        for part in &self.parts {
            let value = match part.ty {
                FieldType::U32 => FieldValue::U32(tuple.field_u32(part.field)?),
                FieldType::U64 => FieldValue::U64(tuple.field_u64(part.field)?),
                FieldType::Bytes => FieldValue::Bytes(tuple.field(part.field)?.to_vec()),
            };
            parts.push(value);
        }
        Ok(parts)
    }

    /// Decode a search pattern: `cardinality:u32` followed by
    /// length-prefixed fields, typed by this definition. A pattern may
    /// supply fewer fields than the definition but never more.
    pub fn decode_pattern(&self, buf: &[u8]) -> Result<KeyParts, IndexError> {
        if buf.len() < 4 {
            return Err(IndexError::BadPattern("missing cardinality".into()));
        }
        let cardinality = u32::from_le_bytes(buf[0..4].try_into().unwrap());
        if cardinality > self.cardinality() {
            return Err(IndexError::PatternCardinality {
                got: cardinality,
                max: self.cardinality(),
            });
        }

        let mut parts = KeyParts::new();
        let mut pos = 4usize;
        for i in 0..cardinality {
            if buf.len() < pos + 4 {
                return Err(IndexError::BadPattern(format!(
                    "field {} length prefix past end",
                    i
                )));
            }
            let len = u32::from_le_bytes(buf[pos..pos + 4].try_into().unwrap()) as usize;
            pos += 4;
            if buf.len() < pos + len {
                return Err(IndexError::BadPattern(format!("field {} body past end", i)));
            }
            let bytes = &buf[pos..pos + len];
            pos += len;

            let value = match self.parts[i as usize].ty {
                FieldType::U32 => {
                    if len != 4 {
                        return Err(IndexError::BadPattern(format!(
                            "field {} is {} bytes, expected 4",
                            i, len
                        )));
                    }
                    FieldValue::U32(u32::from_le_bytes(bytes.try_into().unwrap()))
                }
                FieldType::U64 => {
                    if len != 8 {
                        return Err(IndexError::BadPattern(format!(
                            "field {} is {} bytes, expected 8",
                            i, len
                        )));
                    }
                    FieldValue::U64(u64::from_le_bytes(bytes.try_into().unwrap()))
                }
                FieldType::Bytes => FieldValue::Bytes(bytes.to_vec()),
            };
            parts.push(value);
        }
        Ok(parts)
    }
}

/// Compare two keys over their common prefix; a shorter pattern that
/// matches the prefix compares equal.
pub fn cmp_prefix(a: &KeyParts, b: &KeyParts) -> Ordering {
    for (fa, fb) in a.iter().zip(b.iter()) {
        match fa.cmp_same(fb) {
            Ordering::Equal => continue,
            other => return other,
        }
    }
    Ordering::Equal
}
