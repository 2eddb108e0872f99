//! The closed set of index variants.
//!
//! Dispatch is a tagged union rather than trait objects: the engine knows
//! every index shape it supports, and the variant is picked once from the
//! key definition when a table is configured.

use tidelog_core::tuple::TupleRef;

use crate::error::IndexError;
use crate::hash::HashIndex;
use crate::key::{FieldType, KeyDef, KeyParts};
use crate::tree::TreeIndex;

/// Which concrete shape an index takes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexKind {
    /// Hash over a `u32` field
    HashByU32,
    /// Hash over a `u64` field
    HashByU64,
    /// Hash over a byte-string field
    HashByBytes,
    /// Tree over a `u32` field
    TreeByU32,
    /// Tree over a `u64` field
    TreeByU64,
    /// Tree over a byte-string field
    TreeByBytes,
    /// Tree over several typed fields
    TreeByCompositeKey,
}

/// An index over one table's tuples.
pub enum Index {
    /// Hash-shaped variants
    Hash(HashIndex),
    /// Tree-shaped variants
    Tree(TreeIndex),
}

impl Index {
    /// Build the hash variant for a single-field unique definition.
    ///
    /// Hash indexes cannot answer ordered scans, so multi-field or
    /// non-unique definitions take the tree shape instead.
    pub fn hash(def: KeyDef) -> Index {
        Index::Hash(HashIndex::new(def))
    }

    /// Build the tree variant.
    pub fn tree(def: KeyDef) -> Index {
        Index::Tree(TreeIndex::new(def))
    }

    /// The concrete variant of this index.
    pub fn kind(&self) -> IndexKind {
        match self {
            Index::Hash(h) => match h.def().parts[0].ty {
                FieldType::U32 => IndexKind::HashByU32,
                FieldType::U64 => IndexKind::HashByU64,
                FieldType::Bytes => IndexKind::HashByBytes,
            },
            Index::Tree(t) => {
                if t.def().parts.len() > 1 {
                    IndexKind::TreeByCompositeKey
                } else {
                    match t.def().parts[0].ty {
                        FieldType::U32 => IndexKind::TreeByU32,
                        FieldType::U64 => IndexKind::TreeByU64,
                        FieldType::Bytes => IndexKind::TreeByBytes,
                    }
                }
            }
        }
    }

    /// Key definition of this index.
    pub fn def(&self) -> &KeyDef {
        match self {
            Index::Hash(h) => h.def(),
            Index::Tree(t) => t.def(),
        }
    }

    /// Whether this index rejects duplicate keys.
    pub fn unique(&self) -> bool {
        self.def().unique
    }

    /// Number of key fields.
    pub fn cardinality(&self) -> u32 {
        self.def().cardinality()
    }

    /// Decode an encoded search pattern against this index's definition.
    pub fn decode_pattern(&self, buf: &[u8]) -> Result<KeyParts, IndexError> {
        self.def().decode_pattern(buf)
    }

    /// Look up by decoded key pattern.
    pub fn find_by_key(&self, key: &KeyParts) -> Result<Option<TupleRef>, IndexError> {
        match self {
            Index::Hash(h) => h.find_by_key(key),
            Index::Tree(t) => t.find_by_key(key),
        }
    }

    /// Look up the entry a tuple occupies (or would collide with).
    pub fn find_by_obj(&self, obj: &TupleRef) -> Result<Option<TupleRef>, IndexError> {
        match self {
            Index::Hash(h) => h.find_by_obj(obj),
            Index::Tree(t) => t.find_by_obj(obj),
        }
    }

    /// Insert a tuple, displacing any entry it compares equal to.
    pub fn replace(&mut self, obj: &TupleRef) -> Result<Option<TupleRef>, IndexError> {
        match self {
            Index::Hash(h) => h.replace(obj),
            Index::Tree(t) => t.replace(obj),
        }
    }

    /// Remove a tuple's entry.
    pub fn remove(&mut self, obj: &TupleRef) -> Result<Option<TupleRef>, IndexError> {
        match self {
            Index::Hash(h) => h.remove(obj),
            Index::Tree(t) => t.remove(obj),
        }
    }

    /// Iterate all entries; ordered for trees, arbitrary for hashes.
    pub fn iter(&self) -> Box<dyn Iterator<Item = TupleRef> + '_> {
        match self {
            Index::Hash(h) => Box::new(h.iter()),
            Index::Tree(t) => Box::new(t.iter()),
        }
    }

    /// Ordered scan from a pattern; only trees support it.
    pub fn iter_from(
        &self,
        key: &KeyParts,
    ) -> Result<Box<dyn Iterator<Item = TupleRef> + '_>, IndexError> {
        match self {
            Index::Hash(_) => Err(IndexError::BadPattern(
                "hash index does not support ordered scans".into(),
            )),
            Index::Tree(t) => Ok(Box::new(t.iter_from(key))),
        }
    }

    /// Number of entries.
    pub fn size(&self) -> u32 {
        match self {
            Index::Hash(h) => h.size(),
            Index::Tree(t) => t.size(),
        }
    }

    /// Approximate heap footprint.
    pub fn bytes(&self) -> usize {
        match self {
            Index::Hash(h) => h.bytes(),
            Index::Tree(t) => t.bytes(),
        }
    }

    /// True when the index holds this exact tuple.
    pub fn contains_obj(&self, obj: &TupleRef) -> bool {
        match self {
            Index::Hash(h) => h.contains_obj(obj),
            Index::Tree(t) => t.contains_obj(obj),
        }
    }
}
