//! Comparison nodes and the extraction cache.
//!
//! Tree indexes do not compare tuples directly; they compare
//! [`IndexNode`]s, each holding the extracted key fields plus a strong
//! handle on the owning tuple. Search patterns are nodes without a tuple,
//! and a pattern node compares equal to any node whose key it is a prefix
//! of.
//!
//! Extraction walks the tuple's field tail, so hot paths that probe
//! several indexes for the same tuple go through a small per-index cache
//! keyed by tuple identity.

use std::cmp::Ordering;

use tidelog_core::tuple::{self, TupleRef};

use crate::error::IndexError;
use crate::key::{cmp_prefix, KeyDef, KeyParts};

/// Entries in the per-index extraction cache.
pub const INDEX_NODE_CACHE: usize = 11;

/// A comparison node: extracted key plus the owning tuple.
#[derive(Debug, Clone)]
pub struct IndexNode {
    /// Extracted key fields
    pub key: KeyParts,
    /// Owning tuple; `None` marks a search pattern
    pub obj: Option<TupleRef>,
}

impl IndexNode {
    /// Build a node for a stored tuple.
    pub fn from_tuple(def: &KeyDef, obj: &TupleRef) -> Result<IndexNode, IndexError> {
        Ok(IndexNode {
            key: def.extract(obj)?,
            obj: Some(obj.clone()),
        })
    }

    /// Build a pattern node from already-decoded key fields.
    pub fn pattern(key: KeyParts) -> IndexNode {
        IndexNode { key, obj: None }
    }
}

/// Order nodes by key, tie-breaking equal keys by tuple identity.
///
/// The tie-break keeps every entry of a non-unique index distinct; unique
/// indexes order by key alone. Pattern nodes carry no tuple and compare
/// equal to the whole run they match.
#[derive(Debug, Clone, Copy)]
pub struct NodeCmp {
    /// Whether equal keys collapse to one entry
    pub unique: bool,
}

impl crate::sptree::NodeOrd<IndexNode> for NodeCmp {
    fn cmp(&self, a: &IndexNode, b: &IndexNode) -> Ordering {
        match cmp_prefix(&a.key, &b.key) {
            Ordering::Equal if !self.unique => match (&a.obj, &b.obj) {
                (Some(x), Some(y)) => tuple::identity(x).cmp(&tuple::identity(y)),
                _ => Ordering::Equal,
            },
            other => other,
        }
    }
}

/// Fixed-size cache of recently extracted keys, keyed by tuple identity
/// modulo the cache size.
#[derive(Debug, Default)]
pub struct NodeCache {
    slots: [Option<(usize, KeyParts)>; INDEX_NODE_CACHE],
}

impl NodeCache {
    /// Extract a tuple's key through the cache.
    pub fn extract(&mut self, def: &KeyDef, obj: &TupleRef) -> Result<KeyParts, IndexError> {
        let identity = tuple::identity(obj);
        let slot = identity % INDEX_NODE_CACHE;
        if let Some((cached_id, key)) = &self.slots[slot] {
            if *cached_id == identity {
                return Ok(key.clone());
            }
        }
        let key = def.extract(obj)?;
        self.slots[slot] = Some((identity, key.clone()));
        Ok(key)
    }

    /// Drop a tuple's cached key, if present. Called on removal so a slot
    /// cannot serve a stale key for a recycled allocation.
    pub fn invalidate(&mut self, obj: &TupleRef) {
        let identity = tuple::identity(obj);
        let slot = identity % INDEX_NODE_CACHE;
        if let Some((cached_id, _)) = &self.slots[slot] {
            if *cached_id == identity {
                self.slots[slot] = None;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key::FieldValue;
    use crate::sptree::NodeOrd;
    use std::rc::Rc;
    use tidelog_core::tuple::Tuple;

    fn obj(id: u32) -> TupleRef {
        Rc::new(Tuple::from_fields(0, [id.to_le_bytes().as_slice()]))
    }

    #[test]
    fn unique_order_ignores_identity() {
        let def = KeyDef::u32(0);
        let cmp = NodeCmp { unique: true };
        let a = IndexNode::from_tuple(&def, &obj(1)).unwrap();
        let b = IndexNode::from_tuple(&def, &obj(1)).unwrap();
        assert_eq!(cmp.cmp(&a, &b), Ordering::Equal);
    }

    #[test]
    fn non_unique_order_breaks_ties_by_identity() {
        let def = KeyDef::u32(0).non_unique();
        let cmp = NodeCmp { unique: false };
        let a = IndexNode::from_tuple(&def, &obj(1)).unwrap();
        let b = IndexNode::from_tuple(&def, &obj(1)).unwrap();
        assert_ne!(cmp.cmp(&a, &b), Ordering::Equal);

        // but a pattern matches both
        let pattern = IndexNode::pattern([FieldValue::U32(1)].into_iter().collect());
        assert_eq!(cmp.cmp(&pattern, &a), Ordering::Equal);
        assert_eq!(cmp.cmp(&pattern, &b), Ordering::Equal);
    }

    #[test]
    fn cache_hits_by_identity() {
        let def = KeyDef::u32(0);
        let mut cache = NodeCache::default();
        let t = obj(42);
        let first = cache.extract(&def, &t).unwrap();
        let second = cache.extract(&def, &t).unwrap();
        assert_eq!(first, second);

        // a different tuple with a colliding slot still extracts correctly
        let other = obj(7);
        let key = cache.extract(&def, &other).unwrap();
        assert_eq!(key.as_slice(), &[FieldValue::U32(7)]);
    }

    #[test]
    fn cache_invalidation() {
        let def = KeyDef::u32(0);
        let mut cache = NodeCache::default();
        let t = obj(1);
        cache.extract(&def, &t).unwrap();
        cache.invalidate(&t);
        // re-extraction still returns the right key
        assert_eq!(
            cache.extract(&def, &t).unwrap().as_slice(),
            &[FieldValue::U32(1)]
        );
    }
}
