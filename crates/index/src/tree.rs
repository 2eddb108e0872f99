//! Tree indexes over the order-statistic tree.

use tidelog_core::tuple::{self, TupleRef};

use crate::error::IndexError;
use crate::key::{KeyDef, KeyParts};
use crate::node::{IndexNode, NodeCache, NodeCmp};
use crate::sptree::SpTree;

/// Ordered index over one or more key fields.
///
/// Entries are [`IndexNode`]s ordered by key with tuple identity as the
/// tie-break on non-unique definitions, so every stored tuple keeps a
/// distinct entry even when keys collide.
pub struct TreeIndex {
    def: KeyDef,
    tree: SpTree<IndexNode, NodeCmp>,
    cache: std::cell::RefCell<NodeCache>,
}

impl TreeIndex {
    /// Create an empty tree index.
    pub fn new(def: KeyDef) -> TreeIndex {
        let cmp = NodeCmp { unique: def.unique };
        TreeIndex {
            def,
            tree: SpTree::new(cmp),
            cache: std::cell::RefCell::new(NodeCache::default()),
        }
    }

    /// Key definition of this index.
    pub fn def(&self) -> &KeyDef {
        &self.def
    }

    /// Look up by decoded pattern; a partial pattern returns the first
    /// element of the matching run.
    pub fn find_by_key(&self, key: &KeyParts) -> Result<Option<TupleRef>, IndexError> {
        let pattern = IndexNode::pattern(key.clone());
        Ok(self
            .tree
            .find(&pattern)
            .map(|node| node.obj.clone().expect("stored node has a tuple")))
    }

    /// Look up the entry this exact tuple occupies (or, on a unique index,
    /// whichever tuple holds its key).
    pub fn find_by_obj(&self, obj: &TupleRef) -> Result<Option<TupleRef>, IndexError> {
        let key = self.cache.borrow_mut().extract(&self.def, obj)?;
        let probe = IndexNode {
            key,
            obj: Some(obj.clone()),
        };
        Ok(self
            .tree
            .find(&probe)
            .map(|node| node.obj.clone().expect("stored node has a tuple")))
    }

    /// Insert a tuple, displacing any entry it compares equal to.
    pub fn replace(&mut self, obj: &TupleRef) -> Result<Option<TupleRef>, IndexError> {
        let key = self.cache.borrow_mut().extract(&self.def, obj)?;
        let node = IndexNode {
            key,
            obj: Some(obj.clone()),
        };
        Ok(self
            .tree
            .insert_or_replace(node)
            .map(|old| old.obj.expect("stored node has a tuple")))
    }

    /// Remove a tuple's entry.
    pub fn remove(&mut self, obj: &TupleRef) -> Result<Option<TupleRef>, IndexError> {
        let key = self.cache.borrow_mut().extract(&self.def, obj)?;
        self.cache.borrow_mut().invalidate(obj);
        let probe = IndexNode {
            key,
            obj: Some(obj.clone()),
        };
        Ok(self
            .tree
            .delete(&probe)
            .map(|old| old.obj.expect("stored node has a tuple")))
    }

    /// Iterate all entries in key order.
    pub fn iter(&self) -> impl Iterator<Item = TupleRef> + '_ {
        self.tree
            .iter()
            .map(|node| node.obj.clone().expect("stored node has a tuple"))
    }

    /// Iterate in key order starting at the first entry matching the
    /// pattern, or the next greater entry if nothing matches.
    pub fn iter_from(&self, key: &KeyParts) -> impl Iterator<Item = TupleRef> + '_ {
        let pattern = IndexNode::pattern(key.clone());
        self.tree
            .iter_from(&pattern)
            .map(|node| node.obj.clone().expect("stored node has a tuple"))
    }

    /// Number of entries.
    pub fn size(&self) -> u32 {
        self.tree.size()
    }

    /// Approximate heap footprint.
    pub fn bytes(&self) -> usize {
        self.tree.bytes()
    }

    /// True when the index holds this exact tuple.
    pub fn contains_obj(&self, obj: &TupleRef) -> bool {
        match self.find_by_obj(obj) {
            Ok(Some(found)) => tuple::identity(&found) == tuple::identity(obj),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key::{FieldType, FieldValue, KeyPart};
    use std::rc::Rc;
    use tidelog_core::tuple::Tuple;

    fn obj(id: u32, name: &str) -> TupleRef {
        Rc::new(Tuple::from_fields(
            0,
            [id.to_le_bytes().as_slice(), name.as_bytes()],
        ))
    }

    fn key_u32(v: u32) -> KeyParts {
        [FieldValue::U32(v)].into_iter().collect()
    }

    #[test]
    fn ordered_iteration() {
        let mut idx = TreeIndex::new(KeyDef::u32(0));
        for id in [5u32, 1, 3, 2, 4] {
            idx.replace(&obj(id, "x")).unwrap();
        }
        let ids: Vec<u32> = idx.iter().map(|t| t.field_u32(0).unwrap()).collect();
        assert_eq!(ids, vec![1, 2, 3, 4, 5]);
    }

    #[test]
    fn range_scan_from_pattern() {
        let mut idx = TreeIndex::new(KeyDef::u32(0));
        for id in 1..=9u32 {
            idx.replace(&obj(id, "x")).unwrap();
        }
        let ids: Vec<u32> = idx
            .iter_from(&key_u32(4))
            .map(|t| t.field_u32(0).unwrap())
            .collect();
        assert_eq!(ids, vec![4, 5, 6, 7, 8, 9]);
    }

    #[test]
    fn non_unique_keeps_duplicate_keys_distinct() {
        let def = KeyDef::bytes(1).non_unique();
        let mut idx = TreeIndex::new(def);
        let a = obj(1, "same");
        let b = obj(2, "same");
        idx.replace(&a).unwrap();
        idx.replace(&b).unwrap();
        assert_eq!(idx.size(), 2);

        // removing one leaves the other
        idx.remove(&a).unwrap().unwrap();
        assert_eq!(idx.size(), 1);
        assert!(idx.contains_obj(&b));
        assert!(!idx.contains_obj(&a));
    }

    #[test]
    fn unique_replace_displaces_by_key() {
        let mut idx = TreeIndex::new(KeyDef::u32(0));
        let a = obj(1, "a");
        let b = obj(1, "b");
        idx.replace(&a).unwrap();
        let displaced = idx.replace(&b).unwrap().unwrap();
        assert_eq!(tuple::identity(&displaced), tuple::identity(&a));
        assert_eq!(idx.size(), 1);
    }

    #[test]
    fn composite_key_order() {
        let def = KeyDef::composite(
            vec![
                KeyPart {
                    field: 1,
                    ty: FieldType::Bytes,
                },
                KeyPart {
                    field: 0,
                    ty: FieldType::U32,
                },
            ],
            true,
        );
        let mut idx = TreeIndex::new(def);
        idx.replace(&obj(2, "b")).unwrap();
        idx.replace(&obj(1, "b")).unwrap();
        idx.replace(&obj(9, "a")).unwrap();

        let order: Vec<u32> = idx.iter().map(|t| t.field_u32(0).unwrap()).collect();
        assert_eq!(order, vec![9, 1, 2]);

        // partial pattern over the leading field positions at the run
        let pattern: KeyParts = [FieldValue::Bytes(b"b".to_vec())].into_iter().collect();
        let run: Vec<u32> = idx
            .iter_from(&pattern)
            .map(|t| t.field_u32(0).unwrap())
            .collect();
        assert_eq!(run, vec![1, 2]);
    }
}
