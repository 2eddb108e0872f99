//! Hash indexes.
//!
//! A hash index maps a single extracted key field to its tuple. Hash
//! indexes are always unique; duplicate detection across a table happens
//! in the index-set replace protocol before any index is touched.

use rustc_hash::FxHashMap;

use tidelog_core::tuple::{self, TupleRef};

use crate::error::IndexError;
use crate::key::{KeyDef, KeyParts};
use crate::node::NodeCache;

/// Open-addressed hash index over one key field.
#[derive(Debug)]
pub struct HashIndex {
    def: KeyDef,
    map: FxHashMap<KeyParts, TupleRef>,
    cache: std::cell::RefCell<NodeCache>,
}

impl HashIndex {
    /// Create an empty hash index. The definition must name exactly one
    /// field and be unique.
    pub fn new(def: KeyDef) -> HashIndex {
        assert_eq!(def.cardinality(), 1, "hash index key has one field");
        assert!(def.unique, "hash indexes are unique");
        HashIndex {
            def,
            map: FxHashMap::default(),
            cache: std::cell::RefCell::new(NodeCache::default()),
        }
    }

    /// Key definition of this index.
    pub fn def(&self) -> &KeyDef {
        &self.def
    }

    /// Look up by decoded pattern. Hash lookups need the full key.
    pub fn find_by_key(&self, key: &KeyParts) -> Result<Option<TupleRef>, IndexError> {
        if key.len() != 1 {
            return Err(IndexError::BadPattern(
                "hash lookup needs exactly one key field".into(),
            ));
        }
        Ok(self.map.get(key).cloned())
    }

    /// Look up the entry a tuple would occupy.
    pub fn find_by_obj(&self, obj: &TupleRef) -> Result<Option<TupleRef>, IndexError> {
        let key = self.cache.borrow_mut().extract(&self.def, obj)?;
        Ok(self.map.get(&key).cloned())
    }

    /// Insert a tuple, displacing any entry under the same key.
    pub fn replace(&mut self, obj: &TupleRef) -> Result<Option<TupleRef>, IndexError> {
        let key = self.cache.borrow_mut().extract(&self.def, obj)?;
        Ok(self.map.insert(key, obj.clone()))
    }

    /// Remove a tuple's entry.
    pub fn remove(&mut self, obj: &TupleRef) -> Result<Option<TupleRef>, IndexError> {
        let key = self.cache.borrow_mut().extract(&self.def, obj)?;
        self.cache.borrow_mut().invalidate(obj);
        Ok(self.map.remove(&key))
    }

    /// Iterate entries in arbitrary order.
    pub fn iter(&self) -> impl Iterator<Item = TupleRef> + '_ {
        self.map.values().cloned()
    }

    /// Number of entries.
    pub fn size(&self) -> u32 {
        self.map.len() as u32
    }

    /// Approximate heap footprint.
    pub fn bytes(&self) -> usize {
        std::mem::size_of::<Self>()
            + self.map.capacity()
                * (std::mem::size_of::<KeyParts>() + std::mem::size_of::<TupleRef>())
    }

    /// True when the index holds the given tuple itself (not merely a
    /// tuple with an equal key).
    pub fn contains_obj(&self, obj: &TupleRef) -> bool {
        match self.find_by_obj(obj) {
            Ok(Some(found)) => tuple::identity(&found) == tuple::identity(obj),
            _ => false,
        }
    }
}
