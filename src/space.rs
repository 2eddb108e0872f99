//! Tuple spaces: the per-application executor kept deliberately thin.
//!
//! A space is one table — an index set plus the payload codec that turns
//! durable row bytes back into index mutations. The same [`Space::apply`]
//! path serves WAL replay, replication and snapshot load, so every way a
//! row can reach this node converges on identical index state.

use std::rc::Rc;

use tidelog_core::{Tuple, TupleRef};
use tidelog_index::{IndexError, IndexSet, KeyDef, KeyParts, Index};

/// Operation byte leading every data-row payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SpaceOp {
    /// Insert-or-replace a tuple
    Insert = 1,
    /// Delete by primary key
    Delete = 2,
}

/// Encode an insert payload.
pub fn encode_insert(tuple: &Tuple) -> Vec<u8> {
    let mut buf = Vec::with_capacity(1 + tuple.encoded_len());
    buf.push(SpaceOp::Insert as u8);
    buf.extend_from_slice(tuple.as_bytes());
    buf
}

/// Encode a delete payload around an encoded primary-key pattern.
pub fn encode_delete(pattern: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(1 + pattern.len());
    buf.push(SpaceOp::Delete as u8);
    buf.extend_from_slice(pattern);
    buf
}

/// One table of tuples.
pub struct Space {
    set: IndexSet,
}

impl Space {
    /// Build a space from its key definitions; the first is primary.
    pub fn new(defs: &[KeyDef]) -> Space {
        let mut indexes = Vec::with_capacity(defs.len());
        for (n, def) in defs.iter().enumerate() {
            // the primary sits behind a hash when its key allows it;
            // secondaries order by default so they can serve scans
            let index = if n == 0 && def.cardinality() == 1 && def.unique {
                Index::hash(def.clone())
            } else {
                Index::tree(def.clone())
            };
            indexes.push(index);
        }
        Space {
            set: IndexSet::new(indexes),
        }
    }

    /// The index set.
    pub fn indexes(&self) -> &IndexSet {
        &self.set
    }

    /// Tuples stored.
    pub fn size(&self) -> u32 {
        self.set.size()
    }

    /// Look up the tuple currently holding `new`'s primary key.
    pub fn find_displaced(&self, new: &TupleRef) -> Result<Option<TupleRef>, IndexError> {
        self.set.primary().find_by_obj(new)
    }

    /// Conflict probe without mutation: the tentative phase of a write.
    pub fn prepare_replace(&self, new: &TupleRef) -> Result<Option<TupleRef>, IndexError> {
        let old = self.find_displaced(new)?;
        for n in 0..self.set.len() {
            let index = self.set.index(n).expect("index ordinal in range");
            if !index.unique() {
                continue;
            }
            if let Some(existing) = index.find_by_obj(new)? {
                let is_old = old
                    .as_ref()
                    .map(|o| tidelog_core::tuple::identity(o) == tidelog_core::tuple::identity(&existing))
                    .unwrap_or(false);
                if !is_old {
                    return Err(IndexError::Violation { index: n });
                }
            }
        }
        Ok(old)
    }

    /// Commit a replace across every index.
    pub fn commit_replace(&mut self, new: &TupleRef) -> Result<(), IndexError> {
        let old = self.find_displaced(new)?;
        self.set.replace(new, old.as_ref())
    }

    /// Find a tuple by an encoded pattern on one index.
    pub fn find(&self, index_n: usize, pattern: &[u8]) -> Result<Option<TupleRef>, IndexError> {
        let index = self
            .set
            .index(index_n)
            .ok_or_else(|| IndexError::BadPattern(format!("no index {}", index_n)))?;
        let key = index.decode_pattern(pattern)?;
        index.find_by_key(&key)
    }

    /// All tuples matching an encoded pattern on one index, in key order
    /// for trees.
    pub fn find_all(&self, index_n: usize, pattern: &[u8]) -> Result<Vec<TupleRef>, IndexError> {
        let index = self
            .set
            .index(index_n)
            .ok_or_else(|| IndexError::BadPattern(format!("no index {}", index_n)))?;
        let key = index.decode_pattern(pattern)?;

        match index.iter_from(&key) {
            Ok(iter) => {
                let mut out = Vec::new();
                for tuple in iter {
                    if !pattern_matches(index, &key, &tuple) {
                        break;
                    }
                    out.push(tuple);
                }
                Ok(out)
            }
            // hash indexes answer exact lookups only
            Err(_) => Ok(index.find_by_key(&key)?.into_iter().collect()),
        }
    }

    /// Remove by encoded primary-key pattern, returning the removed tuple.
    pub fn delete_by_key(&mut self, pattern: &[u8]) -> Result<Option<TupleRef>, IndexError> {
        let Some(victim) = self.find(tidelog_index::PRIMARY, pattern)? else {
            return Ok(None);
        };
        self.set.remove(&victim)?;
        Ok(Some(victim))
    }

    /// Apply a durable row payload. Used by WAL replay, replication and
    /// snapshot load alike.
    pub fn apply(&mut self, data: &[u8]) -> Result<(), String> {
        let Some((&op, body)) = data.split_first() else {
            return Err("empty space payload".into());
        };
        match op {
            op if op == SpaceOp::Insert as u8 => {
                let (tuple, _) = Tuple::decode(body).map_err(|e| e.to_string())?;
                let tuple: TupleRef = Rc::new(tuple);
                self.commit_replace(&tuple).map_err(|e| e.to_string())
            }
            op if op == SpaceOp::Delete as u8 => {
                self.delete_by_key(body).map_err(|e| e.to_string())?;
                Ok(())
            }
            other => Err(format!("unknown space op {}", other)),
        }
    }

    /// Snapshot payloads for every stored tuple, in primary-index order.
    pub fn snapshot_payloads(&self) -> Vec<Vec<u8>> {
        self.set
            .primary()
            .iter()
            .map(|tuple| encode_insert(&tuple))
            .collect()
    }
}

fn pattern_matches(index: &Index, key: &KeyParts, tuple: &TupleRef) -> bool {
    match index.def().extract(tuple) {
        Ok(full) => tidelog_index::key::cmp_prefix(key, &full) == std::cmp::Ordering::Equal,
        Err(_) => false,
    }
}

/// Encode a key pattern: `cardinality:u32` then length-prefixed fields.
pub fn encode_pattern(fields: &[&[u8]]) -> Vec<u8> {
    let mut buf = Vec::new();
    buf.extend_from_slice(&(fields.len() as u32).to_le_bytes());
    for field in fields {
        buf.extend_from_slice(&(field.len() as u32).to_le_bytes());
        buf.extend_from_slice(field);
    }
    buf
}
