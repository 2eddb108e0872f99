//! The per-table index set and its replace protocol.
//!
//! Every table keeps one primary index plus any number of secondaries, and
//! all of them must always hold exactly the same set of tuples. The
//! replace protocol makes a mutation all-or-nothing without undo logging:
//! every unique index is probed for a conflicting foreign tuple *before*
//! any index is modified, so the mutation either aborts untouched or runs
//! to completion. Mutation order is fixed — remove the old tuple from all
//! indexes, insert the new one into all, primary last — which keeps
//! recovery and replication deterministic.

use tidelog_core::tuple::{self, TupleRef};

use crate::error::IndexError;
use crate::index::Index;

/// Ordinal of the primary index within a set.
pub const PRIMARY: usize = 0;

/// All indexes of one table. Index `0` is primary and owns removal
/// semantics.
pub struct IndexSet {
    indexes: Vec<Index>,
}

impl IndexSet {
    /// Build a set from its indexes; the first is primary and must be
    /// unique.
    pub fn new(indexes: Vec<Index>) -> IndexSet {
        assert!(!indexes.is_empty(), "a table has at least a primary index");
        assert!(indexes[PRIMARY].unique(), "the primary index is unique");
        IndexSet { indexes }
    }

    /// The primary index.
    pub fn primary(&self) -> &Index {
        &self.indexes[PRIMARY]
    }

    /// Index by ordinal.
    pub fn index(&self, n: usize) -> Option<&Index> {
        self.indexes.get(n)
    }

    /// Number of indexes.
    pub fn len(&self) -> usize {
        self.indexes.len()
    }

    /// True when the set has no indexes (never, by construction).
    pub fn is_empty(&self) -> bool {
        self.indexes.is_empty()
    }

    /// Number of tuples in the table.
    pub fn size(&self) -> u32 {
        self.indexes[PRIMARY].size()
    }

    /// Apply an insert-or-replace across every index.
    ///
    /// `old` names the tuple being displaced, if the caller already looked
    /// it up; a conflicting entry equal to `old` is not a violation. On
    /// error nothing has been modified.
    pub fn replace(&mut self, new: &TupleRef, old: Option<&TupleRef>) -> Result<(), IndexError> {
        // conflict probe over every unique index before any mutation
        for (n, index) in self.indexes.iter().enumerate() {
            if !index.unique() {
                continue;
            }
            if let Some(existing) = index.find_by_obj(new)? {
                let displaced_is_old = old
                    .map(|o| tuple::identity(o) == tuple::identity(&existing))
                    .unwrap_or(false);
                if !displaced_is_old {
                    return Err(IndexError::Violation { index: n });
                }
            }
        }

        if let Some(old) = old {
            for index in self.indexes.iter_mut() {
                index.remove(old)?;
            }
        }
        for index in self.indexes.iter_mut().skip(1) {
            index.replace(new)?;
        }
        self.indexes[PRIMARY].replace(new)?;
        Ok(())
    }

    /// Remove a tuple from every index.
    pub fn remove(&mut self, obj: &TupleRef) -> Result<(), IndexError> {
        for index in self.indexes.iter_mut() {
            index.remove(obj)?;
        }
        Ok(())
    }

    /// Verify that every index holds exactly the primary's tuples.
    /// Diagnostic; used by tests and the consistency check opcode.
    pub fn check_consistent(&self) -> bool {
        let primary = &self.indexes[PRIMARY];
        for index in &self.indexes[1..] {
            if index.size() != primary.size() {
                return false;
            }
        }
        for obj in primary.iter() {
            for index in &self.indexes[1..] {
                if !index.contains_obj(&obj) {
                    return false;
                }
            }
        }
        true
    }
}
