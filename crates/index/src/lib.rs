//! In-memory indexes over tuple objects.
//!
//! Two shapes — open-addressed hashes and a weight-balanced
//! order-statistic tree — behind one closed variant set, plus the
//! per-table [`IndexSet`] whose replace protocol keeps every index of a
//! table holding exactly the same tuples.

pub mod error;
pub mod hash;
pub mod index;
pub mod key;
pub mod node;
pub mod set;
pub mod sptree;
pub mod tree;

pub use error::{IndexError, Result};
pub use index::{Index, IndexKind};
pub use key::{FieldType, FieldValue, KeyDef, KeyPart, KeyParts};
pub use node::{IndexNode, NodeCache, INDEX_NODE_CACHE};
pub use set::{IndexSet, PRIMARY};
pub use sptree::{SpTree, NIL};
pub use tree::TreeIndex;
