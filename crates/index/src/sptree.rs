//! Weight-balanced search tree over a contiguous slot array.
//!
//! Nodes are `u32` slot indices into two parallel arrays — elements and
//! `{left, right}` child pointers — with [`NIL`] as the null sentinel and a
//! freelist of released slots threaded through the `left` pointer. There is
//! no per-node parent pointer and no balance metadata: after an insertion
//! that lands deeper than `log₁/α(size)` (α = 0.75), the nearest ancestor
//! whose subtree violates the bound is rebuilt into a perfectly balanced
//! subtree by flattening it into a list and rebuilding in place; after a
//! deletion that drops the size below `α · max_size` the whole tree is
//! rebuilt.
//!
//! Ordering is supplied by the caller as a three-way comparator object so
//! the same element type can be ordered with or without an identity
//! tie-break.

use std::cmp::Ordering;

/// Null slot sentinel.
pub const NIL: u32 = u32::MAX;

/// Rebalance threshold. A node at depth `d` is acceptable while
/// `d ≤ log₁/α(size)`.
pub const ALPHA: f64 = 0.75;

fn count_alpha(size: u32) -> f64 {
    ((size as f64).ln() / (1.0 / ALPHA).ln()).floor()
}

/// Three-way ordering over tree elements.
///
/// `probe` comparisons pass the search pattern as `a`, so a comparator may
/// treat patterns with fewer key fields as prefix-equal.
pub trait NodeOrd<T> {
    /// Compare two elements (or a pattern against an element).
    fn cmp(&self, a: &T, b: &T) -> Ordering;
}

impl<T, F> NodeOrd<T> for F
where
    F: Fn(&T, &T) -> Ordering,
{
    fn cmp(&self, a: &T, b: &T) -> Ordering {
        self(a, b)
    }
}

/// The tree. `O` orders elements; elements live inline in slot order, not
/// key order.
pub struct SpTree<T, O: NodeOrd<T>> {
    members: Vec<Option<T>>,
    lr: Vec<[u32; 2]>,
    ord: O,

    root: u32,
    garbage_head: u32,
    size: u32,
    max_size: u32,
    max_depth: u32,
}

const L: usize = 0;
const R: usize = 1;

impl<T, O: NodeOrd<T>> SpTree<T, O> {
    /// Create an empty tree ordered by `ord`.
    pub fn new(ord: O) -> Self {
        SpTree {
            members: Vec::new(),
            lr: Vec::new(),
            ord,
            root: NIL,
            garbage_head: NIL,
            size: 0,
            max_size: 0,
            max_depth: 0,
        }
    }

    /// Number of live elements.
    pub fn size(&self) -> u32 {
        self.size
    }

    /// True when the tree holds no elements.
    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    /// Approximate heap footprint of the slot arrays.
    pub fn bytes(&self) -> usize {
        std::mem::size_of::<Self>()
            + self.members.capacity() * std::mem::size_of::<Option<T>>()
            + self.lr.capacity() * std::mem::size_of::<[u32; 2]>()
    }

    fn elem(&self, node: u32) -> &T {
        self.members[node as usize]
            .as_ref()
            .expect("live tree node has an element")
    }

    /// Find an element equal to `key` under the tree order.
    pub fn find(&self, key: &T) -> Option<&T> {
        let mut node = self.root;
        while node != NIL {
            match self.ord.cmp(key, self.elem(node)) {
                Ordering::Greater => node = self.lr[node as usize][R],
                Ordering::Less => node = self.lr[node as usize][L],
                Ordering::Equal => return Some(self.elem(node)),
            }
        }
        None
    }

    /// Take a slot from the freelist, or grow the arrays.
    fn get_place(&mut self) -> u32 {
        let node;
        if self.garbage_head != NIL {
            node = self.garbage_head;
            self.garbage_head = self.lr[node as usize][L];
        } else {
            node = self.members.len() as u32;
            self.members.push(None);
            self.lr.push([NIL, NIL]);
        }
        self.lr[node as usize] = [NIL, NIL];
        node
    }

    fn size_of_subtree(&self, node: u32) -> u32 {
        if node == NIL {
            return 0;
        }
        1 + self.size_of_subtree(self.lr[node as usize][L])
            + self.size_of_subtree(self.lr[node as usize][R])
    }

    /// Flatten `root` into a right-linked in-order list ending at `head`;
    /// returns the new list head.
    fn flatten_tree(&mut self, root: u32, head: u32) -> u32 {
        if root == NIL {
            return head;
        }
        let right = self.lr[root as usize][R];
        let node = self.flatten_tree(right, head);
        self.lr[root as usize][R] = node;
        let left = self.lr[root as usize][L];
        self.flatten_tree(left, root)
    }

    /// Rebuild a perfectly balanced subtree from a right-linked list of
    /// `size` nodes starting at `node`; returns the list remainder head.
    fn build_tree(&mut self, node: u32, size: u32) -> u32 {
        if size == 0 {
            self.lr[node as usize][L] = NIL;
            return node;
        }
        let half_up = ((size - 1) as f64 / 2.0).ceil() as u32;
        let half_down = ((size - 1) as f64 / 2.0).floor() as u32;
        let root = self.build_tree(node, half_up);
        let next = self.lr[root as usize][R];
        let list = self.build_tree(next, half_down);
        let tmp = self.lr[list as usize][L];
        self.lr[root as usize][R] = tmp;
        self.lr[list as usize][L] = root;
        list
    }

    /// Rebuild the subtree rooted at `node` (of `size` elements) into a
    /// balanced one; the scratch slot goes back to the freelist.
    fn balance(&mut self, node: u32, size: u32) -> u32 {
        let fake = self.get_place();
        let z = self.flatten_tree(node, fake);
        self.build_tree(z, size);

        let new_root = self.lr[fake as usize][L];
        self.lr[fake as usize][L] = self.garbage_head;
        self.members[fake as usize] = None;
        self.garbage_head = fake;
        new_root
    }

    /// Insert `value`, replacing and returning any element equal to it
    /// under the tree order.
    pub fn insert_or_replace(&mut self, value: T) -> Option<T> {
        if self.root == NIL {
            self.members.clear();
            self.lr.clear();
            self.members.push(Some(value));
            self.lr.push([NIL, NIL]);
            self.root = 0;
            self.garbage_head = NIL;
            self.size = 1;
            if self.max_size < 1 {
                self.max_size = 1;
            }
            return None;
        }

        let mut path: Vec<u32> = Vec::with_capacity(self.max_depth as usize + 2);
        let mut parent = self.root;
        let node;
        loop {
            match self.ord.cmp(&value, self.elem(parent)) {
                Ordering::Equal => {
                    return self.members[parent as usize].replace(value);
                }
                Ordering::Greater => {
                    path.push(parent);
                    let right = self.lr[parent as usize][R];
                    if right == NIL {
                        node = self.get_place();
                        self.members[node as usize] = Some(value);
                        self.lr[parent as usize][R] = node;
                        break;
                    }
                    parent = right;
                }
                Ordering::Less => {
                    path.push(parent);
                    let left = self.lr[parent as usize][L];
                    if left == NIL {
                        node = self.get_place();
                        self.members[node as usize] = Some(value);
                        self.lr[parent as usize][L] = node;
                        break;
                    }
                    parent = left;
                }
            }
        }

        let depth = path.len() as u32;
        self.size += 1;
        if self.size > self.max_size {
            self.max_size = self.size;
        }
        if depth > self.max_depth {
            self.max_depth = depth;
        }

        if depth as f64 > count_alpha(self.size) {
            // climb towards the root until an ancestor's subtree violates
            // the depth bound, then rebuild that subtree
            path.push(node);
            let depth = depth as usize;
            let mut size = 1u32;
            for i in 1.. {
                if i < depth {
                    let parent = path[depth - i];
                    let sibling = if self.lr[parent as usize][R] == path[depth - i + 1] {
                        self.lr[parent as usize][L]
                    } else {
                        self.lr[parent as usize][R]
                    };
                    size += 1 + self.size_of_subtree(sibling);
                    if i as f64 > count_alpha(size) {
                        let n = self.balance(parent, size);
                        let pp = path[depth - i - 1];
                        if self.lr[pp as usize][L] == parent {
                            self.lr[pp as usize][L] = n;
                        } else {
                            self.lr[pp as usize][R] = n;
                        }
                        break;
                    }
                } else {
                    self.root = self.balance(self.root, self.size);
                    self.max_size = self.size;
                    break;
                }
            }
        }
        None
    }

    /// Remove and return the element equal to `key` under the tree order.
    pub fn delete(&mut self, key: &T) -> Option<T> {
        let mut node = self.root;
        let mut parent = NIL;
        let mut lr = L;
        let removed;
        loop {
            if node == NIL {
                return None;
            }
            match self.ord.cmp(key, self.elem(node)) {
                Ordering::Greater => {
                    parent = node;
                    node = self.lr[node as usize][R];
                    lr = R;
                }
                Ordering::Less => {
                    parent = node;
                    node = self.lr[node as usize][L];
                    lr = L;
                }
                Ordering::Equal => {
                    let [left, right] = self.lr[node as usize];
                    if left == NIL && right == NIL {
                        if parent == NIL {
                            self.root = NIL;
                        } else {
                            self.lr[parent as usize][lr] = NIL;
                        }
                    } else if left == NIL {
                        if parent == NIL {
                            self.root = right;
                        } else {
                            self.lr[parent as usize][lr] = right;
                        }
                    } else if right == NIL {
                        if parent == NIL {
                            self.root = left;
                        } else {
                            self.lr[parent as usize][lr] = left;
                        }
                    } else {
                        // interior node: replace with the in-order
                        // predecessor and free that slot instead
                        let mut todel_parent = NIL;
                        let mut todel = left;
                        while self.lr[todel as usize][R] != NIL {
                            todel_parent = todel;
                            todel = self.lr[todel as usize][R];
                        }
                        let pred = self.members[todel as usize].take();
                        removed = self.members[node as usize].take();
                        self.members[node as usize] = pred;
                        let todel_left = self.lr[todel as usize][L];
                        if todel_parent != NIL {
                            self.lr[todel_parent as usize][R] = todel_left;
                        } else {
                            self.lr[node as usize][L] = todel_left;
                        }
                        self.lr[todel as usize][L] = self.garbage_head;
                        self.garbage_head = todel;
                        break;
                    }

                    removed = self.members[node as usize].take();
                    self.lr[node as usize][L] = self.garbage_head;
                    self.garbage_head = node;
                    break;
                }
            }
        }

        self.size -= 1;
        if self.size > 0 && (self.size as f64) < ALPHA * self.max_size as f64 {
            self.root = self.balance(self.root, self.size);
            self.max_size = self.size;
        }
        removed
    }

    /// In-order iterator over the whole tree.
    pub fn iter(&self) -> SpTreeIter<'_, T, O> {
        let mut it = SpTreeIter {
            tree: self,
            stack: Vec::with_capacity(self.max_depth as usize + 1),
        };
        let mut node = self.root;
        while node != NIL {
            it.stack.push(node);
            node = self.lr[node as usize][L];
        }
        it
    }

    /// In-order iterator starting at the first element ≥ `key`.
    ///
    /// When several elements compare equal to `key` (a partial pattern on
    /// a non-unique order), iteration starts at the first of them.
    pub fn iter_from(&self, key: &T) -> SpTreeIter<'_, T, O> {
        let mut it = SpTreeIter {
            tree: self,
            stack: Vec::with_capacity(self.max_depth as usize + 1),
        };
        let mut last_eq_len = 0usize;
        let mut node = self.root;
        while node != NIL {
            match self.ord.cmp(key, self.elem(node)) {
                Ordering::Greater => {
                    // smaller than the probe: not part of the result, so
                    // it is not kept on the ancestor stack
                    node = self.lr[node as usize][R];
                }
                Ordering::Less => {
                    it.stack.push(node);
                    node = self.lr[node as usize][L];
                }
                Ordering::Equal => {
                    it.stack.push(node);
                    last_eq_len = it.stack.len();
                    node = self.lr[node as usize][L];
                }
            }
        }
        if last_eq_len > 0 {
            it.stack.truncate(last_eq_len);
        }
        it
    }

    /// Depth of the deepest node, by traversal. Intended for diagnostics
    /// and tests.
    pub fn height(&self) -> u32 {
        fn rec<T, O: NodeOrd<T>>(t: &SpTree<T, O>, node: u32) -> u32 {
            if node == NIL {
                return 0;
            }
            1 + rec(t, t.lr[node as usize][L]).max(rec(t, t.lr[node as usize][R]))
        }
        rec(self, self.root)
    }
}

/// Ancestor-stack iterator. A fresh iterator observes the tree as of its
/// creation; restart by creating a new one.
pub struct SpTreeIter<'a, T, O: NodeOrd<T>> {
    tree: &'a SpTree<T, O>,
    stack: Vec<u32>,
}

impl<'a, T, O: NodeOrd<T>> Iterator for SpTreeIter<'a, T, O> {
    type Item = &'a T;

    fn next(&mut self) -> Option<&'a T> {
        let top = self.stack.pop()?;
        let mut node = self.tree.lr[top as usize][R];
        while node != NIL {
            self.stack.push(node);
            node = self.tree.lr[node as usize][L];
        }
        Some(self.tree.elem(top))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use rand::prelude::*;
    use rand::Rng as _;

    fn u32_tree() -> SpTree<u32, fn(&u32, &u32) -> Ordering> {
        SpTree::new(|a: &u32, b: &u32| a.cmp(b))
    }

    fn collect<O: NodeOrd<u32>>(t: &SpTree<u32, O>) -> Vec<u32> {
        t.iter().copied().collect()
    }

    #[test]
    fn insert_find_delete() {
        let mut t = u32_tree();
        for v in [5u32, 1, 9, 3, 7] {
            assert!(t.insert_or_replace(v).is_none());
        }
        assert_eq!(t.size(), 5);
        assert_eq!(t.find(&3), Some(&3));
        assert_eq!(t.find(&4), None);
        assert_eq!(t.delete(&3), Some(3));
        assert_eq!(t.delete(&3), None);
        assert_eq!(t.size(), 4);
        assert_eq!(collect(&t), vec![1, 5, 7, 9]);
    }

    #[test]
    fn replace_returns_old() {
        let mut t = SpTree::new(|a: &(u32, u32), b: &(u32, u32)| a.0.cmp(&b.0));
        t.insert_or_replace((1, 100));
        let old = t.insert_or_replace((1, 200));
        assert_eq!(old, Some((1, 100)));
        assert_eq!(t.size(), 1);
        assert_eq!(t.find(&(1, 0)).unwrap().1, 200);
    }

    #[test]
    fn sorted_iteration_after_random_ops() {
        let mut rng = StdRng::seed_from_u64(0x5eed);
        let mut t = u32_tree();
        let mut model = std::collections::BTreeSet::new();
        for _ in 0..4000 {
            let v = rng.gen_range(0..1000u32);
            if rng.gen_bool(0.6) {
                t.insert_or_replace(v);
                model.insert(v);
            } else {
                assert_eq!(t.delete(&v).is_some(), model.remove(&v));
            }
        }
        let got = collect(&t);
        let want: Vec<u32> = model.iter().copied().collect();
        assert_eq!(got, want);
        assert_eq!(t.size() as usize, model.len());
    }

    #[test]
    fn height_stays_logarithmic() {
        let mut t = u32_tree();
        // ascending insertion is the worst case for a naive BST
        for v in 0..4096u32 {
            t.insert_or_replace(v);
        }
        let bound = ((t.size() as f64).ln() / (1.0 / ALPHA).ln()).ceil() as u32 + 2;
        assert!(
            t.height() <= bound,
            "height {} exceeds bound {}",
            t.height(),
            bound
        );
    }

    #[test]
    fn shrink_rebuild_after_deletes() {
        let mut t = u32_tree();
        for v in 0..1024u32 {
            t.insert_or_replace(v);
        }
        for v in 0..1000u32 {
            assert!(t.delete(&v).is_some());
        }
        assert_eq!(t.size(), 24);
        assert_eq!(collect(&t), (1000..1024).collect::<Vec<_>>());
        let bound = ((t.size() as f64).ln() / (1.0 / ALPHA).ln()).ceil() as u32 + 2;
        assert!(t.height() <= bound);
    }

    #[test]
    fn delete_to_empty_and_reuse() {
        let mut t = u32_tree();
        for round in 0..3 {
            for v in 0..50u32 {
                t.insert_or_replace(v * 2);
            }
            assert_eq!(t.size(), 50, "round {}", round);
            for v in 0..50u32 {
                assert!(t.delete(&(v * 2)).is_some());
            }
            assert!(t.is_empty());
            assert_eq!(t.find(&0), None);
        }
    }

    #[test]
    fn iter_from_starts_at_first_equal_element() {
        // a sentinel second component marks probes; the order treats a
        // probe as equal to every element sharing its first component, the
        // way a partial key pattern matches a run in a non-unique index
        const PROBE: u32 = u32::MAX;
        let order = |a: &(u32, u32), b: &(u32, u32)| {
            let by_key = a.0.cmp(&b.0);
            if a.1 == PROBE || b.1 == PROBE {
                by_key
            } else {
                by_key.then(a.1.cmp(&b.1))
            }
        };
        let mut t = SpTree::new(order);
        for (k, s) in [(1, 0), (2, 0), (2, 1), (2, 2), (3, 0), (5, 0)] {
            t.insert_or_replace((k, s));
        }

        let run: Vec<(u32, u32)> = t.iter_from(&(2, PROBE)).copied().collect();
        assert_eq!(run, vec![(2, 0), (2, 1), (2, 2), (3, 0), (5, 0)]);

        // an exact element starts iteration at itself
        let mid: Vec<(u32, u32)> = t.iter_from(&(2, 1)).copied().collect();
        assert_eq!(mid, vec![(2, 1), (2, 2), (3, 0), (5, 0)]);

        // a probe past the maximum yields nothing
        let past: Vec<(u32, u32)> = t.iter_from(&(9, PROBE)).copied().collect();
        assert!(past.is_empty());

        // a probe between runs starts at the next greater element
        let between: Vec<(u32, u32)> = t.iter_from(&(4, PROBE)).copied().collect();
        assert_eq!(between, vec![(5, 0)]);
    }

    proptest! {
        #[test]
        fn matches_btreeset_model(ops in proptest::collection::vec((any::<bool>(), 0u32..200), 0..400)) {
            let mut t = u32_tree();
            let mut model = std::collections::BTreeSet::new();
            for (insert, v) in ops {
                if insert {
                    t.insert_or_replace(v);
                    model.insert(v);
                } else {
                    prop_assert_eq!(t.delete(&v).is_some(), model.remove(&v));
                }
            }
            prop_assert_eq!(collect(&t), model.iter().copied().collect::<Vec<_>>());
            prop_assert_eq!(t.size() as usize, model.len());
        }
    }
}
