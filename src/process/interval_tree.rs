//! Augmented AVL tree of inclusive `[start, last]` intervals.
//!
//! Nodes are ordered by `(start, key)`, where `key` is a caller-chosen tiebreak that makes
//! every entry unique. Each node caches the largest `last` of its subtree so overlap
//! queries skip subtrees that end before the query begins.

use std::cmp::Ordering;

type Link<V> = Option<Box<Node<V>>>;

#[derive(Debug)]
struct Node<V> {
    start: u64,
    last: u64,
    key: u64,
    value: V,
    subtree_last: u64,
    height: i32,
    left: Link<V>,
    right: Link<V>,
}

impl<V> Node<V> {
    fn new(start: u64, last: u64, key: u64, value: V) -> Box<Self> {
        Box::new(Self {
            start,
            last,
            key,
            value,
            subtree_last: last,
            height: 1,
            left: None,
            right: None,
        })
    }

    fn order(&self, start: u64, key: u64) -> Ordering {
        (start, key).cmp(&(self.start, self.key))
    }

    fn update(&mut self) {
        let mut subtree_last = self.last;
        let mut height = 0;
        for child in [&self.left, &self.right].into_iter().flatten() {
            subtree_last = subtree_last.max(child.subtree_last);
            height = height.max(child.height);
        }
        self.subtree_last = subtree_last;
        self.height = height + 1;
    }
}

fn height<V>(link: &Link<V>) -> i32 {
    link.as_ref().map_or(0, |n| n.height)
}

fn rotate_right<V>(mut node: Box<Node<V>>) -> Box<Node<V>> {
    let Some(mut pivot) = node.left.take() else {
        return node;
    };
    node.left = pivot.right.take();
    node.update();
    pivot.right = Some(node);
    pivot.update();
    pivot
}

fn rotate_left<V>(mut node: Box<Node<V>>) -> Box<Node<V>> {
    let Some(mut pivot) = node.right.take() else {
        return node;
    };
    node.right = pivot.left.take();
    node.update();
    pivot.left = Some(node);
    pivot.update();
    pivot
}

fn rebalance<V>(mut node: Box<Node<V>>) -> Box<Node<V>> {
    node.update();
    let balance = height(&node.left) - height(&node.right);

    if balance > 1 {
        if let Some(left) = node.left.take() {
            node.left = Some(if height(&left.left) < height(&left.right) {
                rotate_left(left)
            } else {
                left
            });
        }
        return rotate_right(node);
    }
    if balance < -1 {
        if let Some(right) = node.right.take() {
            node.right = Some(if height(&right.right) < height(&right.left) {
                rotate_right(right)
            } else {
                right
            });
        }
        return rotate_left(node);
    }
    node
}

fn insert<V>(link: Link<V>, new: Box<Node<V>>) -> Box<Node<V>> {
    let Some(mut node) = link else {
        return new;
    };
    if node.order(new.start, new.key) == Ordering::Less {
        node.left = Some(insert(node.left.take(), new));
    } else {
        node.right = Some(insert(node.right.take(), new));
    }
    rebalance(node)
}

/// Detaches the leftmost node of a subtree, returning it and the remaining subtree.
fn take_min<V>(mut node: Box<Node<V>>) -> (Box<Node<V>>, Link<V>) {
    match node.left.take() {
        None => {
            let rest = node.right.take();
            (node, rest)
        }
        Some(left) => {
            let (min, rest) = take_min(left);
            node.left = rest;
            (min, Some(rebalance(node)))
        }
    }
}

fn remove<V>(link: Link<V>, start: u64, key: u64, out: &mut Option<V>) -> Link<V> {
    let mut node = link?;
    match node.order(start, key) {
        Ordering::Less => node.left = remove(node.left.take(), start, key, out),
        Ordering::Greater => node.right = remove(node.right.take(), start, key, out),
        Ordering::Equal => {
            let Node {
                value, left, right, ..
            } = *node;
            *out = Some(value);
            return match (left, right) {
                (None, None) => None,
                (Some(child), None) | (None, Some(child)) => Some(child),
                (Some(left), Some(right)) => {
                    let (mut successor, rest) = take_min(right);
                    successor.left = Some(left);
                    successor.right = rest;
                    Some(rebalance(successor))
                }
            };
        }
    }
    Some(rebalance(node))
}

fn collect_overlaps<'a, V>(link: &'a Link<V>, start: u64, last: u64, limit: usize, out: &mut Vec<&'a V>) {
    let Some(node) = link else {
        return;
    };
    if out.len() >= limit || node.subtree_last < start {
        return;
    }
    collect_overlaps(&node.left, start, last, limit, out);
    if out.len() >= limit || node.start > last {
        return;
    }
    if node.last >= start {
        out.push(&node.value);
    }
    collect_overlaps(&node.right, start, last, limit, out);
}

#[derive(Debug)]
pub struct IntervalTree<V> {
    root: Link<V>,
    len: usize,
}

impl<V> Default for IntervalTree<V> {
    fn default() -> Self {
        Self { root: None, len: 0 }
    }
}

impl<V> IntervalTree<V> {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub const fn len(&self) -> usize {
        self.len
    }

    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Inserts `[start, last]`. `key` must be unique among entries with the same start.
    pub fn insert(&mut self, start: u64, last: u64, key: u64, value: V) {
        debug_assert!(start <= last);
        self.root = Some(insert(self.root.take(), Node::new(start, last, key, value)));
        self.len += 1;
    }

    pub fn remove(&mut self, start: u64, key: u64) -> Option<V> {
        let mut out = None;
        self.root = remove(self.root.take(), start, key, &mut out);
        if out.is_some() {
            self.len -= 1;
        }
        out
    }

    /// Up to `limit` values whose interval overlaps `[start, last]`, in start order.
    #[must_use]
    pub fn overlapping(&self, start: u64, last: u64, limit: usize) -> Vec<&V> {
        let mut out = Vec::new();
        collect_overlaps(&self.root, start, last, limit, &mut out);
        out
    }

    #[cfg(test)]
    fn check(&self) {
        fn walk<V>(link: &Link<V>) -> (i32, u64, usize) {
            let Some(n) = link else {
                return (0, 0, 0);
            };
            let (lh, lmax, lc) = walk(&n.left);
            let (rh, rmax, rc) = walk(&n.right);
            assert!((lh - rh).abs() <= 1, "unbalanced");
            assert_eq!(n.height, lh.max(rh) + 1);
            assert_eq!(n.subtree_last, n.last.max(lmax).max(rmax));
            (n.height, n.subtree_last, lc + rc + 1)
        }
        assert_eq!(walk(&self.root).2, self.len);
    }
}
