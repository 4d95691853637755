//! An ordered map from 32 bit hashes to values, kept balanced as a red-black
//! tree.
//!
//! Nodes live in an arena and refer to each other by index. Index `0` is the
//! shared black sentinel standing in for every leaf, so the rebalancing code
//! never has to special case missing children.

use std::cmp::Ordering;

const NIL: usize = 0;

struct Node<V> {
  key: u32,
  value: Option<V>,
  red: bool,
  left: usize,
  right: usize,
  parent: usize,
}
impl<V> Node<V> {
  fn sentinel() -> Self {
    Node {
      key: 0,
      value: None,
      red: false,
      left: NIL,
      right: NIL,
      parent: NIL,
    }
  }
}

pub struct RBTree<V> {
  nodes: Vec<Node<V>>,
  free: Vec<usize>,
  root: usize,
  size: usize,
}
impl<V> Default for RBTree<V> {
  fn default() -> Self {
    RBTree::new()
  }
}
impl<V> RBTree<V> {
  pub fn new() -> RBTree<V> {
    RBTree {
      nodes: vec![Node::sentinel()],
      free: Vec::new(),
      root: NIL,
      size: 0,
    }
  }

  pub fn len(&self) -> usize {
    self.size
  }

  pub fn is_empty(&self) -> bool {
    self.size == 0
  }

  /// Inserts `value` at `key`. Returns `false`, leaving the tree untouched,
  /// if `key` is already present.
  pub fn insert(&mut self, key: u32, value: V) -> bool {
    let mut parent = NIL;
    let mut cur = self.root;
    while cur != NIL {
      parent = cur;
      cur = match key.cmp(&self.nodes[cur].key) {
        Ordering::Less => self.nodes[cur].left,
        Ordering::Greater => self.nodes[cur].right,
        Ordering::Equal => return false,
      };
    }
    let z = self.alloc(key, value, parent);
    if parent == NIL {
      self.root = z;
    } else if key < self.nodes[parent].key {
      self.nodes[parent].left = z;
    } else {
      self.nodes[parent].right = z;
    }
    self.insert_fixup(z);
    self.size += 1;
    true
  }

  /// Removes the entry at `key`. Returns `false` if there was none.
  pub fn remove(&mut self, key: u32) -> bool {
    let z = self.find(key);
    if z == NIL {
      return false;
    }
    let mut removed_red = self.nodes[z].red;
    let x;
    if self.nodes[z].left == NIL {
      x = self.nodes[z].right;
      self.transplant(z, x);
    } else if self.nodes[z].right == NIL {
      x = self.nodes[z].left;
      self.transplant(z, x);
    } else {
      let y = self.minimum(self.nodes[z].right);
      removed_red = self.nodes[y].red;
      x = self.nodes[y].right;
      if self.nodes[y].parent == z {
        self.nodes[x].parent = y;
      } else {
        self.transplant(y, x);
        self.nodes[y].right = self.nodes[z].right;
        let r = self.nodes[y].right;
        self.nodes[r].parent = y;
      }
      self.transplant(z, y);
      self.nodes[y].left = self.nodes[z].left;
      let l = self.nodes[y].left;
      self.nodes[l].parent = y;
      self.nodes[y].red = self.nodes[z].red;
    }
    if !removed_red {
      self.remove_fixup(x);
    }
    self.release(z);
    self.nodes[NIL].parent = NIL;
    self.nodes[NIL].red = false;
    self.size -= 1;
    true
  }

  pub fn get(&self, key: u32) -> Option<&V> {
    self.nodes[self.find(key)].value.as_ref()
  }

  /// The entry with the smallest key.
  pub fn min(&self) -> Option<(u32, &V)> {
    self.entry(self.minimum(self.root))
  }

  /// Positioned at the first entry whose key is `>= key`, exhausted if there
  /// is none.
  pub fn lower_bound(&self, key: u32) -> Cursor<'_, V> {
    let mut found = NIL;
    let mut cur = self.root;
    while cur != NIL {
      if self.nodes[cur].key >= key {
        found = cur;
        cur = self.nodes[cur].left;
      } else {
        cur = self.nodes[cur].right;
      }
    }
    Cursor {
      tree: self,
      node: found,
    }
  }

  /// Positioned at the first entry whose key is `> key`, exhausted if there is
  /// none.
  pub fn upper_bound(&self, key: u32) -> Cursor<'_, V> {
    let mut cursor = self.lower_bound(key);
    while cursor.key() == Some(key) {
      cursor.next();
    }
    cursor
  }

  /// In-order traversal starting at the smallest key.
  pub fn iter(&self) -> Cursor<'_, V> {
    Cursor {
      tree: self,
      node: self.minimum(self.root),
    }
  }

  fn entry(&self, n: usize) -> Option<(u32, &V)> {
    let node = &self.nodes[n];
    node.value.as_ref().map(|v| (node.key, v))
  }

  fn find(&self, key: u32) -> usize {
    let mut cur = self.root;
    while cur != NIL {
      cur = match key.cmp(&self.nodes[cur].key) {
        Ordering::Less => self.nodes[cur].left,
        Ordering::Greater => self.nodes[cur].right,
        Ordering::Equal => return cur,
      };
    }
    NIL
  }

  fn minimum(&self, mut n: usize) -> usize {
    if n == NIL {
      return NIL;
    }
    while self.nodes[n].left != NIL {
      n = self.nodes[n].left;
    }
    n
  }

  fn successor(&self, mut n: usize) -> usize {
    if self.nodes[n].right != NIL {
      return self.minimum(self.nodes[n].right);
    }
    let mut p = self.nodes[n].parent;
    while p != NIL && n == self.nodes[p].right {
      n = p;
      p = self.nodes[p].parent;
    }
    p
  }

  fn alloc(&mut self, key: u32, value: V, parent: usize) -> usize {
    let node = Node {
      key: key,
      value: Some(value),
      red: true,
      left: NIL,
      right: NIL,
      parent: parent,
    };
    match self.free.pop() {
      Some(idx) => {
        self.nodes[idx] = node;
        idx
      }
      None => {
        self.nodes.push(node);
        self.nodes.len() - 1
      }
    }
  }

  fn release(&mut self, n: usize) {
    self.nodes[n] = Node::sentinel();
    self.free.push(n);
  }

  fn is_red(&self, n: usize) -> bool {
    self.nodes[n].red
  }

  fn rotate_left(&mut self, x: usize) {
    let y = self.nodes[x].right;
    let y_left = self.nodes[y].left;
    self.nodes[x].right = y_left;
    if y_left != NIL {
      self.nodes[y_left].parent = x;
    }
    let p = self.nodes[x].parent;
    self.nodes[y].parent = p;
    if p == NIL {
      self.root = y;
    } else if x == self.nodes[p].left {
      self.nodes[p].left = y;
    } else {
      self.nodes[p].right = y;
    }
    self.nodes[y].left = x;
    self.nodes[x].parent = y;
  }

  fn rotate_right(&mut self, x: usize) {
    let y = self.nodes[x].left;
    let y_right = self.nodes[y].right;
    self.nodes[x].left = y_right;
    if y_right != NIL {
      self.nodes[y_right].parent = x;
    }
    let p = self.nodes[x].parent;
    self.nodes[y].parent = p;
    if p == NIL {
      self.root = y;
    } else if x == self.nodes[p].right {
      self.nodes[p].right = y;
    } else {
      self.nodes[p].left = y;
    }
    self.nodes[y].right = x;
    self.nodes[x].parent = y;
  }

  fn insert_fixup(&mut self, mut z: usize) {
    while self.is_red(self.nodes[z].parent) {
      let p = self.nodes[z].parent;
      let g = self.nodes[p].parent;
      if p == self.nodes[g].left {
        let uncle = self.nodes[g].right;
        if self.is_red(uncle) {
          self.nodes[p].red = false;
          self.nodes[uncle].red = false;
          self.nodes[g].red = true;
          z = g;
        } else {
          if z == self.nodes[p].right {
            z = p;
            self.rotate_left(z);
          }
          let p = self.nodes[z].parent;
          let g = self.nodes[p].parent;
          self.nodes[p].red = false;
          self.nodes[g].red = true;
          self.rotate_right(g);
        }
      } else {
        let uncle = self.nodes[g].left;
        if self.is_red(uncle) {
          self.nodes[p].red = false;
          self.nodes[uncle].red = false;
          self.nodes[g].red = true;
          z = g;
        } else {
          if z == self.nodes[p].left {
            z = p;
            self.rotate_right(z);
          }
          let p = self.nodes[z].parent;
          let g = self.nodes[p].parent;
          self.nodes[p].red = false;
          self.nodes[g].red = true;
          self.rotate_left(g);
        }
      }
    }
    let root = self.root;
    self.nodes[root].red = false;
  }

  fn transplant(&mut self, u: usize, v: usize) {
    let p = self.nodes[u].parent;
    if p == NIL {
      self.root = v;
    } else if u == self.nodes[p].left {
      self.nodes[p].left = v;
    } else {
      self.nodes[p].right = v;
    }
    // The sentinel's parent is written on purpose: remove_fixup climbs from it.
    self.nodes[v].parent = p;
  }

  fn remove_fixup(&mut self, mut x: usize) {
    while x != self.root && !self.is_red(x) {
      let p = self.nodes[x].parent;
      if x == self.nodes[p].left {
        let mut w = self.nodes[p].right;
        if self.is_red(w) {
          self.nodes[w].red = false;
          self.nodes[p].red = true;
          self.rotate_left(p);
          w = self.nodes[self.nodes[x].parent].right;
        }
        if !self.is_red(self.nodes[w].left) && !self.is_red(self.nodes[w].right)
        {
          self.nodes[w].red = true;
          x = self.nodes[x].parent;
        } else {
          if !self.is_red(self.nodes[w].right) {
            let wl = self.nodes[w].left;
            self.nodes[wl].red = false;
            self.nodes[w].red = true;
            self.rotate_right(w);
            w = self.nodes[self.nodes[x].parent].right;
          }
          let p = self.nodes[x].parent;
          self.nodes[w].red = self.nodes[p].red;
          self.nodes[p].red = false;
          let wr = self.nodes[w].right;
          self.nodes[wr].red = false;
          self.rotate_left(p);
          x = self.root;
        }
      } else {
        let mut w = self.nodes[p].left;
        if self.is_red(w) {
          self.nodes[w].red = false;
          self.nodes[p].red = true;
          self.rotate_right(p);
          w = self.nodes[self.nodes[x].parent].left;
        }
        if !self.is_red(self.nodes[w].right) && !self.is_red(self.nodes[w].left)
        {
          self.nodes[w].red = true;
          x = self.nodes[x].parent;
        } else {
          if !self.is_red(self.nodes[w].left) {
            let wr = self.nodes[w].right;
            self.nodes[wr].red = false;
            self.nodes[w].red = true;
            self.rotate_left(w);
            w = self.nodes[self.nodes[x].parent].left;
          }
          let p = self.nodes[x].parent;
          self.nodes[w].red = self.nodes[p].red;
          self.nodes[p].red = false;
          let wl = self.nodes[w].left;
          self.nodes[wl].red = false;
          self.rotate_right(p);
          x = self.root;
        }
      }
    }
    self.nodes[x].red = false;
  }

  /// Walks the whole tree checking the red-black rules and key order, and
  /// returns the black height.
  #[cfg(test)]
  pub(crate) fn check(&self) -> usize {
    assert!(!self.is_red(self.root), "red root");
    assert!(!self.is_red(NIL), "red sentinel");
    self.check_node(self.root, None, None)
  }

  #[cfg(test)]
  fn check_node(&self, n: usize, lo: Option<u32>, hi: Option<u32>) -> usize {
    if n == NIL {
      return 1;
    }
    let node = &self.nodes[n];
    assert!(lo.map_or(true, |lo| node.key > lo), "order violated");
    assert!(hi.map_or(true, |hi| node.key < hi), "order violated");
    if node.red {
      assert!(!self.is_red(node.left), "red node with red left child");
      assert!(!self.is_red(node.right), "red node with red right child");
    }
    if node.left != NIL {
      assert_eq!(self.nodes[node.left].parent, n);
    }
    if node.right != NIL {
      assert_eq!(self.nodes[node.right].parent, n);
    }
    let left = self.check_node(node.left, lo, Some(node.key));
    let right = self.check_node(node.right, Some(node.key), hi);
    assert_eq!(left, right, "black height mismatch");
    left + if node.red { 0 } else { 1 }
  }
}

/// A position in an [`RBTree`]. Iterating yields the entry under the cursor
/// and then moves to its successor. Once past the last entry the cursor stays
/// exhausted.
pub struct Cursor<'a, V> {
  tree: &'a RBTree<V>,
  node: usize,
}
impl<'a, V> Cursor<'a, V> {
  pub fn key(&self) -> Option<u32> {
    self.tree.entry(self.node).map(|(k, _)| k)
  }

  pub fn value(&self) -> Option<&'a V> {
    self.tree.nodes[self.node].value.as_ref()
  }
}
impl<'a, V> Iterator for Cursor<'a, V> {
  type Item = (u32, &'a V);

  fn next(&mut self) -> Option<Self::Item> {
    let tree = self.tree;
    let item = tree.entry(self.node)?;
    self.node = tree.successor(self.node);
    Some(item)
  }
}

#[cfg(test)]
use proptest::prelude::*;

#[test]
fn test_insert_rejects_duplicates() {
  let mut tree = RBTree::new();
  assert!(tree.insert(10, "a"));
  assert!(tree.insert(5, "b"));
  assert!(!tree.insert(10, "c"));
  assert_eq!(tree.len(), 2);
  assert_eq!(tree.get(10), Some(&"a"));
  tree.check();
}

#[test]
fn test_remove_absent() {
  let mut tree = RBTree::new();
  assert!(!tree.remove(3));
  tree.insert(3, ());
  assert!(tree.remove(3));
  assert!(!tree.remove(3));
  assert!(tree.is_empty());
  assert!(tree.min().is_none());
  assert!(tree.iter().next().is_none());
}

#[test]
fn test_bounds() {
  let mut tree = RBTree::new();
  for k in &[10u32, 20, 30] {
    tree.insert(*k, *k * 2);
  }
  assert_eq!(tree.lower_bound(20).key(), Some(20));
  assert_eq!(tree.lower_bound(21).key(), Some(30));
  assert_eq!(tree.upper_bound(20).key(), Some(30));
  assert_eq!(tree.upper_bound(5).value(), Some(&20));
  assert_eq!(tree.upper_bound(30).key(), None);
  assert_eq!(tree.lower_bound(u32::MAX).key(), None);

  let mut cursor = tree.lower_bound(20);
  assert_eq!(cursor.next(), Some((20, &40)));
  assert_eq!(cursor.next(), Some((30, &60)));
  assert_eq!(cursor.next(), None);
  assert_eq!(cursor.next(), None);
  assert_eq!(tree.min(), Some((10, &20)));
}

#[test]
fn test_extreme_keys_are_ordered() {
  let mut tree = RBTree::new();
  tree.insert(u32::MAX, 'z');
  tree.insert(0, 'a');
  tree.insert(1 << 31, 'm');
  let keys = tree.iter().map(|(k, _)| k).collect::<Vec<_>>();
  assert_eq!(keys, vec![0, 1 << 31, u32::MAX]);
}

#[test]
fn test_sequential_inserts_and_removes_stay_balanced() {
  let mut tree = RBTree::new();
  for k in 0..2000u32 {
    assert!(tree.insert(k, k));
  }
  let height = tree.check();
  assert!(height <= 2 * 12);
  for k in (0..2000u32).step_by(3) {
    assert!(tree.remove(k));
    tree.check();
  }
  let keys = tree.iter().map(|(k, _)| k).collect::<Vec<_>>();
  let expected = (0..2000u32).filter(|k| k % 3 != 0).collect::<Vec<_>>();
  assert_eq!(keys, expected);
}

#[cfg(test)]
proptest! {
  #[test]
  fn prop_random_operations_hold_invariants(
    ops in prop::collection::vec((any::<bool>(), 0u32..512), 1..400)
  ) {
    let mut tree = RBTree::new();
    let mut model = std::collections::BTreeMap::new();
    for (insert, key) in ops {
      if insert {
        let fresh = !model.contains_key(&key);
        prop_assert_eq!(tree.insert(key, key), fresh);
        model.entry(key).or_insert(key);
      } else {
        prop_assert_eq!(tree.remove(key), model.remove(&key).is_some());
      }
      tree.check();
      prop_assert_eq!(tree.len(), model.len());
    }
    let keys = tree.iter().map(|(k, _)| k).collect::<Vec<_>>();
    let expected = model.keys().cloned().collect::<Vec<_>>();
    prop_assert_eq!(keys, expected);
  }
}
