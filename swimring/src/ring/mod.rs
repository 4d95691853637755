//! Consistent hashing of keys onto cluster members.
//!
//! Every server owns `replica_points` positions on a 32 bit ring, one per
//! `hash(name + index)`. A key belongs to the server owning the first position
//! strictly after the key's hash, wrapping past the largest position back to
//! the smallest. Several positions per server spread load evenly and give
//! [`HashRing::lookup_n`] a diverse set of successors.

mod rbtree;

#[rustfmt::skip]
pub use {
  rbtree::Cursor,
  rbtree::RBTree,
};

use itertools::Itertools;
use metrics::gauge;
use std::collections::{BTreeSet, HashSet};
use tokio::sync::broadcast;
use tracing::debug;

/// The hash used to place servers and keys on the ring.
pub type HashFn = fn(&str) -> u32;

/// Default 32 bit hash for ring positions and checksums.
pub fn hash32(data: &str) -> u32 {
  wyhash::wyhash(data.as_bytes(), 0) as u32
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RingEvent {
  Added(String),
  Removed(String),
  ChecksumComputed { checksum: u32, old: Option<u32> },
  /// Emitted once per batched [`HashRing::add_remove_servers`] call that
  /// changed the ring.
  RingChanged { added: Vec<String>, removed: Vec<String> },
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RingStats {
  pub checksum: Option<u32>,
  pub servers: Vec<String>,
}

pub struct HashRing {
  replica_points: usize,
  hash: HashFn,
  tree: RBTree<String>,
  servers: BTreeSet<String>,
  checksum: Option<u32>,
  events: broadcast::Sender<RingEvent>,
}
impl HashRing {
  pub fn new(replica_points: usize) -> HashRing {
    HashRing::with_hash(replica_points, hash32)
  }

  pub fn with_hash(replica_points: usize, hash: HashFn) -> HashRing {
    let (events, _) = broadcast::channel(1024);
    HashRing {
      replica_points: replica_points,
      hash: hash,
      tree: RBTree::new(),
      servers: BTreeSet::new(),
      checksum: None,
      events: events,
    }
  }

  pub fn subscribe(&self) -> broadcast::Receiver<RingEvent> {
    self.events.subscribe()
  }

  /// `None` until the first add or remove.
  pub fn checksum(&self) -> Option<u32> {
    self.checksum
  }

  pub fn has_server(&self, name: &str) -> bool {
    self.servers.contains(name)
  }

  pub fn get_server_count(&self) -> usize {
    self.servers.len()
  }

  pub fn servers(&self) -> impl Iterator<Item = &String> {
    self.servers.iter()
  }

  pub fn add_server(&mut self, name: &str) -> bool {
    if !self.insert_points(name) {
      return false;
    }
    self.compute_checksum();
    self.emit(RingEvent::Added(name.to_string()));
    true
  }

  pub fn remove_server(&mut self, name: &str) -> bool {
    if !self.remove_points(name) {
      return false;
    }
    self.compute_checksum();
    self.emit(RingEvent::Removed(name.to_string()));
    true
  }

  /// Applies a batch of additions and removals, paying for one checksum
  /// computation and one `RingChanged` event however many servers moved.
  /// Returns whether the ring changed.
  pub fn add_remove_servers<A, R>(&mut self, to_add: A, to_remove: R) -> bool
  where
    A: IntoIterator,
    A::Item: AsRef<str>,
    R: IntoIterator,
    R::Item: AsRef<str>,
  {
    let mut added = Vec::new();
    let mut removed = Vec::new();
    for name in to_add {
      let name = name.as_ref();
      if self.insert_points(name) {
        self.emit(RingEvent::Added(name.to_string()));
        added.push(name.to_string());
      }
    }
    for name in to_remove {
      let name = name.as_ref();
      if self.remove_points(name) {
        self.emit(RingEvent::Removed(name.to_string()));
        removed.push(name.to_string());
      }
    }
    if added.is_empty() && removed.is_empty() {
      return false;
    }
    self.compute_checksum();
    debug!(
      added = added.len(),
      removed = removed.len(),
      servers = self.servers.len(),
      "ring changed"
    );
    self.emit(RingEvent::RingChanged {
      added: added,
      removed: removed,
    });
    true
  }

  /// The server owning `key`, or `None` on an empty ring.
  pub fn lookup(&self, key: &str) -> Option<&String> {
    let hash = (self.hash)(key);
    self
      .tree
      .upper_bound(hash)
      .value()
      .or_else(|| self.tree.min().map(|(_, v)| v))
  }

  /// Up to `n` distinct servers, in ring order starting with the owner of
  /// `key`.
  pub fn lookup_n(&self, key: &str, n: usize) -> Vec<String> {
    let n = n.min(self.servers.len());
    let mut result = Vec::with_capacity(n);
    if n == 0 {
      return result;
    }
    let mut seen = HashSet::with_capacity(n);
    let mut cursor = self.tree.upper_bound((self.hash)(key));
    if cursor.key().is_none() {
      cursor = self.tree.iter();
    }
    // The server set and the tree may disagree if two replica points
    // collided, so stop after one revolution even if `n` was not reached.
    let start = match cursor.key() {
      Some(k) => k,
      None => return result,
    };
    loop {
      match cursor.next() {
        Some((_, server)) => {
          if seen.insert(server.as_str()) {
            result.push(server.clone());
            if result.len() == n {
              break;
            }
          }
        }
        None => cursor = self.tree.iter(),
      }
      if cursor.key() == Some(start) {
        break;
      }
    }
    result
  }

  pub fn get_stats(&self) -> RingStats {
    RingStats {
      checksum: self.checksum,
      servers: self.servers.iter().cloned().collect(),
    }
  }

  fn insert_points(&mut self, name: &str) -> bool {
    if !self.servers.insert(name.to_string()) {
      return false;
    }
    for i in 0..self.replica_points {
      let point = (self.hash)(&format!("{}{}", name, i));
      self.tree.insert(point, name.to_string());
    }
    true
  }

  fn remove_points(&mut self, name: &str) -> bool {
    if !self.servers.remove(name) {
      return false;
    }
    for i in 0..self.replica_points {
      let point = (self.hash)(&format!("{}{}", name, i));
      self.tree.remove(point);
    }
    true
  }

  fn compute_checksum(&mut self) {
    // BTreeSet iteration is already sorted and unique.
    let joined = self.servers.iter().join(";");
    let checksum = (self.hash)(&joined);
    let old = self.checksum.replace(checksum);
    gauge!("swimring_ring_checksum").set(checksum as f64);
    gauge!("swimring_ring_servers").set(self.servers.len() as f64);
    self.emit(RingEvent::ChecksumComputed {
      checksum: checksum,
      old: old,
    });
  }

  fn emit(&self, event: RingEvent) {
    let _ = self.events.send(event);
  }
}

#[cfg(test)]
fn drain(rx: &mut broadcast::Receiver<RingEvent>) -> Vec<RingEvent> {
  std::iter::from_fn(|| rx.try_recv().ok()).collect()
}

#[cfg(test)]
fn servers(n: usize) -> Vec<String> {
  (0..n).map(|i| format!("127.0.0.1:{}", 3000 + i)).collect()
}

#[test]
fn test_checksum_starts_unset() {
  let mut ring = HashRing::new(10);
  assert_eq!(ring.checksum(), None);
  assert!(ring.lookup("key").is_none());
  ring.add_server("a");
  ring.remove_server("a");
  assert_eq!(ring.get_server_count(), 0);
  // An empty ring that has been computed is distinct from "never computed".
  assert_eq!(ring.checksum(), Some(hash32("")));
}

#[test]
fn test_add_and_remove_single_server() {
  let mut ring = HashRing::new(10);
  let mut rx = ring.subscribe();
  assert!(ring.add_server("a"));
  assert!(!ring.add_server("a"));
  assert_eq!(ring.tree.len(), 10);
  assert_eq!(ring.lookup("anything"), Some(&"a".to_string()));
  assert!(ring.remove_server("a"));
  assert!(!ring.remove_server("a"));
  assert!(ring.tree.is_empty());
  let events = drain(&mut rx);
  assert!(events.contains(&RingEvent::Added("a".to_string())));
  assert!(events.contains(&RingEvent::Removed("a".to_string())));
  assert!(!events
    .iter()
    .any(|e| matches!(e, RingEvent::RingChanged { .. })));
}

#[test]
fn test_batched_add_remove() {
  let mut ring = HashRing::new(100);
  let mut rx = ring.subscribe();
  let names = servers(1000);
  assert!(ring.add_remove_servers(&names, None::<&str>));
  assert_eq!(ring.get_server_count(), 1000);
  let changed = |events: &[RingEvent]| {
    events
      .iter()
      .filter(|e| matches!(e, RingEvent::RingChanged { .. }))
      .count()
  };
  let checksums = |events: &[RingEvent]| {
    events
      .iter()
      .filter(|e| matches!(e, RingEvent::ChecksumComputed { .. }))
      .count()
  };
  let events = drain(&mut rx);
  assert_eq!(changed(&events[..]), 1);
  assert_eq!(checksums(&events[..]), 1);

  let mut reversed = names.clone();
  reversed.reverse();
  assert!(ring.add_remove_servers(None::<&str>, &reversed));
  assert_eq!(ring.get_server_count(), 0);
  let events = drain(&mut rx);
  assert_eq!(changed(&events[..]), 1);

  assert!(!ring.add_remove_servers(None::<&str>, &reversed));
  assert!(drain(&mut rx).is_empty());
}

#[test]
fn test_checksum_independent_of_order() {
  let mut a = HashRing::new(20);
  let mut b = HashRing::new(20);
  a.add_server("s1");
  a.add_server("s2");
  b.add_server("s2");
  b.add_server("s1");
  assert_eq!(a.checksum(), b.checksum());
  assert_eq!(a.checksum(), Some(hash32("s1;s2")));
  assert_eq!(a.get_stats(), b.get_stats());
}

#[test]
fn test_lookup_is_deterministic_and_wraps() {
  fn ident(s: &str) -> u32 {
    s.trim_start_matches(|c: char| c.is_alphabetic())
      .parse()
      .unwrap_or(0)
  }
  let mut ring = HashRing::with_hash(1, ident);
  // Replica point of "a1" is hash("a10") == 10, "b5" sits at 50.
  ring.add_server("a1");
  ring.add_server("b5");
  assert_eq!(ring.lookup("k9"), Some(&"a1".to_string()));
  assert_eq!(ring.lookup("k10"), Some(&"b5".to_string()));
  assert_eq!(ring.lookup("k49"), Some(&"b5".to_string()));
  assert_eq!(ring.lookup("k50"), Some(&"a1".to_string()));
  assert_eq!(ring.lookup("k99"), Some(&"a1".to_string()));

  let mut ring = HashRing::new(100);
  ring.add_remove_servers(&servers(20), None::<&str>);
  for key in &["alpha", "beta", "gamma"] {
    assert_eq!(ring.lookup(key), ring.lookup(key));
  }
}

#[test]
fn test_lookup_n() {
  let mut ring = HashRing::new(100);
  assert!(ring.lookup_n("key", 3).is_empty());
  ring.add_remove_servers(&servers(5), None::<&str>);
  let found = ring.lookup_n("key", 3);
  assert_eq!(found.len(), 3);
  assert_eq!(found.iter().unique().count(), 3);
  assert_eq!(Some(&found[0]), ring.lookup("key"));
  let all = ring.lookup_n("key", 10);
  assert_eq!(all.len(), 5);
  assert_eq!(all.iter().unique().count(), 5);
  assert!(ring.lookup_n("key", 0).is_empty());
}

#[test]
fn test_lookup_n_bounded_on_drifted_ring() {
  fn collide(_: &str) -> u32 {
    7
  }
  let mut ring = HashRing::with_hash(3, collide);
  ring.add_server("a");
  ring.add_server("b");
  // Every replica point collided, so only "a" owns the single tree entry
  // while two servers are declared.
  assert_eq!(ring.get_server_count(), 2);
  assert_eq!(ring.lookup_n("key", 2), vec!["a".to_string()]);
  ring.remove_server("a");
  // Removing "a" deleted the only entry, leaving "b" declared but absent.
  assert_eq!(ring.get_server_count(), 1);
  assert!(ring.lookup_n("key", 1).is_empty());
  assert!(ring.lookup("key").is_none());
}
