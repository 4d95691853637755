use crate::membership::rules::*;
use crate::membership::{
  merge_snapshots, now_millis, Change, Member, Snapshot, Status,
};
use crate::ring::{hash32, HashFn};
use hashbrown::HashMap;
use itertools::Itertools;
use metrics::{counter, gauge};
use rand::seq::{IteratorRandom, SliceRandom};
use rand::{thread_rng, Rng};
use tokio::sync::broadcast;
use tracing::{debug, trace, warn};

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum MembershipEvent {
  /// The changes applied by one [`Membership::update`] call, in the order
  /// they were given.
  Updated(Vec<Change>),
  /// The changes applied while adopting join snapshots.
  Set(Vec<Change>),
  ChecksumComputed { checksum: u32, old: Option<u32> },
}

/// Until the local member has finished joining, changes from peers are held
/// back and replayed in arrival order afterwards.
enum Gate {
  NotReady(Vec<Change>),
  Ready,
}

/// The local view of every member ever seen. Rows are never deleted; departed
/// members stay as `leave`, `faulty` or `tombstone` so that stale gossip about
/// them resolves against a known incarnation.
pub struct Membership {
  local_address: String,
  members: Vec<Member>,
  index: HashMap<String, usize>,
  checksum: Option<u32>,
  gate: Gate,
  hash: HashFn,
  events: broadcast::Sender<MembershipEvent>,
}
impl Membership {
  pub fn new(local_address: String) -> Membership {
    Membership::with_hash(local_address, hash32)
  }

  pub fn with_hash(local_address: String, hash: HashFn) -> Membership {
    let (events, _) = broadcast::channel(1024);
    Membership {
      local_address: local_address,
      members: Vec::new(),
      index: HashMap::new(),
      checksum: None,
      gate: Gate::NotReady(Vec::new()),
      hash: hash,
      events: events,
    }
  }

  pub fn subscribe(&self) -> broadcast::Receiver<MembershipEvent> {
    self.events.subscribe()
  }

  pub fn local_address(&self) -> &str {
    &self.local_address
  }

  pub fn local_member(&self) -> Option<&Member> {
    self.find(&self.local_address)
  }

  pub fn local_incarnation(&self) -> u64 {
    self.local_member().map_or(0, |m| m.incarnation_number)
  }

  pub fn find(&self, address: &str) -> Option<&Member> {
    self.index.get(address).map(|i| &self.members[*i])
  }

  /// Members in table order, which is the randomized position each one was
  /// inserted at.
  pub fn members(&self) -> &[Member] {
    &self.members
  }

  pub fn len(&self) -> usize {
    self.members.len()
  }

  pub fn is_empty(&self) -> bool {
    self.members.is_empty()
  }

  pub fn checksum(&self) -> Option<u32> {
    self.checksum
  }

  pub fn is_ready(&self) -> bool {
    matches!(self.gate, Gate::Ready)
  }

  pub fn stashed(&self) -> usize {
    match &self.gate {
      Gate::NotReady(stash) => stash.len(),
      Gate::Ready => 0,
    }
  }

  /// The whole table as changes sourced from the local member, used for join
  /// responses and full syncs.
  pub fn snapshot(&self) -> Vec<Change> {
    let inc = self.local_incarnation();
    self
      .members
      .iter()
      .map(|m| Change::from_member(m, &self.local_address, inc))
      .collect()
  }

  /// Applies `changes` in order and returns the subset that took effect.
  ///
  /// Before the gate opens only the local member asserting its own aliveness
  /// (`local_alive`) gets through; everything else is stashed.
  pub fn update(
    &mut self,
    changes: Vec<Change>,
    local_alive: bool,
  ) -> Vec<Change> {
    if let Gate::NotReady(stash) = &mut self.gate {
      if !local_alive {
        let before = stash.len();
        stash.extend(changes.into_iter().filter(|c| !c.is_malformed()));
        trace!(stashed = stash.len() - before, "membership not ready");
        return Vec::new();
      }
    }
    let mut applied = Vec::new();
    for change in changes {
      if change.is_malformed() {
        continue;
      }
      if let Some(change) = self.apply(change) {
        applied.push(change);
      }
    }
    if !applied.is_empty() {
      counter!("swimring_membership_updates").increment(applied.len() as u64);
      self.recompute_checksum();
      self.emit(MembershipEvent::Updated(applied.clone()));
    }
    applied
  }

  /// Adopts the snapshots gathered while joining. Claims about the local
  /// member are never taken from peers.
  pub fn set(&mut self, snapshots: Vec<Snapshot>) -> Vec<Change> {
    let stash = match &mut self.gate {
      Gate::NotReady(stash) => std::mem::take(stash),
      Gate::Ready => Vec::new(),
    };
    let merged = merge_snapshots(&self.local_address, &snapshots, &stash);
    if !merged.consumed_stash {
      if let Gate::NotReady(slot) = &mut self.gate {
        *slot = stash;
      }
    }
    let mut applied = Vec::new();
    for change in merged.changes {
      if change.address == self.local_address || change.is_malformed() {
        continue;
      }
      let differs = self.find(&change.address).map_or(true, |m| {
        m.status != change.status
          || m.incarnation_number != change.incarnation_number
      });
      if differs {
        self.put(Member::from(&change));
        applied.push(change);
      }
    }
    debug!(
      snapshots = snapshots.len(),
      applied = applied.len(),
      "membership set"
    );
    self.recompute_checksum();
    self.emit(MembershipEvent::Set(applied.clone()));
    applied
  }

  /// Opens the gate and replays whatever was stashed, returning the changes
  /// that took effect.
  pub fn make_ready(&mut self) -> Vec<Change> {
    match std::mem::replace(&mut self.gate, Gate::Ready) {
      Gate::NotReady(stash) if !stash.is_empty() => {
        debug!(stashed = stash.len(), "replaying stashed changes");
        self.update(stash, false)
      }
      _ => Vec::new(),
    }
  }

  pub fn make_alive(&mut self, address: &str, inc: u64) -> Vec<Change> {
    let local = address == self.local_address;
    let change = self.local_change(address, Status::Alive, inc);
    self.update(vec![change], local)
  }

  pub fn make_suspect(&mut self, address: &str, inc: u64) -> Vec<Change> {
    let change = self.local_change(address, Status::Suspect, inc);
    self.update(vec![change], false)
  }

  pub fn make_faulty(&mut self, address: &str, inc: u64) -> Vec<Change> {
    let change = self.local_change(address, Status::Faulty, inc);
    self.update(vec![change], false)
  }

  pub fn make_leave(&mut self, address: &str, inc: u64) -> Vec<Change> {
    let change = self.local_change(address, Status::Leave, inc);
    self.update(vec![change], false)
  }

  pub fn make_tombstone(&mut self, address: &str, inc: u64) -> Vec<Change> {
    let change = self.local_change(address, Status::Tombstone, inc);
    self.update(vec![change], false)
  }

  /// An incarnation number for the local member that is strictly greater
  /// than its current one.
  pub fn fresh_incarnation(&self) -> u64 {
    now_millis().max(self.local_incarnation() + 1)
  }

  /// Hash of every member's checksum string, sorted and joined by `;`.
  pub fn compute_checksum(&self) -> u32 {
    let joined = self
      .members
      .iter()
      .map(Member::checksum_string)
      .sorted()
      .join(";");
    (self.hash)(&joined)
  }

  /// Up to `n` alive or suspect members in random order, never the local
  /// member nor anything in `excluding`.
  pub fn get_random_pingable_members(
    &self,
    n: usize,
    excluding: &[&str],
  ) -> Vec<Member> {
    let mut rng = thread_rng();
    let mut picked = self
      .members
      .iter()
      .filter(|m| self.is_pingable(m))
      .filter(|m| !excluding.contains(&m.address.as_str()))
      .choose_multiple(&mut rng, n);
    picked.shuffle(&mut rng);
    picked.into_iter().cloned().collect()
  }

  pub fn is_pingable(&self, member: &Member) -> bool {
    member.address != self.local_address && member.status.is_pingable()
  }

  fn local_change(&self, address: &str, status: Status, inc: u64) -> Change {
    Change {
      address: address.to_string(),
      status: status,
      incarnation_number: inc,
      source: self.local_address.clone(),
      source_incarnation_number: self.local_incarnation(),
      timestamp: now_millis(),
    }
  }

  fn apply(&mut self, change: Change) -> Option<Change> {
    let idx = match self.index.get(&change.address) {
      Some(idx) => *idx,
      None => {
        // Nobody else gets to introduce the local member in a bad state.
        if change.address == self.local_address
          && change.status != Status::Alive
        {
          return None;
        }
        self.put(Member::from(&change));
        return Some(change);
      }
    };
    let member = &self.members[idx];
    let local = self.local_address.as_str();
    if is_foreign_local_leave(local, member, &change) {
      debug!(source = %change.source, "ignoring leave claimed by a peer");
      return None;
    }
    if is_local_suspect_override(local, member, &change)
      || is_local_faulty_override(local, member, &change)
      || is_local_tombstone_override(local, member, &change)
    {
      let inc = self.fresh_incarnation();
      warn!(
        source = %change.source,
        status = %change.status,
        incarnation = inc,
        "rebutting claim about local member"
      );
      counter!("swimring_membership_refuted").increment(1);
      let member = &mut self.members[idx];
      member.status = Status::Alive;
      member.incarnation_number = inc;
      return Some(Change {
        address: self.local_address.clone(),
        status: Status::Alive,
        incarnation_number: inc,
        source: self.local_address.clone(),
        source_incarnation_number: inc,
        timestamp: now_millis(),
      });
    }
    let overrides = is_alive_override(member, &change)
      || is_suspect_override(member, &change)
      || is_faulty_override(member, &change)
      || is_leave_override(member, &change)
      || is_tombstone_override(member, &change);
    if !overrides {
      return None;
    }
    let member = &mut self.members[idx];
    member.status = change.status;
    member.incarnation_number = change.incarnation_number;
    Some(change)
  }

  /// Overwrites an existing row or inserts a new one at a random position.
  fn put(&mut self, member: Member) {
    if let Some(idx) = self.index.get(&member.address) {
      self.members[*idx] = member;
      return;
    }
    let pos = thread_rng().gen_range(0..=self.members.len());
    self.members.insert(pos, member);
    for (i, m) in self.members.iter().enumerate().skip(pos) {
      self.index.insert(m.address.clone(), i);
    }
  }

  fn recompute_checksum(&mut self) {
    let checksum = self.compute_checksum();
    let old = self.checksum.replace(checksum);
    gauge!("swimring_membership_checksum").set(checksum as f64);
    if old != Some(checksum) {
      trace!(checksum = checksum, old = ?old, "membership checksum computed");
    }
    self.emit(MembershipEvent::ChecksumComputed {
      checksum: checksum,
      old: old,
    });
  }

  fn emit(&self, event: MembershipEvent) {
    let _ = self.events.send(event);
  }
}

#[cfg(test)]
const LOCAL: &str = "127.0.0.1:3000";

#[cfg(test)]
fn change(address: &str, status: Status, inc: u64) -> Change {
  Change {
    address: address.to_string(),
    status: status,
    incarnation_number: inc,
    source: "127.0.0.1:3999".to_string(),
    source_incarnation_number: 1,
    timestamp: 0,
  }
}

#[cfg(test)]
fn ready() -> Membership {
  let mut m = Membership::new(LOCAL.to_string());
  m.make_alive(LOCAL, 1);
  m.make_ready();
  m
}

#[cfg(test)]
fn drain(
  rx: &mut broadcast::Receiver<MembershipEvent>,
) -> Vec<MembershipEvent> {
  std::iter::from_fn(|| rx.try_recv().ok()).collect()
}

#[test]
fn test_checksum_order_independent() {
  let mut a = ready();
  a.update(
    vec![change("a:1", Status::Alive, 1), change("b:1", Status::Suspect, 2)],
    false,
  );
  let mut b = ready();
  b.update(vec![change("b:1", Status::Suspect, 2)], false);
  b.update(vec![change("a:1", Status::Alive, 1)], false);
  assert_eq!(a.checksum(), b.checksum());
  assert_eq!(a.checksum(), Some(a.compute_checksum()));

  let expected = hash32("127.0.0.1:3000alive1;a:1alive1;b:1suspect2");
  assert_eq!(a.compute_checksum(), expected);
}

#[test]
fn test_update_batches_one_event() {
  let mut m = ready();
  let mut rx = m.subscribe();
  let applied = m.update(
    vec![
      change("a:1", Status::Alive, 1),
      change("a:1", Status::Alive, 1),
      change("b:1", Status::Alive, 5),
      change("", Status::Alive, 5),
      change("b:1", Status::Suspect, 5),
    ],
    false,
  );
  let addrs = applied
    .iter()
    .map(|c| (c.address.as_str(), c.status))
    .collect::<Vec<_>>();
  assert_eq!(
    addrs,
    vec![
      ("a:1", Status::Alive),
      ("b:1", Status::Alive),
      ("b:1", Status::Suspect)
    ]
  );
  let events = drain(&mut rx);
  let updated = events
    .iter()
    .filter(|e| matches!(e, MembershipEvent::Updated(_)))
    .count();
  let computed = events
    .iter()
    .filter(|e| matches!(e, MembershipEvent::ChecksumComputed { .. }))
    .count();
  assert_eq!(updated, 1);
  assert_eq!(computed, 1);
  assert_eq!(events[1], MembershipEvent::Updated(applied));

  assert!(m.update(vec![change("a:1", Status::Alive, 1)], false).is_empty());
  assert!(drain(&mut rx).is_empty());
}

#[test]
fn test_one_row_per_address() {
  let mut m = ready();
  for inc in 1..20 {
    m.update(vec![change("a:1", Status::Alive, inc)], false);
    m.update(vec![change("a:1", Status::Suspect, inc)], false);
  }
  assert_eq!(m.len(), 2);
  assert_eq!(m.find("a:1").unwrap().status, Status::Suspect);
  assert_eq!(m.find("a:1").unwrap().incarnation_number, 19);
  for (i, member) in m.members().iter().enumerate() {
    assert_eq!(m.index[&member.address], i);
  }
}

#[test]
fn test_local_member_rebuts_suspicion() {
  let mut m = ready();
  let before = m.local_incarnation();
  let applied = m.update(vec![change(LOCAL, Status::Suspect, 1)], false);
  assert_eq!(applied.len(), 1);
  assert_eq!(applied[0].status, Status::Alive);
  assert!(applied[0].incarnation_number > before);
  assert_eq!(applied[0].source, LOCAL);
  let local = m.local_member().unwrap();
  assert_eq!(local.status, Status::Alive);
  assert_eq!(local.incarnation_number, applied[0].incarnation_number);

  let inc = m.local_incarnation();
  let applied = m.update(vec![change(LOCAL, Status::Faulty, inc + 50)], false);
  assert_eq!(applied[0].status, Status::Alive);
  assert!(m.local_incarnation() > inc);
}

#[test]
fn test_local_member_rebuts_tombstone() {
  let mut m = ready();
  let inc = m.local_incarnation();
  let applied = m.update(vec![change(LOCAL, Status::Tombstone, inc)], false);
  assert_eq!(applied.len(), 1);
  assert_eq!(applied[0].status, Status::Alive);
  assert!(applied[0].incarnation_number > inc);
  let local = m.local_member().unwrap();
  assert_eq!(local.status, Status::Alive);
  assert!(local.incarnation_number > inc);
}

#[test]
fn test_peer_cannot_make_local_member_leave() {
  let mut m = ready();
  let inc = m.local_incarnation();
  let applied = m.update(vec![change(LOCAL, Status::Leave, inc + 5)], false);
  assert!(applied.is_empty());
  assert_eq!(m.local_member().unwrap().status, Status::Alive);
  assert_eq!(m.local_incarnation(), inc);

  let applied = m.make_leave(LOCAL, inc);
  assert_eq!(applied.len(), 1);
  assert_eq!(m.local_member().unwrap().status, Status::Leave);
}

#[test]
fn test_stash_until_ready() {
  let mut m = Membership::new(LOCAL.to_string());
  assert!(m
    .update(vec![change("a:1", Status::Alive, 1)], false)
    .is_empty());
  assert!(m.find("a:1").is_none());
  let applied = m.make_alive(LOCAL, 1);
  assert_eq!(applied.len(), 1);
  m.update(vec![change("a:1", Status::Suspect, 1)], false);
  assert_eq!(m.stashed(), 2);
  let replayed = m.make_ready();
  assert_eq!(replayed.len(), 2);
  assert_eq!(replayed[0].status, Status::Alive);
  assert_eq!(replayed[1].status, Status::Suspect);
  assert_eq!(m.find("a:1").unwrap().status, Status::Suspect);
  assert!(m.is_ready());
  assert_eq!(m.stashed(), 0);
}

#[test]
fn test_set_merges_and_skips_local() {
  let mut m = Membership::new(LOCAL.to_string());
  m.make_alive(LOCAL, 10);
  m.update(vec![change("c:1", Status::Alive, 3)], false);
  let mut rx = m.subscribe();
  let applied = m.set(vec![
    Snapshot {
      checksum: Some(1),
      members: vec![
        change("b:1", Status::Alive, 1),
        change(LOCAL, Status::Faulty, 99),
      ],
    },
    Snapshot {
      checksum: Some(2),
      members: vec![
        change("b:1", Status::Alive, 4),
        change("c:1", Status::Alive, 2),
      ],
    },
  ]);
  assert_eq!(applied.len(), 2);
  assert_eq!(m.find("b:1").unwrap().incarnation_number, 4);
  assert_eq!(m.find("c:1").unwrap().incarnation_number, 3);
  assert_eq!(m.local_member().unwrap().status, Status::Alive);
  assert_eq!(m.local_incarnation(), 10);
  let events = drain(&mut rx);
  assert!(events.contains(&MembershipEvent::Set(applied)));
  assert!(m.make_ready().is_empty());
}

#[test]
fn test_set_with_agreeing_checksums_replays_stash() {
  let mut m = Membership::new(LOCAL.to_string());
  m.make_alive(LOCAL, 10);
  m.update(vec![change("c:1", Status::Alive, 3)], false);
  let snapshot = Snapshot {
    checksum: Some(7),
    members: vec![change("b:1", Status::Alive, 1)],
  };
  m.set(vec![snapshot.clone(), snapshot]);
  assert!(m.find("c:1").is_none());
  assert_eq!(m.make_ready().len(), 1);
  assert!(m.find("c:1").is_some());
}

#[test]
fn test_random_pingable_members() {
  let mut m = ready();
  m.update(
    vec![
      change("a:1", Status::Alive, 1),
      change("b:1", Status::Suspect, 1),
      change("c:1", Status::Faulty, 1),
      change("d:1", Status::Leave, 1),
      change("e:1", Status::Alive, 1),
    ],
    false,
  );
  let picked = m.get_random_pingable_members(10, &["e:1"]);
  let mut addrs = picked
    .iter()
    .map(|m| m.address.as_str())
    .collect::<Vec<_>>();
  addrs.sort();
  assert_eq!(addrs, vec!["a:1", "b:1"]);
  assert_eq!(m.get_random_pingable_members(1, &[]).len(), 1);
  assert!(m.get_random_pingable_members(0, &[]).is_empty());
}

#[test]
fn test_unseen_local_member_not_introduced_by_peers() {
  let mut m = Membership::new(LOCAL.to_string());
  m.make_ready();
  assert!(m
    .update(vec![change(LOCAL, Status::Faulty, 3)], false)
    .is_empty());
  assert!(m.local_member().is_none());
}
