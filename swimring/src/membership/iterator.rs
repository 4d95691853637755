use crate::membership::{Member, Membership};
use rand::seq::SliceRandom;
use rand::thread_rng;

/// Hands out ping targets round-robin over a shuffled copy of the table,
/// reshuffling after every full pass so each member is pinged once per pass.
#[derive(Default)]
pub struct MembershipIterator {
  order: Vec<String>,
  pos: usize,
}
impl MembershipIterator {
  pub fn new() -> MembershipIterator {
    MembershipIterator::default()
  }

  /// The next pingable member, or `None` if there is nobody to ping.
  pub fn next(&mut self, membership: &Membership) -> Option<Member> {
    for _ in 0..2 {
      while self.pos < self.order.len() {
        let address = &self.order[self.pos];
        self.pos += 1;
        if let Some(member) = membership.find(address) {
          if membership.is_pingable(member) {
            return Some(member.clone());
          }
        }
      }
      self.order = membership
        .members()
        .iter()
        .map(|m| m.address.clone())
        .collect();
      self.order.shuffle(&mut thread_rng());
      self.pos = 0;
    }
    None
  }
}

#[cfg(test)]
use crate::membership::{Change, Status};

#[cfg(test)]
fn table() -> Membership {
  let mut m = Membership::new("local:1".to_string());
  m.make_alive("local:1", 1);
  m.make_ready();
  let changes = [
    ("a:1", Status::Alive),
    ("b:1", Status::Suspect),
    ("c:1", Status::Faulty),
    ("d:1", Status::Alive),
  ]
  .iter()
  .map(|(address, status)| Change {
    address: address.to_string(),
    status: *status,
    incarnation_number: 1,
    source: "local:1".to_string(),
    source_incarnation_number: 1,
    timestamp: 0,
  })
  .collect();
  m.update(changes, false);
  m
}

#[test]
fn test_iterator_visits_each_pingable_member_once_per_pass() {
  let m = table();
  let mut iter = MembershipIterator::new();
  for _ in 0..3 {
    let mut pass = (0..3)
      .map(|_| iter.next(&m).unwrap().address)
      .collect::<Vec<_>>();
    pass.sort();
    assert_eq!(pass, vec!["a:1", "b:1", "d:1"]);
  }
}

#[test]
fn test_iterator_empty_without_peers() {
  let mut m = Membership::new("local:1".to_string());
  m.make_alive("local:1", 1);
  let mut iter = MembershipIterator::new();
  assert!(iter.next(&m).is_none());
  assert!(iter.next(&m).is_none());
}
