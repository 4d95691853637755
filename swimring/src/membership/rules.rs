//! Decides whether an incoming [`Change`] overrides what the table currently
//! records for a member.
//!
//! Ties at equal incarnation numbers go to the worse status. Coming back to
//! life always takes a strictly greater incarnation, which only the member
//! itself can mint, so a member cannot flap between alive and suspect at the
//! same incarnation.

use crate::membership::{Change, Member, Status};

pub fn is_alive_override(member: &Member, change: &Change) -> bool {
  change.status == Status::Alive
    && change.incarnation_number > member.incarnation_number
}

pub fn is_suspect_override(member: &Member, change: &Change) -> bool {
  if change.status != Status::Suspect {
    return false;
  }
  let (cur, inc) = (member.incarnation_number, change.incarnation_number);
  match member.status {
    Status::Suspect => inc > cur,
    Status::Faulty => inc > cur,
    Status::Alive => inc >= cur,
    _ => false,
  }
}

pub fn is_faulty_override(member: &Member, change: &Change) -> bool {
  if change.status != Status::Faulty {
    return false;
  }
  let (cur, inc) = (member.incarnation_number, change.incarnation_number);
  match member.status {
    Status::Suspect => inc >= cur,
    Status::Faulty => inc > cur,
    Status::Alive => inc >= cur,
    _ => false,
  }
}

pub fn is_leave_override(member: &Member, change: &Change) -> bool {
  change.status == Status::Leave
    && member.status != Status::Leave
    && change.incarnation_number >= member.incarnation_number
}

pub fn is_tombstone_override(member: &Member, change: &Change) -> bool {
  change.status == Status::Tombstone
    && member.status != Status::Tombstone
    && change.incarnation_number >= member.incarnation_number
}

/// Someone else claims the local member is suspect. Incarnations are not
/// compared: any such claim gets rebutted.
pub fn is_local_suspect_override(
  local: &str,
  member: &Member,
  change: &Change,
) -> bool {
  member.address == local && change.status == Status::Suspect
}

pub fn is_local_faulty_override(
  local: &str,
  member: &Member,
  change: &Change,
) -> bool {
  member.address == local && change.status == Status::Faulty
}

/// Someone else wants the local member reaped. Rebutted like a faulty
/// claim.
pub fn is_local_tombstone_override(
  local: &str,
  member: &Member,
  change: &Change,
) -> bool {
  member.address == local && change.status == Status::Tombstone
}

/// A leave about the local member that the local member did not assert
/// itself. Only a node may announce its own departure, so these are
/// dropped.
pub fn is_foreign_local_leave(
  local: &str,
  member: &Member,
  change: &Change,
) -> bool {
  member.address == local
    && change.status == Status::Leave
    && change.source != local
}

#[cfg(test)]
use proptest::prelude::*;
#[cfg(test)]
use Status::*;

#[cfg(test)]
fn member(status: Status, inc: u64) -> Member {
  Member {
    address: "10.0.0.1:3000".to_string(),
    status: status,
    incarnation_number: inc,
  }
}

#[cfg(test)]
fn change(status: Status, inc: u64) -> Change {
  Change {
    address: "10.0.0.1:3000".to_string(),
    status: status,
    incarnation_number: inc,
    source: "10.0.0.2:3000".to_string(),
    source_incarnation_number: 1,
    timestamp: 0,
  }
}

/// The smallest incarnation delta (incoming - current) at which `to`
/// overrides `from`, or `None` if it never does.
#[cfg(test)]
fn threshold(from: Status, to: Status) -> Option<i64> {
  match (from, to) {
    (_, Alive) => Some(1),
    (Alive, Suspect) => Some(0),
    (Suspect, Suspect) | (Faulty, Suspect) => Some(1),
    (Alive, Faulty) | (Suspect, Faulty) => Some(0),
    (Faulty, Faulty) => Some(1),
    (Leave, Leave) => None,
    (_, Leave) => Some(0),
    (Tombstone, Tombstone) => None,
    (_, Tombstone) => Some(0),
    _ => None,
  }
}

#[cfg(test)]
fn any_override(m: &Member, c: &Change) -> bool {
  is_alive_override(m, c)
    || is_suspect_override(m, c)
    || is_faulty_override(m, c)
    || is_leave_override(m, c)
    || is_tombstone_override(m, c)
}

#[test]
fn test_status_grid() {
  let base = 10u64;
  for from in Status::ALL.iter() {
    for to in Status::ALL.iter() {
      for delta in [-1i64, 0, 1].iter() {
        let m = member(*from, base);
        let c = change(*to, (base as i64 + delta) as u64);
        let expected = threshold(*from, *to).map_or(false, |t| *delta >= t);
        assert_eq!(
          any_override(&m, &c),
          expected,
          "{} -> {} at delta {}",
          from,
          to,
          delta
        );
      }
    }
  }
}

#[test]
fn test_rules_only_match_their_status() {
  let m = member(Alive, 5);
  assert!(!is_alive_override(&m, &change(Suspect, 9)));
  assert!(!is_suspect_override(&m, &change(Faulty, 9)));
  assert!(!is_faulty_override(&m, &change(Suspect, 9)));
  assert!(!is_leave_override(&m, &change(Alive, 9)));
}

#[test]
fn test_local_overrides_ignore_incarnation() {
  let local = "10.0.0.1:3000";
  let m = member(Alive, 100);
  assert!(is_local_suspect_override(local, &m, &change(Suspect, 1)));
  assert!(is_local_faulty_override(local, &m, &change(Faulty, 1)));
  assert!(!is_local_suspect_override(local, &m, &change(Faulty, 1)));
  assert!(!is_local_faulty_override("10.0.0.9:3000", &m, &change(Faulty, 1)));
  assert!(is_local_tombstone_override(local, &m, &change(Tombstone, 1)));
  assert!(!is_local_tombstone_override(local, &m, &change(Leave, 1)));
}

#[test]
fn test_only_the_member_itself_may_leave() {
  let local = "10.0.0.1:3000";
  let m = member(Alive, 3);
  let mut leave = change(Leave, 3);
  assert!(is_foreign_local_leave(local, &m, &leave));
  leave.source = local.to_string();
  assert!(!is_foreign_local_leave(local, &m, &leave));
  assert!(!is_foreign_local_leave("10.0.0.9:3000", &m, &change(Leave, 3)));
}

#[cfg(test)]
proptest! {
  #[test]
  fn prop_rules_depend_only_on_status_and_delta(
    from in 0usize..5,
    to in 0usize..5,
    cur in 1u64..1_000_000,
    delta in -1i64..=1,
    shift in 1u64..1_000_000,
  ) {
    let (from, to) = (Status::ALL[from], Status::ALL[to]);
    let a = any_override(
      &member(from, cur),
      &change(to, (cur as i64 + delta) as u64),
    );
    let b = any_override(
      &member(from, cur + shift),
      &change(to, (cur as i64 + delta) as u64 + shift),
    );
    prop_assert_eq!(a, b);
  }
}
