use crate::membership::Change;
use linked_hash_map::LinkedHashMap;
use serde::{Deserialize, Serialize};

/// A full membership view received from one peer while joining.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct Snapshot {
  pub checksum: Option<u32>,
  pub members: Vec<Change>,
}

pub struct Merged {
  pub changes: Vec<Change>,
  /// Whether stashed changes were folded into `changes`.
  pub consumed_stash: bool,
}

/// Reconciles the snapshots returned by join targets.
///
/// If every snapshot reports the same checksum the peers already agree and
/// the first one is taken as is. Otherwise entries are merged by address,
/// keeping the highest incarnation seen in any snapshot or in `stashed`.
/// Claims about `local` are dropped: the local member only trusts itself.
pub fn merge_snapshots(
  local: &str,
  snapshots: &[Snapshot],
  stashed: &[Change],
) -> Merged {
  let first = match snapshots.first() {
    Some(first) => first,
    None => {
      return Merged {
        changes: Vec::new(),
        consumed_stash: false,
      }
    }
  };
  let agreed = first.checksum.is_some()
    && snapshots.iter().all(|s| s.checksum == first.checksum);
  if agreed {
    return Merged {
      changes: first.members.clone(),
      consumed_stash: false,
    };
  }
  let mut by_address = LinkedHashMap::<&str, &Change>::new();
  let all = snapshots
    .iter()
    .flat_map(|s| s.members.iter())
    .chain(stashed.iter());
  for change in all {
    if change.address == local || change.is_malformed() {
      continue;
    }
    let newer = by_address
      .get(change.address.as_str())
      .map_or(true, |prev| change.incarnation_number > prev.incarnation_number);
    if newer {
      by_address.insert(change.address.as_str(), change);
    }
  }
  Merged {
    changes: by_address.into_iter().map(|(_, c)| c.clone()).collect(),
    consumed_stash: true,
  }
}

#[cfg(test)]
use crate::membership::Status;

#[cfg(test)]
fn entry(address: &str, status: Status, inc: u64) -> Change {
  Change {
    address: address.to_string(),
    status: status,
    incarnation_number: inc,
    source: String::new(),
    source_incarnation_number: 0,
    timestamp: 0,
  }
}

#[test]
fn test_agreeing_snapshots_taken_as_is() {
  let a = Snapshot {
    checksum: Some(5),
    members: vec![
      entry("local:1", Status::Suspect, 3),
      entry("b:1", Status::Alive, 1),
    ],
  };
  let b = Snapshot {
    checksum: Some(5),
    members: vec![entry("b:1", Status::Alive, 9)],
  };
  let merged = merge_snapshots("local:1", &[a.clone(), b], &[]);
  assert!(!merged.consumed_stash);
  assert_eq!(merged.changes, a.members);
}

#[test]
fn test_null_checksums_are_merged() {
  let a = Snapshot {
    checksum: None,
    members: vec![entry("b:1", Status::Alive, 1)],
  };
  let merged = merge_snapshots("local:1", &[a.clone(), a], &[]);
  assert!(merged.consumed_stash);
  assert_eq!(merged.changes, vec![entry("b:1", Status::Alive, 1)]);
}

#[test]
fn test_highest_incarnation_wins() {
  let a = Snapshot {
    checksum: Some(1),
    members: vec![
      entry("b:1", Status::Alive, 4),
      entry("c:1", Status::Alive, 2),
      entry("local:1", Status::Faulty, 100),
    ],
  };
  let b = Snapshot {
    checksum: Some(2),
    members: vec![
      entry("b:1", Status::Faulty, 6),
      entry("c:1", Status::Suspect, 1),
    ],
  };
  let stashed = vec![
    entry("c:1", Status::Leave, 3),
    entry("d:1", Status::Alive, 1),
  ];
  let merged = merge_snapshots("local:1", &[a, b], &stashed);
  assert!(merged.consumed_stash);
  assert_eq!(
    merged.changes,
    vec![
      entry("b:1", Status::Faulty, 6),
      entry("c:1", Status::Leave, 3),
      entry("d:1", Status::Alive, 1),
    ]
  );
}
