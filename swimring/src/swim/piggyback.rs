use crate::membership::{Change, Membership};
use linked_hash_map::LinkedHashMap;
use metrics::counter;
use tracing::trace;

struct Pending {
  change: Change,
  retransmits: u32,
}

/// Changes waiting to ride along on outgoing protocol messages, at most one
/// per address. Each is handed out until it has been sent
/// `max_piggyback_count` times, then dropped from the buffer.
pub struct PiggybackBuffer {
  max_piggyback_count: u32,
  changes: LinkedHashMap<String, Pending>,
}
impl PiggybackBuffer {
  pub fn new(max_piggyback_count: u32) -> PiggybackBuffer {
    PiggybackBuffer {
      max_piggyback_count: max_piggyback_count,
      changes: LinkedHashMap::new(),
    }
  }

  pub fn len(&self) -> usize {
    self.changes.len()
  }

  pub fn is_empty(&self) -> bool {
    self.changes.is_empty()
  }

  pub fn set_max_piggyback_count(&mut self, max: u32) {
    self.max_piggyback_count = max;
  }

  /// Stores `change`, replacing any older change about the same address and
  /// resetting its retransmit count.
  pub fn record_change(&mut self, change: Change) {
    self.changes.insert(
      change.address.clone(),
      Pending {
        change: change,
        retransmits: 0,
      },
    );
  }

  pub fn record_changes<I: IntoIterator<Item = Change>>(&mut self, changes: I) {
    for change in changes {
      self.record_change(change);
    }
  }

  /// Calls `visit` with every change still under its retransmit limit and
  /// bumps its count. Changes over the limit are skipped and purged once the
  /// scan is done.
  pub fn issue<F: FnMut(&Change)>(&mut self, mut visit: F) {
    let max = self.max_piggyback_count;
    let mut expired = Vec::new();
    for (address, pending) in self.changes.iter_mut() {
      if pending.retransmits > max {
        expired.push(address.clone());
        continue;
      }
      visit(&pending.change);
      pending.retransmits += 1;
    }
    if !expired.is_empty() {
      trace!(count = expired.len(), "purging expired piggyback changes");
      counter!("swimring_piggyback_expired").increment(expired.len() as u64);
    }
    for address in expired {
      self.changes.remove(&address);
    }
  }

  /// The changes to attach to a ping or ping-req we are about to send.
  pub fn issue_as_sender(&mut self) -> Vec<Change> {
    let mut out = Vec::new();
    self.issue(|c| out.push(c.clone()));
    out
  }

  /// The changes to answer a ping or ping-req with. With nothing pending but
  /// a checksum mismatch, the whole table is sent so the sender can catch up.
  pub fn issue_as_receiver(
    &mut self,
    sender_checksum: Option<u32>,
    membership: &Membership,
  ) -> Vec<Change> {
    let changes = self.issue_as_sender();
    if changes.is_empty() && sender_checksum != membership.checksum() {
      trace!(
        sender = ?sender_checksum,
        local = ?membership.checksum(),
        "checksums differ, sending full sync"
      );
      counter!("swimring_full_sync").increment(1);
      return membership.snapshot();
    }
    changes
  }
}

#[cfg(test)]
use crate::membership::Status;

#[cfg(test)]
fn change(address: &str, status: Status, inc: u64) -> Change {
  Change {
    address: address.to_string(),
    status: status,
    incarnation_number: inc,
    source: "local:1".to_string(),
    source_incarnation_number: 1,
    timestamp: 0,
  }
}

#[test]
fn test_change_expires_after_max_count() {
  let mut buf = PiggybackBuffer::new(2);
  buf.record_change(change("a:1", Status::Suspect, 1));
  for _ in 0..3 {
    assert_eq!(buf.issue_as_sender().len(), 1);
  }
  assert!(buf.issue_as_sender().is_empty());
  assert!(buf.is_empty());
  assert!(buf.issue_as_sender().is_empty());
}

#[test]
fn test_record_resets_count_and_overwrites() {
  let mut buf = PiggybackBuffer::new(1);
  buf.record_change(change("a:1", Status::Suspect, 1));
  buf.issue_as_sender();
  buf.issue_as_sender();
  buf.record_change(change("a:1", Status::Faulty, 1));
  buf.record_change(change("b:1", Status::Alive, 3));
  assert_eq!(buf.len(), 2);
  let issued = buf.issue_as_sender();
  assert_eq!(issued[0].status, Status::Faulty);
  assert_eq!(issued[1].address, "b:1");
}

#[test]
fn test_full_sync_on_checksum_mismatch() {
  let mut m = Membership::new("local:1".to_string());
  m.make_alive("local:1", 1);
  m.make_ready();
  m.make_alive("a:1", 1);
  let mut buf = PiggybackBuffer::new(15);
  let synced = buf.issue_as_receiver(Some(1), &m);
  assert_eq!(synced.len(), 2);
  assert!(buf.issue_as_receiver(m.checksum(), &m).is_empty());

  buf.record_change(change("a:1", Status::Alive, 1));
  assert_eq!(buf.issue_as_receiver(Some(1), &m).len(), 1);
}
