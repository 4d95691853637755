use crate::membership::Member;
use hashbrown::HashMap;
use metrics::counter;
use std::time::Duration;
use tokio::sync::mpsc::UnboundedSender;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

/// A suspicion timer ran out. The owner of the membership table decides
/// whether it still applies via [`SuspicionManager::expire`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Expiry {
  pub address: String,
  pub incarnation_number: u64,
  generation: u64,
}

/// One timer per suspect member. When a timer fires without having been
/// stopped, the member gets declared faulty at the incarnation it was
/// suspected at.
pub struct SuspicionManager {
  local_address: String,
  timeout: Duration,
  timers: HashMap<String, (JoinHandle<()>, u64)>,
  generation: u64,
  disabled: bool,
  expired: UnboundedSender<Expiry>,
}
impl SuspicionManager {
  pub fn new(
    local_address: String,
    timeout: Duration,
    expired: UnboundedSender<Expiry>,
  ) -> SuspicionManager {
    SuspicionManager {
      local_address: local_address,
      timeout: timeout,
      timers: HashMap::new(),
      generation: 0,
      disabled: false,
      expired: expired,
    }
  }

  pub fn set_timeout(&mut self, timeout: Duration) {
    self.timeout = timeout;
  }

  pub fn is_disabled(&self) -> bool {
    self.disabled
  }

  pub fn len(&self) -> usize {
    self.timers.len()
  }

  pub fn is_empty(&self) -> bool {
    self.timers.is_empty()
  }

  pub fn is_suspected(&self, address: &str) -> bool {
    self.timers.contains_key(address)
  }

  /// Starts, or restarts, the timer for `member`. Returns false if
  /// suspicion is disabled or the member is the local one.
  pub fn start(&mut self, member: &Member) -> bool {
    if self.disabled {
      trace!(address = %member.address, "suspicion disabled");
      return false;
    }
    if member.address == self.local_address {
      return false;
    }
    self.stop(&member.address);
    self.generation += 1;
    let expiry = Expiry {
      address: member.address.clone(),
      incarnation_number: member.incarnation_number,
      generation: self.generation,
    };
    let tx = self.expired.clone();
    let timeout = self.timeout;
    let handle = tokio::spawn(async move {
      tokio::time::sleep(timeout).await;
      let _ = tx.send(expiry);
    });
    debug!(address = %member.address, timeout = ?timeout, "suspicion started");
    self
      .timers
      .insert(member.address.clone(), (handle, self.generation));
    true
  }

  /// Cancels the timer for `address`, if any. Safe to call repeatedly.
  pub fn stop(&mut self, address: &str) {
    if let Some((handle, _)) = self.timers.remove(address) {
      handle.abort();
      trace!(address = %address, "suspicion stopped");
    }
  }

  /// Cancels every timer and refuses new ones until [`reenable`] is called.
  ///
  /// [`reenable`]: SuspicionManager::reenable
  pub fn stop_all(&mut self) {
    for (_, (handle, _)) in self.timers.drain() {
      handle.abort();
    }
    self.disabled = true;
    debug!("suspicion disabled");
  }

  pub fn reenable(&mut self) {
    if self.disabled {
      self.disabled = false;
      debug!("suspicion reenabled");
    }
  }

  /// Claims an expiry. Returns true if it belongs to the live timer for its
  /// address, in which case the member should be made faulty. Expiries from
  /// timers that were stopped or restarted in the meantime return false.
  pub fn expire(&mut self, expiry: &Expiry) -> bool {
    match self.timers.get(&expiry.address) {
      Some((_, generation)) if *generation == expiry.generation => {
        self.timers.remove(&expiry.address);
        counter!("swimring_suspicion_expired").increment(1);
        true
      }
      _ => false,
    }
  }
}
impl Drop for SuspicionManager {
  fn drop(&mut self) {
    for (_, (handle, _)) in self.timers.drain() {
      handle.abort();
    }
  }
}

#[cfg(test)]
use crate::membership::Status;
#[cfg(test)]
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver};

#[cfg(test)]
fn suspect(address: &str, inc: u64) -> Member {
  Member {
    address: address.to_string(),
    status: Status::Suspect,
    incarnation_number: inc,
  }
}

#[cfg(test)]
fn manager() -> (SuspicionManager, UnboundedReceiver<Expiry>) {
  let (tx, rx) = unbounded_channel();
  let mgr = SuspicionManager::new(
    "local:1".to_string(),
    Duration::from_millis(5000),
    tx,
  );
  (mgr, rx)
}

#[tokio::test(start_paused = true)]
async fn test_expiry_carries_start_incarnation() {
  let (mut mgr, mut rx) = manager();
  assert!(mgr.start(&suspect("a:1", 7)));
  tokio::time::sleep(Duration::from_millis(4999)).await;
  assert!(rx.try_recv().is_err());
  let expiry = rx.recv().await.unwrap();
  assert_eq!(expiry.address, "a:1");
  assert_eq!(expiry.incarnation_number, 7);
  assert!(mgr.expire(&expiry));
  assert!(!mgr.expire(&expiry));
  assert!(mgr.is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_stop_before_timeout_never_expires() {
  let (mut mgr, mut rx) = manager();
  mgr.start(&suspect("a:1", 1));
  tokio::time::sleep(Duration::from_millis(1000)).await;
  mgr.stop("a:1");
  mgr.stop("a:1");
  tokio::time::sleep(Duration::from_millis(10_000)).await;
  assert!(rx.try_recv().is_err());
}

#[tokio::test(start_paused = true)]
async fn test_restart_resets_clock() {
  let (mut mgr, mut rx) = manager();
  mgr.start(&suspect("a:1", 1));
  tokio::time::sleep(Duration::from_millis(3000)).await;
  mgr.start(&suspect("a:1", 2));
  tokio::time::sleep(Duration::from_millis(3000)).await;
  assert!(rx.try_recv().is_err());
  let expiry = rx.recv().await.unwrap();
  assert_eq!(expiry.incarnation_number, 2);
  assert!(mgr.expire(&expiry));
}

#[tokio::test(start_paused = true)]
async fn test_stop_all_blocks_until_reenabled() {
  let (mut mgr, mut rx) = manager();
  mgr.start(&suspect("a:1", 1));
  mgr.start(&suspect("b:1", 1));
  mgr.stop_all();
  assert!(mgr.is_empty());
  assert!(!mgr.start(&suspect("c:1", 1)));
  tokio::time::sleep(Duration::from_millis(10_000)).await;
  assert!(rx.try_recv().is_err());
  mgr.reenable();
  assert!(mgr.start(&suspect("c:1", 1)));
  assert!(!mgr.start(&suspect("local:1", 1)));
  assert_eq!(mgr.len(), 1);
}
