use crate::config::SwimConfig;
use crate::error::SwimError;
use crate::membership::{
  Change, Member, Membership, MembershipEvent, MembershipIterator, Snapshot,
  Status,
};
use crate::ring::{HashRing, RingEvent, RingStats};
use crate::swim::{
  handlers, joiner, Expiry, Gossip, PiggybackBuffer, SuspicionManager,
};
use crate::transport::{Channel, Endpoint, RequestHandler};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::{broadcast, mpsc, watch};
use tracing::{debug, info, warn};

/// Everything the protocol mutates. It lives behind one lock: applying a
/// batch, recomputing checksums and notifying listeners must not interleave
/// with another batch. The lock is never held across an await.
pub(crate) struct State {
  pub membership: Membership,
  pub ring: HashRing,
  pub piggyback: PiggybackBuffer,
  pub suspicion: SuspicionManager,
  pub iterator: MembershipIterator,
}
impl State {
  /// Applies changes received from a peer.
  pub fn update(&mut self, changes: Vec<Change>) -> Vec<Change> {
    let applied = self.membership.update(changes, false);
    self.on_applied(&applied);
    applied
  }

  pub fn set(&mut self, snapshots: Vec<Snapshot>) -> Vec<Change> {
    let applied = self.membership.set(snapshots);
    self.on_applied(&applied);
    applied
  }

  pub fn make_ready(&mut self) -> Vec<Change> {
    let applied = self.membership.make_ready();
    self.on_applied(&applied);
    applied
  }

  pub fn make(
    &mut self,
    address: &str,
    status: Status,
    inc: u64,
  ) -> Vec<Change> {
    let applied = match status {
      Status::Alive => self.membership.make_alive(address, inc),
      Status::Suspect => self.membership.make_suspect(address, inc),
      Status::Faulty => self.membership.make_faulty(address, inc),
      Status::Leave => self.membership.make_leave(address, inc),
      Status::Tombstone => self.membership.make_tombstone(address, inc),
    };
    self.on_applied(&applied);
    applied
  }

  /// Fans an applied batch out to gossip, suspicion and the ring.
  fn on_applied(&mut self, applied: &[Change]) {
    if applied.is_empty() {
      return;
    }
    self.piggyback.record_changes(applied.iter().cloned());
    for change in applied {
      match change.status {
        Status::Suspect => {
          self.suspicion.start(&Member::from(change));
        }
        _ => self.suspicion.stop(&change.address),
      }
    }
    self.sync_ring(applied);
  }

  /// Alive and suspect members own ring positions, nobody else does.
  fn sync_ring(&mut self, applied: &[Change]) {
    let mut to_add = Vec::new();
    let mut to_remove = Vec::new();
    for change in applied {
      match self.membership.find(&change.address) {
        Some(m) if m.status.is_pingable() => to_add.push(m.address.as_str()),
        Some(m) => to_remove.push(m.address.as_str()),
        None => {}
      }
    }
    self.ring.add_remove_servers(to_add, to_remove);
  }
}

pub(crate) struct Inner {
  pub address: String,
  pub channel: Arc<dyn Channel>,
  pub config: Mutex<SwimConfig>,
  pub state: Mutex<State>,
  pub gossip: Gossip,
  bootstrapped: AtomicBool,
  destroyed: AtomicBool,
  shutdown: watch::Sender<bool>,
  shutdown_rx: watch::Receiver<bool>,
}
impl Inner {
  pub fn config(&self) -> SwimConfig {
    self.config.lock().clone()
  }

  pub fn is_destroyed(&self) -> bool {
    self.destroyed.load(Ordering::SeqCst)
  }

  /// Resolves once [`Cluster::destroy`] has been called.
  pub fn shutdown_signal(&self) -> watch::Receiver<bool> {
    self.shutdown_rx.clone()
  }

  fn on_expiry(&self, expiry: Expiry) {
    let mut state = self.state.lock();
    if !state.suspicion.expire(&expiry) {
      return;
    }
    info!(
      address = %expiry.address,
      incarnation = expiry.incarnation_number,
      "suspicion timed out, marking faulty"
    );
    state.make(&expiry.address, Status::Faulty, expiry.incarnation_number);
  }
}

/// A handle to the local node. Cheap to clone; every clone drives the same
/// node.
///
/// Must be created inside a tokio runtime since suspicion timers and the
/// gossip loop run as tasks.
#[derive(Clone)]
pub struct Cluster {
  pub(crate) inner: Arc<Inner>,
}
impl Cluster {
  pub fn new(
    address: String,
    config: SwimConfig,
    channel: Arc<dyn Channel>,
  ) -> Result<Cluster, SwimError> {
    config.validate()?;
    let (expired_tx, expired_rx) = mpsc::unbounded_channel();
    let (shutdown, shutdown_rx) = watch::channel(false);
    let state = State {
      membership: Membership::new(address.clone()),
      ring: HashRing::new(config.replica_points),
      piggyback: PiggybackBuffer::new(config.max_piggyback_count),
      suspicion: SuspicionManager::new(
        address.clone(),
        config.suspicion_timeout,
        expired_tx,
      ),
      iterator: MembershipIterator::new(),
    };
    let inner = Arc::new(Inner {
      address: address,
      channel: channel,
      config: Mutex::new(config),
      state: Mutex::new(state),
      gossip: Gossip::new(),
      bootstrapped: AtomicBool::new(false),
      destroyed: AtomicBool::new(false),
      shutdown: shutdown,
      shutdown_rx: shutdown_rx,
    });
    tokio::spawn(expiry_loop(Arc::downgrade(&inner), expired_rx));
    Ok(Cluster { inner: inner })
  }

  /// Joins the cluster through `hosts`, which may include this node's own
  /// address. Once the join snapshots are merged the node starts accepting
  /// gossip and probing its peers. Returns the peers that were joined.
  pub async fn bootstrap(
    &self,
    hosts: &[String],
  ) -> Result<Vec<String>, SwimError> {
    if self.inner.is_destroyed() {
      return Err(SwimError::JoinAborted);
    }
    if self.inner.bootstrapped.swap(true, Ordering::SeqCst) {
      return Err(SwimError::AlreadyBootstrapped);
    }
    {
      let mut state = self.inner.state.lock();
      let inc = state.membership.fresh_incarnation();
      state.make(&self.inner.address, Status::Alive, inc);
    }
    let joined = match joiner::join_cluster(&self.inner, hosts).await {
      Ok(joined) => joined,
      Err(err) => {
        warn!(error = %err, "bootstrap failed");
        self.inner.bootstrapped.store(false, Ordering::SeqCst);
        return Err(err);
      }
    };
    let coordinators = joined.iter().map(|(host, _)| host.clone()).collect();
    {
      let mut state = self.inner.state.lock();
      state.set(joined.into_iter().map(|(_, s)| s).collect());
      state.make_ready();
      info!(
        address = %self.inner.address,
        members = state.membership.len(),
        checksum = ?state.membership.checksum(),
        "bootstrap complete"
      );
    }
    self.inner.gossip.start(&self.inner);
    Ok(coordinators)
  }

  pub fn whoami(&self) -> &str {
    &self.inner.address
  }

  pub fn is_ready(&self) -> bool {
    self.inner.state.lock().membership.is_ready()
  }

  /// The server owning `key`, if the ring has any servers.
  pub fn lookup(&self, key: &str) -> Option<String> {
    self.inner.state.lock().ring.lookup(key).cloned()
  }

  /// Up to `n` distinct servers for `key`, in ring order.
  pub fn lookup_n(&self, key: &str, n: usize) -> Vec<String> {
    self.inner.state.lock().ring.lookup_n(key, n)
  }

  pub fn members(&self) -> Vec<Member> {
    self.inner.state.lock().membership.members().to_vec()
  }

  pub fn member(&self, address: &str) -> Option<Member> {
    self.inner.state.lock().membership.find(address).cloned()
  }

  pub fn checksum(&self) -> Option<u32> {
    self.inner.state.lock().membership.checksum()
  }

  pub fn ring_stats(&self) -> RingStats {
    self.inner.state.lock().ring.get_stats()
  }

  pub fn subscribe_membership(&self) -> broadcast::Receiver<MembershipEvent> {
    self.inner.state.lock().membership.subscribe()
  }

  pub fn subscribe_ring(&self) -> broadcast::Receiver<RingEvent> {
    self.inner.state.lock().ring.subscribe()
  }

  /// Stops gossip and every timer and aborts a join in progress. Inbound
  /// requests are still answered.
  pub fn destroy(&self) {
    if self.inner.destroyed.swap(true, Ordering::SeqCst) {
      return;
    }
    let _ = self.inner.shutdown.send(true);
    self.inner.gossip.stop();
    self.inner.state.lock().suspicion.stop_all();
    info!(address = %self.inner.address, "destroyed");
  }

  pub fn is_destroyed(&self) -> bool {
    self.inner.is_destroyed()
  }
}

#[async_trait]
impl RequestHandler for Cluster {
  async fn handle(
    &self,
    endpoint: Endpoint,
    body: Value,
  ) -> Result<Value, SwimError> {
    debug!(endpoint = %endpoint, "request received");
    match endpoint {
      Endpoint::Join => handlers::handle_join(&self.inner, body),
      Endpoint::Ping => handlers::handle_ping(&self.inner, body),
      Endpoint::PingReq => handlers::handle_ping_req(&self.inner, body).await,
    }
  }
}

async fn expiry_loop(
  inner: Weak<Inner>,
  mut rx: mpsc::UnboundedReceiver<Expiry>,
) {
  while let Some(expiry) = rx.recv().await {
    match inner.upgrade() {
      Some(inner) => inner.on_expiry(expiry),
      None => break,
    }
  }
}
