use crate::cluster::Inner;
use crate::membership::{Member, Status};
use crate::swim::ping_req_sender::send_ping_reqs;
use crate::swim::ping_sender::send_ping;
use crate::swim::PingReqOutcome;
use metrics::histogram;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Weak};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, trace};

#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum GossipStatus {
  Running,
  Stopped,
}

/// The protocol period driver: pings one member per period.
pub(crate) struct Gossip {
  task: Mutex<Option<JoinHandle<()>>>,
}
impl Gossip {
  pub fn new() -> Gossip {
    Gossip {
      task: Mutex::new(None),
    }
  }

  /// Returns false if gossip was already running or the node is destroyed.
  pub fn start(&self, inner: &Arc<Inner>) -> bool {
    if inner.is_destroyed() {
      return false;
    }
    let mut task = self.task.lock();
    if task.is_some() {
      return false;
    }
    *task = Some(tokio::spawn(run(Arc::downgrade(inner))));
    info!(address = %inner.address, "gossip started");
    true
  }

  pub fn stop(&self) -> bool {
    match self.task.lock().take() {
      Some(handle) => {
        handle.abort();
        info!("gossip stopped");
        true
      }
      None => false,
    }
  }

  pub fn status(&self) -> GossipStatus {
    match *self.task.lock() {
      Some(_) => GossipStatus::Running,
      None => GossipStatus::Stopped,
    }
  }
}
impl Drop for Gossip {
  fn drop(&mut self) {
    if let Some(handle) = self.task.get_mut().take() {
      handle.abort();
    }
  }
}

async fn run(inner: Weak<Inner>) {
  loop {
    let inner = match inner.upgrade() {
      Some(inner) if !inner.is_destroyed() => inner,
      _ => break,
    };
    tick(&inner).await;
    let period = inner.config.lock().protocol_period;
    drop(inner);
    tokio::time::sleep(period).await;
  }
}

/// Runs one protocol period: ping the next member and fall back to
/// ping-req if it does not answer. Returns the member that was pinged.
pub(crate) async fn tick(inner: &Arc<Inner>) -> Option<Member> {
  let target = {
    let mut guard = inner.state.lock();
    let state = &mut *guard;
    state.iterator.next(&state.membership)
  };
  let target = match target {
    Some(target) => target,
    None => {
      trace!("nobody to ping");
      return None;
    }
  };
  let started = Instant::now();
  let timeout = inner.config.lock().ping_timeout;
  if send_ping(inner, &target.address, timeout).await.is_err() {
    ping_indirectly(inner, &target).await;
  }
  histogram!("swimring_protocol_tick_ms")
    .record(started.elapsed().as_secs_f64() * 1000.0);
  Some(target)
}

async fn ping_indirectly(inner: &Arc<Inner>, target: &Member) {
  let outcome = send_ping_reqs(inner, target).await;
  let inc = target.incarnation_number;
  match outcome {
    PingReqOutcome::Reachable => {
      debug!(dest = %target.address, "reachable through ping-req");
      inner.state.lock().make(&target.address, Status::Alive, inc);
    }
    PingReqOutcome::Unreachable | PingReqOutcome::NoHelpers => {
      info!(dest = %target.address, outcome = ?outcome, "suspecting member");
      inner.state.lock().make(&target.address, Status::Suspect, inc);
    }
    PingReqOutcome::Inconclusive => {
      debug!(dest = %target.address, "ping-req inconclusive");
    }
  }
}
