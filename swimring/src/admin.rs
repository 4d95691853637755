//! Operator controls. Each call maps onto one protocol component and adds
//! no logic of its own beyond guarding against redundant requests.

use crate::cluster::Cluster;
use crate::error::SwimError;
use crate::membership::{Change, Member, Membership, Status};
use crate::swim::{self, GossipStatus};
use serde_json::Value;
use tracing::info;

impl Cluster {
  pub fn gossip_start(&self) -> bool {
    self.inner.gossip.start(&self.inner)
  }

  pub fn gossip_stop(&self) -> bool {
    self.inner.gossip.stop()
  }

  pub fn gossip_status(&self) -> GossipStatus {
    self.inner.gossip.status()
  }

  /// Runs a single protocol period right now, returning the member pinged.
  pub async fn gossip_tick(&self) -> Option<Member> {
    swim::tick(&self.inner).await
  }

  pub fn config_get(&self) -> Value {
    self.inner.config.lock().to_json()
  }

  /// Merges `patch` into the running config and returns the result. The
  /// ring's replica points cannot change once the ring exists.
  pub fn config_set(&self, patch: &Value) -> Result<Value, SwimError> {
    let mut config = self.inner.config.lock();
    let merged = config.merge(patch)?;
    if merged.replica_points != config.replica_points {
      return Err(SwimError::InvalidConfig(
        "replicaPoints cannot change on a running node".to_string(),
      ));
    }
    {
      let mut state = self.inner.state.lock();
      state
        .piggyback
        .set_max_piggyback_count(merged.max_piggyback_count);
      state.suspicion.set_timeout(merged.suspicion_timeout);
    }
    *config = merged;
    info!(config = %config.to_json(), "config updated");
    Ok(config.to_json())
  }

  /// Marks the local member as leaving and freezes failure detection. The
  /// node keeps answering requests so peers learn about the leave.
  pub fn member_leave(&self) -> Result<(), SwimError> {
    {
      let mut state = self.inner.state.lock();
      let local = local_member(&self.inner.address, &state.membership)?;
      if local.status == Status::Leave {
        return Err(SwimError::RedundantLeave);
      }
      state.make(&local.address, Status::Leave, local.incarnation_number);
      state.suspicion.stop_all();
    }
    self.inner.gossip.stop();
    info!(address = %self.inner.address, "left the cluster");
    Ok(())
  }

  /// Rejoins after [`member_leave`] by asserting aliveness at a fresh
  /// incarnation.
  ///
  /// [`member_leave`]: Cluster::member_leave
  pub fn member_join(&self) -> Result<(), SwimError> {
    {
      let mut state = self.inner.state.lock();
      let local = local_member(&self.inner.address, &state.membership)?;
      if local.status != Status::Leave {
        return Err(SwimError::RedundantJoin);
      }
      let inc = state.membership.fresh_incarnation();
      state.make(&local.address, Status::Alive, inc);
      state.suspicion.reenable();
    }
    self.inner.gossip.start(&self.inner);
    info!(address = %self.inner.address, "rejoined the cluster");
    Ok(())
  }

  /// Turns every faulty member into a tombstone. Returns the reaped
  /// addresses.
  pub fn reap(&self) -> Vec<String> {
    let mut state = self.inner.state.lock();
    let inc = state.membership.local_incarnation();
    let changes = state
      .membership
      .members()
      .iter()
      .filter(|m| m.status == Status::Faulty)
      .map(|m| Change {
        status: Status::Tombstone,
        ..Change::from_member(m, &self.inner.address, inc)
      })
      .collect::<Vec<_>>();
    let reaped = state
      .update(changes)
      .into_iter()
      .map(|c| c.address)
      .collect::<Vec<_>>();
    if !reaped.is_empty() {
      info!(count = reaped.len(), "reaped faulty members");
    }
    reaped
  }
}

fn local_member(
  address: &str,
  membership: &Membership,
) -> Result<Member, SwimError> {
  let local = membership
    .find(address)
    .cloned()
    .ok_or(SwimError::MissingLocalMember)?;
  if !membership.is_ready() {
    return Err(SwimError::NotReady);
  }
  Ok(local)
}
