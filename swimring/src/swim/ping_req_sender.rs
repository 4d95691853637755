use crate::cluster::Inner;
use crate::error::TransportError;
use crate::membership::Member;
use crate::swim::{request, PingReqRequest, PingReqResponse};
use crate::transport::Endpoint;
use metrics::counter;
use std::sync::Arc;
use tokio::task::JoinSet;
use tracing::{debug, warn};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PingReqOutcome {
  /// A helper reached the target.
  Reachable,
  /// At least one helper tried and failed, none succeeded.
  Unreachable,
  /// There was nobody to ask.
  NoHelpers,
  /// Every helper request itself failed, so nothing was learned about the
  /// target.
  Inconclusive,
}

/// Asks up to `ping_req_size` random members to ping `target` for us. Stops
/// at the first helper that reaches it.
pub(crate) async fn send_ping_reqs(
  inner: &Arc<Inner>,
  target: &Member,
) -> PingReqOutcome {
  let config = inner.config();
  let (helpers, body) = {
    let mut state = inner.state.lock();
    let helpers = state
      .membership
      .get_random_pingable_members(config.ping_req_size, &[&target.address]);
    let body = PingReqRequest {
      checksum: state.membership.checksum(),
      changes: state.piggyback.issue_as_sender(),
      source: inner.address.clone(),
      source_incarnation_number: state.membership.local_incarnation(),
      target: target.address.clone(),
    };
    (helpers, body)
  };
  if helpers.is_empty() {
    debug!(dest = %target.address, "no ping-req helpers available");
    return PingReqOutcome::NoHelpers;
  }
  let timeout = config.ping_req_timeout;
  let mut pending = JoinSet::new();
  for helper in helpers {
    let inner = inner.clone();
    let body = body.clone();
    pending.spawn(async move {
      counter!("swimring_ping_req_sent").increment(1);
      let res: Result<PingReqResponse, TransportError> = request(
        &*inner.channel,
        &helper.address,
        Endpoint::PingReq,
        &body,
        timeout,
      )
      .await;
      if let Ok(res) = &res {
        if !res.changes.is_empty() {
          inner.state.lock().update(res.changes.clone());
        }
      }
      (helper.address, res.map(|r| r.ping_status))
    });
  }
  let mut outcome = PingReqOutcome::Inconclusive;
  while let Some(joined) = pending.join_next().await {
    let (helper, res) = match joined {
      Ok(done) => done,
      Err(_) => continue,
    };
    match res {
      Ok(true) => {
        counter!("swimring_ping_req_reachable").increment(1);
        return PingReqOutcome::Reachable;
      }
      Ok(false) => {
        debug!(
          helper = %helper,
          dest = %target.address,
          "helper could not reach target"
        );
        outcome = PingReqOutcome::Unreachable;
      }
      Err(err) => {
        warn!(helper = %helper, error = %err, "ping-req failed");
        counter!("swimring_ping_req_failed").increment(1);
      }
    }
  }
  outcome
}
