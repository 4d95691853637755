//! Inbound `/protocol/*` requests.

use crate::cluster::Inner;
use crate::error::SwimError;
use crate::membership::Status;
use crate::swim::ping_sender::send_ping;
use crate::swim::{
  JoinRequest, JoinResponse, PingReqRequest, PingReqResponse, PingRequest,
  PingResponse,
};
use metrics::counter;
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, warn};

pub(crate) fn handle_join(
  inner: &Inner,
  body: Value,
) -> Result<Value, SwimError> {
  let req: JoinRequest = serde_json::from_value(body)?;
  let app = inner.config.lock().app.clone();
  if req.app != app {
    warn!(
      source = %req.source,
      app = %req.app,
      "refusing join from another app"
    );
    return Err(SwimError::InvalidJoinApp {
      expected: app,
      actual: req.app,
    });
  }
  if req.source == inner.address {
    return Err(SwimError::InvalidJoinSource(req.source));
  }
  counter!("swimring_join_recv").increment(1);
  let mut state = inner.state.lock();
  state.make(&req.source, Status::Alive, req.incarnation_number);
  debug!(source = %req.source, "join accepted");
  let res = JoinResponse {
    app: app,
    coordinator: inner.address.clone(),
    membership: state.membership.snapshot(),
    membership_checksum: state.membership.checksum(),
  };
  Ok(serde_json::to_value(res)?)
}

pub(crate) fn handle_ping(
  inner: &Inner,
  body: Value,
) -> Result<Value, SwimError> {
  let req: PingRequest = serde_json::from_value(body)?;
  counter!("swimring_ping_recv").increment(1);
  let mut guard = inner.state.lock();
  let state = &mut *guard;
  state.update(req.changes);
  let changes = state
    .piggyback
    .issue_as_receiver(req.checksum, &state.membership);
  let res = PingResponse {
    changes: changes,
    ping_status: true,
  };
  Ok(serde_json::to_value(res)?)
}

/// Pings the requested target on the sender's behalf and reports whether it
/// answered.
pub(crate) async fn handle_ping_req(
  inner: &Arc<Inner>,
  body: Value,
) -> Result<Value, SwimError> {
  let req: PingReqRequest = serde_json::from_value(body)?;
  counter!("swimring_ping_req_recv").increment(1);
  inner.state.lock().update(req.changes);
  let timeout = inner.config.lock().ping_timeout;
  let reachable = send_ping(inner, &req.target, timeout).await.is_ok();
  debug!(
    source = %req.source,
    dest = %req.target,
    reachable = reachable,
    "ping-req relayed"
  );
  let changes = {
    let mut guard = inner.state.lock();
    let state = &mut *guard;
    state
      .piggyback
      .issue_as_receiver(req.checksum, &state.membership)
  };
  let res = PingReqResponse {
    changes: changes,
    ping_status: reachable,
    target: req.target,
  };
  Ok(serde_json::to_value(res)?)
}
