use crate::cluster::Inner;
use crate::error::TransportError;
use crate::swim::{request, PingRequest, PingResponse};
use crate::transport::Endpoint;
use metrics::counter;
use std::time::Duration;
use tracing::{debug, trace};

/// Pings `target` with our pending changes attached and applies whatever
/// changes come back. Errors mean the target did not answer in time.
pub(crate) async fn send_ping(
  inner: &Inner,
  target: &str,
  timeout: Duration,
) -> Result<PingResponse, TransportError> {
  let body = {
    let mut state = inner.state.lock();
    PingRequest {
      checksum: state.membership.checksum(),
      changes: state.piggyback.issue_as_sender(),
      source: inner.address.clone(),
      source_incarnation_number: state.membership.local_incarnation(),
    }
  };
  trace!(dest = %target, changes = body.changes.len(), "sending ping");
  counter!("swimring_ping_sent").increment(1);
  let res: Result<PingResponse, _> =
    request(&*inner.channel, target, Endpoint::Ping, &body, timeout).await;
  match res {
    Ok(res) => {
      counter!("swimring_ping_ok").increment(1);
      if !res.changes.is_empty() {
        inner.state.lock().update(res.changes.clone());
      }
      Ok(res)
    }
    Err(err) => {
      counter!("swimring_ping_failed").increment(1);
      debug!(dest = %target, error = %err, "ping failed");
      Err(err)
    }
  }
}
