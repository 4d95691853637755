//! The failure detection protocol: probing, suspicion, dissemination and
//! joining.

mod gossip;
pub(crate) mod handlers;
pub(crate) mod joiner;
mod messages;
mod piggyback;
mod ping_req_sender;
mod ping_sender;
mod suspicion;

use crate::error::TransportError;
use crate::transport::{Channel, Endpoint};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::time::Duration;

#[rustfmt::skip]
pub(crate) use {
  gossip::Gossip,
  gossip::tick,
  ping_req_sender::PingReqOutcome,
};

#[rustfmt::skip]
pub use {
  gossip::GossipStatus,
  messages::JoinRequest,
  messages::JoinResponse,
  messages::PingReqRequest,
  messages::PingReqResponse,
  messages::PingRequest,
  messages::PingResponse,
  piggyback::PiggybackBuffer,
  suspicion::Expiry,
  suspicion::SuspicionManager,
};

/// Sends one request and decodes the answer, giving up after `timeout`.
pub(crate) async fn request<Req, Res>(
  channel: &dyn Channel,
  target: &str,
  endpoint: Endpoint,
  body: &Req,
  timeout: Duration,
) -> Result<Res, TransportError>
where
  Req: Serialize,
  Res: DeserializeOwned,
{
  let remote = |e: serde_json::Error| {
    TransportError::Remote(target.to_string(), e.to_string())
  };
  let body = serde_json::to_value(body).map_err(remote)?;
  let res = tokio::time::timeout(timeout, channel.send(target, endpoint, body))
    .await
    .map_err(|_| TransportError::Timeout(target.to_string(), timeout))??;
  serde_json::from_value(res).map_err(remote)
}
