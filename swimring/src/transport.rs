//! The seam between the protocol and whatever carries its messages.
//!
//! Bodies are JSON values so that any RPC framework able to move JSON can
//! carry them. [`crate::testkit::LocalNetwork`] is an in-process
//! implementation used by the tests.

use crate::error::{SwimError, TransportError};
use async_trait::async_trait;
use serde_json::Value;
use std::fmt;

#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum Endpoint {
  Join,
  Ping,
  PingReq,
}
impl Endpoint {
  pub const ALL: [Endpoint; 3] =
    [Endpoint::Join, Endpoint::Ping, Endpoint::PingReq];

  pub fn path(&self) -> &'static str {
    match self {
      Endpoint::Join => "/protocol/join",
      Endpoint::Ping => "/protocol/ping",
      Endpoint::PingReq => "/protocol/ping-req",
    }
  }

  pub fn from_path(path: &str) -> Option<Endpoint> {
    Endpoint::ALL.iter().copied().find(|e| e.path() == path)
  }
}
impl fmt::Display for Endpoint {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.path())
  }
}

/// Outbound side: delivers `body` to `endpoint` on the node at `target` and
/// waits for its answer. Implementations do not need to enforce timeouts,
/// the callers wrap every send in one.
#[async_trait]
pub trait Channel: Send + Sync + 'static {
  async fn send(
    &self,
    target: &str,
    endpoint: Endpoint,
    body: Value,
  ) -> Result<Value, TransportError>;
}

/// Inbound side: what a transport calls when a request arrives.
#[async_trait]
pub trait RequestHandler: Send + Sync + 'static {
  async fn handle(
    &self,
    endpoint: Endpoint,
    body: Value,
  ) -> Result<Value, SwimError>;
}

#[test]
fn test_endpoint_paths() {
  for endpoint in Endpoint::ALL.iter() {
    assert_eq!(Endpoint::from_path(endpoint.path()), Some(*endpoint));
  }
  assert_eq!(Endpoint::from_path("/admin/gossip/start"), None);
  assert_eq!(Endpoint::PingReq.to_string(), "/protocol/ping-req");
}
