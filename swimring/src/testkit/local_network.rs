use crate::cluster::Cluster;
use crate::config::SwimConfig;
use crate::error::{SwimError, TransportError};
use crate::testkit::{FailureConfig, FailureConfigMap};
use crate::transport::{Channel, Endpoint, RequestHandler};
use async_trait::async_trait;
use hashbrown::HashMap;
use parking_lot::Mutex;
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tracing::trace;

#[derive(Default)]
struct Net {
  handlers: HashMap<String, Arc<dyn RequestHandler>>,
  failures: FailureConfigMap,
}

/// An in-process network. Requests are routed straight to the handler
/// registered under the target address, subject to the configured drops
/// and delays. Unregistered addresses are unreachable.
///
/// Registered nodes hold a channel back into the network, so they stay
/// alive until they are unregistered or [`clear`] is called.
///
/// [`clear`]: LocalNetwork::clear
#[derive(Clone, Default)]
pub struct LocalNetwork {
  net: Arc<Mutex<Net>>,
}
impl LocalNetwork {
  pub fn new() -> LocalNetwork {
    LocalNetwork::default()
  }

  /// A channel whose requests originate from `from`, so that link
  /// failures can apply to them.
  pub fn channel(&self, from: &str) -> Arc<dyn Channel> {
    Arc::new(LinkChannel {
      net: self.net.clone(),
      from: from.to_string(),
    })
  }

  pub fn register(&self, address: &str, handler: Arc<dyn RequestHandler>) {
    self.net.lock().handlers.insert(address.to_string(), handler);
  }

  pub fn unregister(&self, address: &str) -> bool {
    self.net.lock().handlers.remove(address).is_some()
  }

  /// Unregisters every node.
  pub fn clear(&self) {
    let handlers = std::mem::take(&mut self.net.lock().handlers);
    drop(handlers);
  }

  pub fn set_failures(&self, failures: FailureConfigMap) {
    self.net.lock().failures = failures;
  }

  pub fn set_node_failure(&self, address: &str, failure: FailureConfig) {
    self
      .net
      .lock()
      .failures
      .node_wide
      .insert(address.to_string(), failure);
  }

  /// Applies `failure` to requests sent from `from` to `to` only.
  pub fn set_link_failure(&self, from: &str, to: &str, failure: FailureConfig) {
    self
      .net
      .lock()
      .failures
      .links
      .insert((from.to_string(), to.to_string()), failure);
  }

  /// Creates a node on this network and registers it under `address`.
  pub fn spawn_node(
    &self,
    address: &str,
    config: SwimConfig,
  ) -> Result<Cluster, SwimError> {
    let channel = self.channel(address);
    let cluster = Cluster::new(address.to_string(), config, channel)?;
    self.register(address, Arc::new(cluster.clone()));
    Ok(cluster)
  }

  /// Simulates a crash: the node stops running and stops answering.
  pub fn kill(&self, cluster: &Cluster) {
    self.unregister(cluster.whoami());
    cluster.destroy();
  }
}

struct LinkChannel {
  net: Arc<Mutex<Net>>,
  from: String,
}

#[async_trait]
impl Channel for LinkChannel {
  async fn send(
    &self,
    target: &str,
    endpoint: Endpoint,
    body: Value,
  ) -> Result<Value, TransportError> {
    let (handler, failure) = {
      let net = self.net.lock();
      let handler = net
        .handlers
        .get(target)
        .cloned()
        .ok_or_else(|| TransportError::Unreachable(target.to_string()))?;
      (handler, *net.failures.get_link(&self.from, target))
    };
    let mut rng = SmallRng::from_entropy();
    if rng.gen::<f64>() < failure.drop_prob {
      trace!(
        from = %self.from,
        dest = %target,
        endpoint = %endpoint,
        "dropping request"
      );
      return Err(TransportError::Dropped(target.to_string()));
    }
    if let Some((a, b)) = failure.delay {
      let range = a.min(b).as_millis()..=a.max(b).as_millis();
      sleep(Duration::from_millis(rng.gen_range(range) as u64)).await;
    }
    handler
      .handle(endpoint, body)
      .await
      .map_err(|e| TransportError::Remote(target.to_string(), e.to_string()))
  }
}

#[cfg(test)]
struct Echo;

#[cfg(test)]
#[async_trait]
impl RequestHandler for Echo {
  async fn handle(
    &self,
    _endpoint: Endpoint,
    body: Value,
  ) -> Result<Value, SwimError> {
    Ok(body)
  }
}

#[tokio::test(start_paused = true)]
async fn test_link_failures_are_directed() {
  let net = LocalNetwork::new();
  net.register("a:1", Arc::new(Echo));
  net.register("b:1", Arc::new(Echo));
  net.set_link_failure("a:1", "b:1", FailureConfig::partitioned());
  let from_a = net.channel("a:1");
  let from_b = net.channel("b:1");
  let body = serde_json::json!({ "n": 1 });
  assert_eq!(
    from_a.send("b:1", Endpoint::Ping, body.clone()).await,
    Err(TransportError::Dropped("b:1".to_string()))
  );
  assert_eq!(
    from_b.send("a:1", Endpoint::Ping, body.clone()).await,
    Ok(body.clone())
  );
  assert_eq!(
    from_a.send("c:1", Endpoint::Ping, body).await,
    Err(TransportError::Unreachable("c:1".to_string()))
  );
}

#[tokio::test(start_paused = true)]
async fn test_reversed_delay_bounds() {
  let net = LocalNetwork::new();
  net.register("a:1", Arc::new(Echo));
  net.set_node_failure(
    "a:1",
    FailureConfig {
      drop_prob: 0.0,
      delay: Some((Duration::from_millis(50), Duration::from_millis(10))),
    },
  );
  let started = tokio::time::Instant::now();
  let res = net
    .channel("b:1")
    .send("a:1", Endpoint::Ping, Value::Null)
    .await;
  assert_eq!(res, Ok(Value::Null));
  let elapsed = started.elapsed();
  assert!(elapsed >= Duration::from_millis(10));
  assert!(elapsed <= Duration::from_millis(50));
}

#[tokio::test]
async fn test_clear_releases_nodes() {
  let net = LocalNetwork::new();
  let node = net.spawn_node("a:1", SwimConfig::default()).unwrap();
  let inner = Arc::downgrade(&node.inner);
  drop(node);
  assert!(inner.upgrade().is_some());
  net.clear();
  assert!(inner.upgrade().is_none());
}
