use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use swimring::membership::{MembershipEvent, Status};
use swimring::swim::PingReqRequest;
use swimring::testkit::{FailureConfig, LocalNetwork};
use swimring::transport::{Endpoint, RequestHandler};
use swimring::{Cluster, SwimConfig, SwimError};
use tokio::time::sleep;

async fn cluster(
  net: &LocalNetwork,
  n: u16,
  config: SwimConfig,
) -> Vec<Cluster> {
  let hosts = (0..n)
    .map(|i| format!("127.0.0.1:{}", 3000 + i))
    .collect::<Vec<_>>();
  let nodes = hosts
    .iter()
    .map(|a| net.spawn_node(a, config.clone()).unwrap())
    .collect::<Vec<_>>();
  for node in nodes.iter() {
    node.bootstrap(&hosts).await.unwrap();
  }
  nodes
}

/// A cluster whose nodes only ping when told to.
async fn quiet_cluster(net: &LocalNetwork, n: u16) -> Vec<Cluster> {
  let nodes = cluster(net, n, SwimConfig::default()).await;
  for node in nodes.iter() {
    node.gossip_stop();
  }
  nodes
}

/// Ticks `node` until the member it pings is `target`.
async fn tick_until(node: &Cluster, target: &str) {
  for _ in 0..10 {
    if let Some(pinged) = node.gossip_tick().await {
      if pinged.address == target {
        return;
      }
    }
  }
  panic!("{} never pinged {}", node.whoami(), target);
}

async fn wait_for<F: Fn() -> bool>(f: F) -> bool {
  for _ in 0..600 {
    if f() {
      return true;
    }
    sleep(Duration::from_millis(100)).await;
  }
  false
}

fn statuses_of(
  events: &mut tokio::sync::broadcast::Receiver<MembershipEvent>,
  address: &str,
) -> Vec<Status> {
  let mut statuses = Vec::new();
  while let Ok(event) = events.try_recv() {
    if let MembershipEvent::Updated(changes) = event {
      statuses.extend(
        changes
          .into_iter()
          .filter(|c| c.address == address)
          .map(|c| c.status),
      );
    }
  }
  statuses
}

/// Passes requests through to a node and remembers who asked it for a
/// ping-req and about whom.
struct Recorder {
  node: Cluster,
  ping_reqs: Mutex<Vec<(String, String)>>,
}

#[async_trait]
impl RequestHandler for Recorder {
  async fn handle(
    &self,
    endpoint: Endpoint,
    body: Value,
  ) -> Result<Value, SwimError> {
    if endpoint == Endpoint::PingReq {
      let req: PingReqRequest = serde_json::from_value(body.clone())?;
      self.ping_reqs.lock().push((req.source, req.target));
    }
    self.node.handle(endpoint, body).await
  }
}

#[tokio::test(start_paused = true)]
async fn test_helper_reaches_target_after_failed_ping() {
  let net = LocalNetwork::new();
  let nodes = quiet_cluster(&net, 3).await;
  let (a, b, c) = (nodes[0].whoami(), nodes[1].whoami(), nodes[2].whoami());
  let recorder = Arc::new(Recorder {
    node: nodes[1].clone(),
    ping_reqs: Mutex::new(Vec::new()),
  });
  net.register(b, recorder.clone());
  net.set_link_failure(a, c, FailureConfig::partitioned());
  let inc = nodes[0].member(c).unwrap().incarnation_number;
  let mut events = nodes[0].subscribe_membership();

  tick_until(&nodes[0], c).await;

  assert_eq!(
    *recorder.ping_reqs.lock(),
    vec![(a.to_string(), c.to_string())]
  );
  let seen = nodes[0].member(c).unwrap();
  assert_eq!(seen.status, Status::Alive);
  assert_eq!(seen.incarnation_number, inc);
  assert!(statuses_of(&mut events, c).is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_target_suspected_when_no_helper_reaches_it() {
  let net = LocalNetwork::new();
  let nodes = quiet_cluster(&net, 3).await;
  let (a, b, c) = (nodes[0].whoami(), nodes[1].whoami(), nodes[2].whoami());
  net.set_link_failure(a, c, FailureConfig::partitioned());
  net.set_link_failure(b, c, FailureConfig::partitioned());
  let inc = nodes[0].member(c).unwrap().incarnation_number;

  tick_until(&nodes[0], c).await;

  let seen = nodes[0].member(c).unwrap();
  assert_eq!(seen.status, Status::Suspect);
  assert_eq!(seen.incarnation_number, inc);
  assert_eq!(nodes[0].member(b).unwrap().status, Status::Alive);
}

#[tokio::test(start_paused = true)]
async fn test_failed_helpers_leave_target_unchanged() {
  let net = LocalNetwork::new();
  let nodes = quiet_cluster(&net, 3).await;
  let (a, b, c) = (nodes[0].whoami(), nodes[1].whoami(), nodes[2].whoami());
  net.set_link_failure(a, b, FailureConfig::partitioned());
  net.set_link_failure(a, c, FailureConfig::partitioned());
  let checksum = nodes[0].checksum();
  let mut events = nodes[0].subscribe_membership();

  tick_until(&nodes[0], c).await;

  assert_eq!(nodes[0].member(c).unwrap().status, Status::Alive);
  assert_eq!(nodes[0].member(b).unwrap().status, Status::Alive);
  assert_eq!(nodes[0].checksum(), checksum);
  assert!(statuses_of(&mut events, c).is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_falsely_suspected_node_refutes_through_gossip() {
  let net = LocalNetwork::new();
  let nodes = cluster(&net, 3, SwimConfig::default()).await;
  let target = nodes[2].whoami().to_string();
  let inc = nodes[0].member(&target).unwrap().incarnation_number;
  let mut events = nodes[0].subscribe_membership();

  let rumor = json!({
    "checksum": nodes[0].checksum(),
    "changes": [{
      "address": target,
      "status": "suspect",
      "incarnationNumber": inc,
      "source": nodes[1].whoami(),
    }],
    "source": nodes[1].whoami(),
  });
  nodes[0].handle(Endpoint::Ping, rumor).await.unwrap();
  assert_eq!(nodes[0].member(&target).unwrap().status, Status::Suspect);

  assert!(
    wait_for(|| nodes.iter().all(|n| {
      let m = n.member(&target).unwrap();
      m.status == Status::Alive && m.incarnation_number > inc
    }))
    .await
  );
  let statuses = statuses_of(&mut events, &target);
  assert_eq!(statuses.first(), Some(&Status::Suspect));
  assert!(!statuses.contains(&Status::Faulty));
  assert!(nodes[0].ring_stats().servers.contains(&target));
}

#[tokio::test(start_paused = true)]
async fn test_reaped_live_node_rebuts_tombstone() {
  let net = LocalNetwork::new();
  let nodes = cluster(&net, 3, SwimConfig::default()).await;
  let target = nodes[2].whoami().to_string();
  let inc = nodes[0].member(&target).unwrap().incarnation_number;

  let rumor = json!({
    "changes": [{
      "address": target,
      "status": "faulty",
      "incarnationNumber": inc,
      "source": nodes[1].whoami(),
    }],
    "source": nodes[1].whoami(),
  });
  nodes[0].handle(Endpoint::Ping, rumor).await.unwrap();
  assert_eq!(nodes[0].reap(), vec![target.clone()]);

  assert!(
    wait_for(|| nodes.iter().all(|n| {
      n.member(&target).map(|m| (m.status, m.incarnation_number > inc))
        == Some((Status::Alive, true))
    }))
    .await
  );
}
