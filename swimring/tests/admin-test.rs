use maplit::hashmap;
use serde_json::json;
use std::time::Duration;
use swimring::membership::Status;
use swimring::swim::{GossipStatus, JoinResponse, PingResponse};
use swimring::testkit::{FailureConfig, LocalNetwork};
use swimring::transport::{Endpoint, RequestHandler};
use swimring::{Cluster, SwimConfig, SwimError};
use tokio::time::sleep;

fn config() -> SwimConfig {
  SwimConfig {
    suspicion_timeout: Duration::from_millis(1000),
    ..SwimConfig::default()
  }
}

async fn cluster(net: &LocalNetwork, n: u16) -> Vec<Cluster> {
  let hosts = (0..n)
    .map(|i| format!("127.0.0.1:{}", 3000 + i))
    .collect::<Vec<_>>();
  let nodes = hosts
    .iter()
    .map(|a| net.spawn_node(a, config()).unwrap())
    .collect::<Vec<_>>();
  for node in nodes.iter() {
    node.bootstrap(&hosts).await.unwrap();
  }
  nodes
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

fn status_of(node: &Cluster, address: &str) -> Option<Status> {
  node.member(address).map(|m| m.status)
}

#[tokio::test(start_paused = true)]
async fn test_leave_and_rejoin() {
  let net = LocalNetwork::new();
  let nodes = cluster(&net, 3).await;
  let leaver = nodes[1].whoami().to_string();

  nodes[1].member_leave().unwrap();
  assert_eq!(nodes[1].gossip_status(), GossipStatus::Stopped);
  assert!(matches!(
    nodes[1].member_leave(),
    Err(SwimError::RedundantLeave)
  ));
  assert!(
    wait_for(|| status_of(&nodes[0], &leaver) == Some(Status::Leave)).await
  );
  assert!(!nodes[0].ring_stats().servers.contains(&leaver));
  assert!(!nodes[1].ring_stats().servers.contains(&leaver));

  assert!(matches!(
    nodes[0].member_join(),
    Err(SwimError::RedundantJoin)
  ));
  nodes[1].member_join().unwrap();
  assert_eq!(nodes[1].gossip_status(), GossipStatus::Running);
  assert!(
    wait_for(|| nodes
      .iter()
      .all(|n| status_of(n, &leaver) == Some(Status::Alive)))
    .await
  );
  assert!(nodes[2].ring_stats().servers.contains(&leaver));
}

#[tokio::test(start_paused = true)]
async fn test_reap_turns_faulty_into_tombstones() {
  let net = LocalNetwork::new();
  let nodes = cluster(&net, 3).await;
  let dead = nodes[2].whoami().to_string();
  assert!(nodes[0].reap().is_empty());

  net.kill(&nodes[2]);
  assert!(
    wait_for(|| status_of(&nodes[0], &dead) == Some(Status::Faulty)).await
  );
  assert_eq!(nodes[0].reap(), vec![dead.clone()]);
  assert_eq!(status_of(&nodes[0], &dead), Some(Status::Tombstone));
  assert!(nodes[0].reap().is_empty());
  assert!(
    wait_for(|| status_of(&nodes[1], &dead) == Some(Status::Tombstone)).await
  );
}

#[tokio::test(start_paused = true)]
async fn test_leave_before_bootstrap() {
  let net = LocalNetwork::new();
  let node = net.spawn_node("127.0.0.1:3000", config()).unwrap();
  assert!(matches!(
    node.member_leave(),
    Err(SwimError::MissingLocalMember)
  ));
}

#[tokio::test(start_paused = true)]
async fn test_gossip_controls() {
  let net = LocalNetwork::new();
  let nodes = cluster(&net, 2).await;
  assert_eq!(nodes[0].gossip_status(), GossipStatus::Running);
  assert!(!nodes[0].gossip_start());
  assert!(nodes[0].gossip_stop());
  assert!(!nodes[0].gossip_stop());
  assert_eq!(nodes[0].gossip_status(), GossipStatus::Stopped);

  let pinged = nodes[0].gossip_tick().await.unwrap();
  assert_eq!(pinged.address, nodes[1].whoami());
  assert!(nodes[0].gossip_start());

  nodes[0].destroy();
  assert_eq!(nodes[0].gossip_status(), GossipStatus::Stopped);
  assert!(!nodes[0].gossip_start());
}

#[tokio::test(start_paused = true)]
async fn test_config_get_set() {
  let net = LocalNetwork::new();
  let node = net.spawn_node("127.0.0.1:3000", config()).unwrap();
  assert_eq!(node.config_get()["suspicionTimeout"], 1000);
  let patch = hashmap! {
    "suspicionTimeout" => 250,
    "maxPiggybackCount" => 3,
  };
  let updated = node
    .config_set(&serde_json::to_value(patch).unwrap())
    .unwrap();
  assert_eq!(updated["suspicionTimeout"], 250);
  assert_eq!(node.config_get()["maxPiggybackCount"], 3);
  assert!(matches!(
    node.config_set(&json!({ "nope": true })),
    Err(SwimError::UnknownConfigKey(_))
  ));
  assert!(matches!(
    node.config_set(&json!({ "replicaPoints": 7 })),
    Err(SwimError::InvalidConfig(_))
  ));
  assert_eq!(node.config_get()["replicaPoints"], 100);
}

#[tokio::test(start_paused = true)]
async fn test_join_handler_rejects_bad_requests() {
  let net = LocalNetwork::new();
  let node = net.spawn_node("127.0.0.1:3000", config()).unwrap();
  node.bootstrap(&[]).await.unwrap();

  let res = node
    .handle(
      Endpoint::Join,
      json!({
        "app": "other",
        "source": "127.0.0.1:3001",
        "incarnationNumber": 1,
      }),
    )
    .await;
  assert!(matches!(res, Err(SwimError::InvalidJoinApp { .. })));
  let res = node
    .handle(
      Endpoint::Join,
      json!({
        "app": "swimring",
        "source": "127.0.0.1:3000",
        "incarnationNumber": 1,
      }),
    )
    .await;
  assert!(matches!(res, Err(SwimError::InvalidJoinSource(_))));
  let res = node.handle(Endpoint::Join, json!({ "app": 1 })).await;
  assert!(matches!(res, Err(SwimError::BadBody(_))));

  let res = node
    .handle(
      Endpoint::Join,
      json!({
        "app": "swimring",
        "source": "127.0.0.1:3001",
        "incarnationNumber": 9,
      }),
    )
    .await
    .unwrap();
  let res: JoinResponse = serde_json::from_value(res).unwrap();
  assert_eq!(res.coordinator, "127.0.0.1:3000");
  assert_eq!(res.membership.len(), 2);
  assert_eq!(res.membership_checksum, node.checksum());
  assert_eq!(
    node.member("127.0.0.1:3001").unwrap().incarnation_number,
    9
  );
}

#[tokio::test(start_paused = true)]
async fn test_ping_answers_with_full_sync_once_caught_up() {
  let net = LocalNetwork::new();
  let node = net
    .spawn_node(
      "127.0.0.1:3000",
      SwimConfig {
        max_piggyback_count: 0,
        ..config()
      },
    )
    .unwrap();
  node.bootstrap(&[]).await.unwrap();
  node.gossip_stop();
  let ping =
    json!({ "checksum": 1, "changes": [], "source": "127.0.0.1:3001" });

  // The local alive change is still pending and goes out first.
  let res = node.handle(Endpoint::Ping, ping.clone()).await.unwrap();
  let res: PingResponse = serde_json::from_value(res).unwrap();
  assert!(res.ping_status);
  assert_eq!(res.changes.len(), 1);

  let res = node.handle(Endpoint::Ping, ping).await.unwrap();
  let res: PingResponse = serde_json::from_value(res).unwrap();
  assert_eq!(res.changes.len(), 1);
  assert_eq!(res.changes[0].address, "127.0.0.1:3000");
  assert_eq!(res.changes[0].status, Status::Alive);

  let ping = json!({
    "checksum": node.checksum(),
    "changes": [],
    "source": "x:1",
  });
  let res = node.handle(Endpoint::Ping, ping).await.unwrap();
  let res: PingResponse = serde_json::from_value(res).unwrap();
  assert!(res.changes.is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_lossy_network_still_converges() {
  let net = LocalNetwork::new();
  let nodes = cluster(&net, 3).await;
  for node in nodes.iter() {
    node.config_set(&json!({ "suspicionTimeout": 5000 })).unwrap();
  }
  net.set_node_failure(
    nodes[2].whoami(),
    FailureConfig {
      drop_prob: 0.2,
      delay: Some((Duration::from_millis(10), Duration::from_millis(50))),
    },
  );
  sleep(Duration::from_secs(10)).await;
  assert!(
    wait_for(|| {
      let checksum = nodes[0].checksum();
      nodes.iter().all(|n| {
        n.checksum() == checksum
          && n.members().iter().all(|m| m.status == Status::Alive)
      })
    })
    .await
  );
}
