use std::time::Duration;
use swimring::membership::{MembershipEvent, Status};
use swimring::ring::RingEvent;
use swimring::testkit::LocalNetwork;
use swimring::{Cluster, SwimConfig, SwimError};
use tokio::time::sleep;
use tracing_subscriber::EnvFilter;

fn init_logging() {
  let _ = tracing_subscriber::fmt()
    .with_env_filter(EnvFilter::from_default_env())
    .with_test_writer()
    .try_init();
}

fn config() -> SwimConfig {
  SwimConfig {
    suspicion_timeout: Duration::from_millis(1000),
    ..SwimConfig::default()
  }
}

fn addresses(n: u16) -> Vec<String> {
  (0..n).map(|i| format!("127.0.0.1:{}", 3000 + i)).collect()
}

fn spawn(net: &LocalNetwork, n: u16) -> Vec<Cluster> {
  addresses(n)
    .iter()
    .map(|a| net.spawn_node(a, config()).unwrap())
    .collect()
}

async fn bootstrap_all(nodes: &[Cluster]) {
  let hosts = nodes
    .iter()
    .map(|n| n.whoami().to_string())
    .collect::<Vec<_>>();
  for node in nodes {
    node.bootstrap(&hosts).await.unwrap();
  }
}

fn count(node: &Cluster, status: Status) -> usize {
  node.members().iter().filter(|m| m.status == status).count()
}

/// Waits until every node sees every other node alive and all checksums
/// agree.
async fn converge(nodes: &[Cluster]) -> bool {
  for _ in 0..300 {
    let checksum = nodes[0].checksum();
    let agreed = nodes.iter().all(|n| {
      n.checksum() == checksum && count(n, Status::Alive) == nodes.len()
    });
    if agreed {
      return true;
    }
    sleep(Duration::from_millis(200)).await;
  }
  false
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

#[tokio::test(start_paused = true)]
async fn test_two_nodes_join_each_other() {
  let net = LocalNetwork::new();
  let nodes = spawn(&net, 2);
  let hosts = addresses(2);
  let (a, b) =
    tokio::join!(nodes[0].bootstrap(&hosts), nodes[1].bootstrap(&hosts));
  assert_eq!(a.unwrap(), vec![hosts[1].clone()]);
  assert_eq!(b.unwrap(), vec![hosts[0].clone()]);
  for node in nodes.iter() {
    assert!(node.is_ready());
    assert_eq!(node.members().len(), 2);
    for host in hosts.iter() {
      assert_eq!(node.member(host).unwrap().status, Status::Alive);
    }
  }
  assert_eq!(
    nodes[0].member(&hosts[1]).unwrap().incarnation_number,
    nodes[1].member(&hosts[1]).unwrap().incarnation_number,
  );
  assert_eq!(nodes[0].checksum(), nodes[1].checksum());
  assert!(nodes[0].checksum().is_some());
}

#[tokio::test(start_paused = true)]
async fn test_single_node_owns_every_key() {
  let net = LocalNetwork::new();
  let node = net.spawn_node("127.0.0.1:3000", config()).unwrap();
  let joined = node.bootstrap(&["127.0.0.1:3000".to_string()]).await.unwrap();
  assert!(joined.is_empty());
  assert_eq!(node.lookup("anything").as_deref(), Some("127.0.0.1:3000"));
  assert_eq!(node.lookup_n("anything", 3), vec!["127.0.0.1:3000"]);
  assert!(matches!(
    node.bootstrap(&[]).await,
    Err(SwimError::AlreadyBootstrapped)
  ));
}

#[tokio::test(start_paused = true)]
async fn test_three_nodes_converge_and_agree_on_lookups() {
  init_logging();
  let net = LocalNetwork::new();
  let nodes = spawn(&net, 3);
  let mut ring_events = nodes[0].subscribe_ring();
  bootstrap_all(&nodes).await;
  assert!(converge(&nodes).await);

  let stats = nodes[0].ring_stats();
  assert_eq!(stats.servers, addresses(3));
  for node in nodes.iter() {
    assert_eq!(node.ring_stats(), stats);
  }
  for key in ["alpha", "beta", "gamma", "delta"].iter() {
    let owner = nodes[0].lookup(key);
    assert!(owner.is_some());
    assert!(nodes.iter().all(|n| n.lookup(key) == owner));
    let mut all = nodes[1].lookup_n(key, 5);
    assert_eq!(all.len(), 3);
    assert_eq!(all[0], owner.unwrap());
    all.sort();
    assert_eq!(all, addresses(3));
  }

  let mut added = Vec::new();
  while let Ok(event) = ring_events.try_recv() {
    if let RingEvent::Added(server) = event {
      added.push(server);
    }
  }
  added.sort();
  assert_eq!(added, addresses(3));
}

#[tokio::test(start_paused = true)]
async fn test_killed_node_becomes_faulty_and_leaves_ring() {
  init_logging();
  let net = LocalNetwork::new();
  let nodes = spawn(&net, 4);
  bootstrap_all(&nodes).await;
  assert!(converge(&nodes).await);

  let dead = nodes[3].whoami().to_string();
  let mut events = nodes[0].subscribe_membership();
  net.kill(&nodes[3]);
  let survivors = &nodes[..3];
  assert!(
    wait_for(|| survivors.iter().all(|n| {
      n.member(&dead).map(|m| m.status) == Some(Status::Faulty)
    }))
    .await
  );
  for node in survivors {
    assert!(!node.ring_stats().servers.contains(&dead));
    for key in ["alpha", "beta", "gamma"].iter() {
      assert_ne!(node.lookup(key), Some(dead.clone()));
    }
  }
  assert!(wait_for(|| {
    let checksum = survivors[0].checksum();
    survivors.iter().all(|n| n.checksum() == checksum)
  })
  .await);

  let mut statuses = Vec::new();
  while let Ok(event) = events.try_recv() {
    if let MembershipEvent::Updated(changes) = event {
      statuses.extend(
        changes
          .into_iter()
          .filter(|c| c.address == dead)
          .map(|c| c.status),
      );
    }
  }
  assert!(statuses.contains(&Status::Faulty));
  assert!(!statuses.contains(&Status::Alive));
}

#[tokio::test(start_paused = true)]
async fn test_join_duration_exceeded() {
  let net = LocalNetwork::new();
  let node = net
    .spawn_node(
      "127.0.0.1:3000",
      SwimConfig {
        max_join_duration: Duration::from_secs(2),
        ..config()
      },
    )
    .unwrap();
  let res = node.bootstrap(&["127.0.0.1:3999".to_string()]).await;
  assert!(matches!(res, Err(SwimError::JoinDurationExceeded(_))));
  assert!(!node.is_ready());
}

#[tokio::test(start_paused = true)]
async fn test_destroy_aborts_join() {
  let net = LocalNetwork::new();
  let node = net.spawn_node("127.0.0.1:3000", config()).unwrap();
  let joining = node.clone();
  let handle = tokio::spawn(async move {
    joining.bootstrap(&["127.0.0.1:3999".to_string()]).await
  });
  sleep(Duration::from_secs(3)).await;
  node.destroy();
  let res = handle.await.unwrap();
  assert!(matches!(res, Err(SwimError::JoinAborted)));
  assert!(node.is_destroyed());
}
