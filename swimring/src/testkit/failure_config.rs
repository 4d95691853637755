use im::HashMap;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// How unreliable the link to a node is.
#[derive(Default, Serialize, Deserialize, Clone, Copy, Debug, PartialEq)]
pub struct FailureConfig {
  /// Chance in `[0, 1]` that a request is dropped.
  pub drop_prob: f64,
  /// Requests that get through are delayed by a uniform random duration
  /// between the two bounds, in either order.
  pub delay: Option<(Duration, Duration)>,
}
impl FailureConfig {
  /// Drops every request.
  pub fn partitioned() -> FailureConfig {
    FailureConfig {
      drop_prob: 1.0,
      delay: None,
    }
  }
}

/// Failure settings looked up most specific first: the directed link
/// `(from, to)`, then the target node, then the cluster-wide default.
#[derive(Clone, Default, Serialize, Deserialize, Debug)]
pub struct FailureConfigMap {
  pub cluster_wide: FailureConfig,
  pub node_wide: HashMap<String, FailureConfig>,
  pub links: HashMap<(String, String), FailureConfig>,
}
impl FailureConfigMap {
  pub fn get(&self, address: &str) -> &FailureConfig {
    self.node_wide.get(address).unwrap_or(&self.cluster_wide)
  }

  pub fn get_link(&self, from: &str, to: &str) -> &FailureConfig {
    self
      .links
      .get(&(from.to_string(), to.to_string()))
      .unwrap_or_else(|| self.get(to))
  }
}

#[test]
fn test_node_config_shadows_cluster_config() {
  let mut map = FailureConfigMap::default();
  map.cluster_wide.drop_prob = 0.5;
  map
    .node_wide
    .insert("a:1".to_string(), FailureConfig::partitioned());
  assert_eq!(map.get("a:1").drop_prob, 1.0);
  assert_eq!(map.get("b:1").drop_prob, 0.5);
}

#[test]
fn test_link_config_shadows_node_config() {
  let mut map = FailureConfigMap::default();
  map.node_wide.insert(
    "a:1".to_string(),
    FailureConfig {
      drop_prob: 0.25,
      delay: None,
    },
  );
  map.links.insert(
    ("b:1".to_string(), "a:1".to_string()),
    FailureConfig::partitioned(),
  );
  assert_eq!(map.get_link("b:1", "a:1").drop_prob, 1.0);
  assert_eq!(map.get_link("c:1", "a:1").drop_prob, 0.25);
  assert_eq!(map.get_link("a:1", "b:1").drop_prob, 0.0);
}
