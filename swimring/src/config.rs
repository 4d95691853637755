use crate::error::SwimError;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;

/// Tuning knobs for one node. Durations travel as milliseconds when the
/// config is read or written as JSON.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SwimConfig {
  /// Name of the application. Joins from nodes of another app are refused.
  /// Default: `"swimring"`.
  pub app: String,
  /// Positions each server owns on the hash ring. Default: 100.
  pub replica_points: usize,
  /// How many outgoing messages a change rides along on before it stops
  /// being gossiped. Default: 15.
  pub max_piggyback_count: u32,
  /// How long a member stays suspect before it is declared faulty.
  /// Default: 5000ms.
  #[serde(with = "millis")]
  pub suspicion_timeout: Duration,
  /// Default: 1500ms.
  #[serde(with = "millis")]
  pub ping_timeout: Duration,
  /// Default: 5000ms.
  #[serde(with = "millis")]
  pub ping_req_timeout: Duration,
  /// Helpers asked to ping a target that did not answer a ping.
  /// Default: 3.
  pub ping_req_size: usize,
  /// Time between two protocol periods. Default: 200ms.
  #[serde(with = "millis")]
  pub protocol_period: Duration,
  /// Distinct peers to join before bootstrap completes. Default: 3.
  pub join_size: usize,
  /// Bootstrap fails once joining has taken this long. Default: 120s.
  #[serde(with = "millis")]
  pub max_join_duration: Duration,
  /// Default: 1000ms.
  #[serde(with = "millis")]
  pub join_timeout: Duration,
  /// Backoff between join rounds starts here and doubles, with jitter, up
  /// to `max_join_delay`. Default: 100ms and 5s.
  #[serde(with = "millis")]
  pub join_delay: Duration,
  #[serde(with = "millis")]
  pub max_join_delay: Duration,
}
impl Default for SwimConfig {
  fn default() -> Self {
    SwimConfig {
      app: "swimring".to_string(),
      replica_points: 100,
      max_piggyback_count: 15,
      suspicion_timeout: Duration::from_millis(5000),
      ping_timeout: Duration::from_millis(1500),
      ping_req_timeout: Duration::from_millis(5000),
      ping_req_size: 3,
      protocol_period: Duration::from_millis(200),
      join_size: 3,
      max_join_duration: Duration::from_secs(120),
      join_timeout: Duration::from_millis(1000),
      join_delay: Duration::from_millis(100),
      max_join_delay: Duration::from_secs(5),
    }
  }
}
impl SwimConfig {
  pub fn validate(&self) -> Result<(), SwimError> {
    let invalid = |msg: &str| Err(SwimError::InvalidConfig(msg.to_string()));
    if self.app.is_empty() {
      return invalid("app must not be empty");
    }
    if self.replica_points == 0 {
      return invalid("replicaPoints must be positive");
    }
    if self.join_size == 0 {
      return invalid("joinSize must be positive");
    }
    if self.protocol_period == Duration::ZERO {
      return invalid("protocolPeriod must be positive");
    }
    if self.join_delay > self.max_join_delay {
      return invalid("joinDelay must not exceed maxJoinDelay");
    }
    Ok(())
  }

  pub fn to_json(&self) -> Value {
    serde_json::to_value(self).unwrap_or(Value::Null)
  }

  /// Overwrites the keys present in `patch`, an object in the shape of
  /// [`to_json`]. Nothing changes unless every key is known and the result
  /// validates.
  ///
  /// [`to_json`]: SwimConfig::to_json
  pub fn merge(&self, patch: &Value) -> Result<SwimConfig, SwimError> {
    let patch = match patch {
      Value::Object(map) => map,
      _ => return Err(SwimError::InvalidConfig("expected an object".into())),
    };
    let mut current = match self.to_json() {
      Value::Object(map) => map,
      _ => return Err(SwimError::InvalidConfig("unserializable".into())),
    };
    for (key, value) in patch {
      match current.get_mut(key) {
        Some(slot) => *slot = value.clone(),
        None => return Err(SwimError::UnknownConfigKey(key.clone())),
      }
    }
    let merged: SwimConfig = serde_json::from_value(Value::Object(current))?;
    merged.validate()?;
    Ok(merged)
  }
}

mod millis {
  use serde::{Deserialize, Deserializer, Serializer};
  use std::time::Duration;

  pub fn serialize<S: Serializer>(
    d: &Duration,
    s: S,
  ) -> Result<S::Ok, S::Error> {
    s.serialize_u64(d.as_millis() as u64)
  }

  pub fn deserialize<'de, D: Deserializer<'de>>(
    d: D,
  ) -> Result<Duration, D::Error> {
    u64::deserialize(d).map(Duration::from_millis)
  }
}

#[cfg(test)]
use serde_json::json;

#[test]
fn test_defaults_validate() {
  let cfg = SwimConfig::default();
  cfg.validate().unwrap();
  let json = cfg.to_json();
  assert_eq!(json["suspicionTimeout"], 5000);
  assert_eq!(json["maxJoinDuration"], 120_000);
  assert_eq!(json["replicaPoints"], 100);
}

#[test]
fn test_merge_overwrites_given_keys() {
  let cfg = SwimConfig::default();
  let merged = cfg
    .merge(&json!({ "pingTimeout": 10, "joinSize": 1 }))
    .unwrap();
  assert_eq!(merged.ping_timeout, Duration::from_millis(10));
  assert_eq!(merged.join_size, 1);
  assert_eq!(merged.suspicion_timeout, cfg.suspicion_timeout);
}

#[test]
fn test_merge_rejects_bad_patches() {
  let cfg = SwimConfig::default();
  assert!(matches!(
    cfg.merge(&json!({ "bogus": 1 })),
    Err(SwimError::UnknownConfigKey(k)) if k == "bogus"
  ));
  assert!(matches!(
    cfg.merge(&json!({ "replicaPoints": 0 })),
    Err(SwimError::InvalidConfig(_))
  ));
  assert!(matches!(
    cfg.merge(&json!({ "replicaPoints": "many" })),
    Err(SwimError::BadBody(_))
  ));
  assert!(cfg.merge(&json!([1, 2])).is_err());
}
