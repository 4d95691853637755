use std::time::Duration;
use thiserror::Error;

/// Why a request to a peer produced no usable answer. These never escape the
/// protocol drivers: a failed ping is an outcome, not an error.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum TransportError {
  #[error("no route to {0}")]
  Unreachable(String),
  #[error("request to {0} was dropped")]
  Dropped(String),
  #[error("request to {0} timed out after {1:?}")]
  Timeout(String, Duration),
  #[error("{0} answered with an error: {1}")]
  Remote(String, String),
}

#[derive(Debug, Error)]
pub enum SwimError {
  #[error("join did not complete within {0:?}")]
  JoinDurationExceeded(Duration),
  #[error("join was aborted")]
  JoinAborted,
  #[error("join request for app {actual:?}, expected {expected:?}")]
  InvalidJoinApp { expected: String, actual: String },
  #[error("join request from {0}, which is this node")]
  InvalidJoinSource(String),
  #[error("local member has already left")]
  RedundantLeave,
  #[error("local member has not left")]
  RedundantJoin,
  #[error("the node has not finished bootstrapping")]
  NotReady,
  #[error("local member is missing from the membership table")]
  MissingLocalMember,
  #[error("unknown config key {0:?}")]
  UnknownConfigKey(String),
  #[error("invalid config: {0}")]
  InvalidConfig(String),
  #[error("the node is already bootstrapped")]
  AlreadyBootstrapped,
  #[error(transparent)]
  Transport(#[from] TransportError),
  #[error("malformed body: {0}")]
  BadBody(#[from] serde_json::Error),
}

#[test]
fn test_error_display() {
  let err = SwimError::from(TransportError::Unreachable("a:1".to_string()));
  assert_eq!(err.to_string(), "no route to a:1");
  let err = SwimError::InvalidJoinApp {
    expected: "swimring".to_string(),
    actual: "other".to_string(),
  };
  assert_eq!(
    err.to_string(),
    "join request for app \"other\", expected \"swimring\""
  );
}
