//! Request and response bodies of the `/protocol/*` endpoints.

use crate::membership::{lenient_changes, Change, Snapshot};
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinRequest {
  pub app: String,
  pub source: String,
  pub incarnation_number: u64,
}

#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinResponse {
  pub app: String,
  pub coordinator: String,
  #[serde(deserialize_with = "lenient_changes")]
  pub membership: Vec<Change>,
  #[serde(default)]
  pub membership_checksum: Option<u32>,
}
impl From<JoinResponse> for Snapshot {
  fn from(res: JoinResponse) -> Snapshot {
    Snapshot {
      checksum: res.membership_checksum,
      members: res.membership,
    }
  }
}

#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PingRequest {
  #[serde(default)]
  pub checksum: Option<u32>,
  #[serde(default, deserialize_with = "lenient_changes")]
  pub changes: Vec<Change>,
  pub source: String,
  #[serde(default)]
  pub source_incarnation_number: u64,
}

#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PingResponse {
  #[serde(default, deserialize_with = "lenient_changes")]
  pub changes: Vec<Change>,
  #[serde(default)]
  pub ping_status: bool,
}

#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PingReqRequest {
  #[serde(default)]
  pub checksum: Option<u32>,
  #[serde(default, deserialize_with = "lenient_changes")]
  pub changes: Vec<Change>,
  pub source: String,
  #[serde(default)]
  pub source_incarnation_number: u64,
  pub target: String,
}

/// `ping_status` tells whether the helper reached the target.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PingReqResponse {
  #[serde(default, deserialize_with = "lenient_changes")]
  pub changes: Vec<Change>,
  pub ping_status: bool,
  #[serde(default)]
  pub target: String,
}

#[test]
fn test_ping_req_wire_format() {
  let body = serde_json::json!({
    "checksum": 12,
    "changes": [
      { "address": "a:1", "status": "suspect", "incarnationNumber": 3 },
      { "status": "alive" }
    ],
    "source": "b:1",
    "target": "c:1"
  });
  let req: PingReqRequest = serde_json::from_value(body).unwrap();
  assert_eq!(req.checksum, Some(12));
  assert_eq!(req.changes.len(), 1);
  assert_eq!(req.source_incarnation_number, 0);
  assert_eq!(req.target, "c:1");

  let res = serde_json::to_value(PingResponse {
    changes: Vec::new(),
    ping_status: true,
  })
  .unwrap();
  assert_eq!(res, serde_json::json!({ "changes": [], "pingStatus": true }));
}

#[test]
fn test_join_response_into_snapshot() {
  let body = serde_json::json!({
    "app": "swimring",
    "coordinator": "a:1",
    "membership": [
      { "address": "a:1", "status": "alive", "incarnationNumber": 5 }
    ]
  });
  let res: JoinResponse = serde_json::from_value(body).unwrap();
  let snapshot = Snapshot::from(res);
  assert_eq!(snapshot.checksum, None);
  assert_eq!(snapshot.members[0].incarnation_number, 5);
}
