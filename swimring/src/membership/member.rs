use serde::de::Deserializer;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

#[derive(
  Clone, Copy, Debug, Deserialize, Eq, Hash, PartialEq, Serialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Status {
  Alive,
  Suspect,
  Faulty,
  Leave,
  Tombstone,
}
impl Status {
  pub const ALL: [Status; 5] = [
    Status::Alive,
    Status::Suspect,
    Status::Faulty,
    Status::Leave,
    Status::Tombstone,
  ];

  pub fn as_str(&self) -> &'static str {
    match self {
      Status::Alive => "alive",
      Status::Suspect => "suspect",
      Status::Faulty => "faulty",
      Status::Leave => "leave",
      Status::Tombstone => "tombstone",
    }
  }

  /// Only alive and suspect members are pinged and own ring positions.
  pub fn is_pingable(&self) -> bool {
    matches!(self, Status::Alive | Status::Suspect)
  }
}
impl fmt::Display for Status {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

/// One row of the membership table.
#[derive(Clone, Debug, Deserialize, Eq, Hash, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Member {
  /// `host:port`, unique within a table.
  pub address: String,
  pub status: Status,
  pub incarnation_number: u64,
}
impl Member {
  /// The member's contribution to the membership checksum. Peers must agree
  /// on this byte for byte.
  pub fn checksum_string(&self) -> String {
    format!("{}{}{}", self.address, self.status, self.incarnation_number)
  }
}

/// A status assertion about one member, as applied locally and gossiped.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Change {
  pub address: String,
  pub status: Status,
  pub incarnation_number: u64,
  #[serde(default)]
  pub source: String,
  #[serde(default)]
  pub source_incarnation_number: u64,
  #[serde(default)]
  pub timestamp: u64,
}
impl Change {
  pub fn from_member(member: &Member, source: &str, source_inc: u64) -> Self {
    Change {
      address: member.address.clone(),
      status: member.status,
      incarnation_number: member.incarnation_number,
      source: source.to_string(),
      source_incarnation_number: source_inc,
      timestamp: now_millis(),
    }
  }

  pub fn is_malformed(&self) -> bool {
    self.address.is_empty()
  }
}
impl From<&Change> for Member {
  fn from(change: &Change) -> Self {
    Member {
      address: change.address.clone(),
      status: change.status,
      incarnation_number: change.incarnation_number,
    }
  }
}

/// Milliseconds since the Unix epoch, used for fresh incarnation numbers and
/// change timestamps.
pub fn now_millis() -> u64 {
  SystemTime::now()
    .duration_since(UNIX_EPOCH)
    .map(|d| d.as_millis() as u64)
    .unwrap_or(0)
}

/// Decodes a list of changes, silently skipping entries that lack an address
/// or incarnation number instead of rejecting the whole body.
pub(crate) fn lenient_changes<'de, D>(de: D) -> Result<Vec<Change>, D::Error>
where
  D: Deserializer<'de>,
{
  let raw = Vec::<serde_json::Value>::deserialize(de)?;
  Ok(
    raw
      .into_iter()
      .filter_map(|v| serde_json::from_value::<Change>(v).ok())
      .filter(|c| !c.is_malformed())
      .collect(),
  )
}

#[cfg(test)]
#[derive(Deserialize)]
struct Wrapped {
  #[serde(deserialize_with = "lenient_changes")]
  changes: Vec<Change>,
}

#[test]
fn test_checksum_string() {
  let member = Member {
    address: "127.0.0.1:3000".to_string(),
    status: Status::Suspect,
    incarnation_number: 42,
  };
  assert_eq!(member.checksum_string(), "127.0.0.1:3000suspect42");
}

#[test]
fn test_change_wire_format() {
  let change = Change {
    address: "a:1".to_string(),
    status: Status::Alive,
    incarnation_number: 7,
    source: "b:2".to_string(),
    source_incarnation_number: 3,
    timestamp: 99,
  };
  let json = serde_json::to_value(&change).unwrap();
  assert_eq!(json["incarnationNumber"], 7);
  assert_eq!(json["sourceIncarnationNumber"], 3);
  assert_eq!(json["status"], "alive");
}

#[test]
fn test_malformed_changes_dropped() {
  let body = serde_json::json!({
    "changes": [
      { "address": "a:1", "status": "alive", "incarnationNumber": 1 },
      { "status": "alive", "incarnationNumber": 1 },
      { "address": "b:1", "status": "faulty" },
      { "address": "", "status": "alive", "incarnationNumber": 1 },
      { "address": "c:1", "status": "bogus", "incarnationNumber": 1 },
      { "address": "d:1", "status": "leave", "incarnationNumber": 4 }
    ]
  });
  let wrapped: Wrapped = serde_json::from_value(body).unwrap();
  let addresses = wrapped
    .changes
    .iter()
    .map(|c| c.address.as_str())
    .collect::<Vec<_>>();
  assert_eq!(addresses, vec!["a:1", "d:1"]);
}
