//! Network links and graph distance
//!
//! A pod's social graph lives in its own `network_links` array class. Each row is a
//! directed, labeled edge from the pod owner (or, for edges the owner was told about,
//! from the member named in `member_id`) to `peer_member_id`.
//!
//! The engine only ever reads this graph. Rows are created and removed through the
//! ordinary append/delete path of the dispatcher, and every access decision works on a
//! snapshot taken when the request started.

mod distance;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::crypto::PublicKey;
use crate::store::Entry;

pub use distance::{DistanceEvaluator, Reach};

/// Record attribute naming the far end of a link
pub const PEER_FIELD: &str = "peer_member_id";
/// Record attribute holding the relation label
pub const RELATION_FIELD: &str = "relation";
/// Optional record attribute naming the near end when it is not the pod owner
pub const OWNER_FIELD: &str = "member_id";

/// A directed, labeled edge in a pod's social graph
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkLink {
    pub owner: PublicKey,
    pub peer: PublicKey,
    pub relation: String,
    pub created_at: DateTime<Utc>,
}

impl NetworkLink {
    pub fn new(owner: PublicKey, peer: PublicKey, relation: impl Into<String>) -> Self {
        Self {
            owner,
            peer,
            relation: relation.into(),
            created_at: Utc::now(),
        }
    }

    /// Interpret a stored `network_links` entry, `None` if the row is malformed
    pub fn from_entry(pod_owner: &PublicKey, entry: &Entry) -> Option<Self> {
        let peer = match entry.data.get(PEER_FIELD) {
            Some(Value::String(s)) => s.parse().ok()?,
            _ => return None,
        };
        let relation = match entry.data.get(RELATION_FIELD) {
            Some(Value::String(s)) => s.clone(),
            None | Some(Value::Null) => String::new(),
            _ => return None,
        };
        let owner = match entry.data.get(OWNER_FIELD) {
            Some(Value::String(s)) => s.parse().ok()?,
            None | Some(Value::Null) => *pod_owner,
            _ => return None,
        };
        Some(Self {
            owner,
            peer,
            relation,
            created_at: entry.created_at,
        })
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use uuid::Uuid;

    use super::*;
    use crate::crypto::SecretKey;

    fn entry(data: Value) -> Entry {
        Entry {
            position: 1,
            id: Uuid::new_v4(),
            data: data.as_object().cloned().unwrap(),
            created_at: Utc::now(),
            expires_at: None,
        }
    }

    #[test]
    fn test_from_entry() {
        let owner = SecretKey::generate().public();
        let peer = SecretKey::generate().public();

        let link = NetworkLink::from_entry(
            &owner,
            &entry(json!({ "peer_member_id": peer.to_hex(), "relation": "friend" })),
        )
        .unwrap();
        assert_eq!(link.owner, owner);
        assert_eq!(link.peer, peer);
        assert_eq!(link.relation, "friend");
    }

    #[test]
    fn test_explicit_owner() {
        let owner = SecretKey::generate().public();
        let via = SecretKey::generate().public();
        let peer = SecretKey::generate().public();

        let link = NetworkLink::from_entry(
            &owner,
            &entry(json!({
                "member_id": via.to_hex(),
                "peer_member_id": peer.to_hex(),
                "relation": "friend"
            })),
        )
        .unwrap();
        assert_eq!(link.owner, via);
    }

    #[test]
    fn test_malformed_rows() {
        let owner = SecretKey::generate().public();
        assert!(NetworkLink::from_entry(&owner, &entry(json!({ "relation": "friend" }))).is_none());
        assert!(NetworkLink::from_entry(
            &owner,
            &entry(json!({ "peer_member_id": "garbage", "relation": "friend" }))
        )
        .is_none());
        assert!(NetworkLink::from_entry(
            &owner,
            &entry(json!({ "peer_member_id": owner.to_hex(), "relation": 7 }))
        )
        .is_none());
    }
}
