use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::contract::Action;
use crate::crypto::{PublicKey, SecretKey, Signature};
use crate::identity::Credential;
use crate::store::{Filter, Record};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    Query,
    Search,
    Mutate,
    Persist,
    Append,
    Update,
    Delete,
    Counter,
    Updates,
}

impl Operation {
    /// The access control action an operation is checked against
    pub fn action(&self) -> Action {
        match self {
            Operation::Query | Operation::Counter | Operation::Updates => Action::Read,
            Operation::Search => Action::Search,
            Operation::Mutate | Operation::Update => Action::Update,
            Operation::Persist => Action::Persist,
            Operation::Append => Action::Append,
            Operation::Delete => Action::Delete,
        }
    }
}

/// The member a request originated from, with proof it did
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Origin {
    pub member_id: PublicKey,
    pub credential: Credential,
    pub signature: Signature,
}

/// A request as it travels between pods
///
/// `depth`, `after` and `remote_cursors` are rewritten at every hop and are not covered
/// by the origin signature, and neither is `remote_member_id` except on appends, where it
/// names the pod the origin meant to write to. Everything else is, including
/// `max_depth`, which caps `depth` at every hop.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestEnvelope {
    pub query_id: Uuid,
    pub service_id: String,
    pub operation: Operation,
    pub class: String,
    #[serde(default)]
    pub filter: Filter,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Record>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub first: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub after: Option<String>,
    #[serde(default)]
    pub depth: u32,
    #[serde(default)]
    pub max_depth: u32,
    #[serde(default)]
    pub relations: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote_member_id: Option<PublicKey>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin: Option<Origin>,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub remote_cursors: BTreeMap<PublicKey, String>,
}

/// The signed view of an envelope
#[derive(Serialize)]
struct SignedFields<'a> {
    query_id: &'a Uuid,
    service_id: &'a str,
    operation: Operation,
    class: &'a str,
    filter: &'a Filter,
    data: &'a Option<Record>,
    first: Option<usize>,
    max_depth: u32,
    relations: &'a [String],
    target: Option<&'a PublicKey>,
    origin: &'a PublicKey,
    timestamp: &'a DateTime<Utc>,
}

impl RequestEnvelope {
    pub fn new(service_id: &str, operation: Operation, class: &str) -> Self {
        Self {
            query_id: Uuid::new_v4(),
            service_id: service_id.to_string(),
            operation,
            class: class.to_string(),
            filter: Filter::default(),
            data: None,
            first: None,
            after: None,
            depth: 0,
            max_depth: 0,
            relations: Vec::new(),
            remote_member_id: None,
            origin: None,
            timestamp: Utc::now(),
            remote_cursors: BTreeMap::new(),
        }
    }

    pub fn with_filter(mut self, filter: Filter) -> Self {
        self.filter = filter;
        self
    }

    pub fn with_data(mut self, data: Record) -> Self {
        self.data = Some(data);
        self
    }

    pub fn with_first(mut self, first: usize) -> Self {
        self.first = Some(first);
        self
    }

    pub fn with_after(mut self, after: impl Into<String>) -> Self {
        self.after = Some(after.into());
        self
    }

    /// Set the hop budget, which is also the most any later hop may claim
    pub fn with_depth(mut self, depth: u32) -> Self {
        self.depth = depth;
        self.max_depth = depth;
        self
    }

    pub fn with_relations(mut self, relations: Vec<String>) -> Self {
        self.relations = relations;
        self
    }

    pub fn with_remote_member(mut self, member: PublicKey) -> Self {
        self.remote_member_id = Some(member);
        self
    }

    pub fn with_remote_cursors(mut self, cursors: BTreeMap<PublicKey, String>) -> Self {
        self.remote_cursors = cursors;
        self
    }

    fn signing_bytes(&self, origin: &PublicKey) -> Vec<u8> {
        let fields = SignedFields {
            query_id: &self.query_id,
            service_id: &self.service_id,
            operation: self.operation,
            class: &self.class,
            filter: &self.filter,
            data: &self.data,
            first: self.first,
            max_depth: self.max_depth,
            relations: &self.relations,
            target: match self.operation {
                Operation::Append => self.remote_member_id.as_ref(),
                _ => None,
            },
            origin,
            timestamp: &self.timestamp,
        };
        let mut bytes = b"podnet-request\0".to_vec();
        // maps are ordered, so this encoding is deterministic
        if let Err(e) = serde_json::to_writer(&mut bytes, &fields) {
            tracing::error!("failed to encode request for signing: {}", e);
        }
        bytes
    }

    /// Sign the envelope as its origin
    pub fn sign(mut self, key: &SecretKey, credential: Credential) -> Self {
        let member_id = key.public();
        let signature = key.sign(&self.signing_bytes(&member_id));
        self.origin = Some(Origin {
            member_id,
            credential,
            signature,
        });
        self
    }

    /// The origin member, if the envelope carries a valid origin signature
    ///
    /// This checks the signature only. Whether the attached credential is trusted is
    ///  for the receiving pod's verifier to decide.
    pub fn verified_origin(&self) -> Option<&Origin> {
        let origin = self.origin.as_ref()?;
        if origin.credential.subject != origin.member_id {
            return None;
        }
        origin
            .member_id
            .verify(&self.signing_bytes(&origin.member_id), &origin.signature)
            .ok()
            .map(|_| origin)
    }

    /// Derive the envelope forwarded to `target` one hop further out
    pub fn for_hop(&self, target: PublicKey) -> Self {
        let mut hop = self.clone();
        hop.depth = self.depth.saturating_sub(1);
        hop.remote_member_id = Some(target);
        hop.after = self.remote_cursors.get(&target).cloned();
        hop
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn signed() -> (RequestEnvelope, SecretKey) {
        let authority = SecretKey::generate();
        let member = SecretKey::generate();
        let credential = Credential::issue(&authority, "members", member.public(), "social");
        let envelope = RequestEnvelope::new("social", Operation::Query, "posts")
            .with_filter(Filter::new().eq("kind", "photo"))
            .with_depth(2)
            .sign(&member, credential);
        (envelope, member)
    }

    #[test]
    fn test_signature_survives_hop_rewrites() {
        let (envelope, member) = signed();
        let target = SecretKey::generate().public();

        let hop = envelope
            .clone()
            .with_remote_cursors([(target, "cursor".to_string())].into())
            .for_hop(target);
        assert_eq!(hop.depth, 1);
        assert_eq!(hop.remote_member_id, Some(target));
        assert_eq!(hop.after.as_deref(), Some("cursor"));

        let origin = hop.verified_origin().unwrap();
        assert_eq!(origin.member_id, member.public());
    }

    #[test]
    fn test_signature_covers_payload() {
        let (envelope, _) = signed();

        let mut widened = envelope.clone();
        widened.filter = Filter::new();
        assert!(widened.verified_origin().is_none());

        let mut retargeted = envelope.clone();
        retargeted.class = "messages".to_string();
        assert!(retargeted.verified_origin().is_none());

        let mut relabeled = envelope.clone();
        relabeled.relations = vec!["family".to_string()];
        assert!(relabeled.verified_origin().is_none());

        let mut deeper = envelope;
        deeper.max_depth = 10;
        assert!(deeper.verified_origin().is_none());
    }

    #[test]
    fn test_signature_covers_append_target() {
        let authority = SecretKey::generate();
        let member = SecretKey::generate();
        let credential = Credential::issue(&authority, "members", member.public(), "social");
        let target = SecretKey::generate().public();
        let append = RequestEnvelope::new("social", Operation::Append, "messages")
            .with_remote_member(target)
            .with_depth(1)
            .sign(&member, credential);

        assert!(append.for_hop(target).verified_origin().is_some());

        let elsewhere = SecretKey::generate().public();
        let mut retargeted = append.clone();
        retargeted.remote_member_id = Some(elsewhere);
        assert!(retargeted.verified_origin().is_none());
        assert!(append.for_hop(elsewhere).verified_origin().is_none());
    }

    #[test]
    fn test_depth_never_underflows() {
        let envelope = RequestEnvelope::new("social", Operation::Query, "posts");
        let target = SecretKey::generate().public();
        assert_eq!(envelope.for_hop(target).depth, 0);
    }

    #[test]
    fn test_wire_round_trip_keeps_signature() {
        let (envelope, _) = signed();
        let json = serde_json::to_string(&envelope).unwrap();
        let decoded: RequestEnvelope = serde_json::from_str(&json).unwrap();
        assert_eq!(decoded, envelope);
        assert!(decoded.verified_origin().is_some());
    }
}
