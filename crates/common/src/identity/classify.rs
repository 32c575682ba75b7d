use serde::{Deserialize, Serialize};

use crate::contract::EntityKind;
use crate::crypto::PublicKey;

/// The signing authorities a pod classifies callers against
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Authorities {
    /// The pod owner's member id
    pub pod_owner: PublicKey,
    /// Name of this pod's own member-signing authority
    pub pod: String,
    /// Name of the hosting service's authority
    pub service: String,
    /// Name of the network's member-signing authority
    pub network: String,
}

/// Claims from a signed bearer token presented alongside a credential
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenClaims {
    #[serde(default)]
    pub service_id: Option<String>,
    #[serde(default)]
    pub roles: Vec<String>,
}

/// An identity the transport layer has already verified
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerifiedPeer {
    /// Subject principal, a member id in hex for member credentials
    pub subject: String,
    /// Issuers from the presented credential up to the root
    pub issuer_chain: Vec<String>,
    /// Service the credential was issued for
    pub service_id: Option<String>,
    pub claims: Option<TokenClaims>,
}

impl VerifiedPeer {
    pub fn anonymous() -> Self {
        Self::default()
    }

    fn terminal_issuer(&self) -> Option<&str> {
        self.issuer_chain
            .last()
            .map(String::as_str)
            .filter(|s| !s.is_empty())
    }

    /// Service this peer speaks for, `None` when credential and claims disagree
    fn effective_service(&self) -> Option<&str> {
        let claimed = self.claims.as_ref().and_then(|c| c.service_id.as_deref());
        match (self.service_id.as_deref(), claimed) {
            (Some(issued), Some(claimed)) if issued != claimed => None,
            (Some(issued), _) => Some(issued),
            (None, claimed) => claimed,
        }
    }
}

/// A classified caller
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Caller {
    Member(PublicKey),
    Service(String),
    AnyMember(PublicKey),
    Anonymous,
}

impl Caller {
    pub fn kind(&self) -> EntityKind {
        match self {
            Caller::Member(_) => EntityKind::Member,
            Caller::Service(_) => EntityKind::Service,
            Caller::AnyMember(_) => EntityKind::AnyMember,
            Caller::Anonymous => EntityKind::Anonymous,
        }
    }

    pub fn member_id(&self) -> Option<&PublicKey> {
        match self {
            Caller::Member(id) | Caller::AnyMember(id) => Some(id),
            _ => None,
        }
    }
}

/// Classify a verified peer for an access to `service_id`
///
/// The issuer chain decides: ending at this pod's authority (and naming the owner)
/// makes a member, at the service authority the service, at the network authority
/// for the same service any member. Everything else, including no identity at all,
/// is anonymous.
pub fn classify(peer: Option<&VerifiedPeer>, authorities: &Authorities, service_id: &str) -> Caller {
    let Some(peer) = peer else {
        return Caller::Anonymous;
    };
    let Some(issuer) = peer.terminal_issuer() else {
        return Caller::Anonymous;
    };

    if issuer == authorities.pod {
        return match peer.subject.parse::<PublicKey>() {
            Ok(id) if id == authorities.pod_owner => Caller::Member(id),
            _ => {
                tracing::debug!("pod authority credential for a non-owner subject");
                Caller::Anonymous
            }
        };
    }

    if issuer == authorities.service {
        if peer.subject.is_empty() {
            return Caller::Anonymous;
        }
        return Caller::Service(peer.subject.clone());
    }

    if issuer == authorities.network {
        if peer.effective_service() != Some(service_id) {
            return Caller::Anonymous;
        }
        return match peer.subject.parse::<PublicKey>() {
            Ok(id) => Caller::AnyMember(id),
            Err(_) => Caller::Anonymous,
        };
    }

    Caller::Anonymous
}
