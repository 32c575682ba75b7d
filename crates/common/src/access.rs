//! Access decisions
//!
//! [`AccessEngine::decide`] combines a classified caller, the compiled table of the
//! target class and, for `any_member` callers, a snapshot of the pod's network links.
//! It performs no I/O and holds no locks; everything it needs is passed in.
//!
//! Decisions are closed-world and fail closed: no entry, no permission, and no usable
//! graph snapshot means the `network` path is simply not available.

use std::collections::BTreeSet;
use std::time::Duration;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::contract::{Action, EntityKind};
use crate::crypto::PublicKey;
use crate::identity::{classify, Authorities, Caller, VerifiedPeer};
use crate::network::{DistanceEvaluator, NetworkLink, Reach};
use crate::policy::{Permission, PolicyTable};
use crate::store::Record;

/// How an `any_member` entry and a satisfied `network` entry combine
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Precedence {
    /// Permit if either entry permits
    #[default]
    MostPermissive,
    /// An existing `any_member` entry is final; `network` is consulted only without one
    AnyMemberFirst,
    /// A satisfied `network` entry is final; `any_member` applies otherwise
    NetworkFirst,
}

/// The rule that produced a decision
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecisionPath {
    Direct(EntityKind),
    Network { distance: u32 },
}

/// Graph scope of a decision taken on the `network` path
#[derive(Debug, Clone)]
pub struct NetworkScope {
    pub distance_bound: u32,
    pub relation: Option<Regex>,
}

/// Which attributes of returned records a caller may see
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Redaction {
    visible: Option<BTreeSet<String>>,
}

impl Redaction {
    pub fn new(visible: Option<BTreeSet<String>>) -> Self {
        Self { visible }
    }

    pub fn apply(&self, record: &mut Record) {
        if let Some(visible) = &self.visible {
            record.retain(|name, _| visible.contains(name));
        }
    }
}

#[derive(Debug, Clone)]
pub struct Decision {
    pub permit: bool,
    pub cache_ttl: Option<Duration>,
    pub path: Option<DecisionPath>,
    pub network: Option<NetworkScope>,
    pub redaction: Redaction,
}

impl Decision {
    pub fn deny() -> Self {
        Self {
            permit: false,
            cache_ttl: None,
            path: None,
            network: None,
            redaction: Redaction::default(),
        }
    }

    pub fn via_network(&self) -> bool {
        matches!(self.path, Some(DecisionPath::Network { .. }))
    }
}

#[derive(Debug, Clone)]
pub struct AccessEngine {
    authorities: Authorities,
    precedence: Precedence,
}

impl AccessEngine {
    pub fn new(authorities: Authorities, precedence: Precedence) -> Self {
        Self {
            authorities,
            precedence,
        }
    }

    pub fn authorities(&self) -> &Authorities {
        &self.authorities
    }

    pub fn owner(&self) -> &PublicKey {
        &self.authorities.pod_owner
    }

    pub fn precedence(&self) -> Precedence {
        self.precedence
    }

    /// Classify a verified peer for an access to `service_id`
    pub fn classify(&self, peer: Option<&VerifiedPeer>, service_id: &str) -> Caller {
        classify(peer, &self.authorities, service_id)
    }

    /// Whether deciding for this caller requires a network link snapshot
    pub fn needs_graph(&self, caller: &Caller, table: &PolicyTable) -> bool {
        matches!(caller, Caller::AnyMember(_)) && table.has_entry(EntityKind::Network)
    }

    /// Decide whether `caller` may perform `action` on the class behind `table`
    ///
    /// `links` is the graph snapshot; `None` means it could not be obtained, which
    ///  disables the `network` path.
    pub fn decide(
        &self,
        caller: &Caller,
        table: &PolicyTable,
        action: Action,
        links: Option<&[NetworkLink]>,
    ) -> Decision {
        let decision = match caller {
            Caller::AnyMember(member) => self.decide_any_member(member, table, action, links),
            other => {
                let kind = other.kind();
                grant(
                    table,
                    action,
                    table.permission(kind, action),
                    DecisionPath::Direct(kind),
                )
            }
        };
        tracing::debug!(
            "access {} {} on {}: permit={} path={:?}",
            caller.kind(),
            action,
            table.name(),
            decision.permit,
            decision.path
        );
        decision
    }

    fn decide_any_member(
        &self,
        member: &PublicKey,
        table: &PolicyTable,
        action: Action,
        links: Option<&[NetworkLink]>,
    ) -> Decision {
        let direct = table.permission(EntityKind::AnyMember, action);
        let has_direct = table.has_entry(EntityKind::AnyMember);

        let network = table.permission(EntityKind::Network, action);
        let reach = match (table.has_entry(EntityKind::Network), links) {
            (true, Some(links)) => DistanceEvaluator::new(self.authorities.pod_owner, links)
                .distance(
                    member,
                    network.distance_bound.unwrap_or(0),
                    network.relation.as_ref(),
                ),
            (true, None) => {
                tracing::warn!(
                    "no network link snapshot for {} on {}, network path disabled",
                    member,
                    table.name()
                );
                Reach::UNREACHABLE
            }
            (false, _) => Reach::UNREACHABLE,
        };

        let on_network = |network: Permission| match reach.distance {
            Some(distance) if reach.in_network => {
                let scope = NetworkScope {
                    distance_bound: network.distance_bound.unwrap_or(0),
                    relation: network.relation.clone(),
                };
                let mut decision =
                    grant(table, action, network, DecisionPath::Network { distance });
                decision.network = Some(scope);
                Some(decision)
            }
            _ => None,
        };
        let on_direct = |direct: Permission| {
            grant(
                table,
                action,
                direct,
                DecisionPath::Direct(EntityKind::AnyMember),
            )
        };

        match self.precedence {
            Precedence::MostPermissive => {
                let direct_allowed = direct.allowed;
                let direct_ttl = direct.cache_ttl;
                match on_network(network) {
                    Some(mut decision) if decision.permit => {
                        if direct_allowed {
                            decision.cache_ttl = decision.cache_ttl.max(direct_ttl);
                        }
                        decision
                    }
                    _ => on_direct(direct),
                }
            }
            Precedence::AnyMemberFirst if has_direct => on_direct(direct),
            Precedence::AnyMemberFirst => on_network(network).unwrap_or_else(Decision::deny),
            Precedence::NetworkFirst => {
                on_network(network).unwrap_or_else(|| on_direct(direct))
            }
        }
    }
}

fn grant(table: &PolicyTable, action: Action, permission: Permission, path: DecisionPath) -> Decision {
    if !permission.allowed {
        return Decision {
            path: Some(path),
            ..Decision::deny()
        };
    }
    Decision {
        permit: true,
        cache_ttl: if action == Action::Read {
            permission.cache_ttl
        } else {
            None
        },
        path: Some(path),
        network: None,
        redaction: Redaction::new(table.class().visible_fields()),
    }
}
