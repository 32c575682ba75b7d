//! Query dispatch
//!
//! The dispatcher is where a request meets the policy: it resolves the class, checks the
//! request, asks the [`AccessEngine`](crate::access::AccessEngine) for a decision, runs
//! the operation against local storage and, for reads reached through the `network`
//! path, fans the request out to in-network pods with one less hop of depth.
//!
//! - **[`RequestEnvelope`]**: one request, signed by its origin member
//! - **[`Connection`]**: a page of results merged from every source that answered
//! - **[`PeerClient`]**: how the dispatcher reaches other pods
//! - **[`QueryDispatcher`]**: the operations themselves

mod dispatcher;
mod envelope;
mod replay;

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::contract::{Action, ClassKind, EntityKind, FieldError};
use crate::crypto::PublicKey;
use crate::cursor::CursorError;
use crate::peer::Reply;
use crate::store::Record;

pub use dispatcher::{DispatcherConfig, QueryDispatcher};
pub use envelope::{Operation, Origin, RequestEnvelope};
pub use replay::ReplayGuard;

/// A malformed request, rejected before any storage or network I/O
#[derive(thiserror::Error, Debug)]
pub enum RequestError {
    #[error(transparent)]
    Field(#[from] FieldError),
    #[error(transparent)]
    Cursor(#[from] CursorError),
    #[error("{operation:?} is not supported on {kind:?} class {class}")]
    WrongClassKind {
        operation: Operation,
        class: String,
        kind: ClassKind,
    },
    #[error("{0:?} requires a data payload")]
    MissingData(Operation),
    #[error("page size {first} is outside 1..={max}")]
    PageSize { first: usize, max: usize },
    #[error("targeted request has no hops left")]
    NoForwardingBudget,
    #[error("forwarding requires a signed origin")]
    UnsignedForward,
    #[error("{0:?} cannot target another pod")]
    RemoteWrite(Operation),
    #[error("subscriptions are local: depth and relations must be empty")]
    SubscriptionScope,
    #[error("{0:?} needs a streaming transport")]
    Streaming(Operation),
    #[error("an entry with the same {field} already exists in {class}")]
    Duplicate { class: String, field: String },
    #[error("request {query_id} was signed at {timestamp}, outside the accepted window")]
    Stale {
        query_id: uuid::Uuid,
        timestamp: chrono::DateTime<chrono::Utc>,
    },
    #[error("request {query_id} was already seen at depth {depth}")]
    Replayed { query_id: uuid::Uuid, depth: u32 },
    #[error("depth {depth} exceeds the signed maximum of {max_depth}")]
    DepthExceedsSigned { depth: u32, max_depth: u32 },
}

#[derive(thiserror::Error, Debug)]
pub enum DispatchError {
    #[error("{entity} may not {action} {class}")]
    Denied {
        entity: EntityKind,
        action: Action,
        class: String,
    },
    #[error("invalid request: {0}")]
    Request(#[from] RequestError),
    #[error("unknown service {0}")]
    UnknownService(String),
    #[error("unknown class {class} in service {service_id}")]
    UnknownClass { service_id: String, class: String },
    #[error("storage error: {0}")]
    Storage(String),
    #[error("failed to mint cursor: {0}")]
    Cursor(CursorError),
    #[error("pod {peer} failed the request: {reason}")]
    Remote { peer: PublicKey, reason: String },
}

/// One result record and where it came from
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Edge {
    pub node: Record,
    pub cursor: String,
    pub source: PublicKey,
}

/// Paging state of one source in a merged connection
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourcePage {
    pub end_cursor: Option<String>,
    pub has_next_page: bool,
    pub total_count: u64,
}

/// A page of results from the local pod and every remote pod that answered
///
/// `end_cursor` resumes the local source. Remote sources are resumed by passing their
/// `sources[..].end_cursor` back in the request's `remote_cursors`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Connection {
    pub edges: Vec<Edge>,
    pub total_count: u64,
    pub end_cursor: Option<String>,
    pub has_next_page: bool,
    /// Seconds the caller may cache this result
    pub cache_ttl: Option<u64>,
    pub sources: BTreeMap<PublicKey, SourcePage>,
}

impl Connection {
    /// Fold a remote pod's connection into this one
    ///
    /// A pod reachable along more than one path answers more than once. Only the first
    ///  answer from each source is kept; later edges and counts from a source already
    ///  in `sources` are dropped.
    pub fn merge(&mut self, remote: Connection) {
        let fresh: BTreeMap<PublicKey, SourcePage> = remote
            .sources
            .into_iter()
            .filter(|(source, _)| !self.sources.contains_key(source))
            .collect();
        if fresh.is_empty() {
            return;
        }

        self.edges.extend(
            remote
                .edges
                .into_iter()
                .filter(|edge| fresh.contains_key(&edge.source)),
        );
        self.total_count += fresh.values().map(|page| page.total_count).sum::<u64>();
        self.has_next_page |= fresh.values().any(|page| page.has_next_page);
        self.cache_ttl = match (self.cache_ttl, remote.cache_ttl) {
            (Some(local), Some(remote)) => Some(local.min(remote)),
            _ => None,
        };
        self.sources.extend(fresh);
    }
}

/// The result of a request/reply operation
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Connection(Connection),
    Affected(u64),
}

/// Sends envelopes to other pods
#[async_trait]
pub trait PeerClient: Send + Sync + 'static {
    async fn send(&self, target: &PublicKey, envelope: RequestEnvelope) -> anyhow::Result<Reply>;
}
