use std::fmt::Display;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::join_all;

use super::{
    Connection, DispatchError, Edge, Operation, Outcome, PeerClient, ReplayGuard,
    RequestEnvelope, RequestError, SourcePage,
};
use crate::access::{AccessEngine, Decision};
use crate::contract::{Action, ClassKind};
use crate::crypto::PublicKey;
use crate::cursor::{scan_page, Cursor};
use crate::identity::{Caller, VerifiedPeer};
use crate::network::{DistanceEvaluator, NetworkLink};
use crate::notify::{Change, ChangeEvent, ChangeKind, Notifier};
use crate::peer::Reply;
use crate::policy::{CompiledContract, PolicyRegistry, PolicyTable};
use crate::store::{Entry, Filter, MatchMode, Record, StorageProvider, StoreError, SCAN_BATCH};

fn mint(cursor: Cursor) -> Result<String, DispatchError> {
    cursor.encode().map_err(DispatchError::Cursor)
}

impl<T: Display> From<StoreError<T>> for DispatchError {
    fn from(e: StoreError<T>) -> Self {
        DispatchError::Storage(e.to_string())
    }
}

#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// Budget for each forwarded request
    pub remote_timeout: Duration,
    pub default_page_size: usize,
    pub max_page_size: usize,
    /// How far a signed request's timestamp may be from the local clock
    pub request_window: Duration,
    /// Most signed requests remembered for replay detection
    pub replay_capacity: usize,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            remote_timeout: Duration::from_secs(5),
            default_page_size: 20,
            max_page_size: 100,
            request_window: Duration::from_secs(300),
            replay_capacity: 10_000,
        }
    }
}

/// The class a request targets, pinned to the contract generation it started with
struct Target {
    contract: Arc<CompiledContract>,
    table: Arc<PolicyTable>,
}

struct Authorized {
    caller: Caller,
    decision: Decision,
    links: Vec<NetworkLink>,
}

/// Executes permitted operations for one pod
#[derive(Debug)]
pub struct QueryDispatcher<S, C> {
    registry: Arc<PolicyRegistry>,
    engine: AccessEngine,
    store: S,
    client: C,
    notifier: Notifier,
    replay: ReplayGuard,
    config: DispatcherConfig,
}

impl<S: StorageProvider, C: PeerClient> QueryDispatcher<S, C> {
    pub fn new(
        registry: Arc<PolicyRegistry>,
        engine: AccessEngine,
        store: S,
        client: C,
        config: DispatcherConfig,
    ) -> Self {
        Self {
            registry,
            engine,
            store,
            client,
            notifier: Notifier::new(),
            replay: ReplayGuard::new(config.request_window, config.replay_capacity),
            config,
        }
    }

    pub fn registry(&self) -> &Arc<PolicyRegistry> {
        &self.registry
    }

    pub fn engine(&self) -> &AccessEngine {
        &self.engine
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn notifier(&self) -> &Notifier {
        &self.notifier
    }

    pub fn owner(&self) -> &PublicKey {
        self.engine.owner()
    }

    /// Run a request/reply operation
    ///
    /// `peer` is the verified identity the request is made under, `sender` the pod or
    ///  client that delivered it. Envelopes with a valid origin signature are admitted
    ///  once, within the request window and the signed depth.
    pub async fn dispatch(
        &self,
        peer: Option<&VerifiedPeer>,
        sender: Option<&PublicKey>,
        envelope: RequestEnvelope,
    ) -> Result<Outcome, DispatchError> {
        tracing::debug!(
            "dispatching {:?} on {}/{} (query {}, depth {})",
            envelope.operation,
            envelope.service_id,
            envelope.class,
            envelope.query_id,
            envelope.depth
        );
        if envelope.verified_origin().is_some() {
            self.replay
                .admit(&envelope, Utc::now())
                .inspect_err(|e| tracing::warn!("refused signed request: {}", e))?;
        }
        match envelope.operation {
            Operation::Query | Operation::Search => self
                .query(peer, sender, envelope)
                .await
                .map(Outcome::Connection),
            Operation::Append => self.append(peer, envelope).await.map(Outcome::Affected),
            Operation::Mutate => self.mutate(peer, envelope).await.map(Outcome::Affected),
            Operation::Persist => self.persist(peer, envelope).await.map(Outcome::Affected),
            Operation::Update => self.update(peer, envelope).await.map(Outcome::Affected),
            Operation::Delete => self.delete(peer, envelope).await.map(Outcome::Affected),
            op @ (Operation::Counter | Operation::Updates) => {
                Err(RequestError::Streaming(op).into())
            }
        }
    }

    /// Read a page of a class, merging results from in-network pods when the request
    ///  has depth left
    ///
    /// Handles `Query` (equality filter) and `Search` (substring filter) envelopes.
    pub async fn query(
        &self,
        peer: Option<&VerifiedPeer>,
        sender: Option<&PublicKey>,
        envelope: RequestEnvelope,
    ) -> Result<Connection, DispatchError> {
        let target = self.resolve(&envelope)?;
        let class = target.table.class();
        let version = target.contract.version();

        class
            .validate_filter_fields(envelope.filter.fields.keys())
            .map_err(RequestError::from)?;
        let first = self.page_size(envelope.first)?;
        let after = envelope
            .after
            .as_deref()
            .map(|token| Cursor::decode_for(token, &envelope.class, version))
            .transpose()
            .map_err(RequestError::from)?;
        let mode = match envelope.operation {
            Operation::Search => MatchMode::Contains,
            _ => MatchMode::Equal,
        };
        let filter = envelope.filter.clone().with_mode(mode);

        let caller = self.engine.classify(peer, &envelope.service_id);
        let action = envelope.operation.action();
        let authorized = self
            .authorize(caller, &target.table, action, &envelope)
            .await?;

        let now = Utc::now();
        // a resumed listing without a local cursor has exhausted the local source
        let resuming = !envelope.remote_cursors.is_empty();
        let mut connection = if resuming && after.is_none() {
            Connection::default()
        } else if class.is_array() {
            self.read_array(
                &envelope.class,
                version,
                &filter,
                after.map(|c| c.position),
                first,
                &authorized.decision,
                now,
            )
            .await?
        } else {
            self.read_object(&envelope.class, version, &filter, &authorized.decision)
                .await?
        };
        connection.cache_ttl = authorized.decision.cache_ttl.map(|ttl| ttl.as_secs());
        connection.sources.insert(
            *self.owner(),
            SourcePage {
                end_cursor: connection.end_cursor.clone(),
                has_next_page: connection.has_next_page,
                total_count: connection.total_count,
            },
        );

        if envelope.depth > 0 {
            self.fan_out(&envelope, sender, &authorized, &mut connection)
                .await;
        }
        Ok(connection)
    }

    /// Append an entry to an array class, here or on the pod named by `remote_member_id`
    pub async fn append(
        &self,
        peer: Option<&VerifiedPeer>,
        envelope: RequestEnvelope,
    ) -> Result<u64, DispatchError> {
        let target = self.resolve(&envelope)?;
        let class = target.table.class();
        self.expect_kind(&envelope, class.kind, ClassKind::Array)?;
        let data = envelope
            .data
            .clone()
            .ok_or(RequestError::MissingData(envelope.operation))?;
        class.validate_record(&data).map_err(RequestError::from)?;

        let remote = envelope.remote_member_id.filter(|m| m != self.owner());
        let caller = self.engine.classify(peer, &envelope.service_id);
        if remote.is_some() {
            if envelope.depth == 0 {
                return Err(RequestError::NoForwardingBudget.into());
            }
            // without an origin signature the next pod sees only this pod's identity
            if envelope.verified_origin().is_none() && !matches!(caller, Caller::Member(_)) {
                return Err(RequestError::UnsignedForward.into());
            }
        }

        self.authorize(caller, &target.table, Action::Append, &envelope)
            .await?;

        if let Some(remote) = remote {
            return self.forward_append(remote, &envelope).await;
        }

        let now = Utc::now();
        let expires_at = class
            .ttl()
            .map(|ttl| now.checked_add_signed(ttl).unwrap_or(DateTime::<Utc>::MAX_UTC));
        let unique_key = class
            .primary_key
            .as_deref()
            .filter(|key| data.get(*key).is_some_and(|value| !value.is_null()));
        let entry = match unique_key {
            Some(key) => self
                .store
                .insert_unique(&envelope.class, data, key, expires_at, now)
                .await
                .map_err(|e| match e {
                    StoreError::Conflict(_) => DispatchError::Request(RequestError::Duplicate {
                        class: envelope.class.clone(),
                        field: key.to_string(),
                    }),
                    e => DispatchError::from(e),
                })?,
            None => self.store.insert(&envelope.class, data, expires_at).await?,
        };
        tracing::debug!(
            "appended {} to {} at position {}",
            entry.id,
            envelope.class,
            entry.position
        );

        self.notifier.publish_changes(
            &envelope.class,
            &[Change {
                kind: ChangeKind::Appended,
                entry_id: entry.id,
                data: &entry.data,
            }],
        );
        self.refresh_counters(&envelope.class, now).await;
        Ok(1)
    }

    /// Merge a patch into the object of an object class
    pub async fn mutate(
        &self,
        peer: Option<&VerifiedPeer>,
        envelope: RequestEnvelope,
    ) -> Result<u64, DispatchError> {
        let target = self.resolve(&envelope)?;
        let class = target.table.class();
        self.expect_kind(&envelope, class.kind, ClassKind::Object)?;
        self.expect_local(&envelope)?;
        let patch = envelope
            .data
            .clone()
            .ok_or(RequestError::MissingData(envelope.operation))?;
        class.validate_patch(&patch).map_err(RequestError::from)?;

        let caller = self.engine.classify(peer, &envelope.service_id);
        self.authorize(caller, &target.table, Action::Update, &envelope)
            .await?;

        self.store.merge_object(&envelope.class, patch).await?;
        Ok(1)
    }

    /// Replace the object of an object class
    pub async fn persist(
        &self,
        peer: Option<&VerifiedPeer>,
        envelope: RequestEnvelope,
    ) -> Result<u64, DispatchError> {
        let target = self.resolve(&envelope)?;
        let class = target.table.class();
        self.expect_kind(&envelope, class.kind, ClassKind::Object)?;
        self.expect_local(&envelope)?;
        let data = envelope
            .data
            .clone()
            .ok_or(RequestError::MissingData(envelope.operation))?;
        class.validate_record(&data).map_err(RequestError::from)?;

        let caller = self.engine.classify(peer, &envelope.service_id);
        self.authorize(caller, &target.table, Action::Persist, &envelope)
            .await?;

        self.store.put_object(&envelope.class, data).await?;
        Ok(1)
    }

    /// Merge a patch into every matching entry of an array class
    pub async fn update(
        &self,
        peer: Option<&VerifiedPeer>,
        envelope: RequestEnvelope,
    ) -> Result<u64, DispatchError> {
        let target = self.resolve(&envelope)?;
        let class = target.table.class();
        self.expect_kind(&envelope, class.kind, ClassKind::Array)?;
        self.expect_local(&envelope)?;
        let patch = envelope
            .data
            .clone()
            .ok_or(RequestError::MissingData(envelope.operation))?;
        class.validate_patch(&patch).map_err(RequestError::from)?;
        class
            .validate_filter_fields(envelope.filter.fields.keys())
            .map_err(RequestError::from)?;

        let caller = self.engine.classify(peer, &envelope.service_id);
        self.authorize(caller, &target.table, Action::Update, &envelope)
            .await?;

        let now = Utc::now();
        let touched = self.watched_entries(&envelope.class, &envelope.filter, now).await?;
        let affected = self
            .store
            .update(&envelope.class, &envelope.filter, &patch, now)
            .await?;

        let updated: Vec<Record> = touched
            .iter()
            .map(|entry| {
                let mut data = entry.data.clone();
                data.extend(patch.clone());
                data
            })
            .collect();
        let changes: Vec<Change<'_>> = touched
            .iter()
            .zip(updated.iter())
            .map(|(entry, data)| Change {
                kind: ChangeKind::Updated,
                entry_id: entry.id,
                data,
            })
            .collect();
        self.notifier.publish_changes(&envelope.class, &changes);
        self.refresh_counters(&envelope.class, now).await;
        Ok(affected)
    }

    /// Remove every matching entry of an array class
    pub async fn delete(
        &self,
        peer: Option<&VerifiedPeer>,
        envelope: RequestEnvelope,
    ) -> Result<u64, DispatchError> {
        let target = self.resolve(&envelope)?;
        let class = target.table.class();
        self.expect_kind(&envelope, class.kind, ClassKind::Array)?;
        self.expect_local(&envelope)?;
        class
            .validate_filter_fields(envelope.filter.fields.keys())
            .map_err(RequestError::from)?;

        let caller = self.engine.classify(peer, &envelope.service_id);
        self.authorize(caller, &target.table, Action::Delete, &envelope)
            .await?;

        let now = Utc::now();
        let removed = self.watched_entries(&envelope.class, &envelope.filter, now).await?;
        let affected = self
            .store
            .delete(&envelope.class, &envelope.filter, now)
            .await?;

        let changes: Vec<Change<'_>> = removed
            .iter()
            .map(|entry| Change {
                kind: ChangeKind::Deleted,
                entry_id: entry.id,
                data: &entry.data,
            })
            .collect();
        self.notifier.publish_changes(&envelope.class, &changes);
        self.refresh_counters(&envelope.class, now).await;
        Ok(affected)
    }

    /// Subscribe to the live count of matching entries
    ///
    /// The first value received is the current count.
    pub async fn counter(
        &self,
        peer: Option<&VerifiedPeer>,
        envelope: RequestEnvelope,
    ) -> Result<flume::Receiver<u64>, DispatchError> {
        Self::expect_subscription_scope(&envelope)?;
        let target = self.resolve(&envelope)?;
        let class = target.table.class();
        self.expect_kind(&envelope, class.kind, ClassKind::Array)?;
        class
            .validate_counter_fields(envelope.filter.fields.keys())
            .map_err(RequestError::from)?;

        let caller = self.engine.classify(peer, &envelope.service_id);
        self.authorize(caller, &target.table, Action::Read, &envelope)
            .await?;

        let current = self
            .store
            .count(&envelope.class, &envelope.filter, Utc::now())
            .await?;
        Ok(self
            .notifier
            .subscribe_counter(&envelope.class, envelope.filter.clone(), current))
    }

    /// Subscribe to change events on matching entries
    pub async fn updates(
        &self,
        peer: Option<&VerifiedPeer>,
        envelope: RequestEnvelope,
    ) -> Result<flume::Receiver<ChangeEvent>, DispatchError> {
        Self::expect_subscription_scope(&envelope)?;
        let target = self.resolve(&envelope)?;
        let class = target.table.class();
        self.expect_kind(&envelope, class.kind, ClassKind::Array)?;
        class
            .validate_filter_fields(envelope.filter.fields.keys())
            .map_err(RequestError::from)?;

        let caller = self.engine.classify(peer, &envelope.service_id);
        self.authorize(caller, &target.table, Action::Read, &envelope)
            .await?;

        Ok(self
            .notifier
            .subscribe_changes(&envelope.class, envelope.filter.clone()))
    }

    /// Physically drop expired entries of every class that sets an expiry
    pub async fn purge_expired(&self) -> Result<u64, DispatchError> {
        let now = Utc::now();
        let mut purged = 0;
        for contract in self.registry.all_current() {
            for table in contract.tables() {
                if table.class().expires_after.is_none() {
                    continue;
                }
                let removed = self.store.purge_expired(table.name(), now).await?;
                if removed > 0 {
                    tracing::debug!("purged {} expired entries from {}", removed, table.name());
                    self.refresh_counters(table.name(), now).await;
                }
                purged += removed;
            }
        }
        Ok(purged)
    }

    fn resolve(&self, envelope: &RequestEnvelope) -> Result<Target, DispatchError> {
        let contract = self
            .registry
            .current(&envelope.service_id)
            .ok_or_else(|| DispatchError::UnknownService(envelope.service_id.clone()))?;
        let table = contract
            .table(&envelope.class)
            .ok_or_else(|| DispatchError::UnknownClass {
                service_id: envelope.service_id.clone(),
                class: envelope.class.clone(),
            })?;
        Ok(Target { contract, table })
    }

    fn page_size(&self, first: Option<usize>) -> Result<usize, RequestError> {
        let first = first.unwrap_or(self.config.default_page_size);
        if first == 0 || first > self.config.max_page_size {
            return Err(RequestError::PageSize {
                first,
                max: self.config.max_page_size,
            });
        }
        Ok(first)
    }

    fn expect_kind(
        &self,
        envelope: &RequestEnvelope,
        kind: ClassKind,
        expected: ClassKind,
    ) -> Result<(), RequestError> {
        if kind != expected {
            return Err(RequestError::WrongClassKind {
                operation: envelope.operation,
                class: envelope.class.clone(),
                kind,
            });
        }
        Ok(())
    }

    fn expect_local(&self, envelope: &RequestEnvelope) -> Result<(), RequestError> {
        match envelope.remote_member_id {
            Some(member) if member != *self.owner() => {
                Err(RequestError::RemoteWrite(envelope.operation))
            }
            _ => Ok(()),
        }
    }

    fn expect_subscription_scope(envelope: &RequestEnvelope) -> Result<(), RequestError> {
        if envelope.depth > 0 || !envelope.relations.is_empty() {
            return Err(RequestError::SubscriptionScope);
        }
        Ok(())
    }

    async fn authorize(
        &self,
        caller: Caller,
        table: &PolicyTable,
        action: Action,
        envelope: &RequestEnvelope,
    ) -> Result<Authorized, DispatchError> {
        let links = if self.engine.needs_graph(&caller, table) {
            match self.store.network_links(self.owner(), Utc::now()).await {
                Ok(links) => Some(links),
                Err(e) => {
                    tracing::warn!("failed to load network links: {}", e);
                    None
                }
            }
        } else {
            None
        };

        let decision = self
            .engine
            .decide(&caller, table, action, links.as_deref());
        if !decision.permit {
            tracing::debug!(
                "denied {} {} on {} (query {})",
                caller.kind(),
                action,
                envelope.class,
                envelope.query_id
            );
            return Err(DispatchError::Denied {
                entity: caller.kind(),
                action,
                class: envelope.class.clone(),
            });
        }
        Ok(Authorized {
            caller,
            decision,
            links: links.unwrap_or_default(),
        })
    }

    #[allow(clippy::too_many_arguments)]
    async fn read_array(
        &self,
        class: &str,
        version: u32,
        filter: &Filter,
        after: Option<u64>,
        first: usize,
        decision: &Decision,
        now: DateTime<Utc>,
    ) -> Result<Connection, DispatchError> {
        let page = scan_page(&self.store, class, filter, after, first, now).await?;
        let total_count = self.store.count(class, filter, now).await?;
        let end_cursor = page
            .end_position()
            .map(|position| mint(Cursor::new(position, class, version)))
            .transpose()?;

        let edges = page
            .entries
            .into_iter()
            .map(|entry| {
                let mut node = entry.data;
                decision.redaction.apply(&mut node);
                Ok(Edge {
                    node,
                    cursor: mint(Cursor::new(entry.position, class, version))?,
                    source: *self.owner(),
                })
            })
            .collect::<Result<Vec<_>, DispatchError>>()?;

        Ok(Connection {
            edges,
            total_count,
            end_cursor,
            has_next_page: page.has_next_page,
            cache_ttl: None,
            sources: Default::default(),
        })
    }

    async fn read_object(
        &self,
        class: &str,
        version: u32,
        filter: &Filter,
        decision: &Decision,
    ) -> Result<Connection, DispatchError> {
        let Some(mut node) = self
            .store
            .get_object(class)
            .await?
            .filter(|object| filter.matches(object))
        else {
            return Ok(Connection::default());
        };
        decision.redaction.apply(&mut node);
        let cursor = mint(Cursor::new(0, class, version))?;
        Ok(Connection {
            edges: vec![Edge {
                node,
                cursor: cursor.clone(),
                source: *self.owner(),
            }],
            total_count: 1,
            end_cursor: Some(cursor),
            has_next_page: false,
            cache_ttl: None,
            sources: Default::default(),
        })
    }

    /// Forward a read to every in-network pod and merge whatever answers in time
    async fn fan_out(
        &self,
        envelope: &RequestEnvelope,
        sender: Option<&PublicKey>,
        authorized: &Authorized,
        connection: &mut Connection,
    ) {
        let Some(scope) = authorized.decision.network.as_ref() else {
            tracing::debug!(
                "query {} not decided on the network path, not forwarding",
                envelope.query_id
            );
            return;
        };
        let Some(origin) = envelope.verified_origin() else {
            tracing::debug!("query {} has no origin signature, not forwarding", envelope.query_id);
            return;
        };

        let links: Vec<NetworkLink> = authorized
            .links
            .iter()
            .filter(|link| {
                envelope.relations.is_empty() || envelope.relations.contains(&link.relation)
            })
            .cloned()
            .collect();
        let reachable = DistanceEvaluator::new(*self.owner(), &links)
            .reachable(scope.distance_bound, scope.relation.as_ref());

        // while resuming, a pod without a cursor of its own is only worth asking if it
        // can still relay to sources further out
        let resuming = !envelope.remote_cursors.is_empty();
        let relays = envelope.depth > 1;
        let targets: Vec<PublicKey> = reachable
            .into_keys()
            .filter(|member| {
                Some(member) != authorized.caller.member_id()
                    && *member != origin.member_id
                    && Some(member) != sender
                    && (!resuming || relays || envelope.remote_cursors.contains_key(member))
            })
            .collect();
        if targets.is_empty() {
            return;
        }
        tracing::debug!(
            "forwarding query {} to {} pods at depth {}",
            envelope.query_id,
            targets.len(),
            envelope.depth - 1
        );

        let requests = targets.into_iter().map(|target| {
            let hop = envelope.for_hop(target);
            async move {
                let result =
                    tokio::time::timeout(self.config.remote_timeout, self.client.send(&target, hop))
                        .await;
                (target, result)
            }
        });

        for (target, result) in join_all(requests).await {
            match result {
                Ok(Ok(Reply::Connection(remote))) => connection.merge(remote),
                Ok(Ok(reply)) => tracing::warn!(
                    "pod {} answered query {} with {}",
                    target,
                    envelope.query_id,
                    reply
                ),
                Ok(Err(e)) => tracing::warn!(
                    "pod {} failed query {}: {}",
                    target,
                    envelope.query_id,
                    e
                ),
                Err(_) => tracing::warn!(
                    "pod {} timed out on query {}",
                    target,
                    envelope.query_id
                ),
            }
        }
    }

    async fn forward_append(
        &self,
        target: PublicKey,
        envelope: &RequestEnvelope,
    ) -> Result<u64, DispatchError> {
        tracing::debug!("forwarding append {} to {}", envelope.query_id, target);
        let remote = |reason: String| DispatchError::Remote {
            peer: target,
            reason,
        };
        let reply = tokio::time::timeout(
            self.config.remote_timeout,
            self.client.send(&target, envelope.for_hop(target)),
        )
        .await
        .map_err(|_| remote("timed out".to_string()))?
        .map_err(|e| remote(e.to_string()))?;

        match reply {
            Reply::Affected(count) => Ok(count),
            other => Err(remote(other.to_string())),
        }
    }

    /// Live entries matching `filter`, collected only when someone watches the class
    async fn watched_entries(
        &self,
        class: &str,
        filter: &Filter,
        now: DateTime<Utc>,
    ) -> Result<Vec<Entry>, DispatchError> {
        if !self.notifier.has_change_subscribers(class) {
            return Ok(Vec::new());
        }
        let mut matching = Vec::new();
        let mut after = None;
        loop {
            let batch = self.store.scan(class, after, SCAN_BATCH).await?;
            let Some(last) = batch.last() else {
                return Ok(matching);
            };
            after = Some(last.position);
            matching.extend(
                batch
                    .into_iter()
                    .filter(|e| e.is_live(now) && filter.matches(&e.data)),
            );
        }
    }

    async fn refresh_counters(&self, class: &str, now: DateTime<Utc>) {
        if let Err(e) = self.notifier.refresh_counters(&self.store, class, now).await {
            tracing::warn!("failed to refresh counters on {}: {}", class, e);
        }
    }
}
