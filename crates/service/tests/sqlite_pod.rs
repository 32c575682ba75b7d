use std::sync::Arc;

use anyhow::anyhow;
use async_trait::async_trait;
use serde_json::json;

use common::access::{AccessEngine, Precedence};
use common::contract::ServiceContract;
use common::crypto::{PublicKey, SecretKey};
use common::identity::{Authorities, Credential, CredentialVerifier, VerifiedPeer};
use common::peer::Reply;
use common::policy::PolicyRegistry;
use common::query::{
    DispatchError, DispatcherConfig, Operation, Outcome, PeerClient, QueryDispatcher,
    RequestEnvelope, RequestError,
};
use common::store::{Filter, Record, StorageProvider};
use service::Database;

/// A pod with no reachable peers
struct Isolated;

#[async_trait]
impl PeerClient for Isolated {
    async fn send(&self, target: &PublicKey, _envelope: RequestEnvelope) -> anyhow::Result<Reply> {
        Err(anyhow!("pod {} is unreachable", target))
    }
}

struct Pod {
    owner: VerifiedPeer,
    id: PublicKey,
    dispatcher: QueryDispatcher<Database, Isolated>,
}

impl Pod {
    async fn new() -> anyhow::Result<Self> {
        let secret = SecretKey::generate();
        let id = secret.public();

        let contract = ServiceContract::from_json(
            &json!({
                "service_id": "social",
                "version": 1,
                "classes": {
                    "posts": {
                        "type": "array",
                        "fields": { "title": { "type": "string" } },
                        "acl": [
                            { "entity": "member", "actions": ["read", "append", "update", "delete"] }
                        ]
                    },
                    "likes": {
                        "type": "array",
                        "primary_key": "id",
                        "fields": { "id": { "type": "string" } },
                        "acl": [{ "entity": "member", "actions": ["read", "append"] }]
                    },
                    "profile": {
                        "type": "object",
                        "fields": {
                            "name": { "type": "string" },
                            "bio": { "type": "string" }
                        },
                        "acl": [{ "entity": "member", "actions": ["read", "update"] }]
                    },
                    "stories": {
                        "type": "array",
                        "expires_after": 60,
                        "fields": { "title": { "type": "string" } },
                        "acl": [{ "entity": "member", "actions": ["read", "append"] }]
                    }
                }
            })
            .to_string(),
        )?;
        let registry = Arc::new(PolicyRegistry::new());
        registry.publish(&contract)?;

        let authorities = Authorities {
            pod_owner: id,
            pod: "pod".to_string(),
            service: "service".to_string(),
            network: "network".to_string(),
        };
        let verifier = CredentialVerifier::new().trust("pod", id);
        let owner = verifier
            .verify(&Credential::issue(&secret, "pod", id, "social"), &id)
            .ok_or_else(|| anyhow!("owner credential did not verify"))?;

        let dispatcher = QueryDispatcher::new(
            registry,
            AccessEngine::new(authorities, Precedence::default()),
            Database::in_memory().await?,
            Isolated,
            DispatcherConfig::default(),
        );
        Ok(Self {
            owner,
            id,
            dispatcher,
        })
    }

    async fn run(&self, envelope: RequestEnvelope) -> Result<Outcome, DispatchError> {
        self.dispatcher
            .dispatch(Some(&self.owner), Some(&self.id), envelope)
            .await
    }

    fn envelope(&self, operation: Operation, class: &str) -> RequestEnvelope {
        RequestEnvelope::new("social", operation, class)
    }
}

fn record(value: serde_json::Value) -> Record {
    value.as_object().cloned().expect("record fixture is an object")
}

#[tokio::test]
async fn test_paging_survives_deletes_between_pages() -> anyhow::Result<()> {
    let pod = Pod::new().await?;
    for n in 0..6 {
        pod.run(
            pod.envelope(Operation::Append, "posts")
                .with_data(record(json!({ "title": format!("post-{}", n) }))),
        )
        .await?;
    }

    let Outcome::Connection(first) = pod
        .run(pod.envelope(Operation::Query, "posts").with_first(2))
        .await?
    else {
        panic!("expected a connection");
    };
    assert_eq!(first.total_count, 6);
    assert!(first.has_next_page);
    let cursor = first.end_cursor.clone().expect("first page has entries");

    // drop the last entry of the first page and the first of the next
    for title in ["post-1", "post-2"] {
        pod.run(
            pod.envelope(Operation::Delete, "posts")
                .with_filter(Filter::new().eq("title", title)),
        )
        .await?;
    }

    let Outcome::Connection(second) = pod
        .run(
            pod.envelope(Operation::Query, "posts")
                .with_first(2)
                .with_after(cursor),
        )
        .await?
    else {
        panic!("expected a connection");
    };
    let titles: Vec<&str> = second
        .edges
        .iter()
        .filter_map(|e| e.node["title"].as_str())
        .collect();
    assert_eq!(titles, vec!["post-3", "post-4"]);
    assert!(second.has_next_page);
    assert_eq!(second.total_count, 4);
    Ok(())
}

#[tokio::test]
async fn test_update_reports_affected_rows() -> anyhow::Result<()> {
    let pod = Pod::new().await?;
    for title in ["a", "b", "a"] {
        pod.run(
            pod.envelope(Operation::Append, "posts")
                .with_data(record(json!({ "title": title }))),
        )
        .await?;
    }

    let outcome = pod
        .run(
            pod.envelope(Operation::Update, "posts")
                .with_filter(Filter::new().eq("title", "a"))
                .with_data(record(json!({ "title": "c" }))),
        )
        .await?;
    assert_eq!(outcome, Outcome::Affected(2));
    Ok(())
}

#[tokio::test]
async fn test_purge_only_touches_expiring_classes() -> anyhow::Result<()> {
    let pod = Pod::new().await?;
    pod.run(
        pod.envelope(Operation::Append, "stories")
            .with_data(record(json!({ "title": "today" }))),
    )
    .await?;

    // nothing has expired yet
    assert_eq!(pod.dispatcher.purge_expired().await?, 0);
    let Outcome::Connection(stories) = pod.run(pod.envelope(Operation::Query, "stories")).await?
    else {
        panic!("expected a connection");
    };
    assert_eq!(stories.edges.len(), 1);
    Ok(())
}

#[tokio::test]
async fn test_anonymous_is_denied_without_an_entry() -> anyhow::Result<()> {
    let pod = Pod::new().await?;
    let result = pod
        .dispatcher
        .dispatch(None, None, pod.envelope(Operation::Query, "posts"))
        .await;
    assert!(
        matches!(result, Err(DispatchError::Denied { .. })),
        "got {:?}",
        result
    );
    Ok(())
}

#[tokio::test]
async fn test_concurrent_duplicate_appends_store_one_entry() -> anyhow::Result<()> {
    let pod = Pod::new().await?;
    let like = || {
        pod.envelope(Operation::Append, "likes")
            .with_data(record(json!({ "id": "post-1" })))
    };

    let results = futures::future::join_all((0..4).map(|_| pod.run(like()))).await;
    let stored = results.iter().filter(|r| r.is_ok()).count();
    assert_eq!(stored, 1);
    for result in results.iter().filter(|r| r.is_err()) {
        assert!(
            matches!(
                result,
                Err(DispatchError::Request(RequestError::Duplicate { .. }))
            ),
            "got {:?}",
            result
        );
    }

    let now = chrono::Utc::now();
    let count = pod
        .dispatcher
        .store()
        .count("likes", &Filter::new(), now)
        .await?;
    assert_eq!(count, 1);
    Ok(())
}

#[tokio::test]
async fn test_concurrent_mutates_keep_both_fields() -> anyhow::Result<()> {
    let pod = Pod::new().await?;
    let name = pod
        .envelope(Operation::Mutate, "profile")
        .with_data(record(json!({ "name": "Ada" })));
    let bio = pod
        .envelope(Operation::Mutate, "profile")
        .with_data(record(json!({ "bio": "engineer" })));

    let (a, b) = tokio::join!(pod.run(name), pod.run(bio));
    assert_eq!(a?, Outcome::Affected(1));
    assert_eq!(b?, Outcome::Affected(1));

    let profile = pod.dispatcher.store().get_object("profile").await?;
    assert_eq!(
        profile,
        Some(record(json!({ "name": "Ada", "bio": "engineer" })))
    );
    Ok(())
}
