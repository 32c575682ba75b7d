mod common;

use ::common::contract::{FieldError, ServiceContract};
use ::common::notify::ChangeKind;
use ::common::peer::Reply;
use ::common::query::{DispatchError, Operation, Outcome, RequestError};
use ::common::store::{Filter, StorageProvider};
use ::common::testkit::TestNetwork;
use serde_json::json;

use crate::common::{contract_json, init_tracing, network, record, seed_assets, titles, SERVICE};

#[tokio::test]
async fn test_targeted_append_lands_on_the_remote_pod() -> anyhow::Result<()> {
    let net = network();
    let alice = net.add_pod("alice")?;
    let bob = net.add_pod("bob")?;

    let envelope = alice.sign(
        alice
            .envelope(Operation::Append, "messages")
            .with_data(record(json!({ "body": "hello bob" })))
            .with_remote_member(bob.id())
            .with_depth(1),
    );
    let outcome = alice.as_owner(envelope).await?;
    assert_eq!(outcome, Outcome::Affected(1));

    let everything = Filter::new();
    let now = chrono::Utc::now();
    assert_eq!(bob.store().count("messages", &everything, now).await?, 1);
    assert_eq!(alice.store().count("messages", &everything, now).await?, 0);
    Ok(())
}

#[tokio::test]
async fn test_targeted_append_needs_a_hop() -> anyhow::Result<()> {
    let net = network();
    let alice = net.add_pod("alice")?;
    let bob = net.add_pod("bob")?;

    let envelope = alice.sign(
        alice
            .envelope(Operation::Append, "messages")
            .with_data(record(json!({ "body": "hello bob" })))
            .with_remote_member(bob.id()),
    );
    let result = alice.as_owner(envelope).await;
    assert!(
        matches!(
            result,
            Err(DispatchError::Request(RequestError::NoForwardingBudget))
        ),
        "got {:?}",
        result
    );
    assert!(net.calls().is_empty());
    Ok(())
}

#[tokio::test]
async fn test_writes_other_than_append_stay_local() -> anyhow::Result<()> {
    let net = network();
    let alice = net.add_pod("alice")?;
    let bob = net.add_pod("bob")?;

    let update = alice
        .envelope(Operation::Update, "network_assets")
        .with_data(record(json!({ "title": "renamed" })))
        .with_remote_member(bob.id())
        .with_depth(1);
    let result = alice.as_owner(update).await;
    assert!(
        matches!(
            result,
            Err(DispatchError::Request(RequestError::RemoteWrite(
                Operation::Update
            )))
        ),
        "got {:?}",
        result
    );

    // naming the pod itself is not a remote write
    seed_assets(&alice, "alice", 1).await;
    let update = alice
        .envelope(Operation::Update, "network_assets")
        .with_data(record(json!({ "title": "renamed" })))
        .with_remote_member(alice.id());
    assert_eq!(alice.as_owner(update).await?, Outcome::Affected(1));
    Ok(())
}

#[tokio::test]
async fn test_duplicate_primary_key_is_rejected() -> anyhow::Result<()> {
    let net = network();
    let bob = net.add_pod("bob")?;

    let like = || {
        bob.envelope(Operation::Append, "likes")
            .with_data(record(json!({ "id": "like-1", "kind": "heart" })))
    };
    assert_eq!(bob.as_owner(like()).await?, Outcome::Affected(1));
    let result = bob.as_owner(like()).await;
    assert!(
        matches!(
            result,
            Err(DispatchError::Request(RequestError::Duplicate { .. }))
        ),
        "got {:?}",
        result
    );
    Ok(())
}

#[tokio::test]
async fn test_obsolete_field_is_rejected() -> anyhow::Result<()> {
    let net = network();
    let bob = net.add_pod("bob")?;

    let append = bob
        .envelope(Operation::Append, "network_assets")
        .with_data(record(json!({ "title": "old", "draft": true })));
    let result = bob.as_owner(append).await;
    assert!(
        matches!(
            result,
            Err(DispatchError::Request(RequestError::Field(FieldError::Obsolete(ref field))))
                if field == "draft"
        ),
        "got {:?}",
        result
    );
    Ok(())
}

#[tokio::test]
async fn test_profile_mutate_merges_and_persist_replaces() -> anyhow::Result<()> {
    let net = network();
    let alice = net.add_pod("alice")?;
    let bob = net.add_pod("bob")?;

    let persist = bob
        .envelope(Operation::Persist, "profile")
        .with_data(record(json!({ "name": "Bob", "bio": "hi" })));
    bob.as_owner(persist).await?;

    let mutate = bob
        .envelope(Operation::Mutate, "profile")
        .with_data(record(json!({ "bio": "hello there" })));
    bob.as_owner(mutate).await?;
    assert_eq!(
        bob.store().get_object("profile").await?,
        Some(record(json!({ "name": "Bob", "bio": "hello there" })))
    );

    let persist = bob
        .envelope(Operation::Persist, "profile")
        .with_data(record(json!({ "name": "Robert" })));
    bob.as_owner(persist).await?;
    assert_eq!(
        bob.store().get_object("profile").await?,
        Some(record(json!({ "name": "Robert" })))
    );

    // any member of the network can read it, but not write it
    let read = alice.sign(alice.envelope(Operation::Query, "profile"));
    let Reply::Connection(connection) = net.send(&alice, &bob, read).await else {
        panic!("expected a connection");
    };
    assert_eq!(connection.edges.len(), 1);
    assert_eq!(connection.edges[0].node["name"], "Robert");

    let write = alice.sign(
        alice
            .envelope(Operation::Mutate, "profile")
            .with_data(record(json!({ "name": "Mallory" }))),
    );
    let reply = net.send(&alice, &bob, write).await;
    assert!(matches!(reply, Reply::Denied(_)), "got {:?}", reply);
    Ok(())
}

#[tokio::test]
async fn test_array_operations_refuse_object_classes() -> anyhow::Result<()> {
    let net = network();
    let bob = net.add_pod("bob")?;

    let append = bob
        .envelope(Operation::Append, "profile")
        .with_data(record(json!({ "name": "Bob" })));
    let result = bob.as_owner(append).await;
    assert!(
        matches!(
            result,
            Err(DispatchError::Request(RequestError::WrongClassKind { .. }))
        ),
        "got {:?}",
        result
    );
    Ok(())
}

#[tokio::test]
async fn test_counter_follows_appends_and_deletes() -> anyhow::Result<()> {
    let net = network();
    let bob = net.add_pod("bob")?;
    bob.append("likes", json!({ "id": "1", "kind": "heart" })).await?;

    let peer = bob.owner_peer();
    let hearts = bob
        .dispatcher()
        .counter(
            peer.as_ref(),
            bob.envelope(Operation::Counter, "likes")
                .with_filter(Filter::new().eq("kind", "heart")),
        )
        .await?;
    assert_eq!(hearts.recv_async().await?, 1);

    bob.append("likes", json!({ "id": "2", "kind": "heart" })).await?;
    assert_eq!(hearts.recv_async().await?, 2);

    // a like of another kind does not move the count
    bob.append("likes", json!({ "id": "3", "kind": "star" })).await?;
    assert!(hearts.try_recv().is_err());

    let delete = bob
        .envelope(Operation::Delete, "likes")
        .with_filter(Filter::new().eq("id", "1"));
    bob.as_owner(delete).await?;
    assert_eq!(hearts.recv_async().await?, 1);
    Ok(())
}

#[tokio::test]
async fn test_updates_stream_matching_changes() -> anyhow::Result<()> {
    let net = network();
    let bob = net.add_pod("bob")?;

    let peer = bob.owner_peer();
    let changes = bob
        .dispatcher()
        .updates(
            peer.as_ref(),
            bob.envelope(Operation::Updates, "likes")
                .with_filter(Filter::new().eq("kind", "heart")),
        )
        .await?;

    bob.append("likes", json!({ "id": "1", "kind": "heart" })).await?;
    bob.append("likes", json!({ "id": "2", "kind": "star" })).await?;
    let update = bob
        .envelope(Operation::Update, "likes")
        .with_filter(Filter::new().eq("id", "1"))
        .with_data(record(json!({ "kind": "heart" })));
    bob.as_owner(update).await?;

    let first = changes.recv_async().await?;
    assert_eq!(first.kind, ChangeKind::Appended);
    assert_eq!(first.class, "likes");
    let second = changes.recv_async().await?;
    assert_eq!(second.kind, ChangeKind::Updated);
    assert_eq!(second.entry_id, first.entry_id);
    assert!(changes.try_recv().is_err());
    Ok(())
}

#[tokio::test]
async fn test_subscriptions_are_local_only() -> anyhow::Result<()> {
    let net = network();
    let bob = net.add_pod("bob")?;
    let peer = bob.owner_peer();

    let deep = bob.envelope(Operation::Counter, "likes").with_depth(1);
    let result = bob.dispatcher().counter(peer.as_ref(), deep).await;
    assert!(matches!(
        result,
        Err(DispatchError::Request(RequestError::SubscriptionScope))
    ));

    let related = bob
        .envelope(Operation::Updates, "likes")
        .with_relations(vec!["friend".to_string()]);
    let result = bob.dispatcher().updates(peer.as_ref(), related).await;
    assert!(matches!(
        result,
        Err(DispatchError::Request(RequestError::SubscriptionScope))
    ));

    // request/reply dispatch cannot carry a stream
    let counter = bob.envelope(Operation::Counter, "likes");
    let result = bob.as_owner(counter).await;
    assert!(matches!(
        result,
        Err(DispatchError::Request(RequestError::Streaming(
            Operation::Counter
        )))
    ));
    assert_eq!(bob.dispatcher().notifier().subscriber_count(), 0);
    Ok(())
}

#[tokio::test]
async fn test_new_contract_version_applies_to_later_requests() -> anyhow::Result<()> {
    let net = network();
    let alice = net.add_pod("alice")?;
    let bob = net.add_pod("bob")?;
    let carol = net.add_pod("carol")?;

    seed_assets(&carol, "carol", 2).await;
    carol.link(&bob.id(), "friend").await?;
    carol.link_between(&bob.id(), &alice.id(), "friend").await?;

    // two hops away is inside the published distance of 2
    let query = alice.sign(
        alice
            .envelope(Operation::Query, "network_assets")
            .with_first(1),
    );
    let Reply::Connection(page) = net.send(&alice, &carol, query).await else {
        panic!("expected a connection");
    };
    assert_eq!(titles(&page), vec!["carol-0"]);
    let cursor = page.end_cursor.expect("a page of one has an end cursor");

    // same reach, new version: cursors from the old version are stale
    carol
        .dispatcher()
        .registry()
        .publish(&ServiceContract::from_json(&contract_json(2, 2))?)?;
    let resume = alice.sign(
        alice
            .envelope(Operation::Query, "network_assets")
            .with_first(1)
            .with_after(cursor),
    );
    let reply = net.send(&alice, &carol, resume).await;
    assert!(matches!(reply, Reply::Invalid(_)), "got {:?}", reply);

    // shrinking the distance drops alice out of carol's network
    carol
        .dispatcher()
        .registry()
        .publish(&ServiceContract::from_json(&contract_json(3, 1))?)?;
    let query = alice.sign(alice.envelope(Operation::Query, "network_assets"));
    let reply = net.send(&alice, &carol, query).await;
    assert!(matches!(reply, Reply::Denied(_)), "got {:?}", reply);

    // an older version published late does not take over
    carol
        .dispatcher()
        .registry()
        .publish(&ServiceContract::from_json(&contract_json(0, 2))?)?;
    assert_eq!(carol.dispatcher().registry().versions("social"), vec![0, 1, 2, 3]);
    let query = alice.sign(alice.envelope(Operation::Query, "network_assets"));
    let reply = net.send(&alice, &carol, query).await;
    assert!(matches!(reply, Reply::Denied(_)), "got {:?}", reply);
    Ok(())
}

#[tokio::test]
async fn test_garbage_credential_is_anonymous() -> anyhow::Result<()> {
    let net = network();
    let alice = net.add_pod("alice")?;
    let bob = net.add_pod("bob")?;
    seed_assets(&bob, "bob", 1).await;
    bob.link(&alice.id(), "friend").await?;

    // a credential issued to someone else cannot be presented by alice
    let stolen = net.member_credential(bob.id());
    let envelope = alice
        .envelope(Operation::Query, "network_assets")
        .sign(alice.secret(), stolen);
    let reply = net.send(&alice, &bob, envelope).await;
    assert!(matches!(reply, Reply::Denied(_)), "got {:?}", reply);
    Ok(())
}

#[tokio::test]
async fn test_long_lived_entries_are_kept() -> anyhow::Result<()> {
    init_tracing();
    let stories = |seconds: u64| {
        json!({
            "service_id": SERVICE,
            "version": 1,
            "classes": {
                "stories": {
                    "type": "array",
                    "expires_after": seconds,
                    "fields": { "title": { "type": "string" } },
                    "acl": [{ "entity": "member", "actions": ["read", "append"] }]
                }
            }
        })
        .to_string()
    };
    assert!(ServiceContract::from_json(&stories(u64::MAX)).is_err());
    assert!(ServiceContract::from_json(&stories(100_000_000_000_000_000)).is_err());

    // accepted, but later than any representable expiry
    let net = TestNetwork::new(ServiceContract::from_json(&stories(9_000_000_000_000_000))?);
    let bob = net.add_pod("bob")?;
    bob.append("stories", json!({ "title": "forever" })).await?;

    let now = chrono::Utc::now();
    assert_eq!(bob.store().count("stories", &Filter::new(), now).await?, 1);
    assert_eq!(bob.store().purge_expired("stories", now).await?, 0);
    Ok(())
}
