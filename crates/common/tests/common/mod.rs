//! Shared fixtures for multi-pod integration tests
#![allow(dead_code)]

use common::contract::ServiceContract;
use common::query::{Connection, Operation};
use common::store::Record;
use common::testkit::{TestNetwork, TestPod};
use serde_json::{json, Value};

pub const SERVICE: &str = "social";

/// The contract every test pod publishes
///
/// `network_assets` is readable by members up to two `friend` hops away;
/// `messages` accepts appends from any member of the network; `likes` carries a
/// counter field; `profile` is an object class.
pub fn contract() -> ServiceContract {
    ServiceContract::from_json(&contract_json(1, 2)).expect("fixture contract is valid")
}

pub fn contract_json(version: u32, distance: u32) -> String {
    json!({
        "service_id": SERVICE,
        "version": version,
        "classes": {
            "network_links": {
                "type": "array",
                "fields": {
                    "peer_member_id": { "type": "string" },
                    "relation": { "type": "string" },
                    "member_id": { "type": "string" }
                },
                "acl": [
                    { "entity": "member", "actions": ["read", "append", "delete"] }
                ]
            },
            "network_assets": {
                "type": "array",
                "fields": {
                    "title": { "type": "string" },
                    "kind": { "type": "string" },
                    "draft": { "type": "boolean", "obsolete": true }
                },
                "acl": [
                    { "entity": "member", "actions": ["read", "search", "update", "delete", "append"] },
                    {
                        "entity": "network",
                        "actions": ["read", "search"],
                        "distance": distance,
                        "relation": "friend",
                        "cache": 60
                    }
                ]
            },
            "messages": {
                "type": "array",
                "fields": { "body": { "type": "string" } },
                "acl": [
                    { "entity": "member", "actions": ["read", "append", "delete"] },
                    { "entity": "any_member", "actions": ["append"] }
                ]
            },
            "likes": {
                "type": "array",
                "primary_key": "id",
                "counter": ["kind"],
                "fields": {
                    "id": { "type": "string" },
                    "kind": { "type": "string" }
                },
                "acl": [
                    { "entity": "member", "actions": ["read", "append", "update", "delete"] },
                    { "entity": "anonymous", "actions": ["read"] }
                ]
            },
            "profile": {
                "type": "object",
                "fields": {
                    "name": { "type": "string" },
                    "bio": { "type": "string" }
                },
                "acl": [
                    { "entity": "member", "actions": ["read", "update", "persist"] },
                    { "entity": "any_member", "actions": ["read"] }
                ]
            }
        }
    })
    .to_string()
}

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub fn record(value: Value) -> Record {
    value.as_object().cloned().expect("record fixture is an object")
}

/// Titles of a connection's edges, in order
pub fn titles(connection: &Connection) -> Vec<String> {
    connection
        .edges
        .iter()
        .filter_map(|edge| edge.node.get("title").and_then(Value::as_str))
        .map(str::to_string)
        .collect()
}

/// Seed `count` assets titled `<prefix>-<n>` on a pod
pub async fn seed_assets(pod: &TestPod, prefix: &str, count: usize) {
    for n in 0..count {
        pod.append(
            "network_assets",
            json!({ "title": format!("{}-{}", prefix, n), "kind": "photo" }),
        )
        .await
        .expect("owner can append assets");
    }
}

/// A signed query for `network_assets` originating from `origin`'s owner
pub fn signed_query(origin: &TestPod, depth: u32) -> common::query::RequestEnvelope {
    origin.sign(
        origin
            .envelope(Operation::Query, "network_assets")
            .with_depth(depth),
    )
}

pub fn network() -> TestNetwork {
    init_tracing();
    TestNetwork::new(contract())
}
