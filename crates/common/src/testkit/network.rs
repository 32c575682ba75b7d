use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};

use super::pod::TestPod;
use crate::access::Precedence;
use crate::contract::ServiceContract;
use crate::crypto::{PublicKey, SecretKey};
use crate::identity::Credential;
use crate::peer::{Message, MessageHandler, Reply};
use crate::query::{DispatcherConfig, PeerClient, RequestEnvelope};

/// How a pod answers in-process requests
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Behavior {
    #[default]
    Online,
    /// Every request fails to connect
    Offline,
    /// Requests are answered after a delay
    Slow(Duration),
}

/// One request delivered through the network
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Call {
    pub from: PublicKey,
    pub to: PublicKey,
    pub depth: u32,
}

struct Slot {
    handler: Arc<dyn MessageHandler>,
    behavior: Behavior,
}

#[derive(Default)]
pub(super) struct NetworkInner {
    pods: RwLock<HashMap<PublicKey, Slot>>,
    calls: Mutex<Vec<Call>>,
}

/// A coordinator for in-process test pods
///
/// Every pod publishes the same service contract and trusts the same network and
/// service authorities.
pub struct TestNetwork {
    inner: Arc<NetworkInner>,
    contract: ServiceContract,
    network_authority: SecretKey,
    service_authority: SecretKey,
    config: DispatcherConfig,
    precedence: Precedence,
}

impl TestNetwork {
    pub fn new(contract: ServiceContract) -> Self {
        Self {
            inner: Arc::new(NetworkInner::default()),
            contract,
            network_authority: SecretKey::generate(),
            service_authority: SecretKey::generate(),
            config: DispatcherConfig::default(),
            precedence: Precedence::default(),
        }
    }

    /// Budget each pod gives forwarded requests
    pub fn with_remote_timeout(mut self, timeout: Duration) -> Self {
        self.config.remote_timeout = timeout;
        self
    }

    pub fn with_precedence(mut self, precedence: Precedence) -> Self {
        self.precedence = precedence;
        self
    }

    pub fn service_id(&self) -> &str {
        &self.contract.service_id
    }

    /// Create a pod, publish the contract into it and make it reachable
    pub fn add_pod(&self, name: impl Into<String>) -> Result<TestPod> {
        let secret = SecretKey::generate();
        let id = secret.public();
        let network_credential = Credential::issue(
            &self.network_authority,
            super::NETWORK_AUTHORITY,
            id,
            &self.contract.service_id,
        );
        let client = TestClient {
            network: Arc::downgrade(&self.inner),
            id,
            credential: network_credential.clone(),
        };

        let pod = TestPod::new(
            name.into(),
            secret,
            &self.contract,
            network_credential,
            &self.network_authority,
            &self.service_authority,
            client,
            self.config.clone(),
            self.precedence,
        )?;

        self.inner.pods.write().insert(
            id,
            Slot {
                handler: pod.handler(),
                behavior: Behavior::Online,
            },
        );
        Ok(pod)
    }

    /// A credential from the network authority for a member without a pod here
    pub fn member_credential(&self, member: PublicKey) -> Credential {
        Credential::issue(
            &self.network_authority,
            super::NETWORK_AUTHORITY,
            member,
            &self.contract.service_id,
        )
    }

    /// A credential from the service authority naming `service`
    pub fn service_credential(&self, key: PublicKey) -> Credential {
        Credential::issue(
            &self.service_authority,
            super::SERVICE_AUTHORITY,
            key,
            &self.contract.service_id,
        )
    }

    pub fn set_behavior(&self, pod: &PublicKey, behavior: Behavior) -> Result<()> {
        let mut pods = self.inner.pods.write();
        let slot = pods
            .get_mut(pod)
            .ok_or_else(|| anyhow!("pod {} is not in the network", pod))?;
        slot.behavior = behavior;
        Ok(())
    }

    /// Deliver a request from `from`'s owner to `to`, as a message over the wire
    pub async fn send(&self, from: &TestPod, to: &TestPod, envelope: RequestEnvelope) -> Reply {
        let client = TestClient {
            network: Arc::downgrade(&self.inner),
            id: from.id(),
            credential: from.network_credential().clone(),
        };
        match client.send(&to.id(), envelope).await {
            Ok(reply) => reply,
            Err(e) => Reply::Failed(e.to_string()),
        }
    }

    /// Every request delivered so far, in delivery order
    pub fn calls(&self) -> Vec<Call> {
        self.inner.calls.lock().clone()
    }

    pub fn clear_calls(&self) {
        self.inner.calls.lock().clear();
    }
}

/// In-process [`PeerClient`] presenting a pod's network credential
pub struct TestClient {
    network: Weak<NetworkInner>,
    id: PublicKey,
    credential: Credential,
}

#[async_trait]
impl PeerClient for TestClient {
    async fn send(&self, target: &PublicKey, envelope: RequestEnvelope) -> Result<Reply> {
        let network = self
            .network
            .upgrade()
            .ok_or_else(|| anyhow!("test network was dropped"))?;

        let (handler, behavior) = {
            let pods = network.pods.read();
            let slot = pods
                .get(target)
                .ok_or_else(|| anyhow!("pod {} is not in the network", target))?;
            (slot.handler.clone(), slot.behavior)
        };

        network.calls.lock().push(Call {
            from: self.id,
            to: *target,
            depth: envelope.depth,
        });

        match behavior {
            Behavior::Online => {}
            Behavior::Offline => return Err(anyhow!("pod {} is offline", target)),
            Behavior::Slow(delay) => tokio::time::sleep(delay).await,
        }

        // round trip through JSON like the wire does
        let message = Message::Request {
            credential: Some(self.credential.clone()),
            envelope,
        };
        let message: Message = serde_json::from_slice(&serde_json::to_vec(&message)?)?;
        let reply = handler.handle(self.id, message).await;
        Ok(serde_json::from_slice(&serde_json::to_vec(&reply)?)?)
    }
}
