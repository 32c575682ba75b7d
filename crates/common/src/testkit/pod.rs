use std::sync::Arc;

use anyhow::{anyhow, Result};
use serde_json::json;

use super::network::TestClient;
use super::{NETWORK_AUTHORITY, POD_AUTHORITY, SERVICE_AUTHORITY};
use crate::access::{AccessEngine, Precedence};
use crate::contract::{ServiceContract, NETWORK_LINKS_CLASS};
use crate::crypto::{PublicKey, SecretKey};
use crate::identity::{Authorities, Credential, CredentialVerifier, VerifiedPeer};
use crate::network::{OWNER_FIELD, PEER_FIELD, RELATION_FIELD};
use crate::peer::{MessageHandler, PodHandler};
use crate::policy::PolicyRegistry;
use crate::query::{
    DispatchError, DispatcherConfig, Operation, Outcome, QueryDispatcher, RequestEnvelope,
};
use crate::store::{MemoryStore, Record};

/// An in-process pod with convenience methods for tests
pub struct TestPod {
    /// The name of this pod (for debugging)
    pub name: String,
    secret: SecretKey,
    service_id: String,
    network_credential: Credential,
    owner_credential: Credential,
    verifier: Arc<CredentialVerifier>,
    dispatcher: Arc<QueryDispatcher<MemoryStore, TestClient>>,
}

impl TestPod {
    #[allow(clippy::too_many_arguments)]
    pub(super) fn new(
        name: String,
        secret: SecretKey,
        contract: &ServiceContract,
        network_credential: Credential,
        network_authority: &SecretKey,
        service_authority: &SecretKey,
        client: TestClient,
        config: DispatcherConfig,
        precedence: Precedence,
    ) -> Result<Self> {
        let id = secret.public();
        let registry = Arc::new(PolicyRegistry::new());
        registry
            .publish(contract)
            .map_err(|e| anyhow!("failed to publish contract into {}: {}", name, e))?;

        let authorities = Authorities {
            pod_owner: id,
            pod: POD_AUTHORITY.to_string(),
            service: SERVICE_AUTHORITY.to_string(),
            network: NETWORK_AUTHORITY.to_string(),
        };
        // the owner's key doubles as this pod's member-signing authority
        let verifier = CredentialVerifier::new()
            .trust(POD_AUTHORITY, id)
            .trust(SERVICE_AUTHORITY, service_authority.public())
            .trust(NETWORK_AUTHORITY, network_authority.public());
        let owner_credential =
            Credential::issue(&secret, POD_AUTHORITY, id, &contract.service_id);

        let dispatcher = QueryDispatcher::new(
            registry,
            AccessEngine::new(authorities, precedence),
            MemoryStore::new(),
            client,
            config,
        );

        Ok(Self {
            name,
            secret,
            service_id: contract.service_id.clone(),
            network_credential,
            owner_credential,
            verifier: Arc::new(verifier),
            dispatcher: Arc::new(dispatcher),
        })
    }

    pub fn id(&self) -> PublicKey {
        self.secret.public()
    }

    pub fn secret(&self) -> &SecretKey {
        &self.secret
    }

    pub fn store(&self) -> &MemoryStore {
        self.dispatcher.store()
    }

    pub fn dispatcher(&self) -> &QueryDispatcher<MemoryStore, TestClient> {
        &self.dispatcher
    }

    pub fn verifier(&self) -> &CredentialVerifier {
        &self.verifier
    }

    pub fn network_credential(&self) -> &Credential {
        &self.network_credential
    }

    pub(super) fn handler(&self) -> Arc<dyn MessageHandler> {
        Arc::new(PodHandler::new(
            self.dispatcher.clone(),
            self.verifier.clone(),
        ))
    }

    /// The owner's verified identity on their own pod
    pub fn owner_peer(&self) -> Option<VerifiedPeer> {
        self.verifier.verify(&self.owner_credential, &self.id())
    }

    /// A fresh envelope for this pod's service
    pub fn envelope(&self, operation: Operation, class: &str) -> RequestEnvelope {
        RequestEnvelope::new(&self.service_id, operation, class)
    }

    /// Sign an envelope as originating from this pod's owner
    pub fn sign(&self, envelope: RequestEnvelope) -> RequestEnvelope {
        envelope.sign(&self.secret, self.network_credential.clone())
    }

    /// Run a request on this pod as its owner
    pub async fn as_owner(&self, envelope: RequestEnvelope) -> Result<Outcome, DispatchError> {
        let peer = self.owner_peer();
        self.dispatcher
            .dispatch(peer.as_ref(), Some(&self.id()), envelope)
            .await
    }

    /// Record a link from this pod's owner to `peer`
    pub async fn link(&self, peer: &PublicKey, relation: &str) -> Result<()> {
        self.append_link(json!({
            PEER_FIELD: peer.to_hex(),
            RELATION_FIELD: relation,
        }))
        .await
    }

    /// Record a link between two other members, seen from this pod
    pub async fn link_between(
        &self,
        from: &PublicKey,
        to: &PublicKey,
        relation: &str,
    ) -> Result<()> {
        self.append_link(json!({
            OWNER_FIELD: from.to_hex(),
            PEER_FIELD: to.to_hex(),
            RELATION_FIELD: relation,
        }))
        .await
    }

    async fn append_link(&self, value: serde_json::Value) -> Result<()> {
        let data: Record = value
            .as_object()
            .cloned()
            .ok_or_else(|| anyhow!("link record must be an object"))?;
        let envelope = self
            .envelope(Operation::Append, NETWORK_LINKS_CLASS)
            .with_data(data);
        self.as_owner(envelope).await?;
        Ok(())
    }

    /// Append a record to an array class as the owner
    pub async fn append(&self, class: &str, value: serde_json::Value) -> Result<()> {
        let data: Record = value
            .as_object()
            .cloned()
            .ok_or_else(|| anyhow!("record must be an object"))?;
        self.as_owner(self.envelope(Operation::Append, class).with_data(data))
            .await?;
        Ok(())
    }
}
