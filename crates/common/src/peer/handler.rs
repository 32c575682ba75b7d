use std::sync::Arc;

use anyhow::anyhow;
use async_trait::async_trait;
use futures::future::BoxFuture;
use iroh::endpoint::Connection;
use iroh::protocol::{AcceptError, ProtocolHandler};

use super::messages::{Message, Reply};
use super::MAX_MESSAGE_SIZE;
use crate::crypto::PublicKey;
use crate::identity::{Credential, CredentialVerifier, VerifiedPeer};
use crate::query::{PeerClient, QueryDispatcher, RequestEnvelope};
use crate::store::StorageProvider;

/// Business logic behind the pod protocol
///
/// Implementors turn one message from an authenticated node into a reply; framing,
/// serialization and stream handling live in [`PodProtocol`].
#[async_trait]
pub trait MessageHandler: Send + Sync + 'static {
    async fn handle(&self, sender: PublicKey, message: Message) -> Reply;
}

/// Work out who a request speaks for
///
/// A request carrying an origin is judged as its origin member, and only if the
/// origin signature and the origin's credential both check out. A broken origin is
/// never traded for the sender's own identity. Without an origin, the sender's
/// credential is used.
pub fn resolve_identity(
    verifier: &CredentialVerifier,
    sender: &PublicKey,
    credential: Option<&Credential>,
    envelope: &RequestEnvelope,
) -> Option<VerifiedPeer> {
    if envelope.origin.is_some() {
        let Some(origin) = envelope.verified_origin() else {
            tracing::debug!("query {} carries a bad origin signature", envelope.query_id);
            return None;
        };
        return verifier.verify(&origin.credential, &origin.member_id);
    }
    credential.and_then(|credential| verifier.verify(credential, sender))
}

/// Serves requests from other pods against a local dispatcher
pub struct PodHandler<S, C> {
    dispatcher: Arc<QueryDispatcher<S, C>>,
    verifier: Arc<CredentialVerifier>,
}

impl<S, C> PodHandler<S, C> {
    pub fn new(dispatcher: Arc<QueryDispatcher<S, C>>, verifier: Arc<CredentialVerifier>) -> Self {
        Self {
            dispatcher,
            verifier,
        }
    }
}

#[async_trait]
impl<S: StorageProvider, C: PeerClient> MessageHandler for PodHandler<S, C> {
    async fn handle(&self, sender: PublicKey, message: Message) -> Reply {
        let Message::Request {
            credential,
            envelope,
        } = message;
        let peer = resolve_identity(&self.verifier, &sender, credential.as_ref(), &envelope);
        self.dispatcher
            .dispatch(peer.as_ref(), Some(&sender), envelope)
            .await
            .into()
    }
}

/// iroh protocol handler for the pod ALPN
///
/// One bidirectional stream per request: read a JSON [`Message`] up to the size cap,
/// hand it to the [`MessageHandler`], write back the JSON [`Reply`].
pub struct PodProtocol<H> {
    handler: Arc<H>,
}

impl<H> Clone for PodProtocol<H> {
    fn clone(&self) -> Self {
        Self {
            handler: self.handler.clone(),
        }
    }
}

impl<H> std::fmt::Debug for PodProtocol<H> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PodProtocol").finish_non_exhaustive()
    }
}

impl<H: MessageHandler> PodProtocol<H> {
    pub fn new(handler: Arc<H>) -> Self {
        Self { handler }
    }
}

fn accept_error(message: String) -> AcceptError {
    let err: Box<dyn std::error::Error + Send + Sync> = anyhow!(message).into();
    AcceptError::from(err)
}

impl<H: MessageHandler> ProtocolHandler for PodProtocol<H> {
    #[allow(refining_impl_trait)]
    fn accept(&self, conn: Connection) -> BoxFuture<'static, Result<(), AcceptError>> {
        let handler = self.handler.clone();
        Box::pin(async move {
            let sender: PublicKey = conn
                .remote_node_id()
                .map_err(|e| {
                    tracing::error!("failed to read remote node id: {}", e);
                    accept_error(format!("failed to read remote node id: {}", e))
                })?
                .into();
            tracing::debug!("new connection from {}", sender);

            let (mut send, mut recv) = conn.accept_bi().await.map_err(|e| {
                tracing::error!("failed to accept bidirectional stream: {}", e);
                AcceptError::from(e)
            })?;

            let message_bytes = recv.read_to_end(MAX_MESSAGE_SIZE).await.map_err(|e| {
                tracing::error!("failed to read message: {}", e);
                AcceptError::from(std::io::Error::other(e))
            })?;

            let reply = match serde_json::from_slice::<Message>(&message_bytes) {
                Ok(message) => handler.handle(sender, message).await,
                Err(e) => {
                    tracing::warn!("malformed message from {}: {}", sender, e);
                    Reply::Invalid(format!("malformed message: {}", e))
                }
            };

            let reply_bytes = serde_json::to_vec(&reply).map_err(|e| {
                tracing::error!("failed to serialize reply: {}", e);
                accept_error(format!("failed to serialize reply: {}", e))
            })?;
            send.write_all(&reply_bytes).await.map_err(|e| {
                tracing::error!("failed to send reply: {}", e);
                AcceptError::from(std::io::Error::other(e))
            })?;
            send.finish().map_err(|e| {
                tracing::error!("failed to finish stream: {}", e);
                AcceptError::from(std::io::Error::other(e))
            })?;

            // wait for the initiator to read the reply and hang up
            conn.closed().await;
            tracing::debug!("answered {} with {}", sender, reply);
            Ok(())
        })
    }
}
