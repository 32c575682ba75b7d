use anyhow::{anyhow, Result};
use async_trait::async_trait;
use iroh::Endpoint;

use super::messages::{Message, Reply};
use super::{ALPN, MAX_MESSAGE_SIZE};
use crate::crypto::PublicKey;
use crate::identity::Credential;
use crate::query::{PeerClient, RequestEnvelope};

/// Reaches other pods over iroh
///
/// Presents this pod's membership credential with every request, so a receiving pod
/// can classify requests that carry no origin.
#[derive(Debug, Clone)]
pub struct IrohPeerClient {
    endpoint: Endpoint,
    credential: Option<Credential>,
}

impl IrohPeerClient {
    pub fn new(endpoint: Endpoint, credential: Option<Credential>) -> Self {
        Self {
            endpoint,
            credential,
        }
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }
}

#[async_trait]
impl PeerClient for IrohPeerClient {
    async fn send(&self, target: &PublicKey, envelope: RequestEnvelope) -> Result<Reply> {
        let conn = self.endpoint.connect(**target, ALPN).await.map_err(|e| {
            tracing::error!("failed to connect to pod {}: {}", target, e);
            anyhow!("failed to connect to pod: {}", e)
        })?;

        let (mut send, mut recv) = conn.open_bi().await.map_err(|e| {
            tracing::error!("failed to open bidirectional stream: {}", e);
            anyhow!("failed to open bidirectional stream: {}", e)
        })?;

        let message = Message::Request {
            credential: self.credential.clone(),
            envelope,
        };
        let request_bytes = serde_json::to_vec(&message)
            .map_err(|e| anyhow!("failed to serialize request: {}", e))?;
        if request_bytes.len() > MAX_MESSAGE_SIZE {
            return Err(anyhow!(
                "request of {} bytes exceeds the message limit",
                request_bytes.len()
            ));
        }

        send.write_all(&request_bytes)
            .await
            .map_err(|e| anyhow!("failed to write request: {}", e))?;
        send.finish()
            .map_err(|e| anyhow!("failed to finish sending request: {}", e))?;

        let reply_bytes = recv
            .read_to_end(MAX_MESSAGE_SIZE)
            .await
            .map_err(|e| anyhow!("failed to read reply: {}", e))?;
        let reply: Reply = serde_json::from_slice(&reply_bytes)
            .map_err(|e| anyhow!("failed to deserialize reply: {}", e))?;

        conn.close(0u32.into(), b"done");
        tracing::debug!("pod {} replied with {}", target, reply);
        Ok(reply)
    }
}
