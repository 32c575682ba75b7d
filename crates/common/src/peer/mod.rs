//! Pod-to-pod transport
//!
//! Pods talk over iroh. The node id of a pod's endpoint is its owner's member id, so
//! the transport authenticates the sending pod for free; what the sender may do is
//! decided from the credentials carried in the message.
//!
//! - **[`Message`]** / **[`Reply`]**: the JSON wire messages
//! - **[`MessageHandler`]** / **[`PodHandler`]**: message to reply, through a dispatcher
//! - **[`PodProtocol`]**: the iroh protocol handler for [`ALPN`]
//! - **[`IrohPeerClient`]**: the [`PeerClient`](crate::query::PeerClient) used in production

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};

use anyhow::{anyhow, Result};
use iroh::discovery::pkarr::dht::DhtDiscovery;
use iroh::protocol::Router;
use iroh::Endpoint;
use tokio::sync::watch::Receiver as WatchReceiver;

mod client;
mod handler;
mod messages;

pub use client::IrohPeerClient;
pub use handler::{resolve_identity, MessageHandler, PodHandler, PodProtocol};
pub use messages::{Message, Reply};

use crate::crypto::SecretKey;

/// ALPN identifier for the pod protocol
pub const ALPN: &[u8] = b"/podnet/1";

/// Largest message either side will read
pub const MAX_MESSAGE_SIZE: usize = 1024 * 1024;

/// Bind an endpoint keyed by the pod secret
///
/// Without a socket address an ephemeral port is used.
pub async fn bind_endpoint(
    secret_key: &SecretKey,
    socket_address: Option<SocketAddr>,
) -> Result<Endpoint> {
    let socket_addr =
        socket_address.unwrap_or_else(|| SocketAddr::new(Ipv4Addr::UNSPECIFIED.into(), 0));
    let ip = match socket_addr.ip() {
        std::net::IpAddr::V4(ip) => ip,
        std::net::IpAddr::V6(ip) => {
            return Err(anyhow!("only IPv4 listen addresses are supported, got {}", ip))
        }
    };

    let mainline_discovery = DhtDiscovery::builder()
        .secret_key(secret_key.0.clone())
        .build()
        .map_err(|e| anyhow!("failed to build mainline discovery: {}", e))?;

    let endpoint = Endpoint::builder()
        .secret_key(secret_key.0.clone())
        .discovery(mainline_discovery)
        .bind_addr_v4(SocketAddrV4::new(ip, socket_addr.port()))
        .bind()
        .await
        .map_err(|e| anyhow!("failed to bind endpoint: {}", e))?;
    tracing::info!("pod endpoint bound as {}", endpoint.node_id());
    Ok(endpoint)
}

/// Serve the pod protocol until shutdown is signalled
pub async fn spawn<H: MessageHandler>(
    endpoint: Endpoint,
    protocol: PodProtocol<H>,
    mut shutdown_rx: WatchReceiver<()>,
) -> Result<()> {
    let router = Router::builder(endpoint).accept(ALPN, protocol).spawn();

    let _ = shutdown_rx.changed().await;

    router.shutdown().await?;
    Ok(())
}
