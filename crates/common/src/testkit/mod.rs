/// Lightweight harness for multi-pod tests
///
/// Pods live in-process and talk through an in-memory [`PeerClient`](crate::query::PeerClient)
/// that runs the same message handler the iroh transport does, so identity
/// resolution, origin signatures and depth handling are exercised exactly as over the
/// wire. Pods can be taken offline or slowed down to test fan-out failure handling.
///
/// # Example
///
/// ```rust,ignore
/// use common::testkit::TestNetwork;
///
/// #[tokio::test]
/// async fn test_friend_reads_assets() -> anyhow::Result<()> {
///     let net = TestNetwork::new(contract());
///     let alice = net.add_pod("alice")?;
///     let bob = net.add_pod("bob")?;
///
///     bob.link(&alice.id(), "friend").await?;
///     let reply = net.send(&alice, &bob, alice.envelope(Operation::Query, "network_assets")).await;
///     assert!(matches!(reply, Reply::Connection(_)));
///     Ok(())
/// }
/// ```
mod network;
mod pod;

pub use network::{Behavior, Call, TestClient, TestNetwork};
pub use pod::TestPod;

/// Issuer name of each pod's own member-signing authority
pub const POD_AUTHORITY: &str = "pod";
/// Issuer name of the hosting service's authority
pub const SERVICE_AUTHORITY: &str = "service";
/// Issuer name of the network's member-signing authority
pub const NETWORK_AUTHORITY: &str = "network";
