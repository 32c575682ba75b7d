//! Cryptographic primitives for podnet
//!
//! Every pod owner holds an Ed25519 keypair (`SecretKey`/`PublicKey`). The public half
//! does three jobs at once:
//!
//! - **Member identity**: the canonical member identifier used in network links,
//!   access decisions and request envelopes
//! - **Transport identity**: the iroh node id a pod is reachable at
//! - **Provenance**: it verifies origin signatures on proxied requests and
//!   authority signatures on membership credentials
//!
//! Certificate hierarchies are not managed here; authorities are just keypairs whose
//! public halves a pod is configured to trust.

mod keys;

pub use ed25519_dalek::Signature;
pub use keys::{KeyError, PublicKey, SecretKey, PRIVATE_KEY_SIZE, PUBLIC_KEY_SIZE};
