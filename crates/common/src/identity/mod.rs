//! Caller identity
//!
//! Transport verifies *who* is on the other end; this module decides *what kind* of
//! caller that is for a given service:
//!
//! - **[`Credential`]** / **[`CredentialVerifier`]**: membership credentials signed by
//!   an authority key, checked against the authorities a pod trusts
//! - **[`VerifiedPeer`]**: the verified subject, issuer chain and token claims
//! - **[`classify`]**: pure mapping from a verified peer to a [`Caller`]
//!
//! Classification never fails. Anything it cannot make sense of is anonymous.

mod classify;
mod credential;

pub use classify::{classify, Authorities, Caller, TokenClaims, VerifiedPeer};
pub use credential::{Credential, CredentialVerifier};
