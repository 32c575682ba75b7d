use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use super::{TokenClaims, VerifiedPeer};
use crate::crypto::{PublicKey, SecretKey, Signature};

/// A membership credential: an authority vouching that `subject` belongs to a service
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credential {
    pub subject: PublicKey,
    pub service_id: String,
    pub issuer: String,
    pub signature: Signature,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub claims: Option<TokenClaims>,
}

impl Credential {
    fn signing_bytes(subject: &PublicKey, service_id: &str, issuer: &str) -> Vec<u8> {
        let mut bytes = b"podnet-credential\0".to_vec();
        bytes.extend_from_slice(&subject.to_bytes());
        bytes.extend_from_slice(service_id.as_bytes());
        bytes.push(0);
        bytes.extend_from_slice(issuer.as_bytes());
        bytes
    }

    /// Issue a credential signed by an authority key
    pub fn issue(authority: &SecretKey, issuer: &str, subject: PublicKey, service_id: &str) -> Self {
        let signature = authority.sign(&Self::signing_bytes(&subject, service_id, issuer));
        Self {
            subject,
            service_id: service_id.to_string(),
            issuer: issuer.to_string(),
            signature,
            claims: None,
        }
    }

    pub fn with_claims(mut self, claims: TokenClaims) -> Self {
        self.claims = Some(claims);
        self
    }
}

/// The authorities a pod trusts, by name
#[derive(Debug, Clone, Default)]
pub struct CredentialVerifier {
    trusted: HashMap<String, PublicKey>,
}

impl CredentialVerifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn trust(mut self, issuer: impl Into<String>, key: PublicKey) -> Self {
        self.trusted.insert(issuer.into(), key);
        self
    }

    /// Verify a credential presented by the holder of `presenter`
    ///
    /// Returns `None` if the issuer is unknown, the signature is bad, or the
    ///  credential was issued to someone other than the presenter.
    pub fn verify(&self, credential: &Credential, presenter: &PublicKey) -> Option<VerifiedPeer> {
        if credential.subject != *presenter {
            tracing::debug!(
                "credential subject {} presented by {}",
                credential.subject,
                presenter
            );
            return None;
        }
        let authority = self.trusted.get(&credential.issuer)?;
        let bytes = Credential::signing_bytes(
            &credential.subject,
            &credential.service_id,
            &credential.issuer,
        );
        if let Err(e) = authority.verify(&bytes, &credential.signature) {
            tracing::debug!("credential from {} failed verification: {}", credential.issuer, e);
            return None;
        }
        Some(VerifiedPeer {
            subject: credential.subject.to_hex(),
            issuer_chain: vec![credential.issuer.clone()],
            service_id: Some(credential.service_id.clone()),
            claims: credential.claims.clone(),
        })
    }
}
