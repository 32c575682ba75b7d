/**
 * Access decisions: combines a classified caller, a compiled
 *  policy table and the pod's network graph into permit/deny.
 */
pub mod access;
/**
 * Service contracts: data classes, field maps and
 *  access-control entries, as loaded from JSON.
 */
pub mod contract;
/**
 * Cryptographic types and operations.
 *  - Public and Private key implementations
 *  - Signing and verification
 */
pub mod crypto;
/**
 * Opaque pagination cursors and the forward
 *  scanner that resumes from them.
 */
pub mod cursor;
/**
 * Membership credentials and caller classification.
 */
pub mod identity;
/**
 * A pod's social graph and the distance
 *  evaluator that walks it.
 */
pub mod network;
/**
 * Live counters and change subscriptions.
 */
pub mod notify;
/**
 * Pod-to-pod transport over iroh.
 */
pub mod peer;
/**
 * Compiled policy tables and the versioned
 *  registry that hands them out.
 */
pub mod policy;
/**
 * Request envelopes and the dispatcher that runs
 *  permitted operations locally and across pods.
 */
pub mod query;
/**
 * Storage collaborator interface plus an
 *  in-memory implementation.
 */
pub mod store;
/**
 * In-process multi-pod harness for tests.
 */
pub mod testkit;

pub mod prelude {
    pub use crate::access::{AccessEngine, Decision, Precedence};
    pub use crate::contract::{Action, DataClass, EntityKind, ServiceContract};
    pub use crate::crypto::{PublicKey, SecretKey};
    pub use crate::identity::{Authorities, Caller, Credential, CredentialVerifier, VerifiedPeer};
    pub use crate::policy::PolicyRegistry;
    pub use crate::query::{
        Connection, DispatchError, DispatcherConfig, Operation, Outcome, QueryDispatcher,
        RequestEnvelope,
    };
    pub use crate::store::{Filter, MemoryStore, Record, StorageProvider};
}
