//! Service contracts
//!
//! A service contract is the schema a service publishes for its member pods. It names
//! every data class pods store for the service, the shape of each class, and the
//! access-control entries deciding which callers may do what with it.
//!
//! Contracts are plain data: they deserialize from JSON and are never mutated after
//! loading. Publishing one into a [`PolicyRegistry`](crate::policy::PolicyRegistry)
//! compiles its entries into decision tables; that is where malformed entries are
//! rejected.
//!
//! ```json
//! {
//!   "service_id": "social",
//!   "version": 1,
//!   "classes": {
//!     "network_assets": {
//!       "type": "array",
//!       "fields": { "title": { "type": "string" } },
//!       "acl": [
//!         { "entity": "member", "actions": ["read", "update", "delete", "append"] },
//!         { "entity": "network", "actions": ["read"], "distance": 1, "relation": "friend" }
//!       ]
//!     }
//!   }
//! }
//! ```

mod acl;
mod class;

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

pub use acl::{AccessControlEntry, Action, EntityKind};
pub use class::{ClassKind, DataClass, FieldError, FieldSpec, FieldType};

/// Name of the array class holding a pod's network links
pub const NETWORK_LINKS_CLASS: &str = "network_links";

#[derive(Debug, thiserror::Error)]
pub enum ContractError {
    #[error("malformed contract: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("class {class}: unknown entity kind '{entity}'")]
    UnknownEntity { class: String, entity: String },
    #[error("class {class}: unknown action '{action}'")]
    UnknownAction { class: String, action: String },
    #[error("class {class}: network distance must be at least 1, got {distance}")]
    InvalidDistance { class: String, distance: i64 },
    #[error("class {class}: invalid relation pattern '{pattern}': {source}")]
    InvalidRelation {
        class: String,
        pattern: String,
        #[source]
        source: regex::Error,
    },
    #[error("class {class}: more than one entry for entity kind {entity}")]
    DuplicateEntry { class: String, entity: EntityKind },
    #[error("class {class}: '{specifier}' is not valid for entity kind {entity}")]
    MisplacedSpecifier {
        class: String,
        entity: EntityKind,
        specifier: &'static str,
    },
    #[error("class {class}: {reason}")]
    InvalidClass { class: String, reason: String },
    #[error("service {service_id} version {version} is already published")]
    VersionExists { service_id: String, version: u32 },
}

/// A versioned service contract
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceContract {
    pub service_id: String,
    pub version: u32,
    #[serde(default)]
    pub classes: BTreeMap<String, DataClass>,
}

impl ServiceContract {
    /// Parse a contract from its JSON representation
    ///
    /// Only the document structure is checked here; access-control entries are
    /// validated when the contract is compiled.
    pub fn from_json(json: &str) -> Result<Self, ContractError> {
        let contract: ServiceContract = serde_json::from_str(json)?;
        for (name, class) in &contract.classes {
            class.check_shape(name)?;
        }
        Ok(contract)
    }

    pub fn class(&self, name: &str) -> Option<&DataClass> {
        self.classes.get(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_contract() {
        let json = r#"{
            "service_id": "social",
            "version": 3,
            "classes": {
                "profile": {
                    "type": "object",
                    "fields": {
                        "name": { "type": "string" },
                        "nickname": { "type": "string", "obsolete": true }
                    },
                    "acl": [ { "entity": "member", "actions": ["read", "update"] } ]
                },
                "posts": {
                    "type": "array",
                    "primary_key": "slug",
                    "counter": ["kind"],
                    "expires_after": 600,
                    "acl": []
                }
            }
        }"#;

        let contract = ServiceContract::from_json(json).unwrap();
        assert_eq!(contract.version, 3);
        let profile = contract.class("profile").unwrap();
        assert_eq!(profile.kind, ClassKind::Object);
        assert!(profile.fields["nickname"].obsolete);
        let posts = contract.class("posts").unwrap();
        assert_eq!(posts.primary_key.as_deref(), Some("slug"));
        assert_eq!(posts.expires_after, Some(600));
    }

    #[test]
    fn test_object_class_cannot_expire() {
        let json = r#"{
            "service_id": "social",
            "version": 1,
            "classes": { "profile": { "type": "object", "expires_after": 5 } }
        }"#;
        assert!(matches!(
            ServiceContract::from_json(json),
            Err(ContractError::InvalidClass { .. })
        ));
    }

    #[test]
    fn test_primary_key_must_be_live_field() {
        let json = r#"{
            "service_id": "social",
            "version": 1,
            "classes": {
                "posts": {
                    "type": "array",
                    "primary_key": "slug",
                    "fields": { "slug": { "type": "string", "obsolete": true } }
                }
            }
        }"#;
        assert!(matches!(
            ServiceContract::from_json(json),
            Err(ContractError::InvalidClass { .. })
        ));
    }
}
