use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Trust classification of a caller, the key axis of every access decision
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    /// The pod owner
    Member,
    /// The hosting service
    Service,
    /// Another member of the service within graph distance of the owner.
    ///  Never produced by classification; reached through `AnyMember`.
    Network,
    /// Any other pod that joined the same service
    AnyMember,
    /// Everyone else
    Anonymous,
}

impl EntityKind {
    pub const ALL: [EntityKind; 5] = [
        EntityKind::Member,
        EntityKind::Service,
        EntityKind::Network,
        EntityKind::AnyMember,
        EntityKind::Anonymous,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EntityKind::Member => "member",
            EntityKind::Service => "service",
            EntityKind::Network => "network",
            EntityKind::AnyMember => "any_member",
            EntityKind::Anonymous => "anonymous",
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntityKind {
    type Err = ();
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        EntityKind::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or(())
    }
}

/// Operation a caller wants to perform on a data class
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    Read,
    Update,
    Delete,
    Append,
    Persist,
    Search,
}

impl Action {
    pub const ALL: [Action; 6] = [
        Action::Read,
        Action::Update,
        Action::Delete,
        Action::Append,
        Action::Persist,
        Action::Search,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Action::Read => "read",
            Action::Update => "update",
            Action::Delete => "delete",
            Action::Append => "append",
            Action::Persist => "persist",
            Action::Search => "search",
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Action {
    type Err = ();
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Action::ALL
            .into_iter()
            .find(|action| action.as_str() == s)
            .ok_or(())
    }
}

/// One declarative access-control entry, exactly as written in the contract
///
/// Entity and action names stay strings until compilation so that a typo is reported
/// as a configuration error naming the class, not as an opaque parse failure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccessControlEntry {
    pub entity: String,
    #[serde(default)]
    pub actions: Vec<String>,
    /// Caching hint in seconds, returned with permitted reads
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache: Option<u64>,
    /// Maximum graph distance, `network` entries only
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub distance: Option<i64>,
    /// Pattern over relation labels, `network` entries only
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub relation: Option<String>,
}

impl AccessControlEntry {
    pub fn new(entity: EntityKind, actions: &[Action]) -> Self {
        Self {
            entity: entity.as_str().to_string(),
            actions: actions.iter().map(|a| a.as_str().to_string()).collect(),
            cache: None,
            distance: None,
            relation: None,
        }
    }

    pub fn with_cache(mut self, seconds: u64) -> Self {
        self.cache = Some(seconds);
        self
    }

    pub fn with_distance(mut self, distance: i64) -> Self {
        self.distance = Some(distance);
        self
    }

    pub fn with_relation(mut self, pattern: impl Into<String>) -> Self {
        self.relation = Some(pattern.into());
        self
    }
}
