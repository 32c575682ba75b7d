use std::fmt;

use serde::{Deserialize, Serialize};

use crate::identity::Credential;
use crate::query::{Connection, DispatchError, Outcome, RequestEnvelope};

/// Everything one pod sends another
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Message {
    /// Run a request. `credential` is the sender's own membership credential; the
    ///  envelope's origin, when present, says on whose behalf.
    Request {
        credential: Option<Credential>,
        envelope: RequestEnvelope,
    },
}

/// The answer to a [`Message::Request`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Reply {
    Connection(Connection),
    Affected(u64),
    /// The receiving pod's policy denied the request
    Denied(String),
    /// The request was malformed
    Invalid(String),
    /// The receiving pod failed to answer
    Failed(String),
}

impl From<Result<Outcome, DispatchError>> for Reply {
    fn from(result: Result<Outcome, DispatchError>) -> Self {
        match result {
            Ok(Outcome::Connection(connection)) => Reply::Connection(connection),
            Ok(Outcome::Affected(count)) => Reply::Affected(count),
            Err(e @ DispatchError::Denied { .. }) => Reply::Denied(e.to_string()),
            Err(
                e @ (DispatchError::Request(_)
                | DispatchError::UnknownService(_)
                | DispatchError::UnknownClass { .. }),
            ) => Reply::Invalid(e.to_string()),
            Err(
                e @ (DispatchError::Storage(_)
                | DispatchError::Cursor(_)
                | DispatchError::Remote { .. }),
            ) => Reply::Failed(e.to_string()),
        }
    }
}

impl fmt::Display for Reply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Reply::Connection(connection) => {
                write!(f, "connection of {} edges", connection.edges.len())
            }
            Reply::Affected(count) => write!(f, "{} affected", count),
            Reply::Denied(reason) => write!(f, "denied: {}", reason),
            Reply::Invalid(reason) => write!(f, "invalid: {}", reason),
            Reply::Failed(reason) => write!(f, "failed: {}", reason),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::contract::{Action, EntityKind};
    use crate::query::RequestError;

    #[test]
    fn test_reply_from_result() {
        assert_eq!(Reply::from(Ok(Outcome::Affected(2))), Reply::Affected(2));

        let denied = Reply::from(Err(DispatchError::Denied {
            entity: EntityKind::Anonymous,
            action: Action::Read,
            class: "posts".to_string(),
        }));
        assert_eq!(
            denied,
            Reply::Denied("anonymous may not read posts".to_string())
        );

        let invalid = Reply::from(Err(RequestError::NoForwardingBudget.into()));
        assert!(matches!(invalid, Reply::Invalid(_)));

        let failed = Reply::from(Err(DispatchError::Storage("disk".to_string())));
        assert!(matches!(failed, Reply::Failed(_)));
    }
}
