use std::collections::{HashSet, VecDeque};
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use parking_lot::Mutex;
use uuid::Uuid;

use super::{Operation, RequestEnvelope, RequestError};

/// Reads may reach a pod once per depth along different paths, writes only once
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct SeenKey {
    query_id: Uuid,
    depth: Option<u32>,
}

impl SeenKey {
    fn of(envelope: &RequestEnvelope) -> Self {
        let depth = match envelope.operation {
            Operation::Query | Operation::Search => Some(envelope.depth),
            _ => None,
        };
        Self {
            query_id: envelope.query_id,
            depth,
        }
    }
}

#[derive(Debug, Default)]
struct Seen {
    keys: HashSet<SeenKey>,
    /// Keys in admission order, with the time each can be forgotten
    order: VecDeque<(DateTime<Utc>, SeenKey)>,
}

impl Seen {
    fn prune(&mut self, now: DateTime<Utc>, capacity: usize) {
        while let Some((forget_at, key)) = self.order.front().copied() {
            let expired = forget_at <= now;
            if !expired && self.order.len() < capacity {
                break;
            }
            if !expired {
                tracing::warn!(
                    "replay cache is full, forgetting query {} early",
                    key.query_id
                );
            }
            self.order.pop_front();
            self.keys.remove(&key);
        }
    }
}

/// Admits each signed request once
///
/// A signed envelope must carry a timestamp within `window` of the local clock and a
/// depth no larger than the depth its origin signed. Its query id is remembered until
/// the timestamp leaves the window, after which the envelope is refused as stale anyway.
#[derive(Debug)]
pub struct ReplayGuard {
    window: TimeDelta,
    capacity: usize,
    seen: Mutex<Seen>,
}

impl ReplayGuard {
    pub fn new(window: Duration, capacity: usize) -> Self {
        Self {
            window: TimeDelta::from_std(window).unwrap_or(TimeDelta::MAX),
            capacity,
            seen: Mutex::new(Seen::default()),
        }
    }

    pub fn admit(&self, envelope: &RequestEnvelope, now: DateTime<Utc>) -> Result<(), RequestError> {
        if envelope.depth > envelope.max_depth {
            return Err(RequestError::DepthExceedsSigned {
                depth: envelope.depth,
                max_depth: envelope.max_depth,
            });
        }

        let age = now.signed_duration_since(envelope.timestamp);
        if age > self.window || age < -self.window {
            return Err(RequestError::Stale {
                query_id: envelope.query_id,
                timestamp: envelope.timestamp,
            });
        }

        let key = SeenKey::of(envelope);
        let forget_at = envelope
            .timestamp
            .checked_add_signed(self.window)
            .unwrap_or(DateTime::<Utc>::MAX_UTC);

        let mut seen = self.seen.lock();
        seen.prune(now, self.capacity);
        if !seen.keys.insert(key) {
            return Err(RequestError::Replayed {
                query_id: envelope.query_id,
                depth: envelope.depth,
            });
        }
        seen.order.push_back((forget_at, key));
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.seen.lock().order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
