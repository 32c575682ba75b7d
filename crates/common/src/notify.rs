//! Live counters and change subscriptions
//!
//! Subscriptions live only as long as their receiver. Nothing here is persisted, and a
//! dropped receiver is pruned the next time something is pushed to it.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::store::{Filter, Record, StorageProvider, StoreError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    Appended,
    Updated,
    Deleted,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub kind: ChangeKind,
    pub class: String,
    pub entry_id: Uuid,
}

/// A changed entry as seen by change subscribers
#[derive(Debug, Clone)]
pub struct Change<'a> {
    pub kind: ChangeKind,
    pub entry_id: Uuid,
    pub data: &'a Record,
}

#[derive(Debug)]
struct CounterSubscription {
    class: String,
    filter: Filter,
    last: u64,
    sender: flume::Sender<u64>,
}

#[derive(Debug)]
struct ChangeSubscription {
    class: String,
    filter: Filter,
    sender: flume::Sender<ChangeEvent>,
}

#[derive(Debug, Default)]
struct NotifierInner {
    counters: Vec<CounterSubscription>,
    changes: Vec<ChangeSubscription>,
}

#[derive(Debug, Default)]
pub struct Notifier {
    inner: Mutex<NotifierInner>,
}

impl Notifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe to the live count of `class` entries matching `filter`
    ///
    /// `current` is delivered right away; afterwards only changed counts are sent.
    pub fn subscribe_counter(
        &self,
        class: &str,
        filter: Filter,
        current: u64,
    ) -> flume::Receiver<u64> {
        let (sender, receiver) = flume::unbounded();
        // the receiver is held right here, so this send cannot fail
        let _ = sender.send(current);
        self.inner.lock().counters.push(CounterSubscription {
            class: class.to_string(),
            filter,
            last: current,
            sender,
        });
        receiver
    }

    /// Subscribe to change events on `class` entries matching `filter`
    pub fn subscribe_changes(&self, class: &str, filter: Filter) -> flume::Receiver<ChangeEvent> {
        let (sender, receiver) = flume::unbounded();
        self.inner.lock().changes.push(ChangeSubscription {
            class: class.to_string(),
            filter,
            sender,
        });
        receiver
    }

    /// Whether anyone wants per-entry change events for `class`
    pub fn has_change_subscribers(&self, class: &str) -> bool {
        self.inner.lock().changes.iter().any(|s| s.class == class)
    }

    pub fn subscriber_count(&self) -> usize {
        let inner = self.inner.lock();
        inner.counters.len() + inner.changes.len()
    }

    /// Push change events for entries written to `class`
    pub fn publish_changes(&self, class: &str, changes: &[Change<'_>]) {
        if changes.is_empty() {
            return;
        }
        let mut inner = self.inner.lock();
        inner.changes.retain(|subscription| {
            if subscription.class != class {
                return !subscription.sender.is_disconnected();
            }
            changes
                .iter()
                .filter(|change| subscription.filter.matches(change.data))
                .all(|change| {
                    subscription
                        .sender
                        .send(ChangeEvent {
                            kind: change.kind,
                            class: class.to_string(),
                            entry_id: change.entry_id,
                        })
                        .is_ok()
                })
                && !subscription.sender.is_disconnected()
        });
    }

    /// Recount every counter subscribed to `class` and push the ones that moved
    pub async fn refresh_counters<S: StorageProvider>(
        &self,
        store: &S,
        class: &str,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError<S::Error>> {
        let mut filters: Vec<Filter> = Vec::new();
        {
            let mut inner = self.inner.lock();
            inner.counters.retain(|s| !s.sender.is_disconnected());
            for subscription in inner.counters.iter().filter(|s| s.class == class) {
                if !filters.contains(&subscription.filter) {
                    filters.push(subscription.filter.clone());
                }
            }
        }
        if filters.is_empty() {
            return Ok(());
        }

        let mut counts = Vec::with_capacity(filters.len());
        for filter in filters {
            let count = store.count(class, &filter, now).await?;
            counts.push((filter, count));
        }

        let mut inner = self.inner.lock();
        inner.counters.retain_mut(|subscription| {
            if subscription.class != class {
                return true;
            }
            let Some((_, count)) = counts.iter().find(|(f, _)| *f == subscription.filter) else {
                return true;
            };
            if *count == subscription.last {
                return true;
            }
            subscription.last = *count;
            subscription.sender.send(*count).is_ok()
        });
        Ok(())
    }
}
