//! Storage collaborator interface
//!
//! The engine never owns storage. It talks to whatever backs a pod through
//! [`StorageProvider`]: object reads and writes, an ordered scan over array entries
//! keyed by a monotonic position, filtered updates and deletes, and a snapshot of the
//! `network_links` class for the distance evaluator.
//!
//! Entries of array classes may carry an expiry time. Providers are free to keep
//! expired entries around until [`StorageProvider::purge_expired`] runs, so scans can
//! and do return dead entries; skipping them is the cursor scanner's job.

mod filter;
mod memory;

use std::fmt::{Debug, Display};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::contract::NETWORK_LINKS_CLASS;
use crate::crypto::PublicKey;
use crate::network::NetworkLink;

pub use filter::{Filter, MatchMode};
pub use memory::{MemoryStore, MemoryStoreError};

/// A schema-described record: attribute name to JSON value
pub type Record = serde_json::Map<String, serde_json::Value>;

/// Entries fetched per round trip by provided scan helpers
pub const SCAN_BATCH: usize = 64;

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError<T> {
    #[error("unhandled storage provider error: {0}")]
    Provider(#[from] T),
    #[error("entry not found in class {0}")]
    NotFound(String),
    /// A write collides with existing state, such as a duplicate primary key
    #[error("conflict in class {0}")]
    Conflict(String),
}

/// One stored entry of an array class
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entry {
    /// Monotonic storage position, unique across the whole store
    pub position: u64,
    pub id: Uuid,
    pub data: Record,
    pub created_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
}

impl Entry {
    pub fn is_live(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.map(|at| at > now).unwrap_or(true)
    }
}

#[async_trait]
pub trait StorageProvider: Send + Sync + Debug + Clone + 'static {
    type Error: Display + Debug + Send + Sync;

    /// Read the single entity of an object class
    async fn get_object(&self, class: &str) -> Result<Option<Record>, StoreError<Self::Error>>;

    /// Replace the single entity of an object class
    async fn put_object(&self, class: &str, data: Record) -> Result<(), StoreError<Self::Error>>;

    /// Merge `patch` into the single entity of an object class, creating it if absent,
    ///  and return the result. Concurrent merges must not lose each other's fields.
    async fn merge_object(
        &self,
        class: &str,
        patch: Record,
    ) -> Result<Record, StoreError<Self::Error>>;

    /// Append an entry to an array class, assigning it the next position
    async fn insert(
        &self,
        class: &str,
        data: Record,
        expires_at: Option<DateTime<Utc>>,
    ) -> Result<Entry, StoreError<Self::Error>>;

    /// Append an entry unless a live entry already holds the same value under `key`
    ///
    /// The check and the write are one atomic step; a collision fails with
    ///  [`StoreError::Conflict`].
    async fn insert_unique(
        &self,
        class: &str,
        data: Record,
        key: &str,
        expires_at: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> Result<Entry, StoreError<Self::Error>>;

    /// Return up to `limit` entries with a position strictly greater than `after`,
    ///  in ascending position order. Expired entries may be included.
    async fn scan(
        &self,
        class: &str,
        after: Option<u64>,
        limit: usize,
    ) -> Result<Vec<Entry>, StoreError<Self::Error>>;

    /// Merge `patch` into every live entry matching `filter`
    async fn update(
        &self,
        class: &str,
        filter: &Filter,
        patch: &Record,
        now: DateTime<Utc>,
    ) -> Result<u64, StoreError<Self::Error>>;

    /// Remove every live entry matching `filter`
    async fn delete(
        &self,
        class: &str,
        filter: &Filter,
        now: DateTime<Utc>,
    ) -> Result<u64, StoreError<Self::Error>>;

    /// Physically remove expired entries
    async fn purge_expired(
        &self,
        class: &str,
        now: DateTime<Utc>,
    ) -> Result<u64, StoreError<Self::Error>>;

    /// Count live entries matching `filter`
    async fn count(
        &self,
        class: &str,
        filter: &Filter,
        now: DateTime<Utc>,
    ) -> Result<u64, StoreError<Self::Error>> {
        let mut count = 0;
        let mut after = None;
        loop {
            let batch = self.scan(class, after, SCAN_BATCH).await?;
            let Some(last) = batch.last() else {
                return Ok(count);
            };
            after = Some(last.position);
            count += batch
                .iter()
                .filter(|e| e.is_live(now) && filter.matches(&e.data))
                .count() as u64;
        }
    }

    /// Find the first live entry matching `filter`
    async fn find(
        &self,
        class: &str,
        filter: &Filter,
        now: DateTime<Utc>,
    ) -> Result<Option<Entry>, StoreError<Self::Error>> {
        let mut after = None;
        loop {
            let batch = self.scan(class, after, SCAN_BATCH).await?;
            let Some(last) = batch.last() else {
                return Ok(None);
            };
            after = Some(last.position);
            if let Some(found) = batch
                .into_iter()
                .find(|e| e.is_live(now) && filter.matches(&e.data))
            {
                return Ok(Some(found));
            }
        }
    }

    /// Snapshot of the pod's network link edges
    ///
    /// Providers should read the whole class under one read isolation. The provided
    ///  version pages through [`scan`](Self::scan) and only suits stores whose scans
    ///  cannot interleave with writes.
    async fn network_links(
        &self,
        owner: &PublicKey,
        now: DateTime<Utc>,
    ) -> Result<Vec<NetworkLink>, StoreError<Self::Error>> {
        let mut entries = Vec::new();
        let mut after = None;
        loop {
            let batch = self.scan(NETWORK_LINKS_CLASS, after, SCAN_BATCH).await?;
            let Some(last) = batch.last() else {
                return Ok(collect_links(owner, &entries, now));
            };
            after = Some(last.position);
            entries.extend(batch);
        }
    }
}

/// Turn stored `network_links` entries into link edges
///
/// Rows that do not describe a valid link are skipped; a missing edge can only shrink
/// the network, never widen it.
pub fn collect_links<'a>(
    owner: &PublicKey,
    entries: impl IntoIterator<Item = &'a Entry>,
    now: DateTime<Utc>,
) -> Vec<NetworkLink> {
    entries
        .into_iter()
        .filter(|entry| entry.is_live(now))
        .filter_map(|entry| {
            let link = NetworkLink::from_entry(owner, entry);
            if link.is_none() {
                tracing::warn!(
                    "skipping malformed network link at position {}",
                    entry.position
                );
            }
            link
        })
        .collect()
}
