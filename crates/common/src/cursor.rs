//! Pagination cursors
//!
//! A cursor names a storage position, not an entry. Resuming scans forward from that
//! position and skips whatever no longer exists or has expired, so a cursor stays
//! usable when the entry it was minted from is gone.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::store::{Entry, Filter, StorageProvider, StoreError, SCAN_BATCH};

#[derive(thiserror::Error, Debug)]
pub enum CursorError {
    #[error("cursor is not valid base64: {0}")]
    Encoding(#[from] base64::DecodeError),
    #[error("malformed cursor: {0}")]
    Malformed(#[from] bincode::Error),
    #[error("cursor was minted for class {found}, not {expected}")]
    WrongClass { expected: String, found: String },
    #[error("cursor was minted for version {found}, not {expected}")]
    WrongVersion { expected: u32, found: u32 },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cursor {
    pub position: u64,
    pub class: String,
    pub version: u32,
}

impl Cursor {
    pub fn new(position: u64, class: impl Into<String>, version: u32) -> Self {
        Self {
            position,
            class: class.into(),
            version,
        }
    }

    pub fn encode(&self) -> Result<String, CursorError> {
        let bytes = bincode::serialize(&(self.position, &self.class, self.version))?;
        Ok(URL_SAFE_NO_PAD.encode(bytes))
    }

    pub fn decode(token: &str) -> Result<Self, CursorError> {
        let bytes = URL_SAFE_NO_PAD.decode(token)?;
        let (position, class, version): (u64, String, u32) = bincode::deserialize(&bytes)?;
        Ok(Self {
            position,
            class,
            version,
        })
    }

    /// Decode a cursor and check it belongs to `class` at `version`
    pub fn decode_for(token: &str, class: &str, version: u32) -> Result<Self, CursorError> {
        let cursor = Self::decode(token)?;
        if cursor.class != class {
            return Err(CursorError::WrongClass {
                expected: class.to_string(),
                found: cursor.class,
            });
        }
        if cursor.version != version {
            return Err(CursorError::WrongVersion {
                expected: version,
                found: cursor.version,
            });
        }
        Ok(cursor)
    }
}

/// One page of live, matching entries
#[derive(Debug, Clone, Default)]
pub struct Page {
    pub entries: Vec<Entry>,
    pub has_next_page: bool,
}

impl Page {
    pub fn end_position(&self) -> Option<u64> {
        self.entries.last().map(|e| e.position)
    }
}

/// Collect up to `first` live entries matching `filter` with a position after `after`
///
/// Scanning continues one match past the page to decide `has_next_page`.
pub async fn scan_page<S: StorageProvider>(
    store: &S,
    class: &str,
    filter: &Filter,
    after: Option<u64>,
    first: usize,
    now: DateTime<Utc>,
) -> Result<Page, StoreError<S::Error>> {
    let mut entries = Vec::with_capacity(first);
    let mut position = after;
    let batch_size = SCAN_BATCH.max(first + 1);

    loop {
        let batch = store.scan(class, position, batch_size).await?;
        let Some(last) = batch.last() else {
            return Ok(Page {
                entries,
                has_next_page: false,
            });
        };
        position = Some(last.position);

        for entry in batch {
            if !entry.is_live(now) || !filter.matches(&entry.data) {
                continue;
            }
            if entries.len() == first {
                return Ok(Page {
                    entries,
                    has_next_page: true,
                });
            }
            entries.push(entry);
        }
    }
}
