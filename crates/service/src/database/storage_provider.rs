use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::Row;
use uuid::Uuid;

use common::contract::NETWORK_LINKS_CLASS;
use common::crypto::PublicKey;
use common::network::NetworkLink;
use common::store::{collect_links, Entry, Filter, Record, StorageProvider, StoreError};

use super::Database;

#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("sqlite error: {0}")]
    Sqlx(#[from] sqlx::Error),
    #[error("stored record is not valid json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("corrupt row at position {position}: {reason}")]
    Corrupt { position: i64, reason: String },
}

type Result<T> = std::result::Result<T, StoreError<DatabaseError>>;

fn provider<E: Into<DatabaseError>>(e: E) -> StoreError<DatabaseError> {
    StoreError::Provider(e.into())
}

fn millis(at: DateTime<Utc>) -> i64 {
    at.timestamp_millis()
}

fn entry_from_row(row: &SqliteRow) -> std::result::Result<Entry, DatabaseError> {
    let position: i64 = row.try_get("position")?;
    let corrupt = |reason: String| DatabaseError::Corrupt { position, reason };

    let id: String = row.try_get("id")?;
    let id = Uuid::parse_str(&id).map_err(|e| corrupt(e.to_string()))?;
    let data: String = row.try_get("data")?;
    let data: Record = serde_json::from_str(&data)?;
    let created_at: i64 = row.try_get("created_at")?;
    let created_at = DateTime::from_timestamp_millis(created_at)
        .ok_or_else(|| corrupt(format!("created_at {} out of range", created_at)))?;
    let expires_at: Option<i64> = row.try_get("expires_at")?;
    let expires_at = expires_at
        .map(|ms| {
            DateTime::from_timestamp_millis(ms)
                .ok_or_else(|| corrupt(format!("expires_at {} out of range", ms)))
        })
        .transpose()?;

    Ok(Entry {
        position: position as u64,
        id,
        data,
        created_at,
        expires_at,
    })
}

fn conflict_or_provider(class: &str, e: sqlx::Error) -> StoreError<DatabaseError> {
    match e {
        sqlx::Error::Database(ref db_error) if db_error.constraint().is_some() => {
            StoreError::Conflict(class.to_string())
        }
        _ => provider(e),
    }
}

impl Database {
    /// Live rows of `class` matching `filter`, as (position, record) pairs
    async fn matching(
        &self,
        class: &str,
        filter: &Filter,
        now: DateTime<Utc>,
    ) -> Result<Vec<(i64, Record)>> {
        let rows = sqlx::query(
            r#"
            SELECT position, data FROM entries
            WHERE class = ? AND (expires_at IS NULL OR expires_at > ?)
            ORDER BY position ASC
            "#,
        )
        .bind(class)
        .bind(millis(now))
        .fetch_all(&**self)
        .await
        .map_err(provider)?;

        let mut matching = Vec::new();
        for row in rows {
            let position: i64 = row.try_get("position").map_err(provider)?;
            let data: String = row.try_get("data").map_err(provider)?;
            let data: Record = serde_json::from_str(&data).map_err(provider)?;
            if filter.matches(&data) {
                matching.push((position, data));
            }
        }
        Ok(matching)
    }
}

#[async_trait]
impl StorageProvider for Database {
    type Error = DatabaseError;

    async fn get_object(&self, class: &str) -> Result<Option<Record>> {
        let row = sqlx::query(
            r#"
            SELECT data FROM objects WHERE class = ?
            "#,
        )
        .bind(class)
        .fetch_optional(&**self)
        .await
        .map_err(provider)?;

        match row {
            Some(row) => {
                let data: String = row.try_get("data").map_err(provider)?;
                Ok(Some(serde_json::from_str(&data).map_err(provider)?))
            }
            None => Ok(None),
        }
    }

    async fn put_object(&self, class: &str, data: Record) -> Result<()> {
        let data = serde_json::to_string(&data).map_err(provider)?;
        sqlx::query(
            r#"
            INSERT INTO objects (class, data, updated_at)
            VALUES (?, ?, ?)
            ON CONFLICT(class) DO UPDATE SET
                data = excluded.data,
                updated_at = excluded.updated_at,
                revision = objects.revision + 1
            "#,
        )
        .bind(class)
        .bind(data)
        .bind(millis(Utc::now()))
        .execute(&**self)
        .await
        .map_err(provider)?;
        Ok(())
    }

    async fn merge_object(&self, class: &str, patch: Record) -> Result<Record> {
        // compare-and-swap on the revision; a lost race re-reads and tries again
        loop {
            let row = sqlx::query(
                r#"
                SELECT data, revision FROM objects WHERE class = ?
                "#,
            )
            .bind(class)
            .fetch_optional(&**self)
            .await
            .map_err(provider)?;

            let (mut object, revision) = match row {
                Some(row) => {
                    let data: String = row.try_get("data").map_err(provider)?;
                    let revision: i64 = row.try_get("revision").map_err(provider)?;
                    let object: Record = serde_json::from_str(&data).map_err(provider)?;
                    (object, Some(revision))
                }
                None => (Record::new(), None),
            };
            object.extend(patch.clone());
            let encoded = serde_json::to_string(&object).map_err(provider)?;

            let written = match revision {
                Some(revision) => sqlx::query(
                    r#"
                    UPDATE objects SET data = ?, updated_at = ?, revision = revision + 1
                    WHERE class = ? AND revision = ?
                    "#,
                )
                .bind(encoded)
                .bind(millis(Utc::now()))
                .bind(class)
                .bind(revision),
                None => sqlx::query(
                    r#"
                    INSERT INTO objects (data, updated_at, class) VALUES (?, ?, ?)
                    ON CONFLICT(class) DO NOTHING
                    "#,
                )
                .bind(encoded)
                .bind(millis(Utc::now()))
                .bind(class),
            }
            .execute(&**self)
            .await
            .map_err(provider)?
            .rows_affected();

            if written == 1 {
                return Ok(object);
            }
            tracing::debug!("object {} changed during a merge, retrying", class);
        }
    }

    async fn insert(
        &self,
        class: &str,
        data: Record,
        expires_at: Option<DateTime<Utc>>,
    ) -> Result<Entry> {
        let id = Uuid::new_v4();
        let created_at = Utc::now();
        let encoded = serde_json::to_string(&data).map_err(provider)?;

        let result = sqlx::query(
            r#"
            INSERT INTO entries (id, class, data, created_at, expires_at)
            VALUES (?, ?, ?, ?, ?)
            "#,
        )
        .bind(id.to_string())
        .bind(class)
        .bind(encoded)
        .bind(millis(created_at))
        .bind(expires_at.map(millis))
        .execute(&**self)
        .await
        .map_err(|e| conflict_or_provider(class, e))?;

        Ok(Entry {
            position: result.last_insert_rowid() as u64,
            id,
            data,
            created_at,
            expires_at,
        })
    }

    async fn insert_unique(
        &self,
        class: &str,
        data: Record,
        key: &str,
        expires_at: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> Result<Entry> {
        let Some(value) = data.get(key) else {
            return self.insert(class, data, expires_at).await;
        };
        let value = serde_json::to_string(value).map_err(provider)?;
        let id = Uuid::new_v4();
        let created_at = Utc::now();
        let encoded = serde_json::to_string(&data).map_err(provider)?;

        // one statement, so the existence check and the insert cannot interleave
        let result = sqlx::query(
            r#"
            INSERT INTO entries (id, class, data, created_at, expires_at)
            SELECT ?, ?, ?, ?, ?
            WHERE NOT EXISTS (
                SELECT 1 FROM entries
                WHERE class = ?
                  AND (expires_at IS NULL OR expires_at > ?)
                  AND json_extract(data, ?) = json_extract(?, '$')
            )
            "#,
        )
        .bind(id.to_string())
        .bind(class)
        .bind(encoded)
        .bind(millis(created_at))
        .bind(expires_at.map(millis))
        .bind(class)
        .bind(millis(now))
        .bind(format!("$.\"{}\"", key))
        .bind(value)
        .execute(&**self)
        .await
        .map_err(|e| conflict_or_provider(class, e))?;

        if result.rows_affected() == 0 {
            return Err(StoreError::Conflict(class.to_string()));
        }
        Ok(Entry {
            position: result.last_insert_rowid() as u64,
            id,
            data,
            created_at,
            expires_at,
        })
    }

    async fn scan(&self, class: &str, after: Option<u64>, limit: usize) -> Result<Vec<Entry>> {
        let rows = sqlx::query(
            r#"
            SELECT position, id, data, created_at, expires_at FROM entries
            WHERE class = ? AND position > ?
            ORDER BY position ASC
            LIMIT ?
            "#,
        )
        .bind(class)
        .bind(after.map(|p| p as i64).unwrap_or(0))
        .bind(limit as i64)
        .fetch_all(&**self)
        .await
        .map_err(provider)?;

        rows.iter()
            .map(|row| entry_from_row(row).map_err(provider))
            .collect()
    }

    async fn update(
        &self,
        class: &str,
        filter: &Filter,
        patch: &Record,
        now: DateTime<Utc>,
    ) -> Result<u64> {
        let matching = self.matching(class, filter, now).await?;
        if matching.is_empty() {
            return Ok(0);
        }

        let mut tx = self.begin().await.map_err(provider)?;
        for (position, mut data) in matching.iter().cloned() {
            data.extend(patch.clone());
            let data = serde_json::to_string(&data).map_err(provider)?;
            sqlx::query(
                r#"
                UPDATE entries SET data = ? WHERE position = ?
                "#,
            )
            .bind(data)
            .bind(position)
            .execute(&mut *tx)
            .await
            .map_err(provider)?;
        }
        tx.commit().await.map_err(provider)?;
        Ok(matching.len() as u64)
    }

    async fn delete(&self, class: &str, filter: &Filter, now: DateTime<Utc>) -> Result<u64> {
        if filter.is_empty() {
            let result = sqlx::query(
                r#"
                DELETE FROM entries
                WHERE class = ? AND (expires_at IS NULL OR expires_at > ?)
                "#,
            )
            .bind(class)
            .bind(millis(now))
            .execute(&**self)
            .await
            .map_err(provider)?;
            return Ok(result.rows_affected());
        }

        let matching = self.matching(class, filter, now).await?;
        if matching.is_empty() {
            return Ok(0);
        }

        let mut tx = self.begin().await.map_err(provider)?;
        let mut affected = 0;
        for (position, _) in matching {
            let result = sqlx::query(
                r#"
                DELETE FROM entries WHERE position = ?
                "#,
            )
            .bind(position)
            .execute(&mut *tx)
            .await
            .map_err(provider)?;
            affected += result.rows_affected();
        }
        tx.commit().await.map_err(provider)?;
        Ok(affected)
    }

    async fn purge_expired(&self, class: &str, now: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query(
            r#"
            DELETE FROM entries
            WHERE class = ? AND expires_at IS NOT NULL AND expires_at <= ?
            "#,
        )
        .bind(class)
        .bind(millis(now))
        .execute(&**self)
        .await
        .map_err(provider)?;
        Ok(result.rows_affected())
    }

    async fn network_links(
        &self,
        owner: &PublicKey,
        now: DateTime<Utc>,
    ) -> Result<Vec<NetworkLink>> {
        let rows = sqlx::query(
            r#"
            SELECT position, id, data, created_at, expires_at FROM entries
            WHERE class = ?
            ORDER BY position ASC
            "#,
        )
        .bind(NETWORK_LINKS_CLASS)
        .fetch_all(&**self)
        .await
        .map_err(provider)?;

        let entries = rows
            .iter()
            .map(|row| entry_from_row(row).map_err(provider))
            .collect::<Result<Vec<_>>>()?;
        Ok(collect_links(owner, &entries, now))
    }

    async fn count(&self, class: &str, filter: &Filter, now: DateTime<Utc>) -> Result<u64> {
        if !filter.is_empty() {
            return Ok(self.matching(class, filter, now).await?.len() as u64);
        }
        let row = sqlx::query(
            r#"
            SELECT COUNT(*) as count FROM entries
            WHERE class = ? AND (expires_at IS NULL OR expires_at > ?)
            "#,
        )
        .bind(class)
        .bind(millis(now))
        .fetch_one(&**self)
        .await
        .map_err(provider)?;
        let count: i64 = row.try_get("count").map_err(provider)?;
        Ok(count as u64)
    }
}
