//! Persistence for timestamps and their payloads.

use accord_engine::{BinaryTimestamp, DecodeError, Entry, OwnerId};
use sqlx::sqlite::SqliteRow;
use sqlx::{QueryBuilder, Row, Sqlite, SqlitePool};

/// Timestamps looked up per `IN (...)` query.
const LOOKUP_CHUNK: usize = 500;

/// A row of the timestamp index.
#[derive(Debug)]
pub struct StoredTimestamp {
    pub owner_id: Vec<u8>,
    pub timestamp: Vec<u8>,
}

impl<'r> sqlx::FromRow<'r, SqliteRow> for StoredTimestamp {
    fn from_row(row: &'r SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(StoredTimestamp {
            owner_id: row.try_get("owner_id")?,
            timestamp: row.try_get("t")?,
        })
    }
}

impl StoredTimestamp {
    /// Convert the raw row into engine types.
    pub fn to_key(&self) -> Result<(OwnerId, BinaryTimestamp), DecodeError> {
        let owner = OwnerId::try_from(self.owner_id.as_slice())?;
        let timestamp = BinaryTimestamp::try_from(self.timestamp.as_slice())?;
        Ok((owner, timestamp))
    }
}

/// Load every stored timestamp, ordered by owner and time. Payloads stay in
/// the database.
pub async fn load_timestamps(pool: &SqlitePool) -> Result<Vec<StoredTimestamp>, sqlx::Error> {
    sqlx::query_as::<_, StoredTimestamp>(
        r#"
        SELECT "ownerId" AS owner_id, "t" AS t
        FROM accord_timestamp
        ORDER BY "ownerId", "t"
        "#,
    )
    .fetch_all(pool)
    .await
}

/// Fetch the payloads of `timestamps` for `owner`.
///
/// Timestamps without a payload row are left out of the result.
pub async fn load_payloads(
    pool: &SqlitePool,
    owner: &OwnerId,
    timestamps: &[BinaryTimestamp],
) -> Result<Vec<Entry>, sqlx::Error> {
    let mut entries = Vec::with_capacity(timestamps.len());

    for chunk in timestamps.chunks(LOOKUP_CHUNK) {
        let mut query = QueryBuilder::<Sqlite>::new(
            r#"SELECT "timestamp", "change" FROM accord_message WHERE "ownerId" = "#,
        );
        query.push_bind(owner.as_bytes().to_vec());
        query.push(r#" AND "timestamp" IN ("#);
        {
            let mut list = query.separated(", ");
            for timestamp in chunk {
                list.push_bind(timestamp.as_bytes().to_vec());
            }
            list.push_unseparated(")");
        }

        for row in query.build().fetch_all(pool).await? {
            let raw: Vec<u8> = row.try_get("timestamp")?;
            let timestamp = BinaryTimestamp::try_from(raw.as_slice())
                .map_err(|e| sqlx::Error::Decode(Box::new(e)))?;
            let change: Vec<u8> = row.try_get("change")?;
            entries.push(Entry::new(timestamp, change));
        }
    }

    tracing::trace!(
        %owner,
        wanted = timestamps.len(),
        found = entries.len(),
        "Loaded payloads"
    );

    Ok(entries)
}

/// Write a batch of entries in one transaction.
///
/// Rows already present are left untouched, so replaying a batch is
/// harmless. Either the whole batch is committed or nothing is.
pub async fn insert_entries(
    pool: &SqlitePool,
    entries: &[(OwnerId, Entry)],
) -> Result<(), sqlx::Error> {
    let mut tx = pool.begin().await?;

    for (owner, entry) in entries {
        sqlx::query(r#"INSERT OR IGNORE INTO accord_timestamp ("ownerId", "t") VALUES (?, ?)"#)
            .bind(owner.as_bytes().to_vec())
            .bind(entry.timestamp.as_bytes().to_vec())
            .execute(&mut *tx)
            .await?;

        sqlx::query(
            r#"INSERT OR IGNORE INTO accord_message ("ownerId", "timestamp", "change") VALUES (?, ?, ?)"#,
        )
        .bind(owner.as_bytes().to_vec())
        .bind(entry.timestamp.as_bytes().to_vec())
        .bind(entry.payload.clone())
        .execute(&mut *tx)
        .await?;
    }

    tx.commit().await?;

    tracing::debug!(count = entries.len(), "Persisted entries");

    Ok(())
}

/// Number of stored timestamps for `owner`.
pub async fn count_timestamps(pool: &SqlitePool, owner: &OwnerId) -> Result<i64, sqlx::Error> {
    let row = sqlx::query(r#"SELECT COUNT(*) AS count FROM accord_timestamp WHERE "ownerId" = ?"#)
        .bind(owner.as_bytes().to_vec())
        .fetch_one(pool)
        .await?;
    row.try_get("count")
}

/// Number of stored payloads for `owner`.
pub async fn count_payloads(pool: &SqlitePool, owner: &OwnerId) -> Result<i64, sqlx::Error> {
    let row = sqlx::query(r#"SELECT COUNT(*) AS count FROM accord_message WHERE "ownerId" = ?"#)
        .bind(owner.as_bytes().to_vec())
        .fetch_one(pool)
        .await?;
    row.try_get("count")
}
