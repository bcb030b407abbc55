use std::str::FromStr;

use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Pool, QueryBuilder, Sqlite};

use super::{bucket_size, StoredEntry, TableRegistry};
use crate::clock;
use crate::error::MonitorError;
use crate::ident;

/// Embedded single-file store. One table per logical name with a TEXT
/// timestamp in the canonical DB form, whose lexicographic order matches
/// chronological order. Concurrent writers serialize on sqlite's own lock;
/// the busy timeout absorbs short contention.
pub struct SqliteStore {
    pool: Pool<Sqlite>,
    registry: TableRegistry,
}

impl SqliteStore {
    pub async fn connect(url: &str) -> Result<Self, MonitorError> {
        let options = SqliteConnectOptions::from_str(url)
            .map_err(|e| MonitorError::config(format!("invalid sqlite URL {url:?}: {e}")))?
            .create_if_missing(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .busy_timeout(std::time::Duration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await
            .map_err(MonitorError::from)?;

        let store = Self {
            pool,
            registry: TableRegistry::default(),
        };
        store.load_existing_tables().await?;
        Ok(store)
    }

    /// In-memory database for tests. A single connection is critical:
    /// separate connections to `:memory:` get separate databases.
    #[cfg(test)]
    pub async fn test_db() -> Self {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")
            .expect("valid memory URL")
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal);

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await
            .expect("connect to in-memory sqlite");

        Self {
            pool,
            registry: TableRegistry::default(),
        }
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }

    /// Seed the registry with tables from a previous run so sweeps cover
    /// them immediately.
    async fn load_existing_tables(&self) -> Result<(), MonitorError> {
        let names: Vec<(String,)> = sqlx::query_as(
            "SELECT name FROM sqlite_master WHERE type = 'table' AND name NOT LIKE 'sqlite_%'",
        )
        .fetch_all(&self.pool)
        .await?;
        for (name,) in names {
            self.registry.insert(&name);
        }
        Ok(())
    }

    async fn table_exists(&self, table: &str) -> Result<bool, MonitorError> {
        if self.registry.contains(table) {
            return Ok(true);
        }
        let found: Option<(i64,)> =
            sqlx::query_as("SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?")
                .bind(table)
                .fetch_optional(&self.pool)
                .await?;
        if found.is_some() {
            self.registry.insert(table);
            return Ok(true);
        }
        Ok(false)
    }

    pub async fn ensure_table(&self, name: &str) -> Result<(), MonitorError> {
        let table = ident::sanitize(name)?;
        let quoted = ident::quote_ident(&table);

        sqlx::query(&format!(
            "CREATE TABLE IF NOT EXISTS {quoted} ( \
                 id INTEGER PRIMARY KEY AUTOINCREMENT, \
                 timestamp TEXT NOT NULL, \
                 data TEXT NOT NULL, \
                 created_at TEXT NOT NULL DEFAULT (datetime('now')) \
             )"
        ))
        .execute(&self.pool)
        .await?;

        for (suffix, column) in [("timestamp", "timestamp"), ("created_at", "created_at")] {
            let index = ident::quote_ident(&format!("idx_{table}_{suffix}"));
            sqlx::query(&format!(
                "CREATE INDEX IF NOT EXISTS {index} ON {quoted} ({column})"
            ))
            .execute(&self.pool)
            .await?;
        }

        self.registry.insert(&table);
        Ok(())
    }

    pub async fn write(&self, name: &str, entry: &StoredEntry) -> Result<(), MonitorError> {
        let table = ident::sanitize(name)?;
        if !self.registry.contains(&table) {
            self.ensure_table(&table).await?;
        }
        let quoted = ident::quote_ident(&table);

        sqlx::query(&format!(
            "INSERT INTO {quoted} (timestamp, data) VALUES (?, ?)"
        ))
        .bind(clock::format_db(entry.timestamp))
        .bind(entry.data.to_string())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn query(
        &self,
        name: &str,
        from: Option<DateTime<Utc>>,
        to: Option<DateTime<Utc>>,
    ) -> Result<Vec<StoredEntry>, MonitorError> {
        let table = ident::sanitize(name)?;
        if !self.table_exists(&table).await? {
            return Ok(vec![]);
        }
        let quoted = ident::quote_ident(&table);

        let mut builder: QueryBuilder<Sqlite> =
            QueryBuilder::new(format!("SELECT timestamp, data FROM {quoted}"));
        push_bounds(&mut builder, from, to);
        builder.push(" ORDER BY timestamp DESC, id DESC");

        let rows: Vec<(String, String)> =
            builder.build_query_as().fetch_all(&self.pool).await?;
        rows.into_iter().map(decode_row).collect()
    }

    pub async fn count(
        &self,
        name: &str,
        from: Option<DateTime<Utc>>,
        to: Option<DateTime<Utc>>,
    ) -> Result<u64, MonitorError> {
        let table = ident::sanitize(name)?;
        if !self.table_exists(&table).await? {
            return Ok(0);
        }
        let quoted = ident::quote_ident(&table);

        let mut builder: QueryBuilder<Sqlite> =
            QueryBuilder::new(format!("SELECT COUNT(*) FROM {quoted}"));
        push_bounds(&mut builder, from, to);

        let count: i64 = builder.build_query_scalar().fetch_one(&self.pool).await?;
        Ok(count as u64)
    }

    pub async fn query_bucketed(
        &self,
        name: &str,
        from: Option<DateTime<Utc>>,
        to: Option<DateTime<Utc>>,
        max_points: usize,
    ) -> Result<Vec<StoredEntry>, MonitorError> {
        let table = ident::sanitize(name)?;
        if !self.table_exists(&table).await? {
            return Ok(vec![]);
        }
        let count = self.count(&table, from, to).await?;
        if count == 0 {
            return Ok(vec![]);
        }
        let bucket = bucket_size(count, max_points) as i64;
        let quoted = ident::quote_ident(&table);

        // Rank rows newest-first, keep the first row of each rank bucket.
        let mut builder: QueryBuilder<Sqlite> = QueryBuilder::new(format!(
            "SELECT timestamp, data FROM ( \
                 SELECT id, timestamp, data, \
                        ROW_NUMBER() OVER (ORDER BY timestamp DESC, id DESC) - 1 AS rn \
                 FROM {quoted}"
        ));
        push_bounds(&mut builder, from, to);
        builder.push(" ) WHERE rn % ");
        builder.push_bind(bucket);
        builder.push(" = 0 ORDER BY rn LIMIT ");
        builder.push_bind(max_points.max(1) as i64);

        let rows: Vec<(String, String)> =
            builder.build_query_as().fetch_all(&self.pool).await?;
        rows.into_iter().map(decode_row).collect()
    }

    pub async fn sweep(&self, cutoff: DateTime<Utc>) -> Result<Vec<(String, u64)>, MonitorError> {
        let cutoff_text = clock::format_db(cutoff);
        let mut removed = Vec::new();
        for table in self.registry.snapshot() {
            let quoted = ident::quote_ident(&table);
            let result = sqlx::query(&format!("DELETE FROM {quoted} WHERE timestamp < ?"))
                .bind(&cutoff_text)
                .execute(&self.pool)
                .await?;
            removed.push((table, result.rows_affected()));
        }
        Ok(removed)
    }
}

fn push_bounds(
    builder: &mut QueryBuilder<'_, Sqlite>,
    from: Option<DateTime<Utc>>,
    to: Option<DateTime<Utc>>,
) {
    let mut prefix = " WHERE ";
    if let Some(from) = from {
        builder.push(prefix);
        builder.push("timestamp >= ");
        builder.push_bind(clock::format_db(from));
        prefix = " AND ";
    }
    if let Some(to) = to {
        builder.push(prefix);
        builder.push("timestamp <= ");
        builder.push_bind(clock::format_db(to));
    }
}

fn decode_row((timestamp, data): (String, String)) -> Result<StoredEntry, MonitorError> {
    Ok(StoredEntry {
        timestamp: clock::parse(&timestamp)?,
        data: serde_json::from_str(&data)
            .map_err(|e| MonitorError::Permanent(format!("corrupt stored document: {e}")))?,
    })
}
