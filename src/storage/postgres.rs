use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::postgres::PgPoolOptions;
use sqlx::{Pool, Postgres, QueryBuilder};
use tracing::debug;

use super::{bucket_size, StoredEntry, TableRegistry};
use crate::error::MonitorError;
use crate::ident;

/// Relational store. One table per logical name with a native timestamptz
/// column and the record as jsonb. Where TimescaleDB is installed the table
/// is upgraded to a hypertable; absence of the extension is not an error.
pub struct PgStore {
    pool: Pool<Postgres>,
    registry: TableRegistry,
}

impl PgStore {
    pub async fn connect(url: &str) -> Result<Self, MonitorError> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .acquire_timeout(std::time::Duration::from_secs(5))
            .connect(url)
            .await
            .map_err(MonitorError::from)?;

        let store = Self {
            pool,
            registry: TableRegistry::default(),
        };
        store.load_existing_tables().await?;
        Ok(store)
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }

    async fn load_existing_tables(&self) -> Result<(), MonitorError> {
        let names: Vec<(String,)> = sqlx::query_as(
            "SELECT table_name FROM information_schema.tables \
             WHERE table_schema = 'public' AND table_type = 'BASE TABLE'",
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
        let found: Option<(i32,)> = sqlx::query_as(
            "SELECT 1 FROM information_schema.tables \
             WHERE table_schema = 'public' AND table_name = $1",
        )
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
                 id BIGINT GENERATED ALWAYS AS IDENTITY PRIMARY KEY, \
                 timestamp TIMESTAMPTZ NOT NULL, \
                 data JSONB NOT NULL \
             )"
        ))
        .execute(&self.pool)
        .await?;

        let index = ident::quote_ident(&format!("idx_{table}_timestamp"));
        sqlx::query(&format!(
            "CREATE INDEX IF NOT EXISTS {index} ON {quoted} (timestamp DESC)"
        ))
        .execute(&self.pool)
        .await?;

        // Best-effort hypertable upgrade; a plain table works the same.
        if let Err(e) = sqlx::query(
            "SELECT create_hypertable($1::regclass, 'timestamp', \
             if_not_exists => TRUE, migrate_data => TRUE)",
        )
        .bind(&table)
        .execute(&self.pool)
        .await
        {
            debug!(table = %table, error = %e, "Hypertable conversion unavailable");
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
            "INSERT INTO {quoted} (timestamp, data) VALUES ($1, $2)"
        ))
        .bind(entry.timestamp)
        .bind(&entry.data)
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

        let mut builder: QueryBuilder<Postgres> =
            QueryBuilder::new(format!("SELECT timestamp, data FROM {quoted}"));
        push_bounds(&mut builder, from, to);
        builder.push(" ORDER BY timestamp DESC, id DESC");

        let rows: Vec<(DateTime<Utc>, Value)> =
            builder.build_query_as().fetch_all(&self.pool).await?;
        Ok(rows
            .into_iter()
            .map(|(timestamp, data)| StoredEntry { timestamp, data })
            .collect())
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

        let mut builder: QueryBuilder<Postgres> =
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

        let mut builder: QueryBuilder<Postgres> = QueryBuilder::new(format!(
            "SELECT timestamp, data FROM ( \
                 SELECT id, timestamp, data, \
                        ROW_NUMBER() OVER (ORDER BY timestamp DESC, id DESC) - 1 AS rn \
                 FROM {quoted}"
        ));
        push_bounds(&mut builder, from, to);
        builder.push(" ) ranked WHERE rn % ");
        builder.push_bind(bucket);
        builder.push(" = 0 ORDER BY rn LIMIT ");
        builder.push_bind(max_points.max(1) as i64);

        let rows: Vec<(DateTime<Utc>, Value)> =
            builder.build_query_as().fetch_all(&self.pool).await?;
        Ok(rows
            .into_iter()
            .map(|(timestamp, data)| StoredEntry { timestamp, data })
            .collect())
    }

    pub async fn sweep(&self, cutoff: DateTime<Utc>) -> Result<Vec<(String, u64)>, MonitorError> {
        let mut removed = Vec::new();
        for table in self.registry.snapshot() {
            let quoted = ident::quote_ident(&table);
            let result = sqlx::query(&format!("DELETE FROM {quoted} WHERE timestamp < $1"))
                .bind(cutoff)
                .execute(&self.pool)
                .await?;
            removed.push((table, result.rows_affected()));
        }
        Ok(removed)
    }
}

fn push_bounds(
    builder: &mut QueryBuilder<'_, Postgres>,
    from: Option<DateTime<Utc>>,
    to: Option<DateTime<Utc>>,
) {
    let mut prefix = " WHERE ";
    if let Some(from) = from {
        builder.push(prefix);
        builder.push("timestamp >= ");
        builder.push_bind(from);
        prefix = " AND ";
    }
    if let Some(to) = to {
        builder.push(prefix);
        builder.push("timestamp <= ");
        builder.push_bind(to);
    }
}
