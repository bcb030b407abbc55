pub mod file;
pub mod postgres;
pub mod sqlite;

use std::collections::HashSet;
use std::sync::RwLock;

use chrono::{DateTime, Utc};
use serde_json::Value;
use tracing::{error, info, warn};

use crate::config::AppConfig;
use crate::error::{with_retries, MonitorError};

pub use file::FileStore;
pub use postgres::PgStore;
pub use sqlite::SqliteStore;

/// Transient storage writes get this many extra attempts.
const WRITE_RETRIES: u32 = 2;

/// One persisted row: the instant plus the full record as a
/// self-describing JSON document.
#[derive(Debug, Clone)]
pub struct StoredEntry {
    pub timestamp: DateTime<Utc>,
    pub data: Value,
}

/// Process-local set of every table this backend has touched. Inserts on
/// first use, never deletes — tables may exist in storage without an
/// in-memory record, which is why sweeps also consult the backend itself
/// where that is cheap.
#[derive(Debug, Default)]
pub struct TableRegistry {
    tables: RwLock<HashSet<String>>,
}

impl TableRegistry {
    pub fn insert(&self, name: &str) {
        self.tables
            .write()
            .expect("table registry lock poisoned")
            .insert(name.to_string());
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tables
            .read()
            .expect("table registry lock poisoned")
            .contains(name)
    }

    /// Sorted snapshot so sweeps iterate in a stable order.
    pub fn snapshot(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .tables
            .read()
            .expect("table registry lock poisoned")
            .iter()
            .cloned()
            .collect();
        names.sort();
        names
    }
}

/// Number of rows per downsample bucket for a result set of `count` rows.
pub(crate) fn bucket_size(count: u64, max_points: usize) -> u64 {
    let max_points = max_points.max(1) as u64;
    count.div_ceil(max_points)
}

/// A configured write path. Enum dispatch keeps the three backends behind
/// one call surface without boxing.
pub enum Storage {
    File(FileStore),
    Sqlite(SqliteStore),
    Postgres(PgStore),
}

impl Storage {
    pub fn kind(&self) -> &'static str {
        match self {
            Storage::File(_) => "file",
            Storage::Sqlite(_) => "sqlite",
            Storage::Postgres(_) => "postgres",
        }
    }

    pub fn is_sql(&self) -> bool {
        matches!(self, Storage::Sqlite(_) | Storage::Postgres(_))
    }

    /// Idempotent table (or directory) creation, including indices.
    pub async fn ensure_table(&self, name: &str) -> Result<(), MonitorError> {
        match self {
            Storage::File(s) => s.ensure_table(name).await,
            Storage::Sqlite(s) => s.ensure_table(name).await,
            Storage::Postgres(s) => s.ensure_table(name).await,
        }
    }

    /// Append one entry.
    pub async fn write(&self, name: &str, entry: &StoredEntry) -> Result<(), MonitorError> {
        match self {
            Storage::File(s) => s.write(name, entry).await,
            Storage::Sqlite(s) => s.write(name, entry).await,
            Storage::Postgres(s) => s.write(name, entry).await,
        }
    }

    /// Entries in `timestamp DESC` order, inclusive bounds. An unknown
    /// table yields an empty sequence, not an error.
    pub async fn query(
        &self,
        name: &str,
        from: Option<DateTime<Utc>>,
        to: Option<DateTime<Utc>>,
    ) -> Result<Vec<StoredEntry>, MonitorError> {
        match self {
            Storage::File(s) => s.query(name, from, to).await,
            Storage::Sqlite(s) => s.query(name, from, to).await,
            Storage::Postgres(s) => s.query(name, from, to).await,
        }
    }

    pub async fn count(
        &self,
        name: &str,
        from: Option<DateTime<Utc>>,
        to: Option<DateTime<Utc>>,
    ) -> Result<u64, MonitorError> {
        match self {
            Storage::File(s) => s.count(name, from, to).await,
            Storage::Sqlite(s) => s.count(name, from, to).await,
            Storage::Postgres(s) => s.count(name, from, to).await,
        }
    }

    /// Rank-bucketed downsample: the matching rows are split into
    /// `max_points` equal-size buckets by rank (ties broken by id) and the
    /// first row of each bucket is returned, `timestamp DESC`.
    pub async fn query_bucketed(
        &self,
        name: &str,
        from: Option<DateTime<Utc>>,
        to: Option<DateTime<Utc>>,
        max_points: usize,
    ) -> Result<Vec<StoredEntry>, MonitorError> {
        match self {
            Storage::File(s) => s.query_bucketed(name, from, to, max_points).await,
            Storage::Sqlite(s) => s.query_bucketed(name, from, to, max_points).await,
            Storage::Postgres(s) => s.query_bucketed(name, from, to, max_points).await,
        }
    }

    /// Delete everything older than `cutoff` across every known table.
    /// Returns (table, removed) pairs.
    pub async fn sweep(&self, cutoff: DateTime<Utc>) -> Result<Vec<(String, u64)>, MonitorError> {
        match self {
            Storage::File(s) => s.sweep(cutoff).await,
            Storage::Sqlite(s) => s.sweep(cutoff).await,
            Storage::Postgres(s) => s.sweep(cutoff).await,
        }
    }

    pub async fn close(&self) {
        match self {
            Storage::File(_) => {}
            Storage::Sqlite(s) => s.close().await,
            Storage::Postgres(s) => s.close().await,
        }
    }
}

/// Outcome of one persistence attempt against one backend.
pub struct WriteOutcome {
    pub backend: &'static str,
    pub result: Result<(), MonitorError>,
}

/// The enabled backends in configured order. A failure in one backend never
/// blocks or reorders the others.
pub struct StorageSet {
    backends: Vec<Storage>,
}

impl StorageSet {
    /// Initialize every enabled backend. Backends that fail to come up are
    /// skipped with an error log; `Err` is returned only when storage was
    /// requested and no backend at all could be initialized.
    pub async fn init(config: &AppConfig) -> Result<Self, MonitorError> {
        let mut backends = Vec::new();
        let mut enabled = 0;

        if config.storage.file_enabled() {
            enabled += 1;
            match FileStore::new(&config.log_path, &config.default_table) {
                Ok(store) => {
                    info!(path = %config.log_path, "File storage ready");
                    backends.push(Storage::File(store));
                }
                Err(e) => error!(error = %e, "File storage failed to initialize"),
            }
        }

        if config.storage.db_enabled() {
            enabled += 1;
            let url = &config.database_url;
            let connected = if url.starts_with("postgres:") {
                PgStore::connect(url).await.map(Storage::Postgres)
            } else {
                SqliteStore::connect(url).await.map(Storage::Sqlite)
            };
            match connected {
                Ok(store) => {
                    info!(backend = store.kind(), "SQL storage ready");
                    backends.push(store);
                }
                Err(e) => error!(error = %e, "SQL storage failed to initialize"),
            }
        }

        if enabled > 0 && backends.is_empty() {
            return Err(MonitorError::Permanent(
                "no enabled storage backend could be initialized".to_string(),
            ));
        }

        Ok(Self { backends })
    }

    #[cfg(test)]
    pub fn from_backends(backends: Vec<Storage>) -> Self {
        Self { backends }
    }

    pub fn backends(&self) -> &[Storage] {
        &self.backends
    }

    pub fn is_empty(&self) -> bool {
        self.backends.is_empty()
    }

    /// The backend queries run against: the SQL backend when enabled (its
    /// downsample path is native), otherwise the first configured one.
    pub fn primary(&self) -> Option<&Storage> {
        self.backends
            .iter()
            .find(|b| b.is_sql())
            .or_else(|| self.backends.first())
    }

    /// Write one entry to every backend in configured order, retrying
    /// transient failures per backend. The outcome vector always has one
    /// element per backend; one failure never zeroes another's success.
    pub async fn write_all(&self, table: &str, entry: &StoredEntry) -> Vec<WriteOutcome> {
        let mut outcomes = Vec::with_capacity(self.backends.len());
        for backend in &self.backends {
            let result = with_retries(backend.kind(), WRITE_RETRIES, || {
                backend.write(table, entry)
            })
            .await;
            if let Err(e) = &result {
                warn!(backend = backend.kind(), table, error = %e, "Persist failed");
            }
            outcomes.push(WriteOutcome {
                backend: backend.kind(),
                result,
            });
        }
        outcomes
    }

    /// Retention sweep across every backend.
    pub async fn sweep_all(&self, cutoff: DateTime<Utc>) {
        for backend in &self.backends {
            match backend.sweep(cutoff).await {
                Ok(removed) => {
                    let total: u64 = removed.iter().map(|(_, n)| n).sum();
                    if total > 0 {
                        info!(
                            backend = backend.kind(),
                            removed = total,
                            tables = removed.len(),
                            "Retention sweep removed entries"
                        );
                    }
                }
                Err(e) => warn!(backend = backend.kind(), error = %e, "Retention sweep failed"),
            }
        }
    }

    /// Close handles in reverse init order.
    pub async fn close_all(&self) {
        for backend in self.backends.iter().rev() {
            backend.close().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // ── bucket math ──

    #[test]
    fn bucket_size_exact_division() {
        assert_eq!(bucket_size(1000, 500), 2);
    }

    #[test]
    fn bucket_size_rounds_up() {
        assert_eq!(bucket_size(1001, 500), 3);
        assert_eq!(bucket_size(499, 500), 1);
    }

    #[test]
    fn bucket_size_handles_degenerate_inputs() {
        assert_eq!(bucket_size(0, 500), 0);
        assert_eq!(bucket_size(10, 0), 10); // max_points clamped to 1
    }

    // ── registry ──

    #[test]
    fn registry_insert_and_snapshot() {
        let reg = TableRegistry::default();
        reg.insert("b_table");
        reg.insert("a_table");
        reg.insert("b_table"); // duplicate is a no-op
        assert!(reg.contains("a_table"));
        assert!(!reg.contains("missing"));
        assert_eq!(reg.snapshot(), vec!["a_table", "b_table"]);
    }

    // ── write fan-out ──

    #[tokio::test]
    async fn write_all_reports_one_outcome_per_backend() {
        let dir = tempfile::tempdir().unwrap();
        let file = FileStore::new(dir.path().to_str().unwrap(), "monitoring").unwrap();
        let sqlite = SqliteStore::test_db().await;
        let set = StorageSet::from_backends(vec![Storage::File(file), Storage::Sqlite(sqlite)]);

        let entry = StoredEntry {
            timestamp: Utc::now(),
            data: serde_json::json!({"cpu": {"usage_percent": 1.0}}),
        };
        let outcomes = set.write_all("monitoring", &entry).await;
        assert_eq!(outcomes.len(), 2);
        assert!(outcomes.iter().all(|o| o.result.is_ok()));
    }

    #[tokio::test]
    async fn primary_prefers_sql_backend() {
        let dir = tempfile::tempdir().unwrap();
        let file = FileStore::new(dir.path().to_str().unwrap(), "monitoring").unwrap();
        let sqlite = SqliteStore::test_db().await;
        let set = StorageSet::from_backends(vec![Storage::File(file), Storage::Sqlite(sqlite)]);
        assert_eq!(set.primary().unwrap().kind(), "sqlite");
    }

    #[tokio::test]
    async fn primary_falls_back_to_first() {
        let dir = tempfile::tempdir().unwrap();
        let file = FileStore::new(dir.path().to_str().unwrap(), "monitoring").unwrap();
        let set = StorageSet::from_backends(vec![Storage::File(file)]);
        assert_eq!(set.primary().unwrap().kind(), "file");
    }
}
