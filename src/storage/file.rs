use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, NaiveDate, Utc};
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::warn;

use super::{bucket_size, StoredEntry, TableRegistry};
use crate::clock;
use crate::error::MonitorError;
use crate::ident;

/// Append-only JSON-array storage, one file per (table, UTC day):
/// `<base>/YYYY-MM-DD.log` for the default table and
/// `<base>/servers/<table>/YYYY-MM-DD.log` for per-server tables.
///
/// Writes are read-modify-write under an exclusive per-file lock, landing
/// via a temp-file rename so readers never observe a half-written array.
/// There is no fsync per write: monitoring data tolerates losing the tail
/// of the current day on power loss, and the sync would dominate the tick.
pub struct FileStore {
    base: PathBuf,
    default_table: String,
    registry: TableRegistry,
    locks: Mutex<HashMap<PathBuf, Arc<Mutex<()>>>>,
}

impl FileStore {
    pub fn new(base: &str, default_table: &str) -> Result<Self, MonitorError> {
        let base = PathBuf::from(base);
        std::fs::create_dir_all(&base)?;

        let store = Self {
            base,
            default_table: ident::sanitize(default_table)?,
            registry: TableRegistry::default(),
            locks: Mutex::new(HashMap::new()),
        };
        store.registry.insert(&store.default_table);

        // Pick up per-server tables left by a previous run so sweeps see
        // them without waiting for a write.
        let servers_dir = store.base.join("servers");
        if let Ok(entries) = std::fs::read_dir(&servers_dir) {
            for entry in entries.flatten() {
                if entry.path().is_dir() {
                    if let Some(name) = entry.file_name().to_str() {
                        store.registry.insert(name);
                    }
                }
            }
        }

        Ok(store)
    }

    fn dir_for(&self, table: &str) -> Result<PathBuf, MonitorError> {
        let table = ident::sanitize(table)?;
        if table == self.default_table {
            Ok(self.base.clone())
        } else {
            Ok(self.base.join("servers").join(table))
        }
    }

    async fn file_lock(&self, path: &Path) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().await;
        locks
            .entry(path.to_path_buf())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    pub async fn ensure_table(&self, name: &str) -> Result<(), MonitorError> {
        let table = ident::sanitize(name)?;
        let dir = self.dir_for(&table)?;
        std::fs::create_dir_all(&dir)?;
        self.registry.insert(&table);
        Ok(())
    }

    pub async fn write(&self, name: &str, entry: &StoredEntry) -> Result<(), MonitorError> {
        self.ensure_table(name).await?;
        let dir = self.dir_for(name)?;
        let path = dir.join(day_file_name(entry.timestamp.date_naive()));

        let lock = self.file_lock(&path).await;
        let _guard = lock.lock().await;

        let mut entries = read_day_file(&path);
        entries.push(serde_json::json!({
            "timestamp": clock::format_wire(entry.timestamp),
            "data": entry.data,
        }));
        write_day_file(&path, &entries)?;
        Ok(())
    }

    pub async fn query(
        &self,
        name: &str,
        from: Option<DateTime<Utc>>,
        to: Option<DateTime<Utc>>,
    ) -> Result<Vec<StoredEntry>, MonitorError> {
        let dir = self.dir_for(name)?;
        if !dir.is_dir() {
            return Ok(vec![]);
        }

        let mut days = list_day_files(&dir);
        days.sort_by_key(|(day, _)| *day);

        let mut rows: Vec<StoredEntry> = Vec::new();
        for (day, path) in days {
            // Whole-day pruning before reading the file.
            if let Some(from) = from {
                if day < from.date_naive() {
                    continue;
                }
            }
            if let Some(to) = to {
                if day > to.date_naive() {
                    continue;
                }
            }
            for value in read_day_file(&path) {
                let Some(entry) = parse_entry(&value) else {
                    continue;
                };
                if from.is_some_and(|f| entry.timestamp < f) {
                    continue;
                }
                if to.is_some_and(|t| entry.timestamp > t) {
                    continue;
                }
                rows.push(entry);
            }
        }

        // Ascending by insertion, flipped to newest-first with later
        // writes winning timestamp ties.
        rows.sort_by_key(|e| e.timestamp);
        rows.reverse();
        Ok(rows)
    }

    pub async fn count(
        &self,
        name: &str,
        from: Option<DateTime<Utc>>,
        to: Option<DateTime<Utc>>,
    ) -> Result<u64, MonitorError> {
        Ok(self.query(name, from, to).await?.len() as u64)
    }

    pub async fn query_bucketed(
        &self,
        name: &str,
        from: Option<DateTime<Utc>>,
        to: Option<DateTime<Utc>>,
        max_points: usize,
    ) -> Result<Vec<StoredEntry>, MonitorError> {
        let rows = self.query(name, from, to).await?;
        if rows.is_empty() {
            return Ok(rows);
        }
        let bucket = bucket_size(rows.len() as u64, max_points) as usize;
        Ok(rows
            .into_iter()
            .step_by(bucket.max(1))
            .take(max_points.max(1))
            .collect())
    }

    pub async fn sweep(&self, cutoff: DateTime<Utc>) -> Result<Vec<(String, u64)>, MonitorError> {
        // Union of the registry and what is actually on disk.
        let mut tables = self.registry.snapshot();
        let servers_dir = self.base.join("servers");
        if let Ok(entries) = std::fs::read_dir(&servers_dir) {
            for entry in entries.flatten() {
                if let Some(name) = entry.file_name().to_str() {
                    if entry.path().is_dir() && !tables.iter().any(|t| t == name) {
                        tables.push(name.to_string());
                        self.registry.insert(name);
                    }
                }
            }
        }

        let mut removed = Vec::new();
        for table in tables {
            let dir = match self.dir_for(&table) {
                Ok(dir) => dir,
                Err(_) => continue, // a stray directory that fails the sanitizer
            };
            if !dir.is_dir() {
                removed.push((table, 0));
                continue;
            }

            let mut table_removed: u64 = 0;
            for (day, path) in list_day_files(&dir) {
                let lock = self.file_lock(&path).await;
                let _guard = lock.lock().await;

                if day < cutoff.date_naive() {
                    // Every entry in the file predates the cutoff.
                    table_removed += read_day_file(&path).len() as u64;
                    std::fs::remove_file(&path)?;
                } else if day == cutoff.date_naive() {
                    let entries = read_day_file(&path);
                    let kept: Vec<Value> = entries
                        .iter()
                        .filter(|v| {
                            parse_entry(v).is_none_or(|e| e.timestamp >= cutoff)
                        })
                        .cloned()
                        .collect();
                    let dropped = entries.len() - kept.len();
                    if dropped > 0 {
                        table_removed += dropped as u64;
                        if kept.is_empty() {
                            std::fs::remove_file(&path)?;
                        } else {
                            write_day_file(&path, &kept)?;
                        }
                    }
                }
            }
            removed.push((table, table_removed));
        }
        Ok(removed)
    }
}

fn day_file_name(day: NaiveDate) -> String {
    format!("{}.log", day.format("%Y-%m-%d"))
}

fn list_day_files(dir: &Path) -> Vec<(NaiveDate, PathBuf)> {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return vec![];
    };
    entries
        .flatten()
        .filter_map(|entry| {
            let path = entry.path();
            let stem = path.file_stem()?.to_str()?;
            if path.extension()?.to_str()? != "log" {
                return None;
            }
            let day = NaiveDate::parse_from_str(stem, "%Y-%m-%d").ok()?;
            Some((day, path))
        })
        .collect()
}

/// Read one day's array. A corrupt file restarts the day — the loss is
/// surfaced as a warning, not an error.
fn read_day_file(path: &Path) -> Vec<Value> {
    let raw = match std::fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return vec![],
        Err(e) => {
            warn!(path = %path.display(), error = %e, "Unreadable day file — restarting array");
            return vec![];
        }
    };
    match serde_json::from_str::<Vec<Value>>(&raw) {
        Ok(entries) => entries,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "Corrupt day file — restarting array");
            vec![]
        }
    }
}

fn write_day_file(path: &Path, entries: &[Value]) -> Result<(), MonitorError> {
    let tmp = path.with_extension("log.tmp");
    std::fs::write(&tmp, serde_json::to_vec(entries).expect("JSON values serialize"))?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}

fn parse_entry(value: &Value) -> Option<StoredEntry> {
    let timestamp = clock::parse(value.get("timestamp")?.as_str()?).ok()?;
    Some(StoredEntry {
        timestamp,
        data: value.get("data")?.clone(),
    })
}
