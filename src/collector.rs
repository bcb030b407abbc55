use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{watch, RwLock};
use tracing::{info, warn};

use crate::config::AppConfig;
use crate::heartbeat;
use crate::httpc::HttpPool;
use crate::ident;
use crate::peers::PeerFetcher;
use crate::record::{HeartbeatResult, MonitoringRecord, PeerStatus, PeerSummary};
use crate::sampler::Sampler;
use crate::storage::{StorageSet, StoredEntry};

/// Latest assembled record, shared with the live query path. Cloning shares
/// the underlying slot.
#[derive(Clone, Default)]
pub struct LatestSample(Arc<RwLock<Option<MonitoringRecord>>>);

impl LatestSample {
    pub async fn get(&self) -> Option<MonitoringRecord> {
        self.0.read().await.clone()
    }

    async fn set(&self, record: MonitoringRecord) {
        *self.0.write().await = Some(record);
    }
}

/// Drives the sampling pipeline: every tick runs the local sampler, the
/// heartbeat wave and the peer scrapes concurrently, merges the parts into
/// one record, and hands it to every enabled backend.
pub struct Collector {
    config: Arc<AppConfig>,
    storages: Arc<StorageSet>,
    pool: Arc<HttpPool>,
    latest: LatestSample,
    /// Explicit table overrides from config, keyed by peer address.
    table_overrides: HashMap<String, String>,
}

impl Collector {
    pub fn new(config: Arc<AppConfig>, storages: Arc<StorageSet>, pool: Arc<HttpPool>) -> Self {
        let table_overrides = config
            .servers
            .iter()
            .filter_map(|s| {
                s.table_name
                    .as_ref()
                    .map(|t| (s.address.clone(), t.clone()))
            })
            .collect();
        Self {
            config,
            storages,
            pool,
            latest: LatestSample::default(),
            table_overrides,
        }
    }

    pub fn latest(&self) -> LatestSample {
        self.latest.clone()
    }

    /// Spawn the tick loop. The first tick fires immediately so the live
    /// query path has data as soon as the service is up; after that ticks
    /// align to the interval, and an overrunning tick skips to the next
    /// aligned slot rather than bursting to catch up.
    pub fn spawn(self, mut shutdown: watch::Receiver<bool>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let tick = self.config.refresh_interval();
            let mut interval = tokio::time::interval(tick);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

            let fetcher = PeerFetcher::new(self.pool.clone(), tick);
            let mut sampler = Sampler::new();
            let mut last_heartbeat: Vec<HeartbeatResult> = Vec::new();
            let mut last_peers: Vec<PeerSummary> = Vec::new();

            self.prepare_tables().await;

            loop {
                tokio::select! {
                    _ = interval.tick() => {}
                    _ = shutdown.changed() => break,
                }

                let record = self
                    .assemble(
                        &mut sampler,
                        &fetcher,
                        tick,
                        &mut last_heartbeat,
                        &mut last_peers,
                    )
                    .await;

                self.latest.set(record.clone()).await;
                // Persistence of an assembled record always completes, even
                // when shutdown arrived mid-tick.
                self.persist(&record).await;

                if *shutdown.borrow() {
                    break;
                }
            }

            info!("Collector stopped");
        })
    }

    /// Create the default table and the per-server tables on every backend
    /// so the first tick does not pay the schema cost.
    async fn prepare_tables(&self) {
        let mut tables = vec![self.config.default_table.clone()];
        for server in &self.config.servers {
            match self.table_for(server) {
                Ok(table) => tables.push(table),
                Err(e) => warn!(server = %server.name, error = %e, "Unusable server table name"),
            }
        }
        for backend in self.storages.backends() {
            for table in &tables {
                if let Err(e) = backend.ensure_table(table).await {
                    warn!(backend = backend.kind(), table, error = %e, "ensure_table failed");
                }
            }
        }
    }

    fn table_for(&self, server: &crate::config::ServerEntry) -> Result<String, crate::error::MonitorError> {
        match self.table_overrides.get(&server.address) {
            Some(explicit) => ident::sanitize(explicit),
            None => ident::table_for_address(&server.address),
        }
    }

    /// One tick's assembly: the three sources run concurrently under a
    /// shared deadline of 0.9 x interval. A source that misses the deadline
    /// is filled from last-known values — the tick never aborts.
    async fn assemble(
        &self,
        sampler: &mut Sampler,
        fetcher: &PeerFetcher,
        tick: Duration,
        last_heartbeat: &mut Vec<HeartbeatResult>,
        last_peers: &mut Vec<PeerSummary>,
    ) -> MonitoringRecord {
        let assemble_deadline = tick.mul_f64(0.9);
        let probe_deadline = tick / 2;

        let (mut record, heartbeat_wave, peer_wave) = tokio::join!(
            async { sampler.sample() },
            tokio::time::timeout(
                assemble_deadline,
                heartbeat::probe_all(self.pool.clone(), &self.config.heartbeats, probe_deadline),
            ),
            tokio::time::timeout(
                assemble_deadline,
                fetcher.fetch_all(&self.config.servers, probe_deadline),
            ),
        );

        record.heartbeat = match heartbeat_wave {
            Ok(results) => {
                *last_heartbeat = results.clone();
                results
            }
            Err(_) => {
                warn!("Heartbeat wave missed the tick deadline — reusing last results");
                last_heartbeat.clone()
            }
        };

        record.server_metrics = match peer_wave {
            Ok(results) => {
                *last_peers = results.clone();
                results
            }
            Err(_) => {
                warn!("Peer scrapes missed the tick deadline — reusing last results as stale");
                mark_stale(last_peers.clone())
            }
        };

        record
    }

    /// Write the combined record to the default table and each peer summary
    /// to its per-server table, on every backend in configured order.
    async fn persist(&self, record: &MonitoringRecord) {
        if self.storages.is_empty() {
            return;
        }

        let entry = StoredEntry {
            timestamp: record.timestamp,
            data: serde_json::to_value(record).expect("record serializes"),
        };
        let outcomes = self
            .storages
            .write_all(&self.config.default_table, &entry)
            .await;
        let failed: Vec<&str> = outcomes
            .iter()
            .filter(|o| o.result.is_err())
            .map(|o| o.backend)
            .collect();
        info!(
            backends = outcomes.len(),
            failed = ?failed,
            timestamp = %self.config.time_policy.display(record.timestamp),
            "Tick persisted"
        );

        for summary in &record.server_metrics {
            let table = match self
                .table_overrides
                .get(&summary.address)
                .map(|t| ident::sanitize(t))
                .unwrap_or_else(|| ident::table_for_address(&summary.address))
            {
                Ok(table) => table,
                Err(e) => {
                    warn!(peer = %summary.address, error = %e, "Skipping per-server persist");
                    continue;
                }
            };
            let peer_entry = StoredEntry {
                timestamp: summary.timestamp,
                data: serde_json::to_value(summary).expect("summary serializes"),
            };
            self.storages.write_all(&table, &peer_entry).await;
        }
    }
}

fn mark_stale(mut peers: Vec<PeerSummary>) -> Vec<PeerSummary> {
    for peer in &mut peers {
        peer.status = PeerStatus::Stale;
    }
    peers
}

/// Periodic retention sweep across all backends. Runs hourly; entries older
/// than `retention_days` are removed.
pub fn spawn_sweeper(
    storages: Arc<StorageSet>,
    retention_days: u32,
    mut shutdown: watch::Receiver<bool>,
) -> Option<tokio::task::JoinHandle<()>> {
    if retention_days == 0 || storages.is_empty() {
        return None;
    }

    Some(tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(3600));
        loop {
            tokio::select! {
                _ = interval.tick() => {}
                _ = shutdown.changed() => break,
            }
            let cutoff = crate::clock::now() - chrono::Duration::days(retention_days as i64);
            storages.sweep_all(cutoff).await;
        }
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AppConfig, HttpLimits, StorageMode, Thresholds};
    use crate::storage::{FileStore, SqliteStore, Storage};

    fn test_config(dir: &tempfile::TempDir) -> AppConfig {
        AppConfig {
            port: 0,
            storage: StorageMode::File,
            log_path: dir.path().to_str().unwrap().to_string(),
            database_url: "sqlite::memory:".into(),
            retention_days: 0,
            refresh_interval_seconds: 1,
            downsample_max_points: 500,
            default_table: "monitoring".into(),
            http: HttpLimits::default(),
            time_policy: crate::clock::TimePolicy::default(),
            static_path: "./static".into(),
            servers: vec![],
            heartbeats: vec![],
            thresholds: Thresholds::default(),
        }
    }

    fn collector_for(
        config: AppConfig,
        storages: Vec<Storage>,
    ) -> (Collector, watch::Sender<bool>) {
        let pool = Arc::new(HttpPool::new(config.http).unwrap());
        let collector = Collector::new(
            Arc::new(config),
            Arc::new(crate::storage::StorageSet::from_backends(storages)),
            pool,
        );
        let (tx, _rx) = watch::channel(false);
        (collector, tx)
    }

    #[test]
    fn mark_stale_flips_every_status() {
        let peers = vec![PeerSummary {
            name: "p".into(),
            address: "http://p:3500".into(),
            status: PeerStatus::Ok,
            cpu_usage: 1.0,
            memory_used_percent: 2.0,
            disk_used_percent: 3.0,
            load_average: Default::default(),
            timestamp: crate::clock::now(),
            message: None,
        }];
        let stale = mark_stale(peers);
        assert_eq!(stale[0].status, PeerStatus::Stale);
    }

    #[tokio::test]
    async fn ticks_write_records_to_the_file_backend() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(&dir);
        let file = FileStore::new(&config.log_path, "monitoring").unwrap();
        let (collector, tx) = collector_for(config, vec![Storage::File(file)]);
        let latest = collector.latest();

        let handle = collector.spawn(tx.subscribe());
        // Real-time wait: the first tick fires immediately.
        tokio::time::sleep(Duration::from_millis(400)).await;
        tx.send(true).unwrap();
        handle.await.unwrap();

        let record = latest.get().await.expect("at least one tick ran");
        assert!(record.cpu.core_count >= 1);

        let day = format!("{}.log", record.timestamp.format("%Y-%m-%d"));
        let raw = std::fs::read_to_string(dir.path().join(day)).unwrap();
        let parsed: Vec<serde_json::Value> = serde_json::from_str(&raw).unwrap();
        assert!(!parsed.is_empty());
        assert!(parsed[0]["data"]["cpu"]["usage_percent"].is_number());
    }

    #[tokio::test]
    async fn down_heartbeat_lands_in_the_stored_record() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = test_config(&dir);
        config.heartbeats = vec![crate::config::HeartbeatTarget {
            name: "x".into(),
            url: "http://127.0.0.1:1".into(),
            tags: None,
            region: None,
        }];
        let sqlite = SqliteStore::test_db().await;
        let (collector, tx) = collector_for(config, vec![Storage::Sqlite(sqlite)]);
        let latest = collector.latest();

        let handle = collector.spawn(tx.subscribe());
        tokio::time::sleep(Duration::from_millis(600)).await;
        tx.send(true).unwrap();
        handle.await.unwrap();

        let record = latest.get().await.unwrap();
        assert_eq!(record.heartbeat.len(), 1);
        assert_eq!(
            record.heartbeat[0].status,
            crate::record::HeartbeatStatus::Down
        );
    }

    #[tokio::test]
    async fn unreachable_peer_is_reported_not_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = test_config(&dir);
        config.servers = vec![crate::config::ServerEntry {
            name: "edge".into(),
            address: "http://127.0.0.1:1".into(),
            table_name: None,
            tags: None,
        }];
        let file = FileStore::new(&config.log_path, "monitoring").unwrap();
        let (collector, tx) = collector_for(config, vec![Storage::File(file)]);
        let latest = collector.latest();

        let handle = collector.spawn(tx.subscribe());
        tokio::time::sleep(Duration::from_millis(600)).await;
        tx.send(true).unwrap();
        handle.await.unwrap();

        let record = latest.get().await.unwrap();
        assert_eq!(record.server_metrics.len(), 1);
        assert_eq!(record.server_metrics[0].status, PeerStatus::Error);
    }

    #[tokio::test]
    async fn shutdown_stops_the_loop() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(&dir);
        let (collector, tx) = collector_for(config, vec![]);

        let handle = collector.spawn(tx.subscribe());
        tokio::time::sleep(Duration::from_millis(100)).await;
        tx.send(true).unwrap();
        let joined = tokio::time::timeout(Duration::from_secs(5), handle).await;
        assert!(joined.is_ok(), "collector did not stop after shutdown");
    }
}
