use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::stream::{self, StreamExt};
use serde_json::Value;
use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::clock;
use crate::config::ServerEntry;
use crate::httpc::HttpPool;
use crate::record::{dedup_by_key, LoadAverage, PeerStatus, PeerSummary};

/// Fetch retries per tick beyond the first attempt.
const RETRY_BUDGET: u32 = 1;

struct CachedPeer {
    summary: PeerSummary,
    fetched_at: Instant,
}

/// Polls peer collectors and keeps the last successful summary per peer so
/// a flapping peer degrades to `stale` rather than disappearing from the
/// dashboard.
pub struct PeerFetcher {
    pool: Arc<HttpPool>,
    cache: RwLock<HashMap<String, CachedPeer>>,
    ttl: Duration,
}

impl PeerFetcher {
    pub fn new(pool: Arc<HttpPool>, tick_interval: Duration) -> Self {
        Self::with_ttl(pool, tick_interval.max(Duration::from_secs(2)))
    }

    pub fn with_ttl(pool: Arc<HttpPool>, ttl: Duration) -> Self {
        Self {
            pool,
            cache: RwLock::new(HashMap::new()),
            ttl,
        }
    }

    /// Fetch all configured peers in parallel. Never fails: each peer
    /// resolves to ok, stale (cached) or error.
    pub async fn fetch_all(
        &self,
        servers: &[ServerEntry],
        deadline: Duration,
    ) -> Vec<PeerSummary> {
        let servers: Vec<ServerEntry> = {
            let deduped = dedup_by_key(servers.to_vec(), |s| &s.address);
            if deduped.len() < servers.len() {
                warn!(
                    dropped = servers.len() - deduped.len(),
                    "Duplicate peer addresses in config — keeping first of each"
                );
            }
            deduped
        };

        stream::iter(servers)
            .map(|server| async move { self.fetch_one(&server, deadline).await })
            .buffer_unordered(8)
            .collect()
            .await
    }

    async fn fetch_one(&self, server: &ServerEntry, deadline: Duration) -> PeerSummary {
        let url = format!("{}/monitoring", server.address.trim_end_matches('/'));
        // Empty filter asks the peer for its live record.
        let filter = serde_json::json!({});

        let mut last_error = String::new();
        for attempt in 0..=RETRY_BUDGET {
            match self.pool.post_json_bounded(&url, &filter, deadline).await {
                Ok(resp) if resp.status.is_success() => match resp.json::<Value>() {
                    Ok(payload) => {
                        if let Some(summary) = normalize_payload(server, &payload) {
                            self.cache.write().await.insert(
                                server.address.clone(),
                                CachedPeer {
                                    summary: summary.clone(),
                                    fetched_at: Instant::now(),
                                },
                            );
                            return summary;
                        }
                        last_error = "peer returned an unrecognized payload".to_string();
                        break; // malformed payloads won't improve on retry
                    }
                    Err(e) => {
                        last_error = e.to_string();
                        break;
                    }
                },
                Ok(resp) => {
                    last_error = format!("peer returned HTTP {}", resp.status);
                    break;
                }
                Err(e) => {
                    debug!(peer = %server.address, attempt, error = %e, "Peer fetch failed");
                    last_error = e.to_string();
                    if !e.is_retryable() {
                        break;
                    }
                }
            }
        }

        self.degraded_summary(server, last_error).await
    }

    /// Fall back to the cached summary: unchanged while inside the TTL,
    /// tagged stale once past it, and a bare error entry when there is
    /// nothing cached at all.
    async fn degraded_summary(&self, server: &ServerEntry, message: String) -> PeerSummary {
        let cache = self.cache.read().await;
        match cache.get(&server.address) {
            Some(cached) if cached.fetched_at.elapsed() <= self.ttl => cached.summary.clone(),
            Some(cached) => {
                let mut summary = cached.summary.clone();
                summary.status = PeerStatus::Stale;
                summary.message = Some(message);
                summary
            }
            None => PeerSummary {
                name: server.name.clone(),
                address: server.address.clone(),
                status: PeerStatus::Error,
                cpu_usage: 0.0,
                memory_used_percent: 0.0,
                disk_used_percent: 0.0,
                load_average: LoadAverage::default(),
                timestamp: clock::now(),
                message: Some(message),
            },
        }
    }
}

/// Trim a peer's `/monitoring` response to the dashboard-consumed shape.
///
/// Peers running older builds spell some fields differently (flat
/// `cpu_usage_percent` instead of `cpu.usage_percent`, `load_avg_1` instead
/// of `load_average.one_minute`). All spellings normalize here, once; the
/// internal record type stays strict.
fn normalize_payload(server: &ServerEntry, payload: &Value) -> Option<PeerSummary> {
    // The endpoint returns an array of records, newest first. A bare object
    // is accepted for robustness.
    let record = match payload {
        Value::Array(items) => items.first()?,
        Value::Object(_) => payload,
        _ => return None,
    };

    let timestamp = record
        .get("timestamp")
        .and_then(Value::as_str)
        .and_then(|s| clock::parse(s).ok())
        .unwrap_or_else(clock::now);

    let cpu_usage = pick_number(
        record,
        &[
            &["cpu", "usage_percent"],
            &["cpu_usage_percent"],
            &["cpu_usage"],
        ],
    )?;

    let memory_used_percent = pick_number(
        record,
        &[
            &["ram", "used_pct"],
            &["ram", "used_percent"],
            &["memory_used_percent"],
            &["memory", "used_pct"],
        ],
    )
    .unwrap_or(0.0);

    let disk_used_percent = pick_number(record, &[&["disk_used_percent"], &["disk", "used_pct"]])
        .or_else(|| aggregate_disks(record.get("disks").or_else(|| record.get("disk_space"))?))
        .unwrap_or(0.0);

    let load_average = LoadAverage {
        one_minute: pick_number(
            record,
            &[&["load_average", "one_minute"], &["load_avg_1"], &["cpu", "load_1"]],
        )
        .unwrap_or(0.0),
        five_minutes: pick_number(
            record,
            &[&["load_average", "five_minutes"], &["load_avg_5"], &["cpu", "load_5"]],
        )
        .unwrap_or(0.0),
        fifteen_minutes: pick_number(
            record,
            &[
                &["load_average", "fifteen_minutes"],
                &["load_avg_15"],
                &["cpu", "load_15"],
            ],
        )
        .unwrap_or(0.0),
    };

    Some(PeerSummary {
        name: server.name.clone(),
        address: server.address.clone(),
        status: PeerStatus::Ok,
        cpu_usage,
        memory_used_percent,
        disk_used_percent,
        load_average,
        timestamp,
        message: None,
    })
}

/// First numeric value found at any of the candidate paths.
fn pick_number(record: &Value, paths: &[&[&str]]) -> Option<f64> {
    for path in paths {
        let mut cursor = record;
        let mut found = true;
        for key in *path {
            match cursor.get(key) {
                Some(next) => cursor = next,
                None => {
                    found = false;
                    break;
                }
            }
        }
        if found {
            if let Some(n) = cursor.as_f64() {
                return Some(n);
            }
        }
    }
    None
}

fn aggregate_disks(disks: &Value) -> Option<f64> {
    let disks = disks.as_array()?;
    let mut total: f64 = 0.0;
    let mut used: f64 = 0.0;
    for d in disks {
        total += d.get("total_bytes").and_then(Value::as_f64).unwrap_or(0.0);
        used += d.get("used_bytes").and_then(Value::as_f64).unwrap_or(0.0);
    }
    if total > 0.0 {
        Some(used / total * 100.0)
    } else {
        None
    }
}
