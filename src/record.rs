use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One immutable snapshot produced per tick. Field names are part of the
/// wire contract — the dashboard reads them straight out of the stored
/// document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitoringRecord {
    pub timestamp: DateTime<Utc>,
    pub cpu: CpuStats,
    pub ram: RamStats,
    pub disks: Vec<DiskSpace>,
    pub network_io: NetworkIo,
    pub load_average: LoadAverage,
    pub process_count: u64,
    pub heartbeat: Vec<HeartbeatResult>,
    pub server_metrics: Vec<PeerSummary>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CpuStats {
    pub usage_percent: f64,
    pub core_count: u32,
    pub load_1: f64,
    pub load_5: f64,
    pub load_15: f64,
    pub architecture: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RamStats {
    pub total_bytes: u64,
    pub used_bytes: u64,
    pub available_bytes: u64,
    pub used_pct: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiskSpace {
    pub path: String,
    pub device: String,
    pub filesystem: String,
    pub total_bytes: u64,
    pub used_bytes: u64,
    pub available_bytes: u64,
    /// Undefined when `total_bytes` is zero — serialized as null.
    pub used_pct: Option<f64>,
}

/// Cumulative counters since host boot. Monotonic per host; a reboot shows
/// up as a counter reset (see `clock::counter_delta`).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NetworkIo {
    pub bytes_sent: u64,
    pub bytes_recv: u64,
    pub packets_sent: u64,
    pub packets_recv: u64,
    pub errors_in: u64,
    pub errors_out: u64,
    pub drops_in: u64,
    pub drops_out: u64,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct LoadAverage {
    pub one_minute: f64,
    pub five_minutes: f64,
    pub fifteen_minutes: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HeartbeatStatus {
    Up,
    Down,
    Degraded,
    /// Only before the first probe completes.
    Unknown,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatResult {
    pub name: String,
    pub url: String,
    pub status: HeartbeatStatus,
    pub response_ms: u64,
    pub last_checked: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tags: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub region: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PeerStatus {
    Ok,
    /// Cached sample exceeded its TTL and no fresh fetch succeeded.
    Stale,
    /// The most recent fetch failed within the retry budget.
    Error,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerSummary {
    pub name: String,
    pub address: String,
    pub status: PeerStatus,
    pub cpu_usage: f64,
    pub memory_used_percent: f64,
    pub disk_used_percent: f64,
    pub load_average: LoadAverage,
    pub timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl MonitoringRecord {
    /// Aggregate disk percentage: sum(used) / sum(total). Undefined when no
    /// disk reports a nonzero total.
    pub fn aggregate_disk_pct(&self) -> Option<f64> {
        let total: u64 = self.disks.iter().map(|d| d.total_bytes).sum();
        if total == 0 {
            return None;
        }
        let used: u64 = self.disks.iter().map(|d| d.used_bytes).sum();
        Some(used as f64 / total as f64 * 100.0)
    }
}

/// Drop later duplicates so `heartbeat` stays keyed by URL and
/// `server_metrics` by address.
pub fn dedup_by_key<T, F>(items: Vec<T>, key: F) -> Vec<T>
where
    F: Fn(&T) -> &str,
{
    let mut seen = std::collections::HashSet::new();
    items
        .into_iter()
        .filter(|item| seen.insert(key(item).to_string()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn disk(total: u64, used: u64) -> DiskSpace {
        DiskSpace {
            path: "/".into(),
            device: "sda1".into(),
            filesystem: "ext4".into(),
            total_bytes: total,
            used_bytes: used,
            available_bytes: total - used,
            used_pct: if total > 0 {
                Some(used as f64 / total as f64 * 100.0)
            } else {
                None
            },
        }
    }

    fn record_with_disks(disks: Vec<DiskSpace>) -> MonitoringRecord {
        MonitoringRecord {
            timestamp: Utc::now(),
            cpu: CpuStats {
                usage_percent: 0.0,
                core_count: 1,
                load_1: 0.0,
                load_5: 0.0,
                load_15: 0.0,
                architecture: "x86_64".into(),
            },
            ram: RamStats {
                total_bytes: 0,
                used_bytes: 0,
                available_bytes: 0,
                used_pct: 0.0,
            },
            disks,
            network_io: NetworkIo::default(),
            load_average: LoadAverage::default(),
            process_count: 0,
            heartbeat: vec![],
            server_metrics: vec![],
        }
    }

    #[test]
    fn aggregate_disk_pct_sums_across_disks() {
        let rec = record_with_disks(vec![disk(100, 50), disk(100, 30)]);
        let pct = rec.aggregate_disk_pct().unwrap();
        assert!((pct - 40.0).abs() < f64::EPSILON);
    }

    #[test]
    fn aggregate_disk_pct_absent_when_all_totals_zero() {
        let rec = record_with_disks(vec![disk(0, 0), disk(0, 0)]);
        assert!(rec.aggregate_disk_pct().is_none());
    }

    #[test]
    fn aggregate_disk_pct_absent_when_no_disks() {
        let rec = record_with_disks(vec![]);
        assert!(rec.aggregate_disk_pct().is_none());
    }

    #[test]
    fn dedup_keeps_first_occurrence() {
        let items = vec![("a", 1), ("b", 2), ("a", 3)];
        let out = dedup_by_key(items, |i| i.0);
        assert_eq!(out, vec![("a", 1), ("b", 2)]);
    }

    #[test]
    fn status_serializes_lowercase() {
        assert_eq!(
            serde_json::to_string(&HeartbeatStatus::Degraded).unwrap(),
            "\"degraded\""
        );
        assert_eq!(
            serde_json::to_string(&PeerStatus::Stale).unwrap(),
            "\"stale\""
        );
    }

    #[test]
    fn record_roundtrips_through_json() {
        let rec = record_with_disks(vec![disk(100, 25)]);
        let json = serde_json::to_string(&rec).unwrap();
        let back: MonitoringRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(back.disks.len(), 1);
        assert_eq!(back.disks[0].total_bytes, 100);
        assert_eq!(back.timestamp, rec.timestamp);
    }
}
