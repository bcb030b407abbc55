use sysinfo::{Disks, Networks, ProcessesToUpdate, System};

use crate::clock;
use crate::record::{
    CpuStats, DiskSpace, LoadAverage, MonitoringRecord, NetworkIo, RamStats,
};

/// Filesystems that never represent real capacity.
const PSEUDO_FILESYSTEMS: &[&str] = &[
    "tmpfs",
    "devtmpfs",
    "devfs",
    "proc",
    "procfs",
    "sysfs",
    "squashfs",
    "ramfs",
    "autofs",
    "cgroup",
    "cgroup2",
    "debugfs",
    "tracefs",
    "securityfs",
    "fusectl",
    "pstore",
    "binfmt_misc",
    "mqueue",
    "hugetlbfs",
    "configfs",
];

// ---- CPU sampling (Linux /proc/stat) ----

struct CpuTimes {
    idle: u64,
    total: u64,
}

/// Delta-based CPU utilization from /proc/stat. More stable than a
/// point-in-time reading since it averages over the whole tick interval.
struct ProcStatSampler {
    prev: Option<CpuTimes>,
}

impl ProcStatSampler {
    fn new() -> Self {
        Self { prev: None }
    }

    /// Returns None on the first call (no delta yet) and on non-Linux hosts.
    fn sample(&mut self) -> Option<f64> {
        let contents = std::fs::read_to_string("/proc/stat").ok()?;
        let line = contents.lines().find(|l| l.starts_with("cpu "))?;

        // cpu  user nice system idle iowait irq softirq steal ...
        let fields: Vec<u64> = line
            .split_whitespace()
            .skip(1)
            .take(8)
            .filter_map(|s| s.parse().ok())
            .collect();
        if fields.len() < 4 {
            return None;
        }

        let idle = fields[3] + fields.get(4).copied().unwrap_or(0); // idle + iowait
        let total: u64 = fields.iter().sum();
        let current = CpuTimes { idle, total };

        let result = self.prev.as_ref().and_then(|prev| {
            let d_total = current.total.saturating_sub(prev.total);
            let d_idle = current.idle.saturating_sub(prev.idle);
            if d_total == 0 {
                None
            } else {
                let pct = ((d_total - d_idle) as f64 / d_total as f64) * 100.0;
                Some((pct * 10.0).round() / 10.0)
            }
        });

        self.prev = Some(current);
        result
    }
}

/// Reads host metrics into a normalized record. Keeps a persistent sysinfo
/// handle so CPU readings are computed against the previous tick.
pub struct Sampler {
    sys: System,
    cpu: ProcStatSampler,
}

impl Default for Sampler {
    fn default() -> Self {
        Self::new()
    }
}

impl Sampler {
    pub fn new() -> Self {
        Self {
            sys: System::new(),
            cpu: ProcStatSampler::new(),
        }
    }

    /// One local sample. The heartbeat and peer sections are filled in by
    /// the tick orchestrator.
    pub fn sample(&mut self) -> MonitoringRecord {
        self.sys.refresh_memory();
        self.sys.refresh_cpu_usage();
        self.sys.refresh_processes(ProcessesToUpdate::All, true);

        let load = System::load_average();
        let load_average = LoadAverage {
            one_minute: load.one,
            five_minutes: load.five,
            fifteen_minutes: load.fifteen,
        };

        // /proc/stat delta preferred; sysinfo's own delta elsewhere.
        let usage_percent = self
            .cpu
            .sample()
            .unwrap_or_else(|| self.sys.global_cpu_usage() as f64);

        let total = self.sys.total_memory();
        let available = self.sys.available_memory();
        let used = self.sys.used_memory();
        let ram = RamStats {
            total_bytes: total,
            used_bytes: used,
            available_bytes: available,
            used_pct: if total > 0 {
                used as f64 / total as f64 * 100.0
            } else {
                0.0
            },
        };

        MonitoringRecord {
            timestamp: clock::now(),
            cpu: CpuStats {
                usage_percent,
                core_count: (self.sys.cpus().len() as u32).max(1),
                load_1: load_average.one_minute,
                load_5: load_average.five_minutes,
                load_15: load_average.fifteen_minutes,
                architecture: std::env::consts::ARCH.to_string(),
            },
            ram,
            disks: sample_disks(),
            network_io: sample_network(),
            load_average,
            process_count: self.sys.processes().len() as u64,
            heartbeat: vec![],
            server_metrics: vec![],
        }
    }
}

fn is_pseudo_filesystem(fs: &str, total_bytes: u64) -> bool {
    let fs = fs.to_ascii_lowercase();
    if fs == "overlay" {
        // Overlay mounts count only when they back a real filesystem.
        return total_bytes == 0;
    }
    PSEUDO_FILESYSTEMS.contains(&fs.as_str())
}

fn sample_disks() -> Vec<DiskSpace> {
    let disks = Disks::new_with_refreshed_list();
    let mut seen = std::collections::HashSet::new();
    let mut out = Vec::new();

    for disk in disks.list() {
        let filesystem = disk.file_system().to_string_lossy().to_string();
        let total = disk.total_space();
        if is_pseudo_filesystem(&filesystem, total) {
            continue;
        }
        let path = disk.mount_point().to_string_lossy().to_string();
        if !seen.insert(path.clone()) {
            continue;
        }
        let available = disk.available_space();
        let used = total.saturating_sub(available);
        out.push(DiskSpace {
            path,
            device: disk.name().to_string_lossy().to_string(),
            filesystem,
            total_bytes: total,
            used_bytes: used,
            available_bytes: available,
            used_pct: if total > 0 {
                Some(used as f64 / total as f64 * 100.0)
            } else {
                None
            },
        });
    }
    out
}

/// Cumulative network counters summed across physical interfaces.
/// /proc/net/dev carries drop counters that sysinfo does not expose;
/// elsewhere the sysinfo totals are used and drops stay zero.
fn sample_network() -> NetworkIo {
    if let Ok(contents) = std::fs::read_to_string("/proc/net/dev") {
        if let Some(io) = parse_proc_net_dev(&contents) {
            return io;
        }
    }

    let networks = Networks::new_with_refreshed_list();
    let mut io = NetworkIo::default();
    for (name, data) in networks.iter() {
        if name == "lo" {
            continue;
        }
        io.bytes_recv += data.total_received();
        io.bytes_sent += data.total_transmitted();
        io.packets_recv += data.total_packets_received();
        io.packets_sent += data.total_packets_transmitted();
        io.errors_in += data.total_errors_on_received();
        io.errors_out += data.total_errors_on_transmitted();
    }
    io
}

fn parse_proc_net_dev(contents: &str) -> Option<NetworkIo> {
    let mut io = NetworkIo::default();
    let mut matched = false;

    // Inter-|   Receive                ...        | Transmit
    //  face |bytes packets errs drop fifo ...     |bytes packets errs drop ...
    for line in contents.lines().skip(2) {
        let Some((iface, rest)) = line.split_once(':') else {
            continue;
        };
        if iface.trim() == "lo" {
            continue;
        }
        let fields: Vec<u64> = rest
            .split_whitespace()
            .filter_map(|s| s.parse().ok())
            .collect();
        if fields.len() < 12 {
            continue;
        }
        io.bytes_recv += fields[0];
        io.packets_recv += fields[1];
        io.errors_in += fields[2];
        io.drops_in += fields[3];
        io.bytes_sent += fields[8];
        io.packets_sent += fields[9];
        io.errors_out += fields[10];
        io.drops_out += fields[11];
        matched = true;
    }

    matched.then_some(io)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sample_produces_plausible_record() {
        let mut sampler = Sampler::new();
        let rec = sampler.sample();

        assert!(rec.cpu.core_count >= 1);
        assert!((0.0..=100.0).contains(&rec.ram.used_pct));
        assert!(rec.ram.total_bytes >= rec.ram.used_bytes);
        assert!(!rec.cpu.architecture.is_empty());
        assert!(rec.heartbeat.is_empty());
        assert!(rec.server_metrics.is_empty());
    }

    #[test]
    fn second_sample_has_cpu_delta() {
        let mut sampler = Sampler::new();
        let _ = sampler.sample();
        std::thread::sleep(std::time::Duration::from_millis(50));
        let rec = sampler.sample();
        assert!((0.0..=100.0).contains(&rec.cpu.usage_percent));
    }

    #[test]
    fn disks_have_consistent_percentages() {
        for disk in sample_disks() {
            assert!(disk.total_bytes > 0 || disk.used_pct.is_none());
            if let Some(pct) = disk.used_pct {
                assert!((0.0..=100.0).contains(&pct));
            }
        }
    }

    #[test]
    fn pseudo_filesystems_are_excluded() {
        assert!(is_pseudo_filesystem("tmpfs", 1024));
        assert!(is_pseudo_filesystem("PROC", 0));
        assert!(!is_pseudo_filesystem("ext4", 1024));
        // overlay only counts when it reports capacity
        assert!(is_pseudo_filesystem("overlay", 0));
        assert!(!is_pseudo_filesystem("overlay", 1 << 30));
    }

    #[test]
    fn proc_net_dev_parsing() {
        let sample = "\
Inter-|   Receive                                                |  Transmit
 face |bytes    packets errs drop fifo frame compressed multicast|bytes    packets errs drop fifo colls carrier compressed
    lo: 1000    10    0    0    0     0          0         0     1000    10    0    0    0     0       0          0
  eth0: 5000    50    1    2    0     0          0         0     7000    70    3    4    0     0       0          0";
        let io = parse_proc_net_dev(sample).unwrap();
        assert_eq!(io.bytes_recv, 5000);
        assert_eq!(io.bytes_sent, 7000);
        assert_eq!(io.packets_recv, 50);
        assert_eq!(io.packets_sent, 70);
        assert_eq!(io.errors_in, 1);
        assert_eq!(io.drops_in, 2);
        assert_eq!(io.errors_out, 3);
        assert_eq!(io.drops_out, 4);
    }

    #[test]
    fn proc_net_dev_skips_loopback() {
        let sample = "\
header
header
    lo: 1000 10 0 0 0 0 0 0 1000 10 0 0 0 0 0 0";
        assert!(parse_proc_net_dev(sample).is_none());
    }
}
