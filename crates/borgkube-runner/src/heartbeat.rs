//! Heartbeat reporting for the borg child.
//!
//! Dedup phases can run for minutes with no output; a 60 s heartbeat line
//! shows the child is alive and what it is doing: CPU delta, I/O delta,
//! resident memory, and a best-effort network bytes delta read from
//! /proc/net/dev (per-pod in a Kubernetes network namespace).

use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Interval between heartbeat lines.
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(60);

/// One /proc sample of the monitored process.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct ProcSample {
    pub cpu_seconds: f64,
    pub io_bytes: u64,
    pub rss_bytes: u64,
    pub net_bytes: u64,
}

/// CPU seconds (utime+stime) from /proc/<pid>/stat. The comm field may
/// contain spaces and parentheses, so parsing anchors on the last ')'.
pub fn parse_stat_cpu(stat: &str, ticks_per_sec: f64) -> Option<f64> {
    let rest = &stat[stat.rfind(')')? + 1..];
    let fields: Vec<&str> = rest.split_whitespace().collect();
    // After comm, utime and stime are fields 12 and 13 (0-based).
    let utime: u64 = fields.get(11)?.parse().ok()?;
    let stime: u64 = fields.get(12)?.parse().ok()?;
    Some((utime + stime) as f64 / ticks_per_sec)
}

/// read_bytes + write_bytes from /proc/<pid>/io.
pub fn parse_io_bytes(io: &str) -> Option<u64> {
    let mut read: Option<u64> = None;
    let mut write: Option<u64> = None;
    for line in io.lines() {
        if let Some(v) = line.strip_prefix("read_bytes:") {
            read = v.trim().parse().ok();
        } else if let Some(v) = line.strip_prefix("write_bytes:") {
            write = v.trim().parse().ok();
        }
    }
    Some(read? + write?)
}

/// VmRSS in bytes from /proc/<pid>/status.
pub fn parse_status_rss(status: &str) -> Option<u64> {
    for line in status.lines() {
        if let Some(v) = line.strip_prefix("VmRSS:") {
            let kb: u64 = v.trim().trim_end_matches("kB").trim().parse().ok()?;
            return Some(kb * 1024);
        }
    }
    None
}

/// Total rx+tx bytes across interfaces (loopback excluded) from
/// /proc/net/dev.
pub fn parse_net_dev_total(netdev: &str) -> Option<u64> {
    let mut total: u64 = 0;
    let mut any = false;
    for line in netdev.lines().skip(2) {
        let (iface, rest) = line.split_once(':')?;
        if iface.trim() == "lo" {
            continue;
        }
        let fields: Vec<&str> = rest.split_whitespace().collect();
        let rx: u64 = fields.first()?.parse().ok()?;
        let tx: u64 = fields.get(8)?.parse().ok()?;
        total += rx + tx;
        any = true;
    }
    any.then_some(total)
}

/// USER_HZ: /proc/<pid>/stat reports cpu time in these ticks. Fixed at 100
/// on Linux.
const CLOCK_TICKS: f64 = 100.0;

/// Take a /proc sample for a pid; `None` once the process is gone.
pub fn sample(pid: u32) -> Option<ProcSample> {
    let stat = std::fs::read_to_string(format!("/proc/{pid}/stat")).ok()?;
    let cpu_seconds = parse_stat_cpu(&stat, CLOCK_TICKS)?;
    // io may be unreadable without privilege; degrade to zero.
    let io_bytes = std::fs::read_to_string(format!("/proc/{pid}/io"))
        .ok()
        .and_then(|s| parse_io_bytes(&s))
        .unwrap_or(0);
    let rss_bytes = std::fs::read_to_string(format!("/proc/{pid}/status"))
        .ok()
        .and_then(|s| parse_status_rss(&s))
        .unwrap_or(0);
    let net_bytes = std::fs::read_to_string("/proc/net/dev")
        .ok()
        .and_then(|s| parse_net_dev_total(&s))
        .unwrap_or(0);
    Some(ProcSample {
        cpu_seconds,
        io_bytes,
        rss_bytes,
        net_bytes,
    })
}

/// Render one heartbeat line from consecutive samples.
pub fn heartbeat_line(prev: &ProcSample, current: &ProcSample) -> String {
    format!(
        "[HEARTBEAT] active | cpu +{:.1}s | io +{:.1}MiB | rss {:.1}MiB | net +{:.1}MiB",
        current.cpu_seconds - prev.cpu_seconds,
        (current.io_bytes.saturating_sub(prev.io_bytes)) as f64 / (1024.0 * 1024.0),
        current.rss_bytes as f64 / (1024.0 * 1024.0),
        (current.net_bytes.saturating_sub(prev.net_bytes)) as f64 / (1024.0 * 1024.0),
    )
}

/// Print a heartbeat line every interval while the child runs.
pub async fn heartbeat_loop(pid: u32, cancel: CancellationToken) {
    let Some(mut prev) = sample(pid) else {
        warn!(pid, "heartbeat: cannot sample process");
        return;
    };
    info!(
        pid,
        rss_mib = format!("{:.1}", prev.rss_bytes as f64 / (1024.0 * 1024.0)),
        "[HEARTBEAT] baseline established"
    );

    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(HEARTBEAT_INTERVAL) => {}
        }
        match sample(pid) {
            Some(current) => {
                info!("{}", heartbeat_line(&prev, &current));
                prev = current;
            }
            None => return, // process exited
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stat_cpu_survives_comm_with_spaces_and_parens() {
        // pid (comm) state ppid pgrp session tty tpgid flags minflt cminflt
        // majflt cmajflt utime stime ...
        let stat = "1234 (borg (create)) S 1 1 1 0 -1 4194560 100 0 0 0 250 150 0 0 20 0 4 0 500 0 0";
        let cpu = parse_stat_cpu(stat, 100.0).unwrap();
        assert!((cpu - 4.0).abs() < 1e-9); // (250+150)/100
    }

    #[test]
    fn stat_cpu_rejects_garbage() {
        assert!(parse_stat_cpu("not a stat line", 100.0).is_none());
        assert!(parse_stat_cpu("1 (x) S 1", 100.0).is_none());
    }

    #[test]
    fn io_sums_read_and_write() {
        let io = "rchar: 999\nwchar: 888\nsyscr: 1\nsyscw: 2\nread_bytes: 1048576\nwrite_bytes: 2097152\ncancelled_write_bytes: 0\n";
        assert_eq!(parse_io_bytes(io), Some(3 * 1024 * 1024));
    }

    #[test]
    fn rss_parses_kb() {
        let status = "Name:\tborg\nVmPeak:\t  200000 kB\nVmRSS:\t  102400 kB\nThreads:\t4\n";
        assert_eq!(parse_status_rss(status), Some(102400 * 1024));
    }

    #[test]
    fn net_dev_sums_non_loopback() {
        let netdev = "\
Inter-|   Receive                                                |  Transmit
 face |bytes    packets errs drop fifo frame compressed multicast|bytes    packets errs drop fifo colls carrier compressed
    lo:  999999    100    0    0    0     0          0         0   999999     100    0    0    0     0       0          0
  eth0: 1000000    500    0    0    0     0          0         0  2000000     400    0    0    0     0       0          0
";
        assert_eq!(parse_net_dev_total(netdev), Some(3_000_000));
    }

    #[test]
    fn heartbeat_line_reports_deltas() {
        let prev = ProcSample {
            cpu_seconds: 10.0,
            io_bytes: 1024 * 1024,
            rss_bytes: 512 * 1024 * 1024,
            net_bytes: 0,
        };
        let current = ProcSample {
            cpu_seconds: 12.5,
            io_bytes: 3 * 1024 * 1024,
            rss_bytes: 512 * 1024 * 1024,
            net_bytes: 10 * 1024 * 1024,
        };
        let line = heartbeat_line(&prev, &current);
        assert!(line.contains("cpu +2.5s"));
        assert!(line.contains("io +2.0MiB"));
        assert!(line.contains("rss 512.0MiB"));
        assert!(line.contains("net +10.0MiB"));
    }

    #[test]
    fn heartbeat_line_survives_counter_reset() {
        let prev = ProcSample {
            io_bytes: 100,
            net_bytes: 100,
            ..Default::default()
        };
        let current = ProcSample::default();
        let line = heartbeat_line(&prev, &current);
        assert!(line.contains("io +0.0MiB"));
    }
}
