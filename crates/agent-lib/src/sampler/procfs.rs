//! procfs counter source
//!
//! Reads system-wide counters from the proc filesystem:
//! - /proc/stat for the aggregate CPU time buckets
//! - /proc/net/dev for per-interface byte counters

use super::CounterSource;
use crate::error::{ControlError, ControlResult};
use crate::models::{CpuTicks, NetBytes};
use async_trait::async_trait;
use std::path::PathBuf;
use tokio::fs;

/// Counter source backed by /proc
pub struct ProcfsSource {
    proc_path: PathBuf,
    /// Only count this interface; all non-loopback interfaces when `None`
    interface: Option<String>,
}

impl ProcfsSource {
    /// Create a source reading from the given proc root
    pub fn new(proc_path: impl Into<PathBuf>) -> Self {
        Self {
            proc_path: proc_path.into(),
            interface: None,
        }
    }

    /// Restrict network counters to a single interface
    pub fn with_interface(mut self, interface: impl Into<String>) -> Self {
        self.interface = Some(interface.into());
        self
    }

    /// Parse the aggregate `cpu` line of /proc/stat
    ///
    /// Only the first seven buckets are used; steal/guest columns are ignored.
    pub fn parse_proc_stat(content: &str) -> ControlResult<CpuTicks> {
        let line = content
            .lines()
            .find(|l| l.split_whitespace().next() == Some("cpu"))
            .ok_or_else(|| {
                ControlError::MeasurementUnavailable("no aggregate cpu line in stat".to_string())
            })?;

        let values: Vec<u64> = line
            .split_whitespace()
            .skip(1)
            .take(7)
            .map(|v| v.parse::<u64>())
            .collect::<Result<_, _>>()
            .map_err(|e| {
                ControlError::MeasurementUnavailable(format!("malformed cpu line: {e}"))
            })?;

        if values.len() < 4 {
            return Err(ControlError::MeasurementUnavailable(format!(
                "cpu line has {} buckets, expected at least 4",
                values.len()
            )));
        }

        let bucket = |i: usize| values.get(i).copied().unwrap_or(0);
        Ok(CpuTicks {
            user: bucket(0),
            nice: bucket(1),
            system: bucket(2),
            idle: bucket(3),
            iowait: bucket(4),
            irq: bucket(5),
            softirq: bucket(6),
        })
    }

    /// Parse /proc/net/dev and sum the byte counters
    ///
    /// With `interface` set only that interface is counted, otherwise every
    /// interface except `lo`.
    pub fn parse_net_dev(content: &str, interface: Option<&str>) -> ControlResult<NetBytes> {
        let mut totals = NetBytes::default();
        let mut matched = false;

        for line in content.lines() {
            let Some((name, counters)) = line.split_once(':') else {
                continue;
            };
            let name = name.trim();

            let wanted = match interface {
                Some(iface) => name == iface,
                None => name != "lo",
            };
            if !wanted {
                continue;
            }

            let fields: Vec<&str> = counters.split_whitespace().collect();
            if fields.len() < 9 {
                continue;
            }
            let rx: u64 = fields[0].parse().unwrap_or(0);
            let tx: u64 = fields[8].parse().unwrap_or(0);

            totals.rx_bytes = totals.rx_bytes.saturating_add(rx);
            totals.tx_bytes = totals.tx_bytes.saturating_add(tx);
            matched = true;
        }

        if let Some(iface) = interface {
            if !matched {
                return Err(ControlError::MeasurementUnavailable(format!(
                    "interface {iface} not present in net/dev"
                )));
            }
        }

        Ok(totals)
    }

    async fn read(&self, relative: &str) -> ControlResult<String> {
        let path = self.proc_path.join(relative);
        fs::read_to_string(&path).await.map_err(|e| {
            ControlError::MeasurementUnavailable(format!("failed to read {}: {e}", path.display()))
        })
    }
}

#[async_trait]
impl CounterSource for ProcfsSource {
    async fn read_cpu(&self) -> ControlResult<CpuTicks> {
        let content = self.read("stat").await?;
        Self::parse_proc_stat(&content)
    }

    async fn read_net(&self) -> ControlResult<NetBytes> {
        let content = self.read("net/dev").await?;
        Self::parse_net_dev(&content, self.interface.as_deref())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_proc_stat() {
        let content = "cpu  4705 150 1120 16250 520 30 45 0 0 0\n\
                       cpu0 1393 70 307 4000 100 10 20 0 0 0\n\
                       intr 114930548 113199788 3 0 5 263 0 4\n";
        let ticks = ProcfsSource::parse_proc_stat(content).unwrap();
        assert_eq!(ticks.user, 4705);
        assert_eq!(ticks.nice, 150);
        assert_eq!(ticks.system, 1120);
        assert_eq!(ticks.idle, 16250);
        assert_eq!(ticks.iowait, 520);
        assert_eq!(ticks.irq, 30);
        assert_eq!(ticks.softirq, 45);
    }

    #[test]
    fn test_parse_proc_stat_short_line() {
        // Old kernels only expose four buckets
        let ticks = ProcfsSource::parse_proc_stat("cpu 10 0 5 85\n").unwrap();
        assert_eq!(ticks.idle, 85);
        assert_eq!(ticks.iowait, 0);
        assert_eq!(ticks.total(), 100);
    }

    #[test]
    fn test_parse_proc_stat_missing_cpu_line() {
        let result = ProcfsSource::parse_proc_stat("cpu0 1 2 3 4 5 6 7\n");
        assert!(matches!(
            result,
            Err(ControlError::MeasurementUnavailable(_))
        ));
    }

    #[test]
    fn test_parse_net_dev_excludes_loopback() {
        let content = r#"Inter-|   Receive                                                |  Transmit
 face |bytes    packets errs drop fifo frame compressed multicast|bytes    packets errs drop fifo colls carrier compressed
    lo: 5000000   1000    0    0    0     0          0         0  5000000   1000    0    0    0     0       0          0
  eth0: 1000000   2000    0    0    0     0          0         0   250000   1500    0    0    0     0       0          0
  eth1:  500000    100    0    0    0     0          0         0   250000    100    0    0    0     0       0          0
"#;
        let totals = ProcfsSource::parse_net_dev(content, None).unwrap();
        assert_eq!(totals.rx_bytes, 1_500_000);
        assert_eq!(totals.tx_bytes, 500_000);

        let eth0 = ProcfsSource::parse_net_dev(content, Some("eth0")).unwrap();
        assert_eq!(eth0.rx_bytes, 1_000_000);
        assert_eq!(eth0.tx_bytes, 250_000);
    }

    #[test]
    fn test_parse_net_dev_unknown_interface() {
        let content = "  eth0: 1 2 0 0 0 0 0 0 3 4 0 0 0 0 0 0\n";
        assert!(ProcfsSource::parse_net_dev(content, Some("wlan0")).is_err());
    }

    #[test]
    fn test_parse_net_dev_no_space_after_colon() {
        let content = "  eth0:123456789 2 0 0 0 0 0 0 42 4 0 0 0 0 0 0\n";
        let totals = ProcfsSource::parse_net_dev(content, None).unwrap();
        assert_eq!(totals.rx_bytes, 123_456_789);
        assert_eq!(totals.tx_bytes, 42);
    }
}
