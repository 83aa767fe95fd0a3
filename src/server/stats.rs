//! On-demand telemetry for a running container.

use serde::Serialize;

use crate::error::{DaemonError, Result};

use super::server::Server;

/// One-shot resource snapshot. All byte quantities are unsigned 64-bit;
/// values the runtime does not report come back as zero, never absent.
#[derive(Debug, Clone, Default, Serialize)]
pub struct StatsSnapshot {
    /// Total CPU ticks consumed.
    pub cpu_usage: u64,
    /// CPU shares granted to the container.
    pub cpu_max: u64,
    pub memory_usage: u64,
    pub memory_max: u64,
    pub disk_usage: u64,
    pub disk_max: u64,
    pub status: String,
}

impl Server {
    /// Collect a stats snapshot. Fails unless the container is running.
    pub async fn stats(&self) -> Result<StatsSnapshot> {
        let record = self.record();
        if record.docker_id.is_empty() {
            return Err(DaemonError::invalid_state("stats", "not running"));
        }

        let status = self.docker.inspect(&record.docker_id).await?;
        if !status.running {
            return Err(DaemonError::invalid_state("stats", "not running"));
        }

        let stats = self.docker.stats_once(&record.docker_id).await?;

        let memory_usage = stats.memory_stats.usage.unwrap_or(0);
        let memory_max = stats
            .memory_stats
            .limit
            .unwrap_or(record.resources.memory.max(0) as u64);

        let disk_usage = self
            .docker
            .disk_usage()
            .await
            .ok()
            .and_then(|usage| usage.get(&record.docker_id).copied())
            .unwrap_or(0);

        Ok(StatsSnapshot {
            cpu_usage: stats.cpu_stats.cpu_usage.total_usage,
            cpu_max: record.resources.cpu.max(0) as u64,
            memory_usage,
            memory_max,
            disk_usage,
            disk_max: record.resources.disk,
            status: record.state.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_serializes_every_field() {
        let snapshot = StatsSnapshot {
            cpu_usage: 12,
            cpu_max: 256,
            memory_usage: 1024,
            memory_max: 2048,
            disk_usage: 0,
            disk_max: 0,
            status: "running".into(),
        };

        let value = serde_json::to_value(&snapshot).unwrap();
        for field in [
            "cpu_usage",
            "cpu_max",
            "memory_usage",
            "memory_max",
            "disk_usage",
            "disk_max",
        ] {
            assert!(value[field].is_u64(), "{field} missing");
        }
        assert_eq!(value["status"], "running");
    }
}
