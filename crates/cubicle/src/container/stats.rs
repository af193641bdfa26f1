//! Resource accounting derived from single daemon stats snapshots.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde::{Deserialize, Serialize};

use super::error::ContainerResult;
use super::{ContainerRuntimeApi, RawStats};

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct MemoryUsage {
    pub usage_bytes: u64,
    pub limit_bytes: u64,
    pub percent: f64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InterfaceUsage {
    pub rx_bytes: u64,
    pub tx_bytes: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkUsage {
    pub interfaces: BTreeMap<String, InterfaceUsage>,
    pub rx_bytes: u64,
    pub tx_bytes: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiskIo {
    pub read_bytes: u64,
    pub write_bytes: u64,
}

/// Everything derived from one snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContainerStats {
    pub container_id: String,
    pub cpu_percent: f64,
    pub memory: MemoryUsage,
    pub network: NetworkUsage,
    pub disk_io: DiskIo,
    pub sampled_at: DateTime<Utc>,
}

/// Per-container failure while sampling a fleet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatsFailure {
    pub container_id: String,
    pub error: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FleetStatsReport {
    pub stats: Vec<ContainerStats>,
    pub errors: Vec<StatsFailure>,
}

/// `(Δcontainer / Δsystem) × cpus × 100`; zero when either delta is not positive.
pub fn calculate_cpu_percent(stats: &RawStats) -> f64 {
    let cpu_delta = stats
        .cpu_stats
        .cpu_usage
        .total_usage
        .checked_sub(stats.precpu_stats.cpu_usage.total_usage)
        .unwrap_or(0);
    let system_delta = stats
        .cpu_stats
        .system_cpu_usage
        .unwrap_or(0)
        .checked_sub(stats.precpu_stats.system_cpu_usage.unwrap_or(0))
        .unwrap_or(0);

    if cpu_delta == 0 || system_delta == 0 {
        return 0.0;
    }

    let online_cpus = stats
        .cpu_stats
        .online_cpus
        .filter(|n| *n > 0)
        .or_else(|| {
            stats
                .cpu_stats
                .cpu_usage
                .percpu_usage
                .as_ref()
                .map(|per_cpu| per_cpu.len() as u64)
                .filter(|n| *n > 0)
        })
        .unwrap_or(1);

    (cpu_delta as f64 / system_delta as f64) * online_cpus as f64 * 100.0
}

pub fn calculate_memory_percent(stats: &RawStats) -> f64 {
    read_memory_usage(stats).percent
}

pub fn read_memory_usage(stats: &RawStats) -> MemoryUsage {
    let usage_bytes = stats.memory_stats.usage.unwrap_or(0);
    let limit_bytes = stats.memory_stats.limit.unwrap_or(0);
    let percent = if limit_bytes > 0 {
        usage_bytes as f64 / limit_bytes as f64 * 100.0
    } else {
        0.0
    };

    MemoryUsage {
        usage_bytes,
        limit_bytes,
        percent,
    }
}

pub fn read_network_usage(stats: &RawStats) -> NetworkUsage {
    let mut usage = NetworkUsage::default();
    for (name, counters) in stats.networks.iter().flatten() {
        usage.rx_bytes = usage.rx_bytes.saturating_add(counters.rx_bytes);
        usage.tx_bytes = usage.tx_bytes.saturating_add(counters.tx_bytes);
        usage.interfaces.insert(
            name.clone(),
            InterfaceUsage {
                rx_bytes: counters.rx_bytes,
                tx_bytes: counters.tx_bytes,
            },
        );
    }
    usage
}

/// Sum `Read`/`Write` entries of the recursive block-I/O list.
pub fn read_disk_io(stats: &RawStats) -> DiskIo {
    let mut io = DiskIo::default();
    for entry in stats
        .blkio_stats
        .io_service_bytes_recursive
        .iter()
        .flatten()
    {
        if entry.op.eq_ignore_ascii_case("read") {
            io.read_bytes = io.read_bytes.saturating_add(entry.value);
        } else if entry.op.eq_ignore_ascii_case("write") {
            io.write_bytes = io.write_bytes.saturating_add(entry.value);
        }
    }
    io
}

/// Stateless sampler: every call takes one fresh snapshot.
#[derive(Clone)]
pub struct ResourceMonitor {
    runtime: Arc<dyn ContainerRuntimeApi>,
}

impl ResourceMonitor {
    pub fn new(runtime: Arc<dyn ContainerRuntimeApi>) -> Self {
        Self { runtime }
    }

    pub async fn get_container_stats(&self, container_id: &str) -> ContainerResult<ContainerStats> {
        let raw = self.runtime.stats(container_id).await?;
        Ok(ContainerStats {
            container_id: container_id.to_string(),
            cpu_percent: calculate_cpu_percent(&raw),
            memory: read_memory_usage(&raw),
            network: read_network_usage(&raw),
            disk_io: read_disk_io(&raw),
            sampled_at: Utc::now(),
        })
    }

    pub async fn get_memory_usage(&self, container_id: &str) -> ContainerResult<MemoryUsage> {
        Ok(read_memory_usage(&self.runtime.stats(container_id).await?))
    }

    pub async fn get_network_usage(&self, container_id: &str) -> ContainerResult<NetworkUsage> {
        Ok(read_network_usage(&self.runtime.stats(container_id).await?))
    }

    pub async fn get_disk_io(&self, container_id: &str) -> ContainerResult<DiskIo> {
        Ok(read_disk_io(&self.runtime.stats(container_id).await?))
    }

    /// Sample every container concurrently; failures are reported per container.
    pub async fn collect_fleet_stats<I, S>(&self, container_ids: I) -> FleetStatsReport
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let ids: Vec<String> = container_ids
            .into_iter()
            .map(|id| id.as_ref().to_string())
            .collect();
        let results = join_all(ids.iter().map(|id| self.get_container_stats(id))).await;

        let mut report = FleetStatsReport::default();
        for (id, result) in ids.into_iter().zip(results) {
            match result {
                Ok(stats) => report.stats.push(stats),
                Err(e) => report.errors.push(StatsFailure {
                    container_id: id,
                    error: e.to_string(),
                }),
            }
        }
        report
    }
}
