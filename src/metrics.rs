//! Agent metrics payload
//!
//! Agents expose a JSON document on `GET /metrics`. The collector polls it and
//! flattens it into [`MetricSample`]s, one per metric kind the payload carries.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::model::{MetricKind, MetricSample};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerMetrics {
    pub system: SystemInformation,
    pub memory: MemoryInformation,
    pub cpus: CpuOverview,
    #[serde(default)]
    pub components: Option<ComponentOverview>,
    #[serde(default)]
    pub disks: Vec<DiskInformation>,
    #[serde(default)]
    pub network: Option<NetworkInformation>,
    #[serde(default)]
    pub load_average: Option<LoadAverage>,
    /// Seconds since boot
    #[serde(default)]
    pub uptime: Option<u64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SystemInformation {
    pub name: Option<String>,
    pub kernel_version: Option<String>,
    pub os_version: Option<String>,
    pub host_name: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MemoryInformation {
    pub total: u64,
    pub used: u64,
    pub total_swap: u64,
    pub used_swap: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CpuOverview {
    pub total: usize,
    pub arch: String,
    pub average_usage: f32,
    pub cpus: Vec<CpuInformation>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CpuInformation {
    pub name: String,
    pub frequency: u64,
    pub usage: f32,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ComponentOverview {
    pub average_temperature: Option<f32>,
    pub components: Vec<ComponentInformation>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComponentInformation {
    pub name: String,
    pub temperature: Option<f32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiskInformation {
    pub mount_point: String,
    pub total: u64,
    pub available: u64,
}

/// Bytes transferred since the previous poll
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NetworkInformation {
    pub received: u64,
    pub transmitted: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LoadAverage {
    pub one: f64,
    pub five: f64,
    pub fifteen: f64,
}

fn percentage(part: u64, whole: u64) -> Option<f64> {
    (whole > 0).then(|| part as f64 / whole as f64 * 100.0)
}

impl ServerMetrics {
    /// Memory in use, in percent of total
    pub fn memory_usage(&self) -> Option<f64> {
        percentage(self.memory.used, self.memory.total)
    }

    /// Used space over all disks, in percent of total
    pub fn disk_usage(&self) -> Option<f64> {
        let (used, total) = self.disks.iter().fold((0u64, 0u64), |(used, total), disk| {
            (
                used.saturating_add(disk.total.saturating_sub(disk.available)),
                total.saturating_add(disk.total),
            )
        });
        percentage(used, total)
    }

    /// Flatten the payload into one sample per available metric kind
    pub fn to_samples(&self, server_id: &str, timestamp: DateTime<Utc>) -> Vec<MetricSample> {
        let readings = [
            (MetricKind::CpuUsage, Some(f64::from(self.cpus.average_usage))),
            (MetricKind::MemoryUsage, self.memory_usage()),
            (MetricKind::DiskUsage, self.disk_usage()),
            (MetricKind::NetworkIn, self.network.as_ref().map(|n| n.received as f64)),
            (MetricKind::NetworkOut, self.network.as_ref().map(|n| n.transmitted as f64)),
            (MetricKind::LoadAverage, self.load_average.as_ref().map(|l| l.one)),
            (MetricKind::Uptime, self.uptime.map(|u| u as f64)),
        ];

        readings
            .into_iter()
            .filter_map(|(metric, value)| {
                value.map(|value| MetricSample {
                    server_id: server_id.to_string(),
                    metric,
                    value,
                    timestamp,
                })
            })
            .collect()
    }
}
