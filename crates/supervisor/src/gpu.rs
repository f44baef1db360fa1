use std::future::Future;
use serde::Serialize;
use tokio::process::Command;

/// One row of the GPU inventory
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GpuInfo {
    pub name: String,
    pub pci: String,
    pub driver: String,
    pub used: i64,
    pub total: i64,
}

/// Live GPU inventory, consulted when an out-of-memory or no-device signature shows up
pub trait GpuInventory: Send + Sync {
    fn query(&self) -> impl Future<Output = Vec<GpuInfo>> + Send;
}

/// Inventory backed by `nvidia-smi`. A missing tool or driver reads as "no GPUs".
#[derive(Debug, Clone, Default)]
pub struct NvidiaSmi;

impl GpuInventory for NvidiaSmi {
    async fn query(&self) -> Vec<GpuInfo> {
        use log::debug;

        let output = Command::new("nvidia-smi")
            .arg("--query-gpu=utilization.memory,memory.total,name,pci.bus_id,driver_version")
            .arg("--format=csv,noheader,nounits")
            .output()
            .await;

        match output {
            Ok(out) if out.status.success() => parse_inventory(&String::from_utf8_lossy(&out.stdout)),
            Ok(out) => {
                debug!("nvidia-smi exited with {}", out.status);
                Vec::new()
            }
            Err(e) => {
                debug!("nvidia-smi unavailable: {}", e);
                Vec::new()
            }
        }
    }
}

/// Fixed inventory, for hosts without a query tool and for tests
#[derive(Debug, Clone, Default)]
pub struct StaticInventory(pub Vec<GpuInfo>);

impl GpuInventory for StaticInventory {
    async fn query(&self) -> Vec<GpuInfo> {
        self.0.clone()
    }
}

/// Parse `nvidia-smi --format=csv,noheader,nounits` rows of
/// `used,total,name,pci,driver`. Rows with fewer than five fields are skipped.
pub fn parse_inventory(text: &str) -> Vec<GpuInfo> {
    text.lines()
        .filter_map(|line| {
            let row = line.replace(' ', "");
            let fields: Vec<&str> = row.split(',').collect();
            if fields.len() < 5 {
                return None;
            }
            Some(GpuInfo {
                used: fields[0].parse().unwrap_or(0),
                total: fields[1].parse().unwrap_or(0),
                name: fields[2].to_string(),
                pci: fields[3].to_string(),
                driver: fields[4].to_string(),
            })
        })
        .collect()
}
