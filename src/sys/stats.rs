// src/sys/stats.rs

use async_trait::async_trait;
use std::time::Duration;
use sysinfo::{Disks, System};

use crate::cloud::{CpuStats, SystemStats, UsageStats};
use crate::error::Result;
use crate::sys::traits::StatsSource;

/// CPU usage is the idle/total tick delta across this window.
const CPU_SAMPLE_WINDOW: Duration = Duration::from_millis(100);

#[derive(Default)]
pub struct SysinfoStats;

#[async_trait]
impl StatsSource for SysinfoStats {
    async fn sample(&self) -> Result<SystemStats> {
        let mut sys = System::new();
        sys.refresh_cpu();
        tokio::time::sleep(CPU_SAMPLE_WINDOW).await;
        sys.refresh_cpu();
        sys.refresh_memory();

        let disks = Disks::new_with_refreshed_list();
        let (disk_total, disk_available) = disks
            .list()
            .iter()
            .fold((0u64, 0u64), |(t, a), d| (t + d.total_space(), a + d.available_space()));

        let heap_used = sysinfo::get_current_pid()
            .ok()
            .and_then(|pid| {
                sys.refresh_process(pid);
                sys.process(pid).map(|p| p.memory())
            })
            .unwrap_or(0);

        Ok(SystemStats {
            cpu: CpuStats {
                cores: sys.cpus().len(),
                usage: f64::from(sys.global_cpu_info().cpu_usage()),
            },
            ram: UsageStats {
                total: sys.total_memory(),
                used: sys.used_memory(),
            },
            disk: UsageStats {
                total: disk_total,
                used: disk_total.saturating_sub(disk_available),
            },
            heap: UsageStats {
                total: sys.total_memory(),
                used: heap_used,
            },
            timestamp: chrono::Utc::now().timestamp_millis(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_sample_reports_sane_numbers() {
        let stats = SysinfoStats.sample().await.unwrap();
        assert!(stats.cpu.cores >= 1);
        assert!(stats.ram.used <= stats.ram.total);
        assert!(stats.disk.used <= stats.disk.total);
        assert!(stats.timestamp > 0);
    }
}
