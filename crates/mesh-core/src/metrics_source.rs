//! System metrics consumed by heartbeats; collection internals live outside
//! this crate's scope, only this thin capability trait does not.

use sysinfo::{CpuExt, DiskExt, System, SystemExt};

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemMetrics {
    pub cpu_usage_pct: f64,
    pub memory_usage_pct: f64,
    pub disk_usage_pct: f64,
}

pub trait MetricsSource: Send + Sync {
    fn sample(&self) -> SystemMetrics;
}

pub struct SysinfoMetricsSource {
    system: parking_lot::Mutex<System>,
}

impl Default for SysinfoMetricsSource {
    fn default() -> Self {
        Self {
            system: parking_lot::Mutex::new(System::new_all()),
        }
    }
}

impl MetricsSource for SysinfoMetricsSource {
    fn sample(&self) -> SystemMetrics {
        let mut system = self.system.lock();
        system.refresh_cpu();
        system.refresh_memory();
        system.refresh_disks();

        let cpu_usage_pct = if system.cpus().is_empty() {
            0.0
        } else {
            let sum: f32 = system.cpus().iter().map(|c| c.cpu_usage()).sum();
            (sum / system.cpus().len() as f32) as f64
        };

        let memory_usage_pct = if system.total_memory() == 0 {
            0.0
        } else {
            system.used_memory() as f64 / system.total_memory() as f64 * 100.0
        };

        let (used, total) = system
            .disks()
            .iter()
            .fold((0u64, 0u64), |(used, total), disk| {
                (used + (disk.total_space() - disk.available_space()), total + disk.total_space())
            });
        let disk_usage_pct = if total == 0 { 0.0 } else { used as f64 / total as f64 * 100.0 };

        SystemMetrics {
            cpu_usage_pct,
            memory_usage_pct,
            disk_usage_pct,
        }
    }
}

#[derive(Default)]
pub struct NullMetricsSource;

impl MetricsSource for NullMetricsSource {
    fn sample(&self) -> SystemMetrics {
        SystemMetrics::default()
    }
}
