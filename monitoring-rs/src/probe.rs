//! Sources of the periodically polled metrics.

use std::sync::Mutex;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sysinfo::System;

/// Source-level gauges reported by whoever owns the source's queues.
#[async_trait]
pub trait SourceProbe: Send + Sync {
    /// Items waiting for (re)processing.
    async fn queue_size(&self) -> u64;

    /// Share of snapshot lookups served from cache, in [0, 1].
    async fn cache_hit_rate(&self) -> f64;
}

/// Current host resource usage
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct HostUsage {
    /// RAM usage percentage (0-100)
    pub memory_usage_percent: f64,
    /// Overall CPU usage percentage (0-100)
    pub cpu_usage_percent: f64,
}

pub trait HostProbe: Send + Sync {
    fn sample(&self) -> HostUsage;
}

/// Host probe backed by `sysinfo`.
pub struct SystemProbe {
    system: Mutex<System>,
}

impl SystemProbe {
    pub fn new() -> Self {
        let mut system = System::new();
        system.refresh_memory();
        system.refresh_cpu_usage();
        Self {
            system: Mutex::new(system),
        }
    }
}

impl Default for SystemProbe {
    fn default() -> Self {
        Self::new()
    }
}

impl HostProbe for SystemProbe {
    fn sample(&self) -> HostUsage {
        let mut system = self
            .system
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        system.refresh_memory();
        system.refresh_cpu_usage();

        let total = system.total_memory();
        let memory_usage_percent = if total > 0 {
            system.used_memory() as f64 / total as f64 * 100.0
        } else {
            0.0
        };

        HostUsage {
            memory_usage_percent,
            cpu_usage_percent: f64::from(system.global_cpu_usage()),
        }
    }
}

/// Host probe returning fixed values, for hosts where sampling is unwanted.
#[derive(Debug, Clone, Copy, Default)]
pub struct StaticHostProbe(pub HostUsage);

impl HostProbe for StaticHostProbe {
    fn sample(&self) -> HostUsage {
        self.0
    }
}
