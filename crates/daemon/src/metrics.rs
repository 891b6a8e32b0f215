//! Metrics module for vidrelay
//!
//! Provides structs for job metrics, system metrics, and metrics snapshots
//! with JSON serialization support.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::RwLock;

/// Per-job metrics for jobs the local worker is handling
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JobMetrics {
    pub id: String,
    pub stage: String,
    pub source_extension: String,
    pub attempts: u32,
    pub crf: Option<u8>,
    pub codec: Option<String>,
    pub output_bytes: Option<u64>,
}

impl JobMetrics {
    pub fn new(id: impl Into<String>, stage: impl Into<String>, source_extension: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            stage: stage.into(),
            source_extension: source_extension.into(),
            attempts: 0,
            crf: None,
            codec: None,
            output_bytes: None,
        }
    }
}

/// System-level metrics for resource monitoring
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct SystemMetrics {
    pub cpu_usage_percent: f32,
    pub mem_usage_percent: f32,
    pub load_avg_1: f32,
    pub load_avg_5: f32,
    pub load_avg_15: f32,
}

/// Complete metrics snapshot including jobs, system, and aggregate stats
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct MetricsSnapshot {
    pub timestamp_unix_ms: i64,
    pub jobs: Vec<JobMetrics>,
    pub system: SystemMetrics,
    pub queue_len: usize,
    pub running_jobs: usize,
    pub completed_jobs: u64,
    pub failed_jobs: u64,
    /// Jobs accepted by the remote worker
    pub remote_jobs: u64,
    pub total_bytes_delivered: u64,
}

impl MetricsSnapshot {
    /// Insert or replace the entry for `job.id`.
    pub fn upsert_job(&mut self, job: JobMetrics) {
        match self.jobs.iter_mut().find(|j| j.id == job.id) {
            Some(existing) => *existing = job,
            None => self.jobs.push(job),
        }
        self.running_jobs = self.jobs.len();
    }

    pub fn remove_job(&mut self, id: &str) {
        self.jobs.retain(|j| j.id != id);
        self.running_jobs = self.jobs.len();
    }
}

/// Shared metrics state for concurrent access across daemon components
pub type SharedMetrics = Arc<RwLock<MetricsSnapshot>>;

/// Creates a new SharedMetrics instance with default values
pub fn new_shared_metrics() -> SharedMetrics {
    Arc::new(RwLock::new(MetricsSnapshot::default()))
}

/// Collects current system metrics using sysinfo
pub fn collect_system_metrics() -> SystemMetrics {
    use sysinfo::System;

    let mut sys = System::new();
    sys.refresh_cpu_usage();
    sys.refresh_memory();

    let cpu_usage = sys.global_cpu_usage();
    let total_memory = sys.total_memory();
    let used_memory = sys.used_memory();
    let mem_usage = if total_memory > 0 {
        (used_memory as f64 / total_memory as f64 * 100.0) as f32
    } else {
        0.0
    };

    let load_avg = System::load_average();

    SystemMetrics {
        cpu_usage_percent: cpu_usage,
        mem_usage_percent: mem_usage,
        load_avg_1: load_avg.one as f32,
        load_avg_5: load_avg.five as f32,
        load_avg_15: load_avg.fifteen as f32,
    }
}

/// Current wall-clock time in milliseconds since the Unix epoch
pub fn timestamp_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}
