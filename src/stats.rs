//! Server statistics.
//!
//! One aggregate behind a dedicated mutex, mutated only through typed
//! observation methods. Readers get a snapshot, never a live reference.
//! Per-job wall times feed an exponential moving average rather than a
//! lifetime mean, so the estimate tracks current load.

use chrono::{DateTime, Utc};
use codeforge_protocol::ServerStatsPayload;
use serde::Serialize;
use std::sync::Mutex;

/// Smoothing factor for the moving averages.
const EMA_ALPHA: f64 = 0.2;

#[derive(Debug, Default, Clone, Serialize)]
struct StatsInner {
    total_sessions: u32,
    active_sessions: u32,
    total_jobs: u32,
    active_jobs: u32,
    completed_jobs: u32,
    failed_jobs: u32,
    cancelled_jobs: u32,
    timed_out_jobs: u32,
    bytes_received: u64,
    bytes_sent: u64,
    avg_job_secs: f64,
    successful_compilations: u32,
    failed_compilations: u32,
    successful_executions: u32,
    failed_executions: u32,
    avg_compile_secs: f64,
    avg_execution_secs: f64,
}

/// Point-in-time copy of the aggregate.
#[derive(Debug, Clone, Serialize)]
pub struct StatsSnapshot {
    pub started_at: DateTime<Utc>,
    pub total_sessions: u32,
    pub active_sessions: u32,
    pub total_jobs: u32,
    pub active_jobs: u32,
    pub completed_jobs: u32,
    pub failed_jobs: u32,
    pub cancelled_jobs: u32,
    pub timed_out_jobs: u32,
    pub bytes_received: u64,
    pub bytes_sent: u64,
    pub avg_job_secs: f64,
    pub successful_compilations: u32,
    pub failed_compilations: u32,
    pub successful_executions: u32,
    pub failed_executions: u32,
    pub avg_compile_secs: f64,
    pub avg_execution_secs: f64,
}

impl StatsSnapshot {
    /// Project onto the wire statistics payload.
    pub fn to_wire(&self) -> ServerStatsPayload {
        ServerStatsPayload {
            start_time: self.started_at.timestamp(),
            current_time: Utc::now().timestamp(),
            total_clients: self.total_sessions,
            active_clients: self.active_sessions,
            total_jobs: self.total_jobs,
            active_jobs: self.active_jobs,
            completed_jobs: self.completed_jobs,
            failed_jobs: self.failed_jobs,
            total_bytes_received: self.bytes_received,
            total_bytes_sent: self.bytes_sent,
            memory_usage_kb: 0,
            cpu_usage_percent: 0.0,
            avg_response_time_ms: (self.avg_job_secs * 1000.0) as f32,
        }
    }
}

/// Terminal disposition of a job, for accounting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobDisposition {
    Completed,
    Failed,
    Cancelled,
    TimedOut,
}

/// The shared statistics aggregate.
#[derive(Debug)]
pub struct ServerStats {
    started_at: DateTime<Utc>,
    inner: Mutex<StatsInner>,
}

impl ServerStats {
    pub fn new() -> Self {
        Self {
            started_at: Utc::now(),
            inner: Mutex::new(StatsInner::default()),
        }
    }

    pub fn session_connected(&self) {
        let mut inner = self.lock();
        inner.total_sessions += 1;
        inner.active_sessions += 1;
    }

    pub fn session_disconnected(&self) {
        let mut inner = self.lock();
        inner.active_sessions = inner.active_sessions.saturating_sub(1);
    }

    pub fn job_submitted(&self) {
        let mut inner = self.lock();
        inner.total_jobs += 1;
        inner.active_jobs += 1;
    }

    /// Record a job reaching a terminal state after `wall_secs` of wall time.
    pub fn job_finished(&self, disposition: JobDisposition, wall_secs: f64) {
        let mut inner = self.lock();
        inner.active_jobs = inner.active_jobs.saturating_sub(1);
        match disposition {
            JobDisposition::Completed => inner.completed_jobs += 1,
            JobDisposition::Failed => inner.failed_jobs += 1,
            JobDisposition::Cancelled => inner.cancelled_jobs += 1,
            JobDisposition::TimedOut => inner.timed_out_jobs += 1,
        }
        inner.avg_job_secs = ema(inner.avg_job_secs, wall_secs);
    }

    pub fn add_bytes(&self, received: u64, sent: u64) {
        let mut inner = self.lock();
        inner.bytes_received += received;
        inner.bytes_sent += sent;
    }

    pub fn record_compile(&self, success: bool, wall_secs: f64) {
        let mut inner = self.lock();
        if success {
            inner.successful_compilations += 1;
        } else {
            inner.failed_compilations += 1;
        }
        inner.avg_compile_secs = ema(inner.avg_compile_secs, wall_secs);
    }

    pub fn record_execution(&self, success: bool, wall_secs: f64) {
        let mut inner = self.lock();
        if success {
            inner.successful_executions += 1;
        } else {
            inner.failed_executions += 1;
        }
        inner.avg_execution_secs = ema(inner.avg_execution_secs, wall_secs);
    }

    /// Mean job wall time, for queue wait estimates.
    pub fn mean_job_secs(&self) -> f64 {
        self.lock().avg_job_secs
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        let inner = self.lock().clone();
        StatsSnapshot {
            started_at: self.started_at,
            total_sessions: inner.total_sessions,
            active_sessions: inner.active_sessions,
            total_jobs: inner.total_jobs,
            active_jobs: inner.active_jobs,
            completed_jobs: inner.completed_jobs,
            failed_jobs: inner.failed_jobs,
            cancelled_jobs: inner.cancelled_jobs,
            timed_out_jobs: inner.timed_out_jobs,
            bytes_received: inner.bytes_received,
            bytes_sent: inner.bytes_sent,
            avg_job_secs: inner.avg_job_secs,
            successful_compilations: inner.successful_compilations,
            failed_compilations: inner.failed_compilations,
            successful_executions: inner.successful_executions,
            failed_executions: inner.failed_executions,
            avg_compile_secs: inner.avg_compile_secs,
            avg_execution_secs: inner.avg_execution_secs,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, StatsInner> {
        // A poisoned stats mutex only means a worker died mid-increment;
        // the counters are still usable.
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Default for ServerStats {
    fn default() -> Self {
        Self::new()
    }
}

fn ema(current: f64, sample: f64) -> f64 {
    if current == 0.0 {
        sample
    } else {
        current * (1.0 - EMA_ALPHA) + sample * EMA_ALPHA
    }
}
