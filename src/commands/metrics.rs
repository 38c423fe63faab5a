use std::sync::{Mutex, OnceLock, PoisonError};
use std::time::Instant;

use tracing::info;

#[derive(Debug, Default, Clone, Copy)]
pub(crate) struct CommandMetrics {
    pub(crate) uptime_s: u64,
    pub(crate) total_commands: u64,
    pub(crate) total_errors: u64,
    pub(crate) total_streams: u64,
}

#[derive(Default)]
struct MetricsState {
    total_commands: u64,
    total_errors: u64,
    total_streams: u64,
}

fn metrics_state() -> &'static Mutex<MetricsState> {
    static METRICS: OnceLock<Mutex<MetricsState>> = OnceLock::new();
    METRICS.get_or_init(|| Mutex::new(MetricsState::default()))
}

fn metrics_start() -> &'static Instant {
    static START: OnceLock<Instant> = OnceLock::new();
    START.get_or_init(Instant::now)
}

pub(crate) fn record_command(success: bool) {
    let mut lock = metrics_state().lock().unwrap_or_else(PoisonError::into_inner);
    lock.total_commands += 1;
    if !success {
        lock.total_errors += 1;
    }
}

pub(crate) fn inc_streams_started() {
    metrics_state()
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .total_streams += 1;
}

pub(crate) fn snapshot_metrics() -> CommandMetrics {
    let lock = metrics_state().lock().unwrap_or_else(PoisonError::into_inner);
    CommandMetrics {
        uptime_s: metrics_start().elapsed().as_secs(),
        total_commands: lock.total_commands,
        total_errors: lock.total_errors,
        total_streams: lock.total_streams,
    }
}

pub(crate) fn log_event(event: &str, client_id: usize, detail: &str) {
    info!(event, client_id, detail, "KERNEL: event");
}
