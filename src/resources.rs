use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use serde::Serialize;
use sysinfo::System;
use tracing::{debug, info, warn};

pub const MB: u64 = 1024 * 1024;

const CRITICAL_BELOW: u64 = 64 * MB;
const HIGH_BELOW: u64 = 128 * MB;
const MEDIUM_BELOW: u64 = 256 * MB;

const ALLOCATION_SAFETY_MARGIN: u64 = 100 * MB;
const MIN_FREE_AFTER_ALLOC: u64 = 500 * MB;

const BYTES_PER_CONTEXT_TOKEN: u64 = 4 * 1024;
const MIN_CONTEXT: u64 = 512;
const MAX_CONTEXT: u64 = 32768;

const MAX_MODEL_SHARE: f64 = 0.6;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MemoryPressure {
    Low,
    Medium,
    High,
    Critical,
}

impl MemoryPressure {
    pub fn from_available(available: u64) -> Self {
        if available < CRITICAL_BELOW {
            Self::Critical
        } else if available < HIGH_BELOW {
            Self::High
        } else if available < MEDIUM_BELOW {
            Self::Medium
        } else {
            Self::Low
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
            Self::Critical => "critical",
        }
    }
}

/// Where memory figures come from. Both values are in bytes.
pub trait MemoryProbe: Send + Sync {
    fn total_memory(&self) -> u64;
    fn available_memory(&self) -> u64;
}

/// Reads the OS through sysinfo on every call. Available memory follows the
/// kernel's MemAvailable estimate.
pub struct SystemMemoryProbe {
    system: Mutex<System>,
}

impl SystemMemoryProbe {
    pub fn new() -> Self {
        Self {
            system: Mutex::new(System::new()),
        }
    }
}

impl Default for SystemMemoryProbe {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryProbe for SystemMemoryProbe {
    fn total_memory(&self) -> u64 {
        let mut system = self.system.lock().unwrap_or_else(PoisonError::into_inner);
        system.refresh_memory();
        system.total_memory()
    }

    fn available_memory(&self) -> u64 {
        let mut system = self.system.lock().unwrap_or_else(PoisonError::into_inner);
        system.refresh_memory();
        system.available_memory()
    }
}

/// Host-supplied figures. Hosts that already track memory feed them here.
#[derive(Debug, Default)]
pub struct FixedMemoryProbe {
    total: AtomicU64,
    available: AtomicU64,
}

impl FixedMemoryProbe {
    pub fn new(total: u64, available: u64) -> Self {
        Self {
            total: AtomicU64::new(total),
            available: AtomicU64::new(available),
        }
    }

    pub fn set_available(&self, bytes: u64) {
        self.available.store(bytes, Ordering::SeqCst);
    }

    pub fn set_total(&self, bytes: u64) {
        self.total.store(bytes, Ordering::SeqCst);
    }
}

impl MemoryProbe for FixedMemoryProbe {
    fn total_memory(&self) -> u64 {
        self.total.load(Ordering::SeqCst)
    }

    fn available_memory(&self) -> u64 {
        self.available.load(Ordering::SeqCst)
    }
}

impl<P: MemoryProbe + ?Sized> MemoryProbe for Arc<P> {
    fn total_memory(&self) -> u64 {
        (**self).total_memory()
    }

    fn available_memory(&self) -> u64 {
        (**self).available_memory()
    }
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct MemorySnapshot {
    pub total: u64,
    pub available: u64,
    pub used: u64,
    pub model: u64,
    pub context: u64,
    pub pressure: MemoryPressure,
}

#[derive(Debug, Default)]
struct Ledger {
    model: u64,
    context: u64,
}

pub type PressureCallback = Arc<dyn Fn(MemoryPressure) + Send + Sync>;

/// Memory sampling, pressure classification and admission control. One
/// instance per process, shared by `Arc` with the engine.
pub struct ResourceMonitor {
    probe: Box<dyn MemoryProbe>,
    ledger: Mutex<Ledger>,
    pressure_callback: Mutex<Option<PressureCallback>>,
}

impl ResourceMonitor {
    pub fn new(probe: Box<dyn MemoryProbe>) -> Self {
        let monitor = Self {
            probe,
            ledger: Mutex::new(Ledger::default()),
            pressure_callback: Mutex::new(None),
        };
        info!(
            total_mb = monitor.total_memory() / MB,
            available_mb = monitor.available_memory() / MB,
            "MEMORY: monitor initialized"
        );
        monitor
    }

    pub fn system() -> Self {
        Self::new(Box::new(SystemMemoryProbe::new()))
    }

    pub fn total_memory(&self) -> u64 {
        self.probe.total_memory()
    }

    pub fn available_memory(&self) -> u64 {
        self.probe.available_memory()
    }

    pub fn pressure(&self) -> MemoryPressure {
        MemoryPressure::from_available(self.available_memory())
    }

    /// Both the safety margin and the post-allocation floor must hold.
    pub fn can_allocate(&self, bytes: u64) -> bool {
        let available = self.available_memory();
        if available < bytes.saturating_add(ALLOCATION_SAFETY_MARGIN) {
            warn!(
                bytes,
                available_mb = available / MB,
                "MEMORY: allocation refused, safety margin not met"
            );
            return false;
        }
        if available - bytes < MIN_FREE_AFTER_ALLOC {
            warn!(bytes, "MEMORY: allocation refused, would leave less than 500MB free");
            return false;
        }
        debug!(
            needed_mb = bytes / MB,
            available_mb = available / MB,
            "MEMORY: allocation check passed"
        );
        true
    }

    pub fn recommended_context_size(&self) -> usize {
        let usable = self.available_memory().saturating_sub(ALLOCATION_SAFETY_MARGIN);
        let max_tokens = (usable / BYTES_PER_CONTEXT_TOKEN).clamp(MIN_CONTEXT, MAX_CONTEXT);

        let mut result = MIN_CONTEXT;
        while result < max_tokens && result < MAX_CONTEXT {
            result *= 2;
        }
        if result > max_tokens {
            result /= 2;
        }
        debug!(tokens = result, "MEMORY: recommended context size");
        result as usize
    }

    pub fn max_model_size(&self) -> u64 {
        (self.available_memory() as f64 * MAX_MODEL_SHARE) as u64
    }

    pub fn register_model_memory(&self, bytes: u64) {
        let total = {
            let mut ledger = self.ledger.lock().unwrap_or_else(PoisonError::into_inner);
            ledger.model = ledger.model.saturating_add(bytes);
            ledger.model
        };
        info!(bytes, total_mb = total / MB, "MEMORY: model memory registered");
        self.check_pressure();
    }

    pub fn unregister_model_memory(&self, bytes: u64) {
        let total = {
            let mut ledger = self.ledger.lock().unwrap_or_else(PoisonError::into_inner);
            ledger.model = ledger.model.saturating_sub(bytes);
            ledger.model
        };
        info!(bytes, total_mb = total / MB, "MEMORY: model memory unregistered");
    }

    pub fn register_context_memory(&self, bytes: u64) {
        let total = {
            let mut ledger = self.ledger.lock().unwrap_or_else(PoisonError::into_inner);
            ledger.context = ledger.context.saturating_add(bytes);
            ledger.context
        };
        info!(bytes, total_mb = total / MB, "MEMORY: context memory registered");
        self.check_pressure();
    }

    pub fn unregister_context_memory(&self, bytes: u64) {
        let total = {
            let mut ledger = self.ledger.lock().unwrap_or_else(PoisonError::into_inner);
            ledger.context = ledger.context.saturating_sub(bytes);
            ledger.context
        };
        info!(bytes, total_mb = total / MB, "MEMORY: context memory unregistered");
    }

    pub fn model_memory(&self) -> u64 {
        self.ledger.lock().unwrap_or_else(PoisonError::into_inner).model
    }

    pub fn context_memory(&self) -> u64 {
        self.ledger.lock().unwrap_or_else(PoisonError::into_inner).context
    }

    pub fn snapshot(&self) -> MemorySnapshot {
        let total = self.total_memory();
        let available = self.available_memory();
        let (model, context) = {
            let ledger = self.ledger.lock().unwrap_or_else(PoisonError::into_inner);
            (ledger.model, ledger.context)
        };
        MemorySnapshot {
            total,
            available,
            used: total.saturating_sub(available),
            model,
            context,
            pressure: MemoryPressure::from_available(available),
        }
    }

    pub fn set_pressure_callback(&self, callback: PressureCallback) {
        *self.pressure_callback.lock().unwrap_or_else(PoisonError::into_inner) = Some(callback);
    }

    pub fn clear_pressure_callback(&self) {
        *self.pressure_callback.lock().unwrap_or_else(PoisonError::into_inner) = None;
    }

    /// Notifies the callback for any level above `Low`. The callback runs
    /// outside the monitor's locks.
    pub fn check_pressure(&self) -> MemoryPressure {
        let pressure = self.pressure();
        if pressure != MemoryPressure::Low {
            let callback = self
                .pressure_callback
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .clone();
            if let Some(callback) = callback {
                warn!(pressure = pressure.as_str(), "MEMORY: pressure detected");
                callback(pressure);
            }
        }
        pressure
    }

    /// Nothing to reclaim in-process; reports availability before and after.
    pub fn request_cleanup(&self) {
        info!(available_mb = self.available_memory() / MB, "MEMORY: cleanup requested");
        info!(available_mb = self.available_memory() / MB, "MEMORY: after cleanup");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn monitor(available_mb: u64) -> (Arc<FixedMemoryProbe>, ResourceMonitor) {
        let probe = Arc::new(FixedMemoryProbe::new(8192 * MB, available_mb * MB));
        let monitor = ResourceMonitor::new(Box::new(probe.clone()));
        (probe, monitor)
    }

    #[test]
    fn pressure_levels_follow_thresholds() {
        let (probe, monitor) = monitor(50);
        assert_eq!(monitor.pressure(), MemoryPressure::Critical);
        probe.set_available(100 * MB);
        assert_eq!(monitor.pressure(), MemoryPressure::High);
        probe.set_available(200 * MB);
        assert_eq!(monitor.pressure(), MemoryPressure::Medium);
        probe.set_available(300 * MB);
        assert_eq!(monitor.pressure(), MemoryPressure::Low);
        probe.set_available(64 * MB);
        assert_eq!(monitor.pressure(), MemoryPressure::High);
    }

    #[test]
    fn admission_requires_margin_and_floor() {
        let (probe, monitor) = monitor(100);
        assert!(!monitor.can_allocate(10 * MB));
        probe.set_available(700 * MB);
        assert!(monitor.can_allocate(10 * MB));
        // margin passes, floor fails
        probe.set_available(560 * MB);
        assert!(!monitor.can_allocate(100 * MB));
    }

    #[test]
    fn recommended_context_is_power_of_two_in_range() {
        let (probe, monitor) = monitor(50);
        assert_eq!(monitor.recommended_context_size(), 512);

        // (200 - 100) MB / 4KB = 25600 tokens -> 16384
        probe.set_available(200 * MB);
        assert_eq!(monitor.recommended_context_size(), 16384);

        probe.set_available(4096 * MB);
        assert_eq!(monitor.recommended_context_size(), 32768);

        // (104 - 100) MB / 4KB = 1024 tokens exactly
        probe.set_available(104 * MB);
        assert_eq!(monitor.recommended_context_size(), 1024);
    }

    #[test]
    fn max_model_size_is_sixty_percent() {
        let (_probe, monitor) = monitor(1000);
        assert_eq!(monitor.max_model_size(), (1000 * MB) * 6 / 10);
    }

    #[test]
    fn registration_never_goes_negative() {
        let (_probe, monitor) = monitor(4096);
        monitor.register_model_memory(10 * MB);
        monitor.unregister_model_memory(25 * MB);
        assert_eq!(monitor.model_memory(), 0);

        monitor.register_context_memory(3 * MB);
        monitor.register_context_memory(2 * MB);
        monitor.unregister_context_memory(MB);
        assert_eq!(monitor.context_memory(), 4 * MB);

        let snap = monitor.snapshot();
        assert_eq!(snap.context, 4 * MB);
        assert_eq!(snap.used, 4096 * MB);
        assert_eq!(snap.pressure, MemoryPressure::Low);
    }

    #[test]
    fn pressure_callback_fires_only_above_low() {
        let (probe, monitor) = monitor(4096);
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = calls.clone();
        monitor.set_pressure_callback(Arc::new(move |_| {
            seen.fetch_add(1, Ordering::SeqCst);
        }));

        monitor.register_model_memory(MB);
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        probe.set_available(100 * MB);
        monitor.register_context_memory(MB);
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        monitor.clear_pressure_callback();
        assert_eq!(monitor.check_pressure(), MemoryPressure::High);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn pressure_serializes_lowercase() {
        let text = serde_json::to_string(&MemoryPressure::Critical).expect("json");
        assert_eq!(text, "\"critical\"");
    }
}
