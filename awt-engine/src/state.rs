//! Shared engine state
//!
//! One `SharedState` handle is passed explicitly into every subsystem
//! (engine, queue consumer, scheduler, diagnostics, API); there is no
//! process-wide singleton. The status flag is the coarse run-exclusion
//! latch: at most one test or diagnostic executes at a time.

use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::RwLock;

/// Process-wide instrument state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SystemStatus {
    Initializing,
    Idle,
    RunningTest,
    RunningDiagnostic,
    /// The color sensor could not be reached; runs are refused
    SensorOffline,
}

impl SystemStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SystemStatus::Initializing => "Initializing",
            SystemStatus::Idle => "Idle",
            SystemStatus::RunningTest => "Running Test",
            SystemStatus::RunningDiagnostic => "Running Diagnostic",
            SystemStatus::SensorOffline => "Sensor Offline",
        }
    }
}

/// Shared state accessible by all subsystems.
pub struct SharedState {
    status: RwLock<SystemStatus>,
    current_test: RwLock<Option<String>>,
    /// Human-readable progress line shown on the status surface
    test_status: RwLock<Option<String>>,
    /// Cooperative cancellation: checked between steps, never mid-operation
    abort: AtomicBool,
    /// Raised by configuration edits; the scheduler re-derives triggers
    schedule_reset: AtomicBool,
}

impl SharedState {
    pub fn new() -> Self {
        Self {
            status: RwLock::new(SystemStatus::Initializing),
            current_test: RwLock::new(None),
            test_status: RwLock::new(None),
            abort: AtomicBool::new(false),
            schedule_reset: AtomicBool::new(false),
        }
    }

    pub async fn status(&self) -> SystemStatus {
        *self.status.read().await
    }

    pub async fn set_status(&self, status: SystemStatus) {
        *self.status.write().await = status;
    }

    pub async fn current_test(&self) -> Option<String> {
        self.current_test.read().await.clone()
    }

    pub async fn set_current_test(&self, name: Option<String>) {
        *self.current_test.write().await = name;
    }

    pub async fn test_status(&self) -> Option<String> {
        self.test_status.read().await.clone()
    }

    /// Update the progress line. Also emitted at debug level so the log
    /// carries the same narrative the status surface shows.
    pub async fn set_test_status(&self, status: impl Into<String>) {
        let status = status.into();
        tracing::debug!("{status}");
        *self.test_status.write().await = Some(status);
    }

    pub async fn clear_test_status(&self) {
        *self.test_status.write().await = None;
    }

    pub fn request_abort(&self) {
        self.abort.store(true, Ordering::SeqCst);
    }

    pub fn abort_requested(&self) -> bool {
        self.abort.load(Ordering::SeqCst)
    }

    pub fn clear_abort(&self) {
        self.abort.store(false, Ordering::SeqCst);
    }

    pub fn request_schedule_reset(&self) {
        self.schedule_reset.store(true, Ordering::SeqCst);
    }

    /// Consume the reset flag, returning whether it was raised.
    pub fn take_schedule_reset(&self) -> bool {
        self.schedule_reset.swap(false, Ordering::SeqCst)
    }
}

impl Default for SharedState {
    fn default() -> Self {
        Self::new()
    }
}
