//! Lifecycle policy above the process supervisor.
//!
//! Covers port-conflict resolution before (re)start, crash recovery with
//! bounded exponential backoff, restart coordination, and periodic health
//! polling.

pub mod backoff;
pub mod health;
pub mod orchestrator;
pub mod ports;

use std::time::Duration;

use crate::errors::CrashError;
use crate::supervisor::{ExitClass, ExitOutcome};

pub use backoff::{CrashState, RecoveryPolicy};
pub use health::spawn_health_monitor;
pub use orchestrator::{HealthStatus, LifecycleOrchestrator};
pub use ports::{
    ConflictAction, ConflictResolution, ConflictResolver, PortInspector, PortOwner, PortStatus,
    ProcessSignaller, SystemPortInspector, SystemSignaller,
};

/// Notifications published by the orchestrator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LifecycleEvent {
    /// The server reached `Running`.
    Started {
        /// Server pid.
        pid: u32,
        /// Service port.
        port: u16,
    },
    /// The server was stopped deliberately.
    Stopped,
    /// The server exited unexpectedly.
    Crashed {
        /// Pid that exited (0 if unknown).
        pid: u32,
        /// Exit details.
        exit: ExitOutcome,
        /// Exit classification.
        class: ExitClass,
        /// Consecutive crash count including this one.
        consecutive: u32,
    },
    /// An automatic restart will run after `delay`.
    RestartScheduled {
        /// Consecutive crash count driving the delay.
        attempt: u32,
        /// Backoff delay.
        delay: Duration,
    },
    /// A scheduled restart was dropped.
    RecoveryAbandoned {
        /// Why it was dropped.
        reason: String,
    },
    /// Automatic recovery gave up.
    GaveUp(CrashError),
    /// The port is held by another application.
    PortConflict(ConflictResolution),
}
