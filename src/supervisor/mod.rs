//! Terminal-server process supervision.
//!
//! A [`ProcessSupervisor`] owns exactly one subprocess: it spawns it with a
//! minimal environment, drains stdout/stderr without ever blocking on output
//! volume, watches for termination, and stops it gracefully (then forcibly).
//!
//! Post-start crashes are delivered asynchronously as [`CrashEvent`]s on a
//! channel registered by the owner; all other failures are returned
//! synchronously from [`ProcessSupervisor::start`].

pub mod launch;
pub mod output;
pub mod process;

use std::fmt::{Display, Formatter};
use std::process::ExitStatus;

use serde::{Deserialize, Serialize};

pub use launch::{AuthMode, ExitCodeTable, LaunchConfig, TunnelIntegration};
pub use output::{OutputRecord, OutputStream};
pub use process::ProcessSupervisor;

/// Lifecycle state of the supervised subprocess.
///
/// `Idle → Starting → Running → Stopping → Idle` is the normal cycle.
/// `Running → Crashed` happens asynchronously when the process exits on its
/// own. `Starting → Idle` happens when the spawn fails or the process exits
/// during the startup grace interval.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ProcessState {
    /// No process.
    Idle,
    /// Spawned, waiting for the grace interval to confirm liveness.
    Starting,
    /// Confirmed alive.
    Running,
    /// Deliberate shutdown in progress.
    Stopping,
    /// Exited on its own after reaching `Running`.
    Crashed,
}

impl ProcessState {
    /// Whether moving from `self` to `next` is an edge of the state graph.
    #[must_use]
    pub fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Idle | Self::Crashed, Self::Starting)
                | (Self::Starting, Self::Running | Self::Idle)
                | (Self::Running, Self::Stopping | Self::Crashed)
                | (Self::Crashed, Self::Stopping)
                | (Self::Stopping, Self::Idle)
        )
    }
}

/// One edge taken through the state graph, published in order by
/// [`ProcessSupervisor::subscribe_transitions`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StateTransition {
    /// State left.
    pub from: ProcessState,
    /// State entered.
    pub to: ProcessState,
}

impl Display for ProcessState {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Idle => "idle",
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Stopping => "stopping",
            Self::Crashed => "crashed",
        };
        f.write_str(name)
    }
}

/// Classification of a process exit, driven by [`ExitCodeTable`].
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ExitClass {
    /// The binary exists but could not be executed.
    NotExecutable,
    /// The binary (or its interpreter) was not found.
    BinaryMissing,
    /// The server could not bind its port.
    PortInUse,
    /// Any other exit.
    Other,
}

impl Display for ExitClass {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let text = match self {
            Self::NotExecutable => "not executable",
            Self::BinaryMissing => "binary missing",
            Self::PortInUse => "port already in use",
            Self::Other => "exited",
        };
        f.write_str(text)
    }
}

/// How a subprocess ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitOutcome {
    /// Exit code, when the process exited normally.
    pub code: Option<i32>,
    /// Terminating signal, when killed by one (unix only).
    pub signal: Option<i32>,
}

impl ExitOutcome {
    /// Outcome for a process whose status could not be collected.
    #[must_use]
    pub fn unknown() -> Self {
        Self {
            code: None,
            signal: None,
        }
    }
}

impl From<ExitStatus> for ExitOutcome {
    fn from(status: ExitStatus) -> Self {
        #[cfg(unix)]
        let signal = std::os::unix::process::ExitStatusExt::signal(&status);
        #[cfg(not(unix))]
        let signal = None;

        Self {
            code: status.code(),
            signal,
        }
    }
}

impl Display for ExitOutcome {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match (self.code, self.signal) {
            (Some(code), _) => write!(f, "exit code {code}"),
            (None, Some(signal)) => write!(f, "signal {signal}"),
            (None, None) => f.write_str("unknown status"),
        }
    }
}

/// Crash notification emitted when a running process exits unexpectedly.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CrashEvent {
    /// Pid of the process that exited.
    pub pid: u32,
    /// How it exited.
    pub exit: ExitOutcome,
    /// Classification according to the supervisor's exit-code table.
    pub class: ExitClass,
}
