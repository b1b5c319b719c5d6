//! Error types shared across the supervisor, lifecycle, and control plane.

use thiserror::Error;

use crate::supervisor::ExitClass;

/// Shared application result type.
pub type Result<T> = std::result::Result<T, AppError>;

/// Failures raised synchronously while launching the terminal server.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StartupError {
    /// The configured server binary does not exist.
    #[error("server binary not found: {path}")]
    BinaryMissing {
        /// Path that was checked.
        path: String,
    },
    /// The configured port cannot be used.
    #[error("invalid port: {port}")]
    InvalidPort {
        /// Rejected port number.
        port: u16,
    },
    /// The supervisor is in a state that forbids the requested operation.
    #[error("invalid state: {0}")]
    InvalidState(String),
    /// Spawn failed or the process exited during the startup grace interval.
    #[error("server failed to start ({class}): {detail}")]
    ProcessFailedToStart {
        /// Exit code observed, if the process ran at all.
        code: Option<i32>,
        /// Classification of the early exit.
        class: ExitClass,
        /// Human-readable detail.
        detail: String,
    },
}

/// Port conflicts detected before (re)starting the server.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConflictError {
    /// A stale copy of our own server holds the port.
    #[error("port {port} is held by a previous server instance (pid {pid})")]
    PortOccupiedByOwnedProcess {
        /// Occupied port.
        port: u16,
        /// Pid of the stale instance.
        pid: u32,
    },
    /// Another application holds the port; it is never terminated.
    #[error("port {port} is in use by {name}; try one of {alternatives:?}")]
    PortOccupiedByForeignApp {
        /// Owning application name.
        name: String,
        /// Occupied port.
        port: u16,
        /// Free ports that could be used instead.
        alternatives: Vec<u16>,
    },
    /// The port never became bindable within the retry budget.
    #[error("port {port} still unavailable after {attempts} attempts")]
    PortStillUnavailableAfterRetries {
        /// Port that stayed occupied.
        port: u16,
        /// Attempts made.
        attempts: u32,
    },
}

/// Crash-recovery failures surfaced to the user.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CrashError {
    /// Automatic restart gave up after too many crashes inside the window.
    #[error("server crashed {0} times in quick succession; check the server logs")]
    RepeatedCrashes(u32),
}

/// Control-plane protocol failures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    /// A frame or payload could not be decoded.
    #[error("malformed message: {0}")]
    MalformedMessage(String),
    /// No handler is registered for the category of a request.
    #[error("no handler for category: {0}")]
    NoHandlerForCategory(String),
    /// No control connection is currently established.
    #[error("control socket not connected")]
    NotConnected,
}

/// Application error enumeration covering all domain failure modes.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AppError {
    /// Launch failure.
    #[error("startup: {0}")]
    Startup(#[from] StartupError),
    /// Port conflict.
    #[error("conflict: {0}")]
    Conflict(#[from] ConflictError),
    /// Crash recovery exhausted.
    #[error("crash: {0}")]
    Crash(#[from] CrashError),
    /// Control protocol failure.
    #[error("protocol: {0}")]
    Protocol(#[from] ProtocolError),
    /// Configuration parsing or validation failure.
    #[error("config: {0}")]
    Config(String),
    /// File-system, socket, or process I/O failure.
    #[error("io: {0}")]
    Io(String),
}

impl AppError {
    /// Whether the failure should be shown to the user rather than retried
    /// silently.
    #[must_use]
    pub fn is_user_visible(&self) -> bool {
        matches!(
            self,
            Self::Crash(CrashError::RepeatedCrashes(_))
                | Self::Conflict(ConflictError::PortOccupiedByForeignApp { .. })
        )
    }
}

impl From<toml::de::Error> for AppError {
    fn from(err: toml::de::Error) -> Self {
        Self::Config(format!("invalid config: {err}"))
    }
}

impl From<std::io::Error> for AppError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}

impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        Self::Protocol(ProtocolError::MalformedMessage(err.to_string()))
    }
}
