//! Port availability and conflict resolution.
//!
//! Port introspection is a collaborator behind [`PortInspector`]: given a
//! port it reports either "bindable" or who holds it. [`ConflictResolver`]
//! turns an occupied port into a [`ConflictResolution`]. Only a stale copy of
//! our own server is ever terminated; foreign applications get alternative
//! ports proposed instead.

use std::path::{Path, PathBuf};

use futures_util::future::BoxFuture;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::{AppError, Result};

/// Process holding a port.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PortOwner {
    /// Owning pid.
    pub pid: u32,
    /// Process name.
    pub name: String,
    /// Executable path, when the platform exposes it.
    pub path: Option<PathBuf>,
}

/// Result of inspecting a port.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PortStatus {
    /// Nothing listens; the server can bind.
    Bindable,
    /// Something holds the port; the owner is `None` when it could not be
    /// identified.
    Occupied(Option<PortOwner>),
}

/// Remediation chosen for an occupied port.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ConflictAction {
    /// Terminate a stale instance of our own server.
    TerminateOwnedInstance(u32),
    /// Report the foreign owner; no free alternative was found.
    ReportForeignOwner(String),
    /// Report the foreign owner and offer these free ports.
    ProposeAlternatePorts(Vec<u16>),
}

/// Conflict descriptor for a port that cannot be bound.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ConflictResolution {
    /// Port the server wants.
    pub target_port: u16,
    /// Who holds it, if known.
    pub owner: Option<PortOwner>,
    /// What to do about it.
    pub action: ConflictAction,
}

impl ConflictResolution {
    /// Name used when talking about the owner to the user.
    #[must_use]
    pub fn owner_name(&self) -> String {
        self.owner
            .as_ref()
            .map_or_else(|| "an unknown application".to_owned(), |o| o.name.clone())
    }
}

/// Port introspection collaborator.
pub trait PortInspector: Send + Sync {
    /// Report whether `port` is free and, if not, who holds it.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Io` if introspection itself fails.
    fn inspect(&self, port: u16) -> BoxFuture<'_, Result<PortStatus>>;

    /// Cheap bind probe.
    fn is_bindable(&self, port: u16) -> BoxFuture<'_, bool>;
}

/// Delivers termination signals to processes outside the supervisor.
pub trait ProcessSignaller: Send + Sync {
    /// Ask `pid` to exit; `force` requests an uncatchable kill.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Io` if the signal cannot be delivered.
    fn terminate(&self, pid: u32, force: bool) -> Result<()>;
}

/// Decides whether an occupied port belongs to a stale instance of our own
/// server.
#[derive(Debug, Clone)]
pub struct ConflictResolver {
    server_name: String,
    server_path: Option<PathBuf>,
}

impl ConflictResolver {
    /// Resolver recognising processes named `server_name`, optionally also
    /// requiring their executable to be `server_path`.
    #[must_use]
    pub fn new(server_name: impl Into<String>, server_path: Option<PathBuf>) -> Self {
        Self {
            server_name: server_name.into(),
            server_path,
        }
    }

    /// Resolver derived from the server binary path.
    #[must_use]
    pub fn for_binary(binary: &Path) -> Self {
        let name = binary
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let path = binary.canonicalize().ok();
        Self::new(name, path)
    }

    /// Whether `owner` is one of our own server instances.
    ///
    /// A name match is required. When both executable paths are known they
    /// must match too, so an unrelated process with the same name is never
    /// treated as ours.
    #[must_use]
    pub fn is_owned(&self, owner: &PortOwner) -> bool {
        if self.server_name.is_empty() || owner.name != self.server_name {
            return false;
        }

        match (&self.server_path, &owner.path) {
            (Some(expected), Some(actual)) => {
                let actual = actual.canonicalize().unwrap_or_else(|_| actual.clone());
                &actual == expected
            }
            _ => true,
        }
    }

    /// Build the conflict descriptor for an occupied `port`.
    pub async fn resolve(
        &self,
        port: u16,
        owner: Option<PortOwner>,
        inspector: &dyn PortInspector,
        alternative_count: usize,
    ) -> ConflictResolution {
        if let Some(owned) = owner.as_ref().filter(|o| self.is_owned(o)) {
            return ConflictResolution {
                target_port: port,
                action: ConflictAction::TerminateOwnedInstance(owned.pid),
                owner,
            };
        }

        let alternatives = find_alternative_ports(inspector, port, alternative_count).await;
        let action = if alternatives.is_empty() {
            ConflictAction::ReportForeignOwner(
                owner
                    .as_ref()
                    .map_or_else(|| "unknown".to_owned(), |o| o.name.clone()),
            )
        } else {
            ConflictAction::ProposeAlternatePorts(alternatives)
        };

        ConflictResolution {
            target_port: port,
            owner,
            action,
        }
    }
}

/// Scan upward from `port + 1` for up to `count` bindable ports.
pub async fn find_alternative_ports(
    inspector: &dyn PortInspector,
    port: u16,
    count: usize,
) -> Vec<u16> {
    const SCAN_LIMIT: u16 = 100;

    let mut found = Vec::with_capacity(count);
    let mut candidate = port;
    for _ in 0..SCAN_LIMIT {
        if found.len() >= count {
            break;
        }
        let Some(next) = candidate.checked_add(1) else {
            break;
        };
        candidate = next;
        if inspector.is_bindable(candidate).await {
            found.push(candidate);
        }
    }
    found
}

/// Inspector backed by a real bind probe, `lsof`, and the process table.
#[derive(Debug, Clone)]
pub struct SystemPortInspector {
    bind_address: String,
}

impl SystemPortInspector {
    /// Probe ports on `bind_address`.
    #[must_use]
    pub fn new(bind_address: impl Into<String>) -> Self {
        Self {
            bind_address: bind_address.into(),
        }
    }

    async fn probe(&self, port: u16) -> bool {
        tokio::net::TcpListener::bind((self.bind_address.as_str(), port))
            .await
            .is_ok()
    }

    async fn listening_pid(port: u16) -> Result<Option<u32>> {
        let output = tokio::process::Command::new("lsof")
            .args(["-nP", &format!("-iTCP:{port}"), "-sTCP:LISTEN", "-t"])
            .output()
            .await
            .map_err(|err| AppError::Io(format!("failed to run lsof: {err}")))?;

        let stdout = String::from_utf8_lossy(&output.stdout);
        Ok(stdout.lines().find_map(|line| line.trim().parse().ok()))
    }
}

impl PortInspector for SystemPortInspector {
    fn inspect(&self, port: u16) -> BoxFuture<'_, Result<PortStatus>> {
        Box::pin(async move {
            if self.probe(port).await {
                return Ok(PortStatus::Bindable);
            }

            let pid = match Self::listening_pid(port).await {
                Ok(pid) => pid,
                Err(err) => {
                    warn!(port, %err, "could not identify port owner");
                    None
                }
            };

            let owner = pid.and_then(describe_process);
            debug!(port, ?owner, "port occupied");
            Ok(PortStatus::Occupied(owner))
        })
    }

    fn is_bindable(&self, port: u16) -> BoxFuture<'_, bool> {
        Box::pin(self.probe(port))
    }
}

/// Name and executable of `pid` from the process table.
#[must_use]
pub fn describe_process(pid: u32) -> Option<PortOwner> {
    use sysinfo::{Pid, ProcessRefreshKind, ProcessesToUpdate, System};

    let sys_pid = Pid::from_u32(pid);
    let mut system = System::new();
    system.refresh_processes_specifics(
        ProcessesToUpdate::Some(&[sys_pid]),
        true,
        ProcessRefreshKind::everything(),
    );

    system.process(sys_pid).map(|process| PortOwner {
        pid,
        name: process.name().to_string_lossy().into_owned(),
        path: process.exe().map(Path::to_path_buf),
    })
}

/// Signaller using `kill(2)`.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemSignaller;

impl ProcessSignaller for SystemSignaller {
    #[cfg(unix)]
    fn terminate(&self, pid: u32, force: bool) -> Result<()> {
        use nix::sys::signal::{kill, Signal};
        use nix::unistd::Pid;

        let raw = i32::try_from(pid)
            .map_err(|_| AppError::Io(format!("pid {pid} out of range")))?;
        let signal = if force {
            Signal::SIGKILL
        } else {
            Signal::SIGTERM
        };

        match kill(Pid::from_raw(raw), signal) {
            Ok(()) | Err(nix::errno::Errno::ESRCH) => Ok(()),
            Err(err) => Err(AppError::Io(format!("failed to signal pid {pid}: {err}"))),
        }
    }

    #[cfg(not(unix))]
    fn terminate(&self, pid: u32, _force: bool) -> Result<()> {
        use sysinfo::{Pid, ProcessesToUpdate, System};

        let sys_pid = Pid::from_u32(pid);
        let mut system = System::new();
        system.refresh_processes(ProcessesToUpdate::Some(&[sys_pid]), true);
        match system.process(sys_pid) {
            Some(process) if !process.kill() => {
                Err(AppError::Io(format!("failed to kill pid {pid}")))
            }
            _ => Ok(()),
        }
    }
}
