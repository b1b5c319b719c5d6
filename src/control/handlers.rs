//! Built-in category handlers: `terminal` and `system`.

use std::path::PathBuf;
use std::process::Stdio;

use futures_util::future::BoxFuture;
use serde_json::json;
use tokio::sync::watch;
use tracing::{debug, info, info_span, warn, Instrument};

use super::message::{
    ControlCommand, ControlMessage, SpawnRequest, SpawnResult, SystemCommand, TerminalCommand,
};
use super::router::ControlHandler;
use crate::errors::ProtocolError;
use crate::{AppError, Result};

/// Opens terminal windows on behalf of `terminal/spawn` requests.
pub trait TerminalLauncher: Send + Sync {
    /// Launch a terminal for `request` and return its process id.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Io` when the terminal cannot be started.
    fn launch(&self, request: SpawnRequest) -> BoxFuture<'_, Result<u32>>;
}

/// Launcher that runs a configured terminal program.
///
/// The spawn request's command and arguments are appended after the
/// configured arguments. The child is reaped in the background.
#[derive(Debug, Clone)]
pub struct CommandTerminalLauncher {
    program: PathBuf,
    args: Vec<String>,
}

impl CommandTerminalLauncher {
    /// Launcher invoking `program args...`.
    #[must_use]
    pub fn new(program: impl Into<PathBuf>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }
}

impl TerminalLauncher for CommandTerminalLauncher {
    fn launch(&self, request: SpawnRequest) -> BoxFuture<'_, Result<u32>> {
        Box::pin(async move {
            let mut command = tokio::process::Command::new(&self.program);
            command
                .args(&self.args)
                .stdin(Stdio::null())
                .stdout(Stdio::null())
                .stderr(Stdio::null());

            if let Some(ref program) = request.command {
                command.arg(program).args(&request.args);
            }
            if let Some(ref dir) = request.working_directory {
                command.current_dir(dir);
            }
            if let Some(ref session_id) = request.session_id {
                command.env("TERM_SESSION_ID", session_id);
            }

            let mut child = command.spawn().map_err(|err| {
                AppError::Io(format!(
                    "failed to launch terminal {}: {err}",
                    self.program.display()
                ))
            })?;
            let pid = child
                .id()
                .ok_or_else(|| AppError::Io("terminal exited before reporting a pid".into()))?;

            tokio::spawn(
                async move {
                    match child.wait().await {
                        Ok(status) => debug!(%status, "terminal process exited"),
                        Err(err) => warn!(%err, "failed to reap terminal process"),
                    }
                }
                .instrument(info_span!("terminal_reaper", pid)),
            );
            Ok(pid)
        })
    }
}

/// Handles the `terminal` category.
///
/// Launch failures are reported in the payload (`success: false`), not as a
/// protocol error.
pub struct TerminalHandler<L> {
    launcher: L,
}

impl<L: TerminalLauncher> TerminalHandler<L> {
    /// Handler backed by `launcher`.
    pub fn new(launcher: L) -> Self {
        Self { launcher }
    }
}

impl<L: TerminalLauncher> ControlHandler for TerminalHandler<L> {
    fn handle(&self, message: ControlMessage) -> BoxFuture<'_, Result<Option<ControlMessage>>> {
        Box::pin(async move {
            let ControlCommand::Terminal(TerminalCommand::Spawn(request)) =
                ControlCommand::from_message(&message)?
            else {
                return Err(ProtocolError::MalformedMessage(format!(
                    "terminal handler received {}/{}",
                    message.category, message.action
                ))
                .into());
            };

            let result = match self.launcher.launch(request).await {
                Ok(pid) => {
                    info!(pid, session_id = ?message.session_id, "terminal launched");
                    SpawnResult {
                        success: true,
                        pid: Some(pid),
                        error: None,
                    }
                }
                Err(err) => {
                    warn!(%err, session_id = ?message.session_id, "terminal launch failed");
                    SpawnResult {
                        success: false,
                        pid: None,
                        error: Some(err.to_string()),
                    }
                }
            };

            if !message.is_request() {
                return Ok(None);
            }
            let payload = serde_json::to_value(result)?;
            Ok(Some(ControlMessage::response_to(&message, Some(payload))))
        })
    }
}

/// Handles the `system` category.
///
/// A `ready` event marks the terminal server as ready on the watch channel
/// returned by [`SystemHandler::subscribe_server_ready`]. `ping` requests get
/// a `pong` response.
#[derive(Debug)]
pub struct SystemHandler {
    server_ready: watch::Sender<bool>,
}

impl SystemHandler {
    /// Handler with the server marked not ready.
    #[must_use]
    pub fn new() -> Self {
        let (server_ready, _) = watch::channel(false);
        Self { server_ready }
    }

    /// Observe server readiness.
    #[must_use]
    pub fn subscribe_server_ready(&self) -> watch::Receiver<bool> {
        self.server_ready.subscribe()
    }

    /// Whether a `ready` event has been seen.
    #[must_use]
    pub fn is_server_ready(&self) -> bool {
        *self.server_ready.borrow()
    }
}

impl Default for SystemHandler {
    fn default() -> Self {
        Self::new()
    }
}

impl ControlHandler for SystemHandler {
    fn handle(&self, message: ControlMessage) -> BoxFuture<'_, Result<Option<ControlMessage>>> {
        Box::pin(async move {
            let reply = match ControlCommand::from_message(&message)? {
                ControlCommand::System(SystemCommand::Ping) => Some(json!({
                    "pong": true,
                    "timestamp": chrono::Utc::now().to_rfc3339(),
                })),
                ControlCommand::System(SystemCommand::Ready) => {
                    info!("terminal server reported ready");
                    self.server_ready.send_replace(true);
                    None
                }
                _ => {
                    return Err(ProtocolError::MalformedMessage(format!(
                        "system handler received {}/{}",
                        message.category, message.action
                    ))
                    .into());
                }
            };

            Ok(message
                .is_request()
                .then(|| ControlMessage::response_to(&message, reply)))
        })
    }
}
