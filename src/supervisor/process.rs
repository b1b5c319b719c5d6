//! Process supervisor for one terminal-server instance.

use std::path::Component;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::process::Child;
use tokio::sync::{broadcast, mpsc, oneshot, watch, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};

use super::launch::{ExitCodeTable, LaunchConfig};
use super::output::{run_output_watcher, OutputRecord, OutputSettings, OutputStream};
use super::{CrashEvent, ExitClass, ExitOutcome, ProcessState, StateTransition};
use crate::errors::StartupError;
use crate::Result;

/// How long an early-exited process's watchers get to flush their output.
const EARLY_EXIT_DRAIN: Duration = Duration::from_millis(250);

/// Capacity of the transition log; slow subscribers see `Lagged`.
const TRANSITION_LOG_CAPACITY: usize = 64;

/// Slot holding the owner's crash channel, shared with the termination waiter.
type CrashSlot = Arc<Mutex<Option<mpsc::Sender<CrashEvent>>>>;

/// Current state plus the ordered log of edges taken to reach it.
///
/// Every change goes through [`StateCell::advance_if`], which refuses moves
/// that are not edges of the state graph.
struct StateCell {
    current: watch::Sender<ProcessState>,
    transitions: broadcast::Sender<StateTransition>,
}

impl StateCell {
    fn new() -> Self {
        let (current, _) = watch::channel(ProcessState::Idle);
        let (transitions, _) = broadcast::channel(TRANSITION_LOG_CAPACITY);
        Self {
            current,
            transitions,
        }
    }

    fn get(&self) -> ProcessState {
        *self.current.borrow()
    }

    /// Move to `next` when `allow` accepts the current state. Returns whether
    /// the state changed.
    fn advance_if(&self, next: ProcessState, allow: impl FnOnce(ProcessState) -> bool) -> bool {
        self.current.send_if_modified(|state| {
            let from = *state;
            if from == next || !allow(from) {
                return false;
            }
            if !from.can_transition_to(next) {
                error!(%from, to = %next, "refusing invalid state transition");
                return false;
            }
            *state = next;
            // Published under the watch lock so the log order matches.
            let _ = self.transitions.send(StateTransition { from, to: next });
            true
        })
    }

    fn advance(&self, next: ProcessState) -> bool {
        self.advance_if(next, |_| true)
    }
}

/// Resources of one live subprocess. Created by `start()`, destroyed by
/// `stop()`; never shared outside the supervisor.
struct SupervisedProcessHandle {
    pid: u32,
    output_cancel: CancellationToken,
    watchers: Vec<JoinHandle<()>>,
    waiter: JoinHandle<()>,
    kill: Option<oneshot::Sender<()>>,
    exit_rx: watch::Receiver<Option<ExitOutcome>>,
}

impl SupervisedProcessHandle {
    fn has_exited(&self) -> bool {
        self.exit_rx.borrow().is_some()
    }

    /// Wait for the waiter to observe exit, up to `limit`.
    async fn wait_exit(&mut self, limit: Duration) -> bool {
        tokio::time::timeout(limit, self.exit_rx.wait_for(Option::is_some))
            .await
            .is_ok_and(|res| res.is_ok())
    }

    /// Cancel the watchers and wait for every task owned by this handle.
    ///
    /// The waiter gets at most `limit`; past that it is detached so a process
    /// that cannot be reaped never wedges the caller.
    async fn release(mut self, limit: Duration) {
        self.output_cancel.cancel();
        for watcher in self.watchers.drain(..) {
            let _ = watcher.await;
        }
        if tokio::time::timeout(limit, &mut self.waiter).await.is_err() {
            warn!(pid = self.pid, timeout = ?limit, "termination waiter still running, detaching");
        }
    }
}

/// Owns the lifecycle of a single terminal-server subprocess.
pub struct ProcessSupervisor {
    config: LaunchConfig,
    output: Arc<OutputSettings>,
    output_sink: Option<mpsc::Sender<OutputRecord>>,
    state: Arc<StateCell>,
    handle: Mutex<Option<SupervisedProcessHandle>>,
    pid: AtomicU32,
    transition: AtomicBool,
    crash_slot: CrashSlot,
}

impl ProcessSupervisor {
    /// Create an idle supervisor.
    #[must_use]
    pub fn new(config: LaunchConfig) -> Self {
        let output = Arc::new(config.output.clone());
        Self {
            config,
            output,
            output_sink: None,
            state: Arc::new(StateCell::new()),
            handle: Mutex::new(None),
            pid: AtomicU32::new(0),
            transition: AtomicBool::new(false),
            crash_slot: Arc::new(Mutex::new(None)),
        }
    }

    /// Forward drained output records to `sink` in addition to logging them.
    #[must_use]
    pub fn with_output_sink(mut self, sink: mpsc::Sender<OutputRecord>) -> Self {
        self.output_sink = Some(sink);
        self
    }

    /// Launch configuration in use.
    #[must_use]
    pub fn config(&self) -> &LaunchConfig {
        &self.config
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> ProcessState {
        self.state.get()
    }

    /// Subscribe to the latest state. Rapid changes may coalesce.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<ProcessState> {
        self.state.current.subscribe()
    }

    /// Subscribe to every transition, in the order taken.
    #[must_use]
    pub fn subscribe_transitions(&self) -> broadcast::Receiver<StateTransition> {
        self.state.transitions.subscribe()
    }

    /// Whether the process is confirmed running.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.state() == ProcessState::Running
    }

    /// Pid of the current process, if any.
    #[must_use]
    pub fn pid(&self) -> Option<u32> {
        match self.pid.load(Ordering::SeqCst) {
            0 => None,
            pid => Some(pid),
        }
    }

    /// Whether a process handle (live or crashed) is held.
    pub async fn has_handle(&self) -> bool {
        self.handle.lock().await.is_some()
    }

    /// Liveness probe: true when a handle exists and its process has not exited.
    pub async fn check_health(&self) -> bool {
        self.handle
            .lock()
            .await
            .as_ref()
            .is_some_and(|h| !h.has_exited())
    }

    /// Exit of the held process, once its waiter has observed it.
    pub async fn exit_outcome(&self) -> Option<ExitOutcome> {
        self.handle
            .lock()
            .await
            .as_ref()
            .and_then(|h| *h.exit_rx.borrow())
    }

    /// Register the channel that receives [`CrashEvent`]s.
    pub async fn set_crash_sender(&self, tx: mpsc::Sender<CrashEvent>) {
        *self.crash_slot.lock().await = Some(tx);
    }

    /// Spawn the server and wait for the startup grace interval.
    ///
    /// A call while already starting or running is a no-op.
    ///
    /// # Errors
    ///
    /// - `StartupError::InvalidState` while stopping or when another
    ///   start/stop is in flight.
    /// - `StartupError::BinaryMissing` / `StartupError::InvalidPort` for bad
    ///   configuration.
    /// - `StartupError::ProcessFailedToStart` when the spawn fails or the
    ///   process exits before the grace interval elapses.
    pub async fn start(&self) -> Result<()> {
        match self.state() {
            ProcessState::Running | ProcessState::Starting => {
                warn!(state = %self.state(), "start ignored: server already active");
                return Ok(());
            }
            ProcessState::Stopping => {
                return Err(StartupError::InvalidState("server is stopping".into()).into());
            }
            ProcessState::Idle | ProcessState::Crashed => {}
        }

        if self
            .transition
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(
                StartupError::InvalidState("another start or stop is in progress".into()).into(),
            );
        }

        let result = self
            .start_inner()
            .instrument(info_span!("supervisor_start", port = self.config.port))
            .await;
        self.transition.store(false, Ordering::SeqCst);
        result
    }

    async fn start_inner(&self) -> Result<()> {
        self.validate()?;

        // A crashed handle belongs to a dead process; reap it first.
        let stale = self.handle.lock().await.take();
        if let Some(stale) = stale {
            debug!(pid = stale.pid, "releasing crashed process handle");
            stale.release(self.config.stop_timeout).await;
        }

        if !self.state.advance(ProcessState::Starting) {
            return Err(StartupError::InvalidState(format!(
                "cannot start from {}",
                self.state()
            ))
            .into());
        }

        let mut child = match self.config.build_command().spawn() {
            Ok(child) => child,
            Err(err) => {
                self.state.advance(ProcessState::Idle);
                error!(binary = %self.config.binary.display(), %err, "failed to spawn server");
                return Err(spawn_error(&self.config, &err).into());
            }
        };

        let pid = child.id().unwrap_or(0);
        let (output_cancel, watchers) = self.attach(pid, &mut child);
        self.pid.store(pid, Ordering::SeqCst);
        info!(pid, port = self.config.port, "server process spawned");

        let (kill_tx, kill_rx) = oneshot::channel();
        let (exit_tx, exit_rx) = watch::channel(None);
        let waiter = tokio::spawn(
            wait_for_exit(
                pid,
                child,
                kill_rx,
                exit_tx,
                Arc::clone(&self.state),
                Arc::clone(&self.crash_slot),
                self.config.exit_codes.clone(),
            )
            .instrument(info_span!("termination_waiter", pid)),
        );
        let handle = SupervisedProcessHandle {
            pid,
            output_cancel,
            watchers,
            waiter,
            kill: Some(kill_tx),
            exit_rx: exit_rx.clone(),
        };
        *self.handle.lock().await = Some(handle);

        tokio::time::sleep(self.config.startup_grace).await;

        // Probe and transition under the state lock so the waiter either sees
        // `Running` (and reports a crash) or start() sees the exit (and fails).
        let mut early_exit = None;
        self.state.advance_if(ProcessState::Running, |_| {
            early_exit = *exit_rx.borrow();
            early_exit.is_none()
        });

        let Some(outcome) = early_exit else {
            info!(pid, port = self.config.port, "server running");
            return Ok(());
        };

        let taken = self.handle.lock().await.take();
        if let Some(mut handle) = taken {
            for watcher in handle.watchers.drain(..) {
                let _ = tokio::time::timeout(EARLY_EXIT_DRAIN, watcher).await;
            }
            handle.release(self.config.stop_timeout).await;
        }
        self.pid.store(0, Ordering::SeqCst);
        self.state.advance(ProcessState::Idle);

        let class = self.config.exit_codes.classify(&outcome);
        error!(pid, %outcome, %class, "server exited during startup");
        Err(StartupError::ProcessFailedToStart {
            code: outcome.code,
            class,
            detail: format!("process ended with {outcome} during startup"),
        }
        .into())
    }

    fn validate(&self) -> std::result::Result<(), StartupError> {
        if self.config.port == 0 {
            return Err(StartupError::InvalidPort {
                port: self.config.port,
            });
        }

        // Bare names are resolved through PATH at spawn time.
        let is_path = self
            .config
            .binary
            .components()
            .any(|c| !matches!(c, Component::Normal(_)))
            || self.config.binary.components().count() > 1;
        if is_path && !self.config.binary.is_file() {
            return Err(StartupError::BinaryMissing {
                path: self.config.binary.display().to_string(),
            });
        }

        Ok(())
    }

    /// Take the child's stdio and start one output watcher per stream.
    fn attach(&self, pid: u32, child: &mut Child) -> (CancellationToken, Vec<JoinHandle<()>>) {
        let output_cancel = CancellationToken::new();
        let mut watchers = Vec::with_capacity(2);

        if let Some(stdout) = child.stdout.take() {
            watchers.push(self.spawn_watcher(pid, OutputStream::Stdout, stdout, &output_cancel));
        }
        if let Some(stderr) = child.stderr.take() {
            watchers.push(self.spawn_watcher(pid, OutputStream::Stderr, stderr, &output_cancel));
        }

        (output_cancel, watchers)
    }

    fn spawn_watcher<R>(
        &self,
        pid: u32,
        stream: OutputStream,
        reader: R,
        cancel: &CancellationToken,
    ) -> JoinHandle<()>
    where
        R: tokio::io::AsyncRead + Unpin + Send + 'static,
    {
        tokio::spawn(
            run_output_watcher(
                pid,
                stream,
                reader,
                Arc::clone(&self.output),
                self.output_sink.clone(),
                cancel.clone(),
            )
            .instrument(info_span!("output_watcher", pid, %stream)),
        )
    }

    /// Stop the server: graceful signal, bounded wait, then force-kill.
    ///
    /// No-op unless running or crashed, and while another stop is in flight.
    ///
    /// # Errors
    ///
    /// Currently infallible; the `Result` leaves room for signal failures
    /// that must be surfaced.
    pub async fn stop(&self) -> Result<()> {
        let state = self.state();
        if !matches!(state, ProcessState::Running | ProcessState::Crashed) {
            debug!(%state, "stop ignored");
            return Ok(());
        }

        if self
            .transition
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            warn!("stop ignored: another start or stop is in progress");
            return Ok(());
        }

        self.stop_inner().instrument(info_span!("supervisor_stop")).await;
        self.transition.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn stop_inner(&self) {
        self.state.advance_if(ProcessState::Stopping, |state| {
            matches!(state, ProcessState::Running | ProcessState::Crashed)
        });

        let taken = self.handle.lock().await.take();
        let Some(mut handle) = taken else {
            self.pid.store(0, Ordering::SeqCst);
            self.state.advance(ProcessState::Idle);
            return;
        };

        let pid = handle.pid;
        handle.output_cancel.cancel();
        for watcher in handle.watchers.drain(..) {
            let _ = watcher.await;
        }

        if !handle.has_exited() {
            send_graceful_signal(pid, &mut handle);

            if !handle.wait_exit(self.config.stop_timeout).await {
                warn!(pid, timeout = ?self.config.stop_timeout, "server ignored graceful stop, killing");
                if let Some(kill) = handle.kill.take() {
                    let _ = kill.send(());
                }
                if !handle.wait_exit(self.config.stop_timeout).await {
                    error!(pid, "server did not exit after kill");
                }
            }
        }

        handle.release(self.config.stop_timeout).await;
        self.pid.store(0, Ordering::SeqCst);
        self.state.advance(ProcessState::Idle);
        info!(pid, "server stopped");
    }
}

#[cfg(unix)]
fn send_graceful_signal(pid: u32, handle: &mut SupervisedProcessHandle) {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    let Ok(raw) = i32::try_from(pid) else {
        warn!(pid, "pid out of range for signal delivery, killing");
        if let Some(kill) = handle.kill.take() {
            let _ = kill.send(());
        }
        return;
    };

    match kill(Pid::from_raw(raw), Signal::SIGTERM) {
        Ok(()) => debug!(pid, "sent SIGTERM"),
        Err(nix::errno::Errno::ESRCH) => debug!(pid, "process already gone"),
        Err(err) => warn!(pid, %err, "failed to send SIGTERM"),
    }
}

#[cfg(not(unix))]
fn send_graceful_signal(pid: u32, handle: &mut SupervisedProcessHandle) {
    debug!(pid, "no graceful signal on this platform, killing");
    if let Some(kill) = handle.kill.take() {
        let _ = kill.send(());
    }
}

/// Map a spawn failure onto the startup taxonomy.
fn spawn_error(config: &LaunchConfig, err: &std::io::Error) -> StartupError {
    match err.kind() {
        std::io::ErrorKind::NotFound => StartupError::BinaryMissing {
            path: config.binary.display().to_string(),
        },
        std::io::ErrorKind::PermissionDenied => StartupError::ProcessFailedToStart {
            code: None,
            class: ExitClass::NotExecutable,
            detail: err.to_string(),
        },
        _ => StartupError::ProcessFailedToStart {
            code: None,
            class: ExitClass::Other,
            detail: err.to_string(),
        },
    }
}

/// Await process exit, publish it, and report a crash if the process was
/// running and nobody had begun stopping it.
async fn wait_for_exit(
    pid: u32,
    mut child: Child,
    mut kill_rx: oneshot::Receiver<()>,
    exit_tx: watch::Sender<Option<ExitOutcome>>,
    state: Arc<StateCell>,
    crash_slot: CrashSlot,
    exit_codes: ExitCodeTable,
) {
    let status = tokio::select! {
        status = child.wait() => status,
        Ok(()) = &mut kill_rx => {
            if let Err(err) = child.start_kill() {
                warn!(pid, %err, "force kill failed");
            }
            child.wait().await
        }
    };

    let outcome = status.map_or_else(
        |err| {
            warn!(pid, %err, "error waiting for server process");
            ExitOutcome::unknown()
        },
        ExitOutcome::from,
    );
    exit_tx.send_replace(Some(outcome));

    let crashed = state.advance_if(ProcessState::Crashed, |s| s == ProcessState::Running);

    if !crashed {
        debug!(pid, %outcome, "server exit observed outside running state");
        return;
    }

    let class = exit_codes.classify(&outcome);
    warn!(pid, %outcome, %class, "server crashed");

    let tx = crash_slot.lock().await.clone();
    match tx {
        Some(tx) => {
            let event = CrashEvent {
                pid,
                exit: outcome,
                class,
            };
            if tx.send(event).await.is_err() {
                warn!(pid, "crash receiver closed before the crash could be delivered");
            }
        }
        None => debug!(pid, "no crash receiver registered"),
    }
}
