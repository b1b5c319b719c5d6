//! Lifecycle orchestrator: the policy layer that owns a [`ProcessSupervisor`].
//!
//! Crash notifications arrive on an mpsc channel registered with the
//! supervisor. Crash-triggered and health-triggered recovery share one
//! in-flight guard, and a generation counter lets a delayed restart notice
//! that a manual start, stop, or restart happened while it slept. A recovery
//! run snapshots the generation and the backoff token before its first
//! await and re-checks them at every step, so a stop landing at any point
//! wins over the pending restart.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, PoisonError, Weak};
use std::time::Duration;

use tokio::sync::{broadcast, mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};

use super::backoff::{exponential_delay, CrashState, RecoveryPolicy};
use super::ports::{
    ConflictAction, ConflictResolver, PortInspector, PortOwner, PortStatus, ProcessSignaller,
};
use super::LifecycleEvent;
use crate::errors::{ConflictError, CrashError, StartupError};
use crate::supervisor::{CrashEvent, ExitClass, ExitOutcome, ProcessState, ProcessSupervisor};
use crate::{AppError, Result};

/// Capacity of the crash notification channel.
const CRASH_CHANNEL_CAPACITY: usize = 8;

/// Capacity of the lifecycle event broadcast.
const EVENT_CHANNEL_CAPACITY: usize = 64;

/// Outcome of one health check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthStatus {
    /// Declared running and alive.
    Healthy,
    /// Not declared running; nothing to check.
    NotRunning,
    /// Dead, but a recovery is already in flight.
    RecoveryInFlight,
    /// Declared running but dead; recovery was run.
    Unhealthy,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StartKind {
    Manual,
    /// Automatic restart on behalf of the recovery that holds `generation`.
    Recovery { generation: u64 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StartOutcome {
    Started,
    /// A stop or manual start claimed the lifecycle first.
    Superseded,
}

/// What a recovery run saw when it began.
#[derive(Debug)]
struct RecoveryTicket {
    generation: u64,
    stops: u64,
    backoff: CancellationToken,
}

/// Start/stop/restart policy for the terminal server.
pub struct LifecycleOrchestrator {
    supervisor: ProcessSupervisor,
    inspector: Arc<dyn PortInspector>,
    signaller: Arc<dyn ProcessSignaller>,
    resolver: ConflictResolver,
    policy: RecoveryPolicy,
    crash_state: Mutex<CrashState>,
    crash_tx: mpsc::Sender<CrashEvent>,
    crash_rx: Mutex<Option<mpsc::Receiver<CrashEvent>>>,
    running: AtomicBool,
    recovering: AtomicBool,
    generation: AtomicU64,
    /// Generation at which the current server instance was started.
    live_generation: AtomicU64,
    stops: AtomicU64,
    last_crashed_pid: AtomicU32,
    backoff_cancel: StdMutex<CancellationToken>,
    teardown: CancellationToken,
    events: broadcast::Sender<LifecycleEvent>,
    last_error: Mutex<Option<AppError>>,
}

impl LifecycleOrchestrator {
    /// Build an orchestrator that exclusively owns `supervisor`.
    ///
    /// Stale-instance detection defaults to matching the supervisor's binary
    /// name and path; see [`with_resolver`](Self::with_resolver).
    #[must_use]
    pub fn new(
        supervisor: ProcessSupervisor,
        inspector: Arc<dyn PortInspector>,
        signaller: Arc<dyn ProcessSignaller>,
        policy: RecoveryPolicy,
    ) -> Self {
        let resolver = ConflictResolver::for_binary(&supervisor.config().binary);
        let (crash_tx, crash_rx) = mpsc::channel(CRASH_CHANNEL_CAPACITY);
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);

        Self {
            supervisor,
            inspector,
            signaller,
            resolver,
            policy,
            crash_state: Mutex::new(CrashState::default()),
            crash_tx,
            crash_rx: Mutex::new(Some(crash_rx)),
            running: AtomicBool::new(false),
            recovering: AtomicBool::new(false),
            generation: AtomicU64::new(0),
            live_generation: AtomicU64::new(0),
            stops: AtomicU64::new(0),
            last_crashed_pid: AtomicU32::new(0),
            backoff_cancel: StdMutex::new(CancellationToken::new()),
            teardown: CancellationToken::new(),
            events,
            last_error: Mutex::new(None),
        }
    }

    /// Replace the stale-instance resolver.
    #[must_use]
    pub fn with_resolver(mut self, resolver: ConflictResolver) -> Self {
        self.resolver = resolver;
        self
    }

    /// The owned supervisor.
    #[must_use]
    pub fn supervisor(&self) -> &ProcessSupervisor {
        &self.supervisor
    }

    /// Recovery tunables.
    #[must_use]
    pub fn policy(&self) -> &RecoveryPolicy {
        &self.policy
    }

    /// Token cancelled by [`shutdown`](Self::shutdown).
    #[must_use]
    pub fn teardown_token(&self) -> CancellationToken {
        self.teardown.clone()
    }

    /// Declared running flag.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Supervisor state.
    #[must_use]
    pub fn state(&self) -> ProcessState {
        self.supervisor.state()
    }

    /// Server pid, if any.
    #[must_use]
    pub fn pid(&self) -> Option<u32> {
        self.supervisor.pid()
    }

    /// Subscribe to lifecycle events.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<LifecycleEvent> {
        self.events.subscribe()
    }

    /// Consecutive crashes currently on record.
    pub async fn consecutive_crashes(&self) -> u32 {
        self.crash_state.lock().await.consecutive()
    }

    /// Most recent user-visible failure.
    pub async fn last_error(&self) -> Option<AppError> {
        self.last_error.lock().await.clone()
    }

    fn emit(&self, event: LifecycleEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    /// Start the server, resolving port conflicts first.
    ///
    /// If a process handle already exists the declared flags are re-synced
    /// from it and the call returns early.
    ///
    /// # Errors
    ///
    /// - `StartupError::InvalidState` while the server is stopping.
    /// - `ConflictError::PortOccupiedByForeignApp` when another application
    ///   holds the port (no termination is attempted).
    /// - `ConflictError::PortStillUnavailableAfterRetries` when a stale
    ///   instance of our own server would not release the port.
    /// - Any `StartupError` from the supervisor.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        self.ensure_crash_listener().await;
        let result = self
            .start_server(StartKind::Manual)
            .instrument(info_span!("lifecycle_start"))
            .await
            .map(|_| ());

        if let Err(ref err) = result {
            if err.is_user_visible() {
                error!(%err, "server start failed");
                *self.last_error.lock().await = Some(err.clone());
            }
        }
        result
    }

    async fn start_server(&self, kind: StartKind) -> Result<StartOutcome> {
        if self.supervisor.has_handle().await {
            let state = self.supervisor.state();
            if state == ProcessState::Stopping {
                return Err(StartupError::InvalidState("server is stopping".into()).into());
            }
            if kind != StartKind::Manual {
                return Ok(StartOutcome::Superseded);
            }
            self.running
                .store(state == ProcessState::Running, Ordering::SeqCst);
            debug!(%state, "server handle already present, synced state");
            return Ok(StartOutcome::Started);
        }

        let port = self.supervisor.config().port;
        match self.inspector.inspect(port).await? {
            PortStatus::Bindable => {}
            PortStatus::Occupied(owner) => self.resolve_conflict(port, owner).await?,
        }

        self.supervisor.set_crash_sender(self.crash_tx.clone()).await;
        if let StartKind::Recovery { generation } = kind {
            if self.generation.load(Ordering::SeqCst) != generation {
                return Ok(StartOutcome::Superseded);
            }
        }
        self.supervisor.start().await?;

        let generation = match kind {
            StartKind::Manual => {
                self.crash_state.lock().await.reset();
                *self.last_error.lock().await = None;
                self.generation.fetch_add(1, Ordering::SeqCst) + 1
            }
            StartKind::Recovery { generation } => {
                // Claim the lifecycle only if nothing happened while starting.
                if self
                    .generation
                    .compare_exchange(
                        generation,
                        generation + 1,
                        Ordering::SeqCst,
                        Ordering::SeqCst,
                    )
                    .is_err()
                {
                    return Ok(StartOutcome::Superseded);
                }
                generation + 1
            }
        };
        self.live_generation.store(generation, Ordering::SeqCst);
        self.running
            .store(self.supervisor.is_running(), Ordering::SeqCst);

        let pid = self.supervisor.pid().unwrap_or(0);
        info!(pid, port, ?kind, "server started");
        self.emit(LifecycleEvent::Started { pid, port });
        Ok(StartOutcome::Started)
    }

    async fn resolve_conflict(&self, port: u16, owner: Option<PortOwner>) -> Result<()> {
        let resolution = self
            .resolver
            .resolve(
                port,
                owner,
                self.inspector.as_ref(),
                self.policy.alternative_port_count,
            )
            .await;

        match resolution.action {
            ConflictAction::TerminateOwnedInstance(pid) => {
                warn!(port, pid, "port held by a stale server instance, terminating it");
                self.reclaim_port(port, pid).await
            }
            ConflictAction::ReportForeignOwner(_) | ConflictAction::ProposeAlternatePorts(_) => {
                let name = resolution.owner_name();
                let alternatives = match resolution.action {
                    ConflictAction::ProposeAlternatePorts(ref ports) => ports.clone(),
                    _ => Vec::new(),
                };
                warn!(port, owner = %name, ?alternatives, "port held by another application");
                self.emit(LifecycleEvent::PortConflict(resolution));
                Err(ConflictError::PortOccupiedByForeignApp {
                    name,
                    port,
                    alternatives,
                }
                .into())
            }
        }
    }

    /// Terminate a stale instance and wait for its port with short backoff.
    /// The last attempt escalates to a forced kill.
    async fn reclaim_port(&self, port: u16, pid: u32) -> Result<()> {
        if let Err(err) = self.signaller.terminate(pid, false) {
            warn!(pid, %err, "failed to terminate stale server");
            return Err(ConflictError::PortOccupiedByOwnedProcess { port, pid }.into());
        }

        let attempts = self.policy.conflict_retry_attempts.max(1);
        for attempt in 1..=attempts {
            tokio::time::sleep(exponential_delay(
                self.policy.conflict_retry_base_delay,
                attempt,
            ))
            .await;

            if self.inspector.is_bindable(port).await {
                info!(port, pid, attempt, "stale server released the port");
                return Ok(());
            }

            if attempt + 1 == attempts {
                warn!(pid, "stale server still holds the port, forcing kill");
                if let Err(err) = self.signaller.terminate(pid, true) {
                    warn!(pid, %err, "forced kill failed");
                }
            }
        }

        Err(ConflictError::PortStillUnavailableAfterRetries { port, attempts }.into())
    }

    /// Stop the server and forget crash history.
    ///
    /// Cancels any in-flight backoff sleep; a pending automatic restart is
    /// abandoned.
    ///
    /// # Errors
    ///
    /// Propagates supervisor stop failures.
    pub async fn stop(&self) -> Result<()> {
        // Bump before cancelling: a recovery that cloned the old token either
        // sees it cancelled or reads the new generation.
        self.stops.fetch_add(1, Ordering::SeqCst);
        self.generation.fetch_add(1, Ordering::SeqCst);
        {
            let mut token = self
                .backoff_cancel
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            token.cancel();
            *token = CancellationToken::new();
        }
        self.crash_state.lock().await.reset();
        self.running.store(false, Ordering::SeqCst);

        self.supervisor.stop().await?;
        info!("server stopped by request");
        self.emit(LifecycleEvent::Stopped);
        Ok(())
    }

    /// Stop, wait for the port to be released, then start again.
    ///
    /// # Errors
    ///
    /// - `ConflictError::PortStillUnavailableAfterRetries` when the port
    ///   never frees up.
    /// - Any error from [`start`](Self::start).
    pub async fn restart(self: &Arc<Self>) -> Result<()> {
        let port = self.supervisor.config().port;
        info!(port, "restarting server");
        self.stop().await?;
        self.wait_for_port_release(port).await?;
        self.start().await
    }

    /// Poll the port with capped exponential backoff until it is bindable.
    async fn wait_for_port_release(&self, port: u16) -> Result<()> {
        let attempts = self.policy.port_poll_attempts.max(1);
        for attempt in 1..=attempts {
            if self.inspector.is_bindable(port).await {
                return Ok(());
            }
            let delay = self.policy.port_poll_delay(attempt);
            debug!(port, attempt, ?delay, "port still busy");
            tokio::time::sleep(delay).await;
        }

        if self.inspector.is_bindable(port).await {
            return Ok(());
        }
        Err(ConflictError::PortStillUnavailableAfterRetries { port, attempts }.into())
    }

    /// Stop everything for process teardown. Interrupts backoff sleeps and
    /// ends the crash listener and health monitor.
    ///
    /// # Errors
    ///
    /// Propagates supervisor stop failures.
    pub async fn shutdown(&self) -> Result<()> {
        self.teardown.cancel();
        self.stop().await
    }

    /// Compare the declared running flag with real liveness and recover on
    /// mismatch.
    pub async fn check_health(&self) -> HealthStatus {
        if !self.is_running() {
            return HealthStatus::NotRunning;
        }
        if self.supervisor.check_health().await {
            return HealthStatus::Healthy;
        }
        if self.recovering.load(Ordering::SeqCst) {
            debug!("server dead but recovery already in flight");
            return HealthStatus::RecoveryInFlight;
        }

        warn!("server declared running but its process is gone");
        self.running.store(false, Ordering::SeqCst);
        let exit = self
            .supervisor
            .exit_outcome()
            .await
            .unwrap_or_else(ExitOutcome::unknown);
        let event = CrashEvent {
            pid: self.supervisor.pid().unwrap_or(0),
            exit,
            class: self.supervisor.config().exit_codes.classify(&exit),
        };
        self.handle_crash(event).await;
        HealthStatus::Unhealthy
    }

    async fn ensure_crash_listener(self: &Arc<Self>) {
        let Some(rx) = self.crash_rx.lock().await.take() else {
            return;
        };
        let _listener: JoinHandle<()> = tokio::spawn(
            run_crash_listener(Arc::downgrade(self), rx, self.teardown.clone())
                .instrument(info_span!("crash_listener")),
        );
    }

    /// Entry point for crash notifications from any source.
    pub async fn handle_crash(&self, event: CrashEvent) {
        if self
            .recovering
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            debug!(pid = event.pid, "recovery already in flight, ignoring crash report");
            return;
        }

        if event.pid != 0 && self.last_crashed_pid.swap(event.pid, Ordering::SeqCst) == event.pid
        {
            debug!(pid = event.pid, "crash already handled for this pid");
            self.recovering.store(false, Ordering::SeqCst);
            return;
        }

        // Token first, then generation; see stop().
        let backoff = self.backoff_token();
        let ticket = RecoveryTicket {
            stops: self.stops.load(Ordering::SeqCst),
            generation: self.generation.load(Ordering::SeqCst),
            backoff,
        };
        if ticket.generation != self.live_generation.load(Ordering::SeqCst) {
            debug!(pid = event.pid, "crashed server was already stopped or replaced");
            self.recovering.store(false, Ordering::SeqCst);
            return;
        }

        let result = self
            .recover(event, ticket)
            .instrument(info_span!("crash_recovery", pid = event.pid))
            .await;
        self.recovering.store(false, Ordering::SeqCst);

        if let Err(err) = result {
            error!(%err, "automatic recovery failed");
            *self.last_error.lock().await = Some(err);
        }
    }

    async fn recover(&self, event: CrashEvent, ticket: RecoveryTicket) -> Result<()> {
        self.running.store(false, Ordering::SeqCst);
        let port = self.supervisor.config().port;
        let mut class = event.class;
        let mut first = true;

        loop {
            let Some(count) = self.record_crash(&ticket).await else {
                self.abandon("server was stopped or restarted during recovery");
                return Ok(());
            };

            if first {
                warn!(pid = event.pid, exit = %event.exit, %class, consecutive = count, "server crashed");
                self.emit(LifecycleEvent::Crashed {
                    pid: event.pid,
                    exit: event.exit,
                    class,
                    consecutive: count,
                });
                first = false;
            }

            // Release the dead handle so a later start() is not short-circuited.
            if let Err(err) = self.supervisor.stop().await {
                warn!(%err, "failed to release crashed server handle");
            }

            if count > self.policy.max_consecutive_crashes {
                let err = CrashError::RepeatedCrashes(count);
                error!(count, "server keeps crashing, giving up on automatic restart");
                self.emit(LifecycleEvent::GaveUp(err.clone()));
                return Err(err.into());
            }

            let port_in_use = class == ExitClass::PortInUse;
            let delay = self.policy.crash_delay(count, port_in_use);
            info!(attempt = count, ?delay, port_in_use, "scheduling restart");
            self.emit(LifecycleEvent::RestartScheduled {
                attempt: count,
                delay,
            });

            if !self.backoff_sleep(delay, &ticket.backoff).await {
                self.abandon("stop or shutdown during backoff");
                return Ok(());
            }

            if port_in_use {
                if let Err(err) = self.wait_for_port_release(port).await {
                    warn!(%err, "port still busy after backoff, resolving on start");
                }
            }

            if self.superseded(&ticket) || self.supervisor.has_handle().await {
                self.abandon("server was restarted manually");
                return Ok(());
            }

            let kind = StartKind::Recovery {
                generation: ticket.generation,
            };
            match self.start_server(kind).await {
                Ok(StartOutcome::Started) => {
                    info!(attempt = count, "server recovered");
                    return Ok(());
                }
                Ok(StartOutcome::Superseded) => {
                    if self.stops.load(Ordering::SeqCst) != ticket.stops {
                        // The stop landed while the replacement was starting.
                        if let Err(err) = self.supervisor.stop().await {
                            warn!(%err, "failed to stop superseded replacement");
                        }
                    }
                    self.abandon("server was stopped or restarted during recovery");
                    return Ok(());
                }
                Err(err) if err.is_user_visible() => return Err(err),
                Err(err) => {
                    warn!(%err, "restart attempt failed");
                    class = match err {
                        AppError::Startup(StartupError::ProcessFailedToStart { class, .. }) => {
                            class
                        }
                        _ => ExitClass::Other,
                    };
                }
            }
        }
    }

    fn abandon(&self, reason: &str) {
        info!(reason, "automatic restart abandoned");
        self.emit(LifecycleEvent::RecoveryAbandoned {
            reason: reason.to_owned(),
        });
    }

    /// Count a crash unless the recovery was superseded. Checked under the
    /// crash-state lock so the reset done by a concurrent stop always wins.
    async fn record_crash(&self, ticket: &RecoveryTicket) -> Option<u32> {
        let mut crashes = self.crash_state.lock().await;
        if self.superseded(ticket) {
            return None;
        }
        Some(crashes.record(Instant::now(), self.policy.crash_window))
    }

    fn superseded(&self, ticket: &RecoveryTicket) -> bool {
        self.generation.load(Ordering::SeqCst) != ticket.generation
    }

    fn backoff_token(&self) -> CancellationToken {
        self.backoff_cancel
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Sleep for `delay`; false when interrupted by stop or teardown.
    async fn backoff_sleep(&self, delay: Duration, token: &CancellationToken) -> bool {
        tokio::select! {
            () = tokio::time::sleep(delay) => true,
            () = token.cancelled() => false,
            () = self.teardown.cancelled() => false,
        }
    }
}

async fn run_crash_listener(
    orchestrator: Weak<LifecycleOrchestrator>,
    mut rx: mpsc::Receiver<CrashEvent>,
    teardown: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            () = teardown.cancelled() => break,
            event = rx.recv() => match event {
                Some(event) => event,
                None => break,
            },
        };

        let Some(orchestrator) = orchestrator.upgrade() else {
            break;
        };
        orchestrator.handle_crash(event).await;
    }
    debug!("crash listener stopped");
}
