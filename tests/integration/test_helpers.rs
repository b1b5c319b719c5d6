//! Shared fixtures for integration tests.
//!
//! The terminal server is stood in for by `/bin/sh -c <script>`, so each test
//! controls exactly how the "server" behaves. Port introspection and process
//! signalling are replaced with in-memory fakes.

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::future::BoxFuture;

use term_supervisor::lifecycle::{
    PortInspector, PortOwner, PortStatus, ProcessSignaller, RecoveryPolicy,
};
use term_supervisor::supervisor::LaunchConfig;
use term_supervisor::Result;

/// Port used by every fixture.
pub const TEST_PORT: u16 = 4020;

/// Launch configuration running `script` under `/bin/sh`.
pub fn script_config(script: &str) -> LaunchConfig {
    let mut config = LaunchConfig::new("/bin/sh", TEST_PORT);
    config.leading_args = vec!["-c".into(), script.into(), "term-server".into()];
    config.startup_grace = Duration::from_millis(300);
    config.stop_timeout = Duration::from_secs(2);
    config
}

/// Script that exits with `code` after `sleep_secs` on its first run and
/// stays up on every later run. `marker` records that the first run happened.
pub fn crash_once_script(marker: &Path, sleep_secs: f32, code: i32) -> String {
    let marker = marker.display();
    format!("if [ -e '{marker}' ]; then exec sleep 30; fi; touch '{marker}'; sleep {sleep_secs}; exit {code}")
}

/// Recovery policy with delays short enough for tests.
pub fn fast_policy() -> RecoveryPolicy {
    RecoveryPolicy {
        crash_window: Duration::from_secs(60),
        max_consecutive_crashes: 3,
        crash_base_delay: Duration::from_millis(20),
        port_in_use_base_delay: Duration::from_millis(20),
        port_poll_attempts: 3,
        port_poll_base_delay: Duration::from_millis(10),
        port_poll_max_delay: Duration::from_millis(40),
        conflict_retry_attempts: 3,
        conflict_retry_base_delay: Duration::from_millis(10),
        health_interval: Duration::from_millis(100),
        alternative_port_count: 3,
    }
}

/// In-memory port table. Ports not listed are bindable.
#[derive(Default)]
pub struct FakeInspector {
    occupied: Mutex<HashMap<u16, Option<PortOwner>>>,
    bind_probes: AtomicUsize,
}

impl FakeInspector {
    /// Mark `port` as held by `owner`.
    pub fn occupy(&self, port: u16, owner: Option<PortOwner>) {
        self.occupied.lock().expect("lock").insert(port, owner);
    }

    /// Free `port`.
    pub fn release(&self, port: u16) {
        self.occupied.lock().expect("lock").remove(&port);
    }

    /// Number of `is_bindable` calls so far.
    pub fn bind_probes(&self) -> usize {
        self.bind_probes.load(Ordering::SeqCst)
    }

    /// Free every port held by `pid`.
    pub fn release_pid(&self, pid: u32) {
        self.occupied
            .lock()
            .expect("lock")
            .retain(|_, owner| !matches!(owner, Some(o) if o.pid == pid));
    }
}

impl PortInspector for FakeInspector {
    fn inspect(&self, port: u16) -> BoxFuture<'_, Result<PortStatus>> {
        let status = match self.occupied.lock().expect("lock").get(&port) {
            Some(owner) => PortStatus::Occupied(owner.clone()),
            None => PortStatus::Bindable,
        };
        Box::pin(async move { Ok(status) })
    }

    fn is_bindable(&self, port: u16) -> BoxFuture<'_, bool> {
        self.bind_probes.fetch_add(1, Ordering::SeqCst);
        let free = !self.occupied.lock().expect("lock").contains_key(&port);
        Box::pin(async move { free })
    }
}

/// Signaller that records calls and frees the target's ports.
pub struct FakeSignaller {
    inspector: Arc<FakeInspector>,
    /// `(pid, force)` for every call.
    pub calls: Mutex<Vec<(u32, bool)>>,
    /// When false, the process "ignores" graceful termination.
    pub honour_graceful: bool,
}

impl FakeSignaller {
    /// Signaller that frees ports through `inspector`.
    pub fn new(inspector: Arc<FakeInspector>) -> Self {
        Self {
            inspector,
            calls: Mutex::new(Vec::new()),
            honour_graceful: true,
        }
    }

    /// Recorded calls.
    pub fn calls(&self) -> Vec<(u32, bool)> {
        self.calls.lock().expect("lock").clone()
    }
}

impl ProcessSignaller for FakeSignaller {
    fn terminate(&self, pid: u32, force: bool) -> Result<()> {
        self.calls.lock().expect("lock").push((pid, force));
        if force || self.honour_graceful {
            self.inspector.release_pid(pid);
        }
        Ok(())
    }
}

/// Port owner record.
pub fn owner(pid: u32, name: &str) -> PortOwner {
    PortOwner {
        pid,
        name: name.into(),
        path: None,
    }
}
