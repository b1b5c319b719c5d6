//! Integration tests for the OS-backed port inspector and signaller.

use std::time::Duration;

use serial_test::serial;

use term_supervisor::lifecycle::ports::describe_process;
use term_supervisor::lifecycle::{
    PortInspector, PortStatus, ProcessSignaller, SystemPortInspector, SystemSignaller,
};

/// A port held by a listener is occupied until the listener goes away.
#[tokio::test]
#[serial]
async fn bound_port_is_occupied() {
    let listener = tokio::net::TcpListener::bind(("127.0.0.1", 0))
        .await
        .expect("bind");
    let port = listener.local_addr().expect("addr").port();
    let inspector = SystemPortInspector::new("127.0.0.1");

    assert!(!inspector.is_bindable(port).await);
    let status = inspector.inspect(port).await.expect("inspect");
    assert!(matches!(status, PortStatus::Occupied(_)));
    if let PortStatus::Occupied(Some(owner)) = status {
        assert_eq!(owner.pid, std::process::id());
    }

    drop(listener);
    assert!(inspector.is_bindable(port).await);
    assert_eq!(
        inspector.inspect(port).await.expect("inspect"),
        PortStatus::Bindable
    );
}

/// The current process can be described from the process table.
#[test]
fn current_process_is_described() {
    let pid = std::process::id();
    let owner = describe_process(pid).expect("own process");
    assert_eq!(owner.pid, pid);
    assert!(!owner.name.is_empty());
}

/// Graceful termination ends a child process.
#[cfg(unix)]
#[tokio::test]
#[serial]
async fn signaller_terminates_child() {
    let mut child = tokio::process::Command::new("sleep")
        .arg("30")
        .kill_on_drop(true)
        .spawn()
        .expect("spawn sleep");
    let pid = child.id().expect("pid");

    SystemSignaller.terminate(pid, false).expect("terminate");
    let status = tokio::time::timeout(Duration::from_secs(5), child.wait())
        .await
        .expect("exit in time")
        .expect("status");
    assert!(!status.success());
}

/// Signalling a pid that no longer exists is not an error.
#[cfg(unix)]
#[tokio::test]
#[serial]
async fn signaller_ignores_missing_process() {
    let mut child = tokio::process::Command::new("true")
        .spawn()
        .expect("spawn true");
    let pid = child.id().expect("pid");
    child.wait().await.expect("reap");

    SystemSignaller.terminate(pid, true).expect("missing pid is fine");
}
