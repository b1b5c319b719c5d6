//! Periodic health monitor.
//!
//! Cross-checks the orchestrator's declared running flag against actual
//! process liveness. A mismatch funnels into the same recovery path as a
//! crash notification.

use std::sync::Arc;

use tokio::task::JoinHandle;
use tracing::{debug, info, info_span, Instrument};

use super::orchestrator::{HealthStatus, LifecycleOrchestrator};

/// Spawn the health polling loop.
///
/// The task holds only a weak reference and exits when the orchestrator is
/// dropped or shut down.
#[must_use]
pub fn spawn_health_monitor(orchestrator: &Arc<LifecycleOrchestrator>) -> JoinHandle<()> {
    let weak = Arc::downgrade(orchestrator);
    let interval = orchestrator.policy().health_interval;
    let teardown = orchestrator.teardown_token();

    tokio::spawn(
        async move {
            loop {
                tokio::select! {
                    () = teardown.cancelled() => {
                        info!("health monitor shutting down");
                        break;
                    }
                    () = tokio::time::sleep(interval) => {}
                }

                let Some(orchestrator) = weak.upgrade() else {
                    break;
                };

                let status = orchestrator.check_health().await;
                debug!(?status, "health check");
                if status == HealthStatus::Unhealthy {
                    info!("health check found a dead server, recovery ran");
                }
            }
        }
        .instrument(info_span!("health_monitor")),
    )
}
