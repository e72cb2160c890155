//! ECM supervisor - root of the agent's actor tree.
//!
//! ```text
//! EcmSupervisor
//! └── CoordinatorActor
//! ```
//!
//! Session tasks (ECU listener, trusted uplink, telemetry) are plain tokio
//! tasks holding a `CoordinatorHandle`; they watch the same shutdown signal.

use std::time::Duration;

use anyhow::bail;
use tokio::sync::watch;
use tracing::{debug, error, info};

use super::coordinator::{CoordinatorActor, CoordinatorHandle};
use super::framework::Supervisor;
use crate::coordinator::Coordinator;

/// Mailbox capacity of the coordinator actor.
const COORDINATOR_MAILBOX: usize = 256;

/// Root supervisor for the agent.
pub struct EcmSupervisor {
    supervisor: Supervisor,

    coordinator: Option<CoordinatorHandle>,

    /// Interval between ticks sent to the coordinator.
    tick_interval: Duration,

    shutdown: watch::Receiver<bool>,
}

impl EcmSupervisor {
    pub fn new(tick_interval: Duration, shutdown: watch::Receiver<bool>) -> Self {
        Self {
            supervisor: Supervisor::default(),
            coordinator: None,
            tick_interval,
            shutdown,
        }
    }

    /// Spawn the coordinator actor and return its handle.
    pub fn start(&mut self, coordinator: Coordinator) -> CoordinatorHandle {
        let handle = CoordinatorHandle::new(
            self.supervisor
                .spawn(CoordinatorActor::new(coordinator), COORDINATOR_MAILBOX),
        );
        self.coordinator = Some(handle.clone());

        info!(
            running = self.supervisor.running_count(),
            "ECM supervisor started"
        );

        handle
    }

    /// Run the tick loop until shutdown.
    ///
    /// Fails if the coordinator actor exits on its own, since nothing can
    /// make progress without it. Actors keep running until [`shutdown`]
    /// so that workers can drain first.
    ///
    /// [`shutdown`]: EcmSupervisor::shutdown
    pub async fn run(&mut self) -> anyhow::Result<()> {
        info!(
            tick_interval_ms = self.tick_interval.as_millis() as u64,
            "ECM supervisor entering main loop"
        );

        let mut interval = tokio::time::interval(self.tick_interval);
        let mut tick_id = 0u64;

        let result = loop {
            tokio::select! {
                biased;

                changed = self.shutdown.changed() => {
                    if changed.is_err() || *self.shutdown.borrow() {
                        info!("ECM supervisor received shutdown signal");
                        break Ok(());
                    }
                }

                _ = interval.tick() => {
                    tick_id += 1;

                    let failed = self.supervisor.check_children();
                    if !failed.is_empty() {
                        error!(actors = ?failed, "Supervised actor exited");
                        break Err(failed);
                    }

                    if let Some(handle) = &self.coordinator {
                        if let Err(e) = handle.tick(tick_id) {
                            debug!(tick_id, error = %e, "Coordinator tick dropped");
                        }
                    }

                    debug!(
                        tick_id,
                        running_actors = self.supervisor.running_count(),
                        "Supervisor tick"
                    );
                }
            }
        };

        match result {
            Ok(()) => Ok(()),
            Err(failed) => bail!("actor exited unexpectedly: {}", failed.join(", ")),
        }
    }

    /// Stop all actors.
    pub async fn shutdown(&mut self) {
        info!("Shutting down ECM supervisor");
        self.coordinator = None;
        self.supervisor.stop_all().await;
        info!("ECM supervisor shutdown complete");
    }

    /// Handle to the coordinator actor, once started.
    pub fn coordinator(&self) -> Option<&CoordinatorHandle> {
        self.coordinator.as_ref()
    }
}
