//! Control loop: timers, health requests and backoff retries feeding the
//! rotation scheduler.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::backoff::Backoff;
use crate::health::HealthMonitor;
use crate::scheduler::{RotationOutcome, RotationScheduler, RotationTrigger};
use crate::status;

/// Capacity of the rotation request queue. Requests beyond it are
/// duplicates of one already pending.
pub const REQUEST_QUEUE: usize = 4;

pub struct ControlLoop {
    scheduler: Arc<RotationScheduler>,
    requests: mpsc::Receiver<RotationTrigger>,
    health: Option<HealthMonitor>,
    rotation_interval: Duration,
    backoff: Backoff,
    status_path: Option<PathBuf>,
}

impl ControlLoop {
    pub const fn new(
        scheduler: Arc<RotationScheduler>,
        requests: mpsc::Receiver<RotationTrigger>,
        rotation_interval: Duration,
        backoff: Backoff,
    ) -> Self {
        Self {
            scheduler,
            requests,
            health: None,
            rotation_interval,
            backoff,
            status_path: None,
        }
    }

    #[must_use]
    pub fn with_health(mut self, monitor: HealthMonitor) -> Self {
        self.health = Some(monitor);
        self
    }

    #[must_use]
    pub fn with_status_file(mut self, path: PathBuf) -> Self {
        self.status_path = Some(path);
        self
    }

    /// Bootstrap rotation, unless a tunnel is already Active, then drive
    /// rotations until `shutdown` flips.
    ///
    /// On shutdown the in-flight rotation is stopped at its next safe point
    /// and every non-Active slot is hard-stopped; the Active tunnel and its
    /// route stay up.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        let mut tasks = Vec::new();
        if let Some(monitor) = self.health.take() {
            tasks.push(monitor.spawn(shutdown.clone()));
        }
        if let Some(path) = self.status_path.take() {
            tasks.push(tokio::spawn(status::run_writer(
                path,
                self.scheduler.subscribe(),
                shutdown.clone(),
            )));
        }

        let mut timer = tokio::time::interval(self.rotation_interval);
        timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
        timer.tick().await; // Skip first immediate tick

        let retry = tokio::time::sleep(Duration::ZERO);
        tokio::pin!(retry);
        let mut retry_armed = false;
        let scheduler = Arc::clone(&self.scheduler);
        let mut pending = scheduler
            .status()
            .active_candidate
            .is_none()
            .then_some(RotationTrigger::Bootstrap);

        loop {
            if *shutdown.borrow() {
                break;
            }
            let trigger = match pending.take() {
                Some(t) => t,
                None => tokio::select! {
                    _ = shutdown.changed() => break,
                    _ = timer.tick() => RotationTrigger::Periodic,
                    Some(t) = self.requests.recv() => t,
                    () = &mut retry, if retry_armed => {
                        retry_armed = false;
                        RotationTrigger::Retry
                    }
                },
            };

            let rotation = scheduler.rotate(trigger);
            tokio::pin!(rotation);
            let result = tokio::select! {
                r = &mut rotation => r,
                _ = shutdown.changed() => {
                    info!(%trigger, "Shutdown during rotation, stopping it");
                    scheduler.cancel_in_flight();
                    if let Err(e) = rotation.await {
                        debug!(error = %e, "Rotation stopped");
                    }
                    break;
                }
            };

            match result {
                Ok(RotationOutcome::Rotated { .. }) => {
                    self.backoff.reset();
                    retry_armed = false;
                    timer.reset();
                }
                Ok(RotationOutcome::Coalesced) => {}
                Err(e) => {
                    let delay = self.backoff.record_failure();
                    warn!(
                        error = %e,
                        retry_in_secs = delay.as_secs(),
                        consecutive_failures = self.backoff.failures(),
                        "Rotation cycle failed, scheduling retry"
                    );
                    retry.as_mut().reset(Instant::now() + delay);
                    retry_armed = true;
                }
            }

            // Requests that piled up during the cycle are satisfied by it.
            while let Ok(t) = self.requests.try_recv() {
                debug!(trigger = %t, "Coalesced queued rotation request");
            }
        }

        scheduler.cancel_in_flight();
        scheduler.abandon_in_flight().await;
        for task in tasks {
            let _ = task.await;
        }
        info!("Control loop stopped");
    }
}
