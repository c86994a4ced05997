//! Request/reply front for the background refresh worker.
//!
//! A caller publishes a refresh command and waits for the correlated outcome
//! up to a timeout. Only one refresh may be in flight: while one is pending
//! (including after its caller timed out) further requests are rejected with
//! [`CoordinatorError::Busy`]. The slot is released when the worker reports
//! back or when the command could not be published.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use thiserror::Error;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::commands::{BusError, Command, CommandBus};
use super::mailbox::{RefreshMailbox, RefreshOutcome};
use super::refresh::{RefreshReport, RefreshStage};
use crate::cache::lock::mutex_lock;

const SOURCE: &str = "application::coordinator";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoordinatorPhase {
    Idle,
    Requested { tracking_id: Uuid },
    Published { tracking_id: Uuid },
}

#[derive(Debug, Error)]
pub enum CoordinatorError {
    #[error("refresh {tracking_id} is already in flight")]
    Busy { tracking_id: Uuid },
    #[error("refresh {tracking_id} skipped: another writer holds the cache lease")]
    LeaseHeld { tracking_id: Uuid },
    #[error("refresh {tracking_id} did not complete within {waited:?}")]
    TimedOut { tracking_id: Uuid, waited: Duration },
    #[error("refresh {tracking_id} failed: {message}")]
    Failed {
        tracking_id: Uuid,
        stage: Option<RefreshStage>,
        message: String,
    },
    #[error("failed to publish refresh command: {0}")]
    Publish(#[from] BusError),
}

#[derive(Debug, Clone)]
pub struct CompletedRefresh {
    pub tracking_id: Uuid,
    pub report: RefreshReport,
}

pub struct RefreshCoordinator {
    bus: Arc<dyn CommandBus>,
    mailbox: RefreshMailbox,
    phase: Arc<Mutex<CoordinatorPhase>>,
    wait_timeout: Duration,
}

impl RefreshCoordinator {
    pub fn new(bus: Arc<dyn CommandBus>, mailbox: RefreshMailbox, wait_timeout: Duration) -> Self {
        Self {
            bus,
            mailbox,
            phase: Arc::new(Mutex::new(CoordinatorPhase::Idle)),
            wait_timeout,
        }
    }

    pub fn phase(&self) -> CoordinatorPhase {
        *mutex_lock(&self.phase, SOURCE, "phase")
    }

    /// Publish a refresh and wait for its outcome.
    pub async fn refresh(&self) -> Result<CompletedRefresh, CoordinatorError> {
        let tracking_id = Uuid::new_v4();
        let mut slot = self.begin(tracking_id)?;
        let reply = self.mailbox.register(tracking_id);

        if let Err(err) = self.bus.publish(Command::Refresh { tracking_id }).await {
            warn!(
                target = "plancache::coordinator",
                %tracking_id,
                error = %err,
                "refresh command could not be published"
            );
            return Err(err.into());
        }

        self.transition(tracking_id, CoordinatorPhase::Published { tracking_id });
        debug!(target = "plancache::coordinator", %tracking_id, "refresh published");

        // The relay owns the slot from here on so it is released when the
        // worker answers, whether or not this caller is still waiting.
        let (relay_tx, relay_rx) = oneshot::channel();
        let phase = Arc::clone(&self.phase);
        tokio::spawn(async move {
            let outcome = reply.await;
            release(&phase, tracking_id);
            let _ = relay_tx.send(outcome);
        });
        slot.disarm();

        match tokio::time::timeout(self.wait_timeout, relay_rx).await {
            Ok(Ok(Ok(RefreshOutcome::Completed(report)))) => {
                info!(
                    target = "plancache::coordinator",
                    %tracking_id,
                    plans = report.plans,
                    "refresh completed"
                );
                Ok(CompletedRefresh {
                    tracking_id,
                    report,
                })
            }
            Ok(Ok(Ok(RefreshOutcome::LeaseHeld))) => {
                debug!(
                    target = "plancache::coordinator",
                    %tracking_id,
                    "refresh skipped by the worker; cache lease held elsewhere"
                );
                Err(CoordinatorError::LeaseHeld { tracking_id })
            }
            Ok(Ok(Ok(RefreshOutcome::Failed { stage, message }))) => {
                Err(CoordinatorError::Failed {
                    tracking_id,
                    stage,
                    message,
                })
            }
            Ok(Ok(Err(_))) | Ok(Err(_)) => Err(CoordinatorError::Failed {
                tracking_id,
                stage: None,
                message: "refresh worker dropped the request".to_string(),
            }),
            Err(_) => {
                warn!(
                    target = "plancache::coordinator",
                    %tracking_id,
                    timeout_ms = self.wait_timeout.as_millis() as u64,
                    "refresh still running after wait timeout; worker will finish it"
                );
                Err(CoordinatorError::TimedOut {
                    tracking_id,
                    waited: self.wait_timeout,
                })
            }
        }
    }

    fn begin(&self, tracking_id: Uuid) -> Result<SlotGuard, CoordinatorError> {
        let mut phase = mutex_lock(&self.phase, SOURCE, "begin");
        let current = *phase;
        match current {
            CoordinatorPhase::Idle => {
                *phase = CoordinatorPhase::Requested { tracking_id };
                Ok(SlotGuard {
                    phase: Arc::clone(&self.phase),
                    mailbox: self.mailbox.clone(),
                    tracking_id,
                    armed: true,
                })
            }
            CoordinatorPhase::Requested { tracking_id: busy }
            | CoordinatorPhase::Published { tracking_id: busy } => {
                debug!(
                    target = "plancache::coordinator",
                    in_flight = %busy,
                    "refresh rejected while another is in flight"
                );
                Err(CoordinatorError::Busy { tracking_id: busy })
            }
        }
    }

    fn transition(&self, tracking_id: Uuid, next: CoordinatorPhase) {
        let mut phase = mutex_lock(&self.phase, SOURCE, "transition");
        if owns(&phase, tracking_id) {
            *phase = next;
        }
    }
}

fn owns(phase: &CoordinatorPhase, tracking_id: Uuid) -> bool {
    match phase {
        CoordinatorPhase::Requested { tracking_id: current }
        | CoordinatorPhase::Published { tracking_id: current } => *current == tracking_id,
        CoordinatorPhase::Idle => false,
    }
}

fn release(phase: &Mutex<CoordinatorPhase>, tracking_id: Uuid) {
    let mut guard = mutex_lock(phase, SOURCE, "release");
    if owns(&guard, tracking_id) {
        *guard = CoordinatorPhase::Idle;
    }
}

/// Returns the in-flight slot if the request is abandoned before the relay
/// task takes it over.
struct SlotGuard {
    phase: Arc<Mutex<CoordinatorPhase>>,
    mailbox: RefreshMailbox,
    tracking_id: Uuid,
    armed: bool,
}

impl SlotGuard {
    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for SlotGuard {
    fn drop(&mut self) {
        if self.armed {
            self.mailbox.cancel(self.tracking_id);
            release(&self.phase, self.tracking_id);
        }
    }
}
