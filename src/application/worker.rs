use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use super::commands::Command;
use super::coordinator::{CoordinatorError, RefreshCoordinator};
use super::mailbox::{MailboxError, RefreshMailbox, RefreshOutcome};
use super::refresh::{RefreshError, RefreshPipeline};

/// Consumes refresh commands one at a time and reports each outcome to the
/// mailbox.
pub struct RefreshWorker {
    pipeline: Arc<RefreshPipeline>,
    mailbox: RefreshMailbox,
}

impl RefreshWorker {
    pub fn new(pipeline: Arc<RefreshPipeline>, mailbox: RefreshMailbox) -> Self {
        Self { pipeline, mailbox }
    }

    /// Run until every sender of `commands` is dropped.
    ///
    /// Requests still registered when the worker stops, or when its task is
    /// aborted, are cancelled so their requesters stop waiting.
    pub async fn run(self, mut commands: mpsc::Receiver<Command>) {
        let _drain = MailboxDrain(self.mailbox.clone());
        info!(target = "plancache::worker", "refresh worker started");
        while let Some(command) = commands.recv().await {
            self.handle(command).await;
        }
        info!(target = "plancache::worker", "refresh worker stopped");
    }

    pub async fn handle(&self, command: Command) {
        match command {
            Command::Refresh { tracking_id } => {
                debug!(target = "plancache::worker", %tracking_id, "refresh command received");
                let outcome = match self.pipeline.refresh().await {
                    Ok(report) => RefreshOutcome::Completed(report),
                    Err(RefreshError::LeaseHeld) => RefreshOutcome::LeaseHeld,
                    Err(err) => RefreshOutcome::Failed {
                        stage: Some(err.stage()),
                        message: err.to_string(),
                    },
                };

                match self.mailbox.deliver(tracking_id, outcome) {
                    Ok(()) => {}
                    Err(MailboxError::ChannelClosed) => debug!(
                        target = "plancache::worker",
                        %tracking_id,
                        "requester went away before the refresh finished"
                    ),
                    Err(MailboxError::UnknownTrackingId) => warn!(
                        target = "plancache::worker",
                        %tracking_id,
                        "refresh finished for an unregistered tracking id"
                    ),
                }
            }
        }
    }
}

struct MailboxDrain(RefreshMailbox);

impl Drop for MailboxDrain {
    fn drop(&mut self) {
        let cancelled = self.0.cancel_all();
        if cancelled > 0 {
            warn!(
                target = "plancache::worker",
                cancelled,
                "refresh worker stopped with requests still pending"
            );
        }
    }
}

/// Request a refresh through the coordinator and log the result.
pub async fn trigger_refresh(coordinator: &RefreshCoordinator, reason: &'static str) {
    match coordinator.refresh().await {
        Ok(completed) => info!(
            target = "plancache::worker",
            reason,
            tracking_id = %completed.tracking_id,
            plans = completed.report.plans,
            groups = completed.report.groups,
            "refresh finished"
        ),
        Err(CoordinatorError::Busy { tracking_id }) => debug!(
            target = "plancache::worker",
            reason,
            in_flight = %tracking_id,
            "refresh skipped; another is in flight"
        ),
        Err(CoordinatorError::LeaseHeld { tracking_id }) => debug!(
            target = "plancache::worker",
            reason,
            %tracking_id,
            "refresh skipped; another writer holds the cache lease"
        ),
        Err(err) => warn!(
            target = "plancache::worker",
            reason,
            error = %err,
            "refresh did not complete"
        ),
    }
}

/// Periodic refresh. The first tick fires one `period` after start.
pub async fn run_schedule(coordinator: Arc<RefreshCoordinator>, period: Duration) {
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
    interval.tick().await;
    loop {
        interval.tick().await;
        trigger_refresh(&coordinator, "schedule").await;
    }
}
