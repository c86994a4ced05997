use std::sync::Arc;

use dashmap::DashMap;
use thiserror::Error;
use tokio::sync::oneshot;
use uuid::Uuid;

use super::refresh::{RefreshReport, RefreshStage};

/// Final result of a published refresh, delivered back to its requester.
#[derive(Debug, Clone)]
pub enum RefreshOutcome {
    Completed(RefreshReport),
    /// Another writer held the cache lease; nothing was written.
    LeaseHeld,
    Failed {
        stage: Option<RefreshStage>,
        message: String,
    },
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum MailboxError {
    #[error("refresh requester is no longer waiting")]
    ChannelClosed,
    #[error("unknown refresh tracking id")]
    UnknownTrackingId,
}

/// Correlates refresh completions with the requests that published them.
#[derive(Clone, Default)]
pub struct RefreshMailbox {
    inner: Arc<DashMap<Uuid, oneshot::Sender<RefreshOutcome>>>,
}

impl RefreshMailbox {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a tracking id and obtain the receiver for its outcome.
    pub fn register(&self, tracking_id: Uuid) -> oneshot::Receiver<RefreshOutcome> {
        let (tx, rx) = oneshot::channel();
        self.inner.insert(tracking_id, tx);
        rx
    }

    /// Deliver the outcome for a previously registered tracking id.
    pub fn deliver(&self, tracking_id: Uuid, outcome: RefreshOutcome) -> Result<(), MailboxError> {
        match self.inner.remove(&tracking_id) {
            Some((_id, sender)) => sender
                .send(outcome)
                .map_err(|_| MailboxError::ChannelClosed),
            None => Err(MailboxError::UnknownTrackingId),
        }
    }

    /// Drop a registration whose command never reached the worker.
    pub fn cancel(&self, tracking_id: Uuid) {
        self.inner.remove(&tracking_id);
    }

    /// Drop every registration; each waiting requester sees its channel close.
    pub fn cancel_all(&self) -> usize {
        let pending = self.inner.len();
        self.inner.clear();
        pending
    }

    pub fn pending(&self) -> usize {
        self.inner.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn failed() -> RefreshOutcome {
        RefreshOutcome::Failed {
            stage: None,
            message: "boom".to_string(),
        }
    }

    #[tokio::test]
    async fn delivers_to_registered_receiver() {
        let mailbox = RefreshMailbox::new();
        let id = Uuid::new_v4();
        let rx = mailbox.register(id);

        mailbox.deliver(id, failed()).expect("deliver");
        assert!(matches!(
            rx.await.expect("outcome"),
            RefreshOutcome::Failed { .. }
        ));
        assert_eq!(mailbox.pending(), 0);
    }

    #[test]
    fn unknown_id_is_reported() {
        let mailbox = RefreshMailbox::new();
        assert_eq!(
            mailbox.deliver(Uuid::new_v4(), failed()),
            Err(MailboxError::UnknownTrackingId)
        );
    }

    #[test]
    fn dropped_receiver_is_reported() {
        let mailbox = RefreshMailbox::new();
        let id = Uuid::new_v4();
        drop(mailbox.register(id));
        assert_eq!(mailbox.deliver(id, failed()), Err(MailboxError::ChannelClosed));
    }

    #[tokio::test]
    async fn cancel_closes_receiver() {
        let mailbox = RefreshMailbox::new();
        let id = Uuid::new_v4();
        let rx = mailbox.register(id);
        mailbox.cancel(id);
        assert!(rx.await.is_err());
    }

    #[tokio::test]
    async fn cancel_all_closes_every_receiver() {
        let mailbox = RefreshMailbox::new();
        let first = mailbox.register(Uuid::new_v4());
        let second = mailbox.register(Uuid::new_v4());

        assert_eq!(mailbox.cancel_all(), 2);
        assert_eq!(mailbox.pending(), 0);
        assert!(first.await.is_err());
        assert!(second.await.is_err());
    }
}
