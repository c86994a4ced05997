//! In-process command channel between the coordinator and the worker.

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::application::commands::{BusError, Command, CommandBus};

pub const DEFAULT_CHANNEL_CAPACITY: usize = 16;

#[derive(Clone)]
pub struct LocalCommandBus {
    sender: mpsc::Sender<Command>,
}

#[async_trait]
impl CommandBus for LocalCommandBus {
    async fn publish(&self, command: Command) -> Result<(), BusError> {
        self.sender.try_send(command).map_err(|err| match err {
            mpsc::error::TrySendError::Full(_) => BusError::Full,
            mpsc::error::TrySendError::Closed(_) => BusError::Closed,
        })
    }
}

/// Bus plus the receiving end to hand to a `RefreshWorker`.
pub fn local_channel(capacity: usize) -> (LocalCommandBus, mpsc::Receiver<Command>) {
    let (sender, receiver) = mpsc::channel(capacity.max(1));
    (LocalCommandBus { sender }, receiver)
}
