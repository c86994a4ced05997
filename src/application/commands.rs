//! Commands published to the background refresh worker.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Wire shape: `{"cmd": "refresh", "tracking_id": "..."}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "cmd", rename_all = "snake_case")]
pub enum Command {
    Refresh { tracking_id: Uuid },
}

impl Command {
    pub fn tracking_id(&self) -> Uuid {
        match self {
            Command::Refresh { tracking_id } => *tracking_id,
        }
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BusError {
    #[error("command channel closed")]
    Closed,
    #[error("command channel is full")]
    Full,
}

/// Fire-and-forget delivery of commands to the worker.
#[async_trait]
pub trait CommandBus: Send + Sync {
    async fn publish(&self, command: Command) -> Result<(), BusError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn refresh_command_serializes_with_cmd_tag() {
        let tracking_id = Uuid::nil();
        let json = serde_json::to_value(Command::Refresh { tracking_id }).expect("serialize");
        assert_eq!(
            json,
            serde_json::json!({
                "cmd": "refresh",
                "tracking_id": "00000000-0000-0000-0000-000000000000",
            })
        );
    }
}
