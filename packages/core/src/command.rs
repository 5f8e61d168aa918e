//! Control messages carried on the command channel.

use serde::{Deserialize, Serialize};

use crate::ExecId;
use crate::error::QueueError;

/// Key addressing every worker.
pub const WILDCARD: &str = "*";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandAction {
    /// Stop the job named by the key.
    Cancel,
    /// Stop the worker named by the key (or every worker for a public wildcard).
    Shutdown,
}

/// Which workers should react to a command.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Visibility {
    /// Any worker may react, including to the wildcard key.
    Public,
    /// Only the owner of the key reacts.
    #[default]
    Private,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Command {
    pub key: String,
    pub action: CommandAction,
    #[serde(default)]
    pub visibility: Visibility,
}

impl Command {
    pub fn cancel(exec_id: &ExecId) -> Self {
        Self {
            key: exec_id.to_string(),
            action: CommandAction::Cancel,
            visibility: Visibility::Private,
        }
    }

    pub fn shutdown(worker_id: impl Into<String>) -> Self {
        Self {
            key: worker_id.into(),
            action: CommandAction::Shutdown,
            visibility: Visibility::Private,
        }
    }

    /// Shutdown addressed to every worker listening on the channel.
    pub fn shutdown_all() -> Self {
        Self {
            key: WILDCARD.to_string(),
            action: CommandAction::Shutdown,
            visibility: Visibility::Public,
        }
    }

    /// Whether a worker should interpret this command.
    ///
    /// `owns` answers whether the worker currently holds the job named by a key.
    pub fn is_addressed_to(&self, worker_id: &str, owns: impl Fn(&str) -> bool) -> bool {
        if self.key == worker_id || owns(&self.key) {
            return true;
        }
        self.visibility == Visibility::Public && self.key == WILDCARD
    }

    pub fn encode(&self) -> Result<String, QueueError> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn decode(raw: &str) -> Result<Self, QueueError> {
        Ok(serde_json::from_str(raw)?)
    }
}
