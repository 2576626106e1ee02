//! Render queue errors.

use thiserror::Error;

use crate::queue::{CommandId, RenderQueueType};

/// Errors surfaced by render queues.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RenderError {
    /// A queue region has no room left for the entry.
    #[error("Render queue {region} region full ({capacity} bytes)")]
    QueueFull {
        region: &'static str,
        capacity: usize,
    },

    /// The command id was not recorded into this queue.
    #[error("Unknown render command {0:?}")]
    UnknownCommand(CommandId),

    /// The command already continues into another command.
    #[error("Render command {0:?} is already linked")]
    AlreadyLinked(CommandId),

    /// Linking would make the continuation chain loop.
    #[error("Linking {0:?} would form a cycle")]
    LinkCycle(CommandId),

    /// The submit call does not match the queue's key layout.
    #[error("Queue of type {0:?} cannot take this submission")]
    WrongQueueType(RenderQueueType),
}

/// Result type for render queue operations.
pub type Result<T> = std::result::Result<T, RenderError>;
