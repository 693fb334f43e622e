//! Error types for subscriber operations.

use crate::types::{Command, Reply};
use std::time::Duration;
use thiserror::Error;

/// Main error type for subscriber operations.
#[derive(Debug, Error)]
pub enum SubscriberError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid channel: {0}")]
    InvalidChannel(String),

    #[error("No server available for {command}")]
    NoServerAvailable { command: Command },

    #[error("Server error: {0}")]
    Server(String),

    #[error("Connection closed before a reply was received")]
    ConnectionClosed,

    #[error("Timed out after {0:?} waiting for a reply")]
    Timeout(Duration),

    #[error("Unexpected reply to {command}: {reply:?}")]
    UnexpectedReply { command: Command, reply: Reply },

    #[error("Subscriber has been shut down")]
    ShutDown,
}

/// Result type for subscriber operations.
pub type Result<T> = std::result::Result<T, SubscriberError>;
