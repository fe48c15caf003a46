//! Error types for broker and conversation operations

use std::time::Duration;
use thiserror::Error;

use crate::types::{IdValidationError, Role};

/// Result type for broker primitives
pub type BrokerResult<T> = Result<T, BrokerError>;

/// Result type for conversation operations
pub type ConversationResult<T> = Result<T, ConversationError>;

/// Errors reported by a broker backend
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BrokerError {
    /// The broker could not be reached or refused the handshake
    #[error("Broker unreachable: {0}")]
    Unreachable(String),

    /// The connection was closed or lost
    #[error("Connection closed")]
    ConnectionClosed,

    /// The channel was closed
    #[error("Channel closed")]
    ChannelClosed,

    /// A named entity does not exist on the broker
    #[error("{kind} not found: {name}")]
    NotFound { kind: &'static str, name: String },

    /// Redeclaration with incompatible properties
    #[error("Precondition failed: {0}")]
    PreconditionFailed(String),

    /// Ack for a delivery this channel does not hold
    #[error("Unknown delivery tag: {0}")]
    UnknownDeliveryTag(u64),

    /// Message body could not be decoded
    #[error("Invalid payload: {0}")]
    InvalidPayload(String),

    /// Backend-specific error
    #[error("Backend error: {0}")]
    Backend(String),
}

#[cfg(feature = "amqp")]
impl From<lapin::Error> for BrokerError {
    fn from(err: lapin::Error) -> Self {
        match err {
            lapin::Error::InvalidChannelState(_) => BrokerError::ChannelClosed,
            lapin::Error::InvalidConnectionState(_) => BrokerError::ConnectionClosed,
            other => BrokerError::Backend(other.to_string()),
        }
    }
}

/// Errors that abort a conversation session or round
#[derive(Error, Debug)]
pub enum ConversationError {
    /// Broker unreachable or handshake failure during topology setup
    #[error("Connectivity error: {0}")]
    Connectivity(#[source] BrokerError),

    /// Channel or connection failure during publish or consume
    #[error("Transport error: {0}")]
    Transport(#[source] BrokerError),

    /// Invalid role, mismatched sequences or malformed settings
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// The retry policy's attempt limit was reached while waiting
    #[error("{role} gave up waiting in round {round} after {attempts} attempts")]
    RetryExhausted {
        role: Role,
        round: usize,
        attempts: u32,
    },

    /// The retry policy's round deadline passed while waiting
    #[error("{role} round {round} exceeded its deadline of {deadline:?}")]
    DeadlineExceeded {
        role: Role,
        round: usize,
        deadline: Duration,
    },

    /// The broker negatively acknowledged a publish (strict confirm policy)
    #[error("Broker rejected publish on routing key '{routing_key}'")]
    PublishRejected { routing_key: String },
}

impl ConversationError {
    /// Process exit code for this error
    ///
    /// Configuration problems exit with 2, everything else with 1.
    pub fn exit_code(&self) -> i32 {
        match self {
            ConversationError::Configuration(_) => 2,
            _ => 1,
        }
    }

    /// Whether the error happened before any round could run
    pub fn is_setup_failure(&self) -> bool {
        matches!(
            self,
            ConversationError::Configuration(_) | ConversationError::Connectivity(_)
        )
    }
}

impl From<IdValidationError> for ConversationError {
    fn from(err: IdValidationError) -> Self {
        ConversationError::Configuration(err.to_string())
    }
}
