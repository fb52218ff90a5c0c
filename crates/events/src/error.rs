//! Broker error model.

use newsflow_core::DomainError;

pub type BrokerResult<T> = Result<T, BrokerError>;

/// Errors raised by broker connections, channels and publishers.
///
/// Cloneable so that a single connect outcome can be handed to every caller
/// waiting on the same in-flight attempt.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BrokerError {
    #[error("broker connection error: {0}")]
    Connection(String),

    #[error("broker unreachable after {attempts} attempts: {last_error}")]
    ConnectionExhausted { attempts: u32, last_error: String },

    #[error("broker channel not initialized")]
    ChannelUnavailable,

    #[error("broker channel closed")]
    ChannelClosed,

    #[error("broker command error: {0}")]
    Command(String),

    #[error("message serialization error: {0}")]
    Serialization(String),

    #[error("connect attempt was abandoned before completing")]
    ConnectAborted,
}

impl BrokerError {
    pub fn connection(msg: impl Into<String>) -> Self {
        Self::Connection(msg.into())
    }

    pub fn command(msg: impl Into<String>) -> Self {
        Self::Command(msg.into())
    }

    /// True when the channel (or the connection under it) is gone and the
    /// operation can only succeed after a reconnect.
    pub fn is_closed(&self) -> bool {
        matches!(self, Self::ChannelClosed | Self::Connection(_))
    }

    /// True when the connect budget has been spent; callers treat this as fatal.
    pub fn is_exhausted(&self) -> bool {
        matches!(self, Self::ConnectionExhausted { .. })
    }
}

impl From<DomainError> for BrokerError {
    fn from(err: DomainError) -> Self {
        Self::Serialization(err.to_string())
    }
}
