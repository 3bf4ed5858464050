use shared::{error::ErrorCode, protocol::TerminalReason};
use thiserror::Error;

/// Why an outbound message was not delivered.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SendError {
    #[error("no connected session for tenant")]
    NotConnected,
    #[error("message was not flushed before the queue deadline")]
    Timeout,
    #[error("session closed terminally ({0:?}); the tenant must pair again")]
    Terminal(TerminalReason),
    #[error("reconnect attempts exhausted")]
    MaxReconnectAttempts,
    #[error("network rejected the message: {0}")]
    Network(String),
}

impl SendError {
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::NotConnected => ErrorCode::NotConnected,
            Self::Timeout => ErrorCode::Timeout,
            Self::Terminal(_) => ErrorCode::Terminal,
            Self::MaxReconnectAttempts => ErrorCode::MaxReconnectAttempts,
            Self::Network(_) => ErrorCode::NetworkError,
        }
    }

    /// Error handed to callers once a connection has reached `reason`.
    pub fn for_terminal(reason: TerminalReason) -> Self {
        match reason {
            TerminalReason::MaxReconnectAttempts => Self::MaxReconnectAttempts,
            TerminalReason::LeaseLost => Self::NotConnected,
            other => Self::Terminal(other),
        }
    }
}
