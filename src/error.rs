// Error taxonomy for the chat core

use std::time::Duration;
use thiserror::Error;

/// Connection-level failures. Recovered by the connection manager's
/// reconnect loop until the retry budget runs out.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("Failed to connect: {0}")]
    Connect(String),

    #[error("Handshake timed out after {0:?}")]
    HandshakeTimeout(Duration),

    #[error("Connection closed by peer")]
    Closed,

    #[error("Transport I/O error: {0}")]
    Io(String),
}

/// Roster query failures. The directory keeps its previous contents.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RosterFetchError {
    #[error("Roster request failed: {0}")]
    Request(String),

    #[error("Roster endpoint returned HTTP {0}")]
    Status(u16),

    #[error("Malformed roster payload: {0}")]
    Malformed(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ChatError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("Gave up after {attempts} reconnect attempts, last error: {last_error}")]
    ConnectivityExhausted {
        attempts: u32,
        last_error: TransportError,
    },

    #[error(transparent)]
    RosterFetch(#[from] RosterFetchError),

    #[error("Unknown contact: {0}")]
    UnknownContact(String),

    #[error("Message {local_seq} to {peer_id} was not acknowledged within {timeout:?}")]
    DeliveryTimeout {
        peer_id: String,
        local_seq: u64,
        timeout: Duration,
    },

    #[error("Identity has logged out")]
    LoggedOut,

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

pub type ChatResult<T> = Result<T, ChatError>;
