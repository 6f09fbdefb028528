// Data model for the chat core: identities, contacts and message timelines

use log::warn;
use serde::{Deserialize, Serialize};
use std::fmt;

/// The authenticated principal that owns a connection and a contact scope.
///
/// The credential is handed over by the session collaborator and is never
/// inspected here, only forwarded at handshake and roster query time.
#[derive(Clone, PartialEq, Eq)]
pub struct Identity {
    pub id: String,
    credential: String,
}

impl Identity {
    pub fn new(id: impl Into<String>, credential: impl Into<String>) -> Self {
        Identity {
            id: id.into(),
            credential: credential.into(),
        }
    }

    pub fn credential(&self) -> &str {
        &self.credential
    }
}

impl fmt::Debug for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Identity")
            .field("id", &self.id)
            .field("credential", &"<redacted>")
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Contact {
    pub id: String,
    pub display_name: String,
    pub status: ContactStatus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ContactStatus {
    Online,
    #[default]
    Offline,
    Away,
}

impl ContactStatus {
    /// Map a presence status string pushed by the server
    pub fn from_wire(status: &str) -> Self {
        match status.trim().to_ascii_lowercase().as_str() {
            "online" | "available" | "chat" => ContactStatus::Online,
            "away" | "xa" | "dnd" => ContactStatus::Away,
            "offline" | "unavailable" => ContactStatus::Offline,
            other => {
                warn!("Unknown presence status '{}', treating as offline", other);
                ContactStatus::Offline
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Direction {
    Outgoing,
    Incoming,
}

#[derive(Debug, PartialEq, Eq, Clone, Copy, Serialize)]
pub enum DeliveryStatus {
    Pending = 1,      // Submitted, not yet written to the transport
    Sent = 2,         // Written to the transport, waiting for the server ack
    Acknowledged = 3, // Server acknowledged the local sequence number
    Failed = 4,       // Timed out or the connection was given up
    Received = 5,     // Incoming message, nothing left to track
}

impl DeliveryStatus {
    /// Whether `next` is a legal forward step from `self`.
    pub fn can_advance_to(self, next: DeliveryStatus) -> bool {
        use DeliveryStatus::*;
        matches!(
            (self, next),
            (Pending, Sent) | (Sent, Acknowledged) | (Pending, Failed) | (Sent, Failed)
        )
    }

    pub fn is_final(self) -> bool {
        matches!(
            self,
            DeliveryStatus::Acknowledged | DeliveryStatus::Failed | DeliveryStatus::Received
        )
    }
}

/// Identifies one message across all sessions of an identity.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MessageKey {
    pub peer_id: String,
    pub local_seq: u64,
}

impl MessageKey {
    pub fn new(peer_id: impl Into<String>, local_seq: u64) -> Self {
        MessageKey {
            peer_id: peer_id.into(),
            local_seq,
        }
    }
}

impl fmt::Display for MessageKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.peer_id, self.local_seq)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Message {
    pub local_seq: u64,
    pub peer_id: String,
    pub direction: Direction,
    pub payload: String,
    pub timestamp: u64,
    pub server_seq: Option<u64>,
    pub server_timestamp: Option<u64>,
    delivery_status: DeliveryStatus,
}

impl Message {
    pub(crate) fn outgoing(peer_id: &str, local_seq: u64, payload: String) -> Self {
        Message {
            local_seq,
            peer_id: peer_id.to_string(),
            direction: Direction::Outgoing,
            payload,
            timestamp: chrono::Utc::now().timestamp() as u64,
            server_seq: None,
            server_timestamp: None,
            delivery_status: DeliveryStatus::Pending,
        }
    }

    pub(crate) fn incoming(
        peer_id: &str,
        local_seq: u64,
        payload: String,
        server_seq: u64,
        server_timestamp: Option<u64>,
    ) -> Self {
        Message {
            local_seq,
            peer_id: peer_id.to_string(),
            direction: Direction::Incoming,
            payload,
            timestamp: chrono::Utc::now().timestamp() as u64,
            server_seq: Some(server_seq),
            server_timestamp,
            delivery_status: DeliveryStatus::Received,
        }
    }

    pub fn delivery_status(&self) -> DeliveryStatus {
        self.delivery_status
    }

    pub fn key(&self) -> MessageKey {
        MessageKey::new(self.peer_id.clone(), self.local_seq)
    }

    /// Move the delivery status forward. Returns false and leaves the
    /// message untouched when the step would go backwards or sideways.
    pub(crate) fn advance(&mut self, next: DeliveryStatus) -> bool {
        if !self.delivery_status.can_advance_to(next) {
            warn!(
                "Rejected delivery transition {:?} -> {:?} for {}",
                self.delivery_status,
                next,
                self.key()
            );
            return false;
        }
        self.delivery_status = next;
        true
    }
}
