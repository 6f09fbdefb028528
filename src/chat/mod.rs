// Chat core
// Single-writer state for one identity: directory, sessions and the delivery pipeline.
// The connection task feeds it `ConnectionEvent`s; everything else goes through `ChatCore`.

pub mod client;
pub mod connection;
pub mod delivery;
pub mod presence;
pub mod roster;
pub mod session;
pub mod transport;

use log::{debug, info, warn};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;

use self::connection::{ConnectionEvent, ConnectionState, Outbound};
use self::delivery::DeliveryPipeline;
use self::presence::PresenceTracker;
use self::roster::{ContactDirectory, RosterEntry};
use self::session::{ConversationSession, SessionRegistry};
use self::transport::InboundFrame;
use crate::error::{ChatError, ChatResult, RosterFetchError};
use crate::models::{ContactStatus, DeliveryStatus, Identity, MessageKey};

/// Observable changes, in the order they were applied.
#[derive(Debug, Clone, PartialEq)]
pub enum ChatUpdate {
    ConnectionChanged(ConnectionState),
    RosterLoaded { contacts: usize },
    PresenceChanged { contact_id: String, status: ContactStatus },
    /// `active` tells whether the peer's session was the selected one.
    MessageReceived { peer_id: String, local_seq: u64, active: bool },
    DeliveryChanged { key: MessageKey, status: DeliveryStatus },
    DeliveryFailed { key: MessageKey, reason: ChatError },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CoreStats {
    pub sessions: usize,
    pub queued: usize,
    pub awaiting_ack: usize,
    pub parked: usize,
    pub presence_applied: u64,
    pub presence_dropped: u64,
}

pub struct ChatCore {
    identity: Identity,
    state: ConnectionState,
    generation: u64,
    directory: ContactDirectory,
    presence: PresenceTracker,
    sessions: SessionRegistry,
    pipeline: DeliveryPipeline,
    outbound: mpsc::UnboundedSender<Outbound>,
    logged_out: bool,
}

impl ChatCore {
    pub fn new(identity: Identity, ack_timeout: Duration, outbound: mpsc::UnboundedSender<Outbound>) -> Self {
        ChatCore {
            identity,
            state: ConnectionState::Disconnected(None),
            generation: 0,
            directory: ContactDirectory::new(),
            presence: PresenceTracker::new(),
            sessions: SessionRegistry::new(),
            pipeline: DeliveryPipeline::new(ack_timeout),
            outbound,
            logged_out: false,
        }
    }

    /// Record an outgoing message for `peer_id` and hand it to the connection
    /// when there is one. Returns the message's local sequence number.
    pub fn submit(&mut self, peer_id: &str, payload: impl Into<String>) -> ChatResult<u64> {
        if self.logged_out {
            return Err(ChatError::LoggedOut);
        }
        if let ConnectionState::Disconnected(Some(reason)) = &self.state {
            return Err(reason.clone());
        }
        if !self.directory.contains(peer_id) {
            return Err(ChatError::UnknownContact(peer_id.to_string()));
        }

        let local_seq = self.pipeline.submit(&mut self.sessions, peer_id, payload.into());
        self.flush();
        Ok(local_seq)
    }

    pub fn select(&mut self, peer_id: &str) -> ChatResult<&ConversationSession> {
        self.sessions.select(peer_id, &self.directory)
    }

    pub fn deselect(&mut self) -> Option<String> {
        self.sessions.deselect()
    }

    /// Install a freshly fetched roster. Sessions of peers that left the
    /// roster are dropped along with their undelivered messages; parked
    /// messages of peers that joined are moved into their sessions.
    pub fn replace_roster(&mut self, entries: Vec<RosterEntry>) -> Vec<ChatUpdate> {
        let removed = self.directory.replace(entries);
        let mut updates = vec![ChatUpdate::RosterLoaded { contacts: self.directory.len() }];

        for peer_id in removed {
            updates.extend(self.pipeline.forget_peer(&mut self.sessions, &peer_id));
            if self.sessions.remove(&peer_id) {
                info!("Dropped conversation with {} (no longer in roster)", peer_id);
            }
        }
        updates.extend(self.pipeline.adopt_parked(&mut self.sessions, &self.directory));
        updates
    }

    pub fn record_roster_failure(&mut self, error: RosterFetchError) {
        self.directory.record_failure(error);
    }

    /// Apply one event from the connection task.
    pub fn handle(&mut self, event: ConnectionEvent, now: Instant) -> Vec<ChatUpdate> {
        match event {
            ConnectionEvent::StateChanged { state, generation } => self.on_state(state, generation),
            ConnectionEvent::FrameWritten { key } => self
                .pipeline
                .on_written(&mut self.sessions, key, now)
                .into_iter()
                .collect(),
            ConnectionEvent::Inbound(frame) => self.on_inbound(frame),
        }
    }

    fn on_state(&mut self, state: ConnectionState, generation: u64) -> Vec<ChatUpdate> {
        info!("Connection state {:?} -> {:?}", self.state, state);
        self.state = state.clone();
        let mut updates = vec![ChatUpdate::ConnectionChanged(state.clone())];

        match &state {
            ConnectionState::Connected => {
                self.generation = generation;
                self.pipeline.on_transport_lost();
                self.flush();
            }
            ConnectionState::Connecting | ConnectionState::Reconnecting { .. } => {
                self.pipeline.on_transport_lost();
            }
            ConnectionState::Disconnected(reason) => {
                let reason = reason.clone().unwrap_or(ChatError::LoggedOut);
                updates.extend(self.pipeline.fail_all(&mut self.sessions, &reason));
            }
        }

        for contact_id in self.presence.on_connection_state(&mut self.directory, &state) {
            updates.push(ChatUpdate::PresenceChanged { contact_id, status: ContactStatus::Offline });
        }
        updates
    }

    fn on_inbound(&mut self, frame: InboundFrame) -> Vec<ChatUpdate> {
        let update = match frame {
            InboundFrame::Presence { contact_id, status } => self
                .presence
                .on_presence(&mut self.directory, &contact_id, &status)
                .map(|status| ChatUpdate::PresenceChanged { contact_id, status }),
            InboundFrame::Message { peer_id, payload, server_seq, timestamp } => self.pipeline.on_incoming(
                &mut self.sessions,
                &self.directory,
                peer_id,
                payload,
                server_seq,
                timestamp,
            ),
            InboundFrame::Ack { local_seq, peer_id } => {
                self.pipeline.on_ack(&mut self.sessions, local_seq, peer_id.as_deref())
            }
        };
        update.into_iter().collect()
    }

    /// Fail sent messages whose ack did not arrive in time.
    pub fn expire(&mut self, now: Instant) -> Vec<ChatUpdate> {
        self.pipeline.expire(&mut self.sessions, now)
    }

    /// Stop accepting messages and fail everything undelivered. The
    /// connection itself is closed by the owner of the connection handle.
    pub fn logout(&mut self) -> Vec<ChatUpdate> {
        if self.logged_out {
            return Vec::new();
        }
        info!("Logging out identity {}", self.identity.id);
        self.logged_out = true;
        self.pipeline.fail_all(&mut self.sessions, &ChatError::LoggedOut)
    }

    /// Hand every queued message to the connection, oldest first.
    fn flush(&mut self) {
        if !self.state.is_connected() {
            debug!("Not connected, {} messages stay queued", self.pipeline.queued());
            return;
        }
        for frame in self.pipeline.take_ready(&self.sessions) {
            let outbound = Outbound { generation: self.generation, frame };
            if self.outbound.send(outbound).is_err() {
                warn!("Connection task is gone, keeping messages queued");
                self.pipeline.on_transport_lost();
                break;
            }
        }
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    pub fn connection_state(&self) -> &ConnectionState {
        &self.state
    }

    pub fn directory(&self) -> &ContactDirectory {
        &self.directory
    }

    pub fn sessions(&self) -> &SessionRegistry {
        &self.sessions
    }

    pub fn session(&self, peer_id: &str) -> Option<&ConversationSession> {
        self.sessions.get(peer_id)
    }

    pub fn active_session(&self) -> Option<&ConversationSession> {
        self.sessions.active()
    }

    pub fn is_logged_out(&self) -> bool {
        self.logged_out
    }

    pub fn stats(&self) -> CoreStats {
        CoreStats {
            sessions: self.sessions.len(),
            queued: self.pipeline.queued(),
            awaiting_ack: self.pipeline.awaiting_ack(),
            parked: self.pipeline.parked(),
            presence_applied: self.presence.applied(),
            presence_dropped: self.presence.dropped(),
        }
    }
}
