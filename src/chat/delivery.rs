// Message delivery pipeline
// Sits between the conversation sessions and the connection: sequencing,
// the reconnect flush queue, acknowledgment matching and delivery timeouts

use log::{debug, info, warn};
use std::collections::{HashMap, HashSet, VecDeque};
use std::time::{Duration, Instant};

use super::roster::ContactDirectory;
use super::session::SessionRegistry;
use super::transport::OutboundFrame;
use super::ChatUpdate;
use crate::error::ChatError;
use crate::models::{DeliveryStatus, MessageKey};

/// Messages kept per unlisted peer; the oldest are dropped beyond this.
const MAX_PARKED_PER_PEER: usize = 100;
/// Unlisted peers tracked at once; messages from further peers are dropped.
const MAX_PARKED_PEERS: usize = 50;

/// Incoming message from a peer the directory does not know (yet).
#[derive(Debug, Clone)]
struct ParkedMessage {
    payload: String,
    server_seq: u64,
    timestamp: Option<u64>,
}

#[derive(Debug, Default)]
struct ParkedQueue {
    messages: VecDeque<ParkedMessage>,
    server_seqs: HashSet<u64>,
}

impl ParkedQueue {
    /// Returns false for a server seq that is already parked.
    fn push(&mut self, message: ParkedMessage) -> bool {
        if !self.server_seqs.insert(message.server_seq) {
            return false;
        }
        if self.messages.len() == MAX_PARKED_PER_PEER {
            if let Some(oldest) = self.messages.pop_front() {
                self.server_seqs.remove(&oldest.server_seq);
                warn!("Parked queue full, dropping message with server seq {}", oldest.server_seq);
            }
        }
        self.messages.push_back(message);
        true
    }
}

#[derive(Debug)]
pub struct DeliveryPipeline {
    /// Pending messages in global submission order
    outbox: VecDeque<MessageKey>,
    /// Pending messages already handed to the current connection
    in_flight: HashSet<MessageKey>,
    /// Sent messages with their ack deadline, oldest first
    awaiting_ack: VecDeque<(MessageKey, Instant)>,
    parked: HashMap<String, ParkedQueue>,
    ack_timeout: Duration,
}

impl DeliveryPipeline {
    pub fn new(ack_timeout: Duration) -> Self {
        DeliveryPipeline {
            outbox: VecDeque::new(),
            in_flight: HashSet::new(),
            awaiting_ack: VecDeque::new(),
            parked: HashMap::new(),
            ack_timeout,
        }
    }

    /// Append a pending message to the peer's timeline and queue it.
    /// The caller has already checked the peer against the directory.
    pub fn submit(&mut self, sessions: &mut SessionRegistry, peer_id: &str, payload: String) -> u64 {
        let local_seq = sessions.get_or_create(peer_id).push_outgoing(payload);
        let key = MessageKey::new(peer_id, local_seq);
        info!("Queued message {} ({} pending)", key, self.outbox.len() + 1);
        self.outbox.push_back(key);
        local_seq
    }

    /// Frames for every queued message not yet handed to the connection,
    /// in submission order. The returned messages count as in flight.
    pub fn take_ready(&mut self, sessions: &SessionRegistry) -> Vec<OutboundFrame> {
        let mut frames = Vec::new();
        for key in &self.outbox {
            if self.in_flight.contains(key) {
                continue;
            }
            let Some(message) = sessions.get(&key.peer_id).and_then(|s| s.message(key.local_seq)) else {
                warn!("Queued message {} has no timeline entry", key);
                continue;
            };
            frames.push(OutboundFrame::Message {
                peer_id: key.peer_id.clone(),
                payload: message.payload.clone(),
                local_seq: key.local_seq,
            });
            self.in_flight.insert(key.clone());
        }
        if !frames.is_empty() {
            debug!("Flushing {} queued messages", frames.len());
        }
        frames
    }

    /// The connection wrote the frame for `key`: pending -> sent.
    pub fn on_written(
        &mut self,
        sessions: &mut SessionRegistry,
        key: MessageKey,
        now: Instant,
    ) -> Option<ChatUpdate> {
        self.in_flight.remove(&key);
        let Some(position) = self.outbox.iter().position(|k| *k == key) else {
            debug!("Write confirmation for {} which is no longer queued", key);
            return None;
        };
        self.outbox.remove(position);

        let message = sessions.get_mut(&key.peer_id)?.message_mut(key.local_seq)?;
        if !message.advance(DeliveryStatus::Sent) {
            return None;
        }
        self.awaiting_ack.push_back((key.clone(), now + self.ack_timeout));
        Some(ChatUpdate::DeliveryChanged { key, status: DeliveryStatus::Sent })
    }

    /// Frames handed to a connection that has since gone away were never
    /// written; they stay pending and go out again on the next flush.
    pub fn on_transport_lost(&mut self) {
        if !self.in_flight.is_empty() {
            debug!("Returning {} unwritten messages to the queue", self.in_flight.len());
            self.in_flight.clear();
        }
    }

    /// Server acknowledgment: sent -> acknowledged. Without a peer id the
    /// oldest unacknowledged message with that sequence number is matched.
    pub fn on_ack(
        &mut self,
        sessions: &mut SessionRegistry,
        local_seq: u64,
        peer_id: Option<&str>,
    ) -> Option<ChatUpdate> {
        let position = self.awaiting_ack.iter().position(|(key, _)| {
            key.local_seq == local_seq && peer_id.map_or(true, |p| p == key.peer_id)
        });
        let Some(position) = position else {
            debug!("Ack for seq {} ({:?}) matches no sent message", local_seq, peer_id);
            return None;
        };
        let (key, _) = self.awaiting_ack.remove(position)?;

        let message = sessions.get_mut(&key.peer_id)?.message_mut(key.local_seq)?;
        if !message.advance(DeliveryStatus::Acknowledged) {
            return None;
        }
        debug!("Message {} acknowledged", key);
        Some(ChatUpdate::DeliveryChanged { key, status: DeliveryStatus::Acknowledged })
    }

    /// Fail every sent message whose ack deadline has passed.
    pub fn expire(&mut self, sessions: &mut SessionRegistry, now: Instant) -> Vec<ChatUpdate> {
        let mut updates = Vec::new();
        while let Some((_, deadline)) = self.awaiting_ack.front() {
            if *deadline > now {
                break;
            }
            let Some((key, _)) = self.awaiting_ack.pop_front() else {
                break;
            };
            warn!("No ack for {} within {:?}", key, self.ack_timeout);
            let reason = ChatError::DeliveryTimeout {
                peer_id: key.peer_id.clone(),
                local_seq: key.local_seq,
                timeout: self.ack_timeout,
            };
            updates.extend(Self::fail(sessions, key, reason));
        }
        updates
    }

    /// Fail everything still pending or waiting for an ack.
    pub fn fail_all(&mut self, sessions: &mut SessionRegistry, reason: &ChatError) -> Vec<ChatUpdate> {
        self.in_flight.clear();
        let keys: Vec<MessageKey> = self
            .awaiting_ack
            .drain(..)
            .map(|(key, _)| key)
            .chain(self.outbox.drain(..))
            .collect();
        if !keys.is_empty() {
            warn!("Failing {} undelivered messages: {}", keys.len(), reason);
        }
        keys.into_iter()
            .filter_map(|key| Self::fail(sessions, key, reason.clone()))
            .collect()
    }

    /// Fail and forget the outstanding messages of a peer that left the
    /// directory.
    pub fn forget_peer(&mut self, sessions: &mut SessionRegistry, peer_id: &str) -> Vec<ChatUpdate> {
        let reason = ChatError::UnknownContact(peer_id.to_string());
        let mut keys: Vec<MessageKey> = Vec::new();

        self.awaiting_ack.retain(|(key, _)| {
            if key.peer_id == peer_id {
                keys.push(key.clone());
                false
            } else {
                true
            }
        });
        self.outbox.retain(|key| {
            if key.peer_id == peer_id {
                keys.push(key.clone());
                false
            } else {
                true
            }
        });
        self.in_flight.retain(|key| key.peer_id != peer_id);

        keys.into_iter()
            .filter_map(|key| Self::fail(sessions, key, reason.clone()))
            .collect()
    }

    fn fail(sessions: &mut SessionRegistry, key: MessageKey, reason: ChatError) -> Option<ChatUpdate> {
        let message = sessions.get_mut(&key.peer_id)?.message_mut(key.local_seq)?;
        if !message.advance(DeliveryStatus::Failed) {
            return None;
        }
        Some(ChatUpdate::DeliveryFailed { key, reason })
    }

    /// Record a message pushed by the server. Messages from peers missing in
    /// the directory are parked until a roster load brings the peer in.
    pub fn on_incoming(
        &mut self,
        sessions: &mut SessionRegistry,
        directory: &ContactDirectory,
        peer_id: String,
        payload: String,
        server_seq: u64,
        timestamp: Option<u64>,
    ) -> Option<ChatUpdate> {
        if !directory.contains(&peer_id) {
            self.park(peer_id, ParkedMessage { payload, server_seq, timestamp });
            return None;
        }

        let local_seq = sessions
            .get_or_create(&peer_id)
            .push_incoming(payload, server_seq, timestamp)?;
        let active = sessions.is_active(&peer_id);
        debug!("Recorded message {}#{} (active: {})", peer_id, local_seq, active);
        Some(ChatUpdate::MessageReceived { peer_id, local_seq, active })
    }

    fn park(&mut self, peer_id: String, message: ParkedMessage) {
        if !self.parked.contains_key(&peer_id) && self.parked.len() >= MAX_PARKED_PEERS {
            warn!("Too many unknown peers parked, dropping message from {}", peer_id);
            return;
        }
        let server_seq = message.server_seq;
        if self.parked.entry(peer_id.clone()).or_default().push(message) {
            info!("Parking message from {} until the contact is known", peer_id);
        } else {
            debug!("Ignoring duplicate parked message {} from {}", server_seq, peer_id);
        }
    }

    /// Move parked messages of peers that are now in the directory into
    /// their sessions. Peers are taken in directory order, each peer's
    /// messages in arrival order.
    pub fn adopt_parked(&mut self, sessions: &mut SessionRegistry, directory: &ContactDirectory) -> Vec<ChatUpdate> {
        let mut updates = Vec::new();
        if self.parked.is_empty() {
            return updates;
        }
        for contact in directory.contacts() {
            let Some(queue) = self.parked.remove(&contact.id) else {
                continue;
            };
            for m in queue.messages {
                updates.extend(self.on_incoming(
                    sessions,
                    directory,
                    contact.id.clone(),
                    m.payload,
                    m.server_seq,
                    m.timestamp,
                ));
            }
        }
        updates
    }

    pub fn queued(&self) -> usize {
        self.outbox.len()
    }

    pub fn awaiting_ack(&self) -> usize {
        self.awaiting_ack.len()
    }

    pub fn parked(&self) -> usize {
        self.parked.values().map(|q| q.messages.len()).sum()
    }
}
