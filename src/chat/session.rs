// Conversation sessions
// One in-memory timeline per peer, at most one of them selected at a time

use log::{debug, info};
use std::collections::{HashMap, HashSet};

use super::roster::ContactDirectory;
use crate::error::ChatError;
use crate::models::Message;

#[derive(Debug)]
pub struct ConversationSession {
    peer_id: String,
    messages: Vec<Message>,
    active: bool,
    /// Sequence number of the first message in `messages`, minus one
    base_seq: u64,
    last_seq: u64,
    seen_server_seqs: HashSet<u64>,
}

/// What survives of a session whose peer left the directory, so a returning
/// peer never sees a sequence number or server seq twice.
#[derive(Debug)]
struct RetiredSession {
    last_seq: u64,
    seen_server_seqs: HashSet<u64>,
}

impl ConversationSession {
    pub fn new(peer_id: impl Into<String>) -> Self {
        ConversationSession {
            peer_id: peer_id.into(),
            messages: Vec::new(),
            active: false,
            base_seq: 0,
            last_seq: 0,
            seen_server_seqs: HashSet::new(),
        }
    }

    fn resume(peer_id: &str, retired: RetiredSession) -> Self {
        debug!("Resuming conversation with {} after seq {}", peer_id, retired.last_seq);
        ConversationSession {
            peer_id: peer_id.to_string(),
            messages: Vec::new(),
            active: false,
            base_seq: retired.last_seq,
            last_seq: retired.last_seq,
            seen_server_seqs: retired.seen_server_seqs,
        }
    }

    pub fn peer_id(&self) -> &str {
        &self.peer_id
    }

    /// Timeline in the order messages were recorded
    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    pub fn message(&self, local_seq: u64) -> Option<&Message> {
        let index = self.index_of(local_seq)?;
        self.messages.get(index).filter(|m| m.local_seq == local_seq)
    }

    pub(crate) fn message_mut(&mut self, local_seq: u64) -> Option<&mut Message> {
        let index = self.index_of(local_seq)?;
        self.messages.get_mut(index).filter(|m| m.local_seq == local_seq)
    }

    // Sequence numbers are contiguous from base_seq + 1 and never reused
    fn index_of(&self, local_seq: u64) -> Option<usize> {
        let offset = local_seq.checked_sub(self.base_seq + 1)?;
        usize::try_from(offset).ok()
    }

    fn next_seq(&mut self) -> u64 {
        self.last_seq += 1;
        self.last_seq
    }

    pub(crate) fn push_outgoing(&mut self, payload: String) -> u64 {
        let seq = self.next_seq();
        self.messages.push(Message::outgoing(&self.peer_id, seq, payload));
        seq
    }

    /// Record an incoming message. Returns `None` when the server sequence
    /// number was already recorded for this peer.
    pub(crate) fn push_incoming(
        &mut self,
        payload: String,
        server_seq: u64,
        server_timestamp: Option<u64>,
    ) -> Option<u64> {
        if !self.seen_server_seqs.insert(server_seq) {
            debug!("Duplicate server seq {} from {}, ignoring", server_seq, self.peer_id);
            return None;
        }
        let seq = self.next_seq();
        self.messages
            .push(Message::incoming(&self.peer_id, seq, payload, server_seq, server_timestamp));
        Some(seq)
    }
}

/// All conversation sessions of one identity.
#[derive(Debug, Default)]
pub struct SessionRegistry {
    sessions: HashMap<String, ConversationSession>,
    active: Option<String>,
    retired: HashMap<String, RetiredSession>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `peer_id` the active conversation.
    ///
    /// Fails with `UnknownContact`, leaving everything untouched, when the
    /// peer is not in the directory.
    pub fn select(
        &mut self,
        peer_id: &str,
        directory: &ContactDirectory,
    ) -> Result<&ConversationSession, ChatError> {
        if !directory.contains(peer_id) {
            return Err(ChatError::UnknownContact(peer_id.to_string()));
        }

        if let Some(previous) = self.active.take() {
            if let Some(session) = self.sessions.get_mut(&previous) {
                session.active = false;
            }
        }

        let session = self
            .sessions
            .entry(peer_id.to_string())
            .or_insert_with(|| Self::open(&mut self.retired, peer_id));
        session.active = true;
        self.active = Some(peer_id.to_string());
        info!("Selected conversation with {} ({} messages)", peer_id, session.messages.len());
        Ok(session)
    }

    /// Deactivate the current conversation. Its messages stay in memory.
    pub fn deselect(&mut self) -> Option<String> {
        let previous = self.active.take()?;
        if let Some(session) = self.sessions.get_mut(&previous) {
            session.active = false;
        }
        debug!("Deselected conversation with {}", previous);
        Some(previous)
    }

    pub fn active(&self) -> Option<&ConversationSession> {
        self.active.as_ref().and_then(|peer| self.sessions.get(peer))
    }

    pub fn is_active(&self, peer_id: &str) -> bool {
        self.active.as_deref() == Some(peer_id)
    }

    pub fn get(&self, peer_id: &str) -> Option<&ConversationSession> {
        self.sessions.get(peer_id)
    }

    pub(crate) fn get_mut(&mut self, peer_id: &str) -> Option<&mut ConversationSession> {
        self.sessions.get_mut(peer_id)
    }

    /// Callers check the directory first; sessions only exist for known peers.
    pub(crate) fn get_or_create(&mut self, peer_id: &str) -> &mut ConversationSession {
        self.sessions
            .entry(peer_id.to_string())
            .or_insert_with(|| Self::open(&mut self.retired, peer_id))
    }

    fn open(retired: &mut HashMap<String, RetiredSession>, peer_id: &str) -> ConversationSession {
        match retired.remove(peer_id) {
            Some(retired) => ConversationSession::resume(peer_id, retired),
            None => ConversationSession::new(peer_id),
        }
    }

    /// Discard the peer's timeline. Its sequence counter and seen server
    /// seqs are kept for when the peer comes back.
    pub(crate) fn remove(&mut self, peer_id: &str) -> bool {
        if self.active.as_deref() == Some(peer_id) {
            self.active = None;
        }
        let Some(session) = self.sessions.remove(peer_id) else {
            return false;
        };
        self.retired.insert(
            peer_id.to_string(),
            RetiredSession {
                last_seq: session.last_seq,
                seen_server_seqs: session.seen_server_seqs,
            },
        );
        true
    }

    pub(crate) fn len(&self) -> usize {
        self.sessions.len()
    }
}
