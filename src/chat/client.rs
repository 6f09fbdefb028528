// Async driver around ChatCore
// Owns the connection task and feeds its events into the core

use log::{debug, info};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::time::{Interval, MissedTickBehavior};

use super::connection::{ConnectionEvent, ConnectionHandle, ConnectionManager};
use super::roster::{HttpRosterSource, RosterSource};
use super::session::ConversationSession;
use super::transport::{Connector, WebSocketConnector};
use super::{ChatCore, ChatUpdate};
use crate::config::ChatConfig;
use crate::error::{ChatError, ChatResult};
use crate::models::Identity;

pub struct ChatClient {
    core: ChatCore,
    connection: ConnectionHandle,
    events: mpsc::Receiver<ConnectionEvent>,
    events_open: bool,
    roster: Arc<dyn RosterSource>,
    backlog: VecDeque<ChatUpdate>,
    sweep: Interval,
}

impl ChatClient {
    /// Connect with the websocket transport and the HTTP roster endpoint
    /// from `config`.
    pub fn connect(identity: Identity, config: &ChatConfig) -> ChatResult<Self> {
        let connector = Arc::new(WebSocketConnector::new(config.server_url.clone()));
        let roster = Arc::new(HttpRosterSource::from_config(config)?);
        Self::start(identity, config, connector, roster)
    }

    /// Spawn the connection task. Must be called from within a tokio runtime.
    /// Nothing is spawned when `config` does not validate.
    pub fn start(
        identity: Identity,
        config: &ChatConfig,
        connector: Arc<dyn Connector>,
        roster: Arc<dyn RosterSource>,
    ) -> ChatResult<Self> {
        config
            .validate()
            .map_err(|e| ChatError::InvalidConfig(e.to_string()))?;

        let (connection, events) = ConnectionManager::spawn(identity.clone(), connector, config);
        let core = ChatCore::new(identity, config.ack_timeout(), connection.outbound());

        let period = (config.ack_timeout() / 4).clamp(Duration::from_millis(10), Duration::from_secs(1));
        let mut sweep = tokio::time::interval(period);
        sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);

        Ok(ChatClient {
            core,
            connection,
            events,
            events_open: true,
            roster,
            backlog: VecDeque::new(),
            sweep,
        })
    }

    /// Fetch the roster and install it. Connection events keep being applied
    /// while the request is in flight. Returns the number of contacts.
    pub async fn load_contacts(&mut self) -> ChatResult<usize> {
        if self.core.is_logged_out() {
            return Err(ChatError::LoggedOut);
        }

        let roster = Arc::clone(&self.roster);
        let identity = self.core.identity().clone();
        let fetch = async move { roster.fetch_roster(&identity).await };
        tokio::pin!(fetch);

        let result = loop {
            tokio::select! {
                result = &mut fetch => break result,
                event = self.events.recv(), if self.events_open => self.absorb(event),
            }
        };

        match result {
            Ok(entries) => {
                let updates = self.core.replace_roster(entries);
                self.backlog.extend(updates);
                Ok(self.core.directory().len())
            }
            Err(e) => {
                self.core.record_roster_failure(e.clone());
                Err(e.into())
            }
        }
    }

    /// Next observable change. Returns `None` once the connection task has
    /// finished and every update was handed out. Cancel-safe.
    pub async fn next_update(&mut self) -> Option<ChatUpdate> {
        loop {
            if let Some(update) = self.backlog.pop_front() {
                return Some(update);
            }
            if !self.events_open {
                return None;
            }
            tokio::select! {
                event = self.events.recv() => self.absorb(event),
                _ = self.sweep.tick() => {
                    let expired = self.core.expire(Instant::now());
                    self.backlog.extend(expired);
                }
            }
        }
    }

    fn absorb(&mut self, event: Option<ConnectionEvent>) {
        match event {
            Some(event) => {
                let updates = self.core.handle(event, Instant::now());
                self.backlog.extend(updates);
            }
            None => {
                debug!("Connection event stream ended");
                self.events_open = false;
            }
        }
    }

    pub fn submit(&mut self, peer_id: &str, payload: impl Into<String>) -> ChatResult<u64> {
        self.core.submit(peer_id, payload)
    }

    pub fn select(&mut self, peer_id: &str) -> ChatResult<&ConversationSession> {
        self.core.select(peer_id)
    }

    pub fn deselect(&mut self) -> Option<String> {
        self.core.deselect()
    }

    /// Fail everything undelivered and close the connection. Updates
    /// produced on the way stay available through `next_update`.
    pub async fn logout(&mut self) {
        let failed = self.core.logout();
        self.backlog.extend(failed);

        self.connection.request_shutdown();
        while self.events_open {
            let event = self.events.recv().await;
            self.absorb(event);
        }
        self.connection.join().await;
        info!("Logged out");
    }

    pub fn core(&self) -> &ChatCore {
        &self.core
    }
}
