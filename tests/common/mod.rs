// Common test utilities for integration tests
// Scripted in-process transport and roster collaborators

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, Once};
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, LevelFilter};
use tokio::sync::mpsc;
use tokio::time::timeout;

use tutorchat::chat::client::ChatClient;
use tutorchat::chat::roster::{RosterEntry, RosterSource};
use tutorchat::chat::transport::{Connector, InboundFrame, OutboundFrame, TransportLink};
use tutorchat::chat::ChatUpdate;
use tutorchat::config::{ChatConfig, ReconnectPolicy};
use tutorchat::error::{RosterFetchError, TransportError};
use tutorchat::models::Identity;

// Initialize logging once
static INIT_LOGGER: Once = Once::new();

/// Set up the logger for the tests
pub fn setup_logging() {
    INIT_LOGGER.call_once(|| {
        let _ = env_logger::Builder::new()
            .filter_level(LevelFilter::Debug)
            .is_test(true)
            .try_init();
    });
}

/// Configuration with delays small enough for tests.
pub fn test_config() -> ChatConfig {
    ChatConfig {
        connect_timeout_ms: 500,
        ack_timeout_ms: 2_000,
        event_buffer: 16,
        reconnect: ReconnectPolicy {
            initial_delay_ms: 10,
            max_delay_ms: 40,
            multiplier: 2.0,
            jitter: 0.0,
            max_attempts: 3,
        },
        ..ChatConfig::default()
    }
}

pub fn identity() -> Identity {
    Identity::new("U1", "test-token")
}

pub fn roster(entries: &[(&str, &str)]) -> Vec<RosterEntry> {
    entries.iter().map(|(id, name)| RosterEntry::new(*id, *name)).collect()
}

type InboundItem = Result<Option<InboundFrame>, TransportError>;

#[derive(Default)]
struct ServerState {
    connects: u32,
    refuse_connects: bool,
    connect_delay: Duration,
    link: Option<mpsc::UnboundedSender<InboundItem>>,
    sent: Vec<OutboundFrame>,
}

/// In-process stand-in for the messaging backend. Each successful connect
/// opens a fresh link; frames written by the client are recorded.
#[derive(Clone, Default)]
pub struct MockServer {
    state: Arc<Mutex<ServerState>>,
}

impl MockServer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn connector(&self) -> Arc<dyn Connector> {
        Arc::new(MockConnector { server: self.clone() })
    }

    pub fn refuse_connects(&self, refuse: bool) {
        self.state.lock().unwrap().refuse_connects = refuse;
    }

    pub fn set_connect_delay(&self, delay: Duration) {
        self.state.lock().unwrap().connect_delay = delay;
    }

    pub fn connects(&self) -> u32 {
        self.state.lock().unwrap().connects
    }

    pub fn sent(&self) -> Vec<OutboundFrame> {
        self.state.lock().unwrap().sent.clone()
    }

    pub fn is_linked(&self) -> bool {
        self.state.lock().unwrap().link.is_some()
    }

    /// Push a frame to the client over the current link.
    pub fn push(&self, frame: InboundFrame) {
        let state = self.state.lock().unwrap();
        let link = state.link.as_ref().expect("no open link");
        link.send(Ok(Some(frame))).expect("link closed");
    }

    /// Break the current link as a network failure would.
    pub fn drop_link(&self) {
        let link = self.state.lock().unwrap().link.take();
        if let Some(link) = link {
            let _ = link.send(Err(TransportError::Io("connection reset".into())));
        }
    }

    pub async fn wait_linked(&self) {
        timeout(Duration::from_secs(2), async {
            while !self.is_linked() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("client never connected");
    }
}

struct MockConnector {
    server: MockServer,
}

#[async_trait]
impl Connector for MockConnector {
    async fn connect(&self, _identity: &Identity) -> Result<Box<dyn TransportLink>, TransportError> {
        let delay = {
            let mut state = self.server.state.lock().unwrap();
            state.connects += 1;
            state.connect_delay
        };
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.server.state.lock().unwrap();
        if state.refuse_connects {
            return Err(TransportError::Connect("connection refused".into()));
        }
        let (tx, rx) = mpsc::unbounded_channel();
        state.link = Some(tx);
        debug!("Mock server accepted connection #{}", state.connects);
        Ok(Box::new(MockLink {
            server: self.server.clone(),
            inbound: rx,
        }))
    }
}

struct MockLink {
    server: MockServer,
    inbound: mpsc::UnboundedReceiver<InboundItem>,
}

#[async_trait]
impl TransportLink for MockLink {
    async fn send(&mut self, frame: &OutboundFrame) -> Result<(), TransportError> {
        self.server.state.lock().unwrap().sent.push(frame.clone());
        Ok(())
    }

    async fn recv(&mut self) -> Result<Option<InboundFrame>, TransportError> {
        self.inbound.recv().await.unwrap_or(Ok(None))
    }

    async fn close(&mut self) {
        self.inbound.close();
    }
}

/// Roster endpoint answering from a script; the last answer repeats.
pub struct MockRoster {
    responses: Mutex<VecDeque<Result<Vec<RosterEntry>, RosterFetchError>>>,
    delay: Duration,
}

impl MockRoster {
    pub fn new(responses: Vec<Result<Vec<RosterEntry>, RosterFetchError>>) -> Arc<Self> {
        Self::with_delay(responses, Duration::ZERO)
    }

    pub fn with_delay(
        responses: Vec<Result<Vec<RosterEntry>, RosterFetchError>>,
        delay: Duration,
    ) -> Arc<Self> {
        Arc::new(MockRoster {
            responses: Mutex::new(responses.into()),
            delay,
        })
    }
}

#[async_trait]
impl RosterSource for MockRoster {
    async fn fetch_roster(&self, _identity: &Identity) -> Result<Vec<RosterEntry>, RosterFetchError> {
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        let mut responses = self.responses.lock().unwrap();
        match responses.len() {
            0 => Ok(Vec::new()),
            1 => responses[0].clone(),
            _ => responses.pop_front().unwrap(),
        }
    }
}

/// Drain updates until one matches `pred`. Panics after two seconds or
/// when the client runs out of updates.
pub async fn wait_for<F>(client: &mut ChatClient, mut pred: F) -> ChatUpdate
where
    F: FnMut(&ChatUpdate) -> bool,
{
    timeout(Duration::from_secs(2), async {
        loop {
            match client.next_update().await {
                Some(update) if pred(&update) => return update,
                Some(update) => debug!("Skipping update {:?}", update),
                None => panic!("client finished before the expected update"),
            }
        }
    })
    .await
    .expect("timed out waiting for update")
}

/// Drain every remaining update until the client finishes.
pub async fn drain(client: &mut ChatClient) -> Vec<ChatUpdate> {
    timeout(Duration::from_secs(2), async {
        let mut updates = Vec::new();
        while let Some(update) = client.next_update().await {
            updates.push(update);
        }
        updates
    })
    .await
    .expect("client did not finish")
}
