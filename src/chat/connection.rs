// Connection management for the chat core
// Owns the single transport link of an identity and drives the reconnect state machine

use log::{debug, error, info, warn};
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use super::transport::{Connector, InboundFrame, OutboundFrame, TransportLink};
use crate::config::{ChatConfig, ReconnectPolicy};
use crate::error::{ChatError, TransportError};
use crate::models::{Identity, MessageKey};

#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionState {
    /// Initial state, and terminal after logout (`None`) or after the
    /// retry budget ran out (`Some(ConnectivityExhausted)`).
    Disconnected(Option<ChatError>),
    Connecting,
    Connected,
    Reconnecting { attempt: u32 },
}

impl ConnectionState {
    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionState::Connected)
    }
}

/// Everything the connection task reports, in the order it happened.
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionEvent {
    /// `generation` increases on every successful (re)connect.
    StateChanged {
        state: ConnectionState,
        generation: u64,
    },
    /// The frame for `key` was written to the transport.
    FrameWritten { key: MessageKey },
    Inbound(InboundFrame),
}

/// An outbound frame stamped with the connection generation it was
/// produced for. Frames from an older generation are discarded.
#[derive(Debug, Clone)]
pub struct Outbound {
    pub generation: u64,
    pub frame: OutboundFrame,
}

/// Exponential backoff with jitter. Counts consecutive failed connects;
/// the budget is spent once `max_attempts` of them have failed in a row.
#[derive(Debug, Clone)]
pub struct Backoff {
    policy: ReconnectPolicy,
    failures: u32,
}

impl Backoff {
    pub fn new(policy: ReconnectPolicy) -> Self {
        Backoff { policy, failures: 0 }
    }

    pub fn failures(&self) -> u32 {
        self.failures
    }

    /// A connect succeeded.
    pub fn reset(&mut self) {
        self.failures = 0;
    }

    /// Charge one failed connect. Returns the delay before the next one, or
    /// `None` once the budget is spent.
    pub fn record_failure(&mut self) -> Option<Duration> {
        self.failures = self.failures.saturating_add(1);
        if self.failures >= self.policy.max_attempts {
            return None;
        }
        Some(self.delay(self.failures))
    }

    /// Delay before reconnecting after an established link was lost. Costs
    /// nothing from the budget.
    pub fn link_lost_delay(&self) -> Duration {
        self.delay(0)
    }

    fn delay(&self, step: u32) -> Duration {
        let base = self.base_delay_ms(step);
        let jitter = self.policy.jitter;
        let factor = if jitter > 0.0 {
            rand::thread_rng().gen_range((1.0 - jitter)..=(1.0 + jitter))
        } else {
            1.0
        };
        let millis = ((base as f64) * factor).round().max(1.0) as u64;
        Duration::from_millis(millis)
    }

    fn base_delay_ms(&self, step: u32) -> u64 {
        let grown = self.policy.initial_delay_ms as f64 * self.policy.multiplier.powi(step as i32);
        grown.min(self.policy.max_delay_ms as f64) as u64
    }
}

/// Handle held by the owner of the chat state. Dropping it shuts the
/// connection task down as well.
pub struct ConnectionHandle {
    outbound: mpsc::UnboundedSender<Outbound>,
    shutdown: watch::Sender<bool>,
    task: Option<JoinHandle<()>>,
}

impl ConnectionHandle {
    pub fn outbound(&self) -> mpsc::UnboundedSender<Outbound> {
        self.outbound.clone()
    }

    /// Ask the task to close the transport for good. The final
    /// `Disconnected` event still has to be drained by the event receiver.
    pub fn request_shutdown(&self) {
        info!("Shutting down connection");
        let _ = self.shutdown.send(true);
    }

    /// Wait for the connection task to finish.
    pub async fn join(&mut self) {
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                error!("Connection task ended abnormally: {}", e);
            }
        }
    }
}

impl Drop for ConnectionHandle {
    fn drop(&mut self) {
        let _ = self.shutdown.send(true);
    }
}

enum LinkExit {
    Shutdown,
    Failed(TransportError),
}

pub struct ConnectionManager {
    identity: Identity,
    connector: Arc<dyn Connector>,
    backoff: Backoff,
    connect_timeout: Duration,
    events: mpsc::Sender<ConnectionEvent>,
    outbound: mpsc::UnboundedReceiver<Outbound>,
    shutdown: watch::Receiver<bool>,
    generation: u64,
}

impl ConnectionManager {
    /// Start the connection task for `identity`. Must be called from within
    /// a tokio runtime.
    pub fn spawn(
        identity: Identity,
        connector: Arc<dyn Connector>,
        config: &ChatConfig,
    ) -> (ConnectionHandle, mpsc::Receiver<ConnectionEvent>) {
        let (events_tx, events_rx) = mpsc::channel(config.event_buffer.max(1));
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let manager = ConnectionManager {
            identity,
            connector,
            backoff: Backoff::new(config.reconnect.clone()),
            connect_timeout: config.connect_timeout(),
            events: events_tx,
            outbound: outbound_rx,
            shutdown: shutdown_rx,
            generation: 0,
        };
        let task = tokio::spawn(manager.run());

        (
            ConnectionHandle {
                outbound: outbound_tx,
                shutdown: shutdown_tx,
                task: Some(task),
            },
            events_rx,
        )
    }

    async fn run(mut self) {
        info!("Starting connection for identity {}", self.identity.id);
        if !self.transition(ConnectionState::Connecting).await {
            return;
        }

        loop {
            let attempt = tokio::select! {
                result = Self::establish(&*self.connector, &self.identity, self.connect_timeout) => result,
                _ = self.shutdown.changed() => break,
            };

            let delay = match attempt {
                Ok(mut link) => {
                    self.backoff.reset();
                    self.generation += 1;
                    info!("Connected (generation {})", self.generation);
                    if !self.transition(ConnectionState::Connected).await {
                        link.close().await;
                        return;
                    }
                    match self.pump(&mut *link).await {
                        LinkExit::Shutdown => {
                            link.close().await;
                            break;
                        }
                        LinkExit::Failed(e) => {
                            warn!("Connection lost: {}", e);
                            self.backoff.link_lost_delay()
                        }
                    }
                }
                Err(e) => {
                    warn!("Connection attempt failed: {}", e);
                    match self.backoff.record_failure() {
                        Some(delay) => delay,
                        None => {
                            let attempts = self.backoff.failures();
                            error!("Giving up after {} failed connection attempts: {}", attempts, e);
                            let reason = ChatError::ConnectivityExhausted { attempts, last_error: e };
                            self.transition(ConnectionState::Disconnected(Some(reason))).await;
                            return;
                        }
                    }
                }
            };

            let attempt = self.backoff.failures() + 1;
            info!("Reconnecting in {:?} (attempt {})", delay, attempt);
            if !self.transition(ConnectionState::Reconnecting { attempt }).await {
                return;
            }
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = self.shutdown.changed() => break,
            }
        }

        self.transition(ConnectionState::Disconnected(None)).await;
        info!("Connection for identity {} closed", self.identity.id);
    }

    async fn establish(
        connector: &dyn Connector,
        identity: &Identity,
        timeout: Duration,
    ) -> Result<Box<dyn TransportLink>, TransportError> {
        match tokio::time::timeout(timeout, connector.connect(identity)).await {
            Ok(result) => result,
            Err(_) => Err(TransportError::HandshakeTimeout(timeout)),
        }
    }

    /// Move frames both ways until the link fails or shutdown is requested.
    async fn pump(&mut self, link: &mut dyn TransportLink) -> LinkExit {
        loop {
            tokio::select! {
                biased;
                _ = self.shutdown.changed() => return LinkExit::Shutdown,
                outbound = self.outbound.recv() => {
                    let Some(outbound) = outbound else {
                        // The handle is gone, nobody can observe us any more
                        return LinkExit::Shutdown;
                    };
                    if outbound.generation != self.generation {
                        debug!(
                            "Dropping frame {} produced for generation {} (now {})",
                            outbound.frame.key(), outbound.generation, self.generation
                        );
                        continue;
                    }
                    let key = outbound.frame.key();
                    if let Err(e) = link.send(&outbound.frame).await {
                        return LinkExit::Failed(e);
                    }
                    debug!("Wrote frame {}", key);
                    if !self.emit(ConnectionEvent::FrameWritten { key }).await {
                        return LinkExit::Shutdown;
                    }
                }
                inbound = link.recv() => {
                    match inbound {
                        Ok(Some(frame)) => {
                            if !self.emit(ConnectionEvent::Inbound(frame)).await {
                                return LinkExit::Shutdown;
                            }
                        }
                        Ok(None) => return LinkExit::Failed(TransportError::Closed),
                        Err(e) => return LinkExit::Failed(e),
                    }
                }
            }
        }
    }

    async fn transition(&mut self, state: ConnectionState) -> bool {
        debug!("Connection state -> {:?}", state);
        let generation = self.generation;
        self.emit(ConnectionEvent::StateChanged { state, generation }).await
    }

    async fn emit(&self, event: ConnectionEvent) -> bool {
        if self.events.send(event).await.is_err() {
            debug!("Event receiver dropped, stopping connection task");
            return false;
        }
        true
    }
}
