//! Single upstream MQTT connection.
//!
//! [`BrokerClient::connect`] spawns a driver task that owns the `rumqttc`
//! [`EventLoop`] and returns two handles:
//!
//! * [`BrokerClient`] – cloneable publish handle (fire-and-forget, QoS 0).
//! * [`BrokerInbound`] – lazy, infinite, non-restartable stream of
//!   [`BrokerMessage`] values for the lifetime of the driver.
//!
//! # Connection state machine
//!
//! ```text
//!   Connecting ──ConnAck──▶ Connected
//!       ▲                       │
//!       │ backoff elapsed       │ connection error
//!       │                       ▼
//!       └────────────────  Disconnected
//! ```
//!
//! Every `ConnAck` resets the backoff and re-subscribes to
//! [`RobotTopic::INBOUND`]. A rejected subscription is logged per topic and
//! does not affect the others. A subscribe that cannot be queued is retried
//! on the following events until it goes through.
//!
//! Publishes are only accepted while [`ConnectionState::Connected`]; outside
//! a session they are dropped so the request queue stays free for the
//! subscribes issued on the next `ConnAck`.

use std::collections::{HashMap, VecDeque};
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::Stream;
use robobridge_types::{BridgeError, BrokerMessage, RobotTopic};
use rumqttc::{AsyncClient, ConnectionError, Event, EventLoop, MqttOptions, Outgoing, Packet, QoS, SubscribeReasonCode};
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

use crate::router::CommandPublisher;

/// Capacity of the request queue between [`AsyncClient`] and the event loop.
const REQUEST_CAPACITY: usize = 64;

/// Default number of broker messages buffered for the router.
pub const DEFAULT_INBOUND_CAPACITY: usize = 256;

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Connection parameters for the upstream broker.
#[derive(Clone)]
pub struct BrokerConfig {
    /// Broker host name or IP. Required; an empty host is rejected.
    pub host: String,
    pub port: u16,
    pub client_id: String,
    /// Optional `(username, password)` sent in the CONNECT packet.
    pub credentials: Option<(String, String)>,
    pub keep_alive: Duration,
    pub reconnect_initial: Duration,
    pub reconnect_max: Duration,
    pub inbound_capacity: usize,
}

impl BrokerConfig {
    /// Config for `host:port` with the default timings.
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            client_id: "robobridge".to_string(),
            credentials: None,
            keep_alive: Duration::from_secs(30),
            reconnect_initial: Duration::from_millis(500),
            reconnect_max: Duration::from_secs(30),
            inbound_capacity: DEFAULT_INBOUND_CAPACITY,
        }
    }

    fn validate(&self) -> Result<(), BridgeError> {
        if self.host.trim().is_empty() {
            return Err(BridgeError::Config("broker host must not be empty".to_string()));
        }
        if self.port == 0 {
            return Err(BridgeError::Config("broker port must not be 0".to_string()));
        }
        if self.client_id.is_empty() {
            return Err(BridgeError::Config("broker client id must not be empty".to_string()));
        }
        if self.inbound_capacity == 0 {
            return Err(BridgeError::Config("inbound capacity must be at least 1".to_string()));
        }
        Ok(())
    }
}

impl std::fmt::Debug for BrokerConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BrokerConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("client_id", &self.client_id)
            .field(
                "credentials",
                match &self.credentials {
                    Some((username, _)) => username as &dyn std::fmt::Debug,
                    None => &"<not set>",
                },
            )
            .field("keep_alive", &self.keep_alive)
            .field("reconnect_initial", &self.reconnect_initial)
            .field("reconnect_max", &self.reconnect_max)
            .field("inbound_capacity", &self.inbound_capacity)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Connection state & backoff
// ---------------------------------------------------------------------------

/// Lifecycle of the upstream connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Last attempt failed; waiting for the backoff to elapse.
    Disconnected,
    /// A (re)connect attempt is in progress.
    Connecting,
    /// The broker acknowledged the session.
    Connected,
}

/// Exponential reconnect delay, doubling from `initial` up to `max`.
#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    current: Duration,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        let max = max.max(initial);
        Self {
            initial,
            max,
            current: initial,
        }
    }

    /// Delay to wait before the next attempt. Advances the sequence.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = (self.current * 2).min(self.max);
        delay
    }

    /// Back to `initial` after a successful connect.
    pub fn reset(&mut self) {
        self.current = self.initial;
    }
}

// ---------------------------------------------------------------------------
// Public handles
// ---------------------------------------------------------------------------

/// Cloneable publish handle for the broker connection.
#[derive(Clone)]
pub struct BrokerClient {
    client: AsyncClient,
    state: watch::Receiver<ConnectionState>,
}

impl BrokerClient {
    /// Build the MQTT client, spawn its driver task and return the publish
    /// handle plus the inbound stream.
    ///
    /// Must be called from within a Tokio runtime. The actual TCP connect
    /// happens asynchronously in the driver.
    ///
    /// # Errors
    ///
    /// Returns [`BridgeError::Config`] if `config` is invalid.
    pub fn connect(config: &BrokerConfig) -> Result<(Self, BrokerInbound), BridgeError> {
        config.validate()?;

        let mut options = MqttOptions::new(&config.client_id, &config.host, config.port);
        options.set_keep_alive(config.keep_alive);
        options.set_clean_session(true);
        if let Some((username, password)) = &config.credentials {
            options.set_credentials(username, password);
        }

        let (client, eventloop) = AsyncClient::new(options, REQUEST_CAPACITY);
        let (inbound_tx, inbound_rx) = mpsc::channel(config.inbound_capacity);
        let (state_tx, state_rx) = watch::channel(ConnectionState::Connecting);

        let session = Session::new(
            client.clone(),
            inbound_tx,
            state_tx,
            Backoff::new(config.reconnect_initial, config.reconnect_max),
        );

        info!(host = %config.host, port = config.port, client_id = %config.client_id, "connecting to broker");
        tokio::spawn(drive(eventloop, session));

        Ok((Self { client, state: state_rx }, BrokerInbound { rx: inbound_rx }))
    }

    /// Current state of the upstream connection.
    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Wait until the connection reaches `target`.
    ///
    /// Returns an error if the driver task has stopped.
    pub async fn wait_for_state(&self, target: ConnectionState) -> Result<(), BridgeError> {
        let mut state = self.state.clone();
        state
            .wait_for(|s| *s == target)
            .await
            .map(|_| ())
            .map_err(|_| BridgeError::Broker("broker driver stopped".to_string()))
    }

    /// Enqueue a QoS 0, non-retained publish.
    ///
    /// No acknowledgement is tracked and nothing is retried. Fails when the
    /// broker is not connected, the request queue is full or the driver has
    /// stopped.
    pub fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), BridgeError> {
        let state = self.state();
        if state != ConnectionState::Connected {
            return Err(BridgeError::Broker(format!("publish to {topic} dropped: broker {state:?}")));
        }
        self.client
            .try_publish(topic, QoS::AtMostOnce, false, payload)
            .map_err(|e| BridgeError::Broker(format!("publish to {topic} failed: {e}")))
    }
}

#[async_trait]
impl CommandPublisher for BrokerClient {
    async fn publish(&self, topic: RobotTopic, payload: Vec<u8>) -> Result<(), BridgeError> {
        BrokerClient::publish(self, topic.as_str(), payload)
    }
}

/// Inbound broker messages, in the order the broker delivered them.
pub struct BrokerInbound {
    rx: mpsc::Receiver<BrokerMessage>,
}

impl BrokerInbound {
    /// Wait for the next message. `None` once the driver has stopped.
    pub async fn recv(&mut self) -> Option<BrokerMessage> {
        self.rx.recv().await
    }
}

impl Stream for BrokerInbound {
    type Item = BrokerMessage;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

// ---------------------------------------------------------------------------
// Driver
// ---------------------------------------------------------------------------

async fn drive(mut eventloop: EventLoop, mut session: Session) {
    loop {
        match eventloop.poll().await {
            Ok(event) => {
                if !session.handle_event(event).await {
                    break;
                }
            }
            Err(ConnectionError::RequestsDone) => break,
            Err(e) => {
                let delay = session.on_connection_error();
                warn!(error = %e, retry_in_ms = delay.as_millis() as u64, "broker connection lost");
                tokio::time::sleep(delay).await;
                if session.inbound.is_closed() {
                    break;
                }
                session.set_state(ConnectionState::Connecting);
            }
        }
    }
    session.set_state(ConnectionState::Disconnected);
    info!("broker driver stopped");
}

/// Everything the driver tracks apart from the event loop itself.
struct Session {
    client: AsyncClient,
    inbound: mpsc::Sender<BrokerMessage>,
    state: watch::Sender<ConnectionState>,
    backoff: Backoff,
    // Subscribe requests queued but not yet assigned a packet id.
    queued_subscriptions: VecDeque<RobotTopic>,
    // Packet id → topic, awaiting SUBACK.
    pending_subscriptions: HashMap<u16, RobotTopic>,
    // Subscribes that could not be queued yet.
    unrequested: Vec<RobotTopic>,
}

impl Session {
    fn new(
        client: AsyncClient,
        inbound: mpsc::Sender<BrokerMessage>,
        state: watch::Sender<ConnectionState>,
        backoff: Backoff,
    ) -> Self {
        Self {
            client,
            inbound,
            state,
            backoff,
            queued_subscriptions: VecDeque::new(),
            pending_subscriptions: HashMap::new(),
            unrequested: Vec::new(),
        }
    }

    /// Handle one event-loop event. Returns `false` when nobody consumes the
    /// inbound stream any more.
    async fn handle_event(&mut self, event: Event) -> bool {
        let retry_due = !self.unrequested.is_empty() && !matches!(event, Event::Incoming(Packet::ConnAck(_)));
        match event {
            Event::Incoming(Packet::ConnAck(_)) => {
                info!("connected to broker");
                self.backoff.reset();
                self.set_state(ConnectionState::Connected);
                self.subscribe_inbound();
            }
            Event::Incoming(Packet::Publish(publish)) => {
                let message = BrokerMessage::new(publish.topic, publish.payload);
                debug!(topic = %message.topic, bytes = message.payload.len(), "broker message received");
                if self.inbound.send(message).await.is_err() {
                    return false;
                }
            }
            Event::Incoming(Packet::SubAck(ack)) => {
                let topic = self.pending_subscriptions.remove(&ack.pkid);
                let name = topic.map(RobotTopic::as_str).unwrap_or("<unknown>");
                for code in ack.return_codes {
                    match code {
                        SubscribeReasonCode::Success(qos) => {
                            info!(topic = name, qos = ?qos, "subscribed");
                        }
                        SubscribeReasonCode::Failure => {
                            error!(topic = name, "broker rejected subscription");
                        }
                    }
                }
            }
            Event::Outgoing(Outgoing::Subscribe(pkid)) => {
                if let Some(topic) = self.queued_subscriptions.pop_front() {
                    self.pending_subscriptions.insert(pkid, topic);
                }
            }
            _ => {}
        }
        if retry_due && *self.state.borrow() == ConnectionState::Connected {
            let retry = std::mem::take(&mut self.unrequested);
            self.request_subscriptions(retry);
        }
        true
    }

    /// Queue a subscribe for every inbound topic.
    fn subscribe_inbound(&mut self) {
        self.queued_subscriptions.clear();
        self.pending_subscriptions.clear();
        self.unrequested.clear();
        self.request_subscriptions(RobotTopic::INBOUND.to_vec());
    }

    /// Uses the non-blocking `try_subscribe`: this runs on the driver task,
    /// which is the only thing draining the request queue. Topics that do not
    /// fit are kept for the next event.
    fn request_subscriptions(&mut self, topics: Vec<RobotTopic>) {
        for topic in topics {
            match self.client.try_subscribe(topic.as_str(), QoS::AtMostOnce) {
                Ok(()) => self.queued_subscriptions.push_back(topic),
                Err(e) => {
                    warn!(topic = %topic, error = %e, "subscription not queued; will retry");
                    self.unrequested.push(topic);
                }
            }
        }
    }

    fn on_connection_error(&mut self) -> Duration {
        self.set_state(ConnectionState::Disconnected);
        self.backoff.next_delay()
    }

    fn set_state(&self, next: ConnectionState) {
        self.state.send_if_modified(|current| {
            if *current == next {
                return false;
            }
            debug!(from = ?*current, to = ?next, "broker connection state");
            *current = next;
            true
        });
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
