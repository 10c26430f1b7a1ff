//! Bridge router – the policy layer between the broker and the socket hub.
//!
//! The router holds no state of its own beyond the topic → behaviour table
//! below. Every inbound event is handled independently.
//!
//! # Broker → clients
//!
//! | Topic | Transformation | Broadcast payload |
//! |---|---|---|
//! | `robo/status` | parse JSON, re-serialise | full status object |
//! | `robo/bateria` | parse JSON, re-serialise | full battery object |
//! | `robo/velocidade` | parse JSON, keep `velocidade` | `{"velocidade": v}` |
//! | anything else | ignored | – |
//!
//! # Clients → broker
//!
//! Each well-formed `{"velocidade", "angulo"}` message from any connection is
//! published once on `robo/comandos`. Nothing is deduplicated or throttled.

use std::sync::Arc;

use async_trait::async_trait;
use futures_util::{Stream, StreamExt};
use robobridge_types::{BridgeError, BrokerMessage, ConnectionId, DriveCommand, RobotTopic};
use serde_json::{Map, Value};
use tracing::{debug, info, warn};

/// Upstream half of the bridge: anything that can publish to the broker.
///
/// Implemented by [`BrokerClient`][crate::broker::BrokerClient]; tests swap in
/// a recording mock.
#[async_trait]
pub trait CommandPublisher: Send + Sync {
    /// Fire-and-forget publish of `payload` on `topic`.
    async fn publish(&self, topic: RobotTopic, payload: Vec<u8>) -> Result<(), BridgeError>;
}

/// Downstream half of the bridge: anything that can fan a payload out to the
/// currently open socket connections.
pub trait Broadcaster: Send + Sync {
    /// Send `payload` to every open connection and return how many were
    /// handed the payload.
    fn broadcast(&self, payload: &str) -> usize;
}

/// Stateless dispatcher tying a [`CommandPublisher`] to a [`Broadcaster`].
///
/// Cloning is cheap; every clone shares the same collaborators.
#[derive(Clone)]
pub struct BridgeRouter {
    publisher: Arc<dyn CommandPublisher>,
    broadcaster: Arc<dyn Broadcaster>,
}

impl BridgeRouter {
    pub fn new(publisher: Arc<dyn CommandPublisher>, broadcaster: Arc<dyn Broadcaster>) -> Self {
        Self { publisher, broadcaster }
    }

    // -----------------------------------------------------------------------
    // Broker → clients
    // -----------------------------------------------------------------------

    /// Consume the broker's inbound stream until it ends, dispatching every
    /// message in arrival order.
    pub async fn run<S>(&self, mut inbound: S)
    where
        S: Stream<Item = BrokerMessage> + Unpin,
    {
        while let Some(message) = inbound.next().await {
            self.dispatch_inbound(&message);
        }
        info!("broker inbound stream ended; router stopping");
    }

    /// Translate one broker message and broadcast the result.
    ///
    /// Returns the number of connections that were handed the payload. Unknown
    /// topics and malformed payloads yield `0` and are dropped.
    pub fn dispatch_inbound(&self, message: &BrokerMessage) -> usize {
        match translate_inbound(message) {
            Ok(Some(payload)) => {
                let sent = self.broadcaster.broadcast(&payload);
                debug!(
                    topic = %message.topic,
                    clients = sent,
                    latency_us = message.age().as_micros() as u64,
                    "broker payload broadcast"
                );
                sent
            }
            Ok(None) => {
                debug!(topic = %message.topic, "ignoring message on unrouted topic");
                0
            }
            Err(e) => {
                warn!(topic = %message.topic, error = %e, "dropping malformed broker payload");
                0
            }
        }
    }

    // -----------------------------------------------------------------------
    // Clients → broker
    // -----------------------------------------------------------------------

    /// Parse a raw text message from socket connection `conn` and publish it
    /// as a drive command.
    ///
    /// Returns `true` when a publish was issued. Malformed messages are logged
    /// and dropped; they never affect the connection.
    pub async fn handle_client_message(&self, conn: ConnectionId, raw: &str) -> bool {
        let command = match DriveCommand::parse(raw) {
            Ok(command) => command,
            Err(e) => {
                warn!(conn = %conn, error = %e, "dropping malformed client command");
                return false;
            }
        };

        let payload = match command.to_payload() {
            Ok(payload) => payload,
            Err(e) => {
                warn!(conn = %conn, error = %e, "failed to encode drive command");
                return false;
            }
        };

        match self.publisher.publish(RobotTopic::Commands, payload).await {
            Ok(()) => {
                debug!(conn = %conn, speed = %command.speed, angle = %command.angle, "drive command published");
                true
            }
            Err(e) => {
                warn!(conn = %conn, error = %e, "failed to publish drive command");
                false
            }
        }
    }
}

/// Map a broker message to the text frame the socket clients receive.
///
/// * `Ok(Some(frame))` – broadcast `frame`.
/// * `Ok(None)` – topic is not routed to clients.
/// * `Err(_)` – payload is not valid for its topic.
pub fn translate_inbound(message: &BrokerMessage) -> Result<Option<String>, BridgeError> {
    let Some(topic) = RobotTopic::from_name(&message.topic) else {
        return Ok(None);
    };

    match topic {
        RobotTopic::Status | RobotTopic::Battery => {
            let value = parse_payload(&message.payload)?;
            Ok(Some(value.to_string()))
        }
        RobotTopic::Velocity => {
            let value = parse_payload(&message.payload)?;
            let speed = value
                .get("velocidade")
                .cloned()
                .ok_or_else(|| BridgeError::Parse("velocity payload has no `velocidade` field".to_string()))?;
            let mut projected = Map::with_capacity(1);
            projected.insert("velocidade".to_string(), speed);
            Ok(Some(Value::Object(projected).to_string()))
        }
        RobotTopic::Commands => Ok(None),
    }
}

fn parse_payload(payload: &[u8]) -> Result<Value, BridgeError> {
    serde_json::from_slice(payload).map_err(|e| BridgeError::Parse(format!("invalid JSON payload: {e}")))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingPublisher {
        published: Mutex<Vec<(RobotTopic, Vec<u8>)>>,
    }

    impl RecordingPublisher {
        fn published(&self) -> Vec<(RobotTopic, Vec<u8>)> {
            self.published.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl CommandPublisher for RecordingPublisher {
        async fn publish(&self, topic: RobotTopic, payload: Vec<u8>) -> Result<(), BridgeError> {
            self.published.lock().unwrap().push((topic, payload));
            Ok(())
        }
    }

    struct FailingPublisher;

    #[async_trait]
    impl CommandPublisher for FailingPublisher {
        async fn publish(&self, _topic: RobotTopic, _payload: Vec<u8>) -> Result<(), BridgeError> {
            Err(BridgeError::Broker("request queue full".to_string()))
        }
    }

    /// Pretends to have `clients` open connections and records every frame.
    struct RecordingBroadcaster {
        clients: usize,
        frames: Mutex<Vec<String>>,
    }

    impl RecordingBroadcaster {
        fn with_clients(clients: usize) -> Self {
            Self {
                clients,
                frames: Mutex::new(Vec::new()),
            }
        }

        fn frames(&self) -> Vec<String> {
            self.frames.lock().unwrap().clone()
        }
    }

    impl Broadcaster for RecordingBroadcaster {
        fn broadcast(&self, payload: &str) -> usize {
            self.frames.lock().unwrap().push(payload.to_string());
            self.clients
        }
    }

    fn make_router(clients: usize) -> (Arc<RecordingPublisher>, Arc<RecordingBroadcaster>, BridgeRouter) {
        let publisher = Arc::new(RecordingPublisher::default());
        let broadcaster = Arc::new(RecordingBroadcaster::with_clients(clients));
        let router = BridgeRouter::new(publisher.clone(), broadcaster.clone());
        (publisher, broadcaster, router)
    }

    // ── Broker → clients ──────────────────────────────────────────────────────

    #[test]
    fn battery_payload_is_forwarded_verbatim() {
        let (_, broadcaster, router) = make_router(2);

        let sent = router.dispatch_inbound(&BrokerMessage::new("robo/bateria", r#"{"nivel":80}"#));

        assert_eq!(sent, 2);
        assert_eq!(broadcaster.frames(), vec![r#"{"nivel":80}"#.to_string()]);
    }

    #[test]
    fn status_payload_keeps_field_order() {
        let (_, broadcaster, router) = make_router(1);

        router.dispatch_inbound(&BrokerMessage::new(
            "robo/status",
            r#"{"modo":"manual","erro":null,"temperatura":41.5}"#,
        ));

        assert_eq!(
            broadcaster.frames(),
            vec![r#"{"modo":"manual","erro":null,"temperatura":41.5}"#.to_string()]
        );
    }

    #[test]
    fn velocity_payload_is_projected() {
        let (_, broadcaster, router) = make_router(3);

        let sent = router.dispatch_inbound(&BrokerMessage::new("robo/velocidade", r#"{"velocidade":3,"unit":"m/s"}"#));

        assert_eq!(sent, 3);
        assert_eq!(broadcaster.frames(), vec![r#"{"velocidade":3}"#.to_string()]);
    }

    #[test]
    fn velocity_projection_never_leaks_other_fields() {
        let (_, broadcaster, router) = make_router(1);

        for raw in [
            r#"{"velocidade":0.25}"#,
            r#"{"unit":"m/s","velocidade":-2,"ts":1700000000}"#,
            r#"{"velocidade":{"x":1},"extra":[1,2,3]}"#,
        ] {
            router.dispatch_inbound(&BrokerMessage::new("robo/velocidade", raw));
        }

        let frames = broadcaster.frames();
        assert_eq!(frames.len(), 3);
        for frame in frames {
            let value: Value = serde_json::from_str(&frame).unwrap();
            let object = value.as_object().unwrap();
            assert_eq!(object.len(), 1, "unexpected fields in {frame}");
            assert!(object.contains_key("velocidade"));
        }
    }

    #[test]
    fn velocity_without_field_is_dropped() {
        let (_, broadcaster, router) = make_router(1);

        let sent = router.dispatch_inbound(&BrokerMessage::new("robo/velocidade", r#"{"unit":"m/s"}"#));

        assert_eq!(sent, 0);
        assert!(broadcaster.frames().is_empty());
    }

    #[test]
    fn null_velocity_is_forwarded_as_null() {
        let (_, broadcaster, router) = make_router(1);

        let sent = router.dispatch_inbound(&BrokerMessage::new("robo/velocidade", r#"{"velocidade":null,"unit":"m/s"}"#));

        assert_eq!(sent, 1);
        assert_eq!(broadcaster.frames(), vec![r#"{"velocidade":null}"#.to_string()]);
    }

    #[test]
    fn malformed_broker_payload_is_dropped() {
        let (_, broadcaster, router) = make_router(2);

        assert_eq!(router.dispatch_inbound(&BrokerMessage::new("robo/status", "{not json")), 0);
        assert_eq!(router.dispatch_inbound(&BrokerMessage::new("robo/bateria", vec![0xff, 0xfe])), 0);
        assert!(broadcaster.frames().is_empty());

        // The next good message still goes through.
        assert_eq!(router.dispatch_inbound(&BrokerMessage::new("robo/bateria", r#"{"nivel":79}"#)), 2);
    }

    #[test]
    fn unknown_and_command_topics_are_ignored() {
        let (_, broadcaster, router) = make_router(2);

        assert_eq!(router.dispatch_inbound(&BrokerMessage::new("robo/outro", r#"{"a":1}"#)), 0);
        assert_eq!(
            router.dispatch_inbound(&BrokerMessage::new("robo/comandos", r#"{"velocidade":1,"angulo":2}"#)),
            0
        );
        assert!(broadcaster.frames().is_empty());
    }

    #[tokio::test]
    async fn run_drains_the_inbound_stream_in_order() {
        let (_, broadcaster, router) = make_router(1);
        let inbound = futures_util::stream::iter(vec![
            BrokerMessage::new("robo/bateria", r#"{"nivel":80}"#),
            BrokerMessage::new("robo/outro", "ignored"),
            BrokerMessage::new("robo/velocidade", r#"{"velocidade":3,"unit":"m/s"}"#),
            BrokerMessage::new("robo/status", r#"{"ok":true}"#),
        ]);

        router.run(inbound).await;

        assert_eq!(
            broadcaster.frames(),
            vec![
                r#"{"nivel":80}"#.to_string(),
                r#"{"velocidade":3}"#.to_string(),
                r#"{"ok":true}"#.to_string(),
            ]
        );
    }

    // ── Clients → broker ──────────────────────────────────────────────────────

    #[tokio::test]
    async fn client_command_is_published_once() {
        let (publisher, _, router) = make_router(0);

        let published = router
            .handle_client_message(ConnectionId::new(), r#"{"velocidade":5,"angulo":10}"#)
            .await;

        assert!(published);
        assert_eq!(
            publisher.published(),
            vec![(RobotTopic::Commands, br#"{"velocidade":5,"angulo":10}"#.to_vec())]
        );
    }

    #[tokio::test]
    async fn malformed_client_command_does_not_block_next_one() {
        let (publisher, _, router) = make_router(0);
        let conn = ConnectionId::new();
        let other = ConnectionId::new();

        assert!(!router.handle_client_message(conn, "not json at all").await);
        assert!(!router.handle_client_message(conn, r#"{"velocidade":5}"#).await);
        assert!(!router.handle_client_message(other, r#"{"velocidade":"5","angulo":1}"#).await);
        assert!(publisher.published().is_empty());

        assert!(router.handle_client_message(conn, r#"{"velocidade":1.5,"angulo":-30}"#).await);
        assert!(router.handle_client_message(other, r#"{"velocidade":0,"angulo":0}"#).await);

        let published = publisher.published();
        assert_eq!(published.len(), 2);
        assert_eq!(published[0].1, br#"{"velocidade":1.5,"angulo":-30}"#.to_vec());
        assert_eq!(published[1].1, br#"{"velocidade":0,"angulo":0}"#.to_vec());
    }

    #[tokio::test]
    async fn publish_failure_is_reported_not_propagated() {
        let broadcaster = Arc::new(RecordingBroadcaster::with_clients(0));
        let router = BridgeRouter::new(Arc::new(FailingPublisher), broadcaster);

        let published = router
            .handle_client_message(ConnectionId::new(), r#"{"velocidade":5,"angulo":10}"#)
            .await;

        assert!(!published);
    }
}
