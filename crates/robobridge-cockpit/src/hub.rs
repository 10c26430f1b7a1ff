//! [`SocketHub`] – owns every open WebSocket connection.
//!
//! Each accepted connection gets a [`ConnectionId`], an entry in the
//! [`ConnectionSet`] and two halves:
//!
//! * a **writer task** draining the connection's bounded outbound queue into
//!   the socket sink, and
//! * a **reader loop** handing every inbound text frame to the
//!   [`BridgeRouter`].
//!
//! The set is the only shared state in the bridge. It is mutated by the hub
//! (insert on accept, remove on disconnect) and read by the router through the
//! [`Broadcaster`] trait. The lock is never held across an `.await`.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard};

use futures_util::{SinkExt, StreamExt};
use robobridge_middleware::{Broadcaster, BridgeRouter};
use robobridge_types::ConnectionId;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

/// Frames buffered per connection. A client that falls this far behind
/// misses broadcasts until its writer catches up.
pub const OUTBOUND_CAPACITY: usize = 64;

// ---------------------------------------------------------------------------
// ConnectionSet
// ---------------------------------------------------------------------------

struct ConnectionHandle {
    peer: SocketAddr,
    outbound: mpsc::Sender<Message>,
}

impl ConnectionHandle {
    /// Open while the writer task still drains the queue.
    fn is_open(&self) -> bool {
        !self.outbound.is_closed()
    }
}

/// The set of currently open socket connections.
#[derive(Default)]
pub struct ConnectionSet {
    connections: Mutex<HashMap<ConnectionId, ConnectionHandle>>,
}

impl ConnectionSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a connection from `peer`.
    ///
    /// Returns its id and the receiver the writer task must drain.
    pub fn insert(&self, peer: SocketAddr) -> (ConnectionId, mpsc::Receiver<Message>) {
        let id = ConnectionId::new();
        let (outbound, rx) = mpsc::channel(OUTBOUND_CAPACITY);
        self.lock().insert(id, ConnectionHandle { peer, outbound });
        (id, rx)
    }

    /// Remove a connection. Idempotent: returns `false` if it was already gone.
    pub fn remove(&self, id: ConnectionId) -> bool {
        self.lock().remove(&id).is_some()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<ConnectionId, ConnectionHandle>> {
        // A panic while holding the lock cannot leave the map half-updated.
        self.connections.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Broadcaster for ConnectionSet {
    /// Queue `payload` on every open connection.
    ///
    /// Connections whose writer has gone away are skipped, not pruned; the
    /// reader loop removes them once the disconnect is observed. A connection
    /// with a full queue is skipped for this payload only.
    fn broadcast(&self, payload: &str) -> usize {
        let connections = self.lock();
        let mut sent = 0;
        for (id, handle) in connections.iter() {
            if !handle.is_open() {
                debug!(conn = %id, peer = %handle.peer, "skipping closed connection");
                continue;
            }
            match handle.outbound.try_send(Message::text(payload.to_owned())) {
                Ok(()) => sent += 1,
                Err(TrySendError::Full(_)) => {
                    warn!(conn = %id, peer = %handle.peer, "outbound queue full; skipping slow client");
                }
                Err(TrySendError::Closed(_)) => {
                    debug!(conn = %id, peer = %handle.peer, "send failed; skipping connection");
                }
            }
        }
        sent
    }
}

// ---------------------------------------------------------------------------
// SocketHub
// ---------------------------------------------------------------------------

/// Accepts upgraded WebSocket streams and bridges them to the router.
#[derive(Clone)]
pub struct SocketHub {
    connections: Arc<ConnectionSet>,
    router: BridgeRouter,
}

impl SocketHub {
    /// `router` must broadcast through the same `connections` set.
    pub fn new(connections: Arc<ConnectionSet>, router: BridgeRouter) -> Self {
        Self { connections, router }
    }

    pub fn connections(&self) -> &Arc<ConnectionSet> {
        &self.connections
    }

    /// Run one connection until the client goes away.
    ///
    /// Malformed client messages are dropped by the router; they never close
    /// the connection.
    pub async fn serve<S>(&self, ws: WebSocketStream<S>, peer: SocketAddr)
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (mut ws_tx, mut ws_rx) = ws.split();
        let (id, mut outbound) = self.connections.insert(peer);
        info!(conn = %id, peer = %peer, clients = self.connections.len(), "socket client connected");

        // ── Downstream: broadcast queue → socket ────────────────────────────
        let writer = tokio::spawn(async move {
            while let Some(message) = outbound.recv().await {
                if let Err(e) = ws_tx.send(message).await {
                    debug!(conn = %id, error = %e, "socket write failed");
                    break;
                }
            }
            let _ = ws_tx.close().await;
        });

        // ── Upstream: socket → router ───────────────────────────────────────
        while let Some(frame) = ws_rx.next().await {
            match frame {
                Ok(Message::Text(text)) => {
                    self.router.handle_client_message(id, text.as_str()).await;
                }
                Ok(Message::Binary(data)) => match std::str::from_utf8(&data) {
                    Ok(text) => {
                        self.router.handle_client_message(id, text).await;
                    }
                    Err(e) => warn!(conn = %id, error = %e, "dropping non-UTF-8 binary frame"),
                },
                Ok(Message::Close(_)) => break,
                Ok(_) => {}
                Err(e) => {
                    debug!(conn = %id, error = %e, "socket read failed");
                    break;
                }
            }
        }

        self.connections.remove(id);
        // Dropping the handle closed the queue; the writer finishes on its own.
        let _ = writer.await;
        info!(conn = %id, peer = %peer, clients = self.connections.len(), "socket client disconnected");
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use robobridge_middleware::CommandPublisher;
    use robobridge_types::{BridgeError, BrokerMessage, RobotTopic};
    use std::time::Duration;
    use tokio::net::TcpListener;
    use tokio_tungstenite::{accept_async, connect_async};

    fn peer() -> SocketAddr {
        "127.0.0.1:40000".parse().unwrap()
    }

    fn text_of(message: Message) -> String {
        match message {
            Message::Text(text) => text.as_str().to_string(),
            other => panic!("expected text frame, got {other:?}"),
        }
    }

    #[derive(Default)]
    struct RecordingPublisher {
        published: Mutex<Vec<(RobotTopic, Vec<u8>)>>,
    }

    #[async_trait]
    impl CommandPublisher for RecordingPublisher {
        async fn publish(&self, topic: RobotTopic, payload: Vec<u8>) -> Result<(), BridgeError> {
            self.published.lock().unwrap().push((topic, payload));
            Ok(())
        }
    }

    // ── ConnectionSet ─────────────────────────────────────────────────────────

    #[test]
    fn broadcast_reaches_every_open_connection_once() {
        let set = ConnectionSet::new();
        let mut receivers: Vec<_> = (0..4).map(|_| set.insert(peer()).1).collect();

        assert_eq!(set.broadcast(r#"{"nivel":80}"#), 4);

        for rx in receivers.iter_mut() {
            assert_eq!(text_of(rx.try_recv().unwrap()), r#"{"nivel":80}"#);
            assert!(rx.try_recv().is_err(), "payload delivered more than once");
        }
    }

    #[test]
    fn broadcast_with_no_connections_sends_nothing() {
        let set = ConnectionSet::new();
        assert!(set.is_empty());
        assert_eq!(set.broadcast("{}"), 0);
    }

    #[test]
    fn closed_connection_is_skipped_not_pruned() {
        let set = ConnectionSet::new();
        let (_, mut first) = set.insert(peer());
        let (gone, dead) = set.insert(peer());
        let (_, mut third) = set.insert(peer());
        drop(dead);

        assert_eq!(set.broadcast(r#"{"velocidade":3}"#), 2);
        assert_eq!(text_of(first.try_recv().unwrap()), r#"{"velocidade":3}"#);
        assert_eq!(text_of(third.try_recv().unwrap()), r#"{"velocidade":3}"#);

        assert_eq!(set.len(), 3);
        assert!(set.remove(gone));
    }

    #[test]
    fn stalled_connection_does_not_hold_back_the_others() {
        let set = ConnectionSet::new();
        let (_, mut stalled) = set.insert(peer());
        let (_, mut reader) = set.insert(peer());

        for i in 0..OUTBOUND_CAPACITY {
            assert_eq!(set.broadcast(&format!(r#"{{"nivel":{i}}}"#)), 2);
            reader.try_recv().unwrap();
        }

        // The stalled queue is full: only the reading client gets this one.
        assert_eq!(set.broadcast(r#"{"nivel":0}"#), 1);
        assert_eq!(text_of(reader.try_recv().unwrap()), r#"{"nivel":0}"#);

        // The backlog stays bounded and the connection is still registered.
        let mut backlog = 0;
        while stalled.try_recv().is_ok() {
            backlog += 1;
        }
        assert_eq!(backlog, OUTBOUND_CAPACITY);
        assert_eq!(set.len(), 2);
    }

    #[test]
    fn remove_is_idempotent() {
        let set = ConnectionSet::new();
        let (id, _rx) = set.insert(peer());

        assert!(set.remove(id));
        assert!(!set.remove(id));
        assert!(set.is_empty());
    }

    // ── End to end over loopback ──────────────────────────────────────────────

    async fn wait_for_clients(set: &ConnectionSet, n: usize) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while set.len() != n {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("client count never reached");
    }

    #[tokio::test]
    async fn hub_bridges_clients_both_ways() {
        let connections = Arc::new(ConnectionSet::new());
        let publisher = Arc::new(RecordingPublisher::default());
        let router = BridgeRouter::new(publisher.clone(), connections.clone());
        let hub = SocketHub::new(connections.clone(), router.clone());

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server_hub = hub.clone();
        tokio::spawn(async move {
            loop {
                let (stream, peer) = listener.accept().await.unwrap();
                let ws = accept_async(stream).await.unwrap();
                let hub = server_hub.clone();
                tokio::spawn(async move { hub.serve(ws, peer).await });
            }
        });

        let url = format!("ws://{addr}/");
        let (mut alice, _) = connect_async(url.as_str()).await.unwrap();
        let (mut bob, _) = connect_async(url.as_str()).await.unwrap();
        wait_for_clients(&connections, 2).await;

        // Malformed input first, then a valid command on the same socket.
        alice.send(Message::text("not json at all")).await.unwrap();
        alice.send(Message::text(r#"{"velocidade":5,"angulo":10}"#)).await.unwrap();

        tokio::time::timeout(Duration::from_secs(5), async {
            while publisher.published.lock().unwrap().is_empty() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("command never published");
        assert_eq!(
            publisher.published.lock().unwrap().clone(),
            vec![(RobotTopic::Commands, br#"{"velocidade":5,"angulo":10}"#.to_vec())]
        );

        // Broker → both clients.
        let sent = router.dispatch_inbound(&BrokerMessage::new("robo/bateria", r#"{"nivel":80}"#));
        assert_eq!(sent, 2);
        for client in [&mut alice, &mut bob] {
            let frame = tokio::time::timeout(Duration::from_secs(5), client.next())
                .await
                .unwrap()
                .unwrap()
                .unwrap();
            assert_eq!(text_of(frame), r#"{"nivel":80}"#);
        }

        // Bob leaves; Alice still gets updates.
        bob.close(None).await.unwrap();
        wait_for_clients(&connections, 1).await;

        let sent = router.dispatch_inbound(&BrokerMessage::new("robo/velocidade", r#"{"velocidade":3,"unit":"m/s"}"#));
        assert_eq!(sent, 1);
        let frame = tokio::time::timeout(Duration::from_secs(5), alice.next())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(text_of(frame), r#"{"velocidade":3}"#);
    }
}
