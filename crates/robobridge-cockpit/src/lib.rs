//! `robobridge-cockpit` – The Operator-Facing Server
//!
//! Boots a lightweight HTTP + WebSocket server (default port `3000`) that:
//!
//! 1. **Serves** the control front-end pages (login, menu, manual control,
//!    maintenance) from a directory on disk.
//!
//! 2. **Fans out** robot status, battery and velocity updates to every
//!    connected browser tab through the [`SocketHub`].
//!
//! 3. **Accepts** joystick commands `{"velocidade": n, "angulo": n}` from any
//!    tab and hands them to the [`BridgeRouter`] for publishing.
//!
//! # Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use robobridge_cockpit::{BridgeServer, ConnectionSet, SocketHub};
//! use robobridge_middleware::{BridgeRouter, BrokerClient, BrokerConfig};
//!
//! #[tokio::main]
//! async fn main() {
//!     let (broker, inbound) = BrokerClient::connect(&BrokerConfig::new("localhost", 1883))
//!         .expect("invalid broker config");
//!     let connections = Arc::new(ConnectionSet::new());
//!     let router = BridgeRouter::new(Arc::new(broker), connections.clone());
//!
//!     let fan_out = router.clone();
//!     tokio::spawn(async move { fan_out.run(inbound).await });
//!
//!     BridgeServer::new(SocketHub::new(connections, router))
//!         .run()
//!         .await
//!         .expect("bridge server failed");
//! }
//! ```
//!
//! [`BridgeRouter`]: robobridge_middleware::BridgeRouter

pub mod hub;
pub mod server;

pub use hub::{ConnectionSet, SocketHub};
pub use server::{BridgeServer, DEFAULT_PORT};
