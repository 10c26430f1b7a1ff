//! `robobridge-middleware` – The Nervous System
//!
//! Moves data between the MQTT broker and the socket clients without caring
//! who the clients are.
//!
//! # Modules
//!
//! - [`broker`] – single upstream MQTT connection built on `rumqttc`, with a
//!   reconnect-with-backoff driver task and an inbound message stream.
//! - [`router`] – topic → behaviour dispatch between the broker and the
//!   socket hub, in both directions.

pub mod broker;
pub mod router;

pub use broker::{Backoff, BrokerClient, BrokerConfig, BrokerInbound, ConnectionState};
pub use router::{Broadcaster, BridgeRouter, CommandPublisher};
