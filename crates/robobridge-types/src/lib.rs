use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Number;
use thiserror::Error;
use uuid::Uuid;

/// The fixed broker channels the robot talks on.
///
/// The set is static for the lifetime of the process: the bridge subscribes
/// to [`RobotTopic::INBOUND`] and only ever publishes to
/// [`RobotTopic::Commands`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RobotTopic {
    /// Battery status reports, e.g. `{"nivel":80}`.
    Battery,
    /// General robot status object.
    Status,
    /// Measured velocity, projected to `{"velocidade": v}` before fan-out.
    Velocity,
    /// Drive commands produced by socket clients.
    Commands,
}

impl RobotTopic {
    /// Topics the broker client subscribes to on every (re)connect.
    pub const INBOUND: [RobotTopic; 3] = [RobotTopic::Battery, RobotTopic::Status, RobotTopic::Velocity];

    /// Wire name of the topic on the broker.
    pub fn as_str(self) -> &'static str {
        match self {
            RobotTopic::Battery => "robo/bateria",
            RobotTopic::Status => "robo/status",
            RobotTopic::Velocity => "robo/velocidade",
            RobotTopic::Commands => "robo/comandos",
        }
    }

    /// Map a broker topic name back to a known topic. Unknown names yield `None`.
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "robo/bateria" => Some(RobotTopic::Battery),
            "robo/status" => Some(RobotTopic::Status),
            "robo/velocidade" => Some(RobotTopic::Velocity),
            "robo/comandos" => Some(RobotTopic::Commands),
            _ => None,
        }
    }
}

impl std::fmt::Display for RobotTopic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single publish received from the broker.
///
/// Consumed exactly once by the router and then dropped.
#[derive(Debug, Clone)]
pub struct BrokerMessage {
    pub topic: String,
    pub payload: Bytes,
    pub received_at: DateTime<Utc>,
}

impl BrokerMessage {
    pub fn new(topic: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
            received_at: Utc::now(),
        }
    }

    /// Time since the driver received the message. Zero if the clock moved
    /// backwards.
    pub fn age(&self) -> std::time::Duration {
        (Utc::now() - self.received_at).to_std().unwrap_or_default()
    }
}

/// Joystick command sent by a socket client.
///
/// Wire format in both directions is `{"velocidade": number, "angulo": number}`.
/// Numbers are kept as [`serde_json::Number`] so the published payload carries
/// exactly the representation the client sent (`5` stays `5`, not `5.0`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DriveCommand {
    #[serde(rename = "velocidade")]
    pub speed: Number,
    #[serde(rename = "angulo")]
    pub angle: Number,
}

impl DriveCommand {
    /// Parse a raw client message. Both fields must be present and numeric.
    pub fn parse(raw: &str) -> Result<Self, BridgeError> {
        serde_json::from_str(raw).map_err(|e| BridgeError::Parse(format!("invalid drive command: {e}")))
    }

    /// Serialise to the broker payload.
    pub fn to_payload(&self) -> Result<Vec<u8>, BridgeError> {
        serde_json::to_vec(self).map_err(|e| BridgeError::Parse(e.to_string()))
    }
}

/// Identity of one open socket connection inside the hub.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(pub Uuid);

impl ConnectionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Error type shared by every RoboBridge crate.
///
/// None of these are fatal once the bridge is running; they are logged at the
/// point of detection. Only `Config` and `Io` during startup abort the process.
#[derive(Error, Debug)]
pub enum BridgeError {
    #[error("Configuration Error: {0}")]
    Config(String),

    #[error("Broker Error: {0}")]
    Broker(String),

    #[error("Socket Error: {0}")]
    Socket(String),

    #[error("Parse Error: {0}")]
    Parse(String),

    #[error("Process Control Error: {0}")]
    Process(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn topic_names_map_both_ways() {
        for topic in [
            RobotTopic::Battery,
            RobotTopic::Status,
            RobotTopic::Velocity,
            RobotTopic::Commands,
        ] {
            assert_eq!(RobotTopic::from_name(topic.as_str()), Some(topic));
        }
        assert_eq!(RobotTopic::from_name("robo/unknown"), None);
    }

    #[test]
    fn inbound_topics_exclude_commands() {
        assert!(!RobotTopic::INBOUND.contains(&RobotTopic::Commands));
        assert_eq!(RobotTopic::INBOUND.len(), 3);
    }

    #[test]
    fn drive_command_preserves_number_representation() {
        let cmd = DriveCommand::parse(r#"{"velocidade":5,"angulo":10}"#).unwrap();
        let payload = cmd.to_payload().unwrap();
        assert_eq!(payload, br#"{"velocidade":5,"angulo":10}"#.to_vec());
    }

    #[test]
    fn drive_command_ignores_extra_fields() {
        let cmd = DriveCommand::parse(r#"{"velocidade":-1.5,"angulo":90,"extra":true}"#).unwrap();
        assert_eq!(cmd.speed.as_f64(), Some(-1.5));
        assert_eq!(cmd.angle.as_i64(), Some(90));
    }

    #[test]
    fn drive_command_rejects_missing_field() {
        let err = DriveCommand::parse(r#"{"velocidade":5}"#).unwrap_err();
        assert!(matches!(err, BridgeError::Parse(_)));
    }

    #[test]
    fn drive_command_rejects_non_numeric_field() {
        assert!(DriveCommand::parse(r#"{"velocidade":"fast","angulo":10}"#).is_err());
        assert!(DriveCommand::parse(r#"{"velocidade":null,"angulo":10}"#).is_err());
    }

    #[test]
    fn drive_command_rejects_invalid_json() {
        assert!(DriveCommand::parse("not json at all").is_err());
        assert!(DriveCommand::parse("42").is_err());
    }

    #[test]
    fn broker_message_age_counts_from_receipt() {
        let mut message = BrokerMessage::new("robo/bateria", r#"{"nivel":80}"#);
        message.received_at -= chrono::Duration::milliseconds(250);
        assert!(message.age() >= std::time::Duration::from_millis(250));

        message.received_at = Utc::now() + chrono::Duration::seconds(60);
        assert_eq!(message.age(), std::time::Duration::ZERO);
    }

    #[test]
    fn bridge_error_display() {
        let err = BridgeError::Config("broker_host is empty".to_string());
        assert!(err.to_string().contains("Configuration Error"));
        assert!(err.to_string().contains("broker_host"));
    }
}
