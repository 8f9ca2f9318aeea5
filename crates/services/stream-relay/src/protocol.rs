//! Wire protocol between the browser client and the relay
//!
//! Every inbound frame is either a control message or a media chunk. A frame
//! whose first byte is `{` is parsed as a JSON control message; anything else
//! is opaque container data destined for the encoder.
//!
//! Control messages:
//!
//! ```json
//! {"action": "start",  "destination": "srt://host:9000", "config": {"hasAudio": true, "hasVideo": true}}
//! {"action": "switch", "destination": "srt://host:9001"}
//! {"action": "stop"}
//! ```
//!
//! Server messages are JSON text frames tagged by `type`:
//!
//! ```json
//! {"type": "started", "session_id": "3f2a9c81b4d0", "destination": "srt://host:9000?mode=caller&latency=200"}
//! {"type": "stopped"}
//! {"type": "error", "message": "...", "source": "encoder"}
//! ```

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::destination::{Destination, DestinationError, SrtDefaults};
use crate::encoder::TrackLayout;

/// Parsed control message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlMessage {
    /// Begin relaying to a destination (a switch when already relaying)
    Start(StreamRequest),
    /// Move the relay to another destination
    Switch(StreamRequest),
    /// Stop relaying; the connection stays open
    Stop,
}

impl ControlMessage {
    pub fn action(&self) -> &'static str {
        match self {
            ControlMessage::Start(_) => "start",
            ControlMessage::Switch(_) => "switch",
            ControlMessage::Stop => "stop",
        }
    }
}

/// Destination and track layout of a start or switch
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamRequest {
    pub destination: Destination,
    pub tracks: TrackLayout,
}

/// One classified inbound frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    Control(ControlMessage),
    Media(Bytes),
}

/// Control message as it appears on the wire
#[derive(Debug, Deserialize)]
struct RawControl {
    action: String,
    #[serde(default)]
    destination: Option<String>,
    #[serde(default)]
    config: Option<TrackConfig>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TrackConfig {
    #[serde(default = "default_true")]
    has_audio: bool,
    #[serde(default = "default_true")]
    has_video: bool,
}

fn default_true() -> bool {
    true
}

impl From<TrackConfig> for TrackLayout {
    fn from(config: TrackConfig) -> Self {
        Self {
            has_audio: config.has_audio,
            has_video: config.has_video,
        }
    }
}

/// Splits inbound frames into control messages and media
#[derive(Debug, Clone, Copy, Default)]
pub struct Demultiplexer {
    srt_defaults: SrtDefaults,
}

impl Demultiplexer {
    pub fn new(srt_defaults: SrtDefaults) -> Self {
        Self { srt_defaults }
    }

    /// Classify a frame
    ///
    /// Fails for malformed control messages only; media is never inspected.
    pub fn classify(&self, frame: Bytes) -> Result<Inbound, ProtocolError> {
        if frame.first() != Some(&b'{') {
            return Ok(Inbound::Media(frame));
        }

        let raw: RawControl = serde_json::from_slice(&frame)
            .map_err(|e| ProtocolError::InvalidJson(e.to_string()))?;
        self.control(raw).map(Inbound::Control)
    }

    fn control(&self, raw: RawControl) -> Result<ControlMessage, ProtocolError> {
        match raw.action.as_str() {
            "start" => Ok(ControlMessage::Start(self.request("start", raw)?)),
            "switch" => Ok(ControlMessage::Switch(self.request("switch", raw)?)),
            "stop" => Ok(ControlMessage::Stop),
            _ => Err(ProtocolError::UnknownAction(raw.action)),
        }
    }

    fn request(&self, action: &'static str, raw: RawControl) -> Result<StreamRequest, ProtocolError> {
        let destination = raw
            .destination
            .filter(|d| !d.trim().is_empty())
            .ok_or(ProtocolError::MissingDestination(action))?;
        let destination = Destination::parse_with(&destination, self.srt_defaults)?;
        let tracks = raw.config.map(TrackLayout::from).unwrap_or_default();

        Ok(StreamRequest {
            destination,
            tracks,
        })
    }
}

/// Component an error message originates from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorSource {
    /// Malformed client message
    Protocol,
    /// Request not valid in the current session state
    Session,
    /// Encoder diagnostics, spawn failures and crashes
    Encoder,
    /// Backpressure
    Queue,
}

/// Message sent from the relay to the client
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ServerMessage {
    /// Relay running to `destination`
    Started {
        session_id: String,
        destination: String,
    },
    /// Relay stopped
    Stopped {
        #[serde(skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
    /// A request failed or the relay hit a problem
    Error {
        message: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        source: Option<ErrorSource>,
    },
}

impl ServerMessage {
    pub fn error(message: impl Into<String>, source: ErrorSource) -> Self {
        ServerMessage::Error {
            message: message.into(),
            source: Some(source),
        }
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|e| {
            format!(r#"{{"type":"error","message":"failed to encode message: {}"}}"#, e)
        })
    }
}

/// Errors that can occur when decoding client messages
#[derive(Debug, thiserror::Error, PartialEq)]
pub enum ProtocolError {
    #[error("Invalid control message: {0}")]
    InvalidJson(String),

    #[error("Unknown action: {0}")]
    UnknownAction(String),

    #[error("Missing destination for {0}")]
    MissingDestination(&'static str),

    #[error(transparent)]
    Destination(#[from] DestinationError),
}
