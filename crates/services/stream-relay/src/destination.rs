//! Output destinations
//!
//! A destination names where the encoder pushes its output. It is parsed once
//! from the client's control message and never mutated afterwards; a new
//! destination always means a new encoder process.
//!
//! # SRT
//!
//! SRT targets are normalised so only the options the encoder understands
//! survive, in a fixed order:
//!
//! ```text
//! srt://<host>:<port>?mode=<caller|listener|rendezvous>&latency=<ms>[&passphrase=<p>][&streamid=<id>]
//! ```
//!
//! | Key | Default | Description |
//! |-----|---------|-------------|
//! | `mode` | `caller` | SRT connection mode |
//! | `latency` | `200` | Receiver latency in milliseconds |
//! | `passphrase` | - | Encryption passphrase |
//! | `streamid` | - | Stream identifier passed to the remote listener |

use serde::{Deserialize, Serialize};
use std::fmt;
use url::Url;

/// SRT connection mode
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SrtMode {
    #[default]
    Caller,
    Listener,
    Rendezvous,
}

impl SrtMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            SrtMode::Caller => "caller",
            SrtMode::Listener => "listener",
            SrtMode::Rendezvous => "rendezvous",
        }
    }

    fn parse(value: &str) -> Result<Self, DestinationError> {
        match value {
            "caller" => Ok(SrtMode::Caller),
            "listener" => Ok(SrtMode::Listener),
            "rendezvous" => Ok(SrtMode::Rendezvous),
            other => Err(DestinationError::InvalidParameter {
                key: "mode",
                value: other.to_string(),
            }),
        }
    }
}

/// Defaults applied to SRT parameters the client leaves out
#[derive(Debug, Clone, Copy)]
pub struct SrtDefaults {
    pub mode: SrtMode,
    pub latency_ms: u32,
}

impl Default for SrtDefaults {
    fn default() -> Self {
        Self {
            mode: SrtMode::Caller,
            latency_ms: 200,
        }
    }
}

/// SRT-specific options folded into the output URL
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SrtParams {
    pub mode: SrtMode,
    pub latency_ms: u32,
    pub passphrase: Option<String>,
    pub streamid: Option<String>,
}

/// Transport of a destination
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Protocol {
    Srt(SrtParams),
    Rtmp,
    Rtmps,
    Udp,
}

impl Protocol {
    pub fn scheme(&self) -> &'static str {
        match self {
            Protocol::Srt(_) => "srt",
            Protocol::Rtmp => "rtmp",
            Protocol::Rtmps => "rtmps",
            Protocol::Udp => "udp",
        }
    }
}

/// A validated, immutable output target
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Destination {
    host: String,
    port: Option<u16>,
    protocol: Protocol,
    /// Exactly what the encoder receives as its output argument
    url: String,
}

impl Destination {
    /// Parse a destination with default SRT parameters
    pub fn parse(raw: &str) -> Result<Self, DestinationError> {
        Self::parse_with(raw, SrtDefaults::default())
    }

    /// Parse a destination, filling missing SRT parameters from `defaults`
    pub fn parse_with(raw: &str, defaults: SrtDefaults) -> Result<Self, DestinationError> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Err(DestinationError::Empty);
        }

        let parsed = Url::parse(raw).map_err(|e| DestinationError::InvalidUrl(e.to_string()))?;
        let host = parsed
            .host_str()
            .filter(|h| !h.is_empty())
            .ok_or(DestinationError::MissingHost)?
            .to_string();
        let port = parsed.port();

        let protocol = match parsed.scheme() {
            "srt" => {
                let port = port.ok_or(DestinationError::MissingPort)?;
                let params = srt_params(&parsed, defaults)?;
                let url = srt_url(&host, port, &params);
                return Ok(Self {
                    host,
                    port: Some(port),
                    protocol: Protocol::Srt(params),
                    url,
                });
            }
            "rtmp" => Protocol::Rtmp,
            "rtmps" => Protocol::Rtmps,
            "udp" => {
                if port.is_none() {
                    return Err(DestinationError::MissingPort);
                }
                Protocol::Udp
            }
            other => return Err(DestinationError::UnsupportedScheme(other.to_string())),
        };

        Ok(Self {
            host,
            port,
            protocol,
            url: raw.to_string(),
        })
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> Option<u16> {
        self.port
    }

    pub fn protocol(&self) -> &Protocol {
        &self.protocol
    }

    /// The URL handed to the encoder
    pub fn url(&self) -> &str {
        &self.url
    }

    /// Container format the encoder must mux into for this transport
    pub fn muxer(&self) -> &'static str {
        match self.protocol {
            Protocol::Srt(_) | Protocol::Udp => "mpegts",
            Protocol::Rtmp | Protocol::Rtmps => "flv",
        }
    }

    /// URL safe for logs and client messages (SRT passphrase masked)
    pub fn redacted(&self) -> String {
        match &self.protocol {
            Protocol::Srt(params) if params.passphrase.is_some() => {
                let masked = SrtParams {
                    passphrase: Some("***".to_string()),
                    ..params.clone()
                };
                srt_url(&self.host, self.port.unwrap_or_default(), &masked)
            }
            _ => self.url.clone(),
        }
    }
}

impl fmt::Display for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.redacted())
    }
}

fn srt_params(url: &Url, defaults: SrtDefaults) -> Result<SrtParams, DestinationError> {
    let mut params = SrtParams {
        mode: defaults.mode,
        latency_ms: defaults.latency_ms,
        passphrase: None,
        streamid: None,
    };

    for (key, value) in url.query_pairs() {
        match key.as_ref() {
            "mode" => params.mode = SrtMode::parse(&value)?,
            "latency" => {
                params.latency_ms =
                    value
                        .parse()
                        .map_err(|_| DestinationError::InvalidParameter {
                            key: "latency",
                            value: value.to_string(),
                        })?
            }
            "passphrase" if !value.is_empty() => params.passphrase = Some(value.into_owned()),
            "streamid" if !value.is_empty() => params.streamid = Some(value.into_owned()),
            _ => {
                // Dropped: the encoder only receives the options above
            }
        }
    }

    Ok(params)
}

fn srt_url(host: &str, port: u16, params: &SrtParams) -> String {
    let mut url = format!(
        "srt://{}:{}?mode={}&latency={}",
        host,
        port,
        params.mode.as_str(),
        params.latency_ms
    );
    if let Some(ref passphrase) = params.passphrase {
        url.push_str("&passphrase=");
        url.push_str(passphrase);
    }
    if let Some(ref streamid) = params.streamid {
        url.push_str("&streamid=");
        url.push_str(streamid);
    }
    url
}

/// Errors that can occur when parsing a destination
#[derive(Debug, thiserror::Error, PartialEq)]
pub enum DestinationError {
    #[error("Destination is empty")]
    Empty,

    #[error("Invalid destination URL: {0}")]
    InvalidUrl(String),

    #[error("Destination has no host")]
    MissingHost,

    #[error("Destination has no port")]
    MissingPort,

    #[error("Unsupported destination scheme: {0}")]
    UnsupportedScheme(String),

    #[error("Invalid value for {key}: {value}")]
    InvalidParameter { key: &'static str, value: String },
}
