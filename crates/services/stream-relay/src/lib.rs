//! Browser-to-SRT Stream Relay
//!
//! Browsers push live media (e.g. MediaRecorder WebM chunks) over a
//! WebSocket; the relay pipes it into an external encoder that transcodes and
//! pushes the result to an SRT, RTMP(S) or UDP destination. Each connection
//! gets its own encoder, restarted on crashes and replaced on destination
//! switches.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                           avstream-relay                                │
//! ├─────────────────────────────────────────────────────────────────────────┤
//! │                                                                         │
//! │  ┌──────────────────┐   frames   ┌──────────────────┐                   │
//! │  │ WebSocket Server │──────────▶│  Demultiplexer   │                   │
//! │  │ (tungstenite)    │            │ control │ media  │                   │
//! │  └────────┬─────────┘            └────┬────┴───┬────┘                   │
//! │           │ registers                  │        │                       │
//! │           ▼                            ▼        ▼                       │
//! │  ┌──────────────────┐        ┌──────────────────────────────────────┐  │
//! │  │ Connection       │───────▶│ Session task (one per connection)    │  │
//! │  │ Registry         │        │  ┌────────────┐    ┌──────────────┐  │  │
//! │  └────────┬─────────┘        │  │ WriteQueue │───▶│  Supervisor  │  │  │
//! │           │                  │  └────────────┘    └──────┬───────┘  │  │
//! │  ┌────────┴─────────┐        └───────────────────────────┼──────────┘  │
//! │  │ HTTP API (axum)  │                        stdin       ▼             │
//! │  │ /health /metrics │                  ┌──────────────────────────┐    │
//! │  └──────────────────┘                  │ ffmpeg ─▶ srt://host:port │    │
//! │                                        └──────────────────────────┘    │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

pub mod api;
pub mod config;
pub mod destination;
pub mod encoder;
pub mod error;
pub mod metrics;
pub mod process;
pub mod protocol;
pub mod queue;
pub mod registry;
pub mod server;
pub mod session;
pub mod supervisor;

pub use error::{RelayError, Result};
