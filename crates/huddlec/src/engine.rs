//! Seam to the media-transport engine.
//!
//! The client never encodes media or traverses NATs itself; it drives an engine
//! through [`MediaEngine`] and hears back through an [`EventSink`]. One engine
//! instance serves one remote peer and is replaced wholesale when a negotiation
//! is reset.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;
use tokio::sync::mpsc;

/// Whether a session description is an offer or an answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpKind {
    /// Description proposed by the initiating side.
    Offer,
    /// Description returned by the responding side.
    Answer,
}

/// A session description as carried in `offer` / `answer` envelopes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    /// Offer or answer.
    #[serde(rename = "type")]
    pub kind: SdpKind,
    /// Opaque description body.
    pub sdp: String,
}

impl SessionDescription {
    /// JSON form placed in the envelope payload.
    #[must_use]
    pub fn to_value(&self) -> Value {
        let kind = match self.kind {
            SdpKind::Offer => "offer",
            SdpKind::Answer => "answer",
        };
        json!({ "type": kind, "sdp": self.sdp })
    }
}

/// A connectivity candidate as carried in `ice-candidate` envelopes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidate {
    /// Opaque candidate line.
    pub candidate: String,
    /// Media stream identification tag.
    #[serde(default)]
    pub sdp_mid: Option<String>,
    /// Index of the media description the candidate belongs to.
    #[serde(default)]
    pub sdp_m_line_index: Option<u16>,
}

impl IceCandidate {
    /// JSON form placed in the envelope payload.
    #[must_use]
    pub fn to_value(&self) -> Value {
        json!({
            "candidate": self.candidate,
            "sdpMid": self.sdp_mid,
            "sdpMLineIndex": self.sdp_m_line_index,
        })
    }
}

/// Transport connectivity as reported by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectivityState {
    /// Nothing tried yet.
    New,
    /// Candidate pairs are being checked.
    Checking,
    /// A usable path exists.
    Connected,
    /// Checking finished with a usable path.
    Completed,
    /// The path dropped.
    Disconnected,
    /// No path could be found.
    Failed,
    /// The engine was shut down.
    Closed,
}

impl ConnectivityState {
    /// Media can flow.
    #[must_use]
    pub const fn is_usable(self) -> bool {
        matches!(self, Self::Connected | Self::Completed)
    }

    /// The negotiation has to start over.
    #[must_use]
    pub const fn is_failure(self) -> bool {
        matches!(self, Self::Disconnected | Self::Failed | Self::Closed)
    }
}

/// Callbacks raised by an engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineEvent {
    /// A remote media track arrived.
    RemoteTrack {
        /// Engine-assigned track identifier.
        track_id: String,
    },
    /// The engine gathered a local candidate that must reach the peer.
    LocalCandidate(IceCandidate),
    /// Connectivity changed.
    ConnectivityChanged(ConnectivityState),
}

/// Event tagged with the generation of the engine that raised it.
pub type TaggedEvent = (u64, EngineEvent);

/// Where an engine delivers its events.
///
/// Every event carries the generation the sink was created for, so events from an
/// engine that has since been replaced can be told apart and dropped.
#[derive(Debug, Clone)]
pub struct EventSink {
    generation: u64,
    tx: mpsc::UnboundedSender<TaggedEvent>,
}

impl EventSink {
    /// Sink for the engine of the given generation.
    #[must_use]
    pub const fn new(generation: u64, tx: mpsc::UnboundedSender<TaggedEvent>) -> Self {
        Self { generation, tx }
    }

    /// Generation this sink tags events with.
    #[must_use]
    pub const fn generation(&self) -> u64 {
        self.generation
    }

    /// Deliver an event. Returns `false` once the link is gone.
    pub fn emit(&self, event: EngineEvent) -> bool {
        self.tx.send((self.generation, event)).is_ok()
    }
}

/// Local capture attached to every engine.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LocalMedia {
    /// Identifiers of the local tracks to send.
    pub tracks: Vec<String>,
}

/// Errors raised by an engine operation.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum EngineError {
    /// The engine refused the operation.
    #[error("engine rejected {operation}: {reason}")]
    Rejected {
        /// Operation that failed.
        operation: &'static str,
        /// Engine-provided reason.
        reason: String,
    },
    /// The engine was already closed.
    #[error("engine closed")]
    Closed,
}

/// Capabilities the client needs from a media-transport engine.
#[async_trait]
pub trait MediaEngine: Send {
    /// Produce a local offer description.
    async fn create_offer(&mut self) -> Result<SessionDescription, EngineError>;
    /// Produce a local answer to the applied remote offer.
    async fn create_answer(&mut self) -> Result<SessionDescription, EngineError>;
    /// Apply a locally created description.
    async fn set_local_description(&mut self, desc: SessionDescription) -> Result<(), EngineError>;
    /// Apply the peer's description.
    async fn set_remote_description(&mut self, desc: SessionDescription)
        -> Result<(), EngineError>;
    /// Accept one of the peer's candidates.
    async fn add_remote_candidate(&mut self, candidate: IceCandidate) -> Result<(), EngineError>;
    /// Start sending the local tracks.
    async fn attach_tracks(&mut self, media: &LocalMedia) -> Result<(), EngineError>;
    /// Stop sending local tracks.
    async fn detach_tracks(&mut self) -> Result<(), EngineError>;
    /// Release the engine. Further calls fail with [`EngineError::Closed`].
    async fn close(&mut self);
}

/// Builds one engine per peer link, and again whenever a link resets.
pub trait EngineFactory: Send + Sync {
    /// New engine for `peer_id` raising events into `events`.
    fn create(&self, peer_id: &str, events: EventSink) -> Box<dyn MediaEngine>;
}
