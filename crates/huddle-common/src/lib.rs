//! Common types shared by the huddle relay and its clients.
//!
//! This crate provides:
//! - The JSON envelope exchanged over the relay connection ([`envelope`])
//! - Participant identifiers and protocol constants ([`types`])

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod envelope;
pub mod types;

pub use envelope::{Envelope, MessageType, ParticipantInfo, ProtocolError, RawEnvelope};
pub use types::ParticipantId;
