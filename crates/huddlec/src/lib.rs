//! Huddle client: relay connection, per-peer negotiation and chat.
#![forbid(unsafe_code)]
#![warn(missing_docs)]

/// Exponential backoff with jitter for reconnection and renegotiation.
pub mod backoff;
/// CLI parsing and layered configuration.
pub mod config;
/// Routes relay envelopes to presence, chat and peer links.
pub mod dispatch;
/// Media engine that fabricates descriptions for signalling-only runs.
pub mod dry_run;
/// Media engine abstraction consumed by the negotiation state machine.
pub mod engine;
/// Per-peer task driving one negotiation with deadline and retry.
pub mod link;
/// Offer/answer state machine for a single peer.
pub mod negotiation;
/// WebSocket relay connection manager.
pub mod relay;
