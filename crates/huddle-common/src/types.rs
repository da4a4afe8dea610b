//! Core type definitions and protocol constants.

/// Opaque participant identifier assigned by the relay at connect time.
pub type ParticipantId = String;

/// Default TCP port the relay listens on.
pub const DEFAULT_RELAY_PORT: u16 = 8080;

/// Default grace window, in milliseconds, before a dropped participant is removed.
pub const DEFAULT_GRACE_PERIOD_MS: u64 = 5_000;

/// Longest display name the relay accepts from a client request.
pub const MAX_DISPLAY_NAME_LEN: usize = 64;

/// Connect query parameters understood by the relay.
pub mod query {
    /// Session token presented to resume a retained identity.
    pub const RESUME: &str = "resume";
    /// Requested display name.
    pub const NAME: &str = "name";
}

/// Field names the relay reads or stamps on relayed envelopes.
pub mod field {
    /// Discriminator present on every envelope.
    pub const TYPE: &str = "type";
    /// Sender id, stamped by the relay.
    pub const SENDER_ID: &str = "senderId";
    /// Sender display name on chat envelopes, stamped by the relay.
    pub const SENDER: &str = "sender";
    /// Optional single-recipient routing hint.
    pub const TARGET: &str = "target";
    /// Chat body.
    pub const TEXT: &str = "text";
}
