//! JSON envelope exchanged over the relay connection.
//!
//! Every message is a UTF-8 JSON object with a mandatory `type` field. The relay
//! works on [`RawEnvelope`], which validates the routing fields and leaves the
//! payload untouched. Clients decode into the typed [`Envelope`].

use crate::types::{field, ParticipantId};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

/// Envelope discriminator, one per `type` value on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageType {
    /// Full visible roster, sent to a participant when it connects.
    ParticipantList,
    /// A participant joined (or resumed).
    ParticipantJoined,
    /// A participant's connection dropped.
    ParticipantLeft,
    /// Session description offer.
    Offer,
    /// Session description answer.
    Answer,
    /// Connectivity candidate.
    IceCandidate,
    /// Chat line.
    Chat,
    /// Relay-side error report.
    Error,
}

impl MessageType {
    /// All recognised types.
    pub const ALL: [Self; 8] = [
        Self::ParticipantList,
        Self::ParticipantJoined,
        Self::ParticipantLeft,
        Self::Offer,
        Self::Answer,
        Self::IceCandidate,
        Self::Chat,
        Self::Error,
    ];

    /// Wire name of this type.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::ParticipantList => "participant-list",
            Self::ParticipantJoined => "participant-joined",
            Self::ParticipantLeft => "participant-left",
            Self::Offer => "offer",
            Self::Answer => "answer",
            Self::IceCandidate => "ice-candidate",
            Self::Chat => "chat",
            Self::Error => "error",
        }
    }

    /// Look up a type by its wire name.
    #[must_use]
    pub fn from_wire(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|t| t.as_str() == name)
    }

    /// Whether a client may send this type to the relay.
    ///
    /// Presence and error envelopes originate at the relay only.
    #[must_use]
    pub const fn is_client_sendable(self) -> bool {
        matches!(
            self,
            Self::Offer | Self::Answer | Self::IceCandidate | Self::Chat
        )
    }
}

impl std::fmt::Display for MessageType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors produced while validating or decoding an envelope.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// The message is not valid JSON, or does not match the schema for its type.
    #[error("invalid message format: {0}")]
    InvalidJson(String),
    /// The message is JSON but not an object.
    #[error("message must be a JSON object")]
    NotAnObject,
    /// The `type` field is absent or not a string.
    #[error("missing message type")]
    MissingType,
    /// The `type` field names no known message type.
    #[error("unknown message type: {0}")]
    UnknownType(String),
    /// The type is known but clients may not send it.
    #[error("message type not accepted from clients: {0}")]
    NotClientSendable(MessageType),
    /// A routing or relay-inspected field has the wrong shape.
    #[error("invalid field: {0}")]
    InvalidField(&'static str),
    /// The frame was binary instead of UTF-8 text.
    #[error("binary frames are not supported")]
    BinaryFrame,
}

/// Roster entry as carried by presence envelopes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParticipantInfo {
    /// Relay-assigned id.
    pub id: ParticipantId,
    /// Display name.
    pub name: String,
    /// Present on `participant-list` entries.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_connected: Option<bool>,
}

/// Typed envelope, as decoded by clients and produced by the relay.
///
/// Handshake payloads stay as raw JSON values here: the relay never interprets
/// them and clients decode them against their media engine's types.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(
    tag = "type",
    rename_all = "kebab-case",
    rename_all_fields = "camelCase"
)]
pub enum Envelope {
    /// Visible roster sent to a newly connected participant.
    ParticipantList {
        /// Every connected participant, the recipient included.
        participants: Vec<ParticipantInfo>,
        /// The recipient's own id.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        self_id: Option<ParticipantId>,
        /// Token to present on reconnect to resume this identity.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        session_token: Option<String>,
    },
    /// Another participant joined.
    ParticipantJoined {
        /// The joining participant.
        participant: ParticipantInfo,
    },
    /// Another participant's connection dropped.
    ParticipantLeft {
        /// Id of the departed participant.
        participant_id: ParticipantId,
    },
    /// Session description offer.
    Offer {
        /// Opaque description payload.
        offer: Value,
        /// Stamped by the relay.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        sender_id: Option<ParticipantId>,
        /// Intended recipient, if not everyone.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        target: Option<ParticipantId>,
    },
    /// Session description answer.
    Answer {
        /// Opaque description payload.
        answer: Value,
        /// Stamped by the relay.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        sender_id: Option<ParticipantId>,
        /// Intended recipient, if not everyone.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        target: Option<ParticipantId>,
    },
    /// Connectivity candidate.
    IceCandidate {
        /// Opaque candidate payload.
        candidate: Value,
        /// Stamped by the relay.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        sender_id: Option<ParticipantId>,
        /// Intended recipient, if not everyone.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        target: Option<ParticipantId>,
    },
    /// Chat line.
    Chat {
        /// Message body.
        text: String,
        /// Sender display name, stamped by the relay.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        sender: Option<String>,
        /// Stamped by the relay.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        sender_id: Option<ParticipantId>,
    },
    /// Error report, relay to the offending sender only.
    Error {
        /// Human-readable reason.
        message: String,
    },
}

impl Envelope {
    /// Decode a text frame received from the relay.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::UnknownType`] for a well-formed envelope whose
    /// type this build does not know, so callers can ignore it, and another
    /// variant when the frame is malformed.
    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        let value: Value =
            serde_json::from_str(text).map_err(|e| ProtocolError::InvalidJson(e.to_string()))?;
        let kind = message_type_of(&value)?;
        serde_json::from_value(value)
            .map_err(|e| ProtocolError::InvalidJson(format!("{kind}: {e}")))
    }

    /// Encode as a JSON text frame.
    #[must_use]
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).expect("envelope fields always serialize")
    }

    /// The discriminator of this envelope.
    #[must_use]
    pub const fn kind(&self) -> MessageType {
        match self {
            Self::ParticipantList { .. } => MessageType::ParticipantList,
            Self::ParticipantJoined { .. } => MessageType::ParticipantJoined,
            Self::ParticipantLeft { .. } => MessageType::ParticipantLeft,
            Self::Offer { .. } => MessageType::Offer,
            Self::Answer { .. } => MessageType::Answer,
            Self::IceCandidate { .. } => MessageType::IceCandidate,
            Self::Chat { .. } => MessageType::Chat,
            Self::Error { .. } => MessageType::Error,
        }
    }

    /// Creates an `error` envelope.
    #[must_use]
    pub fn error(message: impl Into<String>) -> Self {
        Self::Error {
            message: message.into(),
        }
    }
}

fn message_type_of(value: &Value) -> Result<MessageType, ProtocolError> {
    let obj = value.as_object().ok_or(ProtocolError::NotAnObject)?;
    let name = obj
        .get(field::TYPE)
        .and_then(Value::as_str)
        .ok_or(ProtocolError::MissingType)?;
    MessageType::from_wire(name).ok_or_else(|| ProtocolError::UnknownType(name.to_string()))
}

/// A client envelope as seen by the relay: validated routing fields plus an
/// untouched payload.
#[derive(Debug, Clone, PartialEq)]
pub struct RawEnvelope {
    kind: MessageType,
    fields: Map<String, Value>,
}

impl RawEnvelope {
    /// Validate a text frame sent by a client.
    ///
    /// Checks that the frame is a JSON object with a recognised, client-sendable
    /// `type`, that an optional `target` is a string, and that a chat line has a
    /// string `text`. Handshake payloads are not inspected.
    ///
    /// # Errors
    ///
    /// Returns the first validation failure found.
    pub fn parse(text: &str) -> Result<Self, ProtocolError> {
        let value: Value =
            serde_json::from_str(text).map_err(|e| ProtocolError::InvalidJson(e.to_string()))?;
        let kind = message_type_of(&value)?;
        if !kind.is_client_sendable() {
            return Err(ProtocolError::NotClientSendable(kind));
        }
        let Value::Object(fields) = value else {
            return Err(ProtocolError::NotAnObject);
        };

        match fields.get(field::TARGET) {
            None | Some(Value::Null | Value::String(_)) => {}
            Some(_) => return Err(ProtocolError::InvalidField(field::TARGET)),
        }
        if kind == MessageType::Chat && !fields.get(field::TEXT).is_some_and(Value::is_string) {
            return Err(ProtocolError::InvalidField(field::TEXT));
        }

        Ok(Self { kind, fields })
    }

    /// The validated discriminator.
    #[must_use]
    pub const fn kind(&self) -> MessageType {
        self.kind
    }

    /// Single-recipient routing hint, if the sender supplied one.
    #[must_use]
    pub fn target(&self) -> Option<&str> {
        self.fields.get(field::TARGET).and_then(Value::as_str)
    }

    /// Overwrite `senderId` with the relay's view of the sender.
    pub fn stamp_sender_id(&mut self, id: &str) {
        self.fields
            .insert(field::SENDER_ID.to_string(), Value::String(id.to_string()));
    }

    /// Overwrite the chat `sender` with the registry display name.
    pub fn stamp_sender_name(&mut self, name: &str) {
        self.fields
            .insert(field::SENDER.to_string(), Value::String(name.to_string()));
    }

    /// Read a top-level field.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.fields.get(key)
    }

    /// Encode as a JSON text frame.
    #[must_use]
    pub fn to_json(&self) -> String {
        Value::Object(self.fields.clone()).to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn message_type_wire_names_round_trip() {
        for kind in MessageType::ALL {
            assert_eq!(MessageType::from_wire(kind.as_str()), Some(kind));
        }
        assert_eq!(MessageType::from_wire("renegotiate"), None);
    }

    #[test]
    fn participant_list_uses_wire_field_names() {
        let env = Envelope::ParticipantList {
            participants: vec![ParticipantInfo {
                id: "p1".into(),
                name: "User 1".into(),
                is_connected: Some(true),
            }],
            self_id: Some("p1".into()),
            session_token: Some("tok".into()),
        };
        let value: Value = serde_json::from_str(&env.to_json()).unwrap();
        assert_eq!(
            value,
            json!({
                "type": "participant-list",
                "participants": [{"id": "p1", "name": "User 1", "isConnected": true}],
                "selfId": "p1",
                "sessionToken": "tok",
            })
        );
    }

    #[test]
    fn participant_left_uses_participant_id_field() {
        let env = Envelope::ParticipantLeft {
            participant_id: "p9".into(),
        };
        let value: Value = serde_json::from_str(&env.to_json()).unwrap();
        assert_eq!(value, json!({"type": "participant-left", "participantId": "p9"}));
    }

    #[test]
    fn joined_entry_omits_connection_flag() {
        let env = Envelope::ParticipantJoined {
            participant: ParticipantInfo {
                id: "p2".into(),
                name: "User 2".into(),
                is_connected: None,
            },
        };
        let value: Value = serde_json::from_str(&env.to_json()).unwrap();
        assert_eq!(
            value,
            json!({"type": "participant-joined", "participant": {"id": "p2", "name": "User 2"}})
        );
    }

    #[test]
    fn decode_handshake_keeps_payload_opaque() {
        let text = r#"{"type":"ice-candidate","candidate":{"candidate":"c","sdpMid":"0","extra":[1,2]},"senderId":"a1"}"#;
        let env = Envelope::decode(text).unwrap();
        match env {
            Envelope::IceCandidate {
                candidate,
                sender_id,
                target,
            } => {
                assert_eq!(candidate["extra"], json!([1, 2]));
                assert_eq!(sender_id.as_deref(), Some("a1"));
                assert!(target.is_none());
            }
            other => panic!("expected ice-candidate, got {other:?}"),
        }
    }

    #[test]
    fn decode_unknown_type_is_distinguishable() {
        let err = Envelope::decode(r#"{"type":"hand-raise","who":"x"}"#).unwrap_err();
        assert_eq!(err, ProtocolError::UnknownType("hand-raise".into()));
    }

    #[test]
    fn decode_rejects_missing_payload_fields() {
        let err = Envelope::decode(r#"{"type":"chat"}"#).unwrap_err();
        assert!(matches!(err, ProtocolError::InvalidJson(_)));
    }

    #[test]
    fn raw_parse_rejects_malformed_json() {
        assert!(matches!(
            RawEnvelope::parse("{not json"),
            Err(ProtocolError::InvalidJson(_))
        ));
    }

    #[test]
    fn raw_parse_rejects_non_object() {
        assert_eq!(
            RawEnvelope::parse("[1,2,3]").unwrap_err(),
            ProtocolError::NotAnObject
        );
    }

    #[test]
    fn raw_parse_rejects_missing_and_non_string_type() {
        assert_eq!(
            RawEnvelope::parse(r#"{"text":"hi"}"#).unwrap_err(),
            ProtocolError::MissingType
        );
        assert_eq!(
            RawEnvelope::parse(r#"{"type":7}"#).unwrap_err(),
            ProtocolError::MissingType
        );
    }

    #[test]
    fn raw_parse_rejects_unknown_type() {
        assert_eq!(
            RawEnvelope::parse(r#"{"type":"kick","id":"x"}"#).unwrap_err(),
            ProtocolError::UnknownType("kick".into())
        );
    }

    #[test]
    fn raw_parse_rejects_relay_only_types() {
        let err = RawEnvelope::parse(r#"{"type":"participant-left","participantId":"x"}"#)
            .unwrap_err();
        assert_eq!(
            err,
            ProtocolError::NotClientSendable(MessageType::ParticipantLeft)
        );
    }

    #[test]
    fn raw_parse_rejects_chat_without_text() {
        assert_eq!(
            RawEnvelope::parse(r#"{"type":"chat","text":5}"#).unwrap_err(),
            ProtocolError::InvalidField("text")
        );
    }

    #[test]
    fn raw_parse_rejects_non_string_target() {
        assert_eq!(
            RawEnvelope::parse(r#"{"type":"offer","offer":{},"target":42}"#).unwrap_err(),
            ProtocolError::InvalidField("target")
        );
    }

    #[test]
    fn stamping_replaces_client_claims_and_keeps_payload() {
        let mut raw = RawEnvelope::parse(
            r#"{"type":"chat","text":"hi","sender":"Mallory","senderId":"forged","mood":"ok"}"#,
        )
        .unwrap();
        raw.stamp_sender_id("p1");
        raw.stamp_sender_name("User 1");

        let value: Value = serde_json::from_str(&raw.to_json()).unwrap();
        assert_eq!(value["sender"], "User 1");
        assert_eq!(value["senderId"], "p1");
        assert_eq!(value["mood"], "ok");
        assert_eq!(value["text"], "hi");
    }

    #[test]
    fn target_is_exposed_for_routing() {
        let raw =
            RawEnvelope::parse(r#"{"type":"answer","answer":{"sdp":"x"},"target":"b2"}"#).unwrap();
        assert_eq!(raw.kind(), MessageType::Answer);
        assert_eq!(raw.target(), Some("b2"));
        assert_eq!(raw.get("answer"), Some(&json!({"sdp": "x"})));
    }
}
