use crate::engine::{EngineFactory, LocalMedia};
use crate::link::{LinkContext, LinkHandle, LinkInput, LinkSettings, LinkState};
use chrono::{DateTime, Utc};
use huddle_common::{Envelope, ParticipantId, ParticipantInfo, ProtocolError};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};

/// A chat line received through the relay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatMessage {
    /// Sender's display name as stamped by the relay.
    pub sender: String,
    /// Sender's id as stamped by the relay.
    pub sender_id: Option<ParticipantId>,
    /// Message body.
    pub text: String,
    /// Local receive time.
    pub received_at: DateTime<Utc>,
}

/// Events surfaced to the presentation layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientEvent {
    /// The relay admitted us; `roster` holds everyone else.
    Joined {
        /// Our id.
        self_id: ParticipantId,
        /// Other connected participants.
        roster: Vec<ParticipantInfo>,
    },
    /// Someone joined or resumed.
    PeerJoined(ParticipantInfo),
    /// Someone's connection dropped.
    PeerLeft(ParticipantId),
    /// A chat line arrived.
    Chat(ChatMessage),
    /// A link changed health.
    Link {
        /// Remote participant.
        peer: ParticipantId,
        /// New state.
        state: LinkState,
    },
    /// Remote media arrived on a link.
    RemoteTrack {
        /// Remote participant.
        peer: ParticipantId,
        /// Engine track id.
        track_id: String,
    },
    /// The relay rejected something we sent.
    RelayError(String),
}

/// Client-side router: owns the roster, the chat log and one link per peer.
pub struct Session {
    self_id: Option<ParticipantId>,
    session_token: Option<String>,
    roster: HashMap<ParticipantId, ParticipantInfo>,
    chat_log: Vec<ChatMessage>,
    links: HashMap<ParticipantId, LinkHandle>,
    factory: Arc<dyn EngineFactory>,
    media: LocalMedia,
    settings: LinkSettings,
    outbox: mpsc::Sender<Envelope>,
    events: broadcast::Sender<ClientEvent>,
}

impl Session {
    /// Empty session. Handshake envelopes produced by links go to `outbox`.
    #[must_use]
    pub fn new(
        factory: Arc<dyn EngineFactory>,
        media: LocalMedia,
        settings: LinkSettings,
        outbox: mpsc::Sender<Envelope>,
        events: broadcast::Sender<ClientEvent>,
    ) -> Self {
        Self {
            self_id: None,
            session_token: None,
            roster: HashMap::new(),
            chat_log: Vec::new(),
            links: HashMap::new(),
            factory,
            media,
            settings,
            outbox,
            events,
        }
    }

    /// Our id, once the relay has told us.
    #[must_use]
    pub fn self_id(&self) -> Option<&str> {
        self.self_id.as_deref()
    }

    /// Token to present on reconnect.
    #[must_use]
    pub fn session_token(&self) -> Option<&str> {
        self.session_token.as_deref()
    }

    /// Other connected participants, ordered by id.
    #[must_use]
    pub fn roster(&self) -> Vec<ParticipantInfo> {
        let mut roster: Vec<_> = self.roster.values().cloned().collect();
        roster.sort_by(|a, b| a.id.cmp(&b.id));
        roster
    }

    /// Chat lines received this session, oldest first.
    #[must_use]
    pub fn chat_log(&self) -> &[ChatMessage] {
        &self.chat_log
    }

    /// Whether a link to `peer` is running.
    #[must_use]
    pub fn has_link(&self, peer: &str) -> bool {
        self.links.contains_key(peer)
    }

    /// Decode and route one text frame from the relay.
    pub fn handle_text(&mut self, text: &str) {
        match Envelope::decode(text) {
            Ok(envelope) => self.handle(envelope),
            Err(ProtocolError::UnknownType(kind)) => {
                debug!(%kind, "ignoring envelope of unknown type");
            }
            Err(e) => warn!(error = %e, "ignoring undecodable envelope"),
        }
    }

    /// Route one decoded envelope.
    pub fn handle(&mut self, envelope: Envelope) {
        match envelope {
            Envelope::ParticipantList {
                participants,
                self_id,
                session_token,
            } => self.on_participant_list(participants, self_id, session_token),
            Envelope::ParticipantJoined { participant } => self.on_joined(participant),
            Envelope::ParticipantLeft { participant_id } => self.on_left(&participant_id),
            Envelope::Offer {
                offer,
                sender_id,
                target,
            } => self.route_handshake(sender_id, target, LinkInput::Offer(offer)),
            Envelope::Answer {
                answer,
                sender_id,
                target,
            } => self.route_handshake(sender_id, target, LinkInput::Answer(answer)),
            Envelope::IceCandidate {
                candidate,
                sender_id,
                target,
            } => self.route_handshake(sender_id, target, LinkInput::Candidate(candidate)),
            Envelope::Chat {
                text,
                sender,
                sender_id,
            } => {
                let message = ChatMessage {
                    sender: sender.unwrap_or_default(),
                    sender_id,
                    text,
                    received_at: Utc::now(),
                };
                self.chat_log.push(message.clone());
                self.emit(ClientEvent::Chat(message));
            }
            Envelope::Error { message } => {
                warn!(%message, "relay reported an error");
                self.emit(ClientEvent::RelayError(message));
            }
        }
    }

    fn on_participant_list(
        &mut self,
        participants: Vec<ParticipantInfo>,
        self_id: Option<ParticipantId>,
        session_token: Option<String>,
    ) {
        if let Some(id) = self_id {
            if self.self_id.as_deref() != Some(id.as_str()) {
                info!(self_id = %id, "identity assigned");
            }
            self.self_id = Some(id);
        }
        if session_token.is_some() {
            self.session_token = session_token;
        }

        let own = self.self_id.clone();
        self.roster = participants
            .into_iter()
            .filter(|p| own.as_deref() != Some(p.id.as_str()))
            .map(|p| (p.id.clone(), p))
            .collect();

        let roster = &self.roster;
        self.links.retain(|peer, link| {
            let keep = roster.contains_key(peer);
            if !keep {
                link.abort();
            }
            keep
        });
        let peers: Vec<_> = self.roster.keys().cloned().collect();
        for peer in peers {
            self.ensure_link(&peer);
        }

        if let Some(self_id) = self.self_id.clone() {
            let roster = self.roster();
            info!(peers = roster.len(), "joined room");
            self.emit(ClientEvent::Joined { self_id, roster });
        }
    }

    fn on_joined(&mut self, participant: ParticipantInfo) {
        if self.self_id.as_deref() == Some(participant.id.as_str()) {
            return;
        }
        info!(peer = %participant.id, name = %participant.name, "participant joined");
        let id = participant.id.clone();
        self.roster.insert(id.clone(), participant.clone());
        self.ensure_link(&id);
        self.emit(ClientEvent::PeerJoined(participant));
    }

    fn on_left(&mut self, id: &str) {
        let known = self.roster.remove(id).is_some();
        // Dropping the handle closes the link's input, which releases its engine.
        self.links.remove(id);
        if known {
            info!(peer = %id, "participant left");
            self.emit(ClientEvent::PeerLeft(id.to_string()));
        }
    }

    fn route_handshake(
        &mut self,
        sender_id: Option<ParticipantId>,
        target: Option<ParticipantId>,
        input: LinkInput,
    ) {
        let Some(sender) = sender_id else {
            warn!("handshake envelope without senderId ignored");
            return;
        };
        if let (Some(target), Some(own)) = (target.as_deref(), self.self_id.as_deref()) {
            if target != own {
                debug!(%sender, %target, "handshake for another participant ignored");
                return;
            }
        }
        if self.self_id.as_deref() == Some(sender.as_str()) {
            return;
        }
        let Some(link) = self.ensure_link(&sender) else {
            debug!(%sender, "handshake before identity assigned, ignored");
            return;
        };
        if !link.send(input) {
            debug!(%sender, "link no longer running, handshake dropped");
        }
    }

    /// Link for `peer`, spawned in `Idle` on first contact.
    fn ensure_link(&mut self, peer: &str) -> Option<&LinkHandle> {
        let local_id = self.self_id.clone()?;
        if !self.links.contains_key(peer) {
            debug!(%peer, "creating link");
            let ctx = LinkContext {
                local_id,
                factory: Arc::clone(&self.factory),
                media: self.media.clone(),
                settings: self.settings.clone(),
                outbox: self.outbox.clone(),
                events: self.events.clone(),
            };
            self.links.insert(peer.to_string(), LinkHandle::spawn(peer, &ctx));
        }
        self.links.get(peer)
    }

    /// Cancel every link and forget the roster after the relay connection drops.
    ///
    /// Identity and chat history survive so the next connection can resume.
    pub fn teardown(&mut self) {
        for (_, link) in self.links.drain() {
            link.abort();
        }
        self.roster.clear();
    }

    fn emit(&self, event: ClientEvent) {
        if self.events.send(event).is_err() {
            debug!("client event dropped: no active subscribers");
        }
    }
}
