//! Per-peer offer/answer state machine.
//!
//! One [`NegotiationLink`] exists for every remote participant. The side with the
//! lexicographically smaller id is the [`Role::Initiator`] and sends the offer;
//! the other side answers. Candidates that arrive before the remote description
//! is applied are buffered and flushed in receipt order.
//!
//! Every offer carries a `round` (the offering engine's generation) inside its
//! payload and the answer echoes it, so an answer to a superseded offer is
//! recognised and dropped instead of being applied to the current one.

use crate::engine::{
    ConnectivityState, EngineError, EngineEvent, EngineFactory, EventSink, IceCandidate,
    LocalMedia, MediaEngine, SdpKind, SessionDescription, TaggedEvent,
};
use huddle_common::{Envelope, ParticipantId};
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Payload field tying an answer to the offer it responds to.
pub const ROUND: &str = "round";

/// Which side of the pair sends the offer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Sends the offer.
    Initiator,
    /// Waits for the offer and answers it.
    Responder,
}

/// Role of `local` towards `peer`: the smaller id initiates.
#[must_use]
pub fn role_for(local: &str, peer: &str) -> Role {
    if local < peer {
        Role::Initiator
    } else {
        Role::Responder
    }
}

/// Negotiation progress for one peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Nothing exchanged yet.
    Idle,
    /// Local offer sent, waiting for the answer.
    OfferSent,
    /// Remote offer being applied.
    OfferReceived,
    /// Both descriptions applied, waiting for connectivity.
    AnswerExchanged,
    /// A usable media path exists.
    Established,
    /// The attempt failed and awaits a reset.
    Failed,
}

/// Handshake output that must reach the peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Signal {
    /// Local offer and its round.
    Offer(SessionDescription, u64),
    /// Local answer, echoing the round of the offer it answers.
    Answer(SessionDescription, Option<u64>),
    /// Local connectivity candidate.
    Candidate(IceCandidate),
}

impl Signal {
    /// Envelope addressed to `target`.
    #[must_use]
    pub fn into_envelope(self, target: &str) -> Envelope {
        let target = Some(target.to_string());
        match self {
            Self::Offer(desc, round) => Envelope::Offer {
                offer: with_round(desc.to_value(), Some(round)),
                sender_id: None,
                target,
            },
            Self::Answer(desc, round) => Envelope::Answer {
                answer: with_round(desc.to_value(), round),
                sender_id: None,
                target,
            },
            Self::Candidate(candidate) => Envelope::IceCandidate {
                candidate: candidate.to_value(),
                sender_id: None,
                target,
            },
        }
    }
}

fn with_round(mut value: Value, round: Option<u64>) -> Value {
    if let (Some(round), Value::Object(map)) = (round, &mut value) {
        map.insert(ROUND.to_string(), Value::from(round));
    }
    value
}

/// Round an `offer` or `answer` payload belongs to, if the sender tagged it.
#[must_use]
pub fn round_of(payload: &Value) -> Option<u64> {
    payload.get(ROUND).and_then(Value::as_u64)
}

/// Observable outcome of driving a link one step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Step {
    /// Send this to the peer.
    Send(Signal),
    /// The media path just became usable.
    Established,
    /// The peer's media arrived.
    RemoteTrack(String),
}

/// Reasons a negotiation attempt fails.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum NegotiationError {
    /// A handshake message that makes no sense in the current phase.
    #[error("unexpected {message} in phase {phase:?}")]
    Contradictory {
        /// Kind of message received.
        message: &'static str,
        /// Phase it arrived in.
        phase: Phase,
    },
    /// A handshake payload that could not be decoded.
    #[error("malformed {message}: {reason}")]
    Malformed {
        /// Kind of message received.
        message: &'static str,
        /// Decoder error.
        reason: String,
    },
    /// The engine refused an operation.
    #[error(transparent)]
    Engine(#[from] EngineError),
    /// The engine reported a broken path.
    #[error("connectivity {0:?}")]
    Connectivity(ConnectivityState),
    /// No usable path within the negotiation deadline.
    #[error("negotiation timed out")]
    Timeout,
}

/// Decode an `offer` or `answer` payload, checking its declared kind.
///
/// # Errors
///
/// Returns [`NegotiationError::Malformed`] when the payload does not decode or
/// declares the other kind.
pub fn decode_description(
    expected: SdpKind,
    value: Value,
) -> Result<SessionDescription, NegotiationError> {
    let message = match expected {
        SdpKind::Offer => "offer",
        SdpKind::Answer => "answer",
    };
    let desc: SessionDescription =
        serde_json::from_value(value).map_err(|e| NegotiationError::Malformed {
            message,
            reason: e.to_string(),
        })?;
    if desc.kind != expected {
        return Err(NegotiationError::Malformed {
            message,
            reason: format!("description declares type {:?}", desc.kind),
        });
    }
    Ok(desc)
}

/// Decode an `ice-candidate` payload.
///
/// # Errors
///
/// Returns [`NegotiationError::Malformed`] when the payload does not decode.
pub fn decode_candidate(value: Value) -> Result<IceCandidate, NegotiationError> {
    serde_json::from_value(value).map_err(|e| NegotiationError::Malformed {
        message: "ice-candidate",
        reason: e.to_string(),
    })
}

/// Negotiation state for one remote participant, owning that peer's engine.
pub struct NegotiationLink {
    peer_id: ParticipantId,
    role: Role,
    phase: Phase,
    pending_candidates: VecDeque<IceCandidate>,
    remote_applied: bool,
    attempts: u32,
    generation: u64,
    engine: Box<dyn MediaEngine>,
    factory: Arc<dyn EngineFactory>,
    events: mpsc::UnboundedSender<TaggedEvent>,
    media: LocalMedia,
}

impl std::fmt::Debug for NegotiationLink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NegotiationLink")
            .field("peer_id", &self.peer_id)
            .field("role", &self.role)
            .field("phase", &self.phase)
            .field("pending_candidates", &self.pending_candidates.len())
            .field("attempts", &self.attempts)
            .field("generation", &self.generation)
            .finish_non_exhaustive()
    }
}

impl NegotiationLink {
    /// Idle link from `local_id` to `peer_id` with a first engine from `factory`.
    #[must_use]
    pub fn new(
        local_id: &str,
        peer_id: &str,
        factory: Arc<dyn EngineFactory>,
        media: LocalMedia,
        events: mpsc::UnboundedSender<TaggedEvent>,
    ) -> Self {
        let generation = 1;
        let engine = factory.create(peer_id, EventSink::new(generation, events.clone()));
        Self {
            peer_id: peer_id.to_string(),
            role: role_for(local_id, peer_id),
            phase: Phase::Idle,
            pending_candidates: VecDeque::new(),
            remote_applied: false,
            attempts: 0,
            generation,
            engine,
            factory,
            events,
            media,
        }
    }

    /// Remote participant this link negotiates with.
    #[must_use]
    pub fn peer_id(&self) -> &str {
        &self.peer_id
    }

    /// Local role in this pair.
    #[must_use]
    pub const fn role(&self) -> Role {
        self.role
    }

    /// Current phase.
    #[must_use]
    pub const fn phase(&self) -> Phase {
        self.phase
    }

    /// Consecutive failed attempts since the last established path.
    #[must_use]
    pub const fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Generation of the current engine.
    #[must_use]
    pub const fn generation(&self) -> u64 {
        self.generation
    }

    /// Candidates waiting for the remote description.
    #[must_use]
    pub fn buffered_candidates(&self) -> usize {
        self.pending_candidates.len()
    }

    /// Attach local tracks to the current engine.
    ///
    /// # Errors
    ///
    /// Propagates the engine's refusal.
    pub async fn attach_media(&mut self) -> Result<(), NegotiationError> {
        self.engine.attach_tracks(&self.media).await?;
        Ok(())
    }

    /// Send the offer if this side initiates and nothing is in flight.
    ///
    /// # Errors
    ///
    /// Propagates engine failures while creating or applying the offer.
    pub async fn start(&mut self) -> Result<Option<Step>, NegotiationError> {
        if self.role != Role::Initiator || self.phase != Phase::Idle {
            return Ok(None);
        }
        let offer = self.engine.create_offer().await?;
        self.engine.set_local_description(offer.clone()).await?;
        self.phase = Phase::OfferSent;
        debug!(peer = %self.peer_id, generation = self.generation, "offer created");
        Ok(Some(Step::Send(Signal::Offer(offer, self.generation))))
    }

    /// Apply a remote offer and produce the answer, echoing the offer's `round`.
    ///
    /// # Errors
    ///
    /// [`NegotiationError::Contradictory`] when our own offer is outstanding,
    /// otherwise engine failures.
    pub async fn on_offer(
        &mut self,
        offer: SessionDescription,
        round: Option<u64>,
    ) -> Result<Step, NegotiationError> {
        match self.phase {
            Phase::Idle => {}
            Phase::OfferSent if self.role == Role::Initiator => {
                return Err(NegotiationError::Contradictory {
                    message: "offer",
                    phase: self.phase,
                });
            }
            phase => {
                info!(peer = %self.peer_id, ?phase, "renegotiation requested by peer");
                self.reset().await?;
            }
        }

        self.phase = Phase::OfferReceived;
        self.engine.set_remote_description(offer).await?;
        self.remote_applied = true;
        self.flush_candidates().await;

        let answer = self.engine.create_answer().await?;
        self.engine.set_local_description(answer.clone()).await?;
        self.phase = Phase::AnswerExchanged;
        Ok(Step::Send(Signal::Answer(answer, round)))
    }

    /// Apply the answer to our outstanding offer.
    ///
    /// An answer tagged with another offer's round is late and is ignored.
    /// An untagged answer is taken to answer the current offer.
    ///
    /// # Errors
    ///
    /// [`NegotiationError::Contradictory`] when no offer is outstanding,
    /// otherwise engine failures.
    pub async fn on_answer(
        &mut self,
        answer: SessionDescription,
        round: Option<u64>,
    ) -> Result<(), NegotiationError> {
        if let Some(round) = round.filter(|r| *r != self.generation) {
            debug!(
                peer = %self.peer_id,
                round,
                current = self.generation,
                "ignoring answer to a superseded offer"
            );
            return Ok(());
        }
        if self.phase != Phase::OfferSent {
            return Err(NegotiationError::Contradictory {
                message: "answer",
                phase: self.phase,
            });
        }
        self.engine.set_remote_description(answer).await?;
        self.remote_applied = true;
        self.phase = Phase::AnswerExchanged;
        self.flush_candidates().await;
        Ok(())
    }

    /// Apply a remote candidate, or buffer it until the remote description lands.
    pub async fn on_candidate(&mut self, candidate: IceCandidate) {
        if self.remote_applied {
            self.apply_candidate(candidate).await;
        } else {
            self.pending_candidates.push_back(candidate);
            debug!(
                peer = %self.peer_id,
                buffered = self.pending_candidates.len(),
                "candidate buffered until remote description"
            );
        }
    }

    async fn apply_candidate(&mut self, candidate: IceCandidate) {
        if let Err(e) = self.engine.add_remote_candidate(candidate).await {
            warn!(peer = %self.peer_id, error = %e, "remote candidate skipped");
        }
    }

    async fn flush_candidates(&mut self) {
        while let Some(candidate) = self.pending_candidates.pop_front() {
            self.apply_candidate(candidate).await;
        }
    }

    /// React to an engine callback. Events from a replaced engine are ignored.
    ///
    /// # Errors
    ///
    /// [`NegotiationError::Connectivity`] when the engine reports a broken path.
    pub fn on_engine_event(
        &mut self,
        generation: u64,
        event: EngineEvent,
    ) -> Result<Option<Step>, NegotiationError> {
        if generation != self.generation {
            debug!(
                peer = %self.peer_id,
                stale = generation,
                current = self.generation,
                "ignoring event from replaced engine"
            );
            return Ok(None);
        }
        match event {
            EngineEvent::LocalCandidate(candidate) => {
                Ok(Some(Step::Send(Signal::Candidate(candidate))))
            }
            EngineEvent::RemoteTrack { track_id } => Ok(Some(Step::RemoteTrack(track_id))),
            EngineEvent::ConnectivityChanged(state) if state.is_usable() => {
                if self.phase == Phase::Established {
                    return Ok(None);
                }
                self.phase = Phase::Established;
                self.attempts = 0;
                info!(peer = %self.peer_id, "media path established");
                Ok(Some(Step::Established))
            }
            EngineEvent::ConnectivityChanged(state) if state.is_failure() => {
                Err(NegotiationError::Connectivity(state))
            }
            EngineEvent::ConnectivityChanged(state) => {
                debug!(peer = %self.peer_id, ?state, "connectivity progress");
                Ok(None)
            }
        }
    }

    /// Record a failed attempt. Returns the consecutive failure count.
    pub fn fail(&mut self, error: &NegotiationError) -> u32 {
        self.phase = Phase::Failed;
        self.attempts = self.attempts.saturating_add(1);
        warn!(peer = %self.peer_id, attempts = self.attempts, error = %error, "negotiation failed");
        self.attempts
    }

    /// Drop the current engine and start over from `Idle` with a fresh one.
    ///
    /// # Errors
    ///
    /// Propagates a refusal to attach local tracks to the new engine.
    pub async fn reset(&mut self) -> Result<(), NegotiationError> {
        self.engine.close().await;
        self.generation += 1;
        self.engine = self.factory.create(
            &self.peer_id,
            EventSink::new(self.generation, self.events.clone()),
        );
        self.pending_candidates.clear();
        self.remote_applied = false;
        self.phase = Phase::Idle;
        self.attach_media().await
    }

    /// Detach local media and release the engine.
    pub async fn close(&mut self) {
        if let Err(e) = self.engine.detach_tracks().await {
            debug!(peer = %self.peer_id, error = %e, "detach on close failed");
        }
        self.engine.close().await;
    }
}


#[cfg(test)]
mod proptests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        #[test]
        fn exactly_one_side_initiates(a in "[a-z0-9-]{1,36}", b in "[a-z0-9-]{1,36}") {
            prop_assume!(a != b);
            let roles = (role_for(&a, &b), role_for(&b, &a));
            prop_assert!(matches!(
                roles,
                (Role::Initiator, Role::Responder) | (Role::Responder, Role::Initiator)
            ));
        }
    }
}
