//! Participant registry and fanout for a single room.
//!
//! Every mutation and the broadcast that reports it happen under one lock
//! acquisition, so a participant never observes a roster that includes a
//! deleted id or omits one that has already joined.

use crate::metrics::{counters, gauges};
use huddle_common::types::MAX_DISPLAY_NAME_LEN;
use huddle_common::{Envelope, MessageType, ParticipantId, ParticipantInfo, RawEnvelope};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::AbortHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Lifecycle state of a participant as seen by the relay.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Live connection, visible in the roster.
    Connected,
    /// Connection dropped; entry retained until the grace timer fires.
    GracePeriod,
    /// Not in the registry.
    Removed,
}

/// Handle held in the registry, used to queue text frames for a connection.
#[derive(Clone, Debug)]
pub struct ConnHandle {
    /// Channel sender for delivering frames to this connection's task.
    pub tx: mpsc::Sender<String>,
    /// Process-unique id of the transport connection.
    pub conn_id: u64,
}

impl ConnHandle {
    /// Queue a frame without blocking. Delivery to a closed connection is a no-op.
    fn deliver(&self, text: &str) -> bool {
        match self.tx.try_send(text.to_owned()) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                counters::messages_dropped_total("queue_full");
                warn!(conn_id = self.conn_id, "outbound queue full, dropping message");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                counters::messages_dropped_total("closed");
                false
            }
        }
    }
}

/// Result of admitting a connection into the registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Admission {
    /// Participant id, fresh or resumed.
    pub id: ParticipantId,
    /// Display name recorded in the registry.
    pub display_name: String,
    /// Token the client presents to resume this identity.
    pub session_token: String,
    /// Whether an existing entry was resumed.
    pub resumed: bool,
}

#[derive(Debug)]
struct GraceTimer {
    generation: u64,
    abort: AbortHandle,
}

#[derive(Debug)]
struct Participant {
    display_name: String,
    token: String,
    ordinal: u64,
    state: ConnectionState,
    conn: Option<ConnHandle>,
    grace: Option<GraceTimer>,
}

impl Participant {
    fn live_conn(&self) -> Option<&ConnHandle> {
        match self.state {
            ConnectionState::Connected => self.conn.as_ref(),
            _ => None,
        }
    }

    fn owns(&self, conn_id: u64) -> bool {
        self.conn.as_ref().is_some_and(|c| c.conn_id == conn_id)
    }

    fn cancel_grace(&mut self) {
        if let Some(timer) = self.grace.take() {
            timer.abort.abort();
        }
    }
}

#[derive(Debug, Default)]
struct Inner {
    participants: HashMap<ParticipantId, Participant>,
    tokens: HashMap<String, ParticipantId>,
    next_ordinal: u64,
    next_generation: u64,
}

impl Inner {
    fn live_connections(&self) -> impl Iterator<Item = (&str, &ConnHandle)> {
        self.participants
            .iter()
            .filter_map(|(id, p)| p.live_conn().map(|conn| (id.as_str(), conn)))
    }

    fn visible_roster(&self) -> Vec<ParticipantInfo> {
        let mut visible: Vec<(&ParticipantId, &Participant)> = self
            .participants
            .iter()
            .filter(|(_, p)| p.state == ConnectionState::Connected)
            .collect();
        visible.sort_by_key(|(_, p)| p.ordinal);
        visible
            .into_iter()
            .map(|(id, p)| ParticipantInfo {
                id: id.clone(),
                name: p.display_name.clone(),
                is_connected: Some(true),
            })
            .collect()
    }

    fn fresh_id(&self) -> ParticipantId {
        loop {
            let id = Uuid::new_v4().to_string();
            if !self.participants.contains_key(&id) {
                return id;
            }
        }
    }
}

/// Deliver `text` to every live connection except `exclude`.
///
/// Cost is one queue push per recipient. Returns how many connections accepted
/// the frame.
pub fn fanout<'a, I>(live: I, text: &str, exclude: Option<&str>) -> usize
where
    I: IntoIterator<Item = (&'a str, &'a ConnHandle)>,
{
    live.into_iter()
        .filter(|(id, _)| Some(*id) != exclude)
        .filter(|(_, conn)| conn.deliver(text))
        .count()
}

/// Registry of participants for one room, owned by the server state for the
/// lifetime of the process.
#[derive(Debug)]
pub struct Registry {
    inner: Mutex<Inner>,
    grace_period: Duration,
}

impl Registry {
    /// Create an empty registry with the given grace window.
    #[must_use]
    pub fn new(grace_period: Duration) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            grace_period,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Admit a new transport connection.
    ///
    /// A `resume` token naming a retained entry resumes that identity and cancels
    /// its grace timer; anything else creates a fresh participant. The newcomer is
    /// sent the visible roster, then every other live participant is told about it.
    pub fn connect(
        &self,
        conn: ConnHandle,
        resume: Option<&str>,
        requested_name: Option<&str>,
    ) -> Admission {
        let mut inner = self.lock();

        let resumable = resume.and_then(|token| inner.tokens.get(token).cloned());
        let (id, resumed, announce) = match resumable {
            Some(id) => {
                let announce = match inner.participants.get_mut(&id) {
                    Some(p) => {
                        p.cancel_grace();
                        let was_live = p.state == ConnectionState::Connected;
                        if was_live {
                            info!(participant = %id, "session taken over by a new connection");
                        }
                        p.state = ConnectionState::Connected;
                        p.conn = Some(conn.clone());
                        !was_live
                    }
                    None => true,
                };
                counters::joins_total("resumed");
                (id, true, announce)
            }
            None => {
                inner.next_ordinal += 1;
                let ordinal = inner.next_ordinal;
                let id = inner.fresh_id();
                let token = Uuid::new_v4().simple().to_string();
                inner.tokens.insert(token.clone(), id.clone());
                inner.participants.insert(
                    id.clone(),
                    Participant {
                        display_name: display_name_for(requested_name, ordinal),
                        token,
                        ordinal,
                        state: ConnectionState::Connected,
                        conn: Some(conn.clone()),
                        grace: None,
                    },
                );
                counters::joins_total("new");
                (id, false, true)
            }
        };

        let (display_name, session_token) = inner
            .participants
            .get(&id)
            .map(|p| (p.display_name.clone(), p.token.clone()))
            .unwrap_or_default();

        let roster = Envelope::ParticipantList {
            participants: inner.visible_roster(),
            self_id: Some(id.clone()),
            session_token: Some(session_token.clone()),
        };
        conn.deliver(&roster.to_json());

        if announce {
            let joined = Envelope::ParticipantJoined {
                participant: ParticipantInfo {
                    id: id.clone(),
                    name: display_name.clone(),
                    is_connected: None,
                },
            };
            fanout(inner.live_connections(), &joined.to_json(), Some(&id));
        }
        gauges::set_registry_size(inner.participants.len());

        info!(participant = %id, name = %display_name, resumed, "participant connected");
        Admission {
            id,
            display_name,
            session_token,
            resumed,
        }
    }

    /// Relay a validated client envelope from `sender`.
    ///
    /// Stamps `senderId` (and the chat `sender` name), then delivers to the
    /// `target` if one is given, else to every other live participant. Envelopes
    /// from a connection that no longer owns the sender's entry are dropped.
    /// Returns the number of recipients.
    pub fn relay(&self, sender: &str, conn_id: u64, mut envelope: RawEnvelope) -> usize {
        let inner = self.lock();
        let Some(participant) = inner.participants.get(sender) else {
            debug!(participant = sender, "dropping message from unknown participant");
            return 0;
        };
        if participant.state != ConnectionState::Connected || !participant.owns(conn_id) {
            debug!(participant = sender, "dropping message from superseded connection");
            return 0;
        }

        if envelope.kind() == MessageType::Chat {
            envelope.stamp_sender_name(&participant.display_name);
        }
        envelope.stamp_sender_id(sender);
        let text = envelope.to_json();

        let delivered = match envelope.target() {
            Some(target) if target == sender => 0,
            Some(target) => inner
                .participants
                .get(target)
                .and_then(Participant::live_conn)
                .map_or(0, |conn| usize::from(conn.deliver(&text))),
            None => fanout(inner.live_connections(), &text, Some(sender)),
        };

        if delivered == 0 {
            counters::messages_dropped_total("no_recipient");
        } else {
            counters::messages_relayed_total(envelope.kind().as_str());
        }
        delivered
    }

    /// Handle a dropped transport connection.
    ///
    /// Moves the participant to [`ConnectionState::GracePeriod`], tells everyone
    /// else it left, and arms the grace timer. Ignored if `conn_id` no longer owns
    /// the entry (the session was taken over).
    pub fn disconnect(self: &Arc<Self>, id: &str, conn_id: u64) -> bool {
        let mut inner = self.lock();
        inner.next_generation += 1;
        let generation = inner.next_generation;

        let Some(participant) = inner.participants.get_mut(id) else {
            return false;
        };
        if participant.state != ConnectionState::Connected || !participant.owns(conn_id) {
            return false;
        }
        participant.state = ConnectionState::GracePeriod;
        participant.conn = None;

        let registry = Arc::clone(self);
        let owned_id = id.to_string();
        let grace_period = self.grace_period;
        let timer = tokio::spawn(async move {
            tokio::time::sleep(grace_period).await;
            registry.expire(&owned_id, generation);
        });
        participant.grace = Some(GraceTimer {
            generation,
            abort: timer.abort_handle(),
        });

        let left = Envelope::ParticipantLeft {
            participant_id: id.to_string(),
        };
        fanout(inner.live_connections(), &left.to_json(), Some(id));

        info!(
            participant = id,
            grace_ms = u64::try_from(grace_period.as_millis()).unwrap_or(u64::MAX),
            "participant entered grace period"
        );
        true
    }

    /// Remove a participant whose grace window elapsed.
    ///
    /// Does nothing unless the entry is still in the grace period armed with
    /// `generation`.
    pub fn expire(&self, id: &str, generation: u64) -> bool {
        let mut inner = self.lock();
        let expired = inner.participants.get(id).is_some_and(|p| {
            p.state == ConnectionState::GracePeriod
                && p.grace.as_ref().is_some_and(|t| t.generation == generation)
        });
        if !expired {
            return false;
        }
        if let Some(p) = inner.participants.remove(id) {
            inner.tokens.remove(&p.token);
        }
        counters::grace_expired_total();
        gauges::set_registry_size(inner.participants.len());
        info!(participant = id, "grace period elapsed, participant removed");
        true
    }

    /// Current state of `id`; absent entries report [`ConnectionState::Removed`].
    #[must_use]
    pub fn state_of(&self, id: &str) -> ConnectionState {
        self.lock()
            .participants
            .get(id)
            .map_or(ConnectionState::Removed, |p| p.state)
    }

    /// Connected participants in join order.
    #[must_use]
    pub fn visible_roster(&self) -> Vec<ParticipantInfo> {
        self.lock().visible_roster()
    }

    /// Number of retained entries, grace-period ones included.
    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().participants.len()
    }

    /// Returns `true` if no entries are retained.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lock().participants.is_empty()
    }

    /// Drop every entry and cancel every grace timer.
    pub fn clear(&self) {
        let mut inner = self.lock();
        for participant in inner.participants.values_mut() {
            participant.cancel_grace();
        }
        inner.participants.clear();
        inner.tokens.clear();
        gauges::set_registry_size(0);
    }
}

fn display_name_for(requested: Option<&str>, ordinal: u64) -> String {
    match requested.map(str::trim).filter(|name| !name.is_empty()) {
        Some(name) => name.chars().take(MAX_DISPLAY_NAME_LEN).collect(),
        None => format!("User {ordinal}"),
    }
}
