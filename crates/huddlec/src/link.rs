use crate::backoff::ExponentialBackoff;
use crate::config::NegotiationConfig;
use crate::dispatch::ClientEvent;
use crate::engine::{EngineFactory, LocalMedia, SdpKind, TaggedEvent};
use crate::negotiation::{
    decode_candidate, decode_description, round_of, NegotiationError, NegotiationLink, Phase,
    Step,
};
use huddle_common::{Envelope, ParticipantId};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Link health as shown to the presentation layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    /// A usable media path exists.
    Established,
    /// An attempt failed; another will follow.
    Failed,
    /// Attempts exhausted; the link stays down.
    Lost,
}

/// Handshake payload routed to a link, still undecoded.
#[derive(Debug, Clone)]
pub enum LinkInput {
    /// Remote `offer` payload.
    Offer(Value),
    /// Remote `answer` payload.
    Answer(Value),
    /// Remote `ice-candidate` payload.
    Candidate(Value),
}

/// Retry policy applied by a link task.
#[derive(Debug, Clone)]
pub struct LinkSettings {
    /// Consecutive failures before the link is lost.
    pub max_attempts: u32,
    /// First renegotiation delay.
    pub initial_delay: Duration,
    /// Cap on the renegotiation delay.
    pub max_delay: Duration,
    /// Deadline for one negotiation to reach an established path.
    pub timeout: Duration,
}

impl From<&NegotiationConfig> for LinkSettings {
    fn from(config: &NegotiationConfig) -> Self {
        Self {
            max_attempts: config.max_attempts,
            initial_delay: Duration::from_millis(config.initial_delay_ms),
            max_delay: Duration::from_millis(config.max_delay_ms),
            timeout: config.timeout(),
        }
    }
}

/// Everything a link task needs besides its inputs.
pub struct LinkContext {
    /// Local participant id.
    pub local_id: ParticipantId,
    /// Builds engines.
    pub factory: Arc<dyn EngineFactory>,
    /// Local tracks to attach to each engine.
    pub media: LocalMedia,
    /// Retry policy.
    pub settings: LinkSettings,
    /// Envelopes bound for the relay.
    pub outbox: mpsc::Sender<Envelope>,
    /// Presentation events.
    pub events: broadcast::Sender<ClientEvent>,
}

/// Owner's side of a running link task.
#[derive(Debug)]
pub struct LinkHandle {
    inputs: mpsc::UnboundedSender<LinkInput>,
    task: JoinHandle<()>,
}

impl LinkHandle {
    /// Spawn the task negotiating with `peer_id`.
    #[must_use]
    pub fn spawn(peer_id: &str, ctx: &LinkContext) -> Self {
        let (inputs, input_rx) = mpsc::unbounded_channel();
        let (engine_tx, engine_rx) = mpsc::unbounded_channel();
        let link = NegotiationLink::new(
            &ctx.local_id,
            peer_id,
            Arc::clone(&ctx.factory),
            ctx.media.clone(),
            engine_tx,
        );
        let runner = LinkRunner {
            backoff: ExponentialBackoff::new(
                ctx.settings.initial_delay,
                ctx.settings.max_delay,
                2.0,
            ),
            settings: ctx.settings.clone(),
            outbox: ctx.outbox.clone(),
            events: ctx.events.clone(),
            deadline: None,
            retry_at: None,
        };
        let task = tokio::spawn(runner.run(link, input_rx, engine_rx));
        Self { inputs, task }
    }

    /// Queue a handshake payload. Returns `false` if the task has ended.
    pub fn send(&self, input: LinkInput) -> bool {
        self.inputs.send(input).is_ok()
    }

    /// Whether the task has ended, either lost or aborted.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Cancel the task immediately.
    pub fn abort(&self) {
        self.task.abort();
    }
}

/// Why a link task stopped.
enum Exit {
    Closed,
    Lost,
}

struct LinkRunner {
    backoff: ExponentialBackoff,
    settings: LinkSettings,
    outbox: mpsc::Sender<Envelope>,
    events: broadcast::Sender<ClientEvent>,
    deadline: Option<Instant>,
    retry_at: Option<Instant>,
}

async fn sleep_until_opt(at: Option<Instant>) {
    match at {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

impl LinkRunner {
    async fn run(
        mut self,
        mut link: NegotiationLink,
        mut inputs: mpsc::UnboundedReceiver<LinkInput>,
        mut engine_rx: mpsc::UnboundedReceiver<TaggedEvent>,
    ) {
        let peer = link.peer_id().to_string();
        debug!(%peer, role = ?link.role(), "link started");

        let first = match link.attach_media().await {
            Ok(()) => link.start().await,
            Err(e) => Err(e),
        };
        let mut exit = self.settle(&mut link, first.map(|s| s.into_iter().collect())).await;

        while exit.is_none() {
            let outcome = tokio::select! {
                input = inputs.recv() => match input {
                    Some(input) => handle_input(&mut link, input).await,
                    None => {
                        exit = Some(Exit::Closed);
                        break;
                    }
                },
                Some((generation, event)) = engine_rx.recv() => {
                    link.on_engine_event(generation, event).map(|s| s.into_iter().collect())
                }
                () = sleep_until_opt(self.deadline) => {
                    self.deadline = None;
                    Err(NegotiationError::Timeout)
                }
                () = sleep_until_opt(self.retry_at) => {
                    self.retry_at = None;
                    debug!(%peer, attempt = link.attempts() + 1, "renegotiating");
                    link.start().await.map(|s| s.into_iter().collect())
                }
            };
            exit = self.settle(&mut link, outcome).await;
        }

        link.close().await;
        if matches!(exit, Some(Exit::Lost)) {
            self.emit(&peer, LinkState::Lost);
        }
        debug!(%peer, "link stopped");
    }

    /// Publish the outcome of one step, handle failure, and re-arm timers.
    async fn settle(
        &mut self,
        link: &mut NegotiationLink,
        outcome: Result<Vec<Step>, NegotiationError>,
    ) -> Option<Exit> {
        match outcome {
            Ok(steps) => {
                for step in steps {
                    self.publish(link.peer_id(), step).await;
                }
            }
            Err(error) => {
                let attempts = link.fail(&error);
                self.emit(link.peer_id(), LinkState::Failed);
                if attempts >= self.settings.max_attempts {
                    warn!(peer = %link.peer_id(), attempts, "giving up on link");
                    return Some(Exit::Lost);
                }
                if let Err(e) = link.reset().await {
                    warn!(peer = %link.peer_id(), error = %e, "engine reset failed");
                    return Some(Exit::Lost);
                }
                self.retry_at = Some(Instant::now() + self.backoff.next_delay());
            }
        }

        match link.phase() {
            Phase::Established => {
                self.backoff.reset();
                self.deadline = None;
                self.retry_at = None;
            }
            Phase::Idle | Phase::Failed => self.deadline = None,
            _ => {
                if self.deadline.is_none() {
                    self.deadline = Some(Instant::now() + self.settings.timeout);
                }
            }
        }
        None
    }

    async fn publish(&self, peer: &str, step: Step) {
        match step {
            Step::Send(signal) => {
                if self.outbox.send(signal.into_envelope(peer)).await.is_err() {
                    debug!(%peer, "relay outbox closed, signal dropped");
                }
            }
            Step::Established => self.emit(peer, LinkState::Established),
            Step::RemoteTrack(track_id) => {
                info!(%peer, %track_id, "remote track arrived");
                let _ = self.events.send(ClientEvent::RemoteTrack {
                    peer: peer.to_string(),
                    track_id,
                });
            }
        }
    }

    fn emit(&self, peer: &str, state: LinkState) {
        if self
            .events
            .send(ClientEvent::Link {
                peer: peer.to_string(),
                state,
            })
            .is_err()
        {
            debug!("link event dropped: no active subscribers");
        }
    }
}

async fn handle_input(
    link: &mut NegotiationLink,
    input: LinkInput,
) -> Result<Vec<Step>, NegotiationError> {
    match input {
        LinkInput::Offer(value) => {
            let round = round_of(&value);
            let offer = decode_description(SdpKind::Offer, value)?;
            Ok(vec![link.on_offer(offer, round).await?])
        }
        LinkInput::Answer(value) => {
            let round = round_of(&value);
            let answer = decode_description(SdpKind::Answer, value)?;
            link.on_answer(answer, round).await?;
            Ok(Vec::new())
        }
        LinkInput::Candidate(value) => {
            let candidate = decode_candidate(value)?;
            link.on_candidate(candidate).await;
            Ok(Vec::new())
        }
    }
}
