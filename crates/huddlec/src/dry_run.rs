use crate::engine::{
    ConnectivityState, EngineError, EngineEvent, EngineFactory, EventSink, IceCandidate,
    LocalMedia, MediaEngine, SdpKind, SessionDescription,
};
use async_trait::async_trait;
use rand::Rng;
use tracing::debug;

/// Engine that fabricates descriptions and candidates without touching media.
///
/// It reports a connected path as soon as both descriptions are applied, which
/// is enough to drive the whole signalling path end to end.
#[derive(Debug)]
pub struct DryRunEngine {
    peer_id: String,
    session: u64,
    events: EventSink,
    local: Option<SessionDescription>,
    remote: Option<SessionDescription>,
    remote_candidates: Vec<IceCandidate>,
    tracks: Vec<String>,
    connected: bool,
    closed: bool,
}

impl DryRunEngine {
    /// Engine for `peer_id` reporting into `events`.
    #[must_use]
    pub fn new(peer_id: &str, events: EventSink) -> Self {
        Self {
            peer_id: peer_id.to_string(),
            session: rand::thread_rng().gen(),
            events,
            local: None,
            remote: None,
            remote_candidates: Vec::new(),
            tracks: Vec::new(),
            connected: false,
            closed: false,
        }
    }

    fn fabricate(&self, kind: SdpKind) -> SessionDescription {
        let mut sdp = format!(
            "v=0\r\no=huddle {} {} IN IP4 127.0.0.1\r\ns=-\r\nt=0 0\r\n",
            self.session,
            self.events.generation()
        );
        for track in &self.tracks {
            sdp.push_str(&format!("a=msid:{track}\r\n"));
        }
        SessionDescription { kind, sdp }
    }

    fn ensure_open(&self) -> Result<(), EngineError> {
        if self.closed {
            Err(EngineError::Closed)
        } else {
            Ok(())
        }
    }

    fn maybe_connect(&mut self) {
        if self.connected || self.local.is_none() || self.remote.is_none() {
            return;
        }
        self.connected = true;
        self.events
            .emit(EngineEvent::ConnectivityChanged(ConnectivityState::Checking));
        self.events
            .emit(EngineEvent::ConnectivityChanged(ConnectivityState::Connected));
        self.events.emit(EngineEvent::RemoteTrack {
            track_id: format!("{}-media", self.peer_id),
        });
    }

    /// Candidates the peer sent, in the order they were applied.
    #[must_use]
    pub fn remote_candidates(&self) -> &[IceCandidate] {
        &self.remote_candidates
    }
}

fn check_sdp(operation: &'static str, desc: &SessionDescription) -> Result<(), EngineError> {
    if desc.sdp.starts_with("v=0") {
        Ok(())
    } else {
        Err(EngineError::Rejected {
            operation,
            reason: "description does not start with v=0".to_string(),
        })
    }
}

#[async_trait]
impl MediaEngine for DryRunEngine {
    async fn create_offer(&mut self) -> Result<SessionDescription, EngineError> {
        self.ensure_open()?;
        Ok(self.fabricate(SdpKind::Offer))
    }

    async fn create_answer(&mut self) -> Result<SessionDescription, EngineError> {
        self.ensure_open()?;
        match &self.remote {
            Some(remote) if remote.kind == SdpKind::Offer => Ok(self.fabricate(SdpKind::Answer)),
            _ => Err(EngineError::Rejected {
                operation: "create_answer",
                reason: "no remote offer applied".to_string(),
            }),
        }
    }

    async fn set_local_description(&mut self, desc: SessionDescription) -> Result<(), EngineError> {
        self.ensure_open()?;
        check_sdp("set_local_description", &desc)?;
        self.local = Some(desc);
        self.events.emit(EngineEvent::LocalCandidate(IceCandidate {
            candidate: format!(
                "candidate:{} 1 udp 2122260223 127.0.0.1 {} typ host",
                self.session % 10_000,
                40_000 + self.session % 20_000
            ),
            sdp_mid: Some("0".to_string()),
            sdp_m_line_index: Some(0),
        }));
        self.maybe_connect();
        Ok(())
    }

    async fn set_remote_description(
        &mut self,
        desc: SessionDescription,
    ) -> Result<(), EngineError> {
        self.ensure_open()?;
        check_sdp("set_remote_description", &desc)?;
        self.remote = Some(desc);
        self.maybe_connect();
        Ok(())
    }

    async fn add_remote_candidate(&mut self, candidate: IceCandidate) -> Result<(), EngineError> {
        self.ensure_open()?;
        if self.remote.is_none() {
            return Err(EngineError::Rejected {
                operation: "add_remote_candidate",
                reason: "no remote description".to_string(),
            });
        }
        if candidate.candidate.is_empty() {
            return Err(EngineError::Rejected {
                operation: "add_remote_candidate",
                reason: "empty candidate".to_string(),
            });
        }
        self.remote_candidates.push(candidate);
        Ok(())
    }

    async fn attach_tracks(&mut self, media: &LocalMedia) -> Result<(), EngineError> {
        self.ensure_open()?;
        self.tracks.clone_from(&media.tracks);
        Ok(())
    }

    async fn detach_tracks(&mut self) -> Result<(), EngineError> {
        self.ensure_open()?;
        self.tracks.clear();
        Ok(())
    }

    async fn close(&mut self) {
        if !self.closed {
            debug!(peer = %self.peer_id, "dry-run engine closed");
            self.closed = true;
        }
    }
}

/// Factory handing out [`DryRunEngine`]s.
#[derive(Debug, Default, Clone, Copy)]
pub struct DryRunFactory;

impl EngineFactory for DryRunFactory {
    fn create(&self, peer_id: &str, events: EventSink) -> Box<dyn MediaEngine> {
        Box::new(DryRunEngine::new(peer_id, events))
    }
}
