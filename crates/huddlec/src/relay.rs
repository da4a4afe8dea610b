use crate::backoff::ExponentialBackoff;
use crate::config::ClientConfig;
use crate::dispatch::{ClientEvent, Session};
use crate::engine::{EngineFactory, LocalMedia};
use crate::link::LinkSettings;
use futures_util::{Sink, SinkExt, StreamExt};
use huddle_common::types::query;
use huddle_common::{Envelope, ParticipantInfo};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, info, warn};

/// Why a relay connection ended.
#[derive(Debug, Error)]
pub enum ConnectError {
    /// Retrying cannot help, e.g. an unusable relay URL.
    #[error("fatal relay error: {0}")]
    Fatal(anyhow::Error),
    /// The connection dropped or could not be opened; retry with backoff.
    #[error("relay connection lost: {0}")]
    Transient(anyhow::Error),
}

/// Connection status of the relay WebSocket link.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnStatus {
    /// Not connected to the relay.
    Disconnected,
    /// WebSocket connection in progress.
    Connecting,
    /// Connected and exchanging envelopes.
    Connected,
}

/// Requests from the presentation layer.
#[derive(Debug)]
enum Command {
    Chat(String),
    Leave,
}

/// Handle to a running client.
#[derive(Debug)]
pub struct Client {
    commands: mpsc::Sender<Command>,
    events: broadcast::Sender<ClientEvent>,
    status: watch::Receiver<ConnStatus>,
    roster: watch::Receiver<Vec<ParticipantInfo>>,
    task: JoinHandle<()>,
}

impl Client {
    /// Start the relay connection manager. The returned receiver sees every event
    /// from the first connection on.
    #[must_use]
    pub fn spawn(
        config: Arc<ClientConfig>,
        factory: Arc<dyn EngineFactory>,
        media: LocalMedia,
    ) -> (Self, broadcast::Receiver<ClientEvent>) {
        let (commands, command_rx) = mpsc::channel(64);
        let (events, events_rx) = broadcast::channel(256);
        let (status_tx, status) = watch::channel(ConnStatus::Disconnected);
        let (roster_tx, roster) = watch::channel(Vec::new());
        let task = tokio::spawn(relay_connection_manager(
            config,
            factory,
            media,
            command_rx,
            events.clone(),
            Published {
                status: status_tx,
                roster: roster_tx,
            },
        ));
        (
            Self {
                commands,
                events,
                status,
                roster,
                task,
            },
            events_rx,
        )
    }

    /// Another subscription to client events.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<ClientEvent> {
        self.events.subscribe()
    }

    /// Watch the relay connection status.
    #[must_use]
    pub fn status(&self) -> watch::Receiver<ConnStatus> {
        self.status.clone()
    }

    /// Other connected participants as the session currently sees them, ordered by id.
    #[must_use]
    pub fn roster(&self) -> Vec<ParticipantInfo> {
        self.roster.borrow().clone()
    }

    /// Send a chat line to everyone else in the room. Lines sent while the relay
    /// is unreachable go out after the next reconnect.
    ///
    /// # Errors
    ///
    /// Returns an error if the client has stopped.
    pub async fn send_chat(&self, text: impl Into<String>) -> anyhow::Result<()> {
        self.commands
            .send(Command::Chat(text.into()))
            .await
            .map_err(|_| anyhow::anyhow!("client has stopped"))
    }

    /// Leave the room and wait for the connection manager to finish.
    pub async fn leave(self) {
        let _ = self.commands.send(Command::Leave).await;
        if let Err(e) = self.task.await {
            debug!(error = %e, "connection manager ended abnormally");
        }
    }
}

/// Relay URL with the resume token and requested name attached.
fn connect_url(config: &ClientConfig, token: Option<&str>) -> anyhow::Result<url::Url> {
    let mut url = url::Url::parse(&config.relay)?;
    {
        let mut pairs = url.query_pairs_mut();
        if let Some(token) = token {
            pairs.append_pair(query::RESUME, token);
        }
        if let Some(name) = config.name.as_deref() {
            pairs.append_pair(query::NAME, name);
        }
    }
    if url.query() == Some("") {
        url.set_query(None);
    }
    Ok(url)
}

/// Watch channels the connection manager keeps current.
struct Published {
    status: watch::Sender<ConnStatus>,
    roster: watch::Sender<Vec<ParticipantInfo>>,
}

impl Published {
    fn roster_from(&self, session: &Session) {
        self.roster.send_if_modified(|shown| {
            let current = session.roster();
            if *shown == current {
                false
            } else {
                *shown = current;
                true
            }
        });
    }
}

/// Top-level relay connection loop with automatic reconnection and backoff.
async fn relay_connection_manager(
    config: Arc<ClientConfig>,
    factory: Arc<dyn EngineFactory>,
    media: LocalMedia,
    mut commands: mpsc::Receiver<Command>,
    events: broadcast::Sender<ClientEvent>,
    published: Published,
) {
    let status_tx = &published.status;
    let (signal_tx, mut signal_rx) = mpsc::channel::<Envelope>(256);
    let mut session = Session::new(
        factory,
        media,
        LinkSettings::from(&config.negotiation),
        signal_tx,
        events,
    );
    let mut pending_chat: VecDeque<String> = VecDeque::new();

    let mut backoff = ExponentialBackoff::new(
        Duration::from_millis(config.reconnect.initial_delay_ms),
        Duration::from_millis(config.reconnect.max_delay_ms),
        config.reconnect.backoff_factor,
    );

    'reconnect: loop {
        status_tx.send_replace(ConnStatus::Connecting);

        let result = connect_and_run(
            &config,
            &mut session,
            &mut commands,
            &mut signal_rx,
            &published,
            &mut pending_chat,
        )
        .await;

        session.teardown();
        published.roster_from(&session);
        while signal_rx.try_recv().is_ok() {}

        match result {
            Ok(()) => {
                info!("left the room");
                status_tx.send_replace(ConnStatus::Disconnected);
                break;
            }
            Err(ConnectError::Fatal(e)) => {
                error!(error = %e, "fatal relay error, not retrying");
                status_tx.send_replace(ConnStatus::Disconnected);
                break;
            }
            Err(ConnectError::Transient(e)) => {
                let was_connected = *status_tx.borrow() == ConnStatus::Connected;
                warn!(error = %e, "relay connection lost");
                status_tx.send_replace(ConnStatus::Disconnected);
                if was_connected {
                    backoff.reset();
                }
            }
        }

        let delay = backoff.next_delay();
        info!(
            attempt = backoff.attempts(),
            delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
            "reconnecting"
        );
        let wake = tokio::time::sleep(delay);
        tokio::pin!(wake);
        loop {
            tokio::select! {
                () = &mut wake => break,
                cmd = commands.recv() => match cmd {
                    Some(Command::Chat(text)) => pending_chat.push_back(text),
                    Some(Command::Leave) | None => {
                        info!("left the room while disconnected");
                        break 'reconnect;
                    }
                },
            }
        }
    }
}

fn chat_frame(text: &str) -> Message {
    let chat = Envelope::Chat {
        text: text.to_string(),
        sender: None,
        sender_id: None,
    };
    Message::Text(chat.to_json())
}

/// Send queued chat lines in order. A line whose send fails stays at the front
/// of the queue for the next connection.
async fn flush_pending_chat<S>(
    ws_tx: &mut S,
    pending: &mut VecDeque<String>,
) -> Result<(), S::Error>
where
    S: Sink<Message> + Unpin,
{
    while let Some(text) = pending.front() {
        ws_tx.send(chat_frame(text)).await?;
        pending.pop_front();
    }
    Ok(())
}

async fn connect_and_run(
    config: &ClientConfig,
    session: &mut Session,
    commands: &mut mpsc::Receiver<Command>,
    signals: &mut mpsc::Receiver<Envelope>,
    published: &Published,
    pending_chat: &mut VecDeque<String>,
) -> Result<(), ConnectError> {
    let url = connect_url(config, session.session_token()).map_err(ConnectError::Fatal)?;
    let resuming = session.session_token().is_some();
    let (ws, _) = tokio_tungstenite::connect_async(url.as_str())
        .await
        .map_err(|e| ConnectError::Transient(e.into()))?;
    let (mut ws_tx, mut ws_rx) = ws.split();

    published.status.send_replace(ConnStatus::Connected);
    info!(relay = %config.relay, resuming, "connected to relay");

    flush_pending_chat(&mut ws_tx, pending_chat)
        .await
        .map_err(|e| ConnectError::Transient(e.into()))?;

    let mut ping_interval = tokio::time::interval(Duration::from_secs(config.keepalive.interval_s));

    loop {
        tokio::select! {
            msg = ws_rx.next() => {
                let msg = msg
                    .ok_or_else(|| ConnectError::Transient(anyhow::anyhow!("connection closed")))
                    .and_then(|r| r.map_err(|e| ConnectError::Transient(e.into())))?;
                match msg {
                    Message::Text(text) => {
                        session.handle_text(&text);
                        published.roster_from(&session);
                    }
                    Message::Ping(data) => {
                        ws_tx.send(Message::Pong(data)).await
                            .map_err(|e| ConnectError::Transient(e.into()))?;
                    }
                    Message::Close(_) => {
                        return Err(ConnectError::Transient(anyhow::anyhow!("relay closed the connection")));
                    }
                    _ => {}
                }
            }

            command = commands.recv() => {
                match command {
                    Some(Command::Chat(text)) => {
                        pending_chat.push_back(text);
                        flush_pending_chat(&mut ws_tx, pending_chat)
                            .await
                            .map_err(|e| ConnectError::Transient(e.into()))?;
                    }
                    Some(Command::Leave) | None => {
                        let _ = ws_tx.send(Message::Close(None)).await;
                        return Ok(());
                    }
                }
            }

            Some(envelope) = signals.recv() => {
                debug!(kind = %envelope.kind(), "sending handshake");
                ws_tx.send(Message::Text(envelope.to_json())).await
                    .map_err(|e| ConnectError::Transient(e.into()))?;
            }

            _ = ping_interval.tick() => {
                ws_tx.send(Message::Ping(vec![])).await
                    .map_err(|e| ConnectError::Transient(e.into()))?;
            }
        }
    }
}
