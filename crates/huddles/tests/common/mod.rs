#![allow(dead_code)]

use futures_util::{SinkExt, StreamExt};
use huddle_common::{Envelope, ParticipantInfo};
use huddles::config::ServerConfig;
use huddles::server::ServerState;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio_tungstenite::tungstenite::Message;

type ClientStream =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

pub fn test_config(listen: SocketAddr) -> ServerConfig {
    ServerConfig {
        listen,
        metrics_addr: "127.0.0.1:0".parse().unwrap(),
        max_conns: 1000,
        grace_period_ms: 5_000,
        msg_rate: 600,
        bw_rate: 4_194_304,
        max_message_size: 65_536,
        ping_interval: 30,
        idle_timeout: 120,
        outbound_queue: 256,
    }
}

pub struct TestClient {
    pub ws_tx: futures_util::stream::SplitSink<ClientStream, Message>,
    pub ws_rx: futures_util::stream::SplitStream<ClientStream>,
    pub id: String,
    pub session_token: String,
    pub roster: Vec<ParticipantInfo>,
}

impl TestClient {
    pub async fn connect(addr: &SocketAddr) -> Self {
        Self::connect_with_query(addr, "").await
    }

    pub async fn resume(addr: &SocketAddr, token: &str) -> Self {
        Self::connect_with_query(addr, &format!("?resume={token}")).await
    }

    /// Connect and consume the initial `participant-list`.
    pub async fn connect_with_query(addr: &SocketAddr, query: &str) -> Self {
        let url = format!("ws://{addr}/{query}");
        let (ws, _) = tokio_tungstenite::connect_async(url).await.unwrap();
        let (ws_tx, ws_rx) = ws.split();
        let mut client = Self {
            ws_tx,
            ws_rx,
            id: String::new(),
            session_token: String::new(),
            roster: Vec::new(),
        };

        match client.recv_envelope().await {
            Envelope::ParticipantList {
                participants,
                self_id,
                session_token,
            } => {
                client.id = self_id.expect("participant-list carries selfId");
                client.session_token = session_token.expect("participant-list carries token");
                client.roster = participants;
            }
            other => panic!("expected participant-list first, got {other:?}"),
        }
        client
    }

    pub async fn send_json(&mut self, value: serde_json::Value) {
        self.send_text(value.to_string()).await;
    }

    pub async fn send_text(&mut self, text: String) {
        self.ws_tx.send(Message::Text(text)).await.unwrap();
    }

    /// Next text frame as raw JSON, skipping control frames.
    pub async fn recv_raw(&mut self) -> serde_json::Value {
        loop {
            let msg = tokio::time::timeout(Duration::from_secs(5), self.ws_rx.next())
                .await
                .expect("timeout waiting for message")
                .unwrap()
                .unwrap();
            match msg {
                Message::Text(text) => return serde_json::from_str(&text).unwrap(),
                Message::Ping(_) | Message::Pong(_) => {}
                other => panic!("expected text frame, got {other:?}"),
            }
        }
    }

    pub async fn recv_envelope(&mut self) -> Envelope {
        let raw = self.recv_raw().await;
        Envelope::decode(&raw.to_string()).unwrap()
    }

    /// Assert nothing but control frames arrives within `window`.
    pub async fn expect_silence(&mut self, window: Duration) {
        let deadline = tokio::time::Instant::now() + window;
        loop {
            match tokio::time::timeout_at(deadline, self.ws_rx.next()).await {
                Err(_) => return,
                Ok(Some(Ok(Message::Ping(_) | Message::Pong(_)))) => {}
                Ok(other) => panic!("expected silence, got {other:?}"),
            }
        }
    }

    /// Whether the server has closed this connection within `window`.
    pub async fn closed_within(&mut self, window: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + window;
        loop {
            match tokio::time::timeout_at(deadline, self.ws_rx.next()).await {
                Err(_) => return false,
                Ok(None | Some(Ok(Message::Close(_))) | Some(Err(_))) => return true,
                Ok(Some(Ok(_))) => {}
            }
        }
    }

    pub async fn close(mut self) {
        let _ = self.ws_tx.send(Message::Close(None)).await;
        let _ = self.ws_tx.close().await;
    }
}

pub async fn start_server_with(config_fn: impl FnOnce(&mut ServerConfig)) -> (SocketAddr, Arc<ServerState>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let mut config = test_config(addr);
    config_fn(&mut config);
    let state = Arc::new(ServerState::new(config));

    let state_clone = state.clone();
    tokio::spawn(async move {
        if let Err(e) = huddles::run(listener, state_clone).await {
            eprintln!("server error in test: {e}");
        }
    });

    tokio::time::sleep(Duration::from_millis(50)).await;

    (addr, state)
}

pub async fn start_server() -> (SocketAddr, Arc<ServerState>) {
    start_server_with(|_| {}).await
}

pub async fn start_server_with_grace(grace_ms: u64) -> (SocketAddr, Arc<ServerState>) {
    start_server_with(|c| c.grace_period_ms = grace_ms).await
}
