use crate::error::RelayError;
use crate::metrics::{counters, gauges, histograms};
use crate::ratelimit::RateLimiter;
use crate::registry::ConnHandle;
use crate::server::ServerState;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use huddle_common::types::query;
use huddle_common::{Envelope, ProtocolError, RawEnvelope};
use std::net::SocketAddr;
use std::sync::atomic::Ordering;
use std::sync::{Arc, OnceLock};
use std::time::Instant;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::{interval, Duration};
use tokio_tungstenite::tungstenite::http::{Request, Response, Uri};
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, info};

type WsSink = SplitSink<WebSocketStream<TcpStream>, Message>;
type WsRecv = SplitStream<WebSocketStream<TcpStream>>;

/// Query parameters a client may pass on the upgrade request.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
struct ConnectParams {
    resume: Option<String>,
    name: Option<String>,
}

fn connect_params(uri: &Uri) -> ConnectParams {
    let mut params = ConnectParams::default();
    let Some(raw) = uri.query() else {
        return params;
    };
    for (key, value) in url::form_urlencoded::parse(raw.as_bytes()) {
        match key.as_ref() {
            query::RESUME if !value.is_empty() => params.resume = Some(value.into_owned()),
            query::NAME => params.name = Some(value.into_owned()),
            _ => {}
        }
    }
    params
}

/// Identity of an admitted connection inside its own task.
struct Session {
    participant: String,
    conn_id: u64,
}

/// Serve one participant connection from upgrade to disconnect.
pub async fn handle_connection(
    stream: TcpStream,
    peer_addr: SocketAddr,
    state: Arc<ServerState>,
) -> Result<(), RelayError> {
    let ws_config = WebSocketConfig {
        max_message_size: Some(state.config.max_message_size),
        max_frame_size: Some(state.config.max_message_size),
        ..WebSocketConfig::default()
    };

    let params = Arc::new(OnceLock::new());
    let params_cell = params.clone();
    let ws_stream = tokio_tungstenite::accept_hdr_async_with_config(
        stream,
        move |req: &Request<()>, resp: Response<()>| {
            let _ = params_cell.set(connect_params(req.uri()));
            Ok(resp)
        },
        Some(ws_config),
    )
    .await
    .map_err(RelayError::WebSocket)?;
    let params = params.get().cloned().unwrap_or_default();

    let (mut ws_tx, mut ws_rx) = ws_stream.split();
    let (deliver_tx, mut deliver_rx) = mpsc::channel::<String>(state.config.outbound_queue);

    let conn_id = state.next_conn_id.fetch_add(1, Ordering::Relaxed);
    let admission = state.registry.connect(
        ConnHandle {
            tx: deliver_tx,
            conn_id,
        },
        params.resume.as_deref(),
        params.name.as_deref(),
    );
    debug!(participant = %admission.id, %peer_addr, conn_id, "connection admitted");

    state.active_connections.fetch_add(1, Ordering::Relaxed);
    gauges::inc_connections_active();

    let session = Session {
        participant: admission.id,
        conn_id,
    };
    let result = run_message_loop(&mut ws_tx, &mut ws_rx, &mut deliver_rx, &state, &session).await;

    state.registry.disconnect(&session.participant, conn_id);
    state.active_connections.fetch_sub(1, Ordering::Relaxed);
    gauges::dec_connections_active();
    info!(participant = %session.participant, %peer_addr, "connection closed");

    result
}

/// Drive the select loop for an admitted connection.
async fn run_message_loop(
    ws_tx: &mut WsSink,
    ws_rx: &mut WsRecv,
    deliver_rx: &mut mpsc::Receiver<String>,
    state: &ServerState,
    session: &Session,
) -> Result<(), RelayError> {
    let mut rate_limiter = RateLimiter::new();
    let mut ping_interval = interval(Duration::from_secs(state.config.ping_interval));
    let idle_timeout = Duration::from_secs(state.config.idle_timeout);
    let mut last_activity = Instant::now();

    loop {
        tokio::select! {
            msg = ws_rx.next() => {
                last_activity = Instant::now();
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        let start = Instant::now();
                        process_message(&text, state, ws_tx, &mut rate_limiter, session).await?;
                        histograms::relay_latency_seconds(start.elapsed().as_secs_f64());
                    }
                    Some(Ok(Message::Binary(_))) => {
                        counters::protocol_errors_total();
                        send_error(ws_tx, &ProtocolError::BinaryFrame.to_string()).await?;
                    }
                    Some(Ok(Message::Ping(data))) => {
                        if let Err(e) = ws_tx.send(Message::Pong(data)).await {
                            debug!("failed to send pong: {}", e);
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => return Ok(()),
                    Some(Err(e)) => return Err(RelayError::WebSocket(e)),
                    Some(Ok(_)) => {}
                }
            }
            delivery = deliver_rx.recv() => {
                let Some(text) = delivery else {
                    debug!(participant = %session.participant, "session detached from this connection");
                    let _ = ws_tx.send(Message::Close(None)).await;
                    return Ok(());
                };
                ws_tx.send(Message::Text(text)).await.map_err(RelayError::WebSocket)?;
            }
            _ = ping_interval.tick() => {
                if last_activity.elapsed() >= idle_timeout {
                    debug!(participant = %session.participant, "idle timeout reached, closing connection");
                    return Ok(());
                }
                if let Err(e) = ws_tx.send(Message::Ping(vec![])).await {
                    debug!("failed to send ping: {}", e);
                }
            }
        }
    }
}

async fn send_error<T>(ws_tx: &mut T, message: &str) -> Result<(), RelayError>
where
    T: futures_util::Sink<Message> + Unpin,
{
    ws_tx
        .send(Message::Text(Envelope::error(message).to_json()))
        .await
        .map_err(|_| RelayError::ConnectionClosed)
}

async fn process_message<T>(
    text: &str,
    state: &ServerState,
    ws_tx: &mut T,
    rate_limiter: &mut RateLimiter,
    session: &Session,
) -> Result<(), RelayError>
where
    T: futures_util::Sink<Message> + Unpin,
{
    if let Some(limit) =
        rate_limiter.check_and_record(state.config.msg_rate, state.config.bw_rate, text.len())
    {
        counters::messages_dropped_total(limit.label());
        return send_error(ws_tx, "rate limited").await;
    }

    match RawEnvelope::parse(text) {
        Ok(envelope) => {
            let kind = envelope.kind();
            let delivered = state
                .registry
                .relay(&session.participant, session.conn_id, envelope);
            debug!(participant = %session.participant, %kind, delivered, "relayed");
            Ok(())
        }
        Err(e) => {
            counters::protocol_errors_total();
            debug!(participant = %session.participant, error = %e, "rejecting malformed envelope");
            send_error(ws_tx, &e.to_string()).await
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn uri(s: &str) -> Uri {
        s.parse().unwrap()
    }

    #[test]
    fn params_absent_without_query() {
        assert_eq!(connect_params(&uri("/")), ConnectParams::default());
    }

    #[test]
    fn params_decode_resume_and_name() {
        let params = connect_params(&uri("/?resume=abc123&name=Ada%20Lovelace"));
        assert_eq!(params.resume.as_deref(), Some("abc123"));
        assert_eq!(params.name.as_deref(), Some("Ada Lovelace"));
    }

    #[test]
    fn empty_resume_is_ignored() {
        let params = connect_params(&uri("/room?resume=&other=1"));
        assert!(params.resume.is_none());
        assert!(params.name.is_none());
    }

    #[tokio::test]
    async fn malformed_message_gets_error_reply() {
        use crate::config::ServerConfig;

        let config = ServerConfig {
            listen: "127.0.0.1:0".parse().unwrap(),
            metrics_addr: "127.0.0.1:0".parse().unwrap(),
            max_conns: 10,
            grace_period_ms: 5000,
            msg_rate: 1,
            bw_rate: 1_000_000,
            max_message_size: 65_536,
            ping_interval: 30,
            idle_timeout: 120,
            outbound_queue: 8,
        };
        let state = ServerState::new(config);
        let (tx, _rx) = mpsc::channel(8);
        let admission = state.registry.connect(ConnHandle { tx, conn_id: 7 }, None, None);
        let session = Session {
            participant: admission.id,
            conn_id: 7,
        };
        let mut limiter = RateLimiter::new();

        let mut sink: Vec<Message> = Vec::new();

        process_message("{oops", &state, &mut sink, &mut limiter, &session)
            .await
            .unwrap();
        process_message(r#"{"type":"chat","text":"x"}"#, &state, &mut sink, &mut limiter, &session)
            .await
            .unwrap();

        let replies: Vec<Envelope> = sink
            .iter()
            .map(|m| match m {
                Message::Text(t) => Envelope::decode(t).unwrap(),
                other => panic!("unexpected frame {other:?}"),
            })
            .collect();
        assert_eq!(replies.len(), 2);
        assert!(matches!(replies[0], Envelope::Error { .. }));
        assert_eq!(replies[1], Envelope::error("rate limited"));
    }
}
