//! Agent tunnel listener.
//!
//! Agents dial in with an HTTP/2 CONNECT request, authenticate with a bearer
//! token, and keep a single long-lived stream per node. All frames on the
//! stream use the length-prefixed JSON codec from [`common::wire`].

use std::{
    collections::HashMap,
    net::SocketAddr,
    sync::Arc,
    time::{Duration, Instant as StdInstant},
};

use anyhow::Context;
use bytes::{Bytes, BytesMut};
use chrono::{DateTime, Utc};
use common::wire::{self, TunnelFrame};
use h2::server;
use http::{
    header::{HeaderName, HeaderValue},
    Method, Response, StatusCode,
};
use metrics::{counter, histogram};
use tokio::{
    net::TcpListener,
    sync::{mpsc, oneshot, Semaphore},
    time,
};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::{
    app_state::AppState,
    error::CommandError,
    tunnel::registry::{AgentCommand, StreamEvent, TunnelRegistry, MAX_INFLIGHT_COMMANDS},
};

const NODE_ID_HEADER: &str = "x-aero-node-id";
const COMMAND_CHANNEL_CAPACITY: usize = 128;

enum PendingEntry {
    Reply {
        started_at: StdInstant,
        response_tx: oneshot::Sender<Result<serde_json::Value, CommandError>>,
    },
    Stream {
        started_at: StdInstant,
        events_tx: mpsc::Sender<StreamEvent>,
    },
}

impl PendingEntry {
    fn is_closed(&self) -> bool {
        match self {
            PendingEntry::Reply { response_tx, .. } => response_tx.is_closed(),
            PendingEntry::Stream { events_tx, .. } => events_tx.is_closed(),
        }
    }
}

pub async fn serve(state: AppState) -> anyhow::Result<()> {
    let addr: SocketAddr = format!("{}:{}", state.tunnel.host, state.tunnel.port)
        .parse()
        .context("parse tunnel listen address")?;

    let listener = TcpListener::bind(addr)
        .await
        .context("bind tunnel listener")?;
    info!(%addr, "starting tunnel listener");

    let listener_state = state.clone();
    tokio::spawn(async move {
        loop {
            let (stream, _) = match listener.accept().await {
                Ok(pair) => pair,
                Err(err) => {
                    error!(?err, "accept failed for tunnel listener");
                    continue;
                }
            };

            let state = listener_state.clone();
            tokio::spawn(async move {
                if let Err(err) = handle_connection(stream, state).await {
                    error!(error = ?err, "tunnel connection failed");
                }
            });
        }
    });

    Ok(())
}

async fn handle_connection(stream: tokio::net::TcpStream, state: AppState) -> anyhow::Result<()> {
    let mut h2 = server::handshake(stream).await?;

    while let Some(result) = h2.accept().await {
        let (request, mut respond) = result?;

        let start = StdInstant::now();
        let mut node_label = "unknown".to_string();
        // CONNECT requests in HTTP/2 carry no path, only authority.
        if request.method() != Method::CONNECT {
            record_connect_metrics(&node_label, "bad_method", start);
            let response = Response::builder()
                .status(StatusCode::METHOD_NOT_ALLOWED)
                .body(())?;
            let _ = respond.send_response(response, true);
            continue;
        }

        let token_header = match HeaderName::from_bytes(state.tunnel.token_header.as_bytes()) {
            Ok(name) => name,
            Err(_) => {
                record_connect_metrics(&node_label, "bad_token_header", start);
                let response = Response::builder()
                    .status(StatusCode::INTERNAL_SERVER_ERROR)
                    .body(())?;
                let _ = respond.send_response(response, true);
                continue;
            }
        };

        let node_id = match request
            .headers()
            .get(NODE_ID_HEADER)
            .and_then(|value| value.to_str().ok())
            .and_then(|s| Uuid::parse_str(s).ok())
        {
            Some(id) => {
                node_label = id.to_string();
                id
            }
            None => {
                record_connect_metrics(&node_label, "invalid_node_id", start);
                let response = Response::builder()
                    .status(StatusCode::BAD_REQUEST)
                    .body(())?;
                let _ = respond.send_response(response, true);
                continue;
            }
        };

        let authorized = request
            .headers()
            .get(&token_header)
            .and_then(parse_bearer)
            .map(|token| state.agent_auth.verify(&token))
            .unwrap_or(false);
        if !authorized {
            record_connect_metrics(&node_label, "unauthorized", start);
            let response = Response::builder()
                .status(StatusCode::UNAUTHORIZED)
                .body(())?;
            let _ = respond.send_response(response, true);
            continue;
        }

        let mut send_stream =
            respond.send_response(Response::builder().status(StatusCode::OK).body(())?, false)?;
        let mut recv_stream = request.into_body();

        record_connect_metrics(&node_label, "accepted", start);

        let registry = state.registry.clone();
        let heartbeat_timeout = state.tunnel.heartbeat_timeout();
        let inflight = Arc::new(Semaphore::new(MAX_INFLIGHT_COMMANDS));
        let (command_tx, command_rx) = mpsc::channel(COMMAND_CHANNEL_CAPACITY);

        tokio::spawn(async move {
            if let Err(err) = drive_connection(
                node_id,
                &mut send_stream,
                &mut recv_stream,
                registry,
                heartbeat_timeout,
                command_rx,
                command_tx,
                inflight,
            )
            .await
            {
                warn!(%node_id, error = ?err, "tunnel stream closed with error");
            }
        });
    }

    Ok(())
}

#[allow(clippy::too_many_arguments)]
async fn drive_connection(
    node_id: Uuid,
    send_stream: &mut h2::SendStream<Bytes>,
    recv_stream: &mut h2::RecvStream,
    registry: TunnelRegistry,
    heartbeat_timeout: Duration,
    mut command_rx: mpsc::Receiver<AgentCommand>,
    command_tx: mpsc::Sender<AgentCommand>,
    inflight: Arc<Semaphore>,
) -> anyhow::Result<()> {
    let mut buffer = BytesMut::new();
    let hello_frame = read_next_frame(recv_stream, &mut buffer)
        .await?
        .ok_or_else(|| anyhow::anyhow!("stream closed before client_hello"))?;

    match hello_frame {
        TunnelFrame::ClientHello {
            node_id: hello_node,
            ..
        } => {
            if hello_node != node_id {
                anyhow::bail!("client_hello node {hello_node} does not match header {node_id}");
            }
        }
        other => anyhow::bail!("unexpected frame during handshake: {:?}", other),
    }

    let tunnel_id = Uuid::new_v4();
    send_frame(
        send_stream,
        &TunnelFrame::ServerHello {
            tunnel_id,
            heartbeat_timeout_secs: heartbeat_timeout.as_secs(),
        },
    )
    .await?;
    // Replaces any previous session for this node; the old driver's guarded
    // remove cannot evict this one.
    registry
        .upsert(node_id, tunnel_id, command_tx, inflight)
        .await;

    let heartbeat_timer = time::sleep(heartbeat_timeout);
    tokio::pin!(heartbeat_timer);
    let mut pending: HashMap<String, PendingEntry> = HashMap::new();

    let exit_reason: &str = loop {
        tokio::select! {
            _ = &mut heartbeat_timer => {
                break "heartbeat_timeout";
            }
            frame = read_next_frame(recv_stream, &mut buffer) => {
                let Some(frame) = frame? else {
                    break "eos";
                };

                match frame {
                    TunnelFrame::Heartbeat { sent_at } => {
                        registry.touch_heartbeat(node_id).await;
                        record_heartbeat_latency(&node_id, &sent_at);
                        send_frame(send_stream, &TunnelFrame::HeartbeatAck {
                            received_at: Utc::now().to_rfc3339(),
                        }).await?;
                        heartbeat_timer.as_mut().reset(time::Instant::now() + heartbeat_timeout);
                        // Abandoned callers leave closed channels behind.
                        pending.retain(|_, entry| !entry.is_closed());
                    }
                    TunnelFrame::Reply { request_id, data } => {
                        resolve_reply(&mut pending, &node_id, &request_id, Ok(data));
                    }
                    TunnelFrame::ReplyError { request_id, message } => {
                        resolve_reply(
                            &mut pending,
                            &node_id,
                            &request_id,
                            Err(CommandError::Remote(message)),
                        );
                    }
                    TunnelFrame::DownloadBackup { request_id, chunk } => {
                        let Some(PendingEntry::Stream { events_tx, .. }) = pending.get(&request_id) else {
                            warn!(%node_id, %request_id, "chunk for unknown stream");
                            continue;
                        };
                        let event = match wire::decode_chunk(&chunk) {
                            Ok(data) => StreamEvent::Chunk(data),
                            Err(err) => StreamEvent::Error(format!("invalid chunk: {err}")),
                        };
                        let failed = matches!(event, StreamEvent::Error(_));
                        if events_tx.send(event).await.is_err() || failed {
                            // Consumer gone or stream poisoned; stop tracking it.
                            pending.remove(&request_id);
                        }
                    }
                    TunnelFrame::StreamEnd { request_id } => {
                        if let Some(PendingEntry::Stream { started_at, events_tx }) = pending.remove(&request_id) {
                            record_command_outcome("stream", "ok", started_at);
                            let _ = events_tx.send(StreamEvent::End).await;
                        }
                    }
                    TunnelFrame::StreamError { request_id, message } => {
                        if let Some(PendingEntry::Stream { started_at, events_tx }) = pending.remove(&request_id) {
                            record_command_outcome("stream", "error", started_at);
                            let _ = events_tx.send(StreamEvent::Error(message)).await;
                        }
                    }
                    other => {
                        warn!(%node_id, frame = ?other, "unexpected tunnel frame");
                    }
                }
            }
            command = command_rx.recv() => {
                let Some(command) = command else {
                    break "command_channel_closed";
                };

                match command {
                    AgentCommand::Send { frame } => {
                        if let Err(err) = send_frame(send_stream, &frame).await {
                            warn!(%node_id, error = ?err, "failed to send frame");
                            break "send_failed";
                        }
                    }
                    AgentCommand::Request { request_id, frame, started_at, response_tx } => {
                        match send_frame(send_stream, &frame).await {
                            Ok(()) => {
                                pending.insert(request_id, PendingEntry::Reply { started_at, response_tx });
                            }
                            Err(err) => {
                                warn!(%node_id, error = ?err, "failed to send command frame");
                                let _ = response_tx.send(Err(CommandError::Disconnected));
                                break "send_failed";
                            }
                        }
                    }
                    AgentCommand::Stream { request_id, frame, started_at, events_tx } => {
                        match send_frame(send_stream, &frame).await {
                            Ok(()) => {
                                pending.insert(request_id, PendingEntry::Stream { started_at, events_tx });
                            }
                            Err(err) => {
                                warn!(%node_id, error = ?err, "failed to send stream frame");
                                let _ = events_tx.send(StreamEvent::Error("tunnel closed".to_string())).await;
                                break "send_failed";
                            }
                        }
                    }
                    AgentCommand::Cancel { request_id } => {
                        pending.remove(&request_id);
                    }
                }
            }
        }
    };

    for (_id, entry) in pending.drain() {
        match entry {
            PendingEntry::Reply { response_tx, .. } => {
                let _ = response_tx.send(Err(CommandError::Disconnected));
            }
            PendingEntry::Stream { events_tx, .. } => {
                let _ = events_tx.try_send(StreamEvent::Error("tunnel closed".to_string()));
            }
        }
    }
    registry.remove(node_id, tunnel_id, exit_reason).await;
    if exit_reason == "heartbeat_timeout" {
        anyhow::bail!("heartbeat timeout");
    }
    Ok(())
}

fn resolve_reply(
    pending: &mut HashMap<String, PendingEntry>,
    node_id: &Uuid,
    request_id: &str,
    result: Result<serde_json::Value, CommandError>,
) {
    match pending.remove(request_id) {
        Some(PendingEntry::Reply {
            started_at,
            response_tx,
        }) => {
            let outcome = if result.is_ok() { "ok" } else { "error" };
            record_command_outcome("request", outcome, started_at);
            let _ = response_tx.send(result);
        }
        Some(PendingEntry::Stream {
            started_at,
            events_tx,
        }) => {
            // An agent may answer a stream request with reply_error.
            record_command_outcome("stream", "error", started_at);
            let message = match result {
                Err(CommandError::Remote(message)) => message,
                _ => "unexpected reply on stream".to_string(),
            };
            let _ = events_tx.try_send(StreamEvent::Error(message));
        }
        None => {
            warn!(%node_id, %request_id, "reply for unknown request");
        }
    }
}

fn parse_bearer(value: &HeaderValue) -> Option<String> {
    let raw = value.to_str().ok()?.trim();
    let prefix = "Bearer ";
    if raw.len() <= prefix.len() || !raw.starts_with(prefix) {
        return None;
    }
    Some(raw[prefix.len()..].to_string())
}

async fn send_frame(
    send_stream: &mut h2::SendStream<Bytes>,
    frame: &TunnelFrame,
) -> anyhow::Result<()> {
    let encoded = wire::encode_frame(frame).context("encode tunnel frame")?;
    send_stream
        .send_data(encoded, false)
        .context("send tunnel frame")?;
    Ok(())
}

async fn read_next_frame(
    recv: &mut h2::RecvStream,
    buffer: &mut BytesMut,
) -> anyhow::Result<Option<TunnelFrame>> {
    loop {
        if let Some(frame) = wire::try_parse_frame(buffer)? {
            return Ok(Some(frame));
        }

        match recv.data().await {
            Some(Ok(chunk)) => buffer.extend_from_slice(&chunk),
            Some(Err(err)) => return Err(anyhow::anyhow!(err)),
            None => {
                if buffer.is_empty() {
                    return Ok(None);
                } else {
                    return Err(anyhow::anyhow!(common::wire::WireError::Truncated));
                }
            }
        }
    }
}

fn record_connect_metrics(node_id: &str, result: &str, start: StdInstant) {
    let node = if node_id.is_empty() {
        "unknown"
    } else {
        node_id
    };
    counter!(
        "aero_cp_tunnel_connect_total",
        "result" => result.to_string(),
        "node_id" => node.to_string(),
    )
    .increment(1);
    histogram!(
        "aero_cp_tunnel_connect_duration_seconds",
        "result" => result.to_string(),
    )
    .record(start.elapsed().as_secs_f64());
}

fn record_heartbeat_latency(node_id: &Uuid, sent_at: &str) {
    match DateTime::parse_from_rfc3339(sent_at) {
        Ok(sent) => {
            let latency_secs = (Utc::now() - sent.with_timezone(&Utc))
                .num_milliseconds()
                .max(0) as f64
                / 1000.0;
            histogram!(
                "aero_cp_tunnel_heartbeat_rtt_seconds",
                "node_id" => node_id.to_string()
            )
            .record(latency_secs);
        }
        Err(_) => {
            counter!(
                "aero_cp_tunnel_heartbeat_total",
                "node_id" => node_id.to_string(),
                "result" => "parse_error"
            )
            .increment(1);
        }
    }
}

fn record_command_outcome(kind: &'static str, result: &'static str, started_at: StdInstant) {
    histogram!(
        "aero_cp_tunnel_command_duration_seconds",
        "kind" => kind,
        "result" => result,
    )
    .record(started_at.elapsed().as_secs_f64());
    counter!(
        "aero_cp_tunnel_command_total",
        "kind" => kind,
        "result" => result,
    )
    .increment(1);
}
