/**
 * WebSocket Stream Handler
 *
 * One duplex WebSocket per participant per session. The handler:
 *
 * 1. upgrades the connection and applies a JOIN on the client's behalf,
 * 2. sends the full `PARTICIPANTS_SNAPSHOT` to the joining stream,
 * 3. forwards every broadcast of the session to the socket, including the
 *    sender's own echoes, which carry authoritative annotation ids, and
 * 4. validates every inbound frame before delegating it to the registry.
 *
 * # Ordering
 *
 * The registry emits broadcasts while holding the session lock, and this
 * handler forwards them in channel order, so every open stream of a session
 * observes the same relative order of actions.
 *
 * # Keepalive
 *
 * The outbound task pings on the configured interval; the inbound loop
 * closes the connection when nothing (not even a pong) arrives within the
 * idle timeout. Inbound traffic of any kind refreshes the participant's
 * liveness timestamp, which is what the leadership sweep consults.
 */
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    response::{IntoResponse, Response},
};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use uuid::Uuid;

use crate::backend::server::state::AppState;
use crate::backend::session::SessionRegistry;
use crate::shared::message::{ActionType, SyncMessage};

/// Query parameters for the `/sync` WebSocket endpoint
#[derive(Debug, Deserialize)]
pub struct WsQuery {
    /// Session (room) id to join
    pub session: i64,
    /// Participant user id
    pub user: String,
    /// Display name, used on first JOIN
    pub name: Option<String>,
}

/// WebSocket upgrade handler for `GET /sync`
pub async fn ws_handler(
    State(state): State<AppState>,
    Query(query): Query<WsQuery>,
    ws: WebSocketUpgrade,
) -> Response {
    if query.user.is_empty() {
        return axum::http::StatusCode::BAD_REQUEST.into_response();
    }
    let max_frame = state.registry.config().max_frame_bytes;
    ws.max_message_size(max_frame)
        .on_upgrade(move |socket| handle_socket(socket, state.registry, query))
}

async fn handle_socket(socket: WebSocket, registry: Arc<SessionRegistry>, query: WsQuery) {
    let connection_id = Uuid::new_v4();
    let session_id = query.session;
    let user_id = query.user;
    let display_name = query.name.unwrap_or_else(|| user_id.clone());
    tracing::info!(%connection_id, session_id, user = %user_id, "stream connected");

    // join() hands back a subscription taken before the JOIN was applied,
    // so no broadcast between the snapshot and the first forwarded message
    // can be missed.
    let (_, events, snapshot) = registry.join(session_id, &user_id, &display_name).await;

    let (mut sink, stream) = socket.split();
    let snapshot_json = match serde_json::to_string(&snapshot) {
        Ok(json) => json,
        Err(e) => {
            tracing::error!(%connection_id, "failed to serialize snapshot: {}", e);
            return;
        }
    };
    if sink.send(Message::Text(snapshot_json.into())).await.is_err() {
        registry.disconnect(session_id, &user_id).await;
        return;
    }

    // Direct replies (snapshots for a re-JOIN on an open stream) go to this
    // connection only, merged into the outbound task alongside broadcasts.
    let (replies_tx, replies_rx) = mpsc::unbounded_channel::<SyncMessage>();

    // Outbound: forward session broadcasts and emit keepalive pings.
    let keepalive = registry.config().keepalive_interval;
    let outbound_user = user_id.clone();
    let mut outbound = tokio::spawn(async move {
        forward_broadcasts(sink, events, replies_rx, keepalive, &outbound_user).await;
    });

    // Inbound: validate and delegate until the stream ends or goes idle.
    let mut inbound = Box::pin(inbound_loop(
        stream,
        registry.clone(),
        session_id,
        user_id.clone(),
        replies_tx,
    ));

    tokio::select! {
        _ = &mut outbound => {}
        _ = &mut inbound => {
            outbound.abort();
        }
    }

    registry.disconnect(session_id, &user_id).await;
    tracing::info!(%connection_id, session_id, user = %user_id, "stream closed");
}

/// Forward session broadcasts to one socket, interleaved with pings
///
/// Channel order is preserved; a lagged receiver means this connection fell
/// too far behind and is closed (the client re-joins and gets a snapshot).
async fn forward_broadcasts(
    mut sink: futures_util::stream::SplitSink<WebSocket, Message>,
    mut events: broadcast::Receiver<SyncMessage>,
    mut replies: mpsc::UnboundedReceiver<SyncMessage>,
    keepalive: std::time::Duration,
    user_id: &str,
) {
    let mut ping = tokio::time::interval(keepalive);
    ping.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    ping.tick().await; // first tick fires immediately

    loop {
        tokio::select! {
            received = events.recv() => {
                let msg = match received {
                    Ok(msg) => msg,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(user = %user_id, skipped, "stream lagged, closing");
                        break;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                };
                let json = match serde_json::to_string(&msg) {
                    Ok(json) => json,
                    Err(e) => {
                        tracing::error!("failed to serialize broadcast: {}", e);
                        continue;
                    }
                };
                if sink.send(Message::Text(json.into())).await.is_err() {
                    break;
                }
            }
            reply = replies.recv() => {
                // Sender side dropping just means the inbound loop ended
                let Some(msg) = reply else { break };
                let json = match serde_json::to_string(&msg) {
                    Ok(json) => json,
                    Err(e) => {
                        tracing::error!("failed to serialize reply: {}", e);
                        continue;
                    }
                };
                if sink.send(Message::Text(json.into())).await.is_err() {
                    break;
                }
            }
            _ = ping.tick() => {
                if sink.send(Message::Ping(Vec::new().into())).await.is_err() {
                    break;
                }
            }
        }
    }
    let _ = sink.close().await;
}

/// Receive, validate and apply inbound frames until the stream ends
async fn inbound_loop(
    mut stream: futures_util::stream::SplitStream<WebSocket>,
    registry: Arc<SessionRegistry>,
    session_id: i64,
    user_id: String,
    replies: mpsc::UnboundedSender<SyncMessage>,
) {
    let idle_timeout = registry.config().idle_timeout;
    loop {
        let frame = match tokio::time::timeout(idle_timeout, stream.next()).await {
            Ok(Some(Ok(frame))) => frame,
            Ok(Some(Err(e))) => {
                tracing::debug!(user = %user_id, "stream error: {}", e);
                break;
            }
            Ok(None) => break,
            Err(_) => {
                tracing::info!(user = %user_id, "stream idle beyond timeout, closing");
                break;
            }
        };

        match frame {
            Message::Text(text) => {
                let msg: SyncMessage = match serde_json::from_str(text.as_str()) {
                    Ok(msg) => msg,
                    Err(e) => {
                        tracing::warn!(user = %user_id, "dropping malformed frame: {}", e);
                        continue;
                    }
                };
                if let Err(error) = validate_envelope(&msg, session_id, &user_id) {
                    tracing::warn!(user = %user_id, "dropping invalid frame: {}", error);
                    continue;
                }
                let deliberate_leave = msg.action_type == ActionType::Leave;
                match registry.apply(&msg).await {
                    // A JOIN resent on an open stream earns a fresh snapshot
                    Ok(Some(reply)) => {
                        let _ = replies.send(reply);
                    }
                    Ok(None) => {}
                    Err(error) => {
                        tracing::warn!(user = %user_id, "action not applied: {}", error);
                    }
                }
                if deliberate_leave {
                    // Half-close follows from the client; stop reading here.
                    break;
                }
            }
            Message::Ping(_) | Message::Pong(_) => {
                registry.touch(session_id, &user_id).await;
            }
            Message::Close(_) => break,
            Message::Binary(_) => {
                tracing::debug!(user = %user_id, "ignoring binary frame");
            }
        }
    }
}

/// Envelope validation: the frame must belong to this stream's session and
/// be authored by this stream's participant.
fn validate_envelope(
    msg: &SyncMessage,
    session_id: i64,
    user_id: &str,
) -> Result<(), crate::shared::SyncError> {
    if msg.session_id != session_id {
        return Err(crate::shared::SyncError::validation(
            "sessionId",
            format!("frame for session {} on stream of session {}", msg.session_id, session_id),
        ));
    }
    if msg.sender_id != user_id {
        return Err(crate::shared::SyncError::validation(
            "senderId",
            format!("frame from '{}' on stream of '{}'", msg.sender_id, user_id),
        ));
    }
    Ok(())
}
