/**
 * Connection Lifecycle Agent
 *
 * Per-participant connection management: establish the stream, heartbeat,
 * reconnect with exponential backoff, and leave cleanly.
 *
 * # State Machine
 *
 * Connection life is an explicit FSM with pure transitions, testable
 * without a transport:
 *
 * ```text
 * Idle → Connecting → Connected → Backoff → Connecting → ...
 *                  ↘                    ↘
 *                    Closed (leave_room, terminal)
 * ```
 *
 * Backoff starts at 1 s, doubles up to 30 s, and resets on a successful
 * reconnect; a network-availability signal short-circuits the remaining
 * delay. `leave_room` is deliberate and terminal: it sends LEAVE,
 * half-closes the outbound side, waits briefly for the flush and releases
 * the transport, with no further reconnection.
 *
 * Each connection object belongs to one session; its lifecycle is tied to
 * session membership, not to process lifetime.
 */
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::{SinkExt, StreamExt};
use rand::Rng;
use tokio::sync::{mpsc, Mutex, Notify};
use tokio_tungstenite::{connect_async, tungstenite::Message as WsMessage, MaybeTlsStream, WebSocketStream};

use crate::client::events::{ConnectionStatus, SyncEvent};
use crate::client::state::ClientSessionState;
use crate::shared::message::SyncMessage;
use crate::shared::model::{AnnotationBody, Coordinates, ReadingMode};
use crate::shared::SyncError;

/// Lifecycle states of a client connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Idle,
    Connecting,
    Connected,
    Backoff,
    Closed,
}

/// Inputs to the lifecycle state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionEvent {
    ConnectRequested,
    StreamOpened,
    StreamLost,
    /// Backoff delay elapsed, or the network-availability signal fired
    RetryElapsed,
    LeaveRequested,
}

/// Pure transition function of the lifecycle FSM
///
/// `Closed` is absorbing; unexpected inputs leave the state unchanged.
pub fn transition(state: ConnectionState, event: ConnectionEvent) -> ConnectionState {
    use ConnectionEvent::*;
    use ConnectionState::*;
    match (state, event) {
        (_, LeaveRequested) => Closed,
        (Closed, _) => Closed,
        (Idle, ConnectRequested) => Connecting,
        (Connecting, StreamOpened) => Connected,
        (Connecting, StreamLost) => Backoff,
        (Connected, StreamLost) => Backoff,
        (Backoff, RetryElapsed) => Connecting,
        (state, _) => state,
    }
}

/// Exponential backoff: 1 s doubling to 30 s, small jitter, reset on success
#[derive(Debug)]
pub struct Backoff {
    base: Duration,
    cap: Duration,
    current: Duration,
}

impl Backoff {
    pub fn new(base: Duration, cap: Duration) -> Self {
        Self {
            base,
            cap,
            current: base,
        }
    }

    /// The delay before the next attempt; doubles the stored delay
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = (self.current * 2).min(self.cap);
        // Up to 10% jitter so simultaneous reconnects spread out
        let jitter_ms = (delay.as_millis() as u64 / 10).max(1);
        delay + Duration::from_millis(rand::thread_rng().gen_range(0..jitter_ms))
    }

    pub fn reset(&mut self) {
        self.current = self.base;
    }
}

/// Client connection parameters
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Server base URL, e.g. `ws://127.0.0.1:3000`
    pub server_url: String,
    pub session_id: i64,
    pub user_id: String,
    pub display_name: String,
    /// Outbound keepalive ping interval
    pub keepalive_interval: Duration,
    /// Nothing received for this long means the stream is dead
    pub idle_timeout: Duration,
    pub backoff_base: Duration,
    pub backoff_cap: Duration,
}

impl ClientConfig {
    pub fn new(
        server_url: impl Into<String>,
        session_id: i64,
        user_id: impl Into<String>,
        display_name: impl Into<String>,
    ) -> Self {
        Self {
            server_url: server_url.into(),
            session_id,
            user_id: user_id.into(),
            display_name: display_name.into(),
            keepalive_interval: Duration::from_secs(25),
            idle_timeout: Duration::from_secs(60),
            backoff_base: Duration::from_secs(1),
            backoff_cap: Duration::from_secs(30),
        }
    }

    fn sync_url(&self) -> String {
        // User ids and display names are free text; the query values must be
        // percent-encoded or the handshake fails on spaces and '&'.
        format!(
            "{}/sync?session={}&user={}&name={}",
            self.server_url,
            self.session_id,
            urlencoding::encode(&self.user_id),
            urlencoding::encode(&self.display_name)
        )
    }
}

enum Command {
    Send(SyncMessage),
    Leave,
}

/// How one connected stream ended
enum StreamEnd {
    /// Deliberate leave; do not reconnect
    Left,
    /// Transport loss; reconnect with backoff
    Lost,
}

/// A live (or reconnecting) session connection
///
/// Owned by whichever component currently needs the session; dropping it
/// or calling `leave_room` releases the transport.
pub struct SyncConnection {
    commands: mpsc::UnboundedSender<Command>,
    state: Arc<Mutex<ClientSessionState>>,
    events_tx: mpsc::UnboundedSender<SyncEvent>,
    network: Arc<Notify>,
    session_id: i64,
    user_id: String,
    task: tokio::task::JoinHandle<()>,
}

impl SyncConnection {
    /// Open the connection and start the lifecycle agent
    ///
    /// Returns the handle plus the typed event stream. The agent keeps
    /// reconnecting until `leave_room` is called or the handle is dropped.
    pub fn connect(config: ClientConfig) -> (Self, mpsc::UnboundedReceiver<SyncEvent>) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let state = Arc::new(Mutex::new(ClientSessionState::new(
            config.session_id,
            config.user_id.clone(),
        )));
        let network = Arc::new(Notify::new());

        let session_id = config.session_id;
        let user_id = config.user_id.clone();
        let task = tokio::spawn(run_agent(
            config,
            state.clone(),
            commands_rx,
            events_tx.clone(),
            network.clone(),
        ));

        (
            Self {
                commands: commands_tx,
                state,
                events_tx,
                network,
                session_id,
                user_id,
                task,
            },
            events_rx,
        )
    }

    /// Read the local session view
    pub async fn with_state<R>(&self, f: impl FnOnce(&ClientSessionState) -> R) -> R {
        let state = self.state.lock().await;
        f(&state)
    }

    fn send(&self, msg: SyncMessage) -> Result<(), SyncError> {
        self.commands
            .send(Command::Send(msg))
            .map_err(|_| SyncError::SessionClosed)
    }

    /// Drive the shared page position (leader, FOLLOW mode)
    pub fn move_page(&self, page: i32) -> Result<(), SyncError> {
        self.send(SyncMessage::page_move(self.session_id, &self.user_id, page))
    }

    /// Report reading progress for the local user
    pub fn send_progress(&self, page: i32) -> Result<(), SyncError> {
        self.send(SyncMessage::progress_update(
            self.session_id,
            &self.user_id,
            page,
        ))
    }

    /// Switch the session between FOLLOW and FREE (leader only)
    pub fn set_reading_mode(&self, mode: ReadingMode) -> Result<(), SyncError> {
        self.send(SyncMessage::reading_mode_change(
            self.session_id,
            &self.user_id,
            mode,
        ))
    }

    /// Hand leadership to another participant (or claim it when leaderless)
    pub fn transfer_leadership(&self, target: impl Into<String>) -> Result<(), SyncError> {
        self.send(SyncMessage::leadership_transfer(
            self.session_id,
            &self.user_id,
            target,
        ))
    }

    /// Optimistically add a highlight; returns the provisional id
    pub async fn add_highlight(
        &self,
        page: i32,
        snippet: impl Into<String>,
        color: impl Into<String>,
        coordinates: Coordinates,
    ) -> Result<i64, SyncError> {
        self.add_annotation(
            page,
            snippet,
            AnnotationBody::Highlight {
                color: color.into(),
            },
            coordinates,
        )
        .await
    }

    /// Optimistically add a comment; returns the provisional id
    pub async fn add_comment(
        &self,
        page: i32,
        snippet: impl Into<String>,
        text: impl Into<String>,
        coordinates: Coordinates,
    ) -> Result<i64, SyncError> {
        self.add_annotation(page, snippet, AnnotationBody::Comment { text: text.into() }, coordinates)
            .await
    }

    async fn add_annotation(
        &self,
        page: i32,
        snippet: impl Into<String>,
        body: AnnotationBody,
        coordinates: Coordinates,
    ) -> Result<i64, SyncError> {
        let (provisional_id, upstream, events) = {
            let mut state = self.state.lock().await;
            state.add_local(page, snippet, body, coordinates, Instant::now())
        };
        for event in events {
            let _ = self.events_tx.send(event);
        }
        self.send(upstream)?;
        Ok(provisional_id)
    }

    /// Edit a comment's text by authoritative id
    pub fn update_comment(&self, id: i64, text: impl Into<String>) -> Result<(), SyncError> {
        self.send(SyncMessage::annotation_update(
            self.session_id,
            &self.user_id,
            id,
            text,
        ))
    }

    /// Delete an annotation by authoritative id
    pub fn delete_annotation(&self, id: i64) -> Result<(), SyncError> {
        self.send(SyncMessage::annotation_delete(
            self.session_id,
            &self.user_id,
            id,
        ))
    }

    /// Signal that network connectivity returned; skips any pending backoff
    pub fn notify_network_available(&self) {
        self.network.notify_one();
    }

    /// Deliberately leave the session; terminal
    pub async fn leave_room(self) {
        let _ = self.commands.send(Command::Leave);
        // Give the agent a moment to flush LEAVE and half-close
        let _ = tokio::time::timeout(Duration::from_secs(5), self.task).await;
    }
}

/// The lifecycle loop: connect, drive, back off, repeat
async fn run_agent(
    config: ClientConfig,
    state: Arc<Mutex<ClientSessionState>>,
    mut commands: mpsc::UnboundedReceiver<Command>,
    events_tx: mpsc::UnboundedSender<SyncEvent>,
    network: Arc<Notify>,
) {
    let mut fsm = transition(ConnectionState::Idle, ConnectionEvent::ConnectRequested);
    let mut backoff = Backoff::new(config.backoff_base, config.backoff_cap);
    // Sends accepted while disconnected, flushed after the next reconnect
    let mut held: VecDeque<SyncMessage> = VecDeque::new();

    while fsm != ConnectionState::Closed {
        debug_assert_eq!(fsm, ConnectionState::Connecting);
        match connect_async(config.sync_url()).await {
            Ok((stream, _)) => {
                fsm = transition(fsm, ConnectionEvent::StreamOpened);
                backoff.reset();
                let _ = events_tx.send(SyncEvent::Status(ConnectionStatus::Connected));
                tracing::info!(session_id = config.session_id, "stream connected");

                match drive_stream(stream, &config, &state, &mut commands, &mut held, &events_tx)
                    .await
                {
                    StreamEnd::Left => {
                        let _ = events_tx.send(SyncEvent::Status(ConnectionStatus::Closed));
                        break;
                    }
                    StreamEnd::Lost => {
                        fsm = transition(fsm, ConnectionEvent::StreamLost);
                    }
                }
            }
            Err(e) => {
                tracing::debug!("connect failed: {}", e);
                fsm = transition(fsm, ConnectionEvent::StreamLost);
            }
        }

        if fsm != ConnectionState::Backoff {
            continue;
        }
        let _ = events_tx.send(SyncEvent::Status(ConnectionStatus::Reconnecting));
        let delay = backoff.next_delay();
        tracing::debug!(?delay, "backing off before reconnect");
        let sleep = tokio::time::sleep(delay);
        tokio::pin!(sleep);
        loop {
            tokio::select! {
                _ = &mut sleep => break,
                // Connectivity restored: retry immediately
                _ = network.notified() => {
                    tracing::debug!("network available, skipping backoff");
                    break;
                }
                cmd = commands.recv() => match cmd {
                    Some(Command::Leave) | None => {
                        let _ = events_tx.send(SyncEvent::Status(ConnectionStatus::Closed));
                        return;
                    }
                    // Hold the send; it goes out once the stream is back
                    Some(Command::Send(msg)) => held.push_back(msg),
                }
            }
        }
        fsm = transition(fsm, ConnectionEvent::RetryElapsed);
    }
}

/// Drive one connected stream until it ends
///
/// Handles: inbound frames (dispatched into the local view and republished
/// as typed events), outbound commands, keepalive pings, pong replies, the
/// idle timeout, and the pending-reconciliation expiry sweep.
async fn drive_stream(
    stream: WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>,
    config: &ClientConfig,
    state: &Arc<Mutex<ClientSessionState>>,
    commands: &mut mpsc::UnboundedReceiver<Command>,
    held: &mut VecDeque<SyncMessage>,
    events_tx: &mpsc::UnboundedSender<SyncEvent>,
) -> StreamEnd {
    let (mut sink, mut inbound) = stream.split();

    // Flush sends that were accepted while the previous stream was down;
    // anything unsent survives in the queue for the next attempt.
    while let Some(msg) = held.front() {
        match serde_json::to_string(msg) {
            Ok(json) => {
                if sink.send(WsMessage::Text(json.into())).await.is_err() {
                    return StreamEnd::Lost;
                }
            }
            Err(e) => tracing::error!("failed to serialize held outbound: {}", e),
        }
        held.pop_front();
    }

    let mut ping = tokio::time::interval(config.keepalive_interval);
    ping.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    ping.tick().await;
    let mut expiry = tokio::time::interval(Duration::from_secs(1));
    expiry.tick().await;

    loop {
        tokio::select! {
            frame = tokio::time::timeout(config.idle_timeout, inbound.next()) => {
                let frame = match frame {
                    Ok(Some(Ok(frame))) => frame,
                    Ok(Some(Err(e))) => {
                        tracing::debug!("stream error: {}", e);
                        return StreamEnd::Lost;
                    }
                    Ok(None) => return StreamEnd::Lost,
                    Err(_) => {
                        tracing::info!("stream idle beyond timeout");
                        return StreamEnd::Lost;
                    }
                };
                match frame {
                    WsMessage::Text(text) => {
                        let msg: SyncMessage = match serde_json::from_str(text.as_str()) {
                            Ok(msg) => msg,
                            Err(e) => {
                                tracing::warn!("dropping malformed frame: {}", e);
                                continue;
                            }
                        };
                        let events = {
                            let mut state = state.lock().await;
                            state.apply_message(&msg, Instant::now())
                        };
                        for event in events {
                            let _ = events_tx.send(event);
                        }
                    }
                    WsMessage::Ping(payload) => {
                        if sink.send(WsMessage::Pong(payload)).await.is_err() {
                            return StreamEnd::Lost;
                        }
                    }
                    WsMessage::Close(_) => return StreamEnd::Lost,
                    _ => {}
                }
            }
            cmd = commands.recv() => {
                match cmd {
                    Some(Command::Send(msg)) => {
                        let json = match serde_json::to_string(&msg) {
                            Ok(json) => json,
                            Err(e) => {
                                tracing::error!("failed to serialize outbound: {}", e);
                                continue;
                            }
                        };
                        if sink.send(WsMessage::Text(json.into())).await.is_err() {
                            return StreamEnd::Lost;
                        }
                    }
                    Some(Command::Leave) | None => {
                        // Deliberate leave: announce, half-close, brief flush
                        let leave = SyncMessage::leave(config.session_id, &config.user_id);
                        if let Ok(json) = serde_json::to_string(&leave) {
                            let _ = sink.send(WsMessage::Text(json.into())).await;
                        }
                        let _ = sink.close().await;
                        tokio::time::sleep(Duration::from_millis(100)).await;
                        return StreamEnd::Left;
                    }
                }
            }
            _ = ping.tick() => {
                if sink.send(WsMessage::Ping(Vec::new().into())).await.is_err() {
                    return StreamEnd::Lost;
                }
            }
            _ = expiry.tick() => {
                let events = {
                    let mut state = state.lock().await;
                    state.expire_pending(Instant::now())
                };
                for event in events {
                    let _ = events_tx.send(event);
                }
            }
        }
    }
}
