/**
 * Session Registry
 *
 * Holds one authoritative `SessionState` per active session and serializes
 * all mutations to it.
 *
 * # Architecture
 *
 * Each session gets a `SessionHandle` holding:
 * - the state behind a `tokio::sync::Mutex` (the single-writer path), and
 * - a `tokio::sync::broadcast` channel that fans applied actions out to
 *   every open stream of the session.
 *
 * Broadcasts are sent *while the state lock is held*, so the channel order
 * is exactly the order in which actions were applied: every subscriber
 * observes the same total order, and a snapshot read happens strictly after
 * the write that produced it. Different sessions are fully independent.
 *
 * # Lifecycle Sweeps
 *
 * `run_sweeper` drives two periodic jobs: demoting leaders whose liveness
 * timestamp went stale beyond the grace period, and reaping sessions whose
 * participants have all been offline beyond the reap timeout.
 */
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::{broadcast, Mutex, RwLock};

use crate::backend::server::config::ServerConfig;
use crate::backend::session::leadership;
use crate::backend::session::state::{ApplyOutcome, SessionState};
use crate::shared::message::{ActionType, SyncMessage};
use crate::shared::SyncError;

/// Broadcast capacity per session; a lagging receiver is treated as a dead
/// connection by the stream handler.
const SESSION_CHANNEL_CAPACITY: usize = 256;

/// One active session: its serialized state plus its fan-out channel
#[derive(Debug)]
pub struct SessionHandle {
    state: Mutex<SessionState>,
    events: broadcast::Sender<SyncMessage>,
}

impl SessionHandle {
    fn new(session_id: i64) -> Self {
        let (events, _) = broadcast::channel(SESSION_CHANNEL_CAPACITY);
        Self {
            state: Mutex::new(SessionState::new(session_id)),
            events,
        }
    }

    /// Subscribe to this session's broadcast stream
    ///
    /// Subscribe *before* applying a JOIN so no broadcast between the
    /// snapshot and the first received message can be missed.
    pub fn subscribe(&self) -> broadcast::Receiver<SyncMessage> {
        self.events.subscribe()
    }

    /// Number of live broadcast subscribers, one per open stream
    pub fn subscriber_count(&self) -> usize {
        self.events.receiver_count()
    }

    /// Run a closure under the session lock and broadcast its outcome
    ///
    /// The send happens inside the critical section, which is what
    /// establishes the per-session total order.
    async fn mutate<F>(&self, f: F) -> ApplyOutcome
    where
        F: FnOnce(&mut SessionState) -> ApplyOutcome,
    {
        let mut state = self.state.lock().await;
        let mut outcome = f(&mut state);
        for msg in outcome.broadcast.drain(..) {
            // No receivers is fine: the state change itself stands
            let _ = self.events.send(msg);
        }
        outcome
    }

    /// Read-only access to the state, for tests and diagnostics
    pub async fn with_state<R>(&self, f: impl FnOnce(&SessionState) -> R) -> R {
        let state = self.state.lock().await;
        f(&state)
    }
}

/// Registry of all active sessions
#[derive(Debug)]
pub struct SessionRegistry {
    sessions: RwLock<HashMap<i64, Arc<SessionHandle>>>,
    config: ServerConfig,
}

impl SessionRegistry {
    pub fn new(config: ServerConfig) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            config,
        }
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Look up a session without creating it
    pub async fn get(&self, session_id: i64) -> Option<Arc<SessionHandle>> {
        self.sessions.read().await.get(&session_id).cloned()
    }

    /// Look up or create the handle for a session
    ///
    /// Sessions come into existence on first JOIN; the first joiner becomes
    /// the original host.
    pub async fn get_or_create(&self, session_id: i64) -> Arc<SessionHandle> {
        if let Some(handle) = self.get(session_id).await {
            return handle;
        }
        let mut sessions = self.sessions.write().await;
        sessions
            .entry(session_id)
            .or_insert_with(|| {
                tracing::info!(session_id, "creating session");
                Arc::new(SessionHandle::new(session_id))
            })
            .clone()
    }

    /// Apply a JOIN on behalf of a connecting participant
    ///
    /// Returns the session handle, a broadcast subscription taken before
    /// the JOIN was applied (so no update between the snapshot and the
    /// first received message can be missed), and the snapshot reply for
    /// the joining stream. The incremental JOIN update has already been
    /// broadcast to the others.
    pub async fn join(
        &self,
        session_id: i64,
        user_id: &str,
        display_name: &str,
    ) -> (
        Arc<SessionHandle>,
        broadcast::Receiver<SyncMessage>,
        SyncMessage,
    ) {
        loop {
            let handle = self.get_or_create(session_id).await;
            let events = handle.subscribe();
            let outcome = handle
                .mutate(|state| state.join(user_id, display_name, Instant::now()))
                .await;
            // The reaper may have removed the session between the lookup
            // and the apply; a JOIN landing in an orphaned handle would be
            // deaf to all broadcasts, so retry against the current one.
            let registered = self
                .get(session_id)
                .await
                .is_some_and(|current| Arc::ptr_eq(&current, &handle));
            if !registered {
                continue;
            }
            // join() always produces a snapshot reply
            let snapshot = outcome.reply.unwrap_or_else(|| {
                SyncMessage::new(session_id, user_id, ActionType::ParticipantsSnapshot)
            });
            return (handle, events, snapshot);
        }
    }

    /// Validate and apply one inbound action from an open stream
    ///
    /// Validation: the session must exist and the sender must be one of its
    /// participants. Protocol violations inside the session (non-leader
    /// PAGE_MOVE and friends) are not errors; they are silently dropped by
    /// the state machine.
    pub async fn apply(&self, msg: &SyncMessage) -> Result<Option<SyncMessage>, SyncError> {
        let handle = self
            .get(msg.session_id)
            .await
            .ok_or(SyncError::SessionClosed)?;
        let is_member = handle
            .with_state(|state| state.participants.contains_key(&msg.sender_id))
            .await;
        if !is_member && msg.action_type != ActionType::Join {
            return Err(SyncError::validation(
                "senderId",
                format!("{} is not a member of session {}", msg.sender_id, msg.session_id),
            ));
        }
        let outcome = handle
            .mutate(|state| state.apply(msg, Instant::now()))
            .await;
        Ok(outcome.reply)
    }

    /// Mark a participant offline after its stream closed without a LEAVE
    pub async fn disconnect(&self, session_id: i64, user_id: &str) {
        if let Some(handle) = self.get(session_id).await {
            handle
                .mutate(|state| state.mark_offline(user_id, Instant::now()))
                .await;
            tracing::debug!(session_id, user_id, "participant disconnected");
        }
    }

    /// Refresh a participant's liveness timestamp (pings, pongs, any frame)
    pub async fn touch(&self, session_id: i64, user_id: &str) {
        if let Some(handle) = self.get(session_id).await {
            let mut state = handle.state.lock().await;
            state.touch(user_id, Instant::now());
        }
    }

    /// One pass of the background sweep:
    /// demote silent leaders, reap idle sessions.
    pub async fn sweep(&self, now: Instant) {
        let handles: Vec<(i64, Arc<SessionHandle>)> = {
            let sessions = self.sessions.read().await;
            sessions.iter().map(|(id, h)| (*id, h.clone())).collect()
        };

        let mut reap = Vec::new();
        for (session_id, handle) in handles {
            handle
                .mutate(|state| {
                    let mut outcome = ApplyOutcome::default();
                    if let Some(msg) =
                        leadership::demote_if_stale(state, now, self.config.leader_grace)
                    {
                        outcome.broadcast.push(msg);
                    }
                    outcome
                })
                .await;

            // A session with open streams is never reaped, whatever its
            // participant timestamps say: the stream handlers own those
            // subscriptions and would be left broadcasting into a void.
            let reapable = handle.subscriber_count() == 0
                && handle
                    .with_state(|state| {
                        state.idle_since.map(|since| {
                            now.duration_since(since) >= self.config.session_reap_timeout
                        })
                        .unwrap_or(false)
                    })
                    .await;
            if reapable {
                reap.push(session_id);
            }
        }

        if !reap.is_empty() {
            let mut sessions = self.sessions.write().await;
            for session_id in reap {
                // Re-check under the write lock: a JOIN may have raced in
                let still_idle = match sessions.get(&session_id) {
                    Some(handle) => {
                        handle.subscriber_count() == 0
                            && handle
                                .with_state(|state| state.idle_since.is_some())
                                .await
                    }
                    None => false,
                };
                if still_idle {
                    tracing::info!(session_id, "reaping idle session");
                    sessions.remove(&session_id);
                }
            }
        }
    }

    /// Number of currently tracked sessions
    pub async fn session_count(&self) -> usize {
        self.sessions.read().await.len()
    }
}

/// Periodic sweep loop, spawned once at server startup
pub async fn run_sweeper(registry: Arc<SessionRegistry>) {
    let mut interval = tokio::time::interval(registry.config().sweep_interval);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        interval.tick().await;
        registry.sweep(Instant::now()).await;
    }
}
