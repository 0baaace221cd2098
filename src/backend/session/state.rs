/**
 * Authoritative Session State
 *
 * One `SessionState` is the single authoritative record for one reading
 * session (room): roster, current leader, reading mode, current page,
 * per-user reading progress and the live annotation set.
 *
 * # Single-Writer Semantics
 *
 * `SessionState` itself is plain data with a pure-ish `apply` function.
 * Serialization of concurrent writers is the registry's job: every mutation
 * goes through the session's `tokio::sync::Mutex`, so no two actions touch
 * the same session concurrently and all observers agree on one total order.
 *
 * # Protocol Violations
 *
 * A PAGE_MOVE from a non-leader, or a READING_MODE_CHANGE from a
 * non-leader, is silently dropped (debug log only). These arise from normal
 * races during leadership handover and are not errors.
 */
use std::collections::{BTreeMap, HashMap};
use std::time::Instant;

use crate::shared::message::{ActionType, AnnotationType, ParticipantsSnapshot, SyncMessage};
use crate::shared::model::{AnnotationRecord, Participant, ReadingMode};

/// Sender id used on broadcasts the coordinator originates itself
/// (automatic demotion, leave-triggered replacement).
pub const SYSTEM_SENDER: &str = "@system";

/// Result of applying one action to a session
///
/// `reply` goes only to the originating stream (currently the snapshot on
/// JOIN); `broadcast` goes to every open stream of the session, the sender
/// included: the echo carries the authoritative annotation id that the
/// client-side reconciler needs.
#[derive(Debug, Default)]
pub struct ApplyOutcome {
    pub reply: Option<SyncMessage>,
    pub broadcast: Vec<SyncMessage>,
}

impl ApplyOutcome {
    fn dropped() -> Self {
        Self::default()
    }

    fn broadcast(msg: SyncMessage) -> Self {
        Self {
            reply: None,
            broadcast: vec![msg],
        }
    }
}

/// Authoritative per-session state record
#[derive(Debug)]
pub struct SessionState {
    pub session_id: i64,
    pub current_page: i32,
    pub reading_mode: ReadingMode,
    pub leader_id: Option<String>,
    pub participants: HashMap<String, Participant>,
    /// Live annotation set keyed by authoritative id
    pub annotations: BTreeMap<i64, AnnotationRecord>,
    /// Source of authoritative annotation ids
    next_annotation_id: i64,
    /// Source of deterministic join-order tie-break values
    next_join_order: u64,
    /// The participant that created the session; immutable once set
    original_host: Option<String>,
    /// Last time each participant was heard from (any inbound traffic)
    last_seen: HashMap<String, Instant>,
    /// Set when the last online participant goes offline, cleared on JOIN.
    /// Drives idle-session reaping.
    pub idle_since: Option<Instant>,
}

impl SessionState {
    pub fn new(session_id: i64) -> Self {
        Self {
            session_id,
            current_page: 1,
            reading_mode: ReadingMode::default(),
            leader_id: None,
            participants: HashMap::new(),
            annotations: BTreeMap::new(),
            next_annotation_id: 1,
            next_join_order: 0,
            original_host: None,
            last_seen: HashMap::new(),
            idle_since: None,
        }
    }

    /// The participant that created the session, if any have joined yet
    pub fn original_host(&self) -> Option<&str> {
        self.original_host.as_deref()
    }

    /// Record inbound traffic from a participant for liveness tracking
    pub fn touch(&mut self, user_id: &str, now: Instant) {
        if self.participants.contains_key(user_id) {
            self.last_seen.insert(user_id.to_string(), now);
        }
    }

    /// How long ago the given participant was last heard from
    pub fn last_seen(&self, user_id: &str) -> Option<Instant> {
        self.last_seen.get(user_id).copied()
    }

    /// Whether any participant is currently online
    pub fn any_online(&self) -> bool {
        self.participants.values().any(|p| p.is_online)
    }

    /// Process a JOIN for `user_id`, creating the participant on first sight
    ///
    /// The first participant to ever join becomes the original host. A
    /// joiner is promoted to leader only when the session is leaderless and
    /// the joiner is the original host; otherwise leadership stays unset
    /// until chosen explicitly.
    pub fn join(&mut self, user_id: &str, display_name: &str, now: Instant) -> ApplyOutcome {
        let is_first = self.original_host.is_none();
        if is_first {
            self.original_host = Some(user_id.to_string());
        }

        match self.participants.get_mut(user_id) {
            Some(existing) => {
                existing.is_online = true;
                if !display_name.is_empty() {
                    existing.display_name = display_name.to_string();
                }
            }
            None => {
                let order = self.next_join_order;
                self.next_join_order += 1;
                self.participants.insert(
                    user_id.to_string(),
                    Participant::new(
                        user_id.to_string(),
                        display_name.to_string(),
                        is_first,
                        order,
                    ),
                );
            }
        }
        self.last_seen.insert(user_id.to_string(), now);
        self.idle_since = None;

        let mut broadcast = Vec::new();
        if self.leader_id.is_none() && self.original_host.as_deref() == Some(user_id) {
            if let Some(msg) = self.assign_leader(Some(user_id.to_string()), SYSTEM_SENDER) {
                broadcast.push(msg);
            }
        }

        // Others get an incremental online-status update; the joining stream
        // gets the full snapshot as a direct reply.
        broadcast.push(SyncMessage::join(self.session_id, user_id));

        let mut reply = SyncMessage::new(self.session_id, user_id, ActionType::ParticipantsSnapshot);
        reply.snapshot = Some(self.snapshot());
        ApplyOutcome {
            reply: Some(reply),
            broadcast,
        }
    }

    /// Mark a participant offline, either on deliberate LEAVE or on
    /// connection loss. The participant record is kept; only the session
    /// itself ever deletes it.
    ///
    /// A leaving leader is replaced immediately rather than waiting out the
    /// grace period.
    pub fn mark_offline(&mut self, user_id: &str, now: Instant) -> ApplyOutcome {
        let Some(participant) = self.participants.get_mut(user_id) else {
            return ApplyOutcome::dropped();
        };
        if !participant.is_online {
            return ApplyOutcome::dropped();
        }
        participant.is_online = false;
        self.last_seen.remove(user_id);

        let mut broadcast = vec![SyncMessage::leave(self.session_id, user_id)];
        if self.leader_id.as_deref() == Some(user_id) {
            let replacement = super::leadership::select_replacement(self, user_id);
            if let Some(msg) = self.assign_leader(replacement, SYSTEM_SENDER) {
                broadcast.push(msg);
            }
        }
        if !self.any_online() {
            self.idle_since = Some(now);
        }
        ApplyOutcome {
            reply: None,
            broadcast,
        }
    }

    /// Apply a validated inbound action to this session
    ///
    /// The caller has already checked that the sender is a member of the
    /// session. JOIN and LEAVE are routed through `join`/`mark_offline` by
    /// the stream handler and are treated as re-join / deliberate leave
    /// here.
    pub fn apply(&mut self, msg: &SyncMessage, now: Instant) -> ApplyOutcome {
        self.touch(&msg.sender_id, now);
        match msg.action_type {
            ActionType::Join => self.join(&msg.sender_id, "", now),
            ActionType::Leave => self.mark_offline(&msg.sender_id, now),
            ActionType::PageMove => self.apply_page_move(msg),
            ActionType::ReadingModeChange => self.apply_reading_mode_change(msg),
            ActionType::ProgressUpdate => self.apply_progress_update(msg),
            ActionType::Add => self.apply_add(msg),
            ActionType::Update => self.apply_update(msg),
            ActionType::Delete => self.apply_delete(msg),
            ActionType::LeadershipTransfer => super::leadership::handle_transfer(self, msg),
            ActionType::ParticipantsSnapshot => {
                // Server-originated only; a client sending one is dropped.
                tracing::debug!(
                    session_id = self.session_id,
                    sender = %msg.sender_id,
                    "dropping client-sent PARTICIPANTS_SNAPSHOT"
                );
                ApplyOutcome::dropped()
            }
        }
    }

    /// PAGE_MOVE: only the leader may drive the page, and only in FOLLOW mode
    fn apply_page_move(&mut self, msg: &SyncMessage) -> ApplyOutcome {
        if self.reading_mode != ReadingMode::Follow
            || self.leader_id.as_deref() != Some(msg.sender_id.as_str())
        {
            // Not an error: stale movers are expected during handover
            tracing::debug!(
                session_id = self.session_id,
                sender = %msg.sender_id,
                "dropping PAGE_MOVE from non-leader or non-FOLLOW session"
            );
            return ApplyOutcome::dropped();
        }
        self.current_page = msg.payload.page;
        ApplyOutcome::broadcast(msg.clone())
    }

    /// READING_MODE_CHANGE: accepted only from the current leader
    fn apply_reading_mode_change(&mut self, msg: &SyncMessage) -> ApplyOutcome {
        if self.leader_id.as_deref() != Some(msg.sender_id.as_str()) {
            tracing::debug!(
                session_id = self.session_id,
                sender = %msg.sender_id,
                "dropping READING_MODE_CHANGE from non-leader"
            );
            return ApplyOutcome::dropped();
        }
        let Some(mode) = msg.payload.reading_mode else {
            return ApplyOutcome::dropped();
        };
        self.reading_mode = mode;
        ApplyOutcome::broadcast(msg.clone())
    }

    /// PROGRESS_UPDATE: max-read-page never decreases, even with
    /// out-of-order delivery
    fn apply_progress_update(&mut self, msg: &SyncMessage) -> ApplyOutcome {
        let Some(participant) = self.participants.get_mut(&msg.sender_id) else {
            return ApplyOutcome::dropped();
        };
        if msg.payload.page <= participant.max_read_page {
            return ApplyOutcome::dropped();
        }
        participant.max_read_page = msg.payload.page;
        ApplyOutcome::broadcast(msg.clone())
    }

    /// ADD: assign the authoritative id and echo it to everyone, the sender
    /// included. The echo is what the client-side reconciler matches against
    /// its provisional record.
    fn apply_add(&mut self, msg: &SyncMessage) -> ApplyOutcome {
        let Some(mut record) = msg.annotation_record() else {
            tracing::debug!(
                session_id = self.session_id,
                sender = %msg.sender_id,
                "dropping malformed annotation ADD"
            );
            return ApplyOutcome::dropped();
        };
        if !record.coordinates.is_normalized() {
            tracing::debug!(
                session_id = self.session_id,
                sender = %msg.sender_id,
                "dropping ADD with out-of-range geometry"
            );
            return ApplyOutcome::dropped();
        }
        record.id = self.next_annotation_id;
        self.next_annotation_id += 1;
        self.annotations.insert(record.id, record.clone());

        let mut echo = msg.clone();
        echo.payload.id = Some(record.id);
        ApplyOutcome::broadcast(echo)
    }

    /// UPDATE: comment text only, addressed by authoritative id, author-only
    fn apply_update(&mut self, msg: &SyncMessage) -> ApplyOutcome {
        let (Some(id), Some(text)) = (msg.payload.id, msg.payload.text.as_ref()) else {
            return ApplyOutcome::dropped();
        };
        let Some(record) = self.annotations.get_mut(&id) else {
            return ApplyOutcome::dropped();
        };
        if record.author_id != msg.sender_id {
            tracing::debug!(
                session_id = self.session_id,
                sender = %msg.sender_id,
                id,
                "dropping UPDATE from non-author"
            );
            return ApplyOutcome::dropped();
        }
        match &mut record.body {
            crate::shared::model::AnnotationBody::Comment { text: t } => {
                *t = text.clone();
            }
            crate::shared::model::AnnotationBody::Highlight { .. } => {
                // Only comment text is mutable in place
                return ApplyOutcome::dropped();
            }
        }
        ApplyOutcome::broadcast(msg.clone())
    }

    /// DELETE: by authoritative id, author-only
    fn apply_delete(&mut self, msg: &SyncMessage) -> ApplyOutcome {
        let Some(id) = msg.payload.id else {
            return ApplyOutcome::dropped();
        };
        match self.annotations.get(&id) {
            Some(record) if record.author_id == msg.sender_id => {
                self.annotations.remove(&id);
                ApplyOutcome::broadcast(msg.clone())
            }
            _ => ApplyOutcome::dropped(),
        }
    }

    /// Atomically reassign the leader and produce the broadcast announcing it
    ///
    /// Recomputes every participant's `is_current_leader` flag so the roster
    /// and `leader_id` can never disagree. Returns `None` when nothing
    /// changed.
    pub fn assign_leader(
        &mut self,
        new_leader: Option<String>,
        sender: &str,
    ) -> Option<SyncMessage> {
        if self.leader_id == new_leader {
            return None;
        }
        self.leader_id = new_leader.clone();
        for participant in self.participants.values_mut() {
            participant.is_current_leader =
                new_leader.as_deref() == Some(participant.user_id.as_str());
        }
        debug_assert!(
            self.participants
                .values()
                .filter(|p| p.is_current_leader)
                .count()
                <= 1,
            "session {} has more than one leader",
            self.session_id
        );

        let mut msg = SyncMessage::new(self.session_id, sender, ActionType::LeadershipTransfer);
        msg.annotation_type = AnnotationType::None;
        msg.target_user_id = new_leader;
        Some(msg)
    }

    /// Full snapshot of the authoritative state, as sent to a joining stream
    pub fn snapshot(&self) -> ParticipantsSnapshot {
        let mut participants: Vec<Participant> = self.participants.values().cloned().collect();
        participants.sort_by_key(|p| p.join_order);
        ParticipantsSnapshot {
            online_by_user: participants
                .iter()
                .map(|p| (p.user_id.clone(), p.is_online))
                .collect(),
            progress_by_user: participants
                .iter()
                .map(|p| (p.user_id.clone(), p.max_read_page))
                .collect(),
            participants,
            reading_mode: self.reading_mode,
            current_page: self.current_page,
            annotations: self.annotations.values().cloned().collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shared::model::{AnnotationBody, Coordinates};

    fn now() -> Instant {
        Instant::now()
    }

    /// A session with host "a" and member "b", leader "a", FOLLOW mode
    fn follow_session() -> SessionState {
        let mut state = SessionState::new(1);
        state.join("a", "Alice", now());
        state.join("b", "Bob", now());
        let change = SyncMessage::reading_mode_change(1, "a", ReadingMode::Follow);
        assert_eq!(state.apply(&change, now()).broadcast.len(), 1);
        state
    }

    fn add_highlight(sender: &str, page: i32) -> SyncMessage {
        let record = AnnotationRecord {
            id: -1,
            page,
            snippet: "anchor".into(),
            body: AnnotationBody::Highlight {
                color: "#FFFF00".into(),
            },
            coordinates: Coordinates::new(0.1, 0.2, 0.3, 0.4),
            author_id: sender.into(),
        };
        SyncMessage::annotation_add(1, sender, &record)
    }

    #[test]
    fn test_first_joiner_is_host_and_leader() {
        let mut state = SessionState::new(1);
        let outcome = state.join("a", "Alice", now());
        assert!(outcome.reply.is_some());
        assert_eq!(state.original_host(), Some("a"));
        assert_eq!(state.leader_id.as_deref(), Some("a"));
        assert!(state.participants["a"].is_original_host);
        assert!(state.participants["a"].is_current_leader);
    }

    #[test]
    fn test_second_joiner_is_not_promoted() {
        let mut state = SessionState::new(1);
        state.join("a", "Alice", now());
        state.join("b", "Bob", now());
        assert_eq!(state.leader_id.as_deref(), Some("a"));
        assert!(!state.participants["b"].is_current_leader);
        assert!(!state.participants["b"].is_original_host);
    }

    #[test]
    fn test_non_host_first_join_leaves_session_leaderless_until_host_returns() {
        let mut state = SessionState::new(1);
        state.join("a", "Alice", now());
        state.mark_offline("a", now());
        state.mark_offline("a", now()); // idempotent
        // Only "a" was a member, so the leaderless session stays leaderless
        assert_eq!(state.leader_id, None);
        state.join("b", "Bob", now());
        assert_eq!(state.leader_id, None);
        // The original host rejoining is auto-promoted
        state.join("a", "Alice", now());
        assert_eq!(state.leader_id.as_deref(), Some("a"));
    }

    #[test]
    fn test_rejoin_marks_online_without_duplicating() {
        let mut state = SessionState::new(1);
        state.join("a", "Alice", now());
        state.join("b", "Bob", now());
        state.mark_offline("b", now());
        assert!(!state.participants["b"].is_online);
        state.join("b", "Bob", now());
        assert!(state.participants["b"].is_online);
        assert_eq!(state.participants.len(), 2);
        assert_eq!(state.participants["b"].join_order, 1);
    }

    #[test]
    fn test_page_move_from_leader_in_follow_mode() {
        let mut state = follow_session();
        let outcome = state.apply(&SyncMessage::page_move(1, "a", 7), now());
        assert_eq!(outcome.broadcast.len(), 1);
        assert_eq!(state.current_page, 7);
    }

    #[test]
    fn test_page_move_from_follower_is_dropped() {
        let mut state = follow_session();
        let outcome = state.apply(&SyncMessage::page_move(1, "b", 9), now());
        assert!(outcome.broadcast.is_empty());
        assert_eq!(state.current_page, 1);
    }

    #[test]
    fn test_page_move_in_free_mode_is_dropped() {
        let mut state = SessionState::new(1);
        state.join("a", "Alice", now());
        assert_eq!(state.reading_mode, ReadingMode::Free);
        let outcome = state.apply(&SyncMessage::page_move(1, "a", 7), now());
        assert!(outcome.broadcast.is_empty());
        assert_eq!(state.current_page, 1);
    }

    #[test]
    fn test_reading_mode_change_from_non_leader_is_dropped() {
        let mut state = follow_session();
        let change = SyncMessage::reading_mode_change(1, "b", ReadingMode::Free);
        let outcome = state.apply(&change, now());
        assert!(outcome.broadcast.is_empty());
        assert_eq!(state.reading_mode, ReadingMode::Follow);
    }

    #[test]
    fn test_progress_is_monotonic() {
        let mut state = follow_session();
        state.apply(&SyncMessage::progress_update(1, "b", 5), now());
        assert_eq!(state.participants["b"].max_read_page, 5);
        // Out-of-order delivery must not regress progress
        let outcome = state.apply(&SyncMessage::progress_update(1, "b", 3), now());
        assert!(outcome.broadcast.is_empty());
        assert_eq!(state.participants["b"].max_read_page, 5);
        state.apply(&SyncMessage::progress_update(1, "b", 8), now());
        assert_eq!(state.participants["b"].max_read_page, 8);
    }

    #[test]
    fn test_add_assigns_sequential_authoritative_ids() {
        let mut state = follow_session();
        let first = state.apply(&add_highlight("b", 7), now());
        let second = state.apply(&add_highlight("b", 8), now());
        assert_eq!(first.broadcast[0].payload.id, Some(1));
        assert_eq!(second.broadcast[0].payload.id, Some(2));
        assert_eq!(state.annotations.len(), 2);
    }

    #[test]
    fn test_add_with_out_of_range_geometry_is_dropped() {
        let mut state = follow_session();
        let record = AnnotationRecord {
            id: -1,
            page: 2,
            snippet: "s".into(),
            body: AnnotationBody::Highlight {
                color: "#FFFF00".into(),
            },
            coordinates: Coordinates::new(0.1, 0.2, 1.5, 0.4),
            author_id: "b".into(),
        };
        let outcome = state.apply(&SyncMessage::annotation_add(1, "b", &record), now());
        assert!(outcome.broadcast.is_empty());
        assert!(state.annotations.is_empty());
    }

    #[test]
    fn test_echo_goes_back_with_id() {
        let mut state = follow_session();
        let outcome = state.apply(&add_highlight("b", 7), now());
        let echo = &outcome.broadcast[0];
        // The echo keeps the original sender so the reconciler can scope
        // matching to its own messages
        assert_eq!(echo.sender_id, "b");
        assert!(echo.payload.id.is_some());
    }

    #[test]
    fn test_update_comment_text_author_only() {
        let mut state = follow_session();
        let comment = AnnotationRecord {
            id: -1,
            page: 2,
            snippet: "s".into(),
            body: AnnotationBody::Comment { text: "v1".into() },
            coordinates: Coordinates::new(0.0, 0.0, 0.1, 0.1),
            author_id: "b".into(),
        };
        let added = state.apply(&SyncMessage::annotation_add(1, "b", &comment), now());
        let id = added.broadcast[0].payload.id.unwrap();

        // Non-author update dropped
        let outcome = state.apply(&SyncMessage::annotation_update(1, "a", id, "evil"), now());
        assert!(outcome.broadcast.is_empty());

        let outcome = state.apply(&SyncMessage::annotation_update(1, "b", id, "v2"), now());
        assert_eq!(outcome.broadcast.len(), 1);
        assert_eq!(
            state.annotations[&id].body,
            AnnotationBody::Comment { text: "v2".into() }
        );
    }

    #[test]
    fn test_delete_author_only() {
        let mut state = follow_session();
        let added = state.apply(&add_highlight("b", 7), now());
        let id = added.broadcast[0].payload.id.unwrap();

        let outcome = state.apply(&SyncMessage::annotation_delete(1, "a", id), now());
        assert!(outcome.broadcast.is_empty());
        assert_eq!(state.annotations.len(), 1);

        let outcome = state.apply(&SyncMessage::annotation_delete(1, "b", id), now());
        assert_eq!(outcome.broadcast.len(), 1);
        assert!(state.annotations.is_empty());
    }

    #[test]
    fn test_leaving_leader_is_replaced_immediately() {
        let mut state = follow_session();
        let outcome = state.mark_offline("a", now());
        // Broadcasts: the LEAVE plus the leadership reassignment
        assert_eq!(outcome.broadcast.len(), 2);
        assert_eq!(state.leader_id.as_deref(), Some("b"));
        assert!(state.participants["b"].is_current_leader);
        assert!(!state.participants["a"].is_current_leader);
    }

    #[test]
    fn test_last_leave_sets_idle_and_clears_leader() {
        let mut state = follow_session();
        state.mark_offline("a", now());
        let t = now();
        state.mark_offline("b", t);
        assert_eq!(state.leader_id, None);
        assert_eq!(state.idle_since, Some(t));
        // Roster survives: participants are deleted only with the session
        assert_eq!(state.participants.len(), 2);
    }

    #[test]
    fn test_snapshot_reflects_full_state() {
        let mut state = follow_session();
        state.apply(&SyncMessage::page_move(1, "a", 7), now());
        state.apply(&add_highlight("b", 7), now());
        state.apply(&SyncMessage::progress_update(1, "b", 7), now());

        let snapshot = state.snapshot();
        assert_eq!(snapshot.current_page, 7);
        assert_eq!(snapshot.reading_mode, ReadingMode::Follow);
        assert_eq!(snapshot.participants.len(), 2);
        assert_eq!(snapshot.annotations.len(), 1);
        assert_eq!(snapshot.progress_by_user["b"], 7);
        assert_eq!(snapshot.online_by_user["a"], true);
        // Join order is preserved for deterministic rendering
        assert_eq!(snapshot.participants[0].user_id, "a");
    }

    #[test]
    fn test_leader_uniqueness_across_transitions() {
        let mut state = follow_session();
        for action in [
            SyncMessage::leadership_transfer(1, "a", "b"),
            SyncMessage::leadership_transfer(1, "b", "a"),
            SyncMessage::page_move(1, "a", 3),
        ] {
            state.apply(&action, now());
            let leaders = state
                .participants
                .values()
                .filter(|p| p.is_current_leader)
                .count();
            assert!(leaders <= 1);
        }
    }
}
