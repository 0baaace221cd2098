/**
 * Leadership Coordinator
 *
 * Owns the rules for who may drive FOLLOW-mode page position:
 *
 * - **Explicit transfer**: only the current leader may hand leadership to a
 *   named target, which must be an online member.
 * - **Explicit claim**: when the session is leaderless, any online member
 *   may claim leadership by targeting itself.
 * - **Automatic demotion**: a leader that has gone silent beyond the grace
 *   period is demoted by the registry's background sweep; the replacement
 *   is the first other online participant by join order (deterministic).
 *
 * Liveness is heartbeat-driven: "backgrounded" or "gone" simply means the
 * participant's last-seen timestamp exceeded the grace period. All
 * reassignment happens while the session lock is held, so the at-most-one-
 * leader invariant can never be observed violated.
 */
use std::time::{Duration, Instant};

use crate::backend::session::state::{ApplyOutcome, SessionState, SYSTEM_SENDER};
use crate::shared::message::SyncMessage;

/// Select a replacement leader, excluding `departing`
///
/// Policy: first other participant still online, tie-broken by join order.
/// Returns `None` when nobody else is online; the session then reverts to
/// leaderless and FOLLOW pushes are suspended.
pub fn select_replacement(state: &SessionState, departing: &str) -> Option<String> {
    state
        .participants
        .values()
        .filter(|p| p.is_online && p.user_id != departing)
        .min_by_key(|p| p.join_order)
        .map(|p| p.user_id.clone())
}

/// Handle a LEADERSHIP_TRANSFER action
///
/// Invalid requests are rejected without any state change; the requester
/// sees no broadcast, which clients surface as a soft warning.
pub fn handle_transfer(state: &mut SessionState, msg: &SyncMessage) -> ApplyOutcome {
    let Some(target) = msg.target_user_id.as_deref() else {
        tracing::debug!(
            session_id = state.session_id,
            sender = %msg.sender_id,
            "dropping LEADERSHIP_TRANSFER without target"
        );
        return ApplyOutcome::default();
    };

    let sender_is_leader = state.leader_id.as_deref() == Some(msg.sender_id.as_str());
    let is_claim = state.leader_id.is_none() && target == msg.sender_id;
    if !sender_is_leader && !is_claim {
        tracing::debug!(
            session_id = state.session_id,
            sender = %msg.sender_id,
            target,
            "dropping LEADERSHIP_TRANSFER from non-leader"
        );
        return ApplyOutcome::default();
    }

    match state.participants.get(target) {
        Some(p) if p.is_online => {}
        Some(_) => {
            tracing::warn!(
                session_id = state.session_id,
                target,
                "rejecting leadership transfer to offline target"
            );
            return ApplyOutcome::default();
        }
        None => {
            tracing::warn!(
                session_id = state.session_id,
                target,
                "rejecting leadership transfer to non-member"
            );
            return ApplyOutcome::default();
        }
    }

    match state.assign_leader(Some(target.to_string()), &msg.sender_id) {
        Some(broadcast) => ApplyOutcome {
            reply: None,
            broadcast: vec![broadcast],
        },
        None => ApplyOutcome::default(),
    }
}

/// Demote the leader if it has been silent beyond the grace period
///
/// Called by the registry's periodic sweep with the session lock held.
/// Returns the reassignment broadcast when a demotion happened.
pub fn demote_if_stale(
    state: &mut SessionState,
    now: Instant,
    grace: Duration,
) -> Option<SyncMessage> {
    let leader = state.leader_id.clone()?;
    let stale = match state.last_seen(&leader) {
        Some(seen) => now.duration_since(seen) > grace,
        // No liveness record at all (e.g. marked offline): treat as stale
        None => true,
    };
    if !stale {
        return None;
    }

    let replacement = select_replacement(state, &leader);
    tracing::info!(
        session_id = state.session_id,
        old_leader = %leader,
        new_leader = replacement.as_deref().unwrap_or("<none>"),
        "demoting silent leader"
    );
    state.assign_leader(replacement, SYSTEM_SENDER)
}
