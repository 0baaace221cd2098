/**
 * Annotation Reconciler
 *
 * Resolves the "optimistic local insert vs. authoritative echo" problem so
 * a client never renders the same user-authored annotation twice.
 *
 * # Protocol
 *
 * On a local ADD the reconciler assigns a provisional (negative) id, the
 * record is rendered immediately, and a `PendingOperationKey` for it is
 * remembered. When the broadcast echo of that action comes back from the
 * server, matched structurally and only for messages authored by the
 * local user, the provisional record is replaced by the authoritative one
 * and the provisional id is discarded. An echo with no matching pending
 * entry is a legitimate new record from another source, not an error.
 *
 * UPDATE and DELETE need no reconciliation: by the time a user can touch a
 * record it already carries its authoritative id.
 *
 * # Known Gap
 *
 * Two structurally identical ADDs in quick succession produce an ambiguous
 * match. A per-client operation counter in the key would disambiguate;
 * until then the pending entries simply expire after a short timeout.
 */
use std::collections::HashMap;
use std::time::{Duration, Instant};

use crate::shared::message::{ActionType, SyncMessage};
use crate::shared::model::{AnnotationBody, AnnotationRecord};

/// Default lifetime of an unmatched pending entry
pub const DEFAULT_PENDING_TTL: Duration = Duration::from_secs(10);

/// Structural identity of a locally-originated annotation operation
///
/// Hashes (page, snippet, color-or-text, geometry). Geometry is quantized
/// to 1e-6 bins so `f64` values survive a JSON round trip without breaking
/// equality.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PendingOperationKey {
    page: i32,
    snippet: String,
    content: String,
    geometry: [i64; 4],
}

impl PendingOperationKey {
    pub fn from_record(record: &AnnotationRecord) -> Self {
        let content = match &record.body {
            AnnotationBody::Highlight { color } => color.clone(),
            AnnotationBody::Comment { text } => text.clone(),
        };
        let c = record.coordinates;
        Self {
            page: record.page,
            snippet: record.snippet.clone(),
            content,
            geometry: [
                quantize(c.start_x),
                quantize(c.start_y),
                quantize(c.end_x),
                quantize(c.end_y),
            ],
        }
    }
}

fn quantize(v: f64) -> i64 {
    (v * 1_000_000.0).round() as i64
}

/// How an inbound ADD echo resolved against the pending table
#[derive(Debug, Clone, PartialEq)]
pub enum EchoResolution {
    /// Our own pending record: drop the provisional id, keep the
    /// authoritative record
    Replaced {
        provisional_id: i64,
        record: AnnotationRecord,
    },
    /// A record we had nothing pending for: insert as new
    New { record: AnnotationRecord },
    /// Not a well-formed ADD; nothing to do
    Ignored,
}

#[derive(Debug)]
struct PendingEntry {
    provisional_id: i64,
    created_at: Instant,
}

/// Client-side reconciliation of optimistic inserts against server echoes
#[derive(Debug)]
pub struct Reconciler {
    local_user: String,
    pending: HashMap<PendingOperationKey, PendingEntry>,
    /// Descending counter for provisional ids; always negative, never reused
    next_provisional: i64,
    ttl: Duration,
}

impl Reconciler {
    pub fn new(local_user: impl Into<String>) -> Self {
        Self {
            local_user: local_user.into(),
            pending: HashMap::new(),
            next_provisional: -1,
            ttl: DEFAULT_PENDING_TTL,
        }
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    /// Number of unmatched pending operations
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Stamp a locally-created record with a provisional id and remember it
    ///
    /// The record can be rendered immediately; the returned id is what the
    /// matching echo will later replace.
    pub fn register_local(&mut self, record: &mut AnnotationRecord, now: Instant) -> i64 {
        let provisional_id = self.next_provisional;
        self.next_provisional -= 1;
        record.id = provisional_id;
        record.author_id = self.local_user.clone();
        self.pending.insert(
            PendingOperationKey::from_record(record),
            PendingEntry {
                provisional_id,
                created_at: now,
            },
        );
        provisional_id
    }

    /// Resolve an inbound ADD broadcast against the pending table
    ///
    /// Matching is scoped to messages whose sender is the local user; other
    /// participants' ADDs are always `New`.
    pub fn resolve_echo(&mut self, msg: &SyncMessage) -> EchoResolution {
        if msg.action_type != ActionType::Add {
            return EchoResolution::Ignored;
        }
        let Some(record) = msg.annotation_record() else {
            return EchoResolution::Ignored;
        };
        if record.id <= 0 {
            // An echo without an authoritative id is malformed
            return EchoResolution::Ignored;
        }
        if msg.sender_id != self.local_user {
            return EchoResolution::New { record };
        }
        let key = PendingOperationKey::from_record(&record);
        match self.pending.remove(&key) {
            Some(entry) => EchoResolution::Replaced {
                provisional_id: entry.provisional_id,
                record,
            },
            // A miss is legitimate: e.g. the pending entry already expired
            None => EchoResolution::New { record },
        }
    }

    /// Drop pending entries older than the TTL; returns the dropped
    /// provisional ids so callers can clean up their local copies
    pub fn expire(&mut self, now: Instant) -> Vec<i64> {
        let ttl = self.ttl;
        let mut expired = Vec::new();
        self.pending.retain(|_, entry| {
            if now.duration_since(entry.created_at) >= ttl {
                expired.push(entry.provisional_id);
                false
            } else {
                true
            }
        });
        expired
    }
}
