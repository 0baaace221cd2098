/**
 * Local Session View
 *
 * The client's materialized copy of the session: current page, reading
 * mode, leader, roster and annotation list. It is updated only by the
 * connection's dispatch loop, which feeds every inbound `SyncMessage`
 * through `apply_message` and republishes the resulting `SyncEvent`s.
 *
 * Locally-originated ADDs go through `add_local`, which renders a
 * provisional record immediately; the reconciler swaps it for the
 * authoritative copy when the echo arrives, so the same annotation is never
 * shown twice.
 */
use std::collections::{BTreeMap, HashMap};
use std::time::Instant;

use crate::client::events::SyncEvent;
use crate::client::reconciler::{EchoResolution, Reconciler};
use crate::shared::message::{ActionType, SyncMessage};
use crate::shared::model::{
    AnnotationBody, AnnotationRecord, Coordinates, Participant, ReadingMode,
};

/// Client-side view of one session
#[derive(Debug)]
pub struct ClientSessionState {
    pub session_id: i64,
    pub local_user: String,
    pub current_page: i32,
    pub reading_mode: ReadingMode,
    pub leader_id: Option<String>,
    pub participants: HashMap<String, Participant>,
    /// Local annotation view, keyed by id (negative while provisional)
    pub annotations: BTreeMap<i64, AnnotationRecord>,
    reconciler: Reconciler,
}

impl ClientSessionState {
    pub fn new(session_id: i64, local_user: impl Into<String>) -> Self {
        let local_user = local_user.into();
        Self {
            session_id,
            reconciler: Reconciler::new(local_user.clone()),
            local_user,
            current_page: 1,
            reading_mode: ReadingMode::default(),
            leader_id: None,
            participants: HashMap::new(),
            annotations: BTreeMap::new(),
        }
    }

    /// Whether the local user currently leads the session
    pub fn is_leader(&self) -> bool {
        self.leader_id.as_deref() == Some(self.local_user.as_str())
    }

    /// Optimistically insert a locally-created annotation
    ///
    /// Returns the provisional id, the upstream ADD to send, and the events
    /// to publish. The record is visible immediately under its provisional
    /// id.
    pub fn add_local(
        &mut self,
        page: i32,
        snippet: impl Into<String>,
        body: AnnotationBody,
        coordinates: Coordinates,
        now: Instant,
    ) -> (i64, SyncMessage, Vec<SyncEvent>) {
        let mut record = AnnotationRecord {
            id: 0,
            page,
            snippet: snippet.into(),
            body,
            coordinates,
            author_id: self.local_user.clone(),
        };
        let provisional_id = self.reconciler.register_local(&mut record, now);
        let upstream = SyncMessage::annotation_add(self.session_id, &self.local_user, &record);
        let events = vec![SyncEvent::AnnotationAdded(record.clone())];
        self.annotations.insert(record.id, record);
        (provisional_id, upstream, events)
    }

    /// Apply one inbound message to the local view
    pub fn apply_message(&mut self, msg: &SyncMessage, _now: Instant) -> Vec<SyncEvent> {
        match msg.action_type {
            ActionType::ParticipantsSnapshot => self.apply_snapshot(msg),
            ActionType::PageMove => {
                self.current_page = msg.payload.page;
                vec![SyncEvent::PageChanged {
                    page: msg.payload.page,
                    scale: msg.payload.scale,
                }]
            }
            ActionType::ReadingModeChange => match msg.payload.reading_mode {
                Some(mode) => {
                    self.reading_mode = mode;
                    vec![SyncEvent::ReadingModeChanged(mode)]
                }
                None => Vec::new(),
            },
            ActionType::Join => {
                self.participants
                    .entry(msg.sender_id.clone())
                    .and_modify(|p| p.is_online = true)
                    .or_insert_with(|| {
                        // Placeholder until the next snapshot fills in
                        // display attributes
                        Participant::new(
                            msg.sender_id.clone(),
                            msg.sender_id.clone(),
                            false,
                            u64::MAX,
                        )
                    });
                vec![SyncEvent::ParticipantJoined {
                    user_id: msg.sender_id.clone(),
                }]
            }
            ActionType::Leave => {
                if let Some(p) = self.participants.get_mut(&msg.sender_id) {
                    p.is_online = false;
                }
                vec![SyncEvent::ParticipantLeft {
                    user_id: msg.sender_id.clone(),
                }]
            }
            ActionType::ProgressUpdate => {
                if let Some(p) = self.participants.get_mut(&msg.sender_id) {
                    p.max_read_page = p.max_read_page.max(msg.payload.page);
                }
                vec![SyncEvent::ProgressChanged {
                    user_id: msg.sender_id.clone(),
                    page: msg.payload.page,
                }]
            }
            ActionType::LeadershipTransfer => {
                let leader_id = msg.target_user_id.clone();
                self.leader_id = leader_id.clone();
                for p in self.participants.values_mut() {
                    p.is_current_leader = leader_id.as_deref() == Some(p.user_id.as_str());
                }
                vec![SyncEvent::LeadershipChanged { leader_id }]
            }
            ActionType::Add => self.apply_add(msg),
            ActionType::Update => {
                let (Some(id), Some(text)) = (msg.payload.id, msg.payload.text.clone()) else {
                    return Vec::new();
                };
                match self.annotations.get_mut(&id) {
                    Some(record) => {
                        if let AnnotationBody::Comment { text: t } = &mut record.body {
                            *t = text.clone();
                        }
                        vec![SyncEvent::AnnotationUpdated { id, text }]
                    }
                    None => Vec::new(),
                }
            }
            ActionType::Delete => match msg.payload.id {
                Some(id) if self.annotations.remove(&id).is_some() => {
                    vec![SyncEvent::AnnotationRemoved {
                        id,
                        replaced_by: None,
                    }]
                }
                _ => Vec::new(),
            },
        }
    }

    /// Reconcile an inbound ADD against pending local inserts
    fn apply_add(&mut self, msg: &SyncMessage) -> Vec<SyncEvent> {
        match self.reconciler.resolve_echo(msg) {
            EchoResolution::Replaced {
                provisional_id,
                record,
            } => {
                self.annotations.remove(&provisional_id);
                let authoritative_id = record.id;
                self.annotations.insert(record.id, record.clone());
                vec![
                    SyncEvent::AnnotationRemoved {
                        id: provisional_id,
                        replaced_by: Some(authoritative_id),
                    },
                    SyncEvent::AnnotationAdded(record),
                ]
            }
            EchoResolution::New { record } => {
                self.annotations.insert(record.id, record.clone());
                vec![SyncEvent::AnnotationAdded(record)]
            }
            EchoResolution::Ignored => Vec::new(),
        }
    }

    /// Replace the whole view with a server snapshot (join or reconnect)
    ///
    /// Unconfirmed provisional records do not survive a snapshot: their
    /// upstream sends may have been lost with the old connection.
    fn apply_snapshot(&mut self, msg: &SyncMessage) -> Vec<SyncEvent> {
        let Some(snapshot) = &msg.snapshot else {
            return Vec::new();
        };
        self.current_page = snapshot.current_page;
        self.reading_mode = snapshot.reading_mode;
        self.participants = snapshot
            .participants
            .iter()
            .cloned()
            .map(|p| (p.user_id.clone(), p))
            .collect();
        self.leader_id = snapshot
            .participants
            .iter()
            .find(|p| p.is_current_leader)
            .map(|p| p.user_id.clone());
        self.annotations = snapshot
            .annotations
            .iter()
            .cloned()
            .map(|a| (a.id, a))
            .collect();
        vec![SyncEvent::SnapshotApplied]
    }

    /// Drop provisional records whose pending entries timed out
    pub fn expire_pending(&mut self, now: Instant) -> Vec<SyncEvent> {
        self.reconciler
            .expire(now)
            .into_iter()
            .filter(|id| self.annotations.remove(id).is_some())
            .map(|id| SyncEvent::AnnotationRemoved {
                id,
                replaced_by: None,
            })
            .collect()
    }
}
