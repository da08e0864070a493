//! Track registry
//!
//! Maps track ids to live track handles for the rendering layer. Entries are
//! added and removed only by the session orchestration, in lockstep with the
//! owning producer or consumer. Readers get owned snapshots and can watch a
//! revision counter for changes.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tokio::sync::watch;
use tracing::debug;

use crate::media::TrackHandle;
use crate::types::{MediaKind, PeerId, TrackId};

/// Whether a track is published locally or received from a remote peer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackRole {
    Producer,
    Consumer,
}

/// Registered track
#[derive(Debug, Clone)]
pub struct TrackEntry {
    /// Same id as the owning producer or consumer
    pub id: TrackId,
    pub kind: MediaKind,
    pub role: TrackRole,
    /// Peer that owns the media (ourselves for producers)
    pub peer_id: PeerId,
    pub track: TrackHandle,
}

/// Process-wide track storage for one session
pub struct TrackRegistry {
    entries: RwLock<HashMap<TrackId, TrackEntry>>,
    revision: watch::Sender<u64>,
}

impl Default for TrackRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl TrackRegistry {
    #[must_use]
    pub fn new() -> Self {
        let (revision, _) = watch::channel(0);
        Self {
            entries: RwLock::new(HashMap::new()),
            revision,
        }
    }

    /// Insert an entry; last write wins for a duplicate id
    pub fn put(&self, entry: TrackEntry) -> Option<TrackEntry> {
        debug!(
            track_id = %entry.id,
            kind = %entry.kind,
            role = ?entry.role,
            peer_id = %entry.peer_id,
            "Registering track"
        );
        let previous = self.entries.write().insert(entry.id.clone(), entry);
        self.bump();
        previous
    }

    /// Track handle for `id`
    #[must_use]
    pub fn get(&self, id: &TrackId) -> Option<TrackHandle> {
        self.entries.read().get(id).map(|entry| entry.track.clone())
    }

    /// Full entry for `id`
    #[must_use]
    pub fn entry(&self, id: &TrackId) -> Option<TrackEntry> {
        self.entries.read().get(id).cloned()
    }

    /// Remove `id`; absent ids are a no-op
    pub fn remove(&self, id: &TrackId) -> Option<TrackEntry> {
        let removed = self.entries.write().remove(id);
        if removed.is_some() {
            debug!(track_id = %id, "Removed track");
            self.bump();
        }
        removed
    }

    /// Remove everything
    pub fn clear(&self) -> Vec<TrackEntry> {
        let removed: Vec<TrackEntry> = self.entries.write().drain().map(|(_, e)| e).collect();
        if !removed.is_empty() {
            self.bump();
        }
        removed
    }

    /// Owned copy of all entries, ordered by id
    #[must_use]
    pub fn snapshot(&self) -> Vec<TrackEntry> {
        let mut entries: Vec<TrackEntry> = self.entries.read().values().cloned().collect();
        entries.sort_by(|a, b| a.id.cmp(&b.id));
        entries
    }

    /// All video tracks, local and remote
    #[must_use]
    pub fn video_tracks(&self) -> Vec<TrackEntry> {
        self.snapshot()
            .into_iter()
            .filter(|entry| entry.kind == MediaKind::Video)
            .collect()
    }

    /// Remote audio tracks only; local audio is never played back
    #[must_use]
    pub fn audio_tracks(&self) -> Vec<TrackEntry> {
        self.snapshot()
            .into_iter()
            .filter(|entry| entry.kind == MediaKind::Audio && entry.role == TrackRole::Consumer)
            .collect()
    }

    #[must_use]
    pub fn ids(&self) -> Vec<TrackId> {
        let mut ids: Vec<TrackId> = self.entries.read().keys().cloned().collect();
        ids.sort();
        ids
    }

    #[must_use]
    pub fn contains(&self, id: &TrackId) -> bool {
        self.entries.read().contains_key(id)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Revision counter, bumped on every change
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.revision.subscribe()
    }

    fn bump(&self) {
        self.revision.send_modify(|rev| *rev = rev.wrapping_add(1));
    }
}
