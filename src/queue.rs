//! Persisted, per-session ordered track list.
//!
//! Positions are identifiers, not dense indices: they are handed out as
//! `max(position) + 1` over every row the session ever had, removal is a soft
//! delete that leaves the numbering alone, and shuffle only swaps positions
//! among entries that have not been played.

use chrono::Utc;
use rand::seq::SliceRandom;
use serde::Serialize;
use tracing::{debug, info};

use crate::audio::TrackInfo;
use crate::database::Database;
use crate::database::models::{NewQueueEntry, QueueEntry};
use crate::error::{MusicError, MusicResult};

/// Track to persist, as handed over by the engine or a front-end.
#[derive(Debug, Clone)]
pub struct NewTrack {
    pub info: TrackInfo,
    pub requested_by: String,
    pub is_cannabis_content: bool,
    pub metadata: serde_json::Value,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    pub total_tracks: i64,
    pub played_tracks: i64,
    pub unplayed_tracks: i64,
    pub estimated_playtime_minutes: i64,
}

#[derive(Clone)]
pub struct QueueStore {
    db: Database,
}

impl QueueStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Append a track after the highest position the session has used.
    pub fn enqueue(&self, session_id: i32, track: &NewTrack) -> MusicResult<QueueEntry> {
        self.insert(session_id, track, false)
    }

    /// Persist a track that already started playing, so it lands in history.
    pub fn record_started(&self, session_id: i32, track: &NewTrack) -> MusicResult<QueueEntry> {
        self.insert(session_id, track, true)
    }

    fn insert(&self, session_id: i32, track: &NewTrack, played: bool) -> MusicResult<QueueEntry> {
        let metadata = serde_json::to_string(&track.metadata)?;
        let entry = self.db.transaction(|conn| {
            let position = QueueEntry::max_position(conn, session_id)? + 1;
            let now = Utc::now().naive_utc();
            QueueEntry::insert(
                conn,
                &NewQueueEntry {
                    session_id,
                    position,
                    url: track.info.url.clone(),
                    title: track.info.title.clone(),
                    duration: track.info.duration_secs,
                    requested_by: track.requested_by.clone(),
                    source: track.info.source.clone(),
                    is_cannabis_content: track.is_cannabis_content,
                    metadata: metadata.clone(),
                    added_at: now,
                    played_at: played.then_some(now),
                },
            )
        })?;
        debug!(
            "Queued '{}' at position {} in session {}",
            entry.title, entry.position, session_id
        );
        Ok(entry)
    }

    /// Lowest-position unplayed entry. Does not mark it; the caller does that
    /// once playback actually started.
    pub fn dequeue_next(&self, session_id: i32) -> MusicResult<Option<QueueEntry>> {
        Ok(self
            .db
            .with_conn(|conn| QueueEntry::next_unplayed(conn, session_id))?)
    }

    pub fn get(&self, entry_id: i32) -> MusicResult<Option<QueueEntry>> {
        Ok(self
            .db
            .with_conn(|conn| QueueEntry::find_by_id(conn, entry_id))?)
    }

    /// Set `played_at` if it is not set yet. Returns whether the row changed.
    pub fn mark_played(&self, entry_id: i32) -> MusicResult<bool> {
        let now = Utc::now().naive_utc();
        let changed = self
            .db
            .with_conn(|conn| QueueEntry::mark_played(conn, entry_id, now))?;
        Ok(changed > 0)
    }

    /// Soft-remove the unplayed entry at `position`. Other positions keep
    /// their numbers.
    pub fn remove(&self, session_id: i32, position: i32) -> MusicResult<bool> {
        let now = Utc::now().naive_utc();
        let removed = self.db.transaction(|conn| {
            match QueueEntry::find_unplayed_at(conn, session_id, position)? {
                Some(entry) => QueueEntry::mark_removed(conn, entry.id, now),
                None => Ok(0),
            }
        })?;
        Ok(removed > 0)
    }

    pub fn clear(&self, session_id: i32, confirmed: bool) -> MusicResult<usize> {
        if !confirmed {
            return Err(MusicError::ConfirmationRequired);
        }
        let now = Utc::now().naive_utc();
        let cleared = self
            .db
            .with_conn(|conn| QueueEntry::remove_all_unplayed(conn, session_id, now))?;
        info!("Cleared {} queued track(s) from session {}", cleared, session_id);
        Ok(cleared)
    }

    /// Randomly permute the positions of unplayed entries.
    pub fn shuffle(&self, session_id: i32) -> MusicResult<bool> {
        let shuffled = self.db.transaction(|conn| {
            let pending = QueueEntry::all_unplayed(conn, session_id)?;
            if pending.len() < 2 {
                return Ok(false);
            }
            let mut positions: Vec<i32> = pending.iter().map(|e| e.position).collect();
            positions.shuffle(&mut rand::thread_rng());

            // Two passes because (session_id, position) is unique.
            for entry in &pending {
                QueueEntry::set_position(conn, entry.id, -entry.position)?;
            }
            for (entry, position) in pending.iter().zip(positions) {
                QueueEntry::set_position(conn, entry.id, position)?;
            }
            Ok(true)
        })?;
        Ok(shuffled)
    }

    pub fn stats(&self, session_id: i32) -> MusicResult<QueueStats> {
        let stats = self.db.with_conn(|conn| {
            let total_tracks = QueueEntry::count_live(conn, session_id)?;
            let played_tracks = QueueEntry::count_played(conn, session_id)?;
            let unplayed_tracks = QueueEntry::count_unplayed(conn, session_id)?;
            let secs = QueueEntry::unplayed_duration_secs(conn, session_id)?;
            Ok(QueueStats {
                total_tracks,
                played_tracks,
                unplayed_tracks,
                estimated_playtime_minutes: (secs + 59) / 60,
            })
        })?;
        Ok(stats)
    }

    pub fn unplayed_count(&self, session_id: i32) -> MusicResult<usize> {
        let count = self
            .db
            .with_conn(|conn| QueueEntry::count_unplayed(conn, session_id))?;
        Ok(count as usize)
    }

    pub fn upcoming(&self, session_id: i32, limit: i64) -> MusicResult<Vec<QueueEntry>> {
        Ok(self
            .db
            .with_conn(|conn| QueueEntry::upcoming(conn, session_id, limit))?)
    }

    pub fn history(&self, session_id: i32, limit: i64) -> MusicResult<Vec<QueueEntry>> {
        Ok(self
            .db
            .with_conn(|conn| QueueEntry::history(conn, session_id, limit))?)
    }
}
