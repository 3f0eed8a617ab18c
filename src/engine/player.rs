//! Per-guild playback state and the types handed back to front-ends.

use std::collections::HashSet;

use serde::Serialize;
use serenity::all::UserId;
use tokio::task::JoinHandle;

use crate::audio::{AudioSource, TrackInfo};
use crate::database::models::{MusicSession, QueueEntry};
use crate::queue::{NewTrack, QueueStats};
use crate::session::LoopMode;
use crate::voice::VoiceLink;

/// What a front-end asks the engine to play.
#[derive(Debug, Clone)]
pub struct TrackRequest {
    pub query: String,
    pub requested_by: UserId,
    pub is_cannabis_content: bool,
    pub metadata: serde_json::Value,
    /// Set when the request plays an entry that is already in the queue.
    pub entry_id: Option<i32>,
}

impl TrackRequest {
    pub fn new(query: impl Into<String>, requested_by: UserId) -> Self {
        Self {
            query: query.into(),
            requested_by,
            is_cannabis_content: false,
            metadata: serde_json::json!({}),
            entry_id: None,
        }
    }

    pub fn cannabis(mut self, flag: bool) -> Self {
        self.is_cannabis_content = flag;
        self
    }

    /// Play a queued entry directly. It is marked played once it starts,
    /// instead of being persisted a second time.
    pub fn from_entry(entry: &QueueEntry, requested_by: UserId) -> Self {
        Self {
            query: entry.url.clone(),
            requested_by,
            is_cannabis_content: entry.is_cannabis_content,
            metadata: serde_json::from_str(&entry.metadata).unwrap_or_else(|_| serde_json::json!({})),
            entry_id: Some(entry.id),
        }
    }
}

/// The track currently owned by a guild's player.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CurrentTrack {
    pub entry_id: i32,
    pub info: TrackInfo,
    pub requested_by: String,
    pub is_cannabis_content: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PlayOutcome {
    Started { track: CurrentTrack },
    Queued { position: i32, title: String, ahead: usize },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SkipOutcome {
    Skipped {
        track: TrackInfo,
        next: Option<TrackInfo>,
    },
    VoteRegistered {
        votes: usize,
        required: usize,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct VolumeChange {
    pub level: u8,
    /// False when nothing was playing or the pipeline refused a mid-stream
    /// change; the level is applied on the next track start either way.
    pub applied_live: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EngineState {
    Playing,
    Paused,
    Stopped,
}

#[derive(Debug, Clone, Serialize)]
pub struct PlaybackStatus {
    pub state: EngineState,
    pub current: Option<CurrentTrack>,
    pub is_playing: bool,
    pub is_paused: bool,
    pub volume: u8,
    pub loop_mode: LoopMode,
    pub skip_votes: usize,
    pub upcoming: Vec<QueueEntry>,
    pub stats: QueueStats,
    pub session: MusicSession,
}

pub(crate) struct NowPlaying {
    pub track: CurrentTrack,
    pub source: AudioSource,
    pub metadata: serde_json::Value,
}

impl NowPlaying {
    pub fn as_new_track(&self) -> NewTrack {
        NewTrack {
            info: self.track.info.clone(),
            requested_by: self.track.requested_by.clone(),
            is_cannabis_content: self.track.is_cannabis_content,
            metadata: self.metadata.clone(),
        }
    }
}

/// Connection and audio player of one guild. Exists from a successful join
/// until the guild leaves.
pub(crate) struct GuildPlayer {
    pub session_id: i32,
    /// Identifies the voice link; events from an older link are dropped.
    pub connection: u64,
    pub link: Box<dyn VoiceLink>,
    pub current: Option<NowPlaying>,
    /// Generation handed to the link for the running track.
    pub generation: u64,
    pub paused: bool,
    pub volume: u8,
    pub loop_mode: LoopMode,
    pub skip_votes: HashSet<UserId>,
    pub idle_timer: Option<JoinHandle<()>>,
}

impl GuildPlayer {
    pub fn state(&self) -> EngineState {
        match (&self.current, self.paused) {
            (None, _) => EngineState::Stopped,
            (Some(_), true) => EngineState::Paused,
            (Some(_), false) => EngineState::Playing,
        }
    }

    pub fn cancel_idle_timer(&mut self) {
        if let Some(timer) = self.idle_timer.take() {
            timer.abort();
        }
    }
}

#[derive(Default)]
pub(crate) struct GuildSlot {
    pub player: Option<GuildPlayer>,
}
