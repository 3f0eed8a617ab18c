//! Playback engine.
//!
//! Every guild gets a slot behind its own `tokio::sync::Mutex`. Commands, voice
//! events and the idle timer all take that lock, so transitions within a guild
//! are strictly sequential while guilds never wait on each other. A slot holds
//! the guild's `GuildPlayer` from a successful `join` until the guild leaves.

mod player;
#[cfg(test)]
mod tests;

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError};
use std::time::Duration;

use futures_util::future::join_all;
use serenity::all::{ChannelId, GuildId, UserId};
use tokio::sync::{Mutex, mpsc};
use tracing::{debug, error, info, warn};

pub use self::player::{
    CurrentTrack, EngineState, PlayOutcome, PlaybackStatus, SkipOutcome, TrackRequest,
    VolumeChange,
};
use self::player::{GuildPlayer, GuildSlot, NowPlaying};
use crate::access::{AccessGate, AgeVerifier};
use crate::audio::{AudioSource, ResolvedTrack, TrackInfo, TrackResolver};
use crate::database::Database;
use crate::database::models::{MusicSession, QueueEntry};
use crate::error::{MusicError, MusicResult};
use crate::metrics::METRICS;
use crate::preferences::PreferenceStore;
use crate::queue::{NewTrack, QueueStore};
use crate::session::{LoopMode, SessionOptions, SessionRegistry, SessionStatus};
use crate::voice::{VoiceEvent, VoiceTransport};

pub const END_VOICE_DISCONNECT: &str = "voice_disconnect";
pub const END_CONNECTION_DESTROYED: &str = "connection_destroyed";
pub const END_CONNECT_FAILED: &str = "connect_failed";
pub const END_IDLE_TIMEOUT: &str = "idle_timeout";
pub const END_SHUTDOWN: &str = "shutdown";
pub const END_ORPHANED: &str = "orphaned";

const STATUS_UPCOMING: i64 = 10;

#[derive(Debug, Clone)]
pub struct MusicConfig {
    /// Votes needed to skip a track somebody else requested.
    pub skip_votes: usize,
    /// Leave after this long connected with nothing playing.
    pub idle_disconnect: Option<Duration>,
    pub max_queue: usize,
    pub access_cache_ttl: Duration,
    pub preference_cache_ttl: Duration,
}

impl Default for MusicConfig {
    fn default() -> Self {
        Self {
            skip_votes: 3,
            idle_disconnect: Some(Duration::from_secs(5 * 60)),
            max_queue: 200,
            access_cache_ttl: Duration::from_secs(300),
            preference_cache_ttl: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Advance {
    Finished,
    Skipped,
}

/// A track about to be handed to the voice link.
struct PendingTrack {
    source: AudioSource,
    info: TrackInfo,
    requested_by: String,
    is_cannabis_content: bool,
    metadata: serde_json::Value,
    /// Queue row to mark played; `None` persists a fresh history row.
    entry_id: Option<i32>,
}

impl PendingTrack {
    fn requested(resolved: ResolvedTrack, request: &TrackRequest) -> Self {
        Self {
            source: resolved.source,
            info: resolved.info,
            requested_by: request.requested_by.to_string(),
            is_cannabis_content: request.is_cannabis_content,
            metadata: request.metadata.clone(),
            entry_id: request.entry_id,
        }
    }

    fn queued(resolved: ResolvedTrack, entry: &QueueEntry) -> Self {
        Self {
            source: resolved.source,
            info: resolved.info,
            requested_by: entry.requested_by.clone(),
            is_cannabis_content: entry.is_cannabis_content,
            metadata: serde_json::from_str(&entry.metadata)
                .unwrap_or_else(|_| serde_json::json!({})),
            entry_id: Some(entry.id),
        }
    }

    fn replay(done: &NowPlaying) -> Self {
        Self {
            source: done.source.clone(),
            info: done.track.info.clone(),
            requested_by: done.track.requested_by.clone(),
            is_cannabis_content: done.track.is_cannabis_content,
            metadata: done.metadata.clone(),
            entry_id: None,
        }
    }

    fn as_new_track(&self) -> NewTrack {
        NewTrack {
            info: self.info.clone(),
            requested_by: self.requested_by.clone(),
            is_cannabis_content: self.is_cannabis_content,
            metadata: self.metadata.clone(),
        }
    }
}

struct Inner {
    config: MusicConfig,
    sessions: SessionRegistry,
    queue: QueueStore,
    preferences: PreferenceStore,
    access: AccessGate,
    transport: Arc<dyn VoiceTransport>,
    resolver: Arc<dyn TrackResolver>,
    slots: std::sync::Mutex<HashMap<GuildId, Arc<Mutex<GuildSlot>>>>,
    /// Connection id of each guild's live player, readable without the guild lock.
    live: std::sync::Mutex<HashMap<GuildId, u64>>,
    ids: AtomicU64,
}

/// Handle to the engine. Cheap to clone; every clone drives the same guilds.
#[derive(Clone)]
pub struct MusicService {
    inner: Arc<Inner>,
}

impl MusicService {
    pub fn new(
        db: Database,
        verifier: Arc<dyn AgeVerifier>,
        transport: Arc<dyn VoiceTransport>,
        resolver: Arc<dyn TrackResolver>,
        config: MusicConfig,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                sessions: SessionRegistry::new(db.clone()),
                queue: QueueStore::new(db.clone()),
                preferences: PreferenceStore::new(db, config.preference_cache_ttl),
                access: AccessGate::new(verifier, config.access_cache_ttl),
                config,
                transport,
                resolver,
                slots: std::sync::Mutex::new(HashMap::new()),
                live: std::sync::Mutex::new(HashMap::new()),
                ids: AtomicU64::new(0),
            }),
        }
    }

    pub fn sessions(&self) -> &SessionRegistry {
        &self.inner.sessions
    }

    pub fn queue(&self) -> &QueueStore {
        &self.inner.queue
    }

    pub fn preferences(&self) -> &PreferenceStore {
        &self.inner.preferences
    }

    pub fn access(&self) -> &AccessGate {
        &self.inner.access
    }

    pub fn config(&self) -> &MusicConfig {
        &self.inner.config
    }

    fn next_id(&self) -> u64 {
        self.inner.ids.fetch_add(1, Ordering::Relaxed) + 1
    }

    fn slot(&self, guild_id: GuildId) -> Arc<Mutex<GuildSlot>> {
        let mut slots = self.inner.slots.lock().unwrap_or_else(PoisonError::into_inner);
        slots.entry(guild_id).or_default().clone()
    }

    fn existing_slot(&self, guild_id: GuildId) -> Option<Arc<Mutex<GuildSlot>>> {
        let slots = self.inner.slots.lock().unwrap_or_else(PoisonError::into_inner);
        slots.get(&guild_id).cloned()
    }

    fn is_mapped(&self, guild_id: GuildId, cell: &Arc<Mutex<GuildSlot>>) -> bool {
        let slots = self.inner.slots.lock().unwrap_or_else(PoisonError::into_inner);
        slots.get(&guild_id).is_some_and(|mapped| Arc::ptr_eq(mapped, cell))
    }

    /// Drop the guild's map entry once its slot holds no player. Must be
    /// called with `slot` locked from `cell`.
    fn release_slot(&self, guild_id: GuildId, cell: &Arc<Mutex<GuildSlot>>, slot: &GuildSlot) {
        if slot.player.is_some() {
            return;
        }
        let mut slots = self.inner.slots.lock().unwrap_or_else(PoisonError::into_inner);
        if slots.get(&guild_id).is_some_and(|mapped| Arc::ptr_eq(mapped, cell)) {
            slots.remove(&guild_id);
        }
    }

    fn live_connection(&self, guild_id: GuildId) -> Option<u64> {
        let live = self.inner.live.lock().unwrap_or_else(PoisonError::into_inner);
        live.get(&guild_id).copied()
    }

    fn set_live_connection(&self, guild_id: GuildId, connection: Option<u64>) {
        let mut live = self.inner.live.lock().unwrap_or_else(PoisonError::into_inner);
        match connection {
            Some(id) => live.insert(guild_id, id),
            None => live.remove(&guild_id),
        };
    }

    /// Run `f` against the guild's player under the guild lock.
    async fn with_player<R>(
        &self,
        guild_id: GuildId,
        f: impl FnOnce(&mut GuildPlayer) -> MusicResult<R>,
    ) -> MusicResult<R> {
        let cell = self.existing_slot(guild_id).ok_or(MusicError::NoSession)?;
        let mut slot = cell.lock().await;
        let player = slot.player.as_mut().ok_or(MusicError::NoSession)?;
        f(player)
    }

    /// Connect to `voice_channel_id` and open a session.
    pub async fn join(
        &self,
        guild_id: GuildId,
        voice_channel_id: ChannelId,
        text_channel_id: ChannelId,
        user_id: UserId,
        options: SessionOptions,
    ) -> MusicResult<MusicSession> {
        loop {
            let cell = self.slot(guild_id);
            let mut slot = cell.lock().await;
            // A leave may have retired this slot while we waited for it.
            if !self.is_mapped(guild_id, &cell) {
                continue;
            }
            let res = self
                .join_locked(
                    guild_id,
                    &mut slot,
                    voice_channel_id,
                    text_channel_id,
                    user_id,
                    &options,
                )
                .await;
            self.release_slot(guild_id, &cell, &slot);
            return res;
        }
    }

    async fn join_locked(
        &self,
        guild_id: GuildId,
        slot: &mut GuildSlot,
        voice_channel_id: ChannelId,
        text_channel_id: ChannelId,
        user_id: UserId,
        options: &SessionOptions,
    ) -> MusicResult<MusicSession> {
        if slot.player.is_some() {
            return Err(MusicError::AlreadyActive);
        }
        if options.is_cannabis_content() {
            self.inner.access.require_cannabis_access(user_id, guild_id)?;
        }

        // A live row without a player is left over from an earlier process.
        if let Some(stale) = self.inner.sessions.get_active_session(guild_id)? {
            warn!(
                "Session {} in guild {} has no player, ending it",
                stale.id, guild_id
            );
            self.inner.sessions.end_session(guild_id, END_ORPHANED)?;
        }

        let prefs = self.inner.preferences.get_or_create(user_id, guild_id)?;
        let session = self.inner.sessions.create_session(
            guild_id,
            voice_channel_id,
            text_channel_id,
            user_id,
            options,
            prefs.preferred_volume,
        )?;

        let connection = self.next_id();
        let (tx, rx) = mpsc::unbounded_channel();
        let link = match self
            .inner
            .transport
            .connect(guild_id, voice_channel_id, tx)
            .await
        {
            Ok(link) => link,
            Err(e) => {
                error!("Voice connect failed in guild {}: {}", guild_id, e);
                if let Err(end_err) = self.inner.sessions.end_session(guild_id, END_CONNECT_FAILED) {
                    error!(
                        "Could not end session {} after failed connect: {}",
                        session.id, end_err
                    );
                }
                return Err(e);
            }
        };

        let mut player = GuildPlayer {
            session_id: session.id,
            connection,
            link,
            current: None,
            generation: 0,
            paused: false,
            volume: session.volume.clamp(0, 100) as u8,
            loop_mode: LoopMode::Off,
            skip_votes: HashSet::new(),
            idle_timer: None,
        };
        self.arm_idle_timer(guild_id, &mut player);
        slot.player = Some(player);
        self.set_live_connection(guild_id, Some(connection));
        METRICS.inc_sessions();
        self.spawn_event_pump(guild_id, connection, rx);

        info!(
            "Joined voice channel {} in guild {} (session {})",
            voice_channel_id, guild_id, session.id
        );
        Ok(session)
    }

    /// Start a track, or queue it behind the one that is playing.
    pub async fn play(&self, guild_id: GuildId, request: TrackRequest) -> MusicResult<PlayOutcome> {
        let cell = self.existing_slot(guild_id).ok_or(MusicError::NoSession)?;
        let mut slot = cell.lock().await;
        let player = slot.player.as_mut().ok_or(MusicError::NoSession)?;

        if request.is_cannabis_content {
            self.inner
                .access
                .require_cannabis_access(request.requested_by, guild_id)?;
        }

        if let Some(entry_id) = request.entry_id {
            self.inner
                .queue
                .get(entry_id)?
                .filter(|e| {
                    e.session_id == player.session_id
                        && e.removed_at.is_none()
                        && e.played_at.is_none()
                })
                .ok_or(MusicError::EntryNotFound(entry_id))?;
        }

        if player.current.is_some() {
            return self.enqueue(guild_id, player, &request).await;
        }

        let resolved = self.resolve(guild_id, &request).await?;
        let track = self
            .start_track(guild_id, player, PendingTrack::requested(resolved, &request))
            .await?;
        Ok(PlayOutcome::Started { track })
    }

    async fn enqueue(
        &self,
        guild_id: GuildId,
        player: &mut GuildPlayer,
        request: &TrackRequest,
    ) -> MusicResult<PlayOutcome> {
        let session_id = player.session_id;

        if let Some(entry_id) = request.entry_id {
            let entry = self
                .inner
                .queue
                .get(entry_id)?
                .ok_or(MusicError::EntryNotFound(entry_id))?;
            let ahead = self
                .inner
                .queue
                .upcoming(session_id, self.inner.config.max_queue as i64)?
                .iter()
                .take_while(|e| e.id != entry.id)
                .count();
            return Ok(PlayOutcome::Queued {
                position: entry.position,
                title: entry.title,
                ahead,
            });
        }

        let ahead = self.inner.queue.unplayed_count(session_id)?;
        if ahead >= self.inner.config.max_queue {
            return Err(MusicError::QueueFull(self.inner.config.max_queue));
        }

        let resolved = self.resolve(guild_id, request).await?;
        let entry = self
            .inner
            .queue
            .enqueue(session_id, &PendingTrack::requested(resolved, request).as_new_track())?;
        METRICS.inc_tracks_queued();
        info!(
            "Queued '{}' at position {} in guild {}",
            entry.title, entry.position, guild_id
        );
        Ok(PlayOutcome::Queued {
            position: entry.position,
            title: entry.title,
            ahead,
        })
    }

    async fn resolve(&self, guild_id: GuildId, request: &TrackRequest) -> MusicResult<ResolvedTrack> {
        let resolved = self.inner.resolver.resolve(&request.query).await?;
        let prefs = self
            .inner
            .preferences
            .get_or_create(request.requested_by, guild_id)?;
        if prefs.blocks_source(&resolved.info.source) {
            return Err(MusicError::SourceBlocked(resolved.info.source));
        }
        Ok(resolved)
    }

    /// Hand `next` to the link. Player state and the history row are only
    /// written once the link accepted the track.
    async fn start_track(
        &self,
        guild_id: GuildId,
        player: &mut GuildPlayer,
        next: PendingTrack,
    ) -> MusicResult<CurrentTrack> {
        let generation = self.next_id();
        player
            .link
            .play(&next.source, player.volume, generation)
            .await?;

        let persisted = match next.entry_id {
            Some(id) => self.inner.queue.mark_played(id).map(|_| id),
            None => self
                .inner
                .queue
                .record_started(player.session_id, &next.as_new_track())
                .map(|entry| entry.id),
        }
        .and_then(|id| {
            self.inner.sessions.advance_track_index(player.session_id)?;
            Ok(id)
        });
        let entry_id = match persisted {
            Ok(id) => id,
            Err(e) => {
                player.link.stop();
                return Err(e);
            }
        };

        player.cancel_idle_timer();
        player.generation = generation;
        player.paused = false;
        player.skip_votes.clear();
        let track = CurrentTrack {
            entry_id,
            info: next.info,
            requested_by: next.requested_by,
            is_cannabis_content: next.is_cannabis_content,
        };
        player.current = Some(NowPlaying {
            track: track.clone(),
            source: next.source,
            metadata: next.metadata,
        });
        METRICS.inc_tracks_started();
        info!("Now playing '{}' in guild {}", track.info.title, guild_id);
        Ok(track)
    }

    /// Move on from the current track. Returns what started, if anything.
    async fn auto_advance(
        &self,
        guild_id: GuildId,
        player: &mut GuildPlayer,
        cause: Advance,
    ) -> MusicResult<Option<TrackInfo>> {
        let finished = player.current.take();
        if player.paused {
            player.paused = false;
            if let Err(e) = self
                .inner
                .sessions
                .set_status(player.session_id, SessionStatus::Active)
            {
                warn!("Could not mark session {} active: {}", player.session_id, e);
            }
        }
        player.skip_votes.clear();

        if let Some(done) = finished {
            match player.loop_mode {
                LoopMode::Track if cause == Advance::Finished => {
                    match self
                        .start_track(guild_id, player, PendingTrack::replay(&done))
                        .await
                    {
                        Ok(track) => return Ok(Some(track.info)),
                        Err(e) => warn!(
                            "Replaying '{}' in guild {} failed: {}",
                            done.track.info.title, guild_id, e
                        ),
                    }
                }
                LoopMode::Queue => {
                    if let Err(e) = self
                        .inner
                        .queue
                        .enqueue(player.session_id, &done.as_new_track())
                    {
                        warn!(
                            "Could not requeue '{}' in guild {}: {}",
                            done.track.info.title, guild_id, e
                        );
                    }
                }
                _ => {}
            }
        }

        match self.start_next_queued(guild_id, player).await {
            Ok(Some(track)) => {
                METRICS.inc_auto_advances();
                Ok(Some(track.info))
            }
            Ok(None) => {
                info!("Queue finished in guild {}", guild_id);
                self.arm_idle_timer(guild_id, player);
                Ok(None)
            }
            Err(e) => {
                // Nothing is playing now, so the guild must still time out.
                self.arm_idle_timer(guild_id, player);
                Err(e)
            }
        }
    }

    /// Start the first queued entry that plays, marking failures played.
    async fn start_next_queued(
        &self,
        guild_id: GuildId,
        player: &mut GuildPlayer,
    ) -> MusicResult<Option<CurrentTrack>> {
        while let Some(entry) = self.inner.queue.dequeue_next(player.session_id)? {
            match self.start_entry(guild_id, player, &entry).await {
                Ok(track) => return Ok(Some(track)),
                Err(e) => {
                    warn!(
                        "Skipping queued '{}' in guild {}: {}",
                        entry.title, guild_id, e
                    );
                    self.inner.queue.mark_played(entry.id)?;
                }
            }
        }
        Ok(None)
    }

    async fn start_entry(
        &self,
        guild_id: GuildId,
        player: &mut GuildPlayer,
        entry: &QueueEntry,
    ) -> MusicResult<CurrentTrack> {
        let resolved = self.inner.resolver.resolve(&entry.url).await?;
        self.start_track(guild_id, player, PendingTrack::queued(resolved, entry))
            .await
    }

    /// Pause the running track. False when there is nothing to pause.
    pub async fn pause(&self, guild_id: GuildId) -> MusicResult<bool> {
        let Some(cell) = self.existing_slot(guild_id) else {
            return Ok(false);
        };
        let mut slot = cell.lock().await;
        let Some(player) = slot.player.as_mut() else {
            return Ok(false);
        };
        if player.current.is_none() || player.paused || !player.link.pause() {
            return Ok(false);
        }
        player.paused = true;
        self.inner
            .sessions
            .set_status(player.session_id, SessionStatus::Paused)?;
        info!("Paused playback in guild {}", guild_id);
        Ok(true)
    }

    /// Resume a paused track. False when nothing is paused.
    pub async fn resume(&self, guild_id: GuildId) -> MusicResult<bool> {
        let Some(cell) = self.existing_slot(guild_id) else {
            return Ok(false);
        };
        let mut slot = cell.lock().await;
        let Some(player) = slot.player.as_mut() else {
            return Ok(false);
        };
        if player.current.is_none() || !player.paused || !player.link.unpause() {
            return Ok(false);
        }
        player.paused = false;
        self.inner
            .sessions
            .set_status(player.session_id, SessionStatus::Active)?;
        info!("Resumed playback in guild {}", guild_id);
        Ok(true)
    }

    /// Skip the current track. The requester skips right away; anybody else
    /// casts a vote.
    pub async fn skip(&self, guild_id: GuildId, user_id: UserId) -> MusicResult<SkipOutcome> {
        let cell = self.existing_slot(guild_id).ok_or(MusicError::NoSession)?;
        let mut slot = cell.lock().await;
        let player = slot.player.as_mut().ok_or(MusicError::NoSession)?;
        let Some(current) = player.current.as_ref() else {
            return Err(MusicError::NotPlaying);
        };
        let skipped = current.track.info.clone();
        let is_requester = current.track.requested_by == user_id.to_string();

        if !is_requester {
            let required = self.inner.config.skip_votes.max(1);
            player.skip_votes.insert(user_id);
            let votes = player.skip_votes.len();
            if votes < required {
                info!(
                    "Skip vote {}/{} for '{}' in guild {}",
                    votes, required, skipped.title, guild_id
                );
                return Ok(SkipOutcome::VoteRegistered { votes, required });
            }
        }

        player.link.stop();
        info!("Skipped '{}' in guild {}", skipped.title, guild_id);
        let next = self.auto_advance(guild_id, player, Advance::Skipped).await?;
        Ok(SkipOutcome::Skipped {
            track: skipped,
            next,
        })
    }

    /// Persist the session volume and apply it to the running track when the
    /// link allows; it always applies from the next track start.
    pub async fn set_volume(&self, guild_id: GuildId, level: i32) -> MusicResult<VolumeChange> {
        if !(0..=100).contains(&level) {
            return Err(MusicError::InvalidVolume(level));
        }
        self.with_player(guild_id, |player| {
            self.inner.sessions.set_volume(player.session_id, level)?;
            let level = level as u8;
            player.volume = level;
            let applied_live = player.current.is_some() && player.link.set_volume(level);
            if !applied_live && player.current.is_some() {
                debug!(
                    "Volume {} in guild {} applies from the next track",
                    level, guild_id
                );
            }
            Ok(VolumeChange {
                level,
                applied_live,
            })
        })
        .await
    }

    pub async fn set_loop_mode(&self, guild_id: GuildId, mode: LoopMode) -> MusicResult<LoopMode> {
        self.with_player(guild_id, |player| {
            let mut metadata = self
                .inner
                .sessions
                .get(player.session_id)?
                .map(|s| s.parsed_metadata())
                .unwrap_or_default();
            metadata.loop_mode = mode;
            self.inner
                .sessions
                .update_metadata(player.session_id, &metadata)?;
            player.loop_mode = mode;
            info!("Loop mode set to {} in guild {}", mode, guild_id);
            Ok(mode)
        })
        .await
    }

    pub async fn shuffle(&self, guild_id: GuildId) -> MusicResult<bool> {
        self.with_player(guild_id, |player| {
            let shuffled = self.inner.queue.shuffle(player.session_id)?;
            if shuffled
                && let Some(session) = self.inner.sessions.get(player.session_id)?
            {
                let mut metadata = session.parsed_metadata();
                metadata.shuffle = true;
                self.inner
                    .sessions
                    .update_metadata(player.session_id, &metadata)?;
            }
            Ok(shuffled)
        })
        .await
    }

    /// Remove the queued entry at `position`.
    pub async fn remove(&self, guild_id: GuildId, position: i32) -> MusicResult<()> {
        self.with_player(guild_id, |player| {
            if self.inner.queue.remove(player.session_id, position)? {
                Ok(())
            } else {
                Err(MusicError::EntryNotFound(position))
            }
        })
        .await
    }

    pub async fn clear(&self, guild_id: GuildId, confirmed: bool) -> MusicResult<usize> {
        self.with_player(guild_id, |player| {
            self.inner.queue.clear(player.session_id, confirmed)
        })
        .await
    }

    pub async fn status(&self, guild_id: GuildId) -> MusicResult<PlaybackStatus> {
        self.with_player(guild_id, |player| {
            let session = self
                .inner
                .sessions
                .get(player.session_id)?
                .ok_or(MusicError::NoSession)?;
            let state = player.state();
            Ok(PlaybackStatus {
                state,
                current: player.current.as_ref().map(|c| c.track.clone()),
                is_playing: state == EngineState::Playing,
                is_paused: state == EngineState::Paused,
                volume: player.volume,
                loop_mode: player.loop_mode,
                skip_votes: player.skip_votes.len(),
                upcoming: self.inner.queue.upcoming(player.session_id, STATUS_UPCOMING)?,
                stats: self.inner.queue.stats(player.session_id)?,
                session,
            })
        })
        .await
    }

    /// Stop playback, disconnect and end the session. Safe in any state; a
    /// second call returns false.
    pub async fn leave(&self, guild_id: GuildId, reason: &str) -> MusicResult<bool> {
        let Some(cell) = self.existing_slot(guild_id) else {
            return self.inner.sessions.end_session(guild_id, reason);
        };
        let mut slot = cell.lock().await;
        let res = self.teardown(guild_id, &mut slot, reason).await;
        self.release_slot(guild_id, &cell, &slot);
        if res? {
            return Ok(true);
        }
        self.inner.sessions.end_session(guild_id, reason)
    }

    async fn teardown(
        &self,
        guild_id: GuildId,
        slot: &mut GuildSlot,
        reason: &str,
    ) -> MusicResult<bool> {
        let Some(mut player) = slot.player.take() else {
            return Ok(false);
        };
        self.set_live_connection(guild_id, None);
        player.cancel_idle_timer();
        player.link.stop();
        player.link.destroy().await;
        METRICS.dec_sessions();
        info!("Left voice in guild {} ({})", guild_id, reason);
        self.inner.sessions.end_session(guild_id, reason)?;
        Ok(true)
    }

    /// Apply a notification about the guild's current voice connection. The
    /// event is bound to the connection live when it arrives; if that
    /// connection is gone by the time the guild lock is free, it is dropped.
    pub async fn handle_voice_event(&self, guild_id: GuildId, event: VoiceEvent) -> MusicResult<()> {
        let Some(connection) = self.live_connection(guild_id) else {
            debug!("Dropping {:?} for guild {} with no live connection", event, guild_id);
            return Ok(());
        };
        self.apply_for_connection(guild_id, connection, event).await
    }

    async fn apply_for_connection(
        &self,
        guild_id: GuildId,
        connection: u64,
        event: VoiceEvent,
    ) -> MusicResult<()> {
        let Some(cell) = self.existing_slot(guild_id) else {
            return Ok(());
        };
        let mut slot = cell.lock().await;
        if slot
            .player
            .as_ref()
            .is_none_or(|p| p.connection != connection)
        {
            debug!(
                "Dropping {:?} from a retired voice link in guild {}",
                event, guild_id
            );
            return Ok(());
        }
        let res = self.apply_voice_event(guild_id, &mut slot, event).await;
        self.release_slot(guild_id, &cell, &slot);
        res
    }

    async fn apply_voice_event(
        &self,
        guild_id: GuildId,
        slot: &mut GuildSlot,
        event: VoiceEvent,
    ) -> MusicResult<()> {
        let (generation, error) = match event {
            VoiceEvent::TrackEnded { generation } => (generation, None),
            VoiceEvent::TrackErrored { generation, error } => (generation, Some(error)),
            VoiceEvent::Disconnected => {
                self.teardown(guild_id, slot, END_VOICE_DISCONNECT).await?;
                return Ok(());
            }
            VoiceEvent::Destroyed => {
                self.teardown(guild_id, slot, END_CONNECTION_DESTROYED)
                    .await?;
                return Ok(());
            }
        };

        let Some(player) = slot.player.as_mut() else {
            return Ok(());
        };
        if player.current.is_none() || player.generation != generation {
            debug!(
                "Ignoring stale track event (generation {}) in guild {}",
                generation, guild_id
            );
            return Ok(());
        }
        if let Some(error) = error {
            warn!("Track errored in guild {}: {}", guild_id, error);
        }
        self.auto_advance(guild_id, player, Advance::Finished)
            .await?;
        Ok(())
    }

    fn spawn_event_pump(
        &self,
        guild_id: GuildId,
        connection: u64,
        mut events: mpsc::UnboundedReceiver<VoiceEvent>,
    ) {
        let service = Arc::downgrade(&self.inner);
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                let Some(inner) = service.upgrade() else {
                    break;
                };
                MusicService { inner }
                    .on_link_event(guild_id, connection, event)
                    .await;
            }
            debug!("Voice event pump for guild {} finished", guild_id);
        });
    }

    async fn on_link_event(&self, guild_id: GuildId, connection: u64, event: VoiceEvent) {
        if let Err(e) = self.apply_for_connection(guild_id, connection, event).await {
            error!("Voice event handling failed in guild {}: {}", guild_id, e);
        }
    }

    fn arm_idle_timer(&self, guild_id: GuildId, player: &mut GuildPlayer) {
        player.cancel_idle_timer();
        let Some(after) = self.inner.config.idle_disconnect else {
            return;
        };
        let service = Arc::downgrade(&self.inner);
        let connection = player.connection;
        player.idle_timer = Some(tokio::spawn(async move {
            tokio::time::sleep(after).await;
            if let Some(inner) = service.upgrade() {
                MusicService { inner }
                    .expire_idle(guild_id, connection)
                    .await;
            }
        }));
    }

    async fn expire_idle(&self, guild_id: GuildId, connection: u64) {
        let Some(cell) = self.existing_slot(guild_id) else {
            return;
        };
        let mut slot = cell.lock().await;
        match slot.player.as_mut() {
            Some(p) if p.connection == connection && p.current.is_none() => {
                // Dropping the handle detaches; aborting would cancel this task.
                p.idle_timer = None;
            }
            _ => return,
        }
        info!("Nothing played for a while in guild {}, leaving", guild_id);
        if let Err(e) = self.teardown(guild_id, &mut slot, END_IDLE_TIMEOUT).await {
            error!("Idle disconnect failed in guild {}: {}", guild_id, e);
        }
        self.release_slot(guild_id, &cell, &slot);
    }

    /// Leave every guild. Called once on process exit.
    pub async fn shutdown(&self) {
        let guilds: Vec<GuildId> = {
            let slots = self.inner.slots.lock().unwrap_or_else(PoisonError::into_inner);
            slots.keys().copied().collect()
        };
        let leaving = guilds.into_iter().map(|guild_id| async move {
            if let Err(e) = self.leave(guild_id, END_SHUTDOWN).await {
                warn!("Leaving guild {} on shutdown failed: {}", guild_id, e);
            }
        });
        join_all(leaving).await;
    }
}
