//! Voice transport seam: one connection plus one audio player per guild.

pub mod songbird;

use serenity::all::{ChannelId, GuildId};
use serenity::async_trait;
use tokio::sync::mpsc;

use crate::audio::AudioSource;
use crate::error::MusicResult;

pub use self::songbird::SongbirdTransport;

/// Notifications from the transport. Track events carry the generation number
/// the engine handed to `VoiceLink::play`, so late events from a replaced
/// track can be told apart.
#[derive(Debug, Clone, PartialEq)]
pub enum VoiceEvent {
    TrackEnded { generation: u64 },
    TrackErrored { generation: u64, error: String },
    Disconnected,
    Destroyed,
}

pub type VoiceEventSender = mpsc::UnboundedSender<VoiceEvent>;

#[async_trait]
pub trait VoiceTransport: Send + Sync {
    /// Join `channel_id` and return the guild's link. Events for the link are
    /// delivered on `events` until the link is destroyed.
    async fn connect(
        &self,
        guild_id: GuildId,
        channel_id: ChannelId,
        events: VoiceEventSender,
    ) -> MusicResult<Box<dyn VoiceLink>>;
}

#[async_trait]
pub trait VoiceLink: Send + Sync {
    /// Replace whatever is playing with `source` at `volume` (0..=100).
    async fn play(&mut self, source: &AudioSource, volume: u8, generation: u64) -> MusicResult<()>;

    fn pause(&mut self) -> bool;

    fn unpause(&mut self) -> bool;

    /// Stop the current resource. No end event is guaranteed afterwards.
    fn stop(&mut self);

    /// Change the volume of the running resource. Returns false when the
    /// pipeline can't adjust mid-stream; the level then applies from the next
    /// `play`.
    fn set_volume(&mut self, volume: u8) -> bool;

    /// Leave the channel and release the connection. Safe to call twice.
    async fn destroy(&mut self);
}
