use std::sync::Arc;

use serenity::all::{ChannelId, GuildId};
use serenity::async_trait;
use songbird::driver::Bitrate;
use songbird::input::{File as FileInput, HttpRequest, Input};
use songbird::tracks::TrackHandle;
use songbird::{
    Call, CoreEvent, Event, EventContext, EventHandler as VoiceEventHandler, Songbird, TrackEvent,
};
use tokio::sync::Mutex;
use tracing::{info, warn};

use super::{VoiceEvent, VoiceEventSender, VoiceLink, VoiceTransport};
use crate::audio::AudioSource;
use crate::error::{MusicError, MusicResult};

const MAX_JOIN_ATTEMPTS: u32 = 5;

/// Voice transport backed by the songbird manager registered on the serenity client.
pub struct SongbirdTransport {
    manager: Arc<Songbird>,
    http: reqwest::Client,
    bitrate: Option<i32>,
}

impl SongbirdTransport {
    pub fn new(manager: Arc<Songbird>, bitrate: Option<i32>) -> Self {
        Self {
            manager,
            http: reqwest::Client::new(),
            bitrate,
        }
    }

    async fn join_with_retry(
        &self,
        guild_id: GuildId,
        channel_id: ChannelId,
    ) -> MusicResult<Arc<Mutex<Call>>> {
        let mut attempts = 0;
        loop {
            info!(
                "Joining voice channel {} in guild {} (attempt {}/{})",
                channel_id,
                guild_id,
                attempts + 1,
                MAX_JOIN_ATTEMPTS
            );
            match self.manager.join(guild_id, channel_id).await {
                Ok(call) => return Ok(call),
                Err(e) => {
                    attempts += 1;
                    if attempts >= MAX_JOIN_ATTEMPTS {
                        // Leave nothing half-joined behind.
                        let _ = self.manager.remove(guild_id).await;
                        return Err(MusicError::Voice(format!(
                            "failed to join voice channel after {MAX_JOIN_ATTEMPTS} attempts: {e}"
                        )));
                    }
                    let delay_ms = std::cmp::min(5000, 1000 * 2_u64.pow(attempts - 1));
                    warn!(
                        "Voice join attempt {} failed: {}. Retrying in {}ms...",
                        attempts, e, delay_ms
                    );
                    tokio::time::sleep(std::time::Duration::from_millis(delay_ms)).await;
                }
            }
        }
    }
}

#[async_trait]
impl VoiceTransport for SongbirdTransport {
    async fn connect(
        &self,
        guild_id: GuildId,
        channel_id: ChannelId,
        events: VoiceEventSender,
    ) -> MusicResult<Box<dyn VoiceLink>> {
        if self.manager.get(guild_id).is_some() {
            // A call we don't own would carry no event handlers.
            warn!("Stale voice call found in guild {}, resetting it", guild_id);
            let _ = self.manager.remove(guild_id).await;
        }

        let call = self.join_with_retry(guild_id, channel_id).await?;
        {
            let mut handler = call.lock().await;
            if let Some(br) = self.bitrate {
                handler.set_bitrate(Bitrate::BitsPerSecond(br));
            }
            handler.add_global_event(
                Event::Core(CoreEvent::DriverDisconnect),
                DisconnectNotifier {
                    events: events.clone(),
                },
            );
        }

        Ok(Box::new(SongbirdLink {
            manager: self.manager.clone(),
            http: self.http.clone(),
            guild_id,
            call,
            current: None,
            events,
            destroyed: false,
        }))
    }
}

struct SongbirdLink {
    manager: Arc<Songbird>,
    http: reqwest::Client,
    guild_id: GuildId,
    call: Arc<Mutex<Call>>,
    current: Option<TrackHandle>,
    events: VoiceEventSender,
    destroyed: bool,
}

#[async_trait]
impl VoiceLink for SongbirdLink {
    async fn play(&mut self, source: &AudioSource, volume: u8, generation: u64) -> MusicResult<()> {
        if self.destroyed {
            return Err(MusicError::Voice("connection already destroyed".into()));
        }
        let input: Input = match source {
            AudioSource::File(path) => FileInput::new(path.clone()).into(),
            AudioSource::Http(url) => HttpRequest::new(self.http.clone(), url.clone()).into(),
        };

        let handle = {
            let mut call = self.call.lock().await;
            call.play_only_input(input)
        };
        let _ = handle.set_volume(f32::from(volume) / 100.0);

        for (event, ended) in [(TrackEvent::End, true), (TrackEvent::Error, false)] {
            handle
                .add_event(
                    Event::Track(event),
                    TrackNotifier {
                        generation,
                        ended,
                        events: self.events.clone(),
                    },
                )
                .map_err(|e| MusicError::Voice(format!("failed to attach track events: {e}")))?;
        }
        self.current = Some(handle);
        Ok(())
    }

    fn pause(&mut self) -> bool {
        self.current.as_ref().is_some_and(|h| h.pause().is_ok())
    }

    fn unpause(&mut self) -> bool {
        self.current.as_ref().is_some_and(|h| h.play().is_ok())
    }

    fn stop(&mut self) {
        if let Some(handle) = self.current.take() {
            let _ = handle.stop();
        }
    }

    fn set_volume(&mut self, volume: u8) -> bool {
        self.current
            .as_ref()
            .is_some_and(|h| h.set_volume(f32::from(volume) / 100.0).is_ok())
    }

    async fn destroy(&mut self) {
        if self.destroyed {
            return;
        }
        self.destroyed = true;
        self.stop();
        if let Err(e) = self.manager.remove(self.guild_id).await {
            warn!("Voice call removal in guild {} reported: {}", self.guild_id, e);
        }
        let _ = self.events.send(VoiceEvent::Destroyed);
    }
}

struct TrackNotifier {
    generation: u64,
    ended: bool,
    events: VoiceEventSender,
}

#[async_trait]
impl VoiceEventHandler for TrackNotifier {
    async fn act(&self, ctx: &EventContext<'_>) -> Option<Event> {
        let event = if self.ended {
            VoiceEvent::TrackEnded {
                generation: self.generation,
            }
        } else {
            let error = match ctx {
                EventContext::Track(tracks) => tracks
                    .first()
                    .map(|(state, _)| format!("{:?}", state.playing))
                    .unwrap_or_else(|| "unknown track error".to_string()),
                _ => "unknown track error".to_string(),
            };
            VoiceEvent::TrackErrored {
                generation: self.generation,
                error,
            }
        };
        let _ = self.events.send(event);
        None
    }
}

struct DisconnectNotifier {
    events: VoiceEventSender,
}

#[async_trait]
impl VoiceEventHandler for DisconnectNotifier {
    async fn act(&self, _ctx: &EventContext<'_>) -> Option<Event> {
        let _ = self.events.send(VoiceEvent::Disconnected);
        None
    }
}
