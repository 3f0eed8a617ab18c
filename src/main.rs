use std::sync::Arc;

use anyhow::Result;
use serenity::{
    all::{
        Command as AppCommand, Context as SerenityContext, GatewayIntents, Interaction,
        Permissions, Ready, VoiceState,
    },
    async_trait,
};
use songbird::{Config as VoiceConfig, Songbird, serenity::SerenityInit};
use tracing::{error, info, warn};

mod access;
mod audio;
mod cache;
mod commands;
mod database;
mod engine;
mod env;
mod error;
mod metrics;
mod outcome;
mod preferences;
mod queue;
mod session;
mod voice;
mod web;

use crate::access::DbAgeVerifier;
use crate::audio::YtDlpResolver;
use crate::database::Database;
use crate::engine::MusicService;
use crate::metrics::METRICS;
use crate::voice::{SongbirdTransport, VoiceEvent};

struct Handler {
    music: MusicService,
}

#[async_trait]
impl serenity::prelude::EventHandler for Handler {
    async fn ready(&self, ctx: SerenityContext, ready: Ready) {
        info!("Logged in as {}", ready.user.name);

        let perms = Permissions::CONNECT | Permissions::SPEAK;
        if let Ok(app) = ctx.http.get_current_application_info().await {
            let invite = format!(
                "https://discord.com/api/oauth2/authorize?client_id={}&permissions={}&scope=bot%20applications.commands",
                app.id,
                perms.bits()
            );
            info!(
                "Invite this bot: {} (app_id={}, user_id={})",
                invite, app.id, ready.user.id
            );
        }

        for def in commands::definitions() {
            if let Err(e) = AppCommand::create_global_command(&ctx.http, def).await {
                error!("failed to register global command: {e:?}");
            }
        }
        METRICS.set_ready(true);
    }

    async fn interaction_create(&self, ctx: SerenityContext, interaction: Interaction) {
        match interaction {
            Interaction::Command(cmd) => commands::dispatch(&ctx, &cmd, &self.music).await,
            Interaction::Component(component) => {
                if let Err(why) = commands::buttons::handle(&ctx, &component, &self.music).await {
                    error!("button {} failed: {why:?}", component.data.custom_id);
                }
            }
            _ => {}
        }
    }

    async fn voice_state_update(
        &self,
        ctx: SerenityContext,
        _old: Option<VoiceState>,
        new: VoiceState,
    ) {
        // Only the bot's own state matters: a null channel means it was kicked or moved out.
        if new.user_id != ctx.cache.current_user().id || new.channel_id.is_some() {
            return;
        }
        let Some(guild_id) = new.guild_id else {
            return;
        };
        if let Err(e) = self
            .music
            .handle_voice_event(guild_id, VoiceEvent::Disconnected)
            .await
        {
            warn!("Handling voice disconnect in guild {} failed: {}", guild_id, e);
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let token = env::read_discord_token()?;
    let settings = env::Settings::from_env()?;
    let db = Database::open(&settings.database_url)?;

    // One track at a time at volume <= 1.0, so softclip buys nothing.
    let voice_cfg = VoiceConfig::default()
        .preallocated_tracks(2)
        .use_softclip(false)
        .mix_mode(settings.mix_mode());
    let manager = Songbird::serenity_from_config(voice_cfg);

    let music = MusicService::new(
        db.clone(),
        Arc::new(DbAgeVerifier::new(db)),
        Arc::new(SongbirdTransport::new(manager.clone(), Some(settings.bitrate))),
        Arc::new(YtDlpResolver),
        settings.music.clone(),
    );

    let intents = GatewayIntents::non_privileged() | GatewayIntents::GUILD_VOICE_STATES;
    let mut client = serenity::Client::builder(token, intents)
        .event_handler(Handler {
            music: music.clone(),
        })
        .register_songbird_with(manager)
        .await?;

    let bind = settings.http_bind.clone();
    tokio::spawn(async move {
        if let Err(e) = web::run_http(bind).await {
            error!("HTTP server error: {e:?}");
        }
    });

    if let Ok(dir) = audio::resolved_download_base_dir() {
        info!("Download cache dir: {}", dir.display());
    }
    info!(
        "Tunables: GREENROOM_MIX_MODE=mono|stereo, GREENROOM_BITRATE=16000..192000, GREENROOM_SKIP_VOTES, GREENROOM_IDLE_DISCONNECT_MINUTES, DATABASE_URL"
    );

    tokio::select! {
        res = client.start_autosharded() => {
            if let Err(why) = res {
                error!("Client error: {why:?}");
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Shutting down");
        }
    }

    METRICS.set_ready(false);
    music.shutdown().await;
    client.shard_manager.shutdown_all().await;
    Ok(())
}
