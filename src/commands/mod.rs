//! Slash commands and now-playing buttons. Each handler maps one interaction
//! onto one engine call and replies with plain text.

pub mod buttons;
pub mod join;
pub mod play;
pub mod playback;
pub mod preferences;
pub mod queue;
pub mod skip;
pub mod stop;

use anyhow::{Result, anyhow};
use serenity::all::{
    ChannelId, CommandDataOptionValue, CommandInteraction, Context as SerenityContext,
    CreateCommand, CreateInteractionResponse, CreateInteractionResponseMessage,
    EditInteractionResponse, GuildId, UserId,
};
use tracing::error;

use crate::engine::MusicService;
use crate::error::MusicResult;
use crate::outcome::Outcome;

pub fn definitions() -> Vec<CreateCommand> {
    vec![
        join::definition(),
        play::definition(),
        skip::definition(),
        playback::pause_definition(),
        playback::resume_definition(),
        playback::volume_definition(),
        playback::loop_definition(),
        queue::queue_definition(),
        queue::shuffle_definition(),
        queue::remove_definition(),
        queue::clear_definition(),
        stop::definition(),
        preferences::definition(),
    ]
}

pub async fn dispatch(ctx: &SerenityContext, cmd: &CommandInteraction, music: &MusicService) {
    let res = match cmd.data.name.as_str() {
        "join" => join::handle(ctx, cmd, music).await,
        "play" => play::handle(ctx, cmd, music).await,
        "skip" => skip::handle(ctx, cmd, music).await,
        "pause" => playback::pause(ctx, cmd, music).await,
        "resume" => playback::resume(ctx, cmd, music).await,
        "volume" => playback::volume(ctx, cmd, music).await,
        "loop" => playback::set_loop(ctx, cmd, music).await,
        "queue" => queue::show(ctx, cmd, music).await,
        "shuffle" => queue::shuffle(ctx, cmd, music).await,
        "remove" => queue::remove(ctx, cmd, music).await,
        "clear" => queue::clear(ctx, cmd, music).await,
        "stop" => stop::handle(ctx, cmd, music).await,
        "musicprefs" => preferences::handle(ctx, cmd, music).await,
        _ => return,
    };
    if let Err(why) = res {
        error!("/{} failed: {why:?}", cmd.data.name);
    }
}

pub(crate) fn guild_of(cmd: &CommandInteraction) -> Result<GuildId> {
    cmd.guild_id.ok_or_else(|| anyhow!("not in a guild"))
}

/// Voice channel `user_id` sits in, from the gateway cache.
pub(crate) fn voice_channel_of(
    ctx: &SerenityContext,
    guild_id: GuildId,
    user_id: UserId,
) -> Option<ChannelId> {
    let guild = ctx.cache.guild(guild_id)?;
    guild
        .voice_states
        .get(&user_id)
        .and_then(|vs| vs.channel_id)
}

fn option<'a>(cmd: &'a CommandInteraction, name: &str) -> Option<&'a CommandDataOptionValue> {
    cmd.data
        .options
        .iter()
        .find(|o| o.name == name)
        .map(|o| &o.value)
}

pub(crate) fn string_option<'a>(cmd: &'a CommandInteraction, name: &str) -> Option<&'a str> {
    match option(cmd, name)? {
        CommandDataOptionValue::String(s) => Some(s.as_str()),
        _ => None,
    }
}

pub(crate) fn int_option(cmd: &CommandInteraction, name: &str) -> Option<i64> {
    match option(cmd, name)? {
        CommandDataOptionValue::Integer(i) => Some(*i),
        _ => None,
    }
}

pub(crate) fn bool_option(cmd: &CommandInteraction, name: &str) -> Option<bool> {
    match option(cmd, name)? {
        CommandDataOptionValue::Boolean(b) => Some(*b),
        _ => None,
    }
}

pub(crate) async fn defer(ctx: &SerenityContext, cmd: &CommandInteraction) {
    cmd.create_response(
        &ctx.http,
        CreateInteractionResponse::Defer(CreateInteractionResponseMessage::new()),
    )
    .await
    .ok();
}

pub(crate) async fn edit(ctx: &SerenityContext, cmd: &CommandInteraction, content: String) {
    cmd.edit_response(&ctx.http, EditInteractionResponse::new().content(content))
        .await
        .ok();
}

/// Render an engine result into reply text.
pub(crate) fn render<T>(res: MusicResult<T>, ok: impl FnOnce(&T) -> String) -> String {
    Outcome::from(res).message_or(ok)
}

pub(crate) fn format_duration(secs: Option<i32>) -> String {
    match secs {
        Some(s) if s >= 0 => format!("{}:{:02}", s / 60, s % 60),
        _ => "live".to_string(),
    }
}
