use anyhow::{Result, anyhow};
use serenity::all::{
    CommandInteraction, CommandOptionType, Context as SerenityContext, CreateCommand,
    CreateCommandOption,
};

use super::{defer, edit, guild_of, int_option, render, string_option};
use crate::engine::{MusicService, VolumeChange};
use crate::session::LoopMode;

pub fn pause_definition() -> CreateCommand {
    CreateCommand::new("pause").description("Pause the current track")
}

pub fn resume_definition() -> CreateCommand {
    CreateCommand::new("resume").description("Resume a paused track")
}

pub fn volume_definition() -> CreateCommand {
    let level = CreateCommandOption::new(CommandOptionType::Integer, "level", "Volume 0-100")
        .required(true);
    CreateCommand::new("volume")
        .description("Set the session volume")
        .add_option(level)
}

pub fn loop_definition() -> CreateCommand {
    let mode = CreateCommandOption::new(CommandOptionType::String, "mode", "What to repeat")
        .required(true)
        .add_string_choice("Off", "off")
        .add_string_choice("Track", "track")
        .add_string_choice("Queue", "queue");
    CreateCommand::new("loop")
        .description("Repeat the current track or the whole queue")
        .add_option(mode)
}

pub async fn pause(ctx: &SerenityContext, cmd: &CommandInteraction, music: &MusicService) -> Result<()> {
    defer(ctx, cmd).await;
    let guild_id = guild_of(cmd)?;
    let msg = render(music.pause(guild_id).await, |paused| {
        if *paused {
            "Paused.".to_string()
        } else {
            "Nothing to pause.".to_string()
        }
    });
    edit(ctx, cmd, msg).await;
    Ok(())
}

pub async fn resume(ctx: &SerenityContext, cmd: &CommandInteraction, music: &MusicService) -> Result<()> {
    defer(ctx, cmd).await;
    let guild_id = guild_of(cmd)?;
    let msg = render(music.resume(guild_id).await, |resumed| {
        if *resumed {
            "Resumed.".to_string()
        } else {
            "Nothing is paused.".to_string()
        }
    });
    edit(ctx, cmd, msg).await;
    Ok(())
}

pub fn describe_volume(change: &VolumeChange) -> String {
    if change.applied_live {
        format!("Volume set to {}.", change.level)
    } else {
        format!("Volume set to {}. It applies from the next track.", change.level)
    }
}

pub async fn volume(ctx: &SerenityContext, cmd: &CommandInteraction, music: &MusicService) -> Result<()> {
    let level = int_option(cmd, "level").ok_or_else(|| anyhow!("missing level"))?;
    defer(ctx, cmd).await;
    let guild_id = guild_of(cmd)?;
    // Out-of-i32 input is out of range anyway.
    let level = i32::try_from(level).unwrap_or(i32::MAX);
    let msg = render(music.set_volume(guild_id, level).await, describe_volume);
    edit(ctx, cmd, msg).await;
    Ok(())
}

pub async fn set_loop(ctx: &SerenityContext, cmd: &CommandInteraction, music: &MusicService) -> Result<()> {
    let mode: LoopMode = string_option(cmd, "mode")
        .ok_or_else(|| anyhow!("missing mode"))?
        .parse()
        .map_err(|e: String| anyhow!(e))?;
    defer(ctx, cmd).await;
    let guild_id = guild_of(cmd)?;
    let msg = render(music.set_loop_mode(guild_id, mode).await, |mode| {
        format!("Loop mode: {mode}.")
    });
    edit(ctx, cmd, msg).await;
    Ok(())
}
