use anyhow::{Result, anyhow};
use serenity::all::{
    CommandInteraction, CommandOptionType, Context as SerenityContext, CreateCommand,
    CreateCommandOption,
};

use super::{bool_option, defer, edit, format_duration, guild_of, int_option, render};
use crate::engine::{MusicService, PlaybackStatus};

pub fn queue_definition() -> CreateCommand {
    CreateCommand::new("queue").description("Show what's playing and what's next")
}

pub fn shuffle_definition() -> CreateCommand {
    CreateCommand::new("shuffle").description("Shuffle the tracks that haven't played yet")
}

pub fn remove_definition() -> CreateCommand {
    let position = CreateCommandOption::new(
        CommandOptionType::Integer,
        "position",
        "Queue position shown by /queue",
    )
    .required(true);
    CreateCommand::new("remove")
        .description("Remove a queued track")
        .add_option(position)
}

pub fn clear_definition() -> CreateCommand {
    let confirm = CreateCommandOption::new(
        CommandOptionType::Boolean,
        "confirm",
        "Yes, drop every queued track",
    )
    .required(true);
    CreateCommand::new("clear")
        .description("Drop every track that hasn't played yet")
        .add_option(confirm)
}

pub fn describe_status(status: &PlaybackStatus) -> String {
    let mut lines = Vec::new();
    match &status.current {
        Some(track) => lines.push(format!(
            "{} **{}** [{}] (requested by <@{}>)",
            if status.is_paused { "Paused:" } else { "Now playing:" },
            track.info.title,
            format_duration(track.info.duration_secs),
            track.requested_by
        )),
        None => lines.push("Nothing is playing.".to_string()),
    }
    if status.upcoming.is_empty() {
        lines.push("The queue is empty.".to_string());
    } else {
        for entry in &status.upcoming {
            lines.push(format!(
                "`{}.` {} [{}]",
                entry.position,
                entry.title,
                format_duration(entry.duration)
            ));
        }
    }
    lines.push(format!(
        "{} queued, {} played, about {} min left. Volume {}, loop {}.",
        status.stats.unplayed_tracks,
        status.stats.played_tracks,
        status.stats.estimated_playtime_minutes,
        status.volume,
        status.loop_mode
    ));
    lines.join("\n")
}

pub async fn show(ctx: &SerenityContext, cmd: &CommandInteraction, music: &MusicService) -> Result<()> {
    defer(ctx, cmd).await;
    let guild_id = guild_of(cmd)?;
    let msg = render(music.status(guild_id).await, describe_status);
    edit(ctx, cmd, msg).await;
    Ok(())
}

pub async fn shuffle(ctx: &SerenityContext, cmd: &CommandInteraction, music: &MusicService) -> Result<()> {
    defer(ctx, cmd).await;
    let guild_id = guild_of(cmd)?;
    let msg = render(music.shuffle(guild_id).await, |shuffled| {
        if *shuffled {
            "Shuffled the queue.".to_string()
        } else {
            "Need at least two queued tracks to shuffle.".to_string()
        }
    });
    edit(ctx, cmd, msg).await;
    Ok(())
}

pub async fn remove(ctx: &SerenityContext, cmd: &CommandInteraction, music: &MusicService) -> Result<()> {
    let position = int_option(cmd, "position").ok_or_else(|| anyhow!("missing position"))?;
    defer(ctx, cmd).await;
    let guild_id = guild_of(cmd)?;
    let position = i32::try_from(position).unwrap_or(-1);
    let msg = render(music.remove(guild_id, position).await, |_| {
        format!("Removed the track at position {position}.")
    });
    edit(ctx, cmd, msg).await;
    Ok(())
}

pub async fn clear(ctx: &SerenityContext, cmd: &CommandInteraction, music: &MusicService) -> Result<()> {
    defer(ctx, cmd).await;
    let guild_id = guild_of(cmd)?;
    let confirmed = bool_option(cmd, "confirm").unwrap_or(false);
    let msg = render(music.clear(guild_id, confirmed).await, |n| {
        format!("Cleared {n} queued track(s).")
    });
    edit(ctx, cmd, msg).await;
    Ok(())
}
