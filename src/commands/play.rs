use anyhow::{Result, anyhow};
use serenity::all::{
    CommandInteraction, CommandOptionType, Context as SerenityContext, CreateCommand,
    CreateCommandOption, EditInteractionResponse,
};

use super::{bool_option, buttons, defer, format_duration, guild_of, render, string_option};
use crate::engine::{MusicService, PlayOutcome, TrackRequest};

pub fn definition() -> CreateCommand {
    let query = CreateCommandOption::new(CommandOptionType::String, "query", "URL or search terms")
        .required(true);
    let cannabis = CreateCommandOption::new(
        CommandOptionType::Boolean,
        "cannabis",
        "The track is cannabis content (21+)",
    );
    CreateCommand::new("play")
        .description("Play a track, or queue it behind the current one")
        .add_option(query)
        .add_option(cannabis)
}

pub async fn handle(ctx: &SerenityContext, cmd: &CommandInteraction, music: &MusicService) -> Result<()> {
    let query = string_option(cmd, "query").ok_or_else(|| anyhow!("missing query"))?;
    defer(ctx, cmd).await;
    let guild_id = guild_of(cmd)?;

    let request = TrackRequest::new(query, cmd.user.id)
        .cannabis(bool_option(cmd, "cannabis").unwrap_or(false));
    let res = music.play(guild_id, request).await;
    let started = matches!(res, Ok(PlayOutcome::Started { .. }));

    let msg = render(res, |outcome| match outcome {
        PlayOutcome::Started { track } => format!(
            "Now playing **{}** [{}]",
            track.info.title,
            format_duration(track.info.duration_secs)
        ),
        PlayOutcome::Queued {
            position,
            title,
            ahead,
        } => format!("Queued **{title}** at position {position} ({ahead} ahead)"),
    });

    let mut edit = EditInteractionResponse::new().content(msg);
    if started {
        edit = edit.components(buttons::now_playing_controls(false));
    }
    cmd.edit_response(&ctx.http, edit).await.ok();
    Ok(())
}
