use anyhow::Result;
use serenity::all::{CommandInteraction, Context as SerenityContext, CreateCommand};

use super::{defer, edit, guild_of, render};
use crate::engine::{MusicService, SkipOutcome};

pub fn definition() -> CreateCommand {
    CreateCommand::new("skip")
        .description("Skip the current track, or vote to skip someone else's")
}

pub fn describe(outcome: &SkipOutcome) -> String {
    match outcome {
        SkipOutcome::Skipped {
            track,
            next: Some(next),
        } => format!("Skipped **{}**. Now playing **{}**.", track.title, next.title),
        SkipOutcome::Skipped { track, next: None } => {
            format!("Skipped **{}**. The queue is empty.", track.title)
        }
        SkipOutcome::VoteRegistered { votes, required } => {
            format!("Skip vote registered ({votes}/{required}).")
        }
    }
}

pub async fn handle(ctx: &SerenityContext, cmd: &CommandInteraction, music: &MusicService) -> Result<()> {
    defer(ctx, cmd).await;
    let guild_id = guild_of(cmd)?;
    let res = music.skip(guild_id, cmd.user.id).await;
    edit(ctx, cmd, render(res, describe)).await;
    Ok(())
}
