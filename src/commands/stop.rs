use anyhow::Result;
use serenity::all::{CommandInteraction, Context as SerenityContext, CreateCommand};

use super::{defer, edit, guild_of, render};
use crate::engine::MusicService;

pub const END_USER_STOP: &str = "user_stop";

pub fn definition() -> CreateCommand {
    CreateCommand::new("stop").description("Stop playback, leave voice and end the session")
}

pub fn describe(left: &bool) -> String {
    if *left {
        "Stopped and disconnected. See you next session.".to_string()
    } else {
        "Not connected.".to_string()
    }
}

pub async fn handle(ctx: &SerenityContext, cmd: &CommandInteraction, music: &MusicService) -> Result<()> {
    defer(ctx, cmd).await;
    let guild_id = guild_of(cmd)?;
    let res = music.leave(guild_id, END_USER_STOP).await;
    edit(ctx, cmd, render(res, describe)).await;
    Ok(())
}
