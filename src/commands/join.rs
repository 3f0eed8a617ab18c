use anyhow::Result;
use serenity::all::{
    CommandInteraction, CommandOptionType, Context as SerenityContext, CreateCommand,
    CreateCommandOption,
};

use super::{bool_option, defer, edit, guild_of, render, string_option, voice_channel_of};
use crate::engine::MusicService;
use crate::error::MusicError;
use crate::session::{SessionOptions, SessionType};

pub fn definition() -> CreateCommand {
    let kind = CreateCommandOption::new(CommandOptionType::String, "type", "Kind of session")
        .add_string_choice("General", "general")
        .add_string_choice("Meditation (21+)", "meditation")
        .add_string_choice("Educational (21+)", "educational");
    let cannabis = CreateCommandOption::new(
        CommandOptionType::Boolean,
        "cannabis",
        "Mark the session as cannabis content (21+)",
    );
    CreateCommand::new("join")
        .description("Join your voice channel and start a music session")
        .add_option(kind)
        .add_option(cannabis)
}

pub async fn handle(ctx: &SerenityContext, cmd: &CommandInteraction, music: &MusicService) -> Result<()> {
    defer(ctx, cmd).await;
    let guild_id = guild_of(cmd)?;

    let options = SessionOptions {
        session_type: string_option(cmd, "type")
            .and_then(|s| s.parse().ok())
            .unwrap_or(SessionType::General),
        cannabis_content: bool_option(cmd, "cannabis").unwrap_or(false),
    };

    let res = match voice_channel_of(ctx, guild_id, cmd.user.id) {
        Some(channel_id) => {
            music
                .join(guild_id, channel_id, cmd.channel_id, cmd.user.id, options)
                .await
        }
        None => Err(MusicError::NotInVoiceChannel),
    };

    let msg = render(res, |session| {
        let mut text = format!(
            "Joined <#{}> for a {} session at volume {}.",
            session.voice_channel_id, session.session_type, session.volume
        );
        if session.requires_21_plus {
            text.push_str(" This session is 21+.");
        }
        text
    });
    edit(ctx, cmd, msg).await;
    Ok(())
}
