use anyhow::{Result, anyhow};
use serenity::all::{
    ButtonStyle, ComponentInteraction, Context as SerenityContext, CreateActionRow, CreateButton,
    CreateInteractionResponse, CreateInteractionResponseMessage, EditInteractionResponse,
};
use tracing::debug;

use super::{render, skip, stop};
use crate::engine::MusicService;

pub mod button_ids {
    pub const PAUSE: &str = "music:pause";
    pub const RESUME: &str = "music:resume";
    pub const SKIP: &str = "music:skip";
    pub const STOP: &str = "music:stop";
}

/// Controls attached to a now-playing reply. The first button toggles
/// between pause and resume.
pub fn now_playing_controls(paused: bool) -> Vec<CreateActionRow> {
    let toggle = if paused {
        CreateButton::new(button_ids::RESUME)
            .label("Resume")
            .style(ButtonStyle::Success)
    } else {
        CreateButton::new(button_ids::PAUSE)
            .label("Pause")
            .style(ButtonStyle::Primary)
    };
    let skip = CreateButton::new(button_ids::SKIP)
        .label("Skip")
        .style(ButtonStyle::Secondary);
    let stop = CreateButton::new(button_ids::STOP)
        .label("Stop")
        .style(ButtonStyle::Danger);
    vec![CreateActionRow::Buttons(vec![toggle, skip, stop])]
}

pub async fn handle(
    ctx: &SerenityContext,
    interaction: &ComponentInteraction,
    music: &MusicService,
) -> Result<()> {
    let guild_id = interaction
        .guild_id
        .ok_or_else(|| anyhow!("not in a guild"))?;

    match interaction.data.custom_id.as_str() {
        button_ids::PAUSE | button_ids::RESUME => {
            let pausing = interaction.data.custom_id == button_ids::PAUSE;
            let res = if pausing {
                music.pause(guild_id).await
            } else {
                music.resume(guild_id).await
            };
            match res {
                Ok(true) => {
                    let update = CreateInteractionResponseMessage::new()
                        .components(now_playing_controls(pausing));
                    interaction
                        .create_response(&ctx.http, CreateInteractionResponse::UpdateMessage(update))
                        .await?;
                }
                other => {
                    let text = render(other, |_| "Nothing to do.".to_string());
                    reply_ephemeral(ctx, interaction, text).await?;
                }
            }
        }
        button_ids::SKIP => {
            interaction.defer_ephemeral(&ctx.http).await?;
            let res = music.skip(guild_id, interaction.user.id).await;
            follow_up(ctx, interaction, render(res, skip::describe)).await?;
        }
        button_ids::STOP => {
            interaction.defer_ephemeral(&ctx.http).await?;
            let res = music.leave(guild_id, stop::END_USER_STOP).await;
            follow_up(ctx, interaction, render(res, stop::describe)).await?;
        }
        unknown => debug!("ignoring component {unknown}"),
    }
    Ok(())
}

async fn reply_ephemeral(
    ctx: &SerenityContext,
    interaction: &ComponentInteraction,
    content: String,
) -> Result<()> {
    let msg = CreateInteractionResponseMessage::new()
        .content(content)
        .ephemeral(true);
    interaction
        .create_response(&ctx.http, CreateInteractionResponse::Message(msg))
        .await?;
    Ok(())
}

async fn follow_up(
    ctx: &SerenityContext,
    interaction: &ComponentInteraction,
    content: String,
) -> Result<()> {
    interaction
        .edit_response(&ctx.http, EditInteractionResponse::new().content(content))
        .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn toggle_button_follows_pause_state() {
        let playing = format!("{:?}", now_playing_controls(false));
        let paused = format!("{:?}", now_playing_controls(true));
        assert!(playing.contains(button_ids::PAUSE));
        assert!(!playing.contains(button_ids::RESUME));
        assert!(paused.contains(button_ids::RESUME));
        assert!(paused.contains(button_ids::STOP));
    }
}
