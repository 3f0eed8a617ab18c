use anyhow::Result;
use serenity::all::{
    CommandInteraction, CommandOptionType, Context as SerenityContext, CreateCommand,
    CreateCommandOption, GuildId, UserId,
};

use super::{bool_option, defer, edit, guild_of, int_option, render, string_option};
use crate::engine::MusicService;
use crate::error::MusicResult;
use crate::preferences::{MusicPreferences, PreferenceStore};

pub fn definition() -> CreateCommand {
    CreateCommand::new("musicprefs")
        .description("Show or change your music preferences in this server")
        .add_option(CreateCommandOption::new(
            CommandOptionType::Integer,
            "volume",
            "Volume your sessions start at (0-100)",
        ))
        .add_option(CreateCommandOption::new(
            CommandOptionType::Boolean,
            "cannabis_music",
            "Opt in to cannabis-themed music",
        ))
        .add_option(CreateCommandOption::new(
            CommandOptionType::String,
            "blocked_sources",
            "Comma separated sources to refuse, e.g. soundcloud (\"none\" clears)",
        ))
        .add_option(CreateCommandOption::new(
            CommandOptionType::String,
            "favorite_genres",
            "Comma separated genres (\"none\" clears)",
        ))
        .add_option(CreateCommandOption::new(
            CommandOptionType::Boolean,
            "explicit_filter",
            "Filter explicit content",
        ))
}

/// Requested changes; `None` leaves the stored value alone.
#[derive(Debug, Default, PartialEq)]
pub struct PreferenceChanges {
    pub volume: Option<i32>,
    pub cannabis_music: Option<bool>,
    pub blocked_sources: Option<Vec<String>>,
    pub favorite_genres: Option<Vec<String>>,
    pub explicit_filter: Option<bool>,
}

/// Split a comma separated option. `none` (or nothing but commas) clears the list.
pub fn parse_list(raw: &str) -> Vec<String> {
    if raw.trim().eq_ignore_ascii_case("none") {
        return Vec::new();
    }
    raw.split(',')
        .map(|item| item.trim().to_ascii_lowercase())
        .filter(|item| !item.is_empty())
        .collect()
}

pub fn apply(
    store: &PreferenceStore,
    user_id: UserId,
    guild_id: GuildId,
    changes: &PreferenceChanges,
) -> MusicResult<MusicPreferences> {
    let mut prefs = store.get_or_create(user_id, guild_id)?;
    if let Some(volume) = changes.volume {
        prefs = store.set_preferred_volume(user_id, guild_id, volume)?;
    }
    if let Some(enabled) = changes.cannabis_music {
        prefs = store.set_cannabis_music_enabled(user_id, guild_id, enabled)?;
    }
    if let Some(sources) = &changes.blocked_sources {
        prefs = store.set_blocked_sources(user_id, guild_id, sources)?;
    }
    if let Some(genres) = &changes.favorite_genres {
        prefs = store.set_favorite_genres(user_id, guild_id, genres)?;
    }
    if let Some(enabled) = changes.explicit_filter {
        prefs = store.set_explicit_filter(user_id, guild_id, enabled)?;
    }
    Ok(prefs)
}

fn list_or_none(items: &[String]) -> String {
    if items.is_empty() {
        "none".to_string()
    } else {
        items.join(", ")
    }
}

fn on_off(flag: bool) -> &'static str {
    if flag { "on" } else { "off" }
}

pub fn describe(prefs: &MusicPreferences) -> String {
    format!(
        "Start volume {}. Cannabis music {}. Explicit filter {}.\nBlocked sources: {}\nFavorite genres: {}",
        prefs.preferred_volume,
        on_off(prefs.cannabis_music_enabled),
        on_off(prefs.explicit_content_filter),
        list_or_none(&prefs.blocked_sources),
        list_or_none(&prefs.favorite_genres)
    )
}

pub async fn handle(ctx: &SerenityContext, cmd: &CommandInteraction, music: &MusicService) -> Result<()> {
    defer(ctx, cmd).await;
    let guild_id = guild_of(cmd)?;
    let changes = PreferenceChanges {
        // Out-of-i32 input is out of range anyway.
        volume: int_option(cmd, "volume").map(|v| i32::try_from(v).unwrap_or(i32::MAX)),
        cannabis_music: bool_option(cmd, "cannabis_music"),
        blocked_sources: string_option(cmd, "blocked_sources").map(parse_list),
        favorite_genres: string_option(cmd, "favorite_genres").map(parse_list),
        explicit_filter: bool_option(cmd, "explicit_filter"),
    };
    let res = apply(music.preferences(), cmd.user.id, guild_id, &changes);
    edit(ctx, cmd, render(res, describe)).await;
    Ok(())
}
