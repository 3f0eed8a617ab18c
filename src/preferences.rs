use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use serenity::all::{GuildId, UserId};

use crate::cache::TtlCache;
use crate::database::Database;
use crate::database::models::{UserPreference, UserPreferenceChanges};
use crate::error::{MusicError, MusicResult};

/// Decoded view of a preference row.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MusicPreferences {
    pub preferred_volume: i32,
    pub cannabis_music_enabled: bool,
    pub blocked_sources: Vec<String>,
    pub favorite_genres: Vec<String>,
    pub explicit_content_filter: bool,
}

impl MusicPreferences {
    pub fn blocks_source(&self, source: &str) -> bool {
        self.blocked_sources
            .iter()
            .any(|blocked| blocked.eq_ignore_ascii_case(source))
    }
}

impl TryFrom<&UserPreference> for MusicPreferences {
    type Error = MusicError;

    fn try_from(row: &UserPreference) -> Result<Self, Self::Error> {
        Ok(Self {
            preferred_volume: row.preferred_volume,
            cannabis_music_enabled: row.cannabis_music_enabled,
            blocked_sources: serde_json::from_str(&row.blocked_sources)?,
            favorite_genres: serde_json::from_str(&row.favorite_genres)?,
            explicit_content_filter: row.explicit_content_filter,
        })
    }
}

pub struct PreferenceStore {
    db: Database,
    cache: TtlCache<(UserId, GuildId), MusicPreferences>,
}

impl PreferenceStore {
    pub fn new(db: Database, ttl: Duration) -> Self {
        Self {
            db,
            cache: TtlCache::new(ttl),
        }
    }

    /// Read preferences, creating the default row on first access.
    pub fn get_or_create(&self, user_id: UserId, guild_id: GuildId) -> MusicResult<MusicPreferences> {
        let key = (user_id, guild_id);
        if let Some(prefs) = self.cache.get(&key) {
            return Ok(prefs);
        }
        let (user, guild) = (user_id.to_string(), guild_id.to_string());
        let row = self.db.with_conn(|conn| {
            UserPreference::get_or_create(conn, &user, &guild, Utc::now().naive_utc())
        })?;
        let prefs = MusicPreferences::try_from(&row)?;
        self.cache.insert(key, prefs.clone());
        Ok(prefs)
    }

    pub fn set_preferred_volume(
        &self,
        user_id: UserId,
        guild_id: GuildId,
        volume: i32,
    ) -> MusicResult<MusicPreferences> {
        if !(0..=100).contains(&volume) {
            return Err(MusicError::InvalidVolume(volume));
        }
        self.update(
            user_id,
            guild_id,
            UserPreferenceChanges {
                preferred_volume: Some(volume),
                ..Default::default()
            },
        )
    }

    pub fn set_cannabis_music_enabled(
        &self,
        user_id: UserId,
        guild_id: GuildId,
        enabled: bool,
    ) -> MusicResult<MusicPreferences> {
        self.update(
            user_id,
            guild_id,
            UserPreferenceChanges {
                cannabis_music_enabled: Some(enabled),
                ..Default::default()
            },
        )
    }

    pub fn set_blocked_sources(
        &self,
        user_id: UserId,
        guild_id: GuildId,
        sources: &[String],
    ) -> MusicResult<MusicPreferences> {
        self.update(
            user_id,
            guild_id,
            UserPreferenceChanges {
                blocked_sources: Some(serde_json::to_string(sources)?),
                ..Default::default()
            },
        )
    }

    pub fn set_favorite_genres(
        &self,
        user_id: UserId,
        guild_id: GuildId,
        genres: &[String],
    ) -> MusicResult<MusicPreferences> {
        self.update(
            user_id,
            guild_id,
            UserPreferenceChanges {
                favorite_genres: Some(serde_json::to_string(genres)?),
                ..Default::default()
            },
        )
    }

    pub fn set_explicit_filter(
        &self,
        user_id: UserId,
        guild_id: GuildId,
        enabled: bool,
    ) -> MusicResult<MusicPreferences> {
        self.update(
            user_id,
            guild_id,
            UserPreferenceChanges {
                explicit_content_filter: Some(enabled),
                ..Default::default()
            },
        )
    }

    fn update(
        &self,
        user_id: UserId,
        guild_id: GuildId,
        mut changes: UserPreferenceChanges,
    ) -> MusicResult<MusicPreferences> {
        let (user, guild) = (user_id.to_string(), guild_id.to_string());
        let now = Utc::now().naive_utc();
        changes.updated_at = Some(now);
        let row = self.db.transaction(|conn| {
            let existing = UserPreference::get_or_create(conn, &user, &guild, now)?;
            UserPreference::apply(conn, existing.id, &changes)
        })?;
        self.cache.invalidate(&(user_id, guild_id));
        MusicPreferences::try_from(&row)
    }
}
