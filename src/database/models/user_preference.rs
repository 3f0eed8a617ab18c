use chrono::NaiveDateTime;
use diesel::prelude::*;
use serde::{Deserialize, Serialize};

use crate::database::schema::user_music_preferences;

#[derive(Queryable, Selectable, Identifiable, Serialize, Deserialize, Debug, Clone, PartialEq)]
#[diesel(table_name = user_music_preferences)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub struct UserPreference {
    pub id: i32,
    pub user_id: String,
    pub guild_id: String,
    pub preferred_volume: i32,
    pub cannabis_music_enabled: bool,
    pub blocked_sources: String, // JSON array
    pub favorite_genres: String, // JSON array
    pub explicit_content_filter: bool,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
}

#[derive(Insertable)]
#[diesel(table_name = user_music_preferences)]
pub struct NewUserPreference {
    pub user_id: String,
    pub guild_id: String,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
}

/// Partial update; `None` fields are left untouched.
#[derive(AsChangeset, Default)]
#[diesel(table_name = user_music_preferences)]
pub struct UserPreferenceChanges {
    pub preferred_volume: Option<i32>,
    pub cannabis_music_enabled: Option<bool>,
    pub blocked_sources: Option<String>,
    pub favorite_genres: Option<String>,
    pub explicit_content_filter: Option<bool>,
    pub updated_at: Option<NaiveDateTime>,
}

impl UserPreference {
    pub fn find(
        conn: &mut SqliteConnection,
        user_id: &str,
        guild_id: &str,
    ) -> QueryResult<Option<UserPreference>> {
        user_music_preferences::table
            .filter(user_music_preferences::user_id.eq(user_id))
            .filter(user_music_preferences::guild_id.eq(guild_id))
            .select(UserPreference::as_select())
            .first(conn)
            .optional()
    }

    /// Insert defaults unless a row exists, then read the row back.
    pub fn get_or_create(
        conn: &mut SqliteConnection,
        user_id: &str,
        guild_id: &str,
        now: NaiveDateTime,
    ) -> QueryResult<UserPreference> {
        let defaults = NewUserPreference {
            user_id: user_id.to_string(),
            guild_id: guild_id.to_string(),
            created_at: now,
            updated_at: now,
        };

        diesel::insert_into(user_music_preferences::table)
            .values(&defaults)
            .on_conflict((
                user_music_preferences::user_id,
                user_music_preferences::guild_id,
            ))
            .do_nothing()
            .execute(conn)?;

        Self::find(conn, user_id, guild_id)?.ok_or(diesel::result::Error::NotFound)
    }

    pub fn apply(
        conn: &mut SqliteConnection,
        id: i32,
        changes: &UserPreferenceChanges,
    ) -> QueryResult<UserPreference> {
        diesel::update(user_music_preferences::table.find(id))
            .set(changes)
            .returning(UserPreference::as_returning())
            .get_result(conn)
    }
}
