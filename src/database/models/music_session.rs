use chrono::NaiveDateTime;
use diesel::prelude::*;
use serde::{Deserialize, Serialize};

use crate::database::schema::music_sessions;

pub const STATUS_ACTIVE: &str = "active";
pub const STATUS_PAUSED: &str = "paused";
pub const STATUS_ENDED: &str = "ended";

#[derive(Queryable, Selectable, Identifiable, Serialize, Deserialize, Debug, Clone, PartialEq)]
#[diesel(table_name = music_sessions)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub struct MusicSession {
    pub id: i32,
    pub guild_id: String,
    pub voice_channel_id: String,
    pub text_channel_id: String,
    pub started_by: String,
    pub session_type: String,
    pub status: String,
    pub is_cannabis_content: bool,
    pub requires_21_plus: bool,
    pub current_track_index: i32,
    pub volume: i32,
    pub metadata: String, // JSON object
    pub started_at: NaiveDateTime,
    pub ended_at: Option<NaiveDateTime>,
}

#[derive(Insertable)]
#[diesel(table_name = music_sessions)]
pub struct NewMusicSession {
    pub guild_id: String,
    pub voice_channel_id: String,
    pub text_channel_id: String,
    pub started_by: String,
    pub session_type: String,
    pub status: String,
    pub is_cannabis_content: bool,
    pub requires_21_plus: bool,
    pub volume: i32,
    pub metadata: String,
    pub started_at: NaiveDateTime,
}

impl MusicSession {
    pub fn create(
        conn: &mut SqliteConnection,
        new_session: &NewMusicSession,
    ) -> QueryResult<MusicSession> {
        diesel::insert_into(music_sessions::table)
            .values(new_session)
            .returning(MusicSession::as_returning())
            .get_result(conn)
    }

    pub fn find_by_id(conn: &mut SqliteConnection, id: i32) -> QueryResult<Option<MusicSession>> {
        music_sessions::table
            .find(id)
            .select(MusicSession::as_select())
            .first(conn)
            .optional()
    }

    /// The live (active or paused) session of a guild, if any.
    pub fn find_live(
        conn: &mut SqliteConnection,
        guild_id: &str,
    ) -> QueryResult<Option<MusicSession>> {
        music_sessions::table
            .filter(music_sessions::guild_id.eq(guild_id))
            .filter(music_sessions::status.ne(STATUS_ENDED))
            .select(MusicSession::as_select())
            .first(conn)
            .optional()
    }

    pub fn recent_for_guild(
        conn: &mut SqliteConnection,
        guild_id: &str,
        limit: i64,
    ) -> QueryResult<Vec<MusicSession>> {
        music_sessions::table
            .filter(music_sessions::guild_id.eq(guild_id))
            .order(music_sessions::started_at.desc())
            .then_order_by(music_sessions::id.desc())
            .limit(limit)
            .select(MusicSession::as_select())
            .load(conn)
    }

    pub fn update_status(conn: &mut SqliteConnection, id: i32, status: &str) -> QueryResult<usize> {
        diesel::update(music_sessions::table.find(id))
            .filter(music_sessions::status.ne(STATUS_ENDED))
            .set(music_sessions::status.eq(status))
            .execute(conn)
    }

    pub fn update_volume(conn: &mut SqliteConnection, id: i32, volume: i32) -> QueryResult<usize> {
        diesel::update(music_sessions::table.find(id))
            .set(music_sessions::volume.eq(volume))
            .execute(conn)
    }

    pub fn update_metadata(
        conn: &mut SqliteConnection,
        id: i32,
        metadata: &str,
    ) -> QueryResult<usize> {
        diesel::update(music_sessions::table.find(id))
            .set(music_sessions::metadata.eq(metadata))
            .execute(conn)
    }

    pub fn increment_track_index(conn: &mut SqliteConnection, id: i32) -> QueryResult<usize> {
        diesel::update(music_sessions::table.find(id))
            .set(music_sessions::current_track_index.eq(music_sessions::current_track_index + 1))
            .execute(conn)
    }

    /// Terminal transition. Only touches a row that has not ended yet, so
    /// `ended_at` is written once.
    pub fn end(
        conn: &mut SqliteConnection,
        id: i32,
        metadata: &str,
        ended_at: NaiveDateTime,
    ) -> QueryResult<usize> {
        diesel::update(music_sessions::table.find(id))
            .filter(music_sessions::status.ne(STATUS_ENDED))
            .set((
                music_sessions::status.eq(STATUS_ENDED),
                music_sessions::ended_at.eq(Some(ended_at)),
                music_sessions::metadata.eq(metadata),
            ))
            .execute(conn)
    }
}
