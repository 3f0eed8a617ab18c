use diesel::connection::SimpleConnection;
use diesel::prelude::*;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS music_sessions (
    id INTEGER PRIMARY KEY AUTOINCREMENT NOT NULL,
    guild_id TEXT NOT NULL,
    voice_channel_id TEXT NOT NULL,
    text_channel_id TEXT NOT NULL,
    started_by TEXT NOT NULL,
    session_type TEXT NOT NULL DEFAULT 'general',
    status TEXT NOT NULL DEFAULT 'active',
    is_cannabis_content BOOLEAN NOT NULL DEFAULT 0,
    requires_21_plus BOOLEAN NOT NULL DEFAULT 0,
    current_track_index INTEGER NOT NULL DEFAULT 0,
    volume INTEGER NOT NULL DEFAULT 50,
    metadata TEXT NOT NULL DEFAULT '{}',
    started_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP,
    ended_at TIMESTAMP,
    CHECK (NOT is_cannabis_content OR requires_21_plus),
    CHECK (volume BETWEEN 0 AND 100)
);

CREATE UNIQUE INDEX IF NOT EXISTS idx_music_sessions_one_live
    ON music_sessions (guild_id) WHERE status != 'ended';

CREATE TABLE IF NOT EXISTS music_queue (
    id INTEGER PRIMARY KEY AUTOINCREMENT NOT NULL,
    session_id INTEGER NOT NULL REFERENCES music_sessions (id),
    position INTEGER NOT NULL,
    url TEXT NOT NULL,
    title TEXT NOT NULL,
    duration INTEGER,
    requested_by TEXT NOT NULL,
    source TEXT NOT NULL DEFAULT 'youtube',
    is_cannabis_content BOOLEAN NOT NULL DEFAULT 0,
    metadata TEXT NOT NULL DEFAULT '{}',
    added_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP,
    played_at TIMESTAMP,
    removed_at TIMESTAMP,
    UNIQUE (session_id, position)
);

CREATE INDEX IF NOT EXISTS idx_music_queue_pending
    ON music_queue (session_id, played_at, position);

CREATE TABLE IF NOT EXISTS user_music_preferences (
    id INTEGER PRIMARY KEY AUTOINCREMENT NOT NULL,
    user_id TEXT NOT NULL,
    guild_id TEXT NOT NULL,
    preferred_volume INTEGER NOT NULL DEFAULT 50,
    cannabis_music_enabled BOOLEAN NOT NULL DEFAULT 0,
    blocked_sources TEXT NOT NULL DEFAULT '[]',
    favorite_genres TEXT NOT NULL DEFAULT '[]',
    explicit_content_filter BOOLEAN NOT NULL DEFAULT 1,
    created_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP,
    updated_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP,
    UNIQUE (user_id, guild_id)
);

CREATE TABLE IF NOT EXISTS age_verifications (
    user_id TEXT NOT NULL,
    guild_id TEXT NOT NULL,
    is_21_plus BOOLEAN NOT NULL DEFAULT 0,
    status TEXT NOT NULL DEFAULT 'pending',
    verified_at TIMESTAMP,
    expires_at TIMESTAMP,
    PRIMARY KEY (user_id, guild_id)
);
"#;

pub fn run_migrations(conn: &mut SqliteConnection) -> QueryResult<()> {
    conn.batch_execute(SCHEMA)
}
