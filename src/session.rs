//! Session registry: the persisted record of one guild's music activity.

use std::fmt;
use std::str::FromStr;

use chrono::Utc;
use diesel::result::{DatabaseErrorKind, Error as DieselError};
use serde::{Deserialize, Serialize};
use serenity::all::{ChannelId, GuildId, UserId};
use tracing::info;

use crate::database::Database;
use crate::database::models::music_session::{
    MusicSession, NewMusicSession, STATUS_ACTIVE, STATUS_ENDED, STATUS_PAUSED,
};
use crate::error::{MusicError, MusicResult};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionType {
    #[default]
    General,
    Meditation,
    Educational,
}

impl SessionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionType::General => "general",
            SessionType::Meditation => "meditation",
            SessionType::Educational => "educational",
        }
    }

    /// Meditation and educational sessions are cannabis-themed in this community.
    pub fn is_cannabis_themed(&self) -> bool {
        !matches!(self, SessionType::General)
    }
}

impl FromStr for SessionType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "general" => Ok(SessionType::General),
            "meditation" => Ok(SessionType::Meditation),
            "educational" => Ok(SessionType::Educational),
            other => Err(format!("unknown session type: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    Active,
    Paused,
    Ended,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Active => STATUS_ACTIVE,
            SessionStatus::Paused => STATUS_PAUSED,
            SessionStatus::Ended => STATUS_ENDED,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoopMode {
    #[default]
    Off,
    Track,
    Queue,
}

impl fmt::Display for LoopMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            LoopMode::Off => "off",
            LoopMode::Track => "track",
            LoopMode::Queue => "queue",
        })
    }
}

impl FromStr for LoopMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "off" => Ok(LoopMode::Off),
            "track" => Ok(LoopMode::Track),
            "queue" => Ok(LoopMode::Queue),
            other => Err(format!("unknown loop mode: {other}")),
        }
    }
}

/// Metadata bag stored as JSON on the session row.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SessionMetadata {
    #[serde(default)]
    pub loop_mode: LoopMode,
    #[serde(default)]
    pub shuffle: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_reason: Option<String>,
}

/// Classification requested when a session is opened.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionOptions {
    pub session_type: SessionType,
    pub cannabis_content: bool,
}

impl SessionOptions {
    pub fn is_cannabis_content(&self) -> bool {
        self.cannabis_content || self.session_type.is_cannabis_themed()
    }
}

impl MusicSession {
    pub fn status_kind(&self) -> SessionStatus {
        match self.status.as_str() {
            STATUS_PAUSED => SessionStatus::Paused,
            STATUS_ENDED => SessionStatus::Ended,
            _ => SessionStatus::Active,
        }
    }

    pub fn parsed_metadata(&self) -> SessionMetadata {
        serde_json::from_str(&self.metadata).unwrap_or_default()
    }
}

#[derive(Clone)]
pub struct SessionRegistry {
    db: Database,
}

impl SessionRegistry {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Open a session for `guild_id`. Fails with `AlreadyActive` when the guild
    /// has a live session, including when a concurrent insert wins the race at
    /// the unique index.
    pub fn create_session(
        &self,
        guild_id: GuildId,
        voice_channel_id: ChannelId,
        text_channel_id: ChannelId,
        user_id: UserId,
        options: &SessionOptions,
        volume: i32,
    ) -> MusicResult<MusicSession> {
        let cannabis = options.is_cannabis_content();
        let new_session = NewMusicSession {
            guild_id: guild_id.to_string(),
            voice_channel_id: voice_channel_id.to_string(),
            text_channel_id: text_channel_id.to_string(),
            started_by: user_id.to_string(),
            session_type: options.session_type.as_str().to_string(),
            status: STATUS_ACTIVE.to_string(),
            is_cannabis_content: cannabis,
            requires_21_plus: cannabis,
            volume: volume.clamp(0, 100),
            metadata: serde_json::to_string(&SessionMetadata::default())?,
            started_at: Utc::now().naive_utc(),
        };

        let created = self.db.transaction(|conn| {
            if MusicSession::find_live(conn, &new_session.guild_id)?.is_some() {
                return Ok(None);
            }
            MusicSession::create(conn, &new_session).map(Some)
        });

        match created {
            Ok(Some(session)) => {
                info!(
                    "Session {} opened in guild {} ({}, 21+: {})",
                    session.id, guild_id, session.session_type, session.requires_21_plus
                );
                Ok(session)
            }
            Ok(None) | Err(DieselError::DatabaseError(DatabaseErrorKind::UniqueViolation, _)) => {
                Err(MusicError::AlreadyActive)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// End the live session of `guild_id`. Returns false when there is none.
    pub fn end_session(&self, guild_id: GuildId, reason: &str) -> MusicResult<bool> {
        let guild = guild_id.to_string();
        let ended = self.db.transaction(|conn| {
            let Some(session) = MusicSession::find_live(conn, &guild)? else {
                return Ok(false);
            };
            let mut metadata = session.parsed_metadata();
            metadata.end_reason = Some(reason.to_string());
            let metadata = serde_json::to_string(&metadata)
                .map_err(|e| DieselError::SerializationError(Box::new(e)))?;
            let changed = MusicSession::end(conn, session.id, &metadata, Utc::now().naive_utc())?;
            Ok(changed > 0)
        })?;
        if ended {
            info!("Session ended in guild {} ({})", guild_id, reason);
        }
        Ok(ended)
    }

    pub fn get_active_session(&self, guild_id: GuildId) -> MusicResult<Option<MusicSession>> {
        let guild = guild_id.to_string();
        Ok(self.db.with_conn(|conn| MusicSession::find_live(conn, &guild))?)
    }

    pub fn get(&self, session_id: i32) -> MusicResult<Option<MusicSession>> {
        Ok(self
            .db
            .with_conn(|conn| MusicSession::find_by_id(conn, session_id))?)
    }

    pub fn set_status(&self, session_id: i32, status: SessionStatus) -> MusicResult<()> {
        self.db
            .with_conn(|conn| MusicSession::update_status(conn, session_id, status.as_str()))?;
        Ok(())
    }

    pub fn set_volume(&self, session_id: i32, volume: i32) -> MusicResult<()> {
        self.db
            .with_conn(|conn| MusicSession::update_volume(conn, session_id, volume))?;
        Ok(())
    }

    pub fn advance_track_index(&self, session_id: i32) -> MusicResult<()> {
        self.db
            .with_conn(|conn| MusicSession::increment_track_index(conn, session_id))?;
        Ok(())
    }

    pub fn update_metadata(&self, session_id: i32, metadata: &SessionMetadata) -> MusicResult<()> {
        let json = serde_json::to_string(metadata)?;
        self.db
            .with_conn(|conn| MusicSession::update_metadata(conn, session_id, &json))?;
        Ok(())
    }

    pub fn recent_sessions(&self, guild_id: GuildId, limit: i64) -> MusicResult<Vec<MusicSession>> {
        let guild = guild_id.to_string();
        Ok(self
            .db
            .with_conn(|conn| MusicSession::recent_for_guild(conn, &guild, limit))?)
    }
}
