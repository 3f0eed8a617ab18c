use std::fmt;

use serde::Serialize;

/// Why the age gate refused a cannabis-flagged action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DenyReason {
    NotFound,
    NotVerified,
    Expired,
}

impl DenyReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            DenyReason::NotFound => "not_found",
            DenyReason::NotVerified => "not_verified",
            DenyReason::Expired => "expired",
        }
    }
}

impl fmt::Display for DenyReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum MusicError {
    #[error("no active music session in this server")]
    NoSession,

    #[error("a music session is already active in this server")]
    AlreadyActive,

    #[error("nothing is playing right now")]
    NotPlaying,

    #[error("volume must be between 0 and 100, got {0}")]
    InvalidVolume(i32),

    #[error("you must be in a voice channel")]
    NotInVoiceChannel,

    #[error("the queue is full (max {0} tracks)")]
    QueueFull(usize),

    #[error("no queued track at position {0}")]
    EntryNotFound(i32),

    #[error("clearing the queue needs explicit confirmation")]
    ConfirmationRequired,

    #[error("tracks from {0} are blocked in your preferences")]
    SourceBlocked(String),

    #[error("age verification required ({0})")]
    AccessDenied(DenyReason),

    #[error("database error: {0}")]
    Database(#[from] diesel::result::Error),

    #[error("voice connection error: {0}")]
    Voice(String),

    #[error("track not found: {0}")]
    TrackNotFound(String),

    #[error("track cannot be played: {0}")]
    Unplayable(String),

    #[error("invalid metadata: {0}")]
    Metadata(#[from] serde_json::Error),
}

impl MusicError {
    /// Stable code for front-ends to branch on.
    pub fn code(&self) -> &'static str {
        match self {
            MusicError::NoSession => "no_session",
            MusicError::AlreadyActive => "already_active",
            MusicError::NotPlaying => "not_playing",
            MusicError::InvalidVolume(_) => "invalid_volume",
            MusicError::NotInVoiceChannel => "not_in_voice_channel",
            MusicError::QueueFull(_) => "queue_full",
            MusicError::EntryNotFound(_) => "entry_not_found",
            MusicError::ConfirmationRequired => "confirmation_required",
            MusicError::SourceBlocked(_) => "source_blocked",
            MusicError::AccessDenied(reason) => match reason {
                DenyReason::NotFound => "verification_not_found",
                DenyReason::NotVerified => "verification_required",
                DenyReason::Expired => "verification_expired",
            },
            MusicError::Database(_) => "database",
            MusicError::Voice(_) => "voice",
            MusicError::TrackNotFound(_) => "track_not_found",
            MusicError::Unplayable(_) => "unplayable",
            MusicError::Metadata(_) => "metadata",
        }
    }

    /// Business-rule failures the caller is expected to handle. Everything else
    /// is infrastructure and gets logged.
    pub fn is_expected(&self) -> bool {
        !matches!(
            self,
            MusicError::Database(_)
                | MusicError::Voice(_)
                | MusicError::TrackNotFound(_)
                | MusicError::Unplayable(_)
                | MusicError::Metadata(_)
        )
    }

    /// Text that is safe to show to a Discord user.
    pub fn user_message(&self) -> String {
        match self {
            MusicError::AccessDenied(DenyReason::NotFound) => {
                "This content is 21+. Please complete age verification first.".to_string()
            }
            MusicError::AccessDenied(DenyReason::NotVerified) => {
                "This content is 21+ and your age verification is not approved.".to_string()
            }
            MusicError::AccessDenied(DenyReason::Expired) => {
                "This content is 21+ and your age verification has expired. Please verify again."
                    .to_string()
            }
            MusicError::TrackNotFound(_) => "Couldn't find that track.".to_string(),
            MusicError::Unplayable(_) => "That track can't be played.".to_string(),
            e if e.is_expected() => e.to_string(),
            _ => "Something went wrong, please try again later.".to_string(),
        }
    }
}

pub type MusicResult<T> = Result<T, MusicError>;
