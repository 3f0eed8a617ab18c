pub mod age_verification;
pub mod music_session;
pub mod queue_entry;
pub mod user_preference;

pub use age_verification::AgeVerification;
pub use music_session::{MusicSession, NewMusicSession};
pub use queue_entry::{NewQueueEntry, QueueEntry};
pub use user_preference::{UserPreference, UserPreferenceChanges};
