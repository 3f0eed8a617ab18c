use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use songbird::driver::MixMode;

use crate::engine::MusicConfig;

pub fn read_discord_token() -> Result<String> {
    const CANDIDATES: &[&str] = &["DISCORD_TOKEN", "DISCORD_BOT_TOKEN", "BOT_TOKEN"];
    for key in CANDIDATES {
        if let Ok(val) = std::env::var(key)
            && !val.is_empty()
        {
            return Ok(val);
        }
    }
    Err(anyhow!(
        "Set one of DISCORD_TOKEN, DISCORD_BOT_TOKEN, or BOT_TOKEN in environment"
    ))
}

const DEFAULT_BITRATE: i32 = 96_000;

/// Runtime settings read from the environment once at startup.
#[derive(Debug, Clone)]
pub struct Settings {
    pub database_url: String,
    pub http_bind: String,
    pub bitrate: i32,
    pub mono: bool,
    pub music: MusicConfig,
}

impl Settings {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(get: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let defaults = MusicConfig::default();
        let idle_minutes: u64 = parse_or(&get, "GREENROOM_IDLE_DISCONNECT_MINUTES", 5)?;
        let bitrate = parse_or(&get, "GREENROOM_BITRATE", DEFAULT_BITRATE)?;

        Ok(Self {
            database_url: get("DATABASE_URL").unwrap_or_else(|| "greenroom.db".to_string()),
            http_bind: get("GREENROOM_HTTP_BIND").unwrap_or_else(|| "0.0.0.0:3000".to_string()),
            bitrate: if (16_000..=192_000).contains(&bitrate) {
                bitrate
            } else {
                DEFAULT_BITRATE
            },
            mono: get("GREENROOM_MIX_MODE").as_deref() == Some("mono"),
            music: MusicConfig {
                skip_votes: parse_or(&get, "GREENROOM_SKIP_VOTES", defaults.skip_votes)?,
                idle_disconnect: (idle_minutes > 0)
                    .then(|| Duration::from_secs(idle_minutes * 60)),
                max_queue: parse_or(&get, "GREENROOM_MAX_QUEUE", defaults.max_queue)?,
                access_cache_ttl: Duration::from_secs(parse_or(
                    &get,
                    "GREENROOM_ACCESS_CACHE_SECS",
                    defaults.access_cache_ttl.as_secs(),
                )?),
                preference_cache_ttl: Duration::from_secs(parse_or(
                    &get,
                    "GREENROOM_PREFERENCE_CACHE_SECS",
                    defaults.preference_cache_ttl.as_secs(),
                )?),
            },
        })
    }

    pub fn mix_mode(&self) -> MixMode {
        if self.mono {
            MixMode::Mono
        } else {
            MixMode::Stereo
        }
    }
}

fn parse_or<T>(get: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match get(key) {
        Some(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse()
            .with_context(|| format!("{key} must be a number, got {raw:?}")),
        _ => Ok(default),
    }
}
