//! Turning a URL or search query into something the voice transport can play.

use std::{path::PathBuf, process::Stdio};

use anyhow::{Context as AnyhowContext, Result, anyhow};
use once_cell::sync::Lazy;
use reqwest::header::{ACCEPT, USER_AGENT};
use serde::{Deserialize, Serialize};
use serenity::async_trait;
use tokio::{fs, process::Command as TokioCommand};
use tracing::{debug, info};

use crate::error::{MusicError, MusicResult};

static HTTP: Lazy<reqwest::Client> = Lazy::new(|| {
    reqwest::Client::builder()
        .user_agent("greenroom-bot/0.1")
        .build()
        .expect("client")
});

const GITHUB_RELEASES_API: &str = "https://api.github.com/repos/yt-dlp/yt-dlp/releases/latest";

/// Descriptive metadata of a track, as stored in the queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrackInfo {
    pub title: String,
    pub url: String,
    pub duration_secs: Option<i32>,
    pub thumbnail: Option<String>,
    pub author: Option<String>,
    /// Lower-case platform tag, e.g. `youtube` or `soundcloud`.
    pub source: String,
}

/// Where the audio bytes come from.
#[derive(Debug, Clone, PartialEq)]
pub enum AudioSource {
    File(PathBuf),
    Http(String),
}

#[derive(Debug, Clone)]
pub struct ResolvedTrack {
    pub source: AudioSource,
    pub info: TrackInfo,
}

#[async_trait]
pub trait TrackResolver: Send + Sync {
    /// Resolve a URL or free-text search into a playable track.
    async fn resolve(&self, query: &str) -> MusicResult<ResolvedTrack>;
}

/// Resolver backed by yt-dlp. Audio is downloaded to mp3 once per video id and
/// served from the download folder afterwards.
pub struct YtDlpResolver;

#[async_trait]
impl TrackResolver for YtDlpResolver {
    async fn resolve(&self, query: &str) -> MusicResult<ResolvedTrack> {
        let target = search_target(query);
        let ytdlp = ensure_yt_dlp()
            .await
            .map_err(|e| MusicError::Unplayable(format!("yt-dlp unavailable: {e}")))?;

        let meta = ytdlp_metadata(&ytdlp, &target).await.map_err(|e| {
            debug!("yt-dlp metadata lookup failed for {}: {e:?}", target);
            MusicError::TrackNotFound(query.to_string())
        })?;
        let info = meta.track_info(&target);

        let path = download_mp3(&ytdlp, &info.url, &meta.id)
            .await
            .map_err(|e| MusicError::Unplayable(format!("{}: {e}", info.title)))?;
        info!("Resolved '{}' to {}", info.title, path.display());

        Ok(ResolvedTrack {
            source: AudioSource::File(path),
            info,
        })
    }
}

/// URLs are passed through; anything else becomes a single-result YouTube search.
pub fn search_target(query: &str) -> String {
    let trimmed = query.trim();
    match url::Url::parse(trimmed) {
        Ok(u) if matches!(u.scheme(), "http" | "https") => trimmed.to_string(),
        _ => format!("ytsearch1:{trimmed}"),
    }
}

#[derive(Debug, Deserialize)]
struct YtDlpInfo {
    #[serde(default)]
    id: String,
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    duration: Option<f64>,
    #[serde(default)]
    thumbnail: Option<String>,
    #[serde(default)]
    uploader: Option<String>,
    #[serde(default)]
    webpage_url: Option<String>,
    #[serde(default)]
    extractor_key: Option<String>,
    #[serde(default)]
    entries: Option<Vec<YtDlpInfo>>,
}

impl YtDlpInfo {
    /// Search results come back as a playlist; take its first entry.
    fn into_single(self) -> Option<YtDlpInfo> {
        match self.entries {
            Some(entries) => entries.into_iter().next(),
            None => Some(self),
        }
    }

    fn track_info(&self, fallback_url: &str) -> TrackInfo {
        TrackInfo {
            title: self
                .title
                .clone()
                .unwrap_or_else(|| "Unknown title".to_string()),
            url: self
                .webpage_url
                .clone()
                .unwrap_or_else(|| fallback_url.to_string()),
            duration_secs: self.duration.map(|d| d.round() as i32),
            thumbnail: self.thumbnail.clone(),
            author: self.uploader.clone(),
            source: self
                .extractor_key
                .as_deref()
                .unwrap_or("unknown")
                .to_ascii_lowercase(),
        }
    }
}

fn parse_metadata(raw: &[u8]) -> Result<YtDlpInfo> {
    let info: YtDlpInfo = serde_json::from_slice(raw).context("parsing yt-dlp json")?;
    let single = info
        .into_single()
        .ok_or_else(|| anyhow!("search returned no results"))?;
    if single.id.is_empty() {
        return Err(anyhow!("yt-dlp returned no video id"));
    }
    Ok(single)
}

async fn ytdlp_metadata(ytdlp: &PathBuf, target: &str) -> Result<YtDlpInfo> {
    let out = TokioCommand::new(ytdlp)
        .arg("--dump-single-json")
        .arg("--skip-download")
        .arg("--no-playlist")
        .arg("-q")
        .arg(target)
        .stdin(Stdio::null())
        .output()
        .await
        .context("running yt-dlp to read metadata")?;
    if !out.status.success() {
        return Err(anyhow!("yt-dlp metadata failed with status: {}", out.status));
    }
    parse_metadata(&out.stdout)
}

#[derive(Debug, Deserialize)]
struct ReleaseAsset {
    name: String,
    browser_download_url: String,
}

#[derive(Debug, Deserialize)]
struct ReleaseInfo {
    assets: Vec<ReleaseAsset>,
}

fn cache_dir() -> Result<PathBuf> {
    let base = dirs::cache_dir().ok_or_else(|| anyhow!("no cache dir available on this system"))?;
    Ok(base.join("greenroom").join("yt-dlp"))
}

fn platform_asset_name() -> &'static str {
    if cfg!(target_os = "windows") {
        "yt-dlp.exe"
    } else if cfg!(target_os = "linux") {
        "yt-dlp_linux"
    } else if cfg!(target_os = "macos") {
        "yt-dlp_macos"
    } else {
        "yt-dlp"
    }
}

async fn ensure_yt_dlp() -> Result<PathBuf> {
    if let Ok(p) = which::which("yt-dlp") {
        return Ok(p);
    }

    let dir = cache_dir()?;
    fs::create_dir_all(&dir).await.ok();
    let local = dir.join(if cfg!(target_os = "windows") {
        "yt-dlp.exe"
    } else {
        "yt-dlp"
    });
    if fs::try_exists(&local).await.unwrap_or(false) {
        return Ok(local);
    }

    info!("yt-dlp not found on PATH, downloading the latest release");
    let rel: ReleaseInfo = HTTP
        .get(GITHUB_RELEASES_API)
        .header(ACCEPT, "application/vnd.github+json")
        .send()
        .await?
        .error_for_status()?
        .json()
        .await?;

    let wanted = platform_asset_name();
    let asset = rel
        .assets
        .into_iter()
        .find(|a| a.name == wanted)
        .ok_or_else(|| anyhow!("no suitable yt-dlp asset for this platform: {}", wanted))?;

    let bytes = HTTP
        .get(asset.browser_download_url)
        .header(USER_AGENT, "greenroom-bot/0.1")
        .send()
        .await?
        .error_for_status()?
        .bytes()
        .await?;

    fs::write(&local, &bytes).await?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mut perms = fs::metadata(&local).await?.permissions();
        perms.set_mode(0o755);
        fs::set_permissions(&local, perms).await?;
    }
    Ok(local)
}

fn download_base_dir() -> Result<PathBuf> {
    if let Ok(dir) = std::env::var("DOWNLOAD_FOLDER") {
        let p = PathBuf::from(dir);
        if p.is_absolute() {
            Ok(p)
        } else {
            Ok(std::env::current_dir()?.join(p))
        }
    } else {
        Ok(cache_dir()?.join("downloads"))
    }
}

pub fn resolved_download_base_dir() -> Result<PathBuf> {
    download_base_dir()
}

async fn download_mp3(ytdlp: &PathBuf, url: &str, video_id: &str) -> Result<PathBuf> {
    let base = download_base_dir()?;
    fs::create_dir_all(&base).await?;
    let cached = base.join(format!("{video_id}.mp3"));
    if fs::try_exists(&cached).await.unwrap_or(false) {
        return Ok(cached);
    }

    // Separate job directory so concurrent downloads never see each other's files.
    let nanos = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos();
    let dir = base.join(format!("job-{video_id}-{nanos}"));
    fs::create_dir_all(&dir).await?;

    let status = TokioCommand::new(ytdlp)
        .arg("-f")
        .arg("bestaudio/best")
        .arg("-x")
        .arg("--audio-format")
        .arg("mp3")
        .arg("--audio-quality")
        .arg("0")
        .arg("--postprocessor-args")
        .arg("ffmpeg:-ar 48000 -ac 2")
        .arg("--no-playlist")
        .arg("-q")
        .arg("-o")
        .arg(dir.join("%(id)s.%(ext)s").to_string_lossy().to_string())
        .arg(url)
        .stdin(Stdio::null())
        .status()
        .await
        .context("running yt-dlp download")?;
    if !status.success() {
        let _ = fs::remove_dir_all(&dir).await;
        return Err(anyhow!("yt-dlp failed with status: {status}"));
    }

    let produced = dir.join(format!("{video_id}.mp3"));
    if !fs::try_exists(&produced).await.unwrap_or(false) {
        let _ = fs::remove_dir_all(&dir).await;
        return Err(anyhow!("no mp3 produced"));
    }
    // Another job may have finished the same id first.
    let final_path = if fs::try_exists(&cached).await.unwrap_or(false)
        || fs::rename(&produced, &cached).await.is_ok()
    {
        cached
    } else {
        fs::copy(&produced, &cached).await?;
        cached
    };
    let _ = fs::remove_dir_all(&dir).await;
    Ok(final_path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn urls_pass_through_and_text_becomes_search() {
        assert_eq!(
            search_target(" https://youtu.be/abc "),
            "https://youtu.be/abc"
        );
        assert_eq!(search_target("lofi beats"), "ytsearch1:lofi beats");
        assert_eq!(search_target("ftp://host/file"), "ytsearch1:ftp://host/file");
    }

    #[test]
    fn search_playlist_yields_first_entry() {
        let raw = br#"{"id":"search","entries":[
            {"id":"abc","title":"Calm Mind","duration":241.6,"uploader":"Forest",
             "webpage_url":"https://www.youtube.com/watch?v=abc","extractor_key":"Youtube"},
            {"id":"def","title":"Other"}]}"#;
        let meta = parse_metadata(raw).unwrap();
        let info = meta.track_info("ytsearch1:calm");
        assert_eq!(
            info,
            TrackInfo {
                title: "Calm Mind".into(),
                url: "https://www.youtube.com/watch?v=abc".into(),
                duration_secs: Some(242),
                thumbnail: None,
                author: Some("Forest".into()),
                source: "youtube".into(),
            }
        );
    }

    #[test]
    fn metadata_without_a_video_id_is_an_error() {
        assert!(parse_metadata(br#"{"title":"No Id","webpage_url":"https://x.test/a"}"#).is_err());
        assert!(parse_metadata(br#"{"id":"search","entries":[{"title":"No Id"}]}"#).is_err());
    }

    #[test]
    fn empty_search_is_an_error() {
        assert!(parse_metadata(br#"{"id":"search","entries":[]}"#).is_err());
    }
}
