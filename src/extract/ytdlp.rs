//! Local extraction through `yt-dlp --dump-single-json`.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use serde::Deserialize;
use tokio::process::Command;
use tracing::{debug, trace};
use url::Url;

use super::{ExtractionMethod, StreamExtractor, watch_url};
use crate::selection::{StreamCandidate, is_natively_playable};

#[derive(Debug, Clone)]
pub struct YtDlpExtractor {
    binary: PathBuf,
    cookies: Option<PathBuf>,
}

/// Minimal version of yt-dlp's `info.json`; only the format list is read.
#[derive(Debug, Deserialize)]
struct VideoInfo {
    #[serde(default)]
    formats: Vec<FormatInfo>,
}

#[derive(Debug, Deserialize)]
struct FormatInfo {
    format_id: Option<String>,
    url: Option<String>,
    ext: Option<String>,
    vcodec: Option<String>,
    acodec: Option<String>,
    height: Option<i64>,
    protocol: Option<String>,
}

impl YtDlpExtractor {
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
            cookies: None,
        }
    }

    pub fn with_cookies(mut self, cookies: impl Into<PathBuf>) -> Self {
        self.cookies = Some(cookies.into());
        self
    }

    pub fn binary(&self) -> &Path {
        &self.binary
    }

    /// Runs `<binary> --version` to fail loudly when yt-dlp is missing.
    pub async fn ensure_available(&self) -> Result<()> {
        let status = Command::new(&self.binary)
            .arg("--version")
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await;

        match status {
            Ok(status) if status.success() => Ok(()),
            Ok(_) => bail!(
                "{} is installed but returned a failure status",
                self.binary.display()
            ),
            Err(err) => bail!(
                "{} is not installed or not in PATH: {}",
                self.binary.display(),
                err
            ),
        }
    }

    async fn fetch_info(&self, id: &str) -> Result<VideoInfo> {
        let video_url = watch_url(id);
        let mut command = Command::new(&self.binary);
        command
            .arg("--dump-single-json")
            .arg("--skip-download")
            .arg("--no-warnings")
            .arg("--no-progress")
            .stdin(Stdio::null())
            .kill_on_drop(true);

        if let Some(cookies) = self.cookies.as_deref().filter(|path| path.exists()) {
            command.arg("--cookies").arg(cookies);
        }
        command.arg(&video_url);

        let output = command
            .output()
            .await
            .with_context(|| format!("running {} for {video_url}", self.binary.display()))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let reason = stderr
                .lines()
                .rev()
                .find(|line| !line.trim().is_empty())
                .unwrap_or("no error output");
            bail!(
                "yt-dlp failed for {} ({}): {}",
                video_url,
                output.status,
                reason.trim()
            );
        }

        serde_json::from_slice(&output.stdout).context("deserializing yt-dlp metadata JSON")
    }
}

#[async_trait]
impl StreamExtractor for YtDlpExtractor {
    async fn extract(&self, id: &str, _method: ExtractionMethod) -> Result<Vec<StreamCandidate>> {
        let info = self.fetch_info(id).await?;
        let candidates = candidates_from_info(info);
        debug!(%id, candidates = candidates.len(), "yt-dlp listed streams");
        Ok(candidates)
    }
}

fn candidates_from_info(info: VideoInfo) -> Vec<StreamCandidate> {
    info.formats
        .into_iter()
        .filter_map(|format| {
            let raw_url = format.url.as_deref()?;
            let url = match Url::parse(raw_url) {
                Ok(url) => url,
                Err(err) => {
                    trace!(format_id = ?format.format_id, error = %err, "skipping format URL");
                    return None;
                }
            };
            let vcodec = format.vcodec.as_deref();
            let acodec = format.acodec.as_deref();
            // yt-dlp reports a missing track as the literal codec "none".
            let has_video = !vcodec.is_some_and(|codec| codec.eq_ignore_ascii_case("none"));
            let has_audio = !acodec.is_some_and(|codec| codec.eq_ignore_ascii_case("none"));
            let container = match format.protocol.as_deref() {
                Some(protocol) if protocol.starts_with("m3u8") => Some("m3u8"),
                _ => format.ext.as_deref(),
            };

            Some(StreamCandidate {
                natively_playable: is_natively_playable(container, vcodec, acodec),
                resolution: format
                    .height
                    .and_then(|height| u32::try_from(height).ok())
                    .unwrap_or(0),
                url,
                format_id: format.format_id,
                has_audio,
                has_video,
            })
        })
        .collect()
}
