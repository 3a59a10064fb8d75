//! Remote extraction through a Piped API instance (`GET /streams/{id}`).

use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};
use async_trait::async_trait;
use serde::Deserialize;
use tracing::{debug, trace};
use url::Url;

use super::{ExtractionMethod, StreamExtractor};
use crate::selection::{StreamCandidate, is_natively_playable, split_codecs};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const USER_AGENT: &str = concat!("newtube-streams/", env!("CARGO_PKG_VERSION"));

#[derive(Clone)]
pub struct PipedExtractor {
    instance: Url,
    agent: ureq::Agent,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StreamsResponse {
    #[serde(default)]
    hls: Option<String>,
    #[serde(default)]
    video_streams: Vec<PipedStream>,
    #[serde(default)]
    audio_streams: Vec<PipedStream>,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    message: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PipedStream {
    url: Option<String>,
    format: Option<String>,
    mime_type: Option<String>,
    codec: Option<String>,
    #[serde(default)]
    video_only: bool,
    height: Option<u32>,
    quality: Option<String>,
    itag: Option<i64>,
}

impl PipedExtractor {
    pub fn new(instance: Url) -> Self {
        let agent = ureq::AgentBuilder::new()
            .timeout(REQUEST_TIMEOUT)
            .user_agent(USER_AGENT)
            .build();
        Self { instance, agent }
    }

    fn streams_url(&self, id: &str) -> Result<Url> {
        let mut url = self.instance.clone();
        url.path_segments_mut()
            .map_err(|_| anyhow!("Piped instance {} cannot be a base URL", self.instance))?
            .pop_if_empty()
            .push("streams")
            .push(id);
        Ok(url)
    }
}

#[async_trait]
impl StreamExtractor for PipedExtractor {
    async fn extract(&self, id: &str, _method: ExtractionMethod) -> Result<Vec<StreamCandidate>> {
        let url = self.streams_url(id)?;
        let agent = self.agent.clone();
        debug!(%id, %url, "querying Piped streams");

        // ureq is blocking, keep it off the async workers.
        let response = tokio::task::spawn_blocking(move || fetch_streams(&agent, &url))
            .await
            .context("joining Piped request task")??;

        if let Some(error) = &response.error
            && response.video_streams.is_empty()
            && response.hls.is_none()
        {
            bail!(
                "Piped returned an error for {id}: {}",
                response.message.as_deref().unwrap_or(error)
            );
        }

        let candidates = candidates_from_response(response);
        debug!(%id, candidates = candidates.len(), "Piped listed streams");
        Ok(candidates)
    }
}

fn fetch_streams(agent: &ureq::Agent, url: &Url) -> Result<StreamsResponse> {
    let response = agent
        .get(url.as_str())
        .set("Accept", "application/json")
        .call()
        .with_context(|| format!("requesting {url}"))?;
    response
        .into_json::<StreamsResponse>()
        .with_context(|| format!("decoding Piped response from {url}"))
}

fn candidates_from_response(response: StreamsResponse) -> Vec<StreamCandidate> {
    let mut candidates = Vec::new();
    let mut best_height = 0;

    for stream in response.video_streams {
        let resolution = stream_height(&stream);
        if let Some(candidate) = stream_candidate(stream, true, resolution) {
            best_height = best_height.max(resolution);
            candidates.push(candidate);
        }
    }
    for stream in response.audio_streams {
        if let Some(candidate) = stream_candidate(stream, false, 0) {
            candidates.push(candidate);
        }
    }

    // The HLS manifest muxes every rendition and is always natively playable.
    if let Some(hls) = response.hls.as_deref().filter(|hls| !hls.trim().is_empty()) {
        match Url::parse(hls) {
            Ok(url) => candidates.push(StreamCandidate {
                url,
                format_id: Some("hls".to_string()),
                has_audio: true,
                has_video: true,
                natively_playable: true,
                resolution: best_height,
            }),
            Err(err) => trace!(error = %err, "skipping HLS manifest URL"),
        }
    }

    candidates
}

fn stream_candidate(stream: PipedStream, is_video: bool, resolution: u32) -> Option<StreamCandidate> {
    let url = Url::parse(stream.url.as_deref()?).ok()?;
    let (video_codec, audio_codec) = match stream.codec.as_deref() {
        Some(codec) if is_video && stream.video_only => (Some(codec), None),
        Some(codec) if is_video => split_codecs(codec),
        Some(codec) => (None, Some(codec)),
        None => (None, None),
    };
    let container = stream_container(&stream);
    let natively_playable = is_natively_playable(container.as_deref(), video_codec, audio_codec);

    Some(StreamCandidate {
        url,
        format_id: stream.itag.map(|itag| itag.to_string()),
        has_audio: !is_video || !stream.video_only,
        has_video: is_video,
        natively_playable,
        resolution,
    })
}

/// `video/mp4; codecs=".."` -> `mp4`, falling back to Piped's `format` enum.
fn stream_container(stream: &PipedStream) -> Option<String> {
    let from_mime = stream.mime_type.as_deref().and_then(|mime| {
        let essence = mime.split(';').next()?.trim().to_ascii_lowercase();
        let subtype = essence.split_once('/')?.1.to_string();
        Some(match subtype.as_str() {
            "x-mpegurl" | "vnd.apple.mpegurl" => "m3u8".to_string(),
            "quicktime" => "mov".to_string(),
            "x-m4v" => "m4v".to_string(),
            _ => subtype,
        })
    });
    from_mime.or_else(|| {
        stream.format.as_deref().map(|format| match format {
            "MPEG_4" | "M4A" => "mp4".to_string(),
            other => other.to_ascii_lowercase(),
        })
    })
}

/// `height` when present, otherwise the leading digits of `quality` ("720p60").
fn stream_height(stream: &PipedStream) -> u32 {
    stream
        .height
        .filter(|height| *height > 0)
        .or_else(|| {
            let quality = stream.quality.as_deref()?;
            let digits: String = quality.chars().take_while(char::is_ascii_digit).collect();
            digits.parse().ok()
        })
        .unwrap_or(0)
}
