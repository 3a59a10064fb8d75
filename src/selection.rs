//! Stream candidates and the policy that picks the one we hand to the player.

use url::Url;

/// Containers the host media stack plays without a transmux step.
const NATIVE_CONTAINERS: &[&str] = &["mp4", "m4v", "mov", "m3u8"];
const NATIVE_VIDEO_CODECS: &[&str] = &["avc1", "avc3", "h264", "hvc1", "hev1", "hevc"];
const NATIVE_AUDIO_CODECS: &[&str] = &["mp4a", "aac", "alac"];
const AUDIO_CODEC_FAMILIES: &[&str] = &[
    "mp4a", "aac", "alac", "opus", "vorbis", "flac", "ac-3", "ec-3", "mp3",
];

/// A single playable resource offered by an extractor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamCandidate {
    pub url: Url,
    /// Extractor-specific format identifier, informational only.
    pub format_id: Option<String>,
    pub has_audio: bool,
    pub has_video: bool,
    pub natively_playable: bool,
    /// Pixel height, `0` when unknown.
    pub resolution: u32,
}

/// Picks the highest-resolution candidate that carries audio and video and is
/// natively playable. Ties keep the candidate the extractor listed first.
pub fn select_best(candidates: &[StreamCandidate]) -> Option<&StreamCandidate> {
    candidates
        .iter()
        .filter(|candidate| candidate.has_audio && candidate.has_video)
        .filter(|candidate| candidate.natively_playable)
        .fold(None, |best: Option<&StreamCandidate>, candidate| match best {
            Some(current) if current.resolution >= candidate.resolution => Some(current),
            _ => Some(candidate),
        })
}

/// Whether a stream in `container` with the given codecs plays natively.
///
/// Missing codec information on a native container counts as playable; a
/// codec of `none` means the track is absent and is ignored here.
pub fn is_natively_playable(
    container: Option<&str>,
    video_codec: Option<&str>,
    audio_codec: Option<&str>,
) -> bool {
    let Some(container) = container else {
        return false;
    };
    let container = container.trim().to_ascii_lowercase();
    if !NATIVE_CONTAINERS.contains(&container.as_str()) {
        return false;
    }
    codec_allowed(video_codec, NATIVE_VIDEO_CODECS) && codec_allowed(audio_codec, NATIVE_AUDIO_CODECS)
}

fn codec_allowed(codec: Option<&str>, allowed: &[&str]) -> bool {
    match codec.map(codec_family) {
        None => true,
        Some(family) if family == "none" => true,
        Some(family) => allowed.contains(&family.as_str()),
    }
}

/// `avc1.4d401e` -> `avc1`.
pub fn codec_family(codec: &str) -> String {
    codec
        .trim()
        .split('.')
        .next()
        .unwrap_or_default()
        .to_ascii_lowercase()
}

/// Splits a combined codec string such as `avc1.42001E, mp4a.40.2` into its
/// video and audio parts.
pub fn split_codecs(codecs: &str) -> (Option<&str>, Option<&str>) {
    let mut video = None;
    let mut audio = None;
    for part in codecs.split(',').map(str::trim).filter(|part| !part.is_empty()) {
        if AUDIO_CODEC_FAMILIES.contains(&codec_family(part).as_str()) {
            audio.get_or_insert(part);
        } else {
            video.get_or_insert(part);
        }
    }
    (video, audio)
}
