//! Stream extraction collaborators.
//!
//! An extractor turns a content id into the full list of streams the upstream
//! offers. It does not pick one; that is [`crate::selection::select_best`]'s job.

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::config::RuntimeConfig;
use crate::selection::StreamCandidate;

pub mod piped;
pub mod ytdlp;

pub use piped::PipedExtractor;
pub use ytdlp::YtDlpExtractor;

/// Where stream lists come from.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExtractionMethod {
    /// Run yt-dlp on this machine.
    Local,
    /// Ask a Piped API instance.
    Remote,
}

impl ExtractionMethod {
    pub fn from_prefer_local(prefer_local: bool) -> Self {
        if prefer_local { Self::Local } else { Self::Remote }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "local" | "yt-dlp" | "ytdlp" => Some(Self::Local),
            "remote" | "piped" => Some(Self::Remote),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Local => "local",
            Self::Remote => "remote",
        }
    }
}

#[async_trait]
pub trait StreamExtractor: Send + Sync {
    async fn extract(&self, id: &str, method: ExtractionMethod) -> Result<Vec<StreamCandidate>>;
}

#[async_trait]
impl<T: StreamExtractor + ?Sized> StreamExtractor for Arc<T> {
    async fn extract(&self, id: &str, method: ExtractionMethod) -> Result<Vec<StreamCandidate>> {
        (**self).extract(id, method).await
    }
}

pub type SharedExtractor = Arc<dyn StreamExtractor>;

/// Routes each request to yt-dlp or Piped depending on the method in effect
/// when the resolution started.
pub struct Extractors {
    local: YtDlpExtractor,
    remote: PipedExtractor,
}

impl Extractors {
    pub fn new(local: YtDlpExtractor, remote: PipedExtractor) -> Self {
        Self { local, remote }
    }

    pub fn from_config(config: &RuntimeConfig) -> Self {
        let mut local = YtDlpExtractor::new(&config.ytdlp_bin);
        if let Some(cookies) = &config.cookies_file {
            local = local.with_cookies(cookies);
        }
        Self::new(local, PipedExtractor::new(config.piped_instance.clone()))
    }
}

#[async_trait]
impl StreamExtractor for Extractors {
    async fn extract(&self, id: &str, method: ExtractionMethod) -> Result<Vec<StreamCandidate>> {
        match method {
            ExtractionMethod::Local => self.local.extract(id, method).await,
            ExtractionMethod::Remote => self.remote.extract(id, method).await,
        }
    }
}

pub fn watch_url(id: &str) -> String {
    format!("https://www.youtube.com/watch?v={id}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn method_parsing() {
        assert_eq!(ExtractionMethod::parse(" Local "), Some(ExtractionMethod::Local));
        assert_eq!(ExtractionMethod::parse("piped"), Some(ExtractionMethod::Remote));
        assert_eq!(ExtractionMethod::parse("ftp"), None);
        assert_eq!(ExtractionMethod::from_prefer_local(false), ExtractionMethod::Remote);
        assert_eq!(ExtractionMethod::Local.as_str(), "local");
    }

    #[test]
    fn method_serializes_as_snake_case() {
        assert_eq!(
            serde_json::to_string(&ExtractionMethod::Remote).unwrap(),
            "\"remote\""
        );
    }
}
