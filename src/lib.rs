#![forbid(unsafe_code)]

//! Resolves content ids into directly playable stream URLs, de-duplicating
//! concurrent work and remembering results across restarts.

pub mod config;
pub mod error;
pub mod extract;
pub mod logging;
pub mod persist;
pub mod resolver;
pub mod selection;
pub mod settings;

pub use error::ResolveError;
pub use extract::{ExtractionMethod, Extractors, SharedExtractor, StreamExtractor};
pub use resolver::{CancelPolicy, DefaultStreamCache, StreamResolutionCache};
pub use selection::{StreamCandidate, select_best};
pub use settings::{MethodPreference, ResolverSettings, SettingsStore};

use std::sync::Arc;

use crate::config::RuntimeConfig;

/// Wires the real extractors and the persisted settings into a cache opened
/// from `config.data_dir`.
pub fn open_default_cache(config: &RuntimeConfig) -> (DefaultStreamCache, Arc<SettingsStore>) {
    let settings = Arc::new(SettingsStore::load(
        &config.data_dir,
        ResolverSettings {
            prefer_local_extraction: config.prefer_local_extraction,
        },
    ));
    let extractor: SharedExtractor = Arc::new(Extractors::from_config(config));
    let cache = StreamResolutionCache::open_with_policy(
        config.stream_cache_file(),
        extractor,
        Arc::clone(&settings),
        CancelPolicy::from_cancel_abandoned(config.cancel_abandoned),
    );
    (cache, settings)
}
