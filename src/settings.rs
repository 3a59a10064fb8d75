//! Process-wide resolver settings.
//!
//! The resolution cache only ever reads the extraction preference; the HTTP
//! settings endpoint and the CLI are the only writers.

use std::{
    fs,
    path::{Path, PathBuf},
    sync::Arc,
};

use anyhow::Result;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::config::SETTINGS_FILE;
use crate::extract::ExtractionMethod;
use crate::persist::write_json_atomic;

/// Supplies the extraction method at the moment a resolution begins.
pub trait MethodPreference: Send + Sync {
    fn extraction_method(&self) -> ExtractionMethod;
}

impl MethodPreference for ExtractionMethod {
    fn extraction_method(&self) -> ExtractionMethod {
        *self
    }
}

impl<T: MethodPreference + ?Sized> MethodPreference for Arc<T> {
    fn extraction_method(&self) -> ExtractionMethod {
        (**self).extraction_method()
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ResolverSettings {
    pub prefer_local_extraction: bool,
}

impl ResolverSettings {
    pub fn extraction_method(&self) -> ExtractionMethod {
        ExtractionMethod::from_prefer_local(self.prefer_local_extraction)
    }
}

pub struct SettingsStore {
    path: PathBuf,
    current: RwLock<ResolverSettings>,
}

impl SettingsStore {
    /// Loads `resolver_settings.json` from `data_dir`, falling back to
    /// `defaults` when the file is missing or unreadable.
    pub fn load(data_dir: &Path, defaults: ResolverSettings) -> Self {
        let path = data_dir.join(SETTINGS_FILE);
        let current = match fs::read_to_string(&path) {
            Ok(raw) => serde_json::from_str(&raw).unwrap_or_else(|err| {
                warn!(path = %path.display(), error = %err, "ignoring invalid settings file");
                defaults
            }),
            Err(_) => defaults,
        };

        Self {
            path,
            current: RwLock::new(current),
        }
    }

    pub fn get(&self) -> ResolverSettings {
        self.current.read().clone()
    }

    pub fn update(&self, settings: ResolverSettings) -> Result<ResolverSettings> {
        let mut current = self.current.write();
        write_json_atomic(&self.path, &settings)?;
        *current = settings.clone();
        Ok(settings)
    }
}

impl MethodPreference for SettingsStore {
    fn extraction_method(&self) -> ExtractionMethod {
        self.current.read().extraction_method()
    }
}
