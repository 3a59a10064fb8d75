//! On-disk form of the stream URL cache.
//!
//! The file is a flat JSON object mapping content ids to URL strings. Reads are
//! forgiving: anything that does not decode is treated as absent. Writes always
//! replace the whole file through a temp file and a rename.

use std::{
    collections::{BTreeMap, HashMap},
    fs,
    io::ErrorKind,
    path::{Path, PathBuf},
};

use anyhow::{Context, Result};
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, warn};
use url::Url;

pub struct ColdCache {
    path: PathBuf,
    /// Serializes writers so the file always ends up with the newest snapshot.
    writer: Mutex<()>,
}

impl ColdCache {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            writer: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Reads the persisted mapping. Never fails; see module docs.
    pub fn load(&self) -> HashMap<String, Url> {
        let raw = match fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == ErrorKind::NotFound => return HashMap::new(),
            Err(err) => {
                warn!(path = %self.path.display(), error = %err, "stream cache unreadable");
                return HashMap::new();
            }
        };

        let object = match serde_json::from_str::<Value>(&raw) {
            Ok(Value::Object(object)) => object,
            Ok(_) => {
                warn!(path = %self.path.display(), "stream cache is not a JSON object");
                return HashMap::new();
            }
            Err(err) => {
                warn!(path = %self.path.display(), error = %err, "stream cache is corrupt");
                return HashMap::new();
            }
        };

        let mut entries = HashMap::with_capacity(object.len());
        for (id, value) in object {
            let parsed = value.as_str().and_then(|raw| Url::parse(raw).ok());
            match parsed {
                Some(url) if !id.trim().is_empty() => {
                    entries.insert(id, url);
                }
                _ => debug!(%id, "skipping undecodable stream cache entry"),
            }
        }
        debug!(path = %self.path.display(), entries = entries.len(), "loaded stream cache");
        entries
    }

    /// Writes the snapshot produced by `snapshot`, which runs while the writer
    /// lock is held so that it observes every entry stored before this call.
    pub fn store_latest(&self, snapshot: impl FnOnce() -> BTreeMap<String, String>) -> Result<()> {
        let _writer = self.writer.lock();
        let entries = snapshot();
        write_json_atomic(&self.path, &entries)?;
        debug!(path = %self.path.display(), entries = entries.len(), "persisted stream cache");
        Ok(())
    }
}

pub(crate) fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        fs::create_dir_all(parent).with_context(|| format!("creating {}", parent.display()))?;
    }
    let tmp_path = path.with_extension("tmp");
    let payload = serde_json::to_vec_pretty(value)?;
    fs::write(&tmp_path, payload).with_context(|| format!("writing {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replacing {}", path.display()))?;
    Ok(())
}
