#![forbid(unsafe_code)]

//! Runtime configuration shared by the stream resolver binaries.
//!
//! Values are layered the same way everywhere: CLI overrides win over process
//! environment variables, which win over the `.env` file, which wins over the
//! built-in defaults. Invalid values never abort startup; they fall back to the
//! default for that key.

use anyhow::{Context, Result};
use std::{
    collections::HashMap,
    env, fs,
    path::{Path, PathBuf},
};
use url::Url;

pub const DEFAULT_ENV_PATH: &str = ".env";
pub const DEFAULT_NEWTUBE_PORT: u16 = 8080;
pub const DEFAULT_NEWTUBE_HOST: &str = "127.0.0.1";
pub const DEFAULT_PIPED_INSTANCE: &str = "https://pipedapi.kavin.rocks";
pub const DEFAULT_YTDLP_BIN: &str = "yt-dlp";

/// Directory created under the platform's application-support directory.
pub const APP_DIR_NAME: &str = "NewTube";
/// Cold cache file name inside the application directory.
pub const STREAM_CACHE_FILE: &str = "StreamURLCache.json";
/// Persisted resolver settings inside the application directory.
pub const SETTINGS_FILE: &str = "resolver_settings.json";

pub const PREFER_LOCAL_KEY: &str = "NEWTUBE_PREFER_LOCAL_EXTRACTION";

#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub data_dir: PathBuf,
    pub prefer_local_extraction: bool,
    pub piped_instance: Url,
    pub ytdlp_bin: PathBuf,
    pub cookies_file: Option<PathBuf>,
    pub cancel_abandoned: bool,
    pub newtube_port: u16,
    pub newtube_host: String,
}

impl RuntimeConfig {
    pub fn stream_cache_file(&self) -> PathBuf {
        self.data_dir.join(STREAM_CACHE_FILE)
    }

    pub fn settings_file(&self) -> PathBuf {
        self.data_dir.join(SETTINGS_FILE)
    }
}

pub fn load_runtime_config() -> Result<RuntimeConfig> {
    resolve_runtime_config(RuntimeOverrides::default())
}

#[derive(Debug, Clone, Default)]
pub struct RuntimeOverrides {
    pub data_dir: Option<PathBuf>,
    pub newtube_port: Option<u16>,
    pub newtube_host: Option<String>,
    pub env_path: Option<PathBuf>,
}

pub fn resolve_runtime_config(overrides: RuntimeOverrides) -> Result<RuntimeConfig> {
    let env_path = overrides
        .env_path
        .as_deref()
        .unwrap_or_else(|| Path::new(DEFAULT_ENV_PATH));
    let file_vars = read_env_file(env_path)?;
    build_runtime_config_with_overrides(&file_vars, env_var_string, overrides)
}

/// `<app-support-dir>/NewTube`, or `./NewTube` on platforms without one.
pub fn default_data_dir() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(APP_DIR_NAME)
}

#[cfg(test)]
fn build_runtime_config(
    file_vars: &HashMap<String, String>,
    env_lookup: impl Fn(&str) -> Option<String>,
) -> Result<RuntimeConfig> {
    build_runtime_config_with_overrides(file_vars, env_lookup, RuntimeOverrides::default())
}

fn build_runtime_config_with_overrides(
    file_vars: &HashMap<String, String>,
    env_lookup: impl Fn(&str) -> Option<String>,
    overrides: RuntimeOverrides,
) -> Result<RuntimeConfig> {
    let lookup = |key: &str| lookup_value(key, file_vars, &env_lookup);

    let data_dir = overrides
        .data_dir
        .or_else(|| lookup("NEWTUBE_DATA_DIR").map(PathBuf::from))
        .unwrap_or_else(default_data_dir);
    let prefer_local_extraction = lookup(PREFER_LOCAL_KEY)
        .and_then(|value| parse_bool(&value))
        .unwrap_or(true);
    let piped_instance = match lookup("NEWTUBE_PIPED_INSTANCE")
        .and_then(|value| Url::parse(&value).ok())
        .filter(|url| matches!(url.scheme(), "http" | "https"))
    {
        Some(url) => url,
        None => Url::parse(DEFAULT_PIPED_INSTANCE).context("parsing default Piped instance")?,
    };
    let ytdlp_bin = lookup("NEWTUBE_YTDLP_BIN")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_YTDLP_BIN));
    let cookies_file = lookup("NEWTUBE_COOKIES_FILE").map(PathBuf::from);
    let cancel_abandoned = lookup("NEWTUBE_CANCEL_ABANDONED")
        .and_then(|value| parse_bool(&value))
        .unwrap_or(false);
    let newtube_port = overrides
        .newtube_port
        .or_else(|| lookup("NEWTUBE_PORT").and_then(|value| value.parse::<u16>().ok()))
        .unwrap_or(DEFAULT_NEWTUBE_PORT);
    let newtube_host = overrides
        .newtube_host
        .and_then(|value| {
            let trimmed = value.trim().to_string();
            if trimmed.is_empty() {
                None
            } else {
                Some(trimmed)
            }
        })
        .or_else(|| lookup("NEWTUBE_HOST"))
        .filter(|value| !value.trim().is_empty())
        .unwrap_or_else(|| DEFAULT_NEWTUBE_HOST.to_string());

    Ok(RuntimeConfig {
        data_dir,
        prefer_local_extraction,
        piped_instance,
        ytdlp_bin,
        cookies_file,
        cancel_abandoned,
        newtube_port,
        newtube_host,
    })
}

/// Accepts the usual spellings of a boolean flag.
pub fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

fn env_var_string(key: &str) -> Option<String> {
    env::var(key).ok().and_then(|value| {
        let trimmed = value.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed.to_string())
        }
    })
}

fn lookup_value(
    key: &str,
    file_vars: &HashMap<String, String>,
    env_lookup: &impl Fn(&str) -> Option<String>,
) -> Option<String> {
    env_lookup(key).or_else(|| {
        file_vars
            .get(key)
            .filter(|value| !value.trim().is_empty())
            .cloned()
    })
}

pub fn read_env_file(path: &Path) -> Result<HashMap<String, String>> {
    let mut vars = HashMap::new();
    if !path.exists() {
        return Ok(vars);
    }
    let content =
        fs::read_to_string(path).with_context(|| format!("Reading {}", path.display()))?;
    for line in content.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        let line = trimmed.strip_prefix("export ").unwrap_or(trimmed);
        let Some((key, value_raw)) = line.split_once('=') else {
            continue;
        };
        let key = key.trim();
        if key.is_empty() {
            continue;
        }
        let value = value_raw.trim();
        let value = value
            .strip_prefix('"')
            .and_then(|value| value.strip_suffix('"'))
            .or_else(|| {
                value
                    .strip_prefix('\'')
                    .and_then(|value| value.strip_suffix('\''))
            })
            .unwrap_or(value);
        vars.insert(key.to_string(), value.to_string());
    }
    Ok(vars)
}

/// Updates or appends a single env var inside the target file while preserving
/// unrelated lines and comments.
pub fn upsert_env_value(path: &Path, key: &str, value: &str) -> Result<()> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        fs::create_dir_all(parent).with_context(|| format!("Creating {}", parent.display()))?;
    }

    let raw = fs::read_to_string(path).unwrap_or_default();
    let mut lines = Vec::new();
    let mut updated = false;
    let escaped = value.replace('\\', "\\\\").replace('"', "\\\"");

    for line in raw.lines() {
        let trimmed = line.trim_start();
        let indent = &line[..line.len() - trimmed.len()];
        let (prefix, rest) = match trimmed.strip_prefix("export ") {
            Some(stripped) => ("export ", stripped),
            None => ("", trimmed),
        };
        let Some((candidate, _)) = rest.split_once('=') else {
            lines.push(line.to_string());
            continue;
        };
        if candidate.trim() == key {
            lines.push(format!("{indent}{prefix}{key}=\"{escaped}\""));
            updated = true;
        } else {
            lines.push(line.to_string());
        }
    }

    if !updated {
        lines.push(format!("{key}=\"{escaped}\""));
    }

    let tmp_path = path.with_extension("tmp");
    fs::write(&tmp_path, lines.join("\n") + "\n")
        .with_context(|| format!("writing {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replacing {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn make_config(contents: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        write!(file, "{}", contents).unwrap();
        file
    }

    fn runtime_from(contents: &str) -> RuntimeConfig {
        let cfg = make_config(contents);
        let vars = read_env_file(cfg.path()).unwrap();
        build_runtime_config(&vars, |_| None).unwrap()
    }

    #[test]
    fn defaults_apply_to_empty_file() {
        let runtime = runtime_from("");
        assert!(runtime.prefer_local_extraction);
        assert!(!runtime.cancel_abandoned);
        assert_eq!(runtime.newtube_port, DEFAULT_NEWTUBE_PORT);
        assert_eq!(runtime.newtube_host, DEFAULT_NEWTUBE_HOST);
        assert_eq!(runtime.piped_instance.as_str(), "https://pipedapi.kavin.rocks/");
        assert_eq!(runtime.ytdlp_bin, PathBuf::from(DEFAULT_YTDLP_BIN));
        assert!(runtime.cookies_file.is_none());
        assert!(runtime.data_dir.ends_with(APP_DIR_NAME));
    }

    #[test]
    fn cache_file_lives_in_data_dir() {
        let runtime = runtime_from("NEWTUBE_DATA_DIR=\"/srv/newtube\"\n");
        assert_eq!(
            runtime.stream_cache_file(),
            PathBuf::from("/srv/newtube/StreamURLCache.json")
        );
        assert_eq!(
            runtime.settings_file(),
            PathBuf::from("/srv/newtube/resolver_settings.json")
        );
    }

    #[test]
    fn reads_extraction_settings() {
        let runtime = runtime_from(
            "NEWTUBE_PREFER_LOCAL_EXTRACTION=\"no\"\n\
             NEWTUBE_PIPED_INSTANCE=\"https://piped.example/api\"\n\
             NEWTUBE_YTDLP_BIN=\"/opt/yt-dlp\"\n\
             NEWTUBE_COOKIES_FILE=\"/etc/cookies.txt\"\n\
             NEWTUBE_CANCEL_ABANDONED=\"on\"\n",
        );
        assert!(!runtime.prefer_local_extraction);
        assert_eq!(runtime.piped_instance.as_str(), "https://piped.example/api");
        assert_eq!(runtime.ytdlp_bin, PathBuf::from("/opt/yt-dlp"));
        assert_eq!(runtime.cookies_file, Some(PathBuf::from("/etc/cookies.txt")));
        assert!(runtime.cancel_abandoned);
    }

    #[test]
    fn invalid_values_fall_back_to_defaults() {
        let runtime = runtime_from(
            "NEWTUBE_PREFER_LOCAL_EXTRACTION=\"maybe\"\n\
             NEWTUBE_PIPED_INSTANCE=\"ftp://nope\"\n\
             NEWTUBE_PORT=\"nope\"\n",
        );
        assert!(runtime.prefer_local_extraction);
        assert_eq!(runtime.piped_instance.as_str(), "https://pipedapi.kavin.rocks/");
        assert_eq!(runtime.newtube_port, DEFAULT_NEWTUBE_PORT);
    }

    #[test]
    fn env_wins_over_file_and_overrides_win_over_env() {
        let mut vars = HashMap::new();
        vars.insert("NEWTUBE_DATA_DIR".to_string(), "/file-data".to_string());
        vars.insert("NEWTUBE_HOST".to_string(), "file-host".to_string());
        vars.insert("NEWTUBE_PORT".to_string(), "7000".to_string());

        let runtime = build_runtime_config_with_overrides(
            &vars,
            |key| match key {
                "NEWTUBE_DATA_DIR" => Some("/env-data".to_string()),
                "NEWTUBE_PORT" => Some("8000".to_string()),
                _ => None,
            },
            RuntimeOverrides {
                newtube_port: Some(9000),
                newtube_host: Some("   ".into()),
                ..RuntimeOverrides::default()
            },
        )
        .unwrap();

        assert_eq!(runtime.data_dir, PathBuf::from("/env-data"));
        assert_eq!(runtime.newtube_port, 9000);
        assert_eq!(runtime.newtube_host, "file-host");
    }

    #[test]
    fn read_env_file_handles_export_and_quotes() {
        let cfg = make_config(
            r#"
            export NEWTUBE_DATA_DIR="/media"
            NEWTUBE_PIPED_INSTANCE='https://piped.example'
            NEWTUBE_HOST =  "0.0.0.0"
            NEWTUBE_PORT=9090
            # comment
            INVALID_LINE
            "#,
        );
        let vars = read_env_file(cfg.path()).unwrap();
        assert_eq!(vars.get("NEWTUBE_DATA_DIR").unwrap(), "/media");
        assert_eq!(
            vars.get("NEWTUBE_PIPED_INSTANCE").unwrap(),
            "https://piped.example"
        );
        assert_eq!(vars.get("NEWTUBE_HOST").unwrap(), "0.0.0.0");
        assert_eq!(vars.get("NEWTUBE_PORT").unwrap(), "9090");
        assert!(!vars.contains_key("INVALID_LINE"));
    }

    #[test]
    fn read_env_file_missing_file_returns_empty() {
        let dir = tempfile::tempdir().unwrap();
        let vars = read_env_file(&dir.path().join("missing.env")).unwrap();
        assert!(vars.is_empty());
    }

    #[test]
    fn upsert_env_value_replaces_and_appends() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(".env");
        fs::write(
            &path,
            "# resolver\nexport NEWTUBE_PREFER_LOCAL_EXTRACTION=\"true\"\nNEWTUBE_PORT=1\n",
        )
        .unwrap();

        upsert_env_value(&path, PREFER_LOCAL_KEY, "false").unwrap();
        upsert_env_value(&path, "NEWTUBE_HOST", "0.0.0.0").unwrap();

        let raw = fs::read_to_string(&path).unwrap();
        assert!(raw.starts_with("# resolver\n"));
        assert!(raw.contains("export NEWTUBE_PREFER_LOCAL_EXTRACTION=\"false\""));
        assert!(raw.contains("NEWTUBE_HOST=\"0.0.0.0\""));
        let vars = read_env_file(&path).unwrap();
        assert_eq!(vars.get(PREFER_LOCAL_KEY).unwrap(), "false");
        assert_eq!(vars.get("NEWTUBE_PORT").unwrap(), "1");
    }

    #[test]
    fn parse_bool_accepts_common_spellings() {
        assert_eq!(parse_bool(" Yes "), Some(true));
        assert_eq!(parse_bool("0"), Some(false));
        assert_eq!(parse_bool("sometimes"), None);
    }
}
