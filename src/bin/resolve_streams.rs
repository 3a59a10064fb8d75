#![forbid(unsafe_code)]

//! Command-line access to the stream resolution cache.

use std::{
    io::{self, Write},
    path::PathBuf,
    process::ExitCode,
    sync::Arc,
};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use futures::future::join_all;
use newtube_streams::config::{
    DEFAULT_ENV_PATH, PREFER_LOCAL_KEY, RuntimeConfig, RuntimeOverrides, resolve_runtime_config,
    upsert_env_value,
};
use newtube_streams::logging::init_logging;
use newtube_streams::{
    CancelPolicy, ExtractionMethod, Extractors, MethodPreference, ResolverSettings,
    SettingsStore, SharedExtractor, StreamExtractor, StreamResolutionCache,
};
use tracing::{debug, warn};

#[derive(Parser, Debug)]
#[command(author, version, about = "Resolve content ids into playable stream URLs", long_about = None)]
struct Cli {
    /// Application data directory holding the stream cache and settings
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    /// `.env` file to read defaults from
    #[arg(long, global = true, default_value = DEFAULT_ENV_PATH)]
    env_file: PathBuf,

    /// Extraction method for this run: 'local' (yt-dlp) or 'remote' (Piped)
    #[arg(long, global = true, value_parser = parse_method)]
    method: Option<ExtractionMethod>,

    /// Log resolver internals
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Resolve ids and print `id<TAB>url` for each
    Resolve {
        #[arg(required = true)]
        ids: Vec<String>,
    },
    /// Warm the cache for ids without printing their URLs
    Prefetch {
        #[arg(required = true)]
        ids: Vec<String>,
    },
    /// Print every cached `id<TAB>url`
    List,
    /// Persist the extraction method used when none is given
    SetDefaultMethod {
        #[arg(value_parser = parse_method)]
        method: ExtractionMethod,
    },
}

fn parse_method(value: &str) -> Result<ExtractionMethod, String> {
    ExtractionMethod::parse(value)
        .ok_or_else(|| format!("unknown extraction method `{value}`, expected local or remote"))
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let config = resolve_runtime_config(RuntimeOverrides {
        data_dir: cli.data_dir.clone(),
        env_path: Some(cli.env_file.clone()),
        ..RuntimeOverrides::default()
    })?;
    let settings = Arc::new(SettingsStore::load(
        &config.data_dir,
        ResolverSettings {
            prefer_local_extraction: config.prefer_local_extraction,
        },
    ));

    if let Command::SetDefaultMethod { method } = cli.command {
        set_default_method(&cli.env_file, &settings, method)?;
        println!(
            "Default extraction method set to {} in {}",
            method.as_str(),
            cli.env_file.display()
        );
        return Ok(ExitCode::SUCCESS);
    }

    let preference: Arc<dyn MethodPreference> = match cli.method {
        Some(method) => Arc::new(method),
        None => settings,
    };
    let extractor: SharedExtractor = Arc::new(Extractors::from_config(&config));
    let cache = open_cache(&config, extractor, preference);

    let mut stdout = io::stdout().lock();
    let succeeded = execute(cli.command, &cache, &mut stdout).await?;
    Ok(if succeeded {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

fn open_cache<E>(
    config: &RuntimeConfig,
    extractor: E,
    preference: Arc<dyn MethodPreference>,
) -> StreamResolutionCache<E, Arc<dyn MethodPreference>>
where
    E: StreamExtractor + 'static,
{
    StreamResolutionCache::open_with_policy(
        config.stream_cache_file(),
        extractor,
        preference,
        CancelPolicy::from_cancel_abandoned(config.cancel_abandoned),
    )
}

/// Runs a cache command, writing its report to `out`. Returns `false` when at
/// least one id failed to resolve.
async fn execute<E, P>(
    command: Command,
    cache: &StreamResolutionCache<E, P>,
    out: &mut impl Write,
) -> Result<bool>
where
    E: StreamExtractor + 'static,
    P: MethodPreference + 'static,
{
    let succeeded = match command {
        Command::Resolve { ids } => {
            let outcomes = join_all(ids.iter().map(|id| cache.resolve(id))).await;
            let mut failed = 0usize;
            for (id, outcome) in ids.iter().zip(outcomes) {
                match outcome {
                    Ok(url) => writeln!(out, "{id}\t{url}")?,
                    Err(err) => {
                        failed += 1;
                        writeln!(out, "{id}\terror: {err}")?;
                    }
                }
            }
            if failed > 0 {
                warn!(failed, total = ids.len(), "some ids could not be resolved");
            }
            failed == 0
        }
        Command::Prefetch { ids } => {
            cache.prefetch(&ids);
            cache.wait_idle().await;
            let cached = ids.iter().filter(|id| cache.cached(id).is_some()).count();
            writeln!(out, "Prefetched {cached} of {} ids", ids.len())?;
            true
        }
        Command::List => {
            for (id, url) in cache.snapshot() {
                writeln!(out, "{id}\t{url}")?;
            }
            return Ok(true);
        }
        Command::SetDefaultMethod { .. } => return Ok(true),
    };

    cache.flush().await.context("writing stream cache")?;
    debug!(path = %cache.cache_file().display(), "stream cache written");
    Ok(succeeded)
}

/// Writes the method into the `.env` file and the live settings so both
/// binaries pick it up.
fn set_default_method(
    env_file: &std::path::Path,
    settings: &SettingsStore,
    method: ExtractionMethod,
) -> Result<()> {
    let prefer_local = method == ExtractionMethod::Local;
    upsert_env_value(env_file, PREFER_LOCAL_KEY, if prefer_local { "true" } else { "false" })
        .with_context(|| format!("updating {}", env_file.display()))?;
    settings.update(ResolverSettings {
        prefer_local_extraction: prefer_local,
    })?;
    Ok(())
}
