//! CLI modes for nyvera: serve, fetch, precache and cache maintenance.

mod progress;

use std::path::PathBuf;
use std::sync::Arc;

use console::style;
use tokio_util::sync::CancellationToken;

use crate::api::{ApiState, run_server};
use crate::config::AppConfig;
use crate::error::{Error, Result};
use crate::fetcher::{DownloadProgress, ModelFetcher};
use crate::format::format_bytes;
use crate::net::{HttpNetwork, Network};
use crate::page::Page;
use crate::runtime::{ModelRuntime, UnavailableRuntime};
use crate::session::PageSession;
use crate::store::{CacheStore, DiskCacheStore};
use crate::worker::Registration;

pub use progress::{CliProgress, print_summary};

/// What the binary was asked to do.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Mode {
    Serve,
    Fetch { url: String },
    Precache,
    CacheList,
    CacheClear,
    Help,
}

/// Parsed command line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CliArgs {
    pub mode: Mode,
    pub config_path: Option<PathBuf>,
}

/// Prints usage to stderr.
pub fn print_usage() {
    eprintln!("Usage: nyvera [--config <PATH>] <MODE>");
    eprintln!();
    eprintln!("Modes:");
    eprintln!("  serve               Precache assets, then run the HTTP front-end");
    eprintln!("  fetch <URL>         Download one resource through the cache with progress");
    eprintln!("  precache            Install the asset worker and report the result");
    eprintln!("  cache list          List cached entries");
    eprintln!("  cache clear         Delete the cache namespace");
    eprintln!();
    eprintln!("Options:");
    eprintln!("  --config <PATH>     Configuration file (default: {})", AppConfig::default_path().display());
    eprintln!("  -h, --help          Show this help");
    eprintln!();
    eprintln!("Set RUST_LOG=debug for verbose logs, NYVERA_API_PORT to override the port.");
}

/// Parses arguments (without the program name).
///
/// # Errors
///
/// Returns a message describing the first unusable argument.
pub fn parse_args(args: &[String]) -> std::result::Result<CliArgs, String> {
    let mut config_path = None;
    let mut positional = Vec::new();

    let mut i = 0;
    while i < args.len() {
        match args[i].as_str() {
            "-h" | "--help" => {
                return Ok(CliArgs {
                    mode: Mode::Help,
                    config_path,
                });
            }
            "--config" => {
                i += 1;
                let path = args.get(i).ok_or("--config requires a value")?;
                config_path = Some(PathBuf::from(path));
            }
            flag if flag.starts_with('-') => return Err(format!("unknown option {flag}")),
            other => positional.push(other),
        }
        i += 1;
    }

    let mode = match positional.as_slice() {
        [] => Mode::Help,
        ["serve"] => Mode::Serve,
        ["fetch", url] => Mode::Fetch {
            url: (*url).to_string(),
        },
        ["fetch"] => return Err("fetch requires a URL".to_string()),
        ["precache"] => Mode::Precache,
        ["cache", "list"] => Mode::CacheList,
        ["cache", "clear"] => Mode::CacheClear,
        other => return Err(format!("unrecognized command: {}", other.join(" "))),
    };
    Ok(CliArgs { mode, config_path })
}

/// Long-lived pieces shared by every mode.
struct Services {
    config: AppConfig,
    store: Arc<dyn CacheStore>,
    network: Arc<dyn Network>,
}

impl Services {
    fn new(config: AppConfig) -> Result<Self> {
        let dir = config.cache.resolved_dir();
        log::debug!("Cache store at {}", dir.display());
        let store: Arc<dyn CacheStore> = Arc::new(DiskCacheStore::new(dir));
        let network: Arc<dyn Network> =
            Arc::new(HttpNetwork::new(config.server.upstream.as_deref())?);
        Ok(Self {
            config,
            store,
            network,
        })
    }

    fn registration(&self) -> Registration {
        Registration::new(Arc::clone(&self.store), Arc::clone(&self.network))
    }

    fn fetcher(&self) -> ModelFetcher {
        ModelFetcher::new(
            Arc::clone(&self.store),
            Arc::clone(&self.network),
            self.config.cache.name.clone(),
        )
    }
}

/// Cancels `token` on Ctrl-C or, on Unix, SIGTERM.
fn cancel_on_signal(token: CancellationToken) {
    tokio::spawn(async move {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{SignalKind, signal};
            match signal(SignalKind::terminate()) {
                Ok(mut term) => {
                    tokio::select! {
                        _ = tokio::signal::ctrl_c() => {}
                        _ = term.recv() => {}
                    }
                }
                Err(e) => {
                    log::warn!("Cannot listen for SIGTERM: {e}");
                    let _ = tokio::signal::ctrl_c().await;
                }
            }
        }
        #[cfg(not(unix))]
        {
            let _ = tokio::signal::ctrl_c().await;
        }
        log::info!("Shutting down");
        token.cancel();
    });
}

/// Runs the selected mode.
///
/// # Errors
///
/// Returns an error if configuration cannot be loaded or the mode fails.
pub async fn run(args: CliArgs) -> Result<()> {
    if args.mode == Mode::Help {
        print_usage();
        return Ok(());
    }

    let config_path = args.config_path.unwrap_or_else(AppConfig::default_path);
    let config = AppConfig::load_or_create(&config_path)?.with_env_overrides();
    log::info!("Loaded config from {}", config_path.display());
    let services = Services::new(config)?;

    match args.mode {
        Mode::Serve => serve(&services).await,
        Mode::Fetch { url } => fetch(&services, &url).await,
        Mode::Precache => precache(&services).await,
        Mode::CacheList => list_cache(&services).await,
        Mode::CacheClear => clear_cache(&services).await,
        Mode::Help => Ok(()),
    }
}

async fn serve(services: &Services) -> Result<()> {
    let config = &services.config;
    let registration = Arc::new(services.registration());
    if config.server.upstream.is_some() {
        if let Err(e) = registration.register(config.worker_config()).await {
            log::warn!("Serving without offline cache: {e}");
        }
    } else {
        log::warn!("No upstream origin configured, asset proxy disabled");
    }

    let runtime: Arc<dyn ModelRuntime> = Arc::new(UnavailableRuntime);
    let session = PageSession::new(
        services.fetcher(),
        runtime,
        config.model.clone(),
        config.generation.clone(),
    );
    let shutdown = CancellationToken::new();
    cancel_on_signal(shutdown.clone());

    let state = ApiState::new(
        Arc::new(Page::new(session)),
        registration,
        config.server.upstream.clone(),
        shutdown,
    );
    run_server(state, &config.server.host, config.server.port).await
}

async fn fetch(services: &Services, url: &str) -> Result<()> {
    let cancel = CancellationToken::new();
    cancel_on_signal(cancel.clone());
    let progress: Arc<dyn DownloadProgress> = Arc::new(CliProgress::new());

    let fetched = services.fetcher().fetch(url, &progress, &cancel).await?;
    print_summary(url, &fetched.stats);
    Ok(())
}

async fn precache(services: &Services) -> Result<()> {
    let worker_config = services.config.worker_config();
    if services.config.server.upstream.is_none()
        && worker_config.precache.iter().any(|p| !p.contains("://"))
    {
        return Err(Error::Config(
            "server.upstream must be set to precache relative paths".to_string(),
        ));
    }

    let count = worker_config.precache.len();
    let worker = services.registration().register(worker_config).await?;
    println!(
        "{} {count} asset(s) into {}",
        style("Precached").green().bold(),
        worker.cache_name()
    );
    Ok(())
}

async fn list_cache(services: &Services) -> Result<()> {
    let names = services.store.names().await?;
    if names.is_empty() {
        println!("Cache is empty.");
        return Ok(());
    }
    for name in names {
        let ns = services.store.open(&name).await?;
        let mut keys = ns.keys().await?;
        keys.sort();
        println!("{} ({} entries)", style(&name).bold(), keys.len());
        for key in keys {
            let size = ns
                .lookup(&key)
                .await?
                .map_or(0, |entry| entry.body.len() as u64);
            println!("  {key} ({})", format_bytes(size));
        }
    }
    Ok(())
}

async fn clear_cache(services: &Services) -> Result<()> {
    let name = &services.config.cache.name;
    if services.store.delete(name).await? {
        println!("Deleted cache {name}");
    } else {
        println!("Cache {name} does not exist");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> Vec<String> {
        list.iter().map(ToString::to_string).collect()
    }

    #[test]
    fn parse_modes() {
        assert_eq!(parse_args(&args(&["serve"])).unwrap().mode, Mode::Serve);
        assert_eq!(parse_args(&args(&["precache"])).unwrap().mode, Mode::Precache);
        assert_eq!(parse_args(&args(&["cache", "list"])).unwrap().mode, Mode::CacheList);
        assert_eq!(parse_args(&args(&["cache", "clear"])).unwrap().mode, Mode::CacheClear);
        assert_eq!(
            parse_args(&args(&["fetch", "https://hf.test/unet.onnx"])).unwrap().mode,
            Mode::Fetch {
                url: "https://hf.test/unet.onnx".to_string()
            }
        );
        assert_eq!(parse_args(&[]).unwrap().mode, Mode::Help);
        assert_eq!(parse_args(&args(&["serve", "-h"])).unwrap().mode, Mode::Help);
    }

    #[test]
    fn parse_config_flag() {
        let parsed = parse_args(&args(&["--config", "/etc/nyvera.toml", "serve"])).unwrap();
        assert_eq!(parsed.config_path, Some(PathBuf::from("/etc/nyvera.toml")));
        assert_eq!(parsed.mode, Mode::Serve);
    }

    #[test]
    fn parse_errors() {
        assert!(parse_args(&args(&["--config"])).is_err());
        assert!(parse_args(&args(&["fetch"])).is_err());
        assert!(parse_args(&args(&["cache"])).is_err());
        assert!(parse_args(&args(&["--verbose", "serve"])).is_err());
        assert!(parse_args(&args(&["serve", "now"])).is_err());
    }
}
