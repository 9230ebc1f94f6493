//! Application configuration loaded from a TOML file.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::runtime::GenerationOptions;
use crate::session::PipelineConfig;
use crate::worker::{DEFAULT_CACHE_NAME, DEFAULT_PRECACHE, WorkerConfig};

/// Default port of the HTTP front-end.
pub const DEFAULT_API_PORT: u16 = 9723;

/// Environment variable overriding [`ServerConfig::port`].
pub const API_PORT_ENV: &str = "NYVERA_API_PORT";

/// Cache namespace and precache settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Namespace shared by the asset worker and the model fetcher.
    pub name: String,
    /// Store directory. Defaults to the platform cache directory.
    pub dir: Option<PathBuf>,
    /// Assets fetched when the worker installs.
    pub precache: Vec<String>,
    /// Also precache the model files at install.
    pub precache_model: bool,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            name: DEFAULT_CACHE_NAME.to_string(),
            dir: None,
            precache: DEFAULT_PRECACHE.iter().map(ToString::to_string).collect(),
            precache_model: false,
        }
    }
}

impl CacheConfig {
    /// The configured directory, or `<cache dir>/nyvera`.
    #[must_use]
    pub fn resolved_dir(&self) -> PathBuf {
        self.dir.clone().unwrap_or_else(|| {
            dirs::cache_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("nyvera")
        })
    }
}

/// HTTP front-end settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Origin that uncached asset requests are forwarded to.
    pub upstream: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: DEFAULT_API_PORT,
            upstream: None,
        }
    }
}

/// Complete application configuration.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub cache: CacheConfig,
    pub server: ServerConfig,
    pub model: PipelineConfig,
    pub generation: GenerationOptions,
}

impl AppConfig {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// `<config dir>/nyvera/config.toml`.
    #[must_use]
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("nyvera")
            .join("config.toml")
    }

    #[must_use]
    pub fn with_cache_name(mut self, name: impl Into<String>) -> Self {
        self.cache.name = name.into();
        self
    }

    #[must_use]
    pub fn with_cache_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cache.dir = Some(dir.into());
        self
    }

    #[must_use]
    pub const fn with_port(mut self, port: u16) -> Self {
        self.server.port = port;
        self
    }

    #[must_use]
    pub fn with_upstream(mut self, origin: impl Into<String>) -> Self {
        self.server.upstream = Some(origin.into());
        self
    }

    #[must_use]
    pub fn with_model_base(mut self, base_url: impl Into<String>) -> Self {
        self.model.base_url = base_url.into();
        self
    }

    /// Reads the configuration at `path`.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or is not valid TOML.
    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        toml::from_str(&contents)
            .map_err(|e| Error::Config(format!("{}: {e}", path.display())))
    }

    /// Reads `path`, writing the defaults there first if it does not exist.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, parsed or created.
    pub fn load_or_create(path: &Path) -> Result<Self> {
        if path.exists() {
            return Self::load(path);
        }
        let config = Self::default();
        config.save(path)?;
        log::info!("Wrote default configuration to {}", path.display());
        Ok(config)
    }

    /// Saves the configuration atomically (write tmp + rename).
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be created or the file
    /// cannot be written.
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)?;
        }
        let text = toml::to_string_pretty(self).map_err(|e| Error::Config(e.to_string()))?;
        let tmp_path = path.with_extension("toml.tmp");
        std::fs::write(&tmp_path, text)?;
        std::fs::rename(&tmp_path, path)?;
        Ok(())
    }

    /// Applies environment overrides.
    #[must_use]
    pub fn with_env_overrides(self) -> Self {
        let port = std::env::var(API_PORT_ENV).ok();
        self.with_port_override(port.as_deref())
    }

    fn with_port_override(mut self, value: Option<&str>) -> Self {
        if let Some(value) = value {
            match value.parse() {
                Ok(port) => self.server.port = port,
                Err(_) => log::warn!("Ignoring invalid {API_PORT_ENV}={value:?}"),
            }
        }
        self
    }

    /// Worker settings derived from the cache and server sections.
    #[must_use]
    pub fn worker_config(&self) -> WorkerConfig {
        let mut precache = self.cache.precache.clone();
        if self.cache.precache_model {
            precache.extend(self.model.file_urls());
        }
        WorkerConfig {
            cache_name: self.cache.name.clone(),
            precache,
            origin: self.server.upstream.clone(),
        }
    }
}
