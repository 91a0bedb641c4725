//! Viewer configuration
//!
//! Tunables for the page cache, the virtualized list and the rasterization
//! workers. Values start from defaults, then a TOML file, then environment
//! variables.

use leaflet_engine::ScaleFactor;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// What to do when the decoder fails to produce a page.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RetryPolicy {
    /// Cache the failure after the first attempt.
    #[default]
    Never,
    /// Try up to this many times in total before caching the failure.
    Attempts(u32),
}

impl RetryPolicy {
    pub fn from_attempts(attempts: u32) -> Self {
        if attempts <= 1 {
            Self::Never
        } else {
            Self::Attempts(attempts)
        }
    }

    pub fn max_attempts(self) -> u32 {
        match self {
            Self::Never => 1,
            Self::Attempts(n) => n.max(1),
        }
    }
}

/// Configuration for one viewer instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ViewerConfig {
    /// Maximum number of materialized pages held by the cache
    pub cache_capacity: usize,
    /// Pages materialized beyond each end of the visible range
    pub lookahead_margin: u32,
    /// Distance beyond the visible range after which cached pages are released
    pub eviction_margin: u32,
    /// Pages in the initial visible range after a document opens
    pub screenful: u32,
    /// Rasterization scale applied to natural page dimensions
    pub scale: ScaleFactor,
    /// Worker threads; 0 rasterizes synchronously on request
    pub workers: usize,
    pub retry: RetryPolicy,
    /// Idle poll interval of worker threads
    pub poll_interval: Duration,
}

impl Default for ViewerConfig {
    fn default() -> Self {
        Self {
            cache_capacity: 8,
            lookahead_margin: 2,
            eviction_margin: 6,
            screenful: 2,
            scale: ScaleFactor::OVERSAMPLE,
            workers: 1,
            retry: RetryPolicy::Never,
            poll_interval: Duration::from_millis(5),
        }
    }
}

/// On-disk form. Every key is optional.
#[derive(Debug, Default, Serialize, Deserialize)]
struct FileConfig {
    cache_capacity: Option<usize>,
    lookahead_margin: Option<u32>,
    eviction_margin: Option<u32>,
    screenful: Option<u32>,
    scale: Option<String>,
    workers: Option<usize>,
    retry_attempts: Option<u32>,
    poll_interval_ms: Option<u64>,
}

const ENV_CACHE_PAGES: &str = "LEAFLET_CACHE_PAGES";
const ENV_LOOKAHEAD: &str = "LEAFLET_LOOKAHEAD";
const ENV_EVICTION_MARGIN: &str = "LEAFLET_EVICTION_MARGIN";
const ENV_SCREENFUL: &str = "LEAFLET_SCREENFUL";
const ENV_SCALE: &str = "LEAFLET_SCALE";
const ENV_WORKERS: &str = "LEAFLET_WORKERS";
const ENV_RETRY_ATTEMPTS: &str = "LEAFLET_RETRY_ATTEMPTS";

impl ViewerConfig {
    pub fn with_cache_capacity(mut self, pages: usize) -> Self {
        self.cache_capacity = pages;
        self
    }

    pub fn with_lookahead_margin(mut self, pages: u32) -> Self {
        self.lookahead_margin = pages;
        self
    }

    pub fn with_eviction_margin(mut self, pages: u32) -> Self {
        self.eviction_margin = pages;
        self
    }

    pub fn with_screenful(mut self, pages: u32) -> Self {
        self.screenful = pages;
        self
    }

    pub fn with_scale(mut self, scale: ScaleFactor) -> Self {
        self.scale = scale;
        self
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Eviction margin, never smaller than the lookahead margin.
    pub fn effective_eviction_margin(&self) -> u32 {
        self.eviction_margin.max(self.lookahead_margin)
    }

    /// Reject settings the viewer cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.cache_capacity == 0 {
            return Err(ConfigError::InvalidValue("cache_capacity".to_owned()));
        }
        if self.screenful == 0 {
            return Err(ConfigError::InvalidValue("screenful".to_owned()));
        }
        Ok(())
    }

    /// `<config dir>/leaflet/viewer.toml`, if the platform has a config dir.
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("leaflet").join("viewer.toml"))
    }

    /// Defaults, overlaid with the default config file if it exists, then
    /// with environment variables.
    pub fn load() -> Result<Self, ConfigError> {
        let config = match Self::default_path() {
            Some(path) if path.is_file() => Self::from_file(path)?,
            _ => Self::default(),
        };
        config.overlay_env()
    }

    /// Defaults overlaid with environment variables.
    ///
    /// - `LEAFLET_CACHE_PAGES`: cache capacity in pages
    /// - `LEAFLET_LOOKAHEAD`: lookahead margin in pages
    /// - `LEAFLET_EVICTION_MARGIN`: eviction margin in pages
    /// - `LEAFLET_SCREENFUL`: pages in the initial visible range
    /// - `LEAFLET_SCALE`: scale factor, `"2"` or `"3/2"`
    /// - `LEAFLET_WORKERS`: worker threads
    /// - `LEAFLET_RETRY_ATTEMPTS`: total decode attempts per page
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::default().overlay_env()
    }

    fn overlay_env(mut self) -> Result<Self, ConfigError> {
        if let Some(value) = env_parse(ENV_CACHE_PAGES)? {
            self.cache_capacity = value;
        }
        if let Some(value) = env_parse(ENV_LOOKAHEAD)? {
            self.lookahead_margin = value;
        }
        if let Some(value) = env_parse(ENV_EVICTION_MARGIN)? {
            self.eviction_margin = value;
        }
        if let Some(value) = env_parse(ENV_SCREENFUL)? {
            self.screenful = value;
        }
        if let Some(value) = env_parse(ENV_SCALE)? {
            self.scale = value;
        }
        if let Some(value) = env_parse(ENV_WORKERS)? {
            self.workers = value;
        }
        if let Some(value) = env_parse(ENV_RETRY_ATTEMPTS)? {
            self.retry = RetryPolicy::from_attempts(value);
        }
        Ok(self)
    }

    /// Defaults overlaid with a TOML file.
    ///
    /// ```toml
    /// cache_capacity = 8
    /// lookahead_margin = 2
    /// eviction_margin = 6
    /// screenful = 2
    /// scale = "2"
    /// workers = 1
    /// retry_attempts = 1
    /// poll_interval_ms = 5
    /// ```
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(path.as_ref()).map_err(ConfigError::Io)?;
        Self::from_toml(&contents)
    }

    pub fn from_toml(toml_str: &str) -> Result<Self, ConfigError> {
        let file: FileConfig = toml::from_str(toml_str)?;
        let mut config = Self::default();

        if let Some(value) = file.cache_capacity {
            config.cache_capacity = value;
        }
        if let Some(value) = file.lookahead_margin {
            config.lookahead_margin = value;
        }
        if let Some(value) = file.eviction_margin {
            config.eviction_margin = value;
        }
        if let Some(value) = file.screenful {
            config.screenful = value;
        }
        if let Some(value) = file.scale {
            config.scale =
                value.parse().map_err(|_| ConfigError::InvalidValue("scale".to_owned()))?;
        }
        if let Some(value) = file.workers {
            config.workers = value;
        }
        if let Some(value) = file.retry_attempts {
            config.retry = RetryPolicy::from_attempts(value);
        }
        if let Some(value) = file.poll_interval_ms {
            config.poll_interval = Duration::from_millis(value);
        }

        Ok(config)
    }

    pub fn to_toml(&self) -> Result<String, ConfigError> {
        let file = FileConfig {
            cache_capacity: Some(self.cache_capacity),
            lookahead_margin: Some(self.lookahead_margin),
            eviction_margin: Some(self.eviction_margin),
            screenful: Some(self.screenful),
            scale: Some(self.scale.to_string()),
            workers: Some(self.workers),
            retry_attempts: Some(self.retry.max_attempts()),
            poll_interval_ms: Some(self.poll_interval.as_millis() as u64),
        };
        Ok(toml::to_string(&file)?)
    }

    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        if let Some(parent) = path.as_ref().parent() {
            fs::create_dir_all(parent).map_err(ConfigError::Io)?;
        }
        fs::write(path.as_ref(), self.to_toml()?).map_err(ConfigError::Io)
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Result<Option<T>, ConfigError> {
    match std::env::var(key) {
        Ok(value) => value
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|_| ConfigError::InvalidValue(key.to_owned())),
        Err(_) => Ok(None),
    }
}

/// Errors that can occur while loading or saving configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid value for configuration key: {0}")]
    InvalidValue(String),
    #[error("I/O error: {0}")]
    Io(#[source] io::Error),
    #[error("malformed configuration file: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("could not serialize configuration: {0}")]
    Serialize(#[from] toml::ser::Error),
}
