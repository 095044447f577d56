use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

pub const DEFAULT_WORKER_TIMEOUT_MS: u64 = 60_000;
pub const MIN_WORKER_TIMEOUT_MS: u64 = 100;
pub const MAX_WORKER_TIMEOUT_MS: u64 = 600_000;
pub const WORKER_TIMEOUT_ENV: &str = "SWITCHSCAN_WORKER_TIMEOUT_MS";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config '{path}': {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to write config '{path}': {source}")]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("invalid toml in '{path}': {source}")]
    Toml {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[error("invalid json5 in '{path}': {source}")]
    Json5 {
        path: PathBuf,
        source: json5::Error,
    },
    #[error("failed to encode config: {0}")]
    Encode(#[from] toml::ser::Error),
    #[error("{0}")]
    Invalid(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub worker_timeout_ms: u64,
    pub watch_interval_ms: u64,
    pub excluded_processes: Vec<String>,
    pub disabled_sources: Vec<String>,
    /// Worker executable; the running binary is used when unset.
    pub worker_path: Option<PathBuf>,
    pub log_level: String,
    pub log_to_file: bool,
    #[serde(skip)]
    pub config_path: PathBuf,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            worker_timeout_ms: DEFAULT_WORKER_TIMEOUT_MS,
            watch_interval_ms: 2_000,
            excluded_processes: vec!["explorer".to_string()],
            disabled_sources: Vec::new(),
            worker_path: None,
            log_level: "info".to_string(),
            log_to_file: false,
            config_path: stable_app_data_dir().join("config.toml"),
        }
    }
}

impl Config {
    pub fn worker_timeout(&self) -> Duration {
        Duration::from_millis(self.worker_timeout_ms)
    }

    pub fn watch_interval(&self) -> Duration {
        Duration::from_millis(self.watch_interval_ms)
    }
}

pub fn stable_app_data_dir() -> PathBuf {
    if let Some(app_data) = std::env::var_os("APPDATA") {
        return PathBuf::from(app_data).join("SwitchScan");
    }
    if let Some(xdg) = std::env::var_os("XDG_CONFIG_HOME") {
        return PathBuf::from(xdg).join("switchscan");
    }
    if let Some(home) = std::env::var_os("HOME") {
        return PathBuf::from(home).join(".config").join("switchscan");
    }
    std::env::temp_dir().join("switchscan")
}

pub fn validate(cfg: &Config) -> Result<(), String> {
    if !(MIN_WORKER_TIMEOUT_MS..=MAX_WORKER_TIMEOUT_MS).contains(&cfg.worker_timeout_ms) {
        return Err(format!(
            "worker_timeout_ms must be between {MIN_WORKER_TIMEOUT_MS} and {MAX_WORKER_TIMEOUT_MS}"
        ));
    }

    if cfg.watch_interval_ms == 0 {
        return Err("watch_interval_ms must be positive".into());
    }

    if cfg
        .excluded_processes
        .iter()
        .chain(cfg.disabled_sources.iter())
        .any(|name| name.trim().is_empty())
    {
        return Err("excluded_processes and disabled_sources entries must be non-empty".into());
    }

    if crate::logging::parse_level(&cfg.log_level).is_none() {
        return Err(format!("unknown log_level '{}'", cfg.log_level));
    }

    Ok(())
}

/// Loads the config at `path` (or the default location). A missing file
/// yields defaults; `.json`/`.json5` files are parsed as JSON5, anything else
/// as TOML.
pub fn load(path: Option<&Path>) -> Result<Config, ConfigError> {
    let config_path = path
        .map(Path::to_path_buf)
        .unwrap_or_else(|| Config::default().config_path);

    let mut cfg = if config_path.exists() {
        let raw = std::fs::read_to_string(&config_path).map_err(|source| ConfigError::Read {
            path: config_path.clone(),
            source,
        })?;
        parse(&config_path, &raw)?
    } else {
        Config::default()
    };
    cfg.config_path = config_path;

    override_worker_timeout(&mut cfg, std::env::var(WORKER_TIMEOUT_ENV).ok().as_deref())?;

    validate(&cfg).map_err(ConfigError::Invalid)?;
    Ok(cfg)
}

/// Applies a raw `SWITCHSCAN_WORKER_TIMEOUT_MS` value. Unset or blank leaves
/// the configured timeout alone; anything else must be a millisecond count.
pub fn override_worker_timeout(cfg: &mut Config, raw: Option<&str>) -> Result<(), ConfigError> {
    let Some(raw) = raw.map(str::trim).filter(|raw| !raw.is_empty()) else {
        return Ok(());
    };
    cfg.worker_timeout_ms = raw.parse::<u64>().map_err(|_| {
        ConfigError::Invalid(format!(
            "{WORKER_TIMEOUT_ENV} must be a whole number of milliseconds, got '{raw}'"
        ))
    })?;
    Ok(())
}

pub fn save(cfg: &Config) -> Result<(), ConfigError> {
    let encoded = toml::to_string_pretty(cfg)?;
    if let Some(parent) = cfg.config_path.parent() {
        std::fs::create_dir_all(parent).map_err(|source| ConfigError::Write {
            path: parent.to_path_buf(),
            source,
        })?;
    }
    std::fs::write(&cfg.config_path, encoded).map_err(|source| ConfigError::Write {
        path: cfg.config_path.clone(),
        source,
    })
}

fn parse(path: &Path, raw: &str) -> Result<Config, ConfigError> {
    let is_json = path
        .extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| ext.eq_ignore_ascii_case("json") || ext.eq_ignore_ascii_case("json5"));

    if is_json {
        json5::from_str(raw).map_err(|source| ConfigError::Json5 {
            path: path.to_path_buf(),
            source,
        })
    } else {
        toml::from_str(raw).map_err(|source| ConfigError::Toml {
            path: path.to_path_buf(),
            source,
        })
    }
}
