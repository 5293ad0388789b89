use anyhow::{anyhow, Context as AnyhowContext, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tilescope_engine::{DEFAULT_EXPORT_LIMIT, DEFAULT_MAX_GRID_CELLS};

pub(crate) const DEFAULT_CONFIG_FILE: &str = "tilescope.toml";
pub(crate) const DEFAULT_STORE_PATH: &str = "tilescope-store.json";
pub(crate) const DEFAULT_RULES_DIR: &str = "saved_rules";
pub(crate) const DEFAULT_BIND: &str = "127.0.0.1:7700";
const DEFAULT_RULE_STORE_TIMEOUT_MS: u64 = 5_000;

/// Effective settings: built-in defaults, then `tilescope.toml`, then
/// `TILESCOPE_*` environment variables, then command-line flags.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Config {
    pub store_path: PathBuf,
    pub rules_dir: PathBuf,
    pub export_csv_limit: usize,
    pub max_grid_cells: u64,
    pub bind: String,
    pub rule_store_timeout: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            store_path: PathBuf::from(DEFAULT_STORE_PATH),
            rules_dir: PathBuf::from(DEFAULT_RULES_DIR),
            export_csv_limit: DEFAULT_EXPORT_LIMIT,
            max_grid_cells: DEFAULT_MAX_GRID_CELLS,
            bind: DEFAULT_BIND.to_string(),
            rule_store_timeout: Duration::from_millis(DEFAULT_RULE_STORE_TIMEOUT_MS),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawConfig {
    #[serde(default)]
    paths: RawPaths,
    #[serde(default)]
    limits: RawLimits,
    #[serde(default)]
    server: RawServer,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawPaths {
    store: Option<PathBuf>,
    rules_dir: Option<PathBuf>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawLimits {
    export_csv_limit: Option<usize>,
    max_grid_cells: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawServer {
    bind: Option<String>,
    rule_store_timeout_ms: Option<u64>,
}

impl Config {
    /// An explicit path must exist; the default file is optional.
    pub(crate) fn load(explicit: Option<&Path>) -> Result<Self> {
        let raw = match explicit {
            Some(path) => {
                let text = std::fs::read_to_string(path)
                    .with_context(|| format!("Failed to read config {}", path.display()))?;
                Self::parse_raw(&text, path)?
            }
            None => {
                let path = Path::new(DEFAULT_CONFIG_FILE);
                match std::fs::read_to_string(path) {
                    Ok(text) => Self::parse_raw(&text, path)?,
                    Err(err) if err.kind() == std::io::ErrorKind::NotFound => RawConfig::default(),
                    Err(err) => {
                        return Err(err)
                            .with_context(|| format!("Failed to read config {}", path.display()))
                    }
                }
            }
        };

        let mut cfg = Self::from_raw(raw);
        cfg.apply_env(|key| std::env::var(key).ok())?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn parse_raw(text: &str, path: &Path) -> Result<RawConfig> {
        toml::from_str(text).with_context(|| format!("Invalid config {}", path.display()))
    }

    fn from_raw(raw: RawConfig) -> Self {
        let defaults = Self::default();
        Self {
            store_path: raw.paths.store.unwrap_or(defaults.store_path),
            rules_dir: raw.paths.rules_dir.unwrap_or(defaults.rules_dir),
            export_csv_limit: raw
                .limits
                .export_csv_limit
                .unwrap_or(defaults.export_csv_limit),
            max_grid_cells: raw.limits.max_grid_cells.unwrap_or(defaults.max_grid_cells),
            bind: raw.server.bind.unwrap_or(defaults.bind),
            rule_store_timeout: raw
                .server
                .rule_store_timeout_ms
                .map_or(defaults.rule_store_timeout, Duration::from_millis),
        }
    }

    fn apply_env(&mut self, var: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(v) = var("TILESCOPE_STORE") {
            self.store_path = PathBuf::from(v);
        }
        if let Some(v) = var("TILESCOPE_RULES_DIR") {
            self.rules_dir = PathBuf::from(v);
        }
        if let Some(v) = var("TILESCOPE_EXPORT_CSV_LIMIT") {
            self.export_csv_limit = parse_env("TILESCOPE_EXPORT_CSV_LIMIT", &v)?;
        }
        if let Some(v) = var("TILESCOPE_MAX_GRID_CELLS") {
            self.max_grid_cells = parse_env("TILESCOPE_MAX_GRID_CELLS", &v)?;
        }
        if let Some(v) = var("TILESCOPE_BIND") {
            self.bind = v;
        }
        if let Some(v) = var("TILESCOPE_RULE_STORE_TIMEOUT_MS") {
            self.rule_store_timeout =
                Duration::from_millis(parse_env("TILESCOPE_RULE_STORE_TIMEOUT_MS", &v)?);
        }
        Ok(())
    }

    fn validate(&self) -> Result<()> {
        if self.export_csv_limit == 0 {
            return Err(anyhow!("limits.export_csv_limit must be > 0"));
        }
        if self.max_grid_cells == 0 {
            return Err(anyhow!("limits.max_grid_cells must be > 0"));
        }
        if self.rule_store_timeout.is_zero() {
            return Err(anyhow!("server.rule_store_timeout_ms must be > 0"));
        }
        Ok(())
    }
}

fn parse_env<T: std::str::FromStr>(key: &str, value: &str) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    value
        .trim()
        .parse()
        .map_err(|err| anyhow!("{key}={value:?} is invalid: {err}"))
}
