//! Runtime configuration.
//!
//! Values come from, in increasing precedence: built-in defaults, an optional
//! JSON file named by `HYDRA_CONFIG`, and `HYDRA_*` environment variables
//! (`IB_HOST` / `IB_PORT` are accepted as aliases). A `.env` file in the
//! working directory is loaded into the environment first.

use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::gateway::BarSettings;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("invalid value for {key}: {value:?}")]
    InvalidValue { key: String, value: String },
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HydraConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default)]
    pub client_id: i32,
    /// Symbol universe shown in the position table and streamed at startup.
    #[serde(default = "default_symbols")]
    pub symbols: Vec<String>,
    #[serde(default = "default_bots")]
    pub bots: Vec<String>,
    #[serde(default = "default_tick_interval_ms")]
    pub tick_interval_ms: u64,
    #[serde(default = "default_log_retention")]
    pub log_retention: usize,
    #[serde(default = "default_drain_window_ms")]
    pub drain_window_ms: u64,
    #[serde(default = "default_step_timeout_ms")]
    pub step_timeout_ms: u64,
    #[serde(default = "default_frame_interval_ms")]
    pub frame_interval_ms: u64,
    #[serde(default = "default_bar_size_secs")]
    pub bar_size_secs: u64,
    #[serde(default = "default_bar_lookback_secs")]
    pub bar_lookback_secs: u64,
    #[serde(default = "default_bars_tail")]
    pub bars_tail: usize,
    /// Paper feed cadence, only used with the simulated gateway.
    #[serde(default = "default_feed_interval_ms")]
    pub feed_interval_ms: u64,
    /// Positions the simulated gateway starts with, by symbol.
    #[serde(default)]
    pub paper_holdings: BTreeMap<String, f64>,
    #[serde(default)]
    pub log_file: Option<PathBuf>,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    7497
}

fn default_symbols() -> Vec<String> {
    vec!["MES".to_string(), "MNQ".to_string()]
}

fn default_bots() -> Vec<String> {
    vec!["master".to_string()]
}

fn default_tick_interval_ms() -> u64 {
    500
}

fn default_log_retention() -> usize {
    300
}

fn default_drain_window_ms() -> u64 {
    500
}

fn default_step_timeout_ms() -> u64 {
    5_000
}

fn default_frame_interval_ms() -> u64 {
    100
}

fn default_bar_size_secs() -> u64 {
    300
}

fn default_bar_lookback_secs() -> u64 {
    49_500
}

fn default_bars_tail() -> usize {
    8
}

fn default_feed_interval_ms() -> u64 {
    250
}

impl Default for HydraConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            client_id: 0,
            symbols: default_symbols(),
            bots: default_bots(),
            tick_interval_ms: default_tick_interval_ms(),
            log_retention: default_log_retention(),
            drain_window_ms: default_drain_window_ms(),
            step_timeout_ms: default_step_timeout_ms(),
            frame_interval_ms: default_frame_interval_ms(),
            bar_size_secs: default_bar_size_secs(),
            bar_lookback_secs: default_bar_lookback_secs(),
            bars_tail: default_bars_tail(),
            feed_interval_ms: default_feed_interval_ms(),
            paper_holdings: BTreeMap::new(),
            log_file: None,
        }
    }
}

impl HydraConfig {
    /// Load from `.env`, `HYDRA_CONFIG` and the process environment, then
    /// validate.
    pub fn load() -> Result<Self, ConfigError> {
        if let Err(err) = dotenvy::dotenv() {
            if !err.not_found() {
                tracing::warn!("ignoring unreadable .env file: {err}");
            }
        }

        let mut config = match std::env::var("HYDRA_CONFIG") {
            Ok(path) if !path.trim().is_empty() => Self::from_file(path.trim())?,
            _ => Self::default(),
        };
        config.apply_env(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Read a JSON file. Missing keys take their defaults.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Overlay environment variables read through `lookup`.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |primary: &str, alias: Option<&str>| -> Option<(String, String)> {
            let found = lookup(primary)
                .map(|value| (primary.to_string(), value))
                .or_else(|| alias.and_then(|alias| lookup(alias).map(|v| (alias.to_string(), v))));
            found.filter(|(_, value)| !value.trim().is_empty())
        };

        if let Some((_, host)) = get("HYDRA_HOST", Some("IB_HOST")) {
            self.host = host.trim().to_string();
        }
        if let Some((key, raw)) = get("HYDRA_PORT", Some("IB_PORT")) {
            self.port = parse_var(&key, raw)?;
        }
        if let Some((key, raw)) = get("HYDRA_CLIENT_ID", None) {
            self.client_id = parse_var(&key, raw)?;
        }
        if let Some((_, raw)) = get("HYDRA_SYMBOLS", None) {
            self.symbols = split_list(&raw)
                .map(|symbol| symbol.to_ascii_uppercase())
                .collect();
        }
        if let Some((_, raw)) = get("HYDRA_BOTS", None) {
            self.bots = split_list(&raw).map(str::to_string).collect();
        }
        if let Some((key, raw)) = get("HYDRA_TICK_MS", None) {
            self.tick_interval_ms = parse_var(&key, raw)?;
        }
        if let Some((key, raw)) = get("HYDRA_LOG_RETENTION", None) {
            self.log_retention = parse_var(&key, raw)?;
        }
        if let Some((key, raw)) = get("HYDRA_DRAIN_MS", None) {
            self.drain_window_ms = parse_var(&key, raw)?;
        }
        if let Some((key, raw)) = get("HYDRA_STEP_TIMEOUT_MS", None) {
            self.step_timeout_ms = parse_var(&key, raw)?;
        }
        if let Some((key, raw)) = get("HYDRA_FRAME_MS", None) {
            self.frame_interval_ms = parse_var(&key, raw)?;
        }
        if let Some((key, raw)) = get("HYDRA_BARS_TAIL", None) {
            self.bars_tail = parse_var(&key, raw)?;
        }
        if let Some((key, raw)) = get("HYDRA_FEED_MS", None) {
            self.feed_interval_ms = parse_var(&key, raw)?;
        }
        if let Some((key, raw)) = get("HYDRA_PAPER_HOLDINGS", None) {
            self.paper_holdings = parse_holdings(&key, &raw)?;
        }
        if let Some((_, raw)) = get("HYDRA_LOG_FILE", None) {
            self.log_file = Some(PathBuf::from(raw.trim()));
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let positive = [
            ("tick_interval_ms", self.tick_interval_ms),
            ("frame_interval_ms", self.frame_interval_ms),
            ("step_timeout_ms", self.step_timeout_ms),
            ("feed_interval_ms", self.feed_interval_ms),
            ("bar_size_secs", self.bar_size_secs),
        ];
        for (name, value) in positive {
            if value == 0 {
                return Err(ConfigError::Invalid(format!("{name} must be greater than zero")));
            }
        }
        if self.log_retention == 0 {
            return Err(ConfigError::Invalid("log_retention must be at least 1".into()));
        }
        if self.bars_tail == 0 {
            return Err(ConfigError::Invalid("bars_tail must be at least 1".into()));
        }
        if self.host.trim().is_empty() {
            return Err(ConfigError::Invalid("host must not be empty".into()));
        }
        if self.symbols.is_empty() {
            return Err(ConfigError::Invalid("symbol universe must not be empty".into()));
        }

        let mut seen = HashSet::new();
        for name in &self.bots {
            if name.trim().is_empty() {
                return Err(ConfigError::Invalid("bot names must not be empty".into()));
            }
            if !seen.insert(name.as_str()) {
                return Err(ConfigError::Invalid(format!("bot name {name} is listed twice")));
            }
        }
        Ok(())
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }

    pub fn drain_window(&self) -> Duration {
        Duration::from_millis(self.drain_window_ms)
    }

    pub fn step_timeout(&self) -> Duration {
        Duration::from_millis(self.step_timeout_ms)
    }

    pub fn frame_interval(&self) -> Duration {
        Duration::from_millis(self.frame_interval_ms)
    }

    pub fn feed_interval(&self) -> Duration {
        Duration::from_millis(self.feed_interval_ms)
    }

    pub fn bar_settings(&self) -> BarSettings {
        BarSettings {
            bar_size: Duration::from_secs(self.bar_size_secs),
            lookback: Duration::from_secs(self.bar_lookback_secs),
        }
    }
}

fn parse_var<T: FromStr>(key: &str, raw: String) -> Result<T, ConfigError> {
    raw.trim().parse().map_err(|_| ConfigError::InvalidValue {
        key: key.to_string(),
        value: raw,
    })
}

/// `MES:2,MNQ:-1` style list.
fn parse_holdings(key: &str, raw: &str) -> Result<BTreeMap<String, f64>, ConfigError> {
    split_list(raw)
        .map(|item| {
            let invalid = || ConfigError::InvalidValue {
                key: key.to_string(),
                value: raw.to_string(),
            };
            let (symbol, quantity) = item.split_once(':').ok_or_else(invalid)?;
            let quantity: f64 = quantity.trim().parse().map_err(|_| invalid())?;
            Ok((symbol.trim().to_ascii_uppercase(), quantity))
        })
        .collect()
}

fn split_list(raw: &str) -> impl Iterator<Item = &str> {
    raw.split(',').map(str::trim).filter(|item| !item.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::collections::HashMap;
    use std::io::Write;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_are_valid() {
        let config = HydraConfig::default();
        config.validate().unwrap();
        assert_eq!(config.port, 7497);
        assert_eq!(config.symbols, vec!["MES", "MNQ"]);
        assert_eq!(config.tick_interval(), Duration::from_millis(500));
        assert_eq!(config.log_retention, 300);
    }

    #[test]
    fn hydra_variables_win_over_ib_aliases() {
        let mut config = HydraConfig::default();
        config
            .apply_env(env(&[
                ("IB_HOST", "10.0.0.5"),
                ("IB_PORT", "4002"),
                ("HYDRA_PORT", "4001"),
                ("HYDRA_SYMBOLS", "mes, cl ,,gc"),
                ("HYDRA_BOTS", "alpha,beta"),
                ("HYDRA_TICK_MS", "200"),
                ("HYDRA_PAPER_HOLDINGS", "mes:2, MNQ:-1"),
            ]))
            .unwrap();

        assert_eq!(config.host, "10.0.0.5");
        assert_eq!(config.port, 4001);
        assert_eq!(config.symbols, vec!["MES", "CL", "GC"]);
        assert_eq!(config.bots, vec!["alpha", "beta"]);
        assert_eq!(config.tick_interval_ms, 200);
        assert_eq!(config.paper_holdings.get("MES"), Some(&2.0));
        assert_eq!(config.paper_holdings.get("MNQ"), Some(&-1.0));
    }

    #[test]
    fn unparsable_values_name_the_variable() {
        let mut config = HydraConfig::default();
        let err = config.apply_env(env(&[("IB_PORT", "seventy")])).unwrap_err();
        match err {
            ConfigError::InvalidValue { key, value } => {
                assert_eq!(key, "IB_PORT");
                assert_eq!(value, "seventy");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn malformed_holdings_are_rejected() {
        let mut config = HydraConfig::default();
        assert!(matches!(
            config.apply_env(env(&[("HYDRA_PAPER_HOLDINGS", "MES=2")])),
            Err(ConfigError::InvalidValue { .. })
        ));
    }

    #[test]
    fn validation_rejects_bad_settings() {
        let zero_tick = HydraConfig {
            tick_interval_ms: 0,
            ..HydraConfig::default()
        };
        assert!(matches!(zero_tick.validate(), Err(ConfigError::Invalid(_))));

        let duplicate_bots = HydraConfig {
            bots: vec!["alpha".into(), "alpha".into()],
            ..HydraConfig::default()
        };
        assert!(duplicate_bots.validate().is_err());

        let no_universe = HydraConfig {
            symbols: Vec::new(),
            ..HydraConfig::default()
        };
        assert!(no_universe.validate().is_err());

        let no_retention = HydraConfig {
            log_retention: 0,
            ..HydraConfig::default()
        };
        assert!(no_retention.validate().is_err());
    }

    #[test]
    fn file_values_fill_in_over_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"port": 4002, "bots": ["alpha", "beta"]}}"#).unwrap();

        let config = HydraConfig::from_file(file.path()).unwrap();
        assert_eq!(config.port, 4002);
        assert_eq!(config.bots, vec!["alpha", "beta"]);
        assert_eq!(config.host, "127.0.0.1");
        assert_eq!(config.bars_tail, 8);
    }

    #[test]
    fn malformed_file_is_a_parse_error() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "{{ not json").unwrap();
        assert!(matches!(
            HydraConfig::from_file(file.path()),
            Err(ConfigError::Parse { .. })
        ));
    }
}
