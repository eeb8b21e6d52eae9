use serde::Deserialize;
use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::errors::{AppError, AppResult};
use crate::types::Priority;

/// Process-wide settings. Built-in defaults, then an optional TOML file,
/// then `DESKPOLL_*` environment variables.
#[derive(Debug, Clone)]
pub struct AppDefaults {
    pub tick_secs: u64,
    pub sweep_interval_secs: u64,
    pub fetch_timeout_secs: u64,
    pub max_concurrent_polls: usize,
    pub default_priority: Priority,
    pub batch_limit: usize,
    pub data_dir: Option<PathBuf>,
}

impl Default for AppDefaults {
    fn default() -> Self {
        Self {
            tick_secs: 5,
            sweep_interval_secs: 60,
            fetch_timeout_secs: 30,
            max_concurrent_polls: 4,
            default_priority: Priority::Normal,
            batch_limit: 100,
            data_dir: None,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileConfig {
    tick_secs: Option<u64>,
    sweep_interval_secs: Option<u64>,
    fetch_timeout_secs: Option<u64>,
    max_concurrent_polls: Option<usize>,
    default_priority: Option<Priority>,
    batch_limit: Option<usize>,
    data_dir: Option<PathBuf>,
}

impl AppDefaults {
    pub fn load(path: Option<&Path>) -> AppResult<Self> {
        let mut defaults = Self::default();

        let file_path = path
            .map(Path::to_path_buf)
            .or_else(|| env::var("DESKPOLL_CONFIG").ok().map(PathBuf::from));
        if let Some(file_path) = file_path {
            let raw = std::fs::read_to_string(&file_path).map_err(|e| {
                AppError::Config(format!("reading {}: {e}", file_path.display()))
            })?;
            defaults.apply_toml(&raw)?;
        }

        defaults.apply_env()?;
        defaults.validate()?;
        Ok(defaults)
    }

    pub fn apply_toml(&mut self, raw: &str) -> AppResult<()> {
        let file: FileConfig =
            toml::from_str(raw).map_err(|e| AppError::Config(format!("invalid config file: {e}")))?;

        if let Some(v) = file.tick_secs {
            self.tick_secs = v;
        }
        if let Some(v) = file.sweep_interval_secs {
            self.sweep_interval_secs = v;
        }
        if let Some(v) = file.fetch_timeout_secs {
            self.fetch_timeout_secs = v;
        }
        if let Some(v) = file.max_concurrent_polls {
            self.max_concurrent_polls = v;
        }
        if let Some(v) = file.default_priority {
            self.default_priority = v;
        }
        if let Some(v) = file.batch_limit {
            self.batch_limit = v;
        }
        if file.data_dir.is_some() {
            self.data_dir = file.data_dir;
        }
        Ok(())
    }

    fn apply_env(&mut self) -> AppResult<()> {
        if let Some(v) = env_parse("DESKPOLL_TICK_SECS")? {
            self.tick_secs = v;
        }
        if let Some(v) = env_parse("DESKPOLL_SWEEP_INTERVAL_SECS")? {
            self.sweep_interval_secs = v;
        }
        if let Some(v) = env_parse("DESKPOLL_FETCH_TIMEOUT_SECS")? {
            self.fetch_timeout_secs = v;
        }
        if let Some(v) = env_parse("DESKPOLL_MAX_CONCURRENT_POLLS")? {
            self.max_concurrent_polls = v;
        }
        if let Some(v) = env_parse("DESKPOLL_BATCH_LIMIT")? {
            self.batch_limit = v;
        }
        if let Ok(raw) = env::var("DESKPOLL_DEFAULT_PRIORITY") {
            self.default_priority = raw.parse().map_err(AppError::Config)?;
        }
        if let Ok(raw) = env::var("DESKPOLL_DATA_DIR") {
            self.data_dir = Some(PathBuf::from(raw));
        }
        Ok(())
    }

    fn validate(&self) -> AppResult<()> {
        if self.tick_secs == 0 {
            return Err(AppError::Config("tick_secs must be positive".into()));
        }
        if self.sweep_interval_secs == 0 {
            return Err(AppError::Config("sweep_interval_secs must be positive".into()));
        }
        if self.max_concurrent_polls == 0 {
            return Err(AppError::Config("max_concurrent_polls must be positive".into()));
        }
        if self.batch_limit == 0 {
            return Err(AppError::Config("batch_limit must be positive".into()));
        }
        Ok(())
    }

    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.fetch_timeout_secs)
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> AppResult<Option<T>> {
    match env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|_| AppError::Config(format!("{key} has invalid value {raw:?}"))),
        Err(_) => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn toml_overrides_defaults() {
        let mut defaults = AppDefaults::default();
        defaults
            .apply_toml("sweep_interval_secs = 15\ndefault_priority = \"high\"\n")
            .unwrap();
        assert_eq!(defaults.sweep_interval_secs, 15);
        assert_eq!(defaults.default_priority, Priority::High);
        assert_eq!(defaults.tick_secs, 5);
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let mut defaults = AppDefaults::default();
        let err = defaults.apply_toml("demo_mode = true\n").unwrap_err();
        assert!(matches!(err, AppError::Config(_)));
    }
}
