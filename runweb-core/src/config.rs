use crate::error::{CoreError, Result};
use chrono::NaiveDate;
use runweb_api::{ApiClient, BackoffPolicy, ResponseCache};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

pub const DEFAULT_API_BASE: &str = "https://www.speedrun.com/api/v1/";
pub const DEFAULT_CONFIG_PATH: &str = "~/.config/runweb/config.toml";

/// Runtime settings. Every field has a default so a partial TOML file is
/// enough; CLI flags are applied on top by the binary.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct Settings {
    pub api_base: String,
    pub user_agent: String,
    pub api_key: Option<String>,
    pub backoff_secs: u64,
    pub max_retries: Option<u32>,
    pub timeout_secs: u64,
    pub cache_path: String,
    pub output_dir: String,
    pub final_date: NaiveDate,
    pub deny_games: Vec<String>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            api_base: DEFAULT_API_BASE.to_string(),
            user_agent: runweb_api::client::DEFAULT_USER_AGENT.to_string(),
            api_key: None,
            backoff_secs: 2,
            max_retries: None,
            timeout_secs: 30,
            cache_path: "~/.cache/runweb/responses.db".to_string(),
            output_dir: "data/network_raw".to_string(),
            final_date: NaiveDate::from_ymd_opt(2023, 1, 1).unwrap_or_default(),
            deny_games: vec!["y65797de".to_string()],
        }
    }
}

/// Expand a leading `~` to the home directory.
pub fn expand_path(path: &str) -> PathBuf {
    PathBuf::from(shellexpand::tilde(path).as_ref())
}

impl Settings {
    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)?;
        let settings: Settings = toml::from_str(&content)?;
        debug!(path = %path.display(), "loaded settings");
        Ok(settings)
    }

    /// Load `path` if it exists, otherwise fall back to defaults.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }

    pub fn cache_file(&self) -> PathBuf {
        expand_path(&self.cache_path)
    }

    pub fn output_path(&self) -> PathBuf {
        expand_path(&self.output_dir)
    }

    pub fn deny_list(&self) -> DenyList {
        DenyList::new(self.deny_games.iter().cloned())
    }

    pub fn backoff(&self) -> BackoffPolicy {
        let policy = BackoffPolicy::new(Duration::from_secs(self.backoff_secs));
        match self.max_retries {
            Some(max) => policy.with_max_retries(max),
            None => policy,
        }
    }

    /// Build an API client from these settings, optionally backed by a cache.
    pub fn client(&self, cache: Option<Arc<ResponseCache>>) -> Result<ApiClient> {
        let mut client = ApiClient::with_options(&self.api_base, &self.user_agent, self.timeout_secs)?
            .with_backoff(self.backoff());
        if let Some(cache) = cache {
            client = client.with_cache(cache);
        }
        if let Some(key) = &self.api_key {
            client = client.with_api_key(key.clone());
        }
        Ok(client)
    }

    pub fn parse_date(value: &str) -> Result<NaiveDate> {
        NaiveDate::parse_from_str(value, "%Y-%m-%d")
            .map_err(|e| CoreError::InvalidDate(format!("{}: {}", value, e)))
    }
}

/// Game ids known to break upstream or skew the network. Denied games
/// resolve to absent and are dropped by filters.
#[derive(Debug, Clone, Default)]
pub struct DenyList {
    games: HashSet<String>,
}

impl DenyList {
    pub fn new(games: impl IntoIterator<Item = String>) -> Self {
        Self {
            games: games.into_iter().collect(),
        }
    }

    pub fn contains(&self, id: &str) -> bool {
        self.games.contains(id)
    }

    pub fn len(&self) -> usize {
        self.games.len()
    }

    pub fn is_empty(&self) -> bool {
        self.games.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_defaults() {
        let settings = Settings::default();
        assert_eq!(settings.backoff_secs, 2);
        assert!(settings.max_retries.is_none());
        assert!(settings.deny_list().contains("y65797de"));
        assert_eq!(settings.final_date, NaiveDate::from_ymd_opt(2023, 1, 1).unwrap());
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "backoff_secs = 5").unwrap();
        writeln!(file, "max_retries = 10").unwrap();
        writeln!(file, "deny_games = []").unwrap();
        writeln!(file, "final_date = \"2022-06-01\"").unwrap();

        let settings = Settings::load(file.path()).unwrap();
        assert_eq!(settings.backoff_secs, 5);
        assert_eq!(settings.backoff().max_retries, Some(10));
        assert_eq!(settings.backoff().interval, Duration::from_secs(5));
        assert!(settings.deny_list().is_empty());
        assert_eq!(settings.api_base, DEFAULT_API_BASE);
        assert_eq!(settings.final_date, NaiveDate::from_ymd_opt(2022, 6, 1).unwrap());
    }

    #[test]
    fn test_invalid_toml_is_config_error() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "backoff_secs = \"soon\"").unwrap();
        assert!(matches!(Settings::load(file.path()), Err(CoreError::ConfigError(_))));
    }

    #[test]
    fn test_missing_file_falls_back() {
        let settings = Settings::load_or_default(Path::new("/nonexistent/runweb.toml")).unwrap();
        assert_eq!(settings, Settings::default());
    }

    #[test]
    fn test_parse_date() {
        assert!(Settings::parse_date("2023-01-01").is_ok());
        assert!(matches!(Settings::parse_date("01/01/2023"), Err(CoreError::InvalidDate(_))));
    }
}
