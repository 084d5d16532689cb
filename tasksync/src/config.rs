use std::path::{Path, PathBuf};
use std::time::Duration;

use thiserror::Error;
use url::Url;

use crate::storage::SessionFile;

const DEFAULT_POLL_SECS: u64 = 5;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{0} is not set")]
    Missing(&'static str),
    #[error("{name} is not a valid url: {source}")]
    InvalidUrl {
        name: &'static str,
        #[source]
        source: url::ParseError,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub url: Url,
    pub anon_key: String,
    pub poll_interval: Duration,
    /// `None` keeps the session in memory only.
    pub session_file: Option<PathBuf>,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let raw_url = required(&lookup, "TASKSYNC_URL")?;
        let url = Url::parse(&raw_url).map_err(|source| ConfigError::InvalidUrl {
            name: "TASKSYNC_URL",
            source,
        })?;
        let anon_key = required(&lookup, "TASKSYNC_ANON_KEY")?;
        let poll_interval = Duration::from_secs(read_u64(
            lookup("TASKSYNC_POLL_SECS"),
            DEFAULT_POLL_SECS,
        ));
        let session_file = read_bool(lookup("TASKSYNC_PERSIST_SESSION"), true).then(|| {
            match (lookup("TASKSYNC_SESSION_FILE"), dirs::home_dir()) {
                (Some(value), Some(home)) => expand_with_home(&value, &home),
                (Some(value), None) => PathBuf::from(value),
                (None, _) => SessionFile::default_path(),
            }
        });

        Ok(Self {
            url,
            anon_key,
            poll_interval,
            session_file,
        })
    }
}

fn required<F>(lookup: &F, name: &'static str) -> Result<String, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    lookup(name)
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
        .ok_or(ConfigError::Missing(name))
}

pub(crate) fn expand_with_home(value: &str, home: &Path) -> PathBuf {
    if value == "~" {
        return home.to_path_buf();
    }
    if let Some(rest) = value.strip_prefix("~/") {
        return home.join(rest);
    }
    PathBuf::from(value)
}

fn read_u64(value: Option<String>, default: u64) -> u64 {
    value
        .and_then(|value| value.trim().parse::<u64>().ok())
        .filter(|value| *value > 0)
        .unwrap_or(default)
}

fn read_bool(value: Option<String>, default: bool) -> bool {
    value
        .map(|value| {
            matches!(
                value.trim().to_ascii_lowercase().as_str(),
                "1" | "true" | "yes" | "on"
            )
        })
        .unwrap_or(default)
}
