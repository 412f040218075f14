use std::path::{Path, PathBuf};

pub const REMOTE_URL_ENV: &str = "SOCIAL_HUB_REMOTE_URL";
pub const REMOTE_TOKEN_ENV: &str = "SOCIAL_HUB_REMOTE_TOKEN";
pub const BOOTSTRAP_PASSWORD_ENV: &str = "SOCIAL_HUB_BOOTSTRAP_PASSWORD";

const DEFAULT_BOOTSTRAP_PASSWORD: &str = "changeme";

/// Startup configuration. Runtime-tunable knobs live in `HubSettings` instead.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HubConfig {
    pub data_dir: PathBuf,
    pub remote_url: Option<String>,
    pub remote_token: Option<String>,
    pub bootstrap_password: String,
}

impl HubConfig {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            remote_url: None,
            remote_token: None,
            bootstrap_password: DEFAULT_BOOTSTRAP_PASSWORD.to_string(),
        }
    }

    pub fn from_env(data_dir: impl Into<PathBuf>) -> Self {
        Self::from_lookup(data_dir, |key| std::env::var(key).ok())
    }

    pub fn from_lookup(data_dir: impl Into<PathBuf>, lookup: impl Fn(&str) -> Option<String>) -> Self {
        let non_empty = |key: &str| lookup(key).map(|value| value.trim().to_string()).filter(|value| !value.is_empty());
        let mut config = Self::new(data_dir);
        config.remote_url = non_empty(REMOTE_URL_ENV);
        config.remote_token = non_empty(REMOTE_TOKEN_ENV);
        if let Some(password) = non_empty(BOOTSTRAP_PASSWORD_ENV) {
            config.bootstrap_password = password;
        }
        config
    }

    pub fn database_path(&self) -> PathBuf {
        self.data_dir.join("state.sqlite")
    }

    pub fn log_dir(&self) -> PathBuf {
        log_dir(&self.data_dir)
    }
}

pub fn log_dir(data_dir: &Path) -> PathBuf {
    data_dir.join("logs")
}
