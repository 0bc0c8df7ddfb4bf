//! Environment profiles.
//!
//! ```json
//! {
//!   "environments": {
//!     "dev":  { "url": "dev.example.cloud", "token_env": "TMLSYNC_DEV_TOKEN" },
//!     "prod": { "url": "https://prod.example.cloud", "token_env": "TMLSYNC_PROD_TOKEN",
//!               "org": "finance", "platform_version": "9.5.0", "timeout_secs": 120 }
//!   }
//! }
//! ```

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;
use tmlsync_content::PlatformVersion;

pub const CONFIG_ENV: &str = "TMLSYNC_CONFIG";
pub const DEFAULT_CONFIG_FILE: &str = "tmlsync.json";
const DEFAULT_TIMEOUT_SECS: u64 = 60;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config `{}`: {source}", .path.display())]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("config `{}` is malformed: {source}", .path.display())]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },

    #[error("no environment named `{name}` in `{}`", .path.display())]
    UnknownEnvironment { name: String, path: PathBuf },

    #[error("environment `{name}` has no token; set `token` or `token_env`")]
    MissingToken { name: String },

    #[error("environment `{name}` has an unparseable platform_version `{value}`")]
    InvalidVersion { name: String, value: String },
}

#[derive(Debug, Clone, Deserialize)]
pub struct Profile {
    pub url: String,
    #[serde(default)]
    pub token: Option<String>,
    /// Name of an environment variable holding the token. Wins over `token`.
    #[serde(default)]
    pub token_env: Option<String>,
    #[serde(default)]
    pub org: Option<String>,
    #[serde(default)]
    pub platform_version: Option<String>,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub environments: BTreeMap<String, Profile>,
    #[serde(skip)]
    path: PathBuf,
}

/// A profile with its token resolved, ready to build a client from.
#[derive(Debug, Clone)]
pub struct Environment {
    pub name: String,
    pub base_url: String,
    pub token: String,
    pub org: Option<String>,
    pub platform_version: Option<PlatformVersion>,
    pub timeout: Duration,
}

impl Config {
    /// `--config`, else `$TMLSYNC_CONFIG`, else `./tmlsync.json`.
    pub fn locate(explicit: Option<&Path>) -> PathBuf {
        explicit
            .map(Path::to_path_buf)
            .or_else(|| std::env::var_os(CONFIG_ENV).map(PathBuf::from))
            .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_FILE))
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(&text, path)
    }

    /// Like `load`, but a missing file yields an empty config.
    pub fn load_optional(path: &Path) -> Result<Self, ConfigError> {
        match std::fs::read_to_string(path) {
            Ok(text) => Self::parse(&text, path),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(Config {
                path: path.to_path_buf(),
                ..Config::default()
            }),
            Err(source) => Err(ConfigError::Read {
                path: path.to_path_buf(),
                source,
            }),
        }
    }

    pub fn parse(text: &str, path: &Path) -> Result<Self, ConfigError> {
        let mut config: Config = serde_json::from_str(text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        config.path = path.to_path_buf();
        Ok(config)
    }

    pub fn has(&self, name: &str) -> bool {
        self.environments.contains_key(name)
    }

    pub fn environment(&self, name: &str) -> Result<Environment, ConfigError> {
        self.environment_with(name, |var| std::env::var(var).ok())
    }

    fn environment_with(
        &self,
        name: &str,
        read_env: impl Fn(&str) -> Option<String>,
    ) -> Result<Environment, ConfigError> {
        let profile = self
            .environments
            .get(name)
            .ok_or_else(|| ConfigError::UnknownEnvironment {
                name: name.to_string(),
                path: self.path.clone(),
            })?;

        let from_env = profile.token_env.as_deref().and_then(|var| read_env(var));
        let token = from_env
            .or_else(|| profile.token.clone())
            .filter(|t| !t.trim().is_empty())
            .ok_or_else(|| ConfigError::MissingToken {
                name: name.to_string(),
            })?;

        let platform_version = profile
            .platform_version
            .as_deref()
            .map(|v| {
                v.parse::<PlatformVersion>()
                    .map_err(|_| ConfigError::InvalidVersion {
                        name: name.to_string(),
                        value: v.to_string(),
                    })
            })
            .transpose()?;

        Ok(Environment {
            name: name.to_string(),
            base_url: normalize_http_base_url(&profile.url),
            token,
            org: profile.org.clone(),
            platform_version,
            timeout: Duration::from_secs(profile.timeout_secs.unwrap_or(DEFAULT_TIMEOUT_SECS)),
        })
    }
}

pub fn normalize_http_base_url(base_url: &str) -> String {
    let mut host = base_url.trim().to_string();
    if !host.starts_with("http://") && !host.starts_with("https://") {
        host = format!("https://{host}");
    }
    host.trim_end_matches('/').to_string()
}
