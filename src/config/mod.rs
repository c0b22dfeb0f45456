//! Server configuration.
//!
//! [`ServerConfig`] is built once by the binary and shared read-only by every
//! request. It is serializable because the isolated runner ships it to each
//! worker process, which rebuilds its state from it cold.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::resources::{self, DiscoveryError, Resources};

/// Default environment file, relative to the project directory.
pub const DEFAULT_ENV_FILE: &str = ".env";

/// Errors raised while assembling a [`ServerConfig`].
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read environment file {path}: {source}")]
    EnvFile {
        path: PathBuf,
        #[source]
        source: dotenvy::Error,
    },

    #[error("project directory {0} does not exist")]
    MissingBaseDir(PathBuf),

    #[error(transparent)]
    Discovery(#[from] DiscoveryError),
}

/// Runtime configuration shared by the front end, the dispatcher and workers.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerConfig {
    /// Project root; program handlers run with this as working directory.
    pub base_dir: PathBuf,
    /// Public base URL, e.g. `http://localhost:3000`.
    pub url: String,
    /// Declared environment variables exposed to handlers.
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    /// Reload handlers on every request.
    #[serde(default)]
    pub live: bool,
    /// Log one line per request.
    #[serde(default)]
    pub logs: bool,
    /// Serve functions from a short-lived worker process.
    #[serde(default)]
    pub fork_process: bool,
    /// Keep runtime frames in error stacks shown to clients.
    #[serde(default)]
    pub full_stack_traces: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub handler_timeout_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub functions_dir: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assets_dir: Option<PathBuf>,
    /// The project's resources as last discovered.
    #[serde(default)]
    pub routes: Resources,
}

impl ServerConfig {
    /// A configuration for `base_dir` served at `url`, with nothing discovered yet.
    pub fn new(base_dir: impl Into<PathBuf>, url: impl Into<String>) -> Self {
        Self {
            base_dir: base_dir.into(),
            url: url.into(),
            ..Self::default()
        }
    }

    /// The host part of [`url`](Self::url), i.e. the URL without its scheme.
    ///
    /// ```
    /// use twilio_run::config::ServerConfig;
    ///
    /// let config = ServerConfig::new("/project", "https://example.ngrok.io");
    /// assert_eq!(config.domain_name(), "example.ngrok.io");
    /// ```
    pub fn domain_name(&self) -> &str {
        self.url
            .strip_prefix("https://")
            .or_else(|| self.url.strip_prefix("http://"))
            .unwrap_or(&self.url)
    }

    /// Re-scans the project directory into [`routes`](Self::routes).
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::MissingBaseDir`] or a discovery error.
    pub fn discover_routes(&mut self) -> Result<(), ConfigError> {
        if !self.base_dir.is_dir() {
            return Err(ConfigError::MissingBaseDir(self.base_dir.clone()));
        }
        self.routes = resources::discover(
            &self.base_dir,
            self.functions_dir.as_deref(),
            self.assets_dir.as_deref(),
        )?;
        Ok(())
    }

    /// Replaces [`env`](Self::env) with the contents of `path`, if it exists.
    ///
    /// A missing file leaves an empty environment.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::EnvFile`] if the file exists but cannot be parsed.
    pub fn load_env_file(&mut self, path: &Path) -> Result<(), ConfigError> {
        self.env = load_env(path)?;
        Ok(())
    }
}

/// Reads a `.env` file into a map without touching the process environment.
///
/// # Errors
///
/// Returns [`ConfigError::EnvFile`] on unreadable or malformed files.
pub fn load_env(path: &Path) -> Result<BTreeMap<String, String>, ConfigError> {
    if !path.is_file() {
        debug!(path = %path.display(), "no environment file");
        return Ok(BTreeMap::new());
    }

    let to_config_error = |source| ConfigError::EnvFile {
        path: path.to_path_buf(),
        source,
    };
    let mut env = BTreeMap::new();
    for item in dotenvy::from_path_iter(path).map_err(to_config_error)? {
        let (key, value) = item.map_err(to_config_error)?;
        env.insert(key, value);
    }
    debug!(path = %path.display(), variables = env.len(), "loaded environment file");
    Ok(env)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn domain_name_strips_scheme_only() {
        assert_eq!(ServerConfig::new("/", "http://localhost:3000").domain_name(), "localhost:3000");
        assert_eq!(ServerConfig::new("/", "localhost:3000").domain_name(), "localhost:3000");
    }

    #[test]
    fn env_file_is_parsed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(".env");
        fs::write(&path, "ACCOUNT_SID=AC123\n# comment\nGREETING=\"hello world\"\n").unwrap();

        let env = load_env(&path).unwrap();
        assert_eq!(env["ACCOUNT_SID"], "AC123");
        assert_eq!(env["GREETING"], "hello world");
        assert_eq!(env.len(), 2);
    }

    #[test]
    fn missing_env_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        assert!(load_env(&dir.path().join(".env")).unwrap().is_empty());
    }

    #[test]
    fn discover_routes_requires_base_dir() {
        let mut config = ServerConfig::new("/definitely/not/here", "http://localhost:3000");
        assert!(matches!(config.discover_routes(), Err(ConfigError::MissingBaseDir(_))));
    }

    #[test]
    fn config_round_trips_through_json_in_camel_case() {
        let mut config = ServerConfig::new("/project", "http://localhost:3000");
        config.fork_process = true;
        config.handler_timeout_ms = Some(500);
        let value = serde_json::to_value(&config).unwrap();
        assert_eq!(value["forkProcess"], true);
        assert_eq!(value["handlerTimeoutMs"], 500);
        let back: ServerConfig = serde_json::from_value(value).unwrap();
        assert_eq!(back, config);
    }
}
